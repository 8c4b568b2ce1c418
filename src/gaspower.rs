//! Dual-window gas-power accounting.
//!
//! Each validator accrues "gas power" over time in two independent windows
//! (short and long) and spends it with every event it emits. The short
//! window refills fast but caps low, throttling bursts; the long window
//! refills slowly but accumulates high, bounding sustained output. An event
//! is valid only if its claimed `gas_power_used`/`gas_power_left` match
//! what the deterministic state machine derives; every node re-derives the
//! same numbers from the same DAG.

use crate::config::{EconomyRules, GasPowerRules, Rules, Timestamp};
use crate::constants;
use crate::event::{
    Epoch, Event, GasPowerLeft, EventPayload, GAS_POWER_WINDOWS, LONG_TERM_GAS, SHORT_TERM_GAS,
};
use crate::validators::ValidatorSet;

/// Gas-power validation failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GasPowerError {
    /// Builder-side: the event would spend more than the tighter window
    /// allows. Don't emit yet.
    #[error("not enough gas power")]
    NotEnoughGasPower,
    /// Verifier-side: claimed used/left numbers disagree with the derived
    /// availability.
    #[error("wrong gas power in {0}-term window")]
    WrongGasPower(&'static str),
    /// The context is for a different epoch than the event.
    #[error("gas power context is for epoch {ctx}, event is in {event}")]
    EpochMismatch { ctx: Epoch, event: Epoch },
}

/// Window parameters derived from [`GasPowerRules`].
#[derive(Clone, Copy, Debug)]
pub struct WindowConfig {
    pub alloc_per_sec: u64,
    pub max_alloc_per_sec: u64,
    pub min_alloc_per_sec: u64,
    pub max_alloc_period: Timestamp,
    pub startup_alloc_period: Timestamp,
    pub min_startup_gas: u64,
}

impl From<&GasPowerRules> for WindowConfig {
    fn from(rules: &GasPowerRules) -> Self {
        WindowConfig {
            alloc_per_sec: rules.alloc_per_sec,
            max_alloc_per_sec: rules.max_alloc_per_sec,
            min_alloc_per_sec: rules.min_alloc_per_sec,
            max_alloc_period: rules.max_alloc_period,
            startup_alloc_period: rules.startup_alloc_period,
            min_startup_gas: rules.min_startup_gas,
        }
    }
}

/// What the checker needs to know about a validator's previous-epoch event.
#[derive(Clone, Copy, Debug)]
pub struct PrevEventRef {
    pub creation_time: Timestamp,
    pub gas_power_left: GasPowerLeft,
}

/// Per-validator carry-over state at the start of an epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct ValidatorGasState {
    /// The validator's last event of the previous epoch, if any.
    pub prev_epoch_event: Option<PrevEventRef>,
    /// Gas refunded at the epoch seal, granted with the first event.
    pub gas_refund: u64,
}

/// Immutable validation context of one epoch. Swapped wholesale on epoch
/// transition through an atomic slot (see the checkers module).
#[derive(Clone, Debug)]
pub struct GasPowerContext {
    pub epoch: Epoch,
    pub validators: ValidatorSet,
    pub epoch_start: Timestamp,
    /// Indexed by dense validator idx.
    pub states: Vec<ValidatorGasState>,
    pub configs: [WindowConfig; GAS_POWER_WINDOWS],
}

impl GasPowerContext {
    pub fn new(
        epoch: Epoch,
        validators: ValidatorSet,
        epoch_start: Timestamp,
        states: Vec<ValidatorGasState>,
        economy: &EconomyRules,
    ) -> Self {
        GasPowerContext {
            epoch,
            validators,
            epoch_start,
            states,
            configs: [
                WindowConfig::from(&economy.short_gas_power),
                WindowConfig::from(&economy.long_gas_power),
            ],
        }
    }

    /// Availability of both windows for `event`, as of its creation time.
    ///
    /// `self_parent` must be the resolved first parent when the event has
    /// `seq > 1`; its `gas_power_left` is the carry-in.
    pub fn calc_gas_power(
        &self,
        event: &Event,
        self_parent: Option<&Event>,
    ) -> Result<GasPowerLeft, GasPowerError> {
        if self.epoch != event.epoch() {
            return Err(GasPowerError::EpochMismatch {
                ctx: self.epoch,
                event: event.epoch(),
            });
        }
        Ok(GasPowerLeft([
            self.calc_window(SHORT_TERM_GAS, event, self_parent),
            self.calc_window(LONG_TERM_GAS, event, self_parent),
        ]))
    }

    fn calc_window(&self, window: usize, event: &Event, self_parent: Option<&Event>) -> u64 {
        let config = &self.configs[window];
        let rate = self.validator_rate(config, event);
        let cap = mul_period(config.max_alloc_period, rate);
        let startup_floor =
            mul_period(config.startup_alloc_period, rate).max(config.min_startup_gas);

        let (prev_time, prev_left, refund, first_in_epoch) = match self_parent {
            Some(parent) => (
                parent.creation_time(),
                parent.gas_power_left().0[window],
                0,
                false,
            ),
            None => {
                let state = self
                    .validators
                    .idx_of(event.creator())
                    .and_then(|idx| self.states.get(idx as usize))
                    .copied()
                    .unwrap_or_default();
                match state.prev_epoch_event {
                    Some(prev) => (
                        prev.creation_time,
                        prev.gas_power_left.0[window],
                        state.gas_refund,
                        true,
                    ),
                    // no history at all: pure startup allocation
                    None => return startup_floor,
                }
            }
        };

        let elapsed = event
            .creation_time()
            .saturating_sub(prev_time)
            .min(config.max_alloc_period);
        let alloc = mul_period(elapsed, rate);

        let mut new_left = prev_left.saturating_add(alloc).saturating_add(refund);
        new_left = new_left.min(cap);
        if first_in_epoch {
            new_left = new_left.max(startup_floor);
        }
        new_left
    }

    /// Per-validator allocation rate: the network-wide rate (clamped to the
    /// configured band) split proportionally to stake.
    fn validator_rate(&self, config: &WindowConfig, event: &Event) -> u64 {
        let total_rate = config
            .alloc_per_sec
            .clamp(config.min_alloc_per_sec, config.max_alloc_per_sec);
        let total_weight = self.validators.total_weight();
        if total_weight == 0 {
            return 0;
        }
        let weight = self.validators.weight_of(event.creator()).unwrap_or(0);
        ((total_rate as u128 * weight as u128) / total_weight as u128) as u64
    }

    /// Verifier path: check the event's claimed gas-power numbers.
    pub fn validate(
        &self,
        event: &Event,
        self_parent: Option<&Event>,
    ) -> Result<(), GasPowerError> {
        let available = self.calc_gas_power(event, self_parent)?;
        if event.gas_power_used() > available.min() {
            return Err(GasPowerError::WrongGasPower("short"));
        }
        for (window, name) in [(SHORT_TERM_GAS, "short"), (LONG_TERM_GAS, "long")] {
            let expected = available.0[window] - event.gas_power_used();
            if event.gas_power_left().0[window] != expected {
                return Err(GasPowerError::WrongGasPower(name));
            }
        }
        Ok(())
    }
}

/// `period` (ns) × `rate` (gas/sec), in gas.
fn mul_period(period: Timestamp, rate: u64) -> u64 {
    ((period as u128 * rate as u128) / 1_000_000_000u128) as u64
}

/// Gas an event consumes by its own shape: a flat event charge, a charge
/// per parent beyond the free allowance, and a charge per payload byte,
/// plus the gas limits of the transactions it carries.
pub fn calc_gas_power_used(event: &EventPayload, rules: &Rules) -> u64 {
    let parent_surcharge = event
        .event()
        .parents()
        .len()
        .saturating_sub(rules.dag.max_free_parents) as u64
        * constants::PARENT_GAS;
    let byte_surcharge = event.size() as u64 * constants::EXTRA_DATA_GAS;
    let txs_gas: u64 = event.txs().iter().map(|tx| tx.gas_limit).sum();
    constants::EVENT_GAS + parent_surcharge + byte_surcharge + txs_gas
}
