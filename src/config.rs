//! Network rules and node configuration.
//!
//! `Rules` describes the consensus-level constants of a network: DAG shape
//! limits, block limits, and the gas-power economy. Presets exist for
//! mainnet, testnet, and fakenet (local development with inflated
//! allocation rates). Rules are part of consensus: two nodes with
//! different rules will reject each other's events.

use serde::{Deserialize, Serialize};

use crate::constants;

/// Network identifiers.
pub const MAIN_NETWORK_ID: u64 = 0xa91;
pub const TEST_NETWORK_ID: u64 = 0xa92;
pub const FAKE_NETWORK_ID: u64 = 0xa93;

/// Nanosecond timestamp type used for creation and median times.
pub type Timestamp = u64;

/// Consensus rules of a network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rules {
    pub name: String,
    pub network_id: u64,
    pub dag: DagRules,
    pub blocks: BlockRules,
    pub economy: EconomyRules,
}

/// DAG shape limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagRules {
    /// Maximum number of parent references per event.
    pub max_parents: usize,
    /// Number of parents that carry no gas surcharge.
    pub max_free_parents: usize,
    /// Maximum extra-data bytes per event.
    pub max_extra_data: usize,
    /// Blocks per epoch before sealing.
    pub max_epoch_blocks: u64,
    /// Wall-clock epoch duration limit in nanoseconds.
    pub max_epoch_duration: Timestamp,
}

/// Block-level limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRules {
    /// Technical hard limit; gas is mostly governed by gas-power allocation.
    pub block_gas_hard_limit: u64,
}

/// Gas-power allocation rules for one window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasPowerRules {
    /// Base allocation per second of elapsed time.
    pub alloc_per_sec: u64,
    /// Upper clamp when scaling by validator participation.
    pub max_alloc_per_sec: u64,
    /// Lower clamp when scaling by validator participation.
    pub min_alloc_per_sec: u64,
    /// Elapsed time beyond this accrues no further allocation (ns).
    pub max_alloc_period: Timestamp,
    /// Allocation period granted to a validator's first event in an epoch (ns).
    pub startup_alloc_period: Timestamp,
    /// Floor for a validator's first-event allocation.
    pub min_startup_gas: u64,
}

/// Economy rules: the two gas-power windows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EconomyRules {
    pub short_gas_power: GasPowerRules,
    pub long_gas_power: GasPowerRules,
}

impl Rules {
    /// Mainnet rules.
    pub fn mainnet() -> Self {
        Rules {
            name: "main".into(),
            network_id: MAIN_NETWORK_ID,
            dag: DagRules::default_rules(),
            blocks: BlockRules {
                block_gas_hard_limit: 20_000_000,
            },
            economy: EconomyRules::default_rules(),
        }
    }

    /// Testnet rules.
    pub fn testnet() -> Self {
        let mut rules = Self::mainnet();
        rules.name = "test".into();
        rules.network_id = TEST_NETWORK_ID;
        rules
    }

    /// Fakenet rules for local development: short epochs, inflated gas
    /// allocation so a single machine can drive the network.
    pub fn fakenet() -> Self {
        let mut rules = Self::mainnet();
        rules.name = "fake".into();
        rules.network_id = FAKE_NETWORK_ID;
        rules.dag.max_epoch_blocks = 200;
        rules.dag.max_epoch_duration = 10 * 60 * 1_000_000_000;
        rules.economy.short_gas_power.alloc_per_sec *= 1000;
        rules.economy.short_gas_power.max_alloc_per_sec *= 1000;
        rules.economy.long_gas_power.alloc_per_sec *= 1000;
        rules.economy.long_gas_power.max_alloc_per_sec *= 1000;
        rules
    }

    /// Validate internal consistency. Used by the `checkconfig` subcommand.
    pub fn validate(&self) -> Result<(), RulesError> {
        if self.name.is_empty() {
            return Err(RulesError::EmptyName);
        }
        if self.dag.max_parents == 0 || self.dag.max_parents > constants::MAX_PARENTS {
            return Err(RulesError::BadParentLimit(self.dag.max_parents));
        }
        if self.dag.max_free_parents > self.dag.max_parents {
            return Err(RulesError::BadParentLimit(self.dag.max_free_parents));
        }
        if self.dag.max_epoch_blocks == 0 {
            return Err(RulesError::EmptyEpoch);
        }
        for (window, gp) in [
            ("short", &self.economy.short_gas_power),
            ("long", &self.economy.long_gas_power),
        ] {
            if gp.alloc_per_sec == 0
                || gp.min_alloc_per_sec > gp.alloc_per_sec
                || gp.alloc_per_sec > gp.max_alloc_per_sec
            {
                return Err(RulesError::BadGasWindow(window));
            }
            if gp.max_alloc_period == 0 {
                return Err(RulesError::BadGasWindow(window));
            }
        }
        Ok(())
    }
}

impl DagRules {
    fn default_rules() -> Self {
        DagRules {
            max_parents: constants::MAX_PARENTS,
            max_free_parents: constants::MAX_FREE_PARENTS,
            max_extra_data: constants::MAX_EXTRA_DATA,
            max_epoch_blocks: 1000,
            max_epoch_duration: 4 * 3600 * 1_000_000_000,
        }
    }
}

impl EconomyRules {
    fn default_rules() -> Self {
        EconomyRules {
            short_gas_power: GasPowerRules::short_window(),
            long_gas_power: GasPowerRules::long_window(),
        }
    }
}

impl GasPowerRules {
    /// Long-window allocation: slow refill, large accumulation cap.
    pub fn long_window() -> Self {
        GasPowerRules {
            alloc_per_sec: 100 * constants::EVENT_GAS,
            max_alloc_per_sec: 1000 * constants::EVENT_GAS,
            min_alloc_per_sec: 10 * constants::EVENT_GAS,
            max_alloc_period: 60 * 60 * 1_000_000_000,
            startup_alloc_period: 5 * 1_000_000_000,
            min_startup_gas: 20 * constants::EVENT_GAS,
        }
    }

    /// Short-window allocation: 5x faster refill, 1/60th the accumulation cap.
    pub fn short_window() -> Self {
        let mut cfg = Self::long_window();
        cfg.alloc_per_sec *= 5;
        cfg.max_alloc_per_sec *= 5;
        cfg.min_alloc_per_sec *= 5;
        cfg.startup_alloc_period /= 5;
        cfg.max_alloc_period /= 5 * 12;
        cfg
    }
}

/// Rules validation failures.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RulesError {
    #[error("network name is empty")]
    EmptyName,
    #[error("parent limit out of range: {0}")]
    BadParentLimit(usize),
    #[error("max_epoch_blocks must be nonzero")]
    EmptyEpoch,
    #[error("inconsistent {0}-window gas power rules")]
    BadGasWindow(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_validate() {
        Rules::mainnet().validate().unwrap();
        Rules::testnet().validate().unwrap();
        Rules::fakenet().validate().unwrap();
    }

    #[test]
    fn short_window_is_tighter() {
        let economy = EconomyRules::default_rules();
        assert!(
            economy.short_gas_power.max_alloc_period < economy.long_gas_power.max_alloc_period
        );
        assert!(economy.short_gas_power.alloc_per_sec > economy.long_gas_power.alloc_per_sec);
    }

    #[test]
    fn bad_rules_rejected() {
        let mut rules = Rules::mainnet();
        rules.dag.max_parents = 0;
        assert!(rules.validate().is_err());

        let mut rules = Rules::mainnet();
        rules.economy.short_gas_power.alloc_per_sec = 0;
        assert!(matches!(
            rules.validate(),
            Err(RulesError::BadGasWindow("short"))
        ));
    }
}
