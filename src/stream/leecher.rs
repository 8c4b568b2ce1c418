//! Stream leecher: session lifecycle, peer selection, and progress
//! watchdogs for downloading the current epoch's events.
//!
//! The leecher runs one session at a time against one peer. Peers ahead of
//! us are preferred (they have what we miss); every fifth retry falls back
//! to same-epoch peers so a partitioned node still converges. Watchdog
//! deadlines widen with the retry count, giving slow-but-alive peers a
//! growing grace period.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants;
use crate::event::{Epoch, EventId};

use super::{Metric, Request, RequestKind, Session, SessionId};

/// Leecher tuning.
#[derive(Clone, Debug)]
pub struct LeecherConfig {
    pub recheck_interval: Duration,
    /// Base deadline without a received chunk before the session dies.
    pub base_progress_watchdog: Duration,
    /// Base deadline for the whole session.
    pub base_session_watchdog: Duration,
    /// Minimum pause between sessions (except the very first).
    pub min_session_restart: Duration,
    /// After this long idle, a session starts even with no future peers.
    pub max_session_restart: Duration,
    pub chunk_limit: Metric,
    pub max_chunks_in_flight: u32,
}

impl Default for LeecherConfig {
    fn default() -> Self {
        LeecherConfig {
            recheck_interval: Duration::from_secs(1),
            base_progress_watchdog: Duration::from_secs(5),
            base_session_watchdog: Duration::from_secs(30),
            min_session_restart: Duration::from_secs(5),
            max_session_restart: Duration::from_secs(60),
            chunk_limit: Metric {
                num: constants::CHUNK_NUM_LIMIT,
                size: constants::CHUNK_SIZE_LIMIT,
            },
            max_chunks_in_flight: 4,
        }
    }
}

/// How the leecher reaches the rest of the node.
#[derive(Clone)]
pub struct LeecherCallbacks {
    /// Send a chunk request to a peer. An error terminates the session.
    pub request_chunk: Arc<dyn Fn(&str, Request) -> Result<(), ()> + Send + Sync>,
    /// Momentarily hold off requesting from this peer (e.g. backpressure).
    pub suspend: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    /// The peer's announced epoch.
    pub peer_epoch: Arc<dyn Fn(&str) -> Epoch + Send + Sync>,
}

#[derive(Clone, Debug)]
struct SessionState {
    active: bool,
    id: SessionId,
    peer: String,
    start_time: Instant,
    end_time: Instant,
    last_received: Instant,
    try_count: u32,
    in_flight: u32,
    kind: RequestKind,
}

impl SessionState {
    fn idle(now: Instant) -> Self {
        SessionState {
            active: false,
            id: 0,
            peer: String::new(),
            start_time: now,
            end_time: now,
            last_received: now,
            try_count: 0,
            in_flight: 0,
            kind: RequestKind::Ids,
        }
    }
}

struct LeecherState {
    epoch: Epoch,
    empty_state: bool,
    peers: HashSet<String>,
    session: SessionState,
    terminated: bool,
}

/// The leecher half of the streaming sync.
pub struct Leecher {
    config: LeecherConfig,
    callbacks: LeecherCallbacks,
    state: Arc<Mutex<LeecherState>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Leecher {
    pub fn new(epoch: Epoch, empty_state: bool, config: LeecherConfig, callbacks: LeecherCallbacks) -> Self {
        let now = Instant::now();
        Leecher {
            config,
            callbacks,
            state: Arc::new(Mutex::new(LeecherState {
                epoch,
                empty_state,
                peers: HashSet::new(),
                session: SessionState::idle(now),
                terminated: false,
            })),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the periodic planner. Must be called inside a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let leecher = self.clone();
        let cancel = self.cancel.clone();
        let interval = self.config.recheck_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => leecher.routine(),
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    /// Interrupt the leecher and wait for the planner to finish.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.terminated = true;
            Self::terminate_session(&mut state);
        }
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One planner pass: enforce watchdogs, then start a session if idle.
    /// Runs from the tick loop; exposed so state changes (new peer, new
    /// epoch) can replan immediately.
    pub fn poke(&self) {
        self.routine();
    }

    fn routine(&self) {
        let mut state = self.state.lock();
        if state.terminated {
            return;
        }
        if state.session.active && self.should_terminate_session(&state.session) {
            Self::terminate_session(&mut state);
        }
        if !state.session.active {
            let candidates = self.select_session_peer_candidates(&state);
            if !candidates.is_empty() {
                self.start_session(&mut state, candidates);
            }
        }
    }

    fn should_terminate_session(&self, session: &SessionState) -> bool {
        let scale = session.try_count + 5;
        let no_progress =
            session.last_received.elapsed() >= self.config.base_progress_watchdog * scale / 5;
        let stuck = session.start_time.elapsed() >= self.config.base_session_watchdog * scale / 5;
        no_progress || stuck
    }

    fn terminate_session(state: &mut LeecherState) {
        if state.session.active {
            state.session.active = false;
            state.session.in_flight = 0;
            state.session.end_time = Instant::now();
        }
    }

    fn select_session_peer_candidates(&self, state: &LeecherState) -> Vec<String> {
        let mut current_epoch_peers = Vec::with_capacity(state.peers.len());
        let mut future_epoch_peers = Vec::with_capacity(state.peers.len());
        for peer in &state.peers {
            let peer_epoch = (self.callbacks.peer_epoch)(peer);
            if peer_epoch == state.epoch {
                current_epoch_peers.push(peer.clone());
            }
            if peer_epoch > state.epoch {
                future_epoch_peers.push(peer.clone());
            }
        }
        let since_end = state.session.end_time.elapsed();
        let wait_ok = state.session.try_count == 0 || since_end > self.config.min_session_restart;
        let have_work =
            !future_epoch_peers.is_empty() || since_end >= self.config.max_session_restart;
        if !(wait_ok && have_work) {
            return Vec::new();
        }
        if !future_epoch_peers.is_empty()
            && (state.session.try_count % 5 != 4 || current_epoch_peers.is_empty())
        {
            // normally work only with peers that are ahead of us
            future_epoch_peers
        } else {
            // every fifth try, fall back to same-epoch peers
            current_epoch_peers
        }
    }

    fn session_id(epoch: Epoch, try_count: u32) -> SessionId {
        (epoch << 12) ^ try_count
    }

    fn start_session(&self, state: &mut LeecherState, candidates: Vec<String>) {
        let peer = candidates[rand::thread_rng().gen_range(0..candidates.len())].clone();

        // the first attempt against a peer that is ahead, on an empty
        // state, downloads full events; everything else downloads ids
        let kind = if (self.callbacks.peer_epoch)(&peer) > state.epoch
            && state.empty_state
            && state.session.try_count == 0
        {
            RequestKind::Events
        } else {
            RequestKind::Ids
        };

        let now = Instant::now();
        state.session.active = true;
        state.session.id = Self::session_id(state.epoch, state.session.try_count);
        state.session.peer = peer;
        state.session.kind = kind;
        state.session.start_time = now;
        state.session.last_received = now;
        state.session.end_time = now;
        state.session.in_flight = 0;

        tracing::debug!(
            epoch = state.epoch,
            attempt = state.session.try_count,
            peer = %state.session.peer,
            "Starting stream session"
        );
        self.request_more(state);
        state.session.try_count += 1;
    }

    /// Keep up to `max_chunks_in_flight` outstanding requests; the seeder
    /// advances its cursor once per request, so identical requests fetch
    /// consecutive chunks.
    fn request_more(&self, state: &mut LeecherState) {
        if !state.session.active || (self.callbacks.suspend)(&state.session.peer) {
            return;
        }
        let request = Request {
            session: Session {
                id: state.session.id,
                start: state.epoch.to_be_bytes().to_vec(),
                stop: (state.epoch + 1).to_be_bytes().to_vec(),
            },
            limit: self.config.chunk_limit,
            kind: state.session.kind,
        };
        while state.session.in_flight < self.config.max_chunks_in_flight {
            if (self.callbacks.request_chunk)(&state.session.peer, request.clone()).is_err() {
                Self::terminate_session(state);
                return;
            }
            state.session.in_flight += 1;
        }
    }

    /// Feed back a chunk the node received for `session_id`. `done` means
    /// the seeder exhausted the session's range.
    pub fn notify_chunk_received(
        &self,
        session_id: SessionId,
        _last: EventId,
        done: bool,
    ) {
        let mut state = self.state.lock();
        if !state.session.active || state.session.id != session_id {
            return;
        }
        state.session.last_received = Instant::now();
        state.session.in_flight = state.session.in_flight.saturating_sub(1);
        if done {
            Self::terminate_session(&mut state);
        } else {
            self.request_more(&mut state);
        }
    }

    /// Inject a new download peer.
    pub fn register_peer(&self, peer: String) {
        let mut state = self.state.lock();
        if state.terminated {
            return;
        }
        state.peers.insert(peer);
    }

    /// Remove a peer; if it served the active session, terminate and
    /// replan immediately.
    pub fn unregister_peer(&self, peer: &str) {
        {
            let mut state = self.state.lock();
            if state.session.active && state.session.peer == peer {
                Self::terminate_session(&mut state);
            }
            state.peers.remove(peer);
        }
        self.routine();
    }

    /// The node moved to a new epoch: abandon the old session and start
    /// fresh.
    pub fn on_new_epoch(&self, epoch: Epoch) {
        {
            let mut state = self.state.lock();
            if state.terminated {
                return;
            }
            Self::terminate_session(&mut state);
            state.epoch = epoch;
            state.session.try_count = 0;
            state.empty_state = true;
        }
        self.routine();
    }

    pub fn peers_num(&self) -> usize {
        self.state.lock().peers.len()
    }

    pub fn current_epoch(&self) -> Epoch {
        self.state.lock().epoch
    }
}
