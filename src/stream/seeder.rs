//! Stream seeder: serves bounded chunks of the event space to peers.
//!
//! One task owns all session state and drains the request channel; actual
//! sends are handed to a pool of sender tasks through a bounded channel;
//! when every sender is busy the session loop blocks, which throttles
//! peers instead of buffering unboundedly.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants;
use crate::event::EventId;
use crate::store::Store;

use super::{PeerError, Request, RequestKind, Response, SessionId};

/// Seeder tuning.
#[derive(Clone, Debug)]
pub struct SeederConfig {
    pub sender_threads: usize,
    pub max_sessions_per_peer: usize,
}

impl Default for SeederConfig {
    fn default() -> Self {
        SeederConfig {
            sender_threads: constants::SENDER_THREADS,
            max_sessions_per_peer: 2,
        }
    }
}

/// How the seeder talks back to one peer.
#[derive(Clone)]
pub struct Peer {
    pub id: String,
    /// Deliver a chunk. Errors are the transport's problem.
    pub send_chunk: Arc<dyn Fn(Response) + Send + Sync>,
    /// Report a protocol violation by this peer.
    pub misbehaviour: Arc<dyn Fn(PeerError) + Send + Sync>,
}

struct SessionState {
    orig_selector: Vec<u8>,
    next: Vec<u8>,
    stop: Vec<u8>,
    done: bool,
    send_chunk: Arc<dyn Fn(Response) + Send + Sync>,
}

struct RequestAndPeer {
    peer: Peer,
    request: Request,
}

/// The seeder half of the streaming sync.
pub struct Seeder {
    requests_tx: mpsc::Sender<RequestAndPeer>,
    unregister_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Seeder {
    /// Spawn the session loop and the sender pool. Must be called inside a
    /// tokio runtime.
    pub fn start(config: SeederConfig, store: Arc<Store>) -> Self {
        let cancel = CancellationToken::new();
        let (requests_tx, requests_rx) = mpsc::channel(16);
        let (unregister_tx, unregister_rx) = mpsc::channel(128);
        // bounded: capacity is the backpressure point
        let (send_tx, send_rx) = mpsc::channel::<(Arc<dyn Fn(Response) + Send + Sync>, Response)>(
            config.sender_threads * 2,
        );

        let mut tasks = Vec::with_capacity(config.sender_threads + 1);
        let shared_rx = Arc::new(tokio::sync::Mutex::new(send_rx));
        for _ in 0..config.sender_threads {
            let rx = shared_rx.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            job = rx.recv() => job,
                        }
                    };
                    match job {
                        Some((send_chunk, response)) => send_chunk(response),
                        None => return,
                    }
                }
            }));
        }

        let loop_cancel = cancel.clone();
        tasks.push(tokio::spawn(seeder_loop(
            config,
            store,
            requests_rx,
            unregister_rx,
            send_tx,
            loop_cancel,
        )));

        Seeder {
            requests_tx,
            unregister_tx,
            cancel,
            tasks,
        }
    }

    /// Hand a peer request to the session loop. Fails only once the seeder
    /// is terminated.
    pub async fn notify_request(&self, peer: Peer, request: Request) -> Result<(), Terminated> {
        self.requests_tx
            .send(RequestAndPeer { peer, request })
            .await
            .map_err(|_| Terminated)
    }

    /// Drop all sessions of a disconnected peer.
    pub async fn unregister_peer(&self, peer_id: String) -> Result<(), Terminated> {
        self.unregister_tx
            .send(peer_id)
            .await
            .map_err(|_| Terminated)
    }

    /// Interrupt the seeder and wait for all internal tasks to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        drop(self.requests_tx);
        drop(self.unregister_tx);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// The seeder has shut down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("terminated")]
pub struct Terminated;

async fn seeder_loop(
    config: SeederConfig,
    store: Arc<Store>,
    mut requests_rx: mpsc::Receiver<RequestAndPeer>,
    mut unregister_rx: mpsc::Receiver<String>,
    send_tx: mpsc::Sender<(Arc<dyn Fn(Response) + Send + Sync>, Response)>,
    cancel: CancellationToken,
) {
    let mut sessions: HashMap<(SessionId, String), SessionState> = HashMap::new();
    let mut peer_sessions: HashMap<String, Vec<SessionId>> = HashMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            peer_id = unregister_rx.recv() => {
                let Some(peer_id) = peer_id else { return };
                for sid in peer_sessions.remove(&peer_id).unwrap_or_default() {
                    sessions.remove(&(sid, peer_id.clone()));
                }
            }

            op = requests_rx.recv() => {
                let Some(op) = op else { return };
                if let Some(response) = handle_request(
                    &config,
                    &store,
                    &mut sessions,
                    &mut peer_sessions,
                    &op,
                ) {
                    let send_chunk = sessions
                        .get(&(op.request.session.id, op.peer.id.clone()))
                        .map(|s| s.send_chunk.clone())
                        .unwrap_or_else(|| op.peer.send_chunk.clone());
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = send_tx.send((send_chunk, response)) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

fn handle_request(
    config: &SeederConfig,
    store: &Store,
    sessions: &mut HashMap<(SessionId, String), SessionState>,
    peer_sessions: &mut HashMap<String, Vec<SessionId>>,
    op: &RequestAndPeer,
) -> Option<Response> {
    let request = &op.request;
    if request.session.start.len() > 32 || request.session.stop.len() > 32 {
        (op.peer.misbehaviour)(PeerError::WrongSelectorLen);
        return None;
    }

    let key = (request.session.id, op.peer.id.clone());
    if !sessions.contains_key(&key) {
        // a new session evicts the peer's oldest beyond the cap
        let ids = peer_sessions.entry(op.peer.id.clone()).or_default();
        if ids.len() >= config.max_sessions_per_peer {
            let oldest = ids.remove(0);
            sessions.remove(&(oldest, op.peer.id.clone()));
        }
        ids.push(request.session.id);
        sessions.insert(
            key.clone(),
            SessionState {
                orig_selector: request.session.start.clone(),
                next: request.session.start.clone(),
                stop: request.session.stop.clone(),
                done: false,
                send_chunk: op.peer.send_chunk.clone(),
            },
        );
    }
    let session = sessions.get_mut(&key).expect("session just ensured");

    // session parameters are pinned at creation
    if session.orig_selector != request.session.start {
        (op.peer.misbehaviour)(PeerError::SelectorMismatch);
        return None;
    }
    if session.done {
        return None;
    }

    let mut response = Response {
        session_id: request.session.id,
        ..Default::default()
    };
    let mut all_consumed = true;
    let mut size = 0u64;
    let mut last: Option<EventId> = None;
    let scan = store.for_each_event_from(&session.next, |id, encoded| {
        if !session.stop.is_empty() && id.as_bytes().as_slice() >= session.stop.as_slice() {
            return false;
        }
        let count = response.ids.len().max(response.events.len()) as u32;
        if size != 0 && (count >= request.limit.num || size >= request.limit.size) {
            all_consumed = false;
            return false;
        }
        match request.kind {
            RequestKind::Events => {
                response.events.push(encoded.to_vec());
                response.ids.push(id);
                size += encoded.len() as u64;
            }
            RequestKind::Ids => {
                response.ids.push(id);
                size += 32;
            }
        }
        last = Some(id);
        true
    });
    if let Err(err) = scan {
        tracing::error!(error = %err, "Seeder scan failed");
        return None;
    }

    if let Some(last) = last {
        session.next = last.next().as_bytes().to_vec();
    }
    session.done = all_consumed;
    response.done = all_consumed;
    Some(response)
}
