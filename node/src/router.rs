use crate::protocol::IncomingFrame;
use shared::envelope::ProtocolEnvelope;
use std::collections::{ HashMap, HashSet, VecDeque };
use std::sync::Mutex;
use std::time::{ Duration, Instant };
use tokio::sync::mpsc;
use tracing::{ debug, warn };

const MAX_PENDING_SESSIONS: usize = 64;
const MAX_PENDING_FRAMES: usize = 256;
const MAX_TOMBSTONES: usize = 1024;

/// Demultiplexes inbound frames to the driver owning the session.
///
/// Frames for sessions we have not spawned a driver for yet are buffered
/// for a bounded grace window: on fast networks protocol rounds regularly
/// overtake the operation-sync that announces the session. Terminated
/// sessions leave a tombstone so late frames are discarded instead of
/// buffered again.
pub struct Router {
    grace: Duration,
    inner: Mutex<RouterInner>,
}

struct RouterInner {
    sessions: HashMap<String, SessionEntry>,
    pending: HashMap<String, PendingBuffer>,
    terminated: HashSet<String>,
    terminated_order: VecDeque<String>,
}

struct SessionEntry {
    tx: mpsc::Sender<IncomingFrame>,
    seen: HashSet<(u16, u16, bool)>,
}

struct PendingBuffer {
    frames: Vec<IncomingFrame>,
    expires_at: Instant,
}

impl Router {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            inner: Mutex::new(RouterInner {
                sessions: HashMap::new(),
                pending: HashMap::new(),
                terminated: HashSet::new(),
                terminated_order: VecDeque::new(),
            }),
        }
    }

    /// Route one envelope. Never blocks: a full driver queue drops the
    /// frame and the session's own round timeout deals with the fallout.
    pub fn route(&self, envelope: ProtocolEnvelope) {
        let payload = match envelope.payload_bytes() {
            Ok(payload) => payload,
            Err(err) => {
                debug!("Dropping frame with undecodable payload: {}", err);
                return;
            }
        };
        let frame = IncomingFrame {
            from: envelope.from_party,
            round: envelope.round,
            is_broadcast: envelope.is_broadcast,
            payload,
        };
        let dedup_key = (frame.from, frame.round, frame.is_broadcast);

        let mut inner = self.inner.lock().expect("router lock");
        inner.evict_expired();

        if inner.terminated.contains(&envelope.session_id) {
            debug!("Discarding frame for terminated session {}", envelope.session_id);
            return;
        }

        if let Some(entry) = inner.sessions.get_mut(&envelope.session_id) {
            if !entry.seen.insert(dedup_key) {
                debug!(
                    "Dropping duplicate frame {:?} for session {}",
                    dedup_key,
                    envelope.session_id
                );
                return;
            }
            match entry.tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Inbound queue full for session {}, dropping frame", envelope.session_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Driver for session {} is gone, dropping frame", envelope.session_id);
                }
            }
            return;
        }

        // Unknown session: buffer within bounds.
        if !inner.pending.contains_key(&envelope.session_id)
            && inner.pending.len() >= MAX_PENDING_SESSIONS
        {
            debug!("Pending session limit reached, dropping frame for {}", envelope.session_id);
            return;
        }
        let expires_at = Instant::now() + self.grace;
        let buffer = inner.pending
            .entry(envelope.session_id.clone())
            .or_insert_with(|| PendingBuffer { frames: Vec::new(), expires_at });
        if buffer.frames.len() < MAX_PENDING_FRAMES {
            buffer.frames.push(frame);
        }
    }

    /// Attach a driver to a session. Frames buffered during the grace
    /// window are flushed into the returned queue immediately, deduplicated
    /// the same way as live traffic.
    pub fn register(&self, session_id: &str, queue_size: usize) -> mpsc::Receiver<IncomingFrame> {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let mut inner = self.inner.lock().expect("router lock");
        inner.remove_tombstone(session_id);

        let mut entry = SessionEntry { tx, seen: HashSet::new() };
        if let Some(buffer) = inner.pending.remove(session_id) {
            for frame in buffer.frames {
                let dedup_key = (frame.from, frame.round, frame.is_broadcast);
                if entry.seen.insert(dedup_key) {
                    let _ = entry.tx.try_send(frame);
                }
            }
        }
        inner.sessions.insert(session_id.to_string(), entry);
        rx
    }

    /// Detach a finished driver and tombstone the session.
    pub fn unregister(&self, session_id: &str) {
        let mut inner = self.inner.lock().expect("router lock");
        inner.sessions.remove(session_id);
        inner.pending.remove(session_id);
        if inner.terminated.insert(session_id.to_string()) {
            inner.terminated_order.push_back(session_id.to_string());
            if inner.terminated_order.len() > MAX_TOMBSTONES {
                if let Some(evicted) = inner.terminated_order.pop_front() {
                    inner.terminated.remove(&evicted);
                }
            }
        }
    }
}

impl RouterInner {
    fn evict_expired(&mut self) {
        let now = Instant::now();
        self.pending.retain(|session_id, buffer| {
            let keep = buffer.expires_at > now;
            if !keep {
                debug!("Evicting {} buffered frames for session {}", buffer.frames.len(), session_id);
            }
            keep
        });
    }

    fn remove_tombstone(&mut self, session_id: &str) {
        if self.terminated.remove(session_id) {
            self.terminated_order.retain(|id| id != session_id);
        }
    }
}
