//! Connected peers and their bounded send queues.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opmesh_base::Id;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::trace;

use crate::net::codec::Frame;
use crate::net::SEND_TIMEOUT_SECS;

/// Frames a peer may hold in its outgoing queue.
pub const SEND_QUEUE_CAP: usize = 256;

/// Trust standing of a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeerType {
    /// Another device of this node.
    Me,
    /// A confirmed member of at least one shared entity.
    Member,
    /// Mid-handshake; membership not yet confirmed.
    Pending,
    /// An unconfirmed peer kept for discovery.
    Random,
}

impl PeerType {
    /// Whether the peer receives broadcasts and may carry signatures.
    pub fn is_fit(self) -> bool {
        matches!(self, PeerType::Me | PeerType::Member)
    }
}

/// Bounded FIFO of outgoing frames.
///
/// When full, the oldest non-oplog frame is shed first. Record
/// announcements are never shed: an oplog push waits for queue space, so a
/// slow peer loses sync chatter and stalls senders before it loses records.
#[derive(Debug)]
struct SendQueue {
    frames: Mutex<VecDeque<(Frame, bool)>>,
    notify: Notify,
    space: Notify,
    cap: usize,
}

impl SendQueue {
    fn new(cap: usize) -> Self {
        SendQueue {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            space: Notify::new(),
            cap,
        }
    }

    /// Makes room for one more frame by shedding the oldest non-oplog
    /// frame. Returns `false` when the queue is full of oplog frames.
    fn make_room(frames: &mut VecDeque<(Frame, bool)>, cap: usize) -> bool {
        if frames.len() < cap {
            return true;
        }
        if let Some(pos) = frames.iter().position(|(_, oplog)| !oplog) {
            frames.remove(pos);
            return true;
        }
        false
    }

    /// Queues a non-oplog frame, shedding if full. Returns `false` when the
    /// queue is full of oplog frames and the new frame was dropped.
    fn push(&self, frame: Frame) -> bool {
        let mut frames = self.frames.lock();
        if !Self::make_room(&mut frames, self.cap) {
            return false;
        }
        frames.push_back((frame, false));
        drop(frames);
        self.notify.notify_one();
        true
    }

    /// Queues an oplog frame, waiting for space when the queue is full of
    /// oplog frames. Returns `false` when `deadline` passed before space
    /// opened up.
    async fn push_oplog(&self, frame: Frame, deadline: Duration) -> bool {
        let wait = tokio::time::timeout(deadline, async {
            loop {
                let space = self.space.notified();
                {
                    let mut frames = self.frames.lock();
                    if Self::make_room(&mut frames, self.cap) {
                        frames.push_back((frame.clone(), true));
                        break;
                    }
                }
                space.await;
            }
        });
        if wait.await.is_err() {
            return false;
        }
        self.notify.notify_one();
        true
    }

    async fn pop(&self) -> Frame {
        loop {
            if let Some((frame, _)) = self.frames.lock().pop_front() {
                self.space.notify_one();
                return frame;
            }
            self.notify.notified().await;
        }
    }
}

/// One connected peer.
#[derive(Debug)]
pub struct Peer {
    node_id: Id,
    peer_type: RwLock<PeerType>,
    queue: SendQueue,
    misbehavior: AtomicU32,
}

impl Peer {
    pub fn new(node_id: Id, peer_type: PeerType) -> Arc<Self> {
        Arc::new(Peer {
            node_id,
            peer_type: RwLock::new(peer_type),
            queue: SendQueue::new(SEND_QUEUE_CAP),
            misbehavior: AtomicU32::new(0),
        })
    }

    pub fn node_id(&self) -> Id {
        self.node_id
    }

    pub fn peer_type(&self) -> PeerType {
        *self.peer_type.read()
    }

    /// Promotion or demotion after membership changes.
    pub fn set_peer_type(&self, peer_type: PeerType) {
        *self.peer_type.write() = peer_type;
    }

    /// Queues an outgoing non-oplog frame.
    pub fn send(&self, frame: Frame) -> bool {
        let sent = self.queue.push(frame);
        if !sent {
            trace!(peer = %self.node_id.fmt_short(), "send queue full, frame dropped");
        }
        sent
    }

    /// Queues a record announcement, waiting up to the send deadline for
    /// queue space. Returns `false` when the peer stayed stalled.
    pub async fn send_oplog(&self, frame: Frame) -> bool {
        let deadline = Duration::from_secs(SEND_TIMEOUT_SECS);
        let sent = self.queue.push_oplog(frame, deadline).await;
        if !sent {
            trace!(peer = %self.node_id.fmt_short(), "peer stalled, announcement timed out");
        }
        sent
    }

    /// Next frame for the writer task.
    pub async fn next_outgoing(&self) -> Frame {
        self.queue.pop().await
    }

    /// Bumps and returns the misbehavior count.
    pub fn record_misbehavior(&self) -> u32 {
        self.misbehavior.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn misbehavior(&self) -> u32 {
        self.misbehavior.load(Ordering::Relaxed)
    }
}

/// The set of connected peers.
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: RwLock<HashMap<Id, Arc<Peer>>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: Arc<Peer>) {
        self.peers.write().insert(peer.node_id(), peer);
    }

    pub fn remove(&self, node_id: &Id) -> Option<Arc<Peer>> {
        self.peers.write().remove(node_id)
    }

    pub fn get(&self, node_id: &Id) -> Option<Arc<Peer>> {
        self.peers.read().get(node_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Snapshot of the current peers; iteration never holds the set lock.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    /// A fit peer to initiate sync against, if any.
    pub fn any_fit(&self) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .values()
            .find(|p| p.peer_type().is_fit())
            .cloned()
    }

    /// Queues a record announcement to every fit peer except `skip`,
    /// waiting out stalled peers up to their send deadline.
    pub async fn broadcast(&self, frame: &Frame, skip: Option<&Id>) -> usize {
        let mut sent = 0;
        for peer in self.snapshot() {
            if Some(&peer.node_id()) == skip || !peer.peer_type().is_fit() {
                continue;
            }
            if peer.send_oplog(frame.clone()).await {
                sent += 1;
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rand_core::SeedableRng;

    fn frame(op: u16) -> Frame {
        Frame {
            op_code: op,
            entity_id: Id::ZERO,
            payload: Bytes::new(),
        }
    }

    fn node_id(seed: u64) -> Id {
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(seed);
        Id::random(&mut rng)
    }

    #[tokio::test]
    async fn test_queue_sheds_non_oplog_first() {
        let queue = SendQueue::new(2);
        assert!(queue.push(frame(100)));
        assert!(queue.push_oplog(frame(1), Duration::from_secs(1)).await);
        // full: the non-oplog frame goes first
        assert!(queue.push_oplog(frame(2), Duration::from_secs(1)).await);
        let frames = queue.frames.lock();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|(_, oplog)| *oplog));
        assert_eq!(frames[0].0.op_code, 1);
    }

    #[tokio::test]
    async fn test_full_queue_keeps_every_record() {
        let queue = Arc::new(SendQueue::new(2));
        assert!(queue.push_oplog(frame(1), Duration::from_secs(1)).await);
        assert!(queue.push_oplog(frame(2), Duration::from_secs(1)).await);
        // non-oplog cannot displace announcements
        assert!(!queue.push(frame(100)));

        // a further announcement waits for space instead of shedding
        let pusher = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push_oplog(frame(3), Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(queue.frames.lock().len(), 2);

        assert_eq!(queue.pop().await.op_code, 1);
        assert!(pusher.await.unwrap());
        let frames = queue.frames.lock();
        assert_eq!(frames[0].0.op_code, 2);
        assert_eq!(frames[1].0.op_code, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_queue_times_out_the_push() {
        let queue = SendQueue::new(1);
        assert!(queue.push_oplog(frame(1), Duration::from_secs(1)).await);
        // nothing drains the queue; the push gives up at its deadline
        assert!(!queue.push_oplog(frame(2), Duration::from_secs(1)).await);
        let frames = queue.frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.op_code, 1);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let peer = Peer::new(node_id(1), PeerType::Member);
        let popper = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.next_outgoing().await })
        };
        tokio::task::yield_now().await;
        peer.send(frame(7));
        let got = popper.await.unwrap();
        assert_eq!(got.op_code, 7);
    }

    #[tokio::test]
    async fn test_broadcast_skips_unfit_and_source() {
        let peers = PeerSet::new();
        let member = Peer::new(node_id(2), PeerType::Member);
        let random = Peer::new(node_id(3), PeerType::Random);
        let source = Peer::new(node_id(4), PeerType::Member);
        peers.insert(member.clone());
        peers.insert(random);
        peers.insert(source.clone());

        let sent = peers.broadcast(&frame(1), Some(&source.node_id())).await;
        assert_eq!(sent, 1);
        assert!(member.queue.frames.lock().len() == 1);
        assert!(source.queue.frames.lock().is_empty());
    }
}
