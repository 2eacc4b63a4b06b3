//! Peer transport: framing, send queues and the message router.
//!
//! The core is transport-agnostic; anything `AsyncRead + AsyncWrite` can
//! carry frames. [`codec`] defines the wire framing, [`peer`] tracks
//! connected peers and their bounded send queues, [`router`] dispatches
//! inbound frames to the per-entity sync engines.

pub mod codec;
pub mod peer;
pub mod router;

/// Seconds an announcement may wait in a full send queue before the peer
/// is considered stalled.
pub const SEND_TIMEOUT_SECS: u64 = 30;

/// Seconds between force-sync requests; gap repairs within the window
/// coalesce into one round.
pub const FORCE_SYNC_INTERVAL_SECS: u64 = 60;
