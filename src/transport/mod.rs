//! VEIL transport layer: frame codec, fragment reassembly, replay window,
//! retransmission, congestion control, ACK scheduling, session rotation,
//! the mutable [`session::TransportSession`], and the UDP socket wrapper.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      client / server event loop         │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← this module
//! │  frames, replay, retransmit, congestion │
//! ├─────────────────────────────────────────┤
//! │         Handshake / crypto layer        │
//! ├─────────────────────────────────────────┤
//! │                 UDP                      │
//! └─────────────────────────────────────────┘
//! ```

mod ack_scheduler;
mod congestion;
mod fragment;
mod frame;
mod replay_window;
mod retransmit;
mod rotator;
mod session;
mod socket;
mod timing;

pub use ack_scheduler::{AckScheduler, AckSchedulerConfig, AckSchedulerStats, PendingAck};
pub use congestion::{CongestionConfig, CongestionController, CongestionState, CongestionStats};
pub use fragment::FragmentReassembler;
pub use frame::Frame;
pub use replay_window::ReplayWindow;
pub use retransmit::{DropPolicy, Priority, RetransmitBuffer, RetransmitError};
pub use rotator::SessionRotator;
pub use session::{DecodedFrame, SessionStats, TransportSession};
pub use socket::{VeilSocket, VeilSocketBuilder};
pub use timing::RttEstimator;
