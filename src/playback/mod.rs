//! # Streaming Playback
//!
//! Turns a bursty, possibly reordered stream of encoded audio fragments into
//! gapless output, with barge-in, turn supersession and a one-shot
//! "done playing" handshake back to the sender.
//!
//! ## Components (leaf to root):
//! - **decoder**: base64 16-bit PCM → normalized `f32` samples
//! - **device**: the `RenderDevice` seam and the clocked `VirtualDevice`
//! - **registry**: units scheduled or playing
//! - **scheduler**: FIFO, busy flag, cursor and pre-buffering
//! - **context**: which turn is current
//! - **sequence**: fragment index diagnostics
//! - **completion**: drain polling and the processed-turn ledger
//! - **engine**: all of the above behind one sans-IO state machine
//! - **protocol**: the JSON events on the wire

pub mod completion;
pub mod context;
pub mod decoder;
pub mod device;
pub mod engine;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod sequence;
#[cfg(feature = "speaker")]
pub mod speaker;

pub use device::{DeviceEvent, DeviceState, RenderDevice, VirtualDevice};
pub use engine::{EngineEffect, PlaybackEngine};
pub use protocol::{InboundEvent, OutboundEvent};
pub use scheduler::Fragment;
