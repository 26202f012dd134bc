//! Capture data-path core of a Bluetooth A2DP audio source node: decode
//! buffering, buffer pool management, the pluggable codec contract, node
//! negotiation/command state machine, and the realtime socket/timer engine.
//!
//! Transport acquisition, concrete codec algorithms, and the host graph
//! scheduler all live outside this crate; see [`transport::Transport`] and
//! [`codec::Codec`] for the seams they plug into.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod format;
pub mod io;
pub mod node;
pub mod transport;

pub use error::{NodeError, Result};
