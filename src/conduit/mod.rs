//! JSON-RPC over a data channel

pub mod codec;
pub mod service;

pub use codec::{encode, FrameDecoder, Request, Response};
pub use service::{ConduitContext, ConduitService};
