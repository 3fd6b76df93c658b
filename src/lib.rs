//! Find session hosts in a directory, race a WebRTC negotiation against each
//! and launch over the first control channel to complete its handshake.

pub mod arbitrator;
pub mod commands;
pub mod conduit;
pub mod config;
pub mod directory;
pub mod error;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod stop;
pub mod utils;

pub use arbitrator::{Arbitrator, AttemptSet, ChannelService, ChannelServices, LaunchContext};
pub use config::Config;
pub use error::{Error, Result};
pub use stop::{StopCode, StopSignal};
