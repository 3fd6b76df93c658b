pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod link;
pub mod negotiator;
pub mod state;
pub mod types;

pub use data_channel::{ChannelRole, DataChannel, FrameSink};
pub use link::{ChannelStream, Connector, LinkCloser, LinkHandle, PeerLink};
pub use negotiator::{Negotiator, WebRtcConnector};
pub use state::{LinkState, NegotiationState};
pub use types::{IceCandidate, NodeOffer, ServerConfig};
