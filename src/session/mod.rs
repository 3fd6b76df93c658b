//! Control-channel protocol spoken with a node before and during a session

pub mod frames;
pub mod handshake;
pub mod launch;
pub mod probe;

pub use frames::{wait_for_command_request, ControlFrame, LAUNCH_PREFIX, SENTINEL};
pub use handshake::ControlHandshake;
pub use launch::{Anonymous, CredentialSource, LaunchConfig, LaunchPayload, LaunchPlan};
pub use probe::{get_network_statistics, NetworkStatistics};
