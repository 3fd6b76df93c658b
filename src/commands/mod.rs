pub mod launch_api;
pub mod util_api;

pub use launch_api::{launch, launch_context, list_nodes};
pub use util_api::check_ice_server_availability;
