pub mod capability;
pub mod client;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod monitoring;
pub mod scheduler;
pub mod snapshot;
pub mod spanning_tree;
pub mod transport;
pub mod udp;

pub use config::ControllerConfig;
pub use controller::Controller;
pub use error::{ControllerError, ControllerResult, TransportError};
