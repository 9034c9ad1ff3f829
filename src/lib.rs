pub mod config;
pub mod controller;
pub mod error;
pub mod hooks;
pub mod listener;
pub mod logging;
pub mod session;
pub mod smtp;
pub mod transport;

pub use tracing;
