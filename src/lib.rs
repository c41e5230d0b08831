//! Library crate for portsweep exposing the scan engine modules.
pub mod error;
pub mod optimize;
pub mod ports;
pub mod probe;
pub mod scanner;
pub mod sockopt;
pub mod timeouts;
pub mod types;
