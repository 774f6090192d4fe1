//! Backend for the remote box service. Every call is a JSON message carried
//! over one SSH connection.

mod client;
pub mod protocol;
pub mod transport;

pub use client::CloudBoxClient;
