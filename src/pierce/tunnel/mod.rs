pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;
