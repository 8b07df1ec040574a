pub mod audio;
pub mod button;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod fanout;
pub mod http_api;
pub mod identity;
pub mod mdns;
pub mod node;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod sink;
pub mod transport;
pub mod verify;

#[cfg(test)]
mod testing;
