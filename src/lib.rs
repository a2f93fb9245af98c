pub mod config;
pub mod connection;
pub mod connection_id;
pub mod error;
pub mod health;
pub mod server;
pub mod stack;
pub mod transport;
pub mod util;
pub mod wire;

#[cfg(test)]
mod test_util;
