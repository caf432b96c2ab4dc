pub mod addr;
pub mod cipher;
pub mod connection_manager;
pub mod exchange;
pub mod message;
pub mod peer;
pub mod pnet;
pub mod rate_limiter;
pub mod secure_channel;
pub mod server;
pub mod wire;
