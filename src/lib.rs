//! swarmd: a private-network peer-to-peer node with topic gossip and a
//! content-addressed block store.

pub mod config;
pub mod content;
pub mod error;
pub mod gossip;
pub mod identity;
pub mod network;
pub mod node;
pub mod orchestrator;
pub mod shutdown;

pub use config::Config;
pub use error::AppError;
pub use node::Node;
