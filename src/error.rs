use crate::content::ContentError;
use crate::gossip::GossipError;
use crate::identity::IdentityError;
use crate::network::connection_manager::ConnectionError;
use crate::network::pnet::PnetError;
use crate::network::secure_channel::SecureChannelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Private network error: {0}")]
    Pnet(#[from] PnetError),

    #[error("Secure channel error: {0}")]
    SecureChannel(#[from] SecureChannelError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Gossip error: {0}")]
    Gossip(#[from] GossipError),

    #[error("Content error: {0}")]
    Content(#[from] ContentError),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Initialization error: {0}")]
    Initialization(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
