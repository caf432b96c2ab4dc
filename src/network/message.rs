use crate::content::Cid;
use crate::gossip::{GossipMessage, MessageId};
use serde::{Deserialize, Serialize};

/// Everything exchanged over an authenticated connection.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum WireMessage {
    // Topic interest announcements
    Subscribe {
        topics: Vec<String>,
    },
    Unsubscribe {
        topics: Vec<String>,
    },
    // Periodic full re-announcement of our topics
    Heartbeat {
        topics: Vec<String>,
    },
    Publish(GossipMessage),
    // Mesh control
    Graft {
        topic: String,
    },
    Prune {
        topic: String,
    },
    // Lazy gossip repair
    IHave {
        topic: String,
        message_ids: Vec<MessageId>,
    },
    IWant {
        message_ids: Vec<MessageId>,
    },
    // Block exchange between directly connected peers
    WantBlock {
        cid: Cid,
    },
    Block {
        cid: Cid,
        data: Vec<u8>,
    },
}

impl WireMessage {
    /// Rate limiter bucket for inbound messages.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Subscribe { .. }
            | WireMessage::Unsubscribe { .. }
            | WireMessage::Heartbeat { .. } => "announce",
            WireMessage::Publish(_) => "publish",
            WireMessage::Graft { .. } | WireMessage::Prune { .. } => "control",
            WireMessage::IHave { .. } => "ihave",
            WireMessage::IWant { .. } => "iwant",
            WireMessage::WantBlock { .. } | WireMessage::Block { .. } => "exchange",
        }
    }
}
