use serde::{Deserialize, Serialize};

use crate::shared::pvt_repr::{Endorsement, PvtKey, TxRwSet, Version};

/// Carried in `P2PMessageBody::metadata` of every peer message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerMeta {
    pub org: String,
    pub height: u64,
}

/// Peer-to-peer messages carried in `P2PMessageBody::content`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Alive {
        org: String,
        height: u64,
    },
    Push {
        request_id: u64,
        tx_id: String,
        key: PvtKey,
        version: Version,
        payload: Vec<u8>,
    },
    PushAck {
        request_id: u64,
    },
    PullRequest {
        request_id: u64,
        key: PvtKey,
        version: Version,
    },
    PullResponse {
        request_id: u64,
        payload: Option<Vec<u8>>, // None: not found
    },
}

impl PeerMessage {
    /// Request id of a reply, used to route it back to the waiting task.
    pub fn reply_to(&self) -> Option<u64> {
        match self {
            PeerMessage::PushAck { request_id } => Some(*request_id),
            PeerMessage::PullResponse { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub tx_id: String,
    pub channel: String,
    pub chaincode: String,
    pub args: Vec<String>,
    pub creator_org: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProposalResponse {
    pub tx_id: String,
    pub rwset: TxRwSet,
    pub endorsement: Endorsement,
    pub payload: Vec<u8>,
}
