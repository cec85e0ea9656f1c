use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(PeerId);
id_newtype!(CallId);

/// Addresses one group call on the server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallReference {
    pub call_id: CallId,
    pub access_hash: i64,
}

/// A resolved identity from the peer directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub display_name: String,
}

impl Peer {
    pub fn new(id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }
}

/// Identity of a roster entry. Peer ids order before blockchain ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParticipantId {
    Peer(PeerId),
    Blockchain(String),
}

impl ParticipantId {
    pub fn peer_id(&self) -> Option<PeerId> {
        match self {
            ParticipantId::Peer(peer_id) => Some(*peer_id),
            ParticipantId::Blockchain(_) => None,
        }
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantId::Peer(peer_id) => write!(f, "{peer_id}"),
            ParticipantId::Blockchain(internal_id) => f.write_str(internal_id),
        }
    }
}

impl From<PeerId> for ParticipantId {
    fn from(value: PeerId) -> Self {
        ParticipantId::Peer(value)
    }
}
