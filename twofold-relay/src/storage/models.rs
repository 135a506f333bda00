//! Relay storage model types.

use serde::{Deserialize, Serialize};

/// A listening peer announced through the rendezvous registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub peer_id: String,
    pub addr: String,
    /// Handed only to the peer that resolves the id.
    pub ticket: String,
    pub registered_at: i64,
    pub expires_at: i64,
}
