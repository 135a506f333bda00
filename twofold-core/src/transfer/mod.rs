//! Peer-to-peer backup transfer.
//!
//! One device publishes a single-use identifier (shown as an `rtc://` URI),
//! the other connects to it and receives exactly one backup payload over a
//! direct channel. Transports plug in through [`PeerNetwork`].

pub mod loopback;
#[cfg(feature = "net")]
pub mod rendezvous;
mod session;

pub use loopback::LoopbackNetwork;
#[cfg(feature = "net")]
pub use rendezvous::RendezvousNetwork;
pub use session::{PeerRole, PeerStatus, TransferSession, MAX_CONNECT_ATTEMPTS};

use crate::backup::{FormatError, FormatResult};
use crate::Result;
use async_trait::async_trait;

pub const RTC_SCHEME: &str = "rtc://";

/// Opens listeners and outbound channels keyed by peer identifiers.
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Start accepting connections addressed to `local_id`.
    async fn listen(&self, local_id: &str) -> Result<Box<dyn PeerListener>>;

    /// Open a channel from `local_id` to the peer listening as `remote_id`.
    async fn connect(&self, local_id: &str, remote_id: &str) -> Result<Box<dyn PeerChannel>>;
}

#[async_trait]
pub trait PeerListener: Send {
    async fn accept(&mut self) -> Result<Box<dyn PeerChannel>>;

    /// Stop listening and release the identifier. Safe to call twice.
    async fn close(&mut self);
}

/// Reliable ordered text channel to one peer.
#[async_trait]
pub trait PeerChannel: Send {
    fn remote_id(&self) -> &str;

    async fn send(&mut self, text: &str) -> Result<()>;

    /// Next message, or `None` once the remote side has closed.
    async fn recv(&mut self) -> Result<Option<String>>;

    /// Messages that already arrived after the last `recv`.
    async fn drain(&mut self) -> Vec<String>;

    async fn close(&mut self);
}

pub fn format_rtc_uri(peer_id: &str) -> String {
    format!("{}{}", RTC_SCHEME, peer_id)
}

/// Extract the peer identifier from an `rtc://` URI.
pub fn parse_rtc_uri(text: &str) -> FormatResult<String> {
    let trimmed = text.trim();
    let rest = match trimmed.get(..RTC_SCHEME.len()) {
        Some(scheme) if scheme.eq_ignore_ascii_case(RTC_SCHEME) => &trimmed[RTC_SCHEME.len()..],
        _ => {
            return Err(FormatError::InvalidUri(format!(
                "expected {}<peer id>",
                RTC_SCHEME
            )))
        }
    };

    let id = rest.trim_end_matches('/').trim();
    if id.is_empty() {
        return Err(FormatError::InvalidUri("peer id is empty".to_string()));
    }
    Ok(id.to_string())
}

/// Accept either an `rtc://` URI or a bare identifier, as typed or scanned.
pub(crate) fn normalize_peer_id(text: &str) -> FormatResult<String> {
    let trimmed = text.trim();
    let raw = if trimmed.contains("://") {
        parse_rtc_uri(trimmed)?
    } else {
        trimmed.to_string()
    };

    let id: String = raw.chars().filter(|c| *c != '-' && !c.is_whitespace()).collect();
    if id.is_empty() {
        return Err(FormatError::InvalidUri("peer id is empty".to_string()));
    }
    Ok(id)
}
