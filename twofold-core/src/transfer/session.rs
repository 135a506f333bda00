use super::{format_rtc_uri, normalize_peer_id, PeerChannel, PeerListener, PeerNetwork};
use crate::backup::{decode, encode, export_records, import_data};
use crate::ids::SnowflakeGenerator;
use crate::store::SecretStore;
use crate::{Result, TwofoldError};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Manual connect attempts allowed before the session gives up.
pub const MAX_CONNECT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Connects to a published id and receives the backup.
    Initiator,
    /// Publishes its id and sends the backup.
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Idle,
    Connecting,
    Connected,
    Error,
    Disconnected,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerStatus::Idle => "idle",
            PeerStatus::Connecting => "connecting",
            PeerStatus::Connected => "connected",
            PeerStatus::Error => "error",
            PeerStatus::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// One backup transfer between two devices.
///
/// Every publish or connect starts from a clean session with a fresh local
/// id. Status changes are published on a `watch` channel.
pub struct TransferSession {
    network: Arc<dyn PeerNetwork>,
    ids: SnowflakeGenerator,
    role: Option<PeerRole>,
    local_id: Option<String>,
    remote_id: Option<String>,
    listener: Option<Box<dyn PeerListener>>,
    channel: Option<Box<dyn PeerChannel>>,
    attempts: u32,
    status: watch::Sender<PeerStatus>,
    logs: Vec<String>,
    raw_messages: Vec<String>,
}

impl TransferSession {
    pub fn new(network: Arc<dyn PeerNetwork>) -> Self {
        let (status, _) = watch::channel(PeerStatus::Idle);
        Self {
            network,
            ids: SnowflakeGenerator::with_random_worker(),
            role: None,
            local_id: None,
            remote_id: None,
            listener: None,
            channel: None,
            attempts: 0,
            status,
            logs: Vec::new(),
            raw_messages: Vec::new(),
        }
    }

    pub fn status(&self) -> PeerStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PeerStatus> {
        self.status.subscribe()
    }

    pub fn role(&self) -> Option<PeerRole> {
        self.role
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Timestamped event lines, oldest first.
    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    /// Messages that arrived after the transfer payload. Never imported.
    pub fn raw_messages(&self) -> &[String] {
        &self.raw_messages
    }

    fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!("transfer: {}", message);
        self.logs.push(format!(
            "[{}] {}",
            chrono::Utc::now().format("%H:%M:%S%.3f"),
            message
        ));
    }

    fn set_status(&mut self, status: PeerStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            self.log(format!("Status {} -> {}", previous, status));
        }
    }

    async fn teardown(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        if let Some(mut listener) = self.listener.take() {
            listener.close().await;
        }
    }

    /// Move to `Error`, release the transport and hand the error back.
    async fn fail(&mut self, err: TwofoldError) -> TwofoldError {
        warn!("Transfer failed: {}", err);
        self.log(format!("Error: {}", err));
        self.teardown().await;
        self.set_status(PeerStatus::Error);
        err
    }

    /// Close everything and return to `Idle`. Safe from any state.
    pub async fn reset(&mut self) {
        self.teardown().await;
        if let Some(id) = self.local_id.take() {
            self.log(format!("Released local id {}", id));
        }
        self.remote_id = None;
        self.role = None;
        self.set_status(PeerStatus::Idle);
    }

    /// Allow another round of connect attempts.
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    /// Responder: start listening under a fresh id and return its `rtc://` URI.
    pub async fn publish(&mut self) -> Result<String> {
        self.reset().await;
        self.role = Some(PeerRole::Responder);

        let local_id = self.ids.generate();
        self.log(format!("Publishing as {}", local_id));
        let listener = match self.network.listen(&local_id).await {
            Ok(listener) => listener,
            Err(e) => return Err(self.fail(e).await),
        };

        self.listener = Some(listener);
        self.local_id = Some(local_id.clone());
        self.set_status(PeerStatus::Connecting);
        Ok(format_rtc_uri(&local_id))
    }

    /// Responder: wait for the peer, push `payload` once and close.
    pub async fn serve(&mut self, payload: &str) -> Result<()> {
        if self.role != Some(PeerRole::Responder) {
            return Err(TwofoldError::Protocol(
                "Session must be published before serving".to_string(),
            ));
        }
        // The listener stays owned by the session until a peer arrives, so a
        // cancelled serve still leaves it for reset() to close.
        let accepted = match self.listener.as_mut() {
            Some(listener) => listener.accept().await,
            None => {
                return Err(TwofoldError::Protocol(
                    "Session is not listening".to_string(),
                ))
            }
        };
        if let Some(mut listener) = self.listener.take() {
            listener.close().await;
        }
        let mut channel = match accepted {
            Ok(channel) => channel,
            Err(e) => return Err(self.fail(e).await),
        };

        let remote = channel.remote_id().to_string();
        self.log(format!("Peer {} connected", remote));
        self.remote_id = Some(remote);
        self.set_status(PeerStatus::Connected);

        if let Err(e) = channel.send(payload).await {
            channel.close().await;
            return Err(self.fail(e).await);
        }
        self.log(format!("Sent {} bytes", payload.len()));

        channel.close().await;
        self.set_status(PeerStatus::Disconnected);
        info!("Backup sent");
        Ok(())
    }

    /// Initiator: connect to a published peer given as `rtc://` URI or bare id.
    pub async fn connect(&mut self, remote: &str) -> Result<()> {
        let remote_id = normalize_peer_id(remote)?;

        self.reset().await;
        self.role = Some(PeerRole::Initiator);
        self.attempts += 1;

        let local_id = self.ids.generate();
        self.local_id = Some(local_id.clone());
        self.remote_id = Some(remote_id.clone());
        self.log(format!(
            "Connecting to {} as {} (attempt {})",
            remote_id, local_id, self.attempts
        ));
        self.set_status(PeerStatus::Connecting);

        match self.network.connect(&local_id, &remote_id).await {
            Ok(channel) => {
                self.channel = Some(channel);
                self.attempts = 0;
                self.set_status(PeerStatus::Connected);
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Initiator: try again after a failure, at most
    /// [`MAX_CONNECT_ATTEMPTS`] times per session.
    pub async fn retry_connect(&mut self, remote: &str) -> Result<()> {
        if self.attempts >= MAX_CONNECT_ATTEMPTS {
            self.log("Retry limit reached");
            return Err(TwofoldError::Protocol(format!(
                "Gave up after {} attempts",
                MAX_CONNECT_ATTEMPTS
            )));
        }
        self.connect(remote).await
    }

    /// Initiator: wait for the single payload message and end the session.
    pub async fn receive(&mut self) -> Result<String> {
        let mut channel = self
            .channel
            .take()
            .ok_or_else(|| TwofoldError::Protocol("Session is not connected".to_string()))?;

        let payload = match channel.recv().await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                channel.close().await;
                let err = TwofoldError::Protocol("Peer closed before sending data".to_string());
                return Err(self.fail(err).await);
            }
            Err(e) => {
                channel.close().await;
                return Err(self.fail(e).await);
            }
        };
        self.log(format!("Received {} bytes", payload.len()));

        for extra in channel.drain().await {
            self.log(format!("Ignored extra message ({} bytes)", extra.len()));
            self.raw_messages.push(extra);
        }

        channel.close().await;
        self.set_status(PeerStatus::Disconnected);
        Ok(payload)
    }

    /// Responder flow after [`publish`](Self::publish): send the whole store.
    /// Returns the number of records sent.
    pub async fn send_backup(&mut self, store: &dyn SecretStore) -> Result<usize> {
        let records = export_records(store).await?;
        if records.is_empty() {
            return Err(TwofoldError::InvalidInput("There are no secrets to send".to_string()));
        }
        self.serve(&encode(&records)).await?;
        Ok(records.len())
    }

    /// Initiator flow: connect, receive, decode and import. Returns the number
    /// of records imported.
    pub async fn receive_backup(&mut self, store: &dyn SecretStore, remote: &str) -> Result<usize> {
        self.connect(remote).await?;
        let payload = self.receive().await?;

        let records = decode(&payload).map_err(|e| {
            warn!("Received payload could not be decoded: {}", e);
            TwofoldError::Format(e)
        })?;
        let imported = import_data(store, &records).await;
        self.log(format!("Imported {} of {} records", imported, records.len()));
        Ok(imported)
    }
}
