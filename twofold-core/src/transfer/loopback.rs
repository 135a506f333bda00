//! In-process transport used by tests and demos.

use super::{PeerChannel, PeerListener, PeerNetwork};
use crate::{Result, TwofoldError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

type PeerTable = HashMap<String, mpsc::UnboundedSender<LoopbackChannel>>;
type Registry = Arc<Mutex<PeerTable>>;

/// Peers registered in a shared in-memory table.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    registry: Registry,
    failing_connects: Arc<AtomicUsize>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connect attempts fail as if signaling were down.
    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn is_listening(&self, peer_id: &str) -> bool {
        self.registry
            .lock()
            .map(|peers| peers.contains_key(peer_id))
            .unwrap_or(false)
    }

    fn registry(&self) -> Result<std::sync::MutexGuard<'_, PeerTable>> {
        self.registry
            .lock()
            .map_err(|e| TwofoldError::Network(format!("Lock error: {}", e)))
    }
}

#[async_trait]
impl PeerNetwork for LoopbackNetwork {
    async fn listen(&self, local_id: &str) -> Result<Box<dyn PeerListener>> {
        let mut peers = self.registry()?;
        if peers.contains_key(local_id) {
            return Err(TwofoldError::Protocol(format!(
                "Peer id {} is already in use",
                local_id
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        peers.insert(local_id.to_string(), tx);
        debug!("Loopback peer {} listening", local_id);

        Ok(Box::new(LoopbackListener {
            peer_id: local_id.to_string(),
            incoming: rx,
            registry: self.registry.clone(),
            closed: false,
        }))
    }

    async fn connect(&self, local_id: &str, remote_id: &str) -> Result<Box<dyn PeerChannel>> {
        let pending = self.failing_connects.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_connects.store(pending - 1, Ordering::SeqCst);
            return Err(TwofoldError::Network("Signaling server unreachable".to_string()));
        }

        let listener = self
            .registry()?
            .get(remote_id)
            .cloned()
            .ok_or_else(|| TwofoldError::Network(format!("Peer {} not found", remote_id)))?;

        let (local, remote) = LoopbackChannel::pair(local_id, remote_id);
        listener
            .send(remote)
            .map_err(|_| TwofoldError::Network(format!("Peer {} stopped listening", remote_id)))?;

        debug!("Loopback peer {} connected to {}", local_id, remote_id);
        Ok(Box::new(local))
    }
}

pub struct LoopbackListener {
    peer_id: String,
    incoming: mpsc::UnboundedReceiver<LoopbackChannel>,
    registry: Registry,
    closed: bool,
}

impl LoopbackListener {
    fn unregister(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.incoming.close();
        if let Ok(mut peers) = self.registry.lock() {
            peers.remove(&self.peer_id);
        }
    }
}

#[async_trait]
impl PeerListener for LoopbackListener {
    async fn accept(&mut self) -> Result<Box<dyn PeerChannel>> {
        match self.incoming.recv().await {
            Some(channel) => Ok(Box::new(channel)),
            None => Err(TwofoldError::Protocol("Listener closed".to_string())),
        }
    }

    async fn close(&mut self) {
        self.unregister();
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// One end of an in-memory channel pair.
pub struct LoopbackChannel {
    remote_id: String,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    incoming: mpsc::UnboundedReceiver<String>,
}

impl LoopbackChannel {
    /// Two connected ends; the first belongs to `a`, the second to `b`.
    pub fn pair(a: &str, b: &str) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self {
                remote_id: b.to_string(),
                outgoing: Some(a_tx),
                incoming: a_rx,
            },
            Self {
                remote_id: a.to_string(),
                outgoing: Some(b_tx),
                incoming: b_rx,
            },
        )
    }
}

#[async_trait]
impl PeerChannel for LoopbackChannel {
    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    async fn send(&mut self, text: &str) -> Result<()> {
        let tx = self
            .outgoing
            .as_ref()
            .ok_or_else(|| TwofoldError::Protocol("Channel closed".to_string()))?;
        tx.send(text.to_string())
            .map_err(|_| TwofoldError::Protocol("Remote peer closed the channel".to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        Ok(self.incoming.recv().await)
    }

    async fn drain(&mut self) -> Vec<String> {
        let mut extra = Vec::new();
        while let Ok(message) = self.incoming.try_recv() {
            extra.push(message);
        }
        extra
    }

    async fn close(&mut self) {
        self.outgoing = None;
        self.incoming.close();
    }
}
