//! Axum router setup.

use crate::config::RelayConfig;
use crate::handlers::{rendezvous, time};
use crate::rate_limit::{rate_limit, RateLimiter};
use crate::storage::RelayStorage;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: RelayStorage,
    pub limiter: RateLimiter,
    pub rendezvous_ttl_secs: i64,
    pub max_active_registrations: usize,
}

impl AppState {
    pub fn new(storage: RelayStorage, config: &RelayConfig) -> Self {
        Self {
            storage,
            limiter: RateLimiter::new(config.rate_limit_per_minute),
            rendezvous_ttl_secs: config.rendezvous_ttl_secs as i64,
            max_active_registrations: config.max_active_registrations,
        }
    }
}

pub fn build_router(state: AppState, config: &RelayConfig) -> Router {
    // Rate limited: id lookups are what a scanner would hammer
    let limited = Router::new()
        .route("/api/v1/rendezvous", post(rendezvous::register))
        .route(
            "/api/v1/rendezvous/{peer_id}",
            get(rendezvous::resolve).delete(rendezvous::withdraw),
        )
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    let public = Router::new()
        .route("/api/v1/time", get(time::current_time))
        .route("/health", get(health));

    Router::new()
        .merge(limited)
        .merge(public)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.max_payload_size))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use twofold_core::clock::HttpTimeAuthority;
    use twofold_core::store::{MemoryStore, SecretRecord, SecretStore};
    use twofold_core::transfer::{PeerNetwork, PeerStatus, RendezvousNetwork, TransferSession};
    use twofold_core::TimeAuthority;

    const TICKET: &str = "0123456789abcdef0123456789abcdef";

    async fn spawn_relay(config: RelayConfig) -> (String, RelayStorage) {
        let storage = RelayStorage::in_memory().unwrap();
        let app = build_router(AppState::new(storage.clone(), &config), &config);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        (format!("http://{}", addr), storage)
    }

    #[tokio::test]
    async fn test_health() {
        let (url, _) = spawn_relay(RelayConfig::default()).await;
        let body = reqwest::get(format!("{}/health", url))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_time_endpoint() {
        let (url, _) = spawn_relay(RelayConfig::default()).await;

        let resp = reqwest::get(format!("{}/api/v1/time", url)).await.unwrap();
        assert_eq!(
            resp.headers()
                .get("cache-control")
                .and_then(|v| v.to_str().ok()),
            Some("no-store")
        );
        let body: time::TimeResponse = resp.json().await.unwrap();
        let parsed = chrono::DateTime::parse_from_rfc3339(&body.time).unwrap();
        assert_eq!(parsed.timestamp_millis(), body.unix_ms);

        let authority = HttpTimeAuthority::new(&url).unwrap();
        let server_ms = authority.fetch_time_ms().await.unwrap();
        let local_ms = chrono::Utc::now().timestamp_millis();
        assert!((server_ms - local_ms).abs() < 5_000);
    }

    #[tokio::test]
    async fn test_rendezvous_lifecycle() {
        let (url, storage) = spawn_relay(RelayConfig::default()).await;
        let client = reqwest::Client::new();
        let body = serde_json::json!({
            "peer_id": "12345",
            "addr": "192.168.1.20:40000",
            "ticket": TICKET,
        });

        let resp = client
            .post(format!("{}/api/v1/rendezvous", url))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);

        let duplicate = client
            .post(format!("{}/api/v1/rendezvous", url))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(duplicate.status(), reqwest::StatusCode::CONFLICT);

        let resolved: rendezvous::RegistrationResponse = client
            .get(format!("{}/api/v1/rendezvous/12345", url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resolved.addr, "192.168.1.20:40000");
        assert_eq!(resolved.ticket, TICKET);

        let again = client
            .get(format!("{}/api/v1/rendezvous/12345", url))
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), reqwest::StatusCode::NOT_FOUND);

        let withdrawn = client
            .delete(format!("{}/api/v1/rendezvous/12345", url))
            .send()
            .await
            .unwrap();
        assert_eq!(withdrawn.status(), reqwest::StatusCode::NOT_FOUND);
        assert_eq!(
            storage.active_count(chrono::Utc::now().timestamp()).unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_rendezvous_rejects_bad_input() {
        let (url, _) = spawn_relay(RelayConfig::default()).await;
        let client = reqwest::Client::new();

        for body in [
            serde_json::json!({ "peer_id": "12-34", "addr": "10.0.0.1:1", "ticket": TICKET }),
            serde_json::json!({ "peer_id": "1234", "addr": "not an address", "ticket": TICKET }),
            serde_json::json!({ "peer_id": "1234", "addr": "10.0.0.1:1", "ticket": "short" }),
        ] {
            let resp = client
                .post(format!("{}/api/v1/rendezvous", url))
                .json(&body)
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let config = RelayConfig {
            rate_limit_per_minute: 2,
            ..RelayConfig::default()
        };
        let (url, _) = spawn_relay(config).await;
        let client = reqwest::Client::new();

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let resp = client
                .get(format!("{}/api/v1/rendezvous/999", url))
                .send()
                .await
                .unwrap();
            statuses.push(resp.status());
        }
        assert_eq!(statuses[0], reqwest::StatusCode::NOT_FOUND);
        assert_eq!(statuses[2], reqwest::StatusCode::TOO_MANY_REQUESTS);

        // Unlimited routes stay reachable
        let health = client.get(format!("{}/health", url)).send().await.unwrap();
        assert!(health.status().is_success());
    }

    fn loopback_rendezvous(url: &str) -> Arc<dyn PeerNetwork> {
        Arc::new(
            RendezvousNetwork::new(url)
                .unwrap()
                .with_bind_addr("127.0.0.1:0".parse().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_reset_after_cancelled_serve_withdraws_registration() {
        let (url, storage) = spawn_relay(RelayConfig::default()).await;
        let now = || chrono::Utc::now().timestamp();

        let mut responder = TransferSession::new(loopback_rendezvous(&url));
        responder.publish().await.unwrap();
        assert_eq!(storage.active_count(now()).unwrap(), 1);

        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            responder.serve("payload"),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(storage.active_count(now()).unwrap(), 1);

        responder.reset().await;
        assert_eq!(responder.status(), PeerStatus::Idle);
        assert_eq!(storage.active_count(now()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropped_session_withdraws_registration() {
        let (url, storage) = spawn_relay(RelayConfig::default()).await;
        let now = || chrono::Utc::now().timestamp();

        let mut responder = TransferSession::new(loopback_rendezvous(&url));
        responder.publish().await.unwrap();
        drop(responder);

        let mut active = 1;
        for _ in 0..50 {
            active = storage.active_count(now()).unwrap();
            if active == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(active, 0);
    }

    #[tokio::test]
    async fn test_backup_transfer_through_relay() {
        let (url, _) = spawn_relay(RelayConfig::default()).await;

        let source = MemoryStore::new();
        let record = SecretRecord {
            id: "1".to_string(),
            secret: "AAAAAAAAAAAAAAAA".to_string(),
            title: "GitHub".to_string(),
            description: "admin@example.com".to_string(),
            order: 0,
        };
        source.put("1", &record).await.unwrap();

        let mut responder = TransferSession::new(loopback_rendezvous(&url));
        let uri = responder.publish().await.unwrap();
        assert!(uri.starts_with("rtc://"));

        let sender = tokio::spawn(async move {
            let sent = responder.send_backup(&source).await.unwrap();
            (sent, responder.status())
        });

        let target = MemoryStore::new();
        let mut initiator = TransferSession::new(loopback_rendezvous(&url));
        let imported = initiator.receive_backup(&target, &uri).await.unwrap();

        let (sent, responder_status) = sender.await.unwrap();
        assert_eq!((sent, imported), (1, 1));
        assert_eq!(responder_status, PeerStatus::Disconnected);
        assert_eq!(initiator.status(), PeerStatus::Disconnected);
        assert_eq!(target.get("1").await.unwrap().unwrap(), record);
    }
}
