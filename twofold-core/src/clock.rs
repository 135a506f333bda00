//! Clock-offset estimation against a time authority.
//!
//! The offset is advisory: it aligns the code rollover display with the
//! authority's clock. Convention used throughout: the corrected time is
//! `local_now + offset_ms + latency_ms`, i.e. the full round-trip latency is
//! folded in on top of `server_time - t0`.

use crate::{Result, TwofoldError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default bound on a single time-authority request.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval between re-measurements.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Source of the local wall-clock time in Unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// The operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to. Used for deterministic tests and
/// simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Something that can answer "what time is it?" authoritatively.
#[async_trait]
pub trait TimeAuthority: Send + Sync {
    /// Authoritative Unix time in milliseconds.
    async fn fetch_time_ms(&self) -> Result<i64>;
}

/// Measured correction between the authority and the local clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockOffset {
    /// `server_time - t0`
    pub offset_ms: i64,
    /// `t1 - t0`
    pub latency_ms: i64,
    /// Local time at which the sample completed; 0 for the fallback value.
    pub measured_at_ms: i64,
}

impl ClockOffset {
    /// Trust the local clock.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Total correction added to the local clock.
    pub fn correction_ms(&self) -> i64 {
        self.offset_ms + self.latency_ms
    }

    pub fn is_fallback(&self) -> bool {
        self.measured_at_ms == 0
    }
}

/// Take one sample from `authority`, bounded by `timeout`.
pub async fn measure_offset(
    authority: &dyn TimeAuthority,
    clock: &dyn Clock,
    timeout: Duration,
) -> Result<ClockOffset> {
    let t0 = clock.now_ms();
    let server_ms = tokio::time::timeout(timeout, authority.fetch_time_ms())
        .await
        .map_err(|_| {
            TwofoldError::Network(format!(
                "Time authority did not answer within {} ms",
                timeout.as_millis()
            ))
        })??;
    let t1 = clock.now_ms();

    let offset = ClockOffset {
        offset_ms: server_ms - t0,
        latency_ms: (t1 - t0).max(0),
        measured_at_ms: t1,
    };
    debug!(
        offset_ms = offset.offset_ms,
        latency_ms = offset.latency_ms,
        "Measured clock offset"
    );
    Ok(offset)
}

/// Owned clock-correction context.
///
/// Create one per session, call [`ClockSync::refresh`] at startup and on a
/// timer, and hand it to anything that needs corrected time. It also
/// implements [`Clock`], yielding corrected time.
pub struct ClockSync {
    authority: Arc<dyn TimeAuthority>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    offset: RwLock<ClockOffset>,
}

impl ClockSync {
    pub fn new(authority: Arc<dyn TimeAuthority>, clock: Arc<dyn Clock>) -> Self {
        Self::with_timeout(authority, clock, DEFAULT_FETCH_TIMEOUT)
    }

    pub fn with_timeout(
        authority: Arc<dyn TimeAuthority>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            authority,
            clock,
            timeout,
            offset: RwLock::new(ClockOffset::zero()),
        }
    }

    /// Re-measure the offset. On failure the offset falls back to zero and
    /// the error is only logged.
    pub async fn refresh(&self) -> ClockOffset {
        let measured = match measure_offset(self.authority.as_ref(), self.clock.as_ref(), self.timeout).await {
            Ok(offset) => {
                info!(
                    "Time offset updated: {}ms (latency {}ms)",
                    offset.offset_ms, offset.latency_ms
                );
                offset
            }
            Err(e) => {
                warn!("Failed to measure time offset, trusting local clock: {}", e);
                ClockOffset::zero()
            }
        };

        match self.offset.write() {
            Ok(mut guard) => *guard = measured,
            Err(poisoned) => *poisoned.into_inner() = measured,
        }
        measured
    }

    /// The current correction.
    pub fn offset(&self) -> ClockOffset {
        match self.offset.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Local time plus the measured correction.
    pub fn corrected_now_ms(&self) -> i64 {
        self.clock.now_ms() + self.offset().correction_ms()
    }

    /// Whether the last successful sample is older than `interval` (or there
    /// never was one).
    pub fn needs_refresh(&self, interval: Duration) -> bool {
        let offset = self.offset();
        if offset.is_fallback() {
            return true;
        }
        self.clock.now_ms() - offset.measured_at_ms >= interval.as_millis() as i64
    }
}

impl Clock for ClockSync {
    fn now_ms(&self) -> i64 {
        self.corrected_now_ms()
    }
}

/// Re-measure `sync` every `interval` on a background task. The first
/// measurement happens immediately.
pub fn spawn_refresh_loop(sync: Arc<ClockSync>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        loop {
            timer.tick().await;
            sync.refresh().await;
        }
    })
}

#[cfg(feature = "net")]
pub use http::HttpTimeAuthority;

#[cfg(feature = "net")]
mod http {
    use super::TimeAuthority;
    use crate::{Result, TwofoldError};
    use async_trait::async_trait;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct TimeResponse {
        time: Option<String>,
        unix_ms: Option<i64>,
    }

    /// Time authority served by the relay at `GET /api/v1/time`.
    pub struct HttpTimeAuthority {
        client: reqwest::Client,
        url: String,
    }

    impl HttpTimeAuthority {
        pub fn new(relay_url: &str) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(super::DEFAULT_FETCH_TIMEOUT)
                .build()
                .map_err(|e| TwofoldError::Network(e.to_string()))?;

            Ok(Self {
                client,
                url: format!("{}/api/v1/time", relay_url.trim_end_matches('/')),
            })
        }
    }

    #[async_trait]
    impl TimeAuthority for HttpTimeAuthority {
        async fn fetch_time_ms(&self) -> Result<i64> {
            let resp = self
                .client
                .get(&self.url)
                .header("Cache-Control", "no-cache")
                .send()
                .await
                .map_err(|e| TwofoldError::Network(e.to_string()))?;

            if !resp.status().is_success() {
                return Err(TwofoldError::Network(format!(
                    "Time authority returned {}",
                    resp.status()
                )));
            }

            let body: TimeResponse = resp
                .json()
                .await
                .map_err(|e| TwofoldError::Network(format!("Invalid time response: {}", e)))?;

            parse_time_response(body)
        }
    }

    fn parse_time_response(body: TimeResponse) -> Result<i64> {
        if let Some(ms) = body.unix_ms {
            return Ok(ms);
        }
        let time = body
            .time
            .ok_or_else(|| TwofoldError::Network("Time response has no timestamp".to_string()))?;
        chrono::DateTime::parse_from_rfc3339(&time)
            .map(|t| t.timestamp_millis())
            .map_err(|e| TwofoldError::Network(format!("Invalid time '{}': {}", time, e)))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_prefers_unix_ms() {
            let body = TimeResponse {
                time: Some("2020-01-01T00:00:00Z".to_string()),
                unix_ms: Some(42),
            };
            assert_eq!(parse_time_response(body).unwrap(), 42);
        }

        #[test]
        fn test_parse_rfc3339() {
            let body = TimeResponse {
                time: Some("2020-01-01T00:00:00.250Z".to_string()),
                unix_ms: None,
            };
            assert_eq!(parse_time_response(body).unwrap(), 1_577_836_800_250);
        }

        #[test]
        fn test_parse_missing_time() {
            let body = TimeResponse {
                time: None,
                unix_ms: None,
            };
            assert!(parse_time_response(body).is_err());
        }

        #[test]
        fn test_url_is_normalized() {
            let authority = HttpTimeAuthority::new("http://localhost:8743/").unwrap();
            assert_eq!(authority.url, "http://localhost:8743/api/v1/time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Authority whose clock runs `skew_ms` ahead of `clock` and which takes
    /// `latency_ms` of local time to answer.
    struct SkewedAuthority {
        clock: Arc<ManualClock>,
        skew_ms: i64,
        latency_ms: i64,
    }

    #[async_trait]
    impl TimeAuthority for SkewedAuthority {
        async fn fetch_time_ms(&self) -> Result<i64> {
            let server = self.clock.now_ms() + self.skew_ms;
            self.clock.advance(self.latency_ms);
            Ok(server)
        }
    }

    struct FailingAuthority;

    #[async_trait]
    impl TimeAuthority for FailingAuthority {
        async fn fetch_time_ms(&self) -> Result<i64> {
            Err(TwofoldError::Network("unreachable".to_string()))
        }
    }

    struct HangingAuthority;

    #[async_trait]
    impl TimeAuthority for HangingAuthority {
        async fn fetch_time_ms(&self) -> Result<i64> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_measure_offset() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let authority = SkewedAuthority {
            clock: clock.clone(),
            skew_ms: 2_500,
            latency_ms: 120,
        };

        let offset = measure_offset(&authority, clock.as_ref(), DEFAULT_FETCH_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(offset.offset_ms, 2_500);
        assert_eq!(offset.latency_ms, 120);
        assert_eq!(offset.measured_at_ms, 1_000_120);
        assert_eq!(offset.correction_ms(), 2_620);
    }

    #[tokio::test]
    async fn test_corrected_now_applies_offset_and_latency() {
        let clock = Arc::new(ManualClock::new(5_000_000));
        let authority = Arc::new(SkewedAuthority {
            clock: clock.clone(),
            skew_ms: -1_000,
            latency_ms: 50,
        });
        let sync = ClockSync::new(authority, clock.clone());

        assert_eq!(sync.corrected_now_ms(), 5_000_000);
        sync.refresh().await;

        clock.set(6_000_000);
        assert_eq!(sync.corrected_now_ms(), 6_000_000 - 1_000 + 50);
        assert_eq!(sync.now_ms(), sync.corrected_now_ms());
    }

    #[tokio::test]
    async fn test_refresh_falls_back_to_zero() {
        let clock = Arc::new(ManualClock::new(1_000));
        let sync = ClockSync::new(Arc::new(FailingAuthority), clock.clone());

        let offset = sync.refresh().await;
        assert_eq!(offset, ClockOffset::zero());
        assert_eq!(sync.corrected_now_ms(), 1_000);
        assert!(sync.needs_refresh(DEFAULT_REFRESH_INTERVAL));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_authority_times_out() {
        let clock = SystemClock;
        let err = measure_offset(&HangingAuthority, &clock, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TwofoldError::Network(_)));
    }

    #[tokio::test]
    async fn test_needs_refresh_after_interval() {
        let clock = Arc::new(ManualClock::new(10_000));
        let authority = Arc::new(SkewedAuthority {
            clock: clock.clone(),
            skew_ms: 0,
            latency_ms: 0,
        });
        let sync = ClockSync::new(authority, clock.clone());
        sync.refresh().await;

        assert!(!sync.needs_refresh(Duration::from_secs(60)));
        clock.advance(60_000);
        assert!(sync.needs_refresh(Duration::from_secs(60)));
    }
}
