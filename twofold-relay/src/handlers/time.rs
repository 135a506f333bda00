//! Time authority handler.

use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct TimeResponse {
    /// RFC 3339 with millisecond precision.
    pub time: String,
    pub unix_ms: i64,
}

pub async fn current_time() -> impl IntoResponse {
    let now = Utc::now();
    (
        [(header::CACHE_CONTROL, "no-store")],
        Json(TimeResponse {
            time: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            unix_ms: now.timestamp_millis(),
        }),
    )
}
