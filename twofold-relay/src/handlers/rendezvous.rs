//! Rendezvous registry handlers.
//!
//! A listening peer announces its address under a single-use id; the
//! connecting peer resolves it exactly once. Only ids and addresses pass
//! through here.

use crate::error::RelayError;
use crate::server::AppState;
use crate::storage::models::Registration;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

const MAX_PEER_ID_LEN: usize = 64;
const MIN_TICKET_LEN: usize = 16;
const MAX_TICKET_LEN: usize = 128;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub peer_id: String,
    pub addr: String,
    pub ticket: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub peer_id: String,
    pub addr: String,
    pub ticket: String,
    pub expires_at: i64,
}

impl From<Registration> for RegistrationResponse {
    fn from(registration: Registration) -> Self {
        Self {
            peer_id: registration.peer_id,
            addr: registration.addr,
            ticket: registration.ticket,
            expires_at: registration.expires_at,
        }
    }
}

fn validate_peer_id(peer_id: &str) -> Result<(), RelayError> {
    if peer_id.is_empty() || peer_id.len() > MAX_PEER_ID_LEN {
        return Err(RelayError::BadRequest(format!(
            "Peer id must be 1 to {} characters",
            MAX_PEER_ID_LEN
        )));
    }
    if !peer_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(RelayError::BadRequest(
            "Peer id must be alphanumeric".to_string(),
        ));
    }
    Ok(())
}

fn validate_ticket(ticket: &str) -> Result<(), RelayError> {
    let valid_len = (MIN_TICKET_LEN..=MAX_TICKET_LEN).contains(&ticket.len());
    if !valid_len || !ticket.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(RelayError::BadRequest(format!(
            "Ticket must be {} to {} alphanumeric characters",
            MIN_TICKET_LEN, MAX_TICKET_LEN
        )));
    }
    Ok(())
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegistrationResponse>), RelayError> {
    validate_peer_id(&req.peer_id)?;
    validate_ticket(&req.ticket)?;
    let addr: SocketAddr = req
        .addr
        .parse()
        .map_err(|_| RelayError::BadRequest(format!("Invalid address {}", req.addr)))?;

    let registration = state.storage.register(
        &req.peer_id,
        &addr.to_string(),
        &req.ticket,
        Utc::now().timestamp(),
        state.rendezvous_ttl_secs,
        state.max_active_registrations,
    )?;
    tracing::info!(
        "Registered peer {} (expires at {})",
        registration.peer_id,
        registration.expires_at
    );

    Ok((StatusCode::CREATED, Json(registration.into())))
}

pub async fn resolve(
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
) -> Result<Json<RegistrationResponse>, RelayError> {
    validate_peer_id(&peer_id)?;

    let registration = state
        .storage
        .take(&peer_id, Utc::now().timestamp())?
        .ok_or_else(|| RelayError::NotFound("Peer not found or expired".to_string()))?;
    tracing::info!("Resolved peer {}", peer_id);

    Ok(Json(registration.into()))
}

pub async fn withdraw(
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
) -> Result<StatusCode, RelayError> {
    validate_peer_id(&peer_id)?;

    if state.storage.withdraw(&peer_id)? {
        tracing::debug!("Withdrew peer {}", peer_id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(RelayError::NotFound("Peer not found".to_string()))
    }
}
