//! Twofold Core Library
//!
//! This library provides the engine behind the Twofold authenticator:
//! TOTP code generation, clock-offset estimation, the 30-second cycle
//! scheduler, the secret store contract, the backup codec and the
//! peer-to-peer transfer protocol.

pub mod backup;
pub mod clock;
pub mod ids;
pub mod platform;
pub mod scheduler;
pub mod secrets;
pub mod store;
pub mod totp;
pub mod transfer;

pub use backup::{decode, encode, export_records, import_data, FormatError};
pub use clock::{Clock, ClockOffset, ClockSync, SystemClock, TimeAuthority};
pub use ids::SnowflakeGenerator;
pub use platform::{get_config_dir, get_data_dir, get_default_config_path, get_default_store_path};
pub use scheduler::{remaining, CycleScheduler, Tick};
pub use secrets::{AuthCodeView, SecretManager};
pub use store::{MemoryStore, SecretRecord, SecretStore, SqliteStore};
pub use totp::{generate, generate_totp_code, parse_otpauth_uri, TotpAlgorithm};
pub use transfer::{PeerRole, PeerStatus, TransferSession};

use thiserror::Error;

/// Result type for Twofold operations
pub type Result<T> = std::result::Result<T, TwofoldError>;

/// General error type for Twofold operations
#[derive(Error, Debug)]
pub enum TwofoldError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for TwofoldError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
