//! TOTP (RFC 6238) code generation and `otpauth://` provisioning URIs.

use crate::backup::FormatError;
use crate::{Result, TwofoldError};
use data_encoding::{BASE32, BASE32_NOPAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::Sha256;
use std::str::FromStr;
use tracing::warn;
use zeroize::Zeroizing;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Default time step in seconds.
pub const DEFAULT_PERIOD: u32 = 30;
/// Default number of digits in a code.
pub const DEFAULT_DIGITS: u8 = 6;

/// Supported TOTP HMAC algorithms.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TotpAlgorithm {
    #[default]
    #[serde(rename = "sha1")]
    Sha1,
    #[serde(rename = "sha256")]
    Sha256,
}

impl std::fmt::Display for TotpAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TotpAlgorithm::Sha1 => write!(f, "sha1"),
            TotpAlgorithm::Sha256 => write!(f, "sha256"),
        }
    }
}

impl FromStr for TotpAlgorithm {
    type Err = TwofoldError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sha1" => Ok(TotpAlgorithm::Sha1),
            "sha256" => Ok(TotpAlgorithm::Sha256),
            other => Err(TwofoldError::InvalidInput(format!(
                "Unsupported TOTP algorithm '{}'. Use 'sha1' or 'sha256'.",
                other
            ))),
        }
    }
}

/// Generation parameters. The default is the authenticator profile:
/// SHA-1, 6 digits, 30-second step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotpParams {
    pub algorithm: TotpAlgorithm,
    pub digits: u8,
    pub period: u32,
}

impl Default for TotpParams {
    fn default() -> Self {
        Self {
            algorithm: TotpAlgorithm::Sha1,
            digits: DEFAULT_DIGITS,
            period: DEFAULT_PERIOD,
        }
    }
}

/// Parsed provisioning data from an `otpauth://totp/...` URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTotpUri {
    pub secret_base32: String,
    pub issuer: Option<String>,
    pub account: String,
    pub algorithm: TotpAlgorithm,
    pub digits: u8,
    pub period: u32,
}

/// Generate the display code for `secret` at `now_ms` with the default profile.
///
/// Never fails: a secret that is not valid Base32 is logged and echoed back
/// unchanged, so callers can still render something. A result that is not
/// six ASCII digits means the secret is misconfigured.
pub fn generate(secret_base32: &str, now_ms: i64) -> String {
    generate_with(secret_base32, TotpParams::default(), now_ms)
}

/// Like [`generate`] with explicit parameters.
pub fn generate_with(secret_base32: &str, params: TotpParams, now_ms: i64) -> String {
    let unix_secs = now_ms.div_euclid(1000);
    match generate_totp_code(
        secret_base32,
        params.algorithm,
        params.digits,
        params.period,
        unix_secs,
    ) {
        Ok(code) => code,
        Err(e) => {
            warn!("TOTP generation failed, echoing raw key: {}", e);
            secret_base32.to_string()
        }
    }
}

/// Generate a TOTP code for the given Unix timestamp (seconds).
pub fn generate_totp_code(
    secret_base32: &str,
    algorithm: TotpAlgorithm,
    digits: u8,
    period: u32,
    timestamp: i64,
) -> Result<String> {
    if digits != 6 && digits != 8 {
        return Err(TwofoldError::InvalidInput(
            "TOTP digits must be 6 or 8".to_string(),
        ));
    }
    if period == 0 {
        return Err(TwofoldError::InvalidInput(
            "TOTP period must be greater than 0".to_string(),
        ));
    }

    let secret = decode_secret(secret_base32)?;
    let counter = (timestamp.max(0) as u64) / period as u64;
    let counter_bytes = counter.to_be_bytes();

    let digest = match algorithm {
        TotpAlgorithm::Sha1 => {
            let mut mac = HmacSha1::new_from_slice(&secret)
                .map_err(|_| TwofoldError::InvalidInput("Invalid TOTP secret".to_string()))?;
            mac.update(&counter_bytes);
            mac.finalize().into_bytes().to_vec()
        }
        TotpAlgorithm::Sha256 => {
            let mut mac = HmacSha256::new_from_slice(&secret)
                .map_err(|_| TwofoldError::InvalidInput("Invalid TOTP secret".to_string()))?;
            mac.update(&counter_bytes);
            mac.finalize().into_bytes().to_vec()
        }
    };

    if digest.len() < 20 {
        return Err(TwofoldError::InvalidInput(
            "Invalid TOTP digest length".to_string(),
        ));
    }

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    if offset + 3 >= digest.len() {
        return Err(TwofoldError::InvalidInput(
            "Invalid TOTP digest offset".to_string(),
        ));
    }

    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);

    let modulo = 10u32.pow(digits as u32);
    let code = binary % modulo;
    Ok(format!("{:0width$}", code, width = digits as usize))
}

/// Strip whitespace and dashes and uppercase a key as typed by a user.
pub fn format_totp_key(key: &str) -> String {
    key.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Validate a manually entered key: Base32 alphabet only (A-Z, 2-7) and a
/// length of 16, 32 or 64 characters. Returns the normalized key.
pub fn validate_totp_key(key: &str) -> Result<String> {
    let cleaned = format_totp_key(key);

    if cleaned.is_empty() {
        return Err(TwofoldError::InvalidInput(
            "TOTP secret cannot be empty".to_string(),
        ));
    }
    if !cleaned
        .bytes()
        .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b))
    {
        return Err(TwofoldError::InvalidInput(
            "TOTP secret may only contain letters A-Z and digits 2-7".to_string(),
        ));
    }
    if ![16, 32, 64].contains(&cleaned.len()) {
        return Err(TwofoldError::InvalidInput(
            "TOTP secret must be 16, 32 or 64 characters long".to_string(),
        ));
    }

    Ok(cleaned)
}

/// Normalize a secret and confirm it decodes as Base32.
pub fn normalize_secret(secret_base32: &str) -> Result<String> {
    let normalized = format_totp_key(secret_base32);

    if normalized.is_empty() {
        return Err(TwofoldError::InvalidInput(
            "TOTP secret cannot be empty".to_string(),
        ));
    }

    decode_secret(&normalized)?;
    Ok(normalized)
}

fn decode_secret(secret_base32: &str) -> Result<Zeroizing<Vec<u8>>> {
    let normalized = Zeroizing::new(format_totp_key(secret_base32));

    let decoded = BASE32_NOPAD
        .decode(normalized.as_bytes())
        .or_else(|_| BASE32.decode(normalized.as_bytes()))
        .map_err(|_| TwofoldError::InvalidInput("TOTP secret must be valid base32".to_string()))?;

    if decoded.is_empty() {
        return Err(TwofoldError::InvalidInput(
            "TOTP secret cannot decode to empty bytes".to_string(),
        ));
    }

    Ok(Zeroizing::new(decoded))
}

/// Parse an `otpauth://totp/...` URI (commonly embedded in QR codes).
///
/// The issuer comes from the `issuer` query parameter when present and
/// otherwise from the label prefix before `:`.
pub fn parse_otpauth_uri(uri: &str) -> Result<ParsedTotpUri> {
    let invalid = |reason: &str| TwofoldError::Format(FormatError::InvalidUri(reason.to_string()));

    let trimmed = uri.trim();
    let (scheme, rest) = trimmed
        .split_once("://")
        .ok_or_else(|| invalid("TOTP URI must start with otpauth://"))?;
    if !scheme.eq_ignore_ascii_case("otpauth") {
        return Err(invalid("TOTP URI must start with otpauth://"));
    }

    let (kind, remainder) = rest
        .split_once('/')
        .ok_or_else(|| invalid("Invalid otpauth URI format"))?;
    if !kind.eq_ignore_ascii_case("totp") {
        return Err(invalid("Only otpauth://totp URIs are supported"));
    }

    let (label_raw, query_raw) = remainder.split_once('?').unwrap_or((remainder, ""));

    let label = percent_decode(label_raw)?;
    let (issuer_from_label, account) = match label.split_once(':') {
        Some((issuer, account)) => {
            let issuer = issuer.trim();
            (
                (!issuer.is_empty()).then(|| issuer.to_string()),
                account.trim().to_string(),
            )
        }
        None => (None, label.trim().to_string()),
    };

    let mut secret_base32 = None;
    let mut issuer_from_query = None;
    let mut params = TotpParams::default();

    for pair in query_raw.split('&').filter(|part| !part.is_empty()) {
        let (key_raw, value_raw) = pair.split_once('=').unwrap_or((pair, ""));
        let key = percent_decode(key_raw)?.to_ascii_lowercase();
        let value = percent_decode(value_raw)?;
        if value.trim().is_empty() {
            continue;
        }

        match key.as_str() {
            "secret" => secret_base32 = Some(value),
            "issuer" => issuer_from_query = Some(value.trim().to_string()),
            "algorithm" => params.algorithm = value.parse::<TotpAlgorithm>()?,
            "digits" => {
                params.digits = value
                    .trim()
                    .parse::<u8>()
                    .map_err(|_| invalid("TOTP digits must be numeric"))?;
            }
            "period" => {
                params.period = value
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| invalid("TOTP period must be numeric"))?;
            }
            _ => {}
        }
    }

    if params.digits != 6 && params.digits != 8 {
        return Err(invalid("TOTP digits must be 6 or 8"));
    }
    if params.period == 0 {
        return Err(invalid("TOTP period must be greater than 0"));
    }

    let secret = secret_base32.ok_or_else(|| invalid("TOTP URI is missing secret parameter"))?;
    let secret = normalize_secret(&secret)?;

    Ok(ParsedTotpUri {
        secret_base32: secret,
        issuer: issuer_from_query.or(issuer_from_label),
        account,
        algorithm: params.algorithm,
        digits: params.digits,
        period: params.period,
    })
}

pub(crate) fn percent_decode(input: &str) -> Result<String> {
    fn from_hex(byte: u8) -> Option<u8> {
        match byte {
            b'0'..=b'9' => Some(byte - b'0'),
            b'a'..=b'f' => Some(byte - b'a' + 10),
            b'A'..=b'F' => Some(byte - b'A' + 10),
            _ => None,
        }
    }

    let malformed = || {
        TwofoldError::Format(FormatError::InvalidUri(
            "Invalid percent encoding".to_string(),
        ))
    };

    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if i + 2 >= bytes.len() {
                    return Err(malformed());
                }
                let hi = from_hex(bytes[i + 1]).ok_or_else(malformed)?;
                let lo = from_hex(bytes[i + 2]).ok_or_else(malformed)?;
                out.push((hi << 4) | lo);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }

    String::from_utf8(out).map_err(|_| {
        TwofoldError::Format(FormatError::InvalidUri(
            "Percent-decoded text is not valid UTF-8".to_string(),
        ))
    })
}
