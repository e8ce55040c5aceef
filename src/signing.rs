use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const EVENT_ID_HEADER: &str = "X-Event-Id";
pub const DEFAULT_TOLERANCE_MINUTES: u64 = 30;

fn keyed_mac(secret: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(secret).expect("HMAC-SHA256 accepts keys of any length")
}

fn canonical_message(payload: &[u8], timestamp_secs: i64) -> Vec<u8> {
    let mut data = format!("{timestamp_secs}.").into_bytes();
    data.extend_from_slice(payload);
    data
}

/// Hex HMAC-SHA256 of `"{timestamp}.{payload}"`.
pub fn sign(payload: &[u8], secret: &[u8], timestamp_secs: i64) -> String {
    let mut mac = keyed_mac(secret);
    mac.update(&canonical_message(payload, timestamp_secs));
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex signature against the canonical message.
pub fn verify_signature(payload: &[u8], secret: &[u8], timestamp_secs: i64, signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = keyed_mac(secret);
    mac.update(&canonical_message(payload, timestamp_secs));
    mac.verify_slice(&signature).is_ok()
}

/// `t=<timestamp>,v1=<signature>`
pub fn signature_header_value(timestamp_secs: i64, signature: &str) -> String {
    format!("t={timestamp_secs},v1={signature}")
}

/// Headers attached to every outbound partner delivery.
pub fn build_webhook_headers(
    body: &[u8],
    secret: &[u8],
    event_id: &str,
    timestamp_secs: i64,
) -> Vec<(&'static str, String)> {
    let signature = sign(body, secret, timestamp_secs);
    vec![
        ("Content-Type", "application/json".to_string()),
        (SIGNATURE_HEADER, signature_header_value(timestamp_secs, &signature)),
        (EVENT_ID_HEADER, event_id.to_string()),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    pub timestamp: String,
    pub signatures: Vec<String>,
}

/// Parse an `X-Signature` value. Multiple `v1` entries are allowed so a
/// sender can sign with an old and a new secret during rotation.
pub fn parse_signature_header(value: &str) -> Option<ParsedSignature> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in value.split(',') {
        let Some((key, val)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = Some(val.to_string()),
            "v1" => signatures.push(val.to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp?;
    if signatures.is_empty() {
        return None;
    }
    Some(ParsedSignature { timestamp, signatures })
}

/// Verify a full `t=..,v1=..` header against the payload.
pub fn verify_header(header_value: &str, payload: &[u8], secret: &[u8]) -> bool {
    let Some(parsed) = parse_signature_header(header_value) else {
        return false;
    };
    let Ok(timestamp) = parsed.timestamp.parse::<i64>() else {
        return false;
    };
    parsed
        .signatures
        .iter()
        .any(|sig| verify_signature(payload, secret, timestamp, sig))
}

/// Raw timestamp as received, either a header string or a JSON number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimestampValue<'a> {
    Text(&'a str),
    Number(i64),
}

impl<'a> From<&'a str> for TimestampValue<'a> {
    fn from(value: &'a str) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for TimestampValue<'_> {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampError {
    Missing,
    Invalid,
    OutsideWindow,
}

impl TimestampError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Invalid => "invalid",
            Self::OutsideWindow => "outside_window",
        }
    }
}

/// Replay-window check shared by inbound provider webhooks and outbound
/// partner signatures.
///
/// Accepts ISO-8601 (zoneless values are read as UTC), 10-digit epoch
/// seconds and 13-digit epoch milliseconds.
pub fn validate_timestamp<'a>(
    value: Option<TimestampValue<'a>>,
    now: DateTime<Utc>,
    tolerance: Duration,
) -> Result<DateTime<Utc>, TimestampError> {
    let parsed = match value {
        None => return Err(TimestampError::Missing),
        Some(TimestampValue::Text(text)) if text.trim().is_empty() => {
            return Err(TimestampError::Missing)
        }
        Some(TimestampValue::Text(text)) => parse_text_timestamp(text.trim()),
        Some(TimestampValue::Number(n)) => parse_numeric_timestamp(n),
    }
    .ok_or(TimestampError::Invalid)?;

    if (now - parsed).abs() > tolerance {
        return Err(TimestampError::OutsideWindow);
    }
    Ok(parsed)
}

/// Negative epochs are rejected like non-digit text.
fn parse_numeric_timestamp(value: i64) -> Option<DateTime<Utc>> {
    let digits = u64::try_from(value).ok()?.checked_ilog10().map_or(1, |d| d as usize + 1);
    from_epoch_digits(value, digits)
}

fn parse_text_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if value.bytes().all(|b| b.is_ascii_digit()) {
        let n: i64 = value.parse().ok()?;
        return from_epoch_digits(n, value.len());
    }
    parse_iso_timestamp(value)
}

fn from_epoch_digits(n: i64, digits: usize) -> Option<DateTime<Utc>> {
    match digits {
        10 => Utc.timestamp_opt(n, 0).single(),
        13 => Utc.timestamp_millis_opt(n).single(),
        _ => None,
    }
}

fn has_zone(value: &str) -> bool {
    if value.ends_with('Z') || value.ends_with('z') {
        return true;
    }
    let bytes = value.as_bytes();
    let is_sign = |b: u8| b == b'+' || b == b'-';
    let digits = |s: &[u8]| s.iter().all(u8::is_ascii_digit);

    // +HH:MM
    if bytes.len() >= 6 {
        let tail = &bytes[bytes.len() - 6..];
        if is_sign(tail[0]) && digits(&tail[1..3]) && tail[3] == b':' && digits(&tail[4..]) {
            return true;
        }
    }
    // +HHMM, only after a time component
    if bytes.len() >= 5 && value.contains('T') {
        let tail = &bytes[bytes.len() - 5..];
        if is_sign(tail[0]) && digits(&tail[1..]) {
            return true;
        }
    }
    false
}

fn parse_iso_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let normalized = if value.contains('T') {
        value.to_string()
    } else {
        value.replacen(' ', "T", 1)
    };

    if has_zone(&normalized) {
        return DateTime::parse_from_rfc3339(&normalized)
            .or_else(|_| DateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f%z"))
            .or_else(|_| DateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M%z"))
            .ok()
            .map(|dt| dt.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    MalformedSignature,
    Timestamp(TimestampError),
    InvalidSignature,
}

/// Verify an incoming signed webhook in one call: header presence, replay
/// window, then the HMAC itself.
pub fn verify_signed_request<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &[u8],
    now: DateTime<Utc>,
    tolerance: Duration,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let header_value = headers
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(SIGNATURE_HEADER))
        .map(|(_, value)| value)
        .ok_or(VerificationError::MissingSignature)?;

    let parsed = parse_signature_header(header_value).ok_or(VerificationError::MalformedSignature)?;

    validate_timestamp(Some(TimestampValue::Text(&parsed.timestamp)), now, tolerance)
        .map_err(VerificationError::Timestamp)?;

    let timestamp: i64 = parsed
        .timestamp
        .parse()
        .map_err(|_| VerificationError::Timestamp(TimestampError::Invalid))?;

    if parsed
        .signatures
        .iter()
        .any(|sig| verify_signature(payload, secret, timestamp, sig))
    {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}
