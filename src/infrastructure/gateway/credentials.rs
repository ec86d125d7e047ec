use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Duration, Utc};

/// The gateway stamps requests in East Africa Time.
const GATEWAY_UTC_OFFSET_HOURS: i64 = 3;

/// `YYYYMMDDHHMMSS` in gateway local time.
pub fn timestamp(now: DateTime<Utc>) -> String {
    (now.naive_utc() + Duration::hours(GATEWAY_UTC_OFFSET_HOURS))
        .format("%Y%m%d%H%M%S")
        .to_string()
}

/// STK push password: `base64(shortcode + passkey + timestamp)`.
pub fn password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{shortcode}{passkey}{timestamp}"))
}

/// HTTP basic credentials for the OAuth endpoint.
pub fn basic_auth(consumer_key: &str, consumer_secret: &str) -> String {
    format!(
        "Basic {}",
        STANDARD.encode(format!("{consumer_key}:{consumer_secret}"))
    )
}
