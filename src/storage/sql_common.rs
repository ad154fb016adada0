//! Shared helpers for SQL storage backends

use crate::model::CredentialKind;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Attempts made for an upsert that loses a uniqueness or lock race
pub const UPSERT_MAX_ATTEMPTS: usize = 5;
const UPSERT_BACKOFF_BASE_MS: u64 = 20;

#[inline]
pub fn parse_credential_kind(s: &str) -> Option<CredentialKind> {
    match s {
        "oauth_token" => Some(CredentialKind::OAuthToken),
        "static_config" => Some(CredentialKind::StaticConfig),
        _ => None,
    }
}

#[inline]
pub fn millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

#[inline]
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

#[inline]
pub fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

/// Treat blank strings as absent so they never overwrite stored values
#[inline]
pub fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Whether an error is a transient conflict worth retrying
///
/// Covers unique-constraint races between concurrent inserts and SQLite
/// `SQLITE_BUSY` / `SQLITE_LOCKED` contention.
pub fn is_retryable_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() {
                return true;
            }
            // SQLITE_BUSY, SQLITE_LOCKED and SQLITE_BUSY_SNAPSHOT
            if matches!(db.code().as_deref(), Some("5" | "6" | "517")) {
                return true;
            }
            let message = db.message().to_lowercase();
            message.contains("database is locked") || message.contains("database table is locked")
        }
        _ => false,
    }
}

/// Exponential delay before retry `attempt` (1-based): 20ms, 40ms, 80ms, ...
pub fn upsert_backoff(attempt: usize) -> Duration {
    let exponent = attempt.saturating_sub(1).min(6) as u32;
    Duration::from_millis(UPSERT_BACKOFF_BASE_MS << exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_kind_round_names() {
        assert_eq!(
            parse_credential_kind(CredentialKind::OAuthToken.as_str()),
            Some(CredentialKind::OAuthToken)
        );
        assert_eq!(
            parse_credential_kind(CredentialKind::StaticConfig.as_str()),
            Some(CredentialKind::StaticConfig)
        );
        assert_eq!(parse_credential_kind("password"), None);
    }

    #[test]
    fn test_upsert_backoff_doubles() {
        assert_eq!(upsert_backoff(1), Duration::from_millis(20));
        assert_eq!(upsert_backoff(2), Duration::from_millis(40));
        assert_eq!(upsert_backoff(4), Duration::from_millis(160));
        assert_eq!(upsert_backoff(50), upsert_backoff(7));
    }

    #[test]
    fn test_non_blank() {
        assert_eq!(non_blank(&Some("  high ".to_string())), Some("high"));
        assert_eq!(non_blank(&Some("   ".to_string())), None);
        assert_eq!(non_blank(&None), None);
    }
}
