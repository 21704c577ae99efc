//! Connect retry policy and failure classification.
//!
//! Only the initial connection is ever retried. A credential rejection
//! is terminal: scheduling another attempt would hot-loop against a
//! broken credential and hammer a remote database.

use std::time::Duration;

use super::Dialect;

/// What a failed connection attempt means for the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network/timeout class; retry with backoff up to the ceiling
    Retryable,
    /// Authentication rejected; never retry
    Credential,
}

/// Bounded backoff: `min(max_delay, base * (attempt + 1))`
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay before retrying `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base.saturating_mul(attempt.saturating_add(1));
        scaled.min(self.max_delay)
    }
}

/// Classify a connection error for the retry loop
pub fn classify(dialect: Dialect, err: &sqlx::Error) -> FailureClass {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code();
            let mysql_number = db
                .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                .map(|e| e.number());
            classify_parts(dialect, code.as_deref(), mysql_number, db.message())
        }
        other => classify_parts(dialect, None, None, &other.to_string()),
    }
}

fn classify_parts(
    dialect: Dialect,
    code: Option<&str>,
    mysql_number: Option<u16>,
    message: &str,
) -> FailureClass {
    let credential_code = match dialect {
        // ER_ACCESS_DENIED_ERROR / ER_DBACCESS_DENIED_ERROR, SQLSTATE 28000
        Dialect::MySql => matches!(mysql_number, Some(1044) | Some(1045)) || code == Some("28000"),
        // invalid_password / invalid_authorization_specification
        Dialect::Postgres => matches!(code, Some("28P01") | Some("28000")),
    };
    if credential_code {
        return FailureClass::Credential;
    }

    let lower = message.to_lowercase();
    if lower.contains("access denied")
        || lower.contains("password authentication failed")
        || lower.contains("authentication failed")
    {
        return FailureClass::Credential;
    }

    FailureClass::Retryable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_is_monotonic_and_capped() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 0..40 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= previous, "delay shrank at attempt {attempt}");
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(30), Duration::from_secs(30));
    }

    #[test]
    fn test_mysql_access_denied_is_terminal() {
        assert_eq!(
            classify_parts(
                Dialect::MySql,
                Some("28000"),
                Some(1045),
                "Access denied for user 'root'@'localhost' (using password: YES)"
            ),
            FailureClass::Credential
        );
    }

    #[test]
    fn test_postgres_invalid_password_is_terminal() {
        assert_eq!(
            classify_parts(
                Dialect::Postgres,
                Some("28P01"),
                None,
                "password authentication failed for user \"postgres\""
            ),
            FailureClass::Credential
        );
    }

    #[test]
    fn test_message_pattern_fallback() {
        assert_eq!(
            classify_parts(Dialect::Postgres, None, None, "FATAL: password authentication failed"),
            FailureClass::Credential
        );
    }

    #[test]
    fn test_network_errors_are_retryable() {
        assert_eq!(
            classify_parts(Dialect::MySql, None, None, "Connection refused (os error 111)"),
            FailureClass::Retryable
        );
        assert_eq!(
            classify_parts(Dialect::Postgres, Some("57P03"), None, "the database system is starting up"),
            FailureClass::Retryable
        );
    }
}
