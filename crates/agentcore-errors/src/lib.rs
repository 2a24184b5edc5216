//! Error taxonomy shared across the coordination core.
//!
//! Every subsystem in this workspace reports failures through [`CoreError`]
//! rather than ad-hoc error types, so that the wire shape returned to a
//! caller is identical no matter which component raised it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Broad class of failure. Used internally to decide retry eligibility and
/// as a fallback HTTP mapping; not part of the wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Authentication,
    Authorization,
    Validation,
    Resource,
    Integration,
    System,
    RateLimit,
}

/// Operational severity, surfaced on the wire as an upper-case string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorSeverity {
    Critical,
    Error,
    Warning,
    Info,
}

/// Which subsystem raised the error. Kept deliberately small: it names the
/// coordination-core components, not every module in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Component {
    Auth,
    Orchestrator,
    RateLimiter,
    CircuitBreaker,
    Integration,
    System,
}

/// Dotted error codes. Grouped by category, mirroring the taxonomy these
/// subsystems were built against.
pub mod codes {
    pub const AUTH_INVALID_TOKEN: &str = "AUTH.AUTHENTICATION.INVALID_TOKEN";
    pub const AUTH_EXPIRED_TOKEN: &str = "AUTH.AUTHENTICATION.EXPIRED_TOKEN";
    pub const AUTH_INSUFFICIENT_SCOPE: &str = "AUTH.AUTHORIZATION.INSUFFICIENT_SCOPE";
    pub const AUTH_SUBJECT_MISMATCH: &str = "AUTH.AUTHORIZATION.SUBJECT_MISMATCH";

    pub const VALIDATION_INVALID_PARAMS: &str = "VALIDATION.INVALID_PARAMS";
    pub const VALIDATION_MISSING_FIELD: &str = "VALIDATION.MISSING_FIELD";

    pub const RESOURCE_NOT_FOUND: &str = "RESOURCE.NOT_FOUND";
    pub const RESOURCE_ALREADY_EXISTS: &str = "RESOURCE.ALREADY_EXISTS";

    pub const INTEGRATION_CONNECTION_FAILED: &str = "INTEGRATION.CONNECTION_FAILED";
    pub const INTEGRATION_TIMEOUT: &str = "INTEGRATION.TIMEOUT";

    pub const SYSTEM_INTERNAL_ERROR: &str = "SYSTEM.INTERNAL_ERROR";
    pub const SYSTEM_DEPENDENCY_FAILED: &str = "SYSTEM.DEPENDENCY_FAILED";
    pub const SYSTEM_CONFIGURATION_ERROR: &str = "SYSTEM.CONFIGURATION_ERROR";

    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT.EXCEEDED";
    pub const RATE_LIMIT_QUOTA_EXCEEDED: &str = "RATE_LIMIT.QUOTA_EXCEEDED";

    pub const ORCHESTRATOR_AGENT_NOT_FOUND: &str = "ORCHESTRATOR.RESOURCE.AGENT_NOT_FOUND";
    pub const ORCHESTRATOR_TASK_NOT_FOUND: &str = "ORCHESTRATOR.RESOURCE.TASK_NOT_FOUND";
    pub const ORCHESTRATOR_WORKFLOW_NOT_FOUND: &str = "ORCHESTRATOR.RESOURCE.WORKFLOW_NOT_FOUND";
    pub const ORCHESTRATOR_TASK_DISTRIBUTION_FAILED: &str =
        "ORCHESTRATOR.SYSTEM.TASK_DISTRIBUTION_FAILED";

    pub const CIRCUIT_BREAKER_OPEN: &str = "CIRCUIT_BREAKER.OPEN";
}

/// The error value every public API in this workspace returns.
///
/// `category` is bookkeeping used to decide retry eligibility and does not
/// appear on the wire; the wire shape is exactly the fields `code` through
/// `documentation_url`.
#[derive(Debug, Clone, Serialize)]
pub struct CoreError {
    pub code: String,
    pub message: String,
    pub details: HashMap<String, serde_json::Value>,
    pub severity: ErrorSeverity,
    pub component: Component,
    #[serde(skip)]
    pub category: ErrorCategory,
    #[serde(skip)]
    pub http_status: u16,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub documentation_url: Option<String>,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for CoreError {}

/// Wraps a [`CoreError`] in the `{"error": {...}}` envelope the wire format
/// requires.
#[derive(Serialize)]
struct Envelope<'a> {
    error: &'a CoreError,
}

impl CoreError {
    fn new(
        code: &str,
        message: impl Into<String>,
        severity: ErrorSeverity,
        category: ErrorCategory,
        component: Component,
        http_status: u16,
    ) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: HashMap::new(),
            severity,
            component,
            category,
            http_status,
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            documentation_url: None,
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = code.to_string();
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = status;
        self
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_component(mut self, component: Component) -> Self {
        self.component = component;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_documentation_url(mut self, url: impl Into<String>) -> Self {
        self.documentation_url = Some(url.into());
        self
    }

    pub fn http_status(&self) -> u16 {
        self.http_status
    }

    /// Renders the `{"error": {...}}` wire envelope.
    pub fn to_wire_json(&self) -> serde_json::Value {
        serde_json::to_value(Envelope { error: self })
            .expect("CoreError fields are all JSON-representable")
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(
            codes::AUTH_INVALID_TOKEN,
            message,
            ErrorSeverity::Error,
            ErrorCategory::Authentication,
            Component::Auth,
            401,
        )
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(
            codes::AUTH_INSUFFICIENT_SCOPE,
            message,
            ErrorSeverity::Error,
            ErrorCategory::Authorization,
            Component::Auth,
            403,
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(
            codes::VALIDATION_INVALID_PARAMS,
            message,
            ErrorSeverity::Warning,
            ErrorCategory::Validation,
            Component::System,
            400,
        )
    }

    pub fn resource_not_found(message: impl Into<String>) -> Self {
        Self::new(
            codes::RESOURCE_NOT_FOUND,
            message,
            ErrorSeverity::Warning,
            ErrorCategory::Resource,
            Component::Orchestrator,
            404,
        )
    }

    pub fn integration(message: impl Into<String>) -> Self {
        Self::new(
            codes::INTEGRATION_CONNECTION_FAILED,
            message,
            ErrorSeverity::Error,
            ErrorCategory::Integration,
            Component::Integration,
            502,
        )
    }

    pub fn integration_timeout(message: impl Into<String>) -> Self {
        Self::new(
            codes::INTEGRATION_TIMEOUT,
            message,
            ErrorSeverity::Error,
            ErrorCategory::Integration,
            Component::Integration,
            504,
        )
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(
            codes::SYSTEM_INTERNAL_ERROR,
            message,
            ErrorSeverity::Critical,
            ErrorCategory::System,
            Component::System,
            500,
        )
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_secs: u64) -> Self {
        Self::new(
            codes::RATE_LIMIT_EXCEEDED,
            message,
            ErrorSeverity::Warning,
            ErrorCategory::RateLimit,
            Component::RateLimiter,
            429,
        )
        .with_detail("retry_after", retry_after_secs)
    }

    pub fn circuit_open(breaker_name: impl Into<String>, retry_after_secs: f64) -> Self {
        let breaker_name = breaker_name.into();
        Self::new(
            codes::CIRCUIT_BREAKER_OPEN,
            format!("circuit breaker '{breaker_name}' is open"),
            ErrorSeverity::Error,
            ErrorCategory::Integration,
            Component::CircuitBreaker,
            503,
        )
        .with_detail("breaker", breaker_name)
        .with_detail("retry_after", retry_after_secs)
    }

    /// Whether this error's category is one the retry policy is willing to
    /// retry at all. Validation, authorization and resource errors are
    /// never retried: retrying them cannot change the outcome.
    pub fn is_retryable_category(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Authentication | ErrorCategory::Integration | ErrorCategory::RateLimit
        )
    }
}

/// The inputs a standard-library or third-party failure is classified from.
/// Rust has no exception hierarchy to introspect, so call sites pick the
/// matching `StandardErrorKind` explicitly instead of relying on runtime
/// type inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardErrorKind {
    ConnectionFailed,
    Timeout,
    InvalidShape,
    NotFound,
    Other,
}

/// Maps a foreign failure onto the taxonomy: connection/timeout errors
/// become `INTEGRATION.*`, shape mismatches become `VALIDATION.INVALID_PARAMS`,
/// missing-entity errors become `RESOURCE.NOT_FOUND`, everything else
/// becomes `SYSTEM.INTERNAL_ERROR`.
pub fn standard_conversion(kind: StandardErrorKind, message: impl Into<String>) -> CoreError {
    let message = message.into();
    match kind {
        StandardErrorKind::ConnectionFailed => CoreError::integration(message),
        StandardErrorKind::Timeout => CoreError::integration_timeout(message),
        StandardErrorKind::InvalidShape => CoreError::validation(message),
        StandardErrorKind::NotFound => CoreError::resource_not_found(message),
        StandardErrorKind::Other => CoreError::system(message),
    }
}

/// Logs a [`CoreError`] at the tracing level matching its severity,
/// including its request id for correlation with the response the caller
/// receives.
pub fn log_error(err: &CoreError) {
    match err.severity {
        ErrorSeverity::Critical => {
            tracing::error!(code = %err.code, request_id = %err.request_id, "{}", err.message)
        }
        ErrorSeverity::Error => {
            tracing::error!(code = %err.code, request_id = %err.request_id, "{}", err.message)
        }
        ErrorSeverity::Warning => {
            tracing::warn!(code = %err.code, request_id = %err.request_id, "{}", err.message)
        }
        ErrorSeverity::Info => {
            tracing::info!(code = %err.code, request_id = %err.request_id, "{}", err.message)
        }
    }
}

/// Exponential backoff with optional jitter, restricted to the error
/// categories worth retrying at all.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32, err: &CoreError) -> Duration {
        if let Some(retry_after) = err.details.get("retry_after").and_then(|v| v.as_f64()) {
            return Duration::from_secs_f64(retry_after.max(0.0));
        }
        let scaled = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let mut delay = Duration::from_secs_f64(scaled).min(self.max_delay);
        if self.jitter {
            let jitter_factor = 0.5 + rand::random::<f64>() * 0.5;
            delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter_factor);
        }
        delay
    }
}

/// Retries `op` under `policy`, stopping as soon as the error is not in a
/// retryable category, `op` succeeds, or retries are exhausted.
pub async fn retry_with_policy<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries || !err.is_retryable_category() {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt, &err);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_envelope_has_exactly_the_documented_fields() {
        let err = CoreError::authentication("token expired").with_code(codes::AUTH_EXPIRED_TOKEN);
        let json = err.to_wire_json();
        let inner = json.get("error").unwrap();
        let obj = inner.as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "code",
                "component",
                "details",
                "documentation_url",
                "message",
                "request_id",
                "severity",
                "timestamp",
            ]
        );
        assert_eq!(inner["code"], codes::AUTH_EXPIRED_TOKEN);
        assert_eq!(inner["severity"], "ERROR");
        assert_eq!(inner["component"], "AUTH");
    }

    #[test]
    fn rate_limited_carries_retry_after_in_details() {
        let err = CoreError::rate_limited("too many requests", 7);
        assert_eq!(err.details["retry_after"], 7);
        assert_eq!(err.http_status(), 429);
    }

    #[test]
    fn standard_conversion_maps_kinds_to_codes() {
        assert_eq!(
            standard_conversion(StandardErrorKind::Timeout, "slow").code,
            codes::INTEGRATION_TIMEOUT
        );
        assert_eq!(
            standard_conversion(StandardErrorKind::NotFound, "gone").code,
            codes::RESOURCE_NOT_FOUND
        );
        assert_eq!(
            standard_conversion(StandardErrorKind::InvalidShape, "bad").code,
            codes::VALIDATION_INVALID_PARAMS
        );
        assert_eq!(
            standard_conversion(StandardErrorKind::Other, "???").code,
            codes::SYSTEM_INTERNAL_ERROR
        );
    }

    #[test]
    fn validation_and_resource_errors_are_not_retryable() {
        assert!(!CoreError::validation("bad").is_retryable_category());
        assert!(!CoreError::resource_not_found("missing").is_retryable_category());
        assert!(CoreError::integration("down").is_retryable_category());
        assert!(CoreError::rate_limited("slow down", 1).is_retryable_category());
    }

    #[tokio::test]
    async fn retry_with_policy_stops_on_non_retryable_error() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let mut calls = 0;
        let result: Result<(), CoreError> = retry_with_policy(&policy, || {
            calls += 1;
            async { Err(CoreError::validation("nope")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retry_with_policy_retries_integration_errors_until_success() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        };
        let mut calls = 0;
        let result = retry_with_policy(&policy, || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 3 {
                    Err(CoreError::integration("connection refused"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3);
    }
}
