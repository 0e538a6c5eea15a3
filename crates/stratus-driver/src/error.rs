//! Error taxonomy and retry classification.
//!
//! The service reports failures as small integer codes in the response body;
//! codes below 50 are caller mistakes, 50-99 are throttling, 100-124 are
//! retryable server conditions and 125+ are terminal server states. Transport
//! failures are classified by inspecting the underlying [`reqwest::Error`].

use std::time::Duration;

use thiserror::Error;

/// Wire error codes, as reported by the service in response bodies.
pub mod code {
    pub const UNKNOWN_OPERATION: i32 = 1;
    pub const TABLE_NOT_FOUND: i32 = 2;
    pub const INDEX_NOT_FOUND: i32 = 3;
    pub const ILLEGAL_ARGUMENT: i32 = 4;
    pub const ROW_SIZE_LIMIT_EXCEEDED: i32 = 5;
    pub const KEY_SIZE_LIMIT_EXCEEDED: i32 = 6;
    pub const BATCH_OP_NUMBER_LIMIT_EXCEEDED: i32 = 7;
    pub const REQUEST_SIZE_LIMIT_EXCEEDED: i32 = 8;
    pub const TABLE_EXISTS: i32 = 9;
    pub const INDEX_EXISTS: i32 = 10;
    pub const INVALID_AUTHORIZATION: i32 = 11;
    pub const INSUFFICIENT_PERMISSION: i32 = 12;
    pub const BAD_PROTOCOL_MESSAGE: i32 = 17;
    pub const OPERATION_NOT_SUPPORTED: i32 = 21;
    pub const UNSUPPORTED_PROTOCOL: i32 = 24;
    pub const READ_LIMIT_EXCEEDED: i32 = 50;
    pub const WRITE_LIMIT_EXCEEDED: i32 = 51;
    pub const SIZE_LIMIT_EXCEEDED: i32 = 52;
    pub const OPERATION_LIMIT_EXCEEDED: i32 = 53;
    pub const REQUEST_TIMEOUT: i32 = 100;
    pub const SERVER_ERROR: i32 = 101;
    pub const SERVICE_UNAVAILABLE: i32 = 102;
    pub const TABLE_BUSY: i32 = 103;
    pub const SECURITY_INFO_UNAVAILABLE: i32 = 104;
    pub const RETRY_AUTHENTICATION: i32 = 105;
    pub const UNKNOWN_ERROR: i32 = 125;
    pub const ILLEGAL_STATE: i32 = 126;
}

/// All errors surfaced by the driver.
#[derive(Error, Debug)]
pub enum Error {
    /// A request or configuration value failed validation.
    #[error("illegal argument: {0}")]
    Argument(String),

    /// The provisioned read throughput of a table was exceeded.
    #[error("read throughput exceeded: {0}")]
    ReadThrottled(String),

    /// The provisioned write throughput of a table was exceeded.
    #[error("write throughput exceeded: {0}")]
    WriteThrottled(String),

    /// A non-data operation (DDL and similar) was throttled.
    #[error("operation rate exceeded: {0}")]
    OperationThrottled(String),

    /// The table is busy with another modification.
    #[error("table busy: {0}")]
    TableBusy(String),

    /// Security metadata is still propagating; retry until it is ready.
    #[error("security information not ready: {0}")]
    SecurityInfoNotReady(String),

    /// A service condition the server itself marked as retryable.
    #[error("retryable service error: {0}")]
    RetryableService(String),

    /// The named table does not exist or is not visible.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// A table with that name already exists.
    #[error("table exists: {0}")]
    TableExists(String),

    /// An index with that name already exists.
    #[error("index exists: {0}")]
    IndexExists(String),

    /// A row exceeded the system-defined size limit.
    #[error("row size limit exceeded: {0}")]
    RowSizeLimit(String),

    /// The client and server disagree about the wire format.
    #[error("bad protocol message: {0}")]
    BadProtocol(String),

    /// Authorization was rejected, or could not be produced.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The caller lacks permission for the operation.
    #[error("insufficient permission: {0}")]
    InsufficientPermission(String),

    /// Any other service-reported error code.
    #[error("service error (code {code}): {message}")]
    Service { code: i32, message: String },

    /// A non-200 HTTP status from the service endpoint.
    #[error("service responded with HTTP {status}: {message}")]
    ServiceResponse { status: u16, message: String },

    /// A transport-level failure, classified retryable when the connection
    /// was never usable (connect refused, DNS, TLS, truncated response).
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    /// The server rejected the driver's serial version. Handled internally
    /// by protocol fallback; surfaces only if fallback is disabled.
    #[error("server does not support protocol version {version}")]
    UnsupportedProtocol { version: i16 },

    /// Protocol fallback went below the minimum version an operation needs.
    #[error("operation requires protocol version {minimum}, server supports at most {current}")]
    UnsupportedProtocolVersion { minimum: i16, current: i16 },

    /// The operation did not complete within its timeout. Carries the total
    /// elapsed time and the number of retries performed.
    #[error("request timed out after {elapsed:?} ({retries} retries)")]
    Timeout {
        elapsed: Duration,
        retries: u32,
        #[source]
        cause: Option<Box<Error>>,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// A query exceeded its client-side memory budget.
    #[error("query exceeded memory budget: used {used} of {budget} bytes")]
    MemoryExceeded { used: u64, budget: u64 },

    /// Two values of incompatible types were ordered against each other.
    #[error("comparison not supported: {0}")]
    ComparisonNotSupported(String),
}

impl Error {
    /// Build an error from a wire code and message.
    pub(crate) fn from_code(code: i32, message: &str) -> Error {
        let msg = message.to_string();
        match code {
            code::ILLEGAL_ARGUMENT => Error::Argument(msg),
            code::TABLE_NOT_FOUND => Error::TableNotFound(msg),
            code::TABLE_EXISTS => Error::TableExists(msg),
            code::INDEX_EXISTS => Error::IndexExists(msg),
            code::ROW_SIZE_LIMIT_EXCEEDED => Error::RowSizeLimit(msg),
            code::BAD_PROTOCOL_MESSAGE => Error::BadProtocol(msg),
            code::UNSUPPORTED_PROTOCOL => Error::UnsupportedProtocol { version: 0 },
            code::INVALID_AUTHORIZATION | code::RETRY_AUTHENTICATION => {
                Error::Authentication(msg)
            }
            code::INSUFFICIENT_PERMISSION => Error::InsufficientPermission(msg),
            code::READ_LIMIT_EXCEEDED => Error::ReadThrottled(msg),
            code::WRITE_LIMIT_EXCEEDED => Error::WriteThrottled(msg),
            code::OPERATION_LIMIT_EXCEEDED => Error::OperationThrottled(msg),
            code::TABLE_BUSY => Error::TableBusy(msg),
            code::SECURITY_INFO_UNAVAILABLE => Error::SecurityInfoNotReady(msg),
            code::SERVER_ERROR | code::SERVICE_UNAVAILABLE => Error::RetryableService(msg),
            code::REQUEST_TIMEOUT => Error::Timeout {
                elapsed: Duration::ZERO,
                retries: 0,
                cause: Some(Box::new(Error::Service { code, message: msg })),
            },
            _ => Error::Service { code, message: msg },
        }
    }

    /// Whether the execution loop may retry after this error.
    ///
    /// Retryable: throttling, table-busy, security-info-not-ready, generic
    /// retryable service conditions, HTTP 500/502/503/504 and transport
    /// failures where the connection was never usable. Everything else,
    /// including all other 4xx responses, is fatal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ReadThrottled(_)
            | Error::WriteThrottled(_)
            | Error::OperationThrottled(_)
            | Error::TableBusy(_)
            | Error::SecurityInfoNotReady(_)
            | Error::RetryableService(_) => true,
            Error::ServiceResponse { status, .. } => {
                matches!(status, 500 | 502 | 503 | 504)
            }
            Error::Transport { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Whether this is a read or write throttling error.
    pub fn is_throttling(&self) -> bool {
        matches!(
            self,
            Error::ReadThrottled(_) | Error::WriteThrottled(_) | Error::OperationThrottled(_)
        )
    }

    /// Wrap a terminal failure in a [`Error::Timeout`] carrying the elapsed
    /// time and retry count for observability.
    pub(crate) fn timeout(elapsed: Duration, retries: u32, cause: Error) -> Error {
        Error::Timeout {
            elapsed,
            retries,
            cause: Some(Box::new(cause)),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        // Connect-level failures (refused, DNS, TLS handshake) and truncated
        // response bodies mean the exchange never completed; those may be
        // retried. A timeout here is the per-attempt wall clock expiring.
        if e.is_timeout() {
            return Error::Timeout {
                elapsed: Duration::ZERO,
                retries: 0,
                cause: None,
            };
        }
        let retryable = e.is_connect() || e.is_body() || e.is_request();
        Error::Transport {
            message: e.to_string(),
            retryable,
        }
    }
}

/// Shorthand for `Err(Error::Argument(format!(...)))`.
macro_rules! arg_err {
    ($($t:tt)*) => {
        Err($crate::error::Error::Argument(format!($($t)*)))
    };
}

pub(crate) use arg_err;

#[cfg(test)]
mod tests {
    use super::*;

    // ── wire-code mapping ──────────────────────────────────────────────

    #[test]
    fn throttling_codes_map_to_throttled_variants() {
        assert!(matches!(
            Error::from_code(code::READ_LIMIT_EXCEEDED, "x"),
            Error::ReadThrottled(_)
        ));
        assert!(matches!(
            Error::from_code(code::WRITE_LIMIT_EXCEEDED, "x"),
            Error::WriteThrottled(_)
        ));
    }

    #[test]
    fn unknown_code_maps_to_service() {
        match Error::from_code(9999, "mystery") {
            Error::Service { code, message } => {
                assert_eq!(code, 9999);
                assert_eq!(message, "mystery");
            }
            other => panic!("expected Service, got {other:?}"),
        }
    }

    // ── retry classification ───────────────────────────────────────────

    #[test]
    fn retryable_service_errors() {
        assert!(Error::ReadThrottled("t".into()).is_retryable());
        assert!(Error::WriteThrottled("t".into()).is_retryable());
        assert!(Error::TableBusy("t".into()).is_retryable());
        assert!(Error::SecurityInfoNotReady("t".into()).is_retryable());
        assert!(Error::RetryableService("t".into()).is_retryable());
    }

    #[test]
    fn fatal_service_errors() {
        assert!(!Error::TableNotFound("t".into()).is_retryable());
        assert!(!Error::Argument("t".into()).is_retryable());
        assert!(!Error::BadProtocol("t".into()).is_retryable());
        assert!(!Error::Authentication("t".into()).is_retryable());
    }

    #[test]
    fn http_5xx_is_retryable_4xx_is_not() {
        for status in [500u16, 502, 503, 504] {
            assert!(
                Error::ServiceResponse {
                    status,
                    message: String::new()
                }
                .is_retryable(),
                "{status} should be retryable"
            );
        }
        for status in [400u16, 403, 404, 501, 505] {
            assert!(
                !Error::ServiceResponse {
                    status,
                    message: String::new()
                }
                .is_retryable(),
                "{status} should be fatal"
            );
        }
    }

    #[test]
    fn timeout_is_never_retryable() {
        let e = Error::timeout(Duration::from_secs(1), 3, Error::TableBusy("x".into()));
        assert!(!e.is_retryable());
    }

    #[test]
    fn throttling_predicate() {
        assert!(Error::ReadThrottled("x".into()).is_throttling());
        assert!(!Error::TableBusy("x".into()).is_throttling());
    }
}
