//! Client configuration: a flat record validated once at construction.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::auth::{AuthorizationProvider, NoAuth};
use crate::error::{Error, arg_err};
use crate::limiter::RateLimiter;
use crate::retry::{DefaultRetryHandler, RetryHandler};

/// Which deployment the client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceType {
    /// The managed cloud service.
    #[default]
    Cloud,
    /// The local cloud simulator (no authorization).
    CloudSim,
    /// An on-premise store. Client-side rate limiting is disabled here;
    /// the store enforces its own admission control.
    Kvstore,
}

/// Factory for custom per-table rate limiters.
pub type RateLimiterCreator = Arc<dyn Fn(f64) -> Arc<dyn RateLimiter> + Send + Sync>;

/// Driver configuration.
///
/// `trusted_roots` and `trusted_roots_file` are mutually exclusive ways of
/// pinning the service's certificate chain; certificates loaded from the
/// file are owned by the client, caller-supplied ones are shared.
#[derive(Clone)]
pub struct Config {
    pub endpoint: String,
    pub service_type: ServiceType,
    /// Default namespace attached to every request, if set.
    pub namespace: Option<String>,

    /// Default timeout for data operations.
    pub timeout: Duration,
    /// Default timeout for table DDL submission.
    pub table_request_timeout: Duration,
    /// Overall budget when waiting for a table state, and the cap on each
    /// poll's own GetTable timeout.
    pub table_poll_timeout: Duration,
    pub table_poll_delay: Duration,
    /// Budgets for on-premise admin operations.
    pub admin_timeout: Duration,
    pub admin_poll_timeout: Duration,
    pub admin_poll_delay: Duration,
    /// A request failing with security-info-not-ready stretches its budget
    /// to at least this, so propagation delays don't fail fresh clients.
    pub security_info_timeout: Duration,

    pub retry_handler: Arc<dyn RetryHandler>,

    pub rate_limiting_enabled: bool,
    /// Portion of each table's throughput this client paces itself to,
    /// in percent, (0, 100].
    pub rate_limiter_percent: f64,
    pub rate_limiter_creator: Option<RateLimiterCreator>,

    /// Turn off serial-version downgrade on `UnsupportedProtocol`.
    pub disable_protocol_fallback: bool,

    pub max_request_size: usize,
    pub max_response_size: usize,
    /// Client-side memory budget for a single query execution.
    pub max_memory: u64,

    pub trusted_roots: Vec<reqwest::Certificate>,
    pub trusted_roots_file: Option<PathBuf>,

    pub auth_provider: Arc<dyn AuthorizationProvider>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            endpoint: String::new(),
            service_type: ServiceType::default(),
            namespace: None,
            timeout: Duration::from_secs(5),
            table_request_timeout: Duration::from_secs(10),
            table_poll_timeout: Duration::from_secs(120),
            table_poll_delay: Duration::from_millis(500),
            admin_timeout: Duration::from_secs(10),
            admin_poll_timeout: Duration::from_secs(120),
            admin_poll_delay: Duration::from_secs(1),
            security_info_timeout: Duration::from_secs(10),
            retry_handler: Arc::new(DefaultRetryHandler::default()),
            rate_limiting_enabled: false,
            rate_limiter_percent: 100.0,
            rate_limiter_creator: None,
            disable_protocol_fallback: false,
            max_request_size: 2 * 1024 * 1024,
            max_response_size: 32 * 1024 * 1024,
            max_memory: 1_000_000_000,
            trusted_roots: Vec::new(),
            trusted_roots_file: None,
            auth_provider: Arc::new(NoAuth),
        }
    }
}

impl Config {
    /// Validate the record and resolve the endpoint. Called once by
    /// `Client::new`.
    pub(crate) fn validate(&self) -> Result<Url, Error> {
        if self.endpoint.is_empty() {
            return arg_err!("an endpoint is required");
        }
        if self.rate_limiter_percent <= 0.0 || self.rate_limiter_percent > 100.0 {
            return arg_err!(
                "rate_limiter_percent must be in (0, 100], got {}",
                self.rate_limiter_percent
            );
        }
        if !self.trusted_roots.is_empty() && self.trusted_roots_file.is_some() {
            return arg_err!("trusted_roots and trusted_roots_file are mutually exclusive");
        }
        if self.timeout.is_zero() || self.table_request_timeout.is_zero() {
            return arg_err!("timeouts must be positive");
        }
        self.endpoint_url()
    }

    pub(crate) fn endpoint_url(&self) -> Result<Url, Error> {
        let raw = if self.endpoint.contains("://") {
            self.endpoint.clone()
        } else {
            format!("https://{}", self.endpoint)
        };
        let url = Url::parse(&raw)
            .map_err(|e| Error::Argument(format!("bad endpoint {:?}: {e}", self.endpoint)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => arg_err!("unsupported endpoint scheme {other:?}"),
        }
    }

    /// Effective pacing ratio: `None` means pace at the full table limit.
    pub(crate) fn limiter_ratio(&self) -> Option<f64> {
        if (self.rate_limiter_percent - 100.0).abs() < f64::EPSILON {
            None
        } else {
            Some(self.rate_limiter_percent / 100.0)
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("endpoint", &self.endpoint)
            .field("service_type", &self.service_type)
            .field("namespace", &self.namespace)
            .field("timeout", &self.timeout)
            .field("table_request_timeout", &self.table_request_timeout)
            .field("table_poll_timeout", &self.table_poll_timeout)
            .field("table_poll_delay", &self.table_poll_delay)
            .field("admin_timeout", &self.admin_timeout)
            .field("security_info_timeout", &self.security_info_timeout)
            .field("retry_handler", &self.retry_handler)
            .field("rate_limiting_enabled", &self.rate_limiting_enabled)
            .field("rate_limiter_percent", &self.rate_limiter_percent)
            .field(
                "rate_limiter_creator",
                &self.rate_limiter_creator.as_ref().map(|_| "<fn>"),
            )
            .field("disable_protocol_fallback", &self.disable_protocol_fallback)
            .field("max_request_size", &self.max_request_size)
            .field("max_response_size", &self.max_response_size)
            .field("max_memory", &self.max_memory)
            .field("trusted_roots", &format!("{} certs", self.trusted_roots.len()))
            .field("trusted_roots_file", &self.trusted_roots_file)
            .field("auth_provider", &self.auth_provider)
            .finish()
    }
}
