//! Credential provider contract.
//!
//! A provider stamps authorization headers onto each attempt. It may
//! perform its own I/O (token exchange, signing services) and must honor
//! the cancellation token while doing so.

use std::fmt;

use futures_util::future::BoxFuture;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// What a provider may inspect about the operation being authorized.
#[derive(Debug, Clone, Copy)]
pub struct OperationInfo<'a> {
    pub kind: &'a str,
    pub table_name: Option<&'a str>,
}

/// Supplies authorization headers, once per attempt.
pub trait AuthorizationProvider: Send + Sync + fmt::Debug {
    fn authorize<'a>(
        &'a self,
        op: OperationInfo<'a>,
        headers: &'a mut HeaderMap,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), Error>>;
}

/// No authorization at all: CloudSim and non-secure on-premise stores.
#[derive(Debug, Default)]
pub struct NoAuth;

impl AuthorizationProvider for NoAuth {
    fn authorize<'a>(
        &'a self,
        _op: OperationInfo<'a>,
        _headers: &'a mut HeaderMap,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }
}

/// A fixed bearer token.
pub struct BearerToken {
    token: String,
}

impl BearerToken {
    pub fn new(token: &str) -> Self {
        BearerToken {
            token: token.to_string(),
        }
    }
}

impl AuthorizationProvider for BearerToken {
    fn authorize<'a>(
        &'a self,
        _op: OperationInfo<'a>,
        headers: &'a mut HeaderMap,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let value = HeaderValue::from_str(&format!("Bearer {}", self.token))
                .map_err(|e| Error::Authentication(format!("invalid token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
            Ok(())
        })
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken").field("token", &"***").finish()
    }
}
