//! The HTTP submit path: one serialized request/response exchange.
//!
//! Everything above this layer works with typed operations; everything
//! below is bytes. The driver owns deadlines, so the underlying HTTP
//! client is built without its own timeout and every POST is raced against
//! the per-attempt wall clock and the caller's cancellation token.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use reqwest::header::{
    ACCEPT, CONNECTION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT,
};
use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use crate::auth::{AuthorizationProvider, OperationInfo};
use crate::error::Error;
use crate::protocol::ProtocolHandler;
use crate::requests::Op;
use crate::results::OpOutcome;

/// Fixed relative path of the data plane.
const DATA_PATH: &str = "V2/nosql/data";

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-nosql-request-id");
const NAMESPACE_HEADER: HeaderName = HeaderName::from_static("x-nosql-namespace");

fn driver_user_agent() -> HeaderValue {
    HeaderValue::from_static(concat!("stratus-driver/", env!("CARGO_PKG_VERSION")))
}

/// One typed round trip to the service. The execution loop retries through
/// this seam; tests substitute a scripted implementation.
pub(crate) trait Exchange: Send + Sync {
    fn execute<'a>(
        &'a self,
        op: &'a Op,
        timeout: Duration,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<OpOutcome, Error>>;
}

/// The real transport: serialize, POST, classify, deserialize.
pub(crate) struct HttpTransport {
    http: reqwest::Client,
    data_url: Url,
    handler: Arc<dyn ProtocolHandler>,
    auth: Arc<dyn AuthorizationProvider>,
    namespace: Option<HeaderValue>,
    next_request_id: AtomicU64,
    max_request_size: usize,
    max_response_size: usize,
}

impl HttpTransport {
    pub fn new(
        http: reqwest::Client,
        endpoint: Url,
        handler: Arc<dyn ProtocolHandler>,
        auth: Arc<dyn AuthorizationProvider>,
        namespace: Option<&str>,
        max_request_size: usize,
        max_response_size: usize,
    ) -> Result<Self, Error> {
        let data_url = endpoint
            .join(DATA_PATH)
            .map_err(|e| Error::Argument(format!("bad endpoint: {e}")))?;
        let namespace = namespace
            .map(|ns| {
                HeaderValue::from_str(ns)
                    .map_err(|e| Error::Argument(format!("bad namespace {ns:?}: {e}")))
            })
            .transpose()?;
        Ok(HttpTransport {
            http,
            data_url,
            handler,
            auth,
            namespace,
            next_request_id: AtomicU64::new(1),
            max_request_size,
            max_response_size,
        })
    }

    async fn round_trip(
        &self,
        op: &Op,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<OpOutcome, Error> {
        let body = self
            .handler
            .encode(op, timeout, self.handler.serial_version())?;
        if body.len() > self.max_request_size {
            return Err(Error::Argument(format!(
                "serialized request is {} bytes, over the {} byte limit",
                body.len(),
                self.max_request_size
            )));
        }

        let mut headers = HeaderMap::new();
        let content_type = HeaderValue::from_static(self.handler.content_type());
        headers.insert(ACCEPT, content_type.clone());
        headers.insert(CONTENT_TYPE, content_type);
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(USER_AGENT, driver_user_agent());
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        headers.insert(
            REQUEST_ID_HEADER,
            HeaderValue::from_str(&request_id.to_string())
                .expect("integer header value is always valid"),
        );
        if let Some(ns) = &self.namespace {
            headers.insert(NAMESPACE_HEADER, ns.clone());
        }

        let info = OperationInfo {
            kind: op.kind(),
            table_name: op.table_name(),
        };
        self.auth.authorize(info, &mut headers, cancel).await?;

        trace!(op = op.kind(), request_id, "posting request");
        let response = self
            .http
            .post(self.data_url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() != 200 {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::ServiceResponse {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response.bytes().await?;
        if bytes.len() > self.max_response_size {
            return Err(Error::BadProtocol(format!(
                "response is {} bytes, over the {} byte limit",
                bytes.len(),
                self.max_response_size
            )));
        }
        self.handler.decode(op, &bytes)
    }
}

impl Exchange for HttpTransport {
    fn execute<'a>(
        &'a self,
        op: &'a Op,
        timeout: Duration,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<OpOutcome, Error>> {
        Box::pin(async move {
            tokio::select! {
                out = tokio::time::timeout(timeout, self.round_trip(op, timeout, cancel)) => {
                    match out {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout {
                            elapsed: timeout,
                            retries: 0,
                            cause: None,
                        }),
                    }
                }
                _ = cancel.cancelled() => Err(Error::Cancelled),
            }
        })
    }
}

#[cfg(test)]
pub(crate) use mock::MockExchange;
