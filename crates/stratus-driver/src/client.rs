//! The client and its execution loop.
//!
//! One loop serves every operation: validate once, then per attempt pace
//! through the table's rate limiters, perform one HTTP exchange, charge the
//! consumed capacity, and on failure classify, back off and retry within
//! the caller's deadline. Protocol-version fallback rides the same loop but
//! consumes neither backoff nor retry budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::error::Error;
use crate::protocol::{JsonProtocol, ProtocolHandler};
use crate::rate_limiting::{RateLimiterRegistry, TableLimiters};
use crate::requests::{
    DeleteRequest, GetRequest, GetTableRequest, ListTablesRequest, MultiDeleteRequest, Op,
    PrepareRequest, PutRequest, SystemRequest, SystemStatusRequest, TableRequest,
    TableUsageRequest, WriteMultipleRequest,
};
use crate::results::{
    DeleteResult, GetResult, ListTablesResult, MultiDeleteResult, OpOutcome, PrepareResult,
    PutResult, QueryBatch, SystemResult, TableUsageResult, WriteMultipleResult,
};
use crate::retry::RetryContext;
use crate::table::TableResult;
use crate::transport::{Exchange, HttpTransport};

struct ClientInner {
    config: Config,
    protocol: Arc<dyn ProtocolHandler>,
    exchange: Arc<dyn Exchange>,
    limiters: RateLimiterRegistry,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.limiters.shutdown();
    }
}

/// Handle to the service. Cheap to clone; all clones share the HTTP
/// transport, the negotiated protocol version and the rate-limiter
/// registry. Individual requests must not be shared across concurrent
/// calls, but any number of independent calls may run against one client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Build a client. Validates the configuration, constructs the HTTP
    /// transport and loads any configured trust roots.
    pub fn new(config: Config) -> Result<Client, Error> {
        let endpoint = config.validate()?;

        let mut builder = reqwest::Client::builder();
        for cert in &config.trusted_roots {
            builder = builder.add_root_certificate(cert.clone());
        }
        if let Some(path) = &config.trusted_roots_file {
            let pem = std::fs::read(path).map_err(|e| {
                Error::Argument(format!("cannot read {}: {e}", path.display()))
            })?;
            let certs = reqwest::Certificate::from_pem_bundle(&pem)?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }
        let http = builder.build()?;

        let protocol: Arc<dyn ProtocolHandler> = Arc::new(JsonProtocol::new());
        let transport = HttpTransport::new(
            http,
            endpoint,
            protocol.clone(),
            config.auth_provider.clone(),
            config.namespace.as_deref(),
            config.max_request_size,
            config.max_response_size,
        )?;
        let limiters = RateLimiterRegistry::new(&config);
        Ok(Client {
            inner: Arc::new(ClientInner {
                config,
                protocol,
                exchange: Arc::new(transport),
                limiters,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn limiters(&self) -> &RateLimiterRegistry {
        &self.inner.limiters
    }

    // ── typed operations ───────────────────────────────────────────────

    pub async fn get(
        &self,
        req: GetRequest,
        cancel: &CancellationToken,
    ) -> Result<GetResult, Error> {
        self.execute_op(&Op::Get(req), cancel).await?.into_get()
    }

    pub async fn put(
        &self,
        req: PutRequest,
        cancel: &CancellationToken,
    ) -> Result<PutResult, Error> {
        self.execute_op(&Op::Put(req), cancel).await?.into_put()
    }

    pub async fn delete(
        &self,
        req: DeleteRequest,
        cancel: &CancellationToken,
    ) -> Result<DeleteResult, Error> {
        self.execute_op(&Op::Delete(req), cancel)
            .await?
            .into_delete()
    }

    pub async fn write_multiple(
        &self,
        req: WriteMultipleRequest,
        cancel: &CancellationToken,
    ) -> Result<WriteMultipleResult, Error> {
        self.execute_op(&Op::WriteMultiple(req), cancel)
            .await?
            .into_write_multiple()
    }

    pub async fn multi_delete(
        &self,
        req: MultiDeleteRequest,
        cancel: &CancellationToken,
    ) -> Result<MultiDeleteResult, Error> {
        self.execute_op(&Op::MultiDelete(req), cancel)
            .await?
            .into_multi_delete()
    }

    pub async fn prepare(
        &self,
        req: PrepareRequest,
        cancel: &CancellationToken,
    ) -> Result<PrepareResult, Error> {
        self.execute_op(&Op::Prepare(req), cancel)
            .await?
            .into_prepare()
    }

    pub async fn table_request(
        &self,
        req: TableRequest,
        cancel: &CancellationToken,
    ) -> Result<TableResult, Error> {
        self.execute_op(&Op::Table(req), cancel).await?.into_table()
    }

    /// Submit DDL and poll the resulting table to a terminal state, all
    /// within one shared deadline.
    pub async fn table_request_and_wait(
        &self,
        req: TableRequest,
        cancel: &CancellationToken,
    ) -> Result<TableResult, Error> {
        let start = Instant::now();
        let budget = req
            .timeout
            .unwrap_or(self.inner.config.table_poll_timeout);
        let mut result = self.table_request(req, cancel).await?;
        let remaining = budget.saturating_sub(start.elapsed());
        result
            .wait_for_completion(self, Some(remaining), None, cancel)
            .await?;
        Ok(result)
    }

    pub async fn get_table(
        &self,
        req: GetTableRequest,
        cancel: &CancellationToken,
    ) -> Result<TableResult, Error> {
        self.execute_op(&Op::GetTable(req), cancel)
            .await?
            .into_table()
    }

    pub async fn list_tables(
        &self,
        req: ListTablesRequest,
        cancel: &CancellationToken,
    ) -> Result<ListTablesResult, Error> {
        self.execute_op(&Op::ListTables(req), cancel)
            .await?
            .into_list_tables()
    }

    pub async fn get_table_usage(
        &self,
        req: TableUsageRequest,
        cancel: &CancellationToken,
    ) -> Result<TableUsageResult, Error> {
        self.execute_op(&Op::TableUsage(req), cancel)
            .await?
            .into_table_usage()
    }

    pub async fn system_request(
        &self,
        req: SystemRequest,
        cancel: &CancellationToken,
    ) -> Result<SystemResult, Error> {
        self.execute_op(&Op::System(req), cancel)
            .await?
            .into_system()
    }

    /// Submit an admin statement and poll it to completion, sharing one
    /// deadline between submission and polling.
    pub async fn system_request_and_wait(
        &self,
        req: SystemRequest,
        cancel: &CancellationToken,
    ) -> Result<SystemResult, Error> {
        let start = Instant::now();
        let budget = req
            .timeout
            .unwrap_or(self.inner.config.admin_poll_timeout);
        let mut result = self.system_request(req, cancel).await?;
        let remaining = budget.saturating_sub(start.elapsed());
        result
            .wait_for_completion(self, Some(remaining), None, cancel)
            .await?;
        Ok(result)
    }

    pub async fn system_status(
        &self,
        req: SystemStatusRequest,
        cancel: &CancellationToken,
    ) -> Result<SystemResult, Error> {
        self.execute_op(&Op::SystemStatus(req), cancel)
            .await?
            .into_system()
    }

    /// One server round trip of a query, used by the query runtime.
    pub(crate) async fn fetch_query_batch(
        &self,
        fetch: crate::requests::QueryFetch,
        cancel: &CancellationToken,
    ) -> Result<QueryBatch, Error> {
        self.execute_op(&Op::QueryFetch(fetch), cancel)
            .await?
            .into_query_batch()
    }

    // ── the execution loop ─────────────────────────────────────────────

    pub(crate) async fn execute_op(
        &self,
        op: &Op,
        cancel: &CancellationToken,
    ) -> Result<OpOutcome, Error> {
        op.validate()?;
        let cfg = &self.inner.config;
        let mut timeout = op
            .requested_timeout()
            .unwrap_or_else(|| self.default_timeout_for(op));
        let start = Instant::now();
        let mut retries: u32 = 0;
        let limiters = self.inner.limiters.resolve(self, op);

        loop {
            let observed = self.inner.protocol.serial_version();
            if op.min_serial_version() > observed {
                return Err(Error::UnsupportedProtocolVersion {
                    minimum: op.min_serial_version(),
                    current: observed,
                });
            }

            let deadline = start + timeout;
            let err = match self.attempt(op, &limiters, start, deadline, cancel).await {
                Ok(outcome) => {
                    if let OpOutcome::Table(table) = &outcome {
                        self.inner.limiters.apply_table_result(table);
                    }
                    return Ok(outcome);
                }
                Err(e) => e,
            };

            if err.is_throttling() {
                self.inner.limiters.on_throttle(op.table_name(), &err);
            }
            if matches!(err, Error::SecurityInfoNotReady(_))
                && timeout < cfg.security_info_timeout
            {
                timeout = cfg.security_info_timeout;
            }
            let deadline = start + timeout;
            let now = Instant::now();

            match &err {
                Error::UnsupportedProtocol { .. } => {
                    // Fallback retries immediately and never counts against
                    // the retry budget. At most one decrement happens per
                    // observed version, even under concurrent attempts.
                    if !cfg.disable_protocol_fallback
                        && now < deadline
                        && (self.inner.protocol.serial_version() != observed
                            || self.inner.protocol.decrement_serial_version(observed))
                    {
                        debug!(
                            op = op.kind(),
                            from = observed,
                            to = self.inner.protocol.serial_version(),
                            "falling back to older protocol version"
                        );
                        continue;
                    }
                    return Err(err);
                }
                Error::Cancelled => return Err(err),
                Error::Timeout { .. } => {
                    return Err(Error::timeout(start.elapsed(), retries, err));
                }
                _ => {}
            }

            let ctx = RetryContext {
                retries,
                error: &err,
            };
            if !err.is_retryable() || !cfg.retry_handler.should_retry(&ctx) {
                return Err(err);
            }
            let delay = cfg.retry_handler.retry_delay(&ctx);
            if now + delay >= deadline {
                return Err(Error::timeout(start.elapsed(), retries, err));
            }
            retries += 1;
            debug!(op = op.kind(), retries, ?delay, error = %err, "retrying");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    /// One attempt: pace, exchange, charge. The effective timeout each
    /// stage sees is the remaining share of the caller's budget.
    async fn attempt(
        &self,
        op: &Op,
        limiters: &Option<TableLimiters>,
        start: Instant,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<OpOutcome, Error> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout {
                elapsed: start.elapsed(),
                retries: 0,
                cause: None,
            });
        }
        if let Some(pair) = limiters {
            self.inner
                .limiters
                .before_request(pair, op, remaining, cancel)
                .await?;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout {
                elapsed: start.elapsed(),
                retries: 0,
                cause: None,
            });
        }
        let mut outcome = self.inner.exchange.execute(op, remaining, cancel).await?;

        if let Some(pair) = limiters {
            // The capacity is already spent server-side, so the charge
            // happens even if it has to run on a tiny budget.
            let budget = deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1));
            self.inner
                .limiters
                .after_request(pair, &mut outcome, budget, cancel)
                .await?;
        }
        Ok(outcome)
    }

    fn default_timeout_for(&self, op: &Op) -> Duration {
        let cfg = &self.inner.config;
        match op {
            Op::Table(_) | Op::GetTable(_) => cfg.table_request_timeout,
            Op::System(_) | Op::SystemStatus(_) => cfg.admin_timeout,
            _ => cfg.timeout,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::transport::MockExchange;

    pub fn test_config() -> Config {
        Config {
            endpoint: "http://localhost:8080".into(),
            ..Config::default()
        }
    }

    pub fn test_client(mock: MockExchange) -> Client {
        test_client_with_config(test_config(), mock)
    }

    pub fn test_client_with_config(config: Config, mock: MockExchange) -> Client {
        let protocol: Arc<dyn ProtocolHandler> = Arc::new(JsonProtocol::new());
        let limiters = RateLimiterRegistry::new(&config);
        Client {
            inner: Arc::new(ClientInner {
                config,
                protocol,
                exchange: Arc::new(mock),
                limiters,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{test_client, test_client_with_config, test_config};
    use super::*;
    use crate::protocol::{SERIAL_V3, SERIAL_V4};
    use crate::results::{ConsumedCapacity, SystemState};
    use crate::retry::DefaultRetryHandler;
    use crate::table::{TableLimits, TableState};
    use crate::transport::MockExchange;
    use crate::value::MapValue;

    fn get_req() -> GetRequest {
        GetRequest::new("users", MapValue::new().with("id", 1))
    }

    fn ok_get(read_units: u32) -> Result<OpOutcome, Error> {
        Ok(OpOutcome::Get(GetResult {
            row: Some(MapValue::new().with("id", 1)),
            version: None,
            modification_time: None,
            consumed: Some(ConsumedCapacity {
                read_units,
                read_kb: read_units,
                ..Default::default()
            }),
        }))
    }

    fn active_users_table(read: u32, write: u32) -> TableResult {
        TableResult {
            table_name: "users".into(),
            state: TableState::Active,
            limits: Some(TableLimits::provisioned(read, write, 1)),
            schema: None,
            operation_id: None,
        }
    }

    fn rl_config() -> Config {
        Config {
            rate_limiting_enabled: true,
            ..test_config()
        }
    }

    // ── retry classification (property 2) ──────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn retryable_error_then_success() {
        let mock = MockExchange::new(vec![
            Err(Error::TableBusy("busy".into())),
            ok_get(1),
        ]);
        let client = test_client(mock);
        let result = client.get(get_req(), &CancellationToken::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_retried() {
        let mock = MockExchange::new(vec![
            Err(Error::TableNotFound("users".into())),
            ok_get(1),
        ]);
        let client = test_client(mock);
        let err = client
            .get(get_req(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TableNotFound(_)));
        // Only one exchange happened.
    }

    #[tokio::test(start_paused = true)]
    async fn handler_cap_stops_retries() {
        let responses: Vec<_> = (0..10)
            .map(|_| Err(Error::RetryableService("boom".into())))
            .collect();
        let mock = MockExchange::new(responses);
        let mut cfg = test_config();
        cfg.retry_handler = Arc::new(DefaultRetryHandler::new(2, Duration::from_millis(1)));
        cfg.timeout = Duration::from_secs(300);
        let client = test_client_with_config(cfg, mock);

        let err = client
            .get(get_req(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetryableService(_)));
    }

    // ── deadline accounting (property 1) ───────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_total_time() {
        let responses: Vec<_> = (0..100)
            .map(|_| Err(Error::TableBusy("busy".into())))
            .collect();
        let client = test_client(MockExchange::new(responses));

        let start = Instant::now();
        let err = client
            .get(
                get_req().timeout(Duration::from_secs(2)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        let total = start.elapsed();
        assert!(total <= Duration::from_secs(2), "took {total:?}");
        match err {
            Error::Timeout {
                elapsed, retries, ..
            } => {
                assert!(elapsed <= Duration::from_secs(2));
                assert!(retries > 0, "expected at least one retry recorded");
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_exchange_times_out_with_elapsed_at_least_budget() {
        let mock =
            MockExchange::new(vec![ok_get(1)]).with_delay(Duration::from_secs(30));
        let client = test_client(mock);

        let err = client
            .get(
                get_req().timeout(Duration::from_millis(50)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            Error::Timeout { elapsed, .. } => {
                assert!(elapsed >= Duration::from_millis(50), "{elapsed:?}");
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    // ── protocol fallback (S4, property 5) ─────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn unsupported_protocol_decrements_and_retries_without_backoff() {
        let mock = MockExchange::new(vec![
            Err(Error::UnsupportedProtocol { version: SERIAL_V4 }),
            ok_get(1),
        ]);
        let client = test_client(mock);

        let start = Instant::now();
        let result = client.get(get_req(), &CancellationToken::new()).await;
        assert!(result.is_ok());
        // No backoff: the fallback retry is immediate even in virtual time.
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(client.inner.protocol.serial_version(), SERIAL_V3);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_disabled_surfaces_the_error() {
        let mock = MockExchange::new(vec![Err(Error::UnsupportedProtocol {
            version: SERIAL_V4,
        })]);
        let mut cfg = test_config();
        cfg.disable_protocol_fallback = true;
        let client = test_client_with_config(cfg, mock);

        let err = client
            .get(get_req(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedProtocol { .. }));
        assert_eq!(client.inner.protocol.serial_version(), SERIAL_V4);
    }

    #[tokio::test(start_paused = true)]
    async fn version_floor_fails_op_that_needs_more() {
        let client = test_client(MockExchange::new(vec![]));
        // Drop the negotiated version below what queries need.
        assert!(client.inner.protocol.decrement_serial_version(SERIAL_V4));
        assert!(client.inner.protocol.decrement_serial_version(SERIAL_V3));

        let err = client
            .prepare(
                PrepareRequest::new("SELECT * FROM users"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedProtocolVersion { minimum: SERIAL_V3, .. }
        ));
    }

    // ── security info stretch ──────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn security_info_stretches_the_budget() {
        let mock = MockExchange::new(vec![
            Err(Error::SecurityInfoNotReady("warming".into())),
            Err(Error::SecurityInfoNotReady("warming".into())),
            ok_get(1),
        ]);
        let mut cfg = test_config();
        cfg.security_info_timeout = Duration::from_secs(8);
        let client = test_client_with_config(cfg, mock);

        // 1 ms would never allow two 100 ms security retries without the
        // stretch rule.
        let result = client
            .get(get_req().timeout(Duration::from_millis(1)), &CancellationToken::new())
            .await;
        assert!(result.is_ok());
    }

    // ── rate limiting end to end (S1, S2, S3) ──────────────────────────

    #[tokio::test(start_paused = true)]
    async fn s1_ten_reads_under_limit_cost_nothing() {
        let responses: Vec<_> = (0..10).map(|_| ok_get(1)).collect();
        let client = test_client_with_config(rl_config(), MockExchange::new(responses));
        client.limiters().apply_table_result(&active_users_table(100, 100));

        let cancel = CancellationToken::new();
        let start = Instant::now();
        let mut total_delay = Duration::ZERO;
        for _ in 0..10 {
            let res = client.get(get_req(), &cancel).await.unwrap();
            total_delay += res.consumed.unwrap().read_rate_limit_delay;
        }
        assert!(start.elapsed() < Duration::from_millis(200), "{:?}", start.elapsed());
        assert!(total_delay < Duration::from_millis(200), "{total_delay:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn s2_sustained_overdraw_is_paced_not_throttled() {
        let responses: Vec<_> = (0..200).map(|_| ok_get(5)).collect();
        let client = test_client_with_config(rl_config(), MockExchange::new(responses));
        client.limiters().apply_table_result(&active_users_table(100, 100));

        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..200 {
            // Generous per-call timeout; pacing must not error.
            client
                .get(get_req().timeout(Duration::from_secs(60)), &cancel)
                .await
                .unwrap();
        }
        // 200 calls x 5 units at 100/s is at least 10 seconds of pacing
        // (minus one banked burst window).
        assert!(
            start.elapsed() >= Duration::from_secs(9),
            "finished in {:?}",
            start.elapsed()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn s3_over_limit_with_tiny_timeout_fails_without_charge() {
        let client = test_client_with_config(rl_config(), MockExchange::new(vec![]));
        client.limiters().apply_table_result(&active_users_table(1, 1));

        // Exhaust the table's capacity for a long while.
        let entry = client.limiters().entry("users").unwrap();
        let cancel = CancellationToken::new();
        entry
            .read
            .consume_units(1000, Duration::ZERO, false, &cancel)
            .await
            .unwrap();

        let err = client
            .get(get_req().timeout(Duration::from_millis(10)), &cancel)
            .await
            .unwrap_err();
        match err {
            Error::Timeout { elapsed, .. } => {
                assert!(elapsed >= Duration::from_millis(10), "{elapsed:?}");
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    // ── table result application ───────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn successful_ddl_feeds_the_registry() {
        let mock = MockExchange::new(vec![Ok(OpOutcome::Table(active_users_table(42, 7)))]);
        let client = test_client_with_config(rl_config(), mock);

        client
            .get_table(GetTableRequest::new("users"), &CancellationToken::new())
            .await
            .unwrap();
        let entry = client.limiters().entry("users").unwrap();
        assert_eq!(entry.read.limit(), 42.0);
        assert_eq!(entry.write.limit(), 7.0);
    }

    // ── DDL submit-and-wait (shared deadline) ──────────────────────────

    fn users_table(state: TableState) -> TableResult {
        TableResult {
            state,
            ..active_users_table(10, 10)
        }
    }

    fn system_working() -> SystemResult {
        SystemResult {
            state: SystemState::Working,
            operation_id: Some("op1".into()),
            statement: None,
            result_string: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn table_request_and_wait_polls_to_active() {
        let mock = MockExchange::new(vec![
            Ok(OpOutcome::Table(users_table(TableState::Creating))),
            Ok(OpOutcome::Table(users_table(TableState::Creating))),
            Ok(OpOutcome::Table(users_table(TableState::Active))),
        ]);
        let client = test_client(mock);

        let result = client
            .table_request_and_wait(
                TableRequest::new("CREATE TABLE users (id INTEGER, PRIMARY KEY(id))"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.state, TableState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn table_request_and_wait_shares_one_deadline() {
        // Every exchange takes 400 ms; the submission spends a large part
        // of the 1 s budget, and the polls only get what is left.
        let responses: Vec<_> = (0..10)
            .map(|_| Ok(OpOutcome::Table(users_table(TableState::Creating))))
            .collect();
        let mock = MockExchange::new(responses).with_delay(Duration::from_millis(400));
        let client = test_client(mock);

        let start = Instant::now();
        let err = client
            .table_request_and_wait(
                TableRequest::new("CREATE TABLE users (id INTEGER, PRIMARY KEY(id))")
                    .timeout(Duration::from_secs(1)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "got {err:?}");
        // A fresh poll window would keep going for the full poll timeout;
        // the shared budget ends the wait within the requested second.
        assert!(
            start.elapsed() <= Duration::from_millis(1100),
            "took {:?}",
            start.elapsed()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn system_request_and_wait_polls_to_complete() {
        let complete = SystemResult {
            state: SystemState::Complete,
            result_string: Some("ok".into()),
            ..system_working()
        };
        let mock = MockExchange::new(vec![
            Ok(OpOutcome::System(system_working())),
            Ok(OpOutcome::System(system_working())),
            Ok(OpOutcome::System(complete)),
        ]);
        let client = test_client(mock);

        let result = client
            .system_request_and_wait(
                SystemRequest::new("CREATE NAMESPACE ns"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.state, SystemState::Complete);
        assert_eq!(result.result_string.as_deref(), Some("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn system_request_and_wait_shares_one_deadline() {
        let responses: Vec<_> = (0..10)
            .map(|_| Ok(OpOutcome::System(system_working())))
            .collect();
        let mock = MockExchange::new(responses).with_delay(Duration::from_millis(400));
        let client = test_client(mock);

        let start = Instant::now();
        let err = client
            .system_request_and_wait(
                SystemRequest::new("CREATE NAMESPACE ns").timeout(Duration::from_secs(1)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "got {err:?}");
        assert!(
            start.elapsed() <= Duration::from_millis(1100),
            "took {:?}",
            start.elapsed()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_surfaces_as_cancelled() {
        let mock = MockExchange::new(vec![ok_get(1)]).with_delay(Duration::from_secs(1));
        let client = test_client(mock);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client.get(get_req(), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
