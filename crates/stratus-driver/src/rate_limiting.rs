//! Per-table rate-limiting coordinator.
//!
//! Each table the client touches gets a (read, write) limiter pair, created
//! lazily from the table's limits and kept fresh by a background `GetTable`
//! per table. Requests pre-consume zero units before the exchange (waiting
//! out any backlog) and charge the actually consumed units afterwards.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::Client;
use crate::config::{Config, RateLimiterCreator, ServiceType};
use crate::error::Error;
use crate::limiter::{NullRateLimiter, RateLimiter, SimpleRateLimiter};
use crate::requests::{GetTableRequest, Op};
use crate::results::OpOutcome;
use crate::table::{TableResult, TableState};

/// How often background refreshes re-read table limits.
const REFRESH_INTERVAL: Duration = Duration::from_secs(600);

/// The (read, write) limiter pair for one table.
#[derive(Debug, Clone)]
pub(crate) struct TableLimiters {
    pub read: Arc<dyn RateLimiter>,
    pub write: Arc<dyn RateLimiter>,
}

pub(crate) struct RateLimiterRegistry {
    enabled: bool,
    ratio: Option<f64>,
    creator: Option<RateLimiterCreator>,
    entries: DashMap<String, TableLimiters>,
    refreshers: DashMap<String, CancellationToken>,
    /// Parent of every background task's token; cancelled on client drop.
    root: CancellationToken,
}

impl RateLimiterRegistry {
    pub fn new(config: &Config) -> Self {
        // On-premise stores do their own admission control.
        let enabled =
            config.rate_limiting_enabled && config.service_type != ServiceType::Kvstore;
        RateLimiterRegistry {
            enabled,
            ratio: config.limiter_ratio(),
            creator: config.rate_limiter_creator.clone(),
            entries: DashMap::new(),
            refreshers: DashMap::new(),
            root: CancellationToken::new(),
        }
    }

    #[cfg(test)]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Limiters for this request, or `None` when the request is unpaced.
    ///
    /// An unknown table kicks off one background `GetTable`; the current
    /// request proceeds without pacing rather than waiting on metadata.
    pub fn resolve(&self, client: &Client, op: &Op) -> Option<TableLimiters> {
        if !self.enabled {
            return None;
        }
        // Only data-plane traffic is paced; metadata ops (GetTable included,
        // which the registry itself issues) pass through.
        if !op.does_reads() && !op.does_writes() {
            return None;
        }
        let table = op.table_name()?.to_lowercase();
        if let Some(entry) = self.entries.get(&table) {
            return Some(entry.clone());
        }
        self.ensure_background_init(client, table);
        None
    }

    fn ensure_background_init(&self, client: &Client, table: String) {
        if self.refreshers.contains_key(&table) {
            return;
        }
        let token = self.root.child_token();
        self.refreshers.insert(table.clone(), token.clone());
        let client = client.clone();
        debug!(table, "fetching table limits for rate limiting");
        tokio::spawn(async move {
            let req = GetTableRequest::new(&table);
            match client.get_table(req, &token).await {
                Ok(result) => {
                    let registry = client.limiters();
                    registry.apply_table_result(&result);
                    // Peer clients can change limits out from under a
                    // partial-share configuration; keep re-reading them.
                    if registry.ratio.is_some() {
                        registry.schedule_refresh(&client, table);
                    } else {
                        registry.refreshers.remove(&table);
                    }
                }
                Err(e) => {
                    warn!(table, error = %e, "table limits fetch failed; will retry");
                    client.limiters().schedule_refresh(&client, table);
                }
            }
        });
    }

    /// Replace (and cancel) any pending refresh for `table` with a new one.
    fn schedule_refresh(&self, client: &Client, table: String) {
        let token = self.root.child_token();
        if let Some(old) = self.refreshers.insert(table.clone(), token.clone()) {
            old.cancel();
        }
        let client = client.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
                    _ = token.cancelled() => return,
                }
                let req = GetTableRequest::new(&table);
                match client.get_table(req, &token).await {
                    Ok(result) => client.limiters().apply_table_result(&result),
                    Err(e) => {
                        debug!(table, error = %e, "table limits refresh failed");
                    }
                }
            }
        });
    }

    /// Install, refresh, or remove limiters from a table DDL/metadata result.
    pub fn apply_table_result(&self, result: &TableResult) {
        if !self.enabled || result.table_name.is_empty() {
            return;
        }
        let table = result.table_name.to_lowercase();
        match result.state {
            TableState::Dropped => {
                self.entries.remove(&table);
                if let Some((_, token)) = self.refreshers.remove(&table) {
                    token.cancel();
                }
            }
            TableState::Active => {
                let Some(limits) = result.limits else { return };
                let ratio = self.ratio.unwrap_or(1.0);
                let read_rate = limits.read_units as f64 * ratio;
                let write_rate = limits.write_units as f64 * ratio;
                let mut entry = self
                    .entries
                    .entry(table.clone())
                    .or_insert_with(|| TableLimiters {
                        read: self.new_limiter(limits.read_units, read_rate),
                        write: self.new_limiter(limits.write_units, write_rate),
                    });
                refresh_side(&mut entry.read, limits.read_units, read_rate, || {
                    self.new_limiter(limits.read_units, read_rate)
                });
                refresh_side(&mut entry.write, limits.write_units, write_rate, || {
                    self.new_limiter(limits.write_units, write_rate)
                });
                debug!(
                    table,
                    read_rate, write_rate, "table rate limiters updated"
                );
            }
            _ => {}
        }
    }

    fn new_limiter(&self, units: u32, rate: f64) -> Arc<dyn RateLimiter> {
        if units == 0 {
            return Arc::new(NullRateLimiter);
        }
        match &self.creator {
            Some(creator) => creator(rate),
            None => {
                let limiter = SimpleRateLimiter::new(rate);
                Arc::new(limiter)
            }
        }
    }

    /// Pre-exchange pacing: wait until both applicable limiters are under
    /// their limits. Charges nothing; a too-long wait is a timeout.
    pub async fn before_request(
        &self,
        pair: &TableLimiters,
        op: &Op,
        remaining: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        if op.does_reads() {
            pair.read.consume_units(0, remaining, false, cancel).await?;
        }
        if op.does_writes() {
            pair.write.consume_units(0, remaining, false, cancel).await?;
        }
        Ok(())
    }

    /// Post-exchange charge of the units the server reports. Always charges
    /// (the capacity is already spent); records the pacing delays on the
    /// result for observability.
    pub async fn after_request(
        &self,
        pair: &TableLimiters,
        outcome: &mut OpOutcome,
        remaining: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let Some(consumed) = outcome.consumed() else {
            return Ok(());
        };
        let (read_units, write_units) = (consumed.read_units, consumed.write_units);

        let mut read_delay = Duration::ZERO;
        let mut write_delay = Duration::ZERO;
        if read_units > 0 {
            read_delay = pair
                .read
                .consume_units(read_units as i64, remaining, true, cancel)
                .await?;
        }
        if write_units > 0 {
            write_delay = pair
                .write
                .consume_units(write_units as i64, remaining, true, cancel)
                .await?;
        }
        if let Some(c) = outcome.consumed_mut() {
            c.read_rate_limit_delay += read_delay;
            c.write_rate_limit_delay += write_delay;
        }
        Ok(())
    }

    /// Route a server throttling error to the matching limiter so banked
    /// burst is discarded before the retry.
    pub fn on_throttle(&self, table: Option<&str>, err: &Error) {
        let Some(table) = table else { return };
        let Some(entry) = self.entries.get(&table.to_lowercase()) else {
            return;
        };
        match err {
            Error::ReadThrottled(_) => entry.read.handle_throttle(),
            Error::WriteThrottled(_) => entry.write.handle_throttle(),
            _ => {}
        }
    }

    /// Cancel every background task. Called on client drop.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    #[cfg(test)]
    pub fn entry(&self, table: &str) -> Option<TableLimiters> {
        self.entries.get(&table.to_lowercase()).map(|e| e.clone())
    }

    #[cfg(test)]
    pub fn has_refresher(&self, table: &str) -> bool {
        self.refreshers.contains_key(&table.to_lowercase())
    }
}

/// Refresh one side of an entry in place: zero units install a no-op,
/// live limiters get a prorated `set_limit`, dead ones are replaced.
fn refresh_side(
    side: &mut Arc<dyn RateLimiter>,
    units: u32,
    rate: f64,
    make: impl FnOnce() -> Arc<dyn RateLimiter>,
) {
    if units == 0 {
        if side.limit() > 0.0 {
            *side = Arc::new(NullRateLimiter);
        }
    } else if side.limit() > 0.0 {
        if (side.limit() - rate).abs() > f64::EPSILON {
            side.set_limit(rate);
        }
    } else {
        *side = make();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::{test_client_with_config, test_config};
    use crate::requests::GetRequest;
    use crate::table::TableLimits;
    use crate::transport::MockExchange;
    use crate::value::MapValue;

    fn active_table(name: &str, read: u32, write: u32) -> TableResult {
        TableResult {
            table_name: name.into(),
            state: TableState::Active,
            limits: Some(TableLimits::provisioned(read, write, 1)),
            schema: None,
            operation_id: None,
        }
    }

    fn get_op() -> Op {
        Op::Get(GetRequest::new("users", MapValue::new().with("id", 1)))
    }

    fn rl_config() -> Config {
        let mut cfg = test_config();
        cfg.rate_limiting_enabled = true;
        cfg
    }

    fn rl_client(mock: MockExchange) -> Client {
        test_client_with_config(rl_config(), mock)
    }

    // ── entry lifecycle ────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn active_result_installs_limiters() {
        let client = rl_client(MockExchange::new(vec![]));
        let registry = client.limiters();
        registry.apply_table_result(&active_table("Users", 100, 50));

        let entry = registry.entry("users").expect("entry created");
        assert_eq!(entry.read.limit(), 100.0);
        assert_eq!(entry.write.limit(), 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn percent_scales_the_rate() {
        let mut cfg = rl_config();
        cfg.rate_limiter_percent = 20.0;
        let client = test_client_with_config(cfg, MockExchange::new(vec![]));
        let registry = client.limiters();
        registry.apply_table_result(&active_table("t", 100, 50));

        let entry = registry.entry("t").unwrap();
        assert_eq!(entry.read.limit(), 20.0);
        assert_eq!(entry.write.limit(), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_units_install_a_noop_limiter() {
        let client = rl_client(MockExchange::new(vec![]));
        let registry = client.limiters();
        registry.apply_table_result(&active_table("t", 0, 50));

        let entry = registry.entry("t").unwrap();
        assert_eq!(entry.read.limit(), 0.0);
        // The no-op side admits anything instantly.
        let slept = entry
            .read
            .consume_units(1_000_000, Duration::ZERO, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(slept, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_removes_the_entry() {
        let client = rl_client(MockExchange::new(vec![]));
        let registry = client.limiters();
        registry.apply_table_result(&active_table("t", 10, 10));
        assert!(registry.entry("t").is_some());

        let dropped = TableResult {
            state: TableState::Dropped,
            ..active_table("t", 10, 10)
        };
        registry.apply_table_result(&dropped);
        assert!(registry.entry("t").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn limit_change_refreshes_in_place() {
        let client = rl_client(MockExchange::new(vec![]));
        let registry = client.limiters();
        registry.apply_table_result(&active_table("t", 100, 50));
        registry.apply_table_result(&active_table("t", 200, 50));

        let entry = registry.entry("t").unwrap();
        assert_eq!(entry.read.limit(), 200.0);
        assert_eq!(entry.write.limit(), 50.0);
    }

    // ── resolution ─────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn unknown_table_spawns_background_init() {
        let mock = MockExchange::new(vec![Ok(OpOutcome::Table(active_table(
            "users", 100, 50,
        )))]);
        let client = rl_client(mock);
        let registry = client.limiters();

        // First request: unpaced, background GetTable spawned.
        assert!(registry.resolve(&client, &get_op()).is_none());
        // Let the background task run.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(registry.entry("users").is_some());
        assert!(registry.resolve(&client, &get_op()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_init_schedules_a_refresher() {
        let mock = MockExchange::new(vec![Err(Error::TableNotFound("users".into()))]);
        let client = rl_client(mock);
        let registry = client.limiters();

        assert!(registry.resolve(&client, &get_op()).is_none());
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(registry.entry("users").is_none());
        assert!(registry.has_refresher("users"));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_for_kvstore() {
        let mut cfg = test_config();
        cfg.service_type = ServiceType::Kvstore;
        cfg.rate_limiting_enabled = true;
        let client = test_client_with_config(cfg, MockExchange::new(vec![]));
        let registry = client.limiters();
        assert!(!registry.enabled());
        assert!(registry.resolve(&client, &get_op()).is_none());
    }

    // ── throttle routing ───────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn throttle_reaches_the_matching_side() {
        let client = rl_client(MockExchange::new(vec![]));
        let registry = client.limiters();
        registry.apply_table_result(&active_table("t", 10, 10));

        // Bank credit, then observe it discarded after throttle feedback.
        tokio::time::advance(Duration::from_millis(500)).await;
        registry.on_throttle(Some("t"), &Error::ReadThrottled("x".into()));

        let entry = registry.entry("t").unwrap();
        let cancel = CancellationToken::new();
        entry
            .read
            .consume_units(5, Duration::ZERO, false, &cancel)
            .await
            .unwrap();
        let slept = entry
            .read
            .consume_units(0, Duration::ZERO, false, &cancel)
            .await
            .unwrap();
        assert!(slept >= Duration::from_millis(400), "slept {slept:?}");
    }
}
