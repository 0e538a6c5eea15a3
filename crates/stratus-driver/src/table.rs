//! Table metadata, DDL results, and the table-state poller.
//!
//! DDL completes asynchronously on the service; callers hold a
//! [`TableResult`] and poll it forward until the table reaches a target
//! state. The poller updates the caller's result in place on every poll so
//! intermediate states are observable.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::Client;
use crate::error::Error;
use crate::requests::{GetTableRequest, SystemStatusRequest};
use crate::results::{SystemResult, SystemState};

/// Lifecycle state of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Active,
    Creating,
    Dropped,
    Dropping,
    Updating,
}

impl TableState {
    /// Terminal states: DDL has finished, successfully or by removal.
    pub fn is_terminal(self) -> bool {
        matches!(self, TableState::Active | TableState::Dropped)
    }
}

/// Capacity mode of a table's provisioned limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapacityMode {
    #[default]
    Provisioned,
    OnDemand,
}

/// Throughput and storage limits of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLimits {
    pub mode: CapacityMode,
    pub read_units: u32,
    pub write_units: u32,
    pub storage_gb: u32,
}

impl TableLimits {
    pub fn provisioned(read_units: u32, write_units: u32, storage_gb: u32) -> Self {
        TableLimits {
            mode: CapacityMode::Provisioned,
            read_units,
            write_units,
            storage_gb,
        }
    }

    pub fn on_demand(storage_gb: u32) -> Self {
        TableLimits {
            mode: CapacityMode::OnDemand,
            read_units: 0,
            write_units: 0,
            storage_gb,
        }
    }
}

/// Result of TableRequest / GetTable, and the object the poller advances.
#[derive(Debug, Clone)]
pub struct TableResult {
    pub table_name: String,
    pub state: TableState,
    pub limits: Option<TableLimits>,
    pub schema: Option<String>,
    /// Id of the in-flight DDL operation, for targeted GetTable polling.
    pub operation_id: Option<String>,
}

impl TableResult {
    /// Poll `GetTable` until the table reaches a terminal state
    /// ([`TableState::is_terminal`]) or the deadline passes.
    ///
    /// `timeout` and `poll_delay` default to the client's configured table
    /// poll values. The result is updated in place on every poll.
    pub async fn wait_for_completion(
        &mut self,
        client: &Client,
        timeout: Option<Duration>,
        poll_delay: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.wait_for_state(client, |r| r.state.is_terminal(), timeout, poll_delay, cancel)
            .await
    }

    /// Poll `GetTable` until `predicate` holds or the deadline passes.
    ///
    /// `TableNotFound` during the poll sets the state to `Dropped`; it is an
    /// error only if this poll did not start from a dropping table.
    pub async fn wait_for_state(
        &mut self,
        client: &Client,
        mut predicate: impl FnMut(&TableResult) -> bool,
        timeout: Option<Duration>,
        poll_delay: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let cfg = client.config();
        let timeout = timeout.unwrap_or(cfg.table_poll_timeout);
        let poll_delay = poll_delay.unwrap_or(cfg.table_poll_delay);
        let expects_absence = matches!(self.state, TableState::Dropping | TableState::Dropped);

        let start = Instant::now();
        let deadline = start + timeout;
        // Each GetTable gets the smaller of the poll timeout and the default
        // request timeout, further shrunk to the remaining overall budget.
        let per_poll_cap = cfg.table_poll_timeout.min(cfg.timeout);

        let mut retries: u32 = 0;
        loop {
            if predicate(self) {
                return Ok(());
            }

            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            if remaining.is_zero() {
                return Err(Error::timeout(
                    now.duration_since(start),
                    retries,
                    Error::RetryableService(format!(
                        "table {} did not reach the requested state",
                        self.table_name
                    )),
                ));
            }

            let mut get = GetTableRequest::new(&self.table_name)
                .timeout(per_poll_cap.min(remaining));
            if let Some(op_id) = &self.operation_id {
                get = get.operation_id(op_id);
            }

            match client.get_table(get, cancel).await {
                Ok(polled) => {
                    debug!(table = %self.table_name, state = ?polled.state, "table poll");
                    *self = polled;
                }
                Err(Error::TableNotFound(_)) => {
                    self.state = TableState::Dropped;
                    self.limits = None;
                    if !expects_absence {
                        return Err(Error::TableNotFound(self.table_name.clone()));
                    }
                }
                Err(e) => return Err(e),
            }
            retries += 1;

            if predicate(self) {
                return Ok(());
            }

            // Account for the upcoming sleep before committing to it.
            let now = Instant::now();
            if now + poll_delay >= deadline {
                return Err(Error::timeout(
                    now.duration_since(start),
                    retries,
                    Error::RetryableService(format!(
                        "table {} still {:?} at deadline",
                        self.table_name, self.state
                    )),
                ));
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_delay) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }
}

impl SystemResult {
    /// Poll `SystemStatus` until the admin operation completes or the
    /// deadline passes. Mirrors [`TableResult::wait_for_state`] with the
    /// admin poll budget.
    pub async fn wait_for_completion(
        &mut self,
        client: &Client,
        timeout: Option<Duration>,
        poll_delay: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let cfg = client.config();
        let timeout = timeout.unwrap_or(cfg.admin_poll_timeout);
        let poll_delay = poll_delay.unwrap_or(cfg.admin_poll_delay);

        let Some(op_id) = self.operation_id.clone() else {
            // No operation id means the statement completed synchronously.
            return Ok(());
        };

        let start = Instant::now();
        let deadline = start + timeout;
        let mut retries: u32 = 0;

        while self.state != SystemState::Complete {
            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            if remaining.is_zero() {
                return Err(Error::timeout(
                    now.duration_since(start),
                    retries,
                    Error::RetryableService("admin operation still running".into()),
                ));
            }

            let status = SystemStatusRequest::new(&op_id).timeout(cfg.timeout.min(remaining));
            *self = client.system_status(status, cancel).await?;
            retries += 1;

            if self.state == SystemState::Complete {
                break;
            }
            let now = Instant::now();
            if now + poll_delay >= deadline {
                return Err(Error::timeout(
                    now.duration_since(start),
                    retries,
                    Error::RetryableService("admin operation still running".into()),
                ));
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_delay) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
        Ok(())
    }
}
