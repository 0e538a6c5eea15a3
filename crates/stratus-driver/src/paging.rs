//! Paging helpers: explicit pull interfaces over continuation state.
//!
//! Each pager owns its continuation token (or start index) and the
//! remaining budget; `fetch_next_page` performs exactly one operation and
//! returns `None` once the sequence is exhausted.

use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::error::Error;
use crate::requests::{ListTablesRequest, MultiDeleteRequest, TableUsageRequest};
use crate::results::{ListTablesResult, MultiDeleteResult, TableUsageResult};

/// Drives a ranged delete across as many calls as its write-KB cap needs.
pub struct DeleteRangePager {
    client: Client,
    request: MultiDeleteRequest,
    continuation: Option<Vec<u8>>,
    done: bool,
}

impl DeleteRangePager {
    pub fn new(client: &Client, request: MultiDeleteRequest) -> Self {
        let continuation = request.continuation_key.clone();
        DeleteRangePager {
            client: client.clone(),
            request,
            continuation,
            done: false,
        }
    }

    /// Delete the next slice. `None` once the range is exhausted.
    pub async fn fetch_next_page(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<MultiDeleteResult>, Error> {
        if self.done {
            return Ok(None);
        }
        let mut req = self.request.clone();
        req.continuation_key = self.continuation.clone();
        let result = self.client.multi_delete(req, cancel).await?;
        self.continuation = result.continuation_key.clone();
        if self.continuation.is_none() {
            self.done = true;
        }
        Ok(Some(result))
    }

    /// Total deleted so far is the caller's to sum; this reports whether
    /// more slices remain.
    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Pages through table names by start index.
pub struct ListTablesPager {
    client: Client,
    request: ListTablesRequest,
    next_index: u32,
    done: bool,
}

impl ListTablesPager {
    pub fn new(client: &Client, request: ListTablesRequest) -> Self {
        let next_index = request.start_index;
        ListTablesPager {
            client: client.clone(),
            request,
            next_index,
            done: false,
        }
    }

    pub async fn fetch_next_page(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<ListTablesResult>, Error> {
        if self.done {
            return Ok(None);
        }
        let mut req = self.request.clone();
        req.start_index = self.next_index;
        let result = self.client.list_tables(req, cancel).await?;
        self.next_index = result.last_returned_index;
        // A short or empty page ends the listing.
        if result.tables.is_empty()
            || (self.request.limit > 0 && (result.tables.len() as u32) < self.request.limit)
        {
            self.done = true;
        }
        if result.tables.is_empty() {
            return Ok(None);
        }
        Ok(Some(result))
    }
}

/// Pages through throughput usage records.
pub struct TableUsagePager {
    client: Client,
    request: TableUsageRequest,
    next_index: u32,
    done: bool,
}

impl TableUsagePager {
    pub fn new(client: &Client, request: TableUsageRequest) -> Self {
        let next_index = request.start_index;
        TableUsagePager {
            client: client.clone(),
            request,
            next_index,
            done: false,
        }
    }

    pub async fn fetch_next_page(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<TableUsageResult>, Error> {
        if self.done {
            return Ok(None);
        }
        let mut req = self.request.clone();
        req.start_index = self.next_index;
        let result = self.client.get_table_usage(req, cancel).await?;
        self.next_index = result.last_returned_index;
        if result.usage_records.is_empty()
            || (self.request.limit > 0
                && (result.usage_records.len() as u32) < self.request.limit)
        {
            self.done = true;
        }
        if result.usage_records.is_empty() {
            return Ok(None);
        }
        Ok(Some(result))
    }
}
