//! The receive iterator: the plan's gateway to the server.
//!
//! Three shapes, chosen by the plan: a plain stream of batches; a merge of
//! per-shard sorted streams; or the two-phase all-partition sort, which
//! first collects per-partition slices and then merges them under a
//! memory-bounded refetch limit.

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};

use tracing::trace;

use crate::compare::compare_rows;
use crate::error::Error;
use crate::query::plan::{Distribution, ReceiveStep};
use crate::query::runtime::{FetchArgs, QueryRuntime};
use crate::results::QueryBatch;
use crate::value::{FieldValue, MapValue};

/// Upper bound on rows requested by one memory-bounded refetch.
const MAX_REFETCH_ROWS: u32 = 2048;

/// Bytes charged per duplicate-elimination fingerprint.
const DUP_ENTRY_SIZE: u64 = std::mem::size_of::<u64>() as u64;

/// One shard's or partition's pending sorted rows.
#[derive(Debug)]
struct PartialResults {
    id: i32,
    rows: VecDeque<MapValue>,
    continuation_key: Option<Vec<u8>>,
    done: bool,
}

impl PartialResults {
    fn new(id: i32) -> Self {
        PartialResults {
            id,
            rows: VecDeque::new(),
            continuation_key: None,
            done: false,
        }
    }

    fn needs_fetch(&self) -> bool {
        self.rows.is_empty() && !self.done
    }
}

pub(crate) struct ReceiveIter {
    step: ReceiveStep,
    sorted: bool,
    /// Unsorted streaming state.
    rows: VecDeque<MapValue>,
    continuation_key: Option<Vec<u8>>,
    done: bool,
    /// Sorted-merge state (shards or partitions).
    partials: Vec<PartialResults>,
    seeded: bool,
    phase1_done: bool,
    phase1_key: Option<Vec<u8>>,
    /// Rows currently charged to the memory budget, for the average-row
    /// estimate behind the refetch limit.
    rows_charged: u64,
    /// Duplicate elimination.
    dup_hashes: HashSet<u64>,
    dup_memory: u64,
}

impl ReceiveIter {
    pub fn new(step: &ReceiveStep) -> Self {
        let sorted = !step.sort_specs.is_empty()
            && matches!(
                step.distribution,
                Distribution::AllShards | Distribution::AllPartitions
            );
        ReceiveIter {
            step: step.clone(),
            sorted,
            rows: VecDeque::new(),
            continuation_key: None,
            done: false,
            partials: Vec::new(),
            seeded: false,
            phase1_done: false,
            phase1_key: None,
            rows_charged: 0,
            dup_hashes: HashSet::new(),
            dup_memory: 0,
        }
    }

    pub fn result_reg(&self) -> usize {
        self.step.result_reg
    }

    pub async fn next(&mut self, rt: &mut QueryRuntime) -> Result<bool, Error> {
        if self.sorted {
            match self.step.distribution {
                Distribution::AllPartitions => self.next_sorted_partitions(rt).await,
                _ => self.next_sorted_shards(rt).await,
            }
        } else {
            self.next_streaming(rt).await
        }
    }

    // ── unsorted streaming ─────────────────────────────────────────────

    async fn next_streaming(&mut self, rt: &mut QueryRuntime) -> Result<bool, Error> {
        loop {
            while let Some(row) = self.rows.pop_front() {
                if self.is_duplicate(rt, &row)? {
                    continue;
                }
                rt.set_reg(self.step.result_reg, FieldValue::Map(row));
                return Ok(true);
            }
            if self.done {
                return Ok(false);
            }
            if !rt.try_claim_fetch() {
                return Ok(false);
            }
            let batch = rt
                .fetch(FetchArgs {
                    continuation_key: self.continuation_key.take(),
                    ..Default::default()
                })
                .await?;
            self.continuation_key = batch.continuation_key;
            if self.continuation_key.is_none() {
                self.done = true;
            }
            self.rows.extend(batch.rows);
        }
    }

    // ── sorted all-shard merge ─────────────────────────────────────────

    async fn next_sorted_shards(&mut self, rt: &mut QueryRuntime) -> Result<bool, Error> {
        if !self.seeded {
            let Some(topology) = rt.topology.clone() else {
                return Err(Error::BadProtocol(
                    "sorted all-shard query without topology info".into(),
                ));
            };
            self.partials = topology
                .shard_ids
                .iter()
                .map(|id| PartialResults::new(*id))
                .collect();
            self.seeded = true;
        }
        self.reconcile_topology(rt);

        // Every live stream needs a head row before a winner can be picked.
        loop {
            let Some(idx) = self.partials.iter().position(PartialResults::needs_fetch) else {
                break;
            };
            if !rt.try_claim_fetch() {
                return Ok(false);
            }
            let (shard_id, continuation_key) = {
                let p = &mut self.partials[idx];
                (p.id, p.continuation_key.take())
            };
            let batch = rt
                .fetch(FetchArgs {
                    continuation_key,
                    shard_id: Some(shard_id),
                    ..Default::default()
                })
                .await?;
            self.absorb_partial_batch(rt, idx, batch)?;
            self.reconcile_topology(rt);
        }

        self.emit_min(rt)
    }

    // ── sorted all-partition two-phase ─────────────────────────────────

    async fn next_sorted_partitions(&mut self, rt: &mut QueryRuntime) -> Result<bool, Error> {
        while !self.phase1_done {
            if !rt.try_claim_fetch() {
                return Ok(false);
            }
            let batch = rt
                .fetch(FetchArgs {
                    continuation_key: self.phase1_key.take(),
                    ..Default::default()
                })
                .await?;
            self.phase1_key = batch.continuation_key.clone();
            self.absorb_phase1_batch(rt, batch)?;
            if self.phase1_key.is_none() {
                self.phase1_done = true;
            }
        }

        // Phase 2: same merge as shards, with memory-bounded refetches.
        loop {
            let Some(idx) = self.partials.iter().position(PartialResults::needs_fetch) else {
                break;
            };
            if !rt.try_claim_fetch() {
                return Ok(false);
            }
            let limit = self.refetch_limit(rt)?;
            let continuation_key = self.partials[idx].continuation_key.take();
            let batch = rt
                .fetch(FetchArgs {
                    continuation_key,
                    number_limit: Some(limit),
                    ..Default::default()
                })
                .await?;
            self.absorb_partial_batch(rt, idx, batch)?;
        }

        self.emit_min(rt)
    }

    fn absorb_phase1_batch(
        &mut self,
        rt: &mut QueryRuntime,
        batch: QueryBatch,
    ) -> Result<(), Error> {
        let phase1 = match batch.phase1 {
            Some(p) => p,
            // No phase-1 envelope means the server already finished it.
            None => {
                self.phase1_key = None;
                return Ok(());
            }
        };
        let mut rows = batch.rows.into_iter();
        for (i, pid) in phase1.partition_ids.iter().enumerate() {
            let count = phase1.num_results_per_partition[i] as usize;
            let idx = match self.partials.iter().position(|p| p.id == *pid) {
                Some(idx) => idx,
                None => {
                    self.partials.push(PartialResults::new(*pid));
                    self.partials.len() - 1
                }
            };
            let partial = &mut self.partials[idx];
            partial.continuation_key = phase1.continuation_keys[i].clone();
            partial.done = partial.continuation_key.is_none();
            for _ in 0..count {
                let Some(row) = rows.next() else {
                    return Err(Error::BadProtocol(
                        "phase1 row counts exceed the returned rows".into(),
                    ));
                };
                rt.charge_memory(row.memory_size())?;
                self.rows_charged += 1;
                partial.rows.push_back(row);
            }
            trace!(pid, rows = partial.rows.len(), "phase1 partition received");
        }
        if !phase1.in_phase1 {
            self.phase1_key = None;
        }
        Ok(())
    }

    fn absorb_partial_batch(
        &mut self,
        rt: &mut QueryRuntime,
        idx: usize,
        batch: QueryBatch,
    ) -> Result<(), Error> {
        for row in &batch.rows {
            rt.charge_memory(row.memory_size())?;
            self.rows_charged += 1;
        }
        let p = &mut self.partials[idx];
        p.rows.extend(batch.rows);
        p.continuation_key = batch.continuation_key;
        if p.continuation_key.is_none() {
            p.done = true;
        }
        Ok(())
    }

    /// Row cap for a phase-2 refetch, derived from the average size of the
    /// rows cached so far and the remaining memory budget.
    fn refetch_limit(&self, rt: &QueryRuntime) -> Result<u32, Error> {
        if self.rows_charged == 0 {
            return Ok(MAX_REFETCH_ROWS);
        }
        let avg = (rt.total_memory() / self.rows_charged).max(1);
        let available = rt.max_memory.saturating_sub(self.dup_memory);
        let limit = (available / avg).min(MAX_REFETCH_ROWS as u64) as u32;
        if limit == 0 {
            return Err(Error::MemoryExceeded {
                used: rt.total_memory(),
                budget: rt.max_memory,
            });
        }
        Ok(limit)
    }

    /// Emit the smallest head row across the partial results. Ties under
    /// the sort spec break toward the lower shard/partition id, so an
    /// interleaving of refetches cannot reorder equal rows.
    fn emit_min(&mut self, rt: &mut QueryRuntime) -> Result<bool, Error> {
        loop {
            let mut min_idx: Option<usize> = None;
            for (i, p) in self.partials.iter().enumerate() {
                let Some(head) = p.rows.front() else { continue };
                match min_idx {
                    None => min_idx = Some(i),
                    Some(m) => {
                        let best = self.partials[m].rows.front().expect("non-empty");
                        let ord = compare_rows(head, best, &self.step.sort_specs)?;
                        if ord == Ordering::Less
                            || (ord == Ordering::Equal && p.id < self.partials[m].id)
                        {
                            min_idx = Some(i);
                        }
                    }
                }
            }
            let Some(idx) = min_idx else {
                return Ok(false);
            };
            let row = self.partials[idx].rows.pop_front().expect("non-empty");
            rt.adjust_memory(-(row.memory_size() as i64))?;
            self.rows_charged = self.rows_charged.saturating_sub(1);
            if self.is_duplicate(rt, &row)? {
                continue;
            }
            rt.set_reg(self.step.result_reg, FieldValue::Map(row));
            return Ok(true);
        }
    }

    /// Drop streams for shards that left the topology; seed new ones.
    fn reconcile_topology(&mut self, rt: &QueryRuntime) {
        let Some(topology) = &rt.topology else { return };
        self.partials
            .retain(|p| topology.shard_ids.contains(&p.id));
        for id in &topology.shard_ids {
            if !self.partials.iter().any(|p| p.id == *id) {
                self.partials.push(PartialResults::new(*id));
            }
        }
    }

    /// Fingerprint the primary key and drop rows already seen.
    fn is_duplicate(&mut self, rt: &mut QueryRuntime, row: &MapValue) -> Result<bool, Error> {
        if !self.step.eliminate_duplicates {
            return Ok(false);
        }
        let mut hash: u64 = 17;
        for field in &self.step.primary_key_fields {
            let h = row
                .get(field)
                .map(FieldValue::query_hash)
                .unwrap_or_default();
            hash = hash.wrapping_mul(31).wrapping_add(h);
        }
        if self.dup_hashes.insert(hash) {
            self.dup_memory += DUP_ENTRY_SIZE;
            rt.charge_memory(DUP_ENTRY_SIZE)?;
            Ok(false)
        } else {
            Ok(true)
        }
    }
}
