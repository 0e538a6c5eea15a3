//! The group iterator: hash grouping with client-side aggregates.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use bigdecimal::BigDecimal;

use crate::compare::{query_compare, query_equals};
use crate::error::Error;
use crate::query::PlanIter;
use crate::query::plan::{AggrFunc, GroupStep};
use crate::query::runtime::QueryRuntime;
use crate::value::{FieldValue, MapValue};

/// Fixed overhead charged per map entry, on top of the key and value sizes.
const ENTRY_OVERHEAD: u64 = 64;

/// A grouping tuple with query equality and hashing semantics: numeric
/// values compare across widths, specials equal only themselves.
#[derive(Debug, Clone)]
pub(crate) struct GroupKey(pub Vec<FieldValue>);

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| query_equals(a, b))
    }
}

impl Eq for GroupKey {}

impl Hash for GroupKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut acc: u64 = 1;
        for v in &self.0 {
            acc = acc.wrapping_mul(31).wrapping_add(v.query_hash());
        }
        acc.hash(state);
    }
}

impl GroupKey {
    fn memory_size(&self) -> u64 {
        self.0.iter().map(FieldValue::memory_size).sum()
    }
}

pub(crate) struct GroupIter {
    step: GroupStep,
    input: Box<PlanIter>,
    groups: HashMap<GroupKey, Vec<FieldValue>>,
    /// Emission order once the input is exhausted.
    emit_queue: Vec<GroupKey>,
    emit_pos: usize,
    input_done: bool,
}

impl GroupIter {
    pub fn new(step: &GroupStep) -> Self {
        GroupIter {
            input: Box::new(PlanIter::build(&step.input)),
            step: step.clone(),
            groups: HashMap::new(),
            emit_queue: Vec::new(),
            emit_pos: 0,
            input_done: false,
        }
    }

    pub fn result_reg(&self) -> usize {
        self.step.result_reg
    }

    pub async fn next(&mut self, rt: &mut QueryRuntime) -> Result<bool, Error> {
        while !self.input_done {
            if !self.input.next(rt).await? {
                if rt.need_continuation {
                    return Ok(false);
                }
                self.input_done = true;
                self.emit_queue = self.groups.keys().cloned().collect();
                self.emit_pos = 0;
                break;
            }

            let row = match rt.take_reg(self.input.result_reg()) {
                FieldValue::Map(m) => m,
                other => {
                    return Err(Error::BadProtocol(format!(
                        "group input produced a non-record value: {other:?}"
                    )));
                }
            };

            let Some(key) = self.grouping_key(&row) else {
                continue;
            };

            let aggr_base = self.step.num_group_columns;
            if let Some(tuple) = self.groups.get_mut(&key) {
                let mut delta = 0i64;
                for (i, func) in self.step.aggr_funcs.iter().enumerate() {
                    let value = row
                        .get_at(aggr_base + i)
                        .map(|(_, v)| v)
                        .unwrap_or(&FieldValue::Empty);
                    delta += apply_aggregate(&mut tuple[i], *func, value)?;
                }
                if self.step.count_memory && delta != 0 {
                    rt.adjust_memory(delta)?;
                }
                continue;
            }

            // New group: seed the aggregate tuple and fold this first row.
            let mut tuple: Vec<FieldValue> = self
                .step
                .aggr_funcs
                .iter()
                .map(|f| match f {
                    AggrFunc::CountStar | AggrFunc::Count | AggrFunc::CountNumbers => {
                        FieldValue::Long(0)
                    }
                    _ => FieldValue::Null,
                })
                .collect();
            for (i, func) in self.step.aggr_funcs.iter().enumerate() {
                let value = row
                    .get_at(aggr_base + i)
                    .map(|(_, v)| v)
                    .unwrap_or(&FieldValue::Empty);
                apply_aggregate(&mut tuple[i], *func, value)?;
            }
            if self.step.count_memory {
                let entry_size = ENTRY_OVERHEAD
                    + key.memory_size()
                    + tuple.iter().map(FieldValue::memory_size).sum::<u64>();
                rt.charge_memory(entry_size)?;
            }

            // With no aggregates each new tuple streams straight out
            // (DISTINCT); otherwise it waits for the input to finish.
            let streaming = self.step.aggr_funcs.is_empty();
            self.groups.insert(key.clone(), tuple);
            if streaming {
                rt.set_reg(self.step.result_reg, self.record_for(&key));
                return Ok(true);
            }
        }

        // Emission phase.
        while self.emit_pos < self.emit_queue.len() {
            let key = self.emit_queue[self.emit_pos].clone();
            self.emit_pos += 1;
            if self.step.aggr_funcs.is_empty() {
                // Streaming groups were already emitted on insertion.
                continue;
            }
            let record = self.record_for(&key);
            if self.step.remove_result
                && let Some(tuple) = self.groups.remove(&key)
                && self.step.count_memory
            {
                let entry_size = ENTRY_OVERHEAD
                    + key.memory_size()
                    + tuple.iter().map(FieldValue::memory_size).sum::<u64>();
                rt.adjust_memory(-(entry_size as i64))?;
            }
            rt.set_reg(self.step.result_reg, record);
            return Ok(true);
        }
        Ok(false)
    }

    /// Extract the grouping tuple, applying the EMPTY rules: a row with an
    /// EMPTY grouping column is dropped, unless the plan is DISTINCT, in
    /// which case EMPTY is promoted to NULL for key purposes.
    fn grouping_key(&self, row: &MapValue) -> Option<GroupKey> {
        let mut key = Vec::with_capacity(self.step.num_group_columns);
        for i in 0..self.step.num_group_columns {
            let value = row
                .get_at(i)
                .map(|(_, v)| v.clone())
                .unwrap_or(FieldValue::Empty);
            if matches!(value, FieldValue::Empty) {
                if !self.step.is_distinct {
                    return None;
                }
                key.push(FieldValue::Null);
            } else {
                key.push(value);
            }
        }
        Some(GroupKey(key))
    }

    fn record_for(&self, key: &GroupKey) -> FieldValue {
        let mut record = MapValue::new();
        for (i, v) in key.0.iter().enumerate() {
            record.put(self.column_name(i), v.clone());
        }
        if let Some(tuple) = self.groups.get(key) {
            for (i, v) in tuple.iter().enumerate() {
                record.put(
                    self.column_name(self.step.num_group_columns + i),
                    v.clone(),
                );
            }
        }
        FieldValue::Map(record)
    }

    fn column_name(&self, i: usize) -> String {
        self.step
            .column_names
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("Column_{}", i + 1))
    }
}

/// Fold one value into an aggregate slot. Returns the memory delta of the
/// slot (zero when the slot's identity did not change).
pub(crate) fn apply_aggregate(
    slot: &mut FieldValue,
    func: AggrFunc,
    value: &FieldValue,
) -> Result<i64, Error> {
    let before = slot.memory_size() as i64;
    match func {
        AggrFunc::CountStar => {
            bump_count(slot);
        }
        AggrFunc::Count => {
            if !value.is_special() {
                bump_count(slot);
            }
        }
        AggrFunc::CountNumbers => {
            if value.is_numeric() {
                bump_count(slot);
            }
        }
        AggrFunc::Sum => {
            if value.is_numeric() {
                if slot.is_numeric() {
                    *slot = add_numeric(slot, value);
                } else {
                    // NULL promotes to the first numeric input.
                    *slot = value.clone();
                }
            }
        }
        AggrFunc::Min | AggrFunc::Max => {
            if !value.is_special() {
                let replace = if matches!(slot, FieldValue::Null) {
                    true
                } else {
                    match query_compare(value, slot, 1) {
                        // Incomparable newcomers are ignored.
                        Err(_) => false,
                        Ok(ord) => {
                            if func == AggrFunc::Min {
                                ord == std::cmp::Ordering::Less
                            } else {
                                ord == std::cmp::Ordering::Greater
                            }
                        }
                    }
                };
                if replace {
                    *slot = value.clone();
                }
            }
        }
    }
    Ok(slot.memory_size() as i64 - before)
}

fn bump_count(slot: &mut FieldValue) {
    let n = slot.as_i64().unwrap_or(0);
    *slot = FieldValue::Long(n + 1);
}

/// Numeric addition along the int → long → double → decimal ladder.
/// Integer overflow promotes to decimal rather than wrapping.
pub(crate) fn add_numeric(a: &FieldValue, b: &FieldValue) -> FieldValue {
    use FieldValue::*;
    match (a, b) {
        (Decimal(x), _) | (_, Decimal(x)) => {
            let other = if matches!(a, Decimal(_)) { b } else { a };
            match decimal_of(other) {
                Some(d) => Decimal(x + d),
                // A non-finite double swamps any exact value.
                None => Double(f64::NAN),
            }
        }
        (Double(_), _) | (_, Double(_)) => {
            Double(a.as_f64().unwrap_or(f64::NAN) + b.as_f64().unwrap_or(f64::NAN))
        }
        _ => {
            let (x, y) = (a.as_i64().unwrap_or(0), b.as_i64().unwrap_or(0));
            match x.checked_add(y) {
                Some(sum) => Long(sum),
                None => Decimal(BigDecimal::from(x) + BigDecimal::from(y)),
            }
        }
    }
}

fn decimal_of(v: &FieldValue) -> Option<BigDecimal> {
    match v {
        FieldValue::Integer(i) => Some(BigDecimal::from(*i as i64)),
        FieldValue::Long(l) => Some(BigDecimal::from(*l)),
        FieldValue::Double(d) => BigDecimal::try_from(*d).ok(),
        FieldValue::Decimal(d) => Some(d.clone()),
        _ => None,
    }
}
