//! The select-from-where iterator: projection, offset/limit, and
//! server-assisted grouping where the FROM stream arrives ordered by the
//! grouping columns.

use crate::compare::query_equals;
use crate::error::{Error, arg_err};
use crate::query::PlanIter;
use crate::query::group::apply_aggregate;
use crate::query::plan::{AggrFunc, ExprStep, SfwStep};
use crate::query::runtime::QueryRuntime;
use crate::value::{FieldValue, MapValue};

/// A synchronous value iterator: produces at most one value per reset into
/// its result register.
pub(crate) enum ExprIter {
    Const {
        reg: usize,
        value: FieldValue,
        done: bool,
    },
    ExtVar {
        reg: usize,
        name: String,
        done: bool,
    },
    VarRef {
        reg: usize,
        done: bool,
    },
    Field {
        reg: usize,
        input: Box<ExprIter>,
        field: String,
    },
    Aggr {
        reg: usize,
        func: AggrFunc,
        input: Box<ExprIter>,
        acc: FieldValue,
    },
}

impl ExprIter {
    pub fn build(step: &ExprStep) -> ExprIter {
        match step {
            ExprStep::Const { result_reg, value } => ExprIter::Const {
                reg: *result_reg,
                value: value.clone(),
                done: false,
            },
            ExprStep::ExtVar { result_reg, name } => ExprIter::ExtVar {
                reg: *result_reg,
                name: name.clone(),
                done: false,
            },
            ExprStep::VarRef { result_reg } => ExprIter::VarRef {
                reg: *result_reg,
                done: false,
            },
            ExprStep::Field {
                result_reg,
                input,
                field,
            } => ExprIter::Field {
                reg: *result_reg,
                input: Box::new(ExprIter::build(input)),
                field: field.clone(),
            },
            ExprStep::Aggr {
                result_reg,
                func,
                input,
            } => ExprIter::Aggr {
                reg: *result_reg,
                func: *func,
                input: Box::new(ExprIter::build(input)),
                acc: match func {
                    AggrFunc::CountStar | AggrFunc::Count | AggrFunc::CountNumbers => {
                        FieldValue::Long(0)
                    }
                    _ => FieldValue::Null,
                },
            },
        }
    }

    pub fn result_reg(&self) -> usize {
        match self {
            ExprIter::Const { reg, .. }
            | ExprIter::ExtVar { reg, .. }
            | ExprIter::VarRef { reg, .. }
            | ExprIter::Field { reg, .. }
            | ExprIter::Aggr { reg, .. } => *reg,
        }
    }

    /// Arm the iterator for the next input row.
    pub fn reset(&mut self) {
        match self {
            ExprIter::Const { done, .. }
            | ExprIter::ExtVar { done, .. }
            | ExprIter::VarRef { done, .. } => *done = false,
            ExprIter::Field { input, .. } => input.reset(),
            ExprIter::Aggr { input, .. } => input.reset(),
        }
    }

    /// Produce the next value into the result register. `false` means the
    /// expression has no value for this row (exhausted, or a missing
    /// field was stepped over).
    pub fn next(&mut self, rt: &mut QueryRuntime) -> Result<bool, Error> {
        match self {
            ExprIter::Const { reg, value, done } => {
                if *done {
                    return Ok(false);
                }
                *done = true;
                rt.set_reg(*reg, value.clone());
                Ok(true)
            }
            ExprIter::ExtVar { reg, name, done } => {
                if *done {
                    return Ok(false);
                }
                *done = true;
                let value = rt
                    .external_vars
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| {
                        Error::Argument(format!("unbound external variable {name}"))
                    })?;
                rt.set_reg(*reg, value);
                Ok(true)
            }
            ExprIter::VarRef { reg, done } => {
                if *done {
                    return Ok(false);
                }
                *done = true;
                // The referenced register already holds the value.
                Ok(!matches!(rt.get_reg(*reg), FieldValue::Uninitialized))
            }
            ExprIter::Field { reg, input, field } => {
                if !input.next(rt)? {
                    return Ok(false);
                }
                let value = match rt.get_reg(input.result_reg()) {
                    FieldValue::Map(m) => m.get(field).cloned(),
                    _ => None,
                };
                match value {
                    Some(v) => {
                        rt.set_reg(*reg, v);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            ExprIter::Aggr { func, input, acc, .. } => {
                // Accumulate this row; aggregates never produce a per-row
                // value. The fold is read out by `collect`.
                input.reset();
                if input.next(rt)? {
                    let reg = input.result_reg();
                    let value = rt.take_reg(reg);
                    apply_aggregate(acc, *func, &value)?;
                } else if matches!(func, AggrFunc::CountStar) {
                    apply_aggregate(acc, *func, &FieldValue::Empty)?;
                }
                Ok(false)
            }
        }
    }

    /// Read out an aggregate's accumulated value, optionally resetting it
    /// for the next group.
    pub fn collect(&mut self, reset: bool) -> FieldValue {
        match self {
            ExprIter::Aggr { func, acc, .. } => {
                let fresh = match func {
                    AggrFunc::CountStar | AggrFunc::Count | AggrFunc::CountNumbers => {
                        FieldValue::Long(0)
                    }
                    _ => FieldValue::Null,
                };
                if reset {
                    std::mem::replace(acc, fresh)
                } else {
                    acc.clone()
                }
            }
            _ => FieldValue::Null,
        }
    }

    fn is_aggregate(&self) -> bool {
        matches!(self, ExprIter::Aggr { .. })
    }
}

pub(crate) struct SfwIter {
    step: SfwStep,
    from: Box<PlanIter>,
    columns: Vec<ExprIter>,
    offset_expr: Option<ExprIter>,
    limit_expr: Option<ExprIter>,
    opened: bool,
    offset_remaining: u64,
    limit: Option<u64>,
    emitted: u64,
    /// Grouping mode: the group currently being folded.
    current_key: Option<Vec<FieldValue>>,
    from_done: bool,
}

impl SfwIter {
    pub fn new(step: &SfwStep) -> Self {
        SfwIter {
            from: Box::new(PlanIter::build(&step.from)),
            columns: step.columns.iter().map(ExprIter::build).collect(),
            offset_expr: step.offset.as_ref().map(ExprIter::build),
            limit_expr: step.limit.as_ref().map(ExprIter::build),
            step: step.clone(),
            opened: false,
            offset_remaining: 0,
            limit: None,
            emitted: 0,
            current_key: None,
            from_done: false,
        }
    }

    pub fn result_reg(&self) -> usize {
        self.step.result_reg
    }

    /// OFFSET/LIMIT expressions are evaluated exactly once, before the
    /// first row flows.
    fn open(&mut self, rt: &mut QueryRuntime) -> Result<(), Error> {
        if self.opened {
            return Ok(());
        }
        if let Some(expr) = &mut self.offset_expr {
            self.offset_remaining = eval_bound(expr, rt, "OFFSET")?;
        }
        if let Some(expr) = &mut self.limit_expr {
            self.limit = Some(eval_bound(expr, rt, "LIMIT")?);
        }
        self.opened = true;
        Ok(())
    }

    pub async fn next(&mut self, rt: &mut QueryRuntime) -> Result<bool, Error> {
        self.open(rt)?;
        if let Some(limit) = self.limit
            && self.emitted >= limit
        {
            return Ok(false);
        }
        if self.step.group_column_count.is_some() {
            self.next_grouping(rt).await
        } else {
            self.next_plain(rt).await
        }
    }

    async fn next_plain(&mut self, rt: &mut QueryRuntime) -> Result<bool, Error> {
        loop {
            if !self.from.next(rt).await? {
                return Ok(false);
            }
            // One decrement per candidate row, before the projections run.
            if self.offset_remaining > 0 {
                self.offset_remaining -= 1;
                continue;
            }

            if self.step.is_select_star {
                if self.step.result_reg != self.from.result_reg() {
                    let row = rt.take_reg(self.from.result_reg());
                    rt.set_reg(self.step.result_reg, row);
                }
                self.emitted += 1;
                return Ok(true);
            }

            let mut record = MapValue::new();
            for (i, expr) in self.columns.iter_mut().enumerate() {
                expr.reset();
                let value = if expr.next(rt)? {
                    rt.take_reg(expr.result_reg())
                } else {
                    FieldValue::Null
                };
                record.put(column_name(&self.step, i), value);
            }
            rt.set_reg(self.step.result_reg, FieldValue::Map(record));
            self.emitted += 1;
            return Ok(true);
        }
    }

    async fn next_grouping(&mut self, rt: &mut QueryRuntime) -> Result<bool, Error> {
        let num_group_cols = self.step.group_column_count.unwrap_or(0);
        loop {
            if self.from_done {
                return Ok(false);
            }
            if !self.from.next(rt).await? {
                if rt.need_continuation {
                    // The pending group must not be emitted from a partial
                    // input; it finishes on a later call.
                    return Ok(false);
                }
                self.from_done = true;
                // Emit the final pending group, if one was started and the
                // offset is already consumed.
                if self.current_key.is_none() {
                    return Ok(false);
                }
                if self.offset_remaining > 0 {
                    self.offset_remaining -= 1;
                    self.current_key = None;
                    return Ok(false);
                }
                let key = self.current_key.take().expect("checked above");
                let record = self.emit_group(key);
                rt.set_reg(self.step.result_reg, record);
                self.emitted += 1;
                return Ok(true);
            }

            // Evaluate the grouping expressions for this row. A missing
            // JSON field skips the row without ending the current group.
            let mut key = Vec::with_capacity(num_group_cols);
            let mut missing = false;
            for expr in self.columns.iter_mut().take(num_group_cols) {
                expr.reset();
                if expr.next(rt)? {
                    key.push(rt.take_reg(expr.result_reg()));
                } else {
                    missing = true;
                    break;
                }
            }
            if missing {
                continue;
            }

            let same_group = self
                .current_key
                .as_ref()
                .is_some_and(|cur| keys_equal(cur, &key));

            if same_group {
                self.fold_row(rt)?;
                continue;
            }

            let previous = self.current_key.replace(key);
            // Aggregates restart for the new group; collect the previous
            // group's values first.
            let record = previous.map(|prev| self.emit_group(prev));
            self.fold_row(rt)?;

            if let Some(record) = record {
                if self.offset_remaining > 0 {
                    self.offset_remaining -= 1;
                    continue;
                }
                rt.set_reg(self.step.result_reg, record);
                self.emitted += 1;
                return Ok(true);
            }
        }
    }

    /// Fold the current FROM row into the aggregate columns.
    fn fold_row(&mut self, rt: &mut QueryRuntime) -> Result<(), Error> {
        let num_group_cols = self.step.group_column_count.unwrap_or(0);
        for expr in self.columns.iter_mut().skip(num_group_cols) {
            if expr.is_aggregate() {
                expr.next(rt)?;
            }
        }
        Ok(())
    }

    /// Build the output record for a completed group and reset the
    /// aggregate accumulators.
    fn emit_group(&mut self, key: Vec<FieldValue>) -> FieldValue {
        let num_group_cols = self.step.group_column_count.unwrap_or(0);
        let mut record = MapValue::new();
        for (i, v) in key.into_iter().enumerate() {
            record.put(column_name(&self.step, i), v);
        }
        for i in num_group_cols..self.columns.len() {
            let value = self.columns[i].collect(true);
            record.put(column_name(&self.step, i), value);
        }
        FieldValue::Map(record)
    }
}

fn keys_equal(a: &[FieldValue], b: &[FieldValue]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| query_equals(x, y))
}

fn column_name(step: &SfwStep, i: usize) -> String {
    step.column_names
        .get(i)
        .cloned()
        .unwrap_or_else(|| format!("Column_{}", i + 1))
}

/// Evaluate an OFFSET/LIMIT expression: exactly one non-negative integer.
fn eval_bound(
    expr: &mut ExprIter,
    rt: &mut QueryRuntime,
    what: &str,
) -> Result<u64, Error> {
    expr.reset();
    if !expr.next(rt)? {
        return arg_err!("{what} expression produced no value");
    }
    let value = rt.take_reg(expr.result_reg());
    if expr.next(rt)? {
        return arg_err!("{what} expression produced more than one value");
    }
    match value.as_i64() {
        Some(n) if n >= 0 => Ok(n as u64),
        _ => arg_err!("{what} must be a non-negative integer, got {value:?}"),
    }
}
