//! The sort iterator: drain, order, emit.

use std::cmp::Ordering;

use crate::compare::compare_rows;
use crate::error::Error;
use crate::query::PlanIter;
use crate::query::plan::SortStep;
use crate::query::runtime::QueryRuntime;
use crate::value::{FieldValue, MapValue};

pub(crate) struct SortIter {
    step: SortStep,
    input: Box<PlanIter>,
    /// Collected rows; slots are cleared as they are emitted so their
    /// storage can be reclaimed mid-drain.
    rows: Vec<Option<MapValue>>,
    pos: usize,
    drained: bool,
}

impl SortIter {
    pub fn new(step: &SortStep) -> Self {
        SortIter {
            input: Box::new(PlanIter::build(&step.input)),
            step: step.clone(),
            rows: Vec::new(),
            pos: 0,
            drained: false,
        }
    }

    pub fn result_reg(&self) -> usize {
        self.step.result_reg
    }

    pub async fn next(&mut self, rt: &mut QueryRuntime) -> Result<bool, Error> {
        while !self.drained {
            if self.input.next(rt).await? {
                let row = match rt.take_reg(self.input.result_reg()) {
                    FieldValue::Map(m) => m,
                    other => {
                        return Err(Error::BadProtocol(format!(
                            "sort input produced a non-record value: {other:?}"
                        )));
                    }
                };
                if self.step.count_memory {
                    rt.charge_memory(row.memory_size())?;
                }
                self.rows.push(Some(row));
                continue;
            }
            if rt.need_continuation {
                // The input could not finish this call; resume draining on
                // the next one without sorting a partial set.
                return Ok(false);
            }
            let mut sort_err: Option<Error> = None;
            let specs = &self.step.specs;
            self.rows.sort_by(|a, b| {
                let (a, b) = (a.as_ref().expect("pre-drain"), b.as_ref().expect("pre-drain"));
                match compare_rows(a, b, specs) {
                    Ok(ord) => ord,
                    Err(e) => {
                        sort_err.get_or_insert(e);
                        Ordering::Equal
                    }
                }
            });
            if let Some(e) = sort_err {
                return Err(e);
            }
            self.drained = true;
        }

        match self.rows.get_mut(self.pos).and_then(Option::take) {
            Some(row) => {
                self.pos += 1;
                if self.step.count_memory {
                    rt.adjust_memory(-(row.memory_size() as i64))?;
                }
                rt.set_reg(self.step.result_reg, FieldValue::Map(row));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
