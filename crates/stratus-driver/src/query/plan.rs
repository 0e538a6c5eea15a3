//! The client-side query plan: tagged step variants and their decoding.
//!
//! A prepared statement for an "advanced" query carries a plan tree the
//! driver must execute: receive steps talk to the server, the rest reshape
//! rows locally. Steps that produce a value per input row (projections,
//! constants, aggregate accumulators) are a separate, synchronous kind.

use crate::compare::SortSpec;
use crate::error::Error;
use crate::value::FieldValue;
use serde_json::Value as Json;

/// How the server spread the query across the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Distribution {
    SinglePartition,
    AllShards,
    AllPartitions,
}

/// A row-producing plan step. Receive steps perform I/O; the others drive
/// their input step.
#[derive(Debug, Clone)]
pub(crate) enum PlanStep {
    Receive(ReceiveStep),
    Sort(SortStep),
    Group(GroupStep),
    Sfw(SfwStep),
}

#[derive(Debug, Clone)]
pub(crate) struct ReceiveStep {
    pub result_reg: usize,
    pub distribution: Distribution,
    /// Non-empty when the server expects the driver to merge-sort partial
    /// results from shards or partitions.
    pub sort_specs: Vec<SortSpec>,
    /// Primary-key columns used to fingerprint rows for duplicate
    /// elimination on multi-shard/partition index scans.
    pub primary_key_fields: Vec<String>,
    pub eliminate_duplicates: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct SortStep {
    pub result_reg: usize,
    pub input: Box<PlanStep>,
    pub specs: Vec<SortSpec>,
    /// Whether cached rows are charged to the query memory budget.
    pub count_memory: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct GroupStep {
    pub result_reg: usize,
    pub input: Box<PlanStep>,
    /// The first N columns of each input row are the grouping tuple.
    pub num_group_columns: usize,
    /// Output column names: grouping columns first, then aggregates.
    pub column_names: Vec<String>,
    /// One aggregate per non-grouping column.
    pub aggr_funcs: Vec<AggrFunc>,
    pub is_distinct: bool,
    /// Discard each group as it is emitted.
    pub remove_result: bool,
    pub count_memory: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct SfwStep {
    pub result_reg: usize,
    pub from: Box<PlanStep>,
    pub column_names: Vec<String>,
    pub columns: Vec<ExprStep>,
    /// `Some(n)`: the first n projections are grouping expressions and the
    /// rest are aggregates folded per group. `None`: plain projection.
    pub group_column_count: Option<usize>,
    pub offset: Option<ExprStep>,
    pub limit: Option<ExprStep>,
    /// SELECT *: the FROM row is the result, no record assembly.
    pub is_select_star: bool,
}

/// A synchronous, value-producing step.
#[derive(Debug, Clone)]
pub(crate) enum ExprStep {
    Const {
        result_reg: usize,
        value: FieldValue,
    },
    /// A caller-bound external variable.
    ExtVar {
        result_reg: usize,
        name: String,
    },
    /// Reads another step's result register (typically the FROM row).
    VarRef {
        result_reg: usize,
    },
    Field {
        result_reg: usize,
        input: Box<ExprStep>,
        field: String,
    },
    /// An aggregate accumulator over its input expression.
    Aggr {
        result_reg: usize,
        func: AggrFunc,
        input: Box<ExprStep>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AggrFunc {
    Min,
    Max,
    Sum,
    CountStar,
    Count,
    CountNumbers,
}

impl PlanStep {
    pub fn result_reg(&self) -> usize {
        match self {
            PlanStep::Receive(s) => s.result_reg,
            PlanStep::Sort(s) => s.result_reg,
            PlanStep::Group(s) => s.result_reg,
            PlanStep::Sfw(s) => s.result_reg,
        }
    }

    /// Decode a plan tree from its wire form.
    pub fn from_wire(j: &Json) -> Result<PlanStep, Error> {
        let kind = j["iterator"]
            .as_str()
            .ok_or_else(|| Error::BadProtocol("plan step lacks an iterator kind".into()))?;
        let result_reg = reg(j)?;
        Ok(match kind {
            "RECEIVE" => {
                let distribution = match j["distribution"].as_str() {
                    Some("ALL_SHARDS") => Distribution::AllShards,
                    Some("ALL_PARTITIONS") => Distribution::AllPartitions,
                    Some("SINGLE_PARTITION") | None => Distribution::SinglePartition,
                    Some(other) => {
                        return Err(Error::BadProtocol(format!(
                            "unknown distribution {other:?}"
                        )));
                    }
                };
                PlanStep::Receive(ReceiveStep {
                    result_reg,
                    distribution,
                    sort_specs: decode_sort_specs(&j["sort_specs"])?,
                    primary_key_fields: string_array(&j["primary_key_fields"]),
                    eliminate_duplicates: j["eliminate_duplicates"].as_bool().unwrap_or(false),
                })
            }
            "SORT" => PlanStep::Sort(SortStep {
                result_reg,
                input: Box::new(PlanStep::from_wire(&j["input"])?),
                specs: decode_sort_specs(&j["sort_specs"])?,
                count_memory: j["count_memory"].as_bool().unwrap_or(true),
            }),
            "GROUP" => {
                let aggr_names = string_array(&j["aggregates"]);
                let mut aggr_funcs = Vec::with_capacity(aggr_names.len());
                for name in &aggr_names {
                    aggr_funcs.push(aggr_func(name)?);
                }
                PlanStep::Group(GroupStep {
                    result_reg,
                    input: Box::new(PlanStep::from_wire(&j["input"])?),
                    num_group_columns: j["num_group_columns"].as_u64().unwrap_or(0) as usize,
                    column_names: string_array(&j["column_names"]),
                    aggr_funcs,
                    is_distinct: j["is_distinct"].as_bool().unwrap_or(false),
                    remove_result: j["remove_result"].as_bool().unwrap_or(false),
                    count_memory: j["count_memory"].as_bool().unwrap_or(true),
                })
            }
            "SFW" => {
                let mut columns = Vec::new();
                if let Some(arr) = j["columns"].as_array() {
                    for c in arr {
                        columns.push(ExprStep::from_wire(c)?);
                    }
                }
                let group_column_count = match j["group_column_count"].as_i64() {
                    None => None,
                    Some(n) if n < 0 => None,
                    Some(n) => Some(n as usize),
                };
                PlanStep::Sfw(SfwStep {
                    result_reg,
                    from: Box::new(PlanStep::from_wire(&j["from"])?),
                    column_names: string_array(&j["column_names"]),
                    columns,
                    group_column_count,
                    offset: opt_expr(&j["offset"])?,
                    limit: opt_expr(&j["limit"])?,
                    is_select_star: j["is_select_star"].as_bool().unwrap_or(false),
                })
            }
            other => {
                return Err(Error::BadProtocol(format!(
                    "unknown plan iterator {other:?}"
                )));
            }
        })
    }
}

impl ExprStep {
    pub fn result_reg(&self) -> usize {
        match self {
            ExprStep::Const { result_reg, .. }
            | ExprStep::ExtVar { result_reg, .. }
            | ExprStep::VarRef { result_reg }
            | ExprStep::Field { result_reg, .. }
            | ExprStep::Aggr { result_reg, .. } => *result_reg,
        }
    }

    pub fn from_wire(j: &Json) -> Result<ExprStep, Error> {
        let kind = j["iterator"]
            .as_str()
            .ok_or_else(|| Error::BadProtocol("expr step lacks an iterator kind".into()))?;
        let result_reg = reg(j)?;
        Ok(match kind {
            "CONST" => ExprStep::Const {
                result_reg,
                value: FieldValue::from_wire_json(&j["value"])?,
            },
            "EXT_VAR" => ExprStep::ExtVar {
                result_reg,
                name: j["name"]
                    .as_str()
                    .ok_or_else(|| Error::BadProtocol("EXT_VAR lacks a name".into()))?
                    .to_string(),
            },
            "VAR_REF" => ExprStep::VarRef { result_reg },
            "FIELD_STEP" => ExprStep::Field {
                result_reg,
                input: Box::new(ExprStep::from_wire(&j["input"])?),
                field: j["field"]
                    .as_str()
                    .ok_or_else(|| Error::BadProtocol("FIELD_STEP lacks a field".into()))?
                    .to_string(),
            },
            "FN_MIN" | "FN_MAX" | "FN_SUM" | "FN_COUNT" | "FN_COUNT_STAR"
            | "FN_COUNT_NUMBERS" => ExprStep::Aggr {
                result_reg,
                func: aggr_func(kind.trim_start_matches("FN_"))?,
                input: Box::new(ExprStep::from_wire(&j["input"])?),
            },
            other => {
                return Err(Error::BadProtocol(format!(
                    "unknown expr iterator {other:?}"
                )));
            }
        })
    }
}

fn reg(j: &Json) -> Result<usize, Error> {
    j["result_reg"]
        .as_u64()
        .map(|r| r as usize)
        .ok_or_else(|| Error::BadProtocol("plan step lacks a result register".into()))
}

fn aggr_func(name: &str) -> Result<AggrFunc, Error> {
    Ok(match name {
        "MIN" => AggrFunc::Min,
        "MAX" => AggrFunc::Max,
        "SUM" => AggrFunc::Sum,
        "COUNT_STAR" => AggrFunc::CountStar,
        "COUNT" => AggrFunc::Count,
        "COUNT_NUMBERS" => AggrFunc::CountNumbers,
        other => {
            return Err(Error::BadProtocol(format!(
                "unknown aggregate function {other:?}"
            )));
        }
    })
}

fn decode_sort_specs(j: &Json) -> Result<Vec<SortSpec>, Error> {
    let Some(arr) = j.as_array() else {
        return Ok(Vec::new());
    };
    let mut specs = Vec::with_capacity(arr.len());
    for s in arr {
        let field = s["field"]
            .as_str()
            .ok_or_else(|| Error::BadProtocol("sort spec lacks a field".into()))?;
        specs.push(SortSpec {
            field: field.to_string(),
            descending: s["descending"].as_bool().unwrap_or(false),
            nulls_first: s["nulls_first"].as_bool().unwrap_or(false),
        });
    }
    Ok(specs)
}

fn string_array(j: &Json) -> Vec<String> {
    j.as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn opt_expr(j: &Json) -> Result<Option<ExprStep>, Error> {
    if j.is_null() {
        Ok(None)
    } else {
        Ok(Some(ExprStep::from_wire(j)?))
    }
}
