//! Wire protocol: serial-version negotiation and the JSON codec.
//!
//! The driver opens every exchange at its highest serial version; a server
//! answering `UnsupportedProtocol` makes the execution loop walk the version
//! down one step at a time, using a compare-and-swap so concurrent attempts
//! decrement at most once per observed version.

use std::sync::atomic::{AtomicI16, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde_json::{Value as Json, json};

use crate::error::Error;
use crate::query::PreparedStatement;
use crate::requests::{BatchOpKind, Consistency, Op, PutOption, TimeToLive};
use crate::results::{
    BatchOperationResult, ConsumedCapacity, DeleteResult, GetResult, ListTablesResult,
    MultiDeleteResult, OpOutcome, Phase1Results, PrepareResult, PutResult, QueryBatch,
    SystemResult, SystemState, TableUsage, TableUsageResult, WriteMultipleResult,
};
use crate::table::{CapacityMode, TableLimits, TableResult, TableState};
use crate::value::{FieldValue, MapValue, Version};

pub(crate) const SERIAL_V2: i16 = 2;
pub(crate) const SERIAL_V3: i16 = 3;
pub(crate) const SERIAL_V4: i16 = 4;
pub(crate) const DEFAULT_SERIAL_VERSION: i16 = SERIAL_V4;

/// The negotiated serial version, shared by every caller of one client.
#[derive(Debug)]
pub(crate) struct SerialVersion {
    current: AtomicI16,
}

impl SerialVersion {
    pub fn new() -> Self {
        SerialVersion {
            current: AtomicI16::new(DEFAULT_SERIAL_VERSION),
        }
    }

    pub fn current(&self) -> i16 {
        self.current.load(Ordering::Acquire)
    }

    /// Step down from `observed`. Returns false only when no further
    /// fallback exists; a lost race counts as success because some caller
    /// made progress.
    pub fn decrement(&self, observed: i16) -> bool {
        if observed <= SERIAL_V2 {
            return false;
        }
        match self.current.compare_exchange(
            observed,
            observed - 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(actual) => actual != observed,
        }
    }
}

/// Encodes requests and decodes responses for one wire format.
pub(crate) trait ProtocolHandler: Send + Sync {
    fn content_type(&self) -> &'static str;

    fn serial_version(&self) -> i16;

    fn decrement_serial_version(&self, observed: i16) -> bool;

    fn encode(&self, op: &Op, timeout: Duration, serial_version: i16) -> Result<Vec<u8>, Error>;

    fn decode(&self, op: &Op, body: &[u8]) -> Result<OpOutcome, Error>;
}

/// The versioned JSON wire format.
#[derive(Debug)]
pub(crate) struct JsonProtocol {
    version: SerialVersion,
}

impl JsonProtocol {
    pub fn new() -> Self {
        JsonProtocol {
            version: SerialVersion::new(),
        }
    }
}

impl ProtocolHandler for JsonProtocol {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serial_version(&self) -> i16 {
        self.version.current()
    }

    fn decrement_serial_version(&self, observed: i16) -> bool {
        self.version.decrement(observed)
    }

    fn encode(&self, op: &Op, timeout: Duration, serial_version: i16) -> Result<Vec<u8>, Error> {
        let mut frame = json!({
            "version": serial_version,
            "op": op.kind(),
            "timeout_ms": timeout.as_millis() as u64,
        });
        if let Some(table) = op.table_name() {
            frame["table"] = Json::String(table.to_string());
        }
        frame["payload"] = encode_payload(op)?;
        serde_json::to_vec(&frame)
            .map_err(|e| Error::BadProtocol(format!("request encode failed: {e}")))
    }

    fn decode(&self, op: &Op, body: &[u8]) -> Result<OpOutcome, Error> {
        let j: Json = serde_json::from_slice(body)
            .map_err(|e| Error::BadProtocol(format!("response parse failed: {e}")))?;

        let code = j["error_code"].as_i64().unwrap_or(0) as i32;
        if code != 0 {
            let msg = j["exception"].as_str().unwrap_or("");
            let err = Error::from_code(code, msg);
            if let Error::UnsupportedProtocol { .. } = err {
                return Err(Error::UnsupportedProtocol {
                    version: self.serial_version(),
                });
            }
            return Err(err);
        }

        decode_payload(op, &j)
    }
}

// ── request payloads ───────────────────────────────────────────────────

fn encode_payload(op: &Op) -> Result<Json, Error> {
    Ok(match op {
        Op::Get(r) => json!({
            "key": r.key.to_wire_json()?,
            "consistency": consistency_name(r.consistency),
        }),
        Op::Put(r) => encode_put(r)?,
        Op::Delete(r) => encode_delete(r)?,
        Op::WriteMultiple(r) => {
            let mut ops = Vec::with_capacity(r.operations.len());
            for entry in &r.operations {
                let mut o = match &entry.op {
                    BatchOpKind::Put(p) => {
                        let mut o = encode_put(p)?;
                        o["type"] = json!("PUT");
                        o
                    }
                    BatchOpKind::Delete(d) => {
                        let mut o = encode_delete(d)?;
                        o["type"] = json!("DELETE");
                        o
                    }
                };
                o["abort_on_fail"] = json!(entry.abort_on_fail);
                ops.push(o);
            }
            json!({ "operations": ops })
        }
        Op::MultiDelete(r) => {
            let mut p = json!({
                "key": r.key.to_wire_json()?,
                "max_write_kb": r.max_write_kb,
            });
            if let Some(range) = &r.range {
                let mut rj = json!({ "field": range.field });
                if let Some((v, inclusive)) = &range.start {
                    rj["start"] = v.to_wire_json()?;
                    rj["start_inclusive"] = json!(inclusive);
                }
                if let Some((v, inclusive)) = &range.end {
                    rj["end"] = v.to_wire_json()?;
                    rj["end_inclusive"] = json!(inclusive);
                }
                p["range"] = rj;
            }
            if let Some(ck) = &r.continuation_key {
                p["continuation_key"] = json!(BASE64.encode(ck));
            }
            p
        }
        Op::Prepare(r) => json!({ "statement": r.statement }),
        Op::QueryFetch(r) => {
            let mut p = json!({
                "consistency": consistency_name(r.consistency),
                "max_read_kb": r.max_read_kb,
            });
            if let Some(s) = &r.statement {
                p["statement"] = json!(s);
            }
            if let Some(prepared) = &r.prepared {
                p["prepared_statement"] = json!(BASE64.encode(prepared));
            }
            if !r.bind_variables.is_empty() {
                let mut vars = Vec::with_capacity(r.bind_variables.len());
                for (name, value) in &r.bind_variables {
                    vars.push(json!({ "name": name, "value": value.to_wire_json()? }));
                }
                p["bind_variables"] = Json::Array(vars);
            }
            if let Some(ck) = &r.continuation_key {
                p["continuation_key"] = json!(BASE64.encode(ck));
            }
            if let Some(shard) = r.shard_id {
                p["shard_id"] = json!(shard);
            }
            if let Some(limit) = r.number_limit {
                p["number_limit"] = json!(limit);
            }
            p
        }
        Op::Table(r) => {
            let mut p = json!({});
            if let Some(s) = &r.statement {
                p["statement"] = json!(s);
            }
            if let Some(limits) = &r.limits {
                p["limits"] = encode_limits(limits);
            }
            p
        }
        Op::GetTable(r) => {
            let mut p = json!({});
            if let Some(id) = &r.operation_id {
                p["operation_id"] = json!(id);
            }
            p
        }
        Op::ListTables(r) => {
            let mut p = json!({
                "start_index": r.start_index,
                "limit": r.limit,
            });
            if let Some(ns) = &r.namespace {
                p["namespace"] = json!(ns);
            }
            p
        }
        Op::TableUsage(r) => {
            let mut p = json!({
                "start_index": r.start_index,
                "limit": r.limit,
            });
            if let Some(t) = r.start_time {
                p["start_time"] = json!(t.to_rfc3339());
            }
            if let Some(t) = r.end_time {
                p["end_time"] = json!(t.to_rfc3339());
            }
            p
        }
        Op::System(r) => json!({ "statement": r.statement }),
        Op::SystemStatus(r) => json!({ "operation_id": r.operation_id }),
    })
}

fn encode_put(r: &crate::requests::PutRequest) -> Result<Json, Error> {
    let mut p = json!({
        "row": r.row.to_wire_json()?,
        "return_row": r.return_row,
    });
    match &r.option {
        Some(PutOption::IfAbsent) => p["option"] = json!("IF_ABSENT"),
        Some(PutOption::IfPresent) => p["option"] = json!("IF_PRESENT"),
        Some(PutOption::IfVersion(v)) => {
            p["option"] = json!("IF_VERSION");
            p["match_version"] = json!(BASE64.encode(v.as_bytes()));
        }
        None => {}
    }
    match r.ttl {
        Some(TimeToLive::Hours(h)) => p["ttl"] = json!({ "hours": h }),
        Some(TimeToLive::Days(d)) => p["ttl"] = json!({ "days": d }),
        Some(TimeToLive::DoNotExpire) => p["ttl"] = json!("NONE"),
        None => {}
    }
    Ok(p)
}

fn encode_delete(r: &crate::requests::DeleteRequest) -> Result<Json, Error> {
    let mut p = json!({
        "key": r.key.to_wire_json()?,
        "return_row": r.return_row,
    });
    if let Some(v) = &r.match_version {
        p["match_version"] = json!(BASE64.encode(v.as_bytes()));
    }
    Ok(p)
}

fn encode_limits(l: &TableLimits) -> Json {
    json!({
        "mode": match l.mode {
            CapacityMode::Provisioned => "PROVISIONED",
            CapacityMode::OnDemand => "ON_DEMAND",
        },
        "read_units": l.read_units,
        "write_units": l.write_units,
        "storage_gb": l.storage_gb,
    })
}

fn consistency_name(c: Consistency) -> &'static str {
    match c {
        Consistency::Eventual => "EVENTUAL",
        Consistency::Absolute => "ABSOLUTE",
    }
}

// ── response payloads ──────────────────────────────────────────────────

fn decode_payload(op: &Op, j: &Json) -> Result<OpOutcome, Error> {
    let consumed = decode_consumed(j);
    Ok(match op {
        Op::Get(_) => OpOutcome::Get(GetResult {
            row: decode_opt_map(&j["row"])?,
            version: decode_opt_version(&j["version"])?,
            modification_time: decode_opt_time(&j["modified"])?,
            consumed,
        }),
        Op::Put(_) => OpOutcome::Put(decode_put_result(j, consumed)?),
        Op::Delete(_) => OpOutcome::Delete(DeleteResult {
            success: j["success"].as_bool().unwrap_or(false),
            existing_row: decode_opt_map(&j["existing_row"])?,
            existing_version: decode_opt_version(&j["existing_version"])?,
            consumed,
        }),
        Op::WriteMultiple(_) => {
            let mut results = Vec::new();
            if let Some(arr) = j["results"].as_array() {
                for item in arr {
                    results.push(BatchOperationResult {
                        success: item["success"].as_bool().unwrap_or(false),
                        version: decode_opt_version(&item["version"])?,
                        generated_value: decode_opt_value(&item["generated"])?,
                        existing_row: decode_opt_map(&item["existing_row"])?,
                        existing_version: decode_opt_version(&item["existing_version"])?,
                    });
                }
            }
            OpOutcome::WriteMultiple(WriteMultipleResult {
                results,
                failed_operation_index: j["failed_index"].as_u64().map(|i| i as usize),
                consumed,
            })
        }
        Op::MultiDelete(_) => OpOutcome::MultiDelete(MultiDeleteResult {
            num_deleted: j["num_deleted"].as_u64().unwrap_or(0),
            continuation_key: decode_opt_binary(&j["continuation_key"])?,
            consumed,
        }),
        Op::Prepare(_) => {
            let mut prepared = PreparedStatement::from_wire(&j["prepared"])?;
            prepared.prepare_cost = consumed.clone();
            OpOutcome::Prepare(PrepareResult {
                prepared_statement: prepared,
                consumed,
            })
        }
        Op::QueryFetch(_) => {
            let mut rows = Vec::new();
            if let Some(arr) = j["rows"].as_array() {
                for r in arr {
                    rows.push(MapValue::from_wire_json(r)?);
                }
            }
            let prepared = if j["prepared"].is_null() {
                None
            } else {
                Some(PreparedStatement::from_wire(&j["prepared"])?)
            };
            let topology = crate::query::TopologyInfo::from_wire(&j["topology"])?;
            OpOutcome::QueryBatch(QueryBatch {
                rows,
                continuation_key: decode_opt_binary(&j["continuation_key"])?,
                reached_limit: j["reached_limit"].as_bool().unwrap_or(false),
                prepared,
                topology,
                phase1: decode_phase1(&j["phase1"])?,
                consumed,
            })
        }
        Op::Table(_) | Op::GetTable(_) => OpOutcome::Table(decode_table_result(j)?),
        Op::ListTables(_) => {
            let tables = j["tables"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|t| t.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            OpOutcome::ListTables(ListTablesResult {
                tables,
                last_returned_index: j["last_index"].as_u64().unwrap_or(0) as u32,
            })
        }
        Op::TableUsage(_) => {
            let mut records = Vec::new();
            if let Some(arr) = j["usage"].as_array() {
                for u in arr {
                    records.push(TableUsage {
                        start_time: decode_opt_time(&u["start_time"])?,
                        seconds_in_period: u["seconds"].as_u64().unwrap_or(0) as u32,
                        read_units: u["read_units"].as_u64().unwrap_or(0) as u32,
                        write_units: u["write_units"].as_u64().unwrap_or(0) as u32,
                        storage_gb: u["storage_gb"].as_u64().unwrap_or(0) as u32,
                        read_throttle_count: u["read_throttles"].as_u64().unwrap_or(0) as u32,
                        write_throttle_count: u["write_throttles"].as_u64().unwrap_or(0) as u32,
                    });
                }
            }
            OpOutcome::TableUsage(TableUsageResult {
                table_name: j["table"].as_str().unwrap_or_default().to_string(),
                usage_records: records,
                last_returned_index: j["last_index"].as_u64().unwrap_or(0) as u32,
            })
        }
        Op::System(_) | Op::SystemStatus(_) => OpOutcome::System(SystemResult {
            state: match j["state"].as_str() {
                Some("COMPLETE") => SystemState::Complete,
                _ => SystemState::Working,
            },
            operation_id: j["operation_id"].as_str().map(str::to_string),
            statement: j["statement"].as_str().map(str::to_string),
            result_string: j["result_string"].as_str().map(str::to_string),
        }),
    })
}

fn decode_put_result(j: &Json, consumed: Option<ConsumedCapacity>) -> Result<PutResult, Error> {
    Ok(PutResult {
        success: j["success"].as_bool().unwrap_or(false),
        version: decode_opt_version(&j["version"])?,
        generated_value: decode_opt_value(&j["generated"])?,
        existing_row: decode_opt_map(&j["existing_row"])?,
        existing_version: decode_opt_version(&j["existing_version"])?,
        consumed,
    })
}

pub(crate) fn decode_table_result(j: &Json) -> Result<TableResult, Error> {
    let state = match j["state"].as_str() {
        Some("ACTIVE") => TableState::Active,
        Some("CREATING") => TableState::Creating,
        Some("DROPPED") => TableState::Dropped,
        Some("DROPPING") => TableState::Dropping,
        Some("UPDATING") => TableState::Updating,
        other => {
            return Err(Error::BadProtocol(format!(
                "unknown table state {other:?}"
            )));
        }
    };
    let limits = if j["limits"].is_null() {
        None
    } else {
        let l = &j["limits"];
        Some(TableLimits {
            mode: match l["mode"].as_str() {
                Some("ON_DEMAND") => CapacityMode::OnDemand,
                _ => CapacityMode::Provisioned,
            },
            read_units: l["read_units"].as_u64().unwrap_or(0) as u32,
            write_units: l["write_units"].as_u64().unwrap_or(0) as u32,
            storage_gb: l["storage_gb"].as_u64().unwrap_or(0) as u32,
        })
    };
    Ok(TableResult {
        table_name: j["table"].as_str().unwrap_or_default().to_string(),
        state,
        limits,
        schema: j["schema"].as_str().map(str::to_string),
        operation_id: j["operation_id"].as_str().map(str::to_string),
    })
}

fn decode_consumed(j: &Json) -> Option<ConsumedCapacity> {
    let c = &j["consumed"];
    if c.is_null() {
        return None;
    }
    Some(ConsumedCapacity {
        read_units: c["read_units"].as_u64().unwrap_or(0) as u32,
        read_kb: c["read_kb"].as_u64().unwrap_or(0) as u32,
        write_units: c["write_units"].as_u64().unwrap_or(0) as u32,
        write_kb: c["write_kb"].as_u64().unwrap_or(0) as u32,
        read_rate_limit_delay: Duration::ZERO,
        write_rate_limit_delay: Duration::ZERO,
    })
}

fn decode_phase1(j: &Json) -> Result<Option<Phase1Results>, Error> {
    if j.is_null() {
        return Ok(None);
    }
    let partition_ids: Vec<i32> = j["partition_ids"]
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_i64().map(|i| i as i32)).collect())
        .unwrap_or_default();
    let num_results: Vec<u32> = j["num_results"]
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_u64().map(|i| i as u32)).collect())
        .unwrap_or_default();
    let mut continuation_keys = Vec::new();
    if let Some(arr) = j["continuation_keys"].as_array() {
        for k in arr {
            continuation_keys.push(decode_opt_binary(k)?);
        }
    }
    // The three arrays describe the same partitions; disagreement means a
    // malformed response.
    if partition_ids.len() != num_results.len()
        || partition_ids.len() != continuation_keys.len()
    {
        return Err(Error::BadProtocol(format!(
            "phase1 array lengths disagree: {} pids, {} counts, {} keys",
            partition_ids.len(),
            num_results.len(),
            continuation_keys.len()
        )));
    }
    Ok(Some(Phase1Results {
        in_phase1: j["in_phase1"].as_bool().unwrap_or(false),
        partition_ids,
        num_results_per_partition: num_results,
        continuation_keys,
    }))
}

fn decode_opt_map(j: &Json) -> Result<Option<MapValue>, Error> {
    if j.is_null() {
        Ok(None)
    } else {
        Ok(Some(MapValue::from_wire_json(j)?))
    }
}

fn decode_opt_value(j: &Json) -> Result<Option<FieldValue>, Error> {
    if j.is_null() {
        Ok(None)
    } else {
        Ok(Some(FieldValue::from_wire_json(j)?))
    }
}

fn decode_opt_version(j: &Json) -> Result<Option<Version>, Error> {
    decode_opt_binary(j).map(|b| b.map(Version::from_bytes))
}

pub(crate) fn decode_opt_binary(j: &Json) -> Result<Option<Vec<u8>>, Error> {
    match j {
        Json::Null => Ok(None),
        Json::String(s) => BASE64
            .decode(s)
            .map(Some)
            .map_err(|e| Error::BadProtocol(format!("bad base64: {e}"))),
        other => Err(Error::BadProtocol(format!(
            "expected base64 string, got {other}"
        ))),
    }
}

fn decode_opt_time(j: &Json) -> Result<Option<DateTime<Utc>>, Error> {
    match j.as_str() {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| Error::BadProtocol(format!("bad timestamp: {e}"))),
    }
}
