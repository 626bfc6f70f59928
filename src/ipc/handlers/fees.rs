use crate::calc::{academic_year_for, paise_from_json, rupees, Frequency, LedgerError};
use crate::ipc::error::{err, from_ledger_error, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn fee_head_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, LedgerError> {
    let head_name = params
        .get("headName")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LedgerError::bad_params("missing headName"))?;
    let frequency = Frequency::parse(
        params
            .get("frequency")
            .and_then(|v| v.as_str())
            .unwrap_or("Monthly"),
    );
    let is_transport = params
        .get("isTransport")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let head_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO fee_heads(id, head_name, frequency, is_transport, active, created_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        rusqlite::params![
            head_id,
            head_name,
            frequency.as_str(),
            is_transport as i64,
            chrono::Local::now().date_naive().format("%Y-%m-%d").to_string(),
        ],
    )
    .map_err(|e| LedgerError::db("db_update_failed", e))?;

    Ok(json!({ "feeHeadId": head_id }))
}

fn fee_head_list(conn: &Connection) -> Result<serde_json::Value, LedgerError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, head_name, frequency, is_transport
             FROM fee_heads WHERE active = 1 ORDER BY head_name",
        )
        .map_err(|e| LedgerError::db("db_query_failed", e))?;
    let heads = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "headName": r.get::<_, String>(1)?,
                "frequency": r.get::<_, String>(2)?,
                "isTransport": r.get::<_, i64>(3)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| LedgerError::db("db_query_failed", e))?;
    Ok(json!({ "heads": heads }))
}

/// Heads are soft-deleted only; structure rows may still reference them.
fn fee_head_deactivate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, LedgerError> {
    let head_id = params
        .get("feeHeadId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| LedgerError::bad_params("missing feeHeadId"))?;
    let changed = conn
        .execute("UPDATE fee_heads SET active = 0 WHERE id = ?", [head_id])
        .map_err(|e| LedgerError::db("db_update_failed", e))?;
    if changed == 0 {
        return Err(LedgerError::not_found("fee head"));
    }
    Ok(json!({ "feeHeadId": head_id }))
}

struct StructureInput {
    class_id: String,
    fee_head_id: String,
    amount_paise: i64,
}

fn parse_structure_input(v: &serde_json::Value) -> Result<StructureInput, LedgerError> {
    let class_id = v
        .get("classId")
        .and_then(|x| x.as_str())
        .ok_or_else(|| LedgerError::bad_params("missing classId"))?
        .to_string();
    let fee_head_id = v
        .get("feeHeadId")
        .and_then(|x| x.as_str())
        .ok_or_else(|| LedgerError::bad_params("missing feeHeadId"))?
        .to_string();
    let amount_paise = v
        .get("amount")
        .and_then(paise_from_json)
        .ok_or_else(|| LedgerError::bad_params("missing amount"))?;
    if amount_paise < 0 {
        return Err(LedgerError::bad_params("amount must be non-negative"));
    }
    Ok(StructureInput {
        class_id,
        fee_head_id,
        amount_paise,
    })
}

fn academic_year_param(params: &serde_json::Value) -> String {
    params
        .get("academicYear")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| academic_year_for(chrono::Local::now().date_naive()))
}

fn upsert_structure(
    conn: &Connection,
    input: &StructureInput,
    academic_year: &str,
    skip_zero_insert: bool,
) -> Result<(), LedgerError> {
    let head_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM fee_heads WHERE id = ?",
            [&input.fee_head_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| LedgerError::db("db_query_failed", e))?;
    if head_exists.is_none() {
        return Err(LedgerError::not_found("fee head"));
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM fee_structures
             WHERE class_id = ? AND fee_head_id = ? AND academic_year = ?",
            (&input.class_id, &input.fee_head_id, academic_year),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| LedgerError::db("db_query_failed", e))?;

    match existing {
        Some(row_id) => {
            // Amount changes apply prospectively; past ledgers stay as written.
            conn.execute(
                "UPDATE fee_structures SET amount_paise = ?, active = 1 WHERE id = ?",
                (input.amount_paise, &row_id),
            )
            .map_err(|e| LedgerError::db("db_update_failed", e))?;
        }
        None => {
            if skip_zero_insert && input.amount_paise <= 0 {
                return Ok(());
            }
            conn.execute(
                "INSERT INTO fee_structures(id, class_id, fee_head_id, academic_year, amount_paise, active)
                 VALUES(?, ?, ?, ?, ?, 1)",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    input.class_id,
                    input.fee_head_id,
                    academic_year,
                    input.amount_paise,
                ],
            )
            .map_err(|e| LedgerError::db("db_update_failed", e))?;
        }
    }
    Ok(())
}

fn fee_structure_save(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, LedgerError> {
    let input = parse_structure_input(params)?;
    let academic_year = academic_year_param(params);
    upsert_structure(conn, &input, &academic_year, false)?;
    Ok(json!({ "academicYear": academic_year }))
}

fn fee_structure_save_bulk(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, LedgerError> {
    let rows = params
        .get("rows")
        .and_then(|v| v.as_array())
        .ok_or_else(|| LedgerError::bad_params("missing rows"))?;
    let academic_year = academic_year_param(params);

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| LedgerError::db("db_tx_failed", e))?;
    let mut saved = 0usize;
    for row in rows {
        let input = parse_structure_input(row)?;
        upsert_structure(&tx, &input, &academic_year, true)?;
        saved += 1;
    }
    tx.commit()
        .map_err(|e| LedgerError::db("db_commit_failed", e))?;

    Ok(json!({ "saved": saved, "academicYear": academic_year }))
}

fn fee_structure_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, LedgerError> {
    let academic_year = academic_year_param(params);
    let mut stmt = conn
        .prepare(
            "SELECT fs.id, fs.class_id, c.name, fs.fee_head_id, fh.head_name,
                    fh.frequency, fs.amount_paise
             FROM fee_structures fs
             JOIN classes c ON c.id = fs.class_id
             JOIN fee_heads fh ON fh.id = fs.fee_head_id
             WHERE fs.academic_year = ? AND fs.active = 1
             ORDER BY c.name, fh.head_name",
        )
        .map_err(|e| LedgerError::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([&academic_year], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classId": r.get::<_, String>(1)?,
                "className": r.get::<_, String>(2)?,
                "feeHeadId": r.get::<_, String>(3)?,
                "headName": r.get::<_, String>(4)?,
                "frequency": r.get::<_, String>(5)?,
                "amount": rupees(r.get::<_, i64>(6)?),
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| LedgerError::db("db_query_failed", e))?;
    Ok(json!({ "structures": rows, "academicYear": academic_year }))
}

fn with_conn(
    state: &AppState,
    req: &Request,
    f: impl FnOnce(&Connection) -> Result<serde_json::Value, LedgerError>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn) {
        Ok(result) => ok(&req.id, result),
        Err(e) => from_ledger_error(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "feeHeads.create" => Some(with_conn(state, req, |c| fee_head_create(c, &req.params))),
        "feeHeads.list" => Some(with_conn(state, req, |c| fee_head_list(c))),
        "feeHeads.deactivate" => Some(with_conn(state, req, |c| {
            fee_head_deactivate(c, &req.params)
        })),
        "feeStructure.save" => Some(with_conn(state, req, |c| {
            fee_structure_save(c, &req.params)
        })),
        "feeStructure.saveBulk" => Some(with_conn(state, req, |c| {
            fee_structure_save_bulk(c, &req.params)
        })),
        "feeStructure.list" => Some(with_conn(state, req, |c| {
            fee_structure_list(c, &req.params)
        })),
        _ => None,
    }
}
