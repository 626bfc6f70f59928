use crate::calc::{rupees, LedgerError};
use crate::dues;
use crate::ipc::error::{err, from_ledger_error, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde_json::json;

fn as_of_param(params: &serde_json::Value) -> Result<NaiveDate, LedgerError> {
    match params.get("asOf").and_then(|v| v.as_str()) {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| LedgerError::bad_params("asOf must be YYYY-MM-DD")),
        None => Ok(chrono::Local::now().date_naive()),
    }
}

fn resync_student(
    conn: &Connection,
    student_id: &str,
    as_of: NaiveDate,
) -> Result<i64, LedgerError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(|e| LedgerError::db("db_tx_failed", e))?;
    let student = dues::load_student(&tx, student_id)?;
    let balance = dues::recompute_balance(&tx, &student, as_of)?;
    tx.commit()
        .map_err(|e| LedgerError::db("db_commit_failed", e))?;
    Ok(balance)
}

/// Full re-derivation of every active student's stored balance. Each student
/// commits independently, so one bad record cannot roll back the rest.
fn sync_all(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, LedgerError> {
    let as_of = as_of_param(params)?;

    let mut stmt = conn
        .prepare("SELECT id FROM students WHERE active = 1 ORDER BY id")
        .map_err(|e| LedgerError::db("db_query_failed", e))?;
    let student_ids = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| LedgerError::db("db_query_failed", e))?;

    let mut updated_count = 0usize;
    let mut failed_count = 0usize;
    let mut total_pending_paise: i64 = 0;
    for student_id in &student_ids {
        match resync_student(conn, student_id, as_of) {
            Ok(balance) => {
                updated_count += 1;
                total_pending_paise += balance;
            }
            Err(e) => {
                failed_count += 1;
                tracing::warn!(student_id = %student_id, code = %e.code, message = %e.message,
                    "balance resync failed for student, continuing");
            }
        }
    }

    Ok(json!({
        "updatedCount": updated_count,
        "failedCount": failed_count,
        "totalPendingDues": rupees(total_pending_paise),
    }))
}

fn recalculate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, LedgerError> {
    let student_id = params
        .get("studentId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| LedgerError::bad_params("missing studentId"))?;
    let as_of = as_of_param(params)?;
    let balance = resync_student(conn, student_id, as_of)?;
    Ok(json!({
        "studentId": student_id,
        "balance": rupees(balance),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, LedgerError>| {
        let Some(conn) = state.db.as_ref() else {
            return err(&req.id, "no_workspace", "select a workspace first", None);
        };
        match f(conn, &req.params) {
            Ok(result) => ok(&req.id, result),
            Err(e) => from_ledger_error(&req.id, e),
        }
    };

    match req.method.as_str() {
        "balances.syncAll" => Some(run(sync_all)),
        "balances.recalculate" => Some(run(recalculate)),
        _ => None,
    }
}
