use std::collections::BTreeMap;

use crate::calc::{amount_in_words, rupees, LedgerError};
use crate::dues;
use crate::ipc::error::{err, from_ledger_error, ok};
use crate::ipc::types::{AppState, Request};
use crate::payment::{self, PaymentRequest};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn as_of_param(params: &serde_json::Value) -> Result<NaiveDate, LedgerError> {
    match params.get("asOf").and_then(|v| v.as_str()) {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| LedgerError::bad_params("asOf must be YYYY-MM-DD")),
        None => Ok(chrono::Local::now().date_naive()),
    }
}

fn dues_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, LedgerError> {
    let student_id = params
        .get("studentId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| LedgerError::bad_params("missing studentId"))?;
    let as_of = as_of_param(params)?;

    let student = dues::load_student(conn, student_id)?;
    let summary = dues::compute_dues(conn, &student, as_of)?;

    let lines: Vec<serde_json::Value> = summary
        .lines
        .iter()
        .map(|l| {
            json!({
                "feeHead": l.fee_head,
                "month": l.month,
                "amount": rupees(l.amount_paise),
                "status": if l.paid { "Paid" } else { "Due" },
            })
        })
        .collect();

    Ok(json!({
        "student": {
            "id": student.id,
            "studentName": student.student_name,
            "fatherName": student.father_name,
            "admissionNo": student.admission_no,
            "className": student.class_name,
            "section": student.section,
            "currentBalance": rupees(student.current_balance_paise),
        },
        "dues": lines,
        "totalDue": rupees(summary.total_due_paise),
        "paidMonths": summary.paid_months,
        "currentMonth": summary.current_month,
        "academicYear": summary.academic_year,
    }))
}

fn payment_collect(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, LedgerError> {
    let req = PaymentRequest::from_params(params)?;
    let outcome = payment::collect_payment(conn, &req)?;
    tracing::info!(
        receipt_no = %outcome.receipt_no,
        student_id = %req.student_id,
        "payment collected"
    );
    Ok(json!({
        "receiptNo": outcome.receipt_no,
        "ledgerId": outcome.ledger_id,
        "totalDue": rupees(outcome.total_due_paise),
        "netPayable": rupees(outcome.net_payable_paise),
        "balanceDue": rupees(outcome.balance_due_paise),
        "newBalance": rupees(outcome.new_balance_paise),
    }))
}

fn receipt_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, LedgerError> {
    let receipt_no = params
        .get("receiptNo")
        .and_then(|v| v.as_str())
        .ok_or_else(|| LedgerError::bad_params("missing receiptNo"))?;

    // Fall back to the ledger row id so links minted before receipt numbers
    // existed still resolve.
    let row = conn
        .query_row(
            "SELECT id, student_id, receipt_no, transaction_date, months_paid,
                    total_due_paise, discount_paise, fine_paise, net_payable_paise,
                    paid_amount_paise, balance_due_paise, payment_mode, remarks,
                    payment_breakdown
             FROM student_fee_ledgers
             WHERE receipt_no = ?1 OR id = ?1",
            [receipt_no],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, i64>(5)?,
                    r.get::<_, i64>(6)?,
                    r.get::<_, i64>(7)?,
                    r.get::<_, i64>(8)?,
                    r.get::<_, i64>(9)?,
                    r.get::<_, i64>(10)?,
                    r.get::<_, String>(11)?,
                    r.get::<_, Option<String>>(12)?,
                    r.get::<_, String>(13)?,
                ))
            },
        )
        .optional()
        .map_err(|e| LedgerError::db("db_query_failed", e))?
        .ok_or_else(|| LedgerError::not_found("receipt"))?;

    let (
        ledger_id,
        student_id,
        receipt_no,
        transaction_date,
        months_json,
        total_due,
        discount,
        fine,
        net_payable,
        paid_amount,
        balance_due,
        payment_mode,
        remarks,
        breakdown_json,
    ) = row;

    let student = dues::load_student(conn, &student_id)?;
    let months: Vec<String> = serde_json::from_str(&months_json).unwrap_or_default();
    let breakdown: BTreeMap<String, i64> =
        serde_json::from_str(&breakdown_json).unwrap_or_default();
    let items: Vec<serde_json::Value> = breakdown
        .iter()
        .enumerate()
        .map(|(i, (key, amount_paise))| {
            let (head, month) = key.split_once('|').unwrap_or((key.as_str(), ""));
            json!({
                "sno": i + 1,
                "head": head,
                "month": month,
                "amount": rupees(*amount_paise),
            })
        })
        .collect();

    Ok(json!({
        "ledgerId": ledger_id,
        "receiptNo": receipt_no,
        "date": transaction_date,
        "student": {
            "studentName": student.student_name,
            "fatherName": student.father_name,
            "admissionNo": student.admission_no,
            "className": student.class_name,
            "section": student.section,
        },
        "months": months,
        "items": items,
        "totalDue": rupees(total_due),
        "discount": rupees(discount),
        "fine": rupees(fine),
        "netPayable": rupees(net_payable),
        "paidAmount": rupees(paid_amount),
        "balanceDue": rupees(balance_due),
        "paymentMode": payment_mode,
        "remarks": remarks,
        "amountInWords": amount_in_words(paid_amount / 100),
    }))
}

fn ledger_history(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, LedgerError> {
    let student_id = params
        .get("studentId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| LedgerError::bad_params("missing studentId"))?;
    // Surface not-found before returning an empty history.
    dues::load_student(conn, student_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT receipt_no, transaction_date, months_paid, paid_amount_paise,
                    balance_due_paise, payment_mode
             FROM student_fee_ledgers
             WHERE student_id = ?
             ORDER BY rowid DESC",
        )
        .map_err(|e| LedgerError::db("db_query_failed", e))?;
    let entries = stmt
        .query_map([student_id], |r| {
            let months: Vec<String> =
                serde_json::from_str(&r.get::<_, String>(2)?).unwrap_or_default();
            Ok(json!({
                "receiptNo": r.get::<_, String>(0)?,
                "date": r.get::<_, String>(1)?,
                "months": months,
                "paidAmount": rupees(r.get::<_, i64>(3)?),
                "balanceDue": rupees(r.get::<_, i64>(4)?),
                "paymentMode": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| LedgerError::db("db_query_failed", e))?;

    Ok(json!({ "entries": entries }))
}

fn ledger_recent(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, LedgerError> {
    let limit = params
        .get("limit")
        .and_then(|v| v.as_i64())
        .filter(|n| *n > 0)
        .unwrap_or(100);

    let mut stmt = conn
        .prepare(
            "SELECT l.receipt_no, l.transaction_date, s.student_name, s.admission_no,
                    c.name, l.months_paid, l.paid_amount_paise, l.payment_mode
             FROM student_fee_ledgers l
             JOIN students s ON s.id = l.student_id
             JOIN classes c ON c.id = s.class_id
             ORDER BY l.rowid DESC
             LIMIT ?",
        )
        .map_err(|e| LedgerError::db("db_query_failed", e))?;
    let entries = stmt
        .query_map([limit], |r| {
            let months: Vec<String> =
                serde_json::from_str(&r.get::<_, String>(5)?).unwrap_or_default();
            Ok(json!({
                "receiptNo": r.get::<_, String>(0)?,
                "date": r.get::<_, String>(1)?,
                "studentName": r.get::<_, String>(2)?,
                "admissionNo": r.get::<_, Option<String>>(3)?,
                "className": r.get::<_, String>(4)?,
                "months": months,
                "paidAmount": rupees(r.get::<_, i64>(6)?),
                "paymentMode": r.get::<_, String>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| LedgerError::db("db_query_failed", e))?;

    Ok(json!({ "entries": entries }))
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
        "dues.get" => Some(with_conn(state, req, |c| dues_get(c, &req.params))),
        "payment.collect" => Some(with_conn(state, req, |c| payment_collect(c, &req.params))),
        "receipt.get" => Some(with_conn(state, req, |c| receipt_get(c, &req.params))),
        "ledger.history" => Some(with_conn(state, req, |c| ledger_history(c, &req.params))),
        "ledger.recent" => Some(with_conn(state, req, |c| ledger_recent(c, &req.params))),
        _ => None,
    }
}
