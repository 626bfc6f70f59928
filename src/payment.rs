use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use uuid::Uuid;

use crate::calc::{academic_year_for, paise_from_json, short_session, LedgerError};
use crate::dues;

pub const PAYMENT_MODES: [&str; 4] = ["Cash", "UPI", "Cheque", "Bank Transfer"];

const REMARKS_MAX_CHARS: usize = 500;

/// Receipt numbers are year-scoped: REC-2026-0001. The counter increment and
/// the read happen inside the caller's write transaction, so an aborted
/// payment rolls the counter back with it and the number is never burned.
pub fn issue_receipt_no(tx: &Transaction, year: i32) -> Result<String, LedgerError> {
    tx.execute(
        "INSERT INTO receipt_counters(year, last_number) VALUES(?, 0)
         ON CONFLICT(year) DO NOTHING",
        [year],
    )
    .map_err(|e| LedgerError::db("db_update_failed", e))?;
    tx.execute(
        "UPDATE receipt_counters SET last_number = last_number + 1 WHERE year = ?",
        [year],
    )
    .map_err(|e| LedgerError::db("db_update_failed", e))?;
    let n: i64 = tx
        .query_row(
            "SELECT last_number FROM receipt_counters WHERE year = ?",
            [year],
            |r| r.get(0),
        )
        .map_err(|e| LedgerError::db("db_query_failed", e))?;
    Ok(format!("REC-{}-{:04}", year, n))
}

#[derive(Debug, Clone)]
pub struct PaymentItem {
    pub head: String,
    pub month: String,
    pub amount_paise: i64,
}

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub student_id: String,
    pub selected_months: Vec<String>,
    pub items: Vec<PaymentItem>,
    pub payment_mode: String,
    pub discount_paise: i64,
    pub fine_paise: i64,
    pub amount_received_paise: i64,
    pub remarks: Option<String>,
    pub date: Option<NaiveDate>,
    pub created_by: String,
}

impl PaymentRequest {
    pub fn from_params(params: &serde_json::Value) -> Result<PaymentRequest, LedgerError> {
        let student_id = required_str(params, "studentId")?;
        let payment_mode = required_str(params, "paymentMode")?;
        if !PAYMENT_MODES.contains(&payment_mode.as_str()) {
            return Err(LedgerError::bad_params(format!(
                "paymentMode must be one of: {}",
                PAYMENT_MODES.join(", ")
            )));
        }

        let mut selected_months = Vec::new();
        if let Some(raw) = params.get("selectedMonths").and_then(|v| v.as_array()) {
            for v in raw {
                let Some(m) = v.as_str() else {
                    return Err(LedgerError::bad_params("selectedMonths must be strings"));
                };
                if !selected_months.iter().any(|s| s == m) {
                    selected_months.push(m.to_string());
                }
            }
        }
        dues::validate_month_tokens(&selected_months)?;

        let mut items = Vec::new();
        if let Some(raw) = params.get("items").and_then(|v| v.as_array()) {
            for v in raw {
                let head = v
                    .get("head")
                    .and_then(|h| h.as_str())
                    .unwrap_or("Fee")
                    .trim()
                    .to_string();
                let month = v
                    .get("month")
                    .and_then(|m| m.as_str())
                    .unwrap_or("")
                    .to_string();
                let amount_paise = v
                    .get("amount")
                    .and_then(paise_from_json)
                    .ok_or_else(|| LedgerError::bad_params("item amount must be a number"))?;
                items.push(PaymentItem {
                    head,
                    month,
                    amount_paise,
                });
            }
        }

        let discount_paise = non_negative_money(params, "discount", 0)?;
        let fine_paise = non_negative_money(params, "fine", 0)?;
        let amount_received_paise = params
            .get("amountReceived")
            .and_then(paise_from_json)
            .ok_or_else(|| LedgerError::bad_params("missing amountReceived"))?;
        if amount_received_paise < 0 {
            return Err(LedgerError::bad_params("amountReceived must be non-negative"));
        }

        let remarks = params
            .get("remarks")
            .and_then(|v| v.as_str())
            .map(sanitize_remarks)
            .filter(|s| !s.is_empty());

        let date = match params.get("date").and_then(|v| v.as_str()) {
            Some(raw) => Some(
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map_err(|_| LedgerError::bad_params("date must be YYYY-MM-DD"))?,
            ),
            None => None,
        };

        let created_by = params
            .get("createdBy")
            .and_then(|v| v.as_str())
            .unwrap_or("Admin")
            .to_string();

        Ok(PaymentRequest {
            student_id,
            selected_months,
            items,
            payment_mode,
            discount_paise,
            fine_paise,
            amount_received_paise,
            remarks,
            date,
            created_by,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PaymentOutcome {
    pub ledger_id: String,
    pub receipt_no: String,
    pub total_due_paise: i64,
    pub net_payable_paise: i64,
    pub balance_due_paise: i64,
    pub new_balance_paise: i64,
}

/// One atomic unit: receipt number, ledger row, paid-month mirror rows and
/// the re-derived student balance all commit together or not at all.
pub fn collect_payment(
    conn: &Connection,
    req: &PaymentRequest,
) -> Result<PaymentOutcome, LedgerError> {
    let txn_date = req.date.unwrap_or_else(|| chrono::Local::now().date_naive());
    let academic_year = academic_year_for(txn_date);
    let session = short_session(&academic_year);

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(|e| LedgerError::db("db_tx_failed", e))?;

    // The student row, and with it the carried balance that folds into the
    // due total, is read under the same write lock as everything else, so a
    // payment committed by another process cannot be double-counted here.
    let student = dues::load_student(&tx, &req.student_id)?;

    // Duplicate-month check happens inside the write transaction so a racing
    // payment for the same student loses cleanly instead of double-charging.
    let paid = dues::paid_months_set(&tx, &student.id)?;
    if let Some(m) = req.selected_months.iter().find(|m| paid.contains(*m)) {
        return Err(LedgerError::conflict(format!(
            "month {} is already paid for this student",
            m
        )));
    }

    let item_total: i64 = req.items.iter().map(|i| i.amount_paise).sum();
    // The carried balance folds in automatically unless the caller already
    // listed it as an explicit line item.
    let has_previous_balance_line = req
        .items
        .iter()
        .any(|i| i.head.eq_ignore_ascii_case("previous balance"));
    let total_due_paise = if has_previous_balance_line {
        item_total
    } else {
        item_total + student.current_balance_paise
    };
    let net_payable_paise = total_due_paise - req.discount_paise + req.fine_paise;
    // May go negative: an advance payment carried as credit.
    let balance_due_paise = net_payable_paise - req.amount_received_paise;

    let receipt_no = issue_receipt_no(&tx, txn_date.year())?;
    let ledger_id = Uuid::new_v4().to_string();

    let months_json = serde_json::to_string(&req.selected_months)
        .map_err(|e| LedgerError::bad_params(e.to_string()))?;
    let mut breakdown: BTreeMap<String, i64> = BTreeMap::new();
    for item in &req.items {
        *breakdown
            .entry(format!("{}|{}", item.head, item.month))
            .or_insert(0) += item.amount_paise;
    }
    let breakdown_json = serde_json::to_string(&breakdown)
        .map_err(|e| LedgerError::bad_params(e.to_string()))?;

    tx.execute(
        "INSERT INTO student_fee_ledgers(
            id, student_id, receipt_no, transaction_date, academic_year,
            months_paid, total_due_paise, discount_paise, fine_paise,
            net_payable_paise, paid_amount_paise, balance_due_paise,
            payment_mode, remarks, payment_breakdown, created_by, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            ledger_id,
            student.id,
            receipt_no,
            txn_date.format("%Y-%m-%d").to_string(),
            academic_year,
            months_json,
            total_due_paise,
            req.discount_paise,
            req.fine_paise,
            net_payable_paise,
            req.amount_received_paise,
            balance_due_paise,
            req.payment_mode,
            req.remarks,
            breakdown_json,
            req.created_by,
            txn_date.format("%Y-%m-%d").to_string(),
        ],
    )
    .map_err(|e| LedgerError::db("db_update_failed", e))?;

    for month in &req.selected_months {
        tx.execute(
            "INSERT OR IGNORE INTO paid_months(student_id, month, session) VALUES(?, ?, ?)",
            (&student.id, month, &session),
        )
        .map_err(|e| LedgerError::db("db_update_failed", e))?;
    }

    // Stored balance is re-derived from scratch, not nudged by balance_due,
    // so partial and advance payments cannot make it drift.
    let new_balance_paise = dues::recompute_balance(&tx, &student, txn_date)?;

    tx.commit().map_err(|e| LedgerError::db("db_commit_failed", e))?;

    Ok(PaymentOutcome {
        ledger_id,
        receipt_no,
        total_due_paise,
        net_payable_paise,
        balance_due_paise,
        new_balance_paise,
    })
}

/// Remarks are free text destined for receipts: strip anything tag-shaped
/// and cap the length before it reaches storage.
pub fn sanitize_remarks(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_tag = false;
    for ch in raw.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.trim().chars().take(REMARKS_MAX_CHARS).collect()
}

fn required_str(params: &serde_json::Value, key: &str) -> Result<String, LedgerError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LedgerError::bad_params(format!("missing {}", key)))
}

fn non_negative_money(
    params: &serde_json::Value,
    key: &str,
    default_paise: i64,
) -> Result<i64, LedgerError> {
    let Some(v) = params.get(key) else {
        return Ok(default_paise);
    };
    if v.is_null() {
        return Ok(default_paise);
    }
    let paise = paise_from_json(v)
        .ok_or_else(|| LedgerError::bad_params(format!("{} must be a number", key)))?;
    if paise < 0 {
        return Err(LedgerError::bad_params(format!(
            "{} must be non-negative",
            key
        )));
    }
    Ok(paise)
}
