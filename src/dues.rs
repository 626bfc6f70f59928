use std::collections::HashSet;

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};

use crate::calc::{
    academic_month_token, academic_year_for, month_index, months_through, Frequency, LedgerError,
    MONTH_ORDER,
};

#[derive(Debug, Clone)]
pub struct StudentInfo {
    pub id: String,
    pub student_name: String,
    pub father_name: Option<String>,
    pub admission_no: Option<String>,
    pub class_id: String,
    pub class_name: String,
    pub section: Option<String>,
    pub transport_opted: bool,
    pub pickup_point_id: Option<String>,
    pub current_balance_paise: i64,
    pub active: bool,
}

pub fn load_student(conn: &Connection, student_id: &str) -> Result<StudentInfo, LedgerError> {
    conn.query_row(
        "SELECT s.id, s.student_name, s.father_name, s.admission_no, s.class_id,
                c.name, s.section, s.transport_opted, s.pickup_point_id,
                s.current_balance_paise, s.active
         FROM students s
         JOIN classes c ON c.id = s.class_id
         WHERE s.id = ?",
        [student_id],
        |r| {
            Ok(StudentInfo {
                id: r.get(0)?,
                student_name: r.get(1)?,
                father_name: r.get(2)?,
                admission_no: r.get(3)?,
                class_id: r.get(4)?,
                class_name: r.get(5)?,
                section: r.get(6)?,
                transport_opted: r.get::<_, i64>(7)? != 0,
                pickup_point_id: r.get(8)?,
                current_balance_paise: r.get(9)?,
                active: r.get::<_, i64>(10)? != 0,
            })
        },
    )
    .optional()
    .map_err(|e| LedgerError::db("db_query_failed", e))?
    .ok_or_else(|| LedgerError::not_found("student"))
}

/// Union of months covered by any ledger entry plus the legacy paid_months
/// projection. A month is paid if it appears anywhere, regardless of which
/// receipt covered it.
pub fn paid_months_set(
    conn: &Connection,
    student_id: &str,
) -> Result<HashSet<String>, LedgerError> {
    let mut paid = HashSet::new();

    let mut stmt = conn
        .prepare("SELECT months_paid FROM student_fee_ledgers WHERE student_id = ?")
        .map_err(|e| LedgerError::db("db_query_failed", e))?;
    let months_json = stmt
        .query_map([student_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| LedgerError::db("db_query_failed", e))?;
    for raw in months_json {
        let months: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();
        paid.extend(months);
    }

    let mut stmt = conn
        .prepare("SELECT month FROM paid_months WHERE student_id = ?")
        .map_err(|e| LedgerError::db("db_query_failed", e))?;
    let legacy = stmt
        .query_map([student_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| LedgerError::db("db_query_failed", e))?;
    paid.extend(legacy);

    Ok(paid)
}

#[derive(Debug, Clone)]
pub struct DuesLine {
    pub fee_head: String,
    pub month: String,
    pub amount_paise: i64,
    pub paid: bool,
}

#[derive(Debug, Clone)]
pub struct DuesSummary {
    pub lines: Vec<DuesLine>,
    pub total_due_paise: i64,
    pub paid_months: Vec<String>,
    pub current_month: &'static str,
    pub academic_year: String,
}

struct StructureRow {
    head_name: String,
    frequency: Frequency,
    amount_paise: i64,
}

pub fn compute_dues(
    conn: &Connection,
    student: &StudentInfo,
    as_of: NaiveDate,
) -> Result<DuesSummary, LedgerError> {
    let months = months_through(as_of);
    let academic_year = academic_year_for(as_of);
    let paid = paid_months_set(conn, &student.id)?;

    // Transport heads never come from the structure; the charge is keyed by
    // the student's pickup point instead.
    let mut stmt = conn
        .prepare(
            "SELECT fh.head_name, fh.frequency, fs.amount_paise
             FROM fee_structures fs
             JOIN fee_heads fh ON fh.id = fs.fee_head_id
             WHERE fs.class_id = ? AND fs.academic_year = ?
               AND fs.active = 1 AND fh.active = 1 AND fh.is_transport = 0
               AND fs.amount_paise > 0
             ORDER BY fh.head_name",
        )
        .map_err(|e| LedgerError::db("db_query_failed", e))?;
    let structures = stmt
        .query_map((&student.class_id, &academic_year), |r| {
            Ok(StructureRow {
                head_name: r.get(0)?,
                frequency: Frequency::parse(&r.get::<_, String>(1)?),
                amount_paise: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| LedgerError::db("db_query_failed", e))?;

    // Once-per-year heads sit in the first month of the cycle and share its
    // paid status. A moving anchor would re-emit the head as due after the
    // month that carried it was settled.
    let once_anchor: &str = months[0];

    let transport_charge = transport_charge_for(conn, student)?;

    let mut lines = Vec::new();
    let mut total_due_paise: i64 = 0;
    for month in months {
        let is_paid = paid.contains(*month);
        for row in &structures {
            let emit = if row.frequency.emits_once() {
                *month == once_anchor
            } else {
                row.frequency.applicable_months().contains(month)
            };
            if !emit {
                continue;
            }
            if !is_paid {
                total_due_paise += row.amount_paise;
            }
            lines.push(DuesLine {
                fee_head: row.head_name.clone(),
                month: month.to_string(),
                amount_paise: row.amount_paise,
                paid: is_paid,
            });
        }
        if let Some(charge) = transport_charge {
            if !is_paid {
                total_due_paise += charge;
            }
            lines.push(DuesLine {
                fee_head: "Transport Fee".to_string(),
                month: month.to_string(),
                amount_paise: charge,
                paid: is_paid,
            });
        }
    }

    let mut paid_months: Vec<String> = paid.into_iter().collect();
    paid_months.sort_by_key(|m| month_index(m).unwrap_or(usize::MAX));

    Ok(DuesSummary {
        lines,
        total_due_paise,
        paid_months,
        current_month: academic_month_token(as_of),
        academic_year,
    })
}

fn transport_charge_for(
    conn: &Connection,
    student: &StudentInfo,
) -> Result<Option<i64>, LedgerError> {
    if !student.transport_opted {
        return Ok(None);
    }
    let Some(pickup_point_id) = student.pickup_point_id.as_deref() else {
        tracing::warn!(student_id = %student.id, "transport opted but no pickup point assigned");
        return Ok(None);
    };
    let charge: Option<i64> = conn
        .query_row(
            "SELECT monthly_charge_paise FROM transport_points WHERE id = ?",
            [pickup_point_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| LedgerError::db("db_query_failed", e))?;
    if charge.is_none() {
        tracing::warn!(
            student_id = %student.id,
            pickup_point_id,
            "pickup point missing; charging no transport fee"
        );
    }
    Ok(charge)
}

/// Re-derive the stored balance from ledger + structure and write it back.
/// This is the single recompute path shared by the payment processor and the
/// sync job, so the materialized value can always be reproduced.
pub fn recompute_balance(
    conn: &Connection,
    student: &StudentInfo,
    as_of: NaiveDate,
) -> Result<i64, LedgerError> {
    let summary = compute_dues(conn, student, as_of)?;
    conn.execute(
        "UPDATE students SET current_balance_paise = ?, updated_at = ? WHERE id = ?",
        (
            summary.total_due_paise,
            as_of.format("%Y-%m-%d").to_string(),
            &student.id,
        ),
    )
    .map_err(|e| LedgerError::db("db_update_failed", e))?;
    Ok(summary.total_due_paise)
}

/// Month tokens must come from the fixed academic cycle.
pub fn validate_month_tokens(months: &[String]) -> Result<(), LedgerError> {
    for m in months {
        if month_index(m).is_none() {
            return Err(LedgerError::bad_params(format!(
                "unrecognized month token: {} (expected one of {})",
                m,
                MONTH_ORDER.join(", ")
            )));
        }
    }
    Ok(())
}
