use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("feebook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // Two office terminals (or the sync job and a collection window) may hit
    // the same workspace file; let writers queue instead of failing fast.
    conn.busy_timeout(std::time::Duration::from_millis(5000))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transport_points(
            id TEXT PRIMARY KEY,
            pickup_point_name TEXT NOT NULL,
            distance_km REAL,
            monthly_charge_paise INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            admission_no TEXT UNIQUE,
            student_name TEXT NOT NULL,
            father_name TEXT,
            class_id TEXT NOT NULL,
            section TEXT,
            transport_opted INTEGER NOT NULL DEFAULT 0,
            pickup_point_id TEXT,
            current_balance_paise INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(pickup_point_id) REFERENCES transport_points(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    // Workspaces created before balances were materialized on the student
    // row need the column added and left at zero until the next sync.
    ensure_students_balance(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_heads(
            id TEXT PRIMARY KEY,
            head_name TEXT NOT NULL UNIQUE,
            frequency TEXT NOT NULL DEFAULT 'Monthly',
            is_transport INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT
        )",
        [],
    )?;
    ensure_fee_heads_is_transport(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_structures(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            fee_head_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            amount_paise INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(fee_head_id) REFERENCES fee_heads(id),
            UNIQUE(class_id, fee_head_id, academic_year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_structures_class ON fee_structures(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_fee_ledgers(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            receipt_no TEXT NOT NULL UNIQUE,
            transaction_date TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            months_paid TEXT NOT NULL,
            total_due_paise INTEGER NOT NULL,
            discount_paise INTEGER NOT NULL,
            fine_paise INTEGER NOT NULL,
            net_payable_paise INTEGER NOT NULL,
            paid_amount_paise INTEGER NOT NULL,
            balance_due_paise INTEGER NOT NULL,
            payment_mode TEXT NOT NULL,
            remarks TEXT,
            payment_breakdown TEXT NOT NULL,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    ensure_ledgers_created_by(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ledgers_student ON student_fee_ledgers(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ledgers_receipt ON student_fee_ledgers(receipt_no)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS paid_months(
            student_id TEXT NOT NULL,
            month TEXT NOT NULL,
            session TEXT NOT NULL,
            PRIMARY KEY(student_id, month, session),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_paid_months_student ON paid_months(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS receipt_counters(
            year INTEGER PRIMARY KEY,
            last_number INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    // Ledgers written by builds that predate the paid_months projection must
    // still satisfy the invariant: every month in months_paid has a row.
    backfill_paid_months(&conn)?;

    Ok(conn)
}

fn ensure_students_balance(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "current_balance_paise")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE students ADD COLUMN current_balance_paise INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn ensure_fee_heads_is_transport(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "fee_heads", "is_transport")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE fee_heads ADD COLUMN is_transport INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn ensure_ledgers_created_by(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "student_fee_ledgers", "created_by")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE student_fee_ledgers ADD COLUMN created_by TEXT NOT NULL DEFAULT 'Admin'",
        [],
    )?;
    Ok(())
}

fn backfill_paid_months(conn: &Connection) -> anyhow::Result<()> {
    let mut stmt = conn.prepare(
        "SELECT student_id, months_paid, academic_year FROM student_fee_ledgers",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (student_id, months_json, academic_year) in rows {
        let months: Vec<String> = serde_json::from_str(&months_json).unwrap_or_default();
        let session = crate::calc::short_session(&academic_year);
        for month in months {
            conn.execute(
                "INSERT OR IGNORE INTO paid_months(student_id, month, session) VALUES(?, ?, ?)",
                (&student_id, &month, &session),
            )?;
        }
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
