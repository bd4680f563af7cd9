use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "campus.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            academic_year TEXT,
            created_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            admission_no TEXT,
            class_label TEXT,
            active INTEGER NOT NULL,
            created_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_school ON students(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staff(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            role TEXT NOT NULL,
            phone TEXT,
            active INTEGER NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_staff_school ON staff(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS parents(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            phone TEXT,
            email TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_parents_school ON parents(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS kinships(
            parent_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            relationship TEXT NOT NULL,
            primary_contact INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(parent_id, student_id),
            FOREIGN KEY(parent_id) REFERENCES parents(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_kinships_student ON kinships(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_days(
            school_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            day TEXT NOT NULL,
            code TEXT NOT NULL,
            PRIMARY KEY(student_id, day),
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_days_school_day ON attendance_days(school_id, day)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            term INTEGER,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_subjects(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            out_of REAL NOT NULL,
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            UNIQUE(exam_id, subject)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_marks(
            id TEXT PRIMARY KEY,
            exam_subject_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            raw_value REAL,
            status TEXT NOT NULL,
            FOREIGN KEY(exam_subject_id) REFERENCES exam_subjects(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(exam_subject_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_subjects_exam ON exam_subjects(exam_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_marks_subject ON exam_marks(exam_subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_marks_student ON exam_marks(student_id)",
        [],
    )?;

    // All money columns are TEXT holding exact decimal strings; SQLite REAL
    // would reintroduce binary-float drift.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_heads(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            amount TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            UNIQUE(school_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS discounts(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            value TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            UNIQUE(school_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_discounts(
            student_id TEXT NOT NULL,
            discount_id TEXT NOT NULL,
            PRIMARY KEY(student_id, discount_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(discount_id) REFERENCES discounts(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS invoices(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            invoice_no TEXT NOT NULL,
            period TEXT NOT NULL,
            due_date TEXT NOT NULL,
            gross_amount TEXT NOT NULL,
            discount_amount TEXT NOT NULL DEFAULT '0',
            total_amount TEXT NOT NULL,
            paid_amount TEXT NOT NULL DEFAULT '0',
            status TEXT NOT NULL,
            created_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(school_id, invoice_no),
            UNIQUE(school_id, student_id, period)
        )",
        [],
    )?;
    ensure_invoices_discount_amount(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_invoices_school ON invoices(school_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_invoices_student ON invoices(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_invoices_school_status ON invoices(school_id, status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS invoice_lines(
            id TEXT PRIMARY KEY,
            invoice_id TEXT NOT NULL,
            fee_head_name TEXT NOT NULL,
            amount TEXT NOT NULL,
            FOREIGN KEY(invoice_id) REFERENCES invoices(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_invoice_lines_invoice ON invoice_lines(invoice_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            invoice_id TEXT NOT NULL,
            challan_no TEXT NOT NULL,
            amount TEXT NOT NULL,
            method TEXT NOT NULL,
            remarks TEXT,
            paid_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(invoice_id) REFERENCES invoices(id),
            UNIQUE(school_id, challan_no)
        )",
        [],
    )?;
    ensure_payments_remarks(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_invoice ON payments(invoice_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_school ON payments(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS counters(
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            value INTEGER NOT NULL,
            PRIMARY KEY(school_id, name),
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_invoices_discount_amount(conn: &Connection) -> anyhow::Result<()> {
    // Early workspaces predate discount tracking on the invoice row.
    if table_has_column(conn, "invoices", "discount_amount")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE invoices ADD COLUMN discount_amount TEXT NOT NULL DEFAULT '0'",
        [],
    )?;
    Ok(())
}

fn ensure_payments_remarks(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "payments", "remarks")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE payments ADD COLUMN remarks TEXT", [])?;
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
