use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "gradebook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            identifier TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            number TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS participations(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            email TEXT NOT NULL,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            role TEXT NOT NULL,
            status TEXT NOT NULL,
            enroll_time TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(course_id, email)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_participations_course ON participations(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grading_opportunities(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            identifier TEXT NOT NULL,
            name TEXT NOT NULL,
            flow_id TEXT,
            due_time TEXT,
            shown_in_grade_book INTEGER NOT NULL DEFAULT 1,
            shown_in_student_grade_book INTEGER NOT NULL DEFAULT 1,
            creation_time TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(course_id, identifier)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grading_opportunities_course ON grading_opportunities(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS flow_sessions(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            participation_id TEXT,
            flow_id TEXT NOT NULL,
            access_rules_id TEXT,
            expiration_mode TEXT NOT NULL DEFAULT 'end',
            expiration_time TEXT,
            start_time TEXT NOT NULL,
            completion_time TEXT,
            in_progress INTEGER NOT NULL,
            points REAL,
            max_points REAL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(participation_id) REFERENCES participations(id)
        )",
        [],
    )?;
    ensure_flow_sessions_result_comment(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_flow_sessions_course_flow ON flow_sessions(course_id, flow_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_flow_sessions_participation ON flow_sessions(participation_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS flow_page_grades(
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            page_ordinal INTEGER NOT NULL,
            points REAL,
            max_points REAL NOT NULL,
            grade_time TEXT NOT NULL,
            FOREIGN KEY(session_id) REFERENCES flow_sessions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_flow_page_grades_session ON flow_page_grades(session_id, page_ordinal)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_changes(
            id TEXT PRIMARY KEY,
            opportunity_id TEXT NOT NULL,
            participation_id TEXT NOT NULL,
            state TEXT NOT NULL,
            attempt_id TEXT,
            points REAL,
            max_points REAL,
            comment TEXT,
            due_time TEXT,
            creator_id TEXT,
            grade_time TEXT NOT NULL,
            FOREIGN KEY(opportunity_id) REFERENCES grading_opportunities(id),
            FOREIGN KEY(participation_id) REFERENCES participations(id),
            FOREIGN KEY(creator_id) REFERENCES participations(id)
        )",
        [],
    )?;
    // Older workspaces predate grading flow sessions into grade changes.
    ensure_grade_changes_flow_session(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_changes_opportunity ON grade_changes(opportunity_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_changes_participation_time
         ON grade_changes(participation_id, opportunity_id, grade_time)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_grade_changes_flow_session(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grade_changes", "flow_session_id")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE grade_changes ADD COLUMN flow_session_id TEXT REFERENCES flow_sessions(id)",
        [],
    )?;
    Ok(())
}

fn ensure_flow_sessions_result_comment(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "flow_sessions", "result_comment")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE flow_sessions ADD COLUMN result_comment TEXT", [])?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, text),
    )?;
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
