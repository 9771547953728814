use crate::qr::StudentRecord;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "absensi.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            nis TEXT PRIMARY KEY,
            nama TEXT NOT NULL,
            kelas TEXT NOT NULL,
            tanggal_lahir TEXT,
            alamat TEXT,
            nama_ortu TEXT,
            telepon TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_kelas ON students(kelas, nama)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            nis TEXT NOT NULL,
            kelas TEXT NOT NULL,
            day TEXT NOT NULL,
            status TEXT NOT NULL,
            source TEXT NOT NULL,
            note TEXT,
            recorded_at TEXT NOT NULL,
            recorded_by TEXT,
            UNIQUE(nis, day),
            FOREIGN KEY(nis) REFERENCES students(nis)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_day ON attendance_records(day)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            nama TEXT NOT NULL,
            email TEXT NOT NULL,
            role TEXT NOT NULL,
            kelas TEXT,
            nis TEXT,
            password_salt TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    // Key-value store for workspace settings and the signed-in session.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
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

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn settings_delete(conn: &Connection, keys: &[&str]) -> anyhow::Result<()> {
    for key in keys {
        conn.execute("DELETE FROM settings WHERE key = ?", [key])?;
    }
    Ok(())
}

/// Current roster snapshot, ordered by class then name.
pub fn load_roster(conn: &Connection) -> anyhow::Result<Vec<StudentRecord>> {
    let mut stmt = conn.prepare("SELECT nis, nama, kelas FROM students ORDER BY kelas, nama")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(StudentRecord {
                nis: r.get(0)?,
                nama: r.get(1)?,
                kelas: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn find_student(conn: &Connection, nis: &str) -> anyhow::Result<Option<StudentRecord>> {
    let found = conn
        .query_row(
            "SELECT nis, nama, kelas FROM students WHERE nis = ?",
            [nis],
            |r| {
                Ok(StudentRecord {
                    nis: r.get(0)?,
                    nama: r.get(1)?,
                    kelas: r.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(found)
}
