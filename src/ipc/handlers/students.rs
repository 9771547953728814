use crate::auth::Role;
use crate::db;
use crate::ipc::error::{db_err, respond, sql_err, HandlerErr};
use crate::ipc::helpers::{
    get_optional_text, get_required_str, get_required_text, parse_now, require_db, require_role,
};
use crate::ipc::types::{AppState, Request};
use crate::qr;
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const GRADES: [&str; 3] = ["X", "XI", "XII"];
const MAJORS: [&str; 2] = ["IPA", "IPS"];
const SECTIONS_PER_GRADE: u32 = 3;

/// Known class labels, e.g. "XII IPA 1", grouped by major.
pub fn class_options() -> Vec<String> {
    let mut out = Vec::new();
    for major in MAJORS {
        for grade in GRADES {
            for n in 1..=SECTIONS_PER_GRADE {
                out.push(format!("{} {} {}", grade, major, n));
            }
        }
    }
    out
}

#[derive(Debug, Clone)]
struct StudentRow {
    nis: String,
    nama: String,
    kelas: String,
    tanggal_lahir: Option<String>,
    alamat: Option<String>,
    nama_ortu: Option<String>,
    telepon: Option<String>,
}

impl StudentRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "nis": self.nis,
            "nama": self.nama,
            "kelas": self.kelas,
            "tanggalLahir": self.tanggal_lahir,
            "alamat": self.alamat,
            "namaOrtu": self.nama_ortu,
            "telepon": self.telepon,
        })
    }
}

const STUDENT_COLUMNS: &str = "nis, nama, kelas, tanggal_lahir, alamat, nama_ortu, telepon";

fn map_student(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRow> {
    Ok(StudentRow {
        nis: r.get(0)?,
        nama: r.get(1)?,
        kelas: r.get(2)?,
        tanggal_lahir: r.get(3)?,
        alamat: r.get(4)?,
        nama_ortu: r.get(5)?,
        telepon: r.get(6)?,
    })
}

fn list_rows(conn: &Connection, kelas: Option<&str>) -> Result<Vec<StudentRow>, HandlerErr> {
    let rows = match kelas {
        Some(k) => {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM students WHERE kelas = ? ORDER BY nama",
                    STUDENT_COLUMNS
                ))
                .map_err(sql_err("db_query_failed"))?;
            let rows = stmt
                .query_map([k], map_student)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>());
            rows
        }
        None => {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM students ORDER BY kelas, nama",
                    STUDENT_COLUMNS
                ))
                .map_err(sql_err("db_query_failed"))?;
            let rows = stmt
                .query_map([], map_student)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>());
            rows
        }
    };
    rows.map_err(sql_err("db_query_failed"))
}

fn get_row(conn: &Connection, nis: &str) -> Result<Option<StudentRow>, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM students WHERE nis = ?", STUDENT_COLUMNS),
        [nis],
        map_student,
    )
    .optional()
    .map_err(sql_err("db_query_failed"))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let user = require_role(conn, Role::Guru)?;

    let nis = get_required_text(params, "nis")?;
    let nama = get_required_text(params, "nama")?;
    let kelas = get_required_text(params, "kelas")?;
    if !class_options().contains(&kelas) {
        return Err(HandlerErr::bad_params(format!("unknown kelas: {}", kelas))
            .with_details(json!({ "options": class_options() })));
    }
    let tanggal_lahir = get_optional_text(params, "tanggalLahir")?;
    if let Some(d) = &tanggal_lahir {
        if NaiveDate::parse_from_str(d, "%Y-%m-%d").is_err() {
            return Err(HandlerErr::bad_params("tanggalLahir must be YYYY-MM-DD"));
        }
    }
    let alamat = get_optional_text(params, "alamat")?;
    let nama_ortu = get_optional_text(params, "namaOrtu")?;
    let telepon = get_optional_text(params, "telepon")?;

    if get_row(conn, &nis)?.is_some() {
        return Err(HandlerErr::new("conflict", "a student with this nis already exists")
            .with_details(json!({ "nis": nis })));
    }

    let row = StudentRow {
        nis,
        nama,
        kelas,
        tanggal_lahir,
        alamat,
        nama_ortu,
        telepon,
    };
    conn.execute(
        "INSERT INTO students(nis, nama, kelas, tanggal_lahir, alamat, nama_ortu, telepon, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &row.nis,
            &row.nama,
            &row.kelas,
            &row.tanggal_lahir,
            &row.alamat,
            &row.nama_ortu,
            &row.telepon,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(sql_err("db_insert_failed"))?;
    tracing::info!(nis = %row.nis, kelas = %row.kelas, by = %user.username, "student created");

    Ok(json!({ "student": row.to_json() }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let kelas = get_optional_text(params, "kelas")?;
    let rows = list_rows(conn, kelas.as_deref())?;
    Ok(json!({
        "students": rows.iter().map(StudentRow::to_json).collect::<Vec<_>>()
    }))
}

fn students_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let nis = get_required_text(params, "nis")?;
    let Some(row) = get_row(conn, &nis)? else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };
    Ok(json!({ "student": row.to_json() }))
}

/// Matches name and class case-insensitively and NIS as a plain substring.
fn matches_query(row: &StudentRow, query: &str) -> bool {
    let q = query.to_lowercase();
    row.nama.to_lowercase().contains(&q)
        || row.nis.contains(query)
        || row.kelas.to_lowercase().contains(&q)
}

fn students_search(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let query = get_required_str(params, "query")?;
    let query = query.trim();
    if query.is_empty() {
        return Ok(json!({ "students": [] }));
    }
    let rows = list_rows(conn, None)?;
    let hits: Vec<serde_json::Value> = rows
        .iter()
        .filter(|r| matches_query(r, query))
        .map(StudentRow::to_json)
        .collect();
    Ok(json!({ "students": hits }))
}

fn students_qr(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let nis = get_required_text(params, "nis")?;
    let now = parse_now(params)?;
    let Some(student) = db::find_student(conn, &nis).map_err(db_err("db_query_failed"))? else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };
    Ok(json!({
        "payload": qr::student_payload(&student, now),
        "issuedAt": qr::format_timestamp(now),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "classes.options" => Ok(json!({ "options": class_options() })),
        "students.create" => require_db(state).and_then(|c| students_create(c, &req.params)),
        "students.list" => require_db(state).and_then(|c| students_list(c, &req.params)),
        "students.get" => require_db(state).and_then(|c| students_get(c, &req.params)),
        "students.search" => require_db(state).and_then(|c| students_search(c, &req.params)),
        "students.qr" => require_db(state).and_then(|c| students_qr(c, &req.params)),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
