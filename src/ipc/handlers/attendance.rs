use crate::auth::{Role, SessionUser};
use crate::db;
use crate::ipc::error::{db_err, respond, sql_err, HandlerErr};
use crate::ipc::helpers::{
    get_optional_text, get_required_str, get_required_text, parse_day, parse_now, require_db,
    require_role,
};
use crate::ipc::types::{AppState, Request};
use crate::qr::{self, StudentRecord, ValidationResult};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Status {
    Hadir,
    Terlambat,
    Izin,
    Sakit,
    Alpha,
}

impl Status {
    const ALL: [Status; 5] = [
        Status::Hadir,
        Status::Terlambat,
        Status::Izin,
        Status::Sakit,
        Status::Alpha,
    ];

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hadir" => Some(Status::Hadir),
            "terlambat" => Some(Status::Terlambat),
            "izin" => Some(Status::Izin),
            "sakit" => Some(Status::Sakit),
            "alpha" => Some(Status::Alpha),
            _ => None,
        }
    }

    /// Statuses that mean the student was at school.
    fn is_present(self) -> bool {
        matches!(self, Status::Hadir | Status::Terlambat)
    }

    fn as_str(self) -> &'static str {
        match self {
            Status::Hadir => "hadir",
            Status::Terlambat => "terlambat",
            Status::Izin => "izin",
            Status::Sakit => "sakit",
            Status::Alpha => "alpha",
        }
    }
}

fn day_key(ts: DateTime<Utc>) -> String {
    ts.date_naive().format("%Y-%m-%d").to_string()
}

/// The day's entry for a student, if any: `(id, status)`.
fn existing_entry(
    conn: &Connection,
    nis: &str,
    day: &str,
) -> Result<Option<(String, Option<Status>)>, HandlerErr> {
    conn.query_row(
        "SELECT id, status FROM attendance_records WHERE nis = ? AND day = ?",
        (nis, day),
        |r| {
            let status: String = r.get(1)?;
            Ok((r.get::<_, String>(0)?, Status::parse(&status)))
        },
    )
    .optional()
    .map_err(sql_err("db_query_failed"))
}

/// Writes the student's single status for the day, replacing any earlier one.
/// Returns the entry id, which stays stable across replacements.
fn upsert_entry(
    conn: &Connection,
    student: &StudentRecord,
    status: Status,
    source: &str,
    note: Option<&str>,
    at: DateTime<Utc>,
    by: &SessionUser,
) -> Result<String, HandlerErr> {
    conn.query_row(
        "INSERT INTO attendance_records(id, nis, kelas, day, status, source, note, recorded_at, recorded_by)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(nis, day) DO UPDATE SET
           kelas = excluded.kelas,
           status = excluded.status,
           source = excluded.source,
           note = excluded.note,
           recorded_at = excluded.recorded_at,
           recorded_by = excluded.recorded_by
         RETURNING id",
        (
            Uuid::new_v4().to_string(),
            &student.nis,
            &student.kelas,
            day_key(at),
            status.as_str(),
            source,
            note,
            qr::format_timestamp(at),
            &by.username,
        ),
        |r| r.get(0),
    )
    .map_err(|e| {
        HandlerErr::new("db_update_failed", e.to_string())
            .with_details(json!({ "table": "attendance_records" }))
    })
}

/// Validates a scanned code against the stored roster and, when accepted,
/// marks the student `hadir`. A student already present that day keeps the
/// earlier entry; an absence status (izin, sakit, alpha) is replaced.
fn attendance_scan(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let user = require_role(conn, Role::Guru)?;
    let raw = get_required_str(params, "raw")?;
    let now = parse_now(params)?;
    let roster = db::load_roster(conn).map_err(db_err("db_query_failed"))?;

    let result = qr::validate(&raw, &roster, now);
    let (record_id, already_recorded, previous) = match &result {
        ValidationResult::Valid { student, .. } => {
            match existing_entry(conn, &student.nis, &day_key(now))? {
                Some((id, Some(status))) if status.is_present() => {
                    tracing::info!(nis = %student.nis, "scan accepted, already present today");
                    (Some(id), true, Some(status))
                }
                existing => {
                    let previous = existing.and_then(|(_, status)| status);
                    let id = upsert_entry(conn, student, Status::Hadir, "qr", None, now, &user)?;
                    tracing::info!(
                        nis = %student.nis,
                        kelas = %student.kelas,
                        replaced = previous.map(Status::as_str),
                        "scan accepted"
                    );
                    (Some(id), false, previous)
                }
            }
        }
        ValidationResult::Invalid(rejection) => {
            tracing::warn!(reason = rejection.code(), "scan rejected");
            (None, false, None)
        }
    };

    Ok(json!({
        "validation": result,
        "recordId": record_id,
        "alreadyRecorded": already_recorded,
        "previousStatus": previous.map(Status::as_str),
    }))
}

fn attendance_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let user = require_role(conn, Role::Guru)?;
    let nis = get_required_text(params, "nis")?;
    let status_raw = get_required_text(params, "status")?;
    let Some(status) = Status::parse(&status_raw) else {
        return Err(HandlerErr::bad_params(
            "status must be hadir, terlambat, izin, sakit or alpha",
        ));
    };
    let note = get_optional_text(params, "note")?;
    let now = parse_now(params)?;

    let Some(student) = db::find_student(conn, &nis).map_err(db_err("db_query_failed"))? else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };
    let previous = existing_entry(conn, &student.nis, &day_key(now))?.and_then(|(_, s)| s);
    let id = upsert_entry(conn, &student, status, "manual", note.as_deref(), now, &user)?;
    tracing::info!(
        nis = %student.nis,
        status = status.as_str(),
        replaced = previous.map(Status::as_str),
        "attendance recorded"
    );

    Ok(json!({
        "recordId": id,
        "nis": student.nis,
        "status": status.as_str(),
        "previousStatus": previous.map(Status::as_str),
        "recordedAt": qr::format_timestamp(now),
    }))
}

/// Parses the optional `status` filter; absent or `semua` means every student.
fn parse_status_filter(params: &serde_json::Value) -> Result<Option<Status>, HandlerErr> {
    match get_optional_text(params, "status")? {
        None => Ok(None),
        Some(raw) if raw.eq_ignore_ascii_case("semua") => Ok(None),
        Some(raw) => Status::parse(&raw).map(Some).ok_or_else(|| {
            HandlerErr::bad_params("status must be semua, hadir, terlambat, izin, sakit or alpha")
        }),
    }
}

/// The roster for one day with each student's status. Students without an
/// entry carry a null status and are dropped by any status filter.
fn attendance_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let day: NaiveDate = parse_day(params, "date")?;
    let key = day.format("%Y-%m-%d").to_string();
    let filter = parse_status_filter(params)?;

    let mut stmt = conn
        .prepare(
            "SELECT a.id, s.nis, s.nama, s.kelas, a.status, a.source, a.note, a.recorded_at, a.recorded_by
             FROM students s
             LEFT JOIN attendance_records a ON a.nis = s.nis AND a.day = ?1
             WHERE ?2 IS NULL OR a.status = ?2
             ORDER BY s.kelas, s.nama",
        )
        .map_err(sql_err("db_query_failed"))?;
    let entries = stmt
        .query_map((&key, filter.map(Status::as_str)), |r| {
            Ok(json!({
                "id": r.get::<_, Option<String>>(0)?,
                "nis": r.get::<_, String>(1)?,
                "nama": r.get::<_, String>(2)?,
                "kelas": r.get::<_, String>(3)?,
                "status": r.get::<_, Option<String>>(4)?,
                "source": r.get::<_, Option<String>>(5)?,
                "note": r.get::<_, Option<String>>(6)?,
                "recordedAt": r.get::<_, Option<String>>(7)?,
                "recordedBy": r.get::<_, Option<String>>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(sql_err("db_query_failed"))?;

    Ok(json!({
        "date": key,
        "status": filter.map(Status::as_str).unwrap_or("semua"),
        "entries": entries,
    }))
}

/// Per-status counts for one day, as shown on the dashboard.
fn attendance_summary(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let day = parse_day(params, "date")?;
    let key = day.format("%Y-%m-%d").to_string();

    let mut counts: BTreeMap<Status, i64> = Status::ALL.iter().map(|s| (*s, 0)).collect();
    let mut stmt = conn
        .prepare("SELECT status, COUNT(*) FROM attendance_records WHERE day = ? GROUP BY status")
        .map_err(sql_err("db_query_failed"))?;
    let rows = stmt
        .query_map([&key], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(sql_err("db_query_failed"))?;
    for (status, n) in rows {
        if let Some(s) = Status::parse(&status) {
            *counts.entry(s).or_insert(0) += n;
        }
    }

    let total_students: i64 = conn
        .query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))
        .map_err(sql_err("db_query_failed"))?;
    let recorded_students: i64 = conn
        .query_row(
            "SELECT COUNT(DISTINCT nis) FROM attendance_records WHERE day = ?",
            [&key],
            |r| r.get(0),
        )
        .map_err(sql_err("db_query_failed"))?;

    let by_status: serde_json::Map<String, serde_json::Value> = counts
        .iter()
        .map(|(s, n)| (s.as_str().to_string(), json!(n)))
        .collect();

    Ok(json!({
        "date": key,
        "counts": by_status,
        "totalStudents": total_students,
        "notRecorded": (total_students - recorded_students).max(0),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "attendance.scan" => require_db(state).and_then(|c| attendance_scan(c, &req.params)),
        "attendance.record" => require_db(state).and_then(|c| attendance_record(c, &req.params)),
        "attendance.list" => require_db(state).and_then(|c| attendance_list(c, &req.params)),
        "attendance.summary" => require_db(state).and_then(|c| attendance_summary(c, &req.params)),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
