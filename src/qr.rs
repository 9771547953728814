use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Maximum age of a scanned attendance payload.
pub const FRESHNESS_WINDOW_MINUTES: f64 = 5.0;
pub const REQUIRED_FIELDS: [&str; 3] = ["nis", "nama", "kelas"];

const ENVELOPE_VERSION: &str = "1.0";
const ENVELOPE_APP: &str = "AbsensiSiswaMobile";

/// Roster entry as supplied by the student directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudentRecord {
    pub nis: String,
    pub nama: String,
    pub kelas: String,
}

/// Decoded contents of a student QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendancePayload {
    pub nis: String,
    pub nama: String,
    pub kelas: String,
    /// Effective timestamp: the embedded one, or the validation instant when
    /// the code carried none (or an unreadable one).
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("payload is not a JSON object")]
    Malformed,
    #[error("payload is missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
}

/// Why a scan was refused. Serialised with a snake_case `reason` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(
    tag = "reason",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Rejection {
    MalformedPayload {
        raw: String,
    },
    MissingFields {
        missing: Vec<&'static str>,
    },
    StudentNotFound {
        payload: AttendancePayload,
    },
    DataMismatch {
        expected: StudentRecord,
        received: AttendancePayload,
    },
    Expired {
        elapsed_minutes: i64,
    },
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::MalformedPayload { .. } => "malformed_payload",
            Rejection::MissingFields { .. } => "missing_fields",
            Rejection::StudentNotFound { .. } => "student_not_found",
            Rejection::DataMismatch { .. } => "data_mismatch",
            Rejection::Expired { .. } => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ValidationResult {
    Valid {
        student: StudentRecord,
        timestamp: DateTime<Utc>,
    },
    Invalid(Rejection),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid { .. })
    }
}

/// Decodes a scanned string into a payload.
///
/// Required fields must be non-blank strings; `null`, numbers and other JSON
/// types count as missing. `now` stands in for an absent or unreadable
/// timestamp.
pub fn parse_payload(raw: &str, now: DateTime<Utc>) -> Result<AttendancePayload, ParseError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| ParseError::Malformed)?;
    let Value::Object(obj) = value else {
        return Err(ParseError::Malformed);
    };

    let field = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.to_string())
    };

    let (nis, nama, kelas) = match (field("nis"), field("nama"), field("kelas")) {
        (Some(nis), Some(nama), Some(kelas)) => (nis, nama, kelas),
        (nis, nama, kelas) => {
            let present = [nis.is_some(), nama.is_some(), kelas.is_some()];
            let missing = REQUIRED_FIELDS
                .iter()
                .zip(present)
                .filter(|(_, ok)| !ok)
                .map(|(name, _)| *name)
                .collect();
            return Err(ParseError::MissingFields(missing));
        }
    };

    let timestamp = obj.get("timestamp").and_then(parse_timestamp).unwrap_or(now);

    Ok(AttendancePayload {
        nis,
        nama,
        kelas,
        timestamp,
    })
}

/// Accepts RFC 3339, offset-less ISO date-times and plain dates (read as UTC),
/// and integer epoch milliseconds.
fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    if let Some(ms) = v.as_i64() {
        return DateTime::from_timestamp_millis(ms);
    }
    let s = v.as_str()?.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn elapsed_minutes(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - since).num_milliseconds() as f64 / 60_000.0
}

/// Checks a scanned string against a roster snapshot at instant `now`.
///
/// Never fails: every refusal is an `Invalid` result. Timestamps in the
/// future are accepted.
pub fn validate(raw: &str, roster: &[StudentRecord], now: DateTime<Utc>) -> ValidationResult {
    let payload = match parse_payload(raw, now) {
        Ok(p) => p,
        Err(ParseError::Malformed) => {
            return ValidationResult::Invalid(Rejection::MalformedPayload {
                raw: raw.to_string(),
            })
        }
        Err(ParseError::MissingFields(missing)) => {
            return ValidationResult::Invalid(Rejection::MissingFields { missing })
        }
    };

    let Some(student) = roster.iter().find(|s| s.nis == payload.nis) else {
        return ValidationResult::Invalid(Rejection::StudentNotFound { payload });
    };

    if student.nama != payload.nama || student.kelas != payload.kelas {
        return ValidationResult::Invalid(Rejection::DataMismatch {
            expected: student.clone(),
            received: payload,
        });
    }

    let elapsed = elapsed_minutes(payload.timestamp, now);
    if elapsed > FRESHNESS_WINDOW_MINUTES {
        return ValidationResult::Invalid(Rejection::Expired {
            elapsed_minutes: elapsed.round() as i64,
        });
    }

    ValidationResult::Valid {
        student: student.clone(),
        timestamp: payload.timestamp,
    }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Attendance payload to encode into a student's QR code.
pub fn student_payload(student: &StudentRecord, now: DateTime<Utc>) -> String {
    json!({
        "nis": student.nis,
        "nama": student.nama,
        "kelas": student.kelas,
        "timestamp": format_timestamp(now),
    })
    .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    StudentAttendance,
    ClassInfo,
    EmergencyContact,
}

impl PayloadKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "student_attendance" => Some(PayloadKind::StudentAttendance),
            "class_info" => Some(PayloadKind::ClassInfo),
            "emergency_contact" => Some(PayloadKind::EmergencyContact),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PayloadKind::StudentAttendance => "student_attendance",
            PayloadKind::ClassInfo => "class_info",
            PayloadKind::EmergencyContact => "emergency_contact",
        }
    }
}

/// Generic versioned envelope for non-attendance QR codes.
pub fn envelope(kind: PayloadKind, data: Value, now: DateTime<Utc>) -> String {
    json!({
        "version": ENVELOPE_VERSION,
        "type": kind.as_str(),
        "data": data,
        "timestamp": format_timestamp(now),
        "app": ENVELOPE_APP,
    })
    .to_string()
}
