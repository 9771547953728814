use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{get_required_str, parse_now};
use crate::ipc::types::{AppState, Request};
use crate::qr::{self, PayloadKind, StudentRecord};
use serde_json::json;

/// Caller-supplied roster: an array of `{nis, nama, kelas}` objects.
fn parse_roster(params: &serde_json::Value) -> Result<Vec<StudentRecord>, HandlerErr> {
    let Some(items) = params.get("roster").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing roster"));
    };
    let mut roster = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let field = |key: &str| {
            item.get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    HandlerErr::bad_params(format!("roster[{}].{} must be a string", idx, key))
                })
        };
        roster.push(StudentRecord {
            nis: field("nis")?,
            nama: field("nama")?,
            kelas: field("kelas")?,
        });
    }
    Ok(roster)
}

fn qr_validate(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let raw = get_required_str(params, "raw")?;
    let roster = parse_roster(params)?;
    let now = parse_now(params)?;
    let result = qr::validate(&raw, &roster, now);
    tracing::debug!(valid = result.is_valid(), roster = roster.len(), "qr.validate");
    Ok(json!(result))
}

fn qr_envelope(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let kind_raw = get_required_str(params, "type")?;
    let Some(kind) = PayloadKind::parse(&kind_raw) else {
        return Err(HandlerErr::bad_params(
            "type must be student_attendance, class_info or emergency_contact",
        ));
    };
    let data = params.get("data").cloned().unwrap_or(serde_json::Value::Null);
    let now = parse_now(params)?;
    Ok(json!({ "payload": qr::envelope(kind, data, now) }))
}

pub fn try_handle(_state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "qr.validate" => Some(respond(&req.id, qr_validate(&req.params))),
        "qr.envelope" => Some(respond(&req.id, qr_envelope(&req.params))),
        _ => None,
    }
}
