use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_absensid");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn absensid");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_default()
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn setup_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "reg",
        "auth.register",
        json!({
            "nama": "Sari Wulandari",
            "email": "sari@sekolah.com",
            "password": "rahasia",
            "confirmPassword": "rahasia",
            "role": "guru"
        }),
    );
    for (nis, nama) in [("2023001", "Ahmad Fauzi"), ("2023002", "Budi Santoso")] {
        let _ = request_ok(
            stdin,
            reader,
            nis,
            "students.create",
            json!({ "nis": nis, "nama": nama, "kelas": "XII IPA 1" }),
        );
    }
}

#[test]
fn scanned_student_code_is_recorded_once_per_day() {
    let workspace = temp_dir("absensi-scan-record");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    setup_class(&mut stdin, &mut reader, &workspace);

    let qr = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.qr",
        json!({ "nis": "2023001", "now": "2024-01-01T08:00:00Z" }),
    );
    let payload = qr["payload"].as_str().expect("payload").to_string();

    let scan = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.scan",
        json!({ "raw": payload, "now": "2024-01-01T08:02:00Z" }),
    );
    assert_eq!(scan["validation"]["outcome"], "valid");
    assert_eq!(scan["validation"]["student"]["nis"], "2023001");
    assert_eq!(scan["validation"]["timestamp"], "2024-01-01T08:00:00Z");
    assert_eq!(scan["alreadyRecorded"], false);
    let record_id = scan["recordId"].as_str().expect("recordId").to_string();

    let again = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.scan",
        json!({ "raw": payload, "now": "2024-01-01T08:03:00Z" }),
    );
    assert_eq!(again["validation"]["outcome"], "valid");
    assert_eq!(again["alreadyRecorded"], true);
    assert_eq!(again["recordId"], json!(record_id));

    let late = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.scan",
        json!({ "raw": payload, "now": "2024-01-01T08:10:00Z" }),
    );
    assert_eq!(late["validation"]["reason"], "expired");
    assert_eq!(late["validation"]["elapsedMinutes"], 10);
    assert!(late["recordId"].is_null());

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.list",
        json!({ "date": "2024-01-01" }),
    );
    let entries = list["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["id"], json!(record_id));
    assert_eq!(entries[0]["nama"], "Ahmad Fauzi");
    assert_eq!(entries[0]["status"], "hadir");
    assert_eq!(entries[0]["source"], "qr");
    assert_eq!(entries[0]["recordedBy"], "sari");
    assert_eq!(entries[0]["recordedAt"], "2024-01-01T08:02:00.000Z");
    assert_eq!(entries[1]["nama"], "Budi Santoso");
    assert!(entries[1]["status"].is_null());
    assert!(entries[1]["id"].is_null());

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.summary",
        json!({ "date": "2024-01-01" }),
    );
    assert_eq!(summary["counts"]["hadir"], 1);
    assert_eq!(summary["counts"]["izin"], 0);
    assert_eq!(summary["totalStudents"], 2);
    assert_eq!(summary["notRecorded"], 1);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn rejected_scans_leave_no_attendance_entry() {
    let workspace = temp_dir("absensi-scan-reject");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    setup_class(&mut stdin, &mut reader, &workspace);

    let cases = [
        ("not json", "malformed_payload"),
        (r#"{"nis":"2023001","nama":""}"#, "missing_fields"),
        (r#"{"nis":"9999999","nama":"X","kelas":"Y"}"#, "student_not_found"),
        (
            r#"{"nis":"2023001","nama":"Wrong Name","kelas":"XII IPA 1"}"#,
            "data_mismatch",
        ),
        (
            r#"{"nis":"2023002","nama":"Budi Santoso","kelas":"XII IPA 1","timestamp":"2024-01-01T07:00:00Z"}"#,
            "expired",
        ),
    ];
    for (i, (raw, reason)) in cases.iter().enumerate() {
        let res = request_ok(
            &mut stdin,
            &mut reader,
            &format!("scan-{}", i),
            "attendance.scan",
            json!({ "raw": raw, "now": "2024-01-01T08:00:00Z" }),
        );
        assert_eq!(res["validation"]["outcome"], "invalid", "raw={}", raw);
        assert_eq!(res["validation"]["reason"], *reason, "raw={}", raw);
        assert!(res["recordId"].is_null());
    }

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "sum",
        "attendance.summary",
        json!({ "date": "2024-01-01" }),
    );
    assert_eq!(summary["counts"]["hadir"], 0);
    assert_eq!(summary["notRecorded"], 2);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn manual_records_require_a_guru_session() {
    let workspace = temp_dir("absensi-manual-record");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let anon = request(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.scan",
        json!({ "raw": "{}" }),
    );
    assert_eq!(error_code(&anon), "unauthorized");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.register",
        json!({
            "nama": "Citra Dewi",
            "email": "citra@sekolah.com",
            "password": "rahasia",
            "confirmPassword": "rahasia"
        }),
    );
    let student_role = request(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.record",
        json!({ "nis": "2023001", "status": "hadir" }),
    );
    assert_eq!(error_code(&student_role), "forbidden");
    assert_eq!(student_role["error"]["details"]["required"], "guru");

    let _ = request_ok(&mut stdin, &mut reader, "5", "auth.logout", json!({}));
    setup_class(&mut stdin, &mut reader, &workspace);

    let rec = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.record",
        json!({ "nis": "2023002", "status": "Izin", "note": "acara keluarga", "now": "2024-01-02T07:15:00Z" }),
    );
    assert_eq!(rec["status"], "izin");
    assert_eq!(rec["recordedAt"], "2024-01-02T07:15:00.000Z");

    let bad_status = request(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.record",
        json!({ "nis": "2023002", "status": "bolos" }),
    );
    assert_eq!(error_code(&bad_status), "bad_params");

    let unknown = request(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.record",
        json!({ "nis": "9999999", "status": "sakit" }),
    );
    assert_eq!(error_code(&unknown), "not_found");

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.list",
        json!({ "date": "2024-01-02", "status": "izin" }),
    );
    assert_eq!(list["status"], "izin");
    let entries = list["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["nis"], "2023002");
    assert_eq!(entries[0]["source"], "manual");
    assert_eq!(entries[0]["note"], "acara keluarga");

    let bad_date = request(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.summary",
        json!({ "date": "02/01/2024" }),
    );
    assert_eq!(error_code(&bad_date), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn scan_replaces_an_absence_and_corrections_keep_one_status_per_day() {
    let workspace = temp_dir("absensi-scan-upsert");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    setup_class(&mut stdin, &mut reader, &workspace);

    let alpha = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.record",
        json!({ "nis": "2023001", "status": "alpha", "now": "2024-01-01T07:00:00Z" }),
    );
    assert!(alpha["previousStatus"].is_null());
    let alpha_id = alpha["recordId"].as_str().expect("recordId").to_string();

    let qr = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.qr",
        json!({ "nis": "2023001", "now": "2024-01-01T08:00:00Z" }),
    );
    let scan = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.scan",
        json!({ "raw": qr["payload"], "now": "2024-01-01T08:01:00Z" }),
    );
    assert_eq!(scan["validation"]["outcome"], "valid");
    assert_eq!(scan["alreadyRecorded"], false);
    assert_eq!(scan["previousStatus"], "alpha");
    assert_eq!(scan["recordId"], json!(alpha_id));

    let present = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.list",
        json!({ "date": "2024-01-01", "status": "hadir" }),
    );
    let entries = present["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["nis"], "2023001");
    assert_eq!(entries[0]["source"], "qr");
    assert_eq!(entries[0]["recordedAt"], "2024-01-01T08:01:00.000Z");

    let absent = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.list",
        json!({ "date": "2024-01-01", "status": "alpha" }),
    );
    assert_eq!(absent["entries"].as_array().expect("entries").len(), 0);

    // Same-day correction from sakit to hadir for the other student.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.record",
        json!({ "nis": "2023002", "status": "sakit", "now": "2024-01-01T07:05:00Z" }),
    );
    let fixed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.record",
        json!({ "nis": "2023002", "status": "hadir", "now": "2024-01-01T09:00:00Z" }),
    );
    assert_eq!(fixed["previousStatus"], "sakit");

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.summary",
        json!({ "date": "2024-01-01" }),
    );
    assert_eq!(summary["counts"]["hadir"], 2);
    assert_eq!(summary["counts"]["alpha"], 0);
    assert_eq!(summary["counts"]["sakit"], 0);
    assert_eq!(summary["totalStudents"], 2);
    assert_eq!(summary["notRecorded"], 0);

    // A present student scanning again keeps the existing entry.
    let qr2 = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.qr",
        json!({ "nis": "2023002", "now": "2024-01-01T09:30:00Z" }),
    );
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.scan",
        json!({ "raw": qr2["payload"], "now": "2024-01-01T09:31:00Z" }),
    );
    assert_eq!(again["alreadyRecorded"], true);
    assert_eq!(again["previousStatus"], "hadir");

    let all = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "attendance.list",
        json!({ "date": "2024-01-01", "status": "semua" }),
    );
    let entries = all["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1]["source"], "manual");
    assert_eq!(entries[1]["recordedAt"], "2024-01-01T09:00:00.000Z");

    let bad_filter = request(
        &mut stdin,
        &mut reader,
        "12",
        "attendance.list",
        json!({ "date": "2024-01-01", "status": "bolos" }),
    );
    assert_eq!(error_code(&bad_filter), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
