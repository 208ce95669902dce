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
    let exe = env!("CARGO_BIN_EXE_rollcalld");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rollcalld");
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn fail_code(value: &serde_json::Value) -> String {
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "expected a failure response: {}",
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn register(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    last: &str,
    email: &str,
    role: &str,
    class_id: Option<&str>,
) -> String {
    let mut params = json!({
        "lastName": last,
        "firstName": "Test",
        "email": email,
        "role": role
    });
    if let Some(class_id) = class_id {
        params["classId"] = json!(class_id);
    }
    let user = request_ok(stdin, reader, id, "users.register", params);
    user["user"]["id"].as_str().expect("user id").to_string()
}

#[test]
fn roll_call_rejects_wrong_actors_and_malformed_batches() {
    let workspace = temp_dir("rollcall-authz");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin_id = register(&mut stdin, &mut reader, "u1", "Root", "admin@school.test", "ADMIN", None);
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "classes.create",
        json!({ "actorId": admin_id, "name": "Year 9A" }),
    );
    let class_id = class["classId"].as_str().expect("class id").to_string();
    let owner_id = register(&mut stdin, &mut reader, "u2", "Owner", "owner@school.test", "PROF", None);
    let other_prof = register(&mut stdin, &mut reader, "u3", "Other", "other@school.test", "PROF", None);
    let student_id = register(&mut stdin, &mut reader, "u4", "Pupil", "pupil@school.test", "ELEVE", Some(&class_id));
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "c2",
        "courses.create",
        json!({ "actorId": admin_id, "name": "Mathematics", "teacherId": owner_id, "classId": class_id }),
    );
    let course_id = course["course"]["id"].as_str().expect("course id").to_string();

    let entries = json!([{ "studentId": student_id, "status": "absent" }]);

    // No actor at all.
    let anonymous = request(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.submitRollCall",
        json!({ "courseId": course_id, "day": "2024-03-01", "entries": entries }),
    );
    assert_eq!(fail_code(&anonymous), "unauthorized");

    // Unknown actor id.
    let ghost = request(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.submitRollCall",
        json!({ "actorId": "nobody", "courseId": course_id, "day": "2024-03-01", "entries": entries }),
    );
    assert_eq!(fail_code(&ghost), "unauthorized");

    // The roll call is a teacher's act; even administrators use the
    // direct-create path instead.
    let as_admin = request(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.submitRollCall",
        json!({ "actorId": admin_id, "courseId": course_id, "day": "2024-03-01", "entries": entries }),
    );
    assert_eq!(fail_code(&as_admin), "forbidden");

    let as_student = request(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.submitRollCall",
        json!({ "actorId": student_id, "courseId": course_id, "day": "2024-03-01", "entries": entries }),
    );
    assert_eq!(fail_code(&as_student), "forbidden");

    // A teacher, but not this course's teacher.
    let wrong_teacher = request(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.submitRollCall",
        json!({ "actorId": other_prof, "courseId": course_id, "day": "2024-03-01", "entries": entries }),
    );
    assert_eq!(fail_code(&wrong_teacher), "forbidden");

    let unknown_course = request(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.submitRollCall",
        json!({ "actorId": owner_id, "courseId": "missing", "day": "2024-03-01", "entries": entries }),
    );
    assert_eq!(fail_code(&unknown_course), "not_found");

    for (id, params) in [
        ("7", json!({ "actorId": owner_id, "day": "2024-03-01", "entries": entries })),
        ("8", json!({ "actorId": owner_id, "courseId": course_id, "entries": entries })),
        ("9", json!({ "actorId": owner_id, "courseId": course_id, "day": "2024-03-01" })),
        ("10", json!({ "actorId": owner_id, "courseId": course_id, "day": "2024-03-01", "entries": [] })),
        ("11", json!({ "actorId": owner_id, "courseId": course_id, "day": "2024-03-01", "entries": [{ "status": "absent" }] })),
        ("12", json!({ "actorId": owner_id, "courseId": course_id, "day": "not-a-day", "entries": entries })),
    ] {
        let resp = request(&mut stdin, &mut reader, id, "attendance.submitRollCall", params);
        assert_eq!(fail_code(&resp), "bad_params", "case {}", id);
    }

    // A batch with one malformed status writes nothing at all.
    let mixed = request(
        &mut stdin,
        &mut reader,
        "13",
        "attendance.submitRollCall",
        json!({
            "actorId": owner_id,
            "courseId": course_id,
            "day": "2024-03-01",
            "entries": [
                { "studentId": student_id, "status": "present" },
                { "studentId": student_id, "status": "asleep" }
            ]
        }),
    );
    assert_eq!(fail_code(&mixed), "bad_params");
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "attendance.list",
        json!({ "actorId": admin_id, "courseId": course_id }),
    );
    assert_eq!(listed["records"].as_array().map(|a| a.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn record_edits_respect_ownership_and_status_validation() {
    let workspace = temp_dir("rollcall-edit-authz");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin_id = register(&mut stdin, &mut reader, "u1", "Root", "admin@school.test", "ADMIN", None);
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "classes.create",
        json!({ "actorId": admin_id, "name": "Year 9A" }),
    );
    let class_id = class["classId"].as_str().expect("class id").to_string();
    let owner_id = register(&mut stdin, &mut reader, "u2", "Owner", "owner@school.test", "PROF", None);
    let other_prof = register(&mut stdin, &mut reader, "u3", "Other", "other@school.test", "PROF", None);
    let student_id = register(&mut stdin, &mut reader, "u4", "Pupil", "pupil@school.test", "ELEVE", Some(&class_id));
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "c2",
        "courses.create",
        json!({ "actorId": admin_id, "name": "Mathematics", "teacherId": owner_id, "classId": class_id }),
    );
    let course_id = course["course"]["id"].as_str().expect("course id").to_string();

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.submitRollCall",
        json!({
            "actorId": owner_id,
            "courseId": course_id,
            "day": "2024-03-01",
            "entries": [{ "studentId": student_id, "status": "present" }]
        }),
    );
    let record_id = submitted["records"][0]["id"].as_str().expect("record id").to_string();

    let bad_status = request(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.edit",
        json!({ "actorId": owner_id, "recordId": record_id, "status": "vanished" }),
    );
    assert_eq!(fail_code(&bad_status), "bad_params");

    let missing = request(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.edit",
        json!({ "actorId": owner_id, "recordId": "missing", "status": "absent" }),
    );
    assert_eq!(fail_code(&missing), "not_found");

    let not_owner = request(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.edit",
        json!({ "actorId": other_prof, "recordId": record_id, "status": "absent" }),
    );
    assert_eq!(fail_code(&not_owner), "forbidden");

    let as_student = request(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.edit",
        json!({ "actorId": student_id, "recordId": record_id, "status": "absent" }),
    );
    assert_eq!(fail_code(&as_student), "forbidden");

    // The owning teacher and the administration both may edit.
    let by_owner = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.edit",
        json!({ "actorId": owner_id, "recordId": record_id, "status": "late" }),
    );
    assert_eq!(by_owner["record"]["status"].as_str(), Some("late"));
    let by_admin = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.edit",
        json!({ "actorId": admin_id, "recordId": record_id, "status": "absent" }),
    );
    assert_eq!(by_admin["record"]["status"].as_str(), Some("absent"));

    // The direct-create path is closed to students.
    let create_as_student = request(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.create",
        json!({ "actorId": student_id, "studentId": student_id, "courseId": course_id }),
    );
    assert_eq!(fail_code(&create_as_student), "forbidden");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
