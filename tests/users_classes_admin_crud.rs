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

#[test]
fn user_management_enforces_validation_and_admin_gate() {
    let workspace = temp_dir("users-crud");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "users.register",
        json!({ "lastName": "Root", "firstName": "Ada", "email": "admin@school.test", "role": "ADMIN" }),
    );
    let admin_id = admin["user"]["id"].as_str().expect("admin id").to_string();

    // users.create is the managed path: PROF/ELEVE only.
    let second_admin = request(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        json!({
            "actorId": admin_id,
            "lastName": "Clone",
            "firstName": "Admin",
            "email": "clone@school.test",
            "role": "ADMIN"
        }),
    );
    assert_eq!(fail_code(&second_admin), "bad_params");

    let bad_email = request(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        json!({
            "actorId": admin_id,
            "lastName": "Kay",
            "firstName": "Alan",
            "email": "not-an-email",
            "role": "PROF"
        }),
    );
    assert_eq!(fail_code(&bad_email), "bad_params");

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        json!({
            "actorId": admin_id,
            "lastName": "Kay",
            "firstName": "Alan",
            "email": "kay@school.test",
            "role": "PROF"
        }),
    );
    let teacher_id = teacher["user"]["id"].as_str().expect("teacher id").to_string();

    let duplicate = request(
        &mut stdin,
        &mut reader,
        "5",
        "users.create",
        json!({
            "actorId": admin_id,
            "lastName": "Kay",
            "firstName": "Other",
            "email": "kay@school.test",
            "role": "ELEVE"
        }),
    );
    assert_eq!(fail_code(&duplicate), "bad_params");

    // Management is closed to non-admins.
    let as_teacher = request(
        &mut stdin,
        &mut reader,
        "6",
        "users.list",
        json!({ "actorId": teacher_id }),
    );
    assert_eq!(fail_code(&as_teacher), "forbidden");

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "users.create",
        json!({
            "actorId": admin_id,
            "lastName": "Lovelace",
            "firstName": "Ada",
            "email": "lovelace@school.test"
        }),
    );
    let student_id = student["user"]["id"].as_str().expect("student id").to_string();
    assert_eq!(student["user"]["role"].as_str(), Some("ELEVE"));

    let searched = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "users.list",
        json!({ "actorId": admin_id, "search": "love" }),
    );
    let found = searched["users"].as_array().expect("users");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["lastName"].as_str(), Some("Lovelace"));

    let renamed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "users.update",
        json!({ "actorId": admin_id, "userId": student_id, "firstName": "Augusta" }),
    );
    assert_eq!(renamed["user"]["firstName"].as_str(), Some("Augusta"));

    let email_clash = request(
        &mut stdin,
        &mut reader,
        "10",
        "users.update",
        json!({ "actorId": admin_id, "userId": student_id, "email": "kay@school.test" }),
    );
    assert_eq!(fail_code(&email_clash), "bad_params");

    // Deactivation locks the account out of every authenticated call.
    let deactivated = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "users.setActive",
        json!({ "actorId": admin_id, "userId": student_id, "active": false }),
    );
    assert_eq!(deactivated["user"]["active"].as_bool(), Some(false));
    let as_disabled = request(
        &mut stdin,
        &mut reader,
        "12",
        "attendance.listForStudent",
        json!({ "actorId": student_id }),
    );
    assert_eq!(fail_code(&as_disabled), "forbidden");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "users.setActive",
        json!({ "actorId": admin_id, "userId": student_id, "active": true }),
    );

    // The administration cannot lock itself out.
    let lockout = request(
        &mut stdin,
        &mut reader,
        "14",
        "users.setActive",
        json!({ "actorId": admin_id, "userId": admin_id, "active": false }),
    );
    assert_eq!(fail_code(&lockout), "forbidden");

    let gone = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "users.delete",
        json!({ "actorId": admin_id, "userId": student_id }),
    );
    assert_eq!(gone["message"].as_str(), Some("user deleted"));
    let missing = request(
        &mut stdin,
        &mut reader,
        "16",
        "users.delete",
        json!({ "actorId": admin_id, "userId": student_id }),
    );
    assert_eq!(fail_code(&missing), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn class_membership_management() {
    let workspace = temp_dir("classes-crud");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "users.register",
        json!({ "lastName": "Root", "firstName": "Ada", "email": "admin@school.test", "role": "ADMIN" }),
    );
    let admin_id = admin["user"]["id"].as_str().expect("admin id").to_string();
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.register",
        json!({ "lastName": "Turing", "firstName": "Alan", "email": "prof@school.test", "role": "PROF" }),
    );
    let teacher_id = teacher["user"]["id"].as_str().expect("teacher id").to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "users.register",
        json!({ "lastName": "Hopper", "firstName": "Grace", "email": "s1@school.test" }),
    );
    let student_id = student["user"]["id"].as_str().expect("student id").to_string();

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({ "actorId": admin_id, "name": "Year 9A", "description": "first stream" }),
    );
    let class_id = class["classId"].as_str().expect("class id").to_string();

    let as_teacher = request(
        &mut stdin,
        &mut reader,
        "5",
        "classes.create",
        json!({ "actorId": teacher_id, "name": "Shadow" }),
    );
    assert_eq!(fail_code(&as_teacher), "forbidden");

    // Only students can be placed in a class.
    let not_a_student = request(
        &mut stdin,
        &mut reader,
        "6",
        "classes.assignStudent",
        json!({ "actorId": admin_id, "classId": class_id, "studentId": teacher_id }),
    );
    assert_eq!(fail_code(&not_a_student), "bad_params");

    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "classes.assignStudent",
        json!({ "actorId": admin_id, "classId": class_id, "studentId": student_id }),
    );
    let members = assigned["class"]["students"].as_array().expect("students");
    assert_eq!(members.len(), 1);
    assert_eq!(members[0]["id"].as_str(), Some(student_id.as_str()));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "classes.list",
        json!({ "actorId": teacher_id }),
    );
    let classes = listed["classes"].as_array().expect("classes");
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0]["name"].as_str(), Some("Year 9A"));
    assert_eq!(
        classes[0]["students"].as_array().map(|a| a.len()),
        Some(1)
    );

    let renamed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "classes.update",
        json!({ "actorId": admin_id, "classId": class_id, "name": "Year 9B" }),
    );
    assert_eq!(renamed["class"]["name"].as_str(), Some("Year 9B"));

    // Deleting a class releases its students.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "classes.delete",
        json!({ "actorId": admin_id, "classId": class_id }),
    );
    let users = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "users.list",
        json!({ "actorId": admin_id, "search": "hopper" }),
    );
    let users = users["users"].as_array().expect("users");
    assert_eq!(users.len(), 1);
    assert!(users[0].get("class").is_none() || users[0]["class"].is_null());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
