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
fn overview_aggregates_and_filters_attendance() {
    let workspace = temp_dir("stats-overview");
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

    let class_a = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "actorId": admin_id, "name": "Year 9A" }),
    );
    let class_a_id = class_a["classId"].as_str().expect("class id").to_string();
    let class_b = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({ "actorId": admin_id, "name": "Year 9B" }),
    );
    let class_b_id = class_b["classId"].as_str().expect("class id").to_string();

    let s1 = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "users.register",
        json!({ "lastName": "Hopper", "firstName": "Grace", "email": "s1@school.test", "classId": class_a_id }),
    );
    let s1_id = s1["user"]["id"].as_str().expect("student id").to_string();
    let s2 = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "users.register",
        json!({ "lastName": "Moore", "firstName": "Mia", "email": "s2@school.test", "classId": class_b_id }),
    );
    let s2_id = s2["user"]["id"].as_str().expect("student id").to_string();

    let math = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "courses.create",
        json!({ "actorId": admin_id, "name": "Mathematics", "teacherId": teacher_id, "classId": class_a_id }),
    );
    let math_id = math["course"]["id"].as_str().expect("course id").to_string();
    let art = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "courses.create",
        json!({ "actorId": admin_id, "name": "Art", "teacherId": teacher_id, "classId": class_b_id }),
    );
    let art_id = art["course"]["id"].as_str().expect("course id").to_string();

    // March: s1 absent twice in math, s2 present in art.
    for (id, course, student, day, status) in [
        ("r1", &math_id, &s1_id, "2024-03-01", "absent"),
        ("r2", &math_id, &s1_id, "2024-03-04", "absent"),
        ("r3", &art_id, &s2_id, "2024-03-01", "present"),
        // April: mixed.
        ("r4", &math_id, &s1_id, "2024-04-02", "present"),
        ("r5", &art_id, &s2_id, "2024-04-02", "late"),
        ("r6", &art_id, &s2_id, "2024-04-03", "absent"),
    ] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "attendance.submitRollCall",
            json!({
                "actorId": teacher_id,
                "courseId": course,
                "day": day,
                "entries": [{ "studentId": student, "status": status }]
            }),
        );
    }

    // Statistics are an administration dashboard.
    let as_teacher = request(
        &mut stdin,
        &mut reader,
        "9",
        "stats.overview",
        json!({ "actorId": teacher_id }),
    );
    assert_eq!(fail_code(&as_teacher), "forbidden");

    let overview = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "stats.overview",
        json!({ "actorId": admin_id }),
    );

    assert_eq!(overview["dashboard"]["totalStudents"].as_i64(), Some(2));
    assert_eq!(overview["dashboard"]["totalTeachers"].as_i64(), Some(1));
    assert_eq!(overview["dashboard"]["totalClasses"].as_i64(), Some(2));
    // 3 absences out of 6 records.
    assert_eq!(overview["dashboard"]["globalAbsenceRate"].as_f64(), Some(50.0));
    assert_eq!(
        overview["dashboard"]["mostAbsentStudent"]["lastName"].as_str(),
        Some("Hopper")
    );
    assert_eq!(
        overview["dashboard"]["mostAbsentStudent"]["absenceCount"].as_i64(),
        Some(2)
    );
    assert_eq!(
        overview["dashboard"]["mostAbsentClass"]["name"].as_str(),
        Some("Year 9A")
    );

    assert_eq!(overview["global"]["total"].as_i64(), Some(6));
    assert_eq!(overview["global"]["present"].as_i64(), Some(2));
    assert_eq!(overview["global"]["absent"].as_i64(), Some(3));
    assert_eq!(overview["global"]["late"].as_i64(), Some(1));

    assert_eq!(overview["byClass"]["Year 9A"]["absent"].as_i64(), Some(2));
    assert_eq!(overview["byCourse"]["Art"]["total"].as_i64(), Some(3));

    let months = overview["absencesByMonth"].as_array().expect("months");
    assert_eq!(months.len(), 2);
    assert_eq!(months[0]["month"].as_str(), Some("2024-03"));
    assert_eq!(months[0]["label"].as_str(), Some("Mar 2024"));
    assert_eq!(months[0]["absences"].as_i64(), Some(2));
    assert_eq!(months[1]["month"].as_str(), Some("2024-04"));
    assert_eq!(months[1]["absences"].as_i64(), Some(1));

    let rates = overview["attendanceRateByMonth"].as_array().expect("rates");
    // March: 1 present of 3. April: 1 present of 3.
    assert_eq!(rates[0]["attendanceRate"].as_f64(), Some(33.3));
    assert_eq!(rates[0]["total"].as_i64(), Some(3));

    let comparison = overview["classComparison"].as_array().expect("comparison");
    assert_eq!(comparison.len(), 2);
    assert_eq!(comparison[0]["name"].as_str(), Some("Year 9A"));
    assert_eq!(comparison[1]["name"].as_str(), Some("Year 9B"));

    // Narrowed to one course.
    let filtered = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "stats.overview",
        json!({ "actorId": admin_id, "courseId": math_id }),
    );
    assert_eq!(filtered["global"]["total"].as_i64(), Some(3));
    assert_eq!(filtered["global"]["absent"].as_i64(), Some(2));
    assert!(filtered["byCourse"].get("Art").is_none());

    // Narrowed to March only.
    let march = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "stats.overview",
        json!({ "actorId": admin_id, "from": "2024-03-01", "to": "2024-03-31" }),
    );
    assert_eq!(march["global"]["total"].as_i64(), Some(3));
    assert_eq!(march["global"]["absent"].as_i64(), Some(2));

    // Class filter narrows through the course's class.
    let class_b_only = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "stats.overview",
        json!({ "actorId": admin_id, "classId": class_b_id }),
    );
    assert_eq!(class_b_only["global"]["total"].as_i64(), Some(3));
    assert!(class_b_only["byClass"].get("Year 9A").is_none());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
