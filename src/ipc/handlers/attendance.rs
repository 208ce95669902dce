use crate::db;
use crate::ipc::actor::{load_actor, require_role, Actor, ActorErr};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

const STATUSES: [&str; 3] = ["present", "absent", "late"];
const THRESHOLD_SETTING: &str = "absence_alert_threshold";
const DEFAULT_THRESHOLD: i64 = 3;

#[derive(Debug)]
struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<ActorErr> for HandlerErr {
    fn from(e: ActorErr) -> Self {
        HandlerErr {
            code: e.code,
            message: e.message,
            details: None,
        }
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn db_query_failed(e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    }
}

/// Accepts a plain date or a full timestamp and keeps the calendar day only.
/// The day is the identity component; time of day never matters again after
/// this point.
fn parse_day(raw: &str) -> Result<String, HandlerErr> {
    let t = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Ok(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Ok(dt.date_naive().format("%Y-%m-%d").to_string());
    }
    Err(HandlerErr {
        code: "bad_params",
        message: "day must be YYYY-MM-DD or an RFC 3339 timestamp".to_string(),
        details: None,
    })
}

fn today() -> String {
    Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone)]
struct RecordRow {
    id: String,
    day: String,
    status: String,
    justified: bool,
    locked: bool,
    recorded_at: String,
    student_id: String,
    student_last: String,
    student_first: String,
    course_id: String,
    course_name: String,
    teacher_id: String,
    teacher_last: String,
    teacher_first: String,
}

impl RecordRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "day": self.day,
            "status": self.status,
            "justified": self.justified,
            "locked": self.locked,
            "recordedAt": self.recorded_at,
            "student": {
                "id": self.student_id,
                "lastName": self.student_last,
                "firstName": self.student_first
            },
            "course": {
                "id": self.course_id,
                "name": self.course_name,
                "teacher": {
                    "id": self.teacher_id,
                    "lastName": self.teacher_last,
                    "firstName": self.teacher_first
                }
            }
        })
    }
}

const RECORD_SELECT: &str = "SELECT r.id, r.day, r.status, r.justified, r.locked, r.recorded_at,
        s.id, s.last_name, s.first_name,
        c.id, c.name, t.id, t.last_name, t.first_name
 FROM attendance_records r
 JOIN users s ON s.id = r.student_id
 JOIN courses c ON c.id = r.course_id
 JOIN users t ON t.id = c.teacher_id";

fn record_from_row(r: &rusqlite::Row) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        id: r.get(0)?,
        day: r.get(1)?,
        status: r.get(2)?,
        justified: r.get::<_, i64>(3)? != 0,
        locked: r.get::<_, i64>(4)? != 0,
        recorded_at: r.get(5)?,
        student_id: r.get(6)?,
        student_last: r.get(7)?,
        student_first: r.get(8)?,
        course_id: r.get(9)?,
        course_name: r.get(10)?,
        teacher_id: r.get(11)?,
        teacher_last: r.get(12)?,
        teacher_first: r.get(13)?,
    })
}

fn fetch_record(conn: &Connection, record_id: &str) -> Result<Option<RecordRow>, HandlerErr> {
    let sql = format!("{} WHERE r.id = ?", RECORD_SELECT);
    conn.query_row(&sql, [record_id], |r| record_from_row(r))
        .optional()
        .map_err(db_query_failed)
}

/// Newest row for a (student, course, day) key; the canonical record when
/// historical duplicates exist.
fn fetch_canonical(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
    day: &str,
) -> Result<Option<RecordRow>, HandlerErr> {
    let sql = format!(
        "{} WHERE r.student_id = ? AND r.course_id = ? AND r.day = ?
         ORDER BY r.rowid DESC LIMIT 1",
        RECORD_SELECT
    );
    conn.query_row(&sql, (student_id, course_id, day), |r| record_from_row(r))
        .optional()
        .map_err(db_query_failed)
}

fn course_teacher(conn: &Connection, course_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT teacher_id FROM courses WHERE id = ?",
        [course_id],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(db_query_failed)
}

fn user_exists(conn: &Connection, user_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM users WHERE id = ?", [user_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(db_query_failed)
}

fn day_is_locked(conn: &Connection, course_id: &str, day: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM attendance_records
            WHERE course_id = ? AND day = ? AND locked = 1
         )",
        (course_id, day),
        |r| r.get::<_, i64>(0),
    )
    .map(|v| v != 0)
    .map_err(db_query_failed)
}

fn locked_period_err() -> HandlerErr {
    HandlerErr {
        code: "locked_period",
        message: "attendance for this course and day has been validated by the administration, no further changes are possible".to_string(),
        details: None,
    }
}

fn configured_threshold(conn: &Connection) -> Result<i64, HandlerErr> {
    let value = db::settings_get_json(conn, THRESHOLD_SETTING).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(value
        .and_then(|v| v.as_i64())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_THRESHOLD))
}

/// Absence-threshold rule. The tally is global per student, not scoped to
/// the course that triggered re-evaluation: the alert is about the
/// student's overall attendance. One standing alert per student; the
/// category column is the dedup key, so re-evaluating an unchanged
/// condition never stacks a duplicate.
fn evaluate_absence_alert(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
) -> Result<(), HandlerErr> {
    let threshold = configured_threshold(conn)?;
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM attendance_records
             WHERE student_id = ? AND status = 'absent' AND justified = 0",
            [student_id],
            |r| r.get(0),
        )
        .map_err(db_query_failed)?;
    if count < threshold {
        return Ok(());
    }
    let existing = conn
        .query_row(
            "SELECT 1 FROM alerts WHERE student_id = ? AND category = 'absence_threshold'",
            [student_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(db_query_failed)?;
    if existing.is_some() {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO alerts(id, course_id, student_id, teacher_id, category, threshold, message, read, created_at)
         VALUES(?, ?, ?, NULL, 'absence_threshold', ?, ?, 0, ?)",
        (
            Uuid::new_v4().to_string(),
            course_id,
            student_id,
            threshold,
            format!("You have {} unjustified absences.", threshold),
            now_ts(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "alerts" })),
    })?;
    Ok(())
}

struct RollCallEntry {
    student_id: String,
    status: String,
}

fn parse_entries(params: &serde_json::Value) -> Result<Vec<RollCallEntry>, HandlerErr> {
    let Some(raw) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "courseId, day and entries (array) are required".to_string(),
            details: None,
        });
    };
    if raw.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "entries must not be empty".to_string(),
            details: None,
        });
    }
    let mut out = Vec::with_capacity(raw.len());
    for e in raw {
        let Some(student_id) = e.get("studentId").and_then(|v| v.as_str()) else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "every entry needs a studentId".to_string(),
                details: None,
            });
        };
        // A missing status means absent.
        let status = e
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("absent")
            .to_string();
        if !STATUSES.contains(&status.as_str()) {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("unknown status: {}", status),
                details: Some(json!({ "studentId": student_id })),
            });
        }
        out.push(RollCallEntry {
            student_id: student_id.to_string(),
            status,
        });
    }
    Ok(out)
}

/// Roll-call batch. Entries are validated before anything is written, the
/// locked-day gate and all per-entry upserts run inside one transaction,
/// and the absence-threshold rule runs only after the writes committed.
fn submit_roll_call(
    conn: &Connection,
    actor: &Actor,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_role(actor, &["PROF"])?;
    let course_id = get_required_str(params, "courseId").map_err(|mut e| {
        e.message = "courseId, day and entries (array) are required".to_string();
        e
    })?;
    let day_raw = get_required_str(params, "day").map_err(|mut e| {
        e.message = "courseId, day and entries (array) are required".to_string();
        e
    })?;
    let entries = parse_entries(params)?;
    let day = parse_day(&day_raw)?;

    let Some(teacher_id) = course_teacher(conn, &course_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "course not found".to_string(),
            details: None,
        });
    };
    if teacher_id != actor.id {
        return Err(HandlerErr {
            code: "forbidden",
            message: "you are not allowed to take the roll call for this course".to_string(),
            details: None,
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    // Re-checked inside the writing transaction, never carried over from an
    // earlier request.
    if day_is_locked(&tx, &course_id, &day)? {
        return Err(locked_period_err());
    }

    let mut absent: Vec<String> = Vec::new();
    for entry in &entries {
        let changed = tx
            .execute(
                "UPDATE attendance_records SET status = ?
                 WHERE student_id = ? AND course_id = ? AND day = ?",
                (&entry.status, &entry.student_id, &course_id, &day),
            )
            .map_err(|e| HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "attendance_records" })),
            })?;
        if changed == 0 {
            tx.execute(
                "INSERT INTO attendance_records(id, student_id, course_id, day, status, justified, locked, recorded_at)
                 VALUES(?, ?, ?, ?, ?, 0, 0, ?)",
                (
                    Uuid::new_v4().to_string(),
                    &entry.student_id,
                    &course_id,
                    &day,
                    &entry.status,
                    now_ts(),
                ),
            )
            .map_err(|e| HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "attendance_records" })),
            })?;
        }
        if entry.status == "absent" && !absent.contains(&entry.student_id) {
            absent.push(entry.student_id.clone());
        }
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    let mut records = Vec::with_capacity(entries.len());
    for entry in &entries {
        if let Some(row) = fetch_canonical(conn, &entry.student_id, &course_id, &day)? {
            records.push(row.to_json());
        }
    }

    // The writes above are committed; a failing alert check must not mask
    // them. Report the students whose evaluation failed so it can be
    // retried.
    let mut alert_check_failed: Vec<String> = Vec::new();
    for student_id in &absent {
        if evaluate_absence_alert(conn, student_id, &course_id).is_err() {
            alert_check_failed.push(student_id.clone());
        }
    }

    let mut result = json!({
        "message": format!("{} attendance record(s) saved for this course and day.", records.len()),
        "records": records,
    });
    if !alert_check_failed.is_empty() {
        result["alertCheckFailed"] = json!(alert_check_failed);
    }
    Ok(result)
}

/// Direct single-record insert. No upsert discipline and no lock gate:
/// this is the legacy entry point whose duplicates the list projections
/// collapse.
fn create_record(
    conn: &Connection,
    actor: &Actor,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_role(actor, &["ADMIN", "PROF"])?;
    let student_id = get_required_str(params, "studentId")?;
    let course_id = get_required_str(params, "courseId")?;
    let status = params
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("absent")
        .to_string();
    if !STATUSES.contains(&status.as_str()) {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("unknown status: {}", status),
            details: None,
        });
    }
    let day = match params.get("day").and_then(|v| v.as_str()) {
        Some(raw) => parse_day(raw)?,
        None => today(),
    };
    if course_teacher(conn, &course_id)?.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "course not found".to_string(),
            details: None,
        });
    }
    if !user_exists(conn, &student_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let record_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attendance_records(id, student_id, course_id, day, status, justified, locked, recorded_at)
         VALUES(?, ?, ?, ?, ?, 0, 0, ?)",
        (&record_id, &student_id, &course_id, &day, &status, now_ts()),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance_records" })),
    })?;

    let record = fetch_record(conn, &record_id)?.ok_or_else(|| HandlerErr {
        code: "db_query_failed",
        message: "record vanished after insert".to_string(),
        details: None,
    })?;

    let mut result = json!({ "record": record.to_json() });
    if status == "absent" && evaluate_absence_alert(conn, &student_id, &course_id).is_err() {
        result["alertCheckFailed"] = json!([student_id]);
    }
    Ok(result)
}

/// Per-record status edit. The lock gate is pair-level: once any record of
/// the (course, day) pair is locked, the whole day is frozen, including
/// rows inserted through the raw path after validation.
fn edit_record(
    conn: &Connection,
    actor: &Actor,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let record_id = get_required_str(params, "recordId")?;
    let status = params.get("status").and_then(|v| v.as_str()).unwrap_or("");
    if !STATUSES.contains(&status) {
        return Err(HandlerErr {
            code: "bad_params",
            message: "status required: present, absent or late".to_string(),
            details: None,
        });
    }

    let Some(record) = fetch_record(conn, &record_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "attendance record not found".to_string(),
            details: None,
        });
    };
    if record.locked || day_is_locked(conn, &record.course_id, &record.day)? {
        return Err(locked_period_err());
    }
    if !actor.is_admin() && actor.id != record.teacher_id {
        return Err(HandlerErr {
            code: "forbidden",
            message: "you may only edit attendance for your own courses".to_string(),
            details: None,
        });
    }

    conn.execute(
        "UPDATE attendance_records SET status = ? WHERE id = ?",
        (status, &record_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance_records" })),
    })?;

    let updated = fetch_record(conn, &record_id)?.ok_or_else(|| HandlerErr {
        code: "db_query_failed",
        message: "record vanished after update".to_string(),
        details: None,
    })?;

    let mut result = json!({ "record": updated.to_json() });
    if status == "absent"
        && evaluate_absence_alert(conn, &record.student_id, &record.course_id).is_err()
    {
        result["alertCheckFailed"] = json!([record.student_id]);
    }
    Ok(result)
}

/// Administrative validation: freezes every record of the (course, day)
/// pair. One-way, idempotent; re-locking reports the matched count again.
fn lock_day(
    conn: &Connection,
    actor: &Actor,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    if !actor.is_admin() {
        return Err(HandlerErr {
            code: "forbidden",
            message: "reserved to the administration".to_string(),
            details: None,
        });
    }
    let course_id = get_required_str(params, "courseId").map_err(|mut e| {
        e.message = "courseId and day are required".to_string();
        e
    })?;
    let day_raw = get_required_str(params, "day").map_err(|mut e| {
        e.message = "courseId and day are required".to_string();
        e
    })?;
    let day = parse_day(&day_raw)?;

    let modified = conn
        .execute(
            "UPDATE attendance_records SET locked = 1 WHERE course_id = ? AND day = ?",
            (&course_id, &day),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance_records" })),
        })?;

    Ok(json!({
        "message": "attendance validated for this day, no further changes are possible",
        "modifiedCount": modified,
    }))
}

/// List projection: newest-first scan folded to one canonical row per
/// (student, course, day), tolerating duplicates left by the raw path.
fn list_records(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_filter = params.get("courseId").and_then(|v| v.as_str());
    let sql = match course_filter {
        Some(_) => format!(
            "{} WHERE r.course_id = ? ORDER BY r.day DESC, r.rowid DESC",
            RECORD_SELECT
        ),
        None => format!("{} ORDER BY r.day DESC, r.rowid DESC", RECORD_SELECT),
    };
    let mut stmt = conn.prepare(&sql).map_err(db_query_failed)?;
    let rows = match course_filter {
        Some(course_id) => stmt
            .query_map([course_id], |r| record_from_row(r))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], |r| record_from_row(r))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(db_query_failed)?;

    let mut seen: HashSet<(String, String, String)> = HashSet::new();
    let mut canonical: Vec<RecordRow> = Vec::new();
    for row in rows {
        let key = (row.student_id.clone(), row.course_id.clone(), row.day.clone());
        if seen.insert(key) {
            canonical.push(row);
        }
    }
    canonical.sort_by(|a, b| {
        b.day
            .cmp(&a.day)
            .then_with(|| a.student_last.to_lowercase().cmp(&b.student_last.to_lowercase()))
    });

    let records: Vec<serde_json::Value> = canonical.iter().map(|r| r.to_json()).collect();
    Ok(json!({ "records": records }))
}

/// Per-student variant: one row per (course, day), newest day first.
fn list_records_for_student(
    conn: &Connection,
    actor: &Actor,
) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!(
        "{} WHERE r.student_id = ? ORDER BY r.day DESC, r.rowid DESC",
        RECORD_SELECT
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query_failed)?;
    let rows = stmt
        .query_map([&actor.id], |r| record_from_row(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_failed)?;

    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut records: Vec<serde_json::Value> = Vec::new();
    for row in rows {
        let key = (row.course_id.clone(), row.day.clone());
        if seen.insert(key) {
            records.push(json!({
                "id": row.id,
                "day": row.day,
                "status": row.status,
                "justified": row.justified,
                "locked": row.locked,
                "recordedAt": row.recorded_at,
                "course": { "id": row.course_id, "name": row.course_name }
            }));
        }
    }
    Ok(json!({ "records": records }))
}

fn with_conn_and_actor(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &Actor, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match load_actor(conn, &req.params) {
        Ok(a) => a,
        Err(e) => return HandlerErr::from(e).response(&req.id),
    };
    match f(conn, &actor, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.submitRollCall" => Some(with_conn_and_actor(state, req, submit_roll_call)),
        "attendance.create" => Some(with_conn_and_actor(state, req, create_record)),
        "attendance.edit" => Some(with_conn_and_actor(state, req, edit_record)),
        "attendance.lockDay" => Some(with_conn_and_actor(state, req, lock_day)),
        "attendance.list" => Some(with_conn_and_actor(state, req, |conn, _actor, params| {
            list_records(conn, params)
        })),
        "attendance.listForStudent" => Some(with_conn_and_actor(state, req, |conn, actor, _params| {
            list_records_for_student(conn, actor)
        })),
        _ => None,
    }
}
