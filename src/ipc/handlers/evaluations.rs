use crate::ipc::actor::{load_actor, require_role, Actor};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const EVALUATION_SELECT: &str = "SELECT e.id, e.rating, e.remark, e.created_at,
        s.id, s.last_name, s.first_name,
        t.id, t.last_name, t.first_name,
        c.id, c.name
 FROM evaluations e
 JOIN users s ON s.id = e.student_id
 JOIN users t ON t.id = e.teacher_id
 JOIN courses c ON c.id = e.course_id";

fn evaluation_from_row(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "rating": r.get::<_, i64>(1)?,
        "remark": r.get::<_, String>(2)?,
        "createdAt": r.get::<_, String>(3)?,
        "student": {
            "id": r.get::<_, String>(4)?,
            "lastName": r.get::<_, String>(5)?,
            "firstName": r.get::<_, String>(6)?
        },
        "teacher": {
            "id": r.get::<_, String>(7)?,
            "lastName": r.get::<_, String>(8)?,
            "firstName": r.get::<_, String>(9)?
        },
        "course": { "id": r.get::<_, String>(10)?, "name": r.get::<_, String>(11)? }
    }))
}

fn handle_create(conn: &Connection, actor: &Actor, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(actor, &["ELEVE"]) {
        return err(&req.id, e.code, e.message, None);
    }
    let teacher_id = req.params.get("teacherId").and_then(|v| v.as_str()).unwrap_or("");
    let course_id = req.params.get("courseId").and_then(|v| v.as_str()).unwrap_or("");
    let rating = req.params.get("rating").and_then(|v| v.as_i64());
    let remark = req
        .params
        .get("remark")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or("");
    if teacher_id.is_empty() || course_id.is_empty() || rating.is_none() || remark.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "teacherId, courseId, rating and remark are required",
            None,
        );
    }
    let rating = rating.unwrap_or_default();
    if !(1..=5).contains(&rating) {
        return err(&req.id, "bad_params", "rating must be between 1 and 5", None);
    }

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO evaluations(id, student_id, teacher_id, course_id, rating, remark, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &actor.id,
            teacher_id,
            course_id,
            rating,
            remark,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "evaluations" })),
        );
    }
    let sql = format!("{} WHERE e.id = ?", EVALUATION_SELECT);
    match conn.query_row(&sql, [&id], |r| evaluation_from_row(r)).optional() {
        Ok(Some(e)) => ok(&req.id, json!({ "evaluation": e })),
        Ok(None) => err(&req.id, "db_query_failed", "evaluation vanished after insert", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_list(conn: &Connection, actor: &Actor, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(actor, &["ADMIN"]) {
        return err(&req.id, e.code, e.message, None);
    }
    let sql = format!("{} ORDER BY e.created_at DESC", EVALUATION_SELECT);
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| evaluation_from_row(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(evaluations) => ok(&req.id, json!({ "evaluations": evaluations })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

// Administrative follow-up on an evaluation, delivered to the evaluated
// teacher through their alert feed.
fn handle_report(conn: &Connection, actor: &Actor, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(actor, &["ADMIN"]) {
        return err(&req.id, e.code, e.message, None);
    }
    let evaluation_id = match req.params.get("evaluationId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing evaluationId", None),
    };
    let message = req
        .params
        .get("message")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or("");
    if message.is_empty() {
        return err(&req.id, "bad_params", "the report message is required", None);
    }

    let row = conn
        .query_row(
            "SELECT e.teacher_id, e.course_id, e.rating, t.last_name, t.first_name, c.name
             FROM evaluations e
             JOIN users t ON t.id = e.teacher_id
             JOIN courses c ON c.id = e.course_id
             WHERE e.id = ?",
            [&evaluation_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                ))
            },
        )
        .optional();
    let (teacher_id, course_id, rating, teacher_last, teacher_first, course_name) = match row {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "evaluation not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let text = format!(
        "Administration report for {} {} (course {}) following a student review (rating {}/5): {}",
        teacher_first, teacher_last, course_name, rating, message
    );
    let alert_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO alerts(id, course_id, student_id, teacher_id, category, threshold, message, read, created_at)
         VALUES(?, ?, NULL, ?, 'review_notice', 1, ?, 0, ?)",
        (
            &alert_id,
            &course_id,
            &teacher_id,
            &text,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "alerts" })),
        );
    }
    ok(
        &req.id,
        json!({ "alertId": alert_id, "teacherId": teacher_id, "message": text }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let is_ours = matches!(
        req.method.as_str(),
        "evaluations.create" | "evaluations.list" | "evaluations.report"
    );
    if !is_ours {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let actor = match load_actor(conn, &req.params) {
        Ok(a) => a,
        Err(e) => return Some(err(&req.id, e.code, e.message, None)),
    };
    match req.method.as_str() {
        "evaluations.create" => Some(handle_create(conn, &actor, req)),
        "evaluations.list" => Some(handle_list(conn, &actor, req)),
        "evaluations.report" => Some(handle_report(conn, &actor, req)),
        _ => None,
    }
}
