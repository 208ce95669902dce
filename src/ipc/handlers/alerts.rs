use crate::ipc::actor::{load_actor, require_role, Actor};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct AlertRow {
    id: String,
    category: String,
    threshold: i64,
    message: String,
    read: bool,
    created_at: String,
    course_id: String,
    course_name: String,
    student: Option<(String, String, String)>,
    teacher: Option<(String, String, String)>,
}

impl AlertRow {
    fn to_json(&self) -> serde_json::Value {
        let mut v = json!({
            "id": self.id,
            "category": self.category,
            "threshold": self.threshold,
            "message": self.message,
            "read": self.read,
            "createdAt": self.created_at,
            "course": { "id": self.course_id, "name": self.course_name },
        });
        if let Some((id, last, first)) = &self.student {
            v["student"] = json!({ "id": id, "lastName": last, "firstName": first });
        }
        if let Some((id, last, first)) = &self.teacher {
            v["teacher"] = json!({ "id": id, "lastName": last, "firstName": first });
        }
        v
    }
}

const ALERT_SELECT: &str = "SELECT a.id, a.category, a.threshold, a.message, a.read, a.created_at,
        c.id, c.name,
        s.id, s.last_name, s.first_name,
        t.id, t.last_name, t.first_name
 FROM alerts a
 JOIN courses c ON c.id = a.course_id
 LEFT JOIN users s ON s.id = a.student_id
 LEFT JOIN users t ON t.id = a.teacher_id";

fn alert_from_row(r: &rusqlite::Row) -> rusqlite::Result<AlertRow> {
    let student_id: Option<String> = r.get(8)?;
    let teacher_id: Option<String> = r.get(11)?;
    Ok(AlertRow {
        id: r.get(0)?,
        category: r.get(1)?,
        threshold: r.get(2)?,
        message: r.get(3)?,
        read: r.get::<_, i64>(4)? != 0,
        created_at: r.get(5)?,
        course_id: r.get(6)?,
        course_name: r.get(7)?,
        student: match student_id {
            Some(id) => Some((id, r.get(9)?, r.get(10)?)),
            None => None,
        },
        teacher: match teacher_id {
            Some(id) => Some((id, r.get(12)?, r.get(13)?)),
            None => None,
        },
    })
}

fn fetch_alert(conn: &Connection, alert_id: &str) -> rusqlite::Result<Option<AlertRow>> {
    let sql = format!("{} WHERE a.id = ?", ALERT_SELECT);
    conn.query_row(&sql, [alert_id], |r| alert_from_row(r)).optional()
}

fn insert_alert(
    conn: &Connection,
    course_id: &str,
    student_id: Option<&str>,
    teacher_id: Option<&str>,
    category: &str,
    threshold: i64,
    message: &str,
) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO alerts(id, course_id, student_id, teacher_id, category, threshold, message, read, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 0, ?)",
        (
            &id,
            course_id,
            student_id,
            teacher_id,
            category,
            threshold,
            message,
            Utc::now().to_rfc3339(),
        ),
    )?;
    Ok(id)
}

fn handle_alerts_create(conn: &Connection, actor: &Actor, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(actor, &["ADMIN"]) {
        return err(&req.id, e.code, e.message, None);
    }
    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "courseId and message are required", None),
    };
    let message = req
        .params
        .get("message")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    if message.is_empty() {
        return err(&req.id, "bad_params", "courseId and message are required", None);
    }
    let student_id = req.params.get("studentId").and_then(|v| v.as_str());
    let teacher_id = req.params.get("teacherId").and_then(|v| v.as_str());
    match (student_id, teacher_id) {
        (Some(_), Some(_)) => {
            return err(
                &req.id,
                "bad_params",
                "give either a student or a teacher, not both",
                None,
            )
        }
        (None, None) => {
            return err(
                &req.id,
                "bad_params",
                "give a student or a teacher to notify",
                None,
            )
        }
        _ => {}
    }
    let threshold = req
        .params
        .get("threshold")
        .and_then(|v| v.as_i64())
        .unwrap_or(1);
    let category = if student_id.is_some() { "notice" } else { "summons" };

    let alert_id = match insert_alert(
        conn, &course_id, student_id, teacher_id, category, threshold, &message,
    ) {
        Ok(id) => id,
        Err(e) => {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "alerts" })),
            )
        }
    };
    match fetch_alert(conn, &alert_id) {
        Ok(Some(alert)) => ok(&req.id, json!({ "alert": alert.to_json() })),
        Ok(None) => err(&req.id, "db_query_failed", "alert vanished after insert", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

// Admin convocation of a teacher; a summons alert delivered through the
// teacher's alert feed.
fn handle_alerts_summon(conn: &Connection, actor: &Actor, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(actor, &["ADMIN"]) {
        return err(&req.id, e.code, e.message, None);
    }
    let teacher_id = req.params.get("teacherId").and_then(|v| v.as_str());
    let course_id = req.params.get("courseId").and_then(|v| v.as_str());
    let message = req
        .params
        .get("message")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or("");
    let (Some(teacher_id), Some(course_id)) = (teacher_id, course_id) else {
        return err(
            &req.id,
            "bad_params",
            "teacherId, courseId and message are required",
            None,
        );
    };
    if message.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "teacherId, courseId and message are required",
            None,
        );
    }

    let alert_id = match insert_alert(conn, course_id, None, Some(teacher_id), "summons", 1, message)
    {
        Ok(id) => id,
        Err(e) => {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "alerts" })),
            )
        }
    };
    match fetch_alert(conn, &alert_id) {
        Ok(Some(alert)) => ok(&req.id, json!({ "alert": alert.to_json() })),
        Ok(None) => err(&req.id, "db_query_failed", "alert vanished after insert", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn list_alerts(conn: &Connection, req: &Request, where_clause: &str, param: Option<&str>) -> serde_json::Value {
    let sql = format!("{} {} ORDER BY a.created_at DESC", ALERT_SELECT, where_clause);
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match param {
        Some(p) => stmt
            .query_map([p], |r| alert_from_row(r))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], |r| alert_from_row(r))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    };
    match rows {
        Ok(alerts) => ok(
            &req.id,
            json!({ "alerts": alerts.iter().map(|a| a.to_json()).collect::<Vec<_>>() }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_alerts_mark_read(conn: &Connection, actor: &Actor, req: &Request) -> serde_json::Value {
    let alert_id = match req.params.get("alertId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing alertId", None),
    };
    let alert = match fetch_alert(conn, &alert_id) {
        Ok(Some(a)) => a,
        Ok(None) => return err(&req.id, "not_found", "alert not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let owns_it = match actor.role.as_str() {
        "ELEVE" => alert.student.as_ref().map(|(id, _, _)| id == &actor.id) == Some(true),
        "PROF" => alert.teacher.as_ref().map(|(id, _, _)| id == &actor.id) == Some(true),
        _ => true,
    };
    if !owns_it {
        return err(
            &req.id,
            "forbidden",
            "you may only update your own alerts",
            None,
        );
    }

    if let Err(e) = conn.execute("UPDATE alerts SET read = 1 WHERE id = ?", [&alert_id]) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "alerts" })),
        );
    }
    match fetch_alert(conn, &alert_id) {
        Ok(Some(a)) => ok(&req.id, json!({ "alert": a.to_json() })),
        Ok(None) => err(&req.id, "not_found", "alert not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn with_conn_and_actor(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &Actor, &Request) -> serde_json::Value,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match load_actor(conn, &req.params) {
        Ok(actor) => f(conn, &actor, req),
        Err(e) => err(&req.id, e.code, e.message, None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "alerts.create" => Some(with_conn_and_actor(state, req, handle_alerts_create)),
        "alerts.summon" => Some(with_conn_and_actor(state, req, handle_alerts_summon)),
        // Administrative review feed: the standing absence-threshold alerts.
        "alerts.list" => Some(with_conn_and_actor(state, req, |conn, _actor, req| {
            list_alerts(
                conn,
                req,
                "WHERE a.student_id IS NOT NULL AND a.category = 'absence_threshold'",
                None,
            )
        })),
        "alerts.listForStudent" => Some(with_conn_and_actor(state, req, |conn, actor, req| {
            if let Err(e) = require_role(actor, &["ELEVE"]) {
                return err(&req.id, e.code, e.message, None);
            }
            list_alerts(conn, req, "WHERE a.student_id = ?", Some(&actor.id))
        })),
        "alerts.listForTeacher" => Some(with_conn_and_actor(state, req, |conn, actor, req| {
            if let Err(e) = require_role(actor, &["PROF"]) {
                return err(&req.id, e.code, e.message, None);
            }
            list_alerts(conn, req, "WHERE a.teacher_id = ?", Some(&actor.id))
        })),
        "alerts.markRead" => Some(with_conn_and_actor(state, req, handle_alerts_mark_read)),
        _ => None,
    }
}
