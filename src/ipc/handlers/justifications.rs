use crate::ipc::actor::{load_actor, require_role, Actor};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const JUSTIFICATION_SELECT: &str = "SELECT j.id, j.reason, j.status, j.admin_comment, j.created_at,
        s.id, s.last_name, s.first_name,
        r.id, r.day, r.status,
        c.id, c.name
 FROM justifications j
 JOIN users s ON s.id = j.student_id
 JOIN attendance_records r ON r.id = j.record_id
 JOIN courses c ON c.id = r.course_id";

fn justification_from_row(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "reason": r.get::<_, String>(1)?,
        "status": r.get::<_, String>(2)?,
        "adminComment": r.get::<_, String>(3)?,
        "createdAt": r.get::<_, String>(4)?,
        "student": {
            "id": r.get::<_, String>(5)?,
            "lastName": r.get::<_, String>(6)?,
            "firstName": r.get::<_, String>(7)?
        },
        "record": {
            "id": r.get::<_, String>(8)?,
            "day": r.get::<_, String>(9)?,
            "status": r.get::<_, String>(10)?,
            "course": { "id": r.get::<_, String>(11)?, "name": r.get::<_, String>(12)? }
        }
    }))
}

fn fetch_justification(
    conn: &Connection,
    id: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let sql = format!("{} WHERE j.id = ?", JUSTIFICATION_SELECT);
    conn.query_row(&sql, [id], |r| justification_from_row(r))
        .optional()
}

// The student files a justification for one of their attendance records;
// review and the resulting `justified` flip stay with the administration.
fn handle_create(conn: &Connection, actor: &Actor, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(actor, &["ELEVE"]) {
        return err(&req.id, e.code, e.message, None);
    }
    let record_id = req.params.get("recordId").and_then(|v| v.as_str());
    let reason = req
        .params
        .get("reason")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or("");
    let Some(record_id) = record_id else {
        return err(
            &req.id,
            "bad_params",
            "the attendance record and the reason are required",
            None,
        );
    };
    if reason.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "the attendance record and the reason are required",
            None,
        );
    }

    let record_exists = conn
        .query_row(
            "SELECT 1 FROM attendance_records WHERE id = ?",
            [record_id],
            |r| r.get::<_, i64>(0),
        )
        .optional();
    match record_exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "attendance record not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO justifications(id, student_id, record_id, reason, status, admin_comment, created_at)
         VALUES(?, ?, ?, ?, 'pending', '', ?)",
        (&id, &actor.id, record_id, reason, Utc::now().to_rfc3339()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "justifications" })),
        );
    }
    match fetch_justification(conn, &id) {
        Ok(Some(j)) => ok(&req.id, json!({ "justification": j })),
        Ok(None) => err(&req.id, "db_query_failed", "justification vanished after insert", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn list_justifications(
    conn: &Connection,
    req: &Request,
    where_clause: &str,
    param: Option<&str>,
) -> serde_json::Value {
    let sql = format!(
        "{} {} ORDER BY j.created_at DESC",
        JUSTIFICATION_SELECT, where_clause
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match param {
        Some(p) => stmt
            .query_map([p], |r| justification_from_row(r))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], |r| justification_from_row(r))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    };
    match rows {
        Ok(justifications) => ok(&req.id, json!({ "justifications": justifications })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

// Review path. Accepting marks the underlying record justified, which is
// the flag the absence-threshold tally honors; both outcomes notify the
// student.
fn handle_set_status(conn: &Connection, actor: &Actor, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(actor, &["PROF", "ADMIN"]) {
        return err(&req.id, e.code, e.message, None);
    }
    let justification_id = match req.params.get("justificationId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing justificationId", None),
    };
    let status = req.params.get("status").and_then(|v| v.as_str()).unwrap_or("");
    if !["pending", "accepted", "refused"].contains(&status) {
        return err(
            &req.id,
            "bad_params",
            "invalid status (accepted or refused)",
            None,
        );
    }
    let admin_comment = req
        .params
        .get("adminComment")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());

    let row = conn
        .query_row(
            "SELECT student_id, record_id FROM justifications WHERE id = ?",
            [&justification_id],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
        )
        .optional();
    let (student_id, record_id) = match row {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "justification not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let update = match &admin_comment {
        Some(comment) => conn.execute(
            "UPDATE justifications SET status = ?, admin_comment = ? WHERE id = ?",
            (status, comment, &justification_id),
        ),
        None => conn.execute(
            "UPDATE justifications SET status = ? WHERE id = ?",
            (status, &justification_id),
        ),
    };
    if let Err(e) = update {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "justifications" })),
        );
    }

    if status == "accepted" {
        if let Err(e) = conn.execute(
            "UPDATE attendance_records SET justified = 1 WHERE id = ?",
            [&record_id],
        ) {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "attendance_records" })),
            );
        }
    }

    let mut message = if status == "accepted" {
        "Justification approved".to_string()
    } else {
        "Justification refused".to_string()
    };
    if let Some(comment) = admin_comment.as_deref().filter(|c| !c.is_empty()) {
        message = format!("{}: {}", message, comment);
    }
    if let Err(e) = conn.execute(
        "INSERT INTO notifications(id, student_id, justification_id, message, read, created_at)
         VALUES(?, ?, ?, ?, 0, ?)",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            &justification_id,
            &message,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "notifications" })),
        );
    }

    match fetch_justification(conn, &justification_id) {
        Ok(Some(j)) => ok(&req.id, json!({ "justification": j })),
        Ok(None) => err(&req.id, "not_found", "justification not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_set_comment(conn: &Connection, actor: &Actor, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(actor, &["ADMIN"]) {
        return err(&req.id, e.code, e.message, None);
    }
    let justification_id = match req.params.get("justificationId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing justificationId", None),
    };
    let admin_comment = req
        .params
        .get("adminComment")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or("");

    let changed = match conn.execute(
        "UPDATE justifications SET admin_comment = ? WHERE id = ?",
        (admin_comment, &justification_id),
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "justifications" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "justification not found", None);
    }
    match fetch_justification(conn, &justification_id) {
        Ok(Some(j)) => ok(&req.id, json!({ "justification": j })),
        Ok(None) => err(&req.id, "not_found", "justification not found", None),
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
        "justifications.create" => Some(with_conn_and_actor(state, req, handle_create)),
        "justifications.list" => Some(with_conn_and_actor(state, req, |conn, actor, req| {
            if let Err(e) = require_role(actor, &["PROF", "ADMIN"]) {
                return err(&req.id, e.code, e.message, None);
            }
            list_justifications(conn, req, "", None)
        })),
        "justifications.listForStudent" => {
            Some(with_conn_and_actor(state, req, |conn, actor, req| {
                if let Err(e) = require_role(actor, &["ELEVE"]) {
                    return err(&req.id, e.code, e.message, None);
                }
                list_justifications(conn, req, "WHERE j.student_id = ?", Some(&actor.id))
            }))
        }
        "justifications.setStatus" => Some(with_conn_and_actor(state, req, handle_set_status)),
        "justifications.setComment" => Some(with_conn_and_actor(state, req, handle_set_comment)),
        _ => None,
    }
}
