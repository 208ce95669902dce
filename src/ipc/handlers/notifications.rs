use crate::ipc::actor::{load_actor, require_role, Actor};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const NOTIFICATION_SELECT: &str = "SELECT n.id, n.student_id, n.message, n.read, n.created_at,
        j.id, j.reason, j.status
 FROM notifications n
 JOIN justifications j ON j.id = n.justification_id";

fn notification_from_row(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "message": r.get::<_, String>(2)?,
        "read": r.get::<_, i64>(3)? != 0,
        "createdAt": r.get::<_, String>(4)?,
        "justification": {
            "id": r.get::<_, String>(5)?,
            "reason": r.get::<_, String>(6)?,
            "status": r.get::<_, String>(7)?
        }
    }))
}

fn handle_list_for_student(conn: &Connection, actor: &Actor, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(actor, &["ELEVE"]) {
        return err(&req.id, e.code, e.message, None);
    }
    let sql = format!(
        "{} WHERE n.student_id = ? ORDER BY n.created_at DESC",
        NOTIFICATION_SELECT
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&actor.id], |r| notification_from_row(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(notifications) => ok(&req.id, json!({ "notifications": notifications })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_mark_read(conn: &Connection, actor: &Actor, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(actor, &["ELEVE"]) {
        return err(&req.id, e.code, e.message, None);
    }
    let notification_id = match req.params.get("notificationId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing notificationId", None),
    };
    let owner: Option<String> = match conn
        .query_row(
            "SELECT student_id FROM notifications WHERE id = ?",
            [&notification_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(owner) = owner else {
        return err(&req.id, "not_found", "notification not found", None);
    };
    if owner != actor.id {
        return err(
            &req.id,
            "forbidden",
            "you may only update your own notifications",
            None,
        );
    }

    if let Err(e) = conn.execute(
        "UPDATE notifications SET read = 1 WHERE id = ?",
        [&notification_id],
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "notifications" })),
        );
    }
    let sql = format!("{} WHERE n.id = ?", NOTIFICATION_SELECT);
    match conn
        .query_row(&sql, [&notification_id], |r| notification_from_row(r))
        .optional()
    {
        Ok(Some(n)) => ok(&req.id, json!({ "notification": n })),
        Ok(None) => err(&req.id, "not_found", "notification not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let is_ours = matches!(
        req.method.as_str(),
        "notifications.listForStudent" | "notifications.markRead"
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
        "notifications.listForStudent" => Some(handle_list_for_student(conn, &actor, req)),
        "notifications.markRead" => Some(handle_mark_read(conn, &actor, req)),
        _ => None,
    }
}
