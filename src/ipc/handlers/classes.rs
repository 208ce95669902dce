use crate::ipc::actor::{load_actor, require_role};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn class_students(conn: &Connection, class_id: &str) -> rusqlite::Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, last_name, first_name, email
         FROM users
         WHERE class_id = ? AND role = 'ELEVE'
         ORDER BY last_name, first_name",
    )?;
    stmt.query_map([class_id], |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "lastName": r.get::<_, String>(1)?,
            "firstName": r.get::<_, String>(2)?,
            "email": r.get::<_, String>(3)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
}

fn class_json(conn: &Connection, class_id: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let row = conn
        .query_row(
            "SELECT id, name, description FROM classes WHERE id = ?",
            [class_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((id, name, description)) = row else {
        return Ok(None);
    };
    let students = class_students(conn, &id)?;
    Ok(Some(json!({
        "id": id,
        "name": name,
        "description": description,
        "students": students,
    })))
}

fn gate(conn: &Connection, req: &Request, roles: &[&str]) -> Result<(), serde_json::Value> {
    let actor = load_actor(conn, &req.params).map_err(|e| err(&req.id, e.code, e.message, None))?;
    require_role(&actor, roles).map_err(|e| err(&req.id, e.code, e.message, None))
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = gate(conn, req, &["ADMIN"]) {
        return resp;
    }

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let description = req.params.get("description").and_then(|v| v.as_str());

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, description) VALUES(?, ?, ?)",
        (&class_id, &name, description),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(&req.id, json!({ "classId": class_id, "name": name }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };
    if let Err(resp) = gate(conn, req, &["ADMIN", "PROF", "ELEVE"]) {
        return resp;
    }

    let mut stmt = match conn.prepare("SELECT id FROM classes ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let ids = match ids {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut classes = Vec::with_capacity(ids.len());
    for id in ids {
        match class_json(conn, &id) {
            Ok(Some(c)) => classes.push(c),
            Ok(None) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, json!({ "classes": classes }))
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = gate(conn, req, &["ADMIN"]) {
        return resp;
    }
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let exists = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional();
    match exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    if let Some(name) = req.params.get("name").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE classes SET name = ? WHERE id = ?",
            (name.trim(), &class_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(description) = req.params.get("description").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE classes SET description = ? WHERE id = ?",
            (description, &class_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    match class_json(conn, &class_id) {
        Ok(Some(c)) => ok(&req.id, json!({ "class": c })),
        Ok(None) => err(&req.id, "not_found", "class not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = gate(conn, req, &["ADMIN"]) {
        return resp;
    }
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let exists = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional();
    match exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    // Detach members first; the class column on users does not cascade.
    if let Err(e) = tx.execute(
        "UPDATE users SET class_id = NULL WHERE class_id = ?",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM classes WHERE id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "message": "class deleted" }))
}

fn handle_classes_assign_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = gate(conn, req, &["ADMIN"]) {
        return resp;
    }
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => {
            return err(
                &req.id,
                "bad_params",
                "the student id (studentId) is required",
                None,
            )
        }
    };

    let class_exists = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional();
    match class_exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let role: Option<String> = match conn
        .query_row("SELECT role FROM users WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(role) = role else {
        return err(&req.id, "not_found", "student not found", None);
    };
    if role != "ELEVE" {
        return err(&req.id, "bad_params", "the user is not a student", None);
    }

    if let Err(e) = conn.execute(
        "UPDATE users SET class_id = ? WHERE id = ?",
        (&class_id, &student_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }
    match class_json(conn, &class_id) {
        Ok(Some(c)) => ok(&req.id, json!({ "class": c })),
        Ok(None) => err(&req.id, "not_found", "class not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        "classes.assignStudent" => Some(handle_classes_assign_student(state, req)),
        _ => None,
    }
}
