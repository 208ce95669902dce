use crate::ipc::actor::{load_actor, require_role};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const ROLES: [&str; 3] = ["ADMIN", "PROF", "ELEVE"];

// Same shape the original accepted: something@something.tld, no spaces.
fn email_is_valid(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = email.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    domain.split('.').count() >= 2 && !domain.starts_with('.') && !domain.ends_with('.')
}

fn email_taken(conn: &Connection, email: &str, exclude_id: Option<&str>) -> rusqlite::Result<bool> {
    let existing: Option<String> = match exclude_id {
        Some(id) => conn
            .query_row(
                "SELECT id FROM users WHERE email = ? AND id <> ?",
                (email, id),
                |r| r.get(0),
            )
            .optional()?,
        None => conn
            .query_row("SELECT id FROM users WHERE email = ?", [email], |r| {
                r.get(0)
            })
            .optional()?,
    };
    Ok(existing.is_some())
}

fn user_json(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    conn.query_row(
        "SELECT u.id, u.last_name, u.first_name, u.email, u.role, u.active, u.created_at,
                cl.id, cl.name
         FROM users u
         LEFT JOIN classes cl ON cl.id = u.class_id
         WHERE u.id = ?",
        [user_id],
        |r| {
            let class_id: Option<String> = r.get(7)?;
            let mut v = json!({
                "id": r.get::<_, String>(0)?,
                "lastName": r.get::<_, String>(1)?,
                "firstName": r.get::<_, String>(2)?,
                "email": r.get::<_, String>(3)?,
                "role": r.get::<_, String>(4)?,
                "active": r.get::<_, i64>(5)? != 0,
                "createdAt": r.get::<_, String>(6)?,
            });
            if let Some(id) = class_id {
                v["class"] = json!({ "id": id, "name": r.get::<_, String>(8)? });
            }
            Ok(v)
        },
    )
    .optional()
}

// Open enrollment endpoint; the transport gateway decides whether it is
// exposed. Unlike users.create it accepts any role, which is how the
// first administrator account comes to exist.
fn handle_users_register(conn: &Connection, req: &Request) -> serde_json::Value {
    let last_name = req.params.get("lastName").and_then(|v| v.as_str()).unwrap_or("").trim();
    let first_name = req.params.get("firstName").and_then(|v| v.as_str()).unwrap_or("").trim();
    let email = req.params.get("email").and_then(|v| v.as_str()).unwrap_or("").trim();
    if last_name.is_empty() || first_name.is_empty() || email.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "lastName, firstName and email are required",
            None,
        );
    }
    if !email_is_valid(email) {
        return err(&req.id, "bad_params", "invalid email format", None);
    }
    let role = req
        .params
        .get("role")
        .and_then(|v| v.as_str())
        .unwrap_or("ELEVE");
    if !ROLES.contains(&role) {
        return err(&req.id, "bad_params", "role must be ADMIN, PROF or ELEVE", None);
    }
    let class_id = req.params.get("classId").and_then(|v| v.as_str());

    match email_taken(conn, email, None) {
        Ok(true) => return err(&req.id, "bad_params", "this email is already in use", None),
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let user_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, last_name, first_name, email, role, class_id, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &user_id,
            last_name,
            first_name,
            email,
            role,
            class_id,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }
    match user_json(conn, &user_id) {
        Ok(Some(u)) => ok(&req.id, json!({ "user": u })),
        Ok(None) => err(&req.id, "db_query_failed", "user vanished after insert", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_create(conn: &Connection, req: &Request) -> serde_json::Value {
    let last_name = req.params.get("lastName").and_then(|v| v.as_str()).unwrap_or("").trim();
    let first_name = req.params.get("firstName").and_then(|v| v.as_str()).unwrap_or("").trim();
    let email = req.params.get("email").and_then(|v| v.as_str()).unwrap_or("").trim();
    if last_name.is_empty() || first_name.is_empty() || email.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "lastName, firstName and email are required",
            None,
        );
    }
    if !email_is_valid(email) {
        return err(&req.id, "bad_params", "invalid email format", None);
    }
    let role = req
        .params
        .get("role")
        .and_then(|v| v.as_str())
        .unwrap_or("ELEVE");
    if !["PROF", "ELEVE"].contains(&role) {
        return err(&req.id, "bad_params", "role must be PROF or ELEVE", None);
    }
    let class_id = req.params.get("classId").and_then(|v| v.as_str());

    match email_taken(conn, email, None) {
        Ok(true) => return err(&req.id, "bad_params", "this email is already in use", None),
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let user_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, last_name, first_name, email, role, class_id, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &user_id,
            last_name,
            first_name,
            email,
            role,
            class_id,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }
    match user_json(conn, &user_id) {
        Ok(Some(u)) => ok(&req.id, json!({ "user": u })),
        Ok(None) => err(&req.id, "db_query_failed", "user vanished after insert", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_list(conn: &Connection, req: &Request) -> serde_json::Value {
    let search = req
        .params
        .get("search")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let base = "SELECT u.id FROM users u";
    let (sql, pattern) = match search {
        Some(term) => {
            // Escape LIKE wildcards so a search term is always literal;
            // LIKE itself is case-insensitive.
            let escaped = term.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
            (
                format!(
                    "{} WHERE u.last_name LIKE ?1 ESCAPE '\\'
                        OR u.first_name LIKE ?1 ESCAPE '\\'
                        OR u.email LIKE ?1 ESCAPE '\\'
                     ORDER BY u.last_name, u.first_name",
                    base
                ),
                Some(format!("%{}%", escaped)),
            )
        }
        None => (format!("{} ORDER BY u.last_name, u.first_name", base), None),
    };

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let ids = match &pattern {
        Some(p) => stmt
            .query_map([p], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    };
    let ids = match ids {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut users = Vec::with_capacity(ids.len());
    for id in ids {
        match user_json(conn, &id) {
            Ok(Some(u)) => users.push(u),
            Ok(None) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, json!({ "users": users }))
}

fn handle_users_update(conn: &Connection, req: &Request) -> serde_json::Value {
    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };
    let exists = conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&user_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional();
    match exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "user not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    if let Some(email) = req.params.get("email").and_then(|v| v.as_str()) {
        let email = email.trim();
        if !email_is_valid(email) {
            return err(&req.id, "bad_params", "invalid email format", None);
        }
        match email_taken(conn, email, Some(&user_id)) {
            Ok(true) => return err(&req.id, "bad_params", "this email is already in use", None),
            Ok(false) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
        if let Err(e) = conn.execute(
            "UPDATE users SET email = ? WHERE id = ?",
            (email, &user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(last_name) = req.params.get("lastName").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE users SET last_name = ? WHERE id = ?",
            (last_name, &user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(first_name) = req.params.get("firstName").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE users SET first_name = ? WHERE id = ?",
            (first_name, &user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    // An unknown role value is ignored rather than rejected, as before.
    if let Some(role) = req.params.get("role").and_then(|v| v.as_str()) {
        if ROLES.contains(&role) {
            if let Err(e) = conn.execute(
                "UPDATE users SET role = ? WHERE id = ?",
                (role, &user_id),
            ) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        }
    }
    if let Some(class_value) = req.params.get("classId") {
        let class_id = class_value.as_str();
        if let Err(e) = conn.execute(
            "UPDATE users SET class_id = ? WHERE id = ?",
            (class_id, &user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    match user_json(conn, &user_id) {
        Ok(Some(u)) => ok(&req.id, json!({ "user": u })),
        Ok(None) => err(&req.id, "not_found", "user not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_delete(conn: &Connection, req: &Request) -> serde_json::Value {
    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };
    let exists = conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&user_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional();
    match exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "user not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Err(e) = conn.execute("DELETE FROM users WHERE id = ?", [&user_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }
    ok(&req.id, json!({ "message": "user deleted" }))
}

fn handle_users_set_active(conn: &Connection, req: &Request) -> serde_json::Value {
    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };
    let Some(active) = req.params.get("active").and_then(|v| v.as_bool()) else {
        return err(
            &req.id,
            "bad_params",
            "the active field must be true or false",
            None,
        );
    };
    let role: Option<String> = match conn
        .query_row("SELECT role FROM users WHERE id = ?", [&user_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(role) = role else {
        return err(&req.id, "not_found", "user not found", None);
    };
    if role == "ADMIN" {
        return err(
            &req.id,
            "forbidden",
            "an administrator account cannot be deactivated",
            None,
        );
    }
    if let Err(e) = conn.execute(
        "UPDATE users SET active = ? WHERE id = ?",
        (active as i64, &user_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    match user_json(conn, &user_id) {
        Ok(Some(u)) => ok(&req.id, json!({ "user": u })),
        Ok(None) => err(&req.id, "not_found", "user not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn admin_gate(state: &mut AppState, req: &Request) -> Result<(), serde_json::Value> {
    let Some(conn) = state.db.as_ref() else {
        return Err(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let actor = load_actor(conn, &req.params).map_err(|e| err(&req.id, e.code, e.message, None))?;
    require_role(&actor, &["ADMIN"]).map_err(|e| err(&req.id, e.code, e.message, None))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if req.method == "users.register" {
        let Some(conn) = state.db.as_ref() else {
            return Some(err(&req.id, "no_workspace", "select a workspace first", None));
        };
        return Some(handle_users_register(conn, req));
    }
    let handler: fn(&Connection, &Request) -> serde_json::Value = match req.method.as_str() {
        "users.create" => handle_users_create,
        "users.list" => handle_users_list,
        "users.update" => handle_users_update,
        "users.delete" => handle_users_delete,
        "users.setActive" => handle_users_set_active,
        _ => return None,
    };
    // The whole family is administrative.
    if let Err(resp) = admin_gate(state, req) {
        return Some(resp);
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Some(handler(conn, req))
}
