use crate::db;
use crate::ipc::actor::{load_actor, require_role};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

const THRESHOLD_KEY: &str = "absence_alert_threshold";
const MODE_KEY: &str = "threshold_mode";
const EMAIL_KEY: &str = "email_notifications";

fn settings_json(conn: &Connection) -> anyhow::Result<serde_json::Value> {
    let threshold = db::settings_get_json(conn, THRESHOLD_KEY)?
        .and_then(|v| v.as_i64())
        .unwrap_or(3);
    let mode = db::settings_get_json(conn, MODE_KEY)?
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "GLOBAL".to_string());
    let email = db::settings_get_json(conn, EMAIL_KEY)?
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    Ok(json!({
        "thresholdMode": mode,
        "absenceThreshold": threshold,
        "emailNotifications": email,
    }))
}

fn handle_settings_get(conn: &Connection, req: &Request) -> serde_json::Value {
    match settings_json(conn) {
        Ok(settings) => ok(&req.id, json!({ "settings": settings })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_settings_update(conn: &Connection, req: &Request) -> serde_json::Value {
    if let Some(threshold) = req.params.get("absenceThreshold") {
        let Some(n) = threshold.as_i64().filter(|n| *n >= 1) else {
            return err(
                &req.id,
                "bad_params",
                "absenceThreshold must be a positive integer",
                None,
            );
        };
        if let Err(e) = db::settings_set_json(conn, THRESHOLD_KEY, &json!(n)) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(mode) = req.params.get("thresholdMode") {
        let Some(mode) = mode.as_str().filter(|m| ["GLOBAL", "COURSE"].contains(m)) else {
            return err(
                &req.id,
                "bad_params",
                "thresholdMode must be GLOBAL or COURSE",
                None,
            );
        };
        if let Err(e) = db::settings_set_json(conn, MODE_KEY, &json!(mode)) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(email) = req.params.get("emailNotifications") {
        let Some(flag) = email.as_bool() else {
            return err(
                &req.id,
                "bad_params",
                "emailNotifications must be true or false",
                None,
            );
        };
        if let Err(e) = db::settings_set_json(conn, EMAIL_KEY, &json!(flag)) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    handle_settings_get(conn, req)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let is_ours = matches!(req.method.as_str(), "settings.get" | "settings.update");
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
        "settings.get" => Some(handle_settings_get(conn, req)),
        "settings.update" => {
            if let Err(e) = require_role(&actor, &["ADMIN"]) {
                return Some(err(&req.id, e.code, e.message, None));
            }
            Some(handle_settings_update(conn, req))
        }
        _ => None,
    }
}
