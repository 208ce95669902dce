use crate::ipc::actor::{load_actor, require_role, Actor};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct CourseRow {
    id: String,
    name: String,
    description: Option<String>,
    teacher_id: String,
    teacher_last: String,
    teacher_first: String,
    class_id: String,
    class_name: String,
}

impl CourseRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "teacher": {
                "id": self.teacher_id,
                "lastName": self.teacher_last,
                "firstName": self.teacher_first
            },
            "class": { "id": self.class_id, "name": self.class_name }
        })
    }
}

const COURSE_SELECT: &str = "SELECT c.id, c.name, c.description,
        t.id, t.last_name, t.first_name,
        cl.id, cl.name
 FROM courses c
 JOIN users t ON t.id = c.teacher_id
 JOIN classes cl ON cl.id = c.class_id";

fn course_from_row(r: &rusqlite::Row) -> rusqlite::Result<CourseRow> {
    Ok(CourseRow {
        id: r.get(0)?,
        name: r.get(1)?,
        description: r.get(2)?,
        teacher_id: r.get(3)?,
        teacher_last: r.get(4)?,
        teacher_first: r.get(5)?,
        class_id: r.get(6)?,
        class_name: r.get(7)?,
    })
}

fn fetch_course(conn: &Connection, course_id: &str) -> rusqlite::Result<Option<CourseRow>> {
    let sql = format!("{} WHERE c.id = ?", COURSE_SELECT);
    conn.query_row(&sql, [course_id], |r| course_from_row(r))
        .optional()
}

fn handle_courses_create(conn: &Connection, actor: &Actor, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(actor, &["ADMIN", "PROF"]) {
        return err(&req.id, e.code, e.message, None);
    }
    let name = req.params.get("name").and_then(|v| v.as_str()).unwrap_or("").trim();
    let teacher_id = req.params.get("teacherId").and_then(|v| v.as_str()).unwrap_or("");
    let class_id = req.params.get("classId").and_then(|v| v.as_str()).unwrap_or("");
    if name.is_empty() || teacher_id.is_empty() || class_id.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "name, teacherId and classId are required",
            None,
        );
    }
    let description = req.params.get("description").and_then(|v| v.as_str());

    let teacher_exists = conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [teacher_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional();
    match teacher_exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "teacher not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let class_exists = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional();
    match class_exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let course_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, name, teacher_id, class_id, description)
         VALUES(?, ?, ?, ?, ?)",
        (&course_id, name, teacher_id, class_id, description),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }
    match fetch_course(conn, &course_id) {
        Ok(Some(c)) => ok(&req.id, json!({ "course": c.to_json() })),
        Ok(None) => err(&req.id, "db_query_failed", "course vanished after insert", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn list_courses(
    conn: &Connection,
    req: &Request,
    where_clause: &str,
    param: Option<&str>,
) -> serde_json::Value {
    let sql = format!("{} {} ORDER BY c.name", COURSE_SELECT, where_clause);
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match param {
        Some(p) => stmt
            .query_map([p], |r| course_from_row(r))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], |r| course_from_row(r))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    };
    match rows {
        Ok(courses) => ok(
            &req.id,
            json!({ "courses": courses.iter().map(|c| c.to_json()).collect::<Vec<_>>() }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_courses_list_for_student(
    conn: &Connection,
    actor: &Actor,
    req: &Request,
) -> serde_json::Value {
    if let Err(e) = require_role(actor, &["ELEVE"]) {
        return err(&req.id, e.code, e.message, None);
    }
    let Some(class_id) = actor.class_id.as_deref() else {
        return err(&req.id, "bad_params", "student not assigned to a class", None);
    };
    list_courses(conn, req, "WHERE c.class_id = ?", Some(class_id))
}

// Enrollment is by class: the roster of a course is every active-role
// student attached to the course's class.
fn handle_courses_roster(conn: &Connection, actor: &Actor, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(actor, &["ADMIN", "PROF"]) {
        return err(&req.id, e.code, e.message, None);
    }
    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    let course = match fetch_course(conn, &course_id) {
        Ok(Some(c)) => c,
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !actor.is_admin() && actor.id != course.teacher_id {
        return err(
            &req.id,
            "forbidden",
            "you are not allowed to access this course",
            None,
        );
    }

    let mut stmt = match conn.prepare(
        "SELECT id, last_name, first_name, email
         FROM users
         WHERE class_id = ? AND role = 'ELEVE'
         ORDER BY last_name, first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = stmt
        .query_map([&course.class_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "lastName": r.get::<_, String>(1)?,
                "firstName": r.get::<_, String>(2)?,
                "email": r.get::<_, String>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match students {
        Ok(students) => ok(
            &req.id,
            json!({
                "course": {
                    "id": course.id,
                    "name": course.name,
                    "className": course.class_name
                },
                "students": students
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn owner_gate(actor: &Actor, course: &CourseRow, req: &Request, action: &str) -> Option<serde_json::Value> {
    if actor.is_admin() || actor.id == course.teacher_id {
        return None;
    }
    Some(err(
        &req.id,
        "forbidden",
        format!("you may only {} your own courses", action),
        None,
    ))
}

fn handle_courses_update(conn: &Connection, actor: &Actor, req: &Request) -> serde_json::Value {
    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    let course = match fetch_course(conn, &course_id) {
        Ok(Some(c)) => c,
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(resp) = owner_gate(actor, &course, req, "edit") {
        return resp;
    }

    if let Some(name) = req.params.get("name").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE courses SET name = ? WHERE id = ?",
            (name.trim(), &course_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(teacher_id) = req.params.get("teacherId").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE courses SET teacher_id = ? WHERE id = ?",
            (teacher_id, &course_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(class_id) = req.params.get("classId").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE courses SET class_id = ? WHERE id = ?",
            (class_id, &course_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(description) = req.params.get("description").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE courses SET description = ? WHERE id = ?",
            (description, &course_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    match fetch_course(conn, &course_id) {
        Ok(Some(c)) => ok(&req.id, json!({ "course": c.to_json() })),
        Ok(None) => err(&req.id, "not_found", "course not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_courses_delete(conn: &Connection, actor: &Actor, req: &Request) -> serde_json::Value {
    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    let course = match fetch_course(conn, &course_id) {
        Ok(Some(c)) => c,
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(resp) = owner_gate(actor, &course, req, "delete") {
        return resp;
    }

    if let Err(e) = conn.execute("DELETE FROM courses WHERE id = ?", [&course_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }
    ok(&req.id, json!({ "message": "course deleted" }))
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
        "courses.create" => Some(with_conn_and_actor(state, req, handle_courses_create)),
        "courses.list" => Some(with_conn_and_actor(state, req, |conn, actor, req| {
            if let Err(e) = require_role(actor, &["ADMIN", "PROF"]) {
                return err(&req.id, e.code, e.message, None);
            }
            list_courses(conn, req, "", None)
        })),
        "courses.listForStudent" => {
            Some(with_conn_and_actor(state, req, handle_courses_list_for_student))
        }
        "courses.roster" => Some(with_conn_and_actor(state, req, handle_courses_roster)),
        "courses.update" => Some(with_conn_and_actor(state, req, handle_courses_update)),
        "courses.delete" => Some(with_conn_and_actor(state, req, handle_courses_delete)),
        _ => None,
    }
}
