use crate::ipc::actor::{load_actor, require_role};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;

const MONTH_LABELS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

fn rate(part: i64, total: i64) -> f64 {
    if total > 0 {
        ((part as f64 / total as f64) * 1000.0).round() / 10.0
    } else {
        0.0
    }
}

fn month_label(key: &str) -> String {
    // key is YYYY-MM.
    let year = &key[..4.min(key.len())];
    let month = key
        .get(5..7)
        .and_then(|m| m.parse::<usize>().ok())
        .filter(|m| (1..=12).contains(m));
    match month {
        Some(m) => format!("{} {}", MONTH_LABELS[m - 1], year),
        None => key.to_string(),
    }
}

#[derive(Default, Clone)]
struct Tally {
    total: i64,
    present: i64,
    absent: i64,
    late: i64,
}

impl Tally {
    fn bump(&mut self, status: &str) {
        self.total += 1;
        match status {
            "present" => self.present += 1,
            "absent" => self.absent += 1,
            _ => self.late += 1,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "total": self.total,
            "present": self.present,
            "absent": self.absent,
            "late": self.late,
        })
    }
}

fn dashboard(conn: &Connection) -> rusqlite::Result<serde_json::Value> {
    let total_students: i64 = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE role = 'ELEVE'",
        [],
        |r| r.get(0),
    )?;
    let total_teachers: i64 = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE role = 'PROF'",
        [],
        |r| r.get(0),
    )?;
    let total_classes: i64 =
        conn.query_row("SELECT COUNT(*) FROM classes", [], |r| r.get(0))?;
    let (total, absents): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(status = 'absent'), 0) FROM attendance_records",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;

    let most_absent_student = conn
        .query_row(
            "SELECT u.first_name, u.last_name, COUNT(*) AS n
             FROM attendance_records r
             JOIN users u ON u.id = r.student_id
             WHERE r.status = 'absent'
             GROUP BY r.student_id
             ORDER BY n DESC
             LIMIT 1",
            [],
            |r| {
                Ok(json!({
                    "firstName": r.get::<_, String>(0)?,
                    "lastName": r.get::<_, String>(1)?,
                    "absenceCount": r.get::<_, i64>(2)?,
                }))
            },
        )
        .optional()?;
    let most_absent_class = conn
        .query_row(
            "SELECT cl.name, COUNT(*) AS n
             FROM attendance_records r
             JOIN courses c ON c.id = r.course_id
             JOIN classes cl ON cl.id = c.class_id
             WHERE r.status = 'absent'
             GROUP BY cl.id
             ORDER BY n DESC
             LIMIT 1",
            [],
            |r| {
                Ok(json!({
                    "name": r.get::<_, String>(0)?,
                    "absenceCount": r.get::<_, i64>(1)?,
                }))
            },
        )
        .optional()?;

    Ok(json!({
        "totalStudents": total_students,
        "totalTeachers": total_teachers,
        "totalClasses": total_classes,
        "globalAbsenceRate": rate(absents, total),
        "mostAbsentStudent": most_absent_student,
        "mostAbsentClass": most_absent_class,
    }))
}

fn handle_overview(conn: &Connection, req: &Request) -> serde_json::Value {
    let dashboard = match dashboard(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut conditions: Vec<&str> = Vec::new();
    let mut params: Vec<String> = Vec::new();
    if let Some(class_id) = req.params.get("classId").and_then(|v| v.as_str()) {
        conditions.push("cl.id = ?");
        params.push(class_id.to_string());
    }
    if let Some(course_id) = req.params.get("courseId").and_then(|v| v.as_str()) {
        conditions.push("c.id = ?");
        params.push(course_id.to_string());
    }
    if let Some(from) = req.params.get("from").and_then(|v| v.as_str()) {
        conditions.push("r.day >= ?");
        params.push(from.to_string());
    }
    if let Some(to) = req.params.get("to").and_then(|v| v.as_str()) {
        // Day-granular storage makes the end bound inclusive by itself.
        conditions.push("r.day <= ?");
        params.push(to.to_string());
    }
    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let sql = format!(
        "SELECT r.status, r.day, c.name, cl.name
         FROM attendance_records r
         JOIN courses c ON c.id = r.course_id
         JOIN classes cl ON cl.id = c.class_id
         {}",
        where_clause
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut global = Tally::default();
    let mut by_class: BTreeMap<String, Tally> = BTreeMap::new();
    let mut by_course: BTreeMap<String, Tally> = BTreeMap::new();
    let mut by_month: BTreeMap<String, Tally> = BTreeMap::new();
    for (status, day, course_name, class_name) in &rows {
        global.bump(status);
        by_class.entry(class_name.clone()).or_default().bump(status);
        by_course.entry(course_name.clone()).or_default().bump(status);
        let month_key = day.get(..7).unwrap_or(day.as_str()).to_string();
        by_month.entry(month_key).or_default().bump(status);
    }

    let absences_by_month: Vec<serde_json::Value> = by_month
        .iter()
        .map(|(month, t)| {
            json!({
                "month": month,
                "label": month_label(month),
                "absences": t.absent,
            })
        })
        .collect();
    let attendance_rate_by_month: Vec<serde_json::Value> = by_month
        .iter()
        .map(|(month, t)| {
            json!({
                "month": month,
                "label": month_label(month),
                "attendanceRate": rate(t.present, t.total),
                "total": t.total,
            })
        })
        .collect();
    let class_comparison: Vec<serde_json::Value> = by_class
        .iter()
        .map(|(name, t)| {
            json!({
                "name": name,
                "total": t.total,
                "present": t.present,
                "absent": t.absent,
                "late": t.late,
                "attendanceRate": rate(t.present, t.total),
            })
        })
        .collect();

    let by_class_json: serde_json::Map<String, serde_json::Value> = by_class
        .iter()
        .map(|(name, t)| (name.clone(), t.to_json()))
        .collect();
    let by_course_json: serde_json::Map<String, serde_json::Value> = by_course
        .iter()
        .map(|(name, t)| (name.clone(), t.to_json()))
        .collect();

    ok(
        &req.id,
        json!({
            "dashboard": dashboard,
            "global": global.to_json(),
            "byClass": by_class_json,
            "byCourse": by_course_json,
            "absencesByMonth": absences_by_month,
            "attendanceRateByMonth": attendance_rate_by_month,
            "classComparison": class_comparison,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if req.method != "stats.overview" {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let actor = match load_actor(conn, &req.params) {
        Ok(a) => a,
        Err(e) => return Some(err(&req.id, e.code, e.message, None)),
    };
    if let Err(e) = require_role(&actor, &["ADMIN"]) {
        return Some(err(&req.id, e.code, e.message, None));
    }
    Some(handle_overview(conn, req))
}
