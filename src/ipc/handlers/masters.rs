use crate::calc::rupees;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name) VALUES(?, ?)",
        (&class_id, &name),
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

    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id AND s.active = 1)
         FROM classes c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "studentCount": row.get::<_, i64>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_transport_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("pickupPointName").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing pickupPointName", None),
    };
    let charge_paise = match req
        .params
        .get("monthlyCharge")
        .and_then(crate::calc::paise_from_json)
    {
        Some(v) if v >= 0 => v,
        Some(_) => {
            return err(
                &req.id,
                "bad_params",
                "monthlyCharge must be non-negative",
                None,
            )
        }
        None => return err(&req.id, "bad_params", "missing monthlyCharge", None),
    };
    let distance_km = req.params.get("distanceKm").and_then(|v| v.as_f64());

    let point_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO transport_points(id, pickup_point_name, distance_km, monthly_charge_paise)
         VALUES(?, ?, ?, ?)",
        (&point_id, &name, distance_km, charge_paise),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "transport_points" })),
        );
    }

    ok(&req.id, json!({ "transportPointId": point_id }))
}

fn handle_transport_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "points": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT id, pickup_point_name, distance_km, monthly_charge_paise
         FROM transport_points
         ORDER BY pickup_point_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "pickupPointName": row.get::<_, String>(1)?,
                "distanceKm": row.get::<_, Option<f64>>(2)?,
                "monthlyCharge": rupees(row.get::<_, i64>(3)?),
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(points) => ok(&req.id, json!({ "points": points })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("studentName").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing studentName", None),
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let class_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if class_exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let admission_no = req.params.get("admissionNo").and_then(|v| v.as_str());
    let father_name = req.params.get("fatherName").and_then(|v| v.as_str());
    let section = req.params.get("section").and_then(|v| v.as_str());
    let transport_opted = req
        .params
        .get("transportOpted")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let pickup_point_id = req.params.get("pickupPointId").and_then(|v| v.as_str());

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(
            id, admission_no, student_name, father_name, class_id, section,
            transport_opted, pickup_point_id, current_balance_paise, active
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, 0, 1)",
        rusqlite::params![
            student_id,
            admission_no,
            name,
            father_name,
            class_id,
            section,
            transport_opted as i64,
            pickup_point_id,
        ],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };

    let class_filter = req.params.get("classId").and_then(|v| v.as_str());
    let sql = "SELECT s.id, s.admission_no, s.student_name, s.father_name, s.class_id,
                      c.name, s.section, s.transport_opted, s.pickup_point_id,
                      s.current_balance_paise, s.active
               FROM students s
               JOIN classes c ON c.id = s.class_id
               WHERE (?1 IS NULL OR s.class_id = ?1)
               ORDER BY s.student_name";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([class_filter], |row| {
            let balance_paise: i64 = row.get(9)?;
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "admissionNo": row.get::<_, Option<String>>(1)?,
                "studentName": row.get::<_, String>(2)?,
                "fatherName": row.get::<_, Option<String>>(3)?,
                "classId": row.get::<_, String>(4)?,
                "className": row.get::<_, String>(5)?,
                "section": row.get::<_, Option<String>>(6)?,
                "transportOpted": row.get::<_, i64>(7)? != 0,
                "pickupPointId": row.get::<_, Option<String>>(8)?,
                "currentBalance": rupees(balance_paise),
                "duesAlert": balance_paise > 0,
                "active": row.get::<_, i64>(10)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Only reassignment fields are patchable. The balance is a derived value
/// and has no direct edit path.
fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let Some(patch) = req.params.get("patch").filter(|p| p.is_object()) else {
        return err(&req.id, "bad_params", "missing patch", None);
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(class_id) = patch.get("classId").and_then(|v| v.as_str()) {
        sets.push("class_id = ?");
        values.push(class_id.to_string().into());
    }
    if let Some(section) = patch.get("section").and_then(|v| v.as_str()) {
        sets.push("section = ?");
        values.push(section.to_string().into());
    }
    if let Some(opted) = patch.get("transportOpted").and_then(|v| v.as_bool()) {
        sets.push("transport_opted = ?");
        values.push((opted as i64).into());
    }
    if let Some(pp) = patch.get("pickupPointId") {
        sets.push("pickup_point_id = ?");
        match pp.as_str() {
            Some(id) => values.push(id.to_string().into()),
            None => values.push(rusqlite::types::Value::Null),
        }
    }
    if let Some(active) = patch.get("active").and_then(|v| v.as_bool()) {
        sets.push("active = ?");
        values.push((active as i64).into());
    }
    if sets.is_empty() {
        return err(&req.id, "bad_params", "patch has no supported fields", None);
    }

    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
    values.push(student_id.clone().into());
    if let Err(e) = conn.execute(&sql, rusqlite::params_from_iter(values)) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        "transport.create" => Some(handle_transport_create(state, req)),
        "transport.list" => Some(handle_transport_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        _ => None,
    }
}
