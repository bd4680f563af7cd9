use crate::grading::{self, MarkState};
use crate::ipc::helpers::{get_required_str, require_school, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

fn exams_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let term = params.get("term").and_then(|v| v.as_i64());

    let Some(subjects) = params.get("subjects").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing subjects"));
    };
    if subjects.is_empty() {
        return Err(HandlerErr::bad_params("subjects must not be empty"));
    }

    struct SubjectDef {
        subject: String,
        out_of: f64,
    }
    let mut defs = Vec::with_capacity(subjects.len());
    for s in subjects {
        let Some(subject) = s.get("subject").and_then(|v| v.as_str()) else {
            return Err(HandlerErr::bad_params("subject entry missing subject"));
        };
        let Some(out_of) = s.get("outOf").and_then(|v| v.as_f64()) else {
            return Err(HandlerErr::bad_params("subject entry missing outOf"));
        };
        if out_of <= 0.0 {
            return Err(HandlerErr::bad_params("outOf must be positive"));
        }
        defs.push(SubjectDef {
            subject: subject.trim().to_string(),
            out_of,
        });
    }

    let exam_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO exams(id, school_id, name, term) VALUES(?, ?, ?, ?)",
        (&exam_id, &school_id, &name, &term),
    )
    .map_err(|e| HandlerErr::db_update(e, "exams"))?;
    for def in &defs {
        tx.execute(
            "INSERT INTO exam_subjects(id, exam_id, subject, out_of) VALUES(?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &exam_id,
                &def.subject,
                def.out_of,
            ),
        )
        .map_err(|e| HandlerErr::db_update(e, "exam_subjects"))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "examId": exam_id, "subjectCount": defs.len() }))
}

fn exams_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT
               e.id, e.name, e.term,
               (SELECT COUNT(*) FROM exam_subjects es WHERE es.exam_id = e.id) AS subject_count
             FROM exams e
             WHERE e.school_id = ?
             ORDER BY e.rowid",
        )
        .map_err(HandlerErr::db)?;
    let exams = stmt
        .query_map([&school_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "term": row.get::<_, Option<i64>>(2)?,
                "subjectCount": row.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "exams": exams }))
}

fn marks_enter(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;
    let exam_id = get_required_str(params, "examId")?;
    let subject = get_required_str(params, "subject")?;

    let subject_row: Option<(String, f64)> = conn
        .query_row(
            "SELECT es.id, es.out_of
             FROM exam_subjects es
             JOIN exams e ON e.id = es.exam_id
             WHERE e.school_id = ? AND es.exam_id = ? AND es.subject = ?",
            (&school_id, &exam_id, &subject),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((exam_subject_id, out_of)) = subject_row else {
        return Err(HandlerErr::not_found("exam subject not found"));
    };

    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut entered = 0usize;
    let mut skipped = 0usize;
    for entry in entries {
        let Some(student_id) = entry.get("studentId").and_then(|v| v.as_str()) else {
            return Err(HandlerErr::bad_params("entry missing studentId"));
        };
        let absent = entry.get("absent").and_then(|v| v.as_bool()).unwrap_or(false);
        let raw_value = entry.get("rawValue").and_then(|v| v.as_f64());
        let (value, status) = if absent {
            (None, "absent")
        } else {
            let Some(v) = raw_value else {
                return Err(HandlerErr::bad_params("entry needs rawValue or absent"));
            };
            if v < 0.0 || v > out_of {
                return Err(HandlerErr::bad_params(format!(
                    "rawValue must be between 0 and {}",
                    out_of
                )));
            }
            (Some(v), "scored")
        };

        let exists = tx
            .query_row(
                "SELECT 1 FROM students WHERE school_id = ? AND id = ?",
                (&school_id, student_id),
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map_err(HandlerErr::db)?
            .is_some();
        if !exists {
            skipped += 1;
            continue;
        }

        tx.execute(
            "INSERT INTO exam_marks(id, exam_subject_id, student_id, raw_value, status)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(exam_subject_id, student_id) DO UPDATE SET
               raw_value = excluded.raw_value,
               status = excluded.status",
            (
                Uuid::new_v4().to_string(),
                &exam_subject_id,
                student_id,
                value,
                status,
            ),
        )
        .map_err(|e| HandlerErr::db_update(e, "exam_marks"))?;
        entered += 1;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "entered": entered, "skipped": skipped }))
}

fn exams_results(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    require_school(conn, &school_id)?;
    let exam_id = get_required_str(params, "examId")?;

    let exam_name: Option<String> = conn
        .query_row(
            "SELECT name FROM exams WHERE school_id = ? AND id = ?",
            (&school_id, &exam_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some(exam_name) = exam_name else {
        return Err(HandlerErr::not_found("exam not found"));
    };

    let mut stmt = conn
        .prepare(
            "SELECT m.student_id, s.last_name, s.first_name,
                    es.subject, es.out_of, m.raw_value, m.status
             FROM exam_marks m
             JOIN exam_subjects es ON es.id = m.exam_subject_id
             JOIN students s ON s.id = m.student_id
             WHERE es.exam_id = ?
             ORDER BY s.last_name, s.first_name, es.subject",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([&exam_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, Option<f64>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    struct StudentRow {
        display_name: String,
        subjects: Vec<serde_json::Value>,
        marks: Vec<(f64, MarkState)>,
    }

    let mut by_student: HashMap<String, StudentRow> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for (student_id, last, first, subject, out_of, raw_value, status) in rows {
        let row = by_student.entry(student_id.clone()).or_insert_with(|| {
            order.push(student_id.clone());
            StudentRow {
                display_name: format!("{}, {}", last, first),
                subjects: Vec::new(),
                marks: Vec::new(),
            }
        });
        let state = if status == "absent" {
            MarkState::Absent
        } else {
            MarkState::Scored(raw_value.unwrap_or(0.0))
        };
        row.subjects.push(json!({
            "subject": subject,
            "outOf": out_of,
            "rawValue": raw_value,
            "absent": status == "absent",
        }));
        row.marks.push((out_of, state));
    }

    let results: Vec<serde_json::Value> = order
        .iter()
        .filter_map(|id| by_student.get(id).map(|r| (id, r)))
        .map(|(id, r)| {
            let summary = grading::summarize(r.marks.iter().copied());
            json!({
                "studentId": id,
                "displayName": r.display_name,
                "subjects": r.subjects,
                "obtained": summary.obtained,
                "outOfTotal": summary.out_of_total,
                "percent": summary.percent,
                "grade": summary.grade,
                "pass": summary.pass,
                "absentCount": summary.absent_count,
            })
        })
        .collect();

    Ok(json!({ "examId": exam_id, "examName": exam_name, "results": results }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.create" => Some(with_conn(state, req, exams_create)),
        "exams.list" => Some(with_conn(state, req, exams_list)),
        "marks.enter" => Some(with_conn(state, req, marks_enter)),
        "exams.results" => Some(with_conn(state, req, exams_results)),
        _ => None,
    }
}
