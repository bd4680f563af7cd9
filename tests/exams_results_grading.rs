use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_campusd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn campusd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn result_of(resp: &serde_json::Value, method: &str) -> serde_json::Value {
    assert_eq!(
        resp.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        resp
    );
    resp.get("result").cloned().expect("result payload")
}

#[test]
fn exam_results_aggregate_marks_and_count_absences_as_zero() {
    let workspace = temp_dir("campus-exams");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "2",
            "schools.create",
            json!({ "name": "City Grammar" }),
        ),
        "schools.create",
    );
    let school_id = school["schoolId"].as_str().unwrap().to_string();

    let topper = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "3",
            "students.create",
            json!({ "schoolId": school_id, "lastName": "Khan", "firstName": "Anaya" }),
        ),
        "students.create",
    )["studentId"]
        .as_str()
        .unwrap()
        .to_string();
    let struggler = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "4",
            "students.create",
            json!({ "schoolId": school_id, "lastName": "Raza", "firstName": "Omar" }),
        ),
        "students.create",
    )["studentId"]
        .as_str()
        .unwrap()
        .to_string();

    let exam = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "5",
            "exams.create",
            json!({
                "schoolId": school_id,
                "name": "Midterm",
                "term": 1,
                "subjects": [
                    { "subject": "Math", "outOf": 100.0 },
                    { "subject": "English", "outOf": 100.0 }
                ]
            }),
        ),
        "exams.create",
    );
    let exam_id = exam["examId"].as_str().unwrap().to_string();
    assert_eq!(exam["subjectCount"], 2);

    let entered = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "6",
            "marks.enter",
            json!({
                "schoolId": school_id,
                "examId": exam_id,
                "subject": "Math",
                "entries": [
                    { "studentId": topper, "rawValue": 95.0 },
                    { "studentId": struggler, "rawValue": 30.0 }
                ]
            }),
        ),
        "marks.enter",
    );
    assert_eq!(entered["entered"], 2);
    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "marks.enter",
        json!({
            "schoolId": school_id,
            "examId": exam_id,
            "subject": "English",
            "entries": [
                { "studentId": topper, "rawValue": 85.0 },
                { "studentId": struggler, "absent": true }
            ]
        }),
    );

    let results = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "8",
            "exams.results",
            json!({ "schoolId": school_id, "examId": exam_id }),
        ),
        "exams.results",
    );
    assert_eq!(results["examName"], "Midterm");
    let rows = results["results"].as_array().unwrap();
    assert_eq!(rows.len(), 2);

    let row_of = |id: &str| {
        rows.iter()
            .find(|r| r["studentId"] == id)
            .unwrap_or_else(|| panic!("no result for {}", id))
    };
    let top = row_of(&topper);
    assert_eq!(top["obtained"], 180.0);
    assert_eq!(top["outOfTotal"], 200.0);
    assert_eq!(top["percent"], 90.0);
    assert_eq!(top["grade"], "A+");
    assert_eq!(top["pass"], true);
    assert_eq!(top["absentCount"], 0);

    let low = row_of(&struggler);
    assert_eq!(low["obtained"], 30.0);
    assert_eq!(low["outOfTotal"], 200.0);
    assert_eq!(low["percent"], 15.0);
    assert_eq!(low["grade"], "F");
    assert_eq!(low["pass"], false);
    assert_eq!(low["absentCount"], 1);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn re_entering_a_mark_overwrites_and_out_of_range_is_rejected() {
    let workspace = temp_dir("campus-exams-reenter");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "2",
            "schools.create",
            json!({ "name": "City Grammar" }),
        ),
        "schools.create",
    );
    let school_id = school["schoolId"].as_str().unwrap().to_string();
    let student = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "3",
            "students.create",
            json!({ "schoolId": school_id, "lastName": "Khan", "firstName": "Anaya" }),
        ),
        "students.create",
    )["studentId"]
        .as_str()
        .unwrap()
        .to_string();
    let exam_id = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "4",
            "exams.create",
            json!({
                "schoolId": school_id,
                "name": "Quiz",
                "subjects": [{ "subject": "Math", "outOf": 50.0 }]
            }),
        ),
        "exams.create",
    )["examId"]
        .as_str()
        .unwrap()
        .to_string();

    let over = request(
        &mut stdin,
        &mut reader,
        "5",
        "marks.enter",
        json!({
            "schoolId": school_id,
            "examId": exam_id,
            "subject": "Math",
            "entries": [{ "studentId": student, "rawValue": 51.0 }]
        }),
    );
    assert_eq!(over["ok"], false);
    assert_eq!(over["error"]["code"], "bad_params");

    let _ = request(
        &mut stdin,
        &mut reader,
        "6",
        "marks.enter",
        json!({
            "schoolId": school_id,
            "examId": exam_id,
            "subject": "Math",
            "entries": [{ "studentId": student, "rawValue": 20.0 }]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "marks.enter",
        json!({
            "schoolId": school_id,
            "examId": exam_id,
            "subject": "Math",
            "entries": [{ "studentId": student, "rawValue": 45.0 }]
        }),
    );
    let results = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "8",
            "exams.results",
            json!({ "schoolId": school_id, "examId": exam_id }),
        ),
        "exams.results",
    );
    let rows = results["results"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["obtained"], 45.0);
    assert_eq!(rows[0]["percent"], 90.0);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
