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
fn bundle_round_trips_into_a_fresh_workspace() {
    let source = temp_dir("campus-backup-src");
    let restored = temp_dir("campus-backup-dst");
    let bundle = source.join("export.campusbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": source.to_string_lossy() }),
    );
    let school = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "2",
            "schools.create",
            json!({ "name": "City Grammar", "academicYear": "2025-26" }),
        ),
        "schools.create",
    );
    let school_id = school["schoolId"].as_str().unwrap().to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "schoolId": school_id, "lastName": "Khan", "firstName": "Anaya" }),
    );

    let exported = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "4",
            "backup.exportWorkspaceBundle",
            json!({
                "workspacePath": source.to_string_lossy(),
                "outPath": bundle.to_string_lossy()
            }),
        ),
        "backup.exportWorkspaceBundle",
    );
    assert_eq!(exported["bundleFormat"], "campus-workspace-v1");
    assert_eq!(exported["entryCount"], 3);
    let sha = exported["dbSha256"].as_str().unwrap();
    assert_eq!(sha.len(), 64);
    assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));

    let imported = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "5",
            "backup.importWorkspaceBundle",
            json!({
                "workspacePath": restored.to_string_lossy(),
                "inPath": bundle.to_string_lossy()
            }),
        ),
        "backup.importWorkspaceBundle",
    );
    assert_eq!(imported["bundleFormatDetected"], "campus-workspace-v1");

    let _ = request(
        &mut stdin,
        &mut reader,
        "6",
        "workspace.select",
        json!({ "path": restored.to_string_lossy() }),
    );
    let listed = result_of(
        &request(&mut stdin, &mut reader, "7", "schools.list", json!({})),
        "schools.list",
    );
    let schools = listed["schools"].as_array().unwrap();
    assert_eq!(schools.len(), 1);
    assert_eq!(schools[0]["name"], "City Grammar");
    assert_eq!(schools[0]["studentCount"], 1);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(source);
    let _ = std::fs::remove_dir_all(restored);
}

#[test]
fn tampered_bundle_fails_the_checksum_and_leaves_target_intact() {
    let source = temp_dir("campus-backup-tamper-src");
    let target = temp_dir("campus-backup-tamper-dst");
    let bundle = source.join("export.campusbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": source.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "schools.create",
        json!({ "name": "City Grammar" }),
    );
    let _ = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "3",
            "backup.exportWorkspaceBundle",
            json!({
                "workspacePath": source.to_string_lossy(),
                "outPath": bundle.to_string_lossy()
            }),
        ),
        "backup.exportWorkspaceBundle",
    );

    // Rewrite the database entry so it no longer matches the manifest digest.
    {
        let original = std::fs::File::open(&bundle).expect("open bundle");
        let mut archive = zip::ZipArchive::new(original).expect("read bundle");
        let tampered_path = source.join("tampered.zip");
        let out = std::fs::File::create(&tampered_path).expect("create tampered bundle");
        let mut writer = zip::ZipWriter::new(out);
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).expect("bundle entry");
            let name = entry.name().to_string();
            writer
                .start_file(name.clone(), zip::write::FileOptions::default())
                .expect("start entry");
            if name == "db/campus.sqlite3" {
                writer.write_all(b"not a database").expect("write tampered");
            } else {
                let mut buf = Vec::new();
                std::io::Read::read_to_end(&mut entry, &mut buf).expect("read entry");
                writer.write_all(&buf).expect("write entry");
            }
        }
        writer.finish().expect("finish tampered bundle");
        std::fs::rename(&tampered_path, &bundle).expect("swap in tampered bundle");
    }

    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": target.to_string_lossy(),
            "inPath": bundle.to_string_lossy()
        }),
    );
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "backup_import_failed");
    assert!(resp["error"]["message"]
        .as_str()
        .unwrap()
        .contains("checksum mismatch"));
    assert!(!target.join("campus.sqlite3").exists());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(source);
    let _ = std::fs::remove_dir_all(target);
}

#[test]
fn bare_sqlite_file_imports_as_legacy_backup() {
    let source = temp_dir("campus-backup-legacy-src");
    let target = temp_dir("campus-backup-legacy-dst");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": source.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "schools.create",
        json!({ "name": "City Grammar" }),
    );

    let imported = result_of(
        &request(
            &mut stdin,
            &mut reader,
            "3",
            "backup.importWorkspaceBundle",
            json!({
                "workspacePath": target.to_string_lossy(),
                "inPath": source.join("campus.sqlite3").to_string_lossy()
            }),
        ),
        "backup.importWorkspaceBundle",
    );
    assert_eq!(imported["bundleFormatDetected"], "legacy-sqlite3");

    let _ = request(
        &mut stdin,
        &mut reader,
        "4",
        "workspace.select",
        json!({ "path": target.to_string_lossy() }),
    );
    let listed = result_of(
        &request(&mut stdin, &mut reader, "5", "schools.list", json!({})),
        "schools.list",
    );
    assert_eq!(listed["schools"].as_array().unwrap().len(), 1);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(source);
    let _ = std::fs::remove_dir_all(target);
}
