use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const WORKER: &str = r#"cat >/dev/null
printf '{"chunk_id":"%s","status":"completed","findings":[{"point":"greet prints a greeting","confidence":"high","source":{"file":"src/lib.rs","line":2}}]}' "$CHUNKWISE_CHUNK_ID"
"#;

#[allow(deprecated)]
fn chunkwise(state: &Path) -> Command {
    let mut cmd = Command::cargo_bin("chunkwise").expect("binary");
    cmd.env_remove("CHUNKWISE_STATE_DIR")
        .env("RUST_LOG", "warn")
        .arg("--state-dir")
        .arg(state);
    cmd
}

fn json_stdout(cmd: &mut Command) -> Value {
    let output = cmd.output().expect("command run");
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("valid json")
}

fn setup_project(root: &Path) {
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(
        root.join("src/lib.rs"),
        "pub fn greet(name: &str) {\n    println!(\"hi {name}\");\n}\n",
    )
    .unwrap();
    fs::write(root.join("README.md"), "# demo\n\nSays hello.\n").unwrap();
}

#[test]
fn schema_describes_the_error_envelope() {
    let state = tempdir().unwrap();
    chunkwise(state.path())
        .args(["schema", "error"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"hint\""))
        .stdout(predicate::str::contains("\"category\""));
}

#[test]
fn status_without_a_session_is_a_validation_error() {
    let state = tempdir().unwrap();
    chunkwise(state.path())
        .arg("status")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("error[session.no_current]"))
        .stderr(predicate::str::contains("hint:"));
}

#[test]
fn json_mode_prints_the_error_envelope_on_stdout() {
    let state = tempdir().unwrap();
    let output = chunkwise(state.path())
        .args(["--json", "sessions", "use", "missing"])
        .output()
        .expect("command run");
    assert_eq!(output.status.code(), Some(2));
    let body: Value = serde_json::from_slice(&output.stdout).expect("valid json");
    assert_eq!(body["code"], "session.not_found");
    assert!(body["hint"].as_str().is_some());
}

#[test]
fn invalid_configuration_exits_with_the_configuration_code() {
    let state = tempdir().unwrap();
    fs::write(state.path().join("chunkwise.toml"), "batch_width = 0\n").unwrap();
    chunkwise(state.path())
        .args(["sessions", "list"])
        .assert()
        .code(5)
        .stderr(predicate::str::contains("error[config.invalid]"));
}

#[test]
fn flags_override_the_config_file() {
    let state = tempdir().unwrap();
    fs::write(state.path().join("chunkwise.toml"), "batch_width = 0\n").unwrap();
    chunkwise(state.path())
        .args(["--batch-width", "3", "sessions", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no sessions"));
}

#[test]
fn mapping_without_a_worker_is_refused() {
    let project = tempdir().unwrap();
    let state = tempdir().unwrap();
    setup_project(project.path());

    chunkwise(state.path())
        .arg("init")
        .arg(project.path())
        .args(["--query", "who says hello?"])
        .assert()
        .success();
    chunkwise(state.path()).arg("chunk").assert().success();
    chunkwise(state.path())
        .arg("map")
        .assert()
        .code(6)
        .stderr(predicate::str::contains("error[map.worker_unavailable]"));
}

#[test]
fn search_runs_against_the_session_context() {
    let project = tempdir().unwrap();
    let state = tempdir().unwrap();
    setup_project(project.path());

    chunkwise(state.path())
        .arg("init")
        .arg(project.path())
        .args(["--query", "who says hello?"])
        .assert()
        .success();
    let body = json_stdout(
        chunkwise(state.path())
            .args(["--isolation", "in-process", "--no-resource-limits", "--json"])
            .args(["explore", "search", "println"]),
    );
    let matches = body["matches"].as_array().expect("matches");
    assert_eq!(matches.len(), 1);
    assert!(matches[0]["text"].as_str().unwrap().contains("println!"));

    let status = json_stdout(chunkwise(state.path()).args(["--json", "status"]));
    assert_eq!(status["phase"], "scouting");
}

#[cfg(unix)]
#[test]
fn full_run_produces_a_markdown_report() {
    let project = tempdir().unwrap();
    let state = tempdir().unwrap();
    setup_project(project.path());
    let script = state.path().join("worker.sh");
    fs::write(&script, WORKER).unwrap();
    fs::write(
        state.path().join("chunkwise.toml"),
        format!("[worker]\ncommand = [\"sh\", {:?}]\n", script.display().to_string()),
    )
    .unwrap();

    let init = json_stdout(
        chunkwise(state.path())
            .arg("--json")
            .arg("init")
            .arg(project.path())
            .args(["--query", "who says hello?"]),
    );
    let session = init["session_id"].as_str().expect("session id").to_string();
    assert_eq!(init["files"], 2);

    let chunks = json_stdout(chunkwise(state.path()).args(["--json", "chunk"]));
    assert!(chunks["chunks"].as_u64().unwrap() >= 1);

    let mapped = json_stdout(chunkwise(state.path()).args(["--json", "map"]));
    assert_eq!(mapped["failed"], 0);
    assert_eq!(mapped["remaining"], 0);

    chunkwise(state.path()).arg("reduce").assert().success();

    let out = project.path().join("report.md");
    chunkwise(state.path())
        .args(["export", "--format", "markdown", "--out"])
        .arg(&out)
        .assert()
        .success();
    let report = fs::read_to_string(&out).unwrap();
    assert!(report.contains("# who says hello?"));
    assert!(report.contains("greet prints a greeting"));

    let listed = json_stdout(chunkwise(state.path()).args(["--json", "sessions", "list"]));
    assert_eq!(listed[0]["id"], session.as_str());
    assert_eq!(listed[0]["phase"], "completed");
}
