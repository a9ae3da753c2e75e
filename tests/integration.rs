use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn krag_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("krag");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(files_dir.join("notes.rar"), "not a supported format").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/krag.sqlite"

[index]
dir = "{root}/data/vector"

[storage]
upload_dir = "{root}/data/uploads"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("krag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_krag(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = krag_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run krag binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn files(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("files")
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_krag(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_krag(&config_path, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_krag(&config_path, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_krag(&tmp.path().join("nope.toml"), &["list"]);
    assert!(!success);
    assert!(stderr.contains("config"));
}

#[test]
fn test_list_and_history_empty() {
    let (_tmp, config_path) = setup_test_env();
    run_krag(&config_path, &["init"]);

    let (stdout, _, success) = run_krag(&config_path, &["list"]);
    assert!(success);
    assert!(stdout.contains("No documents."));

    let (stdout, _, success) = run_krag(&config_path, &["history"]);
    assert!(success);
    assert!(stdout.contains("No history."));
}

#[test]
fn test_query_before_any_document_explains_empty_index() {
    let (_tmp, config_path) = setup_test_env();
    run_krag(&config_path, &["init"]);

    let (stdout, stderr, success) = run_krag(&config_path, &["query", "what is rust?"]);
    assert!(success, "query failed: {}", stderr);
    assert!(stdout.contains("knowledge base is empty"), "got: {}", stdout);
}

#[test]
fn test_add_unsupported_file_is_rejected() {
    let (_tmp, config_path) = setup_test_env();
    run_krag(&config_path, &["init"]);

    let file = files(&config_path).join("notes.rar");
    let (_, stderr, success) = run_krag(&config_path, &["add", file.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.to_lowercase().contains("unsupported"), "got: {}", stderr);

    let (stdout, _, _) = run_krag(&config_path, &["list"]);
    assert!(stdout.contains("No documents."));
}

#[test]
fn test_add_without_embedding_provider_marks_error() {
    let (_tmp, config_path) = setup_test_env();
    run_krag(&config_path, &["init"]);

    let file = files(&config_path).join("alpha.md");
    let (stdout, stderr, success) =
        run_krag(&config_path, &["add", file.to_str().unwrap(), "--name", "Alpha"]);
    assert!(success, "add failed: {}", stderr);
    assert!(stdout.starts_with("error "), "got: {}", stdout);
    assert!(stdout.contains("(Alpha)"));
    let id = stdout.split_whitespace().nth(1).unwrap().to_string();

    let (stdout, _, _) = run_krag(&config_path, &["list"]);
    assert!(stdout.contains(&id));
    assert!(stdout.contains("error"));
    assert!(stdout.contains("Alpha"));

    // only uploading/processing documents can be cancelled
    let (stdout, _, success) = run_krag(&config_path, &["cancel", &id]);
    assert!(success);
    assert!(stdout.contains("nothing to cancel"));

    let (stdout, _, success) = run_krag(&config_path, &["delete", &id]);
    assert!(success);
    assert!(stdout.contains("deleted"));
    let (stdout, _, _) = run_krag(&config_path, &["list"]);
    assert!(stdout.contains("No documents."));
}

#[test]
fn test_process_unknown_document_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_krag(&config_path, &["init"]);

    let (_, stderr, success) = run_krag(&config_path, &["process", "no-such-id"]);
    assert!(!success);
    assert!(stderr.contains("no-such-id"));
}

#[test]
fn test_settings_set_persists() {
    let (_tmp, config_path) = setup_test_env();
    run_krag(&config_path, &["init"]);

    let (stdout, _, success) = run_krag(&config_path, &["settings", "show"]);
    assert!(success);
    assert!(stdout.contains("top_k = 4"));
    assert!(stdout.contains("use_hybrid = true"));

    let (stdout, stderr, success) = run_krag(
        &config_path,
        &["settings", "set", "top_k=6", "use_hybrid=false", "temperature=0.5"],
    );
    assert!(success, "settings set failed: {}", stderr);
    assert!(stdout.contains("ok"));

    let (stdout, _, _) = run_krag(&config_path, &["settings", "show"]);
    assert!(stdout.contains("top_k = 6"));
    assert!(stdout.contains("use_hybrid = false"));
    assert!(stdout.contains("temperature = 0.5"));
}

#[test]
fn test_settings_set_rejects_invalid_values() {
    let (_tmp, config_path) = setup_test_env();
    run_krag(&config_path, &["init"]);

    let (_, _, success) = run_krag(&config_path, &["settings", "set", "chunk_overlap=5000"]);
    assert!(!success);
    let (_, _, success) = run_krag(&config_path, &["settings", "set", "no_such_key=1"]);
    assert!(!success);

    let (stdout, _, _) = run_krag(&config_path, &["settings", "show"]);
    assert!(stdout.contains("chunk_overlap = 200"));
}

#[test]
fn test_maintenance_on_empty_index() {
    let (_tmp, config_path) = setup_test_env();
    run_krag(&config_path, &["init"]);

    let (stdout, _, success) = run_krag(&config_path, &["maintenance"]);
    assert!(success);
    assert!(stdout.contains("total entries:   0"));
    assert!(stdout.contains("cleaned orphans: 0"));
}
