use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

struct TempDb {
    path: PathBuf,
}

impl TempDb {
    fn new() -> Self {
        Self { path: std::env::temp_dir().join(format!("bg-cli-{}.sqlite3", Ulid::new())) }
    }

    fn arg(&self) -> &str {
        path_str(&self.path)
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.path.clone().into_os_string();
            path.push(suffix);
            let _ = fs::remove_file(path);
        }
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn run_bg<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_bg"))
        .args(args)
        .env_remove("BREEDGRAPH_CONFIG")
        .env_remove("BREEDGRAPH_DB")
        .env_remove("BREEDGRAPH_EVENT_WORKERS")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute bg binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_bg(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "bg command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_command(db: &TempDb, user: Option<i64>, command: &Value) -> Value {
    let body = command.to_string();
    let mut args = vec!["--db".to_string(), db.arg().to_string(), "run".to_string()];
    if let Some(user) = user {
        args.push("--user".to_string());
        args.push(user.to_string());
    }
    args.push(body);
    run_json(args)
}

fn create_account(db: &TempDb, name: &str) -> Value {
    run_command(
        db,
        None,
        &serde_json::json!({
            "domain": "account",
            "command": {
                "type": "Create",
                "name": name,
                "email": format!("{name}@example.org"),
                "password_hash": "hash"
            }
        }),
    )
}

#[test]
fn migrate_reports_an_up_to_date_schema() {
    let db = TempDb::new();
    let migrated = run_json(["--db", db.arg(), "db", "migrate"]);
    assert_eq!(migrated["dry_run"], false);
    assert_eq!(migrated["up_to_date"], true);
    assert_eq!(migrated["contract_version"], "bg.v1");

    let status = run_json(["--db", db.arg(), "db", "schema-version"]);
    assert_eq!(status["up_to_date"], true);
    assert_eq!(status["empty"], true);

    let report = run_json(["--db", db.arg(), "db", "integrity-check"]);
    assert_eq!(report["quick_check_ok"], true);
}

#[test]
fn first_registered_account_administers_the_ontology() {
    let db = TempDb::new();
    let first = create_account(&db, "alice");
    assert_eq!(first["output"], "account");
    assert_eq!(first["value"]["user"]["id"], 1);
    assert_eq!(first["value"]["user"]["ontology_role"], "ADMIN");
    assert!(first["value"]["user"].get("password_hash").is_none());

    let second = create_account(&db, "bob");
    assert_eq!(second["value"]["user"]["ontology_role"], "VIEWER");
}

#[test]
fn teams_are_listed_for_their_members_only() {
    let db = TempDb::new();
    create_account(&db, "alice");
    create_account(&db, "bob");
    let created = run_command(
        &db,
        Some(1),
        &serde_json::json!({
            "domain": "organisation",
            "command": { "type": "CreateTeam", "name": "Breeding" }
        }),
    );
    assert_eq!(created["output"], "team");
    let team_id = created["value"]["team_id"].clone();

    let listed = run_json(["--db", db.arg(), "organisation", "list", "--user", "1"]);
    let organisations = listed["organisations"]
        .as_array()
        .unwrap_or_else(|| panic!("organisations should be an array: {listed}"));
    assert_eq!(organisations.len(), 1);
    assert_eq!(organisations[0]["value"]["root_id"], team_id);
    assert_eq!(organisations[0]["value"]["teams"][0]["name"], "Breeding");

    let hidden = run_json(["--db", db.arg(), "organisation", "list", "--user", "2"]);
    assert_eq!(hidden["organisations"], serde_json::json!([]));
}

#[test]
fn committed_entries_become_active() {
    let db = TempDb::new();
    create_account(&db, "alice");
    let term = run_command(
        &db,
        Some(1),
        &serde_json::json!({
            "domain": "ontology",
            "command": { "type": "CreateTerm", "name": "Plant height" }
        }),
    );
    assert_eq!(term["output"], "entry");
    assert_eq!(term["value"]["name"], "Plant height");

    let drafted = run_json(["--db", db.arg(), "ontology", "entries", "--label", "term"]);
    assert_eq!(drafted["entries"][0]["phase"], "DRAFT");

    let commit = run_command(
        &db,
        Some(1),
        &serde_json::json!({
            "domain": "ontology",
            "command": { "type": "CommitVersion", "version_change": "MAJOR", "comment": "first" }
        }),
    );
    assert_eq!(commit["output"], "commit");

    let active = run_json(["--db", db.arg(), "ontology", "entries", "--label", "TERM"]);
    let entries = active["entries"]
        .as_array()
        .unwrap_or_else(|| panic!("entries should be an array: {active}"));
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["name"], "Plant height");
    assert_eq!(entries[0]["phase"], "ACTIVE");

    let commits = run_json(["--db", db.arg(), "ontology", "commits"]);
    assert_eq!(commits["current_version"], "1.0.0");
}

#[test]
fn rejected_commands_exit_with_failure() {
    let db = TempDb::new();
    create_account(&db, "alice");
    let output = run_bg([
        "--db",
        db.arg(),
        "run",
        r#"{"domain":"account","command":{"type":"Create","name":"carol","email":"ALICE@example.org","password_hash":"h"}}"#,
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("exists"), "stderr should name the clash: {stderr}");

    let anonymous = run_bg([
        "--db",
        db.arg(),
        "run",
        r#"{"domain":"ontology","command":{"type":"CreateTerm","name":"Leaf"}}"#,
    ]);
    assert!(!anonymous.status.success());
}
