//! Integration tests for the stepwright CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a stepwright Command isolated in `dir`
fn stepwright(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("stepwright");
    cmd.current_dir(dir.path())
        .env_remove("STEPWRIGHT_ENGINE_URL")
        .env_remove("STEPWRIGHT_SEAL_KEY")
        .env_remove("STEPWRIGHT_CALLBACK_KEY")
        .env_remove("STEPWRIGHT_PORT")
        .env_remove("RUST_LOG");
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn write_json(dir: &TempDir, name: &str, value: serde_json::Value) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, value.to_string()).unwrap();
    path
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = create_temp_project();
        stepwright(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("validate"));
    }

    #[test]
    fn test_version() {
        let dir = create_temp_project();
        stepwright(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_command_fails() {
        let dir = create_temp_project();
        stepwright(&dir).arg("teleport").assert().failure();
    }
}

// =============================================================================
// Config Tests
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_init_creates_file() {
        let dir = create_temp_project();
        stepwright(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created stepwright.toml"));

        let path = dir.path().join(".stepwright/stepwright.toml");
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("[engine]"));
        assert!(content.contains("port = 3141"));
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = create_temp_project();
        stepwright(&dir).args(["config", "init"]).assert().success();
        stepwright(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_show_redacts_secrets() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".stepwright")).unwrap();
        fs::write(
            dir.path().join(".stepwright/stepwright.toml"),
            "[server]\nport = 4000\n\n[sealing]\nkey = \"c2VjcmV0\"\n",
        )
        .unwrap();

        stepwright(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 4000"))
            .stdout(predicate::str::contains("key = (set)"))
            .stdout(predicate::str::contains("c2VjcmV0").not());
    }

    #[test]
    fn test_config_validate_warns_on_defaults() {
        let dir = create_temp_project();
        stepwright(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No sealing key configured"));
    }

    #[test]
    fn test_env_override_is_shown() {
        let dir = create_temp_project();
        stepwright(&dir)
            .args(["config", "show"])
            .env("STEPWRIGHT_ENGINE_URL", "http://engine.internal:9000")
            .assert()
            .success()
            .stdout(predicate::str::contains("http://engine.internal:9000"));
    }

    #[test]
    fn test_malformed_config_fails() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".stepwright")).unwrap();
        fs::write(dir.path().join(".stepwright/stepwright.toml"), "[server\nport = ").unwrap();
        stepwright(&dir).arg("sweep").assert().failure();
    }
}

// =============================================================================
// Database Tests
// =============================================================================

mod database {
    use super::*;

    #[test]
    fn test_init_db_creates_database() {
        let dir = create_temp_project();
        stepwright(&dir)
            .arg("init-db")
            .assert()
            .success()
            .stdout(predicate::str::contains("Editing database initialized"));
        assert!(dir.path().join(".stepwright/stepwright.db").exists());
    }

    #[test]
    fn test_init_db_custom_path() {
        let dir = create_temp_project();
        stepwright(&dir)
            .args(["init-db", "--db-path", "data/edit.db"])
            .assert()
            .success();
        assert!(dir.path().join("data/edit.db").exists());
    }

    #[test]
    fn test_sweep_requires_database() {
        let dir = create_temp_project();
        stepwright(&dir)
            .arg("sweep")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No database"));
    }

    #[test]
    fn test_sweep_on_fresh_database() {
        let dir = create_temp_project();
        stepwright(&dir).arg("init-db").assert().success();
        stepwright(&dir)
            .arg("sweep")
            .assert()
            .success()
            .stdout(predicate::str::contains("No expired editing sessions"));
    }
}

// =============================================================================
// Correction Set Validation Tests
// =============================================================================

mod validate {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_correction_set() {
        let dir = create_temp_project();
        let path = write_json(
            &dir,
            "set.json",
            json!({"steps": [
                {"step_order": 0, "page_url": "https://x.test/login", "form_type": "login",
                 "fields": [
                    {"field_name": "user", "sort_order": 0},
                    {"field_name": "password", "is_sensitive": true, "sort_order": 1}
                 ]},
                {"step_order": 1, "depends_on_step_order": 0, "page_url": "https://x.test/apply"}
            ]}),
        );
        stepwright(&dir)
            .arg("validate")
            .arg(&path)
            .assert()
            .success()
            .stdout(predicate::str::contains("2 step(s), no problems found"));
    }

    #[test]
    fn test_cycle_is_reported() {
        let dir = create_temp_project();
        let path = write_json(
            &dir,
            "cycle.json",
            json!({"steps": [
                {"step_order": 1, "depends_on_step_order": 2},
                {"step_order": 2, "depends_on_step_order": 1}
            ]}),
        );
        stepwright(&dir)
            .arg("validate")
            .arg(&path)
            .assert()
            .failure()
            .stdout(predicate::str::contains("dependency cycle"));
    }

    #[test]
    fn test_structural_problems_are_all_reported() {
        let dir = create_temp_project();
        let path = write_json(
            &dir,
            "broken.json",
            json!({"steps": [
                {"step_order": 0, "depends_on_step_order": 0},
                {"step_order": 1, "depends_on_step_order": 7},
                {"step_order": 1}
            ]}),
        );
        stepwright(&dir)
            .arg("validate")
            .arg(&path)
            .assert()
            .failure()
            .stdout(predicate::str::contains("depends on itself"))
            .stdout(predicate::str::contains("unknown step order 7"))
            .stdout(predicate::str::contains("used by another step"));
    }

    #[test]
    fn test_empty_set_fails() {
        let dir = create_temp_project();
        let path = write_json(&dir, "empty.json", json!({"steps": []}));
        stepwright(&dir)
            .arg("validate")
            .arg(&path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("no steps"));
    }

    #[test]
    fn test_missing_file_fails() {
        let dir = create_temp_project();
        stepwright(&dir)
            .args(["validate", "nope.json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to read"));
    }
}
