use assert_cmd::Command;
use predicates::prelude::*;

const STATIC_CONFIG: &str = r#"
[farm]
max_concurrent_acquisitions = 2

[provider]
type = "static"

[[provider.guests]]
hostname = "10.0.0.5"
arch = "x86_64"
compose = "RHEL-9.4"
"#;

const SCHEDULE: &str = r#"
[[entries]]
id = "server"
arch = "x86_64"
compose = "RHEL-9.4"
group = "pair"
role = "primary"

[[entries]]
id = "client"
arch = "x86_64"
compose = "RHEL-9.4"
group = "pair"
"#;

fn guestfarm() -> Command {
    Command::cargo_bin("guestfarm").unwrap()
}

#[test]
fn validate_accepts_config_and_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("guestfarm.toml");
    let schedule = dir.path().join("schedule.toml");
    std::fs::write(&config, STATIC_CONFIG).unwrap();
    std::fs::write(&schedule, SCHEDULE).unwrap();

    guestfarm()
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .arg("--schedule")
        .arg(&schedule)
        .assert()
        .success()
        .stdout(predicate::str::contains("Max concurrent acquisitions: 2"))
        .stdout(predicate::str::contains("Provider: static"))
        .stdout(predicate::str::contains("Schedule is valid: 2 entries"));
}

#[test]
fn validate_rejects_duplicate_entries() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("guestfarm.toml");
    let schedule = dir.path().join("schedule.toml");
    std::fs::write(&config, STATIC_CONFIG).unwrap();
    std::fs::write(&schedule, SCHEDULE.replace("\"client\"", "\"server\"")).unwrap();

    guestfarm()
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .arg("--schedule")
        .arg(&schedule)
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate schedule entry id"));
}

#[test]
fn validate_reports_missing_config() {
    let dir = tempfile::tempdir().unwrap();

    guestfarm()
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn init_writes_a_loadable_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("guestfarm.toml");

    guestfarm()
        .arg("--config")
        .arg(&config)
        .args(["init", "--provider", "static"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created"));

    guestfarm()
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Provider: static"));

    guestfarm()
        .arg("--config")
        .arg(&config)
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}
