use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn prints_version() {
    Command::cargo_bin("pourover")
        .expect("pourover binary")
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn prints_help() {
    Command::cargo_bin("pourover")
        .expect("pourover binary")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("pourover"))
        .stdout(predicate::str::contains("--version"))
        .stdout(predicate::str::contains("preview"))
        .stdout(predicate::str::contains("create-channel"));
}

#[test]
fn unknown_command_fails() {
    Command::cargo_bin("pourover")
        .expect("pourover binary")
        .arg("frobnicate")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("frobnicate"));
}

#[test]
fn whoami_without_login_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    Command::cargo_bin("pourover")
        .expect("pourover binary")
        .env("POUROVER_STORAGE__PATH", dir.path().join("state.db"))
        .env("POUROVER_API__BASE_URL", "http://127.0.0.1:9/api/")
        .arg("whoami")
        .arg("--config")
        .arg(dir.path().join("missing.yaml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("not logged in"));
}
