use assert_cmd::Command;
use predicates::str::contains;

#[test]
fn help_lists_subcommands() {
    Command::cargo_bin("orchestra-core")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("run"))
        .stdout(contains("status"))
        .stdout(contains("plan"));
}

#[test]
fn run_without_token_fails_with_config_error() {
    Command::cargo_bin("orchestra-core")
        .unwrap()
        .env_remove("ORCHESTRA_TOKEN")
        .args(["run", "epic-1"])
        .assert()
        .failure()
        .stderr(contains("ORCHESTRA_TOKEN"));
}
