use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;

fn settlepay() -> Command {
    let mut cmd = Command::new(cargo_bin!("settlepay"));
    cmd.env_remove("SETTLEPAY_DB_PATH")
        .env_remove("SETTLEPAY_CONFIG")
        .env("RUST_LOG", "warn");
    cmd
}

#[test]
fn test_settle_prints_empty_batch_for_quiet_day() {
    settlepay()
        .args(["settle", "--date", "2024-01-15"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2024-01-15"))
        .stdout(predicate::str::contains("\"total_collected\""));
}

#[test]
fn test_export_writes_csv_header() {
    settlepay()
        .arg("export")
        .assert()
        .success()
        .stdout(predicate::str::starts_with(
            "id,batch,recipient,role,amount,state,attempts,transfer_reference,failure_reason,retry_after,updated_at",
        ));
}

#[test]
fn test_export_rejects_unknown_state() {
    settlepay()
        .args(["export", "--state", "bogus"])
        .assert()
        .failure();
}

#[test]
fn test_payouts_reports_counts() {
    settlepay()
        .arg("payouts")
        .assert()
        .success()
        .stdout(predicate::str::contains("started=0 blocked=0 failed_to_send=0 skipped=0"));
}

#[test]
fn test_requeue_unknown_line_item_fails() {
    settlepay()
        .args(["requeue", "00000000-0000-0000-0000-000000000000"])
        .assert()
        .failure();

    settlepay()
        .args(["requeue", "not-an-id"])
        .assert()
        .failure();
}

#[test]
fn test_invalid_settings_file_fails() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(config, "[payout]").unwrap();
    writeln!(config, "max_attempts = \"three\"").unwrap();

    settlepay()
        .arg("--config")
        .arg(config.path())
        .arg("export")
        .assert()
        .failure();
}
