//! Integration tests for drnet
//!
//! These tests render scripts and run them under a local `bash`, inside a
//! temporary directory. Units here only touch that directory, so nothing
//! needs privileges.
//!
//! ```bash
//! cargo test --test integration_tests
//! ```

#![allow(clippy::uninlined_format_args)]

use drnet::core::data::NetworkData;
use drnet::core::network::Network;
use drnet::core::profiles::ProfileRegistry;
use drnet::core::script::{Action, assemble};
use drnet::core::unit::{Outcome, Unit};
use drnet::transport::{CommandTransport, Target, Transport};
use std::path::Path;
use std::process::{Command, Stdio};

/// Runs a script under bash and returns its stdout.
fn run_bash(script: &str) -> String {
    use std::io::Write;

    let mut child = Command::new("bash")
        .arg("-s")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("bash should be available");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(script.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success(), "script exited with {}", output.status);
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// A unit asserting that `name` exists in `dir`
fn file_exists(dir: &Path, name: &str, precondition: &str) -> Unit {
    let path = dir.join(name);
    Unit::new(
        &format!("{name}_exists"),
        precondition,
        format!("touch '{}'", path.display()),
        format!("[ -e '{}' ] && echo yes || echo no", path.display()),
        "yes",
        Outcome::Pass,
        format!("{name} is missing"),
    )
}

/// A precondition that never holds
fn never() -> Unit {
    Unit::new("never", "", "false", "echo no", "yes", Outcome::Pass, "never holds")
}

#[test]
fn test_config_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let units = [file_exists(dir.path(), "marker", "")];
    let script = assemble("local", &units, Action::Config, false);

    let first = run_bash(&script);
    assert!(first.contains("Configuring marker_exists"));
    assert!(first.contains("passed=1 failed=0"));
    assert!(dir.path().join("marker").exists());

    let second = run_bash(&script);
    assert!(!second.contains("Configuring"));
    assert!(second.contains("passed=1 failed=0"));
}

#[test]
fn test_failed_precondition_blocks_remediation() {
    let dir = tempfile::tempdir().unwrap();
    let units = [never(), file_exists(dir.path(), "marker", "never")];
    let out = run_bash(&assemble("local", &units, Action::Config, false));

    assert!(out.contains("PRECONDITION FAILED never_audit"));
    assert!(out.contains("passed=0 failed=2"));
    assert!(out.contains("marker_exists skipped: precondition never failed"));
    assert!(!dir.path().join("marker").exists());
}

#[test]
fn test_disk_mounted_remediates_then_retests() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("mount.log");
    let units = [
        Unit::new("is_guest", "", "", "echo VirtualBox", "VirtualBox", Outcome::Pass, ""),
        Unit::new(
            "disk_mounted",
            "is_guest",
            format!("echo 'mount /dev/sdb1 /data' >> '{}'", log.display()),
            "mount | grep -F /drnet-test-never-mounted",
            "",
            Outcome::Fail,
            "disk missing",
        ),
    ];
    let out = run_bash(&assemble("local", &units, Action::Config, false));

    let configuring = out.find("Configuring disk_mounted").unwrap();
    let retesting = out.find("disk_mounted configured... Retesting").unwrap();
    assert!(configuring < retesting);
    assert!(!out.contains("PRECONDITION FAILED"));
    assert!(out.contains("disk_mounted_audit failed with the output"));
    assert!(std::fs::read_to_string(&log).unwrap().contains("mount /dev/sdb1 /data"));
}

#[test]
fn test_dry_run_never_remediates() {
    let dir = tempfile::tempdir().unwrap();
    let units = [file_exists(dir.path(), "marker", "")];
    let out = run_bash(&assemble("local", &units, Action::DryRun, false));

    assert!(out.contains("marker_exists DRYRUN, would run:"));
    assert!(out.contains("touch '"));
    assert!(!dir.path().join("marker").exists());
}

#[test]
fn test_quiet_hides_unit_lines() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("marker"), "").unwrap();
    let units = [file_exists(dir.path(), "marker", ""), never()];

    let loud = run_bash(&assemble("local", &units, Action::Audit, false));
    assert!(loud.contains("marker_exists_audit"));

    let quiet = run_bash(&assemble("local", &units, Action::Audit, true));
    assert!(!quiet.contains("✓"));
    assert!(!quiet.contains("❌"));
    assert!(quiet.contains("passed=1 failed=1"));
}

#[test]
fn test_compiled_scripts_are_valid_bash() {
    let data: NetworkData = serde_json::from_str(include_str!("../demos/office.json")).unwrap();
    let network = Network::compile(&data, &ProfileRegistry::with_builtins()).unwrap();
    for machine in network.machines() {
        for action in [Action::Audit, Action::Config, Action::DryRun] {
            let script = network.script(machine, action, false).unwrap();
            let status = Command::new("bash")
                .arg("-n")
                .arg("-c")
                .arg(&script)
                .status()
                .unwrap();
            assert!(status.success(), "{machine} {action} script does not parse");
        }
    }
}

#[tokio::test]
async fn test_command_transport_runs_device_script() {
    let data: NetworkData = serde_json::from_str(include_str!("../demos/office.json")).unwrap();
    let network = Network::compile(&data, &ProfileRegistry::with_builtins()).unwrap();
    // Devices carry no units, so their script runs anywhere
    let script = network.script("alice", Action::Audit, false).unwrap();

    let transport = CommandTransport::new("bash -s").unwrap();
    let out = transport
        .execute(&Target::new("alice", "localhost", 22), script)
        .await
        .unwrap();
    assert!(out.stdout.contains("with config label: alice"));
    assert_eq!(out.passed, Some(0));
    assert_eq!(out.failed, Some(0));
}
