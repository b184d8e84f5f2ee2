//! Tests spawning the `backup` binary.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

const BIN: &str = env!("CARGO_BIN_EXE_backup");

fn backup(work_dir: &Path, args: &[&str]) -> Output {
    Command::new(BIN)
        .current_dir(work_dir)
        .env_remove("BACKUP_DESTINATION")
        .args(args)
        .output()
        .expect("backup binary should start")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn help_lists_the_options() {
    let work = tempfile::tempdir().unwrap();
    let output = backup(work.path(), &["--help"]);

    assert!(output.status.success());
    let help = stdout(&output);
    for flag in ["--destination", "--db", "--user", "--config", "--status"] {
        assert!(help.contains(flag), "missing {flag} in:\n{help}");
    }
}

#[test]
fn db_without_user_is_a_usage_error() {
    let work = tempfile::tempdir().unwrap();
    let output = backup(work.path(), &["--db"]);

    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn path_and_db_conflict() {
    let work = tempfile::tempdir().unwrap();
    let output = backup(work.path(), &["some/file", "--db", "--user", "root"]);

    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn nothing_to_do_is_a_usage_error() {
    let work = tempfile::tempdir().unwrap();
    let output = backup(work.path(), &[]);

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Nothing to back up"));
    // the default config was written on the way
    assert!(work.path().join("backup.toml").exists());
}

#[test]
fn invalid_config_is_a_usage_error() {
    let work = tempfile::tempdir().unwrap();
    fs::write(work.path().join("backup.toml"), "parallelism = \"lots\"").unwrap();
    let output = backup(work.path(), &["whatever"]);

    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn missing_source_fails() {
    let work = tempfile::tempdir().unwrap();
    let output = backup(work.path(), &["does-not-exist.txt"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).contains("invalid target"), "{}", stdout(&output));
}

#[cfg(unix)]
#[test]
fn file_is_backed_up_into_the_working_directory() {
    let work = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let source = data.path().join("notes.txt");
    fs::write(&source, "buy milk").unwrap();

    let output = backup(work.path(), &[source.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(0), "{output:?}");
    assert!(stdout(&output).contains(": success -> "), "{}", stdout(&output));

    assert_eq!(
        fs::read_to_string(work.path().join("notes.txt.bak")).unwrap(),
        "buy milk"
    );
    let manifest = fs::read_to_string(work.path().join("backup-manifest.jsonl")).unwrap();
    assert_eq!(manifest.lines().count(), 1);
    assert!(manifest.contains("\"outcome\":\"success\""));

    let status = backup(work.path(), &[source.to_str().unwrap(), "--status"]);
    assert_eq!(status.status.code(), Some(0));
    assert!(stdout(&status).contains("last backup"), "{}", stdout(&status));
}

#[cfg(unix)]
#[test]
fn destination_flag_redirects_artifacts_and_manifest() {
    let work = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let source = data.path().join("site");
    fs::create_dir(&source).unwrap();
    fs::write(source.join("index.html"), "<p>hi</p>").unwrap();

    let output = backup(
        work.path(),
        &[source.to_str().unwrap(), "-d", dest.path().to_str().unwrap()],
    );
    assert_eq!(output.status.code(), Some(0), "{output:?}");
    assert_eq!(
        fs::read_to_string(dest.path().join("site.bak/index.html")).unwrap(),
        "<p>hi</p>"
    );
    assert!(dest.path().join("backup-manifest.jsonl").exists());
    assert!(!work.path().join("site.bak").exists());
}

#[test]
fn status_of_never_backed_up_target_fails() {
    let work = tempfile::tempdir().unwrap();
    let source = work.path().join("fresh.txt");
    fs::write(&source, "new").unwrap();

    let output = backup(work.path(), &["fresh.txt", "--status"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).contains("never backed up"));
}
