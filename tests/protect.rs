#![cfg(unix)]

mod common;

use common::{Fixture, calls_of};
use predicates::prelude::*;
use std::fs;

#[test]
fn protect_creates_recovery_file() {
    let fixture = Fixture::with_photos();

    fixture
        .cmd()
        .args(["protect", "photos"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created successfully"))
        .stdout(predicate::str::contains("100.0%"))
        .stdout(predicate::str::contains("50.0%").not());

    assert!(fixture.storage().join("photos/photos.par2").is_file());

    let calls = fixture.engine_calls();
    let creates = calls_of(&calls, "create");
    assert_eq!(creates.len(), 1);
    assert!(creates[0].starts_with("create /rr10 "));
    assert!(creates[0].ends_with(&format!("{}/photos/*", fixture.work.display())));
}

#[test]
fn status_shows_protected_directories() {
    let fixture = Fixture::with_photos();
    fixture.write("other/c.txt", "c");
    fixture.run_ok(&["protect", "photos"]);

    fixture
        .cmd()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("[-] unknown  ."))
        .stdout(predicate::str::contains("[x] unknown  photos"))
        .stdout(predicate::str::contains("other").not())
        .stdout(predicate::str::contains("No recovery files for this directory"));

    fixture
        .cmd()
        .args(["status", "photos", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "[ ] unknown  photos/sub (inside protected directory)",
        ))
        .stdout(predicate::str::contains(
            "In this directory\nUnverified: 1\n\nIn subdirectories\nUnverified: 1",
        ));
}

#[test]
fn protect_remembers_redundancy() {
    let fixture = Fixture::with_photos();

    fixture.run_ok(&["protect", "photos", "--redundancy", "25"]);

    let settings = fs::read_to_string(&fixture.config).unwrap();
    assert!(settings.contains("redundancy_percent = 25.0"), "{settings}");

    fixture.write("more/x.txt", "x");
    fixture.run_ok(&["protect", "more"]);

    let calls = fixture.engine_calls();
    let creates = calls_of(&calls, "create");
    assert!(creates[0].starts_with("create /rr25 "));
    assert!(creates[1].starts_with("create /rr25 "));
}

#[test]
fn invalid_redundancy_is_rejected() {
    let fixture = Fixture::with_photos();

    fixture
        .cmd()
        .args(["protect", "photos", "--redundancy", "5000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Redundancy must be between"));

    assert!(fixture.engine_calls().is_empty());
}

#[test]
fn failed_protect_is_reverted() {
    let fixture = Fixture::with_photos();

    fixture
        .cmd()
        .env("PARTREE_FAKE_CREATE_EXIT", "1")
        .args(["protect", "photos"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("create failed"));

    assert!(!fixture.storage().join("photos").exists());

    fixture
        .cmd()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("[ ] unknown  ."));
}

#[test]
fn nested_protect_is_rejected() {
    let fixture = Fixture::with_photos();
    fixture.run_ok(&["protect", "photos"]);

    fixture
        .cmd()
        .args(["protect", "photos/sub"])
        .assert()
        .code(255)
        .stderr(predicate::str::contains("inside protected directory"));
}

#[test]
fn protecting_parent_replaces_nested_recovery_data() {
    let fixture = Fixture::with_photos();
    fixture.run_ok(&["protect", "photos/sub"]);
    assert!(fixture.storage().join("photos/sub/sub.par2").is_file());

    fixture.run_ok(&["protect", "photos"]);

    assert!(fixture.storage().join("photos/photos.par2").is_file());
    assert!(!fixture.storage().join("photos/sub").exists());
}

#[test]
fn unprotect_deletes_recovery_data() {
    let fixture = Fixture::with_photos();
    fixture.run_ok(&["protect", "photos"]);

    fixture.run_ok(&["unprotect", "photos"]);

    assert!(!fixture.storage().join("photos").exists());
}

#[test]
fn clean_removes_unused_recovery_files() {
    let fixture = Fixture::with_photos();
    fixture.run_ok(&["protect", "photos"]);

    let stray = fixture.storage().join("photos/sub");
    fs::create_dir_all(&stray).unwrap();
    fs::write(stray.join("sub.par2"), "leftover").unwrap();

    fixture
        .cmd()
        .args(["-v", "clean"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Deleted 1 unused recovery files"));

    assert!(!stray.exists());
    assert!(fixture.storage().join("photos/photos.par2").is_file());
}

#[test]
fn recreate_rebuilds_existing_recovery_files() {
    let fixture = Fixture::with_photos();
    fixture.run_ok(&["protect", "photos"]);
    fixture.write("photos/c.jpg", "third photo");

    fixture
        .cmd()
        .arg("new-files")
        .assert()
        .success()
        .stdout(predicate::str::diff("photos/c.jpg\n"));

    fixture.run_ok(&["recreate"]);

    fixture
        .cmd()
        .arg("new-files")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
    assert_eq!(calls_of(&fixture.engine_calls(), "create").len(), 2);
}

#[test]
fn missing_engine_is_an_error() {
    let fixture = Fixture::with_photos();

    fs::remove_file(&fixture.engine).unwrap();

    fixture
        .cmd()
        .args(["protect", "photos"])
        .assert()
        .code(255)
        .stderr(predicate::str::contains("Unable to start recovery engine"));

    assert!(!fixture.storage().join("photos").exists());
}
