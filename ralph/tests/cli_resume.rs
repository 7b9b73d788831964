//! CLI tests for `ralph resume`.
//!
//! Spawns the ralph binary against an isolated registry file
//! (`RALPH_REGISTRY_PATH`) and verifies output and exit codes for listing,
//! cleanup and every resolution outcome.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use ralph::core::types::{SessionRegistryEntry, SessionStatus};
use ralph::exit_codes;
use ralph::io::registry::SessionRegistry;
use ralph::io::session_state::FsSessionStore;
use ralph::test_support::write_session_file;

const ID: &str = "a1b2c3d4-e5f6-7890-abcd-ef1234567890";

struct Fixture {
    _temp: tempfile::TempDir,
    /// Canonical temp root, so paths match the child's current directory.
    root: PathBuf,
    registry: SessionRegistry,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().canonicalize().expect("canonical tempdir");
        let registry = SessionRegistry::new(root.join("config/sessions.json"), FsSessionStore);
        Self {
            _temp: temp,
            root,
            registry,
        }
    }

    /// A project directory, optionally with persisted session state.
    fn project(&self, name: &str, persisted: bool) -> PathBuf {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).expect("project dir");
        if persisted {
            write_session_file(&dir);
        }
        dir
    }

    fn register(&self, id: &str, cwd: &Path, status: SessionStatus) {
        let mut entry = SessionRegistryEntry::new(id, cwd, "opencode", "beads");
        entry.status = status;
        self.registry.register_session(entry).expect("register");
    }

    fn resume(&self, cwd: &Path, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_ralph"))
            .current_dir(cwd)
            .env("RALPH_REGISTRY_PATH", self.registry.registry_file_path())
            .env_remove("RUST_LOG")
            .arg("resume")
            .args(args)
            .output()
            .expect("ralph resume")
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn list_with_empty_registry_suggests_run() {
    let fx = Fixture::new();
    let output = fx.resume(&fx.root, &["--list"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let out = stdout(&output);
    assert!(out.contains("No resumable sessions found"));
    assert!(out.contains("ralph run"));
}

#[test]
fn list_shows_only_resumable_sessions() {
    let fx = Fixture::new();
    let live = fx.project("live", true);
    let done = fx.project("done", true);
    let stale = fx.project("stale", false);
    fx.register(ID, &live, SessionStatus::Paused);
    fx.register("b2c3d4e5-0000", &done, SessionStatus::Completed);
    fx.register("c3d4e5f6-0000", &stale, SessionStatus::Paused);

    let output = fx.resume(&fx.root, &["-l"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let out = stdout(&output);
    assert!(out.contains("Resumable sessions"));
    assert!(out.contains("1. ⏸ a1b2c3d4"));
    assert!(!out.contains("b2c3d4e5"));
    assert!(!out.contains("c3d4e5f6"));
}

#[test]
fn resumes_by_prefix_from_any_directory() {
    let fx = Fixture::new();
    let project = fx.project("project", true);
    let elsewhere = fx.project("elsewhere", false);
    fx.register(ID, &project, SessionStatus::Paused);

    let output = fx.resume(&elsewhere, &["a1b2c3d4", "--headless"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{}", stderr(&output));
    assert_eq!(stdout(&output).trim_end(), project.display().to_string());
}

#[test]
fn resumes_session_in_current_directory() {
    let fx = Fixture::new();
    let project = fx.project("project", true);
    fx.register(ID, &project, SessionStatus::Interrupted);

    let output = fx.resume(&project, &[]);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("Resuming session a1b2c3d4 (interrupted)"));
}

#[test]
fn resumes_unregistered_session_via_cwd_flag() {
    let fx = Fixture::new();
    let project = fx.project("project", true);

    let output = fx.resume(&fx.root, &["--cwd", project.to_str().expect("utf8"), "--headless"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{}", stderr(&output));
    assert_eq!(stdout(&output).trim_end(), project.display().to_string());
}

#[test]
fn ambiguous_prefix_exits_with_ambiguous_code() {
    let fx = Fixture::new();
    let p1 = fx.project("p1", true);
    let p2 = fx.project("p2", true);
    fx.register("a1b2c3d4-0001", &p1, SessionStatus::Paused);
    fx.register("a1b2c3d5-0002", &p2, SessionStatus::Paused);

    let output = fx.resume(&fx.root, &["a1b2c3d"]);
    assert_eq!(output.status.code(), Some(exit_codes::AMBIGUOUS));
    let err = stderr(&output);
    assert!(err.contains("Multiple sessions match prefix 'a1b2c3d'"));
    assert!(err.contains("a1b2c3d4-0001"));
    assert!(err.contains("a1b2c3d5-0002"));
    assert!(err.contains("Please provide a more specific session ID."));
}

#[test]
fn unknown_id_reports_not_found() {
    let fx = Fixture::new();
    let output = fx.resume(&fx.root, &["nonexistent"]);
    assert_eq!(output.status.code(), Some(exit_codes::NO_SESSION));
    assert!(stderr(&output).contains("not found in registry"));
}

#[test]
fn stale_entry_for_cwd_points_at_cleanup() {
    let fx = Fixture::new();
    let project = fx.project("project", false);
    fx.register(ID, &project, SessionStatus::Paused);

    let output = fx.resume(&project, &[]);
    assert_eq!(output.status.code(), Some(exit_codes::NO_SESSION));
    let err = stderr(&output);
    assert!(err.contains("Session file not found"));
    assert!(err.contains("ralph resume --cleanup"));
}

#[test]
fn running_session_requires_force() {
    let fx = Fixture::new();
    let project = fx.project("project", true);
    fx.register(ID, &project, SessionStatus::Running);

    let refused = fx.resume(&project, &[]);
    assert_eq!(refused.status.code(), Some(exit_codes::INVALID));
    assert!(stderr(&refused).contains("--force"));

    let forced = fx.resume(&project, &["--force", "--headless"]);
    assert_eq!(forced.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout(&forced).trim_end(), project.display().to_string());
}

#[test]
fn cleanup_removes_stale_entries() {
    let fx = Fixture::new();
    let live = fx.project("live", true);
    let gone = fx.project("gone", false);
    fx.register(ID, &live, SessionStatus::Paused);
    fx.register("deadbeef-0000", &gone, SessionStatus::Paused);

    let output = fx.resume(&fx.root, &["--cleanup"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let out = stdout(&output);
    assert!(out.contains("Cleaning up stale session registry entries"));
    assert!(out.contains("Removed 1 stale session from registry"));
    assert!(out.contains(&fx.registry.registry_file_path().display().to_string()));

    assert!(fx.registry.get_session_by_id("deadbeef-0000").expect("get").is_none());
    assert!(fx.registry.get_session_by_id(ID).expect("get").is_some());

    let again = fx.resume(&fx.root, &["--cleanup"]);
    assert!(stdout(&again).contains("No stale entries found"));
}

#[test]
fn corrupt_registry_is_fatal() {
    let fx = Fixture::new();
    let path = fx.registry.registry_file_path();
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, "not json").expect("write");

    let output = fx.resume(&fx.root, &["--list"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(stderr(&output).contains("corrupt"));
}

#[test]
fn help_explains_cross_directory_resume() {
    let fx = Fixture::new();
    let output = fx.resume(&fx.root, &["--help"]);
    assert_eq!(output.status.code(), Some(0));
    let out = stdout(&output);
    for needle in [
        "SESSION_ID",
        "--list",
        "-l",
        "--cleanup",
        "--headless",
        "--force",
        "--cwd",
        "Examples:",
        "Cross-directory",
        "registry",
        "paused",
        "running",
        "interrupted",
    ] {
        assert!(out.contains(needle), "missing {needle} in help:\n{out}");
    }
}
