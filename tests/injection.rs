#![cfg(target_os = "macos")]

use mach_inject::InjectError;

#[test]
fn rejects_a_path_that_does_not_exist() {
    let err = mach_inject::inject(std::process::id() as i32, "/nonexistent/path/to/lib.dylib")
        .expect_err("a nonexistent dylib path must not canonicalize");

    assert!(matches!(err, InjectError::InvalidArgument(_)));
}

#[test]
fn rejects_a_pid_that_does_not_exist() {
    let dylib = tempfile::NamedTempFile::new().expect("create scratch file");

    // No real process should ever hold this pid; task_for_pid must fail.
    let err = mach_inject::inject(999_999, dylib.path()).expect_err("pid must not resolve");

    assert!(matches!(err, InjectError::Kernel(_)));
}

/// Full happy path: spawn a child, inject a real dylib into it, and confirm
/// its constructor ran by waiting for the side-effect file it writes. Needs
/// `task_for_pid` entitlements CI usually doesn't grant, so this is opt-in.
#[test]
#[ignore = "requires task_for_pid entitlements not available in ordinary CI"]
fn injects_a_real_dylib_into_a_child_process() {
    use std::process::Command;
    use std::time::{Duration, Instant};

    let marker = tempfile::NamedTempFile::new().expect("create marker file");
    let dylib_path =
        std::env::var("MACH_INJECT_TEST_DYLIB").expect("MACH_INJECT_TEST_DYLIB must point at a fixture dylib");

    let mut child = Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn child process");

    let result = mach_inject::inject(child.id() as i32, &dylib_path);

    let deadline = Instant::now() + Duration::from_secs(5);
    let saw_marker = loop {
        if marker.path().metadata().map(|m| m.len() > 0).unwrap_or(false) {
            break true;
        }
        if Instant::now() > deadline {
            break false;
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    let _ = child.kill();
    let _ = child.wait();

    result.expect("injection should succeed");
    assert!(saw_marker, "injected dylib's constructor never wrote its marker");
}
