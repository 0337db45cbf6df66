//! End-to-end tests of the `plinth` binary with real worker processes.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use plinth_test::{Fixture, PluginDir, build_all_fixtures, fixture_config, wait_for_file};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(30);

fn plinth() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_plinth"));
    cmd.env("NO_COLOR", "1")
        .env_remove("PLINTH_CONFIG")
        .env_remove("PLINTH_PLUGIN_DIRECTORY")
        .env_remove("PLINTH_CUSTOM_CONFIG")
        .env_remove("PLINTH_WORKER_PROGRAM")
        .stdin(Stdio::null());
    cmd
}

/// Write a config file for `dir` with fixture output going to `out`.
fn write_config(scratch: &TempDir, dir: &Path, out: &Path, work_limit: u32) -> PathBuf {
    let path = scratch.path().join("plinth.toml");
    let contents = format!(
        "[plugins]\ndirectory = \"{}\"\ncustom_config = '{}'\n\n\
         [workers]\npoll_interval_ms = 20\nshutdown_timeout_secs = 2\n",
        dir.display(),
        fixture_config(out, work_limit)
    );
    std::fs::write(&path, contents).unwrap();
    path
}

fn wait_with_timeout(child: &mut Child) -> ExitStatus {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("plinth did not exit within {TIMEOUT:?}");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn stdout_of(child: &mut Child) -> String {
    let mut out = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        stdout.read_to_string(&mut out).unwrap();
    }
    out
}

fn send_signal(child: &Child, signal: &str) {
    let sent = Command::new("kill")
        .args([signal, &child.id().to_string()])
        .status()
        .unwrap();
    assert!(sent.success());
}

#[test]
fn test_run_loads_inline_and_background_plugins() {
    build_all_fixtures();
    let scratch = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dir = PluginDir::new();
    dir.install(Fixture::Inline, "greeter.so");
    let alpha_path = dir.install(Fixture::Background, "alpha.so");
    let beta_path = dir.install(Fixture::Background, "beta.so");
    dir.touch("README.txt");
    let config = write_config(&scratch, dir.path(), out.path(), 5);

    let mut child = plinth()
        .arg("--config")
        .arg(&config)
        .args(["run", "--exit-when-idle"])
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let host_pid = child.id().to_string();
    let status = wait_with_timeout(&mut child);
    let stdout = stdout_of(&mut child);
    assert!(status.success(), "plinth run failed: {stdout}");

    assert!(stdout.contains("3 loaded, 0 skipped"), "{stdout}");
    assert!(stdout.contains("2 background worker(s) started"), "{stdout}");

    let inline = wait_for_file(&out.path().join("greeter.so.inline"), TIMEOUT);
    assert_eq!(inline.lines().nth(3), Some(host_pid.as_str()));
    assert!(out.path().join("greeter.so.cleanup").exists());

    // Each worker saw its own slot; the owner pid is the host's.
    for (name, path) in [("alpha.so", &alpha_path), ("beta.so", &beta_path)] {
        let seen = wait_for_file(&out.path().join(format!("{name}.seen")), TIMEOUT);
        let lines: Vec<&str> = seen.lines().collect();
        assert_eq!(lines[0], name);
        assert_eq!(Path::new(lines[1]), path.as_path());
        assert_eq!(lines[3], host_pid);
        assert_eq!(
            wait_for_file(&out.path().join(format!("{name}.count")), TIMEOUT),
            "5\n"
        );
    }
}

#[test]
fn test_sigterm_shuts_down_running_workers() {
    build_all_fixtures();
    let scratch = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dir = PluginDir::new();
    dir.install(Fixture::Background, "forever.so");
    let config = write_config(&scratch, dir.path(), out.path(), 1_000_000);

    let mut child = plinth()
        .arg("--config")
        .arg(&config)
        .arg("run")
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    wait_for_file(&out.path().join("forever.so.seen"), TIMEOUT);

    send_signal(&child, "-TERM");

    let status = wait_with_timeout(&mut child);
    let stdout = stdout_of(&mut child);
    assert!(status.success(), "plinth run failed: {stdout}");
    assert!(stdout.contains("Shutting down"), "{stdout}");
    assert!(!stdout.contains("killed after the grace period"), "{stdout}");
    assert!(!out.path().join("forever.so.count").exists());
}

#[test]
fn test_sighup_reloads_config_and_rescans() {
    build_all_fixtures();
    let scratch = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dir = PluginDir::new();
    dir.install(Fixture::Background, "first.so");
    let config = write_config(&scratch, dir.path(), out.path(), 1_000_000);

    let mut child = plinth()
        .arg("--config")
        .arg(&config)
        .arg("run")
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    wait_for_file(&out.path().join("first.so.seen"), TIMEOUT);

    dir.install(Fixture::Background, "second.so");
    write_config(&scratch, dir.path(), out.path(), 3);
    send_signal(&child, "-HUP");

    assert_eq!(
        wait_for_file(&out.path().join("second.so.count"), TIMEOUT),
        "3\n"
    );
    let first = wait_for_file(&out.path().join("first.so.seen"), TIMEOUT);
    let second = wait_for_file(&out.path().join("second.so.seen"), TIMEOUT);
    assert_eq!(
        first.lines().nth(2),
        Some(fixture_config(out.path(), 1_000_000).as_str())
    );
    assert_eq!(
        second.lines().nth(2),
        Some(fixture_config(out.path(), 3).as_str())
    );

    send_signal(&child, "-TERM");
    let status = wait_with_timeout(&mut child);
    let stdout = stdout_of(&mut child);
    assert!(status.success(), "{stdout}");
    assert!(stdout.contains("SKIP first.so"), "{stdout}");
}

#[test]
fn test_run_without_directory_loads_nothing() {
    let mut child = plinth()
        .args(["run", "--exit-when-idle"])
        .env("PLINTH_CONFIG", "/nonexistent/plinth.toml")
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let status = wait_with_timeout(&mut child);
    // A missing config file is an error, not an empty host.
    assert!(!status.success());

    let scratch = tempfile::tempdir().unwrap();
    let config = scratch.path().join("plinth.toml");
    std::fs::write(&config, "[plugins]\ndirectory = \"\"\n").unwrap();
    let mut child = plinth()
        .arg("--config")
        .arg(&config)
        .args(["run", "--exit-when-idle"])
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let status = wait_with_timeout(&mut child);
    let stdout = stdout_of(&mut child);
    assert!(status.success(), "{stdout}");
    assert!(stdout.contains("0 loaded, 0 skipped"), "{stdout}");
}

#[test]
fn test_check_reports_missing_entry_points() {
    build_all_fixtures();
    let dir = PluginDir::new();
    dir.install(Fixture::Inline, "good.so");
    dir.install(Fixture::Partial, "partial.so");
    dir.touch("libstatic.a");

    let output = plinth().arg("check").arg(dir.path()).output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!output.status.success());
    assert!(stdout.contains("OK good.so"), "{stdout}");
    assert!(stdout.contains("FAIL partial.so"), "{stdout}");
    assert!(stdout.contains("plugin_get_type, plugin_work"), "{stdout}");
    assert!(!stdout.contains("libstatic.a"), "{stdout}");
}

#[test]
fn test_check_does_not_invoke_plugins() {
    build_all_fixtures();
    let out = tempfile::tempdir().unwrap();
    let dir = PluginDir::new();
    dir.install(Fixture::Inline, "greeter.so");
    dir.install(Fixture::Reject, "reject.so");

    let output = plinth()
        .arg("check")
        .arg(dir.path())
        .env("PLINTH_CUSTOM_CONFIG", fixture_config(out.path(), 1))
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    // Both export all four entry points; init is never called.
    assert!(output.status.success(), "{stdout}");
    assert!(stdout.contains("All 2 plugin(s) conform."), "{stdout}");
    assert!(!out.path().join("greeter.so.inline").exists());
}

#[test]
fn test_worker_without_store_exits_with_slot_missing() {
    let status = plinth()
        .args(["worker", "--store", "/plinth-does-not-exist", "--slot", "0"])
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}
