//! Integration tests for the wpool binary and the pool against real processes.
//!
//! The binary doubles as the worker under test: `wpool worker` is a persistent
//! echo worker, so every test here spawns real child processes.

use assert_cmd::Command;
use predicates::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;
use wpool::PoolError;
use wpool::config::WorkerPoolConfig;
use wpool::pool::{WorkerKey, WorkerPool};
use wpool::transport::CommandTransport;

const WPOOL: &str = env!("CARGO_BIN_EXE_wpool");

/// Get a command for the wpool binary.
fn wpool() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("wpool").unwrap()
}

fn echo_key(multiplex: bool) -> WorkerKey {
    let mut args = vec!["worker"];
    if multiplex {
        args.push("--multiplex");
    }
    WorkerKey::builder("Echo", WPOOL)
        .args(args)
        .multiplex(multiplex)
        .build()
}

fn pool(config: WorkerPoolConfig) -> WorkerPool {
    WorkerPool::new(config, Arc::new(CommandTransport::new())).unwrap()
}

fn multiplex_config(instances: usize) -> WorkerPoolConfig {
    let mut config = WorkerPoolConfig::default();
    config.multiplex_mnemonics.insert("Echo".into());
    config.max_multiplex_instances.default = instances;
    config.shutdown_grace_ms = 100;
    config
}

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[test]
fn test_help() {
    wpool()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("persistent build worker"));
}

#[test]
fn test_run_requires_worker_command() {
    wpool()
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_run_singleplex_keeps_input_order() {
    wpool()
        .args(["run", "--max-workers", "2", "--jobs", "3", "--", WPOOL, "worker"])
        .write_stdin("alpha beta\n\ngamma sleep=50\ndelta\n")
        .assert()
        .success()
        .stdout("alpha beta\t0\talpha beta\ngamma sleep=50\t0\tgamma sleep=50\ndelta\t0\tdelta\n");
}

#[test]
fn test_run_multiplex_keeps_input_order() {
    wpool()
        .args([
            "run",
            "--multiplex",
            "--max-multiplex-instances",
            "4",
            "--jobs",
            "4",
            "--",
            WPOOL,
            "worker",
            "--multiplex",
        ])
        .write_stdin("slow sleep=300\nfast\nmedium sleep=100\n")
        .assert()
        .success()
        .stdout("slow sleep=300\t0\tslow sleep=300\nfast\t0\tfast\nmedium sleep=100\t0\tmedium sleep=100\n");
}

#[test]
fn test_run_reports_worker_exit_code() {
    wpool()
        .args(["run", "--", WPOOL, "worker"])
        .write_stdin("build exit=5\n")
        .assert()
        .success()
        .stdout("build exit=5\t5\tbuild exit=5\n");
}

#[test]
fn test_run_crashing_worker_fails() {
    wpool()
        .args(["run", "--jobs", "1", "--", WPOOL, "worker"])
        .write_stdin("crash\nafter\n")
        .assert()
        .failure()
        .stdout(predicate::str::contains("crash\t-1\t"))
        .stdout(predicate::str::contains("after\t0\tafter"))
        .stderr(predicate::str::contains("1 of 2 requests failed"));
}

#[test]
fn test_run_missing_executable() {
    wpool()
        .args(["run", "--", "/nonexistent/worker-binary"])
        .write_stdin("x\n")
        .assert()
        .failure()
        .stdout(predicate::str::contains("Failed to start worker"));
}

#[test]
fn test_run_rejects_zero_quota() {
    wpool()
        .args(["run", "--max-workers", "0", "--", WPOOL, "worker"])
        .write_stdin("x\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("at least 1"));
}

#[test]
fn test_run_prints_stats() {
    wpool()
        .args(["run", "--stats", "--mnemonic", "Stats", "--", WPOOL, "worker"])
        .write_stdin("a\nb\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("\"mnemonic\": \"Stats\""))
        .stderr(predicate::str::contains("\"created\""));
}

#[test]
fn test_run_with_config_file_and_worker_logs() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("pool.json");
    let log_dir = dir.path().join("logs");
    std::fs::write(
        &config_path,
        format!(
            r#"{{"max_instances": {{"default": 1}}, "worker_log_dir": "{}"}}"#,
            log_dir.display()
        ),
    )
    .unwrap();

    wpool()
        .args(["run", "--config"])
        .arg(&config_path)
        .args(["--", WPOOL, "worker"])
        .write_stdin("one\ntwo\n")
        .assert()
        .success();

    let logs: Vec<_> = std::fs::read_dir(&log_dir).unwrap().collect();
    assert_eq!(logs.len(), 1, "one quota slot means one worker log");
}

#[test]
fn test_worker_speaks_json_lines() {
    wpool()
        .args(["worker", "--persistent_worker"])
        .write_stdin(
            "{\"type\":\"work\",\"request_id\":0,\"arguments\":[\"hi\",\"there\"]}\n\
             {\"type\":\"exit\"}\n",
        )
        .assert()
        .success()
        .stdout(predicate::str::contains("\"output\":\"hi there\""))
        .stdout(predicate::str::contains("\"request_id\":0"));
}

#[test]
fn test_worker_crash_exit_status() {
    wpool()
        .arg("worker")
        .write_stdin("{\"type\":\"work\",\"request_id\":0,\"arguments\":[\"crash\"]}\n")
        .assert()
        .code(3)
        .stdout(predicate::str::is_empty());
}

// ---------------------------------------------------------------------------
// Pool against real processes
// ---------------------------------------------------------------------------

#[test]
fn test_singleplex_process_is_reused() {
    let pool = pool(WorkerPoolConfig::default());
    let key = echo_key(false);

    let mut worker = pool.borrow_worker(&key).unwrap();
    let pid = worker.pid();
    assert_eq!(worker.do_work(vec!["first".into()]).unwrap().output, "first");
    pool.return_worker(&key, worker);

    let mut worker = pool.borrow_worker(&key).unwrap();
    assert_eq!(worker.pid(), pid);
    assert_eq!(worker.do_work(vec!["second".into()]).unwrap().output, "second");
    assert_eq!(worker.requests_served(), 2);
    pool.return_worker(&key, worker);
    pool.close();
}

#[test]
fn test_multiplex_correlates_concurrent_requests() {
    let pool = Arc::new(pool(multiplex_config(5)));
    let key = echo_key(true);

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let pool = pool.clone();
            let key = key.clone();
            thread::spawn(move || {
                let mut proxy = pool.borrow_worker(&key).unwrap();
                let args = vec![format!("request-{i}"), format!("sleep={}", (5 - i) * 60)];
                let output = proxy.do_work(args.clone()).unwrap();
                let pid = proxy.pid();
                pool.return_worker(&key, proxy);
                (args.join(" "), output.output, pid)
            })
        })
        .collect();

    let mut pids = HashSet::new();
    for handle in handles {
        let (expected, actual, pid) = handle.join().unwrap();
        assert_eq!(actual, expected);
        pids.insert(pid);
    }
    assert_eq!(pids.len(), 1, "all proxies share one process");
    pool.close();
}

#[test]
fn test_crashed_worker_is_replaced() {
    let pool = pool(WorkerPoolConfig::default());
    let key = echo_key(false);

    let mut worker = pool.borrow_worker(&key).unwrap();
    let pid = worker.pid();
    let err = worker.do_work(vec!["crash".into()]).unwrap_err();
    assert!(err.is_fatal(), "unexpected error {err}");
    assert!(!worker.is_alive());
    pool.invalidate_worker(worker);

    let mut fresh = pool.borrow_worker(&key).unwrap();
    assert_ne!(fresh.pid(), pid);
    assert_eq!(fresh.do_work(vec!["ok".into()]).unwrap().output, "ok");
    pool.return_worker(&key, fresh);
}

#[test]
fn test_multiplex_crash_fails_all_pending() {
    let pool = Arc::new(pool(multiplex_config(3)));
    let key = echo_key(true);

    let waiting: Vec<_> = (0..2)
        .map(|_| {
            let pool = pool.clone();
            let key = key.clone();
            thread::spawn(move || {
                let mut proxy = pool.borrow_worker(&key).unwrap();
                let result = proxy.do_work(vec!["sleep=2000".into()]);
                pool.invalidate_worker(proxy);
                result
            })
        })
        .collect();
    thread::sleep(std::time::Duration::from_millis(200));

    let mut crasher = pool.borrow_worker(&key).unwrap();
    assert!(crasher.do_work(vec!["crash".into()]).is_err());
    pool.invalidate_worker(crasher);

    for handle in waiting {
        assert!(matches!(handle.join().unwrap(), Err(PoolError::Transport(_))));
    }

    let mut fresh = pool.borrow_worker(&key).unwrap();
    assert_eq!(fresh.do_work(vec!["again".into()]).unwrap().output, "again");
    pool.return_worker(&key, fresh);
}

#[test]
fn test_reset_then_close() {
    let pool = pool(WorkerPoolConfig::default());
    let key = echo_key(false);

    let worker = pool.borrow_worker(&key).unwrap();
    let pid = worker.pid();
    pool.return_worker(&key, worker);

    pool.reset();
    assert!(pool.idle_workers().is_empty());
    let mut worker = pool.borrow_worker(&key).unwrap();
    assert_ne!(worker.pid(), pid);
    assert_eq!(worker.do_work(vec!["after-reset".into()]).unwrap().output, "after-reset");
    pool.return_worker(&key, worker);

    pool.close();
    assert!(matches!(pool.borrow_worker(&key), Err(PoolError::Closed)));
}

#[test]
fn test_spawn_failure_leaves_quota_untouched() {
    let pool = pool(WorkerPoolConfig::default());
    let key = WorkerKey::builder("Missing", "/nonexistent/worker-binary").build();

    assert!(matches!(
        pool.borrow_worker(&key),
        Err(PoolError::Spawn { .. })
    ));
    assert_eq!(pool.num_active(&key), 0);
    assert!(pool.has_available_quota(&key));
}

#[test]
fn test_evict_idle_real_worker() {
    let pool = pool(WorkerPoolConfig::default());
    let key = echo_key(false);

    let worker = pool.borrow_worker(&key).unwrap();
    let id = worker.id();
    pool.return_worker(&key, worker);

    let evicted = pool.evict_workers(&HashSet::from([id]));
    assert_eq!(evicted, HashSet::from([id]));
    assert!(pool.idle_workers().is_empty());

    let worker = pool.borrow_worker(&key).unwrap();
    assert_ne!(worker.id(), id);
    pool.return_worker(&key, worker);
}
