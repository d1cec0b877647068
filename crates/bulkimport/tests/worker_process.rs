//! Tests that launch the real `bulkimport-worker` binary.
//!
//! They share environment variables read by the spawned workers, so they
//! run serially.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;

use bulkimport::handler::builtin::ENV_SLOW_ROW_MS;
use bulkimport::store::NewJob;
use bulkimport::supervisor::{lock, KILLED_MESSAGE};
use bulkimport::{
    ImportRequest, JobStatus, ParseOptions, ProcessSupervisor, StartFailurePolicy, StartOutcome,
    SubmitError, Supervisor,
};
use common::{CsvBuilder, TestHarness};

const WAIT: Duration = Duration::from_secs(20);

fn slow_rows(ms: u64) {
    std::env::set_var(ENV_SLOW_ROW_MS, ms.to_string());
}

#[test]
#[serial]
fn test_submit_runs_worker_to_completion() {
    let harness = TestHarness::new();
    let path = harness.write_csv(
        "users.csv",
        &CsvBuilder::new()
            .header(&["id", "name", "email"])
            .numbered(25)
            .blank()
            .build(),
    );
    let importer = harness.importer();

    let job_id = importer
        .submit(ImportRequest::new(&path).owner(1).handler("echo").chunk_size(10))
        .unwrap();

    let job = harness.wait_for(&job_id, WAIT, |job| job.status.is_terminal());
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.errors);
    assert_eq!(job.total_data, 25);
    assert_eq!(job.counters.total_processed, 25);
    assert_eq!(job.counters.total_skip_empty_row, 1);
    assert!(harness.wait_for_unlock(&job_id, WAIT));
    assert!(lock::log_path(&harness.lock_dir, &job_id).exists());
    assert!(!importer.is_running(&job_id).unwrap());
}

#[test]
#[serial]
fn test_kill_processing_job() {
    slow_rows(50);
    let harness = TestHarness::new();
    let path = harness.write_csv("big.csv", &CsvBuilder::new().numbered(400).build());
    let importer = harness.importer();

    let job_id = importer
        .submit(
            ImportRequest::new(&path)
                .handler("slow")
                .skip_header(false)
                .chunk_size(5),
        )
        .unwrap();
    harness.wait_for_status(&job_id, JobStatus::Processing, WAIT);
    assert!(importer.is_running(&job_id).unwrap());

    assert!(importer.kill(&job_id).unwrap());

    let snapshot = importer.get_status(&job_id).unwrap().unwrap();
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.error_message.fatal.as_deref(), Some(KILLED_MESSAGE));
    assert!(snapshot.end_time.is_some());
    assert!(snapshot.total_process < 400);
    assert!(!harness.lock_file(&job_id).exists());
    assert!(!importer.is_running(&job_id).unwrap());

    // Killing a job that is no longer Processing is refused.
    assert!(!importer.kill(&job_id).unwrap());
}

#[test]
#[serial]
fn test_rapid_double_start_runs_once() {
    slow_rows(20);
    let harness = TestHarness::new();
    let path = harness.write_csv("twice.csv", &CsvBuilder::new().numbered(40).build());
    let store = harness.store();
    store
        .create(&NewJob {
            job_id: "csv_twice".to_string(),
            owner: None,
            filepath: path,
            filename: "twice.csv".to_string(),
            options: ParseOptions {
                skip_header: false,
                chunk_size: 10,
                ..Default::default()
            },
            handler: Some("slow".to_string()),
            dependencies: Vec::new(),
            display_id: None,
            total_data: 40,
        })
        .unwrap();
    let supervisor = Arc::new(ProcessSupervisor::new(
        Arc::new(harness.config.clone()),
        harness.store(),
    ));

    let outcomes: Vec<StartOutcome> = std::thread::scope(|scope| {
        let starts: Vec<_> = (0..2)
            .map(|_| {
                let supervisor = Arc::clone(&supervisor);
                scope.spawn(move || supervisor.start("csv_twice").unwrap())
            })
            .collect();
        starts.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let started = outcomes.iter().filter(|o| o.started()).count();
    assert_eq!(started, 1, "{:?}", outcomes);
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, StartOutcome::AlreadyRunning { .. })));

    let job = harness.wait_for("csv_twice", WAIT, |job| job.status.is_terminal());
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.total_processed, 40);
    assert!(harness.wait_for_unlock("csv_twice", WAIT));

    // Once finished, another start spawns a worker that finds nothing to do.
    let again = supervisor.start("csv_twice").unwrap();
    assert!(again.started());
    assert!(harness.wait_for_unlock("csv_twice", WAIT));
    assert_eq!(
        store.fetch("csv_twice").unwrap().unwrap().counters.total_processed,
        40
    );
}

#[test]
#[serial]
fn test_concurrency_ceiling_keeps_job_pending() {
    slow_rows(50);
    let mut harness = TestHarness::new();
    harness.config.max_concurrent_workers = 1;
    let busy = harness.write_csv("busy.csv", &CsvBuilder::new().numbered(400).build());
    let waiting = harness.write_csv("waiting.csv", &CsvBuilder::new().numbered(3).build());
    let importer = harness.importer();

    let first = importer
        .submit(ImportRequest::new(&busy).handler("slow").skip_header(false))
        .unwrap();
    harness.wait_for_status(&first, JobStatus::Processing, WAIT);

    let err = importer
        .submit(ImportRequest::new(&waiting).handler("echo").skip_header(false))
        .unwrap_err();
    let SubmitError::NotStarted { job_id, reason } = err else {
        panic!("expected NotStarted");
    };
    assert!(reason.contains("busy"), "{}", reason);
    assert_eq!(
        importer.get_status(&job_id).unwrap().unwrap().status,
        JobStatus::Pending
    );

    assert!(importer.kill(&first).unwrap());

    // With the slot free the pending job can be started later.
    assert!(importer.start_worker(&job_id).unwrap().started());
    let job = harness.wait_for(&job_id, WAIT, |job| job.status.is_terminal());
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.total_processed, 3);
}

#[test]
#[serial]
fn test_worker_exit_codes() {
    let harness = TestHarness::new();
    let worker = env!("CARGO_BIN_EXE_bulkimport-worker");

    let status = std::process::Command::new(worker)
        .arg("../escape")
        .env("BULKIMPORT_DATABASE", &harness.config.database_path)
        .env("BULKIMPORT_LOCK_DIR", &harness.lock_dir)
        .stderr(std::process::Stdio::null())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(2));

    let status = std::process::Command::new(worker)
        .arg("csv_does_not_exist")
        .env("BULKIMPORT_DATABASE", &harness.config.database_path)
        .env("BULKIMPORT_LOCK_DIR", &harness.lock_dir)
        .stderr(std::process::Stdio::null())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(2));
}

#[test]
#[serial]
fn test_worker_failing_at_startup_fails_submit() {
    let mut harness = TestHarness::new();
    harness.config.worker_program = "/bin/false".into();
    harness.config.startup_probe_ms = 300;
    harness.config.start_failure_policy = StartFailurePolicy::MarkFailed;
    let path = harness.write_csv("orders.csv", &CsvBuilder::new().numbered(3).build());
    let importer = harness.importer();

    let err = importer
        .submit(ImportRequest::new(&path).handler("echo").skip_header(false))
        .unwrap_err();
    let SubmitError::NotStarted { job_id, reason } = err else {
        panic!("expected NotStarted");
    };
    assert!(reason.contains("exit code 1"), "{}", reason);
    assert_eq!(
        importer.get_status(&job_id).unwrap().unwrap().status,
        JobStatus::Failed
    );
    assert!(!lock::lock_path(&harness.lock_dir, &job_id).exists());
}
