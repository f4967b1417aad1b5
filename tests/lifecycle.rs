mod common;

use std::time::{Duration, Instant};

use common::{echo_spec, fast_settings, host, launches, new_key, wait_for_record};
use mcp_host::runtime::{BackoffConfig, ProcessStatus, RuntimeError, TerminationOutcome};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_or_start_spawns_once() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("launches");
    let host = host(fast_settings());
    let key = new_key();
    host.supervisor
        .configure(echo_spec(key, &["--counter-file", counter.to_str().unwrap()]))
        .await
        .unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let sup = host.supervisor.clone();
            tokio::spawn(async move { sup.get_or_start(&key).await.map(|h| h.pid()) })
        })
        .collect();
    let pids: Vec<Option<u32>> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert!(pids.iter().all(|p| p.is_some() && *p == pids[0]), "{pids:?}");
    assert_eq!(launches(&counter), 1);
    let record = host.supervisor.status(&key).unwrap();
    assert_eq!(record.status, ProcessStatus::Running);
    assert_eq!(record.pid, pids[0]);
    assert_eq!(record.restart_count, 0);

    host.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_handshake_failures_below_budget_end_running() {
    for k in 1..3u32 {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("launches");
        let host = host(fast_settings());
        let key = new_key();
        let fail = k.to_string();
        host.supervisor
            .configure(echo_spec(
                key,
                &["--counter-file", counter.to_str().unwrap(), "--fail-launches", &fail],
            ))
            .await
            .unwrap();

        let handle = host.supervisor.get_or_start(&key).await.unwrap();
        assert!(handle.is_running());

        let record = host.supervisor.status(&key).unwrap();
        assert_eq!(record.status, ProcessStatus::Running);
        assert_eq!(record.restart_count, k);
        assert!(record.last_error.unwrap().contains("handshake"));
        assert_eq!(launches(&counter), k as usize + 1);

        host.supervisor.shutdown().await;
    }
}

#[tokio::test]
async fn test_three_failures_reach_error_without_fourth_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("launches");
    let host = host(fast_settings());
    let key = new_key();
    host.supervisor
        .configure(echo_spec(
            key,
            &["--counter-file", counter.to_str().unwrap(), "--fail-launches", "5"],
        ))
        .await
        .unwrap();

    let err = host.supervisor.get_or_start(&key).await.unwrap_err();
    assert!(matches!(err, RuntimeError::StartFailed { .. }), "{err}");

    let record = host.supervisor.status(&key).unwrap();
    assert_eq!(record.status, ProcessStatus::Error);
    assert_eq!(record.restart_count, 3);
    assert!(record.pid.is_none());
    assert_eq!(launches(&counter), 3);

    for _ in 0..3 {
        let err = host.supervisor.get_or_start(&key).await.unwrap_err();
        assert!(matches!(err, RuntimeError::MaxRestartsExceeded { .. }), "{err}");
    }
    assert_eq!(launches(&counter), 3);

    // Operator restart resets the count; launches 4 and 5 still fail.
    let handle = host.supervisor.restart(&key).await.unwrap();
    assert!(handle.is_running());
    let record = host.supervisor.status(&key).unwrap();
    assert_eq!(record.status, ProcessStatus::Running);
    assert_eq!(record.restart_count, 2);
    assert_eq!(launches(&counter), 6);

    host.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_hung_handshake_times_out() {
    let mut settings = fast_settings();
    settings.handshake_timeout_ms = 200;
    let host = host(settings);
    let key = new_key();
    host.supervisor
        .configure(echo_spec(key, &["--hang-handshake"]))
        .await
        .unwrap();

    let err = host.supervisor.get_or_start(&key).await.unwrap_err();
    match err {
        RuntimeError::StartFailed { reason, .. } => {
            assert!(reason.contains("timed out"), "{reason}")
        }
        other => panic!("expected StartFailed, got {other}"),
    }
    assert_eq!(
        host.supervisor.status(&key).unwrap().status,
        ProcessStatus::Error
    );
}

#[tokio::test]
async fn test_terminate_then_start_is_fresh() {
    let host = host(fast_settings());
    let key = new_key();
    host.supervisor.configure(echo_spec(key, &[])).await.unwrap();

    let first = host.supervisor.get_or_start(&key).await.unwrap();
    let first_pid = first.pid();
    let err = first.invoke("crash", serde_json::json!({})).await.unwrap_err();
    assert!(matches!(err, RuntimeError::ProcessUnavailable { .. }), "{err}");
    drop(first);

    let record = wait_for_record(&host.supervisor, &key, Duration::from_secs(5), |r| {
        r.status == ProcessStatus::Running && r.restart_count == 1
    })
    .await;
    assert_ne!(record.pid, first_pid);

    host.supervisor.terminate(&key).await;
    let record = host.supervisor.status(&key).unwrap();
    assert_eq!(record.status, ProcessStatus::Stopped);
    assert!(record.pid.is_none());

    let fresh = host.supervisor.get_or_start(&key).await.unwrap();
    let record = host.supervisor.status(&key).unwrap();
    assert_eq!(record.status, ProcessStatus::Running);
    assert_eq!(record.restart_count, 0);
    assert_eq!(record.pid, fresh.pid());
    assert_ne!(fresh.pid(), first_pid);

    host.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_reconfigure_restarts_live_handle() {
    let host = host(fast_settings());
    let key = new_key();
    let mut spec = echo_spec(key, &[]);
    host.supervisor.configure(spec.clone()).await.unwrap();
    let old_pid = host.supervisor.get_or_start(&key).await.unwrap().pid();

    spec.config
        .insert("region".into(), serde_json::json!("eu-west-1"));
    host.supervisor.configure(spec).await.unwrap();

    let handle = host.supervisor.get_or_start(&key).await.unwrap();
    assert_ne!(handle.pid(), old_pid);
    let result = handle
        .invoke("env", serde_json::json!({"name": "SAGEMCP_CONFIG_REGION"}))
        .await
        .unwrap();
    assert_eq!(result.joined_text(), "eu-west-1");

    assert!(host.supervisor.remove(&key).await);
    assert!(host.supervisor.status(&key).is_none());
    assert!(matches!(
        host.supervisor.get_or_start(&key).await.unwrap_err(),
        RuntimeError::NotConfigured { .. }
    ));
}

#[tokio::test]
async fn test_graceful_and_forced_termination() {
    let host = host(fast_settings());

    let polite = new_key();
    host.supervisor.configure(echo_spec(polite, &[])).await.unwrap();
    let handle = host.supervisor.get_or_start(&polite).await.unwrap();
    let outcome = handle.terminate(Duration::from_secs(2)).await;
    assert_eq!(outcome, TerminationOutcome::Graceful);
    assert!(!handle.is_running());

    let stubborn = new_key();
    host.supervisor
        .configure(echo_spec(stubborn, &["--ignore-stdin-close"]))
        .await
        .unwrap();
    let handle = host.supervisor.get_or_start(&stubborn).await.unwrap();
    let outcome = handle.terminate(Duration::from_millis(200)).await;
    assert_eq!(outcome, TerminationOutcome::Forced);
    assert!(handle.exit_description().is_some());
    assert_eq!(
        handle.terminate(Duration::from_millis(200)).await,
        TerminationOutcome::AlreadyExited
    );

    host.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let host = host(fast_settings());
    let keys = [new_key(), new_key(), new_key()];
    let mut handles = Vec::new();
    for key in keys {
        host.supervisor.configure(echo_spec(key, &[])).await.unwrap();
        handles.push(host.supervisor.get_or_start(&key).await.unwrap());
    }

    host.supervisor.shutdown().await;

    for handle in &handles {
        assert!(!handle.is_running());
        assert!(handle.exit_description().is_some());
    }
    for record in host.supervisor.records() {
        assert_eq!(record.status, ProcessStatus::Stopped);
    }
}

#[tokio::test]
async fn test_terminate_preempts_pending_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("launches");
    let mut settings = fast_settings();
    settings.restart_backoff = BackoffConfig::Fixed { delay_ms: 4_000 };
    settings.shutdown_grace_ms = 500;
    let host = host(settings);
    let key = new_key();
    host.supervisor
        .configure(echo_spec(key, &["--counter-file", counter.to_str().unwrap()]))
        .await
        .unwrap();

    let handle = host.supervisor.get_or_start(&key).await.unwrap();
    let _ = handle.invoke("crash", serde_json::json!({})).await;
    drop(handle);
    wait_for_record(&host.supervisor, &key, Duration::from_secs(5), |r| {
        r.status == ProcessStatus::Restarting
    })
    .await;

    let started = Instant::now();
    host.supervisor.terminate(&key).await;
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(1_500), "terminate took {elapsed:?}");

    let record = host.supervisor.status(&key).unwrap();
    assert_eq!(record.status, ProcessStatus::Stopped);
    assert!(record.pid.is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(launches(&counter), 1);
    assert_eq!(
        host.supervisor.status(&key).unwrap().status,
        ProcessStatus::Stopped
    );
}

#[tokio::test]
async fn test_remove_during_start_leaves_no_process() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("launches");
    let mut settings = fast_settings();
    settings.handshake_timeout_ms = 5_000;
    let host = host(settings);
    let key = new_key();
    host.supervisor
        .configure(echo_spec(
            key,
            &["--counter-file", counter.to_str().unwrap(), "--hang-handshake"],
        ))
        .await
        .unwrap();

    let sup = host.supervisor.clone();
    let start = tokio::spawn(async move { sup.get_or_start(&key).await });
    while launches(&counter) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = Instant::now();
    assert!(host.supervisor.remove(&key).await);
    assert!(started.elapsed() < Duration::from_secs(2));

    let result = tokio::time::timeout(Duration::from_secs(2), start)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_err());
    assert!(host.supervisor.status(&key).is_none());
    assert!(host.supervisor.records().is_empty());
    assert!(matches!(
        host.supervisor.get_or_start(&key).await.unwrap_err(),
        RuntimeError::NotConfigured { .. }
    ));
    assert_eq!(launches(&counter), 1);
}
