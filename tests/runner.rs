mod common;

use common::{eventually, fast_settings, StubConnector};
use llmdock::config::AppSettings;
use llmdock::error::AppError;
use llmdock::runner::{
    ConnectConfig, DisconnectConfig, TaskConfig, TaskEvent, TaskEventPayload, TaskKind, TaskResult,
    TaskRunner, TaskState, TestConfig,
};
use llmdock::ssh::{ExecOutput, SshTarget};
use llmdock::tunnel::ports::is_local_port_available;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Barrier};

fn target() -> SshTarget {
    SshTarget {
        host: "10.0.0.5".into(),
        port: 22,
        username: "llm".into(),
        private_key_path: None,
        passphrase: None,
        password: Some("secret".into()),
    }
}

fn test_config(server_id: &str) -> TaskConfig {
    TaskConfig::Test(TestConfig {
        server_id: server_id.into(),
        target: target(),
        deployed: false,
        llm_port: 11434,
    })
}

fn connect_config(server_id: &str, local_port: u16) -> TaskConfig {
    TaskConfig::Connect(ConnectConfig {
        server_id: server_id.into(),
        target: target(),
        remote_port: 11434,
        local_port: Some(local_port),
        reserved_ports: Vec::new(),
    })
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait for the progress event numbered `step`
async fn reached_step(events: &mut broadcast::Receiver<TaskEvent>, step: u32) -> bool {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(TaskEvent {
                    payload: TaskEventPayload::Progress { current, .. },
                    ..
                }) if current == step => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false)
}

fn runner(connector: Arc<StubConnector>, settings: AppSettings) -> TaskRunner {
    TaskRunner::new(connector, Arc::new(settings))
}

#[tokio::test]
async fn test_invalid_config_starts_nothing() {
    let connector = StubConnector::healthy_host();
    let runner = runner(connector.clone(), fast_settings());

    let mut config = target();
    config.host = String::new();
    let result = runner.run(
        TaskKind::Test,
        TaskConfig::Test(TestConfig {
            server_id: "s1".into(),
            target: config,
            deployed: false,
            llm_port: 11434,
        }),
    );
    assert!(matches!(result, Err(AppError::Validation(_))));

    let mismatched = runner.run(TaskKind::Deploy, test_config("s1"));
    assert!(matches!(mismatched, Err(AppError::Validation(_))));

    assert_eq!(runner.active_count(), 0);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_completed_task_emits_one_terminal_event() {
    let runner = runner(StubConnector::healthy_host(), fast_settings());
    let mut events = runner.subscribe();

    let id = runner.run(TaskKind::Test, test_config("s1")).unwrap();
    assert!(id.starts_with("test-"));
    match runner.wait(&id).await {
        Ok(TaskResult::Tested(report)) => {
            assert_eq!(report.system, "Linux 6.1.0-stub");
            assert_eq!(report.fingerprint.as_deref(), Some("SHA256:stub"));
            assert!(report.success());
        }
        other => panic!("unexpected outcome: {:?}", other.map(|r| r.summary())),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.task_id, id);
        received.push(event.payload);
    }
    let terminal: Vec<_> = received.iter().filter(|p| p.is_terminal()).collect();
    assert_eq!(terminal.len(), 1);
    assert!(matches!(received.last(), Some(TaskEventPayload::Complete { .. })));
    assert!(received
        .iter()
        .any(|p| matches!(p, TaskEventPayload::Progress { current: 1, total: 3, .. })));

    let info = runner.task(&id).unwrap();
    assert_eq!(info.state, TaskState::Completed);
    assert!(info.finished_at.is_some());
    assert!(runner.active_task("s1").is_none());
}

#[tokio::test]
async fn test_one_task_per_server() {
    let connector = StubConnector::healthy_host();
    connector.close_gate();
    let runner = runner(connector.clone(), fast_settings());

    let first = runner.run(TaskKind::Test, test_config("s1")).unwrap();
    assert!(matches!(
        runner.run(TaskKind::Test, test_config("s1")),
        Err(AppError::Busy(_))
    ));
    let other = runner.run(TaskKind::Test, test_config("s2")).unwrap();
    assert_eq!(runner.active_count(), 2);
    assert_eq!(runner.task(&first).unwrap().state, TaskState::Running);
    assert_eq!(runner.active_task("s1"), Some(first.clone()));

    connector.open_gate();
    assert!(runner.wait(&first).await.is_ok());
    assert!(runner.wait(&other).await.is_ok());
    assert_eq!(runner.active_count(), 0);
    assert!(runner.run(TaskKind::Test, test_config("s1")).is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_admit_one_task_per_server() {
    let connector = StubConnector::healthy_host();
    connector.close_gate();
    let runner = runner(connector.clone(), fast_settings());
    let barrier = Arc::new(Barrier::new(8));

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let runner = runner.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                runner.run(TaskKind::Test, test_config("s1"))
            })
        })
        .collect();

    let mut started = Vec::new();
    let mut busy = 0;
    for attempt in futures::future::join_all(attempts).await {
        match attempt.unwrap() {
            Ok(id) => started.push(id),
            Err(AppError::Busy(server)) => {
                assert_eq!(server, "s1");
                busy += 1;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(started.len(), 1);
    assert_eq!(busy, 7);
    assert_eq!(runner.active_count(), 1);

    connector.open_gate();
    assert!(runner.wait(&started[0]).await.is_ok());
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_connect_releases_session_and_port() {
    let connector = StubConnector::healthy_host();
    let mut settings = fast_settings();
    settings.tunnel.settle_delay_ms = 10_000;
    let runner = runner(connector.clone(), settings);
    let mut events = runner.subscribe();
    let port = free_port();

    let id = runner.run(TaskKind::Connect, connect_config("s1", port)).unwrap();
    // Step 4 starts once the forward is listening
    assert!(reached_step(&mut events, 4).await);
    runner.cancel(&id).unwrap();

    assert!(matches!(runner.wait(&id).await, Err(AppError::Cancelled(_))));
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
    assert!(runner.active_task("s1").is_none());
    assert!(is_local_port_available(port));
}

#[tokio::test]
async fn test_port_lost_after_session_opens_releases_session() {
    let connector = StubConnector::healthy_host();
    connector.close_gate();
    let runner = runner(connector.clone(), fast_settings());
    let mut events = runner.subscribe();
    let port = free_port();

    let id = runner.run(TaskKind::Connect, connect_config("s1", port)).unwrap();
    // Step 2 is reported after the port scan picked `port`
    assert!(reached_step(&mut events, 2).await);
    let squatter = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    connector.open_gate();

    assert!(matches!(runner.wait(&id).await, Err(AppError::PortConflict(_))));
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    assert_eq!(connector.closes.load(Ordering::SeqCst), 1);

    drop(squatter);
    assert!(is_local_port_available(port));
}

#[tokio::test]
async fn test_cancel_ends_with_cancelled() {
    let connector = StubConnector::healthy_host();
    connector.close_gate();
    let runner = runner(connector.clone(), fast_settings());

    let id = runner.run(TaskKind::Test, test_config("s1")).unwrap();
    assert!(eventually(Duration::from_secs(1), || connector.connects.load(Ordering::SeqCst) == 1).await);
    runner.cancel(&id).unwrap();

    assert!(matches!(runner.wait(&id).await, Err(AppError::Cancelled(_))));
    assert_eq!(runner.task(&id).unwrap().state, TaskState::Failed);
    assert_eq!(runner.active_count(), 0);
    assert!(runner.cancel(&id).is_ok());
    assert!(matches!(runner.cancel("test-unknown"), Err(AppError::Validation(_))));
}

#[tokio::test]
async fn test_budget_expiry_is_timeout() {
    let connector = StubConnector::healthy_host();
    connector.set_handshake_delay(Duration::from_secs(30));
    let mut settings = fast_settings();
    settings.ssh.handshake_timeout_ms = 60_000;
    settings.runner.test_timeout_secs = 1;
    let runner = runner(connector, settings);

    let id = runner.run(TaskKind::Test, test_config("s1")).unwrap();
    match runner.wait(&id).await {
        Err(AppError::Timeout(message)) => assert!(message.contains("budget")),
        other => panic!("expected timeout, got {:?}", other.map(|r| r.summary())),
    }
}

#[tokio::test]
async fn test_panicking_worker_is_reported() {
    let connector = StubConnector::new(|command: &str| {
        if command.starts_with("uname") {
            panic!("boom");
        }
        ExecOutput::ok("")
    });
    let runner = runner(connector, fast_settings());
    let mut events = runner.subscribe();

    let id = runner.run(TaskKind::Test, test_config("s1")).unwrap();
    match runner.wait(&id).await {
        Err(AppError::WorkerCrashed(message)) => assert!(message.contains("boom")),
        other => panic!("expected crash, got {:?}", other.map(|r| r.summary())),
    }

    let mut terminal = 0;
    while let Ok(event) = events.try_recv() {
        if let TaskEventPayload::Error { error } = &event.payload {
            assert_eq!(error.code, "WORKER_CRASHED");
            terminal += 1;
        }
    }
    assert_eq!(terminal, 1);
    assert_eq!(runner.active_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unresponsive_worker_is_terminated_after_grace() {
    let started = Arc::new(AtomicBool::new(false));
    let flag = started.clone();
    let connector = StubConnector::new(move |command: &str| {
        if command.starts_with("uname") {
            flag.store(true, Ordering::SeqCst);
            tokio::task::block_in_place(|| std::thread::sleep(Duration::from_secs(3)));
        }
        ExecOutput::ok("")
    });
    let mut settings = fast_settings();
    settings.runner.cancel_grace_ms = 100;
    let runner = runner(connector, settings);

    let id = runner.run(TaskKind::Test, test_config("s1")).unwrap();
    assert!(eventually(Duration::from_secs(1), || started.load(Ordering::SeqCst)).await);

    let cancelled_at = Instant::now();
    runner.cancel(&id).unwrap();
    assert!(matches!(runner.wait(&id).await, Err(AppError::Cancelled(_))));
    assert!(cancelled_at.elapsed() < Duration::from_secs(2));
    assert_eq!(runner.active_count(), 0);
}

#[tokio::test]
async fn test_disconnect_without_tunnel_succeeds() {
    let runner = runner(StubConnector::healthy_host(), fast_settings());
    let id = runner
        .run(
            TaskKind::Disconnect,
            TaskConfig::Disconnect(DisconnectConfig {
                server_id: "s1".into(),
                tunnel: None,
            }),
        )
        .unwrap();
    assert!(matches!(
        runner.wait(&id).await,
        Ok(TaskResult::Disconnected { local_port: None })
    ));
}

#[tokio::test]
async fn test_shutdown_refuses_new_tasks() {
    let connector = StubConnector::healthy_host();
    connector.close_gate();
    let runner = runner(connector, fast_settings());

    let id = runner.run(TaskKind::Test, test_config("s1")).unwrap();
    runner.shutdown().await;

    assert!(matches!(runner.wait(&id).await, Err(AppError::Cancelled(_))));
    assert!(matches!(
        runner.run(TaskKind::Test, test_config("s2")),
        Err(AppError::Cancelled(_))
    ));
}
