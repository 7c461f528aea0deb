//! Supervisor tests against the real `progbot worker` binary running the
//! synthetic driver.

use std::sync::Arc;
use std::time::{Duration, Instant};

use progbot_io::{
    DriverMode, PeripheralSupervisor, ProcessRegistry, ProgramSpawner, SupervisorConfig,
    SymbolKind, WorkerState,
};

fn supervisor(registry: &ProcessRegistry, env: &[(&str, &str)]) -> PeripheralSupervisor {
    let spawner = ProgramSpawner::new(env!("CARGO_BIN_EXE_progbot")).arg("worker");
    let mut config = SupervisorConfig::new()
        .with_spawner(Arc::new(spawner))
        .with_command_timeout(Duration::from_secs(5));
    for (key, value) in env {
        config = config.with_env(*key, *value);
    }
    PeripheralSupervisor::new(config, registry.clone())
}

#[tokio::test]
async fn start_twice_keeps_one_worker() {
    let registry = ProcessRegistry::new();
    let mut sup = supervisor(&registry, &[]);

    sup.start().await.unwrap();
    let first = sup.pid().unwrap();
    sup.start().await.unwrap();

    assert_eq!(sup.pid(), Some(first));
    assert_eq!(registry.live_pids(), vec![first]);
    assert_eq!(sup.state(), WorkerState::Running);

    sup.stop().await;
    assert_eq!(sup.state(), WorkerState::Stopped);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn scan_reports_first_decoding_attempt() {
    let registry = ProcessRegistry::new();
    let mut sup = supervisor(
        &registry,
        &[
            ("PROGBOT_SYNTHETIC_HIT_AFTER", "2"),
            ("PROGBOT_SYNTHETIC_CODE", "PCB-0042"),
        ],
    );
    sup.start().await.unwrap();

    assert_eq!(
        sup.init_driver(DriverMode::Primary).await.as_deref(),
        Some("synthetic-primary")
    );
    let hit = sup.scan(Some(3)).await.unwrap();
    assert_eq!(hit.attempt, 2);
    assert_eq!(hit.kind, SymbolKind::Primary);
    assert_eq!(hit.data, "PCB-0042");

    sup.shutdown().await;
    assert_eq!(sup.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn secondary_decoder_on_device_camera() {
    let registry = ProcessRegistry::new();
    let mut sup = supervisor(&registry, &[("PROGBOT_SYNTHETIC_VARIANT", "secondary")]);
    sup.start().await.unwrap();

    assert_eq!(
        sup.init_driver(DriverMode::Device { index: 1 })
            .await
            .as_deref(),
        Some("synthetic-device1")
    );
    let hit = sup.scan(None).await.unwrap();
    assert_eq!(hit.kind, SymbolKind::Secondary);
    assert_eq!(hit.attempt, 1);

    sup.shutdown().await;
}

#[tokio::test]
async fn capture_crosses_the_boundary_as_a_frame() {
    let registry = ProcessRegistry::new();
    let mut sup = supervisor(
        &registry,
        &[
            ("PROGBOT_SYNTHETIC_WIDTH", "32"),
            ("PROGBOT_SYNTHETIC_HEIGHT", "16"),
        ],
    );
    sup.start().await.unwrap();
    sup.init_driver(DriverMode::Primary).await.unwrap();

    let frame = sup.capture().await.unwrap();
    assert_eq!(frame.shape(), vec![16, 32, 3]);
    assert_eq!(frame.data().len(), 16 * 32 * 3);

    sup.shutdown().await;
}

#[tokio::test]
async fn worker_errors_come_back_as_none() {
    let registry = ProcessRegistry::new();
    let mut sup = supervisor(&registry, &[("PROGBOT_SYNTHETIC_HIT_AFTER", "never")]);
    sup.start().await.unwrap();

    // Capture before init is an error result.
    assert!(sup.capture().await.is_none());

    sup.init_driver(DriverMode::Primary).await.unwrap();
    assert!(sup.scan(Some(2)).await.is_none());
    assert!(sup.is_worker_alive());

    sup.stop().await;
}

#[tokio::test]
async fn driver_panic_does_not_kill_worker() {
    let registry = ProcessRegistry::new();
    let mut sup = supervisor(&registry, &[("PROGBOT_SYNTHETIC_PANIC", "capture")]);
    sup.start().await.unwrap();
    sup.init_driver(DriverMode::Primary).await.unwrap();

    assert!(sup.capture().await.is_none());
    assert!(sup.init_driver(DriverMode::Primary).await.is_some());

    sup.stop().await;
}

#[tokio::test]
async fn failed_driver_construction_yields_none() {
    let registry = ProcessRegistry::new();
    let mut sup = supervisor(&registry, &[("PROGBOT_SYNTHETIC_FAIL", "1")]);
    sup.start().await.unwrap();

    assert!(sup.init_driver(DriverMode::Primary).await.is_none());

    sup.stop().await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn restart_after_stop_behaves_like_fresh_start() {
    let registry = ProcessRegistry::new();
    let mut sup = supervisor(&registry, &[]);

    sup.start().await.unwrap();
    let first = sup.pid().unwrap();
    sup.init_driver(DriverMode::Primary).await.unwrap();
    sup.stop().await;

    assert_eq!(sup.state(), WorkerState::Stopped);
    assert!(!sup.stop_flag().is_set());
    assert!(sup.pid().is_none());

    sup.start().await.unwrap();
    let second = sup.pid().unwrap();
    assert_ne!(first, second);
    assert_eq!(registry.live_pids(), vec![second]);

    assert!(sup.init_driver(DriverMode::Primary).await.is_some());
    let hit = sup.scan(Some(1)).await.unwrap();
    assert_eq!(hit.attempt, 1);

    sup.stop().await;
}

#[tokio::test]
async fn cleanup_ends_worker_and_start_replaces_it() {
    let registry = ProcessRegistry::new();
    let mut sup = supervisor(&registry, &[]);
    sup.start().await.unwrap();
    let first = sup.pid().unwrap();
    sup.init_driver(DriverMode::Primary).await.unwrap();

    assert!(sup.cleanup(Duration::from_secs(5)).await);

    let deadline = Instant::now() + Duration::from_secs(5);
    while sup.is_worker_alive() {
        assert!(Instant::now() < deadline, "worker kept running after cleanup");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    sup.start().await.unwrap();
    assert_ne!(sup.pid(), Some(first));
    assert_eq!(registry.len(), 1);
    sup.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn stop_aborts_worker_stuck_in_driver_call() {
    let registry = ProcessRegistry::new();
    let mut sup = supervisor(&registry, &[("PROGBOT_SYNTHETIC_HANG", "capture")]);
    sup.start().await.unwrap();
    sup.init_driver(DriverMode::Primary).await.unwrap();

    let reply = sup
        .send_command(progbot_io::Command::Capture, Duration::from_millis(300))
        .await;
    assert!(reply.is_none());

    let started = Instant::now();
    sup.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(sup.state(), WorkerState::Stopped);
    assert!(registry.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn stop_kills_worker_that_ignores_signals() {
    let registry = ProcessRegistry::new();
    let spawner = ProgramSpawner::new("sh")
        .arg("-c")
        .arg("trap '' TERM INT; exec sleep 30");
    let mut sup = PeripheralSupervisor::new(
        SupervisorConfig::new().with_spawner(Arc::new(spawner)),
        registry.clone(),
    );
    sup.start().await.unwrap();
    let pid = sup.pid().unwrap();
    // Let sh install the trap before the ladder starts.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    sup.stop().await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(400), "escalated too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "stop took {:?}", elapsed);
    assert_eq!(sup.state(), WorkerState::Stopped);
    assert!(!registry.contains(pid));
}
