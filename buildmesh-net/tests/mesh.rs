//! End-to-end tests: real workers and clients over loopback TCP.
//!
//! These tests cover:
//! 1. Discovery - a client finds an announced worker and connects
//! 2. Dispatch - output and file-access events arrive before completion
//! 3. Failure - a failing task resolves with the worker's error text
//! 4. Capacity - a busy pool resolves immediately with NoCapacity
//! 5. Availability - a worker is unavailable while running and free afterwards
//! 6. Isolation - a client with another application key pools nothing
//! 7. Liveness - an idle tunnel stays up on ping/pong alone
//! 8. Shutdown - a worker leaving drops it from the pool and fails its task

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::tempdir;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use buildmesh_core::{AppKey, KeyPair};
use buildmesh_net::protocol::TaskDispatch;
use buildmesh_net::{
    AccessMode, Client, DispatchOptions, ExecError, LocalPeer, MeshConfig, MeshError, PeerFlags,
    PeerInfo, PeerRegistry, TaskEvents, TaskExecutor, Worker,
};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Executor driven by the executable name.
///
/// - `echo`: reports each argument as output, then a read of the working dir
/// - `fail`: reports one chunk and fails with exit status 3
/// - `block`: waits until released
#[derive(Default)]
struct ScriptedExecutor {
    release: Notify,
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, task: &TaskDispatch, events: &dyn TaskEvents) -> Result<(), ExecError> {
        match task.executable.as_str() {
            "echo" => {
                for arg in &task.arguments {
                    events.output(arg.clone()).await;
                }
                events.file_access(task.working_dir.clone(), AccessMode::READ).await;
                Ok(())
            }
            "fail" => {
                events.output("oops".into()).await;
                Err(ExecError::ExitStatus(3))
            }
            "block" => {
                self.release.notified().await;
                Ok(())
            }
            other => Err(ExecError::Rejected(format!("unknown task {}", other))),
        }
    }
}

fn test_config(dir: &Path) -> MeshConfig {
    MeshConfig::new(dir.to_path_buf())
        .with_bind_ip(LOCALHOST)
        .with_port(0)
        .with_advertise_ips(vec![LOCALHOST])
        .with_idle_timeout(Duration::from_millis(200))
        .with_connect_timeout(Duration::from_secs(2))
        .with_handshake_timeout(Duration::from_secs(2))
        .with_discovery_interval(Duration::from_secs(60))
}

fn local_peer(name: &str, config: &MeshConfig) -> LocalPeer {
    LocalPeer::new(
        KeyPair::generate(),
        PeerInfo::new(name, vec![LOCALHOST], config.flags.clone()),
    )
}

/// Start a worker and wait until it is listening.
async fn start_worker(
    dir: &Path,
    app_key: &AppKey,
    executor: Arc<ScriptedExecutor>,
) -> (SocketAddr, CancellationToken, tokio::task::JoinHandle<()>) {
    let config = test_config(dir);
    let local = local_peer("worker", &config);
    let mut worker = Worker::new(config, app_key.clone(), local).with_executor(executor);
    let addr_rx = worker.bound_addr_receiver();
    let shutdown = worker.shutdown_handle();

    let handle = tokio::spawn(async move {
        let _ = worker.run().await;
    });

    let addr = addr_rx.await.expect("Failed to get bound address");
    (addr, shutdown, handle)
}

fn start_client(dir: &Path, app_key: &AppKey) -> Client {
    let config = test_config(dir);
    let local = local_peer("client", &config);
    Client::new(config, app_key.clone(), local)
}

/// Wait for a condition with timeout, polling periodically.
async fn wait_for<F>(timeout_ms: u64, poll_ms: u64, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    loop {
        if condition() {
            return true;
        }
        if start.elapsed() > Duration::from_millis(timeout_ms) {
            return false;
        }
        sleep(Duration::from_millis(poll_ms)).await;
    }
}

// ============================================================================
// Test 1: Discovery
// ============================================================================

#[tokio::test]
async fn test_client_discovers_worker() {
    let dir = tempdir().unwrap();
    let app_key = AppKey::generate();
    let (addr, shutdown, handle) = start_worker(dir.path(), &app_key, Arc::default()).await;

    let client = start_client(dir.path(), &app_key);
    assert_eq!(client.start().await.unwrap(), 1);

    let workers = client.workers();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].addr, addr);
    assert_eq!(workers[0].host, "worker");
    assert!(workers[0].available);

    // A second pass does not dial the same worker again.
    assert_eq!(client.discover_workers().await.unwrap(), 0);
    assert_eq!(client.workers().len(), 1);

    client.close().await.unwrap();
    shutdown.cancel();
    let _ = timeout(Duration::from_secs(2), handle).await;
}

// ============================================================================
// Test 2: Dispatch with streamed events
// ============================================================================

#[tokio::test]
async fn test_dispatch_streams_events_then_completes() {
    let dir = tempdir().unwrap();
    let app_key = AppKey::generate();
    let (addr, shutdown, handle) = start_worker(dir.path(), &app_key, Arc::default()).await;

    let client = start_client(dir.path(), &app_key);
    client.start().await.unwrap();

    let output = Arc::new(Mutex::new(Vec::new()));
    let accesses = Arc::new(Mutex::new(Vec::new()));
    let options = {
        let output = output.clone();
        let accesses = accesses.clone();
        DispatchOptions::new()
            .with_working_dir("/src")
            .on_output(move |chunk| output.lock().push(chunk.to_string()))
            .on_file_access(move |path, mode| accesses.lock().push((path.to_string(), mode)))
    };

    let outcome = client
        .dispatch_task("echo", vec!["one".into(), "two".into()], options)
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.addr, addr);
    assert_eq!(*output.lock(), vec!["one".to_string(), "two".to_string()]);
    assert_eq!(*accesses.lock(), vec![("/src".to_string(), AccessMode::READ)]);

    client.close().await.unwrap();
    shutdown.cancel();
    let _ = timeout(Duration::from_secs(2), handle).await;
}

// ============================================================================
// Test 3: Remote failure
// ============================================================================

#[tokio::test]
async fn test_failing_task_reports_worker_error() {
    let dir = tempdir().unwrap();
    let app_key = AppKey::generate();
    let (addr, shutdown, handle) = start_worker(dir.path(), &app_key, Arc::default()).await;

    let client = start_client(dir.path(), &app_key);
    client.start().await.unwrap();

    let result = client.dispatch_task("fail", vec![], DispatchOptions::new()).await;
    match result {
        Err(MeshError::RemoteTask { addr: failed_at, message }) => {
            assert_eq!(failed_at, addr);
            assert_eq!(message, "exit status: 3");
        }
        other => panic!("unexpected result: {:?}", other),
    }

    // The worker is usable again after a failure.
    assert_eq!(client.available_workers(), 1);
    assert!(client
        .dispatch_task("echo", vec![], DispatchOptions::new())
        .await
        .is_ok());

    client.close().await.unwrap();
    shutdown.cancel();
    let _ = timeout(Duration::from_secs(2), handle).await;
}

// ============================================================================
// Test 4 + 5: Capacity and availability
// ============================================================================

#[tokio::test]
async fn test_busy_pool_has_no_capacity() {
    let dir = tempdir().unwrap();
    let app_key = AppKey::generate();
    let executor = Arc::new(ScriptedExecutor::default());
    let (_, shutdown, handle) = start_worker(dir.path(), &app_key, executor.clone()).await;

    let client = start_client(dir.path(), &app_key);
    client.start().await.unwrap();
    assert_eq!(client.available_workers(), 1);

    let running = client.dispatch_task("block", vec![], DispatchOptions::new());
    assert_eq!(client.available_workers(), 0);
    assert!(!client.workers()[0].available);

    let second = client.dispatch_task("echo", vec![], DispatchOptions::new()).await;
    assert!(matches!(second, Err(MeshError::NoCapacity)));

    // Wait until the worker is actually running the task before releasing it.
    sleep(Duration::from_millis(100)).await;
    executor.release.notify_one();
    running.await.unwrap();
    assert_eq!(client.available_workers(), 1);

    client.close().await.unwrap();
    shutdown.cancel();
    let _ = timeout(Duration::from_secs(2), handle).await;
}

// ============================================================================
// Test 6: Application key isolation
// ============================================================================

#[tokio::test]
async fn test_other_application_pools_nothing() {
    let dir = tempdir().unwrap();
    let (_, shutdown, handle) = start_worker(dir.path(), &AppKey::generate(), Arc::default()).await;

    let client = start_client(dir.path(), &AppKey::generate());
    assert_eq!(client.start().await.unwrap(), 0);
    assert!(client.workers().is_empty());
    assert_eq!(client.registry().len().await, 1);

    let result = client.dispatch_task("echo", vec![], DispatchOptions::new()).await;
    assert!(matches!(result, Err(MeshError::NoCapacity)));

    client.close().await.unwrap();
    shutdown.cancel();
    let _ = timeout(Duration::from_secs(2), handle).await;
}

// ============================================================================
// Test 7: Liveness
// ============================================================================

#[tokio::test]
async fn test_idle_tunnel_stays_up() {
    let dir = tempdir().unwrap();
    let app_key = AppKey::generate();
    let (_, shutdown, handle) = start_worker(dir.path(), &app_key, Arc::default()).await;

    let client = start_client(dir.path(), &app_key);
    client.start().await.unwrap();

    // Six idle intervals, well past the idle deadline, with no business traffic.
    sleep(Duration::from_millis(1200)).await;

    let workers = client.workers();
    assert_eq!(workers.len(), 1);
    assert!(workers[0].latency.is_some(), "ping/pong should have sampled latency");
    assert!(
        workers[0].frames_recv >= 5,
        "expected a ping or pong per interval, got {}",
        workers[0].frames_recv
    );
    assert!(client
        .dispatch_task("echo", vec![], DispatchOptions::new())
        .await
        .is_ok());

    client.close().await.unwrap();
    shutdown.cancel();
    let _ = timeout(Duration::from_secs(2), handle).await;
}

// ============================================================================
// Test 8: Worker shutdown
// ============================================================================

#[tokio::test]
async fn test_worker_shutdown_fails_running_task() {
    let dir = tempdir().unwrap();
    let app_key = AppKey::generate();
    let (addr, shutdown, handle) = start_worker(dir.path(), &app_key, Arc::default()).await;

    let client = start_client(dir.path(), &app_key);
    client.start().await.unwrap();

    let running = client.dispatch_task("block", vec![], DispatchOptions::new());
    sleep(Duration::from_millis(100)).await;
    shutdown.cancel();

    match timeout(Duration::from_secs(5), running).await.unwrap() {
        Err(MeshError::ConnectionLost { addr: lost }) => assert_eq!(lost, addr),
        other => panic!("unexpected result: {:?}", other),
    }

    let removed = wait_for(2000, 20, || client.workers().is_empty()).await;
    assert!(removed, "Worker should leave the pool");

    let _ = timeout(Duration::from_secs(2), handle).await;
    let registry = PeerRegistry::new(dir.path());
    assert_eq!(registry.discover().await.unwrap(), 0);

    let _ = client.close().await;
}

#[tokio::test]
async fn test_client_ignores_disabled_worker() {
    let dir = tempdir().unwrap();
    let app_key = AppKey::generate();

    let config = test_config(dir.path())
        .with_flags(PeerFlags {
            mode: buildmesh_net::PeerMode::Disabled,
            ..PeerFlags::default()
        })
        .with_port(0);
    let local = local_peer("off", &config);
    let mut worker = Worker::new(config, app_key.clone(), local);
    let addr_rx = worker.bound_addr_receiver();
    let shutdown = worker.shutdown_handle();
    let handle = tokio::spawn(worker.run());
    addr_rx.await.unwrap();

    let client = start_client(dir.path(), &app_key);
    assert_eq!(client.start().await.unwrap(), 0);
    assert!(client.workers().is_empty());

    client.close().await.unwrap();
    shutdown.cancel();
    handle.await.unwrap().unwrap();
}
