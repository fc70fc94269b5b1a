//! Dispatching one task to one claimed worker.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use buildmesh_core::PublicKey;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::pool::RemoteWorker;
use crate::error::{MeshError, MeshResult};
use crate::protocol::{AccessMode, Message, MessageKind, Payload, TaskDispatch};

type OutputCallback = Box<dyn FnMut(&str) + Send>;
type FileAccessCallback = Box<dyn FnMut(&str, AccessMode) + Send>;

/// Optional parts of a dispatch request.
#[derive(Default)]
pub struct DispatchOptions {
    /// Working directory on the worker; empty for the worker's own.
    pub working_dir: String,
    /// Extra environment variables.
    pub environment: Vec<(String, String)>,
    on_output: Option<OutputCallback>,
    on_file_access: Option<FileAccessCallback>,
}

impl DispatchOptions {
    /// Options with nothing set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the task in `dir` on the worker.
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((key.into(), value.into()));
        self
    }

    /// Receive console output chunks as they arrive.
    pub fn on_output<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.on_output = Some(Box::new(callback));
        self
    }

    /// Receive file-access events as they arrive.
    pub fn on_file_access<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&str, AccessMode) + Send + 'static,
    {
        self.on_file_access = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for DispatchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchOptions")
            .field("working_dir", &self.working_dir)
            .field("environment", &self.environment)
            .field("on_output", &self.on_output.is_some())
            .field("on_file_access", &self.on_file_access.is_some())
            .finish()
    }
}

/// A task that ran to completion on a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Process exit code; always 0 since failures resolve as errors.
    pub exit_code: i32,
    /// Worker that ran the task.
    pub worker: PublicKey,
    /// Address of that worker.
    pub addr: SocketAddr,
}

enum FutureState {
    Ready(Option<MeshResult<TaskOutcome>>),
    Running(JoinHandle<MeshResult<TaskOutcome>>),
}

/// Completion of a dispatched task.
///
/// Dropping the future does not cancel the task; it keeps running and the
/// worker is released when it finishes.
pub struct TaskFuture {
    state: FutureState,
}

impl TaskFuture {
    pub(crate) fn ready(result: MeshResult<TaskOutcome>) -> Self {
        Self {
            state: FutureState::Ready(Some(result)),
        }
    }

    pub(crate) fn running(handle: JoinHandle<MeshResult<TaskOutcome>>) -> Self {
        Self {
            state: FutureState::Running(handle),
        }
    }
}

impl Future for TaskFuture {
    type Output = MeshResult<TaskOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            FutureState::Ready(result) => match result.take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Ready(Err(MeshError::DispatchAborted("polled after completion".into()))),
            },
            FutureState::Running(handle) => match Pin::new(handle).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(e)) => Poll::Ready(Err(MeshError::DispatchAborted(e.to_string()))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Restores the worker on every exit path. A worker whose tunnel closed
/// stays retired even if its inbox is still open.
struct Release(Arc<RemoteWorker>);

impl Drop for Release {
    fn drop(&mut self) {
        self.0.observers().clear();
        if !self.0.is_closed() {
            self.0.release();
        }
    }
}

/// Drive one task on a worker that has already been claimed.
pub(crate) async fn run_dispatch(
    worker: Arc<RemoteWorker>,
    task: TaskDispatch,
    options: DispatchOptions,
    idle_timeout: Duration,
) -> MeshResult<TaskOutcome> {
    let _release = Release(worker.clone());
    let addr = worker.addr();
    let executable = task.executable.clone();

    let (stop_tx, stop_rx) = oneshot::channel::<String>();
    install_observers(&worker, options, stop_tx);

    tracing::debug!(worker = %worker.public_key(), addr = %addr, executable = %executable, "Dispatching task");
    worker.send(Message::new(Payload::TaskDispatch(task))).await?;

    let mut probe = interval_at(Instant::now() + idle_timeout, idle_timeout);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(stop_rx);

    loop {
        tokio::select! {
            biased;

            stop = &mut stop_rx => {
                return match stop {
                    Ok(error) if error.is_empty() => {
                        tracing::debug!(addr = %addr, executable = %executable, "Task succeeded");
                        Ok(TaskOutcome {
                            exit_code: 0,
                            worker: *worker.public_key(),
                            addr,
                        })
                    }
                    Ok(message) => Err(MeshError::RemoteTask { addr, message }),
                    Err(_) => Err(MeshError::ConnectionLost { addr }),
                };
            }

            _ = worker.closed() => {
                return Err(MeshError::ConnectionLost { addr });
            }

            _ = probe.tick() => {
                if worker.stats().idle_for() >= idle_timeout && worker.try_send(Message::ping()) {
                    tracing::trace!(addr = %addr, "Probing quiet worker");
                }
            }
        }
    }
}

fn install_observers(worker: &RemoteWorker, options: DispatchOptions, stop_tx: oneshot::Sender<String>) {
    let observers = worker.observers();
    let DispatchOptions {
        on_output,
        on_file_access,
        ..
    } = options;

    observers.set(MessageKind::TaskStart, |_| {});

    if let Some(mut callback) = on_output {
        observers.set(MessageKind::TaskOutput, move |msg| {
            if let Payload::TaskOutput(out) = &msg.payload {
                callback(&out.chunk);
            }
        });
    }

    if let Some(mut callback) = on_file_access {
        observers.set(MessageKind::TaskFileAccess, move |msg| {
            if let Payload::TaskFileAccess(access) = &msg.payload {
                callback(&access.path, access.mode);
            }
        });
    }

    let mut stop_tx = Some(stop_tx);
    observers.set(MessageKind::TaskStop, move |msg| {
        if let Payload::TaskStop(stop) = &msg.payload {
            if let Some(tx) = stop_tx.take() {
                let _ = tx.send(stop.error.clone());
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ObserverTable;
    use crate::tunnel::LinkStats;
    use buildmesh_core::KeyPair;
    use tokio::sync::mpsc;

    fn worker() -> (Arc<RemoteWorker>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(1);
        let worker = RemoteWorker::new(
            KeyPair::generate().public_key(),
            "127.0.0.1:4000".parse().unwrap(),
            "builder",
            tx,
            ObserverTable::new(),
            LinkStats::new(),
        );
        (Arc::new(worker), rx)
    }

    fn task() -> TaskDispatch {
        TaskDispatch {
            executable: "cc".into(),
            ..TaskDispatch::default()
        }
    }

    #[tokio::test]
    async fn test_ready_future() {
        let fut = TaskFuture::ready(Err(MeshError::NoCapacity));
        assert!(matches!(fut.await, Err(MeshError::NoCapacity)));
    }

    #[tokio::test]
    async fn test_stop_resolves_and_releases() {
        let (w, mut rx) = worker();
        assert!(w.try_claim());

        let handle = tokio::spawn(run_dispatch(
            w.clone(),
            task(),
            DispatchOptions::new(),
            Duration::from_secs(10),
        ));

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.kind(), MessageKind::TaskDispatch);
        assert!(!w.is_available());

        w.observers().notify(&Message::task_start());
        w.observers().notify(&Message::task_stop("exit status: 2"));

        match handle.await.unwrap() {
            Err(MeshError::RemoteTask { message, .. }) => assert_eq!(message, "exit status: 2"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(w.is_available());
        assert!(!w.observers().is_set(MessageKind::TaskStop));
    }

    #[tokio::test]
    async fn test_loop_exit_is_connection_lost() {
        let (w, mut rx) = worker();
        assert!(w.try_claim());

        let handle = tokio::spawn(run_dispatch(
            w.clone(),
            task(),
            DispatchOptions::new(),
            Duration::from_secs(10),
        ));
        rx.recv().await.unwrap();
        drop(rx);

        assert!(matches!(
            handle.await.unwrap(),
            Err(MeshError::ConnectionLost { .. })
        ));
        assert!(!w.is_available());
    }

    #[tokio::test]
    async fn test_closed_tunnel_retires_worker() {
        let (w, mut rx) = worker();
        assert!(w.try_claim());

        let handle = tokio::spawn(run_dispatch(
            w.clone(),
            task(),
            DispatchOptions::new(),
            Duration::from_secs(10),
        ));
        rx.recv().await.unwrap();

        // Loop shutdown order: close observer, then observer table cleared,
        // with the inbox receiver still alive.
        w.mark_unavailable();
        w.observers().clear();

        assert!(matches!(
            handle.await.unwrap(),
            Err(MeshError::ConnectionLost { .. })
        ));
        assert!(!w.is_closed());
        assert!(!w.is_available());
        assert!(!w.try_claim());
        drop(rx);
    }

    #[tokio::test]
    async fn test_quiet_worker_is_probed() {
        let (w, mut rx) = worker();
        assert!(w.try_claim());

        let idle = Duration::from_millis(50);
        let handle = tokio::spawn(run_dispatch(w.clone(), task(), DispatchOptions::new(), idle));
        assert_eq!(rx.recv().await.unwrap().kind(), MessageKind::TaskDispatch);
        assert_eq!(rx.recv().await.unwrap().kind(), MessageKind::Ping);

        w.observers().notify(&Message::task_stop(""));
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.worker, *w.public_key());
    }
}
