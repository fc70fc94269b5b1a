//! The per-tunnel message loop.
//!
//! One task owns the tunnel and multiplexes, in priority order:
//!
//! ```text
//! cancellation          -> close and return Ok
//! business inbox        -> encode + send (client side only)
//! task replies          -> encode + send (executing side only)
//! idle ticker           -> send PING, or fail after IDLE_DEADLINE_FACTOR quiet periods
//! inbound frame         -> decode + react
//! ```
//!
//! The first error ends the loop. On exit the tunnel is closed, the
//! observer table is cleared and any running task is cancelled.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::messages::{AccessMode, Message, Payload, TaskDispatch};
use super::observers::ObserverTable;
use crate::config::IDLE_DEADLINE_FACTOR;
use crate::error::{MeshError, MeshResult};
use crate::exec::{TaskEvents, TaskExecutor};
use crate::tunnel::{LinkStats, Tunnel};

/// Error text sent when a task arrives at a side that cannot run it.
pub const NO_EXECUTOR: &str = "no executor attached to this peer";

/// Task events queued ahead of the tunnel before the task has to wait.
const REPLY_BUFFER: usize = 64;

/// A tunnel plus everything its loop reacts to.
pub struct Session {
    tunnel: Tunnel,
    inbox: Option<mpsc::Receiver<Message>>,
    observers: ObserverTable,
    executor: Option<Arc<dyn TaskExecutor>>,
    cancel: CancellationToken,
}

impl Session {
    /// Wrap an established tunnel. With no inbox or executor the loop only
    /// answers pings and feeds observers.
    pub fn new(tunnel: Tunnel, cancel: CancellationToken) -> Self {
        Self {
            tunnel,
            inbox: None,
            observers: ObserverTable::new(),
            executor: None,
            cancel,
        }
    }

    /// Messages queued here are sent in order.
    pub fn with_inbox(mut self, inbox: mpsc::Receiver<Message>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    /// Observers to notify for task messages.
    pub fn with_observers(mut self, observers: ObserverTable) -> Self {
        self.observers = observers;
        self
    }

    /// Run TASK_DISPATCH requests with `executor`.
    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Observer table used by this loop.
    pub fn observers(&self) -> &ObserverTable {
        &self.observers
    }

    /// Liveness data of the underlying tunnel.
    pub fn stats(&self) -> LinkStats {
        self.tunnel.stats()
    }

    /// Drive the loop until cancellation or the first error.
    pub async fn run(mut self) -> MeshResult<()> {
        let addr = self.tunnel.remote_addr();
        let peer = *self.tunnel.remote_key();
        let idle = self.tunnel.idle_timeout();
        let idle_deadline = idle * IDLE_DEADLINE_FACTOR;
        let stats = self.tunnel.stats();

        let (reply_tx, mut reply_rx) = mpsc::channel::<Message>(REPLY_BUFFER);
        let tasks = CancellationToken::new();
        let _tasks_guard = tasks.clone().drop_guard();

        let mut ticker = interval_at(Instant::now() + idle, idle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut inbox = self.inbox.take();

        tracing::debug!(peer = %peer, addr = %addr, "Message loop started");

        let result: MeshResult<()> = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    break Ok(());
                }

                msg = recv_inbox(&mut inbox), if inbox.is_some() => {
                    match msg {
                        Some(msg) => {
                            if let Err(e) = self.send(&msg).await {
                                break Err(e);
                            }
                        }
                        None => inbox = None,
                    }
                }

                Some(reply) = reply_rx.recv() => {
                    if let Err(e) = self.send(&reply).await {
                        break Err(e);
                    }
                }

                _ = ticker.tick() => {
                    let quiet = stats.idle_for();
                    if quiet >= idle_deadline {
                        break Err(MeshError::IdleTimeout { addr, idle: quiet });
                    }
                    if let Err(e) = self.send(&Message::ping()).await {
                        break Err(e);
                    }
                }

                frame = self.tunnel.next_frame() => {
                    let handled = match frame {
                        Ok(bytes) => match Message::decode(&bytes) {
                            Ok(msg) => self.handle(msg, &reply_tx, &tasks).await,
                            Err(e) => Err(e),
                        },
                        Err(e) => Err(e),
                    };
                    if let Err(e) = handled {
                        break Err(e);
                    }
                }
            }
        };

        match &result {
            Ok(()) => tracing::debug!(peer = %peer, addr = %addr, "Message loop stopped"),
            Err(MeshError::PeerDisconnected { reason }) => {
                tracing::info!(peer = %peer, addr = %addr, reason = %reason, "Peer disconnected")
            }
            Err(e) => tracing::warn!(peer = %peer, addr = %addr, error = %e, "Message loop failed"),
        }

        self.tunnel.close(result.as_ref().err()).await;
        self.observers.clear();
        result
    }

    async fn send(&mut self, msg: &Message) -> MeshResult<()> {
        tracing::trace!(addr = %self.tunnel.remote_addr(), message = %msg, "Sending");
        self.tunnel.write_message(msg).await
    }

    async fn handle(
        &mut self,
        msg: Message,
        replies: &mpsc::Sender<Message>,
        tasks: &CancellationToken,
    ) -> MeshResult<()> {
        tracing::trace!(addr = %self.tunnel.remote_addr(), message = %msg, "Received");
        let stats = self.tunnel.stats();

        match &msg.payload {
            Payload::Ping => {
                stats.record_latency(msg.sent_at);
                self.send(&Message::pong()).await
            }
            Payload::Pong => {
                stats.record_latency(msg.sent_at);
                Ok(())
            }
            Payload::TaskDispatch(task) => {
                self.send(&Message::task_start()).await?;
                match self.executor.clone() {
                    Some(executor) => {
                        spawn_task(executor, task.clone(), replies.clone(), tasks.child_token());
                        Ok(())
                    }
                    None => {
                        tracing::warn!(
                            addr = %self.tunnel.remote_addr(),
                            executable = %task.executable,
                            "Refusing task"
                        );
                        self.send(&Message::task_stop(NO_EXECUTOR)).await
                    }
                }
            }
            Payload::TaskStart
            | Payload::TaskFileAccess(_)
            | Payload::TaskOutput(_)
            | Payload::TaskStop(_) => {
                stats.record_latency(msg.sent_at);
                self.observers.notify(&msg);
                Ok(())
            }
        }
    }
}

async fn recv_inbox(inbox: &mut Option<mpsc::Receiver<Message>>) -> Option<Message> {
    match inbox {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Forwards executor events to the loop as outbound messages.
struct ReplySink {
    replies: mpsc::Sender<Message>,
}

#[async_trait]
impl TaskEvents for ReplySink {
    async fn output(&self, chunk: String) {
        let _ = self.replies.send(Message::task_output(chunk)).await;
    }

    async fn file_access(&self, path: String, mode: AccessMode) {
        let _ = self.replies.send(Message::task_file_access(path, mode)).await;
    }
}

fn spawn_task(
    executor: Arc<dyn TaskExecutor>,
    task: TaskDispatch,
    replies: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let sink = ReplySink {
            replies: replies.clone(),
        };
        let started = std::time::Instant::now();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(executable = %task.executable, "Task cancelled");
                return;
            }
            outcome = executor.execute(&task, &sink) => outcome,
        };

        let error = match outcome {
            Ok(()) => String::new(),
            Err(e) => e.to_string(),
        };
        tracing::debug!(
            executable = %task.executable,
            elapsed = ?started.elapsed(),
            error = %error,
            "Task finished"
        );
        let _ = replies.send(Message::task_stop(error)).await;
    });
}
