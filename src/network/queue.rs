//! Per-channel outbound message queue
//!
//! Two FIFOs: responses (anything not awaiting a reply) and requests. A
//! background task ticks every `send_period` and writes at most
//! `batch_size` rounds, each round taking one response then one request, so
//! replies are never stuck behind a request backlog.

use crate::network::channel::{ChannelState, StateCell};
use crate::network::message::Message;
use futures::{Sink, SinkExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Default flush tick
pub const DEFAULT_SEND_PERIOD: Duration = Duration::from_millis(10);

/// Default rounds per tick
pub const DEFAULT_BATCH_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub send_period: Duration,
    pub batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            send_period: DEFAULT_SEND_PERIOD,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Shared runtime that drives every channel's flush task
#[derive(Debug, Clone)]
pub struct FlushScheduler {
    handle: Handle,
}

impl FlushScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// The runtime the caller is running on, if any
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future)
    }
}

struct FlushTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct QueueInner {
    peer: String,
    requests: Mutex<VecDeque<Message>>,
    responses: Mutex<VecDeque<Message>>,
    state: Arc<StateCell>,
    batch_size: usize,
    running: AtomicBool,
}

impl QueueInner {
    fn size(&self) -> usize {
        self.requests.lock().len() + self.responses.lock().len()
    }

    async fn nudge<S>(&self, sink: &mut S) -> Result<usize, S::Error>
    where
        S: Sink<Message> + Unpin,
    {
        let rounds = self.batch_size.min(self.size());
        if rounds == 0 {
            return Ok(0);
        }

        let mut written = 0;
        for _ in 0..rounds {
            let response = self.responses.lock().pop_front();
            if let Some(msg) = response {
                sink.feed(msg).await?;
                written += 1;
            }
            let request = self.requests.lock().pop_front();
            if let Some(msg) = request {
                sink.feed(msg).await?;
                written += 1;
            }
        }
        sink.flush().await?;

        log::trace!("Flushed {} messages to {}", written, self.peer);
        Ok(written)
    }
}

/// Outbound buffer owned by one channel
pub struct MessageQueue {
    inner: Arc<QueueInner>,
    send_period: Duration,
    task: Mutex<Option<FlushTask>>,
}

impl MessageQueue {
    pub fn new(peer: impl Into<String>, state: Arc<StateCell>, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                peer: peer.into(),
                requests: Mutex::new(VecDeque::new()),
                responses: Mutex::new(VecDeque::new()),
                state,
                batch_size: config.batch_size.max(1),
                running: AtomicBool::new(false),
            }),
            send_period: config.send_period,
            task: Mutex::new(None),
        }
    }

    /// Enqueue a message; dropped when the channel is disconnected
    pub fn send_message(&self, msg: Message) -> bool {
        if self.inner.state.get() == ChannelState::Disconnected {
            log::warn!(
                "Dropping {} for disconnected peer {}",
                msg.type_name(),
                self.inner.peer
            );
            return false;
        }

        if msg.expects_response {
            self.inner.requests.lock().push_back(msg);
        } else {
            self.inner.responses.lock().push_back(msg);
        }
        true
    }

    /// Messages waiting in both queues
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn is_idle(&self) -> bool {
        self.size() == 0
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the periodic flush into `sink`; a second call is a no-op
    pub fn activate<S>(&self, sink: S, scheduler: &FlushScheduler)
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display,
    {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let inner = self.inner.clone();
        inner.running.store(true, Ordering::SeqCst);
        let handle = scheduler.spawn(flush_loop(inner, sink, self.send_period, token.clone()));
        *task = Some(FlushTask { token, handle });
    }

    /// Run one dispatch tick by hand
    pub async fn nudge<S>(&self, sink: &mut S) -> Result<usize, S::Error>
    where
        S: Sink<Message> + Unpin,
    {
        self.inner.nudge(sink).await
    }

    /// Cancel the flush task and wait for it to finish
    pub async fn close(&self) {
        let task = self.task.lock().take();
        if let Some(FlushTask { token, handle }) = task {
            token.cancel();
            if let Err(e) = handle.await {
                log::warn!("Flush task for {} ended abnormally: {}", self.inner.peer, e);
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.token.cancel();
        }
    }
}

async fn flush_loop<S>(
    inner: Arc<QueueInner>,
    mut sink: S,
    period: Duration,
    token: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut healthy = true;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = inner.nudge(&mut sink).await {
                    log::warn!("Write to {} failed: {}", inner.peer, e);
                    inner.state.advance(ChannelState::Disconnected);
                    healthy = false;
                    break;
                }
            }
        }
    }

    inner.running.store(false, Ordering::SeqCst);
    if healthy {
        // One last bounded tick so a parting message can go out
        let _ = tokio::time::timeout(period, async {
            let _ = inner.nudge(&mut sink).await;
            let _ = sink.close().await;
        })
        .await;
    }
    log::debug!("Flush task for {} stopped", inner.peer);
}
