//! Single-threaded processors.
//!
//! A processor is a mailbox plus one task that applies messages to a
//! [`Handler`] in arrival order. State owned by a handler is touched only by
//! that task, so handlers need no internal locking. Other components talk to
//! a processor exclusively through its [`ProcessorHandle`].

mod timeout;

pub use timeout::{PeerTimeouts, Timeout};

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Message-handling side of a processor.
#[async_trait]
pub trait Handler: Send + 'static {
    /// Messages accepted by the mailbox.
    type Message: Send + 'static;

    /// Apply one message.
    async fn handle(&mut self, message: Self::Message);

    /// Called every tick interval, between messages.
    async fn tick(&mut self) {}

    /// Called once after the mailbox closes or the processor is cancelled.
    async fn stopped(&mut self) {}
}

/// Sending side of a processor's mailbox. Cheap to clone.
pub struct ProcessorHandle<M> {
    name: &'static str,
    tx: mpsc::UnboundedSender<M>,
    cancel: CancellationToken,
}

impl<M> Clone for ProcessorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<M: Send + 'static> ProcessorHandle<M> {
    /// Queue a message. Never blocks; fails only once the processor stopped.
    pub fn enqueue(&self, message: M) -> Result<()> {
        self.tx.send(message).map_err(|_| Error::Shutdown)
    }

    /// Queue a message carrying a reply slot and wait for the answer.
    pub async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> M) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(build(tx))?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Like [`request`](Self::request) with a deadline.
    pub async fn request_timeout<T>(
        &self,
        timeout: Duration,
        build: impl FnOnce(oneshot::Sender<T>) -> M,
    ) -> Result<T> {
        tokio::time::timeout(timeout, self.request(build))
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Stop the processor after the message currently being handled.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<M> fmt::Debug for ProcessorHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorHandle")
            .field("name", &self.name)
            .field("stopped", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Spawns processors.
pub struct Processor;

impl Processor {
    /// Spawn `handler` on its own task.
    pub fn spawn<H: Handler>(
        name: &'static str,
        handler: H,
        tick: Option<Duration>,
        parent: &CancellationToken,
    ) -> (ProcessorHandle<H::Message>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = parent.child_token();
        let handle = ProcessorHandle {
            name,
            tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run(name, handler, rx, tick, cancel));
        (handle, task)
    }
}

async fn run<H: Handler>(
    name: &'static str,
    mut handler: H,
    mut rx: mpsc::UnboundedReceiver<H::Message>,
    tick: Option<Duration>,
    cancel: CancellationToken,
) {
    debug!(processor = name, "Processor started");
    let mut interval = tick.map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    // Ticks go ahead of the mailbox so a busy mailbox cannot starve them;
    // the interval yields at most one tick per period.
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = next_tick(&mut interval) => {
                trace!(processor = name, "Processor tick");
                handler.tick().await;
            }
            message = rx.recv() => match message {
                Some(message) => handler.handle(message).await,
                None => break,
            },
        }
    }

    rx.close();
    handler.stopped().await;
    debug!(processor = name, "Processor stopped");
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    enum CounterMessage {
        Add(u64),
        Get(oneshot::Sender<u64>),
    }

    struct CounterHandler {
        total: u64,
        ticks: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for CounterHandler {
        type Message = CounterMessage;

        async fn handle(&mut self, message: CounterMessage) {
            match message {
                CounterMessage::Add(n) => self.total += n,
                CounterMessage::Get(reply) => {
                    let _ = reply.send(self.total);
                }
            }
        }

        async fn tick(&mut self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn stopped(&mut self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counter() -> (CounterHandler, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        (
            CounterHandler {
                total: 0,
                ticks: ticks.clone(),
                stopped: stopped.clone(),
            },
            ticks,
            stopped,
        )
    }

    #[tokio::test]
    async fn test_messages_applied_in_order() {
        let root = CancellationToken::new();
        let (handler, _, _) = counter();
        let (handle, _task) = Processor::spawn("counter", handler, None, &root);

        for n in 1..=10 {
            handle.enqueue(CounterMessage::Add(n)).unwrap();
        }
        let total = handle.request(CounterMessage::Get).await.unwrap();
        assert_eq!(total, 55);
    }

    #[tokio::test]
    async fn test_tick_and_stop() {
        let root = CancellationToken::new();
        let (handler, ticks, stopped) = counter();
        let (handle, task) =
            Processor::spawn("ticker", handler, Some(Duration::from_millis(10)), &root);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 2);

        root.cancel();
        task.await.unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(handle.is_stopped());
        assert!(matches!(
            handle.enqueue(CounterMessage::Add(1)),
            Err(Error::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_ticks_run_while_mailbox_is_busy() {
        struct Slow {
            handled: u64,
            seen_at_tick: Arc<parking_lot::Mutex<Vec<u64>>>,
        }

        #[async_trait]
        impl Handler for Slow {
            type Message = ();

            async fn handle(&mut self, _: ()) {
                tokio::time::sleep(Duration::from_millis(2)).await;
                self.handled += 1;
            }

            async fn tick(&mut self) {
                self.seen_at_tick.lock().push(self.handled);
            }
        }

        let root = CancellationToken::new();
        let seen_at_tick = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let handler = Slow {
            handled: 0,
            seen_at_tick: seen_at_tick.clone(),
        };
        let (handle, _task) =
            Processor::spawn("slow", handler, Some(Duration::from_millis(10)), &root);
        for _ in 0..100 {
            handle.enqueue(()).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        let during_backlog = seen_at_tick.lock().iter().filter(|n| **n < 100).count();
        assert!(during_backlog >= 2, "ticks during backlog: {during_backlog}");
        root.cancel();
    }

    #[tokio::test]
    async fn test_request_timeout() {
        struct Silent;

        #[async_trait]
        impl Handler for Silent {
            type Message = oneshot::Sender<()>;

            async fn handle(&mut self, reply: oneshot::Sender<()>) {
                // Keep the reply slot alive without answering.
                std::mem::forget(reply);
            }
        }

        let root = CancellationToken::new();
        let (handle, _task) = Processor::spawn("silent", Silent, None, &root);
        let result = handle
            .request_timeout(Duration::from_millis(20), |reply| reply)
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
