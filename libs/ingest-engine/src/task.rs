//! Uniform task runtime.
//!
//! Each component implements [`Task`] for one event type. An [`EventSource`]
//! adapter produces those events: bus subscription, storage watch, queue poll
//! or interval tick. [`spawn_task`] joins the two with a concurrency cap, a
//! wall-clock timeout per invocation and cooperative cancellation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use ingest_api::queue::{Delivery, DurableQueue};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::ingress::BusMessage;
use crate::objects::ObjectEvent;

pub trait EventSource: Send + 'static {
    type Event: Send + 'static;

    /// Next event, or `None` when the source is exhausted.
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Option<Self::Event>> + Send + '_>>;
}

pub trait Task: Send + Sync + 'static {
    type Event: Send + 'static;

    fn name(&self) -> &str;

    fn run(
        &self,
        event: Self::Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>>;
}

#[derive(Debug, Clone, Copy)]
pub struct TaskOptions {
    /// Invocations allowed in flight at once.
    pub concurrency: usize,
    /// Hard wall-clock limit per invocation.
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    Completed,
    Failed,
    TimedOut,
}

/// Run one invocation under the timeout. Errors and timeouts are logged; a
/// timeout counts as a transient failure like any other error.
pub async fn invoke<T: Task>(task: &T, event: T::Event, timeout: Duration) -> Invocation {
    match tokio::time::timeout(timeout, task.run(event)).await {
        Ok(Ok(())) => Invocation::Completed,
        Ok(Err(e)) => {
            tracing::warn!(task = %task.name(), error = %e, "invocation failed");
            Invocation::Failed
        }
        Err(_) => {
            tracing::warn!(task = %task.name(), timeout_secs = timeout.as_secs(), "invocation timed out");
            Invocation::TimedOut
        }
    }
}

/// Drive `task` with events from `source` until the source ends or `token`
/// is cancelled, then wait for in-flight invocations.
pub fn spawn_task<S, T>(
    mut source: S,
    task: Arc<T>,
    options: TaskOptions,
    token: CancellationToken,
) -> JoinHandle<()>
where
    S: EventSource,
    T: Task<Event = S::Event>,
{
    tokio::spawn(async move {
        let concurrency = options.concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));

        loop {
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = source.next() => match event {
                    Some(event) => event,
                    None => {
                        tracing::debug!(task = %task.name(), "event source closed");
                        break;
                    }
                },
            };

            let task = task.clone();
            tokio::spawn(async move {
                invoke(&*task, event, options.timeout).await;
                drop(permit);
            });
        }

        // All permits back means every spawned invocation finished.
        let _ = permits.acquire_many(concurrency as u32).await;
        tracing::info!(task = %task.name(), "task stopped");
    })
}

// ---------------------------------------------------------------------------
// Producer adapters
// ---------------------------------------------------------------------------

/// Messages pushed by the bus listener.
pub struct BusSubscription {
    rx: mpsc::Receiver<BusMessage>,
}

impl BusSubscription {
    pub fn new(rx: mpsc::Receiver<BusMessage>) -> Self {
        Self { rx }
    }
}

impl EventSource for BusSubscription {
    type Event = BusMessage;

    fn next(&mut self) -> Pin<Box<dyn Future<Output = Option<BusMessage>> + Send + '_>> {
        Box::pin(self.rx.recv())
    }
}

/// Object-created events from a watched object store.
pub struct StorageWatch {
    rx: mpsc::UnboundedReceiver<ObjectEvent>,
}

impl StorageWatch {
    pub fn new(rx: mpsc::UnboundedReceiver<ObjectEvent>) -> Self {
        Self { rx }
    }
}

impl EventSource for StorageWatch {
    type Event = ObjectEvent;

    fn next(&mut self) -> Pin<Box<dyn Future<Output = Option<ObjectEvent>> + Send + '_>> {
        Box::pin(self.rx.recv())
    }
}

/// Batches of queue deliveries: returns once `batch_size` messages are
/// gathered or `window` has passed since the first one arrived.
pub struct QueuePoll {
    queue: Arc<dyn DurableQueue>,
    batch_size: usize,
    window: Duration,
    poll_interval: Duration,
}

impl QueuePoll {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        batch_size: usize,
        window: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self { queue, batch_size: batch_size.max(1), window, poll_interval }
    }
}

impl EventSource for QueuePoll {
    type Event = Vec<Delivery>;

    fn next(&mut self) -> Pin<Box<dyn Future<Output = Option<Vec<Delivery>>> + Send + '_>> {
        Box::pin(async move {
            let mut batch: Vec<Delivery> = Vec::with_capacity(self.batch_size);
            let mut deadline: Option<Instant> = None;
            loop {
                match self.queue.receive(self.batch_size - batch.len()).await {
                    Ok(mut received) => batch.append(&mut received),
                    Err(e) => tracing::warn!(queue = %self.queue.name(), error = %e, "queue receive failed"),
                }
                if batch.len() >= self.batch_size {
                    return Some(batch);
                }
                if !batch.is_empty() {
                    let deadline = *deadline.get_or_insert_with(|| Instant::now() + self.window);
                    if Instant::now() >= deadline {
                        return Some(batch);
                    }
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        })
    }
}

/// Fixed-period schedule. The first tick fires immediately.
pub struct Tick {
    interval: tokio::time::Interval,
}

impl Tick {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

impl EventSource for Tick {
    type Event = ();

    fn next(&mut self) -> Pin<Box<dyn Future<Output = Option<()>> + Send + '_>> {
        Box::pin(async move {
            self.interval.tick().await;
            Some(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        runs: AtomicUsize,
        delay: Duration,
    }

    impl Task for Counting {
        type Event = u32;

        fn name(&self) -> &str {
            "counting"
        }

        fn run(&self, event: u32) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                self.runs.fetch_add(1, Ordering::SeqCst);
                if event == 0 {
                    return Err(EngineError::Config("zero".into()));
                }
                Ok(())
            })
        }
    }

    struct Numbers(std::vec::IntoIter<u32>);

    impl EventSource for Numbers {
        type Event = u32;

        fn next(&mut self) -> Pin<Box<dyn Future<Output = Option<u32>> + Send + '_>> {
            let next = self.0.next();
            Box::pin(async move { next })
        }
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let task = Counting { runs: AtomicUsize::new(0), delay: Duration::from_millis(200) };
        let outcome = invoke(&task, 1, Duration::from_millis(10)).await;
        assert_eq!(outcome, Invocation::TimedOut);
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);

        let quick = Counting { runs: AtomicUsize::new(0), delay: Duration::ZERO };
        assert_eq!(invoke(&quick, 1, Duration::from_secs(1)).await, Invocation::Completed);
        assert_eq!(invoke(&quick, 0, Duration::from_secs(1)).await, Invocation::Failed);
    }

    #[tokio::test]
    async fn drains_source_then_waits_for_in_flight() {
        let task = Arc::new(Counting { runs: AtomicUsize::new(0), delay: Duration::from_millis(5) });
        let handle = spawn_task(
            Numbers(vec![1, 2, 0, 3, 4].into_iter()),
            task.clone(),
            TaskOptions { concurrency: 2, timeout: Duration::from_secs(1) },
            CancellationToken::new(),
        );
        handle.await.unwrap();
        assert_eq!(task.runs.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn bus_subscription_ends_with_channel() {
        let (tx, rx) = mpsc::channel(4);
        let mut source = BusSubscription::new(rx);
        tx.send(BusMessage::new("a", "{}")).await.unwrap();
        drop(tx);
        assert_eq!(source.next().await.map(|m| m.topic), Some("a".to_string()));
        assert!(source.next().await.is_none());
    }
}
