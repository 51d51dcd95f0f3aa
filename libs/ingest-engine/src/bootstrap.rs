use std::sync::Arc;
use std::time::Duration;

use ingest_api::clock::Clock;
use ingest_api::metrics::MetricsSink;
use ingest_api::object::ObjectStore;
use ingest_api::record::BatchSource;
use ingest_api::store::RelationalStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::compactor::{BatchCompactor, CompactorSettings};
use crate::config::IngestConfig;
use crate::consumer::{ConsumerSettings, StreamConsumer};
use crate::dispatcher::{NotificationTarget, ObjectNotificationDispatcher};
use crate::error::EngineError;
use crate::filter::TopicRule;
use crate::ingress::{BusMessage, Ingress, IngressTask};
use crate::loader::{BatchLoader, LoaderSettings, LoaderTask};
use crate::objects::WatchedObjectStore;
use crate::queue::{MemoryQueue, QueueSettings};
use crate::retention::RetentionJob;
use crate::router::{Route, TopicRouter};
use crate::stream::MemoryStream;
use crate::task::{BusSubscription, QueuePoll, StorageWatch, Tick, TaskOptions, spawn_task};
use crate::validate::JsonValidator;

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Runtime collaborators injected into the engine.
#[derive(Clone)]
pub struct Substrate {
    pub objects: Arc<dyn ObjectStore>,
    pub store: Arc<dyn RelationalStore>,
    pub metrics: Arc<dyn MetricsSink>,
    pub clock: Arc<dyn Clock>,
}

/// Live handles of one pipeline.
pub struct PipelineHandle {
    pub name: String,
    pub source: BatchSource,
    pub object_prefix: String,
    pub stream: Arc<MemoryStream>,
    pub queue: Arc<MemoryQueue>,
}

impl PipelineHandle {
    pub fn dead_letter(&self) -> Option<&Arc<MemoryQueue>> {
        self.queue.dead_letter()
    }
}

/// The running ingestion pipeline.
pub struct Engine {
    pipelines: Vec<PipelineHandle>,
    router: Arc<TopicRouter>,
    objects: Arc<dyn ObjectStore>,
    bus_tx: mpsc::Sender<BusMessage>,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("pipelines", &self.pipelines.iter().map(|p| &p.name).collect::<Vec<_>>())
            .field("tasks", &self.handles.len())
            .finish()
    }
}

impl Engine {
    /// Build every pipeline from config and start all workers.
    ///
    /// Objects left under a pipeline prefix by an earlier run are announced
    /// again before the compactors start.
    pub async fn bootstrap(config: IngestConfig, substrate: Substrate) -> Result<Self, EngineError> {
        config.validate()?;

        let clock = substrate.clock.clone();
        let token = CancellationToken::new();
        let (watched, object_events) = WatchedObjectStore::new(substrate.objects.clone());
        let objects: Arc<dyn ObjectStore> = Arc::new(watched);

        let mut pipelines = Vec::with_capacity(config.pipelines.len());
        let mut routes = Vec::new();
        let mut targets = Vec::new();
        let mut compactors = Vec::new();
        let mut consumers = Vec::new();

        for p in &config.pipelines {
            let prefix = p.object_prefix();
            let stream = Arc::new(MemoryStream::new(&p.name, p.shard_count, p.retention(), clock.clone()));
            let dead_letter = Arc::new(MemoryQueue::new(
                format!("{}-dlq", p.name),
                QueueSettings::dead_letter(&p.queue),
                clock.clone(),
            ));
            let queue = Arc::new(
                MemoryQueue::new(&p.name, QueueSettings::primary(&p.queue), clock.clone())
                    .with_dead_letter(dead_letter),
            );

            let rule = TopicRule::parse(&p.topic_filter).map_err(|e| e.with_context(&p.name))?;
            routes.push(Route::new(&p.name, rule, p.partition, stream.clone()));
            targets.push(NotificationTarget {
                pipeline: p.name.clone(),
                source: p.source,
                prefix: prefix.clone(),
                queue: queue.clone(),
            });

            compactors.push(BatchCompactor::new(
                &p.name,
                &prefix,
                stream.clone(),
                objects.clone(),
                clock.clone(),
                CompactorSettings::from(&p.compactor),
            )?);

            if p.consumer.enabled {
                consumers.push(Arc::new(StreamConsumer::new(
                    &p.name,
                    stream.clone(),
                    Arc::new(JsonValidator::new(&p.consumer.required_fields)),
                    substrate.metrics.clone(),
                    ConsumerSettings::from(&p.consumer),
                )));
            }

            tracing::info!(
                pipeline = %p.name,
                filter = %p.topic_filter,
                shards = p.shard_count,
                partition = ?p.partition,
                prefix = %prefix,
                "pipeline created"
            );
            pipelines.push(PipelineHandle {
                name: p.name.clone(),
                source: p.source,
                object_prefix: prefix,
                stream,
                queue,
            });
        }

        let dispatcher = Arc::new(ObjectNotificationDispatcher::new(targets));
        for p in &pipelines {
            let pending = substrate.objects.list(&p.object_prefix).await?;
            for object in &pending {
                dispatcher.dispatch(object).await?;
            }
            if !pending.is_empty() {
                tracing::info!(pipeline = %p.name, objects = pending.len(), "re-announced pending objects");
            }
        }

        let mut handles = Vec::new();

        handles.push(spawn_task(
            StorageWatch::new(object_events),
            dispatcher,
            TaskOptions { concurrency: 1, timeout: DISPATCH_TIMEOUT },
            token.clone(),
        ));

        let loader = Arc::new(BatchLoader::new(
            objects.clone(),
            substrate.store.clone(),
            substrate.metrics.clone(),
            clock.clone(),
            LoaderSettings::from(&config.loader),
        ));
        for (p, cfg) in pipelines.iter().zip(&config.pipelines) {
            let poll = QueuePoll::new(
                p.queue.clone(),
                cfg.queue.batch_size,
                Duration::from_secs(cfg.queue.max_batching_window_secs),
                Duration::from_millis(cfg.queue.poll_interval_ms),
            );
            handles.push(spawn_task(
                poll,
                Arc::new(LoaderTask::new(loader.clone(), p.queue.clone())),
                TaskOptions {
                    concurrency: cfg.queue.max_concurrency,
                    timeout: Duration::from_secs(config.loader.invocation_timeout_secs),
                },
                token.clone(),
            ));
        }

        let mut retained: Vec<String> = pipelines.iter().map(|p| p.object_prefix.clone()).collect();
        retained.push(format!("{}/", config.loader.processed_prefix.trim_matches('/')));
        let retention = RetentionJob::new(
            objects.clone(),
            substrate.store.clone(),
            clock.clone(),
            RetentionJob::days(config.retention.days_keep),
            retained,
        );
        handles.push(spawn_task(
            Tick::new(Duration::from_secs(config.retention.interval_secs.max(1))),
            Arc::new(retention),
            TaskOptions {
                concurrency: 1,
                timeout: Duration::from_secs(config.retention.invocation_timeout_secs),
            },
            token.clone(),
        ));

        for compactor in compactors {
            handles.push(tokio::spawn(compactor.run(token.clone())));
        }
        for consumer in consumers {
            handles.extend(consumer.spawn(token.clone()));
        }

        let router = Arc::new(TopicRouter::new(routes, clock.clone()));
        let (bus_tx, bus_rx) = mpsc::channel(config.bus.channel_buffer);
        let ingress = Ingress::new(&config.bus.broker, config.bus.annotate, clock);
        // One invocation at a time keeps bus order within each shard.
        handles.push(spawn_task(
            BusSubscription::new(bus_rx),
            Arc::new(IngressTask::new(ingress, router.clone())),
            TaskOptions {
                concurrency: 1,
                timeout: Duration::from_secs(config.bus.invocation_timeout_secs),
            },
            token.clone(),
        ));

        tracing::info!(pipelines = pipelines.len(), tasks = handles.len(), "engine started");
        Ok(Self { pipelines, router, objects, bus_tx, token, handles })
    }

    /// Sender side of the inbound bus.
    pub fn bus(&self) -> mpsc::Sender<BusMessage> {
        self.bus_tx.clone()
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    /// Object store as seen by the pipeline: writes through it are announced.
    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    pub fn pipelines(&self) -> &[PipelineHandle] {
        &self.pipelines
    }

    pub fn pipeline(&self, name: &str) -> Result<&PipelineHandle, EngineError> {
        self.pipelines
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| EngineError::PipelineNotFound(name.to_string()))
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel every worker and wait for them. Compactors flush what they hold.
    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker ended abnormally");
            }
        }
        tracing::info!("engine shut down");
    }
}
