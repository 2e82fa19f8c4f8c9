//! [`Pipeline`] – owns the connection, the render-target pool and one
//! [`CaptureScheduler`] per configured stream.
//!
//! Shutdown runs in a fixed order so nothing is published into a closing
//! socket:
//!
//! 1. stop every scheduler and wait for its in-flight capture,
//! 2. unadvertise every topic that is still advertised,
//! 3. close the connection and stop its reconnect supervisor,
//! 4. free the pooled render targets.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use simbridge_hal::{FrameSource, PoolStats, RenderTargetPool, SceneSource};
use simbridge_middleware::{BridgeConnection, ConnectionConfig, Connector, EventBus, TopicPublisher};
use simbridge_middleware::publisher::DEFAULT_FRAME_ID;
use simbridge_types::{BridgeError, WallClock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::scheduler::{
    CaptureContext, CaptureScheduler, DEFAULT_DRAIN_TIMEOUT, StreamConfig, StreamStats,
};

/// Top-level pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub connection: ConnectionConfig,
    /// Default `header.frame_id` for streams that do not set one.
    pub frame_id: String,
    pub streams: Vec<StreamConfig>,
    /// Per-stream bound on waiting for the in-flight capture at shutdown.
    pub drain_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            frame_id: DEFAULT_FRAME_ID.to_string(),
            streams: Vec::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// External collaborators the pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub frames: Arc<dyn FrameSource>,
    pub scene: Arc<dyn SceneSource>,
    /// The pool `frames` renders into; cleared at shutdown.
    pub pool: Arc<RenderTargetPool>,
    pub clock: Arc<dyn WallClock>,
}

/// Counters for one stream at shutdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamReport {
    pub name: String,
    pub stats: StreamStats,
    pub sent: u64,
    pub dropped: u64,
}

/// Summary returned by [`Pipeline::shutdown`].
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub streams: Vec<StreamReport>,
    /// Topics unadvertised during shutdown.
    pub unadvertised: usize,
    /// Pool counters taken before the pool was cleared.
    pub pool: PoolStats,
}

/// The running publishing pipeline.
pub struct Pipeline {
    connection: Arc<BridgeConnection>,
    schedulers: Vec<Arc<CaptureScheduler>>,
    pool: Arc<RenderTargetPool>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Build every scheduler without starting anything.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Config`] for an invalid or duplicate stream.
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Result<Self, BridgeError> {
        let mut names = HashSet::new();
        for stream in &config.streams {
            if !names.insert(stream.name.as_str()) {
                return Err(BridgeError::Config(format!("duplicate stream name '{}'", stream.name)));
            }
        }

        let connection = BridgeConnection::with_bus(
            config.connection,
            collaborators.connector,
            EventBus::default(),
        );
        let context = CaptureContext {
            connection: Arc::clone(&connection),
            frames: collaborators.frames,
            scene: collaborators.scene,
            clock: collaborators.clock,
            frame_id: config.frame_id,
        };
        let schedulers = config
            .streams
            .into_iter()
            .map(|stream| {
                CaptureScheduler::new(stream, &context)
                    .map(|s| Arc::new(s.with_drain_timeout(config.drain_timeout)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            connection,
            schedulers,
            pool: collaborators.pool,
            shutdown_tx,
            tasks: Vec::new(),
            supervisor: None,
        })
    }

    /// Start the reconnect supervisor and every capture stream.
    /// Calling it again is a no-op.
    pub fn start(&mut self) {
        if self.supervisor.is_some() {
            return;
        }
        info!(
            endpoint = self.connection.endpoint(),
            streams = self.schedulers.len(),
            "starting pipeline"
        );
        self.supervisor = Some(self.connection.spawn());
        self.tasks = self
            .schedulers
            .iter()
            .map(|s| s.spawn(self.shutdown_tx.subscribe()))
            .collect();
    }

    pub fn connection(&self) -> &Arc<BridgeConnection> {
        &self.connection
    }

    pub fn bus(&self) -> &EventBus {
        self.connection.bus()
    }

    pub fn schedulers(&self) -> &[Arc<CaptureScheduler>] {
        &self.schedulers
    }

    /// Per-stream counters, in configuration order.
    pub fn stats(&self) -> Vec<(String, StreamStats)> {
        self.schedulers
            .iter()
            .map(|s| (s.name().to_string(), s.stats()))
            .collect()
    }

    /// Stop everything in order and report the final counters.
    pub async fn shutdown(mut self) -> PipelineReport {
        info!("shutting down pipeline");
        self.shutdown_tx.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "capture stream task ended abnormally");
            }
        }

        let publishers: Vec<Arc<TopicPublisher>> =
            self.schedulers.iter().flat_map(|s| s.publishers()).collect();
        let mut unadvertised = 0;
        for publisher in &publishers {
            match publisher.unadvertise() {
                Ok(true) => unadvertised += 1,
                Ok(false) => {}
                Err(e) => warn!(topic = publisher.topic().name(), error = %e, "unadvertise failed"),
            }
        }

        self.connection.close().await;
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                warn!(error = %e, "reconnect supervisor ended abnormally");
            }
        }

        let pool = self.pool.stats();
        self.pool.clear();

        let streams = self
            .schedulers
            .iter()
            .map(|s| {
                let publishers = s.publishers();
                StreamReport {
                    name: s.name().to_string(),
                    stats: s.stats(),
                    sent: publishers.iter().map(|p| p.sent()).sum(),
                    dropped: publishers.iter().map(|p| p.dropped()).sum(),
                }
            })
            .collect();
        info!(unadvertised, "pipeline stopped");

        PipelineReport {
            streams,
            unadvertised,
            pool,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::Value;
    use simbridge_hal::sim::{SimFrameSource, SimPattern, SimScene};
    use simbridge_middleware::transport::memory::MemoryConnector;
    use simbridge_types::{ConnectionState, PixelFormat, SystemClock};

    use crate::encode::DepthOutput;

    fn collaborators(connector: &MemoryConnector) -> Collaborators {
        let pool = Arc::new(RenderTargetPool::new());
        let frames = SimFrameSource::new(Arc::clone(&pool))
            .with_pattern("rgb", 4, 2, PixelFormat::Rgba8, SimPattern::Solid(1.0))
            .with_pattern("depth", 4, 2, PixelFormat::RFloat, SimPattern::Solid(2.0));
        Collaborators {
            connector: Arc::new(connector.clone()),
            frames: Arc::new(frames),
            scene: Arc::new(SimScene::new().with_object("Box", [0.0, 0.0, 1.0])),
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    fn config(streams: Vec<StreamConfig>) -> PipelineConfig {
        PipelineConfig {
            connection: ConnectionConfig {
                endpoint: "memory://pipeline".to_string(),
                ..ConnectionConfig::default()
            },
            streams,
            ..PipelineConfig::default()
        }
    }

    fn ops(connector: &MemoryConnector) -> Vec<(String, String)> {
        connector
            .sent()
            .iter()
            .map(|text| {
                let v: Value = serde_json::from_str(text).unwrap();
                (
                    v["op"].as_str().unwrap().to_string(),
                    v["topic"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn duplicate_stream_names_are_rejected() {
        let connector = MemoryConnector::new();
        let result = Pipeline::new(
            config(vec![
                StreamConfig::camera("rgb", "/a", 10.0),
                StreamConfig::camera("rgb", "/b", 10.0),
            ]),
            collaborators(&connector),
        );
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn invalid_stream_is_rejected() {
        let connector = MemoryConnector::new();
        let result = Pipeline::new(
            config(vec![StreamConfig::camera("rgb", "/a", 0.0)]),
            collaborators(&connector),
        );
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_publish_and_ordered_shutdown() {
        let connector = MemoryConnector::new();
        let mut pipeline = Pipeline::new(
            config(vec![
                StreamConfig::camera("rgb", "/unity_camera_1/rgb/compressed", 10.0),
                StreamConfig::depth(
                    "depth",
                    "/unity_camera_1/depth/compressed",
                    5.0,
                    DepthOutput::Png16,
                ),
                StreamConfig::objects("objects", "/unity/objects", 2.0),
            ]),
            collaborators(&connector),
        )
        .unwrap();
        pipeline.start();
        pipeline.start();

        tokio::time::sleep(Duration::from_millis(1_050)).await;
        assert_eq!(pipeline.connection().state(), ConnectionState::Open);
        let report = pipeline.shutdown().await;

        let ops = ops(&connector);
        for topic in [
            "/unity_camera_1/rgb/compressed",
            "/unity_camera_1/depth/compressed",
            "/unity/objects",
        ] {
            let positions: Vec<&str> = ops
                .iter()
                .filter(|(_, t)| t == topic)
                .map(|(op, _)| op.as_str())
                .collect();
            assert_eq!(positions.first(), Some(&"advertise"), "{topic}");
            assert_eq!(positions.last(), Some(&"unadvertise"), "{topic}");
            assert_eq!(positions.iter().filter(|op| **op == "advertise").count(), 1);
        }
        // Nothing is published after the first unadvertise.
        let first_unadvertise = ops.iter().position(|(op, _)| op == "unadvertise").unwrap();
        assert!(ops[first_unadvertise..].iter().all(|(op, _)| op == "unadvertise"));

        assert_eq!(report.unadvertised, 3);
        assert_eq!(connector.connect_calls(), 1);
        assert_eq!(connector.closes(), 1);

        let rgb = &report.streams[0];
        assert_eq!(rgb.name, "rgb");
        assert_eq!(rgb.stats.captures, 10);
        assert_eq!(rgb.sent, 10);
        assert_eq!(report.streams[1].sent, 5);
        assert_eq!(report.streams[2].sent, 2);

        // Buffers were recycled: one allocation per stream format.
        assert_eq!(report.pool.allocations, 2);
        assert!(report.pool.reuses > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_before_connect_is_clean() {
        let connector = MemoryConnector::with_script([false; 8]);
        let mut pipeline = Pipeline::new(
            config(vec![StreamConfig::camera("rgb", "/rgb", 10.0)]),
            collaborators(&connector),
        )
        .unwrap();
        pipeline.start();
        tokio::time::sleep(Duration::from_millis(350)).await;

        let report = pipeline.shutdown().await;
        assert_eq!(report.unadvertised, 0);
        assert_eq!(report.streams[0].sent, 0);
        assert_eq!(report.streams[0].dropped, 3);
        assert!(connector.sent().is_empty());
    }

    #[tokio::test]
    async fn shutdown_without_start() {
        let connector = MemoryConnector::new();
        let pipeline = Pipeline::new(config(vec![]), collaborators(&connector)).unwrap();
        let report = pipeline.shutdown().await;
        assert!(report.streams.is_empty());
        assert_eq!(connector.connect_calls(), 0);
    }
}
