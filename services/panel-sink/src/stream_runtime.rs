//! Kafka stream runtime for panel records.
//!
//! Each worker owns one consumer in the shared group and processes the
//! partitions assigned to it strictly in order. The upload for a record is
//! awaited before the next record is read, so a slow store slows consumption.

use crate::config::KafkaConfig;
use crate::error::SinkError;
use crate::panel_key::PanelKey;
use crate::security::{DeserializationPolicy, StreamSecurity};
use crate::upload_pipeline::{UploadOutcome, UploadPipeline};
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of the stream runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl RuntimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeState::Created => "created",
            RuntimeState::Running => "running",
            RuntimeState::Stopping => "stopping",
            RuntimeState::Stopped => "stopped",
        }
    }
}

/// Receives errors that end a worker. The runtime never restarts a worker
/// itself.
pub trait ErrorSink: Send + Sync {
    fn worker_failed(&self, worker: &str, error: &SinkError);
}

/// Error sink that writes the failure to the process log
#[derive(Debug, Default)]
pub struct LoggingErrorSink;

impl ErrorSink for LoggingErrorSink {
    fn worker_failed(&self, worker: &str, error: &SinkError) {
        error!(worker = %worker, error = %error, "Uncaught error in stream worker");
    }
}

/// Runtime state shared with the health endpoints
#[derive(Debug)]
pub struct RuntimeStatus {
    state: RwLock<RuntimeState>,
    live_workers: AtomicUsize,
}

impl RuntimeStatus {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RuntimeState::Created),
            live_workers: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: RuntimeState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    /// Running with at least one worker still consuming
    pub fn is_ready(&self) -> bool {
        self.state() == RuntimeState::Running && self.live_workers() > 0
    }
}

impl Default for RuntimeStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// What happened to a single record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Uploaded { bytes: usize },
    UploadFailed,
    /// Key could not be decoded into a dashboard and panel
    SkippedMalformedKey,
    /// Unreadable record under [`DeserializationPolicy::LogAndContinue`]
    SkippedUnreadable,
}

/// Turns raw records into panel uploads
pub struct RecordHandler {
    pipeline: Arc<UploadPipeline>,
    policy: DeserializationPolicy,
}

impl RecordHandler {
    pub fn new(pipeline: Arc<UploadPipeline>, policy: DeserializationPolicy) -> Self {
        Self { pipeline, policy }
    }

    /// Handle one record.
    ///
    /// Only a record without a value under fail-fast returns `Err`. Missing,
    /// undecodable or malformed keys and failed uploads are logged and count
    /// as handled.
    pub async fn handle_record(
        &self,
        partition: i32,
        offset: i64,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<RecordOutcome, SinkError> {
        metrics::counter!("panel_sink_records_total").increment(1);

        let value = match read_value(partition, offset, value) {
            Ok(value) => value,
            Err(e) => {
                return match self.policy {
                    DeserializationPolicy::FailFast => Err(e),
                    DeserializationPolicy::LogAndContinue => {
                        warn!(error = %e, "Skipping unreadable record");
                        metrics::counter!("panel_sink_records_skipped_total", "reason" => "unreadable")
                            .increment(1);
                        Ok(RecordOutcome::SkippedUnreadable)
                    }
                };
            }
        };

        let panel_key = match read_key(key).and_then(PanelKey::decode) {
            Ok(panel_key) => panel_key,
            Err(e) => {
                warn!(partition, offset, error = %e, "Skipping record with malformed key");
                metrics::counter!("panel_sink_records_skipped_total", "reason" => "malformed_key")
                    .increment(1);
                return Ok(RecordOutcome::SkippedMalformedKey);
            }
        };

        let outcome = match self
            .pipeline
            .handle(&panel_key, Bytes::copy_from_slice(value))
            .await
        {
            UploadOutcome::Uploaded { bytes } => RecordOutcome::Uploaded { bytes },
            UploadOutcome::Failed => RecordOutcome::UploadFailed,
        };

        Ok(outcome)
    }
}

/// Raw value of a record. A record without a value cannot carry a panel.
fn read_value(partition: i32, offset: i64, value: Option<&[u8]>) -> Result<&[u8], SinkError> {
    value.ok_or_else(|| SinkError::Deserialization {
        partition,
        offset,
        reason: "record has no value".to_string(),
    })
}

/// UTF-8 key of a record. Missing or undecodable keys are malformed keys.
fn read_key(key: Option<&[u8]>) -> Result<&str, SinkError> {
    let key = key.ok_or_else(|| SinkError::MalformedKey { key: String::new() })?;

    std::str::from_utf8(key).map_err(|_| SinkError::MalformedKey {
        key: String::from_utf8_lossy(key).into_owned(),
    })
}

/// What a worker does once a record has been handled
#[derive(Debug)]
enum RecordDisposition {
    /// Commit the offset and read the next record
    Commit(RecordOutcome),
    /// Leave the offset uncommitted and end the worker
    Exit(SinkError),
}

/// Every handled record is committed, whatever happened to its upload.
/// Only an error returned by the handler ends the worker.
fn record_disposition(result: Result<RecordOutcome, SinkError>) -> RecordDisposition {
    match result {
        Ok(outcome) => RecordDisposition::Commit(outcome),
        Err(e) => RecordDisposition::Exit(e),
    }
}

/// Build the consumer configuration for one worker
pub fn consumer_config(
    config: &KafkaConfig,
    security: &StreamSecurity,
    worker_index: usize,
) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("group.id", &config.app_id)
        .set("client.id", format!("{}-{}", config.app_id, worker_index))
        // Records produced while the sink is down are not replayed
        .set("auto.offset.reset", "latest")
        .set("enable.auto.commit", "false")
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

    security.apply(&mut client_config);

    client_config
}

/// Owns the consumer workers and their lifecycle
pub struct StreamRuntime {
    config: KafkaConfig,
    security: StreamSecurity,
    handler: Arc<RecordHandler>,
    error_sink: Arc<dyn ErrorSink>,
    status: Arc<RuntimeStatus>,
    shutdown_tx: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
}

impl StreamRuntime {
    pub fn new(
        config: KafkaConfig,
        security: StreamSecurity,
        pipeline: Arc<UploadPipeline>,
        error_sink: Arc<dyn ErrorSink>,
    ) -> Self {
        let handler = Arc::new(RecordHandler::new(
            pipeline,
            security.deserialization_policy,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            security,
            handler,
            error_sink,
            status: Arc::new(RuntimeStatus::new()),
            shutdown_tx,
            workers: Vec::new(),
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.status.state()
    }

    /// Shared status handle for health checks
    pub fn status(&self) -> Arc<RuntimeStatus> {
        self.status.clone()
    }

    /// Create the consumers, subscribe them and start consuming
    pub fn start(&mut self) -> Result<(), SinkError> {
        let state = self.state();
        if state != RuntimeState::Created {
            return Err(SinkError::InvalidState {
                operation: "start",
                state: state.as_str(),
            });
        }

        let mut consumers = Vec::with_capacity(self.config.num_stream_threads);
        for index in 0..self.config.num_stream_threads {
            let consumer: StreamConsumer =
                consumer_config(&self.config, &self.security, index).create()?;
            consumer.subscribe(&[self.config.topic.as_str()])?;
            consumers.push(consumer);
        }

        info!(
            topic = %self.config.topic,
            group = %self.config.app_id,
            workers = consumers.len(),
            profile = ?self.security.profile,
            "Subscribed to Kafka topic"
        );

        self.status.set_state(RuntimeState::Running);

        for (index, consumer) in consumers.into_iter().enumerate() {
            let worker = Worker {
                name: format!("{}-stream-{}", self.config.app_id, index),
                consumer,
                handler: self.handler.clone(),
                error_sink: self.error_sink.clone(),
                status: self.status.clone(),
            };
            let shutdown_rx = self.shutdown_tx.subscribe();

            self.status.live_workers.fetch_add(1, Ordering::SeqCst);
            self.workers.push(tokio::spawn(worker.run(shutdown_rx)));
        }

        Ok(())
    }

    /// Stop consuming, commit and close every consumer
    pub async fn stop(&mut self) {
        match self.state() {
            RuntimeState::Running => {}
            RuntimeState::Created => {
                self.status.set_state(RuntimeState::Stopped);
                return;
            }
            RuntimeState::Stopping | RuntimeState::Stopped => return,
        }

        info!("Stopping stream runtime");
        self.status.set_state(RuntimeState::Stopping);
        let _ = self.shutdown_tx.send(());

        // Handles stay in place so an interrupted stop can still abort them
        for handle in self.workers.iter_mut() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Stream worker did not finish cleanly");
            }
        }
        self.workers.clear();

        self.status.set_state(RuntimeState::Stopped);
        info!("Stream runtime stopped");
    }

    /// Abort workers that did not stop in time
    pub fn abort(&mut self) {
        for handle in self.workers.drain(..) {
            handle.abort();
        }
        self.status.live_workers.store(0, Ordering::SeqCst);
        self.status.set_state(RuntimeState::Stopped);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// One consuming task and the consumer it owns
struct Worker {
    name: String,
    consumer: StreamConsumer,
    handler: Arc<RecordHandler>,
    error_sink: Arc<dyn ErrorSink>,
    status: Arc<RuntimeStatus>,
}

impl Worker {
    async fn run(self, shutdown_rx: broadcast::Receiver<()>) {
        let result = match AssertUnwindSafe(self.consume(shutdown_rx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(SinkError::WorkerPanicked(panic_message(panic.as_ref()))),
        };

        self.status.live_workers.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(()) => {
                if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
                    debug!(worker = %self.name, error = %e, "No offsets committed on shutdown");
                }
                info!(worker = %self.name, "Stream worker finished");
            }
            Err(e) => self.error_sink.worker_failed(&self.name, &e),
        }
    }

    #[instrument(skip(self, shutdown_rx), fields(worker = %self.name))]
    async fn consume(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), SinkError> {
        let mut message_stream = self.consumer.stream();

        info!("Starting stream worker");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                message_result = message_stream.next() => {
                    match message_result {
                        Some(Ok(message)) => {
                            let result = self
                                .handler
                                .handle_record(
                                    message.partition(),
                                    message.offset(),
                                    message.key(),
                                    message.payload(),
                                )
                                .await;

                            match record_disposition(result) {
                                RecordDisposition::Commit(outcome) => {
                                    debug!(?outcome, offset = message.offset(), "Record handled");
                                    if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                                        warn!(error = %e, "Failed to commit offset");
                                    }
                                }
                                RecordDisposition::Exit(e) => return Err(e),
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Kafka consumer error");
                            metrics::counter!("panel_sink_kafka_errors_total").increment(1);
                        }
                        None => {
                            debug!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::kafka_config;
    use crate::object_store::{MockObjectStore, StoreError};
    use crate::upload_pipeline::content_md5;
    use std::sync::Mutex;

    fn handler_with(store: MockObjectStore, policy: DeserializationPolicy) -> RecordHandler {
        let pipeline = Arc::new(UploadPipeline::new(Arc::new(store), "grafana-panels"));
        RecordHandler::new(pipeline, policy)
    }

    #[derive(Default)]
    struct RecordingErrorSink {
        failures: Mutex<Vec<String>>,
    }

    impl ErrorSink for RecordingErrorSink {
        fn worker_failed(&self, worker: &str, error: &SinkError) {
            self.failures
                .lock()
                .unwrap()
                .push(format!("{}: {}", worker, error));
        }
    }

    #[tokio::test]
    async fn test_upload_failure_does_not_block_later_records() {
        let image = vec![0x89u8; 42];
        let image_md5 = content_md5(&image);

        let mut store = MockObjectStore::new();
        store
            .expect_put_object()
            .withf(move |bucket, request| {
                bucket == "grafana-panels"
                    && request.key == "dash1_panelA.png"
                    && request.content_length == 42
                    && request.content_md5 == image_md5
                    && request.acl == crate::object_store::CannedAcl::PublicRead
            })
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_put_object()
            .withf(|_, request| request.key == "dash1_panelB.png")
            .times(1)
            .returning(|_, _| {
                Err(StoreError::Request {
                    operation: "PutObject",
                    message: "injected failure".to_string(),
                })
            });
        store
            .expect_put_object()
            .withf(|_, request| request.key == "dash2_panelC.png")
            .times(1)
            .returning(|_, _| Ok(()));

        let handler = handler_with(store, DeserializationPolicy::FailFast);

        let first = handler
            .handle_record(0, 1, Some(b"dash1_panelA"), Some(image.as_slice()))
            .await
            .unwrap();
        let second = handler
            .handle_record(0, 2, Some(b"dash1:panelB"), Some(image.as_slice()))
            .await
            .unwrap();
        let third = handler
            .handle_record(0, 3, Some(b"dash2_panelC"), Some(image.as_slice()))
            .await
            .unwrap();

        assert_eq!(first, RecordOutcome::Uploaded { bytes: 42 });
        assert_eq!(second, RecordOutcome::UploadFailed);
        assert_eq!(third, RecordOutcome::Uploaded { bytes: 42 });
    }

    #[tokio::test]
    async fn test_malformed_key_is_skipped() {
        let mut store = MockObjectStore::new();
        store.expect_put_object().never();

        let handler = handler_with(store, DeserializationPolicy::FailFast);
        let outcome = handler
            .handle_record(0, 1, Some(b"no-separator"), Some(b"png"))
            .await
            .unwrap();

        assert_eq!(outcome, RecordOutcome::SkippedMalformedKey);
    }

    #[tokio::test]
    async fn test_missing_value_fails_fast() {
        let mut store = MockObjectStore::new();
        store.expect_put_object().never();

        let handler = handler_with(store, DeserializationPolicy::FailFast);

        let err = handler
            .handle_record(3, 19, Some(b"dash_panel"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SinkError::Deserialization { partition: 3, offset: 19, .. }
        ));
        assert!(err.is_fatal_to_worker());
    }

    #[tokio::test]
    async fn test_undecodable_key_is_skipped_and_worker_continues() {
        let mut store = MockObjectStore::new();
        store
            .expect_put_object()
            .withf(|_, request| request.key == "dash2_panelC.png")
            .times(1)
            .returning(|_, _| Ok(()));

        let handler = handler_with(store, DeserializationPolicy::FailFast);

        let outcome = handler
            .handle_record(0, 1, Some(b"dash\xe9_p"), Some(b"png"))
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::SkippedMalformedKey);

        let outcome = handler
            .handle_record(0, 2, None, Some(b"png"))
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::SkippedMalformedKey);

        let outcome = handler
            .handle_record(0, 3, Some(b"dash2_panelC"), Some(b"png"))
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::Uploaded { bytes: 3 });
    }

    #[test]
    fn test_handled_records_are_committed() {
        let outcomes = [
            RecordOutcome::Uploaded { bytes: 42 },
            RecordOutcome::UploadFailed,
            RecordOutcome::SkippedMalformedKey,
            RecordOutcome::SkippedUnreadable,
        ];

        for outcome in outcomes {
            assert!(matches!(
                record_disposition(Ok(outcome)),
                RecordDisposition::Commit(committed) if committed == outcome
            ));
        }
    }

    #[test]
    fn test_handler_error_ends_worker() {
        let disposition = record_disposition(Err(SinkError::Deserialization {
            partition: 0,
            offset: 5,
            reason: "record has no value".to_string(),
        }));

        assert!(matches!(
            disposition,
            RecordDisposition::Exit(SinkError::Deserialization { offset: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_unreadable_record_skipped_when_lenient() {
        let mut store = MockObjectStore::new();
        store.expect_put_object().never();

        let handler = handler_with(store, DeserializationPolicy::LogAndContinue);
        let outcome = handler
            .handle_record(0, 1, Some(b"dash_panel"), None)
            .await
            .unwrap();

        assert_eq!(outcome, RecordOutcome::SkippedUnreadable);
    }

    #[test]
    fn test_consumer_config() {
        let mut config = kafka_config();
        config.username = Some("srvkafkaclient".to_string());
        config.password = Some("kafkaclient".to_string());
        let security = StreamSecurity::select(&config);

        let client_config = consumer_config(&config, &security, 0);

        assert_eq!(client_config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(
            client_config.get("group.id"),
            Some("grafana-image-exporter-sink-v1")
        );
        assert_eq!(client_config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(client_config.get("enable.auto.commit"), Some("false"));
        assert_eq!(client_config.get("security.protocol"), Some("sasl_plaintext"));
        assert_eq!(client_config.get("sasl.username"), Some("srvkafkaclient"));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let config = kafka_config();
        let security = StreamSecurity::select(&config);
        let pipeline = Arc::new(UploadPipeline::new(
            Arc::new(MockObjectStore::new()),
            "grafana-panels",
        ));
        let sink = Arc::new(RecordingErrorSink::default());

        let mut runtime = StreamRuntime::new(config, security, pipeline, sink.clone());
        assert_eq!(runtime.state(), RuntimeState::Created);
        assert!(!runtime.status().is_ready());

        runtime.stop().await;
        assert_eq!(runtime.state(), RuntimeState::Stopped);

        let err = runtime.start().unwrap_err();
        assert!(matches!(err, SinkError::InvalidState { operation: "start", .. }));
        assert!(sink.failures.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(payload.as_ref()), "kaboom");
    }

    #[test]
    fn test_logging_error_sink_accepts_failures() {
        let sink = LoggingErrorSink;
        sink.worker_failed(
            "grafana-image-exporter-sink-v1-stream-0",
            &SinkError::WorkerPanicked("boom".to_string()),
        );
    }
}
