//! Job lifecycle orchestration, chunked parallel uploads with retry, and
//! the streaming upload sink steps push graph objects into as they run.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::graph_object_store::GraphObjectStore;
use crate::types::{Entity, Relationship, SynchronizationJob};

use super::client::{new_correlation_id, SyncClient, UploadOutcome};
use super::shrink::{shrink_raw_data, UPLOAD_SIZE_MAX};

pub const UPLOAD_BATCH_SIZE: usize = 250;
pub const UPLOAD_CONCURRENCY: usize = 6;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Multiplicative backoff factor. 1.05 is so close to 1 that retries
    /// are effectively fixed-delay; kept configurable rather than
    /// hardcoded.
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            factor: 1.05,
        }
    }
}

/// Uploads one batch with the attempt/backoff/error-branch policy from
/// §4.5's retry table. `batch` is mutated in place if a shrink occurs.
pub async fn upload_data_chunk(
    client: &dyn SyncClient,
    job_id: &str,
    kind: &str,
    batch: &mut Value,
    policy: RetryPolicy,
) -> EngineResult<()> {
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let correlation_id = new_correlation_id();
        let outcome = client
            .upload_data_chunk(job_id, kind, &correlation_id, batch)
            .await;

        match outcome {
            UploadOutcome::Success => return Ok(()),
            UploadOutcome::TooLarge => {
                shrink_raw_data(batch, UPLOAD_SIZE_MAX)
                    .map_err(EngineError::UploadFailed)?;
                if attempt >= policy.max_attempts {
                    return Err(EngineError::synchronization_api(
                        "REQUEST_ENTITY_TOO_LARGE",
                        "exhausted retry attempts while shrinking payload",
                        false,
                    ));
                }
                // Retry immediately with the shrunken batch; no log, no delay growth
                // beyond the normal backoff below.
            }
            UploadOutcome::JobEnded { message } => {
                return Err(EngineError::synchronization_api(
                    "INTEGRATION_UPLOAD_AFTER_JOB_ENDED",
                    message,
                    true,
                ));
            }
            UploadOutcome::Failed { code, message } => {
                if attempt >= policy.max_attempts {
                    return Err(EngineError::synchronization_api(
                        code.unwrap_or_else(|| "UNKNOWN".to_string()),
                        message,
                        false,
                    ));
                }
                let is_credentials_error = code.as_deref() == Some(super::client::CREDENTIALS_ERROR);
                if !is_credentials_error {
                    warn!(job_id, kind, attempt, "upload chunk failed: {message}");
                }
            }
        }

        sleep(delay).await;
        delay = delay.mul_f64(policy.factor);
    }
}

fn chunk_to_value<T: serde::Serialize>(key: &str, items: &[T]) -> Value {
    serde_json::json!({ key: items })
}

/// Chunks `entities`/`relationships` into batches of `UPLOAD_BATCH_SIZE`
/// and dispatches up to `UPLOAD_CONCURRENCY` batches in parallel.
pub async fn upload_graph_object_data(
    client: &Arc<dyn SyncClient>,
    job_id: &str,
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
    policy: RetryPolicy,
) -> EngineResult<()> {
    upload_kind(client, job_id, "entities", entities, policy).await?;
    upload_kind(client, job_id, "relationships", relationships, policy).await?;
    Ok(())
}

async fn upload_kind<T: serde::Serialize + Send + Sync + 'static>(
    client: &Arc<dyn SyncClient>,
    job_id: &str,
    kind: &'static str,
    items: Vec<T>,
    policy: RetryPolicy,
) -> EngineResult<()> {
    if items.is_empty() {
        return Ok(());
    }

    let batches: Vec<Value> = items
        .chunks(UPLOAD_BATCH_SIZE)
        .map(|chunk| chunk_to_value(kind, chunk))
        .collect();

    let mut in_flight = FuturesUnordered::new();
    let mut remaining = batches.into_iter();
    let mut first_error: Option<EngineError> = None;

    for _ in 0..UPLOAD_CONCURRENCY {
        if let Some(mut batch) = remaining.next() {
            let client = client.clone();
            let job_id = job_id.to_string();
            in_flight.push(tokio::spawn(async move {
                upload_data_chunk(client.as_ref(), &job_id, kind, &mut batch, policy).await
            }));
        } else {
            break;
        }
    }

    while let Some(joined) = in_flight.next().await {
        let result = joined.expect("upload task panicked");
        if let Err(e) = result {
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
        // Once any batch has failed, stop admitting new ones — just drain
        // what's already in flight. Matches the "no further retries" stop
        // semantics a fatal response (e.g. JOB_NOT_AWAITING_UPLOADS) needs.
        if first_error.is_none() {
            if let Some(mut batch) = remaining.next() {
                let client = client.clone();
                let job_id = job_id.to_string();
                in_flight.push(tokio::spawn(async move {
                    upload_data_chunk(client.as_ref(), &job_id, kind, &mut batch, policy).await
                }));
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn parse_ndjson<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> EngineResult<Vec<T>> {
    let contents = fs::read_to_string(path)?;
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(EngineError::from))
        .collect()
}

/// Iterates every persisted graph-object file under `store` and uploads
/// it (§4.5 `uploadCollectedData`).
pub async fn upload_collected_data(
    client: &Arc<dyn SyncClient>,
    job_id: &str,
    store: &GraphObjectStore,
    policy: RetryPolicy,
) -> EngineResult<()> {
    for path in store.persisted_files("entities")? {
        let entities: Vec<Entity> = parse_ndjson(&path)?;
        upload_graph_object_data(client, job_id, entities, Vec::new(), policy).await?;
    }
    for path in store.persisted_files("relationships")? {
        let relationships: Vec<Relationship> = parse_ndjson(&path)?;
        upload_graph_object_data(client, job_id, Vec::new(), relationships, policy).await?;
    }
    Ok(())
}

/// Streaming sink a step's `JobState` pushes entities/relationships into
/// as it runs, instead of waiting for the bulk `uploadCollectedData` pass
/// after the step completes.
pub struct UploadSink {
    client: Arc<dyn SyncClient>,
    job_id: String,
    policy: RetryPolicy,
    entities: AsyncMutex<Vec<Entity>>,
    relationships: AsyncMutex<Vec<Relationship>>,
    in_flight: AsyncMutex<Vec<JoinHandle<EngineResult<()>>>>,
}

impl UploadSink {
    pub fn new(client: Arc<dyn SyncClient>, job_id: impl Into<String>) -> Self {
        UploadSink {
            client,
            job_id: job_id.into(),
            policy: RetryPolicy::default(),
            entities: AsyncMutex::new(Vec::new()),
            relationships: AsyncMutex::new(Vec::new()),
            in_flight: AsyncMutex::new(Vec::new()),
        }
    }

    pub async fn enqueue_entity(&self, entity: Entity) {
        let mut buf = self.entities.lock().await;
        buf.push(entity);
        if buf.len() >= UPLOAD_BATCH_SIZE {
            let batch = std::mem::take(&mut *buf);
            drop(buf);
            self.dispatch(batch, Vec::new()).await;
        }
    }

    pub async fn enqueue_relationship(&self, relationship: Relationship) {
        let mut buf = self.relationships.lock().await;
        buf.push(relationship);
        if buf.len() >= UPLOAD_BATCH_SIZE {
            let batch = std::mem::take(&mut *buf);
            drop(buf);
            self.dispatch(Vec::new(), batch).await;
        }
    }

    async fn dispatch(&self, entities: Vec<Entity>, relationships: Vec<Relationship>) {
        let client = self.client.clone();
        let job_id = self.job_id.clone();
        let policy = self.policy;
        let handle = tokio::spawn(async move {
            upload_graph_object_data(&client, &job_id, entities, relationships, policy).await
        });
        self.in_flight.lock().await.push(handle);
    }

    /// Flushes any partial batches and waits for every dispatched upload
    /// to complete, surfacing the first error encountered.
    pub async fn wait_until_complete(&self) -> EngineResult<()> {
        {
            let mut buf = self.entities.lock().await;
            if !buf.is_empty() {
                let batch = std::mem::take(&mut *buf);
                drop(buf);
                self.dispatch(batch, Vec::new()).await;
            }
        }
        {
            let mut buf = self.relationships.lock().await;
            if !buf.is_empty() {
                let batch = std::mem::take(&mut *buf);
                drop(buf);
                self.dispatch(Vec::new(), batch).await;
            }
        }

        let handles = std::mem::take(&mut *self.in_flight.lock().await);
        let mut first_error = None;
        for handle in handles {
            match handle.await.expect("upload task panicked") {
                Ok(()) => {}
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(_) => {}
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Runs the full job lifecycle: initiate, upload everything persisted in
/// `store`, then finalize (or abort on any failure). Owns the event
/// publisher and its drain-task handle so it can await the queue's idle
/// state before returning, regardless of outcome.
pub async fn synchronize_collected_data(
    client: Arc<dyn SyncClient>,
    integration_instance_id: &str,
    store: &GraphObjectStore,
    partial_datasets: Value,
    events: super::events::EventPublisher,
    events_handle: super::events::EventPublisherHandle,
    policy: RetryPolicy,
) -> EngineResult<SynchronizationJob> {
    let result = run_job_lifecycle(
        &client,
        integration_instance_id,
        store,
        partial_datasets,
        &events,
        policy,
    )
    .await;

    drop(events);
    events_handle.shutdown().await;

    result
}

async fn run_job_lifecycle(
    client: &Arc<dyn SyncClient>,
    integration_instance_id: &str,
    store: &GraphObjectStore,
    partial_datasets: Value,
    events: &super::events::EventPublisher,
    policy: RetryPolicy,
) -> EngineResult<SynchronizationJob> {
    events.publish("sync.initiate.start", integration_instance_id);
    let job = client.initiate(integration_instance_id).await?;
    info!(job_id = %job.id, "synchronization job initiated");
    events.publish("sync.initiate.complete", &job.id);

    let upload_result = upload_collected_data(client, &job.id, store, policy).await;

    match upload_result {
        Ok(()) => {
            events.publish("sync.upload.complete", &job.id);
            let finalized = client.finalize(&job.id, &partial_datasets).await?;
            events.publish("sync.finalize.complete", &job.id);
            Ok(finalized)
        }
        Err(err) => {
            events.publish("sync.upload.failed", err.to_string());
            let reason = err.to_string();
            match client.abort(&job.id, &reason).await {
                Ok(_) => {}
                Err(abort_err) => {
                    warn!(job_id = %job.id, "abort failed: {abort_err}");
                    return Err(abort_err);
                }
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct RecordingClient {
        attempts: Arc<AtomicUsize>,
        aborted: Arc<Mutex<bool>>,
        fail_with_job_ended: bool,
    }

    #[async_trait]
    impl SyncClient for RecordingClient {
        async fn initiate(&self, integration_instance_id: &str) -> EngineResult<SynchronizationJob> {
            Ok(SynchronizationJob {
                id: "job-1".into(),
                integration_job_id: None,
                integration_instance_id: integration_instance_id.to_string(),
                status: "AWAITING_UPLOADS".into(),
            })
        }

        async fn upload_data_chunk(
            &self,
            _job_id: &str,
            _kind: &str,
            _correlation_id: &str,
            _batch: &Value,
        ) -> UploadOutcome {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_with_job_ended {
                return UploadOutcome::JobEnded {
                    message: "job ended".into(),
                };
            }
            UploadOutcome::Success
        }

        async fn finalize(
            &self,
            job_id: &str,
            _partial_datasets: &Value,
        ) -> EngineResult<SynchronizationJob> {
            Ok(SynchronizationJob {
                id: job_id.into(),
                integration_job_id: None,
                integration_instance_id: "i".into(),
                status: "FINALIZE_PENDING".into(),
            })
        }

        async fn abort(&self, job_id: &str, _reason: &str) -> EngineResult<SynchronizationJob> {
            *self.aborted.lock().await = true;
            Ok(SynchronizationJob {
                id: job_id.into(),
                integration_job_id: None,
                integration_instance_id: "i".into(),
                status: "ABORTED".into(),
            })
        }
    }

    #[tokio::test]
    async fn fatal_job_ended_stops_retries_and_triggers_abort() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let aborted = Arc::new(Mutex::new(false));
        let client: Arc<dyn SyncClient> = Arc::new(RecordingClient {
            attempts: attempts.clone(),
            aborted: aborted.clone(),
            fail_with_job_ended: true,
        });

        let tmp = tempfile::tempdir().unwrap();
        let store = GraphObjectStore::new(tmp.path());
        store.add_entity(
            "step-a",
            Entity {
                _key: "k1".into(),
                _type: "host".into(),
                _class: vec!["Host".into()],
                properties: serde_json::Map::new(),
                _raw_data: None,
            },
        );
        store.flush("step-a").unwrap();

        let (events, handle) = super::super::events::EventPublisher::spawn(|_e| async {});

        let result = synchronize_collected_data(
            client.clone(),
            "instance-1",
            &store,
            serde_json::json!({}),
            events,
            handle,
            RetryPolicy::default(),
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            EngineError::SynchronizationApi { fatal: true, .. }
        ));

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(*aborted.lock().await);
    }

    #[tokio::test]
    async fn successful_upload_finalizes_job() {
        let client: Arc<dyn SyncClient> = Arc::new(RecordingClient {
            attempts: Arc::new(AtomicUsize::new(0)),
            aborted: Arc::new(Mutex::new(false)),
            fail_with_job_ended: false,
        });

        let tmp = tempfile::tempdir().unwrap();
        let store = GraphObjectStore::new(tmp.path());
        store.add_entity(
            "step-a",
            Entity {
                _key: "k1".into(),
                _type: "host".into(),
                _class: vec!["Host".into()],
                properties: serde_json::Map::new(),
                _raw_data: None,
            },
        );
        store.flush("step-a").unwrap();

        let (events, handle) = super::super::events::EventPublisher::spawn(|_e| async {});

        let job = synchronize_collected_data(
            client,
            "instance-1",
            &store,
            serde_json::json!({}),
            events,
            handle,
            RetryPolicy::default(),
        )
        .await
        .unwrap();

        assert_eq!(job.status, "FINALIZE_PENDING");
    }
}
