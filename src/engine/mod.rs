//! Incremental decision engine
//!
//! For each unit of work the engine decides between three paths:
//!
//! 1. **Up to date**: the input fingerprint and implementation match the
//!    recorded execution state and every declared output is still exactly as
//!    recorded. Nothing runs and nothing is looked up.
//! 2. **Cache hit**: the unit is cacheable and the build cache has an entry for
//!    its key. Stale outputs are removed, the entry is restored and the state
//!    is recorded.
//! 3. **Must execute**: the work runs with the input changes since the last
//!    recorded execution. On success the outputs are snapshotted, packed into
//!    the build cache and the state recorded; on failure nothing is recorded.
//!
//! The input fingerprint is taken once, before the work runs, and that is the
//! fingerprint recorded. A unit that rewrites its own inputs therefore runs
//! again on the next build and settles once its output is stable.

mod result;
mod unit;

pub use result::{Outcome, WorkResult, WorkState};
pub use unit::UnitOfWork;

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{CacheError, Result};
use crate::fingerprint::{Fingerprinter, InputChanges, InputFingerprint, OutputSnapshot};
use crate::key::{CacheKey, ContentHash};
use crate::logging::{operations, services, status};
use crate::outputs::{self, OriginMetadata};
use crate::service::BuildCacheService;
use crate::state::{TaskExecutionState, TaskStateStore};

/// Outcome of [`IncrementalEngine::decide`]
#[derive(Debug)]
pub enum Decision {
    /// Up to date or restored from cache; the work must not run
    Skip(WorkResult),
    /// The work must run; hand the result to [`IncrementalEngine::complete`]
    Execute(PendingExecution),
}

impl Decision {
    pub fn state(&self) -> WorkState {
        match self {
            Self::Skip(result) => result.state(),
            Self::Execute(_) => WorkState::MustExecute,
        }
    }
}

/// Everything decided before the work runs
#[derive(Debug)]
pub struct PendingExecution {
    identity: String,
    fingerprint: InputFingerprint,
    implementation: ContentHash,
    cache_key: Option<CacheKey>,
    outputs: Vec<String>,
    changes: InputChanges,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl PendingExecution {
    /// Input changes to hand to the work
    pub fn changes(&self) -> &InputChanges {
        &self.changes
    }

    pub fn cache_key(&self) -> Option<&CacheKey> {
        self.cache_key.as_ref()
    }
}

/// Decides, executes and records units of work
///
/// Cheap to share: wrap in an `Arc` and evaluate units from many tasks.
pub struct IncrementalEngine {
    fingerprinter: Arc<Fingerprinter>,
    states: Arc<TaskStateStore>,
    cache: Arc<dyn BuildCacheService>,
    cancel: CancellationToken,
}

impl IncrementalEngine {
    pub fn new(
        states: Arc<TaskStateStore>,
        cache: Arc<dyn BuildCacheService>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fingerprinter: Arc::new(Fingerprinter::new()),
            states,
            cache,
            cancel,
        }
    }

    pub fn states(&self) -> &Arc<TaskStateStore> {
        &self.states
    }

    /// Decide, run `execute` when needed, and record the result
    ///
    /// `execute` is called exactly once when the unit must run and never
    /// otherwise. Its error is carried in [`WorkResult::failure`]; only input
    /// I/O failures, configuration errors and cancellation return `Err`.
    pub async fn evaluate<F, Fut>(&self, unit: &UnitOfWork, execute: F) -> Result<WorkResult>
    where
        F: FnOnce(InputChanges) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let span = info_span!("evaluate", unit = %unit.identity);
        async {
            let decision = self.decide(unit).await?;
            debug!(
                "{}: {:?} -> {:?}",
                unit.identity,
                WorkState::default(),
                decision.state()
            );
            match decision {
                Decision::Skip(result) => Ok(result),
                Decision::Execute(pending) => {
                    if self.cancel.is_cancelled() {
                        return Err(CacheError::Cancelled);
                    }
                    let outcome = execute(pending.changes.clone()).await;
                    Ok(self.complete(unit, pending, outcome).await)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// First phase: fingerprint and try to avoid running the work
    pub async fn decide(&self, unit: &UnitOfWork) -> Result<Decision> {
        let started_at = Utc::now();
        let started = Instant::now();

        let fingerprint = self.fingerprint_inputs(unit).await?;
        let implementation = ContentHash::of(unit.implementation.as_bytes());
        let cacheable = unit.is_effectively_cacheable();
        let outputs = unit
            .relative_outputs()
            .unwrap_or_else(|| unit.outputs.clone());
        let cache_key =
            cacheable.then(|| CacheKey::derive(&unit.implementation, &fingerprint, &outputs));

        let previous = match self.states.get(&unit.identity) {
            Ok(previous) => previous,
            Err(e) => {
                warn!("Failed to read execution state for {}: {}", unit.identity, e);
                None
            }
        };

        if let Some(previous) = &previous {
            if self
                .is_up_to_date(unit, previous, &fingerprint, &implementation, &outputs)
                .await
            {
                info!(
                    service = services::ENGINE,
                    operation = operations::EVALUATE,
                    status = status::SUCCESS,
                    "{} is up to date",
                    unit.identity
                );
                return Ok(Decision::Skip(WorkResult {
                    identity: unit.identity.clone(),
                    outcome: Outcome::UpToDate,
                    cache_key,
                    started_at,
                    duration: started.elapsed(),
                    changes: None,
                    failure: None,
                    origin: None,
                }));
            }
        }

        if let Some(key) = &cache_key {
            if let Some(origin) = self.try_restore(unit, key, &outputs).await {
                let snapshot = self.snapshot_outputs(unit, &outputs).await;
                match snapshot {
                    Ok(snapshot) => self.record(TaskExecutionState {
                        identity: unit.identity.clone(),
                        inputs: fingerprint,
                        implementation,
                        outputs: snapshot,
                        cacheable,
                        cache_key: Some(*key),
                        recorded_at: Utc::now(),
                        origin: Outcome::CacheHit,
                    }),
                    Err(e) => warn!("Failed to snapshot restored outputs of {}: {}", unit.identity, e),
                }

                info!(
                    service = services::ENGINE,
                    operation = operations::RESTORE,
                    status = status::HIT,
                    key = %key,
                    "{} restored from cache (built on {} in {}ms)",
                    unit.identity,
                    origin.build_host,
                    origin.execution_time_ms
                );
                return Ok(Decision::Skip(WorkResult {
                    identity: unit.identity.clone(),
                    outcome: Outcome::CacheHit,
                    cache_key,
                    started_at,
                    duration: started.elapsed(),
                    changes: None,
                    failure: None,
                    origin: Some(origin),
                }));
            }
        }

        // A lookup that failed because the build was cancelled is not a miss
        if self.cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let changes = match &previous {
            Some(previous)
                if previous.implementation == implementation
                    && previous.inputs.sensitivity() == fingerprint.sensitivity() =>
            {
                InputChanges::between(&previous.inputs, &fingerprint)
            }
            _ => InputChanges::non_incremental(&fingerprint),
        };

        debug!(
            "{} must execute ({} input changes, incremental: {})",
            unit.identity,
            changes.total(),
            changes.incremental
        );

        Ok(Decision::Execute(PendingExecution {
            identity: unit.identity.clone(),
            fingerprint,
            implementation,
            cache_key,
            outputs,
            changes,
            started_at,
            started,
        }))
    }

    /// Second phase: record a finished execution
    pub async fn complete(
        &self,
        unit: &UnitOfWork,
        pending: PendingExecution,
        result: anyhow::Result<()>,
    ) -> WorkResult {
        let execution_time = pending.started.elapsed();

        if let Err(failure) = result {
            warn!("{} failed: {:#}", pending.identity, failure);
            return WorkResult {
                identity: pending.identity,
                outcome: Outcome::Failed,
                cache_key: pending.cache_key,
                started_at: pending.started_at,
                duration: execution_time,
                changes: Some(pending.changes),
                failure: Some(failure),
                origin: None,
            };
        }

        match self.snapshot_outputs(unit, &pending.outputs).await {
            Ok(snapshot) => {
                if let Some(key) = &pending.cache_key {
                    self.store_outputs(unit, key, &pending.outputs, execution_time)
                        .await;
                }
                self.record(TaskExecutionState {
                    identity: pending.identity.clone(),
                    inputs: pending.fingerprint,
                    implementation: pending.implementation,
                    outputs: snapshot,
                    cacheable: pending.cache_key.is_some(),
                    cache_key: pending.cache_key,
                    recorded_at: Utc::now(),
                    origin: Outcome::Executed,
                });
            }
            Err(e) => warn!(
                "Failed to snapshot outputs of {}, not recording state: {}",
                pending.identity, e
            ),
        }

        info!(
            service = services::ENGINE,
            operation = operations::EVALUATE,
            status = status::SUCCESS,
            "{} executed in {}ms",
            pending.identity,
            execution_time.as_millis()
        );

        WorkResult {
            identity: pending.identity,
            outcome: Outcome::Executed,
            cache_key: pending.cache_key,
            started_at: pending.started_at,
            duration: execution_time,
            changes: Some(pending.changes),
            failure: None,
            origin: None,
        }
    }

    async fn fingerprint_inputs(&self, unit: &UnitOfWork) -> Result<InputFingerprint> {
        let fingerprinter = Arc::clone(&self.fingerprinter);
        let inputs = unit.inputs.clone();
        let sensitivity = unit.sensitivity;
        let cancel = self.cancel.clone();

        tokio::task::spawn_blocking(move || fingerprinter.fingerprint(&inputs, sensitivity, &cancel))
            .await
            .map_err(|e| join_error(e, &unit.base_dir))?
    }

    async fn snapshot_outputs(&self, unit: &UnitOfWork, outputs: &[String]) -> Result<OutputSnapshot> {
        let fingerprinter = Arc::clone(&self.fingerprinter);
        let base_dir = unit.base_dir.clone();
        let outputs = outputs.to_vec();

        tokio::task::spawn_blocking(move || fingerprinter.snapshot_outputs(&base_dir, &outputs))
            .await
            .map_err(|e| join_error(e, &unit.base_dir))?
    }

    async fn is_up_to_date(
        &self,
        unit: &UnitOfWork,
        previous: &TaskExecutionState,
        fingerprint: &InputFingerprint,
        implementation: &ContentHash,
        outputs: &[String],
    ) -> bool {
        if previous.implementation != *implementation {
            debug!("{}: implementation changed", unit.identity);
            return false;
        }
        if previous.inputs != *fingerprint {
            debug!("{}: inputs changed", unit.identity);
            return false;
        }

        match self.snapshot_outputs(unit, outputs).await {
            Ok(current) => {
                let unchanged = current == previous.outputs
                    && current.values().all(|state| state.exists());
                if !unchanged {
                    debug!("{}: outputs missing or changed", unit.identity);
                }
                unchanged
            }
            Err(e) => {
                debug!("{}: cannot snapshot outputs: {}", unit.identity, e);
                false
            }
        }
    }

    /// Load and unpack the entry for `key`; any failure is a miss
    async fn try_restore(
        &self,
        unit: &UnitOfWork,
        key: &CacheKey,
        outputs: &[String],
    ) -> Option<OriginMetadata> {
        let payload = match self.cache.load(key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(
                    service = services::ENGINE,
                    operation = operations::LOAD,
                    status = status::MISS,
                    key = %key,
                    "No cache entry for {}",
                    unit.identity
                );
                return None;
            }
            Err(e) => {
                warn!("Cache load for {} failed, treating as miss: {}", unit.identity, e);
                return None;
            }
        };

        let owned_key = *key;
        let base_dir = unit.base_dir.clone();
        let outputs = outputs.to_vec();
        let restored = tokio::task::spawn_blocking(move || {
            outputs::unpack_outputs(&payload, &owned_key, &base_dir, &outputs)
        })
        .await
        .map_err(|e| join_error(e, &unit.base_dir));

        match restored {
            Ok(Ok(origin)) => Some(origin),
            Ok(Err(e)) | Err(e) => {
                warn!(
                    service = services::ENGINE,
                    operation = operations::RESTORE,
                    status = status::CORRUPT,
                    key = %key,
                    "Could not restore {} from cache, executing instead: {}",
                    unit.identity,
                    e
                );
                None
            }
        }
    }

    /// Pack and store outputs; failures only mean "not cached this run"
    async fn store_outputs(
        &self,
        unit: &UnitOfWork,
        key: &CacheKey,
        outputs: &[String],
        execution_time: std::time::Duration,
    ) {
        let base_dir = unit.base_dir.clone();
        let owned_outputs = outputs.to_vec();
        let origin = OriginMetadata::new(unit.identity.clone(), *key, execution_time);
        let packed = tokio::task::spawn_blocking(move || {
            outputs::pack_outputs(&base_dir, &owned_outputs, origin)
        })
        .await
        .map_err(|e| join_error(e, &unit.base_dir));

        let payload = match packed {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) | Err(e) => {
                warn!("Failed to pack outputs of {}: {}", unit.identity, e);
                return;
            }
        };

        if let Err(e) = self.cache.store(key, &payload).await {
            warn!(
                service = services::ENGINE,
                operation = operations::STORE,
                status = status::ERROR,
                key = %key,
                "Failed to store outputs of {}: {}",
                unit.identity,
                e
            );
        }
    }

    fn record(&self, state: TaskExecutionState) {
        if let Err(e) = self.states.put(&state) {
            warn!("Failed to record execution state for {}: {}", state.identity, e);
        }
    }
}

fn join_error(error: tokio::task::JoinError, base_dir: &std::path::Path) -> CacheError {
    if error.is_cancelled() {
        CacheError::Cancelled
    } else {
        CacheError::io(std::io::Error::other(error), base_dir, "join blocking task")
    }
}
