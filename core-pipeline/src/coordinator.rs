//! # Pipeline Coordinator
//!
//! Drives a flushed session through the stages and aggregates the outcome.
//!
//! ## Flow
//!
//! ```text
//! Session ──> QualityGate ──> [Transcode] ──> Upload ──> [Backup]   (per unit)
//!                                                │
//!                                                ▼
//!                     Publish <── Assembly <── Recognition          (per session)
//! ```
//!
//! Bracketed stages are optional: their failures become warnings. Any other
//! failure stops the run and is reported in [`ProcessingResult::error`]
//! together with the timings collected so far. Stage errors never escape
//! [`PipelineCoordinator::process_session`].
//!
//! ## Batches
//!
//! [`PipelineCoordinator::process_batch`] splits units into chunks of the
//! requested concurrency, runs each chunk concurrently, pauses briefly
//! between chunks, and returns results in input order.

use crate::assembly::{NoteDocument, PageText};
use crate::error::PipelineError;
use crate::quality::{detect_format, PayloadFormat, QualityGate};
use crate::retry::RetryPolicy;
use crate::session::{Session, Unit, UnitId};
use crate::stages::{BackupStage, PublishStage, RecognitionStage, Stage, UploadStage};
use bridge_traits::{blob::UploadedBlob, media::Transcoder, vcs::RevisionToken};
use bytes::Bytes;
use core_runtime::config::{NotesConfig, PipelineSettings};
use core_runtime::events::{CoreEvent, EventBus, PipelineEvent};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
}

/// Outcome of processing one session.
///
/// When `success` is false, `error` names the failing stage; sub-results of
/// the stages that did complete are still reported.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub originator_id: String,
    pub unit_ids: Vec<UnitId>,
    pub success: bool,
    /// Time spent per stage, in the order stages first ran
    pub timings: Vec<StageTiming>,
    pub uploads: Vec<UploadedBlob>,
    pub backup_paths: Vec<String>,
    pub pages: Vec<PageText>,
    pub note_path: Option<String>,
    pub revision: Option<RevisionToken>,
    pub warnings: Vec<String>,
    pub error: Option<StageFailure>,
    pub duration_ms: u64,
}

impl ProcessingResult {
    fn for_session(session: &Session) -> Self {
        Self {
            originator_id: session.originator_id.clone(),
            unit_ids: session.units.iter().map(|unit| unit.id).collect(),
            success: false,
            timings: Vec::new(),
            uploads: Vec::new(),
            backup_paths: Vec::new(),
            pages: Vec::new(),
            note_path: None,
            revision: None,
            warnings: Vec::new(),
            error: None,
            duration_ms: 0,
        }
    }

    fn aborted(originator_id: String, unit_id: UnitId, message: String) -> Self {
        Self {
            originator_id,
            unit_ids: vec![unit_id],
            success: false,
            timings: Vec::new(),
            uploads: Vec::new(),
            backup_paths: Vec::new(),
            pages: Vec::new(),
            note_path: None,
            revision: None,
            warnings: Vec::new(),
            error: Some(StageFailure {
                stage: Stage::Upload,
                message,
            }),
            duration_ms: 0,
        }
    }

    pub fn stage_duration_ms(&self, stage: Stage) -> Option<u64> {
        self.timings
            .iter()
            .find(|timing| timing.stage == stage)
            .map(|timing| timing.duration_ms)
    }

    /// Recognized text of every page, in page order.
    pub fn recognized_text(&self) -> String {
        self.pages
            .iter()
            .map(|page| page.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|failure| failure.message.as_str())
    }
}

/// Aggregate over a batch. Computed once from the per-unit results.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failure count per exact error message
    pub error_histogram: BTreeMap<String, usize>,
    pub total_duration_ms: u64,
    pub average_duration_ms: u64,
    /// Per-unit results in input order
    pub results: Vec<ProcessingResult>,
}

impl BatchResult {
    pub fn from_results(results: Vec<ProcessingResult>, elapsed: Duration) -> Self {
        let total = results.len();
        let succeeded = results.iter().filter(|result| result.success).count();

        let mut error_histogram = BTreeMap::new();
        for message in results.iter().filter_map(ProcessingResult::error_message) {
            *error_histogram.entry(message.to_string()).or_insert(0) += 1;
        }

        let summed: u64 = results.iter().map(|result| result.duration_ms).sum();
        let average_duration_ms = if total == 0 { 0 } else { summed / total as u64 };

        Self {
            total,
            succeeded,
            failed: total - succeeded,
            error_histogram,
            total_duration_ms: elapsed.as_millis() as u64,
            average_duration_ms,
            results,
        }
    }

    pub fn most_common_error(&self) -> Option<(&str, usize)> {
        self.error_histogram
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(message, count)| (message.as_str(), *count))
    }
}

/// Accumulates stage durations across the units of one session.
#[derive(Default)]
struct StageTimer {
    timings: Vec<StageTiming>,
}

impl StageTimer {
    fn record(&mut self, stage: Stage, started: Instant) {
        let elapsed = started.elapsed().as_millis() as u64;
        match self.timings.iter().position(|timing| timing.stage == stage) {
            Some(index) => self.timings[index].duration_ms += elapsed,
            None => self.timings.push(StageTiming {
                stage,
                duration_ms: elapsed,
            }),
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

#[derive(Clone)]
pub struct PipelineCoordinator {
    settings: PipelineSettings,
    gate: QualityGate,
    session_window: Duration,
    transcoder: Option<Arc<dyn Transcoder>>,
    upload: UploadStage,
    backup: Option<BackupStage>,
    recognition: RecognitionStage,
    publish: PublishStage,
    event_bus: Arc<EventBus>,
}

impl PipelineCoordinator {
    pub fn new(config: &NotesConfig, event_bus: Arc<EventBus>) -> Self {
        let retry = RetryPolicy::from_settings(&config.retry);
        let settings = config.pipeline.clone();

        let backup = settings.enable_backup.then(|| {
            BackupStage::new(
                Arc::clone(&config.version_control),
                retry,
                settings.backup_dir.clone(),
            )
        });

        Self {
            gate: QualityGate::from_settings(&settings),
            session_window: config.session_window,
            transcoder: config.transcoder.clone(),
            upload: UploadStage::new(Arc::clone(&config.blob_store), retry),
            backup,
            recognition: RecognitionStage::new(Arc::clone(&config.recognition), retry),
            publish: PublishStage::new(Arc::clone(&config.version_control), retry),
            event_bus,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Processes a single unit as a one-page session.
    pub async fn process(&self, unit: Unit) -> ProcessingResult {
        let created_at = unit.created_at;
        self.process_session(Session::start(unit, created_at, self.session_window))
            .await
    }

    /// Processes every unit of a flushed session in arrival order and
    /// publishes one note.
    #[instrument(
        skip(self, session),
        fields(originator_id = %session.originator_id, units = session.len())
    )]
    pub async fn process_session(&self, session: Session) -> ProcessingResult {
        let started = Instant::now();
        let mut result = ProcessingResult::for_session(&session);
        let mut timer = StageTimer::default();

        if session.is_empty() {
            let err = PipelineError::Internal("session contains no units".to_string());
            return self.fail(result, timer, started, Stage::Assembly, err);
        }

        // Gate every payload before anything leaves the process
        let gate_started = Instant::now();
        let mut formats = Vec::with_capacity(session.len());
        for unit in &session.units {
            match self.gate.check(&unit.name, &unit.payload) {
                Ok(format) => formats.push(format.or_else(|| detect_format(&unit.payload))),
                Err(e) => {
                    timer.record(Stage::QualityGate, gate_started);
                    return self.fail(result, timer, started, Stage::QualityGate, e);
                }
            }
        }
        if self.gate.enabled {
            timer.record(Stage::QualityGate, gate_started);
        }

        let mut uploads = Vec::with_capacity(session.len());
        for (unit, format) in session.units.iter().zip(formats) {
            let payload = self
                .transcode(unit, format, &mut timer, &mut result.warnings)
                .await;

            let upload_started = Instant::now();
            let uploaded = self.upload.run(unit, payload).await;
            timer.record(Stage::Upload, upload_started);
            match uploaded {
                Ok(blob) => {
                    result.uploads.push(blob.clone());
                    uploads.push((unit.name.clone(), blob));
                }
                Err(e) => return self.fail(result, timer, started, Stage::Upload, e),
            }

            if let Some(backup) = &self.backup {
                let backup_started = Instant::now();
                match backup.run(unit, format, unit.payload.clone()).await {
                    Ok(path) => result.backup_paths.push(path),
                    Err(e) => {
                        warn!(unit_id = %unit.id, error = %e, "Backup failed, continuing");
                        result
                            .warnings
                            .push(format!("Backup failed for {}: {}", unit.name, e));
                    }
                }
                timer.record(Stage::Backup, backup_started);
            }
        }

        let recognition_started = Instant::now();
        let recognized = self.recognition.run(&uploads).await;
        timer.record(Stage::Recognition, recognition_started);
        match recognized {
            Ok(outcome) => {
                result.pages = outcome.pages;
                result.warnings.extend(outcome.warnings);
            }
            Err(e) => return self.fail(result, timer, started, Stage::Recognition, e),
        }

        let assembly_started = Instant::now();
        let document = NoteDocument::new(
            session.originator_id.clone(),
            session.started_at,
            result.pages.clone(),
        )
        .with_discriminator(session.units[0].id.short());
        let markdown = document.render();
        let note_path = document.path(&self.settings.notes_dir);
        timer.record(Stage::Assembly, assembly_started);

        let publish_started = Instant::now();
        let published = self
            .publish
            .run(
                &note_path,
                Bytes::from(markdown),
                &document.commit_message(),
            )
            .await;
        timer.record(Stage::Publish, publish_started);
        match published {
            Ok(revision) => {
                result.note_path = Some(note_path);
                result.revision = Some(revision);
            }
            Err(e) => return self.fail(result, timer, started, Stage::Publish, e),
        }

        result.success = true;
        result.timings = timer.timings;
        result.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            note_path = result.note_path.as_deref().unwrap_or_default(),
            pages = result.pages.len(),
            warnings = result.warnings.len(),
            duration_ms = result.duration_ms,
            "Session processed"
        );
        self.event_bus
            .emit(CoreEvent::Pipeline(PipelineEvent::UnitProcessed {
                originator_id: result.originator_id.clone(),
                note_path: result.note_path.clone().unwrap_or_default(),
                pages: result.pages.len(),
                duration_ms: result.duration_ms,
                warnings: result.warnings.len(),
            }))
            .ok();

        result
    }

    /// Processes `units` independently, `concurrency` at a time.
    ///
    /// One failing unit never aborts the batch.
    #[instrument(skip(self, units), fields(units = units.len()))]
    pub async fn process_batch(&self, units: Vec<Unit>, concurrency: usize) -> BatchResult {
        let started = Instant::now();
        let concurrency = concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let inter_chunk_delay = Duration::from_millis(self.settings.inter_batch_delay_ms);

        let chunks: Vec<Vec<Unit>> = units
            .chunks(concurrency)
            .map(|chunk| chunk.to_vec())
            .collect();
        let chunk_count = chunks.len();
        let mut results = Vec::with_capacity(units.len());

        for (index, chunk) in chunks.into_iter().enumerate() {
            debug!(chunk = index + 1, chunk_count, "Processing batch chunk");
            let mut handles = Vec::with_capacity(chunk.len());

            for unit in chunk {
                let permit = semaphore.clone().acquire_owned().await.ok();
                let coordinator = self.clone();
                let originator_id = unit.originator_id.clone();
                let unit_id = unit.id;

                let handle = tokio::spawn(async move {
                    let result = coordinator.process(unit).await;
                    drop(permit);
                    result
                });
                handles.push((originator_id, unit_id, handle));
            }

            // Awaiting in spawn order keeps results aligned with the input
            for (originator_id, unit_id, handle) in handles {
                match handle.await {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        error!(unit_id = %unit_id, error = %e, "Batch task panicked");
                        results.push(ProcessingResult::aborted(
                            originator_id,
                            unit_id,
                            format!("Processing task failed: {}", e),
                        ));
                    }
                }
            }

            if index + 1 < chunk_count && !inter_chunk_delay.is_zero() {
                sleep(inter_chunk_delay).await;
            }
        }

        let batch = BatchResult::from_results(results, started.elapsed());
        info!(
            total = batch.total,
            succeeded = batch.succeeded,
            failed = batch.failed,
            duration_ms = batch.total_duration_ms,
            "Batch completed"
        );
        self.event_bus
            .emit(CoreEvent::Pipeline(PipelineEvent::BatchCompleted {
                total: batch.total,
                succeeded: batch.succeeded,
                failed: batch.failed,
                duration_ms: batch.total_duration_ms,
            }))
            .ok();

        batch
    }

    /// Runs the optional transcoder on image pages; any failure falls back to
    /// the original bytes.
    async fn transcode(
        &self,
        unit: &Unit,
        format: Option<PayloadFormat>,
        timer: &mut StageTimer,
        warnings: &mut Vec<String>,
    ) -> Bytes {
        let Some(transcoder) = &self.transcoder else {
            return unit.payload.clone();
        };
        if format.is_some_and(|f| !f.is_image()) {
            debug!(unit_id = %unit.id, "Not an image, skipping transcoder");
            return unit.payload.clone();
        }

        let mime_type = unit
            .mime_type
            .clone()
            .or_else(|| format.map(|f| f.mime_type().to_string()))
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let transcode_started = Instant::now();
        let transcoded = transcoder.transcode(unit.payload.clone(), &mime_type).await;
        timer.record(Stage::Transcode, transcode_started);

        match transcoded {
            Ok(bytes) if !bytes.is_empty() => {
                debug!(
                    unit_id = %unit.id,
                    original = unit.payload.len(),
                    transcoded = bytes.len(),
                    "Payload transcoded"
                );
                bytes
            }
            Ok(_) => {
                warnings.push(format!("Transcoder returned no data for {}", unit.name));
                unit.payload.clone()
            }
            Err(e) => {
                warn!(unit_id = %unit.id, error = %e, "Transcoding failed, uploading original");
                warnings.push(format!("Transcoding failed for {}: {}", unit.name, e));
                unit.payload.clone()
            }
        }
    }

    fn fail(
        &self,
        mut result: ProcessingResult,
        timer: StageTimer,
        started: Instant,
        stage: Stage,
        err: PipelineError,
    ) -> ProcessingResult {
        let message = err.to_string();
        warn!(stage = %stage, error = %message, "Session processing failed");

        result.success = false;
        result.timings = timer.timings;
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.error = Some(StageFailure {
            stage,
            message: message.clone(),
        });

        self.event_bus
            .emit(CoreEvent::Pipeline(PipelineEvent::UnitFailed {
                originator_id: result.originator_id.clone(),
                stage: stage.to_string(),
                message,
            }))
            .ok();

        result
    }
}
