//! Pipelined dump: download → transform (×N) → sort-and-store.
//!
//! Every stage runs on its own blocking thread. The coordinator waits on
//! whichever stage finishes next, logs queue depths while it waits, signals
//! end of input once the last transform worker is done and closes the store
//! after the sort-and-store stage. The first failing stage cancels the rest,
//! in a fixed order, and the run fails with that stage's error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tokio::task::{Id, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use treedump_shared::{PipelineConfig, Result, StageKind, TreeDumpError};
use treedump_source::{BatchRequest, DocumentSource, PathFilter, PathPredicate, accept_all};
use treedump_storage::{SortedStoreWriter, StoreManifest};

use crate::cancel::CancelToken;
use crate::download::{DownloadOutcome, DownloadStage, RawQueueItem};
use crate::entry::{BlobResolver, EntryWriter, PassthroughBlobResolver};
use crate::pool::{BufferPool, PoolSnapshot};
use crate::report::IndexingReporter;
use crate::settings::PipelineSettings;
use crate::sort_store::{SortStoreOutcome, SortStoreStage};
use crate::stats::{LiveCounters, TransformStatistics};
use crate::transform::{TransformOutcome, TransformStage};

/// Log target of the start/end/fail phase markers.
pub const PHASE_TARGET: &str = "treedump::phase";

/// Result of a successful dump.
#[derive(Debug)]
pub struct DumpResult {
    /// Directory of the published store.
    pub store_dir: PathBuf,
    pub manifest: StoreManifest,
    pub documents_downloaded: u64,
    pub entries_extracted: u64,
    pub entries_stored: u64,
    /// Merged statistics of all transform workers.
    pub statistics: TransformStatistics,
    pub elapsed: Duration,
}

/// Queue depths and live counters, reported on every coordinator tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub raw_batches: usize,
    pub buffers: PoolSnapshot,
    pub documents_processed: u64,
    pub entries_accepted: u64,
    pub entries_rejected: u64,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when a stage completes successfully.
    fn stage_finished(&self, stage: StageKind, summary: &str);
    /// Called on every coordinator tick without a stage completion.
    fn queues(&self, snapshot: &QueueSnapshot);
    /// Called when the pipeline completes.
    fn done(&self, result: &DumpResult);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn stage_finished(&self, _stage: StageKind, _summary: &str) {}
    fn queues(&self, _snapshot: &QueueSnapshot) {}
    fn done(&self, _result: &DumpResult) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Running,
    /// All transform workers are done; the sort-and-store stage is finishing.
    Draining,
    Terminated(Termination),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Success,
    Failed,
}

/// What a stage task returns.
enum StageOutcome {
    Download(DownloadOutcome),
    Transform(TransformOutcome),
    SortAndStore(SortStoreOutcome),
}

/// A configured dump, ready to run.
pub struct SortedDump {
    settings: PipelineSettings,
    source: Box<dyn DocumentSource>,
    store_dir: PathBuf,
    path_filters: Vec<PathFilter>,
    predicate: Arc<dyn PathPredicate>,
    blobs: Arc<dyn BlobResolver>,
    reporter: Arc<dyn IndexingReporter>,
    checkpoint: Option<String>,
}

impl SortedDump {
    /// Validate `config` and plan memory. Fails with a config error before
    /// anything is started.
    pub fn new(
        config: &PipelineConfig,
        source: Box<dyn DocumentSource>,
        store_dir: impl Into<PathBuf>,
        reporter: Arc<dyn IndexingReporter>,
    ) -> Result<Self> {
        let settings = PipelineSettings::resolve(config, reporter.as_ref())?;
        Ok(Self {
            settings,
            source,
            store_dir: store_dir.into(),
            path_filters: Vec::new(),
            predicate: Arc::new(accept_all()),
            blobs: Arc::new(PassthroughBlobResolver),
            reporter,
            checkpoint: None,
        })
    }

    /// Filters passed to the source to narrow what is downloaded.
    pub fn with_path_filters(mut self, path_filters: Vec<PathFilter>) -> Self {
        self.path_filters = path_filters;
        self
    }

    /// Decides which paths are written to the store.
    pub fn with_predicate(mut self, predicate: Arc<dyn PathPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_blob_resolver(mut self, blobs: Arc<dyn BlobResolver>) -> Self {
        self.blobs = blobs;
        self
    }

    /// Label recorded in the store manifest.
    pub fn with_checkpoint(mut self, checkpoint: Option<String>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run the dump to completion.
    #[instrument(skip_all, fields(store_dir = %self.store_dir.display(), source = %self.source.describe()))]
    pub async fn run(self, progress: &dyn ProgressReporter) -> Result<DumpResult> {
        let start = Instant::now();
        let reporter = Arc::clone(&self.reporter);
        info!(target: PHASE_TARGET, "[TASK:PIPELINED-DUMP:START] Starting to build sorted store");

        match self.execute(progress, start).await {
            Ok(result) => {
                reporter.add_timing("pipelined_dump", &format!("{:.3?}", result.elapsed));
                reporter.add_metric("documents_downloaded", result.documents_downloaded);
                reporter.add_metric("entries_extracted", result.entries_extracted);
                reporter.add_metric("entries_stored", result.entries_stored);
                info!(
                    target: PHASE_TARGET,
                    duration_ms = result.elapsed.as_millis() as u64,
                    documents_downloaded = result.documents_downloaded,
                    entries_extracted = result.entries_extracted,
                    store = %result.store_dir.display(),
                    "[TASK:PIPELINED-DUMP:END]"
                );
                progress.done(&result);
                Ok(result)
            }
            Err(err) => {
                error!(
                    target: PHASE_TARGET,
                    duration_ms = start.elapsed().as_millis() as u64,
                    error = %err,
                    "[TASK:PIPELINED-DUMP:FAIL]"
                );
                Err(err)
            }
        }
    }

    async fn execute(self, progress: &dyn ProgressReporter, start: Instant) -> Result<DumpResult> {
        let Self {
            settings,
            source,
            store_dir,
            path_filters,
            predicate,
            blobs,
            reporter,
            checkpoint,
        } = self;

        progress.phase("Opening output store");
        let mut store = SortedStoreWriter::open(&store_dir)?;
        store.set_checkpoint(checkpoint);

        let budget = settings.budget;
        let pool = Arc::new(BufferPool::new(
            budget.buffer_count,
            budget.per_buffer_bytes,
            budget.max_entries_per_buffer,
        ));
        let (raw_tx, raw_rx) = crossbeam_channel::bounded(settings.doc_queue_capacity);
        let live = Arc::new(LiveCounters::default());
        let writer = EntryWriter::new(blobs);
        let mut coordinator = Coordinator::new(&settings, Arc::clone(&pool), raw_rx.clone(), Arc::clone(&live));

        let request = BatchRequest {
            max_bytes: settings.doc_batch_max_bytes,
            max_documents: settings.doc_batch_max_documents,
            path_filters,
        };
        let download = DownloadStage::new(source, request, raw_tx.clone(), coordinator.token(StageKind::Download));
        coordinator.spawn(StageKind::Download, move || download.run().map(StageOutcome::Download));

        for worker_id in 0..settings.transform_threads {
            let kind = StageKind::Transform(worker_id);
            let transform = TransformStage::new(
                worker_id,
                raw_rx.clone(),
                raw_tx.clone(),
                Arc::clone(&pool),
                Arc::clone(&predicate),
                writer.clone(),
                Arc::clone(&live),
                coordinator.token(kind),
            );
            coordinator.spawn(kind, move || transform.run().map(StageOutcome::Transform));
        }

        let sort = SortStoreStage::new(Arc::clone(&pool), store, coordinator.token(StageKind::SortAndStore));
        coordinator.spawn(StageKind::SortAndStore, move || sort.run().map(StageOutcome::SortAndStore));
        drop(raw_tx);
        drop(raw_rx);

        coordinator.set_state(PipelineState::Running);
        progress.phase("Dumping documents");
        let completed = match coordinator.wait_for_stages(progress, reporter.as_ref()).await {
            Ok(completed) => completed,
            Err(err) => {
                coordinator.set_state(PipelineState::Terminated(Termination::Failed));
                coordinator.cancel_outstanding();
                coordinator.shutdown().await;
                return Err(err);
            }
        };

        progress.phase("Merging sorted segments");
        let store = completed.sort.store;
        let manifest = match tokio::task::spawn_blocking(move || store.close()).await {
            Ok(Ok(manifest)) => manifest,
            Ok(Err(err)) => {
                coordinator.set_state(PipelineState::Terminated(Termination::Failed));
                return Err(TreeDumpError::stage(StageKind::SortAndStore, err));
            }
            Err(join) => {
                coordinator.set_state(PipelineState::Terminated(Termination::Failed));
                return Err(TreeDumpError::stage(
                    StageKind::SortAndStore,
                    TreeDumpError::Storage(format!("store close task failed: {join}")),
                ));
            }
        };
        coordinator.set_state(PipelineState::Terminated(Termination::Success));

        Ok(DumpResult {
            store_dir,
            manifest,
            documents_downloaded: completed.download.documents_downloaded,
            entries_extracted: completed.entries_extracted,
            entries_stored: completed.sort.entries_stored,
            statistics: completed.statistics,
            elapsed: start.elapsed(),
        })
    }
}

/// Outcomes of a run in which every stage succeeded.
struct Completed {
    download: DownloadOutcome,
    entries_extracted: u64,
    statistics: TransformStatistics,
    sort: SortStoreOutcome,
}

struct Coordinator {
    state: PipelineState,
    tasks: JoinSet<Result<StageOutcome>>,
    stage_ids: HashMap<Id, StageKind>,
    /// Running stages and their tokens, in cancellation order.
    outstanding: Vec<(StageKind, CancelToken)>,
    transform_threads: usize,
    transforms_done: usize,
    pool: Arc<BufferPool>,
    raw_rx: Receiver<RawQueueItem>,
    live: Arc<LiveCounters>,
    stats_interval: Duration,
    shutdown_grace: Duration,
}

impl Coordinator {
    fn new(
        settings: &PipelineSettings,
        pool: Arc<BufferPool>,
        raw_rx: Receiver<RawQueueItem>,
        live: Arc<LiveCounters>,
    ) -> Self {
        Self {
            state: PipelineState::Starting,
            tasks: JoinSet::new(),
            stage_ids: HashMap::new(),
            outstanding: Vec::new(),
            transform_threads: settings.transform_threads,
            transforms_done: 0,
            pool,
            raw_rx,
            live,
            stats_interval: settings.stats_interval,
            shutdown_grace: settings.shutdown_grace,
        }
    }

    /// A fresh cancel token registered for `stage`.
    fn token(&mut self, stage: StageKind) -> CancelToken {
        let token = CancelToken::new();
        self.outstanding.push((stage, token.clone()));
        token
    }

    fn spawn<F>(&mut self, stage: StageKind, task: F)
    where
        F: FnOnce() -> Result<StageOutcome> + Send + 'static,
    {
        let handle = self
            .tasks
            .spawn_blocking(move || task().map_err(|err| TreeDumpError::stage(stage, err)));
        self.stage_ids.insert(handle.id(), stage);
        debug!(%stage, "stage started");
    }

    fn set_state(&mut self, state: PipelineState) {
        debug!(from = ?self.state, to = ?state, "pipeline state");
        self.state = state;
    }

    /// Mark the task as done and return its stage.
    fn finish(&mut self, id: Id) -> Result<StageKind> {
        let stage = self
            .stage_ids
            .remove(&id)
            .ok_or_else(|| TreeDumpError::validation(format!("completion from unknown task {id}")))?;
        self.outstanding.retain(|(kind, _)| *kind != stage);
        Ok(stage)
    }

    async fn wait_for_stages(
        &mut self,
        progress: &dyn ProgressReporter,
        reporter: &dyn IndexingReporter,
    ) -> Result<Completed> {
        let mut download = None;
        let mut sort = None;
        let mut entries_extracted = 0u64;
        let mut statistics = TransformStatistics::default();

        while !self.outstanding.is_empty() {
            let joined = match tokio::time::timeout(self.stats_interval, self.tasks.join_next_with_id()).await {
                Err(_) => {
                    self.log_progress(progress, &statistics);
                    continue;
                }
                Ok(None) => {
                    return Err(TreeDumpError::validation(format!(
                        "no stage task left but {} still outstanding",
                        self.outstanding.len()
                    )));
                }
                Ok(Some(joined)) => joined,
            };

            let (stage, result) = match joined {
                Ok((id, result)) => (self.finish(id)?, result),
                Err(join) => {
                    let stage = self.finish(join.id())?;
                    return Err(TreeDumpError::stage(
                        stage,
                        TreeDumpError::validation(format!("stage task panicked: {join}")),
                    ));
                }
            };

            match result? {
                StageOutcome::Download(outcome) => {
                    progress.stage_finished(
                        stage,
                        &format!("{} documents downloaded", outcome.documents_downloaded),
                    );
                    download = Some(outcome);
                }
                StageOutcome::Transform(outcome) => {
                    entries_extracted += outcome.entries_extracted;
                    statistics.merge(&outcome.statistics);
                    self.transforms_done += 1;
                    progress.stage_finished(stage, &format!("{} entries extracted", outcome.entries_extracted));
                    debug!(
                        worker = outcome.worker_id,
                        done = self.transforms_done,
                        of = self.transform_threads,
                        "transform worker finished"
                    );

                    if self.transforms_done == self.transform_threads {
                        self.set_state(PipelineState::Draining);
                        self.pool.signal_end_of_input()?;
                        info!(
                            entries_extracted,
                            stats = %statistics.format_stats(),
                            "all transform workers finished"
                        );
                        for histogram in statistics.histograms() {
                            info!("{}", histogram.pretty_print());
                        }
                        statistics.publish(reporter);
                    }
                }
                StageOutcome::SortAndStore(outcome) => {
                    let released = self.pool.drain_empty();
                    debug!(released, "buffers released");
                    progress.stage_finished(stage, &format!("{} entries stored", outcome.entries_stored));
                    sort = Some(outcome);
                }
            }
        }

        match (download, sort) {
            (Some(download), Some(sort)) => Ok(Completed {
                download,
                entries_extracted,
                statistics,
                sort,
            }),
            _ => Err(TreeDumpError::validation("pipeline ended without every stage reporting")),
        }
    }

    fn log_progress(&self, progress: &dyn ProgressReporter, statistics: &TransformStatistics) {
        let live = self.live.snapshot();
        let snapshot = QueueSnapshot {
            raw_batches: self.raw_rx.len(),
            buffers: self.pool.snapshot(),
            documents_processed: live.documents_processed,
            entries_accepted: live.entries_accepted,
            entries_rejected: live.entries_rejected,
        };
        info!(
            state = ?self.state,
            raw_queue = snapshot.raw_batches,
            empty_buffers = snapshot.buffers.empty,
            full_buffers = snapshot.buffers.full,
            held_buffers = snapshot.buffers.held,
            documents_processed = snapshot.documents_processed,
            entries_accepted = snapshot.entries_accepted,
            entries_rejected = snapshot.entries_rejected,
            "pipeline progress"
        );
        for histogram in statistics.histograms() {
            if !histogram.is_empty() {
                debug!("{}", histogram.pretty_print());
            }
        }
        progress.queues(&snapshot);
    }

    /// Cancel download, then every transform worker, then sort-and-store.
    fn cancel_outstanding(&self) {
        for (stage, token) in &self.outstanding {
            debug!(%stage, "cancelling stage");
            token.cancel();
        }
    }

    /// Wait for cancelled stages to stop, up to the grace period.
    ///
    /// Detached stages keep their blocking thread until the call they are stuck
    /// in returns. A runtime dropped after this still joins them, so binaries
    /// should stop it with `Runtime::shutdown_timeout`.
    async fn shutdown(&mut self) {
        let tasks = &mut self.tasks;
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Err(err)) if !err.is_cancelled() => {
                        warn!(error = %err, "stage failed during shutdown");
                    }
                    Err(join) => warn!(error = %join, "stage task failed during shutdown"),
                    _ => {}
                }
            }
        };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            warn!(
                grace_secs = self.shutdown_grace.as_secs(),
                "stages still running after cancellation, detaching"
            );
            self.tasks.detach_all();
        }
        self.outstanding.clear();
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        // A dropped run must not leave stage threads blocked on the queues.
        for (_, token) in &self.outstanding {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Mutex;

    use serde_json::json;
    use treedump_shared::RawRecord;
    use treedump_source::VecSource;
    use treedump_storage::{SortedStoreReader, is_published};

    use super::*;
    use crate::report::{MemoryReporter, NoopReporter};

    fn temp_store() -> PathBuf {
        std::env::temp_dir().join(format!("td-pipeline-test-{}", uuid::Uuid::now_v7()))
    }

    fn config(transform_threads: u32) -> PipelineConfig {
        PipelineConfig {
            working_memory_mb: 128 * (transform_threads + 1),
            transform_threads,
            stats_interval_secs: 1,
            shutdown_grace_secs: 5,
            ..PipelineConfig::default()
        }
    }

    fn node(path: &str) -> RawRecord {
        RawRecord::node(path, BTreeMap::from([("title".to_string(), json!(path))]))
    }

    fn nodes(paths: &[&str]) -> Vec<RawRecord> {
        paths.iter().map(|p| node(p)).collect()
    }

    fn stored_paths(dir: &Path) -> Vec<String> {
        let reader = SortedStoreReader::open(dir).unwrap();
        reader.verify().unwrap();
        reader.entries().unwrap().map(|e| e.unwrap().path).collect()
    }

    fn dump(config: &PipelineConfig, source: VecSource, dir: &Path) -> SortedDump {
        SortedDump::new(config, Box::new(source), dir, Arc::new(NoopReporter)).unwrap()
    }

    /// Records stage completions and ticks.
    #[derive(Default)]
    struct RecordingProgress {
        finished: Mutex<Vec<StageKind>>,
        ticks: Mutex<Vec<QueueSnapshot>>,
    }

    impl ProgressReporter for RecordingProgress {
        fn phase(&self, _name: &str) {}
        fn stage_finished(&self, stage: StageKind, _summary: &str) {
            self.finished.lock().unwrap().push(stage);
        }
        fn queues(&self, snapshot: &QueueSnapshot) {
            self.ticks.lock().unwrap().push(*snapshot);
        }
        fn done(&self, _result: &DumpResult) {}
    }

    #[tokio::test]
    async fn batches_are_stored_in_path_order() {
        let dir = temp_store();
        let source = VecSource::from_batches(vec![nodes(&["/c", "/a"]), nodes(&["/b", "/f"]), nodes(&["/d", "/e"])]);

        let result = dump(&config(1), source, &dir).run(&SilentProgress).await.unwrap();
        assert_eq!(result.documents_downloaded, 6);
        assert_eq!(result.entries_extracted, 6);
        assert_eq!(result.entries_stored, 6);
        assert_eq!(result.manifest.entry_count, 6);
        assert_eq!(result.store_dir, dir);
        assert_eq!(stored_paths(&dir), vec!["/a", "/b", "/c", "/d", "/e", "/f"]);

        let entry = SortedStoreReader::open(&dir).unwrap().entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.data_str().unwrap(), r#"{"title":"/a"}"#);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn predicate_rejections_are_counted_by_prefix() {
        let dir = temp_store();
        let source = VecSource::from_records(nodes(&["/a", "/hidden/x", "/b"]));
        let predicate: Arc<dyn PathPredicate> = Arc::new(|p: &str| !p.starts_with("/hidden/"));

        let result = dump(&config(1), source, &dir)
            .with_predicate(predicate)
            .run(&SilentProgress)
            .await
            .unwrap();
        assert_eq!(stored_paths(&dir), vec!["/a", "/b"]);
        assert_eq!(result.statistics.filtered_paths.get("/hidden"), 1);
        assert_eq!(result.statistics.filtered_entries_rejected, 1);
        assert_eq!(result.entries_extracted, 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn many_workers_produce_a_complete_sorted_store() {
        let dir = temp_store();
        let paths: Vec<String> = (0..500).rev().map(|i| format!("/content/n{i:04}")).collect();
        let records: Vec<RawRecord> = paths.iter().map(|p| node(p)).collect();
        let source = VecSource::from_records(records);
        let reporter = Arc::new(MemoryReporter::default());
        let config = PipelineConfig {
            doc_batch_max_documents: 7,
            ..config(3)
        };

        let result = SortedDump::new(&config, Box::new(source), &dir, reporter.clone())
            .unwrap()
            .with_checkpoint(Some("r42-0-1".into()))
            .run(&SilentProgress)
            .await
            .unwrap();

        let mut expected = paths.clone();
        expected.sort();
        assert_eq!(stored_paths(&dir), expected);
        assert_eq!(result.manifest.checkpoint.as_deref(), Some("r42-0-1"));
        assert_eq!(result.statistics.documents_processed, 500);

        let report = reporter.report();
        assert_eq!(report.config["pipeline.transform_threads"], "3");
        assert_eq!(report.metrics["transform.entries_accepted"], 500);
        assert_eq!(report.metrics["entries_stored"], 500);
        assert!(report.timings.contains_key("pipelined_dump"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn end_of_input_follows_every_transform_worker() {
        let dir = temp_store();
        let records: Vec<RawRecord> = (0..50).map(|i| node(&format!("/n{i}"))).collect();
        let source = VecSource::from_records(records);
        let progress = RecordingProgress::default();
        let config = PipelineConfig {
            doc_batch_max_documents: 5,
            ..config(2)
        };

        dump(&config, source, &dir).run(&progress).await.unwrap();

        let finished = progress.finished.lock().unwrap().clone();
        assert_eq!(finished.len(), 4);
        let sort_at = finished.iter().position(|s| *s == StageKind::SortAndStore).unwrap();
        let transforms: Vec<usize> = finished
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, StageKind::Transform(_)))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(transforms.len(), 2);
        assert!(transforms.iter().all(|i| *i < sort_at));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn source_failure_fails_the_run_and_leaves_no_store() {
        let dir = temp_store();
        let source = VecSource::from_batches(vec![nodes(&["/a", "/b"])]).then_fail("connection reset");

        let err = dump(&config(2), source, &dir).run(&SilentProgress).await.unwrap_err();
        assert_eq!(err.failed_stage(), Some(StageKind::Download));
        assert!(!err.is_cancelled());
        assert_eq!(err.to_string(), "download stage failed: source error: connection reset");
        assert!(!is_published(&dir));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn transform_failure_names_the_worker() {
        let dir = temp_store();
        let bad = RawRecord {
            id: "not-an-id".into(),
            path: None,
            deleted: false,
            fields: BTreeMap::new(),
        };
        let source = VecSource::from_records(vec![node("/a"), bad]);

        let err = dump(&config(1), source, &dir).run(&SilentProgress).await.unwrap_err();
        assert_eq!(err.failed_stage(), Some(StageKind::Transform(0)));
        assert!(!is_published(&dir));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn slow_sources_get_progress_ticks() {
        let dir = temp_store();
        let source = VecSource::from_batches(vec![nodes(&["/a"]), nodes(&["/b"]), nodes(&["/c"])])
            .with_delay(Duration::from_millis(500));
        let progress = RecordingProgress::default();

        dump(&config(1), source, &dir).run(&progress).await.unwrap();
        let ticks = progress.ticks.lock().unwrap();
        assert!(!ticks.is_empty());
        assert!(ticks.iter().all(|t| t.buffers.buffer_count == 2 && t.buffers.is_conserved()));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn published_store_is_not_overwritten() {
        let dir = temp_store();
        dump(&config(1), VecSource::from_records(nodes(&["/a"])), &dir)
            .run(&SilentProgress)
            .await
            .unwrap();

        let err = dump(&config(1), VecSource::from_records(nodes(&["/b"])), &dir)
            .run(&SilentProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, TreeDumpError::Storage(_)));
        assert_eq!(stored_paths(&dir), vec!["/a"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn invalid_configuration_fails_before_start() {
        let dir = temp_store();
        let config = PipelineConfig {
            transform_threads: 0,
            ..config(1)
        };
        let err = SortedDump::new(&config, Box::new(VecSource::default()), &dir, Arc::new(NoopReporter))
            .err()
            .unwrap();
        assert!(matches!(err, TreeDumpError::Config { .. }));
        assert!(!dir.exists());
    }
}
