use crate::chunking::build_document_chunks;
use crate::error::{ConfigError, ExtractionError, PipelineError};
use crate::layout::LayoutAdapter;
use crate::ledger::Claim;
use crate::traits::{ChunkStore, DocumentSource, IndexNotifier, Ledger};
use crate::{DocumentChunk, PipelineConfig, RunSummary};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Drives one incremental pass: list, claim, extract, replace, settle.
///
/// Holds no state between passes; everything durable lives in the ledger and
/// the chunk store, which may be shared with other pipelines.
pub struct Pipeline<S, A, C, L, N>
where
    S: DocumentSource,
    A: LayoutAdapter,
    C: ChunkStore,
    L: Ledger,
    N: IndexNotifier,
{
    source: S,
    layout: Arc<A>,
    store: Arc<C>,
    ledger: Arc<L>,
    notifier: N,
    config: PipelineConfig,
}

impl<S, A, C, L, N> Pipeline<S, A, C, L, N>
where
    S: DocumentSource + Send + Sync,
    A: LayoutAdapter + Send + Sync + 'static,
    C: ChunkStore + Send + Sync,
    L: Ledger + Send + Sync,
    N: IndexNotifier + Send + Sync,
{
    /// Rejects a configuration under which a live extraction could be
    /// reclaimed as abandoned.
    pub fn new(
        source: S,
        layout: Arc<A>,
        store: Arc<C>,
        ledger: Arc<L>,
        notifier: N,
        config: PipelineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            source,
            layout,
            store,
            ledger,
            notifier,
            config,
        })
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub async fn run_once(&self) -> Result<RunSummary, PipelineError> {
        self.run_with_clock(Utc::now).await
    }

    /// Runs a pass with a pinned clock.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<RunSummary, PipelineError> {
        self.run_with_clock(move || now).await
    }

    /// Runs a pass, reading `clock` at every ledger transition so claims carry
    /// their real start time. Only storage failures abort the pass; a document
    /// that fails to extract is recorded and skipped over.
    pub async fn run_with_clock<F>(&self, clock: F) -> Result<RunSummary, PipelineError>
    where
        F: Fn() -> DateTime<Utc> + Send + Sync,
    {
        let mut summary = RunSummary::new(Uuid::new_v4());
        let run_id = summary.run_id;

        let present = self.source.list_documents().await?;
        let listing = self.ledger.list_pending(&present, clock()).await?;
        summary.skipped += listing.in_flight.len();
        info!(
            %run_id,
            present = present.len(),
            pending = listing.pending.len(),
            in_flight = listing.in_flight.len(),
            "pipeline pass started"
        );

        for doc_name in &listing.pending {
            match self.ledger.mark_in_progress(doc_name, clock()).await? {
                Claim::Claimed => {}
                Claim::Conflict(status) => {
                    debug!(%run_id, doc_name = %doc_name, %status, "document claimed elsewhere");
                    summary.skipped += 1;
                    continue;
                }
            }

            match self.extract(doc_name, clock()).await {
                Ok(chunks) => {
                    let chunk_count = chunks.len();
                    self.store.replace_document(doc_name, chunks).await?;
                    self.ledger
                        .mark_complete(doc_name, chunk_count, clock())
                        .await?;
                    summary.processed += 1;
                    summary.chunks_written += chunk_count;
                    info!(%run_id, doc_name = %doc_name, chunk_count, "document indexed");
                }
                Err(error) => {
                    warn!(%run_id, doc_name = %doc_name, %error, "document extraction failed");
                    if matches!(error, ExtractionError::Timeout { .. }) {
                        summary.abandoned_workers += 1;
                    }
                    self.ledger
                        .mark_failed(doc_name, &error.to_string(), clock())
                        .await?;
                    summary.failed += 1;
                }
            }
        }

        if summary.processed > 0 {
            self.notifier.request_refresh();
            summary.refresh_requested = true;
        }

        if summary.abandoned_workers > 0 {
            warn!(
                %run_id,
                abandoned_workers = summary.abandoned_workers,
                "timed-out extraction workers are still running"
            );
        }
        info!(
            %run_id,
            processed = summary.processed,
            failed = summary.failed,
            skipped = summary.skipped,
            chunks_written = summary.chunks_written,
            "pipeline pass finished"
        );
        Ok(summary)
    }

    /// Streams the document through the layout engine on a blocking worker.
    /// Pages are read strictly in order; nothing is kept from a failed stream.
    /// A worker that times out is detached, not cancelled.
    async fn extract(
        &self,
        doc_name: &str,
        extracted_at: DateTime<Utc>,
    ) -> Result<Vec<DocumentChunk>, ExtractionError> {
        let layout = Arc::clone(&self.layout);
        let name = doc_name.to_string();
        let worker = tokio::task::spawn_blocking(move || {
            let boxes = layout.text_boxes(&name)?;
            build_document_chunks(&name, boxes, extracted_at)
        });

        let after = self.config.extraction_timeout;
        match tokio::time::timeout(after, worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ExtractionError::WorkerStopped {
                doc_name: doc_name.to_string(),
                reason: join_error.to_string(),
            }),
            Err(_) => Err(ExtractionError::Timeout {
                doc_name: doc_name.to_string(),
                after,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::TextBoxStream;
    use crate::models::{BoundingBox, IngestionStatus, RawTextBox};
    use crate::stores::{MemoryChunkStore, MemoryLedger};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeSource {
        names: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn with(names: &[&str]) -> Self {
            Self {
                names: Mutex::new(names.iter().map(|name| name.to_string()).collect()),
            }
        }
    }

    #[async_trait]
    impl DocumentSource for FakeSource {
        async fn list_documents(&self) -> Result<Vec<String>, crate::StorageError> {
            Ok(self.names.lock().expect("source lock").clone())
        }
    }

    /// Serves canned boxes per document; names missing from the map are unreadable.
    #[derive(Default)]
    struct FakeLayout {
        documents: Mutex<HashMap<String, Vec<RawTextBox>>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl FakeLayout {
        fn set(&self, doc_name: &str, boxes: Vec<RawTextBox>) {
            self.documents
                .lock()
                .expect("layout lock")
                .insert(doc_name.to_string(), boxes);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl LayoutAdapter for FakeLayout {
        fn text_boxes(&self, doc_name: &str) -> Result<TextBoxStream, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            let boxes = self
                .documents
                .lock()
                .expect("layout lock")
                .get(doc_name)
                .cloned()
                .ok_or_else(|| ExtractionError::unreadable(doc_name, "not a pdf"))?;
            Ok(Box::new(boxes.into_iter().map(Ok)))
        }
    }

    #[derive(Default)]
    struct FakeNotifier {
        refreshes: AtomicUsize,
    }

    impl IndexNotifier for Arc<FakeNotifier> {
        fn request_refresh(&self) {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
        }
    }

    type TestPipeline =
        Pipeline<FakeSource, FakeLayout, MemoryChunkStore, MemoryLedger, Arc<FakeNotifier>>;

    struct Harness {
        layout: Arc<FakeLayout>,
        store: Arc<MemoryChunkStore>,
        ledger: Arc<MemoryLedger>,
        notifier: Arc<FakeNotifier>,
    }

    impl Harness {
        fn new(layout: FakeLayout) -> Self {
            Self {
                layout: Arc::new(layout),
                store: Arc::new(MemoryChunkStore::new()),
                ledger: Arc::new(MemoryLedger::default()),
                notifier: Arc::new(FakeNotifier::default()),
            }
        }

        fn pipeline(&self, source: FakeSource) -> TestPipeline {
            Pipeline::new(
                source,
                Arc::clone(&self.layout),
                Arc::clone(&self.store),
                Arc::clone(&self.ledger),
                Arc::clone(&self.notifier),
                PipelineConfig::default(),
            )
            .expect("default config is valid")
        }

        async fn status(&self, doc_name: &str) -> Option<IngestionStatus> {
            self.ledger
                .records()
                .await
                .ok()?
                .into_iter()
                .find(|record| record.doc_name == doc_name)
                .map(|record| record.status)
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 6, 0, 0).unwrap()
    }

    fn letter_box(page_index: u32, y0: f64, text: &str) -> RawTextBox {
        RawTextBox {
            page_index,
            bbox: BoundingBox::new(54.0, y0, 200.0, y0 + 20.0),
            page_width: 612.0,
            page_height: 792.0,
            text: text.to_string(),
        }
    }

    fn column(count: usize) -> Vec<RawTextBox> {
        (0..count)
            .map(|index| letter_box(1, 750.0 - index as f64 * 10.0, &format!("line {index}")))
            .collect()
    }

    #[tokio::test]
    async fn two_page_document_yields_expected_first_chunk() -> Result<(), PipelineError> {
        let harness = Harness::new(FakeLayout::default());
        harness.layout.set(
            "A.pdf",
            vec![
                RawTextBox {
                    bbox: BoundingBox::new(54.0, 700.0, 200.0, 720.0),
                    ..letter_box(1, 0.0, "Protocol title\n")
                },
                letter_box(2, 400.0, "Objectives\n"),
            ],
        );

        let summary = harness
            .pipeline(FakeSource::with(&["A.pdf"]))
            .run_once_at(now())
            .await?;

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.chunks_written, 2);
        assert!(summary.refresh_requested);

        let chunks = harness.store.document_chunks("A.pdf").await?;
        assert_eq!(chunks[0].chunk_id, "A.pdf_p1_c1");
        assert_eq!(
            chunks[0].position().map(|position| position.label.to_string()),
            Ok("top-left".to_string())
        );
        assert_eq!(chunks[1].chunk_id, "A.pdf_p2_c1");
        assert_eq!(harness.status("A.pdf").await, Some(IngestionStatus::Complete));
        assert_eq!(harness.notifier.refreshes.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn second_pass_without_new_documents_changes_nothing() -> Result<(), PipelineError> {
        let harness = Harness::new(FakeLayout::default());
        harness.layout.set("A.pdf", column(3));
        let pipeline = harness.pipeline(FakeSource::with(&["A.pdf"]));

        pipeline.run_once_at(now()).await?;
        let records_before = harness.ledger.records().await?;
        let chunks_before = harness.store.document_chunks("A.pdf").await?;

        let summary = pipeline.run_once_at(now() + chrono::Duration::hours(1)).await?;

        assert_eq!(summary.processed, 0);
        assert_eq!(summary.chunks_written, 0);
        assert!(!summary.refresh_requested);
        assert_eq!(harness.layout.calls(), 1);
        assert_eq!(harness.ledger.records().await?, records_before);
        assert_eq!(harness.store.document_chunks("A.pdf").await?, chunks_before);
        assert_eq!(harness.notifier.refreshes.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failing_document_does_not_touch_the_others() -> Result<(), PipelineError> {
        let harness = Harness::new(FakeLayout::default());
        harness.layout.set("A.pdf", column(2));
        harness.layout.set("C.pdf", column(1));

        let summary = harness
            .pipeline(FakeSource::with(&["A.pdf", "B.pdf", "C.pdf"]))
            .run_once_at(now())
            .await?;

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(harness.status("A.pdf").await, Some(IngestionStatus::Complete));
        assert_eq!(harness.status("B.pdf").await, Some(IngestionStatus::Failed));
        assert_eq!(harness.status("C.pdf").await, Some(IngestionStatus::Complete));
        assert_eq!(harness.store.document_chunks("A.pdf").await?.len(), 2);
        assert!(harness.store.document_chunks("B.pdf").await?.is_empty());

        let failed = harness
            .ledger
            .records()
            .await?
            .into_iter()
            .find(|record| record.doc_name == "B.pdf")
            .and_then(|record| record.error_detail)
            .unwrap_or_default();
        assert!(failed.contains("unreadable"));
        Ok(())
    }

    #[tokio::test]
    async fn failed_document_is_retried_after_backoff() -> Result<(), PipelineError> {
        let harness = Harness::new(FakeLayout::default());
        let pipeline = harness.pipeline(FakeSource::with(&["B.pdf"]));

        let first = pipeline.run_once_at(now()).await?;
        assert_eq!(first.failed, 1);
        assert!(!first.refresh_requested);

        harness.layout.set("B.pdf", column(1));
        let retry_at = now() + chrono::Duration::minutes(10);
        let second = pipeline.run_once_at(retry_at).await?;

        assert_eq!(second.processed, 1);
        assert_eq!(harness.status("B.pdf").await, Some(IngestionStatus::Complete));
        Ok(())
    }

    #[tokio::test]
    async fn reextraction_replaces_the_whole_chunk_set() -> Result<(), PipelineError> {
        let harness = Harness::new(FakeLayout::default());
        harness
            .store
            .replace_document(
                "A.pdf",
                build_document_chunks("A.pdf", column(50).into_iter().map(Ok), now())
                    .map_err(|error| crate::StorageError::Worker(error.to_string()))?,
            )
            .await?;
        harness.layout.set("A.pdf", column(30));

        harness
            .pipeline(FakeSource::with(&["A.pdf"]))
            .run_once_at(now())
            .await?;

        let chunks = harness.store.document_chunks("A.pdf").await?;
        assert_eq!(chunks.len(), 30);
        assert_eq!(chunks.last().map(|chunk| chunk.chunk_id.as_str()), Some("A.pdf_p1_c30"));
        Ok(())
    }

    #[tokio::test]
    async fn empty_document_completes_with_zero_chunks() -> Result<(), PipelineError> {
        let harness = Harness::new(FakeLayout::default());
        harness.layout.set("blank.pdf", Vec::new());

        let summary = harness
            .pipeline(FakeSource::with(&["blank.pdf"]))
            .run_once_at(now())
            .await?;

        assert_eq!(summary.processed, 1);
        assert_eq!(harness.status("blank.pdf").await, Some(IngestionStatus::Complete));
        Ok(())
    }

    #[tokio::test]
    async fn slow_extraction_times_out_and_is_recorded() -> Result<(), PipelineError> {
        let harness = Harness::new(FakeLayout {
            delay: Some(Duration::from_millis(300)),
            ..FakeLayout::default()
        });
        harness.layout.set("A.pdf", column(1));
        let pipeline = Pipeline::new(
            FakeSource::with(&["A.pdf"]),
            Arc::clone(&harness.layout),
            Arc::clone(&harness.store),
            Arc::clone(&harness.ledger),
            Arc::clone(&harness.notifier),
            PipelineConfig {
                extraction_timeout: Duration::from_millis(20),
                ..PipelineConfig::default()
            },
        )?;

        let summary = pipeline.run_once_at(now()).await?;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.abandoned_workers, 1);
        assert_eq!(harness.status("A.pdf").await, Some(IngestionStatus::Failed));
        let detail = harness
            .ledger
            .records()
            .await?
            .into_iter()
            .find_map(|record| record.error_detail)
            .unwrap_or_default();
        assert!(detail.contains("timed out"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_passes_extract_a_document_once() -> Result<(), PipelineError> {
        let harness = Harness::new(FakeLayout {
            delay: Some(Duration::from_millis(100)),
            ..FakeLayout::default()
        });
        harness.layout.set("A.pdf", column(4));

        let first = harness.pipeline(FakeSource::with(&["A.pdf"]));
        let second = harness.pipeline(FakeSource::with(&["A.pdf"]));
        let (left, right) = tokio::join!(first.run_once_at(now()), second.run_once_at(now()));
        let (left, right) = (left?, right?);

        assert_eq!(harness.layout.calls(), 1);
        assert_eq!(left.processed + right.processed, 1);
        assert_eq!(left.skipped + right.skipped, 1);
        assert_eq!(harness.store.document_chunks("A.pdf").await?.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn abandoned_claim_is_picked_up_after_staleness_timeout() -> Result<(), PipelineError> {
        let harness = Harness::new(FakeLayout::default());
        harness.layout.set("A.pdf", column(2));
        let present = vec!["A.pdf".to_string()];

        harness.ledger.list_pending(&present, now()).await?;
        assert_eq!(harness.ledger.mark_in_progress("A.pdf", now()).await?, Claim::Claimed);

        let pipeline = harness.pipeline(FakeSource::with(&["A.pdf"]));
        let too_early = pipeline.run_once_at(now() + chrono::Duration::minutes(5)).await?;
        assert_eq!(too_early.skipped, 1);
        assert_eq!(harness.layout.calls(), 0);

        let later = pipeline.run_once_at(now() + chrono::Duration::hours(1)).await?;
        assert_eq!(later.processed, 1);
        assert_eq!(harness.status("A.pdf").await, Some(IngestionStatus::Complete));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_claims_record_their_own_start_time() -> Result<(), PipelineError> {
        let harness = Harness::new(FakeLayout {
            delay: Some(Duration::from_millis(300)),
            ..FakeLayout::default()
        });
        harness.layout.set("A.pdf", column(1));
        harness.layout.set("B.pdf", column(1));

        // 300 ms of wall time is 20 minutes on this clock, so B.pdf is
        // claimed about 20 minutes into the first pass.
        let started = std::time::Instant::now();
        let scaled = move || {
            now() + chrono::Duration::from_std(started.elapsed() * 4000).unwrap_or_default()
        };

        let first = harness.pipeline(FakeSource::with(&["A.pdf", "B.pdf"]));
        let second = harness.pipeline(FakeSource::with(&["A.pdf", "B.pdf"]));
        let overlapping = async {
            tokio::time::sleep(Duration::from_millis(450)).await;
            second
                .run_once_at(now() + chrono::Duration::minutes(31))
                .await
        };
        let (left, right) = tokio::join!(first.run_with_clock(scaled), overlapping);
        let (left, right) = (left?, right?);

        assert_eq!(harness.layout.calls(), 2);
        assert_eq!(left.processed, 2);
        assert_eq!(right.processed, 0);
        assert_eq!(right.skipped, 1);

        let claimed_b = harness
            .ledger
            .records()
            .await?
            .into_iter()
            .find(|record| record.doc_name == "B.pdf")
            .and_then(|record| record.last_attempt_at);
        assert!(claimed_b > Some(now() + chrono::Duration::minutes(15)));
        Ok(())
    }

    #[test]
    fn staleness_must_outlast_the_extraction_timeout() {
        let harness = Harness::new(FakeLayout::default());
        let result = Pipeline::new(
            FakeSource::with(&["A.pdf"]),
            Arc::clone(&harness.layout),
            Arc::clone(&harness.store),
            Arc::clone(&harness.ledger),
            Arc::clone(&harness.notifier),
            PipelineConfig {
                extraction_timeout: Duration::from_secs(120),
                stale_after: Duration::from_secs(60),
                ..PipelineConfig::default()
            },
        );
        assert!(matches!(
            result,
            Err(ConfigError::StaleBeforeTimeout { .. })
        ));
    }

    /// Chunk store whose writes always fail.
    struct FullDisk;

    #[async_trait]
    impl ChunkStore for FullDisk {
        async fn replace_document(
            &self,
            _doc_name: &str,
            _chunks: Vec<DocumentChunk>,
        ) -> Result<(), crate::StorageError> {
            Err(crate::StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no space left on device",
            )))
        }

        async fn document_chunks(
            &self,
            _doc_name: &str,
        ) -> Result<Vec<DocumentChunk>, crate::StorageError> {
            Ok(Vec::new())
        }

        async fn document_names(&self) -> Result<Vec<String>, crate::StorageError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn storage_failure_aborts_the_pass_and_leaves_the_claim() -> Result<(), PipelineError> {
        let harness = Harness::new(FakeLayout::default());
        harness.layout.set("A.pdf", column(2));
        harness.layout.set("B.pdf", column(2));

        let broken = Pipeline::new(
            FakeSource::with(&["A.pdf", "B.pdf"]),
            Arc::clone(&harness.layout),
            Arc::new(FullDisk),
            Arc::clone(&harness.ledger),
            Arc::clone(&harness.notifier),
            PipelineConfig::default(),
        )?;

        let outcome = broken.run_once_at(now()).await;
        assert!(matches!(outcome, Err(PipelineError::Storage(_))));
        assert_eq!(harness.layout.calls(), 1);
        assert_eq!(harness.status("A.pdf").await, Some(IngestionStatus::InProgress));
        assert_eq!(harness.status("B.pdf").await, Some(IngestionStatus::Pending));
        assert_eq!(harness.notifier.refreshes.load(Ordering::SeqCst), 0);

        let pipeline = harness.pipeline(FakeSource::with(&["A.pdf", "B.pdf"]));
        let too_early = pipeline.run_once_at(now() + chrono::Duration::minutes(5)).await?;
        assert_eq!(too_early.skipped, 1);
        assert_eq!(too_early.processed, 1);
        assert_eq!(harness.status("A.pdf").await, Some(IngestionStatus::InProgress));

        let later = pipeline.run_once_at(now() + chrono::Duration::hours(1)).await?;
        assert_eq!(later.processed, 1);
        assert_eq!(harness.status("A.pdf").await, Some(IngestionStatus::Complete));
        Ok(())
    }
}
