//! End-to-end tests of the scan and OCR pipelines over a real SQLite store,
//! with in-memory content sources and a counting recognizer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tempfile::TempDir;

use mrkr::config::Config;
use mrkr::dispatcher::Dispatcher;
use mrkr::jobs::{start_dispatcher, RUN_OCR};
use mrkr::ocr::{begin_ocr, ocr_project, run_ocr, OcrOutcome};
use mrkr::raster::PageImage;
use mrkr::recognize::Recognizer;
use mrkr::scan::{begin_scan, request_ocr, request_scan, run_scan};
use mrkr::services::Services;
use mrkr::source::{SourceProvider, Sources};
use mrkr::sqlite_store::SqliteStore;
use mrkr::{db, migrate};
use mrkr_core::checksum::content_checksum;
use mrkr_core::error::{ConsistencyError, SourceError};
use mrkr_core::models::{
    NewProject, OcrResult, Project, ProviderKind, RecognizedRegion, SourceFile, SourceLocator,
    Task,
};
use mrkr_core::reconcile::ReconcileSummary;
use mrkr_core::status::{ProjectStatus, TaskStatus};
use mrkr_core::store::Store;

/// Files held in memory. Content starting with `BROKEN` cannot be rasterized.
#[derive(Default)]
struct FakeSource {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    /// Appended verbatim to every listing.
    extra: Mutex<Vec<SourceFile>>,
}

impl FakeSource {
    fn put(&self, uri: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(uri.to_string(), content.to_vec());
    }

    fn remove(&self, uri: &str) {
        self.files.lock().unwrap().remove(uri);
    }
}

#[async_trait]
impl SourceProvider for FakeSource {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn list_files(&self, _pattern: &str) -> Result<Vec<SourceFile>> {
        let mut listing: Vec<SourceFile> = self
            .files
            .lock()
            .unwrap()
            .iter()
            .map(|(uri, content)| SourceFile {
                name: uri.rsplit('/').next().unwrap_or(uri).to_string(),
                uri: uri.clone(),
                etag: content_checksum(content),
            })
            .collect();
        listing.extend(self.extra.lock().unwrap().iter().cloned());
        Ok(listing)
    }

    async fn read(&self, uri: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| {
                SourceError::NotFound {
                    uri: uri.to_string(),
                }
                .into()
            })
    }

    async fn to_images(&self, uri: &str) -> Result<Vec<PageImage>> {
        let data = self.read(uri).await?;
        if data.starts_with(b"BROKEN") {
            anyhow::bail!("cannot decode image");
        }
        Ok(vec![PageImage {
            width: 1000,
            height: 500,
            data,
            extension: "png".to_string(),
        }])
    }
}

/// Reports one word per page and counts its calls.
#[derive(Default)]
struct FakeRecognizer {
    calls: AtomicUsize,
}

#[async_trait]
impl Recognizer for FakeRecognizer {
    fn provider(&self) -> &str {
        "fake"
    }

    async fn recognize(&self, _image: &PageImage) -> Result<Vec<RecognizedRegion>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![RecognizedRegion {
            content: "Invoice".to_string(),
            confidence: Some(0.91),
            left_px: 100.0,
            top_px: 50.0,
            width_px: 200.0,
            height_px: 25.0,
        }])
    }
}

/// Delegates to an inner store, but every `save_ocr_result` fails.
struct FailingSaveStore {
    inner: Arc<dyn Store>,
}

#[async_trait]
impl Store for FailingSaveStore {
    async fn create_project(&self, project: NewProject, now: DateTime<Utc>) -> Result<Project> {
        self.inner.create_project(project, now).await
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.inner.get_project(id).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        self.inner.list_projects().await
    }

    async fn update_project_status(
        &self,
        id: &str,
        status: ProjectStatus,
        last_scan: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.inner.update_project_status(id, status, last_scan).await
    }

    async fn list_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        self.inner.list_tasks(project_id).await
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.inner.get_task(id).await
    }

    async fn reconcile(
        &self,
        project_id: &str,
        listing: &[SourceFile],
        now: DateTime<Utc>,
    ) -> Result<ReconcileSummary> {
        self.inner.reconcile(project_id, listing, now).await
    }

    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        last_ocr: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.inner.update_task_status(id, status, last_ocr).await
    }

    async fn get_ocr_result(&self, id: &str) -> Result<Option<OcrResult>> {
        self.inner.get_ocr_result(id).await
    }

    async fn list_ocr_results(&self, task_id: &str) -> Result<Vec<OcrResult>> {
        self.inner.list_ocr_results(task_id).await
    }

    async fn save_ocr_result(&self, _result: &OcrResult) -> Result<()> {
        anyhow::bail!("disk I/O error")
    }
}

struct Harness {
    _tmp: TempDir,
    services: Services,
    source: Arc<FakeSource>,
    recognizer: Arc<FakeRecognizer>,
}

impl Harness {
    fn calls(&self) -> usize {
        self.recognizer.calls.load(Ordering::SeqCst)
    }

    async fn project(&self) -> Project {
        self.services
            .store
            .create_project(
                NewProject {
                    name: "invoices".to_string(),
                    description: String::new(),
                    source: SourceLocator {
                        provider: ProviderKind::Local,
                        uri: "invoices/*.png".to_string(),
                    },
                },
                Utc::now(),
            )
            .await
            .unwrap()
    }

    async fn scan(&self, project_id: &str) -> Result<ReconcileSummary> {
        assert!(begin_scan(&self.services, project_id).await?);
        run_scan(&self.services, project_id).await
    }

    async fn tasks(&self, project_id: &str) -> Vec<Task> {
        self.services.store.list_tasks(project_id).await.unwrap()
    }

    async fn task(&self, task_id: &str) -> Task {
        self.services
            .store
            .get_task(task_id)
            .await
            .unwrap()
            .unwrap()
    }

    async fn ocr(&self, task_id: &str, force: bool) -> OcrOutcome {
        let task = self.task(task_id).await;
        assert!(begin_ocr(&self.services, &task).await.unwrap());
        run_ocr(&self.services, task_id, force).await.unwrap()
    }
}

async fn harness(auto_ocr: bool) -> Harness {
    harness_with(auto_ocr, |store| store).await
}

/// Like [`harness`], with the SQLite store passed through `wrap`.
async fn harness_with(
    auto_ocr: bool,
    wrap: impl FnOnce(Arc<dyn Store>) -> Arc<dyn Store>,
) -> Harness {
    let tmp = TempDir::new().unwrap();
    let config: Config = toml::from_str(&format!(
        "[db]\npath = \"{}\"\n\n[scan]\nauto_ocr = {}\n",
        tmp.path().join("data/mrkr.sqlite").display(),
        auto_ocr
    ))
    .unwrap();

    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();

    let source = Arc::new(FakeSource::default());
    let recognizer = Arc::new(FakeRecognizer::default());
    let services = Services {
        store: wrap(Arc::new(SqliteStore::new(pool))),
        sources: Sources::new().with(source.clone()),
        recognizer: recognizer.clone(),
        staleness: config.scan.staleness_window(),
        auto_ocr: config.scan.auto_ocr,
    };

    Harness {
        _tmp: tmp,
        services,
        source,
        recognizer,
    }
}

#[tokio::test]
async fn test_scan_creates_tasks_and_is_idempotent() {
    let h = harness(false).await;
    h.source.put("invoices/a.png", b"page a");
    h.source.put("invoices/b.png", b"page b");
    let project = h.project().await;

    let summary = h.scan(&project.id).await.unwrap();
    assert_eq!(summary.created, 2);

    let tasks = h.tasks(&project.id).await;
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Ready));
    assert!(tasks.iter().all(|t| t.ocr_id.is_none()));

    let project = h.services.store.get_project(&project.id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Ready);
    assert!(project.last_scan.is_some());

    let again = h.scan(&project.id).await.unwrap();
    assert_eq!(again.created, 0);
    assert_eq!(again.unchanged, 2);
    let ids: Vec<_> = h.tasks(&project.id).await.into_iter().map(|t| t.id).collect();
    assert_eq!(ids, tasks.into_iter().map(|t| t.id).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_unchanged_content_is_a_cache_hit() {
    let h = harness(false).await;
    h.source.put("invoices/a.png", b"page a");
    let project = h.project().await;
    h.scan(&project.id).await.unwrap();
    let task_id = h.tasks(&project.id).await[0].id.clone();

    assert_eq!(
        h.ocr(&task_id, false).await,
        OcrOutcome::Recognized {
            pages: 1,
            blocks: 1
        }
    );
    let first = h.task(&task_id).await;
    assert_eq!(first.status, TaskStatus::Ready);
    assert!(first.ocr_id.is_some());
    assert_eq!(h.calls(), 1);

    assert_eq!(h.ocr(&task_id, false).await, OcrOutcome::CacheHit);
    assert_eq!(h.calls(), 1);
    assert_eq!(h.task(&task_id).await.ocr_id, first.ocr_id);
    assert_eq!(h.task(&task_id).await.status, TaskStatus::Ready);

    // Forced runs recognize again even with identical content.
    assert!(matches!(
        h.ocr(&task_id, true).await,
        OcrOutcome::Recognized { .. }
    ));
    assert_eq!(h.calls(), 2);
    assert_ne!(h.task(&task_id).await.ocr_id, first.ocr_id);
}

#[tokio::test]
async fn test_changed_content_produces_a_new_result() {
    let h = harness(false).await;
    h.source.put("invoices/a.png", b"first revision");
    let project = h.project().await;
    h.scan(&project.id).await.unwrap();
    let task_id = h.tasks(&project.id).await[0].id.clone();

    h.ocr(&task_id, false).await;
    let old_ocr = h.task(&task_id).await.ocr_id.unwrap();

    h.source.put("invoices/a.png", b"second revision");
    h.scan(&project.id).await.unwrap();
    assert_eq!(h.tasks(&project.id).await[0].id, task_id);

    assert!(matches!(
        h.ocr(&task_id, false).await,
        OcrOutcome::Recognized { .. }
    ));
    let new_ocr = h.task(&task_id).await.ocr_id.unwrap();
    assert_ne!(new_ocr, old_ocr);

    // History is kept; the task points at the newest result.
    let results = h.services.store.list_ocr_results(&task_id).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].etag, content_checksum(b"first revision"));
    assert_eq!(results[1].etag, content_checksum(b"second revision"));
    assert_eq!(results[1].id, new_ocr);
    assert!(h
        .services
        .store
        .get_ocr_result(&old_ocr)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_blocks_are_stored_as_percentages() {
    let h = harness(false).await;
    h.source.put("invoices/a.png", b"page a");
    let project = h.project().await;
    h.scan(&project.id).await.unwrap();
    let task_id = h.tasks(&project.id).await[0].id.clone();
    h.ocr(&task_id, false).await;

    let ocr_id = h.task(&task_id).await.ocr_id.unwrap();
    let result = h
        .services
        .store
        .get_ocr_result(&ocr_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.provider, "fake");
    assert_eq!(result.etag, content_checksum(b"page a"));
    assert_eq!(result.pages.len(), 1);

    let page = &result.pages[0];
    assert_eq!((page.index, page.width, page.height), (0, 1000, 500));
    let block = &page.blocks[0];
    assert_eq!(block.content, "Invoice");
    assert_eq!(block.confidence, Some(0.91));
    assert_eq!(block.left, 10.0);
    assert_eq!(block.top, 10.0);
    assert_eq!(block.width, 20.0);
    assert_eq!(block.height, 5.0);
}

#[tokio::test]
async fn test_removed_file_is_abandoned_then_restored() {
    let h = harness(false).await;
    h.source.put("invoices/a.png", b"page a");
    h.source.put("invoices/b.png", b"page b");
    let project = h.project().await;
    h.scan(&project.id).await.unwrap();
    let b = h
        .tasks(&project.id)
        .await
        .into_iter()
        .find(|t| t.uri == "invoices/b.png")
        .unwrap();

    h.source.remove("invoices/b.png");
    let summary = h.scan(&project.id).await.unwrap();
    assert_eq!(summary.abandoned, 1);
    let abandoned = h.task(&b.id).await;
    assert!(abandoned.abandoned);

    let err = begin_ocr(&h.services, &abandoned).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConsistencyError>(),
        Some(ConsistencyError::AbandonedTask { .. })
    ));

    h.source.put("invoices/b.png", b"page b");
    let summary = h.scan(&project.id).await.unwrap();
    assert_eq!(summary.restored, 1);
    assert_eq!(summary.created, 0);
    let restored = h.task(&b.id).await;
    assert!(!restored.abandoned);
    assert_eq!(h.tasks(&project.id).await.len(), 2);
}

#[tokio::test]
async fn test_vanished_file_marks_task_error() {
    let h = harness(false).await;
    h.source.put("invoices/a.png", b"page a");
    let project = h.project().await;
    h.scan(&project.id).await.unwrap();
    let task_id = h.tasks(&project.id).await[0].id.clone();

    h.source.remove("invoices/a.png");
    match h.ocr(&task_id, false).await {
        OcrOutcome::Failed { status, .. } => assert_eq!(status, TaskStatus::Error),
        other => panic!("expected failure, got {:?}", other),
    }
    let task = h.task(&task_id).await;
    assert_eq!(task.status, TaskStatus::Error);
    assert!(task.ocr_id.is_none());
    assert_eq!(h.calls(), 0);

    // An errored task may be retried once the file is back.
    h.source.put("invoices/a.png", b"page a");
    assert!(matches!(
        h.ocr(&task_id, false).await,
        OcrOutcome::Recognized { .. }
    ));
}

#[tokio::test]
async fn test_one_broken_file_does_not_stop_the_sweep() {
    let h = harness(false).await;
    h.source.put("invoices/a.png", b"BROKEN bytes");
    h.source.put("invoices/b.png", b"page b");
    let project = h.project().await;
    h.scan(&project.id).await.unwrap();

    let sweep = ocr_project(&h.services, &project.id, false).await.unwrap();
    assert_eq!(sweep.recognized, 1);
    assert_eq!(sweep.failed, 1);
    assert_eq!(sweep.skipped, 0);

    for task in h.tasks(&project.id).await {
        if task.uri == "invoices/a.png" {
            assert_eq!(task.status, TaskStatus::OcrFailed);
            assert!(task.ocr_id.is_none());
        } else {
            assert_eq!(task.status, TaskStatus::Ready);
            assert!(task.ocr_id.is_some());
        }
    }

    // The second sweep hits the cache for b and fails a again.
    let sweep = ocr_project(&h.services, &project.id, false).await.unwrap();
    assert_eq!(sweep.cache_hits, 1);
    assert_eq!(sweep.failed, 1);
}

#[tokio::test]
async fn test_duplicate_listing_fails_scan_without_changes() {
    let h = harness(false).await;
    h.source.put("invoices/a.png", b"page a");
    h.source.extra.lock().unwrap().push(SourceFile {
        name: "a copy.png".to_string(),
        uri: "invoices/a.png".to_string(),
        etag: "x".to_string(),
    });
    let project = h.project().await;

    let err = h.scan(&project.id).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConsistencyError>(),
        Some(ConsistencyError::DuplicateUri { .. })
    ));

    let project = h.services.store.get_project(&project.id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::ScanFailed);
    assert!(h.tasks(&project.id).await.is_empty());

    // scan_failed may be retried right away.
    h.source.extra.lock().unwrap().clear();
    assert_eq!(h.scan(&project.id).await.unwrap().created, 1);
}

#[tokio::test]
async fn test_pending_scan_blocks_until_stale() {
    let h = harness(false).await;
    let project = h.project().await;

    assert!(begin_scan(&h.services, &project.id).await.unwrap());
    assert!(!begin_scan(&h.services, &project.id).await.unwrap());

    // A worker that died mid-scan leaves the project running.
    h.services
        .store
        .update_project_status(
            &project.id,
            ProjectStatus::ScanRunning,
            Some(Utc::now() - Duration::seconds(60)),
        )
        .await
        .unwrap();
    assert!(begin_scan(&h.services, &project.id).await.unwrap());
    let project = h.services.store.get_project(&project.id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::ScanPending);
}

#[tokio::test]
async fn test_pending_ocr_blocks_until_stale() {
    let h = harness(false).await;
    h.source.put("invoices/a.png", b"page a");
    let project = h.project().await;
    h.scan(&project.id).await.unwrap();
    let task = h.tasks(&project.id).await.remove(0);

    assert!(begin_ocr(&h.services, &task).await.unwrap());
    let pending = h.task(&task.id).await;
    assert_eq!(pending.status, TaskStatus::OcrPending);
    assert!(!begin_ocr(&h.services, &pending).await.unwrap());

    let sweep = ocr_project(&h.services, &project.id, false).await.unwrap();
    assert_eq!(sweep.skipped, 1);
    assert_eq!(h.calls(), 0);
}

#[tokio::test]
async fn test_dispatcher_runs_scan_then_ocr() {
    let h = harness(true).await;
    h.source.put("invoices/a.png", b"page a");
    h.source.put("invoices/b.png", b"page b");
    let project = h.project().await;

    let dispatcher = start_dispatcher(&h.services).unwrap();
    assert!(request_scan(&h.services, &dispatcher, &project.id)
        .await
        .unwrap());

    dispatcher.drain().await;

    let tasks = h.tasks(&project.id).await;
    assert_eq!(tasks.len(), 2);
    for task in &tasks {
        assert_eq!(task.status, TaskStatus::Ready);
        assert!(task.ocr_id.is_some(), "task {} has no OCR result", task.uri);
    }
    assert_eq!(h.calls(), 2);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_failed_save_marks_task_ocr_failed() {
    let h = harness_with(false, |inner| {
        Arc::new(FailingSaveStore { inner }) as Arc<dyn Store>
    })
    .await;
    h.source.put("invoices/a.png", b"page a");
    let project = h.project().await;
    h.scan(&project.id).await.unwrap();
    let task_id = h.tasks(&project.id).await[0].id.clone();

    match h.ocr(&task_id, false).await {
        OcrOutcome::Failed { status, reason } => {
            assert_eq!(status, TaskStatus::OcrFailed);
            assert!(reason.contains("disk I/O error"), "reason: {}", reason);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    let task = h.task(&task_id).await;
    assert_eq!(task.status, TaskStatus::OcrFailed);
    assert!(task.ocr_id.is_none());

    // Not stuck in ocr_running: the next sweep retries right away.
    let sweep = ocr_project(&h.services, &project.id, false).await.unwrap();
    assert_eq!(sweep.skipped, 0);
    assert_eq!(sweep.failed, 1);
}

#[tokio::test]
async fn test_stuck_running_task_is_retried_after_window() {
    let h = harness(false).await;
    h.source.put("invoices/a.png", b"page a");
    let project = h.project().await;
    h.scan(&project.id).await.unwrap();
    let task_id = h.tasks(&project.id).await[0].id.clone();

    // A worker that died mid-run leaves the task running.
    h.services
        .store
        .update_task_status(&task_id, TaskStatus::OcrRunning, Some(Utc::now()))
        .await
        .unwrap();
    assert!(!begin_ocr(&h.services, &h.task(&task_id).await).await.unwrap());

    h.services
        .store
        .update_task_status(
            &task_id,
            TaskStatus::OcrRunning,
            Some(Utc::now() - Duration::seconds(60)),
        )
        .await
        .unwrap();
    assert!(matches!(
        h.ocr(&task_id, false).await,
        OcrOutcome::Recognized { .. }
    ));
    let task = h.task(&task_id).await;
    assert_eq!(task.status, TaskStatus::Ready);
    assert!(task.ocr_id.is_some());
}

#[tokio::test]
async fn test_forced_request_behind_stale_job_still_recognizes() {
    let h = harness(false).await;
    h.source.put("invoices/a.png", b"page a");
    let project = h.project().await;
    h.scan(&project.id).await.unwrap();
    let task_id = h.tasks(&project.id).await[0].id.clone();
    h.ocr(&task_id, false).await;
    assert_eq!(h.calls(), 1);

    // A stale pending task whose unforced job is still queued.
    h.services
        .store
        .update_task_status(
            &task_id,
            TaskStatus::OcrPending,
            Some(Utc::now() - Duration::seconds(60)),
        )
        .await
        .unwrap();
    let dispatcher = start_dispatcher(&h.services).unwrap();
    dispatcher
        .put(RUN_OCR, json!({ "task_id": task_id, "force": false }))
        .unwrap();
    assert!(request_ocr(&h.services, &dispatcher, &task_id, true)
        .await
        .unwrap());

    dispatcher.drain().await;
    dispatcher.shutdown().await;

    // The unforced job hits the cache; the forced one must still recognize.
    assert_eq!(h.calls(), 2);
    assert_eq!(h.task(&task_id).await.status, TaskStatus::Ready);
    assert_eq!(
        h.services.store.list_ocr_results(&task_id).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_refused_enqueue_restores_prior_status() {
    let h = harness(false).await;
    h.source.put("invoices/a.png", b"page a");
    let project = h.project().await;
    h.scan(&project.id).await.unwrap();
    let task = h.tasks(&project.id).await.remove(0);

    // No queues registered, so every put fails.
    let dispatcher = Dispatcher::new();

    assert!(request_scan(&h.services, &dispatcher, &project.id)
        .await
        .is_err());
    let after = h.services.store.get_project(&project.id).await.unwrap().unwrap();
    assert_eq!(after.status, ProjectStatus::Ready);
    assert!(begin_scan(&h.services, &project.id).await.unwrap());

    assert!(request_ocr(&h.services, &dispatcher, &task.id, false)
        .await
        .is_err());
    let after = h.task(&task.id).await;
    assert_eq!(after.status, TaskStatus::Ready);
    assert!(begin_ocr(&h.services, &after).await.unwrap());
}
