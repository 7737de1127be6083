use super::*;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex as StdMutex,
};

use crate::{error::MediaHostError, AppEvent, MediaHost, Notice};
use async_trait::async_trait;
use shared::domain::PDF_CONTENT_TYPE;
use tokio::sync::broadcast;

struct TestMediaHost {
    fail_names: Vec<String>,
    calls: AtomicU32,
}

impl TestMediaHost {
    fn ok() -> Arc<Self> {
        Self::failing_on(&[])
    }

    fn failing_on(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            fail_names: names.iter().map(|n| n.to_string()).collect(),
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl MediaHost for TestMediaHost {
    async fn store(
        &self,
        file: &CandidateFile,
        folder: &str,
    ) -> Result<StoredBlob, MediaHostError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_names.contains(&file.name) {
            return Err(MediaHostError::Rejected {
                status: 500,
                message: "simulated host failure".to_string(),
            });
        }
        Ok(StoredBlob {
            url: format!("https://media.test/{folder}/{}", file.name),
        })
    }
}

#[derive(Default)]
struct CollectingProgress {
    values: StdMutex<Vec<u8>>,
}

impl CollectingProgress {
    fn seen(&self) -> Vec<u8> {
        self.values.lock().expect("progress lock").clone()
    }
}

impl ProgressObserver for CollectingProgress {
    fn progress(&self, percent: u8) {
        self.values.lock().expect("progress lock").push(percent);
    }
}

fn pipeline(host: Arc<TestMediaHost>) -> (UploadPipeline, broadcast::Receiver<AppEvent>) {
    let (events, rx) = broadcast::channel(64);
    (UploadPipeline::new(host, events), rx)
}

fn drain_notices(rx: &mut broadcast::Receiver<AppEvent>) -> Vec<Notice> {
    let mut notices = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let AppEvent::Notice(notice) = event {
            notices.push(notice);
        }
    }
    notices
}

fn pdf(name: &str) -> CandidateFile {
    CandidateFile {
        name: name.to_string(),
        content_type: PDF_CONTENT_TYPE.to_string(),
        bytes: b"%PDF-1.4 test payload".to_vec(),
    }
}

fn png(name: &str) -> CandidateFile {
    CandidateFile {
        name: name.to_string(),
        content_type: "image/png".to_string(),
        bytes: vec![0x89, 0x50, 0x4e, 0x47],
    }
}

#[tokio::test]
async fn filters_non_pdfs_and_warns_about_the_partial_rejection() {
    let host = TestMediaHost::ok();
    let (pipeline, mut rx) = pipeline(Arc::clone(&host));

    let outcome = pipeline
        .upload(
            vec![pdf("january.pdf"), png("photo.png"), pdf("february.pdf")],
            "Acme",
            &NullProgress,
        )
        .await
        .expect("upload");

    assert_eq!(outcome.accepted.len(), 2);
    assert_eq!(outcome.rejected_count, 1);
    assert!(outcome
        .accepted
        .iter()
        .all(|record| record.content_type == PDF_CONTENT_TYPE));
    assert_eq!(host.calls.load(Ordering::SeqCst), 2);

    let notices = drain_notices(&mut rx);
    assert_eq!(
        notices,
        vec![Notice::Warning(
            "Some files were skipped. Only PDF files are allowed.".to_string()
        )]
    );
}

#[tokio::test]
async fn batch_without_pdfs_fails_before_any_network_call() {
    let host = TestMediaHost::ok();
    let (pipeline, _rx) = pipeline(Arc::clone(&host));

    let err = pipeline
        .upload(vec![png("photo.png")], "Acme", &NullProgress)
        .await
        .expect_err("must fail");
    assert_eq!(err, UploadError::NoValidFiles);
    assert_eq!(host.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn one_failing_file_is_skipped_and_the_batch_still_succeeds() {
    let host = TestMediaHost::failing_on(&["february.pdf"]);
    let (pipeline, mut rx) = pipeline(host);

    let outcome = pipeline
        .upload(
            vec![pdf("january.pdf"), pdf("february.pdf"), pdf("march.pdf")],
            "Acme",
            &NullProgress,
        )
        .await
        .expect("batch succeeds overall");

    let names: Vec<&str> = outcome
        .accepted
        .iter()
        .map(|record| record.name.as_str())
        .collect();
    assert_eq!(names, vec!["january.pdf", "march.pdf"]);

    let failures: Vec<Notice> = drain_notices(&mut rx)
        .into_iter()
        .filter(|notice| matches!(notice, Notice::Error(_)))
        .collect();
    assert_eq!(failures.len(), 1);
    match &failures[0] {
        Notice::Error(message) => assert!(message.contains("february.pdf")),
        other => panic!("unexpected notice: {other:?}"),
    }
}

#[tokio::test]
async fn all_failures_produce_all_uploads_failed() {
    let host = TestMediaHost::failing_on(&["january.pdf", "february.pdf"]);
    let (pipeline, _rx) = pipeline(host);
    let progress = CollectingProgress::default();

    let err = pipeline
        .upload(
            vec![pdf("january.pdf"), pdf("february.pdf")],
            "Acme",
            &progress,
        )
        .await
        .expect_err("must fail");
    assert_eq!(err, UploadError::AllUploadsFailed);
    // 100 is never reported for a batch that produced nothing.
    assert_eq!(progress.seen(), vec![0, 45]);
}

#[tokio::test]
async fn progress_is_monotonic_and_ends_at_one_hundred() {
    let host = TestMediaHost::ok();
    let (pipeline, _rx) = pipeline(host);
    let progress = CollectingProgress::default();

    pipeline
        .upload(
            vec![pdf("a.pdf"), pdf("b.pdf"), pdf("c.pdf")],
            "Acme",
            &progress,
        )
        .await
        .expect("upload");

    let seen = progress.seen();
    assert_eq!(seen, vec![0, 30, 60, 100]);
    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test]
async fn accepted_records_carry_fresh_ids_and_host_urls() {
    let host = TestMediaHost::ok();
    let (pipeline, _rx) = pipeline(host);

    let bytes_len = pdf("a.pdf").bytes.len() as u64;
    let outcome = pipeline
        .upload(vec![pdf("a.pdf"), pdf("b.pdf")], "Acme", &NullProgress)
        .await
        .expect("upload");

    assert_ne!(outcome.accepted[0].id, outcome.accepted[1].id);
    assert_eq!(outcome.accepted[0].url, "https://media.test/Acme/a.pdf");
    assert_eq!(outcome.accepted[0].size, bytes_len);
}
