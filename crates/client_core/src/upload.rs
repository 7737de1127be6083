use std::sync::Arc;

use chrono::Utc;
use shared::domain::{PayslipFile, PayslipId, PDF_CONTENT_TYPE};
use tokio::sync::broadcast;
use tracing::warn;

use crate::{error::UploadError, AppEvent, MediaHost, Notice};

/// A file picked by the user, before any filtering.
#[derive(Debug, Clone)]
pub struct CandidateFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Durable blob handle issued by the media host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub accepted: Vec<PayslipFile>,
    pub rejected_count: usize,
}

/// Receives a monotonically non-decreasing percentage in `[0, 100]`.
pub trait ProgressObserver: Send + Sync {
    fn progress(&self, percent: u8);
}

/// For callers that do not render progress.
pub struct NullProgress;

impl ProgressObserver for NullProgress {
    fn progress(&self, _percent: u8) {}
}

/// Filters a picked batch down to PDFs and uploads them one at a time.
/// Individual failures are tolerated: the failing file is skipped with an
/// error notice and the batch carries on. Uploads run sequentially so the
/// progress accounting stays linear and the host never sees a burst of
/// concurrent requests.
pub struct UploadPipeline {
    host: Arc<dyn MediaHost>,
    events: broadcast::Sender<AppEvent>,
}

impl UploadPipeline {
    pub fn new(host: Arc<dyn MediaHost>, events: broadcast::Sender<AppEvent>) -> Self {
        Self { host, events }
    }

    /// `destination` is the folder label handed to the media host. Progress
    /// is reported before each upload starts, reserving the final 10% for
    /// completion; 100 is reached only after the last attempt resolves.
    pub async fn upload(
        &self,
        files: Vec<CandidateFile>,
        destination: &str,
        progress: &dyn ProgressObserver,
    ) -> Result<UploadOutcome, UploadError> {
        let (accepted, rejected): (Vec<_>, Vec<_>) = files
            .into_iter()
            .partition(|f| f.content_type == PDF_CONTENT_TYPE);
        if accepted.is_empty() {
            return Err(UploadError::NoValidFiles);
        }
        let rejected_count = rejected.len();
        if rejected_count > 0 {
            self.notice(Notice::Warning(
                "Some files were skipped. Only PDF files are allowed.".to_string(),
            ));
        }

        let total = accepted.len();
        let mut uploaded = Vec::with_capacity(total);
        for (index, file) in accepted.into_iter().enumerate() {
            progress.progress((index as f64 / total as f64 * 90.0).round() as u8);
            match self.host.store(&file, destination).await {
                Ok(blob) => uploaded.push(PayslipFile {
                    id: PayslipId::generate(),
                    size: file.bytes.len() as u64,
                    name: file.name,
                    content_type: file.content_type,
                    url: blob.url,
                    uploaded_at: Utc::now(),
                }),
                Err(err) => {
                    warn!(name = %file.name, %err, "payslip upload failed, continuing with the batch");
                    let failure = UploadError::UploadFailed {
                        name: file.name,
                        reason: err.to_string(),
                    };
                    self.notice(Notice::Error(failure.to_string()));
                }
            }
        }

        if uploaded.is_empty() {
            return Err(UploadError::AllUploadsFailed);
        }
        progress.progress(100);
        Ok(UploadOutcome {
            accepted: uploaded,
            rejected_count,
        })
    }

    fn notice(&self, notice: Notice) {
        let _ = self.events.send(AppEvent::Notice(notice));
    }
}

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod tests;
