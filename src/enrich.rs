//! Background session enrichment.
//!
//! Computing the enhanced fingerprint and merging device details must never
//! sit on the login critical path, so jobs are handed to a bounded queue and
//! processed by one background worker. The queue is fire-and-forget: a full
//! queue drops the job with a warning, the session simply stays unenriched.
//! A job that is accepted but fails ends the session instead; a
//! half-enriched record is never left behind.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::fingerprint::{ClientSignals, HeaderComponents, enhanced_fingerprint};
use crate::session::SessionManager;

const QUEUE_CAPACITY: usize = 256;

/// A deferred enrichment request captured at session creation.
#[derive(Debug)]
pub struct EnrichmentJob {
    pub session_key: String,
    pub components: HeaderComponents,
    pub signals: ClientSignals,
}

/// Handle for enqueueing enrichment work.
#[derive(Clone)]
pub struct EnrichmentQueue {
    tx: mpsc::Sender<EnrichmentJob>,
}

impl EnrichmentQueue {
    /// Enqueue without blocking. Dropping on overflow is acceptable; the
    /// session remains valid on its fast fingerprint alone.
    pub fn enqueue(&self, job: EnrichmentJob) {
        if let Err(e) = self.tx.try_send(job) {
            warn!(error = %e, "Enrichment queue full; dropping job");
        }
    }
}

/// Spawn the enrichment worker. Returns the queue handle and the worker task.
pub fn spawn_enrichment_worker(
    sessions: Arc<SessionManager>,
) -> (EnrichmentQueue, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<EnrichmentJob>(QUEUE_CAPACITY);

    let handle = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            process_job(&sessions, job).await;
        }
    });

    (EnrichmentQueue { tx }, handle)
}

async fn process_job(sessions: &SessionManager, job: EnrichmentJob) {
    let fingerprint = enhanced_fingerprint(&job.components, &job.signals);
    let extra = extra_from_signals(&job.signals);

    match sessions.apply_enrichment(&job.session_key, &fingerprint, extra).await {
        Ok(true) => {
            debug!(session_key = %job.session_key, "Enriched session");
        }
        Ok(false) => {
            debug!(session_key = %job.session_key, "Session gone before enrichment");
        }
        Err(e) => {
            warn!(
                session_key = %job.session_key,
                error = %e,
                "Enrichment failed; ending session"
            );
            if let Err(e) = sessions.invalidate(&job.session_key, "enrichment_failed").await {
                warn!(error = %e, "Failed to end session after enrichment failure");
            }
        }
    }
}

/// Keep the human-meaningful signals as session metadata. Opaque hashes
/// only feed the fingerprint.
fn extra_from_signals(signals: &ClientSignals) -> BTreeMap<String, String> {
    let mut extra = BTreeMap::new();
    let mut put = |key: &str, value: &str| {
        if !value.is_empty() {
            extra.insert(key.to_string(), value.to_string());
        }
    };
    put("screen_resolution", &signals.screen_resolution);
    put("timezone", &signals.timezone);
    put("platform", &signals.platform);
    put("language", &signals.language);
    put("touch_support", &signals.touch_support);
    extra
}
