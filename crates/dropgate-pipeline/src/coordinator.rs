//! The intake coordinator: drives one file event from raw notification to a
//! terminal outcome.
//!
//! Concurrency model: events for distinct paths run in parallel; events for
//! the same path serialize on a per-path lease. A path that already reached
//! a terminal outcome short-circuits to [`TerminalOutcome::AlreadyProcessed`]
//! when the event arrives inside the coalesce window or the source file is
//! gone, so duplicate create/modify notifications never double-process.
//!
//! Stage order for every intake: readiness wait, malware scan, then either
//! archive expansion (members become their own intakes) or hash, classify,
//! dedup, place. Transient failures retry with capped exponential backoff;
//! policy and scan failures quarantine; everything else fails the intake.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use dropgate_archive::{ArchiveKind, SafeExtractor};
use dropgate_core::config::IntakeConfig;
use dropgate_core::error::IntakeError;
use dropgate_core::hashing::digest_file;
use dropgate_core::models::{extension_of, FileEvent, IntakeRecord, ScanVerdict, TerminalOutcome};
use dropgate_scan::{QuarantineStore, ScanGateway, Scanner};

use crate::classifier::Classifier;
use crate::dedup::{DedupIndex, Resolution};
use crate::placement;

/// Upper bound on readiness probes before the intake is retried from scratch.
const STABILITY_PROBES: u32 = 50;

/// Cap on the exponential retry backoff.
const MAX_BACKOFF_MS: u64 = 5_000;

struct CompletedIntake {
    outcome: TerminalOutcome,
    at: Instant,
}

struct Inner {
    config: IntakeConfig,
    scanner: Arc<dyn Scanner>,
    quarantine: QuarantineStore,
    extractor: SafeExtractor,
    dedup: DedupIndex,
    classifier: Classifier,
    /// Per-path lease serializing concurrent events for the same file.
    leases: std::sync::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    /// Terminal outcomes keyed by source path, for event coalescing.
    outcomes: std::sync::Mutex<HashMap<PathBuf, CompletedIntake>>,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Build a coordinator with an explicit scanner (tests substitute fakes
    /// through this seam).
    pub async fn new(
        config: IntakeConfig,
        scanner: Arc<dyn Scanner>,
    ) -> Result<Self, anyhow::Error> {
        config.validate()?;

        let quarantine = QuarantineStore::new(config.quarantine_dir.clone()).await?;
        tokio::fs::create_dir_all(&config.organized_dir).await?;
        tokio::fs::create_dir_all(&config.scratch_dir).await?;

        let extractor = SafeExtractor::new(config.limits, &config.scratch_dir);
        let classifier = Classifier::from_config(&config);

        let dedup = DedupIndex::new();
        if let Some(seed) = &config.dedup_seed_path {
            if seed.exists() {
                if let Err(e) = dedup.load_seed(seed) {
                    tracing::warn!(error = %e, "Dedup seed unreadable, starting empty");
                }
            }
        }

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                scanner,
                quarantine,
                extractor,
                dedup,
                classifier,
                leases: std::sync::Mutex::new(HashMap::new()),
                outcomes: std::sync::Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Build a coordinator with the scanner described by the config.
    pub async fn from_config(config: IntakeConfig) -> Result<Self, anyhow::Error> {
        let gateway = ScanGateway::new(
            config.scan_backend.clone(),
            config.max_scan_size,
            config.scan_timeout,
            config.allow_unscanned_oversize,
        );
        Self::new(config, Arc::new(gateway)).await
    }

    pub fn config(&self) -> &IntakeConfig {
        &self.inner.config
    }

    /// Persist the dedup digest map if a seed path is configured.
    pub fn save_dedup_seed(&self) -> Result<(), anyhow::Error> {
        if let Some(seed) = &self.inner.config.dedup_seed_path {
            self.inner.dedup.save_seed(seed)?;
        }
        Ok(())
    }

    /// Process one file event to its terminal outcome.
    pub async fn submit(&self, event: FileEvent) -> TerminalOutcome {
        let path = event.path.clone();

        if let Some(ext) = extension_of(&path) {
            if self.inner.config.is_ignored_extension(&ext) {
                tracing::debug!(path = %path.display(), ext = %ext, "Ignoring by extension");
                return TerminalOutcome::Ignored;
            }
        }

        let lease = {
            let mut leases = self.inner.leases.lock().expect("lease map lock poisoned");
            Arc::clone(leases.entry(path.clone()).or_default())
        };
        let guard = lease.clone().lock_owned().await;

        if let Some(previous) = self.coalesce(&path) {
            drop(guard);
            self.release_lease(&path, &lease);
            return previous;
        }

        let outcome = self.run_with_retry(&path).await;
        tracing::info!(
            path = %path.display(),
            outcome = outcome.label(),
            "Intake reached terminal state"
        );

        {
            let mut outcomes = self.inner.outcomes.lock().expect("outcome map lock poisoned");
            // Entries only matter inside the coalesce window; drop the rest
            // so a long-running daemon holds one entry per recent path, not
            // per path ever processed.
            let window = self.inner.config.coalesce_window;
            outcomes.retain(|_, done| done.at.elapsed() <= window);
            outcomes.insert(
                path.clone(),
                CompletedIntake {
                    outcome: outcome.clone(),
                    at: Instant::now(),
                },
            );
        }

        drop(guard);
        self.release_lease(&path, &lease);
        outcome
    }

    /// Suppress an event for a path that already reached a terminal state,
    /// either inside the coalesce window or when the source is gone (we moved
    /// or deleted it ourselves). A fresh file reappearing under the same name
    /// clears the record and processes normally.
    fn coalesce(&self, path: &Path) -> Option<TerminalOutcome> {
        let mut outcomes = self.inner.outcomes.lock().expect("outcome map lock poisoned");
        let done = outcomes.get(path)?;
        let inside_window = done.at.elapsed() <= self.inner.config.coalesce_window;
        if inside_window || !path.exists() {
            tracing::debug!(
                path = %path.display(),
                previous = done.outcome.label(),
                "Coalescing duplicate event"
            );
            return Some(TerminalOutcome::AlreadyProcessed);
        }
        outcomes.remove(path);
        None
    }

    fn release_lease(&self, path: &Path, lease: &Arc<tokio::sync::Mutex<()>>) {
        let mut leases = self.inner.leases.lock().expect("lease map lock poisoned");
        // Two strong refs mean only the map and our local clone remain.
        if Arc::strong_count(lease) <= 2 {
            leases.remove(path);
        }
    }

    async fn run_with_retry(&self, path: &Path) -> TerminalOutcome {
        let mut record = IntakeRecord::new(path, 0);
        loop {
            let error = match self.process_once(&mut record).await {
                Ok(outcome) => return outcome,
                Err(e) => e,
            };

            if error.is_transient() && record.attempt_count < self.inner.config.max_retry_attempts {
                let delay = retry_backoff(record.attempt_count);
                tracing::warn!(
                    path = %path.display(),
                    attempt = record.attempt_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                record.attempt_count += 1;
                continue;
            }

            if let Some(reason) = error.quarantine_reason() {
                return match self.inner.quarantine.isolate(path, reason.clone()).await {
                    Ok(_) => TerminalOutcome::Quarantined(reason),
                    Err(e) => {
                        tracing::error!(
                            path = %path.display(),
                            error = %e,
                            "Failed to quarantine"
                        );
                        TerminalOutcome::Failed(format!("quarantine failed: {}", e))
                    }
                };
            }

            return TerminalOutcome::Failed(error.to_string());
        }
    }

    async fn process_once(&self, record: &mut IntakeRecord) -> Result<TerminalOutcome, IntakeError> {
        let path = record.source_path.clone();
        let Some(size) = self.wait_for_stable(&path).await? else {
            tracing::debug!(path = %path.display(), "Source vanished, discarding");
            return Ok(TerminalOutcome::DiscardedStale);
        };
        record.size_bytes = size;

        let verdict = self.inner.scanner.scan(&path, size).await;
        record.verdict = verdict.clone();
        verdict_gate(verdict)?;

        if self.is_archive(&path) {
            return self.expand_archive(&path).await;
        }

        self.organize(record).await
    }

    /// Wait for the file's size to hold still across one probe interval.
    /// `None` means the source disappeared.
    async fn wait_for_stable(&self, path: &Path) -> Result<Option<u64>, IntakeError> {
        let mut last: Option<u64> = None;
        for _ in 0..STABILITY_PROBES {
            let size = match tokio::fs::metadata(path).await {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(IntakeError::io(path, e)),
            };
            if last == Some(size) {
                return Ok(Some(size));
            }
            last = Some(size);
            tokio::time::sleep(self.inner.config.stability_delay).await;
        }
        Err(IntakeError::Transient(format!(
            "{} still growing after {} probes",
            path.display(),
            STABILITY_PROBES
        )))
    }

    fn is_archive(&self, path: &Path) -> bool {
        let by_extension = extension_of(path)
            .map(|ext| self.inner.config.archive_extensions.contains(&ext))
            .unwrap_or(false);
        by_extension && ArchiveKind::detect(path).is_some()
    }

    /// Expand an archive and settle every member as its own intake. The
    /// original archive is removed once all members reached a state; an
    /// infected or unplaceable member never blocks its siblings.
    async fn expand_archive(&self, path: &Path) -> Result<TerminalOutcome, IntakeError> {
        let extractor = self.inner.extractor.clone();
        let archive = path.to_path_buf();
        let expansion = tokio::task::spawn_blocking(move || extractor.expand(&archive))
            .await
            .map_err(|e| {
                IntakeError::Internal(anyhow::anyhow!("extraction task failed: {}", e))
            })??;

        let member_count = expansion.files.len();
        for member in &expansion.files {
            match self.settle_member(member, path).await {
                Ok(outcome) => {
                    tracing::debug!(
                        member = %member.display(),
                        origin = %path.display(),
                        outcome = outcome.label(),
                        "Archive member settled"
                    );
                }
                Err(e) => {
                    if let Some(reason) = e.quarantine_reason() {
                        if let Err(qe) = self.inner.quarantine.isolate(member, reason).await {
                            tracing::error!(
                                member = %member.display(),
                                error = %qe,
                                "Failed to quarantine archive member"
                            );
                        }
                    } else {
                        tracing::warn!(
                            member = %member.display(),
                            origin = %path.display(),
                            error = %e,
                            "Archive member failed"
                        );
                    }
                }
            }
        }
        drop(expansion);

        tokio::fs::remove_file(path)
            .await
            .map_err(|e| IntakeError::io(path, e))?;
        Ok(TerminalOutcome::Expanded { member_count })
    }

    /// Scan and organize one extracted member. Members skip the readiness
    /// wait: extraction wrote them completely before this call.
    async fn settle_member(&self, member: &Path, origin: &Path) -> Result<TerminalOutcome, IntakeError> {
        let size = tokio::fs::metadata(member)
            .await
            .map_err(|e| IntakeError::io(member, e))?
            .len();
        let mut record = IntakeRecord::new(member, size).extracted_from(origin);

        let verdict = self.inner.scanner.scan(member, size).await;
        record.verdict = verdict.clone();
        verdict_gate(verdict)?;

        self.organize(&mut record).await
    }

    /// Hash, classify, dedup, place. The dedup claim uses the computed
    /// destination so the index always points at organized-tree paths.
    ///
    /// A `Duplicate` resolution deletes the candidate only after confirming
    /// the first-seen copy is still on disk; an entry pointing at a missing
    /// file is repaired instead. A claim whose placement fails is rolled
    /// back, so a retry or resubmission of the same content starts clean.
    async fn organize(&self, record: &mut IntakeRecord) -> Result<TerminalOutcome, IntakeError> {
        let path = record.source_path.clone();
        let (digest, size) = digest_file(&path).await?;
        record.content_digest = Some(digest);
        record.size_bytes = size;

        let category = self.inner.classifier.classify(&path);
        let destination = placement::destination_for(
            &self.inner.config.organized_dir,
            category,
            &path,
            &digest,
        );

        if let Resolution::Duplicate { existing } = self
            .inner
            .dedup
            .resolve(digest, size, &destination.absolute_path)
        {
            if existing.exists() {
                tracing::info!(
                    candidate = %path.display(),
                    existing = %existing.display(),
                    digest = %digest,
                    "Duplicate content, removing candidate"
                );
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| IntakeError::io(&path, e))?;
                return Ok(TerminalOutcome::DuplicateRemoved { existing });
            }
            tracing::warn!(
                digest = %digest,
                missing = %existing.display(),
                "Dedup entry points at a missing file, repairing"
            );
            self.inner
                .dedup
                .repoint(digest, size, &destination.absolute_path);
        }

        match placement::place(&path, &destination) {
            Ok(placed) => {
                tracing::info!(
                    from = %path.display(),
                    to = %placed.display(),
                    "File organized"
                );
                Ok(TerminalOutcome::Placed(placed))
            }
            Err(e) => {
                self.inner.dedup.forget(&digest, &destination.absolute_path);
                Err(e)
            }
        }
    }
}

/// Admit only an explicit clean verdict; anything else fails closed.
fn verdict_gate(verdict: ScanVerdict) -> Result<(), IntakeError> {
    match verdict {
        ScanVerdict::Clean => Ok(()),
        ScanVerdict::Infected(name) => Err(IntakeError::Infected(name)),
        ScanVerdict::ScanError(msg) => Err(IntakeError::ScanFailed(msg)),
        ScanVerdict::Pending => Err(IntakeError::ScanFailed(
            "scanner returned no verdict".to_string(),
        )),
    }
}

fn retry_backoff(attempt: u32) -> std::time::Duration {
    std::time::Duration::from_millis((100u64 << attempt.min(16)).min(MAX_BACKOFF_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dropgate_core::models::EventKind;

    async fn coordinator(root: &Path) -> Coordinator {
        Coordinator::from_config(IntakeConfig::rooted_at(root))
            .await
            .unwrap()
    }

    fn event(path: &Path) -> FileEvent {
        FileEvent::new(path, EventKind::Created)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(0).as_millis(), 100);
        assert_eq!(retry_backoff(1).as_millis(), 200);
        assert_eq!(retry_backoff(2).as_millis(), 400);
        assert_eq!(retry_backoff(10).as_millis(), 5_000);
        assert_eq!(retry_backoff(u32::MAX).as_millis(), 5_000);
    }

    #[tokio::test]
    async fn clean_file_is_placed() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path()).await;
        std::fs::create_dir_all(c.config().watch_dir.clone()).unwrap();
        let source = c.config().watch_dir.join("note.txt");
        std::fs::write(&source, b"plain note").unwrap();

        let outcome = c.submit(event(&source)).await;
        match outcome {
            TerminalOutcome::Placed(dest) => {
                assert!(dest.starts_with(&c.config().organized_dir));
                assert!(!source.exists());
                assert_eq!(std::fs::read(&dest).unwrap(), b"plain note");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn ignored_extension_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path()).await;
        let outcome = c
            .submit(event(Path::new("/watch/download.part")))
            .await;
        assert_eq!(outcome, TerminalOutcome::Ignored);
    }

    #[tokio::test]
    async fn missing_source_is_discarded_stale() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path()).await;
        let outcome = c
            .submit(event(&c.config().watch_dir.join("never-existed.pdf")))
            .await;
        assert_eq!(outcome, TerminalOutcome::DiscardedStale);
    }

    #[tokio::test]
    async fn resubmission_after_terminal_outcome_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path()).await;
        std::fs::create_dir_all(c.config().watch_dir.clone()).unwrap();
        let source = c.config().watch_dir.join("once.txt");
        std::fs::write(&source, b"only once").unwrap();

        let first = c.submit(event(&source)).await;
        assert!(matches!(first, TerminalOutcome::Placed(_)));

        let second = c.submit(event(&source)).await;
        assert_eq!(second, TerminalOutcome::AlreadyProcessed);
    }

    #[tokio::test]
    async fn duplicate_content_keeps_one_copy() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path()).await;
        std::fs::create_dir_all(c.config().watch_dir.clone()).unwrap();

        let a = c.config().watch_dir.join("a.txt");
        let b = c.config().watch_dir.join("b.txt");
        std::fs::write(&a, b"same payload").unwrap();
        std::fs::write(&b, b"same payload").unwrap();

        let first = c.submit(event(&a)).await;
        let TerminalOutcome::Placed(kept) = first else {
            panic!("unexpected outcome {:?}", first);
        };
        let second = c.submit(event(&b)).await;
        assert_eq!(
            second,
            TerminalOutcome::DuplicateRemoved {
                existing: kept.clone()
            }
        );
        assert!(kept.exists());
        assert!(!b.exists());
    }

    #[tokio::test]
    async fn eicar_file_is_quarantined_as_virus() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path()).await;
        std::fs::create_dir_all(c.config().watch_dir.clone()).unwrap();
        let source = c.config().watch_dir.join("eicar.com");
        std::fs::write(
            &source,
            br#"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*"#,
        )
        .unwrap();

        let outcome = c.submit(event(&source)).await;
        match outcome {
            TerminalOutcome::Quarantined(reason) => {
                assert_eq!(reason.label(), "virus");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!source.exists());
        let quarantined: Vec<_> = std::fs::read_dir(&c.config().quarantine_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[tokio::test]
    async fn outcome_records_expire_with_the_coalesce_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = IntakeConfig::rooted_at(dir.path());
        config.coalesce_window = std::time::Duration::ZERO;
        std::fs::create_dir_all(&config.watch_dir).unwrap();
        let c = Coordinator::from_config(config).await.unwrap();

        for i in 0..5 {
            let source = c.config().watch_dir.join(format!("f{}.txt", i));
            std::fs::write(&source, format!("body {}", i)).unwrap();
            let outcome = c.submit(event(&source)).await;
            assert!(matches!(outcome, TerminalOutcome::Placed(_)));
        }

        // A zero-width window expires every earlier record by the time the
        // next intake completes; only the newest entry may remain.
        let retained = c.inner.outcomes.lock().unwrap().len();
        assert!(retained <= 1, "retained {} outcome records", retained);
    }
}
