use std::time::Duration;

use tracing::{debug, info, warn};

use crate::artifact::ArtifactWatcher;
use crate::error::SurfaceError;
use crate::state_machine::{AttemptFailure, AttemptOutcome, ItemKey, PendingSet};
use crate::surface::{RemoteSurface, Row, TerminalSignal};

/// Result of one scan pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// No rendered row matched a pending key.
    NoMatch,
    /// One item was submitted; it is still in flight in the pending set.
    Attempted { key: ItemKey, outcome: AttemptOutcome },
    /// The surface failed before anything was submitted.
    Interrupted(SurfaceError),
}

/// Failure before the item reached the remote system; nothing to record.
struct BeforeSubmit(SurfaceError);

/// Enumerates rows, matches them against pending keys and drives a single
/// item through the retrieval sequence.
pub struct WorkQueueScanner {
    signal_timeout: Duration,
    rescan_attempts: u32,
}

impl WorkQueueScanner {
    pub fn new(signal_timeout: Duration, rescan_attempts: u32) -> Self {
        Self {
            signal_timeout,
            rescan_attempts,
        }
    }

    /// Attempts at most one pending item.
    ///
    /// Transient errors before submission release the item and re-scan, up
    /// to `rescan_attempts` times. Errors after submission become a failed
    /// outcome. The list view is restored either way.
    pub async fn scan_and_attempt_one<S: RemoteSurface>(
        &self,
        surface: &mut S,
        pending: &mut PendingSet,
        watcher: &ArtifactWatcher,
    ) -> ScanOutcome {
        let mut rescans = 0;
        loop {
            let rows = match surface.visible_rows().await {
                Ok(rows) => rows,
                Err(e) if e.is_transient() && rescans < self.rescan_attempts => {
                    debug!(error = %e, "row enumeration failed, re-scanning");
                    rescans += 1;
                    continue;
                }
                Err(e) => return ScanOutcome::Interrupted(e),
            };

            let Some((row, key)) = first_pending(&rows, pending) else {
                debug!(rows = rows.len(), pending = pending.len(), "no pending item rendered");
                return ScanOutcome::NoMatch;
            };

            pending.begin(&key);
            info!(key = %key, row = row.index, "attempting item");
            match self.attempt(surface, &row, watcher).await {
                Ok(outcome) => return ScanOutcome::Attempted { key, outcome },
                Err(BeforeSubmit(e)) => {
                    pending.release(&key);
                    self.restore_list(surface).await;
                    if e.is_transient() && rescans < self.rescan_attempts {
                        warn!(key = %key, error = %e, "transient error before submit, re-scanning");
                        rescans += 1;
                        continue;
                    }
                    return ScanOutcome::Interrupted(e);
                }
            }
        }
    }

    async fn attempt<S: RemoteSurface>(
        &self,
        surface: &mut S,
        row: &Row,
        watcher: &ArtifactWatcher,
    ) -> Result<AttemptOutcome, BeforeSubmit> {
        surface.select_row(row).await.map_err(BeforeSubmit)?;
        surface.submit().await.map_err(BeforeSubmit)?;

        let outcome = match self.retrieve(surface, watcher).await {
            Ok(outcome) => outcome,
            Err(e) => AttemptOutcome::Failed(AttemptFailure::Surface(e.to_string())),
        };
        self.restore_list(surface).await;
        Ok(outcome)
    }

    async fn retrieve<S: RemoteSurface>(
        &self,
        surface: &mut S,
        watcher: &ArtifactWatcher,
    ) -> Result<AttemptOutcome, SurfaceError> {
        match surface.detect_terminal_signal(self.signal_timeout).await? {
            TerminalSignal::NoObligation => Ok(AttemptOutcome::NoObligation),
            TerminalSignal::NoSignal => Ok(AttemptOutcome::NoArtifact),
            TerminalSignal::ArtifactAvailable => {
                let before = match watcher.snapshot() {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        return Ok(AttemptOutcome::Failed(AttemptFailure::Unexpected(format!(
                            "cannot list {}: {e}",
                            watcher.dir().display()
                        ))));
                    }
                };
                surface.trigger_retrieval().await?;
                Ok(match watcher.wait_for_new(&before).await {
                    Some(artifact) => AttemptOutcome::Succeeded { artifact },
                    None => AttemptOutcome::Failed(AttemptFailure::ArtifactTimeout {
                        after_ms: watcher.timeout().as_millis() as u64,
                    }),
                })
            }
        }
    }

    async fn restore_list<S: RemoteSurface>(&self, surface: &mut S) {
        if let Err(e) = surface.return_to_list().await {
            warn!(error = %e, "could not return to the list view");
        }
    }
}

fn first_pending(rows: &[Row], pending: &PendingSet) -> Option<(Row, ItemKey)> {
    rows.iter().find_map(|row| {
        row.key()
            .filter(|key| pending.is_pending(key))
            .map(|key| (row.clone(), key))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArtifactConfig;
    use crate::state_machine::ItemState;
    use crate::testing::{FakePortal, ItemBehavior};
    use tempfile::TempDir;

    fn setup() -> (TempDir, ArtifactWatcher, WorkQueueScanner) {
        let dir = TempDir::new().unwrap();
        let config = ArtifactConfig {
            timeout_secs: 5,
            ..ArtifactConfig::default()
        };
        let watcher = ArtifactWatcher::new(dir.path(), &config);
        (dir, watcher, WorkQueueScanner::new(Duration::from_secs(3), 2))
    }

    fn key(raw: &str) -> ItemKey {
        ItemKey::parse(raw).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn retrieves_artifact_for_first_pending_row() {
        let (dir, watcher, scanner) = setup();
        let mut portal = FakePortal::new(dir.path());
        portal.render(["000.111-1", "4.56-0"]);
        portal.behave("4560", ItemBehavior::Artifact);
        let mut pending = PendingSet::new(vec![key("4560")]);

        let outcome = scanner
            .scan_and_attempt_one(&mut portal, &mut pending, &watcher)
            .await;

        let ScanOutcome::Attempted { key: k, outcome } = outcome else {
            panic!("expected an attempt");
        };
        assert_eq!(k, key("4560"));
        assert!(matches!(outcome, AttemptOutcome::Succeeded { artifact } if artifact.starts_with(dir.path())));
        assert_eq!(pending.get(&k).map(|i| i.state), Some(ItemState::InFlight));
        assert_eq!(portal.returns_to_list(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unrendered_key_is_no_match() {
        let (dir, watcher, scanner) = setup();
        let mut portal = FakePortal::new(dir.path());
        portal.render(["111"]);
        let mut pending = PendingSet::new(vec![key("999")]);

        let outcome = scanner
            .scan_and_attempt_one(&mut portal, &mut pending, &watcher)
            .await;
        assert_eq!(outcome, ScanOutcome::NoMatch);
        assert!(pending.is_pending(&key("999")));
    }

    #[tokio::test(start_paused = true)]
    async fn no_obligation_and_silent_outcomes() {
        let (dir, watcher, scanner) = setup();
        let mut portal = FakePortal::new(dir.path());
        portal.render(["1", "2"]);
        portal.behave("1", ItemBehavior::NoObligation);
        portal.behave("2", ItemBehavior::Silent);

        let mut pending = PendingSet::new(vec![key("1")]);
        let outcome = scanner
            .scan_and_attempt_one(&mut portal, &mut pending, &watcher)
            .await;
        assert_eq!(
            outcome,
            ScanOutcome::Attempted {
                key: key("1"),
                outcome: AttemptOutcome::NoObligation
            }
        );

        let mut pending = PendingSet::new(vec![key("2")]);
        let outcome = scanner
            .scan_and_attempt_one(&mut portal, &mut pending, &watcher)
            .await;
        assert_eq!(
            outcome,
            ScanOutcome::Attempted {
                key: key("2"),
                outcome: AttemptOutcome::NoArtifact
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_download_times_out_as_failure() {
        let (dir, watcher, scanner) = setup();
        let mut portal = FakePortal::new(dir.path());
        portal.render(["789"]);
        portal.behave("789", ItemBehavior::ArtifactNeverArrives);
        let mut pending = PendingSet::new(vec![key("789")]);

        let outcome = scanner
            .scan_and_attempt_one(&mut portal, &mut pending, &watcher)
            .await;
        assert_eq!(
            outcome,
            ScanOutcome::Attempted {
                key: key("789"),
                outcome: AttemptOutcome::Failed(AttemptFailure::ArtifactTimeout { after_ms: 5000 })
            }
        );
        assert_eq!(portal.returns_to_list(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_handle_before_submit_rescans_same_pass() {
        let (dir, watcher, scanner) = setup();
        let mut portal = FakePortal::new(dir.path());
        portal.render(["456"]);
        portal.behave("456", ItemBehavior::NoObligation);
        portal.fail_next_select(SurfaceError::StaleHandle("row 0".into()));
        let mut pending = PendingSet::new(vec![key("456")]);

        let outcome = scanner
            .scan_and_attempt_one(&mut portal, &mut pending, &watcher)
            .await;
        assert_eq!(
            outcome,
            ScanOutcome::Attempted {
                key: key("456"),
                outcome: AttemptOutcome::NoObligation
            }
        );
        assert_eq!(portal.selections(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_transient_errors_interrupt_without_attempt() {
        let (dir, watcher, scanner) = setup();
        let mut portal = FakePortal::new(dir.path());
        portal.render(["456"]);
        for _ in 0..3 {
            portal.fail_next_select(SurfaceError::Timeout {
                what: "radio".into(),
                after_ms: 3000,
            });
        }
        let mut pending = PendingSet::new(vec![key("456")]);

        let outcome = scanner
            .scan_and_attempt_one(&mut portal, &mut pending, &watcher)
            .await;
        assert!(matches!(outcome, ScanOutcome::Interrupted(SurfaceError::Timeout { .. })));
        assert!(pending.is_pending(&key("456")));
        assert_eq!(pending.get(&key("456")).map(|i| i.attempts), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn error_after_submit_is_item_failure() {
        let (dir, watcher, scanner) = setup();
        let mut portal = FakePortal::new(dir.path());
        portal.render(["321"]);
        portal.behave("321", ItemBehavior::BreaksAfterSubmit);
        let mut pending = PendingSet::new(vec![key("321")]);

        let outcome = scanner
            .scan_and_attempt_one(&mut portal, &mut pending, &watcher)
            .await;
        assert!(matches!(
            outcome,
            ScanOutcome::Attempted {
                outcome: AttemptOutcome::Failed(AttemptFailure::Surface(_)),
                ..
            }
        ));
        assert_eq!(portal.returns_to_list(), 1);
    }
}
