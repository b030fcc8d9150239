use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized work-item identifier: the digits of the raw identifier, in order.
///
/// Portal rows render identifiers with separators and padding
/// (`"12.345-6 "`), work requests carry them bare (`"123456"`); both
/// normalize to the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKey(String);

impl ItemKey {
    /// Returns `None` when the raw text carries no digits at all.
    pub fn parse(raw: &str) -> Option<Self> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            None
        } else {
            Some(Self(digits))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a work item within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    InFlight,
    Succeeded,
    SkippedNoData,
    SkippedNoArtifact,
    Failed,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ItemState::Pending | ItemState::InFlight)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Pending => write!(f, "PENDING"),
            ItemState::InFlight => write!(f, "IN_FLIGHT"),
            ItemState::Succeeded => write!(f, "SUCCEEDED"),
            ItemState::SkippedNoData => write!(f, "SKIPPED_NO_DATA"),
            ItemState::SkippedNoArtifact => write!(f, "SKIPPED_NO_ARTIFACT"),
            ItemState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Why a single-item attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptFailure {
    /// Retrieval was triggered but no complete artifact appeared in time.
    ArtifactTimeout { after_ms: u64 },
    /// A surface primitive failed after the item was submitted.
    Surface(String),
    /// Anything else raised while the item was in flight.
    Unexpected(String),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::ArtifactTimeout { after_ms } => {
                write!(f, "artifact not completed within {after_ms}ms")
            }
            AttemptFailure::Surface(msg) => write!(f, "surface failure: {msg}"),
            AttemptFailure::Unexpected(msg) => write!(f, "unexpected failure: {msg}"),
        }
    }
}

/// Result of one concrete acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Succeeded { artifact: PathBuf },
    /// The portal reports nothing outstanding for this item.
    NoObligation,
    /// Neither a "nothing outstanding" marker nor a retrievable artifact showed up.
    NoArtifact,
    Failed(AttemptFailure),
}

impl AttemptOutcome {
    /// Whether the attempt satisfies the item for ledger purposes.
    pub fn satisfies(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::Succeeded { .. } | AttemptOutcome::NoObligation
        )
    }

    /// Error text persisted alongside an unsuccessful attempt.
    pub fn error(&self) -> Option<String> {
        match self {
            AttemptOutcome::Succeeded { .. } | AttemptOutcome::NoObligation => None,
            AttemptOutcome::NoArtifact => Some("no retrievable artifact offered".to_string()),
            AttemptOutcome::Failed(failure) => Some(failure.to_string()),
        }
    }

    /// Short label stored in the ledger's `outcome` column.
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded { .. } => "succeeded",
            AttemptOutcome::NoObligation => "no_data",
            AttemptOutcome::NoArtifact => "no_artifact",
            AttemptOutcome::Failed(_) => "failed",
        }
    }

    fn terminal_state(&self) -> ItemState {
        match self {
            AttemptOutcome::Succeeded { .. } => ItemState::Succeeded,
            AttemptOutcome::NoObligation => ItemState::SkippedNoData,
            AttemptOutcome::NoArtifact => ItemState::SkippedNoArtifact,
            AttemptOutcome::Failed(_) => ItemState::Failed,
        }
    }
}

/// What settling an attempt did to the item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemTransition {
    /// The item reached a terminal state and leaves the pending set.
    Finished(ItemState),
    /// The attempt failed but the per-item budget allows another one.
    Requeued { attempts: u32 },
}

/// Configuration for bounded retries with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 5000,
        }
    }
}

impl RetryConfig {
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// One logical unit of retrieval work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub key: ItemKey,
    pub state: ItemState,
    /// Concrete attempts made during this run.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(key: ItemKey) -> Self {
        Self {
            key,
            state: ItemState::Pending,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Pending → InFlight. Returns false when the item is not pending.
    pub fn begin(&mut self) -> bool {
        if self.state != ItemState::Pending {
            return false;
        }
        self.state = ItemState::InFlight;
        self.updated_at = Utc::now();
        true
    }

    /// Applies an attempt outcome to an in-flight item.
    ///
    /// Failures go back to `Pending` while `attempts < max_attempts`; every
    /// other outcome is terminal.
    pub fn settle(&mut self, outcome: &AttemptOutcome, max_attempts: u32) -> ItemTransition {
        self.attempts += 1;
        self.last_error = outcome.error();
        self.updated_at = Utc::now();

        if matches!(outcome, AttemptOutcome::Failed(_)) && self.attempts < max_attempts {
            self.state = ItemState::Pending;
            return ItemTransition::Requeued {
                attempts: self.attempts,
            };
        }

        self.state = outcome.terminal_state();
        ItemTransition::Finished(self.state)
    }

    /// InFlight → Pending without counting an attempt (the item was never submitted).
    pub fn release(&mut self) {
        if self.state == ItemState::InFlight {
            self.state = ItemState::Pending;
            self.updated_at = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> ItemKey {
        ItemKey::parse(raw).unwrap()
    }

    #[test]
    fn key_normalization_keeps_digits_only() {
        assert_eq!(key(" 12.345-6 ").as_str(), "123456");
        assert_eq!(key("Matr. 0042"), key("0042"));
        assert!(ItemKey::parse("  ").is_none());
        assert!(ItemKey::parse("abc").is_none());
    }

    #[test]
    fn item_creation_defaults() {
        let item = WorkItem::new(key("456"));
        assert_eq!(item.state, ItemState::Pending);
        assert_eq!(item.attempts, 0);
        assert!(item.last_error.is_none());
    }

    #[test]
    fn begin_only_from_pending() {
        let mut item = WorkItem::new(key("456"));
        assert!(item.begin());
        assert_eq!(item.state, ItemState::InFlight);
        assert!(!item.begin());
    }

    #[test]
    fn success_is_terminal() {
        let mut item = WorkItem::new(key("456"));
        item.begin();
        let t = item.settle(
            &AttemptOutcome::Succeeded {
                artifact: PathBuf::from("/tmp/456.pdf"),
            },
            1,
        );
        assert_eq!(t, ItemTransition::Finished(ItemState::Succeeded));
        assert_eq!(item.attempts, 1);
        assert!(item.state.is_terminal());
    }

    #[test]
    fn failure_requeues_within_budget_then_finishes() {
        let mut item = WorkItem::new(key("789"));
        let failure = AttemptOutcome::Failed(AttemptFailure::ArtifactTimeout { after_ms: 30000 });

        item.begin();
        assert_eq!(
            item.settle(&failure, 2),
            ItemTransition::Requeued { attempts: 1 }
        );
        assert_eq!(item.state, ItemState::Pending);

        item.begin();
        assert_eq!(
            item.settle(&failure, 2),
            ItemTransition::Finished(ItemState::Failed)
        );
        assert_eq!(
            item.last_error.as_deref(),
            Some("artifact not completed within 30000ms")
        );
    }

    #[test]
    fn single_attempt_budget_drops_immediately() {
        let mut item = WorkItem::new(key("789"));
        item.begin();
        let t = item.settle(
            &AttemptOutcome::Failed(AttemptFailure::Unexpected("boom".into())),
            1,
        );
        assert_eq!(t, ItemTransition::Finished(ItemState::Failed));
    }

    #[test]
    fn skipped_outcomes_map_to_their_states() {
        let mut item = WorkItem::new(key("1"));
        item.begin();
        assert_eq!(
            item.settle(&AttemptOutcome::NoObligation, 3),
            ItemTransition::Finished(ItemState::SkippedNoData)
        );

        let mut item = WorkItem::new(key("2"));
        item.begin();
        assert_eq!(
            item.settle(&AttemptOutcome::NoArtifact, 3),
            ItemTransition::Finished(ItemState::SkippedNoArtifact)
        );
    }

    #[test]
    fn outcome_ledger_fields() {
        assert!(AttemptOutcome::NoObligation.satisfies());
        assert!(!AttemptOutcome::NoArtifact.satisfies());
        assert_eq!(AttemptOutcome::NoObligation.error(), None);
        assert_eq!(AttemptOutcome::NoArtifact.label(), "no_artifact");
    }

    #[test]
    fn release_returns_in_flight_to_pending() {
        let mut item = WorkItem::new(key("9"));
        item.begin();
        item.release();
        assert_eq!(item.state, ItemState::Pending);
        assert_eq!(item.attempts, 0);
    }

    #[test]
    fn retry_config_exponential_backoff() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 1000,
        };
        assert_eq!(config.delay_for_attempt(1), 1000);
        assert_eq!(config.delay_for_attempt(2), 2000);
        assert_eq!(config.delay_for_attempt(3), 4000);
    }

    #[test]
    fn item_serialization_uses_snake_case_state() {
        let item = WorkItem::new(key("456"));
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains(r#""key":"456""#));
        assert!(json.contains(r#""state":"pending""#));
    }
}
