//! Scripted fakes for the surface, the authenticator and post-processing.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{AuthError, SurfaceError};
use crate::postprocess::{PostProcessSummary, PostProcessor};
use crate::session::Authenticator;
use crate::state_machine::ItemKey;
use crate::surface::{RemoteSurface, Row, SurfaceSignals, TerminalSignal};

/// How the fake portal answers once an item is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemBehavior {
    Artifact,
    ArtifactNeverArrives,
    NoObligation,
    Silent,
    BreaksAfterSubmit,
}

/// In-memory portal: a list of rendered identifiers plus scripted answers.
pub struct FakePortal {
    dir: PathBuf,
    rows: Vec<String>,
    behaviors: HashMap<ItemKey, ItemBehavior>,
    health: VecDeque<Result<SurfaceSignals, SurfaceError>>,
    select_failures: VecDeque<SurfaceError>,
    selected: Option<ItemKey>,
    submitted: Option<ItemKey>,
    downloads: u32,
    selections: u32,
    dismissals: u32,
    refreshes: u32,
    returns: u32,
    submissions: Vec<ItemKey>,
}

impl FakePortal {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            rows: Vec::new(),
            behaviors: HashMap::new(),
            health: VecDeque::new(),
            select_failures: VecDeque::new(),
            selected: None,
            submitted: None,
            downloads: 0,
            selections: 0,
            dismissals: 0,
            refreshes: 0,
            returns: 0,
            submissions: Vec::new(),
        }
    }

    pub fn render<I, T>(&mut self, identifiers: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.rows = identifiers.into_iter().map(Into::into).collect();
    }

    /// Unlisted keys behave as [`ItemBehavior::Artifact`].
    pub fn behave(&mut self, key: &str, behavior: ItemBehavior) {
        if let Some(key) = ItemKey::parse(key) {
            self.behaviors.insert(key, behavior);
        }
    }

    /// Observations returned by the next `observe` calls; healthy afterwards.
    pub fn script_health(
        &mut self,
        observations: impl IntoIterator<Item = Result<SurfaceSignals, SurfaceError>>,
    ) {
        self.health.extend(observations);
    }

    pub fn fail_next_select(&mut self, error: SurfaceError) {
        self.select_failures.push_back(error);
    }

    pub fn selections(&self) -> u32 {
        self.selections
    }

    pub fn dismissals(&self) -> u32 {
        self.dismissals
    }

    pub fn refreshes(&self) -> u32 {
        self.refreshes
    }

    pub fn returns_to_list(&self) -> u32 {
        self.returns
    }

    /// Keys submitted so far, in order.
    pub fn submissions(&self) -> &[ItemKey] {
        &self.submissions
    }

    fn behavior(&self, key: &ItemKey) -> ItemBehavior {
        self.behaviors
            .get(key)
            .copied()
            .unwrap_or(ItemBehavior::Artifact)
    }
}

impl RemoteSurface for FakePortal {
    async fn visible_rows(&mut self) -> Result<Vec<Row>, SurfaceError> {
        Ok(self
            .rows
            .iter()
            .enumerate()
            .map(|(index, identifier)| Row {
                index,
                identifier: identifier.clone(),
            })
            .collect())
    }

    async fn select_row(&mut self, row: &Row) -> Result<(), SurfaceError> {
        self.selections += 1;
        if let Some(error) = self.select_failures.pop_front() {
            return Err(error);
        }
        if self.rows.get(row.index) != Some(&row.identifier) {
            return Err(SurfaceError::StaleHandle(format!("row {}", row.index)));
        }
        self.selected = row.key();
        Ok(())
    }

    async fn submit(&mut self) -> Result<(), SurfaceError> {
        let key = self
            .selected
            .take()
            .ok_or_else(|| SurfaceError::ElementMissing("selected row".into()))?;
        self.submissions.push(key.clone());
        self.submitted = Some(key);
        Ok(())
    }

    async fn detect_terminal_signal(
        &mut self,
        _timeout: Duration,
    ) -> Result<TerminalSignal, SurfaceError> {
        let key = self
            .submitted
            .clone()
            .ok_or_else(|| SurfaceError::ElementMissing("item detail".into()))?;
        match self.behavior(&key) {
            ItemBehavior::Artifact | ItemBehavior::ArtifactNeverArrives => {
                Ok(TerminalSignal::ArtifactAvailable)
            }
            ItemBehavior::NoObligation => Ok(TerminalSignal::NoObligation),
            ItemBehavior::Silent => Ok(TerminalSignal::NoSignal),
            ItemBehavior::BreaksAfterSubmit => Err(SurfaceError::Driver("page crashed".into())),
        }
    }

    async fn trigger_retrieval(&mut self) -> Result<(), SurfaceError> {
        let key = self
            .submitted
            .clone()
            .ok_or_else(|| SurfaceError::ElementMissing("download button".into()))?;
        self.downloads += 1;
        let name = match self.behavior(&key) {
            ItemBehavior::ArtifactNeverArrives => format!("{key}_{}.pdf.crdownload", self.downloads),
            _ => format!("{key}_{}.pdf", self.downloads),
        };
        std::fs::write(self.dir.join(name), b"%PDF-1.4 fake document")
            .map_err(|e| SurfaceError::Driver(e.to_string()))
    }

    async fn return_to_list(&mut self) -> Result<(), SurfaceError> {
        self.returns += 1;
        self.submitted = None;
        self.selected = None;
        Ok(())
    }

    async fn observe(&mut self) -> Result<SurfaceSignals, SurfaceError> {
        self.health
            .pop_front()
            .unwrap_or_else(|| Ok(SurfaceSignals::healthy()))
    }

    async fn dismiss_overlay(&mut self) -> Result<bool, SurfaceError> {
        self.dismissals += 1;
        Ok(true)
    }

    async fn refresh(&mut self) -> Result<(), SurfaceError> {
        self.refreshes += 1;
        Ok(())
    }

    async fn current_url(&mut self) -> Result<String, SurfaceError> {
        Ok("https://portal.test/list".into())
    }
}

#[derive(Default)]
struct FakeAuthState {
    script: Mutex<VecDeque<Result<(), AuthError>>>,
    sign_ins: AtomicU32,
    sign_outs: AtomicU32,
    fail_sign_out: AtomicBool,
}

/// Authenticator answering from a script; succeeds once the script runs out.
/// Clones share state.
#[derive(Clone, Default)]
pub struct FakeAuth {
    state: Arc<FakeAuthState>,
}

impl FakeAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(results: impl IntoIterator<Item = Result<(), AuthError>>) -> Self {
        let auth = Self::default();
        auth.push(results);
        auth
    }

    pub fn push(&self, results: impl IntoIterator<Item = Result<(), AuthError>>) {
        self.state.script.lock().unwrap().extend(results);
    }

    pub fn fail_sign_out(&self, fail: bool) {
        self.state.fail_sign_out.store(fail, Ordering::SeqCst);
    }

    pub fn sign_ins(&self) -> u32 {
        self.state.sign_ins.load(Ordering::SeqCst)
    }

    pub fn sign_outs(&self) -> u32 {
        self.state.sign_outs.load(Ordering::SeqCst)
    }
}

impl<S> Authenticator<S> for FakeAuth {
    async fn sign_in(&mut self, _surface: &mut S) -> Result<(), AuthError> {
        self.state.sign_ins.fetch_add(1, Ordering::SeqCst);
        self.state
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn sign_out(&mut self, _surface: &mut S) -> Result<(), AuthError> {
        self.state.sign_outs.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_sign_out.load(Ordering::SeqCst) {
            Err(AuthError::Timeout)
        } else {
            Ok(())
        }
    }
}

/// Post-processor that counts invocations and can be told to fail.
#[derive(Clone, Default)]
pub struct FakePostProcessor {
    calls: Arc<AtomicU32>,
    failing: Arc<AtomicBool>,
}

impl FakePostProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let fake = Self::default();
        fake.failing.store(true, Ordering::SeqCst);
        fake
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PostProcessor for FakePostProcessor {
    async fn process(&mut self, _dir: &Path) -> anyhow::Result<PostProcessSummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("summarizer offline");
        }
        Ok(PostProcessSummary::default())
    }
}
