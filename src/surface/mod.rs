//! The remote interactive surface the orchestrator drives.
//!
//! Every primitive is bounded by a timeout, either configured on the
//! implementation or passed by the caller.

mod chromium;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SurfaceError;
use crate::state_machine::ItemKey;

pub use chromium::{ChromiumSurface, PageDriver};

/// A rendered list row, read during one enumeration.
///
/// Valid for exactly one attempt: implementations re-query the list on
/// `select_row` and fail with [`SurfaceError::StaleHandle`] when the row at
/// `index` no longer carries `identifier`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub index: usize,
    pub identifier: String,
}

impl Row {
    pub fn key(&self) -> Option<ItemKey> {
        ItemKey::parse(&self.identifier)
    }
}

/// What the surface showed after an item was submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalSignal {
    /// Nothing outstanding for the item.
    NoObligation,
    /// A retrieval affordance is present.
    ArtifactAvailable,
    /// Neither appeared before the timeout.
    NoSignal,
}

/// Raw observations the health classifier works from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceSignals {
    /// Text of a visible overlay or alert, if any.
    pub overlay_text: Option<String>,
    /// Whether the elements needed to work the list are present and visible.
    pub essentials_visible: bool,
    /// Whether busy or loading indicators are visible.
    pub busy: bool,
}

impl SurfaceSignals {
    pub fn healthy() -> Self {
        Self {
            overlay_text: None,
            essentials_visible: true,
            busy: false,
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait RemoteSurface {
    async fn visible_rows(&mut self) -> Result<Vec<Row>, SurfaceError>;

    async fn select_row(&mut self, row: &Row) -> Result<(), SurfaceError>;

    async fn submit(&mut self) -> Result<(), SurfaceError>;

    async fn detect_terminal_signal(
        &mut self,
        timeout: Duration,
    ) -> Result<TerminalSignal, SurfaceError>;

    async fn trigger_retrieval(&mut self) -> Result<(), SurfaceError>;

    /// Navigates back to the list view. A no-op when already there.
    async fn return_to_list(&mut self) -> Result<(), SurfaceError>;

    async fn observe(&mut self) -> Result<SurfaceSignals, SurfaceError>;

    /// Closes a visible overlay. Returns false when nothing could be closed.
    async fn dismiss_overlay(&mut self) -> Result<bool, SurfaceError>;

    async fn refresh(&mut self) -> Result<(), SurfaceError>;

    async fn current_url(&mut self) -> Result<String, SurfaceError>;
}
