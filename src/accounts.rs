use std::collections::BTreeSet;
use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::Deserialize;
use tracing::warn;

use crate::orchestrator::WorkRequest;
use crate::state_machine::ItemKey;

/// One credential set and the items it is responsible for.
#[derive(Clone, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    pub login: String,
    pub password: String,
    #[serde(default)]
    pub inbox: InboxCredentials,
    #[serde(default)]
    pub items: Vec<ScheduledItem>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("name", &self.name)
            .field("login", &self.login)
            .field("password", &"***")
            .field("inbox", &self.inbox)
            .field("items", &self.items.len())
            .field("active", &self.active)
            .finish()
    }
}

/// Webmail credentials used to read the one-time sign-in token.
#[derive(Clone, Default, Deserialize)]
pub struct InboxCredentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for InboxCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboxCredentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduledItem {
    pub key: String,
    /// Day of month from which the item is due. Always due when absent.
    #[serde(default)]
    pub due_day: Option<u32>,
}

impl ScheduledItem {
    pub fn is_due(&self, today: NaiveDate) -> bool {
        self.due_day.is_none_or(|day| day <= today.day())
    }
}

impl AccountConfig {
    /// Items due on `today`, de-duplicated by normalized key.
    pub fn work_request(&self, today: NaiveDate) -> WorkRequest {
        let due = self
            .items
            .iter()
            .filter(|item| item.is_due(today))
            .map(|item| item.key.as_str());
        WorkRequest::new(&self.name, normalize_keys(due))
    }
}

/// Normalizes raw identifiers, dropping (and logging) those without digits.
pub fn normalize_keys<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<ItemKey> {
    let mut seen = BTreeSet::new();
    let mut keys = Vec::new();
    for raw in raw {
        match ItemKey::parse(raw) {
            Some(key) => {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
            None => warn!(raw, "ignoring identifier without digits"),
        }
    }
    keys
}
