use std::collections::BTreeMap;

use super::item::{AttemptOutcome, ItemKey, ItemState, ItemTransition, WorkItem};

/// Work items of one run that have not reached a terminal state yet.
///
/// Items live in a single map keyed by normalized key, so a key is never
/// both Pending and InFlight. Terminal items move to `finished`.
#[derive(Debug, Clone, Default)]
pub struct PendingSet {
    items: BTreeMap<ItemKey, WorkItem>,
    finished: Vec<WorkItem>,
}

impl PendingSet {
    pub fn new(keys: impl IntoIterator<Item = ItemKey>) -> Self {
        let items = keys
            .into_iter()
            .map(|key| (key.clone(), WorkItem::new(key)))
            .collect();
        Self {
            items,
            finished: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when `key` is waiting for an attempt.
    pub fn is_pending(&self, key: &ItemKey) -> bool {
        self.items
            .get(key)
            .is_some_and(|item| item.state == ItemState::Pending)
    }

    pub fn get(&self, key: &ItemKey) -> Option<&WorkItem> {
        self.items.get(key)
    }

    /// Marks `key` in flight. Returns false for unknown or non-pending keys.
    pub fn begin(&mut self, key: &ItemKey) -> bool {
        self.items.get_mut(key).is_some_and(WorkItem::begin)
    }

    /// Returns an in-flight item to pending without counting an attempt.
    pub fn release(&mut self, key: &ItemKey) {
        if let Some(item) = self.items.get_mut(key) {
            item.release();
        }
    }

    /// Applies an attempt outcome; terminal items leave the set.
    pub fn settle(
        &mut self,
        key: &ItemKey,
        outcome: &AttemptOutcome,
        max_attempts: u32,
    ) -> Option<ItemTransition> {
        let item = self.items.get_mut(key)?;
        if item.state != ItemState::InFlight {
            return None;
        }
        let transition = item.settle(outcome, max_attempts);
        if let ItemTransition::Finished(_) = transition {
            if let Some(done) = self.items.remove(key) {
                self.finished.push(done);
            }
        }
        Some(transition)
    }

    pub fn finished(&self) -> &[WorkItem] {
        &self.finished
    }

    pub fn remaining(&self) -> Vec<WorkItem> {
        self.items.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::item::AttemptFailure;
    use std::path::PathBuf;

    fn keys(raw: &[&str]) -> Vec<ItemKey> {
        raw.iter().filter_map(|r| ItemKey::parse(r)).collect()
    }

    #[test]
    fn duplicate_keys_collapse() {
        let set = PendingSet::new(keys(&["123", "1-2-3", "456"]));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn success_moves_item_to_finished() {
        let k = ItemKey::parse("456").unwrap();
        let mut set = PendingSet::new(vec![k.clone()]);

        assert!(set.begin(&k));
        assert!(!set.is_pending(&k));
        let t = set.settle(
            &k,
            &AttemptOutcome::Succeeded {
                artifact: PathBuf::from("456.pdf"),
            },
            1,
        );
        assert_eq!(t, Some(ItemTransition::Finished(ItemState::Succeeded)));
        assert!(set.is_empty());
        assert_eq!(set.finished().len(), 1);
        assert_eq!(set.finished()[0].key, k);
    }

    #[test]
    fn requeued_item_stays_pending() {
        let k = ItemKey::parse("789").unwrap();
        let mut set = PendingSet::new(vec![k.clone()]);
        set.begin(&k);
        let t = set.settle(
            &k,
            &AttemptOutcome::Failed(AttemptFailure::Surface("detached".into())),
            3,
        );
        assert_eq!(t, Some(ItemTransition::Requeued { attempts: 1 }));
        assert!(set.is_pending(&k));
        assert!(set.finished().is_empty());
    }

    #[test]
    fn settle_requires_in_flight() {
        let k = ItemKey::parse("789").unwrap();
        let mut set = PendingSet::new(vec![k.clone()]);
        assert_eq!(set.settle(&k, &AttemptOutcome::NoObligation, 1), None);
        assert!(!set.begin(&ItemKey::parse("1").unwrap()));
    }

    #[test]
    fn release_undoes_begin() {
        let k = ItemKey::parse("789").unwrap();
        let mut set = PendingSet::new(vec![k.clone()]);
        set.begin(&k);
        set.release(&k);
        assert!(set.is_pending(&k));
        assert_eq!(set.get(&k).map(|i| i.attempts), Some(0));
    }
}
