use std::collections::HashSet;

use crate::api;
use crate::data::EntryService;
use crate::models::{Entry, FeedKey};

/// Entries of one feed, split by publication state. Rebuilt from scratch on
/// every refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntrySets {
    pub published: Vec<Entry>,
    pub unpublished: Vec<Entry>,
    pub overflow: Vec<Entry>,
}

impl EntrySets {
    /// Overflowed entries go to `overflow` regardless of their publish flag;
    /// the rest split on `published`.
    pub fn partition(entries: Vec<Entry>) -> Self {
        let mut sets = Self::default();
        for entry in entries {
            if entry.is_overflow() {
                sets.overflow.push(entry);
            } else if entry.published {
                sets.published.push(entry);
            } else {
                sets.unpublished.push(entry);
            }
        }
        sets
    }

    /// Partition the union of the `latest` and `unpublished` listings. An
    /// entry present in both is kept once, as first seen.
    pub fn merge(latest: Vec<Entry>, unpublished: Vec<Entry>) -> Self {
        let mut seen = HashSet::new();
        let entries = latest
            .into_iter()
            .chain(unpublished)
            .filter(|entry| seen.insert(entry.id.clone()))
            .collect();
        Self::partition(entries)
    }

    pub fn len(&self) -> usize {
        self.published.len() + self.unpublished.len() + self.overflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, entry_id: &str) -> Option<&Entry> {
        self.published
            .iter()
            .chain(&self.unpublished)
            .chain(&self.overflow)
            .find(|entry| entry.id == entry_id)
    }
}

pub fn fetch(service: &dyn EntryService, key: FeedKey) -> api::Result<EntrySets> {
    let latest = service.latest_entries(key)?;
    let unpublished = service.unpublished_entries(key)?;
    Ok(EntrySets::merge(latest, unpublished))
}

/// Force-publish one entry and return the refreshed sets.
pub fn publish(service: &dyn EntryService, key: FeedKey, entry_id: &str) -> api::Result<EntrySets> {
    log::info!("entries: publishing {entry_id} of feed {key}");
    service.publish_entry(key, entry_id)?;
    fetch(service, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryService;
    use crate::models::FeedType;
    use serde_json::json;

    fn entry(id: &str, published: bool, overflow: Option<&str>) -> Entry {
        serde_json::from_value(json!({
            "id": id,
            "published": published,
            "overflow_reason": overflow,
        }))
        .unwrap()
    }

    #[test]
    fn partition_counts_sum_to_input() {
        let entries = vec![
            entry("1", true, None),
            entry("2", false, Some("Feed backed up")),
            entry("3", false, None),
            entry("4", true, Some("Added from feed backlog")),
            entry("5", true, None),
        ];
        let sets = EntrySets::partition(entries);
        assert_eq!(sets.overflow.len(), 2);
        assert_eq!(sets.published.len() + sets.unpublished.len(), 3);
        assert_eq!(sets.len(), 5);
        assert_eq!(sets.published.len(), 2);
    }

    #[test]
    fn merge_drops_duplicates() {
        let latest = vec![entry("1", true, None), entry("2", false, Some("x"))];
        let unpublished = vec![entry("2", false, Some("x")), entry("3", false, None)];
        let sets = EntrySets::merge(latest, unpublished);
        assert_eq!(sets.len(), 3);
        assert!(sets.find("3").is_some());
    }

    #[test]
    fn publish_moves_entry_to_published() {
        let service = MemoryService::new();
        let key = FeedKey::new(FeedType::Rss, 1);
        service.set_entries(
            key,
            vec![entry("a", false, None), entry("b", false, Some("Feed backed up"))],
        );
        let sets = fetch(&service, key).unwrap();
        assert_eq!(sets.unpublished.len(), 1);
        assert_eq!(sets.overflow.len(), 1);

        let sets = publish(&service, key, "b").unwrap();
        assert_eq!(sets.published.len(), 1);
        assert!(sets.overflow.is_empty());
        assert_eq!(service.published(), vec![(key, "b".to_string())]);
    }
}
