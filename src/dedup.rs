use std::collections::HashSet;

use unicase::UniCase;

use crate::directory::DirectoryEntry;


/// Collects entries keyed by distinguished name, keeping the first copy of
/// each and the order in which they were first seen.
#[derive(Clone, Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<UniCase<String>>,
    entries: Vec<DirectoryEntry>,
}
impl Deduplicator {
    pub fn new() -> Self { Self::default() }

    /// Returns whether the entry was new.
    pub fn insert(&mut self, entry: DirectoryEntry) -> bool {
        if self.seen.contains(&entry.dn) {
            return false;
        }
        self.seen.insert(entry.dn.clone());
        self.entries.push(entry);
        true
    }

    /// Returns how many of the entries were new.
    pub fn extend<I: IntoIterator<Item = DirectoryEntry>>(&mut self, entries: I) -> usize {
        let mut added = 0;
        for entry in entries {
            if self.insert(entry) {
                added += 1;
            }
        }
        added
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn into_entries(self) -> Vec<DirectoryEntry> { self.entries }
}


/// Folds several batches into one duplicate-free sequence.
pub fn merge<B: IntoIterator<Item = DirectoryEntry>, I: IntoIterator<Item = B>>(batches: I) -> Vec<DirectoryEntry> {
    let mut dedup = Deduplicator::new();
    for batch in batches {
        dedup.extend(batch);
    }
    dedup.into_entries()
}


#[cfg(test)]
mod tests {
    use super::{merge, Deduplicator};
    use crate::directory::DirectoryEntry;

    fn entry(dn: &str, cn: &str) -> DirectoryEntry {
        DirectoryEntry::new(dn).with_value("cn", cn)
    }

    #[test]
    fn test_merge_keeps_first_seen_order() {
        let merged = merge(vec![
            vec![entry("cn=a,dc=x", "a1"), entry("cn=b,dc=x", "b1")],
            vec![entry("cn=b,dc=x", "b2"), entry("cn=c,dc=x", "c1")],
            vec![entry("CN=A,DC=X", "a2")],
        ]);
        let dns: Vec<&str> = merged.iter().map(|e| e.dn.as_str()).collect();
        assert_eq!(dns, vec!["cn=a,dc=x", "cn=b,dc=x", "cn=c,dc=x"]);
        assert_eq!(merged[1].first_string("cn").unwrap(), "b1");
    }

    #[test]
    fn test_extend_counts_new() {
        let mut dedup = Deduplicator::new();
        assert_eq!(dedup.extend(vec![entry("cn=a,dc=x", "a"), entry("cn=a,dc=x", "a")]), 1);
        assert_eq!(dedup.extend(vec![entry("cn=a,dc=x", "a"), entry("cn=b,dc=x", "b")]), 1);
        assert_eq!(dedup.len(), 2);
    }
}
