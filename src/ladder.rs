//! Per-manifest bitrate ladders.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Ascending list of bitrates advertised by one manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitrateLadder {
    rates: Vec<u64>,
}

impl BitrateLadder {
    /// Builds a ladder, sorting the input ascending.
    pub fn new(mut rates: Vec<u64>) -> Self {
        rates.sort_unstable();
        Self { rates }
    }

    pub fn rates(&self) -> &[u64] {
        &self.rates
    }

    pub fn lowest(&self) -> Option<u64> {
        self.rates.first().copied()
    }

    #[cfg(test)]
    pub fn highest(&self) -> Option<u64> {
        self.rates.last().copied()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rates.len()
    }
}

/// Manifest path -> ladder. Entries are overwritten whenever a manifest is
/// fetched again and live for the whole process otherwise.
pub struct LadderStore {
    ladders: Arc<RwLock<HashMap<String, BitrateLadder>>>,
}

impl LadderStore {
    pub fn new() -> Self {
        Self {
            ladders: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn put(&self, path: &str, ladder: BitrateLadder) {
        self.ladders.write().insert(path.to_string(), ladder);
    }

    /// `None` means the ladder is unknown, which is not the same as an empty
    /// ladder.
    pub fn get(&self, path: &str) -> Option<BitrateLadder> {
        self.ladders.read().get(path).cloned()
    }

    #[allow(dead_code)]
    pub fn remove(&self, path: &str) -> Option<BitrateLadder> {
        self.ladders.write().remove(path)
    }

    #[allow(dead_code)]
    pub fn clear(&self) {
        self.ladders.write().clear();
    }

    pub fn len(&self) -> usize {
        self.ladders.read().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.ladders.read().is_empty()
    }
}

impl Default for LadderStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_sorted() {
        let ladder = BitrateLadder::new(vec![3000, 300, 1200, 750]);
        assert_eq!(ladder.rates(), &[300, 750, 1200, 3000]);
        assert_eq!(ladder.lowest(), Some(300));
        assert_eq!(ladder.highest(), Some(3000));
        assert_eq!(ladder.len(), 4);
    }

    #[test]
    fn test_put_overwrites() {
        let store = LadderStore::new();
        store.put("/v/a.mpd", BitrateLadder::new(vec![100, 200]));
        store.put("/v/a.mpd", BitrateLadder::new(vec![500]));
        assert_eq!(store.get("/v/a.mpd").unwrap().rates(), &[500]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unknown_versus_empty() {
        let store = LadderStore::new();
        assert!(store.get("/v/a.mpd").is_none());

        store.put("/v/a.mpd", BitrateLadder::default());
        let ladder = store.get("/v/a.mpd").unwrap();
        assert!(ladder.is_empty());
        assert_eq!(ladder.lowest(), None);
    }

    #[test]
    fn test_remove_and_clear() {
        let store = LadderStore::new();
        store.put("/a.mpd", BitrateLadder::new(vec![1]));
        store.put("/b.mpd", BitrateLadder::new(vec![2]));

        assert!(store.remove("/a.mpd").is_some());
        assert!(store.remove("/a.mpd").is_none());
        assert!(store.get("/b.mpd").is_some());

        store.clear();
        assert!(store.is_empty());
    }
}
