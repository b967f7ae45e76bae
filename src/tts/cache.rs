//! Phrase cache
//!
//! Maps exact response text to synthesized audio. Pinned phrases live outside
//! the LRU and are never evicted. Lookups return a clone of the entry, so a
//! concurrent replace is seen entirely or not at all.

use chrono::{DateTime, Utc};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::AudioPayload;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedPhrase {
    pub audio: AudioPayload,
    pub created_at: DateTime<Utc>,
}

struct CacheState {
    lru: LruCache<String, CachedPhrase>,
    pinned: HashMap<String, CachedPhrase>,
}

pub struct PhraseCache {
    state: Mutex<CacheState>,
}

impl PhraseCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                lru: LruCache::new(capacity),
                pinned: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up `text`, marking it recently used
    pub fn get(&self, text: &str) -> Option<CachedPhrase> {
        let mut state = self.lock();
        if let Some(entry) = state.pinned.get(text) {
            return Some(entry.clone());
        }
        state.lru.get(text).cloned()
    }

    pub fn contains(&self, text: &str) -> bool {
        let state = self.lock();
        state.pinned.contains_key(text) || state.lru.contains(text)
    }

    /// Store or replace an entry. Pinned phrases stay pinned.
    pub fn insert(&self, text: &str, audio: AudioPayload) {
        let entry = CachedPhrase {
            audio,
            created_at: Utc::now(),
        };
        let mut state = self.lock();
        if let Some(pinned) = state.pinned.get_mut(text) {
            *pinned = entry;
        } else {
            state.lru.put(text.to_string(), entry);
        }
    }

    /// Store an entry that is never evicted
    pub fn pin(&self, text: &str, audio: AudioPayload) {
        let entry = CachedPhrase {
            audio,
            created_at: Utc::now(),
        };
        let mut state = self.lock();
        state.lru.pop(text);
        state.pinned.insert(text.to_string(), entry);
    }

    pub fn is_pinned(&self, text: &str) -> bool {
        self.lock().pinned.contains_key(text)
    }

    /// Entries currently held, pinned included
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.pinned.len() + state.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(tag: u8) -> AudioPayload {
        AudioPayload::wav(vec![tag; 4])
    }

    #[test]
    fn test_lru_eviction() {
        let cache = PhraseCache::new(2);
        cache.insert("one", audio(1));
        cache.insert("two", audio(2));
        // Touch "one" so "two" is the eviction candidate
        assert!(cache.get("one").is_some());
        cache.insert("three", audio(3));

        assert!(cache.contains("one"));
        assert!(!cache.contains("two"));
        assert!(cache.contains("three"));
    }

    #[test]
    fn test_pinned_never_evicted() {
        let cache = PhraseCache::new(1);
        cache.pin("Done.", audio(9));
        cache.insert("a", audio(1));
        cache.insert("b", audio(2));

        assert!(cache.is_pinned("Done."));
        assert_eq!(cache.get("Done.").unwrap().audio, audio(9));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_replace_keeps_pin() {
        let cache = PhraseCache::new(4);
        cache.insert("Okay.", audio(1));
        cache.pin("Okay.", audio(2));
        cache.insert("Okay.", audio(3));

        assert!(cache.is_pinned("Okay."));
        assert_eq!(cache.get("Okay.").unwrap().audio, audio(3));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_exact_text_keys() {
        let cache = PhraseCache::new(4);
        cache.insert("Done.", audio(1));
        assert!(cache.get("done.").is_none());
        assert!(cache.get("Done").is_none());
    }
}
