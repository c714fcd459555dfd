//! Audio URL resolution and the per-session audio cache.

use std::collections::HashMap;

/// Maps a raw audio filename from the backend to something playable.
pub trait AudioResolver: Send + Sync {
    fn resolve(&self, filename: &str, speaker: &str) -> String;
}

/// Joins relative filenames onto `{base_url}/audio/`. Absolute URLs pass through.
#[derive(Debug, Clone)]
pub struct UrlAudioResolver {
    base_url: String,
}

impl UrlAudioResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into().trim_end_matches('/').to_string() }
    }
}

impl AudioResolver for UrlAudioResolver {
    fn resolve(&self, filename: &str, _speaker: &str) -> String {
        if filename.starts_with("http://") || filename.starts_with("https://") {
            return filename.to_string();
        }
        let name = filename.trim_start_matches('/');
        let name = name.strip_prefix("audio/").unwrap_or(name);
        format!("{}/audio/{}", self.base_url, name)
    }
}

/// Turn id → resolved audio URL, owned by one debate session.
#[derive(Debug, Default, Clone)]
pub struct AudioCache {
    urls: HashMap<i64, String>,
}

impl AudioCache {
    pub fn get(&self, turn_id: i64) -> Option<&str> {
        self.urls.get(&turn_id).map(String::as_str)
    }

    pub fn insert(&mut self, turn_id: i64, url: String) {
        self.urls.insert(turn_id, url);
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn clear(&mut self) {
        self.urls.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("clip.mp3", "http://localhost:8000/audio/clip.mp3")]
    #[case("/clip.mp3", "http://localhost:8000/audio/clip.mp3")]
    #[case("audio/clip.mp3", "http://localhost:8000/audio/clip.mp3")]
    #[case("https://cdn.example.com/x.mp3", "https://cdn.example.com/x.mp3")]
    fn test_url_resolver(#[case] filename: &str, #[case] expected: &str) {
        let resolver = UrlAudioResolver::new("http://localhost:8000/");
        assert_eq!(resolver.resolve(filename, "Pro"), expected);
    }

    #[test]
    fn test_cache_roundtrip_and_clear() {
        let mut cache = AudioCache::default();
        assert!(cache.is_empty());
        cache.insert(1, "u1".to_string());
        cache.insert(1, "u1b".to_string());
        cache.insert(2, "u2".to_string());
        assert_eq!(cache.get(1), Some("u1b"));
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.get(2).is_none());
    }
}
