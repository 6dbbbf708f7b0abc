//! On-disk cache envelope and key-to-path mapping

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// File extension of cache entry files
pub const ENTRY_EXTENSION: &str = "json";

/// Longest encoded key used verbatim as a file name
const MAX_ENCODED_LEN: usize = 200;

/// Marks digest-named entries; `encode_key` never emits `%` before a lowercase letter
const DIGEST_PREFIX: &str = "%h-";

/// Wrapper stored on disk for every cached value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// Key the entry was stored under
    pub key: String,
    /// The cached value
    pub payload: T,
    /// When the entry was written
    pub written_at: DateTime<Utc>,
    /// How long the entry stays fresh; zero or negative never expires
    #[serde(rename = "ttl_us", with = "ttl_micros")]
    pub ttl: TimeDelta,
}

impl<T> CacheEntry<T> {
    pub fn new(key: impl Into<String>, payload: T, ttl: TimeDelta) -> Self {
        Self {
            key: key.into(),
            payload,
            written_at: Utc::now(),
            ttl,
        }
    }

    /// Whether the entry has outlived its TTL at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        is_expired(self, now)
    }
}

/// `ttl > 0 && now - written_at > ttl`
pub fn is_expired<T>(entry: &CacheEntry<T>, now: DateTime<Utc>) -> bool {
    entry.ttl > TimeDelta::zero() && now - entry.written_at > entry.ttl
}

/// Resolves the file holding `key` inside `dir`
///
/// Bytes outside `[A-Za-z0-9_-]` are written as `%XX`, so the file name never
/// contains a separator or `..`, and distinct keys never share a file. Keys
/// whose encoding would outgrow a file name are named by their SHA-256 digest.
pub fn entry_path(dir: &Path, key: &str) -> PathBuf {
    let mut name = encode_key(key);
    if name.len() > MAX_ENCODED_LEN {
        name = format!("{DIGEST_PREFIX}{}", hex::encode(Sha256::digest(key.as_bytes())));
    }
    dir.join(format!("{}.{}", name, ENTRY_EXTENSION))
}

fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

mod ttl_micros {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error> {
        let micros = ttl.num_microseconds().unwrap_or(if *ttl < TimeDelta::zero() {
            i64::MIN
        } else {
            i64::MAX
        });
        serializer.serialize_i64(micros)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeDelta, D::Error> {
        let micros = i64::deserialize(deserializer)?;
        Ok(TimeDelta::microseconds(micros))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Component;

    fn entry_at(written_at: DateTime<Utc>, ttl: TimeDelta) -> CacheEntry<&'static str> {
        CacheEntry {
            key: "k".to_string(),
            payload: "v",
            written_at,
            ttl,
        }
    }

    #[test]
    fn test_non_positive_ttl_never_expires() {
        let written = Utc::now();
        let far_future = written + TimeDelta::days(365 * 100);
        for ttl in [TimeDelta::zero(), TimeDelta::seconds(-5)] {
            let entry = entry_at(written, ttl);
            assert!(!is_expired(&entry, written));
            assert!(!is_expired(&entry, far_future));
        }
    }

    #[test]
    fn test_positive_ttl_expires_just_after_boundary() {
        let written = Utc::now();
        let ttl = TimeDelta::seconds(2);
        let entry = entry_at(written, ttl);

        assert!(!entry.is_expired_at(written + ttl - TimeDelta::milliseconds(1)));
        assert!(!entry.is_expired_at(written + ttl));
        assert!(entry.is_expired_at(written + ttl + TimeDelta::milliseconds(1)));
    }

    #[test]
    fn test_envelope_is_self_describing_json() {
        let entry = CacheEntry::new("page:1", vec![1, 2, 3], TimeDelta::seconds(90));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["key"], "page:1");
        assert_eq!(json["payload"], serde_json::json!([1, 2, 3]));
        assert_eq!(json["ttl_us"], 90_000_000);
        assert!(json["written_at"].is_string());

        let back: CacheEntry<Vec<i32>> = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_entry_path_is_deterministic() {
        let dir = Path::new("/tmp/cache");
        assert_eq!(entry_path(dir, "page:1"), entry_path(dir, "page:1"));
        assert_eq!(entry_path(dir, "plain_key-1"), dir.join("plain_key-1.json"));
    }

    #[test]
    fn test_entry_path_stays_inside_directory() {
        let dir = Path::new("/var/cache/app");
        let hostile = [
            "../../etc/passwd",
            "..",
            ".",
            "/absolute/path",
            "a/b/c",
            "back\\slash",
            "nul\0byte",
            "",
            "ünïcode/..",
        ];
        for key in hostile {
            let path = entry_path(dir, key);
            let relative = path.strip_prefix(dir).expect("path must live under dir");
            let components: Vec<_> = relative.components().collect();
            assert_eq!(components.len(), 1, "key {key:?} produced {relative:?}");
            assert!(matches!(components[0], Component::Normal(_)), "key {key:?}");
        }
    }

    #[test]
    fn test_distinct_keys_get_distinct_files() {
        let dir = Path::new("c");
        assert_ne!(entry_path(dir, "a/b"), entry_path(dir, "a_b"));
        assert_ne!(entry_path(dir, "a/b"), entry_path(dir, "a%2Fb"));
        assert_ne!(entry_path(dir, "a.b"), entry_path(dir, "a_b"));
    }

    #[test]
    fn test_sub_millisecond_ttl_survives_serialization() {
        let entry = CacheEntry::new("k", 1, TimeDelta::microseconds(500));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["ttl_us"], 500);

        let back: CacheEntry<i32> = serde_json::from_value(json).unwrap();
        assert_eq!(back.ttl, TimeDelta::microseconds(500));
        assert!(back.is_expired_at(back.written_at + TimeDelta::milliseconds(1)));
    }

    #[test]
    fn test_long_keys_are_named_by_digest() {
        let dir = Path::new("/var/cache/app");
        let long = format!("collection:{}:{}", "0f8fad5b-d9cb-469f-a165-70867728950e", "/".repeat(120));
        let path = entry_path(dir, &long);

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(DIGEST_PREFIX));
        assert!(name.len() <= MAX_ENCODED_LEN);
        assert_eq!(path.parent(), Some(dir));
        assert_eq!(path, entry_path(dir, &long));
        assert_ne!(path, entry_path(dir, &format!("{long}x")));
    }

    #[test]
    fn test_keys_at_the_length_limit_stay_readable() {
        let dir = Path::new("c");
        let key = "a".repeat(MAX_ENCODED_LEN);
        assert_eq!(entry_path(dir, &key), dir.join(format!("{key}.json")));
    }
}
