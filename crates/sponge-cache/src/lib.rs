mod codec;
mod store;

pub use codec::{decode_response, encode_response, CodecError};
pub use store::{CacheError, CacheStore, MemoryCacheStore, RedisCacheConfig, RedisCacheStore};

/// Cache key for one transaction: `METHOD:HOST:PATH`.
///
/// `host` is the request authority (port included when the client sent one)
/// and `path` is the absolute path with no query string. Nothing else
/// participates in the key.
pub fn fingerprint(method: &str, host: &str, path: &str) -> String {
    format!("{method}:{host}:{path}")
}

/// Multi-valued header collection with case-insensitive names.
///
/// Value order within one name is preserved; order across distinct names is
/// whatever the insertion order happened to be and is not part of the cache
/// contract.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some((_, values)) = self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            values.push(value);
        } else {
            self.entries.push((name.to_string(), vec![value]));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn remove(&mut self, name: &str) {
        self.entries
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }

    /// Flattened `(name, value)` pairs in stored order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().flat_map(|(name, values)| {
            values.iter().map(move |value| (name.as_str(), value.as_str()))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One stored response: everything the proxy needs to replay it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}
