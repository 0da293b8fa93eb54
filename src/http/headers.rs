//! HTTP header map with case-insensitive name lookup.
//!
//! HTTP header names are case-insensitive per [RFC 9110 §5.1]. The map keeps
//! one value per name, stores the case-folded name alongside the spelling it
//! was first inserted with, and iterates in insertion order.

use std::fmt;

#[derive(Debug, Clone)]
struct Entry {
    folded: String,
    name: String,
    value: String,
}

/// A case-insensitive, insertion-ordered HTTP header map.
///
/// Equality compares the case-folded name/value sets, so two maps built from
/// differently cased but otherwise identical headers are equal regardless of
/// insertion order.
///
/// # Examples
///
/// ```
/// use httpony::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Content-Type", "text/html; charset=utf-8");
/// headers.insert("content-type", "text/plain");
///
/// assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
/// assert_eq!(headers.iter().next(), Some(("Content-Type", "text/plain")));
/// ```
#[derive(Clone, Default)]
pub struct Headers {
    inner: Vec<Entry>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with pre-allocated capacity for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.inner
            .iter()
            .position(|e| e.folded.eq_ignore_ascii_case(name))
    }

    /// Sets a header, replacing any existing value under the same name.
    ///
    /// The first-inserted spelling of the name is kept. Returns the previous
    /// value, if any.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(i) => Some(std::mem::replace(&mut self.inner[i].value, value)),
            None => {
                self.inner.push(Entry {
                    folded: name.to_ascii_lowercase(),
                    name,
                    value,
                });
                None
            }
        }
    }

    /// Sets a header only if it is not already present, and returns the
    /// value now stored under that name.
    pub fn set_default(&mut self, name: impl Into<String>, value: impl Into<String>) -> &str {
        let name = name.into();
        let i = match self.position(&name) {
            Some(i) => i,
            None => {
                self.inner.push(Entry {
                    folded: name.to_ascii_lowercase(),
                    name,
                    value: value.into(),
                });
                self.inner.len() - 1
            }
        };
        &self.inner[i].value
    }

    /// Returns the value for the given header name (case-insensitive), or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.inner[i].value.as_str())
    }

    /// Removes the header with the given name (case-insensitive) and returns its value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.position(name).map(|i| self.inner.remove(i).value)
    }

    /// Returns `true` if the map contains an entry with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Returns the number of distinct header names.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no header entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over all `(name, value)` pairs in insertion order,
    /// names in their first-inserted spelling.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|e| (e.name.as_str(), e.value.as_str()))
    }

    /// Returns an iterator over `(name, value)` pairs with lower-cased names.
    pub fn iter_lower(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner
            .iter()
            .map(|e| (e.folded.as_str(), e.value.as_str()))
    }

    /// Sets every header from `other`, overriding existing values.
    pub fn merge(&mut self, other: &Headers) {
        for (name, value) in other.iter() {
            self.insert(name, value);
        }
    }

    /// Sets every header from `defaults` that is not already present.
    pub fn merge_defaults(&mut self, defaults: &Headers) {
        for (name, value) in defaults.iter() {
            self.set_default(name, value);
        }
    }

    /// Returns `true` when the header's comma-separated value list contains
    /// `token` (case-insensitive), e.g. `Connection: keep-alive, close`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get(name).is_some_and(|value| {
            value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        })
    }
}

impl PartialEq for Headers {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .inner
                .iter()
                .all(|e| other.get(&e.folded) == Some(e.value.as_str()))
    }
}

impl Eq for Headers {}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        headers.extend(iter);
        headers
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for Headers {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (name, value) in iter {
            self.insert(name, value);
        }
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_get() {
        let h: Headers = [("Foo", "42"), ("Bar", "37")].into_iter().collect();
        assert_eq!(h.get("Foo"), Some("42"));
        assert_eq!(h.get("foo"), Some("42"));
        assert_eq!(h.get("fOO"), Some("42"));
        assert_eq!(h.get("Bar"), Some("37"));
    }

    #[test]
    fn insert_replaces_and_keeps_first_spelling() {
        let mut h = Headers::new();
        assert_eq!(h.insert("X-Foo", "a"), None);
        assert_eq!(h.insert("x-foo", "b"), Some("a".to_owned()));
        assert_eq!(h.len(), 1);
        assert_eq!(h.iter().collect::<Vec<_>>(), vec![("X-Foo", "b")]);
    }

    #[test]
    fn remove() {
        let mut h = Headers::new();
        h.insert("Foo", "42");
        assert_eq!(h.remove("foo"), Some("42".to_owned()));
        assert!(h.is_empty());
        assert_eq!(h.remove("foo"), None); // already gone
    }

    #[test]
    fn len_tracks_distinct_names() {
        let mut h = Headers::new();
        assert_eq!(h.len(), 0);
        h.insert("Foo", "42");
        h.insert("Bar", "37");
        assert_eq!(h.len(), 2);
        h.remove("foo");
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn iter_lower_folds_names() {
        let h: Headers = [("Foo", "42"), ("Bar", "37")].into_iter().collect();
        let mut lower: Vec<_> = h.iter_lower().collect();
        lower.sort();
        assert_eq!(lower, vec![("bar", "37"), ("foo", "42")]);
    }

    #[test]
    fn equality_ignores_case_and_order() {
        let x: Headers = [("Foo", "42"), ("Bar", "37")].into_iter().collect();
        let y: Headers = [("bar", "37"), ("FOO", "42")].into_iter().collect();
        let z: Headers = [("Foo", "42"), ("Bar", "99")].into_iter().collect();
        assert_eq!(x, y);
        assert_ne!(x, z);
    }

    #[test]
    fn clone_is_independent() {
        let mut x: Headers = [("Foo", "42"), ("Bar", "37")].into_iter().collect();
        let y = x.clone();
        assert_eq!(x, y);
        x.remove("foo");
        assert_ne!(x, y);
    }

    #[test]
    fn set_default_does_not_overwrite() {
        let mut h = Headers::new();
        h.insert("Server", "custom");
        assert_eq!(h.set_default("server", "httpony"), "custom");
        assert_eq!(h.set_default("Keep-Alive", "timeout=5"), "timeout=5");
    }

    #[test]
    fn merge_overrides_and_defaults_fill() {
        let mut base: Headers = [("Accept", "*/*"), ("User-Agent", "ua")].into_iter().collect();
        let caller: Headers = [("accept", "text/html")].into_iter().collect();
        base.merge(&caller);
        assert_eq!(base.get("Accept"), Some("text/html"));

        let mut resp: Headers = [("Server", "mine")].into_iter().collect();
        let defaults: Headers = [("Server", "httpony"), ("Keep-Alive", "timeout=5")]
            .into_iter()
            .collect();
        resp.merge_defaults(&defaults);
        assert_eq!(resp.get("server"), Some("mine"));
        assert_eq!(resp.get("keep-alive"), Some("timeout=5"));
    }

    #[test]
    fn token_lists() {
        let h: Headers = [("Connection", "keep-alive, Close")].into_iter().collect();
        assert!(h.has_token("connection", "close"));
        assert!(!h.has_token("connection", "upgrade"));
    }

    #[test]
    fn debug_and_display() {
        let h: Headers = [("x", "42")].into_iter().collect();
        assert_eq!(format!("{h:?}"), r#"{"x": "42"}"#);
        assert_eq!(h.to_string(), "x: 42\r\n");
    }
}
