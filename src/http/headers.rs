//! HTTP header map with case-insensitive name lookup.

/// A case-insensitive, order-preserving, multi-value header map.
///
/// # Examples
///
/// ```
/// use cadence::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("X-RateLimit-Limit", "100");
/// headers.set("x-ratelimit-limit", "50");
///
/// assert_eq!(headers.get("X-RATELIMIT-LIMIT"), Some("50"));
/// assert_eq!(headers.len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header entry. Multiple values for the same name are preserved.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Replaces every value of `name` with a single `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.inner.push((name, value.into()));
    }

    /// Returns the first value for `name` (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns all values for `name` (case-insensitive).
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Removes all entries named `name`. Returns `true` if any were removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of entries, not unique names.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
