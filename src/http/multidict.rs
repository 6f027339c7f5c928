//! Ordered key to list-of-values container.

use std::str::FromStr;

/// Ordered multi-value map used for query arguments and form bodies.
///
/// Keys keep the order of their first insertion and every key holds its
/// values in insertion order. [`get`](MultiDict::get) returns the first
/// value only and never merges; [`get_list`](MultiDict::get_list) returns
/// the full history.
///
/// # Examples
/// ```
/// use nanodot::MultiDict;
///
/// let mut d = MultiDict::new();
/// d.insert("sort", "name");
/// d.insert("sort", "email");
/// d.insert("age", "42");
///
/// assert_eq!(d.get("sort"), Some("name"));
/// assert_eq!(d.get_list("sort"), ["name", "email"]);
/// assert_eq!(d.get_as::<u8>("age"), Some(Ok(42)));
/// assert_eq!(d.get_or("missing", "none"), "none");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiDict {
    entries: Vec<(String, Vec<String>)>,
}

impl MultiDict {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn values(&self, key: &str) -> Option<&Vec<String>> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Appends `value` to the values of `key`.
    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value.into()),
            None => self.entries.push((key, vec![value.into()])),
        }
    }

    /// First value inserted for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values(key)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// First value of `key`, or `default` when the key is absent.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// First value of `key` converted with [`FromStr`].
    ///
    /// Returns `None` when the key is absent and `Some(Err(_))` when the
    /// conversion fails.
    pub fn get_as<T: FromStr>(&self, key: &str) -> Option<Result<T, T::Err>> {
        self.get(key).map(str::parse)
    }

    /// Every value of `key` in insertion order; empty if the key is absent.
    pub fn get_list(&self, key: &str) -> &[String] {
        self.values(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every value of `key` converted with [`FromStr`].
    pub fn get_list_as<T: FromStr>(&self, key: &str) -> Result<Vec<T>, T::Err> {
        self.get_list(key).iter().map(|v| v.parse()).collect()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values(key).is_some()
    }

    /// Distinct keys in first-insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Iterates every `(key, value)` pair, grouped by key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MultiDict {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut dict = MultiDict::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_history() {
        let d: MultiDict = [("items", "3"), ("other", "x"), ("items", "56")]
            .into_iter()
            .collect();

        assert_eq!(d.len(), 2);
        assert_eq!(d.get("items"), Some("3"));
        assert_eq!(d.get_list("items"), ["3", "56"]);
        assert_eq!(d.get_list_as::<u32>("items"), Ok(vec![3, 56]));
        assert_eq!(d.keys().collect::<Vec<_>>(), ["items", "other"]);
        assert_eq!(
            d.iter().collect::<Vec<_>>(),
            [("items", "3"), ("items", "56"), ("other", "x")]
        );
    }

    #[test]
    fn missing_keys() {
        let d = MultiDict::new();

        assert!(d.is_empty());
        assert_eq!(d.get("x"), None);
        assert!(d.get_list("x").is_empty());
        assert!(d.get_as::<i32>("x").is_none());
        assert_eq!(d.get_list_as::<i32>("x"), Ok(vec![]));
        assert!(!d.contains_key("x"));
    }

    #[test]
    fn typed_lookup_failure() {
        let mut d = MultiDict::new();
        d.insert("age", "forty");

        assert!(matches!(d.get_as::<u8>("age"), Some(Err(_))));
    }

    #[test]
    fn keys_are_case_sensitive() {
        let mut d = MultiDict::new();
        d.insert("Key", "1");
        d.insert("key", "2");

        assert_eq!(d.len(), 2);
        assert_eq!(d.get("Key"), Some("1"));
        assert_eq!(d.get("key"), Some("2"));
    }
}
