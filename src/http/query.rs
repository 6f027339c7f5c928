//! URL query string and `application/x-www-form-urlencoded` decoding.

use crate::MultiDict;
use memchr::{memchr, memchr2};
use std::{error, fmt};

/// Query string parser with `+` and percent-escape decoding.
///
/// # Examples
/// ```rust
/// use nanodot::{query::Query, MultiDict};
///
/// let args: MultiDict = Query::parse(b"name=John+Doe&tag=a&tag=b%21").unwrap();
/// assert_eq!(args.get("name"), Some("John Doe"));
/// assert_eq!(args.get_list("tag"), ["a", "b!"]);
/// ```
/// All possible formats:
/// ```rust
/// use nanodot::query::Query;
///
/// let params: Vec<(String, String)> = Query::parse(b"debug&name=&=Qwe&key=sda&&").unwrap();
///
/// assert_eq!(params.len(), 4);
/// assert_eq!(params[0], ("debug".into(), "".into()));
/// assert_eq!(params[1], ("name".into(), "".into()));
/// assert_eq!(params[2], ("".into(), "Qwe".into()));
/// assert_eq!(params[3], ("key".into(), "sda".into()));
/// ```
pub struct Query;

impl Query {
    /// Parses a query string into a new collection.
    ///
    /// A leading `?` is skipped, so `?a=1` and `a=1` are equivalent. Empty
    /// segments (`a=1&&b=2`) are skipped; a segment without `=` yields an
    /// empty value.
    #[inline(always)]
    pub fn parse<C: QueryCollector + Default>(query: &[u8]) -> Result<C, Error> {
        let mut result = C::default();
        Self::parse_into(&mut result, query)?;
        Ok(result)
    }

    /// Parses a query string, appending every pair to `result`.
    ///
    /// # Examples
    /// ```
    /// use nanodot::query::Query;
    ///
    /// let mut collector: Vec<(String, String)> = Vec::new();
    ///
    /// Query::parse_into(&mut collector, b"a=1&b=2").unwrap();
    /// Query::parse_into(&mut collector, b"c=3").unwrap();
    /// assert_eq!(collector.len(), 3); // parameters are appended
    ///
    /// assert!(Query::parse_into(&mut collector, b"bad=%zz").is_err());
    /// ```
    #[inline]
    pub fn parse_into<C: QueryCollector>(result: &mut C, query: &[u8]) -> Result<(), Error> {
        let data = match query.first() {
            Some(b'?') => &query[1..],
            _ => query,
        };

        let mut start = 0;
        while start < data.len() {
            // Find next '&' or end of string
            let end = memchr(b'&', &data[start..])
                .map(|pos| start + pos)
                .unwrap_or(data.len());

            if start == end {
                start = end + 1;
                continue;
            }

            // Find '=' within current parameter segment
            let index = memchr(b'=', &data[start..end]).unwrap_or(end - start);
            let split_index = start + index;

            let key = &data[start..split_index];
            let value = match split_index < end {
                true => &data[split_index + 1..end],
                false => b"",
            };

            result.add_param(decode(key)?, decode(value)?);
            start = end + 1;
        }

        Ok(())
    }
}

/// Decodes one urlencoded component: `+` becomes a space and `%XX` the byte
/// `0xXX`. The decoded bytes must form valid UTF-8.
///
/// # Examples
/// ```
/// use nanodot::query::{decode, Error};
///
/// assert_eq!(decode(b"a+b%2Fc").unwrap(), "a b/c");
/// assert_eq!(decode(b"caf%C3%A9").unwrap(), "café");
/// assert_eq!(decode(b"100%"), Err(Error::InvalidEscape));
/// ```
pub fn decode(src: &[u8]) -> Result<String, Error> {
    if memchr2(b'+', b'%', src).is_none() {
        return utf8(src.to_vec());
    }

    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        match src[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hi = src.get(i + 1).and_then(|b| hex(*b));
                let lo = src.get(i + 2).and_then(|b| hex(*b));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
                    _ => return Err(Error::InvalidEscape),
                }
                i += 2;
            }
            byte => out.push(byte),
        }
        i += 1;
    }

    utf8(out)
}

#[inline(always)]
fn hex(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[inline(always)]
fn utf8(bytes: Vec<u8>) -> Result<String, Error> {
    match simdutf8::basic::from_utf8(&bytes) {
        // SAFETY: validated just above
        Ok(_) => Ok(unsafe { String::from_utf8_unchecked(bytes) }),
        Err(_) => Err(Error::InvalidUtf8),
    }
}

/// A trait for types that can collect decoded query parameters.
///
/// # Examples
/// ```rust
/// use nanodot::query::{Query, QueryCollector};
///
/// #[derive(Default)]
/// struct KeysOnly(Vec<String>);
///
/// impl QueryCollector for KeysOnly {
///     fn add_param(&mut self, key: String, _: String) {
///         self.0.push(key);
///     }
/// }
///
/// let keys: KeysOnly = Query::parse(b"a=1&b=2").unwrap();
/// assert_eq!(keys.0, ["a", "b"]);
/// ```
pub trait QueryCollector {
    /// Adds a decoded parameter to the collection.
    fn add_param(&mut self, key: String, value: String);
}

// Preserves parameter order and duplicates
impl QueryCollector for Vec<(String, String)> {
    #[inline(always)]
    fn add_param(&mut self, key: String, value: String) {
        self.push((key, value));
    }
}

impl QueryCollector for MultiDict {
    #[inline(always)]
    fn add_param(&mut self, key: String, value: String) {
        self.insert(key, value);
    }
}

/// Error types that can occur during query decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A `%` not followed by two hexadecimal digits.
    InvalidEscape,
    /// The decoded bytes are not valid UTF-8.
    InvalidUtf8,
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidEscape => write!(f, "Invalid percent-escape sequence"),
            Error::InvalidUtf8 => write!(f, "Decoded value is not valid UTF-8"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(line: &str) -> Vec<(String, String)> {
        Query::parse(line.as_bytes()).unwrap()
    }

    #[test]
    fn basic() {
        let cases = ["a=1&b=2", "?a=1&b=2"];

        for line in cases {
            let params = pairs(line);

            assert_eq!(params.len(), 2);
            assert_eq!(params[0], ("a".into(), "1".into()));
            assert_eq!(params[1], ("b".into(), "2".into()));
        }
    }

    #[test]
    fn full() {
        let params = pairs("flag&empty=&=val&&key=value&eq=a=b");

        #[rustfmt::skip]
        let expected = [
            ("flag", ""), ("empty", ""), ("", "val"),
            ("key", "value"), ("eq", "a=b"),
        ];
        assert_eq!(params.len(), expected.len());
        for ((k, v), (ek, ev)) in params.iter().zip(expected) {
            assert_eq!((k.as_str(), v.as_str()), (ek, ev));
        }
    }

    #[test]
    fn decoding() {
        #[rustfmt::skip]
        let cases: [(&[u8], Result<&str, Error>); 8] = [
            (b"plain", Ok("plain")),
            (b"a+b", Ok("a b")),
            (b"%41%62", Ok("Ab")),
            (b"%2b", Ok("+")),
            (b"%E2%9C%93", Ok("\u{2713}")),
            (b"50%", Err(Error::InvalidEscape)),
            (b"%g1", Err(Error::InvalidEscape)),
            (b"%FF", Err(Error::InvalidUtf8)),
        ];

        for (src, expected) in cases {
            assert_eq!(decode(src).as_deref(), expected.as_deref());
        }
    }

    #[test]
    fn repeated_keys() {
        let args: MultiDict = Query::parse(b"a=1&a=2&b=x").unwrap();

        assert_eq!(args.get("a"), Some("1"));
        assert_eq!(args.get_list("a"), ["1", "2"]);
        assert_eq!(args.get("b"), Some("x"));
    }

    #[test]
    fn empty() {
        assert!(pairs("").is_empty());
        assert!(pairs("?").is_empty());
        assert!(pairs("&&").is_empty());
    }
}
