//! URL patterns with typed captures.

use regex::Regex;
use std::fmt;

/// A compiled route path template.
///
/// The template is split on `/`; a segment written `<name>` or
/// `<type:name>` captures one value:
///
/// | Type | Matches | Value |
/// |---|---|---|
/// | `string` (default) | one segment, no `/` | [`PathValue::Str`] |
/// | `int` | a run of digits | [`PathValue::Int`] |
/// | `path` | the remainder, `/` included | [`PathValue::Str`] |
/// | `re:EXPR` | the regular expression `EXPR` | [`PathValue::Str`] |
///
/// Templates without captures compare by plain string equality; the others
/// compile to one anchored regular expression. An `int` capture whose digits
/// do not fit an `i64` is treated as no match.
///
/// # Examples
/// ```
/// use nanodot::{PathValue, UrlPattern};
///
/// let pattern = UrlPattern::new("/users/<int:id>/files/<path:file>").unwrap();
///
/// let args = pattern.matches("/users/7/files/docs/a.txt").unwrap();
/// assert_eq!(args.int("id"), Some(7));
/// assert_eq!(args.str("file"), Some("docs/a.txt"));
///
/// assert!(pattern.matches("/users/seven/files/a.txt").is_none());
/// ```
#[derive(Debug, Clone)]
pub struct UrlPattern {
    source: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Literal(String),
    Regex {
        regex: Regex,
        // Capture name, type and group index
        captures: Vec<(String, CaptureType, usize)>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureType {
    Str,
    Int,
}

impl UrlPattern {
    /// Compiles `pattern`.
    ///
    /// # Errors
    /// - [`PatternError::InvalidSegment`] for a segment opening with `<`
    ///   but not closing with `>`, or with an empty capture name.
    /// - [`PatternError::UnknownType`] for a capture type other than
    ///   `string`, `int`, `path` or `re:...`.
    /// - [`PatternError::Regex`] for an invalid `re:` expression.
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let mut expression = String::new();
        let mut literal = String::new();
        let mut captures = Vec::new();
        // Group 0 is the whole match
        let mut group = 1;

        for segment in pattern.trim_start_matches('/').split('/') {
            literal.push('/');
            literal.push_str(segment);
            expression.push('/');

            let Some(inner) = segment.strip_prefix('<') else {
                expression.push_str(&regex::escape(segment));
                continue;
            };
            let inner = inner
                .strip_suffix('>')
                .ok_or_else(|| PatternError::InvalidSegment(segment.to_owned()))?;

            let (kind, name) = inner.rsplit_once(':').unwrap_or(("string", inner));
            if name.is_empty() {
                return Err(PatternError::InvalidSegment(segment.to_owned()));
            }

            let (sub_pattern, capture) = match kind {
                "string" => ("[^/]+", CaptureType::Str),
                "int" => (r"\d+", CaptureType::Int),
                "path" => (".+", CaptureType::Str),
                _ => match kind.strip_prefix("re:") {
                    Some(custom) => (custom, CaptureType::Str),
                    None => return Err(PatternError::UnknownType(kind.to_owned())),
                },
            };

            expression.push('(');
            expression.push_str(sub_pattern);
            expression.push(')');
            captures.push((name.to_owned(), capture, group));

            // Groups inside a custom expression shift the following captures
            group += Regex::new(sub_pattern)?.captures_len();
        }

        let matcher = match captures.is_empty() {
            true => Matcher::Literal(literal),
            false => Matcher::Regex {
                regex: Regex::new(&format!("^{expression}$"))?,
                captures,
            },
        };

        Ok(Self {
            source: pattern.to_owned(),
            matcher,
        })
    }

    /// Captured arguments if `path` matches, `None` otherwise.
    pub fn matches(&self, path: &str) -> Option<PathArgs> {
        match &self.matcher {
            Matcher::Literal(literal) => (literal == path).then(PathArgs::default),
            Matcher::Regex { regex, captures } => {
                let groups = regex.captures(path)?;
                let mut args = PathArgs::default();

                for (name, capture, index) in captures {
                    let raw = groups.get(*index)?.as_str();
                    let value = match capture {
                        CaptureType::Int => PathValue::Int(raw.parse().ok()?),
                        CaptureType::Str => PathValue::Str(raw.to_owned()),
                    };
                    args.insert(name.clone(), value);
                }

                Some(args)
            }
        }
    }

    /// The template this pattern was compiled from.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Invalid route template.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("invalid URL pattern segment `{0}`")]
    InvalidSegment(String),
    #[error("unknown URL segment type `{0}`")]
    UnknownType(String),
    #[error("invalid regular expression in URL pattern: {0}")]
    Regex(#[from] regex::Error),
}

/// One captured path value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathValue {
    Str(String),
    Int(i64),
}

impl PathValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PathValue::Int(value) => Some(*value),
            PathValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PathValue::Str(value) => Some(value),
            PathValue::Int(_) => None,
        }
    }
}

impl fmt::Display for PathValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathValue::Str(value) => f.write_str(value),
            PathValue::Int(value) => write!(f, "{value}"),
        }
    }
}

/// Arguments captured from the request path, in template order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathArgs {
    values: Vec<(String, PathValue)>,
}

impl PathArgs {
    // A repeated name replaces the earlier capture
    fn insert(&mut self, name: String, value: PathValue) {
        match self.values.iter_mut().find(|(n, _)| *n == name) {
            Some((_, old)) => *old = value,
            None => self.values.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&PathValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value)
    }

    /// Value of an `int` capture.
    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(PathValue::as_int)
    }

    /// Value of a `string`, `path` or `re:` capture.
    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(PathValue::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PathValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
