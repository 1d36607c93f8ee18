//! Queue identifiers.
//!
//! A qid is the routing key of the exchange: either a literal byte string
//! or a compiled pattern. Literals match by byte equality; patterns match
//! a candidate literal anchored at its start.

use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::Bytes;
use regex::bytes::Regex;
use thiserror::Error;

/// A pattern that failed to compile.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("pattern is not valid UTF-8")]
    NotUtf8,

    #[error("invalid pattern: {0}")]
    Syntax(#[from] regex::Error),
}

/// A compiled pattern subscription key.
///
/// Matching is anchored at the start of the candidate (the tail may be
/// anything), so `/room/.*` matches `/room/42` but not `x/room/42`.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: Bytes,
    regex: Regex,
}

impl Pattern {
    pub fn new(source: impl Into<Bytes>) -> Result<Self, PatternError> {
        let source = source.into();
        let text = std::str::from_utf8(&source).map_err(|_| PatternError::NotUtf8)?;
        let regex = Regex::new(&format!("^(?:{text})"))?;
        Ok(Self { source, regex })
    }

    /// The pattern text as it travels on the wire.
    #[must_use]
    pub fn source(&self) -> &Bytes {
        &self.source
    }

    #[must_use]
    pub fn matches(&self, candidate: &[u8]) -> bool {
        self.regex.is_match(candidate)
    }
}

/// Queue identifier: a literal byte string or a pattern.
#[derive(Debug, Clone)]
pub enum Qid {
    Literal(Bytes),
    Pattern(Pattern),
}

impl Qid {
    pub fn literal(bytes: impl Into<Bytes>) -> Self {
        Self::Literal(bytes.into())
    }

    pub fn pattern(source: impl Into<Bytes>) -> Result<Self, PatternError> {
        Pattern::new(source).map(Self::Pattern)
    }

    /// The wire payload of this key: literal bytes or pattern source.
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        match self {
            Self::Literal(bytes) => bytes,
            Self::Pattern(pattern) => pattern.source(),
        }
    }

    #[must_use]
    pub const fn is_pattern(&self) -> bool {
        matches!(self, Self::Pattern(_))
    }

    /// Does this subscription key select the given dispatch target?
    ///
    /// Dispatch targets are always literals.
    #[must_use]
    pub fn matches(&self, target: &[u8]) -> bool {
        match self {
            Self::Literal(bytes) => bytes.as_ref() == target,
            Self::Pattern(pattern) => pattern.matches(target),
        }
    }
}

// Literals compare by bytes, patterns by source text. Two compilations of
// the same pattern text are therefore one subscription key.
impl PartialEq for Qid {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Literal(a), Self::Literal(b)) => a == b,
            (Self::Pattern(a), Self::Pattern(b)) => a.source == b.source,
            _ => false,
        }
    }
}

impl Eq for Qid {}

impl Hash for Qid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Literal(bytes) => {
                state.write_u8(0);
                bytes.hash(state);
            }
            Self::Pattern(pattern) => {
                state.write_u8(1);
                pattern.source.hash(state);
            }
        }
    }
}

impl fmt::Display for Qid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
            Self::Pattern(pattern) => {
                write!(f, "~{}", String::from_utf8_lossy(&pattern.source))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_matches_by_equality() {
        let qid = Qid::literal("/queue");
        assert!(qid.matches(b"/queue"));
        assert!(!qid.matches(b"/queue/1"));
        assert!(!qid.matches(b"/que"));
    }

    #[test]
    fn pattern_is_anchored_at_the_start() {
        let qid = Qid::pattern("/room/.*").unwrap();
        assert!(qid.matches(b"/room/42"));
        assert!(qid.matches(b"/room/"));
        assert!(!qid.matches(b"/chan/1"));
        assert!(!qid.matches(b"x/room/42"));
    }

    #[test]
    fn pattern_tail_is_unconstrained() {
        // `re.match` semantics: anchored start, free tail.
        let qid = Qid::pattern("/a").unwrap();
        assert!(qid.matches(b"/a"));
        assert!(qid.matches(b"/abc"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(matches!(
            Qid::pattern("(unclosed"),
            Err(PatternError::Syntax(_))
        ));
        assert!(matches!(
            Pattern::new(Bytes::from_static(&[0xFF, 0xFE])),
            Err(PatternError::NotUtf8)
        ));
    }

    #[test]
    fn patterns_compare_by_source() {
        let a = Qid::pattern("/room/.*").unwrap();
        let b = Qid::pattern("/room/.*").unwrap();
        let c = Qid::pattern("/chan/.*").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        // A literal never equals a pattern with the same text.
        assert_ne!(Qid::literal("/room/.*"), a);
    }
}
