//! Rule ownership tags.
//!
//! Every rule this crate installs carries a comment of the form
//! `Stormshadow:<suid>:<timestamp>:<purpose>[:NOT_DELETE]`. The tag is the
//! only thing cleanup trusts when deciding whether a rule belongs to a
//! session. A trailing `NOT_DELETE` marks a rule that session cleanup and
//! stale reconciliation must leave in place.

use serde::Serialize;
use std::fmt;

use crate::session::Suid;

/// Namespace prefix of every tag.
pub const TAG_NAMESPACE: &str = "Stormshadow";

/// Jump from a main chain into an isolated chain.
pub const PURPOSE_ANCHOR: &str = "anchor";
/// Divert attack traffic to the packet queue.
pub const PURPOSE_DIVERT: &str = "divert";
/// DNAT replies to spoofed sources back to a reachable receiver.
pub const PURPOSE_RETURN: &str = "return";

/// Trailing field of a preserved rule.
pub const PRESERVE_MARKER: &str = "NOT_DELETE";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TagError {
    #[error("tag purpose must be non-empty")]
    EmptyPurpose,
    #[error("tag purpose '{0}' contains characters outside [A-Za-z0-9_.-]")]
    InvalidPurpose(String),
}

/// Parsed ownership tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RuleTag {
    pub suid: Suid,
    pub timestamp: u64,
    pub purpose: String,
    /// Survives session cleanup and reconciliation.
    pub preserve: bool,
}

impl RuleTag {
    pub fn new(suid: Suid, timestamp: u64, purpose: &str) -> Result<Self, TagError> {
        if purpose.is_empty() {
            return Err(TagError::EmptyPurpose);
        }
        if !purpose.chars().all(is_purpose_char) {
            return Err(TagError::InvalidPurpose(purpose.to_string()));
        }
        Ok(Self {
            suid,
            timestamp,
            purpose: purpose.to_string(),
            preserve: false,
        })
    }

    pub fn preserved(mut self) -> Self {
        self.preserve = true;
        self
    }

    /// Whether this tag belongs to `suid`.
    pub fn is_owned_by(&self, suid: &Suid) -> bool {
        &self.suid == suid
    }
}

impl fmt::Display for RuleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            TAG_NAMESPACE, self.suid, self.timestamp, self.purpose
        )?;
        if self.preserve {
            write!(f, ":{}", PRESERVE_MARKER)?;
        }
        Ok(())
    }
}

fn is_purpose_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

/// Format a tag. Characters a purpose may not hold are replaced by `_`,
/// so the result always parses back.
pub fn make_tag(suid: &Suid, timestamp: u64, purpose: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        TAG_NAMESPACE,
        suid,
        timestamp,
        sanitize_purpose(purpose)
    )
}

/// Like [`make_tag`], with the `NOT_DELETE` marker appended.
pub fn make_preserved_tag(suid: &Suid, timestamp: u64, purpose: &str) -> String {
    format!("{}:{}", make_tag(suid, timestamp, purpose), PRESERVE_MARKER)
}

fn sanitize_purpose(purpose: &str) -> String {
    if purpose.is_empty() {
        return "_".to_string();
    }
    purpose
        .chars()
        .map(|c| if is_purpose_char(c) { c } else { '_' })
        .collect()
}

/// Parse a rule comment. Accepts the bare tag as well as the forms packet
/// filters print it in (`"..."` and `/* ... */`). Anything else is `None`.
pub fn parse_tag(comment: &str) -> Option<RuleTag> {
    let mut text = comment.trim();
    if let Some(inner) = text
        .strip_prefix("/*")
        .and_then(|t| t.strip_suffix("*/"))
    {
        text = inner.trim();
    }
    if let Some(inner) = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
    {
        text = inner;
    }

    let mut fields = text.split(':');
    if fields.next()? != TAG_NAMESPACE {
        return None;
    }
    let suid = Suid::parse(fields.next()?)?;
    let ts_field = fields.next()?;
    if ts_field.is_empty() || !ts_field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let timestamp = ts_field.parse::<u64>().ok()?;
    let purpose = fields.next()?;
    let preserve = match fields.next() {
        None => false,
        Some(PRESERVE_MARKER) => true,
        Some(_) => return None,
    };
    if fields.next().is_some() {
        return None;
    }

    let tag = RuleTag::new(suid, timestamp, purpose).ok()?;
    Some(if preserve { tag.preserved() } else { tag })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suid(s: &str) -> Suid {
        Suid::parse(s).unwrap()
    }

    #[test]
    fn test_make_tag_format() {
        assert_eq!(
            make_tag(&suid("abc123"), 1_700_000_000, PURPOSE_DIVERT),
            "Stormshadow:abc123:1700000000:divert"
        );
    }

    #[test]
    fn test_round_trip() {
        for (s, ts, purpose) in [
            ("abc123", 0u64, PURPOSE_ANCHOR),
            ("deadbeef0001", 1_700_000_000, PURPOSE_DIVERT),
            ("lab-run_7", u64::MAX, PURPOSE_RETURN),
            ("x", 42, "custom.v2"),
        ] {
            let tag = make_tag(&suid(s), ts, purpose);
            let parsed = parse_tag(&tag).expect("own tag must parse");
            assert_eq!(parsed, RuleTag::new(suid(s), ts, purpose).unwrap());
            assert_eq!(parsed.to_string(), tag);
        }
    }

    #[test]
    fn test_parse_rendered_forms() {
        let expected = RuleTag::new(suid("abc123"), 17, PURPOSE_DIVERT).unwrap();
        assert_eq!(
            parse_tag("\"Stormshadow:abc123:17:divert\""),
            Some(expected.clone())
        );
        assert_eq!(
            parse_tag("/* Stormshadow:abc123:17:divert */"),
            Some(expected)
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for comment in [
            "",
            "Stormshadow",
            "Stormshadow:abc123",
            "Stormshadow:abc123:17",
            "Stormshadow:abc123:17:",
            "Stormshadow::17:divert",
            "Stormshadow:abc123:seventeen:divert",
            "Stormshadow:abc123:-17:divert",
            "Stormshadow:abc123:17:divert:extra",
            "Stormshadow:abc123:17:divert:NOT_DELETE:extra",
            "Stormshadow:abc123:17:divert:not_delete",
            "Stormshadow:abc123:17:divert:",
            "stormshadow:abc123:17:divert",
            "Other:abc123:17:divert",
            "Drop blocked IPv4",
            "Stormshadow:abc 123:17:divert",
            "Stormshadow:abc123:99999999999999999999999:divert",
        ] {
            assert_eq!(parse_tag(comment), None, "accepted {:?}", comment);
        }
    }

    #[test]
    fn test_new_rejects_bad_purpose() {
        assert_eq!(
            RuleTag::new(suid("a"), 1, ""),
            Err(TagError::EmptyPurpose)
        );
        assert!(matches!(
            RuleTag::new(suid("a"), 1, "has:colon"),
            Err(TagError::InvalidPurpose(_))
        ));
    }

    #[test]
    fn test_make_tag_sanitizes_purpose() {
        let tag = make_tag(&suid("a"), 1, "bad:purpose here");
        assert_eq!(parse_tag(&tag).unwrap().purpose, "bad_purpose_here");
    }

    #[test]
    fn test_preserved_round_trip() {
        let tag = make_preserved_tag(&suid("abc123"), 17, PURPOSE_ANCHOR);
        assert_eq!(tag, "Stormshadow:abc123:17:anchor:NOT_DELETE");

        let parsed = parse_tag(&tag).unwrap();
        assert!(parsed.preserve);
        assert_eq!(parsed.purpose, PURPOSE_ANCHOR);
        assert_eq!(parsed.to_string(), tag);

        let rendered = parse_tag("/* Stormshadow:abc123:17:divert:NOT_DELETE */").unwrap();
        assert!(rendered.preserve);
        assert!(!parse_tag("Stormshadow:abc123:17:divert").unwrap().preserve);
    }

    #[test]
    fn test_ownership() {
        let tag = parse_tag("Stormshadow:abc123:1:divert").unwrap();
        assert!(tag.is_owned_by(&suid("abc123")));
        assert!(!tag.is_owned_by(&suid("abc124")));
    }
}
