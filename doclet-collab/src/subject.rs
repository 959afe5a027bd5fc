//! Broker subject naming.
//!
//! ```text
//! <namespace>.documents.<document_id>.<class>
//!    doclet  .documents.   7f3c…    .updates
//! ```
//!
//! Subscriptions replace the document id with `*` to receive one event
//! class for every document. Characters that NATS treats as separators or
//! wildcards are replaced by `_` in the document token, so every document
//! maps to exactly one token. The event itself still carries the real id.

use std::borrow::Cow;

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "doclet";

/// Token used in place of a missing or blank document id.
pub const UNKNOWN_DOCUMENT: &str = "unknown";

/// Event classes, one subject per class and document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Updates,
    Presence,
    Snapshots,
}

impl EventClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Updates => "updates",
            Self::Presence => "presence",
            Self::Snapshots => "snapshots",
        }
    }
}

impl std::fmt::Display for EventClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subject for one document and event class.
pub fn for_document(namespace: &str, document_id: &str, class: EventClass) -> String {
    let token = document_token(document_id);
    format!("{namespace}.documents.{token}.{class}")
}

/// Single subject token for `document_id`.
pub fn document_token(document_id: &str) -> Cow<'_, str> {
    let trimmed = document_id.trim();
    if trimmed.is_empty() {
        Cow::Borrowed(UNKNOWN_DOCUMENT)
    } else if trimmed.contains(is_reserved) {
        Cow::Owned(trimmed.replace(is_reserved, "_"))
    } else {
        Cow::Borrowed(trimmed)
    }
}

fn is_reserved(c: char) -> bool {
    matches!(c, '.' | '*' | '>') || c.is_whitespace()
}

/// Wildcard subject matching `class` for every document.
pub fn wildcard(namespace: &str, class: EventClass) -> String {
    format!("{namespace}.documents.*.{class}")
}

/// NATS-style subject matching.
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_for_document() {
        assert_eq!(
            for_document("doclet", "doc-1", EventClass::Updates),
            "doclet.documents.doc-1.updates"
        );
        assert_eq!(
            for_document("doclet", "doc-1", EventClass::Presence),
            "doclet.documents.doc-1.presence"
        );
        assert_eq!(
            for_document("acme", "doc-1", EventClass::Snapshots),
            "acme.documents.doc-1.snapshots"
        );
    }

    #[test]
    fn test_blank_document_uses_sentinel() {
        assert_eq!(
            for_document("doclet", "", EventClass::Updates),
            "doclet.documents.unknown.updates"
        );
        assert_eq!(
            for_document("doclet", "   ", EventClass::Snapshots),
            "doclet.documents.unknown.snapshots"
        );
        assert_eq!(
            for_document("doclet", "  doc-2 ", EventClass::Presence),
            "doclet.documents.doc-2.presence"
        );
    }

    #[test]
    fn test_reserved_characters_stay_in_one_token() {
        assert_eq!(
            for_document("doclet", "team.notes", EventClass::Updates),
            "doclet.documents.team_notes.updates"
        );
        assert_eq!(document_token("a*b>c"), "a_b_c");
        assert_eq!(document_token(" my doc\tv2 "), "my_doc_v2");
        assert!(matches!(document_token("doc-1"), Cow::Borrowed("doc-1")));

        let pattern = wildcard("doclet", EventClass::Updates);
        for id in ["team.notes", "*", ">", "a.b.c", "two words"] {
            let subject = for_document("doclet", id, EventClass::Updates);
            assert!(matches(&pattern, &subject), "{id} -> {subject}");
        }
    }

    #[test]
    fn test_wildcard() {
        assert_eq!(wildcard("doclet", EventClass::Updates), "doclet.documents.*.updates");
    }

    #[test]
    fn test_matches_single_token_wildcard() {
        let pattern = wildcard("doclet", EventClass::Updates);
        assert!(matches(&pattern, "doclet.documents.doc-1.updates"));
        assert!(!matches(&pattern, "doclet.documents.doc-1.presence"));
        assert!(!matches(&pattern, "doclet.documents.updates"));
        assert!(!matches(&pattern, "doclet.documents.a.b.updates"));
        assert!(!matches(&pattern, "other.documents.doc-1.updates"));
    }

    #[test]
    fn test_matches_tail_wildcard() {
        assert!(matches("doclet.>", "doclet.documents.doc-1.updates"));
        assert!(!matches("doclet.>", "doclet"));
        assert!(matches(">", "anything.at.all"));
    }

    #[test]
    fn test_matches_literal() {
        assert!(matches("a.b.c", "a.b.c"));
        assert!(!matches("a.b.c", "a.b"));
        assert!(!matches("a.b", "a.b.c"));
    }
}
