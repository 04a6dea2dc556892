//! Last-writer-wins conflict resolution.
//!
//! Precedence for an incoming row against the local copy with the same key
//! (an identical copy is left alone before any of this applies):
//! 1. no local row: insert (a racing insert of the same key is a no-op)
//! 2. local `updated_at` strictly newer: keep local
//! 3. incoming strictly newer: overwrite
//! 4. exact tie: the lexicographically larger node identity wins
//!
//! Every node evaluates the same comparison, so all replicas pick the same
//! winner regardless of delivery order.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;

/// Outcome of resolving one incoming row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// No local row existed; the incoming row was inserted.
    Insert,
    /// Incoming row was newer and replaced the local one.
    Overwrite,
    /// Local row was newer and was kept.
    KeepLocal,
    /// Equal timestamps; the source node's identity sorts higher.
    TieOverwrite,
    /// Equal timestamps; the local node's identity sorts higher.
    TieKeepLocal,
    /// The incoming row is identical to the local copy; nothing to do.
    Unchanged,
}

impl Resolution {
    /// Whether the incoming values end up in the store.
    pub fn writes_incoming(&self) -> bool {
        matches!(
            self,
            Resolution::Insert | Resolution::Overwrite | Resolution::TieOverwrite
        )
    }

    /// Whether the local and incoming versions competed.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Resolution::KeepLocal | Resolution::TieOverwrite | Resolution::TieKeepLocal
        )
    }
}

/// Decides between the local and incoming versions of a row.
pub fn resolve(
    local_changed_at: Option<DateTime<Utc>>,
    incoming_changed_at: DateTime<Utc>,
    local_node: &str,
    source_node: &str,
) -> Resolution {
    let Some(local) = local_changed_at else {
        return Resolution::Insert;
    };

    match local.cmp(&incoming_changed_at) {
        Ordering::Greater => Resolution::KeepLocal,
        Ordering::Less => Resolution::Overwrite,
        Ordering::Equal => {
            if local_node > source_node {
                Resolution::TieKeepLocal
            } else {
                Resolution::TieOverwrite
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_missing_local_row_inserts() {
        assert_eq!(resolve(None, at(100), "aaa", "zzz"), Resolution::Insert);
        assert_eq!(resolve(None, at(100), "zzz", "aaa"), Resolution::Insert);
    }

    #[test]
    fn test_newer_local_always_kept() {
        // Identity order must not matter when timestamps differ.
        assert_eq!(resolve(Some(at(300)), at(200), "aaa", "zzz"), Resolution::KeepLocal);
        assert_eq!(resolve(Some(at(300)), at(200), "zzz", "aaa"), Resolution::KeepLocal);
    }

    #[test]
    fn test_newer_incoming_always_overwrites() {
        assert_eq!(resolve(Some(at(100)), at(200), "aaa", "zzz"), Resolution::Overwrite);
        assert_eq!(resolve(Some(at(100)), at(200), "zzz", "aaa"), Resolution::Overwrite);
    }

    #[test]
    fn test_tie_larger_identity_wins() {
        // Node "aaa" receiving from "zzz": the peer wins.
        assert_eq!(
            resolve(Some(at(200)), at(200), "aaa", "zzz"),
            Resolution::TieOverwrite
        );
        // Node "zzz" receiving from "aaa": local wins.
        assert_eq!(
            resolve(Some(at(200)), at(200), "zzz", "aaa"),
            Resolution::TieKeepLocal
        );
    }

    #[test]
    fn test_tie_break_is_symmetric() {
        // Whichever side applies, the version of the larger identity survives.
        let on_a = resolve(Some(at(50)), at(50), "node-a", "node-b");
        let on_b = resolve(Some(at(50)), at(50), "node-b", "node-a");
        assert!(on_a.writes_incoming());
        assert!(!on_b.writes_incoming());
    }

    #[test]
    fn test_conflict_classification() {
        assert!(!Resolution::Insert.is_conflict());
        assert!(!Resolution::Overwrite.is_conflict());
        assert!(Resolution::KeepLocal.is_conflict());
        assert!(Resolution::TieOverwrite.is_conflict());
        assert!(Resolution::TieKeepLocal.is_conflict());
        assert!(!Resolution::Unchanged.is_conflict());
        assert!(!Resolution::Unchanged.writes_incoming());
    }
}
