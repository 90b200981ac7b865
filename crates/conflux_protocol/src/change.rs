//! Change records and comparison outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one member (data source) within a group.
///
/// Ids are assigned by registration order and are stable for the lifetime
/// of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(pub u32);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member-{}", self.0)
    }
}

/// The kind of modification a change describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// The member reported the record but has not classified it yet.
    Unknown,
    /// The record is new on this member.
    Added,
    /// The record exists and its content changed.
    Modified,
    /// The record was deleted on this member.
    Deleted,
    /// The record exists and is unchanged (reported during slow sync).
    Unmodified,
}

impl ChangeKind {
    /// Returns true if the kind has been classified by the member.
    pub fn is_known(&self) -> bool {
        !matches!(self, ChangeKind::Unknown)
    }

    /// Returns true if the record actually changed on the member.
    ///
    /// Unmodified records (reported during slow sync) and unclassified
    /// ones never participate in conflict detection.
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            ChangeKind::Added | ChangeKind::Modified | ChangeKind::Deleted
        )
    }
}

/// One record's current state as reported by a member.
///
/// The payload is opaque to the engine; only the comparison service
/// interprets it. A deleted record carries no payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Record identity within the member's uid space.
    pub uid: String,
    /// The kind of modification.
    pub kind: ChangeKind,
    /// Object type name (e.g. "contact", "event"), if known.
    pub objtype: Option<String>,
    /// Format name of the payload, if known.
    pub format: Option<String>,
    /// Opaque record content. `None` when only change info was reported
    /// or the record is deleted.
    pub payload: Option<Vec<u8>>,
}

impl Change {
    /// Creates a change with content.
    pub fn new(uid: impl Into<String>, kind: ChangeKind, payload: Vec<u8>) -> Self {
        Self {
            uid: uid.into(),
            kind,
            objtype: None,
            format: None,
            payload: Some(payload),
        }
    }

    /// Creates a change carrying only change info (no content yet).
    pub fn info(uid: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            uid: uid.into(),
            kind,
            objtype: None,
            format: None,
            payload: None,
        }
    }

    /// Creates a deletion record.
    pub fn deleted(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            kind: ChangeKind::Deleted,
            objtype: None,
            format: None,
            payload: None,
        }
    }

    /// Sets the object type.
    pub fn with_objtype(mut self, objtype: impl Into<String>) -> Self {
        self.objtype = Some(objtype.into());
        self
    }

    /// Sets the payload format name.
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Returns true if this change describes a deletion.
    pub fn is_deletion(&self) -> bool {
        self.kind == ChangeKind::Deleted
    }

    /// Returns true if the change carries content, or is a deletion
    /// (which needs none).
    pub fn has_data(&self) -> bool {
        self.payload.is_some() || self.is_deletion()
    }
}

/// Outcome of comparing two changes.
///
/// `Same` and `Similar` both mean the changes denote the same logical
/// item; only `Same` means their content agrees. `Mismatch` means the
/// changes denote different items and must not share a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    /// Same item, equal content.
    Same,
    /// Same item, conflicting content.
    Similar,
    /// Different items.
    Mismatch,
}

impl Cmp {
    /// Returns true if the two changes may share a mapping.
    pub fn correlates(&self) -> bool {
        !matches!(self, Cmp::Mismatch)
    }
}
