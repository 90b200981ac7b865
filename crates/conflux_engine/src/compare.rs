//! The format/compare service consumed by the mapping table.

use conflux_protocol::{Change, Cmp, MemberId};

/// Compares record content and manages record identity.
///
/// The engine treats payloads as opaque; this service decides whether two
/// changes denote the same logical item, whether their content agrees, and
/// how to mint a new identity during a history split.
pub trait ChangeFormat: Send {
    /// Compares two changes.
    fn compare(&self, a: &Change, b: &Change) -> Cmp;

    /// Elevates the change's uid to the next unique-candidate form.
    ///
    /// Returns false if no further elevation is possible; the caller then
    /// aborts the split for this item.
    fn elevate_identity(&self, change: &mut Change) -> bool;

    /// Returns true if the change's uid is unused on the given member.
    fn is_identity_unique(&self, member: MemberId, change: &Change) -> bool {
        let _ = (member, change);
        true
    }
}

/// Default format: identity by uid, content by payload bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct EqualityFormat;

impl ChangeFormat for EqualityFormat {
    fn compare(&self, a: &Change, b: &Change) -> Cmp {
        if a.uid != b.uid {
            return Cmp::Mismatch;
        }
        let same_content = match (a.is_deletion(), b.is_deletion()) {
            (true, true) => true,
            (false, false) => a.payload == b.payload,
            _ => false,
        };
        if same_content {
            Cmp::Same
        } else {
            Cmp::Similar
        }
    }

    fn elevate_identity(&self, change: &mut Change) -> bool {
        // uid, uid~1, uid~2, ...
        let (base, level) = match change.uid.rsplit_once('~') {
            Some((base, n)) => match n.parse::<u32>() {
                Ok(level) => (base.to_string(), level),
                Err(_) => (change.uid.clone(), 0),
            },
            None => (change.uid.clone(), 0),
        };
        change.uid = format!("{}~{}", base, level + 1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_protocol::ChangeKind;

    #[test]
    fn equality_compare() {
        let fmt = EqualityFormat;
        let a = Change::new("u1", ChangeKind::Modified, vec![1]);
        let same = Change::new("u1", ChangeKind::Added, vec![1]);
        let similar = Change::new("u1", ChangeKind::Modified, vec![2]);
        let other = Change::new("u2", ChangeKind::Modified, vec![1]);

        assert_eq!(fmt.compare(&a, &same), Cmp::Same);
        assert_eq!(fmt.compare(&a, &similar), Cmp::Similar);
        assert_eq!(fmt.compare(&a, &other), Cmp::Mismatch);
    }

    #[test]
    fn deletions_compare_by_uid() {
        let fmt = EqualityFormat;
        let live = Change::new("u1", ChangeKind::Modified, vec![1]);
        let gone = Change::deleted("u1");
        let gone_too = Change::deleted("u1");

        assert_eq!(fmt.compare(&gone, &gone_too), Cmp::Same);
        assert_eq!(fmt.compare(&live, &gone), Cmp::Similar);
    }

    #[test]
    fn elevation_levels() {
        let fmt = EqualityFormat;
        let mut c = Change::deleted("record");
        assert!(fmt.elevate_identity(&mut c));
        assert_eq!(c.uid, "record~1");
        assert!(fmt.elevate_identity(&mut c));
        assert_eq!(c.uid, "record~2");
    }
}
