//! Read/write access rights.

use std::fmt;

/// A set of access rights. `READ_WRITE` is the union of `READ` and `WRITE`.
///
/// Rights form a lattice ordered by inclusion. A future may be converted into
/// one whose rights are a subset of its own, and write access may always
/// downgrade to read-only.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Access(u8);

impl Access {
    pub const NONE: Access = Access(0);
    pub const READ: Access = Access(0b01);
    pub const WRITE: Access = Access(0b10);
    pub const READ_WRITE: Access = Access(0b11);

    #[inline]
    pub const fn contains(self, other: Access) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn is_subset_of(self, other: Access) -> bool {
        other.contains(self)
    }

    /// Whether a claim holding `self` may be handed over as `requested`.
    #[inline]
    pub const fn permits(self, requested: Access) -> bool {
        requested.is_subset_of(self) || (requested.0 == Access::READ.0 && self.writes())
    }

    #[inline]
    pub const fn union(self, other: Access) -> Access {
        Access(self.0 | other.0)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn reads(self) -> bool {
        self.contains(Access::READ)
    }

    #[inline]
    pub const fn writes(self) -> bool {
        self.contains(Access::WRITE)
    }
}

impl std::ops::BitOr for Access {
    type Output = Access;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Access::NONE => "none",
            Access::READ => "read",
            Access::WRITE => "write",
            _ => "read-write",
        })
    }
}

impl fmt::Debug for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Access({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::Access;

    #[test]
    fn subset_relation_follows_inclusion() {
        assert!(Access::READ.is_subset_of(Access::READ_WRITE));
        assert!(Access::WRITE.is_subset_of(Access::READ_WRITE));
        assert!(Access::READ_WRITE.is_subset_of(Access::READ_WRITE));
        assert!(!Access::READ_WRITE.is_subset_of(Access::READ));
        assert!(!Access::WRITE.is_subset_of(Access::READ));
        assert!(Access::NONE.is_subset_of(Access::READ));
        assert_eq!(Access::READ | Access::WRITE, Access::READ_WRITE);
    }

    #[test]
    fn writers_may_downgrade_to_read() {
        assert!(Access::WRITE.permits(Access::READ));
        assert!(Access::WRITE.permits(Access::WRITE));
        assert!(Access::READ_WRITE.permits(Access::READ));
        assert!(!Access::WRITE.permits(Access::READ_WRITE));
        assert!(!Access::READ.permits(Access::WRITE));
        assert!(!Access::READ.permits(Access::READ_WRITE));
    }

    #[test]
    fn display_names() {
        assert_eq!(Access::READ.to_string(), "read");
        assert_eq!(Access::READ_WRITE.to_string(), "read-write");
    }
}
