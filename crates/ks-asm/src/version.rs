//! Engine version value type.

use core::cmp::Ordering;
use core::fmt;

/// `(major, minor)` engine version, ordered by major then minor.
///
/// ```
/// use ks_asm::Version;
///
/// assert!(ks_asm::version() > Version::new(0, 0));
/// assert_eq!(Version::new(3, 1).compare_to(&Version::new(3, 2)), -1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Version {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
}

impl Version {
    /// Engine version reported by [`version`](crate::version).
    pub const CURRENT: Version = Version::new(0, 9);

    /// Create a version.
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Three-way comparison: `-1`, `0` or `1`.
    #[must_use]
    pub fn compare_to(&self, other: &Version) -> i32 {
        match self.cmp(other) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    /// Native packed form, `major << 8 | minor`.
    #[must_use]
    pub fn packed(&self) -> u32 {
        (self.major << 8) | (self.minor & 0xFF)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_major_then_minor() {
        let v = Version::new(3, 1);
        assert_eq!(v.compare_to(&Version::new(3, 2)), -1);
        assert_eq!(v.compare_to(&Version::new(3, 0)), 1);
        assert_eq!(v.compare_to(&Version::new(2, 9)), 1);
        assert_eq!(v.compare_to(&Version::new(4, 0)), -1);
        assert_eq!(v.compare_to(&v), 0);
    }

    #[test]
    fn current_is_newer_than_zero() {
        assert_eq!(Version::CURRENT.compare_to(&Version::new(0, 0)), 1);
        assert_eq!(Version::CURRENT.packed(), 0x0009);
        assert_eq!(format!("{}", Version::CURRENT), "0.9");
    }
}
