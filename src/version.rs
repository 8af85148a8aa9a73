use crate::error::invalid_argument;
use crate::{Error, Result};
use std::fmt::Display;
use std::str::FromStr;

/// A four-field semantic version attached to every exported symbol.
///
/// The `build` field ranks pre-release snapshots that share the same
/// `major.minor.patch` triple; it takes part in compatibility checks but is
/// omitted from the rendered form when zero.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u64,
}

impl Version {
    /// Creates a version with a zero build number.
    #[inline]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            build: 0,
        }
    }

    /// Creates a version including the build number.
    #[inline]
    pub const fn new_full(major: u32, minor: u32, patch: u32, build: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            build,
        }
    }

    /// Returns true if a symbol provided at version `self` satisfies a
    /// request for `required`.
    ///
    /// The major numbers must match exactly; the remaining fields of the
    /// provider must be lexicographically at least those of the request.
    #[inline]
    pub fn is_compatible_with(&self, required: &Version) -> bool {
        self.major == required.major
            && (self.minor, self.patch, self.build)
                >= (required.minor, required.patch, required.build)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.build != 0 {
            write!(f, "+{}", self.build)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (core, build) = match s.split_once('+') {
            Some((core, build)) => (core, build.parse::<u64>().ok()),
            None => (s, Some(0)),
        };
        let build = build.ok_or_else(|| invalid_argument(format!("bad build number in `{s}`")))?;
        let mut fields = core.split('.');
        let mut next = |what: &str| {
            fields
                .next()
                .and_then(|v| v.parse::<u32>().ok())
                .ok_or_else(|| invalid_argument(format!("bad {what} number in `{s}`")))
        };
        let version = Version {
            major: next("major")?,
            minor: next("minor")?,
            patch: next("patch")?,
            build,
        };
        if fields.next().is_some() {
            return Err(invalid_argument(format!("trailing version fields in `{s}`")));
        }
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatibility() {
        let provided = Version::new(2, 3, 0);
        assert!(provided.is_compatible_with(&Version::new(2, 0, 0)));
        assert!(provided.is_compatible_with(&Version::new(2, 3, 0)));
        assert!(!provided.is_compatible_with(&Version::new(2, 4, 0)));
        assert!(!provided.is_compatible_with(&Version::new(1, 0, 0)));
        assert!(!provided.is_compatible_with(&Version::new(3, 0, 0)));

        // Build numbers rank snapshots of the same patch level.
        let snapshot = Version::new_full(1, 2, 3, 7);
        assert!(snapshot.is_compatible_with(&Version::new_full(1, 2, 3, 5)));
        assert!(!snapshot.is_compatible_with(&Version::new_full(1, 2, 3, 9)));
        assert!(snapshot.is_compatible_with(&Version::new(1, 0, 9)));
    }

    #[test]
    fn parse_and_render() {
        let v: Version = "1.2.3".parse().unwrap();
        assert_eq!(v, Version::new(1, 2, 3));
        assert_eq!(v.to_string(), "1.2.3");

        let v: Version = "0.10.2+44".parse().unwrap();
        assert_eq!(v, Version::new_full(0, 10, 2, 44));
        assert_eq!(v.to_string(), "0.10.2+44");

        assert!("1.2".parse::<Version>().is_err());
        assert!("1.2.3.4".parse::<Version>().is_err());
        assert!("1.2.x".parse::<Version>().is_err());
        assert!("1.2.3+x".parse::<Version>().is_err());
    }
}
