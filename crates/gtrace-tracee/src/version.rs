/// Version of the Go toolchain that built the target.
///
/// Some runtime structures move between versions; the tracer currently only
/// consults the version for the TLS offset of the routine descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoVersion {
    /// Development builds compare newer than every release.
    devel: bool,

    major: u32,
    minor: u32,
    patch: u32,
}

impl GoVersion {
    /// Parses strings of the form `go1.11` / `go1.11.4`; `devel`-prefixed
    /// strings denote a development build.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.starts_with("devel") {
            return Some(Self {
                devel: true,
                major: 0,
                minor: 0,
                patch: 0,
            });
        }

        let rest = raw.strip_prefix("go")?;
        let mut numbers = rest.split('.');

        let major = numbers.next()?.parse().ok()?;
        let minor = numbers.next().and_then(|n| n.parse().ok()).unwrap_or(0);
        let patch = numbers.next().and_then(|n| n.parse().ok()).unwrap_or(0);

        Some(Self {
            devel: false,
            major,
            minor,
            patch,
        })
    }

    /// The assumption when no version can be determined: a current toolchain.
    pub fn newest() -> Self {
        Self {
            devel: true,
            major: 0,
            minor: 0,
            patch: 0,
        }
    }

    /// Whether this version is `major.minor` or newer (patch releases
    /// ignored).
    pub fn later_than(self, major: u32, minor: u32) -> bool {
        self.devel || (self.major, self.minor) >= (major, minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_release_strings() {
        let v = GoVersion::parse("go1.11.4").unwrap();
        assert!(v.later_than(1, 11));
        assert!(!v.later_than(1, 12));

        let v = GoVersion::parse("go1.9").unwrap();
        assert!(v.later_than(1, 9));
        assert!(!v.later_than(1, 10));
    }

    #[test]
    fn devel_builds_are_newest() {
        let v = GoVersion::parse("devel +8bcebb1 Wed Aug 1 00:00:00 2018").unwrap();
        assert!(v.later_than(1, 11));
        assert!(GoVersion::newest().later_than(99, 0));
    }

    #[test]
    fn rejects_garbage() {
        assert!(GoVersion::parse("1.11").is_none());
        assert!(GoVersion::parse("gox").is_none());
    }
}
