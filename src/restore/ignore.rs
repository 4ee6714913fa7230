//! Path patterns for restore ignore lists and include filters.

/// A list of manifest path patterns.
///
/// A pattern matches a path when it is equal to it, when it ends in `*` and the
/// path starts with what precedes the star, or when the path lies below it as a
/// directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathMatcher {
    patterns: Vec<String>,
}

impl PathMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| p.as_ref().trim().replace('\\', "/"))
            .filter(|p| !p.is_empty())
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| pattern_matches(p, path))
    }
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        return path.starts_with(prefix);
    }
    if path == pattern {
        return true;
    }
    let dir = pattern.trim_end_matches('/');
    !dir.is_empty()
        && path
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_star() {
        let m = PathMatcher::new(["data/config.yml", "external/kemu/rms/save*"]);
        assert!(m.matches("data/config.yml"));
        assert!(!m.matches("data/config.yml.bak"));
        assert!(m.matches("external/kemu/rms/save1"));
        assert!(m.matches("external/kemu/rms/saves/slot"));
        assert!(!m.matches("external/kemu/rms/other"));
    }

    #[test]
    fn test_directory_prefix_needs_boundary() {
        let m = PathMatcher::new(["external/kemu/config/"]);
        assert!(m.matches("external/kemu/config/system.cfg"));
        assert!(!m.matches("external/kemu/configs/x"));

        let m = PathMatcher::new(["external/kemu"]);
        assert!(m.matches("external/kemu/rms/a"));
        assert!(!m.matches("external/kemu2/rms/a"));
    }

    #[test]
    fn test_blank_patterns_match_nothing() {
        let m = PathMatcher::new(["", "  ", "/"]);
        assert!(!m.matches("data/config.yml"));
        assert!(PathMatcher::new(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn test_backslashes_are_normalized() {
        let m = PathMatcher::new([r"external\kemu\rms"]);
        assert!(m.matches("external/kemu/rms/slot"));
    }
}
