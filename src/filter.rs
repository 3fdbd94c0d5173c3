use anyhow::{Context, Result};
use glob::Pattern as GlobPattern;

/// Include / exclude glob patterns for recursive transfers.
///
/// A pattern matches when it matches either the whole relative path
/// (`logs/app.log`) or just the file name (`app.log`). `*` also crosses
/// `/`, so `logs/*` covers everything below `logs`.
#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    include: Vec<GlobPattern>,
    exclude: Vec<GlobPattern>,
}

impl NameFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Whether `relative_path` (forward slashes) should be transferred.
    ///
    /// With include patterns a path must match one of them; an exclude
    /// match always wins.
    pub fn matches(&self, relative_path: &str) -> bool {
        let relative_path = relative_path.replace('\\', "/");
        let name = relative_path.rsplit('/').next().unwrap_or(&relative_path);
        let hit = |p: &GlobPattern| p.matches(&relative_path) || p.matches(name);

        if !self.include.is_empty() && !self.include.iter().any(hit) {
            return false;
        }
        !self.exclude.iter().any(hit)
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

fn compile(patterns: &[String]) -> Result<Vec<GlobPattern>> {
    patterns
        .iter()
        .map(|p| GlobPattern::new(p).with_context(|| format!("Invalid glob pattern '{}'", p)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(include: &[&str], exclude: &[&str]) -> NameFilter {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        NameFilter::new(&owned(include), &owned(exclude)).unwrap()
    }

    #[test]
    fn test_no_patterns_pass_everything() {
        let f = filter(&[], &[]);
        assert!(f.is_empty());
        assert!(f.matches("a.txt"));
        assert!(f.matches("deep/dir/b.bin"));
    }

    #[test]
    fn test_include_limits_files() {
        let f = filter(&["*.log"], &[]);
        assert!(f.matches("app.log"));
        assert!(f.matches("logs/app.log"));
        assert!(!f.matches("app.txt"));

        let f = filter(&["logs/*"], &[]);
        assert!(f.matches("logs/app.log"));
        assert!(f.matches("logs/2024/app.log"));
        assert!(!f.matches("other/app.log"));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let f = filter(&["*.txt"], &["test_*.txt"]);
        assert!(f.matches("file.txt"));
        assert!(!f.matches("test_file.txt"));
        assert!(!f.matches("sub/test_file.txt"));
        assert!(!f.matches("file.bin"));
    }

    #[test]
    fn test_exclude_only() {
        let f = filter(&[], &["*.tmp", ".git/*"]);
        assert!(f.matches("a.txt"));
        assert!(!f.matches("cache/a.tmp"));
        assert!(!f.matches(".git/HEAD"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = NameFilter::new(&["[".to_string()], &[]).unwrap_err();
        assert!(err.to_string().contains("Invalid glob pattern"));
    }
}
