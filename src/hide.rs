use glob::Pattern;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use tracing::{debug, warn};

pub const DEFAULT_HIDE_LIST: &str = "__pycache__:node_modules:.git:.cache:.svn:.hg:.tox";

#[derive(Debug, Clone)]
struct HideRule {
    source: String,
    pattern: Option<Pattern>,
}

/// Glob rules applied to each path segment; one matching segment hides the path.
#[derive(Debug, Clone, Default)]
pub struct HideRules {
    rules: Vec<HideRule>,
}

impl HideRules {
    /// Parses a `:`-delimited pattern list. Empty entries are skipped.
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(':').filter(|p| !p.is_empty()))
    }

    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rules = patterns
            .into_iter()
            .map(|source| {
                let source = source.into();
                let pattern = match Pattern::new(&source) {
                    Ok(pattern) => Some(pattern),
                    Err(err) => {
                        warn!(pattern = %source, error = %err, "invalid hide pattern, it will never match");
                        None
                    }
                };
                HideRule { source, pattern }
            })
            .collect();
        Self { rules }
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.source.as_str())
    }

    /// Returns the first rule matching any segment of `path`.
    pub fn matching_rule(&self, path: &OsStr) -> Option<&str> {
        for segment in path.as_bytes().split(|b| *b == b'/') {
            if segment.is_empty() {
                continue;
            }
            // Non UTF-8 names are matched lossily; the replacement char never
            // matches a literal, only wildcards.
            let segment = String::from_utf8_lossy(segment);
            for rule in &self.rules {
                if let Some(pattern) = &rule.pattern
                    && pattern.matches(&segment)
                {
                    debug!(
                        path = %path.to_string_lossy(),
                        segment = %segment,
                        rule = %rule.source,
                        "hidden"
                    );
                    return Some(&rule.source);
                }
            }
        }
        None
    }

    pub fn is_hidden(&self, path: &OsStr) -> bool {
        self.matching_rule(path).is_some()
    }
}
