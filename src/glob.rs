//! Glob matching for repo names, topics and revision names.
//!
//! Patterns are translated into anchored regular expressions:
//! `*` matches within one path segment, `**` matches across segments,
//! `?` matches one non-separator character and `{a,b}` is an alternation.
//! Character classes (`[abc]`) pass through unchanged. Wildcards never
//! match a leading `.` in a segment, so `acme/*` skips `acme/.github`.

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid glob pattern '{pattern}': {source}")]
pub struct GlobError {
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

/// A compiled list of globs; a candidate matches when any glob matches.
#[derive(Debug, Clone, Default)]
pub struct GlobSet {
    patterns: Vec<Regex>,
}

impl GlobSet {
    /// Compile every pattern, failing on the first invalid one.
    pub fn new<I, S>(patterns: I) -> Result<Self, GlobError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                Regex::new(&glob_to_regex(pattern)).map_err(|source| GlobError {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Compile patterns lowercased, for case-insensitive inputs such as topics.
    pub fn new_lowercase<I, S>(patterns: I) -> Result<Self, GlobError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(patterns.into_iter().map(|p| p.as_ref().to_lowercase()))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(candidate))
    }

    /// Keep the candidates that match, preserving input order.
    pub fn filter<'a, I>(&self, candidates: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        candidates
            .into_iter()
            .filter(|candidate| self.is_match(candidate))
            .cloned()
            .collect()
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut result = String::with_capacity(glob.len() * 2 + 2);
    result.push('^');

    let mut chars = glob.chars().peekable();
    let mut brace_depth = 0usize;
    let mut in_class = false;
    let mut segment_start = true;

    while let Some(c) = chars.next() {
        if in_class {
            if c == ']' {
                in_class = false;
            }
            if c == '\\' {
                result.push_str("\\\\");
            } else {
                result.push(c);
            }
            continue;
        }

        let at_start = segment_start;
        segment_start = false;
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**/` also matches zero directories
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        if at_start {
                            result.push_str("(?:[^/.][^/]*/)*");
                        } else {
                            result.push_str("(?:.*/)?");
                        }
                        segment_start = true;
                    } else if at_start {
                        result.push_str("(?:[^/.][^/]*(?:/[^/.][^/]*)*)?");
                    } else {
                        result.push_str(".*");
                    }
                } else if at_start && chars.peek() == Some(&'.') {
                    // An empty match would leave the segment starting with a dot.
                    result.push_str("[^/.][^/]*");
                } else if at_start {
                    result.push_str("(?:[^/.][^/]*)?");
                } else {
                    result.push_str("[^/]*");
                }
            }
            '?' if at_start => result.push_str("[^/.]"),
            '?' => result.push_str("[^/]"),
            '[' => {
                in_class = true;
                result.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    result.push('^');
                }
            }
            '{' => {
                brace_depth += 1;
                result.push_str("(?:");
                segment_start = at_start;
            }
            '}' if brace_depth > 0 => {
                brace_depth -= 1;
                result.push(')');
            }
            ',' if brace_depth > 0 => result.push('|'),
            '\\' => {
                if let Some(next) = chars.next() {
                    result.push_str(&regex::escape(&next.to_string()));
                }
            }
            '/' => {
                result.push('/');
                segment_start = true;
            }
            other => result.push_str(&regex::escape(&other.to_string())),
        }
    }

    result.push('$');
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(patterns: &[&str]) -> GlobSet {
        GlobSet::new(patterns.iter().copied()).unwrap()
    }

    #[test]
    fn single_star_stays_within_segment() {
        let globs = set(&["org/PROJ/*"]);
        assert!(globs.is_match("org/PROJ/api"));
        assert!(!globs.is_match("org/PROJ/api/nested"));
        assert!(!globs.is_match("org/OTHER/api"));
    }

    #[test]
    fn double_star_crosses_segments() {
        let globs = set(&["org/**"]);
        assert!(globs.is_match("org/a/b/c"));
        assert!(set(&["**/archive-*"]).is_match("archive-2020"));
        assert!(set(&["**/archive-*"]).is_match("group/sub/archive-2020"));
    }

    #[test]
    fn wildcards_skip_dot_segments() {
        let globs = set(&["acme/*"]);
        assert!(globs.is_match("acme/api"));
        assert!(!globs.is_match("acme/.github"));
        assert!(!set(&["acme/?github"]).is_match("acme/.github"));
        assert!(!set(&["*.rs"]).is_match(".rs"));
        assert!(!set(&["**/config"]).is_match("acme/.hidden/config"));
        assert!(set(&["**/config"]).is_match("acme/visible/config"));
        // A literal dot still matches.
        assert!(set(&["acme/.github"]).is_match("acme/.github"));
        assert!(set(&["acme/.*"]).is_match("acme/.github"));
    }

    #[test]
    fn braces_and_question_marks() {
        let globs = set(&["release-{v1,v2}.?"]);
        assert!(globs.is_match("release-v1.0"));
        assert!(globs.is_match("release-v2.9"));
        assert!(!globs.is_match("release-v3.0"));
        assert!(!globs.is_match("release-v1.10"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let globs = set(&["my.repo+name"]);
        assert!(globs.is_match("my.repo+name"));
        assert!(!globs.is_match("myxrepo+name"));
    }

    #[test]
    fn character_classes() {
        assert!(set(&["v[0-9]*"]).is_match("v1.2"));
        assert!(!set(&["v[!0-9]*"]).is_match("v1.2"));
    }

    #[test]
    fn lowercase_sets_and_filter() {
        let topics = GlobSet::new_lowercase(["Deprecated*"]).unwrap();
        assert!(topics.is_match("deprecated-api"));

        let branches = set(&["main", "release/*"]);
        let all = vec![
            "main".to_string(),
            "dev".to_string(),
            "release/1.0".to_string(),
        ];
        assert_eq!(branches.filter(&all), vec!["main", "release/1.0"]);
    }

    #[test]
    fn empty_set_matches_nothing() {
        let globs = GlobSet::default();
        assert!(globs.is_empty());
        assert!(!globs.is_match("anything"));
    }
}
