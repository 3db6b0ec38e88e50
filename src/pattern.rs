//! Continuation pattern compilation against a named sub-pattern library.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use snafu::ResultExt;
use tracing::warn;

use crate::config::{ConfigError, InvalidPatternSnafu, PatternsDirSnafu};

/// Core sub-patterns available without any `patterns_dir` configured.
///
/// Definitions may reference each other; they are expanded the same way as
/// user patterns.
const BUILT_IN_PATTERNS: &[(&str, &str)] = &[
    ("INT", r"[+-]?\d+"),
    ("BASE10NUM", r"[+-]?(?:\d+(?:\.\d+)?|\.\d+)"),
    ("NUMBER", r"%{BASE10NUM}"),
    ("WORD", r"\b\w+\b"),
    ("NOTSPACE", r"\S+"),
    ("SPACE", r"\s*"),
    ("DATA", r".*?"),
    ("GREEDYDATA", r".*"),
    ("YEAR", r"(?:\d\d){1,2}"),
    ("MONTHNUM", r"0?[1-9]|1[0-2]"),
    ("MONTHDAY", r"0[1-9]|[12]\d|3[01]|[1-9]"),
    ("HOUR", r"2[0123]|[01]?\d"),
    ("MINUTE", r"[0-5]\d"),
    ("SECOND", r"(?:[0-5]?\d|60)(?:[:.,]\d+)?"),
    ("ISO8601_TIMEZONE", r"Z|[+-](?:2[0123]|[01]?\d)(?::?[0-5]\d)?"),
    (
        "TIMESTAMP_ISO8601",
        r"%{YEAR}-%{MONTHNUM}-%{MONTHDAY}[T ]%{HOUR}:?%{MINUTE}(?::?%{SECOND})?%{ISO8601_TIMEZONE}?",
    ),
    (
        "LOGLEVEL",
        r"[Tt]race|TRACE|[Dd]ebug|DEBUG|[Ii]nfo|INFO|[Nn]otice|NOTICE|[Ww]arn(?:ing)?|WARN(?:ING)?|[Ee]rr(?:or)?|ERR(?:OR)?|[Cc]rit(?:ical)?|CRIT(?:ICAL)?|[Ff]atal|FATAL",
    ),
];

/// A reference bottoms out within this many substitution rounds unless the
/// library contains a cycle.
const MAX_EXPANSION_ROUNDS: usize = 16;

/// A compiled continuation predicate.
///
/// Matching is match-anywhere (the engine's unanchored search) and performs
/// no allocation beyond what the regex engine requires, so it is safe on
/// the per-line hot path. The matcher itself is immutable and can be shared
/// across every assembler spawned from one configuration.
#[derive(Debug)]
pub struct LineMatcher {
    regex: Regex,
}

impl LineMatcher {
    /// Expands `%{NAME}` references against the built-in library plus any
    /// pattern files found in `dirs`, then compiles the result.
    pub fn compile(pattern: &str, dirs: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut library: HashMap<String, String> = BUILT_IN_PATTERNS
            .iter()
            .map(|(name, def)| (name.to_string(), def.to_string()))
            .collect();
        for dir in dirs {
            load_pattern_dir(&mut library, dir)?;
        }

        let expanded = expand(pattern, &library)?;
        let regex = Regex::new(&expanded).context(InvalidPatternSnafu {
            pattern: expanded.clone(),
        })?;
        Ok(Self { regex })
    }

    /// Tests whether the pattern matches anywhere in `line`.
    ///
    /// The caller applies `negate`; the matcher reports the raw result.
    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }
}

/// Loads `NAME definition` lines from every regular file in `dir`.
///
/// Blank lines and `#` comments are skipped. Later definitions shadow
/// earlier ones, including the built-ins.
fn load_pattern_dir(
    library: &mut HashMap<String, String>,
    dir: &Path,
) -> Result<(), ConfigError> {
    let entries = std::fs::read_dir(dir).context(PatternsDirSnafu { path: dir })?;
    for entry in entries {
        let entry = entry.context(PatternsDirSnafu { path: dir })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let contents = std::fs::read_to_string(&path).context(PatternsDirSnafu { path: &path })?;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(|c: char| c.is_whitespace()) {
                Some((name, definition)) if !definition.trim().is_empty() => {
                    library.insert(name.to_string(), definition.trim().to_string());
                }
                _ => {
                    warn!(
                        message = "Skipping malformed pattern definition.",
                        file = %path.display(),
                        line,
                    );
                }
            }
        }
    }
    Ok(())
}

fn reference_regex() -> &'static Regex {
    static REFERENCE: OnceLock<Regex> = OnceLock::new();
    REFERENCE.get_or_init(|| {
        Regex::new(r"%\{\w+(?::[^}]*)?\}").expect("reference syntax is a fixed regex")
    })
}

/// Substitutes `%{NAME}` (and `%{NAME:field}`, whose field part is ignored)
/// with the named definition wrapped in a non-capturing group, repeating
/// until no references remain.
fn expand(pattern: &str, library: &HashMap<String, String>) -> Result<String, ConfigError> {
    let mut current = pattern.to_string();
    for _ in 0..MAX_EXPANSION_ROUNDS {
        if !current.contains("%{") {
            return Ok(current);
        }
        let mut next = String::with_capacity(current.len());
        let mut tail = 0;
        for reference in reference_regex().find_iter(&current) {
            let body = &current[reference.start() + 2..reference.end() - 1];
            let name = body.split(':').next().unwrap_or(body);
            let definition =
                library
                    .get(name)
                    .ok_or_else(|| ConfigError::UnknownPatternReference {
                        name: name.to_string(),
                    })?;
            next.push_str(&current[tail..reference.start()]);
            next.push_str("(?:");
            next.push_str(definition);
            next.push(')');
            tail = reference.end();
        }
        next.push_str(&current[tail..]);
        current = next;
    }

    Err(ConfigError::PatternExpansionLoop {
        pattern: pattern.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn temp_pattern_dir(files: &[(&str, &str)]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "multiline-patterns-{}-{:p}",
            std::process::id(),
            &files
        ));
        std::fs::create_dir_all(&dir).unwrap();
        for (name, contents) in files {
            std::fs::write(dir.join(name), contents).unwrap();
        }
        dir
    }

    #[test]
    fn plain_regex_matches_anywhere() {
        let matcher = LineMatcher::compile(r"\\$", &[]).unwrap();
        assert!(matcher.is_match("continued \\"));
        assert!(!matcher.is_match("complete line"));
    }

    #[test]
    fn built_in_references_expand() {
        let matcher = LineMatcher::compile(r"^%{TIMESTAMP_ISO8601}", &[]).unwrap();
        assert!(matcher.is_match("2024-03-01 12:34:56 start of record"));
        assert!(matcher.is_match("2024-03-01T12:34:56.789Z start of record"));
        assert!(!matcher.is_match("    at com.example.Main(Main.java:42)"));
    }

    #[test]
    fn nested_references_expand() {
        let matcher = LineMatcher::compile(r"^%{NUMBER} ", &[]).unwrap();
        assert!(matcher.is_match("12.5 duration"));
    }

    #[test]
    fn semantic_suffix_is_ignored() {
        let matcher = LineMatcher::compile(r"^%{LOGLEVEL:level}", &[]).unwrap();
        assert!(matcher.is_match("ERROR boom"));
    }

    #[test]
    fn unknown_reference_is_fatal() {
        let result = LineMatcher::compile(r"^%{NO_SUCH_PATTERN}", &[]);
        assert!(matches!(
            result,
            Err(ConfigError::UnknownPatternReference { name }) if name == "NO_SUCH_PATTERN"
        ));
    }

    #[test]
    fn directory_patterns_extend_the_library() {
        let dir = temp_pattern_dir(&[(
            "app",
            "# application patterns\nREQID req-[0-9a-f]{8}\n\nBANNER ^=== %{REQID} ===\n",
        )]);
        let matcher = LineMatcher::compile(r"%{BANNER}", std::slice::from_ref(&dir)).unwrap();
        assert!(matcher.is_match("=== req-deadbeef ==="));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn reference_cycles_are_detected() {
        let dir = temp_pattern_dir(&[("loop", "LOOP %{LOOP}\n")]);
        let result = LineMatcher::compile(r"%{LOOP}", std::slice::from_ref(&dir));
        assert!(matches!(
            result,
            Err(ConfigError::PatternExpansionLoop { .. })
        ));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_directory_is_fatal() {
        let result = LineMatcher::compile(
            r"^x",
            &[PathBuf::from("/nonexistent/multiline-patterns")],
        );
        assert!(matches!(result, Err(ConfigError::PatternsDir { .. })));
    }
}
