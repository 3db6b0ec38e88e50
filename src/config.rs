//! User-facing configuration of the multiline codec.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use snafu::{ResultExt, Snafu};

use crate::assembler::Assembler;
use crate::encoding_transcode::Charset;
use crate::pattern::LineMatcher;

/// An error raised while registering a codec configuration.
///
/// All of these are fatal: a codec with a configuration that does not
/// compile never processes a single line.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// The continuation pattern did not compile.
    #[snafu(display("pattern {:?} is not a valid regex: {}", pattern, source))]
    InvalidPattern {
        /// The offending pattern, after sub-pattern expansion.
        pattern: String,
        /// The underlying regex error.
        source: regex::Error,
    },

    /// The pattern referenced a name absent from the sub-pattern library.
    #[snafu(display("unknown pattern reference %{{{}}}", name))]
    UnknownPatternReference {
        /// The unresolved name.
        name: String,
    },

    /// Sub-pattern references did not bottom out; the library almost
    /// certainly contains a reference cycle.
    #[snafu(display("sub-pattern expansion of {:?} did not terminate", pattern))]
    PatternExpansionLoop {
        /// The pattern whose expansion looped.
        pattern: String,
    },

    /// A configured pattern directory could not be read.
    #[snafu(display("failed reading patterns from {}: {}", path.display(), source))]
    PatternsDir {
        /// The directory or file that failed.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The declared charset is not a known encoding label.
    #[snafu(display("unknown charset {:?}", charset))]
    UnknownCharset {
        /// The unrecognized label.
        charset: String,
    },

    /// The line delimiter must contain at least one byte.
    #[snafu(display("delimiter must not be empty"))]
    EmptyDelimiter,

    /// The sequencer would never emit a valid value.
    #[snafu(display(
        "sequencer_start ({}) must be less than sequencer_rollover ({})",
        start,
        rollover
    ))]
    SequencerBounds {
        /// Configured start value.
        start: i64,
        /// Configured rollover bound.
        rollover: i64,
    },

    /// Auto-flush and eviction timers are driven by Tokio; registering a
    /// timed codec outside a runtime cannot work.
    #[snafu(display("timers require a running Tokio runtime: {}", source))]
    NoRuntime {
        /// The runtime lookup failure.
        source: tokio::runtime::TryCurrentError,
    },
}

/// Which neighbor a matching line belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum What {
    /// A matching line is a continuation of the previous line.
    Previous,
    /// A matching line announces that the next line belongs to it.
    Next,
}

/// Configuration of the multiline codec.
///
/// Immutable after registration; spawned per-identity assemblers share one
/// `Arc` of it.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MultilineConfig {
    /// Regular expression deciding whether a line continues a record.
    /// May reference named sub-patterns as `%{NAME}`.
    pub pattern: String,

    /// Continuation direction.
    ///
    /// This setting must be configured in conjunction with `pattern`.
    pub what: What,

    /// Inverts the continuation predicate.
    #[serde(default)]
    pub negate: bool,

    /// Extra directories to load named sub-patterns from.
    #[serde(default)]
    pub patterns_dir: Vec<PathBuf>,

    /// Encoding of the incoming bytes.
    ///
    /// `ASCII-8BIT` passes bytes through, substituting a replacement
    /// character for anything outside ASCII.
    #[serde(default = "default_charset")]
    pub charset: String,

    /// Line terminator, also used to re-join buffered lines on emission.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,

    /// Tag applied to events merged from more than one line.
    ///
    /// Set to `""` to suppress the tag.
    #[serde(default = "default_multiline_tag")]
    pub multiline_tag: String,

    /// Maximum number of lines buffered for one record before a forced
    /// flush.
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,

    /// Maximum number of buffered bytes for one record before a forced
    /// flush.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: ByteSize,

    /// Quiet-period interval after which a pending record is flushed even
    /// though no terminating line has arrived.
    ///
    /// Unset disables the auto-flush timer.
    #[serde_as(as = "Option<serde_with::DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    pub auto_flush_interval: Option<Duration>,

    /// Stamp each emitted record with a per-assembler sequence number.
    #[serde(default)]
    pub sequencer_enabled: bool,

    /// Field name the sequence number is emitted under.
    #[serde(default = "default_sequencer_field")]
    pub sequencer_field: String,

    /// First sequence value, and the value wrapped to on rollover.
    #[serde(default = "default_sequencer_start")]
    pub sequencer_start: i64,

    /// Exclusive upper bound of the sequence; never emitted itself.
    #[serde(default = "default_sequencer_rollover")]
    pub sequencer_rollover: i64,
}

fn default_charset() -> String {
    "UTF-8".to_string()
}

fn default_delimiter() -> String {
    "\n".to_string()
}

fn default_multiline_tag() -> String {
    "multiline".to_string()
}

const fn default_max_lines() -> usize {
    500
}

fn default_max_bytes() -> ByteSize {
    ByteSize::mib(10)
}

fn default_sequencer_field() -> String {
    "seq".to_string()
}

const fn default_sequencer_start() -> i64 {
    1
}

const fn default_sequencer_rollover() -> i64 {
    100_000
}

impl MultilineConfig {
    /// Creates a configuration with the given pattern and direction, all
    /// other options at their defaults.
    pub fn new(pattern: impl Into<String>, what: What) -> Self {
        Self {
            pattern: pattern.into(),
            what,
            negate: false,
            patterns_dir: Vec::new(),
            charset: default_charset(),
            delimiter: default_delimiter(),
            multiline_tag: default_multiline_tag(),
            max_lines: default_max_lines(),
            max_bytes: default_max_bytes(),
            auto_flush_interval: None,
            sequencer_enabled: false,
            sequencer_field: default_sequencer_field(),
            sequencer_start: default_sequencer_start(),
            sequencer_rollover: default_sequencer_rollover(),
        }
    }

    /// Registers the configuration: compiles the pattern against the
    /// sub-pattern library, resolves the charset, and builds a ready
    /// [`Assembler`].
    ///
    /// When `auto_flush_interval` is set, this must be called within a Tokio
    /// runtime so the quiet-period timer has somewhere to run.
    pub fn build(&self) -> Result<Assembler, ConfigError> {
        self.validate()?;
        let matcher = Arc::new(LineMatcher::compile(&self.pattern, &self.patterns_dir)?);
        let charset = Charset::resolve(&self.charset)?;
        let runtime = self
            .auto_flush_interval
            .map(|_| tokio::runtime::Handle::try_current().context(NoRuntimeSnafu))
            .transpose()?;
        Ok(Assembler::from_parts(
            Arc::new(self.clone()),
            matcher,
            charset,
            runtime,
        ))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.delimiter.is_empty() {
            return Err(ConfigError::EmptyDelimiter);
        }
        if self.sequencer_start >= self.sequencer_rollover {
            return Err(ConfigError::SequencerBounds {
                start: self.sequencer_start,
                rollover: self.sequencer_rollover,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let config: MultilineConfig =
            serde_json::from_str(r#"{"pattern": "^\\s", "what": "previous"}"#).unwrap();
        assert_eq!(config.what, What::Previous);
        assert!(!config.negate);
        assert_eq!(config.delimiter, "\n");
        assert_eq!(config.multiline_tag, "multiline");
        assert_eq!(config.max_lines, 500);
        assert_eq!(config.max_bytes, ByteSize::mib(10));
        assert_eq!(config.auto_flush_interval, None);
        assert_eq!(config.sequencer_rollover, 100_000);
    }

    #[test]
    fn parses_human_byte_sizes_and_fractional_intervals() {
        let config: MultilineConfig = serde_json::from_str(
            r#"{
                "pattern": "^-",
                "what": "previous",
                "max_bytes": "2mb",
                "auto_flush_interval": 0.5
            }"#,
        )
        .unwrap();
        assert_eq!(config.max_bytes, ByteSize::mb(2));
        assert_eq!(config.auto_flush_interval, Some(Duration::from_millis(500)));
    }

    #[test]
    fn rejects_contradictory_sequencer_bounds() {
        let mut config = MultilineConfig::new("^\\s", What::Previous);
        config.sequencer_enabled = true;
        config.sequencer_start = 10;
        config.sequencer_rollover = 10;
        assert!(matches!(
            config.build(),
            Err(ConfigError::SequencerBounds { .. })
        ));
    }

    #[test]
    fn rejects_empty_delimiter() {
        let mut config = MultilineConfig::new("^\\s", What::Previous);
        config.delimiter = String::new();
        assert!(matches!(config.build(), Err(ConfigError::EmptyDelimiter)));
    }

    #[test]
    fn rejects_bad_pattern() {
        let config = MultilineConfig::new("([unclosed", What::Previous);
        assert!(matches!(
            config.build(),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }
}
