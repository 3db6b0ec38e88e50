//! Reassembly of multiline log records from raw byte streams.
//!
//! Log-producing applications frequently spread one logical record over
//! several physical lines (stack traces, wrapped messages, continuation
//! markers). This crate turns a stream of raw text fragments back into
//! whole records:
//!
//! - [`Assembler`] is the pattern-driven state machine that joins
//!   consecutive lines into merged events, subject to line/byte bounds and
//!   an optional quiet-period auto-flush timer.
//! - [`IdentityMapCodec`] fans a single configuration out over many
//!   interleaved streams, owning one isolated assembler per stream
//!   identity with capacity enforcement and timed eviction of idle
//!   streams.
//!
//! Bytes flow through a delimiter [`framing::LineTokenizer`], a charset
//! [`encoding_transcode::Transcoder`], and the continuation
//! [`pattern::LineMatcher`] before reaching the assembler's pending
//! buffer. Merged events leave through an [`EventSink`] carried by an
//! [`EmissionContext`].

#![deny(missing_docs)]
#![deny(unreachable_pub)]

pub mod assembler;
pub mod auto_flush;
pub mod config;
pub mod encoding_transcode;
pub mod event;
pub mod framing;
pub mod identity_map;
pub(crate) mod internal_events;
pub mod map_cleaner;
pub mod pattern;
pub mod sink;

pub use assembler::Assembler;
pub use config::{ConfigError, MultilineConfig, What};
pub use event::MergedEvent;
pub use identity_map::{CapacityExceeded, IdentityMapBuilder, IdentityMapCodec};
pub use sink::{EmissionContext, EventSink, Listener};

/// Catch-all error type for anything crossing the sink boundary.
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;
