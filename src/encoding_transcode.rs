//! Transcoding of declared source encodings into valid UTF-8.

use bytes::BytesMut;
use encoding_rs::{CoderResult, Encoding};
use tracing::debug;

use crate::config::ConfigError;

const BUFFER_SIZE: usize = 4096;

// BOM unicode character (U+FEFF) expressed in utf-8
// http://unicode.org/faq/utf_bom.html#bom4
const BOM_UTF8: &[u8] = b"\xef\xbb\xbf";
const BOM_UTF8_LEN: usize = BOM_UTF8.len();

/// A resolved source charset.
///
/// Resolution happens once at registration; assemblers spawned from the
/// same configuration copy the resolved value instead of re-parsing the
/// label.
#[derive(Clone, Copy, Debug)]
pub enum Charset {
    /// A charset known to the encoding engine.
    Encoded(&'static Encoding),
    /// `ASCII-8BIT`/`BINARY`: bytes pass through, anything outside ASCII
    /// becomes a replacement character.
    Binary,
}

impl Charset {
    /// Resolves a charset label.
    pub fn resolve(label: &str) -> Result<Self, ConfigError> {
        if label.eq_ignore_ascii_case("ASCII-8BIT") || label.eq_ignore_ascii_case("BINARY") {
            return Ok(Self::Binary);
        }
        Encoding::for_label(label.as_bytes())
            .map(Self::Encoded)
            .ok_or_else(|| ConfigError::UnknownCharset {
                charset: label.to_string(),
            })
    }
}

/// Streaming transcoder from one declared source encoding to UTF-8.
///
/// Malformed input never fails: invalid sequences come out as U+FFFD
/// replacement characters. An incomplete multi-byte sequence at the end of
/// one call is held back and prepended to the next call's input, so chunk
/// boundaries cannot corrupt multi-byte characters.
pub struct Transcoder {
    inner: Inner,
}

enum Inner {
    Stream {
        decoder: encoding_rs::Decoder,
        scratch: Box<[u8; BUFFER_SIZE]>,
        output: BytesMut,
    },
    Binary,
}

impl Transcoder {
    /// Creates a transcoder for the resolved charset.
    pub fn new(charset: Charset) -> Self {
        let inner = match charset {
            // BOM sequences may appear later than the start of the stream
            // (e.g. when several files are concatenated upstream), so BOM
            // handling stays out of the decoder and is applied per output
            // below.
            Charset::Encoded(encoding) => Inner::Stream {
                decoder: encoding.new_decoder_without_bom_handling(),
                scratch: Box::new([0; BUFFER_SIZE]),
                output: BytesMut::new(),
            },
            Charset::Binary => Inner::Binary,
        };
        Self { inner }
    }

    /// Converts `input` to valid UTF-8.
    pub fn decode_to_utf8(&mut self, input: &[u8]) -> String {
        match &mut self.inner {
            Inner::Stream {
                decoder,
                scratch,
                output,
            } => {
                let mut total_read = 0;
                let mut had_errors = false;

                loop {
                    let (result, read, written, errors) = decoder.decode_to_utf8(
                        &input[total_read..],
                        scratch.as_mut_slice(),
                        false, // not last: the stream continues
                    );
                    total_read += read;
                    had_errors |= errors;
                    output.extend_from_slice(&scratch[..written]);

                    match result {
                        CoderResult::InputEmpty => break,
                        CoderResult::OutputFull => (),
                    }
                }

                if had_errors {
                    debug!(
                        message = "Replaced malformed character sequences.",
                        encoding = decoder.encoding().name(),
                    );
                }

                let produced = output.split();
                // All input is UTF-8 by now, so a leading BOM shows up as
                // its UTF-8 byte sequence and can be dropped centrally here
                // rather than in every downstream consumer.
                let produced = if produced.get(..BOM_UTF8_LEN) == Some(BOM_UTF8) {
                    debug!(
                        message = "Removed byte order mark.",
                        encoding = decoder.encoding().name(),
                    );
                    &produced[BOM_UTF8_LEN..]
                } else {
                    &produced[..]
                };
                String::from_utf8_lossy(produced).into_owned()
            }
            Inner::Binary => input
                .iter()
                .map(|&b| {
                    if b.is_ascii() {
                        b as char
                    } else {
                        char::REPLACEMENT_CHARACTER
                    }
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for Transcoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match &self.inner {
            Inner::Stream { decoder, .. } => decoder.encoding().name(),
            Inner::Binary => "ASCII-8BIT",
        };
        f.debug_struct("Transcoder").field("encoding", &name).finish()
    }
}
