//! Delimiter framing of raw byte chunks into lines.

use bytes::{Buf, Bytes, BytesMut};
use memchr::memmem;
use smallvec::SmallVec;
use tokio_util::codec::Decoder;

/// Splits an arbitrary chunked byte stream on a configured delimiter.
///
/// The tokenizer owns the residue between chunks: bytes after the last
/// delimiter are retained and prepended to the next chunk, so lines split
/// across network reads or file-tail batches come out whole. The residue is
/// only surfaced by [`LineTokenizer::flush`], the terminal drain.
///
/// Yielded lines do not include the delimiter. The stream is reconstructed
/// exactly by appending the delimiter to every yielded line and the residue
/// at the end.
#[derive(Debug)]
pub struct LineTokenizer {
    finder: memmem::Finder<'static>,
    delimiter_len: usize,
    residue: BytesMut,
}

impl LineTokenizer {
    /// Creates a tokenizer splitting on `delimiter`.
    ///
    /// Multi-byte delimiters (e.g. `\r\n`) are supported; the empty
    /// delimiter is rejected at configuration time.
    pub fn new(delimiter: &[u8]) -> Self {
        Self {
            finder: memmem::Finder::new(delimiter).into_owned(),
            delimiter_len: delimiter.len(),
            residue: BytesMut::new(),
        }
    }

    /// Appends `chunk` to the residue and returns every complete line.
    pub fn extract(&mut self, chunk: &[u8]) -> SmallVec<[Bytes; 4]> {
        self.residue.extend_from_slice(chunk);
        let mut lines = SmallVec::new();
        while let Some(idx) = self.finder.find(&self.residue) {
            let line = self.residue.split_to(idx).freeze();
            self.residue.advance(self.delimiter_len);
            lines.push(line);
        }
        lines
    }

    /// Drains and returns the residue, which may be empty.
    pub fn flush(&mut self) -> Bytes {
        self.residue.split().freeze()
    }

    /// Number of bytes currently held as residue.
    pub fn residue_len(&self) -> usize {
        self.residue.len()
    }
}

/// Adapter for driving the tokenizer from a framed stream; the buffer is
/// caller-owned here, unlike [`LineTokenizer::extract`].
impl Decoder for LineTokenizer {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        match self.finder.find(buf) {
            None => Ok(None),
            Some(idx) => {
                let frame = buf.split_to(idx).freeze();
                buf.advance(self.delimiter_len);
                Ok(Some(frame))
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if buf.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(buf.split_to(buf.len()).freeze()))
                }
            }
        }
    }
}
