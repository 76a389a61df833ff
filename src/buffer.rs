//! Accumulation of raw bytes into newline-terminated lines.

/// Holds bytes read from a file until a complete line is available.
///
/// Lines are split strictly on `\n`. Nothing else is stripped, so a `\r` before
/// the delimiter and any surrounding whitespace stay part of the line. Bytes
/// after the last delimiter are kept until a later [`append`] completes them.
///
/// [`append`]: LineBuffer::append
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Removes and returns every complete line, without its delimiter.
    ///
    /// The unterminated suffix, if any, stays buffered.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        let end = match self.buf.iter().rposition(|&b| b == b'\n') {
            Some(idx) => idx + 1,
            None => return Vec::new(),
        };

        let complete: Vec<u8> = self.buf.drain(..end).collect();

        // `complete` ends with a delimiter, so the last split is always empty.
        let mut lines: Vec<Vec<u8>> = complete.split(|&b| b == b'\n').map(<[u8]>::to_vec).collect();
        lines.pop();
        lines
    }

    /// Takes the unterminated suffix, treating the end of the stream as its
    /// delimiter.
    pub fn take_partial(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }

    /// Number of buffered bytes not yet part of a complete line.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
