//! Buffer chunks and their line-start tables.
//!
//! A `StringBuffer` is the fundamental storage unit: a run of UTF-8 text
//! plus the byte offsets at which each of its lines begins. Piece-tree
//! nodes never own text; they describe `(buffer, start, end)` windows into
//! these chunks. Buffer 0 of a tree is the mutable append buffer; all
//! other chunks are immutable once created.

use memchr::memchr2_iter;

/// A `{line, column}` cursor relative to one buffer's own line-start
/// table. Both fields are 0-based; `column` is a byte offset within the
/// line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferCursor {
    pub line: usize,
    pub column: usize,
}

impl BufferCursor {
    pub fn new(line: usize, column: usize) -> Self {
        BufferCursor { line, column }
    }
}

/// The two line terminators the buffer can be normalized to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOfLine {
    Lf,
    CrLf,
}

impl EndOfLine {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndOfLine::Lf => "\n",
            EndOfLine::CrLf => "\r\n",
        }
    }

    /// Byte length of the terminator.
    pub fn len(&self) -> usize {
        self.as_str().len()
    }
}

/// A chunk of text and the byte offset of every line start inside it.
/// `line_starts[0]` is always 0; a `\r\n` pair counts as a single break.
#[derive(Debug, Clone)]
pub struct StringBuffer {
    pub buffer: String,
    pub line_starts: Vec<usize>,
}

impl StringBuffer {
    pub fn new(buffer: String) -> Self {
        let line_starts = create_line_starts(&buffer);
        StringBuffer {
            buffer,
            line_starts,
        }
    }

    /// Construct with a precomputed table. The caller guarantees the table
    /// matches the text; the tree relies on it for every line query.
    pub fn with_line_starts(buffer: String, line_starts: Vec<usize>) -> Self {
        StringBuffer {
            buffer,
            line_starts,
        }
    }

    /// Number of line breaks in the chunk.
    pub fn line_feed_count(&self) -> usize {
        self.line_starts.len() - 1
    }
}

/// Scan `text` and return the offsets of all line starts, treating `\r\n`,
/// lone `\r`, and lone `\n` as breaks.
pub fn create_line_starts(text: &str) -> Vec<usize> {
    let bytes = text.as_bytes();
    let mut line_starts = vec![0];
    // memchr2 yields every \r and \n; the consumed \n of a \r\n pair is
    // skipped via `skip`.
    let mut skip = usize::MAX;
    for i in memchr2_iter(b'\r', b'\n', bytes) {
        if i == skip {
            continue;
        }
        if bytes[i] == b'\r' {
            if bytes.get(i + 1) == Some(&b'\n') {
                line_starts.push(i + 2);
                skip = i + 1;
            } else {
                line_starts.push(i + 1);
            }
        } else {
            line_starts.push(i + 1);
        }
    }
    line_starts
}

/// Line-start scan that also tallies which terminators occur, for the
/// builder's EOL election.
#[derive(Debug, Default)]
pub struct LineStartScan {
    pub line_starts: Vec<usize>,
    pub cr: usize,
    pub lf: usize,
    pub crlf: usize,
}

pub fn analyze_line_starts(text: &str) -> LineStartScan {
    let bytes = text.as_bytes();
    let mut scan = LineStartScan {
        line_starts: vec![0],
        ..Default::default()
    };
    let mut skip = usize::MAX;
    for i in memchr2_iter(b'\r', b'\n', bytes) {
        if i == skip {
            continue;
        }
        if bytes[i] == b'\r' {
            if bytes.get(i + 1) == Some(&b'\n') {
                scan.crlf += 1;
                scan.line_starts.push(i + 2);
                skip = i + 1;
            } else {
                scan.cr += 1;
                scan.line_starts.push(i + 1);
            }
        } else {
            scan.lf += 1;
            scan.line_starts.push(i + 1);
        }
    }
    scan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_starts_unix() {
        assert_eq!(create_line_starts("a\nb\nc"), vec![0, 2, 4]);
    }

    #[test]
    fn test_line_starts_crlf_is_one_break() {
        assert_eq!(create_line_starts("ab\r\ncd"), vec![0, 4]);
    }

    #[test]
    fn test_line_starts_lone_cr() {
        assert_eq!(create_line_starts("a\rb"), vec![0, 2]);
    }

    #[test]
    fn test_line_starts_mixed() {
        // \r\n, \n, \r in one chunk
        assert_eq!(create_line_starts("a\r\nb\nc\rd"), vec![0, 3, 5, 7]);
    }

    #[test]
    fn test_line_starts_trailing_break() {
        assert_eq!(create_line_starts("a\n"), vec![0, 2]);
        assert_eq!(create_line_starts(""), vec![0]);
    }

    #[test]
    fn test_analyze_counts_terminators() {
        let scan = analyze_line_starts("a\r\nb\nc\rd\r\n");
        assert_eq!(scan.crlf, 2);
        assert_eq!(scan.lf, 1);
        assert_eq!(scan.cr, 1);
        assert_eq!(scan.line_starts, vec![0, 3, 5, 7, 10]);
    }

    #[test]
    fn test_string_buffer_line_feed_count() {
        let buf = StringBuffer::new("x\ny\nz".to_string());
        assert_eq!(buf.line_feed_count(), 2);
    }
}
