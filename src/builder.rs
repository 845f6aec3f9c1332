//! Incremental construction of a [`PieceTreeBuffer`] from streamed chunks.
//!
//! Chunks arrive in any sizes (file reads rarely align with line breaks),
//! so a chunk ending in `\r` is held back: only the next chunk tells
//! whether it belongs to a `\r\n`. The builder also strips a UTF-8 BOM
//! from the first chunk and tallies terminator styles so the factory can
//! pick the document's end-of-line convention.

use tracing::debug;

use crate::buffer::{analyze_line_starts, EndOfLine, StringBuffer};
use crate::tree_buffer::PieceTreeBuffer;

const UTF8_BOM: char = '\u{FEFF}';

#[derive(Default)]
pub struct PieceTreeBuilder {
    chunks: Vec<StringBuffer>,
    bom: String,
    has_previous_cr: bool,
    cr: usize,
    lf: usize,
    crlf: usize,
}

impl PieceTreeBuilder {
    pub fn new() -> Self {
        PieceTreeBuilder::default()
    }

    pub fn accept_chunk(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }

        let mut chunk = chunk;
        if self.chunks.is_empty() && !self.has_previous_cr {
            if let Some(rest) = chunk.strip_prefix(UTF8_BOM) {
                self.bom = UTF8_BOM.to_string();
                chunk = rest;
            }
        }

        if chunk.as_bytes().last() == Some(&b'\r') {
            // hold the \r back until we know whether a \n follows
            self.accept_whole_chunk(&chunk[..chunk.len() - 1]);
            self.has_previous_cr = true;
        } else {
            self.accept_whole_chunk(chunk);
            self.has_previous_cr = false;
        }
    }

    fn accept_whole_chunk(&mut self, chunk: &str) {
        let text = if self.has_previous_cr {
            self.has_previous_cr = false;
            let mut text = String::with_capacity(chunk.len() + 1);
            text.push('\r');
            text.push_str(chunk);
            text
        } else {
            if chunk.is_empty() {
                return;
            }
            chunk.to_string()
        };

        let scan = analyze_line_starts(&text);
        self.cr += scan.cr;
        self.lf += scan.lf;
        self.crlf += scan.crlf;
        self.chunks
            .push(StringBuffer::with_line_starts(text, scan.line_starts));
    }

    pub fn finish(mut self, normalize_eol: bool) -> PieceTreeFactory {
        if self.has_previous_cr {
            // flush the held-back final \r
            self.has_previous_cr = false;
            match self.chunks.last_mut() {
                Some(last) => {
                    last.buffer.push('\r');
                    let scan = analyze_line_starts(&last.buffer);
                    last.line_starts = scan.line_starts;
                }
                None => {
                    self.chunks.push(StringBuffer::new("\r".to_string()));
                }
            }
            self.cr += 1;
        }
        if self.chunks.is_empty() {
            self.chunks
                .push(StringBuffer::with_line_starts(String::new(), vec![0]));
        }

        PieceTreeFactory {
            chunks: self.chunks,
            bom: self.bom,
            cr: self.cr,
            lf: self.lf,
            crlf: self.crlf,
            normalize_eol,
        }
    }
}

/// Finished chunk set plus terminator statistics, ready to build buffers.
pub struct PieceTreeFactory {
    chunks: Vec<StringBuffer>,
    bom: String,
    cr: usize,
    lf: usize,
    crlf: usize,
    normalize_eol: bool,
}

impl PieceTreeFactory {
    pub fn bom(&self) -> &str {
        &self.bom
    }

    /// Dominant terminator of the scanned text; `default_eol` breaks the
    /// tie for documents without any terminator.
    fn elect_eol(&self, default_eol: EndOfLine) -> EndOfLine {
        let total = self.cr + self.lf + self.crlf;
        let cr_bearing = self.cr + self.crlf;
        if total == 0 {
            default_eol
        } else if cr_bearing > total / 2 {
            EndOfLine::CrLf
        } else {
            EndOfLine::Lf
        }
    }

    pub fn create(self, default_eol: EndOfLine) -> PieceTreeBuffer {
        let eol = self.elect_eol(default_eol);
        let mut chunks = self.chunks;

        let needs_rewrite = match eol {
            EndOfLine::CrLf => self.cr > 0 || self.lf > 0,
            EndOfLine::Lf => self.cr > 0 || self.crlf > 0,
        };
        if self.normalize_eol && needs_rewrite {
            debug!(eol = eol.as_str(), chunks = chunks.len(), "normalizing chunks");
            chunks = chunks
                .into_iter()
                .map(|chunk| {
                    let text = crate::tree_buffer::replace_terminators(&chunk.buffer, eol);
                    StringBuffer::new(text)
                })
                .collect();
        }

        PieceTreeBuffer::from_chunks(chunks, eol, self.normalize_eol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bom_is_stripped_and_reported() {
        let mut builder = PieceTreeBuilder::new();
        builder.accept_chunk("\u{FEFF}hello");
        let factory = builder.finish(false);
        assert_eq!(factory.bom(), "\u{FEFF}");
        let buffer = factory.create(EndOfLine::Lf);
        assert_eq!(buffer.get_value(), "hello");
    }

    #[test]
    fn test_cr_held_back_across_chunks() {
        let mut builder = PieceTreeBuilder::new();
        builder.accept_chunk("one\r");
        builder.accept_chunk("\ntwo");
        let buffer = builder.finish(false).create(EndOfLine::Lf);
        assert_eq!(buffer.get_value(), "one\r\ntwo");
        assert_eq!(buffer.line_count(), 2);
        assert_eq!(buffer.get_line_content(1), "one");
        buffer.assert_invariants();
    }

    #[test]
    fn test_trailing_cr_is_flushed_at_finish() {
        let mut builder = PieceTreeBuilder::new();
        builder.accept_chunk("one\r");
        let buffer = builder.finish(false).create(EndOfLine::Lf);
        assert_eq!(buffer.get_value(), "one\r");
        assert_eq!(buffer.line_count(), 2);
    }

    #[test]
    fn test_eol_election_prefers_majority() {
        let mut builder = PieceTreeBuilder::new();
        builder.accept_chunk("a\r\nb\r\nc\nd");
        let factory = builder.finish(true);
        let buffer = factory.create(EndOfLine::Lf);
        assert_eq!(buffer.eol(), EndOfLine::CrLf);
        assert_eq!(buffer.get_value(), "a\r\nb\r\nc\r\nd");
    }

    #[test]
    fn test_default_eol_used_without_terminators() {
        let mut builder = PieceTreeBuilder::new();
        builder.accept_chunk("plain");
        let buffer = builder.finish(true).create(EndOfLine::CrLf);
        assert_eq!(buffer.eol(), EndOfLine::CrLf);
        assert_eq!(buffer.get_value(), "plain");
    }

    #[test]
    fn test_normalization_rewrites_mixed_terminators() {
        let mut builder = PieceTreeBuilder::new();
        builder.accept_chunk("a\nb\rc\r");
        builder.accept_chunk("\nd\ne");
        let buffer = builder.finish(true).create(EndOfLine::Lf);
        assert_eq!(buffer.eol(), EndOfLine::Lf);
        assert_eq!(buffer.get_value(), "a\nb\nc\nd\ne");
        assert_eq!(buffer.line_count(), 5);
    }

    #[test]
    fn test_empty_input_builds_empty_buffer() {
        let builder = PieceTreeBuilder::new();
        let buffer = builder.finish(true).create(EndOfLine::Lf);
        assert!(buffer.is_empty());
        assert_eq!(buffer.line_count(), 1);
        assert_eq!(buffer.get_value(), "");
    }
}
