//! Point-in-time reader over the buffer's piece list.
//!
//! A snapshot captures the in-order piece list at construction and streams
//! the underlying text chunk by chunk. It borrows the buffer, so the
//! borrow checker rules out edits for as long as the snapshot is alive;
//! the captured pieces therefore always describe live buffer content.

use crate::tree::Piece;
use crate::tree_buffer::PieceTreeBuffer;

pub struct PieceTreeSnapshot<'a> {
    buffer: &'a PieceTreeBuffer,
    pieces: Vec<Piece>,
    bom: String,
    index: usize,
}

impl<'a> PieceTreeSnapshot<'a> {
    pub(crate) fn new(buffer: &'a PieceTreeBuffer, bom: &str) -> Self {
        PieceTreeSnapshot {
            buffer,
            pieces: buffer.pieces_in_order(),
            bom: bom.to_string(),
            index: 0,
        }
    }

    /// Next chunk of the document, or `None` once exhausted. The BOM (if
    /// any) is prepended to the first chunk; an empty document still
    /// yields one read so the BOM is not lost.
    pub fn read(&mut self) -> Option<String> {
        if self.pieces.is_empty() {
            if self.index == 0 {
                self.index += 1;
                return Some(self.bom.clone());
            }
            return None;
        }

        if self.index >= self.pieces.len() {
            return None;
        }

        let content = self.buffer.piece_content(&self.pieces[self.index]);
        let chunk = if self.index == 0 {
            format!("{}{}", self.bom, content)
        } else {
            content
        };
        self.index += 1;
        Some(chunk)
    }
}

impl Iterator for PieceTreeSnapshot<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.read()
    }
}
