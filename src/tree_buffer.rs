//! The piece tree buffer itself: buffer chunks plus the balanced piece
//! tree, with all edit and query operations.
//!
//! Original file content lives in immutable chunks; every insertion is
//! appended to a mutable add buffer at index 0. The tree orders pieces by
//! document position, and the per-node subtree totals (`size_left`,
//! `lf_left`) make offset and line lookups logarithmic.
//!
//! The delicate part of every mutation is `\r\n`. A terminator may not be
//! split across two pieces: whenever an edit creates a seam where one
//! piece ends with `\r` and the next starts with `\n`, both pieces are
//! trimmed and a dedicated two-byte piece is spliced in between
//! (`fix_crlf`). Lookups rely on this, in particular the rule that a
//! trailing `\r` immediately followed by `\n` counts as a single break.

use std::cell::RefCell;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, trace};

use crate::buffer::{create_line_starts, BufferCursor, EndOfLine, StringBuffer};
use crate::builder::PieceTreeBuilder;
use crate::cache::{CacheEntry, SearchCache};
use crate::error::PieceTreeError;
use crate::position::{Position, Range};
use crate::snapshot::PieceTreeSnapshot;
use crate::tree::{NodeIdx, Piece, RbTree, SENTINEL};

/// Target chunk size. Inserts larger than this are split across several
/// fresh buffers so no single allocation grows without bound.
pub(crate) const AVERAGE_BUFFER_SIZE: usize = 65_535;

static EOL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\r\n|\r|\n").unwrap());
static TRAILING_EOL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\r\n|\r|\n)$").unwrap());

/// Rewrite every line terminator in `text` to `eol`.
pub(crate) fn replace_terminators(text: &str, eol: EndOfLine) -> String {
    EOL_RE.replace_all(text, eol.as_str()).into_owned()
}

/// Result of resolving a document offset or position to a tree node.
struct NodePosition {
    node: NodeIdx,
    /// Byte offset of the hit inside the node's piece.
    remainder: usize,
    /// Document offset at which the node's piece begins.
    node_start_offset: usize,
}

pub struct PieceTreeBuffer {
    tree: RbTree,
    /// Index 0 is the mutable add buffer; the rest are immutable chunks.
    buffers: Vec<StringBuffer>,
    length: usize,
    line_count: usize,
    eol: EndOfLine,
    /// True while every terminator in the buffer is known to equal `eol`.
    /// Any insert clears it; only a full normalization pass restores it.
    eol_normalized: bool,
    /// Where the last append into the add buffer ended. The fast typing
    /// path extends the piece that stops exactly here.
    last_change_buffer_pos: BufferCursor,
    search_cache: RefCell<SearchCache>,
    last_visited_line: RefCell<(usize, String)>,
}

impl PieceTreeBuffer {
    pub(crate) fn from_chunks(
        chunks: Vec<StringBuffer>,
        eol: EndOfLine,
        eol_normalized: bool,
    ) -> Self {
        let mut buffer = PieceTreeBuffer {
            tree: RbTree::new(),
            buffers: vec![StringBuffer::with_line_starts(String::new(), vec![0])],
            length: 0,
            line_count: 1,
            eol,
            eol_normalized,
            last_change_buffer_pos: BufferCursor::default(),
            search_cache: RefCell::new(SearchCache::new(1)),
            last_visited_line: RefCell::new((0, String::new())),
        };

        let mut last = SENTINEL;
        for chunk in chunks {
            if chunk.buffer.is_empty() {
                continue;
            }
            let last_line = chunk.line_starts.len() - 1;
            let piece = Piece::new(
                buffer.buffers.len(),
                BufferCursor::new(0, 0),
                BufferCursor::new(last_line, chunk.buffer.len() - chunk.line_starts[last_line]),
                chunk.line_starts.len() - 1,
                chunk.buffer.len(),
            );
            buffer.buffers.push(chunk);
            last = if last == SENTINEL {
                buffer.tree.insert_left(SENTINEL, piece)
            } else {
                buffer.tree.insert_right(last, piece)
            };
        }

        buffer.compute_buffer_metadata();
        buffer
    }

    /// Convenience constructor for a single chunk, terminators preserved
    /// as given. A leading UTF-8 BOM is stripped.
    pub fn from_str(text: &str) -> Self {
        let mut builder = PieceTreeBuilder::new();
        builder.accept_chunk(text);
        builder.finish(false).create(EndOfLine::Lf)
    }

    /// Total length in bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Number of lines; an empty buffer has one.
    pub fn line_count(&self) -> usize {
        self.line_count
    }

    pub fn eol(&self) -> EndOfLine {
        self.eol
    }

    /// Rewrite every terminator to `eol` and rebuild the tree from evenly
    /// sized chunks. O(n), and afterwards the buffer is normalized again.
    pub fn set_eol(&mut self, eol: EndOfLine) {
        let min = AVERAGE_BUFFER_SIZE - AVERAGE_BUFFER_SIZE / 3;
        let max = min * 2;

        let mut chunks: Vec<StringBuffer> = Vec::new();
        let mut temp = String::new();
        let mut x = self.first_node();
        while x != SENTINEL {
            let s = self.piece_content(&self.tree[x].piece);
            if !(temp.len() <= min || temp.len() + s.len() < max) {
                let text = EOL_RE.replace_all(&temp, eol.as_str()).into_owned();
                chunks.push(StringBuffer::new(text));
                temp.clear();
            }
            temp.push_str(&s);
            x = self.tree.next(x);
        }
        if !temp.is_empty() {
            let text = EOL_RE.replace_all(&temp, eol.as_str()).into_owned();
            chunks.push(StringBuffer::new(text));
        }

        debug!(chunks = chunks.len(), eol = eol.as_str(), "normalized line terminators");
        *self = PieceTreeBuffer::from_chunks(chunks, eol, true);
    }

    // ---- edits ----

    pub fn insert(&mut self, offset: usize, value: &str) -> Result<(), PieceTreeError> {
        if offset > self.length {
            return Err(PieceTreeError::OffsetOutOfBounds {
                offset,
                len: self.length,
            });
        }
        if value.is_empty() {
            return Ok(());
        }

        // The inserted text may carry arbitrary terminators.
        self.eol_normalized = false;
        self.reset_line_cache();
        self.search_cache.borrow_mut().validate(offset);

        if self.tree.root != SENTINEL {
            let NodePosition {
                node,
                remainder,
                node_start_offset,
            } = self.node_at(offset);
            let piece = self.tree[node].piece;

            if piece.buffer_index == 0
                && piece.end.line == self.last_change_buffer_pos.line
                && piece.end.column == self.last_change_buffer_pos.column
                && node_start_offset + piece.length == offset
                && value.len() < AVERAGE_BUFFER_SIZE
            {
                // continued typing at the end of the last edited piece
                let mut value = value.to_string();
                self.append_to_node(node, &mut value);
                self.compute_buffer_metadata();
                return Ok(());
            }

            if node_start_offset == offset {
                self.insert_content_to_node_left(value, node);
                self.search_cache.borrow_mut().validate(offset);
            } else if node_start_offset + piece.length > offset {
                self.insert_into_middle_of_node(value, node, remainder);
            } else {
                self.insert_content_to_node_right(value, node);
            }
        } else {
            let pieces = self.create_new_pieces(value);
            let mut node = self.tree.insert_left(SENTINEL, pieces[0]);
            for piece in &pieces[1..] {
                node = self.tree.insert_right(node, *piece);
            }
        }

        self.compute_buffer_metadata();
        Ok(())
    }

    /// Delete `cnt` bytes at `offset`. A negative count deletes the
    /// `|cnt|` bytes before `offset`; zero is a no-op.
    pub fn delete(&mut self, offset: usize, cnt: isize) -> Result<(), PieceTreeError> {
        if cnt == 0 {
            return Ok(());
        }
        let (offset, cnt) = if cnt < 0 {
            let back = cnt.unsigned_abs();
            match offset.checked_sub(back) {
                Some(start) => (start, back),
                None => {
                    return Err(PieceTreeError::OffsetOutOfBounds {
                        offset,
                        len: self.length,
                    })
                }
            }
        } else {
            (offset, cnt as usize)
        };
        if offset + cnt > self.length {
            return Err(PieceTreeError::OffsetOutOfBounds {
                offset: offset + cnt,
                len: self.length,
            });
        }

        // A delete can land inside a \r\n pair and leave a lone half
        // behind, so two-byte terminators can no longer be assumed.
        if self.eol == EndOfLine::CrLf {
            self.eol_normalized = false;
        }
        self.reset_line_cache();
        self.search_cache.borrow_mut().validate(offset);

        let start_position = self.node_at(offset);
        let end_position = self.node_at(offset + cnt);
        let start_node = start_position.node;
        let end_node = end_position.node;

        if start_node == end_node {
            let start_split = self.position_in_buffer(start_node, start_position.remainder);
            let end_split = self.position_in_buffer(start_node, end_position.remainder);

            if start_position.node_start_offset == offset {
                if cnt == self.tree[start_node].piece.length {
                    let next = self.tree.next(start_node);
                    self.remove_node(start_node);
                    self.validate_crlf_with_prev_node(next);
                    self.compute_buffer_metadata();
                    return Ok(());
                }
                self.delete_node_head(start_node, end_split);
                self.search_cache.borrow_mut().validate(offset);
                self.validate_crlf_with_prev_node(start_node);
                self.compute_buffer_metadata();
                return Ok(());
            }

            if start_position.node_start_offset + self.tree[start_node].piece.length == offset + cnt
            {
                self.delete_node_tail(start_node, start_split);
                self.validate_crlf_with_next_node(start_node);
                self.compute_buffer_metadata();
                return Ok(());
            }

            self.shrink_node(start_node, start_split, end_split);
            self.compute_buffer_metadata();
            return Ok(());
        }

        let mut nodes_to_del = Vec::new();

        let start_split = self.position_in_buffer(start_node, start_position.remainder);
        self.delete_node_tail(start_node, start_split);
        self.search_cache.borrow_mut().validate(offset);
        if self.tree[start_node].piece.length == 0 {
            nodes_to_del.push(start_node);
        }

        let end_split = self.position_in_buffer(end_node, end_position.remainder);
        self.delete_node_head(end_node, end_split);
        if self.tree[end_node].piece.length == 0 {
            nodes_to_del.push(end_node);
        }

        let mut node = self.tree.next(start_node);
        while node != SENTINEL && node != end_node {
            nodes_to_del.push(node);
            node = self.tree.next(node);
        }

        let prev = if self.tree[start_node].piece.length == 0 {
            self.tree.prev(start_node)
        } else {
            start_node
        };
        self.delete_nodes(nodes_to_del);
        self.validate_crlf_with_next_node(prev);
        self.compute_buffer_metadata();
        Ok(())
    }

    // ---- queries ----

    /// Text covered by `range`. With `eol` given, every terminator in the
    /// result is rewritten to it.
    pub fn get_value_in_range(&self, range: Range, eol: Option<EndOfLine>) -> String {
        if range.is_empty() || self.tree.root == SENTINEL {
            return String::new();
        }

        let start = self.node_at2(range.start_line_number, range.start_column);
        let end = self.node_at2(range.end_line_number, range.end_column);
        let value = self.get_value_in_range2(&start, &end);

        match eol {
            Some(eol) if eol != self.eol || !self.eol_normalized => {
                EOL_RE.replace_all(&value, eol.as_str()).into_owned()
            }
            _ => value,
        }
    }

    /// The whole document as one string.
    pub fn get_value(&self) -> String {
        let mut out = String::with_capacity(self.length);
        let mut x = self.first_node();
        while x != SENTINEL {
            let piece = self.tree[x].piece;
            out.push_str(self.piece_slice(&piece));
            x = self.tree.next(x);
        }
        out
    }

    /// Content of the 1-based line, without its terminator. Out-of-range
    /// lines yield an empty string.
    pub fn get_line_content(&self, line_number: usize) -> String {
        if line_number < 1 || line_number > self.line_count {
            return String::new();
        }
        {
            let cached = self.last_visited_line.borrow();
            if cached.0 == line_number {
                return cached.1.clone();
            }
        }

        let value = if line_number == self.line_count {
            self.get_line_raw_content(line_number, 0)
        } else if self.eol_normalized {
            self.get_line_raw_content(line_number, self.eol.len())
        } else {
            let raw = self.get_line_raw_content(line_number, 0);
            TRAILING_EOL_RE.replace(&raw, "").into_owned()
        };

        *self.last_visited_line.borrow_mut() = (line_number, value.clone());
        value
    }

    pub fn get_line_length(&self, line_number: usize) -> usize {
        self.get_line_content(line_number).len()
    }

    /// All lines, terminators stripped. A single walk over the pieces; a
    /// `\r` at a piece end is held back until the next piece tells whether
    /// it pairs with a following `\n`.
    pub fn get_lines_content(&self) -> Vec<String> {
        let mut lines: Vec<String> = Vec::with_capacity(self.line_count);
        let mut current_line = String::new();
        let mut dangling_cr = false;

        let mut x = self.first_node();
        while x != SENTINEL {
            let piece = self.tree[x].piece;
            let mut piece_length = piece.length;
            if piece_length == 0 {
                x = self.tree.next(x);
                continue;
            }

            let buffer = &self.buffers[piece.buffer_index].buffer;
            let line_starts = &self.buffers[piece.buffer_index].line_starts;
            let piece_start_line = piece.start.line;
            let piece_end_line = piece.end.line;
            let mut piece_start_offset = line_starts[piece_start_line] + piece.start.column;

            if dangling_cr {
                if buffer.as_bytes()[piece_start_offset] == b'\n' {
                    // the  \r\n was split across pieces
                    piece_start_offset += 1;
                    piece_length -= 1;
                }
                lines.push(current_line.clone());
                current_line.clear();
                dangling_cr = false;
                if piece_length == 0 {
                    x = self.tree.next(x);
                    continue;
                }
            }

            if piece_start_line == piece_end_line {
                // piece without line breaks
                if !self.eol_normalized
                    && buffer.as_bytes()[piece_start_offset + piece_length - 1] == b'\r'
                {
                    dangling_cr = true;
                    current_line.push_str(
                        &buffer[piece_start_offset..piece_start_offset + piece_length - 1],
                    );
                } else {
                    current_line
                        .push_str(&buffer[piece_start_offset..piece_start_offset + piece_length]);
                }
                x = self.tree.next(x);
                continue;
            }

            // text before the first break of this piece
            if self.eol_normalized {
                let stop = line_starts[piece_start_line + 1].saturating_sub(self.eol.len());
                current_line.push_str(&buffer[piece_start_offset..stop.max(piece_start_offset)]);
            } else {
                let segment = &buffer[piece_start_offset..line_starts[piece_start_line + 1]];
                current_line.push_str(&TRAILING_EOL_RE.replace(segment, ""));
            }
            lines.push(current_line.clone());

            for line in piece_start_line + 1..piece_end_line {
                if self.eol_normalized {
                    current_line =
                        buffer[line_starts[line]..line_starts[line + 1] - self.eol.len()].to_string();
                } else {
                    let segment = &buffer[line_starts[line]..line_starts[line + 1]];
                    current_line = TRAILING_EOL_RE.replace(segment, "").into_owned();
                }
                lines.push(current_line.clone());
            }

            let end_line_start = line_starts[piece_end_line];
            if !self.eol_normalized
                && buffer.as_bytes()[end_line_start + piece.end.column - 1] == b'\r'
            {
                dangling_cr = true;
                if piece.end.column == 0 {
                    // the previous push already holds this line; undo it and
                    // let the next iteration re-push once the \r resolves
                    lines.pop();
                } else {
                    current_line =
                        buffer[end_line_start..end_line_start + piece.end.column - 1].to_string();
                }
            } else {
                current_line =
                    buffer[end_line_start..end_line_start + piece.end.column].to_string();
            }

            x = self.tree.next(x);
        }

        if dangling_cr {
            lines.push(current_line.clone());
            current_line.clear();
        }
        lines.push(current_line);
        lines
    }

    /// 1-based position of a byte offset; offsets past the end clamp to
    /// the last position. Exact inverse of [`Self::get_offset_at`].
    pub fn get_position_at(&self, offset: usize) -> Position {
        let mut offset = offset.min(self.length);
        let original_offset = offset;
        let mut x = self.tree.root;
        let mut lf_cnt = 0;

        while x != SENTINEL {
            let node = &self.tree[x];
            if node.size_left != 0 && node.size_left >= offset {
                x = node.left;
            } else if node.size_left + node.piece.length >= offset {
                let (index, remainder) = self.get_index_of(x, offset - node.size_left);
                lf_cnt += node.lf_left + index;
                if index == 0 {
                    let line_start_offset = self.get_offset_at(lf_cnt + 1, 1);
                    let column = original_offset - line_start_offset;
                    return Position::new(lf_cnt + 1, column + 1);
                }
                return Position::new(lf_cnt + 1, remainder + 1);
            } else {
                offset -= node.size_left + node.piece.length;
                lf_cnt += node.lf_left + node.piece.line_feed_cnt;
                if node.right == SENTINEL {
                    // past the last break of the document
                    let line_start_offset = self.get_offset_at(lf_cnt + 1, 1);
                    let column = original_offset - offset - line_start_offset;
                    return Position::new(lf_cnt + 1, column + 1);
                }
                x = node.right;
            }
        }

        Position::new(1, 1)
    }

    /// Byte offset of a 1-based position. Lines clamp into range, and the
    /// result never exceeds the document length.
    pub fn get_offset_at(&self, line_number: usize, column: usize) -> usize {
        let mut line_number = line_number.clamp(1, self.line_count);
        let column = column.max(1);
        let mut left_len = 0;
        let mut x = self.tree.root;

        while x != SENTINEL {
            let node = &self.tree[x];
            if node.left != SENTINEL && node.lf_left + 1 >= line_number {
                x = node.left;
            } else if node.lf_left + node.piece.line_feed_cnt + 1 >= line_number {
                left_len += node.size_left;
                let accumulated = self
                    .get_accumulated_value(x, line_number as isize - node.lf_left as isize - 2);
                return (left_len + accumulated + column - 1).min(self.length);
            } else {
                line_number -= node.lf_left + node.piece.line_feed_cnt;
                left_len += node.size_left + node.piece.length;
                x = node.right;
            }
        }

        left_len.min(self.length)
    }

    /// Structural equality: same text, compared piece run by piece run
    /// without materializing either document.
    pub fn equal(&self, other: &PieceTreeBuffer) -> bool {
        if self.length != other.length || self.line_count != other.line_count {
            return false;
        }

        let mut offset = 0;
        let mut x = self.first_node();
        while x != SENTINEL {
            let piece = self.tree[x].piece;
            if piece.length > 0 {
                let content = self.piece_slice(&piece);
                let start = other.node_at(offset);
                let end = other.node_at(offset + piece.length);
                if content != other.get_value_in_range2(&start, &end) {
                    return false;
                }
            }
            offset += piece.length;
            x = self.tree.next(x);
        }
        true
    }

    /// Point-in-time reader; borrows the buffer, so edits are impossible
    /// while the snapshot is alive.
    pub fn create_snapshot<'a>(&'a self, bom: &str) -> PieceTreeSnapshot<'a> {
        PieceTreeSnapshot::new(self, bom)
    }

    /// Number of pieces currently in the tree.
    pub fn piece_count(&self) -> usize {
        self.tree.len()
    }

    /// Panics if any structural invariant is broken. Test and debugging
    /// aid; walks the whole tree.
    pub fn assert_invariants(&self) {
        if let Err(msg) = self.tree.check_invariants() {
            panic!("piece tree invariant violated: {msg}");
        }
        assert_eq!(self.tree.calculate_size(self.tree.root), self.length);
        assert_eq!(self.tree.calculate_lf(self.tree.root) + 1, self.line_count);

        let mut prev_ends_with_cr = false;
        let mut x = self.first_node();
        while x != SENTINEL {
            let piece = self.tree[x].piece;
            assert!(piece.length > 0, "zero-length piece left in tree");
            let content = self.piece_slice(&piece);
            assert_eq!(
                create_line_starts(content).len() - 1,
                piece.line_feed_cnt,
                "piece line feed count out of sync with its text"
            );
            if self.should_check_crlf() {
                assert!(
                    !(prev_ends_with_cr && content.as_bytes()[0] == b'\n'),
                    "\\r\\n split across piece boundary"
                );
            }
            prev_ends_with_cr = content.as_bytes()[content.len() - 1] == b'\r';
            x = self.tree.next(x);
        }
    }

    // ---- snapshot support ----

    pub(crate) fn pieces_in_order(&self) -> Vec<Piece> {
        let mut pieces = Vec::with_capacity(self.tree.len());
        let mut x = self.first_node();
        while x != SENTINEL {
            pieces.push(self.tree[x].piece);
            x = self.tree.next(x);
        }
        pieces
    }

    pub(crate) fn piece_content(&self, piece: &Piece) -> String {
        self.piece_slice(piece).to_string()
    }

    // ---- node resolution ----

    fn first_node(&self) -> NodeIdx {
        if self.tree.root == SENTINEL {
            SENTINEL
        } else {
            self.tree.leftmost(self.tree.root)
        }
    }

    fn node_at(&self, mut offset: usize) -> NodePosition {
        let cached = self.search_cache.borrow().get(offset, &self.tree);
        if let Some(entry) = cached {
            return NodePosition {
                node: entry.node,
                remainder: offset - entry.node_start_offset,
                node_start_offset: entry.node_start_offset,
            };
        }

        let mut x = self.tree.root;
        let mut node_start_offset = 0;
        while x != SENTINEL {
            let node = &self.tree[x];
            if node.size_left > offset {
                x = node.left;
            } else if node.size_left + node.piece.length >= offset {
                node_start_offset += node.size_left;
                self.search_cache.borrow_mut().set(CacheEntry {
                    node: x,
                    node_start_offset,
                    node_start_line_number: None,
                });
                return NodePosition {
                    node: x,
                    remainder: offset - node.size_left,
                    node_start_offset,
                };
            } else {
                offset -= node.size_left + node.piece.length;
                node_start_offset += node.size_left + node.piece.length;
                x = node.right;
            }
        }

        NodePosition {
            node: SENTINEL,
            remainder: 0,
            node_start_offset: 0,
        }
    }

    fn node_at2(&self, line_number: usize, column: usize) -> NodePosition {
        let mut line_number = line_number.clamp(1, self.line_count);
        let mut column = column.max(1);
        let mut x = self.tree.root;
        let mut node_start_offset = 0;
        let mut broke_at = SENTINEL;

        while x != SENTINEL {
            let node = &self.tree[x];
            if node.left != SENTINEL && node.lf_left >= line_number - 1 {
                x = node.left;
            } else if node.lf_left + node.piece.line_feed_cnt > line_number - 1 {
                let prev_accumulated = self
                    .get_accumulated_value(x, line_number as isize - node.lf_left as isize - 2);
                let accumulated = self
                    .get_accumulated_value(x, line_number as isize - node.lf_left as isize - 1);
                node_start_offset += node.size_left;
                return NodePosition {
                    node: x,
                    remainder: (prev_accumulated + column - 1).min(accumulated),
                    node_start_offset,
                };
            } else if node.lf_left + node.piece.line_feed_cnt == line_number - 1 {
                let prev_accumulated = self
                    .get_accumulated_value(x, line_number as isize - node.lf_left as isize - 2);
                if prev_accumulated + column - 1 <= node.piece.length {
                    return NodePosition {
                        node: x,
                        remainder: prev_accumulated + column - 1,
                        node_start_offset: node_start_offset + node.size_left,
                    };
                }
                // requested column reaches past this piece; keep walking
                column -= node.piece.length - prev_accumulated;
                broke_at = x;
                break;
            } else {
                line_number -= node.lf_left + node.piece.line_feed_cnt;
                node_start_offset += node.size_left + node.piece.length;
                x = node.right;
            }
        }

        let mut x = self.tree.next(broke_at);
        while x != SENTINEL {
            let node = &self.tree[x];
            if node.piece.line_feed_cnt > 0 {
                let accumulated = self.get_accumulated_value(x, 0);
                let node_start_offset = self.tree.offset_of_node(x);
                return NodePosition {
                    node: x,
                    remainder: (column - 1).min(accumulated),
                    node_start_offset,
                };
            }
            if node.piece.length >= column - 1 {
                return NodePosition {
                    node: x,
                    remainder: column - 1,
                    node_start_offset: self.tree.offset_of_node(x),
                };
            }
            column -= node.piece.length;
            x = self.tree.next(x);
        }

        // column reaches past the document end; clamp to the last piece
        let last = self.tree.rightmost(self.tree.root);
        NodePosition {
            node: last,
            remainder: self.tree[last].piece.length,
            node_start_offset: self.tree.offset_of_node(last),
        }
    }

    // ---- buffer coordinate helpers ----

    /// Cursor for an offset inside a node's piece, by binary search over
    /// the chunk's line start table.
    fn position_in_buffer(&self, node: NodeIdx, remainder: usize) -> BufferCursor {
        let piece = self.tree[node].piece;
        let line_starts = &self.buffers[piece.buffer_index].line_starts;
        let start_offset = line_starts[piece.start.line] + piece.start.column;
        let offset = start_offset + remainder;

        let mut low = piece.start.line;
        let mut high = piece.end.line;
        let mut mid = low;
        let mut mid_start = line_starts[mid];
        while low <= high {
            mid = low + (high - low) / 2;
            mid_start = line_starts[mid];
            if mid == high {
                break;
            }
            let mid_stop = line_starts[mid + 1];
            if offset < mid_start {
                high = mid - 1;
            } else if offset >= mid_stop {
                low = mid + 1;
            } else {
                break;
            }
        }

        BufferCursor::new(mid, offset - mid_start)
    }

    fn offset_in_buffer(&self, buffer_index: usize, cursor: BufferCursor) -> usize {
        self.buffers[buffer_index].line_starts[cursor.line] + cursor.column
    }

    /// Line feeds between two cursors of one chunk. A trailing `\r` that
    /// is immediately followed by `\n` in the chunk counts as a break,
    /// because the piece ending there owns the whole `\r\n` logically.
    fn get_line_feed_cnt(&self, buffer_index: usize, start: BufferCursor, end: BufferCursor) -> usize {
        if end.column == 0 {
            return end.line - start.line;
        }

        let line_starts = &self.buffers[buffer_index].line_starts;
        if end.line == line_starts.len() - 1 {
            // no break after the end cursor
            return end.line - start.line;
        }

        let next_line_start = line_starts[end.line + 1];
        let end_offset = line_starts[end.line] + end.column;
        if next_line_start > end_offset + 1 {
            // the break after the cursor is more than one byte away
            return end.line - start.line;
        }

        // next_line_start == end_offset + 1, so the byte before the cursor
        // decides: a \r here pairs with the following \n
        if self.buffers[buffer_index].buffer.as_bytes()[end_offset - 1] == b'\r' {
            end.line - start.line + 1
        } else {
            end.line - start.line
        }
    }

    fn piece_slice(&self, piece: &Piece) -> &str {
        let start = self.offset_in_buffer(piece.buffer_index, piece.start);
        let end = self.offset_in_buffer(piece.buffer_index, piece.end);
        &self.buffers[piece.buffer_index].buffer[start..end]
    }

    /// Byte of the node's text at `offset`, for CRLF seam checks only.
    /// Pieces without any line feed can never hold a seam byte.
    fn node_char_code_at(&self, node: NodeIdx, offset: usize) -> Option<u8> {
        if node == SENTINEL || self.tree[node].piece.line_feed_cnt < 1 {
            return None;
        }
        let piece = self.tree[node].piece;
        let pos = self.offset_in_buffer(piece.buffer_index, piece.start) + offset;
        self.buffers[piece.buffer_index].buffer.as_bytes().get(pos).copied()
    }

    fn start_with_lf_node(&self, node: NodeIdx) -> bool {
        if node == SENTINEL || self.tree[node].piece.line_feed_cnt == 0 {
            return false;
        }
        let piece = self.tree[node].piece;
        let line_starts = &self.buffers[piece.buffer_index].line_starts;
        let line = piece.start.line;
        let start_offset = line_starts[line] + piece.start.column;
        if line == line_starts.len() - 1 {
            return false;
        }
        if line_starts[line + 1] > start_offset + 1 {
            return false;
        }
        self.buffers[piece.buffer_index].buffer.as_bytes()[start_offset] == b'\n'
    }

    fn end_with_cr_node(&self, node: NodeIdx) -> bool {
        if node == SENTINEL || self.tree[node].piece.line_feed_cnt == 0 {
            return false;
        }
        self.node_char_code_at(node, self.tree[node].piece.length - 1) == Some(b'\r')
    }

    fn should_check_crlf(&self) -> bool {
        !(self.eol_normalized && self.eol == EndOfLine::Lf)
    }

    // ---- line accumulation ----

    /// Bytes from the piece start up to (and including) its `index`-th
    /// line break; past the last break this is the piece length.
    fn get_accumulated_value(&self, node: NodeIdx, index: isize) -> usize {
        if index < 0 {
            return 0;
        }
        let piece = self.tree[node].piece;
        let line_starts = &self.buffers[piece.buffer_index].line_starts;
        let expected = piece.start.line + index as usize + 1;
        if expected > piece.end.line {
            self.offset_in_buffer(piece.buffer_index, piece.end)
                - self.offset_in_buffer(piece.buffer_index, piece.start)
        } else {
            line_starts[expected] - self.offset_in_buffer(piece.buffer_index, piece.start)
        }
    }

    /// Line index inside the node for an accumulated byte count, plus the
    /// column on that line.
    fn get_index_of(&self, node: NodeIdx, accumulated: usize) -> (usize, usize) {
        let piece = self.tree[node].piece;
        let pos = self.position_in_buffer(node, accumulated);
        let line_cnt = pos.line - piece.start.line;

        if self.offset_in_buffer(piece.buffer_index, piece.end)
            - self.offset_in_buffer(piece.buffer_index, piece.start)
            == accumulated
        {
            // at the piece end the CRLF rule may add one more break
            let real_line_cnt = self.get_line_feed_cnt(piece.buffer_index, piece.start, pos);
            if real_line_cnt != line_cnt {
                return (real_line_cnt, 0);
            }
        }

        (line_cnt, pos.column)
    }

    fn get_value_in_range2(&self, start: &NodePosition, end: &NodePosition) -> String {
        if start.node == end.node {
            let piece = self.tree[start.node].piece;
            let buffer = &self.buffers[piece.buffer_index].buffer;
            let start_offset = self.offset_in_buffer(piece.buffer_index, piece.start);
            return buffer[start_offset + start.remainder..start_offset + end.remainder]
                .to_string();
        }

        let mut x = start.node;
        let piece = self.tree[x].piece;
        let start_offset = self.offset_in_buffer(piece.buffer_index, piece.start);
        let mut ret = self.buffers[piece.buffer_index].buffer
            [start_offset + start.remainder..start_offset + piece.length]
            .to_string();

        x = self.tree.next(x);
        while x != SENTINEL {
            let piece = self.tree[x].piece;
            let buffer = &self.buffers[piece.buffer_index].buffer;
            let start_offset = self.offset_in_buffer(piece.buffer_index, piece.start);
            if x == end.node {
                ret.push_str(&buffer[start_offset..start_offset + end.remainder]);
                break;
            }
            ret.push_str(&buffer[start_offset..start_offset + piece.length]);
            x = self.tree.next(x);
        }
        ret
    }

    /// Raw content of a 1-based line including its terminator, minus the
    /// final `end_offset` bytes. Records a line-aware cache entry so that
    /// sequential line reads resolve without a descent.
    fn get_line_raw_content(&self, line_number: usize, end_offset: usize) -> String {
        let mut line_number = line_number;
        let mut x;
        let mut ret = String::new();

        let cached = self.search_cache.borrow().get2(line_number, &self.tree);
        let mut hit = false;
        if let Some(entry) = cached {
            if let Some(node_start_line) = entry.node_start_line_number {
                hit = true;
                x = entry.node;
                let node = &self.tree[x];
                let prev_accumulated = self
                    .get_accumulated_value(x, (line_number - node_start_line) as isize - 1);
                let piece = node.piece;
                let buffer = &self.buffers[piece.buffer_index].buffer;
                let start_offset = self.offset_in_buffer(piece.buffer_index, piece.start);

                if node_start_line + piece.line_feed_cnt == line_number {
                    // line continues into the following pieces
                    ret = buffer[start_offset + prev_accumulated..start_offset + piece.length]
                        .to_string();
                } else {
                    let accumulated = self
                        .get_accumulated_value(x, (line_number - node_start_line) as isize);
                    return buffer
                        [start_offset + prev_accumulated..start_offset + accumulated - end_offset]
                        .to_string();
                }
            } else {
                x = self.tree.root;
            }
        } else {
            x = self.tree.root;
        }

        if !hit {
            let mut node_start_offset = 0;
            let original_line_number = line_number;
            x = self.tree.root;
            while x != SENTINEL {
                let node = &self.tree[x];
                if node.left != SENTINEL && node.lf_left >= line_number - 1 {
                    x = node.left;
                } else if node.lf_left + node.piece.line_feed_cnt > line_number - 1 {
                    let prev_accumulated = self.get_accumulated_value(
                        x,
                        line_number as isize - node.lf_left as isize - 2,
                    );
                    let accumulated = self.get_accumulated_value(
                        x,
                        line_number as isize - node.lf_left as isize - 1,
                    );
                    let piece = node.piece;
                    let buffer = &self.buffers[piece.buffer_index].buffer;
                    let start_offset = self.offset_in_buffer(piece.buffer_index, piece.start);
                    node_start_offset += node.size_left;
                    self.search_cache.borrow_mut().set(CacheEntry {
                        node: x,
                        node_start_offset,
                        node_start_line_number: Some(
                            original_line_number - (line_number - 1 - node.lf_left),
                        ),
                    });
                    return buffer
                        [start_offset + prev_accumulated..start_offset + accumulated - end_offset]
                        .to_string();
                } else if node.lf_left + node.piece.line_feed_cnt == line_number - 1 {
                    // the line starts here but runs on into later pieces
                    let prev_accumulated = self.get_accumulated_value(
                        x,
                        line_number as isize - node.lf_left as isize - 2,
                    );
                    let piece = node.piece;
                    let buffer = &self.buffers[piece.buffer_index].buffer;
                    let start_offset = self.offset_in_buffer(piece.buffer_index, piece.start);
                    ret = buffer[start_offset + prev_accumulated..start_offset + piece.length]
                        .to_string();
                    break;
                } else {
                    line_number -= node.lf_left + node.piece.line_feed_cnt;
                    node_start_offset += node.size_left + node.piece.length;
                    x = node.right;
                }
            }
            if x == SENTINEL {
                return ret;
            }
        }

        // collect the rest of the line from the following pieces
        x = self.tree.next(x);
        while x != SENTINEL {
            let piece = self.tree[x].piece;
            let buffer = &self.buffers[piece.buffer_index].buffer;
            let start_offset = self.offset_in_buffer(piece.buffer_index, piece.start);
            if piece.line_feed_cnt > 0 {
                let accumulated = self.get_accumulated_value(x, 0);
                ret.push_str(
                    &buffer[start_offset..start_offset + accumulated - end_offset],
                );
                return ret;
            }
            ret.push_str(&buffer[start_offset..start_offset + piece.length]);
            x = self.tree.next(x);
        }
        ret
    }

    // ---- mutation helpers ----

    /// Append typed text to the add buffer and extend the node's piece in
    /// place. Fast path for sequential typing.
    fn append_to_node(&mut self, node: NodeIdx, value: &mut String) {
        if self.adjust_carriage_return_from_next(value, node) {
            value.push('\n');
        }

        let hit_crlf = self.should_check_crlf()
            && value.as_bytes().first() == Some(&b'\n')
            && self.end_with_cr_node(node);

        let start_offset = self.buffers[0].buffer.len();
        self.buffers[0].buffer.push_str(value);
        let mut line_starts = create_line_starts(value);
        for start in line_starts.iter_mut() {
            *start += start_offset;
        }

        if hit_crlf {
            // appending \n right after a lone \r fuses them into one break
            let prev_start = self.buffers[0].line_starts[self.buffers[0].line_starts.len() - 2];
            self.buffers[0].line_starts.pop();
            self.last_change_buffer_pos = BufferCursor::new(
                self.last_change_buffer_pos.line - 1,
                start_offset - prev_start,
            );
        }
        self.buffers[0].line_starts.extend_from_slice(&line_starts[1..]);

        let end_index = self.buffers[0].line_starts.len() - 1;
        let end_column = self.buffers[0].buffer.len() - self.buffers[0].line_starts[end_index];
        let new_end = BufferCursor::new(end_index, end_column);

        let piece = self.tree[node].piece;
        let new_length = piece.length + value.len();
        let new_lf = self.get_line_feed_cnt(0, piece.start, new_end);
        let lf_delta = new_lf as isize - piece.line_feed_cnt as isize;
        self.tree[node].piece = Piece::new(0, piece.start, new_end, new_lf, new_length);
        self.last_change_buffer_pos = new_end;
        self.tree
            .update_metadata(node, value.len() as isize, lf_delta);
    }

    /// Append `text` to the add buffer and return pieces describing it.
    /// Oversized text is split into fresh immutable chunks instead.
    fn create_new_pieces(&mut self, text: &str) -> Vec<Piece> {
        if text.len() > AVERAGE_BUFFER_SIZE {
            let mut pieces = Vec::new();
            let mut rest = text;
            while rest.len() > AVERAGE_BUFFER_SIZE {
                let mut split = AVERAGE_BUFFER_SIZE;
                while !rest.is_char_boundary(split) {
                    split -= 1;
                }
                if rest.as_bytes()[split - 1] == b'\r' {
                    // never leave a chunk ending in the middle of \r\n
                    split -= 1;
                }
                let (chunk, tail) = rest.split_at(split);
                pieces.push(self.push_chunk(chunk));
                rest = tail;
            }
            pieces.push(self.push_chunk(rest));
            trace!(pieces = pieces.len(), bytes = text.len(), "chunked large insert");
            return pieces;
        }

        let mut start_offset = self.buffers[0].buffer.len();
        let mut line_starts = create_line_starts(text);
        let mut start = self.last_change_buffer_pos;

        if self.buffers[0].line_starts[self.buffers[0].line_starts.len() - 1] == start_offset
            && start_offset != 0
            && text.as_bytes()[0] == b'\n'
            && self.buffers[0].buffer.as_bytes()[start_offset - 1] == b'\r'
        {
            // The add buffer ends with a lone \r whose line break is already
            // recorded; appending \n directly would silently fuse the two and
            // corrupt the line start table. Pad with a filler byte the new
            // piece skips over.
            self.last_change_buffer_pos =
                BufferCursor::new(start.line, start.column + 1);
            start = self.last_change_buffer_pos;
            for ls in line_starts.iter_mut() {
                *ls += start_offset + 1;
            }
            self.buffers[0].line_starts.extend_from_slice(&line_starts[1..]);
            self.buffers[0].buffer.push('_');
            self.buffers[0].buffer.push_str(text);
            start_offset += 1;
        } else {
            if start_offset != 0 {
                for ls in line_starts.iter_mut() {
                    *ls += start_offset;
                }
            }
            self.buffers[0].line_starts.extend_from_slice(&line_starts[1..]);
            self.buffers[0].buffer.push_str(text);
        }

        let end_offset = self.buffers[0].buffer.len();
        let end_index = self.buffers[0].line_starts.len() - 1;
        let end_column = end_offset - self.buffers[0].line_starts[end_index];
        let end_pos = BufferCursor::new(end_index, end_column);
        let piece = Piece::new(
            0,
            start,
            end_pos,
            self.get_line_feed_cnt(0, start, end_pos),
            end_offset - start_offset,
        );
        self.last_change_buffer_pos = end_pos;
        vec![piece]
    }

    fn push_chunk(&mut self, chunk: &str) -> Piece {
        let line_starts = create_line_starts(chunk);
        let last_line = line_starts.len() - 1;
        let piece = Piece::new(
            self.buffers.len(),
            BufferCursor::new(0, 0),
            BufferCursor::new(last_line, chunk.len() - line_starts[last_line]),
            line_starts.len() - 1,
            chunk.len(),
        );
        self.buffers
            .push(StringBuffer::with_line_starts(chunk.to_string(), line_starts));
        piece
    }

    fn insert_content_to_node_left(&mut self, value: &str, node: NodeIdx) {
        let mut nodes_to_del = Vec::new();
        let mut value = value.to_string();

        if self.should_check_crlf()
            && value.as_bytes().last() == Some(&b'\r')
            && self.start_with_lf_node(node)
        {
            // claim the node's leading \n for the inserted \r
            let piece = self.tree[node].piece;
            let new_start = BufferCursor::new(piece.start.line + 1, 0);
            let new_lf = self.get_line_feed_cnt(piece.buffer_index, new_start, piece.end);
            self.tree[node].piece =
                Piece::new(piece.buffer_index, new_start, piece.end, new_lf, piece.length - 1);
            value.push('\n');
            self.tree.update_metadata(node, -1, -1);
            if self.tree[node].piece.length == 0 {
                nodes_to_del.push(node);
            }
        }

        let pieces = self.create_new_pieces(&value);
        let mut new_node = self.tree.insert_left(node, pieces[pieces.len() - 1]);
        for piece in pieces[..pieces.len() - 1].iter().rev() {
            new_node = self.tree.insert_left(new_node, *piece);
        }
        self.validate_crlf_with_prev_node(new_node);
        self.delete_nodes(nodes_to_del);
    }

    fn insert_content_to_node_right(&mut self, value: &str, node: NodeIdx) {
        let mut value = value.to_string();
        if self.adjust_carriage_return_from_next(&value, node) {
            value.push('\n');
        }

        let pieces = self.create_new_pieces(&value);
        let new_node = self.tree.insert_right(node, pieces[0]);
        let mut tmp = new_node;
        for piece in &pieces[1..] {
            tmp = self.tree.insert_right(tmp, *piece);
        }
        self.validate_crlf_with_prev_node(new_node);
    }

    fn insert_into_middle_of_node(&mut self, value: &str, node: NodeIdx, remainder: usize) {
        let mut nodes_to_del = Vec::new();
        let mut value = value.to_string();
        let piece = self.tree[node].piece;
        let insert_pos = self.position_in_buffer(node, remainder);

        let mut new_right_piece = Piece::new(
            piece.buffer_index,
            insert_pos,
            piece.end,
            self.get_line_feed_cnt(piece.buffer_index, insert_pos, piece.end),
            self.offset_in_buffer(piece.buffer_index, piece.end)
                - self.offset_in_buffer(piece.buffer_index, insert_pos),
        );

        if self.should_check_crlf() && value.as_bytes().last() == Some(&b'\r') {
            if self.node_char_code_at(node, remainder) == Some(b'\n') {
                // the byte right of the split is a \n; move it left of it
                let new_start = BufferCursor::new(new_right_piece.start.line + 1, 0);
                new_right_piece = Piece::new(
                    new_right_piece.buffer_index,
                    new_start,
                    new_right_piece.end,
                    self.get_line_feed_cnt(
                        new_right_piece.buffer_index,
                        new_start,
                        new_right_piece.end,
                    ),
                    new_right_piece.length - 1,
                );
                value.push('\n');
            }
        }

        // the node itself keeps the content left of the split
        if self.should_check_crlf()
            && value.as_bytes().first() == Some(&b'\n')
            && self.node_char_code_at(node, remainder - 1) == Some(b'\r')
        {
            let prev_pos = self.position_in_buffer(node, remainder - 1);
            self.delete_node_tail(node, prev_pos);
            value.insert(0, '\r');
            if self.tree[node].piece.length == 0 {
                nodes_to_del.push(node);
            }
        } else {
            self.delete_node_tail(node, insert_pos);
        }

        let pieces = self.create_new_pieces(&value);
        if new_right_piece.length > 0 {
            self.tree.insert_right(node, new_right_piece);
        }
        let mut tmp = node;
        for piece in &pieces {
            tmp = self.tree.insert_right(tmp, *piece);
        }
        self.delete_nodes(nodes_to_del);
    }

    /// If the node after `node` starts with `\n` and `value` ends with
    /// `\r`, strip that `\n` off the next node so the caller can append it
    /// to `value` and keep the pair in one piece.
    fn adjust_carriage_return_from_next(&mut self, value: &str, node: NodeIdx) -> bool {
        if !(self.should_check_crlf() && value.as_bytes().last() == Some(&b'\r')) {
            return false;
        }
        let next = self.tree.next(node);
        if !self.start_with_lf_node(next) {
            return false;
        }

        if self.tree[next].piece.length == 1 {
            self.remove_node(next);
        } else {
            let piece = self.tree[next].piece;
            let new_start = BufferCursor::new(piece.start.line + 1, 0);
            let new_lf = self.get_line_feed_cnt(piece.buffer_index, new_start, piece.end);
            self.tree[next].piece =
                Piece::new(piece.buffer_index, new_start, piece.end, new_lf, piece.length - 1);
            self.tree.update_metadata(next, -1, -1);
        }
        true
    }

    fn delete_node_tail(&mut self, node: NodeIdx, pos: BufferCursor) {
        let piece = self.tree[node].piece;
        let original_end_offset = self.offset_in_buffer(piece.buffer_index, piece.end);
        let new_end_offset = self.offset_in_buffer(piece.buffer_index, pos);
        let new_lf = self.get_line_feed_cnt(piece.buffer_index, piece.start, pos);

        let lf_delta = new_lf as isize - piece.line_feed_cnt as isize;
        let size_delta = new_end_offset as isize - original_end_offset as isize;
        let new_length = (piece.length as isize + size_delta) as usize;

        self.tree[node].piece = Piece::new(piece.buffer_index, piece.start, pos, new_lf, new_length);
        self.tree.update_metadata(node, size_delta, lf_delta);
    }

    fn delete_node_head(&mut self, node: NodeIdx, pos: BufferCursor) {
        let piece = self.tree[node].piece;
        let original_start_offset = self.offset_in_buffer(piece.buffer_index, piece.start);
        let new_start_offset = self.offset_in_buffer(piece.buffer_index, pos);
        let new_lf = self.get_line_feed_cnt(piece.buffer_index, pos, piece.end);

        let lf_delta = new_lf as isize - piece.line_feed_cnt as isize;
        let size_delta = original_start_offset as isize - new_start_offset as isize;
        let new_length = (piece.length as isize + size_delta) as usize;

        self.tree[node].piece = Piece::new(piece.buffer_index, pos, piece.end, new_lf, new_length);
        self.tree.update_metadata(node, size_delta, lf_delta);
    }

    /// Remove `[start, end)` from the middle of a node: the node keeps the
    /// head, a fresh node takes the tail.
    fn shrink_node(&mut self, node: NodeIdx, start: BufferCursor, end: BufferCursor) {
        let piece = self.tree[node].piece;
        let original_end = piece.end;

        let new_lf = self.get_line_feed_cnt(piece.buffer_index, piece.start, start);
        let new_length = self.offset_in_buffer(piece.buffer_index, start)
            - self.offset_in_buffer(piece.buffer_index, piece.start);
        self.tree[node].piece =
            Piece::new(piece.buffer_index, piece.start, start, new_lf, new_length);
        self.tree.update_metadata(
            node,
            new_length as isize - piece.length as isize,
            new_lf as isize - piece.line_feed_cnt as isize,
        );

        let tail = Piece::new(
            piece.buffer_index,
            end,
            original_end,
            self.get_line_feed_cnt(piece.buffer_index, end, original_end),
            self.offset_in_buffer(piece.buffer_index, original_end)
                - self.offset_in_buffer(piece.buffer_index, end),
        );
        let new_node = self.tree.insert_right(node, tail);
        self.validate_crlf_with_prev_node(new_node);
    }

    fn validate_crlf_with_prev_node(&mut self, next_node: NodeIdx) {
        if self.should_check_crlf() && self.start_with_lf_node(next_node) {
            let prev = self.tree.prev(next_node);
            if self.end_with_cr_node(prev) {
                self.fix_crlf(prev, next_node);
            }
        }
    }

    fn validate_crlf_with_next_node(&mut self, node: NodeIdx) {
        if self.should_check_crlf() && self.end_with_cr_node(node) {
            let next = self.tree.next(node);
            if self.start_with_lf_node(next) {
                self.fix_crlf(node, next);
            }
        }
    }

    /// `prev` ends with `\r`, `next` starts with `\n`: trim both and
    /// splice in a dedicated `\r\n` piece between them.
    fn fix_crlf(&mut self, prev: NodeIdx, next: NodeIdx) {
        let mut nodes_to_del = Vec::new();

        let prev_piece = self.tree[prev].piece;
        let line_starts = &self.buffers[prev_piece.buffer_index].line_starts;
        let new_end = if prev_piece.end.column == 0 {
            BufferCursor::new(
                prev_piece.end.line - 1,
                line_starts[prev_piece.end.line] - line_starts[prev_piece.end.line - 1] - 1,
            )
        } else {
            BufferCursor::new(prev_piece.end.line, prev_piece.end.column - 1)
        };
        self.tree[prev].piece = Piece::new(
            prev_piece.buffer_index,
            prev_piece.start,
            new_end,
            prev_piece.line_feed_cnt - 1,
            prev_piece.length - 1,
        );
        self.tree.update_metadata(prev, -1, -1);
        if self.tree[prev].piece.length == 0 {
            nodes_to_del.push(prev);
        }

        let next_piece = self.tree[next].piece;
        let new_start = BufferCursor::new(next_piece.start.line + 1, 0);
        let new_lf = self.get_line_feed_cnt(next_piece.buffer_index, new_start, next_piece.end);
        self.tree[next].piece = Piece::new(
            next_piece.buffer_index,
            new_start,
            next_piece.end,
            new_lf,
            next_piece.length - 1,
        );
        self.tree.update_metadata(next, -1, -1);
        if self.tree[next].piece.length == 0 {
            nodes_to_del.push(next);
        }

        let pieces = self.create_new_pieces("\r\n");
        self.tree.insert_right(prev, pieces[0]);
        self.delete_nodes(nodes_to_del);
    }

    fn delete_nodes(&mut self, nodes: Vec<NodeIdx>) {
        for node in nodes {
            self.remove_node(node);
        }
    }

    /// All node removals funnel through here so the search cache never
    /// outlives a freed (and possibly recycled) arena slot.
    fn remove_node(&mut self, node: NodeIdx) {
        self.search_cache.borrow_mut().evict(node);
        self.tree.delete(node);
    }

    fn compute_buffer_metadata(&mut self) {
        let mut x = self.tree.root;
        let mut lf = 1;
        let mut len = 0;
        while x != SENTINEL {
            lf += self.tree[x].lf_left + self.tree[x].piece.line_feed_cnt;
            len += self.tree[x].size_left + self.tree[x].piece.length;
            x = self.tree[x].right;
        }
        self.line_count = lf;
        self.length = len;
    }

    fn reset_line_cache(&mut self) {
        let mut cached = self.last_visited_line.borrow_mut();
        cached.0 = 0;
        cached.1.clear();
    }
}

impl std::fmt::Debug for PieceTreeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceTreeBuffer")
            .field("length", &self.length)
            .field("line_count", &self.line_count)
            .field("eol", &self.eol)
            .field("eol_normalized", &self.eol_normalized)
            .field("pieces", &self.tree.len())
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(text: &str) -> PieceTreeBuffer {
        PieceTreeBuffer::from_str(text)
    }

    #[test]
    fn test_insert_into_middle() {
        let mut buf = buffer("hello\nworld");
        buf.insert(5, " there").unwrap();
        assert_eq!(buf.get_value(), "hello there\nworld");
        assert_eq!(buf.line_count(), 2);
        assert_eq!(buf.get_line_content(1), "hello there");
        assert_eq!(buf.get_line_content(2), "world");
        buf.assert_invariants();
    }

    #[test]
    fn test_offset_position_round_trip() {
        let mut buf = buffer("hello\nworld");
        buf.insert(5, " there").unwrap();
        assert_eq!(buf.get_offset_at(2, 1), 12);
        assert_eq!(buf.get_position_at(12), Position::new(2, 1));
        for offset in 0..=buf.len() {
            let pos = buf.get_position_at(offset);
            assert_eq!(buf.get_offset_at(pos.line_number, pos.column), offset);
        }
    }

    #[test]
    fn test_insert_at_ends() {
        let mut buf = buffer("bc");
        buf.insert(0, "a").unwrap();
        buf.insert(3, "d").unwrap();
        assert_eq!(buf.get_value(), "abcd");
        assert_eq!(buf.len(), 4);
        buf.assert_invariants();
    }

    #[test]
    fn test_insert_out_of_bounds() {
        let mut buf = buffer("abc");
        assert_eq!(
            buf.insert(4, "x"),
            Err(PieceTreeError::OffsetOutOfBounds { offset: 4, len: 3 })
        );
    }

    #[test]
    fn test_empty_insert_is_noop() {
        let mut buf = buffer("abc");
        buf.insert(1, "").unwrap();
        assert_eq!(buf.get_value(), "abc");
        assert_eq!(buf.piece_count(), 1);
    }

    #[test]
    fn test_sequential_typing_extends_one_piece() {
        let mut buf = buffer("");
        for (i, ch) in "hello world".char_indices() {
            buf.insert(i, &ch.to_string()).unwrap();
        }
        assert_eq!(buf.get_value(), "hello world");
        assert_eq!(buf.piece_count(), 1);
        buf.assert_invariants();
    }

    #[test]
    fn test_delete_within_one_piece() {
        let mut buf = buffer("hello world");
        buf.delete(5, 6).unwrap();
        assert_eq!(buf.get_value(), "hello");
        buf.delete(0, 1).unwrap();
        assert_eq!(buf.get_value(), "ello");
        buf.delete(3, 1).unwrap();
        assert_eq!(buf.get_value(), "ell");
        buf.assert_invariants();
    }

    #[test]
    fn test_delete_across_pieces() {
        let mut buf = buffer("aaa");
        buf.insert(3, "bbb").unwrap();
        buf.insert(6, "ccc").unwrap();
        buf.delete(1, 7).unwrap();
        assert_eq!(buf.get_value(), "ac");
        buf.assert_invariants();
    }

    #[test]
    fn test_delete_negative_count() {
        let mut buf = buffer("abcdef");
        buf.delete(4, -2).unwrap();
        assert_eq!(buf.get_value(), "abef");
        assert!(buf.delete(1, -2).is_err());
        assert_eq!(buf.get_value(), "abef");
        buf.delete(2, 0).unwrap();
        assert_eq!(buf.get_value(), "abef");
    }

    #[test]
    fn test_delete_out_of_bounds() {
        let mut buf = buffer("abc");
        assert_eq!(
            buf.delete(2, 5),
            Err(PieceTreeError::OffsetOutOfBounds { offset: 7, len: 3 })
        );
    }

    #[test]
    fn test_crlf_built_from_two_inserts() {
        let mut buf = buffer("hello");
        buf.insert(5, "\r").unwrap();
        buf.insert(6, "\n").unwrap();
        assert_eq!(buf.get_value(), "hello\r\n");
        assert_eq!(buf.line_count(), 2);
        assert_eq!(buf.get_line_content(1), "hello");
        assert_eq!(buf.get_line_content(2), "");
        buf.assert_invariants();
    }

    #[test]
    fn test_insert_cr_before_lf() {
        let mut buf = buffer("abc\ndef");
        buf.insert(3, "\r").unwrap();
        assert_eq!(buf.get_value(), "abc\r\ndef");
        assert_eq!(buf.line_count(), 2);
        assert_eq!(buf.get_line_content(1), "abc");
        buf.assert_invariants();
    }

    #[test]
    fn test_insert_lf_after_cr() {
        let mut buf = buffer("abc\rdef");
        assert_eq!(buf.line_count(), 2);
        buf.insert(4, "\n").unwrap();
        assert_eq!(buf.get_value(), "abc\r\ndef");
        assert_eq!(buf.line_count(), 2);
        buf.assert_invariants();
    }

    #[test]
    fn test_delete_between_cr_and_lf() {
        let mut buf = buffer("abc\rX\ndef");
        assert_eq!(buf.line_count(), 3);
        buf.delete(4, 1).unwrap();
        assert_eq!(buf.get_value(), "abc\r\ndef");
        assert_eq!(buf.line_count(), 2);
        buf.assert_invariants();
    }

    #[test]
    fn test_mixed_eol_lines() {
        let buf = buffer("one\r\ntwo\rthree\nfour");
        assert_eq!(buf.line_count(), 4);
        assert_eq!(buf.get_line_content(1), "one");
        assert_eq!(buf.get_line_content(2), "two");
        assert_eq!(buf.get_line_content(3), "three");
        assert_eq!(buf.get_line_content(4), "four");
        assert_eq!(
            buf.get_lines_content(),
            vec!["one", "two", "three", "four"]
        );
    }

    #[test]
    fn test_trailing_terminator_makes_empty_last_line() {
        let buf = buffer("one\n");
        assert_eq!(buf.line_count(), 2);
        assert_eq!(buf.get_line_content(2), "");
        assert_eq!(buf.get_lines_content(), vec!["one", ""]);
    }

    #[test]
    fn test_get_value_in_range() {
        let buf = buffer("hello\nworld\nlast");
        let range = Range::new(1, 3, 2, 3);
        assert_eq!(buf.get_value_in_range(range, None), "llo\nwo");
        assert_eq!(
            buf.get_value_in_range(range, Some(EndOfLine::CrLf)),
            "llo\r\nwo"
        );
        assert_eq!(
            buf.get_value_in_range(Range::new(2, 1, 2, 1), None),
            ""
        );
    }

    #[test]
    fn test_set_eol_rewrites_all_terminators() {
        let mut buf = buffer("a\r\nb\rc\nd");
        assert_eq!(buf.line_count(), 4);
        buf.set_eol(EndOfLine::CrLf);
        assert_eq!(buf.get_value(), "a\r\nb\r\nc\r\nd");
        assert_eq!(buf.line_count(), 4);
        assert_eq!(buf.eol(), EndOfLine::CrLf);
        buf.set_eol(EndOfLine::Lf);
        assert_eq!(buf.get_value(), "a\nb\nc\nd");
        buf.assert_invariants();
    }

    #[test]
    fn test_large_insert_splits_into_chunks() {
        let big = "x".repeat(AVERAGE_BUFFER_SIZE * 3 + 17);
        let mut buf = buffer("ab");
        buf.insert(1, &big).unwrap();
        assert_eq!(buf.len(), big.len() + 2);
        assert!(buf.piece_count() >= 4);
        assert_eq!(buf.get_value(), format!("a{big}b"));
        buf.assert_invariants();
    }

    #[test]
    fn test_equal() {
        let mut a = buffer("onetwo");
        let b = buffer("onetwo");
        assert!(a.equal(&b));
        a.insert(3, "-").unwrap();
        assert!(!a.equal(&b));
        a.delete(3, 1).unwrap();
        assert!(a.equal(&b));
    }

    #[test]
    fn test_line_cache_consistency_across_edits() {
        let mut buf = buffer("aaa\nbbb\nccc");
        assert_eq!(buf.get_line_content(2), "bbb");
        buf.insert(4, "X").unwrap();
        assert_eq!(buf.get_line_content(2), "Xbbb");
        buf.delete(4, 1).unwrap();
        assert_eq!(buf.get_line_content(2), "bbb");
    }

    #[test]
    fn test_multibyte_content() {
        let mut buf = buffer("héllo\nwörld");
        buf.insert("héllo".len(), "!").unwrap();
        assert_eq!(buf.get_value(), "héllo!\nwörld");
        assert_eq!(buf.get_line_content(2), "wörld");
        let pos = buf.get_position_at(buf.len());
        assert_eq!(pos, Position::new(2, "wörld".len() + 1));
        buf.assert_invariants();
    }

    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn below(&mut self, bound: usize) -> usize {
            (self.next() % bound.max(1) as u64) as usize
        }
    }

    fn shadow_line_count(s: &str) -> usize {
        let bytes = s.as_bytes();
        let mut count = 1;
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\r' => {
                    count += 1;
                    if i + 1 < bytes.len() && bytes[i + 1] == b'\n' {
                        i += 1;
                    }
                }
                b'\n' => count += 1,
                _ => {}
            }
            i += 1;
        }
        count
    }

    #[test]
    fn test_random_edits_match_shadow_string() {
        let snippets = ["a", "bc", "\n", "\r", "\r\n", "x\ny", "q\r\nw", ""];
        let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);
        let mut buf = buffer("");
        let mut shadow = String::new();

        for _ in 0..400 {
            if rng.next() % 3 != 0 || shadow.is_empty() {
                let snippet = snippets[rng.below(snippets.len())];
                let offset = rng.below(shadow.len() + 1);
                buf.insert(offset, snippet).unwrap();
                shadow.insert_str(offset, snippet);
            } else {
                let offset = rng.below(shadow.len());
                let cnt = 1 + rng.below((shadow.len() - offset).min(5));
                buf.delete(offset, cnt as isize).unwrap();
                shadow.replace_range(offset..offset + cnt, "");
            }

            assert_eq!(buf.get_value(), shadow);
            assert_eq!(buf.len(), shadow.len());
            assert_eq!(buf.line_count(), shadow_line_count(&shadow));
            buf.assert_invariants();

            let probe = rng.below(shadow.len() + 1);
            let pos = buf.get_position_at(probe);
            assert_eq!(buf.get_offset_at(pos.line_number, pos.column), probe);
        }
    }
}
