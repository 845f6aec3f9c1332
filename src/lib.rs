//! A piece tree text buffer.
//!
//! The document is stored as a sequence of immutable text chunks plus one
//! append-only add buffer; a balanced tree of "pieces" (spans into those
//! chunks) gives the current document order. Edits never move existing
//! text: an insert appends to the add buffer and splices pieces, a delete
//! trims or drops pieces. Per-node subtree totals make offset and line
//! lookups O(log n) in the number of pieces.
//!
//! Offsets are byte offsets into UTF-8 text and must fall on character
//! boundaries. Positions are 1-based `(line, column)` pairs, with columns
//! counted in bytes. Line terminators `\n`, `\r` and `\r\n` are all
//! recognized; a `\r\n` pair always counts as a single break, no matter
//! how edits arrange the pieces around it.
//!
//! ```
//! use piece_tree::PieceTreeBuffer;
//!
//! let mut buffer = PieceTreeBuffer::from_str("hello\nworld");
//! buffer.insert(5, " there").unwrap();
//! assert_eq!(buffer.get_value(), "hello there\nworld");
//! assert_eq!(buffer.get_line_content(2), "world");
//! ```
//!
//! For streamed loading use [`PieceTreeBuilder`], which handles chunk
//! boundaries inside `\r\n`, strips the UTF-8 BOM and picks the dominant
//! end-of-line style.

mod buffer;
mod builder;
mod cache;
mod error;
mod position;
mod snapshot;
mod tree;
mod tree_buffer;

pub use buffer::{BufferCursor, EndOfLine, StringBuffer};
pub use builder::{PieceTreeBuilder, PieceTreeFactory};
pub use error::PieceTreeError;
pub use position::{Position, Range};
pub use snapshot::PieceTreeSnapshot;
pub use tree::Piece;
pub use tree_buffer::PieceTreeBuffer;
