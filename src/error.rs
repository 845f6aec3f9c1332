use thiserror::Error;

/// Errors reported by the mutating buffer operations.
///
/// These are programming-contract violations: the structure is purely
/// computational, so there is no retry or partial-failure model. Queries
/// clamp instead of failing (matching the source semantics); only edits
/// addressed outside the document report an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PieceTreeError {
    /// An edit addressed a byte offset outside the document, or a delete
    /// range resolved to a start before offset 0.
    #[error("offset {offset} out of bounds (document length {len})")]
    OffsetOutOfBounds { offset: usize, len: usize },
}
