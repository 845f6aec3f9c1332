//! 1-based positions and ranges, the value types consumers address the
//! buffer with. Offsets elsewhere in the crate are 0-based byte offsets;
//! these types exist for the line/column surface.

/// A position in the document: 1-based line number and 1-based column.
/// Column 1 is the position before the first byte of the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    pub line_number: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line_number: usize, column: usize) -> Self {
        Position {
            line_number,
            column,
        }
    }

    /// Is this position before or equal to `other` in document order?
    pub fn is_before_or_equal(&self, other: &Position) -> bool {
        (self.line_number, self.column) <= (other.line_number, other.column)
    }
}

/// A range between two positions, both 1-based. Construction normalizes
/// the endpoints so that start <= end; a reversed range is silently
/// reordered, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start_line_number: usize,
    pub start_column: usize,
    pub end_line_number: usize,
    pub end_column: usize,
}

impl Range {
    pub fn new(
        start_line_number: usize,
        start_column: usize,
        end_line_number: usize,
        end_column: usize,
    ) -> Self {
        let start = (start_line_number, start_column);
        let end = (end_line_number, end_column);
        let (start, end) = if start <= end {
            (start, end)
        } else {
            (end, start)
        };
        Range {
            start_line_number: start.0,
            start_column: start.1,
            end_line_number: end.0,
            end_column: end.1,
        }
    }

    pub fn from_positions(start: Position, end: Position) -> Self {
        Range::new(start.line_number, start.column, end.line_number, end.column)
    }

    pub fn start_position(&self) -> Position {
        Position::new(self.start_line_number, self.start_column)
    }

    pub fn end_position(&self) -> Position {
        Position::new(self.end_line_number, self.end_column)
    }

    /// True when the range spans no content.
    pub fn is_empty(&self) -> bool {
        self.start_line_number == self.end_line_number && self.start_column == self.end_column
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_normalizes_reversed_endpoints() {
        let range = Range::new(3, 7, 1, 2);
        assert_eq!(range.start_position(), Position::new(1, 2));
        assert_eq!(range.end_position(), Position::new(3, 7));
    }

    #[test]
    fn test_range_same_line_reversed_columns() {
        let range = Range::new(2, 9, 2, 4);
        assert_eq!(range.start_column, 4);
        assert_eq!(range.end_column, 9);
    }

    #[test]
    fn test_empty_range() {
        assert!(Range::new(1, 1, 1, 1).is_empty());
        assert!(!Range::new(1, 1, 1, 2).is_empty());
    }

    #[test]
    fn test_position_ordering() {
        assert!(Position::new(1, 5).is_before_or_equal(&Position::new(2, 1)));
        assert!(Position::new(2, 1).is_before_or_equal(&Position::new(2, 1)));
        assert!(!Position::new(2, 2).is_before_or_equal(&Position::new(2, 1)));
    }
}
