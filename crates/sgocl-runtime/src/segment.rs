//! Contiguous index ranges assigned to devices.

use std::fmt;
use std::ops::Range;

/// Half-open element range `[start, end)` owned by one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
}

impl Segment {
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    #[must_use]
    pub const fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// The same range in bytes for elements of `element_size` bytes.
    #[must_use]
    pub const fn byte_range(&self, element_size: usize) -> Range<usize> {
        self.start * element_size..self.end * element_size
    }
}

impl From<Range<usize>> for Segment {
    fn from(r: Range<usize>) -> Self {
        Self { start: r.start, end: r.end }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
