//! Abstract coordinate system: spaces, positions, and regions.
//!
//! Tiers address their content through a [`Space`], a bounded run of
//! positions starting at index 0. A [`Region`] is a contiguous inclusive
//! span of positions within one space. All arithmetic is total: stepping
//! past either edge of a space yields the space's out-of-bounds sentinel
//! rather than wrapping.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// Number of positions covered by a region or page.
pub type Size = u64;

/// Unique identifier for a space.
pub type SpaceId = u64;

/// Global monotonic space ID counter.
static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(0);

/// Allocate a new unique space ID.
fn new_space_id() -> SpaceId {
    NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Index reserved for the out-of-bounds sentinel position.
const OUT_OF_BOUNDS_INDEX: u64 = u64::MAX;

#[derive(Error, Debug)]
pub enum AddressingError {
    #[error("position {position} is outside space {space} of length {len}")]
    OutOfBounds {
        position: Position,
        space: SpaceId,
        len: u64,
    },

    #[error("position {position} does not belong to space {space}")]
    SpaceMismatch { position: Position, space: SpaceId },

    #[error("region {start}..={end} has size {actual}, expected {expected}")]
    WrongSize {
        start: Position,
        end: Position,
        expected: Size,
        actual: Size,
    },

    #[error("inverted region: start {start} is after end {end}")]
    Inverted { start: Position, end: Position },

    #[error("page size {page_size} is invalid for a space of length {len}")]
    InvalidPageSize { page_size: Size, len: u64 },
}

/// An ordered point within one space.
///
/// Positions are plain values; the space they belong to owns the arithmetic
/// ([`Space::add`], [`Space::next`], ...). A position whose index equals the
/// sentinel is "out of bounds" for its space and rejected by every consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    space: SpaceId,
    index: u64,
}

impl Position {
    /// The space this position belongs to.
    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Zero-based index within the space.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Whether this is the out-of-bounds sentinel for its space.
    pub fn is_out_of_bounds(&self) -> bool {
        self.index == OUT_OF_BOUNDS_INDEX
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_out_of_bounds() {
            write!(f, "s{}:oob", self.space)
        } else {
            write!(f, "s{}:{}", self.space, self.index)
        }
    }
}

/// A bounded address space of `len` positions, indexed `0..len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Space {
    id: SpaceId,
    len: u64,
}

impl Space {
    /// Create a new space with a fresh identity.
    pub fn new(len: u64) -> Self {
        Self {
            id: new_space_id(),
            len,
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Number of addressable positions.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The out-of-bounds sentinel for this space.
    pub fn out_of_bounds(&self) -> Position {
        Position {
            space: self.id,
            index: OUT_OF_BOUNDS_INDEX,
        }
    }

    /// Position at `index`, or the sentinel if `index` is past the end.
    pub fn position(&self, index: u64) -> Position {
        if index < self.len {
            Position {
                space: self.id,
                index,
            }
        } else {
            self.out_of_bounds()
        }
    }

    /// The first position of the space, or the sentinel for an empty space.
    pub fn origin(&self) -> Position {
        self.position(0)
    }

    /// Whether `position` is a valid in-bounds position of this space.
    pub fn contains(&self, position: Position) -> bool {
        position.space == self.id && position.index < self.len
    }

    /// `position + count`, or the sentinel on overflow or out-of-space input.
    pub fn add(&self, position: Position, count: Size) -> Position {
        if !self.contains(position) {
            return self.out_of_bounds();
        }
        match position.index.checked_add(count) {
            Some(index) => self.position(index),
            None => self.out_of_bounds(),
        }
    }

    /// `position - count`, or the sentinel when stepping before the origin.
    pub fn subtract(&self, position: Position, count: Size) -> Position {
        if !self.contains(position) {
            return self.out_of_bounds();
        }
        match position.index.checked_sub(count) {
            Some(index) => self.position(index),
            None => self.out_of_bounds(),
        }
    }

    /// The position immediately after `position`.
    pub fn next(&self, position: Position) -> Position {
        self.add(position, 1)
    }

    /// The position immediately before `position`.
    pub fn previous(&self, position: Position) -> Position {
        self.subtract(position, 1)
    }

    /// Map a position from another space into this one by index.
    ///
    /// Used by swappers to translate addresses between tiers. Returns the
    /// sentinel when the index does not exist here.
    pub fn from(&self, other: Position) -> Position {
        if other.is_out_of_bounds() {
            return self.out_of_bounds();
        }
        self.position(other.index)
    }

    /// Build the inclusive region `start..=end`.
    pub fn region(&self, start: Position, end: Position) -> Result<Region, AddressingError> {
        for position in [start, end] {
            if position.space != self.id {
                return Err(AddressingError::SpaceMismatch {
                    position,
                    space: self.id,
                });
            }
            if !self.contains(position) {
                return Err(AddressingError::OutOfBounds {
                    position,
                    space: self.id,
                    len: self.len,
                });
            }
        }
        if start.index > end.index {
            return Err(AddressingError::Inverted { start, end });
        }
        Ok(Region {
            space: self.id,
            start: start.index,
            end: end.index,
        })
    }
}

/// A contiguous inclusive span of positions within one space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    space: SpaceId,
    start: u64,
    end: u64,
}

impl Region {
    pub fn space(&self) -> SpaceId {
        self.space
    }

    pub fn start(&self) -> Position {
        Position {
            space: self.space,
            index: self.start,
        }
    }

    pub fn end(&self) -> Position {
        Position {
            space: self.space,
            index: self.end,
        }
    }

    /// Number of positions covered (inclusive span, never zero).
    pub fn size(&self) -> Size {
        self.end - self.start + 1
    }

    pub fn contains(&self, position: Position) -> bool {
        position.space == self.space && position.index >= self.start && position.index <= self.end
    }

    /// Offset of `position` from the region start, if it lies inside.
    pub fn offset(&self, position: Position) -> Option<u64> {
        if self.contains(position) {
            Some(position.index - self.start)
        } else {
            None
        }
    }

    /// Position at `offset` from the region start, or the sentinel past the end.
    pub fn at(&self, offset: u64) -> Position {
        if offset < self.size() {
            Position {
                space: self.space,
                index: self.start + offset,
            }
        } else {
            Position {
                space: self.space,
                index: OUT_OF_BOUNDS_INDEX,
            }
        }
    }

    /// Iterate every position in the region, in order.
    pub fn positions(&self) -> impl Iterator<Item = Position> + '_ {
        (0..self.size()).map(move |offset| self.at(offset))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}:{}..={}", self.space, self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_identity_unique() {
        let a = Space::new(16);
        let b = Space::new(16);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_arithmetic_at_edges() {
        let space = Space::new(16);
        let p = space.position(15);
        assert!(space.contains(p));
        assert!(space.next(p).is_out_of_bounds());
        assert_eq!(space.previous(p), space.position(14));
        assert!(space.subtract(space.origin(), 1).is_out_of_bounds());
    }

    #[test]
    fn test_add_does_not_wrap() {
        let space = Space::new(16);
        let p = space.position(8);
        assert!(space.add(p, u64::MAX).is_out_of_bounds());
    }

    #[test]
    fn test_region_size_and_offsets() {
        let space = Space::new(32);
        let region = space.region(space.position(4), space.position(11)).unwrap();
        assert_eq!(region.size(), 8);
        assert_eq!(region.offset(space.position(4)), Some(0));
        assert_eq!(region.offset(space.position(11)), Some(7));
        assert_eq!(region.offset(space.position(12)), None);
        assert!(region.at(8).is_out_of_bounds());
        assert_eq!(region.positions().count(), 8);
    }

    #[test]
    fn test_region_rejects_inverted_and_foreign() {
        let space = Space::new(8);
        let other = Space::new(8);
        assert!(matches!(
            space.region(space.position(5), space.position(2)),
            Err(AddressingError::Inverted { .. })
        ));
        assert!(matches!(
            space.region(other.position(0), space.position(2)),
            Err(AddressingError::SpaceMismatch { .. })
        ));
    }

    #[test]
    fn test_from_maps_by_index() {
        let a = Space::new(16);
        let b = Space::new(8);
        assert_eq!(b.from(a.position(3)), b.position(3));
        assert!(b.from(a.position(12)).is_out_of_bounds());
        assert!(b.from(a.out_of_bounds()).is_out_of_bounds());
    }
}
