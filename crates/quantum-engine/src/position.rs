use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A point on the document plane.
///
/// Positions are totally ordered in reading order: by `y` first, then by `x`.
/// This is the order used to decide which definition a read resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: OrderedFloat<f64>,
    pub y: OrderedFloat<f64>,
}

impl Position {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x: OrderedFloat(x),
            y: OrderedFloat(y),
        }
    }

    #[must_use]
    pub fn origin() -> Self {
        Self::new(0.0, 0.0)
    }

    /// The closest position that still orders strictly before `self`.
    ///
    /// Used to place a cell's reads ahead of its own writes.
    #[must_use]
    pub fn just_before(self) -> Self {
        Self {
            x: OrderedFloat(self.x.0.next_down()),
            y: self.y,
        }
    }

    #[must_use]
    pub fn offset(self, size: Size) -> Self {
        Self::new(self.x.0 + size.width.0, self.y.0 + size.height.0)
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.y.cmp(&other.y).then(self.x.cmp(&other.x))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Width and height of an element, in document units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: OrderedFloat<f64>,
    pub height: OrderedFloat<f64>,
}

impl Size {
    #[must_use]
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width: OrderedFloat(width),
            height: OrderedFloat(height),
        }
    }
}

/// Half-open span `[start, end)` in reading order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: Option<Position>,
    pub end: Option<Position>,
}

impl Span {
    #[must_use]
    pub fn contains(&self, value: Position) -> bool {
        self.start.map_or(true, |start| start <= value) && self.end.map_or(true, |end| value < end)
    }
}
