//! Toolpath interpretation
//!
//! Turns line-oriented machine-control text into renderer-agnostic geometry:
//! - a sequence of interpreted moves (modal values left unresolved)
//! - kind-homogeneous polylines built from the modal-resolved positions
//! - the unit system declared by the text, if any
//! - the feed rates that were active on feed moves

mod parser;
mod stats;

pub use parser::parse;
pub use stats::{Extent, FeedStats, MachineBounds};

use serde::Serialize;

/// Motion intent of a move or polyline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveKind {
    /// Positioning move at machine rapid rate (RAPID / G0)
    Rapid,
    /// Cutting move at the programmed feed rate (FEED / G1)
    Feed,
}

impl std::fmt::Display for MoveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MoveKind::Rapid => write!(f, "rapid"),
            MoveKind::Feed => write!(f, "feed"),
        }
    }
}

/// Unit system declared by the text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Mm,
    Inch,
    /// No directive, or both directives, were seen
    #[default]
    Unknown,
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unit::Mm => write!(f, "mm"),
            Unit::Inch => write!(f, "inch"),
            Unit::Unknown => write!(f, "unknown"),
        }
    }
}

/// One interpreted motion command.
///
/// Axis fields are `None` when the line did not mention the axis; the
/// effective position is whatever the previous move left behind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Move {
    pub kind: MoveKind,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    /// Feed rate in effect for this move (modal for feed moves)
    pub feed: Option<f64>,
}

/// A point in toolpath space
pub type Point3 = [f64; 3];

/// Connected points sharing one motion kind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Polyline {
    pub kind: MoveKind,
    pub points: Vec<Point3>,
}

impl Polyline {
    /// Total path length
    pub fn length(&self) -> f64 {
        self.points
            .windows(2)
            .map(|w| {
                let dx = w[1][0] - w[0][0];
                let dy = w[1][1] - w[0][1];
                let dz = w[1][2] - w[0][2];
                (dx * dx + dy * dy + dz * dz).sqrt()
            })
            .sum()
    }
}

/// Result of interpreting one toolpath text
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ParseResult {
    /// Polylines in source order; never mixes kinds, never shorter than 2 points
    pub polylines: Vec<Polyline>,
    pub unit: Unit,
    /// Every feed rate active on a feed move, in order
    pub feed_values: Vec<f64>,
    /// Interpreted moves in source order
    pub moves: Vec<Move>,
    /// False when feed moves exist but no `F` word appears anywhere
    pub feed_declared: bool,
}

impl ParseResult {
    /// Polylines of one kind
    pub fn polylines_of(&self, kind: MoveKind) -> impl Iterator<Item = &Polyline> {
        self.polylines.iter().filter(move |p| p.kind == kind)
    }

    /// Bounding box over every polyline point
    pub fn extent(&self) -> Option<Extent> {
        Extent::from_points(self.polylines.iter().flat_map(|p| p.points.iter()))
    }

    pub fn feed_stats(&self) -> FeedStats {
        FeedStats::from_values(&self.feed_values)
    }
}
