//! Derived figures over a parsed toolpath

use super::Point3;
use serde::{Deserialize, Serialize};

/// Feeds below this are reported as zero
pub const NEAR_ZERO_FEED: f64 = 1e-6;

/// Distribution summary of the feed rates active on feed moves
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct FeedStats {
    pub count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    /// Feed moves running at (near) zero feed
    pub near_zero: usize,
}

impl FeedStats {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let near_zero = values.iter().filter(|v| v.abs() < NEAR_ZERO_FEED).count();

        Self {
            count: values.len(),
            min: Some(min),
            max: Some(max),
            mean: Some(mean),
            near_zero,
        }
    }

    pub fn has_zero_feed(&self) -> bool {
        self.near_zero > 0
    }
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Extent {
    pub min: Point3,
    pub max: Point3,
}

impl Extent {
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point3>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = *iter.next()?;
        let mut extent = Extent {
            min: first,
            max: first,
        };
        for p in iter {
            for axis in 0..3 {
                extent.min[axis] = extent.min[axis].min(p[axis]);
                extent.max[axis] = extent.max[axis].max(p[axis]);
            }
        }
        Some(extent)
    }

    pub fn size(&self) -> Point3 {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }
}

/// Travel envelope of the machine, per axis `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MachineBounds {
    pub x: [f64; 2],
    pub y: [f64; 2],
    pub z: [f64; 2],
}

impl Default for MachineBounds {
    fn default() -> Self {
        Self {
            x: [0.0, 300.0],
            y: [0.0, 300.0],
            z: [-50.0, 150.0],
        }
    }
}

impl MachineBounds {
    pub fn contains(&self, extent: &Extent) -> bool {
        let ranges = [self.x, self.y, self.z];
        (0..3).all(|axis| {
            extent.min[axis] >= ranges[axis][0] && extent.max[axis] <= ranges[axis][1]
        })
    }
}
