//! `CuttingPath` (§3): a deduplicated set of rounded `(x, y)` pairs populated
//! by `MillingController` for progress visualization.

use std::collections::BTreeSet;

/// Rounds a coordinate to 0.1 mm and represents it as an ordered fixed-point
/// integer so the set can use a total order (`f64` isn't `Ord`).
fn round_tenth(v: f64) -> i64 {
    (v * 10.0).round() as i64
}

#[derive(Debug, Clone, Default)]
pub struct CuttingPath {
    points: BTreeSet<(i64, i64)>,
}

impl CuttingPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `(x, y)`, rounded to 0.1 mm; no-op if already present.
    pub fn add(&mut self, x: f64, y: f64) {
        self.points.insert((round_tenth(x), round_tenth(y)));
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Snapshot the points as millimeter coordinates.
    pub fn points(&self) -> Vec<(f64, f64)> {
        self.points
            .iter()
            .map(|&(ix, iy)| (ix as f64 / 10.0, iy as f64 / 10.0))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupes_points_rounded_to_tenth_mm() {
        let mut path = CuttingPath::new();
        path.add(1.04, 2.06);
        path.add(1.041, 2.057);
        assert_eq!(path.len(), 1);
        assert_eq!(path.points(), vec![(1.0, 2.1)]);
    }
}
