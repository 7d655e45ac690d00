//! Uniform grid spatial index for entity neighborhood and hit-test queries.

use std::collections::HashMap;
use std::hash::Hash;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index construction.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Entry {
    bucket: u32,
    x: f32,
    y: f32,
}

/// Bounded uniform grid mapping keys to world positions.
///
/// Positions are clamped into `[0, width] x [0, height]` before bucketing, so
/// an entry's recorded cell always matches its recorded position. Radius
/// queries visit exactly the keys whose recorded position lies within the
/// query disc (inclusive), touching only the overlapping cell range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize",
    deserialize = "K: Deserialize<'de> + Eq + Hash"
))]
pub struct GridIndex<K> {
    cell_size: f32,
    width: f32,
    height: f32,
    cols: u32,
    rows: u32,
    buckets: Vec<Vec<K>>,
    entries: HashMap<K, Entry>,
}

impl<K> GridIndex<K>
where
    K: Copy + Eq + Hash + Ord,
{
    /// Create an index over a `width x height` region with square cells.
    pub fn new(cell_size: f32, width: f32, height: f32) -> Result<Self, IndexError> {
        if !cell_size.is_finite() || cell_size <= 0.0 {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        if !width.is_finite() || !height.is_finite() || width <= 0.0 || height <= 0.0 {
            return Err(IndexError::InvalidConfig("extents must be positive"));
        }
        let cols = (width / cell_size).ceil().max(1.0) as u32;
        let rows = (height / cell_size).ceil().max(1.0) as u32;
        let bucket_count = (cols as u64) * (rows as u64);
        if bucket_count > u64::from(u32::MAX) {
            return Err(IndexError::InvalidConfig(
                "cell_size too small for the given extents",
            ));
        }
        Ok(Self {
            cell_size,
            width,
            height,
            cols,
            rows,
            buckets: vec![Vec::new(); bucket_count as usize],
            entries: HashMap::new(),
        })
    }

    /// Number of indexed keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Indexed region as `(width, height)`.
    #[must_use]
    pub fn bounds(&self) -> (f32, f32) {
        (self.width, self.height)
    }

    /// Returns true when nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if `key` is currently indexed.
    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        self.entries.contains_key(&key)
    }

    /// Recorded position of `key`, if indexed.
    #[must_use]
    pub fn position(&self, key: K) -> Option<(f32, f32)> {
        self.entries.get(&key).map(|entry| (entry.x, entry.y))
    }

    /// Drop every entry while retaining bucket capacity.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.entries.clear();
    }

    fn clamp_position(&self, x: f32, y: f32) -> (f32, f32) {
        (x.clamp(0.0, self.width), y.clamp(0.0, self.height))
    }

    fn cell_coords(&self, x: f32, y: f32) -> (u32, u32) {
        let cx = ((x / self.cell_size) as u32).min(self.cols - 1);
        let cy = ((y / self.cell_size) as u32).min(self.rows - 1);
        (cx, cy)
    }

    fn bucket_of(&self, x: f32, y: f32) -> u32 {
        let (cx, cy) = self.cell_coords(x, y);
        cy * self.cols + cx
    }

    /// Index `key` at the given position. Re-indexes if the key is already present.
    pub fn insert(&mut self, key: K, x: f32, y: f32) {
        if self.entries.contains_key(&key) {
            self.update(key, x, y);
            return;
        }
        let (x, y) = self.clamp_position(x, y);
        let bucket = self.bucket_of(x, y);
        self.buckets[bucket as usize].push(key);
        self.entries.insert(key, Entry { bucket, x, y });
    }

    /// Remove `key` from the index, returning whether it was present.
    pub fn remove(&mut self, key: K) -> bool {
        let Some(entry) = self.entries.remove(&key) else {
            return false;
        };
        let bucket = &mut self.buckets[entry.bucket as usize];
        if let Some(slot) = bucket.iter().position(|candidate| *candidate == key) {
            bucket.swap_remove(slot);
        }
        true
    }

    /// Move `key` to a new position, re-bucketing only when its cell changed.
    /// Unknown keys are inserted.
    pub fn update(&mut self, key: K, x: f32, y: f32) {
        let (x, y) = self.clamp_position(x, y);
        let bucket = self.bucket_of(x, y);
        match self.entries.get_mut(&key) {
            Some(entry) if entry.bucket == bucket => {
                entry.x = x;
                entry.y = y;
            }
            Some(entry) => {
                let previous = entry.bucket;
                entry.bucket = bucket;
                entry.x = x;
                entry.y = y;
                let old = &mut self.buckets[previous as usize];
                if let Some(slot) = old.iter().position(|candidate| *candidate == key) {
                    old.swap_remove(slot);
                }
                self.buckets[bucket as usize].push(key);
            }
            None => {
                self.buckets[bucket as usize].push(key);
                self.entries.insert(key, Entry { bucket, x, y });
            }
        }
    }

    /// Visit every indexed key whose recorded position lies within `radius`
    /// of `center` (inclusive), passing the key and its distance.
    pub fn query_radius(&self, center: (f32, f32), radius: f32, visitor: &mut dyn FnMut(K, f32)) {
        if !radius.is_finite() || radius < 0.0 {
            return;
        }
        let (x0, y0) = self.clamp_position(center.0 - radius, center.1 - radius);
        let (x1, y1) = self.clamp_position(center.0 + radius, center.1 + radius);
        let (cx0, cy0) = self.cell_coords(x0, y0);
        let (cx1, cy1) = self.cell_coords(x1, y1);
        let radius_sq = radius * radius;
        for cy in cy0..=cy1 {
            for cx in cx0..=cx1 {
                let bucket = (cy * self.cols + cx) as usize;
                for key in &self.buckets[bucket] {
                    let entry = &self.entries[key];
                    let dx = entry.x - center.0;
                    let dy = entry.y - center.1;
                    let dist_sq = dx * dx + dy * dy;
                    if dist_sq <= radius_sq {
                        visitor(*key, dist_sq.sqrt());
                    }
                }
            }
        }
    }

    /// Nearest indexed key within `radius` of `point`, with its distance.
    ///
    /// Equal distances tie-break on the lowest key, so results are
    /// deterministic regardless of insertion history.
    #[must_use]
    pub fn nearest_within(&self, point: (f32, f32), radius: f32) -> Option<(K, f32)> {
        let mut best: Option<(OrderedFloat<f32>, K)> = None;
        self.query_radius(point, radius, &mut |key, dist| {
            let candidate = (OrderedFloat(dist), key);
            if best.is_none_or(|current| candidate < current) {
                best = Some(candidate);
            }
        });
        best.map(|(dist, key)| (key, dist.into_inner()))
    }
}
