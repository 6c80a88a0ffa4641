//! Axis-aligned integer box, half-open on every axis

use glam::IVec3;

/// Axis-aligned 3D integer box: `p1` inclusive, `p2` exclusive.
///
/// A rect is expressed in the integer coordinate space of some LOD level;
/// scaling by powers of two converts between levels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect3 {
    pub p1: IVec3,
    pub p2: IVec3,
}

impl Rect3 {
    /// Create a rect from two corners
    pub fn new(p1: IVec3, p2: IVec3) -> Self {
        Self { p1, p2 }
    }

    /// Create a rect from an origin and a size
    pub fn from_origin_size(origin: IVec3, size: IVec3) -> Self {
        Self {
            p1: origin,
            p2: origin + size,
        }
    }

    /// Size on each axis (p2 - p1)
    pub fn size(&self) -> IVec3 {
        self.p2 - self.p1
    }

    pub fn width(&self) -> i32 {
        self.p2.x - self.p1.x
    }

    pub fn height(&self) -> i32 {
        self.p2.y - self.p1.y
    }

    pub fn depth(&self) -> i32 {
        self.p2.z - self.p1.z
    }

    /// Number of cells covered
    pub fn volume(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        let s = self.size();
        s.x as u64 * s.y as u64 * s.z as u64
    }

    /// True if any axis is degenerate
    pub fn is_empty(&self) -> bool {
        self.p1.x >= self.p2.x || self.p1.y >= self.p2.y || self.p1.z >= self.p2.z
    }

    /// Intersection of two rects, `None` when they do not overlap
    pub fn intersection(&self, other: &Rect3) -> Option<Rect3> {
        let r = Rect3 {
            p1: self.p1.max(other.p1),
            p2: self.p2.min(other.p2),
        };
        if r.is_empty() { None } else { Some(r) }
    }

    /// Smallest rect containing both
    pub fn union(&self, other: &Rect3) -> Rect3 {
        Rect3 {
            p1: self.p1.min(other.p1),
            p2: self.p2.max(other.p2),
        }
    }

    /// Translate by an offset
    pub fn translated(&self, offset: IVec3) -> Rect3 {
        Rect3 {
            p1: self.p1 + offset,
            p2: self.p2 + offset,
        }
    }

    /// Express this rect relative to another rect's origin
    pub fn sub_origin(&self, other: &Rect3) -> Rect3 {
        self.translated(-other.p1)
    }

    /// True if `other` lies entirely inside this rect
    pub fn contains(&self, other: &Rect3) -> bool {
        self.p1.x <= other.p1.x
            && self.p1.y <= other.p1.y
            && self.p1.z <= other.p1.z
            && self.p2.x >= other.p2.x
            && self.p2.y >= other.p2.y
            && self.p2.z >= other.p2.z
    }

    pub fn contains_point(&self, p: IVec3) -> bool {
        p.x >= self.p1.x
            && p.x < self.p2.x
            && p.y >= self.p1.y
            && p.y < self.p2.y
            && p.z >= self.p1.z
            && p.z < self.p2.z
    }

    /// Scale both corners by 2^n; negative n divides with mathematical floor.
    ///
    /// Converting a rect to a coarser level assumes its corners are aligned
    /// to that level (always true for octree node footprints).
    pub fn scale_pow2(&self, n: i32) -> Rect3 {
        if n >= 0 {
            let mul = 1 << n as u32;
            Rect3 {
                p1: self.p1 * mul,
                p2: self.p2 * mul,
            }
        } else {
            let div = 1 << (-n) as u32;
            Rect3 {
                p1: IVec3::new(
                    self.p1.x.div_euclid(div),
                    self.p1.y.div_euclid(div),
                    self.p1.z.div_euclid(div),
                ),
                p2: IVec3::new(
                    self.p2.x.div_euclid(div),
                    self.p2.y.div_euclid(div),
                    self.p2.z.div_euclid(div),
                ),
            }
        }
    }

    /// Child octant for octree subdivision, `index` bits select x/y/z halves.
    /// Axis sizes must be even.
    pub fn child_octant(&self, index: u8) -> Rect3 {
        let half = self.size() / 2;
        let offset = IVec3::new(
            if index & 1 != 0 { half.x } else { 0 },
            if index & 2 != 0 { half.y } else { 0 },
            if index & 4 != 0 { half.z } else { 0 },
        );
        Rect3::from_origin_size(self.p1 + offset, half)
    }

    /// Length of the longest axis
    pub fn longest_axis_len(&self) -> i32 {
        self.width().max(self.height()).max(self.depth())
    }

    /// Split in two halves across the longest axis.
    /// The rect must be at least two cells long on that axis.
    pub fn split_longest(&self) -> (Rect3, Rect3) {
        let size = self.size();
        let axis = if size.x >= size.y && size.x >= size.z {
            0
        } else if size.y >= size.z {
            1
        } else {
            2
        };
        let mid = self.p1[axis] + size[axis] / 2;
        let mut a = *self;
        let mut b = *self;
        a.p2[axis] = mid;
        b.p1[axis] = mid;
        (a, b)
    }
}
