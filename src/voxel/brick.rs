//! Voxel brick: a fixed W×H×D×C byte grid with rectangular ops.
//!
//! The brick is the unit of disk storage and of the in-memory LRU. Region
//! reads and writes also need the same rect ops over caller-supplied byte
//! buffers, so the ops live on borrowed [`GridRef`]/[`GridMut`] views and
//! [`Brick`] wraps an owned buffer plus memoized emptiness flags.
//!
//! Density semantics put the sample in the first byte of each voxel:
//! < 128 is outside the volume, >= 128 inside. The counting variants keep a
//! node's occupancy in sync; the histogram variants do the same for the
//! 256-bin material census.

use std::cell::Cell;

use glam::{IVec3, UVec3};

use crate::error::Result;
use crate::math::Rect3;

/// Density threshold: first byte >= this is "inside the volume"
pub const DENSITY_INSIDE: u8 = 128;

/// Per-voxel-value census of a grid
pub type Histogram = [i64; 256];

fn voxel_index(dims: UVec3, n_cmp: u32, p: IVec3) -> usize {
    debug_assert!(
        p.x >= 0
            && p.y >= 0
            && p.z >= 0
            && (p.x as u32) < dims.x
            && (p.y as u32) < dims.y
            && (p.z as u32) < dims.z
    );
    n_cmp as usize
        * (dims.x as usize * (dims.y as usize * p.z as usize + p.y as usize) + p.x as usize)
}

/// Borrowed read-only grid view
#[derive(Clone, Copy)]
pub struct GridRef<'a> {
    dims: UVec3,
    n_cmp: u32,
    data: &'a [u8],
}

impl<'a> GridRef<'a> {
    pub fn new(dims: UVec3, n_cmp: u32, data: &'a [u8]) -> Self {
        debug_assert_eq!(
            data.len(),
            dims.x as usize * dims.y as usize * dims.z as usize * n_cmp as usize
        );
        Self { dims, n_cmp, data }
    }

    pub fn dims(&self) -> UVec3 {
        self.dims
    }

    pub fn n_cmp(&self) -> u32 {
        self.n_cmp
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Whole-grid rect in local coordinates
    pub fn full_rect(&self) -> Rect3 {
        Rect3::new(IVec3::ZERO, self.dims.as_ivec3())
    }

    /// First component of the voxel at `p`
    pub fn sample(&self, p: IVec3) -> u8 {
        self.data[voxel_index(self.dims, self.n_cmp, p)]
    }

    pub fn offset(&self, p: IVec3) -> &'a [u8] {
        let i = voxel_index(self.dims, self.n_cmp, p);
        &self.data[i..i + self.n_cmp as usize]
    }

    /// True when no voxel of `rect` (whole grid if `None`) is inside the
    /// volume under density semantics
    pub fn is_empty_density(&self, rect: Option<&Rect3>) -> bool {
        self.scan(rect, |v| v < DENSITY_INSIDE)
    }

    /// True when every voxel of `rect` is inside the volume under density
    /// semantics
    pub fn is_full_density(&self, rect: Option<&Rect3>) -> bool {
        self.scan(rect, |v| v >= DENSITY_INSIDE)
    }

    /// First-byte value shared by every voxel of `rect`, if any
    pub fn is_uniform(&self, rect: Option<&Rect3>) -> Option<u8> {
        let r = rect.copied().unwrap_or_else(|| self.full_rect());
        let first = self.sample(r.p1);
        if self.scan(Some(&r), |v| v == first) {
            Some(first)
        } else {
            None
        }
    }

    fn scan(&self, rect: Option<&Rect3>, pred: impl Fn(u8) -> bool) -> bool {
        let r = rect.copied().unwrap_or_else(|| self.full_rect());
        for z in r.p1.z..r.p2.z {
            for y in r.p1.y..r.p2.y {
                for x in r.p1.x..r.p2.x {
                    if !pred(self.sample(IVec3::new(x, y, z))) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// Borrowed mutable grid view
pub struct GridMut<'a> {
    dims: UVec3,
    n_cmp: u32,
    data: &'a mut [u8],
}

impl<'a> GridMut<'a> {
    pub fn new(dims: UVec3, n_cmp: u32, data: &'a mut [u8]) -> Self {
        debug_assert_eq!(
            data.len(),
            dims.x as usize * dims.y as usize * dims.z as usize * n_cmp as usize
        );
        Self { dims, n_cmp, data }
    }

    pub fn as_ref(&self) -> GridRef<'_> {
        GridRef {
            dims: self.dims,
            n_cmp: self.n_cmp,
            data: &*self.data,
        }
    }

    pub fn dims(&self) -> UVec3 {
        self.dims
    }

    pub fn offset_mut(&mut self, p: IVec3) -> &mut [u8] {
        let i = voxel_index(self.dims, self.n_cmp, p);
        &mut self.data[i..i + self.n_cmp as usize]
    }

    /// Write `pattern` into every voxel of `rect` (whole grid if `None`)
    pub fn fill(&mut self, rect: Option<&Rect3>, pattern: &[u8]) {
        let r = rect.copied().unwrap_or_else(|| self.as_ref().full_rect());
        let n = self.n_cmp as usize;
        for z in r.p1.z..r.p2.z {
            for y in r.p1.y..r.p2.y {
                for x in r.p1.x..r.p2.x {
                    self.offset_mut(IVec3::new(x, y, z))
                        .copy_from_slice(&pattern[..n]);
                }
            }
        }
    }

    /// Fill returning the signed change in density occupancy
    pub fn fill_counting(&mut self, rect: &Rect3, value: u8) -> i64 {
        let mut delta = 0i64;
        for z in rect.p1.z..rect.p2.z {
            for y in rect.p1.y..rect.p2.y {
                for x in rect.p1.x..rect.p2.x {
                    let v = self.offset_mut(IVec3::new(x, y, z));
                    delta += (value >= DENSITY_INSIDE) as i64 - (v[0] >= DENSITY_INSIDE) as i64;
                    v[0] = value;
                }
            }
        }
        delta
    }

    /// Fill keeping a 256-bin census in sync: overwritten values are
    /// decremented, written values incremented
    pub fn fill_histogram(&mut self, rect: &Rect3, value: u8, hist: &mut Histogram) {
        for z in rect.p1.z..rect.p2.z {
            for y in rect.p1.y..rect.p2.y {
                for x in rect.p1.x..rect.p2.x {
                    let v = self.offset_mut(IVec3::new(x, y, z));
                    hist[v[0] as usize] -= 1;
                    hist[value as usize] += 1;
                    v[0] = value;
                }
            }
        }
    }

    /// Copy the geometric correspondence of `src_rect` into `dst_rect`.
    ///
    /// The copied extent is the componentwise minimum of the two rects, and
    /// min(src, dst) components are copied per voxel.
    pub fn copy_from(&mut self, dst_rect: &Rect3, src: &GridRef<'_>, src_rect: &Rect3) {
        let ext = dst_rect.size().min(src_rect.size());
        let n = (self.n_cmp.min(src.n_cmp)) as usize;
        for z in 0..ext.z {
            for y in 0..ext.y {
                for x in 0..ext.x {
                    let o = IVec3::new(x, y, z);
                    let s = src.offset(src_rect.p1 + o);
                    self.offset_mut(dst_rect.p1 + o)[..n].copy_from_slice(&s[..n]);
                }
            }
        }
    }

    /// Copy returning the signed change in density occupancy of the
    /// destination
    pub fn copy_from_counting(
        &mut self,
        dst_rect: &Rect3,
        src: &GridRef<'_>,
        src_rect: &Rect3,
    ) -> i64 {
        let ext = dst_rect.size().min(src_rect.size());
        let n = (self.n_cmp.min(src.n_cmp)) as usize;
        let mut delta = 0i64;
        for z in 0..ext.z {
            for y in 0..ext.y {
                for x in 0..ext.x {
                    let o = IVec3::new(x, y, z);
                    let s = src.offset(src_rect.p1 + o);
                    let d = self.offset_mut(dst_rect.p1 + o);
                    delta += (s[0] >= DENSITY_INSIDE) as i64 - (d[0] >= DENSITY_INSIDE) as i64;
                    d[..n].copy_from_slice(&s[..n]);
                }
            }
        }
        delta
    }

    /// Copy keeping a 256-bin census of the destination in sync
    pub fn copy_from_histogram(
        &mut self,
        dst_rect: &Rect3,
        src: &GridRef<'_>,
        src_rect: &Rect3,
        hist: &mut Histogram,
    ) {
        let ext = dst_rect.size().min(src_rect.size());
        let n = (self.n_cmp.min(src.n_cmp)) as usize;
        for z in 0..ext.z {
            for y in 0..ext.y {
                for x in 0..ext.x {
                    let o = IVec3::new(x, y, z);
                    let s = src.offset(src_rect.p1 + o);
                    let d = self.offset_mut(dst_rect.p1 + o);
                    hist[d[0] as usize] -= 1;
                    hist[s[0] as usize] += 1;
                    d[..n].copy_from_slice(&s[..n]);
                }
            }
        }
    }
}

/// Owned voxel brick. Dimensions are fixed at allocation.
pub struct Brick {
    dims: UVec3,
    n_cmp: u32,
    data: Vec<u8>,
    /// Memoized whole-brick emptiness; cleared by every mutator
    empty: Cell<Option<bool>>,
    full: Cell<Option<bool>>,
}

impl Brick {
    pub fn new(dims: UVec3, n_cmp: u32) -> Result<Self> {
        let size = dims.x as usize * dims.y as usize * dims.z as usize * n_cmp as usize;
        let mut data = Vec::new();
        data.try_reserve_exact(size)?;
        data.resize(size, 0);
        Ok(Self {
            dims,
            n_cmp,
            data,
            empty: Cell::new(None),
            full: Cell::new(None),
        })
    }

    pub fn dims(&self) -> UVec3 {
        self.dims
    }

    pub fn n_cmp(&self) -> u32 {
        self.n_cmp
    }

    /// Number of voxels
    pub fn num_voxels(&self) -> u64 {
        self.dims.x as u64 * self.dims.y as u64 * self.dims.z as u64
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.invalidate();
        &mut self.data
    }

    pub fn as_grid(&self) -> GridRef<'_> {
        GridRef::new(self.dims, self.n_cmp, &self.data)
    }

    pub fn as_grid_mut(&mut self) -> GridMut<'_> {
        self.invalidate();
        GridMut::new(self.dims, self.n_cmp, &mut self.data)
    }

    pub fn offset(&mut self, p: IVec3) -> &mut [u8] {
        self.invalidate();
        let i = voxel_index(self.dims, self.n_cmp, p);
        &mut self.data[i..i + self.n_cmp as usize]
    }

    pub fn fill(&mut self, rect: Option<&Rect3>, pattern: &[u8]) {
        self.as_grid_mut().fill(rect, pattern);
    }

    pub fn fill_counting(&mut self, rect: &Rect3, value: u8) -> i64 {
        self.as_grid_mut().fill_counting(rect, value)
    }

    pub fn fill_histogram(&mut self, rect: &Rect3, value: u8, hist: &mut Histogram) {
        self.as_grid_mut().fill_histogram(rect, value, hist);
    }

    pub fn copy_from(&mut self, dst_rect: &Rect3, src: &GridRef<'_>, src_rect: &Rect3) {
        self.as_grid_mut().copy_from(dst_rect, src, src_rect);
    }

    pub fn copy_from_counting(
        &mut self,
        dst_rect: &Rect3,
        src: &GridRef<'_>,
        src_rect: &Rect3,
    ) -> i64 {
        self.as_grid_mut().copy_from_counting(dst_rect, src, src_rect)
    }

    pub fn copy_from_histogram(
        &mut self,
        dst_rect: &Rect3,
        src: &GridRef<'_>,
        src_rect: &Rect3,
        hist: &mut Histogram,
    ) {
        self.as_grid_mut().copy_from_histogram(dst_rect, src, src_rect, hist);
    }

    /// Density emptiness of `rect`, whole brick if `None`.
    /// The whole-brick answer is memoized until the next mutation.
    pub fn is_empty(&self, rect: Option<&Rect3>) -> bool {
        if self.empty.get() == Some(true) {
            return true;
        }
        match rect {
            None => {
                let v = self.as_grid().is_empty_density(None);
                self.empty.set(Some(v));
                v
            }
            Some(r) => self.as_grid().is_empty_density(Some(r)),
        }
    }

    /// Density fullness of `rect`, whole brick if `None`, memoized likewise
    pub fn is_full(&self, rect: Option<&Rect3>) -> bool {
        if self.full.get() == Some(true) {
            return true;
        }
        match rect {
            None => {
                let v = self.as_grid().is_full_density(None);
                self.full.set(Some(v));
                v
            }
            Some(r) => self.as_grid().is_full_density(Some(r)),
        }
    }

    pub fn is_uniform(&self, rect: Option<&Rect3>) -> Option<u8> {
        self.as_grid().is_uniform(rect)
    }

    fn invalidate(&self) {
        self.empty.set(None);
        self.full.set(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brick(d: u32) -> Brick {
        Brick::new(UVec3::splat(d), 1).unwrap()
    }

    #[test]
    fn test_new_is_zeroed() {
        let b = brick(4);
        assert_eq!(b.data().len(), 64);
        assert!(b.is_empty(None));
        assert!(!b.is_full(None));
    }

    #[test]
    fn test_fill_rect() {
        let mut b = brick(4);
        let r = Rect3::new(IVec3::splat(1), IVec3::splat(3));
        b.fill(Some(&r), &[200]);
        assert_eq!(b.as_grid().sample(IVec3::splat(1)), 200);
        assert_eq!(b.as_grid().sample(IVec3::splat(3)), 0);
        assert!(!b.is_empty(None));
        assert!(b.is_empty(Some(&Rect3::new(IVec3::ZERO, IVec3::new(4, 4, 1)))));
    }

    #[test]
    fn test_fill_counting_delta() {
        let mut b = brick(2);
        let whole = b.as_grid().full_rect();
        assert_eq!(b.fill_counting(&whole, 255), 8);
        assert_eq!(b.fill_counting(&whole, 255), 0);
        let half = Rect3::new(IVec3::ZERO, IVec3::new(2, 2, 1));
        assert_eq!(b.fill_counting(&half, 0), -4);
    }

    #[test]
    fn test_fill_histogram_tracks_overwrites() {
        let mut b = brick(2);
        let mut hist: Histogram = [0; 256];
        hist[0] = 8;
        let whole = b.as_grid().full_rect();
        b.fill_histogram(&whole, 7, &mut hist);
        assert_eq!(hist[0], 0);
        assert_eq!(hist[7], 8);
        let one = Rect3::new(IVec3::ZERO, IVec3::ONE);
        b.fill_histogram(&one, 9, &mut hist);
        assert_eq!(hist[7], 7);
        assert_eq!(hist[9], 1);
    }

    #[test]
    fn test_copy_between_offsets() {
        let mut src = brick(4);
        src.fill(Some(&Rect3::new(IVec3::ZERO, IVec3::splat(2))), &[130]);
        let mut dst = brick(4);
        let dst_rect = Rect3::new(IVec3::splat(2), IVec3::splat(4));
        let src_rect = Rect3::new(IVec3::ZERO, IVec3::splat(2));
        let delta = dst.copy_from_counting(&dst_rect, &src.as_grid(), &src_rect);
        assert_eq!(delta, 8);
        assert_eq!(dst.as_grid().sample(IVec3::splat(2)), 130);
        assert_eq!(dst.as_grid().sample(IVec3::ZERO), 0);
    }

    #[test]
    fn test_copy_extent_is_componentwise_min() {
        let mut src = brick(4);
        src.fill(None, &[140]);
        let mut dst = brick(4);
        // destination rect is wider than the source rect on x
        let dst_rect = Rect3::new(IVec3::ZERO, IVec3::new(4, 2, 2));
        let src_rect = Rect3::new(IVec3::ZERO, IVec3::new(2, 2, 2));
        dst.copy_from(&dst_rect, &src.as_grid(), &src_rect);
        assert_eq!(dst.as_grid().sample(IVec3::new(1, 0, 0)), 140);
        assert_eq!(dst.as_grid().sample(IVec3::new(2, 0, 0)), 0);
    }

    #[test]
    fn test_multi_component_copies_min_components() {
        let mut src = Brick::new(UVec3::splat(2), 2).unwrap();
        src.fill(None, &[10, 20]);
        let mut dst = brick(2);
        let whole = Rect3::new(IVec3::ZERO, IVec3::splat(2));
        dst.copy_from(&whole, &src.as_grid(), &whole);
        // only the first component fits
        assert_eq!(dst.as_grid().sample(IVec3::ZERO), 10);
    }

    #[test]
    fn test_memoization_cleared_by_mutation() {
        let mut b = brick(2);
        assert!(b.is_empty(None));
        b.offset(IVec3::ZERO)[0] = 255;
        assert!(!b.is_empty(None));
        b.fill(None, &[255]);
        assert!(b.is_full(None));
        assert_eq!(b.is_uniform(None), Some(255));
    }

    #[test]
    fn test_is_uniform() {
        let mut b = brick(2);
        assert_eq!(b.is_uniform(None), Some(0));
        b.offset(IVec3::new(1, 1, 1))[0] = 3;
        assert_eq!(b.is_uniform(None), None);
        assert_eq!(
            b.is_uniform(Some(&Rect3::new(IVec3::ZERO, IVec3::new(2, 2, 1)))),
            Some(0)
        );
    }
}
