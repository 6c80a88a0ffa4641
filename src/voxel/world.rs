//! Voxel world: a sparse collection of octree regions.
//!
//! World coordinates are partitioned into fixed-size regions, one octree per
//! region, created lazily when a write first touches their footprint. The
//! world routes region operations to every overlapping tree, records edits
//! in the updated-region ring for downstream consumers, and regenerates the
//! LOD pyramid from the finest level upward.
//!
//! On-disk layout under the world prefix:
//!
//! ```text
//! world.bin                      manifest
//! region_<rx>_<ry>_<rz>/
//!     octree.bin                 tree index (preorder)
//!     lod0/<x>_<y>_<z>           finest bricks
//!     lod1/<x>_<y>_<z>
//!     ...
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use glam::{IVec3, UVec3};

use crate::codec;
use crate::error::{Error, Result};
use crate::math::Rect3;
use crate::vfs::{FileCache, FileSystem, OpenOptions};
use crate::voxel::brick::{GridMut, GridRef};
use crate::voxel::lod;
use crate::voxel::octree::{
    INDEX_FILE, NodeInfo, OctreeConfig, RegionStatus, Usage, VOXEL_COMPONENTS, VoxelOctree,
    merge_status,
};
use crate::voxel::ring::UpdateRing;

/// Manifest file name inside the world prefix
pub const WORLD_FILE: &str = "world.bin";

/// Default bound on decompressed bricks per octree
pub const DEFAULT_MAX_CACHED_NODES: usize = 16;

/// Region coordinate: world coordinates floor-divided by the region extent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl TreeCoord {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

/// Directory-creation callback supplied by the host.
/// Must create missing parents, like `create_dir_all`.
pub type MkdirFn = Box<dyn Fn(&Path) -> io::Result<()>>;

/// A `MkdirFn` backed by the host file system
pub fn std_mkdir() -> MkdirFn {
    Box::new(|path: &Path| std::fs::create_dir_all(path))
}

/// Construction parameters for a world
#[derive(Clone, Debug)]
pub struct WorldConfig {
    /// Brick dimensions; a region covers `dims << (n_lod - 1)` level-0 voxels
    pub dims: UVec3,
    /// Number of LOD levels, finest is level 0
    pub n_lod: u32,
    pub usage: Usage,
    /// Root directory of the on-disk layout
    pub prefix: PathBuf,
    /// Materialize missing trees on writes
    pub create_trees: bool,
    /// Brick LRU bound handed to each octree
    pub max_cached_nodes: usize,
}

impl WorldConfig {
    pub fn new(dims: UVec3, n_lod: u32, usage: Usage, prefix: impl Into<PathBuf>) -> Self {
        Self {
            dims,
            n_lod,
            usage,
            prefix: prefix.into(),
            create_trees: true,
            max_cached_nodes: DEFAULT_MAX_CACHED_NODES,
        }
    }
}

/// Sparse, paged voxel world with an LOD pyramid
pub struct VoxelWorld {
    trees: HashMap<TreeCoord, VoxelOctree>,
    dims: UVec3,
    n_lod: u32,
    usage: Usage,
    create_trees: bool,
    prefix: PathBuf,
    vfs: Rc<dyn FileSystem>,
    files: Rc<RefCell<FileCache>>,
    max_cached_nodes: usize,
    mkdir: Option<MkdirFn>,
    updates: UpdateRing,
    /// Scratch for LOD generation: source voxels (one brick's worth)
    buffer1: Vec<u8>,
    /// Scratch for LOD generation: destination voxels
    buffer2: Vec<u8>,
}

impl VoxelWorld {
    pub fn new(
        config: WorldConfig,
        vfs: Rc<dyn FileSystem>,
        files: Rc<RefCell<FileCache>>,
    ) -> Result<Self> {
        if config.n_lod == 0 {
            return Err(Error::InvalidArgument("world needs at least one level".into()));
        }
        if config.dims.min_element() == 0 {
            return Err(Error::InvalidArgument("brick dimensions must be non-zero".into()));
        }
        let size1 = (config.dims.x * config.dims.y * config.dims.z) as usize;
        let size2 = (size1 / 8).max(1);
        let mut buffer1 = Vec::new();
        buffer1.try_reserve_exact(size1)?;
        buffer1.resize(size1, 0);
        let mut buffer2 = Vec::new();
        buffer2.try_reserve_exact(size2)?;
        buffer2.resize(size2, 0);

        Ok(Self {
            trees: HashMap::new(),
            dims: config.dims,
            n_lod: config.n_lod,
            usage: config.usage,
            create_trees: config.create_trees,
            prefix: config.prefix,
            vfs,
            files,
            max_cached_nodes: config.max_cached_nodes,
            mkdir: None,
            updates: UpdateRing::new(),
            buffer1,
            buffer2,
        })
    }

    pub fn dims(&self) -> UVec3 {
        self.dims
    }

    pub fn n_lod(&self) -> u32 {
        self.n_lod
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Extent of one region in level-0 units
    pub fn total_dims(&self) -> UVec3 {
        UVec3::new(
            self.dims.x << (self.n_lod - 1),
            self.dims.y << (self.n_lod - 1),
            self.dims.z << (self.n_lod - 1),
        )
    }

    pub fn set_create_trees(&mut self, create: bool) {
        self.create_trees = create;
    }

    /// Install the host's directory-creation callback
    pub fn set_mkdir(&mut self, f: MkdirFn) {
        self.mkdir = Some(f);
    }

    // ---- tree management ---------------------------------------------------

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn tree(&self, coord: TreeCoord) -> Option<&VoxelOctree> {
        self.trees.get(&coord)
    }

    pub fn tree_mut(&mut self, coord: TreeCoord) -> Option<&mut VoxelOctree> {
        self.trees.get_mut(&coord)
    }

    pub fn tree_coords(&self) -> Vec<TreeCoord> {
        let mut coords: Vec<_> = self.trees.keys().copied().collect();
        coords.sort();
        coords
    }

    fn tree_prefix(&self, coord: TreeCoord) -> PathBuf {
        self.prefix
            .join(format!("region_{}_{}_{}", coord.x, coord.y, coord.z))
    }

    /// Create an empty tree for `coord`, making its level directories
    pub fn add_tree(&mut self, coord: TreeCoord) -> Result<&mut VoxelOctree> {
        let prefix = self.tree_prefix(coord);
        match self.trees.entry(coord) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                if let Some(mkdir) = self.mkdir.as_ref() {
                    for level in 0..self.n_lod {
                        mkdir(&prefix.join(format!("lod{level}")))?;
                    }
                }
                let origin = IVec3::new(
                    coord.x * self.dims.x as i32,
                    coord.y * self.dims.y as i32,
                    coord.z * self.dims.z as i32,
                );
                let tree = VoxelOctree::new(
                    OctreeConfig {
                        usage: self.usage,
                        max_depth: self.n_lod - 1,
                        origin,
                        dims: self.dims,
                        prefix,
                        max_cached: self.max_cached_nodes,
                    },
                    Rc::clone(&self.files),
                );
                log::debug!("created tree {coord:?}");
                Ok(entry.insert(tree))
            }
        }
    }

    /// Inclusive region-coordinate box covered by `rect` at `level`
    fn key_range(&self, level: u32, rect: &Rect3) -> Result<(IVec3, IVec3)> {
        if level >= self.n_lod {
            return Err(Error::InvalidArgument(format!(
                "level {level} exceeds lod count {}",
                self.n_lod
            )));
        }
        if rect.is_empty() {
            return Err(Error::InvalidArgument("empty region".into()));
        }
        let r0 = rect.scale_pow2(level as i32);
        let total = self.total_dims().as_ivec3();
        let lo = IVec3::new(
            r0.p1.x.div_euclid(total.x),
            r0.p1.y.div_euclid(total.y),
            r0.p1.z.div_euclid(total.z),
        );
        let hi = IVec3::new(
            (r0.p2.x - 1).div_euclid(total.x),
            (r0.p2.y - 1).div_euclid(total.y),
            (r0.p2.z - 1).div_euclid(total.z),
        );
        Ok((lo, hi))
    }

    /// Coordinates of every tree overlapping `rect`, creating missing trees
    /// when asked to
    pub fn fetch_trees(&mut self, level: u32, rect: &Rect3, create: bool) -> Result<Vec<TreeCoord>> {
        let (lo, hi) = self.key_range(level, rect)?;
        let mut out = Vec::new();
        for x in lo.x..=hi.x {
            for y in lo.y..=hi.y {
                for z in lo.z..=hi.z {
                    let coord = TreeCoord::new(x, y, z);
                    if self.trees.contains_key(&coord) {
                        out.push(coord);
                    } else if create {
                        self.add_tree(coord)?;
                        out.push(coord);
                    }
                }
            }
        }
        Ok(out)
    }

    // ---- region operations -------------------------------------------------

    /// Read `rect` (in `level` space) into `out`; voxels outside every tree
    /// come back empty
    pub fn get_region(&mut self, level: u32, rect: &Rect3, out: &mut [u8]) -> Result<()> {
        let expected = rect.volume() as usize * VOXEL_COMPONENTS as usize;
        if out.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "buffer is {} bytes, region wants {expected}",
                out.len()
            )));
        }
        out.fill(0);
        for coord in self.fetch_trees(level, rect, false)? {
            if let Some(tree) = self.trees.get_mut(&coord) {
                tree.get_region(level, rect, out)?;
            }
        }
        Ok(())
    }

    /// Write `data` into `rect` (in `level` space) and record the edit
    pub fn set_region(&mut self, level: u32, rect: &Rect3, data: &[u8]) -> Result<()> {
        let create = self.create_trees;
        for coord in self.fetch_trees(level, rect, create)? {
            if let Some(tree) = self.trees.get_mut(&coord) {
                tree.set_region(level, rect, data)?;
            }
        }
        self.updates.push(level, *rect);
        Ok(())
    }

    /// Fill `rect` with one byte and record the edit
    pub fn fill_region(&mut self, level: u32, rect: &Rect3, pattern: u8) -> Result<()> {
        let create = self.create_trees;
        for coord in self.fetch_trees(level, rect, create)? {
            if let Some(tree) = self.trees.get_mut(&coord) {
                tree.fill_region(level, rect, pattern)?;
            }
        }
        self.updates.push(level, *rect);
        Ok(())
    }

    /// Aggregate state of `rect` at `level`; regions with no tree are empty
    pub fn region_status(&self, level: u32, rect: &Rect3) -> Result<RegionStatus> {
        let (lo, hi) = self.key_range(level, rect)?;
        let mut acc = None;
        'scan: for x in lo.x..=hi.x {
            for y in lo.y..=hi.y {
                for z in lo.z..=hi.z {
                    let s = match self.trees.get(&TreeCoord::new(x, y, z)) {
                        Some(tree) => tree.region_status(level, rect)?,
                        None => RegionStatus::Empty,
                    };
                    if !merge_status(&mut acc, s) {
                        break 'scan;
                    }
                }
            }
        }
        Ok(acc.unwrap_or(RegionStatus::Empty))
    }

    /// Snapshot every node at `level` intersecting `rect` across all trees
    pub fn fetch_nodes(&self, level: u32, rect: &Rect3, out: &mut Vec<NodeInfo>) -> Result<()> {
        let (lo, hi) = self.key_range(level, rect)?;
        for x in lo.x..=hi.x {
            for y in lo.y..=hi.y {
                for z in lo.z..=hi.z {
                    if let Some(tree) = self.trees.get(&TreeCoord::new(x, y, z)) {
                        tree.fetch_nodes(level, rect, out)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Snapshot the node covering point `p` at `level`
    pub fn fetch_node(&self, level: u32, p: IVec3) -> Result<Option<NodeInfo>> {
        let mut list = Vec::new();
        self.fetch_nodes(level, &Rect3::from_origin_size(p, IVec3::ONE), &mut list)?;
        Ok(list.into_iter().next())
    }

    /// Snapshot every node of `level` across all trees
    pub fn fetch_all_nodes(&self, level: u32, out: &mut Vec<NodeInfo>) -> Result<()> {
        for coord in self.tree_coords() {
            if let Some(tree) = self.trees.get(&coord) {
                tree.fetch_all_nodes(level, out)?;
            }
        }
        Ok(())
    }

    // ---- updated-region ring -----------------------------------------------

    /// Record an externally produced edit for downstream consumers
    pub fn add_updated_region(&mut self, level: u32, rect: Rect3) {
        self.updates.push(level, rect);
    }

    /// Drain one `(level, rect)` edit, oldest first
    pub fn next_updated_region(&mut self) -> Option<(u32, Rect3)> {
        self.updates.pop()
    }

    // ---- LOD pyramid -------------------------------------------------------

    /// Derive level+1 voxels from level voxels under `zone` (given in
    /// `level` space). Returns the updated rect in level+1 space.
    pub fn generate_lod(&mut self, level: u32, zone: &Rect3) -> Result<Rect3> {
        if level + 1 >= self.n_lod {
            return Err(Error::InvalidArgument(format!(
                "level {level} has no coarser level (n_lod {})",
                self.n_lod
            )));
        }
        // destination at level+1, source widened by the kernel border
        let dst = Rect3::new(
            floor_div2(zone.p1),
            floor_div2(zone.p2 + IVec3::ONE),
        );
        let src = Rect3::new(dst.p1 * 2 - IVec3::ONE, dst.p2 * 2 + IVec3::ONE);

        match self.region_status(level, &src)? {
            RegionStatus::Empty => return Ok(dst),
            RegionStatus::Full(m) => {
                let pattern = match self.usage {
                    Usage::Density => 255,
                    Usage::Material => m,
                };
                self.fill_region(level + 1, &dst, pattern)?;
                return Ok(dst);
            }
            RegionStatus::Mixed => {}
        }

        let src_size = src.volume() as usize;
        let dst_size = dst.volume() as usize;
        if src_size > self.buffer1.len() || dst_size > self.buffer2.len() {
            if zone.longest_axis_len() > 1 {
                let (a, b) = zone.split_longest();
                let ua = self.generate_lod(level, &a)?;
                let ub = self.generate_lod(level, &b)?;
                return Ok(ua.union(&ub));
            }
            // a single-voxel zone cannot be split further: grow the scratch
            // buffers instead
            grow_scratch(&mut self.buffer1, src_size)?;
            grow_scratch(&mut self.buffer2, dst_size)?;
        }

        let mut buffer1 = std::mem::take(&mut self.buffer1);
        let mut buffer2 = std::mem::take(&mut self.buffer2);
        let result = self.compute_lod(level, &src, &dst, &mut buffer1, &mut buffer2);
        self.buffer1 = buffer1;
        self.buffer2 = buffer2;
        result?;
        Ok(dst)
    }

    fn compute_lod(
        &mut self,
        level: u32,
        src: &Rect3,
        dst: &Rect3,
        buffer1: &mut [u8],
        buffer2: &mut [u8],
    ) -> Result<()> {
        let src_size = src.volume() as usize;
        let dst_size = dst.volume() as usize;
        buffer2[..dst_size].fill(0);

        self.get_region(level, src, &mut buffer1[..src_size])?;
        {
            let input = GridRef::new(src.size().as_uvec3(), VOXEL_COMPONENTS, &buffer1[..src_size]);
            let mut output =
                GridMut::new(dst.size().as_uvec3(), VOXEL_COMPONENTS, &mut buffer2[..dst_size]);
            match self.usage {
                Usage::Density => lod::downsample_density(&input, &mut output),
                Usage::Material => lod::downsample_material(&input, &mut output),
            }
        }
        self.set_region(level + 1, dst, &buffer2[..dst_size])
    }

    /// Rebuild the pyramid from `level` upward over the edited footprint
    pub fn generate_all_lod(&mut self, level: u32, zone: &Rect3) -> Result<Rect3> {
        let mut area = *zone;
        for l in level..self.n_lod.saturating_sub(1) {
            area = self.generate_lod(l, &area)?;
        }
        Ok(area)
    }

    // ---- caches ------------------------------------------------------------

    /// Enforce every tree's brick LRU bound, then the file-handle bound
    pub fn update_cache(&mut self) -> Result<()> {
        for tree in self.trees.values_mut() {
            tree.update_cache()?;
        }
        Ok(())
    }

    /// Write back every dirty brick and flush all file handles
    pub fn sync_cache(&mut self) -> Result<()> {
        for tree in self.trees.values_mut() {
            tree.sync_cache()?;
        }
        Ok(())
    }

    // ---- persistence -------------------------------------------------------

    /// Write the world manifest (`world.bin`)
    pub fn save(&self) -> Result<()> {
        let mut f = self
            .vfs
            .open(&self.prefix.join(WORLD_FILE), OpenOptions::write_create())?;
        f.set_len(0)?;
        codec::write_u32(&mut f, self.dims.x)?;
        codec::write_u32(&mut f, self.dims.y)?;
        codec::write_u32(&mut f, self.dims.z)?;
        codec::write_u32(&mut f, self.n_lod)?;
        codec::write_u32(&mut f, self.usage as u32)?;
        codec::write_u32(&mut f, self.trees.len() as u32)?;
        for coord in self.tree_coords() {
            codec::write_i32(&mut f, coord.x)?;
            codec::write_i32(&mut f, coord.y)?;
            codec::write_i32(&mut f, coord.z)?;
        }
        log::info!(
            "saved world manifest: {} trees under {}",
            self.trees.len(),
            self.prefix.display()
        );
        Ok(())
    }

    /// Read a manifest and construct the world with empty trees registered
    /// for every listed region. Tree indexes load separately via
    /// [`load_all_trees`](Self::load_all_trees).
    pub fn load(
        prefix: impl Into<PathBuf>,
        vfs: Rc<dyn FileSystem>,
        files: Rc<RefCell<FileCache>>,
    ) -> Result<Self> {
        let prefix = prefix.into();
        let mut f = vfs.open(&prefix.join(WORLD_FILE), OpenOptions::read())?;
        let dims = UVec3::new(
            codec::read_u32(&mut f)?,
            codec::read_u32(&mut f)?,
            codec::read_u32(&mut f)?,
        );
        let n_lod = codec::read_u32(&mut f)?;
        if n_lod == 0 || n_lod > 24 {
            return Err(Error::CorruptedArchive(format!("implausible lod count {n_lod}")));
        }
        let usage = Usage::from_u32(codec::read_u32(&mut f)?)?;
        let n_trees = codec::read_u32(&mut f)?;

        let mut world = VoxelWorld::new(
            WorldConfig::new(dims, n_lod, usage, prefix),
            vfs,
            files,
        )?;
        for _ in 0..n_trees {
            let x = codec::read_i32(&mut f)?;
            let y = codec::read_i32(&mut f)?;
            let z = codec::read_i32(&mut f)?;
            world.add_tree(TreeCoord::new(x, y, z))?;
        }
        log::info!(
            "loaded world manifest: {} trees under {}",
            world.trees.len(),
            world.prefix.display()
        );
        Ok(world)
    }

    /// Write one tree's index to `region_*/octree.bin`
    pub fn save_tree(&self, coord: TreeCoord) -> Result<()> {
        let Some(tree) = self.trees.get(&coord) else {
            return Err(Error::InvalidArgument(format!("no tree at {coord:?}")));
        };
        let path = self.tree_prefix(coord).join(INDEX_FILE);
        let mut f = self.vfs.open(&path, OpenOptions::write_create())?;
        f.set_len(0)?;
        tree.save_index(&mut f)
    }

    /// Replace one registered tree with the index stored on disk
    pub fn load_tree(&mut self, coord: TreeCoord) -> Result<()> {
        if !self.trees.contains_key(&coord) {
            return Err(Error::InvalidArgument(format!("no tree at {coord:?}")));
        }
        let prefix = self.tree_prefix(coord);
        let mut f = self.vfs.open(&prefix.join(INDEX_FILE), OpenOptions::read())?;
        let tree = VoxelOctree::load_index(
            &mut f,
            prefix,
            self.max_cached_nodes,
            Rc::clone(&self.files),
        )?;
        self.trees.insert(coord, tree);
        Ok(())
    }

    pub fn save_all_trees(&self) -> Result<()> {
        for coord in self.tree_coords() {
            self.save_tree(coord)?;
        }
        Ok(())
    }

    pub fn load_all_trees(&mut self) -> Result<()> {
        for coord in self.tree_coords() {
            self.load_tree(coord)?;
        }
        Ok(())
    }
}

fn floor_div2(v: IVec3) -> IVec3 {
    IVec3::new(v.x.div_euclid(2), v.y.div_euclid(2), v.z.div_euclid(2))
}

fn grow_scratch(buf: &mut Vec<u8>, need: usize) -> Result<()> {
    if buf.len() >= need {
        return Ok(());
    }
    let mut size = buf.len().max(1);
    while size < need {
        size *= 2;
    }
    buf.try_reserve_exact(size - buf.len())?;
    buf.resize(size, 0);
    log::debug!("grew LOD scratch buffer to {size} bytes");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::StdFileSystem;
    use crate::voxel::octree::NodeStatus;
    use tempfile::TempDir;

    fn make_world(dir: &TempDir, dims: u32, n_lod: u32, usage: Usage) -> VoxelWorld {
        let vfs: Rc<dyn FileSystem> = Rc::new(StdFileSystem);
        let files = Rc::new(RefCell::new(FileCache::new(Rc::clone(&vfs), 32)));
        let config = WorldConfig::new(UVec3::splat(dims), n_lod, usage, dir.path());
        let mut world = VoxelWorld::new(config, vfs, files).unwrap();
        world.set_mkdir(std_mkdir());
        world
    }

    fn cube(p1: i32, p2: i32) -> Rect3 {
        Rect3::new(IVec3::splat(p1), IVec3::splat(p2))
    }

    #[test]
    fn test_empty_world_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = make_world(&dir, 8, 2, Usage::Density);
        let mut buf = vec![7u8; 512];
        world.get_region(0, &cube(0, 8), &mut buf).unwrap();
        assert!(buf.iter().all(|&v| v == 0));
        // reads never create trees
        assert_eq!(world.tree_count(), 0);
    }

    #[test]
    fn test_single_voxel_write_then_erase() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = make_world(&dir, 8, 2, Usage::Density);
        let voxel = cube(3, 4);
        world.set_region(0, &voxel, &[255]).unwrap();
        assert_eq!(world.tree_count(), 1);

        let mut buf = vec![0u8; 512];
        world.get_region(0, &cube(0, 8), &mut buf).unwrap();
        for (i, v) in buf.iter().enumerate() {
            let expect = if i == 3 + 3 * 8 + 3 * 64 { 255 } else { 0 };
            assert_eq!(*v, expect, "voxel {i}");
        }

        world.set_region(0, &voxel, &[0]).unwrap();
        let tree = world.tree(TreeCoord::new(0, 0, 0)).unwrap();
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn test_material_full_fill() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = make_world(&dir, 4, 1, Usage::Material);
        world.fill_region(0, &cube(0, 4), 7).unwrap();

        let info = world.fetch_node(0, IVec3::ZERO).unwrap().unwrap();
        assert_eq!(info.status, NodeStatus::Full);
        assert_eq!(info.material, 7);

        let mut buf = vec![0u8; 64];
        world.get_region(0, &cube(0, 4), &mut buf).unwrap();
        assert!(buf.iter().all(|&v| v == 7));
    }

    #[test]
    fn test_negative_coordinates_use_floor() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = make_world(&dir, 4, 2, Usage::Density);
        // region extent is 8 level-0 voxels; a write at -1 lands in tree -1
        let voxel = Rect3::new(IVec3::new(-1, 0, 0), IVec3::new(0, 1, 1));
        world.set_region(0, &voxel, &[200]).unwrap();
        assert!(world.tree(TreeCoord::new(-1, 0, 0)).is_some());
        assert!(world.tree(TreeCoord::new(0, 0, 0)).is_none());

        let mut buf = vec![0u8; 1];
        world.get_region(0, &voxel, &mut buf).unwrap();
        assert_eq!(buf[0], 200);
    }

    #[test]
    fn test_write_spanning_trees() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = make_world(&dir, 4, 1, Usage::Density);
        // spans trees (0,0,0) and (1,0,0)
        let span = Rect3::new(IVec3::new(2, 0, 0), IVec3::new(6, 1, 1));
        world.set_region(0, &span, &[255, 255, 255, 255]).unwrap();
        assert_eq!(world.tree_count(), 2);

        let mut buf = vec![0u8; 8];
        let wide = Rect3::new(IVec3::new(0, 0, 0), IVec3::new(8, 1, 1));
        world.get_region(0, &wide, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 255, 255, 255, 255, 0, 0]);
    }

    #[test]
    fn test_updated_region_ring_records_edits() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = make_world(&dir, 4, 2, Usage::Density);
        world.set_region(0, &cube(0, 2), &[255u8; 8]).unwrap();
        world.fill_region(0, &cube(2, 4), 0).unwrap();

        assert_eq!(world.next_updated_region(), Some((0, cube(0, 2))));
        assert_eq!(world.next_updated_region(), Some((0, cube(2, 4))));
        assert_eq!(world.next_updated_region(), None);
    }

    #[test]
    fn test_generate_lod_kernel_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = make_world(&dir, 2, 2, Usage::Density);
        let data = [0u8, 64, 128, 192, 255, 0, 128, 255];
        world.set_region(0, &cube(0, 2), &data).unwrap();
        while world.next_updated_region().is_some() {}

        let updated = world.generate_lod(0, &cube(0, 1)).unwrap();
        assert_eq!(updated, cube(0, 1));

        let mut buf = [0u8; 1];
        world.get_region(1, &cube(0, 1), &mut buf).unwrap();
        // weighted neighborhood sum: faces (64+128+255)/2, edges
        // (192+0+128)/4, corner 255/8, total 335.375 -> 41 after scaling
        assert_eq!(buf[0], 41);

        // the derived write is observable on the ring
        assert_eq!(world.next_updated_region(), Some((1, cube(0, 1))));
    }

    #[test]
    fn test_generate_lod_full_interior_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = make_world(&dir, 4, 2, Usage::Density);
        world.fill_region(0, &cube(0, 8), 255).unwrap();
        // a zone whose widened source stays inside the solid tree
        let updated = world.generate_lod(0, &cube(2, 6)).unwrap();
        assert_eq!(updated, cube(1, 3));

        let mut buf = vec![0u8; 8];
        world.get_region(1, &cube(1, 3), &mut buf).unwrap();
        assert!(buf.iter().all(|&v| v == 255));
    }

    #[test]
    fn test_generate_lod_attenuates_against_empty_border() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = make_world(&dir, 4, 2, Usage::Density);
        world.fill_region(0, &cube(0, 8), 255).unwrap();
        let updated = world.generate_lod(0, &cube(0, 8)).unwrap();
        assert_eq!(updated, cube(0, 4));

        let mut buf = vec![0u8; 64];
        world.get_region(1, &cube(0, 4), &mut buf).unwrap();
        // voxels whose whole neighborhood is solid stay solid
        for z in 1..3usize {
            for y in 1..3usize {
                for x in 1..3usize {
                    assert_eq!(buf[x + 4 * y + 16 * z], 255);
                }
            }
        }
        // corner voxels average against the empty outside
        assert!(buf[0] < 255);
    }

    #[test]
    fn test_generate_lod_empty_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = make_world(&dir, 4, 2, Usage::Density);
        let updated = world.generate_lod(0, &cube(0, 8)).unwrap();
        assert_eq!(updated, cube(0, 4));
        assert_eq!(world.tree_count(), 0);
        assert!(world.next_updated_region().is_none());
    }

    #[test]
    fn test_generate_all_lod_material() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = make_world(&dir, 4, 3, Usage::Material);
        // region extent at level 0 is 16; paint one octant solid
        world.fill_region(0, &cube(0, 8), 5).unwrap();
        world.generate_all_lod(0, &cube(0, 8)).unwrap();

        let mut buf = vec![0u8; 64];
        world.get_region(1, &cube(0, 4), &mut buf).unwrap();
        assert!(buf.iter().all(|&v| v == 5));

        let mut buf = vec![0u8; 8];
        world.get_region(2, &cube(0, 2), &mut buf).unwrap();
        assert!(buf.iter().all(|&v| v == 5));
    }

    #[test]
    fn test_generate_lod_split_large_zone() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = make_world(&dir, 4, 2, Usage::Density);
        // an elongated edit larger than one brick's worth of scratch
        let zone = Rect3::new(IVec3::new(0, 0, 0), IVec3::new(16, 4, 4));
        let data = vec![255u8; zone.volume() as usize];
        world.set_region(0, &zone, &data).unwrap();
        let updated = world.generate_lod(0, &zone).unwrap();
        assert_eq!(updated, Rect3::new(IVec3::ZERO, IVec3::new(8, 2, 2)));

        let mut buf = vec![0u8; updated.volume() as usize];
        world.get_region(1, &updated, &mut buf).unwrap();
        // the beam axis keeps solid samples, the outside corner attenuates
        assert_eq!(buf[3 + 8 * 1 + 16 * 1], 255);
        assert_eq!(buf[0], 107);
    }

    #[test]
    fn test_world_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = make_world(&dir, 4, 2, Usage::Density);
        let pattern: Vec<u8> = (0..64).map(|i| if i % 2 == 0 { 0 } else { 255 }).collect();
        world.set_region(0, &cube(0, 4), &pattern).unwrap();
        world
            .set_region(0, &Rect3::new(IVec3::new(-3, 0, 0), IVec3::new(-2, 1, 1)), &[255])
            .unwrap();
        world.generate_all_lod(0, &cube(0, 4)).unwrap();
        world.sync_cache().unwrap();
        world.save().unwrap();
        world.save_all_trees().unwrap();

        let vfs: Rc<dyn FileSystem> = Rc::new(StdFileSystem);
        let files = Rc::new(RefCell::new(FileCache::new(Rc::clone(&vfs), 32)));
        let mut loaded = VoxelWorld::load(dir.path(), vfs, files).unwrap();
        loaded.load_all_trees().unwrap();
        assert_eq!(loaded.tree_count(), 2);
        assert_eq!(loaded.dims(), UVec3::splat(4));
        assert_eq!(loaded.n_lod(), 2);

        let mut buf = vec![0u8; 64];
        loaded.get_region(0, &cube(0, 4), &mut buf).unwrap();
        assert_eq!(buf, pattern);

        let mut one = [0u8; 1];
        loaded
            .get_region(0, &Rect3::new(IVec3::new(-3, 0, 0), IVec3::new(-2, 1, 1)), &mut one)
            .unwrap();
        assert_eq!(one[0], 255);
    }

    #[test]
    fn test_manifest_is_little_endian() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = make_world(&dir, 4, 2, Usage::Material);
        world.set_region(0, &cube(0, 1), &[9]).unwrap();
        world.save().unwrap();

        let bytes = std::fs::read(dir.path().join(WORLD_FILE)).unwrap();
        // w, h, d, n_lod, usage, n_trees, then one (0, 0, 0) key
        assert_eq!(bytes.len(), 6 * 4 + 3 * 4);
        assert_eq!(&bytes[0..4], &[4, 0, 0, 0]);
        assert_eq!(&bytes[12..16], &[2, 0, 0, 0]);
        assert_eq!(&bytes[16..20], &[1, 0, 0, 0]);
        assert_eq!(&bytes[20..24], &[1, 0, 0, 0]);
    }
}
