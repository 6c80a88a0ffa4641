//! Sparse voxel octree for one world region.
//!
//! Nodes live in an arena indexed by `u32` ids (root at 0, free list for
//! collapsed subtrees). Each node is `Empty`, `Full` (uniform material),
//! `Leaf` (owns a brick) or `Interior` (exactly eight children); an interior
//! node may additionally carry an aggregate brick at its own level once LOD
//! generation has written coarse data there.
//!
//! Bricks are decompressed on demand into a bounded LRU and written back
//! zlib-compressed when evicted or synced. The node topology itself persists
//! separately as a preorder index.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use glam::{IVec3, UVec3};

use crate::codec;
use crate::error::{Error, Result};
use crate::math::Rect3;
use crate::vfs::FileCache;
use crate::voxel::brick::{Brick, GridMut, GridRef, Histogram};
use crate::voxel::brick_file::BrickFile;

/// Components per voxel stored by octrees
pub const VOXEL_COMPONENTS: u32 = 1;

/// Index file name inside a tree's directory
pub const INDEX_FILE: &str = "octree.bin";

type NodeId = u32;
const NIL: NodeId = u32::MAX;

/// Interpretation of the stored byte
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Usage {
    /// Unsigned density, thresholded at 128; occupancy is a single counter
    Density = 0,
    /// Material id, 0 reserved for empty; occupancy is a 256-bin histogram
    Material = 1,
}

impl Usage {
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(Usage::Density),
            1 => Ok(Usage::Material),
            other => Err(Error::CorruptedArchive(format!("unknown usage tag {other}"))),
        }
    }
}

/// Node state tag, also the on-disk status value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    Empty = 0,
    Full = 1,
    Leaf = 2,
    Interior = 3,
}

impl NodeStatus {
    fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(NodeStatus::Empty),
            1 => Ok(NodeStatus::Full),
            2 => Ok(NodeStatus::Leaf),
            3 => Ok(NodeStatus::Interior),
            other => Err(Error::CorruptedArchive(format!(
                "unknown node status tag {other}"
            ))),
        }
    }
}

/// Aggregated answer for "what does this region hold"
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionStatus {
    Empty,
    Full(u8),
    Mixed,
}

/// Read-only snapshot of one node, handed to mesh extractors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub status: NodeStatus,
    pub level: u32,
    /// Origin in `level`'s integer coordinate space
    pub origin: IVec3,
    /// Footprint in `level`'s integer coordinate space
    pub rect: Rect3,
    pub in_volume: u64,
    pub material: u8,
}

struct OctreeNode {
    status: NodeStatus,
    children: [NodeId; 8],
    level: u32,
    /// Origin in this node's level space
    origin: IVec3,
    material: u8,
    /// Voxels of this node's own brick that are inside the volume
    /// (density >= 128, or material != 0)
    in_volume: u64,
    /// Material census of the brick, kept while cached in material usage
    hist: Option<Box<Histogram>>,
    /// Decompressed brick, present while the node sits in the LRU
    brick: Option<Brick>,
    /// True when the brick equals the on-disk compressed data
    sync: bool,
}

impl OctreeNode {
    fn new(status: NodeStatus, level: u32, origin: IVec3) -> Self {
        Self {
            status,
            children: [NIL; 8],
            level,
            origin,
            material: 255,
            in_volume: 0,
            hist: None,
            brick: None,
            sync: false,
        }
    }
}

/// Construction parameters for one octree
#[derive(Clone, Debug)]
pub struct OctreeConfig {
    pub usage: Usage,
    /// Root level; level 0 is the finest resolution
    pub max_depth: u32,
    /// Tree origin in root-level units
    pub origin: IVec3,
    /// Brick dimensions (every node holds at most one such brick)
    pub dims: UVec3,
    /// Directory that receives `lod<L>/<x>_<y>_<z>` brick files
    pub prefix: PathBuf,
    /// Bound on decompressed bricks held in memory
    pub max_cached: usize,
}

/// Sparse voxel octree over one region of the world
pub struct VoxelOctree {
    nodes: Vec<OctreeNode>,
    free: Vec<NodeId>,
    usage: Usage,
    max_depth: u32,
    origin: IVec3,
    dims: UVec3,
    prefix: PathBuf,
    files: Rc<RefCell<FileCache>>,
    /// Brick LRU: oldest first, newest last
    cached: Vec<NodeId>,
    max_cached: usize,
}

impl std::fmt::Debug for VoxelOctree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoxelOctree")
            .field("usage", &self.usage)
            .field("max_depth", &self.max_depth)
            .field("origin", &self.origin)
            .field("dims", &self.dims)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl VoxelOctree {
    pub fn new(config: OctreeConfig, files: Rc<RefCell<FileCache>>) -> Self {
        Self {
            nodes: vec![OctreeNode::new(
                NodeStatus::Empty,
                config.max_depth,
                config.origin,
            )],
            free: Vec::new(),
            usage: config.usage,
            max_depth: config.max_depth,
            origin: config.origin,
            dims: config.dims,
            prefix: config.prefix,
            files,
            cached: Vec::new(),
            max_cached: config.max_cached,
        }
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Origin in root-level units
    pub fn origin(&self) -> IVec3 {
        self.origin
    }

    pub fn dims(&self) -> UVec3 {
        self.dims
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Voxels per brick
    pub fn brick_voxels(&self) -> u64 {
        self.dims.x as u64 * self.dims.y as u64 * self.dims.z as u64
    }

    /// Extent in level-0 units
    pub fn total_dims(&self) -> UVec3 {
        UVec3::new(
            self.dims.x << self.max_depth,
            self.dims.y << self.max_depth,
            self.dims.z << self.max_depth,
        )
    }

    /// Live node count
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Bricks currently decompressed in memory
    pub fn cached_count(&self) -> usize {
        self.cached.len()
    }

    /// Tree footprint expressed in `level` space
    pub fn level_rect(&self, level: u32) -> Result<Rect3> {
        let depth = self.depth_for(level)?;
        Ok(Rect3::from_origin_size(self.origin, self.dims.as_ivec3()).scale_pow2(depth as i32))
    }

    fn depth_for(&self, level: u32) -> Result<u32> {
        if level > self.max_depth {
            return Err(Error::InvalidArgument(format!(
                "level {level} exceeds max depth {}",
                self.max_depth
            )));
        }
        Ok(self.max_depth - level)
    }

    fn node_path(&self, level: u32, origin: IVec3) -> PathBuf {
        self.prefix
            .join(format!("lod{level}"))
            .join(format!("{}_{}_{}", origin.x, origin.y, origin.z))
    }

    // ---- region operations -------------------------------------------------

    /// Copy the voxels of `area` (in `level` space) into `data`.
    ///
    /// Only the part of `area` covered by this tree is written; the caller
    /// pre-fills the rest.
    pub fn get_region(&mut self, level: u32, area: &Rect3, data: &mut [u8]) -> Result<()> {
        let depth = self.depth_for(level)?;
        let expected = area.volume() as usize * VOXEL_COMPONENTS as usize;
        if data.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "buffer is {} bytes, region wants {expected}",
                data.len()
            )));
        }
        let node_rect = self.level_rect(level)?;
        let mut out = GridMut::new(area.size().as_uvec3(), VOXEL_COMPONENTS, data);
        self.get_rec(0, node_rect, depth, area, &mut out)
    }

    /// Write the voxels of `data` into `area` (in `level` space)
    pub fn set_region(&mut self, level: u32, area: &Rect3, data: &[u8]) -> Result<()> {
        let depth = self.depth_for(level)?;
        let expected = area.volume() as usize * VOXEL_COMPONENTS as usize;
        if data.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "buffer is {} bytes, region wants {expected}",
                data.len()
            )));
        }
        let node_rect = self.level_rect(level)?;
        let src = GridRef::new(area.size().as_uvec3(), VOXEL_COMPONENTS, data);
        self.set_rec(0, node_rect, depth, area, &src)
    }

    /// Fill `area` with a single byte.
    ///
    /// Density trees always fill with the ambient inside value (255); the
    /// pattern argument only selects the material in material usage.
    pub fn fill_region(&mut self, level: u32, area: &Rect3, pattern: u8) -> Result<()> {
        let depth = self.depth_for(level)?;
        let node_rect = self.level_rect(level)?;
        let pattern = match self.usage {
            Usage::Material => pattern,
            Usage::Density => 255,
        };
        self.fill_rec(0, node_rect, depth, area, pattern)
    }

    /// Append a snapshot of every node at `level` intersecting `area`
    pub fn fetch_nodes(&self, level: u32, area: &Rect3, out: &mut Vec<NodeInfo>) -> Result<()> {
        let depth = self.depth_for(level)?;
        let node_rect = self.level_rect(level)?;
        self.fetch_rec(0, node_rect, depth, area, out);
        Ok(())
    }

    /// Append every node of `level`
    pub fn fetch_all_nodes(&self, level: u32, out: &mut Vec<NodeInfo>) -> Result<()> {
        let area = self.level_rect(level)?;
        self.fetch_nodes(level, &area, out)
    }

    /// Snapshot of the node covering point `p` at `level`, if the tree
    /// overlaps it
    pub fn fetch_node(&self, level: u32, p: IVec3) -> Result<Option<NodeInfo>> {
        let mut list = Vec::new();
        self.fetch_nodes(level, &Rect3::from_origin_size(p, IVec3::ONE), &mut list)?;
        Ok(list.into_iter().next())
    }

    /// Aggregate state of `area` at `level`
    pub fn region_status(&self, level: u32, area: &Rect3) -> Result<RegionStatus> {
        let depth = self.depth_for(level)?;
        let node_rect = self.level_rect(level)?;
        let mut acc = None;
        self.status_rec(0, node_rect, depth, area, &mut acc);
        Ok(acc.unwrap_or(RegionStatus::Empty))
    }

    // ---- recursive workers -------------------------------------------------

    fn get_rec(
        &mut self,
        id: NodeId,
        node_rect: Rect3,
        depth: u32,
        area: &Rect3,
        out: &mut GridMut<'_>,
    ) -> Result<()> {
        let Some(inter) = node_rect.intersection(area) else {
            return Ok(());
        };
        match self.nodes[id as usize].status {
            NodeStatus::Empty => {
                out.fill(Some(&inter.sub_origin(area)), &[0]);
            }
            NodeStatus::Full => {
                let material = self.nodes[id as usize].material;
                out.fill(Some(&inter.sub_origin(area)), &[material]);
            }
            NodeStatus::Leaf => {
                if depth == 0 {
                    self.copy_from_node(id, &node_rect, area, out)?;
                } else {
                    // no finer detail than the occupancy count: approximate
                    let node = &self.nodes[id as usize];
                    let pattern = if node.in_volume > self.brick_voxels() / 2 {
                        node.material
                    } else {
                        0
                    };
                    out.fill(Some(&inter.sub_origin(area)), &[pattern]);
                }
            }
            NodeStatus::Interior => {
                if depth == 0 {
                    self.copy_from_node(id, &node_rect, area, out)?;
                } else {
                    let children = self.nodes[id as usize].children;
                    for (i, child) in children.into_iter().enumerate() {
                        let r = node_rect.child_octant(i as u8);
                        self.get_rec(child, r, depth - 1, area, out)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn set_rec(
        &mut self,
        id: NodeId,
        node_rect: Rect3,
        depth: u32,
        area: &Rect3,
        src: &GridRef<'_>,
    ) -> Result<()> {
        let Some(inter) = node_rect.intersection(area) else {
            return Ok(());
        };
        match self.nodes[id as usize].status {
            NodeStatus::Empty => {
                // skipping all-empty payloads saves file churn on disk
                let region = inter.sub_origin(area);
                if self.payload_empty(src, &region) {
                    return Ok(());
                }
                // a uniform material payload covering the whole node needs
                // no brick at all
                if depth == 0 && inter == node_rect && self.usage == Usage::Material {
                    if let Some(m) = src.is_uniform(Some(&region)) {
                        let volume = self.brick_voxels();
                        let node = &mut self.nodes[id as usize];
                        node.status = NodeStatus::Full;
                        node.material = m;
                        node.in_volume = volume;
                        return Ok(());
                    }
                }
                self.materialize(id, 0)?;
                if depth == 0 {
                    self.copy_to_node(id, &node_rect, area, src)?;
                    self.classify_after_write(id)?;
                } else {
                    self.subdivide(id, &node_rect, depth, NodeStatus::Empty, 0)?;
                    self.set_rec(id, node_rect, depth, area, src)?;
                }
            }
            NodeStatus::Full => {
                let region = inter.sub_origin(area);
                let material = self.nodes[id as usize].material;
                if self.payload_matches_full(src, &region, material) {
                    return Ok(());
                }
                self.materialize(id, material)?;
                if depth == 0 {
                    self.copy_to_node(id, &node_rect, area, src)?;
                    self.classify_after_write(id)?;
                } else {
                    let volume = self.brick_voxels();
                    self.subdivide(id, &node_rect, depth, NodeStatus::Full, volume)?;
                    self.set_rec(id, node_rect, depth, area, src)?;
                }
            }
            NodeStatus::Leaf => {
                if depth == 0 {
                    self.copy_to_node(id, &node_rect, area, src)?;
                    self.classify_after_write(id)?;
                } else {
                    // lossy coarsening: children start from the occupancy
                    // estimate, the brick stays as this node's aggregate
                    let volume = self.brick_voxels();
                    let (status, in_volume) = if self.nodes[id as usize].in_volume > volume / 2 {
                        (NodeStatus::Full, volume)
                    } else {
                        (NodeStatus::Empty, 0)
                    };
                    self.subdivide(id, &node_rect, depth, status, in_volume)?;
                    self.set_rec(id, node_rect, depth, area, src)?;
                }
            }
            NodeStatus::Interior => {
                if depth == 0 {
                    self.copy_to_node(id, &node_rect, area, src)?;
                } else {
                    let children = self.nodes[id as usize].children;
                    for (i, child) in children.into_iter().enumerate() {
                        let r = node_rect.child_octant(i as u8);
                        self.set_rec(child, r, depth - 1, area, src)?;
                    }
                    self.try_collapse(id)?;
                }
            }
        }
        Ok(())
    }

    fn fill_rec(
        &mut self,
        id: NodeId,
        node_rect: Rect3,
        depth: u32,
        area: &Rect3,
        pattern: u8,
    ) -> Result<()> {
        let Some(inter) = node_rect.intersection(area) else {
            return Ok(());
        };
        let inside = inter == node_rect;
        match self.nodes[id as usize].status {
            NodeStatus::Empty => {
                if pattern == 0 {
                    return Ok(());
                }
                if inside {
                    let volume = self.brick_voxels();
                    let node = &mut self.nodes[id as usize];
                    node.status = NodeStatus::Full;
                    node.material = pattern;
                    node.in_volume = volume;
                    return Ok(());
                }
                self.materialize(id, 0)?;
                if depth == 0 {
                    self.fill_to_node(id, &node_rect, area, pattern)?;
                    self.classify_after_write(id)?;
                } else {
                    self.subdivide(id, &node_rect, depth, NodeStatus::Empty, 0)?;
                    self.fill_rec(id, node_rect, depth, area, pattern)?;
                }
            }
            NodeStatus::Full => {
                let material = self.nodes[id as usize].material;
                if pattern == material {
                    return Ok(());
                }
                if inside {
                    self.nodes[id as usize].material = pattern;
                    return Ok(());
                }
                self.materialize(id, material)?;
                if depth == 0 {
                    self.fill_to_node(id, &node_rect, area, pattern)?;
                    self.classify_after_write(id)?;
                } else {
                    let volume = self.brick_voxels();
                    self.subdivide(id, &node_rect, depth, NodeStatus::Full, volume)?;
                    self.fill_rec(id, node_rect, depth, area, pattern)?;
                }
            }
            NodeStatus::Leaf => {
                if inside && depth == 0 {
                    self.erase_node(id)?;
                    let volume = self.brick_voxels();
                    let node = &mut self.nodes[id as usize];
                    node.status = NodeStatus::Full;
                    node.material = pattern;
                    node.in_volume = volume;
                    return Ok(());
                }
                if depth == 0 {
                    self.fill_to_node(id, &node_rect, area, pattern)?;
                    self.classify_after_write(id)?;
                } else {
                    let volume = self.brick_voxels();
                    let (status, in_volume) = if self.nodes[id as usize].in_volume > volume / 2 {
                        (NodeStatus::Full, volume)
                    } else {
                        (NodeStatus::Empty, 0)
                    };
                    self.subdivide(id, &node_rect, depth, status, in_volume)?;
                    self.fill_rec(id, node_rect, depth, area, pattern)?;
                }
            }
            NodeStatus::Interior => {
                if depth == 0 {
                    self.fill_to_node(id, &node_rect, area, pattern)?;
                } else {
                    let children = self.nodes[id as usize].children;
                    for (i, child) in children.into_iter().enumerate() {
                        let r = node_rect.child_octant(i as u8);
                        self.fill_rec(child, r, depth - 1, area, pattern)?;
                    }
                    self.try_collapse(id)?;
                }
            }
        }
        Ok(())
    }

    fn fetch_rec(
        &self,
        id: NodeId,
        node_rect: Rect3,
        depth: u32,
        area: &Rect3,
        out: &mut Vec<NodeInfo>,
    ) {
        if node_rect.intersection(area).is_none() {
            return;
        }
        if depth == 0 {
            out.push(self.node_info(id));
            return;
        }
        if self.nodes[id as usize].status == NodeStatus::Interior {
            let children = self.nodes[id as usize].children;
            for (i, child) in children.into_iter().enumerate() {
                let r = node_rect.child_octant(i as u8);
                self.fetch_rec(child, r, depth - 1, area, out);
            }
        }
    }

    /// Returns false once the accumulated status degraded to `Mixed`
    fn status_rec(
        &self,
        id: NodeId,
        node_rect: Rect3,
        depth: u32,
        area: &Rect3,
        acc: &mut Option<RegionStatus>,
    ) -> bool {
        if node_rect.intersection(area).is_none() {
            return true;
        }
        let node = &self.nodes[id as usize];
        let contribution = match node.status {
            NodeStatus::Empty => RegionStatus::Empty,
            NodeStatus::Full => RegionStatus::Full(node.material),
            NodeStatus::Leaf => {
                if depth == 0 {
                    RegionStatus::Mixed
                } else if node.in_volume > self.brick_voxels() / 2 {
                    // same approximation a read would deliver
                    RegionStatus::Full(node.material)
                } else {
                    RegionStatus::Empty
                }
            }
            NodeStatus::Interior => {
                if depth == 0 {
                    RegionStatus::Mixed
                } else {
                    let children = node.children;
                    for (i, child) in children.into_iter().enumerate() {
                        let r = node_rect.child_octant(i as u8);
                        if !self.status_rec(child, r, depth - 1, area, acc) {
                            return false;
                        }
                    }
                    return true;
                }
            }
        };
        merge_status(acc, contribution)
    }

    fn node_info(&self, id: NodeId) -> NodeInfo {
        let node = &self.nodes[id as usize];
        NodeInfo {
            status: node.status,
            level: node.level,
            origin: node.origin,
            rect: Rect3::from_origin_size(node.origin, self.dims.as_ivec3()),
            in_volume: node.in_volume,
            material: node.material,
        }
    }

    // ---- payload tests -----------------------------------------------------

    fn payload_empty(&self, src: &GridRef<'_>, region: &Rect3) -> bool {
        match self.usage {
            Usage::Density => src.is_empty_density(Some(region)),
            Usage::Material => src.is_uniform(Some(region)) == Some(0),
        }
    }

    fn payload_matches_full(&self, src: &GridRef<'_>, region: &Rect3, material: u8) -> bool {
        match self.usage {
            Usage::Density => src.is_full_density(Some(region)),
            Usage::Material => src.is_uniform(Some(region)) == Some(material),
        }
    }

    // ---- node lifecycle ----------------------------------------------------

    fn alloc_node(&mut self, node: OctreeNode) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.nodes[id as usize] = node;
            id
        } else {
            let id = self.nodes.len() as NodeId;
            self.nodes.push(node);
            id
        }
    }

    fn free_subtree(&mut self, id: NodeId) {
        let children = self.nodes[id as usize].children;
        if self.nodes[id as usize].status == NodeStatus::Interior {
            for child in children {
                self.free_subtree(child);
            }
        }
        self.uncache_node(id);
        self.nodes[id as usize] = OctreeNode::new(NodeStatus::Empty, 0, IVec3::ZERO);
        self.free.push(id);
    }

    /// Give an `Empty`/`Full` node a cached brick pre-filled with `fill`,
    /// creating its backing file
    fn materialize(&mut self, id: NodeId, fill: u8) -> Result<()> {
        self.cache_node(id)?;
        let volume = self.brick_voxels();
        let node = &mut self.nodes[id as usize];
        let Some(brick) = node.brick.as_mut() else {
            return Err(Error::InvalidArgument("materialized node lost its brick".into()));
        };
        brick.fill(None, &[fill]);
        node.in_volume = if fill == 0 { 0 } else { volume };
        if let Some(hist) = node.hist.as_mut() {
            **hist = [0; 256];
            hist[fill as usize] = volume as i64;
        }
        node.sync = false;
        Ok(())
    }

    /// Subdivide into eight children of the given initial state.
    /// `node_rect` and `depth` describe this node in the current query space.
    fn subdivide(
        &mut self,
        id: NodeId,
        node_rect: &Rect3,
        depth: u32,
        status: NodeStatus,
        in_volume: u64,
    ) -> Result<()> {
        self.nodes.try_reserve(8)?;
        let level = self.nodes[id as usize].level - 1;
        let material = self.nodes[id as usize].material;
        let mut children = [NIL; 8];
        for (i, slot) in children.iter_mut().enumerate() {
            let child_rect = node_rect
                .child_octant(i as u8)
                .scale_pow2(-(depth as i32 - 1));
            let mut child = OctreeNode::new(status, level, child_rect.p1);
            child.in_volume = in_volume;
            child.material = material;
            *slot = self.alloc_node(child);
        }
        let node = &mut self.nodes[id as usize];
        node.children = children;
        node.status = NodeStatus::Interior;
        Ok(())
    }

    /// Collapse an interior node whose children all agree
    fn try_collapse(&mut self, id: NodeId) -> Result<()> {
        let children = self.nodes[id as usize].children;
        let mut empties = 0;
        let mut fulls = 0;
        let mut material = None;
        for child in children {
            let c = &self.nodes[child as usize];
            match c.status {
                NodeStatus::Empty => empties += 1,
                NodeStatus::Full => {
                    fulls += 1;
                    material = match material {
                        None => Some(c.material),
                        Some(m) if m == c.material => Some(m),
                        Some(_) => return Ok(()),
                    };
                }
                _ => return Ok(()),
            }
        }
        if empties == 8 {
            for child in children {
                self.free_subtree(child);
            }
            self.erase_node(id)?;
            let node = &mut self.nodes[id as usize];
            node.children = [NIL; 8];
            node.status = NodeStatus::Empty;
            node.in_volume = 0;
        } else if fulls == 8 {
            let m = material.unwrap_or(255);
            for child in children {
                self.free_subtree(child);
            }
            self.erase_node(id)?;
            let volume = self.brick_voxels();
            let node = &mut self.nodes[id as usize];
            node.children = [NIL; 8];
            node.status = NodeStatus::Full;
            node.material = m;
            node.in_volume = volume;
        }
        Ok(())
    }

    /// Re-classify a leaf-level node after its brick changed
    fn classify_after_write(&mut self, id: NodeId) -> Result<()> {
        let volume = self.brick_voxels();
        let node = &self.nodes[id as usize];
        let empty = match self.usage {
            Usage::Density => node.in_volume == 0,
            Usage::Material => node.hist.as_ref().is_some_and(|h| h[0] == volume as i64),
        };
        if empty {
            self.erase_node(id)?;
            let node = &mut self.nodes[id as usize];
            node.status = NodeStatus::Empty;
            node.in_volume = 0;
            return Ok(());
        }
        let full_material = match self.usage {
            Usage::Density => (node.in_volume == volume).then_some(node.material),
            Usage::Material => node.hist.as_ref().and_then(|h| {
                (0..256usize)
                    .find(|&m| h[m] == volume as i64)
                    .map(|m| m as u8)
            }),
        };
        if let Some(m) = full_material {
            self.erase_node(id)?;
            let node = &mut self.nodes[id as usize];
            node.status = NodeStatus::Full;
            node.material = m;
            node.in_volume = volume;
            return Ok(());
        }
        self.nodes[id as usize].status = NodeStatus::Leaf;
        Ok(())
    }

    // ---- brick cache -------------------------------------------------------

    /// Make sure the node's brick is decompressed in memory
    fn cache_node(&mut self, id: NodeId) -> Result<()> {
        if self.nodes[id as usize].brick.is_some() {
            self.touch(id);
            return Ok(());
        }
        let (level, origin) = {
            let node = &self.nodes[id as usize];
            (node.level, node.origin)
        };
        let path = self.node_path(level, origin);
        let mut brick = Brick::new(self.dims, VOXEL_COMPONENTS)?;
        let mut hist: Box<Histogram> = Box::new([0; 256]);
        hist[0] = self.brick_voxels() as i64;

        let mut synced = false;
        {
            let mut files = self.files.borrow_mut();
            let file = BrickFile::open(&mut files, &path)?;
            if !file.is_empty()? {
                file.read_brick(&mut brick, &mut hist)?;
                synced = true;
            }
        }
        log::trace!("cached brick {}", path.display());

        let node = &mut self.nodes[id as usize];
        node.brick = Some(brick);
        node.sync = synced;
        if self.usage == Usage::Material {
            node.hist = Some(hist);
        }
        self.cached.push(id);
        Ok(())
    }

    fn touch(&mut self, id: NodeId) {
        if let Some(pos) = self.cached.iter().position(|&n| n == id) {
            self.cached.remove(pos);
            self.cached.push(id);
        }
    }

    fn uncache_node(&mut self, id: NodeId) {
        let node = &mut self.nodes[id as usize];
        node.brick = None;
        node.hist = None;
        self.cached.retain(|&n| n != id);
    }

    /// Write back the node's brick if it is ahead of the disk
    fn sync_node(&mut self, id: NodeId) -> Result<()> {
        let node = &self.nodes[id as usize];
        if node.sync || node.brick.is_none() {
            return Ok(());
        }
        let path = self.node_path(node.level, node.origin);
        let hist = self.header_histogram(id);
        {
            let node = &self.nodes[id as usize];
            let Some(brick) = node.brick.as_ref() else {
                return Ok(());
            };
            let mut files = self.files.borrow_mut();
            let file = BrickFile::open(&mut files, &path)?;
            file.write_brick(brick, &hist)?;
        }
        self.nodes[id as usize].sync = true;
        Ok(())
    }

    /// Census written into the brick-file header
    fn header_histogram(&self, id: NodeId) -> Histogram {
        let node = &self.nodes[id as usize];
        if let Some(hist) = node.hist.as_ref() {
            return **hist;
        }
        // density trees track only the occupancy counter; the header keeps
        // the two-sided summary
        let mut hist = [0i64; 256];
        hist[0] = (self.brick_voxels() - node.in_volume) as i64;
        hist[255] = node.in_volume as i64;
        hist
    }

    /// Drop the node's brick and backing file (transition away from Leaf,
    /// or collapse of an aggregate-carrying interior node)
    fn erase_node(&mut self, id: NodeId) -> Result<()> {
        self.uncache_node(id);
        let node = &mut self.nodes[id as usize];
        node.sync = false;
        let (level, origin) = (node.level, node.origin);
        let path = self.node_path(level, origin);
        self.files.borrow_mut().remove(&path)?;
        Ok(())
    }

    /// Evict least-recently-used bricks until the bound holds, then let the
    /// file cache enforce its own bound
    pub fn update_cache(&mut self) -> Result<()> {
        while self.cached.len() > self.max_cached {
            let id = self.cached[0];
            self.sync_node(id)?;
            let node = &mut self.nodes[id as usize];
            node.brick = None;
            node.hist = None;
            self.cached.remove(0);
            log::debug!(
                "evicted brick of node {id} ({} still cached)",
                self.cached.len()
            );
        }
        self.files.borrow_mut().update()
    }

    /// Write back every dirty cached brick and flush the file cache
    pub fn sync_cache(&mut self) -> Result<()> {
        for id in self.cached.clone() {
            self.sync_node(id)?;
        }
        let mut files = self.files.borrow_mut();
        files.update()?;
        files.sync()
    }

    // ---- voxel copies between node bricks and query grids ------------------

    fn copy_from_node(
        &mut self,
        id: NodeId,
        node_rect: &Rect3,
        area: &Rect3,
        out: &mut GridMut<'_>,
    ) -> Result<()> {
        self.cache_node(id)?;
        let Some(inter) = node_rect.intersection(area) else {
            return Ok(());
        };
        let dst = inter.sub_origin(area);
        let src = inter.sub_origin(node_rect);
        let node = &self.nodes[id as usize];
        let Some(brick) = node.brick.as_ref() else {
            return Err(Error::InvalidArgument("cached node lost its brick".into()));
        };
        out.copy_from(&dst, &brick.as_grid(), &src);
        Ok(())
    }

    fn copy_to_node(
        &mut self,
        id: NodeId,
        node_rect: &Rect3,
        area: &Rect3,
        src: &GridRef<'_>,
    ) -> Result<()> {
        self.cache_node(id)?;
        let Some(inter) = node_rect.intersection(area) else {
            return Ok(());
        };
        let src_region = inter.sub_origin(area);
        let dst_region = inter.sub_origin(node_rect);
        let volume = self.brick_voxels();
        let usage = self.usage;
        let node = &mut self.nodes[id as usize];
        let Some(brick) = node.brick.as_mut() else {
            return Err(Error::InvalidArgument("cached node lost its brick".into()));
        };
        match usage {
            Usage::Density => {
                let delta = brick.copy_from_counting(&dst_region, src, &src_region);
                node.in_volume = (node.in_volume as i64 + delta) as u64;
            }
            Usage::Material => {
                let Some(hist) = node.hist.as_mut() else {
                    return Err(Error::InvalidArgument("material node lost its census".into()));
                };
                brick.copy_from_histogram(&dst_region, src, &src_region, hist);
                node.in_volume = volume - hist[0] as u64;
            }
        }
        node.sync = false;
        Ok(())
    }

    fn fill_to_node(
        &mut self,
        id: NodeId,
        node_rect: &Rect3,
        area: &Rect3,
        pattern: u8,
    ) -> Result<()> {
        self.cache_node(id)?;
        let Some(inter) = node_rect.intersection(area) else {
            return Ok(());
        };
        let dst_region = inter.sub_origin(node_rect);
        let volume = self.brick_voxels();
        let usage = self.usage;
        let node = &mut self.nodes[id as usize];
        let Some(brick) = node.brick.as_mut() else {
            return Err(Error::InvalidArgument("cached node lost its brick".into()));
        };
        match usage {
            Usage::Density => {
                let delta = brick.fill_counting(&dst_region, pattern);
                node.in_volume = (node.in_volume as i64 + delta) as u64;
            }
            Usage::Material => {
                let Some(hist) = node.hist.as_mut() else {
                    return Err(Error::InvalidArgument("material node lost its census".into()));
                };
                brick.fill_histogram(&dst_region, pattern, hist);
                node.in_volume = volume - hist[0] as u64;
            }
        }
        node.sync = false;
        Ok(())
    }

    // ---- index (de)serialization -------------------------------------------

    /// Write the node topology as a preorder index
    pub fn save_index<W: std::io::Write>(&self, w: &mut W) -> Result<()> {
        codec::write_u32(w, self.max_depth)?;
        codec::write_u32(w, self.usage as u32)?;
        codec::write_ivec3(w, self.origin)?;
        codec::write_u32(w, self.dims.x)?;
        codec::write_u32(w, self.dims.y)?;
        codec::write_u32(w, self.dims.z)?;
        self.save_node(0, w)
    }

    fn save_node<W: std::io::Write>(&self, id: NodeId, w: &mut W) -> Result<()> {
        let node = &self.nodes[id as usize];
        codec::write_u32(w, node.status as u32)?;
        match node.status {
            NodeStatus::Empty => {}
            NodeStatus::Full => {
                codec::write_u32(w, node.material as u32)?;
            }
            NodeStatus::Leaf => {
                codec::write_u32(w, node.in_volume as u32)?;
                codec::write_u32(w, node.material as u32)?;
            }
            NodeStatus::Interior => {
                codec::write_u32(w, node.in_volume as u32)?;
                codec::write_u32(w, node.material as u32)?;
                for child in node.children {
                    self.save_node(child, w)?;
                }
            }
        }
        Ok(())
    }

    /// Read a preorder index written by [`save_index`](Self::save_index).
    /// Node levels, origins and filenames are reconstructed from the stored
    /// topology.
    pub fn load_index<R: std::io::Read>(
        r: &mut R,
        prefix: PathBuf,
        max_cached: usize,
        files: Rc<RefCell<FileCache>>,
    ) -> Result<Self> {
        let max_depth = codec::read_u32(r)?;
        if max_depth > 24 {
            return Err(Error::CorruptedArchive(format!(
                "implausible max_depth {max_depth}"
            )));
        }
        let usage = Usage::from_u32(codec::read_u32(r)?)?;
        let origin = codec::read_ivec3(r)?;
        let dims = UVec3::new(codec::read_u32(r)?, codec::read_u32(r)?, codec::read_u32(r)?);

        let mut tree = VoxelOctree::new(
            OctreeConfig {
                usage,
                max_depth,
                origin,
                dims,
                prefix,
                max_cached,
            },
            files,
        );
        let root_rect =
            Rect3::from_origin_size(origin, dims.as_ivec3()).scale_pow2(max_depth as i32);
        tree.load_node(0, &root_rect, max_depth as i32, r)?;
        Ok(tree)
    }

    fn load_node<R: std::io::Read>(
        &mut self,
        id: NodeId,
        rect0: &Rect3,
        level: i32,
        r: &mut R,
    ) -> Result<()> {
        if level < 0 {
            return Err(Error::CorruptedArchive(
                "node tree deeper than max_depth".into(),
            ));
        }
        let volume = self.brick_voxels();
        let status = NodeStatus::from_u32(codec::read_u32(r)?)?;
        {
            let node = &mut self.nodes[id as usize];
            node.status = status;
            node.level = level as u32;
            node.origin = rect0.scale_pow2(-level).p1;
        }
        match status {
            NodeStatus::Empty => {}
            NodeStatus::Full => {
                let material = read_material(r)?;
                let node = &mut self.nodes[id as usize];
                node.material = material;
                node.in_volume = volume;
            }
            NodeStatus::Leaf => {
                let in_volume = codec::read_u32(r)? as u64;
                let material = read_material(r)?;
                let node = &mut self.nodes[id as usize];
                node.in_volume = in_volume;
                node.material = material;
            }
            NodeStatus::Interior => {
                let in_volume = codec::read_u32(r)? as u64;
                let material = read_material(r)?;
                let mut children = [NIL; 8];
                for (i, slot) in children.iter_mut().enumerate() {
                    *slot = self.alloc_node(OctreeNode::new(NodeStatus::Empty, 0, IVec3::ZERO));
                    let child_rect = rect0.child_octant(i as u8);
                    let child = *slot;
                    self.load_node(child, &child_rect, level - 1, r)?;
                }
                let node = &mut self.nodes[id as usize];
                node.in_volume = in_volume;
                node.material = material;
                node.children = children;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn debug_status(&self, id: NodeId) -> NodeStatus {
        self.nodes[id as usize].status
    }
}

fn read_material<R: std::io::Read>(r: &mut R) -> Result<u8> {
    let v = codec::read_u32(r)?;
    if v > 255 {
        return Err(Error::CorruptedArchive(format!("material {v} out of range")));
    }
    Ok(v as u8)
}

/// Merge one contribution into the running region status.
/// Returns false once the result is pinned to `Mixed`.
pub(crate) fn merge_status(acc: &mut Option<RegionStatus>, s: RegionStatus) -> bool {
    match (*acc, s) {
        (_, RegionStatus::Mixed) => {
            *acc = Some(RegionStatus::Mixed);
            false
        }
        (None, s) => {
            *acc = Some(s);
            true
        }
        (Some(a), s) if a == s => true,
        (Some(_), _) => {
            *acc = Some(RegionStatus::Mixed);
            false
        }
    }
}
