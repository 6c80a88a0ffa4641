//! Voxel storage: bricks, brick files, octrees, worlds and the LOD pyramid

pub mod brick;
pub mod brick_file;
pub mod lod;
pub mod octree;
pub mod ring;
pub mod world;

pub use brick::{Brick, DENSITY_INSIDE, GridMut, GridRef, Histogram};
pub use brick_file::BrickFile;
pub use octree::{NodeInfo, NodeStatus, OctreeConfig, RegionStatus, Usage, VoxelOctree};
pub use ring::{UPDATE_RING_CAPACITY, UpdateRing};
pub use world::{MkdirFn, TreeCoord, VoxelWorld, WorldConfig, std_mkdir};
