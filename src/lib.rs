//! voxstore - sparse paged voxel storage with level-of-detail pyramids
//!
//! A world is a sparse collection of octree regions whose leaves are
//! fixed-size compressed bricks on disk. Edits go through
//! [`voxel::VoxelWorld`]; consumers rebuild coarser levels with
//! `generate_all_lod` and drain the updated-region ring to learn what
//! changed.

pub mod codec;
pub mod error;
pub mod math;
pub mod vfs;
pub mod voxel;

pub use error::{Error, Result};
