//! World generator binary — builds a demo voxel world on disk.
//!
//! Usage: cargo run --release --bin generate_world -- [OPTIONS]
//!
//! Options:
//!   --out <DIR>       Output directory (default: "world")
//!   --brick <N>       Brick dimension per axis (default: 32)
//!   --lods <N>        Number of LOD levels (default: 4)
//!   --radius <N>      Sphere radius in level-0 voxels (default: 48)
//!   --material        Material usage instead of density
//!
//! Writes a solid sphere centered at the origin, regenerates the LOD
//! pyramid over the edited footprint and persists the manifest, the tree
//! indexes and the compressed bricks under the output directory.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use glam::{IVec3, UVec3};

use voxstore::vfs::{FileCache, FileSystem, StdFileSystem};
use voxstore::voxel::{Usage, VoxelWorld, WorldConfig, std_mkdir};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().collect();
    let out = parse_str_arg(&args, "--out").unwrap_or_else(|| "world".to_string());
    let brick = parse_u32_arg(&args, "--brick").unwrap_or(32);
    let lods = parse_u32_arg(&args, "--lods").unwrap_or(4);
    let radius = parse_i32_arg(&args, "--radius").unwrap_or(48);
    let usage = if args.iter().any(|a| a == "--material") {
        Usage::Material
    } else {
        Usage::Density
    };

    if let Err(e) = run(PathBuf::from(out), brick, lods, radius, usage) {
        log::error!("world generation failed: {e}");
        std::process::exit(1);
    }
}

fn run(
    out: PathBuf,
    brick: u32,
    lods: u32,
    radius: i32,
    usage: Usage,
) -> voxstore::Result<()> {
    std::fs::create_dir_all(&out)?;
    let vfs: Rc<dyn FileSystem> = Rc::new(StdFileSystem);
    let files = Rc::new(RefCell::new(FileCache::new(Rc::clone(&vfs), 64)));

    let config = WorldConfig::new(UVec3::splat(brick), lods, usage, &out);
    let mut world = VoxelWorld::new(config, vfs, files)?;
    world.set_mkdir(std_mkdir());

    log::info!(
        "writing a radius-{radius} sphere ({brick}^3 bricks, {lods} levels, {usage:?})"
    );
    let start = std::time::Instant::now();

    // write in brick-sized batches so the working set stays small
    let b = brick as i32;
    let mut batch = vec![0u8; (brick * brick * brick) as usize];
    let lo = (-radius).div_euclid(b);
    let hi = radius.div_euclid(b);
    let mut edited: Option<voxstore::math::Rect3> = None;
    for bz in lo..=hi {
        for by in lo..=hi {
            for bx in lo..=hi {
                let origin = IVec3::new(bx * b, by * b, bz * b);
                let rect = voxstore::math::Rect3::from_origin_size(origin, IVec3::splat(b));
                if !fill_sphere_batch(&mut batch, origin, b, radius, usage) {
                    continue;
                }
                world.set_region(0, &rect, &batch)?;
                world.update_cache()?;
                edited = Some(match edited {
                    Some(r) => r.union(&rect),
                    None => rect,
                });
            }
        }
    }

    if let Some(rect) = edited {
        log::info!("generating {} LOD levels over {rect:?}", lods - 1);
        world.generate_all_lod(0, &rect)?;
    }

    let mut updates = 0;
    while world.next_updated_region().is_some() {
        updates += 1;
    }
    log::info!("{updates} updated regions recorded for re-meshing");

    world.sync_cache()?;
    world.save()?;
    world.save_all_trees()?;
    log::info!(
        "done: {} trees in {:.1}s",
        world.tree_count(),
        start.elapsed().as_secs_f32()
    );
    Ok(())
}

/// Evaluate the sphere over one brick-aligned batch.
/// Returns false when the batch is entirely outside the surface band.
fn fill_sphere_batch(batch: &mut [u8], origin: IVec3, b: i32, radius: i32, usage: Usage) -> bool {
    let r2 = (radius * radius) as f32;
    let mut any = false;
    let mut i = 0;
    for z in 0..b {
        for y in 0..b {
            for x in 0..b {
                let p = origin + IVec3::new(x, y, z);
                let d2 = (p.x * p.x + p.y * p.y + p.z * p.z) as f32;
                let value = if d2 <= r2 {
                    match usage {
                        Usage::Density => 255,
                        Usage::Material => 1 + (p.y.rem_euclid(3)) as u8,
                    }
                } else {
                    0
                };
                batch[i] = value;
                any |= value != 0;
                i += 1;
            }
        }
    }
    any
}

fn parse_str_arg(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_u32_arg(args: &[String], name: &str) -> Option<u32> {
    parse_str_arg(args, name).and_then(|v| v.parse().ok())
}

fn parse_i32_arg(args: &[String], name: &str) -> Option<i32> {
    parse_str_arg(args, name).and_then(|v| v.parse().ok())
}
