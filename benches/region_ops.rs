//! Microbenchmarks for the region write / read / LOD pipeline

use std::cell::RefCell;
use std::rc::Rc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use glam::{IVec3, UVec3};

use voxstore::math::Rect3;
use voxstore::vfs::{FileCache, FileSystem, StdFileSystem};
use voxstore::voxel::{Usage, VoxelWorld, WorldConfig, std_mkdir};

fn make_world(dir: &tempfile::TempDir, brick: u32, lods: u32) -> VoxelWorld {
    let vfs: Rc<dyn FileSystem> = Rc::new(StdFileSystem);
    let files = Rc::new(RefCell::new(FileCache::new(Rc::clone(&vfs), 64)));
    let config = WorldConfig::new(UVec3::splat(brick), lods, Usage::Density, dir.path());
    let mut world = VoxelWorld::new(config, vfs, files).unwrap();
    world.set_mkdir(std_mkdir());
    world
}

fn noise_payload(rect: &Rect3) -> Vec<u8> {
    let mut state = 0x2545f491u32;
    (0..rect.volume())
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            if state & 1 == 0 { 0 } else { 255 }
        })
        .collect()
}

fn bench_set_region(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut world = make_world(&dir, 32, 3);
    let rect = Rect3::new(IVec3::ZERO, IVec3::splat(32));
    let payload = noise_payload(&rect);

    c.bench_function("set_region 32^3", |b| {
        b.iter(|| {
            world.set_region(0, &rect, black_box(&payload)).unwrap();
            world.update_cache().unwrap();
        })
    });
}

fn bench_get_region(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut world = make_world(&dir, 32, 3);
    let rect = Rect3::new(IVec3::ZERO, IVec3::splat(32));
    let payload = noise_payload(&rect);
    world.set_region(0, &rect, &payload).unwrap();

    let mut out = vec![0u8; payload.len()];
    c.bench_function("get_region 32^3", |b| {
        b.iter(|| {
            world.get_region(0, &rect, black_box(&mut out)).unwrap();
        })
    });
}

fn bench_generate_lod(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut world = make_world(&dir, 32, 3);
    let rect = Rect3::new(IVec3::ZERO, IVec3::splat(32));
    let payload = noise_payload(&rect);
    world.set_region(0, &rect, &payload).unwrap();

    c.bench_function("generate_lod 32^3", |b| {
        b.iter(|| {
            world.generate_lod(0, black_box(&rect)).unwrap();
        })
    });
}

criterion_group!(benches, bench_set_region, bench_get_region, bench_generate_lod);
criterion_main!(benches);
