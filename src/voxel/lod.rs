//! Downsampling kernels for LOD generation.
//!
//! The source grid carries a one-voxel border around the doubled destination
//! footprint, so every destination voxel can evaluate a full 3×3×3
//! neighborhood. The kernel is centered on the source sample at exactly
//! twice the destination coordinate.

use glam::IVec3;

use crate::voxel::brick::{GridMut, GridRef};

/// Trilinear weights, x-fastest: 1/8 corners, 1/4 edges, 1/2 faces,
/// 1 center. The sum is 8, normalized below so uniform input reproduces
/// itself.
const KERNEL: [f32; 27] = [
    // slice z-1
    1.0 / 8.0, 1.0 / 4.0, 1.0 / 8.0,
    1.0 / 4.0, 1.0 / 2.0, 1.0 / 4.0,
    1.0 / 8.0, 1.0 / 4.0, 1.0 / 8.0,
    // slice z
    1.0 / 4.0, 1.0 / 2.0, 1.0 / 4.0,
    1.0 / 2.0, 1.0 / 1.0, 1.0 / 2.0,
    1.0 / 4.0, 1.0 / 2.0, 1.0 / 4.0,
    // slice z+1
    1.0 / 8.0, 1.0 / 4.0, 1.0 / 8.0,
    1.0 / 4.0, 1.0 / 2.0, 1.0 / 4.0,
    1.0 / 8.0, 1.0 / 4.0, 1.0 / 8.0,
];

/// Weighted 3×3×3 average of the density field
pub(crate) fn downsample_density(src: &GridRef<'_>, dst: &mut GridMut<'_>) {
    let dims = src.dims().as_ivec3();
    for z in (1..dims.z - 1).step_by(2) {
        for y in (1..dims.y - 1).step_by(2) {
            for x in (1..dims.x - 1).step_by(2) {
                let mut value = 0.0f32;
                let mut k = 0;
                for dz in -1..=1 {
                    for dy in -1..=1 {
                        for dx in -1..=1 {
                            let s = src.sample(IVec3::new(x + dx, y + dy, z + dz));
                            value += KERNEL[k] * s as f32 / 256.0;
                            k += 1;
                        }
                    }
                }
                value /= 8.0;
                let out = IVec3::new((x - 1) / 2, (y - 1) / 2, (z - 1) / 2);
                dst.offset_mut(out)[0] = (value * 256.0) as u8;
            }
        }
    }
}

/// Nearest-center sampling for material ids
pub(crate) fn downsample_material(src: &GridRef<'_>, dst: &mut GridMut<'_>) {
    let dims = src.dims().as_ivec3();
    for z in (1..dims.z - 1).step_by(2) {
        for y in (1..dims.y - 1).step_by(2) {
            for x in (1..dims.x - 1).step_by(2) {
                let out = IVec3::new((x - 1) / 2, (y - 1) / 2, (z - 1) / 2);
                dst.offset_mut(out)[0] = src.sample(IVec3::new(x, y, z));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::UVec3;

    fn grids(n: u32) -> (Vec<u8>, Vec<u8>, UVec3, UVec3) {
        let src_dims = UVec3::splat(2 * n + 2);
        let dst_dims = UVec3::splat(n);
        let src = vec![0u8; (src_dims.x * src_dims.y * src_dims.z) as usize];
        let dst = vec![0u8; (dst_dims.x * dst_dims.y * dst_dims.z) as usize];
        (src, dst, src_dims, dst_dims)
    }

    #[test]
    fn test_density_uniform_is_identity() {
        for v in [0u8, 128, 255] {
            let (mut src, mut dst, sd, dd) = grids(2);
            src.fill(v);
            downsample_density(
                &GridRef::new(sd, 1, &src),
                &mut GridMut::new(dd, 1, &mut dst),
            );
            assert!(dst.iter().all(|&o| o == v), "value {v}");
        }
    }

    #[test]
    fn test_density_single_sample() {
        let (mut src, mut dst, sd, dd) = grids(1);
        // only the kernel center of the single output voxel is set
        let center = 1 + 4 * 1 + 16 * 1;
        src[center] = 255;
        downsample_density(
            &GridRef::new(sd, 1, &src),
            &mut GridMut::new(dd, 1, &mut dst),
        );
        // 255/256 / 8 * 256 = 31.875
        assert_eq!(dst[0], 31);
    }

    #[test]
    fn test_density_face_neighbor_weight() {
        let (mut src, mut dst, sd, dd) = grids(1);
        // face neighbor (+x of the center) carries weight 1/2
        let face = 2 + 4 * 1 + 16 * 1;
        src[face] = 255;
        downsample_density(
            &GridRef::new(sd, 1, &src),
            &mut GridMut::new(dd, 1, &mut dst),
        );
        assert_eq!(dst[0], 15);
    }

    #[test]
    fn test_material_takes_center() {
        let (mut src, mut dst, sd, dd) = grids(2);
        // centers of the 8 output voxels sit at odd coordinates
        for z in 0..2 {
            for y in 0..2 {
                for x in 0..2 {
                    let c = (1 + 2 * x) + 6 * (1 + 2 * y) + 36 * (1 + 2 * z);
                    src[c] = (1 + x + 2 * y + 4 * z) as u8;
                }
            }
        }
        downsample_material(
            &GridRef::new(sd, 1, &src),
            &mut GridMut::new(dd, 1, &mut dst),
        );
        assert_eq!(dst, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
