//! Little-endian fixed-width encoding over byte streams.
//!
//! Every integer that reaches disk (world manifest, octree index, brick
//! histogram header) goes through these helpers so the wire format stays
//! little-endian regardless of the host.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::IVec3;

use crate::error::Result;

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_u32::<LittleEndian>(v)?;
    Ok(())
}

pub fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    Ok(r.read_u32::<LittleEndian>()?)
}

pub fn write_i32<W: Write>(w: &mut W, v: i32) -> Result<()> {
    w.write_i32::<LittleEndian>(v)?;
    Ok(())
}

pub fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    Ok(r.read_i32::<LittleEndian>()?)
}

pub fn write_i64<W: Write>(w: &mut W, v: i64) -> Result<()> {
    w.write_i64::<LittleEndian>(v)?;
    Ok(())
}

pub fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    Ok(r.read_i64::<LittleEndian>()?)
}

pub fn write_f32<W: Write>(w: &mut W, v: f32) -> Result<()> {
    w.write_f32::<LittleEndian>(v)?;
    Ok(())
}

pub fn read_f32<R: Read>(r: &mut R) -> Result<f32> {
    Ok(r.read_f32::<LittleEndian>()?)
}

pub fn write_ivec3<W: Write>(w: &mut W, v: IVec3) -> Result<()> {
    write_i32(w, v.x)?;
    write_i32(w, v.y)?;
    write_i32(w, v.z)
}

pub fn read_ivec3<R: Read>(r: &mut R) -> Result<IVec3> {
    let x = read_i32(r)?;
    let y = read_i32(r)?;
    let z = read_i32(r)?;
    Ok(IVec3::new(x, y, z))
}
