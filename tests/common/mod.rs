//! Common test helpers for vexpr integration tests
//!
//! Author: Moroya Sakamoto

#![allow(dead_code)]

use vexpr::prelude::*;

// ============================================================================
// Clip infos
// ============================================================================

/// 8-bit grayscale clip info
pub fn gray8(width: usize, height: usize) -> VideoInfo {
    VideoInfo::new(VideoFormat::gray8(), width, height)
}

/// 16-bit grayscale clip info
pub fn gray16(width: usize, height: usize) -> VideoInfo {
    VideoInfo::new(VideoFormat::gray16(), width, height)
}

/// 32-bit float grayscale clip info
pub fn grays(width: usize, height: usize) -> VideoInfo {
    VideoInfo::new(VideoFormat::grays(), width, height)
}

// ============================================================================
// Plane builders
// ============================================================================

/// Single-row 8-bit plane from explicit sample values
pub fn plane_u8(values: &[u8]) -> Plane {
    let mut p = Plane::new(values.len(), 1, 1);
    for (x, &v) in values.iter().enumerate() {
        p.set_int(x, 0, v as u32);
    }
    p
}

/// Single-row 16-bit plane from explicit sample values
pub fn plane_u16(values: &[u16]) -> Plane {
    let mut p = Plane::new(values.len(), 1, 2);
    for (x, &v) in values.iter().enumerate() {
        p.set_int(x, 0, v as u32);
    }
    p
}

/// Single-row float plane from explicit sample values
pub fn plane_f32(values: &[f32]) -> Plane {
    let mut p = Plane::new(values.len(), 1, 4);
    for (x, &v) in values.iter().enumerate() {
        p.set_f32(x, 0, v);
    }
    p
}

/// 8-bit plane filled with a deterministic pseudo-random pattern
pub fn noise_plane_u8(width: usize, height: usize, seed: u32) -> Plane {
    let mut p = Plane::new(width, height, 1);
    let mut state = seed | 1;
    for y in 0..height {
        for x in 0..width {
            // xorshift32
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            p.set_int(x, y, state & 0xff);
        }
    }
    p
}

/// First-row samples of an integer plane
pub fn row_u8(p: &Plane) -> Vec<u8> {
    (0..p.width()).map(|x| p.get_int(x, 0) as u8).collect()
}

// ============================================================================
// Runners
// ============================================================================

/// Compiles `expr` for one 8-bit clip and runs it over `values`,
/// returning the visible output bytes.
pub fn run_u8(expr: &str, values: &[u8], opt: u32) -> Vec<u8> {
    let info = gray8(values.len(), 1);
    let filter = ExprFilter::new(&[info], &[expr], None, opt).unwrap();
    let src = plane_u8(values);
    let mut dst = Plane::for_plane(&info, 0);
    filter
        .process_plane(0, 0, &mut dst, &[&src], &[FrameProps::new()])
        .unwrap();
    row_u8(&dst)
}

// ============================================================================
// Assertion helpers
// ============================================================================

/// Assert two f32 values are close within tolerance
pub fn assert_close(a: f32, b: f32, tol: f32, msg: &str) {
    assert!(
        (a - b).abs() < tol,
        "{}: {} vs {} (diff={}, tol={})",
        msg,
        a,
        b,
        (a - b).abs(),
        tol
    );
}

/// Assert the compiled routine and the reference evaluator produce the
/// same plane for an 8-bit single-clip expression.
pub fn assert_jit_matches_interp(expr: &str, src: &Plane, info: VideoInfo, opt: u32) {
    let filter = ExprFilter::new(&[info], &[expr], None, opt).unwrap();
    let reference = RefExpr::new(expr, &info, &[info], opt).unwrap();

    let mut jit_dst = Plane::for_plane(&info, 0);
    let mut ref_dst = Plane::for_plane(&info, 0);
    filter
        .process_plane(0, 0, &mut jit_dst, &[src], &[FrameProps::new()])
        .unwrap();
    reference
        .process_plane(0, &mut ref_dst, &[src], &[FrameProps::new()])
        .unwrap();

    for y in 0..jit_dst.height() {
        for x in 0..jit_dst.width() {
            assert_eq!(
                jit_dst.get_int(x, y),
                ref_dst.get_int(x, y),
                "JIT/interp mismatch for '{}' at ({}, {}): jit={}, interp={}",
                expr,
                x,
                y,
                jit_dst.get_int(x, y),
                ref_dst.get_int(x, y)
            );
        }
    }
}
