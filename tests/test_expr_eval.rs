//! End-to-end evaluation of compiled expressions over real planes.
//!
//! Author: Moroya Sakamoto

mod common;

use common::*;
use vexpr::prelude::*;

// ============================================================================
// Bit-exact scenarios (8-bit, one clip, opt=1)
// ============================================================================

#[test]
fn test_roundtrip_identity() {
    let info = gray8(64, 16);
    let src = noise_plane_u8(64, 16, 0xdead);
    let filter = ExprFilter::new(&[info], &["x"], None, 1).unwrap();
    let mut dst = Plane::for_plane(&info, 0);
    filter
        .process_plane(0, 0, &mut dst, &[&src], &[FrameProps::new()])
        .unwrap();
    for y in 0..16 {
        for x in 0..64 {
            assert_eq!(dst.get_int(x, y), src.get_int(x, y), "at ({x}, {y})");
        }
    }
}

#[test]
fn test_clamped_double() {
    assert_eq!(run_u8("x 2 *", &[0, 64, 128, 255], 1), vec![0, 128, 255, 255]);
}

#[test]
fn test_compare() {
    assert_eq!(run_u8("x 128 <", &[0, 64, 128, 255], 1), vec![1, 1, 0, 0]);
}

#[test]
fn test_ternary_select() {
    assert_eq!(
        run_u8("x 100 > 200 50 ?", &[0, 64, 128, 255], 1),
        vec![50, 50, 200, 200]
    );
}

#[test]
fn test_frame_number() {
    let info = gray8(4, 1);
    let filter = ExprFilter::new(&[info], &["N"], None, 1).unwrap();
    let src = plane_u8(&[0, 0, 0, 0]);
    let mut dst = Plane::for_plane(&info, 0);
    filter
        .process_plane(0, 7, &mut dst, &[&src], &[FrameProps::new()])
        .unwrap();
    assert_eq!(row_u8(&dst), vec![7, 7, 7, 7]);
}

#[test]
fn test_column_ramp() {
    assert_eq!(run_u8("X", &[0, 0, 0, 0], 1), vec![0, 1, 2, 3]);
    // Across more than one vector block.
    let wide: Vec<u8> = (0..16).map(|x| x as u8).collect();
    assert_eq!(run_u8("X", &vec![0u8; 16], 1), wide);
}

#[test]
fn test_row_broadcast() {
    let info = gray8(8, 4);
    let src = noise_plane_u8(8, 4, 1);
    let filter = ExprFilter::new(&[info], &["Y"], None, 1).unwrap();
    let mut dst = Plane::for_plane(&info, 0);
    filter
        .process_plane(0, 0, &mut dst, &[&src], &[FrameProps::new()])
        .unwrap();
    for y in 0..4 {
        for x in 0..8 {
            assert_eq!(dst.get_int(x, y), y as u32);
        }
    }
}

#[test]
fn test_saturating_square() {
    assert_eq!(
        run_u8("x dup *", &[0, 64, 128, 255], 1),
        vec![0, 255, 255, 255]
    );
}

#[test]
fn test_swap() {
    // x 2 swap - computes 2 - x, clamped at zero.
    assert_eq!(run_u8("x 2 swap -", &[0, 1, 2, 255], 1), vec![2, 1, 0, 0]);
}

#[test]
fn test_literal_typing() {
    // Integer-valued and float-valued literals both store the byte 2.
    assert_eq!(run_u8("2", &[9, 9, 9, 9], 1), vec![2, 2, 2, 2]);
    assert_eq!(run_u8("2.0", &[9, 9, 9, 9], 1), vec![2, 2, 2, 2]);
}

#[test]
fn test_type_propagation_matches_across_opt() {
    // x+1 in integer mode and in forced-float mode agree on exact values.
    let values: Vec<u8> = (0..=255).map(|v| v as u8).collect();
    let int_mode = run_u8("x 1 +", &values, 1);
    let float_mode = run_u8("x 1 +", &values, 0);
    assert_eq!(int_mode, float_mode);
    assert_eq!(int_mode[254], 255);
    assert_eq!(int_mode[255], 255); // clamped
}

#[test]
fn test_logic_ops() {
    assert_eq!(run_u8("x not", &[0, 1, 2, 255], 1), vec![1, 0, 0, 0]);
    assert_eq!(
        run_u8("x 10 > x 100 < and", &[5, 50, 150, 255], 1),
        vec![0, 1, 0, 0]
    );
    assert_eq!(
        run_u8("x 10 < x 100 > or", &[5, 50, 150, 255], 1),
        vec![1, 0, 1, 1]
    );
    assert_eq!(
        run_u8("x 10 > x 100 < xor", &[5, 50, 150, 255], 1),
        vec![1, 0, 1, 1]
    );
}

#[test]
fn test_min_max_mod() {
    assert_eq!(
        run_u8("x 100 min 10 max", &[5, 50, 150, 255], 1),
        vec![10, 50, 100, 100]
    );
    assert_eq!(run_u8("x 16 %", &[0, 15, 16, 255], 1), vec![0, 15, 0, 15]);
}

#[test]
fn test_division_promotes_to_float() {
    // 255/2 = 127.5 rounds to even 128.
    assert_eq!(run_u8("x 2 /", &[0, 1, 254, 255], 1), vec![0, 0, 127, 128]);
}

#[test]
fn test_sqrt_abs() {
    assert_eq!(run_u8("x sqrt", &[0, 16, 100, 255], 1), vec![0, 4, 10, 16]);
    assert_eq!(run_u8("x 128 - abs", &[0, 120, 128, 255], 1), vec![128, 8, 0, 127]);
}

// ============================================================================
// 16-bit and float formats
// ============================================================================

#[test]
fn test_16bit_saturation() {
    let info = gray16(8, 1);
    let filter = ExprFilter::new(&[info], &["x 256 *"], None, 1).unwrap();
    let src = plane_u16(&[0, 1, 255, 256, 4096, 65535, 7, 8]);
    let mut dst = Plane::for_plane(&info, 0);
    filter
        .process_plane(0, 0, &mut dst, &[&src], &[FrameProps::new()])
        .unwrap();
    let expected = [0u32, 256, 65280, 65535, 65535, 65535, 1792, 2048];
    for (x, &e) in expected.iter().enumerate() {
        assert_eq!(dst.get_int(x, 0), e, "at {x}");
    }
}

#[test]
fn test_float_source_and_output() {
    let info = grays(8, 1);
    let filter = ExprFilter::new(&[info], &["x 0.5 * 0.25 +"], None, 1).unwrap();
    let src = plane_f32(&[-1.0, -0.5, 0.0, 0.5, 1.0, 2.0, 4.0, 8.0]);
    let mut dst = Plane::for_plane(&info, 0);
    filter
        .process_plane(0, 0, &mut dst, &[&src], &[FrameProps::new()])
        .unwrap();
    for x in 0..8 {
        let expected = src.get_f32(x, 0) * 0.5 + 0.25;
        assert_close(dst.get_f32(x, 0), expected, 1e-6, "float chain");
    }
}

#[test]
fn test_integer_to_float_conversion_on_store() {
    // Integer pipeline stored to a float plane.
    let base = gray8(8, 1);
    let preset = FormatPreset::gray(SampleType::Float, 32);
    let filter = ExprFilter::new(&[base], &["x 3 *"], Some(preset), 1).unwrap();
    let src = plane_u8(&[0, 1, 2, 3, 4, 5, 6, 7]);
    let out_info = *filter.output_info();
    let mut dst = Plane::for_plane(&out_info, 0);
    filter
        .process_plane(0, 0, &mut dst, &[&src], &[FrameProps::new()])
        .unwrap();
    for x in 0..8 {
        assert_eq!(dst.get_f32(x, 0), (x * 3) as f32);
    }
}

// ============================================================================
// Transcendental accuracy
// ============================================================================

#[test]
fn test_exp_accuracy() {
    let info = grays(256, 1);
    let filter = ExprFilter::new(&[info], &["x exp"], None, 1).unwrap();
    let mut src = Plane::for_plane(&info, 0);
    for x in 0..256 {
        src.set_f32(x, 0, -10.0 + 20.0 * (x as f32) / 255.0);
    }
    let mut dst = Plane::for_plane(&info, 0);
    filter
        .process_plane(0, 0, &mut dst, &[&src], &[FrameProps::new()])
        .unwrap();
    for x in 0..256 {
        let input = src.get_f32(x, 0);
        let expected = input.exp();
        let got = dst.get_f32(x, 0);
        let rel = ((got - expected) / expected).abs();
        assert!(
            rel < 2e-5,
            "exp({input}) = {got}, expected {expected} (rel {rel})"
        );
    }
}

#[test]
fn test_log_accuracy() {
    let info = grays(256, 1);
    let filter = ExprFilter::new(&[info], &["x log"], None, 1).unwrap();
    let mut src = Plane::for_plane(&info, 0);
    for x in 0..256 {
        src.set_f32(x, 0, 0.01 + (x as f32) * 0.5);
    }
    let mut dst = Plane::for_plane(&info, 0);
    filter
        .process_plane(0, 0, &mut dst, &[&src], &[FrameProps::new()])
        .unwrap();
    for x in 0..256 {
        let input = src.get_f32(x, 0);
        let expected = input.ln();
        let got = dst.get_f32(x, 0);
        assert!(
            (got - expected).abs() < 1e-5 + expected.abs() * 2e-5,
            "log({input}) = {got}, expected {expected}"
        );
    }
}

#[test]
fn test_sin_cos_accuracy() {
    let info = grays(256, 1);
    let mut src = Plane::for_plane(&info, 0);
    for x in 0..256 {
        src.set_f32(x, 0, -8.0 + 16.0 * (x as f32) / 255.0);
    }
    for (expr, f) in [("x sin", f32::sin as fn(f32) -> f32), ("x cos", f32::cos)] {
        let filter = ExprFilter::new(&[info], &[expr], None, 1).unwrap();
        let mut dst = Plane::for_plane(&info, 0);
        filter
            .process_plane(0, 0, &mut dst, &[&src], &[FrameProps::new()])
            .unwrap();
        for x in 0..256 {
            let input = src.get_f32(x, 0);
            assert_close(dst.get_f32(x, 0), f(input), 1e-5, expr);
        }
    }
}

#[test]
fn test_pow_composition() {
    let info = grays(64, 1);
    let filter = ExprFilter::new(&[info], &["x 2.5 pow"], None, 1).unwrap();
    let mut src = Plane::for_plane(&info, 0);
    for x in 0..64 {
        src.set_f32(x, 0, 0.5 + x as f32 * 0.25);
    }
    let mut dst = Plane::for_plane(&info, 0);
    filter
        .process_plane(0, 0, &mut dst, &[&src], &[FrameProps::new()])
        .unwrap();
    for x in 0..64 {
        let input = src.get_f32(x, 0);
        let expected = input.powf(2.5);
        let got = dst.get_f32(x, 0);
        let rel = ((got - expected) / expected).abs();
        assert!(
            rel < 5e-5,
            "pow({input}, 2.5) = {got}, expected {expected} (rel {rel})"
        );
    }
}

#[test]
fn test_pi_constant() {
    let info = grays(8, 1);
    let filter = ExprFilter::new(&[info], &["pi"], None, 1).unwrap();
    let src = Plane::for_plane(&info, 0);
    let mut dst = Plane::for_plane(&info, 0);
    filter
        .process_plane(0, 0, &mut dst, &[&src], &[FrameProps::new()])
        .unwrap();
    assert_eq!(dst.get_f32(5, 0), std::f32::consts::PI);
}

// ============================================================================
// Frame properties
// ============================================================================

#[test]
fn test_property_multiply() {
    let info = gray8(8, 1);
    let filter = ExprFilter::new(&[info, info], &["x y._Gain *"], None, 1).unwrap();
    let src_x = plane_u8(&[0, 10, 20, 30, 40, 50, 60, 70]);
    let src_y = plane_u8(&[0; 8]);

    let mut props_y = FrameProps::new();
    props_y.insert("_Gain".to_string(), PropValue::Float(2.5));

    let mut dst = Plane::for_plane(&info, 0);
    filter
        .process_plane(
            0,
            0,
            &mut dst,
            &[&src_x, &src_y],
            &[FrameProps::new(), props_y],
        )
        .unwrap();
    assert_eq!(row_u8(&dst), vec![0, 25, 50, 75, 100, 125, 150, 175]);
}

#[test]
fn test_integer_property_converts_numerically() {
    let info = gray8(4, 1);
    let filter = ExprFilter::new(&[info], &["x x._Gain *"], None, 1).unwrap();
    let src = plane_u8(&[1, 2, 3, 4]);
    let mut props = FrameProps::new();
    props.insert("_Gain".to_string(), PropValue::Int(3));
    let mut dst = Plane::for_plane(&info, 0);
    filter
        .process_plane(0, 0, &mut dst, &[&src], &[props])
        .unwrap();
    assert_eq!(row_u8(&dst), vec![3, 6, 9, 12]);
}

#[test]
fn test_missing_property_is_nan() {
    // Float output: NaN propagates to the stored samples.
    let info = grays(4, 1);
    let filter = ExprFilter::new(&[info], &["x x._Gone *"], None, 1).unwrap();
    let src = plane_f32(&[1.0, 2.0, 3.0, 4.0]);
    let mut dst = Plane::for_plane(&info, 0);
    filter
        .process_plane(0, 0, &mut dst, &[&src], &[FrameProps::new()])
        .unwrap();
    for x in 0..4 {
        assert!(dst.get_f32(x, 0).is_nan(), "at {x}");
    }

    // Integer output: the NaN clamps to zero.
    let info8 = gray8(4, 1);
    let filter = ExprFilter::new(&[info8], &["x x._Gone *"], None, 1).unwrap();
    let src = plane_u8(&[1, 2, 3, 4]);
    let mut dst = Plane::for_plane(&info8, 0);
    filter
        .process_plane(0, 0, &mut dst, &[&src], &[FrameProps::new()])
        .unwrap();
    assert_eq!(row_u8(&dst), vec![0, 0, 0, 0]);
}

// ============================================================================
// Plane dispositions
// ============================================================================

#[test]
fn test_plane_copy() {
    let info = VideoInfo::new(VideoFormat::yuv420p8(), 16, 8);
    let filter = ExprFilter::new(&[info], &["x 2 *", ""], None, 1).unwrap();

    let mut src = Frame::new(&info);
    for x in 0..8 {
        src.planes[1].set_int(x, 0, 100 + x as u32);
    }
    let out = filter.process_frame(0, &[&src]).unwrap();
    for x in 0..8 {
        assert_eq!(out.planes[1].get_int(x, 0), 100 + x as u32);
        assert_eq!(out.planes[2].get_int(x, 0), 0);
    }
}

#[test]
fn test_expression_replication_across_planes() {
    let info = VideoInfo::new(VideoFormat::yuv420p8(), 16, 8);
    let filter = ExprFilter::new(&[info], &["x 1 +"], None, 1).unwrap();
    let src = Frame::new(&info);
    let out = filter.process_frame(0, &[&src]).unwrap();
    for plane in 0..3 {
        assert_eq!(out.planes[plane].get_int(0, 0), 1, "plane {plane}");
    }
}

// ============================================================================
// JIT vs reference evaluator
// ============================================================================

#[test]
fn test_jit_matches_interp_integer_battery() {
    let info = gray8(64, 8);
    let src = noise_plane_u8(64, 8, 0xbeef);
    for expr in [
        "x",
        "x 3 * 7 +",
        "x dup * 255 min",
        "x 128 - abs",
        "x not",
        "x 64 > x 192 < and",
        "x 100 > x 50 < xor",
        "x 2 / floor",
        "x 1.5 * round",
        "x 255 swap -",
        "X Y + x +",
        "x 16 % 16 *",
        "x 50 > x 2 * x 3 / ?",
        "x 10 max 200 min",
    ] {
        assert_jit_matches_interp(expr, &src, info, 1);
    }
}

#[test]
fn test_jit_matches_interp_force_float() {
    let info = gray8(64, 8);
    let src = noise_plane_u8(64, 8, 0xf00d);
    for expr in ["x 3 * 7 +", "x 128 - abs", "x 2 /", "x 0.5 * 16 +"] {
        assert_jit_matches_interp(expr, &src, info, 0);
    }
}
