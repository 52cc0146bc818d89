//! Benchmarks for expression compilation and per-frame throughput
//!
//! Author: Moroya Sakamoto

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vexpr::prelude::*;

fn hd_source(info: &VideoInfo) -> Frame {
    let mut frame = Frame::new(info);
    let mut state = 0x1234_5678u32;
    let plane = &mut frame.planes[0];
    for y in 0..info.height {
        for x in 0..info.width {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            plane.set_int(x, y, state & 0xff);
        }
    }
    frame
}

fn bench_compile(c: &mut Criterion) {
    let info = VideoInfo::new(VideoFormat::gray8(), 1920, 1080);
    let mut group = c.benchmark_group("compile");

    for (name, expr) in [
        ("simple", "x 2 *"),
        ("levels", "x 16 - 219 / 255 * 0 max 255 min"),
        ("transcendental", "x 255 / log 0.9 * exp 255 *"),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| ExprFilter::new(black_box(&[info]), black_box(&[expr]), None, 1).unwrap())
        });
    }
    group.finish();
}

fn bench_invoke(c: &mut Criterion) {
    let info = VideoInfo::new(VideoFormat::gray8(), 1920, 1080);
    let src = hd_source(&info);
    let pixels = (info.width * info.height) as u64;

    let mut group = c.benchmark_group("invoke_1080p");
    group.throughput(Throughput::Elements(pixels));

    for (name, expr) in [
        ("copy", "x"),
        ("gain_offset", "x 2 * 16 +"),
        ("thresholded_blend", "x 128 > x 2 * x 2 / ?"),
        ("gamma", "x 255 / log 0.9 * exp 255 *"),
    ] {
        let filter = ExprFilter::new(&[info], &[expr], None, 1).unwrap();
        group.bench_function(name, |b| {
            b.iter(|| filter.process_frame(black_box(0), &[&src]).unwrap())
        });
    }
    group.finish();
}

fn bench_jit_vs_interp(c: &mut Criterion) {
    let info = VideoInfo::new(VideoFormat::gray8(), 640, 360);
    let src = hd_source(&info);
    let expr = "x 2 * 16 + 255 min";

    let mut group = c.benchmark_group("jit_vs_interp");
    group.throughput(Throughput::Elements((info.width * info.height) as u64));

    let filter = ExprFilter::new(&[info], &[expr], None, 1).unwrap();
    group.bench_with_input(BenchmarkId::new("jit", "360p"), &src, |b, src| {
        b.iter(|| filter.process_frame(0, &[src]).unwrap())
    });

    let reference = RefExpr::new(expr, &info, &[info], 1).unwrap();
    group.bench_with_input(BenchmarkId::new("interp", "360p"), &src, |b, src| {
        let mut dst = Plane::for_plane(&info, 0);
        b.iter(|| {
            reference
                .process_plane(0, &mut dst, &[&src.planes[0]], &[FrameProps::new()])
                .unwrap()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_compile, bench_invoke, bench_jit_vs_interp);
criterion_main!(benches);
