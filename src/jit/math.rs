//! SIMD transcendental helpers emitted into the JIT module.
//!
//! Each helper is a module-local function over [`HALVES`](super::HALVES)
//! `F32X4` halves, defined once per compilation and called from the
//! expression body, so the back end can inline or share the evaluations
//! across loop iterations. The kernels are the classic Cody-Waite
//! range-reduced minimax polynomials; they track the C math library to
//! within a few ulp over finite inputs.
//!
//! Author: Moroya Sakamoto

use cranelift_codegen::ir::condcodes::FloatCC;
use cranelift_codegen::ir::{types, AbiParam, InstBuilder, MemFlags, UserFuncName, Value};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Linkage, Module};

use super::HALVES;
use crate::error::Error;

/// Function ids of the five helpers within one JIT module.
pub(super) struct HelperIds {
    pub sin: FuncId,
    pub cos: FuncId,
    pub exp: FuncId,
    pub log: FuncId,
    pub pow: FuncId,
}

pub(super) fn jit_err(e: impl std::fmt::Display) -> Error {
    Error::Jit(e.to_string())
}

// ============================================================================
// Small IR utilities shared with the lowerer
// ============================================================================

/// Splats a float constant into an F32X4.
pub(super) fn splat_f(b: &mut FunctionBuilder, v: f32) -> Value {
    let s = b.ins().f32const(v);
    b.ins().splat(types::F32X4, s)
}

/// Splats an integer constant into an I32X4.
pub(super) fn splat_i(b: &mut FunctionBuilder, v: i32) -> Value {
    let s = b.ins().iconst(types::I32, v as i64);
    b.ins().splat(types::I32X4, s)
}

/// Splats a raw bit pattern as an F32X4.
pub(super) fn splat_bits(b: &mut FunctionBuilder, bits: u32) -> Value {
    splat_f(b, f32::from_bits(bits))
}

/// Reinterprets an F32X4 as I32X4.
pub(super) fn as_int(b: &mut FunctionBuilder, v: Value) -> Value {
    b.ins().bitcast(types::I32X4, MemFlags::new(), v)
}

/// Reinterprets an I32X4 as F32X4.
pub(super) fn as_float(b: &mut FunctionBuilder, v: Value) -> Value {
    b.ins().bitcast(types::F32X4, MemFlags::new(), v)
}

/// Round-to-nearest-int of an F32X4, as I32X4.
pub(super) fn round_int(b: &mut FunctionBuilder, v: Value) -> Value {
    let n = b.ins().nearest(v);
    b.ins().fcvt_to_sint_sat(types::I32X4, n)
}

// ============================================================================
// Kernels (one F32X4 half at a time)
// ============================================================================

/// exp(x): clamp, split off `fx = round(x*log2 e)`, Cody-Waite subtract
/// of `fx*ln 2`, degree-5 polynomial, scale by `2^fx` through the
/// exponent field.
fn emit_exp(b: &mut FunctionBuilder, x_in: Value) -> Value {
    const EXP_HI: f32 = 88.3762626647949;
    const LOG2E: f32 = std::f32::consts::LOG2_E;
    const EXP_C1: f32 = 0.693359375;
    const EXP_C2: f32 = -2.12194440e-4;
    const POLY: [f32; 6] = [
        1.9875691500e-4,
        1.3981999507e-3,
        8.3334519073e-3,
        4.1665795894e-2,
        1.6666665459e-1,
        5.0000001201e-1,
    ];

    let hi = splat_f(b, EXP_HI);
    let lo = splat_f(b, -EXP_HI);
    let mut x = b.ins().fmin(x_in, hi);
    x = b.ins().fmax(x, lo);

    // fx = round(x * log2e), computed with a +0.5 bias and an overshoot
    // correction so the rounded value never exceeds the exact one.
    let log2e = splat_f(b, LOG2E);
    let half = splat_f(b, 0.5);
    let fx_raw = b.ins().fma(x, log2e, half);
    let emm0 = round_int(b, fx_raw);
    let etmp = b.ins().fcvt_from_sint(types::F32X4, emm0);
    let over = b.ins().fcmp(FloatCC::GreaterThan, etmp, fx_raw);
    let one_bits = {
        let one = splat_f(b, 1.0);
        as_int(b, one)
    };
    let corr_bits = b.ins().band(over, one_bits);
    let corr = as_float(b, corr_bits);
    let fx = b.ins().fsub(etmp, corr);

    let neg_c1 = splat_f(b, -EXP_C1);
    x = b.ins().fma(fx, neg_c1, x);
    let neg_c2 = splat_f(b, -EXP_C2);
    x = b.ins().fma(fx, neg_c2, x);

    let z = b.ins().fmul(x, x);
    let mut y = splat_f(b, POLY[0]);
    for &c in &POLY[1..] {
        let cv = splat_f(b, c);
        y = b.ins().fma(y, x, cv);
    }
    y = b.ins().fma(y, z, x);
    let one = splat_f(b, 1.0);
    y = b.ins().fadd(y, one);

    let mut pow2 = round_int(b, fx);
    let bias = splat_i(b, 0x7f);
    pow2 = b.ins().iadd(pow2, bias);
    pow2 = b.ins().ishl_imm(pow2, 23);
    let scale = as_float(b, pow2);
    b.ins().fmul(y, scale)
}

/// log(x): exponent extraction, mantissa normalization into
/// `[sqrt(1/2), sqrt(2))`, degree-8 polynomial, Cody-Waite reassembly
/// of `ln 2`. Inputs <= 0 produce the comparison-mask bit pattern.
fn emit_log(b: &mut FunctionBuilder, x_in: Value) -> Value {
    const MIN_NORM_POS: u32 = 0x0080_0000;
    const INV_MANT_MASK: u32 = !0x7f80_0000;
    const SQRT_HALF: f32 = std::f32::consts::FRAC_1_SQRT_2;
    const LOG_Q1: f32 = -2.12194440e-4;
    const LOG_Q2: f32 = 0.693359375;
    const POLY: [f32; 9] = [
        7.0376836292e-2,
        -1.1514610310e-1,
        1.1676998740e-1,
        -1.2420140846e-1,
        1.4249322787e-1,
        -1.6668057665e-1,
        2.0000714765e-1,
        -2.4999993993e-1,
        3.3333331174e-1,
    ];

    let zero = splat_f(b, 0.0);
    let invalid = b.ins().fcmp(FloatCC::LessThanOrEqual, x_in, zero);

    let min_norm = splat_bits(b, MIN_NORM_POS);
    let x = b.ins().fmax(x_in, min_norm);
    let xi = as_int(b, x);
    let mut exp_i = b.ins().ushr_imm(xi, 23);

    let mant_mask = splat_i(b, INV_MANT_MASK as i32);
    let mut mant = b.ins().band(xi, mant_mask);
    let half = splat_f(b, 0.5);
    let half_bits = as_int(b, half);
    mant = b.ins().bor(mant, half_bits);
    let mut x = as_float(b, mant);

    let bias = splat_i(b, 0x7f);
    exp_i = b.ins().isub(exp_i, bias);
    let mut e = b.ins().fcvt_from_sint(types::F32X4, exp_i);
    let one = splat_f(b, 1.0);
    e = b.ins().fadd(e, one);

    // Where the mantissa is below sqrt(1/2), double it and drop the
    // exponent by one.
    let sqrt_half = splat_f(b, SQRT_HALF);
    let below = b.ins().fcmp(FloatCC::LessThan, x, sqrt_half);
    let x_bits = as_int(b, x);
    let extra_bits = b.ins().band(below, x_bits);
    let extra = as_float(b, extra_bits);
    x = b.ins().fsub(x, one);
    let one_bits = as_int(b, one);
    let drop_bits = b.ins().band(below, one_bits);
    let drop = as_float(b, drop_bits);
    e = b.ins().fsub(e, drop);
    x = b.ins().fadd(x, extra);

    let z = b.ins().fmul(x, x);
    let mut y = splat_f(b, POLY[0]);
    for &c in &POLY[1..] {
        let cv = splat_f(b, c);
        y = b.ins().fma(y, x, cv);
    }
    y = b.ins().fmul(y, x);
    y = b.ins().fmul(y, z);
    let q1 = splat_f(b, LOG_Q1);
    y = b.ins().fma(e, q1, y);
    let neg_half = splat_f(b, -0.5);
    y = b.ins().fma(z, neg_half, y);
    x = b.ins().fadd(x, y);
    let q2 = splat_f(b, LOG_Q2);
    x = b.ins().fma(e, q2, x);

    let x_bits = as_int(b, x);
    let poisoned = b.ins().bor(invalid, x_bits);
    as_float(b, poisoned)
}

/// sin/cos share one kernel: sign extraction (sine only), range
/// reduction by multiples of pi with four-part Cody-Waite constants,
/// parity of the quotient folded into the sign, then an odd (sine) or
/// even (cosine) minimax polynomial over `[-pi/2, pi/2]`.
fn emit_sincos(b: &mut FunctionBuilder, x_in: Value, is_sin: bool) -> Value {
    const INV_PI: u32 = 0x3ea2_f983;
    const PI_PARTS: [u32; 4] = [0x4049_0000, 0x3a7d_a000, 0x3422_2000, 0x2cb4_611a];
    const SIN_C3: u32 = 0xbe2a_aaa6;
    const SIN_C5: u32 = 0x3c08_876a;
    const SIN_C7: u32 = 0xb94f_b7ff;
    const SIN_C9: u32 = 0x362e_def8;
    const COS_C2: u32 = 0xbeff_ffe2;
    const COS_C4: u32 = 0x3d2a_a73c;
    const COS_C6: u32 = 0xbab5_8d50;
    const COS_C8: u32 = 0x37c1_ad76;

    let abs_mask = splat_i(b, 0x7fff_ffff);
    let mut sign = if is_sin {
        let xi = as_int(b, x_in);
        b.ins().band_not(xi, abs_mask)
    } else {
        splat_i(b, 0)
    };

    let mut t1 = b.ins().fabs(x_in);

    // k = round(|x| / pi); the parity of k flips the sign.
    let inv_pi = splat_bits(b, INV_PI);
    let t2_raw = b.ins().fmul(t1, inv_pi);
    let k = round_int(b, t2_raw);
    let parity = b.ins().ishl_imm(k, 31);
    sign = b.ins().bxor(sign, parity);
    let t2 = b.ins().fcvt_from_sint(types::F32X4, k);

    for &part in &PI_PARTS {
        let neg_part = splat_f(b, -f32::from_bits(part));
        t1 = b.ins().fma(t2, neg_part, t1);
    }

    let result = if is_sin {
        // x + x * x^2 * (C3 + x^2 * (C5 + x^2 * (C7 + x^2 * C9)))
        let z = b.ins().fmul(t1, t1);
        let c9 = splat_bits(b, SIN_C9);
        let c7 = splat_bits(b, SIN_C7);
        let mut t3 = b.ins().fma(z, c9, c7);
        let c5 = splat_bits(b, SIN_C5);
        t3 = b.ins().fma(t3, z, c5);
        let c3 = splat_bits(b, SIN_C3);
        t3 = b.ins().fma(t3, z, c3);
        t3 = b.ins().fmul(t3, z);
        t3 = b.ins().fmul(t3, t1);
        b.ins().fadd(t1, t3)
    } else {
        // 1 + x^2 * (C2 + x^2 * (C4 + x^2 * (C6 + x^2 * C8)))
        let z = b.ins().fmul(t1, t1);
        let c8 = splat_bits(b, COS_C8);
        let c6 = splat_bits(b, COS_C6);
        let mut t2 = b.ins().fma(z, c8, c6);
        let c4 = splat_bits(b, COS_C4);
        t2 = b.ins().fma(t2, z, c4);
        let c2 = splat_bits(b, COS_C2);
        t2 = b.ins().fma(t2, z, c2);
        let one = splat_f(b, 1.0);
        b.ins().fma(t2, z, one)
    };

    let bits = as_int(b, result);
    let signed = b.ins().bxor(sign, bits);
    as_float(b, signed)
}

// ============================================================================
// Module-function definitions
// ============================================================================

fn unary_signature(module: &JITModule) -> cranelift_codegen::ir::Signature {
    let mut sig = module.make_signature();
    for _ in 0..HALVES {
        sig.params.push(AbiParam::new(types::F32X4));
    }
    for _ in 0..HALVES {
        sig.returns.push(AbiParam::new(types::F32X4));
    }
    sig
}

fn define_unary(
    module: &mut JITModule,
    ctx: &mut Context,
    fbc: &mut FunctionBuilderContext,
    name: &str,
    kernel: impl Fn(&mut FunctionBuilder, Value) -> Value,
) -> Result<FuncId, Error> {
    let sig = unary_signature(module);
    let id = module
        .declare_function(name, Linkage::Local, &sig)
        .map_err(jit_err)?;

    ctx.func.signature = sig;
    ctx.func.name = UserFuncName::user(0, id.as_u32());
    {
        let mut b = FunctionBuilder::new(&mut ctx.func, fbc);
        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        b.seal_block(entry);

        let args: Vec<Value> = b.block_params(entry).to_vec();
        let rets: Vec<Value> = args.iter().map(|&x| kernel(&mut b, x)).collect();
        b.ins().return_(&rets);
        b.finalize();
    }
    module.define_function(id, ctx).map_err(jit_err)?;
    module.clear_context(ctx);
    Ok(id)
}

/// pow(x, y) = exp(log(x) * y), composed from the other two helpers.
fn define_pow(
    module: &mut JITModule,
    ctx: &mut Context,
    fbc: &mut FunctionBuilderContext,
    exp_id: FuncId,
    log_id: FuncId,
) -> Result<FuncId, Error> {
    let mut sig = module.make_signature();
    for _ in 0..HALVES * 2 {
        sig.params.push(AbiParam::new(types::F32X4));
    }
    for _ in 0..HALVES {
        sig.returns.push(AbiParam::new(types::F32X4));
    }
    let id = module
        .declare_function("vpow", Linkage::Local, &sig)
        .map_err(jit_err)?;

    ctx.func.signature = sig;
    ctx.func.name = UserFuncName::user(0, id.as_u32());
    {
        let exp_ref = module.declare_func_in_func(exp_id, &mut ctx.func);
        let log_ref = module.declare_func_in_func(log_id, &mut ctx.func);

        let mut b = FunctionBuilder::new(&mut ctx.func, fbc);
        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        b.seal_block(entry);

        let params = b.block_params(entry).to_vec();
        let (base, expo) = params.split_at(HALVES);

        let call = b.ins().call(log_ref, base);
        let logs: Vec<Value> = b.inst_results(call).to_vec();
        let scaled: Vec<Value> = logs
            .iter()
            .zip(expo)
            .map(|(&l, &y)| b.ins().fmul(l, y))
            .collect();
        let call = b.ins().call(exp_ref, &scaled);
        let rets: Vec<Value> = b.inst_results(call).to_vec();
        b.ins().return_(&rets);
        b.finalize();
    }
    module.define_function(id, ctx).map_err(jit_err)?;
    module.clear_context(ctx);
    Ok(id)
}

/// Defines all five helpers into the module.
pub(super) fn define_helpers(
    module: &mut JITModule,
    ctx: &mut Context,
    fbc: &mut FunctionBuilderContext,
) -> Result<HelperIds, Error> {
    let sin = define_unary(module, ctx, fbc, "vsin", |b, x| emit_sincos(b, x, true))?;
    let cos = define_unary(module, ctx, fbc, "vcos", |b, x| emit_sincos(b, x, false))?;
    let exp = define_unary(module, ctx, fbc, "vexp", emit_exp)?;
    let log = define_unary(module, ctx, fbc, "vlog", emit_log)?;
    let pow = define_pow(module, ctx, fbc, exp, log)?;
    Ok(HelperIds {
        sin,
        cos,
        exp,
        log,
        pow,
    })
}
