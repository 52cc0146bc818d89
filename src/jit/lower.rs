//! Lowering of the op stream to Cranelift IR.
//!
//! The lowerer walks the decoded ops once per inlined body copy,
//! maintaining a compile-time stack of typed SIMD values. Integer and
//! float lanes are tracked per stack slot; conversions are inserted
//! only where the operator semantics require them, so pure-integer
//! expressions stay integer end to end when the caller asks for it.
//!
//! Author: Moroya Sakamoto

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{
    types, Endianness, FuncRef, InstBuilder, MemFlags, Type, Value as ClifValue,
};
use cranelift_frontend::FunctionBuilder;

use super::math::{as_float, as_int, splat_f, splat_i};
use super::HALVES;
use crate::error::Error;
use crate::tokens::{arity, loadconst, CmpCode, Op, OpKind};
use crate::video::{SampleType, VideoInfo};

/// The two 128-bit halves of one 8-lane value.
pub(super) type Halves = [ClifValue; HALVES];

/// Typed value on the compile-time stack: integer or float lanes, plus
/// a flag marking literal immediates (a constant-folding hint; carried
/// but not consumed by this back end).
#[derive(Clone, Copy)]
pub(super) struct StackValue {
    repr: Repr,
    #[allow(dead_code)]
    constant: bool,
}

#[derive(Clone, Copy)]
enum Repr {
    Int(Halves),
    Float(Halves),
}

impl StackValue {
    fn int(h: Halves) -> Self {
        StackValue {
            repr: Repr::Int(h),
            constant: false,
        }
    }

    fn float(h: Halves) -> Self {
        StackValue {
            repr: Repr::Float(h),
            constant: false,
        }
    }

    fn is_float(&self) -> bool {
        matches!(self.repr, Repr::Float(_))
    }
}

/// References to the transcendental helpers, declared in the routine.
pub(super) struct FuncRefs {
    pub sin: FuncRef,
    pub cos: FuncRef,
    pub exp: FuncRef,
    pub log: FuncRef,
    pub pow: FuncRef,
}

/// Loop-invariant and per-iteration state of the routine body.
pub(super) struct IterState {
    /// Pointer type of the target (I64 on the supported hosts).
    pub ptr_type: Type,
    /// Plane base pointers: output first, then each input.
    pub ptrs: Vec<ClifValue>,
    /// Row strides in bytes, parallel to `ptrs`.
    pub strides: Vec<ClifValue>,
    /// Constants buffer pointer.
    pub consts: ClifValue,
    /// Per-lane column offsets `(0, 1, .., 3)` and `(4, .., 7)`.
    pub xramp: Halves,
    /// Current column (scalar i32, already offset for the unroll copy).
    pub x: ClifValue,
    /// Current row (scalar i32).
    pub y: ClifValue,
}

/// Memory flags for pixel rows: the host guarantees 32-byte row
/// alignment and in-bounds padded rows, so accesses are aligned and
/// non-trapping.
fn trusted() -> MemFlags {
    let mut f = MemFlags::new();
    f.set_aligned();
    f.set_notrap();
    f
}

fn pop(stack: &mut Vec<StackValue>, tok: &str) -> Result<StackValue, Error> {
    stack.pop().ok_or_else(|| Error::StackUnderflow(tok.to_string()))
}

/// Lowers expression bodies into a routine under construction.
pub(super) struct Lowerer<'a, 'b> {
    pub b: &'a mut FunctionBuilder<'b>,
    pub refs: &'a FuncRefs,
    pub out: &'a VideoInfo,
    pub inputs: &'a [VideoInfo],
    pub force_float: bool,
}

impl Lowerer<'_, '_> {
    // ------------------------------------------------------------------
    // Half-pair utilities
    // ------------------------------------------------------------------

    fn unary2(
        &mut self,
        v: Halves,
        mut f: impl FnMut(&mut FunctionBuilder, ClifValue) -> ClifValue,
    ) -> Halves {
        std::array::from_fn(|i| f(self.b, v[i]))
    }

    fn zip2(
        &mut self,
        l: Halves,
        r: Halves,
        mut f: impl FnMut(&mut FunctionBuilder, ClifValue, ClifValue) -> ClifValue,
    ) -> Halves {
        std::array::from_fn(|i| f(self.b, l[i], r[i]))
    }

    fn splat_f2(&mut self, v: f32) -> Halves {
        let s = splat_f(self.b, v);
        [s; HALVES]
    }

    fn splat_i2(&mut self, v: i32) -> Halves {
        let s = splat_i(self.b, v);
        [s; HALVES]
    }

    /// Float lanes of a value, converting integer lanes if needed.
    fn to_float(&mut self, v: StackValue) -> Halves {
        match v.repr {
            Repr::Float(h) => h,
            Repr::Int(h) => self.unary2(h, |b, x| b.ins().fcvt_from_sint(types::F32X4, x)),
        }
    }

    fn call_unary(&mut self, fref: FuncRef, v: Halves) -> Halves {
        let inst = self.b.ins().call(fref, &v);
        let res = self.b.inst_results(inst);
        [res[0], res[1]]
    }

    /// Per-lane truth of a value: `lane > 0`, as an all-ones mask.
    fn truth(&mut self, v: StackValue) -> Halves {
        match v.repr {
            Repr::Float(h) => {
                let zero = self.splat_f2(0.0);
                self.zip2(h, zero, |b, l, r| b.ins().fcmp(FloatCC::GreaterThan, l, r))
            }
            Repr::Int(h) => {
                let zero = self.splat_i2(0);
                self.zip2(h, zero, |b, l, r| {
                    b.ins().icmp(IntCC::SignedGreaterThan, l, r)
                })
            }
        }
    }

    /// Mask lanes reduced to 0/1.
    fn mask_to_bool(&mut self, mask: Halves) -> StackValue {
        let one = self.splat_i2(1);
        StackValue::int(self.zip2(mask, one, |b, l, r| b.ins().band(l, r)))
    }

    // ------------------------------------------------------------------
    // Addressing
    // ------------------------------------------------------------------

    /// Byte address of the current pixel in plane `idx` (0 = output).
    fn pixel_addr(&mut self, st: &IterState, idx: usize, bytes_per_sample: usize) -> ClifValue {
        let row = self.b.ins().imul(st.y, st.strides[idx]);
        let row_off = self.b.ins().sextend(st.ptr_type, row);
        let p = self.b.ins().iadd(st.ptrs[idx], row_off);
        let col = self.b.ins().imul_imm(st.x, bytes_per_sample as i64);
        let col_off = self.b.ins().sextend(st.ptr_type, col);
        self.b.ins().iadd(p, col_off)
    }

    // ------------------------------------------------------------------
    // Operator lowering
    // ------------------------------------------------------------------

    fn mem_load(&mut self, st: &IterState, clip: usize) -> Result<StackValue, Error> {
        let format = self.inputs[clip].format;
        let addr = self.pixel_addr(st, clip + 1, format.bytes_per_sample);
        let flags = trusted();
        match format.sample_type {
            SampleType::Integer => {
                let wide = match format.bytes_per_sample {
                    // The widening byte load touches 8 bytes, below the
                    // vector type's natural alignment; leave it unmarked.
                    1 => {
                        let mut byte_flags = MemFlags::new();
                        byte_flags.set_notrap();
                        self.b.ins().uload8x8(byte_flags, addr, 0)
                    }
                    2 => self.b.ins().load(types::I16X8, flags, addr, 0),
                    _ => return Err(Error::UnsupportedSampleFormat),
                };
                let lo = self.b.ins().uwiden_low(wide);
                let hi = self.b.ins().uwiden_high(wide);
                let v = StackValue::int([lo, hi]);
                if self.force_float {
                    let f = self.to_float(v);
                    Ok(StackValue::float(f))
                } else {
                    Ok(v)
                }
            }
            SampleType::Float => match format.bytes_per_sample {
                4 => {
                    let lo = self.b.ins().load(types::F32X4, flags, addr, 0);
                    let hi = self.b.ins().load(types::F32X4, flags, addr, 16);
                    Ok(StackValue::float([lo, hi]))
                }
                2 => Err(Error::HalfFloatUnsupported),
                _ => Err(Error::UnsupportedSampleFormat),
            },
        }
    }

    fn load_const(&mut self, st: &IterState, imm: i32) -> StackValue {
        let flags = trusted();
        match imm {
            loadconst::N => {
                let n = self.b.ins().load(types::I32, flags, st.consts, 0);
                let v = self.b.ins().splat(types::I32X4, n);
                StackValue::int([v; HALVES])
            }
            loadconst::X => {
                let xs = self.b.ins().splat(types::I32X4, st.x);
                let ramp = st.xramp;
                StackValue::int(self.unary2(ramp, |b, r| b.ins().iadd(xs, r)))
            }
            loadconst::Y => {
                let ys = self.b.ins().splat(types::I32X4, st.y);
                StackValue::int([ys; HALVES])
            }
            slot => {
                let off =
                    (slot - loadconst::FIRST_PROP + loadconst::PROP_BUFFER_BASE) * 4;
                let p = self.b.ins().load(types::F32, flags, st.consts, off);
                let v = self.b.ins().splat(types::F32X4, p);
                StackValue::float([v; HALVES])
            }
        }
    }

    /// Arithmetic binary op with the standard promotion rule: float if
    /// either side is float, else integer unless `force` asks for float.
    fn binary(
        &mut self,
        l: StackValue,
        r: StackValue,
        force: bool,
        int_op: impl FnMut(&mut FunctionBuilder, ClifValue, ClifValue) -> ClifValue,
        float_op: impl FnMut(&mut FunctionBuilder, ClifValue, ClifValue) -> ClifValue,
    ) -> StackValue {
        if l.is_float() || r.is_float() || force {
            let lf = self.to_float(l);
            let rf = self.to_float(r);
            StackValue::float(self.zip2(lf, rf, float_op))
        } else {
            let (Repr::Int(li), Repr::Int(ri)) = (l.repr, r.repr) else {
                unreachable!()
            };
            StackValue::int(self.zip2(li, ri, int_op))
        }
    }

    /// `l % r` over floats: `l - r * trunc(l / r)`.
    fn float_mod(&mut self, l: Halves, r: Halves) -> Halves {
        self.zip2(l, r, |b, l, r| {
            let q = b.ins().fdiv(l, r);
            let qt = b.ins().trunc(q);
            let whole = b.ins().fmul(qt, r);
            b.ins().fsub(l, whole)
        })
    }

    fn compare(&mut self, code: CmpCode, l: StackValue, r: StackValue) -> StackValue {
        let mask = if l.is_float() || r.is_float() {
            let cc = match code {
                CmpCode::Eq => FloatCC::Equal,
                CmpCode::Lt => FloatCC::LessThan,
                CmpCode::Le => FloatCC::LessThanOrEqual,
                CmpCode::Neq => FloatCC::NotEqual,
                CmpCode::Nlt => FloatCC::GreaterThanOrEqual,
                CmpCode::Nle => FloatCC::GreaterThan,
            };
            let lf = self.to_float(l);
            let rf = self.to_float(r);
            self.zip2(lf, rf, |b, l, r| b.ins().fcmp(cc, l, r))
        } else {
            let cc = match code {
                CmpCode::Eq => IntCC::Equal,
                CmpCode::Lt => IntCC::SignedLessThan,
                CmpCode::Le => IntCC::SignedLessThanOrEqual,
                CmpCode::Neq => IntCC::NotEqual,
                CmpCode::Nlt => IntCC::SignedGreaterThanOrEqual,
                CmpCode::Nle => IntCC::SignedGreaterThan,
            };
            let (Repr::Int(li), Repr::Int(ri)) = (l.repr, r.repr) else {
                unreachable!()
            };
            self.zip2(li, ri, |b, l, r| b.ins().icmp(cc, l, r))
        };
        self.mask_to_bool(mask)
    }

    fn ternary(&mut self, c: StackValue, t: StackValue, f: StackValue) -> StackValue {
        let ci = self.truth(c);
        if t.is_float() || f.is_float() {
            let tf = self.to_float(t);
            let ff = self.to_float(f);
            let ti = self.unary2(tf, as_int);
            let fi = self.unary2(ff, as_int);
            let sel: Halves =
                std::array::from_fn(|i| self.b.ins().bitselect(ci[i], ti[i], fi[i]));
            StackValue::float(self.unary2(sel, as_float))
        } else {
            let (Repr::Int(ti), Repr::Int(fi)) = (t.repr, f.repr) else {
                unreachable!()
            };
            StackValue::int(std::array::from_fn(|i| {
                self.b.ins().bitselect(ci[i], ti[i], fi[i])
            }))
        }
    }

    // ------------------------------------------------------------------
    // Body emission
    // ------------------------------------------------------------------

    /// Emits one evaluation of the expression at the current (x, y),
    /// ending with the store to the output pixel.
    pub(super) fn lower_iteration(
        &mut self,
        tokens: &[String],
        ops: &[Op],
        st: &IterState,
    ) -> Result<(), Error> {
        let mut stack: Vec<StackValue> = Vec::with_capacity(ops.len());

        for (op, tok) in ops.iter().zip(tokens) {
            if op.kind == OpKind::MemLoad && op.imm.as_i32() as usize >= self.inputs.len() {
                return Err(Error::UndefinedClip(tok.clone()));
            }
            if matches!(op.kind, OpKind::Dup | OpKind::Swap)
                && op.imm.as_u32() as usize >= stack.len()
            {
                return Err(Error::StackUnderflow(tok.clone()));
            }
            if stack.len() < arity(op.kind) {
                return Err(Error::StackUnderflow(tok.clone()));
            }

            match op.kind {
                OpKind::Dup => {
                    let v = stack[stack.len() - 1 - op.imm.as_u32() as usize];
                    stack.push(v);
                }
                OpKind::Swap => {
                    let len = stack.len();
                    stack.swap(len - 1, len - 1 - op.imm.as_u32() as usize);
                }
                OpKind::MemLoad => {
                    let v = self.mem_load(st, op.imm.as_i32() as usize)?;
                    stack.push(v);
                }
                OpKind::Constant => {
                    let f = op.imm.as_f32();
                    let truncated = f as i32;
                    let v = if truncated as f32 == f {
                        StackValue {
                            repr: Repr::Int(self.splat_i2(truncated)),
                            constant: true,
                        }
                    } else {
                        StackValue {
                            repr: Repr::Float(self.splat_f2(f)),
                            constant: true,
                        }
                    };
                    stack.push(v);
                }
                OpKind::LoadConst => {
                    let v = self.load_const(st, op.imm.as_i32());
                    stack.push(v);
                }
                OpKind::Add | OpKind::Sub | OpKind::Mul => {
                    let r = pop(&mut stack, tok)?;
                    let l = pop(&mut stack, tok)?;
                    let v = match op.kind {
                        OpKind::Add => self.binary(
                            l,
                            r,
                            false,
                            |b, x, y| b.ins().iadd(x, y),
                            |b, x, y| b.ins().fadd(x, y),
                        ),
                        OpKind::Sub => self.binary(
                            l,
                            r,
                            false,
                            |b, x, y| b.ins().isub(x, y),
                            |b, x, y| b.ins().fsub(x, y),
                        ),
                        _ => self.binary(
                            l,
                            r,
                            false,
                            |b, x, y| b.ins().imul(x, y),
                            |b, x, y| b.ins().fmul(x, y),
                        ),
                    };
                    stack.push(v);
                }
                OpKind::Max | OpKind::Min => {
                    let r = pop(&mut stack, tok)?;
                    let l = pop(&mut stack, tok)?;
                    let force = self.force_float;
                    let v = if op.kind == OpKind::Max {
                        self.binary(
                            l,
                            r,
                            force,
                            |b, x, y| b.ins().smax(x, y),
                            |b, x, y| b.ins().fmax(x, y),
                        )
                    } else {
                        self.binary(
                            l,
                            r,
                            force,
                            |b, x, y| b.ins().smin(x, y),
                            |b, x, y| b.ins().fmin(x, y),
                        )
                    };
                    stack.push(v);
                }
                OpKind::Div => {
                    let r = pop(&mut stack, tok)?;
                    let l = pop(&mut stack, tok)?;
                    let lf = self.to_float(l);
                    let rf = self.to_float(r);
                    let v = self.zip2(lf, rf, |b, x, y| b.ins().fdiv(x, y));
                    stack.push(StackValue::float(v));
                }
                OpKind::Mod => {
                    let r = pop(&mut stack, tok)?;
                    let l = pop(&mut stack, tok)?;
                    let lf = self.to_float(l);
                    let rf = self.to_float(r);
                    let v = self.float_mod(lf, rf);
                    stack.push(StackValue::float(v));
                }
                OpKind::Sqrt => {
                    let x = pop(&mut stack, tok)?;
                    let xf = self.to_float(x);
                    let zero = self.splat_f2(0.0);
                    let nn = self.zip2(xf, zero, |b, x, z| b.ins().fmax(x, z));
                    let v = self.unary2(nn, |b, x| b.ins().sqrt(x));
                    stack.push(StackValue::float(v));
                }
                OpKind::Abs => {
                    let x = pop(&mut stack, tok)?;
                    let v = match x.repr {
                        Repr::Float(h) => {
                            StackValue::float(self.unary2(h, |b, x| b.ins().fabs(x)))
                        }
                        Repr::Int(h) => {
                            if self.force_float {
                                let f = self.to_float(StackValue::int(h));
                                StackValue::float(self.unary2(f, |b, x| b.ins().fabs(x)))
                            } else {
                                StackValue::int(self.unary2(h, |b, x| b.ins().iabs(x)))
                            }
                        }
                    };
                    stack.push(v);
                }
                OpKind::Cmp => {
                    let r = pop(&mut stack, tok)?;
                    let l = pop(&mut stack, tok)?;
                    let v = self.compare(CmpCode::from_imm(op.imm.as_u32()), l, r);
                    stack.push(v);
                }
                OpKind::And | OpKind::Or | OpKind::Xor => {
                    let r = pop(&mut stack, tok)?;
                    let l = pop(&mut stack, tok)?;
                    let lt = self.truth(l);
                    let rt = self.truth(r);
                    let mask = match op.kind {
                        OpKind::And => self.zip2(lt, rt, |b, x, y| b.ins().band(x, y)),
                        OpKind::Or => self.zip2(lt, rt, |b, x, y| b.ins().bor(x, y)),
                        _ => self.zip2(lt, rt, |b, x, y| b.ins().bxor(x, y)),
                    };
                    let v = self.mask_to_bool(mask);
                    stack.push(v);
                }
                OpKind::Not => {
                    let x = pop(&mut stack, tok)?;
                    let mask = match x.repr {
                        Repr::Float(h) => {
                            let zero = self.splat_f2(0.0);
                            self.zip2(h, zero, |b, l, r| {
                                b.ins().fcmp(FloatCC::LessThanOrEqual, l, r)
                            })
                        }
                        Repr::Int(h) => {
                            let zero = self.splat_i2(0);
                            self.zip2(h, zero, |b, l, r| {
                                b.ins().icmp(IntCC::SignedLessThanOrEqual, l, r)
                            })
                        }
                    };
                    let v = self.mask_to_bool(mask);
                    stack.push(v);
                }
                OpKind::Trunc | OpKind::Round | OpKind::Floor => {
                    let x = pop(&mut stack, tok)?;
                    let xf = self.to_float(x);
                    let v = match op.kind {
                        OpKind::Trunc => self.unary2(xf, |b, x| b.ins().trunc(x)),
                        OpKind::Round => self.unary2(xf, |b, x| b.ins().nearest(x)),
                        _ => self.unary2(xf, |b, x| b.ins().floor(x)),
                    };
                    stack.push(StackValue::float(v));
                }
                OpKind::Exp | OpKind::Log | OpKind::Sin | OpKind::Cos => {
                    let x = pop(&mut stack, tok)?;
                    let xf = self.to_float(x);
                    let fref = match op.kind {
                        OpKind::Exp => self.refs.exp,
                        OpKind::Log => self.refs.log,
                        OpKind::Sin => self.refs.sin,
                        _ => self.refs.cos,
                    };
                    let v = self.call_unary(fref, xf);
                    stack.push(StackValue::float(v));
                }
                OpKind::Pow => {
                    let r = pop(&mut stack, tok)?;
                    let l = pop(&mut stack, tok)?;
                    let lf = self.to_float(l);
                    let rf = self.to_float(r);
                    let inst = self
                        .b
                        .ins()
                        .call(self.refs.pow, &[lf[0], lf[1], rf[0], rf[1]]);
                    let res = self.b.inst_results(inst);
                    let v = [res[0], res[1]];
                    stack.push(StackValue::float(v));
                }
                OpKind::Ternary => {
                    let f = pop(&mut stack, tok)?;
                    let t = pop(&mut stack, tok)?;
                    let c = pop(&mut stack, tok)?;
                    let v = self.ternary(c, t, f);
                    stack.push(v);
                }
            }
        }

        if stack.len() > 1 {
            return Err(Error::UnconsumedValues(tokens.join(" ")));
        }
        let Some(result) = stack.pop() else {
            return Err(Error::EmptyExpression(tokens.join(" ")));
        };
        self.store_result(st, result)
    }

    /// Clamps and stores the residual value at the output pixel.
    fn store_result(&mut self, st: &IterState, v: StackValue) -> Result<(), Error> {
        let format = self.out.format;
        let addr = self.pixel_addr(st, 0, format.bytes_per_sample);
        let flags = trusted();
        match format.sample_type {
            SampleType::Integer => {
                let maxval = (1u32 << format.bits_per_sample) - 1;
                let rounded: Halves = match v.repr {
                    Repr::Float(h) => {
                        let lo = self.splat_f2(0.0);
                        let hi = self.splat_f2(maxval as f32);
                        let clamped = self.zip2(h, lo, |b, x, z| b.ins().fmax(x, z));
                        let clamped = self.zip2(clamped, hi, |b, x, m| b.ins().fmin(x, m));
                        self.unary2(clamped, |b, x| {
                            let n = b.ins().nearest(x);
                            b.ins().fcvt_to_sint_sat(types::I32X4, n)
                        })
                    }
                    Repr::Int(h) => {
                        let lo = self.splat_i2(0);
                        let hi = self.splat_i2(maxval as i32);
                        let clamped = self.zip2(h, lo, |b, x, z| b.ins().smax(x, z));
                        self.zip2(clamped, hi, |b, x, m| b.ins().smin(x, m))
                    }
                };
                match format.bytes_per_sample {
                    1 => {
                        let n16 = self.b.ins().snarrow(rounded[0], rounded[1]);
                        let n8 = self.b.ins().unarrow(n16, n16);
                        // Lane-count-changing bitcast: byte order must be
                        // pinned explicitly.
                        let le = MemFlags::new().with_endianness(Endianness::Little);
                        let as64 = self.b.ins().bitcast(types::I64X2, le, n8);
                        let low = self.b.ins().extractlane(as64, 0);
                        self.b.ins().store(flags, low, addr, 0);
                    }
                    2 => {
                        let n16 = self.b.ins().unarrow(rounded[0], rounded[1]);
                        self.b.ins().store(flags, n16, addr, 0);
                    }
                    _ => return Err(Error::UnsupportedSampleFormat),
                }
            }
            SampleType::Float => {
                if format.bytes_per_sample == 2 {
                    return Err(Error::HalfFloatUnsupported);
                }
                let h = self.to_float(v);
                self.b.ins().store(flags, h[0], addr, 0);
                self.b.ins().store(flags, h[1], addr, 16);
            }
        }
        Ok(())
    }
}
