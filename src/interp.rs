//! Scalar reference evaluator.
//!
//! Evaluates the decoded op stream one pixel at a time with the same
//! promotion, clamp and store rules as the compiled routine: integer
//! lanes are wrapping i32, floats are f32, rounding is ties-to-even.
//! The test suite cross-checks whole planes produced by the JIT against
//! this evaluator; it also serves as a debugging aid when a generated
//! routine misbehaves.
//!
//! Author: Moroya Sakamoto

use crate::error::Error;
use crate::jit::OPT_USE_INTEGER;
use crate::props::{build_consts, resolve_prop_access, FrameProps, PropAccess};
use crate::tokens::{check_stack_effects, decode_expr, loadconst, CmpCode, Op, OpKind};
use crate::video::{validate_inputs, Plane, SampleType, VideoInfo};

/// One scalar stack slot.
#[derive(Clone, Copy)]
enum SVal {
    I(i32),
    F(f32),
}

impl SVal {
    fn is_float(self) -> bool {
        matches!(self, SVal::F(_))
    }

    fn f(self) -> f32 {
        match self {
            SVal::I(i) => i as f32,
            SVal::F(f) => f,
        }
    }

    fn truth(self) -> bool {
        match self {
            SVal::I(i) => i > 0,
            SVal::F(f) => f > 0.0,
        }
    }
}

fn pop(stack: &mut Vec<SVal>) -> SVal {
    stack.pop().unwrap_or(SVal::I(0))
}

/// log with the compiled routine's domain behavior: non-positive
/// inputs produce an all-ones (NaN) bit pattern.
fn ref_log(x: f32) -> f32 {
    if x <= 0.0 {
        f32::from_bits(0xffff_ffff)
    } else {
        x.ln()
    }
}

/// An expression bound to a fixed geometry, evaluated in software.
pub struct RefExpr {
    ops: Vec<Op>,
    prop_access: Vec<PropAccess>,
    out: VideoInfo,
    inputs: Vec<VideoInfo>,
    force_float: bool,
}

impl RefExpr {
    /// Decodes and validates `expr` for the given geometry, mirroring
    /// the checks the compiler performs.
    pub fn new(
        expr: &str,
        out: &VideoInfo,
        inputs: &[VideoInfo],
        opt: u32,
    ) -> Result<Self, Error> {
        validate_inputs(inputs)?;
        out.format.validate()?;
        let (tokens, mut ops) = decode_expr(expr)?;
        let prop_access = resolve_prop_access(&mut ops, &tokens, inputs.len())?;
        check_stack_effects(expr, &tokens, &ops, inputs.len())?;
        Ok(RefExpr {
            ops,
            prop_access,
            out: *out,
            inputs: inputs.to_vec(),
            force_float: opt & OPT_USE_INTEGER == 0,
        })
    }

    /// Properties this expression reads, in constants-buffer order.
    pub fn prop_access(&self) -> &[PropAccess] {
        &self.prop_access
    }

    /// Evaluates every pixel of one plane.
    pub fn process_plane(
        &self,
        n: i32,
        dst: &mut Plane,
        srcs: &[&Plane],
        props: &[FrameProps],
    ) -> Result<(), Error> {
        if srcs.len() != self.inputs.len() {
            return Err(Error::PlaneMismatch(format!(
                "expected {} source planes, got {}",
                self.inputs.len(),
                srcs.len()
            )));
        }
        let consts = build_consts(n, &self.prop_access, props);
        let (width, height) = (dst.width(), dst.height());
        for y in 0..height {
            for x in 0..width {
                let v = self.eval_pixel(x, y, srcs, &consts);
                self.store_pixel(dst, x, y, v);
            }
        }
        Ok(())
    }

    fn load_pixel(&self, clip: usize, x: usize, y: usize, srcs: &[&Plane]) -> SVal {
        let format = self.inputs[clip].format;
        match format.sample_type {
            SampleType::Integer => {
                let raw = srcs[clip].get_int(x, y) as i32;
                if self.force_float {
                    SVal::F(raw as f32)
                } else {
                    SVal::I(raw)
                }
            }
            SampleType::Float => SVal::F(srcs[clip].get_f32(x, y)),
        }
    }

    fn eval_pixel(&self, x: usize, y: usize, srcs: &[&Plane], consts: &[f32]) -> SVal {
        let mut stack: Vec<SVal> = Vec::with_capacity(self.ops.len());
        let force_float = self.force_float;

        for op in &self.ops {
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
                    stack.push(self.load_pixel(op.imm.as_i32() as usize, x, y, srcs));
                }
                OpKind::Constant => {
                    let f = op.imm.as_f32();
                    let t = f as i32;
                    stack.push(if t as f32 == f { SVal::I(t) } else { SVal::F(f) });
                }
                OpKind::LoadConst => {
                    let v = match op.imm.as_i32() {
                        loadconst::N => SVal::I(consts[0].to_bits() as i32),
                        loadconst::X => SVal::I(x as i32),
                        loadconst::Y => SVal::I(y as i32),
                        slot => {
                            let idx = (slot - loadconst::FIRST_PROP
                                + loadconst::PROP_BUFFER_BASE)
                                as usize;
                            SVal::F(consts[idx])
                        }
                    };
                    stack.push(v);
                }
                OpKind::Add | OpKind::Sub | OpKind::Mul => {
                    let r = pop(&mut stack);
                    let l = pop(&mut stack);
                    let v = if l.is_float() || r.is_float() {
                        let (lf, rf) = (l.f(), r.f());
                        SVal::F(match op.kind {
                            OpKind::Add => lf + rf,
                            OpKind::Sub => lf - rf,
                            _ => lf * rf,
                        })
                    } else {
                        let (SVal::I(li), SVal::I(ri)) = (l, r) else {
                            unreachable!()
                        };
                        SVal::I(match op.kind {
                            OpKind::Add => li.wrapping_add(ri),
                            OpKind::Sub => li.wrapping_sub(ri),
                            _ => li.wrapping_mul(ri),
                        })
                    };
                    stack.push(v);
                }
                OpKind::Max | OpKind::Min => {
                    let r = pop(&mut stack);
                    let l = pop(&mut stack);
                    let v = if l.is_float() || r.is_float() || force_float {
                        let (lf, rf) = (l.f(), r.f());
                        SVal::F(if op.kind == OpKind::Max {
                            lf.max(rf)
                        } else {
                            lf.min(rf)
                        })
                    } else {
                        let (SVal::I(li), SVal::I(ri)) = (l, r) else {
                            unreachable!()
                        };
                        SVal::I(if op.kind == OpKind::Max {
                            li.max(ri)
                        } else {
                            li.min(ri)
                        })
                    };
                    stack.push(v);
                }
                OpKind::Div => {
                    let r = pop(&mut stack);
                    let l = pop(&mut stack);
                    stack.push(SVal::F(l.f() / r.f()));
                }
                OpKind::Mod => {
                    let r = pop(&mut stack);
                    let l = pop(&mut stack);
                    let (lf, rf) = (l.f(), r.f());
                    stack.push(SVal::F(lf - rf * (lf / rf).trunc()));
                }
                OpKind::Sqrt => {
                    let x = pop(&mut stack);
                    stack.push(SVal::F(x.f().max(0.0).sqrt()));
                }
                OpKind::Abs => {
                    let x = pop(&mut stack);
                    let v = match x {
                        SVal::F(f) => SVal::F(f.abs()),
                        SVal::I(i) => {
                            if force_float {
                                SVal::F((i as f32).abs())
                            } else {
                                SVal::I(i.wrapping_abs())
                            }
                        }
                    };
                    stack.push(v);
                }
                OpKind::Cmp => {
                    let r = pop(&mut stack);
                    let l = pop(&mut stack);
                    let code = CmpCode::from_imm(op.imm.as_u32());
                    let hit = if l.is_float() || r.is_float() {
                        let (lf, rf) = (l.f(), r.f());
                        match code {
                            CmpCode::Eq => lf == rf,
                            CmpCode::Lt => lf < rf,
                            CmpCode::Le => lf <= rf,
                            CmpCode::Neq => lf != rf,
                            CmpCode::Nlt => lf >= rf,
                            CmpCode::Nle => lf > rf,
                        }
                    } else {
                        let (SVal::I(li), SVal::I(ri)) = (l, r) else {
                            unreachable!()
                        };
                        match code {
                            CmpCode::Eq => li == ri,
                            CmpCode::Lt => li < ri,
                            CmpCode::Le => li <= ri,
                            CmpCode::Neq => li != ri,
                            CmpCode::Nlt => li >= ri,
                            CmpCode::Nle => li > ri,
                        }
                    };
                    stack.push(SVal::I(hit as i32));
                }
                OpKind::And | OpKind::Or | OpKind::Xor => {
                    let r = pop(&mut stack);
                    let l = pop(&mut stack);
                    let (lt, rt) = (l.truth(), r.truth());
                    let v = match op.kind {
                        OpKind::And => lt & rt,
                        OpKind::Or => lt | rt,
                        _ => lt ^ rt,
                    };
                    stack.push(SVal::I(v as i32));
                }
                OpKind::Not => {
                    let x = pop(&mut stack);
                    stack.push(SVal::I(!x.truth() as i32));
                }
                OpKind::Trunc => {
                    let x = pop(&mut stack);
                    stack.push(SVal::F(x.f().trunc()));
                }
                OpKind::Round => {
                    let x = pop(&mut stack);
                    stack.push(SVal::F(x.f().round_ties_even()));
                }
                OpKind::Floor => {
                    let x = pop(&mut stack);
                    stack.push(SVal::F(x.f().floor()));
                }
                OpKind::Exp => {
                    let x = pop(&mut stack);
                    stack.push(SVal::F(x.f().exp()));
                }
                OpKind::Log => {
                    let x = pop(&mut stack);
                    stack.push(SVal::F(ref_log(x.f())));
                }
                OpKind::Pow => {
                    let r = pop(&mut stack);
                    let l = pop(&mut stack);
                    stack.push(SVal::F((ref_log(l.f()) * r.f()).exp()));
                }
                OpKind::Sin => {
                    let x = pop(&mut stack);
                    stack.push(SVal::F(x.f().sin()));
                }
                OpKind::Cos => {
                    let x = pop(&mut stack);
                    stack.push(SVal::F(x.f().cos()));
                }
                OpKind::Ternary => {
                    let f = pop(&mut stack);
                    let t = pop(&mut stack);
                    let c = pop(&mut stack);
                    let v = if t.is_float() || f.is_float() {
                        SVal::F(if c.truth() { t.f() } else { f.f() })
                    } else {
                        let (SVal::I(ti), SVal::I(fi)) = (t, f) else {
                            unreachable!()
                        };
                        SVal::I(if c.truth() { ti } else { fi })
                    };
                    stack.push(v);
                }
            }
        }

        pop(&mut stack)
    }

    fn store_pixel(&self, dst: &mut Plane, x: usize, y: usize, v: SVal) {
        let format = self.out.format;
        match format.sample_type {
            SampleType::Integer => {
                let maxval = (1u32 << format.bits_per_sample) - 1;
                let rounded = match v {
                    SVal::F(f) => f.clamp(0.0, maxval as f32).round_ties_even() as i32,
                    SVal::I(i) => i.clamp(0, maxval as i32),
                };
                dst.set_int(x, y, rounded as u32);
            }
            SampleType::Float => {
                dst.set_f32(x, y, v.f());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::VideoFormat;

    fn gray8_plane(values: &[u8]) -> (VideoInfo, Plane) {
        let vi = VideoInfo::new(VideoFormat::gray8(), values.len(), 1);
        let mut plane = Plane::for_plane(&vi, 0);
        for (x, &v) in values.iter().enumerate() {
            plane.set_int(x, 0, v as u32);
        }
        (vi, plane)
    }

    fn run(expr: &str, values: &[u8], opt: u32) -> Vec<u8> {
        let (vi, src) = gray8_plane(values);
        let re = RefExpr::new(expr, &vi, &[vi], opt).unwrap();
        let mut dst = Plane::for_plane(&vi, 0);
        re.process_plane(0, &mut dst, &[&src], &[FrameProps::new()])
            .unwrap();
        (0..values.len()).map(|x| dst.get_int(x, 0) as u8).collect()
    }

    #[test]
    fn test_identity() {
        assert_eq!(run("x", &[0, 64, 128, 255], 1), vec![0, 64, 128, 255]);
    }

    #[test]
    fn test_clamped_double() {
        assert_eq!(run("x 2 *", &[0, 64, 128, 255], 1), vec![0, 128, 255, 255]);
    }

    #[test]
    fn test_compare_and_ternary() {
        assert_eq!(run("x 128 <", &[0, 64, 128, 255], 1), vec![1, 1, 0, 0]);
        assert_eq!(
            run("x 100 > 200 50 ?", &[0, 64, 128, 255], 1),
            vec![50, 50, 200, 200]
        );
    }

    #[test]
    fn test_saturating_square() {
        assert_eq!(run("x dup *", &[0, 64, 128, 255], 1), vec![0, 255, 255, 255]);
    }

    #[test]
    fn test_coordinates_and_frame_number() {
        let (vi, src) = gray8_plane(&[9, 9, 9, 9]);
        let re = RefExpr::new("N", &vi, &[vi], 1).unwrap();
        let mut dst = Plane::for_plane(&vi, 0);
        re.process_plane(7, &mut dst, &[&src], &[FrameProps::new()])
            .unwrap();
        assert_eq!(dst.get_int(2, 0), 7);

        assert_eq!(run("X", &[0, 0, 0, 0], 1), vec![0, 1, 2, 3]);
    }
}
