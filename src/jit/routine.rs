//! Routine construction and the compiled artifact.
//!
//! Wraps the lowered expression body in the row/column loop, compiles
//! the module to native code and retains the entry point. One routine
//! is produced per (expression, output plane) pair at filter creation
//! and invoked once per frame afterwards.
//!
//! Author: Moroya Sakamoto

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, AbiParam, InstBuilder, MemFlags, UserFuncName};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use std::mem;

use super::lower::{FuncRefs, IterState, Lowerer};
use super::math::{define_helpers, jit_err};
use super::{config, HALVES, LANES, UNROLL};
use crate::error::Error;
use crate::props::{resolve_prop_access, PropAccess};
use crate::tokens::{check_stack_effects, decode_expr};
use crate::video::{validate_inputs, VideoInfo};

/// ABI of the compiled routine.
///
/// `rwptrs[0]` is the writable output plane, `rwptrs[1..]` the
/// read-only inputs; `strides` is parallel, in bytes. `consts[0]`
/// reinterpreted as i32 is the frame number; later slots hold resolved
/// property values.
type ProcessProc =
    unsafe extern "C" fn(*const *mut u8, *const i32, *const f32, i32, i32);

/// Option bit: keep integer arithmetic on integer sources. When clear,
/// integer pixel loads are promoted to float immediately after load.
pub const OPT_USE_INTEGER: u32 = 1 << 0;

/// A compiled per-plane routine plus the property table the invoker
/// must materialize into the constants buffer.
///
/// The artifact owns the JIT module; the native code is released when
/// the artifact is dropped. Invocation reads only its arguments and is
/// safe to run concurrently from multiple threads.
pub struct CompiledExpr {
    module: Option<JITModule>,
    proc: ProcessProc,
    prop_access: Vec<PropAccess>,
}

// SAFETY: the module is never mutated after compilation and the entry
// point is a pure function of its arguments.
unsafe impl Send for CompiledExpr {}
unsafe impl Sync for CompiledExpr {}

impl CompiledExpr {
    /// Compiles one expression for one output plane.
    ///
    /// Tokenizes and decodes `expr`, resolves property accesses,
    /// verifies stack effects, then lowers everything into a single
    /// flat routine for the geometry described by `out` and `inputs`.
    pub fn compile(
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

        let force_float = opt & OPT_USE_INTEGER == 0;

        // Back-end flags, from the process-wide configuration.
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", config().opt_level.flag_value())
            .map_err(jit_err)?;
        flag_builder
            .set("use_colocated_libcalls", "true")
            .map_err(jit_err)?;
        if cfg!(target_arch = "x86_64") {
            let _ = flag_builder.set("enable_simd", "true");
        }

        let isa_builder = cranelift_native::builder().map_err(jit_err)?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(jit_err)?;

        let builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        let mut module = JITModule::new(builder);
        let mut ctx = module.make_context();
        let mut fbc = FunctionBuilderContext::new();

        let helpers = define_helpers(&mut module, &mut ctx, &mut fbc)?;

        let ptr_type = module.target_config().pointer_type();
        let mut sig = module.make_signature();
        sig.params.push(AbiParam::new(ptr_type)); // rwptrs
        sig.params.push(AbiParam::new(ptr_type)); // strides
        sig.params.push(AbiParam::new(ptr_type)); // consts
        sig.params.push(AbiParam::new(types::I32)); // width
        sig.params.push(AbiParam::new(types::I32)); // height

        let func_id = module
            .declare_function("proc_plane", Linkage::Export, &sig)
            .map_err(jit_err)?;

        ctx.func.signature = sig;
        ctx.func.name = UserFuncName::user(0, func_id.as_u32());
        {
            let refs = FuncRefs {
                sin: module.declare_func_in_func(helpers.sin, &mut ctx.func),
                cos: module.declare_func_in_func(helpers.cos, &mut ctx.func),
                exp: module.declare_func_in_func(helpers.exp, &mut ctx.func),
                log: module.declare_func_in_func(helpers.log, &mut ctx.func),
                pow: module.declare_func_in_func(helpers.pow, &mut ctx.func),
            };

            let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);
            let entry = b.create_block();
            b.append_block_params_for_function_params(entry);
            b.switch_to_block(entry);
            b.seal_block(entry);

            let params = b.block_params(entry).to_vec();
            let (rwptrs, strides_ptr, consts) = (params[0], params[1], params[2]);
            let (width, height) = (params[3], params[4]);

            let mut arg_flags = MemFlags::new();
            arg_flags.set_aligned();
            arg_flags.set_notrap();

            let mut ptrs = Vec::with_capacity(inputs.len() + 1);
            let mut strides = Vec::with_capacity(inputs.len() + 1);
            let ptr_bytes = ptr_type.bytes() as i32;
            for i in 0..inputs.len() as i32 + 1 {
                ptrs.push(b.ins().load(ptr_type, arg_flags, rwptrs, i * ptr_bytes));
                strides.push(b.ins().load(types::I32, arg_flags, strides_ptr, i * 4));
            }

            // Per-lane column offsets, one I32X4 ramp per half.
            let xramp: [_; HALVES] = std::array::from_fn(|h| {
                let first = b.ins().iconst(types::I32, (h * 4) as i64);
                let mut v = b.ins().splat(types::I32X4, first);
                for lane in 1..4u8 {
                    let off = b.ins().iconst(types::I32, (h * 4) as i64 + lane as i64);
                    v = b.ins().insertlane(v, off, lane);
                }
                v
            });

            let zero = b.ins().iconst(types::I32, 0);

            // The row and column counters travel as block parameters.
            let y_header = b.create_block();
            let yv = b.append_block_param(y_header, types::I32);
            let y_body = b.create_block();
            let y_latch = b.create_block();
            let x_header = b.create_block();
            let xv = b.append_block_param(x_header, types::I32);
            let x_body = b.create_block();
            let exit = b.create_block();

            b.ins().jump(y_header, &[zero]);

            b.switch_to_block(y_header);
            let y_in = b.ins().icmp(IntCC::SignedLessThan, yv, height);
            b.ins().brif(y_in, y_body, &[], exit, &[]);

            b.switch_to_block(y_body);
            b.seal_block(y_body);
            b.ins().jump(x_header, &[zero]);

            b.switch_to_block(x_header);
            let x_in = b.ins().icmp(IntCC::SignedLessThan, xv, width);
            b.ins().brif(x_in, x_body, &[], y_latch, &[]);

            b.switch_to_block(x_body);
            b.seal_block(x_body);
            for k in 0..UNROLL {
                let xk = if k == 0 {
                    xv
                } else {
                    b.ins().iadd_imm(xv, (k * LANES) as i64)
                };
                let state = IterState {
                    ptr_type,
                    ptrs: ptrs.clone(),
                    strides: strides.clone(),
                    consts,
                    xramp,
                    x: xk,
                    y: yv,
                };
                let mut lowerer = Lowerer {
                    b: &mut b,
                    refs: &refs,
                    out,
                    inputs,
                    force_float,
                };
                lowerer.lower_iteration(&tokens, &ops, &state)?;
            }
            let x_next = b.ins().iadd_imm(xv, (LANES * UNROLL) as i64);
            b.ins().jump(x_header, &[x_next]);
            b.seal_block(x_header);

            b.switch_to_block(y_latch);
            b.seal_block(y_latch);
            let y_next = b.ins().iadd_imm(yv, 1);
            b.ins().jump(y_header, &[y_next]);
            b.seal_block(y_header);

            b.switch_to_block(exit);
            b.seal_block(exit);
            b.ins().return_(&[]);
            b.finalize();
        }

        module.define_function(func_id, &mut ctx).map_err(jit_err)?;
        module.clear_context(&mut ctx);
        module.finalize_definitions().map_err(jit_err)?;

        let code = module.get_finalized_function(func_id);
        // SAFETY: the function was just defined with this signature.
        let proc: ProcessProc = unsafe { mem::transmute(code) };

        Ok(CompiledExpr {
            module: Some(module),
            proc,
            prop_access,
        })
    }

    /// Properties the invoker must materialize, in constants-buffer
    /// slot order (starting at slot 1).
    pub fn prop_access(&self) -> &[PropAccess] {
        &self.prop_access
    }

    /// Runs the routine over one plane.
    ///
    /// # Safety
    ///
    /// `rwptrs`/`strides` must describe `1 + num_inputs` planes of the
    /// compiled geometry, rows 32-byte aligned and padded to whole
    /// 8-lane blocks; `consts` must hold `1 + prop_access().len()`
    /// floats.
    pub unsafe fn invoke_raw(
        &self,
        rwptrs: *const *mut u8,
        strides: *const i32,
        consts: *const f32,
        width: i32,
        height: i32,
    ) {
        (self.proc)(rwptrs, strides, consts, width, height)
    }
}

impl Drop for CompiledExpr {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: the entry pointer is unreachable once the
            // artifact is gone; nothing outlives the mapping.
            unsafe { module.free_memory() };
        }
    }
}

impl std::fmt::Debug for CompiledExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledExpr")
            .field("proc", &format!("{:p}", self.proc as *const ()))
            .field("prop_access", &self.prop_access)
            .finish()
    }
}
