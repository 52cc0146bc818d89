//! Filter construction and per-frame invocation.
//!
//! [`ExprFilter`] is the host-facing surface: it validates the input
//! clip set, decides a disposition per output plane, compiles one
//! routine per processed plane, and at frame time materializes the
//! constants buffer and jumps into the compiled code. The host owns
//! frames and properties; this layer only pins the contract between
//! them and the routines.
//!
//! Author: Moroya Sakamoto

use rayon::prelude::*;

use crate::error::Error;
use crate::jit::{CompiledExpr, OPT_USE_INTEGER};
use crate::props::{build_consts, FrameProps};
use crate::video::{apply_format_preset, validate_inputs, FormatPreset, Plane, VideoInfo};

/// Disposition of one output plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneOp {
    /// Evaluate the plane's expression per pixel.
    Process,
    /// Copy input 0's plane untouched (empty expression, matching
    /// output format).
    Copy,
    /// Leave the plane unwritten (empty expression, format changed).
    Undefined,
}

/// One input frame as handed to the invoker: its planes plus the
/// host-attached properties.
pub struct Frame {
    /// Plane storage, one entry per format plane.
    pub planes: Vec<Plane>,
    /// Frame properties.
    pub props: FrameProps,
}

impl Frame {
    /// Allocates a zeroed frame for `info`.
    pub fn new(info: &VideoInfo) -> Self {
        let planes = (0..info.format.num_planes)
            .map(|p| Plane::for_plane(info, p))
            .collect();
        Frame {
            planes,
            props: FrameProps::new(),
        }
    }
}

/// A fully validated and compiled expression filter.
///
/// Creation is atomic: any validation, parse or lowering error fails
/// the whole construction and no per-plane artifacts are retained.
/// Invocation is `&self`, reentrant and thread-safe; the host may
/// process different frames in parallel.
#[derive(Debug)]
pub struct ExprFilter {
    out: VideoInfo,
    inputs: Vec<VideoInfo>,
    plane_ops: Vec<PlaneOp>,
    compiled: Vec<Option<CompiledExpr>>,
}

impl ExprFilter {
    /// Builds the filter: validates the clip set, applies the optional
    /// output format preset, replicates expressions across planes and
    /// compiles every processed plane.
    ///
    /// `opt` is a bitmask; bit 0 ([`OPT_USE_INTEGER`], default on via
    /// `opt = 1`) keeps integer arithmetic on integer sources.
    pub fn new(
        inputs: &[VideoInfo],
        exprs: &[&str],
        format: Option<FormatPreset>,
        opt: u32,
    ) -> Result<Self, Error> {
        validate_inputs(inputs)?;

        let base = inputs[0];
        let out = match format {
            Some(preset) => apply_format_preset(&base, &preset)?,
            None => base,
        };
        out.format.validate()?;

        let num_planes = out.format.num_planes;
        if exprs.len() > num_planes {
            return Err(Error::TooManyExpressions);
        }
        if exprs.is_empty() {
            return Err(Error::EmptyExpression(String::new()));
        }

        // Fewer expressions than planes: the last one is replicated.
        let mut plane_exprs: Vec<&str> = Vec::with_capacity(num_planes);
        for i in 0..num_planes {
            plane_exprs.push(exprs.get(i).copied().unwrap_or(exprs[exprs.len() - 1]));
        }

        let format_matches = out.format.sample_type == base.format.sample_type
            && out.format.bits_per_sample == base.format.bits_per_sample;

        let mut plane_ops = Vec::with_capacity(num_planes);
        let mut compiled = Vec::with_capacity(num_planes);
        for expr in &plane_exprs {
            if expr.is_empty() {
                plane_ops.push(if format_matches {
                    PlaneOp::Copy
                } else {
                    PlaneOp::Undefined
                });
                compiled.push(None);
                continue;
            }
            plane_ops.push(PlaneOp::Process);
            compiled.push(Some(CompiledExpr::compile(expr, &out, inputs, opt)?));
        }

        Ok(ExprFilter {
            out,
            inputs: inputs.to_vec(),
            plane_ops,
            compiled,
        })
    }

    /// The output clip info (input 0 with any preset applied).
    pub fn output_info(&self) -> &VideoInfo {
        &self.out
    }

    /// Disposition of one output plane.
    pub fn plane_op(&self, plane: usize) -> PlaneOp {
        self.plane_ops[plane]
    }

    /// Whether integer sources keep integer arithmetic.
    pub fn uses_integer(opt: u32) -> bool {
        opt & OPT_USE_INTEGER != 0
    }

    fn check_plane_geometry(
        &self,
        plane: usize,
        dst: &Plane,
        srcs: &[&Plane],
    ) -> Result<(), Error> {
        if srcs.len() != self.inputs.len() {
            return Err(Error::PlaneMismatch(format!(
                "expected {} source planes, got {}",
                self.inputs.len(),
                srcs.len()
            )));
        }
        let (w, h) = self.out.plane_dimensions(plane);
        if dst.width() != w || dst.height() != h {
            return Err(Error::PlaneMismatch(format!(
                "output plane is {}x{}, expected {}x{}",
                dst.width(),
                dst.height(),
                w,
                h
            )));
        }
        for src in srcs {
            if src.width() != w || src.height() != h {
                return Err(Error::PlaneMismatch(format!(
                    "input plane is {}x{}, expected {}x{}",
                    src.width(),
                    src.height(),
                    w,
                    h
                )));
            }
        }
        Ok(())
    }

    /// Processes one output plane of frame `n`.
    ///
    /// `srcs` holds the same plane of every input clip's frame, `props`
    /// each clip's frame properties. Copy planes duplicate input 0;
    /// undefined planes are left untouched.
    pub fn process_plane(
        &self,
        plane: usize,
        n: i32,
        dst: &mut Plane,
        srcs: &[&Plane],
        props: &[FrameProps],
    ) -> Result<(), Error> {
        self.check_plane_geometry(plane, dst, srcs)?;
        match self.plane_ops[plane] {
            PlaneOp::Undefined => Ok(()),
            PlaneOp::Copy => {
                dst.copy_from(srcs[0]);
                Ok(())
            }
            PlaneOp::Process => {
                let Some(compiled) = self.compiled[plane].as_ref() else {
                    return Ok(());
                };

                let consts = build_consts(n, compiled.prop_access(), props);

                let mut rwptrs: Vec<*mut u8> = Vec::with_capacity(srcs.len() + 1);
                let mut strides: Vec<i32> = Vec::with_capacity(srcs.len() + 1);
                rwptrs.push(dst.data_mut().as_mut_ptr());
                strides.push(dst.stride() as i32);
                for src in srcs {
                    rwptrs.push(src.data().as_ptr() as *mut u8);
                    strides.push(src.stride() as i32);
                }

                let (w, h) = (dst.width() as i32, dst.height() as i32);
                // SAFETY: geometry was checked against the compiled
                // info and Plane guarantees aligned, padded rows.
                unsafe {
                    compiled.invoke_raw(
                        rwptrs.as_ptr(),
                        strides.as_ptr(),
                        consts.as_ptr(),
                        w,
                        h,
                    );
                }
                Ok(())
            }
        }
    }

    fn process_one_plane_into(
        &self,
        plane: usize,
        n: i32,
        dst: &mut Plane,
        srcs: &[&Frame],
    ) -> Result<(), Error> {
        let src_planes: Vec<&Plane> = srcs.iter().map(|f| &f.planes[plane]).collect();
        let props: Vec<FrameProps> = srcs.iter().map(|f| f.props.clone()).collect();
        self.process_plane(plane, n, dst, &src_planes, &props)
    }

    /// Produces output frame `n` from one frame per input clip.
    pub fn process_frame(&self, n: i32, srcs: &[&Frame]) -> Result<Frame, Error> {
        let mut out = Frame::new(&self.out);
        for plane in 0..self.out.format.num_planes {
            self.process_one_plane_into(plane, n, &mut out.planes[plane], srcs)?;
        }
        Ok(out)
    }

    /// [`process_frame`](Self::process_frame) with the planes fanned
    /// out across the rayon pool.
    pub fn process_frame_par(&self, n: i32, srcs: &[&Frame]) -> Result<Frame, Error> {
        let mut out = Frame::new(&self.out);
        out.planes
            .par_iter_mut()
            .enumerate()
            .try_for_each(|(plane, dst)| self.process_one_plane_into(plane, n, dst, srcs))?;
        Ok(out)
    }
}
