//! # vexpr
//!
//! A per-pixel expression JIT for video-frame pipelines.
//!
//! The host supplies up to 26 input clips with identical geometry and
//! one RPN arithmetic expression per output plane. Each expression is
//! compiled once — tokenized, decoded, type-propagated over a stack of
//! int/float SIMD values and lowered through Cranelift into a single
//! flat, vectorized row/column loop — then invoked per frame to write
//! the output plane.
//!
//! ## Features
//!
//! - **Language**: arithmetic, comparisons, logic, ternary selection,
//!   `exp`/`log`/`pow`/`sin`/`cos`, stack `dupN`/`swapN`, per-pixel
//!   coordinates `X`/`Y`, frame number `N`, frame properties `clip.name`
//! - **Typing**: integer arithmetic is preserved on integer sources
//!   (`opt` bit 0); conversions are inserted only where required
//! - **Formats**: 8-16 bit unsigned integer and 32-bit float planes,
//!   mixed freely between inputs and output
//! - **Codegen**: 8 pixels per iteration as two 128-bit vectors, with
//!   range-reduced polynomial transcendentals emitted as module-local
//!   helper functions
//!
//! ## Example
//!
//! ```rust
//! use vexpr::prelude::*;
//!
//! // One 8-bit grayscale input, doubled and clamped.
//! let info = VideoInfo::new(VideoFormat::gray8(), 64, 32);
//! let filter = ExprFilter::new(&[info], &["x 2 *"], None, 1).unwrap();
//!
//! let mut src = Frame::new(&info);
//! src.planes[0].set_int(3, 0, 100);
//!
//! let out = filter.process_frame(0, &[&src]).unwrap();
//! assert_eq!(out.planes[0].get_int(3, 0), 200);
//! ```
//!
//! ## Author
//!
//! Moroya Sakamoto

#![warn(missing_docs)]

pub mod error;
pub mod filter;
pub mod interp;
pub mod jit;
pub mod props;
pub mod tokens;
pub mod video;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude - commonly used types and functions
pub mod prelude {
    pub use crate::error::Error;
    pub use crate::filter::{ExprFilter, Frame, PlaneOp};
    pub use crate::interp::RefExpr;
    pub use crate::jit::{configure, CompiledExpr, JitConfig, OptLevel, LANES, OPT_USE_INTEGER};
    pub use crate::props::{FrameProps, PropAccess, PropValue};
    pub use crate::video::{
        ColorFamily, FormatPreset, Plane, SampleType, VideoFormat, VideoInfo, ALIGNMENT,
        MAX_INPUTS,
    };
}

// Re-exports for convenience
pub use error::Error;
pub use filter::ExprFilter;
pub use jit::CompiledExpr;
pub use video::{Plane, VideoFormat, VideoInfo};
