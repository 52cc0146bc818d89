//! Error types for expression compilation and invocation.
//!
//! Author: Moroya Sakamoto

use thiserror::Error;

/// Error raised while validating inputs, parsing an expression,
/// lowering it, or invoking a compiled routine.
///
/// Compile-time errors fail filter creation atomically; no partial
/// per-plane artifacts are retained. Run-time anomalies (missing frame
/// properties, clamping at integer bounds) are silent by design and do
/// not surface here.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// More input clips than the 26 single-letter slots.
    #[error("More than 26 input clips provided")]
    TooManyInputs,

    /// No input clips at all.
    #[error("At least one input clip is required")]
    NoInputs,

    /// Inputs disagree on dimensions, plane count or subsampling.
    #[error("All inputs must have the same number of planes and the same dimensions, subsampling included")]
    InputMismatch,

    /// A sample format outside 8-16 bit integer / 32 bit float.
    #[error("Input clips must be 8-16 bit integer or 32 bit float format")]
    UnsupportedSampleFormat,

    /// 16-bit float output or input. Explicitly unsupported.
    #[error("16 bit float formats are not supported")]
    HalfFloatUnsupported,

    /// Compat (packed) color family.
    #[error("No compat formats allowed")]
    CompatFormat,

    /// Output format preset incompatible with the inputs.
    #[error("The number of planes in the inputs and output must match")]
    PlaneCountMismatch,

    /// More expression strings than output planes.
    #[error("More expressions given than there are planes")]
    TooManyExpressions,

    /// A token that decodes to nothing.
    #[error("failed to convert '{0}' to float")]
    BadNumber(String),

    /// An ill-formed `dupN` / `swapN` token.
    #[error("illegal token: {0}")]
    IllegalToken(String),

    /// A clip letter or property access beyond the supplied inputs.
    #[error("reference to undefined clip: {0}")]
    UndefinedClip(String),

    /// An operator popped more values than the stack holds.
    #[error("insufficient values on stack: {0}")]
    StackUnderflow(String),

    /// More than one value left on the stack after the final op.
    #[error("unconsumed values on stack: {0}")]
    UnconsumedValues(String),

    /// No ops at all.
    #[error("empty expression: {0}")]
    EmptyExpression(String),

    /// A plane handed to the invoker does not match the compiled geometry.
    #[error("plane geometry mismatch: {0}")]
    PlaneMismatch(String),

    /// Failure inside the Cranelift back end.
    #[error("JIT error: {0}")]
    Jit(String),
}

impl Error {
    /// The message surfaced through the host's error channel.
    pub fn host_message(&self) -> String {
        format!("Expr: {self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_prefix() {
        let e = Error::TooManyInputs;
        assert_eq!(e.host_message(), "Expr: More than 26 input clips provided");
    }

    #[test]
    fn test_token_in_message() {
        let e = Error::StackUnderflow("+".to_string());
        assert_eq!(e.to_string(), "insufficient values on stack: +");
    }
}
