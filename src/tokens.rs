//! Tokenizer and token decoder for the RPN expression language.
//!
//! An expression is whitespace-separated tokens, evaluated on a stack:
//! operators consume the top elements and push one result. Decoding maps
//! each token to an [`Op`] record; all later stages work on the op
//! stream alone.
//!
//! Author: Moroya Sakamoto

use crate::error::Error;

/// Operator kinds. One entry per recognized token class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    // Terminals.
    /// Pixel load from an input clip (`imm` = clip index).
    MemLoad,
    /// Literal float constant (`imm` = value bits).
    Constant,
    /// Constants-buffer load: frame number, coordinates or a frame
    /// property (`imm` = slot, see [`loadconst`]).
    LoadConst,

    // Arithmetic primitives.
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/` (always float)
    Div,
    /// `%` (always float)
    Mod,
    /// `sqrt` (of the non-negative clamp)
    Sqrt,
    /// `abs`
    Abs,
    /// `max`
    Max,
    /// `min`
    Min,
    /// Comparison (`imm` = [`CmpCode`]), produces 0/1 per lane.
    Cmp,

    // Float -> integer-valued float conversions.
    /// `trunc`
    Trunc,
    /// `round`
    Round,
    /// `floor`
    Floor,

    // Logical operators over `operand > 0` truth.
    /// `and`
    And,
    /// `or`
    Or,
    /// `xor`
    Xor,
    /// `not`
    Not,

    // Transcendental functions.
    /// `exp`
    Exp,
    /// `log`
    Log,
    /// `pow`
    Pow,
    /// `sin`
    Sin,
    /// `cos`
    Cos,

    /// `?` — `c t f ?` selects `t` where `c > 0`, else `f`.
    Ternary,

    // Stack helpers.
    /// `dupN` (`imm` = N, 0 = top).
    Dup,
    /// `swapN` (`imm` = N, exchanges top with element N below it).
    Swap,
}

/// Comparison codes carried in the immediate of a [`OpKind::Cmp`] op.
/// `>` encodes as [`CmpCode::Nle`], `>=` as [`CmpCode::Nlt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CmpCode {
    /// `=`
    Eq = 0,
    /// `<`
    Lt = 1,
    /// `<=`
    Le = 2,
    /// not equal
    Neq = 4,
    /// not less than (`>=`)
    Nlt = 5,
    /// not less than or equal (`>`)
    Nle = 6,
}

impl CmpCode {
    /// Decodes the immediate of a `Cmp` op.
    pub fn from_imm(imm: u32) -> CmpCode {
        match imm {
            0 => CmpCode::Eq,
            1 => CmpCode::Lt,
            2 => CmpCode::Le,
            4 => CmpCode::Neq,
            5 => CmpCode::Nlt,
            _ => CmpCode::Nle,
        }
    }
}

/// Slot assignments for [`OpKind::LoadConst`] immediates.
pub mod loadconst {
    /// Frame number (constants-buffer slot 0, read as i32 bits).
    pub const N: i32 = 0;
    /// Current column, per-lane ramp applied.
    pub const X: i32 = 1;
    /// Current row, broadcast.
    pub const Y: i32 = 2;
    /// First frame-property slot; property `k` is `FIRST_PROP + k`
    /// after dense rewriting.
    pub const FIRST_PROP: i32 = 3;
    /// Offset of property slot 0 inside the constants buffer
    /// (slot 0 is the frame number).
    pub const PROP_BUFFER_BASE: i32 = 1;
}

/// A 32-bit immediate, interpreted per op kind as signed int, unsigned
/// int or float. Compared bit-for-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Imm(u32);

impl Imm {
    /// From a signed integer.
    pub fn int(v: i32) -> Self {
        Imm(v as u32)
    }

    /// From an unsigned integer.
    pub fn uint(v: u32) -> Self {
        Imm(v)
    }

    /// From a float (stored as bits).
    pub fn float(v: f32) -> Self {
        Imm(v.to_bits())
    }

    /// Signed view.
    pub fn as_i32(self) -> i32 {
        self.0 as i32
    }

    /// Unsigned view.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Float view.
    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.0)
    }
}

/// One decoded operation. Equality is structural over all three fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    /// Operator kind.
    pub kind: OpKind,
    /// Immediate payload.
    pub imm: Imm,
    /// Property name; only set for property [`OpKind::LoadConst`] ops.
    pub name: Option<String>,
}

impl Op {
    fn new(kind: OpKind) -> Self {
        Op {
            kind,
            imm: Imm::default(),
            name: None,
        }
    }

    fn with_imm(kind: OpKind, imm: Imm) -> Self {
        Op {
            kind,
            imm,
            name: None,
        }
    }
}

/// Splits an expression on ASCII whitespace. Empty runs produce no
/// token; there is no quoting or escaping.
pub fn tokenize(expr: &str) -> Vec<String> {
    expr.split_ascii_whitespace().map(str::to_owned).collect()
}

/// Maps a clip letter to its index: `x y z` are clips 0-2, `a`-`w`
/// continue from 3.
fn clip_index(letter: u8) -> i32 {
    if letter >= b'x' {
        (letter - b'x') as i32
    } else {
        (letter - b'a') as i32 + 3
    }
}

/// Decodes one token into an [`Op`]. Strict: a numeric parse must
/// consume the whole token, and anything unrecognized is an error.
pub fn decode_token(token: &str) -> Result<Op, Error> {
    let simple = match token {
        "+" => Some(Op::new(OpKind::Add)),
        "-" => Some(Op::new(OpKind::Sub)),
        "*" => Some(Op::new(OpKind::Mul)),
        "/" => Some(Op::new(OpKind::Div)),
        "%" => Some(Op::new(OpKind::Mod)),
        "sqrt" => Some(Op::new(OpKind::Sqrt)),
        "abs" => Some(Op::new(OpKind::Abs)),
        "max" => Some(Op::new(OpKind::Max)),
        "min" => Some(Op::new(OpKind::Min)),
        "<" => Some(Op::with_imm(OpKind::Cmp, Imm::uint(CmpCode::Lt as u32))),
        ">" => Some(Op::with_imm(OpKind::Cmp, Imm::uint(CmpCode::Nle as u32))),
        "=" => Some(Op::with_imm(OpKind::Cmp, Imm::uint(CmpCode::Eq as u32))),
        ">=" => Some(Op::with_imm(OpKind::Cmp, Imm::uint(CmpCode::Nlt as u32))),
        "<=" => Some(Op::with_imm(OpKind::Cmp, Imm::uint(CmpCode::Le as u32))),
        "trunc" => Some(Op::new(OpKind::Trunc)),
        "round" => Some(Op::new(OpKind::Round)),
        "floor" => Some(Op::new(OpKind::Floor)),
        "and" => Some(Op::new(OpKind::And)),
        "or" => Some(Op::new(OpKind::Or)),
        "xor" => Some(Op::new(OpKind::Xor)),
        "not" => Some(Op::new(OpKind::Not)),
        "?" => Some(Op::new(OpKind::Ternary)),
        "exp" => Some(Op::new(OpKind::Exp)),
        "log" => Some(Op::new(OpKind::Log)),
        "pow" => Some(Op::new(OpKind::Pow)),
        "sin" => Some(Op::new(OpKind::Sin)),
        "cos" => Some(Op::new(OpKind::Cos)),
        "dup" => Some(Op::with_imm(OpKind::Dup, Imm::int(0))),
        "swap" => Some(Op::with_imm(OpKind::Swap, Imm::int(1))),
        "pi" => Some(Op::with_imm(
            OpKind::Constant,
            Imm::float(std::f32::consts::PI),
        )),
        "N" => Some(Op::with_imm(OpKind::LoadConst, Imm::int(loadconst::N))),
        "X" => Some(Op::with_imm(OpKind::LoadConst, Imm::int(loadconst::X))),
        "Y" => Some(Op::with_imm(OpKind::LoadConst, Imm::int(loadconst::Y))),
        _ => None,
    };
    if let Some(op) = simple {
        return Ok(op);
    }

    let bytes = token.as_bytes();
    if bytes.len() == 1 && bytes[0].is_ascii_lowercase() {
        return Ok(Op::with_imm(OpKind::MemLoad, Imm::int(clip_index(bytes[0]))));
    }

    if let Some(rest) = token.strip_prefix("dup") {
        let idx: usize = rest
            .parse()
            .map_err(|_| Error::IllegalToken(token.to_string()))?;
        return Ok(Op::with_imm(OpKind::Dup, Imm::uint(idx as u32)));
    }
    if let Some(rest) = token.strip_prefix("swap") {
        let idx: usize = rest
            .parse()
            .map_err(|_| Error::IllegalToken(token.to_string()))?;
        return Ok(Op::with_imm(OpKind::Swap, Imm::uint(idx as u32)));
    }

    // Frame property access: single clip letter, a dot, a name.
    if bytes.len() >= 3 && bytes[0].is_ascii_lowercase() && bytes[1] == b'.' {
        return Ok(Op {
            kind: OpKind::LoadConst,
            imm: Imm::int(loadconst::FIRST_PROP + clip_index(bytes[0])),
            name: Some(token[2..].to_string()),
        });
    }

    let value: f32 = token
        .parse()
        .map_err(|_| Error::BadNumber(token.to_string()))?;
    Ok(Op::with_imm(OpKind::Constant, Imm::float(value)))
}

/// Tokenizes and decodes a whole expression.
pub fn decode_expr(expr: &str) -> Result<(Vec<String>, Vec<Op>), Error> {
    let tokens = tokenize(expr);
    let mut ops = Vec::with_capacity(tokens.len());
    for tok in &tokens {
        ops.push(decode_token(tok)?);
    }
    Ok((tokens, ops))
}

/// Number of stack operands each op consumes. Terminals and stack
/// helpers are 0; `dup`/`swap` depth requirements are checked
/// separately against their immediates.
pub fn arity(kind: OpKind) -> usize {
    match kind {
        OpKind::MemLoad | OpKind::Constant | OpKind::LoadConst | OpKind::Dup | OpKind::Swap => 0,
        OpKind::Sqrt
        | OpKind::Abs
        | OpKind::Trunc
        | OpKind::Round
        | OpKind::Floor
        | OpKind::Not
        | OpKind::Exp
        | OpKind::Log
        | OpKind::Sin
        | OpKind::Cos => 1,
        OpKind::Ternary => 3,
        _ => 2,
    }
}

/// Simulates stack depths over the op stream, verifying every arity
/// and the final depth of exactly one, before any IR is emitted.
pub fn check_stack_effects(
    expr: &str,
    tokens: &[String],
    ops: &[Op],
    num_inputs: usize,
) -> Result<(), Error> {
    let mut depth: usize = 0;
    for (op, tok) in ops.iter().zip(tokens) {
        if op.kind == OpKind::MemLoad && op.imm.as_i32() as usize >= num_inputs {
            return Err(Error::UndefinedClip(tok.clone()));
        }
        if matches!(op.kind, OpKind::Dup | OpKind::Swap) && op.imm.as_u32() as usize >= depth {
            return Err(Error::StackUnderflow(tok.clone()));
        }
        let n = arity(op.kind);
        if depth < n {
            return Err(Error::StackUnderflow(tok.clone()));
        }
        depth -= n;
        // Every op except a bare swap pushes exactly one result.
        if op.kind != OpKind::Swap {
            depth += 1;
        }
    }
    if depth == 0 {
        return Err(Error::EmptyExpression(expr.to_string()));
    }
    if depth > 1 {
        return Err(Error::UnconsumedValues(expr.to_string()));
    }
    Ok(())
}
