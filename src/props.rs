//! Frame-property access resolution.
//!
//! `clip.name` tokens decode to property loads whose immediate encodes
//! the clip letter. Before lowering, those immediates are rewritten in
//! place to dense constants-buffer slots, so the op stream is
//! self-contained at invocation time, and the dense descriptor table
//! tells the invoker which `(clip, name)` values to materialize.
//!
//! Author: Moroya Sakamoto

use std::collections::HashMap;

use crate::error::Error;
use crate::tokens::{loadconst, Imm, Op, OpKind};

/// One property the compiled routine reads: which clip, which name.
/// The position in the descriptor vector is the dense slot index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropAccess {
    /// Input clip index.
    pub clip: usize,
    /// Property name (the part after the dot).
    pub name: String,
}

/// A named scalar the host attached to a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropValue {
    /// Integer-typed property.
    Int(i64),
    /// Float-typed property.
    Float(f64),
}

/// Properties of one input frame, by name.
pub type FrameProps = HashMap<String, PropValue>;

/// Materializes the per-frame constants buffer: slot 0 carries the
/// frame number as an i32 bit pattern, later slots the resolved
/// property values in dense order. Integer properties convert
/// numerically; any retrieval failure stores NaN, silently.
pub fn build_consts(n: i32, prop_access: &[PropAccess], props: &[FrameProps]) -> Vec<f32> {
    let mut consts = Vec::with_capacity(1 + prop_access.len());
    consts.push(f32::from_bits(n as u32));
    for pa in prop_access {
        let value = props
            .get(pa.clip)
            .and_then(|frame| frame.get(&pa.name))
            .map(|v| match v {
                PropValue::Int(i) => *i as f32,
                PropValue::Float(f) => *f as f32,
            })
            .unwrap_or(f32::NAN);
        consts.push(value);
    }
    consts
}

/// Interns every property `LoadConst` into a dense map, rewriting each
/// op's immediate to `FIRST_PROP + dense index`. Duplicate
/// `(clip, name)` pairs share a slot. Returns the descriptors in dense
/// order.
pub fn resolve_prop_access(
    ops: &mut [Op],
    tokens: &[String],
    num_inputs: usize,
) -> Result<Vec<PropAccess>, Error> {
    let mut slots: HashMap<(usize, String), usize> = HashMap::new();
    let mut order: Vec<PropAccess> = Vec::new();

    for (op, tok) in ops.iter_mut().zip(tokens) {
        if op.kind != OpKind::LoadConst || op.imm.as_i32() < loadconst::FIRST_PROP {
            continue;
        }
        let clip = (op.imm.as_i32() - loadconst::FIRST_PROP) as usize;
        if clip >= num_inputs {
            return Err(Error::UndefinedClip(tok.clone()));
        }
        let name = op.name.clone().unwrap_or_default();
        let key = (clip, name.clone());
        let next = slots.len();
        let slot = *slots.entry(key).or_insert(next);
        if slot == order.len() {
            order.push(PropAccess { clip, name });
        }
        op.imm = Imm::int(loadconst::FIRST_PROP + slot as i32);
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::decode_expr;

    #[test]
    fn test_dense_interning() {
        let (tokens, mut ops) = decode_expr("x y._Gain * x._Off + y._Gain -").unwrap();
        let pa = resolve_prop_access(&mut ops, &tokens, 2).unwrap();
        assert_eq!(
            pa,
            vec![
                PropAccess {
                    clip: 1,
                    name: "_Gain".to_string()
                },
                PropAccess {
                    clip: 0,
                    name: "_Off".to_string()
                },
            ]
        );
        // Both _Gain loads share slot 0; _Off gets slot 1.
        let prop_imms: Vec<i32> = ops
            .iter()
            .filter(|op| op.kind == OpKind::LoadConst)
            .map(|op| op.imm.as_i32())
            .collect();
        assert_eq!(
            prop_imms,
            vec![loadconst::FIRST_PROP, loadconst::FIRST_PROP + 1, loadconst::FIRST_PROP]
        );
    }

    #[test]
    fn test_undefined_clip_property() {
        let (tokens, mut ops) = decode_expr("x z._Gain *").unwrap();
        assert!(matches!(
            resolve_prop_access(&mut ops, &tokens, 2),
            Err(Error::UndefinedClip(_))
        ));
    }

    #[test]
    fn test_build_consts() {
        let pa = vec![
            PropAccess {
                clip: 0,
                name: "_Gain".to_string(),
            },
            PropAccess {
                clip: 0,
                name: "_Missing".to_string(),
            },
        ];
        let mut frame = FrameProps::new();
        frame.insert("_Gain".to_string(), PropValue::Int(3));
        let consts = build_consts(7, &pa, &[frame]);
        assert_eq!(consts[0].to_bits(), 7);
        assert_eq!(consts[1], 3.0);
        assert!(consts[2].is_nan());
    }

    #[test]
    fn test_plain_loadconsts_untouched() {
        let (tokens, mut ops) = decode_expr("N X Y + +").unwrap();
        let pa = resolve_prop_access(&mut ops, &tokens, 1).unwrap();
        assert!(pa.is_empty());
        assert_eq!(ops[0].imm.as_i32(), loadconst::N);
        assert_eq!(ops[1].imm.as_i32(), loadconst::X);
        assert_eq!(ops[2].imm.as_i32(), loadconst::Y);
    }
}
