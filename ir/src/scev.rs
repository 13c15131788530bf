//! Scalar-evolution queries for canonical counted loops.
//!
//! The passes only reason about loops whose canonical induction variable
//! starts at zero and steps by one, so the evolution engine is specialized
//! to that shape: it recognizes the header compare against a loop-invariant
//! bound and produces a symbolic [`TripCount`] (a bound plus a constant
//! offset). Two loops iterate the same number of times exactly when their
//! trip counts are structurally equal.

use crate::function::Function;
use crate::instruction::{BinaryOp, Instruction};
use crate::loops::Loop;
use crate::terminator::Terminator;
use crate::values::ValueId;

/// The loop-invariant bound a trip count is expressed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// A compile-time constant.
    Const(i128),
    /// A value defined outside the loop.
    Value(ValueId),
}

/// A symbolic iteration count: `base + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TripCount {
    pub base: Bound,
    pub offset: i128,
}

impl TripCount {
    fn new(base: Bound, offset: i128) -> Self {
        // Fold constant bounds so equal counts compare equal.
        match base {
            Bound::Const(c) => TripCount {
                base: Bound::Const((c + offset).max(0)),
                offset: 0,
            },
            Bound::Value(_) => TripCount { base, offset },
        }
    }

    fn shifted(self, delta: i128) -> Self {
        TripCount::new(self.base, self.offset + delta)
    }
}

/// Number of times the back edge is taken before the loop exits.
///
/// `exiting` must be the loop's exiting block; the pattern recognized is a
/// conditional branch on a comparison between the canonical induction
/// variable and a loop-invariant bound.
pub fn exit_count(func: &Function, l: &Loop) -> Option<TripCount> {
    trip_count(func, l).map(|tc| tc.shifted(-1))
}

/// Turns a back-edge count into a header execution count.
pub fn trip_count_from_exit_count(count: TripCount) -> TripCount {
    count.shifted(1)
}

/// Number of times the loop header runs, when it has a closed form.
pub fn trip_count(func: &Function, l: &Loop) -> Option<TripCount> {
    let iv_phi = l.canonical_induction_variable(func)?;
    let iv = func.inst_result(iv_phi)?;
    let exiting = l.exiting_block(func)?;

    let Terminator::CondBranch {
        cond,
        then_block,
        else_block,
    } = func.block(exiting).terminator()
    else {
        return None;
    };
    let (then_block, else_block) = (*then_block, *else_block);

    let cmp = func.value_def(*cond)?;
    let Instruction::Binary { op, lhs, rhs } = func.inst(cmp) else {
        return None;
    };

    // Normalize so the induction variable sits on the left.
    let (op, bound) = if *lhs == iv {
        (*op, *rhs)
    } else if *rhs == iv {
        (mirror(*op), *lhs)
    } else {
        return None;
    };

    if !is_invariant_bound(func, l, bound) {
        return None;
    }
    let base = match func.as_const(bound) {
        Some(c) => Bound::Const(c.value()),
        None => Bound::Value(bound),
    };

    let then_in = l.contains(then_block);
    let else_in = l.contains(else_block);
    if then_in == else_in {
        return None;
    }

    if then_in {
        // Loop continues while the comparison holds.
        match op {
            BinaryOp::Lt | BinaryOp::Ne => Some(TripCount::new(base, 0)),
            BinaryOp::Le => Some(TripCount::new(base, 1)),
            _ => None,
        }
    } else {
        // Loop exits when the comparison holds.
        match op {
            BinaryOp::Ge | BinaryOp::Eq => Some(TripCount::new(base, 0)),
            BinaryOp::Gt => Some(TripCount::new(base, 1)),
            _ => None,
        }
    }
}

fn mirror(op: BinaryOp) -> BinaryOp {
    match op {
        BinaryOp::Lt => BinaryOp::Gt,
        BinaryOp::Le => BinaryOp::Ge,
        BinaryOp::Gt => BinaryOp::Lt,
        BinaryOp::Ge => BinaryOp::Le,
        other => other,
    }
}

fn is_invariant_bound(func: &Function, l: &Loop, bound: ValueId) -> bool {
    if func.as_const(bound).is_some() {
        return true;
    }
    match func.value_def(bound) {
        Some(inst) => func
            .inst_block(inst)
            .map(|b| !l.contains(b))
            .unwrap_or(false),
        // Parameters are defined outside every loop.
        None => true,
    }
}

/// A value expressed as `iv + offset` (or a plain constant) within a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Affine {
    /// The canonical induction variable, or `None` for a constant.
    pub iv: Option<ValueId>,
    pub offset: i128,
}

/// Resolves `value` to an affine expression in the loop's canonical
/// induction variable, when it has that shape.
pub fn affine_at(func: &Function, l: &Loop, value: ValueId) -> Option<Affine> {
    let iv = l
        .canonical_induction_variable(func)
        .and_then(|phi| func.inst_result(phi));
    affine_rec(func, iv, value)
}

fn affine_rec(func: &Function, iv: Option<ValueId>, value: ValueId) -> Option<Affine> {
    if Some(value) == iv {
        return Some(Affine {
            iv,
            offset: 0,
        });
    }
    if let Some(c) = func.as_const(value) {
        return Some(Affine {
            iv: None,
            offset: c.value(),
        });
    }
    let inst = func.value_def(value)?;
    match func.inst(inst) {
        Instruction::Binary {
            op: BinaryOp::Add,
            lhs,
            rhs,
        } => {
            if let Some(c) = func.as_const(*rhs) {
                let base = affine_rec(func, iv, *lhs)?;
                Some(Affine {
                    iv: base.iv,
                    offset: base.offset + c.value(),
                })
            } else if let Some(c) = func.as_const(*lhs) {
                let base = affine_rec(func, iv, *rhs)?;
                Some(Affine {
                    iv: base.iv,
                    offset: base.offset + c.value(),
                })
            } else {
                None
            }
        }
        Instruction::Binary {
            op: BinaryOp::Sub,
            lhs,
            rhs,
        } => {
            let c = func.as_const(*rhs)?;
            let base = affine_rec(func, iv, *lhs)?;
            Some(Affine {
                iv: base.iv,
                offset: base.offset - c.value(),
            })
        }
        _ => None,
    }
}
