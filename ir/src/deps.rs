//! Dependence oracle for loop fusion.
//!
//! Answers one question: for a memory access in one loop and a memory
//! access in a following loop with the same trip count, what is the
//! dependence distance along the fused iteration space? The analysis is
//! deliberately narrow — affine element indices off a common base pointer
//! give an exact distance, distinct stack allocations are independent, and
//! everything else is `Unknown` so callers can reject conservatively.

use crate::function::Function;
use crate::instruction::Instruction;
use crate::loops::Loop;
use crate::scev::affine_at;
use crate::values::{InstId, ValueId};

/// Outcome of a dependence query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepResult {
    /// The accesses can never touch the same location.
    Independent,
    /// The accesses may conflict, `d` iterations apart (`first` accesses
    /// element `i + d` when `second` accesses element `i`).
    Distance(i128),
    /// Nothing could be proved.
    Unknown,
}

/// Dependence between `first` (in loop `l1`) and `second` (in loop `l2`)
/// along the fused iteration space.
pub fn fusion_dependence(
    func: &Function,
    l1: &Loop,
    l2: &Loop,
    first: InstId,
    second: InstId,
) -> DepResult {
    let Some(ptr_a) = pointer_operand(func.inst(first)) else {
        return DepResult::Unknown;
    };
    let Some(ptr_b) = pointer_operand(func.inst(second)) else {
        return DepResult::Unknown;
    };

    let Some((base_a, index_a)) = decompose(func, ptr_a) else {
        return DepResult::Unknown;
    };
    let Some((base_b, index_b)) = decompose(func, ptr_b) else {
        return DepResult::Unknown;
    };

    if base_a != base_b {
        // Distinct stack slots can never alias each other.
        if is_alloc(func, base_a) && is_alloc(func, base_b) {
            return DepResult::Independent;
        }
        return DepResult::Unknown;
    }

    match (index_a, index_b) {
        (None, None) => DepResult::Distance(0),
        (Some(ia), Some(ib)) => {
            let (Some(aff_a), Some(aff_b)) = (affine_at(func, l1, ia), affine_at(func, l2, ib))
            else {
                return DepResult::Unknown;
            };
            match (aff_a.iv, aff_b.iv) {
                (Some(_), Some(_)) => DepResult::Distance(aff_a.offset - aff_b.offset),
                (None, None) => {
                    if aff_a.offset == aff_b.offset {
                        DepResult::Distance(0)
                    } else {
                        DepResult::Independent
                    }
                }
                _ => DepResult::Unknown,
            }
        }
        _ => DepResult::Unknown,
    }
}

fn pointer_operand(inst: &Instruction) -> Option<ValueId> {
    match inst {
        Instruction::Load { ptr } => Some(*ptr),
        Instruction::Store { ptr, .. } => Some(*ptr),
        _ => None,
    }
}

/// Splits a pointer into (base, element index). A pointer that is not the
/// result of a single element-address computation is a scalar access; a
/// chain of them is beyond this analysis.
fn decompose(func: &Function, ptr: ValueId) -> Option<(ValueId, Option<ValueId>)> {
    match func.value_def(ptr).map(|inst| func.inst(inst)) {
        Some(Instruction::GetElementPtr { base, index }) => {
            match func.value_def(*base).map(|inst| func.inst(inst)) {
                Some(Instruction::GetElementPtr { .. }) => None,
                _ => Some((*base, Some(*index))),
            }
        }
        _ => Some((ptr, None)),
    }
}

fn is_alloc(func: &Function, value: ValueId) -> bool {
    func.value_def(value)
        .map(|inst| matches!(func.inst(inst), Instruction::Alloc { .. }))
        .unwrap_or(false)
}
