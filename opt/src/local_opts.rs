//! Local peephole optimizations.
//!
//! A block-scoped pass over straight-line code. Each binary instruction is
//! dispatched by opcode to a prioritized list of rewrites, first match
//! wins:
//!
//! - **Add**: algebraic identity (`x + 0`), then pair cancellation
//! - **Sub**: pair cancellation
//! - **Mul**: algebraic identity (`x * 1`), then strength reduction
//! - **SDiv / UDiv**: strength reduction
//!
//! A rewrite never erases the instruction it matched; it redirects the
//! uses and leaves the body for the dead-code sweep that closes out each
//! block. New instructions are inserted immediately after the one being
//! rewritten and are not revisited within the same sweep.

use crate::pass::{FunctionPass, PreservedAnalyses};
use opal_ir::{BinaryOp, Constant, Function, InstId, Instruction, Ty, User, ValueId};
use tracing::trace;

/// The block-local peephole pass.
pub struct LocalOpts;

impl LocalOpts {
    /// Creates a new pass instance.
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalOpts {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionPass for LocalOpts {
    fn name(&self) -> &str {
        "local-opts"
    }

    fn run(&mut self, func: &mut Function) -> PreservedAnalyses {
        let mut changed = false;
        let blocks: Vec<_> = func.block_ids().collect();
        for block in blocks {
            changed |= run_on_block(func, block);
        }
        if changed {
            PreservedAnalyses::none()
        } else {
            PreservedAnalyses::all()
        }
    }
}

fn run_on_block(func: &mut Function, block: opal_ir::BlockId) -> bool {
    let mut changed = false;

    // Snapshot the block: rewrites append new instructions after the one
    // being processed, and those must not be revisited this sweep.
    for inst in func.block_insts(block) {
        let Some((op, _, _)) = func.binary_parts(inst) else {
            continue;
        };
        let fired = match op {
            BinaryOp::Add => algebraic_identity(func, inst, 0) || pair_cancellation(func, inst),
            BinaryOp::Sub => pair_cancellation(func, inst),
            BinaryOp::Mul => algebraic_identity(func, inst, 1) || strength_reduce_mul(func, inst),
            BinaryOp::SDiv | BinaryOp::UDiv => strength_reduce_div(func, inst),
            _ => false,
        };
        changed |= fired;
    }

    changed | sweep_dead(func, block)
}

/// Integer constant operand equal to `value`, if any.
fn int_const_equal(func: &Function, operand: ValueId, value: i128) -> bool {
    matches!(func.as_const(operand), Some(c @ Constant::Int { .. }) if c.value() == value)
}

/// `x + 0` and `x * 1` collapse to `x`.
fn algebraic_identity(func: &mut Function, inst: InstId, identity: i128) -> bool {
    let (_, lhs, rhs) = func.binary_parts(inst).unwrap();
    let result = func.inst_result(inst).unwrap();

    // The right operand wins when both qualify.
    let kept = if int_const_equal(func, rhs, identity) {
        lhs
    } else if int_const_equal(func, lhs, identity) {
        rhs
    } else {
        trace!(rewrite = "algebraic-identity", inst = %func.inst(inst), "no operand is the identity");
        return false;
    };

    func.replace_all_uses_with(result, kept);
    trace!(rewrite = "algebraic-identity", inst = %func.inst(inst), "fired");
    true
}

/// Multiplication by a power of two, or one off a power of two, becomes a
/// shift (plus an adjusting add or sub).
fn strength_reduce_mul(func: &mut Function, inst: InstId) -> bool {
    let (_, lhs, rhs) = func.binary_parts(inst).unwrap();
    let result = func.inst_result(inst).unwrap();

    let qualifies = |c: &Constant| {
        matches!(c, Constant::Int { .. })
            && c.is_non_negative()
            && (c.is_power_of_two() || close_to_pow2(c))
    };

    // The right operand wins when both qualify.
    let (factor, c) = if let Some(c) = func.as_const(rhs).filter(|c| qualifies(c)) {
        (lhs, c.clone())
    } else if let Some(c) = func.as_const(lhs).filter(|c| qualifies(c)) {
        (rhs, c.clone())
    } else {
        trace!(
            rewrite = "strength-reduction",
            inst = %func.inst(inst),
            "no operand is a power of two or close to one"
        );
        return false;
    };

    let ty = func.value_ty(result).clone();
    if let Some(k) = c.exact_log2() {
        // x * 2^k  ->  x << k
        let shift = func.const_int(ty.clone(), k as i128);
        let shl = func.insert_after(
            inst,
            Instruction::Binary {
                op: BinaryOp::Shl,
                lhs: factor,
                rhs: shift,
            },
            ty,
        );
        let shl_val = func.inst_result(shl).unwrap();
        func.replace_all_uses_with(result, shl_val);
    } else if let Some(k) = c.minus_one().exact_log2() {
        // x * (2^k + 1)  ->  (x << k) + x
        emit_shift_adjust(func, inst, factor, ty, k, BinaryOp::Add, result);
    } else if let Some(k) = c.plus_one().exact_log2() {
        // x * (2^k - 1)  ->  (x << k) - x
        emit_shift_adjust(func, inst, factor, ty, k, BinaryOp::Sub, result);
    } else {
        return false;
    }
    trace!(rewrite = "strength-reduction", inst = %func.inst(inst), "fired");
    true
}

/// `C > 2` with a power of two one step away in either direction.
fn close_to_pow2(c: &Constant) -> bool {
    c.value() > 2 && (c.minus_one().is_power_of_two() || c.plus_one().is_power_of_two())
}

fn emit_shift_adjust(
    func: &mut Function,
    inst: InstId,
    factor: ValueId,
    ty: Ty,
    k: u32,
    adjust: BinaryOp,
    result: ValueId,
) {
    let shift = func.const_int(ty.clone(), k as i128);
    let shl = func.insert_after(
        inst,
        Instruction::Binary {
            op: BinaryOp::Shl,
            lhs: factor,
            rhs: shift,
        },
        ty.clone(),
    );
    let shl_val = func.inst_result(shl).unwrap();
    let adj = func.insert_after(
        shl,
        Instruction::Binary {
            op: adjust,
            lhs: shl_val,
            rhs: factor,
        },
        ty,
    );
    let adj_val = func.inst_result(adj).unwrap();
    func.replace_all_uses_with(result, adj_val);
}

/// Division by a power of two becomes a right shift: arithmetic for SDiv,
/// logical for UDiv. Non-power-of-two divisors are left alone.
fn strength_reduce_div(func: &mut Function, inst: InstId) -> bool {
    let (op, lhs, rhs) = func.binary_parts(inst).unwrap();
    let result = func.inst_result(inst).unwrap();

    // Division is not commutative; only a right-hand constant qualifies.
    let qualifies = |c: &&Constant| {
        matches!(c, Constant::Int { .. }) && c.is_non_negative() && c.is_power_of_two()
    };
    let Some(c) = func.as_const(rhs).filter(qualifies) else {
        trace!(
            rewrite = "strength-reduction",
            inst = %func.inst(inst),
            "divisor is not a power of two"
        );
        return false;
    };
    let k = c.exact_log2().unwrap();

    let shift_op = match op {
        BinaryOp::SDiv => BinaryOp::AShr,
        _ => BinaryOp::LShr,
    };
    let ty = func.value_ty(result).clone();
    let shift = func.const_int(ty.clone(), k as i128);
    let shr = func.insert_after(
        inst,
        Instruction::Binary {
            op: shift_op,
            lhs,
            rhs: shift,
        },
        ty,
    );
    let shr_val = func.inst_result(shr).unwrap();
    func.replace_all_uses_with(result, shr_val);
    trace!(rewrite = "strength-reduction", inst = %func.inst(inst), "fired");
    true
}

/// Given `i = x + C` (or `x - C`), every same-block user of the form
/// `u = i - C` (or `i + C`) with the identical constant collapses to `x`.
///
/// Neither `i` nor `u` is erased here; once unused they fall to the sweep.
/// `u = C - i` never matches: subtraction does not commute.
fn pair_cancellation(func: &mut Function, inst: InstId) -> bool {
    let (op, lhs, rhs) = func.binary_parts(inst).unwrap();
    let result = func.inst_result(inst).unwrap();
    let block = func.inst_block(inst);

    let (x, c) = match op {
        BinaryOp::Add => {
            // The right operand wins when both are constants.
            if matches!(func.as_const(rhs), Some(Constant::Int { .. })) {
                (lhs, rhs)
            } else if matches!(func.as_const(lhs), Some(Constant::Int { .. })) {
                (rhs, lhs)
            } else {
                trace!(rewrite = "pair-cancellation", inst = %func.inst(inst), "no constant operand");
                return false;
            }
        }
        BinaryOp::Sub => {
            if matches!(func.as_const(rhs), Some(Constant::Int { .. })) {
                (lhs, rhs)
            } else {
                trace!(rewrite = "pair-cancellation", inst = %func.inst(inst), "no constant right operand");
                return false;
            }
        }
        _ => return false,
    };
    let constant = func.as_const(c).unwrap().clone();
    let opposite = match op {
        BinaryOp::Add => BinaryOp::Sub,
        _ => BinaryOp::Add,
    };

    // Snapshot the users: the rewrite below edits use lists.
    let mut users: Vec<InstId> = Vec::new();
    for user in func.users(result) {
        if let User::Inst(id) = user {
            if !users.contains(id) {
                users.push(*id);
            }
        }
    }

    let mut fired = false;
    for user in users {
        // The pass is block-scoped: a matching user in another block is
        // left for that block's own sweep to see, and skipped here.
        if func.inst_block(user) != block {
            continue;
        }
        let Some((user_op, user_lhs, user_rhs)) = func.binary_parts(user) else {
            continue;
        };
        if user_op != opposite {
            continue;
        }
        let matches_form = if opposite == BinaryOp::Sub {
            // Only `u = i - C`; `u = C - i` is a different value.
            user_lhs == result && func.as_const(user_rhs) == Some(&constant)
        } else {
            (user_lhs == result && func.as_const(user_rhs) == Some(&constant))
                || (user_rhs == result && func.as_const(user_lhs) == Some(&constant))
        };
        if !matches_form {
            continue;
        }
        let user_result = func.inst_result(user).unwrap();
        func.replace_all_uses_with(user_result, x);
        trace!(rewrite = "pair-cancellation", inst = %func.inst(user), "fired");
        fired = true;
    }
    if !fired {
        trace!(rewrite = "pair-cancellation", inst = %func.inst(inst), "no cancelling user");
    }
    fired
}

/// Erases the block's unused binary instructions. Terminators, phis,
/// calls, loads, and stores are never touched. The walk is in reverse so
/// a dead user releases its operands within the same sweep.
fn sweep_dead(func: &mut Function, block: opal_ir::BlockId) -> bool {
    let mut changed = false;
    for inst in func.block_insts(block).into_iter().rev() {
        if func.binary_parts(inst).is_none() {
            continue;
        }
        let Some(result) = func.inst_result(inst) else {
            continue;
        };
        if func.users(result).is_empty() {
            trace!(rewrite = "dce", inst = %func.inst(inst), "erased");
            func.erase_from_parent(inst);
            changed = true;
        }
    }
    changed
}
