//! Loop-invariant code motion.
//!
//! For every loop in simplified form, instructions whose operands are all
//! invariant with respect to the loop are candidates for hoisting into the
//! pre-header, immediately before its terminator. A candidate moves only
//! when doing so cannot change behavior:
//!
//! - it must be free of side effects and unable to trap (division hoists
//!   only when the divisor is a non-zero constant), and
//! - its block must dominate every loop exit, or the value must have no
//!   uses outside the loop, and
//! - every in-loop operand definition must itself be hoisted ahead of it.
//!
//! Candidates are collected walking the loop body in dominator-tree
//! preorder, which keeps definitions ahead of their uses when they are
//! re-inserted in order.

use crate::pass::{FunctionPass, PreservedAnalyses};
use opal_ir::{
    BlockId, Constant, DominatorTree, Function, InstId, Instruction, Loop, LoopForest, User,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

/// The loop-invariant code motion pass.
pub struct LoopInvariantCodeMotion;

impl LoopInvariantCodeMotion {
    /// Creates a new pass instance.
    pub fn new() -> Self {
        Self
    }
}

impl Default for LoopInvariantCodeMotion {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionPass for LoopInvariantCodeMotion {
    fn name(&self) -> &str {
        "licm"
    }

    fn run(&mut self, func: &mut Function) -> PreservedAnalyses {
        let dom = DominatorTree::compute(func);
        let forest = LoopForest::compute(func, &dom);
        // Hoisting moves instructions but never rewires the CFG, so the
        // tree and the forest stay valid across loops within this run.
        // Inner loops go first: what lands in an inner pre-header is still
        // inside the outer loop and may move again.
        let loops: Vec<Loop> = forest.innermost_first().into_iter().cloned().collect();

        let mut changed = false;
        for l in &loops {
            changed |= hoist_loop(func, &dom, l);
        }
        if changed {
            PreservedAnalyses::none()
        } else {
            PreservedAnalyses::all()
        }
    }
}

fn hoist_loop(func: &mut Function, dom: &DominatorTree, l: &Loop) -> bool {
    if !l.is_simplified(func) {
        trace!(header = %l.header(), "loop is not in simplified form");
        return false;
    }
    let preheader = l.preheader(func).expect("simplified loop has a pre-header");
    let exits = l.exit_blocks(func);

    // Dominator-tree preorder keeps definitions ahead of uses.
    let mut blocks: Vec<BlockId> = l.blocks().to_vec();
    blocks.sort_by_key(|b| dom.preorder_index(*b).unwrap_or(usize::MAX));

    let mut memo: FxHashMap<InstId, bool> = FxHashMap::default();
    let mut hoisted: FxHashSet<InstId> = FxHashSet::default();
    let mut candidates: Vec<InstId> = Vec::new();

    for &block in &blocks {
        for inst in func.block_insts(block) {
            if !inst_is_invariant(func, l, inst, &mut memo) {
                continue;
            }
            trace!(inst = %func.inst(inst), "loop-invariant");
            if is_safe_to_hoist(func, dom, l, &exits, &hoisted, inst) {
                trace!(inst = %func.inst(inst), "hoisting to pre-header");
                hoisted.insert(inst);
                candidates.push(inst);
            }
        }
    }

    for &inst in &candidates {
        func.remove_from_parent(inst);
        func.insert_before_terminator(preheader, inst);
    }
    !candidates.is_empty()
}

/// An instruction is invariant if it is not a phi and every operand is
/// invariant with respect to the loop.
fn inst_is_invariant(
    func: &Function,
    l: &Loop,
    inst: InstId,
    memo: &mut FxHashMap<InstId, bool>,
) -> bool {
    if let Some(&known) = memo.get(&inst) {
        return known;
    }
    let invariant = if func.inst(inst).is_phi() {
        // A phi merges multiple reaching definitions.
        false
    } else {
        func.inst(inst)
            .operands()
            .into_iter()
            .all(|v| value_is_invariant(func, l, v, memo))
    };
    memo.insert(inst, invariant);
    invariant
}

/// Constants and arguments are invariant by definition; so is anything
/// defined outside the loop. A definition inside the loop is invariant
/// only if it is itself an invariant (non-phi) instruction.
fn value_is_invariant(
    func: &Function,
    l: &Loop,
    value: opal_ir::ValueId,
    memo: &mut FxHashMap<InstId, bool>,
) -> bool {
    let Some(def) = func.value_def(value) else {
        return true;
    };
    match func.inst_block(def) {
        Some(block) if l.contains(block) => inst_is_invariant(func, l, def, memo),
        Some(_) => true,
        // Detached definitions never occur inside a pass run.
        None => false,
    }
}

fn is_safe_to_hoist(
    func: &Function,
    dom: &DominatorTree,
    l: &Loop,
    exits: &[BlockId],
    hoisted: &FxHashSet<InstId>,
    inst: InstId,
) -> bool {
    // Side-effecting or trapping instructions stay put. Hoisting is
    // restricted to the pure computational opcodes.
    let speculatable = match func.inst(inst) {
        Instruction::Binary { op, rhs, .. } => {
            !op.can_trap()
                || matches!(func.as_const(*rhs), Some(c @ Constant::Int { .. }) if !c.is_zero())
        }
        Instruction::Cast { .. }
        | Instruction::Select { .. }
        | Instruction::GetElementPtr { .. } => true,
        _ => false,
    };
    if !speculatable {
        return false;
    }

    // Every in-loop operand definition must already be on its way to the
    // pre-header, or the move would break def-before-use.
    let operands_available = func.inst(inst).operands().into_iter().all(|v| {
        match func.value_def(v) {
            Some(def) => match func.inst_block(def) {
                Some(block) if l.contains(block) => hoisted.contains(&def),
                _ => true,
            },
            None => true,
        }
    });
    if !operands_available {
        return false;
    }

    let block = func.inst_block(inst).expect("candidate is attached");
    if exits.iter().all(|&exit| dom.dominates(block, exit)) {
        return true;
    }

    // Dead outside the loop: hoisting cannot make it visible on any path
    // where it did not already execute.
    let Some(result) = func.inst_result(inst) else {
        return false;
    };
    func.users(result).iter().all(|user| match user {
        User::Inst(u) => func
            .inst_block(*u)
            .map(|b| l.contains(b))
            .unwrap_or(false),
        User::Term(b) => l.contains(*b),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_ir::{verify_function, BinaryOp, FunctionBuilder, Terminator, Ty, ValueId};

    /// `for (i = 0; i < n; i++)` with a body built by `body_fn`; the value
    /// it returns is stored through the pointer argument each iteration.
    fn loop_with_body(
        body_fn: impl FnOnce(&mut FunctionBuilder, ValueId) -> ValueId,
    ) -> (Function, [BlockId; 5]) {
        let mut fb = FunctionBuilder::new(
            "f",
            vec![("n", Ty::I32), ("out", Ty::I32.ptr_to())],
            Ty::Void,
        );
        let n = fb.arg(0);
        let out = fb.arg(1);
        let entry = fb.block("entry");
        let header = fb.block("header");
        let body = fb.block("body");
        let latch = fb.block("latch");
        let exit = fb.block("exit");

        fb.set_block(entry);
        fb.br(header);

        fb.set_block(header);
        let zero = fb.const_int(Ty::I32, 0);
        let iv = fb.phi(vec![(entry, zero)], Ty::I32);
        let cond = fb.binary(BinaryOp::Lt, iv, n, Ty::Bool);
        fb.cond_br(cond, body, exit);

        fb.set_block(body);
        let produced = body_fn(&mut fb, iv);
        let slot = fb.gep(out, iv);
        fb.store(slot, produced);
        let one = fb.const_int(Ty::I32, 1);
        let next = fb.binary(BinaryOp::Add, iv, one, Ty::I32);
        fb.br(latch);

        fb.set_block(latch);
        fb.br(header);

        fb.set_block(exit);
        fb.ret_void();

        let mut func = fb.finish();
        let phi = func.value_def(iv).unwrap();
        func.add_phi_incoming(phi, latch, next);
        (func, [entry, header, body, latch, exit])
    }

    fn run(func: &mut Function) -> PreservedAnalyses {
        let result = LoopInvariantCodeMotion::new().run(func);
        assert_eq!(verify_function(func), Ok(()));
        result
    }

    #[test]
    fn test_hoists_invariant_multiply() {
        // %t = mul n, 4 inside the body moves to the pre-header.
        let (mut func, [entry, _, body, _, _]) = loop_with_body(|fb, _iv| {
            let four = fb.const_int(Ty::I32, 4);
            let n = fb.arg(0);
            fb.binary(BinaryOp::Mul, n, four, Ty::I32)
        });
        let body_len_before = func.block_insts(body).len();

        assert!(run(&mut func).changed());
        assert_eq!(func.block_insts(body).len(), body_len_before - 1);

        // The multiply now sits at the end of the pre-header, right before
        // its terminator.
        let pre_insts = func.block_insts(entry);
        assert_eq!(pre_insts.len(), 1);
        let (op, lhs, _) = func.binary_parts(pre_insts[0]).unwrap();
        assert_eq!(op, BinaryOp::Mul);
        assert_eq!(lhs, func.arg(0));
        assert!(matches!(
            func.block(entry).terminator(),
            Terminator::Branch(_)
        ));
    }

    #[test]
    fn test_hoists_dependent_chain_in_order() {
        // a = n + 7; b = a * 3 -- both invariant, b depends on a.
        let (mut func, [entry, ..]) = loop_with_body(|fb, _iv| {
            let n = fb.arg(0);
            let seven = fb.const_int(Ty::I32, 7);
            let a = fb.binary(BinaryOp::Add, n, seven, Ty::I32);
            let three = fb.const_int(Ty::I32, 3);
            fb.binary(BinaryOp::Mul, a, three, Ty::I32)
        });

        assert!(run(&mut func).changed());
        let pre_insts = func.block_insts(entry);
        assert_eq!(pre_insts.len(), 2);
        let (first_op, ..) = func.binary_parts(pre_insts[0]).unwrap();
        let (second_op, second_lhs, _) = func.binary_parts(pre_insts[1]).unwrap();
        assert_eq!(first_op, BinaryOp::Add);
        assert_eq!(second_op, BinaryOp::Mul);
        assert_eq!(second_lhs, func.inst_result(pre_insts[0]).unwrap());
    }

    #[test]
    fn test_variant_computation_stays() {
        // iv + n depends on the induction variable.
        let (mut func, [entry, _, body, _, _]) = loop_with_body(|fb, iv| {
            let n = fb.arg(0);
            fb.binary(BinaryOp::Add, iv, n, Ty::I32)
        });
        let body_len = func.block_insts(body).len();

        assert!(!run(&mut func).changed());
        assert_eq!(func.block_insts(body).len(), body_len);
        assert!(func.block_insts(entry).is_empty());
    }

    #[test]
    fn test_division_by_parameter_stays() {
        // n / m could trap if m is zero at runtime; the loop body might
        // never execute.
        let mut fb = FunctionBuilder::new("f", vec![("n", Ty::I32), ("m", Ty::I32)], Ty::Void);
        let n = fb.arg(0);
        let m = fb.arg(1);
        let entry = fb.block("entry");
        let header = fb.block("header");
        let body = fb.block("body");
        let latch = fb.block("latch");
        let exit = fb.block("exit");

        fb.set_block(entry);
        fb.br(header);
        fb.set_block(header);
        let zero = fb.const_int(Ty::I32, 0);
        let iv = fb.phi(vec![(entry, zero)], Ty::I32);
        let cond = fb.binary(BinaryOp::Lt, iv, n, Ty::Bool);
        fb.cond_br(cond, body, exit);
        fb.set_block(body);
        let q = fb.binary(BinaryOp::SDiv, n, m, Ty::I32);
        let one = fb.const_int(Ty::I32, 1);
        let next = fb.binary(BinaryOp::Add, iv, one, Ty::I32);
        let _sink = fb.binary(BinaryOp::Add, q, next, Ty::I32);
        fb.br(latch);
        fb.set_block(latch);
        fb.br(header);
        fb.set_block(exit);
        fb.ret_void();

        let mut func = fb.finish();
        let phi = func.value_def(iv).unwrap();
        func.add_phi_incoming(phi, latch, next);

        assert!(!run(&mut func).changed());
        assert!(func.block_insts(entry).is_empty());
    }

    #[test]
    fn test_division_by_nonzero_constant_hoists() {
        let (mut func, [entry, ..]) = loop_with_body(|fb, _iv| {
            let n = fb.arg(0);
            let three = fb.const_int(Ty::I32, 3);
            fb.binary(BinaryOp::SDiv, n, three, Ty::I32)
        });

        assert!(run(&mut func).changed());
        assert_eq!(func.block_insts(entry).len(), 1);
    }

    #[test]
    fn test_store_never_hoists() {
        // The store itself is invariant-operand but side-effecting.
        let mut fb = FunctionBuilder::new(
            "f",
            vec![("n", Ty::I32), ("out", Ty::I32.ptr_to())],
            Ty::Void,
        );
        let n = fb.arg(0);
        let out = fb.arg(1);
        let entry = fb.block("entry");
        let header = fb.block("header");
        let body = fb.block("body");
        let latch = fb.block("latch");
        let exit = fb.block("exit");

        fb.set_block(entry);
        fb.br(header);
        fb.set_block(header);
        let zero = fb.const_int(Ty::I32, 0);
        let iv = fb.phi(vec![(entry, zero)], Ty::I32);
        let cond = fb.binary(BinaryOp::Lt, iv, n, Ty::Bool);
        fb.cond_br(cond, body, exit);
        fb.set_block(body);
        fb.store(out, n);
        let one = fb.const_int(Ty::I32, 1);
        let next = fb.binary(BinaryOp::Add, iv, one, Ty::I32);
        fb.br(latch);
        fb.set_block(latch);
        fb.br(header);
        fb.set_block(exit);
        fb.ret_void();

        let mut func = fb.finish();
        let phi = func.value_def(iv).unwrap();
        func.add_phi_incoming(phi, latch, next);

        assert!(!run(&mut func).changed());
        assert_eq!(func.block_insts(body).len(), 2);
    }

    #[test]
    fn test_non_simplified_loop_declines() {
        // Two distinct predecessors enter the header: no pre-header.
        let mut fb = FunctionBuilder::new("f", vec![("c", Ty::Bool), ("n", Ty::I32)], Ty::Void);
        let c = fb.arg(0);
        let n = fb.arg(1);
        let entry = fb.block("entry");
        let side = fb.block("side");
        let header = fb.block("header");
        let body = fb.block("body");
        let exit = fb.block("exit");

        fb.set_block(entry);
        fb.cond_br(c, header, side);
        fb.set_block(side);
        fb.br(header);
        fb.set_block(header);
        fb.cond_br(c, body, exit);
        fb.set_block(body);
        let four = fb.const_int(Ty::I32, 4);
        let _t = fb.binary(BinaryOp::Mul, n, four, Ty::I32);
        let slot = fb.alloc(Ty::I32);
        fb.store(slot, _t);
        fb.br(header);
        fb.set_block(exit);
        fb.ret_void();

        let mut func = fb.finish();
        assert!(!run(&mut func).changed());
    }

    #[test]
    fn test_invariant_dead_outside_loop_hoists() {
        // The multiply's block does not dominate the exit (it sits behind
        // an inner branch), but nothing outside the loop uses it.
        let mut fb = FunctionBuilder::new(
            "f",
            vec![("n", Ty::I32), ("out", Ty::I32.ptr_to())],
            Ty::Void,
        );
        let n = fb.arg(0);
        let out = fb.arg(1);
        let entry = fb.block("entry");
        let header = fb.block("header");
        let then_bb = fb.block("then");
        let merge = fb.block("merge");
        let latch = fb.block("latch");
        let exit = fb.block("exit");

        fb.set_block(entry);
        fb.br(header);
        fb.set_block(header);
        let zero = fb.const_int(Ty::I32, 0);
        let iv = fb.phi(vec![(entry, zero)], Ty::I32);
        let cond = fb.binary(BinaryOp::Lt, iv, n, Ty::Bool);
        fb.cond_br(cond, then_bb, exit);
        fb.set_block(then_bb);
        let four = fb.const_int(Ty::I32, 4);
        let t = fb.binary(BinaryOp::Mul, n, four, Ty::I32);
        let parity = fb.binary(BinaryOp::And, iv, four, Ty::I32);
        let flag = fb.binary(BinaryOp::Eq, parity, zero, Ty::Bool);
        fb.cond_br(flag, merge, latch);
        fb.set_block(merge);
        let slot = fb.gep(out, iv);
        fb.store(slot, t);
        fb.br(latch);
        fb.set_block(latch);
        let one = fb.const_int(Ty::I32, 1);
        let next = fb.binary(BinaryOp::Add, iv, one, Ty::I32);
        fb.br(header);
        fb.set_block(exit);
        fb.ret_void();

        let mut func = fb.finish();
        let phi = func.value_def(iv).unwrap();
        func.add_phi_incoming(phi, latch, next);

        assert!(run(&mut func).changed());
        // The multiply moved; the iv-dependent and / eq stayed.
        let pre = func.block_insts(entry);
        assert_eq!(pre.len(), 1);
        assert_eq!(
            func.binary_parts(pre[0]).map(|(op, ..)| op),
            Some(BinaryOp::Mul)
        );
    }
}
