//! Loop fusion.
//!
//! Scans the top-level loops of a function in program order, keeping a
//! `leading` candidate. A following loop fuses into the leading one when
//! all four preconditions hold:
//!
//! 1. the loops are adjacent (nothing executes between them),
//! 2. they have identical symbolic trip counts,
//! 3. they are control-flow equivalent (the first dominates the second,
//!    the second post-dominates the first),
//! 4. no pair of memory accesses forms a negative-distance dependence
//!    along the fused iteration space — anything unprovable declines.
//!
//! The rewrite keeps the leading loop's header and latch: the second
//! loop's induction variable collapses into the first's, the bodies are
//! spliced back to back, the second header is detached, and the blocks it
//! leaves unreachable are dropped. A successful fusion invalidates every
//! analysis, so the scan restarts on fresh ones.

use crate::pass::{FunctionPass, PreservedAnalyses};
use opal_ir::{
    fusion_dependence, trip_count, BlockId, DepResult, DominatorTree, Function, InstId,
    Instruction, Loop, LoopForest, PostDominatorTree, User,
};
use rustc_hash::FxHashSet;
use tracing::trace;

/// The loop fusion pass.
pub struct LoopFusion;

impl LoopFusion {
    /// Creates a new pass instance.
    pub fn new() -> Self {
        Self
    }
}

impl Default for LoopFusion {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionPass for LoopFusion {
    fn name(&self) -> &str {
        "loop-fusion"
    }

    fn run(&mut self, func: &mut Function) -> PreservedAnalyses {
        let mut changed = false;
        // Each successful fusion rewires the CFG; rescan on fresh analyses
        // until no pair fuses. The loop count shrinks every round.
        while fuse_one_pair(func) {
            changed = true;
        }
        if changed {
            PreservedAnalyses::none()
        } else {
            PreservedAnalyses::all()
        }
    }
}

fn fuse_one_pair(func: &mut Function) -> bool {
    let dom = DominatorTree::compute(func);
    let pdom = PostDominatorTree::compute(func);
    let forest = LoopForest::compute(func, &dom);
    let tops: Vec<Loop> = forest.top_level().into_iter().cloned().collect();

    let mut leading: Option<Loop> = None;
    for cand in tops {
        let Some(lead) = leading.take() else {
            leading = Some(cand);
            continue;
        };
        if !is_eligible(func, &cand) || !is_eligible(func, &lead) {
            leading = Some(cand);
            continue;
        }
        if preconditions_hold(func, &dom, &pdom, &lead, &cand) {
            fuse(func, &lead, &cand);
            func.eliminate_unreachable_blocks();
            return true;
        }
        leading = Some(cand);
    }
    false
}

/// A loop qualifies for fusion only with its full complement of structure.
fn is_eligible(func: &Function, l: &Loop) -> bool {
    if l.preheader(func).is_none()
        || l.latch().is_none()
        || l.exiting_block(func).is_none()
        || l.exit_block(func).is_none()
    {
        trace!(header = %l.header(), "loop is missing required structure");
        return false;
    }
    if !l.is_simplified(func) {
        trace!(header = %l.header(), "loop is not in simplified form");
        return false;
    }
    true
}

/// The block control enters the loop through: the guard when guarded,
/// otherwise the pre-header.
fn entry_block(func: &Function, l: &Loop) -> BlockId {
    l.guard(func)
        .unwrap_or_else(|| l.preheader(func).expect("eligible loop has a pre-header"))
}

fn preconditions_hold(
    func: &Function,
    dom: &DominatorTree,
    pdom: &PostDominatorTree,
    lead: &Loop,
    cand: &Loop,
) -> bool {
    if !are_adjacent(func, lead, cand) {
        trace!(lead = %lead.header(), cand = %cand.header(), "loops are not adjacent");
        return false;
    }

    let (Some(t1), Some(t2)) = (trip_count(func, lead), trip_count(func, cand)) else {
        trace!(lead = %lead.header(), cand = %cand.header(), "trip count unavailable");
        return false;
    };
    if t1 != t2 {
        trace!(lead = %lead.header(), cand = %cand.header(), "trip counts differ");
        return false;
    }

    let e1 = entry_block(func, lead);
    let e2 = entry_block(func, cand);
    if !dom.dominates(e1, e2) || !pdom.dominates(e2, e1) {
        trace!(lead = %lead.header(), cand = %cand.header(), "loops are not control-flow equivalent");
        return false;
    }

    if !no_negative_dependence(func, lead, cand) {
        trace!(lead = %lead.header(), cand = %cand.header(), "possible negative-distance dependence");
        return false;
    }

    fusible_shape(func, dom, lead, cand)
}

/// Adjacency: for a guarded leading loop, one of the guard's successors is
/// the second loop's entry; otherwise the first loop's exit block is.
fn are_adjacent(func: &Function, lead: &Loop, cand: &Loop) -> bool {
    let e2 = entry_block(func, cand);
    match lead.guard(func) {
        Some(guard) => func.successors(guard).contains(&e2),
        None => lead.exit_block(func) == Some(e2),
    }
}

/// Rejects any pair of memory accesses (at least one writing) whose fused
/// dependence distance is negative or unprovable. A call in either body
/// declines outright: it may touch anything.
fn no_negative_dependence(func: &Function, lead: &Loop, cand: &Loop) -> bool {
    let collect = |l: &Loop| -> Option<Vec<(InstId, bool)>> {
        let mut accesses = Vec::new();
        for &block in l.blocks() {
            for inst in func.block_insts(block) {
                match func.inst(inst) {
                    Instruction::Call { .. } => return None,
                    Instruction::Load { .. } => accesses.push((inst, false)),
                    Instruction::Store { .. } => accesses.push((inst, true)),
                    _ => {}
                }
            }
        }
        Some(accesses)
    };
    let (Some(first), Some(second)) = (collect(lead), collect(cand)) else {
        return false;
    };

    for &(a, a_writes) in &first {
        for &(b, b_writes) in &second {
            if !a_writes && !b_writes {
                continue;
            }
            match fusion_dependence(func, lead, cand, a, b) {
                DepResult::Independent => {}
                DepResult::Distance(d) if d >= 0 => {}
                other => {
                    trace!(?other, "dependence check failed");
                    return false;
                }
            }
        }
    }
    true
}

/// Structural guards that keep the rewrite SSA-clean. Anything outside
/// this shape declines; the pair is simply not fused.
fn fusible_shape(func: &Function, dom: &DominatorTree, lead: &Loop, cand: &Loop) -> bool {
    // A guarded leading loop keeps its guard's bypass edge into the second
    // loop's skeleton, which would stay reachable half-destroyed.
    if lead.guard(func).is_some() {
        trace!(lead = %lead.header(), "leading loop is guarded");
        return false;
    }

    if lead.canonical_induction_variable(func).is_none() {
        trace!(lead = %lead.header(), "missing canonical induction variable");
        return false;
    }
    let Some(iv2) = cand.canonical_induction_variable(func) else {
        trace!(cand = %cand.header(), "missing canonical induction variable");
        return false;
    };

    let lt1 = lead.latch().expect("eligible loop has a latch");
    let lt2 = cand.latch().expect("eligible loop has a latch");
    let h2 = cand.header();
    let Some(body2) = body_entry(func, cand) else {
        return false;
    };
    if body2 == lt2 {
        // Empty body: nothing to splice.
        return false;
    }
    if has_phis(func, body2) || has_phis(func, lt1) {
        trace!("splice points carry phis");
        return false;
    }

    // Exit-block phis survive with the kept header as their predecessor,
    // so their incoming values must dominate it.
    let x2 = cand.exit_block(func).expect("eligible loop has an exit");
    let h1 = lead.header();
    for inst in func.block_insts(x2) {
        let Instruction::Phi { incoming } = func.inst(inst) else {
            break;
        };
        for (pred, value) in incoming {
            if *pred != h2 {
                continue;
            }
            if let Some(def) = func.value_def(*value) {
                let dominates = func
                    .inst_block(def)
                    .map(|b| dom.dominates(b, h1))
                    .unwrap_or(false);
                if !dominates {
                    trace!("exit phi value defined inside the second loop");
                    return false;
                }
            }
        }
    }

    // The discarded skeleton (second header and latch) must define nothing
    // that survives fusion, apart from the unified induction variable.
    let mut skeleton: FxHashSet<InstId> = FxHashSet::default();
    skeleton.extend(func.block_insts(h2));
    skeleton.extend(func.block_insts(lt2));
    for &inst in &skeleton {
        if inst == iv2 {
            continue;
        }
        let Some(result) = func.inst_result(inst) else {
            continue;
        };
        for user in func.users(result) {
            let internal = match user {
                User::Inst(u) => skeleton.contains(u),
                User::Term(b) => *b == h2 || *b == lt2,
            };
            if !internal {
                trace!("second header defines a value that outlives fusion");
                return false;
            }
        }
    }
    true
}

/// The in-loop successor of the loop header.
fn body_entry(func: &Function, l: &Loop) -> Option<BlockId> {
    func.successors(l.header())
        .into_iter()
        .find(|succ| l.contains(*succ))
}

fn has_phis(func: &Function, block: BlockId) -> bool {
    func.block_insts(block)
        .first()
        .map(|&inst| func.inst(inst).is_phi())
        .unwrap_or(false)
}

/// The fusion rewrite. Preconditions have all been checked; from here on
/// the CFG is edited unconditionally and ends well-formed.
fn fuse(func: &mut Function, lead: &Loop, cand: &Loop) {
    let h1 = lead.header();
    let lt1 = lead.latch().expect("checked");
    let h2 = cand.header();
    let lt2 = cand.latch().expect("checked");
    let body2 = body_entry(func, cand).expect("checked");
    let e2 = entry_block(func, cand);
    let x2 = cand.exit_block(func).expect("checked");
    let iv1 = lead.canonical_induction_variable(func).expect("checked");
    let iv2 = cand.canonical_induction_variable(func).expect("checked");
    let iv1_val = func.inst_result(iv1).expect("phis produce a value");
    let iv2_val = func.inst_result(iv2).expect("phis produce a value");

    trace!(lead = %h1, cand = %h2, "fusing");

    // Both loops walk the same iteration space; the second induction
    // variable collapses into the first.
    func.replace_all_uses_with(iv2_val, iv1_val);
    func.erase_from_parent(iv2);

    // The kept header's exit edge jumps straight past the second loop.
    func.replace_successor(h1, e2, x2);
    func.replace_phi_incoming_block(x2, h2, h1);

    // First body falls through into the second.
    for pred in func.predecessors(lt1) {
        func.replace_successor(pred, lt1, body2);
    }

    // Second body closes the iteration through the kept latch.
    for pred in func.predecessors(lt2) {
        func.replace_successor(pred, lt2, lt1);
    }

    // Detach the second header; it and its latch become unreachable but
    // stay well-formed until the cleanup sweep drops them.
    func.replace_successor(h2, body2, lt2);
}
