//! Natural loop discovery and per-loop queries.
//!
//! A back edge is an edge whose target dominates its source; each target is
//! a loop header, and back edges sharing a header are merged into one loop.
//! The loop body is everything that reaches a latch without passing through
//! the header.
//!
//! The forest is a read-only snapshot. Passes that change the CFG recompute
//! it before trusting any of these queries again.

use crate::dom::DominatorTree;
use crate::function::Function;
use crate::instruction::{BinaryOp, Instruction};
use crate::terminator::Terminator;
use crate::values::{BlockId, InstId};
use rustc_hash::{FxHashMap, FxHashSet};

/// A natural loop with a single header.
#[derive(Debug, Clone)]
pub struct Loop {
    header: BlockId,
    latches: Vec<BlockId>,
    blocks: Vec<BlockId>,
    block_set: FxHashSet<BlockId>,
}

impl Loop {
    /// The loop header.
    pub fn header(&self) -> BlockId {
        self.header
    }

    /// The single latch, if the loop has exactly one back edge.
    pub fn latch(&self) -> Option<BlockId> {
        match self.latches.as_slice() {
            [latch] => Some(*latch),
            _ => None,
        }
    }

    /// All blocks of the loop; the header comes first.
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Returns true if the block belongs to the loop.
    pub fn contains(&self, block: BlockId) -> bool {
        self.block_set.contains(&block)
    }

    /// The pre-header: the unique out-of-loop predecessor of the header
    /// whose only successor is the header.
    pub fn preheader(&self, func: &Function) -> Option<BlockId> {
        let outside: Vec<BlockId> = func
            .predecessors(self.header)
            .into_iter()
            .filter(|p| !self.contains(*p))
            .collect();
        match outside.as_slice() {
            [pred] if func.successors(*pred) == [self.header] => Some(*pred),
            _ => None,
        }
    }

    /// The guard: the unique predecessor of the pre-header, when it is a
    /// conditional branch with the pre-header on one side and the post-loop
    /// region on the other.
    pub fn guard(&self, func: &Function) -> Option<BlockId> {
        let preheader = self.preheader(func)?;
        let preds = func.predecessors(preheader);
        let [guard] = preds.as_slice() else {
            return None;
        };
        match func.block(*guard).terminator() {
            Terminator::CondBranch {
                then_block,
                else_block,
                ..
            } if (*then_block == preheader) != (*else_block == preheader) => Some(*guard),
            _ => None,
        }
    }

    /// The single in-loop block with an edge out of the loop, if unique.
    pub fn exiting_block(&self, func: &Function) -> Option<BlockId> {
        let mut exiting = None;
        for &block in &self.blocks {
            if func
                .successors(block)
                .iter()
                .any(|succ| !self.contains(*succ))
            {
                if exiting.is_some() {
                    return None;
                }
                exiting = Some(block);
            }
        }
        exiting
    }

    /// The distinct blocks outside the loop that loop blocks branch to.
    pub fn exit_blocks(&self, func: &Function) -> Vec<BlockId> {
        let mut exits = Vec::new();
        for &block in &self.blocks {
            for succ in func.successors(block) {
                if !self.contains(succ) && !exits.contains(&succ) {
                    exits.push(succ);
                }
            }
        }
        exits
    }

    /// The single exit block, if unique.
    pub fn exit_block(&self, func: &Function) -> Option<BlockId> {
        match self.exit_blocks(func).as_slice() {
            [exit] => Some(*exit),
            _ => None,
        }
    }

    /// Simplified form: a pre-header exists, there is a single latch, and
    /// every exit block is dedicated (all its predecessors are in the loop).
    pub fn is_simplified(&self, func: &Function) -> bool {
        if self.preheader(func).is_none() || self.latch().is_none() {
            return false;
        }
        self.exit_blocks(func).iter().all(|&exit| {
            func.predecessors(exit)
                .iter()
                .all(|pred| self.contains(*pred))
        })
    }

    /// The canonical induction variable: a header phi that starts at zero
    /// from the pre-header and steps by one through the latch.
    pub fn canonical_induction_variable(&self, func: &Function) -> Option<InstId> {
        let preheader = self.preheader(func)?;
        let latch = self.latch()?;
        for id in func.block_insts(self.header) {
            let Instruction::Phi { incoming } = func.inst(id) else {
                // Phis sit at the head of the block.
                break;
            };
            if incoming.len() != 2 {
                continue;
            }
            let phi_value = func.inst_result(id)?;
            let init = incoming.iter().find(|(b, _)| *b == preheader).map(|(_, v)| *v);
            let step = incoming.iter().find(|(b, _)| *b == latch).map(|(_, v)| *v);
            let (Some(init), Some(step)) = (init, step) else {
                continue;
            };
            if !func.as_const(init).is_some_and(|c| c.is_zero()) {
                continue;
            }
            let Some(step_inst) = func.value_def(step) else {
                continue;
            };
            if let Instruction::Binary {
                op: BinaryOp::Add,
                lhs,
                rhs,
            } = func.inst(step_inst)
            {
                let lhs_is_phi = *lhs == phi_value;
                let rhs_is_phi = *rhs == phi_value;
                let one = |v| func.as_const(v).is_some_and(|c| c.is_one());
                if (lhs_is_phi && one(*rhs)) || (rhs_is_phi && one(*lhs)) {
                    return Some(id);
                }
            }
        }
        None
    }
}

/// All natural loops of a function.
#[derive(Debug)]
pub struct LoopForest {
    loops: Vec<Loop>,
}

impl LoopForest {
    /// Discovers the loops of a function.
    pub fn compute(func: &Function, dom: &DominatorTree) -> Self {
        let mut latches_by_header: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
        for block in func.block_ids() {
            for succ in func.successors(block) {
                if dom.dominates(succ, block) {
                    latches_by_header.entry(succ).or_default().push(block);
                }
            }
        }

        let mut headers: Vec<BlockId> = latches_by_header.keys().copied().collect();
        headers.sort();

        let mut loops = Vec::new();
        for header in headers {
            let latches = latches_by_header.remove(&header).unwrap();
            let mut block_set = FxHashSet::default();
            let mut blocks = vec![header];
            block_set.insert(header);
            let mut worklist: Vec<BlockId> = Vec::new();
            for &latch in &latches {
                if block_set.insert(latch) {
                    blocks.push(latch);
                    worklist.push(latch);
                }
            }
            while let Some(block) = worklist.pop() {
                for pred in func.predecessors(block) {
                    if block_set.insert(pred) {
                        blocks.push(pred);
                        worklist.push(pred);
                    }
                }
            }
            loops.push(Loop {
                header,
                latches,
                blocks,
                block_set,
            });
        }
        Self { loops }
    }

    /// All loops, in header program order.
    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    /// Top-level loops (not contained in any other loop), in program order.
    pub fn top_level(&self) -> Vec<&Loop> {
        self.loops
            .iter()
            .filter(|l| {
                !self
                    .loops
                    .iter()
                    .any(|outer| outer.header() != l.header() && outer.contains(l.header()))
            })
            .collect()
    }

    /// All loops ordered innermost first (fewest blocks first).
    pub fn innermost_first(&self) -> Vec<&Loop> {
        let mut loops: Vec<&Loop> = self.loops.iter().collect();
        loops.sort_by_key(|l| l.blocks().len());
        loops
    }
}
