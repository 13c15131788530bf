//! IR invariant checker.
//!
//! Verifies the structural invariants every pass must preserve: one
//! terminator per block, phis grouped at the block head and agreeing with
//! the predecessors, definitions dominating their uses, and the derived
//! use index agreeing with the operand graph. Valid IR passes cleanly; a
//! violation is a bug in whatever produced or transformed the function.

use crate::dom::DominatorTree;
use crate::function::Function;
use crate::instruction::Instruction;
use crate::values::{BlockId, InstId, User, ValueId};
use rustc_hash::FxHashMap;
use thiserror::Error;

/// A structural invariant violation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("function has no entry block")]
    NoEntryBlock,

    #[error("block {0} is not terminated")]
    UnterminatedBlock(BlockId),

    #[error("phi {inst} appears after a non-phi instruction in {block}")]
    PhiNotAtHead { inst: InstId, block: BlockId },

    #[error("phi {inst} incoming blocks do not match the predecessors of {block}")]
    PhiPredecessorMismatch { inst: InstId, block: BlockId },

    #[error("{user:?} references the erased instruction behind {value}")]
    UseOfErasedValue { value: ValueId, user: User },

    #[error("{user:?} references detached instruction {inst}")]
    UseOfDetachedValue { inst: InstId, user: User },

    #[error("definition of {value} does not dominate its use in {user:?}")]
    DominanceViolation { value: ValueId, user: User },

    #[error("use list of {value} disagrees with the operand graph")]
    UseListMismatch { value: ValueId },
}

/// Verifies a function, returning the first violation found.
pub fn verify_function(func: &Function) -> Result<(), VerifyError> {
    if func.entry_block().is_none() {
        return Err(VerifyError::NoEntryBlock);
    }
    let dom = DominatorTree::compute(func);

    // Definition sites of attached instructions.
    let mut def_site: FxHashMap<InstId, (BlockId, usize)> = FxHashMap::default();
    for block in func.block_ids() {
        for (index, &inst) in func.block(block).insts().iter().enumerate() {
            def_site.insert(inst, (block, index));
        }
    }

    for block in func.block_ids() {
        if !func.block(block).is_terminated() {
            return Err(VerifyError::UnterminatedBlock(block));
        }

        let insts = func.block_insts(block);
        let mut seen_non_phi = false;
        for (index, &inst) in insts.iter().enumerate() {
            match func.inst(inst) {
                Instruction::Phi { incoming } => {
                    if seen_non_phi {
                        return Err(VerifyError::PhiNotAtHead { inst, block });
                    }
                    let mut incoming_blocks: Vec<BlockId> =
                        incoming.iter().map(|(b, _)| *b).collect();
                    let mut preds = func.predecessors(block);
                    incoming_blocks.sort();
                    preds.sort();
                    if incoming_blocks != preds {
                        return Err(VerifyError::PhiPredecessorMismatch { inst, block });
                    }
                    for (pred, value) in incoming {
                        check_use(func, &dom, &def_site, *value, User::Inst(inst), UseSite::BlockEnd(*pred))?;
                    }
                }
                other => {
                    seen_non_phi = true;
                    let mut result = Ok(());
                    other.for_each_operand(|value| {
                        if result.is_ok() {
                            result = check_use(
                                func,
                                &dom,
                                &def_site,
                                value,
                                User::Inst(inst),
                                UseSite::At(block, index),
                            );
                        }
                    });
                    result?;
                }
            }
        }

        for value in func.block(block).terminator().operands() {
            check_use(
                func,
                &dom,
                &def_site,
                value,
                User::Term(block),
                UseSite::BlockEnd(block),
            )?;
        }
    }

    check_use_lists(func)
}

/// Where a use happens, for dominance purposes.
enum UseSite {
    /// At a given instruction position.
    At(BlockId, usize),
    /// At the very end of a block (terminator operands, phi edges).
    BlockEnd(BlockId),
}

fn check_use(
    func: &Function,
    dom: &DominatorTree,
    def_site: &FxHashMap<InstId, (BlockId, usize)>,
    value: ValueId,
    user: User,
    site: UseSite,
) -> Result<(), VerifyError> {
    let Some(def_inst) = func.value_def(value) else {
        // Constants and parameters dominate everything.
        return Ok(());
    };
    if func.inst_is_erased(def_inst) {
        return Err(VerifyError::UseOfErasedValue { value, user });
    }
    let Some(&(def_block, def_index)) = def_site.get(&def_inst) else {
        return Err(VerifyError::UseOfDetachedValue {
            inst: def_inst,
            user,
        });
    };

    let dominates = match site {
        UseSite::At(block, index) => {
            if def_block == block {
                def_index < index
            } else {
                dom.dominates(def_block, block)
            }
        }
        UseSite::BlockEnd(block) => dom.dominates(def_block, block),
    };
    if !dominates {
        return Err(VerifyError::DominanceViolation { value, user });
    }
    Ok(())
}

fn check_use_lists(func: &Function) -> Result<(), VerifyError> {
    // Expected edges from the operand graph of attached code.
    let mut expected: FxHashMap<ValueId, Vec<User>> = FxHashMap::default();
    for block in func.block_ids() {
        for &inst in func.block(block).insts() {
            func.inst(inst).for_each_operand(|value| {
                expected.entry(value).or_default().push(User::Inst(inst));
            });
        }
        for value in func.block(block).terminator().operands() {
            expected.entry(value).or_default().push(User::Term(block));
        }
    }

    for value in func.value_ids() {
        let mut stored: Vec<User> = func
            .users(value)
            .iter()
            .copied()
            .filter(|user| match user {
                // Detached (not erased) instructions keep their operand
                // edges without appearing in any block; an edge from an
                // erased instruction is stale and must mismatch.
                User::Inst(inst) => {
                    func.inst_block(*inst).is_some() || func.inst_is_erased(*inst)
                }
                User::Term(_) => true,
            })
            .collect();
        let mut want = expected.remove(&value).unwrap_or_default();
        stored.sort_by_key(user_sort_key);
        want.sort_by_key(user_sort_key);
        if stored != want {
            return Err(VerifyError::UseListMismatch { value });
        }
    }
    Ok(())
}

fn user_sort_key(user: &User) -> (u8, u32) {
    match user {
        User::Inst(inst) => (0, inst.0),
        User::Term(block) => (1, block.0),
    }
}
