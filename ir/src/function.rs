//! Functions, basic blocks, and the rewrite API for Opal IR.
//!
//! A [`Function`] owns three arenas: the value table, the instruction arena,
//! and the block list. Blocks and operand edges are indices into the arenas,
//! and the per-value user lists are a derived reverse index maintained
//! incrementally by every mutating operation. The use-def graph is cyclic
//! (phis close the back edges), so nothing here hands out owning references;
//! identities are ids and the arena is the single owner.
//!
//! Mutation goes through a narrow API: create and insert instructions,
//! replace all uses of a value, unlink or erase an instruction, rewrite a
//! terminator successor. Erasing an instruction whose value is still
//! referenced is a programmer error and panics.

use crate::instruction::{BinaryOp, Instruction};
use crate::terminator::Terminator;
use crate::types::Ty;
use crate::values::{BlockId, Constant, InstId, User, ValueData, ValueId, ValueKind};
use rustc_hash::FxHashMap;
use std::fmt;

/// A parameter of a function.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    /// The name of the parameter.
    pub name: String,
    /// The type of the parameter.
    pub ty: Ty,
    /// The value ID bound to this parameter.
    pub value: ValueId,
}

/// One slot of the instruction arena.
#[derive(Debug, Clone)]
struct InstSlot {
    inst: Instruction,
    result: Option<ValueId>,
    block: Option<BlockId>,
    erased: bool,
}

/// A basic block: an ordered run of instructions plus one terminator.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// The unique ID of this block.
    pub id: BlockId,
    /// The name of this block (for printing).
    pub name: Option<String>,
    insts: Vec<InstId>,
    terminator: Terminator,
}

impl BasicBlock {
    fn new(id: BlockId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            insts: Vec::new(),
            terminator: Terminator::Unreachable,
        }
    }

    /// The instructions of this block, in program order.
    pub fn insts(&self) -> &[InstId] {
        &self.insts
    }

    /// The terminator that ends this block.
    pub fn terminator(&self) -> &Terminator {
        &self.terminator
    }

    /// Returns true once a real terminator has been set.
    pub fn is_terminated(&self) -> bool {
        !matches!(self.terminator, Terminator::Unreachable)
    }

    /// Returns all successor block IDs.
    pub fn successors(&self) -> Vec<BlockId> {
        self.terminator.successors()
    }
}

/// A function in the IR.
#[derive(Debug, Clone)]
pub struct Function {
    /// The name of the function.
    pub name: String,
    /// The return type of the function.
    pub return_ty: Ty,
    params: Vec<Param>,
    blocks: Vec<Option<BasicBlock>>,
    values: Vec<ValueData>,
    insts: Vec<InstSlot>,
    const_cache: FxHashMap<Constant, ValueId>,
}

impl Function {
    /// Creates a new function with the given name and signature.
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        params: impl IntoIterator<Item = (S, Ty)>,
        return_ty: Ty,
    ) -> Self {
        let mut func = Self {
            name: name.into(),
            return_ty,
            params: Vec::new(),
            blocks: Vec::new(),
            values: Vec::new(),
            insts: Vec::new(),
            const_cache: FxHashMap::default(),
        };
        for (index, (name, ty)) in params.into_iter().enumerate() {
            let value = func.alloc_value(ty.clone(), ValueKind::Param(index as u32));
            func.params.push(Param {
                name: name.into(),
                ty,
                value,
            });
        }
        func
    }

    // === Traversal ===

    /// The parameters of this function.
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// The value bound to the `index`-th parameter.
    pub fn arg(&self, index: usize) -> ValueId {
        self.params[index].value
    }

    /// Iterates the live blocks in program order.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|_| BlockId(i as u32)))
    }

    /// The entry block, if any block exists.
    pub fn entry_block(&self) -> Option<BlockId> {
        self.block_ids().next()
    }

    /// Borrows a block. Panics if the block has been removed.
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        self.blocks[id.index()]
            .as_ref()
            .expect("reference to removed block")
    }

    /// Returns true if the block has not been removed.
    pub fn is_block_live(&self, id: BlockId) -> bool {
        self.blocks
            .get(id.index())
            .map(|b| b.is_some())
            .unwrap_or(false)
    }

    /// The instructions of a block, cloned for iteration that is safe under
    /// insertion and erasure.
    pub fn block_insts(&self, id: BlockId) -> Vec<InstId> {
        self.block(id).insts.clone()
    }

    /// Predecessors of a block (blocks with an edge into it).
    pub fn predecessors(&self, id: BlockId) -> Vec<BlockId> {
        self.block_ids()
            .filter(|&b| self.block(b).successors().contains(&id))
            .collect()
    }

    /// Successors of a block.
    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        self.block(id).successors()
    }

    // === Values ===

    fn alloc_value(&mut self, ty: Ty, kind: ValueKind) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData::new(ty, kind));
        id
    }

    /// Borrows the data for a value.
    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id.index()]
    }

    /// Iterates every value id in the function's value table.
    pub fn value_ids(&self) -> impl Iterator<Item = ValueId> + '_ {
        (0..self.values.len()).map(|i| ValueId(i as u32))
    }

    /// The type of a value.
    pub fn value_ty(&self, id: ValueId) -> &Ty {
        &self.values[id.index()].ty
    }

    /// The operand edges currently referencing a value.
    pub fn users(&self, id: ValueId) -> &[User] {
        self.values[id.index()].users()
    }

    /// The constant behind a value, if it is one.
    pub fn as_const(&self, id: ValueId) -> Option<&Constant> {
        match &self.values[id.index()].kind {
            ValueKind::Const(c) => Some(c),
            _ => None,
        }
    }

    /// The defining instruction of a value, if it has one.
    pub fn value_def(&self, id: ValueId) -> Option<InstId> {
        match self.values[id.index()].kind {
            ValueKind::Inst(inst) => Some(inst),
            _ => None,
        }
    }

    /// Interns an integer constant of the given type.
    pub fn const_int(&mut self, ty: Ty, value: i128) -> ValueId {
        self.intern_const(Constant::int(ty, value))
    }

    /// Interns a boolean constant.
    pub fn const_bool(&mut self, value: bool) -> ValueId {
        self.intern_const(Constant::Bool(value))
    }

    fn intern_const(&mut self, c: Constant) -> ValueId {
        if let Some(&id) = self.const_cache.get(&c) {
            return id;
        }
        let id = self.alloc_value(c.ty(), ValueKind::Const(c.clone()));
        self.const_cache.insert(c, id);
        id
    }

    // === Instructions ===

    /// Borrows an instruction.
    pub fn inst(&self, id: InstId) -> &Instruction {
        &self.insts[id.index()].inst
    }

    /// The result value of an instruction, if it produces one.
    pub fn inst_result(&self, id: InstId) -> Option<ValueId> {
        self.insts[id.index()].result
    }

    /// The block an instruction is currently attached to.
    pub fn inst_block(&self, id: InstId) -> Option<BlockId> {
        self.insts[id.index()].block
    }

    /// Returns true once an instruction has been erased.
    pub fn inst_is_erased(&self, id: InstId) -> bool {
        self.insts[id.index()].erased
    }

    /// Splits a binary instruction into its parts.
    pub fn binary_parts(&self, id: InstId) -> Option<(BinaryOp, ValueId, ValueId)> {
        match self.inst(id) {
            Instruction::Binary { op, lhs, rhs } => Some((*op, *lhs, *rhs)),
            _ => None,
        }
    }

    /// The incoming pairs of a phi instruction.
    pub fn phi_incoming(&self, id: InstId) -> Option<&[(BlockId, ValueId)]> {
        match self.inst(id) {
            Instruction::Phi { incoming } => Some(incoming),
            _ => None,
        }
    }

    // === Construction and mutation ===

    /// Creates a new basic block.
    pub fn create_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Some(BasicBlock::new(id, Some(name.into()))));
        id
    }

    fn make_inst(&mut self, inst: Instruction, ty: Ty) -> InstId {
        let id = InstId(self.insts.len() as u32);
        let result = if inst.produces_result() {
            Some(self.alloc_value(ty, ValueKind::Inst(id)))
        } else {
            None
        };
        self.insts.push(InstSlot {
            inst,
            result,
            block: None,
            erased: false,
        });
        self.register_inst_uses(id);
        id
    }

    /// Appends an instruction to a block.
    pub fn push_inst(&mut self, block: BlockId, inst: Instruction, ty: Ty) -> InstId {
        let id = self.make_inst(inst, ty);
        self.attach(block, usize::MAX, id);
        id
    }

    /// Creates an instruction and inserts it immediately after `after`.
    pub fn insert_after(&mut self, after: InstId, inst: Instruction, ty: Ty) -> InstId {
        let (block, pos) = self.position_of(after);
        let id = self.make_inst(inst, ty);
        self.attach(block, pos + 1, id);
        id
    }

    /// Creates an instruction and inserts it immediately before `before`.
    pub fn insert_before(&mut self, before: InstId, inst: Instruction, ty: Ty) -> InstId {
        let (block, pos) = self.position_of(before);
        let id = self.make_inst(inst, ty);
        self.attach(block, pos, id);
        id
    }

    fn position_of(&self, id: InstId) -> (BlockId, usize) {
        let block = self.insts[id.index()]
            .block
            .expect("instruction is not attached to a block");
        let pos = self
            .block(block)
            .insts
            .iter()
            .position(|&i| i == id)
            .expect("instruction missing from its block");
        (block, pos)
    }

    fn attach(&mut self, block: BlockId, pos: usize, id: InstId) {
        let blk = self.blocks[block.index()]
            .as_mut()
            .expect("insertion into removed block");
        if pos >= blk.insts.len() {
            blk.insts.push(id);
        } else {
            blk.insts.insert(pos, id);
        }
        self.insts[id.index()].block = Some(block);
    }

    /// Sets the terminator of a block, replacing the previous one.
    pub fn set_terminator(&mut self, block: BlockId, term: Terminator) {
        self.unregister_term_uses(block);
        self.blocks[block.index()]
            .as_mut()
            .expect("terminating a removed block")
            .terminator = term;
        self.register_term_uses(block);
    }

    /// Rewrites the successor edges of `block` equal to `from` to target `to`.
    ///
    /// Phi nodes in either successor are not adjusted; callers rewire them
    /// explicitly with [`Function::replace_phi_incoming_block`].
    pub fn replace_successor(&mut self, block: BlockId, from: BlockId, to: BlockId) -> bool {
        let blk = self.blocks[block.index()]
            .as_mut()
            .expect("rewiring a removed block");
        blk.terminator.replace_successor(from, to) > 0
    }

    /// Rewrites phi incomings in `block` that name `old_pred` to `new_pred`.
    pub fn replace_phi_incoming_block(
        &mut self,
        block: BlockId,
        old_pred: BlockId,
        new_pred: BlockId,
    ) {
        let ids = self.block_insts(block);
        for id in ids {
            match &mut self.insts[id.index()].inst {
                Instruction::Phi { incoming } => {
                    for (pred, _) in incoming.iter_mut() {
                        if *pred == old_pred {
                            *pred = new_pred;
                        }
                    }
                }
                // Phis are grouped at the head of the block.
                _ => break,
            }
        }
    }

    /// Adds an incoming (predecessor, value) pair to a phi instruction.
    pub fn add_phi_incoming(&mut self, phi: InstId, pred: BlockId, value: ValueId) {
        match &mut self.insts[phi.index()].inst {
            Instruction::Phi { incoming } => incoming.push((pred, value)),
            other => panic!("add_phi_incoming on non-phi instruction {}", other),
        }
        self.values[value.index()].users.push(User::Inst(phi));
    }

    /// Replaces every use of `old` with `new`, atomically per user.
    pub fn replace_all_uses_with(&mut self, old: ValueId, new: ValueId) {
        if old == new {
            return;
        }
        let users = std::mem::take(&mut self.values[old.index()].users);
        let mut unique: Vec<User> = Vec::new();
        for u in &users {
            if !unique.contains(u) {
                unique.push(*u);
            }
        }
        for user in unique {
            let mut replaced = 0usize;
            match user {
                User::Inst(id) => {
                    self.insts[id.index()].inst.for_each_operand_mut(|v| {
                        if *v == old {
                            *v = new;
                            replaced += 1;
                        }
                    });
                }
                User::Term(block) => {
                    let blk = self.blocks[block.index()]
                        .as_mut()
                        .expect("terminator user in removed block");
                    blk.terminator.for_each_operand_mut(|v| {
                        if *v == old {
                            *v = new;
                            replaced += 1;
                        }
                    });
                }
            }
            for _ in 0..replaced {
                self.values[new.index()].users.push(user);
            }
        }
    }

    /// Unlinks an instruction from its block without destroying it.
    ///
    /// The instruction stays alive (its operand edges remain registered) so
    /// it can be re-inserted elsewhere.
    pub fn remove_from_parent(&mut self, id: InstId) {
        let (block, pos) = self.position_of(id);
        self.blocks[block.index()]
            .as_mut()
            .expect("detach from removed block")
            .insts
            .remove(pos);
        self.insts[id.index()].block = None;
    }

    /// Re-inserts a detached instruction at the end of `block`, immediately
    /// before its terminator.
    pub fn insert_before_terminator(&mut self, block: BlockId, id: InstId) {
        let slot = &self.insts[id.index()];
        assert!(!slot.erased, "re-inserting an erased instruction");
        assert!(
            slot.block.is_none(),
            "re-inserting an instruction that is still attached"
        );
        self.attach(block, usize::MAX, id);
    }

    /// Unlinks and destroys an instruction.
    ///
    /// Panics if the instruction's result still has uses; erasing a
    /// referenced definition would leave dangling operand edges.
    pub fn erase_from_parent(&mut self, id: InstId) {
        if let Some(result) = self.insts[id.index()].result {
            let users = &self.values[result.index()].users;
            if !users.is_empty() {
                panic!(
                    "erasing {} while its result {} still has {} use(s)",
                    id,
                    result,
                    users.len()
                );
            }
        }
        if self.insts[id.index()].block.is_some() {
            self.remove_from_parent(id);
        }
        self.unregister_inst_uses(id);
        self.insts[id.index()].erased = true;
    }

    /// Drops every block unreachable from the entry, along with its
    /// instructions, and prunes phi incomings that named a dropped
    /// predecessor. Returns true if anything was removed.
    pub fn eliminate_unreachable_blocks(&mut self) -> bool {
        let Some(entry) = self.entry_block() else {
            return false;
        };
        let mut reachable = rustc_hash::FxHashSet::default();
        let mut worklist = vec![entry];
        reachable.insert(entry);
        while let Some(block) = worklist.pop() {
            for succ in self.successors(block) {
                if reachable.insert(succ) {
                    worklist.push(succ);
                }
            }
        }

        let dead: Vec<BlockId> = self.block_ids().filter(|b| !reachable.contains(b)).collect();
        if dead.is_empty() {
            return false;
        }

        // Drop every operand edge leaving the dead region first, so values
        // defined and used only among dead blocks settle to zero uses.
        for &block in &dead {
            for id in self.block_insts(block) {
                self.unregister_inst_uses(id);
            }
            self.unregister_term_uses(block);
        }

        for &block in &dead {
            for id in self.block_insts(block) {
                self.insts[id.index()].block = None;
                self.insts[id.index()].erased = true;
                if let Some(result) = self.insts[id.index()].result {
                    let users = &self.values[result.index()].users;
                    if !users.is_empty() {
                        panic!(
                            "unreachable block {} defines {} still used by reachable code",
                            block, result
                        );
                    }
                }
            }
            self.blocks[block.index()] = None;
        }

        // Surviving phis may still name a removed predecessor.
        let live: Vec<BlockId> = self.block_ids().collect();
        for block in live {
            for id in self.block_insts(block) {
                let mut dropped = Vec::new();
                if let Instruction::Phi { incoming } = &mut self.insts[id.index()].inst {
                    incoming.retain(|(pred, value)| {
                        if reachable.contains(pred) {
                            true
                        } else {
                            dropped.push(*value);
                            false
                        }
                    });
                }
                for value in dropped {
                    self.remove_one_user(value, User::Inst(id));
                }
            }
        }
        true
    }

    // === Use index maintenance ===

    fn register_inst_uses(&mut self, id: InstId) {
        let ops = self.insts[id.index()].inst.operands();
        for v in ops {
            self.values[v.index()].users.push(User::Inst(id));
        }
    }

    fn unregister_inst_uses(&mut self, id: InstId) {
        let ops = self.insts[id.index()].inst.operands();
        for v in ops {
            self.remove_one_user(v, User::Inst(id));
        }
    }

    fn register_term_uses(&mut self, block: BlockId) {
        let ops = self.block(block).terminator.operands();
        for v in ops {
            self.values[v.index()].users.push(User::Term(block));
        }
    }

    fn unregister_term_uses(&mut self, block: BlockId) {
        let ops = self.block(block).terminator.operands();
        for v in ops {
            self.remove_one_user(v, User::Term(block));
        }
    }

    fn remove_one_user(&mut self, value: ValueId, user: User) {
        let users = &mut self.values[value.index()].users;
        match users.iter().position(|&u| u == user) {
            Some(pos) => {
                users.swap_remove(pos);
            }
            None => panic!("use-list inconsistency: {:?} not registered on {}", user, value),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn {}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {} {}", param.name, param.ty, param.value)?;
        }
        writeln!(f, ") -> {} {{", self.return_ty)?;
        for block in self.block_ids() {
            let blk = self.block(block);
            match &blk.name {
                Some(name) => writeln!(f, "{} ({}):", blk.id, name)?,
                None => writeln!(f, "{}:", blk.id)?,
            }
            for &id in blk.insts() {
                match self.inst_result(id) {
                    Some(result) => writeln!(f, "    {} = {}", result, self.inst(id))?,
                    None => writeln!(f, "    {}", self.inst(id))?,
                }
            }
            writeln!(f, "    {}", blk.terminator)?;
        }
        writeln!(f, "}}")
    }
}
