//! Builders for constructing Opal IR programmatically.
//!
//! [`FunctionBuilder`] wraps the function mutation API with one method per
//! instruction, tracking a current block. Because value numbering is local
//! to a function, the builder owns the function it grows and hands it back
//! from [`FunctionBuilder::finish`].

use crate::function::Function;
use crate::instruction::{BinaryOp, Instruction};
use crate::terminator::Terminator;
use crate::types::Ty;
use crate::values::{BlockId, ValueId};
use crate::Module;

/// Builder for constructing IR modules.
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    /// Creates a new module builder with the given module name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            module: Module::new(name),
        }
    }

    /// Adds a finished function to the module.
    pub fn add_function(&mut self, func: Function) -> &mut Self {
        self.module.add_function(func);
        self
    }

    /// Returns the built module.
    pub fn build(self) -> Module {
        self.module
    }
}

/// Builder for constructing a single function.
pub struct FunctionBuilder {
    func: Function,
    current: Option<BlockId>,
}

impl FunctionBuilder {
    /// Creates a builder for a function with the given signature.
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        params: impl IntoIterator<Item = (S, Ty)>,
        return_ty: Ty,
    ) -> Self {
        Self {
            func: Function::new(name, params, return_ty),
            current: None,
        }
    }

    /// Returns the built function.
    pub fn finish(self) -> Function {
        self.func
    }

    /// The value bound to the `index`-th parameter.
    pub fn arg(&self, index: usize) -> ValueId {
        self.func.arg(index)
    }

    /// Creates a new basic block and makes it current.
    pub fn block(&mut self, name: impl Into<String>) -> BlockId {
        let id = self.func.create_block(name);
        self.current = Some(id);
        id
    }

    /// Switches the current block.
    pub fn set_block(&mut self, id: BlockId) -> &mut Self {
        self.current = Some(id);
        self
    }

    fn current(&self) -> BlockId {
        self.current.expect("no current block")
    }

    fn push(&mut self, inst: Instruction, ty: Ty) -> ValueId {
        let block = self.current();
        let id = self.func.push_inst(block, inst, ty);
        self.func
            .inst_result(id)
            .expect("instruction produces no result")
    }

    // === Constants ===

    /// Interns an integer constant.
    pub fn const_int(&mut self, ty: Ty, value: i128) -> ValueId {
        self.func.const_int(ty, value)
    }

    /// Interns a boolean constant.
    pub fn const_bool(&mut self, value: bool) -> ValueId {
        self.func.const_bool(value)
    }

    // === Instructions ===

    /// Binary operation.
    pub fn binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId, ty: Ty) -> ValueId {
        self.push(Instruction::Binary { op, lhs, rhs }, ty)
    }

    /// Integer resize.
    pub fn cast(&mut self, value: ValueId, ty: Ty) -> ValueId {
        self.push(Instruction::Cast { value, ty: ty.clone() }, ty)
    }

    /// Value select.
    pub fn select(&mut self, cond: ValueId, on_true: ValueId, on_false: ValueId, ty: Ty) -> ValueId {
        self.push(
            Instruction::Select {
                cond,
                on_true,
                on_false,
            },
            ty,
        )
    }

    /// Stack allocation; the result is a pointer to `ty`.
    pub fn alloc(&mut self, ty: Ty) -> ValueId {
        let ptr_ty = ty.clone().ptr_to();
        self.push(Instruction::Alloc { ty }, ptr_ty)
    }

    /// Load from a pointer.
    pub fn load(&mut self, ptr: ValueId, ty: Ty) -> ValueId {
        self.push(Instruction::Load { ptr }, ty)
    }

    /// Store to a pointer.
    pub fn store(&mut self, ptr: ValueId, value: ValueId) {
        let block = self.current();
        self.func
            .push_inst(block, Instruction::Store { ptr, value }, Ty::Void);
    }

    /// Address of the `index`-th element off a base pointer.
    pub fn gep(&mut self, base: ValueId, index: ValueId) -> ValueId {
        let ty = self.func.value_ty(base).clone();
        self.push(Instruction::GetElementPtr { base, index }, ty)
    }

    /// Call a function by name.
    pub fn call(&mut self, callee: impl Into<String>, args: Vec<ValueId>, ty: Ty) -> ValueId {
        self.push(
            Instruction::Call {
                callee: callee.into(),
                args,
            },
            ty,
        )
    }

    /// Phi node.
    pub fn phi(&mut self, incoming: Vec<(BlockId, ValueId)>, ty: Ty) -> ValueId {
        self.push(Instruction::Phi { incoming }, ty)
    }

    // === Terminators ===

    /// Return void.
    pub fn ret_void(&mut self) {
        let block = self.current();
        self.func.set_terminator(block, Terminator::Return(None));
    }

    /// Return a value.
    pub fn ret(&mut self, value: ValueId) {
        let block = self.current();
        self.func
            .set_terminator(block, Terminator::Return(Some(value)));
    }

    /// Unconditional branch.
    pub fn br(&mut self, block: BlockId) {
        let current = self.current();
        self.func.set_terminator(current, Terminator::Branch(block));
    }

    /// Conditional branch.
    pub fn cond_br(&mut self, cond: ValueId, then_block: BlockId, else_block: BlockId) {
        let current = self.current();
        self.func.set_terminator(
            current,
            Terminator::CondBranch {
                cond,
                then_block,
                else_block,
            },
        );
    }

    /// Borrows the function under construction.
    pub fn func(&self) -> &Function {
        &self.func
    }
}
