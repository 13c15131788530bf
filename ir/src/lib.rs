//! Opal Intermediate Representation (IR)
//!
//! This crate defines the SSA intermediate representation consumed by the
//! Opal optimization passes, along with the read-only CFG analyses the
//! passes rely on:
//!
//! - the data model: modules, functions, basic blocks, instructions, values
//! - a narrow rewrite API (insert, replace-uses, erase, successor rewiring)
//! - dominator and post-dominator trees
//! - natural loop discovery with the standard loop-shape queries
//! - scalar-evolution trip counts for canonical counted loops
//! - a conservative dependence oracle for loop fusion
//! - a structural verifier for the SSA and use-list invariants

pub mod builder;
pub mod deps;
pub mod dom;
pub mod function;
pub mod instruction;
pub mod loops;
pub mod scev;
pub mod terminator;
pub mod types;
pub mod values;
pub mod verify;

pub use builder::{FunctionBuilder, ModuleBuilder};
pub use deps::{fusion_dependence, DepResult};
pub use dom::{DominatorTree, PostDominatorTree};
pub use function::{BasicBlock, Function, Param};
pub use instruction::{BinaryOp, Instruction};
pub use loops::{Loop, LoopForest};
pub use scev::{affine_at, exit_count, trip_count, trip_count_from_exit_count, Affine, Bound, TripCount};
pub use terminator::Terminator;
pub use types::Ty;
pub use values::{BlockId, Constant, InstId, User, ValueData, ValueId, ValueKind};
pub use verify::{verify_function, VerifyError};

use std::fmt;

/// A module: the top-level container for functions.
#[derive(Debug, Clone)]
pub struct Module {
    /// The name of the module.
    pub name: String,
    /// The functions in the module.
    pub functions: Vec<Function>,
}

impl Module {
    /// Creates a new empty module with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    /// Adds a function to the module.
    pub fn add_function(&mut self, func: Function) {
        self.functions.push(func);
    }

    /// Gets a function by name.
    pub fn get_function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Gets a mutable reference to a function by name.
    pub fn get_function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    /// Verifies every function in the module.
    pub fn verify(&self) -> Result<(), VerifyError> {
        for func in &self.functions {
            verify_function(func)?;
        }
        Ok(())
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {} {{\n", self.name)?;
        for func in &self.functions {
            writeln!(f, "{}", func)?;
        }
        writeln!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_creation() {
        let module = Module::new("test");
        assert_eq!(module.name, "test");
        assert!(module.functions.is_empty());
    }

    #[test]
    fn test_module_lookup() {
        let mut module = Module::new("test");
        let mut fb = FunctionBuilder::new("main", Vec::<(&str, Ty)>::new(), Ty::Void);
        fb.block("entry");
        fb.ret_void();
        module.add_function(fb.finish());

        assert!(module.get_function("main").is_some());
        assert!(module.get_function("nonexistent").is_none());
        assert_eq!(module.verify(), Ok(()));
    }

    #[test]
    fn test_module_display() {
        let mut module = Module::new("demo");
        let mut fb = FunctionBuilder::new("f", vec![("x", Ty::I32)], Ty::I32);
        fb.block("entry");
        let x = fb.arg(0);
        fb.ret(x);
        module.add_function(fb.finish());

        let text = format!("{}", module);
        assert!(text.contains("module demo"));
        assert!(text.contains("fn f("));
        assert!(text.contains("ret %0"));
    }
}
