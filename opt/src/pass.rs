//! Optimization pass infrastructure.
//!
//! Passes run over one function at a time and report whether the analyses
//! computed before the run are still valid. A pass that changes nothing
//! preserves everything; any change invalidates everything — there is no
//! finer granularity.

use opal_ir::{Function, Module};

/// What a pass preserved of the analyses computed before it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreservedAnalyses {
    /// The pass made no changes.
    All,
    /// The pass changed the IR; cached analyses must be recomputed.
    None,
}

impl PreservedAnalyses {
    /// Everything preserved: the IR was not touched.
    pub fn all() -> Self {
        PreservedAnalyses::All
    }

    /// Nothing preserved: the IR changed.
    pub fn none() -> Self {
        PreservedAnalyses::None
    }

    /// Returns true if the pass made changes.
    pub fn changed(&self) -> bool {
        matches!(self, PreservedAnalyses::None)
    }

    /// Returns true if every analysis survived.
    pub fn are_all_preserved(&self) -> bool {
        matches!(self, PreservedAnalyses::All)
    }
}

/// A pass that transforms a function.
pub trait FunctionPass {
    /// The name of this pass (for tracing).
    fn name(&self) -> &str;

    /// Runs the pass on a function.
    fn run(&mut self, func: &mut Function) -> PreservedAnalyses;
}

/// A pass manager that runs multiple passes over every function of a module.
pub struct PassManager {
    passes: Vec<Box<dyn FunctionPass>>,
}

impl PassManager {
    /// Creates a new empty pass manager.
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Adds a pass to the manager.
    pub fn add_pass(&mut self, pass: Box<dyn FunctionPass>) {
        self.passes.push(pass);
    }

    /// Runs all passes in order on every function of the module.
    pub fn run(&mut self, module: &mut Module) -> Vec<(String, PreservedAnalyses)> {
        let mut results = Vec::new();
        for pass in &mut self.passes {
            for func in &mut module.functions {
                let result = pass.run(func);
                results.push((format!("{} on {}", pass.name(), func.name), result));
            }
        }
        results
    }

    /// Returns the number of passes in the manager.
    pub fn len(&self) -> usize {
        self.passes.len()
    }

    /// Returns true if there are no passes.
    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}
