//! Opal IR Optimization Passes
//!
//! This crate provides the intra-procedural optimization passes for the
//! Opal intermediate representation:
//!
//! - **LocalOpts**: block-local peephole rewrites — algebraic identities,
//!   strength reduction, pair cancellation — followed by a dead-code sweep
//! - **LICM**: hoists loop-invariant computations into the pre-header
//! - **LoopFusion**: merges adjacent, control-flow-equivalent loops with
//!   identical trip counts and no negative-distance dependences
//!
//! Passes are silent; with a `tracing` subscriber installed they emit one
//! event per attempted rewrite with its outcome.

pub mod licm;
pub mod local_opts;
pub mod loop_fusion;
pub mod pass;

pub use licm::LoopInvariantCodeMotion;
pub use local_opts::LocalOpts;
pub use loop_fusion::LoopFusion;
pub use pass::{FunctionPass, PassManager, PreservedAnalyses};

use opal_ir::Module;

/// Runs the standard optimization pipeline on a module.
pub fn optimize_module(module: &mut Module) -> Vec<(String, PreservedAnalyses)> {
    let mut manager = PassManager::new();
    manager.add_pass(Box::new(LocalOpts::new()));
    manager.add_pass(Box::new(LoopInvariantCodeMotion::new()));
    manager.add_pass(Box::new(LoopFusion::new()));
    manager.run(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_ir::{BinaryOp, FunctionBuilder, Ty};

    #[test]
    fn test_optimize_module() {
        let mut module = Module::new("test");
        let mut fb = FunctionBuilder::new("main", vec![("x", Ty::I32)], Ty::I32);
        fb.block("entry");
        let eight = fb.const_int(Ty::I32, 8);
        let y = fb.binary(BinaryOp::Mul, fb.arg(0), eight, Ty::I32);
        fb.ret(y);
        module.add_function(fb.finish());

        let results = optimize_module(&mut module);
        assert_eq!(results.len(), 3);
        assert!(results[0].1.changed());
        assert_eq!(module.verify(), Ok(()));
    }
}
