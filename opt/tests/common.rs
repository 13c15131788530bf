//! Common test utilities for the optimization passes.
//!
//! The centerpiece is a tiny reference interpreter over Opal IR. Tests run
//! a function before and after a pass on the same inputs and compare the
//! observable results: the returned value and the final memory image.

#![allow(dead_code)]

use opal_ir::{
    BinaryOp, BlockId, Constant, Function, Instruction, Terminator, Ty, ValueId,
};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// A runtime value: an integer or a pointer into a simulated stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Val {
    Int(i128),
    Ptr { slot: usize, offset: i128 },
}

impl Val {
    fn as_int(self) -> Option<i128> {
        match self {
            Val::Int(v) => Some(v),
            Val::Ptr { .. } => None,
        }
    }
}

/// The observable outcome of executing a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exec {
    /// The returned value, if the function returns one.
    pub ret: Option<i128>,
    /// Final memory: (slot, element offset) -> value. Untouched cells read
    /// as zero and are not recorded.
    pub mem: BTreeMap<(usize, i128), i128>,
}

/// Interprets a function on the given arguments.
///
/// Returns `None` when the program leaves the interpreter's subset (calls,
/// shifts past the width, division by zero) or exceeds the step budget —
/// either outcome fails a semantics-comparison test loudly rather than
/// silently passing.
pub fn interpret(func: &Function, args: &[Val]) -> Option<Exec> {
    let mut values: FxHashMap<ValueId, Val> = FxHashMap::default();
    for (index, param) in func.params().iter().enumerate() {
        values.insert(param.value, *args.get(index)?);
    }

    let mut mem: BTreeMap<(usize, i128), i128> = BTreeMap::new();
    let mut next_slot = 0usize;
    let mut block = func.entry_block()?;
    let mut prev_block: Option<BlockId> = None;
    let mut steps = 0usize;

    loop {
        steps += 1;
        if steps > 100_000 {
            return None;
        }

        // Phis read their inputs simultaneously on entry to the block.
        let insts = func.block_insts(block);
        let mut phi_writes: Vec<(ValueId, Val)> = Vec::new();
        let mut body_start = 0;
        for (i, &inst) in insts.iter().enumerate() {
            let Instruction::Phi { incoming } = func.inst(inst) else {
                body_start = i;
                break;
            };
            body_start = i + 1;
            let pred = prev_block?;
            let (_, incoming_value) = incoming.iter().find(|(b, _)| *b == pred)?;
            let value = resolve(func, &values, *incoming_value)?;
            phi_writes.push((func.inst_result(inst)?, value));
        }
        for (dest, value) in phi_writes {
            values.insert(dest, value);
        }

        for &inst in &insts[body_start..] {
            let result = step(func, &values, &mut mem, &mut next_slot, inst)?;
            if let (Some(dest), Some(value)) = (func.inst_result(inst), result) {
                values.insert(dest, value);
            }
        }

        match func.block(block).terminator() {
            Terminator::Return(None) => return Some(Exec { ret: None, mem }),
            Terminator::Return(Some(v)) => {
                let value = resolve(func, &values, *v)?.as_int()?;
                return Some(Exec {
                    ret: Some(value),
                    mem,
                });
            }
            Terminator::Branch(target) => {
                prev_block = Some(block);
                block = *target;
            }
            Terminator::CondBranch {
                cond,
                then_block,
                else_block,
            } => {
                let taken = resolve(func, &values, *cond)?.as_int()? != 0;
                prev_block = Some(block);
                block = if taken { *then_block } else { *else_block };
            }
            Terminator::Unreachable => return None,
        }
    }
}

fn resolve(func: &Function, values: &FxHashMap<ValueId, Val>, v: ValueId) -> Option<Val> {
    if let Some(val) = values.get(&v) {
        return Some(*val);
    }
    match func.as_const(v)? {
        Constant::Int { value, .. } => Some(Val::Int(*value)),
        Constant::Bool(b) => Some(Val::Int(*b as i128)),
    }
}

fn step(
    func: &Function,
    values: &FxHashMap<ValueId, Val>,
    mem: &mut BTreeMap<(usize, i128), i128>,
    next_slot: &mut usize,
    inst: opal_ir::InstId,
) -> Option<Option<Val>> {
    let get = |v: ValueId| resolve(func, values, v);
    match func.inst(inst) {
        Instruction::Binary { op, lhs, rhs } => {
            let ty = func.value_ty(func.inst_result(inst)?).clone();
            let a = get(*lhs)?.as_int()?;
            let b = get(*rhs)?.as_int()?;
            Some(Some(Val::Int(eval_binary(*op, a, b, &ty)?)))
        }
        Instruction::Cast { value, ty } => {
            let v = get(*value)?.as_int()?;
            Some(Some(Val::Int(Constant::int(ty.clone(), v).value())))
        }
        Instruction::Select {
            cond,
            on_true,
            on_false,
        } => {
            let c = get(*cond)?.as_int()?;
            Some(Some(if c != 0 { get(*on_true)? } else { get(*on_false)? }))
        }
        Instruction::Alloc { .. } => {
            let slot = *next_slot;
            *next_slot += 1;
            Some(Some(Val::Ptr { slot, offset: 0 }))
        }
        Instruction::Load { ptr } => match get(*ptr)? {
            Val::Ptr { slot, offset } => {
                Some(Some(Val::Int(mem.get(&(slot, offset)).copied().unwrap_or(0))))
            }
            Val::Int(_) => None,
        },
        Instruction::Store { ptr, value } => match get(*ptr)? {
            Val::Ptr { slot, offset } => {
                let v = get(*value)?.as_int()?;
                if v == 0 {
                    mem.remove(&(slot, offset));
                } else {
                    mem.insert((slot, offset), v);
                }
                Some(None)
            }
            Val::Int(_) => None,
        },
        Instruction::GetElementPtr { base, index } => match get(*base)? {
            Val::Ptr { slot, offset } => {
                let i = get(*index)?.as_int()?;
                Some(Some(Val::Ptr {
                    slot,
                    offset: offset + i,
                }))
            }
            Val::Int(_) => None,
        },
        Instruction::Call { .. } => None,
        Instruction::Phi { .. } => None,
    }
}

fn eval_binary(op: BinaryOp, a: i128, b: i128, ty: &Ty) -> Option<i128> {
    let width = ty.bit_width().unwrap_or(128);
    let wrap = |v: i128| Constant::int(ty.clone(), v).value();
    let unsigned = |v: i128| Constant::int(ty.clone(), v).unsigned_value();

    let result = match op {
        BinaryOp::Add => wrap(a.wrapping_add(b)),
        BinaryOp::Sub => wrap(a.wrapping_sub(b)),
        BinaryOp::Mul => wrap(a.wrapping_mul(b)),
        BinaryOp::SDiv => {
            if b == 0 {
                return None;
            }
            wrap(a.wrapping_div(b))
        }
        BinaryOp::UDiv => {
            let ub = unsigned(b);
            if ub == 0 {
                return None;
            }
            wrap((unsigned(a) / ub) as i128)
        }
        BinaryOp::SRem => {
            if b == 0 {
                return None;
            }
            wrap(a.wrapping_rem(b))
        }
        BinaryOp::URem => {
            let ub = unsigned(b);
            if ub == 0 {
                return None;
            }
            wrap((unsigned(a) % ub) as i128)
        }
        BinaryOp::And => wrap(a & b),
        BinaryOp::Or => wrap(a | b),
        BinaryOp::Xor => wrap(a ^ b),
        BinaryOp::Shl => {
            if !(0..width as i128).contains(&b) {
                return None;
            }
            wrap(a.wrapping_shl(b as u32))
        }
        BinaryOp::LShr => {
            if !(0..width as i128).contains(&b) {
                return None;
            }
            wrap((unsigned(a) >> b as u32) as i128)
        }
        BinaryOp::AShr => {
            if !(0..width as i128).contains(&b) {
                return None;
            }
            wrap(a >> b as u32)
        }
        BinaryOp::Eq => (a == b) as i128,
        BinaryOp::Ne => (a != b) as i128,
        BinaryOp::Lt => (a < b) as i128,
        BinaryOp::Le => (a <= b) as i128,
        BinaryOp::Gt => (a > b) as i128,
        BinaryOp::Ge => (a >= b) as i128,
    };
    Some(result)
}

/// Interprets `func` on integer arguments.
pub fn run_on_ints(func: &Function, args: &[i128]) -> Option<Exec> {
    let vals: Vec<Val> = args.iter().map(|&v| Val::Int(v)).collect();
    interpret(func, &vals)
}

/// Builds `count` sequential `for (i = 0; i < n; i++)` loops in one
/// function with `arrays` stack arrays. The single parameter is the shared
/// bound `n`. `body` fills loop `k`'s body given the induction variable
/// and the array pointers.
pub fn sequential_loops(
    count: usize,
    arrays: usize,
    body: impl Fn(&mut opal_ir::FunctionBuilder, usize, ValueId, &[ValueId]),
) -> Function {
    use opal_ir::FunctionBuilder;

    let mut fb = FunctionBuilder::new("loops", vec![("n", Ty::I32)], Ty::Void);
    let n = fb.arg(0);

    let entry = fb.block("entry");
    let mut headers = Vec::new();
    let mut bodies = Vec::new();
    let mut latches = Vec::new();
    let mut mids = Vec::new();
    for k in 0..count {
        headers.push(fb.block(format!("header{}", k)));
        bodies.push(fb.block(format!("body{}", k)));
        latches.push(fb.block(format!("latch{}", k)));
        if k + 1 < count {
            mids.push(fb.block(format!("mid{}", k)));
        }
    }
    let exit = fb.block("exit");

    fb.set_block(entry);
    let slots: Vec<ValueId> = (0..arrays).map(|_| fb.alloc(Ty::I32)).collect();
    fb.br(headers[0]);

    let zero = fb.const_int(Ty::I32, 0);
    let one = fb.const_int(Ty::I32, 1);
    let mut phis = Vec::new();
    let mut nexts = Vec::new();
    for k in 0..count {
        let preheader = if k == 0 { entry } else { mids[k - 1] };
        let after = if k + 1 < count { mids[k] } else { exit };

        fb.set_block(headers[k]);
        let iv = fb.phi(vec![(preheader, zero)], Ty::I32);
        let cond = fb.binary(BinaryOp::Lt, iv, n, Ty::Bool);
        fb.cond_br(cond, bodies[k], after);

        fb.set_block(bodies[k]);
        body(&mut fb, k, iv, &slots);
        let next = fb.binary(BinaryOp::Add, iv, one, Ty::I32);
        fb.br(latches[k]);

        fb.set_block(latches[k]);
        fb.br(headers[k]);

        if k + 1 < count {
            fb.set_block(mids[k]);
            fb.br(headers[k + 1]);
        }

        phis.push(iv);
        nexts.push(next);
    }

    fb.set_block(exit);
    fb.ret_void();

    let mut func = fb.finish();
    for k in 0..count {
        let phi = func.value_def(phis[k]).unwrap();
        func.add_phi_incoming(phi, latches[k], nexts[k]);
    }
    func
}

/// Number of top-level loops in a function.
pub fn top_level_loop_count(func: &Function) -> usize {
    let dom = opal_ir::DominatorTree::compute(func);
    opal_ir::LoopForest::compute(func, &dom).top_level().len()
}

/// Asserts that a transformation preserved observable behavior on the
/// given argument vectors.
pub fn assert_same_behavior(before: &Function, after: &Function, inputs: &[Vec<i128>]) {
    for input in inputs {
        let expected = run_on_ints(before, input);
        let actual = run_on_ints(after, input);
        assert!(
            expected.is_some(),
            "reference execution failed on {:?}",
            input
        );
        assert_eq!(expected, actual, "behavior diverged on input {:?}", input);
    }
}
