//! Function passes in the spirit of llvm's instcombine, reassociate, gvn
//! and simplifycfg. [`optimize`] runs them together until nothing changes.
//!
//! Memory facts are only tracked within a block, and pointers into distinct
//! `alloca`s never alias. Instructions a pass removes stay in the arena but
//! are no longer placed in any block.

use std::collections::{HashMap, HashSet};

use super::{
    BinOp, BlockId, CmpOp, Constant, Function, Inst, InstId, Type, Value,
};

fn reachable_blocks(function: &Function) -> Vec<bool> {
    let mut seen = vec![false; function.blocks.len()];
    let mut stack: Vec<BlockId> = function.entry().into_iter().collect();

    while let Some(block) = stack.pop() {
        match seen.get_mut(block.0) {
            Some(visited) if !*visited => *visited = true,
            _ => continue,
        }

        if let Some(term) = function.terminator(block) {
            stack.extend(term.successors());
        }
    }

    seen
}

/// Deletes blocks that cannot be reached from the entry block and
/// renumbers branch targets. Returns the number of blocks removed.
///
/// Instructions of removed blocks stay in the arena but are no longer
/// placed anywhere.
pub fn simplify_cfg(function: &mut Function) -> usize {
    let reachable = reachable_blocks(function);

    let mut remap = HashMap::new();
    let mut kept = vec![];
    let blocks = std::mem::take(&mut function.blocks);
    for (old, block) in blocks.into_iter().enumerate() {
        if reachable[old] {
            remap.insert(BlockId(old), BlockId(kept.len()));
            kept.push(block);
        }
    }

    let removed = reachable.len() - kept.len();
    function.blocks = kept;

    if removed > 0 {
        let renumber = |id: &mut BlockId| {
            if let Some(new) = remap.get(id) {
                *id = *new;
            }
        };

        for data in &mut function.insts {
            match &mut data.inst {
                Inst::Br { target } => renumber(target),
                Inst::CondBr {
                    then_block,
                    else_block,
                    ..
                } => {
                    renumber(then_block);
                    renumber(else_block);
                }
                _ => {}
            }
        }
    }

    removed
}

/// The `alloca` whose storage `ptr` points into, if it can be told.
fn root_of(function: &Function, mut ptr: Value) -> Option<InstId> {
    loop {
        let Value::Inst(id) = ptr else {
            return None;
        };

        match &function.inst(id)?.inst {
            Inst::Alloca { .. } => return Some(id),
            Inst::ElementPtr { base, .. } => ptr = *base,
            _ => return None,
        }
    }
}

/// Whether external functions may see any of the function's storage.
fn pointers_escape(function: &Function) -> bool {
    let is_ptr =
        |value: &Value| function.value_type(*value) == Some(Type::Ptr);

    function
        .iter_insts()
        .filter_map(|(_, id)| function.inst(id))
        .any(|data| match &data.inst {
            Inst::Store { value, .. } => is_ptr(value),
            Inst::Call { args, .. } => args.iter().any(is_ptr),
            _ => false,
        })
}

fn int_const(value: Value) -> Option<u64> {
    match value {
        Value::Const(Constant::Int { value, .. }) => Some(value),
        Value::Const(Constant::Zero(ty)) if ty.is_int() => Some(0),
        _ => None,
    }
}

fn apply(op: BinOp, lhs: u64, rhs: u64) -> u64 {
    match op {
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
    }
}

fn resolve(replaced: &HashMap<InstId, Value>, mut value: Value) -> Value {
    while let Value::Inst(id) = value {
        match replaced.get(&id) {
            Some(next) => value = *next,
            None => break,
        }
    }

    value
}

fn resolve_operands(
    function: &mut Function,
    id: InstId,
    replaced: &HashMap<InstId, Value>,
) {
    if let Some(data) = function.insts.get_mut(id.0) {
        for operand in data.inst.operands_mut() {
            *operand = resolve(replaced, *operand);
        }
    }
}

/// Points every use of a replaced instruction at its replacement and
/// unplaces the replaced instructions.
fn replace_uses(function: &mut Function, replaced: &HashMap<InstId, Value>) {
    if replaced.is_empty() {
        return;
    }

    for data in &mut function.insts {
        for operand in data.inst.operands_mut() {
            *operand = resolve(replaced, *operand);
        }
    }

    for block in &mut function.blocks {
        block.insts.retain(|id| !replaced.contains_key(id));
    }
}

fn placed(function: &Function) -> Vec<InstId> {
    function.iter_insts().map(|(_, id)| id).collect()
}

/// Block-local redundancy elimination. A load of a location whose contents
/// are known (from an earlier store or load, or because its `alloca` was
/// zero-filled) is replaced by those contents, and a pure instruction that
/// repeats an earlier one is replaced by it. Returns the number of
/// instructions removed.
pub fn forward_loads(function: &mut Function) -> usize {
    let escaped = pointers_escape(function);
    let mut replaced = HashMap::new();

    for b in 0..function.blocks.len() {
        // location -> contents
        let mut known: HashMap<Value, Value> = HashMap::new();
        let mut zeroed: HashSet<InstId> = HashSet::new();
        let mut computed: HashMap<Inst, Value> = HashMap::new();

        for i in 0..function.blocks[b].insts.len() {
            let id = function.blocks[b].insts[i];
            resolve_operands(function, id, &replaced);
            let Some(data) = function.inst(id) else {
                continue;
            };

            match &data.inst {
                Inst::Load { ty, ptr } => {
                    let zero = root_of(function, *ptr)
                        .filter(|root| ty.is_int() && zeroed.contains(root))
                        .map(|_| Value::int(*ty, 0));
                    let contents = known
                        .get(ptr)
                        .copied()
                        .filter(|v| function.value_type(*v) == Some(*ty))
                        .or(zero);

                    match contents {
                        Some(value) => {
                            replaced.insert(id, value);
                        }
                        None => {
                            known.insert(*ptr, Value::Inst(id));
                        }
                    }
                }
                Inst::Store { value, ptr } => {
                    let root = root_of(function, *ptr);
                    match root {
                        Some(root) => {
                            known.retain(|p, _| {
                                root_of(function, *p) != Some(root)
                            });
                            zeroed.remove(&root);
                        }
                        None => {
                            known.clear();
                            zeroed.clear();
                        }
                    }

                    match (value, root) {
                        (
                            Value::Const(Constant::Zero(Type::ByteArray(_))),
                            Some(root),
                        ) if *ptr == Value::Inst(root) => {
                            zeroed.insert(root);
                        }
                        _ => {
                            known.insert(*ptr, *value);
                        }
                    }
                }
                Inst::Call { .. } if escaped => {
                    known.clear();
                    zeroed.clear();
                }
                Inst::Binary { .. }
                | Inst::ElementPtr { .. }
                | Inst::Compare { .. }
                | Inst::Trunc { .. } => match computed.get(&data.inst) {
                    Some(earlier) => {
                        replaced.insert(id, *earlier);
                    }
                    None => {
                        computed.insert(data.inst.clone(), Value::Inst(id));
                    }
                },
                _ => {}
            }
        }
    }

    replace_uses(function, &replaced);
    replaced.len()
}

/// Folds arithmetic, comparisons and truncations of constants, drops
/// `x + 0`, merges chains like `(x + 1) + 1` into `x + 2`, and turns
/// conditional branches on a constant into plain ones. Returns the number
/// of instructions removed or rewritten.
pub fn fold_constants(function: &mut Function) -> usize {
    let mut replaced = HashMap::new();
    let mut rewritten = 0;

    for id in placed(function) {
        resolve_operands(function, id, &replaced);
        let Some(data) = function.inst(id) else {
            continue;
        };
        let ty = data.ty;

        let folded = match &data.inst {
            Inst::Binary { op, lhs, rhs } => {
                match (int_const(*lhs), int_const(*rhs)) {
                    (Some(a), Some(b)) => Some(Value::Const(Constant::Int {
                        ty,
                        value: ty.mask(apply(*op, a, b)),
                    })),
                    (_, Some(0)) => Some(*lhs),
                    _ => None,
                }
            }
            Inst::Compare { op, lhs, rhs } => {
                match (int_const(*lhs), int_const(*rhs)) {
                    (Some(a), Some(b)) => {
                        let holds = match op {
                            CmpOp::Eq => a == b,
                            CmpOp::Ne => a != b,
                        };
                        Some(Value::int(Type::I1, holds as i64))
                    }
                    _ => None,
                }
            }
            Inst::Trunc { value, to } => {
                int_const(*value).map(|a| {
                    Value::Const(Constant::Int {
                        ty: *to,
                        value: to.mask(a),
                    })
                })
            }
            _ => None,
        };

        if let Some(value) = folded {
            replaced.insert(id, value);
            continue;
        }

        let rewrite = match &data.inst {
            // (x op1 c1) op2 c2 => x + (op1 c1 op2 c2)
            Inst::Binary {
                op,
                lhs: Value::Inst(inner),
                rhs,
            } => match (function.inst(*inner), int_const(*rhs)) {
                (Some(inner), Some(c2)) => match &inner.inst {
                    Inst::Binary {
                        op: inner_op,
                        lhs: x,
                        rhs: c1,
                    } => int_const(*c1).map(|c1| Inst::Binary {
                        op: BinOp::Add,
                        lhs: *x,
                        rhs: Value::Const(Constant::Int {
                            ty,
                            value: ty.mask(apply(
                                *op,
                                apply(*inner_op, 0, c1),
                                c2,
                            )),
                        }),
                    }),
                    _ => None,
                },
                _ => None,
            },
            Inst::CondBr {
                cond,
                then_block,
                else_block,
            } => int_const(*cond).map(|c| Inst::Br {
                target: if c != 0 { *then_block } else { *else_block },
            }),
            _ => None,
        };

        if let Some(inst) = rewrite {
            function.insts[id.0].inst = inst;
            rewritten += 1;
        }
    }

    replace_uses(function, &replaced);
    rewritten + replaced.len()
}

/// Removes stores that a later store in the same block overwrites before
/// anything could read them. Returns the number of stores removed.
pub fn remove_dead_stores(function: &mut Function) -> usize {
    let escaped = pointers_escape(function);
    let mut dead = HashSet::new();

    for block in &function.blocks {
        // location -> bytes certainly overwritten further down the block
        let mut overwritten: HashMap<Value, u64> = HashMap::new();

        for &id in block.insts.iter().rev() {
            let Some(data) = function.inst(id) else {
                continue;
            };

            match &data.inst {
                Inst::Store { value, ptr } => {
                    let size =
                        function.value_type(*value).map_or(0, Type::size);
                    match overwritten.get(ptr) {
                        Some(later) if *later >= size => {
                            dead.insert(id);
                        }
                        _ => {
                            overwritten.insert(*ptr, size);
                        }
                    }
                }
                Inst::Load { ptr, .. } => match root_of(function, *ptr) {
                    Some(root) => overwritten
                        .retain(|p, _| root_of(function, *p) != Some(root)),
                    None => overwritten.clear(),
                },
                Inst::Call { .. } if escaped => overwritten.clear(),
                _ => {}
            }
        }
    }

    for block in &mut function.blocks {
        block.insts.retain(|id| !dead.contains(id));
    }

    dead.len()
}

fn has_no_side_effects(inst: &Inst) -> bool {
    matches!(
        inst,
        Inst::Alloca { .. }
            | Inst::Load { .. }
            | Inst::Binary { .. }
            | Inst::ElementPtr { .. }
            | Inst::Compare { .. }
            | Inst::Trunc { .. }
    )
}

/// Removes instructions without side effects whose results are never used.
/// Returns the number of instructions removed.
pub fn remove_dead_code(function: &mut Function) -> usize {
    let mut removed = 0;

    loop {
        let mut uses = vec![0usize; function.insts.len()];
        for id in placed(function) {
            let Some(data) = function.inst(id) else {
                continue;
            };
            for operand in data.inst.operands() {
                if let Value::Inst(used) = operand {
                    if let Some(count) = uses.get_mut(used.0) {
                        *count += 1;
                    }
                }
            }
        }

        let dead: HashSet<InstId> = placed(function)
            .into_iter()
            .filter(|id| uses.get(id.0) == Some(&0))
            .filter(|id| {
                function
                    .inst(*id)
                    .is_some_and(|data| has_no_side_effects(&data.inst))
            })
            .collect();

        if dead.is_empty() {
            return removed;
        }

        removed += dead.len();
        for block in &mut function.blocks {
            block.insts.retain(|id| !dead.contains(id));
        }
    }
}

/// Runs every pass over `function` until a round changes nothing. Returns
/// the total number of changes.
pub fn optimize(function: &mut Function) -> usize {
    let mut total = 0;

    loop {
        let changes = forward_loads(function)
            + fold_constants(function)
            + remove_dead_stores(function)
            + remove_dead_code(function)
            + simplify_cfg(function);

        if changes == 0 {
            return total;
        }
        total += changes;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ir::{exec::Executor, verify::verify_function, Builder, Module};

    fn builder() -> Builder {
        Builder::new(Function::new("main", Type::Void), "entry")
    }

    fn insts_of(f: &Function, block: usize) -> Vec<Inst> {
        f.blocks[block]
            .insts
            .iter()
            .map(|id| f.insts[id.0].inst.clone())
            .collect()
    }

    #[test]
    fn removes_unreachable_blocks() {
        let mut b = Builder::new(Function::new("main", Type::Void), "entry");
        let dead = b.append_block("dead");
        let exit = b.append_block("exit");
        b.br(exit);

        b.position_at_end(dead);
        b.br(exit);

        b.position_at_end(exit);
        b.ret_void();

        let mut f = b.finish();
        assert_eq!(simplify_cfg(&mut f), 1);

        let names: Vec<_> = f.blocks.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["entry", "exit"]);
        assert_eq!(
            f.terminator(BlockId(0)),
            Some(&Inst::Br { target: BlockId(1) })
        );
        assert_eq!(verify_function(&Module::new("m"), &f), Ok(()));
    }

    #[test]
    fn keeps_loops() {
        let mut b = Builder::new(Function::new("main", Type::Void), "entry");
        let body = b.append_block("body");
        let exit = b.append_block("exit");
        let cond = Value::int(Type::I1, 0);
        b.cond_br(cond, body, exit);

        b.position_at_end(body);
        b.cond_br(cond, body, exit);

        b.position_at_end(exit);
        b.ret_void();

        let mut f = b.finish();
        let before = f.clone();

        assert_eq!(simplify_cfg(&mut f), 0);
        assert_eq!(f, before);
    }

    #[test]
    fn forwards_stored_values_into_loads() {
        let mut module = Module::new("m");
        let putchar =
            module.get_or_insert_extern("putchar", &[Type::I8], Type::I32);

        let mut b = builder();
        let slot = b.alloca(Type::I8, "slot");
        b.store(Value::int(Type::I8, 5), slot);
        let v = b.load(Type::I8, slot, "v");
        let w = b.load(Type::I8, slot, "w");
        let sum = b.add(v, w, "sum");
        b.call(putchar, Type::I32, &[sum], "");
        b.ret_void();
        let mut f = b.finish();

        assert_eq!(forward_loads(&mut f), 2);
        assert_eq!(
            insts_of(&f, 0)[2],
            Inst::Binary {
                op: BinOp::Add,
                lhs: Value::int(Type::I8, 5),
                rhs: Value::int(Type::I8, 5),
            }
        );

        optimize(&mut f);
        assert_eq!(
            insts_of(&f, 0)[2],
            Inst::Call {
                callee: putchar,
                args: vec![Value::int(Type::I8, 10)],
            }
        );
        assert_eq!(verify_function(&module, &f), Ok(()));

        module.add_function(f);
        let mut exec = Executor::new(&b""[..], vec![]);
        exec.run(&module, "main").unwrap();
        assert_eq!(exec.into_output(), vec![10]);
    }

    #[test]
    fn reuses_identical_element_pointers() {
        let array = Type::ByteArray(4);
        let mut b = builder();
        let tape = b.alloca(array, "tape");
        let index = Value::int(Type::I64, 1);
        let p = b.element_ptr(array, tape, index, "p");
        let q = b.element_ptr(array, tape, index, "q");
        b.store(Value::int(Type::I8, 1), p);
        b.store(Value::int(Type::I8, 2), q);
        b.ret_void();
        let mut f = b.finish();

        assert_eq!(forward_loads(&mut f), 1);
        assert_eq!(
            insts_of(&f, 0)[3],
            Inst::Store {
                value: Value::int(Type::I8, 2),
                ptr: p,
            }
        );

        // the first store is now overwritten unread
        assert_eq!(remove_dead_stores(&mut f), 1);
        assert_eq!(f.blocks[0].insts.len(), 4);
    }

    #[test]
    fn stores_forget_other_cells_of_the_same_alloca() {
        let array = Type::ByteArray(4);
        let mut b = builder();
        let tape = b.alloca(array, "tape");
        b.store(Value::zero(array), tape);
        let position = b.alloca(Type::I64, "position");
        let index = b.load(Type::I64, position, "index");
        let first = b.element_ptr(array, tape, Value::int(Type::I64, 0), "p");
        let some = b.element_ptr(array, tape, index, "q");
        let zero = b.load(Type::I8, some, "zero");
        b.store(Value::int(Type::I8, 7), first);
        let unknown = b.load(Type::I8, some, "unknown");
        let seven = b.load(Type::I8, first, "seven");
        b.ret_void();
        let mut f = b.finish();

        // zero and seven are known, but some may alias first
        assert_eq!(forward_loads(&mut f), 2);

        let placed: Vec<_> = f.blocks[0].insts.clone();
        let id = |v: Value| match v {
            Value::Inst(id) => id,
            Value::Const(_) => unreachable!(),
        };
        assert!(placed.contains(&id(index)));
        assert!(!placed.contains(&id(zero)));
        assert!(placed.contains(&id(unknown)));
        assert!(!placed.contains(&id(seven)));
        assert_eq!(verify_function(&Module::new("m"), &f), Ok(()));
    }

    #[test]
    fn merges_constant_chains() {
        let mut b = builder();
        let slot = b.alloca(Type::I8, "slot");
        let x = b.load(Type::I8, slot, "x");
        let one = Value::int(Type::I8, 1);
        let up = b.add(x, one, "up");
        let up = b.add(up, one, "up");
        let down = b.sub(up, Value::int(Type::I8, 3), "down");
        b.store(down, slot);
        b.ret_void();
        let mut f = b.finish();

        optimize(&mut f);

        assert_eq!(
            insts_of(&f, 0),
            vec![
                Inst::Alloca { ty: Type::I8 },
                Inst::Load {
                    ty: Type::I8,
                    ptr: slot
                },
                Inst::Binary {
                    op: BinOp::Add,
                    lhs: x,
                    rhs: Value::int(Type::I8, -1),
                },
                Inst::Store { value: down, ptr: slot },
                Inst::Ret { value: None },
            ]
        );
    }

    #[test]
    fn constant_branches_drop_dead_blocks() {
        let mut b = builder();
        let body = b.append_block("body");
        let exit = b.append_block("exit");
        let zero = Value::int(Type::I8, 0);
        let equal = b.icmp_eq(zero, zero, "equal");
        b.cond_br(equal, exit, body);

        b.position_at_end(body);
        b.br(exit);

        b.position_at_end(exit);
        b.ret_void();
        let mut f = b.finish();

        assert!(optimize(&mut f) > 0);

        let names: Vec<_> = f.blocks.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["entry", "exit"]);
        assert_eq!(insts_of(&f, 0), vec![Inst::Br { target: BlockId(1) }]);
        assert_eq!(verify_function(&Module::new("m"), &f), Ok(()));
    }

    #[test]
    fn keeps_side_effects() {
        let mut module = Module::new("m");
        let getchar = module.get_or_insert_extern("getchar", &[], Type::I32);

        let mut b = builder();
        b.call(getchar, Type::I32, &[], "unused");
        b.ret_void();
        let mut f = b.finish();

        assert_eq!(optimize(&mut f), 0);
        assert_eq!(f.blocks[0].insts.len(), 2);
    }
}
