use super::{
    BinOp, Block, BlockId, CmpOp, ExternId, Function, Inst, InstData, InstId,
    Type, Value,
};

/// Appends instructions to a [`Function`] at an insertion cursor.
///
/// The builder owns the function while it is being built; [`Builder::finish`]
/// hands it back. Emission itself never fails: a malformed function is
/// caught by the verifier instead.
pub struct Builder {
    function: Function,
    cursor: BlockId,
}

impl Builder {
    /// Starts building `function`, adding a block named `entry_name` and
    /// positioning the cursor at its end.
    pub fn new(mut function: Function, entry_name: &str) -> Self {
        function.blocks.push(Block {
            name: entry_name.to_string(),
            insts: vec![],
        });
        let cursor = BlockId(function.blocks.len() - 1);

        Builder { function, cursor }
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    pub fn finish(self) -> Function {
        self.function
    }

    pub fn append_block(&mut self, name: &str) -> BlockId {
        self.function.blocks.push(Block {
            name: name.to_string(),
            insts: vec![],
        });

        BlockId(self.function.blocks.len() - 1)
    }

    pub fn position_at_end(&mut self, block: BlockId) {
        self.cursor = block;
    }

    pub fn insert_block(&self) -> BlockId {
        self.cursor
    }

    fn push(&mut self, inst: Inst, ty: Type, name: Option<&str>) -> Value {
        let id = InstId(self.function.insts.len());
        self.function.insts.push(InstData {
            inst,
            ty,
            name: name.filter(|n| !n.is_empty()).map(str::to_string),
        });

        // an out of range cursor is left for the verifier to report
        if let Some(block) = self.function.blocks.get_mut(self.cursor.0) {
            block.insts.push(id);
        }

        Value::Inst(id)
    }

    fn type_of(&self, value: Value) -> Type {
        self.function.value_type(value).unwrap_or(Type::Void)
    }

    pub fn alloca(&mut self, ty: Type, name: &str) -> Value {
        self.push(Inst::Alloca { ty }, Type::Ptr, Some(name))
    }

    pub fn load(&mut self, ty: Type, ptr: Value, name: &str) -> Value {
        self.push(Inst::Load { ty, ptr }, ty, Some(name))
    }

    pub fn store(&mut self, value: Value, ptr: Value) {
        self.push(Inst::Store { value, ptr }, Type::Void, None);
    }

    pub fn add(&mut self, lhs: Value, rhs: Value, name: &str) -> Value {
        self.binary(BinOp::Add, lhs, rhs, name)
    }

    pub fn sub(&mut self, lhs: Value, rhs: Value, name: &str) -> Value {
        self.binary(BinOp::Sub, lhs, rhs, name)
    }

    fn binary(
        &mut self,
        op: BinOp,
        lhs: Value,
        rhs: Value,
        name: &str,
    ) -> Value {
        let ty = self.type_of(lhs);
        self.push(Inst::Binary { op, lhs, rhs }, ty, Some(name))
    }

    pub fn element_ptr(
        &mut self,
        array: Type,
        base: Value,
        index: Value,
        name: &str,
    ) -> Value {
        self.push(
            Inst::ElementPtr { array, base, index },
            Type::Ptr,
            Some(name),
        )
    }

    pub fn icmp_ne(&mut self, lhs: Value, rhs: Value, name: &str) -> Value {
        self.compare(CmpOp::Ne, lhs, rhs, name)
    }

    pub fn icmp_eq(&mut self, lhs: Value, rhs: Value, name: &str) -> Value {
        self.compare(CmpOp::Eq, lhs, rhs, name)
    }

    fn compare(
        &mut self,
        op: CmpOp,
        lhs: Value,
        rhs: Value,
        name: &str,
    ) -> Value {
        self.push(Inst::Compare { op, lhs, rhs }, Type::I1, Some(name))
    }

    /// Calls an external function returning `ret`.
    pub fn call(
        &mut self,
        callee: ExternId,
        ret: Type,
        args: &[Value],
        name: &str,
    ) -> Value {
        let args = args.to_vec();
        let name = (ret != Type::Void).then_some(name);
        self.push(Inst::Call { callee, args }, ret, name)
    }

    pub fn trunc(&mut self, value: Value, to: Type, name: &str) -> Value {
        self.push(Inst::Trunc { value, to }, to, Some(name))
    }

    pub fn ret_void(&mut self) {
        self.push(Inst::Ret { value: None }, Type::Void, None);
    }

    pub fn ret(&mut self, value: Value) {
        self.push(Inst::Ret { value: Some(value) }, Type::Void, None);
    }

    pub fn br(&mut self, target: BlockId) {
        self.push(Inst::Br { target }, Type::Void, None);
    }

    pub fn cond_br(
        &mut self,
        cond: Value,
        then_block: BlockId,
        else_block: BlockId,
    ) {
        self.push(
            Inst::CondBr {
                cond,
                then_block,
                else_block,
            },
            Type::Void,
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn emits_at_cursor() {
        let mut b = Builder::new(Function::new("f", Type::Void), "entry");
        let exit = b.append_block("exit");

        let slot = b.alloca(Type::I64, "slot");
        b.br(exit);
        b.position_at_end(exit);
        let loaded = b.load(Type::I64, slot, "loaded");
        b.ret_void();

        let f = b.finish();

        assert_eq!(f.blocks[0].insts, vec![InstId(0), InstId(1)]);
        assert_eq!(f.blocks[1].insts, vec![InstId(2), InstId(3)]);
        assert_eq!(f.value_type(slot), Some(Type::Ptr));
        assert_eq!(f.value_type(loaded), Some(Type::I64));
        assert_eq!(f.terminator(BlockId(0)), Some(&Inst::Br { target: exit }));
    }

    #[test]
    fn binary_takes_lhs_type() {
        let mut b = Builder::new(Function::new("f", Type::Void), "entry");
        let lhs = Value::int(Type::I8, 250);
        let sum = b.add(lhs, Value::int(Type::I8, 10), "sum");

        assert_eq!(b.function().value_type(sum), Some(Type::I8));
    }

    #[test]
    fn cursor_follows_positioning() {
        let mut b = Builder::new(Function::new("f", Type::Void), "entry");
        assert_eq!(b.insert_block(), BlockId(0));

        let body = b.append_block("body");
        // appending does not move the cursor
        assert_eq!(b.insert_block(), BlockId(0));

        b.position_at_end(body);
        assert_eq!(b.insert_block(), body);
    }

    #[test]
    fn comparisons_produce_booleans() {
        let mut b = Builder::new(Function::new("f", Type::Void), "entry");
        let zero = Value::int(Type::I8, 0);
        let eq = b.icmp_eq(zero, zero, "eq");
        let ne = b.icmp_ne(zero, zero, "ne");

        let f = b.finish();

        assert_eq!(f.value_type(eq), Some(Type::I1));
        assert_eq!(
            f.inst(InstId(0)).map(|data| &data.inst),
            Some(&Inst::Compare {
                op: CmpOp::Eq,
                lhs: zero,
                rhs: zero
            })
        );
        assert_eq!(f.value_type(ne), Some(Type::I1));
    }

    #[test]
    fn ret_carries_its_value() {
        let mut b = Builder::new(Function::new("f", Type::I32), "entry");
        b.ret(Value::int(Type::I32, 3));

        let f = b.finish();

        assert_eq!(
            f.terminator(BlockId(0)),
            Some(&Inst::Ret {
                value: Some(Value::int(Type::I32, 3))
            })
        );
    }
}
