//! A small, target-independent, LLVM-flavoured IR.
//!
//! A [`Module`] holds defined [`Function`]s and external declarations. A
//! function owns an arena of [`Inst`]s and a list of [`Block`]s which refer
//! into that arena by [`InstId`]. Every block must end in exactly one
//! terminator; [`verify::verify_function`] checks this and the operand
//! types.

pub mod builder;
pub mod display;
pub mod exec;
pub mod passes;
pub mod verify;

pub use builder::Builder;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    I1,
    I8,
    I32,
    I64,
    Ptr,
    /// `[len x i8]`
    ByteArray(u64),
}

impl Type {
    pub fn is_int(self) -> bool {
        matches!(self, Type::I1 | Type::I8 | Type::I32 | Type::I64)
    }

    /// Width of an integer type in bits.
    pub fn bits(self) -> Option<u32> {
        match self {
            Type::I1 => Some(1),
            Type::I8 => Some(8),
            Type::I32 => Some(32),
            Type::I64 | Type::Ptr => Some(64),
            Type::Void | Type::ByteArray(_) => None,
        }
    }

    /// Number of bytes the type occupies in storage.
    pub fn size(self) -> u64 {
        match self {
            Type::Void => 0,
            Type::I1 | Type::I8 => 1,
            Type::I32 => 4,
            Type::I64 | Type::Ptr => 8,
            Type::ByteArray(len) => len,
        }
    }

    /// Truncates `value` to the width of this type.
    pub fn mask(self, value: u64) -> u64 {
        match self.bits() {
            Some(64) | None => value,
            Some(bits) => value & ((1u64 << bits) - 1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Constant {
    Int { ty: Type, value: u64 },
    /// The all-zero value of any type (`zeroinitializer`).
    Zero(Type),
}

impl Constant {
    pub fn int(ty: Type, value: i64) -> Self {
        Constant::Int {
            ty,
            value: ty.mask(value as u64),
        }
    }

    pub fn ty(self) -> Type {
        match self {
            Constant::Int { ty, .. } | Constant::Zero(ty) => ty,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExternId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    Const(Constant),
    Inst(InstId),
}

impl Value {
    pub fn int(ty: Type, value: i64) -> Self {
        Value::Const(Constant::int(ty, value))
    }

    pub fn zero(ty: Type) -> Self {
        Value::Const(Constant::Zero(ty))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Inst {
    Alloca {
        ty: Type,
    },
    Load {
        ty: Type,
        ptr: Value,
    },
    Store {
        value: Value,
        ptr: Value,
    },
    Binary {
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    /// Address of byte `index` of the array at `base`.
    ElementPtr {
        array: Type,
        base: Value,
        index: Value,
    },
    Compare {
        op: CmpOp,
        lhs: Value,
        rhs: Value,
    },
    Call {
        callee: ExternId,
        args: Vec<Value>,
    },
    Trunc {
        value: Value,
        to: Type,
    },

    Ret {
        value: Option<Value>,
    },
    Br {
        target: BlockId,
    },
    CondBr {
        cond: Value,
        then_block: BlockId,
        else_block: BlockId,
    },
}

impl Inst {
    pub fn is_terminator(&self) -> bool {
        matches!(self, Inst::Ret { .. } | Inst::Br { .. } | Inst::CondBr { .. })
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match *self {
            Inst::Br { target } => vec![target],
            Inst::CondBr {
                then_block,
                else_block,
                ..
            } => vec![then_block, else_block],
            _ => vec![],
        }
    }

    pub fn operands(&self) -> Vec<Value> {
        match self {
            Inst::Alloca { .. } | Inst::Br { .. } => vec![],
            Inst::Load { ptr, .. } => vec![*ptr],
            Inst::Store { value, ptr } => vec![*value, *ptr],
            Inst::Binary { lhs, rhs, .. } | Inst::Compare { lhs, rhs, .. } => {
                vec![*lhs, *rhs]
            }
            Inst::ElementPtr { base, index, .. } => vec![*base, *index],
            Inst::Call { args, .. } => args.clone(),
            Inst::Trunc { value, .. } => vec![*value],
            Inst::Ret { value } => value.iter().copied().collect(),
            Inst::CondBr { cond, .. } => vec![*cond],
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut Value> {
        match self {
            Inst::Alloca { .. } | Inst::Br { .. } => vec![],
            Inst::Load { ptr, .. } => vec![ptr],
            Inst::Store { value, ptr } => vec![value, ptr],
            Inst::Binary { lhs, rhs, .. } | Inst::Compare { lhs, rhs, .. } => {
                vec![lhs, rhs]
            }
            Inst::ElementPtr { base, index, .. } => vec![base, index],
            Inst::Call { args, .. } => args.iter_mut().collect(),
            Inst::Trunc { value, .. } => vec![value],
            Inst::Ret { value } => value.iter_mut().collect(),
            Inst::CondBr { cond, .. } => vec![cond],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstData {
    pub inst: Inst,
    /// Result type, `Void` for instructions that produce nothing.
    pub ty: Type,
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub name: String,
    pub insts: Vec<InstId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub ret: Type,
    pub insts: Vec<InstData>,
    pub blocks: Vec<Block>,
}

impl Function {
    pub fn new(name: impl Into<String>, ret: Type) -> Self {
        Function {
            name: name.into(),
            ret,
            insts: vec![],
            blocks: vec![],
        }
    }

    pub fn inst(&self, id: InstId) -> Option<&InstData> {
        self.insts.get(id.0)
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.0)
    }

    pub fn entry(&self) -> Option<BlockId> {
        (!self.blocks.is_empty()).then_some(BlockId(0))
    }

    pub fn value_type(&self, value: Value) -> Option<Type> {
        match value {
            Value::Const(c) => Some(c.ty()),
            Value::Inst(id) => self.inst(id).map(|data| data.ty),
        }
    }

    pub fn terminator(&self, block: BlockId) -> Option<&Inst> {
        let last = *self.block(block)?.insts.last()?;
        let data = self.inst(last)?;
        data.inst.is_terminator().then_some(&data.inst)
    }

    /// Instructions in block order, skipping any left orphaned by passes.
    pub fn iter_insts(&self) -> impl Iterator<Item = (BlockId, InstId)> + '_ {
        self.blocks.iter().enumerate().flat_map(|(b, block)| {
            block.insts.iter().map(move |&i| (BlockId(b), i))
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternFunction {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub externs: Vec<ExternFunction>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            externs: vec![],
            functions: vec![],
        }
    }

    /// Returns the declaration named `name`, declaring it if this is the
    /// first use.
    pub fn get_or_insert_extern(
        &mut self,
        name: &str,
        params: &[Type],
        ret: Type,
    ) -> ExternId {
        if let Some(pos) = self.externs.iter().position(|e| e.name == name) {
            return ExternId(pos);
        }

        self.externs.push(ExternFunction {
            name: name.to_string(),
            params: params.to_vec(),
            ret,
        });

        ExternId(self.externs.len() - 1)
    }

    pub fn extern_fn(&self, id: ExternId) -> Option<&ExternFunction> {
        self.externs.get(id.0)
    }

    pub fn add_function(&mut self, function: Function) {
        self.functions.push(function);
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }
}
