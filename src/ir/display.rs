//! Textual rendering of a [`Module`], close to LLVM's assembly syntax.

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use itertools::Itertools;

use super::{
    BinOp, BlockId, CmpOp, Constant, Function, Inst, InstId, Module, Type,
    Value,
};

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => f.write_str("void"),
            Type::I1 => f.write_str("i1"),
            Type::I8 => f.write_str("i8"),
            Type::I32 => f.write_str("i32"),
            Type::I64 => f.write_str("i64"),
            Type::Ptr => f.write_str("ptr"),
            Type::ByteArray(len) => write!(f, "[{len} x i8]"),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Constant::Int { ty: Type::I1, value } => {
                f.write_str(if value != 0 { "true" } else { "false" })
            }
            Constant::Int { ty, value } => {
                // integers print as signed, like llvm does
                let shift = 64 - ty.bits().unwrap_or(64);
                write!(f, "{}", ((value << shift) as i64) >> shift)
            }
            Constant::Zero(Type::ByteArray(_)) => {
                f.write_str("zeroinitializer")
            }
            Constant::Zero(Type::Ptr) => f.write_str("null"),
            Constant::Zero(Type::I1) => f.write_str("false"),
            Constant::Zero(_) => f.write_str("0"),
        }
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinOp::Add => f.write_str("add"),
            BinOp::Sub => f.write_str("sub"),
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmpOp::Eq => f.write_str("eq"),
            CmpOp::Ne => f.write_str("ne"),
        }
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
}

fn sigil(name: &str) -> String {
    if is_plain_name(name) {
        name.to_string()
    } else {
        format!("\"{name}\"")
    }
}

/// Unique local names for one function. Blocks and values share a
/// namespace; clashes get a numeric suffix and unnamed values are numbered.
struct Names {
    values: HashMap<InstId, String>,
    blocks: Vec<String>,
}

impl Names {
    fn new(function: &Function) -> Self {
        let mut taken = HashSet::new();
        let mut counters: HashMap<String, usize> = HashMap::new();
        let mut next_unnamed = 0;

        let mut unique = |base: &str| -> String {
            let mut candidate = sigil(base);
            while !taken.insert(candidate.clone()) {
                let counter = counters.entry(base.to_string()).or_insert(0);
                *counter += 1;
                candidate = sigil(&format!("{base}{counter}"));
            }
            candidate
        };

        let blocks: Vec<String> =
            function.blocks.iter().map(|b| unique(&b.name)).collect();

        let mut values = HashMap::new();
        for (_, id) in function.iter_insts() {
            let Some(data) = function.inst(id) else {
                continue;
            };
            if data.ty == Type::Void {
                continue;
            }

            let name = match &data.name {
                Some(name) => unique(name),
                None => {
                    let name = next_unnamed.to_string();
                    next_unnamed += 1;
                    name
                }
            };
            values.insert(id, name);
        }

        Names { values, blocks }
    }

    fn block(&self, id: BlockId) -> String {
        match self.blocks.get(id.0) {
            Some(name) => format!("%{name}"),
            None => format!("%<bad block #{}>", id.0),
        }
    }

    fn value(&self, value: Value) -> String {
        match value {
            Value::Const(c) => c.to_string(),
            Value::Inst(id) => match self.values.get(&id) {
                Some(name) => format!("%{name}"),
                None => format!("%<bad value #{}>", id.0),
            },
        }
    }
}

struct FunctionPrinter<'a> {
    module: &'a Module,
    function: &'a Function,
    names: Names,
}

impl FunctionPrinter<'_> {
    fn typed(&self, value: Value) -> String {
        let ty = self.function.value_type(value).unwrap_or(Type::Void);
        format!("{ty} {}", self.names.value(value))
    }

    fn inst(&self, f: &mut fmt::Formatter<'_>, id: InstId) -> fmt::Result {
        let Some(data) = self.function.inst(id) else {
            return writeln!(f, "  ; missing instruction #{}", id.0);
        };

        f.write_str("  ")?;
        if data.ty != Type::Void {
            write!(f, "{} = ", self.names.value(Value::Inst(id)))?;
        }

        match &data.inst {
            Inst::Alloca { ty } => write!(f, "alloca {ty}")?,
            Inst::Load { ty, ptr } => {
                write!(f, "load {ty}, {}", self.typed(*ptr))?
            }
            Inst::Store { value, ptr } => {
                write!(f, "store {}, {}", self.typed(*value), self.typed(*ptr))?
            }
            Inst::Binary { op, lhs, rhs } => write!(
                f,
                "{op} {}, {}",
                self.typed(*lhs),
                self.names.value(*rhs)
            )?,
            Inst::ElementPtr { array, base, index } => write!(
                f,
                "getelementptr {array}, {}, i64 0, {}",
                self.typed(*base),
                self.typed(*index)
            )?,
            Inst::Compare { op, lhs, rhs } => write!(
                f,
                "icmp {op} {}, {}",
                self.typed(*lhs),
                self.names.value(*rhs)
            )?,
            Inst::Call { callee, args } => {
                let name = self
                    .module
                    .extern_fn(*callee)
                    .map_or("<undeclared>", |decl| decl.name.as_str());
                write!(
                    f,
                    "call {} @{name}({})",
                    data.ty,
                    args.iter().map(|arg| self.typed(*arg)).join(", ")
                )?
            }
            Inst::Trunc { value, to } => {
                write!(f, "trunc {} to {to}", self.typed(*value))?
            }
            Inst::Ret { value: None } => f.write_str("ret void")?,
            Inst::Ret { value: Some(value) } => {
                write!(f, "ret {}", self.typed(*value))?
            }
            Inst::Br { target } => {
                write!(f, "br label {}", self.names.block(*target))?
            }
            Inst::CondBr {
                cond,
                then_block,
                else_block,
            } => write!(
                f,
                "br {}, label {}, label {}",
                self.typed(*cond),
                self.names.block(*then_block),
                self.names.block(*else_block)
            )?,
        }

        writeln!(f)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; ModuleID = '{}'", self.name)?;

        for decl in &self.externs {
            writeln!(f)?;
            writeln!(
                f,
                "declare {} @{}({})",
                decl.ret,
                decl.name,
                decl.params.iter().join(", ")
            )?;
        }

        for function in &self.functions {
            let printer = FunctionPrinter {
                module: self,
                function,
                names: Names::new(function),
            };

            writeln!(f)?;
            writeln!(f, "define {} @{}() {{", function.ret, function.name)?;
            for (b, block) in function.blocks.iter().enumerate() {
                if b > 0 {
                    writeln!(f)?;
                }
                writeln!(f, "{}:", &printer.names.block(BlockId(b))[1..])?;
                for id in &block.insts {
                    printer.inst(f, *id)?;
                }
            }
            writeln!(f, "}}")?;
        }

        Ok(())
    }
}
