use std::collections::HashMap;

use iced_x86::{
    code_asm::{self, AsmRegister64, CodeAssembler, CodeLabel},
    IcedError,
};
use thiserror::Error;

use crate::{
    ir::{
        verify::{verify_function, VerifyError},
        BinOp, CmpOp, Constant, Function, Inst, InstId, Module, Type, Value,
    },
    segment,
};

use super::elf::{compile_to_elf, LabelMap, PhdrFlags, Segment, SegmentBuilder};

use code_asm as asm;

#[derive(Error, Debug)]
pub enum CompilerError {
    #[error("could not generate asm: {0}")]
    Assemble(#[from] IcedError),
    #[error("missing patch")]
    MissingPatch,
    #[error("missing _start label")]
    MissingEntryPoint,
    #[error("missing label: {0}")]
    MissingLabel(&'static str),
    #[error("no function named {0}")]
    MissingFunction(String),
    #[error("refusing to compile invalid IR: {0}")]
    Verify(#[from] VerifyError),
    #[error("cannot lower {0}")]
    Unsupported(String),
    #[error("only little-endian hosts can write x86-64 executables")]
    UnsupportedTarget,
}

// frame base = RBX, kept across syscalls
// scratch = RAX/RCX/RDX/RSI/RDI

/// Static storage for the entry routine: each `alloca`, one 8-byte slot per
/// computed value, and a byte of scratch for syscalls. Frame offsets are
/// relative to the `frame` label.
struct FrameLayout {
    allocas: HashMap<InstId, u32>,
    slots: HashMap<InstId, u32>,
    scratch: u32,
    size: u32,
}

impl FrameLayout {
    fn new(function: &Function) -> Result<Self, CompilerError> {
        let mut allocas = HashMap::new();
        let mut slots = HashMap::new();
        let mut size: u64 = 0;

        for (_, id) in function.iter_insts() {
            let Some(data) = function.inst(id) else {
                continue;
            };

            match data.inst {
                Inst::Alloca { ty } => {
                    allocas.insert(id, size as u32);
                    size += ty.size().next_multiple_of(8);
                }
                _ if data.ty != Type::Void => {
                    slots.insert(id, size as u32);
                    size += 8;
                }
                _ => {}
            }
        }

        let scratch = size as u32;
        size += 8;

        let size = u32::try_from(size)
            .ok()
            .filter(|size| *size <= i32::MAX as u32)
            .ok_or_else(|| {
                CompilerError::Unsupported("a frame over 2GiB".into())
            })?;

        Ok(FrameLayout {
            allocas,
            slots,
            scratch,
            size,
        })
    }
}

struct DataSegment {
    size: u32,
}

impl SegmentBuilder for DataSegment {
    fn code(&self, _labels: &LabelMap) -> Result<Segment, CompilerError> {
        let mut a = CodeAssembler::new(64)?;

        // the frame is zero-filled at load time and never stored in the file
        let mut frame = a.create_label();
        a.set_label(&mut frame)?;
        a.db(&[0u8; 8])?;

        Ok(segment!(a, frame).with_zeroed(self.size as u64))
    }

    fn flags(&self) -> PhdrFlags {
        PhdrFlags::R | PhdrFlags::W
    }
}

struct TextSegment<'a> {
    module: &'a Module,
    function: &'a Function,
    layout: &'a FrameLayout,
}

struct Lowering<'a> {
    a: CodeAssembler,
    module: &'a Module,
    function: &'a Function,
    layout: &'a FrameLayout,
    blocks: Vec<CodeLabel>,
}

impl Lowering<'_> {
    fn slot(&self, id: InstId) -> Result<u32, CompilerError> {
        self.layout
            .slots
            .get(&id)
            .copied()
            .ok_or_else(|| {
                CompilerError::Unsupported(format!("value %{}", id.0))
            })
    }

    fn value_type(&self, value: Value) -> Result<Type, CompilerError> {
        self.function
            .value_type(value)
            .ok_or_else(|| CompilerError::Unsupported(format!("{value:?}")))
    }

    fn load_operand(
        &mut self,
        reg: AsmRegister64,
        value: Value,
    ) -> Result<(), CompilerError> {
        match value {
            Value::Const(Constant::Int { value, .. }) => {
                self.a.mov(reg, value)?
            }
            Value::Const(Constant::Zero(_)) => self.a.mov(reg, 0u64)?,
            Value::Inst(id) => match self.layout.allocas.get(&id) {
                Some(offset) => self.a.lea(reg, asm::rbx + *offset)?,
                None => {
                    let slot = self.slot(id)?;
                    self.a.mov(reg, asm::qword_ptr(asm::rbx + slot))?
                }
            },
        }

        Ok(())
    }

    fn store_result(&mut self, id: InstId) -> Result<(), CompilerError> {
        let slot = self.slot(id)?;
        self.a.mov(asm::qword_ptr(asm::rbx + slot), asm::rax)?;

        Ok(())
    }

    // values live zero-extended to 64 bits
    fn zero_extend_rax(&mut self, ty: Type) -> Result<(), CompilerError> {
        match ty {
            Type::I1 | Type::I8 => self.a.movzx(asm::eax, asm::al)?,
            Type::I32 => self.a.mov(asm::eax, asm::eax)?,
            _ => {}
        }

        Ok(())
    }

    fn emit_load(&mut self, ty: Type, ptr: Value) -> Result<(), CompilerError> {
        self.load_operand(asm::rcx, ptr)?;

        match ty {
            Type::I1 | Type::I8 => {
                self.a.movzx(asm::eax, asm::byte_ptr(asm::rcx))?
            }
            Type::I32 => self.a.mov(asm::eax, asm::dword_ptr(asm::rcx))?,
            Type::I64 | Type::Ptr => {
                self.a.mov(asm::rax, asm::qword_ptr(asm::rcx))?
            }
            other => {
                return Err(CompilerError::Unsupported(format!(
                    "load of {other}"
                )))
            }
        }

        Ok(())
    }

    fn emit_store(
        &mut self,
        value: Value,
        ptr: Value,
    ) -> Result<(), CompilerError> {
        // zeroinitializer of an aggregate: rep stosb
        if let Value::Const(Constant::Zero(Type::ByteArray(len))) = value {
            self.load_operand(asm::rdi, ptr)?;
            self.a.mov(asm::rcx, len)?;
            self.a.xor(asm::eax, asm::eax)?;
            self.a.rep().stosb()?;
            return Ok(());
        }

        let ty = self.value_type(value)?;
        self.load_operand(asm::rax, value)?;
        self.load_operand(asm::rcx, ptr)?;

        match ty {
            Type::I1 | Type::I8 => {
                self.a.mov(asm::byte_ptr(asm::rcx), asm::al)?
            }
            Type::I32 => self.a.mov(asm::dword_ptr(asm::rcx), asm::eax)?,
            Type::I64 | Type::Ptr => {
                self.a.mov(asm::qword_ptr(asm::rcx), asm::rax)?
            }
            other => {
                return Err(CompilerError::Unsupported(format!(
                    "store of {other}"
                )))
            }
        }

        Ok(())
    }

    fn emit_write_byte(&mut self, value: Value) -> Result<(), CompilerError> {
        let scratch = self.layout.scratch;

        self.load_operand(asm::rax, value)?;
        self.a.mov(asm::byte_ptr(asm::rbx + scratch), asm::al)?;

        self.a.mov(asm::rax, 1u64)?;
        self.a.mov(asm::rdi, 1u64)?;
        self.a.lea(asm::rsi, asm::rbx + scratch)?;
        self.a.mov(asm::rdx, 1u64)?;
        self.a.syscall()?;

        // putchar returns the byte it wrote
        self.a.movzx(asm::eax, asm::byte_ptr(asm::rbx + scratch))?;

        Ok(())
    }

    fn emit_read_byte(&mut self) -> Result<(), CompilerError> {
        let scratch = self.layout.scratch;
        let mut eof = self.a.create_label();
        let mut done = self.a.create_label();

        self.a.mov(asm::rax, 0u64)?;
        self.a.mov(asm::rdi, 0u64)?;
        self.a.lea(asm::rsi, asm::rbx + scratch)?;
        self.a.mov(asm::rdx, 1u64)?;
        self.a.syscall()?;

        self.a.cmp(asm::rax, 1)?;
        self.a.jne(eof)?;
        self.a.movzx(asm::eax, asm::byte_ptr(asm::rbx + scratch))?;
        self.a.jmp(done)?;

        // getchar returns -1 on EOF or error
        self.a.set_label(&mut eof)?;
        self.a.mov(asm::eax, u32::MAX)?;

        self.a.set_label(&mut done)?;

        Ok(())
    }

    fn emit_call(
        &mut self,
        id: InstId,
        callee: &str,
        args: &[Value],
    ) -> Result<(), CompilerError> {
        match (callee, args) {
            ("putchar", [value]) => self.emit_write_byte(*value)?,
            ("getchar", []) => self.emit_read_byte()?,
            _ => {
                return Err(CompilerError::Unsupported(format!(
                    "call to {callee} with {} arguments",
                    args.len()
                )))
            }
        }

        self.store_result(id)
    }

    fn emit_inst(&mut self, id: InstId) -> Result<(), CompilerError> {
        let function = self.function;
        let data = function.inst(id).ok_or_else(|| {
            CompilerError::Unsupported(format!("instruction %{}", id.0))
        })?;

        match &data.inst {
            // storage is laid out statically in the frame
            Inst::Alloca { .. } => {}
            Inst::Load { ty, ptr } => {
                self.emit_load(*ty, *ptr)?;
                self.store_result(id)?;
            }
            Inst::Store { value, ptr } => self.emit_store(*value, *ptr)?,
            Inst::Binary { op, lhs, rhs } => {
                self.load_operand(asm::rax, *lhs)?;
                self.load_operand(asm::rcx, *rhs)?;
                match op {
                    BinOp::Add => self.a.add(asm::rax, asm::rcx)?,
                    BinOp::Sub => self.a.sub(asm::rax, asm::rcx)?,
                }
                self.zero_extend_rax(data.ty)?;
                self.store_result(id)?;
            }
            Inst::ElementPtr { base, index, .. } => {
                self.load_operand(asm::rax, *base)?;
                self.load_operand(asm::rcx, *index)?;
                match self.value_type(*index)? {
                    Type::I1 | Type::I8 => self.a.movsx(asm::rcx, asm::cl)?,
                    Type::I32 => self.a.movsxd(asm::rcx, asm::ecx)?,
                    _ => {}
                }
                // unchecked, like the IR it comes from
                self.a.add(asm::rax, asm::rcx)?;
                self.store_result(id)?;
            }
            Inst::Compare { op, lhs, rhs } => {
                self.load_operand(asm::rax, *lhs)?;
                self.load_operand(asm::rcx, *rhs)?;
                self.a.cmp(asm::rax, asm::rcx)?;
                match op {
                    CmpOp::Eq => self.a.sete(asm::al)?,
                    CmpOp::Ne => self.a.setne(asm::al)?,
                }
                self.a.movzx(asm::eax, asm::al)?;
                self.store_result(id)?;
            }
            Inst::Call { callee, args } => {
                let module = self.module;
                let decl = module.extern_fn(*callee).ok_or_else(|| {
                    CompilerError::Unsupported(format!(
                        "undeclared callee #{}",
                        callee.0
                    ))
                })?;
                self.emit_call(id, &decl.name, args)?;
            }
            Inst::Trunc { value, to } => {
                self.load_operand(asm::rax, *value)?;
                self.zero_extend_rax(*to)?;
                self.store_result(id)?;
            }
            // returning from the entry routine ends the process
            Inst::Ret { .. } => {
                self.a.mov(asm::rax, 60u64)?;
                self.a.mov(asm::rdi, 0u64)?;
                self.a.syscall()?;
            }
            Inst::Br { target } => {
                let target = self.blocks[target.0];
                self.a.jmp(target)?;
            }
            Inst::CondBr {
                cond,
                then_block,
                else_block,
            } => {
                let (then_label, else_label) =
                    (self.blocks[then_block.0], self.blocks[else_block.0]);
                self.load_operand(asm::rax, *cond)?;
                self.a.test(asm::rax, asm::rax)?;
                self.a.jne(then_label)?;
                self.a.jmp(else_label)?;
            }
        }

        Ok(())
    }
}

impl SegmentBuilder for TextSegment<'_> {
    fn code(&self, labels: &LabelMap) -> Result<Segment, CompilerError> {
        let mut a = CodeAssembler::new(64)?;

        let mut _start = a.create_label();
        a.set_label(&mut _start)?;

        // setup
        let frame = labels.get("frame")?;
        a.mov(asm::rbx, frame)?;

        let blocks = self
            .function
            .blocks
            .iter()
            .map(|_| a.create_label())
            .collect();

        let mut lowering = Lowering {
            a,
            module: self.module,
            function: self.function,
            layout: self.layout,
            blocks,
        };

        for (b, block) in self.function.blocks.iter().enumerate() {
            lowering.a.set_label(&mut lowering.blocks[b])?;

            for id in &block.insts {
                lowering.emit_inst(*id)?;
            }
        }

        Ok(segment!(lowering.a, _start))
    }

    fn flags(&self) -> PhdrFlags {
        PhdrFlags::X | PhdrFlags::R
    }
}

/// Compiles the `entry` routine of `module` into a static x86-64 Linux
/// executable. The routine runs once, with its storage in a zero-filled
/// data segment, and its `ret` exits with status 0.
pub fn compile(module: &Module, entry: &str) -> Result<Vec<u8>, CompilerError> {
    let function = module
        .function(entry)
        .ok_or_else(|| CompilerError::MissingFunction(entry.to_string()))?;

    verify_function(module, function)?;

    let layout = FrameLayout::new(function)?;
    let ds = DataSegment { size: layout.size };
    let ts = TextSegment {
        module,
        function,
        layout: &layout,
    };

    compile_to_elf(&[&ds, &ts])
}
