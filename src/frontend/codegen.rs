use std::slice;

use thiserror::Error;

use crate::{
    frontend::parser::{Instruction, Program},
    ir::{
        verify::{verify_function, VerifyError},
        BlockId, Builder, ExternId, Function, Module, Type, Value,
    },
};

/// Number of cells on the tape.
pub const TAPE_SIZE: u64 = 0x4000;

pub const MODULE_NAME: &str = "brainfuck";
pub const ENTRY_POINT: &str = "main";

const TAPE: Type = Type::ByteArray(TAPE_SIZE);

#[derive(Error, Debug)]
pub enum CodegenError {
    #[error("generated code failed verification: {0}")]
    Verify(#[from] VerifyError),
}

/// A loop whose body is being emitted: the instructions after it and its
/// blocks.
struct OpenLoop<'p> {
    rest: slice::Iter<'p, Instruction>,
    body: BlockId,
    merge: BlockId,
}

/// Generation state for one program: the module being filled in, the
/// builder (which owns the entry routine and the insertion cursor) and the
/// storage for the tape and the data pointer.
struct CodeGen {
    module: Module,
    builder: Builder,
    position: Value,
    tape: Value,
}

impl CodeGen {
    fn new() -> Self {
        let module = Module::new(MODULE_NAME);
        let mut builder =
            Builder::new(Function::new(ENTRY_POINT, Type::Void), "entry");

        let position = builder.alloca(Type::I64, "position");
        builder.store(Value::int(Type::I64, 0), position);

        let tape = builder.alloca(TAPE, "tape");
        builder.store(Value::zero(TAPE), tape);

        CodeGen {
            module,
            builder,
            position,
            tape,
        }
    }

    fn putchar(&mut self) -> ExternId {
        self.module
            .get_or_insert_extern("putchar", &[Type::I8], Type::I32)
    }

    fn getchar(&mut self) -> ExternId {
        self.module.get_or_insert_extern("getchar", &[], Type::I32)
    }

    fn cell_ptr(&mut self) -> Value {
        let b = &mut self.builder;
        let position = b.load(Type::I64, self.position, "position");
        b.element_ptr(TAPE, self.tape, position, "cell.ptr")
    }

    fn load_cell(&mut self) -> Value {
        let ptr = self.cell_ptr();
        self.builder.load(Type::I8, ptr, "cell")
    }

    fn cell_is_nonzero(&mut self) -> Value {
        let cell = self.load_cell();
        self.builder
            .icmp_ne(cell, Value::int(Type::I8, 0), "nonzero")
    }

    /// Emits `instrs` at the cursor. Loops are entered and left through an
    /// explicit stack of the enclosing loops' blocks, so nesting depth is
    /// bounded only by memory.
    fn emit_block(&mut self, instrs: &[Instruction]) {
        let mut enclosing: Vec<OpenLoop<'_>> = vec![];
        let mut rest = instrs.iter();

        loop {
            match rest.next() {
                Some(Instruction::Loop(body)) => {
                    let (body_block, merge) = self.enter_loop();
                    enclosing.push(OpenLoop {
                        rest,
                        body: body_block,
                        merge,
                    });
                    rest = body.iter();
                }
                Some(instr) => self.emit(instr),
                None => match enclosing.pop() {
                    Some(open) => {
                        self.leave_loop(open.body, open.merge);
                        rest = open.rest;
                    }
                    None => break,
                },
            }
        }
    }

    fn emit(&mut self, instr: &Instruction) {
        use Instruction as I;

        match instr {
            I::Increment | I::Decrement => {
                let ptr = self.cell_ptr();
                let b = &mut self.builder;
                let cell = b.load(Type::I8, ptr, "cell");
                let one = Value::int(Type::I8, 1);
                let next = match instr {
                    I::Increment => b.add(cell, one, "cell.next"),
                    _ => b.sub(cell, one, "cell.next"),
                };
                b.store(next, ptr);
            }
            I::MoveLeft | I::MoveRight => {
                let b = &mut self.builder;
                let position = b.load(Type::I64, self.position, "position");
                let one = Value::int(Type::I64, 1);
                let next = match instr {
                    I::MoveRight => b.add(position, one, "position.next"),
                    _ => b.sub(position, one, "position.next"),
                };
                b.store(next, self.position);
            }
            I::Output => {
                let putchar = self.putchar();
                let cell = self.load_cell();
                self.builder.call(putchar, Type::I32, &[cell], "");
            }
            I::Input => {
                let getchar = self.getchar();
                let b = &mut self.builder;
                let c = b.call(getchar, Type::I32, &[], "input");
                let byte = b.trunc(c, Type::I8, "input.byte");
                let ptr = self.cell_ptr();
                self.builder.store(byte, ptr);
            }
            // entered and left by emit_block
            I::Loop(_) => {}
        }
    }

    // [ ... ] => if (*dp != 0) do { ... } while (*dp != 0);
    // so the body only re-runs the trailing test, never the entry one.
    fn enter_loop(&mut self) -> (BlockId, BlockId) {
        let entry_test = self.cell_is_nonzero();

        let body = self.builder.append_block("body");
        let merge = self.builder.append_block("merge");
        self.builder.cond_br(entry_test, body, merge);

        self.builder.position_at_end(body);
        (body, merge)
    }

    // nested loops leave the cursor in their own merge block, which is
    // where the trailing test goes
    fn leave_loop(&mut self, body: BlockId, merge: BlockId) {
        let trailing_test = self.cell_is_nonzero();
        self.builder.cond_br(trailing_test, body, merge);

        self.builder.position_at_end(merge);
    }

    fn finish(mut self) -> Result<Module, CodegenError> {
        self.builder.ret_void();

        let main = self.builder.finish();
        verify_function(&self.module, &main)?;
        self.module.add_function(main);

        Ok(self.module)
    }
}

/// Lowers `program` into a module with a single verified entry routine,
/// `main`, which runs the program on a zeroed tape of [`TAPE_SIZE`] cells.
///
/// Moving the pointer is not bounds checked.
pub fn codegen(program: &Program) -> Result<Module, CodegenError> {
    let mut cg = CodeGen::new();
    cg.emit_block(program.instructions());
    cg.finish()
}
