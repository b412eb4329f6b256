//! A reference executor for verified IR.
//!
//! It runs an entry routine directly on the IR, with `putchar`/`getchar`
//! bound to the given reader and writer. Storage is split into regions, one
//! per `alloca`, and every access is bounds-checked: what would be undefined
//! behaviour in native code is an [`ExecError::OutOfBounds`] here.

use std::io::{self, Read, Write};

use thiserror::Error;

use super::{
    BinOp, BlockId, CmpOp, Constant, Function, Inst, InstId, Module, Type,
    Value,
};

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("no function named {0}")]
    MissingFunction(String),
    #[error("access of {size} bytes at {address:#x} is out of bounds")]
    OutOfBounds { address: u64, size: u64 },
    #[error("step limit exhausted")]
    OutOfFuel,
    #[error("value %{0} used before it was computed")]
    Undefined(usize),
    #[error("call to unsupported external function {0}")]
    UnknownExtern(String),
    #[error("malformed function: {0}")]
    Malformed(&'static str),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

const REGION_SHIFT: u32 = 32;
const OFFSET_MASK: u64 = (1 << REGION_SHIFT) - 1;

struct Memory {
    regions: Vec<Vec<u8>>,
}

impl Memory {
    // region 0 is never handed out so that a zero pointer always faults
    fn allocate(&mut self, size: u64) -> u64 {
        self.regions.push(vec![0; size as usize]);
        (self.regions.len() as u64) << REGION_SHIFT
    }

    fn slice(
        &mut self,
        address: u64,
        size: u64,
    ) -> Result<&mut [u8], ExecError> {
        let region = (address >> REGION_SHIFT) as usize;
        let offset = (address & OFFSET_MASK) as usize;
        let end = offset.saturating_add(size as usize);

        if region == 0 || region > self.regions.len() {
            return Err(ExecError::OutOfBounds { address, size });
        }

        let bytes = &mut self.regions[region - 1];
        if end > bytes.len() {
            return Err(ExecError::OutOfBounds { address, size });
        }

        Ok(&mut bytes[offset..end])
    }

    fn load(&mut self, address: u64, ty: Type) -> Result<u64, ExecError> {
        let mut word = [0u8; 8];
        let size = ty.size();
        if size > 8 {
            return Err(ExecError::Malformed("load of an aggregate"));
        }

        word[..size as usize].copy_from_slice(self.slice(address, size)?);
        Ok(u64::from_le_bytes(word))
    }

    fn store(
        &mut self,
        address: u64,
        ty: Type,
        value: u64,
    ) -> Result<(), ExecError> {
        let size = ty.size();
        if size > 8 {
            return Err(ExecError::Malformed("store of an aggregate"));
        }

        self.slice(address, size)?
            .copy_from_slice(&value.to_le_bytes()[..size as usize]);
        Ok(())
    }
}

pub struct Executor<R, W> {
    input: R,
    output: W,
    fuel: Option<u64>,
}

impl<R: Read, W: Write> Executor<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Executor {
            input,
            output,
            fuel: None,
        }
    }

    /// Gives up with [`ExecError::OutOfFuel`] after `steps` instructions.
    pub fn with_fuel(mut self, steps: u64) -> Self {
        self.fuel = Some(steps);
        self
    }

    pub fn into_output(self) -> W {
        self.output
    }

    /// Runs the function `entry` of `module` until it returns.
    pub fn run(
        &mut self,
        module: &Module,
        entry: &str,
    ) -> Result<(), ExecError> {
        let function = module
            .function(entry)
            .ok_or_else(|| ExecError::MissingFunction(entry.to_string()))?;

        let mut frame = Frame {
            module,
            function,
            values: vec![None; function.insts.len()],
            memory: Memory { regions: vec![] },
        };

        let mut block = function
            .entry()
            .ok_or(ExecError::Malformed("function has no blocks"))?;

        loop {
            let insts = &function
                .block(block)
                .ok_or(ExecError::Malformed("branch to unknown block"))?
                .insts;

            let mut next = None;
            for &id in insts {
                if let Some(fuel) = self.fuel.as_mut() {
                    *fuel = fuel.checked_sub(1).ok_or(ExecError::OutOfFuel)?;
                }

                match self.step(&mut frame, id)? {
                    Flow::Continue => {}
                    Flow::Jump(target) => {
                        next = Some(target);
                        break;
                    }
                    Flow::Return => {
                        self.output.flush()?;
                        return Ok(());
                    }
                }
            }

            block = next.ok_or(ExecError::Malformed("block fell through"))?;
        }
    }

    fn call(&mut self, name: &str, args: &[u64]) -> Result<u64, ExecError> {
        match (name, args) {
            ("putchar", [byte]) => {
                self.output.write_all(&[*byte as u8])?;
                Ok(*byte & 0xFF)
            }
            ("getchar", []) => {
                let mut buf = [0u8; 1];
                match self.input.read_exact(&mut buf) {
                    Ok(()) => Ok(buf[0] as u64),
                    // EOF, i.e. -1 as an i32
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        Ok(Type::I32.mask(u64::MAX))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            _ => Err(ExecError::UnknownExtern(name.to_string())),
        }
    }

    fn step(
        &mut self,
        frame: &mut Frame<'_>,
        id: InstId,
    ) -> Result<Flow, ExecError> {
        let function = frame.function;
        let data = function.inst(id).ok_or(ExecError::Undefined(id.0))?;

        let result = match &data.inst {
            Inst::Alloca { ty } => frame.memory.allocate(ty.size()),
            Inst::Load { ty, ptr } => {
                let address = frame.eval(*ptr)?;
                frame.memory.load(address, *ty)?
            }
            Inst::Store { value, ptr } => {
                let address = frame.eval(*ptr)?;
                match value {
                    Value::Const(Constant::Zero(ty)) => {
                        frame.memory.slice(address, ty.size())?.fill(0)
                    }
                    _ => {
                        let ty = function
                            .value_type(*value)
                            .ok_or(ExecError::Malformed("untyped store"))?;
                        let value = frame.eval(*value)?;
                        frame.memory.store(address, ty, value)?
                    }
                }
                return Ok(Flow::Continue);
            }
            Inst::Binary { op, lhs, rhs } => {
                let (lhs, rhs) = (frame.eval(*lhs)?, frame.eval(*rhs)?);
                data.ty.mask(match op {
                    BinOp::Add => lhs.wrapping_add(rhs),
                    BinOp::Sub => lhs.wrapping_sub(rhs),
                })
            }
            Inst::ElementPtr { base, index, .. } => {
                let index_ty = function
                    .value_type(*index)
                    .ok_or(ExecError::Malformed("untyped index"))?;
                let index = sign_extend(frame.eval(*index)?, index_ty);
                frame.eval(*base)?.wrapping_add(index as u64)
            }
            Inst::Compare { op, lhs, rhs } => {
                let equal = frame.eval(*lhs)? == frame.eval(*rhs)?;
                let holds = match op {
                    CmpOp::Eq => equal,
                    CmpOp::Ne => !equal,
                };
                holds as u64
            }
            Inst::Call { callee, args } => {
                let decl = frame
                    .module
                    .extern_fn(*callee)
                    .ok_or(ExecError::Malformed(
                        "call to undeclared function",
                    ))?;
                let args = args
                    .iter()
                    .map(|arg| frame.eval(*arg))
                    .collect::<Result<Vec<_>, _>>()?;
                data.ty.mask(self.call(&decl.name, &args)?)
            }
            Inst::Trunc { value, to } => to.mask(frame.eval(*value)?),
            Inst::Ret { .. } => return Ok(Flow::Return),
            Inst::Br { target } => return Ok(Flow::Jump(*target)),
            Inst::CondBr {
                cond,
                then_block,
                else_block,
            } => {
                let target = if frame.eval(*cond)? != 0 {
                    *then_block
                } else {
                    *else_block
                };
                return Ok(Flow::Jump(target));
            }
        };

        frame.values[id.0] = Some(result);
        Ok(Flow::Continue)
    }
}

enum Flow {
    Continue,
    Jump(BlockId),
    Return,
}

struct Frame<'a> {
    module: &'a Module,
    function: &'a Function,
    values: Vec<Option<u64>>,
    memory: Memory,
}

impl Frame<'_> {
    fn eval(&self, value: Value) -> Result<u64, ExecError> {
        match value {
            Value::Const(Constant::Int { value, .. }) => Ok(value),
            Value::Const(Constant::Zero(_)) => Ok(0),
            Value::Inst(id) => self
                .values
                .get(id.0)
                .copied()
                .flatten()
                .ok_or(ExecError::Undefined(id.0)),
        }
    }
}

fn sign_extend(value: u64, ty: Type) -> i64 {
    let shift = 64 - ty.bits().unwrap_or(64);
    ((value << shift) as i64) >> shift
}
