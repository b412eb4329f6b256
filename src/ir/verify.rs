use std::collections::HashSet;

use thiserror::Error;

use super::{BlockId, Function, Inst, InstId, Module, Type, Value};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VerifyError {
    #[error("function {0} has no blocks")]
    NoBlocks(String),
    #[error("block {0} is empty")]
    EmptyBlock(String),
    #[error("block {0} does not end in a terminator")]
    MissingTerminator(String),
    #[error("block {0} has a terminator before its last instruction")]
    EarlyTerminator(String),
    #[error("instruction %{0} appears in more than one place")]
    DuplicateInstruction(usize),
    #[error("branch to unknown block #{0}")]
    UnknownBlock(usize),
    #[error("operand refers to unknown instruction %{0}")]
    UnknownValue(usize),
    #[error("operand %{0} produces no value")]
    VoidOperand(usize),
    #[error("call to undeclared function #{0}")]
    UnknownCallee(usize),
    #[error(
        "type mismatch in {context}: expected {expected:?}, found {found:?}"
    )]
    TypeMismatch {
        context: &'static str,
        expected: Type,
        found: Type,
    },
    #[error("{context} expects an integer, found {found:?}")]
    NotAnInteger { context: &'static str, found: Type },
    #[error("call to {name} passes {found} arguments, expected {expected}")]
    ArgumentCount {
        name: String,
        expected: usize,
        found: usize,
    },
}

struct Verifier<'a> {
    module: &'a Module,
    function: &'a Function,
    placed: HashSet<InstId>,
}

impl Verifier<'_> {
    fn value_type(&self, value: Value) -> Result<Type, VerifyError> {
        let ty = match value {
            Value::Const(c) => c.ty(),
            Value::Inst(id) => {
                if !self.placed.contains(&id) {
                    return Err(VerifyError::UnknownValue(id.0));
                }
                let ty = self
                    .function
                    .inst(id)
                    .ok_or(VerifyError::UnknownValue(id.0))?
                    .ty;
                if ty == Type::Void {
                    return Err(VerifyError::VoidOperand(id.0));
                }
                ty
            }
        };

        Ok(ty)
    }

    fn expect(
        &self,
        context: &'static str,
        value: Value,
        expected: Type,
    ) -> Result<(), VerifyError> {
        let found = self.value_type(value)?;
        if found != expected {
            return Err(VerifyError::TypeMismatch {
                context,
                expected,
                found,
            });
        }

        Ok(())
    }

    fn expect_int(
        &self,
        context: &'static str,
        value: Value,
    ) -> Result<Type, VerifyError> {
        let found = self.value_type(value)?;
        if !found.is_int() {
            return Err(VerifyError::NotAnInteger { context, found });
        }

        Ok(found)
    }

    fn check_block_target(&self, target: BlockId) -> Result<(), VerifyError> {
        self.function
            .block(target)
            .map(|_| ())
            .ok_or(VerifyError::UnknownBlock(target.0))
    }

    fn check_inst(&self, inst: &Inst, ty: Type) -> Result<(), VerifyError> {
        match inst {
            Inst::Alloca { .. } => {}
            Inst::Load { ptr, .. } => self.expect("load", *ptr, Type::Ptr)?,
            Inst::Store { value, ptr } => {
                self.value_type(*value)?;
                self.expect("store", *ptr, Type::Ptr)?;
            }
            Inst::Binary { lhs, rhs, .. } => {
                let lhs_ty = self.expect_int("binary operator", *lhs)?;
                self.expect("binary operator", *rhs, lhs_ty)?;
            }
            Inst::ElementPtr { base, index, .. } => {
                self.expect("getelementptr", *base, Type::Ptr)?;
                self.expect_int("getelementptr index", *index)?;
            }
            Inst::Compare { lhs, rhs, .. } => {
                let lhs_ty = self.expect_int("icmp", *lhs)?;
                self.expect("icmp", *rhs, lhs_ty)?;
            }
            Inst::Call { callee, args } => {
                let decl = self
                    .module
                    .extern_fn(*callee)
                    .ok_or(VerifyError::UnknownCallee(callee.0))?;

                if decl.params.len() != args.len() {
                    return Err(VerifyError::ArgumentCount {
                        name: decl.name.clone(),
                        expected: decl.params.len(),
                        found: args.len(),
                    });
                }
                for (arg, param) in args.iter().zip(&decl.params) {
                    self.expect("call argument", *arg, *param)?;
                }
                if ty != decl.ret {
                    return Err(VerifyError::TypeMismatch {
                        context: "call result",
                        expected: decl.ret,
                        found: ty,
                    });
                }
            }
            Inst::Trunc { value, to } => {
                self.expect_int("trunc", *value)?;
                if !to.is_int() {
                    return Err(VerifyError::NotAnInteger {
                        context: "trunc target",
                        found: *to,
                    });
                }
            }
            Inst::Ret { value } => match (value, self.function.ret) {
                (None, Type::Void) => {}
                (None, expected) => {
                    return Err(VerifyError::TypeMismatch {
                        context: "ret",
                        expected,
                        found: Type::Void,
                    })
                }
                (Some(value), expected) => {
                    self.expect("ret", *value, expected)?
                }
            },
            Inst::Br { target } => self.check_block_target(*target)?,
            Inst::CondBr {
                cond,
                then_block,
                else_block,
            } => {
                self.expect("br condition", *cond, Type::I1)?;
                self.check_block_target(*then_block)?;
                self.check_block_target(*else_block)?;
            }
        }

        Ok(())
    }
}

/// Checks that `function` is structurally well formed and well typed
/// against the declarations in `module`.
pub fn verify_function(
    module: &Module,
    function: &Function,
) -> Result<(), VerifyError> {
    if function.blocks.is_empty() {
        return Err(VerifyError::NoBlocks(function.name.clone()));
    }

    let mut placed = HashSet::new();
    for (_, id) in function.iter_insts() {
        if function.inst(id).is_none() {
            return Err(VerifyError::UnknownValue(id.0));
        }
        if !placed.insert(id) {
            return Err(VerifyError::DuplicateInstruction(id.0));
        }
    }

    let verifier = Verifier {
        module,
        function,
        placed,
    };

    for block in &function.blocks {
        let Some((last, body)) = block.insts.split_last() else {
            return Err(VerifyError::EmptyBlock(block.name.clone()));
        };

        if body
            .iter()
            .filter_map(|id| function.inst(*id))
            .any(|data| data.inst.is_terminator())
        {
            return Err(VerifyError::EarlyTerminator(block.name.clone()));
        }

        if !function
            .inst(*last)
            .is_some_and(|data| data.inst.is_terminator())
        {
            return Err(VerifyError::MissingTerminator(block.name.clone()));
        }

        for id in &block.insts {
            let data = function
                .inst(*id)
                .ok_or(VerifyError::UnknownValue(id.0))?;
            verifier.check_inst(&data.inst, data.ty)?;
        }
    }

    Ok(())
}

/// Verifies every function in the module.
pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    module
        .functions
        .iter()
        .try_for_each(|function| verify_function(module, function))
}
