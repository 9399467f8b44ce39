#![allow(clippy::arithmetic_side_effects)]
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! This verifier performs simple checks when a classic BPF program is loaded
//! into the VM, before it is interpreted. It has nothing to do with the much
//! more elaborate eBPF verifier inside the Linux kernel: classic filters have
//! forward-only jumps, so a single pass over the program is enough to prove
//! termination.
//!
//! Because every skip count is checked against the number of instructions
//! remaining after it, and the last instruction must be a return, a verified
//! program halts after at most `program.len()` interpreter steps.

use crate::instruction::{AluOp, Extension, Instruction};
use thiserror::Error;

/// Error definitions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifierError {
    /// The program is empty.
    #[error("one or more instructions must be specified")]
    NoProgram,
    /// An unconditional jump past the end of the program.
    #[error("cannot jump {skip} instructions; jumping past program bounds (insn #{insn_ptr})")]
    JumpOutOfBounds {
        /// The offending skip count.
        skip: u32,
        /// Index of the jump instruction.
        insn_ptr: usize,
    },
    /// A conditional jump whose true branch leaves the program.
    #[error(
        "cannot jump {skip} instructions in true case; jumping past program bounds (insn #{insn_ptr})"
    )]
    TrueJumpOutOfBounds {
        /// The offending skip count.
        skip: u8,
        /// Index of the jump instruction.
        insn_ptr: usize,
    },
    /// A conditional jump whose false branch leaves the program.
    #[error(
        "cannot jump {skip} instructions in false case; jumping past program bounds (insn #{insn_ptr})"
    )]
    FalseJumpOutOfBounds {
        /// The offending skip count.
        skip: u8,
        /// Index of the jump instruction.
        insn_ptr: usize,
    },
    /// Division or modulus by a constant zero.
    #[error("cannot divide by zero with a constant operand (insn #{0})")]
    DivisionByZero(usize),
    /// A load extension the user space machine does not implement.
    #[error("extension {num} not implemented (insn #{insn_ptr})")]
    UnimplementedExtension {
        /// The ancillary data number of the extension.
        num: u32,
        /// Index of the load instruction.
        insn_ptr: usize,
    },
    /// The program does not finish with a return instruction.
    #[error("program must end with RetA or RetConstant")]
    MissingReturn,
}

fn check_jump(skip: u32, remaining: usize, insn_ptr: usize) -> Result<(), VerifierError> {
    if skip as usize >= remaining {
        return Err(VerifierError::JumpOutOfBounds { skip, insn_ptr });
    }
    Ok(())
}

fn check_branches(
    skip_true: u8,
    skip_false: u8,
    remaining: usize,
    insn_ptr: usize,
) -> Result<(), VerifierError> {
    if skip_true as usize >= remaining {
        return Err(VerifierError::TrueJumpOutOfBounds {
            skip: skip_true,
            insn_ptr,
        });
    }
    if skip_false as usize >= remaining {
        return Err(VerifierError::FalseJumpOutOfBounds {
            skip: skip_false,
            insn_ptr,
        });
    }
    Ok(())
}

/// Check a program against the loader's rules: it must be non-empty, every
/// skip must land inside the program, constant divisors must be non-zero,
/// only the packet length extension may be loaded, and the last instruction
/// must produce a verdict.
pub fn check(filter: &[Instruction]) -> Result<(), VerifierError> {
    if filter.is_empty() {
        return Err(VerifierError::NoProgram);
    }

    for (insn_ptr, inst) in filter.iter().enumerate() {
        let remaining = filter.len() - (insn_ptr + 1);
        match *inst {
            Instruction::Jump { skip } => check_jump(skip, remaining, insn_ptr)?,
            Instruction::JumpIf {
                skip_true,
                skip_false,
                ..
            } => check_branches(skip_true, skip_false, remaining, insn_ptr)?,
            Instruction::JumpIfX {
                skip_true,
                skip_false,
                ..
            } => check_branches(skip_true, skip_false, remaining, insn_ptr)?,
            Instruction::AluOpConstant { op, val: 0 } => match op {
                AluOp::Div | AluOp::Mod => {
                    return Err(VerifierError::DivisionByZero(insn_ptr));
                }
                _ => {}
            },
            Instruction::LoadExtension { num } => match num {
                Extension::Len => {}
                _ => {
                    return Err(VerifierError::UnimplementedExtension {
                        num: num.number(),
                        insn_ptr,
                    });
                }
            },
            _ => {}
        }
    }

    match filter[filter.len() - 1] {
        Instruction::RetA | Instruction::RetConstant { .. } => Ok(()),
        _ => Err(VerifierError::MissingReturn),
    }
}
