#![allow(clippy::arithmetic_side_effects)]
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Interpreter for classic BPF programs.
//!
//! The loop mirrors the in-kernel reference machine: a failed packet read or
//! a division by a zero `X` register does not raise an error, it ends the
//! program with verdict 0, exactly as if execution fell off the end.

use crate::{
    cbpf,
    error::CbpfError,
    instruction::{AluOp, Extension, Instruction, JumpTest, Register},
};
use byteorder::{BigEndian, ByteOrder};

/// Run a verified program against an input buffer and produce its verdict.
///
/// Callers go through [`crate::vm::Vm`], which guarantees the invariants the
/// loop relies on: skips stay inside the program, constant divisors are
/// non-zero, scratch slots are in range and the program ends with a return.
pub(crate) fn execute(filter: &[Instruction], input: &[u8]) -> Result<u32, CbpfError> {
    let mut reg_a: u32 = 0;
    let mut reg_x: u32 = 0;
    let mut scratch = [0u32; cbpf::MEMWORDS];

    let mut pc = 0;
    while pc < filter.len() {
        match filter[pc] {
            Instruction::LoadConstant { dst, val } => match dst {
                Register::A => reg_a = val,
                Register::X => reg_x = val,
            },
            Instruction::LoadScratch { dst, n } => match dst {
                Register::A => reg_a = scratch[n as usize],
                Register::X => reg_x = scratch[n as usize],
            },
            Instruction::LoadAbsolute { off, size } => match load_packet(input, off, size) {
                Some(val) => reg_a = val,
                None => return Ok(0),
            },
            Instruction::LoadIndirect { off, size } => {
                match load_packet(input, reg_x.wrapping_add(off), size) {
                    Some(val) => reg_a = val,
                    None => return Ok(0),
                }
            }
            Instruction::LoadMemShift { off } => match input.get(off as usize) {
                Some(&byte) => reg_x = ((byte & 0x0f) as u32) * 4,
                None => return Ok(0),
            },
            Instruction::LoadExtension {
                num: Extension::Len,
            } => reg_a = input.len() as u32,
            Instruction::StoreScratch { src, n } => {
                scratch[n as usize] = match src {
                    Register::A => reg_a,
                    Register::X => reg_x,
                }
            }
            Instruction::AluOpConstant { op, val } => reg_a = alu_constant(op, reg_a, val),
            Instruction::AluOpX { op } => match alu_x(op, reg_a, reg_x) {
                Some(val) => reg_a = val,
                None => return Ok(0),
            },
            Instruction::NegateA => reg_a = reg_a.wrapping_neg(),
            Instruction::Jump { skip } => pc += skip as usize,
            Instruction::JumpIf {
                cond,
                val,
                skip_true,
                skip_false,
            } => pc += branch(cond, reg_a, val, skip_true, skip_false),
            Instruction::JumpIfX {
                cond,
                skip_true,
                skip_false,
            } => pc += branch(cond, reg_a, reg_x, skip_true, skip_false),
            Instruction::RetA => return Ok(reg_a),
            Instruction::RetConstant { val } => return Ok(val),
            Instruction::Tax => reg_x = reg_a,
            Instruction::Txa => reg_a = reg_x,
            Instruction::Raw(_) | Instruction::LoadExtension { .. } => {
                return Err(CbpfError::UnknownInstruction(pc));
            }
        }
        pc += 1;
    }
    Ok(0)
}

/// Big endian packet read, regardless of host byte order. `None` when any of
/// the requested bytes lies outside the input.
fn load_packet(input: &[u8], offset: u32, size: u32) -> Option<u32> {
    if offset as u64 + size as u64 > input.len() as u64 {
        return None;
    }
    let offset = offset as usize;
    match size {
        1 => Some(input[offset] as u32),
        2 => Some(BigEndian::read_u16(&input[offset..]) as u32),
        4 => Some(BigEndian::read_u32(&input[offset..])),
        _ => None,
    }
}

fn alu_constant(op: AluOp, a: u32, val: u32) -> u32 {
    match op {
        AluOp::Add => a.wrapping_add(val),
        AluOp::Sub => a.wrapping_sub(val),
        AluOp::Mul => a.wrapping_mul(val),
        // A zero constant divisor never reaches the loop; the loader rejects
        // the program.
        AluOp::Div => a / val,
        AluOp::Or => a | val,
        AluOp::And => a & val,
        // Shifting by the register width or more yields 0.
        AluOp::ShiftLeft => a.checked_shl(val).unwrap_or(0),
        AluOp::ShiftRight => a.checked_shr(val).unwrap_or(0),
        AluOp::Mod => a % val,
        AluOp::Xor => a ^ val,
    }
}

/// `None` terminates the program with verdict 0 (division by a zero `X`).
fn alu_x(op: AluOp, a: u32, x: u32) -> Option<u32> {
    match op {
        AluOp::Div => a.checked_div(x),
        AluOp::Mod => a.checked_rem(x),
        _ => Some(alu_constant(op, a, x)),
    }
}

fn branch(cond: JumpTest, a: u32, value: u32, skip_true: u8, skip_false: u8) -> usize {
    let matched = match cond {
        JumpTest::Equal => a == value,
        JumpTest::NotEqual => a != value,
        JumpTest::GreaterThan => a > value,
        JumpTest::LessThan => a < value,
        JumpTest::GreaterOrEqual => a >= value,
        JumpTest::LessOrEqual => a <= value,
        JumpTest::BitsSet => a & value != 0,
        JumpTest::BitsNotSet => a & value == 0,
    };
    if matched {
        skip_true as usize
    } else {
        skip_false as usize
    }
}
