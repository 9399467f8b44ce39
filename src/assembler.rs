#![allow(clippy::arithmetic_side_effects)]
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! This module translates classic BPF programs to binary, either from the
//! typed [`Instruction`] model or from assembly language source text.

use crate::{
    asm_parser::{self, Operand, Statement},
    cbpf::Insn,
    error::CbpfError,
    instruction::{AluOp, Extension, Instruction, JumpTest, Register},
};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq)]
enum InstructionType {
    LoadA,
    LoadAHalf,
    LoadAByte,
    LoadX,
    Store,
    StoreX,
    Alu(AluOp),
    Neg,
    JumpUnconditional,
    JumpConditional(JumpTest),
    Ret,
    Tax,
    Txa,
}

fn make_instruction_map() -> HashMap<String, InstructionType> {
    let mut result = HashMap::new();

    let alu_ops = [
        ("add", AluOp::Add),
        ("sub", AluOp::Sub),
        ("mul", AluOp::Mul),
        ("div", AluOp::Div),
        ("or", AluOp::Or),
        ("and", AluOp::And),
        ("lsh", AluOp::ShiftLeft),
        ("rsh", AluOp::ShiftRight),
        ("mod", AluOp::Mod),
        ("xor", AluOp::Xor),
    ];

    // The inverted tests have their own mnemonics; the assembler lowers them
    // to the non-inverted wire operators by swapping the skip counts.
    let jump_conditions = [
        ("jeq", JumpTest::Equal),
        ("jneq", JumpTest::NotEqual),
        ("jne", JumpTest::NotEqual),
        ("jgt", JumpTest::GreaterThan),
        ("jge", JumpTest::GreaterOrEqual),
        ("jlt", JumpTest::LessThan),
        ("jle", JumpTest::LessOrEqual),
        ("jset", JumpTest::BitsSet),
    ];

    {
        let mut entry = |name: &str, inst_type: InstructionType| {
            result.insert(name.to_string(), inst_type)
        };

        entry("ld", InstructionType::LoadA);
        entry("ldh", InstructionType::LoadAHalf);
        entry("ldb", InstructionType::LoadAByte);
        entry("ldx", InstructionType::LoadX);
        entry("st", InstructionType::Store);
        entry("stx", InstructionType::StoreX);

        for &(name, op) in &alu_ops {
            entry(name, InstructionType::Alu(op));
        }
        entry("neg", InstructionType::Neg);

        entry("ja", InstructionType::JumpUnconditional);
        entry("jmp", InstructionType::JumpUnconditional);
        for &(name, cond) in &jump_conditions {
            entry(name, InstructionType::JumpConditional(cond));
        }

        entry("ret", InstructionType::Ret);
        entry("tax", InstructionType::Tax);
        entry("txa", InstructionType::Txa);
    }

    result
}

fn skip_count(value: u32) -> Result<u8, String> {
    if value > u8::max_value() as u32 {
        return Err(format!("Invalid skip count {}", value));
    }
    Ok(value as u8)
}

fn extension(name: &str) -> Result<Extension, String> {
    Extension::from_mnemonic(name).ok_or_else(|| format!("Invalid extension {:?}", name))
}

fn translate(
    statement: &Statement,
    instruction_map: &HashMap<String, InstructionType>,
) -> Result<Instruction, String> {
    let inst_type = match instruction_map.get(statement.name.as_str()) {
        Some(&inst_type) => inst_type,
        None => return Err(format!("Invalid instruction {:?}", statement.name)),
    };
    use self::InstructionType::*;
    let inst = match (inst_type, statement.operands.as_slice()) {
        (LoadA, [Operand::Immediate(val)]) => Instruction::LoadConstant {
            dst: Register::A,
            val: *val,
        },
        (LoadA, [Operand::Extension(name)]) => Instruction::LoadExtension {
            num: extension(name)?,
        },
        (LoadA, [Operand::Scratch(n)]) => Instruction::LoadScratch {
            dst: Register::A,
            n: *n,
        },
        (LoadA, [Operand::Absolute(off)]) => Instruction::LoadAbsolute { off: *off, size: 4 },
        (LoadAHalf, [Operand::Absolute(off)]) => Instruction::LoadAbsolute { off: *off, size: 2 },
        (LoadAByte, [Operand::Absolute(off)]) => Instruction::LoadAbsolute { off: *off, size: 1 },
        (LoadA, [Operand::Indirect(off)]) => Instruction::LoadIndirect { off: *off, size: 4 },
        (LoadAHalf, [Operand::Indirect(off)]) => Instruction::LoadIndirect { off: *off, size: 2 },
        (LoadAByte, [Operand::Indirect(off)]) => Instruction::LoadIndirect { off: *off, size: 1 },
        (LoadX, [Operand::Immediate(val)]) => Instruction::LoadConstant {
            dst: Register::X,
            val: *val,
        },
        (LoadX, [Operand::Scratch(n)]) => Instruction::LoadScratch {
            dst: Register::X,
            n: *n,
        },
        (LoadX, [Operand::MemShift(off)]) => Instruction::LoadMemShift { off: *off },
        (Store, [Operand::Scratch(n)]) => Instruction::StoreScratch {
            src: Register::A,
            n: *n,
        },
        (StoreX, [Operand::Scratch(n)]) => Instruction::StoreScratch {
            src: Register::X,
            n: *n,
        },
        (Alu(op), [Operand::Immediate(val)]) => Instruction::AluOpConstant { op, val: *val },
        (Alu(op), [Operand::Register('x')]) => Instruction::AluOpX { op },
        (Neg, []) => Instruction::NegateA,
        (JumpUnconditional, [Operand::Integer(skip)]) => Instruction::Jump { skip: *skip },
        (JumpConditional(cond), [Operand::Immediate(val), Operand::Integer(skip_true)]) => {
            Instruction::JumpIf {
                cond,
                val: *val,
                skip_true: skip_count(*skip_true)?,
                skip_false: 0,
            }
        }
        (
            JumpConditional(cond),
            [Operand::Immediate(val), Operand::Integer(skip_true), Operand::Integer(skip_false)],
        ) => Instruction::JumpIf {
            cond,
            val: *val,
            skip_true: skip_count(*skip_true)?,
            skip_false: skip_count(*skip_false)?,
        },
        (JumpConditional(cond), [Operand::Register('x'), Operand::Integer(skip_true)]) => {
            Instruction::JumpIfX {
                cond,
                skip_true: skip_count(*skip_true)?,
                skip_false: 0,
            }
        }
        (
            JumpConditional(cond),
            [Operand::Register('x'), Operand::Integer(skip_true), Operand::Integer(skip_false)],
        ) => Instruction::JumpIfX {
            cond,
            skip_true: skip_count(*skip_true)?,
            skip_false: skip_count(*skip_false)?,
        },
        (Ret, [Operand::Register('a')]) => Instruction::RetA,
        (Ret, [Operand::Immediate(val)]) => Instruction::RetConstant { val: *val },
        (Tax, []) => Instruction::Tax,
        (Txa, []) => Instruction::Txa,
        _ => {
            return Err(format!(
                "Unexpected operands for {:?}: {:?}",
                statement.name, statement.operands
            ))
        }
    };
    Ok(inst)
}

/// Assemble a program of typed instructions into raw `(op, jt, jf, k)` words,
/// the form handed to an operating system kernel.
///
/// The output has exactly one word per input instruction. On failure the
/// error carries the one-based index of the instruction that could not be
/// encoded.
///
/// # Examples
///
/// ```
/// use rcbpf::assembler::assemble;
/// use rcbpf::instruction::Instruction;
///
/// let raw = assemble(&[
///     Instruction::LoadAbsolute { off: 12, size: 2 },
///     Instruction::RetA,
/// ])
/// .unwrap();
/// assert_eq!(raw[0].op, 0x28);
/// assert_eq!(raw[1].op, 0x16);
/// ```
pub fn assemble(insts: &[Instruction]) -> Result<Vec<Insn>, CbpfError> {
    insts
        .iter()
        .enumerate()
        .map(|(insn_ptr, inst)| {
            inst.assemble().map_err(|source| CbpfError::Assemble {
                insn_ptr: insn_ptr + 1,
                source,
            })
        })
        .collect()
}

/// Parse classic BPF assembly source and translate it to typed instructions.
///
/// The accepted notation is the one produced by `Display` on
/// [`Instruction`] (and by the kernel's `bpf_asm` tool), with numeric skip
/// counts as jump targets.
///
/// # Examples
///
/// ```
/// use rcbpf::assembler::{assemble, assemble_source};
///
/// let prog = assemble_source(
///     "ldh [12]
///      jeq #0x800,0,1
///      ret #1500
///      ret #0",
/// )
/// .unwrap();
/// let raw = assemble(&prog).unwrap();
/// assert_eq!(raw[1].op, 0x15);
/// assert_eq!(raw[1].jf, 1);
/// ```
pub fn assemble_source(src: &str) -> Result<Vec<Instruction>, String> {
    let statements = asm_parser::parse(src)?;
    let instruction_map = make_instruction_map();
    statements
        .iter()
        .map(|statement| translate(statement, &instruction_map))
        .collect()
}
