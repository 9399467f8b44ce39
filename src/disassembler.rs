#![allow(clippy::arithmetic_side_effects)]
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! This module decodes raw classic BPF words back into the typed
//! [`Instruction`] model, for example to inspect a filter extracted from a
//! running kernel.
//!
//! Decoding is the exact inverse of assembly on every recognized word. A word
//! that fails any field validity check is passed through unchanged as
//! [`Instruction::Raw`], so a disassemble/re-assemble round trip never alters
//! a program.

use crate::{
    cbpf::{self, Insn},
    instruction::{AluOp, Extension, Instruction, JumpTest, Register},
};

/// Decode a program of raw words into typed instructions.
///
/// The returned flag is `true` when every word was recognized; unrecognized
/// words are carried through as [`Instruction::Raw`].
///
/// # Examples
///
/// ```
/// use rcbpf::cbpf::Insn;
/// use rcbpf::disassembler::disassemble;
/// use rcbpf::instruction::Instruction;
///
/// let (insts, all_decoded) = disassemble(&[
///     Insn { op: 0x28, jt: 0, jf: 0, k: 12 },
///     Insn { op: 0x16, jt: 0, jf: 0, k: 0 },
/// ]);
/// assert!(all_decoded);
/// assert_eq!(insts[0], Instruction::LoadAbsolute { off: 12, size: 2 });
/// assert_eq!(insts[1], Instruction::RetA);
/// ```
pub fn disassemble(raw: &[Insn]) -> (Vec<Instruction>, bool) {
    let mut all_decoded = true;
    let insts = raw
        .iter()
        .map(|insn| match disassemble_insn(insn) {
            Some(inst) => inst,
            None => {
                log::warn!("unrecognized word {:?}, passing through", insn);
                all_decoded = false;
                Instruction::Raw(*insn)
            }
        })
        .collect();
    (insts, all_decoded)
}

/// Decode a single raw word, or `None` if it fails a field validity check.
pub fn disassemble_insn(insn: &Insn) -> Option<Instruction> {
    // The operation code only uses the low byte; stray high bits mean the
    // word is not classic BPF.
    if insn.op & !0xff != 0 {
        return None;
    }
    match insn.op & cbpf::BPF_CLS_MASK {
        cbpf::BPF_LD | cbpf::BPF_LDX => decode_load(insn),
        cbpf::BPF_ST | cbpf::BPF_STX => decode_store(insn),
        cbpf::BPF_ALU => decode_alu(insn),
        cbpf::BPF_JMP => decode_jump(insn),
        cbpf::BPF_RET => decode_ret(insn),
        _ => decode_misc(insn),
    }
}

fn decode_load(insn: &Insn) -> Option<Instruction> {
    if insn.jt != 0 || insn.jf != 0 {
        return None;
    }
    let dst = if insn.op & cbpf::BPF_CLS_MASK == cbpf::BPF_LDX {
        Register::X
    } else {
        Register::A
    };
    let size = match insn.op & cbpf::BPF_SIZE_MASK {
        cbpf::BPF_W => 4,
        cbpf::BPF_H => 2,
        cbpf::BPF_B => 1,
        _ => return None,
    };
    match insn.op & cbpf::BPF_MODE_MASK {
        cbpf::BPF_IMM if size == 4 => Some(Instruction::LoadConstant { dst, val: insn.k }),
        cbpf::BPF_MEM if size == 4 && (insn.k as usize) < cbpf::MEMWORDS => {
            Some(Instruction::LoadScratch { dst, n: insn.k })
        }
        cbpf::BPF_ABS if dst == Register::A => {
            if size == 4 && insn.k >= cbpf::SKF_AD_OFF {
                Some(Instruction::LoadExtension {
                    num: Extension::from_number(insn.k.wrapping_sub(cbpf::SKF_AD_OFF)),
                })
            } else {
                Some(Instruction::LoadAbsolute { off: insn.k, size })
            }
        }
        cbpf::BPF_IND if dst == Register::A => {
            Some(Instruction::LoadIndirect { off: insn.k, size })
        }
        cbpf::BPF_LEN if dst == Register::A && size == 4 && insn.k == 0 => {
            Some(Instruction::LoadExtension {
                num: Extension::Len,
            })
        }
        cbpf::BPF_MSH if dst == Register::X && size == 1 => {
            Some(Instruction::LoadMemShift { off: insn.k })
        }
        _ => None,
    }
}

fn decode_store(insn: &Insn) -> Option<Instruction> {
    // Scratch stores carry no size or mode bits; anything else set means the
    // word is not a store.
    if insn.jt != 0 || insn.jf != 0 || (insn.k as usize) >= cbpf::MEMWORDS {
        return None;
    }
    match insn.op {
        cbpf::BPF_ST => Some(Instruction::StoreScratch {
            src: Register::A,
            n: insn.k,
        }),
        cbpf::BPF_STX => Some(Instruction::StoreScratch {
            src: Register::X,
            n: insn.k,
        }),
        _ => None,
    }
}

fn decode_alu(insn: &Insn) -> Option<Instruction> {
    if insn.jt != 0 || insn.jf != 0 {
        return None;
    }
    if insn.op == cbpf::BPF_ALU | cbpf::BPF_NEG {
        return if insn.k == 0 {
            Some(Instruction::NegateA)
        } else {
            None
        };
    }
    let op = match insn.op & cbpf::BPF_OP_MASK {
        cbpf::BPF_ADD => AluOp::Add,
        cbpf::BPF_SUB => AluOp::Sub,
        cbpf::BPF_MUL => AluOp::Mul,
        cbpf::BPF_DIV => AluOp::Div,
        cbpf::BPF_OR => AluOp::Or,
        cbpf::BPF_AND => AluOp::And,
        cbpf::BPF_LSH => AluOp::ShiftLeft,
        cbpf::BPF_RSH => AluOp::ShiftRight,
        cbpf::BPF_MOD => AluOp::Mod,
        cbpf::BPF_XOR => AluOp::Xor,
        _ => return None,
    };
    if insn.op & cbpf::BPF_SRC_MASK == cbpf::BPF_X {
        if insn.k != 0 {
            return None;
        }
        Some(Instruction::AluOpX { op })
    } else {
        Some(Instruction::AluOpConstant { op, val: insn.k })
    }
}

fn decode_jump(insn: &Insn) -> Option<Instruction> {
    if insn.op == cbpf::BPF_JMP | cbpf::BPF_JA {
        if insn.jt != 0 || insn.jf != 0 {
            return None;
        }
        return Some(Instruction::Jump { skip: insn.k });
    }
    let test = match insn.op & cbpf::BPF_OP_MASK {
        cbpf::BPF_JEQ => JumpTest::Equal,
        cbpf::BPF_JGT => JumpTest::GreaterThan,
        cbpf::BPF_JGE => JumpTest::GreaterOrEqual,
        cbpf::BPF_JSET => JumpTest::BitsSet,
        _ => return None,
    };
    // A zero true-skip is how the assembler spells the inverted tests; give
    // them back their original form.
    let (cond, skip_true, skip_false) = if insn.jt == 0 {
        (inverted(test), insn.jf, 0)
    } else {
        (test, insn.jt, insn.jf)
    };
    if insn.op & cbpf::BPF_SRC_MASK == cbpf::BPF_X {
        if insn.k != 0 {
            return None;
        }
        Some(Instruction::JumpIfX {
            cond,
            skip_true,
            skip_false,
        })
    } else {
        Some(Instruction::JumpIf {
            cond,
            val: insn.k,
            skip_true,
            skip_false,
        })
    }
}

/// The test that accepts exactly when `test` rejects.
fn inverted(test: JumpTest) -> JumpTest {
    match test {
        JumpTest::Equal => JumpTest::NotEqual,
        JumpTest::NotEqual => JumpTest::Equal,
        JumpTest::GreaterThan => JumpTest::LessOrEqual,
        JumpTest::LessOrEqual => JumpTest::GreaterThan,
        JumpTest::GreaterOrEqual => JumpTest::LessThan,
        JumpTest::LessThan => JumpTest::GreaterOrEqual,
        JumpTest::BitsSet => JumpTest::BitsNotSet,
        JumpTest::BitsNotSet => JumpTest::BitsSet,
    }
}

fn decode_ret(insn: &Insn) -> Option<Instruction> {
    if insn.jt != 0 || insn.jf != 0 {
        return None;
    }
    match insn.op {
        op if op == cbpf::BPF_RET | cbpf::BPF_A => {
            if insn.k == 0 {
                Some(Instruction::RetA)
            } else {
                None
            }
        }
        op if op == cbpf::BPF_RET | cbpf::BPF_K => {
            Some(Instruction::RetConstant { val: insn.k })
        }
        _ => None,
    }
}

fn decode_misc(insn: &Insn) -> Option<Instruction> {
    if insn.jt != 0 || insn.jf != 0 || insn.k != 0 {
        return None;
    }
    match insn.op {
        op if op == cbpf::BPF_MISC | cbpf::BPF_TAX => Some(Instruction::Tax),
        op if op == cbpf::BPF_MISC | cbpf::BPF_TXA => Some(Instruction::Txa),
        _ => None,
    }
}
