#![allow(clippy::arithmetic_side_effects)]
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Typed model of a classic BPF instruction.
//!
//! Every variant of [`Instruction`] carries only the fields its semantics
//! require; encoding details live in the conversion to [`Insn`]. `Display`
//! renders the canonical assembly notation of the kernel's `bpf_asm` tool,
//! which [`crate::assembler::assemble_source`] parses back.

use crate::cbpf::{self, Insn};
use std::fmt;
use thiserror::Error;

/// A register of the classic BPF virtual machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    /// The accumulator. Arithmetic, packet loads and comparisons all operate
    /// on this register.
    A,
    /// The index register, used for indirect packet addressing.
    X,
}

/// An arithmetic operator applied to the accumulator.
///
/// All arithmetic is unsigned 32 bit with wrap-around; shifts by 32 or more
/// produce 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    /// `A + operand`.
    Add,
    /// `A - operand`.
    Sub,
    /// `A * operand`.
    Mul,
    /// `A / operand`.
    Div,
    /// `A | operand`.
    Or,
    /// `A & operand`.
    And,
    /// `A << operand`.
    ShiftLeft,
    /// `A >> operand` (logical).
    ShiftRight,
    /// `A % operand`.
    Mod,
    /// `A ^ operand`.
    Xor,
}

impl AluOp {
    pub(crate) fn op_bits(self) -> u16 {
        match self {
            AluOp::Add => cbpf::BPF_ADD,
            AluOp::Sub => cbpf::BPF_SUB,
            AluOp::Mul => cbpf::BPF_MUL,
            AluOp::Div => cbpf::BPF_DIV,
            AluOp::Or => cbpf::BPF_OR,
            AluOp::And => cbpf::BPF_AND,
            AluOp::ShiftLeft => cbpf::BPF_LSH,
            AluOp::ShiftRight => cbpf::BPF_RSH,
            AluOp::Mod => cbpf::BPF_MOD,
            AluOp::Xor => cbpf::BPF_XOR,
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Sub => "sub",
            AluOp::Mul => "mul",
            AluOp::Div => "div",
            AluOp::Or => "or",
            AluOp::And => "and",
            AluOp::ShiftLeft => "lsh",
            AluOp::ShiftRight => "rsh",
            AluOp::Mod => "mod",
            AluOp::Xor => "xor",
        }
    }
}

/// The comparison performed by a conditional jump.
///
/// The wire format only knows `Equal`, `GreaterThan`, `GreaterOrEqual` and
/// `BitsSet`; the inverted tests are expressed by swapping the skip counts
/// during assembly and are reconstructed by the disassembler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JumpTest {
    /// `A == operand`.
    Equal,
    /// `A != operand`.
    NotEqual,
    /// `A > operand` (unsigned).
    GreaterThan,
    /// `A < operand` (unsigned).
    LessThan,
    /// `A >= operand` (unsigned).
    GreaterOrEqual,
    /// `A <= operand` (unsigned).
    LessOrEqual,
    /// `A & operand != 0`.
    BitsSet,
    /// `A & operand == 0`.
    BitsNotSet,
}

/// A value computed by the execution environment rather than read out of the
/// packet, loadable into `A` with [`Instruction::LoadExtension`].
///
/// The numbering matches the kernel's ancillary data offsets so that
/// disassembled kernel programs keep their meaning. Only [`Extension::Len`]
/// is implemented by the user space virtual machine; the loader rejects all
/// others.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extension {
    /// Ethernet protocol of the packet.
    Proto,
    /// Length of the input buffer.
    Len,
    /// Packet type (host, broadcast, outgoing, ...).
    Type,
    /// Index of the interface the packet arrived on.
    InterfaceIndex,
    /// Netlink attribute lookup.
    NetlinkAttr,
    /// Nested netlink attribute lookup.
    NetlinkAttrNested,
    /// Packet mark set by the network stack.
    Mark,
    /// Receive queue the packet was mapped to.
    Queue,
    /// Hardware (link layer) type of the interface.
    LinkLayerType,
    /// Receive hash computed by the network stack.
    RXHash,
    /// Identifier of the CPU processing the packet.
    CPUID,
    /// VLAN tag control information.
    VLANTag,
    /// Whether a VLAN tag is present.
    VLANTagPresent,
    /// Offset of the packet payload.
    PayloadOffset,
    /// Pseudo-random number.
    Rand,
    /// VLAN tag protocol identifier.
    VLANProto,
    /// An extension number this crate does not know by name. Produced by the
    /// disassembler so that unrecognized kernel programs round-trip.
    Unknown(u32),
}

impl Extension {
    /// The ancillary data number of this extension, as encoded in the `k`
    /// field of an absolute load at [`cbpf::SKF_AD_OFF`].
    pub fn number(self) -> u32 {
        match self {
            Extension::Proto => 0,
            Extension::Len => 1,
            Extension::Type => 4,
            Extension::InterfaceIndex => 8,
            Extension::NetlinkAttr => 12,
            Extension::NetlinkAttrNested => 16,
            Extension::Mark => 20,
            Extension::Queue => 24,
            Extension::LinkLayerType => 28,
            Extension::RXHash => 32,
            Extension::CPUID => 36,
            Extension::VLANTag => 44,
            Extension::VLANTagPresent => 48,
            Extension::PayloadOffset => 52,
            Extension::Rand => 56,
            Extension::VLANProto => 60,
            Extension::Unknown(num) => num,
        }
    }

    /// The extension with ancillary data number `num`.
    pub fn from_number(num: u32) -> Extension {
        match num {
            0 => Extension::Proto,
            1 => Extension::Len,
            4 => Extension::Type,
            8 => Extension::InterfaceIndex,
            12 => Extension::NetlinkAttr,
            16 => Extension::NetlinkAttrNested,
            20 => Extension::Mark,
            24 => Extension::Queue,
            28 => Extension::LinkLayerType,
            32 => Extension::RXHash,
            36 => Extension::CPUID,
            44 => Extension::VLANTag,
            48 => Extension::VLANTagPresent,
            52 => Extension::PayloadOffset,
            56 => Extension::Rand,
            60 => Extension::VLANProto,
            _ => Extension::Unknown(num),
        }
    }

    fn mnemonic(self) -> Option<&'static str> {
        match self {
            Extension::Proto => Some("proto"),
            Extension::Len => Some("len"),
            Extension::Type => Some("type"),
            Extension::InterfaceIndex => Some("ifidx"),
            Extension::NetlinkAttr => Some("nla"),
            Extension::NetlinkAttrNested => Some("nlan"),
            Extension::Mark => Some("mark"),
            Extension::Queue => Some("queue"),
            Extension::LinkLayerType => Some("hatype"),
            Extension::RXHash => Some("rxhash"),
            Extension::CPUID => Some("cpu"),
            Extension::VLANTag => Some("vlan_tci"),
            Extension::VLANTagPresent => Some("vlan_avail"),
            Extension::PayloadOffset => Some("poff"),
            Extension::Rand => Some("rand"),
            Extension::VLANProto => Some("vlan_tpid"),
            Extension::Unknown(_) => None,
        }
    }

    pub(crate) fn from_mnemonic(name: &str) -> Option<Extension> {
        match name {
            "proto" => Some(Extension::Proto),
            "len" => Some(Extension::Len),
            "type" => Some(Extension::Type),
            "ifidx" => Some(Extension::InterfaceIndex),
            "nla" => Some(Extension::NetlinkAttr),
            "nlan" => Some(Extension::NetlinkAttrNested),
            "mark" => Some(Extension::Mark),
            "queue" => Some(Extension::Queue),
            "hatype" => Some(Extension::LinkLayerType),
            "rxhash" => Some(Extension::RXHash),
            "cpu" => Some(Extension::CPUID),
            "vlan_tci" => Some(Extension::VLANTag),
            "vlan_avail" => Some(Extension::VLANTagPresent),
            "poff" => Some(Extension::PayloadOffset),
            "rand" => Some(Extension::Rand),
            "vlan_tpid" => Some(Extension::VLANProto),
            _ => None,
        }
    }
}

/// Error raised while encoding a single instruction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssembleError {
    /// A packet load with a width other than 1, 2 or 4 bytes.
    #[error("invalid load byte length {0}")]
    InvalidLoadSize(u32),
    /// A scratch memory access outside the sixteen available slots.
    #[error("invalid scratch slot {0}")]
    InvalidScratchSlot(u32),
}

/// A single classic BPF instruction.
///
/// Instructions are immutable values; a program is an ordered slice of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instruction {
    /// `dst <- val`.
    LoadConstant {
        /// Register to load into.
        dst: Register,
        /// Constant to load.
        val: u32,
    },
    /// `dst <- scratch[n]`.
    LoadScratch {
        /// Register to load into.
        dst: Register,
        /// Scratch slot, in `0..16`.
        n: u32,
    },
    /// `A <- packet[off..off+size]`, big endian.
    LoadAbsolute {
        /// Packet offset of the first byte.
        off: u32,
        /// Number of bytes to read: 1, 2 or 4.
        size: u32,
    },
    /// `A <- packet[X+off..X+off+size]`, big endian.
    LoadIndirect {
        /// Packet offset, relative to X.
        off: u32,
        /// Number of bytes to read: 1, 2 or 4.
        size: u32,
    },
    /// `X <- (packet[off] & 0x0f) * 4`, the IPv4 header length shorthand.
    LoadMemShift {
        /// Packet offset of the length nibble.
        off: u32,
    },
    /// `A <-` the value of a named extension.
    LoadExtension {
        /// Extension to load.
        num: Extension,
    },
    /// `scratch[n] <- src`.
    StoreScratch {
        /// Register to store.
        src: Register,
        /// Scratch slot, in `0..16`.
        n: u32,
    },
    /// `A <- A op val`.
    AluOpConstant {
        /// Operator to apply.
        op: AluOp,
        /// Constant operand.
        val: u32,
    },
    /// `A <- A op X`.
    AluOpX {
        /// Operator to apply.
        op: AluOp,
    },
    /// `A <- -A`, two's complement on 32 bits.
    NegateA,
    /// Unconditional forward skip.
    Jump {
        /// Number of instructions to skip.
        skip: u32,
    },
    /// Conditional forward skip on `A <cond> val`.
    JumpIf {
        /// Comparison to perform.
        cond: JumpTest,
        /// Constant operand.
        val: u32,
        /// Skip count when the test holds.
        skip_true: u8,
        /// Skip count when it does not.
        skip_false: u8,
    },
    /// Conditional forward skip on `A <cond> X`.
    JumpIfX {
        /// Comparison to perform.
        cond: JumpTest,
        /// Skip count when the test holds.
        skip_true: u8,
        /// Skip count when it does not.
        skip_false: u8,
    },
    /// Return the value of A as the verdict.
    RetA,
    /// Return a constant verdict.
    RetConstant {
        /// The verdict.
        val: u32,
    },
    /// `X <- A`.
    Tax,
    /// `A <- X`.
    Txa,
    /// A raw word the disassembler did not recognize, carried through so that
    /// a disassemble/re-assemble round trip preserves the program.
    Raw(Insn),
}

impl Instruction {
    /// Encode this instruction as a raw `(op, jt, jf, k)` word.
    pub fn assemble(&self) -> Result<Insn, AssembleError> {
        match *self {
            Instruction::LoadConstant { dst, val } => {
                assemble_load(dst, 4, cbpf::BPF_IMM, val)
            }
            Instruction::LoadScratch { dst, n } => {
                check_scratch_slot(n)?;
                assemble_load(dst, 4, cbpf::BPF_MEM, n)
            }
            Instruction::LoadAbsolute { off, size } => {
                assemble_load(Register::A, size, cbpf::BPF_ABS, off)
            }
            Instruction::LoadIndirect { off, size } => {
                assemble_load(Register::A, size, cbpf::BPF_IND, off)
            }
            Instruction::LoadMemShift { off } => {
                assemble_load(Register::X, 1, cbpf::BPF_MSH, off)
            }
            Instruction::LoadExtension { num } => match num {
                // The packet length has a dedicated addressing mode; every
                // other extension is an absolute load into the ancillary
                // data space.
                Extension::Len => assemble_load(Register::A, 4, cbpf::BPF_LEN, 0),
                _ => assemble_load(
                    Register::A,
                    4,
                    cbpf::BPF_ABS,
                    cbpf::SKF_AD_OFF.wrapping_add(num.number()),
                ),
            },
            Instruction::StoreScratch { src, n } => {
                check_scratch_slot(n)?;
                let cls = match src {
                    Register::A => cbpf::BPF_ST,
                    Register::X => cbpf::BPF_STX,
                };
                Ok(Insn {
                    op: cls,
                    jt: 0,
                    jf: 0,
                    k: n,
                })
            }
            Instruction::AluOpConstant { op, val } => Ok(Insn {
                op: cbpf::BPF_ALU | cbpf::BPF_K | op.op_bits(),
                jt: 0,
                jf: 0,
                k: val,
            }),
            Instruction::AluOpX { op } => Ok(Insn {
                op: cbpf::BPF_ALU | cbpf::BPF_X | op.op_bits(),
                jt: 0,
                jf: 0,
                k: 0,
            }),
            Instruction::NegateA => Ok(Insn {
                op: cbpf::BPF_ALU | cbpf::BPF_NEG,
                jt: 0,
                jf: 0,
                k: 0,
            }),
            Instruction::Jump { skip } => Ok(Insn {
                op: cbpf::BPF_JMP | cbpf::BPF_JA,
                jt: 0,
                jf: 0,
                k: skip,
            }),
            Instruction::JumpIf {
                cond,
                val,
                skip_true,
                skip_false,
            } => Ok(assemble_jump(cond, cbpf::BPF_K, val, skip_true, skip_false)),
            Instruction::JumpIfX {
                cond,
                skip_true,
                skip_false,
            } => Ok(assemble_jump(cond, cbpf::BPF_X, 0, skip_true, skip_false)),
            Instruction::RetA => Ok(Insn {
                op: cbpf::BPF_RET | cbpf::BPF_A,
                jt: 0,
                jf: 0,
                k: 0,
            }),
            Instruction::RetConstant { val } => Ok(Insn {
                op: cbpf::BPF_RET | cbpf::BPF_K,
                jt: 0,
                jf: 0,
                k: val,
            }),
            Instruction::Tax => Ok(Insn {
                op: cbpf::BPF_MISC | cbpf::BPF_TAX,
                jt: 0,
                jf: 0,
                k: 0,
            }),
            Instruction::Txa => Ok(Insn {
                op: cbpf::BPF_MISC | cbpf::BPF_TXA,
                jt: 0,
                jf: 0,
                k: 0,
            }),
            Instruction::Raw(insn) => Ok(insn),
        }
    }
}

fn check_scratch_slot(n: u32) -> Result<(), AssembleError> {
    if n as usize >= cbpf::MEMWORDS {
        return Err(AssembleError::InvalidScratchSlot(n));
    }
    Ok(())
}

fn assemble_load(dst: Register, size: u32, mode: u16, k: u32) -> Result<Insn, AssembleError> {
    let cls = match dst {
        Register::A => cbpf::BPF_LD,
        Register::X => cbpf::BPF_LDX,
    };
    let size_bits = match size {
        1 => cbpf::BPF_B,
        2 => cbpf::BPF_H,
        4 => cbpf::BPF_W,
        _ => return Err(AssembleError::InvalidLoadSize(size)),
    };
    Ok(Insn {
        op: cls | size_bits | mode,
        jt: 0,
        jf: 0,
        k,
    })
}

/// Lower a jump test to its wire operator. The wire format only has the
/// non-inverted operators; inverted tests swap the skip counts.
fn assemble_jump(cond: JumpTest, src: u16, k: u32, skip_true: u8, skip_false: u8) -> Insn {
    let (op_bits, jt, jf) = match cond {
        JumpTest::Equal => (cbpf::BPF_JEQ, skip_true, skip_false),
        JumpTest::NotEqual => (cbpf::BPF_JEQ, skip_false, skip_true),
        JumpTest::GreaterThan => (cbpf::BPF_JGT, skip_true, skip_false),
        JumpTest::LessOrEqual => (cbpf::BPF_JGT, skip_false, skip_true),
        JumpTest::GreaterOrEqual => (cbpf::BPF_JGE, skip_true, skip_false),
        JumpTest::LessThan => (cbpf::BPF_JGE, skip_false, skip_true),
        JumpTest::BitsSet => (cbpf::BPF_JSET, skip_true, skip_false),
        JumpTest::BitsNotSet => (cbpf::BPF_JSET, skip_false, skip_true),
    };
    Insn {
        op: cbpf::BPF_JMP | src | op_bits,
        jt,
        jf,
        k,
    }
}

impl fmt::Display for Instruction {
    /// The canonical assembly notation, e.g. `ldh [x + 12]` or `jeq #42,8,9`.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Instruction::LoadConstant { dst, val } => match dst {
                Register::A => write!(f, "ld #{}", val),
                Register::X => write!(f, "ldx #{}", val),
            },
            Instruction::LoadScratch { dst, n } => match dst {
                Register::A => write!(f, "ld M[{}]", n),
                Register::X => write!(f, "ldx M[{}]", n),
            },
            Instruction::LoadAbsolute { off, size } => match size {
                1 => write!(f, "ldb [{}]", off),
                2 => write!(f, "ldh [{}]", off),
                4 => write!(f, "ld [{}]", off),
                _ => write!(f, "unknown instruction: {:?}", self),
            },
            Instruction::LoadIndirect { off, size } => match size {
                1 => write!(f, "ldb [x + {}]", off),
                2 => write!(f, "ldh [x + {}]", off),
                4 => write!(f, "ld [x + {}]", off),
                _ => write!(f, "unknown instruction: {:?}", self),
            },
            Instruction::LoadMemShift { off } => write!(f, "ldx 4*([{}]&0xf)", off),
            Instruction::LoadExtension { num } => match num.mnemonic() {
                Some(name) => write!(f, "ld #{}", name),
                None => write!(f, "unknown instruction: {:?}", self),
            },
            Instruction::StoreScratch { src, n } => match src {
                Register::A => write!(f, "st M[{}]", n),
                Register::X => write!(f, "stx M[{}]", n),
            },
            Instruction::AluOpConstant { op, val } => {
                write!(f, "{} #{}", op.mnemonic(), val)
            }
            Instruction::AluOpX { op } => write!(f, "{} x", op.mnemonic()),
            Instruction::NegateA => write!(f, "neg"),
            Instruction::Jump { skip } => write!(f, "ja {}", skip),
            Instruction::JumpIf {
                cond,
                val,
                skip_true,
                skip_false,
            } => jump_to_string(f, cond, skip_true, skip_false, &format!("#{}", val)),
            Instruction::JumpIfX {
                cond,
                skip_true,
                skip_false,
            } => jump_to_string(f, cond, skip_true, skip_false, "x"),
            Instruction::RetA => write!(f, "ret a"),
            Instruction::RetConstant { val } => write!(f, "ret #{}", val),
            Instruction::Tax => write!(f, "tax"),
            Instruction::Txa => write!(f, "txa"),
            Instruction::Raw(insn) => write!(f, "unknown instruction: {:?}", insn),
        }
    }
}

fn jump_to_string(
    f: &mut fmt::Formatter,
    cond: JumpTest,
    skip_true: u8,
    skip_false: u8,
    operand: &str,
) -> fmt::Result {
    match cond {
        JumpTest::Equal => conditional_jump(f, operand, skip_true, skip_false, "jeq", "jneq"),
        JumpTest::NotEqual => write!(f, "jneq {},{}", operand, skip_true),
        JumpTest::GreaterThan => conditional_jump(f, operand, skip_true, skip_false, "jgt", "jle"),
        JumpTest::LessThan => write!(f, "jlt {},{}", operand, skip_true),
        JumpTest::GreaterOrEqual => {
            conditional_jump(f, operand, skip_true, skip_false, "jge", "jlt")
        }
        JumpTest::LessOrEqual => write!(f, "jle {},{}", operand, skip_true),
        JumpTest::BitsSet => {
            if skip_false > 0 {
                write!(f, "jset {},{},{}", operand, skip_true, skip_false)
            } else {
                write!(f, "jset {},{}", operand, skip_true)
            }
        }
        // Rendered through the positive test with the skip counts swapped,
        // the same way the assembler lowers it.
        JumpTest::BitsNotSet => jump_to_string(f, JumpTest::BitsSet, skip_false, skip_true, operand),
    }
}

/// Render a test with both a positive and a negative spelling, preferring the
/// shortest form that drops a zero skip count.
fn conditional_jump(
    f: &mut fmt::Formatter,
    operand: &str,
    skip_true: u8,
    skip_false: u8,
    positive_jump: &str,
    negative_jump: &str,
) -> fmt::Result {
    if skip_true > 0 {
        if skip_false > 0 {
            write!(f, "{} {},{},{}", positive_jump, operand, skip_true, skip_false)
        } else {
            write!(f, "{} {},{}", positive_jump, operand, skip_true)
        }
    } else {
        write!(f, "{} {},{}", negative_jump, operand, skip_false)
    }
}
