#![allow(clippy::arithmetic_side_effects)]
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! This module contains all the definitions related to classic BPF: the bit
//! layout of the 16 bit operation code, the raw instruction record, and
//! helpers to move instructions in and out of the 8 byte kernel image.
//!
//! To learn more about the instruction format, see the Linux kernel
//! documentation: <https://www.kernel.org/doc/Documentation/networking/filter.txt>,
//! or the original BSD paper: <https://www.tcpdump.org/papers/bpf-usenix93.pdf>

use byteorder::{ByteOrder, NativeEndian};

/// Size of a classic BPF instruction, in bytes.
pub const INSN_SIZE: usize = 8;
/// Number of 32 bit scratch memory slots available to a program.
pub const MEMWORDS: usize = 16;
/// Offset in the absolute-load address space where the kernel's ancillary
/// data (the load extensions) begins. Matches `SKF_AD_OFF` (-0x1000).
pub const SKF_AD_OFF: u32 = 0xffff_f000;

// Operation codes.
// The three least significant bits are the operation class:

/// BPF operation class: load into A.
pub const BPF_LD: u16 = 0x00;
/// BPF operation class: load into X.
pub const BPF_LDX: u16 = 0x01;
/// BPF operation class: store A into scratch memory.
pub const BPF_ST: u16 = 0x02;
/// BPF operation class: store X into scratch memory.
pub const BPF_STX: u16 = 0x03;
/// BPF operation class: 32 bit arithmetic operation on A.
pub const BPF_ALU: u16 = 0x04;
/// BPF operation class: jump.
pub const BPF_JMP: u16 = 0x05;
/// BPF operation class: return a verdict.
pub const BPF_RET: u16 = 0x06;
/// BPF operation class: miscellaneous (register transfers).
pub const BPF_MISC: u16 = 0x07;

// For load instructions:
// +--------+--------+------------+
// | 3 bits | 2 bits |   3 bits   |
// |  mode  |  size  | insn class |
// +--------+--------+------------+
// (MSB)                     (LSB)

// Size modifiers:
/// BPF size modifier: word (4 bytes).
pub const BPF_W: u16 = 0x00;
/// BPF size modifier: half-word (2 bytes).
pub const BPF_H: u16 = 0x08;
/// BPF size modifier: byte (1 byte).
pub const BPF_B: u16 = 0x10;

// Mode modifiers:
/// BPF mode modifier: immediate value.
pub const BPF_IMM: u16 = 0x00;
/// BPF mode modifier: absolute packet offset.
pub const BPF_ABS: u16 = 0x20;
/// BPF mode modifier: packet offset relative to X.
pub const BPF_IND: u16 = 0x40;
/// BPF mode modifier: scratch memory slot.
pub const BPF_MEM: u16 = 0x60;
/// BPF mode modifier: packet length.
pub const BPF_LEN: u16 = 0x80;
/// BPF mode modifier: IPv4 header length shorthand, `(pkt[k] & 0xf) * 4`.
pub const BPF_MSH: u16 = 0xa0;

// For arithmetic (BPF_ALU) and jump (BPF_JMP) instructions:
// +----------------+----+------------+
// |     4 bits     |1 b.|   3 bits   |
// | operation code | src| insn class |
// +----------------+----+------------+
// (MSB)                          (LSB)

// Source modifiers:
/// BPF source operand modifier: 32 bit immediate value.
pub const BPF_K: u16 = 0x00;
/// BPF source operand modifier: the X register.
pub const BPF_X: u16 = 0x08;

// Operation codes -- BPF_ALU class:
/// BPF ALU operation code: addition.
pub const BPF_ADD: u16 = 0x00;
/// BPF ALU operation code: subtraction.
pub const BPF_SUB: u16 = 0x10;
/// BPF ALU operation code: multiplication.
pub const BPF_MUL: u16 = 0x20;
/// BPF ALU operation code: division.
pub const BPF_DIV: u16 = 0x30;
/// BPF ALU operation code: or.
pub const BPF_OR: u16 = 0x40;
/// BPF ALU operation code: and.
pub const BPF_AND: u16 = 0x50;
/// BPF ALU operation code: left shift.
pub const BPF_LSH: u16 = 0x60;
/// BPF ALU operation code: right shift.
pub const BPF_RSH: u16 = 0x70;
/// BPF ALU operation code: negation.
pub const BPF_NEG: u16 = 0x80;
/// BPF ALU operation code: modulus.
pub const BPF_MOD: u16 = 0x90;
/// BPF ALU operation code: exclusive or.
pub const BPF_XOR: u16 = 0xa0;

// Operation codes -- BPF_JMP class:
/// BPF JMP operation code: unconditional jump.
pub const BPF_JA: u16 = 0x00;
/// BPF JMP operation code: jump if equal.
pub const BPF_JEQ: u16 = 0x10;
/// BPF JMP operation code: jump if greater than.
pub const BPF_JGT: u16 = 0x20;
/// BPF JMP operation code: jump if greater or equal.
pub const BPF_JGE: u16 = 0x30;
/// BPF JMP operation code: jump if `A & k` is non-zero.
pub const BPF_JSET: u16 = 0x40;

// For return instructions, bit 4 selects the verdict source:
/// BPF return source: the A register.
pub const BPF_A: u16 = 0x10;
// (BPF_K, 0x00, selects the constant operand.)

// Operation codes -- BPF_MISC class:
/// BPF MISC operation code: `X <- A`.
pub const BPF_TAX: u16 = 0x00;
/// BPF MISC operation code: `A <- X`.
pub const BPF_TXA: u16 = 0x80;

// Masks to pick the individual fields back out of an operation code.
/// Mask to extract the operation class from an operation code.
pub const BPF_CLS_MASK: u16 = 0x07;
/// Mask to extract the load size from an operation code.
pub const BPF_SIZE_MASK: u16 = 0x18;
/// Mask to extract the load addressing mode from an operation code.
pub const BPF_MODE_MASK: u16 = 0xe0;
/// Mask to extract the ALU or jump operator from an operation code.
pub const BPF_OP_MASK: u16 = 0xf0;
/// Mask to extract the operand source (constant or X) from an operation code.
pub const BPF_SRC_MASK: u16 = 0x08;
/// Mask to extract the verdict source from a return operation code.
pub const BPF_RVAL_MASK: u16 = 0x18;
/// Mask to extract the sub-operation from a miscellaneous operation code.
pub const BPF_MISCOP_MASK: u16 = 0xf8;

/// A classic BPF instruction in its raw, kernel-facing form.
///
/// The record is opaque: the meaning of `k` and of the skip counts derives
/// entirely from the bit layout of `op`. Words that carry no jump behavior
/// leave `jt` and `jf` zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Insn {
    /// Operation code (class, size, mode, operator).
    pub op: u16,
    /// Number of instructions to skip when a conditional jump is taken.
    pub jt: u8,
    /// Number of instructions to skip when a conditional jump falls through.
    pub jf: u8,
    /// Class dependent constant: immediate, packet offset, scratch slot,
    /// skip count or extension number.
    pub k: u32,
}

impl Insn {
    /// Turn an `Insn` into the 8 byte image the kernel ingests.
    ///
    /// The kernel reads `struct sock_filter` in the host's native layout, so
    /// the multi-byte fields are emitted in native byte order.
    ///
    /// # Examples
    ///
    /// ```
    /// use rcbpf::cbpf;
    ///
    /// let insn = cbpf::Insn { op: 0x28, jt: 0, jf: 0, k: 12 };
    /// assert_eq!(cbpf::Insn::from_array(&insn.to_array()), insn);
    /// ```
    pub fn to_array(&self) -> [u8; INSN_SIZE] {
        let mut image = [0u8; INSN_SIZE];
        NativeEndian::write_u16(&mut image[0..2], self.op);
        image[2] = self.jt;
        image[3] = self.jf;
        NativeEndian::write_u32(&mut image[4..8], self.k);
        image
    }

    /// Turn an `Insn` into a vector of bytes, native layout as in
    /// [`Insn::to_array`].
    pub fn to_vec(&self) -> Vec<u8> {
        self.to_array().to_vec()
    }

    /// Reconstruct an `Insn` from its 8 byte image.
    pub fn from_array(image: &[u8; INSN_SIZE]) -> Insn {
        Insn {
            op: NativeEndian::read_u16(&image[0..2]),
            jt: image[2],
            jf: image[3],
            k: NativeEndian::read_u32(&image[4..8]),
        }
    }
}

/// Get the instruction at `pc` of a classic BPF byte image. `pc` is the index
/// (number) of the instruction, not a byte offset; the first instruction has
/// index 0.
///
/// # Panics
///
/// Panics if the image does not contain a full instruction at `pc`.
///
/// # Examples
///
/// ```
/// use rcbpf::cbpf;
///
/// let prog = [
///     cbpf::Insn { op: 0x20, jt: 0, jf: 0, k: 42 },
///     cbpf::Insn { op: 0x16, jt: 0, jf: 0, k: 0 },
/// ]
/// .iter()
/// .flat_map(cbpf::Insn::to_vec)
/// .collect::<Vec<u8>>();
/// assert_eq!(cbpf::get_insn(&prog, 1).op, 0x16);
/// ```
pub fn get_insn(prog: &[u8], pc: usize) -> Insn {
    // The callers inside the crate stay in bounds, but this function is
    // publicly available and can be handed any `pc`, so check anyway.
    assert!(
        (pc + 1) * INSN_SIZE <= prog.len(),
        "cannot reach instruction at index {:?} in image containing {:?} bytes",
        pc,
        prog.len()
    );
    Insn {
        op: NativeEndian::read_u16(&prog[INSN_SIZE * pc..]),
        jt: prog[INSN_SIZE * pc + 2],
        jf: prog[INSN_SIZE * pc + 3],
        k: NativeEndian::read_u32(&prog[INSN_SIZE * pc + 4..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_round_trip() {
        let insn = Insn {
            op: BPF_JMP | BPF_JEQ | BPF_K,
            jt: 3,
            jf: 7,
            k: 0x0800,
        };
        assert_eq!(Insn::from_array(&insn.to_array()), insn);
    }

    #[test]
    fn test_get_insn() {
        let prog = [
            Insn {
                op: BPF_LD | BPF_ABS | BPF_H,
                jt: 0,
                jf: 0,
                k: 12,
            },
            Insn {
                op: BPF_RET | BPF_K,
                jt: 0,
                jf: 0,
                k: 1500,
            },
        ]
        .iter()
        .flat_map(Insn::to_vec)
        .collect::<Vec<u8>>();
        assert_eq!(get_insn(&prog, 0).k, 12);
        assert_eq!(get_insn(&prog, 1).op, BPF_RET | BPF_K);
    }

    #[test]
    #[should_panic(expected = "cannot reach instruction")]
    fn test_get_insn_out_of_bounds() {
        let prog = [0u8; INSN_SIZE + 2];
        get_insn(&prog, 1);
    }
}
