// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

extern crate rcbpf;

use rcbpf::instruction::{AluOp, Extension, Instruction, JumpTest, Register};
use rcbpf::vm::Vm;

fn run(prog: &[Instruction], input: &[u8]) -> u32 {
    Vm::new(prog).unwrap().run(input).unwrap()
}

#[test]
fn test_alu_add_constant() {
    let verdict = run(
        &[
            Instruction::LoadAbsolute { off: 8, size: 1 },
            Instruction::AluOpConstant {
                op: AluOp::Add,
                val: 3,
            },
            Instruction::RetA,
        ],
        &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0, 1, 2, 3],
    );
    // 0 + 3 = 3
    assert_eq!(verdict, 3);
}

#[test]
fn test_divide_by_x_zero_halts_with_verdict_zero() {
    let verdict = run(
        &[
            Instruction::LoadAbsolute { off: 8, size: 1 },
            Instruction::Tax,
            Instruction::LoadAbsolute { off: 9, size: 1 },
            Instruction::AluOpX { op: AluOp::Div },
            Instruction::LoadConstant {
                dst: Register::A,
                val: 12,
            },
            Instruction::RetA,
        ],
        &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0, 1, 3, 4],
    );
    assert_eq!(verdict, 0);
}

#[test]
fn test_modulus_by_x_zero_halts_with_verdict_zero() {
    let verdict = run(
        &[
            Instruction::LoadConstant {
                dst: Register::A,
                val: 42,
            },
            Instruction::AluOpX { op: AluOp::Mod },
            Instruction::RetConstant { val: 9 },
        ],
        &[],
    );
    assert_eq!(verdict, 0);
}

#[test]
fn test_out_of_bounds_load_returns_zero() {
    let verdict = run(
        &[
            Instruction::LoadAbsolute { off: 100, size: 2 },
            Instruction::RetA,
        ],
        &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0, 1, 2, 3],
    );
    assert_eq!(verdict, 0);
}

#[test]
fn test_partially_out_of_bounds_load_returns_zero() {
    // The last byte of a half-word read hangs past the end of the input.
    let verdict = run(
        &[
            Instruction::LoadAbsolute { off: 3, size: 2 },
            Instruction::RetConstant { val: 1 },
        ],
        &[1, 2, 3, 4],
    );
    assert_eq!(verdict, 0);
}

#[test]
fn test_load_extension_len() {
    let prog = [
        Instruction::LoadExtension {
            num: Extension::Len,
        },
        Instruction::RetA,
    ];
    let mut input = vec![0xff; 16];
    input.extend_from_slice(&[0, 1, 2, 3]);
    assert_eq!(run(&prog, &input), 20);
    assert_eq!(run(&prog, &[]), 0);
}

#[test]
fn test_mem_shift_and_indirect_match_udp_dns_port() {
    // Walk an IPv4 header by its IHL nibble and compare the UDP destination
    // port against 53.
    let prog = [
        Instruction::LoadMemShift { off: 8 },
        Instruction::LoadIndirect { off: 10, size: 2 },
        Instruction::JumpIf {
            cond: JumpTest::Equal,
            val: 0x0035,
            skip_true: 0,
            skip_false: 1,
        },
        Instruction::RetConstant { val: 1500 },
        Instruction::RetConstant { val: 0 },
    ];
    #[rustfmt::skip]
    let input = [
        // Pad up to the header.
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        // Minimal IPv4 header, IHL = 5 words.
        0x45, 0x00, 0x00, 0x20, 0x00, 0x01, 0x00, 0x00,
        0x40, 0x11, 0x00, 0x00, 192, 168, 1, 1,
        192, 168, 1, 2,
        // UDP header: source port 12345, destination port 53.
        0x30, 0x39, 0x00, 0x35, 0x00, 0x0c, 0x00, 0x00,
    ];
    assert_eq!(run(&prog, &input), 1500);

    // Destination port 54 falls through to the reject verdict.
    let mut other = input;
    other[31] = 0x36;
    assert_eq!(run(&prog, &other), 0);
}

#[test]
fn test_mem_shift_out_of_bounds_returns_zero() {
    let verdict = run(
        &[
            Instruction::LoadMemShift { off: 10 },
            Instruction::RetConstant { val: 7 },
        ],
        &[0x45, 0x00],
    );
    assert_eq!(verdict, 0);
}

#[test]
fn test_scratch_memory_store_and_load() {
    let verdict = run(
        &[
            Instruction::LoadConstant {
                dst: Register::A,
                val: 42,
            },
            Instruction::StoreScratch {
                src: Register::A,
                n: 2,
            },
            Instruction::LoadConstant {
                dst: Register::A,
                val: 0,
            },
            Instruction::LoadScratch {
                dst: Register::A,
                n: 2,
            },
            Instruction::RetA,
        ],
        &[],
    );
    assert_eq!(verdict, 42);
}

#[test]
fn test_scratch_memory_does_not_persist_across_invocations() {
    let vm = Vm::new(&[
        Instruction::LoadScratch {
            dst: Register::A,
            n: 0,
        },
        Instruction::AluOpConstant {
            op: AluOp::Add,
            val: 1,
        },
        Instruction::StoreScratch {
            src: Register::A,
            n: 0,
        },
        Instruction::RetA,
    ])
    .unwrap();
    assert_eq!(vm.run(&[]).unwrap(), 1);
    assert_eq!(vm.run(&[]).unwrap(), 1);
}

#[test]
fn test_register_transfers() {
    let verdict = run(
        &[
            Instruction::LoadConstant {
                dst: Register::A,
                val: 9,
            },
            Instruction::Tax,
            Instruction::LoadConstant {
                dst: Register::A,
                val: 0,
            },
            Instruction::Txa,
            Instruction::RetA,
        ],
        &[],
    );
    assert_eq!(verdict, 9);
}

#[test]
fn test_negate_wraps_to_two_complement() {
    let verdict = run(
        &[
            Instruction::LoadConstant {
                dst: Register::A,
                val: 1,
            },
            Instruction::NegateA,
            Instruction::RetA,
        ],
        &[],
    );
    assert_eq!(verdict, 0xffff_ffff);
}

#[test]
fn test_subtraction_wraps() {
    let verdict = run(
        &[
            Instruction::LoadConstant {
                dst: Register::A,
                val: 1,
            },
            Instruction::AluOpConstant {
                op: AluOp::Sub,
                val: 3,
            },
            Instruction::RetA,
        ],
        &[],
    );
    assert_eq!(verdict, 0xffff_fffe);
}

#[test]
fn test_shifts_by_register_width_or_more_yield_zero() {
    for &op in &[AluOp::ShiftLeft, AluOp::ShiftRight] {
        let verdict = run(
            &[
                Instruction::LoadConstant {
                    dst: Register::A,
                    val: 0xffff_ffff,
                },
                Instruction::AluOpConstant { op, val: 32 },
                Instruction::RetA,
            ],
            &[],
        );
        assert_eq!(verdict, 0);
    }
}

#[test]
fn test_packet_loads_are_big_endian() {
    let input = [0x12, 0x34, 0x56, 0x78];
    let verdict = run(
        &[
            Instruction::LoadAbsolute { off: 0, size: 4 },
            Instruction::RetA,
        ],
        &input,
    );
    assert_eq!(verdict, 0x1234_5678);
    let verdict = run(
        &[
            Instruction::LoadAbsolute { off: 1, size: 2 },
            Instruction::RetA,
        ],
        &input,
    );
    assert_eq!(verdict, 0x3456);
}

#[test]
fn test_indirect_offset_wraps_like_the_kernel() {
    // X + off is 32 bit arithmetic; a wrapped offset that lands back inside
    // the input is read, not refused.
    let verdict = run(
        &[
            Instruction::LoadConstant {
                dst: Register::X,
                val: 0xffff_ffff,
            },
            Instruction::LoadIndirect { off: 2, size: 1 },
            Instruction::RetA,
        ],
        &[7, 8, 9],
    );
    assert_eq!(verdict, 8);
}

#[test]
fn test_unconditional_jump_skips_instructions() {
    let verdict = run(
        &[
            Instruction::Jump { skip: 1 },
            Instruction::RetConstant { val: 1 },
            Instruction::RetConstant { val: 2 },
        ],
        &[],
    );
    assert_eq!(verdict, 2);
}

#[test]
fn test_conditional_jump_tests() {
    let cases: &[(JumpTest, u32, u32)] = &[
        // (test, operand, verdict with A = 8)
        (JumpTest::Equal, 8, 1),
        (JumpTest::Equal, 9, 2),
        (JumpTest::NotEqual, 9, 1),
        (JumpTest::GreaterThan, 7, 1),
        (JumpTest::GreaterThan, 8, 2),
        (JumpTest::LessThan, 9, 1),
        (JumpTest::GreaterOrEqual, 8, 1),
        (JumpTest::LessOrEqual, 7, 2),
        (JumpTest::BitsSet, 0x08, 1),
        (JumpTest::BitsSet, 0x04, 2),
        (JumpTest::BitsNotSet, 0x04, 1),
        (JumpTest::BitsNotSet, 0x08, 2),
    ];
    for &(cond, val, want) in cases {
        let verdict = run(
            &[
                Instruction::LoadConstant {
                    dst: Register::A,
                    val: 8,
                },
                Instruction::JumpIf {
                    cond,
                    val,
                    skip_true: 1,
                    skip_false: 0,
                },
                Instruction::RetConstant { val: 2 },
                Instruction::RetConstant { val: 1 },
            ],
            &[],
        );
        assert_eq!(verdict, want, "test {:?} against {}", cond, val);
    }
}

#[test]
fn test_conditional_jump_against_x() {
    let verdict = run(
        &[
            Instruction::LoadConstant {
                dst: Register::A,
                val: 8,
            },
            Instruction::LoadConstant {
                dst: Register::X,
                val: 8,
            },
            Instruction::JumpIfX {
                cond: JumpTest::Equal,
                skip_true: 1,
                skip_false: 0,
            },
            Instruction::RetConstant { val: 2 },
            Instruction::RetConstant { val: 1 },
        ],
        &[],
    );
    assert_eq!(verdict, 1);
}

#[test]
fn test_alu_op_x_applies_operator() {
    let verdict = run(
        &[
            Instruction::LoadConstant {
                dst: Register::A,
                val: 80,
            },
            Instruction::LoadConstant {
                dst: Register::X,
                val: 4,
            },
            Instruction::AluOpX { op: AluOp::Div },
            Instruction::RetA,
        ],
        &[],
    );
    assert_eq!(verdict, 20);
}

#[test]
fn test_raw_instruction_loads_but_fails_at_run_time() {
    // An unrecognized word survives loading (the kernel might understand it)
    // but the user space machine refuses to execute it.
    let junk = rcbpf::cbpf::Insn {
        op: 0xffff,
        jt: 0,
        jf: 0,
        k: 0,
    };
    let vm = Vm::new(&[Instruction::Raw(junk), Instruction::RetA]).unwrap();
    let err = vm.run(&[]).unwrap_err();
    assert_eq!(err.to_string(), "unknown instruction at index 0");
}
