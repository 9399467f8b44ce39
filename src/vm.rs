// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! User space virtual machine for classic BPF programs.

use crate::{assembler, error::CbpfError, instruction::Instruction, interpreter, verifier};

/// A validated classic BPF program, ready to run against input buffers.
///
/// A `Vm` is immutable after construction, so a single value can be shared
/// across threads and run concurrently, each call with its own input slice.
/// Registers and scratch memory are per invocation and never persist.
///
/// # Examples
///
/// ```
/// use rcbpf::instruction::{AluOp, Instruction};
/// use rcbpf::vm::Vm;
///
/// let vm = Vm::new(&[
///     Instruction::LoadAbsolute { off: 8, size: 1 },
///     Instruction::AluOpConstant { op: AluOp::Add, val: 3 },
///     Instruction::RetA,
/// ])
/// .unwrap();
/// let verdict = vm
///     .run(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0, 1, 2, 3])
///     .unwrap();
/// assert_eq!(verdict, 3);
/// ```
#[derive(Debug, Clone)]
pub struct Vm {
    filter: Vec<Instruction>,
}

impl Vm {
    /// Validate a program and construct a machine for it.
    ///
    /// The checks, in order: the program is non-empty; every skip count lands
    /// inside the program; no division or modulus by a constant zero; no load
    /// extension other than the packet length; the last instruction returns a
    /// verdict. Finally the program is assembled, so that an encoding an
    /// operating system VM would refuse is also caught here.
    ///
    /// A program that passes these checks terminates after at most
    /// `filter.len()` interpreter steps.
    pub fn new(filter: &[Instruction]) -> Result<Vm, CbpfError> {
        verifier::check(filter)?;
        assembler::assemble(filter)?;
        Ok(Vm {
            filter: filter.to_vec(),
        })
    }

    /// Run the program over `input` and return its verdict, conventionally
    /// the number of bytes of the input to accept.
    ///
    /// Out-of-bounds packet reads and division by a zero `X` register are
    /// not errors; they terminate the program with verdict 0.
    pub fn run(&self, input: &[u8]) -> Result<u32, CbpfError> {
        interpreter::execute(&self.filter, input)
    }
}
