#![allow(clippy::arithmetic_side_effects)]
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! This module parses classic BPF assembly language source code, the notation
//! produced by `Display` on typed instructions and by the kernel's `bpf_asm`
//! tool.

use combine::{
    attempt, between,
    char::{alpha_num, char, digit, hex_digit, spaces, string},
    combine_parse_partial, combine_parser_impl,
    easy::{Error, Errors, Info},
    eof, many, many1, parse_mode, parser, sep_by, skip_many,
    stream::state::{SourcePosition, State},
    Parser, Stream,
};

/// Operand of an instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    /// Immediate constant, `#42`.
    Immediate(u32),
    /// Named extension value, `#len`.
    Extension(String),
    /// Absolute packet offset, `[42]`.
    Absolute(u32),
    /// Packet offset relative to X, `[x + 42]`.
    Indirect(u32),
    /// Scratch memory slot, `M[3]`.
    Scratch(u32),
    /// IPv4 header length shorthand, `4*([42]&0xf)`.
    MemShift(u32),
    /// Register operand, `a` or `x`.
    Register(char),
    /// Bare integer, used for jump skip counts.
    Integer(u32),
}

/// Parsed statement: one instruction with its operands.
#[derive(Debug, PartialEq, Eq)]
pub struct Statement {
    /// Instruction mnemonic.
    pub name: String,
    /// Operands, in source order.
    pub operands: Vec<Operand>,
}

parser! {
    fn ident[I]()(I) -> String where [I: Stream<Item=char>] {
        many1(alpha_num().or(char('_')))
    }
}

parser! {
    fn mnemonic[I]()(I) -> String where [I: Stream<Item=char>] {
        many1(alpha_num())
    }
}

parser! {
    fn integer[I]()(I) -> u32 where [I: Stream<Item=char>] {
        let hex = string("0x")
            .with(many1(hex_digit()))
            .map(|x: String| u32::from_str_radix(&x, 16).unwrap_or(0));
        let dec = many1(digit()).map(|x: String| x.parse::<u32>().unwrap_or(0));
        attempt(hex).or(dec)
    }
}

parser! {
    fn operand[I]()(I) -> Operand where [I: Stream<Item=char>] {
        let immediate = char('#').with(
            integer()
                .map(Operand::Immediate)
                .or(ident().map(Operand::Extension)),
        );
        let mem_shift =
            between(string("4*(["), string("]&0xf)"), integer()).map(Operand::MemShift);
        let scratch = char('M')
            .with(between(char('['), char(']'), integer()))
            .map(Operand::Scratch);
        let packet = between(
            char('['),
            char(']'),
            attempt(
                (
                    char('x').skip(skip_many(char(' '))),
                    char('+').skip(skip_many(char(' '))),
                    integer(),
                )
                    .map(|t| Operand::Indirect(t.2)),
            )
            .or(integer().map(Operand::Absolute)),
        );
        let register = char('a')
            .or(char('x'))
            .map(Operand::Register);
        attempt(mem_shift)
            .or(immediate)
            .or(scratch)
            .or(packet)
            .or(register)
            .or(integer().map(Operand::Integer))
    }
}

parser! {
    fn instruction[I]()(I) -> Statement where [I: Stream<Item=char>] {
        let operands = sep_by(operand(), char(',').skip(skip_many(char(' '))));
        (mnemonic().skip(skip_many(char(' '))), operands)
            .map(|t| Statement { name: t.0, operands: t.1 })
    }
}

fn format_info(info: &Info<char, &str>) -> String {
    match *info {
        Info::Token(x) => format!("{:?}", x),
        Info::Range(x) => format!("{:?}", x),
        Info::Owned(ref x) => x.clone(),
        Info::Borrowed(x) => x.to_string(),
    }
}

fn format_error(error: &Error<char, &str>) -> String {
    match *error {
        Error::Unexpected(ref x) => format!("unexpected {}", format_info(x)),
        Error::Expected(ref x) => format!("expected {}", format_info(x)),
        Error::Message(ref x) => format_info(x),
        Error::Other(ref x) => format!("{:?}", x),
    }
}

fn format_parse_error(parse_error: &Errors<char, &str, SourcePosition>) -> String {
    format!(
        "Parse error at line {} column {}: {}",
        parse_error.position.line,
        parse_error.position.column,
        parse_error
            .errors
            .iter()
            .map(format_error)
            .collect::<Vec<String>>()
            .join(", ")
    )
}

/// Parse a string into a list of statements.
///
/// The statements are not validated and may have invalid names and operand
/// types; turning them into instructions is the assembler's job.
pub fn parse(input: &str) -> Result<Vec<Statement>, String> {
    match spaces()
        .with(many(instruction().skip(spaces())))
        .skip(eof())
        .easy_parse(State::with_positioner(input, SourcePosition::default()))
    {
        Ok((insts, _)) => Ok(insts),
        Err(err) => Err(format_parse_error(&err)),
    }
}

#[cfg(test)]
mod tests {
    use super::{instruction, integer, operand, parse, Operand, Statement};
    use combine::Parser;

    // Unit tests for the individual parsers.

    #[test]
    fn test_integer() {
        assert_eq!(integer().parse("0"), Ok((0, "")));
        assert_eq!(integer().parse("42"), Ok((42, "")));
        assert_eq!(integer().parse("0x0"), Ok((0, "")));
        assert_eq!(integer().parse("0xfffff000"), Ok((0xffff_f000, "")));
    }

    #[test]
    fn test_operand() {
        assert_eq!(operand().parse("#42"), Ok((Operand::Immediate(42), "")));
        assert_eq!(
            operand().parse("#len"),
            Ok((Operand::Extension("len".to_string()), ""))
        );
        assert_eq!(operand().parse("[42]"), Ok((Operand::Absolute(42), "")));
        assert_eq!(operand().parse("[x + 42]"), Ok((Operand::Indirect(42), "")));
        assert_eq!(operand().parse("[x+42]"), Ok((Operand::Indirect(42), "")));
        assert_eq!(operand().parse("M[3]"), Ok((Operand::Scratch(3), "")));
        assert_eq!(
            operand().parse("4*([14]&0xf)"),
            Ok((Operand::MemShift(14), ""))
        );
        assert_eq!(operand().parse("a"), Ok((Operand::Register('a'), "")));
        assert_eq!(operand().parse("x"), Ok((Operand::Register('x'), "")));
        assert_eq!(operand().parse("8"), Ok((Operand::Integer(8), "")));
    }

    #[test]
    fn test_instruction() {
        assert_eq!(
            instruction().parse("tax"),
            Ok((
                Statement {
                    name: "tax".to_string(),
                    operands: vec![],
                },
                ""
            ))
        );

        assert_eq!(
            instruction().parse("ldh [12]"),
            Ok((
                Statement {
                    name: "ldh".to_string(),
                    operands: vec![Operand::Absolute(12)],
                },
                ""
            ))
        );

        assert_eq!(
            instruction().parse("jeq #42,8,9"),
            Ok((
                Statement {
                    name: "jeq".to_string(),
                    operands: vec![
                        Operand::Immediate(42),
                        Operand::Integer(8),
                        Operand::Integer(9)
                    ],
                },
                ""
            ))
        );

        // Whitespace between operands is optional.
        assert_eq!(
            instruction().parse("jset x, 2"),
            Ok((
                Statement {
                    name: "jset".to_string(),
                    operands: vec![Operand::Register('x'), Operand::Integer(2)],
                },
                ""
            ))
        );
    }

    #[test]
    fn test_empty() {
        assert_eq!(parse(""), Ok(vec![]));
    }

    #[test]
    fn test_dns_match() {
        // Accept UDP-over-IPv4 packets whose destination port is 53.
        let src = "\
ldx 4*([14]&0xf)
ldh [x + 16]
jeq #53,0,1
ret #1500
ret #0
";

        assert_eq!(
            parse(src),
            Ok(vec![
                Statement {
                    name: "ldx".to_string(),
                    operands: vec![Operand::MemShift(14)],
                },
                Statement {
                    name: "ldh".to_string(),
                    operands: vec![Operand::Indirect(16)],
                },
                Statement {
                    name: "jeq".to_string(),
                    operands: vec![
                        Operand::Immediate(53),
                        Operand::Integer(0),
                        Operand::Integer(1)
                    ],
                },
                Statement {
                    name: "ret".to_string(),
                    operands: vec![Operand::Immediate(1500)],
                },
                Statement {
                    name: "ret".to_string(),
                    operands: vec![Operand::Immediate(0)],
                },
            ])
        );
    }

    #[test]
    fn test_error_unexpected_character() {
        assert!(parse("ld ^4")
            .unwrap_err()
            .starts_with("Parse error at line 1 column 4: unexpected '^'"));
    }

    #[test]
    fn test_initial_whitespace() {
        assert_eq!(
            parse(
                "
                          ret a"
            ),
            Ok(vec![Statement {
                name: "ret".to_string(),
                operands: vec![Operand::Register('a')],
            }])
        );
    }
}
