//! Operand-phase parsing: turns the remaining tokens of an instruction
//! line into a typed [`Instruction`]. Values and displacements stay
//! textual here; code generation converts them once the symbol tables
//! are settled.

use std::collections::VecDeque;

use common::asm::{register_code, AddrMode, Opcode};
use common::constants::{BYTE, WORD};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::helpers::parse_int;
use crate::lexer::{token_type, TokenType};
use crate::misc::AsmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    ImmedValue,
    ImmedSymbol,
    Register,
    Psw,
    DisplValue,
    DisplSymbol,
    PcRelative,
    MemoryValue,
    MemorySymbol,
}

#[derive(Debug, Clone)]
pub struct Operand {
    pub addressing: AddrMode,
    pub kind: OperandKind,
    pub value: String,
    pub displacement: String,
    // Descriptor byte plus payload.
    pub size: u16,
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub code: Opcode,
    pub operand_size: u16,
    pub size: u16,
    pub destination: Option<Operand>,
    pub source: Option<Operand>,
}

static REG_DIR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(r[0-7]|psw)([hl])?$").unwrap());

impl Instruction {
    // `queue` holds the tokens after the mnemonic: zero, one or two
    // operands, in `dst, src` order.
    pub fn extract(
        mnemonic: &str,
        queue: &mut VecDeque<String>,
        line: u32,
    ) -> Result<Instruction, AsmError> {
        let (code, operand_size) = split_mnemonic(mnemonic, line)?;

        let mut destination = None;
        let mut source = None;

        if code.arity() >= 1 {
            let text = next_operand_text(queue, line)?;
            destination = Some(parse_operand(&text, operand_size, line)?);
        }
        if code.arity() == 2 {
            let text = next_operand_text(queue, line)?;
            source = Some(parse_operand(&text, operand_size, line)?);
        }

        let size = 1
            + destination.as_ref().map_or(0, |op| op.size)
            + source.as_ref().map_or(0, |op| op.size);

        Ok(Instruction { code, operand_size, size, destination, source })
    }
}

// A bare mnemonic defaults to word width; a `b`/`w` suffix overrides.
// Whole-mnemonic lookup runs first so `sub` is not read as `su` + `b`.
fn split_mnemonic(mnemonic: &str, line: u32) -> Result<(Opcode, u16), AsmError> {
    if let Some(code) = Opcode::from_mnemonic(mnemonic) {
        return Ok((code, WORD));
    }

    let unknown = || AsmError::UnknownInstruction {
        line,
        mnemonic: mnemonic.to_string(),
    };

    if mnemonic.len() < 2 {
        return Err(unknown());
    }
    let (base, suffix) = mnemonic.split_at(mnemonic.len() - 1);
    let code = Opcode::from_mnemonic(base).ok_or_else(unknown)?;
    let operand_size = match suffix {
        "b" => BYTE,
        "w" => WORD,
        _ => return Err(unknown()),
    };
    Ok((code, operand_size))
}

// The lexer splits on whitespace, so a bracketed operand written as
// `[r3 + 4]` arrives in pieces; glue them back up to the closing `]`.
fn next_operand_text(queue: &mut VecDeque<String>, line: u32) -> Result<String, AsmError> {
    let mut text = queue
        .pop_front()
        .ok_or(AsmError::InvalidOperandType { line })?;

    if text.starts_with('[') {
        while !text.ends_with(']') {
            let next = queue
                .pop_front()
                .ok_or(AsmError::InvalidOperandType { line })?;
            text.push_str(&next);
        }
    }

    Ok(text)
}

fn parse_operand(text: &str, operand_size: u16, line: u32) -> Result<Operand, AsmError> {
    let invalid = || AsmError::InvalidOperandType { line };

    if let Some(rest) = text.strip_prefix('$') {
        let kind = match token_type(rest) {
            TokenType::OperandImmed => OperandKind::ImmedValue,
            TokenType::Symbol => OperandKind::ImmedSymbol,
            _ => return Err(invalid()),
        };
        return Ok(Operand {
            addressing: AddrMode::Immed,
            kind,
            value: rest.to_string(),
            displacement: String::new(),
            size: 1 + operand_size,
        });
    }

    if let Some(rest) = text.strip_prefix('%') {
        if token_type(rest) != TokenType::Symbol {
            return Err(invalid());
        }
        // Encoded as register-indirect-with-displacement off the PC.
        return Ok(Operand {
            addressing: AddrMode::RegInd16,
            kind: OperandKind::PcRelative,
            value: "r7".to_string(),
            displacement: rest.to_string(),
            size: 3,
        });
    }

    if let Some(inner) = text.strip_prefix('[') {
        let inner = inner.strip_suffix(']').ok_or_else(invalid)?;

        if register_code(inner).is_some() {
            return Ok(Operand {
                addressing: AddrMode::RegInd,
                kind: register_kind(inner),
                value: inner.to_string(),
                displacement: String::new(),
                size: 1,
            });
        }

        let (reg, displacement) = inner.split_once('+').ok_or_else(invalid)?;
        if register_code(reg).is_none() {
            return Err(invalid());
        }

        return match token_type(displacement) {
            TokenType::OperandImmed => {
                let value = parse_int(displacement).ok_or_else(invalid)?;
                let (addressing, size) = if (-128..=127).contains(&value) {
                    (AddrMode::RegInd8, 2)
                } else {
                    (AddrMode::RegInd16, 3)
                };
                Ok(Operand {
                    addressing,
                    kind: OperandKind::DisplValue,
                    value: reg.to_string(),
                    displacement: displacement.to_string(),
                    size,
                })
            }
            TokenType::Symbol => Ok(Operand {
                addressing: AddrMode::RegInd16,
                kind: OperandKind::DisplSymbol,
                value: reg.to_string(),
                displacement: displacement.to_string(),
                size: 3,
            }),
            _ => Err(invalid()),
        };
    }

    if let Some(caps) = REG_DIR_RE.captures(text) {
        let name = caps.get(1).unwrap().as_str();
        let half = caps.get(2).map_or("", |m| m.as_str());
        return Ok(Operand {
            addressing: AddrMode::RegDir,
            kind: register_kind(name),
            value: name.to_string(),
            displacement: half.to_string(),
            size: 1,
        });
    }

    match token_type(text) {
        TokenType::OperandImmed => Ok(Operand {
            addressing: AddrMode::Memory,
            kind: OperandKind::MemoryValue,
            value: text.to_string(),
            displacement: String::new(),
            size: 3,
        }),
        TokenType::Symbol => Ok(Operand {
            addressing: AddrMode::Memory,
            kind: OperandKind::MemorySymbol,
            value: text.to_string(),
            displacement: String::new(),
            size: 3,
        }),
        _ => Err(invalid()),
    }
}

fn register_kind(name: &str) -> OperandKind {
    if name == "psw" {
        OperandKind::Psw
    } else {
        OperandKind::Register
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(mnemonic: &str, operands: &[&str]) -> Result<Instruction, AsmError> {
        let mut queue: VecDeque<String> =
            operands.iter().map(|s| s.to_string()).collect();
        let ins = Instruction::extract(mnemonic, &mut queue, 1)?;
        assert!(queue.is_empty());
        Ok(ins)
    }

    #[test]
    fn zero_operand() {
        let ins = extract("halt", &[]).unwrap();
        assert_eq!(ins.code, Opcode::Halt);
        assert_eq!(ins.operand_size, WORD);
        assert_eq!(ins.size, 1);
        assert!(ins.destination.is_none());
        assert!(ins.source.is_none());
    }

    #[test]
    fn suffix_selects_width() {
        assert_eq!(extract("mov", &["r0", "r1"]).unwrap().operand_size, WORD);
        assert_eq!(extract("movb", &["r0", "r1"]).unwrap().operand_size, BYTE);
        assert_eq!(extract("movw", &["r0", "r1"]).unwrap().operand_size, WORD);
        // `sub` must read as a whole mnemonic, not `su` + `b`.
        assert_eq!(extract("sub", &["r0", "r1"]).unwrap().code, Opcode::Sub);
    }

    #[test]
    fn immediate_sizes() {
        let ins = extract("push", &["$5"]).unwrap();
        let dst = ins.destination.unwrap();
        assert_eq!(dst.addressing, AddrMode::Immed);
        assert_eq!(dst.kind, OperandKind::ImmedValue);
        assert_eq!(dst.size, 3);
        assert_eq!(ins.size, 4);

        let ins = extract("pushb", &["$sym"]).unwrap();
        let dst = ins.destination.unwrap();
        assert_eq!(dst.kind, OperandKind::ImmedSymbol);
        assert_eq!(dst.size, 2);
        assert_eq!(ins.size, 3);
    }

    #[test]
    fn register_operands() {
        let ins = extract("movb", &["r3h", "psw"]).unwrap();
        let dst = ins.destination.unwrap();
        assert_eq!(dst.addressing, AddrMode::RegDir);
        assert_eq!(dst.value, "r3");
        assert_eq!(dst.displacement, "h");
        let src = ins.source.unwrap();
        assert_eq!(src.kind, OperandKind::Psw);
        assert_eq!(ins.size, 3);
    }

    #[test]
    fn indirect_displacement_widths() {
        let ins = extract("mov", &["[r2]", "[r3+4]"]).unwrap();
        assert_eq!(ins.destination.unwrap().addressing, AddrMode::RegInd);
        let src = ins.source.unwrap();
        assert_eq!(src.addressing, AddrMode::RegInd8);
        assert_eq!(src.size, 2);
        assert_eq!(ins.size, 4);

        let ins = extract("mov", &["r0", "[r3+0x400]"]).unwrap();
        let src = ins.source.unwrap();
        assert_eq!(src.addressing, AddrMode::RegInd16);
        assert_eq!(src.size, 3);

        let ins = extract("mov", &["r0", "[r3+var]"]).unwrap();
        let src = ins.source.unwrap();
        assert_eq!(src.addressing, AddrMode::RegInd16);
        assert_eq!(src.kind, OperandKind::DisplSymbol);
    }

    #[test]
    fn split_bracket_operand_is_rejoined() {
        let ins = extract("mov", &["[r1", "+", "8]", "r0"]).unwrap();
        let dst = ins.destination.unwrap();
        assert_eq!(dst.addressing, AddrMode::RegInd8);
        assert_eq!(dst.value, "r1");
        assert_eq!(dst.displacement, "8");
    }

    #[test]
    fn memory_and_pcrel() {
        let ins = extract("call", &["handler"]).unwrap();
        let dst = ins.destination.unwrap();
        assert_eq!(dst.addressing, AddrMode::Memory);
        assert_eq!(dst.kind, OperandKind::MemorySymbol);
        assert_eq!(ins.size, 4);

        let ins = extract("jmp", &["%loop"]).unwrap();
        let dst = ins.destination.unwrap();
        assert_eq!(dst.addressing, AddrMode::RegInd16);
        assert_eq!(dst.kind, OperandKind::PcRelative);
        assert_eq!(dst.value, "r7");
        assert_eq!(dst.displacement, "loop");
    }

    #[test]
    fn errors() {
        assert!(matches!(
            extract("frob", &[]),
            Err(AsmError::UnknownInstruction { .. })
        ));
        assert!(matches!(
            extract("mov", &["r0"]),
            Err(AsmError::InvalidOperandType { .. })
        ));
        assert!(matches!(
            extract("push", &["$r0!"]),
            Err(AsmError::InvalidOperandType { .. })
        ));
        assert!(matches!(
            extract("push", &["[r9]"]),
            Err(AsmError::InvalidOperandType { .. })
        ));
    }
}
