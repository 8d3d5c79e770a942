//! Relocatable object file model: symbol table, section table and
//! relocation table, with binary serialization and the human-readable
//! listing. The assembler builds an [`ObjectFile`]; the linker (and the
//! tests) read it back.

use std::fmt;
use std::io::{self, Read, Write};

use common::constants::{NUM_FLAGS, WIDTH};
use common::mem::{ReadU16, ToU16, WriteU16};

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

// Flag positions within a section flag string.
pub const W: usize = 0;
pub const A: usize = 1;
pub const X: usize = 2;

pub const FLAG_CHARS: &str = "WAXMSILGTE";

#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, Eq)]
pub enum ScopeType {
    Local = 0,
    Global,
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeType::Local => write!(f, "LOCAL"),
            ScopeType::Global => write!(f, "GLOBAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, Eq)]
pub enum SymbolType {
    Label = 0,
    Section,
    Constant,
    Alias,
    Extern,
}

impl fmt::Display for SymbolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SymbolType::Label => "LABEL",
            SymbolType::Section => "SECTION",
            SymbolType::Constant => "CONSTANT",
            SymbolType::Alias => "ALIAS",
            SymbolType::Extern => "EXTERN",
        };
        write!(f, "{name}")
    }
}

// Subtractive variants sit right after their additive counterparts, so
// toggling the low bit of the discriminant flips the sign of a record.
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, Eq)]
pub enum RelocationType {
    R386_8 = 0,
    R386Sub8,
    R386_16,
    R386Sub16,
    R386Pc16,
    R386SubPc16,
}

impl RelocationType {
    pub fn absolute(word: bool) -> RelocationType {
        if word {
            RelocationType::R386_16
        } else {
            RelocationType::R386_8
        }
    }

    pub fn is_subtractive(self) -> bool {
        self.to_u8().unwrap() & 1 == 1
    }

    // Additive <-> subtractive counterpart.
    pub fn negated(self) -> RelocationType {
        RelocationType::from_u8(self.to_u8().unwrap() ^ 1).unwrap()
    }
}

impl fmt::Display for RelocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelocationType::R386_8 => "R_386_8",
            RelocationType::R386Sub8 => "R_386_SUB_8",
            RelocationType::R386_16 => "R_386_16",
            RelocationType::R386Sub16 => "R_386_SUB_16",
            RelocationType::R386Pc16 => "R_386_PC16",
            RelocationType::R386SubPc16 => "R_386_SUB_PC16",
        };
        write!(f, "{name}")
    }
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub section: String,
    pub value: i16,
    pub scope: ScopeType,
    pub kind: SymbolType,
    pub defined: bool,
    pub index: u16,
}

impl Symbol {
    fn serialize(&self, writer: &mut impl Write) -> io::Result<()> {
        write_str(writer, &self.name)?;
        write_str(writer, &self.section)?;
        writer.write_u16(self.value as u16)?;
        writer.write_all(&[
            self.scope.to_u8().unwrap(),
            self.kind.to_u8().unwrap(),
            self.defined as u8,
        ])?;
        writer.write_u16(self.index)
    }

    fn deserialize(reader: &mut impl Read) -> io::Result<Symbol> {
        let name = read_str(reader)?;
        let section = read_str(reader)?;
        let value = reader.read_u16()? as i16;
        let mut tags = [0u8; 3];
        reader.read_exact(&mut tags)?;
        let scope = ScopeType::from_u8(tags[0]).ok_or_else(bad_tag)?;
        let kind = SymbolType::from_u8(tags[1]).ok_or_else(bad_tag)?;
        let defined = tags[2] != 0;
        let index = reader.read_u16()?;
        Ok(Symbol { name, section, value, scope, kind, defined, index })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub flags: String,
    pub size: u16,
    pub bytes: Vec<u8>,
    pub index: u16,
    pub symbol_index: u16,
}

impl Section {
    pub fn new(name: &str, flags: String, index: u16, symbol_index: u16) -> Section {
        assert_eq!(flags.len(), NUM_FLAGS);
        Section {
            name: name.to_string(),
            flags,
            size: 0,
            bytes: Vec::new(),
            index,
            symbol_index,
        }
    }

    pub fn flag(&self, position: usize) -> bool {
        self.flags.as_bytes()[position] == b'1'
    }

    // Copy `bytes` into the buffer at `offset`, growing it as needed.
    pub fn write(&mut self, offset: u16, bytes: &[u8]) {
        let offset = offset as usize;
        if self.bytes.len() < offset + bytes.len() {
            self.bytes.resize(offset + bytes.len(), 0);
        }
        self.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    // Fill `count` bytes starting at `offset` with `value`.
    pub fn write_value(&mut self, offset: u16, count: u16, value: u8) {
        let offset = offset as usize;
        let end = offset + count as usize;
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
        self.bytes[offset..end].fill(value);
    }

    fn serialize(&self, writer: &mut impl Write) -> io::Result<()> {
        write_str(writer, &self.name)?;
        writer.write_all(self.flags.as_bytes())?;
        writer.write_u16(self.size)?;
        writer.write_u16(self.index)?;
        writer.write_u16(self.symbol_index)?;
        writer.write_u16(self.bytes.len().to_u16())?;
        writer.write_all(&self.bytes)
    }

    fn deserialize(reader: &mut impl Read) -> io::Result<Section> {
        let name = read_str(reader)?;
        let mut flags = [0u8; NUM_FLAGS];
        reader.read_exact(&mut flags)?;
        let flags = String::from_utf8(flags.to_vec()).map_err(|_| bad_tag())?;
        let size = reader.read_u16()?;
        let index = reader.read_u16()?;
        let symbol_index = reader.read_u16()?;
        let byte_count = reader.read_u16()?;
        let mut bytes = vec![0u8; byte_count as usize];
        reader.read_exact(&mut bytes)?;
        Ok(Section { name, flags, size, bytes, index, symbol_index })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub symbol: String,
    pub section: String,
    pub offset: u16,
    pub kind: RelocationType,
}

impl Relocation {
    pub fn new(symbol: &str, section: &str, offset: u16, kind: RelocationType) -> Relocation {
        Relocation {
            symbol: symbol.to_string(),
            section: section.to_string(),
            offset,
            kind,
        }
    }

    fn serialize(&self, writer: &mut impl Write) -> io::Result<()> {
        write_str(writer, &self.symbol)?;
        write_str(writer, &self.section)?;
        writer.write_u16(self.offset)?;
        writer.write_all(&[self.kind.to_u8().unwrap()])
    }

    fn deserialize(reader: &mut impl Read) -> io::Result<Relocation> {
        let symbol = read_str(reader)?;
        let section = read_str(reader)?;
        let offset = reader.read_u16()?;
        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag)?;
        let kind = RelocationType::from_u8(tag[0]).ok_or_else(bad_tag)?;
        Ok(Relocation { symbol, section, offset, kind })
    }
}

////////////////////////////////////////////////////////////////////////////////

// Three length-prefixed tables: symbols, sections, relocations. Table
// lengths are u64 little-endian, strings are u16-length-prefixed UTF-8.
// Symbols and sections are stored in ascending `index` order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ObjectFile {
    pub symbols: Vec<Symbol>,
    pub sections: Vec<Section>,
    pub relocations: Vec<Relocation>,
}

impl ObjectFile {
    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&(self.symbols.len() as u64).to_le_bytes())?;
        for symbol in &self.symbols {
            symbol.serialize(writer)?;
        }

        writer.write_all(&(self.sections.len() as u64).to_le_bytes())?;
        for section in &self.sections {
            section.serialize(writer)?;
        }

        writer.write_all(&(self.relocations.len() as u64).to_le_bytes())?;
        for relocation in &self.relocations {
            relocation.serialize(writer)?;
        }

        writer.flush()
    }

    pub fn read_from(reader: &mut impl Read) -> io::Result<ObjectFile> {
        let mut object = ObjectFile::default();

        for _ in 0..read_u64(reader)? {
            object.symbols.push(Symbol::deserialize(reader)?);
        }
        for _ in 0..read_u64(reader)? {
            object.sections.push(Section::deserialize(reader)?);
        }
        for _ in 0..read_u64(reader)? {
            object.relocations.push(Relocation::deserialize(reader)?);
        }

        Ok(object)
    }

    pub fn write_listing(&self, writer: &mut impl Write) -> io::Result<()> {
        for section in &self.sections {
            if section.bytes.is_empty() {
                continue;
            }

            writeln!(writer, "/*** Section \"{}\" ***/\n", section.name)?;
            write_dump(writer, &section.bytes)?;
            writeln!(writer)?;
        }

        writeln!(writer, "/*** Symbol Table ***/\n")?;
        writeln!(
            writer,
            "{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}",
            "Entry", "Name", "Section", "Value", "Scope", "Type",
        )?;
        for symbol in &self.symbols {
            writeln!(
                writer,
                "{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}",
                symbol.index,
                symbol.name,
                symbol.section,
                format!("{:04x}", symbol.value as u16),
                symbol.scope.to_string(),
                symbol.kind.to_string(),
            )?;
        }

        writeln!(writer, "\n/*** Section Table ***/\n")?;
        writeln!(
            writer,
            "{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}",
            "Entry", "Name", "Size", FLAG_CHARS, "SymbolTableEntry",
        )?;
        for section in &self.sections {
            writeln!(
                writer,
                "{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}",
                section.index,
                section.name,
                format!("{:04x}", section.size),
                section.flags,
                section.symbol_index,
            )?;
        }

        if !self.relocations.is_empty() {
            writeln!(writer, "\n/*** Relocation Table ***/\n")?;
            writeln!(
                writer,
                "{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}",
                "Symbol", "Section", "Offset", "Type",
            )?;
            for relocation in &self.relocations {
                writeln!(
                    writer,
                    "{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}{:<WIDTH$}",
                    relocation.symbol,
                    relocation.section,
                    format!("{:04x}", relocation.offset),
                    relocation.kind.to_string(),
                )?;
            }
        }

        writer.flush()
    }
}

fn write_str(writer: &mut impl Write, s: &str) -> io::Result<()> {
    writer.write_u16(s.len().to_u16())?;
    writer.write_all(s.as_bytes())
}

fn read_str(reader: &mut impl Read) -> io::Result<String> {
    let len = reader.read_u16()?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| bad_tag())
}

fn read_u64(reader: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn bad_tag() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "malformed object file")
}

// 16 bytes per row, offset prefixed.
fn write_dump(writer: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    for (row, chunk) in bytes.chunks(16).enumerate() {
        write!(writer, "{:04x}  ", row * 16)?;
        for byte in chunk {
            write!(writer, " {byte:02x}")?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ObjectFile {
        ObjectFile {
            symbols: vec![
                Symbol {
                    name: ".text".into(),
                    section: ".text".into(),
                    value: 0,
                    scope: ScopeType::Local,
                    kind: SymbolType::Section,
                    defined: true,
                    index: 0,
                },
                Symbol {
                    name: "start".into(),
                    section: ".text".into(),
                    value: 4,
                    scope: ScopeType::Global,
                    kind: SymbolType::Label,
                    defined: true,
                    index: 1,
                },
            ],
            sections: vec![Section {
                name: ".text".into(),
                flags: "0110000000".into(),
                size: 4,
                bytes: vec![0x20, 0x00, 0x04, 0x00],
                index: 0,
                symbol_index: 0,
            }],
            relocations: vec![Relocation::new(
                ".text",
                ".text",
                2,
                RelocationType::R386_16,
            )],
        }
    }

    #[test]
    fn round_trip() {
        let object = sample();
        let mut buf = Vec::new();
        object.write_to(&mut buf).unwrap();
        let read = ObjectFile::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(read, object);
    }

    #[test]
    fn negated_flips_between_counterparts() {
        use RelocationType::*;
        assert_eq!(R386_8.negated(), R386Sub8);
        assert_eq!(R386Sub8.negated(), R386_8);
        assert_eq!(R386_16.negated(), R386Sub16);
        assert_eq!(R386Pc16.negated(), R386SubPc16);
        assert!(R386Sub16.is_subtractive());
        assert!(!R386Pc16.is_subtractive());
    }

    #[test]
    fn section_write_grows_buffer() {
        let mut section = Section::new(".data", "0100000000".into(), 0, 0);
        section.write(2, &[1, 2]);
        assert_eq!(section.bytes, vec![0, 0, 1, 2]);
        section.write_value(4, 3, 0xff);
        assert_eq!(section.bytes, vec![0, 0, 1, 2, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn listing_smoke() {
        let mut out = Vec::new();
        sample().write_listing(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("/*** Section \".text\" ***/"));
        assert!(text.contains("/*** Symbol Table ***/"));
        assert!(text.contains("R_386_16"));
    }
}
