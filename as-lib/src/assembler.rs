//! The assembler driver: lex the source into token lines, lay sections
//! out in a first pass, resolve chained symbol equivalences, then emit
//! bytes and relocation records in a second pass. Any error aborts the
//! run; the object file and listing are only written after both passes
//! succeed.

use std::collections::{HashSet, VecDeque};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use common::asm::{register_code, AddrMode, ADDR_OFFSET, CODE_OFFSET, REGS_OFFSET, SIZE_OFFSET};
use common::constants::{BYTE, NUM_FLAGS, UNDEFINED, WORD};
use obj::{ObjectFile, Relocation, RelocationType, ScopeType, SymbolType, A, W, X};

use log::{debug, trace};
use num_traits::ToPrimitive;

use crate::helpers::parse_int;
use crate::instruction::{Instruction, Operand, OperandKind};
use crate::lexer::{self, token_type, TokenLine, TokenType};
use crate::misc::AsmError;
use crate::tables::{SectionTable, Sign, SymbolTable, UnresolvedSymbol, Ust};

pub fn assemble(source: &str) -> Result<ObjectFile, AsmError> {
    let mut assembler = Assembler::new();

    assembler.assembly = lexer::read_assembly(source);
    debug!("read {} token lines", assembler.assembly.len());

    assembler.first_pass()?;
    assembler.resolve_symbols()?;
    assembler.second_pass()?;

    Ok(assembler.into_object())
}

// Assemble `input` (a `.s` file) into `output` (a `.o` file) plus a
// sibling `.txt` listing.
pub fn assemble_file(input: &Path, output: &Path) -> Result<(), AsmError> {
    if input.extension().is_none_or(|ext| ext != "s") {
        return Err(AsmError::InvalidInputFile);
    }
    if output.extension().is_none_or(|ext| ext != "o") {
        return Err(AsmError::InvalidOutputFile);
    }

    let source = fs::read_to_string(input).map_err(|source| AsmError::CannotOpenFile {
        path: input.display().to_string(),
        source,
    })?;

    let object = assemble(&source)?;

    let out = File::create(output).map_err(|source| AsmError::CannotOpenFile {
        path: output.display().to_string(),
        source,
    })?;
    object.write_to(&mut BufWriter::new(out))?;

    let listing_path = output.with_extension("txt");
    let listing = File::create(&listing_path).map_err(|source| AsmError::CannotOpenFile {
        path: listing_path.display().to_string(),
        source,
    })?;
    object.write_listing(&mut BufWriter::new(listing))?;

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////

struct Assembler {
    line: u32,
    location_counter: u16,
    assembly: Vec<TokenLine>,
    instructions: VecDeque<Instruction>,
    symbols: SymbolTable,
    sections: SectionTable,
    ust: Ust,
    relocations: Vec<Relocation>,
}

// A symbolic term of a `.equ` expression, reduced as far as the first
// pass can: a signed value contribution plus the dependency edges that
// remain for the resolver.
struct EquTerm {
    value: i16,
    defined: bool,
    edges: Vec<(String, Sign)>,
}

impl Assembler {
    fn new() -> Assembler {
        Assembler {
            line: 0,
            location_counter: 0,
            assembly: Vec::new(),
            instructions: VecDeque::new(),
            symbols: SymbolTable::new(),
            sections: SectionTable::new(),
            ust: Ust::new(),
            relocations: Vec::new(),
        }
    }

    // Insert or update a symbol. A name may only be redeclared while
    // the existing entry is undefined and not a pending equivalence.
    fn add_symbol(
        &mut self,
        name: &str,
        section: &str,
        value: i16,
        scope: ScopeType,
        kind: SymbolType,
        defined: bool,
    ) -> Result<(), AsmError> {
        let taken = self.symbols.get(name).is_some_and(|s| s.defined) || self.ust.contains(name);
        if taken {
            return Err(AsmError::SymbolAlreadyDefined {
                line: self.line,
                name: name.to_string(),
            });
        }
        self.symbols.upsert(name, section, value, scope, kind, defined);
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////
    // First pass

    fn first_pass(&mut self) -> Result<(), AsmError> {
        let assembly = std::mem::take(&mut self.assembly);

        self.location_counter = 0;
        let mut label_defined = false;
        let mut current_section: Option<String> = None;

        for token_line in &assembly {
            self.line = token_line.number;
            let mut queue: VecDeque<String> = token_line.tokens.iter().cloned().collect();

            let mut current = queue.pop_front().unwrap();
            let mut kind = token_type(&current);

            if kind == TokenType::Label {
                if label_defined {
                    return Err(AsmError::DoubleLabel { line: self.line });
                }
                label_defined = true;

                let label = lexer::label_name(&current).unwrap().to_string();
                let Some(section) = current_section.clone() else {
                    return Err(AsmError::LabelOutsideSection { line: self.line, label });
                };
                let value = self.location_counter as i16;
                self.add_symbol(&label, &section, value, ScopeType::Local, SymbolType::Label, true)?;

                let Some(next) = queue.pop_front() else { continue };
                current = next;
                kind = token_type(&current);
            }
            label_defined = false;

            match kind {
                TokenType::Label => return Err(AsmError::DoubleLabel { line: self.line }),

                TokenType::GlobalExtern => {
                    self.scope_directive(&current, &mut queue, false)?;
                }

                TokenType::Section => {
                    if let Some(name) = &current_section {
                        let size = self.location_counter;
                        self.sections.get_mut(name).unwrap().size = size;
                    }
                    self.location_counter = 0;
                    current_section = Some(self.enter_section(&current, &mut queue)?);
                }

                TokenType::Directive => {
                    if current == ".equ" {
                        let owner = current_section.clone().unwrap_or_else(|| UNDEFINED.to_string());
                        self.equ_directive(&mut queue, &owner)?;
                    } else {
                        let Some(section_name) = current_section.clone() else {
                            return Err(AsmError::DirectiveOutsideSection { line: self.line });
                        };
                        self.size_directive(&current, &mut queue, &section_name)?;
                    }
                }

                TokenType::Instruction => {
                    let executable = current_section
                        .as_deref()
                        .is_some_and(|name| self.sections.get(name).unwrap().flag(X));
                    if !executable {
                        return Err(AsmError::InstructionOutsideExecutableSection { line: self.line });
                    }

                    let instruction = Instruction::extract(&current, &mut queue, self.line)?;
                    self.location_counter = self.location_counter.wrapping_add(instruction.size);
                    self.instructions.push_back(instruction);
                }

                _ => return Err(AsmError::InvalidToken { line: self.line }),
            }

            if !queue.is_empty() {
                return Err(AsmError::TrailingTokens { line: self.line });
            }
        }

        if let Some(name) = &current_section {
            let size = self.location_counter;
            self.sections.get_mut(name).unwrap().size = size;
        }

        self.assembly = assembly;
        Ok(())
    }

    // `.global`/`.extern`. The first pass defers judgement on `.global`
    // of a not-yet-defined name; the second pass accepts it only for
    // imports (extern entries).
    fn scope_directive(
        &mut self,
        directive: &str,
        queue: &mut VecDeque<String>,
        second_pass: bool,
    ) -> Result<(), AsmError> {
        if queue.is_empty() {
            return Err(AsmError::DirectiveMissingArgument {
                line: self.line,
                directive: directive.to_string(),
            });
        }

        while let Some(name) = queue.pop_front() {
            if token_type(&name) != TokenType::Symbol {
                return Err(AsmError::InvalidOperandType { line: self.line });
            }

            let entry = self.symbols.get(&name);
            let defined = entry.is_some_and(|s| s.defined);
            let extern_entry = entry.is_some_and(|s| s.kind == SymbolType::Extern);

            if defined {
                if directive == ".extern" {
                    return Err(AsmError::ExternButDefined { line: self.line, name });
                }
                self.symbols.get_mut(&name).unwrap().scope = ScopeType::Global;
            } else {
                if second_pass && directive == ".global" && !extern_entry {
                    return Err(AsmError::GlobalButUndefined { line: self.line, name });
                }
                self.add_symbol(&name, UNDEFINED, 0, ScopeType::Global, SymbolType::Extern, false)?;
            }
        }

        Ok(())
    }

    // `.text`/`.data`/`.bss`/`.rodata`/`.section NAME [flags]`: create
    // the section record and its table symbol, with defaulted flags
    // when none are spelled out.
    fn enter_section(
        &mut self,
        token: &str,
        queue: &mut VecDeque<String>,
    ) -> Result<String, AsmError> {
        let mut flags = "0".repeat(NUM_FLAGS);
        let mut flags_set = false;
        let mut name = token.to_string();

        if name == ".section" {
            let Some(tok) = queue.pop_front() else {
                return Err(AsmError::DirectiveMissingArgument {
                    line: self.line,
                    directive: ".section".to_string(),
                });
            };
            match token_type(&tok) {
                TokenType::Symbol | TokenType::Section | TokenType::SectionName => name = tok,
                _ => return Err(AsmError::IllegalSectionName { line: self.line }),
            }

            if let Some(tok) = queue.pop_front() {
                if !lexer::is_section_flags(&tok) {
                    return Err(AsmError::IllegalSectionFlags { line: self.line });
                }
                lexer::set_flags(&mut flags, &tok);
                flags_set = true;
            }
        }

        if !flags_set {
            let defaults: &[usize] = match name.as_str() {
                ".text" => &[A, X],
                ".data" => &[A, W],
                ".bss" => &[W],
                ".rodata" => &[A],
                _ => &[A, W, X],
            };
            for &position in defaults {
                flags.replace_range(position..position + 1, "1");
            }
        }

        self.add_symbol(&name, &name, 0, ScopeType::Local, SymbolType::Section, true)?;
        let symbol_index = self.symbols.get(&name).unwrap().index;
        if !self.sections.insert(&name, flags, symbol_index) {
            return Err(AsmError::SectionAlreadyDefined { line: self.line, name });
        }

        Ok(name)
    }

    // `.equ NAME, EXPR` in the first pass.
    fn equ_directive(&mut self, queue: &mut VecDeque<String>, owner: &str) -> Result<(), AsmError> {
        let missing = || AsmError::DirectiveMissingArgument {
            line: self.line,
            directive: ".equ".to_string(),
        };

        let name = queue.pop_front().ok_or_else(missing)?;
        if token_type(&name) != TokenType::Symbol {
            return Err(AsmError::InvalidOperandType { line: self.line });
        }
        if queue.is_empty() {
            return Err(missing());
        }

        let mut expression = String::new();
        while let Some(tok) = queue.pop_front() {
            expression.push_str(&tok);
        }

        self.evaluate_equ(&name, &expression, owner)
    }

    // `.align`/`.skip`/`.byte`/`.word` sizing in the first pass. Data
    // directives only count their terms here; evaluation happens in the
    // second pass.
    fn size_directive(
        &mut self,
        directive: &str,
        queue: &mut VecDeque<String>,
        section_name: &str,
    ) -> Result<(), AsmError> {
        match directive {
            ".align" => {
                let mut exponent = 1u16;
                if let Some(tok) = queue.pop_front() {
                    if token_type(&tok) != TokenType::OperandImmed {
                        return Err(AsmError::InvalidOperandType { line: self.line });
                    }
                    exponent = parse_int(&tok)
                        .ok_or(AsmError::InvalidOperandType { line: self.line })?
                        as u16;
                }
                self.location_counter = self.align_to(exponent)?.1;
            }
            ".skip" => {
                let mut count = 1u16;
                if let Some(tok) = queue.pop_front() {
                    if token_type(&tok) != TokenType::OperandImmed {
                        return Err(AsmError::InvalidOperandType { line: self.line });
                    }
                    count = parse_int(&tok)
                        .ok_or(AsmError::InvalidOperandType { line: self.line })?
                        as u16;
                }
                if let Some(tok) = queue.pop_front() {
                    if token_type(&tok) != TokenType::OperandImmed {
                        return Err(AsmError::InvalidOperandType { line: self.line });
                    }
                }
                self.location_counter = self.location_counter.wrapping_add(count);
            }
            _ => {
                // .byte / .word
                if !self.sections.get(section_name).unwrap().flag(A) {
                    return Err(AsmError::MemoryInitInBss { line: self.line });
                }
                if queue.is_empty() {
                    return Err(AsmError::DirectiveMissingArgument {
                        line: self.line,
                        directive: directive.to_string(),
                    });
                }

                // Adjacent terms start a new datum; a term right after
                // an operator extends the previous expression.
                let mut count = 0u16;
                let mut term_precedes = true;
                while let Some(tok) = queue.pop_front() {
                    if lexer::is_term(&tok) {
                        if term_precedes {
                            count += 1;
                        } else {
                            term_precedes = true;
                        }
                    } else {
                        term_precedes = false;
                    }
                }

                let width = if directive == ".byte" { BYTE } else { WORD };
                self.location_counter = self.location_counter.wrapping_add(count.wrapping_mul(width));
            }
        }
        Ok(())
    }

    // Next location counter value at a 2^exponent boundary, along with
    // the gap start. Already aligned means no change.
    fn align_to(&self, exponent: u16) -> Result<(u16, u16), AsmError> {
        if exponent > 15 {
            return Err(AsmError::InvalidOperandType { line: self.line });
        }
        let alignment = 1u16 << exponent;
        let start = self.location_counter;
        if start % alignment == 0 {
            Ok((start, start))
        } else {
            Ok((start, (start / alignment).wrapping_add(1).wrapping_mul(alignment)))
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Resolution

    // Fold `.equ` chains: every defined dependency adds or subtracts
    // its value into the owner and is rewritten to its owning section
    // name, so later relocations reference the section symbol.
    fn resolve_symbols(&mut self) -> Result<(), AsmError> {
        if let Some(name) = self.find_cycle() {
            let line = self.ust.get(&name).unwrap().line;
            return Err(AsmError::CyclicEquivalence { line });
        }

        let names: Vec<String> = self.ust.names().map(str::to_string).collect();
        for name in names {
            let mut all_defined = true;

            let dep_count = self.ust.get(&name).unwrap().dependencies.len();
            for i in 0..dep_count {
                let (dep_name, sign) = self.ust.get(&name).unwrap().dependencies[i].clone();
                let dep = self
                    .symbols
                    .get(&dep_name)
                    .expect("equ dependency has a symbol table entry");

                if !dep.defined {
                    all_defined = false;
                    continue;
                }

                let (value, section) = (dep.value, dep.section.clone());
                trace!("folding {dep_name} ({value}) into {name}");

                let owner = self.symbols.get_mut(&name).unwrap();
                owner.value = match sign {
                    Sign::Plus => owner.value.wrapping_add(value),
                    Sign::Minus => owner.value.wrapping_sub(value),
                };
                self.ust.get_mut(&name).unwrap().dependencies[i].0 = section;
            }

            self.symbols.get_mut(&name).unwrap().defined = all_defined;
        }

        Ok(())
    }

    fn find_cycle(&self) -> Option<String> {
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        for name in self.ust.names() {
            if self.cycle(name, &mut visited, &mut stack) {
                return Some(name.to_string());
            }
        }
        None
    }

    // DFS with a visited set and a recursion stack; names absent from
    // the unresolved table are leaves.
    fn cycle(
        &self,
        symbol: &str,
        visited: &mut HashSet<String>,
        stack: &mut HashSet<String>,
    ) -> bool {
        let Some(entry) = self.ust.get(symbol) else {
            return false;
        };

        if !visited.contains(symbol) {
            visited.insert(symbol.to_string());
            stack.insert(symbol.to_string());

            for (dep, _) in &entry.dependencies {
                if !visited.contains(dep.as_str()) {
                    if self.cycle(dep, visited, stack) {
                        return true;
                    }
                } else if stack.contains(dep.as_str()) {
                    return true;
                }
            }
        }

        stack.remove(symbol);
        false
    }

    ////////////////////////////////////////////////////////////////////////////
    // Second pass

    fn second_pass(&mut self) -> Result<(), AsmError> {
        let assembly = std::mem::take(&mut self.assembly);

        self.location_counter = 0;
        let mut current_section: Option<String> = None;

        for token_line in &assembly {
            self.line = token_line.number;
            let mut queue: VecDeque<String> = token_line.tokens.iter().cloned().collect();

            let mut current = queue.pop_front().unwrap();
            let mut kind = token_type(&current);

            if kind == TokenType::Label {
                let Some(next) = queue.pop_front() else { continue };
                current = next;
                kind = token_type(&current);
            }

            match kind {
                TokenType::GlobalExtern => {
                    self.scope_directive(&current, &mut queue, true)?;
                }

                TokenType::Section => {
                    self.location_counter = 0;
                    let name = if current == ".section" {
                        let name = queue.pop_front().expect("section name checked in first pass");
                        let _ = queue.pop_front(); // flags, if any
                        name
                    } else {
                        current.clone()
                    };
                    current_section = Some(name);
                }

                TokenType::Directive => {
                    if current == ".equ" {
                        continue;
                    }
                    let Some(section_name) = current_section.clone() else {
                        return Err(AsmError::DirectiveOutsideSection { line: self.line });
                    };
                    self.emit_directive(&current, &mut queue, &section_name)?;
                }

                TokenType::Instruction => {
                    let instruction = self.instructions.pop_front().expect("queued in first pass");
                    let section_name = current_section.clone().expect("checked in first pass");
                    self.generate_instruction_code(&instruction, &section_name)?;
                    self.location_counter = self.location_counter.wrapping_add(instruction.size);
                }

                _ => return Err(AsmError::InvalidToken { line: self.line }),
            }
        }

        self.assembly = assembly;
        Ok(())
    }

    // `.align`/`.skip` fill their gap (zero or the fill value) when the
    // section is allocatable; `.byte`/`.word` evaluate each expression
    // and write the data.
    fn emit_directive(
        &mut self,
        directive: &str,
        queue: &mut VecDeque<String>,
        section_name: &str,
    ) -> Result<(), AsmError> {
        match directive {
            ".align" => {
                let mut exponent = 1u16;
                if let Some(tok) = queue.pop_front() {
                    exponent = parse_int(&tok).unwrap_or(1) as u16;
                }
                let (start, end) = self.align_to(exponent)?;
                self.location_counter = end;
                if end != start && self.sections.get(section_name).unwrap().flag(A) {
                    self.sections
                        .get_mut(section_name)
                        .unwrap()
                        .write_value(start, end.wrapping_sub(start), 0);
                }
            }
            ".skip" => {
                let mut count = 1u16;
                if let Some(tok) = queue.pop_front() {
                    count = parse_int(&tok).unwrap_or(1) as u16;
                }
                let mut fill = 0u8;
                if let Some(tok) = queue.pop_front() {
                    fill = parse_int(&tok).unwrap_or(0) as u8;
                }

                let start = self.location_counter;
                self.location_counter = self.location_counter.wrapping_add(count);
                if self.sections.get(section_name).unwrap().flag(A) {
                    self.sections
                        .get_mut(section_name)
                        .unwrap()
                        .write_value(start, count, fill);
                }
            }
            _ => {
                // .byte / .word: re-group the tokens into expressions by
                // the same term-precedes rule the first pass counted by.
                while !queue.is_empty() {
                    let mut expression = String::new();
                    let mut term_precedes = false;

                    loop {
                        let Some(front) = queue.front() else { break };
                        let term = lexer::is_term(front);
                        if term && term_precedes {
                            break;
                        }
                        term_precedes = term;
                        expression.push_str(&queue.pop_front().unwrap());
                    }

                    self.evaluate(directive, &expression, section_name)?;
                }
            }
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////
    // Expression evaluation

    // Evaluate one `.byte`/`.word` initializer expression and write the
    // datum at the location counter.
    fn evaluate(
        &mut self,
        directive: &str,
        expression: &str,
        section_name: &str,
    ) -> Result<(), AsmError> {
        let word = directive == ".word";
        let value = self.expression_value(word, expression, section_name)?;

        let bits = value as u16;
        let lc = self.location_counter;

        if word {
            self.sections
                .get_mut(section_name)
                .unwrap()
                .write(lc, &bits.to_le_bytes());
            self.location_counter = lc.wrapping_add(WORD);
        } else {
            if bits >> 8 != 0 {
                return Err(AsmError::ByteOverflow { line: self.line });
            }
            self.sections
                .get_mut(section_name)
                .unwrap()
                .write(lc, &[bits as u8]);
            self.location_counter = lc.wrapping_add(BYTE);
        }
        Ok(())
    }

    fn expression_value(
        &mut self,
        word: bool,
        expression: &str,
        section_name: &str,
    ) -> Result<i16, AsmError> {
        let line = self.line;
        let offset = self.location_counter;
        let invalid = || AsmError::InvalidExpression { line };

        match token_type(expression) {
            TokenType::OperandImmed => parse_int(expression).ok_or_else(invalid),

            TokenType::Symbol => self.symbol_term(expression, word, false, section_name, offset),

            TokenType::Expression => {
                let (first, op, second) = lexer::expression_parts(expression).ok_or_else(invalid)?;
                let negative = op == '-';

                match (token_type(first), token_type(second)) {
                    (TokenType::OperandImmed, TokenType::OperandImmed) => {
                        let lhs = parse_int(first).ok_or_else(invalid)?;
                        let rhs = parse_int(second).ok_or_else(invalid)?;
                        Ok(if negative {
                            lhs.wrapping_sub(rhs)
                        } else {
                            lhs.wrapping_add(rhs)
                        })
                    }
                    (TokenType::OperandImmed, TokenType::Symbol) => {
                        let lhs = parse_int(first).ok_or_else(invalid)?;
                        let term = self.symbol_term(second, word, negative, section_name, offset)?;
                        Ok(lhs.wrapping_add(term))
                    }
                    (TokenType::Symbol, TokenType::OperandImmed) => {
                        let rhs = parse_int(second).ok_or_else(invalid)?;
                        let rhs = if negative { rhs.wrapping_neg() } else { rhs };
                        let term = self.symbol_term(first, word, false, section_name, offset)?;
                        Ok(rhs.wrapping_add(term))
                    }
                    (TokenType::Symbol, TokenType::Symbol) => {
                        if let Some(folded) = self.fold_same_section(first, second, negative) {
                            return Ok(folded);
                        }
                        let lhs = self.symbol_term(first, word, false, section_name, offset)?;
                        let rhs = self.symbol_term(second, word, negative, section_name, offset)?;
                        Ok(lhs.wrapping_add(rhs))
                    }
                    _ => Err(AsmError::InvalidOperandType { line }),
                }
            }

            _ => Err(invalid()),
        }
    }

    // Two settled symbols of one section under `-` collapse to a plain
    // number: the section bases cancel at link time, so no relocation.
    fn fold_same_section(&self, first: &str, second: &str, negative: bool) -> Option<i16> {
        if !negative || self.ust.contains(first) || self.ust.contains(second) {
            return None;
        }
        let lhs = self.symbols.get(first)?;
        let rhs = self.symbols.get(second)?;
        if lhs.section != rhs.section {
            return None;
        }
        Some(lhs.value.wrapping_sub(rhs.value))
    }

    // One symbolic term of a datum or operand payload: returns its
    // signed value contribution and pushes the relocations it needs.
    //
    //  - pending equivalence: the folded value, one relocation per
    //    dependency edge, subtractive when the signs disagree;
    //  - local constant: pure value, no relocation;
    //  - local label: value plus a relocation against its section;
    //  - global or unseen: zero, a relocation against the name itself
    //    (unseen names become extern entries).
    fn symbol_term(
        &mut self,
        name: &str,
        word: bool,
        negative: bool,
        section_name: &str,
        offset: u16,
    ) -> Result<i16, AsmError> {
        let base = RelocationType::absolute(word);

        if let Some(entry) = self.ust.get(name) {
            let deps = entry.dependencies.clone();
            let value = self.symbols.get(name).expect("equ symbol registered").value;

            for (dep, sign) in deps {
                let kind = if negative != sign.is_minus() { base.negated() } else { base };
                self.relocations.push(Relocation::new(&dep, section_name, offset, kind));
            }

            return Ok(if negative { value.wrapping_neg() } else { value });
        }

        let mut target = name.to_string();
        let mut contribution = 0i16;

        match self.symbols.get(name) {
            Some(symbol) if symbol.scope == ScopeType::Local => {
                contribution = if negative {
                    symbol.value.wrapping_neg()
                } else {
                    symbol.value
                };
                if symbol.kind == SymbolType::Constant {
                    return Ok(contribution);
                }
                target = symbol.section.clone();
            }
            Some(_) => {}
            None => {
                self.add_symbol(name, UNDEFINED, 0, ScopeType::Global, SymbolType::Extern, false)?;
            }
        }

        let kind = if negative { base.negated() } else { base };
        self.relocations.push(Relocation::new(&target, section_name, offset, kind));
        Ok(contribution)
    }

    ////////////////////////////////////////////////////////////////////////////
    // .equ evaluation

    fn evaluate_equ(&mut self, name: &str, expression: &str, owner: &str) -> Result<(), AsmError> {
        let line = self.line;
        let invalid = || AsmError::InvalidExpression { line };

        match token_type(expression) {
            TokenType::OperandImmed => {
                let value = parse_int(expression).ok_or_else(invalid)?;
                self.add_constant(name, owner, value)
            }

            TokenType::Symbol => {
                let term = self.equ_term(expression, Sign::Plus)?;
                self.finish_equ(name, owner, term)
            }

            TokenType::Expression => {
                let (first, op, second) = lexer::expression_parts(expression).ok_or_else(invalid)?;
                let sign = if op == '-' { Sign::Minus } else { Sign::Plus };

                match (token_type(first), token_type(second)) {
                    (TokenType::OperandImmed, TokenType::OperandImmed) => {
                        let lhs = parse_int(first).ok_or_else(invalid)?;
                        let rhs = parse_int(second).ok_or_else(invalid)?;
                        let value = match sign {
                            Sign::Plus => lhs.wrapping_add(rhs),
                            Sign::Minus => lhs.wrapping_sub(rhs),
                        };
                        self.add_constant(name, owner, value)
                    }
                    (TokenType::OperandImmed, TokenType::Symbol) => {
                        let lhs = parse_int(first).ok_or_else(invalid)?;
                        let mut term = self.equ_term(second, sign)?;
                        term.value = term.value.wrapping_add(lhs);
                        self.finish_equ(name, owner, term)
                    }
                    (TokenType::Symbol, TokenType::OperandImmed) => {
                        let rhs = parse_int(second).ok_or_else(invalid)?;
                        let rhs = if sign.is_minus() { rhs.wrapping_neg() } else { rhs };
                        let mut term = self.equ_term(first, Sign::Plus)?;
                        term.value = term.value.wrapping_add(rhs);
                        self.finish_equ(name, owner, term)
                    }
                    (TokenType::Symbol, TokenType::Symbol) => {
                        if sign.is_minus() {
                            if let Some(value) = self.fold_same_section(first, second, true) {
                                return self.add_constant(name, owner, value);
                            }
                        }
                        let lhs = self.equ_term(first, Sign::Plus)?;
                        let rhs = self.equ_term(second, sign)?;
                        let term = EquTerm {
                            value: lhs.value.wrapping_add(rhs.value),
                            defined: lhs.defined && rhs.defined,
                            edges: lhs.edges.into_iter().chain(rhs.edges).collect(),
                        };
                        self.finish_equ(name, owner, term)
                    }
                    _ => Err(AsmError::InvalidOperandType { line }),
                }
            }

            _ => Err(invalid()),
        }
    }

    // One symbolic term of a `.equ` expression. A term that is itself a
    // pending equivalence passes its dependency list on, so the
    // resolver only ever needs one hop per entry.
    fn equ_term(&mut self, term: &str, sign: Sign) -> Result<EquTerm, AsmError> {
        if let Some(entry) = self.ust.get(term) {
            let edges = entry.dependencies.clone();
            let symbol = self.symbols.get(term).expect("equ symbol registered");
            return Ok(EquTerm {
                value: apply_sign(symbol.value, sign),
                defined: symbol.defined,
                edges,
            });
        }

        match self.symbols.get(term) {
            Some(symbol) if symbol.scope == ScopeType::Local => {
                let value = apply_sign(symbol.value, sign);
                if symbol.kind == SymbolType::Constant {
                    Ok(EquTerm { value, defined: true, edges: Vec::new() })
                } else {
                    Ok(EquTerm {
                        value,
                        defined: symbol.defined,
                        edges: vec![(symbol.section.clone(), sign)],
                    })
                }
            }
            Some(_) => Ok(EquTerm {
                value: 0,
                defined: false,
                edges: vec![(term.to_string(), sign)],
            }),
            None => {
                self.add_symbol(term, UNDEFINED, 0, ScopeType::Global, SymbolType::Extern, false)?;
                Ok(EquTerm {
                    value: 0,
                    defined: false,
                    edges: vec![(term.to_string(), sign)],
                })
            }
        }
    }

    fn add_constant(&mut self, name: &str, owner: &str, value: i16) -> Result<(), AsmError> {
        self.add_symbol(name, owner, value, ScopeType::Local, SymbolType::Constant, true)
    }

    // Fully folded terms make a constant; anything with a surviving
    // edge becomes an alias with an unresolved-table entry.
    fn finish_equ(&mut self, name: &str, owner: &str, term: EquTerm) -> Result<(), AsmError> {
        if term.edges.is_empty() {
            return self.add_constant(name, owner, term.value);
        }

        self.add_symbol(name, owner, term.value, ScopeType::Local, SymbolType::Alias, term.defined)?;
        self.ust.insert(UnresolvedSymbol {
            name: name.to_string(),
            section: owner.to_string(),
            line: self.line,
            dependencies: term.edges,
        });
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////
    // Code generation

    fn generate_instruction_code(
        &mut self,
        instruction: &Instruction,
        section_name: &str,
    ) -> Result<(), AsmError> {
        let mut bytes: Vec<u8> = Vec::with_capacity(instruction.size as usize);

        let byte0 = (instruction.code.to_u8().unwrap() << CODE_OFFSET)
            | ((instruction.operand_size - 1) as u8) << SIZE_OFFSET;
        bytes.push(byte0);

        if let Some(destination) = &instruction.destination {
            // Payload site: one byte of opcode, one of descriptor.
            let offset = self.location_counter.wrapping_add(2 * BYTE);
            self.encode_operand(destination, instruction, offset, section_name, &mut bytes)?;
        }

        if let Some(source) = &instruction.source {
            let dst_size = instruction.destination.as_ref().map_or(0, |op| op.size);
            let offset = self.location_counter.wrapping_add(2 * BYTE + dst_size);
            self.encode_operand(source, instruction, offset, section_name, &mut bytes)?;
        }

        debug_assert_eq!(bytes.len(), instruction.size as usize);

        let lc = self.location_counter;
        self.sections.get_mut(section_name).unwrap().write(lc, &bytes);
        Ok(())
    }

    fn encode_operand(
        &mut self,
        operand: &Operand,
        instruction: &Instruction,
        offset: u16,
        section_name: &str,
        bytes: &mut Vec<u8>,
    ) -> Result<(), AsmError> {
        let line = self.line;
        let invalid = || AsmError::InvalidOperandType { line };
        let word = instruction.operand_size == WORD;

        let mut descriptor = operand.addressing.to_u8().unwrap() << ADDR_OFFSET;

        match operand.addressing {
            AddrMode::Immed => {
                bytes.push(descriptor);
                let value = match operand.kind {
                    OperandKind::ImmedValue => parse_int(&operand.value).ok_or_else(invalid)?,
                    OperandKind::ImmedSymbol => {
                        self.symbol_term(&operand.value, word, false, section_name, offset)?
                    }
                    _ => return Err(invalid()),
                };
                push_payload(bytes, value, word, line)?;
            }

            AddrMode::RegDir => {
                let reg = register_code(&operand.value).ok_or_else(invalid)?;
                descriptor |= reg << REGS_OFFSET;
                if instruction.operand_size == BYTE && operand.displacement == "h" {
                    descriptor |= 1;
                }
                bytes.push(descriptor);
            }

            AddrMode::RegInd => {
                let reg = register_code(&operand.value).ok_or_else(invalid)?;
                descriptor |= reg << REGS_OFFSET;
                bytes.push(descriptor);
            }

            AddrMode::RegInd8 | AddrMode::RegInd16 => {
                let reg = register_code(&operand.value).ok_or_else(invalid)?;
                descriptor |= reg << REGS_OFFSET;
                bytes.push(descriptor);

                match operand.kind {
                    OperandKind::DisplValue => {
                        let displacement = parse_int(&operand.displacement).ok_or_else(invalid)?;
                        let bits = displacement as u16;
                        bytes.push(bits as u8);
                        if operand.addressing == AddrMode::RegInd16 {
                            bytes.push((bits >> 8) as u8);
                        }
                    }
                    OperandKind::DisplSymbol => {
                        // Symbolic displacements are always a full word.
                        let value =
                            self.symbol_term(&operand.displacement, true, false, section_name, offset)?;
                        push_word(bytes, value);
                    }
                    OperandKind::PcRelative => {
                        let value = self.pc_relative_payload(
                            &operand.displacement,
                            instruction.size,
                            offset,
                            section_name,
                        )?;
                        push_word(bytes, value);
                    }
                    _ => return Err(invalid()),
                }
            }

            AddrMode::Memory => {
                bytes.push(descriptor);
                let value = match operand.kind {
                    OperandKind::MemoryValue => parse_int(&operand.value).ok_or_else(invalid)?,
                    OperandKind::MemorySymbol => {
                        self.symbol_term(&operand.value, true, false, section_name, offset)?
                    }
                    _ => return Err(invalid()),
                };
                push_word(bytes, value);
            }
        }

        Ok(())
    }

    // Payload = symbol value + (payload offset - PC after instruction),
    // so the linker only has to add the symbol's section base.
    fn pc_relative_payload(
        &mut self,
        symbol: &str,
        instruction_size: u16,
        offset: u16,
        section_name: &str,
    ) -> Result<i16, AsmError> {
        let pc_after = self.location_counter.wrapping_add(instruction_size);
        let mut value = offset.wrapping_sub(pc_after) as i16;

        if let Some(entry) = self.ust.get(symbol) {
            let deps = entry.dependencies.clone();
            value = value.wrapping_add(self.symbols.get(symbol).expect("equ symbol registered").value);

            // The first dependency carries the PC-relative kind; the
            // rest patch in as plain 16-bit records.
            for (i, (dep, sign)) in deps.iter().enumerate() {
                let kind = match (i, sign.is_minus()) {
                    (0, false) => RelocationType::R386Pc16,
                    (0, true) => RelocationType::R386SubPc16,
                    (_, false) => RelocationType::R386_16,
                    (_, true) => RelocationType::R386Sub16,
                };
                self.relocations.push(Relocation::new(dep, section_name, offset, kind));
            }

            return Ok(value);
        }

        let mut target = symbol.to_string();
        match self.symbols.get(symbol) {
            Some(entry) => {
                if entry.kind == SymbolType::Constant {
                    return Err(AsmError::PcRelativeOnConstant { line: self.line });
                }
                if entry.scope == ScopeType::Local {
                    value = value.wrapping_add(entry.value);
                    target = entry.section.clone();
                }
            }
            None => {
                self.add_symbol(symbol, UNDEFINED, 0, ScopeType::Global, SymbolType::Extern, false)?;
            }
        }

        self.relocations
            .push(Relocation::new(&target, section_name, offset, RelocationType::R386Pc16));
        Ok(value)
    }

    fn into_object(self) -> ObjectFile {
        ObjectFile {
            symbols: self.symbols.into_sorted(),
            sections: self.sections.into_sorted(),
            relocations: self.relocations,
        }
    }
}

fn apply_sign(value: i16, sign: Sign) -> i16 {
    match sign {
        Sign::Plus => value,
        Sign::Minus => value.wrapping_neg(),
    }
}

fn push_payload(bytes: &mut Vec<u8>, value: i16, word: bool, line: u32) -> Result<(), AsmError> {
    let bits = value as u16;
    if word {
        bytes.extend_from_slice(&bits.to_le_bytes());
        Ok(())
    } else if bits >> 8 != 0 {
        Err(AsmError::ByteOverflow { line })
    } else {
        bytes.push(bits as u8);
        Ok(())
    }
}

fn push_word(bytes: &mut Vec<u8>, value: i16) {
    bytes.extend_from_slice(&(value as u16).to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::assemble;
    use obj::{RelocationType, ScopeType, SymbolType};

    fn text_bytes(src: &str) -> Vec<u8> {
        let object = assemble(src).unwrap();
        object
            .sections
            .iter()
            .find(|s| s.name == ".text")
            .unwrap()
            .bytes
            .clone()
    }

    #[test]
    fn halt() {
        let bytes = text_bytes(".text\nhalt\n.end\n");
        assert_eq!(bytes, vec![1 << 3 | 1 << 2]);
    }

    #[test]
    fn mov_reg_reg() {
        // opcode 4, word: 0x24; r1 and r2 register-direct.
        let bytes = text_bytes(".text\nmov r1, r2\n.end\n");
        assert_eq!(bytes, vec![0x24, 0x22, 0x24]);
    }

    #[test]
    fn movb_high_half() {
        let bytes = text_bytes(".text\nmovb r0h, r1l\n.end\n");
        assert_eq!(bytes, vec![0x20, 0x21, 0x22]);
    }

    #[test]
    fn immediate_word() {
        let bytes = text_bytes(".text\npush $0x1234\n.end\n");
        assert_eq!(bytes, vec![17 << 3 | 1 << 2, 0x00, 0x34, 0x12]);
    }

    #[test]
    fn immediate_byte_overflow() {
        assert!(matches!(
            assemble(".text\npushb $0x134\n.end\n"),
            Err(crate::AsmError::ByteOverflow { line: 2 })
        ));
    }

    #[test]
    fn register_indirect_displacements() {
        // [r2] dst, [r3+4] src.
        let bytes = text_bytes(".text\nmov [r2], [r3+4]\n.end\n");
        assert_eq!(bytes, vec![0x24, 0x44, 0x66, 0x04]);

        // Wide displacement takes two payload bytes.
        let bytes = text_bytes(".text\nmov r0, [r3+0x400]\n.end\n");
        assert_eq!(bytes, vec![0x24, 0x20, 0x86, 0x00, 0x04]);
    }

    #[test]
    fn pc_relative_back_branch() {
        let object = assemble(".text\nloop: jmp %loop\n.end\n").unwrap();
        let text = object.sections.iter().find(|s| s.name == ".text").unwrap();
        // Descriptor: reg-ind-16 with the PC; payload 2 - 4 = -2.
        assert_eq!(text.bytes, vec![19 << 3 | 1 << 2, 0x8e, 0xfe, 0xff]);

        assert_eq!(object.relocations.len(), 1);
        let reloc = &object.relocations[0];
        assert_eq!(reloc.symbol, ".text");
        assert_eq!(reloc.offset, 2);
        assert_eq!(reloc.kind, RelocationType::R386Pc16);
    }

    #[test]
    fn memory_operand_emits_absolute_relocation() {
        let object = assemble(".text\ncall handler\n.end\n").unwrap();
        let text = object.sections.iter().find(|s| s.name == ".text").unwrap();
        assert_eq!(text.bytes, vec![23 << 3 | 1 << 2, 0xa0, 0x00, 0x00]);

        let handler = object.symbols.iter().find(|s| s.name == "handler").unwrap();
        assert_eq!(handler.kind, SymbolType::Extern);
        assert_eq!(handler.scope, ScopeType::Global);
        assert!(!handler.defined);

        assert_eq!(object.relocations.len(), 1);
        assert_eq!(object.relocations[0].symbol, "handler");
        assert_eq!(object.relocations[0].kind, RelocationType::R386_16);
    }

    #[test]
    fn instruction_sizes_match_layout() {
        let object = assemble(
            ".text\nhalt\nmov r0, r1\nadd r2, $5\nmov [r1+2], [r2+0x300]\n.end\n",
        )
        .unwrap();
        let text = object.sections.iter().find(|s| s.name == ".text").unwrap();
        // 1 + 3 + 5 + 6 bytes.
        assert_eq!(text.size, 15);
        assert_eq!(text.bytes.len(), 15);
    }
}
