//! Assembler-side tables: the symbol table, the section table and the
//! unresolved symbol table. All three hand out entries by name but
//! remember insertion order, which fixes the entry numbering used by
//! the object file and the listing.

use std::collections::HashMap;

use obj::{ScopeType, Section, Symbol, SymbolType};

#[derive(Debug, Default)]
pub struct SymbolTable {
    entries: HashMap<String, Symbol>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Symbol> {
        self.entries.get_mut(name)
    }

    // Insert or update. A fresh name takes the next entry number; an
    // existing entry keeps its number and has its data replaced.
    pub fn upsert(
        &mut self,
        name: &str,
        section: &str,
        value: i16,
        scope: ScopeType,
        kind: SymbolType,
        defined: bool,
    ) {
        if let Some(symbol) = self.entries.get_mut(name) {
            symbol.section = section.to_string();
            symbol.value = value;
            symbol.scope = scope;
            symbol.kind = kind;
            symbol.defined = defined;
            return;
        }

        let index = self.entries.len() as u16;
        self.entries.insert(
            name.to_string(),
            Symbol {
                name: name.to_string(),
                section: section.to_string(),
                value,
                scope,
                kind,
                defined,
                index,
            },
        );
    }

    pub fn into_sorted(self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.entries.into_values().collect();
        symbols.sort_by_key(|s| s.index);
        symbols
    }
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
pub struct SectionTable {
    entries: HashMap<String, Section>,
}

impl SectionTable {
    pub fn new() -> SectionTable {
        SectionTable::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Section> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Section> {
        self.entries.get_mut(name)
    }

    // Returns false when the name is already taken.
    pub fn insert(&mut self, name: &str, flags: String, symbol_index: u16) -> bool {
        if self.entries.contains_key(name) {
            return false;
        }
        let index = self.entries.len() as u16;
        self.entries
            .insert(name.to_string(), Section::new(name, flags, index, symbol_index));
        true
    }

    pub fn into_sorted(self) -> Vec<Section> {
        let mut sections: Vec<Section> = self.entries.into_values().collect();
        sections.sort_by_key(|s| s.index);
        sections
    }
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    Plus,
    Minus,
}

impl Sign {
    pub fn is_minus(self) -> bool {
        self == Sign::Minus
    }
}

// One `.equ`-defined symbol whose value hangs off other symbols. The
// dependency list holds raw `(symbol, sign)` edges until resolution,
// which rewrites defined dependencies to their owning section names.
#[derive(Debug, Clone)]
pub struct UnresolvedSymbol {
    pub name: String,
    pub section: String,
    pub line: u32,
    pub dependencies: Vec<(String, Sign)>,
}

#[derive(Debug, Default)]
pub struct Ust {
    order: Vec<String>,
    entries: HashMap<String, UnresolvedSymbol>,
}

impl Ust {
    pub fn new() -> Ust {
        Ust::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&UnresolvedSymbol> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut UnresolvedSymbol> {
        self.entries.get_mut(name)
    }

    pub fn insert(&mut self, entry: UnresolvedSymbol) {
        debug_assert!(!self.entries.contains_key(&entry.name));
        self.order.push(entry.name.clone());
        self.entries.insert(entry.name.clone(), entry);
    }

    // Entry names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}
