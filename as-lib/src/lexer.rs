//! Token classification. Source lines are split on commas and
//! whitespace; each token is classified by regex into one of a fixed
//! set of tags. The token-line list is kept verbatim and walked once
//! per pass.

use common::constants::NUM_FLAGS;

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Label,
    Symbol,
    Section,
    SectionName,
    SectionFlags,
    Directive,
    GlobalExtern,
    Instruction,
    OperandImmed,
    Expression,
    Invalid,
}

const IMM: &str = r"-?(?:0[xX][0-9a-fA-F]+|0[bB][01]+|[0-9]+)";
const IDENT: &str = r"[a-zA-Z_][a-zA-Z0-9_]*";

static LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^({IDENT}):$")).unwrap());
static SYMBOL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^{IDENT}$")).unwrap());
static SECTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\.(text|data|bss|rodata|section)$").unwrap());
static SECTION_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"^\.{IDENT}$")).unwrap());
static SECTION_FLAGS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^"[waxmsilgteWAXMSILGTE]+"$"#).unwrap());
static BARE_FLAGS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[waxmsilgteWAXMSILGTE]+$").unwrap());
static DIRECTIVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\.(equ|align|skip|byte|word)$").unwrap());
static GLOBAL_EXTERN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\.(global|extern)$").unwrap());
static INSTRUCTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        "^(halt|xchg|int|mov|add|sub|mul|div|cmp|not|and|or|xor|test|\
         shl|shr|push|pop|jmp|jeq|jne|jgt|call|ret|iret)[bw]?$",
    )
    .unwrap()
});
static IMMED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^{IMM}$")).unwrap());
static EXPRESSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!("^({IMM}|{IDENT})([+-])({IMM}|{IDENT})$")).unwrap()
});

pub fn token_type(token: &str) -> TokenType {
    if LABEL_RE.is_match(token) {
        TokenType::Label
    } else if GLOBAL_EXTERN_RE.is_match(token) {
        TokenType::GlobalExtern
    } else if SECTION_RE.is_match(token) {
        TokenType::Section
    } else if DIRECTIVE_RE.is_match(token) {
        TokenType::Directive
    } else if SECTION_NAME_RE.is_match(token) {
        TokenType::SectionName
    } else if SECTION_FLAGS_RE.is_match(token) {
        TokenType::SectionFlags
    } else if INSTRUCTION_RE.is_match(token) {
        TokenType::Instruction
    } else if IMMED_RE.is_match(token) {
        TokenType::OperandImmed
    } else if SYMBOL_RE.is_match(token) {
        TokenType::Symbol
    } else if EXPRESSION_RE.is_match(token) {
        TokenType::Expression
    } else {
        TokenType::Invalid
    }
}

// The label name without its trailing colon.
pub fn label_name(token: &str) -> Option<&str> {
    LABEL_RE
        .captures(token)
        .map(|caps| caps.get(1).unwrap().as_str())
}

// The `X op Y` parts of an expression token.
pub fn expression_parts(token: &str) -> Option<(&str, char, &str)> {
    let caps = EXPRESSION_RE.captures(token)?;
    let op = caps.get(2).unwrap().as_str().chars().next().unwrap();
    Some((
        caps.get(1).unwrap().as_str(),
        op,
        caps.get(3).unwrap().as_str(),
    ))
}

// A term of a data initializer list: anything that stands for a value,
// as opposed to a `+`/`-` operator between terms.
pub fn is_term(token: &str) -> bool {
    matches!(
        token_type(token),
        TokenType::OperandImmed | TokenType::Symbol | TokenType::Expression
    )
}

// Flag tokens are accepted quoted or bare in `.section` flag position.
pub fn is_section_flags(token: &str) -> bool {
    SECTION_FLAGS_RE.is_match(token) || BARE_FLAGS_RE.is_match(token)
}

// Expand an explicit flag list into the 10-position bitstring.
pub fn set_flags(flags: &mut String, explicit: &str) {
    debug_assert_eq!(flags.len(), NUM_FLAGS);
    let mut positions = vec![false; NUM_FLAGS];
    for (position, ch) in flags.chars().enumerate() {
        positions[position] = ch == '1';
    }
    for ch in explicit.trim_matches('"').chars() {
        let position = match ch.to_ascii_uppercase() {
            'W' => 0,
            'A' => 1,
            'X' => 2,
            'M' => 3,
            'S' => 4,
            'I' => 5,
            'L' => 6,
            'G' => 7,
            'T' => 8,
            'E' => 9,
            _ => continue,
        };
        positions[position] = true;
    }
    *flags = positions.iter().map(|&set| if set { '1' } else { '0' }).collect();
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct TokenLine {
    pub number: u32,
    pub tokens: Vec<String>,
}

// Strip comments, split each line on commas and whitespace, drop empty
// lines and stop at a leading `.end`.
pub fn read_assembly(source: &str) -> Vec<TokenLine> {
    let mut assembly = Vec::new();

    for (line, number) in source.lines().zip(1u32..) {
        let line = line.split('#').next().unwrap();

        let tokens: Vec<String> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        if tokens.is_empty() {
            continue;
        }

        if tokens[0] == ".end" {
            break;
        }

        assembly.push(TokenLine { number, tokens });
    }

    assembly
}
