use std::io;

use thiserror::Error;

// Every assembly-phase error names the 1-based source line it came from.
// The driver prints the message and exits; nothing is retried.
#[derive(Debug, Error)]
pub enum AsmError {
    #[error("Invalid input file type -> assembly file (.s) expected!")]
    InvalidInputFile,

    #[error("Invalid output file type -> object file (.o) expected!")]
    InvalidOutputFile,

    #[error("Can't open file {path}!")]
    CannotOpenFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("line {line}: Invalid token!")]
    InvalidToken { line: u32 },

    #[error("line {line}: Label \"{label}\" defined outside any section!")]
    LabelOutsideSection { line: u32, label: String },

    #[error("line {line}: Double label definition!")]
    DoubleLabel { line: u32 },

    #[error("line {line}: Directive \"{directive}\" is missing an argument!")]
    DirectiveMissingArgument { line: u32, directive: String },

    #[error("line {line}: Directives are only allowed inside a section!")]
    DirectiveOutsideSection { line: u32 },

    #[error("line {line}: Illegal section name!")]
    IllegalSectionName { line: u32 },

    #[error("line {line}: Illegal section flags!")]
    IllegalSectionFlags { line: u32 },

    #[error("line {line}: Section \"{name}\" is already defined!")]
    SectionAlreadyDefined { line: u32, name: String },

    #[error("line {line}: Memory initialization in BSS section!")]
    MemoryInitInBss { line: u32 },

    #[error("line {line}: Instruction declared outside an executable section!")]
    InstructionOutsideExecutableSection { line: u32 },

    #[error("line {line}: Unknown instruction \"{mnemonic}\"!")]
    UnknownInstruction { line: u32, mnemonic: String },

    #[error("line {line}: Symbol \"{name}\" is already defined!")]
    SymbolAlreadyDefined { line: u32, name: String },

    #[error("line {line}: Symbol \"{name}\" defined in file but flagged as extern!")]
    ExternButDefined { line: u32, name: String },

    #[error("line {line}: Symbol \"{name}\" not defined in file but flagged as global!")]
    GlobalButUndefined { line: u32, name: String },

    #[error("line {line}: Cyclic equivalence detected!")]
    CyclicEquivalence { line: u32 },

    #[error("line {line}: Byte sized value expected!")]
    ByteOverflow { line: u32 },

    #[error("line {line}: PC relative addressing of constant symbol!")]
    PcRelativeOnConstant { line: u32 },

    #[error("line {line}: Invalid expression!")]
    InvalidExpression { line: u32 },

    #[error("line {line}: Invalid operand type!")]
    InvalidOperandType { line: u32 },

    #[error("line {line}: Only one directive/instruction is allowed per line!")]
    TrailingTokens { line: u32 },

    #[error(transparent)]
    Io(#[from] io::Error),
}
