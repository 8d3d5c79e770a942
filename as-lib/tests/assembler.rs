use as_lib::{assemble, AsmError};
use obj::{ObjectFile, RelocationType, ScopeType, Section, Symbol, SymbolType};

fn section<'a>(object: &'a ObjectFile, name: &str) -> &'a Section {
    object.sections.iter().find(|s| s.name == name).unwrap()
}

fn symbol<'a>(object: &'a ObjectFile, name: &str) -> &'a Symbol {
    object.symbols.iter().find(|s| s.name == name).unwrap()
}

#[test]
fn empty_text_section() {
    let object = assemble(".text\n.end\n").unwrap();

    assert_eq!(object.symbols.len(), 1);
    let text = symbol(&object, ".text");
    assert_eq!(text.kind, SymbolType::Section);
    assert_eq!(text.value, 0);
    assert!(text.defined);

    assert_eq!(object.sections.len(), 1);
    assert_eq!(section(&object, ".text").size, 0);
    assert!(object.relocations.is_empty());
}

#[test]
fn forward_local_reference() {
    let src = "\
.text
start:  jmp $end
end:
.end
";
    let object = assemble(src).unwrap();

    let end = symbol(&object, "end");
    assert_eq!(end.kind, SymbolType::Label);
    assert_eq!(end.scope, ScopeType::Local);
    assert_eq!(end.value, 4);

    // Payload carries the label's section offset; the linker adds the
    // section base via the relocation against `.text`.
    let text = section(&object, ".text");
    assert_eq!(text.bytes, vec![0x9c, 0x00, 0x04, 0x00]);

    assert_eq!(object.relocations.len(), 1);
    let reloc = &object.relocations[0];
    assert_eq!(reloc.symbol, ".text");
    assert_eq!(reloc.section, ".text");
    assert_eq!(reloc.offset, 2);
    assert_eq!(reloc.kind, RelocationType::R386_16);
}

#[test]
fn global_of_an_import_is_an_extern_declaration() {
    let src = "\
.global myFunc
.text
call $myFunc
.end
";
    let object = assemble(src).unwrap();

    let func = symbol(&object, "myFunc");
    assert_eq!(func.kind, SymbolType::Extern);
    assert_eq!(func.scope, ScopeType::Global);
    assert!(!func.defined);
    assert_eq!(func.index, 0);

    assert_eq!(object.relocations.len(), 1);
    let reloc = &object.relocations[0];
    assert_eq!(reloc.symbol, "myFunc");
    assert_eq!(reloc.offset, 2);
    assert_eq!(reloc.kind, RelocationType::R386_16);
}

#[test]
fn equ_chain_folds_to_constants() {
    let src = "\
.equ A, 5
.equ B, A + 3
.equ C, B - 1
.end
";
    let object = assemble(src).unwrap();

    for (name, value) in [("A", 5), ("B", 8), ("C", 7)] {
        let sym = symbol(&object, name);
        assert_eq!(sym.kind, SymbolType::Constant, "{name}");
        assert_eq!(sym.value, value, "{name}");
        assert!(sym.defined, "{name}");
    }
    assert!(object.relocations.is_empty());
}

#[test]
fn subtractive_extern() {
    let src = "\
.extern X
.data
.word 10 - X
.end
";
    let object = assemble(src).unwrap();

    let data = section(&object, ".data");
    assert_eq!(data.bytes, vec![0x0a, 0x00]);
    assert_eq!(data.size, 2);

    assert_eq!(object.relocations.len(), 1);
    let reloc = &object.relocations[0];
    assert_eq!(reloc.symbol, "X");
    assert_eq!(reloc.section, ".data");
    assert_eq!(reloc.offset, 0);
    assert_eq!(reloc.kind, RelocationType::R386Sub16);
}

#[test]
fn cyclic_equivalence_is_rejected() {
    let src = "\
.equ A, B
.equ B, A
.end
";
    assert!(matches!(
        assemble(src),
        Err(AsmError::CyclicEquivalence { .. })
    ));
}

#[test]
fn three_way_cycle_is_rejected() {
    let src = "\
.equ A, B + 1
.equ B, C + 1
.equ C, A + 1
.end
";
    assert!(matches!(
        assemble(src),
        Err(AsmError::CyclicEquivalence { .. })
    ));
}

////////////////////////////////////////////////////////////////////////////////
// Boundary behaviors

#[test]
fn byte_overflow() {
    assert!(matches!(
        assemble(".data\n.byte 256\n.end\n"),
        Err(AsmError::ByteOverflow { line: 2 })
    ));
    assert!(assemble(".data\n.byte 255\n.end\n").is_ok());
}

#[test]
fn align_advances_to_power_of_two_boundary() {
    let src = "\
.data
.byte 1
.align 2
.byte 2
.end
";
    let object = assemble(src).unwrap();
    let data = section(&object, ".data");
    assert_eq!(data.bytes, vec![1, 0, 0, 0, 2]);
    assert_eq!(data.size, 5);
}

#[test]
fn align_zero_and_aligned_are_noops() {
    let object = assemble(".data\n.byte 1\n.align 0\n.byte 2\n.end\n").unwrap();
    assert_eq!(section(&object, ".data").bytes, vec![1, 2]);

    let object = assemble(".data\n.word 1\n.align 1\n.word 2\n.end\n").unwrap();
    assert_eq!(section(&object, ".data").bytes, vec![1, 0, 2, 0]);
}

#[test]
fn skip_fills() {
    let object = assemble(".data\n.skip 3\n.byte 7\n.end\n").unwrap();
    assert_eq!(section(&object, ".data").bytes, vec![0, 0, 0, 7]);

    let object = assemble(".data\n.skip 2, 0xff\n.end\n").unwrap();
    assert_eq!(section(&object, ".data").bytes, vec![0xff, 0xff]);
}

#[test]
fn skip_in_bss_reserves_without_bytes() {
    let object = assemble(".bss\nbuf: .skip 4\n.end\n").unwrap();
    let bss = section(&object, ".bss");
    assert_eq!(bss.size, 4);
    assert!(bss.bytes.is_empty());
}

#[test]
fn local_difference_folds_without_relocation() {
    let src = "\
.text
a: halt
b: halt
.word b - a
.end
";
    let object = assemble(src).unwrap();
    let text = section(&object, ".text");
    assert_eq!(text.bytes, vec![0x0c, 0x0c, 0x01, 0x00]);
    assert!(object.relocations.is_empty());
}

#[test]
fn pc_relative_to_constant_fails() {
    let src = "\
.text
.equ K, 5
jmp %K
.end
";
    assert!(matches!(
        assemble(src),
        Err(AsmError::PcRelativeOnConstant { line: 3 })
    ));
}

////////////////////////////////////////////////////////////////////////////////
// Scope directives

#[test]
fn global_upgrades_a_local_definition() {
    let src = "\
.global start
.text
start: halt
.end
";
    let object = assemble(src).unwrap();
    let start = symbol(&object, "start");
    assert_eq!(start.kind, SymbolType::Label);
    assert_eq!(start.scope, ScopeType::Global);
    assert!(start.defined);
}

#[test]
fn extern_of_a_defined_symbol_fails() {
    let src = "\
.text
start: halt
.extern start
.end
";
    assert!(matches!(
        assemble(src),
        Err(AsmError::ExternButDefined { line: 3, .. })
    ));
}

#[test]
fn global_of_an_unresolved_alias_fails() {
    let src = "\
.global A
.equ A, X + 1
.end
";
    assert!(matches!(
        assemble(src),
        Err(AsmError::GlobalButUndefined { .. })
    ));
}

////////////////////////////////////////////////////////////////////////////////
// Equivalences and relocations

#[test]
fn alias_of_label_relocates_against_its_section() {
    let src = "\
.text
start: halt
.equ alias, start + 1
.data
.word alias
.end
";
    let object = assemble(src).unwrap();

    let alias = symbol(&object, "alias");
    assert_eq!(alias.kind, SymbolType::Alias);
    assert_eq!(alias.value, 1);
    assert!(alias.defined);

    assert_eq!(section(&object, ".data").bytes, vec![0x01, 0x00]);
    assert_eq!(object.relocations.len(), 1);
    let reloc = &object.relocations[0];
    assert_eq!(reloc.symbol, ".text");
    assert_eq!(reloc.section, ".data");
    assert_eq!(reloc.kind, RelocationType::R386_16);
}

#[test]
fn subtractive_alias_in_an_operand() {
    let src = "\
.extern X
.equ diff, 10 - X
.text
mov r0, $diff
.end
";
    let object = assemble(src).unwrap();

    let text = section(&object, ".text");
    assert_eq!(text.bytes, vec![0x24, 0x20, 0x00, 0x0a, 0x00]);

    assert_eq!(object.relocations.len(), 1);
    let reloc = &object.relocations[0];
    assert_eq!(reloc.symbol, "X");
    assert_eq!(reloc.section, ".text");
    assert_eq!(reloc.offset, 3);
    assert_eq!(reloc.kind, RelocationType::R386Sub16);
}

#[test]
fn forward_alias_is_resolved_between_passes() {
    let src = "\
.text
.equ after, end + 1
start: jmp $after
end:
.end
";
    let object = assemble(src).unwrap();

    let after = symbol(&object, "after");
    assert_eq!(after.value, 5);
    assert!(after.defined);

    let text = section(&object, ".text");
    assert_eq!(text.bytes, vec![0x9c, 0x00, 0x05, 0x00]);

    assert_eq!(object.relocations.len(), 1);
    assert_eq!(object.relocations[0].symbol, ".text");
    assert_eq!(object.relocations[0].kind, RelocationType::R386_16);
}

////////////////////////////////////////////////////////////////////////////////
// Errors

#[test]
fn error_cases() {
    use AsmError::*;

    let cases: &[(&str, fn(&AsmError) -> bool)] = &[
        ("start: halt\n.end\n", |e| {
            matches!(e, LabelOutsideSection { line: 1, .. })
        }),
        (".text\na: b: halt\n.end\n", |e| {
            matches!(e, DoubleLabel { line: 2 })
        }),
        (".text\na:\nb:\n.end\n", |e| matches!(e, DoubleLabel { line: 3 })),
        (".bss\n.byte 1\n.end\n", |e| {
            matches!(e, MemoryInitInBss { line: 2 })
        }),
        (".data\nhalt\n.end\n", |e| {
            matches!(e, InstructionOutsideExecutableSection { line: 2 })
        }),
        (".word 5\n.end\n", |e| {
            matches!(e, DirectiveOutsideSection { line: 1 })
        }),
        (".text\n!!!\n.end\n", |e| matches!(e, InvalidToken { line: 2 })),
        (".text extra\n.end\n", |e| matches!(e, TrailingTokens { line: 1 })),
        (".text\nhalt r0\n.end\n", |e| {
            matches!(e, TrailingTokens { line: 2 })
        }),
        (".global\n.end\n", |e| {
            matches!(e, DirectiveMissingArgument { line: 1, .. })
        }),
        (".text\n.equ NAME\n.end\n", |e| {
            matches!(e, DirectiveMissingArgument { line: 2, .. })
        }),
        (".section\n.end\n", |e| {
            matches!(e, DirectiveMissingArgument { line: 1, .. })
        }),
        (".section 5\n.end\n", |e| {
            matches!(e, IllegalSectionName { line: 1 })
        }),
        (".section .io zz\n.end\n", |e| {
            matches!(e, IllegalSectionFlags { line: 1 })
        }),
        (".text\n.text\n.end\n", |e| {
            matches!(e, SymbolAlreadyDefined { line: 2, .. })
        }),
        (".text\na: halt\na: halt\n.end\n", |e| {
            matches!(e, SymbolAlreadyDefined { line: 3, .. })
        }),
        (".data\n.word 1 + + 2\n.end\n", |e| {
            matches!(e, InvalidExpression { line: 2 })
        }),
    ];

    for (src, check) in cases {
        let err = assemble(src).unwrap_err();
        assert!(check(&err), "{src:?} -> {err}");
    }
}

////////////////////////////////////////////////////////////////////////////////
// Sections and flags

#[test]
fn section_flag_defaults() {
    let src = ".text\n.data\n.bss\n.rodata\n.section .custom\n.end\n";
    let object = assemble(src).unwrap();

    let flags: Vec<(&str, &str)> = object
        .sections
        .iter()
        .map(|s| (s.name.as_str(), s.flags.as_str()))
        .collect();
    assert_eq!(
        flags,
        vec![
            (".text", "0110000000"),
            (".data", "1100000000"),
            (".bss", "1000000000"),
            (".rodata", "0100000000"),
            (".custom", "1110000000"),
        ]
    );

    // Section symbols and table entries line up by index.
    for section in &object.sections {
        let sym = &object.symbols[section.symbol_index as usize];
        assert_eq!(sym.name, section.name);
        assert_eq!(sym.kind, SymbolType::Section);
    }
}

#[test]
fn explicit_section_flags() {
    let object = assemble(".section .io \"aw\"\n.end\n").unwrap();
    assert_eq!(section(&object, ".io").flags, "1100000000");
}

////////////////////////////////////////////////////////////////////////////////
// Object-level laws

#[test]
fn assembly_is_deterministic() {
    let src = "\
.global entry
.extern X
.text
entry:  mov r0, $X
loop:   add r0, [r1+2]
        jne %loop
        call helper
        halt
.equ limit, loop - entry
.data
vals:   .word 1, 2, X - 3, limit
.byte 0x7f
.bss
buf:    .skip 16
.end
";
    let first = assemble(src).unwrap();
    let second = assemble(src).unwrap();

    let mut a = Vec::new();
    let mut b = Vec::new();
    first.write_to(&mut a).unwrap();
    second.write_to(&mut b).unwrap();
    assert_eq!(a, b);
}

#[test]
fn object_file_round_trips() {
    let src = "\
.text
start:  mov r0, $1
        halt
.data
.word start
.end
";
    let object = assemble(src).unwrap();

    let mut buf = Vec::new();
    object.write_to(&mut buf).unwrap();
    let read = ObjectFile::read_from(&mut buf.as_slice()).unwrap();
    assert_eq!(read, object);
}

#[test]
fn symbol_indices_are_insertion_ranks() {
    let src = "\
.extern X
.text
a: halt
b: halt
.end
";
    let object = assemble(src).unwrap();
    for (position, sym) in object.symbols.iter().enumerate() {
        assert_eq!(sym.index as usize, position);
    }
    assert_eq!(object.symbols[0].name, "X");
    assert_eq!(object.symbols[1].name, ".text");
    assert_eq!(object.symbols[2].name, "a");
    assert_eq!(object.symbols[3].name, "b");
}

#[test]
fn relocation_sites_lie_within_their_sections() {
    let src = "\
.extern X
.text
entry:  mov r0, $X
        call entry
        jmp %exit
exit:   halt
.data
.word X, X + 2, entry
.byte X + 1
.end
";
    let object = assemble(src).unwrap();
    assert!(!object.relocations.is_empty());

    for reloc in &object.relocations {
        let section = object
            .sections
            .iter()
            .find(|s| s.name == reloc.section)
            .unwrap();
        let width = match reloc.kind {
            RelocationType::R386_8 | RelocationType::R386Sub8 => 1,
            _ => 2,
        };
        assert!(
            reloc.offset + width <= section.size,
            "relocation at {}+{} outside {} (size {})",
            reloc.offset,
            width,
            reloc.section,
            section.size
        );
    }
}

#[test]
fn section_sizes_match_emitted_bytes() {
    let src = "\
.text
entry:  mov r0, r1
        halt
.data
.word 1, 2, 3
.byte 4
.end
";
    let object = assemble(src).unwrap();
    for section in &object.sections {
        assert_eq!(section.size as usize, section.bytes.len(), "{}", section.name);
    }
}

#[test]
fn listing_mentions_all_tables() {
    let src = "\
.extern X
.text
entry: mov r0, $X
.end
";
    let object = assemble(src).unwrap();
    let mut out = Vec::new();
    object.write_listing(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();

    assert!(text.contains("/*** Section \".text\" ***/"));
    assert!(text.contains("/*** Symbol Table ***/"));
    assert!(text.contains("/*** Section Table ***/"));
    assert!(text.contains("/*** Relocation Table ***/"));
    assert!(text.contains("entry"));
    assert!(text.contains("R_386_16"));
}
