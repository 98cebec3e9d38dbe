use crate::{EmbedResolver, Gen, NoEmbeds};
use wisp_lex::Lexer;
use wisp_par::Parser;
use wisp_prog::{validate, Op, Program};
use wisp_util::FileId;

fn compile_with(source: &str, resolver: &mut dyn EmbedResolver) -> Result<Gen, String> {
    let mut lexer = Lexer::new(FileId::MAIN, 1);
    let mut toks = Vec::new();
    lexer.push_bytes(source.as_bytes(), &mut toks);
    lexer.close(&mut toks);

    let mut parser = Parser::new();
    let mut gen = Gen::new(false);
    gen.set_file(FileId::MAIN, "test.wisp");
    let mut stmts = Vec::new();
    for (tok, pos) in &toks {
        parser.add(tok, *pos, &mut stmts).map_err(|(_, m)| m)?;
        for stmt in stmts.drain(..) {
            gen.add_stmt(&stmt, resolver).map_err(|(_, m)| m)?;
        }
    }
    parser.close(&mut stmts).map_err(|(_, m)| m)?;
    Ok(gen)
}

fn compile(source: &str) -> Result<Program, String> {
    let gen = compile_with(source, &mut NoEmbeds)?;
    validate(&gen.prog).map_err(|e| e.to_string())?;
    Ok(gen.prog)
}

fn has_op(prog: &Program, op: Op) -> bool {
    // Decode properly so data bytes do not false-positive.
    let mut off = 0;
    while off < prog.ops.len() {
        let b = prog.ops[off];
        let cur = Op::from_u8(b).expect("invalid op in compiled program");
        if cur == op {
            return true;
        }
        off += 1 + param_len(&prog.ops[off + 1..], cur);
    }
    false
}

fn param_len(rest: &[u8], op: Op) -> usize {
    use wisp_prog::OpParams as P;
    match op.params() {
        P::None => 0,
        P::V => 2,
        P::VV => 4,
        P::VVV => 6,
        P::VVVV => 8,
        P::VF => 10,
        P::VU8 => 3,
        P::VS => 6,
        P::U8U8 => 2,
        P::L => 4,
        P::VL => 6,
        P::Call => 2 + 4 + 1 + rest[6] as usize * 2,
        P::TailCall => 4 + 1 + rest[4] as usize * 2,
        P::Native => 2 + 4 + 1 + rest[6] as usize * 2,
        P::VArgs => 2 + 1 + rest[2] as usize * 2,
        P::Args => 1 + rest[0] as usize * 2,
    }
}

// ============================================================================
// BASICS
// ============================================================================

#[test]
fn test_say_constant() {
    let prog = compile("say 1 + 2\n").unwrap();
    // Folded at parse time: a single small constant plus the say.
    assert!(has_op(&prog, Op::NumP8));
    assert!(has_op(&prog, Op::Say));
}

#[test]
fn test_var_and_assign() {
    let prog = compile("var x = 5\nx = x + 1\n").unwrap();
    assert!(has_op(&prog, Op::Add));
}

#[test]
fn test_compound_assign() {
    assert!(compile("var x = 1\nx += 2\nx ~= 'a'\n").is_ok());
}

#[test]
fn test_conditional_assign() {
    let prog = compile("var x\nx ||= 5\nx &&= 6\n").unwrap();
    assert!(has_op(&prog, Op::JumpTrue));
    assert!(has_op(&prog, Op::JumpFalse));
}

#[test]
fn test_list_literal_and_index() {
    let prog = compile("var l = {1, 2, 3}\nsay l[0]\nl[1] = 9\n").unwrap();
    assert!(has_op(&prog, Op::ListPush));
    assert!(has_op(&prog, Op::GetAt));
    assert!(has_op(&prog, Op::SetAt));
}

#[test]
fn test_slice_assign() {
    let prog = compile("var l = {1, 2, 3}\nl[0:2] = {9}\nsay l[1:]\n").unwrap();
    assert!(has_op(&prog, Op::Splice));
    assert!(has_op(&prog, Op::Slice));
}

#[test]
fn test_destructure() {
    let prog = compile("var {a, b, ...rest} = {1, 2, 3, 4}\nsay a, b, rest\n").unwrap();
    assert!(has_op(&prog, Op::GetAt));
    assert!(has_op(&prog, Op::Slice));
}

#[test]
fn test_size_prefix() {
    let prog = compile("var x = {1, 2, 3}\nsay &x\n").unwrap();
    assert!(has_op(&prog, Op::Size));
}

#[test]
fn test_string_interpolation_lowers_to_cat() {
    let prog = compile("var x = 3\nsay \"v=$x!\"\n").unwrap();
    assert!(has_op(&prog, Op::Cat));
}

// ============================================================================
// CONTROL FLOW
// ============================================================================

#[test]
fn test_if_elseif_else() {
    let prog = compile(
        "var x = 1\nif x < 0\nsay 'neg'\nelseif x == 0\nsay 'zero'\nelse\nsay 'pos'\nend\n",
    )
    .unwrap();
    assert!(has_op(&prog, Op::JumpFalse));
    assert!(has_op(&prog, Op::Jump));
}

#[test]
fn test_do_while() {
    let prog =
        compile("var x = 0\ndo\nx = x + 1\nwhile x < 10\nend\nsay x\n").unwrap();
    assert!(has_op(&prog, Op::JumpFalse));
}

#[test]
fn test_plain_do_with_break() {
    assert!(compile("var x = 0\ndo\nx = x + 1\nif x > 3\nbreak\nend\nend\n").is_ok());
}

#[test]
fn test_break_outside_loop_errors() {
    assert!(compile("break\n").is_err());
}

#[test]
fn test_continue_outside_loop_errors() {
    assert!(compile("continue\n").is_err());
}

#[test]
fn test_for_range_is_counted() {
    let prog = compile("for var v: range 3\nsay v\nend\n").unwrap();
    // The counted form must not materialize a range list.
    assert!(!has_op(&prog, Op::Range));
    assert!(has_op(&prog, Op::Lt));
}

#[test]
fn test_for_range_with_index() {
    let prog = compile("for var v, i: range 2, 10, 2\nsay v, i\nend\n").unwrap();
    assert!(!has_op(&prog, Op::Range));
}

#[test]
fn test_for_generic_list() {
    let prog = compile("var l = {1, 2}\nfor var v: l\nsay v\nend\n").unwrap();
    assert!(has_op(&prog, Op::Size));
    assert!(has_op(&prog, Op::GetAt));
}

#[test]
fn test_goto_and_label() {
    let prog = compile("var x = 0\ntop:\nx = x + 1\nif x < 3\ngoto top\nend\n").unwrap();
    assert!(has_op(&prog, Op::Jump));
}

#[test]
fn test_goto_missing_label_in_command_errors() {
    assert!(compile("def f\ngoto nowhere\nend\n").is_err());
}

// ============================================================================
// COMMANDS
// ============================================================================

#[test]
fn test_def_and_call() {
    let prog = compile("def f a, b = 10\nreturn a + b\nend\nsay f 5\n").unwrap();
    assert!(has_op(&prog, Op::CmdHead));
    assert!(has_op(&prog, Op::Call));
    assert!(has_op(&prog, Op::Return));
}

#[test]
fn test_rest_param() {
    assert!(compile("def f a, ...rest\nreturn &rest\nend\nsay f 1, 2, 3\n").is_ok());
}

#[test]
fn test_tail_call_emitted() {
    let prog = compile(
        "def f n\nif n <= 0\nreturn 0\nend\nreturn f n - 1\nend\nsay f 5\n",
    )
    .unwrap();
    assert!(has_op(&prog, Op::ReturnTail));
}

#[test]
fn test_mutual_recursion_via_declare() {
    let prog = compile(
        "declare odd\n\
         def even n\nif n == 0\nreturn 1\nend\nreturn odd n - 1\nend\n\
         def odd n\nif n == 0\nreturn nil\nend\nreturn even n - 1\nend\n\
         say even 10\n",
    )
    .unwrap();
    assert!(has_op(&prog, Op::ReturnTail));
}

#[test]
fn test_declare_without_define_errors() {
    assert!(compile("if 1\ndeclare ghost\nend\n").is_err());
}

#[test]
fn test_declared_native() {
    let prog = compile("declare blit 'video.blit'\nblit 1, 2\n").unwrap();
    assert!(has_op(&prog, Op::Native));
    assert_eq!(prog.keys.len(), 1);
    assert_eq!(prog.keys[0], wisp_util::hash64(b"video.blit"));
}

#[test]
fn test_auto_native() {
    let prog = compile("hostthing 1\n").unwrap();
    assert!(has_op(&prog, Op::Native));
    assert_eq!(prog.keys[0], wisp_util::hash64(b"autonative.hostthing"));
}

#[test]
fn test_stdlib_fixed_call() {
    let prog = compile("say num.abs -5\n").unwrap();
    assert!(has_op(&prog, Op::NumAbs));
}

#[test]
fn test_stdlib_too_many_args_errors() {
    assert!(compile("num.abs 1, 2\n").is_err());
}

#[test]
fn test_zero_arg_command_reference_calls() {
    let prog = compile("var r = rand.int\n").unwrap();
    assert!(has_op(&prog, Op::RandInt));
}

#[test]
fn test_namespace_and_using() {
    assert!(compile(
        "namespace game\ndef update\nreturn 1\nend\nend\nusing game\nsay update\n"
    )
    .is_ok());
}

#[test]
fn test_enum_values() {
    assert!(compile("enum red, green = 5, blue\nsay green, blue\n").is_ok());
}

#[test]
fn test_enum_non_constant_errors() {
    assert!(compile("var x = 1\nenum bad = x\n").is_err());
}

// ============================================================================
// COMPILE-TIME FORMS
// ============================================================================

#[test]
fn test_pick_short_circuits() {
    let prog = compile("var x = 1\nsay pick x, 'yes', 'no'\n").unwrap();
    assert!(has_op(&prog, Op::JumpFalse));
    // No Pick opcode exists; it lowers to jumps.
}

#[test]
fn test_embed_reads_resolver() {
    struct OneFile;
    impl EmbedResolver for OneFile {
        fn read(&mut self, path: &[u8]) -> Option<Vec<u8>> {
            (path == b"data.bin").then(|| b"\x01\x02\x03".to_vec())
        }
    }
    let gen = compile_with("var d = embed 'data.bin'\nsay &d\n", &mut OneFile).unwrap();
    assert!(gen.prog.strings.iter().any(|s| s == b"\x01\x02\x03"));
}

#[test]
fn test_embed_missing_file_errors() {
    assert!(compile("var d = embed 'nope.bin'\n").is_err());
}

#[test]
fn test_isnative_resolves_at_compile_time() {
    let mut lexer = Lexer::new(FileId::MAIN, 1);
    let mut toks = Vec::new();
    lexer.push_bytes(b"declare blit 'video.blit'\nsay isnative blit\n", &mut toks);
    lexer.close(&mut toks);
    let mut parser = Parser::new();
    let mut gen = Gen::new(false);
    gen.add_native_hash(wisp_util::hash64(b"video.blit"));
    let mut stmts = Vec::new();
    for (tok, pos) in &toks {
        parser.add(tok, *pos, &mut stmts).unwrap();
        for stmt in stmts.drain(..) {
            gen.add_stmt(&stmt, &mut NoEmbeds).unwrap();
        }
    }
    // Resolved to a constant true; no Native op for the isnative itself.
    assert!(has_op(&gen.prog, Op::NumP8));
    assert!(!has_op(&gen.prog, Op::Native));
}

#[test]
fn test_const_str_hash() {
    let prog = compile("say str.hash 'hello'\n").unwrap();
    // Folded: a 4-element list of constants, no StrHash op.
    assert!(!has_op(&prog, Op::StrHash));
    assert!(has_op(&prog, Op::ListPush));
}

#[test]
fn test_runtime_str_hash() {
    let prog = compile("var s = 'x'\nsay str.hash s\n").unwrap();
    assert!(has_op(&prog, Op::StrHash));
}

// ============================================================================
// SLOT MANAGEMENT
// ============================================================================

#[test]
fn test_temps_are_reused() {
    let gen = compile_with("1 + 2 * 3\n4 + 5 * 6\n7 + 8 * 9\n", &mut NoEmbeds).unwrap();
    // Folding collapses these, so force runtime work instead.
    let gen2 = compile_with(
        "var a = 1\nvar b = 2\na + b * a\na + b * a\na + b * a\n",
        &mut NoEmbeds,
    )
    .unwrap();
    // Two declared variables plus the temps of one expression, not three.
    assert!(gen2.sym.frame_size() <= 5, "frame used {}", gen2.sym.frame_size());
    drop(gen);
}

#[test]
fn test_undefined_name_errors() {
    assert!(compile("say qux + 1\n").is_err());
}

#[test]
fn test_assign_to_undefined_errors() {
    assert!(compile("x = 5\n").is_err());
}

#[test]
fn test_duplicate_var_errors() {
    assert!(compile("var x = 1\nvar x = 2\n").is_err());
}

#[test]
fn test_repl_redefinition_ok() {
    let mut lexer = Lexer::new(FileId::MAIN, 1);
    let mut toks = Vec::new();
    lexer.push_bytes(b"var x = 1\nvar x = 2\n", &mut toks);
    lexer.close(&mut toks);
    let mut parser = Parser::new();
    let mut gen = Gen::new(true);
    let mut stmts = Vec::new();
    for (tok, pos) in &toks {
        parser.add(tok, *pos, &mut stmts).unwrap();
        for stmt in stmts.drain(..) {
            gen.add_stmt(&stmt, &mut NoEmbeds).unwrap();
        }
    }
}

// ============================================================================
// OUTPUT HYGIENE
// ============================================================================

#[test]
fn test_compiled_programs_validate() {
    let sources = [
        "say 1 + 2\n",
        "def f a\nreturn a * 2\nend\nsay f 21\n",
        "var l = {1, 2, 3}\nfor var v, i: l\nsay v, i\nend\n",
        "var s = ''\nfor var v: range 5\ns = s ~ v\nend\nsay s\n",
        "do\nbreak\nend\n",
    ];
    for src in sources {
        compile(src).unwrap_or_else(|e| panic!("{:?}: {}", src, e));
    }
}

#[test]
fn test_positions_recorded() {
    let prog = compile("say 1\nsay 2\n").unwrap();
    assert!(prog.pos_table.len() >= 2);
    assert_eq!(prog.pos_table[0].line, 1);
}

#[test]
fn test_cmd_hints_recorded() {
    let prog = compile("def game.update\nreturn 1\nend\nsay game.update\n").unwrap();
    assert!(prog.debug_strings.iter().any(|s| s == "game.update"));
}
