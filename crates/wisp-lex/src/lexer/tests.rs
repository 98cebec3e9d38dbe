use crate::lexer::Lexer;
use crate::token::{KeySym, Token};
use wisp_util::FileId;

fn lex(source: &str) -> Vec<Token> {
    let mut lexer = Lexer::new(FileId::MAIN, 1);
    let mut out = Vec::new();
    lexer.push_bytes(source.as_bytes(), &mut out);
    lexer.close(&mut out);
    out.into_iter().map(|(t, _)| t).collect()
}

fn key(ks: KeySym) -> Token {
    Token::Key(ks)
}

fn ident(name: &str) -> Token {
    Token::Ident(name.to_string())
}

fn hard() -> Token {
    Token::Newline { soft: false }
}

#[test]
fn test_simple_statement() {
    assert_eq!(
        lex("say 1 + 2"),
        vec![
            ident("say"),
            Token::Num(1.0),
            key(KeySym::Plus),
            Token::Num(2.0),
            hard(),
        ]
    );
}

#[test]
fn test_keywords() {
    assert_eq!(
        lex("if x end"),
        vec![key(KeySym::If), ident("x"), key(KeySym::End), hard()]
    );
}

#[test]
fn test_binary_minus_no_spaces() {
    assert_eq!(
        lex("x-1"),
        vec![ident("x"), key(KeySym::Minus), Token::Num(1.0), hard()]
    );
}

#[test]
fn test_binary_minus_both_spaces() {
    assert_eq!(
        lex("x - 1"),
        vec![ident("x"), key(KeySym::Minus), Token::Num(1.0), hard()]
    );
}

#[test]
fn test_unary_minus_space_before_only() {
    assert_eq!(
        lex("x -1"),
        vec![ident("x"), key(KeySym::UnMinus), Token::Num(1.0), hard()]
    );
}

#[test]
fn test_unary_minus_statement_start() {
    assert_eq!(
        lex("-x"),
        vec![key(KeySym::UnMinus), ident("x"), hard()]
    );
}

#[test]
fn test_unary_after_open_paren() {
    assert_eq!(
        lex("(-1)"),
        vec![
            key(KeySym::LParen),
            key(KeySym::UnMinus),
            Token::Num(1.0),
            key(KeySym::RParen),
            hard(),
        ]
    );
}

#[test]
fn test_compound_assignment_ops() {
    assert_eq!(
        lex("x += 1"),
        vec![ident("x"), key(KeySym::PlusEqu), Token::Num(1.0), hard()]
    );
    assert_eq!(
        lex("x ||= 1"),
        vec![ident("x"), key(KeySym::Pipe2Equ), Token::Num(1.0), hard()]
    );
    assert_eq!(
        lex("x &&= 1"),
        vec![ident("x"), key(KeySym::Amp2Equ), Token::Num(1.0), hard()]
    );
}

#[test]
fn test_basic_string() {
    assert_eq!(
        lex("'hello'"),
        vec![Token::Str(b"hello".to_vec()), hard()]
    );
}

#[test]
fn test_basic_string_doubled_quote() {
    assert_eq!(
        lex("'it''s'"),
        vec![Token::Str(b"it's".to_vec()), hard()]
    );
}

#[test]
fn test_interpolated_plain() {
    // "ab" lowers to ( "ab" ) so the parser sees ordinary tokens.
    assert_eq!(
        lex("\"ab\""),
        vec![
            key(KeySym::LParen),
            Token::Str(b"ab".to_vec()),
            key(KeySym::RParen),
            hard(),
        ]
    );
}

#[test]
fn test_interpolated_ident() {
    assert_eq!(
        lex("\"a$x b\""),
        vec![
            key(KeySym::LParen),
            Token::Str(b"a".to_vec()),
            key(KeySym::Tilde),
            ident("x"),
            key(KeySym::Tilde),
            Token::Str(b" b".to_vec()),
            key(KeySym::RParen),
            hard(),
        ]
    );
}

#[test]
fn test_interpolated_braced_expr() {
    assert_eq!(
        lex("\"n=${1 + 2}\""),
        vec![
            key(KeySym::LParen),
            Token::Str(b"n=".to_vec()),
            key(KeySym::Tilde),
            Token::Num(1.0),
            key(KeySym::Plus),
            Token::Num(2.0),
            key(KeySym::Tilde),
            Token::Str(b"".to_vec()),
            key(KeySym::RParen),
            hard(),
        ]
    );
}

#[test]
fn test_interpolation_nested_braces() {
    // The splice may contain braces of its own.
    let toks = lex("\"${{1, 2}}\"");
    assert!(toks.contains(&key(KeySym::LBrace)));
    assert!(toks.contains(&key(KeySym::RBrace)));
    assert!(!toks.iter().any(|t| matches!(t, Token::Error(_))));
}

#[test]
fn test_escapes() {
    assert_eq!(
        lex("\"a\\n\\x41\\$\""),
        vec![
            key(KeySym::LParen),
            Token::Str(b"a\nA$".to_vec()),
            key(KeySym::RParen),
            hard(),
        ]
    );
}

#[test]
fn test_bad_escape_is_inline_error() {
    let toks = lex("\"a\\q\"");
    assert!(toks.iter().any(|t| matches!(t, Token::Error(_))));
    // Lexing continues after the error.
    assert!(toks.contains(&key(KeySym::RParen)));
}

#[test]
fn test_unterminated_string() {
    let toks = lex("'abc");
    assert!(toks.iter().any(|t| matches!(t, Token::Error(_))));
}

#[test]
fn test_line_comment() {
    assert_eq!(
        lex("1 # comment\n2"),
        vec![Token::Num(1.0), hard(), Token::Num(2.0), hard()]
    );
}

#[test]
fn test_block_comment() {
    assert_eq!(
        lex("1 /* two\nlines */ 2"),
        vec![Token::Num(1.0), Token::Num(2.0), hard()]
    );
}

#[test]
fn test_block_comment_does_not_nest() {
    // The first */ closes the comment, so the second */ is stray input.
    let toks = lex("/* /* */ x");
    assert_eq!(toks[0], ident("x"));
}

#[test]
fn test_unterminated_block_comment() {
    let toks = lex("/* never ends");
    assert!(toks.iter().any(|t| matches!(t, Token::Error(_))));
}

#[test]
fn test_semicolon_is_hard_newline() {
    assert_eq!(
        lex("1; 2"),
        vec![Token::Num(1.0), hard(), Token::Num(2.0), hard()]
    );
}

#[test]
fn test_newline_inside_parens_is_soft() {
    let toks = lex("(1,\n2)");
    assert!(toks.contains(&Token::Newline { soft: true }));
}

#[test]
fn test_backslash_continuation() {
    assert_eq!(
        lex("1 + \\\n2"),
        vec![Token::Num(1.0), key(KeySym::Plus), Token::Num(2.0), hard()]
    );
}

#[test]
fn test_number_bases() {
    assert_eq!(lex("0xFF")[0], Token::Num(255.0));
    assert_eq!(lex("0b101")[0], Token::Num(5.0));
    assert_eq!(lex("0c17")[0], Token::Num(15.0));
    assert_eq!(lex("1e3")[0], Token::Num(1000.0));
    assert_eq!(lex("0x1p4")[0], Token::Num(16.0));
}

#[test]
fn test_invalid_number_is_inline_error() {
    let toks = lex("12z 3");
    assert!(matches!(toks[0], Token::Error(_)));
    assert_eq!(toks[1], Token::Num(3.0));
}

#[test]
fn test_names_path() {
    assert_eq!(
        lex("str.hash"),
        vec![ident("str"), key(KeySym::Period), ident("hash"), hard()]
    );
}

#[test]
fn test_ellipsis() {
    assert_eq!(
        lex("...rest"),
        vec![key(KeySym::Period3), ident("rest"), hard()]
    );
}

#[test]
fn test_positions() {
    let mut lexer = Lexer::new(FileId::MAIN, 1);
    let mut out = Vec::new();
    lexer.push_bytes(b"a\n  b", &mut out);
    lexer.close(&mut out);
    assert_eq!(out[0].1.line, 1);
    assert_eq!(out[0].1.chr, 1);
    // `b` is at line 2, chr 3.
    let b = out.iter().find(|(t, _)| *t == ident("b")).unwrap();
    assert_eq!(b.1.line, 2);
    assert_eq!(b.1.chr, 3);
}

#[test]
fn test_start_line_offset() {
    let mut lexer = Lexer::new(FileId::MAIN, 10);
    let mut out = Vec::new();
    lexer.push_bytes(b"x", &mut out);
    lexer.close(&mut out);
    assert_eq!(out[0].1.line, 10);
}

#[test]
fn test_chunking_determinism_fixed() {
    let src = "def f a, b = 10\n  return a + b # done\nend\nsay f 5, \"v=$x\"\n";
    let whole = lex(src);
    for split in 0..src.len() {
        let mut lexer = Lexer::new(FileId::MAIN, 1);
        let mut out = Vec::new();
        lexer.push_bytes(&src.as_bytes()[..split], &mut out);
        lexer.push_bytes(&src.as_bytes()[split..], &mut out);
        lexer.close(&mut out);
        let toks: Vec<Token> = out.into_iter().map(|(t, _)| t).collect();
        assert_eq!(toks, whole, "differs at split {}", split);
    }
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn chunking_never_changes_tokens(
            src in "[a-z0-9+\\-*/ .'\"{}()\n]{0,40}",
            split in 0usize..40,
        ) {
            let split = split.min(src.len());
            let whole = lex(&src);
            let mut lexer = Lexer::new(FileId::MAIN, 1);
            let mut out = Vec::new();
            lexer.push_bytes(&src.as_bytes()[..split], &mut out);
            lexer.push_bytes(&src.as_bytes()[split..], &mut out);
            lexer.close(&mut out);
            let toks: Vec<Token> = out.into_iter().map(|(t, _)| t).collect();
            prop_assert_eq!(toks, whole);
        }

        #[test]
        fn lexer_never_panics(src in any::<Vec<u8>>()) {
            let mut lexer = Lexer::new(FileId::MAIN, 1);
            let mut out = Vec::new();
            lexer.push_bytes(&src, &mut out);
            lexer.close(&mut out);
        }
    }
}
