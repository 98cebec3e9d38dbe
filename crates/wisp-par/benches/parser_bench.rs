use criterion::{black_box, criterion_group, criterion_main, Criterion};
use wisp_lex::Lexer;
use wisp_par::Parser;
use wisp_util::FileId;

fn bench_parser(c: &mut Criterion) {
    let mut source = String::new();
    for i in 0..200 {
        source.push_str(&format!(
            "def cmd{} a, b = {}\n  if a < b\n    return a * 2 + b\n  end\n  return b\nend\n",
            i, i
        ));
    }

    c.bench_function("parse_1k_statements", |b| {
        b.iter(|| {
            let mut lexer = Lexer::new(FileId::MAIN, 1);
            let mut toks = Vec::new();
            lexer.push_bytes(black_box(source.as_bytes()), &mut toks);
            lexer.close(&mut toks);

            let mut parser = Parser::new();
            let mut out = Vec::new();
            for (tok, pos) in &toks {
                parser.add(tok, *pos, &mut out).unwrap();
            }
            parser.close(&mut out).unwrap();
            out
        })
    });
}

criterion_group!(benches, bench_parser);
criterion_main!(benches);
