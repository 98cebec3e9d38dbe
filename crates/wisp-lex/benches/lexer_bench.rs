use criterion::{black_box, criterion_group, criterion_main, Criterion};
use wisp_lex::Lexer;
use wisp_util::FileId;

fn bench_lexer(c: &mut Criterion) {
    let mut source = String::new();
    for i in 0..200 {
        source.push_str(&format!(
            "def cmd{} a, b = {}\n  return a * b + {}\nend\nsay cmd{} 2, \"v=${{a}}\"\n",
            i, i, i, i
        ));
    }

    c.bench_function("lex_1k_statements", |b| {
        b.iter(|| {
            let mut lexer = Lexer::new(FileId::MAIN, 1);
            let mut out = Vec::new();
            lexer.push_bytes(black_box(source.as_bytes()), &mut out);
            lexer.close(&mut out);
            out
        })
    });

    c.bench_function("lex_byte_at_a_time", |b| {
        b.iter(|| {
            let mut lexer = Lexer::new(FileId::MAIN, 1);
            let mut out = Vec::new();
            for &byte in source.as_bytes() {
                lexer.push(black_box(byte), &mut out);
            }
            lexer.close(&mut out);
            out
        })
    });
}

criterion_group!(benches, bench_lexer);
criterion_main!(benches);
