//! Shared helpers for the integration suites.
#![allow(dead_code)]

use wisp::{run_with, Collector, RunResult, Script};

/// Compile a complete source text, panicking on compile errors.
pub fn compile(source: &str) -> Script {
    let mut script = Script::new(false);
    script
        .write(source.as_bytes())
        .unwrap_or_else(|e| panic!("compile error: {}", e));
    script
        .close()
        .unwrap_or_else(|e| panic!("compile error: {}", e));
    script
}

/// Compile and run to completion with a collecting host.
pub fn run(source: &str) -> (RunResult, Collector) {
    let script = compile(source);
    let mut ctx = script.context();
    let mut host = Collector::default();
    let result = run_with(&mut ctx, &mut host);
    (result, host)
}

/// Run a script that must pass; returns the `say` lines as strings.
pub fn said(source: &str) -> Vec<String> {
    let script = compile(source);
    let mut ctx = script.context();
    let mut host = Collector::default();
    let result = run_with(&mut ctx, &mut host);
    assert_eq!(
        result,
        RunResult::Pass,
        "script failed: {:?}",
        ctx.err()
    );
    host.said
        .iter()
        .map(|l| String::from_utf8_lossy(l).into_owned())
        .collect()
}

/// Run a script that must fail; returns the error text.
pub fn failed(source: &str) -> String {
    let script = compile(source);
    let mut ctx = script.context();
    let mut host = Collector::default();
    let result = run_with(&mut ctx, &mut host);
    assert_eq!(result, RunResult::Fail, "expected failure");
    ctx.err().unwrap_or("").to_string()
}
