//! REPL-mode behavior: incremental compilation against a live context,
//! redefinition, error recovery, continuation prompts.

use std::rc::Rc;
use wisp::{run_with, Collector, Context, RunResult, Script};

struct Repl {
    script: Script,
    ctx: Context,
    host: Collector,
}

impl Repl {
    fn new() -> Self {
        let script = Script::new(true);
        let ctx = Context::new(Rc::new(script.program()));
        Self {
            script,
            ctx,
            host: Collector::default(),
        }
    }

    /// One prompt round: feed a line, recompile, run to the edge.
    fn line(&mut self, src: &str) -> RunResult {
        self.script.write(src.as_bytes()).expect("compile error");
        self.ctx.update_program(Rc::new(self.script.program()));
        run_with(&mut self.ctx, &mut self.host)
    }

    fn said(&self) -> Vec<String> {
        self.host
            .said
            .iter()
            .map(|l| String::from_utf8_lossy(l).into_owned())
            .collect()
    }
}

#[test]
fn test_definitions_accumulate() {
    let mut repl = Repl::new();
    assert_eq!(repl.line("var x = 1\n"), RunResult::ReplMore);
    assert_eq!(repl.line("x = x + 10\n"), RunResult::ReplMore);
    assert_eq!(repl.line("say x\n"), RunResult::ReplMore);
    assert_eq!(repl.said(), vec!["11"]);
}

#[test]
fn test_command_defined_then_called() {
    let mut repl = Repl::new();
    repl.line("def f a\nreturn a * 2\nend\n");
    repl.line("say f 21\n");
    assert_eq!(repl.said(), vec!["42"]);
}

#[test]
fn test_redefinition_replaces() {
    let mut repl = Repl::new();
    repl.line("def f\nreturn 1\nend\n");
    repl.line("say f\n");
    repl.line("def f\nreturn 2\nend\n");
    repl.line("say f\n");
    assert_eq!(repl.said(), vec!["1", "2"]);
}

#[test]
fn test_level_reports_open_blocks() {
    let mut script = Script::new(true);
    script.write(b"if 1\n").unwrap();
    assert_eq!(script.level(), 1);
    script.write(b"do\n").unwrap();
    assert_eq!(script.level(), 2);
    script.write(b"end\nend\n").unwrap();
    assert_eq!(script.level(), 0);
}

#[test]
fn test_block_compiles_when_closed() {
    let mut repl = Repl::new();
    assert_eq!(repl.line("for var v: range 2\n"), RunResult::ReplMore);
    // Nothing runs until the block closes.
    assert!(repl.said().is_empty());
    repl.line("say v\n");
    repl.line("end\n");
    assert_eq!(repl.said(), vec!["0", "1"]);
}

#[test]
fn test_error_resets_statement_and_continues() {
    let mut repl = Repl::new();
    assert!(repl.script.write(b"say 1 +\n").is_err());
    // The REPL does not latch; the next line compiles and runs.
    assert_eq!(repl.line("say 2\n"), RunResult::ReplMore);
    assert_eq!(repl.said(), vec!["2"]);
}

#[test]
fn test_forward_call_waits_for_definition() {
    let mut repl = Repl::new();
    repl.line("declare f\n");
    // Calling a declared-but-undefined command hits the back-patch
    // sentinel and asks for more input instead of failing.
    assert_eq!(repl.line("say f\n"), RunResult::ReplMore);
    assert!(repl.said().is_empty());
    assert_eq!(repl.line("def f\nreturn 7\nend\n"), RunResult::ReplMore);
    assert_eq!(repl.said(), vec!["7"]);
}

#[test]
fn test_batch_mode_latches_errors() {
    let mut script = Script::new(false);
    assert!(script.write(b"say 1 +\n").is_err());
    // Latched: even valid input is refused now.
    assert!(script.write(b"say 2\n").is_err());
    assert!(script.err().is_some());
}
