//! VM tests over hand-assembled bytecode. End-to-end tests that go
//! through the compiler live in the `wisp` crate.

use crate::context::{Context, CtxStatus, Effect, RunResult};
use crate::value::Value;
use std::rc::Rc;
use wisp_prog::{Op, Program};

struct Asm {
    prog: Program,
}

impl Asm {
    fn new() -> Self {
        Self {
            prog: Program::new(false),
        }
    }

    fn op(&mut self, op: Op) -> &mut Self {
        self.prog.ops.push(op as u8);
        self
    }

    fn v(&mut self, level: u8, index: u8) -> &mut Self {
        self.prog.ops.push(level);
        self.prog.ops.push(index);
        self
    }

    fn b(&mut self, byte: u8) -> &mut Self {
        self.prog.ops.push(byte);
        self
    }

    fn loc(&mut self, loc: u32) -> &mut Self {
        self.prog.ops.extend_from_slice(&loc.to_le_bytes());
        self
    }

    fn ctx(self) -> Context {
        wisp_prog::validate(&self.prog).expect("test program must validate");
        Context::new(Rc::new(self.prog))
    }
}

#[test]
fn test_constants_and_arithmetic() {
    let mut a = Asm::new();
    a.op(Op::NumP8).v(0, 0).b(5);
    a.op(Op::NumP8).v(0, 1).b(7);
    a.op(Op::Add).v(0, 2).v(0, 0).v(0, 1);
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Pass);
    assert!(ctx.peek(0, 2).unwrap().equals(&Value::Num(12.0)));
}

#[test]
fn test_negative_byte_constant() {
    let mut a = Asm::new();
    a.op(Op::NumN8).v(0, 0).b(9);
    let mut ctx = a.ctx();
    ctx.run();
    assert!(ctx.peek(0, 0).unwrap().equals(&Value::Num(-9.0)));
}

#[test]
fn test_broadcast_over_lists() {
    // {1,2} + 10 = {11,12}
    let mut a = Asm::new();
    a.op(Op::List).v(0, 0).b(2);
    a.op(Op::NumP8).v(0, 1).b(1);
    a.op(Op::ListPush).v(0, 0).v(0, 0).v(0, 1);
    a.op(Op::NumP8).v(0, 1).b(2);
    a.op(Op::ListPush).v(0, 0).v(0, 0).v(0, 1);
    a.op(Op::NumP8).v(0, 1).b(10);
    a.op(Op::Add).v(0, 2).v(0, 0).v(0, 1);
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Pass);
    let rendered = ctx.render(&ctx.peek(0, 2).unwrap());
    assert_eq!(rendered, b"{11, 12}");
}

#[test]
fn test_division_is_ieee() {
    let mut a = Asm::new();
    a.op(Op::NumP8).v(0, 0).b(1);
    a.op(Op::NumP8).v(0, 1).b(0);
    a.op(Op::Div).v(0, 2).v(0, 0).v(0, 1);
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Pass);
    match ctx.peek(0, 2).unwrap() {
        Value::Num(n) => assert!(n.is_infinite()),
        other => panic!("expected number, got {:?}", other),
    }
}

#[test]
fn test_type_error_aborts_with_position() {
    let mut a = Asm::new();
    let s = a.prog.add_string(b"oops".to_vec());
    a.prog.add_debug_string("test.wisp");
    a.prog.add_pos(0, 3, 7, 0);
    a.op(Op::Str).v(0, 0).loc(s);
    a.op(Op::NumP8).v(0, 1).b(1);
    a.op(Op::Add).v(0, 2).v(0, 0).v(0, 1);
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Fail);
    assert_eq!(ctx.status(), CtxStatus::Failed);
    let err = ctx.err().unwrap();
    assert!(err.contains("test.wisp:3:7"), "got {:?}", err);
    assert!(err.contains("expecting number"));
    // Failure is latched.
    assert_eq!(ctx.run(), RunResult::Fail);
}

#[test]
fn test_call_and_return() {
    // jump over body; body doubles its argument; call with 21
    let mut a = Asm::new();
    a.op(Op::Jump).loc(18);
    // pc 5: cmdhead level 1
    a.op(Op::CmdHead).b(1).b(0xFF);
    a.op(Op::Add).v(1, 1).v(1, 0).v(1, 0);
    a.op(Op::Return).v(1, 1);
    // pc 18: top level
    a.op(Op::NumP8).v(0, 0).b(21);
    a.op(Op::Call).v(0, 1).loc(5).b(1).v(0, 0);
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Pass);
    assert!(ctx.peek(0, 1).unwrap().equals(&Value::Num(42.0)));
}

#[test]
fn test_rest_argument_collection() {
    let mut a = Asm::new();
    a.op(Op::Jump).loc(11);
    // pc 5: command with rest at slot 1
    a.op(Op::CmdHead).b(1).b(1);
    a.op(Op::Return).v(1, 1);
    // pc 11:
    a.op(Op::NumP8).v(0, 0).b(1);
    a.op(Op::NumP8).v(0, 1).b(2);
    a.op(Op::NumP8).v(0, 2).b(3);
    a.op(Op::Call)
        .v(0, 3)
        .loc(5)
        .b(3)
        .v(0, 0)
        .v(0, 1)
        .v(0, 2);
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Pass);
    let rendered = ctx.render(&ctx.peek(0, 3).unwrap());
    assert_eq!(rendered, b"{2, 3}");
}

#[test]
fn test_timeout_preserves_state() {
    // x = 0; loop: x = x + 1 forever
    let mut a = Asm::new();
    a.op(Op::NumP8).v(0, 0).b(0);
    a.op(Op::NumP8).v(0, 1).b(1);
    // pc 8:
    a.op(Op::Add).v(0, 0).v(0, 0).v(0, 1);
    a.op(Op::Jump).loc(8);
    let mut ctx = a.ctx();
    ctx.set_timeout(100);
    assert_eq!(ctx.run(), RunResult::Timeout);
    let first = match ctx.peek(0, 0).unwrap() {
        Value::Num(n) => n,
        _ => panic!(),
    };
    assert!(first > 0.0);
    assert_eq!(ctx.run(), RunResult::Timeout);
    let second = match ctx.peek(0, 0).unwrap() {
        Value::Num(n) => n,
        _ => panic!(),
    };
    assert!(second > first);
}

#[test]
fn test_force_timeout() {
    let mut a = Asm::new();
    a.op(Op::Jump).loc(0);
    let mut ctx = a.ctx();
    ctx.set_timeout(1_000_000);
    ctx.force_timeout();
    assert_eq!(ctx.run(), RunResult::Timeout);
}

#[test]
fn test_say_suspends_and_resumes() {
    let mut a = Asm::new();
    a.op(Op::NumP8).v(0, 0).b(3);
    a.op(Op::Say).v(0, 1).b(1).v(0, 0);
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Waiting);
    assert_eq!(ctx.status(), CtxStatus::Waiting);
    match ctx.pending() {
        Some(Effect::Say(text)) => assert_eq!(text, b"3"),
        other => panic!("expected say effect, got {:?}", other),
    }
    // Re-running while waiting is a host error, not progress.
    assert_eq!(ctx.run(), RunResult::Waiting);
    ctx.resume(Value::Nil).unwrap();
    assert_eq!(ctx.run(), RunResult::Pass);
}

#[test]
fn test_native_effect_carries_args() {
    let mut a = Asm::new();
    let key = a.prog.add_key(0xABCD);
    a.op(Op::NumP8).v(0, 0).b(7);
    a.op(Op::Native).v(0, 1).loc(key).b(1).v(0, 0);
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Waiting);
    match ctx.pending() {
        Some(Effect::Native { hash, args }) => {
            assert_eq!(*hash, 0xABCD);
            assert_eq!(args.len(), 1);
        }
        other => panic!("expected native effect, got {:?}", other),
    }
    ctx.resume(Value::Num(99.0)).unwrap();
    assert_eq!(ctx.run(), RunResult::Pass);
    assert!(ctx.peek(0, 1).unwrap().equals(&Value::Num(99.0)));
}

#[test]
fn test_abort_formats_trace() {
    let mut a = Asm::new();
    let s = a.prog.add_string(b"boom".to_vec());
    a.op(Op::Str).v(0, 0).loc(s);
    a.op(Op::Abort).b(1).v(0, 0);
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Fail);
    assert!(ctx.err().unwrap().contains("boom"));
}

#[test]
fn test_abort_without_message() {
    let mut a = Asm::new();
    a.op(Op::Abort).b(0);
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Fail);
}

#[test]
fn test_exit_without_args_passes() {
    let mut a = Asm::new();
    a.op(Op::Exit).b(0);
    a.op(Op::Abort).b(0); // never reached
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Pass);
}

#[test]
fn test_repl_sentinel_requests_more() {
    let mut a = Asm::new();
    a.prog.repl = true;
    a.op(Op::Jump).loc(0xFFFF_FFFF);
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::ReplMore);
    // The pc rewound; running again asks again.
    assert_eq!(ctx.run(), RunResult::ReplMore);
}

#[test]
fn test_getat_negative_and_out_of_range() {
    let mut a = Asm::new();
    a.op(Op::List).v(0, 0).b(1);
    a.op(Op::NumP8).v(0, 1).b(5);
    a.op(Op::ListPush).v(0, 0).v(0, 0).v(0, 1);
    a.op(Op::NumN8).v(0, 1).b(1);
    a.op(Op::GetAt).v(0, 2).v(0, 0).v(0, 1); // l[-1]
    a.op(Op::NumP8).v(0, 1).b(9);
    a.op(Op::GetAt).v(0, 3).v(0, 0).v(0, 1); // l[9] -> nil
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Pass);
    assert!(ctx.peek(0, 2).unwrap().equals(&Value::Num(5.0)));
    assert!(ctx.peek(0, 3).unwrap().equals(&Value::Nil));
}

#[test]
fn test_setat_extends_with_nil() {
    let mut a = Asm::new();
    a.op(Op::List).v(0, 0).b(0);
    a.op(Op::NumP8).v(0, 1).b(2); // index 2
    a.op(Op::NumP8).v(0, 2).b(7);
    a.op(Op::SetAt).v(0, 0).v(0, 1).v(0, 2);
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Pass);
    let rendered = ctx.render(&ctx.peek(0, 0).unwrap());
    assert_eq!(rendered, b"{nil, nil, 7}");
}

#[test]
fn test_cat_joins_lists_or_strings() {
    let mut a = Asm::new();
    let s1 = a.prog.add_string(b"ab".to_vec());
    a.op(Op::Str).v(0, 0).loc(s1);
    a.op(Op::NumP8).v(0, 1).b(3);
    a.op(Op::Cat).v(0, 2).b(2).v(0, 0).v(0, 1);
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Pass);
    assert_eq!(ctx.render(&ctx.peek(0, 2).unwrap()), b"ab3");
}

#[test]
fn test_string_constants_are_interned() {
    let mut a = Asm::new();
    let s = a.prog.add_string(b"shared".to_vec());
    a.op(Op::Str).v(0, 0).loc(s);
    a.op(Op::Str).v(0, 1).loc(s);
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Pass);
    match (ctx.peek(0, 0).unwrap(), ctx.peek(0, 1).unwrap()) {
        (Value::Str(a), Value::Str(b)) => assert!(Rc::ptr_eq(&a, &b)),
        _ => panic!("expected strings"),
    }
}

#[test]
fn test_stdlib_int_div_by_zero_is_zero() {
    let mut a = Asm::new();
    a.op(Op::NumP8).v(0, 0).b(9);
    a.op(Op::NumP8).v(0, 1).b(0);
    a.op(Op::IntDiv).v(0, 2).v(0, 0).v(0, 1);
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Pass);
    assert!(ctx.peek(0, 2).unwrap().equals(&Value::Num(0.0)));
}

#[test]
fn test_stdlib_str_hash_known_vector() {
    let mut a = Asm::new();
    let s = a.prog.add_string(b"hello".to_vec());
    a.op(Op::Str).v(0, 0).loc(s);
    a.op(Op::Nil).v(0, 1);
    a.op(Op::StrHash).v(0, 2).v(0, 0).v(0, 1);
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Pass);
    let rendered = ctx.render(&ctx.peek(0, 2).unwrap());
    // MurmurHash3_x64_128("hello", 0), four 32-bit words low to high.
    assert_eq!(
        rendered,
        format!(
            "{{{}, {}, {}, {}}}",
            0x41bd9b02u32, 0xcbd8a7b3u32, 0x48ae1d19u32, 0x5b1e906au32
        )
        .as_bytes()
    );
}

#[test]
fn test_usertype_payload_round_trip() {
    let mut a = Asm::new();
    a.op(Op::List).v(0, 0).b(0);
    let mut ctx = a.ctx();
    assert_eq!(ctx.run(), RunResult::Pass);
    let list = match ctx.peek(0, 0).unwrap() {
        Value::List(r) => r,
        _ => panic!("expected list"),
    };
    let sprite = ctx.add_usertype("sprite");
    let other = ctx.add_usertype("tilemap");
    ctx.set_user(list, sprite, Rc::new(1234u32));
    let payload = ctx.get_user(list, sprite).unwrap();
    assert_eq!(*payload.downcast::<u32>().unwrap(), 1234);
    assert!(ctx.get_user(list, other).is_none());
}
