//! Host-side interfaces: include resolution and the I/O callback trio.

use wisp_vm::{Context, Effect, RunResult, Value};

/// What the filesystem says about an include path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsType {
    None,
    File,
    Dir,
}

/// Resolves `include` and `embed` paths at compile time. The core never
/// touches the filesystem itself; the embedder decides what a path means.
pub trait IncludeResolver {
    fn fs_type(&mut self, path: &[u8]) -> FsType;
    fn read(&mut self, path: &[u8]) -> Option<Vec<u8>>;
}

/// Resolver for scripts with no includes.
pub struct NoIncludes;

impl IncludeResolver for NoIncludes {
    fn fs_type(&mut self, _path: &[u8]) -> FsType {
        FsType::None
    }

    fn read(&mut self, _path: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// A host callback's answer: a value now, or a promise to call
/// [`Context::resume`] later.
#[derive(Debug)]
pub enum HostReply {
    Done(Value),
    Pending,
}

/// The say/warn/ask trio plus native command dispatch. All methods have
/// do-nothing defaults; a silent host is a valid host.
pub trait Host {
    fn say(&mut self, text: &[u8]) -> HostReply {
        let _ = text;
        HostReply::Done(Value::Nil)
    }

    fn warn(&mut self, text: &[u8]) -> HostReply {
        let _ = text;
        HostReply::Done(Value::Nil)
    }

    fn ask(&mut self, text: &[u8]) -> HostReply {
        let _ = text;
        HostReply::Done(Value::Nil)
    }

    /// A native command identified by the 64-bit hash of its qualified
    /// name. The context is available for building result lists.
    fn native(&mut self, hash: u64, args: Vec<Value>, ctx: &mut Context) -> HostReply {
        let _ = (hash, args, ctx);
        HostReply::Done(Value::Nil)
    }
}

/// Host that collects `say`/`warn` lines; the workhorse of tests.
#[derive(Default)]
pub struct Collector {
    pub said: Vec<Vec<u8>>,
    pub warned: Vec<Vec<u8>>,
    /// Queued replies for `ask`.
    pub answers: Vec<Value>,
}

impl Host for Collector {
    fn say(&mut self, text: &[u8]) -> HostReply {
        self.said.push(text.to_vec());
        HostReply::Done(Value::Nil)
    }

    fn warn(&mut self, text: &[u8]) -> HostReply {
        self.warned.push(text.to_vec());
        HostReply::Done(Value::Nil)
    }

    fn ask(&mut self, _text: &[u8]) -> HostReply {
        HostReply::Done(if self.answers.is_empty() {
            Value::Nil
        } else {
            self.answers.remove(0)
        })
    }
}

/// Drive a context, dispatching effects to the host until the script
/// finishes, times out, or the host goes pending.
pub fn run_with(ctx: &mut Context, host: &mut dyn Host) -> RunResult {
    loop {
        match ctx.run() {
            RunResult::Waiting => {
                let effect = ctx.pending().cloned().expect("waiting without effect");
                let reply = match effect {
                    Effect::Say(text) => host.say(&text),
                    Effect::Warn(text) => host.warn(&text),
                    Effect::Ask(text) => host.ask(&text),
                    Effect::Native { hash, args } => host.native(hash, args, ctx),
                };
                match reply {
                    HostReply::Done(v) => {
                        ctx.resume(v).expect("context must be waiting");
                    }
                    HostReply::Pending => return RunResult::Waiting,
                }
            }
            other => return other,
        }
    }
}
