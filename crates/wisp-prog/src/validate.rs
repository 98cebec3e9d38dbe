//! Byte-level program validation.
//!
//! The validator decodes every instruction once, bounds-checking each
//! parameter, and records the "alignment class" of every byte: whether an
//! instruction starts there, and whether that instruction is a command
//! head (and at which level). A second pass then checks every recorded
//! jump and call target against those classes. A program that passes is
//! safe to interpret without per-instruction bounds checks beyond the
//! decode itself.

use crate::op::{Op, OpParams, LOC_SENTINEL};
use crate::program::Program;
use wisp_util::{ValidateError, ValidateResult};

#[derive(Clone, Copy, Debug)]
enum NeedKind {
    /// Target must be an instruction boundary (or end of stream).
    Boundary,
    /// Target must be a `CmdHead`.
    Head,
    /// Target must be a `CmdHead` declaring exactly this level.
    HeadAtLevel(u8),
}

struct Need {
    at: usize,
    target: u32,
    kind: NeedKind,
}

struct Scan<'a> {
    prog: &'a Program,
    off: usize,
    /// Level declared by the most recent command head.
    level: u8,
}

impl<'a> Scan<'a> {
    fn u8(&mut self) -> ValidateResult<u8> {
        let b = *self
            .prog
            .ops
            .get(self.off)
            .ok_or(ValidateError::Truncated)?;
        self.off += 1;
        Ok(b)
    }

    fn u32(&mut self) -> ValidateResult<u32> {
        let end = self.off + 4;
        if end > self.prog.ops.len() {
            return Err(ValidateError::Truncated);
        }
        let v = u32::from_le_bytes(self.prog.ops[self.off..end].try_into().unwrap());
        self.off = end;
        Ok(v)
    }

    fn f64(&mut self) -> ValidateResult<()> {
        let end = self.off + 8;
        if end > self.prog.ops.len() {
            return Err(ValidateError::Truncated);
        }
        self.off = end;
        Ok(())
    }

    /// A var reference: frame level then slot index. The level may not
    /// exceed the level of the innermost command head seen so far.
    fn var(&mut self) -> ValidateResult<()> {
        let at = self.off;
        let level = self.u8()?;
        let _index = self.u8()?;
        if level > self.level {
            return Err(ValidateError::BadFrameLevel { offset: at, level });
        }
        Ok(())
    }

    fn vars(&mut self, n: usize) -> ValidateResult<()> {
        for _ in 0..n {
            self.var()?;
        }
        Ok(())
    }

    fn arg_list(&mut self) -> ValidateResult<()> {
        let count = self.u8()? as usize;
        self.vars(count)
    }
}

/// Validate a program's byte stream. See the module docs.
pub fn validate(prog: &Program) -> ValidateResult<()> {
    let len = prog.ops.len();
    let mut boundary = vec![false; len];
    let mut heads: Vec<Option<u8>> = vec![None; len];
    let mut needs: Vec<Need> = Vec::new();

    let mut scan = Scan {
        prog,
        off: 0,
        level: 0,
    };

    while scan.off < len {
        let at = scan.off;
        boundary[at] = true;
        let byte = scan.u8()?;
        let op = Op::from_u8(byte).ok_or(ValidateError::BadOpcode { offset: at, byte })?;

        match op.params() {
            OpParams::None => {}
            OpParams::V => scan.vars(1)?,
            OpParams::VV => scan.vars(2)?,
            OpParams::VVV => scan.vars(3)?,
            OpParams::VVVV => scan.vars(4)?,
            OpParams::VF => {
                scan.var()?;
                scan.f64()?;
            }
            OpParams::VU8 => {
                scan.var()?;
                scan.u8()?;
            }
            OpParams::VS => {
                scan.var()?;
                let index = scan.u32()? as usize;
                if index >= prog.strings.len() {
                    return Err(ValidateError::BadStringIndex {
                        offset: at,
                        index,
                        count: prog.strings.len(),
                    });
                }
            }
            OpParams::U8U8 => {
                let level = scan.u8()?;
                let _restpos = scan.u8()?;
                heads[at] = Some(level);
                scan.level = level;
            }
            OpParams::L => {
                let target = scan.u32()?;
                needs.push(Need {
                    at,
                    target,
                    kind: NeedKind::Boundary,
                });
            }
            OpParams::VL => {
                scan.var()?;
                let target = scan.u32()?;
                needs.push(Need {
                    at,
                    target,
                    kind: NeedKind::Boundary,
                });
            }
            OpParams::Call => {
                scan.var()?;
                let target = scan.u32()?;
                needs.push(Need {
                    at,
                    target,
                    kind: NeedKind::Head,
                });
                scan.arg_list()?;
            }
            OpParams::TailCall => {
                let target = scan.u32()?;
                needs.push(Need {
                    at,
                    target,
                    kind: NeedKind::HeadAtLevel(scan.level),
                });
                scan.arg_list()?;
            }
            OpParams::Native => {
                scan.var()?;
                let index = scan.u32()? as usize;
                if index >= prog.keys.len() {
                    return Err(ValidateError::BadKeyIndex {
                        offset: at,
                        index,
                        count: prog.keys.len(),
                    });
                }
                scan.arg_list()?;
            }
            OpParams::VArgs => {
                scan.var()?;
                scan.arg_list()?;
            }
            OpParams::Args => scan.arg_list()?,
        }
    }

    // Second pass: every recorded need against the actual classes.
    for need in &needs {
        if need.target == LOC_SENTINEL {
            if prog.repl {
                continue;
            }
            return Err(ValidateError::BadJumpTarget {
                offset: need.at,
                target: need.target,
            });
        }
        let t = need.target as usize;
        match need.kind {
            NeedKind::Boundary => {
                // Jumping to end-of-stream halts cleanly.
                let ok = t == len || (t < len && boundary[t]);
                if !ok {
                    return Err(ValidateError::BadJumpTarget {
                        offset: need.at,
                        target: need.target,
                    });
                }
            }
            NeedKind::Head => {
                if t >= len || heads[t].is_none() {
                    return Err(ValidateError::BadCallTarget {
                        offset: need.at,
                        target: need.target,
                    });
                }
            }
            NeedKind::HeadAtLevel(expected) => {
                let found = if t < len { heads[t] } else { None };
                match found {
                    None => {
                        return Err(ValidateError::BadCallTarget {
                            offset: need.at,
                            target: need.target,
                        })
                    }
                    Some(level) if level != expected => {
                        return Err(ValidateError::BadCallLevel {
                            target: need.target,
                            expected,
                            found: level,
                        })
                    }
                    Some(_) => {}
                }
            }
        }
    }

    // Debug tables must be sorted by pc so lookups can bisect.
    for (i, w) in prog.pos_table.windows(2).enumerate() {
        if w[0].pc > w[1].pc {
            return Err(ValidateError::BadDebugEntry { index: i + 1 });
        }
    }
    for (i, w) in prog.cmd_table.windows(2).enumerate() {
        if w[0].pc > w[1].pc {
            return Err(ValidateError::BadDebugEntry { index: i + 1 });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Op;

    fn prog_with(ops: Vec<u8>) -> Program {
        let mut p = Program::new(false);
        p.ops = ops;
        p
    }

    #[test]
    fn test_empty_program_valid() {
        assert!(validate(&prog_with(vec![])).is_ok());
    }

    #[test]
    fn test_simple_ops_valid() {
        // nil 0:0 ; move 0:1 <- 0:0
        let p = prog_with(vec![Op::Nil as u8, 0, 0, Op::Move as u8, 0, 1, 0, 0]);
        assert!(validate(&p).is_ok());
    }

    #[test]
    fn test_unknown_opcode() {
        let p = prog_with(vec![0xEE]);
        assert_eq!(
            validate(&p),
            Err(ValidateError::BadOpcode {
                offset: 0,
                byte: 0xEE
            })
        );
    }

    #[test]
    fn test_truncated_params() {
        let p = prog_with(vec![Op::Move as u8, 0]);
        assert_eq!(validate(&p), Err(ValidateError::Truncated));
    }

    #[test]
    fn test_bad_string_index() {
        let p = prog_with(vec![Op::Str as u8, 0, 0, 5, 0, 0, 0]);
        assert!(matches!(
            validate(&p),
            Err(ValidateError::BadStringIndex { index: 5, .. })
        ));
    }

    #[test]
    fn test_jump_into_middle_of_instruction() {
        // jump to offset 2, which is inside the jump's own parameters
        let p = prog_with(vec![Op::Jump as u8, 2, 0, 0, 0]);
        assert!(matches!(
            validate(&p),
            Err(ValidateError::BadJumpTarget { target: 2, .. })
        ));
    }

    #[test]
    fn test_jump_to_end_is_valid() {
        let p = prog_with(vec![Op::Jump as u8, 5, 0, 0, 0]);
        assert!(validate(&p).is_ok());
    }

    #[test]
    fn test_call_must_target_cmdhead() {
        // call targeting a Nop
        let p = prog_with(vec![
            Op::Call as u8,
            0,
            0, // result var
            6,
            0,
            0,
            0, // target = 6 (valid boundary, but Nop)
            0, // no args
            Op::Nop as u8,
        ]);
        assert!(matches!(
            validate(&p),
            Err(ValidateError::BadCallTarget { target: 6, .. })
        ));
    }

    #[test]
    fn test_call_to_cmdhead_is_valid() {
        let p = prog_with(vec![
            Op::Jump as u8,
            12,
            0,
            0,
            0, // skip the body
            Op::CmdHead as u8,
            1,
            0xFF,
            Op::Return as u8,
            1,
            0, // return var at the head's level
            Op::Nop as u8,
            // pc 12: top level again
            Op::Call as u8,
            0,
            0,
            5,
            0,
            0,
            0,
            0,
        ]);
        assert!(validate(&p).is_ok());
    }

    #[test]
    fn test_var_level_above_cmdhead_rejected() {
        // top-level code referencing frame level 3
        let p = prog_with(vec![Op::Nil as u8, 3, 0]);
        assert!(matches!(
            validate(&p),
            Err(ValidateError::BadFrameLevel { level: 3, .. })
        ));
    }

    #[test]
    fn test_sentinel_rejected_outside_repl() {
        let p = prog_with(vec![Op::Jump as u8, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(validate(&p).is_err());
    }

    #[test]
    fn test_sentinel_allowed_in_repl() {
        let mut p = prog_with(vec![Op::Jump as u8, 0xFF, 0xFF, 0xFF, 0xFF]);
        p.repl = true;
        assert!(validate(&p).is_ok());
    }

    #[test]
    fn test_native_key_bounds() {
        let mut p = prog_with(vec![Op::Native as u8, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(
            validate(&p),
            Err(ValidateError::BadKeyIndex { .. })
        ));
        p.keys.push(99);
        assert!(validate(&p).is_ok());
    }
}
