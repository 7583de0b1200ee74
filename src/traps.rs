//! Host-service callbacks reachable through the `TRAP` opcode.
//!
//! The table is owned per engine instance and populated at construction;
//! every unregistered slot holds the same undefined-trap sentinel so
//! dispatch is a plain indexed call.

use crate::cpu::Cpu;
use crate::{Fault, Result};

/// Signature for a host callback. Traps receive the trap number so one
/// function can serve several slots.
pub type TrapFn = fn(&mut Cpu, u16) -> Result<()>;

/// Trap numbers run 0..=0xFFFE.
pub const TRAP_SLOTS: usize = 0xFFFF;

pub struct TrapTable {
    slots: Vec<TrapFn>,
}

impl TrapTable {
    /// An empty table: every slot faults as undefined when invoked.
    pub fn new() -> Self {
        Self {
            slots: vec![undefined; TRAP_SLOTS],
        }
    }

    /// The standard table: `STRLEN`, `READLINE`, and `TRIM` installed at
    /// slots 0..=2.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.register(0, strlen);
        table.register(1, readline);
        table.register(2, trim);
        table
    }

    pub fn register(&mut self, num: u16, handler: TrapFn) {
        if let Some(slot) = self.slots.get_mut(num as usize) {
            *slot = handler;
        }
    }

    /// Handler for `num`; out-of-table numbers resolve to the sentinel.
    pub fn get(&self, num: u16) -> TrapFn {
        self.slots.get(num as usize).copied().unwrap_or(undefined)
    }
}

impl Default for TrapTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn undefined(_cpu: &mut Cpu, num: u16) -> Result<()> {
    Err(Fault::TrapUndefined(num))
}

/// Trap 0: replace the string in register 0 with its byte length.
fn strlen(cpu: &mut Cpu, _num: u16) -> Result<()> {
    let len = cpu.reg(0).get_str()?.len();
    cpu.reg_mut(0).set_int(len as i64);
    Ok(())
}

/// Trap 1: read one line from the host reader into register 0, trailing
/// newline included when present.
fn readline(cpu: &mut Cpu, _num: u16) -> Result<()> {
    let line = cpu.read_line()?;
    cpu.reg_mut(0).set_str(line);
    Ok(())
}

/// Trap 2: strip surrounding whitespace from the string in register 0.
fn trim(cpu: &mut Cpu, _num: u16) -> Result<()> {
    let trimmed = cpu.reg(0).get_str()?.trim_ascii().to_vec();
    cpu.reg_mut(0).set_str(trimmed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes;
    use std::io::Cursor;

    fn trap_program(num: u16) -> Vec<u8> {
        vec![
            opcodes::TRAP,
            (num & 0xFF) as u8,
            (num >> 8) as u8,
            opcodes::EXIT,
        ]
    }

    #[test]
    fn strlen_measures_bytes() {
        let mut cpu = Cpu::new();
        cpu.load_bytes(&trap_program(0)).unwrap();
        cpu.reg_mut(0).set_str(b"hello, world".to_vec());
        cpu.run().unwrap();
        assert_eq!(cpu.reg(0).get_int().unwrap(), 12);
    }

    #[test]
    fn strlen_on_integer_register_faults() {
        let mut cpu = Cpu::new();
        cpu.load_bytes(&trap_program(0)).unwrap();
        assert!(matches!(cpu.run(), Err(Fault::TypeMismatch { .. })));
    }

    #[test]
    fn readline_keeps_the_trailing_newline() {
        let mut cpu = Cpu::new();
        cpu.set_stdin(Cursor::new(b"first line\nsecond\n".to_vec()));
        cpu.load_bytes(&trap_program(1)).unwrap();
        cpu.run().unwrap();
        assert_eq!(cpu.reg(0).get_str().unwrap(), b"first line\n");
    }

    #[test]
    fn readline_at_eof_stores_an_empty_string() {
        let mut cpu = Cpu::new();
        cpu.set_stdin(std::io::empty());
        cpu.load_bytes(&trap_program(1)).unwrap();
        cpu.run().unwrap();
        assert_eq!(cpu.reg(0).get_str().unwrap(), b"");
    }

    #[test]
    fn trim_removes_surrounding_whitespace() {
        let mut cpu = Cpu::new();
        cpu.load_bytes(&trap_program(2)).unwrap();
        cpu.reg_mut(0).set_str(b"  spaced out \t\n".to_vec());
        cpu.run().unwrap();
        assert_eq!(cpu.reg(0).get_str().unwrap(), b"spaced out");
    }

    #[test]
    fn unregistered_slots_fault() {
        let mut cpu = Cpu::new();
        cpu.load_bytes(&trap_program(0x0042)).unwrap();
        assert!(matches!(cpu.run(), Err(Fault::TrapUndefined(0x0042))));
    }

    #[test]
    fn hosts_can_register_their_own_traps() {
        fn double(cpu: &mut Cpu, _num: u16) -> Result<()> {
            let v = cpu.reg(0).get_int()? as i64;
            cpu.reg_mut(0).set_int(v * 2);
            Ok(())
        }

        let mut cpu = Cpu::new();
        cpu.register_trap(9, double);
        cpu.load_bytes(&trap_program(9)).unwrap();
        cpu.reg_mut(0).set_int(21);
        cpu.run().unwrap();
        assert_eq!(cpu.reg(0).get_int().unwrap(), 42);
    }
}
