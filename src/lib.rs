//! A small register-based virtual machine.
//!
//! Programs are raw bytecode images copied into a fixed 64 KiB linear
//! memory and executed by [`Cpu::run`] until an `EXIT` opcode or a
//! [`Fault`]. Fifteen typed registers hold either clamped 16-bit integers
//! or byte-strings; host services (string length, line input, trimming)
//! are reachable through the `TRAP` opcode, and a [`Deadline`] polled once
//! per instruction bounds runaway programs.

pub mod cpu;
pub mod deadline;
pub mod memory;
pub mod opcodes;
pub mod register;
pub mod stack;
pub mod traps;

use thiserror::Error;

pub use cpu::Cpu;
pub use deadline::Deadline;
pub use memory::{Memory, RAM_SIZE};
pub use register::{Register, RegisterFile, Value, ValueKind, NUM_REGISTERS};
pub use stack::Stack;
pub use traps::{TrapFn, TrapTable};

pub type Result<T> = std::result::Result<T, Fault>;

/// Fatal runtime conditions. Any of these unwinds [`Cpu::run`] immediately;
/// side effects already committed to registers, memory, the stack, and the
/// output writer remain observable.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("register index {0} out of range")]
    RegisterOutOfRange(u8),
    #[error("instruction pointer 0x{0:04X} ran beyond the end of RAM")]
    ReadBeyondRam(usize),
    #[error("memory address 0x{0:04X} out of range")]
    AddressOutOfRange(usize),
    #[error("pop from an empty stack")]
    StackUnderflow,
    #[error("division by zero")]
    DivideByZero,
    #[error("type mismatch: register holds a {found} value, expected {expected}")]
    TypeMismatch {
        expected: ValueKind,
        found: ValueKind,
    },
    #[error("failed to parse {0:?} as an integer")]
    ParseError(String),
    #[error("inline string of {0} bytes does not fit in RAM")]
    StringTooLarge(usize),
    #[error("trap function not defined: 0x{0:04X}")]
    TrapUndefined(u16),
    #[error("unrecognized opcode 0x{opcode:02X} at IP 0x{ip:04X}")]
    UnknownOpcode { opcode: u8, ip: usize },
    #[error("execution deadline expired")]
    Timeout,
    #[error("program of {0} bytes too large for RAM")]
    ImageTooLarge(usize),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
