//! The execution engine: fetch/decode/dispatch loop, program loader, and
//! host I/O binding.
//!
//! One `Cpu` owns the full machine state. [`Cpu::run`] executes the loaded
//! image until an `EXIT` opcode or a fault; every decoded instruction first
//! passes the instruction-pointer bounds check and the deadline poll.

use std::env;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

use rand::Rng;

use crate::deadline::Deadline;
use crate::memory::{Memory, RAM_SIZE};
use crate::opcodes;
use crate::register::{Register, RegisterFile, Value, ValueKind, NUM_REGISTERS};
use crate::stack::Stack;
use crate::traps::{TrapFn, TrapTable};
use crate::{Fault, Result};

/// Condition codes. There is exactly one: the zero-flag.
#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    z: bool,
}

/// Diagnostic tracing is enabled by a truthy `DEBUG` environment variable.
fn debug_enabled() -> bool {
    static DEBUG: OnceLock<bool> = OnceLock::new();
    *DEBUG.get_or_init(|| env::var("DEBUG").is_ok_and(|v| !v.is_empty() && v != "0"))
}

pub struct Cpu {
    regs: RegisterFile,
    flags: Flags,
    mem: Memory,
    ip: usize,
    stack: Stack,
    traps: TrapTable,
    input: Box<dyn BufRead>,
    output: Box<dyn Write>,
    deadline: Option<Deadline>,
    system_enabled: bool,
}

impl Cpu {
    /// A fresh engine with the standard traps, reading the process stdin and
    /// writing the process stdout.
    pub fn new() -> Self {
        Self {
            regs: RegisterFile::new(),
            flags: Flags::default(),
            mem: Memory::new(),
            ip: 0,
            stack: Stack::new(),
            traps: TrapTable::with_defaults(),
            input: Box::new(BufReader::new(io::stdin())),
            output: Box::new(io::stdout()),
            deadline: None,
            system_enabled: false,
        }
    }

    /// Clear registers, stack, flags, and the instruction pointer. Memory is
    /// left alone; the loaders zero it.
    pub fn reset(&mut self) {
        self.regs.reset();
        self.stack.clear();
        self.flags = Flags::default();
        self.ip = 0;
    }

    /// Reset the machine and copy `data` into memory at address 0.
    pub fn load_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.reset();
        self.mem.load_image(data)
    }

    /// Read a bytecode image from `path` and load it.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let data = fs::read(path)?;
        self.load_bytes(&data)
    }

    /// Install a cancellation signal polled once per decoded instruction.
    pub fn set_deadline(&mut self, deadline: Deadline) {
        self.deadline = Some(deadline);
    }

    /// Rebind the input consumed by `READLINE`.
    pub fn set_stdin(&mut self, reader: impl BufRead + 'static) {
        self.input = Box::new(reader);
    }

    /// Rebind the output written by the print opcodes and traps.
    pub fn set_stdout(&mut self, writer: impl Write + 'static) {
        self.output = Box::new(writer);
    }

    /// Allow `STRING_SYSTEM` to spawn host processes. Off by default; while
    /// off the opcode decodes its operand and does nothing.
    pub fn set_system_enabled(&mut self, enabled: bool) {
        self.system_enabled = enabled;
    }

    /// Install a host callback at trap slot `num`.
    pub fn register_trap(&mut self, num: u16, handler: TrapFn) {
        self.traps.register(num, handler);
    }

    /// Panics when `idx >= NUM_REGISTERS`.
    pub fn reg(&self, idx: usize) -> &Register {
        self.regs.get(idx)
    }

    /// Panics when `idx >= NUM_REGISTERS`.
    pub fn reg_mut(&mut self, idx: usize) -> &mut Register {
        self.regs.get_mut(idx)
    }

    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn flag_z(&self) -> bool {
        self.flags.z
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub(crate) fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        self.input.read_until(b'\n', &mut line)?;
        Ok(line)
    }

    fn fetch_byte(&mut self) -> Result<u8> {
        if self.ip >= RAM_SIZE {
            return Err(Fault::ReadBeyondRam(self.ip));
        }
        let byte = self.mem.read(self.ip)?;
        self.ip += 1;
        Ok(byte)
    }

    fn fetch_reg(&mut self) -> Result<usize> {
        let idx = self.fetch_byte()?;
        if (idx as usize) >= NUM_REGISTERS {
            return Err(Fault::RegisterOutOfRange(idx));
        }
        Ok(idx as usize)
    }

    fn fetch_reg3(&mut self) -> Result<(usize, usize, usize)> {
        let a = self.fetch_reg()?;
        let b = self.fetch_reg()?;
        let c = self.fetch_reg()?;
        Ok((a, b, c))
    }

    /// Little-endian 16-bit immediate, low byte first.
    fn fetch_imm16(&mut self) -> Result<u16> {
        let lo = self.fetch_byte()? as u16;
        let hi = self.fetch_byte()? as u16;
        Ok(lo | (hi << 8))
    }

    /// Length-prefixed string literal. The body is read with wrap-to-zero at
    /// the end of RAM; the prefix itself is bounds-checked like any operand.
    fn fetch_str16(&mut self) -> Result<Vec<u8>> {
        let len = self.fetch_imm16()? as usize;
        if len >= RAM_SIZE {
            return Err(Fault::StringTooLarge(len));
        }
        let mut bytes = Vec::with_capacity(len);
        for i in 0..len {
            bytes.push(self.mem.read_wrapping(self.ip + i));
        }
        self.ip += len;
        Ok(bytes)
    }

    /// Execute the loaded program until `EXIT` or a fault.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if self.ip >= RAM_SIZE {
                return Err(Fault::ReadBeyondRam(self.ip));
            }
            if let Some(deadline) = &self.deadline {
                if deadline.expired() {
                    return Err(Fault::Timeout);
                }
            }

            let opcode = self.mem.read(self.ip)?;
            if debug_enabled() {
                eprintln!(
                    "[vm] ip=0x{:04X} opcode=0x{:02X} {}",
                    self.ip,
                    opcode,
                    opcodes::mnemonic(opcode)
                );
            }
            self.ip += 1;

            match opcode {
                opcodes::EXIT => {
                    self.output.flush()?;
                    return Ok(());
                }

                opcodes::INT_STORE => {
                    let reg = self.fetch_reg()?;
                    let val = self.fetch_imm16()?;
                    self.regs.get_mut(reg).set_int(val as i64);
                }

                opcodes::INT_PRINT => {
                    let reg = self.fetch_reg()?;
                    let val = self.regs.get(reg).get_int()?;
                    if val < 0x100 {
                        write!(self.output, "{val:02X}")?;
                    } else {
                        write!(self.output, "{val:04X}")?;
                    }
                    self.output.flush()?;
                }

                opcodes::INT_TOSTRING => {
                    let reg = self.fetch_reg()?;
                    let val = self.regs.get(reg).get_int()?;
                    self.regs.get_mut(reg).set_str(val.to_string().into_bytes());
                }

                opcodes::INT_RANDOM => {
                    let reg = self.fetch_reg()?;
                    let val: u16 = rand::thread_rng().gen_range(0..0xFFFF);
                    self.regs.get_mut(reg).set_int(val as i64);
                }

                opcodes::JUMP_TO => {
                    let addr = self.fetch_imm16()?;
                    self.ip = addr as usize;
                }

                opcodes::JUMP_Z => {
                    let addr = self.fetch_imm16()?;
                    if self.flags.z {
                        self.ip = addr as usize;
                    }
                }

                opcodes::JUMP_NZ => {
                    let addr = self.fetch_imm16()?;
                    if !self.flags.z {
                        self.ip = addr as usize;
                    }
                }

                opcodes::XOR => {
                    let (res, a, b) = self.fetch_reg3()?;
                    let lhs = self.regs.get(a).get_int()? as i64;
                    let rhs = self.regs.get(b).get_int()? as i64;
                    self.regs.get_mut(res).set_int(lhs ^ rhs);
                }

                opcodes::ADD => {
                    let (res, a, b) = self.fetch_reg3()?;
                    let lhs = self.regs.get(a).get_int()? as i64;
                    let rhs = self.regs.get(b).get_int()? as i64;
                    self.regs.get_mut(res).set_int(lhs + rhs);
                }

                opcodes::SUB => {
                    let (res, a, b) = self.fetch_reg3()?;
                    let lhs = self.regs.get(a).get_int()? as i64;
                    let rhs = self.regs.get(b).get_int()? as i64;
                    let diff = lhs - rhs;
                    self.regs.get_mut(res).set_int(diff);
                    // Set-only: a positive result leaves Z as it was.
                    if diff <= 0 {
                        self.flags.z = true;
                    }
                }

                opcodes::MUL => {
                    let (res, a, b) = self.fetch_reg3()?;
                    let lhs = self.regs.get(a).get_int()? as i64;
                    let rhs = self.regs.get(b).get_int()? as i64;
                    self.regs.get_mut(res).set_int(lhs * rhs);
                }

                opcodes::DIV => {
                    let (res, a, b) = self.fetch_reg3()?;
                    let lhs = self.regs.get(a).get_int()? as i64;
                    let rhs = self.regs.get(b).get_int()? as i64;
                    if rhs == 0 {
                        return Err(Fault::DivideByZero);
                    }
                    self.regs.get_mut(res).set_int(lhs / rhs);
                }

                opcodes::INC => {
                    let reg = self.fetch_reg()?;
                    let val = self.regs.get(reg).get_int()?;
                    let next = if val == 0xFFFF { 0 } else { val + 1 };
                    self.flags.z = next == 0;
                    self.regs.get_mut(reg).set_int(next as i64);
                }

                opcodes::DEC => {
                    let reg = self.fetch_reg()?;
                    let val = self.regs.get(reg).get_int()?;
                    let next = if val == 0 { 0xFFFF } else { val - 1 };
                    self.flags.z = next == 0;
                    self.regs.get_mut(reg).set_int(next as i64);
                }

                opcodes::AND => {
                    let (res, a, b) = self.fetch_reg3()?;
                    let lhs = self.regs.get(a).get_int()? as i64;
                    let rhs = self.regs.get(b).get_int()? as i64;
                    self.regs.get_mut(res).set_int(lhs & rhs);
                }

                opcodes::OR => {
                    let (res, a, b) = self.fetch_reg3()?;
                    let lhs = self.regs.get(a).get_int()? as i64;
                    let rhs = self.regs.get(b).get_int()? as i64;
                    self.regs.get_mut(res).set_int(lhs | rhs);
                }

                opcodes::STRING_STORE => {
                    let reg = self.fetch_reg()?;
                    let literal = self.fetch_str16()?;
                    self.regs.get_mut(reg).set_str(literal);
                }

                opcodes::STRING_PRINT => {
                    let reg = self.fetch_reg()?;
                    let bytes = self.regs.get(reg).get_str()?.to_vec();
                    self.output.write_all(&bytes)?;
                    self.output.flush()?;
                }

                opcodes::STRING_CONCAT => {
                    let (res, a, b) = self.fetch_reg3()?;
                    let mut joined = self.regs.get(a).get_str()?.to_vec();
                    joined.extend_from_slice(self.regs.get(b).get_str()?);
                    self.regs.get_mut(res).set_str(joined);
                }

                opcodes::STRING_SYSTEM => {
                    let reg = self.fetch_reg()?;
                    let command = self.regs.get(reg).get_str()?.to_vec();
                    if self.system_enabled {
                        self.run_system(&command)?;
                    }
                }

                opcodes::STRING_TOINT => {
                    let reg = self.fetch_reg()?;
                    let text = String::from_utf8_lossy(self.regs.get(reg).get_str()?).into_owned();
                    let parsed: i64 = text
                        .parse()
                        .map_err(|_| Fault::ParseError(text.clone()))?;
                    self.regs.get_mut(reg).set_int(parsed);
                }

                opcodes::CMP_REG => {
                    let r1 = self.fetch_reg()?;
                    let r2 = self.fetch_reg()?;
                    // Variant mismatch compares as not-equal; no fault.
                    self.flags.z = self.regs.get(r1).value() == self.regs.get(r2).value();
                }

                opcodes::CMP_IMMEDIATE => {
                    let reg = self.fetch_reg()?;
                    let imm = self.fetch_imm16()?;
                    self.flags.z =
                        matches!(self.regs.get(reg).value(), Value::Int(v) if *v == imm);
                }

                opcodes::CMP_STRING => {
                    let reg = self.fetch_reg()?;
                    let literal = self.fetch_str16()?;
                    self.flags.z =
                        matches!(self.regs.get(reg).value(), Value::Str(s) if *s == literal);
                }

                opcodes::IS_STRING => {
                    let reg = self.fetch_reg()?;
                    self.flags.z = self.regs.get(reg).kind() == ValueKind::Str;
                }

                opcodes::IS_INTEGER => {
                    let reg = self.fetch_reg()?;
                    self.flags.z = self.regs.get(reg).kind() == ValueKind::Int;
                }

                opcodes::NOP => {}

                opcodes::REG_STORE => {
                    let dst = self.fetch_reg()?;
                    let src = self.fetch_reg()?;
                    let copy = self.regs.get(src).clone();
                    *self.regs.get_mut(dst) = copy;
                }

                opcodes::PEEK => {
                    let dst = self.fetch_reg()?;
                    let src = self.fetch_reg()?;
                    let addr = self.regs.get(src).get_int()? as usize;
                    let byte = self.mem.read(addr)?;
                    self.regs.get_mut(dst).set_int(byte as i64);
                }

                opcodes::POKE => {
                    let src = self.fetch_reg()?;
                    let dst = self.fetch_reg()?;
                    let addr = self.regs.get(dst).get_int()? as usize;
                    let val = self.regs.get(src).get_int()?;
                    if debug_enabled() {
                        eprintln!("[vm] poke 0x{:02X} -> 0x{addr:04X}", val & 0xFF);
                    }
                    self.mem.write(addr, (val & 0xFF) as u8)?;
                }

                opcodes::MEMCPY => {
                    let (dst, src, len) = self.fetch_reg3()?;
                    let dst_addr = self.regs.get(dst).get_int()? as usize;
                    let src_addr = self.regs.get(src).get_int()? as usize;
                    let count = self.regs.get(len).get_int()? as usize;
                    self.mem.copy_wrapping(dst_addr, src_addr, count);
                }

                opcodes::PUSH => {
                    let reg = self.fetch_reg()?;
                    let val = self.regs.get(reg).get_int()?;
                    self.stack.push(val);
                }

                opcodes::POP => {
                    let reg = self.fetch_reg()?;
                    let val = self.stack.pop()?;
                    self.regs.get_mut(reg).set_int(val as i64);
                }

                opcodes::RET => {
                    self.ip = self.stack.pop()? as usize;
                }

                opcodes::CALL => {
                    let target = self.fetch_imm16()?;
                    // IP now points past the two-byte target; that is the
                    // return address.
                    self.stack.push(self.ip as u16);
                    self.ip = target as usize;
                }

                opcodes::TRAP => {
                    let num = self.fetch_imm16()?;
                    let handler = self.traps.get(num);
                    handler(self, num)?;
                }

                unknown => {
                    return Err(Fault::UnknownOpcode {
                        opcode: unknown,
                        ip: self.ip - 1,
                    });
                }
            }

            if self.ip > 0xFFFF {
                self.ip = 0;
            }
        }
    }

    /// Spawn the command line in `command` on the host and copy its stdout
    /// (and stderr, when non-empty) to the engine output.
    fn run_system(&mut self, command: &[u8]) -> Result<()> {
        let line = String::from_utf8_lossy(command);
        let argv = split_command(&line);
        let Some((program, args)) = argv.split_first() else {
            return Ok(());
        };
        let output = Command::new(program).args(args).output()?;
        self.output.write_all(&output.stdout)?;
        if !output.stderr.is_empty() {
            self.output.write_all(&output.stderr)?;
        }
        self.output.flush()?;
        Ok(())
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a command line into whitespace-separated fields, keeping balanced
/// double-quoted substrings together with the outer quotes stripped.
fn split_command(input: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in input.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    fields.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        fields.push(current);
    }
    fields
}
