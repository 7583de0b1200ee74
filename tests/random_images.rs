//! Property tests over arbitrary bytecode images: every image must either
//! halt via EXIT or return an enumerated fault. No panics, no runaway
//! execution past the deadline.

use std::time::Duration;

use proptest::prelude::*;

use bytevm::{opcodes, Cpu, Deadline};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn arbitrary_images_halt_or_fault(image in proptest::collection::vec(any::<u8>(), 0..512)) {
        let mut cpu = Cpu::new();
        cpu.set_stdin(std::io::empty());
        cpu.set_stdout(std::io::sink());
        cpu.set_deadline(Deadline::after(Duration::from_millis(200)));
        cpu.load_bytes(&image).expect("short images always load");
        // Ok or a structured fault; either way we must get back here.
        let _ = cpu.run();
    }

    #[test]
    fn stored_integers_survive_a_stack_round_trip(value in 0u16..=0xFFFF) {
        let image = [
            opcodes::INT_STORE, 1, (value & 0xFF) as u8, (value >> 8) as u8,
            opcodes::PUSH, 1,
            opcodes::POP, 2,
            opcodes::EXIT,
        ];
        let mut cpu = Cpu::new();
        cpu.set_stdout(std::io::sink());
        cpu.load_bytes(&image).unwrap();
        cpu.run().unwrap();
        prop_assert_eq!(cpu.reg(2).get_int().unwrap(), value);
        prop_assert!(cpu.stack().is_empty());
    }

    #[test]
    fn tostring_toint_round_trip_is_identity(value in 0u16..=0xFFFF) {
        let image = [
            opcodes::INT_STORE, 1, (value & 0xFF) as u8, (value >> 8) as u8,
            opcodes::INT_TOSTRING, 1,
            opcodes::STRING_TOINT, 1,
            opcodes::EXIT,
        ];
        let mut cpu = Cpu::new();
        cpu.load_bytes(&image).unwrap();
        cpu.run().unwrap();
        prop_assert_eq!(cpu.reg(1).get_int().unwrap(), value);
    }

    #[test]
    fn register_operands_out_of_range_always_fault(reg in 15u8..=0xFF) {
        let image = [opcodes::INT_PRINT, reg];
        let mut cpu = Cpu::new();
        cpu.set_stdout(std::io::sink());
        cpu.load_bytes(&image).unwrap();
        prop_assert!(matches!(
            cpu.run(),
            Err(bytevm::Fault::RegisterOutOfRange(r)) if r == reg
        ));
    }
}
