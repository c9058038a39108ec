use std::time::Duration;

use anyhow::anyhow;
use log::warn;

use crate::clock::{RateGate, TIMER_HZ};
use crate::instruction::{Outcome, decode};
use crate::state::{Chip8State, MEM_SIZE, Settings};

/// The virtual machine proper: owned state plus the two timing domains.
/// Timers tick at a fixed 60 Hz; instruction cycles run at the configured
/// rate. The two are independent, so instruction throughput never skews
/// timer cadence.
pub struct Machine {
    state: Chip8State,
    timer_gate: RateGate,
    cpu_gate: RateGate,
    cycles: u64,
    unknown_ops: u64,
}

impl Machine {
    pub fn new(settings: Settings) -> Self {
        let ips = settings.ips;
        Machine {
            state: Chip8State::new(settings),
            timer_gate: RateGate::new(TIMER_HZ),
            cpu_gate: RateGate::new(ips),
            cycles: 0,
            unknown_ops: 0,
        }
    }

    pub fn load_rom(&mut self, rom: &[u8]) -> anyhow::Result<()> {
        self.state.memory.load_rom(rom)
    }

    fn fetch(&mut self) -> anyhow::Result<u16> {
        if self.state.pc + 1 >= MEM_SIZE {
            return Err(anyhow!(
                "Program counter out of range: {:#05X}",
                self.state.pc
            ));
        }
        let high_byte = u16::from(self.state.memory.read(self.state.pc)?);
        let low_byte = u16::from(self.state.memory.read(self.state.pc + 1)?);

        // Move the program counter to the next instruction; control flow
        // opcodes overwrite it during execution.
        self.state.pc += 2;

        Ok((high_byte << 8) | low_byte)
    }

    /// One fetch-decode-execute cycle.
    pub fn step(&mut self) -> anyhow::Result<()> {
        let raw = self.fetch()?;
        match decode(raw).execute(&mut self.state)? {
            Outcome::Applied => {}
            Outcome::Unknown(raw) => {
                self.unknown_ops += 1;
                warn!("Skipping unknown instruction {raw:#06X}");
            }
        }
        self.cycles += 1;
        Ok(())
    }

    fn tick_timers(&mut self) {
        self.state.delay_timer = self.state.delay_timer.saturating_sub(1);
        self.state.sound_timer = self.state.sound_timer.saturating_sub(1);
    }

    /// Advances the machine by `elapsed` wall-clock time: timer ticks first
    /// at their fixed cadence, then as many instruction cycles as the
    /// configured rate makes due.
    pub fn advance(&mut self, elapsed: Duration) -> anyhow::Result<()> {
        for _ in 0..self.timer_gate.advance(elapsed) {
            self.tick_timers();
        }
        for _ in 0..self.cpu_gate.advance(elapsed) {
            self.step()?;
        }
        Ok(())
    }

    /// Whether the tone should currently be sounding. The driver syncs the
    /// beeper to this after every advance; a one-tick lag is acceptable.
    pub fn sound_active(&self) -> bool {
        self.state.sound_timer > 0
    }

    pub fn key_down(&mut self, key: u8) {
        self.state.keypad.key_down(key);
    }

    pub fn key_up(&mut self, key: u8) {
        self.state.keypad.key_up(key);
    }

    pub fn state(&self) -> &Chip8State {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::state::{DEFAULT_FRAME_RATE, PC_START_ADDR, Quirks};

    fn machine_with_ips(ips: u64, rom: &[u8]) -> Machine {
        let settings = Settings::new(
            DEFAULT_FRAME_RATE,
            ips,
            PathBuf::from("test.ch8"),
            Quirks::default(),
        );
        let mut machine = Machine::new(settings);
        machine.load_rom(rom).unwrap();
        machine
    }

    // Tightest possible program: jump back to itself forever.
    const SPIN: [u8; 2] = [0x12, 0x00];

    #[test]
    fn timers_tick_at_sixty_hz_regardless_of_instruction_rate() {
        for ips in [100, 700, 10_000] {
            let mut machine = machine_with_ips(ips, &SPIN);
            machine.state.delay_timer = 65;
            machine.state.sound_timer = 65;
            machine.advance(Duration::from_secs(1)).unwrap();
            assert_eq!(machine.state.delay_timer, 5, "ips {ips}");
            assert_eq!(machine.state.sound_timer, 5, "ips {ips}");
        }
    }

    #[test]
    fn timers_saturate_at_zero() {
        let mut machine = machine_with_ips(700, &SPIN);
        machine.state.delay_timer = 1;
        machine.advance(Duration::from_secs(1)).unwrap();
        assert_eq!(machine.state.delay_timer, 0);
    }

    #[test]
    fn instruction_throughput_converges_on_the_configured_rate() {
        let mut machine = machine_with_ips(700, &SPIN);
        machine.advance(Duration::from_secs(1)).unwrap();
        assert_eq!(machine.cycles, 700);
    }

    #[test]
    fn instruction_throughput_is_capped_within_a_slice() {
        let mut machine = machine_with_ips(700, &SPIN);
        machine.advance(Duration::from_millis(500)).unwrap();
        assert!(machine.cycles <= 350);
    }

    #[test]
    fn chunked_advances_lose_no_instruction_budget() {
        let mut machine = machine_with_ips(700, &SPIN);
        for _ in 0..100 {
            machine.advance(Duration::from_millis(10)).unwrap();
        }
        assert_eq!(machine.cycles, 700);
    }

    #[test]
    fn wait_key_blocks_the_machine_until_a_release() {
        // F50A: block until a key is released, storing it in V5.
        let mut machine = machine_with_ips(700, &[0xF5, 0x0A]);

        for _ in 0..3 {
            machine.step().unwrap();
            assert_eq!(machine.state.pc, PC_START_ADDR);
        }

        machine.key_down(7);
        machine.step().unwrap();
        assert_eq!(machine.state.pc, PC_START_ADDR);

        machine.key_up(7);
        machine.step().unwrap();
        assert_eq!(machine.state.pc, PC_START_ADDR + 2);
        assert_eq!(machine.state.registers.read(5), 7);
    }

    #[test]
    fn unknown_instructions_are_counted_and_skipped() {
        // 0000 decodes to nothing; the program then parks on a spin jump.
        let mut machine = machine_with_ips(700, &[0x00, 0x00, 0x12, 0x02]);
        machine.step().unwrap();
        assert_eq!(machine.unknown_ops, 1);
        assert_eq!(machine.state.pc, PC_START_ADDR + 2);

        machine.step().unwrap();
        assert_eq!(machine.state.pc, PC_START_ADDR + 2);
    }

    #[test]
    fn program_counter_out_of_range_is_fatal() {
        let mut machine = machine_with_ips(700, &SPIN);
        machine.state.pc = MEM_SIZE - 1;
        assert!(machine.step().is_err());
    }

    #[test]
    fn oversized_rom_is_rejected_before_the_loop_starts() {
        let settings = Settings::new(
            DEFAULT_FRAME_RATE,
            700,
            PathBuf::from("test.ch8"),
            Quirks::default(),
        );
        let mut machine = Machine::new(settings);
        assert!(machine.load_rom(&vec![0; MEM_SIZE]).is_err());
    }

    #[test]
    fn sound_goes_quiet_when_the_timer_runs_out() {
        let mut machine = machine_with_ips(700, &SPIN);
        machine.state.sound_timer = 2;
        assert!(machine.sound_active());

        machine.advance(Duration::from_millis(17)).unwrap();
        assert!(machine.sound_active());

        machine.advance(Duration::from_millis(17)).unwrap();
        assert!(!machine.sound_active());
    }
}
