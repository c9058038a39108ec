mod clock;
mod display;
mod emulator;
mod instruction;
mod machine;
mod state;

use std::path::PathBuf;

use clap::Parser;

use crate::state::{DEFAULT_FRAME_RATE, DEFAULT_INSTRUCTIONS_PER_SECOND, Quirks, Settings};

/// CHIP-8 virtual machine with configurable interpreter quirks.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the ROM image loaded at address 0x200.
    rom: PathBuf,

    /// Instructions executed per second.
    #[arg(long, default_value_t = DEFAULT_INSTRUCTIONS_PER_SECOND)]
    ips: u64,

    /// Frames presented per second.
    #[arg(long, default_value_t = DEFAULT_FRAME_RATE)]
    frame_rate: u64,

    /// Shift opcodes read their operand from VY before shifting (COSMAC VIP).
    #[arg(long)]
    shift_quirk: bool,

    /// BNNN jumps to XNN + VX instead of NNN + V0 (CHIP-48/SUPER-CHIP).
    #[arg(long)]
    jump_quirk: bool,

    /// Register block copies leave the index register incremented by X + 1
    /// (COSMAC VIP).
    #[arg(long)]
    index_quirk: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .env()
        .init()?;

    let quirks = Quirks {
        shift_reads_vy: args.shift_quirk,
        jump_reads_vx: args.jump_quirk,
        index_increment: args.index_quirk,
    };
    let settings = Settings::new(args.frame_rate, args.ips, args.rom, quirks);
    log::info!(
        "Loading {} at {} instructions per second",
        settings.rom.display(),
        settings.ips
    );

    let mut emulator = emulator::Emulator::new(settings)?;
    emulator.run()
}
