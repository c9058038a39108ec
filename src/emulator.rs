use std::io::Stdout;
use std::time::{Duration, Instant};

use crossterm::{
    event::{
        self, Event, KeyCode, KeyEvent, KeyEventKind, KeyboardEnhancementFlags,
        PopKeyboardEnhancementFlags, PushKeyboardEnhancementFlags,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, supports_keyboard_enhancement},
};
use ratatui::{
    Terminal,
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout},
    style::{Color, Style},
    widgets::{Block, Borders, Paragraph},
};
use rodio::{OutputStream, Sink, Source, source::SineWave};

use crate::display::{DISPLAY_HEIGHT, DISPLAY_WIDTH};
use crate::machine::Machine;
use crate::state::{NUM_KEYS, Settings};

const BEEP_FREQUENCY: f32 = 440.0;

/// Terminals without key release reporting get a synthesized release this
/// long after the last press of a key. The release both ages out stale key
/// state and resolves a pending key wait.
const KEY_HOLD: Duration = Duration::from_millis(150);

pub struct Beep {
    sink: Sink,
    #[allow(dead_code)]
    stream: OutputStream,
}

impl Beep {
    pub fn new(freq: f32) -> anyhow::Result<Self> {
        let (stream, stream_handle) = OutputStream::try_default()?;
        let sink = Sink::try_new(&stream_handle)?;
        let source = SineWave::new(freq).repeat_infinite();

        sink.append(source);
        sink.pause();

        Ok(Self { sink, stream })
    }

    pub fn on(&mut self) {
        self.sink.play();
    }

    pub fn off(&mut self) {
        self.sink.pause();
    }
}

pub struct Emulator {
    machine: Machine,
    beeper: Beep,
    held: [Option<Instant>; NUM_KEYS],
    enhanced_keys: bool,
}

impl Emulator {
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        Ok(Emulator {
            machine: Machine::new(settings),
            beeper: Beep::new(BEEP_FREQUENCY)?,
            held: [None; NUM_KEYS],
            enhanced_keys: false,
        })
    }

    fn map_key(code: KeyCode) -> Option<u8> {
        let key = match code {
            KeyCode::Char('1') => 0x1,
            KeyCode::Char('2') => 0x2,
            KeyCode::Char('3') => 0x3,
            KeyCode::Char('4') => 0xC,
            KeyCode::Char('q') => 0x4,
            KeyCode::Char('w') => 0x5,
            KeyCode::Char('e') => 0x6,
            KeyCode::Char('r') => 0xD,
            KeyCode::Char('a') => 0x7,
            KeyCode::Char('s') => 0x8,
            KeyCode::Char('d') => 0x9,
            KeyCode::Char('f') => 0xE,
            KeyCode::Char('z') => 0xA,
            KeyCode::Char('x') => 0x0,
            KeyCode::Char('c') => 0xB,
            KeyCode::Char('v') => 0xF,
            _ => return None,
        };
        Some(key)
    }

    fn handle_key(&mut self, key: KeyEvent) {
        let Some(idx) = Self::map_key(key.code) else {
            return;
        };
        match key.kind {
            KeyEventKind::Press | KeyEventKind::Repeat => {
                self.machine.key_down(idx);
                // Only schedule a synthesized release when the terminal
                // will never send a real one.
                self.held[usize::from(idx)] = if self.enhanced_keys {
                    None
                } else {
                    Some(Instant::now() + KEY_HOLD)
                };
            }
            KeyEventKind::Release => {
                self.held[usize::from(idx)] = None;
                self.machine.key_up(idx);
            }
        }
    }

    fn expire_held(&mut self, now: Instant) {
        for idx in 0..NUM_KEYS {
            if self.held[idx].is_some_and(|deadline| deadline <= now) {
                self.held[idx] = None;
                self.machine.key_up(idx as u8);
            }
        }
    }

    fn draw(&self, frame: &mut ratatui::Frame, rom_name: &str) {
        let area = frame.area();

        // Exact size needed for the 64x32 grid plus borders.
        let game_width = (DISPLAY_WIDTH as u16) + 2;
        let game_height = (DISPLAY_HEIGHT as u16) + 2;

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(game_height),
                Constraint::Length(7),
                Constraint::Min(0),
            ])
            .split(area);

        // Center the game horizontally if the terminal is wider than needed
        let game_area = if chunks[0].width > game_width {
            let horizontal_chunks = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([
                    Constraint::Min(0),
                    Constraint::Length(game_width),
                    Constraint::Min(0),
                ])
                .split(chunks[0]);
            horizontal_chunks[1]
        } else {
            chunks[0]
        };

        let display = &self.machine.state().display;
        let mut row_string = String::with_capacity(DISPLAY_WIDTH * DISPLAY_HEIGHT + DISPLAY_HEIGHT);
        for row_idx in 0..DISPLAY_HEIGHT {
            for col_idx in 0..DISPLAY_WIDTH {
                row_string.push(if display.pixel(col_idx, row_idx) {
                    '█'
                } else {
                    ' '
                });
            }
            row_string.push('\n');
        }
        let game_paragraph = Paragraph::new(row_string)
            .block(Block::default().borders(Borders::ALL).title(rom_name))
            .style(Style::default().fg(Color::White));
        frame.render_widget(game_paragraph, game_area);

        let key_mapping = "Key Mapping:\n\
    1 2 3 4    →    1 2 3 C\n\
    Q W E R    →    4 5 6 D\n\
    A S D F    →    7 8 9 E\n\
    Z X C V    →    A 0 B F";
        let key_paragraph = Paragraph::new(key_mapping)
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL).title("Keypad"))
            .style(Style::default().fg(Color::Yellow));
        frame.render_widget(key_paragraph, chunks[1]);
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        let frame_duration =
            Duration::from_secs_f64(1.0 / self.machine.state().settings.frame_rate as f64);
        let rom_path = self.machine.state().settings.rom.clone();
        let rom_stem: String = rom_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Unknown ROM".to_string());
        let rom_data = std::fs::read(&rom_path)?;
        self.machine.load_rom(&rom_data)?;

        enable_raw_mode()?;
        self.enhanced_keys = matches!(supports_keyboard_enhancement(), Ok(true));
        if self.enhanced_keys {
            execute!(
                std::io::stdout(),
                PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::REPORT_EVENT_TYPES)
            )?;
        }
        let backend = CrosstermBackend::new(std::io::stdout());
        let mut terminal = Terminal::new(backend)?;
        terminal.clear()?;

        let result = self.main_loop(&mut terminal, frame_duration, &rom_stem);

        if self.enhanced_keys {
            let _ = execute!(std::io::stdout(), PopKeyboardEnhancementFlags);
        }
        disable_raw_mode()?;
        result
    }

    fn main_loop(
        &mut self,
        terminal: &mut Terminal<CrosstermBackend<Stdout>>,
        frame_duration: Duration,
        rom_name: &str,
    ) -> anyhow::Result<()> {
        let mut last_iter = Instant::now();
        let mut last_frame = Instant::now();

        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(last_iter);
            last_iter = now;

            self.expire_held(now);
            self.machine.advance(elapsed)?;

            if self.machine.sound_active() {
                self.beeper.on();
            } else {
                self.beeper.off();
            }

            if now.duration_since(last_frame) >= frame_duration {
                last_frame = now;
                terminal.draw(|frame| self.draw(frame, rom_name))?;
            }

            // The poll timeout doubles as the loop's idle sleep; the rate
            // gates absorb however long it actually takes.
            if event::poll(Duration::from_millis(1))? {
                if let Event::Key(key) = event::read()? {
                    if key.code == KeyCode::Esc {
                        terminal.clear()?;
                        return Ok(());
                    }
                    self.handle_key(key);
                }
            }
        }
    }
}
