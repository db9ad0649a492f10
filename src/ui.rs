use std::fmt;
use std::io::{self, BufRead, Write};
use std::sync::mpsc::TryRecvError;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    prelude::*,
    widgets::{Block, Borders, Gauge, Paragraph, Wrap},
};
use rpassword::prompt_password;

use crate::backup::validate_passphrase;
use crate::breathing::{BreathPhase, Breather, Grounding, PHASE_SECS};
use crate::models::Theme;

const BREATHING_HINT: &str = "Esc / q to stop";
const COLOR_SAGE: Color = Color::Rgb(0x8F, 0xA8, 0x8C);
const COLOR_WARM: Color = Color::Rgb(0xD9, 0xA4, 0x6C);
const COLOR_ROSE: Color = Color::Rgb(0xC9, 0x7B, 0x84);

#[derive(Clone, Copy)]
struct Palette {
    accent: Color,
    text: Color,
    bg: Color,
}

fn palette(theme: Theme) -> Palette {
    match theme {
        Theme::Dark => Palette {
            accent: COLOR_SAGE,
            text: Color::Rgb(0xE8, 0xE4, 0xDC),
            bg: Color::Rgb(0x1C, 0x1F, 0x1D),
        },
        Theme::Light => Palette {
            accent: Color::Rgb(0x5E, 0x7A, 0x5B),
            text: Color::Rgb(0x2B, 0x2B, 0x28),
            bg: Color::Rgb(0xF7, 0xF4, 0xEE),
        },
    }
}

fn phase_color(phase: BreathPhase, pal: Palette) -> Color {
    match phase {
        BreathPhase::Inhale => pal.accent,
        BreathPhase::Hold | BreathPhase::Rest => COLOR_WARM,
        BreathPhase::Exhale => COLOR_ROSE,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassphraseStrength {
    Weak,
    Average,
    Strong,
    Excellent,
}

impl fmt::Display for PassphraseStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PassphraseStrength::Weak => "Weak",
            PassphraseStrength::Average => "Average",
            PassphraseStrength::Strong => "Strong",
            PassphraseStrength::Excellent => "Excellent",
        })
    }
}

/// Rough passphrase strength, shown as a hint when exporting. It never blocks
/// an export.
pub fn classify_passphrase_strength(passphrase: &str) -> PassphraseStrength {
    let len = passphrase.chars().count();
    if len < 8 {
        return PassphraseStrength::Weak;
    }

    let classes = [
        passphrase.chars().any(|c| c.is_lowercase()),
        passphrase.chars().any(|c| c.is_uppercase()),
        passphrase.chars().any(|c| c.is_ascii_digit()),
        passphrase
            .chars()
            .any(|c| !c.is_alphanumeric() && !c.is_whitespace()),
    ];
    let score = classes.iter().filter(|present| **present).count()
        + [8, 12, 16, 20].iter().filter(|min| len >= **min).count();

    match score {
        0..=3 => PassphraseStrength::Weak,
        4..=5 => PassphraseStrength::Average,
        6..=7 => PassphraseStrength::Strong,
        _ => PassphraseStrength::Excellent,
    }
}

/// Hidden passphrase prompt. With `confirm`, asks twice and rejects a
/// mismatch before anything is encrypted.
pub fn prompt_passphrase(confirm: bool) -> Result<String> {
    let first = prompt_password("Passphrase: ")?;
    let second = if confirm {
        Some(prompt_password("Confirm passphrase: ")?)
    } else {
        None
    };
    validate_passphrase(&first, second.as_deref())?;
    Ok(first)
}

pub fn prompt_confirm(question: &str) -> Result<bool> {
    print!("{question} (y/N): ");
    io::stdout().flush()?;
    let mut ans = String::new();
    io::stdin().read_line(&mut ans)?;
    Ok(matches!(ans.trim().to_lowercase().as_str(), "y" | "yes"))
}

pub struct BreathingView<'a> {
    pub phase: BreathPhase,
    pub progress: f64,
    pub cycles: u32,
    pub max_cycles: Option<u32>,
    pub theme: Theme,
    pub hint: &'a str,
}

pub fn draw_breathing(f: &mut Frame<'_>, view: &BreathingView<'_>) {
    let pal = palette(view.theme);
    let area = f.size();
    f.render_widget(Block::default().style(Style::default().bg(pal.bg)), area);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .margin(2)
        .constraints([
            Constraint::Min(1),
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Length(1),
            Constraint::Min(1),
        ])
        .split(area);

    let color = phase_color(view.phase, pal);
    let prompt = Paragraph::new(Line::from(Span::styled(
        view.phase.prompt(),
        Style::default().fg(color).add_modifier(Modifier::BOLD),
    )))
    .alignment(Alignment::Center)
    .wrap(Wrap { trim: true })
    .block(Block::default().borders(Borders::NONE));
    f.render_widget(prompt, rows[1]);

    let gauge = Gauge::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(pal.accent))
                .style(Style::default().bg(pal.bg)),
        )
        .gauge_style(Style::default().fg(color).bg(pal.bg))
        .label("")
        .ratio(view.progress.clamp(0.0, 1.0));
    f.render_widget(gauge, rows[2]);

    let counter = match view.max_cycles {
        Some(max) => format!("Cycle {} of {max} | {}", (view.cycles + 1).min(max), view.hint),
        None => format!("Cycles: {} | {}", view.cycles, view.hint),
    };
    let footer = Paragraph::new(counter)
        .style(Style::default().fg(pal.text).bg(pal.bg))
        .alignment(Alignment::Center);
    f.render_widget(footer, rows[3]);
}

/// Full-screen box breathing. Returns the number of completed cycles.
pub fn run_breathing(theme: Theme, max_cycles: Option<u32>) -> Result<u32> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, crossterm::cursor::Hide)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let phase_len = Duration::from_secs(PHASE_SECS);
    let breather = Breather::start(phase_len, max_cycles);
    let cancel = breather.cancel_handle();

    let result = (|| -> Result<u32> {
        let mut phase = BreathPhase::Inhale;
        let mut phase_started = Instant::now();
        let mut cycles = 0u32;
        loop {
            match breather.phases().try_recv() {
                Ok(next) => {
                    if phase == BreathPhase::Rest && next == BreathPhase::Inhale {
                        cycles += 1;
                    }
                    phase = next;
                    phase_started = Instant::now();
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    // the last Rest phase ran to completion
                    return Ok(cycles + u32::from(phase == BreathPhase::Rest));
                }
            }

            let progress = phase_started.elapsed().as_secs_f64() / phase_len.as_secs_f64();
            terminal.draw(|f| {
                let view = BreathingView {
                    phase,
                    progress,
                    cycles,
                    max_cycles,
                    theme,
                    hint: BREATHING_HINT,
                };
                draw_breathing(f, &view);
            })?;

            if event::poll(Duration::from_millis(200))? {
                if let Event::Key(key) = event::read()? {
                    let ctrl_c = key.code == KeyCode::Char('c')
                        && key.modifiers.contains(KeyModifiers::CONTROL);
                    if ctrl_c || matches!(key.code, KeyCode::Esc | KeyCode::Char('q')) {
                        cancel.cancel();
                        return Ok(cycles);
                    }
                }
            }
        }
    })();

    breather.stop();
    teardown_terminal(&mut terminal);
    result
}

fn teardown_terminal(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) {
    disable_raw_mode().ok();
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        crossterm::cursor::Show
    )
    .ok();
    terminal.show_cursor().ok();
}

/// Line-based 5-4-3-2-1 grounding: Enter moves on, `q` (or end of input)
/// stops.
pub fn run_grounding<R: BufRead, W: Write>(input: R, out: &mut W) -> Result<usize> {
    let mut grounding = Grounding::default();
    let mut shown = 0usize;
    let mut lines = input.lines();
    loop {
        writeln!(out, "{}", grounding.prompt())?;
        write!(out, "[Enter: {} | q: stop] ", grounding.action_label())?;
        out.flush()?;
        shown += 1;
        let Some(line) = lines.next() else { break };
        if line?.trim().eq_ignore_ascii_case("q") {
            break;
        }
        grounding.advance();
    }
    writeln!(out)?;
    Ok(shown)
}
