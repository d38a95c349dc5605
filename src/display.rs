//! Terminal rendering of the console.

use std::io::{self, Stdout};

use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table};
use ratatui::{Frame, Terminal};
use tracing::error;

use crate::connection::Connection;
use crate::console::Console;
use crate::input::ParameterField;
use crate::keyboard::KeySource;
use crate::record::{Sample, COLUMNS, MISSING};
use crate::scheduler::Clock;

const HELP: &str = " F1-F4 PWM  F9 interval  ENTER set  ESC cancel  CTRL-C quit ";

/// Raw mode and the alternate screen, for as long as this value lives.
pub struct TerminalGuard {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl TerminalGuard {
    pub fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        terminal.hide_cursor()?;
        terminal.clear()?;
        Ok(Self { terminal })
    }

    pub fn terminal_mut(&mut self) -> &mut Terminal<CrosstermBackend<Stdout>> {
        &mut self.terminal
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if let Err(e) = disable_raw_mode() {
            error!(error = %e, "could not leave raw mode");
        }
        if let Err(e) = execute!(self.terminal.backend_mut(), LeaveAlternateScreen) {
            error!(error = %e, "could not leave alternate screen");
        }
        let _ = self.terminal.show_cursor();
    }
}

/// Draws the whole console into one frame.
pub fn render<C, K, Clk>(frame: &mut Frame, console: &Console<C, K, Clk>)
where
    C: Connection,
    K: KeySource,
    Clk: Clock,
{
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(4), Constraint::Length(3), Constraint::Length(1)].as_ref())
        .split(frame.size());

    let title = format!(" PATE bias board [{}] ", console.device().serial_parameters());
    render_table(frame, chunks[0], console.samples(), &title);
    render_fields(frame, chunks[1], console.fields());
    frame.render_widget(Paragraph::new(console.status()), chunks[2]);
}

fn render_table<'a>(frame: &mut Frame, area: Rect, samples: impl Iterator<Item = &'a Sample>, title: &str) {
    let heading = |name: &'static str, unit: &'static str| {
        Cell::from(Text::from(vec![Line::from(name), Line::from(unit)]))
    };
    let mut header = vec![heading("Time", "")];
    header.extend(COLUMNS.iter().map(|c| heading(c.heading.0, c.heading.1)));
    let header = Row::new(header)
        .height(2)
        .style(Style::default().add_modifier(Modifier::REVERSED));

    let rows: Vec<Row> = samples
        .map(|sample| {
            let mut cells = vec![Cell::from(sample.time.format("%H:%M:%S").to_string())];
            cells.extend(COLUMNS.iter().map(|c| {
                Cell::from(match sample.value(c) {
                    Some(v) => format!("{:4}", v),
                    None => format!("{:>4}", MISSING),
                })
            }));
            let row = Row::new(cells);
            // Rows taken right after a setting changed.
            if sample.follows_commands() {
                row.style(Style::default().add_modifier(Modifier::BOLD))
            } else {
                row
            }
        })
        .collect();

    let mut widths = vec![Constraint::Length(8)];
    widths.extend(COLUMNS.iter().map(|_| Constraint::Length(4)));
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title.to_string()));
    frame.render_widget(table, area);
}

fn render_fields(frame: &mut Frame, area: Rect, fields: &[ParameterField]) {
    let mut spans = Vec::new();
    for field in fields {
        let text = if field.is_active() {
            format!(" {}: {} -> {}_ ", field.label(), field.value, field.buffer())
        } else {
            format!(" {}: {} ", field.label(), field.value)
        };
        let style = if field.is_active() {
            Style::default().add_modifier(Modifier::REVERSED)
        } else {
            Style::default()
        };
        spans.push(Span::styled(text, style));
        spans.push(Span::raw(" "));
    }
    let bar = Paragraph::new(Line::from(spans))
        .block(Block::default().borders(Borders::ALL).title(HELP));
    frame.render_widget(bar, area);
}
