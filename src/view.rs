//! Full-screen scroll viewer for diagrams too big to print.

use std::io::Write;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, size, Clear, ClearType, EnterAlternateScreen,
    LeaveAlternateScreen,
};
use crossterm::{cursor, execute, queue};

use nix::errno::Errno;

use crate::error::{Error, Result};
use crate::render::{Colour, Grid};

fn term_colour(colour: Colour) -> Option<Color> {
    match colour {
        Colour::Default | Colour::White => None,
        Colour::Red | Colour::RedBold => Some(Color::Red),
        Colour::GreenBold => Some(Color::Green),
        Colour::Yellow => Some(Color::Yellow),
        Colour::BlueBold => Some(Color::Blue),
        Colour::Magenta => Some(Color::Magenta),
    }
}

// Raw mode and the alternate screen get restored even if drawing errors
// out or panics.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let mut out = std::io::stdout();
        let _ = execute!(out, LeaveAlternateScreen, cursor::Show);
        let _ = disable_raw_mode();
    }
}

/// Scroll around `grid` until the user quits (q or escape). Arrow keys and
/// hjkl move, page keys jump, g/G go to the top/bottom.
pub fn scroll(grid: &Grid, colour: bool) -> Result<()> {
    let io_err = |err: std::io::Error| Error::System {
        errno: Errno::from_i32(err.raw_os_error().unwrap_or(libc::EIO)),
        cause: "terminal I/O",
    };

    enable_raw_mode().map_err(io_err)?;
    let _guard = TerminalGuard;
    execute!(std::io::stdout(), EnterAlternateScreen, cursor::Hide).map_err(io_err)?;

    let mut x_off = 0usize;
    let mut y_off = 0usize;
    loop {
        let (cols, rows) = size().map_err(io_err)?;
        let cols = cols as usize;
        let view_rows = (rows as usize).saturating_sub(1).max(1);

        let max_y = grid.height().saturating_sub(view_rows);
        let max_x = grid.width().saturating_sub(cols);
        y_off = y_off.min(max_y);
        x_off = x_off.min(max_x);

        draw(grid, colour, x_off, y_off, cols, view_rows).map_err(io_err)?;

        match event::read().map_err(io_err)? {
            Event::Key(key) if key.kind != KeyEventKind::Release => {
                let page = view_rows.saturating_sub(1).max(1);
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => break,
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => break,
                    KeyCode::Up | KeyCode::Char('k') => y_off = y_off.saturating_sub(1),
                    KeyCode::Down | KeyCode::Char('j') => y_off = (y_off + 1).min(max_y),
                    KeyCode::Left | KeyCode::Char('h') => x_off = x_off.saturating_sub(4),
                    KeyCode::Right | KeyCode::Char('l') => x_off = (x_off + 4).min(max_x),
                    KeyCode::PageUp => y_off = y_off.saturating_sub(page),
                    KeyCode::PageDown => y_off = (y_off + page).min(max_y),
                    KeyCode::Home | KeyCode::Char('g') => y_off = 0,
                    KeyCode::End | KeyCode::Char('G') => y_off = max_y,
                    _ => {}
                }
            }
            Event::Resize(..) => {}
            _ => {}
        }
    }
    Ok(())
}

fn draw(
    grid: &Grid,
    colour: bool,
    x_off: usize,
    y_off: usize,
    cols: usize,
    view_rows: usize,
) -> std::io::Result<()> {
    let mut out = std::io::stdout().lock();
    queue!(out, Clear(ClearType::All))?;

    for row in 0..view_rows {
        queue!(out, cursor::MoveTo(0, row as u16))?;
        let y = y_off + row;
        if y >= grid.height() {
            continue;
        }
        let mut current: Option<Color> = None;
        for col in 0..cols.min(grid.width().saturating_sub(x_off)) {
            let (ch, cell_colour) = grid.cell(x_off + col, y);
            let wanted = if colour { term_colour(cell_colour) } else { None };
            if wanted != current {
                match wanted {
                    Some(c) => queue!(out, SetForegroundColor(c))?,
                    None => queue!(out, ResetColor)?,
                }
                current = wanted;
            }
            queue!(out, Print(ch))?;
        }
        if current.is_some() {
            queue!(out, ResetColor)?;
        }
    }

    let status = format!(
        "rows {}-{} of {}  (arrows scroll, q quits)",
        y_off + 1,
        (y_off + view_rows).min(grid.height()),
        grid.height()
    );
    queue!(
        out,
        cursor::MoveTo(0, view_rows as u16),
        Print(status.chars().take(cols).collect::<String>())
    )?;
    out.flush()
}
