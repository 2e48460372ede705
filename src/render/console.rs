//! Console renderer: redraws the tree in place on a terminal.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use crossterm::{
    QueueableCommand,
    cursor::{MoveTo, MoveToPreviousLine},
    style::Print,
    terminal::{Clear, ClearType},
};
use tracing::debug;

use super::{FrameSink, RenderRequest, Renderer, run_session};
use crate::bus::lock;
use crate::error::RenderError;

const DEFAULT_WIDTH: u16 = 80;
const DEFAULT_HEIGHT: u16 = 24;

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Clears the previously printed frame and prints the new one.
pub struct ConsoleRenderer {
    out: SharedWriter,
    /// Fixed size for wrapping math; `None` asks the terminal.
    size: Option<(u16, u16)>,
}

#[derive(Debug, Clone, Copy)]
struct Surface {
    width: u16,
    height: u16,
}

/// Per-render drawing state.
#[derive(Default)]
struct Painter {
    /// Terminal rows occupied by the last frame.
    printed_rows: usize,
    error: Option<io::Error>,
}

impl ConsoleRenderer {
    pub fn stdout() -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(io::stdout()))),
            size: None,
        }
    }

    /// Draw into an arbitrary writer with a fixed `(columns, rows)` size.
    pub fn with_writer(writer: impl Write + Send + 'static, size: (u16, u16)) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(writer))),
            size: Some(size),
        }
    }

    fn surface(&self) -> Surface {
        let (width, height) = self
            .size
            .or_else(|| crossterm::terminal::size().ok())
            .unwrap_or((DEFAULT_WIDTH, DEFAULT_HEIGHT));
        Surface {
            width: if width == 0 { DEFAULT_WIDTH } else { width },
            height: if height == 0 { DEFAULT_HEIGHT } else { height },
        }
    }
}

impl Default for ConsoleRenderer {
    fn default() -> Self {
        Self::stdout()
    }
}

#[async_trait]
impl Renderer for ConsoleRenderer {
    fn name(&self) -> &str {
        "console"
    }

    async fn render(&self, request: RenderRequest) -> Result<(), RenderError> {
        let painter = Arc::new(Mutex::new(Painter::default()));
        let surface = self.surface();
        let sink: FrameSink = {
            let painter = Arc::clone(&painter);
            let out = Arc::clone(&self.out);
            Arc::new(move |lines: Vec<String>| {
                let mut painter = lock(&painter);
                if painter.error.is_some() {
                    return;
                }
                let mut out = lock(&out);
                match draw(&mut **out, painter.printed_rows, &lines, surface) {
                    Ok(rows) => painter.printed_rows = rows,
                    Err(e) => {
                        debug!(error = %e, "Console draw failed");
                        painter.error = Some(e);
                    }
                }
            })
        };

        run_session(request, sink).await?;

        match lock(&painter).error.take() {
            Some(e) => Err(RenderError::Io(e)),
            None => Ok(()),
        }
    }
}

/// Replace the last `printed_rows` rows with `lines`. Returns the rows the
/// new frame occupies.
///
/// The cursor cannot move above the top of the screen, so a previous frame
/// taller than the surface is cleared together with the scrollback.
fn draw(out: &mut dyn Write, printed_rows: usize, lines: &[String], surface: Surface) -> io::Result<usize> {
    match u16::try_from(printed_rows) {
        Ok(0) => {
            out.queue(Clear(ClearType::FromCursorDown))?;
        }
        Ok(up) if up < surface.height => {
            out.queue(MoveToPreviousLine(up))?;
            out.queue(Clear(ClearType::FromCursorDown))?;
        }
        _ => {
            out.queue(Clear(ClearType::Purge))?;
            out.queue(Clear(ClearType::All))?;
            out.queue(MoveTo(0, 0))?;
        }
    }

    let mut rows = 0;
    for line in lines.iter().filter(|l| !l.trim().is_empty()) {
        out.queue(Print(line))?;
        out.queue(Print("\n"))?;
        rows += rows_for(line, surface.width);
    }
    out.flush()?;
    Ok(rows)
}

/// Rows a line occupies once the terminal wraps it.
fn rows_for(line: &str, width: u16) -> usize {
    let width = usize::from(width.max(1));
    line.chars().count().div_ceil(width).max(1)
}
