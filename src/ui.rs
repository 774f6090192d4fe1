use crate::cli::OutputFormat;
use crate::event::{Event, EventBus, EventKind};
use crate::model::{BoxDetails, BoxInfo};
use crate::orchestrator::{DeleteReport, ProviderReport};
use anyhow::{Context, Result};
use crossterm::cursor::MoveToColumn;
use crossterm::style::{Print, Stylize};
use crossterm::terminal::{Clear, ClearType, is_raw_mode_enabled};
use crossterm::{ExecutableCommand, QueueableCommand};
use std::io::{self, IsTerminal, Write};
use tracing::{debug, error, info, warn};

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Turns bus events into terminal output: logs go to tracing, console lines
/// to `out`, and the loader is a single redrawn line on `err`.
pub struct EventRenderer<O, E> {
    out: O,
    err: E,
    interactive: bool,
    frame: usize,
    loader: Option<String>,
}

impl EventRenderer<io::Stdout, io::Stderr> {
    pub fn standard() -> Self {
        let interactive = io::stderr().is_terminal();
        Self::new(io::stdout(), io::stderr(), interactive)
    }
}

impl<O, E> EventRenderer<O, E>
where
    O: Write,
    E: Write,
{
    pub fn new(out: O, err: E, interactive: bool) -> Self {
        Self {
            out,
            err,
            interactive,
            frame: 0,
            loader: None,
        }
    }

    pub fn handle(&mut self, event: Event) {
        let source = event.source();
        let message = event.message();
        let result = match event.kind() {
            EventKind::LogDebug => {
                debug!(source, "{message}");
                Ok(())
            }
            EventKind::LogInfo => {
                info!(source, "{message}");
                Ok(())
            }
            EventKind::LogWarning => {
                warn!(source, "{message}");
                Ok(())
            }
            EventKind::LogError => {
                error!(source, "{message}");
                Ok(())
            }
            EventKind::PrintConsole => self.print_console(message),
            EventKind::LoaderUpdate => self.update_loader(message),
            EventKind::LoaderStop => self.stop_loader(),
        };
        if let Err(error) = result {
            debug!("failed to render event: {error}");
        }
    }

    fn print_console(&mut self, message: &str) -> io::Result<()> {
        self.clear_loader_line()?;
        // raw mode does not translate \n into \r\n
        let newline = if is_raw_mode_enabled().unwrap_or(false) {
            "\r\n"
        } else {
            "\n"
        };
        write!(self.out, "{message}{newline}")?;
        self.out.flush()?;
        self.draw_loader()
    }

    fn update_loader(&mut self, message: &str) -> io::Result<()> {
        if !self.interactive {
            debug!("{message}");
            return Ok(());
        }
        self.loader = Some(message.to_string());
        self.frame = (self.frame + 1) % SPINNER_FRAMES.len();
        self.draw_loader()
    }

    fn stop_loader(&mut self) -> io::Result<()> {
        if self.loader.take().is_some() {
            self.err
                .queue(MoveToColumn(0))?
                .execute(Clear(ClearType::CurrentLine))?;
        }
        Ok(())
    }

    fn clear_loader_line(&mut self) -> io::Result<()> {
        if self.loader.is_some() {
            self.err
                .queue(MoveToColumn(0))?
                .execute(Clear(ClearType::CurrentLine))?;
        }
        Ok(())
    }

    fn draw_loader(&mut self) -> io::Result<()> {
        let Some(message) = self.loader.as_deref() else {
            return Ok(());
        };
        let line = loader_line(self.frame, message);
        self.err
            .queue(MoveToColumn(0))?
            .queue(Clear(ClearType::CurrentLine))?
            .queue(Print(line))?;
        self.err.flush()
    }
}

fn loader_line(frame: usize, message: &str) -> String {
    let spinner = SPINNER_FRAMES[frame % SPINNER_FRAMES.len()];
    format!("{} {message}", spinner.cyan())
}

/// Attaches the standard renderer as the bus's only subscriber.
pub fn subscribe_terminal(bus: &EventBus) -> bool {
    let mut renderer = EventRenderer::standard();
    bus.subscribe(move |event| renderer.handle(event))
}

pub fn render_details(details: &BoxDetails, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Yaml => serde_yaml::to_string(details).context("failed to render yaml"),
        OutputFormat::Json => serde_json::to_string_pretty(details)
            .map(|json| format!("{json}\n"))
            .context("failed to render json"),
    }
}

/// One section per provider, one box per line.
pub fn render_list(reports: &[ProviderReport<Vec<BoxInfo>>]) -> String {
    let mut out = String::new();
    for report in reports {
        out.push_str(&format!("# {}\n", report.provider));
        for info in &report.value {
            let health = if info.healthy { "healthy" } else { "unhealthy" };
            out.push_str(&format!("{}\t{health}\n", info.name));
        }
        out.push_str(&format!("total: {}\n", report.value.len()));
    }
    out
}

pub fn render_delete(report: &DeleteReport) -> String {
    let mut out = String::new();
    for deleted in &report.deleted {
        out.push_str(&format!("# {}\n", deleted.provider));
        for name in &deleted.value {
            out.push_str(&format!("{name}\n"));
        }
        out.push_str(&format!("total: {}\n", deleted.value.len()));
    }
    out
}
