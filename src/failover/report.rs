// ABOUTME: Output sinks for the failover console's per-tick reports
// ABOUTME: Console sink writes grids to a writer, log sink forwards lines to tracing

use std::io::Write;

/// Destination of the console's operator-facing output.
///
/// Passed to the console at construction and closed when it stops, instead
/// of redirecting the process-wide stdout.
pub trait OutputSink: Send {
    fn line(&mut self, text: &str);

    fn warning(&mut self, text: &str) {
        self.line(&format!("WARNING: {}", text));
    }

    fn table(&mut self, title: &str, headers: &[&str], rows: &[Vec<String>]) {
        self.line(title);
        for line in format_grid(headers, rows) {
            self.line(&line);
        }
    }

    fn close(&mut self) {}
}

/// Writes to any writer, stdout for the interactive console
pub struct ConsoleSink<W: Write + Send> {
    out: W,
}

impl ConsoleSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self {
            out: std::io::stdout(),
        }
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> OutputSink for ConsoleSink<W> {
    fn line(&mut self, text: &str) {
        if let Err(e) = writeln!(self.out, "{}", text) {
            tracing::warn!("Failed to write console output: {}", e);
        }
    }

    fn close(&mut self) {
        let _ = self.out.flush();
    }
}

/// Forwards every line to the tracing subscriber; used by the daemon
#[derive(Debug, Default)]
pub struct LogSink;

impl OutputSink for LogSink {
    fn line(&mut self, text: &str) {
        tracing::info!("{}", text);
    }

    fn warning(&mut self, text: &str) {
        tracing::warn!("{}", text);
    }
}

/// Render rows as a `+---+` bordered grid
pub fn format_grid(headers: &[&str], rows: &[Vec<String>]) -> Vec<String> {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let border = format!(
        "+{}+",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    );
    let render = |cells: Vec<&str>| {
        let padded: Vec<String> = widths
            .iter()
            .enumerate()
            .map(|(i, w)| format!(" {:<width$} ", cells.get(i).copied().unwrap_or(""), width = w))
            .collect();
        format!("|{}|", padded.join("|"))
    };

    let mut lines = vec![border.clone(), render(headers.to_vec()), border.clone()];
    for row in rows {
        lines.push(render(row.iter().map(String::as_str).collect()));
    }
    lines.push(border);
    lines
}
