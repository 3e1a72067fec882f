//! Per-service colored log multiplexing.
//!
//! Each followed container gets its own task that prints prefixed lines to
//! stdout; stdout itself serializes the interleaving.

use crate::cluster::LogReceiver;
use colored::{Color, Colorize};
use tokio::task::JoinHandle;

/// Colors handed out to services, in order.
pub const PALETTE: [Color; 7] = [
    Color::Cyan,
    Color::Yellow,
    Color::Green,
    Color::Magenta,
    Color::Blue,
    Color::Red,
    Color::White,
];

/// Assign colors to services in iteration order. When the palette runs out
/// the index restarts at the beginning instead of wrapping, so the service
/// hitting the boundary stays uncolored and reuse begins with the next one.
pub fn assign_colors(count: usize) -> Vec<Option<Color>> {
    let mut colors = Vec::with_capacity(count);
    let mut index = 0;
    for _ in 0..count {
        if index < PALETTE.len() {
            colors.push(Some(PALETTE[index]));
            index += 1;
        } else {
            colors.push(None);
            index = 0;
        }
    }
    colors
}

/// Format one log line: the service name padded to a fixed column, then the
/// raw line.
pub fn format_line(name: &str, color: Option<Color>, width: usize, line: &str) -> String {
    let padded = format!("{name:<width$}");
    let prefix = match color {
        Some(color) => padded.color(color).to_string(),
        None => padded,
    };
    format!("{prefix}| {line}")
}

/// Drain a log stream to stdout until it ends.
pub fn spawn_log_printer(
    mut rx: LogReceiver,
    name: String,
    color: Option<Color>,
    width: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            println!("{}", format_line(&name, color, width, &line));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_line_padding() {
        let line = format_line("db", None, 10, "ready to accept connections");
        assert_eq!(line, "db        | ready to accept connections");
    }

    #[test]
    fn test_assign_colors_resets_after_palette() {
        let colors = assign_colors(PALETTE.len() + 3);
        for (i, color) in colors.iter().take(PALETTE.len()).enumerate() {
            assert_eq!(*color, Some(PALETTE[i]));
        }
        // the service at the boundary gets no color, then reuse restarts
        assert_eq!(colors[PALETTE.len()], None);
        assert_eq!(colors[PALETTE.len() + 1], Some(PALETTE[0]));
        assert_eq!(colors[PALETTE.len() + 2], Some(PALETTE[1]));
    }
}
