use std::io::{stderr, Stderr, Write};

use crossterm::cursor::MoveToColumn;
use crossterm::style::Print;
use crossterm::terminal::{Clear, ClearType};
use crossterm::{execute, queue};

/// Single-line transfer progress, redrawn in place on stderr.
pub struct ProgressLine {
    out: Stderr,
    name: String,
    total: u64,
}

impl ProgressLine {
    pub fn new(name: impl Into<String>, total: u64) -> Self {
        Self {
            out: stderr(),
            name: name.into(),
            total,
        }
    }

    pub fn update(&mut self, done: u64) {
        let line = format!("{}  {}", self.name, describe(done, self.total));
        let _ = queue!(self.out, MoveToColumn(0), Clear(ClearType::CurrentLine), Print(line));
        let _ = self.out.flush();
    }

    pub fn message(&mut self, text: &str) {
        let _ = execute!(
            self.out,
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            Print(format!("{}  {}\n", self.name, text))
        );
    }
}

fn describe(done: u64, total: u64) -> String {
    const WIDTH: u64 = 30;
    let filled = if total == 0 { WIDTH } else { done.min(total) * WIDTH / total };
    let percent = if total == 0 { 100 } else { done.min(total) * 100 / total };
    format!(
        "[{}{}] {:>3}%  {}/{}",
        "#".repeat(filled as usize),
        " ".repeat((WIDTH - filled) as usize),
        percent,
        human(done),
        human(total)
    )
}

fn human(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_humanized() {
        assert_eq!(human(512), "512 B");
        assert_eq!(human(1536), "1.5 KiB");
        assert_eq!(human(10 * 1024 * 1024), "10.0 MiB");
    }

    #[test]
    fn bar_is_clamped_and_handles_empty_files() {
        assert!(describe(50, 100).contains(" 50%"));
        assert!(describe(200, 100).contains("100%"));
        assert!(describe(0, 0).contains("100%"));
    }
}
