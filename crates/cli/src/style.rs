//! Output helpers: styled messages and a printer that honours `--quiet`.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold).
pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

/// Create a dim-styled string.
pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}

/// Color one itemized rsync line by what it does.
pub fn change(flags: &str, path: &str) -> String {
    let style = if flags.starts_with("*deleting") {
        Style::new().red()
    } else if flags.contains('+') {
        Style::new().green()
    } else {
        Style::new().yellow()
    };
    format!("{} {}", style.apply_to(format!("{:<11}", flags)), path)
}

/// Stdout printer; silent with `-q`.
#[derive(Debug, Clone, Copy)]
pub struct Printer {
    quiet: bool,
}

impl Printer {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    pub fn line(&self, msg: impl AsRef<str>) {
        if !self.quiet {
            println!("{}", msg.as_ref());
        }
    }

    pub fn blank(&self) {
        self.line("");
    }

    /// Print multi-line text as is, without adding a newline.
    pub fn text(&self, text: &str) {
        if !self.quiet {
            print!("{}", text);
        }
    }

    /// Spinner shown while rsync runs. Hidden with `-q`.
    pub fn spinner(&self, msg: String) -> ProgressBar {
        if self.quiet {
            return ProgressBar::hidden();
        }
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.blue} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.set_message(msg);
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner
    }
}
