//! Output formatting for CLI commands.

use colored::Colorize;
use serde::Serialize;

/// Supported output formats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable format (default).
    #[default]
    Table,
    /// JSON format.
    Json,
    /// Plain text (minimal formatting).
    Plain,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "plain" => Ok(OutputFormat::Plain),
            _ => Err(format!(
                "Unknown output format '{}'. Valid options: table, json, plain",
                s
            )),
        }
    }
}

/// Output formatter for consistent CLI output.
pub struct OutputFormatter {
    format: OutputFormat,
    quiet: bool,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat, quiet: bool) -> Self {
        Self { format, quiet }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn success(&self, message: &str) {
        if self.quiet {
            return;
        }
        match self.format {
            OutputFormat::Json => println!(
                "{}",
                serde_json::json!({"status": "success", "message": message})
            ),
            _ => println!("{} {}", "✓".green(), message),
        }
    }

    pub fn error(&self, message: &str) {
        match self.format {
            OutputFormat::Json => eprintln!(
                "{}",
                serde_json::json!({"status": "error", "message": message})
            ),
            _ => eprintln!("{} {}", "✗".red(), message),
        }
    }

    pub fn warn(&self, message: &str) {
        if self.quiet {
            return;
        }
        match self.format {
            OutputFormat::Json => eprintln!(
                "{}",
                serde_json::json!({"status": "warning", "message": message})
            ),
            _ => eprintln!("{} {}", "!".yellow(), message),
        }
    }

    pub fn section(&self, title: &str) {
        if self.quiet || self.format == OutputFormat::Json {
            return;
        }
        println!("\n{}", title.bold());
    }

    pub fn kv(&self, key: &str, value: &str) {
        if self.format == OutputFormat::Json {
            return;
        }
        println!("  {:<22} {}", format!("{}:", key).dimmed(), value);
    }

    pub fn line(&self, text: &str) {
        if self.format != OutputFormat::Json {
            println!("{}", text);
        }
    }

    /// Serialize the full payload; used by every command under `--format json`.
    pub fn json<T: Serialize>(&self, payload: &T) {
        if self.format == OutputFormat::Json {
            match serde_json::to_string_pretty(payload) {
                Ok(s) => println!("{}", s),
                Err(e) => eprintln!("{}", serde_json::json!({"status": "error", "message": e.to_string()})),
            }
        }
    }
}
