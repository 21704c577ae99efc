//! Terminal output helpers for the CLI

use owo_colors::{OwoColorize, Style};
use std::sync::OnceLock;
use tabled::{settings::Style as TableStyle, Table, Tabled};

static THEME: OnceLock<Theme> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Theme {
    pub header: Style,
    pub success: Style,
    pub error: Style,
    pub warn: Style,
    pub dim: Style,
}

impl Theme {
    pub fn detect() -> Self {
        if !console::Term::stdout().is_term() {
            return Self::plain();
        }
        Self::colored()
    }

    pub fn colored() -> Self {
        Self {
            header: Style::new().cyan().bold(),
            success: Style::new().green().bold(),
            error: Style::new().red().bold(),
            warn: Style::new().yellow().bold(),
            dim: Style::new().white().dimmed(),
        }
    }

    pub fn plain() -> Self {
        Self {
            header: Style::new(),
            success: Style::new(),
            error: Style::new(),
            warn: Style::new(),
            dim: Style::new(),
        }
    }
}

pub fn theme() -> &'static Theme {
    THEME.get_or_init(Theme::detect)
}

pub struct Icons;

impl Icons {
    pub const CHECK: &str = "✅";
    pub const CROSS: &str = "❌";
    pub const WARN: &str = "⚠️";
    pub const DATABASE: &str = "🗄️";
    pub const SEARCH: &str = "🔍";
    pub const CLOCK: &str = "⏱️";
}

pub fn header(text: &str) {
    println!("{} {}", Icons::DATABASE, text.style(theme().header.clone()));
}

pub fn success(label: &str) {
    println!("{} {}", Icons::CHECK, label.style(theme().success.clone()));
}

pub fn error(label: &str) {
    eprintln!("{} {}", Icons::CROSS, label.style(theme().error.clone()));
}

pub fn warn(label: &str) {
    eprintln!("{} {}", Icons::WARN, label.style(theme().warn.clone()));
}

pub fn status(label: &str, value: &str) {
    println!("  {}: {}", label.style(theme().dim.clone()), value);
}

/// One audit entry rendered in the trail table
#[derive(Tabled)]
pub struct AuditRow {
    #[tabled(rename = "Id")]
    pub id: i64,
    #[tabled(rename = "Event")]
    pub event: String,
    #[tabled(rename = "Resource")]
    pub resource: String,
    #[tabled(rename = "Actor")]
    pub actor: String,
    #[tabled(rename = "When")]
    pub when: String,
}

pub fn audit_table(rows: &[AuditRow]) -> String {
    if rows.is_empty() {
        return String::new();
    }
    Table::new(rows).with(TableStyle::rounded()).to_string()
}
