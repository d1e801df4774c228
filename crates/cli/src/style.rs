//! Shared styling utilities for the CLI.

use console::Style;

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

/// Create a header-styled string (bold, white).
pub fn header(msg: &str) -> String {
    let style = Style::new().bold();
    style.apply_to(msg).to_string()
}

/// Create a dim-styled string.
pub fn dim(msg: &str) -> String {
    let style = Style::new().dim();
    style.apply_to(msg).to_string()
}

/// Round label, e.g. `[round 2/10]` (cyan).
pub fn round(n: u32, max: u32) -> String {
    let style = Style::new().cyan().bold();
    style.apply_to(format!("[round {n}/{max}]")).to_string()
}

/// Yes/no indicator for conflict state.
pub fn conflicts(has_conflicts: bool) -> String {
    if has_conflicts {
        let style = Style::new().red().bold();
        format!("{} Conflicted", style.apply_to("●"))
    } else {
        let style = Style::new().green();
        format!("{} Mergeable", style.apply_to("●"))
    }
}
