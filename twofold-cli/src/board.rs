//! Plain-text rendering of the code board.

use twofold_core::AuthCodeView;

/// Split a code into two halves for readability: `123456` -> `123 456`.
pub fn group_code(code: &str) -> String {
    if code.len() < 6 || !code.is_ascii() {
        return code.to_string();
    }
    let (head, tail) = code.split_at(code.len() / 2);
    format!("{} {}", head, tail)
}

/// Countdown bar with one cell per two seconds.
pub fn countdown_bar(remaining: u32) -> String {
    let filled = remaining.div_ceil(2).min(15) as usize;
    format!("[{}{}] {:>2}s", "#".repeat(filled), ".".repeat(15 - filled), remaining)
}

pub fn render_board(views: &[AuthCodeView], remaining: u32) -> String {
    if views.is_empty() {
        return "No secrets yet. Add one with `twofold add`.\n".to_string();
    }

    let name_width = views.iter().map(|v| v.name.chars().count()).max().unwrap_or(0);
    let mut out = String::new();
    for view in views {
        let code = if view.code.is_empty() {
            "------".to_string()
        } else {
            group_code(&view.code)
        };
        out.push_str(&format!("{:<width$}  {}", view.name, code, width = name_width));
        if !view.issuer.is_empty() {
            out.push_str(&format!("  {}", view.issuer));
        }
        out.push('\n');
    }
    out.push_str(&countdown_bar(remaining));
    out.push('\n');
    out
}

/// Codes in board order, for detecting whether a recompute changed anything.
pub fn codes_of(views: &[AuthCodeView]) -> Vec<String> {
    views.iter().map(|v| v.code.clone()).collect()
}
