//! Fixed-width text rendering of a usage snapshot
//!
//! ```text
//! 5h        [######--------------]  30% resets in 2h 10m
//! Weekly    [###-----------------]  15% resets in 3d 4h
//! Credits: 12.50
//! ```

use crate::snapshot::{Credits, UsageSnapshot, UsageWindow};

const BAR_WIDTH: usize = 20;
const LABEL_WIDTH: usize = 10;

/// Render both windows and, when known, the credits line. `None` renders
/// both bars as `unknown`.
pub fn render_snapshot(snapshot: Option<&UsageSnapshot>, is_stale: bool, now: u64) -> String {
    let (primary, secondary, credits) = match snapshot {
        Some(s) => (Some(&s.primary), Some(&s.secondary), Some(&s.credits)),
        None => (None, None, None),
    };

    let mut lines = vec![
        render_window(primary, "Primary", now),
        render_window(secondary, "Secondary", now),
    ];
    if is_stale {
        lines[0].push_str(" (stale)");
    }
    if let Some(line) = credits.and_then(render_credits) {
        lines.push(line);
    }
    lines.join("\n")
}

fn render_window(window: Option<&UsageWindow>, fallback_label: &str, now: u64) -> String {
    let label = window
        .and_then(|w| w.window_minutes)
        .map(window_label)
        .unwrap_or_else(|| fallback_label.to_string());

    let Some(pct) = window.and_then(|w| w.used_percent) else {
        return format!("{label:<LABEL_WIDTH$}unknown");
    };
    let filled = ((pct / 100.0) * BAR_WIDTH as f64).round() as usize;
    let filled = filled.min(BAR_WIDTH);
    let bar = format!("{}{}", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled));

    let mut line = format!("{label:<LABEL_WIDTH$}[{bar}] {:>3.0}%", pct);
    if let Some(reset) = window.and_then(|w| w.reset_at).filter(|r| *r > now) {
        line.push_str(" resets in ");
        line.push_str(&compact_duration(reset - now));
    }
    line
}

fn render_credits(credits: &Credits) -> Option<String> {
    if credits.unlimited == Some(true) {
        return Some("Credits: unlimited".into());
    }
    if let Some(balance) = &credits.balance {
        return Some(format!("Credits: {balance}"));
    }
    if credits.has_credits == Some(false) {
        return Some("Credits: none".into());
    }
    None
}

/// Human label for a window length in minutes.
pub fn window_label(minutes: u64) -> String {
    match minutes {
        300 => "5h".into(),
        10_080 => "Weekly".into(),
        m if m >= 1_440 && m % 1_440 == 0 => format!("{}d", m / 1_440),
        m if m >= 60 && m % 60 == 0 => format!("{}h", m / 60),
        m => format!("{m}m"),
    }
}

fn compact_duration(millis: u64) -> String {
    let minutes = millis / 60_000;
    let (days, hours, mins) = (minutes / 1_440, (minutes % 1_440) / 60, minutes % 60);
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else if mins > 0 {
        format!("{mins}m")
    } else {
        "<1m".into()
    }
}
