use std::fmt::Display;

use anyhow::{Result, anyhow};
use arboard::Clipboard;
use chrono::{DateTime, TimeZone};

use crate::models::Handoff;

const EMPTY_FIELD: &str = "—";

/// Plain-text summary a carer can paste into a message.
pub fn handoff_text<Tz>(handoff: &Handoff, at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!(
        "CARER HANDOFF — {}\n\nMedications: {}\nHow they're doing: {}\nThings to know: {}\nComing up: {}",
        at.format("%Y-%m-%d %H:%M"),
        or_dash(&handoff.meds),
        or_dash(&handoff.mood),
        or_dash(&handoff.notes),
        or_dash(&handoff.upcoming),
    )
}

fn or_dash(field: &str) -> &str {
    let trimmed = field.trim();
    if trimmed.is_empty() { EMPTY_FIELD } else { trimmed }
}

pub fn copy_to_clipboard(text: &str) -> Result<()> {
    let mut clipboard = Clipboard::new().map_err(|e| anyhow!("Clipboard unavailable: {e}"))?;
    clipboard
        .set_text(text.to_string())
        .map_err(|e| anyhow!("Could not copy: {e}"))?;
    Ok(())
}
