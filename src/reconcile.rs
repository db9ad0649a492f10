//! Applies a decoded backup to the local state, either replacing it or
//! merging into it.

use std::collections::HashSet;
use std::fmt;

use tracing::info;

use crate::backup::DecodedBackup;
use crate::models::{AppState, Record, RecordId, parse_instant};
use crate::storage::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPolicy {
    Replace,
    Merge,
}

impl fmt::Display for ImportPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImportPolicy::Replace => "replace",
            ImportPolicy::Merge => "merge",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportReport {
    pub policy: ImportPolicy,
    /// Entries now restored (replace) or newly added (merge).
    pub entries: usize,
}

impl fmt::Display for ImportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.policy {
            ImportPolicy::Replace => write!(f, "Restored {} entries ✓", self.entries),
            ImportPolicy::Merge => write!(f, "Added {} new entries ✓", self.entries),
        }
    }
}

/// Commits `backup` to the store under `policy`. This is the only step that
/// touches local state, and it happens in one call.
pub fn apply(store: &mut StateStore, backup: DecodedBackup, policy: ImportPolicy) -> ImportReport {
    let entries = match policy {
        ImportPolicy::Replace => {
            store.replace_all(backup.state);
            store.state().total_entries()
        }
        ImportPolicy::Merge => store.merge_all(backup.state),
    };
    info!(%policy, entries, durable = store.is_durable(), "backup imported");
    ImportReport { policy, entries }
}

/// Merges `incoming` into `local`. Local records win on id collisions and
/// local scalars are only filled in when unset. Returns how many records were
/// added. Applying the same `incoming` twice adds nothing the second time,
/// including records that arrived without an id.
pub fn merge_into(local: &mut AppState, mut incoming: AppState) -> usize {
    incoming.fill_missing_ids();
    let mut added = 0;
    added += merge_collection(&mut local.checkins, incoming.checkins);
    added += merge_collection(&mut local.symptoms, incoming.symptoms);
    added += merge_collection(&mut local.medications, incoming.medications);
    added += merge_collection(&mut local.appointments, incoming.appointments);
    added += merge_collection(&mut local.gooddays, incoming.gooddays);
    added += merge_collection(&mut local.journal, incoming.journal);
    added += merge_collection(&mut local.doctor_questions, incoming.doctor_questions);
    added += merge_collection(&mut local.handoffs, incoming.handoffs);

    if local.role.is_none() {
        local.role = incoming.role;
    }
    local.onboarded |= incoming.onboarded;
    added
}

fn merge_collection<T: Record>(local: &mut Vec<T>, incoming: Vec<T>) -> usize {
    let mut seen: HashSet<RecordId> = local.iter().map(|r| r.id().clone()).collect();
    let mut added = 0;
    for record in incoming {
        if seen.insert(record.id().clone()) {
            local.push(record);
            added += 1;
        }
    }
    sort_newest_first(local);
    added
}

/// Orders dated records newest first among the slots dated records already
/// occupy. Undated records never move. Ties keep their relative order.
pub fn sort_newest_first<T: Record>(records: &mut Vec<T>) {
    let mut slots = Vec::new();
    let mut dated = Vec::new();
    let mut placed: Vec<Option<T>> = Vec::with_capacity(records.len());
    for (slot, record) in records.drain(..).enumerate() {
        match record.date().and_then(parse_instant) {
            Some(at) => {
                slots.push(slot);
                dated.push((at, record));
                placed.push(None);
            }
            None => placed.push(Some(record)),
        }
    }
    dated.sort_by(|a, b| b.0.cmp(&a.0));
    for (slot, (_, record)) in slots.into_iter().zip(dated) {
        placed[slot] = Some(record);
    }
    records.extend(placed.into_iter().flatten());
}

/// One-line description of a backup for the confirmation step.
pub fn preview(backup: &DecodedBackup) -> String {
    let summary = backup.effective_summary();
    let (earliest, latest) = match &summary.date_range {
        Some(range) => (range.earliest.as_str(), range.latest.as_str()),
        None => ("unknown", "unknown"),
    };
    format!(
        "This file contains {} entries from {earliest} to {latest}.",
        summary.total_entries
    )
}
