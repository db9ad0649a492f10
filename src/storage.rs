use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{BackupError, BackupResult};
use crate::models::{
    AppState, Collection, Entry, Record, RecordId, Role, Theme, new_record_id, now_iso,
};
use crate::reconcile::merge_into;

pub const APP_DIR: &str = ".besideyou";
pub const STATE_FILE: &str = "state.json";
pub const CONFIG_FILE: &str = "config.json";
pub const EXPORT_MARKER_FILE: &str = "export_marker.json";
const UNREADABLE_SUFFIX: &str = "unreadable";
const PRIVATE_FILE_MODE: u32 = 0o600;
const PRIVATE_DIR_MODE: u32 = 0o700;

/// Entries needed before the backup reminder appears at all.
const NUDGE_MIN_ENTRIES: usize = 5;
/// New entries since the last export that bring the reminder back.
const NUDGE_NEW_ENTRIES: usize = 10;

#[derive(Serialize, Deserialize)]
pub struct Config {
    pub data_dir: String,
}

/// When the user last exported and how many entries existed at the time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportMarker {
    pub last_export: String,
    pub entries_at_last_export: usize,
}

/// How `load` came by the state it returned.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Fresh,
    Loaded,
    /// Persisted data existed but could not be used; defaults were taken.
    Recovered(String),
}

pub fn default_base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("Could not determine home directory"))?;
    Ok(home.join(APP_DIR))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(default_base_dir()?.join(CONFIG_FILE))
}

pub fn load_config() -> Result<Option<Config>> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    let cfg: Config = serde_json::from_str(&raw)?;
    Ok(Some(cfg))
}

pub fn save_config(data_dir: &Path) -> Result<()> {
    let cfg = Config {
        data_dir: data_dir
            .to_str()
            .ok_or_else(|| anyhow!("Invalid data dir path"))?
            .to_string(),
    };
    let data = serde_json::to_string_pretty(&cfg)?;
    ensure_private_dir(&default_base_dir()?)?;
    write_private(&config_path()?, data.as_bytes())
}

/// Picks the data directory: an explicit override wins, then the configured
/// directory, then `~/.besideyou`.
pub fn resolve_data_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    if let Some(cfg) = load_config()? {
        return validate_data_dir(Path::new(&cfg.data_dir));
    }
    default_base_dir()
}

/// A data directory named in the config file. Relative paths are taken from
/// the home directory, and the result has to stay there: no `..`, and no
/// symlink on the way that leads somewhere else.
pub fn validate_data_dir(raw: &Path) -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("Could not determine home directory"))?;
    let dir = home.join(raw);
    if dir.components().any(|c| c == Component::ParentDir) {
        return Err(anyhow!(
            "Data directory {} may not contain `..`",
            dir.display()
        ));
    }

    let home_real = fs::canonicalize(&home).unwrap_or_else(|_| home.clone());
    let resolved = match dir.ancestors().find(|p| p.exists()) {
        Some(existing) => Some(fs::canonicalize(existing)?),
        None => None,
    };
    let inside = dir.starts_with(&home)
        && resolved.is_none_or(|real| real.starts_with(&home_real));
    if !inside {
        return Err(anyhow!(
            "Data directory {} is outside your home directory ({})",
            dir.display(),
            home.display()
        ));
    }
    Ok(dir)
}

/// Writes an exported backup to a path the user picked. The folder has to
/// exist already; the file is readable by its owner only.
pub fn write_backup_file(path: &Path, bytes: &[u8]) -> BackupResult<()> {
    let folder = parent_dir(path);
    if !folder.is_dir() {
        return Err(BackupError::StorageUnavailable(format!(
            "folder {} does not exist",
            folder.display()
        )));
    }
    write_private(path, bytes)
        .map_err(|e| BackupError::StorageUnavailable(format!("{}: {e}", path.display())))
}

/// Owner of the application state and of its on-disk copy.
///
/// Every mutating method persists before returning. A failed write is
/// logged and remembered (see [`StateStore::is_durable`]) but never
/// propagated: the session keeps working from memory.
pub struct StateStore {
    state_path: PathBuf,
    marker_path: PathBuf,
    state: AppState,
    durable: bool,
}

impl StateStore {
    pub fn open(data_dir: &Path) -> (Self, LoadOutcome) {
        let state_path = data_dir.join(STATE_FILE);
        let (mut state, outcome) = Self::load(&state_path);
        if matches!(outcome, LoadOutcome::Recovered(_)) {
            preserve_unreadable(&state_path);
        }
        let filled = state.fill_missing_ids();
        let mut store = Self {
            state_path,
            marker_path: data_dir.join(EXPORT_MARKER_FILE),
            state,
            durable: true,
        };
        if filled > 0 {
            info!(records = filled, "gave ids to records saved without one");
            store.save();
        }
        (store, outcome)
    }

    /// Reads the persisted state. Never fails: anything unusable yields the
    /// default state and a `Recovered` outcome.
    pub fn load(path: &Path) -> (AppState, LoadOutcome) {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return (AppState::default(), LoadOutcome::Fresh);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "saved state unreadable; using defaults");
                return (AppState::default(), LoadOutcome::Recovered(e.to_string()));
            }
        };
        match serde_json::from_slice::<AppState>(&raw) {
            Ok(state) => (state, LoadOutcome::Loaded),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "saved state unparseable; using defaults");
                (AppState::default(), LoadOutcome::Recovered(e.to_string()))
            }
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Whether the last write reached the disk.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn save(&mut self) -> bool {
        let written = serde_json::to_vec(&self.state)
            .map_err(anyhow::Error::from)
            .and_then(|data| {
                ensure_private_dir(parent_dir(&self.state_path))?;
                write_private(&self.state_path, &data)
            });
        self.durable = match written {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %self.state_path.display(), error = %e, "could not persist state; keeping it in memory");
                false
            }
        };
        self.durable
    }

    /// Inserts at the head of the record's collection, assigning an id when
    /// it has none, and persists.
    pub fn mutate(&mut self, entry: Entry) -> RecordId {
        let s = &mut self.state;
        let id = match entry {
            Entry::CheckIn(r) => push_front(&mut s.checkins, r),
            Entry::Symptom(r) => push_front(&mut s.symptoms, r),
            Entry::Medication(r) => push_front(&mut s.medications, r),
            Entry::Appointment(r) => push_front(&mut s.appointments, r),
            Entry::GoodDay(r) => push_front(&mut s.gooddays, r),
            Entry::Journal(r) => push_front(&mut s.journal, r),
            Entry::DoctorQuestion(r) => push_front(&mut s.doctor_questions, r),
            Entry::Handoff(r) => push_front(&mut s.handoffs, r),
        };
        self.save();
        id
    }

    /// Removes the record with `id` and persists; returns whether one was
    /// found.
    pub fn delete(&mut self, collection: Collection, id: &RecordId) -> bool {
        let s = &mut self.state;
        let removed = match collection {
            Collection::CheckIns => remove_by_id(&mut s.checkins, id),
            Collection::Symptoms => remove_by_id(&mut s.symptoms, id),
            Collection::Medications => remove_by_id(&mut s.medications, id),
            Collection::Appointments => remove_by_id(&mut s.appointments, id),
            Collection::GoodDays => remove_by_id(&mut s.gooddays, id),
            Collection::Journal => remove_by_id(&mut s.journal, id),
            Collection::DoctorQuestions => remove_by_id(&mut s.doctor_questions, id),
            Collection::Handoffs => remove_by_id(&mut s.handoffs, id),
        };
        self.save();
        removed
    }

    /// Flips a doctor-question's `done` flag; `None` when no such question.
    pub fn toggle_question(&mut self, id: &RecordId) -> Option<bool> {
        let question = self
            .state
            .doctor_questions
            .iter_mut()
            .find(|q| &q.id == id)?;
        question.done = !question.done;
        let done = question.done;
        self.save();
        Some(done)
    }

    /// Picking a role completes onboarding.
    pub fn set_role(&mut self, role: Role) {
        self.state.role = Some(role);
        self.state.onboarded = true;
        self.save();
    }

    pub fn toggle_theme(&mut self) -> Theme {
        self.state.theme = self.state.theme.toggled();
        self.save();
        self.state.theme
    }

    pub fn dismiss_panel(&mut self, panel: &str) -> bool {
        if self.state.dismissed_welcome.iter().any(|p| p == panel) {
            return false;
        }
        self.state.dismissed_welcome.push(panel.to_string());
        self.save();
        true
    }

    pub fn restore_panel(&mut self, panel: &str) -> bool {
        let before = self.state.dismissed_welcome.len();
        self.state.dismissed_welcome.retain(|p| p != panel);
        if self.state.dismissed_welcome.len() == before {
            return false;
        }
        self.save();
        true
    }

    /// Swaps in a complete state in one step and persists it.
    pub fn replace_all(&mut self, mut state: AppState) {
        state.fill_missing_ids();
        self.state = state;
        self.save();
    }

    /// Merges `incoming` into the current state in one step; returns how
    /// many records were added.
    pub fn merge_all(&mut self, incoming: AppState) -> usize {
        let mut next = self.state.clone();
        let added = merge_into(&mut next, incoming);
        self.replace_all(next);
        added
    }

    /// Forgets everything: persisted state, export history and memory.
    pub fn clear_all(&mut self) {
        for path in [&self.state_path, &self.marker_path] {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove"),
            }
        }
        self.state = AppState::default();
        info!("all local data cleared");
    }

    pub fn export_marker(&self) -> Option<ExportMarker> {
        let raw = fs::read(&self.marker_path).ok()?;
        serde_json::from_slice(&raw)
            .map_err(|e| warn!(error = %e, "ignoring unreadable export marker"))
            .ok()
    }

    pub fn record_export(&self) {
        let marker = ExportMarker {
            last_export: now_iso(),
            entries_at_last_export: self.state.total_entries(),
        };
        let written = serde_json::to_vec_pretty(&marker)
            .map_err(anyhow::Error::from)
            .and_then(|data| {
                ensure_private_dir(parent_dir(&self.marker_path))?;
                write_private(&self.marker_path, &data)
            });
        if let Err(e) = written {
            warn!(error = %e, "could not record export time");
        }
    }

    pub fn should_show_nudge(&self) -> bool {
        nudge_due(self.state.total_entries(), self.export_marker().as_ref())
    }
}

pub fn nudge_due(total: usize, marker: Option<&ExportMarker>) -> bool {
    if total <= NUDGE_MIN_ENTRIES {
        return false;
    }
    match marker {
        None => true,
        Some(m) => total.saturating_sub(m.entries_at_last_export) >= NUDGE_NEW_ENTRIES,
    }
}

fn push_front<T: Record>(records: &mut Vec<T>, mut record: T) -> RecordId {
    if record.id().is_unset() {
        let mut id = new_record_id();
        let taken: HashSet<RecordId> = records.iter().map(|r| r.id().clone()).collect();
        while taken.contains(&id) {
            id = new_record_id();
        }
        *record.id_mut() = id;
    }
    let id = record.id().clone();
    records.insert(0, record);
    id
}

fn remove_by_id<T: Record>(records: &mut Vec<T>, id: &RecordId) -> bool {
    let before = records.len();
    records.retain(|r| r.id() != id);
    records.len() != before
}

/// Keeps a copy of a state file we could not read so the next save does not
/// destroy it.
fn preserve_unreadable(path: &Path) {
    if !path.exists() {
        return;
    }
    let mut target = path.as_os_str().to_owned();
    target.push(format!(".{UNREADABLE_SUFFIX}"));
    match fs::copy(path, &target) {
        Ok(_) => info!(copy = ?target, "kept a copy of the unreadable state file"),
        Err(e) => warn!(error = %e, "could not keep a copy of the unreadable state file"),
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Creates the data directory owner-only; an existing one is left as is.
fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        restrict(dir, PRIVATE_DIR_MODE)?;
    }
    Ok(())
}

/// Replaces `path` with a single rename, so a crash leaves either the old or
/// the new content. Permissions are set on the temporary file first; the
/// data is never readable by others, not even briefly.
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut temp = tempfile::NamedTempFile::new_in(parent_dir(path))?;
    temp.write_all(bytes)?;
    temp.flush()?;
    temp.as_file().sync_all()?;
    restrict(temp.path(), PRIVATE_FILE_MODE)?;
    temp.persist(path)
        .map_err(|e| anyhow!("Could not replace {}: {}", path.display(), e.error))?;
    Ok(())
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DoctorQuestion, GoodDay, JournalEntry, Symptom};

    fn symptom(name: &str) -> Entry {
        Entry::Symptom(Symptom {
            date: now_iso(),
            name: name.into(),
            severity: 4,
            ..Default::default()
        })
    }

    #[test]
    fn missing_file_loads_fresh_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (store, outcome) = StateStore::open(dir.path());
        assert_eq!(outcome, LoadOutcome::Fresh);
        assert_eq!(store.state(), &AppState::default());
    }

    #[test]
    fn mutations_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = StateStore::open(dir.path());
        let nausea = store.mutate(symptom("Nausea"));
        store.mutate(symptom("Fatigue"));
        store.mutate(Entry::Journal(JournalEntry {
            date: now_iso(),
            text: "Long day".into(),
            ..Default::default()
        }));
        assert!(store.delete(Collection::Symptoms, &nausea));
        assert!(store.is_durable());

        let (reloaded, outcome) = StateStore::open(dir.path());
        assert_eq!(outcome, LoadOutcome::Loaded);
        assert_eq!(reloaded.state(), store.state());
        assert_eq!(reloaded.state().symptoms[0].name, "Fatigue");
    }

    #[test]
    fn mutate_inserts_newest_first_and_keeps_given_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = StateStore::open(dir.path());
        store.mutate(Entry::GoodDay(GoodDay {
            id: RecordId::Number(7),
            text: "Sunshine".into(),
            ..Default::default()
        }));
        let second = store.mutate(Entry::GoodDay(GoodDay {
            text: "Walk".into(),
            ..Default::default()
        }));
        let ids: Vec<String> = store.state().gooddays.iter().map(|g| g.id.key()).collect();
        assert_eq!(ids, vec![second.key(), "7".to_string()]);
    }

    #[test]
    fn delete_of_unknown_id_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = StateStore::open(dir.path());
        store.mutate(symptom("Pain"));
        let before = store.state().clone();
        assert!(!store.delete(Collection::Symptoms, &RecordId::from("missing")));
        assert_eq!(store.state(), &before);
    }

    #[test]
    fn delete_saves_even_when_nothing_matched() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        let (mut store, _) = StateStore::open(&blocker.join("data"));
        assert!(store.is_durable());
        assert!(!store.delete(Collection::Journal, &RecordId::from("missing")));
        assert!(!store.is_durable());
    }

    #[test]
    fn records_saved_without_ids_get_ids_that_stick() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(STATE_FILE),
            br#"{"journal":[{"date":"2024-01-01T00:00:00Z","text":"no id"},{"id":null,"date":"2024-01-02T00:00:00Z","text":"null id"}]}"#,
        )
        .unwrap();
        let (mut store, outcome) = StateStore::open(dir.path());
        assert_eq!(outcome, LoadOutcome::Loaded);
        let ids: Vec<RecordId> = store.state().journal.iter().map(|j| j.id.clone()).collect();
        assert!(ids.iter().all(|id| !id.is_unset()));

        let on_disk: AppState =
            serde_json::from_slice(&fs::read(dir.path().join(STATE_FILE)).unwrap()).unwrap();
        let saved: Vec<RecordId> = on_disk.journal.iter().map(|j| j.id.clone()).collect();
        assert_eq!(saved, ids);

        assert!(store.delete(Collection::Journal, &ids[0]));
        let (reloaded, _) = StateStore::open(dir.path());
        assert_eq!(reloaded.state().journal.len(), 1);
        assert_eq!(reloaded.state().journal[0].id, ids[1]);
    }

    #[test]
    fn corrupt_file_recovers_to_defaults_and_is_kept_aside() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(STATE_FILE), b"{not json").unwrap();
        let (store, outcome) = StateStore::open(dir.path());
        assert!(matches!(outcome, LoadOutcome::Recovered(_)));
        assert_eq!(store.state(), &AppState::default());
        assert!(dir.path().join("state.json.unreadable").exists());
    }

    #[test]
    fn legacy_numeric_ids_can_be_deleted_by_text() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(STATE_FILE),
            br#"{"role":"patient","onboarded":true,"symptoms":[{"id":1718000000000,"date":"2024-06-10T09:00:00.000Z","name":"Pain","severity":6,"notes":""}]}"#,
        )
        .unwrap();
        let (mut store, outcome) = StateStore::open(dir.path());
        assert_eq!(outcome, LoadOutcome::Loaded);
        assert!(store.delete(Collection::Symptoms, &RecordId::from("1718000000000")));
        assert!(store.state().symptoms.is_empty());
    }

    #[test]
    fn unwritable_location_keeps_working_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        let (mut store, _) = StateStore::open(&blocker.join("data"));
        store.mutate(symptom("Headache"));
        assert!(!store.is_durable());
        assert_eq!(store.state().symptoms.len(), 1);
    }

    #[test]
    fn question_toggle_panels_and_theme() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = StateStore::open(dir.path());
        let id = store.mutate(Entry::DoctorQuestion(DoctorQuestion {
            text: "Can I drive?".into(),
            ..Default::default()
        }));
        assert_eq!(store.toggle_question(&id), Some(true));
        assert_eq!(store.toggle_question(&id), Some(false));
        assert_eq!(store.toggle_question(&RecordId::from("x")), None);

        assert!(store.dismiss_panel("symptoms"));
        assert!(!store.dismiss_panel("symptoms"));
        assert!(store.restore_panel("symptoms"));
        assert!(!store.restore_panel("symptoms"));

        assert_eq!(store.toggle_theme(), Theme::Light);
        store.set_role(Role::Carer);
        let (reloaded, _) = StateStore::open(dir.path());
        assert_eq!(reloaded.state().theme, Theme::Light);
        assert_eq!(reloaded.state().role, Some(Role::Carer));
        assert!(reloaded.state().onboarded);
    }

    #[test]
    fn clear_all_resets_state_and_export_history() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = StateStore::open(dir.path());
        store.mutate(symptom("Pain"));
        store.record_export();
        assert!(store.export_marker().is_some());

        store.clear_all();
        assert_eq!(store.state(), &AppState::default());
        assert!(store.export_marker().is_none());
        assert!(!dir.path().join(STATE_FILE).exists());
    }

    #[test]
    fn nudge_thresholds() {
        assert!(!nudge_due(5, None));
        assert!(nudge_due(6, None));
        let marker = ExportMarker {
            last_export: "2024-01-01T00:00:00.000Z".into(),
            entries_at_last_export: 20,
        };
        assert!(!nudge_due(29, Some(&marker)));
        assert!(nudge_due(30, Some(&marker)));
        assert!(!nudge_due(3, Some(&marker)));
    }

    #[test]
    fn merge_all_commits_in_one_step() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = StateStore::open(dir.path());
        store.mutate(symptom("Pain"));
        let mut incoming = AppState::default();
        incoming.journal.push(JournalEntry {
            id: RecordId::from("j1"),
            date: "2024-01-01".into(),
            text: "hello".into(),
            ..Default::default()
        });
        assert_eq!(store.merge_all(incoming), 1);
        let (reloaded, _) = StateStore::open(dir.path());
        assert_eq!(reloaded.state().total_entries(), 2);
    }

    #[test]
    fn backups_need_an_existing_folder_and_stay_private() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope").join("backup.json");
        let err = write_backup_file(&missing, b"{}").unwrap_err();
        assert!(matches!(err, BackupError::StorageUnavailable(_)));
        assert!(!dir.path().join("nope").exists());

        let out = dir.path().join("backup.json");
        write_backup_file(&out, b"{}").unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"{}");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&out).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, PRIVATE_FILE_MODE);
        }
    }

    #[test]
    fn configured_dirs_outside_home_are_rejected() {
        assert!(validate_data_dir(Path::new("/definitely/not/home/besideyou")).is_err());
        assert!(validate_data_dir(Path::new(".besideyou/../../etc")).is_err());
    }
}
