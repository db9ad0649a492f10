use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Fields a newer (or older) build wrote that this one does not model.
pub type Extra = BTreeMap<String, Value>;

const ID_SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;
const CONTENT_ID_PREFIX: &str = "rec";
const CONTENT_ID_BYTES: usize = 8;

/// Record identifier as found on disk.
///
/// Older data uses bare millisecond timestamps (JSON numbers), newer data
/// uses `"<millis>-<random>"` strings. Each is written back in the form it
/// was read; equality and hashing go through the text form so `1` and `"1"`
/// name the same record.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum RecordId {
    Number(i64),
    Text(String),
}

impl RecordId {
    pub fn is_unset(&self) -> bool {
        matches!(self, RecordId::Text(s) if s.is_empty())
    }

    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        RecordId::Text(String::new())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Number(n) => write!(f, "{n}"),
            RecordId::Text(s) => f.write_str(s),
        }
    }
}

impl PartialEq for RecordId {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for RecordId {}

impl Hash for RecordId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl From<&str> for RecordId {
    fn from(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(n) => RecordId::Number(n),
            Err(_) => RecordId::Text(raw.to_string()),
        }
    }
}

pub fn new_record_id() -> RecordId {
    let mut rng = rand::rngs::OsRng;
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_SUFFIX_ALPHABET[rng.gen_range(0..ID_SUFFIX_ALPHABET.len())] as char)
        .collect();
    RecordId::Text(format!("{}-{suffix}", Utc::now().timestamp_millis()))
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Interprets a stored `date` as an instant. Empty or unparseable values
/// yield `None`; calendar dates are taken as midnight UTC.
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn default_severity() -> u8 {
    5
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    #[serde(alias = "caregiver")]
    Carer,
    Supporter,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Patient => "patient",
            Role::Carer => "carer",
            Role::Supporter => "supporter",
        })
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "patient" => Ok(Role::Patient),
            "carer" | "caregiver" => Ok(Role::Carer),
            "supporter" => Ok(Role::Supporter),
            other => Err(format!(
                "unknown role '{other}' (expected patient, carer or supporter)"
            )),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Theme::Dark => Theme::Light,
            Theme::Light => Theme::Dark,
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Theme::Dark => "dark",
            Theme::Light => "light",
        })
    }
}

/// The eight user-generated collections, in display and summary order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    CheckIns,
    Symptoms,
    Medications,
    Appointments,
    GoodDays,
    Journal,
    DoctorQuestions,
    Handoffs,
}

impl Collection {
    pub const ALL: [Collection; 8] = [
        Collection::CheckIns,
        Collection::Symptoms,
        Collection::Medications,
        Collection::Appointments,
        Collection::GoodDays,
        Collection::Journal,
        Collection::DoctorQuestions,
        Collection::Handoffs,
    ];

    /// Key used in the persisted JSON document.
    pub fn key(self) -> &'static str {
        match self {
            Collection::CheckIns => "checkins",
            Collection::Symptoms => "symptoms",
            Collection::Medications => "medications",
            Collection::Appointments => "appointments",
            Collection::GoodDays => "gooddays",
            Collection::Journal => "journal",
            Collection::DoctorQuestions => "doctorQuestions",
            Collection::Handoffs => "handoffs",
        }
    }

    /// Label used in a backup summary's `categories`.
    pub fn category(self) -> &'static str {
        match self {
            Collection::CheckIns => "mood",
            Collection::Symptoms => "symptoms",
            Collection::Medications => "medication",
            Collection::Appointments => "appointments",
            Collection::GoodDays => "gooddays",
            Collection::Journal => "journal",
            Collection::DoctorQuestions => "questions",
            Collection::Handoffs => "handoffs",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace(['-', '_'], "");
        Collection::ALL
            .into_iter()
            .find(|c| c.key().to_ascii_lowercase() == wanted || c.category() == wanted)
            .ok_or_else(|| format!("unknown collection '{s}'"))
    }
}

/// Behaviour shared by every stored record kind.
pub trait Record: Serialize {
    const COLLECTION: Collection;

    fn id(&self) -> &RecordId;
    fn id_mut(&mut self) -> &mut RecordId;
    /// The timestamp used for ordering; `None` when the kind has none or it is blank.
    fn date(&self) -> Option<&str>;
    /// One-line description for listings.
    fn headline(&self) -> String;

    /// Gives a record that arrived without an id one derived from its
    /// content, so the same record gets the same id on every load and in
    /// every backup. Returns whether an id was filled in.
    fn fill_missing_id(&mut self) -> bool {
        if !self.id().is_unset() {
            return false;
        }
        let id = content_id(self);
        *self.id_mut() = id;
        true
    }
}

fn content_id<T: Serialize + ?Sized>(record: &T) -> RecordId {
    // serialisation of our records cannot fail: plain fields and JSON values
    let bytes = serde_json::to_vec(record).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let hex: String = digest[..CONTENT_ID_BYTES]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    RecordId::Text(format!("{CONTENT_ID_PREFIX}-{hex}"))
}

macro_rules! impl_record {
    ($ty:ty, $collection:expr, dated) => {
        impl Record for $ty {
            const COLLECTION: Collection = $collection;

            fn id(&self) -> &RecordId {
                &self.id
            }

            fn id_mut(&mut self) -> &mut RecordId {
                &mut self.id
            }

            fn date(&self) -> Option<&str> {
                non_blank(&self.date)
            }

            fn headline(&self) -> String {
                self.describe()
            }
        }
    };
    ($ty:ty, $collection:expr, undated) => {
        impl Record for $ty {
            const COLLECTION: Collection = $collection;

            fn id(&self) -> &RecordId {
                &self.id
            }

            fn id_mut(&mut self) -> &mut RecordId {
                &mut self.id
            }

            fn date(&self) -> Option<&str> {
                None
            }

            fn headline(&self) -> String {
                self.describe()
            }
        }
    };
}

fn non_blank(raw: &str) -> Option<&str> {
    Some(raw).filter(|d| !d.trim().is_empty())
}

fn join_parts(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" · ")
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CheckIn {
    #[serde(default, deserialize_with = "nullable")]
    pub id: RecordId,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub mood: String,
    #[serde(default, deserialize_with = "nullable")]
    pub symptoms: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub good: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl CheckIn {
    fn describe(&self) -> String {
        let mood = if self.mood.is_empty() { "check-in" } else { self.mood.as_str() };
        let symptoms = self.symptoms.join(", ");
        join_parts(&[mood, &symptoms, &self.notes])
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Symptom {
    #[serde(default, deserialize_with = "nullable")]
    pub id: RecordId,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_severity")]
    pub severity: u8,
    #[serde(default)]
    pub notes: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Default for Symptom {
    fn default() -> Self {
        Self {
            id: RecordId::default(),
            date: String::new(),
            name: String::new(),
            severity: default_severity(),
            notes: String::new(),
            extra: Extra::new(),
        }
    }
}

impl Symptom {
    fn describe(&self) -> String {
        let severity = format!("severity {}/10", self.severity);
        join_parts(&[&self.name, &severity, &self.notes])
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Medication {
    #[serde(default, deserialize_with = "nullable")]
    pub id: RecordId,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dose: String,
    #[serde(default)]
    pub frequency: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub questions: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Medication {
    fn describe(&self) -> String {
        let name = if self.dose.is_empty() {
            self.name.clone()
        } else {
            format!("{} — {}", self.name, self.dose)
        };
        join_parts(&[&name, &self.frequency, &self.purpose])
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Appointment {
    #[serde(default, deserialize_with = "nullable")]
    pub id: RecordId,
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Calendar date chosen by the user, `YYYY-MM-DD`; may be blank.
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub notes: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Appointment {
    fn describe(&self) -> String {
        let when = match (self.date.is_empty(), self.time.is_empty()) {
            (true, _) => "No date".to_string(),
            (false, true) => self.date.clone(),
            (false, false) => format!("{} at {}", self.date, self.time),
        };
        join_parts(&[&self.kind, &when, &self.location])
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct GoodDay {
    #[serde(default, deserialize_with = "nullable")]
    pub id: RecordId,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub text: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl GoodDay {
    fn describe(&self) -> String {
        self.text.clone()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct JournalEntry {
    #[serde(default, deserialize_with = "nullable")]
    pub id: RecordId,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub text: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl JournalEntry {
    fn describe(&self) -> String {
        self.text.clone()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DoctorQuestion {
    #[serde(default, deserialize_with = "nullable")]
    pub id: RecordId,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub done: bool,
    #[serde(flatten)]
    pub extra: Extra,
}

impl DoctorQuestion {
    fn describe(&self) -> String {
        let mark = if self.done { "[x]" } else { "[ ]" };
        format!("{mark} {}", self.text)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Handoff {
    #[serde(default, deserialize_with = "nullable")]
    pub id: RecordId,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub meds: String,
    #[serde(default)]
    pub mood: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub upcoming: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Handoff {
    pub fn is_blank(&self) -> bool {
        [&self.meds, &self.mood, &self.notes, &self.upcoming]
            .iter()
            .all(|s| s.trim().is_empty())
    }

    fn describe(&self) -> String {
        join_parts(&[&self.mood, &self.notes, &self.upcoming])
    }
}

impl_record!(CheckIn, Collection::CheckIns, dated);
impl_record!(Symptom, Collection::Symptoms, dated);
impl_record!(Medication, Collection::Medications, dated);
impl_record!(Appointment, Collection::Appointments, dated);
impl_record!(GoodDay, Collection::GoodDays, dated);
impl_record!(JournalEntry, Collection::Journal, dated);
impl_record!(DoctorQuestion, Collection::DoctorQuestions, undated);
impl_record!(Handoff, Collection::Handoffs, dated);

/// A new record on its way into the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    CheckIn(CheckIn),
    Symptom(Symptom),
    Medication(Medication),
    Appointment(Appointment),
    GoodDay(GoodDay),
    Journal(JournalEntry),
    DoctorQuestion(DoctorQuestion),
    Handoff(Handoff),
}

impl Entry {
    pub fn collection(&self) -> Collection {
        match self {
            Entry::CheckIn(_) => CheckIn::COLLECTION,
            Entry::Symptom(_) => Symptom::COLLECTION,
            Entry::Medication(_) => Medication::COLLECTION,
            Entry::Appointment(_) => Appointment::COLLECTION,
            Entry::GoodDay(_) => GoodDay::COLLECTION,
            Entry::Journal(_) => JournalEntry::COLLECTION,
            Entry::DoctorQuestion(_) => DoctorQuestion::COLLECTION,
            Entry::Handoff(_) => Handoff::COLLECTION,
        }
    }
}

/// Everything the user has recorded plus a few preferences.
///
/// Every field is optional on input; absent (or `null`) fields take their
/// defaults, which is what lets older and newer documents load.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AppState {
    pub role: Option<Role>,
    #[serde(deserialize_with = "nullable")]
    pub theme: Theme,
    #[serde(deserialize_with = "nullable")]
    pub onboarded: bool,
    #[serde(deserialize_with = "nullable")]
    pub dismissed_welcome: Vec<String>,
    #[serde(deserialize_with = "nullable")]
    pub checkins: Vec<CheckIn>,
    #[serde(deserialize_with = "nullable")]
    pub symptoms: Vec<Symptom>,
    #[serde(deserialize_with = "nullable")]
    pub medications: Vec<Medication>,
    #[serde(deserialize_with = "nullable")]
    pub appointments: Vec<Appointment>,
    #[serde(deserialize_with = "nullable")]
    pub gooddays: Vec<GoodDay>,
    #[serde(deserialize_with = "nullable")]
    pub journal: Vec<JournalEntry>,
    #[serde(deserialize_with = "nullable")]
    pub doctor_questions: Vec<DoctorQuestion>,
    #[serde(deserialize_with = "nullable")]
    pub handoffs: Vec<Handoff>,
}

impl AppState {
    pub fn len_of(&self, collection: Collection) -> usize {
        match collection {
            Collection::CheckIns => self.checkins.len(),
            Collection::Symptoms => self.symptoms.len(),
            Collection::Medications => self.medications.len(),
            Collection::Appointments => self.appointments.len(),
            Collection::GoodDays => self.gooddays.len(),
            Collection::Journal => self.journal.len(),
            Collection::DoctorQuestions => self.doctor_questions.len(),
            Collection::Handoffs => self.handoffs.len(),
        }
    }

    pub fn total_entries(&self) -> usize {
        Collection::ALL.iter().map(|c| self.len_of(*c)).sum()
    }

    /// `(id, date, headline)` rows for one collection, in stored order.
    pub fn rows(&self, collection: Collection) -> Vec<(RecordId, Option<String>, String)> {
        fn rows_of<T: Record>(records: &[T]) -> Vec<(RecordId, Option<String>, String)> {
            records
                .iter()
                .map(|r| (r.id().clone(), r.date().map(str::to_string), r.headline()))
                .collect()
        }
        match collection {
            Collection::CheckIns => rows_of(&self.checkins),
            Collection::Symptoms => rows_of(&self.symptoms),
            Collection::Medications => rows_of(&self.medications),
            Collection::Appointments => rows_of(&self.appointments),
            Collection::GoodDays => rows_of(&self.gooddays),
            Collection::Journal => rows_of(&self.journal),
            Collection::DoctorQuestions => rows_of(&self.doctor_questions),
            Collection::Handoffs => rows_of(&self.handoffs),
        }
    }

    /// Fills in ids for records stored without one; returns how many.
    pub fn fill_missing_ids(&mut self) -> usize {
        fn fill<T: Record>(records: &mut [T]) -> usize {
            records.iter_mut().map(Record::fill_missing_id).filter(|filled| *filled).count()
        }
        fill(&mut self.checkins)
            + fill(&mut self.symptoms)
            + fill(&mut self.medications)
            + fill(&mut self.appointments)
            + fill(&mut self.gooddays)
            + fill(&mut self.journal)
            + fill(&mut self.doctor_questions)
            + fill(&mut self.handoffs)
    }

    /// Every non-blank `date` across the timestamped collections.
    pub fn dates(&self) -> Vec<&str> {
        fn push<'a, T: Record>(out: &mut Vec<&'a str>, records: &'a [T]) {
            out.extend(records.iter().filter_map(Record::date));
        }
        let mut out = Vec::new();
        push(&mut out, &self.checkins);
        push(&mut out, &self.symptoms);
        push(&mut out, &self.medications);
        push(&mut out, &self.appointments);
        push(&mut out, &self.gooddays);
        push(&mut out, &self.journal);
        push(&mut out, &self.handoffs);
        out
    }
}
