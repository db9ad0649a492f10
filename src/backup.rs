//! Backup envelopes: readable JSON exports and passphrase-encrypted blobs.
//!
//! The JSON form wraps the whole [`AppState`] with a marker, a version and a
//! summary. The encrypted form is `salt || nonce || ciphertext` over the bare
//! serialised state, with no header at all, so wrong passphrases and files
//! that are not backups fail identically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::crypto::{decrypt_with_passphrase, encrypt_with_passphrase};
use crate::errors::{BackupError, BackupResult, DecryptCause};
use crate::models::{AppState, Collection};

pub const APP_NAME: &str = "BesideYou";
pub const EXPORT_VERSION: u32 = 1;
const VERSION_LABEL: &str = "1.0";
const FILE_PREFIX: &str = "besideyou-backup";
pub const ENCRYPTED_EXTENSION: &str = "besideyou";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DateRange {
    pub earliest: String,
    pub latest: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub total_entries: usize,
    pub date_range: Option<DateRange>,
    pub categories: Vec<String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BackupEnvelope<'a> {
    pub app: &'static str,
    pub version: &'static str,
    pub export_date: String,
    pub export_version: u32,
    pub summary: BackupSummary,
    pub data: &'a AppState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupFormat {
    Plain,
    Encrypted,
}

/// A backup that has been fully parsed and validated. Nothing has touched
/// the local state yet.
#[derive(Debug, Clone)]
pub struct DecodedBackup {
    pub format: BackupFormat,
    pub state: AppState,
    /// Summary as written in the file, when it carried a well-formed one.
    pub summary: Option<BackupSummary>,
    pub export_date: Option<String>,
}

impl DecodedBackup {
    /// The file's own summary, or one computed from its data.
    pub fn effective_summary(&self) -> BackupSummary {
        self.summary.clone().unwrap_or_else(|| summarize(&self.state))
    }
}

pub fn summarize(state: &AppState) -> BackupSummary {
    BackupSummary {
        total_entries: state.total_entries(),
        date_range: date_range(state),
        categories: Collection::ALL
            .iter()
            .filter(|c| state.len_of(**c) > 0)
            .map(|c| c.category().to_string())
            .collect(),
    }
}

/// Earliest and latest calendar day across every dated record.
pub fn date_range(state: &AppState) -> Option<DateRange> {
    let mut dates = state.dates();
    dates.sort_unstable();
    let day = |d: &str| d.get(..10).unwrap_or(d).to_string();
    Some(DateRange {
        earliest: day(*dates.first()?),
        latest: day(*dates.last()?),
    })
}

pub fn build_envelope(state: &AppState, now: DateTime<Utc>) -> BackupEnvelope<'_> {
    BackupEnvelope {
        app: APP_NAME,
        version: VERSION_LABEL,
        export_date: now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        export_version: EXPORT_VERSION,
        summary: summarize(state),
        data: state,
    }
}

pub fn encode_plain(state: &AppState, now: DateTime<Utc>) -> BackupResult<Vec<u8>> {
    serde_json::to_vec_pretty(&build_envelope(state, now))
        .map_err(|e| BackupError::ExportFailed(e.to_string()))
}

pub fn encode_encrypted(state: &AppState, passphrase: &str) -> BackupResult<Vec<u8>> {
    validate_passphrase(passphrase, None)?;
    let plaintext =
        serde_json::to_vec(state).map_err(|e| BackupError::ExportFailed(e.to_string()))?;
    encrypt_with_passphrase(passphrase, &plaintext)
}

pub fn decode_plain(bytes: &[u8]) -> BackupResult<DecodedBackup> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| BackupError::invalid(format!("not JSON: {e}")))?;
    if value.get("app").and_then(Value::as_str) != Some(APP_NAME) {
        return Err(BackupError::invalid("app marker missing or wrong"));
    }
    if !value.get("exportVersion").is_some_and(is_truthy) {
        return Err(BackupError::invalid("exportVersion missing"));
    }
    let data = value
        .get("data")
        .filter(|d| d.is_object())
        .ok_or_else(|| BackupError::invalid("data missing"))?;
    let state: AppState = serde_json::from_value(data.clone())
        .map_err(|e| BackupError::invalid(format!("data unreadable: {e}")))?;

    let summary = value
        .get("summary")
        .and_then(|s| serde_json::from_value::<BackupSummary>(s.clone()).ok());
    let export_date = value
        .get("exportDate")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(DecodedBackup {
        format: BackupFormat::Plain,
        state,
        summary,
        export_date,
    })
}

pub fn decode_encrypted(bytes: &[u8], passphrase: &str) -> BackupResult<DecodedBackup> {
    if passphrase.is_empty() {
        return Err(BackupError::ValidationFailed(
            "Please enter your passphrase".into(),
        ));
    }
    let plaintext = decrypt_with_passphrase(passphrase, bytes)?;
    let state: AppState = serde_json::from_slice(&plaintext).map_err(|e| {
        debug!(error = %e, "decrypted payload is not application state");
        BackupError::DecryptionFailed {
            cause: DecryptCause::Payload,
        }
    })?;
    Ok(DecodedBackup {
        format: BackupFormat::Encrypted,
        state,
        summary: None,
        export_date: None,
    })
}

/// Readable backups are JSON objects; anything else is treated as an
/// encrypted blob.
pub fn sniff(bytes: &[u8]) -> BackupFormat {
    let first = bytes.iter().find(|b| !b.is_ascii_whitespace());
    if first == Some(&b'{') && serde_json::from_slice::<Value>(bytes).is_ok() {
        BackupFormat::Plain
    } else {
        BackupFormat::Encrypted
    }
}

pub fn backup_file_name(format: BackupFormat, now: DateTime<Utc>) -> String {
    let ext = match format {
        BackupFormat::Plain => "json",
        BackupFormat::Encrypted => ENCRYPTED_EXTENSION,
    };
    format!("{FILE_PREFIX}-{}.{ext}", now.format("%Y-%m-%d"))
}

/// Checks run before any key derivation: a passphrase must be present and,
/// when a confirmation was asked for, match it.
pub fn validate_passphrase(passphrase: &str, confirmation: Option<&str>) -> BackupResult<()> {
    if passphrase.is_empty() {
        return Err(BackupError::ValidationFailed(
            "Please enter a passphrase".into(),
        ));
    }
    if let Some(confirmation) = confirmation {
        if confirmation != passphrase {
            return Err(BackupError::ValidationFailed(
                "Passphrases don't match".into(),
            ));
        }
    }
    Ok(())
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::models::{DoctorQuestion, JournalEntry, Role, Symptom};
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 2, 8, 15, 0).unwrap()
    }

    fn sample_state() -> AppState {
        let mut state = AppState {
            role: Some(Role::Patient),
            onboarded: true,
            ..Default::default()
        };
        state.symptoms.push(Symptom {
            id: "s1".into(),
            date: "2024-03-01T09:00:00.000Z".into(),
            name: "Fatigue".into(),
            ..Default::default()
        });
        state.journal.push(JournalEntry {
            id: "j1".into(),
            date: "2024-01-05T21:30:00.000Z".into(),
            text: "Scan results tomorrow".into(),
            ..Default::default()
        });
        state.doctor_questions.push(DoctorQuestion {
            id: "q1".into(),
            text: "Is this normal?".into(),
            ..Default::default()
        });
        state
    }

    #[test]
    fn summary_counts_ranges_and_categories() {
        let summary = summarize(&sample_state());
        assert_eq!(summary.total_entries, 3);
        assert_eq!(
            summary.date_range,
            Some(DateRange {
                earliest: "2024-01-05".into(),
                latest: "2024-03-01".into(),
            })
        );
        assert_eq!(summary.categories, vec!["symptoms", "journal", "questions"]);
    }

    #[test]
    fn empty_state_has_no_date_range() {
        let summary = summarize(&AppState::default());
        assert_eq!(summary.total_entries, 0);
        assert_eq!(summary.date_range, None);
        assert!(summary.categories.is_empty());
    }

    #[test]
    fn plain_export_has_the_documented_shape() {
        let bytes = encode_plain(&sample_state(), fixed_now()).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["app"], json!("BesideYou"));
        assert_eq!(value["exportVersion"], json!(1));
        assert_eq!(value["exportDate"], json!("2024-03-02T08:15:00.000Z"));
        assert_eq!(value["summary"]["totalEntries"], json!(3));
        assert_eq!(value["summary"]["dateRange"]["earliest"], json!("2024-01-05"));
        assert_eq!(value["data"]["doctorQuestions"][0]["text"], json!("Is this normal?"));
    }

    #[test]
    fn plain_export_decodes_to_the_same_state() {
        let state = sample_state();
        let decoded = decode_plain(&encode_plain(&state, fixed_now()).unwrap()).unwrap();
        assert_eq!(decoded.format, BackupFormat::Plain);
        assert_eq!(decoded.state, state);
        assert_eq!(decoded.summary, Some(summarize(&state)));
    }

    #[test]
    fn records_with_null_or_missing_ids_still_decode() {
        let raw = json!({
            "app": "BesideYou",
            "exportVersion": 1,
            "data": {
                "symptoms": [{ "id": null, "date": "2024-01-01", "name": "Pain", "severity": 3 }],
                "doctorQuestions": [{ "text": "Can I swim?" }]
            }
        });
        let decoded = decode_plain(&serde_json::to_vec(&raw).unwrap()).unwrap();
        assert!(decoded.state.symptoms[0].id.is_unset());
        assert!(decoded.state.doctor_questions[0].id.is_unset());
        assert_eq!(decoded.effective_summary().total_entries, 2);
    }

    #[test]
    fn foreign_json_is_rejected_as_invalid_format() {
        for doc in [
            json!({ "app": "SomethingElse", "exportVersion": 1, "data": {} }),
            json!({ "app": "BesideYou", "data": {} }),
            json!({ "app": "BesideYou", "exportVersion": 0, "data": {} }),
            json!({ "app": "BesideYou", "exportVersion": 1 }),
            json!([1, 2, 3]),
        ] {
            let err = decode_plain(doc.to_string().as_bytes()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidFormat, "{doc}");
        }
        let err = decode_plain(b"not even json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn legacy_null_date_range_is_tolerated() {
        let doc = json!({
            "app": "BesideYou",
            "version": "1.0",
            "exportVersion": 1,
            "summary": { "totalEntries": 0, "dateRange": { "earliest": null, "latest": null }, "categories": [] },
            "data": { "theme": "light" }
        });
        let decoded = decode_plain(doc.to_string().as_bytes()).unwrap();
        assert!(decoded.summary.is_none());
        assert_eq!(decoded.effective_summary().total_entries, 0);
    }

    #[test]
    fn encrypted_export_round_trips_including_empty_state() {
        for state in [AppState::default(), sample_state()] {
            let blob = encode_encrypted(&state, "alpha123").unwrap();
            assert_eq!(sniff(&blob), BackupFormat::Encrypted);
            let decoded = decode_encrypted(&blob, "alpha123").unwrap();
            assert_eq!(decoded.state, state);
        }
    }

    #[test]
    fn encrypted_import_with_wrong_passphrase_fails() {
        let blob = encode_encrypted(&sample_state(), "alpha123").unwrap();
        let err = decode_encrypted(&blob, "alpha124").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecryptionFailed);
        assert_eq!(err.to_string(), "Wrong passphrase or corrupted file");
    }

    #[test]
    fn plain_file_fed_to_the_decryptor_fails_generically() {
        let plain = encode_plain(&sample_state(), fixed_now()).unwrap();
        let err = decode_encrypted(&plain, "alpha123").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecryptionFailed);
    }

    #[test]
    fn passphrase_guards_run_before_crypto() {
        assert_eq!(
            encode_encrypted(&AppState::default(), "").unwrap_err().kind(),
            ErrorKind::ValidationFailed
        );
        assert_eq!(
            validate_passphrase("one", Some("two")).unwrap_err().kind(),
            ErrorKind::ValidationFailed
        );
        assert!(validate_passphrase("same", Some("same")).is_ok());
        assert_eq!(
            decode_encrypted(b"whatever", "").unwrap_err().kind(),
            ErrorKind::ValidationFailed
        );
    }

    #[test]
    fn sniff_and_file_names() {
        assert_eq!(sniff(b"  {\"app\":\"BesideYou\"}"), BackupFormat::Plain);
        assert_eq!(sniff(b"{truncated"), BackupFormat::Encrypted);
        assert_eq!(
            backup_file_name(BackupFormat::Plain, fixed_now()),
            "besideyou-backup-2024-03-02.json"
        );
        assert_eq!(
            backup_file_name(BackupFormat::Encrypted, fixed_now()),
            "besideyou-backup-2024-03-02.besideyou"
        );
    }
}
