use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{Local, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::debug;
use zeroize::Zeroizing;

use crate::backup::{
    BackupFormat, backup_file_name, decode_encrypted, decode_plain, encode_encrypted,
    encode_plain, sniff,
};
use crate::handoff::{copy_to_clipboard, handoff_text};
use crate::models::{
    Appointment, CheckIn, Collection, DoctorQuestion, Entry, GoodDay, Handoff, JournalEntry,
    Medication, RecordId, Role, Symptom, now_iso,
};
use crate::reconcile::{ImportPolicy, apply, preview};
use crate::storage::{
    LoadOutcome, StateStore, resolve_data_dir, save_config, validate_data_dir, write_backup_file,
};
use crate::ui::{
    classify_passphrase_strength, prompt_confirm, prompt_passphrase, run_breathing, run_grounding,
};

const NOT_DURABLE_WARNING: &str =
    "Warning: changes could not be written to disk and will be lost when this session ends.";

/// BesideYou keeps your health journal on this machine only
#[derive(Parser)]
#[command(
    name = "besideyou",
    version = env!("CARGO_PKG_VERSION"),
    about = "Local-first health journal with readable and encrypted backups",
    long_about = None
)]
pub struct Cli {
    /// Use this data directory for this run instead of the configured one
    #[arg(global = true, long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[command(flatten)]
    Store(StoreCommand),

    /// Show or set the default data directory
    Config {
        #[arg(long, value_name = "DIR")]
        set: Option<PathBuf>,
    },
}

/// Commands that work on the saved state.
#[derive(Subcommand)]
pub enum StoreCommand {
    /// Choose who you are using BesideYou as (patient, carer, supporter)
    Onboard { role: Role },

    /// Switch between the dark and light theme
    Theme,

    /// Record how today is going
    Checkin {
        #[arg(long, default_value = "")]
        mood: String,
        #[arg(long = "symptom", help = "Symptom noticed today (repeatable)")]
        symptoms: Vec<String>,
        #[arg(long, default_value = "")]
        notes: String,
        #[arg(long, help = "Something good about today; also saved as a good-day moment")]
        good: Option<String>,
    },

    /// Log a symptom
    Symptom {
        name: String,
        #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u8).range(1..=10))]
        severity: u8,
        #[arg(long, default_value = "")]
        notes: String,
    },

    /// Add a medication
    Medication {
        name: String,
        #[arg(long, default_value = "")]
        dose: String,
        #[arg(long, default_value = "")]
        frequency: String,
        #[arg(long, default_value = "")]
        purpose: String,
        #[arg(long, default_value = "")]
        questions: String,
    },

    /// Add an appointment
    Appointment {
        #[arg(value_name = "TYPE")]
        kind: String,
        #[arg(long, help = "Appointment day (YYYY-MM-DD)")]
        date: Option<String>,
        #[arg(long, default_value = "")]
        time: String,
        #[arg(long, default_value = "")]
        location: String,
        #[arg(long, default_value = "")]
        notes: String,
    },

    /// Save a good moment
    GoodDay { text: String },

    /// Write a journal entry
    Journal { text: String },

    /// Questions to bring to the next appointment
    Question {
        #[command(subcommand)]
        action: QuestionAction,
    },

    /// Write a carer handoff note and print it for sharing
    Handoff {
        #[arg(long, default_value = "")]
        meds: String,
        #[arg(long, default_value = "")]
        mood: String,
        #[arg(long, default_value = "")]
        notes: String,
        #[arg(long, default_value = "")]
        upcoming: String,
        #[arg(long, help = "Also copy the handoff text to the clipboard")]
        copy: bool,
    },

    /// List saved entries
    List { collection: Option<Collection> },

    /// Delete one entry by id
    Delete { collection: Collection, id: String },

    /// Hide or bring back an introduction panel
    Panel {
        #[command(subcommand)]
        action: PanelAction,
    },

    /// Save a backup file
    Export {
        #[arg(long, help = "Encrypt the backup with a passphrase")]
        encrypt: bool,
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
        #[arg(long, env = "BESIDEYOU_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,
    },

    /// Restore or merge a backup file
    Import {
        path: PathBuf,
        #[arg(long, conflicts_with = "replace", required_unless_present = "replace")]
        merge: bool,
        #[arg(long)]
        replace: bool,
        #[arg(long, env = "BESIDEYOU_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,
    },

    /// Delete every entry and preference kept on this machine
    Clear {
        #[arg(long, help = "Skip the confirmation question")]
        yes: bool,
    },

    /// Box breathing, four seconds per phase
    Breathe {
        #[arg(long)]
        cycles: Option<u32>,
    },

    /// 5-4-3-2-1 grounding
    Ground,

    /// Show counts, preferences and backup status
    Status,
}

#[derive(Subcommand)]
pub enum QuestionAction {
    Add { text: String },
    Toggle { id: String },
}

#[derive(Subcommand)]
pub enum PanelAction {
    Dismiss { id: String },
    Show { id: String },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        // a broken configured directory must not stop `config --set` from fixing it
        Command::Config { set } => return run_config(set.as_deref(), cli.data_dir.as_deref()),
        Command::Store(command) => command,
    };

    let data_dir = resolve_data_dir(cli.data_dir.as_deref())?;
    debug!(data_dir = %data_dir.display(), "using data directory");
    let (mut store, outcome) = StateStore::open(&data_dir);
    if let LoadOutcome::Recovered(reason) = &outcome {
        eprintln!(
            "Saved data could not be read ({reason}); starting fresh. A copy was kept next to {}.",
            store.state_path().display()
        );
    }

    dispatch(&mut store, command)?;

    if !store.is_durable() {
        eprintln!("{NOT_DURABLE_WARNING}");
    }
    Ok(())
}

fn dispatch(store: &mut StateStore, command: StoreCommand) -> Result<()> {
    match command {
        StoreCommand::Onboard { role } => {
            store.set_role(role);
            println!("Welcome. You're set up as a {role} ✓");
        }
        StoreCommand::Theme => {
            let theme = store.toggle_theme();
            println!("Theme: {theme}");
        }
        StoreCommand::Checkin {
            mood,
            symptoms,
            notes,
            good,
        } => {
            let good = good.unwrap_or_default();
            let good = good.trim();
            store.mutate(Entry::CheckIn(CheckIn {
                date: now_iso(),
                mood: mood.trim().to_string(),
                symptoms,
                notes,
                good: good.to_string(),
                ..Default::default()
            }));
            if !good.is_empty() {
                store.mutate(Entry::GoodDay(GoodDay {
                    date: now_iso(),
                    text: good.to_string(),
                    ..Default::default()
                }));
            }
            println!("Check-in saved ✓");
        }
        StoreCommand::Symptom {
            name,
            severity,
            notes,
        } => {
            let name = required(&name, "Please enter a symptom")?;
            store.mutate(Entry::Symptom(Symptom {
                date: now_iso(),
                name,
                severity,
                notes,
                ..Default::default()
            }));
            println!("Symptom logged ✓");
        }
        StoreCommand::Medication {
            name,
            dose,
            frequency,
            purpose,
            questions,
        } => {
            let name = required(&name, "Please enter a medication name")?;
            store.mutate(Entry::Medication(Medication {
                date: now_iso(),
                name,
                dose,
                frequency,
                purpose,
                questions,
                ..Default::default()
            }));
            println!("Medication added ✓");
        }
        StoreCommand::Appointment {
            kind,
            date,
            time,
            location,
            notes,
        } => {
            let kind = required(&kind, "Please enter the appointment type")?;
            let date = match date.as_deref().map(str::trim) {
                Some(day) if !day.is_empty() => {
                    NaiveDate::parse_from_str(day, "%Y-%m-%d")
                        .map_err(|_| anyhow!("Appointment date must look like 2024-05-01"))?;
                    day.to_string()
                }
                _ => String::new(),
            };
            store.mutate(Entry::Appointment(Appointment {
                kind,
                date,
                time,
                location,
                notes,
                ..Default::default()
            }));
            println!("Appointment added ✓");
        }
        StoreCommand::GoodDay { text } => {
            let text = required(&text, "Please write something first")?;
            store.mutate(Entry::GoodDay(GoodDay {
                date: now_iso(),
                text,
                ..Default::default()
            }));
            println!("Moment saved ✨");
        }
        StoreCommand::Journal { text } => {
            let text = required(&text, "Please write something first")?;
            store.mutate(Entry::Journal(JournalEntry {
                date: now_iso(),
                text,
                ..Default::default()
            }));
            println!("Entry saved ✓");
        }
        StoreCommand::Question { action } => run_question(store, action)?,
        StoreCommand::Handoff {
            meds,
            mood,
            notes,
            upcoming,
            copy,
        } => {
            let handoff = Handoff {
                date: now_iso(),
                meds: meds.trim().to_string(),
                mood: mood.trim().to_string(),
                notes: notes.trim().to_string(),
                upcoming: upcoming.trim().to_string(),
                ..Default::default()
            };
            if handoff.is_blank() {
                bail!("Add at least one detail");
            }
            let text = handoff_text(&handoff, &Local::now());
            store.mutate(Entry::Handoff(handoff));
            println!("{text}\n");
            println!("Handoff saved ✓");
            if copy {
                match copy_to_clipboard(&text) {
                    Ok(()) => println!("Copied to clipboard ✓"),
                    Err(e) => eprintln!("{e}"),
                }
            }
        }
        StoreCommand::List { collection } => print_listing(store, collection),
        StoreCommand::Delete { collection, id } => {
            let id = RecordId::from(id.trim());
            if !store.delete(collection, &id) {
                bail!("No {collection} entry with id {id}");
            }
            println!("Deleted ✓");
        }
        StoreCommand::Panel { action } => match action {
            PanelAction::Dismiss { id } => {
                store.dismiss_panel(id.trim());
                println!("Panel '{}' hidden", id.trim());
            }
            PanelAction::Show { id } => {
                store.restore_panel(id.trim());
                println!("Panel '{}' will show again", id.trim());
            }
        },
        StoreCommand::Export {
            encrypt,
            out,
            passphrase,
        } => run_export(store, encrypt, out, passphrase.map(Zeroizing::new))?,
        StoreCommand::Import {
            path,
            merge,
            replace: _,
            passphrase,
        } => {
            let policy = if merge {
                ImportPolicy::Merge
            } else {
                ImportPolicy::Replace
            };
            run_import(store, &path, policy, passphrase.map(Zeroizing::new))?;
        }
        StoreCommand::Clear { yes } => {
            let confirmed = yes
                || prompt_confirm(
                    "This deletes every entry on this machine and cannot be undone. Continue?",
                )?;
            if !confirmed {
                println!("Nothing was cleared");
                return Ok(());
            }
            store.clear_all();
            println!("All data cleared");
        }
        StoreCommand::Breathe { cycles } => {
            let done = run_breathing(store.state().theme, cycles.filter(|c| *c > 0))?;
            println!("Breathing finished after {done} cycle(s)");
        }
        StoreCommand::Ground => {
            let stdin = io::stdin();
            run_grounding(stdin.lock(), &mut io::stdout())?;
        }
        StoreCommand::Status => print_status(store),
    }
    Ok(())
}

fn run_question(store: &mut StateStore, action: QuestionAction) -> Result<()> {
    match action {
        QuestionAction::Add { text } => {
            let text = required(&text, "Please write the question first")?;
            let id = store.mutate(Entry::DoctorQuestion(DoctorQuestion {
                text,
                ..Default::default()
            }));
            println!("Question added ✓ ({id})");
        }
        QuestionAction::Toggle { id } => {
            let id = RecordId::from(id.trim());
            match store.toggle_question(&id) {
                Some(true) => println!("Marked as asked ✓"),
                Some(false) => println!("Marked as not asked yet"),
                None => bail!("No question with id {id}"),
            }
        }
    }
    Ok(())
}

fn run_export(
    store: &mut StateStore,
    encrypt: bool,
    out: Option<PathBuf>,
    passphrase: Option<Zeroizing<String>>,
) -> Result<()> {
    let now = Utc::now();
    let format = if encrypt {
        BackupFormat::Encrypted
    } else {
        BackupFormat::Plain
    };
    let bytes = match format {
        BackupFormat::Plain => encode_plain(store.state(), now)?,
        BackupFormat::Encrypted => {
            let passphrase = match passphrase {
                Some(p) => p,
                None => Zeroizing::new(prompt_passphrase(true)?),
            };
            let strength = classify_passphrase_strength(&passphrase);
            eprintln!("Passphrase strength: {strength}");
            encode_encrypted(store.state(), &passphrase)?
        }
    };

    let path = out.unwrap_or_else(|| PathBuf::from(backup_file_name(format, now)));
    write_backup_file(&path, &bytes)?;
    store.record_export();
    println!("Backup saved ✓ {}", path.display());
    Ok(())
}

fn run_import(
    store: &mut StateStore,
    path: &Path,
    policy: ImportPolicy,
    passphrase: Option<Zeroizing<String>>,
) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("Could not read {}", path.display()))?;
    let backup = match sniff(&bytes) {
        BackupFormat::Plain => decode_plain(&bytes)?,
        BackupFormat::Encrypted => {
            let passphrase = match passphrase {
                Some(p) => p,
                None => Zeroizing::new(prompt_passphrase(false)?),
            };
            decode_encrypted(&bytes, &passphrase)?
        }
    };
    println!("{}", preview(&backup));
    let report = apply(store, backup, policy);
    println!("{report}");
    Ok(())
}

fn run_config(set: Option<&Path>, override_dir: Option<&Path>) -> Result<()> {
    if let Some(dir) = set {
        let dir = validate_data_dir(dir)?;
        save_config(&dir)?;
        println!("Data directory set to {}", dir.display());
        return Ok(());
    }
    let dir = resolve_data_dir(override_dir)?;
    println!("Data directory: {}", dir.display());
    Ok(())
}

fn print_listing(store: &StateStore, only: Option<Collection>) {
    let state = store.state();
    let collections: Vec<Collection> = match only {
        Some(c) => vec![c],
        None => Collection::ALL.to_vec(),
    };
    for collection in collections {
        let rows = state.rows(collection);
        if only.is_none() && rows.is_empty() {
            continue;
        }
        println!("{collection} ({})", rows.len());
        for (id, date, headline) in rows {
            let id = id.to_string();
            let day = date.as_deref().map(|d| d.get(..10).unwrap_or(d)).unwrap_or("");
            println!("  {id:<24} {day:<10}  {headline}");
        }
    }
    if only.is_none() && state.total_entries() == 0 {
        println!("Nothing saved yet");
    }
}

fn print_status(store: &StateStore) {
    let state = store.state();
    let role = state.role.map(|r| r.to_string()).unwrap_or_else(|| "not chosen".into());
    println!("Role: {role}");
    println!("Theme: {}", state.theme);
    println!("Entries: {}", state.total_entries());
    for collection in Collection::ALL {
        let n = state.len_of(collection);
        if n > 0 {
            println!("  {:<16} {n}", collection.key());
        }
    }
    match store.export_marker() {
        Some(marker) => println!(
            "Last backup: {} ({} entries)",
            marker.last_export, marker.entries_at_last_export
        ),
        None => println!("Last backup: never"),
    }
    if store.should_show_nudge() {
        println!("You have entries that aren't backed up yet. Run `besideyou export` to keep a copy.");
    }
    println!("Data file: {}", store.state_path().display());
}

fn required(value: &str, message: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("{message}");
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn import_needs_an_explicit_policy() {
        assert!(Cli::try_parse_from(["besideyou", "import", "x.json"]).is_err());
        assert!(
            Cli::try_parse_from(["besideyou", "import", "x.json", "--merge", "--replace"]).is_err()
        );
        assert!(Cli::try_parse_from(["besideyou", "import", "x.json", "--merge"]).is_ok());
    }

    #[test]
    fn collections_parse_by_key_or_category() {
        let cli = Cli::try_parse_from(["besideyou", "list", "doctor-questions"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Store(StoreCommand::List {
                collection: Some(Collection::DoctorQuestions)
            })
        ));
        assert!(Cli::try_parse_from(["besideyou", "list", "mood"]).is_ok());
        assert!(Cli::try_parse_from(["besideyou", "list", "recipes"]).is_err());
    }

    #[test]
    fn config_is_handled_before_any_store_command() {
        let cli = Cli::try_parse_from(["besideyou", "config", "--set", "journal"]).unwrap();
        assert!(matches!(
            &cli.command,
            Command::Config { set: Some(dir) } if dir.as_path() == Path::new("journal")
        ));
        let cli = Cli::try_parse_from(["besideyou", "status"]).unwrap();
        assert!(matches!(cli.command, Command::Store(StoreCommand::Status)));
    }

    #[test]
    fn severity_is_bounded() {
        assert!(Cli::try_parse_from(["besideyou", "symptom", "Nausea", "--severity", "11"]).is_err());
        assert!(Cli::try_parse_from(["besideyou", "symptom", "Nausea", "--severity", "7"]).is_ok());
    }

    #[test]
    fn blank_required_text_is_rejected() {
        assert_eq!(
            required("   ", "Please enter a symptom").unwrap_err().to_string(),
            "Please enter a symptom"
        );
        assert_eq!(required(" Fatigue ", "x").unwrap(), "Fatigue");
    }
}
