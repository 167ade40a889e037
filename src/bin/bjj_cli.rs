//! Command line front end for the training journal.
//!
//! ```bash
//! bjj-cli log --duration 90 --technique "Armbar from guard" --type gi
//! bjj-cli checkin
//! bjj-cli stats
//! BJJ_SERVER_URL=https://bjj.example.com bjj-cli sync --email me@example.com
//! ```

use anyhow::{Context, anyhow, bail};
use bjj_journal::auth::Role;
use bjj_journal::client::backup;
use bjj_journal::client::sync::{OutboxOp, enqueue_op};
use bjj_journal::client::timer::{
    IntervalTimer, Phase, REST_PRESETS_SECS, ROUND_PRESETS_MINUTES, TimerEvent,
};
use bjj_journal::client::{HttpBackend, LocalStore, RetryPolicy, SyncReconciler, keys};
use bjj_journal::coach::{GeminiClient, get_training_suggestion};
use bjj_journal::config::AppConfig;
use bjj_journal::env::load_environment;
use bjj_journal::models::{Belt, TemplateData, TrainingDraft};
use bjj_journal::stats;
use bjj_journal::telemetry::init_cli_tracing;
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_DATA_DIR: &str = ".bjj-journal";
const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8000";

#[derive(Parser)]
#[command(
    name = "bjj-cli",
    about = "Jiu-jitsu training journal",
    long_about = "Log trainings, check in, follow streaks and achievements, and sync with the journal server."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Data directory (defaults to BJJ_DATA_DIR or .bjj-journal)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
}

#[derive(clap::Args)]
struct TrainingArgs {
    /// Training date, YYYY-MM-DD (defaults to today)
    #[arg(long)]
    date: Option<String>,

    /// Duration in minutes
    #[arg(long)]
    duration: String,

    #[arg(long)]
    technique: String,

    #[arg(long, default_value = "")]
    notes: String,

    /// Academy (defaults to the main academy)
    #[arg(long)]
    academy: Option<String>,

    /// gi, nogi, open mat, ...
    #[arg(long = "type")]
    kind: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Log a training
    Log(TrainingArgs),

    /// List trainings, newest first
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Replace a logged training
    Edit {
        id: i64,
        #[command(flatten)]
        training: TrainingArgs,
    },

    /// Delete a training
    Delete {
        id: i64,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Check in for today
    Checkin,

    /// Show the current check-in streak
    Streak,

    /// Totals, averages and sessions per month
    Stats,

    /// Unlocked and locked achievements
    Achievements,

    Template {
        #[command(subcommand)]
        action: TemplateCommand,
    },

    Profile {
        #[command(subcommand)]
        action: ProfileCommand,
    },

    Academy {
        #[command(subcommand)]
        action: AcademyCommand,
    },

    /// Write a backup file
    Export {
        /// Output path (defaults to my-bjj-backup-YYYY-MM-DD.json)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Restore a backup file over the local journal
    Import {
        file: PathBuf,
        #[arg(long)]
        yes: bool,
    },

    /// Round and rest interval timer
    Timer {
        /// Round length in minutes: 5, 6, 7 or 10
        #[arg(long, default_value_t = 5)]
        round_minutes: u32,

        /// Rest length in seconds: 30, 60 or 90
        #[arg(long, default_value_t = 60)]
        rest_seconds: u32,

        /// Stop after this many rounds
        #[arg(long, default_value_t = 5)]
        rounds: u32,

        #[arg(long)]
        mute: bool,
    },

    /// Ask the AI coach what to train next
    Suggest,

    /// Sign in, reconcile with the server and push pending changes
    Sync {
        /// Account email (defaults to BJJ_EMAIL)
        #[arg(long)]
        email: Option<String>,

        /// Account password (defaults to BJJ_PASSWORD)
        #[arg(long)]
        password: Option<String>,

        /// Server URL (defaults to BJJ_SERVER_URL)
        #[arg(long)]
        server: Option<String>,

        /// Create the account instead of signing in
        #[arg(long)]
        signup: bool,
    },
}

#[derive(Subcommand)]
enum TemplateCommand {
    /// Save a reusable training template
    Save {
        name: String,
        #[arg(long)]
        duration: String,
        #[arg(long)]
        technique: String,
        #[arg(long, default_value = "")]
        notes: String,
        #[arg(long)]
        academy: Option<String>,
        #[arg(long = "type")]
        kind: Option<String>,
    },
    List,
    Delete {
        /// Template id or name
        id: String,
    },
    /// Log a training from a template
    Apply {
        /// Template id or name
        id: String,
        #[arg(long)]
        date: Option<String>,
    },
}

#[derive(Subcommand)]
enum ProfileCommand {
    Show,
    Set {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        belt: Option<String>,
        #[arg(long)]
        degrees: Option<u8>,
        #[arg(long)]
        language: Option<String>,
        #[arg(long)]
        avatar_url: Option<String>,
        #[arg(long)]
        role: Option<String>,
    },
}

#[derive(Subcommand)]
enum AcademyCommand {
    List,
    Add { name: String },
    Remove { name: String },
    Main { name: String },
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn parse_date(date: Option<String>) -> anyhow::Result<String> {
    match date {
        Some(date) => {
            NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                .with_context(|| format!("Invalid date {}, expected YYYY-MM-DD", date))?;
            Ok(date)
        }
        None => Ok(today().format("%Y-%m-%d").to_string()),
    }
}

fn confirm(question: &str) -> anyhow::Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes" | "s" | "sim"))
}

fn draft(store: &LocalStore, args: TrainingArgs) -> anyhow::Result<TrainingDraft> {
    if args.duration.trim().parse::<u32>().is_err() {
        bail!("Duration must be a whole number of minutes");
    }
    Ok(TrainingDraft {
        date: parse_date(args.date)?,
        duration: args.duration,
        technique: args.technique,
        notes: args.notes,
        academy: args.academy.or_else(|| store.main_academy()),
        kind: args.kind,
    })
}

fn queue(store: &LocalStore, op: OutboxOp) {
    if let Err(err) = enqueue_op(store, op, false) {
        tracing::warn!(error = %err, "Could not queue change for sync");
    }
}

fn belt_name(belt: Belt, language: &str) -> String {
    if language == "pt" {
        belt.portuguese().to_string()
    } else {
        belt.as_str().to_string()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_cli_tracing(cli.verbose);
    if let Err(err) = load_environment() {
        debug!(error = %err, "No environment files loaded");
    }

    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("BJJ_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let store = Arc::new(
        LocalStore::open(&data_dir)
            .with_context(|| format!("Failed to open journal in {}", data_dir.display()))?,
    );

    match cli.command {
        Command::Log(args) => {
            let training = store.log_training(draft(&store, args)?)?;
            queue(&store, OutboxOp::PushTrainings);
            println!("Logged training {} on {}", training.id, training.date);
        }
        Command::List { limit } => {
            let trainings = store.trainings();
            if trainings.is_empty() {
                println!("No trainings logged yet");
            }
            for t in trainings.iter().take(limit) {
                println!(
                    "{:>14}  {}  {:>4} min  {:<8} {}",
                    t.id,
                    t.date,
                    t.duration,
                    t.kind.as_deref().unwrap_or("-"),
                    t.technique
                );
            }
        }
        Command::Edit { id, training } => {
            let edited = store.edit_training(id, draft(&store, training)?)?;
            queue(&store, OutboxOp::PushTrainings);
            println!("Updated training {}", edited.id);
        }
        Command::Delete { id, yes } => {
            if !yes && !confirm(&format!("Delete training {}?", id))? {
                println!("Cancelled");
                return Ok(());
            }
            if store.delete_training(id)? {
                queue(&store, OutboxOp::DeleteTraining { id });
                println!("Deleted training {}", id);
            } else {
                bail!("No training with id {}", id);
            }
        }
        Command::Checkin => {
            let today = today();
            match store.check_in(today)? {
                Some(_) => println!("Checked in for {}", today),
                None => println!("Already checked in today"),
            }
            println!(
                "Streak: {} days",
                stats::calculate_streak(&store.check_ins(), today)
            );
        }
        Command::Streak => {
            let check_ins = store.check_ins();
            let today = today();
            println!("Streak: {} days", stats::calculate_streak(&check_ins, today));
            if !stats::has_checked_in(&check_ins, today) {
                println!("You have not checked in today");
            }
        }
        Command::Stats => {
            let trainings = store.trainings();
            let summary = stats::user_stats(&trainings);
            println!("Trainings:     {}", summary.total_trainings);
            println!("Total hours:   {}", stats::total_hours(&trainings));
            println!("Average hours: {:.1}", summary.average_hours);
            for (month, sessions) in stats::monthly_sessions(&trainings) {
                println!("  {}  {}", month, sessions);
            }
        }
        Command::Achievements => {
            let unlocked = stats::unlocked(&store.trainings(), &store.check_ins());
            for achievement in stats::all_achievements() {
                let mark = if unlocked.contains(&achievement) { "x" } else { " " };
                println!("[{}] {:<12} {}", mark, achievement.title, achievement.description);
            }
        }
        Command::Template { action } => template(&store, action)?,
        Command::Profile { action } => profile(&store, action)?,
        Command::Academy { action } => academy(&store, action)?,
        Command::Export { out } => {
            let path = out.unwrap_or_else(|| PathBuf::from(backup::file_name(today())));
            let document = serde_json::to_string_pretty(&backup::export(&store))?;
            std::fs::write(&path, document)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Backup written to {}", path.display());
        }
        Command::Import { file, yes } => import(&store, &file, yes)?,
        Command::Timer {
            round_minutes,
            rest_seconds,
            rounds,
            mute,
        } => timer(round_minutes, rest_seconds, rounds, mute).await?,
        Command::Suggest => suggest(&store).await?,
        Command::Sync {
            email,
            password,
            server,
            signup,
        } => sync(store, email, password, server, signup).await?,
    }

    Ok(())
}

fn template(store: &LocalStore, action: TemplateCommand) -> anyhow::Result<()> {
    match action {
        TemplateCommand::Save {
            name,
            duration,
            technique,
            notes,
            academy,
            kind,
        } => {
            let saved = store.save_template(
                &name,
                TemplateData {
                    duration,
                    technique,
                    notes,
                    academy,
                    kind,
                },
            )?;
            println!("Saved template {} ({})", saved.name, saved.id);
        }
        TemplateCommand::List => {
            for t in store.templates() {
                println!("{}  {}  {} min  {}", t.id, t.name, t.data.duration, t.data.technique);
            }
        }
        TemplateCommand::Delete { id } => {
            if !store.delete_template(&id)? {
                bail!("No template {}", id);
            }
            println!("Deleted template {}", id);
        }
        TemplateCommand::Apply { id, date } => {
            let training = store.apply_template(&id, &parse_date(date)?)?;
            queue(store, OutboxOp::PushTrainings);
            println!("Logged training {} on {}", training.id, training.date);
        }
    }
    Ok(())
}

fn profile(store: &LocalStore, action: ProfileCommand) -> anyhow::Result<()> {
    match action {
        ProfileCommand::Show => {
            let language = store.language();
            println!("Name:       {}", store.name());
            println!(
                "Belt:       {} ({} degrees)",
                belt_name(store.belt(), &language),
                store.degrees()
            );
            println!("Academies:  {}", store.academies().join(", "));
            println!("Main:       {}", store.main_academy().unwrap_or_default());
            println!("Avatar:     {}", store.avatar_url().unwrap_or_default());
            println!("Language:   {}", language);
            println!("Role:       {}", store.role());
        }
        ProfileCommand::Set {
            name,
            belt,
            degrees,
            language,
            avatar_url,
            role,
        } => {
            if let Some(name) = name {
                store.set_name(&name)?;
            }
            if let Some(belt) = belt {
                store.set_belt(belt.parse::<Belt>()?)?;
            }
            if let Some(degrees) = degrees {
                store.set_degrees(degrees)?;
            }
            if let Some(language) = language {
                store.set_language(&language)?;
            }
            if let Some(url) = avatar_url {
                store.set_avatar_url(&url)?;
            }
            let role_changed = role.is_some();
            if let Some(role) = role {
                store.set_role(role.parse::<Role>()?)?;
            }
            queue(store, OutboxOp::PushProfile);
            if role_changed {
                queue(store, OutboxOp::PushRole);
            }
            println!("Profile updated");
        }
    }
    Ok(())
}

fn academy(store: &LocalStore, action: AcademyCommand) -> anyhow::Result<()> {
    match action {
        AcademyCommand::List => {
            let main = store.main_academy();
            for name in store.academies() {
                let mark = if main.as_deref() == Some(name.as_str()) { "*" } else { " " };
                println!("{} {}", mark, name);
            }
            return Ok(());
        }
        AcademyCommand::Add { name } => {
            if !store.add_academy(&name)? {
                println!("{} is already in your list", name);
                return Ok(());
            }
            println!("Added {}", name);
        }
        AcademyCommand::Remove { name } => {
            if !store.remove_academy(&name)? {
                bail!("{} is not in your list", name);
            }
            println!("Removed {}", name);
        }
        AcademyCommand::Main { name } => {
            store.set_main_academy(&name)?;
            println!("{} is now your main academy", name);
        }
    }
    queue(store, OutboxOp::PushProfile);
    Ok(())
}

fn import(store: &LocalStore, file: &Path, yes: bool) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    if !yes && !confirm("Importing replaces the matching local data. Continue?")? {
        println!("Cancelled");
        return Ok(());
    }

    let written = backup::import(store, &raw)?;
    queue(store, OutboxOp::PushProfile);
    queue(store, OutboxOp::PushTrainings);
    if raw_has_role(&raw) {
        queue(store, OutboxOp::PushRole);
    }
    println!("Imported {} entries from {}", written, file.display());
    Ok(())
}

fn raw_has_role(raw: &str) -> bool {
    serde_json::from_str::<backup::Backup>(raw)
        .map(|b| b.role.is_some())
        .unwrap_or(false)
}

async fn timer(round_minutes: u32, rest_seconds: u32, rounds: u32, mute: bool) -> anyhow::Result<()> {
    if !ROUND_PRESETS_MINUTES.contains(&round_minutes) {
        bail!("Round length must be one of {:?} minutes", ROUND_PRESETS_MINUTES);
    }
    if !REST_PRESETS_SECS.contains(&rest_seconds) {
        bail!("Rest length must be one of {:?} seconds", REST_PRESETS_SECS);
    }

    let mut timer = IntervalTimer::default();
    timer.set_round_time(round_minutes * 60);
    timer.set_rest_time(rest_seconds);
    if mute {
        timer.toggle_sound();
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;
    let mut stdout = io::stdout();
    for event in timer.toggle() {
        if event == TimerEvent::ShortBeep {
            print!("\x07");
        }
    }

    while timer.round() <= rounds {
        let phase = match timer.phase() {
            Phase::Rolling => "ROLL",
            Phase::Resting => "REST",
        };
        print!("\rRound {}  {}  {:>5}", timer.round(), phase, timer.display());
        stdout.flush()?;

        ticker.tick().await;
        for event in timer.tick() {
            if event == TimerEvent::LongBeep {
                print!("\x07");
            }
        }
    }

    println!("\nDone, {} rounds", rounds);
    Ok(())
}

async fn suggest(store: &LocalStore) -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let coach = GeminiClient::from_config(&config);
    let language = store.language();

    let suggestion = get_training_suggestion(
        &coach,
        &store.trainings(),
        store.belt().as_str(),
        &store.main_academy().unwrap_or_default(),
    )
    .await
    .map_err(|err| anyhow!(err.user_message(&language)))?;

    println!("Focus: {}", suggestion.focus);
    println!();
    println!("{}", suggestion.reasoning);
    println!();
    for technique in suggestion.suggested_techniques {
        println!("  - {}", technique);
    }
    Ok(())
}

async fn sync(
    store: Arc<LocalStore>,
    email: Option<String>,
    password: Option<String>,
    server: Option<String>,
    signup: bool,
) -> anyhow::Result<()> {
    let server = server
        .or_else(|| std::env::var("BJJ_SERVER_URL").ok())
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
    let email = email
        .or_else(|| std::env::var("BJJ_EMAIL").ok())
        .context("Email is required, pass --email or set BJJ_EMAIL")?;
    let password = password
        .or_else(|| std::env::var("BJJ_PASSWORD").ok())
        .context("Password is required, pass --password or set BJJ_PASSWORD")?;

    let backend = Arc::new(HttpBackend::new(&server)?);
    let session = if signup {
        backend.sign_up(&email, &password).await
    } else {
        backend.sign_in(&email, &password).await
    }
    .with_context(|| format!("Sign-in to {} failed", server))?;
    println!("Signed in as {} ({})", session.email, session.role);

    let reconciler = SyncReconciler::new(store, backend.clone());
    let report = reconciler.reconcile().await?;
    if report.created_profile {
        println!("Created your profile on the server");
    }
    if report.pulled_trainings > 0 {
        println!("Pulled {} trainings", report.pulled_trainings);
    }

    let result = reconciler.flush_with_retry(RetryPolicy::default()).await;
    let status = reconciler.current_status();
    println!("Pending changes: {}", status.pending);
    if status.parked > 0 {
        println!("Refused changes: {} (kept under {})", status.parked, keys::OUTBOX_PARKED);
    }
    if let Some(at) = status.last_synced_at {
        println!("Last synced:     {}", at.with_timezone(&Local).format("%Y-%m-%d %H:%M"));
    }
    if let Some(error) = &status.last_error {
        println!("Last error:      {}", error);
    }

    if let Err(err) = backend.sign_out().await {
        debug!(error = %err, "Sign-out failed");
    }
    result?;
    Ok(())
}
