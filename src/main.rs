#[macro_use]
extern crate lazy_static;

mod admin;
mod config;
mod error;
mod evidence;
mod identity;
mod machine;
mod protocol;
mod session;
mod store;
mod timer;
mod token;
mod transport;

use admin::{AdminClient, FreeBlock, RosterFilter, RosterMonitor, RosterQuery, StudentStatus};
use clap::{Parser, Subcommand};
use config::Config;
use error::CaptureError;
use evidence::{CaptureProgress, EvidenceArtifact, EvidenceCapture, FileRecorder};
use identity::FingerprintProvider;
use machine::{CheckInState, Waiting};
use protocol::{CheckInMode, CheckInResult};
use session::{log_in, CheckInSession, CheckInUi};
use std::error::Error;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use store::{FileIdentityStore, IdentityStore};
use timer::{Clock, SystemClock};
use token::{qr_url, KioskDisplay, KioskPoller};
use transport::HttpBackend;

type CliResult = Result<(), Box<dyn Error>>;

// How often a recording in progress is polled for new media.
const RECORDING_POLL: Duration = Duration::from_millis(250);

/// Check in to free periods and senior privileges by scanning the kiosk's QR code.
#[derive(Parser)]
#[command(name = "chargerauth")]
#[command(version)]
#[command(long_about = None)]
struct Cli {
    /// Log debug output
    #[arg(short, long)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Backend base URL, overrides config.json
    #[arg(long)]
    backend: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Remember who checks in from this device (email or student id)
    Login { identity: String },

    /// Forget the stored identity
    Logout,

    /// Print this device's fingerprint
    Fingerprint,

    /// Run the kiosk display, printing each new QR code URL (asks for the admin password)
    Kiosk,

    /// Check in with a scanned QR code URL (or just its fragment)
    Scan {
        url: String,

        /// Clip to submit if the scanned code turns out to be stale
        #[arg(long)]
        evidence: Option<PathBuf>,
    },

    /// Admin commands, each one asks for the admin password first
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Show what this kiosk login is allowed to do
    Perms,

    /// Show who has (and hasn't) checked in
    Roster {
        /// A block letter (A-G) or "sp" for senior privileges
        target: String,

        #[arg(long)]
        from: Option<String>,

        #[arg(long)]
        to: Option<String>,

        /// Only show students with this status
        #[arg(long)]
        status: Option<StudentStatus>,

        /// Case-insensitive match on name or email
        #[arg(long)]
        search: Option<String>,

        /// Keep polling and reprinting
        #[arg(long)]
        watch: bool,
    },

    /// List seniors and whether they have privileges
    Seniors,

    /// Turn senior privileges on or off
    Sp {
        #[command(subcommand)]
        toggle: SpToggle,
    },

    /// Wipe every in-progress check-in for the current window
    ForceReset,

    /// Save the clip behind a tentative check-in
    Video {
        /// Block letter (A-G) the check-in was for
        block: FreeBlock,

        email: String,

        /// Where to write the clip, defaults to <email>-<block>.webm
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Check a student in without a phone (teacher-monitored kiosks only)
    Manual {
        email_or_id: String,

        #[arg(long, default_value = "free_period")]
        mode: CheckInMode,
    },
}

#[derive(Subcommand)]
enum SpToggle {
    Enable {
        #[arg(long)]
        is_for: Option<String>,
    },
    Disable {
        #[arg(long)]
        is_for: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.quiet {
        tracing::Level::ERROR
    } else if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> CliResult {
    let mut config = config::get_config()?;
    if let Some(backend) = cli.backend {
        config.backend_url = backend;
    }
    tracing::debug!("Using config {:?}", config);

    match cli.command {
        Commands::Login { identity } => login(&config, &identity),
        Commands::Logout => {
            FileIdentityStore::in_app_data().clear()?;
            println!("Logged out");
            Ok(())
        }
        Commands::Fingerprint => {
            println!("{}", FingerprintProvider::system().get_fingerprint()?);
            Ok(())
        }
        Commands::Kiosk => kiosk(&config),
        Commands::Scan { url, evidence } => scan(&config, &url, evidence),
        Commands::Admin { command } => admin(&config, command),
    }
}

fn login(config: &Config, raw: &str) -> CliResult {
    let backend = HttpBackend::new(&config.backend_url, config.request_timeout())?;
    let identity = log_in(&backend, &mut FileIdentityStore::in_app_data(), raw)?;
    println!("Checking in as {}", identity);
    Ok(())
}

// The session cookie only lives as long as this process, so every privileged
// command starts by logging in.
fn admin_login(backend: &HttpBackend) -> Result<AdminClient<'_, HttpBackend>, Box<dyn Error>> {
    let client = AdminClient::new(backend);
    let password = rpassword::prompt_password_stdout("Admin password: ")?;
    client.login(&password)?;
    Ok(client)
}

fn kiosk(config: &Config) -> CliResult {
    let backend = HttpBackend::new(&config.backend_url, config.request_timeout())?;
    admin_login(&backend)?;
    let clock = SystemClock;
    let mut poller = KioskPoller::new(&backend, config.kiosk_retry());
    let mut last_shown = None;

    loop {
        if poller.tick(clock.now()) && last_shown.as_ref() != Some(poller.display()) {
            match poller.display() {
                KioskDisplay::Loading => println!("Loading..."),
                KioskDisplay::Showing { token, free_block } => {
                    if let Some(block) = free_block {
                        println!("Checking in to {} block", block);
                    }
                    println!("{}", qr_url(&config.checkin_page_url, &token.value));
                }
                KioskDisplay::NothingToCheckInto => println!("Nothing to check in to right now"),
                KioskDisplay::NotLoggedIn => {}
            }
            last_shown = Some(poller.display().clone());
        }
        if poller.is_stopped() {
            return Err("This login isn't allowed to run a kiosk".into());
        }
        let wait = poller
            .timer()
            .time_until_due(clock.now())
            .and_then(|d| d.to_std().ok())
            .unwrap_or_else(|| config.request_timeout());
        std::thread::sleep(wait);
    }
}

struct TerminalUi {
    evidence: Option<PathBuf>,
    max_evidence: chrono::Duration,
}

impl CheckInUi for TerminalUi {
    fn show(&mut self, state: &CheckInState) {
        match state {
            CheckInState::Idle { waiting_for } => match waiting_for {
                Waiting::Scan => tracing::debug!("Waiting for a scan"),
                Waiting::Identity => println!("Not logged in, run `login <email or id>` first"),
                Waiting::Fingerprint => println!("Couldn't identify this device"),
                Waiting::Token => tracing::debug!("Exchanging kiosk token"),
                Waiting::Evidence => println!("That QR code has expired, sending a recording instead"),
            },
            CheckInState::Loading { .. } => println!("Checking in..."),
            CheckInState::Ok { student_name } => match student_name {
                Some(name) => println!("Checked in {}", name),
                None => println!("Checked in"),
            },
            CheckInState::Err(failure) => println!("{}", failure.user_message()),
            CheckInState::ModeNeeded => println!("What are you checking in for?"),
        }
    }

    fn pick_mode(&mut self) -> Option<CheckInMode> {
        for (i, mode) in CheckInMode::ALL.iter().enumerate() {
            println!("  {}) {}", i + 1, mode.label());
        }
        print!("> ");
        io::stdout().flush().ok()?;

        let line = io::stdin().lock().lines().next()?.ok()?;
        let choice: usize = line.trim().parse().ok()?;
        CheckInMode::ALL.get(choice.checked_sub(1)?).copied()
    }

    fn capture_evidence(&mut self) -> Result<EvidenceArtifact, CaptureError> {
        let path = self.evidence.as_ref().ok_or_else(|| {
            CaptureError::Device("no camera here, pass --evidence <clip.webm>".to_owned())
        })?;

        let clock = SystemClock;
        let mut capture =
            EvidenceCapture::begin(FileRecorder::new(path), clock.now(), self.max_evidence)?;
        println!(
            "Recording (up to {}s), press Enter to stop",
            self.max_evidence.num_seconds()
        );

        let (enter_tx, enter_rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut line = String::new();
            let _ = io::stdin().read_line(&mut line);
            let _ = enter_tx.send(());
        });

        loop {
            match enter_rx.recv_timeout(RECORDING_POLL) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if capture.poll(clock.now())? == CaptureProgress::CapReached {
                        println!("Reached the recording limit, press Enter to send");
                        // Wait for that Enter here so it isn't read as a mode choice.
                        let _ = enter_rx.recv();
                        break;
                    }
                }
                _ => break,
            }
        }
        capture.finish(clock.now())
    }
}

fn scan(config: &Config, url: &str, evidence: Option<PathBuf>) -> CliResult {
    let backend = HttpBackend::new(&config.backend_url, config.request_timeout())?;
    let identity_store = FileIdentityStore::in_app_data();
    let fingerprints = FingerprintProvider::system();
    let mut ui = TerminalUi {
        evidence,
        max_evidence: config.max_evidence(),
    };

    // Only the fragment matters, a full URL works just as well.
    let fragment = url.splitn(2, '#').last().unwrap_or(url);
    let mut session = CheckInSession::new(&backend, &identity_store, &fingerprints);
    match session.run_scan(fragment, &mut ui) {
        CheckInState::Ok { .. } => Ok(()),
        CheckInState::Idle {
            waiting_for: Waiting::Scan,
        } => Err("No kiosk token in that URL".into()),
        _ => Err("Check-in did not go through".into()),
    }
}

fn admin(config: &Config, command: AdminCommands) -> CliResult {
    let backend = HttpBackend::new(&config.backend_url, config.request_timeout())?;
    let client = admin_login(&backend)?;

    match command {
        AdminCommands::Perms => {
            let perms = client.perms()?;
            println!("admin: {}", perms.is_admin);
            println!("teacher monitored: {}", perms.teacher_monitored);
        }
        AdminCommands::Roster {
            target,
            from,
            to,
            status,
            search,
            watch,
        } => {
            let query = if target.eq_ignore_ascii_case("sp") {
                RosterQuery::SeniorPrivilege {
                    from_date: from,
                    to_date: to,
                }
            } else {
                RosterQuery::Block(target.parse::<FreeBlock>()?)
            };
            let filter = RosterFilter { status, search };
            roster(config, &backend, query, &filter, watch)?;
        }
        AdminCommands::Seniors => {
            let seniors = client.seniors()?;
            for (email, enabled) in seniors.iter() {
                println!(
                    "{} {:<30} {}",
                    if enabled { "[x]" } else { "[ ]" },
                    seniors.name(email).unwrap_or(""),
                    email
                );
            }
            println!("{}/{} have privileges", seniors.enabled_count(), seniors.len());
        }
        AdminCommands::Sp { toggle } => {
            let (enabled, is_for) = match toggle {
                SpToggle::Enable { is_for } => (true, is_for),
                SpToggle::Disable { is_for } => (false, is_for),
            };
            let mut seniors = client.seniors()?;
            client.toggle_sp(&mut seniors, enabled, is_for.as_deref())?;
            println!("{}/{} have privileges", seniors.enabled_count(), seniors.len());
        }
        AdminCommands::ForceReset => {
            print!("Type '{}' if you want to force reset: ", admin::RESET_CONFIRMATION);
            io::stdout().flush()?;
            let mut confirmation = String::new();
            io::stdin().read_line(&mut confirmation)?;
            client.force_reset(confirmation.trim())?;
            println!("Reset successful");
        }
        AdminCommands::Video { block, email, out } => {
            let video = client.student_video(block, &email)?;
            let out = out.unwrap_or_else(|| PathBuf::from(format!("{}-{}.webm", email, block)));
            std::fs::write(&out, &video)?;
            println!("Saved {} bytes to {}", video.len(), out.display());
        }
        AdminCommands::Manual { email_or_id, mode } => {
            match client.manual_check_in(&email_or_id, mode)? {
                CheckInResult::Ok { student_name } => {
                    println!("Checked in {}", student_name.as_deref().unwrap_or(&email_or_id))
                }
                CheckInResult::Err(failure) => return Err(failure.user_message().into()),
                CheckInResult::ModeNeeded | CheckInResult::Loading => {
                    return Err("Server wants a different mode, try --mode".into())
                }
            }
        }
    }
    Ok(())
}

fn roster(
    config: &Config,
    backend: &HttpBackend,
    query: RosterQuery,
    filter: &RosterFilter,
    watch: bool,
) -> CliResult {
    let clock = SystemClock;
    let mut monitor = RosterMonitor::new(backend, query, config.admin_poll());

    loop {
        if monitor.tick(clock.now()) {
            if let Some(e) = monitor.last_error() {
                eprintln!("Couldn't refresh roster: {}", e);
            }
            for entry in monitor.view(filter) {
                println!(
                    "{:<14} {:<30} {} {}",
                    entry.status.wire_name(),
                    entry.name,
                    entry.email,
                    entry.date_str.as_deref().unwrap_or("")
                );
            }
            let counts = monitor.counts();
            let summary: Vec<String> = counts
                .iter()
                .map(|(status, n)| format!("{} {}", n, status))
                .collect();
            println!("-- {}", summary.join(", "));
        }
        if !watch {
            monitor.stop();
            return Ok(());
        }
        let wait = monitor
            .timer()
            .time_until_due(clock.now())
            .and_then(|d| d.to_std().ok())
            .unwrap_or_else(|| config.request_timeout());
        std::thread::sleep(wait);
    }
}
