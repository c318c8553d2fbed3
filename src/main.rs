use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing_subscriber::EnvFilter;

use hfp_bridge::bluetooth::{
    AdapterService, Bluetoothctl, ChannelDiscovery, ConnectionState, Sdptool, DEFAULT_HFP_CHANNEL,
};
use hfp_bridge::call::{CallSnapshot, CallState};
use hfp_bridge::config::Config;
use hfp_bridge::errors::HfpError;
use hfp_bridge::session::{Collaborators, Session};
use hfp_bridge::ui::UiEvent;

/// Delay before restarting a listener that lost its link.
const LISTENER_RESTART_DELAY: Duration = Duration::from_secs(5);

// ── CLI definition ─────────────────────────────────────────────────────────────

/// hfp-bridge: use your PC as a Bluetooth hands-free headset for your phone
#[derive(Parser)]
#[command(name = "hfp-bridge", version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of ~/.config/hfp-bridge/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for calls; answer, reject, hang up and dial from the keyboard
    Listen {
        /// Number or tel: URI to dial once the phone link is up
        #[arg(long)]
        dial: Option<String>,
    },

    /// Place a call on a dedicated control channel, then stay in the call loop
    Call {
        /// Number or tel: URI, e.g. +15550000 or tel:+1-555-0000
        number: String,
    },

    /// Print the phone's HFP RFCOMM channel
    Channel,

    /// Show phone address and connection state
    Status,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigCmd,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Create a default config file at ~/.config/hfp-bridge/config.toml
    Init,

    /// Print the path to the config file
    Path,

    /// Show current config values
    Show,
}

// ── Entry point ────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // User-facing messages are printed from UI events already.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},hfp_bridge::ui=warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command {
        // ── hfp-bridge listen ──────────────────────────────────────────────────
        Commands::Listen { dial } => {
            let config = Config::load_or_default(config_path)?;
            let (session, rx) = open_session(config)?;

            blocking(&session, |s| s.start_listener()).await?;
            if let Some(target) = dial {
                blocking(&session, move |s| s.queue_dial(&target)).await?;
            }
            print_help();
            call_loop(session, rx, true).await?;
        }

        // ── hfp-bridge call <number> ───────────────────────────────────────────
        Commands::Call { number } => {
            let config = Config::load_or_default(config_path)?;
            let (session, rx) = open_session(config)?;

            println!("{} Dialing {}", "→".cyan().bold(), number.yellow());
            blocking(&session, move |s| s.dial(&number)).await?;
            print_help();
            call_loop(session, rx, false).await?;
        }

        // ── hfp-bridge channel ─────────────────────────────────────────────────
        Commands::Channel => {
            let config = Config::load_or_default(config_path)?;
            let adapter = adapter_for(&config)?;
            let addr = adapter.device_address().ok_or(HfpError::NoDevice)?;

            match (config.channel, Sdptool.find_hfp_channel(addr)) {
                (Some(ch), _) => println!("{} {} (from config)", "●".green().bold(), ch),
                (None, Some(ch)) => println!("{} {} (SDP)", "●".green().bold(), ch),
                (None, None) => println!(
                    "{} not advertised, default {} will be used",
                    "○".dimmed(),
                    DEFAULT_HFP_CHANNEL
                ),
            }
        }

        // ── hfp-bridge status ──────────────────────────────────────────────────
        Commands::Status => {
            let config = Config::load_or_default(config_path)?;
            let adapter = adapter_for(&config)?;
            match adapter.device_address() {
                Some(addr) => {
                    let state = adapter.connection_state();
                    let shown = if state == ConnectionState::Connected {
                        state.label().green().bold()
                    } else {
                        state.label().yellow()
                    };
                    println!("  Phone: {}", addr.to_string().cyan());
                    println!("  State: {}", shown);
                }
                None => println!("{} No connected phone found.", "○".dimmed()),
            }
        }

        // ── hfp-bridge config ──────────────────────────────────────────────────
        Commands::Config { action } => match action {
            ConfigCmd::Init => {
                let path = Config::write_default()?;
                println!(
                    "{} Created config at {}",
                    "✓".green().bold(),
                    path.display().to_string().cyan()
                );
                println!("  Edit it to pin your phone's address or RFCOMM channel.");
            }
            ConfigCmd::Path => {
                println!("{}", Config::path().display());
            }
            ConfigCmd::Show => {
                let config = match config_path {
                    Some(p) => Config::load_from(p)?,
                    None => Config::load()?,
                };
                print!("{}", toml::to_string_pretty(&config).map_err(HfpError::from)?);
            }
        },
    }

    Ok(())
}

// ── Session plumbing ───────────────────────────────────────────────────────────

fn adapter_for(config: &Config) -> Result<Bluetoothctl, HfpError> {
    let device = config
        .device
        .as_deref()
        .map(hfp_bridge::bluetooth::BdAddr::parse)
        .transpose()?;
    Ok(Bluetoothctl { device })
}

fn open_session(config: Config) -> anyhow::Result<(Arc<Session>, UnboundedReceiver<UiEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let collab = Collaborators::system(&config, Arc::new(tx))?;
    Ok((Arc::new(Session::new(config, collab)), rx))
}

/// Run a blocking session call off the async runtime.
async fn blocking<T, F>(session: &Arc<Session>, f: F) -> anyhow::Result<T>
where
    F: FnOnce(&Session) -> Result<T, HfpError> + Send + 'static,
    T: Send + 'static,
{
    let s = session.clone();
    let out = tokio::task::spawn_blocking(move || f(&s))
        .await
        .context("session task failed")?;
    Ok(out?)
}

async fn call_loop(
    session: Arc<Session>,
    mut rx: UnboundedReceiver<UiEvent>,
    restart_listener: bool,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            event = rx.recv() => match event {
                Some(UiEvent::ListenerLost) => {
                    println!("{} Phone link lost", "✗".red().bold());
                    if restart_listener {
                        schedule_listener_restart(session.clone());
                    }
                }
                Some(event) => show_event(event),
                None => break,
            },

            line = lines.next_line(), if stdin_open => match line.context("reading stdin")? {
                Some(line) => {
                    if !command(&session, line.trim()).await {
                        break;
                    }
                }
                None => stdin_open = false,
            },
        }
    }

    println!("{} Shutting down", "○".dimmed());
    blocking(&session, |s| {
        s.shutdown();
        Ok(())
    })
    .await
}

/// Returns `false` to quit.
async fn command(session: &Arc<Session>, line: &str) -> bool {
    let (cmd, arg) = line
        .split_once(char::is_whitespace)
        .map(|(c, a)| (c, a.trim()))
        .unwrap_or((line, ""));

    let result = match cmd {
        "" => return true,
        "q" | "quit" => return false,
        "a" | "answer" => blocking(session, |s| s.answer()).await,
        "r" | "reject" => blocking(session, |s| s.reject()).await,
        "h" | "hangup" => blocking(session, |s| s.hangup()).await,
        "d" | "dial" if !arg.is_empty() => {
            let target = arg.to_string();
            blocking(session, move |s| s.dial(&target)).await
        }
        _ => {
            print_help();
            return true;
        }
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "error:".red().bold(), e);
    }
    true
}

fn schedule_listener_restart(session: Arc<Session>) {
    tokio::spawn(async move {
        tokio::time::sleep(LISTENER_RESTART_DELAY).await;
        let restarted = blocking(&session, |s| {
            if s.listener_running() || s.connection_state() != ConnectionState::Connected {
                return Ok(false);
            }
            s.start_listener().map(|()| true)
        })
        .await;
        match restarted {
            Ok(true) => println!("{} Restarting call listener", "→".cyan().bold()),
            Ok(false) => {}
            Err(e) => eprintln!("{} {:#}", "error:".red().bold(), e),
        }
    });
}

// ── Output ─────────────────────────────────────────────────────────────────────

fn show_event(event: UiEvent) {
    match event {
        UiEvent::Log(msg) => println!("{} {}", "·".dimmed(), msg),
        UiEvent::CallChanged(snapshot) => print_call(&snapshot),
        UiEvent::Raise => println!("{} Press a to answer, r to reject", "☎".yellow().bold()),
        UiEvent::Alert => {
            print!("\x07");
            let _ = std::io::stdout().flush();
        }
        UiEvent::ListenerLost => {}
    }
}

fn print_call(snapshot: &CallSnapshot) {
    let who = match (&snapshot.name, &snapshot.number) {
        (Some(name), Some(number)) => format!("{} ({})", name, number),
        (None, Some(number)) => number.clone(),
        _ => String::new(),
    };
    let state = match snapshot.state {
        CallState::Idle => "idle".dimmed(),
        CallState::Ringing => "ringing".yellow().bold(),
        CallState::Outgoing => "calling".cyan().bold(),
        CallState::Active => "in call".green().bold(),
    };
    if who.is_empty() {
        println!("{} {}", "●".bold(), state);
    } else {
        println!("{} {}  {}", "●".bold(), state, who.yellow());
    }
}

fn print_help() {
    println!(
        "{}",
        "  a answer · r reject · h hang up · d <number> dial · q quit".dimmed()
    );
}
