//! MultiInstance - Run multiple isolated instances of single-instance applications
//!
//! Each instance gets its own data container and launcher bundle, so apps that
//! restrict themselves to one copy can run side by side.

#![allow(dead_code)] // Many API methods are part of a comprehensive public API

mod core;
mod error;
mod persistence;
mod platform;
mod shim;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::{
    AppInstance, AppState, InstanceOptions, IsolationMethod, LaunchOutcome, ProcessEvent, Settings,
};

/// Application name constant
pub const APP_NAME: &str = "MultiInstance";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "multiinstance", version, about = "Run isolated copies of one application")]
struct Cli {
    /// Data directory (settings, store and containers)
    #[arg(long, global = true, env = "MULTIINSTANCE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List instances
    List,
    /// Show an instance and the environment it launches with
    Info { instance: String },
    /// Create an instance of an application bundle
    Create {
        /// Path to the .app bundle
        app: PathBuf,
        /// Instance name (defaults to the application name)
        #[arg(short, long, default_value = "")]
        name: String,
        /// Extra environment variable, KEY=VALUE
        #[arg(short, long = "env", value_parser = parse_key_value)]
        environment: Vec<(String, String)>,
        /// Extra launch argument
        #[arg(short, long = "arg", allow_hyphen_values = true)]
        arguments: Vec<String>,
        /// Isolation method to use instead of the detected one
        #[arg(long)]
        isolation: Option<IsolationMethod>,
        /// Custom launcher icon
        #[arg(long)]
        icon: Option<PathBuf>,
        /// Wipe the instance's data whenever it quits
        #[arg(long)]
        erase_on_quit: bool,
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// Launch an instance and wait for it to quit
    Launch {
        instance: String,
        /// Return once the instance has started
        #[arg(short, long)]
        detach: bool,
    },
    Rename { instance: String, name: String },
    Duplicate {
        instance: String,
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Delete an instance
    Delete {
        instance: String,
        /// Keep the data container
        #[arg(long)]
        keep_data: bool,
    },
    /// Check an instance's container
    Validate { instance: String },
    /// Recreate missing container entries
    Repair { instance: String },
    /// Wipe an instance's data
    Reset { instance: String },
    /// Show an instance's launcher in the file browser
    Reveal { instance: String },
    /// Write instance definitions as JSON
    Export {
        /// Instances to export (all when omitted)
        instances: Vec<String>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Create instances from an export file
    Import { file: PathBuf },
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    let settings = match &cli.data_dir {
        Some(dir) => Settings::load_from_dir(dir),
        None => {
            let defaults = Settings::default();
            Settings::load_from_dir(&defaults.get_data_directory())
        }
    }
    .context("Failed to load settings")?;

    let state = Arc::new(AppState::new(settings).context("Failed to initialize state")?);
    run(state, cli.command).await
}

async fn run(state: Arc<AppState>, command: Commands) -> Result<()> {
    match command {
        Commands::List => {
            let instances = state.list()?;
            if instances.is_empty() {
                println!("No instances");
            }
            for instance in instances {
                println!(
                    "{}  {:<24} {:<32} {}",
                    instance.id.short(),
                    instance.name,
                    instance.target_bundle_id,
                    instance.isolation_method().label()
                );
            }
        }
        Commands::Info { instance } => {
            let instance = state.find(&instance)?;
            let launch = state.effective_launch(instance.id)?;
            let info = serde_json::json!({
                "instance": instance,
                "compatibility": instance.target_app_type.compatibility(),
                "running": state.tracker.running(instance.id),
                "launch": launch,
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Create {
            app,
            name,
            environment,
            arguments,
            isolation,
            icon,
            erase_on_quit,
            notes,
        } => {
            let options = InstanceOptions {
                environment: environment.into_iter().collect(),
                arguments,
                icon_path: icon,
                isolation_override: isolation,
                erase_data_on_quit: erase_on_quit,
                show_in_quick_launch: false,
                notes,
            };
            let created = state.create(&name, &app, options)?;
            print_created(&created);
        }
        Commands::Launch { instance, detach } => {
            let instance = state.find(&instance)?;
            launch(&state, &instance, detach).await?;
        }
        Commands::Rename { instance, name } => {
            let instance = state.find(&instance)?;
            let renamed = state.rename(instance.id, &name)?;
            println!("Renamed to '{}' ({})", renamed.name, renamed.shim_path.display());
        }
        Commands::Duplicate { instance, name } => {
            let instance = state.find(&instance)?;
            let copy = state.duplicate(instance.id, name.as_deref())?;
            print_created(&copy);
        }
        Commands::Delete {
            instance,
            keep_data,
        } => {
            let instance = state.find(&instance)?;
            state.delete(instance.id, !keep_data).await?;
            println!("Deleted '{}'", instance.name);
        }
        Commands::Validate { instance } => {
            let instance = state.find(&instance)?;
            let report = state.validate(instance.id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_valid() {
                anyhow::bail!("Container for '{}' needs repair", instance.name);
            }
        }
        Commands::Repair { instance } => {
            let instance = state.find(&instance)?;
            let report = state.repair(instance.id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Reset { instance } => {
            let instance = state.find(&instance)?;
            state.reset_data(instance.id)?;
            println!("Reset data for '{}'", instance.name);
        }
        Commands::Reveal { instance } => {
            let instance = state.find(&instance)?;
            state.reveal(instance.id)?;
        }
        Commands::Export { instances, output } => {
            let ids = instances
                .iter()
                .map(|query| state.find(query).map(|i| i.id))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let json = state.export(&ids)?.to_json()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Exported to {}", path.display());
                }
                None => println!("{}", json),
            }
        }
        Commands::Import { file } => {
            let json = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let report = state.import(&json)?;
            for created in &report.created {
                print_created(created);
            }
            for (name, reason) in &report.failed {
                eprintln!("Skipped '{}': {}", name, reason);
            }
        }
    }
    Ok(())
}

fn print_created(instance: &AppInstance) {
    println!(
        "Created '{}' ({})\n  data:     {}\n  launcher: {}",
        instance.name,
        instance.id,
        instance.data_path.display(),
        instance.shim_path.display()
    );
}

/// Launch an instance and, unless detached, stay attached until it quits
async fn launch(state: &Arc<AppState>, instance: &AppInstance, detach: bool) -> Result<()> {
    let mut events = state.tracker.subscribe();

    let outcome = if detach {
        state.launch_detached(instance.id).await?
    } else {
        state.launch(instance.id).await?
    };
    let process = match outcome {
        LaunchOutcome::Started(process) => process,
        LaunchOutcome::AlreadyRunning(_) => {
            println!("'{}' is already running", instance.name);
            return Ok(());
        }
    };
    println!("Launched '{}' (PID {})", instance.name, process.pid);
    if detach {
        return Ok(());
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event @ ProcessEvent::Terminated { instance_id, exit_code, .. }) if instance_id == instance.id => {
                    println!("'{}' exited ({:?})", instance.name, exit_code);
                    state.handle_event(&event);
                    break;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    if !state.tracker.is_running(instance.id) {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, terminating '{}'", instance.name);
                state.terminate(instance.id);
            }
        }
    }
    Ok(())
}

/// Initialize the logging system
fn init_logging(verbose: bool) {
    let default = if verbose {
        "multiinstance=debug"
    } else {
        "multiinstance=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
