//! Loopherd - Multi-Project AI Loop Orchestration
//!
//! Command-line front end over the project registry: register project
//! roots, run development loops with bounded concurrency, and stream
//! their events.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use uuid::Uuid;

use loopherd::config::RegistryConfig;
use loopherd::events::LoopEvent;
use loopherd::project::{short_id, ProjectSummary};
use loopherd::registry::ProjectRegistry;
use loopherd::state::LoopState;

#[derive(Parser)]
#[command(name = "loopherd")]
#[command(version = "0.1.0")]
#[command(about = "Run autonomous development loops across many projects", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Config directory (defaults to the platform config dir)
    #[arg(long, global = true, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a project root
    Register {
        /// Project directory
        path: PathBuf,

        /// Display name (defaults to the directory name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Remove a project from the registry
    Unregister {
        /// Project id, id prefix, or display name
        project: String,
    },

    /// List registered projects and their loop states
    List,

    /// Show one project's full status
    Status {
        /// Project id, id prefix, or display name
        project: String,
    },

    /// Print a project's buffered loop output
    Logs {
        /// Project id, id prefix, or display name
        project: String,
    },

    /// Start a project's loop and stream its events (Ctrl-C stops it)
    Run {
        /// Project id, id prefix, or display name
        project: String,
    },

    /// Find unregistered projects under a directory
    Scan {
        /// Directory to scan
        dir: PathBuf,

        /// Register everything found
        #[arg(long)]
        register: bool,
    },

    /// Re-check registered paths and flag vanished ones
    Reconcile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "loopherd=debug,info"
    } else {
        "loopherd=warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config_dir = cli
        .config_dir
        .unwrap_or_else(RegistryConfig::default_config_dir);
    let registry = match ProjectRegistry::open(&config_dir) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Register { path, name } => match registry.register(&path, name) {
            Ok(summary) => {
                println!(
                    "{} Registered '{}' ({}) at {}",
                    "OK".green().bold(),
                    summary.display_name,
                    short_id(&summary.id),
                    summary.path.display()
                );
            }
            Err(e) => {
                eprintln!("{} {}", "Error:".red().bold(), e);
                std::process::exit(1);
            }
        },

        Commands::Unregister { project } => {
            let summary = resolve_project(&registry, &project);
            match registry.unregister(summary.id).await {
                Ok(()) => {
                    println!(
                        "{} Unregistered '{}'",
                        "OK".green().bold(),
                        summary.display_name
                    );
                }
                Err(e) => {
                    eprintln!("{} {}", "Error:".red().bold(), e);
                    std::process::exit(1);
                }
            }
        }

        Commands::List => {
            let all = registry.list_all();
            if all.is_empty() {
                println!("No projects registered");
            }
            for summary in all {
                println!("{}", format_row(&summary));
            }
        }

        Commands::Status { project } => {
            let summary = resolve_project(&registry, &project);
            print_status(&summary);
        }

        Commands::Logs { project } => {
            let summary = resolve_project(&registry, &project);
            match registry.logs(summary.id).await {
                Ok(lines) => {
                    for line in lines {
                        println!("{line}");
                    }
                }
                Err(e) => {
                    eprintln!("{} {}", "Error:".red().bold(), e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Run { project } => {
            let summary = resolve_project(&registry, &project);
            run_loop(&registry, summary).await;
        }

        Commands::Scan { dir, register } => match registry.scan_directory(&dir) {
            Ok(found) => {
                if found.is_empty() {
                    println!("No unregistered projects under {}", dir.display());
                }
                for path in found {
                    if register {
                        match registry.register(&path, None) {
                            Ok(summary) => println!(
                                "{} Registered '{}'",
                                "OK".green(),
                                summary.display_name
                            ),
                            Err(e) => eprintln!("{} {}", "Error:".red(), e),
                        }
                    } else {
                        println!("{}", path.display());
                    }
                }
            }
            Err(e) => {
                eprintln!("{} {}", "Error:".red().bold(), e);
                std::process::exit(1);
            }
        },

        Commands::Reconcile => {
            for summary in registry.reconcile().await {
                if summary.path_stale {
                    println!(
                        "{} '{}' path is gone: {}",
                        "Stale:".red().bold(),
                        summary.display_name,
                        summary.path.display()
                    );
                } else {
                    println!("{} '{}'", "OK".green(), summary.display_name);
                }
            }
        }
    }

    Ok(())
}

/// Start a loop and stream its events until it settles or Ctrl-C.
async fn run_loop(registry: &Arc<ProjectRegistry>, summary: ProjectSummary) {
    let started = match registry.request_start(summary.id).await {
        Ok(started) => started,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    };

    if started.state == LoopState::Queued {
        println!(
            "{} '{}' queued at position {}",
            "OK".green(),
            started.display_name,
            started.queue_position.unwrap_or(0)
        );
    } else {
        println!("{} '{}' running", "OK".green().bold(), started.display_name);
    }

    let mut events = match registry.subscribe(summary.id) {
        Ok(events) => events,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping '{}'...", summary.display_name);
                if let Err(e) = registry.request_stop(summary.id).await {
                    eprintln!("{} {}", "Error:".red().bold(), e);
                }
                registry.shutdown().await;
                return;
            }
            envelope = events.recv() => {
                let Some(envelope) = envelope else { return };
                print_event(&envelope.event);
                if matches!(
                    &envelope.event,
                    LoopEvent::LoopStatus { status, .. } if status == "stopped" || status == "error"
                ) {
                    return;
                }
            }
        }
    }
}

fn print_event(event: &LoopEvent) {
    match event {
        LoopEvent::PhaseChanged { from, to, story_id } => {
            println!("{} {} -> {} ({})", "phase".cyan(), from, to, story_id);
        }
        LoopEvent::StoryStarted {
            epic_id,
            story_id,
            title,
        } => {
            println!("{} {}/{}: {}", "story".cyan().bold(), epic_id, story_id, title);
        }
        LoopEvent::StoryCompleted {
            story_id, result, ..
        } => {
            println!("{} {} {}", "done".green(), story_id, result);
        }
        LoopEvent::LoopStatus { status, reason } => {
            let line = match reason {
                Some(reason) => format!("loop {status} ({reason})"),
                None => format!("loop {status}"),
            };
            println!("{}", line.yellow());
        }
        LoopEvent::Error { message, code } => {
            eprintln!("{} [{}] {}", "Error:".red().bold(), code, message);
        }
        LoopEvent::Output { line, .. } => println!("{line}"),
        LoopEvent::Heartbeat | LoopEvent::Replay { .. } => {}
    }
}

fn format_row(summary: &ProjectSummary) -> String {
    let state = match summary.state {
        LoopState::Running => "RUNNING".green().bold().to_string(),
        LoopState::Paused | LoopState::PauseRequested => {
            summary.state.to_string().to_uppercase().yellow().to_string()
        }
        LoopState::Error => "ERROR".red().bold().to_string(),
        other => other.to_string().to_uppercase(),
    };
    let mut extra = String::new();
    if let Some(position) = summary.queue_position {
        extra = format!(" (queue #{position})");
    } else if let Some(phase) = &summary.current_phase {
        extra = format!(" ({phase})");
    }
    format!(
        "{:<10} {} [{}] {}{}",
        state,
        summary.display_name,
        short_id(&summary.id),
        summary.path.display(),
        extra
    )
}

fn print_status(summary: &ProjectSummary) {
    println!("{}", format_row(summary));
    println!("  last status: {:?}", summary.last_status);
    if let Some(epic) = &summary.current_epic {
        println!("  epic: {epic}");
    }
    if let Some(story) = &summary.current_story {
        println!("  story: {story}");
    }
    if let Some(duration) = summary.phase_duration_seconds {
        println!("  phase running for {duration:.0}s");
    }
    if let Some(message) = &summary.error_message {
        println!("  {} {}", "error:".red(), message);
    }
    if summary.path_stale {
        println!("  {} project path no longer exists", "stale:".red());
    }
}

/// Resolve a project selector: full id, id prefix, or display name.
fn resolve_project(registry: &Arc<ProjectRegistry>, selector: &str) -> ProjectSummary {
    let all = registry.list_all();

    if let Ok(id) = selector.parse::<Uuid>() {
        if let Some(summary) = all.iter().find(|s| s.id == id) {
            return summary.clone();
        }
    }

    let matches: Vec<&ProjectSummary> = all
        .iter()
        .filter(|s| s.display_name == selector || s.id.to_string().starts_with(selector))
        .collect();

    match matches.as_slice() {
        [one] => (*one).clone(),
        [] => {
            eprintln!("{} No project matches '{}'", "Error:".red().bold(), selector);
            std::process::exit(1);
        }
        many => {
            eprintln!(
                "{} '{}' is ambiguous ({} matches)",
                "Error:".red().bold(),
                selector,
                many.len()
            );
            std::process::exit(1);
        }
    }
}
