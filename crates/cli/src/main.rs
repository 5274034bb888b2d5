//! studyphase CLI - operate the study-phase progression engine over a JSON store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use studyphase_core::{PatientId, PhaseConfigInput, PhaseId, StudyId, TemplateId};
use studyphase_engine::{EngineConfig, PhaseEngine, TicketOutcome};
use studyphase_storage::JsonStorage;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "studyphase")]
#[command(about = "Clinical study phase progression engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Storage directory
    #[arg(short, long, default_value = ".studyphase")]
    storage: PathBuf,

    /// Engine config file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage study phases
    Phases {
        #[command(subcommand)]
        command: PhaseCommands,
    },
    /// Create progress records for a patient
    Bootstrap {
        /// Patient ID
        patient: String,
        /// Study ID
        study: String,
    },
    /// Record a template completion
    Complete {
        /// Patient ID
        patient: String,
        /// Phase ID
        phase: String,
        /// Template ID
        template: String,
        /// Mark the template incomplete instead
        #[arg(long)]
        incomplete: bool,
        /// Form instance behind the completion
        #[arg(long)]
        form_instance: Option<String>,
        /// Seconds to wait for the completion to apply
        #[arg(long, default_value = "10")]
        wait: u64,
    },
    /// Show a patient's progress in a study
    Progress {
        /// Patient ID
        patient: String,
        /// Study ID
        study: String,
    },
    /// Show a patient's folder for a phase
    Folder {
        /// Patient ID
        patient: String,
        /// Phase ID
        phase: String,
    },
    /// Evaluate whether a patient may leave a phase
    Evaluate {
        /// Patient ID
        patient: String,
        /// Phase ID
        phase: String,
    },
    /// Skip a phase for a patient
    Skip {
        /// Patient ID
        patient: String,
        /// Phase ID
        phase: String,
        /// Why the phase is skipped
        #[arg(long)]
        reason: String,
    },
    /// Lock a phase for a patient
    Lock {
        /// Patient ID
        patient: String,
        /// Phase ID
        phase: String,
    },
    /// Unlock a phase for a patient
    Unlock {
        /// Patient ID
        patient: String,
        /// Phase ID
        phase: String,
    },
    /// Record an approval for leaving a phase
    Approve {
        /// Patient ID
        patient: String,
        /// Phase ID
        phase: String,
        /// Approver role
        #[arg(long)]
        role: String,
        /// Approver
        #[arg(long)]
        by: String,
    },
    /// Regenerate a patient's folders from stored progress
    Rebuild {
        /// Patient ID
        patient: String,
        /// Study ID
        study: String,
    },
}

#[derive(Subcommand)]
enum PhaseCommands {
    /// Create phases from a JSON file holding an array of phase inputs
    Create {
        /// Study ID
        study: String,
        /// Phase definitions
        file: PathBuf,
    },
    /// List phases of a study
    List {
        /// Study ID
        study: String,
        /// Include deactivated phases
        #[arg(long)]
        all: bool,
    },
    /// Deactivate a phase
    Deactivate {
        /// Phase ID
        id: String,
    },
}

fn init_logging() {
    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let storage = JsonStorage::new(&cli.storage)
        .await
        .with_context(|| format!("opening storage {}", cli.storage.display()))?;
    let engine = PhaseEngine::builder(Arc::new(storage))
        .with_config(config)
        .build();

    match cli.command {
        Commands::Phases { command } => match command {
            PhaseCommands::Create { study, file } => {
                let json = std::fs::read_to_string(&file)
                    .with_context(|| format!("reading {}", file.display()))?;
                let inputs: Vec<PhaseConfigInput> = serde_json::from_str(&json)?;
                let phases = engine.create_phases(&StudyId::from(study), inputs).await?;
                print_json(&phases)?;
            }
            PhaseCommands::List { study, all } => {
                let study = StudyId::from(study);
                let phases = if all {
                    engine.phases().get_all_phases(&study).await?
                } else {
                    engine.get_phases(&study).await?
                };
                print_json(&phases)?;
            }
            PhaseCommands::Deactivate { id } => {
                let phase = engine.deactivate_phase(&PhaseId::from(id)).await?;
                print_json(&phase)?;
            }
        },
        Commands::Bootstrap { patient, study } => {
            let records = engine
                .bootstrap_patient(&PatientId::from(patient), &StudyId::from(study))
                .await?;
            print_json(&records)?;
        }
        Commands::Complete {
            patient,
            phase,
            template,
            incomplete,
            form_instance,
            wait,
        } => {
            let mut ticket = engine.submit_completion(
                &PatientId::from(patient),
                &PhaseId::from(phase),
                &TemplateId::from(template),
                !incomplete,
                form_instance,
            )?;
            let mut outcome = ticket.wait(Duration::from_secs(wait)).await;
            engine.shutdown().await;
            if !outcome.is_settled() {
                outcome = ticket.wait(Duration::ZERO).await;
            }

            match outcome {
                TicketOutcome::Applied(progress) => print_json(&progress)?,
                TicketOutcome::Unchanged(progress) => {
                    info!("Completion already recorded; nothing changed");
                    print_json(&progress)?;
                }
                TicketOutcome::Pending => {
                    info!("Completion accepted; outcome not reported");
                }
                TicketOutcome::Dropped(reason) => bail!("Completion dropped: {}", reason),
                TicketOutcome::DeadLettered(error) => bail!("Completion failed: {}", error),
            }
        }
        Commands::Progress { patient, study } => {
            let records = engine
                .get_progress(&PatientId::from(patient), &StudyId::from(study))
                .await?;
            print_json(&records)?;
        }
        Commands::Folder { patient, phase } => {
            let folder = engine
                .get_folder(&PatientId::from(patient), &PhaseId::from(phase))
                .await?;
            print_json(&folder)?;
        }
        Commands::Evaluate { patient, phase } => {
            let decision = engine
                .evaluate_transition(&PatientId::from(patient), &PhaseId::from(phase))
                .await?;
            print_json(&decision)?;
        }
        Commands::Skip {
            patient,
            phase,
            reason,
        } => {
            let outcome = engine
                .skip_phase(&PatientId::from(patient), &PhaseId::from(phase), &reason)
                .await?;
            print_json(&outcome.progress)?;
        }
        Commands::Lock { patient, phase } => {
            let outcome = engine
                .lock_phase(&PatientId::from(patient), &PhaseId::from(phase))
                .await?;
            print_json(&outcome.progress)?;
        }
        Commands::Unlock { patient, phase } => {
            let outcome = engine
                .unlock_phase(&PatientId::from(patient), &PhaseId::from(phase))
                .await?;
            print_json(&outcome.progress)?;
        }
        Commands::Approve {
            patient,
            phase,
            role,
            by,
        } => {
            let outcome = engine
                .record_approval(&PatientId::from(patient), &PhaseId::from(phase), &role, &by)
                .await?;
            print_json(&outcome.progress)?;
        }
        Commands::Rebuild { patient, study } => {
            let folders = engine
                .rebuild_folders(&PatientId::from(patient), &StudyId::from(study))
                .await?;
            print_json(&folders)?;
        }
    }

    Ok(())
}
