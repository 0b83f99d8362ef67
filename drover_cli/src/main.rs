use drover_core::campaign::{
    AddJobRequest, Campaign, DestroyOutcome, JobSource, ShowKind, ShowReport,
};
use drover_core::config::DroverConfig;
use drover_core::decision::{DecisionProvider, InteractivePrompt, ScriptedDecisions};
use drover_core::registry::{JobId, SeedOutcome};
use drover_core::supervisor::StartOptions;
use drover_core::triage::TriageOutcome;
use drover_core::{CommandBuilder, SystemRunner, Variant};

use clap::{Args, Parser, Subcommand};
use env_logger::{Env, TimestampPrecision};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file. Defaults to ./drover.toml when present.
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    /// Workspace directory, overriding the configuration.
    #[clap(short, long, value_parser)]
    workspace: Option<PathBuf>,
    /// Answer yes to every confirmation prompt.
    #[clap(short, long)]
    yes: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the workspace and install the requested binaries.
    Create {
        #[clap(long)]
        harden: bool,
        #[clap(long)]
        asan: bool,
        #[clap(long)]
        coverage: bool,
    },
    /// Register a job, or add samples or sessions to an existing one.
    Add(AddArgs),
    /// Archive a job.
    Remove {
        #[clap(short, long)]
        job_id: String,
    },
    /// Start or resume fuzzing a job.
    Start {
        #[clap(short, long)]
        job_id: String,
        /// Minimize the corpus before resuming.
        #[clap(short, long)]
        minimize: bool,
        /// Track coverage while fuzzing.
        #[clap(long)]
        coverage: bool,
    },
    /// Kill every running fuzzer.
    Stop,
    /// Show jobs, their status or coverage reports.
    Show {
        #[clap(long, conflicts_with = "cov")]
        jobs: bool,
        #[clap(long)]
        cov: bool,
        #[clap(long)]
        json: bool,
    },
    /// Collect and deduplicate crashes.
    Triage {
        #[clap(short, long)]
        job_id: Option<String>,
    },
    /// Remove the workspace.
    Destroy,
    /// Write a job's sessions to a tar archive.
    Export {
        #[clap(short, long)]
        job_id: String,
        #[clap(short, long, value_parser)]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct AddArgs {
    /// Target command line; the input file is marked with the configured marker.
    #[clap(long, conflicts_with = "job_id", required_unless_present = "job_id")]
    job: Option<String>,
    #[clap(long)]
    job_id: Option<String>,
    /// Seed file or directory.
    #[clap(short, long, value_parser)]
    sample: Option<PathBuf>,
    /// Tar archive of fuzzer sessions.
    #[clap(short, long, value_parser)]
    import: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> Result<DroverConfig, anyhow::Error> {
    let mut config = match &cli.config {
        Some(config_path) => {
            log::info!("loading configuration from {config_path:?}");
            DroverConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("drover.toml");
            if default_config_path.exists() {
                log::info!("loading default configuration {default_config_path:?}");
                DroverConfig::load_from_file(&default_config_path)?
            } else {
                log::debug!("no drover.toml found, using built-in defaults");
                DroverConfig::default()
            }
        }
    };
    if let Some(workspace) = &cli.workspace {
        config.workspace.directory = workspace.clone();
    }
    Ok(config)
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let log_env = Env::new()
        .filter_or("DROVER_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    let config = load_config(&cli)?;
    let build_command = config.build.command.clone();
    let decisions: Box<dyn DecisionProvider> = if cli.yes {
        Box::new(ScriptedDecisions::always(true))
    } else {
        Box::new(InteractivePrompt)
    };
    let mut campaign = Campaign::new(config, Box::new(SystemRunner::new()), decisions);

    match cli.command {
        Command::Create {
            harden,
            asan,
            coverage,
        } => {
            let variants: Vec<Variant> = [
                (harden, Variant::Harden),
                (asan, Variant::Asan),
                (coverage, Variant::Coverage),
            ]
            .into_iter()
            .filter_map(|(wanted, variant)| wanted.then_some(variant))
            .collect();
            let mut builder = CommandBuilder::new(build_command, SystemRunner::new());
            campaign.create_workspace(&variants, &mut builder)?;
            println!(
                "Workspace created at {}",
                campaign.layout().root().display()
            );
        }
        Command::Add(args) => {
            let source = match (args.job, args.job_id) {
                (Some(command), _) => JobSource::Command(command),
                (None, Some(id)) => JobSource::Existing(JobId::new(id)),
                (None, None) => anyhow::bail!("either --job or --job-id is required"),
            };
            let report = campaign.add_job(&AddJobRequest {
                source,
                sample: args.sample,
                import: args.import,
            })?;
            println!("Job [{}]", report.id);
            match report.seeded {
                Some(SeedOutcome::Copied(n)) => println!("  {n} initial samples added"),
                Some(SeedOutcome::Invalid) => {
                    println!("  Sample is neither a file nor a directory, nothing seeded")
                }
                None => {}
            }
            if let Some(imported) = report.imported {
                println!("  Imported sessions: {}", imported.sessions.join(", "));
            }
        }
        Command::Remove { job_id } => {
            match campaign.remove_job(&JobId::new(job_id.as_str()))? {
                Some(archived) => println!("Job [{job_id}] archived to {}", archived.display()),
                None => println!("Job [{job_id}] removed"),
            }
        }
        Command::Start {
            job_id,
            minimize,
            coverage,
        } => {
            let report = campaign.start(&JobId::new(job_id.as_str()), StartOptions {
                minimize,
                coverage,
            })?;
            println!("Job [{job_id}]: {}", report.verb);
            for group in &report.groups {
                println!(
                    "  {} {:?} worker(s): {}",
                    group.variant, group.role, group.cores
                );
            }
            for line in &report.workers {
                println!("  {line}");
            }
            if let Some(pid) = report.coverage_pid {
                println!("  Coverage tracking running as pid {pid}");
            }
        }
        Command::Stop => {
            campaign.stop()?;
            println!("All fuzzers stopped");
        }
        Command::Show { jobs, cov, json } => {
            let kind = if jobs {
                ShowKind::Jobs
            } else if cov {
                ShowKind::Coverage
            } else {
                ShowKind::Status
            };
            let report = campaign.show(kind)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_show(&report);
            }
        }
        Command::Triage { job_id } => {
            let id = job_id.map(JobId::new);
            for outcome in campaign.triage(id.as_ref())? {
                match outcome {
                    TriageOutcome::Skipped { id } => {
                        println!("Job [{id}]: kept previous triage results")
                    }
                    TriageOutcome::Triaged {
                        id,
                        unique_crashes,
                        previous,
                    } => {
                        println!("Job [{id}]: {unique_crashes} unique crashes");
                        if let Some(previous) = previous {
                            println!("  Previous results in {}", previous.display());
                        }
                    }
                }
            }
        }
        Command::Destroy => match campaign.destroy()? {
            DestroyOutcome::Destroyed => println!("Workspace destroyed"),
            DestroyOutcome::AlreadyGone => println!("Workspace destroyed already"),
            DestroyOutcome::Declined => anyhow::bail!("destroy cancelled"),
        },
        Command::Export { job_id, output } => {
            let path = campaign.export(&JobId::new(job_id.as_str()), &output)?;
            println!("Job [{job_id}] exported to {}", path.display());
        }
    }

    Ok(())
}

fn print_show(report: &ShowReport) {
    match report {
        ShowReport::Jobs(jobs) => {
            println!("Configured jobs found:");
            for (num, job) in jobs.iter().enumerate() {
                println!(
                    "  {num}) [{}] {} {} ({:?})",
                    job.id, job.target, job.params, job.state
                );
            }
        }
        ShowReport::Status(statuses) => {
            println!("Status of jobs:");
            for status in statuses {
                println!("  Job [{}] for target '{}':", status.id, status.target);
                for line in status.summary.lines() {
                    println!("  {line}");
                }
                println!("       Triaged crashes : {} available", status.unique_crashes);
            }
        }
        ShowReport::Coverage(reports) => {
            if reports.is_empty() {
                println!("No coverage reports yet");
            }
            for report in reports {
                println!("  Job [{}]: {}", report.id, report.path.display());
            }
        }
    }
}
