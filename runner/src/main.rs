use clap::{ArgAction, Parser, Subcommand};
use phosim_runner::{
    collector::{Collector, CollectorConfig},
    config::PipelineConfig,
    coordinator::{ChipOutcome, Coordinator, EmitOutcome},
    executors::Executors,
    identity::{ChipExposure, Filter, ObservationId, VisitId, WorkUnit},
    tracker::Trackers,
    verify::{
        checker::{ExecChecker, FormatChecker},
        verify_focal_plane, FailureDetail, VerificationStatus,
    },
};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Pipeline configuration
    #[arg(short, long, default_value = "phosim.yaml", global = true)]
    config: PathBuf,

    /// More output, repeat for trace level logs (RUST_LOG takes precedence)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write stage 1 scripts for instance catalogs and the stage 1 manifest
    GenerateVisits {
        /// Instance catalogs
        catalogs: Vec<PathBuf>,
        /// File listing instance catalogs, one per line
        #[arg(long)]
        list: Option<PathBuf>,
        /// Directories searched for instance catalogs
        #[arg(long)]
        search: Vec<PathBuf>,
        /// File name glob used with --search
        #[arg(long, default_value = "*")]
        glob: String,
        /// Extra command file whose extraid is appended to every observation id
        #[arg(long)]
        extra: Option<PathBuf>,
    },
    /// Write stage 2 scripts and manifests for visits with a stage 1 sentinel
    GenerateChips {
        /// Visits, e.g. 9999999-fr. Every visit in the save tier if empty
        visits: Vec<VisitId>,
        /// Restrict to these sensor exposures, e.g. R01_S12_E000,R22_S11_E001
        #[arg(long, value_delimiter = ',')]
        only: Vec<ChipExposure>,
    },
    /// Verify the outputs of a work unit and write its sentinel
    Verify {
        /// Work unit, e.g. 9999999-fr or 9999999-fr-R01_S12_E000
        unit: WorkUnit,
        /// Where the outputs were staged out to
        #[arg(long)]
        location: Option<PathBuf>,
    },
    /// Record a verified work unit and emit stage 2 for a finished visit
    Emit {
        /// Work unit, e.g. 9999999-fr or 9999999-fr-R01_S12_E000
        unit: WorkUnit,
    },
    /// Check the images of every sensor and exposure of a visit
    VerifyFocalplane {
        observation: ObservationId,
        /// Filter letter or number
        filter: Filter,
        /// Root of the eimage and raw trees
        output_root: PathBuf,
        #[arg(long, default_value_t = 2)]
        exposures: u16,
        /// Also run the FITS checker on every present file
        #[arg(long)]
        check_format: bool,
        #[arg(long, default_value = "fitsverify")]
        checker: PathBuf,
    },
    /// Run every line of a manifest on a local worker pool
    Run {
        manifest: PathBuf,
        /// Worker threads, defaults to the number of CPUs
        #[arg(long)]
        threads: Option<usize>,
        /// Pause before each launch in milliseconds
        #[arg(long, default_value_t = 0)]
        pause_ms: u64,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Path) -> Option<PipelineConfig> {
    match PipelineConfig::load(path) {
        Ok(mut config) => match config.preflight_checks() {
            Ok(()) => Some(config),
            Err(e) => {
                error!("Configuration {} is invalid: {e}", path.to_string_lossy());
                None
            }
        },
        Err(e) => {
            error!(error = ?e, "Failed to load configuration: {e}");
            None
        }
    }
}

fn collect_catalogs(
    catalogs: Vec<PathBuf>,
    list: Option<PathBuf>,
    search: Vec<PathBuf>,
    glob: String,
) -> Option<Collector> {
    let mut collector = Collector::Grouped {
        collectors: Vec::new(),
    };

    if !catalogs.is_empty() {
        collector = collector.join(Collector::List { paths: catalogs });
    }

    let mut configs = Vec::new();
    if let Some(list) = list {
        configs.push(CollectorConfig::List(list));
    }
    if !search.is_empty() {
        configs.push(CollectorConfig::Glob {
            paths: search,
            glob,
        });
    }

    for config in configs {
        match Collector::load(&config) {
            Ok(loaded) => collector = collector.join(loaded),
            Err(e) => {
                error!(collector = ?config, "Failed to collect instance catalogs: {e}");
                return None;
            }
        }
    }

    Some(collector)
}

fn run(cli: Cli) -> ExitCode {
    // commands that work without a pipeline configuration
    match cli.command {
        Commands::VerifyFocalplane {
            observation,
            filter,
            output_root,
            exposures,
            check_format,
            checker,
        } => {
            let visit = VisitId::new(observation, filter);
            let checker = ExecChecker::new(checker);
            let checker: Option<&(dyn FormatChecker + Sync)> = match check_format {
                true => Some(&checker),
                false => None,
            };
            let report = verify_focal_plane(&visit, &output_root, exposures, checker);

            for file in report.missing.iter() {
                eprintln!("missing: {file}");
            }
            for (file, output) in report.corrupt.iter() {
                eprintln!("corrupt: {file}\n{output}");
            }
            info!(
                visit = %visit,
                checked = report.checked,
                missing = report.missing.len(),
                corrupt = report.corrupt.len(),
                "Checked focal plane"
            );

            return ExitCode::from(report.exit_code());
        }
        Commands::Run {
            manifest,
            threads,
            pause_ms,
        } => {
            let summary = Executors::load("local", threads, Duration::from_millis(pause_ms))
                .and_then(|executor| executor.execute_manifest(&manifest));

            return match summary {
                Ok(summary) => {
                    for (line, failure) in summary.failed.iter() {
                        warn!(line = %line, "{failure}");
                    }
                    info!(
                        total = summary.total,
                        succeeded = summary.succeeded(),
                        "Manifest done"
                    );

                    if summary.failed.is_empty() {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    }
                }
                Err(e) => {
                    error!(error = ?e, "Failed to run manifest: {e}");
                    ExitCode::FAILURE
                }
            };
        }
        _ => {}
    }

    let Some(config) = load_config(&cli.config) else {
        return ExitCode::FAILURE;
    };
    let tracker = match Trackers::load(&config) {
        Ok(tracker) => tracker,
        Err(e) => {
            error!(error = ?e, "Failed to open job tracker: {e}");
            return ExitCode::FAILURE;
        }
    };
    let mut coordinator = Coordinator::new(&config, &tracker);

    let code = match cli.command {
        Commands::GenerateVisits {
            catalogs,
            list,
            search,
            glob,
            extra,
        } => match collect_catalogs(catalogs, list, search, glob) {
            None => ExitCode::FAILURE,
            Some(collector) => match coordinator.generate_visits(collector, extra.as_deref()) {
                Ok(report) => {
                    for skipped in report.skipped.iter() {
                        warn!(path = ?skipped.path, "Skipped: {}", skipped.reason);
                    }
                    println!("{}", report.manifest.path().to_string_lossy());

                    if report.manifest.is_empty() {
                        ExitCode::FAILURE
                    } else {
                        ExitCode::SUCCESS
                    }
                }
                Err(e) => {
                    error!(error = ?e, "Stage 1 generation aborted: {e}");
                    ExitCode::FAILURE
                }
            },
        },
        Commands::GenerateChips { visits, only } => {
            let visits = if visits.is_empty() {
                coordinator.discover_visits()
            } else {
                Ok(visits)
            };

            match visits.and_then(|visits| coordinator.generate_all_chips(&visits, &only)) {
                Ok(outcomes) => {
                    let mut failed = false;

                    for (visit, outcome) in outcomes {
                        match outcome {
                            Ok(ChipOutcome::Manifest(manifest)) => {
                                println!("{}", manifest.path().to_string_lossy())
                            }
                            Ok(ChipOutcome::Blocked { placeholder }) => {
                                warn!(visit = %visit, placeholder = ?placeholder, "Blocked by stage 1 verification");
                            }
                            Ok(ChipOutcome::Pending) => info!(visit = %visit, "Pending"),
                            Err(_) => failed = true,
                        }
                    }

                    if failed {
                        ExitCode::FAILURE
                    } else {
                        ExitCode::SUCCESS
                    }
                }
                Err(e) => {
                    error!(error = ?e, "Stage 2 generation aborted: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Verify { unit, location } => {
            let checker = ExecChecker::load(&config);

            match coordinator.verify(&unit, location.as_deref(), &checker) {
                Ok(result) => match (result.status, result.detail) {
                    (VerificationStatus::Verified, _) => ExitCode::SUCCESS,
                    (_, Some(FailureDetail::CorruptFormat(_))) => ExitCode::from(4),
                    _ => ExitCode::from(2),
                },
                Err(e) => {
                    error!(unit = %unit, error = ?e, "Verification could not complete: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Emit { unit } => match coordinator.emit(&unit) {
            Ok(EmitOutcome::Pending) => ExitCode::FAILURE,
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => {
                error!(unit = %unit, error = ?e, "Emit failed: {e}");
                ExitCode::FAILURE
            }
        },
        Commands::VerifyFocalplane { .. } | Commands::Run { .. } => ExitCode::SUCCESS,
    };

    drop(coordinator);
    if let Err(e) = tracker.close() {
        warn!(error = ?e, "Failed to close job tracker: {e}");
    }

    code
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    run(cli)
}
