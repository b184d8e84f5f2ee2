use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use local_backup_lib::cli::Cli;
use local_backup_lib::config::BackupConfig;
use local_backup_lib::credentials::EnvCredentials;
use local_backup_lib::orchestrator::{BackupOrchestrator, TargetReport};
use local_backup_lib::runner::SystemRunner;
use local_backup_lib::target::TargetRequest;

const USAGE_ERROR: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    if let Err(e) = env_logger.try_init() {
        eprintln!("Initializing the logger failed: {e}");
    }

    let mut config = match BackupConfig::load_or_init(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(USAGE_ERROR);
        }
    };
    if let Some(destination) = &cli.destination {
        config.destination = Some(destination.clone());
    }
    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => {
            log::error!("Can't determine the working directory: {e}");
            return ExitCode::FAILURE;
        }
    };
    let config = config.with_destination(&cwd);

    let mut requests = cli.requests();
    if requests.is_empty() {
        requests = config.targets.clone();
    }
    if requests.is_empty() {
        eprintln!(
            "Nothing to back up: pass a PATH, use --db --user USER, or list [[targets]] in {}",
            cli.config.display()
        );
        return ExitCode::from(USAGE_ERROR);
    }

    let credentials = EnvCredentials::new(config.databases.clone()).with_user(cli.user.clone());
    let orchestrator =
        match BackupOrchestrator::new(&config, Arc::new(SystemRunner::new()), Arc::new(credentials)) {
            Ok(orchestrator) => orchestrator,
            Err(e) => {
                log::error!("Opening the manifest failed: {e}");
                return ExitCode::FAILURE;
            }
        };

    if cli.status {
        return print_status(&orchestrator, &requests);
    }

    let report = orchestrator.run_all(&requests);
    for target in &report.targets {
        println!("{}", status_line(target));
    }

    if report.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn status_line(report: &TargetReport) -> String {
    match (&report.entry, &report.error) {
        (Some(entry), None) if report.outcome.is_success() => format!(
            "{}: {} -> {} (sha256 {}, {} bytes)",
            report.request,
            report.outcome,
            entry.artifact_path.display(),
            entry.checksum,
            entry.size_bytes
        ),
        (_, Some(error)) => format!(
            "{}: {} after {} attempt(s): {error}",
            report.request, report.outcome, report.attempts
        ),
        _ => format!(
            "{}: {} after {} attempt(s)",
            report.request, report.outcome, report.attempts
        ),
    }
}

fn print_status(orchestrator: &BackupOrchestrator, requests: &[TargetRequest]) -> ExitCode {
    let mut code = ExitCode::SUCCESS;
    for request in requests {
        match orchestrator.last_backup(request) {
            Ok(Some(entry)) => println!(
                "{request}: last backup {} at {} (sha256 {})",
                entry.artifact_path.display(),
                entry.timestamp.to_rfc3339(),
                entry.checksum
            ),
            Ok(None) => {
                println!("{request}: never backed up");
                code = ExitCode::FAILURE;
            }
            Err(e) => {
                println!("{request}: {e}");
                code = ExitCode::FAILURE;
            }
        }
    }
    code
}
