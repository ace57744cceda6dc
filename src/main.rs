//! Provision - main entry point
//!
//! Parses the command line, wires signals to the run's cancel token, and
//! prints a run summary. The exit code is derived from the error kind.

use std::process::ExitCode;

use serde::Serialize;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use provision::cli::{Cli, OutputFormat};
use provision::error::EXIT_USAGE;
use provision::process_guard::{self, CancelToken};
use provision::provisioner::{ProvisionFailure, ProvisionPlan, ProvisionReport, Provisioner};
use provision::reconstruct::ReconstructReport;

/// Log to stderr; `RUST_LOG` overrides the level.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);

    let cancel = CancelToken::new();
    if let Err(e) = process_guard::init_signal_handlers(&cancel) {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    let format = cli.format;
    let dry_run = cli.dry_run;
    let settings = match cli.into_settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("✗ Invalid settings: {:#}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };
    debug!(?settings, "Settings resolved");

    let mut provisioner = Provisioner::new(settings).with_cancel_token(cancel);

    if dry_run {
        return match provisioner.plan() {
            Ok(plan) => {
                match format {
                    OutputFormat::Text => print_plan(&plan),
                    OutputFormat::Json => print_json(&plan),
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("✗ {}", e);
                ExitCode::from(e.exit_code())
            }
        };
    }

    match provisioner.run() {
        Ok(report) => {
            match format {
                OutputFormat::Text => print_report(&report),
                OutputFormat::Json => print_json(&report),
            }
            ExitCode::SUCCESS
        }
        Err(failure) => {
            match format {
                OutputFormat::Text => print_failure(&failure),
                OutputFormat::Json => print_json(&failure_json(&failure)),
            }
            ExitCode::from(failure.error.exit_code())
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("✗ Failed to serialize output: {}", e),
    }
}

fn print_plan(plan: &ProvisionPlan) {
    println!("Platform:    {}", plan.platform);
    println!("Interpreter: {}", plan.interpreter);
    if !plan.tokens.is_empty() {
        let tokens: Vec<String> = plan.tokens.iter().map(ToString::to_string).collect();
        println!("Tokens:      {}", tokens.join(", "));
    }
    println!();
    print!("{}", plan.directories.render_preview(&plan.root.display().to_string()));
    for diagnostic in plan.directories.diagnostics() {
        println!("! {}", diagnostic);
    }
    println!();
    println!("--- Script ---");
    println!("{}", plan.script);
}

fn print_tree(tree: &ReconstructReport) {
    println!(
        "  {} created, {} already present under {}",
        tree.created,
        tree.already_present,
        tree.root.display()
    );
    for failure in &tree.failures {
        println!("  ✗ {}", failure);
    }
    for diagnostic in &tree.diagnostics {
        println!("  ! {}", diagnostic);
    }
    if let Some(symlink) = tree.symlink {
        println!("  symlink: {:?}", symlink);
    }
}

fn print_report(report: &ProvisionReport) {
    println!(
        "✓ Provisioned {} for {}",
        report.container.display(),
        report.platform
    );
    print_tree(&report.tree);
    println!("  script finished in {} ms", report.output.elapsed_ms);

    if !report.output.stdout.is_empty() {
        println!("--- Output ---");
        print!("{}", report.output.stdout);
    }
    if !report.output.stderr.is_empty() {
        eprintln!("--- Errors ---");
        eprint!("{}", report.output.stderr);
    }
}

fn print_failure(failure: &ProvisionFailure) {
    eprintln!("✗ Provisioning failed at {}: {}", failure.failed_at, failure.error);
    if let Some(tree) = &failure.tree {
        print_tree(tree);
    }
    if let Some((stdout, stderr)) = failure.error.captured_output() {
        if !stdout.is_empty() {
            println!("--- Output ---");
            print!("{}", stdout);
        }
        if !stderr.is_empty() {
            eprintln!("--- Errors ---");
            eprint!("{}", stderr);
        }
    }
}

fn failure_json(failure: &ProvisionFailure) -> serde_json::Value {
    let (stdout, stderr) = failure.error.captured_output().unwrap_or_default();
    serde_json::json!({
        "status": "failed",
        "kind": failure.error.kind(),
        "message": failure.error.to_string(),
        "exit_code": failure.error.exit_code(),
        "failed_at": failure.failed_at,
        "tree": failure.tree,
        "stdout": stdout,
        "stderr": stderr,
    })
}
