use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use amr_api::{ApiFixture, BackOfficeApi, InMemoryBackOffice, RestBackOffice};
use amr_core::{CompanyStatus, Role, StatusFilter, TaxMonth};
use amr_pipeline::{
    write_run_report, BulkSaveExecutor, PipelineConfig, ReconcileSession, SaveOptions,
    SaveOutcome,
};

#[derive(Debug, Parser)]
#[command(name = "amr")]
#[command(about = "Monthly work-assignment reconciliation for the back office")]
struct Cli {
    /// YAML config file; defaults come from the environment otherwise.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// JSON fixture served by an in-memory backend instead of REST.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build and print the carry-forward preview for a target month.
    Preview(MonthArgs),
    /// Run the full reconcile-and-save pipeline for a target month.
    Reconcile(ReconcileArgs),
    /// List selectable employees, optionally filtered by role.
    Employees {
        #[arg(long)]
        role: Option<Role>,
    },
    /// Render the most recent bulk-save run reports.
    Report {
        #[arg(long, default_value_t = 3)]
        runs: usize,
    },
}

#[derive(Debug, Args)]
struct MonthArgs {
    /// Target tax month, YYYY-MM.
    #[arg(long)]
    month: TaxMonth,
    /// Reference month for carry-forward defaults; the month before
    /// the target when omitted.
    #[arg(long)]
    reference: Option<TaxMonth>,
    /// Company statuses to load (repeatable); the configured default
    /// set when omitted.
    #[arg(long = "status")]
    statuses: Vec<CompanyStatus>,
}

#[derive(Debug, Args)]
struct ReconcileArgs {
    #[command(flatten)]
    month: MonthArgs,
    /// Commit the complete rows even when some rows are incomplete.
    #[arg(long)]
    skip_incomplete: bool,
    /// Skip past rows that already have a target-month assignment.
    #[arg(long)]
    skip_duplicates: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_yaml(path)?,
        None => PipelineConfig::from_env(),
    };
    let api = build_api(&cli, &config)?;

    match &cli.command {
        Commands::Preview(args) => preview(api, &config, args).await,
        Commands::Reconcile(args) => reconcile(api, &config, args).await,
        Commands::Employees { role } => {
            let employees = api.list_employees_by_role(*role).await?;
            for employee in employees {
                println!("{}\t{}", employee.id, employee.display_name);
            }
            Ok(())
        }
        Commands::Report { runs } => {
            let rendered = amr_pipeline::report_recent_markdown(&config.reports_dir, *runs)?;
            println!("{rendered}");
            Ok(())
        }
    }
}

fn build_api(cli: &Cli, config: &PipelineConfig) -> Result<Arc<dyn BackOfficeApi>> {
    match &cli.fixture {
        Some(path) => {
            let fixture = ApiFixture::load(path)?;
            Ok(Arc::new(InMemoryBackOffice::from_fixture(fixture)))
        }
        None => Ok(Arc::new(RestBackOffice::new(config.rest_config())?)),
    }
}

fn status_filter(args: &MonthArgs, config: &PipelineConfig) -> StatusFilter {
    if args.statuses.is_empty() {
        config.status_filter()
    } else {
        StatusFilter::any(args.statuses.iter().copied())
    }
}

async fn load_session(
    api: Arc<dyn BackOfficeApi>,
    config: &PipelineConfig,
    args: &MonthArgs,
) -> Result<ReconcileSession> {
    let mut session = ReconcileSession::new(api, status_filter(args, config), args.month);
    if let Some(reference) = args.reference {
        session = session.with_reference_month(reference);
    }
    session.load().await?;
    Ok(session)
}

async fn preview(
    api: Arc<dyn BackOfficeApi>,
    config: &PipelineConfig,
    args: &MonthArgs,
) -> Result<()> {
    let session = load_session(api, config, args).await?;
    println!(
        "preview for {} (reference {}): {} clients",
        session.target_month(),
        session.reference_month(),
        session.rows().len()
    );
    for row in session.rows() {
        let missing = row
            .missing_roles()
            .iter()
            .map(|role| role.as_str())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{}\t{}\tassigned={}\tmissing=[{}]",
            row.build, row.company_name, row.is_assigned, missing
        );
    }
    Ok(())
}

async fn reconcile(
    api: Arc<dyn BackOfficeApi>,
    config: &PipelineConfig,
    args: &ReconcileArgs,
) -> Result<()> {
    let mut session = load_session(api.clone(), config, &args.month).await?;
    let executor = BulkSaveExecutor::from_config(api, config);
    let options = SaveOptions {
        skip_incomplete: args.skip_incomplete,
        skip_duplicates: args.skip_duplicates,
        abort: None,
    };

    match session.save(&executor, &options).await? {
        SaveOutcome::BlockedIncomplete(rows) => {
            for row in &rows {
                let missing = row
                    .missing
                    .iter()
                    .map(|role| role.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                eprintln!("incomplete: {} missing [{}]", row.build, missing);
            }
            bail!(
                "{} incomplete rows; fill the missing roles or rerun with --skip-incomplete",
                rows.len()
            );
        }
        SaveOutcome::BlockedDuplicates(builds) => {
            for build in &builds {
                eprintln!("already assigned for the target month: {build}");
            }
            bail!(
                "{} duplicate rows; rerun with --skip-duplicates to save the rest",
                builds.len()
            );
        }
        SaveOutcome::Completed(summary) => {
            let run_dir = write_run_report(&config.reports_dir, &summary).await?;
            println!(
                "reconcile complete: run_id={} succeeded={} failed={} skipped={} report={}",
                summary.run_id,
                summary.succeeded.len(),
                summary.failed.len(),
                summary.skipped_incomplete.len()
                    + summary.skipped_duplicate.len()
                    + summary.skipped_aborted.len(),
                run_dir.display()
            );
            for failure in &summary.failed {
                eprintln!("failed: {} ({})", failure.build, failure.error);
            }
            if !session.is_empty() {
                println!(
                    "{} rows retained for correction and retry",
                    session.rows().len()
                );
            }
            Ok(())
        }
    }
}
