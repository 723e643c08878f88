//! `migrate` command line.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::UpgradeConfig;
use crate::db::models::{FleetMember, HistoryEntry, LockRecord, MemberStatus, VersionMarker};
use crate::db::repos::{fleet as fleet_repo, history as history_repo, marker as marker_repo};
use crate::db::{self, DbPool};
use crate::engine::cleanup::{self, CleanupScheduler, SweepOutcome};
use crate::engine::executor::{ExecutorOptions, RunOutcome, UpgradeExecutor};
use crate::engine::fleet::{self, FleetMembership};
use crate::engine::lock::{LeaseOptions, MigrationLock};
use crate::engine::registry::Registry;
use crate::engine::startup::{self, WaitPolicy};
use crate::engine::version::SchemaVersion;
use crate::engine::{manifest, resolver};
use crate::error::AppError;
use crate::logging;

#[derive(Parser, Debug)]
#[command(name = "migrate", version, about = "Resolve and apply schema upgrades across a service fleet")]
pub struct Cli {
    /// Schema version the running software requires. Defaults to the
    /// newest version the manifest can produce.
    #[arg(long)]
    target: Option<SchemaVersion>,

    /// Startup mode: wait out a peer's migration and retry while old
    /// members drain, up to the configured deadline.
    #[arg(long)]
    wait: bool,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(clap::Args, Debug)]
struct GlobalArgs {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Migration unit manifest.
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,

    #[arg(long, global = true)]
    instance_id: Option<String>,

    /// Machine-readable JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply cleanups whose fleet has converged.
    Sweep {
        /// Keep sweeping on the configured interval until Ctrl-C.
        #[arg(long)]
        watch: bool,
    },
    /// Show marker, pending cleanups, lock, fleet and recent history.
    Status {
        #[arg(long, default_value_t = 10)]
        history: u32,
    },
    /// Print the unit chain that would bring the schema to the target.
    Plan {
        #[arg(long)]
        target: Option<SchemaVersion>,
    },
    /// Heartbeat this instance into the fleet membership table.
    Report {
        #[arg(long)]
        version: SchemaVersion,
        #[arg(long)]
        status: MemberStatus,
    },
}

/// Everything a command may need, built once.
struct Context {
    config: UpgradeConfig,
    instance_id: String,
    pool: DbPool,
    json: bool,
}

impl Context {
    fn registry(&self) -> Result<Arc<Registry>, AppError> {
        let registry = manifest::load(&self.config.manifest)?;
        tracing::debug!(manifest = %self.config.manifest.display(), units = registry.len(), "Manifest loaded");
        Ok(Arc::new(registry))
    }

    fn lock(&self) -> MigrationLock {
        MigrationLock::new(
            self.pool.clone(),
            self.config.lock.name.clone(),
            LeaseOptions::from(&self.config.lock),
        )
    }

    fn fleet(&self) -> Arc<dyn FleetMembership> {
        fleet::from_config(&self.config.fleet, &self.pool)
    }

    fn target(&self, registry: &Registry, requested: Option<SchemaVersion>) -> Result<SchemaVersion, AppError> {
        match requested.or_else(|| registry.latest_version().cloned()) {
            Some(target) => Ok(target),
            None => Err(AppError::Config("no --target given and the manifest declares no units".into())),
        }
    }

    fn print<T: Serialize>(&self, value: &T, human: impl FnOnce() -> String) -> Result<(), AppError> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", human());
        }
        Ok(())
    }
}

/// Run a parsed command line and return the process exit code.
pub fn run(cli: Cli) -> i32 {
    let mut config = match UpgradeConfig::load(cli.global.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("migrate: {e}");
            return e.exit_code();
        }
    };
    if let Err(e) = apply_overrides(&mut config, &cli.global) {
        eprintln!("migrate: {e}");
        return e.exit_code();
    }

    let _log_guard = logging::init(cli.global.json_logs, config.log_dir.as_deref());
    if let Some(data_dir) = config.database.parent().filter(|p| !p.as_os_str().is_empty()) {
        logging::install_crash_hook(data_dir);
    }

    let instance_id = config.resolved_instance_id();
    tracing::info!(
        instance_id = %instance_id,
        version = env!("CARGO_PKG_VERSION"),
        "Starting migrate"
    );

    let result = db::init_db(&config.database, &config.baseline_version, &instance_id).and_then(|pool| {
        let ctx = Context {
            config,
            instance_id,
            pool,
            json: cli.global.json,
        };
        dispatch(&ctx, cli.command, cli.target, cli.wait)
    });

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(kind = e.kind(), "migrate failed: {}", e);
            e.exit_code()
        }
    }
}

fn apply_overrides(config: &mut UpgradeConfig, args: &GlobalArgs) -> Result<(), AppError> {
    if let Some(db) = &args.database {
        config.database = db.clone();
    }
    if let Some(manifest) = &args.manifest {
        config.manifest = manifest.clone();
    }
    if let Some(id) = &args.instance_id {
        config.instance_id = Some(id.clone());
    }
    config.validate()
}

fn dispatch(
    ctx: &Context,
    command: Option<Command>,
    target: Option<SchemaVersion>,
    wait: bool,
) -> Result<i32, AppError> {
    match command {
        None => upgrade(ctx, target, wait),
        Some(Command::Sweep { watch }) => sweep(ctx, watch),
        Some(Command::Status { history }) => status(ctx, history),
        Some(Command::Plan { target }) => plan(ctx, target),
        Some(Command::Report { version, status }) => report(ctx, &version, status),
    }
}

// ============================================================================
// Commands
// ============================================================================

fn upgrade(ctx: &Context, target: Option<SchemaVersion>, wait: bool) -> Result<i32, AppError> {
    let registry = ctx.registry()?;
    let target = ctx.target(&registry, target)?;
    let executor = UpgradeExecutor::new(ctx.pool.clone(), registry, ctx.lock(), ctx.fleet(), &ctx.instance_id)
        .with_options(ExecutorOptions::from(&ctx.config.fleet));

    if wait {
        let report = startup::ensure_schema_current(&executor, &target, &WaitPolicy::from(&ctx.config.startup));
        ctx.print(&report, || match (&report.error, &report.version) {
            (None, Some(version)) => format!("{:?}: schema at {version}", report.status),
            (None, None) => format!("{:?}", report.status),
            (Some(e), _) => format!("{:?}: {e}", report.status),
        })?;
        return Ok(report.exit_code());
    }

    let outcome = executor.run(&target);
    ctx.print(&outcome, || match &outcome {
        RunOutcome::Applied { from, to, units_applied } => {
            format!("Applied {} unit(s): {from} -> {to} [{}]", units_applied.len(), units_applied.join(", "))
        }
        RunOutcome::NoOpAlreadyCurrent { version } => format!("Already current at {version}"),
        RunOutcome::Failed { at_unit: Some(unit), cause } => format!("Failed at unit {unit}: {cause}"),
        RunOutcome::Failed { at_unit: None, cause } => format!("Failed: {cause}"),
    })?;
    Ok(outcome.exit_code())
}

fn scheduler(ctx: &Context) -> Result<CleanupScheduler, AppError> {
    Ok(CleanupScheduler::new(
        ctx.pool.clone(),
        ctx.registry()?,
        ctx.lock(),
        ctx.fleet(),
        &ctx.instance_id,
    )
    .with_fleet_settings(&ctx.config.fleet))
}

fn sweep(ctx: &Context, watch: bool) -> Result<i32, AppError> {
    let scheduler = scheduler(ctx)?;

    if !watch {
        let outcome = scheduler.sweep();
        ctx.print(&outcome, || describe_sweep(&outcome))?;
        return Ok(outcome.first_failure().map_or(0, |e| e.exit_code()));
    }

    let scheduler = Arc::new(scheduler);
    let interval = Duration::from_secs(ctx.config.cleanup.interval_secs);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let cancel = CancellationToken::new();
        let handle = cleanup::start_cleanup_loop(scheduler.clone(), interval, cancel.clone());
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Interrupt received, stopping cleanup loop"),
            Err(e) => tracing::warn!("Cannot listen for Ctrl-C, stopping: {}", e),
        }
        cancel.cancel();
        if let Err(e) = handle.await {
            tracing::error!("Cleanup loop task failed: {}", e);
        }
    });

    let stats = scheduler.stats();
    ctx.print(&stats, || {
        format!(
            "{} sweep(s), {} unit(s) cleaned, {} sweep(s) with failures",
            stats.sweeps, stats.units_cleaned, stats.failures
        )
    })?;
    Ok(0)
}

fn describe_sweep(outcome: &SweepOutcome) -> String {
    match outcome {
        SweepOutcome::Cleaned(ids) if ids.is_empty() => "Nothing to clean".into(),
        SweepOutcome::Cleaned(ids) => format!("Cleaned: {}", ids.join(", ")),
        SweepOutcome::Deferred { cleaned, reasons } => {
            let mut out = format!("Cleaned: {}", if cleaned.is_empty() { "-".into() } else { cleaned.join(", ") });
            for reason in reasons {
                out.push_str(&format!("\nDeferred: {reason:?}"));
            }
            out
        }
    }
}

#[derive(Serialize)]
struct StatusReport {
    instance_id: String,
    marker: VersionMarker,
    latest_known_version: Option<SchemaVersion>,
    lock: Option<LockRecord>,
    fleet: Vec<FleetMember>,
    history: Vec<HistoryEntry>,
}

fn status(ctx: &Context, history_limit: u32) -> Result<i32, AppError> {
    // A broken manifest should not hide the database state.
    let latest_known_version = match ctx.registry() {
        Ok(registry) => registry.latest_version().cloned(),
        Err(e) => {
            tracing::warn!("Manifest unavailable: {}", e);
            None
        }
    };

    let report = StatusReport {
        instance_id: ctx.instance_id.clone(),
        marker: marker_repo::get(&ctx.pool)?,
        latest_known_version,
        lock: ctx.lock().current()?,
        fleet: ctx.fleet().list_members()?,
        history: history_repo::get_recent(&ctx.pool, history_limit)?,
    };

    ctx.print(&report, || {
        let mut out = format!(
            "Schema version: {} (updated {} by {})\n",
            report.marker.current_version,
            report.marker.updated_at,
            report.marker.updated_by.as_deref().unwrap_or("-")
        );
        if let Some(latest) = &report.latest_known_version {
            out.push_str(&format!("Latest known:   {latest}\n"));
        }
        out.push_str(&format!("Checkpoints:    {}\n", report.marker.applied_unit_checkpoints.len()));
        for pending in &report.marker.cleanup_pending {
            out.push_str(&format!(
                "Cleanup pending: {} (>= {}, {} failed attempt(s))\n",
                pending.unit_id, pending.produced_version, pending.attempts
            ));
        }
        match &report.lock {
            Some(lock) => out.push_str(&format!("Lock: held by {} until {}\n", lock.holder_id, lock.lease_expires_at)),
            None => out.push_str("Lock: free\n"),
        }
        for member in &report.fleet {
            out.push_str(&format!(
                "Member: {} {} {}\n",
                member.instance_id, member.reported_version, member.status
            ));
        }
        for entry in &report.history {
            out.push_str(&format!(
                "History #{}: {} {} {} {}\n",
                entry.seq,
                entry.created_at,
                entry.unit_id,
                entry.phase.as_str(),
                entry.outcome.as_str()
            ));
        }
        out.trim_end().to_string()
    })?;
    Ok(0)
}

fn plan(ctx: &Context, target: Option<SchemaVersion>) -> Result<i32, AppError> {
    let registry = ctx.registry()?;
    let target = ctx.target(&registry, target)?;
    let current = marker_repo::get(&ctx.pool)?.current_version;

    let chain = resolver::resolve(&registry, &current, &target)?;
    let steps: Vec<PlanStep> = chain
        .iter()
        .map(|u| PlanStep {
            unit_id: u.id.clone(),
            from: u.range_from.clone(),
            to: u.produced_version.clone(),
            rolling: u.supports_rolling_upgrade,
            has_cleanup: u.has_cleanup(),
        })
        .collect();

    ctx.print(&steps, || {
        if steps.is_empty() {
            return format!("Already current at {current}");
        }
        steps
            .iter()
            .map(|s| {
                format!(
                    "{} -> {}  {}{}{}",
                    s.from,
                    s.to,
                    s.unit_id,
                    if s.rolling { "" } else { "  [not rolling-safe]" },
                    if s.has_cleanup { "  [deferred cleanup]" } else { "" }
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    })?;
    Ok(0)
}

#[derive(Serialize)]
struct PlanStep {
    unit_id: String,
    from: SchemaVersion,
    to: SchemaVersion,
    rolling: bool,
    has_cleanup: bool,
}

fn report(ctx: &Context, version: &SchemaVersion, status: MemberStatus) -> Result<i32, AppError> {
    fleet_repo::report(&ctx.pool, &ctx.instance_id, version, status)?;
    tracing::info!(instance_id = %ctx.instance_id, version = %version, status = %status, "Heartbeat recorded");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upgrade_invocation() {
        let cli = Cli::try_parse_from(["migrate", "--target=2.0", "--wait", "--database", "/tmp/x.db"]).unwrap();
        assert_eq!(cli.target, Some(SchemaVersion::parse("2.0").unwrap()));
        assert!(cli.wait);
        assert!(cli.command.is_none());
        assert_eq!(cli.global.database, Some(PathBuf::from("/tmp/x.db")));
    }

    #[test]
    fn test_parse_subcommands_with_global_flags() {
        let cli = Cli::try_parse_from(["migrate", "status", "--json", "--instance-id", "cp-1"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Status { history: 10 })));
        assert!(cli.global.json);
        assert_eq!(cli.global.instance_id.as_deref(), Some("cp-1"));

        let cli = Cli::try_parse_from(["migrate", "report", "--version", "1.1", "--status", "serving"]).unwrap();
        match cli.command {
            Some(Command::Report { version, status }) => {
                assert_eq!(version.to_string(), "1.1");
                assert_eq!(status, MemberStatus::Serving);
            }
            other => panic!("expected report, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_bad_version_and_status() {
        assert!(Cli::try_parse_from(["migrate", "--target=two"]).is_err());
        assert!(Cli::try_parse_from(["migrate", "report", "--version", "1.0", "--status", "asleep"]).is_err());
    }

    #[test]
    fn test_end_to_end_through_commands() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("units.toml");
        std::fs::write(
            &manifest,
            r#"
[[unit]]
id = "users"
range_from = "none"
produced_version = "1.0"
prepare = [{ sql = "CREATE TABLE users (id INTEGER PRIMARY KEY, legacy TEXT)" }]
cleanup = [{ sql = "ALTER TABLE users DROP COLUMN legacy" }]
"#,
        )
        .unwrap();

        let mut config = UpgradeConfig::default();
        config.database = dir.path().join("cp.db");
        config.manifest = manifest;
        config.instance_id = Some("cp-1".into());
        let pool = db::init_db(&config.database, &config.baseline_version, "cp-1").unwrap();
        let ctx = Context {
            config,
            instance_id: "cp-1".into(),
            pool,
            json: true,
        };

        assert_eq!(dispatch(&ctx, Some(Command::Plan { target: None }), None, false).unwrap(), 0);
        assert_eq!(dispatch(&ctx, None, None, false).unwrap(), 0);
        assert_eq!(marker_repo::get(&ctx.pool).unwrap().pending_ids(), vec!["users"]);

        let version = SchemaVersion::parse("1.0").unwrap();
        let report_cmd = Command::Report { version, status: MemberStatus::Serving };
        assert_eq!(dispatch(&ctx, Some(report_cmd), None, false).unwrap(), 0);
        assert_eq!(dispatch(&ctx, Some(Command::Sweep { watch: false }), None, false).unwrap(), 0);
        assert!(marker_repo::get(&ctx.pool).unwrap().pending_ids().is_empty());
        assert_eq!(dispatch(&ctx, Some(Command::Status { history: 5 }), None, false).unwrap(), 0);

        let downgrade = dispatch(&ctx, None, Some(SchemaVersion::baseline()), false);
        assert_eq!(downgrade.unwrap(), 12);
    }
}
