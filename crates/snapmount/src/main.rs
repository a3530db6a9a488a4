use clap::builder::FalseyValueParser;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use snapmount_core::{
    format_snapshot_date, to_json, to_json_pretty, AutomountReport, BatchStatus, CleanupReport,
    ErrorReport, MetadataReport, MountReport, PoolActionReport, Settings, SnapshotSelector,
    StatusReport,
};
use snapmount_runtime::{
    cleanup_agent, collect_metadata, collect_status, export_pools, import_pools, mount_agent,
    require_root, run_automount, OperationContext, OutputMode, Result, SystemTools,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::debug;

#[derive(Parser)]
#[command(
    name = "snapmount",
    version,
    about = "Mount ZFS backup snapshot volumes read-only"
)]
struct Cli {
    #[command(flatten)]
    env: EnvArgs,
    #[command(subcommand)]
    command: Commands,
}

/// Settings normally supplied through the environment
#[derive(Args)]
struct EnvArgs {
    /// Exact pool name to use
    #[arg(long, env = "POOL_NAME", global = true)]
    pool_name: Option<String>,
    /// Regex selecting the backup pool
    #[arg(long, env = "POOL_PATTERN", global = true)]
    pool_pattern: Option<String>,
    /// Dataset subpath holding the agents
    #[arg(long, env = "AGENTS_PATH", default_value = "home/agents", global = true)]
    agents_path: String,
    /// Import/export every pool regardless of name
    #[arg(long, env = "EXPORT_ALL", action = ArgAction::SetTrue,
          value_parser = FalseyValueParser::new(), global = true)]
    export_all: bool,
    /// Root of the final mount tree
    #[arg(long, env = "SNAPMOUNT_MOUNT_ROOT", default_value = "/mnt/snapmount", global = true)]
    mount_root: PathBuf,
    /// Root under which snapshot clones are mounted
    #[arg(long, env = "SNAPMOUNT_STAGING_ROOT", default_value = "/var/tmp/snapmount-staging",
          global = true)]
    staging_root: PathBuf,
    /// Delay after unmount/destroy before re-checking, in milliseconds
    #[arg(long, env = "SNAPMOUNT_SETTLE_MS", default_value_t = 1000, global = true)]
    settle_ms: u64,
    /// Choose the mount driver from the volume's filesystem hint
    #[arg(long, env = "SNAPMOUNT_HONOR_FS_HINT", action = ArgAction::SetTrue,
          value_parser = FalseyValueParser::new(), global = true)]
    honor_fs_hint: bool,
    /// Flag file enabling automount
    #[arg(long, env = "SNAPMOUNT_AUTOMOUNT_FLAG",
          default_value = "/var/lib/snapmount/automount.enabled", global = true)]
    automount_flag: PathBuf,
    /// Lock file serializing automount runs
    #[arg(long, env = "SNAPMOUNT_LOCK_FILE", default_value = "/run/snapmount-automount.lock",
          global = true)]
    lock_file: PathBuf,
}

impl EnvArgs {
    fn into_settings(self) -> Settings {
        Settings {
            pool_name: self.pool_name,
            pool_pattern: self.pool_pattern,
            agents_path: self.agents_path,
            export_all: self.export_all,
            mount_root: self.mount_root,
            staging_root: self.staging_root,
            settle_delay: Duration::from_millis(self.settle_ms),
            honor_fs_hint: self.honor_fs_hint,
            automount_flag: self.automount_flag,
            lock_file: self.lock_file,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Mount an agent's snapshots, or sweep existing mounts with --cleanup
    Mount {
        /// Agent hostname, display name or ID
        #[arg(required_unless_present = "cleanup")]
        agent: Option<String>,
        /// `latest`, `all`, or a Unix epoch to match the closest snapshot
        #[arg(default_value = "latest")]
        snapshot: String,
        /// Print a single JSON document
        #[arg(short, long)]
        json: bool,
        /// Release mounts and clones instead of mounting (all agents by default)
        #[arg(long, value_name = "AGENT", num_args = 0..=1, require_equals = true,
              default_missing_value = "all")]
        cleanup: Option<String>,
    },
    /// Import or export backup pools
    Pool {
        #[arg(value_enum)]
        action: PoolAction,
        /// Limit to the pool on this device
        device: Option<String>,
        /// Print a single JSON document
        #[arg(short, long)]
        json: bool,
    },
    /// Report attached drives and pool state
    Status {
        /// Print a single JSON document
        #[arg(short, long)]
        json: bool,
    },
    /// List agents and their snapshots
    Metadata {
        /// Print a single JSON document
        #[arg(short, long)]
        json: bool,
    },
    /// Mount the latest snapshot of every agent if automount is enabled
    Automount {
        /// Print a single JSON document
        #[arg(short, long)]
        json: bool,
    },
}

impl Commands {
    fn output(&self) -> OutputMode {
        let json = match self {
            Commands::Mount { json, .. }
            | Commands::Pool { json, .. }
            | Commands::Status { json }
            | Commands::Metadata { json }
            | Commands::Automount { json } => *json,
        };
        if json {
            OutputMode::Json
        } else {
            OutputMode::Text
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PoolAction {
    Import,
    Export,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> miette::Result<ExitCode> {
    let cli = Cli::parse();
    let output = cli.command.output();

    // JSON mode keeps stderr quiet unless RUST_LOG says otherwise
    let default_filter = match output {
        OutputMode::Json => "error",
        OutputMode::Text => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = cli.env.into_settings();
    match run(cli.command, settings, output).await {
        Ok(true) => Ok(ExitCode::SUCCESS),
        Ok(false) => Ok(ExitCode::FAILURE),
        Err(e) if output == OutputMode::Json => {
            println!("{}", to_json(&ErrorReport::new(e.to_string()))?);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

/// Run one command; `Ok(false)` means it completed but reported failure
async fn run(command: Commands, settings: Settings, output: OutputMode) -> Result<bool> {
    settings.validate()?;
    require_root()?;
    let mut ctx = OperationContext::new(settings, output, SystemTools::host());
    debug!("Running with {:?}", ctx.settings);

    match command {
        Commands::Mount {
            agent,
            cleanup: Some(target),
            ..
        } => {
            // `mount server1 --cleanup` scopes the sweep to the positional agent
            let target = match (target.as_str(), agent.as_deref()) {
                ("all", Some(agent)) => Some(agent),
                ("all", None) => None,
                (agent, _) => Some(agent),
            };
            let report = cleanup_agent(&ctx, target).await?;
            emit(output, &report, print_cleanup)?;
            Ok(report.success)
        }
        Commands::Mount {
            agent, snapshot, ..
        } => {
            let selector = SnapshotSelector::parse(&snapshot)?;
            let agent = agent.unwrap_or_default();
            let report = mount_agent(&mut ctx, &agent, selector).await?;
            emit(output, &report, print_mount)?;
            Ok(report.status != BatchStatus::Failed)
        }
        Commands::Pool { action, device, .. } => {
            let report = match action {
                PoolAction::Import => import_pools(&ctx, device.as_deref()).await?,
                PoolAction::Export => export_pools(&ctx, device.as_deref()).await?,
            };
            emit(output, &report, print_pool_action)?;
            Ok(report.success())
        }
        Commands::Status { .. } => {
            let report = collect_status(&ctx).await?;
            emit(output, &report, print_status)?;
            Ok(true)
        }
        Commands::Metadata { .. } => {
            let report = collect_metadata(&ctx).await?;
            emit(output, &report, print_metadata)?;
            Ok(report.success)
        }
        Commands::Automount { .. } => {
            let report = run_automount(&mut ctx).await?;
            emit(output, &report, print_automount)?;
            Ok(report.success)
        }
    }
}

/// Print the final JSON document, or the human summary in text mode
fn emit<T: Serialize>(output: OutputMode, report: &T, text: fn(&T)) -> Result<()> {
    match output {
        OutputMode::Json => println!("{}", to_json_pretty(report)?),
        OutputMode::Text => text(report),
    }
    Ok(())
}

fn print_mount(report: &MountReport) {
    println!("{}", report.message);
    for mount in &report.mounts {
        println!("{} [{}]", mount.snapshot, mount.status);
        if let Some(error) = &mount.error {
            println!("  error: {}", error);
        }
        for volume in &mount.volumes {
            match &volume.error {
                None => println!("  {} -> {} [{}]", volume.guid, volume.mount_path, volume.status),
                Some(error) => println!("  {} [{}]: {}", volume.guid, volume.status, error),
            }
        }
    }
}

fn print_cleanup(report: &CleanupReport) {
    println!(
        "Cleanup of '{}': released {} resource(s)",
        report.scope,
        report.cleaned.len()
    );
    for resource in &report.cleaned {
        println!("  {:?} {}", resource.kind, resource.target);
    }
    for failed in &report.failed {
        println!("  still held: {}", failed);
    }
}

fn print_pool_action(report: &PoolActionReport) {
    match report {
        PoolActionReport::Batch { pools, .. } if pools.is_empty() => {
            println!("No matching pools found");
        }
        PoolActionReport::Batch { pools, .. } => {
            for pool in pools {
                println!("{}", pool.message);
            }
        }
        PoolActionReport::Single { message, .. } => println!("{}", message),
    }
}

fn print_status(report: &StatusReport) {
    println!("Status: {}", report.status);
    for drive in &report.drives {
        println!(
            "  drive {} {} {} ({} bytes)",
            drive.path, drive.model, drive.serial, drive.size
        );
    }
    for pool in &report.imported_pools {
        println!("  imported  {} {}", pool.name, pool.health);
    }
    for pool in &report.available_pools {
        println!("  available {} {}", pool.name, pool.health);
    }
}

fn print_metadata(report: &MetadataReport) {
    println!("Pool {}: {} agent(s)", report.pool_name, report.agent_count);
    for (id, agent) in &report.agents {
        let latest = agent
            .latest_snapshot
            .map(format_snapshot_date)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} hostname={} snapshots={} latest={} volumes={}",
            id,
            agent.hostname,
            agent.snapshot_count,
            latest,
            agent.volumes.len()
        );
    }
}

fn print_automount(report: &AutomountReport) {
    println!("{}", report.message);
    for mount in &report.mounts {
        println!("  {} [{}] {}", mount.snapshot, mount.status, mount.final_mount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_flag_forms() {
        let cli = Cli::try_parse_from(["snapmount", "mount", "--cleanup"]).unwrap();
        match cli.command {
            Commands::Mount { agent, cleanup, .. } => {
                assert_eq!(agent, None);
                assert_eq!(cleanup.as_deref(), Some("all"));
            }
            _ => panic!("expected mount"),
        }

        let cli = Cli::try_parse_from(["snapmount", "mount", "--cleanup=server1", "-j"]).unwrap();
        assert_eq!(cli.command.output(), OutputMode::Json);
        match cli.command {
            Commands::Mount { cleanup, .. } => assert_eq!(cleanup.as_deref(), Some("server1")),
            _ => panic!("expected mount"),
        }
    }

    #[test]
    fn test_mount_requires_agent() {
        assert!(Cli::try_parse_from(["snapmount", "mount"]).is_err());

        let cli = Cli::try_parse_from(["snapmount", "mount", "server1", "1500"]).unwrap();
        match cli.command {
            Commands::Mount {
                agent, snapshot, ..
            } => {
                assert_eq!(agent.as_deref(), Some("server1"));
                assert_eq!(
                    SnapshotSelector::parse(&snapshot).unwrap(),
                    SnapshotSelector::Closest(1500)
                );
            }
            _ => panic!("expected mount"),
        }
    }

    #[test]
    fn test_settings_from_flags() {
        let cli = Cli::try_parse_from([
            "snapmount",
            "--pool-name",
            "homePool-2",
            "--settle-ms",
            "0",
            "status",
        ])
        .unwrap();
        let settings = cli.env.into_settings();
        assert_eq!(settings.pool_name.as_deref(), Some("homePool-2"));
        assert_eq!(settings.settle_delay, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_overlapping_roots_are_rejected_before_running() {
        let cli = Cli::try_parse_from([
            "snapmount",
            "--mount-root",
            "/mnt/snapmount",
            "--staging-root",
            "/mnt/snapmount/.staging",
            "status",
        ])
        .unwrap();
        let err = run(cli.command, cli.env.into_settings(), OutputMode::Text)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            snapmount_runtime::RuntimeError::CoreError(
                snapmount_core::CoreError::InvalidConfig { .. }
            )
        ));
    }
}
