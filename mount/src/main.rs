use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use securefs_core::{layout, AuditSink, Mediator, PrincipalResolver, SessionFileIdentity};

#[derive(Parser)]
#[clap(name = "securefs-mount", about = "Mount a label-mediated passthrough filesystem")]
struct Cli {
    /// Directory to serve through the mount, labeled by its subdirectory names.
    backing: PathBuf,
    /// Where to attach the mediated filesystem.
    mountpoint: PathBuf,
    /// Override the default `<backing>/.securefs/users.json` credential store.
    #[clap(long)]
    credentials: Option<PathBuf>,
    /// Override the default `<backing>/.securefs/audit.log` audit log.
    #[clap(long = "audit-log")]
    audit_log: Option<PathBuf>,
    /// Raise the tracing filter to `debug`.
    #[clap(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| default_level.to_owned());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn run(cli: Cli) -> Result<()> {
    if !cli.backing.is_dir() {
        anyhow::bail!("backing directory {} does not exist", cli.backing.display());
    }

    let credentials = cli.credentials.unwrap_or_else(|| layout::credentials_path(&cli.backing));
    let audit_log = cli.audit_log.unwrap_or_else(|| layout::audit_log_path(&cli.backing));
    let session = layout::session_path(&cli.backing);

    let resolver = PrincipalResolver::new(Arc::new(SessionFileIdentity::new(session)), credentials);
    let audit = AuditSink::open(&audit_log)
        .with_context(|| format!("opening audit log at {}", audit_log.display()))?;
    let mediator = Mediator::new(cli.backing.clone(), resolver, audit);

    tracing::info!(
        backing = %cli.backing.display(),
        mountpoint = %cli.mountpoint.display(),
        "starting mount"
    );

    let options = [
        fuser::MountOption::FSName("securefs".to_string()),
        fuser::MountOption::DefaultPermissions,
    ];
    fuser::mount2(mediator, &cli.mountpoint, &options)
        .with_context(|| format!("mounting at {}", cli.mountpoint.display()))?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            eprintln!("securefs-mount: {err:#}");
            // A failure to even find the backing directory is a usage error;
            // everything past that point is treated as a mount failure, per
            // the two-tier exit code split.
            let code = if err.to_string().contains("does not exist") {
                1
            } else {
                2
            };
            ExitCode::from(code)
        }
    }
}
