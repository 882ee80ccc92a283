use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use securefs_core::{
    decide, layout, AuditRecord, AuditSink, CredentialStore, Intent, Operation, PrincipalRecord,
    PrincipalResolver, Sensitivity,
};

#[derive(Parser)]
#[clap(name = "securefs-admin", about = "Manage the principal/credential store")]
struct Cli {
    /// Backing directory of the mount whose store this CLI edits.
    backing: PathBuf,
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// List every principal in the store.
    List,
    /// Change a principal's clearance level.
    SetLevel { user: String, level: String },
    /// Change a principal's trusted bit.
    SetTrust { user: String, trusted: bool },
    /// Add a new principal.
    Add {
        user: String,
        level: String,
        trusted: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    match run(cli) {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            eprintln!("securefs-admin: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let credentials = layout::credentials_path(&cli.backing);
    let audit_log = layout::audit_log_path(&cli.backing);
    let resolver = PrincipalResolver::from_env(&credentials);
    let audit = AuditSink::open(&audit_log)
        .with_context(|| format!("opening audit log at {}", audit_log.display()))?;

    if let Command::List = cli.command {
        let store = CredentialStore::load(&credentials)
            .with_context(|| format!("reading {}", credentials.display()))?;
        for (name, record) in store.iter() {
            println!("{name}\t{}\t{}", record.level, record.trusted);
        }
        return Ok(());
    }

    let caller = resolver.current_principal();
    let target = match &cli.command {
        Command::SetLevel { user, .. } | Command::SetTrust { user, .. } | Command::Add { user, .. } => {
            user.clone()
        }
        Command::List => unreachable!(),
    };

    let mut store = CredentialStore::load(&credentials)
        .with_context(|| format!("reading {}", credentials.display()))?;

    // Any mutation that sets a level - `SetLevel` on an existing principal or
    // `Add` creating a new one - is gated by the stricter `AdminSetLevel`
    // rule (spec 6: operator's clearance must exceed both the target's
    // current and new level). A brand-new principal's "current" level is
    // `Unclassified`, so `Add`'s escalation is bounded the same way. `SetTrust`
    // alone uses the plain administrator gate.
    let (operation, decision) = match &cli.command {
        Command::SetLevel { level, .. } | Command::Add { level, .. } => {
            let parsed = Sensitivity::parse(level)
                .with_context(|| format!("unrecognized level '{level}'"))?;
            let current = store.get(&target).map(|r| r.clearance()).unwrap_or(Sensitivity::Unclassified);
            (
                Operation::AdminSetLevel,
                decide(&caller, Operation::AdminSetLevel, current, Intent::expurgate_to(parsed)),
            )
        }
        _ => (Operation::Admin, decide(&caller, Operation::Admin, Sensitivity::Unclassified, Intent::none())),
    };
    audit
        .record(&AuditRecord::from_decision(
            &caller.name,
            caller.clearance,
            operation,
            format!("users.json:{target}"),
            decision,
        ))
        .context("writing audit record")?;
    if !decision.is_grant() {
        anyhow::bail!("{} is not authorized to administer the principal store", caller.name);
    }

    match cli.command {
        Command::List => unreachable!(),
        Command::SetLevel { user, level } => {
            let parsed = Sensitivity::parse(&level)
                .with_context(|| format!("unrecognized level '{level}'"))?;
            let trusted = store.get(&user).map(|r| r.trusted).unwrap_or(false);
            store.insert(user, PrincipalRecord::new(parsed, trusted));
        }
        Command::SetTrust { user, trusted } => {
            let level = store
                .get(&user)
                .map(|r| r.clearance())
                .unwrap_or(Sensitivity::Unclassified);
            store.insert(user, PrincipalRecord::new(level, trusted));
        }
        Command::Add { user, level, trusted } => {
            let parsed = Sensitivity::parse(&level)
                .with_context(|| format!("unrecognized level '{level}'"))?;
            store.insert(user, PrincipalRecord::new(parsed, trusted));
        }
    }

    store
        .save(&credentials)
        .with_context(|| format!("writing {}", credentials.display()))?;
    Ok(())
}
