mod config;
mod error;

use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use oat_formation::model::PoolKind;
use oat_formation::{FormationSpec, Orchestrator, RemoteContext, ast};
use oat_infra::ssh::SshTransport;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::error::CliError;

/// Exit status for definition and configuration errors.
const DEFINITION_ERROR: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "oat", version, about = "Provision a formation of pools, boxes and a load balancer")]
struct Args {
    /// Formation definition (JSON).
    #[arg(env = "OAT_FORMATION")]
    formation: PathBuf,

    /// Compile the formation and list its servers without calling the provider.
    #[arg(long)]
    plan: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "formation not started");
            eprintln!("error: {e}");
            ExitCode::from(DEFINITION_ERROR)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode, CliError> {
    let config = AppConfig::from_env()?;

    let source = tokio::fs::read_to_string(&args.formation)
        .await
        .map_err(|source| CliError::ReadFormation {
            path: args.formation.clone(),
            source,
        })?;
    let spec = oat_formation::compile(&ast::parse(&source)?)?;

    if args.plan {
        print!("{}", render_plan(&spec));
        return Ok(ExitCode::SUCCESS);
    }

    let provider = oat_infra::build_provider(config.provider)?;
    let transport = Arc::new(SshTransport::new(config.ssh_user.clone()));
    let ctx = RemoteContext::new(provider, transport, config.run_settings());

    tracing::info!(
        provider = %config.provider,
        formation = %args.formation.display(),
        "starting formation"
    );
    let report = Orchestrator::new(ctx).run(&spec).await;
    print!("{}", report.summary());

    Ok(if report.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// One line per server, then one line per exposed pool service.
fn render_plan(spec: &FormationSpec) -> String {
    let mut out = String::new();
    for component in spec.components() {
        let vm = component.vm();
        let _ = writeln!(
            out,
            "{}\t{}\t{}\t{}\t{} bootstrap step(s)",
            component.server_name(),
            component.role(),
            vm.image,
            vm.vm_flavor,
            vm.bootstrap_sequence.len()
        );
    }
    for pool in &spec.pools {
        let kind = match pool.kind {
            PoolKind::Http => "http",
            PoolKind::Tcp => "tcp",
        };
        for service in &pool.services {
            let _ = writeln!(
                out,
                "{}.vip\t{kind}\t:{}\thealthcheck {} on :{}",
                pool.vm.name, service.port, service.healthcheck_path, service.healthcheck_port
            );
        }
    }
    out
}
