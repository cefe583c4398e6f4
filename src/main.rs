use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use steward::config::{resolve_config_path, DirtyPolicy, Settings};
use steward::envfile::required_env_keys;
use steward::error::{ErrorDetails, StewardError};
use steward::orchestrator::{InstallOptions, Orchestrator, PrepareOptions};
use steward::SystemRunner;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "steward", version, about = "Provision and run local service runtimes")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// List configured services.
    Services,
    Sync {
        service: String,
        #[arg(long)]
        update: bool,
        #[arg(long)]
        policy: Option<DirtyPolicy>,
    },
    Env {
        #[command(subcommand)]
        command: EnvCommand,
    },
    Prepare {
        service: String,
        #[command(flatten)]
        prepare: PrepareArgs,
    },
    Start {
        service: String,
    },
    Stop {
        service: String,
    },
    Restart {
        service: String,
    },
    Health {
        service: String,
        #[arg(long)]
        url: Option<String>,
    },
    Bootstrap {
        service: String,
        user: String,
    },
    Precheck {
        service: String,
    },
    /// Sync, prepare and start in one go.
    Install {
        service: String,
        #[arg(long)]
        update: bool,
        #[arg(long)]
        no_start: bool,
        #[command(flatten)]
        prepare: PrepareArgs,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Path,
    Show,
}

#[derive(Subcommand, Debug)]
enum EnvCommand {
    Materialize {
        service: String,
        /// Extra KEY=VALUE pairs; repeatable.
        #[arg(long = "set")]
        set: Vec<String>,
        #[arg(long)]
        no_backup: bool,
    },
    Keys {
        service: String,
    },
}

#[derive(clap::Args, Debug)]
struct PrepareArgs {
    #[arg(long)]
    full_install: bool,
    #[arg(long)]
    force_recreate: bool,
    /// Installer identity whose library should be bootstrapped.
    #[arg(long)]
    user: Option<String>,
}

impl From<PrepareArgs> for PrepareOptions {
    fn from(args: PrepareArgs) -> Self {
        PrepareOptions {
            full_install: args.full_install,
            force_recreate: args.force_recreate,
            installer_user_id: args.user,
        }
    }
}

struct Context {
    config_path: PathBuf,
    json: bool,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ErrorDetails>,
}

#[tokio::main]
async fn main() -> Result<(), StewardError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let ctx = Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    };

    let result = run(&ctx, cli.command).await;
    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: Some(err.details()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }
    Ok(())
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(ctx: &Context, command: Commands) -> Result<(), StewardError> {
    let settings = Settings::load(&ctx.config_path)?;
    let orch = Orchestrator::new(settings.clone(), Arc::new(SystemRunner))?;

    let payload = match command {
        Commands::Config { command } => handle_config(ctx, &command, &settings)?,
        Commands::Services => json!({ "services": orch.registry().metadata() }),
        Commands::Sync {
            service,
            update,
            policy,
        } => serde_json::to_value(orch.sync_source(&service, update, policy).await?)?,
        Commands::Env { command } => handle_env(&orch, command).await?,
        Commands::Prepare { service, prepare } => {
            serde_json::to_value(orch.prepare_service(&service, prepare.into()).await?)?
        }
        Commands::Start { service } => serde_json::to_value(orch.start_service(&service).await?)?,
        Commands::Stop { service } => {
            serde_json::to_value(orch.shutdown_service(&service).await?)?
        }
        Commands::Restart { service } => {
            serde_json::to_value(orch.restart_service(&service).await?)?
        }
        Commands::Health { service, url } => {
            serde_json::to_value(orch.health_check(&service, url.as_deref()).await?)?
        }
        Commands::Bootstrap { service, user } => {
            serde_json::to_value(orch.bootstrap_user(&service, &user).await?)?
        }
        Commands::Precheck { service } => serde_json::to_value(orch.precheck(&service).await?)?,
        Commands::Install {
            service,
            update,
            no_start,
            prepare,
        } => {
            let options = InstallOptions {
                update,
                auto_start: !no_start,
                prepare: prepare.into(),
            };
            serde_json::to_value(orch.install_service(&service, options).await?)?
        }
    };
    output(ctx, payload)
}

fn handle_config(
    ctx: &Context,
    command: &ConfigCommand,
    settings: &Settings,
) -> Result<serde_json::Value, StewardError> {
    match command {
        ConfigCommand::Path => Ok(json!({
            "config_path": ctx.config_path,
            "exists": ctx.config_path.exists(),
            "runtime_dir": settings.resolved_runtime_dir(),
        })),
        ConfigCommand::Show => Ok(serde_json::to_value(settings)?),
    }
}

async fn handle_env(orch: &Orchestrator, command: EnvCommand) -> Result<serde_json::Value, StewardError> {
    match command {
        EnvCommand::Materialize {
            service,
            set,
            no_backup,
        } => {
            let overrides = parse_assignments(&set)?;
            let write = orch.materialize_env(&service, overrides, !no_backup).await?;
            Ok(serde_json::to_value(write)?)
        }
        EnvCommand::Keys { service } => {
            let descriptor = orch.registry().get(&service)?;
            Ok(json!({
                "service": descriptor.key,
                "keys": required_env_keys(descriptor),
            }))
        }
    }
}

fn parse_assignments(raw: &[String]) -> Result<BTreeMap<String, String>, StewardError> {
    let mut values = BTreeMap::new();
    for item in raw {
        let Some((key, value)) = item.split_once('=') else {
            return Err(StewardError::Config(format!(
                "--set expects KEY=VALUE, got '{item}'"
            )));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(StewardError::Config(format!("--set has an empty key: '{item}'")));
        }
        values.insert(key.to_string(), value.to_string());
    }
    Ok(values)
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), StewardError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), StewardError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
