#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use atlas_backup::server;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "atlas-backup", about = "Multi-cluster Kubernetes backup orchestrator")]
struct Cli {
    /// Path to the orchestrator config file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one orchestrated multi-cluster backup
    Backup,
    /// Validate the configuration (schema, cross-field, enhanced checks)
    Validate,
    /// Run the live validation service and its HTTP API
    Serve {
        /// API listen address (overrides the config)
        #[arg(short, long)]
        listen: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let worker_threads = server::runtime::get_container_cpu_limit();
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to build runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    let outcome = rt.block_on(async {
        match cli.command {
            Command::Backup => {
                server::bootstrap::run_backup(server::bootstrap::BootstrapArgs {
                    config_path: cli.config,
                    listen: None,
                })
                .await
            }
            Command::Validate => {
                server::bootstrap::run_validate(server::bootstrap::BootstrapArgs {
                    config_path: cli.config,
                    listen: None,
                })
                .await
            }
            Command::Serve { listen } => {
                server::bootstrap::run_serve(server::bootstrap::BootstrapArgs {
                    config_path: cli.config,
                    listen,
                })
                .await
            }
        }
    });

    match outcome {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}
