//! keyrelay - relay server for NAT-traversal tunneling.

use clap::Parser;
use keyrelay::cli::default_config_dir;
use keyrelay::{
    load_or_generate_identity, run_server, BuildInfo, Cli, Command, Error, ExitCode, IdentityArgs,
};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        tracing::warn!("failed to install default crypto provider (may already be installed): {:?}", e);
    }

    let result = match cli.command {
        Command::Server(args) => {
            tracing::info!("Server command received");
            tracing::debug!(?args, "Server arguments");

            match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime.block_on(run_server(&args)),
                Err(e) => Err(Error::Io(e)),
            }
        }
        Command::Identity(args) => show_identity(&args),
        Command::Version => {
            println!("{}", BuildInfo::get().format());
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "keyrelay error");
        std::process::exit(i32::from(e.exit_code()));
    }
    std::process::exit(i32::from(ExitCode::Success));
}

fn show_identity(args: &IdentityArgs) -> keyrelay::Result<()> {
    let dir = args.dir.clone().unwrap_or_else(default_config_dir);
    let (cert_key, generated) = load_or_generate_identity(&dir)
        .map_err(|e| Error::Config(format!("failed to load or generate identity: {}", e)))?;

    if generated {
        eprintln!("Identity generated and saved to {}", dir.display());
    }
    println!("{}", cert_key.identity());
    Ok(())
}
