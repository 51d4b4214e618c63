//! # tagrpc CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve the built-in provider on port 4000
//! tagrpc serve -b localhost:4000
//!
//! # Same, with settings from a file and the bind address from the environment
//! TAGRPC_BIND=localhost:4000 tagrpc --config tagrpc.json serve
//!
//! # Make a call (outputs raw JSON)
//! tagrpc call localhost:4000 add -a '[2, 3]'
//!
//! # Fail over between two servers
//! tagrpc call host1:4000,host2:4000 ping
//! ```

use std::path::PathBuf;

use anyhow::Result;
use argh::FromArgs;
use tagrpc_cli::{builtin_methods, parse_args, value_to_json, CliConfig, BIND_ENV};
use tagrpc_client::RpcClient;
use tagrpc_server::RpcServer;

#[derive(FromArgs)]
/// tagrpc - lightweight binary RPC over TCP
struct Cli {
    /// path to a JSON config file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
}

/// Arguments for serving the built-in provider.
///
/// # Example
///
/// ```bash
/// tagrpc serve -b localhost:4000 -n calc
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// serve the built-in methods
struct ServeArgs {
    /// address to bind, in connection string form
    ///
    /// Overrides TAGRPC_BIND and the config file. Port 0 picks a free port,
    /// which is logged at startup.
    #[argh(option, short = 'b')]
    bind: Option<String>,

    /// server name sent to clients in the handshake
    #[argh(option, short = 'n')]
    name: Option<String>,
}

/// Arguments for making a single call.
///
/// The result is printed to stdout as raw JSON. Errors go to stderr with a
/// non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a method on a server
struct CallArgs {
    /// connection string, e.g. host1:4000,host2:4000
    #[argh(positional)]
    server: String,

    /// name of the method to call
    #[argh(positional)]
    method: String,

    /// arguments as a JSON array, or a single JSON value
    #[argh(option, short = 'a', long = "args", default = "\"[]\".into()")]
    args: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call: keep output clean for piping to jq and friends
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = CliConfig::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Serve(args) => run_serve(args, config).await,
        Commands::Call(args) => run_call(args, config).await,
    }
}

async fn run_serve(args: ServeArgs, mut config: CliConfig) -> Result<()> {
    config.resolve_bind(args.bind, std::env::var(BIND_ENV).ok());
    if let Some(name) = args.name {
        config.server.name = name;
    }

    let methods = builtin_methods(&config.server.name);
    let server = RpcServer::bind(methods, config.server).await?;
    tracing::info!("Serving on {}", server.connection_string());

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }
    Ok(())
}

/// Executes the `call` subcommand and prints the result as JSON.
///
/// # Errors
///
/// Returns an error if the arguments are not valid JSON, no server can be
/// reached or the call itself fails.
async fn run_call(args: CallArgs, config: CliConfig) -> Result<()> {
    let call_args = parse_args(&args.args)
        .map_err(|e| anyhow::anyhow!("Invalid JSON in args: {}", e))?;

    let client = RpcClient::connect(&args.server, config.client)?;
    let result = client.invoke(&args.method, call_args).await;
    client.close();

    println!("{}", serde_json::to_string(&value_to_json(&result?))?);
    Ok(())
}
