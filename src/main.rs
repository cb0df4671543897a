//! commux-core — the broker core process.
//!
//! Spawned by the component API with the rendezvous arguments and a
//! session key; connects back to the component's socket, activates the
//! configured transport modules, and runs the event loop until an
//! orderly terminate or a fatal channel loss.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use commux::api::component_socket_path;
use commux::config::Config;
use commux::core::Core;
use commux::observability::{self, LogFormat};
use commux::transport::UnixModule;

#[derive(Parser, Debug)]
#[command(name = "commux-core", version, about = "commux broker core")]
struct Cli {
    /// Inherited descriptor mode; only 0 (rendezvous by socket path) is
    /// supported.
    #[arg(short = 'f', default_value_t = 0)]
    fd: u64,

    /// Component (application) name.
    #[arg(short = 'a', env = "COMMUX_APP_NAME")]
    app_name: String,

    /// Session key the component will present.
    #[arg(short = 'k', env = "COMMUX_SESSION_KEY")]
    session_key: String,

    /// Configuration file.
    #[arg(short = 'c', env = "COMMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format.
    #[arg(long, default_value = "human")]
    log_format: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let format = if cli.log_format == "json" {
        LogFormat::Json
    } else {
        LogFormat::Human
    };
    observability::init_logging(format, cli.verbose);
    observability::describe_metrics();

    if cli.fd != 0 {
        error!("descriptor inheritance is not supported; spawn with -f 0");
        std::process::exit(2);
    }

    let config = match Config::load_optional(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration failed to load");
            std::process::exit(2);
        }
    };

    let mut core = Core::new(&cli.app_name, &cli.session_key, config);
    let unix = UnixModule::new(core.events_sender());
    core.add_module(Arc::new(unix));
    if let Err(e) = core.activate_config_modules().await {
        error!(error = %e, "transport module activation failed");
        std::process::exit(2);
    }

    let socket = component_socket_path(&cli.app_name, &cli.session_key);
    let socket = socket.to_string_lossy();
    if let Err(e) = core.connect_component(&socket).await {
        error!(%socket, error = %e, "cannot reach the component");
        std::process::exit(1);
    }

    // SIGINT/SIGTERM: stop the loop; the core unmaps on the way out.
    let cancel = core.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });

    let code = core.run().await;
    std::process::exit(code);
}
