use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use devmux::app::App;
use devmux::config::{
    load_routes, Paths, Settings, DEFAULT_DNS_PORT, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT,
};

#[derive(Parser)]
#[command(
    name = "devmux",
    version,
    about = "Local development multiplexer for .test domains"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Base directory for routes, certs, and state (default: ~/.config/devmux)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground (default when no subcommand given)
    Run {
        /// HTTP listen port
        #[arg(long, default_value_t = DEFAULT_HTTP_PORT)]
        http_port: u16,

        /// HTTPS listen port
        #[arg(long, default_value_t = DEFAULT_HTTPS_PORT)]
        https_port: u16,

        /// DNS listen port
        #[arg(long, default_value_t = DEFAULT_DNS_PORT)]
        dns_port: u16,

        /// Serve HTTPS with locally generated certificates
        #[arg(long)]
        tls: bool,
    },

    /// Validate the route file and print a summary
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = match &cli.dir {
        Some(dir) => Paths::from_base(dir.clone()),
        None => Paths::resolve()?,
    };

    match cli.command {
        Some(Commands::Check) => cmd_check(&paths),
        Some(Commands::Run {
            http_port,
            https_port,
            dns_port,
            tls,
        }) => {
            cmd_run(
                paths,
                Settings {
                    http_port,
                    https_port,
                    dns_port,
                    tls,
                },
            )
            .await
        }
        None => cmd_run(paths, Settings::default()).await,
    }
}

async fn cmd_run(paths: Paths, settings: Settings) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("devmux starting");
    App::new(settings, paths).run().await
}

fn cmd_check(paths: &Paths) -> Result<()> {
    match load_routes(&paths.routes_file) {
        Ok(routes) => {
            println!("route file '{}' is valid", paths.routes_file.display());
            println!("  routes: {}", routes.len());
            for route in &routes {
                if route.is_tcp() {
                    println!(
                        "  {}  :{} -> :{}  (tcp)",
                        route.domain, route.listen_port, route.port
                    );
                } else {
                    println!("  {}  -> :{}", route.domain, route.port);
                }
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("route file '{}' has errors:", paths.routes_file.display());
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
