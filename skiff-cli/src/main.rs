use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod kubeconfig;

#[derive(Parser)]
#[command(name = "skiff")]
#[command(about = "Deploy docker-compose services to a Kubernetes-style cluster", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create services and pods for the compose file and stream logs until
    /// everything is ready
    Up {
        /// Path to the compose file (default: docker-compose.yml)
        #[arg(short, long)]
        file: Option<String>,

        /// Environment id that namespaces this deployment's cluster objects
        #[arg(short, long)]
        env_id: Option<String>,

        /// Cluster namespace (default: from the local cluster config)
        #[arg(short, long)]
        namespace: Option<String>,

        /// Set the pod security context from the compose or image user
        #[arg(long)]
        run_as_user: bool,

        /// Do not stream container logs
        #[arg(short, long)]
        detach: bool,

        /// Services to bring up (default: all)
        services: Vec<String>,
    },

    /// Delete the pods and services created by up
    Down {
        /// Path to the compose file (default: docker-compose.yml)
        #[arg(short, long)]
        file: Option<String>,

        /// Environment id that namespaces this deployment's cluster objects
        #[arg(short, long)]
        env_id: Option<String>,

        /// Cluster namespace (default: from the local cluster config)
        #[arg(short, long)]
        namespace: Option<String>,

        /// Services to tear down (default: all)
        services: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Up {
            file,
            env_id,
            namespace,
            run_as_user,
            detach,
            services,
        } => {
            let cfg = commands::load_config(file.as_deref(), env_id, namespace, &services)?;
            commands::up::run(cfg, run_as_user, detach).await
        }
        Commands::Down {
            file,
            env_id,
            namespace,
            services,
        } => {
            let cfg = commands::load_config(file.as_deref(), env_id, namespace, &services)?;
            commands::down::run(cfg).await
        }
    }
}
