mod config;
mod net;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config::{BackendDescriptor, NodeDescriptor};
use net::TcpMesh;
use tessera_core::{Backend, FsBackend, MemoryBackend, Node, NodeConfig};

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Distributed content-addressed object storage node")]
struct Cli {
    /// Path to the key=value configuration file
    #[arg(short, long, default_value = "tessera.conf")]
    config: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let descriptor = match NodeDescriptor::from_file(&cli.config) {
        Ok(descriptor) => descriptor,
        Err(error) => {
            eprintln!("failed to load config {}: {}", cli.config.display(), error);
            std::process::exit(1);
        }
    };

    if let Err(error) = init_tracing(&descriptor) {
        eprintln!("failed to initialise logging: {}", error);
        std::process::exit(1);
    }

    if descriptor.daemon {
        tracing::warn!(
            "daemon mode is left to the service manager; staying in the foreground"
        );
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(descriptor.io_thread_num.max(1))
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("failed to start runtime: {}", error);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(descriptor));
    std::process::exit(code);
}

fn init_tracing(descriptor: &NodeDescriptor) -> std::io::Result<()> {
    let level = match descriptor.log_level {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("tessera={0},tessera_core={0}", level).into());

    match &descriptor.log {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(Arc::new(file)))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
    Ok(())
}

async fn run(descriptor: NodeDescriptor) -> i32 {
    let backend: Arc<dyn Backend> = match &descriptor.backend {
        BackendDescriptor::Memory => Arc::new(MemoryBackend::new()),
        BackendDescriptor::Blob(blob) => {
            let data = blob.data.clone().expect("validated by freeze");
            match FsBackend::new(data) {
                Ok(backend) => Arc::new(backend),
                Err(error) => {
                    tracing::error!("failed to open blob backend: {}", error);
                    return 1;
                }
            }
        }
    };

    let (mesh, inbox) = TcpMesh::new();
    let bind = descriptor.addr.host_port();
    if let Err(error) = mesh.listen(&bind).await {
        tracing::error!("failed to listen on {}: {}", bind, error);
        return 1;
    }

    let mut node_config = NodeConfig::new(bind.clone(), descriptor.group);
    node_config.cache_size = descriptor.cache_size;
    node_config.wait_timeout = descriptor.wait_timeout;

    let node = match Node::new(node_config, backend, mesh) {
        Ok(node) => node,
        Err(error) => {
            tracing::error!("failed to assemble node: {}", error);
            return 1;
        }
    };
    node.start(inbox);

    for remote in &descriptor.remotes {
        let group = remote.group.unwrap_or(descriptor.group);
        node.add_peer(group, remote.host_port().into());
        tracing::info!("added peer {} for group {}", remote.host_port(), group);
    }
    if descriptor.join {
        tracing::info!(
            "joined as group {} with {} known peers",
            descriptor.group,
            descriptor.remotes.len()
        );
    }

    wait_for_shutdown().await;
    node.stop();
    0
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut term =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(error) => {
                    tracing::error!("failed to install SIGTERM handler: {}", error);
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("interrupted, shutting down"),
            _ = term.recv() => tracing::info!("terminated, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("interrupted, shutting down");
    }
}
