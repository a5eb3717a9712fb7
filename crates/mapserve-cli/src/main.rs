use anyhow::Context;
use clap::Parser;
use mapserve_core::{Config, Server};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "mapserve")]
#[command(about = "Event-driven HTTP/1.1 file server with uploads")]
#[command(version)]
struct Cli {
    /// Port to listen on
    port: u16,

    /// Address to bind (overrides SERVER_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Directory holding the site and page templates (overrides DOC_ROOT)
    #[arg(long)]
    doc_root: Option<PathBuf>,

    /// Directory for uploaded files (overrides UPLOAD_DIR)
    #[arg(long)]
    upload_dir: Option<PathBuf>,

    /// Worker threads (overrides WORKER_THREADS)
    #[arg(long)]
    threads: Option<usize>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(self, mut config: Config) -> Config {
        config.server_port = self.port;
        if let Some(host) = self.host {
            config.server_host = host;
        }
        if let Some(doc_root) = self.doc_root {
            // The default upload directory follows the document root.
            if self.upload_dir.is_none() && std::env::var_os("UPLOAD_DIR").is_none() {
                config.upload_dir = doc_root.join("uploads");
            }
            config.doc_root = doc_root;
        }
        if let Some(upload_dir) = self.upload_dir {
            config.upload_dir = upload_dir;
        }
        if let Some(threads) = self.threads {
            config.worker_threads = threads;
        }
        config
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.json_logs {
        mapserve_core::init_logging_json(&cli.log_level);
    } else {
        mapserve_core::init_logging_with_level(&cli.log_level);
    }

    mapserve_core::syscalls::ignore_sigpipe();

    let config = cli.apply(Config::from_env());
    tracing::info!(
        doc_root = %config.doc_root.display(),
        upload_dir = %config.upload_dir.display(),
        workers = config.worker_threads,
        "starting mapserve"
    );

    let server = Server::bind(config).context("failed to bind listener")?;

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        tracing::info!("received interrupt, shutting down");
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("failed to install Ctrl-C handler")?;

    server.run().context("server failed")?;
    Ok(())
}
