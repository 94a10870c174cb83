// Waypath node: transport service daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use waypath_core::{Clock, Keypair, SystemClock, TransportCore};
use waypath_node::config;
use waypath_node::peerstore::FilePeerStore;
use waypath_node::{Command, CoreEvent, Service};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut gen_key = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("waypath-node {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let p = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(p));
            }
            "--gen-key" => gen_key = true,
            other => bail!("unknown argument: {other}"),
        }
    }

    let cfg = config::load(config_path.as_deref())?;
    init_logging(&cfg.log_filter);

    if gen_key {
        let keypair = generate_key(&cfg.key_file)?;
        println!("{}", hex::encode(keypair.identity().as_bytes()));
        return Ok(());
    }

    let keypair = load_key(&cfg.key_file)?;
    let store = FilePeerStore::open(&cfg.peerstore_file, SystemClock.now())
        .with_context(|| format!("opening peer store {}", cfg.peerstore_file.display()))?;
    info!(
        peer = %hex::encode(keypair.identity().as_bytes()),
        version = VERSION,
        "starting waypath node"
    );
    let core = TransportCore::new(keypair, cfg.transport.clone());
    let (service, mut upper) = Service::new(core, Box::new(store));
    let (commands, rx) = mpsc::unbounded_channel();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let service_task = tokio::spawn(service.run(rx));
        let upper_task = tokio::spawn(async move {
            while let Some(ev) = upper.recv().await {
                log_core_event(&ev);
            }
        });
        let stats_task = (cfg.stats_interval_secs > 0).then(|| {
            let every = Duration::from_secs(cfg.stats_interval_secs);
            tokio::spawn(stats_loop(commands.clone(), every))
        });

        shutdown_signal().await?;
        info!("shutdown signal received");
        if let Some(t) = stats_task {
            t.abort();
        }
        drop(commands);
        service_task.await?;
        upper_task.abort();
        anyhow::Ok(())
    })
}

fn init_logging(level: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

fn log_core_event(ev: &CoreEvent) {
    match ev {
        CoreEvent::Connect(peer) => info!(%peer, "peer connected"),
        CoreEvent::Disconnect(peer) => info!(%peer, "peer disconnected"),
        CoreEvent::Deliver { peer, payload } => info!(%peer, len = payload.len(), "message received"),
        CoreEvent::SendOk { peer, success, .. } => info!(%peer, success, "message done"),
        CoreEvent::Monitor { .. } => {}
    }
}

async fn stats_loop(commands: mpsc::UnboundedSender<Command>, every: Duration) {
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    loop {
        tick.tick().await;
        let (reply, rx) = oneshot::channel();
        if commands.send(Command::Statistics(reply)).is_err() {
            return;
        }
        let Ok(stats) = rx.await else {
            return;
        };
        for (name, value) in stats.into_iter().filter(|(_, v)| *v > 0) {
            info!(name, value, "statistic");
        }
    }
}

fn load_key(path: &Path) -> anyhow::Result<Keypair> {
    let text = std::fs::read_to_string(path).with_context(|| {
        format!("reading key {} (create one with --gen-key)", path.display())
    })?;
    let bytes = hex::decode(text.trim()).context("key file is not hex")?;
    let secret: [u8; 32] = match bytes.try_into() {
        Ok(s) => s,
        Err(_) => bail!("key file must hold 32 bytes"),
    };
    Ok(Keypair::from_secret_bytes(secret))
}

fn generate_key(path: &Path) -> anyhow::Result<Keypair> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let keypair = Keypair::generate();
    std::fs::write(path, hex::encode(keypair.secret_bytes()))
        .with_context(|| format!("writing key {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(keypair)
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
