use std::fs::{File, OpenOptions};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vdxfer::adapters::{self, SimulatedHost, SimulatedInitiator};
use vdxfer::config::AppConfig;
use vdxfer::core::events::{self, TransferEvent};
use vdxfer::core::{NetworkConfig, PluginHost, StreamCopier, TransferSession};
use vdxfer::logging::{self, LogConfig, LogThrottle};
use vdxfer::rpc::RpcPluginHost;

#[derive(Parser)]
#[command(name = "vdxfer")]
#[command(about = "Copy virtual disk images over iSCSI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./vdxfer.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    settings: SettingsArgs,

    #[command(flatten)]
    network: NetworkArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a local image onto a disk
    Upload { vdi: String, image: PathBuf },
    /// Copy a disk out to a local file
    Download { vdi: String, output: PathBuf },
    /// Replace the master boot record of a disk
    WriteMbr { vdi: String, mbr: PathBuf },
}

#[derive(Args, Serialize)]
struct SettingsArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    connect_retry: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    retry_delay_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verify: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    simulation_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    plugin_endpoint: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    plugin_host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    json_logs: Option<bool>,
}

/// Network the transfer endpoint is attached to. DHCP unless `--ip` is given.
#[derive(Args)]
struct NetworkArgs {
    #[arg(long, global = true)]
    network: Option<String>,

    #[arg(long, global = true, requires = "network")]
    ip: Option<String>,

    #[arg(long, global = true, requires = "ip")]
    netmask: Option<String>,

    #[arg(long, global = true, requires = "ip")]
    gateway: Option<String>,
}

impl NetworkArgs {
    fn to_config(&self) -> Result<Option<NetworkConfig>> {
        let Some(network) = &self.network else {
            return Ok(None);
        };

        match (&self.ip, &self.netmask, &self.gateway) {
            (None, _, _) => Ok(Some(NetworkConfig::dhcp(network))),
            (Some(ip), Some(mask), Some(gateway)) => {
                Ok(Some(NetworkConfig::static_ip(network, ip, mask, gateway)))
            }
            _ => bail!("--ip needs both --netmask and --gateway"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.config.as_deref(), Some(&cli.settings))?;
    logging::init(LogConfig::from_app_config(&config));

    let network = cli.network.to_config()?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    let host: Box<dyn PluginHost> = match config.plugin_endpoint {
        Some(addr) => {
            info!(%addr, host = %config.plugin_host, "Using remote plugin service");
            Box::new(RpcPluginHost::new(addr, config.plugin_host.clone()))
        }
        None => {
            debug!("No plugin endpoint configured, using simulated host");
            Box::new(SimulatedHost::default())
        }
    };

    let ctx = Ctx {
        config: &config,
        host: host.as_ref(),
        network,
        cancel,
    };

    match &cli.command {
        Commands::Upload { vdi, image } => run_upload(&ctx, vdi, image)
            .await
            .with_context(|| format!("Failed to upload {} to {}", image.display(), vdi))?,
        Commands::Download { vdi, output } => run_download(&ctx, vdi, output)
            .await
            .with_context(|| format!("Failed to download {} to {}", vdi, output.display()))?,
        Commands::WriteMbr { vdi, mbr } => run_write_mbr(&ctx, vdi, mbr)
            .await
            .with_context(|| format!("Failed to write master boot record to {}", vdi))?,
    }

    Ok(())
}

struct Ctx<'a> {
    config: &'a AppConfig,
    host: &'a dyn PluginHost,
    network: Option<NetworkConfig>,
    cancel: CancellationToken,
}

impl Ctx<'_> {
    fn session(&self, vdi: &str) -> TransferSession<SimulatedInitiator> {
        let initiator = adapters::simulated_initiator(&self.config.simulation_dir, vdi);
        let mut session =
            TransferSession::new(initiator, self.config.session_settings(), self.cancel.clone());
        if let Some(network) = &self.network {
            session.configure_network(network.clone());
        }
        session
    }
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Interrupted, cancelling transfer");
        cancel.cancel();
    }
}

/// Log transfer events as they arrive, progress at most every few seconds.
async fn report_events(mut rx: mpsc::UnboundedReceiver<TransferEvent>) {
    let throttle = LogThrottle::new(Duration::from_secs(5));

    while let Some(event) = rx.recv().await {
        let detail = event.detail();
        match &event {
            TransferEvent::Start(_) => {
                info!(bytes_total = detail.bytes_total, "{}", detail.message);
            }
            TransferEvent::Progress(_) => {
                if throttle.should_log() {
                    info!(
                        percent = event.percentage(),
                        bytes_done = detail.bytes_done,
                        "{}",
                        detail.message
                    );
                }
            }
            TransferEvent::Complete(_) => {
                info!(bytes_done = detail.bytes_done, "{}: {}", detail.label, detail.message);
            }
        }
    }
}

/// Connect, run `op` against the opened disk, then tear the session down.
///
/// Teardown runs whatever `op` returned; its own failure is only reported
/// when `op` succeeded.
async fn with_disk<T, F>(ctx: &Ctx<'_>, vdi: &str, read_only: bool, op: F) -> Result<T>
where
    F: FnOnce(&mut TransferSession<SimulatedInitiator>) -> Result<T>,
{
    let mut session = ctx.session(vdi);

    let result = match session.connect(ctx.host, vdi, read_only).await {
        Ok(_) => tokio::task::block_in_place(|| op(&mut session)),
        Err(e) => Err(e.into()),
    };

    let teardown = session.disconnect(ctx.host).await;
    match (result, teardown) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e).context("Failed to release transfer endpoint"),
        (Err(e), Err(teardown)) => {
            warn!(error = %teardown, "Failed to release transfer endpoint");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
    }
}

async fn run_upload(ctx: &Ctx<'_>, vdi: &str, image: &Path) -> Result<()> {
    let mut source =
        File::open(image).with_context(|| format!("Failed to open {}", image.display()))?;
    let source_len = source.metadata()?.len();
    ensure_simulated_image(&ctx.config.simulation_dir, vdi, source_len)?;

    let label = file_label(image);
    let verify = ctx.config.verify;
    let (tx, rx) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(report_events(rx));

    let result = with_disk(ctx, vdi, false, |session| {
        let mut copier = StreamCopier::new(ctx.cancel.clone());
        let disk = session
            .disk()
            .context("Disk was not opened after connect")?;

        let digest = copier.copy(&mut source, disk, &label, verify, events::forward_to(tx.clone()))?;

        if let Some(digest) = digest {
            copier.verify(disk, &label, &digest, events::forward_to(tx.clone()))?;
            info!(digest = %digest, "Verified upload");
        }
        Ok(())
    })
    .await;

    drop(tx);
    if let Err(e) = reporter.await {
        warn!(error = %e, "Event reporter task failed");
    }
    result
}

async fn run_download(ctx: &Ctx<'_>, vdi: &str, output: &Path) -> Result<()> {
    let mut destination = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;

    let label = file_label(output);
    let (tx, rx) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(report_events(rx));

    let result = with_disk(ctx, vdi, true, |session| {
        let mut copier = StreamCopier::new(ctx.cancel.clone());
        let disk = session
            .disk()
            .context("Disk was not opened after connect")?;

        copier.copy(disk, &mut destination, &label, false, events::forward_to(tx.clone()))?;

        // Skipped zero blocks leave a short file; extend it to the disk size.
        destination.set_len(copier.length())?;
        Ok(())
    })
    .await;

    drop(tx);
    if let Err(e) = reporter.await {
        warn!(error = %e, "Event reporter task failed");
    }
    result
}

async fn run_write_mbr(ctx: &Ctx<'_>, vdi: &str, mbr: &Path) -> Result<()> {
    let mut source =
        File::open(mbr).with_context(|| format!("Failed to open {}", mbr.display()))?;

    with_disk(ctx, vdi, false, |session| Ok(session.write_mbr(&mut source)?)).await
}

/// The simulated initiator serves `<vdi>.img`; create it at the size of the
/// upload if it does not exist yet.
fn ensure_simulated_image(simulation_dir: &Path, vdi: &str, len: u64) -> Result<()> {
    let path = adapters::image_path(simulation_dir, vdi);
    if path.exists() {
        return Ok(());
    }

    std::fs::create_dir_all(simulation_dir)
        .with_context(|| format!("Failed to create {}", simulation_dir.display()))?;
    let file = File::create(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.set_len(len)?;
    debug!(path = %path.display(), bytes = len, "Created simulated disk image");
    Ok(())
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
