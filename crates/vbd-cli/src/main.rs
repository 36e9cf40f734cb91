#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::bounded;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vbd::{
    BackendMode, BlockRequest, Completion, Device, DeviceConfig, DeviceStatus, FileStoreResolver,
    SECTOR_SIZE, Sector, StoreResolver,
};

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

/// Virtual block device with memory, proxy and mirrored backends.
#[derive(Parser, Debug)]
#[command(name = "vbd", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a zero-filled backing store file.
    Mkstore {
        path: PathBuf,
        /// Size in MiB.
        #[arg(long, default_value_t = vbd::DEFAULT_CAPACITY_MIB)]
        size_mib: u64,
    },
    /// Start the device and print its status.
    Status {
        #[command(flatten)]
        device: DeviceArgs,
        #[arg(long)]
        json: bool,
    },
    /// Start the device, write a pattern and verify it reads back.
    Selftest {
        #[command(flatten)]
        device: DeviceArgs,
        /// Reconfigure to this mode after the first pass and verify again.
        #[arg(long)]
        then: Option<BackendMode>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct DeviceArgs {
    /// JSON device configuration; flags override its fields.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Backend: memory, proxy or mirror (0, 1, 2 also accepted).
    #[arg(long)]
    mode: Option<BackendMode>,
    /// Device size in MiB.
    #[arg(long)]
    capacity_mib: Option<u64>,
    /// Backing store for proxy mode.
    #[arg(long)]
    proxy: Option<String>,
    /// Comma-separated backing stores for mirror mode.
    #[arg(long)]
    mirrors: Option<String>,
}

impl DeviceArgs {
    fn load(&self) -> Result<DeviceConfig> {
        let mut config = match &self.config {
            Some(path) => read_config(path)?,
            None => DeviceConfig::default(),
        };
        if let Some(mode) = self.mode {
            config.mode = Some(mode);
        }
        if let Some(capacity_mib) = self.capacity_mib {
            config.capacity_mib = capacity_mib;
        }
        if let Some(proxy) = &self.proxy {
            config.proxy_path = Some(proxy.clone());
        }
        if let Some(mirrors) = &self.mirrors {
            config
                .set_mirror_list(mirrors)
                .context("invalid --mirrors list")?;
        }
        config.validate().context("invalid device configuration")?;
        Ok(config)
    }
}

fn read_config(path: &Path) -> Result<DeviceConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse config {}", path.display()))
}

fn main() {
    init_tracing();
    if let Err(error) = run(Cli::parse()) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Mkstore { path, size_mib } => mkstore(&path, size_mib),
        Command::Status { device, json } => status_cmd(&device, json),
        Command::Selftest { device, then, json } => selftest(&device, then, json),
    }
}

fn mkstore(path: &Path, size_mib: u64) -> Result<()> {
    let bytes = size_mib
        .checked_mul(1 << 20)
        .with_context(|| format!("{size_mib} MiB overflows"))?;
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.set_len(bytes)
        .with_context(|| format!("failed to size {}", path.display()))?;
    info!(path = %path.display(), size_mib, "backing store created");
    Ok(())
}

fn open_device(args: &DeviceArgs) -> Result<Device> {
    let config = args.load()?;
    let resolver: Arc<dyn StoreResolver> = Arc::new(FileStoreResolver::new());
    let device = Device::new(config, resolver);
    device.start().context("device create failed")?;
    Ok(device)
}

fn status_cmd(args: &DeviceArgs, json: bool) -> Result<()> {
    let device = open_device(args)?;
    print_status(&device.status(), json)?;
    device.shutdown();
    Ok(())
}

#[derive(Debug, Serialize)]
struct SelftestReport {
    passes: Vec<PassReport>,
    status: DeviceStatus,
}

#[derive(Debug, Serialize)]
struct PassReport {
    mode: Option<BackendMode>,
    sectors_verified: u64,
}

fn selftest(args: &DeviceArgs, then: Option<BackendMode>, json: bool) -> Result<()> {
    let device = open_device(args)?;
    let mut passes = vec![verify_pass(&device, 0xA5)?];
    if let Some(mode) = then {
        device
            .reconfigure(Some(mode))
            .with_context(|| format!("reconfigure to {mode} failed"))?;
        passes.push(verify_pass(&device, 0x5A)?);
    }
    let report = SelftestReport {
        passes,
        status: device.status(),
    };
    device.shutdown();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        for pass in &report.passes {
            let mode = pass.mode.map_or("none", BackendMode::as_str);
            println!("pass ok: mode={mode} sectors_verified={}", pass.sectors_verified);
        }
        print_status(&report.status, false)?;
    }
    Ok(())
}

/// Write `pattern` to the first and last sector, then read both back.
fn verify_pass(device: &Device, pattern: u8) -> Result<PassReport> {
    let capacity = device.capacity();
    if capacity.is_zero() {
        bail!("device has no capacity");
    }
    let mut targets = vec![Sector::ZERO];
    if capacity.0 > 1 {
        targets.push(Sector(capacity.0 - 1));
    }
    for &sector in &targets {
        submit(device, |cb| {
            BlockRequest::write(sector, vec![pattern; SECTOR_SIZE], cb)
        })
        .with_context(|| format!("write at sector {sector} failed"))?;
        let data = submit(device, |cb| BlockRequest::read(sector, 1, cb))
            .with_context(|| format!("read at sector {sector} failed"))?;
        if data.iter().any(|b| *b != pattern) {
            bail!("sector {sector} read back different data");
        }
    }
    Ok(PassReport {
        mode: device.mode(),
        sectors_verified: targets.len() as u64,
    })
}

/// Dispatch one request and wait for its completion.
fn submit(
    device: &Device,
    build: impl FnOnce(Completion) -> vbd::Result<BlockRequest>,
) -> Result<Vec<u8>> {
    let (tx, rx) = bounded(1);
    let request = build(Box::new(move |status, buf| {
        let _ = tx.send((status, buf));
    }))?;
    device.dispatch(request);
    let (status, buf) = rx
        .recv_timeout(COMPLETION_TIMEOUT)
        .context("request did not complete")?;
    status?;
    Ok(buf)
}

fn print_status(status: &DeviceStatus, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(status).context("serialize status")?
        );
        return Ok(());
    }
    println!("state: {}", status.state);
    println!(
        "mode: {}",
        status.mode.map_or("none", BackendMode::as_str)
    );
    println!("capacity_sectors: {}", status.capacity_sectors);
    println!("in_flight: {}", status.in_flight);
    let m = &status.metrics;
    println!(
        "requests: admitted={} ok={} err={} rejected={}",
        m.admitted, m.completed_ok, m.completed_err, m.rejected
    );
    println!(
        "bytes: read={} written={}",
        m.bytes_read, m.bytes_written
    );
    Ok(())
}
