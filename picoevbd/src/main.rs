// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! PicoEVB / HTG-K800 DMA driver daemon
//!
//! Exposes the card's transfer engine through the `picoevb:` scheme. Each
//! open handle is a client session: write a request frame (operation code
//! plus request structure), then read back the filled-in structure.
//!
//! ```text
//!  client ──frame──▶ picoevb: scheme ──▶ Device ──▶ XDMA engine (BAR1)
//!         ◀─reply──                          │
//!                                            └──▶ GPIO (BAR0)
//!  irq:N ──▶ picoevb-irq thread ──▶ Device::handle_irq
//! ```
//!
//! Without hardware (or with `PICOEVB_SIMULATE=1`) the daemon attaches to a
//! simulated card, runs a transfer self-test against it and exits.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context};
use log::{error, info, LevelFilter};
use picoevb::control::{self, CardInfo, DmaRequest, LedRequest, Op, PinRequest, H2C2H_FLAG_SRC_IS_DEVICE};
use picoevb::peer::GPU_PAGE_SHIFT_DGPU;
use picoevb::sim::{SimCard, SimConfig};
use picoevb::DeviceVariant;
use redox_log::{OutputBuilder, RedoxLogger};

#[cfg(target_os = "redox")]
mod redox;
mod scheme;
mod stats;

use crate::scheme::PicoEvbScheme;
use crate::stats::DmaStats;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Force a variant instead of matching the PCI subsystem id
    pub variant: Option<String>,
    pub log_level: LevelFilter,
    /// Seconds between stats reports; 0 disables the reporter
    pub stats_interval_secs: u64,
    /// Scheme name to register
    pub scheme: String,
    /// PCI function to drive
    pub pci_path: String,
    /// Override the interrupt line from config space
    pub irq: Option<u8>,
    /// Attach to a simulated card instead of hardware
    pub simulate: bool,
    /// GPU page size of the simulated peer memory provider
    pub peer_page_shift: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            variant: None,
            log_level: LevelFilter::Info,
            stats_interval_secs: 10,
            scheme: "picoevb".to_string(),
            pci_path: "pci:vendor=10de,device=0001".to_string(),
            irq: None,
            simulate: !cfg!(target_os = "redox"),
            peer_page_shift: GPU_PAGE_SHIFT_DGPU,
        }
    }
}

fn main() {
    let config = parse_config();
    if let Err(err) = setup_logging(config.log_level) {
        eprintln!("picoevbd: failed to set up logging: {}", err);
    }
    info!("picoevbd v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration: {:?}", config);

    if let Err(err) = run(&config) {
        error!("{:#}", err);
        std::process::exit(1);
    }
}

fn setup_logging(level: LevelFilter) -> anyhow::Result<()> {
    let logger = RedoxLogger::new().with_output(
        OutputBuilder::stderr()
            .with_filter(level)
            .with_ansi_escape_codes()
            .flush_on_newline(true)
            .build(),
    );

    #[cfg(target_os = "redox")]
    let logger = match OutputBuilder::in_redox_logging_scheme("misc", "pcie", "picoevbd.log") {
        Ok(builder) => logger.with_output(builder.with_filter(level).flush_on_newline(true).build()),
        Err(err) => {
            eprintln!("picoevbd: failed to open log file: {}", err);
            logger
        }
    };

    logger
        .with_process_name("picoevbd".into())
        .enable()
        .map_err(|err| anyhow::anyhow!("{}", err))?;
    Ok(())
}

fn run(config: &DriverConfig) -> anyhow::Result<()> {
    let stats = Arc::new(DmaStats::new());
    if config.stats_interval_secs > 0 {
        spawn_stats_reporter(Arc::clone(&stats), Duration::from_secs(config.stats_interval_secs))?;
    }

    if config.simulate {
        return simulate(config, stats);
    }

    attach_hardware(config, stats)
}

#[cfg(target_os = "redox")]
fn attach_hardware(config: &DriverConfig, stats: Arc<DmaStats>) -> anyhow::Result<()> {
    let (variant, resources, irq) = redox::open_card(config)?;
    let device = Arc::new(picoevb::Device::new(variant, resources));
    device
        .spawn_irq_worker(irq)
        .context("failed to spawn interrupt worker")?;
    let scheme = PicoEvbScheme::new(device, stats);
    redox::serve(&scheme, &config.scheme)
}

#[cfg(not(target_os = "redox"))]
fn attach_hardware(_config: &DriverConfig, _stats: Arc<DmaStats>) -> anyhow::Result<()> {
    bail!("no hardware access on this platform; set PICOEVB_SIMULATE=1")
}

fn spawn_stats_reporter(stats: Arc<DmaStats>, interval: Duration) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("picoevb-stats".to_string())
        .spawn(move || loop {
            thread::sleep(interval);
            let report = stats.snapshot();
            if report.total_ops() == 0 {
                continue;
            }
            info!("PicoEVB transfer stats:");
            for line in report.to_string().lines() {
                info!("  {}", line);
            }
        })
        .context("failed to spawn stats thread")?;
    Ok(())
}

fn simulate(config: &DriverConfig, stats: Arc<DmaStats>) -> anyhow::Result<()> {
    let variant = match config.variant.as_deref() {
        Some(name) => DeviceVariant::from_name(name).with_context(|| format!("unknown variant '{}'", name))?,
        None => &DeviceVariant::PICOEVB,
    };
    let card = SimCard::new(SimConfig::new(variant).gpu(Some(4 << 20), config.peer_page_shift));
    let device = card.attach().context("failed to attach simulated card")?;
    let scheme = PicoEvbScheme::new(device, Arc::clone(&stats));

    let start = Instant::now();
    self_test(&scheme, &card)?;
    info!("self-test passed in {:?}", start.elapsed());
    for line in stats.snapshot().to_string().lines() {
        info!("  {}", line);
    }

    card.shutdown();
    Ok(())
}

/// Issue one request and return the response structure
fn request(scheme: &PicoEvbScheme, id: usize, op: Op, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    scheme
        .write(id, &control::frame(op, payload))
        .with_context(|| format!("{} request failed", op.name()))?;
    let mut buf = vec![0u8; op.payload_size()];
    let n = scheme.read(id, &mut buf, 0)?;
    buf.truncate(n);
    Ok(buf)
}

fn self_test(scheme: &PicoEvbScheme, card: &SimCard) -> anyhow::Result<()> {
    let id = scheme.open("")?;

    let info = CardInfo::from_bytes(&request(scheme, id, Op::CardInfo, &[0; CardInfo::SIZE])?)?;
    info!("card staging RAM: {} bytes", info.fpga_ram_size);

    request(scheme, id, Op::Led, &LedRequest { value: 0b01 }.to_bytes())?;
    ensure!(card.led() == 0b01, "LED register not written");

    // 1024x1024 image of (y << 16 | x) words
    let image: Vec<u8> = (0u32..1024)
        .flat_map(|y| (0u32..1024).map(move |x| ((y & 0xffff) << 16) | (x & 0xffff)))
        .flat_map(u32::to_ne_bytes)
        .collect();
    let len = image.len() as u64;
    let src = card.host().alloc(len)?;
    let dst = card.host().alloc(len)?;
    card.host().write(src, &image)?;

    let req = DmaRequest {
        src,
        dst,
        len,
        flags: 0,
        dma_time_ns: 0,
    };
    let resp = DmaRequest::from_bytes(&request(scheme, id, Op::H2c2hDma, &req.to_bytes())?)?;
    if card.host().read(dst, image.len())? != image {
        bail!("host to host copy mismatch");
    }
    info!(
        "h2c2h: {} bytes in {} ns ({} channel runs)",
        len,
        resp.dma_time_ns,
        card.runs()
    );

    if let Some(gpu) = card.gpu() {
        let gpu_len = 256 * 1024u64;
        let va = gpu.alloc(gpu_len)?;
        gpu.write(va, &image[..gpu_len as usize])?;

        let pin = PinRequest {
            va,
            size: gpu_len,
            handle: 0,
            pad: 0,
        };
        let pin = PinRequest::from_bytes(&request(scheme, id, Op::PinDevice, &pin.to_bytes())?)?;

        let out = card.host().alloc(gpu_len)?;
        let req = DmaRequest {
            src: u64::from(pin.handle),
            dst: out,
            len: gpu_len,
            flags: H2C2H_FLAG_SRC_IS_DEVICE,
            dma_time_ns: 0,
        };
        request(scheme, id, Op::H2c2hDma, &req.to_bytes())?;
        if card.host().read(out, gpu_len as usize)? != image[..gpu_len as usize] {
            bail!("gpu to host copy mismatch");
        }
        info!("gpu to host: {} bytes via handle {}", gpu_len, pin.handle);
    }

    scheme.close(id)?;
    Ok(())
}

/// Parse configuration from environment
fn parse_config() -> DriverConfig {
    let mut config = DriverConfig::default();

    if let Ok(val) = std::env::var("PICOEVB_VARIANT") {
        config.variant = Some(val);
    }

    if let Ok(val) = std::env::var("PICOEVB_LOG_LEVEL") {
        if let Ok(level) = val.parse() {
            config.log_level = level;
        }
    }

    if let Ok(val) = std::env::var("PICOEVB_STATS_INTERVAL_SECS") {
        if let Ok(n) = val.parse() {
            config.stats_interval_secs = n;
        }
    }

    if let Ok(val) = std::env::var("PICOEVB_SCHEME") {
        config.scheme = val;
    }

    if let Ok(val) = std::env::var("PICOEVB_PCI") {
        config.pci_path = val;
    }

    if let Ok(val) = std::env::var("PICOEVB_IRQ") {
        config.irq = val.parse().ok();
    }

    if let Ok(val) = std::env::var("PICOEVB_SIMULATE") {
        config.simulate = val == "1" || val.to_lowercase() == "true";
    }

    if let Ok(val) = std::env::var("PICOEVB_PEER_PAGE_SHIFT") {
        if let Ok(n) = val.parse() {
            config.peer_page_shift = n;
        }
    }

    config
}
