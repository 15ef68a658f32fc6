// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command line harness for the FPGA memory window, the XDMA channels and the
//! PCIe BAR.

// UNSAFETY: Issuing cache maintenance ioctls on user-supplied operands.
#![expect(unsafe_code)]

use anyhow::Context;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use fpgamem_defs::CacheOp;
use fpgamem_defs::DEVICE_PATH;
use fpgamem_sys::bar::BarWindow;
use fpgamem_sys::FpgaMemDevice;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;
use xdma_shim::HardwareContext;
use xdma_shim::XdmaDevice;

const LOG_ENV: &str = "FPGACTL_LOG";

#[derive(Parser)]
#[clap(name = "fpgactl", about = "Exercise Enzian FPGA memory and XDMA channels")]
struct Options {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read one word of FPGA memory
    Read {
        #[clap(flatten)]
        window: WindowArgs,
        /// Byte offset into the window
        #[clap(long, value_parser = parse_number)]
        offset: u64,
    },
    /// Write one word of FPGA memory
    Write {
        #[clap(flatten)]
        window: WindowArgs,
        /// Byte offset into the window
        #[clap(long, value_parser = parse_number)]
        offset: u64,
        #[clap(long, value_parser = parse_number)]
        value: u64,
        /// Number of times to repeat the store
        #[clap(long, default_value_t = 1)]
        repeat: u32,
    },
    /// Issue a cache maintenance operation through the device ioctl
    Cache {
        #[clap(long, default_value = DEVICE_PATH)]
        device: PathBuf,
        /// Operation name (for example `hit-wbinv`) or number
        #[clap(value_parser = parse_cache_op)]
        op: CacheOp,
        /// Address or set/way operand
        #[clap(value_parser = parse_number)]
        arg: u64,
    },
    /// Run one request/response exchange over XDMA
    Xdma {
        /// Response size in bytes
        #[clap(long, value_parser = parse_number)]
        input_size: u64,
        /// Request size in bytes
        #[clap(long, value_parser = parse_number)]
        output_size: u64,
        /// Value written to every word of the request
        #[clap(long, value_parser = parse_number, default_value = "0")]
        fill: u64,
        #[clap(long, default_value = xdma_shim::DEFAULT_H2C_PATH)]
        h2c: PathBuf,
        #[clap(long, default_value = xdma_shim::DEFAULT_C2H_PATH)]
        c2h: PathBuf,
        /// Give up after this many milliseconds
        #[clap(long)]
        timeout_ms: Option<u64>,
    },
    /// Access the FPGA's PCIe BAR 0
    Bar {
        #[clap(long, default_value = "0004:90:00.0")]
        pci_id: String,
        #[clap(subcommand)]
        op: BarCommand,
    },
}

#[derive(Subcommand)]
enum BarCommand {
    /// Store words to the start of the BAR, two at a time
    Write {
        #[clap(value_parser = parse_number, required = true)]
        words: Vec<u64>,
    },
    /// Load the pair of words at a 16-byte index
    Read { index: usize },
}

#[derive(Args)]
struct WindowArgs {
    #[clap(long, default_value = DEVICE_PATH)]
    device: PathBuf,
    /// Bytes of the window to map
    #[clap(long, value_parser = parse_number, default_value = "0x400000000")]
    window: u64,
}

impl WindowArgs {
    fn map(&self, offset: u64) -> anyhow::Result<(fpgamem_sys::FpgaMapping, usize)> {
        anyhow::ensure!(offset % 8 == 0, "offset {offset:#x} is not word aligned");
        anyhow::ensure!(
            offset.checked_add(8).is_some_and(|end| end <= self.window),
            "offset {offset:#x} is outside the {:#x} byte window",
            self.window
        );
        let len = usize::try_from(self.window).context("window too large")?;
        let device = FpgaMemDevice::open_path(&self.device)
            .with_context(|| format!("failed to open {}", self.device.display()))?;
        let mapping = device.map(len).context("failed to map fpga memory")?;
        Ok((mapping, offset as usize))
    }
}

/// Parse a number from a string that could be prefixed with 0x to indicate hex.
fn parse_number(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(rest) => u64::from_str_radix(rest, 16),
        None => s.parse::<u64>(),
    }
}

fn parse_cache_op(s: &str) -> anyhow::Result<CacheOp> {
    if let Some(op) = CacheOp::from_name(s) {
        return Ok(op);
    }
    let n = parse_number(s).with_context(|| {
        let names: Vec<_> = CacheOp::ALL.iter().map(|op| op.name()).collect();
        format!("expected a number or one of {}", names.join(", "))
    })?;
    Ok(CacheOp::try_from(i64::try_from(n)?)?)
}

fn main() -> anyhow::Result<()> {
    let opts = Options::parse();
    let filter = if std::env::var(LOG_ENV).is_ok() {
        EnvFilter::try_from_env(LOG_ENV).with_context(|| format!("invalid {LOG_ENV}"))?
    } else {
        EnvFilter::default().add_directive(LevelFilter::INFO.into())
    };
    tracing_subscriber::fmt()
        .log_internal_errors(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let r = run(opts.command);
    if let Err(err) = &r {
        tracing::error!(
            error = err.as_ref() as &dyn std::error::Error,
            "command failed"
        );
    }
    r
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Read { window, offset } => {
            let (mapping, offset) = window.map(offset)?;
            let start = Instant::now();
            let value = mapping.read_u64(offset);
            let elapsed = start.elapsed();
            println!("{value:#018x}");
            tracing::info!(offset, elapsed_ns = elapsed.as_nanos() as u64, "read");
        }
        Command::Write {
            window,
            offset,
            value,
            repeat,
        } => {
            let (mapping, offset) = window.map(offset)?;
            let start = Instant::now();
            for _ in 0..repeat {
                mapping.write_u64(offset, value);
            }
            let elapsed = start.elapsed();
            tracing::info!(
                offset,
                repeat,
                elapsed_ns = elapsed.as_nanos() as u64,
                "write"
            );
        }
        Command::Cache { device, op, arg } => {
            let device = FpgaMemDevice::open_path(&device)
                .with_context(|| format!("failed to open {}", device.display()))?;
            // SAFETY: the operand is supplied by the user, who takes
            // responsibility for what the operation discards.
            unsafe { device.cache_op(op, arg) }?;
            tracing::info!(%op, arg, "cache maintenance done");
        }
        Command::Xdma {
            input_size,
            output_size,
            fill,
            h2c,
            c2h,
            timeout_ms,
        } => {
            let input_size = usize::try_from(input_size)?;
            let output_size = usize::try_from(output_size)?;
            let mut backend = XdmaDevice::new().with_h2c_path(h2c).with_c2h_path(c2h);
            let mut ctx = HardwareContext::initialize_with(&mut backend, input_size, output_size)
                .context("failed to initialize xdma context")?;
            for word in ctx.output_mut().chunks_mut(8) {
                let len = word.len();
                word.copy_from_slice(&fill.to_le_bytes()[..len]);
            }

            let start = Instant::now();
            let result = match timeout_ms {
                Some(ms) => {
                    let deadline = start + Duration::from_millis(ms);
                    ctx.run_with_deadline(input_size, output_size, deadline)
                }
                None => ctx.run(input_size, output_size),
            };
            result.context("xdma transfer failed")?;
            let elapsed = start.elapsed();

            for word in ctx.input().chunks(8) {
                let mut bytes = [0; 8];
                bytes[..word.len()].copy_from_slice(word);
                println!("{:#018x}", u64::from_le_bytes(bytes));
            }
            tracing::info!(
                input_size,
                output_size,
                elapsed_ns = elapsed.as_nanos() as u64,
                "xdma run"
            );
            ctx.close();
        }
        Command::Bar { pci_id, op } => {
            let bar = BarWindow::open(&pci_id)?;
            match op {
                BarCommand::Write { words } => bar.write_words(&words)?,
                BarCommand::Read { index } => {
                    let [lo, hi] = bar.read_pair(index)?;
                    println!("{lo:#018x} {hi:#018x}");
                }
            }
        }
    }
    Ok(())
}
