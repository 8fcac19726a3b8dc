//! Parses the command line into a [`rvvm_machine::MachineConfig`], boots a
//! machine from it, and blocks on its event loop until guest power-off.

use clap::Parser;
use eyre::{eyre, Context, Result};
use rvvm_machine::config::{parse_memory_size, SerialBackend, StorageDevice, StorageKind};
use rvvm_machine::{Machine, MachineConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

mod cli;

use cli::Cli;

fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::fmt().with_env_filter(filter).with_target(false).init();
}

fn parse_resolution(text: &str) -> Result<(u32, u32)> {
    let (w, h) = text
        .split_once('x')
        .ok_or_else(|| eyre!("resolution {text:?} is not in WxH form"))?;
    Ok((
        w.parse().wrap_err_with(|| format!("bad width in {text:?}"))?,
        h.parse().wrap_err_with(|| format!("bad height in {text:?}"))?,
    ))
}

fn parse_serial(text: &str) -> Result<SerialBackend> {
    match text {
        "pty" => Ok(SerialBackend::Pty),
        "pipe" => Ok(SerialBackend::Pipe),
        "null" => Ok(SerialBackend::Null),
        other => Err(eyre!("unknown --serial backend {other:?}, expected pty/pipe/null")),
    }
}

fn build_config(cli: Cli) -> Result<MachineConfig> {
    let mut config = MachineConfig {
        memory_size: parse_memory_size(&cli.mem).wrap_err("invalid --mem value")?,
        hart_count: cli.smp,
        rv32: cli.rv32,
        kernel_path: cli.kernel.or(cli.firmware),
        dtb_path: cli.dtb,
        dumpdtb_path: cli.dumpdtb,
        cmdline: cli.cmdline.or(cli.append.clone()),
        append_cmdline: cli.cmdline.is_none() && cli.append.is_some(),
        nogui: cli.nogui,
        nonet: cli.nonet,
        noisolation: cli.noisolation,
        nojit: cli.nojit,
        gdbstub: cli.gdbstub,
        count_instructions: cli.count_instructions,
        ..MachineConfig::default()
    };

    for path in cli.nvme {
        config.storage.push(StorageDevice { path, kind: StorageKind::Nvme });
    }
    for path in cli.ata {
        config.storage.push(StorageDevice { path, kind: StorageKind::Ata });
    }
    for backend in &cli.serial {
        config.serial.push(parse_serial(backend)?);
    }
    if let Some(res) = &cli.res {
        config.framebuffer_resolution = Some(parse_resolution(res)?);
    }

    config.validate().wrap_err("invalid machine configuration")?;
    Ok(config)
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = build_config(cli)?;

    info!(
        harts = config.hart_count,
        memory = config.memory_size,
        rv32 = config.rv32,
        "starting machine"
    );

    let machine = Machine::create(config).wrap_err("failed to create machine")?;
    machine.start();
    machine.run_eventloop();
    Ok(())
}

fn main() {
    init_logger();
    if let Err(err) = run() {
        error!("{err:#}");
        std::process::exit(-1);
    }
}
