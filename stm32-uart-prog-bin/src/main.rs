mod cli;
mod duration;
mod hexfile;
mod logging;
mod ports;
mod progress;

use std::path::Path;
use std::time::Duration as StdDuration;

use anyhow::Context;
use clap::Parser;
use log::info;

use stm32_uart_prog::config::SessionConfig;
use stm32_uart_prog::image::{FirmwareImage, FLASH_SECTORS};
use stm32_uart_prog::link::SerialLink;
use stm32_uart_prog::protocol::CHUNK_SIZE;
use stm32_uart_prog::session::{self, OperatorPrompt};

const SERIAL_OPEN_TIMEOUT: StdDuration = StdDuration::from_millis(100);

struct CliPrompt;

impl OperatorPrompt for CliPrompt {
    fn confirm(&mut self, message: &str) -> bool {
        ports::confirm(message)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    logging::init(cli.loglvl.into(), Path::new("./logs")).context("setting up logging")?;

    match run(cli) {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: cli::Cli) -> anyhow::Result<()> {
    let targets = cli::resolve_targets(&cli.targets);
    if targets.is_empty() {
        anyhow::bail!("no targets resolved from --targets");
    }

    if !stm32_uart_prog::autotune::REFERENCE_BAUDS.contains(&cli.baudrate)
        && !ports::confirm(&format!(
            "Baudrate {} does not fit into {:?}. Continue?",
            cli.baudrate,
            stm32_uart_prog::autotune::REFERENCE_BAUDS
        ))
    {
        anyhow::bail!("provide a proper baudrate");
    }

    let hex = hexfile::load(&cli.hexfile)?;
    if hex.min_addr != cli.address
        && !ports::confirm(&format!(
            "Non-default application start address detected: from hexfile - 0x{:08X}, from args - 0x{:08X}. Continue?",
            hex.min_addr, cli.address
        ))
    {
        anyhow::bail!("check addresses match");
    }

    let image = FirmwareImage::new(hex.data, hex.min_addr, hex.max_addr).context("validating firmware image")?;

    let port_name = ports::select_port()?;
    let mut link = SerialLink::open(&port_name, cli.baudrate, SERIAL_OPEN_TIMEOUT).context("opening serial port")?;

    let config = SessionConfig {
        targets: targets.clone(),
        attempts_erase: cli.attempts_erase,
        attempts_cmd: cli.attempts,
        start_address: cli.address,
        nominal_baud: cli.baudrate,
        no_tune: cli.no_tune,
        tune_threshold: cli.tune_threshold,
    };

    let chunks_per_target: usize = image
        .used_sectors
        .iter()
        .map(|&i| FLASH_SECTORS[i].size as usize / CHUNK_SIZE)
        .sum();
    let total_chunks = (chunks_per_target * targets.len()) as u64;

    let mut sink = progress::IndicatifSink::new(total_chunks);
    let mut prompt = CliPrompt;

    let summary = session::run_session(&config, &image, &mut link, &mut sink, &mut prompt);
    sink.finish();

    let summary = match summary {
        Ok(summary) => summary,
        Err(e) => {
            println!("\nOperation cancelled: {e}");
            return Ok(());
        }
    };

    println!("\nProgramming summary:");
    for (id, status) in &summary.results {
        println!("\tDevice ID {id}: {status}");
    }
    let elapsed_str = duration::format_duration(summary.elapsed);
    println!("\tProcess duration: {elapsed_str}");
    info!("programming session ended, time taken: {elapsed_str}");
    info!(
        "final statuses: {:?}",
        summary.results.iter().map(|(id, s)| (*id, s.to_string())).collect::<Vec<_>>()
    );

    Ok(())
}
