use std::time::Duration;

use log::{error, info, warn};

use crate::autotune::{self, DEFAULT_SYNC_REQUESTS, DEFAULT_TUNE_REQUESTS};
use crate::config::SessionConfig;
use crate::error::{ProgError, Result};
use crate::frame;
use crate::image::FirmwareImage;
use crate::link::SerialLink;
use crate::protocol::{BootloaderEngine, COMMAND_SET, CHUNK_SIZE, SUPPORTED_DEVICE_IDS};
use crate::status::TargetStatus;

const MUTE_RETRY_ATTEMPTS: usize = 20;
const MUTE_RETRY_DELAY: Duration = Duration::from_millis(500);
const GO_RETRY_DELAY: Duration = Duration::from_millis(500);
const ERASE_ATTEMPT_SETTLE: Duration = Duration::from_millis(100);
const CHUNK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Receives monotone-durable chunk progress credits from the pipeline. A
/// failed sector attempt's credits are rolled back before the next attempt
/// starts, so implementations only ever see forward progress.
pub trait ProgressSink {
    fn credit(&mut self, chunks: usize);
    fn rollback(&mut self, chunks: usize);
    fn set_sector(&mut self, target_id: u16, sector_index: usize, sector_ordinal: usize, total_sectors: usize);
    fn write_line(&mut self, message: &str);
}

/// No-op sink for callers that don't render progress (used by tests).
#[derive(Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn credit(&mut self, _chunks: usize) {}
    fn rollback(&mut self, _chunks: usize) {}
    fn set_sector(&mut self, _target_id: u16, _sector_index: usize, _sector_ordinal: usize, _total_sectors: usize) {}
    fn write_line(&mut self, _message: &str) {}
}

/// Retries `action` up to `attempts` times with `delay` between tries,
/// returning the last error if every attempt fails.
fn retry(mut action: impl FnMut() -> Result<()>, attempts: usize, delay: Duration) -> Result<()> {
    let mut last_err = None;
    for attempt in 0..attempts {
        match action() {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("attempt {}/{attempts} failed: {e}", attempt + 1);
                last_err = Some(e);
                std::thread::sleep(delay);
            }
        }
    }
    Err(last_err.expect("attempts is always > 0"))
}

/// Drives the full per-target sequence: mute the bus, enter the
/// bootloader, synchronize framing/baud, identify the device, erase and
/// program every sector the image touches, verify it, then start the new
/// application. Never propagates anything but a hard link failure; the
/// returned status is always the caller-facing outcome.
pub fn program_target(
    config: &SessionConfig,
    image: &FirmwareImage,
    link: &mut SerialLink,
    target_id: u16,
    progress: &mut dyn ProgressSink,
) -> TargetStatus {
    let engine = BootloaderEngine::new(target_id);

    match run(config, image, link, &engine, progress) {
        Ok(status) => status,
        Err(e) => {
            error!("target ID{target_id}: programming failed: {e}");
            progress.write_line(&format!("target ID{target_id}: programming failed ({e})"));
            TargetStatus::Fail
        }
    }
}

fn run(
    config: &SessionConfig,
    image: &FirmwareImage,
    link: &mut SerialLink,
    engine: &BootloaderEngine,
    progress: &mut dyn ProgressSink,
) -> Result<TargetStatus> {
    let target_id = engine.target_id();

    // Step 1: probe. If the target already acknowledges, it is assumed to
    // already be in the bootloader and muting/entering are skipped.
    let already_in_bootloader = engine.activate(link);

    if !already_in_bootloader {
        // Steps 2-3: mute the bus, then address this target specifically.
        retry(|| frame::mute(link), MUTE_RETRY_ATTEMPTS, MUTE_RETRY_DELAY)?;
        retry(
            || frame::enter_bootloader(link, target_id),
            MUTE_RETRY_ATTEMPTS,
            MUTE_RETRY_DELAY,
        )?;
    }

    // Step 4: activation-based sync, always run.
    let baud = autotune::sync_by_activation(link, config.nominal_baud, config.tune_threshold, DEFAULT_SYNC_REQUESTS)?;
    link.set_baud(baud)?;
    info!("target ID{target_id}: synchronized at {baud} baud");

    // Step 5: command-based tune, only if enabled.
    if !config.no_tune {
        let tuned = autotune::tune_by_commands(
            link,
            engine,
            baud,
            config.tune_threshold,
            DEFAULT_TUNE_REQUESTS,
        )?;
        link.set_baud(tuned)?;
        info!("target ID{target_id}: tuned to {tuned} baud");
    }

    // Step 6: identify the device.
    let pid = engine.get_pid(link);
    if pid == 0 || !SUPPORTED_DEVICE_IDS.contains(&pid) {
        return Err(ProgError::UnsupportedDevice(format!("product id 0x{pid:04X}")));
    }

    // Step 7: confirm the required command set is present.
    let supported = engine.get_commands(link);
    for &op in COMMAND_SET.iter() {
        if !supported.contains(&op) {
            return Err(ProgError::UnsupportedDevice(format!(
                "required bootloader command not supported: 0x{op:02X}"
            )));
        }
    }
    info!("target ID{target_id}: supported commands {supported:02X?}");

    // Step 8: erase/program/verify every sector the image touches.
    let mut warned = false;
    for (ordinal, &sector_index) in image.used_sectors.iter().enumerate() {
        progress.set_sector(target_id, sector_index, ordinal + 1, image.used_sectors.len());
        let outcome = program_sector(config, image, link, engine, sector_index, progress)?;
        warned |= outcome;
    }

    // Step 9: start the new application.
    retry(
        || {
            if engine.start_application(link, config.start_address) {
                Ok(())
            } else {
                Err(ProgError::Protocol("GO command was not acknowledged".into()))
            }
        },
        config.attempts_cmd,
        GO_RETRY_DELAY,
    )?;
    info!("target ID{target_id}: application started at 0x{:08X}", config.start_address);

    Ok(if warned { TargetStatus::Warning } else { TargetStatus::Success })
}

/// Runs the outer erase-attempt loop for one sector. Returns `Ok(true)` if
/// the sector needed any retry along the way (status degrades to
/// `Warning`), `Ok(false)` if everything succeeded on the first try, or
/// `Err` if every erase attempt was exhausted (status becomes `Fail` and
/// no further sectors are attempted).
fn program_sector(
    config: &SessionConfig,
    image: &FirmwareImage,
    link: &mut SerialLink,
    engine: &BootloaderEngine,
    sector_index: usize,
    progress: &mut dyn ProgressSink,
) -> Result<bool> {
    let sector = crate::image::FLASH_SECTORS[sector_index];
    let chunks = sector.size as usize / CHUNK_SIZE;
    let mut any_retry = false;

    for erase_attempt in 1..=config.attempts_erase {
        std::thread::sleep(ERASE_ATTEMPT_SETTLE);
        link.reset_input();

        if !engine.erase_sector(link, sector_index as u16) {
            any_retry = true;
            warn!("sector {sector_index}: erase attempt {erase_attempt}/{} failed", config.attempts_erase);
            progress.write_line(&format!(
                "retry sector {sector_index}, erase attempt {erase_attempt}/{}",
                config.attempts_erase
            ));
            continue;
        }

        match program_sector_chunks(config, image, link, engine, &sector, chunks, progress) {
            Ok(chunk_retried) => {
                progress.write_line(&format!("sector {sector_index} (0x{:08X}) verified", sector.start));
                return Ok(any_retry || chunk_retried);
            }
            Err(credited) => {
                any_retry = true;
                progress.rollback(credited);
                error!("sector {sector_index}: attempt {erase_attempt} failed");
                progress.write_line(&format!(
                    "retry sector {sector_index}, attempt {erase_attempt}/{}",
                    config.attempts_erase
                ));
            }
        }
    }

    error!("sector {sector_index}: failed permanently after {} erase attempts", config.attempts_erase);
    Err(ProgError::Protocol(format!("sector {sector_index} could not be programmed")))
}

/// Writes and verifies every chunk of `sector`. On success, returns whether
/// any chunk needed a retry. On failure, returns the number of chunks that
/// were credited during this attempt so the caller can roll them back.
fn program_sector_chunks(
    config: &SessionConfig,
    image: &FirmwareImage,
    link: &mut SerialLink,
    engine: &BootloaderEngine,
    sector: &crate::image::Sector,
    chunks: usize,
    progress: &mut dyn ProgressSink,
) -> std::result::Result<bool, usize> {
    let mut credited = 0usize;
    let mut any_retry = false;

    for i in 0..chunks {
        let chunk_start = sector.start + (i * CHUNK_SIZE) as u32;
        let chunk = image.chunk(chunk_start, CHUNK_SIZE);

        if chunk.iter().all(|&b| b == crate::image::PAD_BYTE) {
            progress.credit(1);
            credited += 1;
            continue;
        }

        match write_chunk_with_retry(config, link, engine, chunk_start, &chunk) {
            Some(retried) => any_retry |= retried,
            None => {
                progress.write_line(&format!("sector {}: write failed at 0x{chunk_start:08X}", sector.start));
                return Err(credited);
            }
        }

        match verify_chunk_with_retry(config, link, engine, chunk_start, &chunk) {
            Some(retried) => {
                progress.credit(1);
                credited += 1;
                any_retry |= retried;
            }
            None => {
                progress.write_line(&format!("sector {}: verify failed at 0x{chunk_start:08X}", sector.start));
                return Err(credited);
            }
        }
    }

    Ok(any_retry)
}

/// Writes one chunk, retrying up to `attempts_cmd` times. On each failed
/// attempt, resyncs and reasserts activation if the resync itself fails.
/// Returns `Some(needed_retry)` on success, `None` once retries are
/// exhausted.
fn write_chunk_with_retry(
    config: &SessionConfig,
    link: &mut SerialLink,
    engine: &BootloaderEngine,
    addr: u32,
    data: &[u8],
) -> Option<bool> {
    for attempt in 0..config.attempts_cmd {
        if engine.write_mem(link, addr, data) {
            return Some(attempt > 0);
        }
        warn!(
            "write failed ({}/{}) at 0x{addr:08X}",
            attempt + 1,
            config.attempts_cmd
        );
        if !engine.probe_bootloader(link, Duration::from_secs(1), Duration::from_millis(10)) {
            engine.activate(link);
        }
        std::thread::sleep(CHUNK_RETRY_DELAY);
    }
    None
}

/// Reads back one chunk and compares it, retrying up to `attempts_cmd`
/// times. Returns `Some(needed_retry)` on a byte-exact match, `None` once
/// retries are exhausted.
fn verify_chunk_with_retry(
    config: &SessionConfig,
    link: &mut SerialLink,
    engine: &BootloaderEngine,
    addr: u32,
    expected: &[u8],
) -> Option<bool> {
    for attempt in 0..config.attempts_cmd {
        if engine.read_mem(link, addr, expected.len()) == expected {
            return Some(attempt > 0);
        }
        warn!(
            "verify failed ({}/{}) at 0x{addr:08X}",
            attempt + 1,
            config.attempts_cmd
        );
        std::thread::sleep(CHUNK_RETRY_DELAY);
    }
    None
}
