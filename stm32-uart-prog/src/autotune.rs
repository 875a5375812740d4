use std::collections::HashSet;
use std::time::Duration;

use log::info;

use crate::error::{ProgError, Result};
use crate::link::SerialLink;
use crate::protocol::{BootloaderEngine, ACK, NACK};

/// Reference baud rates known to real hardware, used as extra centers for
/// the candidate sweep alongside the nominal baud.
pub const REFERENCE_BAUDS: [u32; 8] = [19200, 38400, 56000, 57600, 74880, 76800, 115200, 230400];

const SYNC_BIAS_REPEATS: usize = 50;
const SYNC_SPAN: f64 = 0.2;
const SYNC_STEP: f64 = 0.005;
pub const DEFAULT_SYNC_REQUESTS: usize = 1000;

const TUNE_BIAS_REPEATS: usize = 5;
const TUNE_SPAN: f64 = 0.1;
const TUNE_STEP: f64 = 0.002;
pub const DEFAULT_TUNE_REQUESTS: usize = 500;

/// Builds the candidate baud list: the nominal baud repeated `bias_repeats`
/// times (to bias selection toward it and give it more trials), followed by
/// `round(base * (1 + i*step))` for `i` in `[-steps, steps]`, for `base` in
/// `{nominal} ∪ REFERENCE_BAUDS`, deduplicated and with non-positive values
/// dropped.
fn candidates(nominal: u32, bias_repeats: usize, span: f64, step: f64) -> Vec<u32> {
    let mut out = Vec::with_capacity(bias_repeats + REFERENCE_BAUDS.len() * 2 * 40);
    out.extend(std::iter::repeat(nominal).take(bias_repeats));

    let steps = (span / step).round() as i64;
    let mut seen: HashSet<u32> = HashSet::new();
    let mut bases: Vec<u32> = vec![nominal];
    bases.extend_from_slice(&REFERENCE_BAUDS);

    for base in bases {
        for i in -steps..=steps {
            let frac = 1.0 + (i as f64) * step;
            let candidate = (base as f64 * frac).round();
            if candidate <= 0.0 {
                continue;
            }
            let candidate = candidate as u32;
            if seen.insert(candidate) {
                out.push(candidate);
            }
        }
    }
    out
}

fn byte_time(baud: u32) -> Duration {
    Duration::from_secs_f64(11.0 / baud as f64)
}

/// Activation-based sync: used at first contact, before any command ACK is
/// reliable. Sends two `0x7F` bytes per iteration at each candidate baud,
/// scoring an iteration as success if the first response byte is ACK or
/// NACK. Locks immediately on a 100% iteration, otherwise picks the best
/// candidate meeting `threshold` after the full sweep.
pub fn sync_by_activation(link: &mut SerialLink, nominal: u32, threshold: f64, requests: usize) -> Result<u32> {
    sweep(
        link,
        candidates(nominal, SYNC_BIAS_REPEATS, SYNC_SPAN, SYNC_STEP),
        threshold,
        |link, candidate| {
            let byte_time = byte_time(candidate);
            let gap1 = (byte_time * 2).max(Duration::from_millis(1));
            let gap2 = (byte_time * 4).max(Duration::from_millis(1));
            let mut hits = 0usize;
            for _ in 0..requests {
                if link.send(&[0x7F]).is_err() {
                    continue;
                }
                std::thread::sleep(gap1);
                if link.send(&[0x7F]).is_err() {
                    continue;
                }
                std::thread::sleep(gap2);
                let resp = link.recv(1, None);
                if matches!(resp.first(), Some(&ACK) | Some(&NACK)) {
                    hits += 1;
                }
            }
            hits as f64 / requests as f64
        },
    )
}

/// Command-based tune: used once activated. Invokes `get_commands()`
/// against each candidate baud, scoring an iteration as success iff the
/// returned set is non-empty and a superset of the engine's required
/// opcodes. Temporarily tightens the link timeout for the sweep.
pub fn tune_by_commands(
    link: &mut SerialLink,
    engine: &BootloaderEngine,
    nominal: u32,
    threshold: f64,
    requests: usize,
) -> Result<u32> {
    let prev_timeout = link.timeout();
    let sweep_timeout = Duration::from_secs_f64((11.0 * 30.0 / nominal as f64) * 1.3);
    link.set_timeout(sweep_timeout)?;

    // send_command()'s own internal retry would otherwise mask a
    // candidate's real per-iteration success rate, so it's forced to 1 for
    // the duration of the sweep and restored afterwards.
    let prev_cmd_retry = engine.set_cmd_retry(1);

    let required: HashSet<u8> = crate::protocol::COMMAND_SET.iter().copied().collect();
    let result = sweep(
        link,
        candidates(nominal, TUNE_BIAS_REPEATS, TUNE_SPAN, TUNE_STEP),
        threshold,
        |link, _candidate| {
            let mut hits = 0usize;
            for _ in 0..requests {
                let cmds = engine.get_commands(link);
                if !cmds.is_empty() && required.iter().all(|c| cmds.contains(c)) {
                    hits += 1;
                }
            }
            hits as f64 / requests as f64
        },
    );

    engine.set_cmd_retry(prev_cmd_retry);
    let _ = link.set_timeout(prev_timeout);
    result
}

/// Shared sweep/select logic: apply each candidate baud, score it with
/// `score`, lock immediately on a perfect score, otherwise remember the
/// best-scoring candidate meeting `threshold`.
fn sweep(
    link: &mut SerialLink,
    candidate_list: Vec<u32>,
    threshold: f64,
    mut score: impl FnMut(&mut SerialLink, u32) -> f64,
) -> Result<u32> {
    let mut best: Option<(u32, f64)> = None;

    for candidate in candidate_list {
        if link.set_baud(candidate).is_err() {
            continue;
        }
        let rate = score(link, candidate);
        info!("baud candidate {candidate}: rate {rate:.3}");

        if rate >= 1.0 {
            return Ok(candidate);
        }
        if best.map(|(_, best_rate)| rate > best_rate).unwrap_or(true) {
            best = Some((candidate, rate));
        }
    }

    match best {
        Some((baud, rate)) if rate >= threshold => Ok(baud),
        _ => Err(ProgError::BaudrateUnavailable { threshold }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_lead_with_nominal_bias_repeats() {
        let list = candidates(57600, SYNC_BIAS_REPEATS, SYNC_SPAN, SYNC_STEP);
        assert!(list.len() >= SYNC_BIAS_REPEATS);
        assert!(list[..SYNC_BIAS_REPEATS].iter().all(|&b| b == 57600));
    }

    #[test]
    fn candidates_contain_no_non_positive_values() {
        let list = candidates(57600, TUNE_BIAS_REPEATS, TUNE_SPAN, TUNE_STEP);
        assert!(list.iter().all(|&b| b > 0));
    }

    #[test]
    fn candidates_are_deduplicated_after_the_bias_prefix() {
        let list = candidates(57600, TUNE_BIAS_REPEATS, TUNE_SPAN, TUNE_STEP);
        let tail = &list[TUNE_BIAS_REPEATS..];
        let unique: HashSet<_> = tail.iter().collect();
        assert_eq!(unique.len(), tail.len());
    }

    #[test]
    fn candidates_include_nominal_variation_near_base() {
        let list = candidates(57600, SYNC_BIAS_REPEATS, SYNC_SPAN, SYNC_STEP);
        assert!(list.contains(&57600));
        // +0.5% of nominal should be present given step=0.005.
        assert!(list.iter().any(|&b| (b as f64 - 57888.0).abs() <= 1.0));
    }
}
