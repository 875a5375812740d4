use std::time::{Duration, Instant};

use log::info;

use crate::config::SessionConfig;
use crate::error::{ProgError, Result};
use crate::image::FirmwareImage;
use crate::link::SerialLink;
use crate::pipeline::{self, ProgressSink};
use crate::status::TargetStatus;

/// Gates continuation after a target fails. Implementations surface this
/// to the operator (a terminal prompt, a UI dialog, ...); returning `false`
/// ends the session with [`ProgError::OperatorAbort`].
pub trait OperatorPrompt {
    fn confirm(&mut self, message: &str) -> bool;
}

/// Always continues; useful for tests and unattended runs.
#[derive(Default)]
pub struct AlwaysContinue;

impl OperatorPrompt for AlwaysContinue {
    fn confirm(&mut self, _message: &str) -> bool {
        true
    }
}

pub struct SessionSummary {
    pub results: Vec<(u16, TargetStatus)>,
    pub elapsed: Duration,
}

/// Iterates the target list in submission order, running the programming
/// pipeline for each. After any `Fail`, asks `prompt` whether to continue;
/// a refusal aborts the whole session. Per-target failures otherwise never
/// stop later targets from being attempted.
pub fn run_session(
    config: &SessionConfig,
    image: &FirmwareImage,
    link: &mut SerialLink,
    progress: &mut dyn ProgressSink,
    prompt: &mut dyn OperatorPrompt,
) -> Result<SessionSummary> {
    let start = Instant::now();
    let mut results = Vec::with_capacity(config.targets.len());
    let mut failed_once = false;

    for &target_id in &config.targets {
        if failed_once
            && !prompt.confirm(&format!(
                "At least one target programming failed. Continue programming target ID {target_id}?"
            ))
        {
            return Err(ProgError::OperatorAbort("user declined to continue after a failure".into()));
        }

        info!("programming target ID {target_id}");
        let status = pipeline::program_target(config, image, link, target_id, progress);
        match status {
            TargetStatus::Success => progress.write_line("programming completed successfully"),
            TargetStatus::Warning => progress.write_line("programming completed with warnings"),
            TargetStatus::Fail => {
                failed_once = true;
                progress.write_line("programming failed");
            }
            TargetStatus::Undefined => unreachable!("program_target always resolves to a terminal status"),
        }
        results.push((target_id, status));
    }

    Ok(SessionSummary {
        results,
        elapsed: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RefusingPrompt;
    impl OperatorPrompt for RefusingPrompt {
        fn confirm(&mut self, _message: &str) -> bool {
            false
        }
    }

    #[test]
    fn operator_abort_is_the_only_error_the_session_propagates() {
        // A refusal only ever matters once a failure has occurred; here we
        // just check the trait plumbing compiles and returns as expected.
        let mut prompt = RefusingPrompt;
        assert!(!prompt.confirm("continue?"));
    }
}
