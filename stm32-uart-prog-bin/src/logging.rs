use std::path::{Path, PathBuf};

use anyhow::Context;
use log::LevelFilter;
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::filter::{Filter, Response};

const MAX_LOG_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const LOG_BACKUPS: u32 = 2;
const PATTERN: &str = "{d(%d-%m-%Y %H:%M:%S)}.{f(%.3f)} - {f}:{M}:{L} - {m}{n}";

/// Only lets records at exactly `level` through, mirroring the original
/// tool's per-level file split (one handler per level, not a threshold).
#[derive(Debug)]
struct ExactLevel(LevelFilter);

impl Filter for ExactLevel {
    fn filter(&self, record: &log::Record) -> Response {
        if record.level() == self.0 {
            Response::Neutral
        } else {
            Response::Reject
        }
    }
}

fn rolling_appender(path: &Path) -> anyhow::Result<RollingFileAppender> {
    let pattern = format!("{}.{{}}", path.display());
    let roller = FixedWindowRoller::builder()
        .build(&pattern, LOG_BACKUPS)
        .map_err(|e| anyhow::anyhow!("building log roller for {}: {e}", path.display()))?;
    let trigger = SizeTrigger::new(MAX_LOG_SIZE_BYTES);
    let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roller));

    RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build(path, Box::new(policy))
        .with_context(|| format!("opening log file {}", path.display()))
}

/// Builds the four per-level rotating log files under `log_dir/` (created
/// if missing) and installs the resulting config as the global logger.
/// `threshold` gates what reaches the root logger at all; each appender
/// additionally only accepts records at its own exact level.
pub fn init(threshold: LevelFilter, log_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir).with_context(|| format!("creating log directory {}", log_dir.display()))?;

    let levels = [
        ("error", LevelFilter::Error),
        ("warning", LevelFilter::Warn),
        ("info", LevelFilter::Info),
        ("debug", LevelFilter::Debug),
    ];

    let mut config = Config::builder();
    let mut appender_names = Vec::with_capacity(levels.len());

    for (name, level) in levels {
        let path: PathBuf = log_dir.join(format!("{name}.log"));
        let appender = rolling_appender(&path)?;
        config = config.appender(
            Appender::builder()
                .filter(Box::new(ExactLevel(level)))
                .build(name, Box::new(appender)),
        );
        appender_names.push(name);
    }

    let config = config
        .build(Root::builder().appenders(appender_names).build(threshold))
        .context("assembling logging configuration")?;

    log4rs::init_config(config).context("installing logging configuration")?;
    Ok(())
}
