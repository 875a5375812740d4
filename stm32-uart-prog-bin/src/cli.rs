use clap::Parser;

/// STM32 UART mass programming launch tool.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Intel-HEX file to program
    #[arg(long)]
    pub hexfile: String,

    /// Target IDs to program. Accepts single IDs and/or ranges, e.g.
    /// `--targets 1-10 7-12 52 19 8-20`
    #[arg(long, num_args = 1.., required = true, value_parser = parse_target_token)]
    pub targets: Vec<TargetToken>,

    /// Outer retries per sector; sector is re-erased on any error during
    /// that attempt
    #[arg(long, default_value_t = 10)]
    pub attempts_erase: usize,

    /// Inner command retries for a single chunk write/read
    #[arg(long, default_value_t = 10)]
    pub attempts: usize,

    /// Address from which the programmed application will be started
    #[arg(long, value_parser = parse_hex_or_dec, default_value = "0x08000000")]
    pub address: u32,

    /// Nominal UART baud rate
    #[arg(long, default_value_t = 57_600)]
    pub baudrate: u32,

    /// Disable the command-based autotune pass
    #[arg(long)]
    pub no_tune: bool,

    /// Autotune success threshold in [0, 1]
    #[arg(long, default_value_t = 0.8)]
    pub tune_threshold: f64,

    /// Logger threshold level
    #[arg(long, value_enum, default_value_t = LogLevel::Error)]
    pub loglvl: LogLevel,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// One `--targets` token: a single ID or an inclusive `A-B` range.
#[derive(Clone, Debug)]
pub enum TargetToken {
    Single(u16),
    Range(u16, u16),
}

fn parse_target_token(s: &str) -> Result<TargetToken, String> {
    if let Some((start, end)) = s.split_once('-') {
        let start: u16 = start.parse().map_err(|_| invalid_target(s))?;
        let end: u16 = end.parse().map_err(|_| invalid_target(s))?;
        if start > end {
            return Err(invalid_target(s));
        }
        Ok(TargetToken::Range(start, end))
    } else {
        let id: u16 = s.parse().map_err(|_| invalid_target(s))?;
        Ok(TargetToken::Single(id))
    }
}

fn invalid_target(s: &str) -> String {
    format!("invalid target '{s}', use an integer or a range like 1 or 1-10")
}

fn parse_hex_or_dec(s: &str) -> Result<u32, String> {
    let trimmed = s.trim();
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        trimmed.parse().map_err(|e: std::num::ParseIntError| e.to_string())
    }
}

/// Flattens `--targets` tokens into the sorted, deduplicated union of IDs.
pub fn resolve_targets(tokens: &[TargetToken]) -> Vec<u16> {
    let mut ids = std::collections::BTreeSet::new();
    for token in tokens {
        match *token {
            TargetToken::Single(id) => {
                ids.insert(id);
            }
            TargetToken::Range(start, end) => {
                for id in start..=end {
                    ids.insert(id);
                }
            }
        }
    }
    ids.into_iter().collect()
}
