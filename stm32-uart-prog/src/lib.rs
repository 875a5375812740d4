//! Bootloader protocol engine, baud autotune, and programming pipeline for
//! mass-programming STM32 targets that share a UART bus through the
//! factory AN3155 USART bootloader.
//!
//! Argument parsing, logging setup, serial-port enumeration UI, progress
//! rendering, Intel-HEX parsing, and duration formatting are external
//! collaborators; this crate only defines the trait seams
//! ([`pipeline::ProgressSink`], [`session::OperatorPrompt`]) they plug
//! into.

pub mod autotune;
pub mod config;
pub mod crc;
pub mod error;
pub mod frame;
pub mod image;
pub mod link;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod status;

pub use config::SessionConfig;
pub use error::{ProgError, Result};
pub use image::FirmwareImage;
pub use link::SerialLink;
pub use status::TargetStatus;
