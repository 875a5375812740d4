use std::time::Duration;

use log::info;

use crate::crc::crc8_gsm_a;
use crate::error::{ProgError, Result};
use crate::link::SerialLink;

/// Broadcast device ID that addresses every target on the bus at once.
pub const BROADCAST_ID: u16 = 0xFFFF;

const PREAMBLE: u8 = 0xAA;
const COMMAND_TYPE: u8 = 0x03;
const CMD_MUTE: u8 = 0xDA;
const CMD_ENTER_BOOTLOADER: u8 = 0xDF;

const APP_BAUD: u32 = 115_200;
const FRAME_REPEAT: usize = 5;
const MUTE_INTER_FRAME_GAP: Duration = Duration::from_millis(500);
const ENTER_INTER_FRAME_GAP: Duration = Duration::from_millis(200);
const POST_ENTER_DELAY: Duration = Duration::from_secs(7);

/// Builds one 10-byte little-endian application-layer frame, appending the
/// CRC-8/GSM-A of the preceding 9 bytes.
fn build_frame(device_id: u16, command: u8) -> [u8; 10] {
    let id = device_id.to_le_bytes();
    let mut frame = [
        PREAMBLE,
        1, // length / 10
        id[0],
        id[1],
        COMMAND_TYPE,
        command,
        0,
        0,
        0,
        0, // CRC placeholder
    ];
    frame[9] = crc8_gsm_a(&frame[..9]);
    frame
}

pub fn mute_frame() -> [u8; 10] {
    build_frame(BROADCAST_ID, CMD_MUTE)
}

pub fn enter_bootloader_frame(device_id: u16) -> [u8; 10] {
    build_frame(device_id, CMD_ENTER_BOOTLOADER)
}

/// Transmits `frame` `FRAME_REPEAT` times at the application-layer line
/// settings (115200 8N1), restoring the link's prior baud/parity
/// afterwards, then sleeps `post_delay` for the target to act on it.
fn transmit(link: &mut SerialLink, frame: &[u8; 10], gap: Duration, post_delay: Duration) -> Result<()> {
    let prev_baud = link.baud();
    let prev_parity = link.parity();

    link.set_baud(APP_BAUD)?;
    link.set_parity(serialport::Parity::None)?;

    let result = (|| -> Result<()> {
        for i in 0..FRAME_REPEAT {
            link.send(frame).map_err(|source| ProgError::ApplicationFrame(format!("frame send failed: {source}")))?;
            if i + 1 < FRAME_REPEAT {
                std::thread::sleep(gap);
            }
        }
        Ok(())
    })();

    link.set_baud(prev_baud)?;
    link.set_parity(prev_parity)?;
    link.reset_input();

    result.map(|()| std::thread::sleep(post_delay))
}

/// Broadcasts the mute frame so every target but the one about to be
/// addressed falls silent on the bus.
pub fn mute(link: &mut SerialLink) -> Result<()> {
    info!("sending mute command");
    transmit(link, &mute_frame(), MUTE_INTER_FRAME_GAP, Duration::ZERO)
}

/// Unicasts the enter-bootloader frame to `device_id`, then waits for the
/// target to reset into its ROM bootloader.
pub fn enter_bootloader(link: &mut SerialLink, device_id: u16) -> Result<()> {
    info!("target ID{device_id}: sending enter bootloader command");
    transmit(link, &enter_bootloader_frame(device_id), ENTER_INTER_FRAME_GAP, POST_ENTER_DELAY)
}
