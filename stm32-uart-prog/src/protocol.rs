use std::cell::Cell;
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::crc::xor_checksum;
use crate::link::SerialLink;

/// Autobaud byte a freshly reset ROM bootloader expects first.
pub const ACTIVATE_BYTE: u8 = 0x7F;
pub const ACK: u8 = 0x79;
pub const NACK: u8 = 0x1F;

/// WRITE_MEMORY/READ_MEMORY transaction granularity.
pub const CHUNK_SIZE: usize = 256;

pub const OP_GET: u8 = 0x00;
pub const OP_GET_ID: u8 = 0x02;
pub const OP_READ_MEMORY: u8 = 0x11;
pub const OP_GO: u8 = 0x21;
pub const OP_WRITE_MEMORY: u8 = 0x31;
pub const OP_EXTENDED_ERASE: u8 = 0x44;

/// Opcodes a sector-erase/program/verify session requires the target to
/// support, checked against `get_commands()` before programming begins.
pub const COMMAND_SET: [u8; 6] = [OP_GET, OP_GET_ID, OP_READ_MEMORY, OP_GO, OP_WRITE_MEMORY, OP_EXTENDED_ERASE];

/// Product IDs this programmer knows how to talk to.
pub const SUPPORTED_DEVICE_IDS: [u16; 1] = [0x0413];

const DEFAULT_CMD_RETRY: usize = 3;
const ACK_FAIL_SLEEP: Duration = Duration::from_millis(50);
const ERASE_SETTLE: Duration = Duration::from_millis(750);
const RESYNC_INTERVAL: Duration = Duration::from_millis(10);
const RESYNC_TIMEOUT: Duration = Duration::from_secs(1);
const ACTIVATE_RETRIES: usize = 5;
const ACTIVATE_INTERVAL: Duration = Duration::from_millis(100);

/// Byte-level command protocol engine. Stateless across calls except for
/// bookkeeping used purely for logging; every command is self-contained and
/// borrows the link only for the duration of the call.
///
/// `cmd_retry` is a [`Cell`] rather than a plain field so a baud sweep can
/// temporarily force it to 1 through a shared `&BootloaderEngine` — every
/// other call site holds the engine by immutable reference.
pub struct BootloaderEngine {
    target_id: u16,
    cmd_retry: Cell<usize>,
}

impl BootloaderEngine {
    pub fn new(target_id: u16) -> Self {
        Self {
            target_id,
            cmd_retry: Cell::new(DEFAULT_CMD_RETRY),
        }
    }

    pub fn target_id(&self) -> u16 {
        self.target_id
    }

    /// Current per-command retry budget `send_command` honors internally.
    pub fn cmd_retry(&self) -> usize {
        self.cmd_retry.get()
    }

    /// Overrides the per-command retry budget, returning the previous value
    /// so a caller can restore it afterwards.
    pub fn set_cmd_retry(&self, retries: usize) -> usize {
        self.cmd_retry.replace(retries)
    }

    /// Sends the `0x7F` autobaud byte up to [`ACTIVATE_RETRIES`] times at
    /// 100 ms intervals, returning whether any byte came back.
    pub fn activate(&self, link: &mut SerialLink) -> bool {
        for _ in 0..ACTIVATE_RETRIES {
            if link.send(&[ACTIVATE_BYTE]).is_err() {
                return false;
            }
            if !link.recv(1, None).is_empty() {
                return true;
            }
            std::thread::sleep(ACTIVATE_INTERVAL);
        }
        false
    }

    /// Sends `(opcode, opcode XOR 0xFF)` and waits for ACK, retrying
    /// internally up to [`Self::cmd_retry`] times. Independent of the
    /// pipeline's outer/inner retry budgets.
    pub fn send_command(&self, link: &mut SerialLink, opcode: u8) -> bool {
        let cmd_retry = self.cmd_retry.get();
        for attempt in 0..cmd_retry {
            if link.send(&[opcode, !opcode]).is_err() {
                continue;
            }
            if self.read_ack(link) {
                return true;
            }
            warn!(
                "target ID{}: command 0x{opcode:02X} attempt {}/{cmd_retry} failed",
                self.target_id,
                attempt + 1
            );
        }
        error!("target ID{}: command 0x{opcode:02X} NACK", self.target_id);
        false
    }

    /// Reads a single ACK byte. Any non-ACK (including an empty read)
    /// triggers a resync, a 50 ms settle, and an input flush, and reports
    /// failure so the caller can decide whether to retry.
    fn read_ack(&self, link: &mut SerialLink) -> bool {
        let resp = link.recv(1, None);
        if resp.first() == Some(&ACK) {
            return true;
        }
        self.probe_bootloader(link, RESYNC_TIMEOUT, RESYNC_INTERVAL);
        std::thread::sleep(ACK_FAIL_SLEEP);
        link.reset_input();
        false
    }

    /// Resync: transmits `0xFF` at `interval` until a byte comes back or
    /// `timeout` elapses. Temporarily sets the link timeout to `interval`.
    pub fn probe_bootloader(&self, link: &mut SerialLink, timeout: Duration, interval: Duration) -> bool {
        warn!("target ID{}: resync requested", self.target_id);
        let prev_timeout = link.timeout();
        if link.set_timeout(interval).is_err() {
            return false;
        }

        let deadline = Instant::now() + timeout;
        let found = loop {
            if link.send(&[0xFF]).is_err() {
                break false;
            }
            if !link.recv(1, None).is_empty() {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
        };

        let _ = link.set_timeout(prev_timeout);
        found
    }

    /// Returns the supported opcode set, protocol version byte first.
    /// Empty on any framing failure.
    pub fn get_commands(&self, link: &mut SerialLink) -> Vec<u8> {
        if !self.send_command(link, OP_GET) {
            return Vec::new();
        }
        let len = match link.recv(1, None).first() {
            Some(&b) => b as usize,
            None => return Vec::new(),
        };
        let cmds = link.recv(len + 1, None);
        if cmds.len() != len + 1 {
            return Vec::new();
        }
        self.read_ack(link);
        cmds
    }

    /// Returns the product ID, parsed as unsigned big-endian over the
    /// returned payload bytes. Zero on any framing failure.
    pub fn get_pid(&self, link: &mut SerialLink) -> u16 {
        if !self.send_command(link, OP_GET_ID) {
            return 0;
        }
        let len = match link.recv(1, None).first() {
            Some(&b) => b as usize,
            None => return 0,
        };
        let payload = link.recv(len + 1, None);
        if payload.len() != len + 1 {
            return 0;
        }
        self.read_ack(link);
        payload[..2.min(payload.len())]
            .iter()
            .fold(0u16, |acc, &b| (acc << 8) | b as u16)
    }

    /// Reads `size` (1..=256) bytes from `addr`. Empty on failure.
    pub fn read_mem(&self, link: &mut SerialLink, addr: u32, size: usize) -> Vec<u8> {
        debug_assert!((1..=CHUNK_SIZE).contains(&size));
        if !self.send_command(link, OP_READ_MEMORY) {
            return Vec::new();
        }
        if !self.send_address(link, addr) {
            return Vec::new();
        }
        let n = (size - 1) as u8;
        if link.send(&[n, !n]).is_err() || !self.read_ack(link) {
            return Vec::new();
        }
        link.recv(size, None)
    }

    /// Writes `data` (1..=256 bytes) to `addr`. `true` on ACK.
    pub fn write_mem(&self, link: &mut SerialLink, addr: u32, data: &[u8]) -> bool {
        debug_assert!((1..=CHUNK_SIZE).contains(&data.len()));
        if !self.send_command(link, OP_WRITE_MEMORY) {
            return false;
        }
        if !self.send_address(link, addr) {
            return false;
        }
        let n = (data.len() - 1) as u8;
        let mut payload = Vec::with_capacity(data.len() + 1);
        payload.push(n);
        payload.extend_from_slice(data);
        let checksum = xor_checksum(&payload);
        if link.send(&payload).is_err() || link.send(&[checksum]).is_err() {
            return false;
        }
        self.read_ack(link)
    }

    /// Erases `sector` using EXTENDED_ERASE's single-sector form. A settle
    /// delay precedes the ACK read since erase can take time.
    pub fn erase_sector(&self, link: &mut SerialLink, sector: u16) -> bool {
        if !self.send_command(link, OP_EXTENDED_ERASE) {
            return false;
        }
        let sector_bytes = sector.to_be_bytes();
        let payload = [0x00, 0x00, sector_bytes[0], sector_bytes[1]];
        let checksum = xor_checksum(&payload);
        if link.send(&payload).is_err() || link.send(&[checksum]).is_err() {
            return false;
        }
        std::thread::sleep(ERASE_SETTLE);
        self.read_ack(link)
    }

    /// Jumps to `addr`. `true` on ACK.
    pub fn start_application(&self, link: &mut SerialLink, addr: u32) -> bool {
        if !self.send_command(link, OP_GO) {
            return false;
        }
        self.send_address(link, addr)
    }

    /// Sends a 4-byte big-endian address followed by its XOR checksum,
    /// then waits for ACK.
    fn send_address(&self, link: &mut SerialLink, addr: u32) -> bool {
        let bytes = addr.to_be_bytes();
        let checksum = xor_checksum(&bytes);
        if link.send(&bytes).is_err() || link.send(&[checksum]).is_err() {
            return false;
        }
        self.read_ack(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Transport;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[test]
    fn command_set_contains_exactly_the_required_opcodes() {
        assert_eq!(COMMAND_SET, [OP_GET, OP_GET_ID, OP_READ_MEMORY, OP_GO, OP_WRITE_MEMORY, OP_EXTENDED_ERASE]);
    }

    #[test]
    fn opcode_complement_pairs_are_correct() {
        for &op in COMMAND_SET.iter() {
            assert_eq!(op ^ !op, 0xFF);
        }
    }

    #[test]
    fn erase_sector_payload_checksum_is_xor_of_four_bytes() {
        let sector: u16 = 5;
        let sector_bytes = sector.to_be_bytes();
        let payload = [0x00u8, 0x00, sector_bytes[0], sector_bytes[1]];
        assert_eq!(xor_checksum(&payload), payload[2] ^ payload[3]);
    }

    /// A scripted stand-in for the wire: bytes queued on construction (or
    /// via [`FakeTransport::push_rx`]) are handed back on `read_some` in
    /// order; everything written is captured in `tx` for assertions on the
    /// exact framing the engine put on the wire.
    struct FakeTransport {
        rx: VecDeque<u8>,
        tx: Arc<Mutex<Vec<u8>>>,
        timeout: Duration,
    }

    impl FakeTransport {
        fn new(rx: Vec<u8>) -> Self {
            Self::with_tx_sink(rx, Arc::new(Mutex::new(Vec::new())))
        }

        fn with_tx_sink(rx: Vec<u8>, tx: Arc<Mutex<Vec<u8>>>) -> Self {
            Self {
                rx: rx.into(),
                tx,
                timeout: Duration::from_millis(500),
            }
        }
    }

    impl Transport for FakeTransport {
        fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
            self.tx.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let mut n = 0;
            while n < buf.len() {
                match self.rx.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn bytes_to_read(&mut self) -> std::io::Result<u32> {
            Ok(self.rx.len() as u32)
        }

        fn set_baud_rate(&mut self, _baud: u32) -> std::io::Result<()> {
            Ok(())
        }

        fn set_parity(&mut self, _parity: serialport::Parity) -> std::io::Result<()> {
            Ok(())
        }

        fn set_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
            self.timeout = timeout;
            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }
    }

    fn link_with(rx: Vec<u8>) -> SerialLink {
        SerialLink::from_transport("fake", 57_600, Box::new(FakeTransport::new(rx)))
    }

    #[test]
    fn get_commands_round_trip_matches_wire_framing() {
        let response_payload = [0x31u8, OP_GET, OP_GET_ID, OP_READ_MEMORY, OP_GO, OP_WRITE_MEMORY, OP_EXTENDED_ERASE];
        let mut rx = vec![ACK, (response_payload.len() - 1) as u8];
        rx.extend_from_slice(&response_payload);
        rx.push(ACK);
        let mut link = link_with(rx);

        let engine = BootloaderEngine::new(7);
        let cmds = engine.get_commands(&mut link);
        assert_eq!(cmds, response_payload);
    }

    #[test]
    fn get_pid_parses_big_endian_payload() {
        let rx = vec![ACK, 0x01, 0x04, 0x13, ACK];
        let mut link = link_with(rx);

        let engine = BootloaderEngine::new(7);
        assert_eq!(engine.get_pid(&mut link), 0x0413);
    }

    #[test]
    fn write_mem_then_read_mem_round_trip_through_the_fake_flash() {
        let data = [0xDEu8, 0xAD, 0xBE, 0xEF];

        // write_mem: opcode ack, address ack, final ack.
        let mut link = link_with(vec![ACK, ACK, ACK]);
        let engine = BootloaderEngine::new(7);
        assert!(engine.write_mem(&mut link, 0x0800_1000, &data));

        // read_mem: opcode ack, address ack, length ack, then the payload
        // itself (no trailing ack).
        let mut rx = vec![ACK, ACK, ACK];
        rx.extend_from_slice(&data);
        let mut link = link_with(rx);
        let read = engine.read_mem(&mut link, 0x0800_1000, data.len());
        assert_eq!(read, data);
    }

    #[test]
    fn write_mem_puts_correct_address_and_checksum_on_the_wire() {
        let data = [0xAAu8, 0xBB];
        let addr = 0x0800_2000u32;
        let tx = Arc::new(Mutex::new(Vec::new()));
        let mut link = SerialLink::from_transport(
            "fake",
            57_600,
            Box::new(FakeTransport::with_tx_sink(vec![ACK, ACK, ACK], tx.clone())),
        );
        let engine = BootloaderEngine::new(7);
        assert!(engine.write_mem(&mut link, addr, &data));

        let addr_bytes = addr.to_be_bytes();
        let n = (data.len() - 1) as u8;
        let mut payload = vec![n];
        payload.extend_from_slice(&data);
        let checksum = xor_checksum(&payload);

        let mut expected = vec![OP_WRITE_MEMORY, !OP_WRITE_MEMORY];
        expected.extend_from_slice(&addr_bytes);
        expected.push(xor_checksum(&addr_bytes));
        expected.extend_from_slice(&payload);
        expected.push(checksum);

        assert_eq!(*tx.lock().unwrap(), expected);
    }

    #[test]
    fn erase_sector_succeeds_on_ack() {
        let mut link = link_with(vec![ACK, ACK]);
        let engine = BootloaderEngine::new(7);
        assert!(engine.erase_sector(&mut link, 3));
    }

    #[test]
    fn start_application_succeeds_on_ack() {
        let mut link = link_with(vec![ACK, ACK]);
        let engine = BootloaderEngine::new(7);
        assert!(engine.start_application(&mut link, 0x0800_0000));
    }

    #[test]
    fn activate_returns_true_as_soon_as_any_byte_comes_back() {
        let mut link = link_with(vec![ACK]);
        let engine = BootloaderEngine::new(7);
        assert!(engine.activate(&mut link));
    }

    #[test]
    fn activate_returns_false_when_nothing_ever_answers() {
        let mut link = link_with(vec![]);
        let engine = BootloaderEngine::new(7);
        assert!(!engine.activate(&mut link));
    }

    #[test]
    fn get_commands_is_empty_on_short_payload() {
        // Length byte promises 6 more bytes than claimed, but only 2 follow.
        let rx = vec![ACK, 5, 0x00, 0x00];
        let mut link = link_with(rx);
        let engine = BootloaderEngine::new(7);
        assert!(engine.get_commands(&mut link).is_empty());
    }

    #[test]
    fn set_cmd_retry_overrides_the_default_and_returns_the_previous_value() {
        let engine = BootloaderEngine::new(7);
        assert_eq!(engine.cmd_retry(), DEFAULT_CMD_RETRY);

        let prev = engine.set_cmd_retry(1);
        assert_eq!(prev, DEFAULT_CMD_RETRY);
        assert_eq!(engine.cmd_retry(), 1);

        engine.set_cmd_retry(prev);
        assert_eq!(engine.cmd_retry(), DEFAULT_CMD_RETRY);
    }
}
