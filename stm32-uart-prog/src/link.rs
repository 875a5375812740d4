use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{ProgError, Result};

/// Cooldown after a successful open before `reconnect` is allowed to act
/// again, to avoid reopen storms when a target is simply slow to answer.
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(2);

/// Minimal blocking transport seam the [`SerialLink`] drives.
///
/// Mirrors the subset of `serialport::SerialPort` the link actually uses,
/// so tests can exercise [`SerialLink`], the protocol engine, and autotune
/// against an in-memory double instead of real hardware.
pub trait Transport: Send {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;
    fn flush(&mut self) -> std::io::Result<()>;
    /// Reads up to `buf.len()` bytes, blocking at most the configured
    /// timeout; returns the number of bytes actually read (may be 0).
    fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn bytes_to_read(&mut self) -> std::io::Result<u32>;
    fn set_baud_rate(&mut self, baud: u32) -> std::io::Result<()>;
    fn set_parity(&mut self, parity: serialport::Parity) -> std::io::Result<()>;
    fn set_timeout(&mut self, timeout: Duration) -> std::io::Result<()>;
    fn timeout(&self) -> Duration;
}

impl Transport for Box<dyn serialport::SerialPort> {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        std::io::Write::write_all(self.as_mut(), buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::Write::flush(self.as_mut())
    }

    fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match std::io::Read::read(self.as_mut(), buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn bytes_to_read(&mut self) -> std::io::Result<u32> {
        serialport::SerialPort::bytes_to_read(self.as_ref()).map_err(Into::into)
    }

    fn set_baud_rate(&mut self, baud: u32) -> std::io::Result<()> {
        serialport::SerialPort::set_baud_rate(self.as_mut(), baud).map_err(Into::into)
    }

    fn set_parity(&mut self, parity: serialport::Parity) -> std::io::Result<()> {
        serialport::SerialPort::set_parity(self.as_mut(), parity).map_err(Into::into)
    }

    fn set_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
        serialport::SerialPort::set_timeout(self.as_mut(), timeout).map_err(Into::into)
    }

    fn timeout(&self) -> Duration {
        serialport::SerialPort::timeout(self.as_ref())
    }
}

/// Owns the UART handle exclusively for the duration of a session.
///
/// Every write is followed by a flush; every `TransportError` is absorbed
/// here and surfaces to callers as an empty read or a `false`/`Err` return,
/// after at most one reopen attempt.
pub struct SerialLink {
    port_name: String,
    baud: u32,
    transport: Box<dyn Transport>,
    last_open: Instant,
}

impl SerialLink {
    /// Opens `port_name` at `baud`, 8 data bits, even parity, one stop bit.
    pub fn open(port_name: &str, baud: u32, timeout: Duration) -> Result<Self> {
        info!("opening serial port: {port_name} {baud} 8E1");
        let port = serialport::new(port_name, baud)
            .parity(serialport::Parity::Even)
            .stop_bits(serialport::StopBits::One)
            .data_bits(serialport::DataBits::Eight)
            .timeout(timeout)
            .open()
            .map_err(|source| ProgError::PortUnavailable {
                port: port_name.to_string(),
                source,
            })?;

        Ok(Self {
            port_name: port_name.to_string(),
            baud,
            transport: Box::new(port),
            last_open: Instant::now(),
        })
    }

    #[cfg(test)]
    pub(crate) fn from_transport(port_name: &str, baud: u32, transport: Box<dyn Transport>) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud,
            transport,
            last_open: Instant::now(),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Writes all bytes, flushing afterwards. A partial write or I/O
    /// failure is reported as `TransportError` and triggers one reconnect.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        debug!("sending {} bytes: {:02X?}", bytes.len(), bytes);
        match self.transport.write_all(bytes).and_then(|_| self.transport.flush()) {
            Ok(()) => Ok(()),
            Err(source) => {
                warn!("{}: write failed: {source}", self.port_name);
                self.reconnect(&source.to_string());
                Err(ProgError::Transport {
                    port: self.port_name.clone(),
                    source: source.into(),
                })
            }
        }
    }

    /// Reads up to `size` bytes. If `stall_timeout` is `None`, reads up to
    /// `size` bytes bounded by the link's configured timeout. If set, polls
    /// the input buffer on 10 ms ticks and returns early once no new bytes
    /// arrive for `stall_timeout`; the result may be shorter than `size`.
    pub fn recv(&mut self, size: usize, stall_timeout: Option<Duration>) -> Vec<u8> {
        match stall_timeout {
            None => self.recv_bounded(size),
            Some(stall) => self.recv_with_stall(size, stall),
        }
    }

    fn recv_bounded(&mut self, size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            match self.transport.read_some(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    warn!("{}: read failed: {e}", self.port_name);
                    self.reconnect(&e.to_string());
                    break;
                }
            }
        }
        buf.truncate(filled);
        buf
    }

    fn recv_with_stall(&mut self, size: usize, stall_timeout: Duration) -> Vec<u8> {
        const TICK: Duration = Duration::from_millis(10);
        debug_assert_eq!(
            stall_timeout.as_millis() % TICK.as_millis(),
            0,
            "stall_timeout must be a non-negative multiple of 10ms"
        );

        let mut data = Vec::with_capacity(size);
        let mut since_last_byte = Instant::now();

        while data.len() < size {
            let available = self.transport.bytes_to_read().unwrap_or(0) as usize;
            if available > 0 {
                let want = (size - data.len()).min(available);
                let mut chunk = vec![0u8; want];
                match self.transport.read_some(&mut chunk) {
                    Ok(0) => {}
                    Ok(n) => {
                        data.extend_from_slice(&chunk[..n]);
                        since_last_byte = Instant::now();
                    }
                    Err(e) => {
                        warn!("{}: read failed: {e}", self.port_name);
                        self.reconnect(&e.to_string());
                        break;
                    }
                }
            } else if since_last_byte.elapsed() >= stall_timeout {
                debug!("stall timeout after {} of {size} bytes", data.len());
                break;
            } else {
                std::thread::sleep(TICK);
            }
        }
        data
    }

    /// Drains whatever is currently buffered in the input, without
    /// blocking for more.
    pub fn recv_all(&mut self) -> Vec<u8> {
        let available = self.transport.bytes_to_read().unwrap_or(0) as usize;
        if available == 0 {
            return Vec::new();
        }
        let mut buf = vec![0u8; available];
        let n = self.transport.read_some(&mut buf).unwrap_or(0);
        buf.truncate(n);
        buf
    }

    /// Discards any pending input without returning it.
    pub fn reset_input(&mut self) {
        let _ = self.recv_all();
    }

    pub fn set_baud(&mut self, baud: u32) -> Result<()> {
        self.transport
            .set_baud_rate(baud)
            .map(|_| self.baud = baud)
            .map_err(|source| ProgError::Transport {
                port: self.port_name.clone(),
                source: source.into(),
            })
    }

    pub fn set_parity(&mut self, parity: serialport::Parity) -> Result<()> {
        self.transport
            .set_parity(parity)
            .map_err(|source| ProgError::Transport {
                port: self.port_name.clone(),
                source: source.into(),
            })
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.transport
            .set_timeout(timeout)
            .map_err(|source| ProgError::Transport {
                port: self.port_name.clone(),
                source: source.into(),
            })
    }

    pub fn timeout(&self) -> Duration {
        self.transport.timeout()
    }

    pub fn parity(&self) -> serialport::Parity {
        // Only even parity is ever used on this link; tracked here so
        // scoped parameter changes can restore it without re-querying the
        // OS handle.
        serialport::Parity::Even
    }

    /// Closes and reopens the same port, suppressed if the last successful
    /// open was less than [`RECONNECT_COOLDOWN`] ago.
    pub fn reconnect(&mut self, cause: &str) {
        if self.last_open.elapsed() < RECONNECT_COOLDOWN {
            debug!("{}: reconnect suppressed (cooldown), cause: {cause}", self.port_name);
            return;
        }
        warn!("{}: reconnecting, cause: {cause}", self.port_name);
        match serialport::new(&self.port_name, self.baud)
            .parity(serialport::Parity::Even)
            .stop_bits(serialport::StopBits::One)
            .data_bits(serialport::DataBits::Eight)
            .timeout(self.transport.timeout())
            .open()
        {
            Ok(port) => {
                self.transport = Box::new(port);
                self.last_open = Instant::now();
                info!("{}: reconnected", self.port_name);
            }
            Err(e) => warn!("{}: reconnect failed: {e}", self.port_name),
        }
    }
}

/// RAII guard restoring a link's baud/parity on drop, even on early return
/// or an error path out of the scope that created it.
pub struct ScopedLinkParams<'a> {
    link: &'a mut SerialLink,
    prev_baud: u32,
    prev_parity: serialport::Parity,
}

impl<'a> ScopedLinkParams<'a> {
    /// Saves the link's current baud/parity, then applies `baud`/`parity`.
    pub fn enter(link: &'a mut SerialLink, baud: u32, parity: serialport::Parity) -> Result<Self> {
        let prev_baud = link.baud();
        let prev_parity = link.parity();
        link.set_baud(baud)?;
        link.set_parity(parity)?;
        Ok(Self {
            link,
            prev_baud,
            prev_parity,
        })
    }

    pub fn link_mut(&mut self) -> &mut SerialLink {
        self.link
    }
}

impl Drop for ScopedLinkParams<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.link.set_baud(self.prev_baud) {
            warn!("failed to restore baud rate: {e}");
        }
        if let Err(e) = self.link.set_parity(self.prev_parity) {
            warn!("failed to restore parity: {e}");
        }
        self.link.reset_input();
    }
}
