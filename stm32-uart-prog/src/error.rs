use thiserror::Error as ThisError;

/// Error taxonomy for a programming session.
///
/// Each variant is disjoint and maps to one policy in the error-handling
/// design: `Config`/`PortUnavailable` are fatal and abort before any I/O;
/// `Transport`/`Protocol` are recovered locally (at most one reconnect, or
/// a resync plus caller-driven retry); `Baudrate`/`UnsupportedDevice` fail
/// only the current target; `OperatorAbort` is the only variant allowed to
/// propagate out of the orchestrator.
#[derive(ThisError, Debug)]
pub enum ProgError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("could not open serial port {port}: {source}")]
    PortUnavailable {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("transport error on {port}: {source}")]
    Transport {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("application-layer frame error: {0}")]
    ApplicationFrame(String),

    #[error("no candidate baud rate reached the {threshold:.2} success threshold")]
    BaudrateUnavailable { threshold: f64 },

    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    #[error("operator aborted the session: {0}")]
    OperatorAbort(String),
}

pub type Result<T> = std::result::Result<T, ProgError>;
