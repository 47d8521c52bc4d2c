use std::fmt;

/// Everything that can go wrong around one firmware update.
///
/// The orchestrator only ever looks at success/failure; the variant exists so
/// the log line and the caller of the public API can tell the reasons apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FotaError {
    AddressResolutionFailed,
    DeviceSessionStartFailed,
    RequestIssuanceFailed,
    TransportError,
    UnexpectedStatus(u16),
    ShortOrEmptyChunk,
    DeviceWriteFailed,
    IncompleteHeader,
    Timeout,
    TransferAbandoned,
    ReentrantCompletionWait,
    DeviceFinalizeFailed,
    /// An update attempt is already in flight.
    Busy,
    NotStarted,
    AlreadyStarted,
    Stopped,
    InvalidParameter,
    InvalidConfig,
    TimerFailed,
    /// The orchestrator reported a failed attempt to the completion gate.
    Failed,
}

impl FotaError {
    pub fn as_str(&self) -> &'static str {
        match self {
            FotaError::AddressResolutionFailed => "ADDRESS_RESOLUTION_FAILED",
            FotaError::DeviceSessionStartFailed => "DEVICE_SESSION_START_FAILED",
            FotaError::RequestIssuanceFailed => "REQUEST_ISSUANCE_FAILED",
            FotaError::TransportError => "TRANSPORT_ERROR",
            FotaError::UnexpectedStatus(_) => "UNEXPECTED_STATUS",
            FotaError::ShortOrEmptyChunk => "SHORT_OR_EMPTY_CHUNK",
            FotaError::DeviceWriteFailed => "DEVICE_WRITE_FAILED",
            FotaError::IncompleteHeader => "INCOMPLETE_HEADER",
            FotaError::Timeout => "TIMEOUT",
            FotaError::TransferAbandoned => "TRANSFER_ABANDONED",
            FotaError::ReentrantCompletionWait => "REENTRANT_COMPLETION_WAIT",
            FotaError::DeviceFinalizeFailed => "DEVICE_FINALIZE_FAILED",
            FotaError::Busy => "BUSY",
            FotaError::NotStarted => "NOT_STARTED",
            FotaError::AlreadyStarted => "ALREADY_STARTED",
            FotaError::Stopped => "STOPPED",
            FotaError::InvalidParameter => "INVALID_PARAMETER",
            FotaError::InvalidConfig => "INVALID_CONFIG",
            FotaError::TimerFailed => "TIMER_FAILED",
            FotaError::Failed => "FAILED",
        }
    }
}

impl fmt::Display for FotaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FotaError::UnexpectedStatus(status) => write!(f, "{}: HTTP {}", self.as_str(), status),
            _ => f.write_str(self.as_str()),
        }
    }
}

impl std::error::Error for FotaError {}
