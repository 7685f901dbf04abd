//! Error types shared by the controller, the port state machine and the
//! class drivers.

use core::fmt;

use crate::usb::xhci::trb::CompletionCode;

/// Why `initialize`/`run` could not bring the controller up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitFailure {
    AlreadyInitialized,
    NotInitialized,
    /// HCIVERSION below 0.96.
    UnsupportedVersion(u16),
    /// PAGESIZE does not advertise 4 KiB pages.
    UnsupportedPageSize(u32),
    HaltTimeout,
    ResetTimeout,
    OutOfDmaMemory,
    /// The DMA arena reaches above 4 GiB on a controller without 64-bit
    /// addressing.
    DmaNotAddressable,
}

/// Why a port could not be driven to `Configured`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFailure {
    NotConnected,
    ResetTimeout,
    CommandTimeout,
    TransferTimeout,
    UnsupportedDevice,
    InvalidDescriptor,
    InvalidSlotId(u8),
    OutOfDmaMemory,
}

/// Driver-level errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KError {
    Initialization(InitFailure),
    ControllerHalted,
    InvalidPort(u8),
    PortConfiguration(PortFailure),
    /// A command completed with a non-success completion code.
    Command(CompletionCode),
    /// A transfer completed with an error completion code.
    Transfer(CompletionCode),
    /// A producer ring has no free entry left.
    RingFull,
}

pub type KResult<T> = core::result::Result<T, KError>;

impl KError {
    /// Stable numeric cause for callers that only understand integers.
    /// Zero is reserved for success.
    pub fn cause(&self) -> u32 {
        match self {
            KError::Initialization(_) => 1,
            KError::ControllerHalted => 2,
            KError::InvalidPort(_) => 3,
            KError::PortConfiguration(_) => 4,
            KError::Command(_) => 5,
            KError::Transfer(_) => 6,
            KError::RingFull => 7,
        }
    }
}

impl From<PortFailure> for KError {
    fn from(failure: PortFailure) -> Self {
        KError::PortConfiguration(failure)
    }
}

impl From<InitFailure> for KError {
    fn from(failure: InitFailure) -> Self {
        KError::Initialization(failure)
    }
}

impl fmt::Display for KError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KError::Initialization(why) => write!(f, "initialization failed: {:?}", why),
            KError::ControllerHalted => write!(f, "controller did not leave the halted state"),
            KError::InvalidPort(port) => write!(f, "invalid port {}", port),
            KError::PortConfiguration(why) => write!(f, "port configuration failed: {:?}", why),
            KError::Command(code) => write!(f, "command failed: {}", code),
            KError::Transfer(code) => write!(f, "transfer failed: {}", code),
            KError::RingFull => write!(f, "ring full"),
        }
    }
}

/// Maps a result to the integer cause code (0 = success).
pub fn cause_code(result: &KResult<()>) -> u32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.cause(),
    }
}
