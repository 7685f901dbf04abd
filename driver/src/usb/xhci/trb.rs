//! Transfer Request Blocks: layout, type codes, completion codes and the
//! builders for the commands and transfers this driver issues.

use core::fmt;

use crate::usb::SetupPacket;

/// Transfer Request Block - 16 bytes
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trb {
    pub param_lo: u32,
    pub param_hi: u32,
    pub status: u32,
    pub control: u32,
}

pub const TRB_SIZE: usize = 16;

const CYCLE: u32 = 1 << 0;
const TOGGLE_CYCLE: u32 = 1 << 1;
const INTERRUPT_ON_SHORT_PACKET: u32 = 1 << 2;
const IMMEDIATE_DATA: u32 = 1 << 6;
const INTERRUPT_ON_COMPLETION: u32 = 1 << 5;
const DIRECTION_IN: u32 = 1 << 16;

impl Trb {
    pub const fn new() -> Self {
        Self {
            param_lo: 0,
            param_hi: 0,
            status: 0,
            control: 0,
        }
    }

    pub fn set_pointer(&mut self, addr: u64) {
        self.param_lo = addr as u32;
        self.param_hi = (addr >> 32) as u32;
    }

    pub fn pointer(&self) -> u64 {
        (self.param_lo as u64) | ((self.param_hi as u64) << 32)
    }

    pub fn trb_type(&self) -> u8 {
        ((self.control >> 10) & 0x3F) as u8
    }

    pub fn set_type(&mut self, ty: TrbType) {
        self.control = (self.control & !(0x3F << 10)) | ((ty as u32) << 10);
    }

    pub fn cycle(&self) -> bool {
        self.control & CYCLE != 0
    }

    pub fn set_cycle(&mut self, cycle: bool) {
        if cycle {
            self.control |= CYCLE;
        } else {
            self.control &= !CYCLE;
        }
    }

    pub fn set_toggle_cycle(&mut self) {
        self.control |= TOGGLE_CYCLE;
    }

    pub fn slot_id(&self) -> u8 {
        (self.control >> 24) as u8
    }

    /// Endpoint ID (DCI) of a transfer event.
    pub fn endpoint_id(&self) -> u8 {
        ((self.control >> 16) & 0x1F) as u8
    }

    pub fn completion_code(&self) -> CompletionCode {
        CompletionCode((self.status >> 24) as u8)
    }

    /// Residual byte count of a transfer event.
    pub fn transfer_length(&self) -> u32 {
        self.status & 0x00FF_FFFF
    }

    /// Port ID of a port status change event.
    pub fn port_id(&self) -> u8 {
        (self.param_lo >> 24) as u8
    }

    /// Requested length of a Normal/Data stage TRB.
    pub fn buffer_length(&self) -> u32 {
        self.status & 0x1_FFFF
    }

    pub fn interrupt_on_completion(&self) -> bool {
        self.control & INTERRUPT_ON_COMPLETION != 0
    }

    pub fn link(target: u64) -> Self {
        let mut trb = Trb::new();
        trb.set_pointer(target);
        trb.set_type(TrbType::Link);
        trb.set_toggle_cycle();
        trb
    }

    pub fn enable_slot() -> Self {
        let mut trb = Trb::new();
        trb.set_type(TrbType::EnableSlot);
        trb
    }

    pub fn disable_slot(slot_id: u8) -> Self {
        let mut trb = Trb::new();
        trb.set_type(TrbType::DisableSlot);
        trb.control |= (slot_id as u32) << 24;
        trb
    }

    pub fn address_device(input_context: u64, slot_id: u8) -> Self {
        let mut trb = Trb::new();
        trb.set_pointer(input_context);
        trb.set_type(TrbType::AddressDevice);
        trb.control |= (slot_id as u32) << 24;
        trb
    }

    pub fn configure_endpoint(input_context: u64, slot_id: u8) -> Self {
        let mut trb = Trb::new();
        trb.set_pointer(input_context);
        trb.set_type(TrbType::ConfigureEndpoint);
        trb.control |= (slot_id as u32) << 24;
        trb
    }

    pub fn evaluate_context(input_context: u64, slot_id: u8) -> Self {
        let mut trb = Trb::new();
        trb.set_pointer(input_context);
        trb.set_type(TrbType::EvaluateContext);
        trb.control |= (slot_id as u32) << 24;
        trb
    }

    /// Setup stage carrying the 8-byte setup packet as immediate data.
    pub fn setup_stage(setup: &SetupPacket, transfer_type: SetupTransferType) -> Self {
        let mut trb = Trb::new();
        trb.param_lo = (setup.request_type as u32)
            | ((setup.request as u32) << 8)
            | ((setup.value as u32) << 16);
        trb.param_hi = (setup.index as u32) | ((setup.length as u32) << 16);
        trb.status = 8;
        trb.set_type(TrbType::SetupStage);
        trb.control |= IMMEDIATE_DATA | ((transfer_type as u32) << 16);
        trb
    }

    pub fn data_stage(buffer: u64, length: u32, dir_in: bool) -> Self {
        let mut trb = Trb::new();
        trb.set_pointer(buffer);
        trb.status = length & 0x1_FFFF;
        trb.set_type(TrbType::DataStage);
        if dir_in {
            trb.control |= DIRECTION_IN;
        }
        trb
    }

    /// Status stage; its direction is the opposite of the data stage (IN when
    /// there is no data stage).
    pub fn status_stage(dir_in: bool) -> Self {
        let mut trb = Trb::new();
        trb.set_type(TrbType::StatusStage);
        trb.control |= INTERRUPT_ON_COMPLETION;
        if dir_in {
            trb.control |= DIRECTION_IN;
        }
        trb
    }

    pub fn normal(buffer: u64, length: u32) -> Self {
        let mut trb = Trb::new();
        trb.set_pointer(buffer);
        trb.status = length & 0x1_FFFF;
        trb.set_type(TrbType::Normal);
        trb.control |= INTERRUPT_ON_COMPLETION | INTERRUPT_ON_SHORT_PACKET;
        trb
    }
}

/// TRT field of a Setup Stage TRB.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupTransferType {
    NoData = 0,
    Out = 2,
    In = 3,
}

/// TRB types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrbType {
    Normal = 1,
    SetupStage = 2,
    DataStage = 3,
    StatusStage = 4,
    Isoch = 5,
    Link = 6,
    EventData = 7,
    NoOp = 8,
    EnableSlot = 9,
    DisableSlot = 10,
    AddressDevice = 11,
    ConfigureEndpoint = 12,
    EvaluateContext = 13,
    ResetEndpoint = 14,
    StopEndpoint = 15,
    SetTrDequeuePointer = 16,
    ResetDevice = 17,
    NoOpCmd = 23,
    TransferEvent = 32,
    CommandCompletion = 33,
    PortStatusChange = 34,
    BandwidthRequest = 35,
    Doorbell = 36,
    HostController = 37,
    DeviceNotification = 38,
    MfindexWrap = 39,
}

impl TrbType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => TrbType::Normal,
            2 => TrbType::SetupStage,
            3 => TrbType::DataStage,
            4 => TrbType::StatusStage,
            5 => TrbType::Isoch,
            6 => TrbType::Link,
            7 => TrbType::EventData,
            8 => TrbType::NoOp,
            9 => TrbType::EnableSlot,
            10 => TrbType::DisableSlot,
            11 => TrbType::AddressDevice,
            12 => TrbType::ConfigureEndpoint,
            13 => TrbType::EvaluateContext,
            14 => TrbType::ResetEndpoint,
            15 => TrbType::StopEndpoint,
            16 => TrbType::SetTrDequeuePointer,
            17 => TrbType::ResetDevice,
            23 => TrbType::NoOpCmd,
            32 => TrbType::TransferEvent,
            33 => TrbType::CommandCompletion,
            34 => TrbType::PortStatusChange,
            35 => TrbType::BandwidthRequest,
            36 => TrbType::Doorbell,
            37 => TrbType::HostController,
            38 => TrbType::DeviceNotification,
            39 => TrbType::MfindexWrap,
            _ => return None,
        })
    }
}

/// Completion code as reported by the controller, kept verbatim.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompletionCode(pub u8);

impl CompletionCode {
    pub const INVALID: Self = Self(0);
    pub const SUCCESS: Self = Self(1);
    pub const DATA_BUFFER_ERROR: Self = Self(2);
    pub const BABBLE_DETECTED: Self = Self(3);
    pub const USB_TRANSACTION_ERROR: Self = Self(4);
    pub const TRB_ERROR: Self = Self(5);
    pub const STALL: Self = Self(6);
    pub const RESOURCE_ERROR: Self = Self(7);
    pub const BANDWIDTH_ERROR: Self = Self(8);
    pub const NO_SLOTS_AVAILABLE: Self = Self(9);
    pub const SLOT_NOT_ENABLED: Self = Self(11);
    pub const ENDPOINT_NOT_ENABLED: Self = Self(12);
    pub const SHORT_PACKET: Self = Self(13);
    pub const RING_UNDERRUN: Self = Self(14);
    pub const RING_OVERRUN: Self = Self(15);
    pub const PARAMETER_ERROR: Self = Self(17);
    pub const CONTEXT_STATE_ERROR: Self = Self(19);
    pub const EVENT_RING_FULL: Self = Self(21);
    pub const INCOMPATIBLE_DEVICE: Self = Self(22);
    pub const COMMAND_RING_STOPPED: Self = Self(24);
    pub const COMMAND_ABORTED: Self = Self(25);
    pub const STOPPED: Self = Self(26);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Success or Short Packet: the transfer delivered data.
    pub fn is_transfer_ok(self) -> bool {
        self == Self::SUCCESS || self == Self::SHORT_PACKET
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "invalid",
            1 => "success",
            2 => "data buffer error",
            3 => "babble detected",
            4 => "usb transaction error",
            5 => "trb error",
            6 => "stall",
            7 => "resource error",
            8 => "bandwidth error",
            9 => "no slots available",
            10 => "invalid stream type",
            11 => "slot not enabled",
            12 => "endpoint not enabled",
            13 => "short packet",
            14 => "ring underrun",
            15 => "ring overrun",
            16 => "vf event ring full",
            17 => "parameter error",
            18 => "bandwidth overrun",
            19 => "context state error",
            20 => "no ping response",
            21 => "event ring full",
            22 => "incompatible device",
            23 => "missed service",
            24 => "command ring stopped",
            25 => "command aborted",
            26 => "stopped",
            27 => "stopped - length invalid",
            28 => "stopped - short packet",
            29 => "max exit latency too large",
            31 => "isoch buffer overrun",
            32 => "event lost",
            33 => "undefined error",
            34 => "invalid stream id",
            35 => "secondary bandwidth error",
            36 => "split transaction error",
            192..=223 => "vendor defined error",
            224..=255 => "vendor defined info",
            _ => "reserved",
        }
    }
}

impl fmt::Debug for CompletionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompletionCode({}: {})", self.0, self.name())
    }
}

impl fmt::Display for CompletionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}
