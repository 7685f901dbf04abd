//! USB subsystem.
//!
//! Chapter 9 types shared by the host controller driver and the class
//! drivers: speeds, descriptors and setup packets.

pub mod class;
pub mod xhci;

/// Velocidade USB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,       // 1.5 Mbps (USB 1.0)
    Full,      // 12 Mbps (USB 1.1)
    High,      // 480 Mbps (USB 2.0)
    Super,     // 5 Gbps (USB 3.0)
    SuperPlus, // 10 Gbps (USB 3.1)
}

impl UsbSpeed {
    /// Decodes the default xHCI protocol speed IDs of PORTSC.
    pub fn from_xhci_speed(speed: u8) -> Option<Self> {
        match speed {
            1 => Some(UsbSpeed::Full),
            2 => Some(UsbSpeed::Low),
            3 => Some(UsbSpeed::High),
            4 => Some(UsbSpeed::Super),
            5 => Some(UsbSpeed::SuperPlus),
            _ => None,
        }
    }

    /// Speed value for the slot context (same encoding as PORTSC).
    pub fn xhci_speed(self) -> u8 {
        match self {
            UsbSpeed::Full => 1,
            UsbSpeed::Low => 2,
            UsbSpeed::High => 3,
            UsbSpeed::Super => 4,
            UsbSpeed::SuperPlus => 5,
        }
    }

    /// EP0 max packet size to use before the device descriptor is known.
    pub fn default_max_packet_size(self) -> u16 {
        match self {
            UsbSpeed::Low | UsbSpeed::Full => 8,
            UsbSpeed::High => 64,
            UsbSpeed::Super | UsbSpeed::SuperPlus => 512,
        }
    }
}

/// Tipos de endpoint USB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Direção do endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointDirection {
    Out, // Host -> Device
    In,  // Device -> Host
}

/// Descritor de dispositivo USB (primeiro descritor retornado)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const LENGTH: usize = 18;

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::LENGTH || bytes[1] != DescriptorType::Device as u8 {
            return None;
        }
        Some(Self {
            usb_version: le16(bytes, 2),
            device_class: bytes[4],
            device_subclass: bytes[5],
            device_protocol: bytes[6],
            max_packet_size0: bytes[7],
            vendor_id: le16(bytes, 8),
            product_id: le16(bytes, 10),
            num_configurations: bytes[17],
        })
    }

    /// EP0 max packet size in bytes (USB 3 devices encode it as a power of two).
    pub fn ep0_max_packet_size(&self) -> u16 {
        if self.usb_version >= 0x0300 {
            1u16 << self.max_packet_size0.min(9)
        } else {
            self.max_packet_size0 as u16
        }
    }
}

/// Descritor de configuração USB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDescriptor {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub attributes: u8,
    pub max_power: u8,
}

impl ConfigDescriptor {
    pub const LENGTH: usize = 9;

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::LENGTH || bytes[1] != DescriptorType::Configuration as u8 {
            return None;
        }
        Some(Self {
            total_length: le16(bytes, 2),
            num_interfaces: bytes[4],
            configuration_value: bytes[5],
            attributes: bytes[7],
            max_power: bytes[8],
        })
    }
}

/// Descritor de interface USB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
}

impl InterfaceDescriptor {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 9 || bytes[1] != DescriptorType::Interface as u8 {
            return None;
        }
        Some(Self {
            interface_number: bytes[2],
            alternate_setting: bytes[3],
            num_endpoints: bytes[4],
            interface_class: bytes[5],
            interface_subclass: bytes[6],
            interface_protocol: bytes[7],
        })
    }
}

/// Descritor de endpoint USB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 7 || bytes[1] != DescriptorType::Endpoint as u8 {
            return None;
        }
        Some(Self {
            endpoint_address: bytes[2],
            attributes: bytes[3],
            max_packet_size: le16(bytes, 4),
            interval: bytes[6],
        })
    }

    pub fn endpoint_number(&self) -> u8 {
        self.endpoint_address & 0x0F
    }

    pub fn direction(&self) -> EndpointDirection {
        if self.endpoint_address & 0x80 != 0 {
            EndpointDirection::In
        } else {
            EndpointDirection::Out
        }
    }

    pub fn transfer_type(&self) -> EndpointType {
        match self.attributes & 0x03 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }

    /// Device context index: `2 * number + 1` for IN, `2 * number` for OUT.
    pub fn dci(&self) -> u8 {
        let number = self.endpoint_number();
        match self.direction() {
            EndpointDirection::In => number * 2 + 1,
            EndpointDirection::Out => number * 2,
        }
    }

    /// Packet size without the high-bandwidth multiplier bits.
    pub fn packet_size(&self) -> u16 {
        self.max_packet_size & 0x07FF
    }
}

/// Walks the descriptors of a configuration descriptor set.
pub struct DescriptorIter<'a> {
    bytes: &'a [u8],
}

impl<'a> DescriptorIter<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    /// (descriptor type, whole descriptor)
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.len() < 2 {
            return None;
        }
        let length = self.bytes[0] as usize;
        if length < 2 || length > self.bytes.len() {
            // Truncated or corrupt set: stop instead of looping on it.
            self.bytes = &[];
            return None;
        }
        let (current, rest) = self.bytes.split_at(length);
        self.bytes = rest;
        Some((current[1], current))
    }
}

/// Requests USB padrão
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum StandardRequest {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
    GetInterface = 10,
    SetInterface = 11,
    SynchFrame = 12,
}

/// Tipos de descritores USB
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    Hid = 0x21,
    Report = 0x22,
    SsEndpointCompanion = 48,
}

/// Setup packet USB (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn get_descriptor(desc_type: DescriptorType, index: u8, length: u16) -> Self {
        Self {
            request_type: 0x80, // Device to Host, Standard, Device
            request: StandardRequest::GetDescriptor as u8,
            value: ((desc_type as u16) << 8) | (index as u16),
            index: 0,
            length,
        }
    }

    pub fn set_configuration(config: u8) -> Self {
        Self {
            request_type: 0x00,
            request: StandardRequest::SetConfiguration as u8,
            value: config as u16,
            index: 0,
            length: 0,
        }
    }

    pub fn is_device_to_host(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// Classes USB comuns
pub mod class_code {
    pub const INTERFACE_CLASS: u8 = 0x00;
    pub const HID: u8 = 0x03;
    pub const HUB: u8 = 0x09;
    pub const VENDOR: u8 = 0xFF;
}

fn le16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}
