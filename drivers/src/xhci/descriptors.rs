//! Standard USB descriptors and the requests that fetch them.

use super::trb::SetupPacket;

pub const DESC_DEVICE: u8 = 1;
pub const DESC_CONFIGURATION: u8 = 2;
pub const DESC_INTERFACE: u8 = 4;
pub const DESC_ENDPOINT: u8 = 5;

pub const REQ_GET_DESCRIPTOR: u8 = 0x06;
pub const REQ_SET_CONFIGURATION: u8 = 0x09;
pub const HID_REQ_SET_IDLE: u8 = 0x0A;
pub const HID_REQ_SET_PROTOCOL: u8 = 0x0B;

pub const USB_CLASS_HID: u8 = 0x03;
pub const HID_SUBCLASS_BOOT: u8 = 0x01;
pub const HID_PROTOCOL_KEYBOARD: u8 = 0x01;
pub const HID_PROTOCOL_MOUSE: u8 = 0x02;

pub const DEVICE_DESCRIPTOR_LEN: u16 = 18;
pub const CONFIG_HEADER_LEN: u16 = 9;

/// Idle rate in 4 ms units; 4 gives a report roughly every 16 ms.
pub const HID_IDLE_RATE: u16 = 4;

pub const fn get_descriptor(desc_type: u8, index: u8, length: u16) -> SetupPacket {
    SetupPacket {
        request_type: 0x80,
        request: REQ_GET_DESCRIPTOR,
        value: ((desc_type as u16) << 8) | index as u16,
        index: 0,
        length,
    }
}

pub const fn set_configuration(value: u8) -> SetupPacket {
    SetupPacket {
        request_type: 0x00,
        request: REQ_SET_CONFIGURATION,
        value: value as u16,
        index: 0,
        length: 0,
    }
}

/// SET_PROTOCOL(boot) on `interface`.
pub const fn hid_set_boot_protocol(interface: u8) -> SetupPacket {
    SetupPacket {
        request_type: 0x21,
        request: HID_REQ_SET_PROTOCOL,
        value: 0,
        index: interface as u16,
        length: 0,
    }
}

pub const fn hid_set_idle(interface: u8, rate: u16) -> SetupPacket {
    SetupPacket {
        request_type: 0x21,
        request: HID_REQ_SET_IDLE,
        value: rate << 8,
        index: interface as u16,
        length: 0,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub class: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < DEVICE_DESCRIPTOR_LEN as usize || b[1] != DESC_DEVICE {
            return None;
        }
        Some(Self {
            usb_version: u16::from_le_bytes([b[2], b[3]]),
            class: b[4],
            max_packet_size0: b[7],
            vendor_id: u16::from_le_bytes([b[8], b[9]]),
            product_id: u16::from_le_bytes([b[10], b[11]]),
            num_configurations: b[17],
        })
    }
}

/// The one interface this driver cares about: a boot HID function and its
/// interrupt IN endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HidInterface {
    pub configuration_value: u8,
    pub interface_number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoint: u8,
    pub max_packet: u16,
    pub interval: u8,
}

/// `wTotalLength` of a configuration descriptor header.
pub fn config_total_length(header: &[u8]) -> Option<u16> {
    if header.len() < CONFIG_HEADER_LEN as usize || header[1] != DESC_CONFIGURATION {
        return None;
    }
    Some(u16::from_le_bytes([header[2], header[3]]))
}

/// Walk a full configuration descriptor for the first HID interface that
/// has an interrupt IN endpoint.
pub fn find_hid_interface(config: &[u8]) -> Option<HidInterface> {
    if config.len() < CONFIG_HEADER_LEN as usize || config[1] != DESC_CONFIGURATION {
        return None;
    }
    let configuration_value = config[5];
    let mut current: Option<HidInterface> = None;
    let mut off = 0usize;

    while off + 2 <= config.len() {
        let len = config[off] as usize;
        if len < 2 || off + len > config.len() {
            break;
        }
        let d = &config[off..off + len];
        match d[1] {
            DESC_INTERFACE if len >= 9 => {
                current = (d[5] == USB_CLASS_HID).then_some(HidInterface {
                    configuration_value,
                    interface_number: d[2],
                    class: d[5],
                    subclass: d[6],
                    protocol: d[7],
                    ..HidInterface::default()
                });
            }
            DESC_ENDPOINT if len >= 7 => {
                if let Some(mut iface) = current {
                    let is_in = d[2] & 0x80 != 0;
                    let is_interrupt = d[3] & 0x03 == 0x03;
                    if is_in && is_interrupt {
                        iface.endpoint = d[2] & 0x0F;
                        iface.max_packet = u16::from_le_bytes([d[4], d[5]]) & 0x07FF;
                        iface.interval = d[6];
                        return Some(iface);
                    }
                }
            }
            _ => {}
        }
        off += len;
    }
    None
}
