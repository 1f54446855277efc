//! Boot-protocol mouse: buttons, relative X/Y and an optional wheel byte.

use kestrel_lib::{klog_debug, klog_info};

use super::InputSink;

pub const MIN_REPORT_LEN: usize = 3;
const BUTTON_MASK: u8 = 0x07;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MouseReport {
    pub buttons: u8,
    pub dx: i8,
    pub dy: i8,
    pub scroll: i8,
}

impl MouseReport {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < MIN_REPORT_LEN {
            return None;
        }
        Some(Self {
            buttons: data[0] & BUTTON_MASK,
            dx: data[1] as i8,
            dy: data[2] as i8,
            scroll: data.get(3).map_or(0, |&b| b as i8),
        })
    }
}

#[derive(Default)]
pub struct HidMouse {
    slot: Option<u8>,
}

impl HidMouse {
    pub const fn new() -> Self {
        Self { slot: None }
    }

    pub fn register_device(&mut self, slot: u8) {
        self.slot = Some(slot);
        klog_info!("usb-mouse: mouse on slot {}", slot);
    }

    pub fn unregister(&mut self, slot: u8) {
        if self.slot == Some(slot) {
            self.slot = None;
            klog_info!("usb-mouse: slot {} detached", slot);
        }
    }

    pub fn slot(&self) -> Option<u8> {
        self.slot
    }

    pub fn process_report(&mut self, data: &[u8], sink: &dyn InputSink) {
        match MouseReport::parse(data) {
            Some(report) => sink.mouse(report),
            None => klog_debug!("usb-mouse: short report ({} bytes)", data.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_masks_buttons_and_signs_axes() {
        let r = MouseReport::parse(&[0xFF, 0xFE, 0x05]).expect("3 bytes");
        assert_eq!(
            r,
            MouseReport {
                buttons: 7,
                dx: -2,
                dy: 5,
                scroll: 0
            }
        );
        let r = MouseReport::parse(&[0x01, 0, 0, 0xFF, 0xAA]).expect("wheel");
        assert_eq!(r.scroll, -1);
        assert_eq!(r.buttons, 1);
    }

    #[test]
    fn short_reports_rejected() {
        assert!(MouseReport::parse(&[]).is_none());
        assert!(MouseReport::parse(&[1, 2]).is_none());
    }
}
