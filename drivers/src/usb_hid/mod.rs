//! USB HID boot-protocol keyboard and mouse.
//!
//! The xHCI driver hands completed interrupt-IN reports to [`BootHid`], which
//! routes them by slot to the keyboard or mouse translator. Translated events
//! go to an [`InputSink`], normally the global PS/2-compatible queue.

pub mod keyboard;
pub mod keymap;
pub mod mouse;

use kestrel_lib::{IrqMutex, klog_debug, klog_info};

pub use keyboard::HidKeyboard;
pub use mouse::{HidMouse, MouseReport};

use crate::input_event::{INPUT, InputQueue, KeyEvent, get_timestamp_ms};
use crate::xhci::descriptors::{HID_PROTOCOL_KEYBOARD, HID_PROTOCOL_MOUSE};
use crate::xhci::{HidHandler, UsbDeviceInfo};

pub trait InputSink: Sync {
    fn key(&self, event: KeyEvent);
    fn mouse(&self, report: MouseReport);
}

impl InputSink for InputQueue {
    fn key(&self, event: KeyEvent) {
        self.inject_key_event(event, get_timestamp_ms());
    }

    fn mouse(&self, report: MouseReport) {
        self.inject_mouse_report(
            report.buttons,
            report.dx,
            report.dy,
            report.scroll,
            get_timestamp_ms(),
        );
    }
}

/// One boot keyboard and one boot mouse. A second device of the same kind
/// replaces the first.
pub struct BootHid {
    keyboard: IrqMutex<HidKeyboard>,
    mouse: IrqMutex<HidMouse>,
    sink: &'static dyn InputSink,
}

impl BootHid {
    pub const fn new(sink: &'static dyn InputSink) -> Self {
        Self {
            keyboard: IrqMutex::new(HidKeyboard::new()),
            mouse: IrqMutex::new(HidMouse::new()),
            sink,
        }
    }

    pub fn keyboard_slot(&self) -> Option<u8> {
        self.keyboard.lock().slot()
    }

    pub fn mouse_slot(&self) -> Option<u8> {
        self.mouse.lock().slot()
    }
}

impl HidHandler for BootHid {
    fn attach(&self, dev: &UsbDeviceInfo) {
        match dev.interface_protocol {
            HID_PROTOCOL_KEYBOARD => self.keyboard.lock().register_device(dev.slot_id),
            HID_PROTOCOL_MOUSE => self.mouse.lock().register_device(dev.slot_id),
            other => klog_info!(
                "xhci: slot {} HID protocol {} not handled",
                dev.slot_id,
                other
            ),
        }
    }

    fn detach(&self, dev: &UsbDeviceInfo) {
        self.keyboard.lock().unregister(dev.slot_id);
        self.mouse.lock().unregister(dev.slot_id);
    }

    fn report(&self, dev: &UsbDeviceInfo, data: &[u8]) {
        {
            let mut kbd = self.keyboard.lock();
            if kbd.slot() == Some(dev.slot_id) {
                kbd.process_report(data, self.sink);
                return;
            }
        }
        let mut mouse = self.mouse.lock();
        if mouse.slot() == Some(dev.slot_id) {
            mouse.process_report(data, self.sink);
        } else {
            klog_debug!("xhci: report from unclaimed slot {}", dev.slot_id);
        }
    }
}

pub static USB_HID: BootHid = BootHid::new(&INPUT);
