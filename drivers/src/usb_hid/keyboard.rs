//! Boot-protocol keyboard: 8-byte reports diffed into set-1 key events.

use kestrel_lib::{klog_debug, klog_info};

use super::InputSink;
use super::keymap::{
    USAGE_CAPS_LOCK, USAGE_ERROR_ROLLOVER, is_non_char_usage, scancode_to_ascii, usage_to_scancode,
};
use crate::input_event::KeyEvent;

pub const BOOT_REPORT_LEN: usize = 8;

/// Reports a key must be held before it starts repeating.
pub const TYPEMATIC_DELAY: u32 = 31;
/// Reports between repeats once repeating.
pub const TYPEMATIC_PERIOD: u32 = 2;

const MOD_LCTRL: u8 = 1 << 0;
const MOD_LSHIFT: u8 = 1 << 1;
const MOD_LALT: u8 = 1 << 2;
const MOD_RCTRL: u8 = 1 << 4;
const MOD_RSHIFT: u8 = 1 << 5;
const MOD_RALT: u8 = 1 << 6;

/// Modifier bit to the set-1 make code it stands for. Right ctrl/alt are
/// E0-prefixed on PS/2; the queue carries single bytes so they share the
/// left-hand codes.
const MODIFIER_SCANCODES: [(u8, u8); 6] = [
    (MOD_LCTRL, 0x1D),
    (MOD_LSHIFT, 0x2A),
    (MOD_LALT, 0x38),
    (MOD_RCTRL, 0x1D),
    (MOD_RSHIFT, 0x36),
    (MOD_RALT, 0x38),
];

pub struct HidKeyboard {
    slot: Option<u8>,
    prev: [u8; BOOT_REPORT_LEN],
    repeat_usage: u8,
    hold: u32,
    caps_lock: bool,
}

impl Default for HidKeyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl HidKeyboard {
    pub const fn new() -> Self {
        Self {
            slot: None,
            prev: [0; BOOT_REPORT_LEN],
            repeat_usage: 0,
            hold: 0,
            caps_lock: false,
        }
    }

    pub fn register_device(&mut self, slot: u8) {
        *self = Self::new();
        self.slot = Some(slot);
        klog_info!("usb-kbd: keyboard on slot {}", slot);
    }

    /// Forget the device. Keys still down get no release event.
    pub fn unregister(&mut self, slot: u8) {
        if self.slot == Some(slot) {
            *self = Self::new();
            klog_info!("usb-kbd: slot {} detached", slot);
        }
    }

    pub fn slot(&self) -> Option<u8> {
        self.slot
    }

    pub fn caps_lock(&self) -> bool {
        self.caps_lock
    }

    pub fn process_report(&mut self, data: &[u8], sink: &dyn InputSink) {
        let Some(report) = data.get(..BOOT_REPORT_LEN) else {
            klog_debug!("usb-kbd: short report ({} bytes)", data.len());
            return;
        };
        let mut cur = [0u8; BOOT_REPORT_LEN];
        cur.copy_from_slice(report);

        if cur[2..].contains(&USAGE_ERROR_ROLLOVER) {
            return;
        }

        let mods = cur[0];
        let changed = self.prev[0] ^ mods;
        for (bit, scancode) in MODIFIER_SCANCODES {
            if changed & bit != 0 {
                sink.key(self.event(scancode, 0, mods & bit != 0, mods));
            }
        }

        for &usage in &self.prev[2..] {
            if usage == 0 || cur[2..].contains(&usage) {
                continue;
            }
            if usage == self.repeat_usage {
                self.repeat_usage = 0;
                self.hold = 0;
            }
            let scancode = usage_to_scancode(usage);
            if scancode != 0 {
                sink.key(self.event(scancode, 0, false, mods));
            }
        }

        let mut pressed_new = false;
        for &usage in &cur[2..] {
            if usage == 0 || self.prev[2..].contains(&usage) {
                continue;
            }
            let scancode = usage_to_scancode(usage);
            if scancode == 0 {
                continue;
            }
            pressed_new = true;
            if usage == USAGE_CAPS_LOCK {
                self.caps_lock = !self.caps_lock;
            } else {
                self.repeat_usage = usage;
                self.hold = 0;
            }
            sink.key(self.press(usage, scancode, mods));
        }

        if !pressed_new && self.repeat_usage != 0 && cur[2..].contains(&self.repeat_usage) {
            self.hold += 1;
            if self.hold >= TYPEMATIC_DELAY && (self.hold - TYPEMATIC_DELAY) % TYPEMATIC_PERIOD == 0
            {
                let usage = self.repeat_usage;
                sink.key(self.press(usage, usage_to_scancode(usage), mods));
            }
        }

        self.prev = cur;
    }

    fn press(&self, usage: u8, scancode: u8, mods: u8) -> KeyEvent {
        let ascii = if is_non_char_usage(usage) {
            0
        } else {
            scancode_to_ascii(
                scancode,
                mods & (MOD_LSHIFT | MOD_RSHIFT) != 0,
                self.caps_lock,
                mods & (MOD_LCTRL | MOD_RCTRL) != 0,
            )
        };
        self.event(scancode, ascii, true, mods)
    }

    fn event(&self, scancode: u8, ascii: u8, pressed: bool, mods: u8) -> KeyEvent {
        KeyEvent {
            scancode,
            ascii,
            pressed,
            shift: mods & (MOD_LSHIFT | MOD_RSHIFT) != 0,
            ctrl: mods & (MOD_LCTRL | MOD_RCTRL) != 0,
            alt: mods & (MOD_LALT | MOD_RALT) != 0,
            caps_lock: self.caps_lock,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb_hid::MouseReport;
    use kestrel_lib::IrqMutex;
    use std::vec::Vec;

    #[derive(Default)]
    struct Collect {
        keys: IrqMutex<Vec<KeyEvent>>,
    }

    impl InputSink for Collect {
        fn key(&self, event: KeyEvent) {
            self.keys.lock().push(event);
        }
        fn mouse(&self, _report: MouseReport) {}
    }

    impl Collect {
        fn take(&self) -> Vec<(u8, u8, bool)> {
            core::mem::take(&mut *self.keys.lock())
                .into_iter()
                .map(|k| (k.scancode, k.ascii, k.pressed))
                .collect()
        }
    }

    fn report(mods: u8, keys: &[u8]) -> [u8; 8] {
        let mut r = [0u8; 8];
        r[0] = mods;
        r[2..2 + keys.len()].copy_from_slice(keys);
        r
    }

    fn keyboard() -> HidKeyboard {
        let mut kbd = HidKeyboard::new();
        kbd.register_device(1);
        kbd
    }

    #[test]
    fn press_and_release_letter() {
        let sink = Collect::default();
        let mut kbd = keyboard();
        kbd.process_report(&report(0, &[0x04]), &sink);
        kbd.process_report(&report(0, &[]), &sink);
        assert_eq!(sink.take(), [(0x1E, b'a', true), (0x1E, 0, false)]);
    }

    #[test]
    fn shift_modifier_emits_scancode_and_uppercases() {
        let sink = Collect::default();
        let mut kbd = keyboard();
        kbd.process_report(&report(MOD_LSHIFT, &[]), &sink);
        kbd.process_report(&report(MOD_LSHIFT, &[0x05]), &sink);
        kbd.process_report(&report(0, &[0x05]), &sink);
        assert_eq!(sink.take(), [(0x2A, 0, true), (0x30, b'B', true), (0x2A, 0, false)]);

        kbd.process_report(&report(MOD_RSHIFT | MOD_RCTRL, &[0x05]), &sink);
        assert_eq!(sink.take(), [(0x1D, 0, true), (0x36, 0, true)]);
    }

    #[test]
    fn ctrl_letter_produces_control_code() {
        let sink = Collect::default();
        let mut kbd = keyboard();
        kbd.process_report(&report(MOD_LCTRL, &[0x06]), &sink);
        assert_eq!(sink.take(), [(0x1D, 0, true), (0x2E, 0x03, true)]);
    }

    #[test]
    fn caps_lock_toggles_and_has_no_char() {
        let sink = Collect::default();
        let mut kbd = keyboard();
        kbd.process_report(&report(0, &[USAGE_CAPS_LOCK]), &sink);
        kbd.process_report(&report(0, &[]), &sink);
        assert!(kbd.caps_lock());
        kbd.process_report(&report(0, &[0x04]), &sink);
        assert_eq!(
            sink.take(),
            [(0x3A, 0, true), (0x3A, 0, false), (0x1E, b'A', true)]
        );
    }

    #[test]
    fn function_keys_have_no_ascii() {
        let sink = Collect::default();
        let mut kbd = keyboard();
        kbd.process_report(&report(0, &[0x3A]), &sink);
        assert_eq!(sink.take(), [(0x3B, 0, true)]);
    }

    #[test]
    fn error_rollover_and_short_reports_are_ignored() {
        let sink = Collect::default();
        let mut kbd = keyboard();
        kbd.process_report(&report(0, &[0x04]), &sink);
        sink.take();
        kbd.process_report(&report(0, &[USAGE_ERROR_ROLLOVER; 6]), &sink);
        kbd.process_report(&[0, 0, 0], &sink);
        assert!(sink.take().is_empty());
        // Previous state survives, so the key is still considered held.
        kbd.process_report(&report(0, &[]), &sink);
        assert_eq!(sink.take(), [(0x1E, 0, false)]);
    }

    #[test]
    fn unmapped_usage_is_ignored() {
        let sink = Collect::default();
        let mut kbd = keyboard();
        kbd.process_report(&report(0, &[0xE8]), &sink);
        kbd.process_report(&report(0, &[]), &sink);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn typematic_repeats_after_delay_then_every_period() {
        let sink = Collect::default();
        let mut kbd = keyboard();
        let held = report(0, &[0x04]);
        kbd.process_report(&held, &sink);
        assert_eq!(sink.take().len(), 1);

        for _ in 0..TYPEMATIC_DELAY - 1 {
            kbd.process_report(&held, &sink);
        }
        assert!(sink.take().is_empty());

        kbd.process_report(&held, &sink);
        assert_eq!(sink.take(), [(0x1E, b'a', true)]);
        kbd.process_report(&held, &sink);
        assert!(sink.take().is_empty());
        kbd.process_report(&held, &sink);
        assert_eq!(sink.take(), [(0x1E, b'a', true)]);
    }

    #[test]
    fn new_key_takes_over_repeat() {
        let sink = Collect::default();
        let mut kbd = keyboard();
        kbd.process_report(&report(0, &[0x04]), &sink);
        for _ in 0..10 {
            kbd.process_report(&report(0, &[0x04]), &sink);
        }
        kbd.process_report(&report(0, &[0x04, 0x05]), &sink);
        sink.take();
        for _ in 0..TYPEMATIC_DELAY {
            kbd.process_report(&report(0, &[0x04, 0x05]), &sink);
        }
        assert_eq!(sink.take(), [(0x30, b'b', true)]);
    }

    #[test]
    fn unregister_only_matches_own_slot() {
        let mut kbd = keyboard();
        kbd.unregister(2);
        assert_eq!(kbd.slot(), Some(1));
        kbd.unregister(1);
        assert_eq!(kbd.slot(), None);
    }
}
