//! PS/2-compatible input queue.
//!
//! USB HID drivers translate their reports into set-1 scancodes and relative
//! pointer motion and inject them here, so consumers read keyboard and mouse
//! input the same way regardless of which controller produced it.
//!
//! Three queues live behind one lock:
//! - structured [`InputEvent`]s (keys and pointer), oldest overwritten when full
//! - raw set-1 bytes, break bit set on release
//! - translated characters for line-oriented readers

use kestrel_lib::{Clock, IrqMutex, RingBuffer};
use spin::Once;

pub use kestrel_abi::{
    INPUT_QUEUE_CAPACITY, InputEvent, InputEventData, InputEventType, MOUSE_BUTTON_LEFT,
    MOUSE_BUTTON_MIDDLE, MOUSE_BUTTON_RIGHT, SCANCODE_RELEASE,
};

const CHAR_BUFFER_SIZE: usize = 256;
const SCANCODE_BUFFER_SIZE: usize = 256;

static TIMESTAMP_CLOCK: Once<&'static (dyn Clock + Sync)> = Once::new();

/// Install the clock used to timestamp injected events. First call wins.
pub fn input_set_clock(clock: &'static (dyn Clock + Sync)) {
    TIMESTAMP_CLOCK.call_once(|| clock);
}

/// Milliseconds since boot, or 0 before a clock is installed.
pub fn get_timestamp_ms() -> u64 {
    TIMESTAMP_CLOCK.get().map_or(0, |c| c.now_ms())
}

/// One key transition, already translated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyEvent {
    /// Set-1 make code.
    pub scancode: u8,
    /// Character produced by a press, 0 for none.
    pub ascii: u8,
    pub pressed: bool,
    pub shift: bool,
    pub ctrl: bool,
    pub alt: bool,
    pub caps_lock: bool,
}

// =============================================================================
// Queue
// =============================================================================

struct QueueState {
    events: RingBuffer<InputEvent, INPUT_QUEUE_CAPACITY>,
    scancodes: RingBuffer<u8, SCANCODE_BUFFER_SIZE>,
    chars: RingBuffer<u8, CHAR_BUFFER_SIZE>,
    buttons: u8,
}

impl QueueState {
    const fn new() -> Self {
        Self {
            events: RingBuffer::new_with(InputEvent::key(false, 0, 0)),
            scancodes: RingBuffer::new_with(0),
            chars: RingBuffer::new_with(0),
            buttons: 0,
        }
    }
}

pub struct InputQueue {
    state: IrqMutex<QueueState>,
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InputQueue {
    pub const fn new() -> Self {
        Self {
            state: IrqMutex::new(QueueState::new()),
        }
    }

    pub fn inject_key_event(&self, key: KeyEvent, timestamp_ms: u64) {
        let mut state = self.state.lock();
        state
            .events
            .push_overwrite(InputEvent::key(key.pressed, key.scancode, timestamp_ms));
        let raw = if key.pressed {
            key.scancode
        } else {
            key.scancode | SCANCODE_RELEASE
        };
        state.scancodes.push_overwrite(raw);
        if key.pressed && key.ascii != 0 {
            state.chars.push_overwrite(key.ascii);
        }
    }

    /// One relative mouse report. Motion, each changed button and a non-zero
    /// wheel become separate events, in that order.
    pub fn inject_mouse_report(&self, buttons: u8, dx: i8, dy: i8, scroll: i8, timestamp_ms: u64) {
        let mut state = self.state.lock();
        if dx != 0 || dy != 0 {
            state.events.push_overwrite(InputEvent::pointer_motion(
                dx as i32,
                dy as i32,
                timestamp_ms,
            ));
        }
        let buttons = buttons & (MOUSE_BUTTON_LEFT | MOUSE_BUTTON_RIGHT | MOUSE_BUTTON_MIDDLE);
        let changed = state.buttons ^ buttons;
        for bit in [MOUSE_BUTTON_LEFT, MOUSE_BUTTON_RIGHT, MOUSE_BUTTON_MIDDLE] {
            if changed & bit != 0 {
                state.events.push_overwrite(InputEvent::pointer_button(
                    buttons & bit != 0,
                    bit,
                    timestamp_ms,
                ));
            }
        }
        state.buttons = buttons;
        if scroll != 0 {
            state
                .events
                .push_overwrite(InputEvent::pointer_scroll(scroll as i32, timestamp_ms));
        }
    }

    pub fn pop_event(&self) -> Option<InputEvent> {
        self.state.lock().events.try_pop()
    }

    pub fn peek_event(&self) -> Option<InputEvent> {
        self.state.lock().events.peek().copied()
    }

    /// Drain up to `out.len()` events under one lock acquisition.
    pub fn drain_events(&self, out: &mut [InputEvent]) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        while count < out.len() {
            let Some(event) = state.events.try_pop() else {
                break;
            };
            out[count] = event;
            count += 1;
        }
        count
    }

    pub fn event_count(&self) -> u32 {
        self.state.lock().events.len()
    }

    /// Next raw set-1 byte, 0 when empty.
    pub fn get_scancode(&self) -> u8 {
        self.state.lock().scancodes.try_pop().unwrap_or(0)
    }

    /// Next character, 0 when empty.
    pub fn getchar(&self) -> u8 {
        self.state.lock().chars.try_pop().unwrap_or(0)
    }

    pub fn has_input(&self) -> bool {
        !self.state.lock().chars.is_empty()
    }

    pub fn buttons(&self) -> u8 {
        self.state.lock().buttons
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.events.reset();
        state.scancodes.reset();
        state.chars.reset();
        state.buttons = 0;
    }
}

// =============================================================================
// Global queue
// =============================================================================

pub static INPUT: InputQueue = InputQueue::new();

pub fn input_inject_key(key: KeyEvent) {
    INPUT.inject_key_event(key, get_timestamp_ms());
}

pub fn input_inject_mouse(buttons: u8, dx: i8, dy: i8, scroll: i8) {
    INPUT.inject_mouse_report(buttons, dx, dy, scroll, get_timestamp_ms());
}

pub fn input_poll() -> Option<InputEvent> {
    INPUT.pop_event()
}

pub fn input_getchar() -> u8 {
    INPUT.getchar()
}

pub fn input_has_input() -> bool {
    INPUT.has_input()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(scancode: u8, ascii: u8, pressed: bool) -> KeyEvent {
        KeyEvent {
            scancode,
            ascii,
            pressed,
            ..KeyEvent::default()
        }
    }

    #[test]
    fn keys_feed_events_scancodes_and_chars() {
        let q = InputQueue::new();
        q.inject_key_event(key(0x1E, b'a', true), 5);
        q.inject_key_event(key(0x1E, 0, false), 6);
        q.inject_key_event(key(0x3B, 0, true), 7);

        assert!(q.has_input());
        assert_eq!(q.getchar(), b'a');
        assert_eq!(q.getchar(), 0);

        assert_eq!(q.get_scancode(), 0x1E);
        assert_eq!(q.get_scancode(), 0x9E);
        assert_eq!(q.get_scancode(), 0x3B);

        let ev = q.pop_event().expect("press");
        assert_eq!(ev.event_type, InputEventType::KeyPress);
        assert_eq!(ev.key_scancode(), 0x1E);
        assert_eq!(ev.timestamp_ms, 5);
        let ev = q.pop_event().expect("release");
        assert_eq!(ev.raw_scancode(), 0x9E);
        assert_eq!(q.event_count(), 1);
    }

    #[test]
    fn mouse_report_splits_into_events() {
        let q = InputQueue::new();
        q.inject_mouse_report(MOUSE_BUTTON_LEFT, 3, -2, 0, 1);
        assert_eq!(q.buttons(), MOUSE_BUTTON_LEFT);

        let motion = q.pop_event().expect("motion");
        assert_eq!(motion.event_type, InputEventType::PointerMotion);
        assert_eq!((motion.pointer_dx(), motion.pointer_dy()), (3, -2));
        let press = q.pop_event().expect("button");
        assert_eq!(press.event_type, InputEventType::PointerButtonPress);
        assert_eq!(press.pointer_button_code(), MOUSE_BUTTON_LEFT);
        assert!(q.pop_event().is_none());

        // Same buttons, no motion, wheel only.
        q.inject_mouse_report(MOUSE_BUTTON_LEFT | 0xF8, 0, 0, -1, 2);
        let scroll = q.pop_event().expect("scroll");
        assert_eq!(scroll.event_type, InputEventType::PointerScroll);
        assert_eq!(scroll.scroll_delta(), -1);
        assert!(q.pop_event().is_none());

        q.inject_mouse_report(MOUSE_BUTTON_RIGHT, 0, 0, 0, 3);
        let mut out = [InputEvent::default(); 4];
        assert_eq!(q.drain_events(&mut out), 2);
        assert_eq!(out[0].event_type, InputEventType::PointerButtonRelease);
        assert_eq!(out[1].event_type, InputEventType::PointerButtonPress);
        assert_eq!(out[1].pointer_button_code(), MOUSE_BUTTON_RIGHT);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let q = InputQueue::new();
        for i in 0..(INPUT_QUEUE_CAPACITY as u64 + 3) {
            q.inject_key_event(key(0x10, 0, true), i);
        }
        assert_eq!(q.event_count(), INPUT_QUEUE_CAPACITY as u32);
        assert_eq!(q.peek_event().map(|e| e.timestamp_ms), Some(3));
        q.clear();
        assert!(q.pop_event().is_none());
        assert!(!q.has_input());
    }
}
