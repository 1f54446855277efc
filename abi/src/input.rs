//! Input event types shared by the PS/2-compatible input queue.
//!
//! Keyboard events carry set-1 scancodes; pointer events carry relative
//! motion like a PS/2 mouse packet does.

/// Maximum events held by the input queue before the oldest is overwritten.
pub const INPUT_QUEUE_CAPACITY: usize = 64;

/// Set-1 break code bit (key release).
pub const SCANCODE_RELEASE: u8 = 0x80;

pub const MOUSE_BUTTON_LEFT: u8 = 1 << 0;
pub const MOUSE_BUTTON_RIGHT: u8 = 1 << 1;
pub const MOUSE_BUTTON_MIDDLE: u8 = 1 << 2;

/// Type of input event
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputEventType {
    #[default]
    KeyPress = 0,
    KeyRelease = 1,
    /// Relative pointer motion
    PointerMotion = 2,
    PointerButtonPress = 3,
    PointerButtonRelease = 4,
    /// Vertical wheel movement
    PointerScroll = 5,
}

impl InputEventType {
    #[inline]
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(Self::KeyPress),
            1 => Some(Self::KeyRelease),
            2 => Some(Self::PointerMotion),
            3 => Some(Self::PointerButtonPress),
            4 => Some(Self::PointerButtonRelease),
            5 => Some(Self::PointerScroll),
            _ => None,
        }
    }

    #[inline]
    pub fn is_key_event(self) -> bool {
        matches!(self, Self::KeyPress | Self::KeyRelease)
    }

    #[inline]
    pub fn is_pointer_event(self) -> bool {
        !self.is_key_event()
    }
}

/// Input event data
///
/// For key events: data0 holds the scancode.
/// For pointer motion: data0 is dx, data1 is dy (two's complement).
/// For pointer buttons: data0 holds the button mask bit.
/// For scroll: data0 is the signed wheel delta.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputEventData {
    pub data0: u32,
    pub data1: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputEvent {
    pub event_type: InputEventType,
    pub _padding: [u8; 3],
    /// Milliseconds since boot
    pub timestamp_ms: u64,
    pub data: InputEventData,
}

impl InputEvent {
    const fn with(event_type: InputEventType, data0: u32, data1: u32, timestamp_ms: u64) -> Self {
        Self {
            event_type,
            _padding: [0; 3],
            timestamp_ms,
            data: InputEventData { data0, data1 },
        }
    }

    pub const fn key(pressed: bool, scancode: u8, timestamp_ms: u64) -> Self {
        let kind = if pressed {
            InputEventType::KeyPress
        } else {
            InputEventType::KeyRelease
        };
        Self::with(kind, scancode as u32, 0, timestamp_ms)
    }

    pub const fn pointer_motion(dx: i32, dy: i32, timestamp_ms: u64) -> Self {
        Self::with(InputEventType::PointerMotion, dx as u32, dy as u32, timestamp_ms)
    }

    pub const fn pointer_button(pressed: bool, button: u8, timestamp_ms: u64) -> Self {
        let kind = if pressed {
            InputEventType::PointerButtonPress
        } else {
            InputEventType::PointerButtonRelease
        };
        Self::with(kind, button as u32, 0, timestamp_ms)
    }

    pub const fn pointer_scroll(delta: i32, timestamp_ms: u64) -> Self {
        Self::with(InputEventType::PointerScroll, delta as u32, 0, timestamp_ms)
    }

    /// Scancode of a key event
    #[inline]
    pub fn key_scancode(&self) -> u8 {
        (self.data.data0 & 0xFF) as u8
    }

    /// Set-1 byte as the PS/2 controller would deliver it (break bit on release).
    #[inline]
    pub fn raw_scancode(&self) -> u8 {
        match self.event_type {
            InputEventType::KeyRelease => self.key_scancode() | SCANCODE_RELEASE,
            _ => self.key_scancode(),
        }
    }

    #[inline]
    pub fn pointer_dx(&self) -> i32 {
        self.data.data0 as i32
    }

    #[inline]
    pub fn pointer_dy(&self) -> i32 {
        self.data.data1 as i32
    }

    #[inline]
    pub fn pointer_button_code(&self) -> u8 {
        (self.data.data0 & 0xFF) as u8
    }

    #[inline]
    pub fn scroll_delta(&self) -> i32 {
        self.data.data0 as i32
    }
}
