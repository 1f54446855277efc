//! HID keyboard usage IDs to set-1 scancodes, and set-1 scancodes to ASCII.

/// Usage IDs below this are reserved or error codes.
pub const USAGE_FIRST_KEY: u8 = 0x04;
pub const USAGE_ERROR_ROLLOVER: u8 = 0x01;
pub const USAGE_CAPS_LOCK: u8 = 0x39;

/// HID usage (index) to set-1 make code. Zero means unmapped.
pub static HID_USAGE_TO_SCANCODE: [u8; 256] = build_usage_table();

const LETTERS: [u8; 26] = [
    0x1E, 0x30, 0x2E, 0x20, 0x12, 0x21, 0x22, 0x23, 0x17, 0x24, 0x25, 0x26, 0x32, 0x31, 0x18, 0x19,
    0x10, 0x13, 0x1F, 0x14, 0x16, 0x2F, 0x11, 0x2D, 0x15, 0x2C,
];

/// Usages 0x28..=0x63: Enter through keypad '.'.
const SPECIALS: [u8; 0x3C] = [
    0x1C, 0x01, 0x0E, 0x0F, 0x39, 0x0C, 0x0D, 0x1A, 0x1B, 0x2B, 0x2B, 0x27, 0x28, 0x29, 0x33, 0x34,
    0x35, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E, 0x3F, 0x40, 0x41, 0x42, 0x43, 0x44, 0x57, 0x58, 0x00, 0x46,
    0x00, 0x52, 0x47, 0x49, 0x53, 0x4F, 0x51, 0x4D, 0x4B, 0x50, 0x48, 0x45, 0x35, 0x37, 0x4A, 0x4E,
    0x1C, 0x4F, 0x50, 0x51, 0x4B, 0x4C, 0x4D, 0x47, 0x48, 0x49, 0x52, 0x53,
];

const fn build_usage_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < LETTERS.len() {
        table[0x04 + i] = LETTERS[i];
        i += 1;
    }
    // 1..9, 0
    i = 0;
    while i < 10 {
        table[0x1E + i] = 0x02 + i as u8;
        i += 1;
    }
    i = 0;
    while i < SPECIALS.len() {
        table[0x28 + i] = SPECIALS[i];
        i += 1;
    }
    table
}

/// Caps lock, F-keys, navigation, arrows and num lock share scancodes with
/// the keypad and must not produce characters.
#[inline]
pub const fn is_non_char_usage(usage: u8) -> bool {
    usage >= 0x39 && usage <= 0x53
}

#[inline]
pub fn usage_to_scancode(usage: u8) -> u8 {
    HID_USAGE_TO_SCANCODE[usage as usize]
}

const SCANCODE_ASCII: [u8; 0x80] = [
    0x00, 0x1B, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 0x08, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n', 0x00, b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', 0x00, b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0x00, b'*', 0x00, b' ', 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, b'7', b'8', b'9', b'-', b'4', b'5', b'6', b'+', b'1',
    b'2', b'3', b'0', b'.', 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const SCANCODE_ASCII_SHIFTED: [u8; 0x80] = [
    0x00, 0x1B, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')', b'_', b'+', 0x08, b'\t',
    b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O', b'P', b'{', b'}', b'\n', 0x00, b'A', b'S',
    b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':', b'"', b'~', 0x00, b'|', b'Z', b'X', b'C', b'V',
    b'B', b'N', b'M', b'<', b'>', b'?', 0x00, b'*', 0x00, b' ', 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, b'7', b'8', b'9', b'-', b'4', b'5', b'6', b'+', b'1',
    b'2', b'3', b'0', b'.', 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// ASCII for a set-1 make code under the given modifier state, 0 if none.
///
/// Caps lock inverts shift for letters only; ctrl turns letters into
/// control codes 0x01..=0x1A.
pub fn scancode_to_ascii(scancode: u8, shift: bool, caps_lock: bool, ctrl: bool) -> u8 {
    let Some(&base) = SCANCODE_ASCII.get(scancode as usize) else {
        return 0;
    };
    let ch = if base.is_ascii_lowercase() {
        if shift ^ caps_lock { base.to_ascii_uppercase() } else { base }
    } else if shift {
        SCANCODE_ASCII_SHIFTED[scancode as usize]
    } else {
        base
    };
    if ctrl && ch.is_ascii_alphabetic() {
        return ch.to_ascii_lowercase() - b'a' + 1;
    }
    ch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_table_spot_checks() {
        assert_eq!(usage_to_scancode(0x04), 0x1E); // a
        assert_eq!(usage_to_scancode(0x1D), 0x2C); // z
        assert_eq!(usage_to_scancode(0x1E), 0x02); // 1
        assert_eq!(usage_to_scancode(0x27), 0x0B); // 0
        assert_eq!(usage_to_scancode(0x28), 0x1C); // enter
        assert_eq!(usage_to_scancode(USAGE_CAPS_LOCK), 0x3A);
        assert_eq!(usage_to_scancode(0x45), 0x58); // F12
        assert_eq!(usage_to_scancode(0x46), 0x00); // print screen
        assert_eq!(usage_to_scancode(0x52), 0x48); // up
        assert_eq!(usage_to_scancode(0x53), 0x45); // num lock
        assert_eq!(usage_to_scancode(0x63), 0x53); // keypad .
        assert_eq!(usage_to_scancode(0x64), 0x00);
        assert_eq!(usage_to_scancode(USAGE_ERROR_ROLLOVER), 0x00);
    }

    #[test]
    fn ascii_translation() {
        assert_eq!(scancode_to_ascii(0x1E, false, false, false), b'a');
        assert_eq!(scancode_to_ascii(0x1E, true, false, false), b'A');
        assert_eq!(scancode_to_ascii(0x1E, false, true, false), b'A');
        assert_eq!(scancode_to_ascii(0x1E, true, true, false), b'a');
        assert_eq!(scancode_to_ascii(0x02, true, false, false), b'!');
        assert_eq!(scancode_to_ascii(0x02, false, true, false), b'1');
        assert_eq!(scancode_to_ascii(0x2E, false, false, true), 0x03);
        assert_eq!(scancode_to_ascii(0x1C, false, false, false), b'\n');
        assert_eq!(scancode_to_ascii(0x0E, false, false, false), 0x08);
        assert_eq!(scancode_to_ascii(0x3B, false, false, false), 0);
        assert_eq!(scancode_to_ascii(0xC0, false, false, false), 0);
        assert!(is_non_char_usage(0x50));
        assert!(!is_non_char_usage(0x59));
    }
}
