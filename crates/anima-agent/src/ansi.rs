//! ANSI escape sequence stripping.
//!
//! Agent CLIs emit colored, cursor-addressed terminal output. Pattern
//! matching operates on plain text, so escape sequences are removed before
//! any line reaches the parser. Raw bytes are preserved separately for UI
//! passthrough.

/// Strip ANSI escape sequences from raw terminal bytes.
///
/// Handles CSI sequences (`ESC [ ... final`), OSC sequences
/// (`ESC ] ... BEL` or `ESC ] ... ESC \`), and single-character escapes.
/// Invalid UTF-8 is replaced lossily. Carriage returns are dropped so
/// `\r\n` line endings normalize to `\n`-split lines.
pub fn strip_ansi(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;

    while i < raw.len() {
        let byte = raw[i];
        if byte == 0x1b {
            i += 1;
            match raw.get(i) {
                // CSI: parameters then a final byte in 0x40..=0x7e
                Some(b'[') => {
                    i += 1;
                    while i < raw.len() {
                        let b = raw[i];
                        i += 1;
                        if (0x40..=0x7e).contains(&b) {
                            break;
                        }
                    }
                }
                // OSC: terminated by BEL or ST (ESC \)
                Some(b']') => {
                    i += 1;
                    while i < raw.len() {
                        let b = raw[i];
                        if b == 0x07 {
                            i += 1;
                            break;
                        }
                        if b == 0x1b && raw.get(i + 1) == Some(&b'\\') {
                            i += 2;
                            break;
                        }
                        i += 1;
                    }
                }
                // Two-character escape (charset selection, keypad modes, ...)
                Some(_) => {
                    i += 1;
                }
                None => {}
            }
        } else if byte == b'\r' {
            i += 1;
        } else {
            out.push(byte);
            i += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}
