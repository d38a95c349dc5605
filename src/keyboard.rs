//! Raw keystroke decoding.
//!
//! The terminal runs unbuffered and non-blocking, so a key press arrives as
//! one byte or as a short escape sequence. [`KeyDecoder`] turns whatever is
//! currently available into [`Key`]s without ever waiting for more input.
//!
//! Different terminals send different sequences for the same key (F1 is
//! `ESC O P` on some, `ESC [ 1 1 ~` on others); every known variant maps to
//! the same key. Unknown escape sequences are dropped together with anything
//! else pending, which is enough to get back in step with the terminal.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read};

use tracing::debug;

/// Bytes requested from the source whenever the look-ahead buffer runs dry.
/// Long enough for the longest sequence in the table.
const LOOKAHEAD: usize = 5;

const ESC: u8 = 0x1b;

/// A decoded key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Esc,
    /// Function keys F1..F12.
    F(u8),
    Home,
    Insert,
    Delete,
    End,
    PageUp,
    PageDown,
    Up,
    Down,
    Right,
    Left,
    Backspace,
    Enter,
    Tab,
    BackTab,
    /// Ctrl+C. The terminal is in raw mode, so this arrives as a byte.
    Interrupt,
    Char(char),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Esc => write!(f, "ESC"),
            Key::F(n) => write!(f, "F{}", n),
            Key::Home => write!(f, "HOME"),
            Key::Insert => write!(f, "INS"),
            Key::Delete => write!(f, "DEL"),
            Key::End => write!(f, "END"),
            Key::PageUp => write!(f, "PAGEUP"),
            Key::PageDown => write!(f, "PAGEDOWN"),
            Key::Up => write!(f, "UP"),
            Key::Down => write!(f, "DOWN"),
            Key::Right => write!(f, "RIGHT"),
            Key::Left => write!(f, "LEFT"),
            Key::Backspace => write!(f, "BACKSPACE"),
            Key::Enter => write!(f, "ENTER"),
            Key::Tab => write!(f, "TAB"),
            Key::BackTab => write!(f, "SHIFT-TAB"),
            Key::Interrupt => write!(f, "CTRL-C"),
            Key::Char(c) => write!(f, "{}", c),
        }
    }
}

/// Looks up a complete byte sequence in the table of named keys.
pub fn named_key(sequence: &[u8]) -> Option<Key> {
    let key = match sequence {
        b"\x1b" => Key::Esc,
        b"\x1bOP" | b"\x1b[11~" => Key::F(1),
        b"\x1bOQ" | b"\x1b[12~" => Key::F(2),
        b"\x1bOR" | b"\x1b[13~" => Key::F(3),
        b"\x1bOS" | b"\x1b[14~" => Key::F(4),
        b"\x1b[15~" => Key::F(5),
        b"\x1b[17~" => Key::F(6),
        b"\x1b[18~" => Key::F(7),
        b"\x1b[19~" => Key::F(8),
        b"\x1b[20~" => Key::F(9),
        b"\x1b[21~" => Key::F(10),
        b"\x1b[23~" => Key::F(11),
        b"\x1b[24~" => Key::F(12),
        b"\x1b[1~" => Key::Home,
        b"\x1b[2~" => Key::Insert,
        b"\x1b[3~" => Key::Delete,
        b"\x1b[4~" => Key::End,
        b"\x1b[5~" => Key::PageUp,
        b"\x1b[6~" => Key::PageDown,
        b"\x1b[A" | b"\x1bOA" => Key::Up,
        b"\x1b[B" | b"\x1bOB" => Key::Down,
        b"\x1b[C" | b"\x1bOC" => Key::Right,
        b"\x1b[D" | b"\x1bOD" => Key::Left,
        b"\x1b[Z" => Key::BackTab,
        b"\x7f" => Key::Backspace,
        b"\n" | b"\r" => Key::Enter,
        b"\t" => Key::Tab,
        b"\x03" => Key::Interrupt,
        _ => return None,
    };
    Some(key)
}

/// A source of raw key bytes that never blocks.
pub trait KeySource {
    /// Reads whatever is available right now into `buf`; `Ok(0)` means
    /// nothing is pending.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Pre-recorded input, handy for scripting key presses.
impl KeySource for VecDeque<u8> {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }
}

/// Turns raw bytes into [`Key`]s.
pub struct KeyDecoder<S: KeySource> {
    source: S,
    buffer: Vec<u8>,
}

impl<S: KeySource> KeyDecoder<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            buffer: Vec::with_capacity(LOOKAHEAD),
        }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Iterates over the keys that are available now. The iterator ends as
    /// soon as the source has nothing more, or after an unknown escape
    /// sequence has been thrown away.
    pub fn keys(&mut self) -> Keys<'_, S> {
        if self.buffer.is_empty() {
            self.replenish();
        }
        Keys {
            decoder: self,
            done: false,
        }
    }

    fn replenish(&mut self) {
        let mut chunk = [0u8; LOOKAHEAD];
        match self.source.read_available(&mut chunk) {
            Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => debug!(error = %e, "keyboard read failed"),
        }
    }

    /// Drops everything buffered and everything the source has pending.
    fn resynchronize(&mut self) {
        self.buffer.clear();
        let mut sink = [0u8; 1024];
        while let Ok(n) = self.source.read_available(&mut sink) {
            if n == 0 {
                break;
            }
        }
    }

    fn decode_next(&mut self) -> Option<Key> {
        if self.buffer.is_empty() {
            return None;
        }

        if let Some(key) = named_key(&self.buffer) {
            self.buffer.clear();
            self.replenish();
            debug!(%key, "key");
            return Some(key);
        }

        if self.buffer[0] == ESC {
            debug!(sequence = ?self.buffer, "unknown escape sequence dropped");
            self.resynchronize();
            return None;
        }

        let byte = self.buffer.remove(0);
        let key = Key::Char(if byte.is_ascii() { byte as char } else { '?' });
        if self.buffer.is_empty() {
            self.replenish();
        }
        debug!(%key, "key");
        Some(key)
    }
}

/// Keys currently available from a [`KeyDecoder`].
pub struct Keys<'a, S: KeySource> {
    decoder: &'a mut KeyDecoder<S>,
    done: bool,
}

impl<S: KeySource> Iterator for Keys<'_, S> {
    type Item = Key;

    fn next(&mut self) -> Option<Key> {
        if self.done {
            return None;
        }
        let key = self.decoder.decode_next();
        if key.is_none() {
            self.done = true;
        }
        key
    }
}

/// Standard input, switched to non-blocking reads for the lifetime of this
/// value. The caller is responsible for putting the terminal in raw mode.
#[cfg(unix)]
pub struct RawStdin {
    flags: libc::c_int,
}

#[cfg(unix)]
impl RawStdin {
    pub fn new() -> io::Result<Self> {
        // SAFETY: fcntl on the process' own stdin descriptor.
        let flags = unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above; only adds O_NONBLOCK to the existing flags.
        if unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { flags })
    }
}

#[cfg(unix)]
impl KeySource for RawStdin {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // SAFETY: reads into a valid, exclusively borrowed buffer of buf.len() bytes.
            let n = unsafe {
                libc::read(
                    libc::STDIN_FILENO,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(0),
                _ => return Err(err),
            }
        }
    }
}

#[cfg(unix)]
impl Drop for RawStdin {
    fn drop(&mut self) {
        // SAFETY: restores the flags read in `new`.
        unsafe {
            libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, self.flags);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(bytes: &[u8]) -> KeyDecoder<VecDeque<u8>> {
        KeyDecoder::new(bytes.iter().copied().collect())
    }

    fn decode(bytes: &[u8]) -> Vec<Key> {
        decoder(bytes).keys().collect()
    }

    #[test]
    fn arrow_up() {
        assert_eq!(decode(b"\x1b[A"), vec![Key::Up]);
        assert_eq!(Key::Up.to_string(), "UP");
    }

    #[test]
    fn single_character() {
        assert_eq!(decode(b"a"), vec![Key::Char('a')]);
        assert_eq!(Key::Char('a').to_string(), "a");
    }

    #[test]
    fn unknown_escape_drains_everything() {
        let mut dec = decoder(b"\x1bZZZ");
        assert_eq!(dec.keys().count(), 0);
        assert!(dec.buffer.is_empty());
        assert!(dec.get_mut().is_empty());
    }

    #[test]
    fn unknown_escape_drops_following_input_too() {
        let mut dec = decoder(b"\x1b[99~abc");
        assert_eq!(dec.keys().count(), 0);
        assert!(dec.get_mut().is_empty());
        assert_eq!(dec.keys().count(), 0);
    }

    #[test]
    fn function_key_variants() {
        assert_eq!(decode(b"\x1bOP"), vec![Key::F(1)]);
        assert_eq!(decode(b"\x1b[11~"), vec![Key::F(1)]);
        assert_eq!(decode(b"\x1b[14~"), vec![Key::F(4)]);
        assert_eq!(decode(b"\x1b[20~"), vec![Key::F(9)]);
        assert_eq!(decode(b"\x1b[24~"), vec![Key::F(12)]);
        assert_eq!(decode(b"\x1bOD"), vec![Key::Left]);
        assert_eq!(decode(b"\x1b[Z"), vec![Key::BackTab]);
    }

    #[test]
    fn typed_digits_then_enter() {
        assert_eq!(
            decode(b"120\r"),
            vec![Key::Char('1'), Key::Char('2'), Key::Char('0'), Key::Enter]
        );
    }

    #[test]
    fn more_than_one_chunk_of_characters() {
        let keys = decode(b"abcdefgh");
        assert_eq!(keys.len(), 8);
        assert_eq!(keys[7], Key::Char('h'));
    }

    #[test]
    fn character_then_sequence_in_one_read() {
        assert_eq!(decode(b"x\x1b[B"), vec![Key::Char('x'), Key::Down]);
    }

    #[test]
    fn control_bytes() {
        assert_eq!(decode(b"\x7f"), vec![Key::Backspace]);
        assert_eq!(decode(b"\t"), vec![Key::Tab]);
        assert_eq!(decode(b"\x03"), vec![Key::Interrupt]);
        assert_eq!(decode(b"\x1b"), vec![Key::Esc]);
    }

    #[test]
    fn non_ascii_byte_becomes_placeholder() {
        assert_eq!(decode(b"\xe4"), vec![Key::Char('?')]);
    }

    #[test]
    fn nothing_pending_yields_nothing() {
        let mut dec = decoder(b"");
        assert_eq!(dec.keys().next(), None);
        dec.get_mut().extend(b"q");
        assert_eq!(dec.keys().collect::<Vec<_>>(), vec![Key::Char('q')]);
    }
}
