//! Input ports and the host key buffer.
//!
//! Two layers:
//! 1. [`Input`]: the two joypads behind $4016/$4017, as the CPU sees them.
//! 2. [`KeyBuffer`]: keys pushed by the front end from its own thread and
//!    drained by the machine between frames.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::controller::{self, Controller};
use crate::error::StateError;
use crate::state::{StateReader, StateWriter};

/// Keys the buffer holds before new ones are dropped.
pub const KEY_BUFFER_CAPACITY: usize = 16;

/// Logical joypad button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NesButton {
    A,
    B,
    Select,
    Start,
    Up,
    Down,
    Left,
    Right,
}

impl NesButton {
    /// Bit position in the controller byte.
    #[must_use]
    pub const fn bit(self) -> u8 {
        match self {
            Self::A => controller::button::A,
            Self::B => controller::button::B,
            Self::Select => controller::button::SELECT,
            Self::Start => controller::button::START,
            Self::Up => controller::button::UP,
            Self::Down => controller::button::DOWN,
            Self::Left => controller::button::LEFT,
            Self::Right => controller::button::RIGHT,
        }
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Both controller ports.
#[derive(Debug, Clone, Default)]
pub struct Input {
    ports: [Controller; 2],
}

impl Input {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// CPU read of $4016 (port 1) or $4017 (port 2).
    pub fn read(&mut self, address: u16) -> u8 {
        self.ports[usize::from(address & 1)].read()
    }

    /// CPU write of $4016 or $4017. Only $4016 drives the strobe line;
    /// standard pads ignore $4017.
    pub fn write(&mut self, address: u16, value: u8) {
        if address == 0x4016 {
            for port in &mut self.ports {
                port.write(value);
            }
        }
    }

    #[must_use]
    pub fn port(&self, index: usize) -> &Controller {
        &self.ports[index & 1]
    }

    pub fn port_mut(&mut self, index: usize) -> &mut Controller {
        &mut self.ports[index & 1]
    }

    pub fn press(&mut self, port: usize, button: NesButton) {
        self.port_mut(port).set_button(button.bit(), true);
    }

    pub fn release(&mut self, port: usize, button: NesButton) {
        self.port_mut(port).set_button(button.bit(), false);
    }

    /// Controller 1's buttons, one byte per recorded frame.
    #[must_use]
    pub fn replay_byte(&self) -> u8 {
        self.ports[0].buttons()
    }

    pub fn apply_replay_byte(&mut self, buttons: u8) {
        self.ports[0].set_buttons(buttons);
    }

    pub fn reset(&mut self) {
        for port in &mut self.ports {
            port.reset();
        }
    }

    /// The CTRL chunk.
    pub fn save_state(&self, w: &mut StateWriter) {
        for port in &self.ports {
            port.save_state(w);
        }
    }

    pub fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        for port in &mut self.ports {
            port.load_state(r)?;
        }
        Ok(())
    }

    /// Decode a CTRL chunk without applying it.
    pub fn check_state(data: &[u8]) -> Result<(), StateError> {
        Input::new().load_state(&mut StateReader::new(data))
    }
}

// ---------------------------------------------------------------------------
// Key buffer
// ---------------------------------------------------------------------------

/// A key from the host keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    /// Leave the emulation loop (back to the menu, or quit).
    Escape,
    Enter,
    Char(char),
    /// F1-F12.
    Function(u8),
}

/// A bounded key queue shared between the front end's input callback and
/// the machine. Clones share the same queue.
#[derive(Debug, Clone, Default)]
pub struct KeyBuffer {
    keys: Arc<Mutex<VecDeque<Key>>>,
}

impl KeyBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Key>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a key. Returns false, dropping the key, when the buffer is full.
    pub fn push(&self, key: Key) -> bool {
        let mut keys = self.lock();
        if keys.len() >= KEY_BUFFER_CAPACITY {
            log::trace!("key buffer full, dropping {key:?}");
            return false;
        }
        keys.push_back(key);
        true
    }

    pub fn pop(&self) -> Option<Key> {
        self.lock().pop_front()
    }

    /// Consume a pending Escape, leaving other keys queued.
    pub fn take_escape(&self) -> bool {
        let mut keys = self.lock();
        match keys.iter().position(|&k| k == Key::Escape) {
            Some(index) => {
                keys.remove(index);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_share_strobe() {
        let mut input = Input::new();
        input.press(0, NesButton::A);
        input.press(1, NesButton::B);
        input.write(0x4016, 1);
        input.write(0x4016, 0);
        assert_eq!(input.read(0x4016), 1);
        assert_eq!(input.read(0x4017), 0);
        assert_eq!(input.read(0x4017), 1);
    }

    #[test]
    fn apu_frame_write_does_not_strobe() {
        let mut input = Input::new();
        input.press(0, NesButton::A);
        input.write(0x4017, 1);
        input.write(0x4017, 0);
        assert_eq!(input.read(0x4016), 0);
    }

    #[test]
    fn replay_byte_is_port_one() {
        let mut input = Input::new();
        input.apply_replay_byte(0x81);
        assert_eq!(input.replay_byte(), 0x81);
        assert_eq!(input.port(1).buttons(), 0);
    }

    #[test]
    fn key_buffer_drops_when_full() {
        let keys = KeyBuffer::new();
        for i in 0..KEY_BUFFER_CAPACITY {
            assert!(keys.push(Key::Function(i as u8)));
        }
        assert!(!keys.push(Key::Escape));
        assert_eq!(keys.len(), KEY_BUFFER_CAPACITY);
        assert!(!keys.take_escape());
        assert_eq!(keys.pop(), Some(Key::Function(0)));
    }

    #[test]
    fn escape_is_taken_out_of_order() {
        let keys = KeyBuffer::new();
        keys.push(Key::Char('a'));
        keys.push(Key::Escape);
        keys.push(Key::Enter);
        assert!(keys.take_escape());
        assert!(!keys.take_escape());
        assert_eq!(keys.pop(), Some(Key::Char('a')));
        assert_eq!(keys.pop(), Some(Key::Enter));
        assert!(keys.is_empty());
    }

    #[test]
    fn key_buffer_crosses_threads() {
        let keys = KeyBuffer::new();
        let producer = keys.clone();
        std::thread::spawn(move || {
            producer.push(Key::Escape);
        })
        .join()
        .expect("producer thread");
        assert!(keys.take_escape());
    }
}
