//! Standard joypad.
//!
//! A serial shift register read one bit at a time through $4016/$4017.
//! Writing bit 0 = 1 to $4016 holds the strobe (the register keeps
//! reloading); writing 0 latches the current buttons for shifting out.

use crate::error::StateError;
use crate::state::{StateReader, StateWriter};

/// Button bit positions.
pub mod button {
    pub const A: u8 = 0;
    pub const B: u8 = 1;
    pub const SELECT: u8 = 2;
    pub const START: u8 = 3;
    pub const UP: u8 = 4;
    pub const DOWN: u8 = 5;
    pub const LEFT: u8 = 6;
    pub const RIGHT: u8 = 7;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Controller {
    buttons: u8,
    shift_register: u8,
    strobe: bool,
}

impl Controller {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_button(&mut self, button: u8, pressed: bool) {
        if pressed {
            self.buttons |= 1 << button;
        } else {
            self.buttons &= !(1 << button);
        }
        if self.strobe {
            self.shift_register = self.buttons;
        }
    }

    /// Replace the whole button byte (replay playback).
    pub fn set_buttons(&mut self, buttons: u8) {
        self.buttons = buttons;
        if self.strobe {
            self.shift_register = buttons;
        }
    }

    #[must_use]
    pub fn buttons(&self) -> u8 {
        self.buttons
    }

    /// One bit out of the shift register. Past the eighth read the pad
    /// returns 1.
    pub fn read(&mut self) -> u8 {
        if self.strobe {
            return self.buttons & 1;
        }
        let result = self.shift_register & 1;
        self.shift_register = (self.shift_register >> 1) | 0x80;
        result
    }

    /// Strobe write. The falling edge latches the buttons.
    pub fn write(&mut self, value: u8) {
        let strobe = value & 1 != 0;
        if self.strobe && !strobe {
            self.shift_register = self.buttons;
        }
        self.strobe = strobe;
    }

    /// Strobe released and nothing latched. Held buttons stay held.
    pub fn reset(&mut self) {
        self.shift_register = 0;
        self.strobe = false;
    }

    pub fn save_state(&self, w: &mut StateWriter) {
        w.u8(self.buttons);
        w.u8(self.shift_register);
        w.bool(self.strobe);
    }

    pub fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        self.buttons = r.u8()?;
        self.shift_register = r.u8()?;
        self.strobe = r.bool()?;
        Ok(())
    }
}
