//! Input replays.
//!
//! A replay is an FNSS state followed by a `REPL` chunk holding
//! controller 1's buttons, one byte per frame. Playback loads the state and
//! feeds the bytes back in frame order.

use crate::error::StateError;
use crate::savestate::{self, Header, tag};

/// Collects one byte per frame after the starting state.
#[derive(Debug, Clone)]
pub struct ReplayRecorder {
    state: Vec<u8>,
    inputs: Vec<u8>,
}

impl ReplayRecorder {
    /// Start from a captured state image.
    #[must_use]
    pub fn new(state: Vec<u8>) -> Self {
        Self {
            state,
            inputs: Vec::new(),
        }
    }

    pub fn save_byte(&mut self, buttons: u8) {
        self.inputs.push(buttons);
    }

    #[must_use]
    pub fn frames(&self) -> usize {
        self.inputs.len()
    }

    /// The replay image: the state with the input chunk appended.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        let mut image = self.state;
        savestate::write_chunk(&mut image, tag::REPL, &self.inputs);
        image
    }
}

/// Hands back a recorded input stream.
#[derive(Debug, Clone)]
pub struct ReplayPlayer {
    inputs: Vec<u8>,
    position: usize,
}

impl ReplayPlayer {
    /// Pull the input chunk out of a replay image.
    pub fn from_image(image: &[u8]) -> Result<Self, StateError> {
        let (_, body) = Header::parse(image)?;
        let chunks = savestate::parse_chunks(body)?;
        let inputs = savestate::find_chunk(&chunks, &[tag::REPL])?;
        Ok(Self {
            inputs: inputs.to_vec(),
            position: 0,
        })
    }

    /// Next frame's byte, and whether the stream had already ended. At
    /// the end the byte is zero.
    pub fn read_byte(&mut self) -> (u8, bool) {
        match self.inputs.get(self.position) {
            Some(&byte) => {
                self.position += 1;
                (byte, false)
            }
            None => (0, true),
        }
    }

    /// Frames played so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Frames in the recording.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}
