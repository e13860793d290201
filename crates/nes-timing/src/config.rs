//! Machine, audio, video and rewinder configuration.
//!
//! Everything here is plain data with `serde` derives so a front end can
//! persist it as JSON next to its other settings.

use std::fs;
use std::path::Path;

use emu_core::MasterClock;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::timing::{PREDICTION_BUFFER_CPU_CYCLES, SCANLINE_CPU_CYCLES};

/// Video region. Determines the crystal, the clock dividers and the frame
/// length.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NesRegion {
    /// NTSC: 60 Hz, 262 scanlines, CPU at crystal / 12.
    #[default]
    Ntsc,
    /// PAL: 50 Hz, 312 scanlines, CPU at crystal / 16.
    Pal,
}

impl NesRegion {
    /// Master crystal frequency in Hz.
    #[must_use]
    pub const fn crystal_hz(self) -> u64 {
        match self {
            Self::Ntsc => 21_477_272,
            Self::Pal => 26_601_712,
        }
    }

    #[must_use]
    pub const fn master_clock(self) -> MasterClock {
        MasterClock::new(self.crystal_hz())
    }

    /// Master cycles per CPU cycle.
    #[must_use]
    pub const fn cpu_divider(self) -> u64 {
        match self {
            Self::Ntsc => 12,
            Self::Pal => 16,
        }
    }

    /// Master cycles per PPU dot.
    #[must_use]
    pub const fn ppu_divider(self) -> u64 {
        match self {
            Self::Ntsc => 4,
            Self::Pal => 5,
        }
    }

    /// Master cycles per APU tick. The APU is clocked with the CPU.
    #[must_use]
    pub const fn apu_divider(self) -> u64 {
        self.cpu_divider()
    }

    /// Total scanlines per frame (including pre-render and `VBlank`).
    #[must_use]
    pub const fn scanlines_per_frame(self) -> u16 {
        match self {
            Self::Ntsc => 262,
            Self::Pal => 312,
        }
    }

    /// Last scanline before the frame wraps back to the pre-render line.
    #[must_use]
    pub const fn last_line(self) -> i16 {
        self.scanlines_per_frame() as i16 - 2
    }

    /// Nominal frames per second.
    #[must_use]
    pub const fn frame_rate(self) -> u32 {
        match self {
            Self::Ntsc => 60,
            Self::Pal => 50,
        }
    }

    /// Master cycles in the orchestrator's execution slice.
    #[must_use]
    pub const fn scanline_clocks(self) -> u64 {
        SCANLINE_CPU_CYCLES * self.cpu_divider()
    }

    /// Master cycles added to every prediction window as slack.
    #[must_use]
    pub const fn prediction_buffer(self) -> u64 {
        PREDICTION_BUFFER_CPU_CYCLES * self.cpu_divider()
    }
}

/// How the frame pacer waits for the wall clock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuUsage {
    /// Sleep between polls.
    Passive,
    /// Yield the time slice between polls.
    #[default]
    Normal,
    /// Spin.
    Aggressive,
}

/// APU emulation fidelity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApuMode {
    /// Batch channel updates once per host sample.
    Fast,
    /// Update every tick, sample-and-hold at the host rate.
    Accurate,
    /// Update every tick and box-filter into host samples.
    #[default]
    HighQuality,
}

/// Output channel layout.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StereoMode {
    #[default]
    Mono,
    Stereo,
}

impl StereoMode {
    #[must_use]
    pub const fn channels(self) -> usize {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApuConfig {
    pub mode: ApuMode,
    pub sample_rate: u32,
    pub stereo: StereoMode,
    pub swap_channels: bool,
    /// Global output gain.
    pub volume: f64,
    /// Automatic gain control.
    pub normalize: bool,
    pub enable_square_1: bool,
    pub enable_square_2: bool,
    pub enable_triangle: bool,
    pub enable_noise: bool,
    pub enable_dmc: bool,
}

impl Default for ApuConfig {
    fn default() -> Self {
        Self {
            mode: ApuMode::default(),
            sample_rate: 44_100,
            stereo: StereoMode::default(),
            swap_channels: false,
            volume: 1.0,
            normalize: false,
            enable_square_1: true,
            enable_square_2: true,
            enable_triangle: true,
            enable_noise: true,
            enable_dmc: true,
        }
    }
}

/// Which picture layers are drawn. Layer switches only take effect at the
/// end of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PpuConfig {
    pub enable_rendering: bool,
    pub background: bool,
    pub sprites_back: bool,
    pub sprites_front: bool,
}

impl Default for PpuConfig {
    fn default() -> Self {
        Self {
            enable_rendering: true,
            background: true,
            sprites_back: true,
            sprites_front: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewindConfig {
    pub enabled: bool,
    /// Fraction of frames captured, in `(0, 1]`.
    pub frame_rate: f64,
    /// How far back the rewinder reaches.
    pub seconds: u32,
}

impl Default for RewindConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frame_rate: 0.5,
            seconds: 10,
        }
    }
}

/// Top-level machine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub region: NesRegion,
    pub cpu_usage: CpuUsage,
    /// Maximum frames skipped in a row; `-1` lets the throttle decide.
    pub frame_skip: i32,
    /// Hold emulation to real time.
    pub speed_cap: bool,
    /// Emulation speed in percent of real time.
    pub speed_factor: u32,
    pub apu: ApuConfig,
    pub ppu: PpuConfig,
    pub rewind: RewindConfig,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            region: NesRegion::default(),
            cpu_usage: CpuUsage::default(),
            frame_skip: -1,
            speed_cap: true,
            speed_factor: 100,
            apu: ApuConfig::default(),
            ppu: PpuConfig::default(),
            rewind: RewindConfig::default(),
        }
    }
}

impl MachineConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("no config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}
