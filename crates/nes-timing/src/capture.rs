//! Headless capture: PNG screenshots and WAV audio dumps.

use std::error::Error;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::cpu::CpuCore;
use crate::machine::Machine;
use crate::ppu::{FB_HEIGHT, FB_WIDTH};

/// ARGB32 pixels to RGBA bytes, alpha forced opaque.
#[must_use]
pub fn argb_to_rgba(pixels: &[u32]) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(pixels.len() * 4);
    for &pixel in pixels {
        rgba.push((pixel >> 16) as u8);
        rgba.push((pixel >> 8) as u8);
        rgba.push(pixel as u8);
        rgba.push(0xFF);
    }
    rgba
}

/// Encode a 256x240 ARGB framebuffer as PNG into `out`.
pub fn encode_png<W: Write>(framebuffer: &[u32], out: W) -> Result<(), Box<dyn Error>> {
    let mut encoder = png::Encoder::new(out, FB_WIDTH, FB_HEIGHT);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&argb_to_rgba(framebuffer))?;
    Ok(())
}

/// Save the last presented frame as a PNG file.
pub fn save_screenshot<C: CpuCore>(machine: &Machine<C>, path: &Path) -> Result<(), Box<dyn Error>> {
    let file = fs::File::create(path)?;
    encode_png(machine.framebuffer(), std::io::BufWriter::new(file))
}

/// Save mixer output as 16-bit PCM WAV. `samples` are interleaved when
/// `channels` is 2.
pub fn write_wav(samples: &[f32], channels: u16, sample_rate: u32, path: &Path) -> Result<(), Box<dyn Error>> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        let scaled = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
        writer.write_sample(scaled)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Run `num_frames` frames, dumping each as `dir/frames/NNNNNN.png`, and
/// the audio of the whole run as `dir/audio.wav`.
pub fn record<C: CpuCore>(machine: &mut Machine<C>, dir: &Path, num_frames: u32) -> Result<(), Box<dyn Error>> {
    let frames_dir = dir.join("frames");
    fs::create_dir_all(&frames_dir)?;

    let mut audio = Vec::new();
    for i in 1..=num_frames {
        machine.run_frame();
        audio.extend(machine.take_audio_buffer());
        save_screenshot(machine, &frames_dir.join(format!("{i:06}.png")))?;
    }

    let mixer = machine.bus().apu.mixer();
    write_wav(
        &audio,
        mixer.channels() as u16,
        mixer.sample_rate(),
        &dir.join("audio.wav"),
    )?;
    log::info!("captured {num_frames} frames to {}", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_order_and_alpha() {
        assert_eq!(argb_to_rgba(&[0x0012_3456, 0xFFAB_CDEF]), [0x12, 0x34, 0x56, 0xFF, 0xAB, 0xCD, 0xEF, 0xFF]);
    }

    #[test]
    fn png_has_signature() {
        let framebuffer = vec![0xFF00_00FF; (FB_WIDTH * FB_HEIGHT) as usize];
        let mut out = Vec::new();
        encode_png(&framebuffer, &mut out).unwrap();
        assert_eq!(&out[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn wav_round_trip_through_hound() {
        let path = std::env::temp_dir().join(format!("nes-timing-capture-{}.wav", std::process::id()));
        write_wav(&[0.0, 0.5, -1.0, 2.0], 2, 44_100, &path).unwrap();
        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 44_100);
        let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(samples, [0, 16383, -32767, 32767]);
        let _ = fs::remove_file(path);
    }
}
