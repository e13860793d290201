//! The frame orchestrator: frame boundaries, pacing and the game clock.

mod common;

use common::{machine, machine_with, nmi_program, config};
use emu_core::{Observable, Value};
use nes_timing::{CpuCore, Key, NesRegion};

/// Master cycles per NTSC frame with the background off.
const NTSC_FRAME: u64 = 262 * 341 * 4;

/// Longest a frame can overrun its last dot: one slice plus one
/// instruction.
const OVERRUN: u64 = 114 * 12 + 7 * 12;

#[test]
fn frames_end_on_the_ppu_boundary() {
    let mut m = machine(&nmi_program());
    for n in 1..=5u64 {
        let report = m.run_frame();
        assert!(report.executed);
        let now = m.bus().timeline.now().get();
        assert!(now >= n * NTSC_FRAME, "frame {n} ended early at {now}");
        assert!(now < n * NTSC_FRAME + OVERRUN, "frame {n} ran long to {now}");
        assert_eq!(m.bus().ppu.frames(), n);
    }
    assert_eq!(m.executed_frames(), 5);
}

#[test]
fn odd_frame_alternates() {
    let mut m = machine(&nmi_program());
    m.run_frame();
    let first = m.bus().ppu.odd_frame();
    m.run_frame();
    assert_ne!(m.bus().ppu.odd_frame(), first);
    m.run_frame();
    assert_eq!(m.bus().ppu.odd_frame(), first);
}

#[test]
fn pal_frames_are_longer() {
    let mut cfg = config();
    cfg.region = NesRegion::Pal;
    let mut m = machine_with(&nmi_program(), cfg);
    m.run_frame();
    let pal_frame = 312 * 341 * 5;
    let now = m.bus().timeline.now().get();
    assert!(now >= pal_frame);
    assert!(now < pal_frame + 114 * 16 + 7 * 16);
}

#[test]
fn every_frame_drawn_when_throttle_owes_nothing() {
    let mut m = machine(&nmi_program());
    for _ in 0..4 {
        assert!(m.run_frame().redrawn);
    }
}

#[test]
fn owed_frames_are_skipped() {
    let mut m = machine(&nmi_program());
    for _ in 0..3 {
        m.throttle().tick();
    }
    let drawn: Vec<bool> = (0..4).map(|_| m.run_frame().redrawn).collect();
    assert_eq!(drawn, [true, false, false, true]);
    // Skipped frames still execute.
    assert_eq!(m.executed_frames(), 4);
}

#[test]
fn frame_skip_caps_the_run() {
    let mut cfg = config();
    cfg.frame_skip = 2;
    let mut m = machine_with(&nmi_program(), cfg);
    for _ in 0..5 {
        m.throttle().tick();
    }
    let drawn: Vec<bool> = (0..3).map(|_| m.run_frame().redrawn).collect();
    assert_eq!(drawn, [true, false, true]);
}

#[test]
fn game_clock_counts_emulated_time() {
    let mut m = machine(&nmi_program());
    for _ in 0..60 {
        m.run_frame();
    }
    assert_eq!(m.game_clock().total_milliseconds() / 1000, 1);
    assert_eq!(m.game_clock().seconds, 1);
}

#[test]
fn escape_key_is_reported_once() {
    let mut m = machine(&nmi_program());
    let keys = m.keys();
    keys.push(Key::Enter);
    keys.push(Key::Escape);
    assert!(m.run_frame().escape);
    assert!(!m.run_frame().escape);
    assert_eq!(keys.pop(), Some(Key::Enter));
}

#[test]
fn reset_keeps_time_running() {
    let mut m = machine(&nmi_program());
    m.run_frame();
    let before = m.bus().timeline.now();
    m.reset();
    assert_eq!(m.bus().timeline.now(), before);
    assert_eq!(m.cpu().registers().pc, 0x8000);
    m.run_frame();
    assert!(m.bus().timeline.now() > before);
}

#[test]
fn observable_paths() {
    let mut m = machine(&nmi_program());
    m.run_frame();
    for path in m.query_paths() {
        assert!(m.query(path).is_some(), "{path} unanswered");
    }
    assert_eq!(m.query("executed_frames"), Some(Value::U64(1)));
    assert_eq!(
        m.query("cpu.time"),
        Some(Value::U64(m.bus().timeline.now().get()))
    );
    assert_eq!(m.query("no.such.path"), None);
}
