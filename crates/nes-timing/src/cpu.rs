//! CPU cycle source and interrupt queue.
//!
//! The instruction decoder is a black box behind [`CpuCore`]. What this
//! module owns is the master timeline: the current master-clock instant and
//! the queue of interrupts other devices have scheduled on it. Devices never
//! poke the CPU directly; they predict when their interrupt will assert and
//! queue it here, and [`execute`] delivers it when the CPU reaches that
//! instant.

use emu_core::{Bus, Ticks};

use crate::error::StateError;
use crate::state::{StateReader, StateWriter};

/// Interrupt sources. Everything except [`Nmi`](Self::Nmi) is an IRQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterruptKind {
    Nmi,
    /// Generic IRQ (external or unclassified).
    Irq,
    IrqDmc,
    IrqFrame,
    IrqMapper,
    /// Mapper IRQ queued on behalf of the PPU's prediction pass.
    IrqMapperProxy,
}

impl InterruptKind {
    #[must_use]
    pub const fn is_nmi(self) -> bool {
        matches!(self, Self::Nmi)
    }

    const fn code(self) -> u8 {
        match self {
            Self::Nmi => 0,
            Self::Irq => 1,
            Self::IrqDmc => 2,
            Self::IrqFrame => 3,
            Self::IrqMapper => 4,
            Self::IrqMapperProxy => 5,
        }
    }

    const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Nmi,
            1 => Self::Irq,
            2 => Self::IrqDmc,
            3 => Self::IrqFrame,
            4 => Self::IrqMapper,
            5 => Self::IrqMapperProxy,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

/// The master clock and the scheduled interrupts.
#[derive(Debug, Clone)]
pub struct CpuTimeline {
    time: Ticks,
    /// Master cycles per CPU cycle.
    divider: u64,
    /// Sorted by time; NMIs first among equal times.
    queue: Vec<(InterruptKind, Ticks)>,
}

impl CpuTimeline {
    #[must_use]
    pub fn new(divider: u64) -> Self {
        Self {
            time: Ticks::ZERO,
            divider: divider.max(1),
            queue: Vec::new(),
        }
    }

    #[must_use]
    pub const fn now(&self) -> Ticks {
        self.time
    }

    #[must_use]
    pub const fn divider(&self) -> u64 {
        self.divider
    }

    pub fn set_divider(&mut self, divider: u64) {
        self.divider = divider.max(1);
    }

    /// Advance the master clock.
    pub fn burn(&mut self, master_cycles: u64) {
        self.time += master_cycles;
    }

    /// Advance by whole CPU cycles.
    pub fn burn_cycles(&mut self, cpu_cycles: u64) {
        self.burn(cpu_cycles * self.divider);
    }

    /// Master cycles since `stamp`; moves `stamp` to now.
    pub fn elapsed_since(&self, stamp: &mut Ticks) -> u64 {
        let elapsed = self.time.since(*stamp);
        *stamp = self.time;
        elapsed
    }

    /// Schedule `kind` to assert at `at`.
    ///
    /// An NMI is queued unless the identical entry already exists. An IRQ
    /// source has at most one entry; the earlier of two times wins.
    pub fn set_interrupt(&mut self, kind: InterruptKind, at: Ticks) {
        if kind.is_nmi() {
            if self.queue.contains(&(kind, at)) {
                return;
            }
            self.queue.push((kind, at));
        } else if let Some(entry) = self.queue.iter_mut().find(|(k, _)| *k == kind) {
            entry.1 = entry.1.min(at);
        } else {
            self.queue.push((kind, at));
        }
        self.queue.sort_by_key(|&(k, t)| (t, !k.is_nmi()));
    }

    /// Assert `kind` now.
    pub fn raise(&mut self, kind: InterruptKind) {
        self.set_interrupt(kind, self.time);
    }

    /// Withdraw every entry of `kind`.
    pub fn clear_interrupt(&mut self, kind: InterruptKind) {
        self.queue.retain(|&(k, _)| k != kind);
    }

    /// Withdraw entries of `kind` scheduled after `now`, keeping ones that
    /// have already come due.
    pub fn retract_pending(&mut self, kind: InterruptKind, now: Ticks) {
        self.queue.retain(|&(k, t)| k != kind || t <= now);
    }

    /// Earliest time `kind` is queued for.
    #[must_use]
    pub fn queued(&self, kind: InterruptKind) -> Option<Ticks> {
        self.queue
            .iter()
            .find(|&&(k, _)| k == kind)
            .map(|&(_, t)| t)
    }

    #[must_use]
    pub fn is_asserted(&self, kind: InterruptKind) -> bool {
        self.queued(kind).is_some_and(|t| t <= self.time)
    }

    /// The interrupt the CPU should take now, if any.
    ///
    /// An NMI is an edge and is consumed. IRQs are levels: they stay queued
    /// until their source clears them, and are skipped while masked.
    pub fn take_due(&mut self, irq_masked: bool) -> Option<InterruptKind> {
        let now = self.time;
        let index = self
            .queue
            .iter()
            .take_while(|&&(_, t)| t <= now)
            .position(|&(k, _)| k.is_nmi() || !irq_masked)?;
        let kind = self.queue[index].0;
        if kind.is_nmi() {
            self.queue.remove(index);
        }
        Some(kind)
    }

    #[must_use]
    pub fn entries(&self) -> &[(InterruptKind, Ticks)] {
        &self.queue
    }

    /// Time zero, nothing queued.
    pub fn reset(&mut self) {
        self.time = Ticks::ZERO;
        self.queue.clear();
    }

    pub fn save_state(&self, w: &mut StateWriter) {
        w.ticks(self.time);
        w.u8(self.queue.len().min(usize::from(u8::MAX)) as u8);
        for &(kind, at) in self.queue.iter().take(usize::from(u8::MAX)) {
            w.u8(kind.code());
            w.ticks(at);
        }
    }

    pub fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        self.time = r.ticks()?;
        let count = r.u8()?;
        self.queue.clear();
        for _ in 0..count {
            let code = r.u8()?;
            let at = r.ticks()?;
            match InterruptKind::from_code(code) {
                Some(kind) => self.queue.push((kind, at)),
                None => log::warn!("dropping unknown interrupt code {code} from save state"),
            }
        }
        self.queue.sort_by_key(|&(k, t)| (t, !k.is_nmi()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Core contract
// ---------------------------------------------------------------------------

/// Register file of a 6502-family core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub pc: u16,
    pub a: u8,
    pub p: u8,
    pub s: u8,
    pub x: u8,
    pub y: u8,
}

impl Registers {
    pub fn save_state(&self, w: &mut StateWriter) {
        w.u16(self.pc);
        w.u8(self.a);
        w.u8(self.p);
        w.u8(self.s);
        w.u8(self.x);
        w.u8(self.y);
    }

    pub fn load_state(r: &mut StateReader<'_>) -> Result<Self, StateError> {
        Ok(Self {
            pc: r.u16()?,
            a: r.u8()?,
            p: r.u8()?,
            s: r.u8()?,
            x: r.u8()?,
            y: r.u8()?,
        })
    }
}

/// What the CPU core sees of the machine: memory plus the timeline.
pub trait CpuBus: Bus {
    fn timeline(&mut self) -> &mut CpuTimeline;
}

/// An instruction decoder.
///
/// Cycle counts are in CPU cycles; [`execute`] converts them to master
/// time.
pub trait CpuCore {
    /// Cold start: registers to their power-up values.
    fn power_up(&mut self);

    /// Soft reset: S -= 3, I set, PC from the reset vector.
    fn reset<B: CpuBus>(&mut self, bus: &mut B);

    /// Run one instruction. Returns its base cycle count.
    fn step<B: CpuBus>(&mut self, bus: &mut B) -> u64;

    /// Enter the handler for `kind`. Returns the cycles the entry took.
    fn service_interrupt<B: CpuBus>(&mut self, kind: InterruptKind, bus: &mut B) -> u64;

    /// I flag.
    fn irq_masked(&self) -> bool;

    fn registers(&self) -> Registers;

    fn set_registers(&mut self, registers: Registers);
}

/// Run the core for at least `cycles` master cycles.
///
/// Before each instruction the due interrupt, if any, is serviced. Time
/// burned by the bus during an instruction (DMA) counts toward the budget.
/// Returns the master cycles actually elapsed, which may overshoot.
pub fn execute<C: CpuCore, B: CpuBus>(core: &mut C, bus: &mut B, cycles: u64) -> u64 {
    let start = bus.timeline().now();
    let target = start + cycles;
    while bus.timeline().now() < target {
        let masked = core.irq_masked();
        let spent = match bus.timeline().take_due(masked) {
            Some(kind) => core.service_interrupt(kind, bus),
            None => core.step(bus),
        };
        bus.timeline().burn_cycles(spent.max(1));
    }
    bus.timeline().now().since(start)
}
