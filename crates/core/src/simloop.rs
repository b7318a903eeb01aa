//! Simulation drivers.
//!
//! [`SimLoop`] steps a device on the calling thread until it stops or a cycle
//! budget runs out. [`AsyncSimLoop`] does the same on a background thread in
//! bursts, controlled through a command channel; the device is shared with
//! the caller behind a mutex and reached with
//! [`transaction`](AsyncSimLoop::transaction).
//!
//! In [`RunMode::Fast`] idle sleep is skipped: a sleeping device with a
//! timer scheduled jumps straight to it. In [`RunMode::Realtime`] simulated
//! time is paced against the wall clock using the firmware frequency.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel as cbc;

use crate::device::{CrashInfo, Device, DeviceOptions, DeviceState};
use crate::types::CycleCount;

/// Cycles run between two command checks of [`AsyncSimLoop`].
const BURST_CYCLES: CycleCount = 10_000;
/// Realtime pacing granularity.
const PACE_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Fast,
    Realtime,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The program ended (infinite loop detection).
    Done,
    /// Breakpoint or watchpoint.
    Break,
    Crashed,
    /// Stopped by the simulation, or not runnable (no firmware).
    Stopped,
    Killed,
    BudgetExhausted,
    /// Sleeping with nothing scheduled: only an outside stimulus can wake
    /// the device.
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub termination: Termination,
    pub state: DeviceState,
    pub cycle: CycleCount,
    pub crash: Option<CrashInfo>,
}

impl RunReport {
    fn new(termination: Termination, dev: &Device) -> Self {
        RunReport { termination, state: dev.state(), cycle: dev.cycle(), crash: dev.crash_info().cloned() }
    }
}

/// Wall clock pacing of simulated time.
#[derive(Debug, Default)]
struct Pacer {
    origin: Option<(Instant, CycleCount)>,
}

impl Pacer {
    fn pace(&mut self, cycle: CycleCount, frequency: u64) {
        if frequency == 0 {
            return;
        }
        let (start, base) = *self.origin.get_or_insert_with(|| (Instant::now(), cycle));
        let simulated = Duration::from_secs_f64(cycle.saturating_sub(base) as f64 / frequency as f64);
        let elapsed = start.elapsed();
        if simulated > elapsed + PACE_INTERVAL {
            std::thread::sleep(simulated - elapsed);
        }
    }

    fn restart(&mut self) {
        self.origin = None;
    }
}

/// Synchronous driver.
pub struct SimLoop<'d> {
    dev: &'d mut Device,
    mode: RunMode,
    pacer: Pacer,
}

impl<'d> SimLoop<'d> {
    pub fn new(dev: &'d mut Device, mode: RunMode) -> Self {
        SimLoop { dev, mode, pacer: Pacer::default() }
    }

    pub fn device(&mut self) -> &mut Device {
        self.dev
    }

    /// Step the device for up to `cycles` cycles, 0 for no limit.
    pub fn run(&mut self, cycles: CycleCount) -> RunReport {
        let end = (cycles > 0).then(|| self.dev.cycle().saturating_add(cycles));
        let pace_every = (self.dev.frequency() / 1000).max(1);
        let mut next_pace = self.dev.cycle();
        self.pacer.restart();

        loop {
            if let Some(t) = terminal(self.dev.state()) {
                return self.finish(t);
            }
            let now = self.dev.cycle();
            if end.is_some_and(|e| now >= e) {
                return self.finish(Termination::BudgetExhausted);
            }
            if self.mode == RunMode::Realtime && now >= next_pace {
                self.pacer.pace(now, self.dev.frequency());
                next_pace = now + pace_every;
            }

            if self.dev.state() == DeviceState::Sleeping {
                let Some(when) = self.dev.next_timer_when() else {
                    if self.dev.options().contains(DeviceOptions::INFINITE_LOOP_DETECT) {
                        tracing::info!(parent: self.dev.span(), "sleeping with nothing scheduled, done");
                        self.dev.set_state(DeviceState::Done);
                        continue;
                    }
                    return self.finish(Termination::Idle);
                };
                // jump to the cycle before the timer, the step lands on it
                let target = end.map_or(when, |e| when.min(e));
                if target > now + 1 {
                    self.dev.increment_cycle(target - now - 1);
                }
            }
            self.dev.step();
        }
    }

    fn finish(&self, termination: Termination) -> RunReport {
        let report = RunReport::new(termination, self.dev);
        tracing::debug!(parent: self.dev.span(), "run ended: {:?} at cycle {}", termination, report.cycle);
        report
    }
}

/// Termination matching a device state, `None` while it can run.
fn terminal(state: DeviceState) -> Option<Termination> {
    match state {
        DeviceState::Running | DeviceState::Sleeping | DeviceState::Halted | DeviceState::Reset => None,
        DeviceState::Done => Some(Termination::Done),
        DeviceState::Break => Some(Termination::Break),
        DeviceState::Crashed => Some(Termination::Crashed),
        DeviceState::Stopped | DeviceState::Limbo | DeviceState::Ready => Some(Termination::Stopped),
    }
}

// ─── Asynchronous driver ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run until stopped.
    Continue,
    Pause,
    /// Run `n` cycles then pause.
    Step(CycleCount),
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Running,
    /// Pause requested, effective at the end of the current burst.
    PauseRequested,
    Killed,
    /// The device reached a final state.
    Done,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Background driver.
pub struct AsyncSimLoop {
    device: Arc<Mutex<Device>>,
    state: Arc<Mutex<LoopState>>,
    commands: cbc::Sender<Command>,
    handle: Option<JoinHandle<RunReport>>,
}

impl AsyncSimLoop {
    /// Move `dev` to a new thread. The loop starts stopped.
    pub fn spawn(dev: Device, mode: RunMode) -> Self {
        let device = Arc::new(Mutex::new(dev));
        let state = Arc::new(Mutex::new(LoopState::Stopped));
        let (tx, rx) = cbc::unbounded();
        let handle = {
            let device = device.clone();
            let state = state.clone();
            std::thread::spawn(move || worker(device, state, rx, mode))
        };
        AsyncSimLoop { device, state, commands: tx, handle: Some(handle) }
    }

    pub fn state(&self) -> LoopState {
        *lock(&self.state)
    }

    /// Send a command. Returns false once the worker has exited.
    pub fn send(&self, command: Command) -> bool {
        if command == Command::Pause {
            let mut st = lock(&self.state);
            if *st == LoopState::Running {
                *st = LoopState::PauseRequested;
            }
        }
        self.commands.send(command).is_ok()
    }

    /// Exclusive access to the device. The worker waits at its next burst
    /// boundary while the guard is held.
    pub fn transaction(&self) -> MutexGuard<'_, Device> {
        lock(&self.device)
    }

    /// Kill the worker if still running and return its final report.
    pub fn join(mut self) -> RunReport {
        let _ = self.commands.send(Command::Kill);
        match self.handle.take().map(|h| h.join()) {
            Some(Ok(report)) => report,
            _ => RunReport::new(Termination::Killed, &lock(&self.device)),
        }
    }
}

impl Drop for AsyncSimLoop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.commands.send(Command::Kill);
            let _ = handle.join();
        }
    }
}

fn worker(device: Arc<Mutex<Device>>, state: Arc<Mutex<LoopState>>, rx: cbc::Receiver<Command>, mode: RunMode) -> RunReport {
    let set = |s: LoopState| *lock(&state) = s;
    let mut running = false;
    // remaining cycles of a Step command
    let mut budget: Option<CycleCount> = None;
    let mut pacer = Pacer::default();

    loop {
        let command = if running {
            match rx.try_recv() {
                Ok(c) => Some(c),
                Err(cbc::TryRecvError::Empty) => None,
                Err(cbc::TryRecvError::Disconnected) => Some(Command::Kill),
            }
        } else {
            Some(rx.recv().unwrap_or(Command::Kill))
        };

        match command {
            Some(Command::Kill) => {
                set(LoopState::Killed);
                let dev = lock(&device);
                tracing::debug!(parent: dev.span(), "simulation killed at cycle {}", dev.cycle());
                return RunReport::new(Termination::Killed, &dev);
            }
            Some(Command::Pause) => {
                running = false;
                set(LoopState::Stopped);
                continue;
            }
            Some(Command::Continue) => {
                running = true;
                budget = None;
                pacer.restart();
                set(LoopState::Running);
            }
            Some(Command::Step(n)) => {
                running = n > 0;
                budget = Some(n);
                set(if running { LoopState::Running } else { LoopState::Stopped });
            }
            None => {}
        }
        if !running {
            continue;
        }

        let burst = budget.map_or(BURST_CYCLES, |b| b.min(BURST_CYCLES));
        let mut dev = lock(&device);
        let start = dev.cycle();
        let report = SimLoop::new(&mut *dev, RunMode::Fast).run(burst);
        if mode == RunMode::Realtime {
            pacer.pace(dev.cycle(), dev.frequency());
        }
        if let Some(b) = budget.as_mut() {
            *b = b.saturating_sub(dev.cycle() - start);
        }
        drop(dev);

        match report.termination {
            Termination::BudgetExhausted if budget == Some(0) => {
                running = false;
                set(LoopState::Stopped);
            }
            Termination::BudgetExhausted => {
                if *lock(&state) == LoopState::PauseRequested {
                    running = false;
                    set(LoopState::Stopped);
                }
            }
            Termination::Break | Termination::Idle => {
                running = false;
                set(LoopState::Stopped);
            }
            Termination::Done | Termination::Crashed | Termination::Stopped | Termination::Killed => {
                set(LoopState::Done);
                return report;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::CrashReason;
    use crate::peripherals::testutil::{self, asm};
    use crate::peripherals::atmega328_peripherals;

    fn device(words: &[u16]) -> Device {
        let mut dev = Device::new(DeviceConfig::atmega328(), atmega328_peripherals()).unwrap();
        dev.load_firmware(&testutil::firmware(words)).unwrap();
        dev
    }

    #[test]
    fn test_budget_exhausted() {
        let mut dev = device(&[asm::NOP, asm::rjmp(-2)]);
        let report = SimLoop::new(&mut dev, RunMode::Fast).run(1000);
        assert_eq!(report.termination, Termination::BudgetExhausted);
        assert!(report.cycle >= 1000 && report.cycle < 1003);
        assert_eq!(report.state, DeviceState::Running);
    }

    #[test]
    fn test_crash_is_reported() {
        // NOP then unprogrammed flash
        let mut dev = device(&[asm::NOP]);
        let report = SimLoop::new(&mut dev, RunMode::Fast).run(0);
        assert_eq!(report.termination, Termination::Crashed);
        assert_eq!(report.crash.map(|c| c.reason), Some(CrashReason::InvalidOpcode));
    }

    #[test]
    fn test_sleep_without_wake_source() {
        // SLEEP in idle mode with interrupts disabled and nothing scheduled
        let prog = [asm::ldi(16, 0x01), asm::out(0x33, 16), asm::SLEEP, asm::rjmp(-1)];
        let mut dev = device(&prog);
        let report = SimLoop::new(&mut dev, RunMode::Fast).run(0);
        assert_eq!(report.termination, Termination::Idle);
        assert_eq!(report.state, DeviceState::Sleeping);

        let mut dev = device(&prog);
        dev.set_options(DeviceOptions::INFINITE_LOOP_DETECT);
        let report = SimLoop::new(&mut dev, RunMode::Fast).run(0);
        assert_eq!(report.termination, Termination::Done);
    }

    #[test]
    fn test_fast_mode_skips_idle_sleep() {
        // timer 0 at clk/1024 with TOIE0, idle sleep in a loop
        let [sts0, sts1] = asm::sts(0x6E, 16);
        let mut prog = vec![asm::rjmp(39)];
        prog.resize(32, asm::NOP);
        prog.extend([0x9543, asm::RETI]); // INC r20; RETI
        prog.resize(40, asm::NOP);
        prog.extend([
            asm::ldi(16, 0x05),
            asm::out(0x25, 16),
            asm::ldi(16, 0x01),
            sts0,
            sts1,
            asm::out(0x33, 16),
            asm::SEI,
            asm::SLEEP,
            asm::rjmp(-2),
        ]);
        let mut dev = device(&prog);
        let report = SimLoop::new(&mut dev, RunMode::Fast).run(262_144 * 3 + 100);
        assert_eq!(report.termination, Termination::BudgetExhausted);
        // one overflow every 256 * 1024 cycles
        assert_eq!(dev.core().regs[20], 3);
    }

    #[test]
    fn test_realtime_paces_to_wall_clock() {
        let mut dev = device(&[asm::NOP, asm::rjmp(-2)]);
        let start = Instant::now();
        // 40 ms at 16 MHz
        SimLoop::new(&mut dev, RunMode::Realtime).run(640_000);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_async_step_pause_and_kill() {
        let dev = device(&[asm::NOP, asm::rjmp(-2)]);
        let sim = AsyncSimLoop::spawn(dev, RunMode::Fast);
        assert_eq!(sim.state(), LoopState::Stopped);

        assert!(sim.send(Command::Step(25_000)));
        let deadline = Instant::now() + Duration::from_secs(10);
        while sim.transaction().cycle() < 25_000 && Instant::now() < deadline {
            std::thread::yield_now();
        }
        while sim.state() != LoopState::Stopped && Instant::now() < deadline {
            std::thread::yield_now();
        }
        let cycle = sim.transaction().cycle();
        assert!((25_000..25_003).contains(&cycle));

        assert!(sim.send(Command::Continue));
        while sim.transaction().cycle() < 100_000 && Instant::now() < deadline {
            std::thread::yield_now();
        }
        sim.send(Command::Pause);
        while sim.state() != LoopState::Stopped && Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(sim.state(), LoopState::Stopped);
        let paused_at = sim.transaction().cycle();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sim.transaction().cycle(), paused_at);

        let report = sim.join();
        assert_eq!(report.termination, Termination::Killed);
        assert_eq!(report.cycle, paused_at);
    }

    #[test]
    fn test_async_ends_on_final_state() {
        let dev = device(&[asm::NOP]);
        let sim = AsyncSimLoop::spawn(dev, RunMode::Fast);
        sim.send(Command::Continue);
        let deadline = Instant::now() + Duration::from_secs(10);
        while sim.state() != LoopState::Done && Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(sim.state(), LoopState::Done);
        assert_eq!(sim.join().termination, Termination::Crashed);
    }
}
