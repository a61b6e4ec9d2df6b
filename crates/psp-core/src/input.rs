//! Controller latch state shared between the input-polling thread and the
//! CPU thread's syscall shims.
//!
//! The four latch words (make/break/press/release) must be observed as a
//! consistent snapshot, so updates go through a seqlock: writers bump the
//! sequence word to odd, store, bump back to even; readers retry when they
//! see an odd or changed sequence. Writers are serialized by a short mutex
//! (the input thread and the latch-consuming CPU thread both mutate).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Analog axes rest at the midpoint of the 0..=255 range. All read paths
/// center here, including when no device sample exists.
pub const ANALOG_CENTER: u8 = 128;

/// A consistent latch snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Latch {
    /// Buttons that went down since the previous sample.
    pub make: u32,
    /// Buttons that went up since the previous sample.
    pub brk: u32,
    /// Buttons currently held.
    pub press: u32,
    /// Complement of `press`.
    pub release: u32,
}

pub struct CtrlState {
    seq: AtomicU32,
    make: AtomicU32,
    brk: AtomicU32,
    press: AtomicU32,
    release: AtomicU32,
    analog_x: AtomicU32,
    analog_y: AtomicU32,
    writer: Mutex<()>,
}

impl CtrlState {
    pub fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            make: AtomicU32::new(0),
            brk: AtomicU32::new(0),
            press: AtomicU32::new(0),
            release: AtomicU32::new(!0),
            analog_x: AtomicU32::new(u32::from(ANALOG_CENTER)),
            analog_y: AtomicU32::new(u32::from(ANALOG_CENTER)),
            writer: Mutex::new(()),
        }
    }

    fn write_locked(&self, f: impl FnOnce()) {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        self.seq.fetch_add(1, Ordering::Release);
        f();
        self.seq.fetch_add(1, Ordering::Release);
    }

    /// Record a new button sample from the input thread.
    pub fn update_buttons(&self, buttons: u32) {
        self.write_locked(|| {
            let old_pressed = self.press.load(Ordering::Relaxed);
            let still_pressed = buttons & old_pressed;
            self.press.store(buttons, Ordering::Relaxed);
            self.release.store(!buttons, Ordering::Relaxed);
            self.make.store(buttons & !still_pressed, Ordering::Relaxed);
            self.brk.store(old_pressed & !still_pressed, Ordering::Relaxed);
        });
    }

    /// Record an analog sample, already normalized to 0..=255.
    pub fn update_analog(&self, x: u8, y: u8) {
        self.analog_x.store(u32::from(x), Ordering::Release);
        self.analog_y.store(u32::from(y), Ordering::Release);
    }

    fn read_snapshot(&self) -> Latch {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let latch = Latch {
                make: self.make.load(Ordering::Relaxed),
                brk: self.brk.load(Ordering::Relaxed),
                press: self.press.load(Ordering::Relaxed),
                release: self.release.load(Ordering::Relaxed),
            };
            if self.seq.load(Ordering::Acquire) == before {
                return latch;
            }
        }
    }

    /// Non-destructive latch read.
    pub fn peek_latch(&self) -> Latch {
        self.read_snapshot()
    }

    /// Latch read that consumes the edge words: make/break reset so the next
    /// read only reports new transitions.
    pub fn read_latch(&self) -> Latch {
        let mut latch = Latch::default();
        self.write_locked(|| {
            latch = Latch {
                make: self.make.load(Ordering::Relaxed),
                brk: self.brk.load(Ordering::Relaxed),
                press: self.press.load(Ordering::Relaxed),
                release: self.release.load(Ordering::Relaxed),
            };
            self.make.store(0, Ordering::Relaxed);
            self.brk.store(0, Ordering::Relaxed);
        });
        latch
    }

    /// Current analog sample, centered at 128.
    pub fn analog(&self) -> (u8, u8) {
        (
            self.analog_x.load(Ordering::Acquire) as u8,
            self.analog_y.load(Ordering::Acquire) as u8,
        )
    }
}

impl Default for CtrlState {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a signed device axis spanning `-max/2..=max/2` to the guest's
/// 0..=255 range, centered at 128. Applied uniformly on every read path; a
/// zero (resting) input always lands exactly on the center.
pub fn normalize_axis(raw: i32, max: u32) -> u8 {
    if max == 0 || raw == 0 {
        return ANALOG_CENTER;
    }
    let scaled = ((raw as f32 / max as f32) + 0.5) * 256.0;
    scaled.clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn button_edges_follow_press_transitions() {
        let state = CtrlState::new();
        state.update_buttons(0b0011);
        let latch = state.peek_latch();
        assert_eq!(latch.make, 0b0011);
        assert_eq!(latch.brk, 0);
        assert_eq!(latch.press, 0b0011);
        assert_eq!(latch.release, !0b0011);

        // One held, one released, one new.
        state.update_buttons(0b0101);
        let latch = state.peek_latch();
        assert_eq!(latch.press, 0b0101);
        assert_eq!(latch.make, 0b0100);
        assert_eq!(latch.brk, 0b0010);
    }

    #[test]
    fn read_latch_consumes_edges_but_not_state() {
        let state = CtrlState::new();
        state.update_buttons(0b1);
        let first = state.read_latch();
        assert_eq!(first.make, 0b1);

        let second = state.read_latch();
        assert_eq!(second.make, 0);
        assert_eq!(second.brk, 0);
        assert_eq!(second.press, 0b1);
    }

    #[test]
    fn analog_rests_centered() {
        let state = CtrlState::new();
        assert_eq!(state.analog(), (ANALOG_CENTER, ANALOG_CENTER));
        state.update_analog(normalize_axis(32767, 0xFFFF), normalize_axis(0, 0xFFFF));
        let (x, y) = state.analog();
        assert!(x > 250);
        assert_eq!(y, ANALOG_CENTER);
    }

    #[test]
    fn concurrent_updates_never_tear_the_snapshot() {
        let state = Arc::new(CtrlState::new());
        let writer = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || {
                for i in 0..20_000u32 {
                    // press and release are complements in every update.
                    state.update_buttons(i & 0xFFFF);
                }
            })
        };

        for _ in 0..20_000 {
            let latch = state.peek_latch();
            assert_eq!(latch.release, !latch.press, "torn seqlock read");
        }
        writer.join().unwrap();
    }
}
