//! Stack frames staged for contexts that have never run.
//!
//! A new context is dispatched by the same PendSV exception return that
//! resumes a preempted one, so its stack must look like it was switched out
//! right before executing its first instruction:
//!
//! ```text
//!  low address                                               high address
//!  ┌────────────┬─────────┬──────────┬────────────────────────────────────┐
//!  │ EXC_RETURN │ r4 - r7 │ r8 - r11 │ r0 r1 r2 r3 r12 lr pc xPSR         │
//!  └────────────┴─────────┴──────────┴────────────────────────────────────┘
//!   ^ saved SP   (saved by PendSV)    ^ PSP on return (stacked by hardware)
//! ```
use core::mem::size_of;

/// The number of words stacked by the hardware on exception entry.
pub const HW_FRAME_WORDS: usize = 8;

/// The number of words saved and restored by PendSV: `EXC_RETURN` and
/// `r4`-`r11`.
pub const SW_FRAME_WORDS: usize = 9;

pub const FRAME_WORDS: usize = SW_FRAME_WORDS + HW_FRAME_WORDS;

/// `EXC_RETURN` value meaning "Return to Thread mode, exception return gets
/// state from the process stack, on return execution uses the process stack".
pub const EXC_RETURN_THREAD_PSP: u32 = 0xffff_fffd;

/// `xPSR` with only the Thumb bit set.
pub const XPSR_THUMB: u32 = 0x0100_0000;

// The guard words, one word of alignment slack, and the frame must fit in the
// smallest stack the kernel hands out
const _: () = assert!(FRAME_WORDS + 3 <= pico_rtos_kernel::MIN_STACK_WORDS);

/// The register values a new context starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialFrame {
    /// Loaded to `r0`
    pub param: u32,
    /// Loaded to `r1`
    pub entry: u32,
    /// The address of the start routine. The Thumb bit may be set; it's
    /// cleared in the frame.
    pub pc: u32,
    /// The return address of the start routine
    pub lr: u32,
}

impl InitialFrame {
    /// Get the frame contents in memory order.
    pub fn words(&self) -> [u32; FRAME_WORDS] {
        let mut words = [0; FRAME_WORDS];

        words[0] = EXC_RETURN_THREAD_PSP;

        // r4-r11
        if cfg!(feature = "preload-registers") {
            for (i, w) in words[1..SW_FRAME_WORDS].iter_mut().enumerate() {
                *w = 0x0101_0101 * (i as u32 + 4);
            }
        }

        let hw = &mut words[SW_FRAME_WORDS..];
        hw[0] = self.param;
        hw[1] = self.entry;
        // r2, r3, r12
        if cfg!(feature = "preload-registers") {
            hw[2] = 0x0202_0202;
            hw[3] = 0x0303_0303;
            hw[4] = 0x1212_1212;
        }
        hw[5] = self.lr;
        // An exception frame holds the exact program counter, so the bit
        // signifying Thumb state must be cleared
        hw[6] = self.pc & !1;
        hw[7] = XPSR_THUMB;

        words
    }
}

/// Write `frame` at the top of `stack` and return the index of its lowest
/// word, which is where the saved stack pointer points to.
///
/// The hardware part of the frame is placed on an 8-byte boundary as
/// required by the procedure call standard. The two lowest words of `stack`
/// (the stack guard) are never written.
///
/// # Panics
///
/// This panics if `stack` is too small to hold the frame.
pub fn write_initial_frame(stack: &mut [usize], frame: &InitialFrame) -> usize {
    let mut top = stack.len();
    let top_addr = stack.as_ptr() as usize + top * size_of::<usize>();
    if top_addr % 8 != 0 {
        top = top.saturating_sub(1);
    }

    assert!(top >= FRAME_WORDS + 2, "stack too small for the initial frame");
    let base = top - FRAME_WORDS;
    for (slot, word) in stack[base..top].iter_mut().zip(frame.words()) {
        *slot = word as usize;
    }
    base
}
