//! Tick arithmetic and timeout specifications
//!
//! The tick counter is a free-running 32-bit value that wraps around. Points
//! in time are compared by the sign of their wrapping difference, which is
//! correct as long as the two points are less than `2^31` ticks apart. For
//! this reason durations longer than `i32::MAX` ticks are rejected.

/// A tick count or a duration measured in ticks.
pub type Ticks = u32;

/// The longest finite duration accepted by blocking operations.
pub(crate) const MAX_DURATION: Ticks = i32::MAX as Ticks;

/// How long a blocking operation may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeout {
    /// Give up after the specified number of ticks. `Ticks(0)` never blocks.
    Ticks(Ticks),
    /// Wait until the resource becomes available.
    Forever,
}

impl Timeout {
    /// Fail immediately if the resource is unavailable.
    pub const NO_WAIT: Self = Self::Ticks(0);

    /// Wait indefinitely.
    pub const FOREVER: Self = Self::Forever;

    /// Return `true` if this timeout never blocks.
    #[inline]
    pub const fn is_zero(self) -> bool {
        matches!(self, Self::Ticks(0))
    }
}

impl From<Ticks> for Timeout {
    /// Convert a raw tick count. `u32::MAX` means [`Timeout::Forever`].
    #[inline]
    fn from(x: Ticks) -> Self {
        if x == Ticks::MAX {
            Self::Forever
        } else {
            Self::Ticks(x)
        }
    }
}

/// An absolute point in time at which a wait ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deadline {
    At(Ticks),
    Never,
}

impl Deadline {
    /// Convert `timeout` to a deadline relative to `now`. Returns `None` if
    /// the duration is out of range.
    pub(crate) fn after(now: Ticks, timeout: Timeout) -> Option<Self> {
        match timeout {
            Timeout::Forever => Some(Self::Never),
            Timeout::Ticks(d) if d <= MAX_DURATION => Some(Self::At(now.wrapping_add(d))),
            Timeout::Ticks(_) => None,
        }
    }

    /// Return `true` if the deadline has been reached at `now`.
    #[inline]
    pub(crate) fn has_elapsed(self, now: Ticks) -> bool {
        match self {
            Self::At(at) => time_reached(now, at),
            Self::Never => false,
        }
    }

    /// Get the number of ticks left until the deadline, saturating at zero.
    #[cfg(test)]
    pub(crate) fn remaining(self, now: Ticks) -> Option<Ticks> {
        match self {
            Self::At(at) => Some(remaining_until(now, at)),
            Self::Never => None,
        }
    }
}

/// Return `true` if `now` is at or past `at`, taking the wrap-around into
/// account.
#[inline]
pub(crate) fn time_reached(now: Ticks, at: Ticks) -> bool {
    (now.wrapping_sub(at) as i32) >= 0
}

/// Get the number of ticks from `now` until `at`, or zero if `at` has been
/// reached.
#[inline]
pub(crate) fn remaining_until(now: Ticks, at: Ticks) -> Ticks {
    let diff = at.wrapping_sub(now) as i32;
    if diff > 0 {
        diff as Ticks
    } else {
        0
    }
}
