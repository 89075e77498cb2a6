//! Kernel configuration
use crate::error::InitError;

/// The tick rates accepted by [`Config::validate`].
pub const SUPPORTED_TICK_RATES_HZ: [u32; 5] = [100, 250, 500, 1000, 2000];

/// Kernel configuration, consumed by [`Kernel::new`](crate::Kernel::new).
///
/// # Examples
///
/// ```
/// use pico_rtos_kernel::Config;
/// const CFG: Config = Config::DEFAULT.with_tick_rate_hz(500).with_max_tasks(8);
/// assert_eq!(CFG.tick_period_us(), 2000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// The frequency of the system tick.
    pub tick_rate_hz: u32,
    /// The maximum number of tasks that may exist at once, including
    /// terminated tasks awaiting cleanup.
    pub max_tasks: usize,
    /// The maximum number of software timers that may exist at once.
    pub max_timers: usize,
    /// The stack size used by [`Kernel::task_create`] when it's given zero.
    ///
    /// [`Kernel::task_create`]: crate::Kernel::task_create
    pub default_stack_words: usize,
    /// The stack size of the idle context.
    pub idle_stack_words: usize,
    /// The number of idle iterations between stack guard checks.
    pub stack_check_interval: u32,
    /// The number of ticks between reclamations of terminated tasks.
    pub cleanup_interval: u32,
}

impl Config {
    pub const DEFAULT: Self = Self {
        tick_rate_hz: 1000,
        max_tasks: 16,
        max_timers: 8,
        default_stack_words: 256,
        idle_stack_words: 64,
        stack_check_interval: 1000,
        cleanup_interval: 100,
    };

    pub const fn with_tick_rate_hz(self, tick_rate_hz: u32) -> Self {
        Self {
            tick_rate_hz,
            ..self
        }
    }

    pub const fn with_max_tasks(self, max_tasks: usize) -> Self {
        Self { max_tasks, ..self }
    }

    pub const fn with_max_timers(self, max_timers: usize) -> Self {
        Self { max_timers, ..self }
    }

    pub const fn with_default_stack_words(self, default_stack_words: usize) -> Self {
        Self {
            default_stack_words,
            ..self
        }
    }

    pub const fn with_idle_stack_words(self, idle_stack_words: usize) -> Self {
        Self {
            idle_stack_words,
            ..self
        }
    }

    pub const fn with_stack_check_interval(self, stack_check_interval: u32) -> Self {
        Self {
            stack_check_interval,
            ..self
        }
    }

    pub const fn with_cleanup_interval(self, cleanup_interval: u32) -> Self {
        Self {
            cleanup_interval,
            ..self
        }
    }

    /// The length of a tick in microseconds.
    pub const fn tick_period_us(&self) -> u32 {
        1_000_000 / self.tick_rate_hz
    }

    /// Check the configuration values.
    pub fn validate(&self) -> Result<(), InitError> {
        if !SUPPORTED_TICK_RATES_HZ.contains(&self.tick_rate_hz)
            || self.max_tasks == 0
            || self.default_stack_words < crate::MIN_STACK_WORDS
            || self.idle_stack_words < crate::MIN_STACK_WORDS
            || self.stack_check_interval == 0
            || self.cleanup_interval == 0
        {
            return Err(InitError::BadConfig);
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn default_is_valid() {
        assert_matches!(Config::DEFAULT.validate(), Ok(()));
        assert_eq!(Config::default().tick_period_us(), 1000);
    }

    #[test]
    fn rejects_unsupported_tick_rate() {
        assert_matches!(
            Config::DEFAULT.with_tick_rate_hz(300).validate(),
            Err(InitError::BadConfig)
        );
        assert_matches!(Config::DEFAULT.with_tick_rate_hz(2000).validate(), Ok(()));
    }

    #[test]
    fn rejects_degenerate_values() {
        assert_matches!(
            Config::DEFAULT.with_max_tasks(0).validate(),
            Err(InitError::BadConfig)
        );
        assert_matches!(
            Config::DEFAULT.with_idle_stack_words(4).validate(),
            Err(InitError::BadConfig)
        );
        assert_matches!(
            Config::DEFAULT.with_cleanup_interval(0).validate(),
            Err(InitError::BadConfig)
        );
    }
}
