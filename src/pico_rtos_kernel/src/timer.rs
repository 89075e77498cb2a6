//! Software timers
use arrayvec::ArrayVec;

use crate::{
    error::{BadIdError, ChangeTimerPeriodError, CreateObjectError},
    timeout::{remaining_until, time_reached, Ticks, MAX_DURATION},
    Kernel, Port,
};

define_id! {
    /// Identifies a software timer.
    pub struct TimerId;
}

/// A timer callback. It receives the parameter given at creation time and
/// runs outside CPU Lock, in the context that called
/// [`System::tick`](crate::System::tick).
pub type TimerCallback = fn(usize);

/// The maximum number of timers that can fire in one tick. Timers due beyond
/// this number fire on the following tick.
pub const MAX_EXPIRED_PER_TICK: usize = 16;

/// The callbacks collected by one tick.
pub(crate) type ExpiredTimers = ArrayVec<(TimerCallback, usize), MAX_EXPIRED_PER_TICK>;

/// *Timer control block*
#[derive(Debug)]
pub(crate) struct TimerCb {
    name: &'static str,
    callback: TimerCallback,
    param: usize,
    period: Ticks,
    auto_reload: bool,
    running: bool,
    /// Set when a one-shot timer fires.
    expired: bool,
    start_tick: Ticks,
    expiry: Ticks,
}

impl TimerCb {
    fn arm(&mut self, now: Ticks) {
        self.running = true;
        self.expired = false;
        self.start_tick = now;
        self.expiry = now.wrapping_add(self.period);
    }
}

/// Software timer operations
impl<P: Port> Kernel<P> {
    /// Create a stopped timer.
    pub fn timer_create(
        &mut self,
        name: &'static str,
        callback: TimerCallback,
        param: usize,
        period: Ticks,
        auto_reload: bool,
    ) -> Result<TimerId, CreateObjectError> {
        if period == 0 || period > MAX_DURATION {
            return Err(CreateObjectError::BadParam);
        }
        if self.timers.len() >= self.cfg.max_timers {
            return Err(CreateObjectError::LimitExceeded);
        }
        let timer = self.timers.insert(TimerCb {
            name,
            callback,
            param,
            period,
            auto_reload,
            running: false,
            expired: false,
            start_tick: 0,
            expiry: 0,
        });
        self.timer_list.push(timer);
        Ok(timer)
    }

    /// Start the timer so that it fires one period from now. A running timer
    /// is restarted.
    pub fn timer_start(&mut self, timer: TimerId) -> Result<(), BadIdError> {
        let now = self.tick_count;
        self.timers.get_mut(timer).ok_or(BadIdError::BadId)?.arm(now);
        Ok(())
    }

    /// Stop the timer. Returns whether it was running.
    pub fn timer_stop(&mut self, timer: TimerId) -> Result<bool, BadIdError> {
        let timer_cb = self.timers.get_mut(timer).ok_or(BadIdError::BadId)?;
        Ok(core::mem::replace(&mut timer_cb.running, false))
    }

    /// Restart the timer from now.
    pub fn timer_reset(&mut self, timer: TimerId) -> Result<(), BadIdError> {
        self.timer_start(timer)
    }

    /// Change the period. A running timer is re-armed from now with the new
    /// period.
    pub fn timer_change_period(
        &mut self,
        timer: TimerId,
        period: Ticks,
    ) -> Result<(), ChangeTimerPeriodError> {
        let now = self.tick_count;
        let timer_cb = self
            .timers
            .get_mut(timer)
            .ok_or(ChangeTimerPeriodError::BadId)?;
        if period == 0 || period > MAX_DURATION {
            return Err(ChangeTimerPeriodError::BadParam);
        }
        timer_cb.period = period;
        if timer_cb.running {
            timer_cb.arm(now);
        }
        Ok(())
    }

    pub fn timer_is_running(&self, timer: TimerId) -> Result<bool, BadIdError> {
        Ok(self.timers.get(timer).ok_or(BadIdError::BadId)?.running)
    }

    /// Return `true` if this is a one-shot timer that has fired and hasn't
    /// been restarted since.
    pub fn timer_is_expired(&self, timer: TimerId) -> Result<bool, BadIdError> {
        Ok(self.timers.get(timer).ok_or(BadIdError::BadId)?.expired)
    }

    /// Get the number of ticks until the timer fires, or zero if it's not
    /// running.
    pub fn timer_remaining_time(&self, timer: TimerId) -> Result<Ticks, BadIdError> {
        let timer_cb = self.timers.get(timer).ok_or(BadIdError::BadId)?;
        Ok(if timer_cb.running {
            remaining_until(self.tick_count, timer_cb.expiry)
        } else {
            0
        })
    }

    pub fn timer_name(&self, timer: TimerId) -> Result<&'static str, BadIdError> {
        Ok(self.timers.get(timer).ok_or(BadIdError::BadId)?.name)
    }

    pub fn timer_delete(&mut self, timer: TimerId) -> Result<(), BadIdError> {
        self.timers.remove(timer).ok_or(BadIdError::BadId)?;
        self.timer_list.retain(|&t| t != timer);
        Ok(())
    }

    /// Get the oldest timer.
    pub fn first_timer(&self) -> Option<TimerId> {
        self.timer_list.first().cloned()
    }

    /// Get the timer created right after `timer`.
    pub fn next_timer(&self, timer: TimerId) -> Option<TimerId> {
        let i = self.timer_list.iter().position(|&t| t == timer)?;
        self.timer_list.get(i + 1).cloned()
    }

    /// Find the timers that are due and update their state. The callbacks are
    /// returned in creation order so that the caller can run them after
    /// leaving CPU Lock.
    pub(crate) fn collect_expired_timers(&mut self) -> ExpiredTimers {
        let now = self.tick_count;
        let mut expired = ExpiredTimers::new();
        for &timer in &self.timer_list {
            let timer_cb = &mut self.timers[timer];
            if !timer_cb.running || timer_cb.expired || !time_reached(now, timer_cb.expiry) {
                continue;
            }
            if expired.is_full() {
                kwarn!("too many timers due in tick {}; deferring", now);
                break;
            }
            expired.push((timer_cb.callback, timer_cb.param));
            if timer_cb.auto_reload {
                timer_cb.expiry = timer_cb.expiry.wrapping_add(timer_cb.period);
            } else {
                timer_cb.running = false;
                timer_cb.expired = true;
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_port::TestPort, Config};
    use assert_matches::assert_matches;
    use std::cell::RefCell;

    thread_local! {
        static FIRED: RefCell<Vec<usize>> = RefCell::new(Vec::new());
    }

    fn record(param: usize) {
        FIRED.with(|f| f.borrow_mut().push(param));
    }

    fn take_fired() -> Vec<usize> {
        FIRED.with(|f| std::mem::take(&mut *f.borrow_mut()))
    }

    fn kernel() -> Kernel<TestPort> {
        let _ = env_logger::builder().is_test(true).try_init();
        take_fired();
        Kernel::new(Config::DEFAULT.with_max_timers(32)).unwrap()
    }

    fn tick_and_run(k: &mut Kernel<TestPort>) {
        k.tick().run_timers();
    }

    #[test]
    fn one_shot_fires_once() {
        let mut k = kernel();
        let t = k.timer_create("t", record, 7, 3, false).unwrap();
        assert_eq!(k.timer_is_running(t), Ok(false));
        k.timer_start(t).unwrap();
        assert_eq!(k.timer_remaining_time(t), Ok(3));

        tick_and_run(&mut k);
        tick_and_run(&mut k);
        assert_eq!(take_fired(), Vec::<usize>::new());
        assert_eq!(k.timer_remaining_time(t), Ok(1));
        tick_and_run(&mut k);
        assert_eq!(take_fired(), vec![7]);
        assert_eq!(k.timer_is_running(t), Ok(false));
        assert_eq!(k.timer_is_expired(t), Ok(true));
        assert_eq!(k.timer_remaining_time(t), Ok(0));

        for _ in 0..5 {
            tick_and_run(&mut k);
        }
        assert_eq!(take_fired(), Vec::<usize>::new());

        k.timer_reset(t).unwrap();
        assert_eq!(k.timer_is_expired(t), Ok(false));
    }

    #[test]
    fn auto_reload_keeps_period() {
        let mut k = kernel();
        let t = k.timer_create("t", record, 1, 2, true).unwrap();
        k.timer_start(t).unwrap();
        let mut fired_at = Vec::new();
        for _ in 0..7 {
            tick_and_run(&mut k);
            if !take_fired().is_empty() {
                fired_at.push(k.tick_count());
            }
        }
        assert_eq!(fired_at, vec![2, 4, 6]);
        assert_eq!(k.timer_stop(t), Ok(true));
        assert_eq!(k.timer_stop(t), Ok(false));
    }

    #[test]
    fn fire_in_creation_order() {
        let mut k = kernel();
        let ts: Vec<_> = (0..4)
            .map(|i| k.timer_create("t", record, i, 1, false).unwrap())
            .collect();
        for &t in ts.iter().rev() {
            k.timer_start(t).unwrap();
        }
        tick_and_run(&mut k);
        assert_eq!(take_fired(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn excess_timers_fire_next_tick() {
        let mut k = kernel();
        for i in 0..MAX_EXPIRED_PER_TICK + 2 {
            let t = k.timer_create("t", record, i, 1, false).unwrap();
            k.timer_start(t).unwrap();
        }
        tick_and_run(&mut k);
        assert_eq!(take_fired().len(), MAX_EXPIRED_PER_TICK);
        tick_and_run(&mut k);
        assert_eq!(
            take_fired(),
            vec![MAX_EXPIRED_PER_TICK, MAX_EXPIRED_PER_TICK + 1]
        );
    }

    #[test]
    fn change_period_rearms() {
        let mut k = kernel();
        let t = k.timer_create("t", record, 0, 10, false).unwrap();
        assert_matches!(
            k.timer_change_period(t, 0),
            Err(ChangeTimerPeriodError::BadParam)
        );
        k.timer_start(t).unwrap();
        tick_and_run(&mut k);
        k.timer_change_period(t, 4).unwrap();
        assert_eq!(k.timer_remaining_time(t), Ok(4));
    }

    #[test]
    fn limit_and_traversal() {
        let mut k: Kernel<TestPort> = Kernel::new(Config::DEFAULT.with_max_timers(2)).unwrap();
        assert_matches!(
            k.timer_create("z", record, 0, 0, false),
            Err(CreateObjectError::BadParam)
        );
        let a = k.timer_create("a", record, 0, 5, false).unwrap();
        let b = k.timer_create("b", record, 0, 5, false).unwrap();
        assert_matches!(
            k.timer_create("c", record, 0, 5, false),
            Err(CreateObjectError::LimitExceeded)
        );
        assert_eq!(k.first_timer(), Some(a));
        assert_eq!(k.next_timer(a), Some(b));
        assert_eq!(k.next_timer(b), None);
        assert_eq!(k.timer_name(b), Ok("b"));

        k.timer_delete(a).unwrap();
        assert_eq!(k.first_timer(), Some(b));
        assert_eq!(k.timer_start(a), Err(BadIdError::BadId));
        k.timer_create("c", record, 0, 5, false).unwrap();
    }
}
