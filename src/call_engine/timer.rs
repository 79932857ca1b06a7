//! Session Timer
//!
//! Sekündlicher Tick, solange eine Session ACTIVE ist. Der Task läuft, bis der
//! Callback `false` liefert oder der [`SessionTimer`] gedroppt wird. Drop
//! bricht den Task immer ab, auch auf Fehlerpfaden.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct SessionTimer {
    handle: JoinHandle<()>,
}

impl SessionTimer {
    /// Startet den Timer; der erste Tick kommt nach einer Sekunde
    pub fn start<F>(on_tick: F) -> Self
    where
        F: Fn() -> bool + Send + 'static,
    {
        Self::with_interval(TICK_INTERVAL, on_tick)
    }

    pub fn with_interval<F>(period: Duration, on_tick: F) -> Self
    where
        F: Fn() -> bool + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !on_tick() {
                    break;
                }
            }
        });

        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_once_per_second() {
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);
        let _timer = SessionTimer::start(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_ticking() {
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);
        let timer = SessionTimer::start(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        drop(timer);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_can_stop_timer() {
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);
        let timer = SessionTimer::start(move || counter.fetch_add(1, Ordering::SeqCst) < 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(!timer.is_running());
    }
}
