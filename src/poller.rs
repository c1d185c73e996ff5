//! Background revalidation timers.
//!
//! One timer per cache key, running at the minimum interval requested by the
//! key's polling subscribers. The tick callback decides what a tick does; the
//! query client uses it to force a refetch unless one is already in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::cache::{CacheKey, SubscriberId};

/// Shortest accepted poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

type TickFn = Arc<dyn Fn(&CacheKey) + Send + Sync>;

struct PollTimer {
  requests: HashMap<SubscriberId, Duration>,
  period: Duration,
  task: JoinHandle<()>,
}

impl PollTimer {
  fn min_requested(&self) -> Option<Duration> {
    self.requests.values().min().copied()
  }
}

impl Drop for PollTimer {
  fn drop(&mut self) {
    self.task.abort();
  }
}

pub struct Poller {
  timers: Mutex<HashMap<CacheKey, PollTimer>>,
  on_tick: TickFn,
}

impl Poller {
  pub fn new<F>(on_tick: F) -> Self
  where
    F: Fn(&CacheKey) + Send + Sync + 'static,
  {
    Self {
      timers: Mutex::new(HashMap::new()),
      on_tick: Arc::new(on_tick),
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, PollTimer>> {
    self.timers.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Register `subscriber`'s interval for `key`, starting or retiming the
  /// shared timer as needed. Must be called inside a Tokio runtime.
  pub fn add(&self, key: &CacheKey, subscriber: SubscriberId, interval: Duration) {
    let interval = interval.max(MIN_POLL_INTERVAL);
    let mut timers = self.lock();

    match timers.get_mut(key) {
      Some(timer) => {
        timer.requests.insert(subscriber, interval);
        self.retime(key, timer);
      }
      None => {
        debug!(key = %key, ?interval, "Starting poll timer");
        let task = self.spawn(key, interval);
        timers.insert(
          key.clone(),
          PollTimer {
            requests: HashMap::from([(subscriber, interval)]),
            period: interval,
            task,
          },
        );
      }
    }
  }

  /// Drop `subscriber`'s request. The timer stops when no polling
  /// subscriber remains, or is retimed to the new minimum.
  pub fn remove(&self, key: &CacheKey, subscriber: SubscriberId) {
    let mut timers = self.lock();
    let Some(timer) = timers.get_mut(key) else {
      return;
    };
    if timer.requests.remove(&subscriber).is_none() {
      return;
    }

    if timer.requests.is_empty() {
      timers.remove(key);
      debug!(key = %key, "Stopped poll timer");
    } else {
      self.retime(key, timer);
    }
  }

  /// Effective interval for `key`, if it is being polled.
  pub fn interval(&self, key: &CacheKey) -> Option<Duration> {
    self.lock().get(key).map(|timer| timer.period)
  }

  pub fn is_polling(&self, key: &CacheKey) -> bool {
    self.lock().contains_key(key)
  }

  pub fn active_timers(&self) -> usize {
    self.lock().len()
  }

  fn retime(&self, key: &CacheKey, timer: &mut PollTimer) {
    let Some(period) = timer.min_requested() else {
      return;
    };
    if period != timer.period {
      debug!(key = %key, from = ?timer.period, to = ?period, "Retiming poll timer");
      timer.task.abort();
      timer.task = self.spawn(key, period);
      timer.period = period;
    }
  }

  fn spawn(&self, key: &CacheKey, period: Duration) -> JoinHandle<()> {
    let on_tick = Arc::clone(&self.on_tick);
    let key = key.clone();
    tokio::spawn(async move {
      let mut ticks = interval_at(Instant::now() + period, period);
      ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
        ticks.tick().await;
        trace!(key = %key, "Poll tick");
        on_tick(&key);
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn counting_poller() -> (Poller, Arc<AtomicUsize>) {
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = ticks.clone();
    let poller = Poller::new(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    (poller, ticks)
  }

  fn key() -> CacheKey {
    CacheKey::new("listNotifications", &json!(null))
  }

  #[tokio::test(start_paused = true)]
  async fn test_ticks_at_interval() {
    let (poller, ticks) = counting_poller();
    poller.add(&key(), 1, Duration::from_millis(1000));

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_shared_timer_uses_minimum_interval() {
    let (poller, ticks) = counting_poller();
    let key = key();
    poller.add(&key, 1, Duration::from_millis(30_000));
    poller.add(&key, 2, Duration::from_millis(15_000));
    assert_eq!(poller.active_timers(), 1);
    assert_eq!(poller.interval(&key), Some(Duration::from_millis(15_000)));

    tokio::time::sleep(Duration::from_millis(31_000)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 2);

    // Fast subscriber leaves: back to the slower interval
    poller.remove(&key, 2);
    assert_eq!(poller.interval(&key), Some(Duration::from_millis(30_000)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_removing_last_request_stops_timer() {
    let (poller, ticks) = counting_poller();
    let key = key();
    poller.add(&key, 1, Duration::from_millis(1000));
    poller.remove(&key, 1);
    assert!(!poller.is_polling(&key));

    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_restart_after_stop() {
    let (poller, ticks) = counting_poller();
    let key = key();
    poller.add(&key, 1, Duration::from_millis(1000));
    poller.remove(&key, 1);
    // Unknown subscriber is a no-op
    poller.remove(&key, 1);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 0);

    poller.add(&key, 2, Duration::from_millis(1000));
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_interval_is_clamped() {
    let (poller, _) = counting_poller();
    poller.add(&key(), 1, Duration::ZERO);
    assert_eq!(poller.interval(&key()), Some(MIN_POLL_INTERVAL));
  }
}
