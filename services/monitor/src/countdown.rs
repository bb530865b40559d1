//! Timer countdown.
//!
//! [`remaining`] is the pure derivation. [`CountdownTicker`] recomputes it
//! once a second while the timer is active and the push channel is
//! connected, and publishes the result on a `watch` channel.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::debug;

use crate::connection::{ConnectionPhase, ConnectionState};
use crate::store::{DeviceStateStore, StoreSubscription};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Remaining {
    pub hours: u64,
    pub minutes: u8,
    pub seconds: u8,
}

impl Remaining {
    pub const ZERO: Remaining = Remaining {
        hours: 0,
        minutes: 0,
        seconds: 0,
    };

    #[allow(clippy::cast_possible_truncation)]
    pub fn from_seconds(total: u64) -> Self {
        Self {
            hours: total / 3600,
            minutes: ((total % 3600) / 60) as u8,
            seconds: (total % 60) as u8,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

/// Parse a timer end timestamp. RFC 3339 is tried first; a timestamp
/// without an offset is read as UTC.
pub fn parse_end_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Time left until `end`, clamped at zero. Missing or unparseable input
/// yields zero.
pub fn remaining(end: Option<&str>, now: DateTime<Utc>) -> Remaining {
    let Some(end) = end.and_then(parse_end_time) else {
        return Remaining::ZERO;
    };
    let secs = (end - now).num_seconds();
    u64::try_from(secs).map_or(Remaining::ZERO, Remaining::from_seconds)
}

/// Timer fields of the store, as seen by the ticker.
#[derive(Debug, Clone, Default, PartialEq)]
struct TimerView {
    active: bool,
    end_time: Option<String>,
}

impl TimerView {
    fn of(store: &DeviceStateStore) -> Self {
        let system = store.system();
        Self {
            active: system.timer_active,
            end_time: system.timer_end_time,
        }
    }
}

/// Background countdown task. Stops when dropped.
pub struct CountdownTicker {
    task: JoinHandle<()>,
    value: watch::Receiver<Remaining>,
    _store: StoreSubscription,
}

impl CountdownTicker {
    /// Start the ticker. Must be called inside a tokio runtime.
    pub fn spawn(
        store: &DeviceStateStore,
        connection: broadcast::Receiver<ConnectionState>,
        connected: bool,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let subscription = store.subscribe(move |view| {
            let _ = timer_tx.send(TimerView {
                active: view.system.timer_active,
                end_time: view.system.timer_end_time.clone(),
            });
        });
        let initial = TimerView::of(store);
        let (value_tx, value) = watch::channel(Remaining::ZERO);
        let task = tokio::spawn(run(timer_rx, connection, initial, connected, value_tx));
        Self {
            task,
            value,
            _store: subscription,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Remaining> {
        self.value.clone()
    }

    pub fn current(&self) -> Remaining {
        *self.value.borrow()
    }
}

impl Drop for CountdownTicker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run(
    mut timer_rx: mpsc::UnboundedReceiver<TimerView>,
    mut connection: broadcast::Receiver<ConnectionState>,
    mut timer: TimerView,
    mut connected: bool,
    value: watch::Sender<Remaining>,
) {
    let mut ticker: Option<Interval> = None;
    loop {
        let now = if timer.active {
            remaining(timer.end_time.as_deref(), Utc::now())
        } else {
            Remaining::ZERO
        };
        value.send_if_modified(|current| {
            if *current == now {
                false
            } else {
                *current = now;
                true
            }
        });

        let should_tick = timer.active && connected && !now.is_zero();
        match (should_tick, ticker.is_some()) {
            (true, false) => {
                debug!("countdown tick started");
                let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + TICK, TICK);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker = Some(interval);
            }
            (false, true) => {
                debug!("countdown tick canceled");
                ticker = None;
            }
            _ => {}
        }

        tokio::select! {
            next = timer_rx.recv() => match next {
                Some(view) => timer = view,
                None => return,
            },
            state = connection.recv() => match state {
                Ok(state) => connected = state.phase == ConnectionPhase::Connected,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
            () = next_tick(&mut ticker) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sw_protocol::{MachineState, StatusUpdate};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 21, h, m, s).unwrap()
    }

    #[test]
    fn splits_difference_into_units() {
        let r = remaining(Some("2024-03-21T15:30:00Z"), at(14, 0, 5));
        assert_eq!(
            r,
            Remaining {
                hours: 1,
                minutes: 29,
                seconds: 55
            }
        );
    }

    #[test]
    fn naive_and_offset_forms_are_utc() {
        let now = at(15, 0, 0);
        let naive = remaining(Some("2024-03-21T15:30:00.123456"), now);
        let offset = remaining(Some("2024-03-21T16:30:00+01:00"), now);
        assert_eq!(naive, Remaining::from_seconds(30 * 60));
        assert_eq!(offset, naive);
    }

    #[test]
    fn past_or_equal_end_clamps_to_zero() {
        assert!(remaining(Some("2024-03-21T15:30:00Z"), at(15, 30, 0)).is_zero());
        assert!(remaining(Some("2024-03-21T15:30:00Z"), at(18, 0, 0)).is_zero());
    }

    #[test]
    fn missing_or_garbage_end_is_zero() {
        assert!(remaining(None, at(1, 0, 0)).is_zero());
        assert!(remaining(Some("soon"), at(1, 0, 0)).is_zero());
        assert!(remaining(Some(""), at(1, 0, 0)).is_zero());
    }

    #[test]
    fn non_increasing_as_time_advances() {
        let end = Some("2024-03-21T12:00:10Z");
        let mut last = remaining(end, at(11, 59, 0));
        for s in 1..=80 {
            let now = at(11, 59, 0) + chrono::Duration::seconds(s);
            let next = remaining(end, now);
            assert!(next <= last, "{next:?} > {last:?} at +{s}s");
            last = next;
        }
        assert!(last.is_zero());
    }

    fn timer_snapshot(active: bool, end: Option<String>) -> StatusUpdate {
        StatusUpdate {
            supply_voltage: 13.0,
            machine_state: MachineState::On,
            timer_active: active,
            timer_end_time: end,
            stations: Vec::new(),
        }
    }

    async fn wait_for(rx: &mut watch::Receiver<Remaining>, pred: impl Fn(&Remaining) -> bool) -> Remaining {
        tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|r| pred(r)))
            .await
            .expect("timed out waiting for countdown")
            .map(|r| *r)
            .unwrap()
    }

    #[tokio::test]
    async fn ticker_follows_timer_activation() {
        let store = DeviceStateStore::new();
        let (_conn_tx, conn_rx) = broadcast::channel(8);
        let ticker = CountdownTicker::spawn(&store, conn_rx, true);
        let mut rx = ticker.subscribe();
        assert!(ticker.current().is_zero());

        let end = (Utc::now() + chrono::Duration::minutes(90)).to_rfc3339();
        store.apply_snapshot(timer_snapshot(true, Some(end)));
        let r = wait_for(&mut rx, |r| !r.is_zero()).await;
        assert_eq!(r.hours, 1);
        assert!(r.minutes >= 29);

        store.apply_snapshot(timer_snapshot(false, None));
        wait_for(&mut rx, Remaining::is_zero).await;
    }

    #[tokio::test]
    async fn ticker_keeps_counting_down_while_connected() {
        let store = DeviceStateStore::new();
        let (_conn_tx, conn_rx) = broadcast::channel(8);
        let ticker = CountdownTicker::spawn(&store, conn_rx, true);
        let mut rx = ticker.subscribe();

        let end = (Utc::now() + chrono::Duration::minutes(10)).to_rfc3339();
        store.apply_snapshot(timer_snapshot(true, Some(end)));
        let first = wait_for(&mut rx, |r| !r.is_zero()).await;
        let later = wait_for(&mut rx, |r| *r < first).await;
        assert!(later < first);
    }

    #[tokio::test]
    async fn disconnect_stops_the_tick() {
        let store = DeviceStateStore::new();
        let (conn_tx, conn_rx) = broadcast::channel(8);
        let ticker = CountdownTicker::spawn(&store, conn_rx, true);
        let mut rx = ticker.subscribe();

        let end = (Utc::now() + chrono::Duration::minutes(10)).to_rfc3339();
        store.apply_snapshot(timer_snapshot(true, Some(end)));
        wait_for(&mut rx, |r| !r.is_zero()).await;

        conn_tx
            .send(ConnectionState {
                phase: ConnectionPhase::Disconnected,
                ..ConnectionState::default()
            })
            .unwrap();
        // Let the disconnect land, then expect no further ticks.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let frozen = ticker.current();
        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert_eq!(ticker.current(), frozen);
    }
}
