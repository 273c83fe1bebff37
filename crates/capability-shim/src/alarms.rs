//! `alarms.*` timers. Each alarm is a tokio task firing the owning context's alarm listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::listeners::{EventKind, ListenerRegistry};
use crate::ShimError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    pub name: String,
    pub scheduled_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_in_minutes: Option<f64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmCreateInfo {
    #[serde(default)]
    pub when: Option<f64>,
    #[serde(default)]
    pub delay_in_minutes: Option<f64>,
    #[serde(default)]
    pub period_in_minutes: Option<f64>,
}

struct AlarmEntry {
    seq: u64,
    alarm: Alarm,
    task: JoinHandle<()>,
}

type AlarmMap = Arc<Mutex<HashMap<String, AlarmEntry>>>;

pub struct AlarmScheduler {
    alarms: AlarmMap,
    listeners: Weak<ListenerRegistry>,
    alive: CancellationToken,
    seq: AtomicU64,
}

fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or_default()
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

fn minutes(value: f64) -> Duration {
    seconds(value * 60.0)
}

impl AlarmScheduler {
    pub fn new(listeners: &Arc<ListenerRegistry>, alive: CancellationToken) -> Self {
        Self {
            alarms: Arc::new(Mutex::new(HashMap::new())),
            listeners: Arc::downgrade(listeners),
            alive,
            seq: AtomicU64::new(0),
        }
    }

    /// Creates (or replaces) the alarm called `name`.
    pub fn create(&self, name: &str, info: AlarmCreateInfo) -> Result<Alarm, ShimError> {
        let now = now_ms();
        let delay = match (info.when, info.delay_in_minutes, info.period_in_minutes) {
            (Some(when), _, _) => seconds((when - now) / 1000.0),
            (None, Some(delay), _) => minutes(delay),
            (None, None, Some(period)) => minutes(period),
            (None, None, None) => {
                return Err(ShimError::invalid_args(
                    "alarms.create",
                    "one of when, delayInMinutes or periodInMinutes is required",
                ))
            }
        };
        if let Some(period) = info.period_in_minutes {
            if period <= 0.0 {
                return Err(ShimError::invalid_args(
                    "alarms.create",
                    "periodInMinutes must be positive",
                ));
            }
        }
        let alarm = Alarm {
            name: name.to_string(),
            scheduled_time: now + delay.as_secs_f64() * 1000.0,
            period_in_minutes: info.period_in_minutes,
        };

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(fire_loop(
            self.alarms.clone(),
            self.listeners.clone(),
            self.alive.clone(),
            name.to_string(),
            seq,
            delay,
        ));
        let previous = self.alarms.lock().insert(
            name.to_string(),
            AlarmEntry {
                seq,
                alarm: alarm.clone(),
                task,
            },
        );
        if let Some(previous) = previous {
            previous.task.abort();
        }
        debug!(target: "capability-shim", alarm = name, delay_ms = delay.as_millis() as u64, "alarm scheduled");
        Ok(alarm)
    }

    pub fn get(&self, name: &str) -> Option<Alarm> {
        self.alarms.lock().get(name).map(|entry| entry.alarm.clone())
    }

    pub fn get_all(&self) -> Vec<Alarm> {
        let mut all: Vec<Alarm> = self
            .alarms
            .lock()
            .values()
            .map(|entry| entry.alarm.clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn clear(&self, name: &str) -> bool {
        match self.alarms.lock().remove(name) {
            Some(entry) => {
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn clear_all(&self) -> bool {
        let drained: Vec<AlarmEntry> = self.alarms.lock().drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.task.abort();
        }
        !drained.is_empty()
    }
}

impl Drop for AlarmScheduler {
    fn drop(&mut self) {
        self.clear_all();
    }
}

async fn fire_loop(
    alarms: AlarmMap,
    listeners: Weak<ListenerRegistry>,
    alive: CancellationToken,
    name: String,
    seq: u64,
    mut delay: Duration,
) {
    loop {
        tokio::select! {
            _ = alive.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        let fired = {
            let mut map = alarms.lock();
            let Some(entry) = map.get_mut(&name).filter(|entry| entry.seq == seq) else {
                return;
            };
            let fired = entry.alarm.clone();
            match fired.period_in_minutes {
                Some(period) => {
                    entry.alarm.scheduled_time = now_ms() + period * 60_000.0;
                    delay = minutes(period);
                }
                None => {
                    map.remove(&name);
                }
            }
            fired
        };
        let Some(registry) = listeners.upgrade() else {
            return;
        };
        let payload = serde_json::to_value(&fired).unwrap_or_default();
        registry.emit(EventKind::Alarm, payload);
        if fired.period_in_minutes.is_none() {
            return;
        }
    }
}
