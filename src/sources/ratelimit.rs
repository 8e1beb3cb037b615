use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceBudget {
    pub daily_quota: u32,
    pub min_interval: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permit {
    Granted,
    /// Too soon after the previous request
    Wait(Duration),
    /// Daily quota used up
    Denied,
}

/// Per-source request counts for one UTC day.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub day: Option<NaiveDate>,
    pub used: BTreeMap<String, u32>,
}

struct SourceState {
    budget: SourceBudget,
    last_request: Option<DateTime<Utc>>,
    count_today: u32,
}

struct Inner {
    day: NaiveDate,
    sources: HashMap<String, SourceState>,
}

/// Request spacing and daily quota, per source.
///
/// Sources without a registered budget are never throttled.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let day = clock.now().date_naive();
        Self {
            clock,
            inner: RwLock::new(Inner {
                day,
                sources: HashMap::new(),
            }),
        }
    }

    pub fn register(&self, source: &str, budget: SourceBudget) {
        let mut inner = self.inner.write().unwrap();
        inner
            .sources
            .entry(source.to_string())
            .and_modify(|s| s.budget = budget)
            .or_insert(SourceState {
                budget,
                last_request: None,
                count_today: 0,
            });
    }

    pub fn guard(&self, source: &str) -> Permit {
        let inner = self.inner.read().unwrap();
        match inner.sources.get(source) {
            Some(state) => Self::check(state, self.clock.now()),
            None => Permit::Granted,
        }
    }

    fn check(state: &SourceState, now: DateTime<Utc>) -> Permit {
        if state.count_today >= state.budget.daily_quota {
            return Permit::Denied;
        }
        if let Some(last) = state.last_request {
            let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
            if elapsed < state.budget.min_interval {
                return Permit::Wait(state.budget.min_interval - elapsed);
            }
        }
        Permit::Granted
    }

    /// Waits out the minimum interval and records the request.
    /// Returns false when the daily quota is exhausted.
    pub fn acquire(&self, source: &str) -> bool {
        loop {
            let permit = {
                let mut inner = self.inner.write().unwrap();
                let now = self.clock.now();
                match inner.sources.get_mut(source) {
                    Some(state) => {
                        let permit = Self::check(state, now);
                        if permit == Permit::Granted {
                            state.last_request = Some(now);
                            state.count_today += 1;
                        }
                        permit
                    }
                    None => Permit::Granted,
                }
            };

            match permit {
                Permit::Granted => return true,
                Permit::Denied => return false,
                Permit::Wait(remaining) => {
                    log::debug!("source={source} throttled for {remaining:?}");
                    self.clock.sleep(remaining);
                }
            }
        }
    }

    /// Resets the counters when `now` falls on a later UTC day.
    pub fn roll_over(&self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        let mut inner = self.inner.write().unwrap();
        if today <= inner.day {
            return false;
        }
        inner.day = today;
        for state in inner.sources.values_mut() {
            state.count_today = 0;
        }
        true
    }

    pub fn used(&self, source: &str) -> u32 {
        let inner = self.inner.read().unwrap();
        inner.sources.get(source).map(|s| s.count_today).unwrap_or(0)
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        let inner = self.inner.read().unwrap();
        QuotaSnapshot {
            day: Some(inner.day),
            used: inner
                .sources
                .iter()
                .map(|(name, s)| (name.clone(), s.count_today))
                .collect(),
        }
    }

    /// Restores counts saved earlier the same UTC day; older snapshots are ignored.
    pub fn restore(&self, snapshot: &QuotaSnapshot) {
        let mut inner = self.inner.write().unwrap();
        if snapshot.day != Some(inner.day) {
            return;
        }
        for (name, used) in &snapshot.used {
            if let Some(state) = inner.sources.get_mut(name) {
                state.count_today = *used;
            }
        }
    }
}
