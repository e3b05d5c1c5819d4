//! Round-robin, per-asset LRU catch-up scheduler.
//!
//! Ported from the source challenge's `GroupScheduler`: configs sharing the
//! same `(horizon, steps, every_seconds)` are grouped and cycled through in
//! round-robin order, while tracking `last_exec_ts` per asset so a restart
//! converges back to the intended cadence without skipping assets.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::model::PredictionParams;

/// Per-group in-memory scheduler state.
pub struct GroupScheduler {
    horizon: i64,
    steps: Vec<i64>,
    every_seconds: f64,
    assets: Vec<String>,
    per_asset_delta_secs: f64,

    index: usize,
    next_run: DateTime<Utc>,
    last_exec_ts: HashMap<String, i64>,
}

impl GroupScheduler {
    pub fn new(horizon: i64, steps: Vec<i64>, every_seconds: f64, assets: Vec<String>) -> Self {
        assert!(!assets.is_empty(), "assets cannot be empty");
        let per_asset_delta_secs = every_seconds / assets.len() as f64;
        Self {
            horizon,
            steps,
            every_seconds,
            per_asset_delta_secs,
            assets,
            index: 0,
            // Due immediately: the caller's clock (not wall time) decides readiness.
            next_run: DateTime::<Utc>::MIN_UTC,
            last_exec_ts: HashMap::new(),
        }
    }

    /// Grouping key: configs sharing this key belong to the same scheduler.
    pub fn group_key(horizon: i64, steps: &[i64], every_seconds: f64) -> (i64, Vec<i64>, i64) {
        (horizon, steps.to_vec(), every_seconds as i64)
    }

    /// Seed `last_exec_ts` from storage at startup (recovery): load the
    /// newest `performed_at` per asset that matches this group, then start
    /// from the least-recently-executed asset.
    pub fn set_last_executions(&mut self, executions: &[(PredictionParams, DateTime<Utc>)]) {
        self.last_exec_ts.clear();
        for (params, performed_at) in executions {
            if params.horizon != self.horizon || params.steps != self.steps {
                continue;
            }
            if !self.assets.contains(&params.asset) {
                continue;
            }
            self.last_exec_ts.insert(params.asset.clone(), performed_at.timestamp());
        }
        if !self.last_exec_ts.is_empty() {
            self.seed_lru();
        }
    }

    /// Set `index` to the least-recently-executed asset (never-executed
    /// assets sort first), and set `next_run` to respect its remaining
    /// cooldown.
    fn seed_lru(&mut self) {
        let next_asset = self
            .assets
            .iter()
            .min_by_key(|a| self.last_exec_ts.get(*a).copied().unwrap_or(i64::MIN))
            .cloned()
            .unwrap();
        self.index = self.assets.iter().position(|a| a == &next_asset).unwrap();
        if let Some(&ts) = self.last_exec_ts.get(&next_asset) {
            self.next_run = DateTime::from_timestamp(ts, 0).unwrap()
                + chrono::Duration::milliseconds((self.every_seconds * 1000.0) as i64);
        }
    }

    /// Returns the next params to run, or `None` if not due yet / the
    /// selected asset isn't fresh enough.
    pub fn next(&mut self, now: DateTime<Utc>, latest_info_dt: Option<DateTime<Utc>>) -> Option<PredictionParams> {
        if now < self.next_run {
            return None;
        }

        let asset = self.assets[self.index].clone();

        if !self.is_ready(&asset, latest_info_dt) {
            self.advance_schedule(now);
            return None;
        }

        self.advance_schedule(now);
        Some(PredictionParams::new(asset, self.horizon, self.steps.clone()))
    }

    fn is_ready(&self, asset: &str, latest_info_dt: Option<DateTime<Utc>>) -> bool {
        let last_exec = match self.last_exec_ts.get(asset) {
            Some(ts) => *ts,
            None => return true, // never executed => allow once
        };
        match latest_info_dt {
            None => false, // no info => treat as outdated => skip
            Some(dt) => dt.timestamp() > last_exec,
        }
    }

    fn advance_schedule(&mut self, now: DateTime<Utc>) {
        self.index = (self.index + 1) % self.assets.len();
        let delta_ms = (self.per_asset_delta_secs * 1000.0) as i64;
        let mut candidate = now + chrono::Duration::milliseconds(delta_ms);

        if let Some(&last_exec_ts) = self.last_exec_ts.get(&self.assets[self.index]) {
            let last_exec_dt = DateTime::from_timestamp(last_exec_ts, 0).unwrap();
            let scheduled_deadline =
                last_exec_dt + chrono::Duration::milliseconds((self.every_seconds * 1000.0) as i64);

            if scheduled_deadline <= now {
                candidate = now; // catch-up: run immediately
            } else {
                let floor = last_exec_dt + chrono::Duration::milliseconds(delta_ms);
                candidate = candidate.max(floor);
            }
        }

        self.next_run = candidate;
        debug!(next_run = %self.next_run, asset = %self.peek_asset(), "scheduler advanced");
    }

    pub fn mark_executed(&mut self, asset: &str, when: DateTime<Utc>) {
        if !self.assets.contains(&asset.to_string()) {
            return;
        }
        self.last_exec_ts.insert(asset.to_string(), when.timestamp());
    }

    pub fn peek_asset(&self) -> &str {
        &self.assets[self.index]
    }

    /// This group's identity, for matching back to the `ScheduledPredictionConfig`s it was built from.
    pub fn key(&self) -> (i64, Vec<i64>, i64) {
        Self::group_key(self.horizon, &self.steps, self.every_seconds)
    }

    pub fn next_run(&self) -> DateTime<Utc> {
        self.next_run
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// Build one `GroupScheduler` per distinct `(horizon, steps, every_seconds)`
/// among active configs, preserving first-seen asset order within a group.
pub fn create_group_schedulers(
    configs: &[crate::model::ScheduledPredictionConfig],
) -> Vec<GroupScheduler> {
    let mut order: Vec<(i64, Vec<i64>, i64)> = Vec::new();
    let mut groups: HashMap<(i64, Vec<i64>, i64), Vec<String>> = HashMap::new();
    let mut seen: HashMap<(i64, Vec<i64>, i64), HashSet<String>> = HashMap::new();

    for cfg in configs.iter().filter(|c| c.active) {
        let p = &cfg.prediction_params;
        let key = GroupScheduler::group_key(p.horizon, &p.steps, cfg.every_seconds as f64);
        let assets = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            Vec::new()
        });
        if seen.entry(key).or_default().insert(p.asset.clone()) {
            assets.push(p.asset.clone());
        }
    }

    order
        .into_iter()
        .map(|(horizon, steps, every_seconds)| {
            let assets = groups.remove(&(horizon, steps.clone(), every_seconds)).unwrap();
            GroupScheduler::new(horizon, steps, every_seconds as f64, assets)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(mins_from_epoch: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(mins_from_epoch * 60, 0).unwrap()
    }

    fn group() -> GroupScheduler {
        GroupScheduler::new(
            86_400,
            vec![300],
            3600.0,
            vec!["BTC".to_string(), "ETH".to_string(), "XAUT".to_string()],
        )
    }

    /// Scenario 1: multi-asset round-robin basic.
    #[test]
    fn round_robin_basic() {
        let mut sched = group();
        let t0 = at(0);

        let p = sched.next(t0, None).unwrap();
        assert_eq!(p.asset, "BTC");

        assert!(sched.next(t0, None).is_none());

        sched.mark_executed("BTC", t0);
        assert_eq!(sched.index(), 1);
        assert_eq!(sched.next_run(), t0 + chrono::Duration::seconds(1200));
    }

    /// Scenario 2: LRU recovery.
    #[test]
    fn lru_recovery() {
        let t0 = at(0);
        let mut sched = group();
        sched.set_last_executions(&[
            (PredictionParams::new("BTC", 86_400, vec![300]), t0 - chrono::Duration::minutes(20)),
            (PredictionParams::new("ETH", 86_400, vec![300]), t0 - chrono::Duration::minutes(40)),
            (PredictionParams::new("XAUT", 86_400, vec![300]), t0 - chrono::Duration::minutes(60)),
        ]);

        let p = sched.next(t0, Some(t0)).unwrap();
        assert_eq!(p.asset, "XAUT");
        assert_eq!(sched.index(), 0);
        assert_eq!(sched.next_run(), t0 + chrono::Duration::seconds(1200));
    }

    /// Scenario 3: catch-up after outage.
    #[test]
    fn catch_up_after_outage() {
        let t0 = at(0);
        let mut sched = GroupScheduler::new(
            86_400,
            vec![300],
            3600.0,
            vec!["BTC".to_string(), "ETH".to_string(), "XAUT".to_string()],
        );
        sched.set_last_executions(&[
            (PredictionParams::new("BTC", 86_400, vec![300]), t0 - chrono::Duration::minutes(120)),
            (PredictionParams::new("ETH", 86_400, vec![300]), t0 - chrono::Duration::minutes(140)),
            (PredictionParams::new("XAUT", 86_400, vec![300]), t0 - chrono::Duration::minutes(160)),
        ]);

        let first = sched.next(t0, Some(t0)).unwrap();
        assert_eq!(first.asset, "XAUT");
        sched.mark_executed(&first.asset, t0);

        let second = sched.next(t0, Some(t0)).unwrap();
        assert_eq!(second.asset, "BTC");
        sched.mark_executed(&second.asset, t0);

        let third = sched.next(t0, Some(t0)).unwrap();
        assert_eq!(third.asset, "ETH");
        sched.mark_executed(&third.asset, t0);

        assert_eq!(sched.next_run(), t0 + chrono::Duration::seconds(1200));
    }

    #[test]
    fn mark_executed_ignores_unknown_asset() {
        let mut sched = group();
        sched.mark_executed("DOGE", Utc::now());
        assert!(sched.last_exec_ts.get("DOGE").is_none());
    }

    #[test]
    fn never_executed_asset_runs_even_with_stale_info() {
        let mut sched = group();
        let t0 = at(0);
        let stale = t0 - chrono::Duration::days(10);
        let p = sched.next(t0, Some(stale));
        assert_eq!(p.unwrap().asset, "BTC");
    }
}
