//! Cloud/local arbitration.
//!
//! Every tick decides three things: whether the portal is worth asking (the
//! backoff gate), whether its answer is recent enough to trust, and if not,
//! whether to pay for a rate-limited scrape of the LAN device or reuse the last
//! one. The outcome carries a [`DataSource`] tier so consumers can weigh it.
//!
//! [`ArbitrationState`] is plain data threaded through [`Arbiter::step`] by
//! value; nothing else holds or mutates it.

use crate::cloud::CloudSource;
use crate::config::Config;
use crate::local::LocalSource;
use crate::metrics::MetricsRecord;
use chrono::DateTime;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Cloud,
    LocalFresh,
    CloudStale,
    LocalCached,
}

impl DataSource {
    /// Numeric tier published as `torus_data_source`; higher is staler.
    pub fn code(self) -> u8 {
        match self {
            DataSource::Cloud => 0,
            DataSource::LocalFresh => 1,
            DataSource::CloudStale => 2,
            DataSource::LocalCached => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DataSource::Cloud => "CLOUD",
            DataSource::LocalFresh => "LOCAL_FRESH",
            DataSource::CloudStale => "CLOUD_STALE",
            DataSource::LocalCached => "LOCAL_CACHED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbitrationPolicy {
    pub backoff_enabled: bool,
    pub backoff_min_outage_secs: i64,
    pub freshness_threshold_secs: i64,
    pub local_scrape_interval_secs: i64,
}

impl ArbitrationPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backoff_enabled: config.enable_cloud_backoff,
            backoff_min_outage_secs: config.backoff_min_outage_secs,
            freshness_threshold_secs: config.freshness_threshold_secs,
            local_scrape_interval_secs: config.local_scrape_interval_secs,
        }
    }
}

impl Default for ArbitrationPolicy {
    fn default() -> Self {
        Self {
            backoff_enabled: true,
            backoff_min_outage_secs: 120,
            freshness_threshold_secs: 60,
            local_scrape_interval_secs: 300,
        }
    }
}

/// All times are UTC epoch seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct ArbitrationState {
    pub last_cloud_success: i64,
    pub last_cloud_check: i64,
    pub last_local_scrape: i64,
    pub cached_local: Option<MetricsRecord>,
    pub was_skipping_cloud: bool,
}

impl ArbitrationState {
    /// Success is backdated to the run start so the first tick can never back off.
    pub fn new(run_start: i64) -> Self {
        Self {
            last_cloud_success: run_start,
            last_cloud_check: 0,
            last_local_scrape: 0,
            cached_local: None,
            was_skipping_cloud: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    Check,
    Skip { outage_secs: i64, retry_in_secs: i64 },
}

/// Once the outage passes the minimum, the portal is asked again only after
/// half the outage has elapsed since the previous ask.
pub fn backoff_decision(
    state: &ArbitrationState,
    policy: &ArbitrationPolicy,
    now: i64,
) -> BackoffDecision {
    if !policy.backoff_enabled {
        return BackoffDecision::Check;
    }
    let outage_secs = now - state.last_cloud_success;
    if outage_secs <= policy.backoff_min_outage_secs {
        return BackoffDecision::Check;
    }
    let backoff_secs = outage_secs.div_euclid(2);
    let since_check = now - state.last_cloud_check;
    if since_check < backoff_secs {
        BackoffDecision::Skip {
            outage_secs,
            retry_in_secs: backoff_secs - since_check,
        }
    } else {
        BackoffDecision::Check
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh { age_secs: i64 },
    /// `age_secs` is `None` when there was no cloud timestamp to judge.
    Stale { age_secs: Option<i64> },
}

pub fn assess_freshness(cloud: Option<&MetricsRecord>, now: i64, threshold_secs: i64) -> Freshness {
    match cloud.and_then(|record| record.device_timestamp) {
        Some(ts) => {
            let age_secs = now - ts;
            if age_secs <= threshold_secs {
                Freshness::Fresh { age_secs }
            } else {
                Freshness::Stale {
                    age_secs: Some(age_secs),
                }
            }
        }
        None => Freshness::Stale { age_secs: None },
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metrics: MetricsRecord,
    pub source: DataSource,
    /// When the iteration ran; published as the last successful scrape time.
    pub collected_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    Publish(Sample),
    NoData,
}

pub struct Arbiter<C, L> {
    cloud: C,
    local: Option<L>,
    policy: ArbitrationPolicy,
}

impl<C: CloudSource, L: LocalSource> Arbiter<C, L> {
    pub fn new(cloud: C, local: Option<L>, policy: ArbitrationPolicy) -> Self {
        Self {
            cloud,
            local,
            policy,
        }
    }

    /// Run one tick against `state` and hand back the updated state.
    ///
    /// A failed portal fetch counts as a reading without a timestamp: the tick
    /// carries on as stale and may still publish local values.
    pub async fn step(
        &mut self,
        mut state: ArbitrationState,
        now: i64,
        iteration: u64,
    ) -> (ArbitrationState, IterationOutcome) {
        let decision = backoff_decision(&state, &self.policy, now);
        match decision {
            BackoffDecision::Skip {
                outage_secs,
                retry_in_secs,
            } => {
                if !state.was_skipping_cloud {
                    warn!(iteration, outage_secs, "cloud outage persists; entering backoff window");
                }
                state.was_skipping_cloud = true;
                info!(
                    iteration,
                    outage_secs, retry_in_secs, "backoff: skipping cloud check"
                );
            }
            BackoffDecision::Check => {
                if state.was_skipping_cloud {
                    info!(iteration, "backoff window expired; checking cloud");
                    state.was_skipping_cloud = false;
                }
            }
        }

        let cloud = match decision {
            BackoffDecision::Skip { .. } => None,
            BackoffDecision::Check => {
                state.last_cloud_check = now;
                match self.cloud.fetch_live().await {
                    Ok(record) => Some(record),
                    Err(err) => {
                        warn!(iteration, "cloud fetch failed: {err:#}");
                        None
                    }
                }
            }
        };

        let freshness = assess_freshness(cloud.as_ref(), now, self.policy.freshness_threshold_secs);
        if iteration == 1 {
            if let Some(ts) = cloud.as_ref().and_then(|record| record.device_timestamp) {
                let device_time = DateTime::from_timestamp(ts, 0)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_else(|| ts.to_string());
                info!(device_time = %device_time, diff_secs = now - ts, "time check");
            }
        }

        let mut metrics = cloud.unwrap_or_default();
        let source = match freshness {
            Freshness::Fresh { .. } => {
                state.last_cloud_success = now;
                state.cached_local = None;
                DataSource::Cloud
            }
            Freshness::Stale { age_secs } => {
                self.fall_back_to_local(&mut state, &mut metrics, now, age_secs)
                    .await
            }
        };

        if !metrics.is_publishable() {
            warn!(iteration, "no data available");
            return (state, IterationOutcome::NoData);
        }

        (
            state,
            IterationOutcome::Publish(Sample {
                metrics,
                source,
                collected_at: now,
            }),
        )
    }

    async fn fall_back_to_local(
        &self,
        state: &mut ArbitrationState,
        metrics: &mut MetricsRecord,
        now: i64,
        stale_age_secs: Option<i64>,
    ) -> DataSource {
        let Some(local) = self.local.as_ref() else {
            return DataSource::CloudStale;
        };

        let mut scraped_fresh = false;
        if now - state.last_local_scrape > self.policy.local_scrape_interval_secs {
            if let Some(age_secs) = stale_age_secs {
                info!(age_secs, "cloud data is stale; triggering local scrape");
            }
            // Stamped before the attempt so an unreachable device is not hammered.
            state.last_local_scrape = now;
            if let Some(record) = local.scrape().await {
                info!("local fallback succeeded; cache updated");
                state.cached_local = Some(record);
                scraped_fresh = true;
            }
        }

        match state.cached_local.as_ref() {
            Some(cached) => {
                metrics.overlay_local(cached);
                if scraped_fresh {
                    DataSource::LocalFresh
                } else {
                    DataSource::LocalCached
                }
            }
            None => DataSource::CloudStale,
        }
    }
}
