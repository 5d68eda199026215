use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://toruspowerconnect.com";
pub const LOGIN_FIELD_USER: &str = "ctl00$MainContent$UserName";
pub const LOGIN_FIELD_PASS: &str = "ctl00$MainContent$Password";
pub const LIVE_DATA_PATH: &str = "/MemberPages/LiveData.aspx";
const MAX_TIMEZONE_OFFSET_HOURS: f64 = 24.0;

#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub username: String,
    pub password: String,

    pub local_url: Option<String>,
    pub local_scrape_interval_secs: i64,

    /// Hours east of UTC the device clock runs at, e.g. `-5.0` for EST.
    pub device_timezone_offset_hours: f64,

    pub enable_cloud_backoff: bool,
    pub freshness_threshold_secs: i64,
    pub backoff_min_outage_secs: i64,

    pub pushgateway_url: String,
    pub job_name: String,
    pub instance_name: String,

    pub job_duration_secs: u64,
    pub poll_interval_secs: u64,
    pub http_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = EnvReader { lookup };

        let base_url = trim_trailing_slash(vars.string("BASE_URL", Some(DEFAULT_BASE_URL))?);
        Url::parse(&base_url).context("invalid BASE_URL")?;

        let username = vars.string("TORUS_USERNAME", None)?;
        let password = vars.string("TORUS_PASSWORD", None)?;

        let local_url = match vars.optional("TORUS_LOCAL_URL") {
            Some(raw) => {
                let url = trim_trailing_slash(raw);
                Url::parse(&url).context("invalid TORUS_LOCAL_URL")?;
                Some(url)
            }
            None => None,
        };
        let local_scrape_interval_secs = vars.secs("LOCAL_SCRAPE_INTERVAL", 300)?;

        let device_timezone_offset_hours = vars.f64("DEVICE_TIMEZONE_OFFSET", Some(0.0))?;
        if !(-MAX_TIMEZONE_OFFSET_HOURS..=MAX_TIMEZONE_OFFSET_HOURS)
            .contains(&device_timezone_offset_hours)
        {
            return Err(anyhow!(
                "invalid DEVICE_TIMEZONE_OFFSET: {device_timezone_offset_hours} is outside \
                 -{MAX_TIMEZONE_OFFSET_HOURS}..={MAX_TIMEZONE_OFFSET_HOURS} hours"
            ));
        }
        let enable_cloud_backoff = vars.bool("ENABLE_CLOUD_BACKOFF", true);
        let freshness_threshold_secs = vars.secs("FRESHNESS_THRESHOLD_SECONDS", 60)?;
        let backoff_min_outage_secs = vars.secs("BACKOFF_MIN_OUTAGE_SECONDS", 120)?;

        let pushgateway_url = trim_trailing_slash(vars.string("PUSHGATEWAY_URL", None)?);
        Url::parse(&pushgateway_url).context("invalid PUSHGATEWAY_URL")?;
        let job_name = vars.string("JOB_NAME", Some("torus_power_monitor"))?;
        let instance_name = vars.string("INSTANCE_NAME", Some("torus_primary"))?;

        let job_duration_secs = vars.u64("JOB_DURATION", Some(280))?;
        let poll_interval_secs = vars.u64("POLL_INTERVAL", Some(15))?;
        if poll_interval_secs == 0 {
            return Err(anyhow!("POLL_INTERVAL must be at least 1 second"));
        }
        let http_timeout_secs = vars.u64("HTTP_TIMEOUT_SECONDS", Some(5))?.max(1);

        Ok(Self {
            base_url,
            username,
            password,
            local_url,
            local_scrape_interval_secs,
            device_timezone_offset_hours,
            enable_cloud_backoff,
            freshness_threshold_secs,
            backoff_min_outage_secs,
            pushgateway_url,
            job_name,
            instance_name,
            job_duration_secs,
            poll_interval_secs,
            http_timeout_secs,
        })
    }

    pub fn live_data_url(&self) -> String {
        format!("{}{LIVE_DATA_PATH}", self.base_url)
    }

    pub fn fallback_login_url(&self) -> String {
        format!("{}/Default", self.base_url)
    }

    pub fn push_url(&self) -> String {
        format!("{}/metrics/job/{}", self.pushgateway_url, self.job_name)
    }

    pub fn job_duration(&self) -> Duration {
        Duration::from_secs(self.job_duration_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: Option<&str>) -> Result<String> {
        match self.optional(key) {
            Some(value) => Ok(value),
            None => default
                .map(str::to_string)
                .ok_or_else(|| anyhow!("missing env var {key}")),
        }
    }

    fn u64(&self, key: &str, default: Option<u64>) -> Result<u64> {
        match self.optional(key) {
            Some(value) => value
                .parse::<u64>()
                .with_context(|| format!("invalid {key}")),
            None => default.ok_or_else(|| anyhow!("missing env var {key}")),
        }
    }

    /// A second count that must also fit the signed epoch arithmetic.
    fn secs(&self, key: &str, default: u64) -> Result<i64> {
        let value = self.u64(key, Some(default))?;
        i64::try_from(value).with_context(|| format!("invalid {key}: {value} is too large"))
    }

    fn f64(&self, key: &str, default: Option<f64>) -> Result<f64> {
        match self.optional(key) {
            Some(value) => {
                let parsed = value
                    .parse::<f64>()
                    .with_context(|| format!("invalid {key}"))?;
                if !parsed.is_finite() {
                    return Err(anyhow!("invalid {key}: must be finite"));
                }
                Ok(parsed)
            }
            None => default.ok_or_else(|| anyhow!("missing env var {key}")),
        }
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        self.optional(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(default)
    }
}

fn trim_trailing_slash(value: String) -> String {
    value.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("TORUS_USERNAME", "operator"),
        ("TORUS_PASSWORD", "hunter2"),
        ("PUSHGATEWAY_URL", "http://pushgateway:9091/"),
    ];

    #[test]
    fn defaults_match_the_documented_run_shape() {
        let config = config_from(&REQUIRED).expect("config");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.local_url, None);
        assert_eq!(config.local_scrape_interval_secs, 300);
        assert_eq!(config.device_timezone_offset_hours, 0.0);
        assert!(config.enable_cloud_backoff);
        assert_eq!(config.freshness_threshold_secs, 60);
        assert_eq!(config.backoff_min_outage_secs, 120);
        assert_eq!(config.job_name, "torus_power_monitor");
        assert_eq!(config.instance_name, "torus_primary");
        assert_eq!(config.job_duration_secs, 280);
        assert_eq!(config.poll_interval_secs, 15);
        assert_eq!(config.http_timeout_secs, 5);
        assert_eq!(
            config.push_url(),
            "http://pushgateway:9091/metrics/job/torus_power_monitor"
        );
    }

    #[test]
    fn trailing_slashes_are_trimmed_from_urls() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("BASE_URL", "https://portal.example.com/"));
        pairs.push(("TORUS_LOCAL_URL", "https://192.168.1.50/status/"));
        let config = config_from(&pairs).expect("config");
        assert_eq!(
            config.live_data_url(),
            "https://portal.example.com/MemberPages/LiveData.aspx"
        );
        assert_eq!(config.fallback_login_url(), "https://portal.example.com/Default");
        assert_eq!(
            config.local_url.as_deref(),
            Some("https://192.168.1.50/status")
        );
    }

    #[test]
    fn fractional_negative_timezone_offsets_are_accepted() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("DEVICE_TIMEZONE_OFFSET", "-3.5"));
        pairs.push(("ENABLE_CLOUD_BACKOFF", "FALSE"));
        let config = config_from(&pairs).expect("config");
        assert_eq!(config.device_timezone_offset_hours, -3.5);
        assert!(!config.enable_cloud_backoff);
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let err = config_from(&[("PUSHGATEWAY_URL", "http://pg:9091")]).unwrap_err();
        assert!(err.to_string().contains("TORUS_USERNAME"));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("POLL_INTERVAL", "fifteen"));
        let err = config_from(&pairs).unwrap_err();
        assert!(err.to_string().contains("POLL_INTERVAL"));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("POLL_INTERVAL", "0"));
        assert!(config_from(&pairs).is_err());
    }

    #[test]
    fn timezone_offsets_beyond_a_day_are_rejected() {
        for raw in ["-1e300", "24.5", "-25"] {
            let mut pairs = REQUIRED.to_vec();
            pairs.push(("DEVICE_TIMEZONE_OFFSET", raw));
            let err = config_from(&pairs).unwrap_err();
            assert!(
                err.to_string().contains("DEVICE_TIMEZONE_OFFSET"),
                "{raw}: {err:#}"
            );
        }

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("DEVICE_TIMEZONE_OFFSET", "-24"));
        assert_eq!(config_from(&pairs).unwrap().device_timezone_offset_hours, -24.0);
    }

    #[test]
    fn second_counts_beyond_i64_are_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("LOCAL_SCRAPE_INTERVAL", "18446744073709551615"));
        let err = config_from(&pairs).unwrap_err();
        assert!(format!("{err:#}").contains("LOCAL_SCRAPE_INTERVAL"));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("BACKOFF_MIN_OUTAGE_SECONDS", "9223372036854775808"));
        assert!(config_from(&pairs).is_err());
    }
}
