//! Live-data page extraction for the cloud portal.
//!
//! Each metric is resolved by walking an ordered list of strategies: the
//! ASP.NET label that shows the value as text, then the JSON config of the
//! radial gauge widget that plots it. The first strategy that yields a number
//! wins; a metric no strategy can read stays absent.

use crate::http::{PortalClient, Transport};
use crate::metrics::{Field, MetricsRecord};
use crate::units::{normalize_power, parse_display_number, PowerUnit};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use regex::Regex;
use scraper::{Html, Selector};
use tracing::warn;
use url::Url;

const LAST_SEEN_LABEL: &str = "lblSystemStatusTS";

/// Naive layouts the portal has been seen to render "last seen" in.
const DEVICE_TIME_FORMATS: &[&str] = &[
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %I:%M:%S %p",
    "%b %d, %Y %I:%M:%S %p",
    "%B %d, %Y %I:%M:%S %p",
    "%b %d, %Y %H:%M:%S",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// `<span id="...{suffix}">121.4 V</span>`
    DisplayElement { id_suffix: &'static str },
    /// `"value": 1.23` somewhere after the gauge widget's id. Gauges plot power in kW.
    GaugeWidget { widget_id: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value: f64,
    pub unit: PowerUnit,
}

pub struct FieldExtraction {
    pub field: Field,
    pub strategies: &'static [Strategy],
}

pub const CLOUD_FIELDS: &[FieldExtraction] = &[
    FieldExtraction {
        field: Field::InputVoltage,
        strategies: &[
            Strategy::DisplayElement { id_suffix: "lblInputVoltageValue" },
            Strategy::GaugeWidget { widget_id: "RadRadialGaugeInputVoltage" },
        ],
    },
    FieldExtraction {
        field: Field::OutputVoltage,
        strategies: &[
            Strategy::DisplayElement { id_suffix: "lblOutputVoltageValue" },
            Strategy::GaugeWidget { widget_id: "RadRadialGaugeOutputVoltage" },
        ],
    },
    FieldExtraction {
        field: Field::OutputCurrent,
        strategies: &[
            Strategy::DisplayElement { id_suffix: "lblOutputCurrentValue" },
            Strategy::GaugeWidget { widget_id: "RadRadialGaugeOutputCurrent" },
        ],
    },
    FieldExtraction {
        field: Field::ThdPercent,
        strategies: &[
            Strategy::DisplayElement { id_suffix: "lblOutputTHD" },
            Strategy::GaugeWidget { widget_id: "RadRadialGaugeTHD" },
        ],
    },
    FieldExtraction {
        field: Field::OutputPower,
        strategies: &[
            Strategy::DisplayElement { id_suffix: "lblOutputPowerValue" },
            Strategy::GaugeWidget { widget_id: "RadRadialGaugeOutputPower" },
        ],
    },
];

impl Strategy {
    pub fn read(&self, document: &Html, raw_html: &str) -> Option<Reading> {
        match self {
            Strategy::DisplayElement { id_suffix } => {
                let text = display_text(document, id_suffix)?;
                let value = parse_display_number(&text)?;
                Some(Reading {
                    value,
                    unit: PowerUnit::sniff(&text),
                })
            }
            Strategy::GaugeWidget { widget_id } => {
                let pattern = format!(r#"{}[\s\S]*?value"\s*:\s*([\d.]+)"#, regex::escape(widget_id));
                let re = Regex::new(&pattern).ok()?;
                let captured = re.captures(raw_html)?.get(1)?.as_str();
                let value = captured.parse::<f64>().ok().filter(|v| v.is_finite())?;
                Some(Reading {
                    value,
                    unit: PowerUnit::Kilowatts,
                })
            }
        }
    }
}

impl FieldExtraction {
    pub fn resolve(&self, document: &Html, raw_html: &str) -> Option<f64> {
        let reading = self
            .strategies
            .iter()
            .find_map(|strategy| strategy.read(document, raw_html))?;
        Some(match self.field {
            Field::OutputPower => normalize_power(reading.value, reading.unit),
            _ => reading.value,
        })
    }
}

/// Trimmed text of the first `span` whose id ends in `id_suffix`, if non-empty.
fn display_text(document: &Html, id_suffix: &str) -> Option<String> {
    let selector = Selector::parse(&format!(r#"span[id$="{id_suffix}"]"#)).ok()?;
    let element = document.select(&selector).next()?;
    let text = element.text().collect::<String>();
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CloudExtractor {
    pub timezone_offset_hours: f64,
}

impl CloudExtractor {
    pub fn new(timezone_offset_hours: f64) -> Self {
        Self {
            timezone_offset_hours,
        }
    }

    pub fn extract(&self, html: &str) -> MetricsRecord {
        let document = Html::parse_document(html);
        let mut record = MetricsRecord::default();

        for extraction in CLOUD_FIELDS {
            record.set(extraction.field, extraction.resolve(&document, html));
        }

        record.device_timestamp = display_text(&document, LAST_SEEN_LABEL)
            .and_then(|text| parse_device_time(&text, self.timezone_offset_hours));
        record
    }
}

/// Read the device's "last seen" text and shift it from device-local time to UTC.
pub fn parse_device_time(text: &str, offset_hours: f64) -> Option<i64> {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return None;
    }

    let as_if_utc = DEVICE_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(&cleaned, format).ok())
        .map(|naive| naive.and_utc().timestamp())
        .or_else(|| {
            DateTime::parse_from_rfc3339(&cleaned)
                .or_else(|_| DateTime::parse_from_rfc2822(&cleaned))
                .ok()
                .map(|dt| dt.timestamp())
        })?;

    as_if_utc.checked_sub(timezone_offset_secs(offset_hours))
}

pub fn timezone_offset_secs(offset_hours: f64) -> i64 {
    (offset_hours * 3600.0).round() as i64
}

/// Where cloud readings come from. The portal implementation needs a logged-in session.
#[async_trait]
pub trait CloudSource: Send {
    async fn fetch_live(&mut self) -> Result<MetricsRecord>;
}

pub struct PortalCloudSource<T> {
    client: PortalClient<T>,
    live_url: Url,
    extractor: CloudExtractor,
}

impl<T: Transport> PortalCloudSource<T> {
    pub fn new(client: PortalClient<T>, live_url: &str, extractor: CloudExtractor) -> Result<Self> {
        let live_url = Url::parse(live_url).context("invalid live data URL")?;
        Ok(Self {
            client,
            live_url,
            extractor,
        })
    }
}

#[async_trait]
impl<T: Transport> CloudSource for PortalCloudSource<T> {
    async fn fetch_live(&mut self) -> Result<MetricsRecord> {
        let fetched = self
            .client
            .fetch_following_redirects(&self.live_url)
            .await
            .context("live data fetch failed")?;
        if fetched.final_url.path().contains("Login") {
            warn!(url = %fetched.final_url, "live data request was redirected to the login page");
        }
        Ok(self.extractor.extract(&fetched.reply.body))
    }
}
