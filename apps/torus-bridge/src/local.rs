use crate::http::MAX_REDIRECT_HOPS;
use crate::metrics::{Field, MetricsRecord};
use crate::units::{normalize_power, parse_display_number, PowerUnit};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::Client;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{error, info, warn};

/// LAN fallback for when the portal lags. `None` means "nothing usable", never an error.
#[async_trait]
pub trait LocalSource: Send + Sync {
    async fn scrape(&self) -> Option<MetricsRecord>;
}

pub struct LanDeviceScraper {
    client: Client,
    url: String,
}

impl LanDeviceScraper {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        // Conditioners ship with self-signed certificates.
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .redirect(Policy::limited(MAX_REDIRECT_HOPS))
            .build()
            .context("failed to build local device HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn fetch_status_page(&self) -> Result<String> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.url))?;
        let status = response.status();
        if status.is_server_error() {
            anyhow::bail!("{} returned HTTP {status}", self.url);
        }
        response
            .text()
            .await
            .with_context(|| format!("failed to read body from {}", self.url))
    }
}

#[async_trait]
impl LocalSource for LanDeviceScraper {
    async fn scrape(&self) -> Option<MetricsRecord> {
        info!(url = %self.url, "fetching fallback data from local device");
        let body = match self.fetch_status_page().await {
            Ok(body) => body,
            Err(err) => {
                error!("local scrape failed: {err:#}");
                return None;
            }
        };

        let record = parse_status_table(&body);
        if record.input_voltage.is_none() {
            warn!("local status page parsed but no matching metrics were found");
            return None;
        }
        Some(record)
    }
}

/// Map a left-hand table label such as "Voltage In" to the metric it names.
pub fn classify_label(label: &str) -> Option<Field> {
    let compact: String = label
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    if compact.contains("voltagein") {
        Some(Field::InputVoltage)
    } else if compact.contains("voltageout") {
        Some(Field::OutputVoltage)
    } else if compact.contains("currentout") {
        Some(Field::OutputCurrent)
    } else if compact.contains("powerout") {
        Some(Field::OutputPower)
    } else {
        None
    }
}

/// Read every two-cell `label | value` row of the device's status table.
pub fn parse_status_table(html: &str) -> MetricsRecord {
    let document = Html::parse_document(html);
    let mut record = MetricsRecord::default();
    let (Ok(rows), Ok(cells)) = (Selector::parse("tr"), Selector::parse("td")) else {
        return record;
    };

    for row in document.select(&rows) {
        let mut columns = row.select(&cells);
        let (Some(label_cell), Some(value_cell)) = (columns.next(), columns.next()) else {
            continue;
        };
        let label = label_cell.text().collect::<String>();
        let raw_value = value_cell.text().collect::<String>();
        let raw_value = raw_value.trim();

        let Some(value) = parse_display_number(raw_value) else {
            continue;
        };
        match classify_label(label.trim()) {
            Some(Field::OutputPower) => record.set(
                Field::OutputPower,
                Some(normalize_power(value, PowerUnit::sniff(raw_value))),
            ),
            Some(field) => record.set(field, Some(value)),
            None => {}
        }
    }

    record
}
