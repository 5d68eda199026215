use crate::arbitration::Sample;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::fmt::Display;
use std::fmt::Write as _;
use std::time::Duration;

pub const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn push(&self, body: String) -> Result<()>;
}

/// Render one sample in the text exposition format, one line per present metric.
pub fn render_exposition(sample: &Sample, job: &str, instance: &str) -> String {
    let labels = format!("{{instance=\"{instance}\", job=\"{job}\"}}");
    let mut body = String::new();
    let mut line = |name: &str, value: &dyn Display| {
        let _ = writeln!(body, "{name}{labels} {value}");
    };

    let metrics = &sample.metrics;
    let readings = [
        ("torus_input_voltage_volts", metrics.input_voltage),
        ("torus_output_voltage_volts", metrics.output_voltage),
        ("torus_output_current_amps", metrics.output_current),
        ("torus_output_power_watts", metrics.output_power),
        ("torus_output_thd_percent", metrics.thd_percent),
    ];
    for (name, value) in readings {
        if let Some(value) = value {
            line(name, &value);
        }
    }
    if let Some(ts) = metrics.device_timestamp {
        line("torus_device_last_seen_timestamp", &ts);
    }
    line("torus_scrape_last_success_timestamp", &sample.collected_at);
    line("torus_data_source", &sample.source.code());

    body.push('\n');
    body
}

pub struct PushgatewaySink {
    client: Client,
    url: String,
}

impl PushgatewaySink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build pushgateway HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl MetricSink for PushgatewaySink {
    async fn push(&self, body: String) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .with_context(|| format!("push to {} failed", self.url))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("pushgateway {} returned HTTP {status}", self.url);
        }
        Ok(())
    }
}
