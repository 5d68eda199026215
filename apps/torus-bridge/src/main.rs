use anyhow::{Context, Result};
use std::process::ExitCode;
use torus_bridge::arbitration::{Arbiter, ArbitrationPolicy};
use torus_bridge::auth::{self, Credentials};
use torus_bridge::cloud::{CloudExtractor, PortalCloudSource};
use torus_bridge::config::Config;
use torus_bridge::emitter::PushgatewaySink;
use torus_bridge::http::{PortalClient, ReqwestTransport};
use torus_bridge::local::LanDeviceScraper;
use torus_bridge::scheduler::{self, EpochClock, PushLabels, RunShape};
use url::Url;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,torus_bridge=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = init_tracing() {
        eprintln!("failed to initialise logging: {err:#}");
        return ExitCode::from(1);
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("fatal: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    let base_url = Url::parse(&config.base_url).context("invalid BASE_URL")?;
    let fallback_url =
        Url::parse(&config.fallback_login_url()).context("invalid fallback login URL")?;

    let transport = ReqwestTransport::new(config.http_timeout())?;
    let mut client = PortalClient::new(transport, &base_url);
    let credentials = Credentials {
        username: config.username.clone(),
        password: config.password.clone(),
    };
    let outcome = auth::login(&mut client, &base_url, &fallback_url, &credentials)
        .await
        .context("portal authentication failed")?;
    tracing::info!(
        status = outcome.status,
        cookies = client.session().len(),
        "portal login complete"
    );

    let cloud = PortalCloudSource::new(
        client,
        &config.live_data_url(),
        CloudExtractor::new(config.device_timezone_offset_hours),
    )?;
    let local = config
        .local_url
        .as_deref()
        .map(|url| LanDeviceScraper::new(url, config.http_timeout()))
        .transpose()?;
    let sink = PushgatewaySink::new(config.push_url(), config.http_timeout())?;

    tracing::info!(
        duration_secs = config.job_duration_secs,
        interval_secs = config.poll_interval_secs,
        backoff = config.enable_cloud_backoff,
        push_url = %sink.url(),
        "starting poll loop"
    );
    match config.local_url.as_deref() {
        Some(url) => tracing::info!(
            url,
            rate_limit_secs = config.local_scrape_interval_secs,
            "local fallback enabled"
        ),
        None => tracing::info!("local fallback disabled"),
    }
    if config.device_timezone_offset_hours != 0.0 {
        tracing::info!(
            offset_hours = config.device_timezone_offset_hours,
            "correcting device timestamps"
        );
    }

    let mut arbiter = Arbiter::new(cloud, local, ArbitrationPolicy::from_config(&config));
    scheduler::run(
        &mut arbiter,
        &sink,
        EpochClock::start(),
        RunShape {
            duration: config.job_duration(),
            interval: config.poll_interval(),
        },
        PushLabels {
            job: &config.job_name,
            instance: &config.instance_name,
        },
    )
    .await;
    Ok(())
}
