use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

use vrlab_rs::boot::{BootMachine, BootOptions, ReadyHealth};
use vrlab_rs::config::ApplianceConfig;
use vrlab_rs::profile::{self, ApplianceProfile};

mod console;

/// How many 1-second attempts to make while waiting for the
/// hypervisor to expose the console socket.
const CONSOLE_CONNECT_ATTEMPTS: u32 = 30;

#[derive(Debug, Clone, ValueEnum)]
#[clap(rename_all = "kebab-case")]
enum ApplianceKind {
    /// HPE EdgeConnect virtual appliance (EC-V).
    Edgeconnect,
    /// Aruba Virtual Gateway.
    VirtualGateway,
}

impl ApplianceKind {
    fn profile(&self) -> ApplianceProfile {
        match self {
            ApplianceKind::Edgeconnect => profile::edgeconnect(),
            ApplianceKind::VirtualGateway => profile::virtual_gateway(),
        }
    }
}

#[derive(Parser, Debug, Clone)]
struct LauncherArgs {
    /// Appliance family to provision.
    #[arg(long, value_enum)]
    appliance: ApplianceKind,

    /// VM hostname (defaults to the appliance family's default).
    #[arg(long)]
    hostname: Option<String>,

    /// TCP socket on which the hypervisor exposes the serial
    /// console.
    #[arg(long, default_value = "127.0.0.1:5000")]
    console_addr: SocketAddr,

    /// Out-of-band health endpoint of the appliance's management
    /// service.
    #[arg(long, default_value = "127.0.0.1:443")]
    mgmt_endpoint: SocketAddr,

    /// Polling steps before readiness is forced in a degraded
    /// condition.
    #[arg(long, default_value_t = 300)]
    spin_ceiling: u32,

    /// Hard wall-clock deadline for the whole boot, in seconds.
    /// Unlike the spin ceiling this gives up for good.
    #[arg(long, default_value_t = 1800)]
    hard_timeout: u64,

    /// Enable trace logging.
    #[arg(long)]
    trace: bool,
}

/// Optional startup delay, so several appliances launched at once
/// don't hammer the host at the same instant. Seconds, from the
/// `BOOT_DELAY` environment variable.
async fn boot_delay() {
    if let Ok(value) = std::env::var("BOOT_DELAY") {
        match value.parse::<u64>() {
            Ok(secs) if secs > 0 => {
                event!(Level::INFO, secs, "Delaying boot");
                tokio::time::sleep(Duration::from_secs(secs)).await;
            }
            Ok(_) => {}
            Err(e) => {
                event!(Level::WARN, value, error = %e, "Ignoring unparseable BOOT_DELAY");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = LauncherArgs::parse();

    let default_level = if args.trace { "trace" } else { "debug" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let profile = args.appliance.profile();
    let hostname = args
        .hostname
        .clone()
        .unwrap_or_else(|| profile.default_hostname.to_string());

    event!(
        Level::INFO,
        appliance = profile.name,
        hostname = %hostname,
        "Starting appliance launcher"
    );

    boot_delay().await;

    let config = ApplianceConfig::from_env(profile.env_prefix, &hostname);

    let console = console::TcpConsole::connect(args.console_addr, CONSOLE_CONNECT_ATTEMPTS)
        .await
        .context("Connecting to the appliance serial console")?;

    let options = BootOptions {
        mgmt_endpoint: args.mgmt_endpoint,
        spin_ceiling: args.spin_ceiling,
        ..BootOptions::default()
    };
    let mut machine = BootMachine::new(console, profile, config, options);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.hard_timeout);

    // Supervision loop: one bounded step at a time, until the
    // machine reports ready, the hard deadline passes, or the
    // operator interrupts us. Cancellation is coarse: an interrupt
    // mid-step may leave a configuration dialogue half-applied,
    // which is accepted.
    while !machine.is_ready() {
        if tokio::time::Instant::now() >= deadline {
            machine.mark_timed_out();
            bail!(
                "Appliance did not become ready within {} seconds",
                args.hard_timeout
            );
        }

        #[rustfmt::skip]
        tokio::select! {
            ctrlc_res = tokio::signal::ctrl_c() => {
                ctrlc_res.context("Unable to listen for shutdown signal")?;
                bail!("Interrupted while provisioning appliance");
            }

            step_res = machine.step() => {
                step_res.context("Appliance boot orchestration failed")?;
            }

            _ = tokio::time::sleep_until(deadline) => {
                // Deadline handled at the top of the loop; this
                // branch only breaks a step that overruns it.
            }
        }
    }

    match machine.health() {
        ReadyHealth::Full => {
            event!(
                Level::INFO,
                spins = machine.spins(),
                "Appliance is ready"
            );
        }
        ReadyHealth::Degraded(reason) => {
            // Readiness is still declared so the lab proceeds, but
            // the operator must be able to see that provisioning did
            // not fully complete.
            event!(
                Level::WARN,
                ?reason,
                spins = machine.spins(),
                "Appliance is ready, but provisioning is incomplete"
            );
        }
    }

    Ok(())
}
