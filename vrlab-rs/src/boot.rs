//! Boot state machine.
//!
//! The orchestrator that drives one appliance from power-on to
//! usable: it classifies console output into boot milestones,
//! confirms the management network with an out-of-band TCP probe,
//! plays the configuration script at the right moment, and rides out
//! the reboot cycle that configuration may trigger.
//!
//! A supervising lifecycle host invokes [`BootMachine::step`]
//! repeatedly and polls [`BootMachine::is_ready`]. Each step performs
//! one bounded console read and may block for the bounded
//! sub-operations it triggers; there is no internal parallelism.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tracing::{event, Level};

use crate::config::ApplianceConfig;
use crate::console::{ConsoleChannel, ConsoleError};
use crate::probe::{self, ProbeTuning};
use crate::profile::{ApplianceProfile, BootMilestone};
use crate::script::{self, ConfigScriptError};

/// Boot progress of one appliance. Exactly one instance per
/// appliance, mutated only by [`BootMachine::step`]. `Ready` and
/// `TimedOut` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Booting,
    ConsoleMenuSeen,
    AwaitingManagementNetwork,
    ApplyingConfiguration,
    AwaitingReboot,
    Ready,
    TimedOut,
}

impl BootState {
    pub fn state_name(&self) -> &'static str {
        match self {
            BootState::Booting => "Booting",
            BootState::ConsoleMenuSeen => "ConsoleMenuSeen",
            BootState::AwaitingManagementNetwork => "AwaitingManagementNetwork",
            BootState::ApplyingConfiguration => "ApplyingConfiguration",
            BootState::AwaitingReboot => "AwaitingReboot",
            BootState::Ready => "Ready",
            BootState::TimedOut => "TimedOut",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BootState::Ready | BootState::TimedOut)
    }
}

/// Why a `Ready` appliance is only degraded-ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedReason {
    /// The spin ceiling was crossed without the boot completing;
    /// readiness was declared anyway so the lab does not hang.
    BootTimeout,

    /// The configuration script failed; the appliance is up but
    /// provisioning is incomplete.
    ConfigScriptFailed,

    /// The post-configuration reboot never came back within the
    /// probe budget.
    RebootTimeout,
}

/// Distinguishes "ready" from "ready, but something went wrong along
/// the way". The machine always eventually reports ready (so a
/// supervising caller never blocks indefinitely); this status is the
/// channel through which provisioning failures stay observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyHealth {
    Full,
    Degraded(DegradedReason),
}

#[derive(Debug, Error)]
pub enum BootError {
    /// The console channel is gone. Fatal: propagated immediately,
    /// never retried.
    #[error("console transport closed")]
    TransportClosed,

    /// Some other console I/O failure.
    #[error("console error: {0}")]
    Console(ConsoleError),
}

impl From<ConsoleError> for BootError {
    fn from(e: ConsoleError) -> Self {
        match e {
            ConsoleError::TransportClosed => BootError::TransportClosed,
            other => BootError::Console(other),
        }
    }
}

/// Tunable policy knobs. The defaults reproduce the historical
/// launcher behavior; the spin ceiling in particular is a deliberate
/// "don't hang the lab forever" policy that callers may override.
#[derive(Debug, Clone)]
pub struct BootOptions {
    /// Out-of-band health endpoint of the management service,
    /// reachable through the appliance's virtualized management NIC.
    /// Reachability is the only signal used (no TLS handshake).
    pub mgmt_endpoint: SocketAddr,

    /// Steps (at roughly one second each) after which readiness is
    /// forced in a degraded condition.
    pub spin_ceiling: u32,

    /// Probe tuning while waiting for the first address assignment.
    pub short_poll: ProbeTuning,

    /// Probe tuning while waiting out a self-triggered reboot.
    pub long_poll: ProbeTuning,

    /// Grace period after a reload before probing: the appliance
    /// takes the connection down first.
    pub reboot_grace: Duration,

    /// Extra settle time after the appliance comes back online.
    pub reboot_stabilization: Duration,

    /// Console read window per step.
    pub read_window: Duration,
}

impl Default for BootOptions {
    fn default() -> Self {
        BootOptions {
            mgmt_endpoint: SocketAddr::from((Ipv4Addr::LOCALHOST, 443)),
            spin_ceiling: 300,
            short_poll: probe::SHORT_POLL,
            long_poll: probe::LONG_POLL,
            reboot_grace: Duration::from_secs(10),
            reboot_stabilization: Duration::from_secs(5),
            read_window: Duration::from_secs(1),
        }
    }
}

/// Boot orchestrator for a single appliance instance.
pub struct BootMachine<C: ConsoleChannel> {
    console: C,
    profile: ApplianceProfile,
    config: ApplianceConfig,
    options: BootOptions,

    state: BootState,
    health: ReadyHealth,

    /// Steps since boot start. Monotonic, reset only on process
    /// restart.
    spins: u32,

    /// Set exactly once, when the script player completes without
    /// error. Guards against re-running the dialogue if a milestone
    /// is revisited (e.g. the login prompt after a reboot).
    config_applied: bool,
}

impl<C: ConsoleChannel> BootMachine<C> {
    pub fn new(
        console: C,
        profile: ApplianceProfile,
        config: ApplianceConfig,
        options: BootOptions,
    ) -> Self {
        BootMachine {
            console,
            profile,
            config,
            options,
            state: BootState::Booting,
            health: ReadyHealth::Full,
            spins: 0,
            config_applied: false,
        }
    }

    /// The readiness flag polled by the supervising lifecycle host.
    pub fn is_ready(&self) -> bool {
        self.state == BootState::Ready
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    /// Meaningful once [`is_ready`](Self::is_ready) reports true.
    pub fn health(&self) -> ReadyHealth {
        self.health
    }

    pub fn spins(&self) -> u32 {
        self.spins
    }

    pub fn config_applied(&self) -> bool {
        self.config_applied
    }

    pub fn options(&self) -> &BootOptions {
        &self.options
    }

    /// Hard-timeout hook for the supervising host: gives up on this
    /// appliance for good. The machine never enters `TimedOut` on
    /// its own -- crossing the spin ceiling degrades to `Ready`
    /// instead.
    pub fn mark_timed_out(&mut self) {
        event!(
            Level::ERROR,
            appliance = self.profile.name,
            spins = self.spins,
            "Giving up on appliance boot"
        );
        self.state = BootState::TimedOut;
    }

    fn transition(&mut self, next: BootState) {
        if self.state != next {
            event!(
                Level::DEBUG,
                appliance = self.profile.name,
                from = self.state.state_name(),
                to = next.state_name(),
                "Boot state transition"
            );
            self.state = next;
        }
    }

    /// Perform one polling iteration: a bounded console read,
    /// milestone classification, and whatever action the matched
    /// milestone calls for. May block for the bounded duration of
    /// the sub-operations it triggers (network probe, configuration
    /// script, reboot wait).
    pub async fn step(&mut self) -> Result<(), BootError> {
        if self.state.is_terminal() {
            return Ok(());
        }

        if self.spins > self.options.spin_ceiling {
            event!(
                Level::WARN,
                appliance = self.profile.name,
                spins = self.spins,
                "Bootstrap timeout, proceeding anyway"
            );
            self.health = ReadyHealth::Degraded(DegradedReason::BootTimeout);
            self.transition(BootState::Ready);
            return Ok(());
        }

        let patterns: Vec<&[u8]> = self.profile.milestones.iter().map(|(p, _)| *p).collect();
        let outcome = self
            .console
            .expect(&patterns, self.options.read_window)
            .await?;

        // Echo trimmed console output into our own logs; the serial
        // console is the only diagnostic channel this early in the
        // appliance's life.
        if !outcome.buffer.is_empty() {
            let text = String::from_utf8_lossy(&outcome.buffer);
            let trimmed = text.trim();
            if trimmed.len() > 2 {
                let tail = crate::util::tail_chars(trimmed, 500);
                event!(Level::DEBUG, console_output = %tail, "Console");
            }
        }

        match outcome.matched.map(|idx| self.profile.milestones[idx].1) {
            Some(BootMilestone::ManagerReachable) => {
                // The appliance printed its management address: it
                // already holds an IP and the management service is
                // listening. Declaring ready here avoids redundant
                // reconfiguration of an appliance provisioned on a
                // previous boot.
                event!(
                    Level::INFO,
                    appliance = self.profile.name,
                    "Appliance manager is accessible"
                );
                self.transition(BootState::Ready);
                return Ok(());
            }

            Some(BootMilestone::ConsoleMenu) => {
                event!(
                    Level::INFO,
                    appliance = self.profile.name,
                    "Console menu ready"
                );
                self.transition(BootState::ConsoleMenuSeen);
            }

            Some(BootMilestone::LoginPrompt) => {
                event!(
                    Level::INFO,
                    appliance = self.profile.name,
                    "Login prompt detected"
                );
                return self.handle_login_prompt().await;
            }

            Some(BootMilestone::BootBanner) => {
                event!(
                    Level::DEBUG,
                    appliance = self.profile.name,
                    "Boot in progress"
                );
            }

            Some(BootMilestone::VersionBanner) => {
                event!(
                    Level::INFO,
                    appliance = self.profile.name,
                    "Version banner seen"
                );
            }

            None => {
                // Nothing recognizable in this read window.
            }
        }

        self.spins += 1;
        Ok(())
    }

    /// Login prompt milestone: confirm the management network, apply
    /// the configuration once, and declare readiness.
    async fn handle_login_prompt(&mut self) -> Result<(), BootError> {
        self.transition(BootState::AwaitingManagementNetwork);

        event!(Level::INFO, "Waiting for management interface address");
        if let Err(timeout) = probe::probe(self.options.mgmt_endpoint, self.options.short_poll).await
        {
            // Non-fatal: the appliance may still be configurable
            // over the console even if the health endpoint never
            // comes up (failure-injection labs do exactly this).
            event!(Level::WARN, %timeout, "Proceeding without management network");
        }

        if !self.config_applied && self.config.wants_configuration() {
            self.transition(BootState::ApplyingConfiguration);

            match script::apply(&mut self.console, &self.profile, &self.config).await {
                Ok(outcome) => {
                    self.config_applied = true;
                    if outcome.triggered_reboot {
                        self.await_reboot().await;
                    }
                }

                Err(e) if e.is_fatal() => {
                    return Err(e.into());
                }

                Err(e) => {
                    // Caught and logged; readiness is still declared
                    // (as degraded) so the supervising caller does
                    // not block on a half-provisioned appliance.
                    event!(Level::ERROR, error = %e, "Failed to apply initial config");
                    self.health = ReadyHealth::Degraded(DegradedReason::ConfigScriptFailed);
                }
            }
        }

        self.transition(BootState::Ready);
        Ok(())
    }

    /// Ride out a self-triggered reload: grace period while the
    /// connection drops, long-poll until the management service is
    /// back, then a short stabilization pause.
    async fn await_reboot(&mut self) {
        self.transition(BootState::AwaitingReboot);

        event!(Level::INFO, "Waiting for appliance to reboot");
        tokio::time::sleep(self.options.reboot_grace).await;

        event!(Level::INFO, "Waiting for appliance to come back online");
        match probe::probe(self.options.mgmt_endpoint, self.options.long_poll).await {
            Ok(()) => {
                tokio::time::sleep(self.options.reboot_stabilization).await;
                event!(Level::INFO, "Appliance is back online");
            }
            Err(timeout) => {
                event!(Level::WARN, %timeout, "Appliance did not come back, proceeding anyway");
                self.health = ReadyHealth::Degraded(DegradedReason::RebootTimeout);
            }
        }
    }
}

impl From<ConfigScriptError> for BootError {
    fn from(e: ConfigScriptError) -> Self {
        match e {
            ConfigScriptError::Console(c) => BootError::from(c),
        }
    }
}
