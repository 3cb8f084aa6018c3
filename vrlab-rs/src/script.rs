//! Configuration script player.
//!
//! Drives the appliance's initial-configuration dialogue over the
//! console: login with factory credentials, privilege escalation,
//! configuration mode, per-field commands, commit. The appliance CLI
//! has no machine-readable protocol, so pacing is by fixed settle
//! delays after each command, with explicit prompt waits after the
//! mode-changing commands.

use std::time::Duration;

use thiserror::Error;
use tracing::{event, Level};

use crate::config::ApplianceConfig;
use crate::console::{ConsoleChannel, ConsoleError};
use crate::profile::ApplianceProfile;

/// How long to wait for a prompt substring after a mode-changing
/// command. A missed prompt is logged and tolerated; the settle
/// delays keep the dialogue paced regardless.
const PROMPT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigScriptError {
    #[error("console failure while applying configuration: {0}")]
    Console(#[from] ConsoleError),
}

impl ConfigScriptError {
    /// Whether the underlying failure means the console is gone and
    /// the orchestrator must give up entirely (rather than declare
    /// degraded readiness).
    pub fn is_fatal(&self) -> bool {
        match self {
            ConfigScriptError::Console(e) => e.is_fatal(),
        }
    }
}

/// What the applied script committed the appliance to.
#[derive(Debug, Clone, Copy)]
pub struct AppliedOutcome {
    /// The script ended in a device reload; the caller must wait out
    /// a full reboot cycle before declaring the appliance usable.
    pub triggered_reboot: bool,
}

struct Player<'a, C: ConsoleChannel> {
    console: &'a mut C,
}

impl<'a, C: ConsoleChannel> Player<'a, C> {
    /// Send one command line and give the appliance `settle` seconds
    /// to chew on it.
    async fn send(&mut self, line: &str, settle: u64) -> Result<(), ConfigScriptError> {
        let mut bytes = line.as_bytes().to_vec();
        bytes.extend_from_slice(b"\r\n");
        self.console.write(&bytes).await?;
        tokio::time::sleep(Duration::from_secs(settle)).await;
        Ok(())
    }

    /// Wait until `prompt` appears in the console output. A timeout
    /// is logged but not treated as an error: the CLI occasionally
    /// swallows a prompt echo, and the dialogue usually still
    /// succeeds.
    async fn wait_for_prompt(&mut self, prompt: &str) -> Result<(), ConfigScriptError> {
        let outcome = self
            .console
            .expect(&[prompt.as_bytes()], PROMPT_TIMEOUT)
            .await?;
        if outcome.matched.is_none() {
            event!(Level::WARN, prompt, "Prompt did not appear within timeout");
        }
        Ok(())
    }
}

/// Apply the initial configuration for `profile` over `console`.
///
/// Precondition: the login prompt has been observed on the console.
/// The command sequence and settle timings mirror what a human
/// operator would type at the serial console; conditional fields are
/// simply left out when their configuration value is empty.
pub async fn apply<C: ConsoleChannel>(
    console: &mut C,
    profile: &ApplianceProfile,
    config: &ApplianceConfig,
) -> Result<AppliedOutcome, ConfigScriptError> {
    let mut player = Player { console };

    event!(
        Level::INFO,
        appliance = profile.name,
        hostname = %config.hostname,
        "Applying initial configuration"
    );

    // Factory default credentials:
    player.send("admin", 1).await?;
    player.send("admin", 2).await?;

    event!(Level::INFO, "Entering enable mode");
    player.send("enable", 1).await?;
    player.wait_for_prompt("#").await?;

    event!(Level::INFO, "Entering config mode");
    player.send("conf t", 1).await?;
    player.wait_for_prompt("(config)#").await?;

    // Pin console interface names to the hypervisor-assigned NICs.
    // Only some appliance families need this; the remap only takes
    // effect after the reload at the end of the script.
    if !profile.nic_remap.is_empty() {
        event!(Level::INFO, "Applying interface MAC address mapping");
        for row in profile.nic_remap {
            player
                .send(
                    &format!("interface {} mac address {}", row.interface, row.nic),
                    2,
                )
                .await?;
        }
    }

    player
        .send(&format!("hostname {}", config.hostname), 2)
        .await?;

    if !config.admin_password.is_empty() {
        player
            .send(
                &format!("username admin password {}", config.admin_password),
                2,
            )
            .await?;
    }

    if !config.portal_hostname.is_empty() {
        player
            .send(
                &format!("{} {}", profile.portal_command, config.portal_hostname),
                2,
            )
            .await?;
    }

    if let Some((key, account)) = config.registration_credentials() {
        player
            .send(
                &format!(
                    "system registration \"{}\" \"{}\" {} {}",
                    key, account, config.site_tag, config.hostname
                ),
                3,
            )
            .await?;
    }

    player.send("exit", 1).await?;
    player.wait_for_prompt("#").await?;

    event!(Level::INFO, "Writing configuration to memory");
    player.send("write memory", 3).await?;

    if profile.reboot_on_configure {
        event!(Level::INFO, "Reloading appliance to apply MAC mapping");
        player.send("reload", 2).await?;
        player.send("y", 1).await?;
    }

    // Collect whatever trailing output the appliance produced, for
    // the logs only.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let trailing = player.console.read_remaining().await;
    if !trailing.is_empty() {
        let text = String::from_utf8_lossy(&trailing);
        let tail = crate::util::tail_chars(&text, 500);
        event!(Level::DEBUG, console_output = %tail, "Trailing console output");
    }

    event!(
        Level::INFO,
        appliance = profile.name,
        "Initial configuration applied successfully"
    );

    Ok(AppliedOutcome {
        triggered_reboot: profile.reboot_on_configure,
    })
}
