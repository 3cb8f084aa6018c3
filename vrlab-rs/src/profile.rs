//! Appliance profiles.
//!
//! The EdgeConnect and Virtual Gateway launchers were historically
//! two near-identical forks of one template. They are combined here
//! into a single parameterized design: everything the two appliance
//! families do differently is captured in an [`ApplianceProfile`]
//! value, and the boot state machine and script player are written
//! against that value rather than against a concrete appliance.

/// Semantic label for a recognized boot-progress marker in console
/// output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMilestone {
    /// The appliance printed its management address: DHCP completed
    /// and the management service is already up. Fast path -- the
    /// appliance was provisioned by a previous boot.
    ManagerReachable,

    /// The interactive console menu is ready.
    ConsoleMenu,

    /// The login prompt appeared.
    LoginPrompt,

    /// Vendor boot banner; boot still in progress.
    BootBanner,

    /// OS version banner.
    VersionBanner,
}

/// One `interface <name> mac address <nic>` remapping row.
#[derive(Debug, Clone, Copy)]
pub struct NicRemap {
    pub interface: &'static str,
    pub nic: &'static str,
}

/// Everything that differs between the supported appliance families.
///
/// The milestone table is content-addressed: any matched pattern
/// triggers the action associated with its label, regardless of
/// position. Order still matters for tie-breaking, because the
/// console channel reports the first match only -- the fast-path
/// `ManagerReachable` pattern is therefore listed first, so it wins
/// over `LoginPrompt` whenever both could apply.
#[derive(Debug, Clone)]
pub struct ApplianceProfile {
    /// Short family name, used in logs.
    pub name: &'static str,

    /// Namespace prefix for the configuration environment variables
    /// (e.g. `ECOS` for `ECOS_ADMIN_PASSWORD`).
    pub env_prefix: &'static str,

    /// Default hostname when the caller does not supply one.
    pub default_hostname: &'static str,

    /// Boot-milestone pattern table, evaluated against console
    /// output on every read.
    pub milestones: &'static [(&'static [u8], BootMilestone)],

    /// Command verb used to point the appliance at its management
    /// portal (`<verb> <hostname>`).
    pub portal_command: &'static str,

    /// Interface-to-NIC MAC remapping block, injected before the
    /// hostname step. Empty for families that don't need it.
    pub nic_remap: &'static [NicRemap],

    /// Whether applying the configuration ends in a device reload,
    /// requiring a full reboot cycle before the appliance is usable.
    pub reboot_on_configure: bool,
}

/// Milestone table shared by both families. Both run the same OS
/// lineage and print the same boot markers.
const MILESTONES: &[(&[u8], BootMilestone)] = &[
    (b"Appliance Manager is at", BootMilestone::ManagerReachable),
    (
        b"Press F1 to start Command Line Interface",
        BootMilestone::ConsoleMenu,
    ),
    (b"login:", BootMilestone::LoginPrompt),
    (b"Silver Peak", BootMilestone::BootBanner),
    (b"ECOS version", BootMilestone::VersionBanner),
];

/// HPE EdgeConnect virtual appliance (EC-V).
pub fn edgeconnect() -> ApplianceProfile {
    ApplianceProfile {
        name: "edgeconnect",
        env_prefix: "ECOS",
        default_hostname: "ecos",
        milestones: MILESTONES,
        portal_command: "orchestrator address",
        nic_remap: &[],
        reboot_on_configure: false,
    }
}

/// Aruba Virtual Gateway (VGW). Needs its console interfaces pinned
/// to the virtio NICs, and the remapping only takes effect after a
/// reload.
pub fn virtual_gateway() -> ApplianceProfile {
    ApplianceProfile {
        name: "virtual-gateway",
        env_prefix: "VGW",
        default_hostname: "vgw",
        milestones: MILESTONES,
        portal_command: "portal hostname",
        nic_remap: &[
            NicRemap {
                interface: "mgmt0",
                nic: "eth0",
            },
            NicRemap {
                interface: "wan0",
                nic: "eth1",
            },
            NicRemap {
                interface: "lan0",
                nic: "eth2",
            },
            NicRemap {
                interface: "wan1",
                nic: "eth3",
            },
            NicRemap {
                interface: "lan1",
                nic: "eth4",
            },
        ],
        reboot_on_configure: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_path_milestone_listed_first() {
        // The console channel returns the first match, so the
        // tie-break between an already-provisioned appliance and a
        // fresh login prompt is decided by table order.
        for profile in [edgeconnect(), virtual_gateway()] {
            assert_eq!(profile.milestones[0].1, BootMilestone::ManagerReachable);
        }
    }

    #[test]
    fn profiles_diverge_only_where_expected() {
        let ecos = edgeconnect();
        let vgw = virtual_gateway();

        assert!(ecos.nic_remap.is_empty());
        assert!(!ecos.reboot_on_configure);
        assert_eq!(vgw.nic_remap.len(), 5);
        assert!(vgw.reboot_on_configure);
        assert_ne!(ecos.portal_command, vgw.portal_command);
    }
}
