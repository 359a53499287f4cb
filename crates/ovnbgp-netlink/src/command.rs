// # `ip` Command Backend
//
// Typed link creation (vrf table, vxlan id/local/dstport, veth peer, vlan
// id) goes through iproute2; everything else the kernel backend does is an
// rtnetlink request.
//
// Argument construction is kept separate from execution so it can be
// checked without privileges.

use ovnbgp_core::net::DeviceSpec;
use ovnbgp_core::{Error, Result};
use tokio::process::Command;
use tracing::debug;

fn args<const N: usize>(parts: [&dyn ToString; N]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// `ip link add ...` for a device spec
pub fn device_args(spec: &DeviceSpec) -> Vec<String> {
    match spec {
        DeviceSpec::Dummy { name } => args([&"link", &"add", name, &"type", &"dummy"]),
        DeviceSpec::Vrf { name, table } => {
            args([&"link", &"add", name, &"type", &"vrf", &"table", table])
        }
        DeviceSpec::Vxlan {
            name,
            vni,
            local,
            dstport,
        } => args([
            &"link",
            &"add",
            name,
            &"type",
            &"vxlan",
            &"id",
            vni,
            &"local",
            local,
            &"dstport",
            dstport,
            &"nolearning",
        ]),
        DeviceSpec::Veth { name, peer } => {
            args([&"link", &"add", name, &"type", &"veth", &"peer", &"name", peer])
        }
        DeviceSpec::Vlan { parent, vlan_id } => args([
            &"link",
            &"add",
            &"link",
            parent,
            &"name",
            &spec.name(),
            &"type",
            &"vlan",
            &"id",
            vlan_id,
        ]),
    }
}

/// Runs iproute2
#[derive(Debug, Clone)]
pub struct IpCommand {
    binary: String,
}

impl Default for IpCommand {
    fn default() -> Self {
        Self::new("ip")
    }
}

impl IpCommand {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run and return stdout; a non-zero exit is a kernel error carrying stderr
    pub async fn run(&self, args: &[String]) -> Result<String> {
        debug!("{} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary).args(args).output().await?;
        if !output.status.success() {
            return Err(Error::kernel(format!(
                "{} {} failed: {}",
                self.binary,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(args: Vec<String>) -> String {
        args.join(" ")
    }

    #[test]
    fn device_commands() {
        let vrf = DeviceSpec::Vrf {
            name: "bgp-vrf".into(),
            table: 10,
        };
        assert_eq!(joined(device_args(&vrf)), "link add bgp-vrf type vrf table 10");

        let vxlan = DeviceSpec::Vxlan {
            name: "vxlan-10".into(),
            vni: 10,
            local: "192.0.2.1".parse().unwrap(),
            dstport: 4789,
        };
        assert_eq!(
            joined(device_args(&vxlan)),
            "link add vxlan-10 type vxlan id 10 local 192.0.2.1 dstport 4789 nolearning"
        );

        let vlan = DeviceSpec::Vlan {
            parent: "br-ex".into(),
            vlan_id: 100,
        };
        assert_eq!(
            joined(device_args(&vlan)),
            "link add link br-ex name br-ex.100 type vlan id 100"
        );
    }

    #[test]
    fn veth_and_dummy_commands() {
        let veth = DeviceSpec::Veth {
            name: "veth-a".into(),
            peer: "veth-b".into(),
        };
        assert_eq!(joined(device_args(&veth)), "link add veth-a type veth peer name veth-b");
        let dummy = DeviceSpec::Dummy {
            name: "bgp-nic".into(),
        };
        assert_eq!(joined(device_args(&dummy)), "link add bgp-nic type dummy");
    }

    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let err = IpCommand::new("false").run(&[]).await.unwrap_err();
        assert!(matches!(err, Error::Kernel(_)));
    }
}
