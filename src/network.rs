use crate::config::NetworkConfig;
use crate::error::BootstrapError;
use crate::host::Host;
use crate::subnet::{SubnetDerivation, derive_bridge_subnet};
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::net::Ipv4Addr;
use tracing::info;

/// One entry of `ip -json route show`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RouteRecord {
    pub dst: String,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dev: Option<String>,
}

/// One entry of `ip -json addr show`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LinkRecord {
    pub ifname: String,
    #[serde(default)]
    pub addr_info: Vec<AddrInfo>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AddrInfo {
    pub family: String,
    pub local: String,
    pub prefixlen: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DefaultRoute {
    pub gateway: Ipv4Addr,
    pub dev: String,
}

/// How the uplink gets moved under the inner daemon's bridge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgePlan {
    pub uplink: String,
    pub bridge: String,
    pub address: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub subnet: SubnetDerivation,
}

impl BridgePlan {
    pub fn daemon_flags(&self) -> Vec<String> {
        vec![
            format!("--bridge={}", self.bridge),
            format!("--fixed-cidr={}", self.subnet.fixed_cidr),
        ]
    }
}

pub fn parse_routes(json: &str) -> Result<Vec<RouteRecord>, BootstrapError> {
    serde_json::from_str(json).map_err(|source| BootstrapError::Parse {
        program: "ip route".to_string(),
        source,
    })
}

pub fn parse_links(json: &str) -> Result<Vec<LinkRecord>, BootstrapError> {
    serde_json::from_str(json).map_err(|source| BootstrapError::Parse {
        program: "ip addr".to_string(),
        source,
    })
}

pub fn default_route(routes: &[RouteRecord]) -> Result<DefaultRoute, BootstrapError> {
    routes
        .iter()
        .filter(|r| r.dst == "default")
        .find_map(|r| {
            Some(DefaultRoute {
                gateway: r.gateway?,
                dev: r.dev.clone()?,
            })
        })
        .ok_or_else(|| BootstrapError::MissingInterface("no IPv4 default route".to_string()))
}

/// First IPv4 address configured on `ifname`.
pub fn interface_cidr(links: &[LinkRecord], ifname: &str) -> Result<Ipv4Net, BootstrapError> {
    let link = links
        .iter()
        .find(|l| l.ifname == ifname)
        .ok_or_else(|| BootstrapError::MissingInterface(ifname.to_string()))?;

    let info = link
        .addr_info
        .iter()
        .find(|a| a.family == "inet")
        .ok_or_else(|| BootstrapError::MissingInterface(format!("{} has no IPv4 address", ifname)))?;

    let cidr = format!("{}/{}", info.local, info.prefixlen);
    crate::subnet::parse_cidr(&cidr)
}

/// Work out the bridge layout from the container's current addressing.
pub async fn plan_bridge(host: &impl Host, cfg: &NetworkConfig) -> Result<BridgePlan, BootstrapError> {
    let out = host
        .run("ip", &["-json", "-4", "route", "show", "default"])
        .await?
        .check("ip route")?;
    let route = default_route(&parse_routes(&out.stdout)?)?;

    let out = host
        .run("ip", &["-json", "-4", "addr", "show", "dev", route.dev.as_str()])
        .await?
        .check("ip addr")?;
    let address = interface_cidr(&parse_links(&out.stdout)?, &route.dev)?;

    let subnet = derive_bridge_subnet(address, cfg.offset, cfg.size)?;
    info!(
        uplink = %route.dev,
        address = %address,
        offset = %cfg.offset,
        fixed_cidr = %subnet.fixed_cidr,
        "Derived inner docker subnet"
    );

    Ok(BridgePlan {
        uplink: route.dev,
        bridge: cfg.bridge.clone(),
        address,
        gateway: route.gateway,
        subnet,
    })
}

/// Commands that enslave the uplink to the bridge and move its address
/// and default route over.
pub fn bridge_commands(plan: &BridgePlan) -> Vec<Vec<String>> {
    let addr = plan.address.to_string();
    let gw = plan.gateway.to_string();
    let b = plan.bridge.as_str();
    let up = plan.uplink.as_str();

    [
        vec!["link", "add", "name", b, "type", "bridge"],
        vec!["addr", "del", addr.as_str(), "dev", up],
        vec!["link", "set", up, "master", b],
        vec!["addr", "add", addr.as_str(), "dev", b],
        vec!["link", "set", b, "up"],
        vec!["route", "replace", "default", "via", gw.as_str(), "dev", b],
    ]
    .into_iter()
    .map(|args| args.into_iter().map(str::to_string).collect())
    .collect()
}

/// Bridge the inner daemon onto the container network and return the
/// daemon flags that point it at the bridge.
pub async fn setup_bridge(host: &impl Host, cfg: &NetworkConfig) -> Result<Vec<String>, BootstrapError> {
    let plan = plan_bridge(host, cfg).await?;

    if host.interface_exists(&plan.bridge) {
        info!(bridge = %plan.bridge, "Bridge already present, leaving links alone");
    } else {
        for args in bridge_commands(&plan) {
            let argv: Vec<&str> = args.iter().map(String::as_str).collect();
            host.run("ip", &argv).await?.check("ip")?;
        }
        info!(bridge = %plan.bridge, uplink = %plan.uplink, "Bridged uplink");
    }

    Ok(plan.daemon_flags())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;

    const ROUTES: &str = r#"[{"dst":"default","gateway":"172.17.0.1","dev":"eth0","flags":[]}]"#;
    const LINKS: &str = r#"[{"ifindex":5,"ifname":"eth0","flags":["BROADCAST","UP"],"mtu":1500,
        "addr_info":[{"family":"inet","local":"172.17.0.2","prefixlen":16,"broadcast":"172.17.255.255",
        "scope":"global","label":"eth0","valid_life_time":4294967295}]}]"#;

    fn cfg() -> NetworkConfig {
        NetworkConfig {
            offset: Ipv4Addr::new(0, 0, 4, 0),
            size: 24,
            bridge: "docker0".into(),
        }
    }

    fn host() -> FakeHost {
        FakeHost::default()
            .respond("ip -json -4 route show default", FakeHost::ok(ROUTES))
            .respond("ip -json -4 addr show dev eth0", FakeHost::ok(LINKS))
    }

    #[test]
    fn test_default_route() {
        let routes = parse_routes(
            r#"[{"dst":"10.0.0.0/8","dev":"eth1"},{"dst":"default","gateway":"10.1.0.1","dev":"eth1"}]"#,
        )
        .unwrap();
        assert_eq!(
            default_route(&routes).unwrap(),
            DefaultRoute { gateway: "10.1.0.1".parse().unwrap(), dev: "eth1".into() }
        );
        assert!(default_route(&parse_routes("[]").unwrap()).is_err());
    }

    #[test]
    fn test_interface_cidr_skips_v6() {
        let links = parse_links(
            r#"[{"ifname":"eth0","addr_info":[{"family":"inet6","local":"fe80::1","prefixlen":64},
            {"family":"inet","local":"10.0.5.17","prefixlen":24}]}]"#,
        )
        .unwrap();
        assert_eq!(interface_cidr(&links, "eth0").unwrap().to_string(), "10.0.5.17/24");
        assert!(matches!(
            interface_cidr(&links, "eth9"),
            Err(BootstrapError::MissingInterface(_))
        ));
    }

    #[test]
    fn test_garbage_output_is_a_parse_error() {
        assert!(matches!(parse_routes("default via 1.2.3.4"), Err(BootstrapError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_plan_bridge() {
        let plan = plan_bridge(&host(), &cfg()).await.unwrap();
        assert_eq!(plan.uplink, "eth0");
        assert_eq!(plan.address.to_string(), "172.17.0.2/16");
        assert_eq!(plan.subnet.base_address, Ipv4Addr::new(172, 17, 4, 2));
        assert_eq!(
            plan.daemon_flags(),
            vec!["--bridge=docker0", "--fixed-cidr=172.17.4.0/24"]
        );
    }

    #[tokio::test]
    async fn test_setup_bridge_runs_ip_commands() {
        let host = host();
        let flags = setup_bridge(&host, &cfg()).await.unwrap();
        assert_eq!(flags.len(), 2);
        assert_eq!(
            host.commands.borrow()[2..],
            [
                "ip link add name docker0 type bridge",
                "ip addr del 172.17.0.2/16 dev eth0",
                "ip link set eth0 master docker0",
                "ip addr add 172.17.0.2/16 dev docker0",
                "ip link set docker0 up",
                "ip route replace default via 172.17.0.1 dev docker0",
            ]
        );
    }

    #[tokio::test]
    async fn test_existing_bridge_is_left_alone() {
        let host = host();
        host.interfaces.borrow_mut().insert("docker0".into());
        let flags = setup_bridge(&host, &cfg()).await.unwrap();
        assert_eq!(flags[1], "--fixed-cidr=172.17.4.0/24");
        assert_eq!(host.commands.borrow().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_ip_command_is_fatal() {
        let host = host().respond("ip link add name docker0 type bridge", FakeHost::fail("EPERM"));
        let err = setup_bridge(&host, &cfg()).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Command { .. }));
    }
}
