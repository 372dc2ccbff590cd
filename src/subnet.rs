use crate::error::BootstrapError;
use ipnet::Ipv4Net;
use serde::Serialize;
use std::net::Ipv4Addr;

/// Parse an interface CIDR such as `172.17.0.2/16`.
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net, BootstrapError> {
    cidr.trim()
        .parse::<Ipv4Net>()
        .map_err(|_| BootstrapError::InvalidCidr(cidr.to_string()))
}

/// Per-octet complement of the subnet mask for `prefix`.
pub fn wildcard_mask(prefix: u8) -> Result<Ipv4Addr, BootstrapError> {
    let net = Ipv4Net::new(Ipv4Addr::UNSPECIFIED, prefix)
        .map_err(|_| BootstrapError::InvalidPrefix(prefix))?;
    Ok(net.hostmask())
}

/// Network address of the subnet `cidr` lives in.
pub fn containing_network(cidr: Ipv4Net) -> Ipv4Addr {
    cidr.network()
}

/// Shift `current_ip` by `offset` inside the host bits of `network`.
///
/// Each octet is computed independently:
/// `network + ((current - network + offset) & wildcard)`, modulo 256.
/// Nothing carries between octets, so an offset that overflows an octet's
/// host bits wraps within that octet instead of spilling into the next.
pub fn compute_offset_address(
    current_ip: Ipv4Addr,
    network: Ipv4Addr,
    offset: Ipv4Addr,
    wildcard: Ipv4Addr,
) -> Ipv4Addr {
    let cur = current_ip.octets();
    let net = network.octets();
    let off = offset.octets();
    let wc = wildcard.octets();

    let mut out = [0u8; 4];
    for i in 0..4 {
        let host = cur[i].wrapping_sub(net[i]).wrapping_add(off[i]) & wc[i];
        out[i] = net[i].wrapping_add(host);
    }
    Ipv4Addr::from(out)
}

/// Everything derived while planning the inner bridge subnet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SubnetDerivation {
    pub current: Ipv4Net,
    pub containing_network: Ipv4Addr,
    pub wildcard: Ipv4Addr,
    pub offset: Ipv4Addr,
    pub base_address: Ipv4Addr,
    pub fixed_cidr: Ipv4Net,
}

/// Apply `offset` to the interface address `current` and return the
/// `/size` network that contains the shifted address.
pub fn derive_bridge_subnet(
    current: Ipv4Net,
    offset: Ipv4Addr,
    size: u8,
) -> Result<SubnetDerivation, BootstrapError> {
    let network = containing_network(current);
    let wildcard = wildcard_mask(current.prefix_len())?;
    let base_address = compute_offset_address(current.addr(), network, offset, wildcard);
    let fixed_cidr = Ipv4Net::new(base_address, size)
        .map_err(|_| BootstrapError::InvalidPrefix(size))?
        .trunc();

    Ok(SubnetDerivation {
        current,
        containing_network: network,
        wildcard,
        offset,
        base_address,
        fixed_cidr,
    })
}
