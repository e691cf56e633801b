//! Bit-string prefixes and VPN address math
//!
//! A node's allocation inside the managed network is identified by a
//! variable-length bit-string. The full VPN address of a node is
//! `network bits || prefix bits`, zero-padded to 128 bits.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv6Addr;

/// Total width of a VPN address in bits.
pub const ADDRESS_BITS: usize = 128;

/// A variable-length bit-string identifying a sub-allocation of the
/// managed address space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Prefix(String);

impl Prefix {
    /// The empty prefix, root of the allocation trie.
    pub fn root() -> Self {
        Prefix(String::new())
    }

    /// Parse a bit-string, rejecting anything but '0' and '1'.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() > ADDRESS_BITS || s.bytes().any(|b| b != b'0' && b != b'1') {
            return Err(Error::InvalidPrefix(s.to_string()));
        }
        Ok(Prefix(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append one bit in place.
    pub fn push(&mut self, bit: bool) {
        self.0.push(if bit { '1' } else { '0' });
    }

    /// The child prefix one bit longer.
    pub fn child(&self, bit: bool) -> Self {
        let mut c = self.clone();
        c.push(bit);
        c
    }

    /// True if any bit is set. The all-zero max-length prefix is the
    /// network's own unspecified address and must never be allocated.
    pub fn contains_one(&self) -> bool {
        self.0.contains('1')
    }

    /// Big-endian integer value of the bits. Empty prefix is 0.
    pub fn as_int(&self) -> u128 {
        self.0
            .bytes()
            .fold(0u128, |acc, b| (acc << 1) | u128::from(b - b'0'))
    }

    /// Rebuild a prefix from its integer value and bit length.
    pub fn from_int(value: u128, len: usize) -> Result<Self> {
        if len > ADDRESS_BITS || (len < 128 && value >> len != 0) {
            return Err(Error::InvalidPrefix(format!("{}/{}", value, len)));
        }
        let bits: String = (0..len)
            .rev()
            .map(|i| if value >> i & 1 == 1 { '1' } else { '0' })
            .collect();
        Ok(Prefix(bits))
    }

    /// Encode as a certificate common name, `"<int>/<len>"`.
    pub fn to_common_name(&self) -> String {
        format!("{}/{}", self.as_int(), self.len())
    }

    /// Decode a certificate common name.
    pub fn from_common_name(cn: &str) -> Result<Self> {
        let (value, len) = cn
            .split_once('/')
            .ok_or_else(|| Error::InvalidPrefix(cn.to_string()))?;
        let value: u128 = value
            .parse()
            .map_err(|_| Error::InvalidPrefix(cn.to_string()))?;
        let len: usize = len
            .parse()
            .map_err(|_| Error::InvalidPrefix(cn.to_string()))?;
        Self::from_int(value, len)
    }

    /// True if `self` is a (non-strict) prefix of the given bit-string.
    pub fn is_prefix_of(&self, bits: &str) -> bool {
        bits.starts_with(&self.0)
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Expand an IPv6 address to its 128-character bit-string.
pub fn bits_from_ip(ip: Ipv6Addr) -> String {
    let value = u128::from_be_bytes(ip.octets());
    (0..ADDRESS_BITS)
        .rev()
        .map(|i| if value >> i & 1 == 1 { '1' } else { '0' })
        .collect()
}

/// Build an IPv6 address from a bit-string, zero-padded on the right.
pub fn ip_from_bits(bits: &str) -> Result<Ipv6Addr> {
    if bits.len() > ADDRESS_BITS || bits.bytes().any(|b| b != b'0' && b != b'1') {
        return Err(Error::InvalidAddress(bits.to_string()));
    }
    let mut value = 0u128;
    for b in bits.bytes() {
        value = (value << 1) | u128::from(b - b'0');
    }
    value <<= ADDRESS_BITS - bits.len();
    Ok(Ipv6Addr::from(value.to_be_bytes()))
}

/// The managed network: the fixed leading bits shared by every VPN
/// address handed out by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network(String);

impl Network {
    /// Parse from a bit-string.
    pub fn parse(bits: &str) -> Result<Self> {
        if bits.is_empty()
            || bits.len() >= ADDRESS_BITS
            || bits.bytes().any(|b| b != b'0' && b != b'1')
        {
            return Err(Error::InvalidPrefix(bits.to_string()));
        }
        Ok(Network(bits.to_string()))
    }

    /// Build from an IPv6 CIDR block, e.g. `2001:db8:42::/48`.
    pub fn from_cidr(net: ipnetwork::Ipv6Network) -> Result<Self> {
        let bits = bits_from_ip(net.network());
        Self::parse(&bits[..net.prefix() as usize])
    }

    /// Decode from a CA certificate serial number: a leading marker bit
    /// followed by the network bits.
    pub fn from_serial(serial: &[u8]) -> Result<Self> {
        if serial.len() > 16 {
            return Err(Error::InvalidPrefix(hex::encode(serial)));
        }
        let mut value = 0u128;
        for b in serial {
            value = (value << 8) | u128::from(*b);
        }
        if value < 2 {
            return Err(Error::InvalidPrefix(format!("serial {}", value)));
        }
        let len = 127 - value.leading_zeros() as usize;
        let bits: String = (0..len)
            .rev()
            .map(|i| if value >> i & 1 == 1 { '1' } else { '0' })
            .collect();
        Self::parse(&bits)
    }

    /// Encode as a CA serial number value.
    pub fn to_serial(&self) -> u128 {
        let bits = Prefix(self.0.clone());
        (1 << self.0.len()) | bits.as_int()
    }

    pub fn bits(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Longest prefix length allocatable under this network.
    pub fn max_prefix_len(&self) -> usize {
        ADDRESS_BITS - self.0.len()
    }

    /// The network's own address, all host bits zero.
    pub fn base_address(&self) -> Ipv6Addr {
        let mut value = 0u128;
        for b in self.0.bytes() {
            value = (value << 1) | u128::from(b - b'0');
        }
        value <<= ADDRESS_BITS - self.0.len();
        Ipv6Addr::from(value.to_be_bytes())
    }

    /// True if the address falls under the managed network.
    pub fn contains(&self, ip: Ipv6Addr) -> bool {
        bits_from_ip(ip).starts_with(&self.0)
    }

    /// Host bits of an address under this network, or None if the
    /// address is outside the managed prefix.
    pub fn remainder(&self, ip: Ipv6Addr) -> Option<String> {
        let bits = bits_from_ip(ip);
        bits.starts_with(&self.0)
            .then(|| bits[self.0.len()..].to_string())
    }

    /// VPN address of an allocation: network bits, prefix bits, zeros.
    pub fn address_of(&self, prefix: &Prefix) -> Result<Ipv6Addr> {
        let mut bits = self.0.clone();
        bits.push_str(prefix.as_str());
        ip_from_bits(&bits)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base_address(), self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_parse_rejects_garbage() {
        assert!(Prefix::parse("0102").is_err());
        assert!(Prefix::parse("0011").is_ok());
        assert!(Prefix::parse("").is_ok());
    }

    #[test]
    fn prefix_int_round_trip() {
        let p = Prefix::parse("010110").unwrap();
        assert_eq!(p.as_int(), 0b010110);
        assert_eq!(Prefix::from_int(p.as_int(), 6).unwrap(), p);
        // Leading zeros survive the round trip via the length.
        let q = Prefix::parse("0001").unwrap();
        assert_eq!(Prefix::from_common_name(&q.to_common_name()).unwrap(), q);
    }

    #[test]
    fn common_name_format() {
        let p = Prefix::parse("0000000000000101").unwrap();
        assert_eq!(p.to_common_name(), "5/16");
        assert_eq!(Prefix::from_common_name("5/16").unwrap(), p);
        assert!(Prefix::from_common_name("5").is_err());
        assert!(Prefix::from_common_name("x/16").is_err());
    }

    #[test]
    fn network_from_cidr_and_serial() {
        let cidr: ipnetwork::Ipv6Network = "2001:db8:42::/48".parse().unwrap();
        let net = Network::from_cidr(cidr).unwrap();
        assert_eq!(net.len(), 48);
        assert_eq!(net.to_serial(), 0x1_2001_0db8_0042);

        let bytes = net.to_serial().to_be_bytes();
        let first = bytes.iter().position(|b| *b != 0).unwrap();
        let decoded = Network::from_serial(&bytes[first..]).unwrap();
        assert_eq!(decoded, net);
        assert_eq!(decoded.to_string(), "2001:db8:42::/48");
    }

    #[test]
    fn address_of_pads_with_zeros() {
        let cidr: ipnetwork::Ipv6Network = "2001:db8:42::/48".parse().unwrap();
        let net = Network::from_cidr(cidr).unwrap();
        let prefix = Prefix::from_int(1, 16).unwrap();
        let ip = net.address_of(&prefix).unwrap();
        assert_eq!(ip, "2001:db8:42:1::".parse::<Ipv6Addr>().unwrap());
        assert!(net.contains(ip));
        assert_eq!(net.remainder(ip).unwrap().len(), 80);
        assert!(net.remainder("fe80::1".parse().unwrap()).is_none());
    }

    #[test]
    fn max_prefix_len_counts_host_bits() {
        let net = Network::parse("0010").unwrap();
        assert_eq!(net.max_prefix_len(), 124);
    }
}
