//! Address range arithmetic.
//!
//! Addresses are mapped onto unsigned integers (u32 for IPv4, u128 for IPv6)
//! so that ranges can be compared, intersected and sized without walking
//! them. IPv4 addresses never compare equal to IPv6 addresses: ordering is
//! lexicographic on `(family, value)`, so ranges of different families never
//! overlap.
//!
//! Sizes are carried as [`Capacity`], a saturating 128-bit count that is
//! serialized as a decimal string for both families.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Address family of a range or entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn of_net(net: &IpNet) -> Self {
        Self::of(net.addr())
    }

    /// Suffix used by node roles and agent commands (`"4"` or `"6"`).
    pub fn suffix(self) -> &'static str {
        match self {
            Family::V4 => "4",
            Family::V6 => "6",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.suffix())
    }
}

/// Number of assignable addresses or delegated prefixes.
///
/// Arithmetic saturates at `u128::MAX`, which stands in for the size of the
/// whole IPv6 space (2^128 does not fit).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Capacity(u128);

impl Capacity {
    pub const ZERO: Capacity = Capacity(0);
    pub const MAX: Capacity = Capacity(u128::MAX);

    pub const fn new(value: u128) -> Self {
        Capacity(value)
    }

    pub const fn get(self) -> u128 {
        self.0
    }

    pub fn saturating_add(self, other: Capacity) -> Capacity {
        Capacity(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Capacity) -> Capacity {
        Capacity(self.0.saturating_sub(other.0))
    }

    pub fn checked_sub(self, other: Capacity) -> Option<Capacity> {
        self.0.checked_sub(other.0).map(Capacity)
    }
}

impl From<u64> for Capacity {
    fn from(value: u64) -> Self {
        Capacity(value as u128)
    }
}

impl std::iter::Sum for Capacity {
    fn sum<I: Iterator<Item = Capacity>>(iter: I) -> Self {
        iter.fold(Capacity::ZERO, Capacity::saturating_add)
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Capacity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u128>()
            .map(Capacity)
            .map_err(|error| Error::validation(format!("invalid capacity '{}': {}", s, error)))
    }
}

impl Serialize for Capacity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Capacity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
            Repr::Number(number) => Ok(Capacity::from(number)),
        }
    }
}

/// Maps an address onto its integer value.
pub fn to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn sort_key(addr: IpAddr) -> (Family, u128) {
    (Family::of(addr), to_u128(addr))
}

pub fn less_than(a: IpAddr, b: IpAddr) -> bool {
    sort_key(a) < sort_key(b)
}

/// `!(end_a < begin_b || end_b < begin_a)`
pub fn overlaps(begin_a: IpAddr, end_a: IpAddr, begin_b: IpAddr, end_b: IpAddr) -> bool {
    !(less_than(end_a, begin_b) || less_than(end_b, begin_a))
}

/// Number of addresses in `[begin, end]`.
///
/// # Errors
///
/// Returns [`Error::Validation`] if the families differ or `end < begin`.
pub fn size(begin: IpAddr, end: IpAddr) -> Result<Capacity> {
    if Family::of(begin) != Family::of(end) {
        return Err(Error::validation(format!(
            "{} and {} belong to different address families",
            begin, end
        )));
    }
    if less_than(end, begin) {
        return Err(Error::validation(format!(
            "range end {} is before begin {}",
            end, begin
        )));
    }

    Ok(Capacity((to_u128(end) - to_u128(begin)).saturating_add(1)))
}

fn low_mask(bits: u32) -> u128 {
    if bits >= 128 { u128::MAX } else { (1u128 << bits) - 1 }
}

fn check_delegation(prefix_len: u8, delegated_len: u8) -> Result<()> {
    if delegated_len > 128 || prefix_len > delegated_len {
        return Err(Error::validation(format!(
            "delegated length /{} must be between the prefix length /{} and /128",
            delegated_len, prefix_len
        )));
    }
    Ok(())
}

/// Last delegated prefix of a `(prefix, prefix_len, delegated_len)` pool.
///
/// Bits above `prefix_len` come from the parent prefix, bits in
/// `[prefix_len, delegated_len)` are set, and bits below `delegated_len`
/// stay zero.
pub fn pd_end_prefix(prefix: Ipv6Addr, prefix_len: u8, delegated_len: u8) -> Result<Ipv6Addr> {
    check_delegation(prefix_len, delegated_len)?;

    let parent_mask = !low_mask(128 - prefix_len as u32);
    let network = u128::from(prefix) & parent_mask;
    let span = low_mask(128 - prefix_len as u32) & !low_mask(128 - delegated_len as u32);
    Ok(Ipv6Addr::from(network | span))
}

/// Number of `/delegated_len` prefixes inside a `/prefix_len`, saturating.
pub fn pd_capacity(prefix_len: u8, delegated_len: u8) -> Result<Capacity> {
    check_delegation(prefix_len, delegated_len)?;

    let exponent = (delegated_len - prefix_len) as u32;
    if exponent >= 128 {
        Ok(Capacity::MAX)
    } else {
        Ok(Capacity(1u128 << exponent))
    }
}

/// Returns `addr + delta`, staying within the address family.
pub fn offset(addr: IpAddr, delta: u128) -> Result<IpAddr> {
    let overflow = || Error::validation(format!("{} + {} leaves the address space", addr, delta));
    match addr {
        IpAddr::V4(v4) => {
            let value = (u32::from(v4) as u128)
                .checked_add(delta)
                .filter(|value| *value <= u32::MAX as u128)
                .ok_or_else(overflow)?;
            Ok(IpAddr::V4(Ipv4Addr::from(value as u32)))
        }
        IpAddr::V6(v6) => {
            let value = u128::from(v6).checked_add(delta).ok_or_else(overflow)?;
            Ok(IpAddr::V6(Ipv6Addr::from(value)))
        }
    }
}

/// An inclusive `[begin, end]` range of addresses within one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    begin: IpAddr,
    end: IpAddr,
}

impl AddressRange {
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the families differ or `end < begin`.
    pub fn new(begin: IpAddr, end: IpAddr) -> Result<Self> {
        size(begin, end)?;
        Ok(Self { begin, end })
    }

    pub fn single(addr: IpAddr) -> Self {
        Self {
            begin: addr,
            end: addr,
        }
    }

    /// The full span of a prefix, network address through last address.
    pub fn from_prefix(net: &IpNet) -> Self {
        let net = net.trunc();
        Self {
            begin: net.network(),
            end: net.broadcast(),
        }
    }

    pub fn begin(&self) -> IpAddr {
        self.begin
    }

    pub fn end(&self) -> IpAddr {
        self.end
    }

    pub fn family(&self) -> Family {
        Family::of(self.begin)
    }

    pub fn size(&self) -> Capacity {
        Capacity((to_u128(self.end) - to_u128(self.begin)).saturating_add(1))
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        overlaps(self.begin, self.end, other.begin, other.end)
    }

    /// True when `other` lies entirely within `self`.
    pub fn contains(&self, other: &AddressRange) -> bool {
        !less_than(other.begin, self.begin) && !less_than(self.end, other.end)
    }

    pub fn contains_addr(&self, addr: IpAddr) -> bool {
        self.contains(&AddressRange::single(addr))
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.begin == self.end {
            write!(f, "{}", self.begin)
        } else {
            write!(f, "{}-{}", self.begin, self.end)
        }
    }
}
