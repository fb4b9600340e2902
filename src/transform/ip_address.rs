//! Transformations for IPv4 and IPv6 addresses.

use std::net::{IpAddr, Ipv4Addr};

use ipnet::IpNet;

use crate::data::Value;

use super::{input_str, TransformArgs, TransformError};

/// Normalizes an IPv4 address, preserving an optional `/n` mask.
///
/// Each byte is rendered without leading zeros, so `192.168.000.003`
/// becomes `192.168.0.3`.
pub fn normalize_ipv4(value: &Value, _args: &TransformArgs) -> Result<Value, TransformError> {
    let input = input_str(value)?;
    let (addr, mask) = parse_ipv4(input)?;
    Ok(Value::String(with_mask(IpAddr::V4(addr), mask)))
}

/// Strips the `/n` mask from an IPv4 address, if present.
pub fn strip_mask_ipv4(value: &Value, _args: &TransformArgs) -> Result<Value, TransformError> {
    let input = input_str(value)?;
    let (addr, _) = parse_ipv4(input)?;
    Ok(Value::String(addr.to_string()))
}

/// Calculates the network address for an IPv4 address with a mask.
///
/// `192.168.0.1/24` becomes `192.168.0.0/24`; the mask is kept.
pub fn net_address_ipv4(value: &Value, _args: &TransformArgs) -> Result<Value, TransformError> {
    let input = input_str(value)?;
    let (addr, mask) = parse_ipv4(input)?;
    let mask = require_mask(input, mask)?;
    let net = IpNet::new(IpAddr::V4(addr), mask)
        .map_err(|err| TransformError::Value(format!("Invalid mask in \"{input}\": {err}")))?;
    Ok(Value::String(format!("{}/{mask}", net.network())))
}

/// Calculates the broadcast address for an IPv4 address with a mask.
///
/// `192.168.0.1/24` becomes `192.168.0.255`; the mask is not included in
/// the result.
pub fn broadcast_address_ipv4(
    value: &Value,
    _args: &TransformArgs,
) -> Result<Value, TransformError> {
    let input = input_str(value)?;
    let (addr, mask) = parse_ipv4(input)?;
    let mask = require_mask(input, mask)?;
    let net = IpNet::new(IpAddr::V4(addr), mask)
        .map_err(|err| TransformError::Value(format!("Invalid mask in \"{input}\": {err}")))?;
    Ok(Value::String(net.broadcast().to_string()))
}

/// Normalizes an IPv4 or IPv6 address, preserving an optional `/n` mask.
///
/// IPv6 addresses are rendered in their canonical RFC 5952 form.
/// IPv4-mapped IPv6 addresses (`::ffff:192.0.2.1`), which typically occur
/// when handling IPv4 connections on an IPv6 socket, are unwrapped to the
/// plain IPv4 address.
pub fn normalize(value: &Value, _args: &TransformArgs) -> Result<Value, TransformError> {
    let input = input_str(value)?;
    let (addr, mask) = parse_ip(input)?;
    Ok(Value::String(with_mask(unwrap_mapped(addr), mask)))
}

/// Extracts the network portion of an IP address with a mask.
///
/// The mask is kept in the result: `2001:db8::1/32` becomes `2001:db8::/32`.
pub fn network(value: &Value, _args: &TransformArgs) -> Result<Value, TransformError> {
    let input = input_str(value)?;
    let (addr, mask) = parse_ip(input)?;
    let mask = require_mask(input, mask)?;
    let net = IpNet::new(unwrap_mapped(addr), mask)
        .map_err(|err| TransformError::Value(format!("Invalid mask in \"{input}\": {err}")))?;
    Ok(Value::String(format!("{}/{mask}", net.network())))
}

/// Extracts the host portion of an IP address, stripping the mask.
pub fn host(value: &Value, _args: &TransformArgs) -> Result<Value, TransformError> {
    let input = input_str(value)?;
    let (addr, _) = parse_ip(input)?;
    Ok(Value::String(unwrap_mapped(addr).to_string()))
}

/// Unwraps an IPv4-mapped IPv6 address to the plain IPv4 address.
fn unwrap_mapped(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
        IpAddr::V4(_) => addr,
    }
}

fn with_mask(addr: IpAddr, mask: Option<u8>) -> String {
    match mask {
        Some(mask) => format!("{addr}/{mask}"),
        None => addr.to_string(),
    }
}

fn require_mask(input: &str, mask: Option<u8>) -> Result<u8, TransformError> {
    mask.ok_or_else(|| {
        TransformError::Value(format!(
            "Cannot calculate network address for IP address without subnet mask: {input}"
        ))
    })
}

fn parse_ipv4(input: &str) -> Result<(Ipv4Addr, Option<u8>), TransformError> {
    let (addr_part, mask) = split_mask(input, 32)?;
    // Octets are parsed by hand because the std parser rejects leading
    // zeros, which normalization must accept (`192.168.000.003`).
    let mut octets = [0_u8; 4];
    let mut parts = addr_part.split('.');
    for slot in &mut octets {
        let part = parts
            .next()
            .filter(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| {
                TransformError::Value(format!("Not a valid IPv4 address: {input}"))
            })?;
        *slot = part
            .parse()
            .map_err(|_| TransformError::Value(format!("Not a valid IPv4 address: {input}")))?;
    }
    if parts.next().is_some() {
        return Err(TransformError::Value(format!(
            "Not a valid IPv4 address: {input}"
        )));
    }
    Ok((Ipv4Addr::from(octets), mask))
}

fn parse_ip(input: &str) -> Result<(IpAddr, Option<u8>), TransformError> {
    // Anything without a colon is treated as IPv4 so that the more lenient
    // octet parser (leading zeros) applies.
    if !input.contains(':') {
        let (addr, mask) = parse_ipv4(input)?;
        return Ok((IpAddr::V4(addr), mask));
    }
    let addr_part = input.split('/').next().unwrap_or(input);
    let addr: IpAddr = addr_part
        .parse()
        .map_err(|_| TransformError::Value(format!("Not a valid IP address: {input}")))?;
    let (_, mask) = split_mask(input, 128)?;
    Ok((addr, mask))
}

fn split_mask(input: &str, max_mask: u8) -> Result<(&str, Option<u8>), TransformError> {
    match input.split_once('/') {
        None => Ok((input, None)),
        Some((addr_part, mask_part)) => {
            let mask: u8 = mask_part
                .parse()
                .map_err(|_| TransformError::Value(format!("Invalid mask in \"{input}\"")))?;
            if mask > max_mask {
                return Err(TransformError::Value(format!("Invalid mask in \"{input}\"")));
            }
            Ok((addr_part, Some(mask)))
        }
    }
}
