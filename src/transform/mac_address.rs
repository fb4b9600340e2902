//! Transformations for MAC addresses.

use crate::data::Value;

use super::{input_str, TransformArgs, TransformError};

/// Normalizes a MAC address.
///
/// Accepts colon- or dash-delimited addresses (the delimiter must be used
/// consistently, and the leading zero of a byte below 0x10 may be omitted)
/// as well as the dotted four-digit-group form (`02ab.cdef.0102`). Returns
/// the canonical lowercase colon-separated form (`02:ab:cd:ef:01:02`).
///
/// Fails for anything that does not represent a 48-bit address.
pub fn normalize(value: &Value, _args: &TransformArgs) -> Result<Value, TransformError> {
    let input = input_str(value)?;
    let bytes = parse(input)
        .ok_or_else(|| TransformError::Value(format!("Not a valid MAC address: {input}")))?;
    let normalized = bytes
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":");
    Ok(Value::String(normalized))
}

fn parse(input: &str) -> Option<[u8; 6]> {
    // A delimited address uses ":" or "-" throughout. Splitting on the
    // first delimiter found makes mixed forms fail the hex check below.
    for delimiter in [':', '-'] {
        if input.contains(delimiter) {
            return parse_delimited(input, delimiter);
        }
    }
    parse_dotted(input)
}

fn parse_delimited(input: &str, delimiter: char) -> Option<[u8; 6]> {
    let mut bytes = [0_u8; 6];
    let mut parts = input.split(delimiter);
    for slot in &mut bytes {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 2 {
            return None;
        }
        *slot = parse_hex_u8(part)?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(bytes)
}

fn parse_dotted(input: &str) -> Option<[u8; 6]> {
    let mut bytes = [0_u8; 6];
    let mut parts = input.split('.');
    for pair in 0..3 {
        let part = parts.next()?;
        if part.len() != 4 {
            return None;
        }
        bytes[pair * 2] = parse_hex_u8(&part[..2])?;
        bytes[pair * 2 + 1] = parse_hex_u8(&part[2..])?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(bytes)
}

fn parse_hex_u8(part: &str) -> Option<u8> {
    if !part.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return None;
    }
    u8::from_str_radix(part, 16).ok()
}
