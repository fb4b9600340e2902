//! String transformations.

use crate::data::Value;

use super::{input_str, TransformArgs, TransformError};

/// Returns the lower-case version of the string.
pub fn to_lower(value: &Value, _args: &TransformArgs) -> Result<Value, TransformError> {
    Ok(Value::String(input_str(value)?.to_lowercase()))
}

/// Returns the upper-case version of the string.
pub fn to_upper(value: &Value, _args: &TransformArgs) -> Result<Value, TransformError> {
    Ok(Value::String(input_str(value)?.to_uppercase()))
}

/// Returns the string representation of any value.
pub fn to_str(value: &Value, _args: &TransformArgs) -> Result<Value, TransformError> {
    Ok(Value::String(value.to_plain_string()))
}

/// Prepends `prefix` to the value.
pub fn add_prefix(value: &Value, args: &TransformArgs) -> Result<Value, TransformError> {
    let prefix = args.str_arg(0, "prefix")?.unwrap_or("");
    Ok(Value::String(format!("{prefix}{}", input_str(value)?)))
}

/// Appends `suffix` to the value.
pub fn add_suffix(value: &Value, args: &TransformArgs) -> Result<Value, TransformError> {
    let suffix = args.str_arg(0, "suffix")?.unwrap_or("");
    Ok(Value::String(format!("{}{suffix}", input_str(value)?)))
}

/// Removes `prefix` from the value if present.
pub fn remove_prefix(value: &Value, args: &TransformArgs) -> Result<Value, TransformError> {
    let prefix = args.str_arg(0, "prefix")?.unwrap_or("");
    let input = input_str(value)?;
    Ok(Value::String(
        input.strip_prefix(prefix).unwrap_or(input).to_string(),
    ))
}

/// Removes `suffix` from the value if present.
pub fn remove_suffix(value: &Value, args: &TransformArgs) -> Result<Value, TransformError> {
    let suffix = args.str_arg(0, "suffix")?.unwrap_or("");
    let input = input_str(value)?;
    Ok(Value::String(
        input.strip_suffix(suffix).unwrap_or(input).to_string(),
    ))
}

/// Splits the string into a sequence of strings.
///
/// With no `sep` argument the string is split along runs of whitespace.
/// `maxsplit` limits the number of splits; `-1` (the default) means no
/// limit.
pub fn split(value: &Value, args: &TransformArgs) -> Result<Value, TransformError> {
    let input = input_str(value)?;
    let sep = args.str_arg(0, "sep")?;
    let maxsplit = args.int_arg(1, "maxsplit")?.unwrap_or(-1);

    let parts: Vec<String> = match sep {
        Some(sep) => {
            if maxsplit < 0 {
                input.split(sep).map(str::to_string).collect()
            } else {
                // splitn takes the total number of pieces, not the number of
                // splits.
                let pieces = usize::try_from(maxsplit).unwrap_or(0) + 1;
                input.splitn(pieces, sep).map(str::to_string).collect()
            }
        }
        None => {
            let mut parts: Vec<String> =
                input.split_whitespace().map(str::to_string).collect();
            if maxsplit >= 0 {
                let pieces = usize::try_from(maxsplit).unwrap_or(0) + 1;
                if parts.len() > pieces {
                    // Re-join the tail so that at most `maxsplit` splits
                    // happen, mirroring the usual whitespace-split contract.
                    let tail = parts.split_off(pieces - 1).join(" ");
                    parts.push(tail);
                }
            }
            parts
        }
    };
    Ok(Value::Sequence(parts.into_iter().map(Value::String).collect()))
}
