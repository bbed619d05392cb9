//! Wire encoding of one series point.
//!
//! `"<epoch_ms>:<value>"`, where an empty value segment stands for a missing
//! value: `"60000:512"`, `"120000:"`.

use homewatch_types::PointError;

pub fn serialize_point(ts: i64, value: Option<i64>) -> String {
    match value {
        Some(value) => format!("{ts}:{value}"),
        None => format!("{ts}:"),
    }
}

pub fn deserialize_point(raw: &str) -> Result<(i64, Option<i64>), PointError> {
    let malformed = || PointError::Malformed(raw.to_string());

    let (ts, value) = raw.split_once(':').ok_or_else(malformed)?;
    if value.contains(':') {
        return Err(malformed());
    }
    let ts = ts.parse::<i64>().map_err(|_| malformed())?;
    let value = if value.is_empty() {
        None
    } else {
        Some(value.parse::<i64>().map_err(|_| malformed())?)
    };
    Ok((ts, value))
}
