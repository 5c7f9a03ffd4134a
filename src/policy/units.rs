//! Parsing of the size and duration strings used in resource and credential
//! sections.

use std::time::Duration;

/// Parse a CPU ceiling ("2", "1.5", "500m") into millicores
pub fn parse_cpu(value: &str) -> Result<u64, String> {
    let value = value.trim();
    if let Some(milli) = value.strip_suffix('m') {
        let n: u64 = milli
            .parse()
            .map_err(|_| format!("invalid cpu value: {}", value))?;
        return positive(n, value);
    }

    let cores: f64 = value
        .parse()
        .map_err(|_| format!("invalid cpu value: {}", value))?;
    if !cores.is_finite() || cores <= 0.0 {
        return Err(format!("cpu must be positive: {}", value));
    }
    Ok((cores * 1000.0).round() as u64)
}

/// Parse a byte size ("512m", "8g", "20Gi", "1048576") into bytes
pub fn parse_size(value: &str) -> Result<u64, String> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let number: f64 = number
        .parse()
        .map_err(|_| format!("invalid size: {}", value))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "ki" | "kib" => 1 << 10,
        "m" | "mb" | "mi" | "mib" => 1 << 20,
        "g" | "gb" | "gi" | "gib" => 1 << 30,
        "t" | "tb" | "ti" | "tib" => 1 << 40,
        _ => return Err(format!("unknown size unit in: {}", value)),
    };

    let bytes = number * multiplier as f64;
    if !bytes.is_finite() || bytes < 1.0 || bytes > u64::MAX as f64 {
        return Err(format!("size out of range: {}", value));
    }
    Ok(bytes as u64)
}

/// Parse a TTL ("15m", "1h 30m") into a non-zero duration
pub fn parse_ttl(value: &str) -> Result<Duration, String> {
    let duration =
        humantime::parse_duration(value.trim()).map_err(|e| format!("{}: {}", value, e))?;
    if duration.is_zero() {
        return Err(format!("duration must be non-zero: {}", value));
    }
    Ok(duration)
}

fn positive(n: u64, raw: &str) -> Result<u64, String> {
    if n == 0 {
        Err(format!("value must be positive: {}", raw))
    } else {
        Ok(n)
    }
}
