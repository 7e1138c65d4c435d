//! Shared helpers
//!
//! Quantity parsing, LVM byte formatting and object-name generation.

use crate::error::{Error, Result};
use rand::Rng;
use std::path::Path;

/// LVM physical extent size; every logical volume size is rounded up to it
pub const LVM_EXTENT_BYTES: i64 = 4 * 1024 * 1024;

/// Round a byte count up to a whole number of physical extents
pub fn round_to_extent(bytes: i64) -> i64 {
    if bytes <= LVM_EXTENT_BYTES {
        return LVM_EXTENT_BYTES;
    }
    if bytes % LVM_EXTENT_BYTES == 0 {
        return bytes;
    }
    (bytes / LVM_EXTENT_BYTES + 1) * LVM_EXTENT_BYTES
}

/// Format a byte count as an LVM size argument (e.g. `1073741824B`)
pub fn to_lvm_bytes(bytes: i64) -> String {
    format!("{}B", round_to_extent(bytes))
}

/// Parse an LVM report size printed with `--units B` (e.g. `1073741824B`)
pub fn parse_lvm_bytes(s: &str) -> Result<i64> {
    let trimmed = s.trim();
    let digits = trimmed.strip_suffix('B').unwrap_or(trimmed);
    if digits.is_empty() {
        return Ok(0);
    }
    digits
        .parse::<i64>()
        .map_err(|_| Error::CapacityParse(format!("invalid LVM size: {}", s)))
}

/// Parse a Kubernetes-style quantity ("100Mi", "5k", "1G", "1500m") into an integer.
///
/// The empty string parses to zero. Fractional results are rounded up.
pub fn parse_quantity(s: &str) -> Result<i64> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }

    // Find where the number ends and unit begins
    let mut num_end = 0;
    for (i, c) in s.char_indices() {
        if !c.is_ascii_digit() && c != '.' && !(i == 0 && (c == '+' || c == '-')) {
            num_end = i;
            break;
        }
        num_end = i + 1;
    }

    let num_str = &s[..num_end];
    let unit_str = &s[num_end..];

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number: {}", num_str)))?;
    if num < 0.0 {
        return Err(Error::CapacityParse(format!("negative quantity: {}", s)));
    }

    let multiplier: f64 = match unit_str {
        "" => 1.0,
        "m" => 0.001,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "Pi" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "Ei" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => {
            return Err(Error::CapacityParse(format!(
                "unknown unit: {}",
                unit_str
            )))
        }
    };

    Ok((num * multiplier).ceil() as i64)
}

const NAME_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Generate a lowercase alphanumeric suffix suitable for object names
pub fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())] as char)
        .collect()
}

/// `<prefix>-<6 random chars>`
pub fn generate_name(prefix: &str) -> String {
    format!("{}-{}", prefix, random_suffix(6))
}

/// Create an empty file when it does not exist yet
pub fn touch_file(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(())
}
