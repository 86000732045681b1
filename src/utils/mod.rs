pub mod runner;

use thiserror::Error;

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;

/// Human readable size with the largest unit the value reaches (B, KB, MB, GB).
pub fn format_bytes(bytes: u64) -> String {
    if bytes < KIB {
        format!("{} B", bytes)
    } else if bytes < MIB {
        format!("{:.1} KB", bytes as f64 / KIB as f64)
    } else if bytes < GIB {
        format!("{:.1} MB", bytes as f64 / MIB as f64)
    } else {
        format!("{:.1} GB", bytes as f64 / GIB as f64)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ByteCountError {
    #[error("byte count is empty")]
    Empty,
    #[error("byte count cannot be negative: {0}")]
    Negative(String),
    #[error("invalid byte count: {0}")]
    Malformed(String),
}

/// Validates a textual byte count before it reaches [`format_bytes`].
pub fn parse_byte_count(text: &str) -> Result<u64, ByteCountError> {
    let t = text.trim();
    if t.is_empty() {
        return Err(ByteCountError::Empty);
    }
    if let Some(rest) = t.strip_prefix('-') {
        if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ByteCountError::Negative(t.to_string()));
        }
    }
    if !t.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ByteCountError::Malformed(t.to_string()));
    }
    t.parse::<u64>().map_err(|_| ByteCountError::Malformed(t.to_string()))
}
