//! Helpers shared by the CLI and the Kafka transport
//!
//! Human-readable size and duration parsing, byte formatting for reports, and
//! CRC verification of fetched record batches.

use anyhow::{anyhow, Result};
use std::time::Duration;
use tracing::debug;

/// Formats a byte count into a human-readable string (KB, MB, GB)
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Parses a byte size such as "64", "1KB" or "0.5MB"
pub fn parse_bytes(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();

    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    let numeric_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());

    let (num_str, unit) = s.split_at(numeric_end);
    let num: f64 = num_str
        .parse()
        .map_err(|_| anyhow!("Invalid number in size: {}", s))?;

    let multiplier = match unit.trim() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => KB,
        "M" | "MB" | "MIB" => MB,
        _ => return Err(anyhow!("Unknown unit in size: {}", unit)),
    };

    Ok((num * multiplier as f64) as u64)
}

/// Parses a duration such as "250ms", "1s", "2m", "1.5s" or bare seconds ("3")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    let numeric_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());

    let (num_str, unit) = s.split_at(numeric_end);
    let num: f64 = num_str
        .parse()
        .map_err(|_| anyhow!("Invalid number in duration: {}", s))?;

    let seconds = match unit.trim() {
        "" | "s" | "sec" | "secs" => num,
        "ms" => num / 1000.0,
        "m" | "min" | "mins" => num * 60.0,
        _ => return Err(anyhow!("Unknown unit in duration: {}", unit)),
    };

    Duration::try_from_secs_f64(seconds).map_err(|e| anyhow!("Invalid duration {}: {}", s, e))
}

/// Whether `data` begins with a record batch that was cut short
///
/// Fetch responses are capped by max bytes, so the last batch in a partition's
/// payload may be incomplete. A negative length is corruption, not truncation.
pub fn is_truncated_batch(data: &[u8]) -> bool {
    if data.len() < 12 {
        return true;
    }
    let batch_length = i32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    batch_length >= 0 && data.len() < 12 + batch_length as usize
}

/// Verify CRC32-C of a Kafka record batch
///
/// Kafka record batch format (v2):
/// - baseOffset: int64 (8 bytes) - offset 0
/// - batchLength: int32 (4 bytes) - offset 8
/// - partitionLeaderEpoch: int32 (4 bytes) - offset 12
/// - magic: int8 (1 byte) - offset 16
/// - crc: int32 (4 bytes) - offset 17
/// - attributes onwards: covered by CRC - offset 21
///
/// Returns the total size of the batch when the CRC matches.
pub fn verify_record_batch_crc(data: &[u8]) -> Result<usize> {
    if data.len() < 21 {
        return Err(anyhow!("Incomplete record batch header: {} bytes", data.len()));
    }

    let batch_length = i32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    if batch_length < 0 {
        return Err(anyhow!("Negative record batch length: {}", batch_length));
    }

    let total_batch_size = 12 + batch_length as usize;
    if data.len() < total_batch_size {
        return Err(anyhow!(
            "Incomplete record batch: expected {} bytes, got {}",
            total_batch_size,
            data.len()
        ));
    }

    let magic = data[16];
    if magic != 2 {
        debug!("Skipping CRC check for magic version {}", magic);
        return Ok(total_batch_size);
    }

    let stored_crc = u32::from_be_bytes([data[17], data[18], data[19], data[20]]);
    let computed_crc = crc32c::crc32c(&data[21..total_batch_size]);

    if stored_crc != computed_crc {
        return Err(anyhow!(
            "CRC mismatch: stored=0x{:08x}, computed=0x{:08x}",
            stored_crc,
            computed_crc
        ));
    }

    Ok(total_batch_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 bytes");
        assert_eq!(format_bytes(1023), "1023 bytes");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1610612736), "1.50 GB");
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("64").unwrap(), 64);
        assert_eq!(parse_bytes("1kb").unwrap(), 1024);
        assert_eq!(parse_bytes(" 1 KB ").unwrap(), 1024);
        assert_eq!(parse_bytes("0.5MB").unwrap(), 512 * 1024);
        assert!(parse_bytes("abc").is_err());
        assert!(parse_bytes("1XB").is_err());
        assert!(parse_bytes("").is_err());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration(" 10S ").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("5h").is_err());
        assert!(parse_duration("1.2.3s").is_err());
    }

    #[test]
    fn test_crc_rejects_short_and_corrupt_batches() {
        assert!(verify_record_batch_crc(&[0u8; 10]).is_err());

        // 12-byte prefix + 9 header bytes + 4 payload bytes
        let mut batch = vec![0u8; 25];
        batch[8..12].copy_from_slice(&13i32.to_be_bytes());
        batch[16] = 2;
        batch[21..25].copy_from_slice(b"data");
        let crc = crc32c::crc32c(&batch[21..25]);
        batch[17..21].copy_from_slice(&crc.to_be_bytes());
        assert_eq!(verify_record_batch_crc(&batch).unwrap(), 25);

        batch[24] ^= 0xff;
        let err = verify_record_batch_crc(&batch).unwrap_err();
        assert!(err.to_string().starts_with("CRC mismatch"));
    }

    #[test]
    fn test_crc_reports_incomplete_batch() {
        let mut batch = vec![0u8; 30];
        batch[8..12].copy_from_slice(&100i32.to_be_bytes());
        batch[16] = 2;
        let err = verify_record_batch_crc(&batch).unwrap_err();
        assert!(err.to_string().starts_with("Incomplete"));
    }

    #[test]
    fn test_truncated_batch_detection() {
        assert!(is_truncated_batch(&[0u8; 5]));

        let mut batch = vec![0u8; 30];
        batch[8..12].copy_from_slice(&100i32.to_be_bytes());
        assert!(is_truncated_batch(&batch));

        batch[8..12].copy_from_slice(&18i32.to_be_bytes());
        assert!(!is_truncated_batch(&batch));

        batch[8..12].copy_from_slice(&(-1i32).to_be_bytes());
        assert!(!is_truncated_batch(&batch));
    }
}
