//! Utility Functions Module
//!
//! Helpers shared across the stack: the [`reason_enum!`](crate::reason_enum)
//! macro and the frame dumps used in trace logging.

mod enum_macros;

/// Longest frame prefix rendered by [`frame_dump`]
pub const FRAME_DUMP_LIMIT: usize = 64;

/// Compact hex rendering of a frame for `trace!` output, truncated to
/// [`FRAME_DUMP_LIMIT`] octets.
pub fn frame_dump(data: &[u8]) -> String {
    if data.len() <= FRAME_DUMP_LIMIT {
        hex::encode(data)
    } else {
        format!(
            "{}... ({} bytes)",
            hex::encode(&data[..FRAME_DUMP_LIMIT]),
            data.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_dump() {
        assert_eq!(frame_dump(&[0x01, 0x04, 0x00]), "010400");

        let long = vec![0xAB; 100];
        let dump = frame_dump(&long);
        assert!(dump.starts_with(&"ab".repeat(FRAME_DUMP_LIMIT)));
        assert!(dump.ends_with("... (100 bytes)"));
    }
}
