//! Hex address parsing and formatting utilities.

use anyhow::Result;

/// Parse a hex address string (with or without 0x prefix).
pub fn parse_hex_address(s: &str) -> Result<u32> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(s, 16).map_err(|e| anyhow::anyhow!("Invalid hex address: {}", e))
}

/// Format bytes as hexdump lines, 16 bytes per line, offsets relative to `start`.
pub fn format_hexdump(start: u32, bytes: &[u8], ascii: bool) -> Vec<String> {
    let mut lines = Vec::new();
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let mut line = format!("0x{:08X}: ", start as usize + i * 16);

        for j in 0..16 {
            if j == 8 {
                line.push(' ');
            }
            match chunk.get(j) {
                Some(byte) => line.push_str(&format!("{:02X} ", byte)),
                None => line.push_str("   "),
            }
        }

        if ascii {
            line.push_str(" |");
            for byte in chunk {
                if (0x20..0x7F).contains(byte) {
                    line.push(*byte as char);
                } else {
                    line.push('.');
                }
            }
            for _ in chunk.len()..16 {
                line.push(' ');
            }
            line.push('|');
        }

        lines.push(line.trim_end().to_string());
    }
    lines
}
