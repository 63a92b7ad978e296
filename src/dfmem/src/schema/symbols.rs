//! Version descriptors from `symbols.xml`.

use super::types::StringMap;

/// Information about one supported game version.
#[derive(Debug, Default)]
pub struct VersionInfo {
    /// Human-readable name, e.g. `v0.47.05 linux64`. Encodes the platform
    /// and major series the ABI is selected from.
    pub version_name: String,
    /// Build identifier: 4 big-endian bytes of the PE timestamp, or the
    /// 16-byte MD5 of the executable.
    pub id: Vec<u8>,
    /// Addresses of global objects.
    pub global_addresses: StringMap<usize>,
    /// Addresses of vtables, by class symbol name.
    pub vtable_addresses: StringMap<usize>,
}

/// Parse an integer attribute value, accepting decimal and `0x` hex.
pub(crate) fn parse_uint(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

/// Decode a 32-hex-digit MD5 string into 16 bytes.
pub(crate) fn parse_md5(value: &str) -> Option<[u8; 16]> {
    let value = value.trim();
    if value.len() != 32 {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(value.get(2 * i..2 * i + 2)?, 16).ok()?;
    }
    Some(out)
}
