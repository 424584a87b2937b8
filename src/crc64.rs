//! CRC-64 fingerprint.
//!
//! Used only to detect redundant fuzz inputs for the diversity table; the
//! choice of polynomial is not observable outside that metric. This
//! implementation uses CRC-64/XZ (the reflected ECMA-182 polynomial, same
//! one `xz`/`btrfs` use), built as a 256-entry lookup table rather than a
//! naive per-bit loop.

const POLY: u64 = 0xC96C_5795_D787_0F42;

fn build_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 == 1 { (crc >> 1) ^ POLY } else { crc >> 1 };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Computes the CRC-64/XZ checksum of `bytes`.
pub fn crc64(bytes: &[u8]) -> u64 {
    static TABLE: std::sync::OnceLock<[u64; 256]> = std::sync::OnceLock::new();
    let table = TABLE.get_or_init(build_table);

    let mut crc = !0u64;
    for &b in bytes {
        let idx = ((crc ^ b as u64) & 0xff) as usize;
        crc = table[idx] ^ (crc >> 8);
    }
    !crc
}
