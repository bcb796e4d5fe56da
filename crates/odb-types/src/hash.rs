//! Hash string helpers.
//!
//! Hashes travel as `algo:hex` strings (`sha256:ab12..`, operation hashes
//! as `json:sha256:ab12..`). The raw hash is the hex part.

/// Part after the last `:`, or the whole string when there is none.
pub fn raw_hash(hash: &str) -> &str {
    match hash.rfind(':') {
        Some(pos) if pos > 0 => &hash[pos + 1..],
        _ => hash,
    }
}

/// Superblock identity: block count as 8 hex digits followed by the raw
/// hash of the newest block. Empty for an empty superblock.
pub fn superblock_hash(size: usize, last_block_raw_hash: &str) -> String {
    if size == 0 {
        return String::new();
    }
    format!("{size:08x}{last_block_raw_hash}")
}
