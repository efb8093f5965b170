//! Post-mux metadata rewrite.
//!
//! The muxer stamps its own name into the track handler boxes. These are replaced with neutral
//! names in place: same offset, same length, shortfall zero-padded. No box sizes or offsets
//! ever change, so the container stays valid.

/// `(needle, replacement)` pairs. Every replacement is no longer than its needle.
pub const PATCH_TABLE: &[(&[u8], &[u8])] = &[
    (b"MediabunnyVideoHandler", b"VideoHandler"),
    (b"MediabunnySoundHandler", b"SoundHandler"),
];

/// Rewrite the first occurrence of each [`PATCH_TABLE`] needle. Returns how many were applied.
///
/// Absent needles are skipped. The buffer length never changes.
pub fn patch_metadata(data: &mut [u8]) -> usize {
    let mut applied = 0;
    for &(needle, replacement) in PATCH_TABLE {
        if replacement.len() > needle.len() {
            tracing::warn!(
                needle = %String::from_utf8_lossy(needle),
                "replacement longer than needle, skipping"
            );
            continue;
        }
        let Some(at) = find(data, needle) else {
            continue;
        };
        let slot = &mut data[at..at + needle.len()];
        slot[..replacement.len()].copy_from_slice(replacement);
        slot[replacement.len()..].fill(0);
        applied += 1;
    }
    tracing::debug!(applied, "metadata patched");
    applied
}

/// Offset of the first occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
#[path = "../tests/unit/patch.rs"]
mod tests;
