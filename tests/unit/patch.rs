use super::*;

fn container(parts: &[&[u8]]) -> Vec<u8> {
    parts.concat()
}

#[test]
fn replacements_fit_their_needles() {
    for (needle, replacement) in PATCH_TABLE {
        assert!(replacement.len() <= needle.len());
        assert!(!needle.is_empty());
    }
}

#[test]
fn rewrites_handler_names_in_place() {
    let mut data = container(&[
        b"\0\0\0\x18ftypisom",
        b"hdlrvide",
        b"MediabunnyVideoHandler\0",
        b"hdlrsoun",
        b"MediabunnySoundHandler\0",
        b"tail",
    ]);
    let len = data.len();

    assert_eq!(patch_metadata(&mut data), 2);
    assert_eq!(data.len(), len);

    let expected = container(&[
        b"\0\0\0\x18ftypisom",
        b"hdlrvide",
        b"VideoHandler\0\0\0\0\0\0\0\0\0\0\0",
        b"hdlrsoun",
        b"SoundHandler\0\0\0\0\0\0\0\0\0\0\0",
        b"tail",
    ]);
    assert_eq!(data, expected);
}

#[test]
fn only_first_occurrence_is_rewritten() {
    let mut data = container(&[b"MediabunnyVideoHandler", b"--", b"MediabunnyVideoHandler"]);
    assert_eq!(patch_metadata(&mut data), 1);
    assert!(data.starts_with(b"VideoHandler\0"));
    assert!(data.ends_with(b"--MediabunnyVideoHandler"));
}

#[test]
fn missing_needles_leave_data_untouched() {
    let original = b"plain bytes with no handlers in them".to_vec();
    let mut data = original.clone();
    assert_eq!(patch_metadata(&mut data), 0);
    assert_eq!(data, original);

    let mut empty: Vec<u8> = Vec::new();
    assert_eq!(patch_metadata(&mut empty), 0);
}

#[test]
fn patching_twice_is_a_no_op() {
    let mut data = container(&[b"xxMediabunnySoundHandleryy"]);
    assert_eq!(patch_metadata(&mut data), 1);
    let once = data.clone();
    assert_eq!(patch_metadata(&mut data), 0);
    assert_eq!(data, once);
}

#[test]
fn needle_at_buffer_end() {
    let mut data = container(&[b"abc", b"MediabunnyVideoHandler"]);
    assert_eq!(patch_metadata(&mut data), 1);
    assert_eq!(&data[..15], b"abcVideoHandler");
    assert!(data[15..].iter().all(|&b| b == 0));
}
