use super::*;

#[test]
fn begin_bumps_generation_and_clears_abort() {
    let mut s = RenderSession::new();
    assert_eq!(s.state(), SessionState::Idle);
    assert_eq!(s.generation(), 0);

    let g1 = s.begin();
    assert_eq!(g1, 1);
    assert!(!s.is_stale(g1));

    s.abort();
    assert!(s.is_stale(g1));

    let g2 = s.begin();
    assert_eq!(g2, 2);
    assert!(!s.is_stale(g2));
    // The superseded generation stays stale even though the abort flag was reset.
    assert!(s.is_stale(g1));
}

#[test]
fn frames_progress_spans_five_to_ninety() {
    assert_eq!(frames_progress(0, 100), 5);
    assert_eq!(frames_progress(1, 100), 5);
    assert_eq!(frames_progress(50, 100), 47);
    assert_eq!(frames_progress(100, 100), 90);
    assert_eq!(frames_progress(500, 100), 90);
    assert_eq!(frames_progress(0, 0), 90);
}

#[test]
fn frames_progress_is_non_decreasing() {
    let total = 37;
    let mut last = 0;
    for done in 1..=total {
        let p = frames_progress(done, total);
        assert!(p >= last);
        last = p;
    }
    assert_eq!(last, 90);
}
