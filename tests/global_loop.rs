mod common;

use common::{serial, MockEngine, DECRYPT_OK};
use pgme::{wait, Data, Error};

#[test]
fn global_loop_drives_several_contexts() {
    let _guard = serial();
    let fast = MockEngine::new(DECRYPT_OK);
    let slow = MockEngine::new(&format!("sleep 1\n{}", DECRYPT_OK));
    let ctx_fast = fast.context();
    let ctx_slow = slow.context();

    let out_fast = Data::new();
    let out_slow = Data::new();
    ctx_slow
        .decrypt_start(&Data::from_bytes(&b"slow"[..]), &out_slow)
        .unwrap();
    ctx_fast
        .decrypt_start(&Data::from_bytes(&b"fast"[..]), &out_fast)
        .unwrap();

    let first = wait(None, true).unwrap().unwrap();
    assert!(first.status.is_ok());
    let second = wait(None, true).unwrap().unwrap();
    assert!(second.status.is_ok());
    assert!(wait(None, true).unwrap().is_none());

    assert_eq!(out_fast.to_vec().unwrap(), b"fast");
    assert_eq!(out_slow.to_vec().unwrap(), b"slow");
    assert_eq!(
        ctx_fast.decrypt_result().unwrap().recipients[0].keyid,
        "1111222233334444"
    );
    assert!(ctx_slow.decrypt_result().is_some());
}

#[test]
fn waiting_on_one_context_leaves_the_others_running() {
    let _guard = serial();
    let quick = MockEngine::new(DECRYPT_OK);
    let stuck = MockEngine::new("exec sleep 10");
    let ctx_quick = quick.context();
    let ctx_stuck = stuck.context();

    ctx_stuck
        .decrypt_start(&Data::from_bytes(&b"x"[..]), &Data::new())
        .unwrap();
    ctx_quick
        .decrypt_start(&Data::from_bytes(&b"y"[..]), &Data::new())
        .unwrap();

    let finished = wait(Some(&ctx_quick), true).unwrap().unwrap();
    assert!(finished.status.is_ok());

    // Only the stuck context is left; cancel it and collect it globally.
    assert!(wait(None, false).unwrap().is_none());
    ctx_stuck.cancel().unwrap();
    let finished = wait(None, true).unwrap().unwrap();
    assert!(matches!(finished.status, Err(Error::Canceled)));
    assert!(wait(None, false).unwrap().is_none());
}

#[test]
fn nothing_to_wait_for() {
    let _guard = serial();
    assert!(wait(None, true).unwrap().is_none());
    let ctx = pgme::Context::new().unwrap();
    assert!(wait(Some(&ctx), true).unwrap().is_none());
}
