//! Integration tests for the runtime core: timers, weak references,
//! message plumbing and lifecycle

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tether_core::{Core, CoreOptions, MessageEmitter, Stage, Value};

fn new_core() -> Core {
    let _ = env_logger::builder().is_test(true).try_init();
    Core::new(CoreOptions::default())
}

#[test]
fn test_timer_cancel_race() {
    let core = new_core();
    let fired = Arc::new(AtomicUsize::new(0));

    let id = {
        let fired = Arc::clone(&fired);
        let mut scope = core.enter();
        let func = scope.alloc_callable(move |_, _| {
            fired.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Undefined)
        });
        scope.set_timeout(func, 20)
    };

    // Cancel immediately, well inside the 20ms window.
    assert!(core.enter().clear_timer(id));

    thread::sleep(Duration::from_millis(60));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    // The id is spent: a fresh callback gets a larger id.
    let next_id = {
        let mut scope = core.enter();
        let func = scope.alloc_callable(|_, _| Ok(Value::Undefined));
        scope.set_timeout(func, 0)
    };
    assert!(next_id > id);
}

#[test]
fn test_weak_ref_gc_scenario() {
    let core = new_core();
    let notified = Arc::new(AtomicUsize::new(0));

    let mut scope = core.enter();
    let target = scope.heap().alloc_seq(vec![Value::Number(1.0)]);
    let callback = {
        let notified = Arc::clone(&notified);
        scope.alloc_callable(move |_, _| {
            notified.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Undefined)
        })
    };
    scope.weak_bind(&Value::Seq(target), callback).unwrap();

    // Still strongly protected: no notification.
    scope.gc();
    assert_eq!(notified.load(Ordering::SeqCst), 0);

    // Drop the last strong reference and collect: exactly one
    // notification.
    scope.heap().unprotect(target);
    scope.gc();
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    scope.gc();
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}

#[test]
fn test_weak_ref_survives_until_unload() {
    let core = new_core();
    let notified = Arc::new(AtomicUsize::new(0));

    {
        let mut scope = core.enter();
        let target = scope.heap().alloc_str("pinned for the script's life");
        let callback = {
            let notified = Arc::clone(&notified);
            scope.alloc_callable(move |_, _| {
                notified.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Undefined)
            })
        };
        scope.weak_bind(&Value::Str(target), callback).unwrap();
        scope.gc();
    }
    assert_eq!(notified.load(Ordering::SeqCst), 0);

    // Unloading the runtime with a live binding fires it exactly once.
    core.flush();
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    core.dispose();
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}

#[test]
fn test_sink_runs_before_wait_unblocks() {
    let core = new_core();
    let delivered = Arc::new(AtomicUsize::new(0));

    let sink = {
        let delivered = Arc::clone(&delivered);
        core.enter().alloc_callable(move |_, _| {
            delivered.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Undefined)
        })
    };
    core.enter().set_incoming_message_callback(Some(sink));

    let observed = {
        let core = core.clone();
        let delivered = Arc::clone(&delivered);
        thread::spawn(move || {
            let mut scope = core.enter();
            scope.wait_for_event();
            // By the time the wait unblocks, the sink has run.
            delivered.load(Ordering::SeqCst)
        })
    };

    thread::sleep(Duration::from_millis(30));
    core.post_message("{}");

    assert_eq!(observed.join().unwrap(), 1);
}

#[test]
fn test_post_message_after_dispose_is_noop() {
    let core = new_core();
    let delivered = Arc::new(AtomicUsize::new(0));

    let sink = {
        let delivered = Arc::clone(&delivered);
        core.enter().alloc_callable(move |_, _| {
            delivered.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Undefined)
        })
    };
    core.enter().set_incoming_message_callback(Some(sink));

    core.dispose();
    core.post_message("{}");
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
}

#[test]
fn test_emitted_messages_reach_host() {
    let sent = Arc::new(Mutex::new(Vec::<String>::new()));
    let emitter: MessageEmitter = {
        let sent = Arc::clone(&sent);
        Box::new(move |message, _| sent.lock().unwrap().push(message.to_string()))
    };
    let core = Core::new(CoreOptions {
        emitter: Some(emitter),
        ..Default::default()
    });

    // A timer callback emits from the interpreter thread.
    {
        let mut scope = core.enter();
        let func = scope.alloc_callable(|scope, _| {
            scope.send(r#"{"type":"tick"}"#, None);
            Ok(Value::Undefined)
        });
        scope.set_timeout(func, 5);
    }

    thread::sleep(Duration::from_millis(60));
    assert_eq!(sent.lock().unwrap().as_slice(), [r#"{"type":"tick"}"#]);
}

#[test]
fn test_script_metadata_surface() {
    let payload = r#"{"version":3}"#;
    let encoded = data_encoding_test_helper(payload);
    let core = Core::new(CoreOptions {
        script_name: "probe".into(),
        script_source: format!(
            "send(1);\n//# sourceMappingURL=data:application/json;base64,{}",
            encoded
        ),
        emitter: None,
    });

    assert_eq!(core.meta().file_name(), "probe.js");
    assert_eq!(core.meta().source_map_data().as_deref(), Some(payload));
}

fn data_encoding_test_helper(payload: &str) -> String {
    // Minimal standalone base64 so the test does not re-derive the
    // implementation's own encoder.
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let bytes = payload.as_bytes();
    let mut out = String::new();
    for chunk in bytes.chunks(3) {
        let b = [
            chunk[0],
            chunk.get(1).copied().unwrap_or(0),
            chunk.get(2).copied().unwrap_or(0),
        ];
        let n = ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32;
        out.push(ALPHABET[(n >> 18) as usize & 0x3f] as char);
        out.push(ALPHABET[(n >> 12) as usize & 0x3f] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(n >> 6) as usize & 0x3f] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[n as usize & 0x3f] as char
        } else {
            '='
        });
    }
    out
}

#[test]
fn test_flush_is_reversible() {
    let core = new_core();
    core.flush();
    assert_eq!(core.stage(), Stage::Flushed);

    // Scheduling after a flush works again.
    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = Arc::clone(&fired);
        let mut scope = core.enter();
        let func = scope.alloc_callable(move |_, _| {
            fired.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Undefined)
        });
        scope.set_timeout(func, 5);
    }
    assert_eq!(core.stage(), Stage::Initialized);

    thread::sleep(Duration::from_millis(60));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dispose_cancels_outstanding_timers() {
    let core = new_core();
    let fired = Arc::new(AtomicUsize::new(0));

    {
        let fired = Arc::clone(&fired);
        let mut scope = core.enter();
        let func = scope.alloc_callable(move |_, _| {
            fired.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Undefined)
        });
        scope.set_timeout(func, 30);
        scope.set_interval(func, 10);
    }

    core.dispose();
    thread::sleep(Duration::from_millis(80));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    core.finalize();
    assert_eq!(core.stage(), Stage::Finalized);
}
