use delver::metrics::{MetricsStore, Observation, ProbeMode, REPORT_HEADER};
use delver::signature::Signature;
use std::sync::Arc;
use std::thread;

fn sig(modifiers: &str, ret: &str, class: &str, name: &str, params: &str) -> Signature {
    Signature::new(modifiers, ret, class, name, params)
}

#[test]
fn concurrent_updates_are_not_lost() {
    let store = MetricsStore::new();
    let hot = sig("public", "void", "com.example.Hot", "run", "()");
    let other = sig("public", "void", "com.example.Hot", "other", "()");

    thread::scope(|s| {
        for t in 0..8u64 {
            let (store, hot, other) = (&store, &hot, &other);
            s.spawn(move || {
                for i in 0..1_000u64 {
                    store.record_call(hot, 0, t + i % 5);
                    if i % 2 == 0 {
                        store.record_hit(other);
                    }
                }
            });
        }
    });

    let hot = store.get(hot.rendered()).unwrap();
    assert_eq!(hot.call_count, 8_000);
    assert_eq!(hot.max, 7 + 4);
    // Per thread: 200 * (0+1+2+3+4) + 1000 * t
    let expected_total: u64 = (0..8u64).map(|t| 2_000 + 1_000 * t).sum();
    assert_eq!(hot.total, expected_total);

    let other = store.get(other.rendered()).unwrap();
    assert_eq!((other.call_count, other.total, other.max), (4_000, 0, 0));
    assert_eq!(store.total_call_count(), 12_000);
}

#[test]
fn clock_going_backwards_counts_as_zero() {
    let store = MetricsStore::new();
    let s = sig("", "void", "A", "a", "()");
    store.record_call(&s, 100, 40);
    let snap = store.get(s.rendered()).unwrap();
    assert_eq!((snap.call_count, snap.total, snap.max), (1, 0, 0));
}

#[test]
fn registered_methods_are_visible_before_any_call() {
    let store = MetricsStore::new();
    let s = sig("public static", "int", "com.example.B", "b", "(int)");
    store.register_known_zero(&s);

    let snap = store.get(s.rendered()).unwrap();
    assert_eq!((snap.call_count, snap.total, snap.max, snap.average()), (0, 0, 0, 0));
    assert_eq!(store.total_call_count(), 0);

    store.record_call(&s, 0, 5);
    // Registering again keeps the counts.
    store.register_known_zero(&s);
    assert_eq!(store.get(s.rendered()).unwrap().call_count, 1);
    assert_eq!(store.len(), 1);
}

#[test]
fn report_lists_every_record_in_call_count_order() {
    let store = MetricsStore::new();
    let a = sig("public", "void", "com.example.A", "a", "()");
    let b = sig("public static", "int", "com.example.B", "b", "(int)");
    let c = sig("private", "java.lang.String", "com.example.C", "c", "()");

    store.register_known_zero(&b);
    store.record_call(&a, 0, 5);
    store.record_call(&a, 3, 10);
    store.record_call(&c, 1, 2);
    store.record_call(&c, 0, 3);

    let mut out = Vec::new();
    store.write_report(&mut out, true).unwrap();
    let expected = [
        REPORT_HEADER,
        "0;0;0;0;public static;int;com.example.B;b;(int)",
        "2;7;6;12;public;void;com.example.A;a;()",
        "2;3;2;4;private;java.lang.String;com.example.C;c;()",
    ];
    assert_eq!(String::from_utf8(out).unwrap(), format!("{}\n", expected.join("\n")));

    let mut rows = Vec::new();
    store.write_report(&mut rows, false).unwrap();
    assert!(!String::from_utf8(rows).unwrap().contains(REPORT_HEADER));
}

#[test]
fn rendered_reports_create_or_update_records() {
    let store = MetricsStore::new();
    store.record_rendered("public;void;com.example.A;a;()", Observation::Elapsed(4));
    store.record_rendered("public;void;com.example.A;a;()", Observation::Hit);

    let snap = store.get("public;void;com.example.A;a;()").unwrap();
    assert_eq!((snap.call_count, snap.total, snap.max), (2, 4, 4));
    assert_eq!(snap.signature.method_name(), "a");
    assert_eq!(snap.signature.declaring_type(), "com.example.A");

    // Not a signature: dropped.
    store.record_rendered("garbage", Observation::Hit);
    assert_eq!(store.len(), 1);
}

#[test]
fn snapshot_is_a_copy() {
    let store = MetricsStore::new();
    let s = sig("", "void", "A", "a", "()");
    store.record_hit(&s);
    let before = store.snapshot();
    store.record_hit(&s);
    assert_eq!(before[0].call_count, 1);
    assert_eq!(store.snapshot()[0].call_count, 2);
}

#[test]
fn probe_mode_names() {
    assert_eq!(ProbeMode::parse("count"), Some(ProbeMode::Count));
    assert_eq!(ProbeMode::parse(" Timing "), Some(ProbeMode::Timing));
    assert_eq!(ProbeMode::parse("sampling"), None);
    assert_eq!(ProbeMode::default(), ProbeMode::Timing);
}

#[test]
fn installed_store_becomes_the_global_one() {
    let store = Arc::new(MetricsStore::new());
    MetricsStore::install(store.clone()).unwrap();
    assert!(Arc::ptr_eq(&MetricsStore::global(), &store));

    let second = Arc::new(MetricsStore::new());
    let rejected = MetricsStore::install(second.clone()).unwrap_err();
    assert!(Arc::ptr_eq(&rejected, &second));
    assert!(Arc::ptr_eq(&MetricsStore::global(), &store));
}
