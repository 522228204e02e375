#![forbid(unsafe_code)]

use kmirror_core::{DeltaEvent, EventType, ListPage, MirrorError};
use kmirror_store::{Reconciler, Step};

fn pod(uid: &str, rv: &str) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "uid": uid, "name": uid, "namespace": "default", "resourceVersion": rv,
                      "creationTimestamp": "2020-01-01T00:00:00Z" }
    })
}

fn ev(kind: EventType, object: serde_json::Value) -> DeltaEvent {
    DeltaEvent { kind: Some(kind), object }
}

fn page(items: Vec<serde_json::Value>, rv: &str) -> ListPage {
    serde_json::from_value(serde_json::json!({
        "kind": "PodList", "apiVersion": "v1", "items": items, "metadata": { "resourceVersion": rv }
    }))
    .unwrap()
}

fn versions(step: &Step) -> Vec<(String, String)> {
    match step {
        Step::Push(items) => items
            .iter()
            .map(|r| (r.uid().unwrap().to_string(), r.resource_version().unwrap().to_string()))
            .collect(),
        other => panic!("expected push, got {:?}", other),
    }
}

fn state(rec: &Reconciler) -> Vec<(String, String)> {
    let mut out: Vec<_> = rec
        .table()
        .values()
        .iter()
        .map(|r| (r.uid().unwrap().to_string(), r.resource_version().unwrap_or("").to_string()))
        .collect();
    out.sort();
    out
}

#[test]
fn pod_list_end_to_end() {
    let mut rec = Reconciler::new(None);
    let first = rec.seed(page(vec![], "100"));
    assert!(first.is_empty());
    assert_eq!(rec.cursor(), Some("100"));

    let step = rec.apply(ev(EventType::Added, pod("p1", "101")));
    assert_eq!(versions(&step), vec![("p1".to_string(), "101".to_string())]);

    // Older MODIFIED is dropped without a push.
    let step = rec.apply(ev(EventType::Modified, pod("p1", "99")));
    assert!(matches!(step, Step::Skip));
    assert_eq!(state(&rec), vec![("p1".to_string(), "101".to_string())]);
}

#[test]
fn seed_strips_list_suffix_and_stamps_kind() {
    let mut rec = Reconciler::new(None);
    let items = rec.seed(page(vec![pod("a", "1"), pod("b", "2")], "10"));
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|r| r.kind() == Some("Pod")));
    assert_eq!(items[0].object.types.as_ref().unwrap().api_version, "v1");

    // Watch objects without kind inherit it as well.
    let step = rec.apply(ev(EventType::Added, pod("c", "11")));
    match step {
        Step::Push(items) => {
            let c = items.iter().find(|r| r.uid() == Some("c")).unwrap();
            assert_eq!(c.kind(), Some("Pod"));
            assert_eq!(c.action_type, Some(EventType::Added));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn duplicate_modified_applies_once() {
    let mut rec = Reconciler::new(None);
    rec.seed(page(vec![pod("a", "1")], "1"));
    let m = ev(EventType::Modified, pod("a", "5"));
    assert!(matches!(rec.apply(m.clone()), Step::Push(_)));
    assert!(matches!(rec.apply(m), Step::Skip));
    assert_eq!(state(&rec), vec![("a".to_string(), "5".to_string())]);
}

#[test]
fn equal_version_is_stale() {
    let mut rec = Reconciler::new(None);
    rec.seed(page(vec![pod("a", "7")], "7"));
    assert!(matches!(rec.apply(ev(EventType::Modified, pod("a", "7"))), Step::Skip));
}

#[test]
fn modified_without_version_is_dropped() {
    let mut rec = Reconciler::new(None);
    rec.seed(page(vec![pod("a", "3")], "3"));
    let unversioned = serde_json::json!({ "metadata": { "uid": "a", "name": "a" } });
    assert!(matches!(rec.apply(ev(EventType::Modified, unversioned)), Step::Skip));
    assert_eq!(state(&rec), vec![("a".to_string(), "3".to_string())]);
}

#[test]
fn modified_for_unknown_uid_inserts() {
    let mut rec = Reconciler::new(None);
    rec.seed(page(vec![], "1"));
    let step = rec.apply(ev(EventType::Modified, pod("n", "2")));
    assert_eq!(versions(&step), vec![("n".to_string(), "2".to_string())]);
}

#[test]
fn delete_unknown_is_noop() {
    let mut rec = Reconciler::new(None);
    rec.seed(page(vec![pod("a", "1")], "1"));
    assert!(matches!(rec.apply(ev(EventType::Deleted, pod("ghost", "2"))), Step::Skip));
    assert_eq!(state(&rec), vec![("a".to_string(), "1".to_string())]);

    let step = rec.apply(ev(EventType::Deleted, pod("a", "3")));
    assert!(versions(&step).is_empty());
}

#[test]
fn error_event_is_surfaced_and_not_applied() {
    let mut rec = Reconciler::new(None);
    rec.seed(page(vec![pod("a", "1")], "1"));
    let status = serde_json::json!({ "kind": "Status", "code": 410, "reason": "Expired", "message": "gone" });
    match rec.apply(ev(EventType::Error, status)) {
        Step::Error(MirrorError::Watch { code, reason, .. }) => {
            assert_eq!(code, 410);
            assert_eq!(reason, "Expired");
        }
        other => panic!("unexpected {:?}", other),
    }
    // Reconciliation continues.
    assert!(matches!(rec.apply(ev(EventType::Added, pod("b", "2"))), Step::Push(_)));
}

#[test]
fn bookmark_advances_cursor_only() {
    let mut rec = Reconciler::new(None);
    rec.seed(page(vec![], "1"));
    let bm = serde_json::json!({ "metadata": { "resourceVersion": "42" } });
    assert!(matches!(rec.apply(ev(EventType::Bookmark, bm)), Step::Skip));
    assert_eq!(rec.cursor(), Some("42"));
    assert!(rec.table().is_empty());
}

#[test]
fn untyped_event_counts_as_added() {
    let mut rec = Reconciler::new(None);
    rec.seed(page(vec![], "1"));
    let step = rec.apply(DeltaEvent { kind: None, object: pod("x", "2") });
    assert_eq!(versions(&step).len(), 1);
}

#[test]
fn interleavings_converge() {
    // Per-identity order is fixed; the cross-identity interleaving differs.
    let a = vec![
        ev(EventType::Added, pod("a", "10")),
        ev(EventType::Modified, pod("a", "12")),
        ev(EventType::Modified, pod("a", "15")),
    ];
    let b = vec![
        ev(EventType::Added, pod("b", "11")),
        ev(EventType::Modified, pod("b", "13")),
        ev(EventType::Deleted, pod("b", "14")),
    ];
    let c = vec![ev(EventType::Added, pod("c", "16")), ev(EventType::Modified, pod("c", "17"))];

    let orders: Vec<Vec<DeltaEvent>> = vec![
        a.iter().chain(b.iter()).chain(c.iter()).cloned().collect(),
        c.iter().chain(b.iter()).chain(a.iter()).cloned().collect(),
        vec![&a[0], &b[0], &c[0], &a[1], &b[1], &c[1], &a[2], &b[2]].into_iter().cloned().collect(),
    ];

    let mut finals = Vec::new();
    for events in orders {
        let mut rec = Reconciler::new(None);
        rec.seed(page(vec![], "1"));
        for e in events {
            rec.apply(e);
        }
        finals.push(state(&rec));
    }
    assert_eq!(finals[0], vec![("a".to_string(), "15".to_string()), ("c".to_string(), "17".to_string())]);
    assert!(finals.windows(2).all(|w| w[0] == w[1]), "final states must match: {:?}", finals);
}

#[test]
fn max_size_trims_pushes() {
    let mut rec = Reconciler::new(Some(1));
    let older = serde_json::json!({ "metadata": { "uid": "old", "resourceVersion": "1",
        "creationTimestamp": "2020-01-01T00:00:00Z" } });
    let newer = serde_json::json!({ "metadata": { "uid": "new", "resourceVersion": "2",
        "creationTimestamp": "2020-01-02T00:00:00Z" } });
    rec.seed(page(vec![older], "2"));
    let step = rec.apply(ev(EventType::Added, newer));
    assert_eq!(versions(&step), vec![("new".to_string(), "2".to_string())]);
    // The table still holds both.
    assert_eq!(rec.table().len(), 2);
}

#[test]
fn bad_frames_are_skipped() {
    use kmirror_core::Frame;
    let mut rec = Reconciler::new(None);
    rec.seed(page(vec![], "1"));
    assert!(matches!(rec.apply_frame(Frame::Text("{not json".into())), Step::Skip));
    assert!(matches!(rec.apply_frame(Frame::Json(serde_json::json!({ "type": "ADDED", "object": { "metadata": {} } }))), Step::Skip));
    let good = serde_json::to_string(&serde_json::json!({ "type": "ADDED", "object": pod("z", "3") })).unwrap();
    assert!(matches!(rec.apply_frame(Frame::Text(good)), Step::Push(_)));
}
