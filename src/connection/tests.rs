use super::*;
use crate::error::INVOCATION_FAILED;
use crate::store::MemoryStore;
use crate::stream::{MockStream, StatusKind};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

type Results = Arc<Mutex<Vec<StubResult>>>;

struct Harness {
    conn: Connection,
    stream: MockStream,
}

fn quiet_options() -> ConnectionOptions {
    ConnectionOptions {
        heartbeat_interval_ms: 0,
        buffered_writes_interval_ms: 0,
        ..ConnectionOptions::default()
    }
}

fn harness() -> Harness {
    harness_with(quiet_options(), ConnectionHooks::default())
}

fn harness_with(options: ConnectionOptions, hooks: ConnectionHooks) -> Harness {
    let stream = MockStream::new();
    let conn = Connection::new(Box::new(stream.clone()), options, hooks).unwrap();
    Harness { conn, stream }
}

impl Harness {
    fn connect(&mut self, session: &str) {
        self.conn.on_reset().unwrap();
        self.deliver(json!({"msg": "connected", "session": session}));
    }

    /// Drop the link and open a new one, without the `connected` reply.
    fn reset(&mut self) {
        self.conn.on_disconnect();
        self.conn.on_reset().unwrap();
    }

    fn deliver(&mut self, msg: Value) {
        self.conn.on_message(&msg.to_string()).unwrap();
    }

    fn sent(&self) -> Vec<Value> {
        self.stream.take_sent()
    }

    fn result(&mut self, id: &str, result: Value) {
        self.deliver(json!({"msg": "result", "id": id, "result": result}));
    }

    fn updated(&mut self, ids: &[&str]) {
        self.deliver(json!({"msg": "updated", "methods": ids}));
    }
}

fn kinds(frames: &[Value]) -> Vec<&str> {
    frames.iter().filter_map(|f| f["msg"].as_str()).collect()
}

fn recorder(results: &Results) -> Option<MethodCallback> {
    let results = results.clone();
    Some(Box::new(move |r: StubResult| results.lock().push(r)))
}

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

// ── Method lifecycle ────────────────────────────────────────────

#[test]
fn callback_fires_once_when_result_arrives_first() {
    let mut h = harness();
    h.connect("s1");
    h.sent();

    let results = Results::default();
    h.conn.call("m", vec![json!(1)], recorder(&results)).unwrap();
    let frames = h.sent();
    assert_eq!(frames[0]["msg"], "method");
    assert_eq!(frames[0]["id"], "1");
    assert_eq!(frames[0]["params"], json!([1]));

    h.result("1", json!(5));
    assert!(results.lock().is_empty());
    h.updated(&["1"]);
    assert_eq!(results.lock().as_slice(), &[Ok(json!(5))]);
    assert_eq!(h.conn.outstanding_methods(), 0);
}

#[test]
fn callback_fires_once_when_data_arrives_first() {
    let mut h = harness();
    h.connect("s1");

    let results = Results::default();
    h.conn.call("m", vec![], recorder(&results)).unwrap();
    h.updated(&["1"]);
    assert!(results.lock().is_empty());
    h.result("1", json!("done"));
    assert_eq!(results.lock().as_slice(), &[Ok(json!("done"))]);

    // A duplicate result for a finished method is ignored.
    h.result("1", json!("again"));
    assert_eq!(results.lock().len(), 1);
}

#[test]
fn server_error_reaches_callback() {
    let mut h = harness();
    h.connect("s1");

    let results = Results::default();
    h.conn.call("m", vec![], recorder(&results)).unwrap();
    h.deliver(json!({"msg": "result", "id": "1", "error": {"error": 403, "reason": "denied"}}));
    h.updated(&["1"]);
    assert_eq!(
        results.lock().as_slice(),
        &[Err(MethodError::new(403, "denied"))]
    );
}

#[test]
fn wait_method_runs_alone() {
    let mut h = harness();
    h.connect("s1");
    h.sent();

    let results = Results::default();
    h.conn.call("a", vec![], recorder(&results)).unwrap();
    h.conn
        .apply("b", vec![], MethodOptions::new().with_wait(), recorder(&results))
        .unwrap();
    h.conn.call("c", vec![], recorder(&results)).unwrap();

    let frames = h.sent();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["method"], "a");

    h.result("1", json!("a"));
    h.updated(&["1"]);
    let frames = h.sent();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["method"], "b");

    h.result("2", json!("b"));
    assert!(h.sent().is_empty());
    h.updated(&["2"]);
    let frames = h.sent();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["method"], "c");

    h.result("3", json!("c"));
    h.updated(&["3"]);
    assert_eq!(
        results.lock().as_slice(),
        &[Ok(json!("a")), Ok(json!("b")), Ok(json!("c"))]
    );
}

#[test]
fn data_held_while_wait_method_outstanding() {
    let mut h = harness();
    h.connect("s1");
    let store = MemoryStore::shared();
    h.conn.register_store("docs", Box::new(store.clone()));

    h.conn
        .apply("login", vec![], MethodOptions::new().with_wait(), None)
        .unwrap();
    h.deliver(json!({"msg": "added", "collection": "docs", "id": "x", "fields": {"n": 1}}));
    assert_eq!(store.lock().count(), 0);

    h.result("1", Value::Null);
    h.updated(&["1"]);
    assert_eq!(store.lock().count(), 1);
}

// ── Stubs and reconciliation ────────────────────────────────────

fn inserting_stub(store: &Arc<Mutex<MemoryStore>>, fail: bool) -> Stub {
    let store = store.clone();
    Stub::sync(move |_inv: &MethodInvocation, _args: Vec<Value>| {
        store.lock().insert(doc(json!({"_id": "x", "fromStub": 1})));
        if fail {
            Err(MethodError::new("stub-failed", "stub refused"))
        } else {
            Ok(json!("simulated"))
        }
    })
}

#[test]
fn server_version_replaces_stub_write() {
    let mut h = harness();
    h.connect("s1");
    let store = MemoryStore::shared();
    h.conn.register_store("docs", Box::new(store.clone()));
    h.conn
        .methods([("insert".to_string(), inserting_stub(&store, false))])
        .unwrap();

    let results = Results::default();
    let value = h
        .conn
        .apply(
            "insert",
            vec![],
            MethodOptions::new().with_return_stub_value(),
            recorder(&results),
        )
        .unwrap();
    assert_eq!(value, Some(json!("simulated")));
    assert_eq!(store.lock().get("x").unwrap()["fromStub"], json!(1));

    // The server's copy is tracked, not shown, until the method is done.
    h.deliver(json!({"msg": "added", "collection": "docs", "id": "x", "fields": {"other": 1}}));
    assert_eq!(store.lock().get("x").unwrap()["fromStub"], json!(1));

    h.result("1", Value::Null);
    h.updated(&["1"]);
    assert_eq!(
        Value::Object(store.lock().get("x").unwrap().clone()),
        json!({"_id": "x", "other": 1})
    );
    assert_eq!(results.lock().len(), 1);
}

#[test]
fn unconfirmed_stub_write_is_reverted() {
    let mut h = harness();
    h.connect("s1");
    let store = MemoryStore::shared();
    h.conn.register_store("docs", Box::new(store.clone()));
    h.conn
        .methods([("insert".to_string(), inserting_stub(&store, false))])
        .unwrap();

    h.conn.call("insert", vec![], None).unwrap();
    assert_eq!(store.lock().count(), 1);
    h.updated(&["1"]);
    assert_eq!(store.lock().count(), 0);
}

#[test]
fn thrown_stub_error_aborts_the_call() {
    let mut h = harness();
    h.connect("s1");
    h.sent();
    let store = MemoryStore::shared();
    h.conn.register_store("docs", Box::new(store.clone()));
    h.conn
        .methods([("insert".to_string(), inserting_stub(&store, true))])
        .unwrap();

    let err = h
        .conn
        .apply(
            "insert",
            vec![],
            MethodOptions::new().with_throw_stub_exceptions(),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, DdpError::Stub(ref e) if e.code() == Some("stub-failed")));
    assert!(h.sent().is_empty());
    assert_eq!(store.lock().count(), 0);
    assert_eq!(h.conn.outstanding_methods(), 0);
}

#[test]
fn swallowed_stub_error_still_sends() {
    let mut h = harness();
    h.connect("s1");
    h.sent();
    let store = MemoryStore::shared();
    h.conn.register_store("docs", Box::new(store.clone()));
    h.conn
        .methods([("insert".to_string(), inserting_stub(&store, true))])
        .unwrap();

    h.conn.call("insert", vec![], None).unwrap();
    assert_eq!(kinds(&h.sent()), vec!["method"]);
}

#[test]
fn random_seed_sent_only_when_used() {
    let mut h = harness();
    h.connect("s1");
    h.sent();
    let seeds = Arc::new(Mutex::new(Vec::new()));
    let s = seeds.clone();
    h.conn
        .methods([
            (
                "seeded".to_string(),
                Stub::sync(move |inv: &MethodInvocation, _args: Vec<Value>| {
                    s.lock().push(inv.random_seed());
                    Ok(Value::Null)
                }),
            ),
            (
                "plain".to_string(),
                Stub::sync(|_inv: &MethodInvocation, _args: Vec<Value>| Ok(Value::Null)),
            ),
        ])
        .unwrap();

    h.conn.call("seeded", vec![], None).unwrap();
    h.conn.call("plain", vec![], None).unwrap();
    let frames = h.sent();
    assert_eq!(frames[0]["randomSeed"], json!(seeds.lock()[0]));
    assert!(frames[1].get("randomSeed").is_none());
}

#[test]
fn stub_can_change_user() {
    let mut h = harness();
    h.connect("s1");
    h.conn
        .methods([(
            "login".to_string(),
            Stub::sync(|inv: &MethodInvocation, _args: Vec<Value>| {
                assert!(inv.is_simulation());
                inv.set_user_id(Some("u1".into()));
                Ok(Value::Null)
            }),
        )])
        .unwrap();
    h.conn.call("login", vec![], None).unwrap();
    assert_eq!(h.conn.user_id(), Some("u1"));
}

#[test]
fn duplicate_stub_registration_fails() {
    let mut h = harness();
    let noop = || Stub::sync(|_inv: &MethodInvocation, _args: Vec<Value>| Ok(Value::Null));
    h.conn.methods([("a".to_string(), noop())]).unwrap();
    let err = h
        .conn
        .methods([("b".to_string(), noop()), ("a".to_string(), noop())])
        .unwrap_err();
    assert_eq!(err.to_string(), "A method named 'a' is already defined");
    assert!(!h.conn.stubs().contains("b"));
}

// ── Reconnect ───────────────────────────────────────────────────

#[test]
fn no_retry_method_fails_and_others_are_resent() {
    let mut h = harness();
    h.connect("s1");

    let fragile = Results::default();
    let sturdy = Results::default();
    h.conn
        .apply("a", vec![], MethodOptions::new().with_no_retry(), recorder(&fragile))
        .unwrap();
    h.conn.call("b", vec![], recorder(&sturdy)).unwrap();
    h.sent();

    h.reset();
    let frames = h.sent();
    assert_eq!(kinds(&frames), vec!["connect", "method"]);
    assert_eq!(frames[0]["session"], "s1");
    assert_eq!(frames[1]["id"], "2");
    assert_eq!(frames[1]["method"], "b");

    h.deliver(json!({"msg": "connected", "session": "s2"}));
    h.result("2", json!("ok"));
    h.updated(&["2"]);

    let fragile = fragile.lock();
    assert_eq!(fragile.len(), 1);
    assert_eq!(
        fragile[0].as_ref().unwrap_err().code(),
        Some(INVOCATION_FAILED)
    );
    assert_eq!(sturdy.lock().as_slice(), &[Ok(json!("ok"))]);
    assert_eq!(h.conn.outstanding_methods(), 0);
}

#[test]
fn reconnect_hook_methods_go_first() {
    let hooks = ConnectionHooks::default().on_reconnect(|conn| {
        if conn.session_id().is_some() {
            let _ = conn.call("login", vec![], None);
        }
    });
    let mut h = harness_with(quiet_options(), hooks);
    h.connect("s1");
    h.conn.call("work", vec![], None).unwrap();
    h.sent();

    h.reset();
    let frames = h.sent();
    assert_eq!(kinds(&frames), vec!["connect", "method", "method"]);
    assert_eq!(frames[1]["method"], "login");
    assert_eq!(frames[1]["id"], "2");
    assert_eq!(frames[2]["method"], "work");
    assert_eq!(frames[2]["id"], "1");
}

#[test]
fn reconnect_waits_for_revived_subscriptions() {
    let mut h = harness();
    h.connect("s1");
    let store = MemoryStore::shared();
    h.conn.register_store("docs", Box::new(store.clone()));

    let sub = h
        .conn
        .subscribe("docs", vec![], SubscriptionCallbacks::new());
    h.deliver(json!({"msg": "added", "collection": "docs", "id": "a", "fields": {}}));
    h.deliver(json!({"msg": "ready", "subs": [sub.id()]}));
    assert!(sub.ready());
    h.sent();

    h.reset();
    let frames = h.sent();
    assert_eq!(kinds(&frames), vec!["connect", "sub"]);
    assert_eq!(frames[1]["id"], sub.id());

    h.deliver(json!({"msg": "connected", "session": "s2"}));
    h.deliver(json!({"msg": "added", "collection": "docs", "id": "b", "fields": {}}));
    // Old data stays visible until the subscription is ready again.
    assert!(store.lock().get("a").is_some());
    assert!(store.lock().get("b").is_none());

    h.deliver(json!({"msg": "ready", "subs": [sub.id()]}));
    assert!(store.lock().get("a").is_none());
    assert!(store.lock().get("b").is_some());
}

#[test]
fn reconnect_without_subscriptions_resets_stores_at_once() {
    let mut h = harness();
    h.connect("s1");
    let store = MemoryStore::shared();
    h.conn.register_store("docs", Box::new(store.clone()));
    h.deliver(json!({"msg": "added", "collection": "docs", "id": "a", "fields": {}}));
    assert_eq!(store.lock().count(), 1);

    h.reset();
    h.deliver(json!({"msg": "connected", "session": "s2"}));
    assert_eq!(store.lock().count(), 0);
}

#[test]
fn version_negotiation_retries_with_server_choice() {
    let options = ConnectionOptions {
        supported_ddp_versions: vec!["garbled".into(), "1".into()],
        ..quiet_options()
    };
    let mut h = harness_with(options, ConnectionHooks::default());
    h.conn.on_reset().unwrap();
    assert_eq!(h.sent()[0]["version"], "garbled");

    h.deliver(json!({"msg": "failed", "version": "1"}));
    assert_eq!(h.stream.reconnects().len(), 1);
    assert!(h.stream.reconnects()[0].force);

    h.conn.on_reset().unwrap();
    let frames = h.sent();
    let connect = &frames[0];
    assert_eq!(connect["version"], "1");
    assert_eq!(connect["support"], json!(["garbled", "1"]));
    h.deliver(json!({"msg": "connected", "session": "s1"}));
    assert_eq!(h.conn.version(), Some("1"));
}

#[test]
fn version_negotiation_fails_permanently() {
    let reported = Arc::new(Mutex::new(Vec::new()));
    let r = reported.clone();
    let hooks = ConnectionHooks::default()
        .on_version_negotiation_failure(move |description| r.lock().push(description.to_string()));
    let options = ConnectionOptions {
        supported_ddp_versions: vec!["garbled".into(), "more garbled".into()],
        ..quiet_options()
    };
    let mut h = harness_with(options, hooks);
    h.conn.on_reset().unwrap();
    h.deliver(json!({"msg": "failed", "version": "1"}));

    let status = h.conn.status();
    assert_eq!(status.status, StatusKind::Failed);
    assert!(status
        .reason
        .unwrap()
        .contains("version negotiation failed"));
    assert_eq!(reported.lock().len(), 1);
    assert!(h.stream.disconnects()[0].permanent);
}

#[test]
fn connected_hook_runs() {
    let count = Arc::new(Mutex::new(0));
    let c = count.clone();
    let hooks = ConnectionHooks::default().on_connected(move || *c.lock() += 1);
    let mut h = harness_with(quiet_options(), hooks);
    h.connect("s1");
    assert_eq!(*count.lock(), 1);
    assert_eq!(h.conn.session_id(), Some("s1"));
}

// ── Subscriptions ───────────────────────────────────────────────

#[test]
fn subscription_ready_then_stopped_by_server() {
    let mut h = harness();
    h.connect("s1");
    h.sent();

    let ready = Arc::new(Mutex::new(false));
    let stopped = Arc::new(Mutex::new(Vec::new()));
    let (r, s) = (ready.clone(), stopped.clone());
    let sub = h.conn.subscribe(
        "items",
        vec![json!("a")],
        SubscriptionCallbacks::new()
            .on_ready(move || *r.lock() = true)
            .on_stop(move |e| s.lock().push(e)),
    );
    let frames = h.sent();
    assert_eq!(frames[0]["msg"], "sub");
    assert_eq!(frames[0]["name"], "items");
    assert_eq!(frames[0]["params"], json!(["a"]));

    h.deliver(json!({"msg": "ready", "subs": [sub.id()]}));
    assert!(*ready.lock());
    assert!(h.conn.subscription_ready(sub.id()));

    h.deliver(json!({"msg": "nosub", "id": sub.id(), "error": {"error": 404, "reason": "gone"}}));
    assert_eq!(
        stopped.lock().as_slice(),
        &[Some(MethodError::new(404, "gone"))]
    );
    assert!(!sub.ready());
    assert_eq!(h.conn.subscription_count(), 0);
}

#[test]
fn unsubscribe_follows_subscribe() {
    let mut h = harness();
    h.connect("s1");
    h.sent();

    let sub = h.conn.subscribe("items", vec![], SubscriptionCallbacks::new());
    assert!(h.conn.unsubscribe(sub.id()));
    let frames = h.sent();
    assert_eq!(kinds(&frames), vec!["sub", "unsub"]);
    assert_eq!(frames[1]["id"], sub.id());
    assert!(!h.conn.unsubscribe(sub.id()));
}

#[test]
fn inactive_subscription_is_reused() {
    let mut h = harness();
    h.connect("s1");
    h.sent();

    let first = h.conn.subscribe("items", vec![json!(1)], SubscriptionCallbacks::new());
    h.deliver(json!({"msg": "ready", "subs": [first.id()]}));
    h.sent();

    assert!(h.conn.invalidate_subscription(first.id()));
    let ready = Arc::new(Mutex::new(false));
    let r = ready.clone();
    let second = h.conn.subscribe(
        "items",
        vec![json!(1)],
        SubscriptionCallbacks::new().on_ready(move || *r.lock() = true),
    );
    assert_eq!(first.id(), second.id());
    assert!(*ready.lock());
    h.conn.stop_inactive_subscriptions();
    assert!(h.sent().is_empty());

    h.conn.invalidate_subscription(first.id());
    h.conn.stop_inactive_subscriptions();
    assert_eq!(kinds(&h.sent()), vec!["unsub"]);
}

// ── Data path ───────────────────────────────────────────────────

#[test]
fn updates_for_unknown_collections_replay_on_registration() {
    let mut h = harness();
    h.connect("s1");
    h.deliver(json!({"msg": "added", "collection": "late", "id": "x", "fields": {"n": 1}}));
    h.deliver(json!({"msg": "changed", "collection": "late", "id": "x", "fields": {"n": 2}}));

    let store = MemoryStore::shared();
    assert!(h.conn.register_store("late", Box::new(store.clone())));
    assert_eq!(
        Value::Object(store.lock().get("x").unwrap().clone()),
        json!({"_id": "x", "n": 2})
    );
    assert!(!h.conn.register_store("late", Box::new(MemoryStore::new())));
}

#[test]
fn bad_frames_are_dropped() {
    let mut h = harness();
    h.connect("s1");
    h.sent();

    for raw in [
        "not json",
        r#"{"msg": "added"}"#,
        r#"{"msg": "weird"}"#,
        r#"{"server_id": "0"}"#,
        r#"{"foo": 1}"#,
    ] {
        h.conn.on_message(raw).unwrap();
    }
    assert!(h.sent().is_empty());

    h.deliver(json!({"msg": "ping", "id": "p1"}));
    assert_eq!(h.sent(), vec![json!({"msg": "pong", "id": "p1"})]);
}

#[test]
fn add_for_stub_written_document_twice_is_fatal() {
    let mut h = harness();
    h.connect("s1");
    let store = MemoryStore::shared();
    h.conn.register_store("docs", Box::new(store.clone()));
    h.conn
        .methods([("insert".to_string(), inserting_stub(&store, false))])
        .unwrap();
    h.conn.call("insert", vec![], None).unwrap();

    let added = json!({"msg": "added", "collection": "docs", "id": "x", "fields": {}}).to_string();
    h.conn.on_message(&added).unwrap();
    assert!(h.conn.on_message(&added).unwrap_err().is_fatal());
}

#[test]
fn updated_for_unknown_method_is_fatal() {
    let mut h = harness();
    h.connect("s1");
    let raw = json!({"msg": "updated", "methods": ["42"]}).to_string();
    assert!(h.conn.on_message(&raw).unwrap_err().is_fatal());
}

#[test]
fn changed_for_stub_written_document_waits_for_updated() {
    let mut h = harness();
    h.connect("s1");
    let store = MemoryStore::shared();
    h.conn.register_store("docs", Box::new(store.clone()));
    h.conn
        .methods([("insert".to_string(), inserting_stub(&store, false))])
        .unwrap();
    h.conn.call("insert", vec![], None).unwrap();

    h.deliver(json!({"msg": "added", "collection": "docs", "id": "x", "fields": {"n": 1}}));
    h.deliver(json!({"msg": "changed", "collection": "docs", "id": "x", "fields": {"n": 2}}));
    assert_eq!(
        Value::Object(store.lock().get("x").unwrap().clone()),
        json!({"_id": "x", "fromStub": 1})
    );

    h.result("1", Value::Null);
    h.updated(&["1"]);
    assert_eq!(
        Value::Object(store.lock().get("x").unwrap().clone()),
        json!({"_id": "x", "n": 2})
    );
}

#[test]
fn removed_stub_written_document_is_deleted_on_updated() {
    let mut h = harness();
    h.connect("s1");
    let store = MemoryStore::shared();
    h.conn.register_store("docs", Box::new(store.clone()));
    h.conn
        .methods([("insert".to_string(), inserting_stub(&store, false))])
        .unwrap();
    h.conn.call("insert", vec![], None).unwrap();

    h.deliver(json!({"msg": "added", "collection": "docs", "id": "x", "fields": {"n": 1}}));
    h.deliver(json!({"msg": "removed", "collection": "docs", "id": "x"}));
    assert!(store.lock().get("x").is_some());

    h.result("1", Value::Null);
    h.updated(&["1"]);
    assert!(store.lock().get("x").is_none());
    assert_eq!(store.lock().count(), 0);
}

#[test]
fn removed_for_missing_stub_written_document_is_fatal() {
    let mut h = harness();
    h.connect("s1");
    let store = MemoryStore::shared();
    h.conn.register_store("docs", Box::new(store.clone()));
    h.conn
        .methods([("insert".to_string(), inserting_stub(&store, false))])
        .unwrap();
    h.conn.call("insert", vec![], None).unwrap();

    // The server never added `x`, so there is nothing to remove.
    let removed = json!({"msg": "removed", "collection": "docs", "id": "x"}).to_string();
    assert!(h.conn.on_message(&removed).unwrap_err().is_fatal());
}

#[test]
fn changed_for_missing_stub_written_document_is_fatal() {
    let mut h = harness();
    h.connect("s1");
    let store = MemoryStore::shared();
    h.conn.register_store("docs", Box::new(store.clone()));
    h.conn
        .methods([("insert".to_string(), inserting_stub(&store, false))])
        .unwrap();
    h.conn.call("insert", vec![], None).unwrap();

    let changed =
        json!({"msg": "changed", "collection": "docs", "id": "x", "fields": {"n": 1}}).to_string();
    assert!(h.conn.on_message(&changed).unwrap_err().is_fatal());
}

#[test]
fn stub_write_survives_store_reset() {
    let mut h = harness();
    h.connect("s1");
    let store = MemoryStore::shared();
    h.conn.register_store("docs", Box::new(store.clone()));
    h.conn
        .methods([("insert".to_string(), inserting_stub(&store, false))])
        .unwrap();
    h.deliver(json!({"msg": "added", "collection": "docs", "id": "old", "fields": {}}));

    let results = Results::default();
    h.conn.call("m", vec![], recorder(&results)).unwrap();
    h.reset();
    h.deliver(json!({"msg": "connected", "session": "s2"}));

    // Method 1 was resent, so the new session's data waits for it.
    h.conn.call("insert", vec![], recorder(&results)).unwrap();
    h.deliver(json!({"msg": "added", "collection": "docs", "id": "x", "fields": {"server": 1}}));
    assert!(store.lock().get("old").is_some());

    h.result("1", Value::Null);
    h.updated(&["1"]);
    // Stores were reset, but the stub's version of `x` was carried over.
    assert!(store.lock().get("old").is_none());
    assert_eq!(
        Value::Object(store.lock().get("x").unwrap().clone()),
        json!({"_id": "x", "fromStub": 1})
    );
    assert_eq!(results.lock().len(), 1);

    h.result("2", json!("simulated"));
    h.updated(&["2"]);
    assert_eq!(
        Value::Object(store.lock().get("x").unwrap().clone()),
        json!({"_id": "x", "server": 1})
    );
    assert_eq!(results.lock().len(), 2);
}

fn buffered_options() -> ConnectionOptions {
    ConnectionOptions {
        heartbeat_interval_ms: 0,
        buffered_writes_interval_ms: 10,
        buffered_writes_max_age_ms: 40,
        ..ConnectionOptions::default()
    }
}

#[tokio::test(start_paused = true)]
async fn buffered_writes_flush_after_quiet_interval() {
    let mut h = harness_with(buffered_options(), ConnectionHooks::default());
    h.connect("s1");
    let store = MemoryStore::shared();
    h.conn.register_store("c", Box::new(store.clone()));
    let start = tokio::time::Instant::now();

    let mut n = 0;
    let mut add = |h: &mut Harness| {
        n += 1;
        h.deliver(json!({"msg": "added", "collection": "c", "id": format!("d{n}"), "fields": {}}));
    };
    async fn tick(h: &mut Harness, start: tokio::time::Instant, at: u64) {
        let target = start + Duration::from_millis(at);
        tokio::time::advance(target - tokio::time::Instant::now()).await;
        h.conn.poll_timers().unwrap();
    }

    add(&mut h);
    assert_eq!(store.lock().count(), 0);
    tick(&mut h, start, 6).await;
    assert_eq!(store.lock().count(), 0);
    tick(&mut h, start, 10).await;
    assert_eq!(store.lock().count(), 1);

    add(&mut h);
    tick(&mut h, start, 11).await;
    assert_eq!(store.lock().count(), 1);
    tick(&mut h, start, 20).await;
    assert_eq!(store.lock().count(), 2);

    add(&mut h);
    for at in [26, 32, 38, 44, 53] {
        tick(&mut h, start, at).await;
        add(&mut h);
    }
    tick(&mut h, start, 62).await;
    assert_eq!(store.lock().count(), 2);
    tick(&mut h, start, 63).await;
    assert_eq!(store.lock().count(), 8);
}

#[tokio::test(start_paused = true)]
async fn buffered_writes_flush_at_max_age() {
    let mut h = harness_with(buffered_options(), ConnectionHooks::default());
    h.connect("s1");
    let store = MemoryStore::shared();
    h.conn.register_store("c", Box::new(store.clone()));

    for i in 0..6 {
        if i > 0 {
            tokio::time::advance(Duration::from_millis(9)).await;
            h.conn.poll_timers().unwrap();
        }
        assert_eq!(store.lock().count(), 0);
        h.deliver(json!({"msg": "added", "collection": "c", "id": format!("d{i}"), "fields": {}}));
    }
    // 45ms after the first write: past the 40ms limit.
    assert_eq!(store.lock().count(), 6);
}

#[tokio::test(start_paused = true)]
async fn result_flushes_buffered_writes_first() {
    let mut h = harness_with(buffered_options(), ConnectionHooks::default());
    h.connect("s1");
    let store = MemoryStore::shared();
    h.conn.register_store("c", Box::new(store.clone()));

    let seen = Arc::new(Mutex::new(None));
    let (s, st) = (seen.clone(), store.clone());
    h.conn
        .apply(
            "m",
            vec![],
            MethodOptions::new().on_result_received(move |_| *s.lock() = Some(st.lock().count())),
            None,
        )
        .unwrap();
    h.deliver(json!({"msg": "added", "collection": "c", "id": "x", "fields": {}}));
    h.result("1", Value::Null);
    assert_eq!(*seen.lock(), Some(1));
}

// ── Heartbeat ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn heartbeat_pings_then_times_out() {
    let options = ConnectionOptions {
        heartbeat_interval_ms: 100,
        heartbeat_timeout_ms: 50,
        buffered_writes_interval_ms: 0,
        ..ConnectionOptions::default()
    };
    let mut h = harness_with(options, ConnectionHooks::default());
    h.connect("s1");
    h.sent();
    let start = tokio::time::Instant::now();
    assert_eq!(h.conn.next_deadline(), Some(start + Duration::from_millis(100)));

    tokio::time::advance(Duration::from_millis(100)).await;
    h.conn.poll_timers().unwrap();
    assert_eq!(h.sent(), vec![json!({"msg": "ping"})]);

    tokio::time::advance(Duration::from_millis(50)).await;
    h.conn.poll_timers().unwrap();
    assert_eq!(h.stream.lost(), vec!["DDP heartbeat timed out".to_string()]);
    assert_eq!(h.conn.next_deadline(), None);
}

#[tokio::test(start_paused = true)]
async fn legacy_version_has_no_heartbeat() {
    let options = ConnectionOptions {
        heartbeat_interval_ms: 100,
        supported_ddp_versions: vec!["pre1".into()],
        ..quiet_options()
    };
    let mut h = harness_with(options, ConnectionHooks::default());
    h.connect("s1");
    assert_eq!(h.conn.next_deadline(), None);
}

// ── Async stubs ─────────────────────────────────────────────────

fn slow_stub() -> Stub {
    Stub::asynchronous(|_inv: MethodInvocation, _args: Vec<Value>| async {
        tokio::task::yield_now().await;
        Ok(json!("from stub"))
    })
}

#[tokio::test]
async fn calls_queue_behind_async_stub() {
    let mut h = harness();
    h.connect("s1");
    h.sent();
    h.conn
        .methods([("slow".to_string(), slow_stub())])
        .unwrap();

    let pending = h
        .conn
        .apply_async("slow", vec![], MethodOptions::new())
        .unwrap();
    assert!(h.conn.is_stub_running());
    assert_eq!(h.conn.call("fast", vec![], None).unwrap(), None);
    let sub = h.conn.subscribe("items", vec![], SubscriptionCallbacks::new());
    h.conn.unsubscribe(sub.id());
    assert!(h.sent().is_empty());

    let job = h.conn.take_stub_job().unwrap();
    h.conn.complete_stub(job.run().await).unwrap();
    assert!(!h.conn.is_stub_running());

    let frames = h.sent();
    assert_eq!(kinds(&frames), vec!["method", "method", "sub", "unsub"]);
    assert_eq!(frames[0]["method"], "slow");
    assert_eq!(frames[1]["method"], "fast");
    assert_eq!(pending.result().await.unwrap(), json!("from stub"));
}

#[tokio::test(start_paused = true)]
async fn deferred_flush_does_not_leave_a_due_deadline() {
    let mut h = harness_with(buffered_options(), ConnectionHooks::default());
    h.connect("s1");
    h.conn
        .methods([("slow".to_string(), slow_stub())])
        .unwrap();
    let sub = h.conn.subscribe("items", vec![], SubscriptionCallbacks::new());
    h.deliver(json!({"msg": "ready", "subs": [sub.id()]}));
    h.deliver(json!({"msg": "added", "collection": "c", "id": "a", "fields": {}}));

    // Reviving the subscription keeps the buffered write from being flushed
    // before the stub starts.
    h.reset();
    h.deliver(json!({"msg": "connected", "session": "s2"}));
    let _pending = h
        .conn
        .apply_async("slow", vec![], MethodOptions::new())
        .unwrap();

    tokio::time::advance(Duration::from_millis(20)).await;
    for _ in 0..3 {
        h.conn.poll_timers().unwrap();
        let now = tokio::time::Instant::now();
        assert!(h.conn.next_deadline().is_some_and(|d| d > now));
    }

    let job = h.conn.take_stub_job().unwrap();
    h.conn.complete_stub(job.run().await).unwrap();
    let now = tokio::time::Instant::now();
    assert!(h.conn.next_deadline().is_some_and(|d| d <= now));
    h.conn.poll_timers().unwrap();
    assert_eq!(h.conn.next_deadline(), None);
}

#[tokio::test]
async fn call_async_resolves_with_server_result() {
    let mut h = harness();
    h.connect("s1");
    h.sent();

    let pending = h.conn.call_async("remote", vec![json!(2)]).unwrap();
    assert!(h.conn.take_stub_job().is_none());
    h.result("1", json!(4));
    h.updated(&["1"]);
    assert_eq!(pending.result().await.unwrap(), json!(4));
}

#[tokio::test]
async fn call_async_reports_server_error() {
    let mut h = harness();
    h.connect("s1");

    let pending = h.conn.call_async("remote", vec![]).unwrap();
    h.deliver(json!({"msg": "result", "id": "1", "error": {"error": "nope"}}));
    h.updated(&["1"]);
    assert!(matches!(
        pending.result().await,
        Err(DdpError::Method(ref e)) if e.code() == Some("nope")
    ));
}

// ── Migration ───────────────────────────────────────────────────

#[test]
fn migration_waits_for_outstanding_methods() {
    let mut h = harness();
    h.connect("s1");
    assert!(h.conn.on_migrate(Box::new(|| {})));

    h.conn.call("m", vec![], None).unwrap();
    let retried = Arc::new(Mutex::new(false));
    let r = retried.clone();
    assert!(!h.conn.on_migrate(Box::new(move || *r.lock() = true)));

    h.result("1", Value::Null);
    assert!(!*retried.lock());
    h.updated(&["1"]);
    assert!(*retried.lock());
}
