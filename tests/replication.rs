//! Delta derivation and replication into a second store.

use std::cell::RefCell;
use std::rc::Rc;
use stratum::{
    ApplyDeltaListener, Delta, DeltaListener, DeltaOp, Direction, EntityTypeId, EventFilter,
    EventHub, FanoutDeltaListener, FieldId, KeyFilter, Result, Schema, Store,
    TransformDeltaListener, Value, ValueKind,
};

fn schema() -> Schema {
    let mut b = Schema::builder();
    {
        let e = b.entity("person");
        e.field("id", ValueKind::Long).required();
        e.field("foo", ValueKind::Int);
        e.field("bar", ValueKind::Str);
        e.identity_key("pk", &["id"]);
        e.key("by_foo", &["foo"]);
    }
    b.build().unwrap()
}

struct Handles {
    person: EntityTypeId,
    id: FieldId,
    foo: FieldId,
    bar: FieldId,
}

fn handles(store: &Store) -> Handles {
    let person = store.schema().entity("person").unwrap();
    Handles {
        person,
        id: store.schema().field(person, "id").unwrap(),
        foo: store.schema().field(person, "foo").unwrap(),
        bar: store.schema().field(person, "bar").unwrap(),
    }
}

/// Primary store replicating every commit into a shared target.
fn replicated_pair() -> (Store, Rc<RefCell<Store>>) {
    let mut primary = Store::new(schema());
    let target = Rc::new(RefCell::new(Store::new(schema())));
    primary.set_commit_listener(Box::new(TransformDeltaListener::new(Box::new(
        ApplyDeltaListener::new(target.clone()),
    ))));
    (primary, target)
}

#[derive(Default)]
struct Capture {
    batches: Vec<(Vec<Delta>, Vec<Delta>, Vec<Delta>)>,
}

impl DeltaListener for Rc<RefCell<Capture>> {
    fn accept_deltas(
        &mut self,
        deletes: &[Delta],
        updates: &[Delta],
        inserts: &[Delta],
    ) -> Result<()> {
        self.borrow_mut()
            .batches
            .push((deletes.to_vec(), updates.to_vec(), inserts.to_vec()));
        Ok(())
    }
}

// --- Classification ---

#[test]
fn test_classification_lifecycle() {
    let mut store = Store::new(schema());
    let capture = Rc::new(RefCell::new(Capture::default()));
    store.set_commit_listener(Box::new(TransformDeltaListener::new(Box::new(
        capture.clone(),
    ))));
    let h = handles(&store);

    let mut tx = store.begin(false);
    let row = tx
        .create(
            h.person,
            vec![
                (h.id, Value::Long(1)),
                (h.foo, Value::Int(7)),
                (h.bar, "x".into()),
            ],
        )
        .unwrap();
    tx.commit().unwrap();

    let mut tx = store.begin(false);
    tx.set(row, h.foo, 8).unwrap();
    tx.commit().unwrap();

    let mut tx = store.begin(false);
    tx.remove(row).unwrap();
    tx.commit().unwrap();

    let batches = &capture.borrow().batches;
    assert_eq!(batches.len(), 3);

    // a fresh commit yields exactly one insert with all fields populated
    let (d, u, i) = &batches[0];
    assert!(d.is_empty() && u.is_empty());
    assert_eq!(i.len(), 1);
    assert_eq!(i[0].op, DeltaOp::Insert);
    assert_eq!(i[0].value(0), &Value::Long(1));
    assert_eq!(i[0].value(1), &Value::Int(7));
    assert_eq!(i[0].value(2), &Value::Str("x".into()));

    // a later field change yields one update containing only that field
    let (d, u, i) = &batches[1];
    assert!(d.is_empty() && i.is_empty());
    assert_eq!(u.len(), 1);
    assert!(u[0].changed(1));
    assert!(!u[0].changed(2));
    assert_eq!(u[0].value(1), &Value::Int(8));
    // identity key is present regardless
    assert_eq!(u[0].value(0), &Value::Long(1));

    // a remove yields one delete carrying the identity key
    let (d, u, i) = &batches[2];
    assert!(u.is_empty() && i.is_empty());
    assert_eq!(d.len(), 1);
    assert_eq!(d[0].op, DeltaOp::Delete);
    assert_eq!(d[0].value(0), &Value::Long(1));
}

#[test]
fn test_no_op_suppression() {
    let mut store = Store::new(schema());
    let capture = Rc::new(RefCell::new(Capture::default()));
    store.set_commit_listener(Box::new(TransformDeltaListener::new(Box::new(
        capture.clone(),
    ))));
    let h = handles(&store);

    let mut tx = store.begin(false);
    let row = tx
        .create(h.person, vec![(h.id, Value::Long(1)), (h.foo, Value::Int(5))])
        .unwrap();
    tx.commit().unwrap();

    // mutate and mutate back: no delta at all
    let mut tx = store.begin(false);
    tx.set(row, h.foo, 6).unwrap();
    tx.set(row, h.foo, 5).unwrap();
    tx.commit().unwrap();
    assert_eq!(capture.borrow().batches.len(), 1);

    // create and remove in one transaction: no delta at all
    let mut tx = store.begin(false);
    let ephemeral = tx
        .create(h.person, vec![(h.id, Value::Long(99))])
        .unwrap();
    tx.set(ephemeral, h.foo, 1).unwrap();
    tx.remove(ephemeral).unwrap();
    tx.commit().unwrap();
    assert_eq!(capture.borrow().batches.len(), 1);
}

#[test]
fn test_nested_commit_emits_single_folded_delta() {
    let mut store = Store::new(schema());
    let capture = Rc::new(RefCell::new(Capture::default()));
    store.set_commit_listener(Box::new(TransformDeltaListener::new(Box::new(
        capture.clone(),
    ))));
    let h = handles(&store);

    let mut tx = store.begin(false);
    let row = tx
        .create(h.person, vec![(h.id, Value::Long(1)), (h.foo, Value::Int(1))])
        .unwrap();
    tx.commit().unwrap();

    let mut tx = store.begin(false);
    tx.set(row, h.foo, 2).unwrap();
    {
        let mut child = tx.begin(false);
        child.set(row, h.foo, 3).unwrap();
        child.set(row, h.bar, "deep").unwrap();
        child.commit().unwrap();
    }
    tx.commit().unwrap();

    let batches = &capture.borrow().batches;
    assert_eq!(batches.len(), 2);
    let (_, updates, _) = &batches[1];
    assert_eq!(updates.len(), 1);
    assert!(updates[0].changed(1));
    assert!(updates[0].changed(2));
    assert_eq!(updates[0].value(1), &Value::Int(3));
    assert_eq!(updates[0].value(2), &Value::Str("deep".into()));
}

// --- Replication fidelity ---

#[test]
fn test_replication_applies_inserts_updates_deletes() {
    let (mut primary, target) = replicated_pair();
    let h = handles(&primary);

    let mut tx = primary.begin(false);
    let r1 = tx
        .create(
            h.person,
            vec![
                (h.id, Value::Long(123)),
                (h.foo, Value::Int(234)),
                (h.bar, "345".into()),
            ],
        )
        .unwrap();
    tx.create(h.person, vec![(h.id, Value::Long(124)), (h.foo, Value::Int(5))])
        .unwrap();
    tx.commit().unwrap();

    {
        let t = target.borrow();
        let table = t.table(h.person);
        assert_eq!(table.count().unwrap(), 2);
        let row = table.get(&[Value::Long(123)]).unwrap().unwrap();
        assert_eq!(t.get(row, h.foo).unwrap(), Value::Int(234));
        assert_eq!(t.get(row, h.bar).unwrap(), Value::Str("345".into()));
    }

    let mut tx = primary.begin(false);
    tx.set(r1, h.bar, "346").unwrap();
    tx.clear(r1, h.foo).unwrap();
    tx.commit().unwrap();

    {
        let t = target.borrow();
        let table = t.table(h.person);
        let row = table.get(&[Value::Long(123)]).unwrap().unwrap();
        assert_eq!(t.get(row, h.bar).unwrap(), Value::Str("346".into()));
        assert_eq!(t.get(row, h.foo).unwrap(), Value::Null);
    }

    let mut tx = primary.begin(false);
    tx.remove(r1).unwrap();
    tx.commit().unwrap();

    {
        let t = target.borrow();
        let table = t.table(h.person);
        assert_eq!(table.count().unwrap(), 1);
        assert!(table.get(&[Value::Long(123)]).unwrap().is_none());
    }
}

#[test]
fn test_replicated_state_matches_through_indexes() {
    let (mut primary, target) = replicated_pair();
    let h = handles(&primary);

    let mut tx = primary.begin(false);
    for i in 0..10i64 {
        tx.create(
            h.person,
            vec![(h.id, Value::Long(i)), (h.foo, Value::Int((i % 3) as i32))],
        )
        .unwrap();
    }
    tx.commit().unwrap();

    let mut tx = primary.begin(false);
    for i in (0..10i64).step_by(2) {
        let row = tx.table(h.person).get(&[Value::Long(i)]).unwrap().unwrap();
        tx.set(row, h.foo, 9).unwrap();
    }
    tx.commit().unwrap();

    let by_foo = primary.schema().key(h.person, "by_foo").unwrap();
    let snapshot = |store: &Store| -> Vec<(Value, Value)> {
        store
            .table(h.person)
            .select(by_foo, &KeyFilter::All, Direction::Asc)
            .unwrap()
            .into_iter()
            .map(|r| {
                (
                    store.get(r, h.foo).unwrap(),
                    store.get(r, h.id).unwrap(),
                )
            })
            .collect()
    };

    let primary_view = snapshot(&primary);
    let target_view = snapshot(&target.borrow());
    assert_eq!(primary_view, target_view);
}

#[test]
fn test_delta_stream_survives_serialization() {
    let mut store = Store::new(schema());
    let capture = Rc::new(RefCell::new(Capture::default()));
    store.set_commit_listener(Box::new(TransformDeltaListener::new(Box::new(
        capture.clone(),
    ))));
    let h = handles(&store);

    let mut tx = store.begin(false);
    tx.create(
        h.person,
        vec![
            (h.id, Value::Long(1)),
            (h.foo, Value::Int(2)),
            (h.bar, "three".into()),
        ],
    )
    .unwrap();
    tx.commit().unwrap();

    let (_, _, inserts) = &capture.borrow().batches[0];
    let json = serde_json::to_string(&inserts[0]).unwrap();
    let decoded: Delta = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, inserts[0]);
}

// --- Events ---

#[test]
fn test_event_hub_composes_with_replication() {
    let mut primary = Store::new(schema());
    let target = Rc::new(RefCell::new(Store::new(schema())));
    let hub = Rc::new(RefCell::new(EventHub::new()));

    let mut fanout = FanoutDeltaListener::new();
    fanout.push(Box::new(hub.clone()));
    fanout.push(Box::new(ApplyDeltaListener::new(target.clone())));
    primary.set_commit_listener(Box::new(TransformDeltaListener::new(Box::new(fanout))));

    let h = handles(&primary);
    let handle = hub
        .borrow_mut()
        .subscribe(EventFilter::entity(h.person).with_ops(vec![DeltaOp::Insert]));

    let mut tx = primary.begin(false);
    let row = tx
        .create(h.person, vec![(h.id, Value::Long(1)), (h.foo, Value::Int(1))])
        .unwrap();
    tx.commit().unwrap();

    let mut tx = primary.begin(false);
    tx.set(row, h.foo, 2).unwrap();
    tx.commit().unwrap();

    // only the insert passed the filter
    let event = handle.receiver.try_recv().unwrap();
    assert_eq!(event.op, DeltaOp::Insert);
    assert!(handle.receiver.try_recv().is_err());

    // replication still happened for both commits
    let t = target.borrow();
    let trow = t.table(h.person).get(&[Value::Long(1)]).unwrap().unwrap();
    assert_eq!(t.get(trow, h.foo).unwrap(), Value::Int(2));
}

#[test]
fn test_events_cross_thread() {
    let mut store = Store::new(schema());
    let hub = Rc::new(RefCell::new(EventHub::new()));
    store.set_commit_listener(Box::new(TransformDeltaListener::new(Box::new(hub.clone()))));

    let h = handles(&store);
    let handle = hub.borrow_mut().subscribe(EventFilter::all());
    let receiver = handle.receiver;

    let join = std::thread::spawn(move || receiver.recv().unwrap());

    let mut tx = store.begin(false);
    tx.create(h.person, vec![(h.id, Value::Long(1))]).unwrap();
    tx.commit().unwrap();

    let delta = join.join().unwrap();
    assert_eq!(delta.op, DeltaOp::Insert);
    assert_eq!(delta.value(0), &Value::Long(1));
}
