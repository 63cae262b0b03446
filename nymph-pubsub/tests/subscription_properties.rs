//! Random write sequences against live subscriptions: after every step the
//! cached result of each tracked query, and what its subscriber was told,
//! must equal a fresh query against the store.

use nymph_model::{ClassRegistry, Entity, Guid, Query, ReturnKind};
use nymph_pubsub::{ClientMessage, ConnectionId, Publisher, ServerMessage, Subscription};
use nymph_store::{MemoryDriver, Nymph, SqliteDriver, StoreEvent};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

const SENIOR: &str = r#"[{"class":"Employee"},{"type":"&","gte":["level",3]}]"#;
const REPORTS_TO_SENIOR: &str = r#"[{"class":"Employee"},{"type":"&","qref":["manager",[{"class":"Employee"},{"type":"&","gte":["level",3]}]]}]"#;
const JUNIOR_OR_UNMANAGED: &str = r#"[{"class":"Employee"},{"type":"!|","gte":["level",2],"defined":"manager"}]"#;
const TOP_TWO: &str = r#"[{"class":"Employee","sort":"level","reverse":true,"limit":2}]"#;
const QUERIES: [&str; 4] = [SENIOR, REPORTS_TO_SENIOR, JUNIOR_OR_UNMANAGED, TOP_TWO];

#[derive(Debug, Clone)]
enum Step {
    Create { level: i64, manager: Option<usize> },
    Update { target: usize, level: i64, manager: Option<usize> },
    Delete { target: usize },
}

#[derive(Debug, Clone)]
enum Op {
    Write(Step),
    /// Writes in a transaction, optionally with a nested one. The outer
    /// level may close while the nested one is still open.
    Transaction {
        outer: Vec<Step>,
        nested: Vec<Step>,
        close_nested_first: bool,
        commit_nested: bool,
        commit_outer: bool,
    },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0i64..5, prop::option::of(0usize..8))
            .prop_map(|(level, manager)| Step::Create { level, manager }),
        (0usize..8, 0i64..5, prop::option::of(0usize..8))
            .prop_map(|(target, level, manager)| Step::Update { target, level, manager }),
        (0usize..8).prop_map(|target| Step::Delete { target }),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => step().prop_map(Op::Write),
        1 => (
            prop::collection::vec(step(), 0..4),
            prop::collection::vec(step(), 0..4),
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(outer, nested, close_nested_first, commit_nested, commit_outer)| {
                Op::Transaction {
                    outer,
                    nested,
                    close_nested_first,
                    commit_nested,
                    commit_outer,
                }
            }),
    ]
}

fn classes() -> ClassRegistry {
    let mut classes = ClassRegistry::new();
    classes.register("Employee", "Employee").unwrap();
    classes
}

fn pick(len: usize, index: usize) -> Option<usize> {
    (len > 0).then(|| index % len)
}

/// Applies one step through `handle`. `people` mirrors what is stored.
async fn write(handle: &Nymph, people: &mut Vec<Entity>, step: &Step) {
    match step {
        Step::Create { level, manager } => {
            let mut e = Entity::new("Employee");
            e.set("level", *level).unwrap();
            if let Some(m) = manager.and_then(|m| pick(people.len(), m)) {
                e.set_reference("manager", &people[m]).unwrap();
            }
            assert!(handle.save(&mut e).await.unwrap());
            people.push(e);
        }
        Step::Update { target, level, manager } => {
            let Some(t) = pick(people.len(), *target) else { return };
            let mut e = people[t].clone();
            e.set("level", *level).unwrap();
            match manager.and_then(|m| pick(people.len(), m)) {
                Some(m) => e.set_reference("manager", &people[m]).unwrap(),
                None => {
                    e.unset("manager");
                }
            }
            assert!(handle.save(&mut e).await.unwrap());
            people[t] = e;
        }
        Step::Delete { target } => {
            let Some(t) = pick(people.len(), *target) else { return };
            let mut e = people.remove(t);
            assert!(handle.delete(&mut e).await.unwrap());
        }
    }
}

async fn run_op(nymph: &Nymph, people: &mut Vec<Entity>, op: &Op) {
    let (outer, nested, close_nested_first, commit_nested, commit_outer) = match op {
        Op::Write(step) => return write(nymph, people, step).await,
        Op::Transaction {
            outer,
            nested,
            close_nested_first,
            commit_nested,
            commit_outer,
        } => (outer, nested, close_nested_first, commit_nested, commit_outer),
    };

    let before = people.clone();
    let tx = nymph.start_transaction("outer").await.unwrap();
    for step in outer {
        write(&tx, people, step).await;
    }
    let middle = people.clone();
    let inner = tx.start_transaction("nested").await.unwrap();
    for step in nested {
        write(&inner, people, step).await;
    }
    if *close_nested_first {
        if *commit_nested {
            inner.commit("nested").await.unwrap();
        } else {
            inner.rollback("nested").await.unwrap();
            *people = middle;
        }
    }
    if *commit_outer {
        tx.commit("outer").await.unwrap();
    } else {
        tx.rollback("outer").await.unwrap();
        *people = before;
    }
}

/// What one subscriber has been told, per query key.
#[derive(Default)]
struct Seen {
    members: HashMap<String, BTreeSet<Guid>>,
    count: Option<u64>,
}

impl Seen {
    fn absorb(&mut self, rx: &mut UnboundedReceiver<ServerMessage>) {
        while let Ok(message) = rx.try_recv() {
            match message {
                ServerMessage::Set { query, set } => {
                    self.members
                        .insert(query, set.iter().filter_map(Entity::guid).collect());
                }
                ServerMessage::Added { query, added, .. } => {
                    self.members.entry(query).or_default().insert(added);
                }
                ServerMessage::Removed { query, removed } => {
                    self.members.entry(query).or_default().remove(&removed);
                }
                ServerMessage::Count { count, .. } => self.count = Some(count),
                _ => {}
            }
        }
    }
}

async fn subscribe(publisher: &Publisher, connection: ConnectionId, subscription: Subscription) {
    publisher
        .handle_message(connection, ClientMessage::Subscribe(subscription))
        .await
        .unwrap();
}

async fn check(nymph: Nymph, ops: Vec<Op>) -> Result<(), TestCaseError> {
    let mut events: UnboundedReceiver<StoreEvent> = nymph.events();
    let publisher = Publisher::new(nymph.clone());
    let (listener, mut rx) = publisher.connect().await;
    for text in QUERIES {
        subscribe(&publisher, listener, Subscription::query(text)).await;
    }
    let (counter, mut count_rx) = publisher.connect().await;
    subscribe(&publisher, counter, Subscription::count(SENIOR)).await;

    let mut seen = Seen::default();
    let mut counted = Seen::default();
    let mut people = Vec::new();
    for op in &ops {
        run_op(&nymph, &mut people, op).await;
        while let Ok(event) = events.try_recv() {
            publisher.handle_store_event(event).await;
        }
        seen.absorb(&mut rx);
        counted.absorb(&mut count_rx);

        let mut stored_people: Vec<Guid> = people.iter().filter_map(Entity::guid).collect();
        let everyone = Query::parse(r#"[{"class":"Employee"}]"#).unwrap();
        let mut stored = nymph.get_entities(&everyone.returning(ReturnKind::Guid)).await.unwrap().guids();
        stored_people.sort();
        stored.sort();
        prop_assert_eq!(stored_people, stored);

        for text in QUERIES {
            let query = Query::parse(text).unwrap();
            let key = publisher.key_for(&query).unwrap();
            let direct = nymph.get_entities(&query.returning(ReturnKind::Guid)).await.unwrap().guids();
            let current = publisher.current(&key).await.unwrap_or_default();
            let direct_set: BTreeSet<Guid> = direct.iter().copied().collect();
            if query.options.is_paged() {
                prop_assert_eq!(&current, &direct, "ordered result of {}", text);
            } else {
                let current: BTreeSet<Guid> = current.into_iter().collect();
                prop_assert_eq!(&current, &direct_set, "result of {}", text);
            }
            let told = seen.members.get(&key.query).cloned().unwrap_or_default();
            prop_assert_eq!(&told, &direct_set, "events of {}", text);
            if text == SENIOR {
                prop_assert_eq!(counted.count, Some(direct.len() as u64));
            }
        }
    }
    Ok(())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn memory_subscriptions_follow_the_store(ops in prop::collection::vec(op(), 1..16)) {
        let nymph = Nymph::new(Arc::new(MemoryDriver::new()), classes());
        runtime().block_on(check(nymph, ops))?;
    }

    #[test]
    fn sqlite_subscriptions_follow_the_store(ops in prop::collection::vec(op(), 1..16)) {
        let nymph = Nymph::new(Arc::new(SqliteDriver::open_in_memory().unwrap()), classes());
        runtime().block_on(check(nymph, ops))?;
    }
}
