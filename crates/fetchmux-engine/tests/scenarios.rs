//! End-to-end engine behavior over the in-memory store: chunked fetching,
//! single-flight advances, epoch invalidation, will-have-children probing,
//! and mutation propagation, driven the way an application would drive a
//! connection (fetch, pump, drain events).

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use proptest::prelude::*;

use fetchmux_engine::{
    BackingStore, ChunkSize, CommitId, Connection, EngineConfig, ErrorReport, FetchContext,
    FetchParent, FilteredParent, Item, ItemId, ItemType, ListParent, MemoryStore, ParentState,
};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn entity() -> ItemType {
    ItemType::new("entity")
}

fn named(name: &str) -> Item {
    Item::new(ItemId(0)).with_field("name", name)
}

fn seeded(count: usize, batch_size: usize) -> Arc<MemoryStore> {
    init_tracing();
    let store = Arc::new(MemoryStore::with_batch_size(batch_size));
    store.stage_rows(&entity(), (0..count).map(|n| named(&format!("e{n}"))));
    store
}

fn list_parent(chunk: ChunkSize) -> (Arc<ListParent>, Arc<dyn FetchParent>) {
    let list = Arc::new(ListParent::new(entity(), chunk));
    let parent: Arc<dyn FetchParent> = list.clone();
    (list, parent)
}

/// Drive `parent` until the engine says there is nothing left.
fn fetch_to_completion(conn: &Connection, store: &MemoryStore, parent: &Arc<dyn FetchParent>) {
    for _ in 0..1000 {
        if !conn.can_fetch_more(parent) {
            return;
        }
        conn.fetch_more(parent);
        conn.pump_until_idle();
    }
    panic!(
        "parent did not finish fetching: position={}, busy={}, fetched={}, store exhausted={}",
        parent.position(conn.id()),
        parent.is_busy(),
        parent.is_fetched(),
        store.is_exhausted(&parent.fetch_item_type()),
    );
}

#[test]
fn empty_store_fetches_once_then_stops() {
    let store = seeded(0, 10);
    let conn = Connection::open_default(Arc::clone(&store) as Arc<dyn BackingStore>);
    let (list, parent) = list_parent(ChunkSize::Limited(10));

    assert!(conn.can_fetch_more(&parent));
    conn.fetch_more(&parent);
    conn.pump_until_idle();

    assert!(!conn.can_fetch_more(&parent));
    assert!(parent.is_fetched() || parent.will_have_children() == Some(false));
    assert!(list.is_empty());
    // The probe and the fetch share one single-flight advance.
    assert_eq!(store.advance_calls(), 1);
}

#[test]
fn second_parent_reuses_cached_rows_without_a_new_query() {
    let store = seeded(25, 1000);
    let conn = Connection::open_default(Arc::clone(&store) as Arc<dyn BackingStore>);
    let (list_a, parent_a) = list_parent(ChunkSize::Limited(10));
    let (list_b, parent_b) = list_parent(ChunkSize::Limited(10));

    conn.fetch_more(&parent_a);
    conn.pump_until_idle();
    assert_eq!(list_a.len(), 10);
    assert_eq!(parent_a.position(conn.id()), 10);

    // All 25 rows are cached now; B drains synchronously.
    conn.fetch_more(&parent_b);
    assert_eq!(list_b.len(), 10);
    assert_eq!(store.advance_calls(), 1);
}

#[test]
fn added_items_reach_parents_through_the_normal_drain_path() {
    let store = seeded(25, 1000);
    let conn = Connection::open_default(Arc::clone(&store) as Arc<dyn BackingStore>);
    let (list, parent) = list_parent(ChunkSize::Limited(10));

    conn.fetch_more(&parent);
    conn.pump_until_idle();
    assert_eq!(list.len(), 10);

    let added = conn.add_items(&entity(), vec![named("fresh")], true);
    assert_eq!(added.len(), 1);
    // The internal re-fetch drains the next chunk in insertion order; the
    // new row sits at the end of the cache and is not fast-forwarded.
    assert_eq!(list.len(), 20);
    assert!(!list.items().iter().any(|item| item.id == added[0].id));

    conn.fetch_more(&parent);
    assert_eq!(list.len(), 26);
    assert_eq!(list.items().last().map(|item| item.id), Some(added[0].id));
    assert_eq!(store.advance_calls(), 1);
}

#[test]
fn unlimited_parent_drains_everything_in_one_step() {
    let store = seeded(23, 5);
    let conn = Connection::open_default(Arc::clone(&store) as Arc<dyn BackingStore>);
    let (list, parent) = list_parent(ChunkSize::Unlimited);

    conn.fetch_more(&parent);
    conn.pump_until_idle();

    // Each completion re-enters the drain, which keeps asking for more
    // until the store reports exhaustion.
    assert_eq!(list.len(), 23);
    assert_eq!(parent.position(conn.id()), 23);
    assert!(parent.is_fetched());
    assert!(!parent.is_busy());
    assert!(!conn.can_fetch_more(&parent));
    assert_eq!(store.advance_calls(), 5);
}

/// A tree-node shaped parent that records expandability notifications.
struct ExpandableNode {
    accepts: bool,
    state: ParentState,
    notifications: AtomicUsize,
}

impl ExpandableNode {
    fn new(accepts: bool) -> Arc<Self> {
        Arc::new(Self {
            accepts,
            state: ParentState::new(),
            notifications: AtomicUsize::new(0),
        })
    }

    fn notifications(&self) -> usize {
        self.notifications.load(Ordering::Relaxed)
    }
}

impl FetchParent for ExpandableNode {
    fn fetch_item_type(&self) -> ItemType {
        entity()
    }

    fn state(&self) -> &ParentState {
        &self.state
    }

    fn accepts_item(&self, _item: &Item, _ctx: &FetchContext<'_>) -> bool {
        self.accepts
    }

    fn add_item(&self, _item: &Item, _ctx: &FetchContext<'_>) {}

    fn update_item(&self, _item: &Item, _ctx: &FetchContext<'_>) {}

    fn remove_item(&self, _item: &Item, _ctx: &FetchContext<'_>) {}

    fn will_have_children_change(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn expandability_notifications_fire_on_probe_resolution() {
    // No children: resolved false once the store is exhausted.
    let store = seeded(0, 10);
    let conn = Connection::open_default(Arc::clone(&store) as Arc<dyn BackingStore>);
    let empty = ExpandableNode::new(false);
    let parent: Arc<dyn FetchParent> = empty.clone();
    assert!(conn.can_fetch_more(&parent));
    conn.pump_until_idle();
    assert_eq!(parent.will_have_children(), Some(false));
    assert_eq!(empty.notifications(), 1);

    // Children exist: resolved true as soon as a row is accepted.
    let store = seeded(3, 10);
    let conn = Connection::open_default(Arc::clone(&store) as Arc<dyn BackingStore>);
    let full = ExpandableNode::new(true);
    let parent: Arc<dyn FetchParent> = full.clone();
    assert!(conn.can_fetch_more(&parent));
    conn.pump_until_idle();
    assert_eq!(parent.will_have_children(), Some(true));
    assert_eq!(full.notifications(), 1);
}

#[test]
fn refresh_mid_fetch_resets_parent_lazily() {
    let store = seeded(10, 5);
    let conn = Connection::open_default(Arc::clone(&store) as Arc<dyn BackingStore>);
    let (_list, parent) = list_parent(ChunkSize::Limited(5));

    conn.fetch_more(&parent);
    assert_eq!(parent.fetch_token(), Some(0));

    // Worker processes the advance, then the refresh; the completion sits in
    // the event queue when the waiter table is cleared.
    conn.refresh_session();
    conn.pump_until_idle();

    assert_eq!(conn.metrics().stale_completions, 1);
    // Not fast-forwarded: the parent is reset on its next touch.
    assert!(conn.can_fetch_more(&parent));
    assert_eq!(parent.fetch_token(), Some(1));
    assert_eq!(parent.position(conn.id()), 0);
    assert!(!parent.is_fetched());
    assert!(!parent.is_busy());
}

#[test]
fn probe_resolves_no_children_without_extra_queries() {
    let store = seeded(5, 1000);
    let conn = Connection::open_default(Arc::clone(&store) as Arc<dyn BackingStore>);
    let filtered = Arc::new(FilteredParent::new(
        entity(),
        ChunkSize::Default,
        |_item| false,
    ));
    let parent: Arc<dyn FetchParent> = filtered.clone();

    assert!(conn.can_fetch_more(&parent));
    conn.pump_until_idle();

    assert_eq!(parent.will_have_children(), Some(false));
    let calls = store.advance_calls();
    assert!(!conn.can_fetch_more(&parent));
    assert_eq!(store.advance_calls(), calls);
    assert_eq!(conn.metrics().probes_resolved_false, 1);

    // "Never lies": a full fetch of the type yields nothing for this parent.
    conn.fetch_more(&parent);
    conn.pump_until_idle();
    assert!(filtered.item_ids().is_empty());
}

#[test]
fn probe_never_perturbs_parent_positions() {
    let store = seeded(8, 1000);
    let conn = Connection::open_default(Arc::clone(&store) as Arc<dyn BackingStore>);
    let (_list, parent) = list_parent(ChunkSize::Limited(3));

    conn.fetch_more(&parent);
    conn.pump_until_idle();
    assert_eq!(parent.position(conn.id()), 3);

    // Registering a new unresolved parent restarts the probe walk from the
    // top of the cache; the first parent's cursor must not move.
    let other = Arc::new(FilteredParent::new(entity(), ChunkSize::Default, |item| {
        item.field("name").and_then(serde_json::Value::as_str) == Some("e7")
    }));
    let other_parent: Arc<dyn FetchParent> = other.clone();
    assert!(conn.can_fetch_more(&other_parent));
    assert_eq!(other_parent.will_have_children(), Some(true));
    assert_eq!(parent.position(conn.id()), 3);
    assert!(other.item_ids().is_empty());
}

#[test]
fn concurrent_parents_share_one_advance() {
    let store = seeded(6, 1000);
    let conn = Connection::open_default(Arc::clone(&store) as Arc<dyn BackingStore>);
    let (list_a, parent_a) = list_parent(ChunkSize::Limited(4));
    let (list_b, parent_b) = list_parent(ChunkSize::Limited(4));

    conn.fetch_more(&parent_a);
    conn.fetch_more(&parent_b);
    conn.pump_until_idle();

    assert_eq!(store.advance_calls(), 1);
    assert_eq!(conn.metrics().queries_dispatched, 1);
    assert_eq!(list_a.len(), 4);
    assert_eq!(list_b.len(), 4);
}

#[test]
fn fetch_more_on_fetched_parent_is_a_no_op() {
    let store = seeded(3, 1000);
    let conn = Connection::open_default(Arc::clone(&store) as Arc<dyn BackingStore>);
    let (list, parent) = list_parent(ChunkSize::Default);
    fetch_to_completion(&conn, &store, &parent);
    assert!(parent.is_fetched());

    let dispatched = conn.metrics().queries_dispatched;
    let position = parent.position(conn.id());
    conn.fetch_more(&parent);
    assert_eq!(conn.metrics().queries_dispatched, dispatched);
    assert_eq!(parent.position(conn.id()), position);
    assert!(parent.is_fetched());
    assert!(!parent.is_busy());
    assert_eq!(list.len(), 3);
}

#[test]
fn refetch_after_refresh_delivers_everything_again() {
    let store = seeded(7, 3);
    let conn = Connection::open_default(Arc::clone(&store) as Arc<dyn BackingStore>);
    let (list, parent) = list_parent(ChunkSize::Limited(3));
    fetch_to_completion(&conn, &store, &parent);
    assert_eq!(list.len(), 7);

    conn.refresh_session();
    assert!(conn.can_fetch_more(&parent));
    assert!(!parent.is_fetched());
    assert_eq!(parent.position(conn.id()), 0);

    fetch_to_completion(&conn, &store, &parent);
    // Same rows, delivered again under the new epoch.
    assert_eq!(list.len(), 14);
}

#[test]
fn mutations_propagate_to_bound_parents() {
    let store = seeded(3, 1000);
    let conn = Connection::open_default(Arc::clone(&store) as Arc<dyn BackingStore>);
    let (list, parent) = list_parent(ChunkSize::Default);
    fetch_to_completion(&conn, &store, &parent);
    let target = list.items()[1].id;

    let patch = Item::new(target).with_field("color", "blue");
    conn.update_items(&entity(), vec![patch], true);
    let updated = list
        .items()
        .into_iter()
        .find(|item| item.id == target)
        .expect("still present");
    assert_eq!(updated.field("color"), Some(&serde_json::json!("blue")));

    conn.remove_items(&entity(), &[target]);
    assert_eq!(list.len(), 2);
    assert!(!list.items().iter().any(|item| item.id == target));

    conn.restore_items(&entity(), &[target]);
    assert_eq!(list.len(), 3);
}

#[test]
fn validation_failures_are_reported_out_of_band() {
    let store = seeded(0, 1000);
    let conn = Connection::open_default(Arc::clone(&store) as Arc<dyn BackingStore>);

    let added = conn.add_items(
        &entity(),
        vec![named("ok"), Item::new(ItemId(0)).with_field("color", "red")],
        true,
    );
    assert_eq!(added.len(), 1);

    let errors = conn.drain_errors();
    match errors.as_slice() {
        [ErrorReport::Validation { errors, .. }] => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].message.contains("name"));
        }
        other => panic!("unexpected error reports: {other:?}"),
    }
}

#[test]
fn commit_cache_tracks_fetched_commit_membership() {
    init_tracing();
    let store = Arc::new(MemoryStore::with_batch_size(1000));
    let conn = Connection::open_default(Arc::clone(&store) as Arc<dyn BackingStore>);

    let added = conn.add_items(&entity(), vec![named("a"), named("b")], true);
    conn.commit_session("initial data");
    assert!(conn.known_commits().is_empty());

    // Commit membership is learned from fetched chunks.
    conn.refresh_session();
    conn.fetch_all(None);
    assert_eq!(conn.known_commits(), vec![CommitId(1)]);
    let ids = conn.commit_ids_for(CommitId(1), &entity());
    assert_eq!(ids.len(), added.len());

    // Another refresh drops learned membership until the data is re-fetched.
    conn.refresh_session();
    assert!(conn.known_commits().is_empty());
    conn.fetch_all(None);
    assert_eq!(conn.known_commits(), vec![CommitId(1)]);
}

#[test]
fn failed_session_ops_surface_on_the_error_channel() {
    let store = seeded(0, 1000);
    let conn = Connection::open_default(Arc::clone(&store) as Arc<dyn BackingStore>);

    // Nothing staged, nothing dirty: both session ops fail cleanly.
    conn.commit_session("empty");
    conn.rollback_session();
    let errors = conn.drain_errors();
    assert_eq!(errors.len(), 2);
    assert_eq!(conn.metrics().store_errors, 2);
    assert!(conn.drain_session_events().is_empty());
}

#[test]
fn obsolete_parent_stops_receiving_everything() {
    let store = seeded(4, 1000);
    let conn = Connection::open_default(Arc::clone(&store) as Arc<dyn BackingStore>);
    let (list, parent) = list_parent(ChunkSize::Limited(2));
    conn.fetch_more(&parent);
    conn.pump_until_idle();
    assert_eq!(list.len(), 2);
    let bound = list.items()[0].id;

    list.mark_obsolete();
    assert!(!conn.can_fetch_more(&parent));
    conn.fetch_more(&parent);
    conn.pump_until_idle();
    assert_eq!(list.len(), 2);

    // Bound mutation callbacks are silent no-ops as well.
    conn.remove_items(&entity(), &[bound]);
    assert_eq!(list.len(), 2);
}

proptest! {
    /// Every staged row is delivered exactly once, in cache insertion order,
    /// regardless of store batch size or parent chunk size; the parent's
    /// position never decreases along the way.
    #[test]
    fn delivery_is_complete_ordered_and_monotonic(
        row_count in 0usize..48,
        batch_size in 1usize..9,
        chunk in 1usize..9,
    ) {
        let store = Arc::new(MemoryStore::with_batch_size(batch_size));
        store.stage_rows(&entity(), (0..row_count).map(|n| named(&format!("e{n}"))));
        let conn = Connection::open(
            Arc::clone(&store) as Arc<dyn BackingStore>,
            EngineConfig::default(),
        );
        let (list, parent) = list_parent(ChunkSize::Limited(chunk));

        let mut last_position = 0;
        for _ in 0..1000 {
            if !conn.can_fetch_more(&parent) {
                break;
            }
            conn.fetch_more(&parent);
            conn.pump_until_idle();
            let position = parent.position(conn.id());
            prop_assert!(position >= last_position);
            last_position = position;
        }
        prop_assert!(!conn.can_fetch_more(&parent));

        let delivered: Vec<ItemId> = list.items().iter().map(|item| item.id).collect();
        let expected = store.cached_ids_from(&entity(), 0);
        prop_assert_eq!(delivered, expected);
    }
}
