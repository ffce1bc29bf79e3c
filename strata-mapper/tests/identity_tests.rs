//! Identity broker behavior through a session over the in-memory store.

use proptest::prelude::*;
use strata_core::{Key, LoadPolicy, StoreError, StrataConfig, StrataError, Value};
use strata_mapper::Session;
use strata_storage::{MemoryGateway, Statement, StoreGateway};
use strata_test_utils::{assertions, fixtures, generators, init_tracing};

fn session_with(config: StrataConfig) -> Session<MemoryGateway> {
    init_tracing();
    let session = Session::builder(fixtures::seeded_store())
        .config(config)
        .classes(fixtures::all_schemas())
        .build()
        .unwrap();
    session.connect("memory").unwrap();
    session
}

fn session() -> Session<MemoryGateway> {
    session_with(StrataConfig::default())
}

#[test]
fn test_get_and_get_all_share_instances() {
    let session = session();
    let first = session.get("Order", 2).unwrap();
    let all = session.get_all("Order").unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().any(|o| o.ptr_eq(&first)));

    let again = session.get("Order", 2).unwrap();
    assert!(again.ptr_eq(&first));
}

#[test]
fn test_association_load_shares_instances_with_lookup() {
    let session = session();
    let order = session.get("Order", 1).unwrap();
    let items = session.association(&order, "items").unwrap().members().unwrap();
    let direct = session.get("OrderItem", 1).unwrap();
    assert!(items.iter().any(|i| i.ptr_eq(&direct)));

    let employee = session.get("Employee", ("n1001", "s1001")).unwrap();
    let orders = session.association(&employee, "orders").unwrap().members().unwrap();
    assert!(orders.iter().any(|o| o.ptr_eq(&order)));
}

#[test]
fn test_get_all_keeps_stream_order() {
    let session = session();
    session.get("Article", 3).unwrap();
    let names: Vec<Value> = session
        .get_all("Article")
        .unwrap()
        .iter()
        .map(|a| a.get("name").unwrap())
        .collect();
    assert_eq!(names, vec!["apple".into(), "peach".into(), "pear".into()]);
}

#[test]
fn test_rekey_composite_key() {
    let session = session();
    let employee = session.get("Employee", ("n1001", "s1001")).unwrap();
    let before = session.cache_len("Employee").unwrap();

    employee.set("name", "nup1001").unwrap();
    session.update(&employee).unwrap();

    assert!(session.cached("Employee", ("n1001", "s1001")).unwrap().is_none());
    let rekeyed = session.cached("Employee", ("nup1001", "s1001")).unwrap().unwrap();
    assert!(rekeyed.ptr_eq(&employee));
    assert_eq!(session.cache_len("Employee").unwrap(), before);
    assert_eq!(employee.key(), Some(Key::from(("nup1001", "s1001"))));

    // The row moved in the store as well.
    session.reload("Employee", true).unwrap();
    assert!(session.get("Employee", ("nup1001", "s1001")).unwrap().ptr_eq(&employee));
    assertions::assert_not_found(&session.get("Employee", ("n1001", "s1001")));
}

#[test]
fn test_key_mutation_failure_keeps_old_key() {
    let session = session();
    let pear = session.get("Article", 3).unwrap();
    // Article 1 exists in the store but not in the cache.
    pear.set("id", 1).unwrap();

    let result = session.update(&pear);
    assertions::assert_constraint_violation(&result);
    assert_eq!(pear.key(), Some(Key::from(3i64)));
    assert!(session.cached("Article", 3).unwrap().unwrap().ptr_eq(&pear));
    assert!(session.cached("Article", 1).unwrap().is_none());
}

#[test]
fn test_rekey_onto_cached_key_is_rejected_before_writing() {
    let session = session();
    let apple = session.get("Article", 1).unwrap();
    let pear = session.get("Article", 3).unwrap();
    pear.set("id", 1).unwrap();

    let err = session.update(&pear).unwrap_err();
    assert!(matches!(
        err,
        StrataError::Identity(strata_core::IdentityError::DuplicateKey { .. })
    ));
    assert!(session.gateway().writes().is_empty());
    assert!(session.cached("Article", 1).unwrap().unwrap().ptr_eq(&apple));
    assert_eq!(pear.key(), Some(Key::from(3i64)));
}

#[test]
fn test_update_of_never_added_object_fails() {
    let session = session();
    let article = session
        .create("Article")
        .unwrap()
        .with("id", 40)
        .unwrap()
        .with("name", "plum")
        .unwrap();
    let err = session.update(&article).unwrap_err();
    assert_eq!(
        err,
        StrataError::from(StoreError::UnassignedKey {
            class: "Article".to_string()
        })
    );
    assert!(session.gateway().writes().is_empty());
}

#[test]
fn test_add_then_update_round_trip() {
    let session = session();
    let kiwi = session
        .create("Article")
        .unwrap()
        .with("id", 4)
        .unwrap()
        .with("name", "kiwi")
        .unwrap();
    session.add(&kiwi).unwrap();
    assert_eq!(kiwi.key(), Some(Key::from(4i64)));

    kiwi.set("price", 0.99).unwrap();
    session.update(&kiwi).unwrap();
    session.commit().unwrap();

    kiwi.set("price", 5.0).unwrap();
    session.reload("Article", true).unwrap();
    assert_eq!(kiwi.get("price").unwrap(), Value::Real(0.99));
    assert!(session.get("Article", 4).unwrap().ptr_eq(&kiwi));
}

#[test]
fn test_add_duplicate_of_cached_key_is_rejected() {
    let session = session();
    session.get("Article", 1).unwrap();
    let twin = session
        .create("Article")
        .unwrap()
        .with("id", 1)
        .unwrap()
        .with("name", "apple twin")
        .unwrap();
    let err = session.add(&twin).unwrap_err();
    assert!(matches!(err, StrataError::Identity(_)));
    assert!(session.gateway().writes().is_empty());
}

#[test]
fn test_rollback_then_reload_forgets_uncommitted_rows() {
    let session = session();
    session.get_all("Article").unwrap();
    let kiwi = session
        .create("Article")
        .unwrap()
        .with("id", 4)
        .unwrap()
        .with("name", "kiwi")
        .unwrap();
    session.add(&kiwi).unwrap();
    assert_eq!(session.cache_len("Article").unwrap(), 4);

    session.rollback().unwrap();
    // Rollback alone does not touch the cache.
    assert_eq!(session.cache_len("Article").unwrap(), 4);

    session.reload("Article", false).unwrap();
    assert_eq!(session.get_all("Article").unwrap().len(), 3);
    assert_eq!(kiwi.key(), None);
}

#[test]
fn test_delete_removes_row_and_entry() {
    let session = session();
    let order = session.get("Order", 3).unwrap();
    session.delete(&order).unwrap();
    assert!(session.cached("Order", 3).unwrap().is_none());
    assertions::assert_not_found(&session.get("Order", 3));
}

#[test]
fn test_full_policy_loads_whole_relation_once() {
    let session = session_with(StrataConfig::new(LoadPolicy::Full));
    session.get("OrderItem", 2).unwrap();
    assert_eq!(session.cache_len("OrderItem").unwrap(), 4);
    session.get("OrderItem", 4).unwrap();
    assert_eq!(session.gateway().log().len(), 1);
}

#[test]
fn test_out_of_band_change_is_seen_after_reload() {
    let session = session();
    let peach = session.get("Article", 2).unwrap();
    let stmt = Statement::update(
        "article",
        vec!["price".to_string()],
        vec!["id".to_string()],
        session.config().placeholder.unwrap_or_default(),
    );
    session
        .gateway_mut()
        .execute_write(&stmt, &[Value::Real(3.5), Value::Int(2)])
        .unwrap();

    assert_eq!(peach.get("price").unwrap(), Value::Real(2.34));
    session.reload("Article", true).unwrap();
    assert_eq!(peach.get("price").unwrap(), Value::Real(3.5));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Every lookup of a key yields the instance of the first lookup.
    #[test]
    fn prop_repeated_lookups_share_identity(ids in prop::collection::vec(1i64..=3, 1..12)) {
        let session = session();
        let first: Vec<_> = (1i64..=3).map(|id| session.get("Article", id).unwrap()).collect();
        for id in ids {
            let again = session.get("Article", id).unwrap();
            prop_assert!(again.ptr_eq(&first[(id - 1) as usize]));
        }
        for obj in session.get_all("Article").unwrap() {
            prop_assert!(first.iter().any(|f| f.ptr_eq(&obj)));
        }
    }

    /// Rekeying leaves exactly one entry, under the new key.
    #[test]
    fn prop_rekey_moves_single_entry(new_id in generators::arb_id()) {
        prop_assume!(!(1..=3).contains(&new_id));
        let session = session();
        let apple = session.get("Article", 1).unwrap();
        apple.set("id", new_id).unwrap();
        session.update(&apple).unwrap();

        prop_assert!(session.cached("Article", 1).unwrap().is_none());
        prop_assert!(session.cached("Article", new_id).unwrap().unwrap().ptr_eq(&apple));
        prop_assert_eq!(session.cache_len("Article").unwrap(), 1);
    }
}
