//! Core mapper scenarios against SQLite, in memory and on disk.

use std::collections::BTreeSet;
use std::path::Path;

use proptest::prelude::*;
use strata_core::{Key, Placeholder, Value};
use strata_mapper::{Criteria, ObjectRef, Session};
use strata_sqlite::SqliteGateway;
use strata_storage::{Statement, StoreGateway};
use strata_test_utils::{assertions, fixtures, init_tracing};

/// Create the fixture relations and commit the seed rows.
fn prepare(gw: &mut SqliteGateway) {
    gw.execute_batch(fixtures::SQLITE_DDL).unwrap();
    let defs = fixtures::table_defs();
    for (relation, rows) in fixtures::seed_rows() {
        let def = defs.iter().find(|d| d.relation == relation).unwrap();
        let insert = Statement::insert(relation, def.columns.clone(), Placeholder::Question);
        for row in rows {
            gw.execute_write(&insert, &row).unwrap();
        }
    }
    gw.commit().unwrap();
}

fn session_over(gateway: SqliteGateway) -> Session<SqliteGateway> {
    Session::builder(gateway)
        .classes(fixtures::all_schemas())
        .build()
        .unwrap()
}

fn session() -> Session<SqliteGateway> {
    init_tracing();
    let mut gw = SqliteGateway::open_in_memory().unwrap();
    prepare(&mut gw);
    session_over(gw)
}

fn seed_file(path: &Path) {
    let mut gw = SqliteGateway::new();
    gw.connect(path.to_str().unwrap()).unwrap();
    prepare(&mut gw);
    gw.close().unwrap();
}

fn ids(objects: &[ObjectRef]) -> BTreeSet<i64> {
    objects
        .iter()
        .map(|o| o.get("id").unwrap().as_int().unwrap())
        .collect()
}

#[test]
fn test_sqlite_identity_and_stream_order() {
    let session = session();
    let pear = session.get("Article", 3).unwrap();
    let all = session.get_all("Article").unwrap();
    let names: Vec<Value> = all.iter().map(|a| a.get("name").unwrap()).collect();
    assert_eq!(names, vec!["apple".into(), "peach".into(), "pear".into()]);
    assert!(all[2].ptr_eq(&pear));
}

#[test]
fn test_sqlite_bool_column_reads_back_as_int() {
    let session = session();
    let finished = session.get("Order", 3).unwrap().get("finished").unwrap();
    assert_eq!(finished, Value::Int(1));
    assert_eq!(finished.as_bool(), Some(true));
}

#[test]
fn test_sqlite_rekey_cascades_to_join_relation() {
    let session = session();
    let employee = session.get("Employee", ("n1001", "s1001")).unwrap();
    employee.set("name", "nup1001").unwrap();
    session.update(&employee).unwrap();

    assert!(session.cached("Employee", ("n1001", "s1001")).unwrap().is_none());
    assert!(session
        .cached("Employee", ("nup1001", "s1001"))
        .unwrap()
        .unwrap()
        .ptr_eq(&employee));

    let orders = session.association(&employee, "orders").unwrap().members().unwrap();
    assert_eq!(ids(&orders), [1, 2].into_iter().collect());
}

#[test]
fn test_sqlite_key_mutation_failure_keeps_old_key() {
    let session = session();
    let pear = session.get("Article", 3).unwrap();
    pear.set("id", 1).unwrap();
    assertions::assert_constraint_violation(&session.update(&pear));
    assert_eq!(pear.key(), Some(Key::from(3i64)));
    assert!(session.cached("Article", 3).unwrap().unwrap().ptr_eq(&pear));
}

#[test]
fn test_sqlite_delete_referenced_row_is_rejected() {
    let session = session();
    let order = session.get("Order", 1).unwrap();
    assertions::assert_constraint_violation(&session.delete(&order));
    assert!(session.cached("Order", 1).unwrap().unwrap().ptr_eq(&order));
    assert_eq!(order.key(), Some(Key::from(1i64)));
}

#[test]
fn test_sqlite_one_to_many_removal_nulls_foreign_key() {
    let session = session();
    let order = session.get("Order", 1).unwrap();
    let item = session.get("OrderItem", 1).unwrap();
    let items = session.association(&order, "items").unwrap();
    items.remove(&item).unwrap();
    assert_eq!(items.update().unwrap(), 1);

    session.reload("OrderItem", true).unwrap();
    assert_eq!(item.get("order_fkey").unwrap(), Value::Null);
    assert_eq!(item.key(), Some(Key::from(1i64)));

    items.reload_data();
    assert_eq!(items.len().unwrap(), 1);
}

#[test]
fn test_sqlite_single_valued_set_moves_reference() {
    let session = session();
    let item = session.get("OrderItem", 3).unwrap();
    let o1 = session.get("Order", 1).unwrap();
    let order = session.association(&item, "order").unwrap();

    order.set(Some(&o1)).unwrap();
    assert_eq!(order.update().unwrap(), 2);

    let o1_items = session.association(&o1, "items").unwrap();
    assert!(o1_items.contains(&item).unwrap());
    assert!(o1_items.pending_additions().is_empty());

    session.reload("OrderItem", true).unwrap();
    assert_eq!(item.get("order_fkey").unwrap(), Value::Int(1));
}

#[test]
fn test_sqlite_find_by_related_object() {
    let session = session();
    let o2 = session.get("Order", 2).unwrap();
    let found = session
        .find("OrderItem", &Criteria::new().related("order", &o2))
        .unwrap();
    assert_eq!(ids(&found), [3, 4].into_iter().collect());
    let item3 = session.get("OrderItem", 3).unwrap();
    assert!(found.iter().any(|i| i.ptr_eq(&item3)));
}

#[test]
fn test_sqlite_failed_write_back_keeps_pending_until_reload() {
    let session = session();
    let employee = session.get("Employee", ("n1001", "s1001")).unwrap();
    let o3 = session.get("Order", 3).unwrap();
    let orders = session.association(&employee, "orders").unwrap();
    orders.append(&o3).unwrap();

    // Another writer inserts the same join row first.
    let insert = Statement::insert(
        "employee_orders",
        vec![
            "employee_name".to_string(),
            "employee_surname".to_string(),
            "order_id".to_string(),
        ],
        Placeholder::Question,
    );
    session
        .gateway_mut()
        .execute_write(&insert, &["n1001".into(), "s1001".into(), Value::Int(3)])
        .unwrap();

    assertions::assert_constraint_violation(&orders.update());
    assert_eq!(orders.pending_additions(), vec![o3.clone()]);

    session.rollback().unwrap();
    orders.reload_data();
    assert!(orders.pending_additions().is_empty());
    assert_eq!(ids(&orders.members().unwrap()), [1, 2].into_iter().collect());
}

#[test]
fn test_sqlite_rollback_then_reload_forgets_uncommitted_rows() {
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

    session.rollback().unwrap();
    session.reload("Article", false).unwrap();
    assert_eq!(session.get_all("Article").unwrap().len(), 3);
    assert_eq!(kiwi.key(), None);
}

#[test]
fn test_sqlite_committed_write_back_survives_reconnect() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orders.db");
    seed_file(&path);
    let source = path.to_str().unwrap();

    let session = session_over(SqliteGateway::new());
    session.connect(source).unwrap();
    let employee = session.get("Employee", ("n1001", "s1001")).unwrap();
    let o1 = session.get("Order", 1).unwrap();
    let o3 = session.get("Order", 3).unwrap();
    let orders = session.association(&employee, "orders").unwrap();
    orders.append(&o3).unwrap();
    orders.remove(&o1).unwrap();
    assert_eq!(orders.update().unwrap(), 2);
    session.commit().unwrap();
    session.close().unwrap();
    drop(orders);
    drop(session);

    let session = session_over(SqliteGateway::new());
    session.connect(source).unwrap();
    let employee = session.get("Employee", ("n1001", "s1001")).unwrap();
    let orders = session.association(&employee, "orders").unwrap().members().unwrap();
    assert_eq!(ids(&orders), [2, 3].into_iter().collect());
}

#[test]
fn test_sqlite_uncommitted_work_is_lost_on_close() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orders.db");
    seed_file(&path);
    let source = path.to_str().unwrap();

    let session = session_over(SqliteGateway::new());
    session.connect(source).unwrap();
    let apple = session.get("Article", 1).unwrap();
    apple.set("price", 9.99).unwrap();
    session.update(&apple).unwrap();
    session.close().unwrap();
    assert!(!session.is_connected());

    session.connect(source).unwrap();
    session.reload("Article", true).unwrap();
    assert_eq!(apple.get("price").unwrap(), Value::Real(2.33));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// After write-back the join relation holds exactly the in-memory view.
    #[test]
    fn prop_sqlite_join_write_back_matches_view(toggles in prop::collection::vec(1i64..=3, 0..8)) {
        let session = session();
        let employee = session.get("Employee", ("n1002", "s1002")).unwrap();
        let orders = session.association(&employee, "orders").unwrap();
        for id in toggles {
            let order = session.get("Order", id).unwrap();
            if orders.contains(&order).unwrap() {
                orders.remove(&order).unwrap();
            } else {
                orders.append(&order).unwrap();
            }
        }
        let view = ids(&orders.members().unwrap());
        orders.update().unwrap();

        orders.reload_data();
        prop_assert_eq!(ids(&orders.members().unwrap()), view);
        prop_assert_eq!(orders.update().unwrap(), 0);
    }
}
