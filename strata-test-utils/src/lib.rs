//! Strata Test Utilities
//!
//! Centralized test infrastructure for the Strata workspace:
//! - Fixture schemas (articles, orders, order items, employees) and a seeded
//!   in-memory store matching them
//! - Proptest generators for values and keys
//! - Custom assertions for Strata error categories
//! - Tracing initialization for tests

// Re-export the in-memory gateway from its source crate
pub use strata_storage::{LoggedStatement, MemoryGateway, Operation, StoreGateway, TableDef};

// Re-export core types for convenience
pub use strata_core::{
    AssociationDecl, AssociationError, Backing, Cardinality, IdentityError, Key, LoadPolicy,
    Placeholder, Row, SchemaDescriptor, SchemaError, StoreError, StrataConfig, StrataError,
    StrataResult, Value,
};

/// Install a test-writer tracing subscriber honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Strata values and keys.

    use super::*;
    use proptest::prelude::*;

    /// Any non-null value. Reals are finite so they print and compare sanely.
    pub fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            (-1.0e9f64..1.0e9f64).prop_map(Value::Real),
            "[a-zA-Z0-9 ]{0,16}".prop_map(Value::Text),
            prop::collection::vec(any::<u8>(), 0..8).prop_map(Value::Bytes),
        ]
    }

    /// Any value including NULL.
    pub fn arb_nullable_value() -> impl Strategy<Value = Value> {
        prop_oneof![1 => Just(Value::Null), 5 => arb_value()]
    }

    /// Complete key of 1 to 3 columns.
    pub fn arb_key() -> impl Strategy<Value = Key> {
        prop::collection::vec(arb_value(), 1..=3).prop_map(Key::new)
    }

    /// Integer primary key values usable against the fixture store.
    pub fn arb_id() -> impl Strategy<Value = i64> {
        1i64..10_000
    }

    /// Distinct employee name/surname pairs.
    pub fn arb_employee_names(max: usize) -> impl Strategy<Value = Vec<(String, String)>> {
        prop::collection::hash_set(("n[0-9]{4}", "s[0-9]{4}"), 1..=max)
            .prop_map(|set| set.into_iter().collect())
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Schemas and a seeded store for a small order-processing model:
    //!
    //! - `Article` on `article (id, name, price)`, `name` unique and not null
    //! - `Order` on `order (id, no, finished)`, `no` unique
    //! - `OrderItem` on `order_item (id, order_fkey, pos, article_fkey, quantity)`
    //! - `Employee` on `employee (name, surname, phone)` with a composite key
    //! - join relation `employee_orders (employee_name, employee_surname, order_id)`
    //!
    //! `Order.items` / `OrderItem.order` and `Order.employees` /
    //! `Employee.orders` are bidirectional pairs; `OrderItem.article` is a
    //! one-way reference.

    use super::*;

    pub fn article_schema() -> SchemaDescriptor {
        SchemaDescriptor::builder("Article", "article")
            .columns(["id", "name", "price"])
            .key(["id"])
            .build()
            .expect("article schema is valid")
    }

    pub fn order_schema() -> SchemaDescriptor {
        SchemaDescriptor::builder("Order", "order")
            .columns(["id", "no", "finished"])
            .key(["id"])
            .association(
                AssociationDecl::one_to_many("items", "OrderItem", ["order_fkey"])
                    .with_back_ref("order"),
            )
            .association(
                AssociationDecl::many_to_many(
                    "employees",
                    "Employee",
                    "employee_orders",
                    ["order_id"],
                    ["employee_name", "employee_surname"],
                )
                .with_back_ref("orders"),
            )
            .build()
            .expect("order schema is valid")
    }

    pub fn order_item_schema() -> SchemaDescriptor {
        SchemaDescriptor::builder("OrderItem", "order_item")
            .columns(["id", "order_fkey", "pos", "article_fkey", "quantity"])
            .key(["id"])
            .association(AssociationDecl::reference("order", "Order", ["order_fkey"]).with_back_ref("items"))
            .association(AssociationDecl::reference("article", "Article", ["article_fkey"]))
            .build()
            .expect("order item schema is valid")
    }

    pub fn employee_schema() -> SchemaDescriptor {
        SchemaDescriptor::builder("Employee", "employee")
            .columns(["name", "surname", "phone"])
            .key(["name", "surname"])
            .association(
                AssociationDecl::many_to_many(
                    "orders",
                    "Order",
                    "employee_orders",
                    ["employee_name", "employee_surname"],
                    ["order_id"],
                )
                .with_back_ref("employees"),
            )
            .build()
            .expect("employee schema is valid")
    }

    /// Every fixture schema, in registration order.
    pub fn all_schemas() -> Vec<SchemaDescriptor> {
        vec![
            article_schema(),
            order_schema(),
            order_item_schema(),
            employee_schema(),
        ]
    }

    /// Variant of [`all_schemas`] where `Order.items` and `OrderItem.order`
    /// are independent one-way associations over the same foreign key.
    pub fn one_way_schemas() -> Vec<SchemaDescriptor> {
        let order = SchemaDescriptor::builder("Order", "order")
            .columns(["id", "no", "finished"])
            .key(["id"])
            .association(AssociationDecl::one_to_many("items", "OrderItem", ["order_fkey"]))
            .build()
            .expect("one-way order schema is valid");
        let item = SchemaDescriptor::builder("OrderItem", "order_item")
            .columns(["id", "order_fkey", "pos", "article_fkey", "quantity"])
            .key(["id"])
            .association(AssociationDecl::reference("order", "Order", ["order_fkey"]))
            .association(AssociationDecl::reference("article", "Article", ["article_fkey"]))
            .build()
            .expect("one-way order item schema is valid");
        vec![article_schema(), order, item]
    }

    /// Table definitions matching [`all_schemas`], plus the join relation.
    pub fn table_defs() -> Vec<TableDef> {
        vec![
            TableDef::new("article", ["id", "name", "price"])
                .primary_key(["id"])
                .unique(["name"])
                .not_null(["name"]),
            TableDef::new("order", ["id", "no", "finished"])
                .primary_key(["id"])
                .unique(["no"]),
            TableDef::new("order_item", ["id", "order_fkey", "pos", "article_fkey", "quantity"])
                .primary_key(["id"]),
            TableDef::new("employee", ["name", "surname", "phone"]).primary_key(["name", "surname"]),
            TableDef::new("employee_orders", ["employee_name", "employee_surname", "order_id"])
                .primary_key(["employee_name", "employee_surname", "order_id"]),
        ]
    }

    /// DDL creating the fixture relations in SQLite.
    pub const SQLITE_DDL: &str = r#"
        CREATE TABLE "article" (
            "id" INTEGER PRIMARY KEY,
            "name" TEXT NOT NULL UNIQUE,
            "price" REAL
        );
        CREATE TABLE "order" (
            "id" INTEGER PRIMARY KEY,
            "no" TEXT UNIQUE,
            "finished" INTEGER
        );
        CREATE TABLE "order_item" (
            "id" INTEGER PRIMARY KEY,
            "order_fkey" INTEGER REFERENCES "order" ("id"),
            "pos" INTEGER,
            "article_fkey" INTEGER REFERENCES "article" ("id"),
            "quantity" INTEGER
        );
        CREATE TABLE "employee" (
            "name" TEXT NOT NULL,
            "surname" TEXT NOT NULL,
            "phone" TEXT,
            PRIMARY KEY ("name", "surname")
        );
        CREATE TABLE "employee_orders" (
            "employee_name" TEXT NOT NULL,
            "employee_surname" TEXT NOT NULL,
            "order_id" INTEGER NOT NULL REFERENCES "order" ("id"),
            PRIMARY KEY ("employee_name", "employee_surname", "order_id"),
            FOREIGN KEY ("employee_name", "employee_surname")
                REFERENCES "employee" ("name", "surname") ON UPDATE CASCADE
        );
    "#;

    /// Seed rows per relation.
    ///
    /// Orders 1 and 2 each have two items; order 3 has none. Employee
    /// `n1001 s1001` works on orders 1 and 2, `n1002 s1002` on order 2.
    pub fn seed_rows() -> Vec<(&'static str, Vec<Row>)> {
        vec![
            (
                "article",
                vec![
                    vec![Value::Int(1), "apple".into(), Value::Real(2.33)],
                    vec![Value::Int(2), "peach".into(), Value::Real(2.34)],
                    vec![Value::Int(3), "pear".into(), Value::Real(1.10)],
                ],
            ),
            (
                "order",
                vec![
                    vec![Value::Int(1), "ord-1".into(), Value::Bool(false)],
                    vec![Value::Int(2), "ord-2".into(), Value::Bool(false)],
                    vec![Value::Int(3), "ord-3".into(), Value::Bool(true)],
                ],
            ),
            (
                "order_item",
                vec![
                    item_row(1, Some(1), 1, 1, 10),
                    item_row(2, Some(1), 2, 2, 5),
                    item_row(3, Some(2), 1, 3, 1),
                    item_row(4, Some(2), 2, 1, 7),
                ],
            ),
            (
                "employee",
                vec![
                    vec!["n1001".into(), "s1001".into(), "555-1001".into()],
                    vec!["n1002".into(), "s1002".into(), "555-1002".into()],
                ],
            ),
            (
                "employee_orders",
                vec![
                    vec!["n1001".into(), "s1001".into(), Value::Int(1)],
                    vec!["n1001".into(), "s1001".into(), Value::Int(2)],
                    vec!["n1002".into(), "s1002".into(), Value::Int(2)],
                ],
            ),
        ]
    }

    pub fn item_row(id: i64, order: Option<i64>, pos: i64, article: i64, quantity: i64) -> Row {
        vec![
            Value::Int(id),
            Value::from(order),
            Value::Int(pos),
            Value::Int(article),
            Value::Int(quantity),
        ]
    }

    /// Seeded, not yet connected in-memory store.
    pub fn seeded_store() -> MemoryGateway {
        let mut gw = MemoryGateway::new();
        for def in table_defs() {
            gw.create_table(def).expect("fixture table is valid");
        }
        for (relation, rows) in seed_rows() {
            gw.seed(relation, rows).expect("fixture rows are valid");
        }
        gw
    }

    /// Seeded store, connected and ready for statements.
    pub fn connected_store() -> MemoryGateway {
        let mut gw = seeded_store();
        gw.connect("memory").expect("memory store connects");
        gw
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on Strata results and statement logs.

    use super::*;

    pub fn assert_store_error<T: std::fmt::Debug>(result: &StrataResult<T>) {
        match result {
            Err(StrataError::Store(_)) => {}
            other => panic!("Expected store error, got {:?}", other),
        }
    }

    pub fn assert_constraint_violation<T: std::fmt::Debug>(result: &StrataResult<T>) {
        match result {
            Err(StrataError::Store(StoreError::ConstraintViolation { .. })) => {}
            other => panic!("Expected constraint violation, got {:?}", other),
        }
    }

    pub fn assert_not_found<T: std::fmt::Debug>(result: &StrataResult<T>) {
        match result {
            Err(e) if e.is_not_found() => {}
            other => panic!("Expected not found, got {:?}", other),
        }
    }

    pub fn assert_association_error<T: std::fmt::Debug>(result: &StrataResult<T>) {
        match result {
            Err(StrataError::Association(_)) => {}
            other => panic!("Expected association error, got {:?}", other),
        }
    }

    /// Count logged writes of each kind against `relation`: (inserts, updates, deletes).
    pub fn write_counts(log: &[LoggedStatement], relation: &str) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for stmt in log.iter().filter(|s| s.operation.relation() == relation) {
            match stmt.operation {
                Operation::Insert { .. } => counts.0 += 1,
                Operation::Update { .. } => counts.1 += 1,
                Operation::Delete { .. } => counts.2 += 1,
                Operation::Select { .. } => {}
            }
        }
        counts
    }

    pub fn assert_no_writes(log: &[LoggedStatement]) {
        let writes: Vec<_> = log.iter().filter(|s| s.is_write()).map(|s| &s.sql).collect();
        assert!(writes.is_empty(), "Expected no writes, got {:?}", writes);
    }
}
