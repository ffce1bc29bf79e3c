//! Strata Mapper - Identity Cache and Association Synchronization
//!
//! Maps mutable objects onto rows of a relational store through a
//! [`StoreGateway`](strata_storage::StoreGateway):
//!
//! - [`RowCodec`] converts rows to objects and renders per-class statements
//! - [`IdentityBroker`] guarantees one live instance per key per class and
//!   rekeys its cache when a key attribute changes
//! - [`Association`] tracks membership changes of one-to-one, one-to-many
//!   and many-to-many relationships and writes back exactly the difference
//! - [`Session`] ties one gateway to one broker per registered class
//!
//! ```ignore
//! let session = Session::builder(gateway).classes(schemas).build()?;
//! session.connect("orders.db")?;
//! let employee = session.get("Employee", ("n1001", "s1001"))?;
//! let orders = session.association(&employee, "orders")?;
//! orders.append(&session.get("Order", 3)?)?;
//! orders.update()?;
//! session.commit()?;
//! ```

pub mod association;
pub mod broker;
pub mod codec;
pub mod object;
pub mod session;

pub use association::Association;
pub use broker::{BrokerState, IdentityBroker};
pub use codec::{LinkCodec, RowCodec};
pub use object::{ObjectRef, WeakObjectRef};
pub use session::{Criteria, Session, SessionBuilder};
