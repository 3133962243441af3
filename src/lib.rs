//! # minorm
//!
//! A thin, chainable ORM convenience layer over sqlx (SQLite): a
//! configuration struct, a forkable `Orm` handle, and an optional `Model`
//! abstraction for named, registrable entity types with specialization,
//! validation and factory hooks.
pub mod conf;
pub mod error;
pub mod model;
pub mod orm;
pub mod value;

pub use conf::Conf;
pub use error::{Error, Result};
pub use model::{ChangeSet, Entity, Model};
pub use orm::{FromRow, Orm};
pub use value::{RowMap, Value};
