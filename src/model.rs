//! Registered model descriptors with caller-supplied behavior.
//!
//! An [`Entity`] describes a table-backed row type; a [`Model<T>`] wraps an
//! entity with a registry name and three optional hooks: specialization of a
//! raw row map into an instance, validation of a proposed change-set, and a
//! factory for fresh empty instances. Model operations delegate to [`Orm`],
//! adding validation gating and manual row materialization for `find`.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::FromRow;
use sqlx::sqlite::SqliteRow;

use crate::error::{Error, Result};
use crate::orm::Orm;
use crate::value::{RowMap, Value};

/// A caller-provided mapping of field name to proposed new value, used for
/// validated create/update operations. Unknown fields are silently ignored
/// when applied.
pub type ChangeSet = serde_json::Map<String, serde_json::Value>;

/// A table-backed row type.
///
/// Implementations declare the table name and its columns; the DDL and the
/// migration entry point have default implementations.
#[async_trait]
pub trait Entity: Send + Sync {
    fn table_name() -> &'static str;

    /// Declared columns as `(name, sql_type)` pairs, primary key included.
    fn columns() -> Vec<(String, String)>;

    fn primary_key() -> &'static str {
        "id"
    }

    fn create_table_sql() -> String {
        let defs: Vec<String> = Self::columns()
            .iter()
            .map(|(name, sqltype)| {
                if name == Self::primary_key() {
                    format!("{} {} PRIMARY KEY", name, sqltype)
                } else {
                    format!("{} {}", name, sqltype)
                }
            })
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            Self::table_name(),
            defs.join(", ")
        )
    }

    /// Create the table or add newly declared columns to it.
    async fn migrate(orm: &Orm) -> Result<()>
    where
        Self: Sized,
    {
        orm.auto_migrate::<Self>().await
    }
}

type SpecializeFn<T> = Box<dyn Fn(&RowMap) -> T + Send + Sync>;
type ValidateFn = Box<dyn Fn(&ChangeSet) -> std::result::Result<(), String> + Send + Sync>;
type FactoryFn<T> = Box<dyn Fn() -> T + Send + Sync>;

/// A named, registrable descriptor for an entity type.
///
/// All hooks are optional: specialization defaults to a serde round-trip from
/// the row map, validation defaults to accepting everything, and the factory
/// defaults to `T::default()`.
pub struct Model<T> {
    name: String,
    specialize: Option<SpecializeFn<T>>,
    validate: Option<ValidateFn>,
    factory: Option<FactoryFn<T>>,
}

impl<T> Model<T> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Model<T>
where
    T: Entity
        + Default
        + Serialize
        + DeserializeOwned
        + for<'r> FromRow<'r, SqliteRow>
        + Send
        + Sync
        + Unpin
        + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Model {
            name: name.into(),
            specialize: None,
            validate: None,
            factory: None,
        }
    }

    /// Convert a raw column-name → driver-value map into an instance.
    pub fn with_specialize(mut self, f: impl Fn(&RowMap) -> T + Send + Sync + 'static) -> Self {
        self.specialize = Some(Box::new(f));
        self
    }

    /// Validate a proposed change-set; an `Err(reason)` rejects the write.
    pub fn with_validate(
        mut self,
        f: impl Fn(&ChangeSet) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validate = Some(Box::new(f));
        self
    }

    /// Produce a fresh empty instance.
    pub fn with_factory(mut self, f: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.factory = Some(Box::new(f));
        self
    }

    pub fn new_instance(&self) -> T {
        match &self.factory {
            Some(f) => f(),
            None => T::default(),
        }
    }

    pub fn specialize_row(&self, row: &RowMap) -> T {
        match &self.specialize {
            Some(f) => f(row),
            None => {
                let mut obj = serde_json::Map::new();
                for (name, value) in row {
                    obj.insert(name.clone(), value.to_json());
                }
                serde_json::from_value(serde_json::Value::Object(obj))
                    .unwrap_or_else(|_| self.new_instance())
            }
        }
    }

    pub fn validate(&self, changes: &ChangeSet) -> Result<()> {
        if let Some(f) = &self.validate {
            f(changes).map_err(Error::Validation)?;
        }
        Ok(())
    }

    /// Validate and insert a new row built from `changes`.
    ///
    /// On validation failure no write is attempted. The change-set is applied
    /// to a fresh instance via a JSON round-trip, so unknown fields are
    /// silently dropped.
    pub async fn create(&self, orm: &Orm, changes: &ChangeSet) -> Result<T> {
        self.validate(changes)?;

        let mut base = serde_json::to_value(self.new_instance())?;
        if let serde_json::Value::Object(obj) = &mut base {
            for (name, value) in changes {
                obj.insert(name.clone(), value.clone());
            }
        }
        let value: T = serde_json::from_value(base)?;

        let id = orm.insert(&value).await?;
        match orm.fetch_by_id::<T>(id).await? {
            Some(row) => Ok(row),
            None => Ok(value),
        }
    }

    /// Validate and apply `changes` as a partial update of `value`, keyed by
    /// its primary key (at most one row affected).
    pub async fn update(&self, orm: &Orm, value: &T, changes: &ChangeSet) -> Result<T> {
        self.validate(changes)?;

        let pk = pk_value(value)?;
        if is_empty_key(&pk) {
            return Err(Error::MissingPrimaryKey);
        }
        orm.update_by_pk::<T>(&pk, changes).await?;

        match orm.fetch_by_id::<T>(pk.as_i64().unwrap_or(0)).await? {
            Some(row) => Ok(row),
            None => Err(Error::MissingPrimaryKey),
        }
    }

    /// Delete by primary key. No validation.
    pub async fn delete(&self, orm: &Orm, value: &T) -> Result<u64> {
        orm.delete(value).await
    }

    /// First matching row honoring the handle's pending filters; a missing
    /// row is `None`, never a zero-valued instance.
    pub async fn first(&self, orm: &Orm) -> Result<Option<T>> {
        orm.first::<T>().await
    }

    pub async fn count(&self, orm: &Orm) -> Result<u64> {
        orm.count::<T>().await
    }

    /// Raw-rows query: every returned row is materialized into a column map
    /// and handed to the specialize hook, accumulating in row order.
    ///
    /// A query or scan error aborts with `Err` and yields no partial results;
    /// zero matching rows yield an empty vector.
    pub async fn find(&self, orm: &Orm, query: &str, args: Vec<Value>) -> Result<Vec<T>> {
        let sql = if query.trim().is_empty() {
            format!("SELECT * FROM {}", T::table_name())
        } else {
            format!("SELECT * FROM {} WHERE {}", T::table_name(), query)
        };
        let rows = orm.rows(&sql, args).await?;
        Ok(rows.iter().map(|row| self.specialize_row(row)).collect())
    }
}

/// Extract the serialized primary key of a value; `Null` when absent.
pub(crate) fn pk_value<T: Entity + Serialize>(value: &T) -> Result<serde_json::Value> {
    let json = serde_json::to_value(value)?;
    Ok(json
        .get(T::primary_key())
        .cloned()
        .unwrap_or(serde_json::Value::Null))
}

/// The new-record predicate: a primary key is empty when it is null, zero, or
/// an empty string.
pub(crate) fn is_empty_key(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Number(n) => n.as_f64() == Some(0.0),
        serde_json::Value::String(s) => s.is_empty(),
        _ => false,
    }
}
