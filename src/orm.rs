//! Chainable ORM handle over sqlx (SQLite).
//!
//! Usage:
//! let orm = Orm::create(Conf::default()).await?;
//! orm.auto_migrate::<User>().await?;
//! let users = orm.filter("name = ?", params!["Alice"]).find::<User>().await?;
//!
//! Every chainable operation forks the handle first: the fork shares the
//! physical connection pool, the configuration and the model registry, but
//! owns its pending query state (table, filters, limit) exclusively, so
//! sibling chains never contaminate each other.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::{debug, error, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
pub use sqlx::FromRow;
use sqlx::sqlite::{SqliteArguments, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row, Sqlite};

use crate::conf::Conf;
use crate::error::{Error, Result};
use crate::model::{ChangeSet, Entity, Model, is_empty_key, pk_value};
use crate::value::{RowMap, Value, bind_json, bind_value, row_to_map};

type Registry = Arc<RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>>;

#[derive(Clone, Debug)]
struct Filter {
    expr: String,
    args: Vec<Value>,
}

/// Pending query-builder state, owned per handle.
#[derive(Clone, Debug, Default)]
struct QueryState {
    table: Option<String>,
    filters: Vec<Filter>,
    limit: Option<u64>,
}

/// A database handle: one shared connection pool plus a registry of named
/// models and this branch's pending query state.
pub struct Orm {
    conf: Arc<Conf>,
    pool: Option<SqlitePool>,
    registry: Registry,
    state: QueryState,
}

impl std::fmt::Debug for Orm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orm")
            .field("conf", &self.conf)
            .field("pool", &self.pool)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Forks the handle: configuration, pool and registry are shared by
/// reference, the pending query state is copied so the fork can diverge.
impl Clone for Orm {
    fn clone(&self) -> Self {
        Orm {
            conf: self.conf.clone(),
            pool: self.pool.clone(),
            registry: self.registry.clone(),
            state: self.state.clone(),
        }
    }
}

impl Orm {
    /// Allocate a handle for `conf`; connects immediately when
    /// `conf.auto_open` is set, otherwise `open()` is up to the caller.
    pub async fn create(conf: Conf) -> Result<Orm> {
        let mut orm = Orm {
            conf: Arc::new(conf),
            pool: None,
            registry: Arc::new(RwLock::new(HashMap::new())),
            state: QueryState::default(),
        };
        if orm.conf.auto_open {
            orm.open().await?;
        }
        Ok(orm)
    }

    /// Open the connection pool using `Conf::connection_url()`.
    pub async fn open(&mut self) -> Result<()> {
        let url = self.conf.connection_url()?;
        // An in-memory database must stay on one connection: every pooled
        // connection would otherwise see its own empty database.
        let pool = if url.contains(":memory:") || url.contains("mode=memory") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect(&url)
                .await?
        } else {
            SqlitePool::connect(&url).await?
        };
        self.pool = Some(pool);
        if self.conf.debug_logging {
            info!("Opened ORM connection: {}", url);
        }
        Ok(())
    }

    /// Close the shared pool. The pool is shared across every fork of this
    /// handle, so closing any one of them closes it for all.
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
            if self.conf.debug_logging {
                info!("Closed ORM connection");
            }
        }
    }

    pub fn conf(&self) -> &Conf {
        &self.conf
    }

    /// Raw backend access for anything the wrapper does not cover.
    pub fn pool(&self) -> Result<&SqlitePool> {
        self.pool.as_ref().ok_or(Error::NotConnected)
    }

    fn trace(&self, sql: &str) {
        if self.conf.debug_logging {
            debug!("SQL: {}", sql);
        }
    }

    // ---- chainable builders ------------------------------------------------

    /// Fork with an explicit table override.
    pub fn table(&self, name: &str) -> Orm {
        let mut clone = self.clone();
        clone.state.table = Some(name.to_string());
        clone
    }

    /// Fork targeting `T`'s table.
    pub fn model<T: Entity>(&self) -> Orm {
        let mut clone = self.clone();
        clone.state.table = Some(T::table_name().to_string());
        clone
    }

    /// Fork with an additional `WHERE` fragment; fragments accumulate with
    /// `AND`. Use `?` placeholders for `args`.
    pub fn filter(&self, expr: &str, args: Vec<Value>) -> Orm {
        let mut clone = self.clone();
        clone.state.filters.push(Filter {
            expr: expr.to_string(),
            args,
        });
        clone
    }

    /// Fork with a row limit for `find`.
    pub fn limit(&self, n: u64) -> Orm {
        let mut clone = self.clone();
        clone.state.limit = Some(n);
        clone
    }

    fn table_for<T: Entity>(&self) -> String {
        self.state
            .table
            .clone()
            .unwrap_or_else(|| T::table_name().to_string())
    }

    fn where_clause(&self) -> String {
        if self.state.filters.is_empty() {
            String::new()
        } else {
            let parts: Vec<String> = self
                .state
                .filters
                .iter()
                .map(|f| format!("({})", f.expr))
                .collect();
            format!(" WHERE {}", parts.join(" AND "))
        }
    }

    fn bind_filters_as<'q, T>(
        &self,
        mut query: sqlx::query::QueryAs<'q, Sqlite, T, SqliteArguments<'q>>,
    ) -> sqlx::query::QueryAs<'q, Sqlite, T, SqliteArguments<'q>> {
        for filter in &self.state.filters {
            for arg in &filter.args {
                query = match arg {
                    Value::Null => query.bind(None::<i64>),
                    Value::Integer(i) => query.bind(*i),
                    Value::Real(f) => query.bind(*f),
                    Value::Text(s) => query.bind(s.clone()),
                    Value::Blob(b) => query.bind(b.clone()),
                };
            }
        }
        query
    }

    // ---- typed query operations --------------------------------------------

    /// First matching row, or `None`.
    pub async fn first<T>(&self) -> Result<Option<T>>
    where
        T: Entity + for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        let sql = format!(
            "SELECT * FROM {}{} LIMIT 1",
            self.table_for::<T>(),
            self.where_clause()
        );
        self.trace(&sql);
        let query = self.bind_filters_as(sqlx::query_as::<_, T>(&sql));
        Ok(query.fetch_optional(self.pool()?).await?)
    }

    /// Last matching row by primary key order, or `None`.
    pub async fn last<T>(&self) -> Result<Option<T>>
    where
        T: Entity + for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        let sql = format!(
            "SELECT * FROM {}{} ORDER BY {} DESC LIMIT 1",
            self.table_for::<T>(),
            self.where_clause(),
            T::primary_key()
        );
        self.trace(&sql);
        let query = self.bind_filters_as(sqlx::query_as::<_, T>(&sql));
        Ok(query.fetch_optional(self.pool()?).await?)
    }

    /// All matching rows, honoring pending filters and limit.
    pub async fn find<T>(&self) -> Result<Vec<T>>
    where
        T: Entity + for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        let mut sql = format!(
            "SELECT * FROM {}{}",
            self.table_for::<T>(),
            self.where_clause()
        );
        if let Some(n) = self.state.limit {
            sql.push_str(&format!(" LIMIT {}", n));
        }
        self.trace(&sql);
        let query = self.bind_filters_as(sqlx::query_as::<_, T>(&sql));
        Ok(query.fetch_all(self.pool()?).await?)
    }

    /// Fetch one row by primary key.
    pub async fn fetch_by_id<T>(&self, id: i64) -> Result<Option<T>>
    where
        T: Entity + for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ? LIMIT 1",
            self.table_for::<T>(),
            T::primary_key()
        );
        self.trace(&sql);
        Ok(sqlx::query_as::<_, T>(&sql)
            .bind(id)
            .fetch_optional(self.pool()?)
            .await?)
    }

    /// Count matching rows.
    pub async fn count<T: Entity>(&self) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            self.table_for::<T>(),
            self.where_clause()
        );
        self.trace(&sql);
        let query = self.bind_filters_as(sqlx::query_as::<_, (i64,)>(&sql));
        let (n,) = query.fetch_one(self.pool()?).await?;
        Ok(n.max(0) as u64)
    }

    /// Insert a new row from the value's serialized fields, returning the
    /// inserted row id. An empty primary key is left to the database.
    pub async fn insert<T: Entity + Serialize>(&self, value: &T) -> Result<i64> {
        let json = serde_json::to_value(value)?;
        let obj = json
            .as_object()
            .ok_or_else(|| Error::Query("entity must serialize to an object".to_string()))?;

        let pk = T::primary_key();
        let mut cols: Vec<String> = Vec::new();
        let mut vals: Vec<serde_json::Value> = Vec::new();
        for (name, _sqltype) in T::columns() {
            let field = obj.get(&name).cloned().unwrap_or(serde_json::Value::Null);
            if name == pk && is_empty_key(&field) {
                continue;
            }
            cols.push(name);
            vals.push(field);
        }

        let sql = if cols.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", self.table_for::<T>())
        } else {
            let placeholders = vec!["?"; cols.len()].join(", ");
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.table_for::<T>(),
                cols.join(", "),
                placeholders
            )
        };
        self.trace(&sql);
        let mut query = sqlx::query(&sql);
        for val in &vals {
            query = bind_json(query, val);
        }
        let result = query.execute(self.pool()?).await?;
        Ok(result.last_insert_rowid())
    }

    /// Partial update keyed by primary key. Change-set keys naming no
    /// declared column (and the primary key itself) are skipped.
    pub(crate) async fn update_by_pk<T: Entity>(
        &self,
        pk: &serde_json::Value,
        changes: &ChangeSet,
    ) -> Result<u64> {
        let pk_col = T::primary_key();
        let cols: Vec<String> = T::columns().into_iter().map(|(name, _)| name).collect();

        let mut sets: Vec<String> = Vec::new();
        let mut vals: Vec<serde_json::Value> = Vec::new();
        for (name, val) in changes {
            if name == pk_col || !cols.iter().any(|c| c == name) {
                continue;
            }
            sets.push(format!("{} = ?", name));
            vals.push(val.clone());
        }
        if sets.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            self.table_for::<T>(),
            sets.join(", "),
            pk_col
        );
        self.trace(&sql);
        let mut query = sqlx::query(&sql);
        for val in &vals {
            query = bind_json(query, val);
        }
        query = bind_json(query, pk);
        Ok(query.execute(self.pool()?).await?.rows_affected())
    }

    /// Insert when the value is a new record, otherwise update every declared
    /// column by primary key. Returns the row id.
    pub async fn save<T: Entity + Serialize>(&self, value: &T) -> Result<i64> {
        if self.is_new_record(value)? {
            return self.insert(value).await;
        }

        let pk = pk_value(value)?;
        let json = serde_json::to_value(value)?;
        let obj = json
            .as_object()
            .ok_or_else(|| Error::Query("entity must serialize to an object".to_string()))?;
        let mut changes = ChangeSet::new();
        for (name, _sqltype) in T::columns() {
            if name == T::primary_key() {
                continue;
            }
            changes.insert(
                name.clone(),
                obj.get(&name).cloned().unwrap_or(serde_json::Value::Null),
            );
        }
        self.update_by_pk::<T>(&pk, &changes).await?;
        Ok(pk.as_i64().unwrap_or(0))
    }

    /// Delete by primary key, at most one row. A value with an empty primary
    /// key is a programmer error and is rejected.
    pub async fn delete<T: Entity + Serialize>(&self, value: &T) -> Result<u64> {
        let pk = pk_value(value)?;
        if is_empty_key(&pk) {
            return Err(Error::MissingPrimaryKey);
        }
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            self.table_for::<T>(),
            T::primary_key()
        );
        self.trace(&sql);
        let mut query = sqlx::query(&sql);
        query = bind_json(query, &pk);
        Ok(query.execute(self.pool()?).await?.rows_affected())
    }

    /// Is this a new record? true = yes (primary key null, zero or empty).
    pub fn is_new_record<T: Entity + Serialize>(&self, value: &T) -> Result<bool> {
        Ok(is_empty_key(&pk_value(value)?))
    }

    // ---- raw statements ----------------------------------------------------

    /// Execute an arbitrary SQL statement, e.g. DDL, INSERT, UPDATE.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        self.trace(sql);
        let result = self.pool()?.execute(sql).await;
        if let Err(e) = &result {
            error!("SQL execution failed: {}", e);
        }
        Ok(result?.rows_affected())
    }

    /// Fetch all rows of a raw query and map to a type implementing `FromRow`.
    pub async fn fetch_all<T>(&self, sql: &str) -> Result<Vec<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        self.trace(sql);
        let result = sqlx::query_as(sql).fetch_all(self.pool()?).await;
        if let Err(e) = &result {
            error!("Row fetch failed: {}", e);
        }
        Ok(result?)
    }

    /// Fetch raw rows as column-name → driver-value maps.
    pub async fn rows(&self, sql: &str, args: Vec<Value>) -> Result<Vec<RowMap>> {
        self.trace(sql);
        let mut query = sqlx::query(sql);
        for arg in &args {
            query = bind_value(query, arg);
        }
        let rows = query.fetch_all(self.pool()?).await;
        if let Err(e) = &rows {
            error!("Row fetch failed: {}", e);
        }
        rows?.iter().map(row_to_map).collect()
    }

    // ---- schema operations -------------------------------------------------

    pub async fn has_table(&self, name: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(name)
                .fetch_optional(self.pool()?)
                .await?;
        Ok(row.is_some())
    }

    pub async fn create_table<T: Entity>(&self) -> Result<()> {
        self.execute(&T::create_table_sql()).await?;
        Ok(())
    }

    /// Drop `T`'s table. A no-op under safe mode.
    pub async fn drop_table<T: Entity>(&self) -> Result<()> {
        if self.conf.safe_mode {
            warn!(
                "Unable to drop table `{}`, safe mode enabled",
                T::table_name()
            );
            return Ok(());
        }
        self.execute(&format!("DROP TABLE IF EXISTS {}", T::table_name()))
            .await?;
        Ok(())
    }

    /// Set up `T`'s table automatically: create it when missing, otherwise
    /// add newly declared columns. Applied schemas are tracked by hash in a
    /// meta table.
    pub async fn auto_migrate<T: Entity>(&self) -> Result<()> {
        let table_name = T::table_name();
        let create_sql = T::create_table_sql();
        let schema_hash = hash(&create_sql);

        self.execute(
            "CREATE TABLE IF NOT EXISTS __minorm_migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT UNIQUE,
                schema_sql TEXT,
                hash TEXT,
                applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .await?;

        // Read migration hash from the meta table
        let row = self
            .fetch_all::<(String,)>(&format!(
                "SELECT hash FROM __minorm_migrations WHERE table_name = '{}'",
                table_name
            ))
            .await?;

        if row.is_empty() {
            self.execute(&create_sql).await?;
            self.execute(&format!(
                "INSERT INTO __minorm_migrations (table_name, schema_sql, hash) VALUES ('{}', '{}', '{}')",
                table_name,
                escape_sql_quote(&create_sql),
                schema_hash
            ))
            .await?;
            info!(
                "Migrated `{}` (table created, initial schema applied).",
                table_name
            );
            return Ok(());
        }

        // Get existing cols from DB
        let pragma_sql = format!("PRAGMA table_info({})", table_name);
        let existing: Vec<String> = sqlx::query(&pragma_sql)
            .fetch_all(self.pool()?)
            .await?
            .into_iter()
            .map(|row: SqliteRow| row.get::<String, _>("name"))
            .collect();

        let mut added = Vec::new();
        for (name, sqltype) in T::columns() {
            if !existing.contains(&name) {
                self.execute(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    table_name, name, sqltype
                ))
                .await?;
                added.push((name, sqltype));
            }
        }

        if added.is_empty() {
            info!("No schema changes detected for `{}`.", table_name);
        } else {
            info!(
                "Schema changes detected for `{}`; the following columns were added:",
                table_name
            );
            for (name, sqltype) in &added {
                info!("  - {} {}", name, sqltype);
            }
            self.execute(&format!(
                "UPDATE __minorm_migrations \
                 SET schema_sql = '{}', hash = '{}', applied_at = CURRENT_TIMESTAMP \
                 WHERE table_name = '{}'",
                escape_sql_quote(&create_sql),
                schema_hash,
                table_name
            ))
            .await?;
        }
        Ok(())
    }

    // ---- model registry ----------------------------------------------------

    /// Register a named model descriptor. The registry is shared across every
    /// fork of this handle; registering the same name twice is a programmer
    /// error and is rejected.
    pub fn register_model<T>(&self, model: Model<T>) -> Result<()>
    where
        T: Send + Sync + 'static,
    {
        let name = model.name().to_string();
        let mut registry = self.registry.write().expect("model registry lock poisoned");
        if registry.contains_key(&name) {
            return Err(Error::DuplicateModel(name));
        }
        registry.insert(name, Arc::new(model));
        Ok(())
    }

    /// Look up a registered model by name and row type.
    pub fn get_model<T>(&self, name: &str) -> Option<Arc<Model<T>>>
    where
        T: Send + Sync + 'static,
    {
        let registry = self.registry.read().expect("model registry lock poisoned");
        registry
            .get(name)
            .cloned()
            .and_then(|any| any.downcast::<Model<T>>().ok())
    }

    /// Names of every registered model, sorted.
    pub fn registered_models(&self) -> Vec<String> {
        let registry = self.registry.read().expect("model registry lock poisoned");
        let mut names: Vec<String> = registry.keys().cloned().collect();
        names.sort();
        names
    }
}

// Simple helper to escape single quotes for SQL
fn escape_sql_quote(sql: &str) -> String {
    sql.replace("'", "''")
}

// Helper function to hash a SQL string
fn hash(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    format!("{:x}", hasher.finalize())
}
