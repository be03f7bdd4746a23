use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use std::marker::PhantomData;
use tracing::trace;
use uuid::Uuid;

use crate::propagator::{self, OperationKind, OperationOptions};
use crate::{ClientSession, Session, TransactionError, TransactionResult};

const MAX_COLLECTION_NAME_LEN: usize = 63;

/// A value stored as one JSONB document in a collection.
pub trait Document: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {
    /// Table the documents live in. Must be a plain SQL identifier.
    const COLLECTION: &'static str;

    fn id(&self) -> Uuid;
}

/// Containment filter: matches documents that contain this JSON value.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter(Value);

impl Filter {
    /// Matches every document.
    pub fn all() -> Self {
        Filter(Value::Object(Map::new()))
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(field, value)
    }

    /// Adds a field to the pattern. A non-object pattern from [`Filter::from_value`]
    /// is replaced by an object holding just this field.
    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        if !self.0.is_object() {
            self.0 = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.0 {
            map.insert(field.into(), value.into());
        }
        self
    }

    /// Uses a raw JSON value, e.g. a nested object, as the containment pattern.
    pub fn from_value(value: Value) -> Self {
        Filter(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Top-level field assignments merged into matching documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update(Map<String, Value>);

impl Update {
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::default().and_set(field, value)
    }

    pub fn and_set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// One stage of an aggregation pipeline, applied in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    Sort { field: String, descending: bool },
    Skip(i64),
    Limit(i64),
}

impl Stage {
    /// Position of the stage's clause within a single SELECT.
    fn clause_rank(&self) -> u8 {
        match self {
            Stage::Match(_) => 0,
            Stage::Sort { .. } => 1,
            Stage::Skip(_) => 2,
            Stage::Limit(_) => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Bind {
    Id(Uuid),
    Json(Value),
    Text(String),
    Int(i64),
}

fn bind_all(sql: &str, binds: Vec<Bind>) -> Query<'_, Postgres, PgArguments> {
    binds
        .into_iter()
        .fold(sqlx::query(sql), |query, bind| match bind {
            Bind::Id(id) => query.bind(id),
            Bind::Json(value) => query.bind(value),
            Bind::Text(text) => query.bind(text),
            Bind::Int(n) => query.bind(n),
        })
}

fn validate_collection(name: &str) -> TransactionResult<()> {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || name.len() > MAX_COLLECTION_NAME_LEN {
        return Err(TransactionError::InvalidCollection(name.to_string()));
    }
    Ok(())
}

// Validation rules out `"`, so wrapping is enough to keep reserved words usable.
fn quote_identifier(name: &str) -> String {
    format!("\"{name}\"")
}

/// Builds the SQL for an aggregation pipeline over `table`.
///
/// Consecutive stages share one SELECT while their clauses appear in SQL
/// order (WHERE, ORDER BY, OFFSET, LIMIT); a stage that would go backwards
/// wraps everything so far in a subquery.
fn compile_pipeline(table: &str, pipeline: &[Stage]) -> (String, Vec<Bind>) {
    let mut source = table.to_string();
    let mut clauses: Vec<String> = Vec::new();
    let mut last_rank: Option<u8> = None;
    let mut binds = Vec::new();
    let mut depth = 0usize;

    for stage in pipeline {
        let rank = stage.clause_rank();
        if matches!(last_rank, Some(last) if rank <= last) {
            source = format!("(SELECT doc FROM {source}{}) AS s{depth}", clauses.concat());
            clauses.clear();
            depth += 1;
        }
        last_rank = Some(rank);

        let clause = match stage {
            Stage::Match(filter) => {
                binds.push(Bind::Json(filter.0.clone()));
                format!(" WHERE doc @> ${}", binds.len())
            }
            Stage::Sort { field, descending } => {
                binds.push(Bind::Text(field.clone()));
                let direction = if *descending { "DESC" } else { "ASC" };
                format!(" ORDER BY doc -> ${} {direction}", binds.len())
            }
            Stage::Skip(n) => {
                binds.push(Bind::Int(*n));
                format!(" OFFSET ${}", binds.len())
            }
            Stage::Limit(n) => {
                binds.push(Bind::Int(*n));
                format!(" LIMIT ${}", binds.len())
            }
        };
        clauses.push(clause);
    }

    (format!("SELECT doc FROM {source}{}", clauses.concat()), binds)
}

/// Typed access to one document collection.
///
/// Every operation takes `Option<OperationOptions>`. When the options carry a
/// session the statement runs inside that session's transaction; otherwise it
/// runs directly on the pool. With propagation installed, calls made inside a
/// transaction runner receive the runner's session automatically.
pub struct Model<D> {
    pool: PgPool,
    collection: &'static str,
    table: String,
    _marker: PhantomData<fn() -> D>,
}

impl<D> Clone for Model<D> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            collection: self.collection,
            table: self.table.clone(),
            _marker: PhantomData,
        }
    }
}

impl<D: Document> Model<D> {
    pub fn new(pool: PgPool) -> TransactionResult<Self> {
        validate_collection(D::COLLECTION)?;
        Ok(Self {
            pool,
            collection: D::COLLECTION,
            table: quote_identifier(D::COLLECTION),
            _marker: PhantomData,
        })
    }

    pub fn collection(&self) -> &'static str {
        self.collection
    }

    /// Creates the backing table if it does not exist. Never session-bound.
    pub async fn ensure_collection(&self) -> TransactionResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (id UUID PRIMARY KEY, doc JSONB NOT NULL)",
            self.table
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn drop_collection(&self) -> TransactionResult<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", self.table);
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn find(&self, filter: &Filter, options: Option<OperationOptions>) -> TransactionResult<Vec<D>> {
        let options = self.resolve(OperationKind::Find, options);
        let sql = format!("SELECT doc FROM {} WHERE doc @> $1", self.table);
        let rows = self
            .fetch_all(&sql, vec![Bind::Json(filter.0.clone())], options.session.as_ref())
            .await?;
        rows.iter().map(decode_document).collect()
    }

    pub async fn find_one(&self, filter: &Filter, options: Option<OperationOptions>) -> TransactionResult<Option<D>> {
        let options = self.resolve(OperationKind::FindOne, options);
        let sql = format!("SELECT doc FROM {} WHERE doc @> $1 LIMIT 1", self.table);
        let row = self
            .fetch_optional(&sql, vec![Bind::Json(filter.0.clone())], options.session.as_ref())
            .await?;
        row.as_ref().map(decode_document).transpose()
    }

    pub async fn find_by_id(&self, id: Uuid, options: Option<OperationOptions>) -> TransactionResult<Option<D>> {
        let options = self.resolve(OperationKind::FindById, options);
        let sql = format!("SELECT doc FROM {} WHERE id = $1", self.table);
        let row = self
            .fetch_optional(&sql, vec![Bind::Id(id)], options.session.as_ref())
            .await?;
        row.as_ref().map(decode_document).transpose()
    }

    pub async fn count(&self, filter: &Filter, options: Option<OperationOptions>) -> TransactionResult<i64> {
        let options = self.resolve(OperationKind::Count, options);
        let sql = format!("SELECT COUNT(*) AS count FROM {} WHERE doc @> $1", self.table);
        let row = self
            .fetch_one(&sql, vec![Bind::Json(filter.0.clone())], options.session.as_ref())
            .await?;
        Ok(row.try_get("count")?)
    }

    /// Runs `pipeline` and returns the resulting documents as raw JSON.
    pub async fn aggregate(&self, pipeline: &[Stage], options: Option<OperationOptions>) -> TransactionResult<Vec<Value>> {
        let options = self.resolve(OperationKind::Aggregate, options);
        let (sql, binds) = compile_pipeline(&self.table, pipeline);
        let rows = self.fetch_all(&sql, binds, options.session.as_ref()).await?;
        rows.iter()
            .map(|row| row.try_get::<Value, _>("doc").map_err(TransactionError::from))
            .collect()
    }

    /// Inserts a new document. Fails if the id already exists.
    pub async fn create(&self, document: &D, options: Option<OperationOptions>) -> TransactionResult<()> {
        let options = self.resolve(OperationKind::Create, options);
        let sql = format!("INSERT INTO {} (id, doc) VALUES ($1, $2)", self.table);
        let binds = vec![Bind::Id(document.id()), Bind::Json(serde_json::to_value(document)?)];
        self.execute(&sql, binds, options.session.as_ref()).await?;
        Ok(())
    }

    /// Inserts the document or replaces the stored one with the same id.
    pub async fn save(&self, document: &D, options: Option<OperationOptions>) -> TransactionResult<()> {
        let options = self.resolve(OperationKind::Save, options);
        let sql = format!(
            "INSERT INTO {} (id, doc) VALUES ($1, $2) ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc",
            self.table
        );
        let binds = vec![Bind::Id(document.id()), Bind::Json(serde_json::to_value(document)?)];
        self.execute(&sql, binds, options.session.as_ref()).await?;
        Ok(())
    }

    /// Deletes this document. Returns whether it existed.
    pub async fn remove(&self, document: &D, options: Option<OperationOptions>) -> TransactionResult<bool> {
        let options = self.resolve(OperationKind::Remove, options);
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table);
        let affected = self
            .execute(&sql, vec![Bind::Id(document.id())], options.session.as_ref())
            .await?;
        Ok(affected > 0)
    }

    pub async fn update_one(&self, filter: &Filter, update: Update, options: Option<OperationOptions>) -> TransactionResult<u64> {
        let options = self.resolve(OperationKind::UpdateOne, options);
        let sql = format!(
            "UPDATE {t} SET doc = doc || $2 WHERE id = (SELECT id FROM {t} WHERE doc @> $1 LIMIT 1 FOR UPDATE)",
            t = self.table
        );
        let binds = vec![Bind::Json(filter.0.clone()), Bind::Json(update.into_value())];
        self.execute(&sql, binds, options.session.as_ref()).await
    }

    pub async fn update_many(&self, filter: &Filter, update: Update, options: Option<OperationOptions>) -> TransactionResult<u64> {
        let options = self.resolve(OperationKind::UpdateMany, options);
        let sql = format!("UPDATE {} SET doc = doc || $2 WHERE doc @> $1", self.table);
        let binds = vec![Bind::Json(filter.0.clone()), Bind::Json(update.into_value())];
        self.execute(&sql, binds, options.session.as_ref()).await
    }

    pub async fn delete_one(&self, filter: &Filter, options: Option<OperationOptions>) -> TransactionResult<u64> {
        let options = self.resolve(OperationKind::DeleteOne, options);
        let sql = format!(
            "DELETE FROM {t} WHERE id = (SELECT id FROM {t} WHERE doc @> $1 LIMIT 1 FOR UPDATE)",
            t = self.table
        );
        self.execute(&sql, vec![Bind::Json(filter.0.clone())], options.session.as_ref())
            .await
    }

    pub async fn delete_many(&self, filter: &Filter, options: Option<OperationOptions>) -> TransactionResult<u64> {
        let options = self.resolve(OperationKind::DeleteMany, options);
        let sql = format!("DELETE FROM {} WHERE doc @> $1", self.table);
        self.execute(&sql, vec![Bind::Json(filter.0.clone())], options.session.as_ref())
            .await
    }

    /// Updates the first match and returns it as it is after the update.
    pub async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: Update,
        options: Option<OperationOptions>,
    ) -> TransactionResult<Option<D>> {
        let options = self.resolve(OperationKind::FindOneAndUpdate, options);
        let sql = format!(
            "UPDATE {t} SET doc = doc || $2 WHERE id = (SELECT id FROM {t} WHERE doc @> $1 LIMIT 1 FOR UPDATE) RETURNING doc",
            t = self.table
        );
        let binds = vec![Bind::Json(filter.0.clone()), Bind::Json(update.into_value())];
        let row = self.fetch_optional(&sql, binds, options.session.as_ref()).await?;
        row.as_ref().map(decode_document).transpose()
    }

    /// Deletes the first match and returns it.
    pub async fn find_one_and_delete(&self, filter: &Filter, options: Option<OperationOptions>) -> TransactionResult<Option<D>> {
        let options = self.resolve(OperationKind::FindOneAndDelete, options);
        let sql = format!(
            "DELETE FROM {t} WHERE id = (SELECT id FROM {t} WHERE doc @> $1 LIMIT 1 FOR UPDATE) RETURNING doc",
            t = self.table
        );
        let row = self
            .fetch_optional(&sql, vec![Bind::Json(filter.0.clone())], options.session.as_ref())
            .await?;
        row.as_ref().map(decode_document).transpose()
    }

    fn resolve(&self, kind: OperationKind, options: Option<OperationOptions>) -> OperationOptions {
        let options = propagator::intercept(kind, options);
        trace!(
            collection = self.collection,
            operation = %kind,
            write = kind.is_write(),
            session = ?options.session.as_ref().map(|s| s.id()),
            "dispatching document operation"
        );
        options
    }

    async fn fetch_all(&self, sql: &str, binds: Vec<Bind>, session: Option<&Session>) -> TransactionResult<Vec<PgRow>> {
        let query = bind_all(sql, binds);
        match session {
            Some(session) => {
                let mut tx_guard = session.transaction().await;
                let tx = tx_guard
                    .as_mut()
                    .ok_or(TransactionError::NoActiveTransaction(session.id()))?;
                Ok(query.fetch_all(&mut **tx).await?)
            }
            None => Ok(query.fetch_all(&self.pool).await?),
        }
    }

    async fn fetch_optional(&self, sql: &str, binds: Vec<Bind>, session: Option<&Session>) -> TransactionResult<Option<PgRow>> {
        let query = bind_all(sql, binds);
        match session {
            Some(session) => {
                let mut tx_guard = session.transaction().await;
                let tx = tx_guard
                    .as_mut()
                    .ok_or(TransactionError::NoActiveTransaction(session.id()))?;
                Ok(query.fetch_optional(&mut **tx).await?)
            }
            None => Ok(query.fetch_optional(&self.pool).await?),
        }
    }

    async fn fetch_one(&self, sql: &str, binds: Vec<Bind>, session: Option<&Session>) -> TransactionResult<PgRow> {
        let query = bind_all(sql, binds);
        match session {
            Some(session) => {
                let mut tx_guard = session.transaction().await;
                let tx = tx_guard
                    .as_mut()
                    .ok_or(TransactionError::NoActiveTransaction(session.id()))?;
                Ok(query.fetch_one(&mut **tx).await?)
            }
            None => Ok(query.fetch_one(&self.pool).await?),
        }
    }

    async fn execute(&self, sql: &str, binds: Vec<Bind>, session: Option<&Session>) -> TransactionResult<u64> {
        let query = bind_all(sql, binds);
        let result = match session {
            Some(session) => {
                let mut tx_guard = session.transaction().await;
                let tx = tx_guard
                    .as_mut()
                    .ok_or(TransactionError::NoActiveTransaction(session.id()))?;
                query.execute(&mut **tx).await?
            }
            None => query.execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }
}

fn decode_document<D: Document>(row: &PgRow) -> TransactionResult<D> {
    let doc: Value = row.try_get("doc")?;
    Ok(serde_json::from_value(doc)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collection_names() {
        assert!(validate_collection("users").is_ok());
        assert!(validate_collection("_audit_log2").is_ok());

        for bad in ["", "2users", "users; DROP TABLE x", "user-s", "naïve"] {
            assert!(
                matches!(validate_collection(bad), Err(TransactionError::InvalidCollection(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_collection(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_filter_and_update_shapes() {
        assert_eq!(Filter::all().as_value(), &json!({}));
        assert_eq!(
            Filter::eq("status", "open").and("amount", 5).as_value(),
            &json!({"status": "open", "amount": 5})
        );
        assert_eq!(
            Update::set("status", "paid").and_set("amount", 7).into_value(),
            json!({"status": "paid", "amount": 7})
        );
    }

    #[test]
    fn test_and_on_non_object_filter_starts_a_new_object() {
        let filter = Filter::from_value(json!(["open"])).and("status", "paid");
        assert_eq!(filter.as_value(), &json!({"status": "paid"}));

        let nested = Filter::from_value(json!({"meta": {"tier": 1}})).and("status", "open");
        assert_eq!(nested.as_value(), &json!({"meta": {"tier": 1}, "status": "open"}));
    }

    #[test]
    fn test_reserved_word_collections_are_quoted() {
        assert!(validate_collection("order").is_ok());
        assert_eq!(quote_identifier("order"), "\"order\"");

        let (sql, _) = compile_pipeline(&quote_identifier("group"), &[Stage::Limit(1)]);
        assert_eq!(sql, "SELECT doc FROM \"group\" LIMIT $1");
    }

    #[test]
    fn test_empty_pipeline_selects_everything() {
        let (sql, binds) = compile_pipeline("orders", &[]);
        assert_eq!(sql, "SELECT doc FROM orders");
        assert!(binds.is_empty());
    }

    #[test]
    fn test_pipeline_in_clause_order_is_one_select() {
        let (sql, binds) = compile_pipeline(
            "orders",
            &[
                Stage::Match(Filter::eq("status", "open")),
                Stage::Sort { field: "amount".into(), descending: true },
                Stage::Skip(1),
                Stage::Limit(2),
            ],
        );

        assert_eq!(
            sql,
            "SELECT doc FROM orders WHERE doc @> $1 ORDER BY doc -> $2 DESC OFFSET $3 LIMIT $4"
        );
        assert_eq!(
            binds,
            vec![
                Bind::Json(json!({"status": "open"})),
                Bind::Text("amount".into()),
                Bind::Int(1),
                Bind::Int(2),
            ]
        );
    }

    #[test]
    fn test_pipeline_out_of_order_stage_wraps() {
        let (sql, binds) = compile_pipeline(
            "orders",
            &[Stage::Limit(10), Stage::Match(Filter::eq("status", "open")), Stage::Skip(2)],
        );

        assert_eq!(
            sql,
            "SELECT doc FROM (SELECT doc FROM orders LIMIT $1) AS s0 WHERE doc @> $2 OFFSET $3"
        );
        assert_eq!(binds.len(), 3);
    }
}
