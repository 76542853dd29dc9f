use serde::de::DeserializeOwned;
use snafu::ResultExt;
use surrealdb::engine::any::Any;
use surrealdb::opt::QueryResult;

use crate::store::{DatabaseDeserializeSnafu, DatabaseQuerySnafu, Result};

/// A SurrealQL query with its parameters. Parameters can be bound using the [Bindings::bind]
/// method which takes any serializable data structure.
///
/// # Example
/// ```ignore
/// let snapshots: Vec<SnapshotDocument> = store
///     .sql("SELECT * FROM statistics_history WHERE entity_id = $entity")
///     .bind(("entity", "song-1"))
///     .fetch_first()
///     .await?;
/// ```
#[derive(Debug)]
pub struct Bindings<'a> {
    query: surrealdb::method::Query<'a, Any>,
}

impl<'a> Bindings<'a> {
    pub(super) fn new(query: surrealdb::method::Query<'a, Any>) -> Self {
        Self { query }
    }

    pub fn bind(mut self, params: impl serde::Serialize) -> Self {
        let query = self.query;
        self.query = query.bind(params);
        self
    }

    /// Execute the query and return a [surrealdb::Response] which is SurrealDB's way to represent
    /// a list of statements returned from the database. A failed statement fails the call.
    pub async fn execute(self) -> Result<surrealdb::Response> {
        let response = self.query.await.context(DatabaseQuerySnafu)?;
        let response = response.check().context(DatabaseQuerySnafu)?;
        tracing::trace!(?response, "executed query");
        Ok(response)
    }

    /// Execute the query and return the first statement's result as a deserialized value.
    pub async fn fetch_first<T: DeserializeOwned>(self) -> Result<T>
    where
        usize: QueryResult<T>,
    {
        let mut statements = self.execute().await?;
        let result = statements.take::<T>(0).context(DatabaseDeserializeSnafu)?;
        Ok(result)
    }

    /// Execute the query and return the first row of the first statement, if any.
    pub async fn fetch_one<T: DeserializeOwned>(self) -> Result<Option<T>>
    where
        usize: QueryResult<Vec<T>>,
    {
        let rows: Vec<T> = self.fetch_first().await?;
        Ok(rows.into_iter().next())
    }
}
