//! Result-shape helpers shared by pools, connections and transactions.

use async_trait::async_trait;
use slonik_driver::{QueryResult, Row, Value};

use crate::error::{Error, Result};
use crate::query::Query;

/// Statement execution plus helpers that check the shape of the result.
///
/// Implementors provide [`query`](QueryMethods::query); every other method
/// is defined in terms of it.
#[async_trait]
pub trait QueryMethods: Send + Sync {
    /// Execute a statement and return the full result.
    async fn query(&self, query: Query) -> Result<QueryResult>;

    /// Any number of rows.
    async fn any<Q>(&self, query: Q) -> Result<Vec<Row>>
    where
        Q: Into<Query> + Send,
    {
        Ok(self.query(query.into()).await?.rows)
    }

    /// The single column of any number of rows.
    async fn any_first<Q>(&self, query: Q) -> Result<Vec<Value>>
    where
        Q: Into<Query> + Send,
    {
        let rows = self.any(query).await?;
        first_column(rows)
    }

    /// At least one row.
    async fn many<Q>(&self, query: Q) -> Result<Vec<Row>>
    where
        Q: Into<Query> + Send,
    {
        let rows = self.any(query).await?;
        if rows.is_empty() {
            return Err(Error::NotFound);
        }
        Ok(rows)
    }

    /// The single column of at least one row.
    async fn many_first<Q>(&self, query: Q) -> Result<Vec<Value>>
    where
        Q: Into<Query> + Send,
    {
        let rows = self.many(query).await?;
        first_column(rows)
    }

    /// Exactly one row.
    async fn one<Q>(&self, query: Q) -> Result<Row>
    where
        Q: Into<Query> + Send,
    {
        self.maybe_one(query).await?.ok_or(Error::NotFound)
    }

    /// The single value of exactly one row.
    async fn one_first<Q>(&self, query: Q) -> Result<Value>
    where
        Q: Into<Query> + Send,
    {
        let row = self.one(query).await?;
        single_value(row)
    }

    /// At most one row.
    async fn maybe_one<Q>(&self, query: Q) -> Result<Option<Row>>
    where
        Q: Into<Query> + Send,
    {
        let mut rows = self.any(query).await?;
        if rows.len() > 1 {
            return Err(Error::DataIntegrity(format!(
                "expected at most one row, got {}",
                rows.len()
            )));
        }
        Ok(rows.pop())
    }

    /// The single value of at most one row.
    async fn maybe_one_first<Q>(&self, query: Q) -> Result<Option<Value>>
    where
        Q: Into<Query> + Send,
    {
        match self.maybe_one(query).await? {
            Some(row) => single_value(row).map(Some),
            None => Ok(None),
        }
    }

    /// Whether the query returns any row.
    async fn exists<Q>(&self, query: Q) -> Result<bool>
    where
        Q: Into<Query> + Send,
    {
        let query = query.into();
        let wrapped = Query {
            sql: format!("SELECT EXISTS({})", query.sql),
            ..query
        };
        match self.one_first(wrapped).await? {
            Value::Bool(exists) => Ok(exists),
            other => Err(Error::DataIntegrity(format!(
                "expected a boolean from EXISTS, got {}",
                other.type_name()
            ))),
        }
    }
}

fn single_value(row: Row) -> Result<Value> {
    if row.len() != 1 {
        return Err(Error::DataIntegrity(format!(
            "expected exactly one column, got {}",
            row.len()
        )));
    }
    row.into_iter()
        .next()
        .ok_or_else(|| Error::DataIntegrity("expected exactly one column, got 0".into()))
}

fn first_column(rows: Vec<Row>) -> Result<Vec<Value>> {
    rows.into_iter().map(single_value).collect()
}
