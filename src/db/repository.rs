//! Generic CRUD over a single table.
//!
//! Every repository call runs in its own [`Session`], so a failure half way
//! through never leaves partial writes behind.

use crate::db::connection::Connector;
use crate::db::executor::QueryExecutor;
use crate::db::mapper::{ColumnType, RowMapper, RowSchema};
use crate::db::pool::Pool;
use crate::db::session::Session;
use crate::error::DbResult;
use crate::models::{DatabaseType, Filter, Page, Pageable, SqlValue, Statement};
use tracing::debug;
use uuid::Uuid;

/// A record stored in one table.
///
/// Rows are always selected as `ID_COLUMNS` followed by `COLUMNS`, and
/// [`Entity::mapper`] must accept that shape.
pub trait Entity: Sized + Send + Sync {
    const TABLE: &'static str;
    /// Primary key columns; more than one for a composite key.
    const ID_COLUMNS: &'static [&'static str];
    /// The database assigns the key on insert. Otherwise `save` inserts
    /// the key columns along with `COLUMNS`.
    const GENERATED_KEY: bool = false;
    /// Non-key columns, in the order of [`Entity::values`].
    const COLUMNS: &'static [&'static str];

    fn mapper() -> RowMapper<Self>;

    /// Key values, in the order of `ID_COLUMNS`.
    fn id(&self) -> Vec<SqlValue>;

    /// Values for `COLUMNS`.
    fn values(&self) -> Vec<SqlValue>;
}

/// Primary key values, in `ID_COLUMNS` order.
#[derive(Debug, Clone, PartialEq)]
pub struct Key(Vec<SqlValue>);

impl Key {
    pub fn into_values(self) -> Vec<SqlValue> {
        self.0
    }
}

impl From<Vec<SqlValue>> for Key {
    fn from(values: Vec<SqlValue>) -> Self {
        Self(values)
    }
}

impl From<SqlValue> for Key {
    fn from(value: SqlValue) -> Self {
        Self(vec![value])
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Self(vec![value.into()])
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Self(vec![value.into()])
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self(vec![value.into()])
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self(vec![value.into()])
    }
}

impl From<Uuid> for Key {
    fn from(value: Uuid) -> Self {
        Self(vec![value.into()])
    }
}

impl<A: Into<SqlValue>, B: Into<SqlValue>> From<(A, B)> for Key {
    fn from((a, b): (A, B)) -> Self {
        Self(vec![a.into(), b.into()])
    }
}

/// CRUD, paging and substring filtering for one [`Entity`] type.
pub struct Repository<C: Connector, E: Entity> {
    pool: Pool<C>,
    executor: QueryExecutor,
    mapper: RowMapper<E>,
}

impl<C: Connector, E: Entity> Repository<C, E> {
    pub fn new(pool: &Pool<C>, executor: &QueryExecutor) -> Self {
        Self {
            pool: pool.clone(),
            executor: executor.clone(),
            mapper: E::mapper(),
        }
    }

    fn session(&self) -> Session<C> {
        Session::new(&self.pool, &self.executor)
    }

    fn db_type(&self) -> DatabaseType {
        self.pool.database_type()
    }

    fn select_list() -> String {
        E::ID_COLUMNS
            .iter()
            .chain(E::COLUMNS)
            .copied()
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `a = $n AND b = $n+1 ...` over the key columns.
    fn key_clause(db_type: DatabaseType, first: usize) -> String {
        E::ID_COLUMNS
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{} = {}", column, db_type.placeholder(first + i)))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn select_by_key(&self, key: Vec<SqlValue>) -> Statement {
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            Self::select_list(),
            E::TABLE,
            Self::key_clause(self.db_type(), 1)
        );
        Statement::new(sql).with_params(key)
    }

    pub async fn find_one(&self, id: impl Into<Key>) -> DbResult<Option<E>> {
        let statement = self.select_by_key(id.into().into_values());

        let mut session = self.session();
        session.begin().await?;
        let found = first(&mut session, &statement, &self.mapper).await?;
        session.commit().await?;
        Ok(found)
    }

    pub async fn find_all(&self) -> DbResult<Vec<E>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            Self::select_list(),
            E::TABLE,
            E::ID_COLUMNS.join(", ")
        );
        let statement = Statement::new(sql);

        let mut session = self.session();
        session.begin().await?;
        let all = session.fetch_all(&statement, &self.mapper).await?;
        session.commit().await?;
        Ok(all)
    }

    /// Insert `entity` and return the stored row, including a generated
    /// key. Returns `None` if a row with the same unique key already exists.
    pub async fn save(&self, entity: &E) -> DbResult<Option<E>> {
        let db_type = self.db_type();
        let (columns, params): (Vec<&str>, Vec<SqlValue>) = if E::GENERATED_KEY {
            (E::COLUMNS.to_vec(), entity.values())
        } else {
            let mut params = entity.id();
            params.extend(entity.values());
            (
                E::ID_COLUMNS.iter().chain(E::COLUMNS).copied().collect(),
                params,
            )
        };
        let placeholders: Vec<String> = (1..=columns.len())
            .map(|i| db_type.placeholder(i))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            E::TABLE,
            columns.join(", "),
            placeholders.join(", "),
            Self::select_list()
        );
        let statement = Statement::new(sql).with_params(params);

        let mut session = self.session();
        session.begin().await?;
        match first(&mut session, &statement, &self.mapper).await {
            Ok(saved) => {
                session.commit().await?;
                Ok(saved)
            }
            Err(e) if e.is_unique_violation() => {
                debug!(table = E::TABLE, error = %e, "Insert rejected by unique constraint");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Overwrite the row with `entity`'s key. Returns the stored row, or
    /// `None` if no row has that key.
    pub async fn update(&self, entity: &E) -> DbResult<Option<E>> {
        if E::COLUMNS.is_empty() {
            // Nothing but the key to write.
            return self.find_one(entity.id()).await;
        }

        let db_type = self.db_type();
        let assignments: Vec<String> = E::COLUMNS
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{} = {}", column, db_type.placeholder(i + 1)))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} RETURNING {}",
            E::TABLE,
            assignments.join(", "),
            Self::key_clause(db_type, E::COLUMNS.len() + 1),
            Self::select_list()
        );
        let mut params = entity.values();
        params.extend(entity.id());
        let statement = Statement::new(sql).with_params(params);

        let mut session = self.session();
        session.begin().await?;
        let updated = first(&mut session, &statement, &self.mapper).await?;
        session.commit().await?;
        Ok(updated)
    }

    /// Remove the row with key `id` and return what was removed.
    pub async fn delete(&self, id: impl Into<Key>) -> DbResult<Option<E>> {
        let key = id.into().into_values();
        let select = self.select_by_key(key.clone());
        let delete = Statement::new(format!(
            "DELETE FROM {} WHERE {}",
            E::TABLE,
            Self::key_clause(self.db_type(), 1)
        ))
        .with_params(key);

        let mut session = self.session();
        session.begin().await?;
        let existing = first(&mut session, &select, &self.mapper).await?;
        if existing.is_some() {
            session.execute(&delete).await?;
        }
        session.commit().await?;
        Ok(existing)
    }

    /// One page of rows matching `filter`, ordered by key.
    pub async fn find_page(&self, pageable: Pageable, filter: &Filter) -> DbResult<Page<E>> {
        let db_type = self.db_type();
        let (where_clause, filter_params) = filter.to_where_clause(db_type, 1);
        let count = Statement::new(format!(
            "SELECT COUNT(*) FROM {}{}",
            E::TABLE,
            where_clause
        ))
        .with_params(filter_params.clone());

        let mut session = self.session();
        session.begin().await?;
        let total_count = first(&mut session, &count, &count_mapper())
            .await?
            .unwrap_or(0);
        if total_count == 0 {
            session.commit().await?;
            return Ok(Page::empty());
        }

        let next = filter_params.len() + 1;
        let page = Statement::new(format!(
            "SELECT {} FROM {}{} ORDER BY {} LIMIT {} OFFSET {}",
            Self::select_list(),
            E::TABLE,
            where_clause,
            E::ID_COLUMNS.join(", "),
            db_type.placeholder(next),
            db_type.placeholder(next + 1)
        ))
        .with_params(filter_params)
        .bind(i64::from(pageable.page_size))
        .bind(i64::try_from(pageable.offset()).unwrap_or(i64::MAX));

        let items = session.fetch_all(&page, &self.mapper).await?;
        session.commit().await?;
        Ok(Page {
            items,
            total_count: u64::try_from(total_count).unwrap_or(0),
        })
    }
}

impl<C: Connector, E: Entity> Clone for Repository<C, E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            executor: self.executor.clone(),
            mapper: self.mapper.clone(),
        }
    }
}

/// First mapped row of a statement. The result is read to the end so the
/// statement has finished before the session commits.
async fn first<C: Connector, T>(
    session: &mut Session<C>,
    statement: &Statement,
    mapper: &RowMapper<T>,
) -> DbResult<Option<T>> {
    Ok(session.fetch_all(statement, mapper).await?.into_iter().next())
}

fn count_mapper() -> RowMapper<i64> {
    RowMapper::new(RowSchema::new().field("count", ColumnType::Integer), |r| r.int())
}
