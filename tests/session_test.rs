//! Integration tests for sessions, the executor and the pool against a
//! temporary SQLite file.

use chrono::NaiveDate;
use formstore::config::PoolConfig;
use formstore::db::{
    ColumnType, Pool, QueryExecutor, RowMapper, RowSchema, RunOutcome, Session, SessionState,
    SqlxConnector,
};
use formstore::error::{DbError, QueryErrorKind};
use formstore::models::{ConnectionSettings, SqlValue, Statement};
use std::time::Duration;
use tempfile::TempDir;

struct TestDb {
    pool: Pool<SqlxConnector>,
    executor: QueryExecutor,
    _dir: TempDir,
}

async fn setup(max_size: u32) -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("formstore.db");
    let settings = ConnectionSettings::from_url(format!("sqlite:{}", path.display())).unwrap();
    let connector = SqlxConnector::new(&settings).unwrap();
    let config = PoolConfig {
        min_size: 1,
        max_size,
        acquire_timeout: Duration::from_millis(200),
        ..PoolConfig::default()
    };
    let pool = Pool::connect(config, connector).await.unwrap();
    let executor = QueryExecutor::new();

    executor
        .run(
            &pool,
            &Statement::new(
                "CREATE TABLE notes (\
                    id INTEGER PRIMARY KEY, \
                    title TEXT NOT NULL UNIQUE, \
                    pinned BOOLEAN NOT NULL, \
                    created_at DATETIME NOT NULL)",
            ),
        )
        .await
        .unwrap();

    TestDb {
        pool,
        executor,
        _dir: dir,
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Note {
    id: i64,
    title: String,
    pinned: bool,
    created_at: chrono::NaiveDateTime,
}

fn note_mapper() -> RowMapper<Note> {
    RowMapper::new(
        RowSchema::new()
            .field("id", ColumnType::Integer)
            .field("title", ColumnType::Text)
            .field("pinned", ColumnType::Boolean)
            .field("created_at", ColumnType::Timestamp),
        |r| {
            Ok(Note {
                id: r.int()?,
                title: r.text()?,
                pinned: r.bool()?,
                created_at: r.timestamp()?,
            })
        },
    )
}

fn count_mapper() -> RowMapper<i64> {
    RowMapper::new(RowSchema::new().field("count", ColumnType::Integer), |r| r.int())
}

fn insert(id: i64, title: &str) -> Statement {
    let created_at = NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(9, 30, 0)
        .unwrap();
    Statement::new("INSERT INTO notes (id, title, pinned, created_at) VALUES (?, ?, ?, ?)")
        .bind(id)
        .bind(title)
        .bind(id % 2 == 0)
        .bind(created_at)
}

async fn count(db: &TestDb) -> i64 {
    let mut session = Session::new(&db.pool, &db.executor);
    session.begin().await.unwrap();
    let n = session
        .fetch_one(&Statement::new("SELECT COUNT(*) FROM notes"), &count_mapper())
        .await
        .unwrap();
    session.commit().await.unwrap();
    n
}

#[tokio::test]
async fn test_rollback_leaves_database_unchanged() {
    let db = setup(2).await;

    let mut session = Session::new(&db.pool, &db.executor);
    session.begin().await.unwrap();
    session.execute(&insert(1, "groceries")).await.unwrap();
    session.execute(&insert(2, "errands")).await.unwrap();
    // Read-your-writes inside the transaction.
    let inside = session
        .fetch_one(&Statement::new("SELECT COUNT(*) FROM notes"), &count_mapper())
        .await
        .unwrap();
    assert_eq!(inside, 2);
    session.rollback().await.unwrap();
    assert_eq!(session.state(), SessionState::RolledBack);

    assert_eq!(count(&db).await, 0);
}

#[tokio::test]
async fn test_commit_visible_to_next_session() {
    let db = setup(2).await;

    let mut writer = Session::new(&db.pool, &db.executor);
    writer.begin().await.unwrap();
    assert_eq!(writer.execute(&insert(1, "groceries")).await.unwrap(), 1);
    assert_eq!(writer.execute(&insert(2, "errands")).await.unwrap(), 1);
    writer.commit().await.unwrap();

    let mut reader = Session::new(&db.pool, &db.executor);
    reader.begin().await.unwrap();
    let notes = reader
        .fetch_all(
            &Statement::new("SELECT id, title, pinned, created_at FROM notes ORDER BY id"),
            &note_mapper(),
        )
        .await
        .unwrap();
    reader.commit().await.unwrap();

    assert_eq!(notes.len(), 2);
    assert_eq!(notes[0].title, "groceries");
    assert!(!notes[0].pinned);
    assert!(notes[1].pinned);
    assert_eq!(notes[1].created_at.to_string(), "2024-03-01 09:30:00");
}

#[tokio::test]
async fn test_mapping_is_deterministic() {
    let db = setup(1).await;
    db.executor.run(&db.pool, &insert(4, "same")).await.unwrap();

    let select = Statement::new("SELECT id, title, pinned, created_at FROM notes");
    let rows = match db.executor.run(&db.pool, &select).await.unwrap() {
        RunOutcome::Rows(rows) => rows,
        other => panic!("expected rows, got {:?}", other),
    };
    let mapper = note_mapper();
    assert_eq!(mapper.map(&rows[0]).unwrap(), mapper.map(&rows[0]).unwrap());
}

#[tokio::test]
async fn test_parameter_mismatch_fails_session() {
    let db = setup(1).await;

    let mut session = Session::new(&db.pool, &db.executor);
    session.begin().await.unwrap();
    session.execute(&insert(1, "kept out")).await.unwrap();
    let err = session
        .execute(&Statement::new("UPDATE notes SET title = ? WHERE id = ?").bind("x"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DbError::ParameterMismatch {
            expected: 2,
            supplied: 1
        }
    ));
    assert_eq!(session.state(), SessionState::Failed);
    assert!(session.commit().await.is_err());

    // The failed transaction was discarded with its connection.
    assert_eq!(count(&db).await, 0);
}

#[tokio::test]
async fn test_constraint_violation_classified() {
    let db = setup(1).await;
    db.executor.run(&db.pool, &insert(1, "dup")).await.unwrap();

    let err = db
        .executor
        .run(&db.pool, &insert(2, "dup"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(QueryErrorKind::ConstraintViolation));
    assert!(err.is_unique_violation());
    // A constraint failure does not cost the pool its connection.
    assert_eq!(db.pool.status().size, 1);
}

#[tokio::test]
async fn test_mapping_error_names_column() {
    let db = setup(1).await;
    db.executor.run(&db.pool, &insert(1, "typed")).await.unwrap();

    let wrong = RowMapper::new(
        RowSchema::new()
            .field("id", ColumnType::Integer)
            .field("title", ColumnType::Integer),
        |r| Ok((r.int()?, r.int()?)),
    );
    let mut session = Session::new(&db.pool, &db.executor);
    session.begin().await.unwrap();
    let err = session
        .fetch_all(&Statement::new("SELECT id, title FROM notes"), &wrong)
        .await
        .unwrap_err();
    match err {
        DbError::Mapping { column, .. } => assert!(column.contains("title")),
        other => panic!("expected mapping error, got {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_null_values_round_trip() {
    let db = setup(1).await;
    db.executor
        .run(
            &db.pool,
            &Statement::new("CREATE TABLE tags (id INTEGER PRIMARY KEY, label TEXT)"),
        )
        .await
        .unwrap();
    db.executor
        .run(
            &db.pool,
            &Statement::new("INSERT INTO tags (id, label) VALUES (?, ?)")
                .bind(1)
                .bind(None::<String>),
        )
        .await
        .unwrap();

    let rows = match db
        .executor
        .run(&db.pool, &Statement::new("SELECT id, label FROM tags"))
        .await
        .unwrap()
    {
        RunOutcome::Rows(rows) => rows,
        other => panic!("expected rows, got {:?}", other),
    };
    assert_eq!(rows[0].get_by_name("label"), Some(&SqlValue::Null));

    let nullable = RowMapper::new(
        RowSchema::new()
            .field("id", ColumnType::Integer)
            .nullable("label", ColumnType::Text),
        |r| Ok((r.int()?, r.opt_text()?)),
    );
    assert_eq!(nullable.map(&rows[0]).unwrap(), (1, None));
}

#[tokio::test]
async fn test_pool_exhausted_when_all_leased() {
    let db = setup(2).await;

    let first = db.pool.acquire_default().await.unwrap();
    let second = db.pool.acquire_default().await.unwrap();
    let err = db
        .pool
        .acquire(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::PoolExhausted { max_size: 2, .. }));

    db.pool.release(first).await;
    db.pool.release(second).await;
    assert_eq!(db.pool.status().idle, 2);

    db.pool.shutdown(Duration::from_secs(1)).await;
    assert!(matches!(
        db.pool.acquire_default().await,
        Err(DbError::PoolClosed)
    ));
}
