//! Integration tests for the generic repository against a temporary SQLite
//! file.

use formstore::config::PoolConfig;
use formstore::db::{
    ColumnType, Entity, Pool, QueryExecutor, Repository, RowMapper, RowSchema, SqlxConnector,
};
use formstore::models::{ConnectionSettings, Filter, Pageable, SqlValue, Statement};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq)]
struct User {
    id: i64,
    email: String,
    name: String,
    active: bool,
}

impl User {
    fn new(email: &str, name: &str) -> Self {
        Self {
            id: 0,
            email: email.to_string(),
            name: name.to_string(),
            active: true,
        }
    }
}

impl Entity for User {
    const TABLE: &'static str = "users";
    const ID_COLUMNS: &'static [&'static str] = &["id"];
    const GENERATED_KEY: bool = true;
    const COLUMNS: &'static [&'static str] = &["email", "name", "active"];

    fn mapper() -> RowMapper<Self> {
        RowMapper::new(
            RowSchema::new()
                .field("id", ColumnType::Integer)
                .field("email", ColumnType::Text)
                .field("name", ColumnType::Text)
                .field("active", ColumnType::Boolean),
            |r| {
                Ok(User {
                    id: r.int()?,
                    email: r.text()?,
                    name: r.text()?,
                    active: r.bool()?,
                })
            },
        )
    }

    fn id(&self) -> Vec<SqlValue> {
        vec![SqlValue::Int(self.id)]
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::from(self.email.as_str()),
            SqlValue::from(self.name.as_str()),
            SqlValue::Bool(self.active),
        ]
    }
}

/// A link between two users, keyed by both of them.
#[derive(Debug, Clone, PartialEq)]
struct Friendship {
    requester: String,
    addressee: String,
    status: String,
}

impl Friendship {
    fn new(requester: &str, addressee: &str, status: &str) -> Self {
        Self {
            requester: requester.to_string(),
            addressee: addressee.to_string(),
            status: status.to_string(),
        }
    }
}

impl Entity for Friendship {
    const TABLE: &'static str = "friendships";
    const ID_COLUMNS: &'static [&'static str] = &["requester", "addressee"];
    const COLUMNS: &'static [&'static str] = &["status"];

    fn mapper() -> RowMapper<Self> {
        RowMapper::new(
            RowSchema::new()
                .field("requester", ColumnType::Text)
                .field("addressee", ColumnType::Text)
                .field("status", ColumnType::Text),
            |r| {
                Ok(Friendship {
                    requester: r.text()?,
                    addressee: r.text()?,
                    status: r.text()?,
                })
            },
        )
    }

    fn id(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::from(self.requester.as_str()),
            SqlValue::from(self.addressee.as_str()),
        ]
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![SqlValue::from(self.status.as_str())]
    }
}

async fn open_repository<E: Entity>(ddl: &str) -> (Repository<SqlxConnector, E>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("formstore.db");
    let settings = ConnectionSettings::from_url(format!("sqlite:{}", path.display())).unwrap();
    let pool = Pool::connect(
        PoolConfig {
            max_size: 1,
            ..PoolConfig::default()
        },
        SqlxConnector::new(&settings).unwrap(),
    )
    .await
    .unwrap();
    let executor = QueryExecutor::new();
    executor.run(&pool, &Statement::new(ddl)).await.unwrap();
    (Repository::new(&pool, &executor), dir)
}

async fn setup() -> (Repository<SqlxConnector, User>, TempDir) {
    open_repository(
        "CREATE TABLE users (\
            id INTEGER PRIMARY KEY AUTOINCREMENT, \
            email TEXT NOT NULL UNIQUE, \
            name TEXT NOT NULL, \
            active BOOLEAN NOT NULL)",
    )
    .await
}

#[tokio::test]
async fn test_save_and_find() {
    let (repo, _dir) = setup().await;

    let saved = repo
        .save(&User::new("ada@example.com", "Ada"))
        .await
        .unwrap()
        .unwrap();
    assert!(saved.id > 0);
    assert_eq!(saved.email, "ada@example.com");
    assert!(saved.active);

    assert_eq!(repo.find_one(saved.id).await.unwrap(), Some(saved.clone()));
    assert_eq!(repo.find_one(saved.id + 100).await.unwrap(), None);
    assert_eq!(repo.find_all().await.unwrap(), vec![saved]);
}

#[tokio::test]
async fn test_save_duplicate_returns_none() {
    let (repo, _dir) = setup().await;

    assert!(repo.save(&User::new("dup@example.com", "First")).await.unwrap().is_some());
    assert!(repo.save(&User::new("dup@example.com", "Second")).await.unwrap().is_none());

    let all = repo.find_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name, "First");
}

#[tokio::test]
async fn test_update_and_delete() {
    let (repo, _dir) = setup().await;
    let mut user = repo
        .save(&User::new("grace@example.com", "Grace"))
        .await
        .unwrap()
        .unwrap();

    user.name = "Grace Hopper".to_string();
    user.active = false;
    let updated = repo.update(&user).await.unwrap();
    assert_eq!(updated, Some(user.clone()));

    let ghost = User {
        id: 999,
        ..user.clone()
    };
    assert_eq!(repo.update(&ghost).await.unwrap(), None);

    assert_eq!(repo.delete(user.id).await.unwrap(), Some(user.clone()));
    assert_eq!(repo.delete(user.id).await.unwrap(), None);
    assert!(repo.find_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_find_page_with_filter() {
    let (repo, _dir) = setup().await;
    for i in 0..7 {
        let name = if i % 2 == 0 { "Smith" } else { "Jones" };
        repo.save(&User::new(&format!("user{}@example.com", i), &format!("{} {}", name, i)))
            .await
            .unwrap()
            .unwrap();
    }

    let first = repo
        .find_page(Pageable::new(0, 3), &Filter::new())
        .await
        .unwrap();
    assert_eq!(first.total_count, 7);
    assert_eq!(first.items.len(), 3);
    assert_eq!(first.total_pages(3), 3);

    let last = repo
        .find_page(Pageable::new(2, 3), &Filter::new())
        .await
        .unwrap();
    assert_eq!(last.items.len(), 1);
    assert_eq!(last.items[0].email, "user6@example.com");

    let smiths = repo
        .find_page(Pageable::new(0, 10), &Filter::new().contains("name", "Smith"))
        .await
        .unwrap();
    assert_eq!(smiths.total_count, 4);
    assert!(smiths.items.iter().all(|u| u.name.starts_with("Smith")));

    let nobody = repo
        .find_page(
            Pageable::default(),
            &Filter::new().contains("name", "Smith").contains("email", "user1@"),
        )
        .await
        .unwrap();
    assert_eq!(nobody.total_count, 0);
    assert!(nobody.items.is_empty());
}

#[tokio::test]
async fn test_composite_key_crud() {
    let (repo, _dir) = open_repository::<Friendship>(
        "CREATE TABLE friendships (\
            requester TEXT NOT NULL, \
            addressee TEXT NOT NULL, \
            status TEXT NOT NULL, \
            PRIMARY KEY (requester, addressee))",
    )
    .await;

    let ann_bob = Friendship::new("ann", "bob", "pending");
    assert_eq!(repo.save(&ann_bob).await.unwrap(), Some(ann_bob.clone()));
    assert_eq!(repo.save(&ann_bob).await.unwrap(), None);
    let bob_ann = Friendship::new("bob", "ann", "pending");
    assert_eq!(repo.save(&bob_ann).await.unwrap(), Some(bob_ann.clone()));

    assert_eq!(
        repo.find_one(("ann", "bob")).await.unwrap(),
        Some(ann_bob.clone())
    );
    assert_eq!(repo.find_one(("ann", "carl")).await.unwrap(), None);

    let accepted = Friendship {
        status: "accepted".to_string(),
        ..ann_bob.clone()
    };
    assert_eq!(repo.update(&accepted).await.unwrap(), Some(accepted.clone()));
    // Only the row with both key values changed.
    assert_eq!(
        repo.find_one(("bob", "ann")).await.unwrap(),
        Some(bob_ann.clone())
    );

    assert_eq!(repo.delete(("bob", "ann")).await.unwrap(), Some(bob_ann));
    assert_eq!(repo.find_all().await.unwrap(), vec![accepted]);
}
