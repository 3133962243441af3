use minorm::{Conf, Entity, Error, Orm, params};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, FromRow)]
struct User {
    id: i64,
    name: String,
    email: String,
}

impl Entity for User {
    fn table_name() -> &'static str {
        "users"
    }

    fn columns() -> Vec<(String, String)> {
        vec![
            ("id".to_string(), "INTEGER".to_string()),
            ("name".to_string(), "TEXT NOT NULL".to_string()),
            ("email".to_string(), "TEXT NOT NULL DEFAULT ''".to_string()),
        ]
    }
}

async fn setup() -> Orm {
    let orm = Orm::create(Conf::default()).await.unwrap();
    orm.auto_migrate::<User>().await.unwrap();
    orm
}

fn user(name: &str, email: &str) -> User {
    User {
        id: 0,
        name: name.to_string(),
        email: email.to_string(),
    }
}

#[tokio::test]
async fn test_create_opens_and_migrates() {
    let orm = setup().await;
    assert!(orm.has_table("users").await.unwrap());
    assert!(orm.has_table("__minorm_migrations").await.unwrap());
}

#[tokio::test]
async fn test_lazy_open() {
    let conf = Conf {
        auto_open: false,
        ..Conf::default()
    };
    let mut orm = Orm::create(conf).await.unwrap();

    // Not connected yet: operations surface an explicit error.
    let err = orm.count::<User>().await.unwrap_err();
    assert!(matches!(err, Error::NotConnected));

    orm.open().await.unwrap();
    orm.auto_migrate::<User>().await.unwrap();
    assert_eq!(orm.count::<User>().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unsupported_dialect_is_rejected() {
    let conf = Conf {
        dialect: "mysql".to_string(),
        ..Conf::default()
    };
    let err = Orm::create(conf).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedDialect(_)));
}

#[tokio::test]
async fn test_insert_and_fetch() {
    let orm = setup().await;
    let id = orm.insert(&user("Alice", "alice@example.com")).await.unwrap();
    assert!(id > 0);

    let fetched: User = orm.fetch_by_id(id).await.unwrap().unwrap();
    assert_eq!(fetched.id, id);
    assert_eq!(fetched.name, "Alice");
    assert_eq!(fetched.email, "alice@example.com");
}

#[tokio::test]
async fn test_first_on_missing_row_is_none() {
    let orm = setup().await;
    let found: Option<User> = orm
        .filter("name = ?", params!["Nobody"])
        .first()
        .await
        .unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn test_first_and_last() {
    let orm = setup().await;
    orm.insert(&user("Alice", "a@example.com")).await.unwrap();
    orm.insert(&user("Bob", "b@example.com")).await.unwrap();

    let first: User = orm.first().await.unwrap().unwrap();
    let last: User = orm.last().await.unwrap().unwrap();
    assert_eq!(first.name, "Alice");
    assert_eq!(last.name, "Bob");
}

#[tokio::test]
async fn test_sibling_forks_do_not_contaminate() {
    let orm = setup().await;
    orm.insert(&user("Alice", "a@example.com")).await.unwrap();
    orm.insert(&user("Bob", "b@example.com")).await.unwrap();

    // Two sibling forks with incompatible filters.
    let fork_a = orm.filter("name = ?", params!["Alice"]);
    let fork_b = orm.filter("name = ?", params!["Bob"]);

    let a: User = fork_a.first().await.unwrap().unwrap();
    let b: User = fork_b.first().await.unwrap().unwrap();
    assert_eq!(a.name, "Alice");
    assert_eq!(b.name, "Bob");

    // The parent carries no filter from either fork.
    assert_eq!(orm.count::<User>().await.unwrap(), 2);
    // And the forks keep their own state after the sibling ran.
    assert_eq!(fork_a.count::<User>().await.unwrap(), 1);
    assert_eq!(fork_b.count::<User>().await.unwrap(), 1);
}

#[tokio::test]
async fn test_find_with_filter_and_limit() {
    let orm = setup().await;
    for i in 0..5 {
        orm.insert(&user(&format!("user{}", i), "u@example.com"))
            .await
            .unwrap();
    }

    let all: Vec<User> = orm.find().await.unwrap();
    assert_eq!(all.len(), 5);

    let some: Vec<User> = orm
        .filter("id > ?", params![2i64])
        .limit(2)
        .find()
        .await
        .unwrap();
    assert_eq!(some.len(), 2);
    assert!(some.iter().all(|u| u.id > 2));
}

#[tokio::test]
async fn test_save_inserts_then_updates() {
    let orm = setup().await;

    let fresh = user("Carol", "c@example.com");
    assert!(orm.is_new_record(&fresh).unwrap());
    let id = orm.save(&fresh).await.unwrap();
    assert!(id > 0);

    let mut saved: User = orm.fetch_by_id(id).await.unwrap().unwrap();
    assert!(!orm.is_new_record(&saved).unwrap());

    saved.email = "carol@example.com".to_string();
    orm.save(&saved).await.unwrap();

    assert_eq!(orm.count::<User>().await.unwrap(), 1);
    let reloaded: User = orm.fetch_by_id(id).await.unwrap().unwrap();
    assert_eq!(reloaded.email, "carol@example.com");
}

#[tokio::test]
async fn test_delete_by_primary_key() {
    let orm = setup().await;
    let id = orm.insert(&user("Alice", "a@example.com")).await.unwrap();
    let victim: User = orm.fetch_by_id(id).await.unwrap().unwrap();

    let affected = orm.delete(&victim).await.unwrap();
    assert_eq!(affected, 1);
    assert_eq!(orm.count::<User>().await.unwrap(), 0);
}

#[tokio::test]
async fn test_delete_without_primary_key_is_rejected() {
    let orm = setup().await;
    let err = orm.delete(&User::default()).await.unwrap_err();
    assert!(matches!(err, Error::MissingPrimaryKey));
}

#[tokio::test]
async fn test_drop_table_is_a_noop_under_safe_mode() {
    let orm = setup().await;
    orm.insert(&user("Alice", "a@example.com")).await.unwrap();

    // Default config has safe mode enabled.
    orm.drop_table::<User>().await.unwrap();
    assert!(orm.has_table("users").await.unwrap());
    assert_eq!(orm.count::<User>().await.unwrap(), 1);
}

#[tokio::test]
async fn test_drop_table_without_safe_mode() {
    let conf = Conf {
        safe_mode: false,
        ..Conf::default()
    };
    let orm = Orm::create(conf).await.unwrap();
    orm.auto_migrate::<User>().await.unwrap();

    orm.drop_table::<User>().await.unwrap();
    assert!(!orm.has_table("users").await.unwrap());
}

#[tokio::test]
async fn test_raw_execute_and_fetch_all() {
    let orm = setup().await;
    orm.execute("INSERT INTO users (name, email) VALUES ('Alice', 'a@example.com')")
        .await
        .unwrap();

    let names: Vec<(String,)> = orm.fetch_all("SELECT name FROM users").await.unwrap();
    assert_eq!(names, vec![("Alice".to_string(),)]);
}

#[tokio::test]
async fn test_raw_rows_as_maps() {
    let orm = setup().await;
    let id = orm.insert(&user("Alice", "a@example.com")).await.unwrap();

    let rows = orm
        .rows("SELECT * FROM users WHERE name = ?", params!["Alice"])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"].as_id(), id as u64);
    assert_eq!(rows[0]["name"].as_text(), "Alice");
}

#[tokio::test]
async fn test_table_override() {
    let orm = setup().await;
    orm.insert(&user("Alice", "a@example.com")).await.unwrap();

    // An explicit table override wins over the entity's table.
    let n = orm.table("users").count::<User>().await.unwrap();
    assert_eq!(n, 1);
}

#[tokio::test]
async fn test_auto_migrate_adds_new_columns() {
    // Same table, one extra declared column: re-running the migration must
    // alter the table in place instead of recreating it.
    #[derive(Clone, Debug, Default, Serialize, Deserialize, FromRow)]
    struct UserV2 {
        id: i64,
        name: String,
        email: String,
        age: i64,
    }

    impl Entity for UserV2 {
        fn table_name() -> &'static str {
            "users"
        }

        fn columns() -> Vec<(String, String)> {
            let mut cols = User::columns();
            cols.push(("age".to_string(), "INTEGER NOT NULL DEFAULT 0".to_string()));
            cols
        }
    }

    let orm = setup().await;
    orm.insert(&user("Alice", "a@example.com")).await.unwrap();

    orm.auto_migrate::<UserV2>().await.unwrap();
    let id = orm
        .insert(&UserV2 {
            id: 0,
            name: "Bob".to_string(),
            email: "b@example.com".to_string(),
            age: 42,
        })
        .await
        .unwrap();

    let bob: UserV2 = orm.fetch_by_id(id).await.unwrap().unwrap();
    assert_eq!(bob.age, 42);
    // The pre-migration row picked up the column default.
    let alice: UserV2 = orm.filter("name = ?", params!["Alice"]).first().await.unwrap().unwrap();
    assert_eq!(alice.age, 0);
}

#[tokio::test]
async fn test_close_is_shared_across_forks() {
    let orm = setup().await;
    let fork = orm.clone();

    fork.close().await;
    // The physical pool is shared, so the parent is closed too.
    assert!(orm.count::<User>().await.is_err());
}
