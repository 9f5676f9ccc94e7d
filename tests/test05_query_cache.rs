use std::sync::Arc;

use sql_conduit::mock::{MemoryCacheStore, MockDriver};
use sql_conduit::prelude::*;
use sql_conduit::types::RowValues;
use tokio::runtime::Runtime;

const SQL: &str = "SELECT id, name FROM users WHERE id = :id";

fn cached_connection(driver: &MockDriver, store: &Arc<MemoryCacheStore>) -> Connection {
    let config = ConnectionConfig::new(
        "app",
        ServerConfig::new("mock://master:3306/app", "app", "secret"),
    )
    .with_query_cache();
    Connection::new(config, Arc::new(driver.clone())).with_cache_store(Arc::clone(store) as _)
}

fn script_users(driver: &MockDriver) {
    driver.on_query(
        SQL,
        &["id", "name"],
        vec![vec![RowValues::Int(5), RowValues::Text("alice".into())]],
    );
}

#[test]
fn second_fetch_is_served_from_the_cache() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let driver = MockDriver::new();
        script_users(&driver);
        let store = Arc::new(MemoryCacheStore::new());
        let mut conn = cached_connection(&driver, &store);

        let mut cmd = conn.create_command(SQL);
        cmd.bind_value(":id", RowValues::Int(5));
        cmd.cache(CacheDuration::Seconds(60), None);
        let first = cmd.query_all().await?;
        drop(cmd);

        let mut cmd = conn.create_command(SQL);
        cmd.bind_value(":id", RowValues::Int(5));
        cmd.cache(CacheDuration::Seconds(60), None);
        let second = cmd.query_all().await?;

        assert_eq!(first.results.len(), 1);
        assert_eq!(second.results[0].get("name"), Some(&RowValues::Text("alice".into())));
        assert_eq!(driver.executions_of(SQL), 1, "the hit short-circuits execution");
        assert_eq!(store.misses(), 1);
        assert_eq!(store.writes(), 1);
        assert_eq!(store.hits(), 1);
        println!("cache hit avoided a physical query");
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn different_bindings_never_alias() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let driver = MockDriver::new();
        script_users(&driver);
        let store = Arc::new(MemoryCacheStore::new());
        let mut conn = cached_connection(&driver, &store);

        for id in [5, 6] {
            let mut cmd = conn.create_command(SQL);
            cmd.bind_value(":id", RowValues::Int(id));
            cmd.cache(CacheDuration::Seconds(60), None);
            cmd.query_all().await?;
        }
        assert_eq!(driver.executions_of(SQL), 2);
        assert_eq!(store.len(), 2);
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn fetch_shape_participates_in_the_key() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let driver = MockDriver::new();
        script_users(&driver);
        let store = Arc::new(MemoryCacheStore::new());
        let mut conn = cached_connection(&driver, &store);

        let mut cmd = conn.create_command(SQL);
        cmd.bind_value(":id", RowValues::Int(5));
        cmd.cache(CacheDuration::Seconds(60), None);
        cmd.query_all().await?;
        drop(cmd);

        // Same SQL and bindings, differently shaped fetch: no aliasing.
        let mut cmd = conn.create_command(SQL);
        cmd.bind_value(":id", RowValues::Int(5));
        cmd.cache(CacheDuration::Seconds(60), None);
        let scalar = cmd.query_scalar().await?;

        assert_eq!(scalar, Some(RowValues::Int(5)));
        assert_eq!(driver.executions_of(SQL), 2);
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn cache_scopes_apply_to_commands_without_explicit_policy()
-> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let driver = MockDriver::new();
        script_users(&driver);
        let store = Arc::new(MemoryCacheStore::new());
        let mut conn = cached_connection(&driver, &store);

        for _ in 0..2 {
            conn.with_query_cache(CacheDuration::Seconds(300), None, |c| {
                Box::pin(async move {
                    let mut cmd = c.create_command(SQL);
                    cmd.bind_value(":id", RowValues::Int(5));
                    cmd.query_all().await?;
                    Ok(())
                })
            })
            .await?;
        }
        assert_eq!(driver.executions_of(SQL), 1);
        assert_eq!(store.hits(), 1);

        // Outside any scope the same command is uncached.
        let mut cmd = conn.create_command(SQL);
        cmd.bind_value(":id", RowValues::Int(5));
        cmd.query_all().await?;
        drop(cmd);
        assert_eq!(driver.executions_of(SQL), 2);
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn disabled_scope_on_top_suppresses_caching() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let driver = MockDriver::new();
        script_users(&driver);
        let store = Arc::new(MemoryCacheStore::new());
        let mut conn = cached_connection(&driver, &store);

        conn.push_cache_scope(CacheDuration::Seconds(3600), None);
        conn.push_cache_scope(CacheDuration::Disabled, None);
        for _ in 0..2 {
            let mut cmd = conn.create_command(SQL);
            cmd.bind_value(":id", RowValues::Int(5));
            cmd.query_all().await?;
        }
        assert_eq!(driver.executions_of(SQL), 2);
        assert_eq!(store.writes(), 0);

        // Popping the disabling scope restores the outer one.
        conn.pop_cache_scope();
        let mut cmd = conn.create_command(SQL);
        cmd.bind_value(":id", RowValues::Int(5));
        cmd.query_all().await?;
        drop(cmd);
        assert_eq!(store.writes(), 1);
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn per_command_no_cache_overrides_the_scope() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let driver = MockDriver::new();
        script_users(&driver);
        let store = Arc::new(MemoryCacheStore::new());
        let mut conn = cached_connection(&driver, &store);

        conn.push_cache_scope(CacheDuration::Seconds(3600), None);
        for _ in 0..2 {
            let mut cmd = conn.create_command(SQL);
            cmd.bind_value(":id", RowValues::Int(5));
            cmd.no_cache();
            cmd.query_all().await?;
        }
        assert_eq!(driver.executions_of(SQL), 2);
        assert_eq!(store.writes(), 0);
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn reconnect_invalidates_cached_results() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let driver = MockDriver::new();
        script_users(&driver);
        let store = Arc::new(MemoryCacheStore::new());
        let mut conn = cached_connection(&driver, &store);

        let mut cmd = conn.create_command(SQL);
        cmd.bind_value(":id", RowValues::Int(5));
        cmd.cache(CacheDuration::Forever, None);
        cmd.query_all().await?;
        drop(cmd);

        // A new physical link mints a new fingerprint; old entries never match.
        conn.close();
        let mut cmd = conn.create_command(SQL);
        cmd.bind_value(":id", RowValues::Int(5));
        cmd.cache(CacheDuration::Forever, None);
        cmd.query_all().await?;
        drop(cmd);

        assert_eq!(driver.executions_of(SQL), 2);
        assert_eq!(store.hits(), 0);
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn caching_is_inert_without_the_pool_switch() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let driver = MockDriver::new();
        script_users(&driver);
        let store = Arc::new(MemoryCacheStore::new());
        let config = ConnectionConfig::new(
            "app",
            ServerConfig::new("mock://master:3306/app", "app", "secret"),
        );
        // Store wired up, but query_cache_enabled is off.
        let mut conn =
            Connection::new(config, Arc::new(driver.clone())).with_cache_store(Arc::clone(&store) as _);

        for _ in 0..2 {
            let mut cmd = conn.create_command(SQL);
            cmd.bind_value(":id", RowValues::Int(5));
            cmd.cache(CacheDuration::Seconds(60), None);
            cmd.query_all().await?;
        }
        assert_eq!(driver.executions_of(SQL), 2);
        assert!(store.is_empty());
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}
