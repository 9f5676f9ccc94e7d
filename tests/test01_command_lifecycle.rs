use std::sync::Arc;

use sql_conduit::mock::MockDriver;
use sql_conduit::prelude::*;
use sql_conduit::types::RowValues;
use tokio::runtime::Runtime;

fn app_config() -> ConnectionConfig {
    ConnectionConfig::new("app", ServerConfig::new("mock://master:3306/app", "app", "secret"))
        .with_table_prefix("app_")
}

#[test]
fn open_is_idempotent_and_close_rotates_fingerprint() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let driver = MockDriver::new();
        let mut conn = Connection::new(app_config(), Arc::new(driver.clone()));

        assert!(!conn.is_open());
        assert!(conn.fingerprint().is_empty());

        conn.open().await?;
        conn.open().await?;
        assert!(conn.is_open());
        assert_eq!(driver.connect_count(), 1, "second open must be a no-op");

        let first_fingerprint = conn.fingerprint().to_string();
        assert!(!first_fingerprint.is_empty());

        conn.close();
        assert!(!conn.is_open());
        conn.open().await?;
        assert_ne!(
            conn.fingerprint(),
            first_fingerprint,
            "reopen must mint a fresh fingerprint"
        );
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn init_statements_run_on_every_open() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let driver = MockDriver::new();
        let config = app_config().with_init_statements(vec!["SET NAMES utf8mb4".to_string()]);
        let mut conn = Connection::new(config, Arc::new(driver.clone()));

        conn.open().await?;
        conn.close();
        conn.open().await?;

        let inits: Vec<_> = driver
            .raw_statements()
            .into_iter()
            .filter(|s| s == "SET NAMES utf8mb4")
            .collect();
        assert_eq!(inits.len(), 2);
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn driver_name_and_schema_resolve_without_opening() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let driver = MockDriver::new();
        let mut conn = Connection::new(app_config(), Arc::new(driver.clone()));

        assert_eq!(conn.driver_name()?, "mock");
        assert_eq!(conn.schema()?.raw_table_name("{{%user}}"), "app_user");
        assert_eq!(conn.schema()?.raw_table_name("plain"), "plain");
        assert_eq!(driver.connect_count(), 0, "name comes from the DSN scheme");
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn empty_sql_is_a_no_op() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let driver = MockDriver::new();
        let mut conn = Connection::new(app_config(), Arc::new(driver.clone()));

        let affected = conn.create_command("   ").execute().await?;
        assert_eq!(affected, 0);
        let rs = conn.create_command("").query_all().await?;
        assert!(rs.results.is_empty());
        assert_eq!(driver.connect_count(), 0, "no-op must never touch the link");
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn binding_works_before_and_after_prepare() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let sql = "SELECT id FROM users WHERE id = :id AND name = :name";
        let driver = MockDriver::new();
        driver.on_query(sql, &["id"], vec![vec![RowValues::Int(7)]]);
        let mut conn = Connection::new(app_config(), Arc::new(driver.clone()));

        let mut cmd = conn.create_command(sql);
        cmd.bind_value(":id", RowValues::Int(7));
        cmd.prepare(Some(true)).await?;
        cmd.bind_value(":name", RowValues::Text("o'brien".into()));

        let rs = cmd.query_all().await?;
        assert_eq!(rs.results[0].get("id"), Some(&RowValues::Int(7)));
        assert_eq!(
            cmd.raw_sql(),
            "SELECT id FROM users WHERE id = 7 AND name = 'o''brien'"
        );
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn set_sql_discards_handle_and_bindings() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let driver = MockDriver::new();
        let mut conn = Connection::new(app_config(), Arc::new(driver.clone()));

        let mut cmd = conn.create_command("SELECT * FROM a WHERE id = :id");
        cmd.bind_value(":id", RowValues::Int(1));
        cmd.set_sql("SELECT * FROM b");
        assert_eq!(cmd.raw_sql(), "SELECT * FROM b", "old bindings must not leak");

        // Unchanged text keeps bindings.
        cmd.bind_value(":id", RowValues::Int(2));
        cmd.set_sql("SELECT * FROM b");
        assert_eq!(cmd.sql(), "SELECT * FROM b");
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn detached_clone_resets_derived_state() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let driver = MockDriver::new();
        let mut conn = Connection::new(app_config(), Arc::new(driver.clone()));
        conn.open().await?;

        let fresh = conn.clone_detached();
        assert!(!fresh.is_open());
        assert!(fresh.fingerprint().is_empty());
        assert_eq!(fresh.config().pool, "app");
        assert!(conn.is_open(), "the original keeps its link");
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}
