use std::sync::Arc;

use sql_conduit::mock::MockDriver;
use sql_conduit::prelude::*;
use sql_conduit::types::RowValues;
use tokio::runtime::Runtime;

const MASTER: &str = "mock://master:3306/app";
const SLAVE: &str = "mock://slave1:3306/app";

fn replicated_config() -> ConnectionConfig {
    ConnectionConfig::new("app", ServerConfig::new(MASTER, "app", "secret"))
        .with_slaves(vec![ServerConfig::new(SLAVE, "app", "secret")])
}

#[test]
fn reads_go_to_the_slave_and_writes_to_the_master() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let read_sql = "SELECT id FROM widget";
        let write_sql = "UPDATE widget SET hits = 0";
        let driver = MockDriver::new();
        driver.on_query(read_sql, &["id"], vec![vec![RowValues::Int(1)]]);
        driver.on_execute(write_sql, 2);
        let mut conn = Connection::new(replicated_config(), Arc::new(driver.clone()));

        conn.create_command(read_sql).query_all().await?;
        conn.create_command(write_sql).execute().await?;

        assert_eq!(driver.servers_for(read_sql), vec![SLAVE.to_string()]);
        assert_eq!(driver.servers_for(write_sql), vec![MASTER.to_string()]);
        println!("read routed to slave, write to master");
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn reads_inside_a_transaction_stick_to_the_master() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let read_sql = "SELECT id FROM widget";
        let driver = MockDriver::new();
        driver.on_query(read_sql, &["id"], vec![vec![RowValues::Int(1)]]);
        let mut conn = Connection::new(replicated_config(), Arc::new(driver.clone()));

        let token = conn.begin_transaction(None).await?;
        conn.create_command(read_sql).query_all().await?;
        conn.commit(token).await?;
        assert_eq!(driver.servers_for(read_sql), vec![MASTER.to_string()]);

        // After the transaction ends, reads return to the slave.
        conn.create_command(read_sql).query_all().await?;
        assert_eq!(
            driver.servers_for(read_sql),
            vec![MASTER.to_string(), SLAVE.to_string()]
        );
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn use_master_forces_reads_and_restores_routing() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let read_sql = "SELECT id FROM widget";
        let driver = MockDriver::new();
        driver.on_query(read_sql, &["id"], vec![vec![RowValues::Int(1)]]);
        let mut conn = Connection::new(replicated_config(), Arc::new(driver.clone()));

        conn.use_master(|c| {
            Box::pin(async move {
                c.create_command(read_sql).query_all().await?;
                Ok(())
            })
        })
        .await?;
        assert_eq!(driver.servers_for(read_sql), vec![MASTER.to_string()]);

        conn.create_command(read_sql).query_all().await?;
        assert_eq!(
            driver.servers_for(read_sql),
            vec![MASTER.to_string(), SLAVE.to_string()],
            "routing mode restored after the scope"
        );
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn unreachable_slave_falls_back_to_the_master() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let read_sql = "SELECT id FROM widget";
        let driver = MockDriver::new();
        driver.on_query(read_sql, &["id"], vec![vec![RowValues::Int(1)]]);
        driver.refuse_connections_to(SLAVE);
        let mut conn = Connection::new(replicated_config(), Arc::new(driver.clone()));

        conn.create_command(read_sql).query_all().await?;
        assert_eq!(driver.servers_for(read_sql), vec![MASTER.to_string()]);

        // The failed resolution is sticky for the connection's lifetime, even
        // once the slave is reachable again.
        driver.allow_connections_to(SLAVE);
        conn.create_command(read_sql).query_all().await?;
        assert_eq!(
            driver.servers_for(read_sql),
            vec![MASTER.to_string(), MASTER.to_string()]
        );

        // close() resets sibling resolution.
        conn.close();
        conn.create_command(read_sql).query_all().await?;
        assert_eq!(
            driver.servers_for(read_sql),
            vec![MASTER.to_string(), MASTER.to_string(), SLAVE.to_string()]
        );
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn disabled_slaves_mean_master_only() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let read_sql = "SELECT id FROM widget";
        let driver = MockDriver::new();
        driver.on_query(read_sql, &["id"], vec![vec![RowValues::Int(1)]]);
        let mut config = replicated_config();
        config.enable_slaves = false;
        let mut conn = Connection::new(config, Arc::new(driver.clone()));

        conn.create_command(read_sql).query_all().await?;
        assert_eq!(driver.servers_for(read_sql), vec![MASTER.to_string()]);

        assert!(conn.get_slave(false).await?.is_none());
        let fallback = conn.get_slave(true).await?.ok_or_else(|| {
            SqlConduitError::ConnectionError("expected the master as fallback".to_string())
        })?;
        assert_eq!(fallback.config().pool, "app");
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}

#[test]
fn resolved_slave_is_a_role_qualified_sibling() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let driver = MockDriver::new();
        let mut conn = Connection::new(replicated_config(), Arc::new(driver.clone()));

        let slave = conn.get_slave(false).await?.ok_or_else(|| {
            SqlConduitError::ConnectionError("expected a resolved slave".to_string())
        })?;
        assert_eq!(slave.config().pool, "app.slave");
        assert_eq!(slave.config().server.dsn, SLAVE);
        assert!(slave.config().slaves.is_empty(), "siblings never re-route");
        Ok::<(), SqlConduitError>(())
    })?;
    Ok(())
}
