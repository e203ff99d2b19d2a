//! Statements the keeper runs on Postgres
//!
//! Each helper is a single statement (or an `ALTER SYSTEM` followed by a
//! configuration reload). DDL that may already have been applied treats the
//! server's "already exists" report as success.

use crate::common::{Error, Result};
use crate::pgsql::connection::ConnectionHandle;
use crate::pgsql::result::{SingleBool, SingleText};
use crate::pgsql::transport::NoticeLevel;
use postgres_protocol::escape::{escape_identifier, escape_literal};
use tracing::{debug, error, info};

/// Minimal settings a node needs to take part in streaming replication.
const CHECK_POSTGRESQL_SETTINGS_SQL: &str = "\
select bool_and(ok) from (values \
 (current_setting('max_wal_senders')::int >= 4), \
 (current_setting('max_replication_slots')::int >= 4), \
 (current_setting('wal_level') in ('replica', 'logical', 'hot_standby')), \
 (current_setting('wal_log_hints') = 'on')\
) as t(ok)";

const CHECK_COORDINATOR_SETTINGS_SQL: &str = "\
select exists(select 1 from \
unnest(string_to_array(current_setting('shared_preload_libraries'), ',')) as t(name) \
where trim(name) = $1)";

/// Options of a `CREATE USER` statement.
#[derive(Debug, Clone, Default)]
pub struct UserOptions<'a> {
    pub password: Option<&'a str>,
    pub login: bool,
    pub superuser: bool,
    pub replication: bool,
}

impl ConnectionHandle {
    /// Run a DDL statement, accepting an "already exists" error.
    async fn execute_idempotent(&mut self, what: &str, command: &str) -> Result<()> {
        match self.execute(command, &[]).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_duplicate() => {
                info!("The {} already exists, skipping.", what);
                Ok(())
            }
            Err(e) => {
                error!("Failed to create {}: {}", what, e);
                Err(e)
            }
        }
    }

    async fn alter_system_set(&mut self, name: &str, value: &str) -> Result<()> {
        let command = format!("ALTER SYSTEM SET {} TO {}", name, escape_literal(value));
        self.execute(&command, &[]).await?;
        self.reload_conf().await
    }

    pub async fn is_in_recovery(&mut self) -> Result<bool> {
        self.query_as("SELECT pg_is_in_recovery()", &[], SingleBool)
            .await
    }

    pub async fn current_setting(&mut self, name: &str) -> Result<String> {
        self.query_as("SELECT current_setting($1)", &[name], SingleText)
            .await
    }

    /// Are the settings needed for streaming replication in place?
    pub async fn check_postgresql_settings(&mut self) -> Result<bool> {
        self.query_as(CHECK_POSTGRESQL_SETTINGS_SQL, &[], SingleBool)
            .await
    }

    /// Is the coordinator extension part of `shared_preload_libraries`?
    pub async fn check_coordinator_settings(&mut self, extension: &str) -> Result<bool> {
        self.query_as(CHECK_COORDINATOR_SETTINGS_SQL, &[extension], SingleBool)
            .await
    }

    pub async fn create_replication_slot(&mut self, slot_name: &str) -> Result<()> {
        info!("Create replication slot \"{}\"", slot_name);
        match self
            .execute("SELECT pg_create_physical_replication_slot($1)", &[slot_name])
            .await
        {
            Err(e) if e.is_duplicate() => {
                info!("The replication slot \"{}\" already exists, skipping.", slot_name);
                Ok(())
            }
            result => result,
        }
    }

    /// Drop a replication slot if it exists.
    pub async fn drop_replication_slot(&mut self, slot_name: &str, verbose: bool) -> Result<()> {
        if verbose {
            info!("Drop replication slot \"{}\"", slot_name);
        }
        self.execute(
            "SELECT pg_drop_replication_slot(slot_name) \
               FROM pg_replication_slots \
              WHERE slot_name = $1",
            &[slot_name],
        )
        .await
    }

    /// Make every commit wait for a standby.
    pub async fn enable_synchronous_replication(&mut self) -> Result<()> {
        info!("Enabling synchronous replication");
        self.alter_system_set("synchronous_standby_names", "*")
            .await
    }

    /// Stop waiting for standbys and release sessions already blocked on one.
    pub async fn disable_synchronous_replication(&mut self) -> Result<()> {
        info!("Disabling synchronous replication");
        self.alter_system_set("synchronous_standby_names", "")
            .await?;

        debug!("Unblocking commands waiting for synchronous replication");
        self.execute(
            "SELECT pg_cancel_backend(pid) FROM pg_stat_activity WHERE wait_event = 'SyncRep'",
            &[],
        )
        .await
    }

    pub async fn set_default_transaction_read_only(&mut self) -> Result<()> {
        info!("Setting default_transaction_read_only to on");
        self.alter_system_set("default_transaction_read_only", "on")
            .await
    }

    pub async fn set_default_transaction_read_write(&mut self) -> Result<()> {
        info!("Setting default_transaction_read_only to off");
        self.alter_system_set("default_transaction_read_only", "off")
            .await
    }

    pub async fn checkpoint(&mut self) -> Result<()> {
        self.execute("CHECKPOINT", &[]).await
    }

    pub async fn reload_conf(&mut self) -> Result<()> {
        self.execute("SELECT pg_reload_conf()", &[]).await
    }

    pub async fn get_config_file_path(&mut self) -> Result<String> {
        self.current_setting("config_file").await
    }

    pub async fn get_hba_file_path(&mut self) -> Result<String> {
        self.current_setting("hba_file").await
    }

    pub async fn create_database(&mut self, dbname: &str, owner: &str) -> Result<()> {
        let command = format!(
            "CREATE DATABASE {} WITH OWNER {}",
            escape_identifier(dbname),
            escape_identifier(owner)
        );
        debug!("Running command on Postgres: {};", command);
        self.execute_idempotent(&format!("database \"{}\"", dbname), &command)
            .await
    }

    pub async fn create_extension(&mut self, name: &str) -> Result<()> {
        let command = format!("CREATE EXTENSION {}", escape_identifier(name));
        debug!("Running command on Postgres: {};", command);
        self.execute_idempotent(&format!("extension \"{}\"", name), &command)
            .await
    }

    pub async fn alter_extension_update_to(&mut self, name: &str, version: &str) -> Result<()> {
        let command = format!(
            "ALTER EXTENSION {} UPDATE TO {}",
            escape_identifier(name),
            escape_literal(version)
        );
        info!("Updating extension \"{}\" to version {}", name, version);
        self.execute(&command, &[]).await
    }

    /// Create a role. Server notices are demoted to debug for the duration
    /// of the statement and the password never reaches the logs.
    pub async fn create_user(&mut self, username: &str, options: &UserOptions<'_>) -> Result<()> {
        let mut command = format!("CREATE USER {}", escape_identifier(username));

        if options.login || options.superuser || options.replication || options.password.is_some() {
            command.push_str(" WITH");
        }
        if options.login {
            command.push_str(" LOGIN");
        }
        if options.superuser {
            command.push_str(" SUPERUSER");
        }
        if options.replication {
            command.push_str(" REPLICATION");
        }
        match options.password {
            Some(password) => {
                debug!("Running command on Postgres: {} PASSWORD '*****';", command);
                command.push_str(" PASSWORD ");
                command.push_str(&escape_literal(password));
            }
            None => debug!("Running command on Postgres: {};", command),
        }

        self.set_notice_level(NoticeLevel::Debug);
        let result = self.execute(&command, &[]).await;
        self.set_notice_level(NoticeLevel::Warn);

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_duplicate() => {
                info!("The user \"{}\" already exists, skipping.", username);
                Ok(())
            }
            Err(Error::QueryFailed { sqlstate, message }) => {
                error!("Failed to create user \"{}\"[{}]: {}", username, sqlstate, message);
                Err(Error::QueryFailed { sqlstate, message })
            }
            Err(e) => Err(e),
        }
    }

    /// Is a replica streaming (or base-backing up) as `username`?
    pub async fn has_replica(&mut self, username: &str) -> Result<bool> {
        self.query_as(
            "SELECT EXISTS (SELECT 1 FROM pg_stat_replication WHERE usename = $1)",
            &[username],
            SingleBool,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::shutdown::StopSignal;
    use crate::common::SQLSTATE_DUPLICATE_OBJECT;
    use crate::pgsql::connection::ConnectionClass;
    use crate::pgsql::result::RawRow;
    use crate::pgsql::retry::RetryPolicy;
    use crate::testing::{MockConnector, MockServer};
    use std::sync::Arc;

    fn local(server: &MockServer) -> ConnectionHandle {
        ConnectionHandle::new(
            ConnectionClass::Local,
            "host=localhost port=5432 dbname=postgres",
            Arc::new(MockConnector::new(server.clone())),
            RetryPolicy::default(),
            StopSignal::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_extension_twice() {
        let server = MockServer::new();
        let mut pg = local(&server);

        pg.create_extension("hstore").await.unwrap();
        server.fail_once("CREATE EXTENSION", SQLSTATE_DUPLICATE_OBJECT, "extension \"hstore\" already exists");
        pg.create_extension("hstore").await.unwrap();

        assert_eq!(server.count("CREATE EXTENSION \"hstore\""), 2);
    }

    #[tokio::test]
    async fn test_create_slot_already_exists() {
        let server = MockServer::new();
        server.fail_on(
            "SELECT pg_create_physical_replication_slot",
            SQLSTATE_DUPLICATE_OBJECT,
            "replication slot \"standby\" already exists",
        );
        let mut pg = local(&server);
        pg.create_replication_slot("standby").await.unwrap();
        pg.create_replication_slot("standby").await.unwrap();

        let statements = server.statements();
        assert_eq!(statements[0].params, vec!["standby".to_string()]);
    }

    #[tokio::test]
    async fn test_create_database_duplicate_database() {
        let server = MockServer::new();
        server.fail_on("CREATE DATABASE", "42P04", "database \"app\" already exists");
        let mut pg = local(&server);
        pg.create_database("app", "keeper").await.unwrap();
        assert_eq!(server.count("CREATE DATABASE \"app\" WITH OWNER \"keeper\""), 1);
    }

    #[tokio::test]
    async fn test_other_ddl_errors_surface() {
        let server = MockServer::new();
        server.fail_on("CREATE EXTENSION", "58P01", "could not open extension control file");
        let mut pg = local(&server);
        let err = pg.create_extension("nope").await.unwrap_err();
        assert_eq!(err.sqlstate(), Some("58P01"));
    }

    #[tokio::test]
    async fn test_create_user_escapes_and_quiets_notices() {
        let server = MockServer::new();
        let mut pg = local(&server);
        pg.create_user(
            "rep\"user",
            &UserOptions {
                password: Some("it's secret"),
                login: true,
                replication: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let statements = server.statements();
        let create = &statements[0];
        assert!(create
            .sql
            .starts_with("CREATE USER \"rep\"\"user\" WITH LOGIN REPLICATION PASSWORD "));
        assert!(create.sql.ends_with("'it''s secret'"));
        assert_eq!(create.notice_level, NoticeLevel::Debug);

        // restored afterwards
        pg.checkpoint().await.unwrap();
        assert_eq!(server.statements()[1].notice_level, NoticeLevel::Warn);
    }

    #[tokio::test]
    async fn test_disable_sync_rep_reloads_and_unblocks() {
        let server = MockServer::new();
        let mut pg = local(&server);
        pg.disable_synchronous_replication().await.unwrap();

        let sql: Vec<String> = server.statements().into_iter().map(|s| s.sql).collect();
        assert_eq!(
            sql,
            vec![
                "ALTER SYSTEM SET synchronous_standby_names TO ''".to_string(),
                "SELECT pg_reload_conf()".to_string(),
                "SELECT pg_cancel_backend(pid) FROM pg_stat_activity WHERE wait_event = 'SyncRep'"
                    .to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_has_replica() {
        let server = MockServer::new();
        server.on("SELECT EXISTS", vec![RawRow::from_values(&["t"])]);
        let mut pg = local(&server);
        assert!(pg.has_replica("pgkeeper_replicator").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_user_twice() {
        let server = MockServer::new();
        let mut pg = local(&server);
        let options = UserOptions {
            login: true,
            ..Default::default()
        };

        pg.create_user("keeper", &options).await.unwrap();
        server.fail_once("CREATE USER", SQLSTATE_DUPLICATE_OBJECT, "role \"keeper\" already exists");
        pg.create_user("keeper", &options).await.unwrap();

        assert_eq!(server.count("CREATE USER \"keeper\" WITH LOGIN"), 2);
    }

    #[tokio::test]
    async fn test_alter_extension_update_to() {
        let server = MockServer::new();
        let mut pg = local(&server);
        pg.alter_extension_update_to("pg\"auto", "1.6'x").await.unwrap();

        let statements = server.statements();
        assert_eq!(statements[0].sql, "ALTER EXTENSION \"pg\"\"auto\" UPDATE TO '1.6''x'");
        assert!(statements[0].params.is_empty());
    }

    #[tokio::test]
    async fn test_check_coordinator_settings() {
        let server = MockServer::new();
        server.on("select exists", vec![RawRow::from_values(&["f"])]);
        let mut pg = local(&server);

        assert!(!pg.check_coordinator_settings("pgautofailover").await.unwrap());
        let statements = server.statements();
        assert!(statements[0].sql.contains("current_setting('shared_preload_libraries')"));
        assert_eq!(statements[0].params, vec!["pgautofailover".to_string()]);
    }

    #[tokio::test]
    async fn test_file_paths() {
        let server = MockServer::new();
        server.on(
            "SELECT current_setting",
            vec![RawRow::from_values(&["/data/pg_hba.conf"])],
        );
        let mut pg = local(&server);

        assert_eq!(pg.get_hba_file_path().await.unwrap(), "/data/pg_hba.conf");
        let statements = server.statements();
        assert_eq!(statements[0].params, vec!["hba_file".to_string()]);

        pg.get_config_file_path().await.unwrap();
        assert_eq!(server.statements()[1].params, vec!["config_file".to_string()]);
    }
}
