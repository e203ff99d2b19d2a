//! Local Postgres process control
//!
//! [`LocalPostgres`] is what the state machine needs from the managed
//! instance besides SQL. [`PgCtl`] implements it with the `pg_ctl`,
//! `pg_basebackup` and `pg_rewind` programs.

use crate::common::{Error, Result};
use crate::keeper::node::NodeAddress;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Credentials a standby uses to stream from its primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSource {
    pub username: String,
    pub password: Option<String>,
    pub slot_name: String,
    pub dbname: String,
}

impl ReplicationSource {
    /// Connection string to `primary`, without the password.
    pub fn conninfo(&self, primary: &NodeAddress) -> String {
        primary.conninfo(&self.dbname, Some(&self.username))
    }
}

#[async_trait]
pub trait LocalPostgres: Send + Sync {
    async fn is_running(&self) -> Result<bool>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn restart(&self) -> Result<()>;

    async fn promote(&self) -> Result<()>;

    /// Replace the data directory with a base backup of `primary` and start
    /// streaming from it.
    async fn init_standby(&self, primary: &NodeAddress, source: &ReplicationSource) -> Result<()>;

    /// Rewind the data directory to follow `primary`, then start.
    async fn rewind(&self, primary: &NodeAddress, source: &ReplicationSource) -> Result<()>;
}

/// `pg_ctl status` exit code for a server that is not running.
const PG_CTL_STATUS_NOT_RUNNING: i32 = 3;

/// `pg_ctl status` exit code for a missing data directory.
const PG_CTL_STATUS_NO_DATA_DIR: i32 = 4;

#[derive(Debug, Clone)]
pub struct PgCtl {
    pgdata: PathBuf,
    bin_dir: Option<PathBuf>,
    port: u16,
}

impl PgCtl {
    pub fn new(pgdata: impl AsRef<Path>, bin_dir: Option<PathBuf>, port: u16) -> Self {
        Self {
            pgdata: pgdata.as_ref().to_path_buf(),
            bin_dir,
            port,
        }
    }

    pub fn pgdata(&self) -> &Path {
        &self.pgdata
    }

    fn program(&self, name: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    fn log_file(&self) -> PathBuf {
        self.pgdata.join("startup.log")
    }

    async fn output(&self, name: &str, args: &[OsString], password: Option<&str>) -> Result<Output> {
        let program = self.program(name);
        debug!("{} {:?}", program.display(), args);

        let mut command = Command::new(&program);
        command.args(args).env("PGCONNECT_TIMEOUT", "10");
        if let Some(password) = password {
            command.env("PGPASSWORD", password);
        }

        command
            .output()
            .await
            .map_err(|e| Error::Process(format!("failed to run {}: {}", program.display(), e)))
    }

    async fn run(&self, name: &str, args: &[OsString], password: Option<&str>) -> Result<()> {
        let output = self.output(name, args, password).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::Process(format!(
            "{} exited with {}: {}",
            name,
            output.status,
            stderr.trim()
        )))
    }

    fn pgdata_args(&self, action: &str) -> Vec<OsString> {
        vec![
            action.into(),
            "--pgdata".into(),
            self.pgdata.clone().into_os_string(),
        ]
    }

    /// Move the current data directory out of the way before a base backup.
    async fn set_aside_pgdata(&self) -> Result<()> {
        if !tokio::fs::try_exists(&self.pgdata).await? {
            return Ok(());
        }
        let mut backup = self.pgdata.clone().into_os_string();
        backup.push(".backup");
        let backup = PathBuf::from(backup);

        if tokio::fs::try_exists(&backup).await? {
            tokio::fs::remove_dir_all(&backup).await?;
        }
        info!(
            "Moving data directory {} to {}",
            self.pgdata.display(),
            backup.display()
        );
        tokio::fs::rename(&self.pgdata, &backup).await?;
        Ok(())
    }
}

#[async_trait]
impl LocalPostgres for PgCtl {
    async fn is_running(&self) -> Result<bool> {
        let output = self.output("pg_ctl", &self.pgdata_args("status"), None).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(PG_CTL_STATUS_NOT_RUNNING) | Some(PG_CTL_STATUS_NO_DATA_DIR) => Ok(false),
            _ => Err(Error::Process(format!(
                "pg_ctl status exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    async fn start(&self) -> Result<()> {
        info!("Starting Postgres in {}", self.pgdata.display());
        let mut args = self.pgdata_args("start");
        args.extend([
            "--wait".into(),
            "--options".into(),
            format!("-p {}", self.port).into(),
            "--log".into(),
            self.log_file().into_os_string(),
        ]);
        self.run("pg_ctl", &args, None).await
    }

    async fn stop(&self) -> Result<()> {
        if !self.is_running().await? {
            debug!("Postgres is already stopped");
            return Ok(());
        }
        info!("Stopping Postgres in {}", self.pgdata.display());
        let mut args = self.pgdata_args("stop");
        args.extend(["--wait".into(), "--mode".into(), "fast".into()]);
        self.run("pg_ctl", &args, None).await
    }

    async fn restart(&self) -> Result<()> {
        info!("Restarting Postgres in {}", self.pgdata.display());
        let mut args = self.pgdata_args("restart");
        args.extend([
            "--wait".into(),
            "--mode".into(),
            "fast".into(),
            "--options".into(),
            format!("-p {}", self.port).into(),
            "--log".into(),
            self.log_file().into_os_string(),
        ]);
        self.run("pg_ctl", &args, None).await
    }

    async fn promote(&self) -> Result<()> {
        info!("Promoting Postgres in {}", self.pgdata.display());
        let mut args = self.pgdata_args("promote");
        args.push("--wait".into());
        self.run("pg_ctl", &args, None).await
    }

    async fn init_standby(&self, primary: &NodeAddress, source: &ReplicationSource) -> Result<()> {
        self.stop().await?;
        self.set_aside_pgdata().await?;

        info!(
            "Running pg_basebackup from {}:{} using slot \"{}\"",
            primary.host, primary.port, source.slot_name
        );
        let args: Vec<OsString> = vec![
            "--pgdata".into(),
            self.pgdata.clone().into_os_string(),
            "--dbname".into(),
            source.conninfo(primary).into(),
            "--wal-method=stream".into(),
            "--write-recovery-conf".into(),
            "--slot".into(),
            source.slot_name.clone().into(),
            "--checkpoint=fast".into(),
            "--no-password".into(),
        ];
        self.run("pg_basebackup", &args, source.password.as_deref())
            .await?;

        self.start().await
    }

    async fn rewind(&self, primary: &NodeAddress, source: &ReplicationSource) -> Result<()> {
        self.stop().await?;

        info!("Rewinding against {}:{}", primary.host, primary.port);
        let args: Vec<OsString> = vec![
            "--target-pgdata".into(),
            self.pgdata.clone().into_os_string(),
            "--source-server".into(),
            source.conninfo(primary).into(),
            "--write-recovery-conf".into(),
            "--progress".into(),
        ];
        if let Err(e) = self.run("pg_rewind", &args, source.password.as_deref()).await {
            warn!("pg_rewind failed: {}", e);
            return Err(e);
        }

        self.start().await
    }
}
