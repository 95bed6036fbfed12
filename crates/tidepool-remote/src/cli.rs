use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tidepool_protocol::LockType;

use crate::config::RemoteConfig;

/// Lock files taken on the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LockArg {
    /// Archive lock only.
    Archive,
    /// Backup lock only.
    Backup,
    /// Archive and backup locks.
    All,
}

impl From<LockArg> for LockType {
    fn from(arg: LockArg) -> Self {
        match arg {
            LockArg::Archive => LockType::Archive,
            LockArg::Backup => LockType::Backup,
            LockArg::All => LockType::All,
        }
    }
}

/// Command line of the remote worker. Flags override the config file.
#[derive(Debug, Parser)]
#[command(name = "tidepool-remote")]
#[command(about = "Serve repository storage to a tidepool client over stdin/stdout", long_about = None)]
pub struct Cli {
    /// Config file (.toml or .json).
    #[arg(short, long, env = "TIDEPOOL_REMOTE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Worker index; only worker 0 takes the lock.
    #[arg(short, long)]
    pub process: Option<u32>,

    /// Repository base path.
    #[arg(long)]
    pub repo_path: Option<String>,

    /// Allow writes to the repository.
    #[arg(long)]
    pub write: bool,

    /// Stanza to lock on the handshake.
    #[arg(long)]
    pub stanza: Option<String>,

    /// Lock files to take; requires --stanza.
    #[arg(long, value_enum, requires = "stanza")]
    pub lock_type: Option<LockArg>,

    /// Directory holding lock files.
    #[arg(long, requires = "stanza")]
    pub lock_path: Option<PathBuf>,

    /// Execution id shared with the client.
    #[arg(long, requires = "stanza")]
    pub exec_id: Option<String>,

    /// Protocol read timeout in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

impl Cli {
    /// Load the config file, if any, and apply the flags on top.
    pub fn resolve(&self) -> anyhow::Result<RemoteConfig> {
        let mut config = match &self.config {
            Some(path) => RemoteConfig::from_file(path)?,
            None => RemoteConfig::default(),
        };

        if let Some(process) = self.process {
            config.server.process_index = process;
        }
        if let Some(path) = &self.repo_path {
            config.repo.path = path.clone();
        }
        if self.write {
            config.repo.write = true;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.server.timeout_ms = timeout_ms;
        }
        if let Some(stanza) = &self.stanza {
            let mut lock = config.server.lock.take().unwrap_or_default();
            lock.stanza = stanza.clone();
            if let Some(lock_type) = self.lock_type {
                lock.lock_type = lock_type.into();
            }
            if let Some(lock_path) = &self.lock_path {
                lock.lock_path = lock_path.clone();
            }
            if let Some(exec_id) = &self.exec_id {
                lock.exec_id = exec_id.clone();
            }
            config.server.lock = Some(lock);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "tidepool-remote",
            "--process",
            "2",
            "--repo-path",
            "/repo",
            "--write",
            "--stanza",
            "db",
            "--lock-type",
            "all",
            "--exec-id",
            "42-abc",
        ])
        .unwrap();
        let config = cli.resolve().unwrap();
        assert_eq!(config.server.process_index, 2);
        assert_eq!(config.repo.path, "/repo");
        assert!(config.repo.write);
        let lock = config.server.lock.unwrap();
        assert_eq!(lock.stanza, "db");
        assert_eq!(lock.lock_type, LockType::All);
        assert_eq!(lock.exec_id, "42-abc");
    }

    #[test]
    fn test_lock_flags_need_stanza() {
        assert!(Cli::try_parse_from(["tidepool-remote", "--lock-type", "backup"]).is_err());
        let config = Cli::try_parse_from(["tidepool-remote"]).unwrap().resolve().unwrap();
        assert!(config.server.lock.is_none());
        assert!(!config.repo.write);
    }
}
