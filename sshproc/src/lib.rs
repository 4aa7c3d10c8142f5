//! Remote processes and file transfer over SSH
//!
//! Provides:
//! - [`Connection`]: one authenticated SSH session per host
//! - [`RemoteProcess`]: a spawned remote command with stdin/stdout/stderr and
//!   `poll`/`wait` for its exit code
//! - [`SftpClient`]: put/get with default file names, plus basic remote file
//!   operations
//!
//! ```no_run
//! use sshproc::{ConnectConfig, Connection, ProcessOptions};
//! use tokio::io::AsyncReadExt;
//!
//! # async fn demo() -> sshproc::SshResult<()> {
//! let mut conn = Connection::connect(ConnectConfig::new("localhost")).await?;
//!
//! let mut proc = conn.spawn("whoami", ProcessOptions::default()).await?;
//! let mut out = String::new();
//! proc.stdout.take().unwrap().read_to_string(&mut out).await?;
//! assert_eq!(proc.wait().await?, 0);
//!
//! let mut sftp = conn.sftp().await?;
//! sftp.chdir(Some("/")).await?;
//! println!("{:?}", sftp.listdir(None).await?);
//!
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod connection;
mod error;
mod process;
mod sftp;
pub mod shell;

pub use config::{ConfigError, ConnectConfig, HostsToml};
pub use connection::Connection;
pub use error::{ErrorKind, SshError, SshResult};
pub use process::{
    CommandOutput, ProcessOptions, RemoteOutput, RemoteProcess, RemoteStderr, RemoteStdin,
    RemoteStdout,
};
pub use sftp::{ProgressCallback, SftpClient};
