//! SFTP client for file transfers

use super::connection::ClientHandler;
use super::error::{SshError, SshResult};
use russh::client::Handle;
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpProtocolError;
use russh_sftp::protocol::StatusCode;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Progress callback for file transfers: `(bytes_transferred, total_bytes)`
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send>;

const CHUNK_SIZE: usize = 64 * 1024;

/// SFTP client bound to an existing connection.
///
/// Relative remote paths resolve against the directory set with
/// [`SftpClient::chdir`], or the server's default directory when none is set.
pub struct SftpClient {
    session: Option<SftpSession>,
    cwd: Option<String>,
}

impl SftpClient {
    pub(crate) async fn open(handle: &Handle<ClientHandler>) -> SshResult<Self> {
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::Channel(e.to_string()))?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::Transfer(format!("Failed to request SFTP subsystem: {}", e)))?;

        let session = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::Transfer(format!("Failed to create SFTP session: {}", e)))?;

        tracing::debug!("SFTP session opened");

        Ok(Self {
            session: Some(session),
            cwd: None,
        })
    }

    fn session(&self) -> SshResult<&SftpSession> {
        self.session.as_ref().ok_or(SshError::NotConnected)
    }

    /// Resolve a remote path against the current directory.
    pub fn resolve(&self, path: &str) -> String {
        match &self.cwd {
            Some(cwd) if !path.starts_with('/') => join_remote(cwd, path),
            _ => path.to_string(),
        }
    }

    /// Upload `local` to `remote`.
    ///
    /// Without `remote` the file keeps its base name and lands in the current
    /// remote directory.
    pub async fn put(
        &self,
        local: &Path,
        remote: Option<&str>,
        progress: Option<ProgressCallback>,
    ) -> SshResult<()> {
        let remote = match remote.filter(|remote| !remote.is_empty()) {
            Some(remote) => remote.to_string(),
            None => default_remote_name(local)?,
        };
        let remote_path = self.resolve(&remote);

        let mut file = File::open(local).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SshError::FileNotFound(local.to_path_buf()),
            _ => SshError::Io(e),
        })?;
        let session = self.session()?;

        let metadata = file.metadata().await?;
        let total_size = metadata.len();

        let mut remote_file = session
            .create(remote_path.as_str())
            .await
            .map_err(|e| SshError::Transfer(format!("Failed to create {}: {}", remote_path, e)))?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut transferred = 0u64;

        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }

            remote_file
                .write_all(&buffer[..n])
                .await
                .map_err(|e| SshError::Transfer(format!("Failed to write {}: {}", remote_path, e)))?;

            transferred += n as u64;

            if let Some(ref cb) = progress {
                cb(transferred, total_size);
            }
        }

        remote_file
            .shutdown()
            .await
            .map_err(|e| SshError::Transfer(format!("Failed to close {}: {}", remote_path, e)))?;

        tracing::debug!(
            local = %local.display(),
            remote = %remote_path,
            size = transferred,
            "File uploaded"
        );

        Ok(())
    }

    /// Download `remote` to `local`.
    ///
    /// Without `local` the file keeps its base name and lands in the process's
    /// current directory.
    pub async fn get(
        &self,
        remote: &str,
        local: Option<&Path>,
        progress: Option<ProgressCallback>,
    ) -> SshResult<()> {
        let local = match local.filter(|local| !local.as_os_str().is_empty()) {
            Some(local) => local.to_path_buf(),
            None => default_local_name(remote)?,
        };
        let remote_path = self.resolve(remote);
        let session = self.session()?;

        let metadata = session
            .metadata(remote_path.as_str())
            .await
            .map_err(|e| SshError::Transfer(format!("Failed to stat {}: {}", remote_path, e)))?;

        let total_size = metadata.size.unwrap_or(0);

        let mut remote_file = session
            .open(remote_path.as_str())
            .await
            .map_err(|e| SshError::Transfer(format!("Failed to open {}: {}", remote_path, e)))?;

        let mut local_file = File::create(&local).await?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut transferred = 0u64;

        loop {
            let n = remote_file
                .read(&mut buffer)
                .await
                .map_err(|e| SshError::Transfer(format!("Failed to read {}: {}", remote_path, e)))?;

            if n == 0 {
                break;
            }

            local_file.write_all(&buffer[..n]).await?;
            transferred += n as u64;

            if let Some(ref cb) = progress {
                cb(transferred, total_size);
            }
        }

        local_file.flush().await?;

        tracing::debug!(
            remote = %remote_path,
            local = %local.display(),
            size = transferred,
            "File downloaded"
        );

        Ok(())
    }

    /// Change the remote working directory. `None` goes back to the server default.
    pub async fn chdir(&mut self, path: Option<&str>) -> SshResult<()> {
        let Some(path) = path else {
            self.cwd = None;
            return Ok(());
        };

        let target = self.resolve(path);
        let session = self.session()?;

        let metadata = session
            .metadata(target.as_str())
            .await
            .map_err(|e| SshError::Transfer(format!("Failed to stat {}: {}", target, e)))?;
        if !metadata.is_dir() {
            return Err(SshError::Transfer(format!("{} is not a directory", target)));
        }

        let canonical = session
            .canonicalize(target.as_str())
            .await
            .map_err(|e| SshError::Transfer(format!("Failed to resolve {}: {}", target, e)))?;

        self.cwd = Some(canonical);
        Ok(())
    }

    /// Current remote directory, if one was set with [`SftpClient::chdir`]
    pub fn getcwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    /// List directory contents (the current directory when `path` is `None`)
    pub async fn listdir(&self, path: Option<&str>) -> SshResult<Vec<String>> {
        let target = self.resolve(path.unwrap_or("."));
        let session = self.session()?;

        let entries = session
            .read_dir(target.as_str())
            .await
            .map_err(|e| SshError::Transfer(format!("Failed to read directory: {}", e)))?;

        Ok(entries
            .into_iter()
            .map(|e| e.file_name())
            .filter(|name| name != "." && name != "..")
            .collect())
    }

    /// Create a remote directory
    pub async fn mkdir(&self, path: &str) -> SshResult<()> {
        let target = self.resolve(path);
        self.session()?
            .create_dir(target.as_str())
            .await
            .map_err(|e| SshError::Transfer(format!("Failed to create directory: {}", e)))
    }

    /// Remove a remote directory
    pub async fn rmdir(&self, path: &str) -> SshResult<()> {
        let target = self.resolve(path);
        self.session()?
            .remove_dir(target.as_str())
            .await
            .map_err(|e| SshError::Transfer(format!("Failed to remove directory: {}", e)))
    }

    /// Remove a remote file
    pub async fn remove(&self, path: &str) -> SshResult<()> {
        let target = self.resolve(path);
        self.session()?
            .remove_file(target.as_str())
            .await
            .map_err(|e| SshError::Transfer(format!("Failed to remove file: {}", e)))
    }

    pub async fn rename(&self, from: &str, to: &str) -> SshResult<()> {
        let from = self.resolve(from);
        let to = self.resolve(to);
        self.session()?
            .rename(from.as_str(), to.as_str())
            .await
            .map_err(|e| SshError::Transfer(format!("Failed to rename {}: {}", from, e)))
    }

    /// Check if a remote path exists
    pub async fn exists(&self, path: &str) -> SshResult<bool> {
        let target = self.resolve(path);
        let session = self.session()?;

        match session.metadata(target.as_str()).await {
            Ok(_) => Ok(true),
            Err(e) if is_no_such_file(&e) => Ok(false),
            Err(e) => Err(SshError::Transfer(format!("Failed to stat {}: {}", target, e))),
        }
    }

    /// Get file size
    pub async fn file_size(&self, path: &str) -> SshResult<u64> {
        let target = self.resolve(path);
        let metadata = self
            .session()?
            .metadata(target.as_str())
            .await
            .map_err(|e| SshError::Transfer(format!("Failed to get metadata: {}", e)))?;

        Ok(metadata.size.unwrap_or(0))
    }

    /// Close the SFTP channel. Later calls fail with [`SshError::NotConnected`].
    pub async fn close(&mut self) -> SshResult<()> {
        if let Some(session) = self.session.take() {
            session
                .close()
                .await
                .map_err(|e| SshError::Transfer(format!("Failed to close SFTP session: {}", e)))?;
        }
        Ok(())
    }
}

fn is_no_such_file(err: &SftpProtocolError) -> bool {
    matches!(err, SftpProtocolError::Status(status) if status.status_code == StatusCode::NoSuchFile)
}

fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Remote name used by `put` when none is given: the local file's base name.
fn default_remote_name(local: &Path) -> SshResult<String> {
    local
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            SshError::Transfer(format!(
                "Cannot derive a remote file name from {}",
                local.display()
            ))
        })
}

/// Local path used by `get` when none is given: the remote file's base name.
fn default_local_name(remote: &str) -> SshResult<PathBuf> {
    match remote.rsplit('/').next() {
        Some(name) if !name.is_empty() && name != "." && name != ".." => Ok(PathBuf::from(name)),
        _ => Err(SshError::Transfer(format!(
            "Cannot derive a local file name from '{}'",
            remote
        ))),
    }
}
