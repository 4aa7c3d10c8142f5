//! Minimal SFTP subsystem serving a local directory as `/`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::future::Future;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use russh_sftp::protocol::{
    Attrs, Data, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};

const MAX_READ_SIZE: u32 = 64 * 1024;

enum OpenHandle {
    File(File),
    Dir(Option<Vec<(String, FileAttributes)>>),
}

pub struct TreeSftp {
    root: PathBuf,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
}

impl TreeSftp {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    fn insert(&mut self, handle: OpenHandle) -> String {
        self.next_handle += 1;
        let id = format!("h{}", self.next_handle);
        self.handles.insert(id.clone(), handle);
        id
    }

    fn local(&self, path: &str) -> PathBuf {
        self.root.join(client_path(path).trim_start_matches('/'))
    }
}

/// Normalize a client path to an absolute one; relative paths start at `/`.
fn client_path(path: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    format!("/{}", parts.join("/"))
}

fn status_of(err: std::io::Error) -> StatusCode {
    match err.kind() {
        std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn attrs_of(metadata: &fs::Metadata) -> FileAttributes {
    FileAttributes {
        size: Some(metadata.len()),
        uid: None,
        user: None,
        gid: None,
        group: None,
        permissions: Some(metadata.permissions().mode()),
        atime: None,
        mtime: None,
    }
}

fn ok(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: String::new(),
        language_tag: "en".to_string(),
    }
}

fn read_at(file: &mut File, offset: u64, len: u32) -> Result<Vec<u8>, StatusCode> {
    file.seek(SeekFrom::Start(offset)).map_err(status_of)?;
    let mut data = vec![0u8; len.min(MAX_READ_SIZE) as usize];
    let n = file.read(&mut data).map_err(status_of)?;
    if n == 0 {
        return Err(StatusCode::Eof);
    }
    data.truncate(n);
    Ok(data)
}

fn ready<T: Send>(
    result: Result<T, StatusCode>,
) -> impl Future<Output = Result<T, StatusCode>> + Send {
    async move { result }
}

impl russh_sftp::server::Handler for TreeSftp {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    fn init(
        &mut self,
        _version: u32,
        _extensions: HashMap<String, String>,
    ) -> impl Future<Output = Result<Version, Self::Error>> + Send {
        ready(Ok(Version::new()))
    }

    fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> impl Future<Output = Result<Handle, Self::Error>> + Send {
        let result = fs::OpenOptions::new()
            .read(pflags.contains(OpenFlags::READ))
            .write(pflags.contains(OpenFlags::WRITE))
            .create(pflags.contains(OpenFlags::CREATE))
            .truncate(pflags.contains(OpenFlags::TRUNCATE))
            .open(self.local(&filename))
            .map_err(status_of)
            .map(|file| Handle {
                id,
                handle: self.insert(OpenHandle::File(file)),
            });
        ready(result)
    }

    fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> impl Future<Output = Result<Data, Self::Error>> + Send {
        let result = match self.handles.get_mut(&handle) {
            Some(OpenHandle::File(file)) => {
                read_at(file, offset, len).map(|data| Data { id, data })
            }
            _ => Err(StatusCode::Failure),
        };
        ready(result)
    }

    fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        let result = match self.handles.get_mut(&handle) {
            Some(OpenHandle::File(file)) => file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| file.write_all(&data))
                .map(|_| ok(id))
                .map_err(status_of),
            _ => Err(StatusCode::Failure),
        };
        ready(result)
    }

    fn close(
        &mut self,
        id: u32,
        handle: String,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        let result = match self.handles.remove(&handle) {
            Some(_) => Ok(ok(id)),
            None => Err(StatusCode::Failure),
        };
        ready(result)
    }

    fn opendir(
        &mut self,
        id: u32,
        path: String,
    ) -> impl Future<Output = Result<Handle, Self::Error>> + Send {
        let result = fs::read_dir(self.local(&path))
            .map_err(status_of)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter_map(|entry| {
                        let metadata = entry.metadata().ok()?;
                        Some((
                            entry.file_name().to_string_lossy().into_owned(),
                            attrs_of(&metadata),
                        ))
                    })
                    .collect::<Vec<_>>()
            })
            .map(|entries| Handle {
                id,
                handle: self.insert(OpenHandle::Dir(Some(entries))),
            });
        ready(result)
    }

    fn readdir(
        &mut self,
        id: u32,
        handle: String,
    ) -> impl Future<Output = Result<Name, Self::Error>> + Send {
        let result = match self.handles.get_mut(&handle) {
            // Everything goes out in one batch; the next call reports EOF.
            Some(OpenHandle::Dir(pending)) => match pending.take() {
                Some(entries) => Ok(Name {
                    id,
                    files: entries
                        .into_iter()
                        .map(|(filename, attrs)| russh_sftp::protocol::File {
                            longname: filename.clone(),
                            filename,
                            attrs,
                        })
                        .collect(),
                }),
                None => Err(StatusCode::Eof),
            },
            _ => Err(StatusCode::Failure),
        };
        ready(result)
    }

    fn stat(
        &mut self,
        id: u32,
        path: String,
    ) -> impl Future<Output = Result<Attrs, Self::Error>> + Send {
        let result = fs::metadata(self.local(&path))
            .map(|metadata| Attrs {
                id,
                attrs: attrs_of(&metadata),
            })
            .map_err(status_of);
        ready(result)
    }

    fn lstat(
        &mut self,
        id: u32,
        path: String,
    ) -> impl Future<Output = Result<Attrs, Self::Error>> + Send {
        self.stat(id, path)
    }

    fn realpath(
        &mut self,
        id: u32,
        path: String,
    ) -> impl Future<Output = Result<Name, Self::Error>> + Send {
        let filename = client_path(&path);
        let attrs = fs::metadata(self.local(&filename))
            .map(|metadata| attrs_of(&metadata))
            .map_err(status_of);
        ready(attrs.map(|attrs| Name {
            id,
            files: vec![russh_sftp::protocol::File {
                filename,
                longname: String::new(),
                attrs,
            }],
        }))
    }

    fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        ready(fs::create_dir(self.local(&path)).map(|_| ok(id)).map_err(status_of))
    }

    fn rmdir(
        &mut self,
        id: u32,
        path: String,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        ready(fs::remove_dir(self.local(&path)).map(|_| ok(id)).map_err(status_of))
    }

    fn remove(
        &mut self,
        id: u32,
        filename: String,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        ready(fs::remove_file(self.local(&filename)).map(|_| ok(id)).map_err(status_of))
    }

    fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> impl Future<Output = Result<Status, Self::Error>> + Send {
        ready(
            fs::rename(self.local(&oldpath), self.local(&newpath))
                .map(|_| ok(id))
                .map_err(status_of),
        )
    }
}
