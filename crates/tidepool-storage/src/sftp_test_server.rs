//! In-process SFTP server over a duplex pipe, serving a local directory.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use bytes::Bytes;
use tidepool_io::StorageResult;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

use crate::sftp_proto::*;

enum Open {
    File(File),
    Dir(Option<Vec<(String, SftpAttrs)>>),
}

struct Server {
    root: PathBuf,
    extensions: bool,
    handles: HashMap<u32, Open>,
    next_handle: u32,
}

fn attrs_of(meta: &std::fs::Metadata) -> SftpAttrs {
    SftpAttrs {
        size: Some(meta.size()),
        uid_gid: Some((meta.uid(), meta.gid())),
        permissions: Some(meta.mode()),
        atime_mtime: Some((meta.atime() as u32, meta.mtime() as u32)),
    }
}

fn status_code(e: &std::io::Error) -> u32 {
    match e.kind() {
        std::io::ErrorKind::NotFound => SSH_FX_NO_SUCH_FILE,
        std::io::ErrorKind::PermissionDenied => SSH_FX_PERMISSION_DENIED,
        _ => SSH_FX_FAILURE,
    }
}

fn status(id: u32, code: u32, message: &str) -> Bytes {
    let mut packet = PacketBuilder::new(SSH_FXP_STATUS);
    packet.u32(id).u32(code).str(message).str("");
    packet.finish()
}

fn io_status(id: u32, result: std::io::Result<()>) -> Bytes {
    match result {
        Ok(()) => status(id, SSH_FX_OK, ""),
        Err(e) => status(id, status_code(&e), &e.to_string()),
    }
}

fn handle_id(handle: &[u8]) -> u32 {
    std::str::from_utf8(handle)
        .ok()
        .and_then(|h| h.parse().ok())
        .unwrap_or(u32::MAX)
}

impl Server {
    fn local(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn add_handle(&mut self, id: u32, open: Open) -> Bytes {
        self.next_handle += 1;
        self.handles.insert(self.next_handle, open);
        let mut packet = PacketBuilder::new(SSH_FXP_HANDLE);
        packet.u32(id).str(&self.next_handle.to_string());
        packet.finish()
    }

    fn set_attrs(&self, path: &Path, attrs: &SftpAttrs) -> std::io::Result<()> {
        if let Some(permissions) = attrs.permissions {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(permissions & 0o7777))?;
        }
        if let Some((_, mtime)) = attrs.atime_mtime {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_modified(UNIX_EPOCH + Duration::from_secs(u64::from(mtime)))?;
        }
        Ok(())
    }

    fn process(&mut self, kind: u8, mut packet: PacketReader) -> StorageResult<Bytes> {
        if kind == SSH_FXP_INIT {
            packet.u32()?;
            let mut reply = PacketBuilder::new(SSH_FXP_VERSION);
            reply.u32(SFTP_VERSION);
            if self.extensions {
                reply.str(EXT_POSIX_RENAME).str("1").str(EXT_FSYNC).str("1");
            }
            return Ok(reply.finish());
        }
        let id = packet.u32()?;
        Ok(match kind {
            SSH_FXP_OPEN => {
                let path = self.local(&packet.string()?);
                let flags = packet.u32()?;
                let attrs = packet.attrs()?;
                let opened = OpenOptions::new()
                    .read(flags & SSH_FXF_READ != 0)
                    .write(flags & SSH_FXF_WRITE != 0)
                    .create(flags & SSH_FXF_CREAT != 0)
                    .truncate(flags & SSH_FXF_TRUNC != 0)
                    .open(&path)
                    .and_then(|file| {
                        if flags & SSH_FXF_CREAT != 0 {
                            self.set_attrs(&path, &attrs)?;
                        }
                        Ok(file)
                    });
                match opened {
                    Ok(file) => self.add_handle(id, Open::File(file)),
                    Err(e) => status(id, status_code(&e), &e.to_string()),
                }
            }
            SSH_FXP_CLOSE => match self.handles.remove(&handle_id(&packet.bytes()?)) {
                Some(_) => status(id, SSH_FX_OK, ""),
                None => status(id, SSH_FX_FAILURE, "invalid handle"),
            },
            SSH_FXP_READ => {
                let handle = handle_id(&packet.bytes()?);
                let offset = packet.u64()?;
                let len = packet.u32()? as usize;
                let Some(Open::File(file)) = self.handles.get(&handle) else {
                    return Ok(status(id, SSH_FX_FAILURE, "invalid handle"));
                };
                let mut buf = vec![0u8; len];
                match file.read_at(&mut buf, offset) {
                    Ok(0) => status(id, SSH_FX_EOF, "eof"),
                    Ok(n) => {
                        let mut reply = PacketBuilder::new(SSH_FXP_DATA);
                        reply.u32(id).bytes(&buf[..n]);
                        reply.finish()
                    }
                    Err(e) => status(id, status_code(&e), &e.to_string()),
                }
            }
            SSH_FXP_WRITE => {
                let handle = handle_id(&packet.bytes()?);
                let offset = packet.u64()?;
                let data = packet.bytes()?;
                match self.handles.get(&handle) {
                    Some(Open::File(file)) => io_status(id, file.write_all_at(&data, offset)),
                    _ => status(id, SSH_FX_FAILURE, "invalid handle"),
                }
            }
            SSH_FXP_STAT | SSH_FXP_LSTAT => {
                let path = self.local(&packet.string()?);
                let meta = if kind == SSH_FXP_STAT {
                    std::fs::metadata(&path)
                } else {
                    std::fs::symlink_metadata(&path)
                };
                match meta {
                    Ok(meta) => {
                        let mut reply = PacketBuilder::new(SSH_FXP_ATTRS);
                        reply.u32(id).attrs(&attrs_of(&meta));
                        reply.finish()
                    }
                    Err(e) => status(id, status_code(&e), &e.to_string()),
                }
            }
            SSH_FXP_SETSTAT => {
                let path = self.local(&packet.string()?);
                let attrs = packet.attrs()?;
                io_status(id, self.set_attrs(&path, &attrs))
            }
            SSH_FXP_OPENDIR => {
                let path = self.local(&packet.string()?);
                let entries = std::fs::read_dir(&path).and_then(|dir| {
                    let mut entries = vec![(".".to_string(), SftpAttrs::default())];
                    for entry in dir {
                        let entry = entry?;
                        let meta = std::fs::symlink_metadata(entry.path())?;
                        entries.push((entry.file_name().to_string_lossy().into_owned(), attrs_of(&meta)));
                    }
                    Ok(entries)
                });
                match entries {
                    Ok(entries) => self.add_handle(id, Open::Dir(Some(entries))),
                    Err(e) => status(id, status_code(&e), &e.to_string()),
                }
            }
            SSH_FXP_READDIR => {
                let handle = handle_id(&packet.bytes()?);
                match self.handles.get_mut(&handle) {
                    Some(Open::Dir(entries)) => match entries.take() {
                        Some(entries) => {
                            let mut reply = PacketBuilder::new(SSH_FXP_NAME);
                            reply.u32(id).u32(entries.len() as u32);
                            for (name, attrs) in &entries {
                                reply.str(name).str(name).attrs(attrs);
                            }
                            reply.finish()
                        }
                        None => status(id, SSH_FX_EOF, "eof"),
                    },
                    _ => status(id, SSH_FX_FAILURE, "invalid handle"),
                }
            }
            SSH_FXP_REMOVE => {
                let path = self.local(&packet.string()?);
                io_status(id, std::fs::remove_file(path))
            }
            SSH_FXP_MKDIR => {
                let path = self.local(&packet.string()?);
                let attrs = packet.attrs()?;
                io_status(id, std::fs::create_dir(&path).and_then(|_| self.set_attrs(&path, &attrs)))
            }
            SSH_FXP_RMDIR => {
                let path = self.local(&packet.string()?);
                io_status(id, std::fs::remove_dir(path))
            }
            SSH_FXP_RENAME => {
                let source = self.local(&packet.string()?);
                let destination = self.local(&packet.string()?);
                if destination.exists() {
                    status(id, SSH_FX_FAILURE, "destination exists")
                } else {
                    io_status(id, std::fs::rename(source, destination))
                }
            }
            SSH_FXP_READLINK => {
                let path = self.local(&packet.string()?);
                match std::fs::read_link(path) {
                    Ok(target) => {
                        let target = target.to_string_lossy().into_owned();
                        let mut reply = PacketBuilder::new(SSH_FXP_NAME);
                        reply.u32(id).u32(1).str(&target).str(&target).attrs(&SftpAttrs::default());
                        reply.finish()
                    }
                    Err(e) => status(id, status_code(&e), &e.to_string()),
                }
            }
            SSH_FXP_EXTENDED if self.extensions => match packet.string()?.as_str() {
                EXT_POSIX_RENAME => {
                    let source = self.local(&packet.string()?);
                    let destination = self.local(&packet.string()?);
                    io_status(id, std::fs::rename(source, destination))
                }
                EXT_FSYNC => match self.handles.get(&handle_id(&packet.bytes()?)) {
                    Some(Open::File(file)) => io_status(id, file.sync_all()),
                    _ => status(id, SSH_FX_FAILURE, "invalid handle"),
                },
                _ => status(id, SSH_FX_OP_UNSUPPORTED, "unsupported extension"),
            },
            _ => status(id, SSH_FX_OP_UNSUPPORTED, "unsupported request"),
        })
    }
}

/// Client ends of a pipe whose server end serves `root`; `extensions` advertises
/// posix-rename and fsync.
pub(crate) fn spawn(root: PathBuf, extensions: bool) -> (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
    let (client, server_end) = tokio::io::duplex(256 * 1024);
    let (mut server_read, mut server_write) = tokio::io::split(server_end);
    let mut server = Server {
        root,
        extensions,
        handles: HashMap::new(),
        next_handle: 0,
    };
    tokio::spawn(async move {
        while let Ok((kind, packet)) = read_packet(&mut server_read).await {
            let Ok(reply) = server.process(kind, packet) else {
                break;
            };
            if write_packet(&mut server_write, reply).await.is_err() {
                break;
            }
        }
    });
    tokio::io::split(client)
}
