//! SFTP version 3 packets and a sequential client session.
//!
//! Every packet is `u32 length | u8 type | payload`. The session sends one request at a time and
//! waits for its reply, so request ids only guard against a confused peer.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tidepool_io::{StorageError, StorageResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

pub(crate) const SSH_FXP_INIT: u8 = 1;
pub(crate) const SSH_FXP_VERSION: u8 = 2;
pub(crate) const SSH_FXP_OPEN: u8 = 3;
pub(crate) const SSH_FXP_CLOSE: u8 = 4;
pub(crate) const SSH_FXP_READ: u8 = 5;
pub(crate) const SSH_FXP_WRITE: u8 = 6;
pub(crate) const SSH_FXP_LSTAT: u8 = 7;
pub(crate) const SSH_FXP_SETSTAT: u8 = 9;
pub(crate) const SSH_FXP_OPENDIR: u8 = 11;
pub(crate) const SSH_FXP_READDIR: u8 = 12;
pub(crate) const SSH_FXP_REMOVE: u8 = 13;
pub(crate) const SSH_FXP_MKDIR: u8 = 14;
pub(crate) const SSH_FXP_RMDIR: u8 = 15;
pub(crate) const SSH_FXP_STAT: u8 = 17;
pub(crate) const SSH_FXP_RENAME: u8 = 18;
pub(crate) const SSH_FXP_READLINK: u8 = 19;
pub(crate) const SSH_FXP_STATUS: u8 = 101;
pub(crate) const SSH_FXP_HANDLE: u8 = 102;
pub(crate) const SSH_FXP_DATA: u8 = 103;
pub(crate) const SSH_FXP_NAME: u8 = 104;
pub(crate) const SSH_FXP_ATTRS: u8 = 105;
pub(crate) const SSH_FXP_EXTENDED: u8 = 200;

pub(crate) const SSH_FX_OK: u32 = 0;
pub(crate) const SSH_FX_EOF: u32 = 1;
pub(crate) const SSH_FX_NO_SUCH_FILE: u32 = 2;
pub(crate) const SSH_FX_PERMISSION_DENIED: u32 = 3;
pub(crate) const SSH_FX_FAILURE: u32 = 4;
pub(crate) const SSH_FX_OP_UNSUPPORTED: u32 = 8;

pub(crate) const SSH_FXF_READ: u32 = 0x01;
pub(crate) const SSH_FXF_WRITE: u32 = 0x02;
pub(crate) const SSH_FXF_CREAT: u32 = 0x08;
pub(crate) const SSH_FXF_TRUNC: u32 = 0x10;

const ATTR_SIZE: u32 = 0x01;
const ATTR_UIDGID: u32 = 0x02;
const ATTR_PERMISSIONS: u32 = 0x04;
const ATTR_ACMODTIME: u32 = 0x08;
const ATTR_EXTENDED: u32 = 0x8000_0000;

pub(crate) const EXT_POSIX_RENAME: &str = "posix-rename@openssh.com";
pub(crate) const EXT_FSYNC: &str = "fsync@openssh.com";

pub(crate) const SFTP_VERSION: u32 = 3;

/// Largest packet accepted from the peer.
pub(crate) const SFTP_PACKET_MAX: usize = 256 * 1024;

/// Largest read or write issued per request.
pub const SFTP_IO_SIZE: usize = 32 * 1024;

/// File type bits of `permissions`.
pub(crate) const S_IFMT: u32 = 0o170_000;
pub(crate) const S_IFREG: u32 = 0o100_000;
pub(crate) const S_IFDIR: u32 = 0o040_000;
pub(crate) const S_IFLNK: u32 = 0o120_000;

/// File attributes; absent fields were not sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SftpAttrs {
    pub size: Option<u64>,
    pub uid_gid: Option<(u32, u32)>,
    pub permissions: Option<u32>,
    pub atime_mtime: Option<(u32, u32)>,
}

impl SftpAttrs {
    pub fn with_permissions(mode: u32) -> Self {
        Self {
            permissions: Some(mode),
            ..Self::default()
        }
    }

    pub fn file_type(&self) -> Option<u32> {
        self.permissions.map(|p| p & S_IFMT)
    }
}

/// Name entry returned by READDIR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SftpName {
    pub filename: String,
    pub attrs: SftpAttrs,
}

/// Packet under construction; the length prefix is filled in by [`PacketBuilder::finish`].
#[derive(Debug)]
pub(crate) struct PacketBuilder {
    buf: BytesMut,
}

impl PacketBuilder {
    pub fn new(kind: u8) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(0);
        buf.put_u8(kind);
        Self { buf }
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    pub fn str(&mut self, value: &str) -> &mut Self {
        self.bytes(value.as_bytes())
    }

    pub fn attrs(&mut self, attrs: &SftpAttrs) -> &mut Self {
        let mut flags = 0;
        if attrs.size.is_some() {
            flags |= ATTR_SIZE;
        }
        if attrs.uid_gid.is_some() {
            flags |= ATTR_UIDGID;
        }
        if attrs.permissions.is_some() {
            flags |= ATTR_PERMISSIONS;
        }
        if attrs.atime_mtime.is_some() {
            flags |= ATTR_ACMODTIME;
        }
        self.u32(flags);
        if let Some(size) = attrs.size {
            self.u64(size);
        }
        if let Some((uid, gid)) = attrs.uid_gid {
            self.u32(uid).u32(gid);
        }
        if let Some(permissions) = attrs.permissions {
            self.u32(permissions);
        }
        if let Some((atime, mtime)) = attrs.atime_mtime {
            self.u32(atime).u32(mtime);
        }
        self
    }

    pub fn finish(&mut self) -> Bytes {
        let len = (self.buf.len() - 4) as u32;
        self.buf[..4].copy_from_slice(&len.to_be_bytes());
        std::mem::take(&mut self.buf).freeze()
    }
}

/// Cursor over a received packet body.
#[derive(Debug)]
pub(crate) struct PacketReader {
    buf: Bytes,
}

fn truncated() -> StorageError {
    StorageError::Format("sftp packet is truncated".to_string())
}

impl PacketReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn u8(&mut self) -> StorageResult<u8> {
        if self.buf.remaining() < 1 {
            return Err(truncated());
        }
        Ok(self.buf.get_u8())
    }

    pub fn u32(&mut self) -> StorageResult<u32> {
        if self.buf.remaining() < 4 {
            return Err(truncated());
        }
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self) -> StorageResult<u64> {
        if self.buf.remaining() < 8 {
            return Err(truncated());
        }
        Ok(self.buf.get_u64())
    }

    pub fn bytes(&mut self) -> StorageResult<Bytes> {
        let len = self.u32()? as usize;
        if self.buf.remaining() < len {
            return Err(truncated());
        }
        Ok(self.buf.split_to(len))
    }

    pub fn string(&mut self) -> StorageResult<String> {
        Ok(String::from_utf8_lossy(&self.bytes()?).into_owned())
    }

    pub fn attrs(&mut self) -> StorageResult<SftpAttrs> {
        let flags = self.u32()?;
        let mut attrs = SftpAttrs::default();
        if flags & ATTR_SIZE != 0 {
            attrs.size = Some(self.u64()?);
        }
        if flags & ATTR_UIDGID != 0 {
            attrs.uid_gid = Some((self.u32()?, self.u32()?));
        }
        if flags & ATTR_PERMISSIONS != 0 {
            attrs.permissions = Some(self.u32()?);
        }
        if flags & ATTR_ACMODTIME != 0 {
            attrs.atime_mtime = Some((self.u32()?, self.u32()?));
        }
        if flags & ATTR_EXTENDED != 0 {
            for _ in 0..self.u32()? {
                self.bytes()?;
                self.bytes()?;
            }
        }
        Ok(attrs)
    }
}

/// Read one packet, returning its type and the rest of the body.
pub(crate) async fn read_packet<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> StorageResult<(u8, PacketReader)> {
    let len = reader.read_u32().await.map_err(|e| {
        StorageError::ReadFailed(format!("unable to read sftp packet: {}", e))
    })? as usize;
    if len == 0 || len > SFTP_PACKET_MAX {
        return Err(StorageError::Format(format!("invalid sftp packet length {}", len)));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        StorageError::ReadFailed(format!("unable to read sftp packet: {}", e))
    })?;
    let mut packet = PacketReader::new(Bytes::from(body));
    let kind = packet.u8()?;
    Ok((kind, packet))
}

pub(crate) async fn write_packet<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    packet: Bytes,
) -> StorageResult<()> {
    writer
        .write_all(&packet)
        .await
        .and(writer.flush().await)
        .map_err(|e| StorageError::WriteFailed(format!("unable to write sftp packet: {}", e)))
}

/// Status reply other than OK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SftpStatus {
    pub code: u32,
    pub message: String,
}

impl SftpStatus {
    /// Map onto the error taxonomy: no-such-file is a missing target, permission-denied is
    /// denied, anything else uses `fallback`.
    pub fn into_error(self, context: &str, fallback: fn(String) -> StorageError) -> StorageError {
        let message = format!("{}: [{}] {}", context, self.code, self.message);
        match self.code {
            SSH_FX_NO_SUCH_FILE => StorageError::MissingTarget(message),
            SSH_FX_PERMISSION_DENIED => StorageError::PermissionDenied(message),
            _ => fallback(message),
        }
    }
}

#[derive(Debug)]
enum Reply {
    Status(SftpStatus),
    Handle(Bytes),
    Data(Bytes),
    Name(Vec<SftpName>),
    Attrs(SftpAttrs),
}

/// Client end of one SFTP channel.
pub(crate) struct SftpSession {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    next_id: u32,
    timeout: Duration,
    extensions: Vec<String>,
    // keeps the ssh process alive for the session
    child: Option<tokio::process::Child>,
}

impl std::fmt::Debug for SftpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpSession")
            .field("next_id", &self.next_id)
            .field("extensions", &self.extensions)
            .field("child", &self.child.as_ref().and_then(|c| c.id()))
            .finish()
    }
}

impl SftpSession {
    /// Exchange INIT/VERSION over an established byte pipe.
    pub async fn start(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        timeout: Duration,
        child: Option<tokio::process::Child>,
    ) -> StorageResult<Self> {
        let mut session = Self {
            reader,
            writer,
            next_id: 1,
            timeout,
            extensions: Vec::new(),
            child,
        };
        let mut init = PacketBuilder::new(SSH_FXP_INIT);
        init.u32(SFTP_VERSION);
        write_packet(&mut session.writer, init.finish()).await?;

        let (kind, mut packet) = session.receive().await?;
        if kind != SSH_FXP_VERSION {
            return Err(StorageError::Protocol(format!(
                "expected sftp version packet but got type {}",
                kind
            )));
        }
        let version = packet.u32()?;
        if version < SFTP_VERSION {
            return Err(StorageError::Protocol(format!(
                "sftp server version {} is not supported",
                version
            )));
        }
        while packet.remaining() > 0 {
            let name = packet.string()?;
            packet.bytes()?;
            session.extensions.push(name);
        }
        debug!(version, extensions = ?session.extensions, "sftp session started");
        Ok(session)
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e == name)
    }

    async fn receive(&mut self) -> StorageResult<(u8, PacketReader)> {
        match tokio::time::timeout(self.timeout, read_packet(&mut self.reader)).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::ReadTimeout(format!(
                "timeout after {}ms waiting for sftp reply",
                self.timeout.as_millis()
            ))),
        }
    }

    fn request(&mut self, kind: u8) -> (u32, PacketBuilder) {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let mut packet = PacketBuilder::new(kind);
        packet.u32(id);
        (id, packet)
    }

    async fn exchange(&mut self, id: u32, mut packet: PacketBuilder) -> StorageResult<Reply> {
        write_packet(&mut self.writer, packet.finish()).await?;
        let (kind, mut reply) = self.receive().await?;
        let reply_id = reply.u32()?;
        if reply_id != id {
            return Err(StorageError::Protocol(format!(
                "sftp reply id {} does not match request id {}",
                reply_id, id
            )));
        }
        trace!(id, kind, "sftp reply");
        Ok(match kind {
            SSH_FXP_STATUS => {
                let code = reply.u32()?;
                let message = if reply.remaining() > 0 { reply.string()? } else { String::new() };
                Reply::Status(SftpStatus { code, message })
            }
            SSH_FXP_HANDLE => Reply::Handle(reply.bytes()?),
            SSH_FXP_DATA => Reply::Data(reply.bytes()?),
            SSH_FXP_ATTRS => Reply::Attrs(reply.attrs()?),
            SSH_FXP_NAME => {
                let count = reply.u32()?;
                let mut names = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let filename = reply.string()?;
                    reply.string()?;
                    let attrs = reply.attrs()?;
                    names.push(SftpName { filename, attrs });
                }
                Reply::Name(names)
            }
            _ => {
                return Err(StorageError::Protocol(format!(
                    "unexpected sftp reply type {}",
                    kind
                )))
            }
        })
    }

    fn unexpected(reply: &Reply, context: &str) -> StorageError {
        StorageError::Protocol(format!("{}: unexpected sftp reply {:?}", context, reply))
    }

    /// Expect an OK status.
    fn check(reply: Reply, context: &str, fallback: fn(String) -> StorageError) -> StorageResult<()> {
        match reply {
            Reply::Status(status) if status.code == SSH_FX_OK => Ok(()),
            Reply::Status(status) => Err(status.into_error(context, fallback)),
            other => Err(Self::unexpected(&other, context)),
        }
    }

    fn handle(reply: Reply, context: &str, fallback: fn(String) -> StorageError) -> StorageResult<Bytes> {
        match reply {
            Reply::Handle(handle) => Ok(handle),
            Reply::Status(status) => Err(status.into_error(context, fallback)),
            other => Err(Self::unexpected(&other, context)),
        }
    }

    pub async fn open(&mut self, path: &str, flags: u32, attrs: &SftpAttrs) -> StorageResult<Bytes> {
        let (id, mut packet) = self.request(SSH_FXP_OPEN);
        packet.str(path).u32(flags).attrs(attrs);
        let reply = self.exchange(id, packet).await?;
        Self::handle(reply, &format!("unable to open file '{}'", path), StorageError::OpenFailed)
    }

    pub async fn opendir(&mut self, path: &str) -> StorageResult<Bytes> {
        let (id, mut packet) = self.request(SSH_FXP_OPENDIR);
        packet.str(path);
        let reply = self.exchange(id, packet).await?;
        Self::handle(reply, &format!("unable to open path '{}'", path), StorageError::OpenFailed)
    }

    pub async fn close(&mut self, handle: &[u8]) -> StorageResult<()> {
        let (id, mut packet) = self.request(SSH_FXP_CLOSE);
        packet.bytes(handle);
        let reply = self.exchange(id, packet).await?;
        Self::check(reply, "unable to close sftp handle", StorageError::CloseFailed)
    }

    /// Up to `len` bytes at `offset`; None at end of file.
    pub async fn read(&mut self, handle: &[u8], offset: u64, len: u32) -> StorageResult<Option<Bytes>> {
        let (id, mut packet) = self.request(SSH_FXP_READ);
        packet.bytes(handle).u64(offset).u32(len);
        match self.exchange(id, packet).await? {
            Reply::Data(data) => Ok(Some(data)),
            Reply::Status(status) if status.code == SSH_FX_EOF => Ok(None),
            Reply::Status(status) => Err(status.into_error("unable to read", StorageError::ReadFailed)),
            other => Err(Self::unexpected(&other, "unable to read")),
        }
    }

    pub async fn write(&mut self, handle: &[u8], offset: u64, data: &[u8]) -> StorageResult<()> {
        let (id, mut packet) = self.request(SSH_FXP_WRITE);
        packet.bytes(handle).u64(offset).bytes(data);
        let reply = self.exchange(id, packet).await?;
        Self::check(reply, "unable to write", StorageError::WriteFailed)
    }

    /// Attributes of `path`; None when it does not exist.
    pub async fn stat(&mut self, path: &str, follow_link: bool) -> StorageResult<Option<SftpAttrs>> {
        let kind = if follow_link { SSH_FXP_STAT } else { SSH_FXP_LSTAT };
        let (id, mut packet) = self.request(kind);
        packet.str(path);
        match self.exchange(id, packet).await? {
            Reply::Attrs(attrs) => Ok(Some(attrs)),
            Reply::Status(status) if status.code == SSH_FX_NO_SUCH_FILE => Ok(None),
            Reply::Status(status) => Err(status.into_error(
                &format!("unable to get info for path/file '{}'", path),
                StorageError::InfoFailed,
            )),
            other => Err(Self::unexpected(&other, "stat")),
        }
    }

    /// Next batch of entries; None when the listing is complete.
    pub async fn readdir(&mut self, handle: &[u8]) -> StorageResult<Option<Vec<SftpName>>> {
        let (id, mut packet) = self.request(SSH_FXP_READDIR);
        packet.bytes(handle);
        match self.exchange(id, packet).await? {
            Reply::Name(names) => Ok(Some(names)),
            Reply::Status(status) if status.code == SSH_FX_EOF => Ok(None),
            Reply::Status(status) => Err(status.into_error("unable to read path", StorageError::ReadFailed)),
            other => Err(Self::unexpected(&other, "readdir")),
        }
    }

    pub async fn readlink(&mut self, path: &str) -> StorageResult<String> {
        let (id, mut packet) = self.request(SSH_FXP_READLINK);
        packet.str(path);
        let context = format!("unable to read link '{}'", path);
        match self.exchange(id, packet).await? {
            Reply::Name(names) => names
                .into_iter()
                .next()
                .map(|n| n.filename)
                .ok_or_else(|| StorageError::Format(format!("{}: empty reply", context))),
            Reply::Status(status) => Err(status.into_error(&context, StorageError::InfoFailed)),
            other => Err(Self::unexpected(&other, &context)),
        }
    }

    pub async fn mkdir(&mut self, path: &str, mode: u32) -> StorageResult<()> {
        let (id, mut packet) = self.request(SSH_FXP_MKDIR);
        packet.str(path).attrs(&SftpAttrs::with_permissions(mode));
        let reply = self.exchange(id, packet).await?;
        Self::check(reply, &format!("unable to create path '{}'", path), StorageError::PathCreateFailed)
    }

    pub async fn rmdir(&mut self, path: &str) -> StorageResult<()> {
        let (id, mut packet) = self.request(SSH_FXP_RMDIR);
        packet.str(path);
        let reply = self.exchange(id, packet).await?;
        Self::check(reply, &format!("unable to remove path '{}'", path), StorageError::RemoveFailed)
    }

    pub async fn remove(&mut self, path: &str) -> StorageResult<()> {
        let (id, mut packet) = self.request(SSH_FXP_REMOVE);
        packet.str(path);
        let reply = self.exchange(id, packet).await?;
        Self::check(reply, &format!("unable to remove file '{}'", path), StorageError::RemoveFailed)
    }

    pub async fn setstat(&mut self, path: &str, attrs: &SftpAttrs) -> StorageResult<()> {
        let (id, mut packet) = self.request(SSH_FXP_SETSTAT);
        packet.str(path).attrs(attrs);
        let reply = self.exchange(id, packet).await?;
        Self::check(reply, &format!("unable to set attributes of '{}'", path), StorageError::WriteFailed)
    }

    /// Rename, replacing an existing destination when the server offers posix-rename.
    pub async fn rename(&mut self, source: &str, destination: &str) -> StorageResult<()> {
        let context = format!("unable to move '{}' to '{}'", source, destination);
        if self.has_extension(EXT_POSIX_RENAME) {
            let (id, mut packet) = self.request(SSH_FXP_EXTENDED);
            packet.str(EXT_POSIX_RENAME).str(source).str(destination);
            let reply = self.exchange(id, packet).await?;
            return Self::check(reply, &context, StorageError::MoveFailed);
        }
        // plain v3 rename refuses to overwrite
        if let Some(attrs) = self.stat(destination, false).await? {
            if attrs.file_type() != Some(S_IFDIR) {
                self.remove(destination).await?;
            }
        }
        let (id, mut packet) = self.request(SSH_FXP_RENAME);
        packet.str(source).str(destination);
        let reply = self.exchange(id, packet).await?;
        Self::check(reply, &context, StorageError::MoveFailed)
    }

    /// Flush an open file when the server offers fsync; otherwise nothing happens.
    pub async fn fsync(&mut self, handle: &[u8]) -> StorageResult<()> {
        if !self.has_extension(EXT_FSYNC) {
            return Ok(());
        }
        let (id, mut packet) = self.request(SSH_FXP_EXTENDED);
        packet.str(EXT_FSYNC).bytes(handle);
        match self.exchange(id, packet).await? {
            Reply::Status(status) if status.code == SSH_FX_OP_UNSUPPORTED => Ok(()),
            reply => Self::check(reply, "unable to sync file", StorageError::SyncFailed),
        }
    }
}
