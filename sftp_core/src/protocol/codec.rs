use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::packet_type::*;
use super::{
    ClientPacket, DirEntry, FileAttrs, OpenFlags, Request, Response, ServerVersion, StatusCode,
    CHECK_FILE_HANDLE, MAX_PACKET_LEN,
};
use crate::connections::errors::SftpError;

const ATTR_SIZE: u32 = 0x0000_0001;
const ATTR_UIDGID: u32 = 0x0000_0002;
const ATTR_PERMISSIONS: u32 = 0x0000_0004;
const ATTR_ACMODTIME: u32 = 0x0000_0008;
const ATTR_EXTENDED: u32 = 0x8000_0000;

const CHECK_FILE_REPLY: &str = "check-file";

fn malformed(what: &str) -> SftpError {
    SftpError::Protocol(format!("malformed packet: {what}"))
}

/// Bounds-checked cursor over a packet body.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, what: &str) -> Result<(), SftpError> {
        if self.buf.remaining() < n {
            return Err(malformed(what));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, SftpError> {
        self.need(1, "truncated byte")?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32, SftpError> {
        self.need(4, "truncated uint32")?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64, SftpError> {
        self.need(8, "truncated uint64")?;
        Ok(self.buf.get_u64())
    }

    fn bytes(&mut self) -> Result<Bytes, SftpError> {
        let len = self.u32()? as usize;
        self.need(len, "string longer than packet")?;
        let out = Bytes::copy_from_slice(&self.buf[..len]);
        self.buf.advance(len);
        Ok(out)
    }

    /// Filenames and messages are raw bytes on the wire; invalid UTF-8 is
    /// replaced rather than rejected.
    fn string(&mut self) -> Result<String, SftpError> {
        let raw = self.bytes()?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn rest(&mut self) -> Bytes {
        let out = Bytes::copy_from_slice(self.buf);
        self.buf.advance(self.buf.len());
        out
    }

    fn attrs(&mut self) -> Result<FileAttrs, SftpError> {
        let flags = self.u32()?;
        let mut attrs = FileAttrs::default();
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
            let count = self.u32()?;
            for _ in 0..count {
                self.bytes()?;
                self.bytes()?;
            }
        }
        Ok(attrs)
    }
}

fn put_string(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn put_attrs(buf: &mut BytesMut, attrs: &FileAttrs) {
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
    buf.put_u32(flags);
    if let Some(size) = attrs.size {
        buf.put_u64(size);
    }
    if let Some((uid, gid)) = attrs.uid_gid {
        buf.put_u32(uid);
        buf.put_u32(gid);
    }
    if let Some(mode) = attrs.permissions {
        buf.put_u32(mode);
    }
    if let Some((atime, mtime)) = attrs.atime_mtime {
        buf.put_u32(atime);
        buf.put_u32(mtime);
    }
}

pub fn encode_init(version: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(INIT);
    buf.put_u32(version);
    buf.freeze()
}

pub fn encode_version(version: u32, extensions: &[(&str, &str)]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(VERSION);
    buf.put_u32(version);
    for (name, data) in extensions {
        put_string(&mut buf, name.as_bytes());
        put_string(&mut buf, data.as_bytes());
    }
    buf.freeze()
}

pub fn decode_version(body: &[u8]) -> Result<ServerVersion, SftpError> {
    let mut r = Reader::new(body);
    let kind = r.u8()?;
    if kind != VERSION {
        return Err(SftpError::Protocol(format!(
            "expected VERSION packet, got type {kind}"
        )));
    }
    let version = r.u32()?;
    let mut extensions = Vec::new();
    while !r.buf.is_empty() {
        extensions.push((r.string()?, r.string()?));
    }
    Ok(ServerVersion {
        version,
        extensions,
    })
}

pub fn encode_request(id: u32, request: &Request) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    match request {
        Request::Open { path, flags, attrs } => {
            buf.put_u8(OPEN);
            buf.put_u32(id);
            put_string(&mut buf, path.as_bytes());
            buf.put_u32(flags.bits());
            put_attrs(&mut buf, attrs);
        }
        Request::Close { handle } => {
            buf.put_u8(CLOSE);
            buf.put_u32(id);
            put_string(&mut buf, handle);
        }
        Request::Read {
            handle,
            offset,
            len,
        } => {
            buf.put_u8(READ);
            buf.put_u32(id);
            put_string(&mut buf, handle);
            buf.put_u64(*offset);
            buf.put_u32(*len);
        }
        Request::Write {
            handle,
            offset,
            data,
        } => {
            buf.reserve(data.len() + handle.len() + 21);
            buf.put_u8(WRITE);
            buf.put_u32(id);
            put_string(&mut buf, handle);
            buf.put_u64(*offset);
            put_string(&mut buf, data);
        }
        Request::Fstat { handle } => {
            buf.put_u8(FSTAT);
            buf.put_u32(id);
            put_string(&mut buf, handle);
        }
        Request::Readdir { handle } => {
            buf.put_u8(READDIR);
            buf.put_u32(id);
            put_string(&mut buf, handle);
        }
        Request::Stat { path }
        | Request::Opendir { path }
        | Request::Remove { path }
        | Request::Rmdir { path }
        | Request::Realpath { path } => {
            let kind = match request {
                Request::Stat { .. } => STAT,
                Request::Opendir { .. } => OPENDIR,
                Request::Remove { .. } => REMOVE,
                Request::Rmdir { .. } => RMDIR,
                _ => REALPATH,
            };
            buf.put_u8(kind);
            buf.put_u32(id);
            put_string(&mut buf, path.as_bytes());
        }
        Request::Mkdir { path, attrs } => {
            buf.put_u8(MKDIR);
            buf.put_u32(id);
            put_string(&mut buf, path.as_bytes());
            put_attrs(&mut buf, attrs);
        }
        Request::CheckFile {
            handle,
            algorithms,
            offset,
            length,
            block_size,
        } => {
            buf.put_u8(EXTENDED);
            buf.put_u32(id);
            put_string(&mut buf, CHECK_FILE_HANDLE.as_bytes());
            put_string(&mut buf, handle);
            put_string(&mut buf, algorithms.as_bytes());
            buf.put_u64(*offset);
            buf.put_u64(*length);
            buf.put_u32(*block_size);
        }
    }
    buf.freeze()
}

pub fn decode_client_packet(body: &[u8]) -> Result<ClientPacket, SftpError> {
    let mut r = Reader::new(body);
    let kind = r.u8()?;
    if kind == INIT {
        return Ok(ClientPacket::Init { version: r.u32()? });
    }
    let id = r.u32()?;
    let request = match kind {
        OPEN => Request::Open {
            path: r.string()?,
            flags: OpenFlags::from_bits(r.u32()?),
            attrs: r.attrs()?,
        },
        CLOSE => Request::Close { handle: r.bytes()? },
        READ => Request::Read {
            handle: r.bytes()?,
            offset: r.u64()?,
            len: r.u32()?,
        },
        WRITE => Request::Write {
            handle: r.bytes()?,
            offset: r.u64()?,
            data: r.bytes()?,
        },
        FSTAT => Request::Fstat { handle: r.bytes()? },
        READDIR => Request::Readdir { handle: r.bytes()? },
        STAT => Request::Stat { path: r.string()? },
        OPENDIR => Request::Opendir { path: r.string()? },
        REMOVE => Request::Remove { path: r.string()? },
        RMDIR => Request::Rmdir { path: r.string()? },
        REALPATH => Request::Realpath { path: r.string()? },
        MKDIR => Request::Mkdir {
            path: r.string()?,
            attrs: r.attrs()?,
        },
        EXTENDED => {
            let name = r.string()?;
            if name != CHECK_FILE_HANDLE {
                return Err(SftpError::Protocol(format!(
                    "unsupported extended request '{name}'"
                )));
            }
            Request::CheckFile {
                handle: r.bytes()?,
                algorithms: r.string()?,
                offset: r.u64()?,
                length: r.u64()?,
                block_size: r.u32()?,
            }
        }
        other => {
            return Err(SftpError::Protocol(format!(
                "unknown request type {other}"
            )))
        }
    };
    Ok(ClientPacket::Request { id, request })
}

pub fn encode_response(id: u32, response: &Response) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    match response {
        Response::Status { code, message } => {
            buf.put_u8(STATUS);
            buf.put_u32(id);
            buf.put_u32(code.as_u32());
            put_string(&mut buf, message.as_bytes());
            put_string(&mut buf, b"en");
        }
        Response::Handle(handle) => {
            buf.put_u8(HANDLE);
            buf.put_u32(id);
            put_string(&mut buf, handle);
        }
        Response::Data(data) => {
            buf.reserve(data.len() + 9);
            buf.put_u8(DATA);
            buf.put_u32(id);
            put_string(&mut buf, data);
        }
        Response::Name(entries) => {
            buf.put_u8(NAME);
            buf.put_u32(id);
            buf.put_u32(entries.len() as u32);
            for entry in entries {
                put_string(&mut buf, entry.name.as_bytes());
                put_string(&mut buf, entry.long_name.as_bytes());
                put_attrs(&mut buf, &entry.attrs);
            }
        }
        Response::Attrs(attrs) => {
            buf.put_u8(ATTRS);
            buf.put_u32(id);
            put_attrs(&mut buf, attrs);
        }
        Response::ExtendedReply(data) => {
            buf.put_u8(EXTENDED_REPLY);
            buf.put_u32(id);
            buf.put_slice(data);
        }
    }
    buf.freeze()
}

/// Decode a server reply into its request id and body.
pub fn decode_response(body: &[u8]) -> Result<(u32, Response), SftpError> {
    let mut r = Reader::new(body);
    let kind = r.u8()?;
    let id = r.u32()?;
    let response = match kind {
        STATUS => {
            let code = StatusCode::from_u32(r.u32()?);
            // Some servers omit message and language tag.
            let message = if r.buf.is_empty() {
                String::new()
            } else {
                r.string()?
            };
            Response::Status { code, message }
        }
        HANDLE => Response::Handle(r.bytes()?),
        DATA => Response::Data(r.bytes()?),
        NAME => {
            let count = r.u32()?;
            let mut entries = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                entries.push(DirEntry {
                    name: r.string()?,
                    long_name: r.string()?,
                    attrs: r.attrs()?,
                });
            }
            Response::Name(entries)
        }
        ATTRS => Response::Attrs(r.attrs()?),
        EXTENDED_REPLY => Response::ExtendedReply(r.rest()),
        other => {
            return Err(SftpError::Protocol(format!(
                "unexpected reply type {other} for request {id}"
            )))
        }
    };
    Ok((id, response))
}

pub fn encode_check_file_reply(algorithm: &str, hash: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    put_string(&mut buf, CHECK_FILE_REPLY.as_bytes());
    put_string(&mut buf, algorithm.as_bytes());
    buf.put_slice(hash);
    buf.freeze()
}

/// Split a `check-file` reply into the algorithm used and the raw hash.
pub fn decode_check_file_reply(data: &[u8]) -> Result<(String, Bytes), SftpError> {
    let mut r = Reader::new(data);
    let tag = r.string()?;
    if tag != CHECK_FILE_REPLY {
        return Err(SftpError::Protocol(format!(
            "unexpected extended reply '{tag}'"
        )));
    }
    let algorithm = r.string()?;
    Ok((algorithm, r.rest()))
}

/// Prefix a packet body with its length.
pub fn frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 4);
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

/// Reassembles length-prefixed packets from an arbitrary byte stream.
#[derive(Debug, Default)]
pub struct PacketAssembler {
    buf: BytesMut,
}

impl PacketAssembler {
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete packet body, if one has fully arrived.
    pub fn next_packet(&mut self) -> Result<Option<Bytes>, SftpError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len == 0 || len > MAX_PACKET_LEN {
            return Err(SftpError::Protocol(format!("invalid packet length {len}")));
        }
        if self.buf.len() < len + 4 {
            return Ok(None);
        }
        self.buf.advance(4);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}
