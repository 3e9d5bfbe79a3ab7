//! SFTP version 3 packet model.
//!
//! Every packet on the wire is `uint32 length | byte type | payload`. The
//! types here describe the payloads. [`codec`] turns them into bytes and
//! back, in both directions, so the same code serves the client and any
//! in-process test server.

pub mod codec;

use bytes::Bytes;
use serde::Serialize;

use crate::connections::errors::SftpError;

pub use codec::{
    decode_check_file_reply, decode_client_packet, decode_response, decode_version,
    encode_check_file_reply, encode_init, encode_request, encode_response, encode_version, frame,
    PacketAssembler,
};

pub const SFTP_VERSION: u32 = 3;

/// Upper bound for a single packet (length prefix excluded).
pub const MAX_PACKET_LEN: usize = 4 * 1024 * 1024;

/// Extension used to obtain a digest of an open remote file.
pub const CHECK_FILE_HANDLE: &str = "check-file-handle";

pub(crate) mod packet_type {
    pub const INIT: u8 = 1;
    pub const VERSION: u8 = 2;
    pub const OPEN: u8 = 3;
    pub const CLOSE: u8 = 4;
    pub const READ: u8 = 5;
    pub const WRITE: u8 = 6;
    pub const FSTAT: u8 = 8;
    pub const OPENDIR: u8 = 11;
    pub const READDIR: u8 = 12;
    pub const REMOVE: u8 = 13;
    pub const MKDIR: u8 = 14;
    pub const RMDIR: u8 = 15;
    pub const REALPATH: u8 = 16;
    pub const STAT: u8 = 17;
    pub const STATUS: u8 = 101;
    pub const HANDLE: u8 = 102;
    pub const DATA: u8 = 103;
    pub const NAME: u8 = 104;
    pub const ATTRS: u8 = 105;
    pub const EXTENDED: u8 = 200;
    pub const EXTENDED_REPLY: u8 = 201;
}

/// Status codes carried by `SSH_FXP_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusCode {
    Ok,
    Eof,
    NoSuchFile,
    PermissionDenied,
    Failure,
    BadMessage,
    NoConnection,
    ConnectionLost,
    OpUnsupported,
    Unknown(u32),
}

impl StatusCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0 => StatusCode::Ok,
            1 => StatusCode::Eof,
            2 => StatusCode::NoSuchFile,
            3 => StatusCode::PermissionDenied,
            4 => StatusCode::Failure,
            5 => StatusCode::BadMessage,
            6 => StatusCode::NoConnection,
            7 => StatusCode::ConnectionLost,
            8 => StatusCode::OpUnsupported,
            other => StatusCode::Unknown(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Eof => 1,
            StatusCode::NoSuchFile => 2,
            StatusCode::PermissionDenied => 3,
            StatusCode::Failure => 4,
            StatusCode::BadMessage => 5,
            StatusCode::NoConnection => 6,
            StatusCode::ConnectionLost => 7,
            StatusCode::OpUnsupported => 8,
            StatusCode::Unknown(other) => other,
        }
    }
}

/// `pflags` of an OPEN request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags(0x01);
    pub const WRITE: OpenFlags = OpenFlags(0x02);
    pub const APPEND: OpenFlags = OpenFlags(0x04);
    pub const CREATE: OpenFlags = OpenFlags(0x08);
    pub const TRUNCATE: OpenFlags = OpenFlags(0x10);
    pub const EXCLUSIVE: OpenFlags = OpenFlags(0x20);

    pub fn from_bits(bits: u32) -> Self {
        OpenFlags(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// File attributes (`ATTRS`). Extended attribute pairs are parsed and dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileAttrs {
    pub size: Option<u64>,
    pub uid_gid: Option<(u32, u32)>,
    pub permissions: Option<u32>,
    pub atime_mtime: Option<(u32, u32)>,
}

impl FileAttrs {
    pub fn with_size(size: u64) -> Self {
        FileAttrs {
            size: Some(size),
            ..FileAttrs::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.permissions
            .map(|mode| mode & 0o170000 == 0o040000)
            .unwrap_or(false)
    }

    pub fn mtime(&self) -> Option<u32> {
        self.atime_mtime.map(|(_, mtime)| mtime)
    }
}

/// One entry of a NAME reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub long_name: String,
    pub attrs: FileAttrs,
}

/// Client requests understood by the codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Open {
        path: String,
        flags: OpenFlags,
        attrs: FileAttrs,
    },
    Close {
        handle: Bytes,
    },
    Read {
        handle: Bytes,
        offset: u64,
        len: u32,
    },
    Write {
        handle: Bytes,
        offset: u64,
        data: Bytes,
    },
    Fstat {
        handle: Bytes,
    },
    Stat {
        path: String,
    },
    Opendir {
        path: String,
    },
    Readdir {
        handle: Bytes,
    },
    Remove {
        path: String,
    },
    Mkdir {
        path: String,
        attrs: FileAttrs,
    },
    Rmdir {
        path: String,
    },
    Realpath {
        path: String,
    },
    /// `check-file-handle` extension. A `length` of 0 means "to end of file".
    CheckFile {
        handle: Bytes,
        algorithms: String,
        offset: u64,
        length: u64,
        block_size: u32,
    },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Open { .. } => "open",
            Request::Close { .. } => "close",
            Request::Read { .. } => "read",
            Request::Write { .. } => "write",
            Request::Fstat { .. } => "fstat",
            Request::Stat { .. } => "stat",
            Request::Opendir { .. } => "opendir",
            Request::Readdir { .. } => "readdir",
            Request::Remove { .. } => "remove",
            Request::Mkdir { .. } => "mkdir",
            Request::Rmdir { .. } => "rmdir",
            Request::Realpath { .. } => "realpath",
            Request::CheckFile { .. } => "check-file-handle",
        }
    }
}

/// Server replies.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Status { code: StatusCode, message: String },
    Handle(Bytes),
    Data(Bytes),
    Name(Vec<DirEntry>),
    Attrs(FileAttrs),
    ExtendedReply(Bytes),
}

impl Response {
    pub fn ok() -> Self {
        Response::Status {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    pub fn status(code: StatusCode, message: impl Into<String>) -> Self {
        Response::Status {
            code,
            message: message.into(),
        }
    }

    /// Turn a non-OK status into an error and leave everything else alone.
    pub fn check(self) -> Result<Response, SftpError> {
        match self {
            Response::Status { code, message } if code != StatusCode::Ok => {
                Err(SftpError::Status { code, message })
            }
            other => Ok(other),
        }
    }

    pub fn into_ok(self) -> Result<(), SftpError> {
        match self.check()? {
            Response::Status { .. } => Ok(()),
            other => Err(unexpected("status", &other)),
        }
    }

    pub fn into_handle(self) -> Result<Bytes, SftpError> {
        match self.check()? {
            Response::Handle(handle) => Ok(handle),
            other => Err(unexpected("handle", &other)),
        }
    }

    pub fn into_attrs(self) -> Result<FileAttrs, SftpError> {
        match self.check()? {
            Response::Attrs(attrs) => Ok(attrs),
            other => Err(unexpected("attrs", &other)),
        }
    }

    pub fn into_names(self) -> Result<Vec<DirEntry>, SftpError> {
        match self.check()? {
            Response::Name(entries) => Ok(entries),
            other => Err(unexpected("name", &other)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Response::Status { .. } => "status",
            Response::Handle(_) => "handle",
            Response::Data(_) => "data",
            Response::Name(_) => "name",
            Response::Attrs(_) => "attrs",
            Response::ExtendedReply(_) => "extended-reply",
        }
    }
}

fn unexpected(expected: &str, got: &Response) -> SftpError {
    SftpError::Protocol(format!("expected {} reply, got {}", expected, got.kind()))
}

/// Packets a client sends, as seen by a server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientPacket {
    Init { version: u32 },
    Request { id: u32, request: Request },
}

/// Reply to INIT.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerVersion {
    pub version: u32,
    pub extensions: Vec<(String, String)>,
}

impl ServerVersion {
    pub fn supports(&self, extension: &str) -> bool {
        self.extensions.iter().any(|(name, _)| name == extension)
    }
}
