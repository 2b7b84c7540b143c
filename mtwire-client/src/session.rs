//! Session persistence: auth key, salt, time offset and last endpoint.

use std::io;
use std::path::Path;

use mtwire_crypto::AuthKey;
use zeroize::Zeroizing;

/// Leading bytes of every persisted record.
const MAGIC: [u8; 4] = *b"MTWS";

/// Current record layout.
pub const FORMAT_VERSION: u8 = 1;

/// The state that survives a restart.
///
/// Binary layout (little-endian):
///
/// | Bytes | Field                               |
/// |-------|-------------------------------------|
/// | 4     | magic `MTWS`                        |
/// | 1     | format version                      |
/// | 256   | auth key                            |
/// | 8     | key id (checked against the key)    |
/// | 8     | server salt                         |
/// | 4     | time offset                         |
/// | 2 + n | last endpoint (`u16` length + UTF-8)|
#[derive(Clone, PartialEq)]
pub struct PersistedSession {
    /// The 256-byte authorization key, wiped when the record is dropped.
    pub auth_key:    Zeroizing<[u8; 256]>,
    /// Salt in use when the record was written.
    pub salt:        i64,
    /// Server clock minus local clock, in seconds.
    pub time_offset: i32,
    /// Endpoint of the last authenticated connection.
    pub endpoint:    Option<String>,
}

impl std::fmt::Debug for PersistedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedSession")
            .field("key_id", &self.key_id())
            .field("salt", &self.salt)
            .field("time_offset", &self.time_offset)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl PersistedSession {
    /// Key id of [`Self::auth_key`].
    pub fn key_id(&self) -> i64 {
        AuthKey::from_bytes(*self.auth_key).id()
    }

    /// Serialize to the versioned binary record.
    pub fn to_bytes(&self) -> Vec<u8> {
        let endpoint = self.endpoint.as_deref().unwrap_or("").as_bytes();
        let endpoint = &endpoint[..endpoint.len().min(u16::MAX as usize)];

        let mut b = Vec::with_capacity(4 + 1 + 256 + 8 + 8 + 4 + 2 + endpoint.len());
        b.extend_from_slice(&MAGIC);
        b.push(FORMAT_VERSION);
        b.extend_from_slice(self.auth_key.as_slice());
        b.extend_from_slice(&self.key_id().to_le_bytes());
        b.extend_from_slice(&self.salt.to_le_bytes());
        b.extend_from_slice(&self.time_offset.to_le_bytes());
        b.extend_from_slice(&(endpoint.len() as u16).to_le_bytes());
        b.extend_from_slice(endpoint);
        b
    }

    /// Parse a record written by [`Self::to_bytes`].
    ///
    /// Truncated records, unknown versions and a key id that does not match
    /// the stored key all fail with [`io::ErrorKind::InvalidData`].
    pub fn from_bytes(buf: &[u8]) -> io::Result<Self> {
        let mut p = 0usize;
        macro_rules! r {
            ($n:expr) => {{
                if p + $n > buf.len() {
                    return Err(invalid("truncated session"));
                }
                let s = &buf[p..p + $n];
                p += $n;
                s
            }};
        }
        macro_rules! arr {
            ($n:expr) => {{
                let mut a = [0u8; $n];
                a.copy_from_slice(r!($n));
                a
            }};
        }

        if r!(4) != MAGIC {
            return Err(invalid("not a session file"));
        }
        let version = r!(1)[0];
        if version != FORMAT_VERSION {
            return Err(invalid(format!("unsupported session version {version}")));
        }
        let auth_key    = Zeroizing::new(arr!(256));
        let key_id      = i64::from_le_bytes(arr!(8));
        let salt        = i64::from_le_bytes(arr!(8));
        let time_offset = i32::from_le_bytes(arr!(4));
        let len         = u16::from_le_bytes(arr!(2)) as usize;
        let endpoint    = std::str::from_utf8(r!(len))
            .map_err(|_| invalid("endpoint is not UTF-8"))?
            .to_owned();
        if p != buf.len() {
            return Err(invalid("trailing bytes after session"));
        }

        let session = Self {
            auth_key,
            salt,
            time_offset,
            endpoint: (!endpoint.is_empty()).then_some(endpoint),
        };
        if session.key_id() != key_id {
            return Err(invalid("stored key id does not match the auth key"));
        }
        Ok(session)
    }

    /// Write the record to `path` through a temporary file and a rename.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let bytes = Zeroizing::new(self.to_bytes());
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes.as_slice())?;
        std::fs::rename(&tmp, path)
    }

    /// Read a record from `path`.
    pub fn load(path: &Path) -> io::Result<Self> {
        Self::from_bytes(&Zeroizing::new(std::fs::read(path)?))
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}
