use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use rand::RngCore;

use crate::crypt::{EncryptionKey, PayloadCipher, SALT_SIZE};

const MAGIC: &[u8; 4] = b"EMBC";
const FORMAT: u32 = 0;
const APP_VERSION: u64 = 1;

/// Plaintext prefix: magic + salt.
const PLAIN_PREFIX: usize = MAGIC.len() + SALT_SIZE;
/// Encrypted header block: format, reserved, app version, keyed checksum.
const COVERED_FIELDS: usize = 4 + 4 + 8;
const COVERED_SIZE: usize = COVERED_FIELDS + 32;
/// Total header length preceding the payload.
const HEADER_SIZE: usize = PLAIN_PREFIX + COVERED_SIZE;

/// Values are padded to this block length on disk.
pub const PADDING_BLOCK: usize = 16;

/// How a file is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
    ReadAppend,
}

/// Why an open failed. IO detail is intentionally collapsed: callers react
/// to the kind, the path is theirs already.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenError {
    Failed,
    LockFailed,
    WrongKey,
}

/// A single encrypted file with a keyed header and an advisory lock. This is
/// the only way the store touches persistent storage.
///
/// Logical offsets and sizes exclude the header; the keystream position is
/// tied to the logical offset, so seeking and rewriting stay consistent.
pub struct EncryptedFile {
    file: File,
    cipher: PayloadCipher,
    offset: u64,
    size: u64,
}

impl EncryptedFile {
    pub fn open(path: &Path, mode: Mode, key: &EncryptionKey) -> Result<Self, OpenError> {
        match mode {
            Mode::Read => Self::open_for_read(path, key),
            Mode::Write => Self::open_for_write(path, key),
            Mode::ReadAppend => Self::open_for_read_append(path, key),
        }
    }

    fn open_for_read(path: &Path, key: &EncryptionKey) -> Result<Self, OpenError> {
        let mut file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|_| OpenError::Failed)?;
        let (cipher, size) = read_header(&mut file, key)?;
        Ok(Self {
            file,
            cipher,
            offset: 0,
            size,
        })
    }

    fn open_for_write(path: &Path, key: &EncryptionKey) -> Result<Self, OpenError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|_| OpenError::Failed)?;
        if !try_lock(&file) {
            return Err(OpenError::LockFailed);
        }
        file.set_len(0).map_err(|_| OpenError::Failed)?;
        let cipher = write_header(&mut file, key).map_err(|_| OpenError::Failed)?;
        Ok(Self {
            file,
            cipher,
            offset: 0,
            size: 0,
        })
    }

    fn open_for_read_append(path: &Path, key: &EncryptionKey) -> Result<Self, OpenError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|_| OpenError::Failed)?;
        if !try_lock(&file) {
            return Err(OpenError::LockFailed);
        }
        let len = file.metadata().map_err(|_| OpenError::Failed)?.len();
        if len == 0 {
            let cipher = write_header(&mut file, key).map_err(|_| OpenError::Failed)?;
            Ok(Self {
                file,
                cipher,
                offset: 0,
                size: 0,
            })
        } else {
            let (cipher, size) = read_header(&mut file, key)?;
            Ok(Self {
                file,
                cipher,
                offset: 0,
                size,
            })
        }
    }

    /// Logical payload size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current logical position.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.file
            .seek(SeekFrom::Start(HEADER_SIZE as u64 + offset))?;
        self.offset = offset;
        Ok(())
    }

    /// Reads and decrypts up to `buf.len()` bytes, returning how many were
    /// available.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if filled > 0 {
            self.cipher
                .apply(&mut buf[..filled], cipher_offset(self.offset));
            self.offset += filled as u64;
        }
        Ok(filled)
    }

    /// Encrypts and writes all of `data` at the current position.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut encrypted = data.to_vec();
        self.cipher
            .apply(&mut encrypted, cipher_offset(self.offset));
        self.file.write_all(&encrypted)?;
        self.offset += data.len() as u64;
        self.size = self.size.max(self.offset);
        Ok(())
    }

    /// Writes `data` padded with random bytes to a whole number of
    /// [`PADDING_BLOCK`]s; the logical position advances by the padded length.
    pub fn write_with_padding(&mut self, data: &[u8]) -> io::Result<()> {
        let padded = padded_size(data.len());
        let mut buf = Vec::with_capacity(padded);
        buf.extend_from_slice(data);
        buf.resize(padded, 0);
        rand::thread_rng().fill_bytes(&mut buf[data.len()..]);
        self.write(&buf)
    }

    /// Reads a value of `size` bytes written by [`write_with_padding`],
    /// consuming the whole padded length. A short file is an error.
    pub fn read_with_padding(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let padded = padded_size(size);
        let mut buf = vec![0u8; padded];
        let read = self.read(&mut buf)?;
        if read != padded {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "padded value shorter than recorded size",
            ));
        }
        buf.truncate(size);
        Ok(buf)
    }

    /// Drops everything past the current logical position.
    pub fn truncate(&mut self) -> io::Result<()> {
        self.file.set_len(HEADER_SIZE as u64 + self.offset)?;
        self.size = self.offset;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    /// Renames `src` over `dst`, replacing it.
    pub fn rename(src: &Path, dst: &Path) -> io::Result<()> {
        std::fs::rename(src, dst)
    }
}

impl std::fmt::Debug for EncryptedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFile")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// The keystream position for a logical payload offset. The encrypted header
/// block occupies positions `0..COVERED_SIZE`.
fn cipher_offset(offset: u64) -> u64 {
    COVERED_SIZE as u64 + offset
}

fn padded_size(size: usize) -> usize {
    (size + PADDING_BLOCK - 1) / PADDING_BLOCK * PADDING_BLOCK
}

fn write_header(file: &mut File, key: &EncryptionKey) -> io::Result<PayloadCipher> {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut covered = [0u8; COVERED_SIZE];
    BigEndian::write_u32(&mut covered[0..4], FORMAT);
    BigEndian::write_u32(&mut covered[4..8], 0);
    BigEndian::write_u64(&mut covered[8..16], APP_VERSION);
    let checksum = key.header_checksum(&salt, &covered[..COVERED_FIELDS]);
    covered[COVERED_FIELDS..].copy_from_slice(&checksum);

    let mut cipher = key.prepare_cipher(&salt);
    cipher.apply(&mut covered, 0);

    file.seek(SeekFrom::Start(0))?;
    file.write_all(MAGIC)?;
    file.write_all(&salt)?;
    file.write_all(&covered)?;
    Ok(cipher)
}

fn read_header(file: &mut File, key: &EncryptionKey) -> Result<(PayloadCipher, u64), OpenError> {
    let len = file.metadata().map_err(|_| OpenError::Failed)?.len();
    if len < HEADER_SIZE as u64 {
        return Err(OpenError::Failed);
    }

    file.seek(SeekFrom::Start(0)).map_err(|_| OpenError::Failed)?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).map_err(|_| OpenError::Failed)?;
    if &magic != MAGIC {
        return Err(OpenError::Failed);
    }
    let mut salt = [0u8; SALT_SIZE];
    file.read_exact(&mut salt).map_err(|_| OpenError::Failed)?;
    let mut covered = [0u8; COVERED_SIZE];
    file.read_exact(&mut covered)
        .map_err(|_| OpenError::Failed)?;

    let mut cipher = key.prepare_cipher(&salt);
    cipher.apply(&mut covered, 0);

    let expected = key.header_checksum(&salt, &covered[..COVERED_FIELDS]);
    if covered[COVERED_FIELDS..] != expected {
        return Err(OpenError::WrongKey);
    }
    if BigEndian::read_u32(&covered[0..4]) != FORMAT {
        return Err(OpenError::Failed);
    }
    Ok((cipher, len - HEADER_SIZE as u64))
}

#[cfg(unix)]
fn try_lock(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    result == 0
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> bool {
    // Advisory locking is best-effort on other platforms.
    true
}
