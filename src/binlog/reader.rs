use super::record::{decode_record, probe_record_size, Record, SizeProbe};
use crate::file::EncryptedFile;

/// Streams records out of an open binlog in bounded blocks, stopping without
/// error at a torn or foreign tail.
///
/// The reader never consumes bytes it could not parse: after it stops,
/// [`good_offset`](Self::good_offset) is the end of the last record it
/// returned, which is where the caller rolls the file back to.
pub struct BinlogReader<'a> {
    file: &'a mut EncryptedFile,
    till: u64,
    buf: Vec<u8>,
    /// File offset of `buf[0]`.
    base: u64,
    filled: usize,
    pos: usize,
    record_offset: u64,
    consumed: u64,
    finished: bool,
    failed: bool,
}

impl<'a> BinlogReader<'a> {
    /// Starts reading at the file's current offset up to `till`.
    pub fn new(file: &'a mut EncryptedFile, block_size: usize, till: u64) -> Self {
        let base = file.offset();
        Self {
            file,
            till,
            buf: vec![0u8; block_size],
            base,
            filled: 0,
            pos: 0,
            record_offset: base,
            consumed: base,
            finished: false,
            failed: false,
        }
    }

    /// The next parseable record, or `None` once the stream ends or turns
    /// unparseable.
    pub fn read_record(&mut self) -> Option<Record> {
        if self.finished {
            return None;
        }
        loop {
            let available = self.filled - self.pos;
            match probe_record_size(&self.buf[self.pos..self.filled]) {
                SizeProbe::Size(size) if size <= available => {
                    let start = self.base + self.pos as u64;
                    match decode_record(&self.buf[self.pos..self.pos + size]) {
                        Some(record) => {
                            self.record_offset = start;
                            self.pos += size;
                            self.consumed = self.base + self.pos as u64;
                            return Some(record);
                        }
                        None => {
                            self.finished = true;
                            self.failed = true;
                            return None;
                        }
                    }
                }
                SizeProbe::Invalid => {
                    self.finished = true;
                    self.failed = true;
                    return None;
                }
                // Unknown, or a size we do not have in the buffer yet.
                _ => {
                    if !self.refill() {
                        self.finished = true;
                        self.failed = available > 0;
                        return None;
                    }
                }
            }
        }
    }

    /// File offset where the last returned record starts.
    pub fn record_offset(&self) -> u64 {
        self.record_offset
    }

    /// File offset just past the last returned record: the boundary every
    /// record before is intact at.
    pub fn good_offset(&self) -> u64 {
        self.consumed
    }

    /// Whether reading stopped on unparseable bytes rather than a clean end.
    pub fn failed(&self) -> bool {
        self.failed
    }

    fn refill(&mut self) -> bool {
        // Shift the unparsed suffix to the front to make room.
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.filled, 0);
            self.base += self.pos as u64;
            self.filled -= self.pos;
            self.pos = 0;
        }
        let end = self.base + self.filled as u64;
        let remaining = self.till.saturating_sub(end);
        let room = (self.buf.len() - self.filled).min(remaining as usize);
        if room == 0 {
            return false;
        }
        match self.file.read(&mut self.buf[self.filled..self.filled + room]) {
            Ok(0) | Err(_) => false,
            Ok(read) => {
                self.filled += read;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::record::{
        encode_multi_remove, encode_store, BasicHeader, StoreRecord, BASIC_HEADER_SIZE, STORE_SIZE,
    };
    use crate::crypt::EncryptionKey;
    use crate::file::Mode;
    use crate::key::{Key, PlaceId};
    use tempfile::TempDir;

    fn test_key() -> EncryptionKey {
        EncryptionKey::new(vec![0x33; EncryptionKey::SIZE])
    }

    fn store(n: u64) -> StoreRecord {
        StoreRecord {
            key: Key::new(n, n + 1),
            place: PlaceId([n as u8; 7]),
            tag: 0,
            size: 10,
            checksum: 0x1234,
            time: None,
        }
    }

    fn write_binlog(path: &std::path::Path, chunks: &[Vec<u8>]) {
        let mut file = EncryptedFile::open(path, Mode::Write, &test_key()).unwrap();
        file.write(&BasicHeader::new(false, 0).encode()).unwrap();
        for chunk in chunks {
            file.write(chunk).unwrap();
        }
        file.flush().unwrap();
    }

    fn open_past_header(path: &std::path::Path) -> EncryptedFile {
        let mut file = EncryptedFile::open(path, Mode::Read, &test_key()).unwrap();
        let mut header = [0u8; BASIC_HEADER_SIZE];
        file.read(&mut header).unwrap();
        file
    }

    #[test]
    fn test_reads_records_across_small_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("binlog");
        let chunks: Vec<_> = (0..20).map(|i| encode_store(&store(i))).collect();
        write_binlog(&path, &chunks);

        let mut file = open_past_header(&path);
        let till = file.size();
        // A block barely larger than one record forces repeated refills.
        let mut reader = BinlogReader::new(&mut file, STORE_SIZE + 7, till);
        let mut seen = 0;
        while let Some(record) = reader.read_record() {
            assert_eq!(record, Record::Store(store(seen)));
            seen += 1;
        }
        assert_eq!(seen, 20);
        assert!(!reader.failed());
        assert_eq!(reader.good_offset(), till);
    }

    #[test]
    fn test_torn_tail_halts_and_reports_boundary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("binlog");
        let mut torn = encode_store(&store(2));
        torn.truncate(STORE_SIZE / 2);
        write_binlog(
            &path,
            &[encode_store(&store(0)), encode_store(&store(1)), torn],
        );

        let mut file = open_past_header(&path);
        let till = file.size();
        let mut reader = BinlogReader::new(&mut file, 4096, till);
        assert_eq!(reader.read_record(), Some(Record::Store(store(0))));
        assert_eq!(reader.read_record(), Some(Record::Store(store(1))));
        assert_eq!(reader.read_record(), None);
        assert!(reader.failed());
        assert_eq!(
            reader.good_offset(),
            (BASIC_HEADER_SIZE + 2 * STORE_SIZE) as u64
        );
    }

    #[test]
    fn test_incomplete_multi_record_dropped_whole() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("binlog");
        let keys: Vec<_> = (0..6).map(|i| Key::new(i, i)).collect();
        let mut multi = encode_multi_remove(&keys);
        // Lose the last key and a half: the whole multi-record must go.
        multi.truncate(multi.len() - 24);
        write_binlog(&path, &[encode_store(&store(0)), multi]);

        let mut file = open_past_header(&path);
        let till = file.size();
        let mut reader = BinlogReader::new(&mut file, 4096, till);
        assert_eq!(reader.read_record(), Some(Record::Store(store(0))));
        assert_eq!(reader.read_record(), None);
        assert!(reader.failed());
        assert_eq!(reader.good_offset(), (BASIC_HEADER_SIZE + STORE_SIZE) as u64);
    }

    #[test]
    fn test_unknown_discriminator_halts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("binlog");
        write_binlog(&path, &[encode_store(&store(0)), vec![0xEE; 40]]);

        let mut file = open_past_header(&path);
        let till = file.size();
        let mut reader = BinlogReader::new(&mut file, 4096, till);
        assert_eq!(reader.read_record(), Some(Record::Store(store(0))));
        assert_eq!(reader.read_record(), None);
        assert!(reader.failed());
    }

    #[test]
    fn test_empty_log_is_clean_end() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("binlog");
        write_binlog(&path, &[]);

        let mut file = open_past_header(&path);
        let till = file.size();
        let mut reader = BinlogReader::new(&mut file, 4096, till);
        assert_eq!(reader.read_record(), None);
        assert!(!reader.failed());
        assert_eq!(reader.good_offset(), BASIC_HEADER_SIZE as u64);
    }

    #[test]
    fn test_till_bounds_reading() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("binlog");
        write_binlog(&path, &[encode_store(&store(0)), encode_store(&store(1))]);

        let mut file = open_past_header(&path);
        let till = (BASIC_HEADER_SIZE + STORE_SIZE) as u64;
        let mut reader = BinlogReader::new(&mut file, 4096, till);
        assert_eq!(reader.read_record(), Some(Record::Store(store(0))));
        assert_eq!(reader.read_record(), None);
        assert!(!reader.failed());
        assert_eq!(reader.good_offset(), till);
    }
}
