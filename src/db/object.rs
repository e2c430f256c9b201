use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use xxhash_rust::xxh32::xxh32;

use super::{cleaner, compactor, Stats, Task};
use crate::binlog::record::{
    encode_multi_access, encode_multi_remove, encode_store, BasicHeader, BASIC_HEADER_SIZE,
    BINLOG_FORMAT,
};
use crate::binlog::{BinlogReader, StoreRecord};
use crate::config::Settings;
use crate::crypt::EncryptionKey;
use crate::error::{Error, Result};
use crate::file::{EncryptedFile, Mode, OpenError};
use crate::index::{Clock, State, TimePoint};
use crate::key::{Key, PlaceId};
use crate::version::{self, Version};

const BINLOG_FILENAME: &str = "binlog";
const COMPACT_READY_FILENAME: &str = "binlog-ready";
const COMPACT_TEMP_FILENAME: &str = "binlog-compact";

/// Random place draws before giving up on a put. The 56-bit space is sparse
/// at any realistic entry count; exhausting this means the directory is
/// damaged, not unlucky.
const PLACE_ATTEMPTS: usize = 8192;

const INITIAL_DELAY_AFTER_FAILURE: Duration = Duration::from_secs(10);
const MAX_DELAY_AFTER_FAILURE: Duration = Duration::from_secs(24 * 60 * 60);

enum OpenOutcome {
    Success,
    Failed,
    LockFailed,
    WrongKey,
}

/// Cancel-on-drop handle to a running compaction, plus its retry backoff.
struct CompactorWrap {
    handle: Option<JoinHandle<()>>,
    generation: u64,
    excess_length: i64,
    next_attempt: Option<Instant>,
    delay_after_failure: Duration,
}

impl Default for CompactorWrap {
    fn default() -> Self {
        Self {
            handle: None,
            generation: 0,
            excess_length: 0,
            next_attempt: None,
            delay_after_failure: INITIAL_DELAY_AFTER_FAILURE,
        }
    }
}

impl Drop for CompactorWrap {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// Cancel-on-drop handle to the running cleaner.
#[derive(Default)]
struct CleanerWrap {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl Drop for CleanerWrap {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// The store's single-threaded heart. Every mutation of the index and the
/// binlog happens here, driven by tasks from the facade and by the two timer
/// deadlines the run loop watches.
pub(crate) struct DatabaseObject {
    base: PathBuf,
    path: Option<PathBuf>,
    settings: Settings,
    clock: Arc<dyn Clock>,
    sender: mpsc::WeakSender<Task>,

    key: Option<EncryptionKey>,
    binlog: Option<EncryptedFile>,
    state: State,
    removing: BTreeSet<Key>,
    accessed: BTreeSet<Key>,

    pub(crate) write_bundles_at: Option<Instant>,
    pub(crate) prune_at: Option<Instant>,

    compactor: CompactorWrap,
    cleaner: CleanerWrap,
    generation: u64,
}

impl DatabaseObject {
    pub fn new(
        base: PathBuf,
        settings: Settings,
        clock: Arc<dyn Clock>,
        sender: mpsc::WeakSender<Task>,
    ) -> Self {
        Self {
            base,
            path: None,
            settings,
            clock,
            sender,
            key: None,
            binlog: None,
            state: State::new(),
            removing: BTreeSet::new(),
            accessed: BTreeSet::new(),
            write_bundles_at: None,
            prune_at: None,
            compactor: CompactorWrap::default(),
            cleaner: CleanerWrap::default(),
            generation: 0,
        }
    }

    pub fn handle(&mut self, task: Task) {
        match task {
            Task::Open { key, reply } => {
                let _ = reply.send(self.open(key));
            }
            Task::Put {
                key,
                value,
                tag,
                reply,
            } => {
                let _ = reply.send(self.put(key, value, tag));
            }
            Task::Get { key, reply } => {
                let _ = reply.send(self.get(key));
            }
            Task::Remove { key, reply } => {
                self.remove(key);
                let _ = reply.send(());
            }
            Task::Clear { reply } => {
                let _ = reply.send(self.clear());
            }
            Task::Close { reply } => {
                self.close();
                let _ = reply.send(());
            }
            Task::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Task::CompactorDone { generation, result } => {
                self.compactor_done(generation, result);
            }
            Task::CleanerDone { generation } => {
                self.cleaner_done(generation);
            }
        }
    }

    /// Fired by the run loop when the bundle deadline passes.
    pub fn on_write_bundles_timer(&mut self) {
        self.write_bundles();
        self.check_compactor();
    }

    /// Fired by the run loop when the prune deadline passes.
    pub fn on_prune_timer(&mut self) {
        self.prune();
    }

    // ---- open / close / clear ----

    pub fn open(&mut self, key: EncryptionKey) -> Result<()> {
        if self.binlog.is_some() {
            self.close();
        }
        let version = version::read_version(&self.base).unwrap_or(0);
        match self.open_binlog(version, Mode::ReadAppend, &key) {
            OpenOutcome::Success => Ok(()),
            OpenOutcome::LockFailed => Err(Error::LockFailed(self.binlog_path_for(version))),
            OpenOutcome::WrongKey => Err(Error::WrongKey(self.binlog_path_for(version))),
            OpenOutcome::Failed => {
                let available = version::find_available_version(&self.base);
                if version::write_version(&self.base, available).is_err() {
                    return Err(Error::Io(version::version_file_path(&self.base)));
                }
                match self.open_binlog(available, Mode::Write, &key) {
                    OpenOutcome::Success => Ok(()),
                    _ => Err(Error::Io(self.binlog_path_for(available))),
                }
            }
        }
    }

    fn open_binlog(&mut self, version: Version, mode: Mode, key: &EncryptionKey) -> OpenOutcome {
        let dir = version::version_dir(&self.base, version);
        if mode != Mode::Read && fs::create_dir_all(&dir).is_err() {
            return OpenOutcome::Failed;
        }
        // A leftover ready file is a committed compaction: it replaces the
        // binlog before anything reads it.
        let ready = dir.join(COMPACT_READY_FILENAME);
        let path = dir.join(BINLOG_FILENAME);
        if ready.exists() && EncryptedFile::rename(&ready, &path).is_err() {
            return OpenOutcome::Failed;
        }
        let mut binlog = match EncryptedFile::open(&path, mode, key) {
            Ok(binlog) => binlog,
            Err(OpenError::LockFailed) => return OpenOutcome::LockFailed,
            Err(OpenError::WrongKey) => return OpenOutcome::WrongKey,
            Err(OpenError::Failed) => return OpenOutcome::Failed,
        };
        let header_required = mode == Mode::Read || (mode == Mode::ReadAppend && binlog.size() > 0);
        let header_ok = if header_required {
            self.read_header(&mut binlog)
        } else {
            self.write_header(&mut binlog)
        };
        if !header_ok {
            return OpenOutcome::Failed;
        }
        self.path = Some(dir);
        self.key = Some(key.clone());
        self.create_cleaner(version);
        self.replay_binlog(&mut binlog);
        self.binlog = Some(binlog);
        self.adjust_relative_time();
        self.optimize();
        OpenOutcome::Success
    }

    fn read_header(&mut self, binlog: &mut EncryptedFile) -> bool {
        let mut buf = [0u8; BASIC_HEADER_SIZE];
        if !matches!(binlog.read(&mut buf), Ok(read) if read == BASIC_HEADER_SIZE) {
            return false;
        }
        let Some(header) = BasicHeader::decode(&buf) else {
            return false;
        };
        if header.format != BINLOG_FORMAT
            || header.track_estimated_time() != self.settings.track_estimated_time
        {
            return false;
        }
        self.state.time = TimePoint {
            system: header.system_time,
            relative: u64::from(header.system_time),
        };
        true
    }

    fn write_header(&mut self, binlog: &mut EncryptedFile) -> bool {
        let now = if self.settings.track_estimated_time {
            self.unixtime()
        } else {
            0
        };
        self.state.time = TimePoint {
            system: now,
            relative: u64::from(now),
        };
        let header = BasicHeader::new(self.settings.track_estimated_time, now);
        binlog.write(&header.encode()).is_ok() && binlog.flush().is_ok()
    }

    fn replay_binlog(&mut self, binlog: &mut EncryptedFile) {
        let till = binlog.size();
        let mut reader = BinlogReader::new(binlog, self.settings.read_block_size, till);
        let mut rejected = None;
        while let Some(record) = reader.read_record() {
            if !self.state.apply_record(record, &self.settings) {
                rejected = Some(reader.record_offset());
                break;
            }
        }
        let cut = rejected.unwrap_or_else(|| reader.good_offset());
        let torn = reader.failed() || rejected.is_some() || cut < till;
        drop(reader);

        if binlog.seek(cut).is_err() {
            return;
        }
        if torn && cut < till {
            tracing::warn!(
                good = cut,
                size = till,
                "binlog tail unreadable, truncating at last intact record"
            );
            let _ = binlog.truncate();
        }
        tracing::info!(keys = self.state.len(), "binlog replayed");
    }

    /// A backwards wall-clock jump since the header was stamped would stall
    /// the relative clock; materialize a fresh time point right away.
    fn adjust_relative_time(&mut self) {
        if !self.settings.track_estimated_time {
            return;
        }
        if self.unixtime() < self.state.time.system {
            self.write_multi_access_block();
        }
    }

    pub fn close(&mut self) {
        self.write_bundles();
        self.cleaner = CleanerWrap::default();
        self.compactor = CompactorWrap::default();
        self.binlog = None;
        self.key = None;
        self.path = None;
        self.state.clear();
        self.removing.clear();
        self.accessed.clear();
        self.write_bundles_at = None;
        self.prune_at = None;
    }

    /// Rotates to a fresh version. Only legal while the store is closed.
    pub fn clear(&mut self) -> Result<()> {
        if self.key.is_some() {
            return Err(Error::Io(version::version_file_path(&self.base)));
        }
        let available = version::find_available_version(&self.base);
        version::write_version(&self.base, available)
            .map_err(|_| Error::Io(version::version_file_path(&self.base)))
    }

    pub fn stats(&self) -> Stats {
        Stats {
            entries: self.state.len(),
            total_size: self.state.total_size(),
        }
    }

    // ---- put / get / remove ----

    pub fn put(&mut self, key: Key, value: Vec<u8>, tag: u8) -> Result<()> {
        if value.is_empty() {
            self.remove(key);
            return Ok(());
        }
        if self.binlog.is_none() || value.len() > self.settings.max_data_size as usize {
            return Err(Error::Io(self.binlog_path()));
        }
        self.removing.remove(&key);

        let checksum = xxh32(&value, 0);
        let Some(path) = self.write_key_place(key, &value, checksum, tag)? else {
            // Nothing changed.
            self.record_entry_access(key);
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).is_err() {
                self.remove(key);
                return Err(Error::Io(path));
            }
        }
        let file_key = self.key.clone().ok_or_else(|| Error::Io(path.clone()))?;
        let mut data = match EncryptedFile::open(&path, Mode::Write, &file_key) {
            Ok(data) => data,
            Err(OpenError::LockFailed) => return Err(Error::LockFailed(path)),
            Err(_) => {
                self.remove(key);
                return Err(Error::Io(path));
            }
        };
        if data.write_with_padding(&value).is_err() {
            drop(data);
            self.remove(key);
            return Err(Error::Io(path));
        }
        let _ = data.flush();
        self.optimize();
        Ok(())
    }

    /// Appends the store record for a put and applies it to the index.
    /// Returns the data-file path to write, or `None` when the existing entry
    /// already holds exactly this value.
    fn write_key_place(
        &mut self,
        key: Key,
        value: &[u8],
        checksum: u32,
        tag: u8,
    ) -> Result<Option<PathBuf>> {
        let size = value.len() as u32;
        let time = if self.settings.track_estimated_time {
            let mut time = self.count_time_point();
            let current = self.state.time.relative;
            debug_assert!(time.relative >= current);
            // Stick to the previous stamp while the advance is small, so the
            // log does not accumulate a unique relative value per write.
            if Duration::from_secs(time.relative - current) < self.settings.write_bundle_delay {
                time = self.state.time;
            }
            Some(time)
        } else {
            None
        };

        let place = if let Some(already) = self.state.get(&key).copied() {
            if already.tag == tag
                && already.size == size
                && already.checksum == checksum
                && self.read_value_data(already.place, already.size) == value
            {
                return Ok(None);
            }
            already.place
        } else {
            self.draw_free_place()?
        };

        let record = StoreRecord {
            key,
            place,
            tag,
            size,
            checksum,
            time,
        };
        let encoded = encode_store(&record);
        let binlog_path = self.binlog_path();
        let Some(binlog) = self.binlog.as_mut() else {
            return Err(Error::Io(binlog_path));
        };
        if binlog.write(&encoded).is_err() {
            return Err(Error::Io(binlog_path));
        }
        let _ = binlog.flush();

        let applied = self.state.apply_store(&record, &self.settings);
        debug_assert!(applied);
        Ok(Some(self.place_path(place)))
    }

    fn draw_free_place(&self) -> Result<PlaceId> {
        let mut rng = rand::thread_rng();
        for _ in 0..PLACE_ATTEMPTS {
            let place = PlaceId::random(&mut rng);
            if self.is_free_place(place) {
                return Ok(place);
            }
        }
        Err(Error::Io(self.binlog_path()))
    }

    pub fn get(&mut self, key: Key) -> Vec<u8> {
        if self.removing.contains(&key) {
            return Vec::new();
        }
        let Some(entry) = self.state.get(&key).copied() else {
            return Vec::new();
        };
        let value = self.read_value_data(entry.place, entry.size);
        if value.is_empty() || xxh32(&value, 0) != entry.checksum {
            // Corruption degrades to a miss; pruning reclaims the entry.
            return Vec::new();
        }
        self.record_entry_access(key);
        value
    }

    fn read_value_data(&self, place: PlaceId, size: u32) -> Vec<u8> {
        let Some(key) = &self.key else {
            return Vec::new();
        };
        let path = self.place_path(place);
        match EncryptedFile::open(&path, Mode::Read, key) {
            Ok(mut data) => data.read_with_padding(size as usize).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    pub fn remove(&mut self, key: Key) {
        if let Some(entry) = self.state.erase(&key) {
            self.removing.insert(key);
            self.write_multi_remove_lazy();
            let _ = fs::remove_file(self.place_path(entry.place));
        }
    }

    fn record_entry_access(&mut self, key: Key) {
        if !self.settings.track_estimated_time {
            return;
        }
        self.accessed.insert(key);
        self.write_multi_access_lazy();
        self.optimize();
    }

    // ---- lazy bundles ----

    fn write_bundles_lazy(&mut self) {
        if self.write_bundles_at.is_none() {
            self.write_bundles_at = Some(Instant::now() + self.settings.write_bundle_delay);
        }
    }

    fn write_multi_remove_lazy(&mut self) {
        if self.removing.len() as u32 == self.settings.max_bundled_records {
            self.write_multi_remove();
        } else {
            self.write_bundles_lazy();
        }
    }

    fn write_multi_remove(&mut self) {
        debug_assert!(self.removing.len() as u32 <= self.settings.max_bundled_records);
        if self.removing.is_empty() {
            return;
        }
        let keys: Vec<Key> = std::mem::take(&mut self.removing).into_iter().collect();
        let encoded = encode_multi_remove(&keys);
        let Some(binlog) = self.binlog.as_mut() else {
            return;
        };
        if binlog.write(&encoded).is_ok() {
            let _ = binlog.flush();
            self.state.add_excess(encoded.len() as i64);
        }
    }

    fn write_multi_access_lazy(&mut self) {
        if self.accessed.len() as u32 == self.settings.max_bundled_records {
            self.write_multi_access();
        } else {
            self.write_bundles_lazy();
        }
    }

    fn write_multi_access(&mut self) {
        if !self.accessed.is_empty() {
            self.write_multi_access_block();
        }
    }

    /// Writes a MultiAccess record for the pending set, possibly empty: an
    /// empty block still persists a corrected time point.
    fn write_multi_access_block(&mut self) {
        debug_assert!(self.settings.track_estimated_time);
        debug_assert!(self.accessed.len() as u32 <= self.settings.max_bundled_records);

        let time = self.count_time_point();
        let keys: Vec<Key> = std::mem::take(&mut self.accessed).into_iter().collect();
        self.state.time = time;
        for key in &keys {
            self.state.touch(key, time.relative);
        }
        let encoded = encode_multi_access(time, &keys);
        let Some(binlog) = self.binlog.as_mut() else {
            return;
        };
        if binlog.write(&encoded).is_ok() {
            let _ = binlog.flush();
            self.state.add_excess(encoded.len() as i64);
        }
    }

    fn write_bundles(&mut self) {
        self.write_bundles_at = None;
        self.write_multi_remove();
        if self.settings.track_estimated_time {
            self.write_multi_access();
        }
    }

    // ---- pruning ----

    fn unixtime(&self) -> u32 {
        self.clock.unixtime()
    }

    fn count_time_point(&self) -> TimePoint {
        self.state.count_time_point(self.unixtime())
    }

    fn prune_before_time(&self) -> u64 {
        let relative = self.state.current_relative(self.unixtime());
        let limit = u64::from(self.settings.total_time_limit);
        if limit != 0 && relative > limit {
            relative - limit
        } else {
            0
        }
    }

    fn optimize(&mut self) {
        if !self.start_delayed_pruning() {
            self.check_compactor();
        }
    }

    fn start_delayed_pruning(&mut self) -> bool {
        if !self.settings.track_estimated_time || self.state.is_empty() {
            return false;
        }
        let before = self.prune_before_time();
        let minimal = self.state.minimal_entry_time();
        let over_size = self.settings.total_size_limit > 0
            && self.state.total_size() > self.settings.total_size_limit;
        let now = Instant::now();
        if over_size || (minimal != 0 && minimal <= before) {
            let arm = self
                .prune_at
                .map_or(true, |at| at.saturating_duration_since(now) > self.settings.prune_timeout);
            if arm {
                self.prune_at = Some(now + self.settings.prune_timeout);
            }
            true
        } else {
            if minimal != 0 && self.prune_at.is_none() {
                let delay = Duration::from_secs(minimal - before)
                    .min(self.settings.max_prune_check_timeout);
                self.prune_at = Some(now + delay);
            }
            false
        }
    }

    fn prune(&mut self) {
        self.prune_at = None;
        let mut stale = BTreeSet::new();
        let mut stale_total_size = 0i64;
        let before = self.prune_before_time();
        self.state
            .collect_time_prune(&self.settings, before, &mut stale, &mut stale_total_size);
        self.state
            .collect_size_prune(&self.settings, &mut stale, &mut stale_total_size);
        if !stale.is_empty() {
            tracing::debug!(
                stale = stale.len(),
                bytes = stale_total_size,
                "pruning entries"
            );
        }
        for key in stale {
            self.remove(key);
        }
        self.optimize();
    }

    // ---- compaction ----

    fn check_compactor(&mut self) {
        if self.compactor.handle.is_some()
            || self.settings.compact_after_excess == 0
            || self.state.excess_length() < self.settings.compact_after_excess
        {
            return;
        }
        let Some(binlog_size) = self.binlog.as_ref().map(|binlog| binlog.size()) else {
            return;
        };
        if self.settings.compact_after_full_size != 0
            && self.state.excess_length() * self.settings.compact_after_full_size
                < self.settings.compact_after_excess * binlog_size as i64
        {
            return;
        }
        if let Some(at) = self.compactor.next_attempt {
            if Instant::now() < at {
                return;
            }
        }
        let (Some(path), Some(key)) = (self.path.clone(), self.key.clone()) else {
            return;
        };
        self.generation += 1;
        let params = compactor::Params {
            binlog_path: path.join(BINLOG_FILENAME),
            compact_path: path.join(COMPACT_TEMP_FILENAME),
            settings: self.settings.clone(),
            key,
            info: compactor::Info {
                till: binlog_size,
                system_time: self.state.time.system,
                keys_count: self.state.len(),
            },
        };
        self.compactor.handle = Some(compactor::spawn(self.sender.clone(), self.generation, params));
        self.compactor.generation = self.generation;
        self.compactor.excess_length = self.state.excess_length();
    }

    fn compactor_done(
        &mut self,
        generation: u64,
        result: std::result::Result<compactor::Done, ()>,
    ) {
        if self.compactor.handle.is_none() || generation != self.compactor.generation {
            // A worker cancelled by close or reset; its result is void.
            return;
        }
        match result {
            Ok(done) => self.finish_compaction(done),
            Err(()) => self.compactor_fail(),
        }
    }

    fn finish_compaction(&mut self, done: compactor::Done) {
        let size = match self.binlog.as_ref().map(|binlog| binlog.size()) {
            Some(size) => size,
            None => {
                self.compactor_fail();
                return;
            }
        };
        let binlog_path = self.binlog_path();
        let ready_path = self.compact_ready_path();

        let mut read_till = done.read_till;
        if read_till != size {
            // The binlog grew past the snapshot: splice the tail over.
            read_till = match self.catch_up(&done.path, read_till) {
                Ok(till) => till,
                Err(_) => return self.compactor_fail(),
            };
            if read_till != size {
                return self.compactor_fail();
            }
        }
        if EncryptedFile::rename(&done.path, &ready_path).is_err() {
            return self.compactor_fail();
        }
        // Commit point: close the primary, move the ready file over it.
        self.binlog = None;
        if EncryptedFile::rename(&ready_path, &binlog_path).is_err() {
            tracing::error!(path = %binlog_path.display(), "compaction commit rename failed");
            return self.compactor_fail();
        }
        let Some(key) = self.key.clone() else {
            return self.compactor_fail();
        };
        let mut reopened = match EncryptedFile::open(&binlog_path, Mode::ReadAppend, &key) {
            Ok(binlog) => binlog,
            Err(_) => {
                tracing::error!(path = %binlog_path.display(), "compacted binlog failed to reopen");
                return self.compactor_fail();
            }
        };
        if reopened.seek(reopened.size()).is_err() {
            tracing::error!(path = %binlog_path.display(), "compacted binlog failed to seek");
            return self.compactor_fail();
        }
        self.binlog = Some(reopened);
        let compacted_excess = self.compactor.excess_length;
        self.compactor = CompactorWrap::default();
        self.state.sub_excess(compacted_excess);
        tracing::info!(
            excess = compacted_excess,
            size = self.binlog.as_ref().map(|b| b.size()).unwrap_or(0),
            "binlog compacted"
        );
    }

    /// Copies the binlog tail `[from, size)` onto the compacted file. Records
    /// are position-independent, so a byte copy preserves them exactly.
    fn catch_up(&self, compact_path: &Path, from: u64) -> io::Result<u64> {
        let other = |message: &str| io::Error::new(io::ErrorKind::Other, message.to_string());
        let key = self.key.clone().ok_or_else(|| other("store closed"))?;
        let mut source = EncryptedFile::open(&self.binlog_path(), Mode::Read, &key)
            .map_err(|_| other("binlog reopen failed"))?;
        source.seek(from)?;
        let mut dest = EncryptedFile::open(compact_path, Mode::ReadAppend, &key)
            .map_err(|_| other("compact file reopen failed"))?;
        dest.seek(dest.size())?;

        let mut buf = vec![0u8; self.settings.read_block_size];
        let mut position = from;
        loop {
            let read = source.read(&mut buf)?;
            if read == 0 {
                break;
            }
            dest.write(&buf[..read])?;
            position += read as u64;
        }
        dest.flush()?;
        Ok(position)
    }

    fn compactor_fail(&mut self) {
        let delay = self.compactor.delay_after_failure;
        self.compactor = CompactorWrap::default();
        self.compactor.next_attempt = Some(Instant::now() + delay);
        self.compactor.delay_after_failure = (delay * 2).min(MAX_DELAY_AFTER_FAILURE);
        let _ = fs::remove_file(self.compact_ready_path());
        tracing::debug!(retry_in = ?delay, "compaction failed, backing off");
    }

    // ---- cleaner ----

    fn create_cleaner(&mut self, active: Version) {
        self.generation += 1;
        self.cleaner = CleanerWrap {
            handle: Some(cleaner::spawn(
                self.sender.clone(),
                self.generation,
                self.base.clone(),
                active,
            )),
            generation: self.generation,
        };
    }

    fn cleaner_done(&mut self, generation: u64) {
        if generation == self.cleaner.generation {
            self.cleaner = CleanerWrap::default();
        }
    }

    // ---- paths ----

    fn binlog_path_for(&self, version: Version) -> PathBuf {
        version::version_dir(&self.base, version).join(BINLOG_FILENAME)
    }

    fn binlog_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => path.join(BINLOG_FILENAME),
            None => self.base.join(BINLOG_FILENAME),
        }
    }

    fn compact_ready_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => path.join(COMPACT_READY_FILENAME),
            None => self.base.join(COMPACT_READY_FILENAME),
        }
    }

    fn place_path(&self, place: PlaceId) -> PathBuf {
        match &self.path {
            Some(path) => path.join(place.relative_path()),
            None => self.base.join(place.relative_path()),
        }
    }

    fn is_free_place(&self, place: PlaceId) -> bool {
        !self.place_path(place).exists()
    }
}
