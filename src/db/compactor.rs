use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Task;
use crate::binlog::record::{encode_multi_store, encode_store, BasicHeader, BASIC_HEADER_SIZE};
use crate::binlog::{BinlogReader, StoreRecord};
use crate::config::Settings;
use crate::crypt::EncryptionKey;
use crate::file::{EncryptedFile, Mode};
use crate::index::{State, TimePoint};

/// Snapshot the actor hands to a compaction run.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Info {
    /// Binlog byte offset the snapshot covers.
    pub till: u64,
    /// The store's persisted wall-clock second at snapshot time.
    pub system_time: u32,
    /// Live keys at snapshot time, for map sizing.
    pub keys_count: usize,
}

pub(crate) struct Params {
    pub binlog_path: PathBuf,
    pub compact_path: PathBuf,
    pub settings: Settings,
    pub key: EncryptionKey,
    pub info: Info,
}

/// What a finished run reports back for the splice.
#[derive(Debug)]
pub(crate) struct Done {
    pub path: PathBuf,
    pub read_till: u64,
}

/// Runs a compaction off the cache queue and posts the outcome back through
/// the weakly-held actor handle.
pub(crate) fn spawn(
    sender: mpsc::WeakSender<Task>,
    generation: u64,
    params: Params,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = tokio::task::spawn_blocking(move || run(params))
            .await
            .unwrap_or(Err(()));
        if let Some(sender) = sender.upgrade() {
            let _ = sender
                .send(Task::CompactorDone { generation, result })
                .await;
        }
    })
}

/// Rebuilds the live index from the binlog prefix `[0, till)` and writes it
/// as a fresh binlog at the sibling path: one store record per live entry, no
/// removes, no accesses, no overwrites — zero excess.
fn run(params: Params) -> Result<Done, ()> {
    let Params {
        binlog_path,
        compact_path,
        settings,
        key,
        info,
    } = params;

    // Read-only: the actor keeps its own locked ReadAppend handle.
    let mut binlog = EncryptedFile::open(&binlog_path, Mode::Read, &key).map_err(drop)?;
    let mut header = [0u8; BASIC_HEADER_SIZE];
    if binlog.read(&mut header).map_err(drop)? != BASIC_HEADER_SIZE {
        return Err(());
    }
    let header = BasicHeader::decode(&header).ok_or(())?;
    if header.track_estimated_time() != settings.track_estimated_time {
        return Err(());
    }

    let mut state = State::new();
    state.reserve(info.keys_count);
    state.time = TimePoint {
        system: header.system_time,
        relative: u64::from(header.system_time),
    };
    let mut reader = BinlogReader::new(&mut binlog, settings.read_block_size, info.till);
    while let Some(record) = reader.read_record() {
        if !state.apply_record(record, &settings) {
            return Err(());
        }
    }
    // The snapshot prefix was flushed whole; anything short of it means the
    // binlog changed under us or is corrupt, and the actor must not splice.
    if reader.failed() || reader.good_offset() != info.till {
        return Err(());
    }
    drop(reader);

    let mut out = EncryptedFile::open(&compact_path, Mode::Write, &key).map_err(drop)?;
    out.write(&BasicHeader::new(settings.track_estimated_time, info.system_time).encode())
        .map_err(drop)?;

    let records: Vec<StoreRecord> = state
        .entries()
        .map(|(key, entry)| StoreRecord {
            key: *key,
            place: entry.place,
            tag: entry.tag,
            size: entry.size,
            checksum: entry.checksum,
            time: settings.track_estimated_time.then(|| TimePoint {
                system: info.system_time,
                relative: entry.use_time,
            }),
        })
        .collect();
    for chunk in records.chunks(settings.max_bundled_records as usize) {
        let encoded = if chunk.len() == 1 {
            encode_store(&chunk[0])
        } else {
            encode_multi_store(chunk, settings.track_estimated_time)
        };
        out.write(&encoded).map_err(drop)?;
    }
    out.flush().map_err(drop)?;

    tracing::debug!(
        keys = records.len(),
        till = info.till,
        "compactor wrote fresh binlog"
    );
    Ok(Done {
        path: compact_path,
        read_till: info.till,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::record::encode_multi_remove;
    use crate::key::{Key, PlaceId};
    use tempfile::TempDir;

    fn test_key() -> EncryptionKey {
        EncryptionKey::new(vec![0x77; EncryptionKey::SIZE])
    }

    fn settings() -> Settings {
        Settings::default()
            .max_data_size(100)
            .track_estimated_time(false)
    }

    fn store(n: u64, size: u32) -> StoreRecord {
        StoreRecord {
            key: Key::new(n, n),
            place: PlaceId([n as u8; 7]),
            tag: 0,
            size,
            checksum: n as u32,
            time: None,
        }
    }

    #[test]
    fn test_run_drops_superseded_records() {
        let dir = TempDir::new().unwrap();
        let binlog_path = dir.path().join("binlog");
        let compact_path = dir.path().join("binlog-compact");
        let settings = settings();

        let till = {
            let mut binlog =
                EncryptedFile::open(&binlog_path, Mode::Write, &test_key()).unwrap();
            binlog
                .write(&BasicHeader::new(false, 0).encode())
                .unwrap();
            binlog.write(&encode_store(&store(1, 10))).unwrap();
            binlog.write(&encode_store(&store(2, 20))).unwrap();
            binlog.write(&encode_store(&store(1, 11))).unwrap();
            binlog
                .write(&encode_multi_remove(&[Key::new(2, 2)]))
                .unwrap();
            binlog.size()
        };

        let done = run(Params {
            binlog_path,
            compact_path: compact_path.clone(),
            settings: settings.clone(),
            key: test_key(),
            info: Info {
                till,
                system_time: 0,
                keys_count: 2,
            },
        })
        .unwrap();
        assert_eq!(done.read_till, till);

        // Replaying the compacted file yields only the live entry, excess-free.
        let mut out = EncryptedFile::open(&compact_path, Mode::Read, &test_key()).unwrap();
        let mut header = [0u8; BASIC_HEADER_SIZE];
        out.read(&mut header).unwrap();
        let size = out.size();
        let mut state = State::new();
        let mut reader = BinlogReader::new(&mut out, settings.read_block_size, size);
        while let Some(record) = reader.read_record() {
            assert!(state.apply_record(record, &settings));
        }
        assert!(!reader.failed());
        assert_eq!(state.len(), 1);
        assert_eq!(state.get(&Key::new(1, 1)).unwrap().size, 11);
        assert_eq!(state.excess_length(), 0);
        assert!(size < till);
    }

    #[test]
    fn test_run_rejects_short_snapshot() {
        let dir = TempDir::new().unwrap();
        let binlog_path = dir.path().join("binlog");
        {
            let mut binlog =
                EncryptedFile::open(&binlog_path, Mode::Write, &test_key()).unwrap();
            binlog
                .write(&BasicHeader::new(false, 0).encode())
                .unwrap();
            binlog.write(&encode_store(&store(1, 10))).unwrap();
        }
        let result = run(Params {
            binlog_path,
            compact_path: dir.path().join("binlog-compact"),
            settings: settings(),
            key: test_key(),
            info: Info {
                // Claims more bytes than the file holds.
                till: 10_000,
                system_time: 0,
                keys_count: 1,
            },
        });
        assert!(result.is_err());
    }
}
