use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::binlog::record::{
    store_record_size, Record, StoreRecord, KEY_SIZE, MULTI_ACCESS_HEADER_SIZE, MULTI_HEADER_SIZE,
};
use crate::config::Settings;
use crate::key::{Key, PlaceId};

/// Wall-clock seconds source. Injected so the time-limit behavior is
/// testable; production code uses [`SystemClock`].
pub trait Clock: Send + Sync {
    /// Current unix time in seconds, never below 1.
    fn unixtime(&self) -> u32;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unixtime(&self) -> u32 {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        seconds.clamp(1, u64::from(u32::MAX)) as u32
    }
}

/// A persisted pair of wall clock and monotonic relative counter. The
/// relative half only ever moves forward, so LRU ordering survives wall-clock
/// jumps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimePoint {
    pub system: u32,
    pub relative: u64,
}

/// One live cache entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub place: PlaceId,
    pub tag: u8,
    pub checksum: u32,
    pub size: u32,
    pub use_time: u64,
}

/// The in-memory index: key map plus the aggregates the pruning and
/// compaction decisions read, kept exact on every mutation.
///
/// Also the replay target: both the database open path and the compactor
/// rebuild a `State` by feeding binlog records through [`apply_record`].
#[derive(Debug, Default)]
pub(crate) struct State {
    map: HashMap<Key, Entry>,
    total_size: i64,
    minimal_entry_time: u64,
    entries_with_minimal_time_count: usize,
    excess_length: i64,
    pub time: TimePoint,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: &Key) -> Option<&Entry> {
        self.map.get(key)
    }

    pub fn reserve(&mut self, additional: usize) {
        self.map.reserve(additional);
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Key, &Entry)> {
        self.map.iter()
    }

    pub fn total_size(&self) -> i64 {
        self.total_size
    }

    pub fn minimal_entry_time(&self) -> u64 {
        self.minimal_entry_time
    }

    #[cfg(test)]
    pub fn entries_with_minimal_time_count(&self) -> usize {
        self.entries_with_minimal_time_count
    }

    pub fn excess_length(&self) -> i64 {
        self.excess_length
    }

    pub fn add_excess(&mut self, bytes: i64) {
        self.excess_length += bytes;
    }

    pub fn sub_excess(&mut self, bytes: i64) {
        self.excess_length -= bytes;
        debug_assert!(self.excess_length >= 0);
        if self.excess_length < 0 {
            self.excess_length = 0;
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// The relative reading for "now": persisted relative plus the observed
    /// forward wall-clock delta.
    pub fn current_relative(&self, now: u32) -> u64 {
        let delta = i64::from(now) - i64::from(self.time.system);
        self.time.relative + delta.max(0) as u64
    }

    pub fn count_time_point(&self, now: u32) -> TimePoint {
        TimePoint {
            system: now,
            relative: self.current_relative(now),
        }
    }

    /// Advances the stored time point, never backwards.
    pub fn apply_time_point(&mut self, time: TimePoint) {
        if time.relative > self.time.relative {
            self.time = time;
        }
    }

    /// Inserts or replaces an entry, maintaining the aggregates. Replacing
    /// marks the superseded store record as excess.
    pub fn set_entry(&mut self, key: Key, entry: Entry, track_estimated_time: bool) {
        let already = self.map.get(&key).copied().unwrap_or_default();
        self.total_size += i64::from(entry.size) - i64::from(already.size);
        if already.size != 0 {
            self.excess_length += store_record_size(track_estimated_time) as i64;
        }

        if entry.use_time != 0
            && (self.minimal_entry_time == 0 || entry.use_time < self.minimal_entry_time)
        {
            self.minimal_entry_time = entry.use_time;
            self.entries_with_minimal_time_count = 1;
        } else if self.minimal_entry_time != 0 && already.use_time != entry.use_time {
            if entry.use_time == self.minimal_entry_time {
                self.entries_with_minimal_time_count += 1;
            } else if already.use_time == self.minimal_entry_time {
                self.drop_from_minimal_bucket();
            }
        }
        self.map.insert(key, entry);
    }

    /// Removes an entry, maintaining the aggregates.
    pub fn erase(&mut self, key: &Key) -> Option<Entry> {
        let entry = self.map.remove(key)?;
        self.total_size -= i64::from(entry.size);
        if self.minimal_entry_time != 0 && entry.use_time == self.minimal_entry_time {
            self.drop_from_minimal_bucket();
        }
        Some(entry)
    }

    /// Bumps an entry's use time to `relative` (from an access).
    pub fn touch(&mut self, key: &Key, relative: u64) {
        let Some(entry) = self.map.get_mut(key) else {
            return;
        };
        let already = entry.use_time;
        if already == relative {
            return;
        }
        entry.use_time = relative;

        if relative != 0 && (self.minimal_entry_time == 0 || relative < self.minimal_entry_time) {
            self.minimal_entry_time = relative;
            self.entries_with_minimal_time_count = 1;
        } else if self.minimal_entry_time != 0 {
            if relative == self.minimal_entry_time {
                self.entries_with_minimal_time_count += 1;
            } else if already == self.minimal_entry_time {
                self.drop_from_minimal_bucket();
            }
        }
    }

    fn drop_from_minimal_bucket(&mut self) {
        debug_assert!(self.entries_with_minimal_time_count > 0);
        self.entries_with_minimal_time_count =
            self.entries_with_minimal_time_count.saturating_sub(1);
        if self.entries_with_minimal_time_count == 0 {
            self.recompute_minimal_time();
        }
    }

    fn recompute_minimal_time(&mut self) {
        self.minimal_entry_time = 0;
        self.entries_with_minimal_time_count = 0;
        for entry in self.map.values() {
            if entry.use_time == 0 {
                continue;
            }
            if self.minimal_entry_time == 0 || entry.use_time < self.minimal_entry_time {
                self.minimal_entry_time = entry.use_time;
                self.entries_with_minimal_time_count = 1;
            } else if entry.use_time == self.minimal_entry_time {
                self.entries_with_minimal_time_count += 1;
            }
        }
    }

    /// Applies one replayed record. Returns false when the record is invalid
    /// for this store's settings, which halts replay at its boundary.
    pub fn apply_record(&mut self, record: Record, settings: &Settings) -> bool {
        match record {
            Record::Store(store) => self.apply_store(&store, settings),
            Record::MultiStore(stores) => stores
                .iter()
                .all(|store| self.apply_store(store, settings)),
            Record::MultiRemove(keys) => {
                self.excess_length += (MULTI_HEADER_SIZE + keys.len() * KEY_SIZE) as i64;
                for key in &keys {
                    self.erase(key);
                }
                true
            }
            Record::MultiAccess(time, keys) => {
                if !settings.track_estimated_time {
                    return false;
                }
                self.apply_time_point(time);
                let relative = self.time.relative;
                self.excess_length +=
                    (MULTI_ACCESS_HEADER_SIZE + keys.len() * KEY_SIZE) as i64;
                for key in &keys {
                    // Accesses of keys removed since are simply dropped.
                    self.touch(key, relative);
                }
                true
            }
        }
    }

    pub fn apply_store(&mut self, record: &StoreRecord, settings: &Settings) -> bool {
        if record.time.is_some() != settings.track_estimated_time {
            return false;
        }
        if record.size == 0 || record.size > settings.max_data_size {
            return false;
        }
        let use_time = match record.time {
            Some(time) => {
                self.apply_time_point(time);
                time.relative
            }
            None => self.time.relative,
        };
        self.set_entry(
            record.key,
            Entry {
                place: record.place,
                tag: record.tag,
                checksum: record.checksum,
                size: record.size,
                use_time,
            },
            settings.track_estimated_time,
        );
        true
    }

    /// Stages every entry at or before `before` into `stale`, recomputing the
    /// minimal-time aggregates from the survivors.
    pub fn collect_time_prune(
        &mut self,
        settings: &Settings,
        before: u64,
        stale: &mut BTreeSet<Key>,
        stale_total_size: &mut i64,
    ) {
        if settings.total_time_limit == 0 {
            return;
        }
        if self.minimal_entry_time == 0 || self.minimal_entry_time > before {
            return;
        }
        self.minimal_entry_time = 0;
        self.entries_with_minimal_time_count = 0;
        for (key, entry) in &self.map {
            if entry.use_time <= before {
                stale.insert(*key);
                *stale_total_size += i64::from(entry.size);
            } else if self.minimal_entry_time == 0 || self.minimal_entry_time > entry.use_time {
                self.minimal_entry_time = entry.use_time;
                self.entries_with_minimal_time_count = 1;
            } else if self.minimal_entry_time == entry.use_time {
                self.entries_with_minimal_time_count += 1;
            }
        }
    }

    /// Greedily stages least-recently-used entries until what remains fits
    /// under the size limit. Keeps a bounded bag ordered by use time,
    /// evicting its newest members whenever older candidates still release
    /// enough bytes.
    pub fn collect_size_prune(
        &self,
        settings: &Settings,
        stale: &mut BTreeSet<Key>,
        stale_total_size: &mut i64,
    ) {
        let remove_size = if settings.total_size_limit > 0 {
            self.total_size - *stale_total_size - settings.total_size_limit
        } else {
            0
        };
        if remove_size <= 0 {
            return;
        }

        let mut oldest: BTreeMap<(u64, Key), i64> = BTreeMap::new();
        let mut oldest_total_size: i64 = 0;

        for (key, entry) in &self.map {
            if stale.contains(key) {
                continue;
            }
            let newest = oldest.last_key_value().map(|((time, _), _)| *time);
            let add = oldest_total_size < remove_size
                || newest.map_or(false, |time| entry.use_time < time);
            if !add {
                continue;
            }
            while let Some((&(newest_time, newest_key), &newest_size)) = oldest.last_key_value() {
                let still_enough = oldest_total_size + i64::from(entry.size) - remove_size
                    >= newest_size;
                if entry.use_time > newest_time || !still_enough {
                    break;
                }
                oldest.remove(&(newest_time, newest_key));
                oldest_total_size -= newest_size;
            }
            oldest_total_size += i64::from(entry.size);
            oldest.insert((entry.use_time, *key), i64::from(entry.size));
        }

        for (_, key) in oldest.keys() {
            stale.insert(*key);
        }
        *stale_total_size += oldest_total_size;
    }

    /// Debug-only full consistency check of the aggregates against the map.
    #[cfg(test)]
    pub fn assert_aggregates(&self) {
        let total: i64 = self.map.values().map(|e| i64::from(e.size)).sum();
        assert_eq!(self.total_size, total);
        let minimal = self
            .map
            .values()
            .filter(|e| e.use_time != 0)
            .map(|e| e.use_time)
            .min()
            .unwrap_or(0);
        assert_eq!(self.minimal_entry_time, minimal);
        if minimal != 0 {
            let count = self
                .map
                .values()
                .filter(|e| e.use_time == minimal)
                .count();
            assert_eq!(self.entries_with_minimal_time_count, count);
        }
        assert!(self.excess_length >= 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::record::{STORE_SIZE, STORE_WITH_TIME_SIZE};

    fn entry(size: u32, use_time: u64) -> Entry {
        Entry {
            place: PlaceId([0; 7]),
            tag: 0,
            checksum: 0,
            size,
            use_time,
        }
    }

    fn tracked() -> Settings {
        Settings::default().max_data_size(100).track_estimated_time(true)
    }

    #[test]
    fn test_total_size_tracks_set_and_erase() {
        let mut state = State::new();
        state.set_entry(Key::new(1, 1), entry(10, 5), true);
        state.set_entry(Key::new(2, 2), entry(20, 6), true);
        assert_eq!(state.total_size(), 30);
        state.assert_aggregates();

        // Overwrite shrinks and marks the old record superseded.
        state.set_entry(Key::new(2, 2), entry(5, 7), true);
        assert_eq!(state.total_size(), 15);
        assert_eq!(state.excess_length(), STORE_WITH_TIME_SIZE as i64);
        state.assert_aggregates();

        state.erase(&Key::new(1, 1));
        assert_eq!(state.total_size(), 5);
        state.assert_aggregates();
    }

    #[test]
    fn test_minimal_time_bucket_maintained() {
        let mut state = State::new();
        state.set_entry(Key::new(1, 0), entry(1, 10), true);
        state.set_entry(Key::new(2, 0), entry(1, 10), true);
        state.set_entry(Key::new(3, 0), entry(1, 20), true);
        assert_eq!(state.minimal_entry_time(), 10);
        assert_eq!(state.entries_with_minimal_time_count(), 2);

        // Bump one of the two minimal entries: bucket shrinks.
        state.touch(&Key::new(1, 0), 30);
        assert_eq!(state.minimal_entry_time(), 10);
        assert_eq!(state.entries_with_minimal_time_count(), 1);
        state.assert_aggregates();

        // Bump the last one: the minimum must be recomputed.
        state.touch(&Key::new(2, 0), 25);
        assert_eq!(state.minimal_entry_time(), 20);
        assert_eq!(state.entries_with_minimal_time_count(), 1);
        state.assert_aggregates();

        state.erase(&Key::new(3, 0));
        assert_eq!(state.minimal_entry_time(), 25);
        state.assert_aggregates();

        state.erase(&Key::new(2, 0));
        state.erase(&Key::new(1, 0));
        assert_eq!(state.minimal_entry_time(), 0);
        state.assert_aggregates();
    }

    #[test]
    fn test_relative_time_ignores_backward_jumps() {
        let mut state = State::new();
        state.time = TimePoint {
            system: 1000,
            relative: 1000,
        };
        assert_eq!(state.current_relative(1010), 1010);
        // Wall clock jumped back: relative holds.
        assert_eq!(state.current_relative(900), 1000);

        state.apply_time_point(TimePoint {
            system: 900,
            relative: 1500,
        });
        assert_eq!(state.time.relative, 1500);
        // Older time points never rewind it.
        state.apply_time_point(TimePoint {
            system: 2000,
            relative: 100,
        });
        assert_eq!(state.time.relative, 1500);
    }

    #[test]
    fn test_apply_store_validates_size_and_mode() {
        let settings = tracked();
        let mut state = State::new();
        let mut record = StoreRecord {
            key: Key::new(1, 1),
            place: PlaceId([1; 7]),
            tag: 0,
            size: 10,
            checksum: 7,
            time: Some(TimePoint {
                system: 1,
                relative: 5,
            }),
        };
        assert!(state.apply_store(&record, &settings));
        assert_eq!(state.get(&Key::new(1, 1)).unwrap().use_time, 5);

        record.size = 0;
        assert!(!state.apply_store(&record, &settings));
        record.size = 101;
        assert!(!state.apply_store(&record, &settings));

        // A time-stamped record in an untracked store is foreign.
        record.size = 10;
        let untracked = Settings::default().max_data_size(100).track_estimated_time(false);
        assert!(!state.apply_store(&record, &untracked));
        record.time = None;
        assert!(state.apply_store(&record, &untracked));
    }

    #[test]
    fn test_apply_remove_and_access_count_excess() {
        let settings = tracked();
        let mut state = State::new();
        let store = StoreRecord {
            key: Key::new(1, 1),
            place: PlaceId([1; 7]),
            tag: 0,
            size: 10,
            checksum: 7,
            time: Some(TimePoint {
                system: 1,
                relative: 5,
            }),
        };
        assert!(state.apply_record(Record::Store(store), &settings));
        assert_eq!(state.excess_length(), 0);

        assert!(state.apply_record(
            Record::MultiAccess(
                TimePoint {
                    system: 2,
                    relative: 9
                },
                vec![Key::new(1, 1), Key::new(9, 9)]
            ),
            &settings
        ));
        assert_eq!(state.get(&Key::new(1, 1)).unwrap().use_time, 9);
        assert_eq!(
            state.excess_length(),
            (MULTI_ACCESS_HEADER_SIZE + 2 * KEY_SIZE) as i64
        );

        let before = state.excess_length();
        assert!(state.apply_record(Record::MultiRemove(vec![Key::new(1, 1)]), &settings));
        assert!(state.get(&Key::new(1, 1)).is_none());
        assert_eq!(
            state.excess_length(),
            before + (MULTI_HEADER_SIZE + KEY_SIZE) as i64
        );
        state.assert_aggregates();
    }

    #[test]
    fn test_replay_overwrite_counts_excess() {
        let settings = Settings::default().max_data_size(100).track_estimated_time(false);
        let mut state = State::new();
        let mut store = StoreRecord {
            key: Key::new(1, 1),
            place: PlaceId([1; 7]),
            tag: 0,
            size: 10,
            checksum: 7,
            time: None,
        };
        assert!(state.apply_record(Record::Store(store), &settings));
        store.size = 12;
        assert!(state.apply_record(Record::Store(store), &settings));
        assert_eq!(state.excess_length(), STORE_SIZE as i64);
        assert_eq!(state.total_size(), 12);
    }

    #[test]
    fn test_collect_time_prune_stages_old_entries() {
        let settings = tracked().total_time_limit(60);
        let mut state = State::new();
        state.set_entry(Key::new(1, 0), entry(10, 5), true);
        state.set_entry(Key::new(2, 0), entry(10, 50), true);
        state.set_entry(Key::new(3, 0), entry(10, 100), true);

        let mut stale = BTreeSet::new();
        let mut stale_size = 0;
        state.collect_time_prune(&settings, 50, &mut stale, &mut stale_size);
        assert_eq!(
            stale.into_iter().collect::<Vec<_>>(),
            vec![Key::new(1, 0), Key::new(2, 0)]
        );
        assert_eq!(stale_size, 20);
        // Aggregates now describe the survivors.
        assert_eq!(state.minimal_entry_time(), 100);
    }

    #[test]
    fn test_collect_size_prune_picks_oldest() {
        let settings = tracked().max_data_size(8).total_size_limit(10);
        let mut state = State::new();
        state.set_entry(Key::new(1, 0), entry(5, 30), true);
        state.set_entry(Key::new(2, 0), entry(5, 10), true);
        state.set_entry(Key::new(3, 0), entry(5, 20), true);

        let mut stale = BTreeSet::new();
        let mut stale_size = 0;
        state.collect_size_prune(&settings, &mut stale, &mut stale_size);
        // 15 total, limit 10: releasing the single oldest entry suffices.
        assert_eq!(stale.into_iter().collect::<Vec<_>>(), vec![Key::new(2, 0)]);
        assert_eq!(stale_size, 5);
    }

    #[test]
    fn test_collect_size_prune_disabled_without_limit() {
        let settings = tracked();
        let mut state = State::new();
        state.set_entry(Key::new(1, 0), entry(50, 1), true);

        let mut stale = BTreeSet::new();
        let mut stale_size = 0;
        state.collect_size_prune(&settings, &mut stale, &mut stale_size);
        assert!(stale.is_empty());
    }
}
