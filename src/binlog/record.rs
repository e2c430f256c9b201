use byteorder::{BigEndian, ByteOrder};

use crate::config::BUNDLED_RECORDS_LIMIT;
use crate::index::TimePoint;
use crate::key::{Key, PlaceId, PLACE_ID_SIZE};

// Record discriminators. The basic header only ever appears at offset zero;
// meeting it inside the record stream means a torn or foreign tail.
pub const TYPE_BASIC_HEADER: u8 = 0x01;
pub const TYPE_STORE: u8 = 0x02;
pub const TYPE_STORE_WITH_TIME: u8 = 0x03;
pub const TYPE_MULTI_STORE: u8 = 0x04;
pub const TYPE_MULTI_STORE_WITH_TIME: u8 = 0x05;
pub const TYPE_MULTI_REMOVE: u8 = 0x06;
pub const TYPE_MULTI_ACCESS: u8 = 0x07;

pub const BINLOG_FORMAT: u8 = 0;
pub const FLAG_TRACK_ESTIMATED_TIME: u8 = 0x01;

pub const BASIC_HEADER_SIZE: usize = 8;
pub const KEY_SIZE: usize = 16;
pub const TIME_POINT_SIZE: usize = 16;
pub const STORE_SIZE: usize = 32;
pub const STORE_WITH_TIME_SIZE: usize = STORE_SIZE + TIME_POINT_SIZE;
pub const STORE_PART_SIZE: usize = STORE_SIZE - 1;
pub const STORE_PART_WITH_TIME_SIZE: usize = STORE_WITH_TIME_SIZE - 1;
pub const MULTI_HEADER_SIZE: usize = 4;
pub const MULTI_ACCESS_HEADER_SIZE: usize = MULTI_HEADER_SIZE + TIME_POINT_SIZE;

/// First record of every binlog: format, flags and the wall-clock second the
/// log was created at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BasicHeader {
    pub format: u8,
    pub flags: u8,
    pub system_time: u32,
}

impl BasicHeader {
    pub fn new(track_estimated_time: bool, system_time: u32) -> Self {
        Self {
            format: BINLOG_FORMAT,
            flags: if track_estimated_time {
                FLAG_TRACK_ESTIMATED_TIME
            } else {
                0
            },
            system_time,
        }
    }

    pub fn track_estimated_time(&self) -> bool {
        self.flags & FLAG_TRACK_ESTIMATED_TIME != 0
    }

    pub fn encode(&self) -> [u8; BASIC_HEADER_SIZE] {
        let mut buf = [0u8; BASIC_HEADER_SIZE];
        buf[0] = TYPE_BASIC_HEADER;
        buf[1] = self.format;
        buf[2] = self.flags;
        BigEndian::write_u32(&mut buf[4..8], self.system_time);
        buf
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < BASIC_HEADER_SIZE || data[0] != TYPE_BASIC_HEADER {
            return None;
        }
        Some(Self {
            format: data[1],
            flags: data[2],
            system_time: BigEndian::read_u32(&data[4..8]),
        })
    }
}

/// One stored entry as it appears on the wire, standalone or as a multi-store
/// part.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreRecord {
    pub key: Key,
    pub place: PlaceId,
    pub tag: u8,
    pub size: u32,
    pub checksum: u32,
    pub time: Option<TimePoint>,
}

/// A parsed binlog record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Store(StoreRecord),
    MultiStore(Vec<StoreRecord>),
    MultiRemove(Vec<Key>),
    MultiAccess(TimePoint, Vec<Key>),
}

/// Outcome of probing the leading bytes of the stream for a record size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeProbe {
    /// Not enough bytes yet to tell.
    Unknown,
    /// The bytes cannot be a valid record; reading must stop here.
    Invalid,
    /// The record occupies exactly this many bytes.
    Size(usize),
}

/// Determines the full encoded size of the record starting at `data[0]`.
pub fn probe_record_size(data: &[u8]) -> SizeProbe {
    if data.is_empty() {
        return SizeProbe::Unknown;
    }
    let multi = |part_size: usize, header_size: usize, allow_empty: bool| {
        if data.len() < MULTI_HEADER_SIZE {
            return SizeProbe::Unknown;
        }
        let count = BigEndian::read_u24(&data[1..4]);
        let valid = count < BUNDLED_RECORDS_LIMIT && (allow_empty || count > 0);
        if !valid {
            return SizeProbe::Invalid;
        }
        SizeProbe::Size(header_size + count as usize * part_size)
    };
    match data[0] {
        TYPE_STORE => SizeProbe::Size(STORE_SIZE),
        TYPE_STORE_WITH_TIME => SizeProbe::Size(STORE_WITH_TIME_SIZE),
        TYPE_MULTI_STORE => multi(STORE_PART_SIZE, MULTI_HEADER_SIZE, false),
        TYPE_MULTI_STORE_WITH_TIME => multi(STORE_PART_WITH_TIME_SIZE, MULTI_HEADER_SIZE, false),
        TYPE_MULTI_REMOVE => multi(KEY_SIZE, MULTI_HEADER_SIZE, false),
        // An empty access block is legal: it materializes a time point.
        TYPE_MULTI_ACCESS => multi(KEY_SIZE, MULTI_ACCESS_HEADER_SIZE, true),
        _ => SizeProbe::Invalid,
    }
}

/// Decodes a record from a slice whose length was established by
/// [`probe_record_size`].
pub fn decode_record(data: &[u8]) -> Option<Record> {
    match probe_record_size(data) {
        SizeProbe::Size(size) if size == data.len() => {}
        _ => return None,
    }
    match data[0] {
        TYPE_STORE => Some(Record::Store(decode_store_body(&data[1..], false))),
        TYPE_STORE_WITH_TIME => Some(Record::Store(decode_store_body(&data[1..], true))),
        TYPE_MULTI_STORE => Some(Record::MultiStore(decode_store_parts(
            &data[MULTI_HEADER_SIZE..],
            STORE_PART_SIZE,
            false,
        ))),
        TYPE_MULTI_STORE_WITH_TIME => Some(Record::MultiStore(decode_store_parts(
            &data[MULTI_HEADER_SIZE..],
            STORE_PART_WITH_TIME_SIZE,
            true,
        ))),
        TYPE_MULTI_REMOVE => Some(Record::MultiRemove(decode_keys(&data[MULTI_HEADER_SIZE..]))),
        TYPE_MULTI_ACCESS => {
            let time = decode_time_point(&data[MULTI_HEADER_SIZE..]);
            Some(Record::MultiAccess(
                time,
                decode_keys(&data[MULTI_ACCESS_HEADER_SIZE..]),
            ))
        }
        _ => None,
    }
}

pub fn encode_store(record: &StoreRecord) -> Vec<u8> {
    let with_time = record.time.is_some();
    let mut buf = vec![
        0u8;
        if with_time {
            STORE_WITH_TIME_SIZE
        } else {
            STORE_SIZE
        }
    ];
    buf[0] = if with_time {
        TYPE_STORE_WITH_TIME
    } else {
        TYPE_STORE
    };
    encode_store_body(&mut buf[1..], record);
    buf
}

/// Bundles store records into one multi-record. `with_time` must match the
/// presence of time points on every part.
pub fn encode_multi_store(records: &[StoreRecord], with_time: bool) -> Vec<u8> {
    debug_assert!(records.iter().all(|r| r.time.is_some() == with_time));
    let part_size = if with_time {
        STORE_PART_WITH_TIME_SIZE
    } else {
        STORE_PART_SIZE
    };
    let mut buf = vec![0u8; MULTI_HEADER_SIZE + records.len() * part_size];
    buf[0] = if with_time {
        TYPE_MULTI_STORE_WITH_TIME
    } else {
        TYPE_MULTI_STORE
    };
    BigEndian::write_u24(&mut buf[1..4], records.len() as u32);
    for (i, record) in records.iter().enumerate() {
        let at = MULTI_HEADER_SIZE + i * part_size;
        encode_store_body(&mut buf[at..at + part_size], record);
    }
    buf
}

pub fn encode_multi_remove(keys: &[Key]) -> Vec<u8> {
    let mut buf = vec![0u8; MULTI_HEADER_SIZE + keys.len() * KEY_SIZE];
    buf[0] = TYPE_MULTI_REMOVE;
    BigEndian::write_u24(&mut buf[1..4], keys.len() as u32);
    encode_keys(&mut buf[MULTI_HEADER_SIZE..], keys);
    buf
}

pub fn encode_multi_access(time: TimePoint, keys: &[Key]) -> Vec<u8> {
    let mut buf = vec![0u8; MULTI_ACCESS_HEADER_SIZE + keys.len() * KEY_SIZE];
    buf[0] = TYPE_MULTI_ACCESS;
    BigEndian::write_u24(&mut buf[1..4], keys.len() as u32);
    encode_time_point(&mut buf[MULTI_HEADER_SIZE..MULTI_ACCESS_HEADER_SIZE], time);
    encode_keys(&mut buf[MULTI_ACCESS_HEADER_SIZE..], keys);
    buf
}

/// The encoded size of a standalone store record under the given time mode.
pub fn store_record_size(with_time: bool) -> usize {
    if with_time {
        STORE_WITH_TIME_SIZE
    } else {
        STORE_SIZE
    }
}

fn encode_store_body(buf: &mut [u8], record: &StoreRecord) {
    buf[0] = record.tag;
    buf[1..1 + PLACE_ID_SIZE].copy_from_slice(&record.place.0);
    BigEndian::write_u24(&mut buf[8..11], record.size);
    BigEndian::write_u32(&mut buf[11..15], record.checksum);
    encode_key(&mut buf[15..15 + KEY_SIZE], record.key);
    if let Some(time) = record.time {
        encode_time_point(&mut buf[31..31 + TIME_POINT_SIZE], time);
    }
}

fn decode_store_body(buf: &[u8], with_time: bool) -> StoreRecord {
    let mut place = [0u8; PLACE_ID_SIZE];
    place.copy_from_slice(&buf[1..1 + PLACE_ID_SIZE]);
    StoreRecord {
        tag: buf[0],
        place: PlaceId(place),
        size: BigEndian::read_u24(&buf[8..11]),
        checksum: BigEndian::read_u32(&buf[11..15]),
        key: decode_key(&buf[15..15 + KEY_SIZE]),
        time: with_time.then(|| decode_time_point(&buf[31..31 + TIME_POINT_SIZE])),
    }
}

fn decode_store_parts(buf: &[u8], part_size: usize, with_time: bool) -> Vec<StoreRecord> {
    buf.chunks_exact(part_size)
        .map(|part| decode_store_body(part, with_time))
        .collect()
}

fn encode_key(buf: &mut [u8], key: Key) {
    BigEndian::write_u64(&mut buf[0..8], key.high);
    BigEndian::write_u64(&mut buf[8..16], key.low);
}

fn decode_key(buf: &[u8]) -> Key {
    Key {
        high: BigEndian::read_u64(&buf[0..8]),
        low: BigEndian::read_u64(&buf[8..16]),
    }
}

fn encode_keys(buf: &mut [u8], keys: &[Key]) {
    for (i, key) in keys.iter().enumerate() {
        encode_key(&mut buf[i * KEY_SIZE..(i + 1) * KEY_SIZE], *key);
    }
}

fn decode_keys(buf: &[u8]) -> Vec<Key> {
    buf.chunks_exact(KEY_SIZE).map(decode_key).collect()
}

fn encode_time_point(buf: &mut [u8], time: TimePoint) {
    BigEndian::write_u64(&mut buf[0..8], time.relative);
    BigEndian::write_u32(&mut buf[8..12], time.system);
}

fn decode_time_point(buf: &[u8]) -> TimePoint {
    TimePoint {
        relative: BigEndian::read_u64(&buf[0..8]),
        system: BigEndian::read_u32(&buf[8..12]),
    }
}
