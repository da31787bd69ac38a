//! Durable round-trip of the controller state across power cycles.
//!
//! The primary store holds a fixed-layout, checksummed binary record; a
//! secondary human-readable mirror (the serde projection of
//! `ControllerState`) is written best-effort and consulted only when the
//! primary record fails validation. An older schema generation without the
//! solar-schedule and timezone fields is detected and migrated in memory.

use serde::{Deserialize, Serialize};

use crate::config::{ControllerState, ShutterConfig};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Fixed-size random-access persistent region (EEPROM-style on hardware,
/// a file on the host).
pub trait ByteStore {
    fn read(&mut self) -> Result<Vec<u8>, StoreError>;
    fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError>;
}

/// File-like store for the human-readable fallback projection.
pub trait MirrorStore {
    fn read(&mut self) -> Result<Option<String>, StoreError>;
    fn write(&mut self, text: &str) -> Result<(), StoreError>;
}

const RECORD_MAGIC: u32 = 0x5348_5452; // "SHTR"
const SCHEMA_CURRENT: u16 = 2;
const SCHEMA_LEGACY: u16 = 1;

const REPO_FIELD_LEN: usize = 64;
const ASSET_FIELD_LEN: usize = 48;
const TIMEZONE_FIELD_LEN: usize = 48;

/// Header (magic + version + declared length) stays at fixed offsets across
/// schema generations so old layouts are recognized before interpretation.
const HEADER_LEN: usize = 8;
const CHECKSUM_LEN: usize = 4;

const RECORD_CURRENT_LEN: usize = HEADER_LEN
    + 4 // travel_steps
    + 4 // current_position
    + 1 // flags
    + 2 // coil_hold_ms
    + 4 // max_speed
    + 4 // acceleration
    + 4 // top_overdrive_percent
    + 8 // latitude
    + 8 // longitude
    + 2 // sunrise_offset_minutes
    + 2 // sunset_offset_minutes
    + 4 // sunrise_target_percent
    + 4 // sunset_target_percent
    + REPO_FIELD_LEN
    + ASSET_FIELD_LEN
    + ASSET_FIELD_LEN
    + TIMEZONE_FIELD_LEN
    + CHECKSUM_LEN;

const RECORD_LEGACY_LEN: usize = HEADER_LEN
    + 4
    + 4
    + 1
    + 2
    + 4
    + 4
    + 4
    + REPO_FIELD_LEN
    + ASSET_FIELD_LEN
    + ASSET_FIELD_LEN
    + CHECKSUM_LEN;

const FLAG_CALIBRATED: u8 = 1 << 0;
const FLAG_REVERSE: u8 = 1 << 1;
const FLAG_OVERDRIVE: u8 = 1 << 2;
const FLAG_SUN_SCHEDULE: u8 = 1 << 3;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Fixed-width string field: capped on a char boundary to leave room
    /// for the NUL terminator, zero-padded to the field width.
    fn put_str(&mut self, value: &str, width: usize) {
        let capped = truncate_on_char_boundary(value, width - 1);
        self.buf.extend_from_slice(capped.as_bytes());
        self.buf.resize(self.buf.len() + width - capped.len(), 0);
    }

    fn finish(mut self) -> Vec<u8> {
        let checksum = fnv1a_32(&self.buf);
        self.put_u32(checksum);
        self.buf
    }
}

struct RecordReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> RecordReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let slice = self.bytes.get(self.offset..self.offset + N)?;
        self.offset += N;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Some(out)
    }

    fn get_u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|b| b[0])
    }

    fn get_u16(&mut self) -> Option<u16> {
        self.take::<2>().map(u16::from_le_bytes)
    }

    fn get_i16(&mut self) -> Option<i16> {
        self.take::<2>().map(i16::from_le_bytes)
    }

    fn get_u32(&mut self) -> Option<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    fn get_i32(&mut self) -> Option<i32> {
        self.take::<4>().map(i32::from_le_bytes)
    }

    fn get_f32(&mut self) -> Option<f32> {
        self.take::<4>().map(f32::from_le_bytes)
    }

    fn get_f64(&mut self) -> Option<f64> {
        self.take::<8>().map(f64::from_le_bytes)
    }

    /// Reads a fixed-width field up to its first NUL; never reads past the
    /// declared width.
    fn get_str(&mut self, width: usize) -> Option<String> {
        let slice = self.bytes.get(self.offset..self.offset + width)?;
        self.offset += width;
        let end = slice.iter().position(|b| *b == 0).unwrap_or(width);
        Some(String::from_utf8_lossy(&slice[..end]).into_owned())
    }
}

fn truncate_on_char_boundary(value: &str, max_len: usize) -> &str {
    if value.len() <= max_len {
        return value;
    }
    let mut end = max_len;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

fn pack_flags(state: &ControllerState) -> u8 {
    let mut flags = 0u8;
    if state.calibrated {
        flags |= FLAG_CALIBRATED;
    }
    if state.reverse_direction {
        flags |= FLAG_REVERSE;
    }
    if state.top_overdrive_enabled {
        flags |= FLAG_OVERDRIVE;
    }
    if state.sun_schedule_enabled {
        flags |= FLAG_SUN_SCHEDULE;
    }
    flags
}

fn encode_current(state: &ControllerState) -> Vec<u8> {
    let mut writer = RecordWriter::new(RECORD_CURRENT_LEN);
    writer.put_u32(RECORD_MAGIC);
    writer.put_u16(SCHEMA_CURRENT);
    writer.put_u16(RECORD_CURRENT_LEN as u16);
    writer.put_i32(state.travel_steps);
    writer.put_i32(state.current_position);
    writer.put_u8(pack_flags(state));
    writer.put_u16(state.coil_hold_ms);
    writer.put_f32(state.max_speed);
    writer.put_f32(state.acceleration);
    writer.put_f32(state.top_overdrive_percent);
    writer.put_f64(state.latitude);
    writer.put_f64(state.longitude);
    writer.put_i16(state.sunrise_offset_minutes);
    writer.put_i16(state.sunset_offset_minutes);
    writer.put_f32(state.sunrise_target_percent);
    writer.put_f32(state.sunset_target_percent);
    writer.put_str(&state.firmware_repo, REPO_FIELD_LEN);
    writer.put_str(&state.firmware_asset_name, ASSET_FIELD_LEN);
    writer.put_str(&state.firmware_fs_asset_name, ASSET_FIELD_LEN);
    writer.put_str(&state.timezone, TIMEZONE_FIELD_LEN);
    writer.finish()
}

/// Validates magic, schema version, declared length, and checksum before a
/// single payload field is interpreted.
fn validate_record(bytes: &[u8], expected_version: u16, expected_len: usize) -> bool {
    if bytes.len() < expected_len {
        return false;
    }
    let record = &bytes[..expected_len];
    let mut reader = RecordReader::new(record);
    let header_ok = reader.get_u32() == Some(RECORD_MAGIC)
        && reader.get_u16() == Some(expected_version)
        && reader.get_u16() == Some(expected_len as u16);
    if !header_ok {
        return false;
    }
    let body = &record[..expected_len - CHECKSUM_LEN];
    let stored = &record[expected_len - CHECKSUM_LEN..];
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(stored);
    fnv1a_32(body) == u32::from_le_bytes(checksum)
}

fn decode_current(bytes: &[u8]) -> Option<ControllerState> {
    if !validate_record(bytes, SCHEMA_CURRENT, RECORD_CURRENT_LEN) {
        return None;
    }
    let mut reader = RecordReader::new(bytes);
    reader.offset = HEADER_LEN;

    let mut state = ControllerState::default();
    state.travel_steps = reader.get_i32()?;
    state.current_position = reader.get_i32()?;
    let flags = reader.get_u8()?;
    state.calibrated = flags & FLAG_CALIBRATED != 0;
    state.reverse_direction = flags & FLAG_REVERSE != 0;
    state.top_overdrive_enabled = flags & FLAG_OVERDRIVE != 0;
    state.sun_schedule_enabled = flags & FLAG_SUN_SCHEDULE != 0;
    state.coil_hold_ms = reader.get_u16()?;
    state.max_speed = reader.get_f32()?;
    state.acceleration = reader.get_f32()?;
    state.top_overdrive_percent = reader.get_f32()?;
    state.latitude = reader.get_f64()?;
    state.longitude = reader.get_f64()?;
    state.sunrise_offset_minutes = reader.get_i16()?;
    state.sunset_offset_minutes = reader.get_i16()?;
    state.sunrise_target_percent = reader.get_f32()?;
    state.sunset_target_percent = reader.get_f32()?;
    state.firmware_repo = reader.get_str(REPO_FIELD_LEN)?;
    state.firmware_asset_name = reader.get_str(ASSET_FIELD_LEN)?;
    state.firmware_fs_asset_name = reader.get_str(ASSET_FIELD_LEN)?;
    state.timezone = reader.get_str(TIMEZONE_FIELD_LEN)?;
    Some(state)
}

/// Schema v1 predates the solar schedule and timezone fields; those stay
/// at their defaults after migration.
fn decode_legacy(bytes: &[u8]) -> Option<ControllerState> {
    if !validate_record(bytes, SCHEMA_LEGACY, RECORD_LEGACY_LEN) {
        return None;
    }
    let mut reader = RecordReader::new(bytes);
    reader.offset = HEADER_LEN;

    let mut state = ControllerState::default();
    state.travel_steps = reader.get_i32()?;
    state.current_position = reader.get_i32()?;
    let flags = reader.get_u8()?;
    state.calibrated = flags & FLAG_CALIBRATED != 0;
    state.reverse_direction = flags & FLAG_REVERSE != 0;
    state.top_overdrive_enabled = flags & FLAG_OVERDRIVE != 0;
    state.sun_schedule_enabled = false;
    state.coil_hold_ms = reader.get_u16()?;
    state.max_speed = reader.get_f32()?;
    state.acceleration = reader.get_f32()?;
    state.top_overdrive_percent = reader.get_f32()?;
    state.firmware_repo = reader.get_str(REPO_FIELD_LEN)?;
    state.firmware_asset_name = reader.get_str(ASSET_FIELD_LEN)?;
    state.firmware_fs_asset_name = reader.get_str(ASSET_FIELD_LEN)?;
    Some(state)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadSource {
    Current,
    Migrated,
    MirrorFallback,
    Defaults,
}

pub struct StateStore {
    primary: Box<dyn ByteStore + Send>,
    mirror: Option<Box<dyn MirrorStore + Send>>,
    save_interval_ms: u64,
    last_save_ms: u64,
    last_saved_position: Option<i32>,
}

impl StateStore {
    pub fn new(
        primary: Box<dyn ByteStore + Send>,
        mirror: Option<Box<dyn MirrorStore + Send>>,
        save_interval_ms: u64,
    ) -> Self {
        Self {
            primary,
            mirror,
            save_interval_ms,
            last_save_ms: 0,
            last_saved_position: None,
        }
    }

    /// Fallback chain: current schema, then legacy schema with in-memory
    /// migration, then the mirror, then defaults. Never fails; corruption
    /// is recovered from locally.
    pub fn load(&mut self, cfg: &ShutterConfig) -> (ControllerState, LoadSource) {
        if let Ok(bytes) = self.primary.read() {
            if let Some(mut state) = decode_current(&bytes) {
                state.sanitize(cfg);
                return (state, LoadSource::Current);
            }
            if let Some(mut state) = decode_legacy(&bytes) {
                state.sanitize(cfg);
                return (state, LoadSource::Migrated);
            }
        }
        if let Some(mirror) = self.mirror.as_mut() {
            if let Ok(Some(text)) = mirror.read() {
                if let Ok(mut state) = serde_json::from_str::<ControllerState>(&text) {
                    state.sanitize(cfg);
                    return (state, LoadSource::MirrorFallback);
                }
            }
        }
        (ControllerState::default(), LoadSource::Defaults)
    }

    /// Throttled save. Writes only when forced, or when something changed
    /// and the minimum save interval has elapsed. The mirror write is
    /// best-effort; only a primary write failure is an error.
    pub fn save(
        &mut self,
        state: &ControllerState,
        now_ms: u64,
        force: bool,
        dirty: bool,
    ) -> Result<bool, StoreError> {
        let position = state.current_position;
        if !force {
            if !dirty && self.last_saved_position == Some(position) {
                return Ok(false);
            }
            if now_ms.saturating_sub(self.last_save_ms) < self.save_interval_ms {
                return Ok(false);
            }
        }

        self.primary.write(&encode_current(state))?;
        if let Some(mirror) = self.mirror.as_mut() {
            if let Ok(text) = serde_json::to_string_pretty(state) {
                let _ = mirror.write(&text);
            }
        }

        self.last_save_ms = now_ms;
        self.last_saved_position = Some(position);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MemByteStore {
        bytes: Arc<Mutex<Vec<u8>>>,
        fail_writes: Arc<Mutex<bool>>,
    }

    impl ByteStore for MemByteStore {
        fn read(&mut self) -> Result<Vec<u8>, StoreError> {
            Ok(self.bytes.lock().unwrap().clone())
        }

        fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
            if *self.fail_writes.lock().unwrap() {
                return Err(StoreError::Backend("write failed".into()));
            }
            *self.bytes.lock().unwrap() = bytes.to_vec();
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct MemMirrorStore {
        text: Arc<Mutex<Option<String>>>,
    }

    impl MirrorStore for MemMirrorStore {
        fn read(&mut self) -> Result<Option<String>, StoreError> {
            Ok(self.text.lock().unwrap().clone())
        }

        fn write(&mut self, text: &str) -> Result<(), StoreError> {
            *self.text.lock().unwrap() = Some(text.to_string());
            Ok(())
        }
    }

    fn sample_state() -> ControllerState {
        ControllerState {
            travel_steps: 11_000,
            current_position: 4_200,
            calibrated: true,
            reverse_direction: true,
            max_speed: 900.0,
            acceleration: 500.0,
            coil_hold_ms: 750,
            top_overdrive_enabled: true,
            top_overdrive_percent: 3.5,
            sun_schedule_enabled: true,
            latitude: 55.75,
            longitude: 37.62,
            sunrise_offset_minutes: -15,
            sunset_offset_minutes: 30,
            sunrise_target_percent: 10.0,
            sunset_target_percent: 95.0,
            firmware_repo: "someone/blinds".to_string(),
            firmware_asset_name: "fw.bin".to_string(),
            firmware_fs_asset_name: "fs.bin".to_string(),
            timezone: "Europe/Moscow".to_string(),
        }
    }

    fn encode_legacy_for_test(state: &ControllerState) -> Vec<u8> {
        let mut writer = RecordWriter::new(RECORD_LEGACY_LEN);
        writer.put_u32(RECORD_MAGIC);
        writer.put_u16(SCHEMA_LEGACY);
        writer.put_u16(RECORD_LEGACY_LEN as u16);
        writer.put_i32(state.travel_steps);
        writer.put_i32(state.current_position);
        writer.put_u8(pack_flags(state) & (FLAG_CALIBRATED | FLAG_REVERSE | FLAG_OVERDRIVE));
        writer.put_u16(state.coil_hold_ms);
        writer.put_f32(state.max_speed);
        writer.put_f32(state.acceleration);
        writer.put_f32(state.top_overdrive_percent);
        writer.put_str(&state.firmware_repo, REPO_FIELD_LEN);
        writer.put_str(&state.firmware_asset_name, ASSET_FIELD_LEN);
        writer.put_str(&state.firmware_fs_asset_name, ASSET_FIELD_LEN);
        writer.finish()
    }

    #[test]
    fn record_round_trips() {
        let state = sample_state();
        let bytes = encode_current(&state);
        assert_eq!(bytes.len(), RECORD_CURRENT_LEN);
        let decoded = decode_current(&bytes).expect("record should validate");
        assert_eq!(decoded, state);
    }

    #[test]
    fn flipped_checksum_bit_rejects_record() {
        let state = sample_state();
        let mut bytes = encode_current(&state);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(decode_current(&bytes).is_none());
        assert!(decode_legacy(&bytes).is_none());
    }

    #[test]
    fn corrupted_payload_byte_rejects_record() {
        let state = sample_state();
        let mut bytes = encode_current(&state);
        bytes[10] ^= 0x40;
        assert!(decode_current(&bytes).is_none());
    }

    #[test]
    fn corrupt_primary_without_mirror_falls_back_to_defaults() {
        let cfg = ShutterConfig::default();
        let primary = MemByteStore::default();
        *primary.bytes.lock().unwrap() = vec![0xFF; RECORD_CURRENT_LEN];
        let mut store = StateStore::new(Box::new(primary), None, cfg.save_interval_ms);

        let (state, source) = store.load(&cfg);
        assert_eq!(source, LoadSource::Defaults);
        assert_eq!(state, ControllerState::default());
    }

    #[test]
    fn legacy_record_migrates_with_defaulted_sun_fields() {
        let cfg = ShutterConfig::default();
        let mut legacy_state = sample_state();
        legacy_state.sun_schedule_enabled = true; // must not survive migration

        let primary = MemByteStore::default();
        *primary.bytes.lock().unwrap() = encode_legacy_for_test(&legacy_state);
        let mut store = StateStore::new(Box::new(primary), None, cfg.save_interval_ms);

        let (state, source) = store.load(&cfg);
        assert_eq!(source, LoadSource::Migrated);
        assert!(!state.sun_schedule_enabled);
        assert_eq!(state.timezone, ControllerState::default().timezone);
        assert_eq!(state.latitude, ControllerState::default().latitude);
        assert_eq!(state.travel_steps, legacy_state.travel_steps);
        assert_eq!(state.current_position, legacy_state.current_position);
        assert!(state.calibrated);
        assert!(state.reverse_direction);
        assert_eq!(state.firmware_repo, legacy_state.firmware_repo);
    }

    #[test]
    fn mirror_is_consulted_when_primary_is_unusable() {
        let cfg = ShutterConfig::default();
        let state = sample_state();
        let mirror = MemMirrorStore::default();
        *mirror.text.lock().unwrap() = Some(serde_json::to_string(&state).unwrap());

        let mut store = StateStore::new(
            Box::new(MemByteStore::default()),
            Some(Box::new(mirror)),
            cfg.save_interval_ms,
        );
        let (loaded, source) = store.load(&cfg);
        assert_eq!(source, LoadSource::MirrorFallback);
        assert_eq!(loaded, state);
    }

    #[test]
    fn save_policy_throttles_unforced_writes() {
        let cfg = ShutterConfig::default();
        let primary = MemByteStore::default();
        let observed = primary.clone();
        let mut store = StateStore::new(Box::new(primary), None, cfg.save_interval_ms);
        let mut state = sample_state();

        // Forced write always goes through.
        assert!(store.save(&state, 0, true, true).unwrap());
        let first = observed.bytes.lock().unwrap().clone();

        // Dirty but inside the interval: skipped.
        state.coil_hold_ms = 900;
        assert!(!store.save(&state, 1_000, false, true).unwrap());
        assert_eq!(*observed.bytes.lock().unwrap(), first);

        // Clean and position unchanged: skipped even after the interval.
        state.coil_hold_ms = 750;
        assert!(!store.save(&state, 60_000, false, false).unwrap());

        // Position moved and the interval elapsed: written.
        state.current_position = 5_000;
        assert!(store.save(&state, 61_000, false, false).unwrap());
        assert!(*observed.bytes.lock().unwrap() != first);
    }

    #[test]
    fn primary_write_failure_is_surfaced_mirror_failure_is_not() {
        let cfg = ShutterConfig::default();
        let primary = MemByteStore::default();
        *primary.fail_writes.lock().unwrap() = true;
        let mut store = StateStore::new(Box::new(primary.clone()), None, cfg.save_interval_ms);
        assert!(store.save(&sample_state(), 0, true, true).is_err());

        *primary.fail_writes.lock().unwrap() = false;

        struct FailingMirror;
        impl MirrorStore for FailingMirror {
            fn read(&mut self) -> Result<Option<String>, StoreError> {
                Err(StoreError::Backend("mirror read".into()))
            }
            fn write(&mut self, _text: &str) -> Result<(), StoreError> {
                Err(StoreError::Backend("mirror write".into()))
            }
        }

        let mut store = StateStore::new(
            Box::new(primary),
            Some(Box::new(FailingMirror)),
            cfg.save_interval_ms,
        );
        assert!(store.save(&sample_state(), 0, true, true).unwrap());
    }

    #[test]
    fn long_strings_are_capped_and_terminated() {
        let mut state = sample_state();
        state.firmware_repo = "x".repeat(200);
        state.timezone = "z".repeat(200);
        let bytes = encode_current(&state);
        assert_eq!(bytes.len(), RECORD_CURRENT_LEN);

        let decoded = decode_current(&bytes).expect("capped record should validate");
        assert_eq!(decoded.firmware_repo.len(), REPO_FIELD_LEN - 1);
        assert_eq!(decoded.timezone.len(), TIMEZONE_FIELD_LEN - 1);
    }
}
