//! Persistent blob storage
//!
//! Profiles, voice names and the alarm log are stored as postcard-encoded
//! blobs keyed by name. [`FlashBlobStore`] maps every known key to its own
//! erase sector on a NOR flash and frames each blob as
//! `magic | length | crc32 | payload`, padded with `0xFF` to the write size.
//!
//! Writers never touch flash themselves: they raise a [`PersistRequests`] flag
//! and the persistence task commits it.

use crate::ControllerError;
use core::cell::Cell;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};
use log::{debug, error};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Keyed blob persistence
pub trait BlobStore {
    fn write_blob(&mut self, key: &str, data: &[u8]) -> Result<(), ControllerError>;

    /// Read into `buf`, returning the stored length.
    fn read_blob(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, ControllerError>;
}

pub const SECTOR_SIZE: u32 = 4096;
const HEADER_LEN: usize = 12;
const BLOB_MAGIC: u32 = 0x424C_4F42;

/// Largest payload a sector can hold
pub const MAX_BLOB_LEN: usize = SECTOR_SIZE as usize - HEADER_LEN;

/// Staging buffer for aligned flash transfers
const CHUNK: usize = 256;

pub struct FlashBlobStore<F> {
    flash: F,
    base: u32,
    keys: &'static [&'static str],
}

impl<F: NorFlash> FlashBlobStore<F> {
    /// `keys[i]` lives in the sector at `base + i * SECTOR_SIZE`.
    pub fn new(flash: F, base: u32, keys: &'static [&'static str]) -> Self {
        Self { flash, base, keys }
    }

    fn sector_of(&self, key: &str) -> Result<u32, ControllerError> {
        let index = self
            .keys
            .iter()
            .position(|k| *k == key)
            .ok_or(ControllerError::UnknownKey)?;
        Ok(self.base + index as u32 * SECTOR_SIZE)
    }

    /// Read `out.len()` bytes at `offset`, honouring the flash read size.
    fn read_aligned(&mut self, offset: u32, out: &mut [u8]) -> Result<(), ControllerError> {
        let mut staging = [0u8; CHUNK];
        let mut done = 0usize;
        while done < out.len() {
            let want = (out.len() - done).min(CHUNK);
            let len = round_up(want, F::READ_SIZE).min(CHUNK);
            self.flash
                .read(offset + done as u32, &mut staging[..len])
                .map_err(|_| ControllerError::Flash)?;
            out[done..done + want].copy_from_slice(&staging[..want]);
            done += want;
        }
        Ok(())
    }
}

impl<F: NorFlash> BlobStore for FlashBlobStore<F> {
    fn write_blob(&mut self, key: &str, data: &[u8]) -> Result<(), ControllerError> {
        if data.len() > MAX_BLOB_LEN {
            return Err(ControllerError::BlobTooLarge);
        }
        let sector = self.sector_of(key)?;
        self.flash
            .erase(sector, sector + SECTOR_SIZE)
            .map_err(|_| ControllerError::Flash)?;

        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&BLOB_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
        header[8..12].copy_from_slice(&crc32fast::hash(data).to_le_bytes());

        let total = round_up(HEADER_LEN + data.len(), F::WRITE_SIZE);
        let frame = |i: usize| -> u8 {
            if i < HEADER_LEN {
                header[i]
            } else {
                data.get(i - HEADER_LEN).copied().unwrap_or(0xFF)
            }
        };

        let mut staging = [0xFFu8; CHUNK];
        let mut offset = 0usize;
        while offset < total {
            let len = (total - offset).min(CHUNK);
            for (i, byte) in staging[..len].iter_mut().enumerate() {
                *byte = frame(offset + i);
            }
            self.flash
                .write(sector + offset as u32, &staging[..len])
                .map_err(|_| ControllerError::Flash)?;
            offset += len;
        }
        debug!("[FLASH] Wrote {} bytes under '{}'", data.len(), key);
        Ok(())
    }

    fn read_blob(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, ControllerError> {
        let sector = self.sector_of(key)?;
        let mut header = [0u8; HEADER_LEN];
        self.read_aligned(sector, &mut header)?;

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != BLOB_MAGIC {
            return Err(ControllerError::BlobMissing);
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if len > MAX_BLOB_LEN {
            return Err(ControllerError::BlobCorrupt);
        }
        if len > buf.len() {
            return Err(ControllerError::BlobTooLarge);
        }

        self.read_aligned(sector + HEADER_LEN as u32, &mut buf[..len])?;
        if crc32fast::hash(&buf[..len]) != crc {
            return Err(ControllerError::BlobCorrupt);
        }
        Ok(len)
    }
}

fn round_up(len: usize, align: usize) -> usize {
    if align <= 1 { len } else { len.div_ceil(align) * align }
}

/// Encode `value` with postcard and store it under `key`.
pub fn save<T: Serialize>(store: &mut impl BlobStore, key: &str, value: &T) -> Result<(), ControllerError> {
    let mut buf = [0u8; MAX_BLOB_LEN];
    let bytes = postcard::to_slice(value, &mut buf).map_err(|e| match e {
        postcard::Error::SerializeBufferFull => ControllerError::BlobTooLarge,
        _ => ControllerError::Encode,
    })?;
    store.write_blob(key, bytes)
}

/// Read and decode the blob stored under `key`.
pub fn load<T: DeserializeOwned>(store: &mut impl BlobStore, key: &str) -> Result<T, ControllerError> {
    let mut buf = [0u8; MAX_BLOB_LEN];
    let len = store.read_blob(key, &mut buf)?;
    postcard::from_bytes(&buf[..len]).map_err(|_| ControllerError::Decode)
}

/// Something waiting to be written to flash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistKind {
    Profiles,
    Voices,
    Alarms,
}

impl PersistKind {
    const fn bit(self) -> u8 {
        match self {
            PersistKind::Profiles => 1,
            PersistKind::Voices => 2,
            PersistKind::Alarms => 4,
        }
    }
}

/// Set of pending writes taken in one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingWrites(u8);

impl PendingWrites {
    pub fn contains(&self, kind: PersistKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Deferred write flags plus the wake-up of the persistence task
pub struct PersistRequests {
    pending: Mutex<CriticalSectionRawMutex, Cell<u8>>,
    wake: Signal<CriticalSectionRawMutex, ()>,
}

impl Default for PersistRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistRequests {
    pub const fn new() -> Self {
        Self {
            pending: Mutex::new(Cell::new(0)),
            wake: Signal::new(),
        }
    }

    pub fn request(&self, kind: PersistKind) {
        self.pending.lock(|p| p.set(p.get() | kind.bit()));
        self.wake.signal(());
    }

    /// Re-raise a write that failed, without waking the task again.
    pub fn retry(&self, kind: PersistKind) {
        error!("[FLASH] {:?} write failed, will retry", kind);
        self.pending.lock(|p| p.set(p.get() | kind.bit()));
    }

    pub fn take(&self) -> PendingWrites {
        PendingWrites(self.pending.lock(|p| p.replace(0)))
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock(|p| p.get() != 0)
    }

    pub async fn wait(&self) {
        self.wake.wait().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use embassy_futures::block_on;
    use embedded_storage::nor_flash::{ErrorType, NorFlashErrorKind, ReadNorFlash};
    use std::vec;
    use std::vec::Vec;

    /// RAM-backed NOR flash: erase sets 0xFF, writes can only clear bits.
    pub(crate) struct MemFlash {
        pub data: Vec<u8>,
        pub fail_writes: bool,
    }

    impl MemFlash {
        pub fn new(sectors: usize) -> Self {
            Self {
                data: vec![0xFF; sectors * SECTOR_SIZE as usize],
                fail_writes: false,
            }
        }
    }

    impl ErrorType for MemFlash {
        type Error = NorFlashErrorKind;
    }

    impl ReadNorFlash for MemFlash {
        const READ_SIZE: usize = 4;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            let start = offset as usize;
            if start % Self::READ_SIZE != 0 || bytes.len() % Self::READ_SIZE != 0 {
                return Err(NorFlashErrorKind::NotAligned);
            }
            let src = self
                .data
                .get(start..start + bytes.len())
                .ok_or(NorFlashErrorKind::OutOfBounds)?;
            bytes.copy_from_slice(src);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.data.len()
        }
    }

    impl NorFlash for MemFlash {
        const WRITE_SIZE: usize = 4;
        const ERASE_SIZE: usize = SECTOR_SIZE as usize;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            self.data
                .get_mut(from as usize..to as usize)
                .ok_or(NorFlashErrorKind::OutOfBounds)?
                .fill(0xFF);
            Ok(())
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            if self.fail_writes {
                return Err(NorFlashErrorKind::Other);
            }
            let start = offset as usize;
            if start % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
                return Err(NorFlashErrorKind::NotAligned);
            }
            let dst = self
                .data
                .get_mut(start..start + bytes.len())
                .ok_or(NorFlashErrorKind::OutOfBounds)?;
            for (d, s) in dst.iter_mut().zip(bytes) {
                *d &= *s;
            }
            Ok(())
        }
    }

    const KEYS: &[&str] = &["defconf", "alarm_logs"];

    #[test]
    fn blob_survives_rewrite_with_shorter_payload() {
        let mut store = FlashBlobStore::new(MemFlash::new(2), 0, KEYS);
        store.write_blob("alarm_logs", &[7u8; 301]).unwrap();
        store.write_blob("alarm_logs", b"abc").unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(store.read_blob("alarm_logs", &mut buf), Ok(3));
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn keys_use_separate_sectors() {
        let mut store = FlashBlobStore::new(MemFlash::new(2), 0, KEYS);
        store.write_blob("defconf", b"profile").unwrap();
        store.write_blob("alarm_logs", b"alarms").unwrap();
        let mut buf = [0u8; 16];
        let len = store.read_blob("defconf", &mut buf).unwrap();
        assert_eq!(&buf[..len], b"profile");
    }

    #[test]
    fn erased_sector_reads_as_missing() {
        let mut store = FlashBlobStore::new(MemFlash::new(2), 0, KEYS);
        let mut buf = [0u8; 16];
        assert_eq!(store.read_blob("defconf", &mut buf), Err(ControllerError::BlobMissing));
        assert_eq!(store.read_blob("holidays", &mut buf), Err(ControllerError::UnknownKey));
    }

    #[test]
    fn flipped_bit_fails_crc() {
        let mut store = FlashBlobStore::new(MemFlash::new(2), 0, KEYS);
        store.write_blob("defconf", b"profile").unwrap();
        store.flash.data[HEADER_LEN + 2] ^= 0x01;
        let mut buf = [0u8; 16];
        assert_eq!(store.read_blob("defconf", &mut buf), Err(ControllerError::BlobCorrupt));
    }

    #[test]
    fn oversized_blob_is_rejected() {
        let mut store = FlashBlobStore::new(MemFlash::new(2), 0, KEYS);
        let big = vec![0u8; MAX_BLOB_LEN + 1];
        assert_eq!(store.write_blob("defconf", &big), Err(ControllerError::BlobTooLarge));
    }

    #[test]
    fn save_and_load_typed_values() {
        let mut store = FlashBlobStore::new(MemFlash::new(2), 0, KEYS);
        let mut log = crate::alarm::AlarmLog::new();
        log.log("SD card missing", None);
        save(&mut store, "alarm_logs", &log).unwrap();
        let back: crate::alarm::AlarmLog = load(&mut store, "alarm_logs").unwrap();
        assert_eq!(back, log);
    }

    #[test]
    fn requests_are_taken_once_and_wake_the_writer() {
        let requests = PersistRequests::new();
        assert!(requests.take().is_empty());
        requests.request(PersistKind::Alarms);
        requests.request(PersistKind::Profiles);
        block_on(requests.wait());

        let pending = requests.take();
        assert!(pending.contains(PersistKind::Alarms));
        assert!(pending.contains(PersistKind::Profiles));
        assert!(!pending.contains(PersistKind::Voices));
        assert!(!requests.has_pending());

        requests.retry(PersistKind::Voices);
        assert!(requests.take().contains(PersistKind::Voices));
    }
}
