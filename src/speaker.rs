//! SD card clip library and I2S speaker output
//!
//! Clips are 16-bit PCM WAV files in the root of the first FAT volume. The
//! I2S peripheral runs at a fixed rate; clips recorded at another rate are
//! refused rather than played at the wrong pitch.

use crate::ControllerError;
use crate::config::CLIP_SAMPLE_RATE_HZ;
use crate::playback::{ClipCatalog, ClipPlayer, StopFlag, WavHeader, scale_samples};
use embassy_futures::yield_now;
use embassy_time::Delay;
use embedded_hal_bus::spi::ExclusiveDevice;
use embedded_sdmmc::{
    Directory, File, Mode, RawVolume, SdCard, TimeSource, Timestamp, VolumeIdx, VolumeManager,
};
use esp_hal::Blocking;
use esp_hal::gpio::Output;
use esp_hal::i2s::master::I2sTx;
use esp_hal::spi::master::Spi;
use log::{error, info, warn};

pub type SdSpi = ExclusiveDevice<Spi<'static, Blocking>, Output<'static>, Delay>;
pub type SdDevice = SdCard<SdSpi, Delay>;
pub type SdVolumes = VolumeManager<SdDevice, CardTime>;

type ClipDir<'a> = Directory<'a, SdDevice, CardTime, 4, 4, 1>;
type ClipFile<'a> = File<'a, SdDevice, CardTime, 4, 4, 1>;

/// Bytes read from the card per I2S write
const PCM_CHUNK: usize = 512;

/// Room for the RIFF, fmt and any LIST chunks ahead of `data`
const HEADER_READ: usize = 512;

/// Clips are never written, so file timestamps do not matter.
#[derive(Default)]
pub struct CardTime;

impl TimeSource for CardTime {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 0,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

struct OpenClip<'a> {
    file: ClipFile<'a>,
    _dir: ClipDir<'a>,
    header: WavHeader,
}

/// Read-only view of the clips on the card
#[derive(Clone, Copy)]
pub struct ClipLibrary {
    volumes: &'static SdVolumes,
    volume: RawVolume,
}

impl ClipLibrary {
    pub fn open(volumes: &'static SdVolumes) -> Result<Self, ControllerError> {
        let volume = volumes.open_raw_volume(VolumeIdx(0)).map_err(|e| {
            error!("[AUDIO] Cannot open SD volume: {:?}", e);
            ControllerError::ClipNotFound
        })?;
        info!("[AUDIO] SD volume 0 opened");
        Ok(Self { volumes, volume })
    }

    fn open_clip(&self, name: &str) -> Result<OpenClip<'static>, ControllerError> {
        let dir = self
            .volumes
            .open_root_dir(self.volume)
            .map_err(|_| ControllerError::ClipNotFound)?
            .to_directory(self.volumes);
        let file = dir
            .open_file_in_dir(name, Mode::ReadOnly)
            .map_err(|_| ControllerError::ClipNotFound)?;

        let mut head = [0u8; HEADER_READ];
        let len = file.read(&mut head).map_err(|_| ControllerError::Audio)?;
        let header = WavHeader::parse(&head[..len])?;
        Ok(OpenClip {
            file,
            _dir: dir,
            header,
        })
    }
}

impl ClipCatalog for ClipLibrary {
    fn duration_ms(&mut self, name: &str) -> Result<u64, ControllerError> {
        Ok(self.open_clip(name)?.header.duration_ms())
    }
}

/// Streams clips from the card into the I2S transmitter
pub struct Speaker {
    library: ClipLibrary,
    tx: I2sTx<'static, Blocking>,
    pcm: [u8; PCM_CHUNK],
    frames: [i16; PCM_CHUNK],
}

impl Speaker {
    pub fn new(library: ClipLibrary, tx: I2sTx<'static, Blocking>) -> Self {
        Self {
            library,
            tx,
            pcm: [0; PCM_CHUNK],
            frames: [0; PCM_CHUNK],
        }
    }

    /// Push `len` scaled bytes as stereo frames; mono samples go to both channels.
    fn write_pcm(&mut self, len: usize, channels: u16) -> Result<(), ControllerError> {
        let samples = self.pcm[..len]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]));
        let mut count = 0;
        if channels == 1 {
            for sample in samples.take(PCM_CHUNK / 2) {
                self.frames[count] = sample;
                self.frames[count + 1] = sample;
                count += 2;
            }
        } else {
            for sample in samples {
                self.frames[count] = sample;
                count += 1;
            }
        }
        self.tx.write_words(&self.frames[..count]).map_err(|e| {
            error!("[AUDIO] I2S write failed: {:?}", e);
            ControllerError::Audio
        })
    }
}

impl ClipPlayer for Speaker {
    async fn play(&mut self, name: &str, volume: f32, stop: &StopFlag) -> Result<(), ControllerError> {
        let clip = self.library.open_clip(name)?;
        let header = clip.header;
        if header.sample_rate != CLIP_SAMPLE_RATE_HZ || header.channels > 2 {
            warn!(
                "[AUDIO] {} is {} Hz / {} ch, output runs at {} Hz",
                name, header.sample_rate, header.channels, CLIP_SAMPLE_RATE_HZ
            );
            return Err(ControllerError::ClipFormat);
        }
        clip.file
            .seek_from_start(header.data_offset)
            .map_err(|_| ControllerError::Audio)?;

        let mut remaining = header.data_len as usize;
        while remaining > 0 {
            if stop.is_requested() {
                info!("[AUDIO] {} stopped", name);
                break;
            }
            let want = remaining.min(PCM_CHUNK);
            let read = clip
                .file
                .read(&mut self.pcm[..want])
                .map_err(|_| ControllerError::Audio)?;
            if read == 0 {
                warn!("[AUDIO] {} ended {} bytes early", name, remaining);
                break;
            }
            remaining -= read;

            scale_samples(&mut self.pcm[..read], volume);
            self.write_pcm(read, header.channels)?;
            yield_now().await;
        }
        Ok(())
    }
}
