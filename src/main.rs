#![no_std]
#![no_main]

use esp_hal::Blocking;
use esp_hal::analog::adc::{Adc, AdcConfig, AdcPin, Attenuation};
use esp_hal::clock::CpuClock;
use esp_hal::dma_buffers;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::i2s::master::{DataFormat, I2s, Standard};
use esp_hal::peripherals::{ADC1, GPIO2};
use esp_hal::spi::Mode as SpiMode;
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_println::println;

use embassy_futures::select::select;
use embassy_time::{Delay, Duration, Instant, Ticker, Timer};
use embedded_hal_bus::spi::ExclusiveDevice;
use embedded_sdmmc::{SdCard, VolumeManager};
use esp_hal_embassy::Executor;
use esp_storage::FlashStorage;
use log::{LevelFilter, error, info};
use static_cell::StaticCell;

// Import our library modules
use crossing_rs::alarm::ALARM_KEY;
use crossing_rs::ambient::AmbientSensor;
use crossing_rs::audio_config::{FixedPlan, PROFILE_KEYS, VOICES_KEY};
use crossing_rs::config;
use crossing_rs::shared::{Controller, FeedbackPins, SchedulerContext};
use crossing_rs::speaker::{CardTime, ClipLibrary, SdVolumes, Speaker};
use crossing_rs::storage::FlashBlobStore;
use crossing_rs::ControllerError;

// Add app descriptor for espflash compatibility
esp_bootloader_esp_idf::esp_app_desc!();

/// First of six 4 KiB sectors at the top of a 4 MiB flash
const STORAGE_BASE: u32 = 0x3F_A000;

/// Failed flash commits are retried this often
const PERSIST_RETRY: Duration = Duration::from_secs(5);

/// DMA buffer behind the I2S transmitter
const I2S_DMA_BYTES: usize = 4 * 4092;

static BLOB_KEYS: [&str; 6] = [
    PROFILE_KEYS[0],
    PROFILE_KEYS[1],
    PROFILE_KEYS[2],
    PROFILE_KEYS[3],
    VOICES_KEY,
    ALARM_KEY,
];

static CONTROLLER_CELL: StaticCell<Controller> = StaticCell::new();
static SD_VOLUMES_CELL: StaticCell<SdVolumes> = StaticCell::new();
static EXECUTOR: StaticCell<Executor> = StaticCell::new();

type Feedback = FeedbackPins<Input<'static>, Input<'static>, Input<'static>>;

#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {}
}

/// Microphone level on GPIO2 (ADC1 channel 2)
struct AmbientAdc {
    adc: Adc<'static, ADC1<'static>, Blocking>,
    pin: AdcPin<GPIO2<'static>, ADC1<'static>>,
}

impl AmbientSensor for AmbientAdc {
    fn read_average(&mut self, samples: u32) -> Result<u32, ControllerError> {
        let mut sum = 0u32;
        for _ in 0..samples {
            let raw = nb::block!(self.adc.read_oneshot(&mut self.pin))
                .map_err(|_| ControllerError::Input)?;
            sum += u32::from(raw);
        }
        Ok(sum / samples.max(1))
    }
}

/// Debounce, light tracking, demand and ambient level
#[embassy_executor::task]
async fn io_task(controller: &'static Controller, mut pins: Feedback, mut sensor: AmbientAdc) -> ! {
    let mut ticker = Ticker::every(Duration::from_millis(config::POLL_PERIOD_MS));
    loop {
        controller.io_pass(&mut pins, &mut sensor, Instant::now().as_millis());
        ticker.next().await;
    }
}

/// Playback arbitration
#[embassy_executor::task]
async fn scheduler_task(controller: &'static Controller, mut library: ClipLibrary) -> ! {
    let mut context = SchedulerContext::new();
    let mut ticker = Ticker::every(Duration::from_millis(config::SCHEDULER_PERIOD_MS));
    loop {
        controller.scheduler_pass(&mut context, &mut library, Instant::now().as_millis());
        ticker.next().await;
    }
}

#[embassy_executor::task]
async fn playback_task(controller: &'static Controller, mut speaker: Speaker) -> ! {
    loop {
        controller.playback_step(&mut speaker).await;
    }
}

/// Wall clock, countdown and plan re-resolution
#[embassy_executor::task]
async fn clock_task(controller: &'static Controller) -> ! {
    let plan = FixedPlan(0);
    let mut ticker = Ticker::every(Duration::from_millis(config::CLOCK_TICK_MS));
    loop {
        ticker.next().await;
        controller.clock_tick(&plan);
    }
}

/// Deferred flash commits
#[embassy_executor::task]
async fn persist_task(
    controller: &'static Controller,
    mut store: FlashBlobStore<FlashStorage>,
) -> ! {
    loop {
        if controller.has_pending_writes() {
            select(controller.wait_persist(), Timer::after(PERSIST_RETRY)).await;
        } else {
            controller.wait_persist().await;
        }
        let committed = controller.persist_pass(&mut store);
        if !committed.is_empty() {
            info!("[FLASH] Persist pass done, retry pending: {}", controller.has_pending_writes());
        }
    }
}

#[esp_hal::main]
fn main() -> ! {
    esp_println::logger::init_logger(LevelFilter::Info);
    println!(
        "[MAIN] crossing-rs {} ({}) starting",
        crossing_rs::VERSION,
        config::DEVICE_LABEL
    );

    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);

    // Initialize embassy time system
    let timer_group0 = TimerGroup::new(peripherals.TIMG0);
    esp_hal_embassy::init(timer_group0.timer0);

    let controller: &'static Controller = CONTROLLER_CELL.init(Controller::new());

    let mut store = FlashBlobStore::new(FlashStorage::new(), STORAGE_BASE, &BLOB_KEYS);
    controller.load(&mut store);

    // Feedback lines idle low; lit lamp / pressed button drive them high
    let input_config = InputConfig::default().with_pull(Pull::Down);
    let pins = FeedbackPins {
        green: Input::new(peripherals.GPIO0, input_config),
        red: Input::new(peripherals.GPIO1, input_config),
        demand: Input::new(peripherals.GPIO3, input_config),
    };

    let mut adc_config: AdcConfig<ADC1> = AdcConfig::new();
    let adc_pin = adc_config.enable_pin(peripherals.GPIO2, Attenuation::_11dB);
    let sensor = AmbientAdc {
        adc: Adc::new(peripherals.ADC1, adc_config),
        pin: adc_pin,
    };

    // SD card on SPI2: MISO 4, MOSI 5, SCK 6, CS 7
    let spi_config = SpiConfig::default()
        .with_frequency(Rate::from_khz(400))
        .with_mode(SpiMode::_0);
    let sd_cs = Output::new(peripherals.GPIO7, Level::High, OutputConfig::default());
    let library = match Spi::new(peripherals.SPI2, spi_config) {
        Ok(spi) => {
            let spi = spi
                .with_miso(peripherals.GPIO4)
                .with_mosi(peripherals.GPIO5)
                .with_sck(peripherals.GPIO6);
            match ExclusiveDevice::new(spi, sd_cs, Delay) {
                Ok(device) => {
                    let volumes = SD_VOLUMES_CELL
                        .init(VolumeManager::new(SdCard::new(device, Delay), CardTime));
                    ClipLibrary::open(volumes).ok()
                }
                Err(_) => None,
            }
        }
        Err(e) => {
            error!("[AUDIO] SPI init failed: {:?}", e);
            None
        }
    };
    if library.is_none() {
        controller.raise_alarm("SD card not found");
    }

    // I2S: BCLK 8, WS 10, DOUT 9
    let (_, _, _, tx_descriptors) = dma_buffers!(0, I2S_DMA_BYTES);
    let i2s = I2s::new(
        peripherals.I2S0,
        Standard::Philips,
        DataFormat::Data16Channel16,
        Rate::from_hz(config::CLIP_SAMPLE_RATE_HZ),
        peripherals.DMA_CH0,
    );
    let i2s_tx = i2s
        .i2s_tx
        .with_bclk(peripherals.GPIO8)
        .with_ws(peripherals.GPIO10)
        .with_dout(peripherals.GPIO9)
        .build(tx_descriptors);

    let executor = EXECUTOR.init(Executor::new());
    executor.run(move |spawner| {
        println!("[MAIN] Spawning IO, clock and persistence tasks...");
        spawner.spawn(io_task(controller, pins, sensor)).ok();
        spawner.spawn(clock_task(controller)).ok();
        spawner.spawn(persist_task(controller, store)).ok();

        match library {
            Some(library) => {
                println!("[MAIN] Spawning audio tasks...");
                spawner.spawn(scheduler_task(controller, library)).ok();
                spawner
                    .spawn(playback_task(controller, Speaker::new(library, i2s_tx)))
                    .ok();
            }
            None => println!("[MAIN] No SD card, audio disabled"),
        }
    });
}
