//! Light tracker self-test
//!
//! Replays recorded feedback sequences through the tracker, the debouncer and
//! the countdown driver on the target and prints the results over serial.

#![no_std]
#![no_main]

use crossing_rs::countdown::CountdownDriver;
use crossing_rs::debounce::{DebouncedInput, Edge};
use crossing_rs::light_tracker::{LightMode, LightTracker, TrackerState};
use esp_hal::clock::CpuClock;
use esp_println::println;

// Add app descriptor for espflash compatibility
esp_bootloader_esp_idf::esp_app_desc!();

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("❌ Self-test failed: {}", info);
    loop {}
}

/// Drive `tracker` with a confirmed level for `ms`, sampling every 50 ms.
fn hold(tracker: &mut LightTracker, level: bool, now: &mut u64, ms: u64) -> Option<u32> {
    let end = *now + ms;
    let mut seconds = None;
    while *now < end {
        *now += 50;
        if let Some(m) = tracker.track(level, *now) {
            seconds = Some(m.seconds);
        }
    }
    seconds
}

#[esp_hal::main]
fn main() -> ! {
    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let _peripherals = esp_hal::init(config);

    println!("=== Light tracker self-test ===");

    // 1. Debounce
    println!("\n1. Debounce majority vote");
    let mut input = DebouncedInput::new();
    assert_eq!(input.update(true), Edge::None);
    assert_eq!(input.update(true), Edge::Rising);
    assert_eq!(input.update(false), Edge::None);
    assert_eq!(input.update(true), Edge::None);
    assert!(input.confirmed());
    println!("✅ Single-sample glitch ignored");

    // 2. First measurement: steady green then dark
    println!("\n2. First measurement");
    let mut tracker = LightTracker::new("GREEN");
    let mut now = 0u64;
    hold(&mut tracker, false, &mut now, 3000);
    hold(&mut tracker, true, &mut now, 8000);
    assert_eq!(tracker.state(), TrackerState::SteadyOn);
    let seconds = hold(&mut tracker, false, &mut now, 3000);
    assert_eq!(seconds, Some(8));
    assert!(!tracker.is_countdown_active());
    println!("✅ 8 s steady green measured, countdown still off");

    // 3. Second measurement: steady plus four flashes
    println!("\n3. Steady plus flashing");
    hold(&mut tracker, true, &mut now, 6000);
    assert!(tracker.is_countdown_active());
    for _ in 0..4 {
        hold(&mut tracker, false, &mut now, 500);
        hold(&mut tracker, true, &mut now, 500);
    }
    let seconds = hold(&mut tracker, false, &mut now, 3000);
    assert_eq!(tracker.light_mode(), LightMode::Flash);
    println!(
        "Measured {:?} s (steady {} ms, flash {} ms)",
        seconds,
        tracker.total_steady_ms(),
        tracker.total_flash_ms()
    );
    assert_eq!(seconds, Some(10));
    println!("✅ Flash cycles counted into the measurement");

    // 4. Countdown
    println!("\n4. Countdown from the last measurement");
    hold(&mut tracker, true, &mut now, 1000);
    assert!(tracker.is_countdown_active());
    let mut driver = CountdownDriver::new();
    let mut ticks = 0;
    while tracker.is_countdown_active() {
        if let Some(voice) = driver.tick(&mut tracker, 5, 0) {
            println!("  - voice {}", voice);
        }
        ticks += 1;
    }
    assert_eq!(ticks, 10);
    println!("✅ Countdown finished after {} ticks", ticks);

    println!("\n=== All self-tests passed ===");

    loop {
        for _ in 0..1000000 {
            unsafe {
                core::ptr::read_volatile(&0u32);
            }
        }
    }
}
