fn main() {
    // Load .env file for controller configuration
    load_env_config();

    // Host builds (unit tests, docs) must not see the ESP linker scripts.
    if std::env::var_os("CARGO_FEATURE_FIRMWARE").is_some() {
        linker_be_nice();
        // make sure linkall.x is the last linker script (otherwise might cause problems with flip-link)
        println!("cargo:rustc-link-arg=-Tlinkall.x");
    }
}

/// Default stuck-input thresholds in minutes, used when the environment is silent.
const DEFAULT_STUCK_LOW_MIN: u32 = 240;
const DEFAULT_STUCK_HIGH_MIN: u32 = 30;
const DEFAULT_DEVICE_LABEL: &str = "crossing";

/// Load environment configuration from .env file
/// Environment variables take priority over .env file values
fn load_env_config() {
    use std::env;
    use std::path::Path;

    // Tell cargo to rerun this build script if .env file changes
    println!("cargo:rerun-if-changed=.env");

    // Tell cargo to rerun if environment variables change
    println!("cargo:rerun-if-env-changed=CROSSING_DEMAND_STUCK_LOW_MIN");
    println!("cargo:rerun-if-env-changed=CROSSING_DEMAND_STUCK_HIGH_MIN");
    println!("cargo:rerun-if-env-changed=CROSSING_DEVICE_LABEL");

    // Try to load .env file if it exists
    if Path::new(".env").exists() {
        match dotenvy::dotenv() {
            Ok(_) => println!("cargo:warning=Loaded .env file"),
            Err(e) => println!("cargo:warning=Failed to load .env file: {}", e),
        }
    }

    let stuck_low = minutes_from_env("CROSSING_DEMAND_STUCK_LOW_MIN", DEFAULT_STUCK_LOW_MIN);
    let stuck_high = minutes_from_env("CROSSING_DEMAND_STUCK_HIGH_MIN", DEFAULT_STUCK_HIGH_MIN);
    let label = env::var("CROSSING_DEVICE_LABEL")
        .map(|value| value.trim().to_string())
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_DEVICE_LABEL.to_string());

    // Set environment variables for the compilation
    println!("cargo:rustc-env=CROSSING_DEMAND_STUCK_LOW_MIN={}", stuck_low);
    println!("cargo:rustc-env=CROSSING_DEMAND_STUCK_HIGH_MIN={}", stuck_high);
    println!("cargo:rustc-env=CROSSING_DEVICE_LABEL={}", label);
}

/// Reads a positive minute count, warning and falling back on garbage.
fn minutes_from_env(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<u32>() {
            Ok(0) | Err(_) => {
                println!(
                    "cargo:warning={} = '{}' is not a positive integer, using {}",
                    key, raw, default
                );
                default
            }
            Ok(minutes) => minutes,
        },
        Err(_) => default,
    }
}

fn linker_be_nice() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        let kind = &args[1];
        let what = &args[2];

        match kind.as_str() {
            "undefined-symbol" => match what.as_str() {
                "_defmt_timestamp" => {
                    eprintln!();
                    eprintln!("💡 `defmt` not found - make sure `defmt.x` is added as a linker script and you have included `use defmt_rtt as _;`");
                    eprintln!();
                }
                "_stack_start" => {
                    eprintln!();
                    eprintln!("💡 Is the linker script `linkall.x` missing?");
                    eprintln!();
                }
                "embedded_test_linker_file_not_added_to_rustflags" => {
                    eprintln!();
                    eprintln!("💡 `embedded-test` not found - make sure `embedded-test.x` is added as a linker script for tests");
                    eprintln!();
                }
                _ => (),
            },
            // we don't have anything helpful for "missing-lib" yet
            _ => {
                std::process::exit(1);
            }
        }

        std::process::exit(0);
    }

    println!(
        "cargo:rustc-link-arg=--error-handling-script={}",
        std::env::current_exe().unwrap().display()
    );
}
