use std::fs;
use std::path::Path;

const WIFI_CONFIG: &str = "wifi_config.h";

/// Value of a `#define NAME "value"` line, if present.
fn define_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    let prefix = format!("#define {}", name);
    header
        .lines()
        .find(|l| l.trim_start().starts_with(&prefix))
        .and_then(|l| l.split('"').nth(1))
}

fn main() -> anyhow::Result<()> {
    let espidf = std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf");
    if espidf {
        embuild::espidf::sysenv::output();
    }

    println!("cargo:rerun-if-changed={}", WIFI_CONFIG);

    // Station credentials for the firmware, baked in at build time
    let header = if Path::new(WIFI_CONFIG).exists() {
        fs::read_to_string(WIFI_CONFIG)?
    } else {
        if espidf {
            println!(
                "cargo:warning={} not found! Create it with WIFI_SSID and WIFI_PASSWORD defines.",
                WIFI_CONFIG
            );
        }
        String::new()
    };

    for name in ["WIFI_SSID", "WIFI_PASSWORD"] {
        let value = define_value(&header, name).unwrap_or("");
        if espidf && value.is_empty() && !header.is_empty() {
            println!("cargo:warning={} has no {} define", WIFI_CONFIG, name);
        }
        println!("cargo:rustc-env={}={}", name, value);
    }

    Ok(())
}
