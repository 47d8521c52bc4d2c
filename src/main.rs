#[cfg(target_os = "espidf")]
use esp_idf_sys as _; // Binstart

// Generate ESP-IDF app descriptor
#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use std::io::BufRead;
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use log::info;

    use ncp_fota::fota::{Fota, FotaCollaborators, StdResolver};
    use ncp_fota::platform::esp::{connect_wifi, EspHttpTransfer, EspOtaChannel, EspReset};
    use ncp_fota::{config, logging, shell};

    esp_idf_svc::sys::link_patches();
    logging::init_logger().map_err(|e| anyhow!("Failed to initialize logger: {}", e))?;

    info!("NCP FOTA v{}", env!("CARGO_PKG_VERSION"));
    info!("Free heap: {} bytes", unsafe {
        esp_idf_sys::esp_get_free_heap_size()
    });

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let config = config::load_or_default(nvs.clone())?;
    let _wifi = connect_wifi(
        peripherals.modem,
        sys_loop,
        nvs,
        env!("WIFI_SSID"),
        env!("WIFI_PASSWORD"),
    )?;

    let collaborators = FotaCollaborators {
        device: Arc::new(Mutex::new(EspOtaChannel::new()?)),
        http: Arc::new(EspHttpTransfer::new(config.http_timeout())),
        resolver: Arc::new(StdResolver),
        reset: Arc::new(EspReset),
    };
    let fota = Fota::new(config.clone(), collaborators)?;
    fota.start()?;

    if let Some(interval) = config.check_interval() {
        fota.set_timer(interval)?;
        fota.start_timer()?;
        info!("Periodic update check every {} s", interval.as_secs());
    }

    info!("Console ready, type 'help'");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let mut out = String::new();
        let status = shell::execute(&fota, &line, &mut out);
        print!("{}", out);
        log::debug!("'{}' -> {:?}", line.trim(), status);
    }

    Ok(())
}

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    use std::io::BufRead;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use anyhow::{anyhow, Context};
    use clap::Parser;

    use ncp_fota::config::FotaConfig;
    use ncp_fota::fota::{Fota, FotaCollaborators, StdResolver};
    use ncp_fota::platform::host::{FileUpdateChannel, ProcessReset, ReqwestTransfer};
    use ncp_fota::shell::{self, ShellStatus};
    use ncp_fota::logging;

    #[derive(Parser)]
    #[command(name = "ncp-fota")]
    #[command(about = "Download a co-processor image over HTTP and stage it to a file")]
    struct Args {
        /// Server name or address (defaults to the configured one)
        server: Option<String>,

        /// Server port
        port: Option<u16>,

        /// Image path on the server
        uri: Option<String>,

        /// Where the received image is written
        #[arg(short, long, default_value = "ncp-image.ota")]
        output: PathBuf,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Log level (error, warn, info, debug, trace)
        #[arg(long, default_value = "info")]
        log_level: String,

        /// Read commands from stdin instead of running one update
        #[arg(long)]
        shell: bool,
    }

    let args = Args::parse();

    logging::init_logger().map_err(|e| anyhow!("Failed to initialize logger: {}", e))?;
    if !logging::set_max_level_from_str(&args.log_level) {
        log::warn!("Unknown log level '{}', keeping info", args.log_level);
    }

    let config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            FotaConfig::from_json(&json)?
        }
        None => FotaConfig::default(),
    };

    let collaborators = FotaCollaborators {
        device: Arc::new(Mutex::new(FileUpdateChannel::new(&args.output))),
        http: Arc::new(ReqwestTransfer::new(config.http_timeout())?),
        resolver: Arc::new(StdResolver),
        reset: Arc::new(ProcessReset),
    };
    let fota = Fota::new(config.clone(), collaborators)?;
    fota.start()?;

    if args.shell {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let mut out = String::new();
            shell::execute(&fota, &line?, &mut out);
            print!("{}", out);
        }
        fota.stop()?;
        return Ok(());
    }

    let line = format!(
        "fota_http {} {} {}",
        args.server.as_deref().unwrap_or(&config.server_name),
        args.port.unwrap_or(config.server_port),
        args.uri.as_deref().unwrap_or(&config.uri),
    );
    let mut out = String::new();
    let status = shell::execute(&fota, &line, &mut out);
    print!("{}", out);

    if status != ShellStatus::Ok {
        std::process::exit(1);
    }

    // The task resets (exits) once the reboot delay has passed
    loop {
        std::thread::park();
    }
}
