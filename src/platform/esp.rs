// ESP-IDF collaborators: HTTP client, OTA partition writer, restart, Wi-Fi

use core::ffi::c_void;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use embedded_svc::http::client::Client;
use embedded_svc::http::{Headers, Method};
use embedded_svc::io::Read;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::http::client::{Configuration as HttpConfig, EspHttpConnection};
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use esp_idf_sys::{
    esp, esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
    esp_ota_handle_t, esp_ota_set_boot_partition, esp_ota_write, esp_partition_t,
    OTA_SIZE_UNKNOWN,
};

use crate::fota::{
    DeviceUpdateChannel, HttpRequest, HttpTransfer, ResponseMeta, SystemReset, TransferSink,
    TransportError,
};

const READ_CHUNK: usize = 4096;
const HTTP_TASK_STACK_SIZE: usize = 8192;

const ERR_CONNECT: i32 = -1;
const ERR_READ: i32 = -2;

/// HTTP client running each request on its own task.
pub struct EspHttpTransfer {
    timeout: Duration,
}

impl EspHttpTransfer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl HttpTransfer for EspHttpTransfer {
    fn request(&self, request: &HttpRequest, sink: TransferSink) -> Result<()> {
        let url = request.url();
        let host = format!("{}:{}", request.server_name, request.port);
        let timeout = self.timeout;

        thread::Builder::new()
            .name("fota-http".to_string())
            .stack_size(HTTP_TASK_STACK_SIZE)
            .spawn(move || stream_response(timeout, &url, &host, &sink))
            .map_err(|e| anyhow!("Failed to create HTTP task: {:?}", e))?;
        Ok(())
    }
}

fn stream_response(timeout: Duration, url: &str, host: &str, sink: &TransferSink) {
    let config = HttpConfig {
        buffer_size: Some(READ_CHUNK),
        timeout: Some(timeout),
        ..Default::default()
    };
    let connection = match EspHttpConnection::new(&config) {
        Ok(connection) => connection,
        Err(e) => {
            log::error!("Failed to create HTTP connection: {:?}", e);
            sink.on_response(Err(TransportError(e.code())));
            return;
        }
    };

    let mut client = Client::wrap(connection);
    let headers = [("Host", host)];
    let mut response = match client
        .request(Method::Get, url, &headers)
        .and_then(|request| request.submit())
    {
        Ok(response) => response,
        Err(e) => {
            log::error!("HTTP request to {} failed: {:?}", url, e);
            sink.on_response(Err(TransportError(ERR_CONNECT)));
            return;
        }
    };

    let status = response.status();
    sink.on_response(Ok(ResponseMeta {
        status,
        content_length: response.content_len().unwrap_or(0),
    }));
    if status != 200 {
        return;
    }

    let mut buf = [0u8; READ_CHUNK];
    loop {
        match response.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if sink.on_data(Ok(&buf[..n])).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::error!("HTTP read failed: {:?}", e);
                let _ = sink.on_data(Err(TransportError(ERR_READ)));
                break;
            }
        }
    }
}

/// Streams the image into the next OTA partition.
pub struct EspOtaChannel {
    update_partition: *const esp_partition_t,
    ota_handle: Option<esp_ota_handle_t>,
    bytes_written: usize,
}

// The partition table entry is static and the handle is only used behind the
// device mutex
unsafe impl Send for EspOtaChannel {}

impl EspOtaChannel {
    pub fn new() -> Result<Self> {
        let update_partition = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
        if update_partition.is_null() {
            bail!("No OTA update partition");
        }

        Ok(Self {
            update_partition,
            ota_handle: None,
            bytes_written: 0,
        })
    }
}

impl DeviceUpdateChannel for EspOtaChannel {
    fn begin_update(&mut self, enable: bool) -> Result<()> {
        if let Some(handle) = self.ota_handle.take() {
            esp!(unsafe { esp_ota_abort(handle) })?;
            log::info!("Aborted OTA session after {} bytes", self.bytes_written);
        }
        self.bytes_written = 0;
        if !enable {
            return Ok(());
        }

        let mut handle: esp_ota_handle_t = 0;
        esp!(unsafe { esp_ota_begin(self.update_partition, OTA_SIZE_UNKNOWN as _, &mut handle) })?;
        self.ota_handle = Some(handle);
        Ok(())
    }

    fn send_block(&mut self, block: &[u8]) -> Result<()> {
        let handle = self
            .ota_handle
            .ok_or_else(|| anyhow!("No OTA session open"))?;
        esp!(unsafe { esp_ota_write(handle, block.as_ptr() as *const c_void, block.len() as _) })?;
        self.bytes_written += block.len();
        Ok(())
    }

    fn finish_update(&mut self) -> Result<()> {
        let handle = self
            .ota_handle
            .take()
            .ok_or_else(|| anyhow!("No OTA session open"))?;
        esp!(unsafe { esp_ota_end(handle) })?;
        esp!(unsafe { esp_ota_set_boot_partition(self.update_partition) })?;
        log::info!("OTA image of {} bytes validated, boot partition set", self.bytes_written);
        Ok(())
    }
}

impl Drop for EspOtaChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.ota_handle.take() {
            unsafe {
                esp_ota_abort(handle);
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EspReset;

impl SystemReset for EspReset {
    fn system_reset(&self) -> ! {
        log::logger().flush();
        esp_idf_hal::reset::restart()
    }
}

/// Bring up the station interface and block until it has an address.
pub fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
    ssid: &str,
    password: &str,
) -> Result<BlockingWifi<EspWifi<'static>>> {
    if ssid.is_empty() {
        log::error!("WiFi SSID is empty! Check wifi_config.h");
        bail!("WiFi SSID cannot be empty");
    }

    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid
            .try_into()
            .map_err(|_| anyhow!("Invalid SSID format: {}", ssid))?,
        password: password
            .try_into()
            .map_err(|_| anyhow!("Invalid password format"))?,
        auth_method: if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        },
        ..Default::default()
    }))?;

    wifi.start()?;
    log::info!("Connecting to {}...", ssid);
    wifi.connect()?;
    wifi.wait_netif_up()?;

    let ip = wifi.wifi().sta_netif().get_ip_info()?;
    log::info!("WiFi connected, IP {}", ip.ip);
    Ok(wifi)
}
