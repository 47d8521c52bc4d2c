//! Desktop stand-ins: reqwest for HTTP, a file for the co-processor, and
//! process exit for the reset.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::HOST;

use crate::fota::{
    DeviceUpdateChannel, HttpRequest, HttpTransfer, ResponseMeta, SystemReset, TransferSink,
    TransportError,
};

const READ_CHUNK: usize = 4096;
const HTTP_THREAD_STACK_SIZE: usize = 64 * 1024;

/// Negative codes mirror the embedded HTTP client's error values.
const ERR_CONNECT: i32 = -1;
const ERR_READ: i32 = -2;

pub struct ReqwestTransfer {
    client: Client,
}

impl ReqwestTransfer {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl HttpTransfer for ReqwestTransfer {
    fn request(&self, request: &HttpRequest, sink: TransferSink) -> Result<()> {
        let url = request.url();
        let host = format!("{}:{}", request.server_name, request.port);
        let client = self.client.clone();
        log::debug!("{} {} (Host: {})", request.method.as_str(), url, host);

        thread::Builder::new()
            .name("fota-http".to_string())
            .stack_size(HTTP_THREAD_STACK_SIZE)
            .spawn(move || stream_response(&client, &url, &host, &sink))
            .map_err(|e| anyhow!("Failed to spawn HTTP thread: {:?}", e))?;
        Ok(())
    }
}

fn stream_response(client: &Client, url: &str, host: &str, sink: &TransferSink) {
    let mut response = match client.get(url).header(HOST, host).send() {
        Ok(response) => response,
        Err(e) => {
            log::error!("HTTP request to {} failed: {}", url, e);
            sink.on_response(Err(TransportError(ERR_CONNECT)));
            return;
        }
    };

    let status = response.status().as_u16();
    sink.on_response(Ok(ResponseMeta {
        status,
        content_length: response.content_length().unwrap_or(0),
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
                log::error!("HTTP read failed: {}", e);
                let _ = sink.on_data(Err(TransportError(ERR_READ)));
                break;
            }
        }
    }
}

/// Writes the image to `<path>.part` and renames it to `path` on finish.
pub struct FileUpdateChannel {
    path: PathBuf,
    file: Option<File>,
    written: u64,
}

impl FileUpdateChannel {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
            written: 0,
        }
    }

    fn partial_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".part");
        PathBuf::from(name)
    }
}

impl DeviceUpdateChannel for FileUpdateChannel {
    fn begin_update(&mut self, enable: bool) -> Result<()> {
        if !enable {
            if self.file.take().is_some() {
                let partial = self.partial_path();
                fs::remove_file(&partial)
                    .with_context(|| format!("Failed to remove {}", partial.display()))?;
                log::info!("Aborted update session after {} bytes", self.written);
            }
            self.written = 0;
            return Ok(());
        }

        let partial = self.partial_path();
        let file = File::create(&partial)
            .with_context(|| format!("Failed to create {}", partial.display()))?;
        self.file = Some(file);
        self.written = 0;
        Ok(())
    }

    fn send_block(&mut self, block: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow!("No update session open"))?;
        file.write_all(block)?;
        self.written += block.len() as u64;
        Ok(())
    }

    fn finish_update(&mut self) -> Result<()> {
        let file = self
            .file
            .take()
            .ok_or_else(|| anyhow!("No update session open"))?;
        file.sync_all()?;
        drop(file);

        fs::rename(self.partial_path(), &self.path)
            .with_context(|| format!("Failed to move image to {}", self.path.display()))?;
        log::info!("Image of {} bytes stored in {}", self.written, self.path.display());
        Ok(())
    }
}

/// Ends the process, the closest a desktop gets to a system reset.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessReset;

impl SystemReset for ProcessReset {
    fn system_reset(&self) -> ! {
        log::logger().flush();
        std::process::exit(0)
    }
}
