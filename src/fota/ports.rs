//! Interfaces of the collaborators the FOTA core drives but does not own:
//! the co-processor's update protocol, the HTTP client, name resolution and
//! the host reset.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Context, Result};

use super::transfer::TransferSink;

/// Update protocol exposed by the co-processor driver.
pub trait DeviceUpdateChannel: Send {
    /// `true` opens a new update session, `false` aborts any open one.
    fn begin_update(&mut self, enable: bool) -> Result<()>;

    fn send_block(&mut self, block: &[u8]) -> Result<()>;

    /// Hand the received image over to the device, which then flashes it and reboots.
    fn finish_update(&mut self) -> Result<()>;
}

/// The device channel is written from the HTTP callback thread and finalized
/// from the FOTA task.
pub type SharedDevice = Arc<Mutex<dyn DeviceUpdateChannel>>;

pub(crate) fn lock_device(
    device: &SharedDevice,
) -> MutexGuard<'_, dyn DeviceUpdateChannel + 'static> {
    device.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Name as given by the caller, used for the Host header
    pub server_name: String,
    pub address: IpAddr,
    pub port: u16,
    pub uri: String,
    pub method: HttpMethod,
}

impl HttpRequest {
    pub fn url(&self) -> String {
        format!("http://{}{}", SocketAddr::new(self.address, self.port), self.uri)
    }
}

/// HTTP client that reports through callbacks.
pub trait HttpTransfer: Send + Sync {
    /// Issue the request and return without waiting for the response. The
    /// response metadata and then every data chunk are delivered to `sink`,
    /// usually from another thread.
    fn request(&self, request: &HttpRequest, sink: TransferSink) -> Result<()>;
}

pub trait AddressResolver: Send + Sync {
    fn is_literal_address(&self, text: &str) -> bool {
        text.parse::<IpAddr>().is_ok()
    }

    fn resolve(&self, hostname: &str) -> Result<IpAddr>;
}

pub trait SystemReset: Send + Sync {
    fn system_reset(&self) -> !;
}

/// Resolver backed by the platform's `getaddrinfo` (lwIP on ESP-IDF).
#[derive(Debug, Default, Clone, Copy)]
pub struct StdResolver;

impl AddressResolver for StdResolver {
    fn resolve(&self, hostname: &str) -> Result<IpAddr> {
        let addrs: Vec<SocketAddr> = (hostname, 0)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {}", hostname))?
            .collect();

        // The co-processor's HTTP client speaks IPv4 first
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .map(|a| a.ip())
            .ok_or_else(|| anyhow!("no address found for {}", hostname))
    }
}
