//! One download attempt: resolve the server, open a device update session,
//! issue the GET and block until the HTTP callbacks report the outcome.

use std::net::IpAddr;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::error::FotaError;
use super::params::FotaParameters;
use super::ports::{lock_device, AddressResolver, HttpMethod, HttpRequest, HttpTransfer, SharedDevice};
use super::reassembly::{AlignmentPolicy, ReassemblyBuffer};
use crate::config::FotaConfig;

const HTTP_OK: u16 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    pub header_size: usize,
    pub write_alignment: usize,
    pub alignment_policy: AlignmentPolicy,
    /// Upper bound on the whole download
    pub timeout: Duration,
}

impl From<&FotaConfig> for TransferSettings {
    fn from(config: &FotaConfig) -> Self {
        Self {
            header_size: config.header_size,
            write_alignment: config.write_alignment,
            alignment_policy: config.alignment_policy,
            timeout: config.http_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status: u16,
    /// 0 when the server did not announce a length
    pub content_length: u64,
}

/// Error code reported by the HTTP client itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportError(pub i32);

struct TransferContext {
    reassembly: ReassemblyBuffer,
    device: SharedDevice,
    expected_len: u64,
    transferred: u64,
    /// `None` until a callback (or the coordinator giving up) settles it
    outcome: Option<Result<(), FotaError>>,
    waker: Option<SyncSender<()>>,
}

impl TransferContext {
    fn complete(&mut self, result: Result<(), FotaError>) {
        if self.outcome.is_some() {
            return;
        }
        self.outcome = Some(result);
        if let Some(waker) = self.waker.take() {
            let _ = waker.try_send(());
        }
    }
}

fn lock_ctx(ctx: &Mutex<TransferContext>) -> MutexGuard<'_, TransferContext> {
    ctx.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Callback side of an attempt, handed to the HTTP client.
#[derive(Clone)]
pub struct TransferSink {
    ctx: Arc<Mutex<TransferContext>>,
}

impl TransferSink {
    /// Response metadata. A transport error or a non-200 status ends the
    /// attempt immediately since no data will follow.
    pub fn on_response(&self, response: Result<ResponseMeta, TransportError>) {
        let mut ctx = lock_ctx(&self.ctx);
        if ctx.outcome.is_some() {
            log::debug!("Response callback after the transfer was settled, ignored");
            return;
        }

        match response {
            Err(TransportError(code)) => {
                log::error!("HTTP received error: {}", code);
                ctx.complete(Err(FotaError::TransportError));
            }
            Ok(meta) => {
                ctx.expected_len = meta.content_length;
                log::debug!("Total length {}", meta.content_length);
                if meta.status != HTTP_OK {
                    log::error!("Server answered HTTP {}", meta.status);
                    ctx.complete(Err(FotaError::UnexpectedStatus(meta.status)));
                }
            }
        }
    }

    /// One chunk of the body. Returns an error when the client should stop.
    pub fn on_data(&self, chunk: Result<&[u8], TransportError>) -> Result<(), FotaError> {
        let mut guard = lock_ctx(&self.ctx);
        let ctx = &mut *guard;

        if let Some(done) = ctx.outcome {
            return Err(done.err().unwrap_or(FotaError::TransferAbandoned));
        }

        let chunk = match chunk {
            Err(TransportError(code)) => {
                log::error!("HTTP received error: {}", code);
                ctx.complete(Err(FotaError::TransportError));
                return Err(FotaError::TransportError);
            }
            Ok(chunk) if chunk.is_empty() => {
                log::error!("Empty HTTP buffer received");
                ctx.complete(Err(FotaError::ShortOrEmptyChunk));
                return Err(FotaError::ShortOrEmptyChunk);
            }
            Ok(chunk) => chunk,
        };

        let device = ctx.device.clone();
        let mut device = lock_device(&device);

        if let Err(e) = ctx.reassembly.accumulate(chunk, &mut *device) {
            ctx.complete(Err(e));
            return Err(e);
        }
        ctx.transferred += chunk.len() as u64;

        if ctx.expected_len > 0 && ctx.transferred >= ctx.expected_len {
            let result = ctx.reassembly.finish(&mut *device);
            if result.is_ok() {
                log::info!(
                    "Data transfer to device finished ({} bytes)",
                    ctx.transferred
                );
            }
            ctx.complete(result);
            return result;
        }
        Ok(())
    }

    /// True once the attempt has given up its buffers.
    #[cfg(test)]
    pub(crate) fn is_released(&self) -> bool {
        lock_ctx(&self.ctx).reassembly.is_released()
    }

    #[cfg(test)]
    pub(crate) fn bytes_transferred(&self) -> u64 {
        lock_ctx(&self.ctx).transferred
    }
}

/// Handle to an attempt in flight. Aborting settles it as abandoned and
/// frees its buffers; callbacks arriving afterwards never reach the device.
#[derive(Clone)]
pub struct TransferAbort {
    ctx: Arc<Mutex<TransferContext>>,
}

impl TransferAbort {
    /// Waits for a callback that is writing to the device to finish.
    pub fn abort(&self) {
        let mut ctx = lock_ctx(&self.ctx);
        ctx.complete(Err(FotaError::TransferAbandoned));
        ctx.reassembly.release();
    }
}

/// Called with the abort handle before the device session opens. Returning
/// `false` cancels the attempt.
pub type AbortRegistration<'a> = &'a dyn Fn(TransferAbort) -> bool;

/// Settles the context and frees its buffers on every exit path of `run`.
struct ReleaseOnDrop(TransferAbort);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct TransferCoordinator<'a> {
    device: &'a SharedDevice,
    http: &'a dyn HttpTransfer,
    resolver: &'a dyn AddressResolver,
    settings: TransferSettings,
    registration: Option<AbortRegistration<'a>>,
}

impl<'a> TransferCoordinator<'a> {
    pub fn new(
        device: &'a SharedDevice,
        http: &'a dyn HttpTransfer,
        resolver: &'a dyn AddressResolver,
        settings: TransferSettings,
    ) -> Self {
        Self {
            device,
            http,
            resolver,
            settings,
            registration: None,
        }
    }

    /// Hand the abort handle of every run to `registration`.
    pub fn with_abort_registration(mut self, registration: AbortRegistration<'a>) -> Self {
        self.registration = Some(registration);
        self
    }

    /// Download the image and push it to the device. Blocks the calling
    /// thread until the callbacks settle the attempt or the timeout expires.
    pub fn run(&self, params: &FotaParameters) -> Result<(), FotaError> {
        let address = self.resolve(params.server.as_str())?;

        let (waker, woken) = mpsc::sync_channel(1);
        let ctx = Arc::new(Mutex::new(TransferContext {
            reassembly: ReassemblyBuffer::new(
                self.settings.header_size,
                self.settings.write_alignment,
                self.settings.alignment_policy,
            ),
            device: self.device.clone(),
            expected_len: 0,
            transferred: 0,
            outcome: None,
            waker: Some(waker),
        }));
        let abort = TransferAbort { ctx: ctx.clone() };
        let _release = ReleaseOnDrop(abort.clone());

        if let Some(register) = self.registration {
            if !register(abort) {
                log::warn!("FOTA attempt cancelled before it started");
                return Err(FotaError::TransferAbandoned);
            }
        }

        self.open_session()?;

        log::debug!(
            "FOTA update started: server={}, port={}, uri={}",
            params.server,
            params.port,
            params.uri
        );

        let request = HttpRequest {
            server_name: params.server.to_string(),
            address,
            port: params.port,
            uri: params.uri.to_string(),
            method: HttpMethod::Get,
        };
        self.http
            .request(&request, TransferSink { ctx: ctx.clone() })
            .map_err(|e| {
                log::error!("Failed to issue HTTP request to {}: {:?}", request.url(), e);
                FotaError::RequestIssuanceFailed
            })?;

        match woken.recv_timeout(self.settings.timeout) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                log::error!(
                    "No complete image from the server within {:?}",
                    self.settings.timeout
                );
                return Err(FotaError::Timeout);
            }
        }

        let ctx = lock_ctx(&ctx);
        match ctx.outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                log::error!(
                    "Failed to receive the image ({}) after {} of {} bytes",
                    e,
                    ctx.transferred,
                    ctx.expected_len
                );
                Err(e)
            }
            None => Err(FotaError::Timeout),
        }
    }

    fn resolve(&self, server: &str) -> Result<IpAddr, FotaError> {
        if self.resolver.is_literal_address(server) {
            return server.parse().map_err(|_| FotaError::AddressResolutionFailed);
        }

        match self.resolver.resolve(server) {
            Ok(address) => {
                log::debug!("IP address from hostname [{}]: {}", server, address);
                Ok(address)
            }
            Err(e) => {
                log::error!("IP address identification failed for {}: {:?}", server, e);
                Err(FotaError::AddressResolutionFailed)
            }
        }
    }

    /// The device protocol wants an explicit abort before a fresh start.
    fn open_session(&self) -> Result<(), FotaError> {
        let mut device = lock_device(self.device);
        device.begin_update(false).map_err(|e| {
            log::error!("Failed to terminate the device update session: {:?}", e);
            FotaError::DeviceSessionStartFailed
        })?;
        device.begin_update(true).map_err(|e| {
            log::error!("Failed to start the device update session: {:?}", e);
            FotaError::DeviceSessionStartFailed
        })
    }
}
