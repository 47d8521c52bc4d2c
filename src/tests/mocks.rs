// Fakes for the collaborators the FOTA core drives

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use log::{Level, LevelFilter, Metadata, Record};

use crate::fota::{
    AddressResolver, DeviceUpdateChannel, FotaCollaborators, HttpRequest, HttpTransfer,
    ResponseMeta, SharedDevice, SystemReset, TransferSink, TransportError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Begin(bool),
    Send(Vec<u8>),
    Finish,
}

#[derive(Debug, Default)]
struct DeviceLog {
    calls: Vec<DeviceCall>,
    send_attempts: usize,
}

/// Device channel that records every call. Clones share one log.
#[derive(Debug, Clone, Default)]
pub struct RecordingDevice {
    log: Arc<Mutex<DeviceLog>>,
    fail_send_at: Option<usize>,
    fail_begin: bool,
    fail_finish: bool,
}

impl RecordingDevice {
    /// The `n`th send (0 based) fails.
    pub fn failing_send_at(n: usize) -> Self {
        Self {
            fail_send_at: Some(n),
            ..Self::default()
        }
    }

    pub fn failing_begin() -> Self {
        Self {
            fail_begin: true,
            ..Self::default()
        }
    }

    pub fn failing_finish() -> Self {
        Self {
            fail_finish: true,
            ..Self::default()
        }
    }

    pub fn shared(&self) -> SharedDevice {
        let shared: SharedDevice = Arc::new(Mutex::new(self.clone()));
        shared
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.log.lock().unwrap().calls.clone()
    }

    pub fn sent_blocks(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DeviceCall::Send(block) => Some(block),
                _ => None,
            })
            .collect()
    }

    pub fn finish_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == DeviceCall::Finish)
            .count()
    }
}

impl DeviceUpdateChannel for RecordingDevice {
    fn begin_update(&mut self, enable: bool) -> Result<()> {
        self.log.lock().unwrap().calls.push(DeviceCall::Begin(enable));
        if self.fail_begin {
            bail!("device refused to begin");
        }
        Ok(())
    }

    fn send_block(&mut self, block: &[u8]) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        let attempt = log.send_attempts;
        log.send_attempts += 1;
        if self.fail_send_at == Some(attempt) {
            bail!("device rejected block {}", attempt);
        }
        log.calls.push(DeviceCall::Send(block.to_vec()));
        Ok(())
    }

    fn finish_update(&mut self) -> Result<()> {
        self.log.lock().unwrap().calls.push(DeviceCall::Finish);
        if self.fail_finish {
            bail!("device rejected the image");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Script {
    Serve {
        status: u16,
        content_length: u64,
        chunks: Vec<Vec<u8>>,
        /// Pause before each chunk
        interval: Duration,
    },
    ResponseError(i32),
    /// Keeps the sink and never calls it
    Silent,
    Refuse,
}

/// HTTP client that plays a script per request on its own thread. The last
/// script repeats once the list is exhausted.
#[derive(Clone)]
pub struct ScriptedHttp {
    scripts: Arc<Vec<Script>>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
    sink: Arc<Mutex<Option<TransferSink>>>,
}

impl ScriptedHttp {
    fn from_script(script: Script) -> Self {
        Self {
            scripts: Arc::new(vec![script]),
            requests: Arc::default(),
            sink: Arc::default(),
        }
    }

    pub fn serving(status: u16, body: Vec<u8>, chunk_size: usize) -> Self {
        let content_length = body.len() as u64;
        let chunks = body.chunks(chunk_size).map(<[u8]>::to_vec).collect();
        Self::chunks(status, content_length, chunks)
    }

    pub fn serving_without_length(body: Vec<u8>, chunk_size: usize) -> Self {
        let chunks = body.chunks(chunk_size).map(<[u8]>::to_vec).collect();
        Self::chunks(200, 0, chunks)
    }

    pub fn chunks(status: u16, content_length: u64, chunks: Vec<Vec<u8>>) -> Self {
        Self::from_script(Script::Serve {
            status,
            content_length,
            chunks,
            interval: Duration::ZERO,
        })
    }

    /// Like `serving`, with a pause before every chunk.
    pub fn trickling(body: Vec<u8>, chunk_size: usize, interval: Duration) -> Self {
        let content_length = body.len() as u64;
        let chunks = body.chunks(chunk_size).map(<[u8]>::to_vec).collect();
        Self::from_script(Script::Serve {
            status: 200,
            content_length,
            chunks,
            interval,
        })
    }

    pub fn response_error(code: i32) -> Self {
        Self::from_script(Script::ResponseError(code))
    }

    pub fn silent() -> Self {
        Self::from_script(Script::Silent)
    }

    pub fn refusing() -> Self {
        Self::from_script(Script::Refuse)
    }

    /// Play `next` for the requests after this script's.
    pub fn then(self, next: ScriptedHttp) -> Self {
        let mut scripts = (*self.scripts).clone();
        scripts.extend(next.scripts.iter().cloned());
        Self {
            scripts: Arc::new(scripts),
            ..self
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_sink(&self) -> Option<TransferSink> {
        self.sink.lock().unwrap().clone()
    }
}

impl HttpTransfer for ScriptedHttp {
    fn request(&self, request: &HttpRequest, sink: TransferSink) -> Result<()> {
        *self.sink.lock().unwrap() = Some(sink.clone());

        let index = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len() - 1
        };
        let script = self.scripts[index.min(self.scripts.len() - 1)].clone();

        match script {
            Script::Refuse => Err(anyhow!("connection refused")),
            Script::Silent => Ok(()),
            Script::ResponseError(code) => {
                thread::spawn(move || sink.on_response(Err(TransportError(code))));
                Ok(())
            }
            Script::Serve {
                status,
                content_length,
                chunks,
                interval,
            } => {
                thread::spawn(move || {
                    sink.on_response(Ok(ResponseMeta {
                        status,
                        content_length,
                    }));
                    if status != 200 {
                        return;
                    }
                    for chunk in &chunks {
                        if !interval.is_zero() {
                            thread::sleep(interval);
                        }
                        if sink.on_data(Ok(chunk.as_slice())).is_err() {
                            break;
                        }
                    }
                });
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct StaticResolver {
    names: HashMap<String, IpAddr>,
}

impl StaticResolver {
    pub fn with(name: &str, address: &str) -> Self {
        let mut names = HashMap::new();
        names.insert(name.to_string(), address.parse().unwrap());
        Self { names }
    }
}

impl AddressResolver for StaticResolver {
    fn resolve(&self, hostname: &str) -> Result<IpAddr> {
        self.names
            .get(hostname)
            .copied()
            .ok_or_else(|| anyhow!("unknown host {}", hostname))
    }
}

/// Counts resets and parks the calling thread forever.
#[derive(Debug, Clone, Default)]
pub struct ParkingReset {
    resets: Arc<AtomicUsize>,
}

impl ParkingReset {
    pub fn count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl SystemReset for ParkingReset {
    fn system_reset(&self) -> ! {
        self.resets.fetch_add(1, Ordering::SeqCst);
        loop {
            thread::park();
        }
    }
}

pub fn collaborators(device: &RecordingDevice, http: ScriptedHttp) -> FotaCollaborators {
    collaborators_with_reset(device, http, ParkingReset::default())
}

pub fn collaborators_with_reset(
    device: &RecordingDevice,
    http: ScriptedHttp,
    reset: ParkingReset,
) -> FotaCollaborators {
    FotaCollaborators {
        device: device.shared(),
        http: Arc::new(http),
        resolver: Arc::new(StaticResolver::default()),
        reset: Arc::new(reset),
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

thread_local! {
    static CAPTURED: RefCell<Vec<(Level, String)>> = const { RefCell::new(Vec::new()) };
}

/// Keeps warnings and errors per thread so parallel tests do not mix.
struct CaptureLogger;

impl log::Log for CaptureLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Warn
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            CAPTURED.with(|logs| {
                logs.borrow_mut()
                    .push((record.level(), record.args().to_string()))
            });
        }
    }

    fn flush(&self) {}
}

static CAPTURE_LOGGER: CaptureLogger = CaptureLogger;

/// Run `f` and return what it logged at warn or error level on this thread.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, Vec<(Level, String)>) {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if log::set_logger(&CAPTURE_LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Warn);
        }
    });

    CAPTURED.with(|logs| logs.borrow_mut().clear());
    let result = f();
    let logs = CAPTURED.with(|logs| logs.borrow_mut().drain(..).collect());
    (result, logs)
}
