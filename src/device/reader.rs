use std::io;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;

use crate::error::TrackerError;
use crate::models::Reading;
use crate::recording::Clock;

use super::{LineDecoder, ReconnectPolicy};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Longer lines are discarded as malformed.
pub const MAX_LINE_BYTES: u64 = 4096;

pub type DeviceStream = Box<dyn AsyncRead + Send + Unpin>;
/// Opens (or reopens) the byte stream of the device.
pub type Connector = Arc<dyn Fn() -> io::Result<DeviceStream> + Send + Sync>;
/// Invoked once per decoded line with the readings it carried.
pub type ReadingHandler = Arc<dyn Fn(&[Reading]) + Send + Sync>;
pub type ErrorSink = Arc<dyn Fn(&TrackerError) + Send + Sync>;

/// Serial endpoint of the sensor device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub port: String,
    pub baud_rate: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyS2".into(),
            baud_rate: 115_200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// An I/O error ended the stream and the reconnect policy gave up.
    Degraded,
}

struct ReaderShared {
    decoder: LineDecoder,
    clock: Arc<dyn Clock>,
    policy: Arc<dyn ReconnectPolicy>,
    handlers: RwLock<Vec<ReadingHandler>>,
    error_sink: RwLock<Option<ErrorSink>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ReaderShared {
    fn dispatch_line(&self, raw: &[u8]) {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line,
            Err(err) => {
                log_debug!("dropping non UTF-8 device line: {err}");
                return;
            }
        };

        let readings = match self.decoder.decode(line, self.clock.now()) {
            Ok(readings) => readings,
            Err(err) => {
                log_debug!("dropping device line {:?}: {err}", line.trim());
                return;
            }
        };

        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(&readings);
        }
    }

    fn report(&self, err: &TrackerError) {
        log_error!("{err}");
        let sink = self
            .error_sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sink) = sink {
            sink(err);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}

struct ReaderTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Owns the single device connection of the process.
///
/// Lines are framed at `\n`, decoded, and handed to every subscriber on
/// the reader's own task. Decode failures are dropped; I/O failures go to
/// the error sink and leave the reader degraded unless the reconnect policy
/// says otherwise.
#[derive(Clone)]
pub struct DeviceReader {
    shared: Arc<ReaderShared>,
    task: Arc<Mutex<Option<ReaderTask>>>,
}

impl DeviceReader {
    pub fn new(
        decoder: LineDecoder,
        clock: Arc<dyn Clock>,
        policy: Arc<dyn ReconnectPolicy>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(ReaderShared {
                decoder,
                clock,
                policy,
                handlers: RwLock::new(Vec::new()),
                error_sink: RwLock::new(None),
                state_tx,
            }),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Opens the serial port. A no-op while the reader is already open.
    pub fn open(&self, endpoint: &EndpointConfig) -> Result<(), TrackerError> {
        let port = endpoint.port.clone();
        let baud_rate = endpoint.baud_rate;
        let connector: Connector = Arc::new(move || {
            let stream = tokio_serial::new(&port, baud_rate).open_native_async()?;
            Ok(Box::new(stream) as DeviceStream)
        });
        self.open_with(connector)
    }

    /// Same as [`open`](Self::open) with an arbitrary byte source.
    pub fn open_with(&self, connector: Connector) -> Result<(), TrackerError> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            log_debug!("device reader already open");
            return Ok(());
        }

        let stream = match connector() {
            Ok(stream) => stream,
            Err(err) => {
                let err = TrackerError::Connection(format!("failed to open device: {err}"));
                self.shared.report(&err);
                return Err(err);
            }
        };

        self.shared.set_state(ConnectionState::Connected);
        log_info!("device stream opened");

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(read_loop(
            self.shared.clone(),
            stream,
            connector,
            cancel.clone(),
        ));
        *task = Some(ReaderTask { handle, cancel });
        Ok(())
    }

    pub fn subscribe(&self, handler: ReadingHandler) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.shared
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn set_error_sink(&self, sink: ErrorSink) {
        *self
            .shared
            .error_sink
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub fn is_open(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Unregisters every handler and releases the connection. The reader can
    /// be opened again afterwards.
    pub async fn close(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(err) = task.handle.await {
                log_error!("device reader task failed to join: {err}");
            }
            log_info!("device stream closed");
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

async fn read_loop(
    shared: Arc<ReaderShared>,
    mut stream: DeviceStream,
    connector: Connector,
    cancel: CancellationToken,
) {
    loop {
        let err = tokio::select! {
            err = pump_lines(&shared, stream) => err,
            _ = cancel.cancelled() => return,
        };
        shared.report(&TrackerError::Connection(err.to_string()));

        let mut attempt: u32 = 0;
        stream = loop {
            attempt = attempt.saturating_add(1);
            let Some(delay) = shared.policy.next_delay(attempt) else {
                log_warn!("device stream degraded; not reconnecting");
                shared.set_state(ConnectionState::Degraded);
                return;
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }

            match connector() {
                Ok(stream) => {
                    log_info!("device stream reopened after {attempt} attempt(s)");
                    shared.set_state(ConnectionState::Connected);
                    break stream;
                }
                Err(err) => shared.report(&TrackerError::Connection(format!(
                    "reconnect attempt {attempt} failed: {err}"
                ))),
            }
        };
    }
}

/// Reads lines until the stream fails; end of stream counts as a failure
/// since a serial device never closes on its own.
async fn pump_lines(shared: &ReaderShared, stream: DeviceStream) -> io::Error {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::with_capacity(256);
    let mut discarding = false;

    loop {
        line.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES)
            .read_until(b'\n', &mut line)
            .await;

        let count = match read {
            Ok(0) => {
                return io::Error::new(io::ErrorKind::UnexpectedEof, "device stream ended")
            }
            Ok(count) => count,
            Err(err) => return err,
        };

        let complete = line.last() == Some(&b'\n');
        if discarding {
            discarding = !complete;
            continue;
        }
        if !complete && count as u64 == MAX_LINE_BYTES {
            log_debug!("discarding device line longer than {MAX_LINE_BYTES} bytes");
            discarding = true;
            continue;
        }

        shared.dispatch_line(&line);
    }
}
