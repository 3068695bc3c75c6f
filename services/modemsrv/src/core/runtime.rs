//! Channel runtime
//!
//! Runs one `modem_link::Channel` per modem on its own tokio task and
//! bridges it to the device I/O:
//!
//! ```text
//!             ┌──────────── channel task ────────────┐
//! device ──read──► on_bytes_received                  │
//!             │    job queue ◄── ChannelHandle::execute ◄── other tasks
//!             │    Channel::write ──► MpscTransport ──┼──► writer task ──► device
//!             └──────────────────────────────────────┘
//! ```
//!
//! The channel itself never blocks: writes go to an unbounded queue drained
//! by a separate writer task, and every call into the channel happens on the
//! channel task.

use bytes::{Bytes, BytesMut};
use modem_link::{
    Channel, ChannelLogger, ChannelStats, Protocol, RequestResult, Transport, TransportError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::TransportConfig;
use crate::error::{ModemSrvError, Result};

const READ_BUFFER_SIZE: usize = 4096;

/// Bidirectional byte stream to a device
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

/// Work executed on the channel task
pub type Job<P> = Box<dyn FnOnce(&mut Channel<P>) + Send>;

// ============================================================================
// Channel Handle
// ============================================================================

/// Cloneable access to a channel owned by another task
pub struct ChannelHandle<P: Protocol> {
    name: String,
    jobs: mpsc::UnboundedSender<Job<P>>,
}

impl<P: Protocol> Clone for ChannelHandle<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            jobs: self.jobs.clone(),
        }
    }
}

impl<P: Protocol> ChannelHandle<P> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the channel task has stopped accepting jobs
    pub fn is_stopped(&self) -> bool {
        self.jobs.is_closed()
    }

    /// Run `job` on the channel task
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&mut Channel<P>) + Send + 'static,
    {
        self.jobs
            .send(Box::new(job))
            .map_err(|_| ModemSrvError::ChannelStopped(self.name.clone()))
    }

    /// Submit one command and wait for its outcome
    pub async fn request(&self, command: P::Command) -> Result<RequestResult<P::Response>> {
        let (tx, rx) = oneshot::channel();
        // Shared so a synchronous rejection can still answer
        let reply = Arc::new(Mutex::new(Some(tx)));
        let on_complete = reply.clone();

        self.execute(move |channel| {
            let submitted = channel.submit(
                command,
                Box::new(move |_, result| {
                    if let Some(tx) = on_complete.lock().take() {
                        let _ = tx.send(Ok(result));
                    }
                }),
            );
            if let Err(e) = submitted {
                if let Some(tx) = reply.lock().take() {
                    let _ = tx.send(Err(e));
                }
            }
        })?;

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(ModemSrvError::Link(e)),
            Err(_) => Err(ModemSrvError::ChannelStopped(self.name.clone())),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Transport handing frames to the writer task
pub struct MpscTransport {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl MpscTransport {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx }
    }
}

impl Transport for MpscTransport {
    fn write(&mut self, data: &[u8]) -> std::result::Result<(), TransportError> {
        self.tx
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| TransportError::Disconnected)
    }
}

/// Open the device connection described by `transport`
pub async fn open_transport(transport: &TransportConfig) -> Result<Box<dyn AsyncIo>> {
    match transport {
        TransportConfig::Serial { device, baud_rate } => {
            let stream = tokio_serial::new(device, *baud_rate)
                .open_native_async()
                .map_err(|e| ModemSrvError::connection(format!("Failed to open {}: {}", device, e)))?;
            debug!("Opened serial port {} at {} baud", device, baud_rate);
            Ok(Box::new(stream))
        },
        #[cfg(unix)]
        TransportConfig::Unix { path } => {
            let stream = tokio::net::UnixStream::connect(path).await.map_err(|e| {
                ModemSrvError::connection(format!("Failed to connect to {}: {}", path.display(), e))
            })?;
            debug!("Connected to {}", path.display());
            Ok(Box::new(stream))
        },
        #[cfg(not(unix))]
        TransportConfig::Unix { path } => Err(ModemSrvError::config(format!(
            "Unix socket {} is not supported on this platform",
            path.display()
        ))),
        TransportConfig::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await.map_err(|e| {
                ModemSrvError::connection(format!("Failed to connect to {}:{}: {}", host, port, e))
            })?;
            stream.set_nodelay(true)?;
            debug!("Connected to {}:{}", host, port);
            Ok(Box::new(stream))
        },
    }
}

// ============================================================================
// Channel Task
// ============================================================================

/// Parameters of one channel task
pub struct ChannelSpec<P: Protocol> {
    pub id: u32,
    pub name: String,
    pub protocol: P,
    pub max_in_flight: usize,
}

/// Spawn the task owning a channel over `io`
///
/// `setup` runs on the new channel before any byte is read; facades install
/// their watches there. The task ends when `token` is cancelled, the device
/// closes the stream, or every handle is dropped, and returns the final
/// channel counters.
pub fn spawn_channel<P, F>(
    spec: ChannelSpec<P>,
    io: Box<dyn AsyncIo>,
    token: CancellationToken,
    setup: F,
) -> (ChannelHandle<P>, JoinHandle<ChannelStats>)
where
    P: Protocol,
    F: FnOnce(&mut Channel<P>),
{
    let ChannelSpec {
        id,
        name,
        protocol,
        max_in_flight,
    } = spec;

    let (mut reader, mut writer) = tokio::io::split(io);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
    let (job_tx, mut job_rx) = mpsc::unbounded_channel::<Job<P>>();

    let mut channel = Channel::new(
        protocol,
        Box::new(MpscTransport::new(out_tx)),
        ChannelLogger::new(id, name.clone()),
    )
    .with_max_in_flight(max_in_flight);
    setup(&mut channel);

    // Writer: ends once the channel drops its transport. Its sender is weak
    // so the job queue still closes when the last handle goes away.
    let link_lost = job_tx.downgrade();
    let handle = ChannelHandle {
        name: name.clone(),
        jobs: job_tx,
    };

    let writer_name = name.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let written = match writer.write_all(&frame).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!(channel = %writer_name, "Write failed: {}", e);
                if let Some(jobs) = link_lost.upgrade() {
                    let _ = jobs.send(Box::new(|channel: &mut Channel<P>| channel.on_transport_closed()));
                }
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let task = tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!(channel = %name, "Shutdown requested, closing channel");
                    channel.close();
                },
                job = job_rx.recv() => match job {
                    Some(job) => job(&mut channel),
                    None => channel.close(),
                },
                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        warn!(channel = %name, "Device closed the connection");
                        channel.on_transport_closed();
                    },
                    Ok(_) => {
                        channel.on_bytes_received(&buf);
                        buf.clear();
                    },
                    Err(e) => {
                        warn!(channel = %name, "Read failed: {}", e);
                        channel.on_transport_closed();
                    },
                },
            }
            if !channel.state().is_open() {
                break;
            }
        }

        // Late jobs still run so their callbacks see the closed channel
        job_rx.close();
        while let Ok(job) = job_rx.try_recv() {
            job(&mut channel);
        }
        let _ = writer_task.await;

        let stats = channel.stats();
        debug!(channel = %name, "Channel task finished: {:?}", stats);
        stats
    });

    (handle, task)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use modem_link::{ChannelState, RequestError};
    use modem_protocols::at::{AtCommand, AtProtocol};
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    /// Read one CR-terminated command as the device sees it
    async fn read_command<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> String {
        let mut raw = Vec::new();
        reader.read_until(b'\r', &mut raw).await.unwrap();
        String::from_utf8(raw).unwrap().trim().to_string()
    }

    fn spec(name: &str) -> ChannelSpec<AtProtocol> {
        ChannelSpec {
            id: 1,
            name: name.to_string(),
            protocol: AtProtocol::new(),
            max_in_flight: 1,
        }
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (device, host) = duplex(1024);
        let token = CancellationToken::new();
        let (handle, task) = spawn_channel(spec("dut"), Box::new(host), token.clone(), |_| {});

        let modem = tokio::spawn(async move {
            let mut device = BufReader::new(device);
            assert_eq!(read_command(&mut device).await, "AT+CGMI");
            device.write_all(b"\r\nQuectel\r\n\r\nOK\r\n").await.unwrap();
            device
        });

        let response = handle
            .request(AtCommand::new("AT+CGMI").expect(""))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.lines[0].as_str(), "Quectel");

        token.cancel();
        let stats = task.await.unwrap();
        assert_eq!(stats.completed, 1);
        drop(modem.await.unwrap());
    }

    #[tokio::test]
    async fn test_peer_close_fails_outstanding() {
        let (device, host) = duplex(1024);
        let (handle, task) = spawn_channel(spec("dut"), Box::new(host), CancellationToken::new(), |_| {});

        let request = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.request(AtCommand::new("AT")).await })
        };

        // Hang up once the command is on the wire
        let mut device = BufReader::new(device);
        assert_eq!(read_command(&mut device).await, "AT");
        drop(device);

        assert_eq!(request.await.unwrap().unwrap(), Err(RequestError::ChannelClosed));
        let stats = task.await.unwrap();
        assert_eq!(stats.closed, 1);

        assert!(handle.is_stopped());
        assert!(matches!(
            handle.execute(|_| {}),
            Err(ModemSrvError::ChannelStopped(_))
        ));
    }

    #[tokio::test]
    async fn test_setup_runs_before_reads() {
        let (_device, host) = duplex(64);
        let token = CancellationToken::new();
        let (handle, task) = spawn_channel(spec("dut"), Box::new(host), token.clone(), |channel| {
            channel.register("+CREG:".to_string(), false, Box::new(|_, _| {}));
        });

        let (tx, rx) = oneshot::channel();
        handle
            .execute(move |channel| {
                let _ = tx.send((channel.registration_count(), channel.state()));
            })
            .unwrap();
        assert_eq!(rx.await.unwrap(), (1, ChannelState::Open));

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_every_handle_stops_task() {
        let (_device, host) = duplex(64);
        let (handle, task) = spawn_channel(spec("dut"), Box::new(host), CancellationToken::new(), |_| {});

        let second = handle.clone();
        drop(handle);
        second.execute(|_| {}).unwrap();
        drop(second);

        let stats = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("channel task should end once no handle is left")
            .unwrap();
        assert_eq!(stats.submitted, 0);
    }
}
