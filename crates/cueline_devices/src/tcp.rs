//! Line-based TCP driver shared by every device kind.
//!
//! Each command renders itself to one protocol line through [`WireCommand`].
//! Outgoing lines go through a bounded channel drained by a send loop that
//! batches whatever is waiting into a single write; a receive loop reads reply
//! lines and detects the peer closing the connection. When the connection
//! drops, the driver reports it and retries after `reconnect_delay`.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_channel::{Receiver, Sender, TrySendError};
use async_net::TcpStream;
use cueline::error::DeviceError;
use cueline::runtime::{self, TaskHandle};
use cueline::{CommandContext, ConnectionStatus, DeviceDriver, DeviceEventSender, async_trait};
use futures_lite::io::BufReader;
use futures_lite::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

/// A command that can be sent as one protocol line.
pub trait WireCommand: Send + Sync + 'static {
    /// Terminator appended after every rendered command.
    const LINE_ENDING: &'static str = "\r\n";

    /// Render the command without its line ending.
    fn to_wire(&self) -> String;

    /// True when a reply line reports a failure.
    fn is_error_reply(_line: &str) -> bool {
        false
    }
}

#[derive(Clone, Debug)]
#[allow(missing_copy_implementations)]
/// Settings to configure a TCP device connection
pub struct TcpSettings {
    /// Host name or address of the device.
    pub host: String,
    /// TCP port of the device.
    pub port: u16,
    /// Delay before retrying a failed or dropped connection (default: 2000 ms)
    pub reconnect_delay: Duration,
    /// Channel capacity for outgoing lines (default: 500)
    ///
    /// Commands executed while the channel is full fail with
    /// [`DeviceError::SendFailed`].
    pub channel_capacity: usize,
    /// Warn when channel depth exceeds this percentage (default: 80)
    pub channel_warning_threshold: u8,
    /// Maximum reply line length in bytes. Longer replies drop the connection.
    ///
    /// ## Default
    /// The default is set to 64KiB
    pub max_line_length: usize,
}

impl TcpSettings {
    /// Settings for `host:port` with default tuning.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            reconnect_delay: Duration::from_millis(2000),
            channel_capacity: 500,
            channel_warning_threshold: 80,
            max_line_length: 64 * 1024,
        }
    }
}

struct Shared {
    settings: TcpSettings,
    status: Mutex<ConnectionStatus>,
    outgoing: Mutex<Option<Sender<String>>>,
    events: Mutex<Option<DeviceEventSender>>,
    connection_tasks: Mutex<Vec<TaskHandle>>,
    reconnect_task: Mutex<Option<TaskHandle>>,
    terminated: AtomicBool,
    is_error: fn(&str) -> bool,
}

/// Drives a device over a line-based TCP protocol.
///
/// `C` is the command type sent on the wire, `S` the adapter state the driver
/// is paired with. The driver cannot query device state, so the conductor
/// falls back to the adapter's default state after every (re)connect.
pub struct TcpDriver<C, S> {
    shared: Arc<Shared>,
    _marker: PhantomData<fn() -> (C, S)>,
}

impl<C, S> std::fmt::Debug for TcpDriver<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TcpDriver [{}:{}, {:?}]",
            self.shared.settings.host,
            self.shared.settings.port,
            *self.shared.status.lock()
        )
    }
}

impl<C: WireCommand, S> TcpDriver<C, S> {
    /// Create a disconnected driver.
    pub fn new(settings: TcpSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                status: Mutex::new(ConnectionStatus::Disconnected),
                outgoing: Mutex::new(None),
                events: Mutex::new(None),
                connection_tasks: Mutex::new(Vec::new()),
                reconnect_task: Mutex::new(None),
                terminated: AtomicBool::new(false),
                is_error: C::is_error_reply,
            }),
            _marker: PhantomData,
        }
    }

    /// The settings the driver connects with.
    pub fn settings(&self) -> &TcpSettings {
        &self.shared.settings
    }
}

impl Shared {
    fn emit_status(&self, status: ConnectionStatus) {
        if let Some(events) = self.events.lock().as_ref() {
            events.connection_changed(status);
        }
    }

    fn emit_error(&self, message: String) {
        if let Some(events) = self.events.lock().as_ref() {
            events.error(message);
        }
    }

    async fn establish(self: &Arc<Self>) -> Result<(), DeviceError> {
        let address = (self.settings.host.as_str(), self.settings.port);
        info!("Connecting to {}:{}", address.0, address.1);
        let stream = TcpStream::connect(address).await?;
        if let Ok(peer) = stream.peer_addr() {
            debug!("Connected to: {:?}", peer);
        }

        let (sender, receiver) = async_channel::bounded(self.settings.channel_capacity.max(1));
        let read_half = stream.clone();
        let write_half = stream;

        *self.outgoing.lock() = Some(sender);
        *self.status.lock() = ConnectionStatus::Connected;
        self.emit_status(ConnectionStatus::Connected);

        let send_task = runtime::spawn(send_loop(self.clone(), write_half, receiver));
        let recv_task = runtime::spawn(recv_loop(self.clone(), read_half));
        *self.connection_tasks.lock() = vec![send_task, recv_task];
        Ok(())
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        let shared = self.clone();
        let delay = self.settings.reconnect_delay;
        debug!(
            "Reconnecting to {}:{} in {:?}",
            self.settings.host, self.settings.port, delay
        );
        let task = runtime::once_after(delay, async move {
            if shared.terminated.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = shared.establish().await {
                debug!("Reconnect failed: {}", e);
                shared.schedule_reconnect();
            }
        });
        // The previous timer may be the one calling us; let it finish.
        if let Some(previous) = self.reconnect_task.lock().replace(task) {
            previous.detach();
        }
    }

    fn on_connection_lost(self: &Arc<Self>) {
        let previous = std::mem::replace(&mut *self.status.lock(), ConnectionStatus::Disconnected);
        if !previous.is_connected() {
            return;
        }
        self.outgoing.lock().take();
        warn!(
            "Lost connection to {}:{}",
            self.settings.host, self.settings.port
        );
        self.emit_status(ConnectionStatus::Disconnected);
        self.schedule_reconnect();
    }
}

async fn recv_loop(shared: Arc<Shared>, read_half: TcpStream) {
    let max = shared.settings.max_line_length;
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        // Never buffer more than one byte past the limit.
        let mut limited = (&mut reader).take(max as u64 + 1);
        match limited.read_line(&mut line).await {
            Ok(0) => {
                // EOF, meaning the TCP stream has closed.
                info!("Device closed the connection");
                break;
            }
            Ok(n) if n > max => {
                error!("Received too long line: {} > {}", n, max);
                break;
            }
            Ok(_) => {
                let reply = line.trim_end();
                if reply.is_empty() {
                    continue;
                }
                trace!("Received: {}", reply);
                if (shared.is_error)(reply) {
                    warn!("Device replied with an error: {}", reply);
                    shared.emit_error(reply.to_string());
                }
            }
            Err(err) => {
                error!("Encountered error while reading reply: {}", err);
                break;
            }
        }
    }
    shared.on_connection_lost();
}

async fn send_loop(
    shared: Arc<Shared>,
    mut write_half: TcpStream,
    messages: Receiver<String>,
) {
    let warning_threshold = shared.settings.channel_warning_threshold;
    let channel_capacity = shared.settings.channel_capacity.max(1);

    while let Ok(first_line) = messages.recv().await {
        // Collect all available lines into a batch
        let mut batch = vec![first_line];
        while let Ok(line) = messages.try_recv() {
            batch.push(line);
        }

        let depth = messages.len();
        let depth_percentage = (depth * 100 / channel_capacity).min(u8::MAX as usize) as u8;
        if depth_percentage >= warning_threshold {
            warn!(
                "Channel depth at {}% ({}/{} lines). Device may be too slow to keep up!",
                depth_percentage, depth, channel_capacity
            );
        }

        let batch_size = batch.len();
        let combined: String = batch.concat();
        trace!("Sending {} bytes ({} lines)", combined.len(), batch_size);

        if let Err(err) = write_half.write_all(combined.as_bytes()).await {
            error!("Could not send batch of {} lines: {}", batch_size, err);
            break;
        }
        if let Err(err) = write_half.flush().await {
            error!("Could not flush batch of {} lines: {}", batch_size, err);
            break;
        }
    }
    // A closed channel means the driver replaced or dropped this connection.
    if !messages.is_closed() {
        shared.on_connection_lost();
    }
}

#[async_trait]
impl<C, S> DeviceDriver for TcpDriver<C, S>
where
    C: WireCommand,
    S: Send + 'static,
{
    type Command = C;
    type State = S;

    async fn connect(&self, events: DeviceEventSender) -> Result<(), DeviceError> {
        self.shared.terminated.store(false, Ordering::SeqCst);
        *self.shared.events.lock() = Some(events);
        match self.shared.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.schedule_reconnect();
                Err(e)
            }
        }
    }

    async fn execute(&self, command: &C, context: &CommandContext) -> Result<(), DeviceError> {
        let sender = self
            .shared
            .outgoing
            .lock()
            .clone()
            .ok_or(DeviceError::NotConnected)?;
        let line = format!("{}{}", command.to_wire(), C::LINE_ENDING);
        trace!("Queueing {:?} ({})", line.trim_end(), context);
        sender.try_send(line).map_err(|e| match e {
            TrySendError::Full(_) => DeviceError::SendFailed("outgoing queue is full".into()),
            TrySendError::Closed(_) => DeviceError::NotConnected,
        })
    }

    fn connection_status(&self) -> ConnectionStatus {
        *self.shared.status.lock()
    }

    async fn terminate(&self) {
        self.shared.terminated.store(true, Ordering::SeqCst);
        self.shared.reconnect_task.lock().take();
        self.shared.outgoing.lock().take();
        self.shared.connection_tasks.lock().clear();
        *self.shared.status.lock() = ConnectionStatus::Disconnected;
        info!(
            "Closed connection to {}:{}",
            self.shared.settings.host, self.shared.settings.port
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_net::TcpListener;
    use cueline::{DeviceEventKind, DeviceId};

    struct Line(&'static str);

    impl WireCommand for Line {
        fn to_wire(&self) -> String {
            self.0.to_string()
        }

        fn is_error_reply(line: &str) -> bool {
            line.starts_with("ERR")
        }
    }

    fn settings(port: u16) -> TcpSettings {
        let mut settings = TcpSettings::new("127.0.0.1", port);
        settings.reconnect_delay = Duration::from_millis(50);
        settings
    }

    #[tokio::test]
    async fn sends_lines_and_reports_error_replies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let driver: TcpDriver<Line, ()> = TcpDriver::new(settings(port));
        let (tx, rx) = async_channel::unbounded();

        let (connected, accepted) = futures_lite::future::zip(
            driver.connect(DeviceEventSender::new(DeviceId::new("dev"), tx)),
            listener.accept(),
        )
        .await;
        connected.unwrap();
        let (mut peer, _) = accepted.unwrap();
        assert!(driver.connection_status().is_connected());
        assert_eq!(
            rx.recv().await.unwrap().kind,
            DeviceEventKind::ConnectionChanged(ConnectionStatus::Connected)
        );

        driver
            .execute(&Line("PLAY 1-10"), &CommandContext::new("test"))
            .await
            .unwrap();
        let mut reader = BufReader::new(peer.clone());
        let mut received = String::new();
        reader.read_line(&mut received).await.unwrap();
        assert_eq!(received, "PLAY 1-10\r\n");

        peer.write_all(b"ERR bad clip\r\n").await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap().kind,
            DeviceEventKind::Error("ERR bad clip".into())
        );

        drop(reader);
        drop(peer);
        assert_eq!(
            rx.recv().await.unwrap().kind,
            DeviceEventKind::ConnectionChanged(ConnectionStatus::Disconnected)
        );
        assert!(matches!(
            driver.execute(&Line("STOP"), &CommandContext::new("test")).await,
            Err(DeviceError::NotConnected)
        ));
        driver.terminate().await;
    }

    #[tokio::test]
    async fn overlong_reply_drops_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut tcp_settings = settings(port);
        tcp_settings.max_line_length = 16;
        let driver: TcpDriver<Line, ()> = TcpDriver::new(tcp_settings);
        let (tx, rx) = async_channel::unbounded();

        let (connected, accepted) = futures_lite::future::zip(
            driver.connect(DeviceEventSender::new(DeviceId::new("dev"), tx)),
            listener.accept(),
        )
        .await;
        connected.unwrap();
        let (mut peer, _) = accepted.unwrap();
        assert_eq!(
            rx.recv().await.unwrap().kind,
            DeviceEventKind::ConnectionChanged(ConnectionStatus::Connected)
        );

        // No line ending, ever
        peer.write_all(&[b'x'; 64]).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap().kind,
            DeviceEventKind::ConnectionChanged(ConnectionStatus::Disconnected)
        );
        driver.terminate().await;
    }

    #[tokio::test]
    async fn failed_connect_is_reported() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let driver: TcpDriver<Line, ()> = TcpDriver::new(settings(port));
        let result = driver.connect(DeviceEventSender::dummy(DeviceId::new("dev"))).await;
        assert!(result.is_err());
        assert!(!driver.connection_status().is_connected());
        driver.terminate().await;
    }
}
