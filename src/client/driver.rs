// Connection driver: runs the channel state machine against a live socket

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use url::Url;

use super::api::ConsoleApi;
use super::connection::{Command, ConnectionManager, Delivery, Event, Subscription};
use super::sink::ConsoleSink;
use super::timer::OwnedTask;
use crate::common::config::ClientConfig;
use crate::common::error::{Error, Result};
use crate::common::types::ConnectionState;
use crate::protocol::ClientMessage;
use crate::transport::{self, ChannelWriter, TransportEvent, WsStream};

/// Requests from the handle.
enum Input {
    Event(Event),
    Send(ClientMessage, oneshot::Sender<bool>),
    Subscription(oneshot::Sender<Subscription>),
}

/// Reports from socket tasks, tagged with the transport generation they belong to.
enum Link {
    Opened { generation: u64, result: Result<WsStream> },
    Transport { generation: u64, event: TransportEvent },
}

/// Caller side of the channel. Dropping it closes the channel and stops the driver.
pub struct ConnectionHandle {
    inputs: mpsc::UnboundedSender<Input>,
    status: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    /// Start a driver task for `config`. Nothing connects until [`connect`](Self::connect).
    pub fn spawn(
        config: &ClientConfig,
        api: Arc<dyn ConsoleApi>,
        sink: Arc<dyn ConsoleSink>,
    ) -> Result<Self> {
        let url = config.ws_url()?;
        let (inputs_tx, inputs) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (links_tx, links) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionState::Disconnected);

        let probe = config
            .availability_probe_interval
            .map(|period| OwnedTask::every(period, events_tx.clone(), Event::ProbeTick));

        let driver = ConnectionDriver {
            url,
            connect_timeout: config.request_timeout,
            log_read_limit: config.log_read_limit,
            api,
            sink,
            fsm: ConnectionManager::new(config),
            inputs,
            events_tx,
            events,
            links_tx,
            links,
            status: status_tx,
            generation: 0,
            writer: None,
            connecting: None,
            reader: None,
            heartbeat: None,
            reconnect: None,
            polling: None,
            poll_request: None,
            _probe: probe,
        };
        tokio::spawn(driver.run());

        Ok(Self {
            inputs: inputs_tx,
            status,
        })
    }

    fn post(&self, input: Input) -> Result<()> {
        self.inputs.send(input).map_err(|_| Error::ConnectionClosed)
    }

    /// Open the channel. No-op while Open or Connecting.
    pub fn connect(&self) -> Result<()> {
        self.post(Input::Event(Event::Connect))
    }

    /// Close with the normal code and stop reconnecting.
    pub fn close(&self) -> Result<()> {
        self.post(Input::Event(Event::Close))
    }

    /// Send a control message. `false` when the channel is not Open; nothing is queued.
    pub async fn send(&self, message: ClientMessage) -> bool {
        let (reply, sent) = oneshot::channel();
        if self.post(Input::Send(message, reply)).is_err() {
            return false;
        }
        sent.await.unwrap_or(false)
    }

    /// Follow `file` from `from_offset`. Remembered across reconnects; served by
    /// polling while the channel is down.
    pub fn subscribe_log(&self, file: impl Into<String>, from_offset: u64) -> Result<()> {
        self.post(Input::Event(Event::SubscribeLog {
            file: file.into(),
            from_offset,
        }))
    }

    pub fn unsubscribe_log(&self) -> Result<()> {
        self.post(Input::Event(Event::UnsubscribeLog))
    }

    /// Ask for the log file list over the channel, or over HTTP when it is down.
    pub fn request_log_files(&self) -> Result<()> {
        self.post(Input::Event(Event::RequestLogFiles))
    }

    pub async fn subscription(&self) -> Option<Subscription> {
        let (reply, current) = oneshot::channel();
        self.post(Input::Subscription(reply)).ok()?;
        current.await.ok()
    }

    pub fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    /// Wait until the channel reaches `state`. `false` if the driver stopped first.
    pub async fn wait_for(&self, state: ConnectionState) -> bool {
        let mut status = self.status.clone();
        let reached = status.wait_for(|current| *current == state).await.is_ok();
        reached
    }
}

struct ConnectionDriver {
    url: Url,
    connect_timeout: std::time::Duration,
    log_read_limit: u32,
    api: Arc<dyn ConsoleApi>,
    sink: Arc<dyn ConsoleSink>,
    fsm: ConnectionManager,

    inputs: mpsc::UnboundedReceiver<Input>,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    links_tx: mpsc::UnboundedSender<Link>,
    links: mpsc::UnboundedReceiver<Link>,
    status: watch::Sender<ConnectionState>,

    /// Bumped whenever the current socket is abandoned; older reports are ignored.
    generation: u64,
    writer: Option<ChannelWriter>,
    connecting: Option<OwnedTask>,
    reader: Option<OwnedTask>,
    heartbeat: Option<OwnedTask>,
    reconnect: Option<OwnedTask>,
    polling: Option<OwnedTask>,
    /// Outstanding `read_log` call and the file it reads.
    poll_request: Option<(String, OwnedTask)>,
    _probe: Option<OwnedTask>,
}

impl ConnectionDriver {
    async fn run(mut self) {
        info!("Connection: driver started for {}", self.url);
        loop {
            tokio::select! {
                input = self.inputs.recv() => match input {
                    Some(input) => self.on_input(input).await,
                    None => break,
                },
                Some(link) = self.links.recv() => self.on_link(link).await,
                Some(event) = self.events.recv() => self.feed(event).await,
            }
        }
        self.feed(Event::Close).await;
        info!("Connection: driver stopped");
    }

    async fn on_input(&mut self, input: Input) {
        match input {
            Input::Event(event) => self.feed(event).await,
            Input::Send(message, reply) => {
                let sent = match self.fsm.send(message) {
                    Some(Command::Send(message)) => self.write(&message).await,
                    _ => false,
                };
                let _ = reply.send(sent);
            }
            Input::Subscription(reply) => {
                let _ = reply.send(self.fsm.subscription().clone());
            }
        }
    }

    async fn on_link(&mut self, link: Link) {
        match link {
            Link::Opened { generation, .. } | Link::Transport { generation, .. }
                if generation != self.generation =>
            {
                debug!("Connection: stale report from generation {}", generation);
            }
            Link::Opened { result: Ok(stream), .. } => {
                self.connecting = None;
                self.attach(stream);
                self.feed(Event::TransportOpened).await;
            }
            Link::Opened { result: Err(e), .. } => {
                self.connecting = None;
                self.feed(Event::TransportFailed(e.to_string())).await;
            }
            Link::Transport { event, .. } => match event {
                TransportEvent::Frame(text) => self.feed(Event::Frame(text)).await,
                TransportEvent::Closed { code, reason } => {
                    self.writer = None;
                    self.feed(Event::TransportClosed { code, reason }).await;
                }
                TransportEvent::Error(e) => {
                    self.writer = None;
                    self.feed(Event::TransportError(e)).await;
                }
            },
        }
    }

    async fn feed(&mut self, event: Event) {
        if let Event::LogPolled { file, .. } | Event::LogPollFailed { file, .. } = &event {
            if self.poll_request.as_ref().is_some_and(|(pending, _)| pending == file) {
                self.poll_request = None;
            }
        }
        for command in self.fsm.handle(event) {
            self.execute(command).await;
        }
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::OpenTransport => self.open_transport(),
            Command::CloseTransport { code } => self.close_transport(code).await,
            Command::Send(message) => {
                self.write(&message).await;
            }
            Command::StartHeartbeat(period) => {
                self.heartbeat = Some(OwnedTask::every(
                    period,
                    self.events_tx.clone(),
                    Event::HeartbeatTick,
                ));
            }
            Command::StopHeartbeat => self.heartbeat = None,
            Command::ScheduleReconnect(delay) => {
                self.reconnect = Some(OwnedTask::once(
                    delay,
                    self.events_tx.clone(),
                    Event::ReconnectTick,
                ));
            }
            Command::CancelReconnect => self.reconnect = None,
            Command::StartPolling(period) => {
                self.polling = Some(OwnedTask::every(
                    period,
                    self.events_tx.clone(),
                    Event::PollTick,
                ));
            }
            Command::StopPolling => {
                self.polling = None;
                self.poll_request = None;
            }
            Command::PollLog { file, since } => self.poll_log(file, since),
            Command::FetchLogFiles => self.fetch_log_files(),
            Command::Probe => self.probe(),
            Command::Deliver(delivery) => self.deliver(delivery),
        }
    }

    fn abandon_transport(&mut self) {
        self.generation += 1;
        self.writer = None;
        self.connecting = None;
        self.reader = None;
    }

    fn open_transport(&mut self) {
        self.abandon_transport();
        let generation = self.generation;
        let url = self.url.clone();
        let timeout = self.connect_timeout;
        let links = self.links_tx.clone();
        debug!("Connection: opening {} (generation {})", url, generation);
        self.connecting = Some(OwnedTask::spawn(async move {
            let result = transport::open(&url, timeout).await;
            let _ = links.send(Link::Opened { generation, result });
        }));
    }

    fn attach(&mut self, stream: WsStream) {
        let (writer, mut reader) = transport::split(stream);
        let generation = self.generation;
        let links = self.links_tx.clone();
        self.writer = Some(writer);
        self.reader = Some(OwnedTask::spawn(async move {
            while let Some(event) = reader.next_event().await {
                if links.send(Link::Transport { generation, event }).is_err() {
                    break;
                }
            }
        }));
    }

    async fn close_transport(&mut self, code: u16) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.close(code, "").await {
                debug!("Connection: close frame not sent: {}", e);
            }
        }
        self.abandon_transport();
    }

    async fn write(&mut self, message: &ClientMessage) -> bool {
        let Some(writer) = self.writer.as_mut() else {
            return false;
        };
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Connection: cannot encode {:?}: {}", message, e);
                return false;
            }
        };
        match writer.send_text(text).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Connection: send failed: {}", e);
                false
            }
        }
    }

    /// One read at a time per file; a read for another file replaces the outstanding one.
    fn poll_log(&mut self, file: String, since: u64) {
        if let Some((pending, _)) = &self.poll_request {
            if *pending == file {
                debug!("Connection: poll of {} still outstanding, tick skipped", file);
                return;
            }
        }
        let api = self.api.clone();
        let events = self.events_tx.clone();
        let limit = self.log_read_limit;
        let polled = file.clone();
        let request = OwnedTask::spawn(async move {
            match api.read_log(&polled, since, limit).await {
                Ok(read) => {
                    let _ = events.send(Event::LogPolled { file: polled, read });
                }
                Err(e) => {
                    let _ = events.send(Event::LogPollFailed {
                        file: polled,
                        reason: e.to_string(),
                    });
                }
            }
        });
        self.poll_request = Some((file, request));
    }

    fn fetch_log_files(&self) {
        let api = self.api.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            match api.list_log_files().await {
                Ok(files) => {
                    let _ = events.send(Event::LogFilesListed(files));
                }
                Err(e) => warn!("Connection: listing log files failed: {}", e),
            }
        });
    }

    fn probe(&self) {
        let api = self.api.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            match api.probe().await {
                Ok(()) => {
                    let _ = events.send(Event::ServerAvailable);
                }
                Err(e) => {
                    debug!("Connection: server unavailable: {}", e);
                    let _ = events.send(Event::ServerUnavailable);
                }
            }
        });
    }

    fn deliver(&self, delivery: Delivery) {
        match delivery {
            Delivery::Status(state) => {
                self.status.send_replace(state);
                self.sink.connection_status(state);
            }
            Delivery::Snapshot(snapshot) => self.sink.status_snapshot(&snapshot),
            Delivery::Deployment(update) => self.sink.deployment(&update),
            Delivery::LogLines {
                file,
                lines,
                replace,
            } => self.sink.log_lines(file.as_deref(), &lines, replace),
            Delivery::LogFiles(files) => self.sink.log_files(&files),
            Delivery::Notice(notice) => self.sink.notify(&notice),
            Delivery::HistoryChanged => self.sink.history_changed(),
        }
    }
}
