// Real-time channel state machine
//
// Pure: every input is an `Event`, every side effect is a returned `Command`.
// The driver owns the socket and timers and carries the commands out.

use std::time::Duration;

use log::{debug, info, warn};

use super::api::LogRead;
use super::sink::Notice;
use crate::codec;
use crate::common::config::ClientConfig;
use crate::common::types::*;
use crate::protocol::{
    ClientMessage, DeploymentStatus, DeploymentUpdate, LogFileInfo, LogTail, ServerMessage,
    StatusSnapshot,
};

/// Exponential reconnect schedule: `base * multiplier^attempt`, `max_attempts` times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempt: u32,
    max_attempts: u32,
    base_delay: Duration,
    multiplier: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, multiplier: u32, max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay,
            multiplier,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(self.multiplier.saturating_pow(attempt))
    }

    /// Delay for the next attempt, or `None` once every attempt has been used.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(RECONNECT_BASE_DELAY, RECONNECT_MULTIPLIER, MAX_RECONNECT_ATTEMPTS)
    }
}

/// Log subscription intent. Survives reconnects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    pub file: Option<String>,
    /// Last consumed offset; only moves forward for the same file.
    pub offset: u64,
}

impl Subscription {
    fn select(&mut self, file: String, from_offset: u64) {
        self.file = Some(file);
        self.offset = from_offset;
    }

    fn clear(&mut self) {
        self.file = None;
        self.offset = 0;
    }

    fn advance(&mut self, offset: Option<u64>) {
        if let Some(offset) = offset {
            self.offset = self.offset.max(offset);
        }
    }

    /// Lines tagged with another file belong to an older selection.
    fn accepts(&self, file: Option<&str>) -> bool {
        match (file, self.file.as_deref()) {
            (Some(tagged), Some(active)) => tagged == active,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // caller
    Connect,
    Close,
    SubscribeLog { file: String, from_offset: u64 },
    UnsubscribeLog,
    RequestLogFiles,
    // transport
    TransportOpened,
    TransportFailed(String),
    TransportClosed { code: u16, reason: String },
    TransportError(String),
    Frame(String),
    // timers
    HeartbeatTick,
    ReconnectTick,
    PollTick,
    ProbeTick,
    // HTTP results
    LogPolled { file: String, read: LogRead },
    LogPollFailed { file: String, reason: String },
    LogFilesListed(Vec<LogFileInfo>),
    ServerAvailable,
    ServerUnavailable,
}

/// Something the sink should be told.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Status(ConnectionState),
    Snapshot(StatusSnapshot),
    Deployment(DeploymentUpdate),
    LogLines {
        file: Option<String>,
        lines: Vec<String>,
        replace: bool,
    },
    LogFiles(Vec<LogFileInfo>),
    Notice(Notice),
    HistoryChanged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    OpenTransport,
    CloseTransport { code: u16 },
    Send(ClientMessage),
    StartHeartbeat(Duration),
    StopHeartbeat,
    ScheduleReconnect(Duration),
    CancelReconnect,
    StartPolling(Duration),
    StopPolling,
    PollLog { file: String, since: u64 },
    FetchLogFiles,
    Probe,
    Deliver(Delivery),
}

pub struct ConnectionManager {
    state: ConnectionState,
    policy: ReconnectPolicy,
    subscription: Subscription,
    heartbeat_interval: Duration,
    poll_interval: Duration,
    /// Set by `Close` or a normal server close, cleared by `Connect`: no reconnects, no probing.
    stay_closed: bool,
    /// Last probe result. Only the unreachable to reachable edge reconnects.
    server_reachable: bool,
}

impl ConnectionManager {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy: ReconnectPolicy::new(
                config.reconnect_base_delay,
                config.reconnect_multiplier,
                config.max_reconnect_attempts,
            ),
            subscription: Subscription::default(),
            heartbeat_interval: config.heartbeat_interval,
            poll_interval: config.log_poll_interval,
            stay_closed: false,
            server_reachable: true,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Accept an outbound message only while Open. Nothing is queued.
    pub fn send(&self, message: ClientMessage) -> Option<Command> {
        match self.state {
            ConnectionState::Open => Some(Command::Send(message)),
            _ => None,
        }
    }

    /// Single event intake.
    pub fn handle(&mut self, event: Event) -> Vec<Command> {
        use ConnectionState::*;

        let mut out = Vec::new();
        match event {
            Event::Connect => {
                self.stay_closed = false;
                match self.state {
                    Disconnected => self.open(&mut out),
                    Reconnecting => {
                        out.push(Command::CancelReconnect);
                        self.open(&mut out);
                    }
                    Connecting | Open => {}
                }
            }

            Event::Close => {
                self.stay_closed = true;
                match self.state {
                    Open => {
                        out.push(Command::StopHeartbeat);
                        out.push(Command::CloseTransport { code: NORMAL_CLOSURE });
                    }
                    Connecting => out.push(Command::CloseTransport { code: NORMAL_CLOSURE }),
                    Reconnecting => out.push(Command::CancelReconnect),
                    Disconnected => {}
                }
                out.push(Command::StopPolling);
                self.transition(Disconnected, &mut out);
            }

            Event::SubscribeLog { file, from_offset } => {
                let open = self.state == Open;
                if open && self.subscription.file.is_some() {
                    out.push(Command::Send(ClientMessage::UnsubscribeLog));
                }
                self.subscription.select(file.clone(), from_offset);
                if open {
                    out.push(Command::Send(ClientMessage::subscribe_log(file, from_offset)));
                } else {
                    self.start_polling(&mut out);
                }
            }

            Event::UnsubscribeLog => {
                if self.subscription.file.is_some() && self.state == Open {
                    out.push(Command::Send(ClientMessage::UnsubscribeLog));
                }
                self.subscription.clear();
                out.push(Command::StopPolling);
            }

            Event::RequestLogFiles => match self.state {
                Open => out.push(Command::Send(ClientMessage::GetLogFiles)),
                Disconnected | Connecting | Reconnecting => out.push(Command::FetchLogFiles),
            },

            Event::TransportOpened => match self.state {
                Connecting => {
                    info!("Connection: channel open");
                    self.policy.reset();
                    self.transition(Open, &mut out);
                    out.push(Command::StartHeartbeat(self.heartbeat_interval));
                    out.push(Command::Send(ClientMessage::subscribe_all()));
                    if let Some(file) = self.subscription.file.clone() {
                        out.push(Command::Send(ClientMessage::subscribe_log(
                            file,
                            self.subscription.offset,
                        )));
                    }
                    out.push(Command::Send(ClientMessage::GetLogFiles));
                    out.push(Command::StopPolling);
                    out.push(Command::Deliver(Delivery::Notice(Notice::success(
                        "Real-time Connected",
                        "Live updates enabled",
                    ))));
                }
                // Opened after the caller gave up on it
                Disconnected | Reconnecting | Open => {
                    out.push(Command::CloseTransport { code: NORMAL_CLOSURE })
                }
            },

            Event::TransportFailed(reason) => match self.state {
                Connecting => {
                    warn!("Connection: connect failed: {}", reason);
                    self.schedule_reconnect(&mut out);
                }
                Disconnected | Reconnecting | Open => {}
            },

            Event::TransportClosed { code, reason } => self.closed(code, &reason, &mut out),

            Event::TransportError(reason) => self.closed(1006, &reason, &mut out),

            Event::Frame(raw) => match self.state {
                Open => self.dispatch(&raw, &mut out),
                Disconnected | Connecting | Reconnecting => {
                    debug!("Connection: frame outside Open dropped");
                }
            },

            Event::HeartbeatTick => match self.state {
                Open => out.push(Command::Send(ClientMessage::Heartbeat)),
                Disconnected | Connecting | Reconnecting => out.push(Command::StopHeartbeat),
            },

            Event::ReconnectTick => match self.state {
                Reconnecting => {
                    info!("Connection: reconnect attempt {}", self.policy.attempt());
                    self.open(&mut out);
                }
                Disconnected | Connecting | Open => {}
            },

            Event::PollTick => match (self.state, self.subscription.file.clone()) {
                (Open, _) | (_, None) => out.push(Command::StopPolling),
                (_, Some(file)) => out.push(Command::PollLog {
                    file,
                    since: self.subscription.offset,
                }),
            },

            Event::ProbeTick => {
                if self.state == Disconnected && !self.stay_closed {
                    out.push(Command::Probe);
                }
            }

            Event::LogPolled { file, read } => {
                if self.subscription.file.as_deref() == Some(file.as_str()) {
                    self.subscription.advance(read.last_id);
                    if !read.lines.is_empty() {
                        out.push(Command::Deliver(Delivery::LogLines {
                            file: Some(file),
                            lines: read.lines,
                            replace: false,
                        }));
                    }
                }
            }

            Event::LogPollFailed { file, reason } => {
                warn!("Connection: polling {} failed: {}", file, reason);
            }

            Event::LogFilesListed(files) => {
                out.push(Command::Deliver(Delivery::LogFiles(files)));
            }

            Event::ServerAvailable => {
                let recovered = !self.server_reachable;
                self.server_reachable = true;
                if recovered && self.state == Disconnected && !self.stay_closed {
                    info!("Connection: server reachable again, reconnecting");
                    self.policy.reset();
                    self.open(&mut out);
                }
            }

            Event::ServerUnavailable => {
                if self.server_reachable {
                    debug!("Connection: server unreachable");
                }
                self.server_reachable = false;
            }
        }
        out
    }

    fn transition(&mut self, next: ConnectionState, out: &mut Vec<Command>) {
        if self.state != next {
            debug!("Connection: {:?} -> {:?}", self.state, next);
            self.state = next;
            out.push(Command::Deliver(Delivery::Status(next)));
        }
    }

    fn open(&mut self, out: &mut Vec<Command>) {
        self.transition(ConnectionState::Connecting, out);
        out.push(Command::OpenTransport);
    }

    fn start_polling(&self, out: &mut Vec<Command>) {
        if let Some(file) = self.subscription.file.clone() {
            out.push(Command::PollLog {
                file,
                since: self.subscription.offset,
            });
            out.push(Command::StartPolling(self.poll_interval));
        }
    }

    fn closed(&mut self, code: u16, reason: &str, out: &mut Vec<Command>) {
        use ConnectionState::*;
        match self.state {
            Open => {
                info!("Connection: closed ({}) {}", code, reason);
                out.push(Command::StopHeartbeat);
                self.start_polling(out);
                if code == NORMAL_CLOSURE {
                    self.stay_closed = true;
                    self.transition(Disconnected, out);
                } else {
                    self.schedule_reconnect(out);
                }
            }
            Connecting => {
                warn!("Connection: closed while connecting ({}) {}", code, reason);
                if code == NORMAL_CLOSURE {
                    self.stay_closed = true;
                    self.transition(Disconnected, out);
                } else {
                    self.schedule_reconnect(out);
                }
            }
            Disconnected | Reconnecting => {}
        }
    }

    fn schedule_reconnect(&mut self, out: &mut Vec<Command>) {
        if self.stay_closed {
            self.transition(ConnectionState::Disconnected, out);
            return;
        }
        match self.policy.next_delay() {
            Some(delay) => {
                info!(
                    "Connection: reconnecting in {}ms (attempt {})",
                    delay.as_millis(),
                    self.policy.attempt()
                );
                self.transition(ConnectionState::Reconnecting, out);
                out.push(Command::ScheduleReconnect(delay));
            }
            None => {
                warn!("Connection: max reconnection attempts reached");
                self.transition(ConnectionState::Disconnected, out);
                out.push(Command::Deliver(Delivery::Notice(Notice::warning(
                    "Connection Lost",
                    "Real-time updates unavailable. Reconnect to retry.",
                ))));
            }
        }
    }

    fn dispatch(&mut self, raw: &str, out: &mut Vec<Command>) {
        let message = match codec::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Connection: dropping frame: {}", e);
                return;
            }
        };

        debug!("Connection: {} message", message.kind());
        match message {
            ServerMessage::Pmon(snapshot) => {
                out.push(Command::Deliver(Delivery::Snapshot(snapshot)));
            }
            ServerMessage::Deployment(update) => {
                let detail = update.details.message.clone().unwrap_or_default();
                let notice = match update.status {
                    DeploymentStatus::Started => Some(Notice::info("Deployment Started", detail)),
                    DeploymentStatus::Completed => {
                        Some(Notice::success("Deployment Complete", detail))
                    }
                    DeploymentStatus::Failed => Some(Notice::error("Deployment Failed", detail)),
                    DeploymentStatus::Progress | DeploymentStatus::Other => None,
                };
                let finished = matches!(
                    update.status,
                    DeploymentStatus::Completed | DeploymentStatus::Failed
                );
                out.push(Command::Deliver(Delivery::Deployment(update)));
                if let Some(notice) = notice {
                    out.push(Command::Deliver(Delivery::Notice(notice)));
                }
                if finished {
                    out.push(Command::Deliver(Delivery::HistoryChanged));
                }
            }
            ServerMessage::Log(tail) => self.log_tail(tail, false, out),
            ServerMessage::LogContent(tail) => self.log_tail(tail, true, out),
            ServerMessage::LogFiles(list) => {
                out.push(Command::Deliver(Delivery::LogFiles(list.files)));
            }
            ServerMessage::Heartbeat => debug!("Connection: heartbeat acknowledged"),
            ServerMessage::Notification(notification) => {
                out.push(Command::Deliver(Delivery::Notice(notification.into())));
            }
            ServerMessage::Error(error) => {
                let message = error.message.unwrap_or_else(|| "Unknown error".to_string());
                warn!("Connection: server error: {}", message);
                out.push(Command::Deliver(Delivery::Notice(Notice::error(
                    "Server Error",
                    message,
                ))));
            }
            ServerMessage::Unknown { kind } => {
                info!("Connection: ignoring unknown message type {:?}", kind);
            }
        }
    }

    fn log_tail(&mut self, tail: LogTail, replace: bool, out: &mut Vec<Command>) {
        if !self.subscription.accepts(tail.file.as_deref()) {
            debug!("Connection: log lines for {:?} ignored", tail.file);
            return;
        }
        self.subscription.advance(tail.last_pos);
        if replace || !tail.lines.is_empty() {
            out.push(Command::Deliver(Delivery::LogLines {
                file: tail.file,
                lines: tail.lines,
                replace,
            }));
        }
    }
}
