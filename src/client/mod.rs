//! The public client: one owning task that feeds [`AppEvent`]s through the
//! dispatcher and performs the resulting actions, plus a cloneable
//! [`ClientHandle`] for issuing requests from anywhere.

pub mod events;

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, error, info};

use crate::app::action::Action;
use crate::app::event::{AppEvent, ClientCommand, LinkPurpose, Reply, Timer};
use crate::app::handler;
use crate::app::state::Session;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::irc::commands::{self, Directive};
use crate::irc::manager::TransportManager;
use crate::irc::resolver::{EndpointResolver, Prober, TcpProber};
use crate::logging::ChatLogger;

pub use crate::app::correlator::CommandOutcome;
pub use events::{Event, EventKind, Observers, UserRecord};

/// How often the keepalive watchdog runs.
pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(10);
/// Upper bound on waiting for a `mods` listing.
pub const MODS_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Client<P: Prober + 'static = TcpProber> {
    session: Session,
    observers: Observers,
    resolver: Arc<Mutex<EndpointResolver<P>>>,
    connected: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<AppEvent>,
    event_rx: mpsc::UnboundedReceiver<AppEvent>,
    transports: TransportManager,
    timers: HashMap<Timer, AbortHandle>,
    chat_logger: ChatLogger,
}

impl Client<TcpProber> {
    pub fn new(config: ClientConfig) -> Self {
        let timeout = Duration::from_millis(config.connection.probe_timeout_ms);
        Self::with_resolver(config, EndpointResolver::new(timeout))
    }
}

impl<P: Prober + 'static> Client<P> {
    pub fn with_resolver(config: ClientConfig, resolver: EndpointResolver<P>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            chat_logger: ChatLogger::new(&config.logging),
            session: Session::new(config),
            observers: Observers::default(),
            resolver: Arc::new(Mutex::new(resolver)),
            connected: Arc::new(AtomicBool::new(false)),
            transports: TransportManager::new(event_tx.clone()),
            event_tx,
            event_rx,
            timers: HashMap::new(),
        }
    }

    /// Register an observer for one event kind.
    pub fn on(&mut self, kind: EventKind, observer: impl FnMut(&Event) + Send + 'static) {
        self.observers.on(kind, observer);
    }

    /// Register an observer for every event.
    pub fn on_any(&mut self, observer: impl FnMut(&Event) + Send + 'static) {
        self.observers.on_any(observer);
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            tx: self.event_tx.clone(),
        }
    }

    /// Connect and process events until the session ends. Returns `Ok` after
    /// a requested disconnect and the terminal error otherwise.
    pub async fn run(mut self) -> Result<(), ClientError> {
        self.session.wants_membership =
            self.observers.receives(EventKind::Join) || self.observers.receives(EventKind::Part);
        self.step(AppEvent::Command(ClientCommand::Connect))?;

        let mut watchdog = tokio::time::interval(WATCHDOG_PERIOD);
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.session.is_finished() {
            let event = tokio::select! {
                Some(event) = self.event_rx.recv() => event,
                Some((transport, endpoint, result)) = self.transports.next_opened() => match result {
                    Ok(opened) => {
                        let peer = opened.peer;
                        self.transports.adopt(opened);
                        AppEvent::TransportReady { transport, endpoint, peer }
                    }
                    Err(error) => AppEvent::TransportFailed { transport, error },
                },
                _ = watchdog.tick() => AppEvent::WatchdogTick,
            };
            if let Err(err) = self.step(event) {
                self.shutdown();
                return Err(err);
            }
        }

        self.shutdown();
        match self.session.terminal.take() {
            Some(ClientError::ClientStopped) | None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Dispatch one event and perform its actions.
    fn step(&mut self, event: AppEvent) -> Result<(), ClientError> {
        if let AppEvent::Timer(timer) = &event {
            self.timers.remove(timer);
        }
        let session = &mut self.session;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler::handle_event(session, event)));
        match outcome {
            Ok(actions) => {
                for action in actions {
                    self.execute(action)?;
                }
            }
            Err(payload) => self.crashed(panic_message(payload.as_ref()))?,
        }
        self.connected
            .store(self.session.link.is_connected(), Ordering::SeqCst);
        Ok(())
    }

    fn crashed(&mut self, message: String) -> Result<(), ClientError> {
        error!(%message, "Internal fault while handling an event");
        let stack = Backtrace::force_capture().to_string();
        self.session.reset_after_crash();
        let crash = Event::Crash {
            message: message.clone(),
            stack,
        };
        let observers = &mut self.observers;
        if panic::catch_unwind(AssertUnwindSafe(|| observers.dispatch(&crash))).is_err() {
            error!("Observer fault while reporting a crash");
        }
        if self.session.config.options.exit_on_crash {
            return Err(ClientError::Crashed(message));
        }
        Ok(())
    }

    fn execute(&mut self, action: Action) -> Result<(), ClientError> {
        match action {
            Action::Send { transport, line } => self.transports.send(transport, line),
            Action::Emit(event) => self.notify(event)?,
            Action::Schedule { timer, after } => self.schedule(timer, after),
            Action::Cancel(timer) => {
                if let Some(handle) = self.timers.remove(&timer) {
                    handle.abort();
                }
            }
            Action::Resolve {
                purpose,
                preferred_address,
                preferred_port,
            } => self.resolve(purpose, preferred_address, preferred_port),
            Action::Open { transport, endpoint } => self.transports.open(transport, endpoint),
            Action::Close { transport } => self.transports.close(transport),
        }
        Ok(())
    }

    fn notify(&mut self, event: Event) -> Result<(), ClientError> {
        let kind = event.kind();
        if !self.session.config.options.debug_ignore.contains(&kind) {
            debug!(?kind, ?event, "event");
        }
        self.chat_logger.log_event(&event);
        let observers = &mut self.observers;
        match panic::catch_unwind(AssertUnwindSafe(|| observers.dispatch(&event))) {
            Ok(()) => Ok(()),
            Err(payload) => self.crashed(panic_message(payload.as_ref())),
        }
    }

    fn schedule(&mut self, timer: Timer, after: Duration) {
        if let Some(previous) = self.timers.remove(&timer) {
            previous.abort();
        }
        let tx = self.event_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(AppEvent::Timer(timer));
        });
        self.timers.insert(timer, task.abort_handle());
    }

    fn resolve(&self, purpose: LinkPurpose, address: Option<String>, port: Option<u16>) {
        let resolver = Arc::clone(&self.resolver);
        let connected = Arc::clone(&self.connected);
        let tx = self.event_tx.clone();
        let class = self.session.config.connection.service_class;
        tokio::spawn(async move {
            let endpoint = resolver
                .lock()
                .await
                .resolve(class, address.as_deref(), port, &connected)
                .await;
            let _ = tx.send(AppEvent::Resolved { purpose, endpoint });
        });
    }

    fn shutdown(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        if !self.transports.is_empty() {
            info!(open = self.transports.len(), "Closing remaining transports");
        }
        self.transports.close_all();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Completion of a request, resolved by the client task.
#[must_use = "an Ack does nothing unless awaited or dropped deliberately"]
pub struct Ack {
    rx: oneshot::Receiver<CommandOutcome>,
}

impl Future for Ack {
    type Output = CommandOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(CommandOutcome::NotSent(ClientError::ClientStopped)))
    }
}

/// Cloneable sender of requests to a running [`Client`].
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<AppEvent>,
}

impl ClientHandle {
    fn request(&self, build: impl FnOnce(Reply) -> ClientCommand) -> Ack {
        let (done, rx) = oneshot::channel();
        // A stopped client drops the command and with it `done`.
        let _ = self.tx.send(AppEvent::Command(build(done)));
        Ack { rx }
    }

    async fn query<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ClientCommand) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(AppEvent::Command(build(reply))).ok()?;
        rx.await.ok()
    }

    fn moderate(&self, channel: &str, directive: Directive) -> Ack {
        self.request(|done| ClientCommand::Moderate {
            channel: channel.to_string(),
            directive,
            done,
        })
    }

    /// Send a chat line. A leading `/me ` sends it as an action.
    pub fn say(&self, channel: &str, text: &str) -> Ack {
        self.request(|done| ClientCommand::Say {
            channel: channel.to_string(),
            text: text.to_string(),
            done,
        })
    }

    pub fn action(&self, channel: &str, text: &str) -> Ack {
        self.request(|done| ClientCommand::Action {
            channel: channel.to_string(),
            text: text.to_string(),
            done,
        })
    }

    pub fn join(&self, channel: &str) -> Ack {
        self.request(|done| ClientCommand::Join {
            channel: channel.to_string(),
            done,
        })
    }

    pub fn part(&self, channel: &str) -> Ack {
        self.request(|done| ClientCommand::Part {
            channel: channel.to_string(),
            done,
        })
    }

    /// Measure latency; the result arrives as a `pong` event.
    pub fn ping(&self) -> Ack {
        self.request(|done| ClientCommand::Ping { done })
    }

    pub fn raw(&self, line: &str) -> Ack {
        self.request(|done| ClientCommand::Raw {
            line: line.to_string(),
            done,
        })
    }

    pub fn disconnect(&self) -> Ack {
        self.request(|done| ClientCommand::Disconnect { done })
    }

    pub fn ban(&self, channel: &str, user: &str) -> Ack {
        self.moderate(channel, Directive::Ban { user: user.to_string() })
    }

    pub fn unban(&self, channel: &str, user: &str) -> Ack {
        self.moderate(channel, Directive::Unban { user: user.to_string() })
    }

    /// Time a user out, 300 seconds unless given.
    pub fn timeout(&self, channel: &str, user: &str, seconds: Option<u32>) -> Ack {
        self.moderate(
            channel,
            Directive::Timeout {
                user: user.to_string(),
                seconds: seconds.unwrap_or(commands::DEFAULT_TIMEOUT_SECS),
            },
        )
    }

    pub fn mod_user(&self, channel: &str, user: &str) -> Ack {
        self.moderate(channel, Directive::Mod { user: user.to_string() })
    }

    pub fn unmod_user(&self, channel: &str, user: &str) -> Ack {
        self.moderate(channel, Directive::Unmod { user: user.to_string() })
    }

    pub fn slow(&self, channel: &str, seconds: Option<u32>) -> Ack {
        let seconds = seconds.unwrap_or(commands::DEFAULT_SLOW_SECS);
        self.moderate(channel, Directive::Slow { seconds })
    }

    pub fn slow_off(&self, channel: &str) -> Ack {
        self.moderate(channel, Directive::SlowOff)
    }

    pub fn subscribers(&self, channel: &str) -> Ack {
        self.moderate(channel, Directive::Subscribers)
    }

    pub fn subscribers_off(&self, channel: &str) -> Ack {
        self.moderate(channel, Directive::SubscribersOff)
    }

    pub fn r9kbeta(&self, channel: &str) -> Ack {
        self.moderate(channel, Directive::R9kBeta)
    }

    pub fn r9kbeta_off(&self, channel: &str) -> Ack {
        self.moderate(channel, Directive::R9kBetaOff)
    }

    pub fn clear(&self, channel: &str) -> Ack {
        self.moderate(channel, Directive::Clear)
    }

    pub fn color(&self, channel: &str, color: &str) -> Ack {
        self.moderate(channel, Directive::Color { color: color.to_string() })
    }

    pub fn host(&self, channel: &str, target: &str) -> Ack {
        self.moderate(channel, Directive::Host { target: target.to_string() })
    }

    pub fn unhost(&self, channel: &str) -> Ack {
        self.moderate(channel, Directive::Unhost)
    }

    /// Run a commercial. Lengths outside the allowed set become 30 seconds.
    pub fn commercial(&self, channel: &str, seconds: Option<u32>) -> Ack {
        let seconds = commands::clamp_commercial(seconds);
        self.moderate(channel, Directive::Commercial { seconds })
    }

    /// Moderators of `channel` from the next listing the server sends.
    /// Empty at legacy levels 1 and 2, when not joined, or on timeout.
    pub async fn mods(&self, channel: &str) -> Vec<String> {
        let request = self.query(|reply| ClientCommand::Mods {
            channel: channel.to_string(),
            reply,
        });
        match tokio::time::timeout(MODS_TIMEOUT, request).await {
            Ok(mods) => mods.unwrap_or_default(),
            Err(_) => {
                debug!(%channel, "No moderator listing arrived");
                Vec::new()
            }
        }
    }

    pub async fn is_mod(&self, channel: &str, user: &str) -> bool {
        self.query(|reply| ClientCommand::IsMod {
            channel: channel.to_string(),
            user: user.to_string(),
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Joined channels in `#name` form.
    pub async fn channels(&self) -> Vec<String> {
        self.query(|reply| ClientCommand::Channels { reply })
            .await
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn requests_to_a_stopped_client_report_stopped() {
        let client = Client::new(ClientConfig::default());
        let handle = client.handle();
        drop(client);

        assert_eq!(
            handle.say("#chan", "hi").await,
            CommandOutcome::NotSent(ClientError::ClientStopped)
        );
        assert!(handle.mods("#chan").await.is_empty());
        assert!(!handle.is_mod("#chan", "bob").await);
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 1");
        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }
}
