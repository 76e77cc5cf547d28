use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::app::action::Action;
use crate::app::event::{AppEvent, LinkPurpose, Timer, TransportId};
use crate::app::joins::JOIN_INTERVAL;
use crate::app::legacy::{
    self, ControlLine, Keyword, Notice, Notification, CONTROL_IDENTITY, NOTIFY_IDENTITY,
};
use crate::app::requests;
use crate::app::state::Session;
use crate::client::events::{DisconnectReason, Event, UserRecord};
use crate::error::ClientError;
use crate::irc::commands::{self, normalize_channel, wire_channel};
use crate::irc::manager::{Phase, Retry, GRACE_WINDOW};
use crate::irc::message::ProtocolMessage;
use crate::irc::resolver::Endpoint;

/// Without a server PING for this long the connection is presumed dead.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(360);
pub const KEEPALIVE_RECONNECT_DELAY: Duration = Duration::from_secs(2);

const LOGIN_FAILURES: &[&str] = &[
    "Login unsuccessful",
    "Login authentication failed",
    "Error logging in",
    "Improperly formatted auth",
    "Invalid NICK",
];

pub fn handle_event(session: &mut Session, event: AppEvent) -> Vec<Action> {
    match event {
        AppEvent::Message { transport, message } => handle_message(session, transport, &message),
        AppEvent::TransportReady { transport, endpoint, peer } => {
            handle_ready(session, transport, endpoint, peer)
        }
        AppEvent::TransportFailed { transport, error } => handle_failure(session, transport, error),
        AppEvent::Resolved { purpose, endpoint } => handle_resolved(session, purpose, endpoint),
        AppEvent::Command(command) => requests::handle_command(session, command),
        AppEvent::Timer(timer) => handle_timer(session, timer),
        AppEvent::WatchdogTick => handle_watchdog(session),
    }
    session.take_actions()
}

fn handle_message(session: &mut Session, transport: TransportId, message: &ProtocolMessage) {
    if message.is_numeric() {
        trace!(command = %message.command, text = message.param(1).unwrap_or(""), "raw");
    }
    if session.live == Some(transport) {
        dispatch(session, transport, message);
    } else if session.retiring == Some(transport) {
        shadow(session, transport, message);
    } else {
        trace!(transport, command = %message.command, "line from closed transport");
    }
}

/// Full protocol handling for the live transport.
fn dispatch(session: &mut Session, transport: TransportId, msg: &ProtocolMessage) {
    match msg.command.as_str() {
        "PING" => {
            session.last_server_ping = Instant::now();
            session.send(transport, commands::pong(msg.param(0)));
            session.emit(Event::Ping);
        }
        "PONG" => {
            let latency = session
                .last_ping_sent
                .take()
                .map(|sent| sent.elapsed().as_secs_f64())
                .unwrap_or_default();
            session.emit(Event::Pong { latency });
        }
        "001" => {
            if let Some(name) = msg.param(0) {
                session.username = name.to_lowercase();
            }
        }
        "372" | "376" => on_welcome(session, transport),
        "353" => on_names(session, msg),
        "CAP" => on_capabilities(session, msg),
        "JOIN" => on_join(session, msg),
        "PART" => on_part(session, msg),
        "NOTICE" => on_notice(session, transport, msg),
        "MODE" => on_mode(session, msg),
        "RECONNECT" => begin_swap(session),
        "USERSTATE" => on_userstate(session, msg),
        "CLEARCHAT" if from_server(msg) => {
            if let Some(channel) = msg.param(0) {
                clear_chat(session, &normalize_channel(channel), msg.param(1));
            }
        }
        "HOSTTARGET" if from_server(msg) => {
            if let (Some(channel), Some(body)) = (msg.param(0), msg.param(1)) {
                let args: Vec<String> = body.split(' ').map(str::to_string).collect();
                host_target(session, &normalize_channel(channel), &args);
            }
        }
        "PRIVMSG" => on_privmsg(session, msg),
        _ => {}
    }
}

/// Reduced handling for a retiring transport: connectivity events only,
/// no session mutation.
fn shadow(session: &mut Session, transport: TransportId, msg: &ProtocolMessage) {
    match msg.command.as_str() {
        "PING" => {
            session.send(transport, commands::pong(msg.param(0)));
            session.emit(Event::Ping);
        }
        "PONG" => {
            let latency = session
                .last_ping_sent
                .map(|sent| sent.elapsed().as_secs_f64())
                .unwrap_or_default();
            session.emit(Event::Pong { latency });
        }
        "JOIN" | "PART" => {
            let Some(channel) = msg.param(0) else { return };
            let channel = wire_channel(channel);
            let user = msg.sender().to_lowercase();
            let event = if msg.command == "JOIN" {
                Event::Join { channel, user }
            } else {
                Event::Part { channel, user }
            };
            session.emit(event);
        }
        _ => trace!(transport, command = %msg.command, "shadow path skipped line"),
    }
}

fn from_server(msg: &ProtocolMessage) -> bool {
    msg.prefix.as_ref().map_or(true, |p| p.is_server)
}

fn from_identity(msg: &ProtocolMessage, identity: &str) -> bool {
    msg.prefix.as_ref().is_some_and(|p| p.is(identity))
}

fn on_welcome(session: &mut Session, transport: TransportId) {
    if session.welcomed == Some(transport) {
        return;
    }
    session.welcomed = Some(transport);
    session.link.welcomed();
    session.last_server_ping = Instant::now();

    let swap = session.graceful;
    if let Some(endpoint) = session.endpoint.clone() {
        if swap {
            info!(%endpoint, "Replacement connection ready");
        } else {
            info!(%endpoint, "Connected");
            session.emit(Event::Connected {
                host: endpoint.address,
                port: endpoint.port,
            });
        }
    }

    if session.config.options.use_tags {
        session.send(transport, commands::cap_request(commands::BASE_CAPABILITIES));
    } else {
        session.send(transport, commands::cap_request("twitch.tv/commands"));
    }
    if session.wants_membership {
        session.send(transport, commands::cap_request(commands::MEMBERSHIP_CAPABILITY));
    }
    let level = session.config.options.level();
    session.send(transport, commands::legacy_level(level));

    if swap {
        let joined = session.joined.clone();
        let generation = session.joins.resume(&joined);
        join_step(session, generation);
        return;
    }
    let targets = if session.has_connected {
        session.rejoin.clone()
    } else {
        session.config.channels.iter().map(|c| normalize_channel(c)).collect()
    };
    session.has_connected = true;
    session.rejoin = targets.clone();
    let generation = session.joins.begin(&targets, true);
    join_step(session, generation);
}

fn join_step(session: &mut Session, generation: u64) {
    if let Some(channel) = session.joins.next(generation, &session.joined) {
        debug!(%channel, "Joining");
        session.send_live(commands::join(&channel));
        if session.joins.has_pending() {
            session.pending_actions.push(Action::Schedule {
                timer: Timer::JoinNext { generation },
                after: JOIN_INTERVAL,
            });
        }
    }
}

fn on_names(session: &mut Session, msg: &ProtocolMessage) {
    if !session.config.options.is_early_legacy() {
        return;
    }
    let (Some(channel), Some(list)) = (msg.param(2), msg.params.last()) else {
        return;
    };
    let names = list.split_whitespace().map(str::to_lowercase).collect();
    session.emit(Event::Names {
        channel: wire_channel(channel),
        names,
    });
}

fn on_capabilities(session: &mut Session, msg: &ProtocolMessage) {
    if msg.param(1) != Some("ACK") {
        return;
    }
    let granted = msg.params.last().map(String::as_str).unwrap_or("");
    if granted.split_whitespace().any(|cap| cap == "twitch.tv/tags") {
        debug!("Tag dialect enabled");
        session.tags_enabled = true;
    }
}

fn on_join(session: &mut Session, msg: &ProtocolMessage) {
    let Some(raw) = msg.param(0) else { return };
    let channel = normalize_channel(raw);
    let user = msg.sender().to_lowercase();
    if session.is_self(&user) {
        let fresh = session.mark_joined(&channel);
        session.joins.observe_join(&channel);
        if !fresh {
            debug!(%channel, "Already joined");
            return;
        }
        info!(%channel, "Joined");
    }
    session.emit(Event::Join {
        channel: wire_channel(&channel),
        user,
    });
}

fn on_part(session: &mut Session, msg: &ProtocolMessage) {
    let Some(raw) = msg.param(0) else { return };
    let channel = normalize_channel(raw);
    let user = msg.sender().to_lowercase();
    if session.is_self(&user) {
        session.mark_parted(&channel);
        info!(%channel, "Left");
    }
    session.emit(Event::Part {
        channel: wire_channel(&channel),
        user,
    });
}

fn on_notice(session: &mut Session, transport: TransportId, msg: &ProtocolMessage) {
    let text = msg.params.last().map(String::as_str).unwrap_or("");
    if from_server(msg) && LOGIN_FAILURES.iter().any(|f| text.contains(f)) {
        error!(reason = text, "Login rejected by server");
        session.pending_actions.push(Action::Close { transport });
        session.forget_transport();
        session.link.stop();
        session.terminal = Some(ClientError::AuthenticationRejected(text.to_string()));
        session.emit(Event::Disconnected {
            reason: DisconnectReason::LoginFailed(text.to_string()),
        });
        return;
    }

    // With the commands capability, refusals arrive as server notices.
    if let (Some(channel), ControlLine::Notice(notice)) =
        (msg.param(0), legacy::classify_control(text))
    {
        apply_notice(session, &normalize_channel(channel), notice);
    }
}

fn on_mode(session: &mut Session, msg: &ProtocolMessage) {
    if !from_identity(msg, CONTROL_IDENTITY) {
        return;
    }
    let (Some(channel), Some(mode), Some(user)) = (msg.param(0), msg.param(1), msg.param(2))
    else {
        return;
    };
    let channel = normalize_channel(channel);
    let user = user.to_lowercase();
    let Some(mods) = session.moderators.get_mut(&channel) else {
        debug!(%channel, "MODE for a channel we are not in");
        return;
    };
    let event = if mode == "+o" {
        mods.insert(user.clone());
        Event::Mod { channel: wire_channel(&channel), user }
    } else {
        mods.remove(&user);
        Event::Unmod { channel: wire_channel(&channel), user }
    };
    session.emit(event);
}

fn on_userstate(session: &mut Session, msg: &ProtocolMessage) {
    let Some(channel) = msg.param(0).map(normalize_channel) else { return };
    let record = record_from_tags(&session.username.clone(), &channel, msg);
    session.self_records.insert(channel, record);
}

fn on_privmsg(session: &mut Session, msg: &ProtocolMessage) {
    let (Some(target), Some(text)) = (msg.param(0), msg.param(1)) else {
        return;
    };
    let channel = normalize_channel(target);
    if from_identity(msg, CONTROL_IDENTITY) {
        on_control(session, &channel, text);
    } else if from_identity(msg, NOTIFY_IDENTITY) {
        on_notification(session, &channel, text);
    } else {
        on_chat(session, &channel, text, msg);
    }
}

fn on_control(session: &mut Session, channel: &str, text: &str) {
    session.emit(Event::Jtv {
        channel: wire_channel(channel),
        text: text.to_string(),
    });
    match legacy::classify_control(text) {
        ControlLine::Keyword { keyword, args } => apply_keyword(session, channel, keyword, &args),
        ControlLine::Notice(notice) => {
            if !session.config.options.is_early_legacy() {
                apply_notice(session, channel, notice);
            }
        }
        ControlLine::Unrecognized => {
            let err = ClientError::UnrecognizedControlPayload(text.to_string());
            warn!(error = %err, "Dropping control message");
        }
    }
}

fn pending_record<'a>(session: &'a mut Session, user: &str) -> &'a mut UserRecord {
    session
        .pending_records
        .entry(user.to_string())
        .or_insert_with(|| UserRecord::new(user))
}

fn apply_keyword(session: &mut Session, channel: &str, keyword: Keyword, args: &[String]) {
    let user = args.first().map(|u| u.to_lowercase());
    let value = args.get(1).cloned();
    let wire = wire_channel(channel);
    match keyword {
        Keyword::SpecialUser => {
            let (Some(user), Some(value)) = (user, value) else { return };
            pending_record(session, &user).roles.insert(value.clone());
            session.emit(Event::SpecialUser { user, value });
        }
        Keyword::UserColor => {
            let (Some(user), Some(color)) = (user, value) else { return };
            pending_record(session, &user).color = Some(color.clone());
            session.emit(Event::UserColor { user, color });
        }
        Keyword::EmoteSet => {
            let (Some(user), Some(value)) = (user, value) else { return };
            let sets = legacy::parse_emote_sets(&value);
            pending_record(session, &user).emote_sets = sets.clone();
            session.emit(Event::EmoteSet { user, sets });
        }
        Keyword::ClearChat => clear_chat(session, channel, user.as_deref()),
        Keyword::RoomBan => {
            if let Some(user) = user {
                session.emit(Event::RoomBan { channel: wire, user });
            }
        }
        Keyword::RoomChanged => session.emit(Event::RoomChanged { channel: wire }),
        Keyword::RoomDeleted => session.emit(Event::RoomDeleted { channel: wire }),
        Keyword::RoomInvite => {
            if let Some(by) = user {
                session.emit(Event::RoomInvite { channel: wire, by });
            }
        }
        Keyword::HostTarget => host_target(session, channel, args),
        Keyword::HistoryEnd => session.emit(Event::HistoryEnd { channel: wire }),
    }
}

fn clear_chat(session: &mut Session, channel: &str, user: Option<&str>) {
    let channel = wire_channel(channel);
    match user.filter(|u| !u.is_empty()) {
        Some(user) => session.emit(Event::Timeout {
            channel,
            user: user.to_lowercase(),
        }),
        None => session.emit(Event::ClearChat { channel }),
    }
}

fn host_target(session: &mut Session, channel: &str, args: &[String]) {
    let channel = wire_channel(channel);
    let remaining = args.get(1).and_then(|r| r.parse().ok());
    match args.first().map(String::as_str) {
        Some("-") | None => session.emit(Event::Unhost { channel, remaining }),
        Some(target) => session.emit(Event::Hosting {
            channel,
            target: target.to_lowercase(),
            remaining,
        }),
    }
}

fn apply_notice(session: &mut Session, channel: &str, notice: Notice) {
    if let Some(text) = notice.rejection() {
        session.correlator.hold_rejection(text, Instant::now());
    }
    let wire = wire_channel(channel);
    match notice {
        Notice::Subscribers(enabled) => session.emit(Event::Subscriber { channel: wire, enabled }),
        Notice::Slow(seconds) => session.emit(Event::SlowMode {
            channel: wire,
            enabled: seconds.is_some(),
            seconds,
        }),
        Notice::R9k(enabled) => session.emit(Event::R9kBeta { channel: wire, enabled }),
        Notice::Hosted { by, viewers } => session.emit(Event::Hosted { channel: wire, by, viewers }),
        Notice::Mods(mods) => {
            if let Some(set) = session.moderators.get_mut(channel) {
                set.extend(mods.iter().cloned());
            }
            for reply in session.mods_waiters.remove(channel).unwrap_or_default() {
                let _ = reply.send(mods.clone());
            }
            session.emit(Event::Mods { channel: wire, mods });
        }
        Notice::Limitation(err) => session.emit(Event::Limitation(err)),
        Notice::Permission(err) => session.emit(Event::Permission(err)),
        Notice::Rejected(text) => debug!(%wire, %text, "Command refused"),
    }
}

fn on_notification(session: &mut Session, channel: &str, text: &str) {
    let wire = wire_channel(channel);
    session.emit(Event::TwitchNotify {
        channel: wire.clone(),
        text: text.to_string(),
    });
    match legacy::classify_notification(text) {
        Notification::Subscription { user } => {
            session.emit(Event::Subscription { channel: wire, user })
        }
        Notification::SubAnniversary { user, months } => {
            session.emit(Event::SubAnniversary { channel: wire, user, months })
        }
        Notification::Other => debug!(%text, "Unhandled notification"),
    }
}

fn on_chat(session: &mut Session, channel: &str, text: &str, msg: &ProtocolMessage) {
    let user = msg.sender().to_lowercase();
    let (is_action, body) = match commands::strip_action(text) {
        Some(inner) => (true, inner),
        None => (false, text),
    };

    let record = if session.tags_enabled && msg.tags.is_some() {
        let record = record_from_tags(&user, channel, msg);
        if record.has_role("mod") {
            if let Some(mods) = session.moderators.get_mut(channel) {
                mods.insert(user.clone());
            }
        }
        record
    } else {
        legacy_record(session, &user, channel)
    };

    let wire = wire_channel(channel);
    let is_self = session.is_self(&user);
    if is_action {
        session.emit(Event::Action {
            channel: wire,
            user: record,
            text: body.to_string(),
            is_self,
        });
        return;
    }

    let command = commands::parse_bang_command(session.config.options.command_prefix, body);
    session.emit(Event::Chat {
        channel: wire.clone(),
        user: record.clone(),
        text: body.to_string(),
        is_self,
    });
    if let Some(command) = command {
        session.emit(Event::Command {
            channel: wire,
            user: record,
            command,
        });
    }
}

/// Attribute record built from one message's own tags.
pub fn record_from_tags(user: &str, channel: &str, msg: &ProtocolMessage) -> UserRecord {
    let non_empty = |key: &str| msg.tag(key).filter(|v| !v.is_empty());
    let mut record = UserRecord::new(user);
    record.display_name = non_empty("display-name").map(str::to_string);
    record.color = non_empty("color").map(str::to_string);
    record.emotes = non_empty("emotes").map(parse_emote_tag).unwrap_or_default();

    for flag in ["subscriber", "turbo", "mod"] {
        if msg.tag(flag) == Some("1") {
            record.roles.insert(flag.to_string());
        }
    }
    if let Some(kind) = non_empty("user_type").or_else(|| non_empty("user-type")) {
        record.roles.insert(kind.to_string());
    }
    if let Some(badges) = non_empty("badges") {
        for badge in badges.split(',') {
            let name = badge.split('/').next().unwrap_or("");
            if !name.is_empty() {
                record.roles.insert(name.to_string());
            }
        }
    }
    if user == channel {
        record.roles.insert("broadcaster".to_string());
    }
    record
}

/// `25:0-4,12-16/1902:6-10` -> `{"25": ["0-4", "12-16"], "1902": ["6-10"]}`.
fn parse_emote_tag(value: &str) -> BTreeMap<String, Vec<String>> {
    value
        .split('/')
        .filter_map(|entry| entry.split_once(':'))
        .map(|(id, ranges)| (id.to_string(), ranges.split(',').map(str::to_string).collect()))
        .collect()
}

/// Consume the cached legacy record for `user`, decorated from the
/// moderator set and channel ownership.
fn legacy_record(session: &mut Session, user: &str, channel: &str) -> UserRecord {
    let mut record = session
        .pending_records
        .remove(user)
        .unwrap_or_else(|| UserRecord::new(user));
    if session.is_moderator(channel, user) {
        record.roles.insert("mod".to_string());
    }
    if user == channel {
        record.roles.insert("broadcaster".to_string());
    }
    record
}

fn begin_swap(session: &mut Session) {
    if session.graceful || !session.link.is_connected() {
        debug!("Ignoring reconnect request");
        return;
    }
    info!("Server requested a reconnect, opening a replacement connection");
    session.graceful = true;
    session.link.begin_swap();
    let (preferred_address, preferred_port) = match &session.endpoint {
        Some(endpoint) => (Some(endpoint.address.clone()), Some(endpoint.port)),
        None => (None, None),
    };
    session.pending_actions.push(Action::Resolve {
        purpose: LinkPurpose::Swap,
        preferred_address,
        preferred_port,
    });
}

fn handle_ready(session: &mut Session, transport: TransportId, endpoint: Endpoint, peer: SocketAddr) {
    let purpose = match session.opening {
        Some((id, purpose)) if id == transport => purpose,
        _ => {
            debug!(transport, "Closing transport nobody is waiting for");
            session.pending_actions.push(Action::Close { transport });
            return;
        }
    };
    session.opening = None;
    debug!(transport, %peer, "Transport open");

    match purpose {
        LinkPurpose::Primary => {
            session.live = Some(transport);
            session.emit(Event::Connecting {
                host: endpoint.address.clone(),
                port: endpoint.port,
            });
        }
        LinkPurpose::Swap => {
            session.retiring = session.live.replace(transport);
            if let Some(old) = session.retiring {
                session.pending_actions.push(Action::Schedule {
                    timer: Timer::GraceExpired { transport: old },
                    after: GRACE_WINDOW,
                });
            }
        }
    }
    session.endpoint = Some(endpoint);

    session.emit(Event::Logon);
    let credentials = session.credentials.clone();
    session.send(transport, commands::pass(&credentials.password));
    session.send(transport, commands::nick(&credentials.nickname));
    session.send(transport, commands::user(&credentials.nickname));
}

fn handle_failure(session: &mut Session, transport: TransportId, error: ClientError) {
    if session.retiring == Some(transport) {
        debug!(transport, %error, "Retiring transport closed early");
        session.retiring = None;
        session.pending_actions.push(Action::Close { transport });
        return;
    }
    if let Some((id, purpose)) = session.opening {
        if id == transport {
            session.opening = None;
            if purpose == LinkPurpose::Swap {
                warn!(%error, "Replacement connection failed, keeping the current one");
                session.graceful = false;
                session.link.abort_swap();
            } else {
                transport_lost(session, error);
            }
            return;
        }
    }
    if session.live == Some(transport) {
        session.pending_actions.push(Action::Close { transport });
        transport_lost(session, error);
    } else {
        trace!(transport, %error, "Failure on closed transport");
    }
}

/// Close the transports of an unfinished swap: the retiring one and a
/// replacement still being opened.
fn abandon_swap(session: &mut Session) {
    if let Some(old) = session.retiring.take() {
        session.pending_actions.push(Action::Close { transport: old });
    }
    if let Some((id, LinkPurpose::Swap)) = session.opening {
        debug!(transport = id, "Dropping replacement connection");
        session.opening = None;
        session.pending_actions.push(Action::Close { transport: id });
    }
}

fn transport_lost(session: &mut Session, error: ClientError) {
    abandon_swap(session);
    session.forget_transport();
    warn!(reason = %error, "Disconnected from server");
    session.emit(Event::Disconnected {
        reason: DisconnectReason::Transport(error.to_string()),
    });

    if !error.is_retryable() {
        session.link.stop();
        session.terminal = Some(error);
        return;
    }
    match session.link.failed() {
        Retry::After(delay) => {
            info!("Reconnecting in {} seconds..", delay.as_secs());
            session.pending_actions.push(Action::Schedule {
                timer: Timer::Reconnect,
                after: delay,
            });
        }
        Retry::Exhausted => {
            error!("Maximum reconnection attempts reached");
            session.emit(Event::ConnectFail);
            session.terminal = Some(error);
        }
        Retry::Disabled => session.terminal = Some(error),
    }
}

fn handle_resolved(session: &mut Session, purpose: LinkPurpose, endpoint: Option<Endpoint>) {
    match (purpose, endpoint) {
        (LinkPurpose::Primary, Some(endpoint)) => {
            if session.link.phase() != Phase::Connecting {
                debug!(%endpoint, "Resolution arrived after the attempt was abandoned");
                return;
            }
            let transport = session.allocate_transport();
            session.opening = Some((transport, LinkPurpose::Primary));
            session.pending_actions.push(Action::Open { transport, endpoint });
        }
        (LinkPurpose::Primary, None) => {
            if session.link.is_connected() || session.link.phase() != Phase::Connecting {
                return;
            }
            error!("No server available");
            session.link.stop();
            session.terminal = Some(ClientError::Transport("No servers available.".into()));
            session.emit(Event::ConnectFail);
        }
        (LinkPurpose::Swap, Some(endpoint)) => {
            if !session.graceful {
                return;
            }
            let transport = session.allocate_transport();
            session.opening = Some((transport, LinkPurpose::Swap));
            session.pending_actions.push(Action::Open { transport, endpoint });
        }
        (LinkPurpose::Swap, None) => {
            warn!("No server for the replacement connection");
            session.graceful = false;
            session.link.abort_swap();
        }
    }
}

pub(crate) fn resolve_primary(session: &mut Session) {
    let connection = &session.config.connection;
    let action = Action::Resolve {
        purpose: LinkPurpose::Primary,
        preferred_address: connection.preferred_server.clone(),
        preferred_port: connection.preferred_port,
    };
    session.pending_actions.push(action);
}

fn handle_timer(session: &mut Session, timer: Timer) {
    match timer {
        Timer::Reconnect => {
            if session.link.phase() != Phase::Reconnecting {
                debug!("Stale reconnect timer");
                return;
            }
            session.emit(Event::Reconnect);
            session.link.begin_connect();
            resolve_primary(session);
        }
        Timer::JoinNext { generation } => join_step(session, generation),
        Timer::GraceExpired { transport } => {
            if session.retiring == Some(transport) {
                info!(transport, "Retiring previous connection");
                session.retiring = None;
                session.pending_actions.push(Action::Close { transport });
            }
            // The old transport may have closed on its own before the window.
            if session.retiring.is_none() {
                session.graceful = false;
                session.link.abort_swap();
            }
        }
        Timer::AckWindow { ticket } => session.correlator.settle(ticket, Instant::now()),
    }
}

fn handle_watchdog(session: &mut Session) {
    let Some(transport) = session.live else { return };
    if !session.link.is_connected() || session.last_server_ping.elapsed() < KEEPALIVE_TIMEOUT {
        return;
    }
    warn!("No PING from server in {} seconds", KEEPALIVE_TIMEOUT.as_secs());
    session.pending_actions.push(Action::Close { transport });
    abandon_swap(session);
    session.forget_transport();
    session.emit(Event::Disconnected {
        reason: DisconnectReason::PingTimeout,
    });
    session.link.begin_reconnect();
    session.pending_actions.push(Action::Schedule {
        timer: Timer::Reconnect,
        after: KEEPALIVE_RECONNECT_DELAY,
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::irc::message::DecodeError;
    use crate::irc::resolver::ServiceClass;
    use pretty_assertions::assert_eq;

    pub fn endpoint(address: &str) -> Endpoint {
        Endpoint {
            address: address.to_string(),
            port: 443,
            class: ServiceClass::Chat,
        }
    }

    pub fn config(channels: &[&str]) -> ClientConfig {
        let mut config = ClientConfig::default();
        config.identity.username = Some("bot".into());
        config.identity.password = Some("secret".into());
        config.channels = channels.iter().map(|c| c.to_string()).collect();
        config
    }

    /// Drive a fresh session through resolve, open and welcome on transport 1.
    pub fn connected(config: ClientConfig) -> (Session, Vec<Action>) {
        let mut session = Session::new(config);
        session.link.begin_connect();
        handle_event(&mut session, AppEvent::Resolved {
            purpose: LinkPurpose::Primary,
            endpoint: Some(endpoint("10.0.0.1")),
        });
        ready(&mut session, 1);
        let actions = line(&mut session, 1, ":tmi.twitch.tv 376 bot :>");
        (session, actions)
    }

    pub fn ready(session: &mut Session, transport: TransportId) -> Vec<Action> {
        handle_event(session, AppEvent::TransportReady {
            transport,
            endpoint: endpoint("10.0.0.1"),
            peer: "10.0.0.1:443".parse().unwrap(),
        })
    }

    pub fn line(session: &mut Session, transport: TransportId, raw: &str) -> Vec<Action> {
        handle_event(session, AppEvent::Message {
            transport,
            message: ProtocolMessage::parse(raw).unwrap(),
        })
    }

    pub fn emitted(actions: &[Action]) -> Vec<Event> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Emit(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn sent(actions: &[Action]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { line, .. } => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    fn join_echo(session: &mut Session, transport: TransportId, channel: &str) -> Vec<Action> {
        line(session, transport, &format!(":bot!bot@bot.tmi.twitch.tv JOIN #{}", channel))
    }

    #[test]
    fn logon_sends_credentials() {
        let mut session = Session::new(config(&[]));
        session.link.begin_connect();
        session.opening = Some((1, LinkPurpose::Primary));
        let actions = ready(&mut session, 1);
        assert_eq!(
            sent(&actions),
            vec!["PASS oauth:secret", "NICK bot", "USER bot 8 * :bot"]
        );
        assert_eq!(emitted(&actions)[1], Event::Logon);
    }

    #[test]
    fn welcome_negotiates_and_starts_joining() {
        let (session, actions) = connected(config(&["a", "b", "c"]));
        assert_eq!(
            sent(&actions),
            vec![
                "CAP REQ :twitch.tv/tags twitch.tv/commands",
                "TWITCHCLIENT 4",
                "JOIN #a",
            ]
        );
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Schedule { timer: Timer::JoinNext { .. }, after } if *after == JOIN_INTERVAL
        )));
        assert_eq!(
            emitted(&actions),
            vec![Event::Connected { host: "10.0.0.1".into(), port: 443 }]
        );
        assert_eq!(session.link.phase(), Phase::Connected);
    }

    #[test]
    fn welcome_is_handled_once_per_transport() {
        let (mut session, _) = connected(config(&["a"]));
        let again = line(&mut session, 1, ":tmi.twitch.tv 372 bot :motd");
        assert!(again.is_empty());
    }

    #[test]
    fn membership_capability_only_when_observed() {
        let mut session = Session::new(config(&[]));
        session.wants_membership = true;
        session.link.begin_connect();
        session.opening = Some((1, LinkPurpose::Primary));
        ready(&mut session, 1);
        let actions = line(&mut session, 1, ":tmi.twitch.tv 376 bot :>");
        assert!(sent(&actions).contains(&"CAP REQ :twitch.tv/membership".to_string()));
    }

    #[test]
    fn joins_are_staggered_and_skip_joined_channels() {
        let (mut session, actions) = connected(config(&["a", "b", "c"]));
        let generation = actions
            .iter()
            .find_map(|a| match a {
                Action::Schedule { timer: Timer::JoinNext { generation }, .. } => Some(*generation),
                _ => None,
            })
            .unwrap();

        join_echo(&mut session, 1, "b");
        let second = handle_event(&mut session, AppEvent::Timer(Timer::JoinNext { generation }));
        assert_eq!(sent(&second), vec!["JOIN #c"]);
        assert!(!second.iter().any(|a| matches!(a, Action::Schedule { .. })));
    }

    #[test]
    fn fully_joined_after_last_configured_channel_echo() {
        let (mut session, _) = connected(config(&["a", "b"]));
        join_echo(&mut session, 1, "a");
        assert!(!session.joins.is_fully_joined());
        join_echo(&mut session, 1, "b");
        assert!(session.joins.is_fully_joined());
    }

    #[test]
    fn join_and_part_track_channels() {
        let (mut session, _) = connected(config(&["Chan"]));
        let actions = join_echo(&mut session, 1, "chan");
        assert_eq!(
            emitted(&actions),
            vec![Event::Join { channel: "#chan".into(), user: "bot".into() }]
        );
        assert!(session.is_joined("chan"));
        assert!(session.moderators.contains_key("chan"));

        line(&mut session, 1, ":bot!bot@bot.tmi.twitch.tv PART #chan");
        assert!(!session.is_joined("chan"));
        assert!(!session.moderators.contains_key("chan"));
    }

    #[test]
    fn moderator_tracking_is_idempotent() {
        let (mut session, _) = connected(config(&["chan"]));
        join_echo(&mut session, 1, "chan");

        line(&mut session, 1, ":jtv MODE #chan +o Bob");
        let actions = line(&mut session, 1, ":jtv MODE #chan +o bob");
        assert_eq!(
            emitted(&actions),
            vec![Event::Mod { channel: "#chan".into(), user: "bob".into() }]
        );
        assert_eq!(session.moderators["chan"].len(), 1);

        line(&mut session, 1, ":jtv MODE #chan -o bob");
        assert!(session.moderators["chan"].is_empty());
    }

    #[test]
    fn mode_from_ordinary_users_is_ignored() {
        let (mut session, _) = connected(config(&["chan"]));
        join_echo(&mut session, 1, "chan");
        let actions = line(&mut session, 1, ":eve!eve@eve.tmi.twitch.tv MODE #chan +o eve");
        assert!(actions.is_empty());
        assert!(session.moderators["chan"].is_empty());
    }

    #[test]
    fn ctcp_action_and_plain_chat() {
        let (mut session, _) = connected(config(&["chan"]));
        let actions = line(&mut session, 1, ":bob!bob@bob.tmi.twitch.tv PRIVMSG #chan :\x01ACTION hi\x01");
        assert!(matches!(
            &emitted(&actions)[..],
            [Event::Action { text, is_self: false, .. }] if text == "hi"
        ));

        let actions = line(&mut session, 1, ":bob!bob@bob.tmi.twitch.tv PRIVMSG #chan :hi");
        assert!(matches!(
            &emitted(&actions)[..],
            [Event::Chat { text, .. }] if text == "hi"
        ));
    }

    #[test]
    fn tag_roles_come_from_the_message() {
        let (mut session, _) = connected(config(&["chan"]));
        line(&mut session, 1, ":tmi.twitch.tv CAP * ACK :twitch.tv/tags twitch.tv/commands");
        assert!(session.tags_enabled);

        let actions = line(
            &mut session,
            1,
            "@subscriber=1;turbo=1;user_type=mod :bob!bob@bob.tmi.twitch.tv PRIVMSG #chan :hey",
        );
        let events = emitted(&actions);
        let [Event::Chat { user, .. }] = &events[..] else {
            panic!("expected one chat event");
        };
        let roles: Vec<&str> = user.roles.iter().map(String::as_str).collect();
        assert_eq!(roles, vec!["mod", "subscriber", "turbo"]);
    }

    #[test]
    fn tag_record_marks_broadcaster_and_parses_emotes() {
        let msg = ProtocolMessage::parse(
            "@color=#FF0000;display-name=Chan;emotes=25:0-4,6-10/1902:12-16 :chan!chan@chan.tmi.twitch.tv PRIVMSG #chan :Kappa Kappa Keepo",
        )
        .unwrap();
        let record = record_from_tags("chan", "chan", &msg);
        assert!(record.has_role("broadcaster"));
        assert_eq!(record.color.as_deref(), Some("#FF0000"));
        assert_eq!(record.emotes["25"], vec!["0-4", "6-10"]);
        assert_eq!(record.emotes["1902"], vec!["12-16"]);
    }

    #[test]
    fn legacy_record_is_consumed_once() {
        let (mut session, _) = connected(config(&["chan"]));
        join_echo(&mut session, 1, "chan");
        line(&mut session, 1, ":jtv MODE #chan +o bob");
        line(&mut session, 1, ":jtv PRIVMSG #chan :USERCOLOR bob #00FF00");
        line(&mut session, 1, ":jtv PRIVMSG #chan :SPECIALUSER bob subscriber");

        let first = line(&mut session, 1, ":bob!bob@bob.tmi.twitch.tv PRIVMSG #chan :one");
        let events = emitted(&first);
        let [Event::Chat { user, .. }] = &events[..] else { panic!() };
        assert_eq!(user.color.as_deref(), Some("#00FF00"));
        assert!(user.has_role("subscriber"));
        assert!(user.has_role("mod"));

        let second = line(&mut session, 1, ":bob!bob@bob.tmi.twitch.tv PRIVMSG #chan :two");
        let events = emitted(&second);
        let [Event::Chat { user, .. }] = &events[..] else { panic!() };
        assert_eq!(user.color, None);
        assert!(!user.has_role("subscriber"));
        assert!(user.has_role("mod"));
    }

    #[test]
    fn legacy_clearchat_with_and_without_user() {
        let (mut session, _) = connected(config(&["chan"]));
        let actions = line(&mut session, 1, ":jtv PRIVMSG #chan :CLEARCHAT bob");
        assert_eq!(
            emitted(&actions)[1],
            Event::Timeout { channel: "#chan".into(), user: "bob".into() }
        );
        let actions = line(&mut session, 1, ":jtv PRIVMSG #chan :CLEARCHAT");
        assert_eq!(emitted(&actions)[1], Event::ClearChat { channel: "#chan".into() });
    }

    #[test]
    fn server_clearchat_and_hosttarget() {
        let (mut session, _) = connected(config(&["chan"]));
        let actions = line(&mut session, 1, ":tmi.twitch.tv CLEARCHAT #chan :bob");
        assert_eq!(
            emitted(&actions),
            vec![Event::Timeout { channel: "#chan".into(), user: "bob".into() }]
        );
        let actions = line(&mut session, 1, ":tmi.twitch.tv HOSTTARGET #chan :other 3");
        assert_eq!(
            emitted(&actions),
            vec![Event::Hosting { channel: "#chan".into(), target: "other".into(), remaining: Some(3) }]
        );
        let actions = line(&mut session, 1, ":tmi.twitch.tv HOSTTARGET #chan :- 2");
        assert_eq!(
            emitted(&actions),
            vec![Event::Unhost { channel: "#chan".into(), remaining: Some(2) }]
        );
    }

    #[test]
    fn free_text_is_suppressed_at_early_legacy_levels() {
        let mut cfg = config(&["chan"]);
        cfg.options.legacy_level = Some(1);
        let (mut session, _) = connected(cfg);
        let actions = line(&mut session, 1, ":jtv PRIVMSG #chan :This room is now in subscribers-only mode.");
        assert_eq!(emitted(&actions).len(), 1);

        let actions = line(&mut session, 1, ":tmi.twitch.tv 353 bot = #chan :a b");
        assert_eq!(
            emitted(&actions),
            vec![Event::Names { channel: "#chan".into(), names: vec!["a".into(), "b".into()] }]
        );
    }

    #[test]
    fn subscriptions_from_notify_identity() {
        let (mut session, _) = connected(config(&["chan"]));
        let actions = line(&mut session, 1, ":twitchnotify!twitchnotify@twitchnotify.tmi.twitch.tv PRIVMSG #chan :Bob just subscribed!");
        assert_eq!(
            emitted(&actions)[1],
            Event::Subscription { channel: "#chan".into(), user: "bob".into() }
        );
    }

    #[test]
    fn bang_commands_are_reported_after_chat() {
        let (mut session, _) = connected(config(&["chan"]));
        let actions = line(&mut session, 1, ":bob!bob@bob.tmi.twitch.tv PRIVMSG #chan :!so carol");
        let events = emitted(&actions);
        assert_eq!(events.len(), 2);
        let Event::Command { command, .. } = &events[1] else { panic!() };
        assert_eq!(command.command, "so");
        assert_eq!(command.args, vec!["carol"]);
    }

    #[test]
    fn ping_is_answered_on_the_same_transport() {
        let (mut session, _) = connected(config(&[]));
        let actions = line(&mut session, 1, "PING :tmi.twitch.tv");
        assert!(matches!(
            &actions[..],
            [Action::Send { transport: 1, line }, Action::Emit(Event::Ping)] if line == "PONG :tmi.twitch.tv"
        ));
    }

    #[test]
    fn login_failure_is_terminal() {
        let (mut session, _) = connected(config(&[]));
        let actions = line(&mut session, 1, ":tmi.twitch.tv NOTICE * :Login unsuccessful");
        assert!(actions.iter().any(|a| matches!(a, Action::Close { transport: 1 })));
        assert!(!actions.iter().any(|a| matches!(a, Action::Schedule { .. })));
        assert_eq!(
            emitted(&actions),
            vec![Event::Disconnected { reason: DisconnectReason::LoginFailed("Login unsuccessful".into()) }]
        );
        assert!(session.is_finished());
    }

    fn scheduled_reconnect(actions: &[Action]) -> Option<Duration> {
        actions.iter().find_map(|a| match a {
            Action::Schedule { timer: Timer::Reconnect, after } => Some(*after),
            _ => None,
        })
    }

    fn reset(session: &mut Session, transport: TransportId) -> Vec<Action> {
        handle_event(session, AppEvent::TransportFailed {
            transport,
            error: ClientError::Transport("Connection reset by peer.".into()),
        })
    }

    #[test]
    fn consecutive_resets_back_off_then_fail_when_budget_is_spent() {
        let mut cfg = config(&["chan"]);
        cfg.connection.retry_budget = Some(2);
        let (mut session, _) = connected(cfg);

        let first = reset(&mut session, 1);
        assert_eq!(scheduled_reconnect(&first), Some(Duration::from_millis(5000)));
        assert!(emitted(&first).iter().any(|e| matches!(e, Event::Disconnected { .. })));

        let again = handle_event(&mut session, AppEvent::Timer(Timer::Reconnect));
        assert_eq!(emitted(&again), vec![Event::Reconnect]);
        handle_event(&mut session, AppEvent::Resolved {
            purpose: LinkPurpose::Primary,
            endpoint: Some(endpoint("10.0.0.2")),
        });
        let opening = session.opening.unwrap().0;
        let second = reset(&mut session, opening);
        assert_eq!(scheduled_reconnect(&second), Some(Duration::from_millis(10_000)));

        handle_event(&mut session, AppEvent::Timer(Timer::Reconnect));
        handle_event(&mut session, AppEvent::Resolved {
            purpose: LinkPurpose::Primary,
            endpoint: Some(endpoint("10.0.0.3")),
        });
        let opening = session.opening.unwrap().0;
        let third = reset(&mut session, opening);
        assert_eq!(scheduled_reconnect(&third), None);
        assert!(emitted(&third).contains(&Event::ConnectFail));
    }

    #[test]
    fn reconnect_rejoins_previous_channels() {
        let (mut session, _) = connected(config(&["a"]));
        join_echo(&mut session, 1, "a");
        reset(&mut session, 1);
        assert!(session.joined.is_empty());

        handle_event(&mut session, AppEvent::Timer(Timer::Reconnect));
        handle_event(&mut session, AppEvent::Resolved {
            purpose: LinkPurpose::Primary,
            endpoint: Some(endpoint("10.0.0.1")),
        });
        let id = session.opening.unwrap().0;
        ready(&mut session, id);
        let actions = line(&mut session, id, ":tmi.twitch.tv 376 bot :>");
        assert!(sent(&actions).contains(&"JOIN #a".to_string()));
        assert_eq!(session.link.attempt(), 1);
    }

    #[test]
    fn graceful_swap_keeps_state_and_retires_silently() {
        let (mut session, _) = connected(config(&["chan"]));
        join_echo(&mut session, 1, "chan");
        line(&mut session, 1, ":jtv MODE #chan +o bob");

        let actions = line(&mut session, 1, ":tmi.twitch.tv RECONNECT");
        assert!(matches!(
            &actions[..],
            [Action::Resolve { purpose: LinkPurpose::Swap, preferred_address: Some(a), .. }] if a == "10.0.0.1"
        ));
        handle_event(&mut session, AppEvent::Resolved {
            purpose: LinkPurpose::Swap,
            endpoint: Some(endpoint("10.0.0.1")),
        });
        let new = session.opening.unwrap().0;
        let actions = ready(&mut session, new);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Schedule { timer: Timer::GraceExpired { transport: 1 }, after } if *after == GRACE_WINDOW
        )));
        assert_eq!(session.live, Some(new));
        assert_eq!(session.retiring, Some(1));

        // The retiring transport cannot touch channel or moderator state.
        let shadow = line(&mut session, 1, ":bot!bot@bot.tmi.twitch.tv PART #chan");
        assert_eq!(emitted(&shadow).len(), 1);
        line(&mut session, 1, ":jtv MODE #chan -o bob");
        assert!(session.is_joined("chan"));
        assert!(session.moderators["chan"].contains("bob"));

        // The replacement rejoins everything silently.
        let welcome = line(&mut session, new, ":tmi.twitch.tv 376 bot :>");
        assert!(sent(&welcome).contains(&"JOIN #chan".to_string()));
        assert!(emitted(&welcome).is_empty());
        let echo = join_echo(&mut session, new, "chan");
        assert!(emitted(&echo).is_empty());

        let expired = handle_event(&mut session, AppEvent::Timer(Timer::GraceExpired { transport: 1 }));
        assert!(matches!(&expired[..], [Action::Close { transport: 1 }]));
        assert_eq!(session.retiring, None);
    }

    /// Request a swap on transport 1 and resolve it; returns the new id.
    fn swap_opening(session: &mut Session) -> TransportId {
        line(session, 1, ":tmi.twitch.tv RECONNECT");
        handle_event(session, AppEvent::Resolved {
            purpose: LinkPurpose::Swap,
            endpoint: Some(endpoint("10.0.0.1")),
        });
        session.opening.unwrap().0
    }

    fn join_timer(actions: &[Action]) -> Option<Timer> {
        actions.iter().find_map(|a| match a {
            Action::Schedule { timer: timer @ Timer::JoinNext { .. }, .. } => Some(*timer),
            _ => None,
        })
    }

    #[test]
    fn swap_during_join_round_still_joins_every_channel() {
        let (mut session, _) = connected(config(&["a", "b", "c"]));
        join_echo(&mut session, 1, "a");

        let new = swap_opening(&mut session);
        ready(&mut session, new);
        let welcome = line(&mut session, new, ":tmi.twitch.tv 376 bot :>");

        let mut joins = sent(&welcome);
        let mut next = join_timer(&welcome);
        while let Some(timer) = next {
            let actions = handle_event(&mut session, AppEvent::Timer(timer));
            joins.extend(sent(&actions));
            next = join_timer(&actions);
        }
        joins.retain(|l| l.starts_with("JOIN"));
        assert_eq!(joins, vec!["JOIN #a", "JOIN #b", "JOIN #c"]);

        join_echo(&mut session, new, "a");
        join_echo(&mut session, new, "b");
        assert!(!session.joins.is_fully_joined());
        join_echo(&mut session, new, "c");
        assert!(session.joins.is_fully_joined());
    }

    #[test]
    fn losing_the_link_mid_swap_drops_the_replacement() {
        let mut cfg = config(&["chan"]);
        cfg.connection.retry_budget = Some(0);
        let (mut session, _) = connected(cfg);
        let new = swap_opening(&mut session);

        let actions = reset(&mut session, 1);
        assert!(emitted(&actions).contains(&Event::ConnectFail));
        assert!(actions.iter().any(|a| matches!(a, Action::Close { transport } if *transport == new)));
        assert_eq!(session.opening, None);
        assert!(session.is_finished());

        let late = ready(&mut session, new);
        assert!(matches!(&late[..], [Action::Close { transport }] if *transport == new));
        assert_eq!(session.live, None);
    }

    #[test]
    fn decode_error_on_live_transport_reconnects() {
        let (mut session, _) = connected(config(&["chan"]));
        let actions = handle_event(&mut session, AppEvent::TransportFailed {
            transport: 1,
            error: ClientError::Decode(DecodeError::MissingCommand),
        });
        assert!(actions.iter().any(|a| matches!(a, Action::Close { transport: 1 })));
        assert!(emitted(&actions).iter().any(|e| matches!(e, Event::Disconnected { .. })));
        assert_eq!(scheduled_reconnect(&actions), Some(Duration::from_millis(5000)));
        assert_eq!(session.link.phase(), Phase::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_timeout_reconnects_after_two_seconds() {
        let (mut session, _) = connected(config(&[]));
        tokio::time::advance(KEEPALIVE_TIMEOUT - Duration::from_secs(1)).await;
        assert!(handle_event(&mut session, AppEvent::WatchdogTick).is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let actions = handle_event(&mut session, AppEvent::WatchdogTick);
        assert_eq!(scheduled_reconnect(&actions), Some(KEEPALIVE_RECONNECT_DELAY));
        assert_eq!(
            emitted(&actions),
            vec![Event::Disconnected { reason: DisconnectReason::PingTimeout }]
        );
    }
}
