//! Requests from client handles: outbound chat, channel membership,
//! moderation and lifecycle control.

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::app::action::Action;
use crate::app::correlator::{CommandOutcome, ACK_WINDOW};
use crate::app::event::{ClientCommand, Reply, Timer};
use crate::app::handler::resolve_primary;
use crate::app::state::Session;
use crate::client::events::{DisconnectReason, Event, UserRecord};
use crate::error::ClientError;
use crate::irc::commands::{self, normalize_channel, wire_channel, Directive};
use crate::irc::manager::Phase;

pub fn handle_command(session: &mut Session, command: ClientCommand) {
    match command {
        ClientCommand::Connect => connect(session),
        ClientCommand::Disconnect { done } => disconnect(session, done),
        ClientCommand::Say { channel, text, done } => match text.strip_prefix("/me ") {
            Some(rest) => say(session, &channel, rest, true, done),
            None => say(session, &channel, &text, false, done),
        },
        ClientCommand::Action { channel, text, done } => say(session, &channel, &text, true, done),
        ClientCommand::Join { channel, done } => join(session, &channel, done),
        ClientCommand::Part { channel, done } => part(session, &channel, done),
        ClientCommand::Ping { done } => {
            let sent = session.send_live(commands::ping());
            if sent {
                session.last_ping_sent = Some(Instant::now());
            }
            reply_sent(done, sent);
        }
        ClientCommand::Raw { line, done } => {
            let sent = session.send_live(line);
            reply_sent(done, sent);
        }
        ClientCommand::Moderate { channel, directive, done } => {
            moderate(session, &channel, directive, done)
        }
        ClientCommand::Mods { channel, reply } => mods(session, &channel, reply),
        ClientCommand::IsMod { channel, user, reply } => {
            let _ = reply.send(session.is_moderator(&normalize_channel(&channel), &user));
        }
        ClientCommand::Channels { reply } => {
            let _ = reply.send(session.joined.iter().map(|c| wire_channel(c)).collect());
        }
    }
}

fn reply_sent(done: Reply, sent: bool) {
    let outcome = if sent {
        CommandOutcome::Sent
    } else {
        CommandOutcome::NotSent(ClientError::NotConnected)
    };
    let _ = done.send(outcome);
}

/// Ready to carry chat: a live transport that has been welcomed, or one
/// taking over during a swap.
fn is_ready(session: &Session) -> bool {
    session.live.is_some() && (session.welcomed == session.live || session.graceful)
}

fn connect(session: &mut Session) {
    if session.link.phase() != Phase::Disconnected {
        debug!(phase = ?session.link.phase(), "Already connecting");
        return;
    }
    session.terminal = None;
    session.link.begin_connect();
    resolve_primary(session);
}

fn disconnect(session: &mut Session, done: Reply) {
    let active = session.live.is_some()
        || session.opening.is_some()
        || session.link.phase() != Phase::Disconnected;
    if !active {
        let _ = done.send(CommandOutcome::NotSent(ClientError::NotConnected));
        return;
    }
    info!("Disconnecting");
    session.pending_actions.push(Action::Cancel(Timer::Reconnect));
    let transports = [session.live, session.retiring, session.opening.map(|(id, _)| id)];
    for transport in transports.into_iter().flatten() {
        session.pending_actions.push(Action::Close { transport });
    }
    session.forget_transport();
    session.retiring = None;
    session.opening = None;
    session.link.stop();
    session.terminal = Some(ClientError::ClientStopped);
    session.emit(Event::Disconnected {
        reason: DisconnectReason::Manual,
    });
    let _ = done.send(CommandOutcome::Sent);
}

fn say(session: &mut Session, channel: &str, text: &str, is_action: bool, done: Reply) {
    let channel = normalize_channel(channel);
    if !is_ready(session) {
        let _ = done.send(CommandOutcome::NotSent(ClientError::NotConnected));
        return;
    }
    if !session.is_joined(&channel) {
        let _ = done.send(CommandOutcome::NotSent(ClientError::NotJoined(wire_channel(&channel))));
        return;
    }
    let line = if is_action {
        commands::action(&channel, text)
    } else {
        commands::privmsg(&channel, text)
    };
    session.send_live(line);

    if session.config.options.emit_self {
        let user = session
            .self_records
            .get(&channel)
            .cloned()
            .unwrap_or_else(|| UserRecord::new(session.username.clone()));
        let channel = wire_channel(&channel);
        let text = text.to_string();
        let event = if is_action {
            Event::Action { channel, user, text, is_self: true }
        } else {
            Event::Chat { channel, user, text, is_self: true }
        };
        session.emit(event);
    }
    let _ = done.send(CommandOutcome::Sent);
}

fn join(session: &mut Session, channel: &str, done: Reply) {
    let channel = normalize_channel(channel);
    if channel.is_empty() {
        let _ = done.send(CommandOutcome::Rejected("empty channel name".into()));
        return;
    }
    if !session.rejoin.contains(&channel) {
        session.rejoin.push(channel.clone());
    }
    let sent = is_ready(session) && session.send_live(commands::join(&channel));
    reply_sent(done, sent);
}

fn part(session: &mut Session, channel: &str, done: Reply) {
    let channel = normalize_channel(channel);
    session.rejoin.retain(|c| c != &channel);
    let sent = is_ready(session) && session.send_live(commands::part(&channel));
    reply_sent(done, sent);
}

fn moderate(session: &mut Session, channel: &str, directive: Directive, done: Reply) {
    let channel = normalize_channel(channel);
    if !is_ready(session) {
        let _ = done.send(CommandOutcome::NotSent(ClientError::NotConnected));
        return;
    }
    if !session.is_joined(&channel) {
        let _ = done.send(CommandOutcome::NotSent(ClientError::NotJoined(wire_channel(&channel))));
        return;
    }
    debug!(%channel, command = %directive.text(), "Moderation command");
    session.send_live(directive.line(&channel));
    let ticket = session.correlator.register(done);
    session.pending_actions.push(Action::Schedule {
        timer: Timer::AckWindow { ticket },
        after: ACK_WINDOW,
    });
}

fn mods(session: &mut Session, channel: &str, reply: oneshot::Sender<Vec<String>>) {
    let channel = normalize_channel(channel);
    if session.config.options.is_early_legacy() || !is_ready(session) || !session.is_joined(&channel) {
        let _ = reply.send(Vec::new());
        return;
    }
    session.send_live(Directive::Mods.line(&channel));
    session.mods_waiters.entry(channel).or_default().push(reply);
}
