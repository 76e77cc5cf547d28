use std::time::Duration;

use crate::app::event::{LinkPurpose, Timer, TransportId};
use crate::client::events::Event;
use crate::irc::resolver::Endpoint;

/// Side effects requested by the dispatcher, executed by the client loop.
#[derive(Debug)]
pub enum Action {
    Send { transport: TransportId, line: String },
    Emit(Event),
    Schedule { timer: Timer, after: Duration },
    Cancel(Timer),
    Resolve { purpose: LinkPurpose, preferred_address: Option<String>, preferred_port: Option<u16> },
    Open { transport: TransportId, endpoint: Endpoint },
    Close { transport: TransportId },
}
