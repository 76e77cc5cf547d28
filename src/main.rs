use std::path::PathBuf;

use anyhow::{Context, Result};
use tmiclient::client::events::Event;
use tmiclient::{config, logging, Client, EventKind};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // An explicit path wins over the per-user config file.
    let cfg = match std::env::args().nth(1) {
        Some(path) => config::load_from(&PathBuf::from(path))?,
        None => config::load_config()?,
    };
    logging::init(&cfg.options);

    let mut client = Client::new(cfg);
    client.on(EventKind::Chat, |event| {
        if let Event::Chat { channel, user, text, .. } = event {
            println!("{} <{}> {}", channel, user.username, text);
        }
    });
    client.on(EventKind::Action, |event| {
        if let Event::Action { channel, user, text, .. } = event {
            println!("{} * {} {}", channel, user.username, text);
        }
    });
    client.on(EventKind::Disconnected, |event| {
        if let Event::Disconnected { reason } = event {
            warn!(%reason, "Disconnected");
        }
    });
    client.on(EventKind::Crash, |event| {
        if let Event::Crash { message, stack } = event {
            eprintln!("crash: {}\n{}", message, stack);
        }
    });

    let handle = client.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, disconnecting");
            let _ = handle.disconnect().await;
        }
    });

    client.run().await.context("Client stopped")?;
    Ok(())
}
