//! Connect to an AHM, print its state and follow changes.
//!
//! Usage: `cargo run --example monitor -- <host> [AHM-16|AHM-32|AHM-64] [config.json] [--preset=N] [--mute-zone=N]`
//!
//! With a config file the host and model arguments are ignored. Without
//! one, the first four inputs and zones are tracked. `--preset` recalls a
//! preset and `--mute-zone` toggles a zone's mute once the snapshot is
//! printed; both changes show up as device echoes. Set `RUST_LOG=debug`
//! to see every frame on the wire.

use ahm_control::{
    level_to_db, AhmClient, AhmError, ChannelId, DeviceConfig, DeviceModel, EntityKey,
    JsonFileNameStore, StateUpdate, StateValue,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn parse_model(arg: Option<&str>) -> Result<DeviceModel, Box<dyn std::error::Error>> {
    Ok(match arg {
        None => DeviceModel::Ahm16,
        Some(name) => serde_json::from_str(&format!("\"{}\"", name))?,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let (flags, args): (Vec<String>, Vec<String>) =
        std::env::args().skip(1).partition(|arg| arg.starts_with("--"));
    let flag = |name: &str| -> Result<Option<u16>, Box<dyn std::error::Error>> {
        let prefix = format!("--{}=", name);
        match flags.iter().find_map(|f| f.strip_prefix(&prefix)) {
            Some(value) => Ok(Some(value.parse()?)),
            None => Ok(None),
        }
    };
    let preset = flag("preset")?;
    let mute_zone = flag("mute-zone")?;
    let config = match args.get(2) {
        Some(path) => DeviceConfig::from_file(path)?,
        None => {
            let host = args.first().ok_or("usage: monitor <host> [model] [config.json]")?;
            let mut config = DeviceConfig::new(host.clone(), parse_model(args.get(1).map(String::as_str))?);
            config.inputs = vec![1, 2, 3, 4];
            config.zones = vec![1, 2, 3, 4];
            config
        }
    };

    let store = Arc::new(JsonFileNameStore::open("ahm-names.json")?);
    let client = AhmClient::new(config, store)?;
    client.start().await?;

    let names = client.fetch_names().await?;
    println!("Fetched {} names", names.len());

    let snapshot = client.snapshot();
    println!("Connection: {}", snapshot.connection);
    for channel in snapshot.channels.values() {
        let level = channel
            .level
            .map(|l| format!("{:.1} dB", level_to_db(l)))
            .unwrap_or_else(|| "?".to_string());
        println!(
            "{:<16} {:<20} level {:>10}  muted {:?}",
            channel.id.to_string(),
            channel.name.as_deref().unwrap_or("-"),
            level,
            channel.muted
        );
    }

    let mut updates = client.subscribe();

    if let Some(number) = preset {
        client.recall_preset(number).await?;
        println!("Recalling preset {}", number);
    }
    if let Some(index) = mute_zone {
        let zone = ChannelId::zone(u8::try_from(index)?);
        let muted = client.channel(zone).and_then(|c| c.muted).unwrap_or(false);
        client.set_mute(zone, !muted).await?;
        println!("Setting {} muted={}", zone, !muted);
    }

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Err(AhmError::ChannelError(e)) => {
                    tracing::warn!("Missed updates: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
                Ok(StateUpdate::Connection(state)) => println!("Connection: {}", state),
                Ok(StateUpdate::Changed { key, value }) => {
                    let what = match key {
                        EntityKey::Channel(id) => id.to_string(),
                        EntityKey::Crosspoint(id) => id.to_string(),
                        EntityKey::LastPreset => "Preset".to_string(),
                    };
                    match value {
                        StateValue::Level(level) => {
                            println!("{}: level {} ({:.1} dB)", what, level, level_to_db(level))
                        }
                        other => println!("{}: {:?}", what, other),
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.shutdown().await;
    Ok(())
}
