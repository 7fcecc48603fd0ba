// blectf-cli — Desktop CLI for the BLECTF GATT peripheral
//
// Runs the capture-the-flag server over the in-process loopback platform
// with a scripted player, and manages the persisted configuration.

mod config;

use anyhow::{Context, Result};
use blectf_core::{
    ctf_service, AdvertiseConfig, AttributePermission, CharacteristicDefinition,
    CharacteristicProperty, CtfServer, LoopbackPlatform, ServerEvent, CTF_SERVICE_UUID,
    FLAG_CHARACTERISTIC_UUID, NAME_CHARACTERISTIC_UUID, PASSWORD_CHARACTERISTIC_UUID,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "blectf")]
#[command(about = "BLECTF — BLE GATT capture-the-flag peripheral", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the CTF server with a scripted player
    Serve {
        /// Password served as the first flag
        #[arg(short, long)]
        password: Option<String>,
        /// Player name written to the scoreboard
        #[arg(short, long)]
        name: Option<String>,
        /// Seconds between flag fragment notifications
        #[arg(short, long)]
        interval_secs: Option<u64>,
    },
    /// Show the GATT service table and advertising defaults
    Info,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Set { key: String, value: String },
    Get { key: String },
    Reset,
    /// Manage the rotating flag messages
    Flag {
        #[command(subcommand)]
        action: FlagAction,
    },
}

#[derive(Subcommand)]
enum FlagAction {
    Add { text: String },
    /// Remove by 1-based position
    Remove { index: usize },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if matches!(&cli.command, Commands::Serve { .. }) {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Serve {
            password,
            name,
            interval_secs,
        } => cmd_serve(password, name, interval_secs).await,
        Commands::Info => cmd_info().await,
        Commands::Config { action } => cmd_config(action).await,
    }
}

async fn cmd_serve(
    password: Option<String>,
    name: Option<String>,
    interval_secs: Option<u64>,
) -> Result<()> {
    let mut file_config = config::Config::load()?;
    if let Some(password) = password {
        file_config.password = password;
    }
    if let Some(secs) = interval_secs {
        file_config.notify_interval_secs = secs;
    }
    let player_name = name.unwrap_or_else(|| "ada".to_string());

    let server_config = file_config.to_server_config()?;
    let platform = LoopbackPlatform::new();
    let server = CtfServer::new(Arc::new(platform.clone()), server_config);

    println!("{}", "BLECTF — Starting GATT peripheral...".bold());
    println!();
    println!("Device name: {}", file_config.device_name.bright_cyan());
    println!(
        "Service:     {}",
        CTF_SERVICE_UUID.to_string().bright_yellow()
    );
    println!();

    let mut events = server.subscribe_events();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServerEvent::Started) => {
                    println!("{} Server listening", "✓".green());
                }
                Ok(ServerEvent::NameReceived(name)) => {
                    println!(
                        "{} Scoreboard entry: {}",
                        "←".bright_blue(),
                        name.bright_cyan()
                    );
                }
                Ok(ServerEvent::Stopped) => {
                    println!("{} Server stopped", "✓".green());
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    server.start().await.context("Failed to start server")?;

    let script_platform = platform.clone();
    let script_task = tokio::spawn(async move {
        if let Err(e) = run_player(script_platform, player_name).await {
            println!("{} Player script failed: {}", "✗".red(), e);
        }
    });

    println!("Press Ctrl-C to stop.");
    println!();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    println!();

    script_task.abort();
    server.stop().await;
    let _ = tokio::time::timeout(Duration::from_millis(200), event_task).await;

    Ok(())
}

/// Scripted central walking the full exchange: read the password, submit a
/// name as prepared-write fragments, then collect flag notifications until
/// the task is aborted.
async fn run_player(platform: LoopbackPlatform, name: String) -> Result<()> {
    // Let the startup banner finish printing first
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut central = platform.client("AA:BB:CC:DD:EE:01");
    central.connect().await?;
    println!("{} Player connected", "→".bright_green());

    let record = central.read(PASSWORD_CHARACTERISTIC_UUID).await?;
    println!(
        "{} Password read: {}",
        "→".bright_green(),
        String::from_utf8_lossy(&record.value).bright_yellow()
    );

    // The name goes over as prepared-write fragments, the way a small-MTU
    // central would send it
    let bytes = name.as_bytes();
    let mid = bytes.len() / 2;
    central
        .prepare_write(1, NAME_CHARACTERISTIC_UUID, 0, &bytes[..mid])
        .await?;
    central
        .prepare_write(1, NAME_CHARACTERISTIC_UUID, mid as u16, &bytes[mid..])
        .await?;
    central.execute_write(1).await?;
    println!(
        "{} Name submitted: {}",
        "→".bright_green(),
        name.bright_cyan()
    );

    central.subscribe(FLAG_CHARACTERISTIC_UUID).await?;
    println!("{} Subscribed to flag notifications", "→".bright_green());

    while let Some((_, value)) = central.recv_notification().await {
        println!(
            "{} Flag fragment: {}",
            "←".bright_blue(),
            String::from_utf8_lossy(&value).bright_yellow()
        );
    }

    Ok(())
}

async fn cmd_info() -> Result<()> {
    let file_config = config::Config::load()?;
    let service = ctf_service(file_config.password.clone().into_bytes());

    println!("{}", "CTF GATT Service".bold());
    println!(
        "  UUID:    {}",
        service.uuid.to_string().bright_yellow()
    );
    println!("  Primary: {}", service.primary);
    println!();

    println!("{}", "Characteristics".bold());
    for characteristic in &service.characteristics {
        let role = if characteristic.uuid == PASSWORD_CHARACTERISTIC_UUID {
            "password"
        } else if characteristic.uuid == NAME_CHARACTERISTIC_UUID {
            "name"
        } else if characteristic.uuid == FLAG_CHARACTERISTIC_UUID {
            "flag"
        } else {
            "unknown"
        };

        println!(
            "  {} {} ({})",
            "•".bright_green(),
            characteristic.uuid.to_string().bright_yellow(),
            role.bright_cyan()
        );
        println!("    Properties:  {}", properties_label(characteristic));
        println!("    Permissions: {}", permissions_label(characteristic));
        if let Some(value) = &characteristic.value {
            println!("    Value:       {} bytes", value.len());
        }
        for descriptor in &characteristic.descriptors {
            println!(
                "    Descriptor:  {}",
                descriptor.uuid.to_string().dimmed()
            );
        }
    }
    println!();

    let advertise = AdvertiseConfig::default();
    println!("{}", "Advertising defaults".bold());
    println!("  Mode:        {:?}", advertise.mode);
    println!("  Connectable: {}", advertise.connectable);
    println!("  TX power:    {:?}", advertise.tx_power);
    println!(
        "  Device name: {}",
        if advertise.include_device_name {
            "included"
        } else {
            "omitted"
        }
    );

    Ok(())
}

async fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }

            println!();
            println!("{}", "Flag messages:".bold());
            if config.flag_messages.is_empty() {
                println!("  {}", "(rotation disabled)".dimmed());
            } else {
                for (i, message) in config.flag_messages.iter().enumerate() {
                    println!("  {}. {}", i + 1, message);
                }
            }
        }

        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::Reset => {
            config::Config::default().save()?;
            println!("{} Configuration reset to defaults", "✓".green());
        }

        ConfigAction::Flag { action } => match action {
            FlagAction::Add { text } => {
                config.add_flag_message(text.clone())?;
                println!("{} Added flag message: {}", "✓".green(), text);
            }

            FlagAction::Remove { index } => {
                let removed = config.remove_flag_message(index)?;
                println!("{} Removed flag message: {}", "✓".green(), removed);
            }

            FlagAction::List => {
                println!("{}", "Flag Messages".bold());
                if config.flag_messages.is_empty() {
                    println!("  {}", "(rotation disabled)".dimmed());
                } else {
                    for (i, message) in config.flag_messages.iter().enumerate() {
                        println!("  {}. {}", i + 1, message);
                    }
                }
            }
        },
    }

    Ok(())
}

fn properties_label(characteristic: &CharacteristicDefinition) -> String {
    characteristic
        .properties
        .iter()
        .map(|p| match p {
            CharacteristicProperty::Read => "read",
            CharacteristicProperty::Write => "write",
            CharacteristicProperty::Notify => "notify",
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn permissions_label(characteristic: &CharacteristicDefinition) -> String {
    characteristic
        .permissions
        .iter()
        .map(|p| match p {
            AttributePermission::Read => "read",
            AttributePermission::Write => "write",
        })
        .collect::<Vec<_>>()
        .join(", ")
}
