use anyhow::{Context, Result};
use clap::Parser;
use garden_core::{MetricKind, SwitchState, Thresholds};
use garden_sync::{
    HttpRestApi, Snapshot, StaticToken, SyncConfig, SyncHandle, SyncService, TokenSource,
    WsConnector,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "garden-console")]
struct Args {
    #[arg(long, default_value = "")]
    ws_url: String,
    #[arg(long, default_value = "")]
    api_url: String,
    /// Bearer token; falls back to GARDEN_TOKEN.
    #[arg(long, default_value = "")]
    token: String,
    #[arg(long, default_value = "")]
    location: String,
    #[arg(long, default_value_t = 0)]
    max_reconnect_attempts: u32,
    #[arg(long, default_value_t = 0)]
    command_timeout_ms: u64,
    /// Print store snapshots as JSON instead of a status line.
    #[arg(long, default_value_t = false)]
    json: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum ConsoleCommand {
    Switch(String, SwitchState),
    Timer(String, SwitchState, Duration),
    CancelTimer(String),
    Auto(String, Thresholds),
    Manual(String),
    Thresholds(String, Thresholds),
    Read(String),
    Page(usize),
    Send(String, String),
    Location(String),
    Connect,
    Disconnect,
    Status,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().ok_or_else(|| "empty command".to_string())?;
        let mut arg = |name: &str| {
            parts
                .next()
                .map(str::to_string)
                .ok_or_else(|| format!("{verb}: missing {name}"))
        };
        let command = match verb {
            "on" => ConsoleCommand::Switch(arg("device")?, SwitchState::On),
            "off" => ConsoleCommand::Switch(arg("device")?, SwitchState::Off),
            "timer" => {
                let device = arg("device")?;
                let state = arg("state")?.parse()?;
                let secs: u64 = arg("seconds")?
                    .parse()
                    .map_err(|_| "timer: seconds must be a number".to_string())?;
                ConsoleCommand::Timer(device, state, Duration::from_secs(secs))
            }
            "cancel" => ConsoleCommand::CancelTimer(arg("device")?),
            "auto" => {
                let device = arg("device")?;
                ConsoleCommand::Auto(device, parse_band(&arg("min")?, &arg("max")?)?)
            }
            "manual" => ConsoleCommand::Manual(arg("device")?),
            "thresholds" => {
                let device = arg("device")?;
                ConsoleCommand::Thresholds(device, parse_band(&arg("min")?, &arg("max")?)?)
            }
            "read" => ConsoleCommand::Read(arg("id")?),
            "page" => ConsoleCommand::Page(
                arg("number")?
                    .parse()
                    .map_err(|_| "page: number expected".to_string())?,
            ),
            "send" => {
                let receiver = arg("receiver")?;
                let message = parts.collect::<Vec<_>>().join(" ");
                if message.is_empty() {
                    return Err("send: missing message".to_string());
                }
                ConsoleCommand::Send(receiver, message)
            }
            "location" => ConsoleCommand::Location(arg("location")?),
            "connect" => ConsoleCommand::Connect,
            "disconnect" => ConsoleCommand::Disconnect,
            "status" => ConsoleCommand::Status,
            "quit" | "exit" => ConsoleCommand::Quit,
            other => return Err(format!("unknown command: {other}")),
        };
        Ok(command)
    }
}

fn parse_band(min: &str, max: &str) -> Result<Thresholds, String> {
    let min: f64 = min.parse().map_err(|_| format!("invalid min: {min}"))?;
    let max: f64 = max.parse().map_err(|_| format!("invalid max: {max}"))?;
    if min > max {
        return Err(format!("min {min} is above max {max}"));
    }
    Ok(Thresholds::new(min, max))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let config = resolve_config(&args);
    let tokens: Arc<dyn TokenSource> = Arc::new(StaticToken::new(resolve_token(&args.token)));
    let rest = HttpRestApi::new(&config.api_url, Arc::clone(&tokens))
        .with_context(|| format!("invalid api url {}", config.api_url))?;
    let connector = WsConnector::new(config.ws_url.clone(), tokens);
    let handle = SyncService::spawn(config, Arc::new(connector), Arc::new(rest));

    spawn_renderer(&handle, args.json);
    spawn_error_reporter(&handle);

    handle.connect().await?;
    let user_id = bootstrap(&handle, &args.location).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<ConsoleCommand>() {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(command) => run_command(&handle, user_id.as_deref(), command).await,
                    Err(err) => eprintln!("{err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.disconnect().await.ok();
    handle.shutdown().await;
    info!(event = "console_exit");
    Ok(())
}

/// Loads the session basics. Returns the user id when the profile loaded.
async fn bootstrap(handle: &SyncHandle, location: &str) -> Option<String> {
    let user_id = match handle.load_current_user().await {
        Ok(user) => {
            info!(event = "console_user", user_id = %user.id, email = %user.email);
            if let Err(err) = handle.register_presence(&user.email).await {
                warn!(event = "console_presence_error", error = %err);
            }
            if let Err(err) = handle.load_notifications(&user.id, 1).await {
                warn!(event = "console_notifications_error", error = %err);
            }
            Some(user.id)
        }
        Err(err) => {
            warn!(event = "console_user_error", error = %err);
            None
        }
    };
    if !location.is_empty() {
        if let Err(err) = handle.select_location(location).await {
            warn!(event = "console_location_error", location, error = %err);
        }
    }
    user_id
}

async fn run_command(handle: &SyncHandle, user_id: Option<&str>, command: ConsoleCommand) {
    match command {
        ConsoleCommand::Connect => report("connect", handle.connect().await),
        ConsoleCommand::Disconnect => report("disconnect", handle.disconnect().await),
        ConsoleCommand::Status => println!("{}", render_status(&handle.snapshot())),
        ConsoleCommand::Page(page) => {
            let items = match user_id {
                Some(user_id) => handle.open_page(user_id, page).await,
                None => {
                    let size = handle.config().notification_page_size;
                    let items = handle.page(page, size).await;
                    report("page", handle.set_current_page(page).await);
                    items
                }
            };
            match items {
                Ok(items) if items.is_empty() => println!("page {page}: empty"),
                Ok(items) => {
                    for item in items {
                        let marker = if item.read { ' ' } else { '*' };
                        println!("{marker} {} {} {}", item.id, item.created_at, item.message);
                    }
                }
                Err(err) => eprintln!("page: {err}"),
            }
        }
        ConsoleCommand::Read(id) => report("read", handle.mark_read(&id).await),
        ConsoleCommand::Send(receiver, message) => {
            report("send", handle.send_notification(&receiver, &message).await)
        }
        ConsoleCommand::Location(location) => {
            report("location", handle.select_location(&location).await)
        }
        device_command => {
            // Device commands wait for an ack; keep the prompt responsive.
            let handle = handle.clone();
            tokio::spawn(async move {
                let (label, result) = match device_command {
                    ConsoleCommand::Switch(device, state) => {
                        ("switch", handle.set_actuator(&device, state).await)
                    }
                    ConsoleCommand::Timer(device, state, delay) => {
                        ("timer", handle.set_timer(&device, state, delay).await)
                    }
                    ConsoleCommand::CancelTimer(device) => {
                        ("cancel", handle.cancel_timer(&device).await)
                    }
                    ConsoleCommand::Auto(device, band) => {
                        ("auto", handle.set_auto_mode(&device, true, band).await)
                    }
                    ConsoleCommand::Manual(device) => (
                        "manual",
                        handle
                            .set_auto_mode(&device, false, Thresholds::default())
                            .await,
                    ),
                    ConsoleCommand::Thresholds(device, band) => {
                        ("thresholds", handle.update_thresholds(&device, band).await)
                    }
                    _ => return,
                };
                report(label, result);
            });
        }
    }
}

fn report<E: std::fmt::Display>(label: &str, result: std::result::Result<(), E>) {
    match result {
        Ok(()) => println!("{label}: ok"),
        Err(err) => eprintln!("{label}: {err}"),
    }
}

fn spawn_renderer(handle: &SyncHandle, json: bool) {
    let mut snapshots = handle.watch();
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            if json {
                match serde_json::to_string(&*snapshot.store) {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!(event = "console_render_error", error = %err),
                }
            } else {
                println!("{}", render_status(&snapshot));
            }
        }
    });
}

fn spawn_error_reporter(handle: &SyncHandle) {
    let mut errors = handle.errors();
    tokio::spawn(async move {
        loop {
            match errors.recv().await {
                Ok(err) => {
                    error!(event = "console_ui_error", error = %err);
                    eprintln!("! {err}");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(event = "console_errors_lagged", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn render_status(snapshot: &Snapshot) -> String {
    let connection = snapshot.connection();
    let mut line = format!("[{}", connection.state.as_str());
    if connection.attempt > 0 {
        line.push_str(&format!(" #{}", connection.attempt));
    }
    if connection.degraded {
        line.push_str(" degraded");
    }
    line.push(']');

    let live = snapshot.store.readings_are_live();
    for metric in MetricKind::ALL {
        if let Some(reading) = snapshot.store.reading(metric) {
            let stale = if live { "" } else { "?" };
            let value = if metric.is_switch() {
                let state = if reading.value > 0.0 { "ON" } else { "OFF" };
                state.to_string()
            } else {
                reading.value.to_string()
            };
            line.push_str(&format!(" {}={}{}", metric, value, stale));
        }
    }
    for device in &snapshot.store.devices {
        let state = device
            .last_command_state
            .map(|state| state.as_str())
            .unwrap_or("-");
        line.push_str(&format!(
            " {}:{}/{}",
            device.feed_key,
            state,
            device.mode.as_str()
        ));
    }
    line.push_str(&format!(
        " unread={}/{} online={} pending={}",
        snapshot.unread_count,
        snapshot.pagination.total_count,
        snapshot.online_users.len(),
        snapshot.pending_commands.len()
    ));
    line
}

fn resolve_config(args: &Args) -> SyncConfig {
    let mut config = SyncConfig::from_env();
    if !args.ws_url.trim().is_empty() {
        config.ws_url = args.ws_url.trim().to_string();
    }
    if !args.api_url.trim().is_empty() {
        config.api_url = args.api_url.trim().to_string();
    }
    if args.max_reconnect_attempts > 0 {
        config.max_reconnect_attempts = args.max_reconnect_attempts;
    }
    if args.command_timeout_ms > 0 {
        config.command_timeout = Duration::from_millis(args.command_timeout_ms);
    }
    config
}

fn resolve_token(arg: &str) -> Option<String> {
    if !arg.trim().is_empty() {
        return Some(arg.trim().to_string());
    }
    std::env::var("GARDEN_TOKEN")
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("GARDEN_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stdout_enabled = matches!(
        std::env::var("GARDEN_LOG_STDOUT").ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") | Some("YES")
    );
    if stdout_enabled {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    }
}
