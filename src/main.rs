use std::collections::HashSet;
use std::error::Error;
use std::path::Path;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use dotenvy::dotenv;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

use clinic_sync::common::{
    ConnectionState, EventId, OutboundEvent, QueueUpdate, RoomKey, SenderRole, Viewer,
};
use clinic_sync::config::{self, AppConfig};
use clinic_sync::error::NotifyError;
use clinic_sync::network::{
    ChannelManager, GossipTransport, TopicDispatcher, load_or_generate_key, parse_bootstrap_peers,
};
use clinic_sync::storage::SqliteStore;
use clinic_sync::sync::{
    EventStreamReconciler, HttpNotifier, LogNotifier, Notification, NotificationSink,
    RoomProjection, SideEffectDispatcher,
};

const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
const STORE_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(
    name = "clinic-sync",
    version,
    about = "Watch a clinic room and the live queue channel"
)]
struct Cli {
    /// Path to JSON config file
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH, value_name = "FILE")]
    config: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Follow one conversation; each stdin line is sent as a message
    Watch {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        patient: String,
        #[arg(long)]
        clinician: String,
        /// Which participant this terminal speaks for
        #[arg(long, value_enum, default_value_t = RoleArg::Patient)]
        as_role: RoleArg,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RoleArg {
    Patient,
    Clinician,
}

/// Notification sink picked from config at startup.
enum Notifier {
    Http(HttpNotifier),
    Log(LogNotifier),
}

impl NotificationSink for Notifier {
    async fn deliver(&self, notification: Notification) -> Result<(), NotifyError> {
        match self {
            Notifier::Http(http) => http.deliver(notification).await,
            Notifier::Log(log) => log.deliver(notification).await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let app_config = config::load_config(&cli.config);

    match cli.command {
        Command::Watch {
            tenant,
            patient,
            clinician,
            as_role,
        } => {
            let room = RoomKey::new(tenant, patient.clone(), clinician.clone())?;
            let viewer = match as_role {
                RoleArg::Patient => Viewer::new(patient, SenderRole::Patient),
                RoleArg::Clinician => Viewer::new(clinician, SenderRole::Clinician),
            };
            run_watch(app_config, room, viewer).await
        }
    }
}

fn build_notifier(app_config: &AppConfig) -> Notifier {
    match &app_config.notification_url {
        Some(url) => match HttpNotifier::new(url.clone()) {
            Ok(http) => {
                log::info!("Sending notifications to {}", http.url());
                Notifier::Http(http)
            }
            Err(err) => {
                log::warn!("Notification endpoint unusable ({err}); logging instead");
                Notifier::Log(LogNotifier)
            }
        },
        None => Notifier::Log(LogNotifier),
    }
}

async fn run_watch(app_config: AppConfig, room: RoomKey, viewer: Viewer) -> Result<(), Box<dyn Error>> {
    // 1. Room log
    let store = SqliteStore::with_path(&app_config.store_path)?;
    let _external_writes = store.watch_external_writes(STORE_POLL_INTERVAL);
    let side_effects = SideEffectDispatcher::new(build_notifier(&app_config), viewer.clone())
        .with_preview_chars(app_config.preview_chars);
    let mut reconciler = EventStreamReconciler::new(store, side_effects);
    let mut stream = reconciler.observe(&room)?;

    // 2. Queue channel
    let key = load_or_generate_key(Path::new(&app_config.key_path))?;
    let transport = GossipTransport::new(
        key,
        app_config.listen_addr.parse()?,
        parse_bootstrap_peers(&app_config.bootstrap_nodes),
    );
    let mut queue: TopicDispatcher<_, QueueUpdate> =
        TopicDispatcher::new(ChannelManager::new(transport));
    for topic in &app_config.queue_topics {
        let topic_name = topic.clone();
        let registered = queue
            .subscribe(topic, move |update: &QueueUpdate| {
                println!(
                    "[{topic_name}] now serving {:?}, {} waiting",
                    update.now_serving,
                    update.waiting.len()
                );
                Ok(())
            })
            .await;
        if let Err(err) = registered {
            log::warn!("Queue topic `{topic}` not subscribed: {err}");
        }
    }
    if let Err(err) = queue.channel_mut().connect().await {
        log::warn!("Queue channel unavailable ({err}); retrying every {RECONNECT_INTERVAL:?}");
    }

    // 3. Event loop
    log::info!("Watching {room} as {} ({})", viewer.id, viewer.role);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut retry = tokio::time::interval(RECONNECT_INTERVAL);
    let mut printed = HashSet::new();

    loop {
        let channel_up = queue.channel().state() == ConnectionState::Connected;
        tokio::select! {
            _ = reconciler.process_next() => {}
            changed = stream.changed() => {
                if !changed {
                    break;
                }
                print_new_events(&stream.current(), &mut printed);
            }
            _ = queue.process_next(), if channel_up => {}
            _ = retry.tick(), if !channel_up => {
                if let Err(err) = queue.channel_mut().connect().await {
                    log::debug!("Queue channel reconnect failed: {err}");
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) if text.trim().is_empty() => {}
                    Ok(Some(text)) => {
                        let outbound = OutboundEvent::text(viewer.id.clone(), viewer.role, text);
                        if let Err(err) = reconciler.send(&room, outbound).await {
                            eprintln!("Message not sent: {err}");
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        log::warn!("Failed to read stdin: {err}");
                        break;
                    }
                }
            }
            _ = signal::ctrl_c() => {
                log::info!("Received shutdown signal");
                break;
            }
        }
    }

    queue.teardown();
    reconciler.unobserve(stream);
    Ok(())
}

fn print_new_events(projection: &RoomProjection, printed: &mut HashSet<EventId>) {
    if let Some(err) = &projection.error {
        eprintln!("Room error: {err}");
    }
    for event in &projection.events {
        if event.provisional || !printed.insert(event.id.clone()) {
            continue;
        }
        let time = chrono::DateTime::from_timestamp_millis(event.timestamp)
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "{time} {} ({}): {}",
            event.sender_id, event.sender_role, event.content.text
        );
    }
}
