use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Discord bot that mutes new members until they verify through a personal link
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (default: data/settings.json, or SETTINGS_PATH)
    #[arg(long)]
    settings: Option<String>,

    /// Register commands per-guild instead of globally (faster for testing)
    #[arg(long)]
    guild_commands: bool,

    /// Specific guild ID to register commands to (for testing)
    #[arg(long)]
    guild_id: Option<u64>,
}

mod client;
mod commands;
mod config;
mod error;
mod events;
mod logging;
mod managers;
mod messages;
mod state;
mod web;

use client::DiscordClient;
use commands::{help, ping, start};
use config::Settings;
use events::{handle_member_add, handle_message, EventAdapter, EventSender, EventWorker};
use logging::{AuditLayer, AUDIT_TARGET};
use managers::{create_shared_verification_manager, run_startup_permission_check, ExpirySweeper};
use state::{create_shared_pending_store, SharedPendingStore};

type Error = Box<dyn std::error::Error + Send + Sync>;
type Context<'a> = poise::Context<'a, Data, Error>;

/// Shared application state
pub struct Data {
    pub events: EventSender,
    pub settings: Arc<Settings>,
    pub pending: SharedPendingStore,
    pub bot_name: String,
}

async fn event_handler(
    ctx: &serenity::Context,
    event: &serenity::FullEvent,
    _framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
) -> Result<(), Error> {
    match event {
        serenity::FullEvent::Message { new_message } => {
            if let Err(e) = handle_message(ctx, new_message, data).await {
                error!("Failed to handle message: {}", e);
            }
        }
        serenity::FullEvent::GuildMemberAddition { new_member } => {
            if let Err(e) = handle_member_add(ctx, new_member, data).await {
                error!("Failed to handle new member: {}", e);
            }
        }
        _ => {}
    }
    Ok(())
}

/// Resolves with the name of the signal that asked us to stop
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

fn log_bot_id(token: &str) {
    // Extract bot/application ID from token (first part before the dot, base64 encoded)
    let Some(bot_id_b64) = token.split('.').next() else {
        return;
    };

    use base64::Engine;
    let decoded = base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(bot_id_b64)
        // Try URL-safe variant
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(bot_id_b64));

    if let Some(id_str) = decoded.ok().and_then(|d| String::from_utf8(d).ok()) {
        info!("Bot ID: {} (configure intents at https://discord.com/developers/applications/{}/bot)", id_str, id_str);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let settings_path = args
        .settings
        .clone()
        .or_else(|| std::env::var("SETTINGS_PATH").ok())
        .unwrap_or_else(|| "data/settings.json".to_string());
    let settings = Arc::new(Settings::load(&settings_path)?);

    let audit_log = logging::create_audit_log(&settings.audit_log_path)?;

    // Initialize tracing with the audit layer beside the console output
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true),
        )
        .with(tracing_subscriber::filter::LevelFilter::INFO)
        .with(AuditLayer::new(audit_log.clone()))
        .init();

    info!(
        target: AUDIT_TARGET,
        kind = "SYSTEM",
        audit_log = %audit_log.path().display(),
        "Bot initialized"
    );
    info!(
        "Challenge window {:?}, sweeping every {:?}",
        settings.challenge_ttl(),
        settings.sweep_interval()
    );

    let token = std::env::var("DISCORD_TOKEN")
        .map_err(|_| anyhow::anyhow!("Missing DISCORD_TOKEN environment variable"))?;
    log_bot_id(&token);

    // The gate needs the HTTP client before the gateway connects
    let http = Arc::new(serenity::Http::new(&token));
    let pending = create_shared_pending_store();
    let verification_manager = create_shared_verification_manager(pending.clone(), &settings)?;
    let adapter = Arc::new(EventAdapter::new(
        verification_manager,
        Arc::new(DiscordClient::new(http, &settings.web.base_url)),
        settings.challenge_ttl(),
    ));
    let (events, worker) = EventWorker::spawn(adapter.clone());
    let sweeper = ExpirySweeper::spawn(adapter.clone(), settings.sweep_interval());

    let guild_commands = args.guild_commands;
    let target_guild_id = args.guild_id;

    if guild_commands {
        info!("--guild-commands: Will register commands per-guild (faster for testing)");
    } else {
        info!("Registering commands globally by default (takes up to 1 hour to propagate)");
    }
    if let Some(gid) = target_guild_id {
        info!("--guild-id: Targeting specific guild {}", gid);
    }

    let setup_settings = settings.clone();
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![ping(), help(), start()],
            event_handler: |ctx, event, framework, data| {
                Box::pin(event_handler(ctx, event, framework, data))
            },
            pre_command: |ctx| {
                Box::pin(async move {
                    info!(
                        "Command '{}' invoked by {} (ID: {}) in {}",
                        ctx.command().qualified_name,
                        ctx.author().name,
                        ctx.author().id,
                        ctx.guild_id().map(|g| g.to_string()).unwrap_or_else(|| "DM".to_string())
                    );
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    info!(
                        "Command '{}' completed for {}",
                        ctx.command().qualified_name,
                        ctx.author().name
                    );
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    match error {
                        poise::FrameworkError::Command { error, ctx, .. } => {
                            error!("Error in command '{}': {}", ctx.command().qualified_name, error);
                            let _ = ctx.say(messages::internal_error_message()).await;
                        }
                        poise::FrameworkError::ArgumentParse { error, input, ctx, .. } => {
                            error!("Argument parse error in '{}': {} (input: {:?})", ctx.command().qualified_name, error, input);
                        }
                        poise::FrameworkError::MissingBotPermissions { missing_permissions, ctx, .. } => {
                            error!("Bot missing permissions for '{}': {:?}", ctx.command().qualified_name, missing_permissions);
                            let _ = ctx.say(format!("Bot is missing permissions: {:?}", missing_permissions)).await;
                        }
                        other => {
                            error!("Other framework error: {}", other);
                        }
                    }
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            let settings = setup_settings;
            let events = events.clone();
            let pending = pending.clone();

            Box::pin(async move {
                info!("Bot logged in as: {}", ready.user.name);

                let guild_ids: Vec<serenity::GuildId> = ready.guilds.iter().map(|g| g.id).collect();
                if !guild_ids.is_empty() {
                    run_startup_permission_check(ctx.http.as_ref(), &guild_ids).await;
                } else {
                    warn!("Bot is not in any guilds - skipping permission check");
                }

                let guilds_to_register: Vec<serenity::GuildId> = match target_guild_id {
                    Some(gid) => vec![serenity::GuildId::new(gid)],
                    None => guild_ids.clone(),
                };

                if guild_commands || target_guild_id.is_some() {
                    for guild_id in &guilds_to_register {
                        info!("Registering commands to guild: {}", guild_id);
                        if let Err(e) = poise::builtins::register_in_guild(
                            ctx,
                            &framework.options().commands,
                            *guild_id,
                        ).await {
                            error!("Failed to register commands for guild {}: {}", guild_id, e);
                        } else {
                            info!("Successfully registered {} commands for guild {}",
                                  framework.options().commands.len(), guild_id);
                        }
                    }
                } else {
                    info!("Registering commands globally...");
                    if let Err(e) = poise::builtins::register_globally(
                        ctx,
                        &framework.options().commands,
                    ).await {
                        error!("Failed to register commands globally: {}", e);
                    } else {
                        info!("Successfully registered {} commands globally (may take up to 1 hour to propagate)",
                              framework.options().commands.len());
                    }
                }

                let bot_name = ready.user.name.clone();

                // Verify links need OAuth to learn who opened them
                if let Some(oauth) = web::OAuthState::from_env(&settings.web.base_url) {
                    let web_config = settings.web.clone();
                    let app_state = web::AppState {
                        oauth,
                        events: events.clone(),
                        pending: pending.clone(),
                        bot_name: bot_name.clone(),
                    };

                    tokio::spawn(async move {
                        if let Err(e) = web::start_web_server(web_config, app_state).await {
                            error!("Web server error: {}", e);
                        }
                    });
                } else {
                    warn!("Verify link server not started: DISCORD_CLIENT_ID or DISCORD_CLIENT_SECRET not set");
                }

                Ok(Data {
                    events,
                    settings,
                    pending,
                    bot_name,
                })
            })
        })
        .build();

    let intents = serenity::GatewayIntents::non_privileged()
        | serenity::GatewayIntents::MESSAGE_CONTENT
        | serenity::GatewayIntents::GUILD_MEMBERS
        | serenity::GatewayIntents::DIRECT_MESSAGES;

    let privileged_intents: Vec<&str> = [
        (serenity::GatewayIntents::MESSAGE_CONTENT, "MESSAGE_CONTENT"),
        (serenity::GatewayIntents::GUILD_MEMBERS, "GUILD_MEMBERS"),
        (serenity::GatewayIntents::GUILD_PRESENCES, "GUILD_PRESENCES"),
    ]
    .into_iter()
    .filter(|(intent, _)| intents.contains(*intent))
    .map(|(_, name)| name)
    .collect();

    info!("Requesting privileged intents: {:?}", privileged_intents);

    let mut client = serenity::ClientBuilder::new(&token, intents)
        .framework(framework)
        .await?;

    let shard_manager = client.shard_manager.clone();
    let (reason_tx, mut reason_rx) = tokio::sync::oneshot::channel();
    let signal = tokio::spawn(async move {
        let reason = shutdown_signal().await;
        info!("Received {}, shutting down", reason);
        let _ = reason_tx.send(reason);
        shard_manager.shutdown_all().await;
    });

    info!("Starting bot...");
    let started = client.start().await;

    let reason = reason_rx.try_recv().unwrap_or("gateway exit");
    signal.abort();

    sweeper.stop().await;
    worker.drain().await;
    adapter.on_shutdown(reason);
    if let Err(e) = audit_log.flush() {
        error!("Failed to flush audit log: {}", e);
    }

    if let Err(e) = started {
        // Check if it's a disallowed intents error
        let err_str = e.to_string();
        if err_str.contains("Disallowed") || err_str.contains("intents") {
            error!("Failed to start bot: {}", e);
            error!("The following privileged intents need to be enabled in the Discord Developer Portal:");
            for intent in &privileged_intents {
                error!("  - {}", intent);
            }
            error!("Go to https://discord.com/developers/applications -> Your App -> Bot -> Privileged Gateway Intents");
            return Err(anyhow::anyhow!(
                "Disallowed gateway intents. Enable these in Discord Developer Portal: {:?}",
                privileged_intents
            ));
        }
        return Err(e.into());
    }
    warn!("Bot ended.");

    Ok(())
}
