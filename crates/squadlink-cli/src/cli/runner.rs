use anyhow::{bail, Context, Result};
use serde::Serialize;
use squadlink_core::events::ToastLevel;
use squadlink_core::models::ConversationKey;
use squadlink_core::{ChatSession, CoreEvent};
use tracing::{debug, info};

use super::command::CliCommand;
use super::config::CliConfig;

/// Print one JSON document (or line, in watch mode) to stdout
pub fn emit<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}

/// A one-shot command cannot show a toast; surface it as the failure.
fn check_toasts(events: &[CoreEvent]) -> Result<()> {
    for event in events {
        if let CoreEvent::Toast { level, message } = event {
            if *level != ToastLevel::Info {
                bail!("{}", message);
            }
        }
    }
    Ok(())
}

async fn open(session: &mut ChatSession, key: &ConversationKey) -> Result<()> {
    let events = session.activate(key.clone()).await?;
    check_toasts(&events)
}

pub async fn run(command: CliCommand, config: &CliConfig, pretty: bool) -> Result<()> {
    let credential = config.credential()?;
    let core = config.core_config();
    debug!("Data dir: {}", core.data_dir.display());
    let mut session = ChatSession::with_defaults(core, credential)?;

    if let CliCommand::Watch { key } = &command {
        return watch(session, key.clone(), pretty).await;
    }

    let result = execute(&mut session, &command, pretty).await;
    // Checkpoint whatever was opened, also on failure
    session.shutdown().await;
    result
}

async fn execute(session: &mut ChatSession, command: &CliCommand, pretty: bool) -> Result<()> {
    if let Some(key) = command.conversation() {
        open(session, key).await?;
    }

    match command {
        CliCommand::ListConversations => {
            session.load_conversations().await?;
            emit(&session.conversations(), pretty)
        }
        CliCommand::History { key } => emit(&session.messages(key), pretty),
        CliCommand::Send {
            key,
            content,
            reply_to,
        } => {
            if let Some(id) = reply_to {
                session.begin_reply(id)?;
            }
            session.send(content).await?;
            let sent = session.messages(key).into_iter().last();
            emit(&sent, pretty)
        }
        CliCommand::Edit { key, id, content } => {
            session.edit(id, content).await?;
            let edited = session.messages(key).into_iter().find(|m| &m.id == id);
            emit(&edited, pretty)
        }
        CliCommand::Delete { id, .. } => {
            session.delete(id).await?;
            emit(&serde_json::json!({ "deleted": id }), pretty)
        }
        CliCommand::ListPins { key } => emit(&session.pins(key), pretty),
        CliCommand::Pin { key, message_id } => {
            session.pin(message_id).await?;
            let pin = session
                .pins(key)
                .into_iter()
                .find(|p| &p.message_id == message_id);
            emit(&pin, pretty)
        }
        CliCommand::Unpin { pin_id, .. } => {
            session.unpin(pin_id).await?;
            emit(&serde_json::json!({ "unpinned": pin_id }), pretty)
        }
        CliCommand::Watch { .. } => bail!("watch is not a one-shot command"),
    }
}

/// Connect, open `key` and print every session event as a JSON line until Ctrl-C.
async fn watch(mut session: ChatSession, key: ConversationKey, pretty: bool) -> Result<()> {
    let mut channel_events = session
        .take_channel_events()
        .context("Channel events already taken")?;
    session.start();
    if let Err(e) = session.load_conversations().await {
        debug!("Conversation list unavailable: {}", e);
    }
    open(&mut session, &key).await?;
    emit(&session.messages(&key), pretty)?;
    info!("Watching {}", key);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = channel_events.recv() => {
                let Some(event) = event else { break };
                let mut events = session.handle_channel_event(event).await;
                if events.contains(&CoreEvent::ConversationsChanged) {
                    events.extend(session.run_backfill().await);
                }
                for event in &events {
                    emit(event, pretty)?;
                    if let CoreEvent::MessagesChanged { key: changed } = event {
                        if changed == &key {
                            emit(&session.messages(&key).last(), pretty)?;
                        }
                    }
                }
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
