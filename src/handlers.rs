//! Message routing: commands, text, voice and photo handlers.

use std::sync::Arc;

use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ParseMode, PhotoSize, ReplyParameters, Voice};
use teloxide::utils::command::BotCommands;
use teloxide::utils::html;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::gemini::GeminiClient;
use crate::session::SessionStore;
use crate::stager::{self, MediaError, StagedFile};

pub const SYSTEM_PROMPT: &str = "You are a smart and friendly assistant in a Telegram chat. \
    Your job is to help users by answering their questions. Keep answers short and to the \
    point. Use emoji where appropriate to keep the conversation lively.";

const AUDIO_PROMPT: &str = "You are a smart and friendly assistant in a Telegram chat. Listen \
    to this voice message and respond to it as if the user had typed it. Keep the answer short \
    and to the point.";

const IMAGE_PROMPT: &str = "You are an expert image analyst. Study the picture carefully and \
    give a detailed but concise description: what is happening, which objects are present, and \
    the overall mood. If the image contains text, include it in your answer. 🎨";

const TEXT_ERROR_REPLY: &str =
    "Oops, something went wrong... 🍫 Please try again a bit later.";
const VOICE_ERROR_REPLY: &str =
    "Something went wrong while processing your voice message. 😥 Please try again.";
const IMAGE_ERROR_REPLY: &str =
    "Something went wrong while processing your image. 🖼️ Please try again.";

const RESET_DONE_REPLY: &str =
    "Text dialogue context has been reset. Starting from a clean slate! 📝";
const RESET_EMPTY_REPLY: &str = "The dialogue is already empty. Ask away! 😊";

/// Shared state injected into every handler.
pub struct AppState {
    pub gemini: GeminiClient,
    pub sessions: SessionStore,
}

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
pub enum Command {
    Start,
    Help,
    New,
}

fn greeting(display_name: &str) -> String {
    format!(
        "Hi, {}! I'm your smart assistant. 🤖\n\n\
         Ask me a question in text, send a voice message, or send a picture for analysis.",
        html::bold(&html::escape(display_name))
    )
}

fn help_text() -> String {
    format!(
        "I'm an assistant powered by the Gemini model.\n\n\
         – I answer your <b>text messages</b>, keeping the context of our dialogue.\n\
         – I <b>listen to voice messages</b> and respond to them.\n\
         – I <b>analyze pictures</b> you send me. You can even ask a question about the \
         picture in its caption!\n\n\
         {}\n\
         /start - Start the dialogue\n\
         /help - Show this message\n\
         /new - Reset the text dialogue history",
        html::bold("Available commands:")
    )
}

fn reset_reply(existed: bool) -> &'static str {
    if existed { RESET_DONE_REPLY } else { RESET_EMPTY_REPLY }
}

fn image_prompt_for(caption: Option<&str>) -> &str {
    caption.unwrap_or(IMAGE_PROMPT)
}

pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    match cmd {
        Command::Start => {
            let name = msg
                .from
                .as_ref()
                .map(|u| u.full_name())
                .unwrap_or_else(|| "there".to_string());
            bot.send_message(msg.chat.id, greeting(&name))
                .parse_mode(ParseMode::Html)
                .await?;
        }
        Command::Help => {
            bot.send_message(msg.chat.id, help_text())
                .parse_mode(ParseMode::Html)
                .await?;
        }
        Command::New => {
            let Some(user) = msg.from.as_ref() else {
                return Ok(());
            };
            let existed = state.sessions.reset(user.id.0).await;
            info!("Session reset for user {} (existed: {existed})", user.id);
            bot.send_message(msg.chat.id, reset_reply(existed)).await?;
        }
    }
    Ok(())
}

/// Non-command messages: dispatch on content kind.
pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if msg.voice().is_some() {
        handle_voice(&bot, &msg, &state).await
    } else if msg.photo().is_some() {
        handle_photo(&bot, &msg, &state).await
    } else if msg.text().is_some() {
        handle_text(&bot, &msg, &state).await
    } else {
        Ok(())
    }
}

async fn handle_text(bot: &Bot, msg: &Message, state: &AppState) -> ResponseResult<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    // Best-effort UX cue, never load-bearing.
    bot.send_chat_action(msg.chat.id, ChatAction::Typing).await.ok();

    let handle = state.sessions.get_or_create(user.id.0).await;
    let mut session = handle.lock().await;
    info!("Text message from user {} (history: {} turns)", user.id, session.turns());

    match state.gemini.send_chat(&mut session, text).await {
        Ok(reply) => {
            bot.send_message(msg.chat.id, reply).await?;
        }
        Err(e) => {
            warn!("Text inference failed for user {}: {e}", user.id);
            bot.send_message(msg.chat.id, TEXT_ERROR_REPLY).await?;
        }
    }

    Ok(())
}

async fn handle_photo(bot: &Bot, msg: &Message, state: &AppState) -> ResponseResult<()> {
    let Some(sizes) = msg.photo() else {
        return Ok(());
    };
    // Telegram orders variants smallest to largest.
    let Some(photo) = sizes.last() else {
        return Ok(());
    };

    bot.send_chat_action(msg.chat.id, ChatAction::Typing).await.ok();

    match stage_photo(bot, &state.gemini, photo, msg.caption()).await {
        Ok(reply) => reply_to(bot, msg, &reply).await?,
        Err(e) => {
            warn!("Photo handling failed: {e}");
            reply_to(bot, msg, IMAGE_ERROR_REPLY).await?;
        }
    }

    Ok(())
}

async fn handle_voice(bot: &Bot, msg: &Message, state: &AppState) -> ResponseResult<()> {
    let Some(voice) = msg.voice() else {
        return Ok(());
    };

    bot.send_chat_action(msg.chat.id, ChatAction::Typing).await.ok();

    match stage_voice(bot, &state.gemini, voice).await {
        Ok(reply) => reply_to(bot, msg, &reply).await?,
        Err(e) => {
            warn!("Voice handling failed: {e}");
            reply_to(bot, msg, VOICE_ERROR_REPLY).await?;
        }
    }

    Ok(())
}

/// Photo path: download into memory, sniff the format, send inline.
async fn stage_photo(
    bot: &Bot,
    gemini: &GeminiClient,
    photo: &PhotoSize,
    caption: Option<&str>,
) -> Result<String, MediaError> {
    let file = bot
        .get_file(photo.file.id.clone())
        .await
        .map_err(|e| MediaError::Download(e.to_string()))?;

    let mut data = Vec::new();
    bot.download_file(&file.path, &mut data)
        .await
        .map_err(|e| MediaError::Download(e.to_string()))?;
    info!("Downloaded photo ({} bytes)", data.len());

    stager::run_photo(gemini, &data, image_prompt_for(caption)).await
}

/// Voice path: download fully into a staged temp file, then hand it to the
/// upload/infer/delete round-trip. The `StagedFile` guard removes the local
/// copy on every exit path.
async fn stage_voice(
    bot: &Bot,
    gemini: &GeminiClient,
    voice: &Voice,
) -> Result<String, MediaError> {
    let file = bot
        .get_file(voice.file.id.clone())
        .await
        .map_err(|e| MediaError::Download(e.to_string()))?;

    let staged = StagedFile::new("gemrelay_voice", "ogg");
    {
        let mut out = tokio::fs::File::create(staged.path())
            .await
            .map_err(|e| MediaError::Download(e.to_string()))?;
        bot.download_file(&file.path, &mut out)
            .await
            .map_err(|e| MediaError::Download(e.to_string()))?;
        out.flush()
            .await
            .map_err(|e| MediaError::Download(e.to_string()))?;
    }
    info!("Voice message staged at {}", staged.path().display());

    let mime_type = voice
        .mime_type
        .as_ref()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "audio/ogg".to_string());

    stager::run_voice(gemini, &staged, &mime_type, AUDIO_PROMPT).await
}

/// Send text attributed as a reply to the triggering message.
async fn reply_to(bot: &Bot, msg: &Message, text: &str) -> ResponseResult<()> {
    bot.send_message(msg.chat.id, text)
        .reply_parameters(ReplyParameters::new(msg.id))
        .await?;
    Ok(())
}
