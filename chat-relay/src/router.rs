//! Decides what a line from an active session means and applies it.
//!
//! [`route`] is a pure classification of the raw line. [`dispatch`] carries
//! the decision out, touching nothing but the [`Registry`] and the sender's
//! own outbound path.

use tracing::{debug, info};

use crate::{
    protocol::{NICK_COMMAND, ServerLine, WHISPER_COMMAND, command_argument, notices},
    registry::{Registry, SessionHandle},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `/nick <nickname>`
    Rename { nickname: String },
    /// `/w <target> <body>`
    Whisper { target: String, body: String },
    /// Anything that is not a command, blank lines included.
    Public { text: String },
    /// Malformed command, answered to the sender only.
    Reject { notice: &'static str },
}

pub fn route(line: &str) -> Route {
    if let Some(argument) = command_argument(line, NICK_COMMAND) {
        let nickname = argument.trim();
        if nickname.is_empty() {
            return Route::Reject {
                notice: notices::INVALID_NICKNAME,
            };
        }
        return Route::Rename {
            nickname: nickname.to_string(),
        };
    }

    if let Some(argument) = command_argument(line, WHISPER_COMMAND) {
        return parse_whisper(argument).unwrap_or(Route::Reject {
            notice: notices::WHISPER_USAGE,
        });
    }

    Route::Public {
        text: line.to_string(),
    }
}

fn parse_whisper(argument: &str) -> Option<Route> {
    // The body is everything after the first whitespace following the target.
    let (target, body) = argument.trim_start().split_once(char::is_whitespace)?;
    if target.is_empty() || body.trim().is_empty() {
        return None;
    }
    Some(Route::Whisper {
        target: target.to_string(),
        body: body.to_string(),
    })
}

/// Routes `line` from the session behind `sender`, currently known as
/// `nickname`. A successful rename updates `nickname` in place.
pub async fn dispatch(
    registry: &Registry,
    sender: &SessionHandle,
    nickname: &mut String,
    line: &str,
) {
    match route(line) {
        Route::Rename { nickname: requested } => {
            rename(registry, sender, nickname, requested).await;
        }
        Route::Whisper { target, body } => {
            let direct = ServerLine::direct(nickname.as_str(), &body);
            if registry.unicast(&target, &direct).await.is_err() {
                // Unknown targets get no feedback beyond the usual echo.
                debug!(session = %sender.id(), %target, "private message target not online");
            }
            if target != *nickname {
                sender.deliver(&ServerLine::Chat(notices::private_echo(&target, &body)));
            }
        }
        Route::Public { text } => {
            registry.broadcast(&ServerLine::public(nickname.as_str(), &text)).await;
        }
        Route::Reject { notice } => {
            sender.deliver(&ServerLine::system(notice));
        }
    }
}

async fn rename(
    registry: &Registry,
    sender: &SessionHandle,
    nickname: &mut String,
    requested: String,
) {
    if let Err(error) = registry.rename(sender.id(), nickname.as_str(), &requested).await {
        debug!(session = %sender.id(), %requested, %error, "rename rejected");
        sender.deliver(&ServerLine::system(notices::INVALID_NICKNAME));
        return;
    }

    let old = std::mem::replace(nickname, requested);
    info!(session = %sender.id(), %old, new = %nickname, "client renamed");
    registry
        .broadcast(&ServerLine::system(notices::renamed(&old, nickname.as_str())))
        .await;
    registry.announce_user_list().await;
}
