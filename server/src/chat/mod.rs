//! The chat-command surface. Like the HTTP handlers this is pure
//! translation: parse the command, call the same services, render a reply.
//! Only the small credential subset lives here -- magic-link issuance, key
//! management, notification toggles.

use axum::extract::State;
use axum::Json;
use http::StatusCode;
use runway_common::Scope;
use serde::Deserialize;
use tracing::warn;

use crate::api::RouterState;
use crate::credentials::CredentialService;
use crate::persistence::Persistence;

/// Telegram-style webhook update. Everything except a plain text message is
/// ignored.
#[derive(Debug, Deserialize)]
pub struct ChatUpdate {
    pub message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub chat: ChatRef,
    pub from: Option<ChatSender>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRef {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ChatSender {
    pub username: Option<String>,
}

/// Webhook entry point. Always answers 200: the bot API retries on
/// anything else and commands are not idempotent.
pub async fn webhook(
    State(state): State<RouterState>,
    Json(update): Json<ChatUpdate>,
) -> StatusCode {
    let Some(message) = update.message else {
        return StatusCode::OK;
    };
    let Some(text) = message.text.as_deref() else {
        return StatusCode::OK;
    };

    let reply = dispatch(
        &state.store,
        &state.credentials,
        &state.base_url,
        message.chat.id,
        message.from.and_then(|sender| sender.username).as_deref(),
        text,
    )
    .await;

    if let Err(err) = state.chat_sink.send(message.chat.id, &reply).await {
        warn!(error = %err, "chat reply delivery failed");
    }

    StatusCode::OK
}

const HELP: &str = "Commands:\n\
    /start - register\n\
    /apikey [scopes...] - get a one-time key link\n\
    /keys - list your api keys\n\
    /revoke <key_id> - revoke a key\n\
    /notify on|off - toggle notifications";

/// Resolve one command to its reply text.
pub async fn dispatch(
    store: &Persistence,
    credentials: &CredentialService,
    base_url: &str,
    chat_id: i64,
    username: Option<&str>,
    text: &str,
) -> String {
    let mut words = text.split_whitespace();
    let command = words.next().unwrap_or("");
    let args: Vec<&str> = words.collect();

    // Every command except /start requires a registered user.
    if command == "/start" {
        return match store.users().upsert_by_chat_id(chat_id, username).await {
            Ok(user) => format!(
                "Welcome{}! Use /apikey to create an API key.",
                user.handle.map(|h| format!(" @{h}")).unwrap_or_default()
            ),
            Err(err) => {
                warn!(error = %err, "user registration failed");
                "Registration failed, try again later.".to_string()
            }
        };
    }

    let user = match store.users().get_by_chat_id(chat_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return "Unknown user. Send /start first.".to_string(),
        Err(err) => {
            warn!(error = %err, "user lookup failed");
            return "Something went wrong, try again later.".to_string();
        }
    };

    match command {
        "/apikey" => {
            let scopes = if args.is_empty() {
                vec![
                    Scope::EnvRead,
                    Scope::EnvWrite,
                    Scope::DeployRead,
                    Scope::DeployWrite,
                    Scope::LogsRead,
                ]
            } else {
                match args.iter().map(|arg| arg.parse::<Scope>()).collect() {
                    Ok(scopes) => scopes,
                    Err(_) => {
                        return format!(
                            "Unknown scope. Valid scopes: {}",
                            Scope::ALL.map(|s| s.as_str()).join(", ")
                        )
                    }
                }
            };

            match credentials.issue_magic_link(&user.user_id, scopes).await {
                Ok(link) => format!(
                    "Open this link within 15 minutes to receive your key (shown once):\n\
                     {base_url}/auth/verify?token={}",
                    link.token
                ),
                Err(err) => {
                    warn!(error = %err, "magic link issuance failed");
                    "Could not create a key link, try again later.".to_string()
                }
            }
        }
        "/keys" => match store.credentials().list_keys_for_user(&user.user_id).await {
            Ok(keys) if keys.is_empty() => "You have no API keys yet.".to_string(),
            Ok(keys) => keys
                .into_iter()
                .map(|key| {
                    format!(
                        "{} [{}]{}",
                        key.key_id,
                        key.scopes
                            .iter()
                            .map(|s| s.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                        if key.revoked_at.is_some() {
                            " (revoked)"
                        } else {
                            ""
                        }
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Err(err) => {
                warn!(error = %err, "key listing failed");
                "Could not list keys, try again later.".to_string()
            }
        },
        "/revoke" => {
            let Some(key_id) = args.first() else {
                return "Usage: /revoke <key_id>".to_string();
            };
            match store
                .credentials()
                .revoke_key(&user.user_id, key_id, chrono::Utc::now())
                .await
            {
                Ok(true) => format!("Key {key_id} revoked."),
                Ok(false) => "No such key.".to_string(),
                Err(err) => {
                    warn!(error = %err, "key revocation failed");
                    "Could not revoke the key, try again later.".to_string()
                }
            }
        }
        "/notify" => {
            let enabled = match args.first() {
                Some(&"on") => true,
                Some(&"off") => false,
                _ => return "Usage: /notify on|off".to_string(),
            };
            match store
                .users()
                .set_notifications(&user.user_id, enabled, enabled)
                .await
            {
                Ok(_) => format!(
                    "Notifications {}.",
                    if enabled { "enabled" } else { "disabled" }
                ),
                Err(err) => {
                    warn!(error = %err, "notification toggle failed");
                    "Could not update preferences, try again later.".to_string()
                }
            }
        }
        _ => HELP.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (Persistence, CredentialService) {
        let store = Persistence::new_in_memory().await;
        let credentials = CredentialService::new(store.clone());
        (store, credentials)
    }

    #[tokio::test]
    async fn start_registers_then_apikey_issues_a_link() {
        let (store, credentials) = setup().await;
        let base = "https://runway.example.com";

        let reply = dispatch(&store, &credentials, base, 42, Some("ada"), "/start").await;
        assert!(reply.contains("@ada"));

        let reply = dispatch(
            &store,
            &credentials,
            base,
            42,
            None,
            "/apikey env.read env.write",
        )
        .await;
        assert!(reply.contains("/auth/verify?token="));

        // The issued link redeems into a key with exactly those scopes.
        let token = reply.split("token=").nth(1).unwrap().trim();
        let (formatted, _) = credentials.redeem_magic_link(token).await.unwrap();
        let (_, key) = credentials.authenticate(&formatted).await.unwrap();
        assert_eq!(key.scopes, vec![Scope::EnvRead, Scope::EnvWrite]);
    }

    #[tokio::test]
    async fn commands_require_registration() {
        let (store, credentials) = setup().await;

        let reply = dispatch(&store, &credentials, "http://x", 7, None, "/keys").await;
        assert!(reply.contains("/start"));
    }

    #[tokio::test]
    async fn bad_scope_is_reported() {
        let (store, credentials) = setup().await;
        dispatch(&store, &credentials, "http://x", 7, None, "/start").await;

        let reply = dispatch(&store, &credentials, "http://x", 7, None, "/apikey env.universe").await;
        assert!(reply.contains("Unknown scope"));
    }

    #[tokio::test]
    async fn notify_toggles_both_preferences() {
        let (store, credentials) = setup().await;
        dispatch(&store, &credentials, "http://x", 7, None, "/start").await;

        dispatch(&store, &credentials, "http://x", 7, None, "/notify off").await;
        let user = store.users().get_by_chat_id(7).await.unwrap().unwrap();
        assert!(!user.notify_deployments);
        assert!(!user.notify_environments);
    }

    #[tokio::test]
    async fn unknown_commands_get_help() {
        let (store, credentials) = setup().await;
        dispatch(&store, &credentials, "http://x", 7, None, "/start").await;

        let reply = dispatch(&store, &credentials, "http://x", 7, None, "/frobnicate").await;
        assert!(reply.contains("/apikey"));
    }
}
