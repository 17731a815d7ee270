//! Card action handling: structured UI interactions that mutate session
//! configuration. Card actions never reach the completion gateway.

use crate::roles::RoleCatalog;
use crate::session::SessionStore;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

/// Action code carried in a card element's value map.
pub const ACTION_SELECT_ROLE: &str = "select-role";
pub const ACTION_RESET_HISTORY: &str = "reset-history";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CardError {
    /// The requested role is not in the catalog. Session is left unchanged.
    #[error("unknown role: {0}")]
    UnknownRole(String),
    /// Action code we do not handle.
    #[error("unknown card action: {0}")]
    UnknownAction(String),
    /// The action arrived without its required parameter.
    #[error("missing card parameter: {0}")]
    MissingParam(&'static str),
}

/// Applies card actions against the session store and renders the updated
/// card state.
pub struct CardActionHandler {
    sessions: Arc<SessionStore>,
    catalog: Arc<RoleCatalog>,
}

impl CardActionHandler {
    pub fn new(sessions: Arc<SessionStore>, catalog: Arc<RoleCatalog>) -> Self {
        Self { sessions, catalog }
    }

    /// Apply one action for `user_id` and return the card payload to show.
    /// On error the session is guaranteed untouched; the caller decides how
    /// to render the failure.
    pub async fn apply(
        &self,
        user_id: &str,
        action: &str,
        params: &Value,
    ) -> Result<Value, CardError> {
        match action {
            ACTION_SELECT_ROLE => {
                // Buttons carry the role in the value map; select menus
                // deliver the chosen option separately
                let role = params
                    .get("role")
                    .and_then(Value::as_str)
                    .or_else(|| params.get("option").and_then(Value::as_str))
                    .ok_or(CardError::MissingParam("role"))?;

                if !self.catalog.contains(role) {
                    return Err(CardError::UnknownRole(role.to_string()));
                }

                self.sessions.set_role(user_id, role).await;
                tracing::info!(user_id, role, "Role selected");
                Ok(self.render_settings_card(role, Some("Role updated.")))
            }
            ACTION_RESET_HISTORY => {
                self.sessions.reset_history(user_id).await;
                let role = self
                    .sessions
                    .role(user_id)
                    .await
                    .unwrap_or_else(|| "default".to_string());
                tracing::info!(user_id, "History reset");
                Ok(self.render_settings_card(&role, Some("History cleared.")))
            }
            other => Err(CardError::UnknownAction(other.to_string())),
        }
    }

    /// Settings card: current role, role picker, and a reset button.
    pub fn render_settings_card(&self, selected_role: &str, note: Option<&str>) -> Value {
        let options: Vec<Value> = self
            .catalog
            .names()
            .iter()
            .map(|name| {
                json!({
                    "text": { "tag": "plain_text", "content": name },
                    "value": name,
                })
            })
            .collect();

        let mut elements = vec![json!({
            "tag": "div",
            "text": {
                "tag": "lark_md",
                "content": format!("Current role: **{}**", selected_role),
            },
        })];
        if let Some(note) = note {
            elements.push(json!({
                "tag": "note",
                "elements": [{ "tag": "plain_text", "content": note }],
            }));
        }
        elements.push(json!({
            "tag": "action",
            "actions": [
                {
                    "tag": "select_static",
                    "placeholder": { "tag": "plain_text", "content": "Choose a role" },
                    "value": { "action": ACTION_SELECT_ROLE },
                    "options": options,
                },
                {
                    "tag": "button",
                    "text": { "tag": "plain_text", "content": "Clear history" },
                    "type": "danger",
                    "value": { "action": ACTION_RESET_HISTORY },
                },
            ],
        }));

        json!({
            "config": { "wide_screen_mode": true },
            "header": {
                "template": "blue",
                "title": { "tag": "plain_text", "content": "Assistant settings" },
            },
            "elements": elements,
        })
    }

    /// Card shown when an action failed. State was not changed.
    pub fn render_error_card(&self, message: &str) -> Value {
        json!({
            "config": { "wide_screen_mode": true },
            "header": {
                "template": "red",
                "title": { "tag": "plain_text", "content": "Action failed" },
            },
            "elements": [{
                "tag": "div",
                "text": { "tag": "lark_md", "content": message },
            }],
        })
    }
}
