use serde::{Deserialize, Serialize};

/// Denormalized display data for the signed-in user.
///
/// Carried alongside the session for rendering only; never consulted for
/// authorization decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

impl UserSummary {
    /// Name to show in headers, falling back to the email address
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.email,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: Option<&str>) -> UserSummary {
        UserSummary {
            id: "u-1".to_string(),
            email: "ada@example.com".to_string(),
            name: name.map(str::to_string),
            avatar_url: None,
        }
    }

    #[test]
    fn test_display_name_prefers_name() {
        assert_eq!(user(Some("Ada Lovelace")).display_name(), "Ada Lovelace");
    }

    #[test]
    fn test_display_name_falls_back_to_email() {
        assert_eq!(user(None).display_name(), "ada@example.com");
        assert_eq!(user(Some("  ")).display_name(), "ada@example.com");
    }

    #[test]
    fn test_parse_user_summary() {
        let json = r#"{"id":"42","email":"a@b.c","name":"A","avatarUrl":"https://cdn/x.png"}"#;
        let parsed: UserSummary = serde_json::from_str(json).expect("Failed to parse user JSON");
        assert_eq!(parsed.avatar_url.as_deref(), Some("https://cdn/x.png"));
    }
}
