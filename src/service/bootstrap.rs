use std::fs;
use std::path::Path;

use cyder_tools::log::info;
use serde::Deserialize;

use crate::database::channel::Channel;
use crate::database::error_rule::CustomErrorRule;
use crate::database::redemption::Redemption;
use crate::database::token::Token;
use crate::database::user::User;
use crate::database::{DbError, DbResult, SharedStore};

/// Seed document loaded at startup. Rows are upserted by id.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BootstrapFile {
    pub channels: Vec<Channel>,
    pub users: Vec<User>,
    pub tokens: Vec<Token>,
    pub error_rules: Vec<CustomErrorRule>,
    pub redemptions: Vec<Redemption>,
}

impl BootstrapFile {
    pub fn parse(yaml: &str) -> DbResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| DbError::Invalid(format!("invalid bootstrap file: {}", e)))
    }

    pub fn load(path: &Path) -> DbResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| DbError::Invalid(format!("cannot read bootstrap file {:?}: {}", path, e)))?;
        Self::parse(&content)
    }

    pub fn apply(&self, store: &SharedStore) -> DbResult<()> {
        for user in &self.users {
            store.upsert_user(user)?;
        }
        for token in &self.tokens {
            store.upsert_token(token)?;
        }
        for channel in &self.channels {
            store.upsert_channel(channel)?;
        }
        for rule in &self.error_rules {
            store.upsert_error_rule(rule)?;
        }
        for redemption in &self.redemptions {
            store.upsert_redemption(redemption)?;
        }
        info!(
            "bootstrap seeded {} channels, {} users, {} tokens, {} error rules, {} redemptions",
            self.channels.len(),
            self.users.len(),
            self.tokens.len(),
            self.error_rules.len(),
            self.redemptions.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::channel::ChannelStore;
    use crate::database::memory::MemoryStore;
    use crate::database::token::TokenStore;
    use crate::database::user::UserStore;
    use crate::schema::enum_def::ChannelType;
    use std::sync::Arc;

    const SEED: &str = r#"
users:
  - id: 1
    username: alice
    quota: 1000000
tokens:
  - id: 10
    user_id: 1
    key: sk-alice
    unlimited_quota: true
channels:
  - id: 100
    type: deepseek
    base_url: https://api.deepseek.com
    key: sk-upstream
    models: [deepseek-chat]
    model_mapping:
      "Pro/*": "*"
"#;

    #[test]
    fn seed_rows_land_in_store() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        BootstrapFile::parse(SEED).unwrap().apply(&store).unwrap();
        assert_eq!(store.get_user(1).unwrap().unwrap().quota, 1_000_000);
        assert_eq!(store.get_token_by_key("sk-alice").unwrap().unwrap().id, 10);
        let channels = store.list_channels().unwrap();
        assert_eq!(channels[0].channel_type, ChannelType::DeepSeek);
        assert_eq!(channels[0].groups, vec!["default".to_string()]);
        assert_eq!(channels[0].model_mapping.get("Pro/*").map(String::as_str), Some("*"));
    }

    #[test]
    fn unknown_sections_are_rejected() {
        assert!(BootstrapFile::parse("providers: []\n").is_err());
    }
}
