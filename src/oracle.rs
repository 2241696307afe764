//! Config-file backed access control oracle.
//!
//! Stands in for the database-backed oracle of larger deployments. Lists
//! are global, not per-server; the interface still receives the server id
//! so a richer backend can drop in without engine changes.

use warden_core::acl::{
    AccessDecision, AccessKind, AccessOracle, AclSettings, BlacklistEntry,
};

use crate::config::AclConfig;

pub struct FileAclOracle {
    config: AclConfig,
}

impl FileAclOracle {
    pub fn new(config: AclConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl AccessOracle for FileAclOracle {
    async fn check_access(
        &self,
        player_name: &str,
        server_id: &str,
    ) -> anyhow::Result<AccessDecision> {
        if let Some(entry) = self.is_blacklisted(player_name, server_id).await? {
            return Ok(AccessDecision {
                allowed: false,
                kind: AccessKind::Blacklist,
                reason: "blacklisted".to_owned(),
                detail: entry.reason,
            });
        }
        if self.config.whitelist_enabled
            && !self
                .config
                .whitelist
                .iter()
                .any(|name| name.eq_ignore_ascii_case(player_name))
        {
            return Ok(AccessDecision {
                allowed: false,
                kind: AccessKind::Whitelist,
                reason: "not whitelisted".to_owned(),
                detail: String::new(),
            });
        }
        Ok(AccessDecision::allow())
    }

    async fn is_blacklisted(
        &self,
        player_name: &str,
        _server_id: &str,
    ) -> anyhow::Result<Option<BlacklistEntry>> {
        Ok(self
            .config
            .blacklist
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(player_name))
            .map(|entry| BlacklistEntry {
                player_name: entry.name.clone(),
                reason: entry.reason.clone(),
            }))
    }

    async fn get_settings(&self, _server_id: &str) -> anyhow::Result<AclSettings> {
        Ok(AclSettings {
            whitelist_enabled: self.config.whitelist_enabled,
            default_ban_message: self.config.default_ban_message.clone(),
            whitelist_message: self.config.whitelist_message.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlacklistConfigEntry;

    fn oracle() -> FileAclOracle {
        FileAclOracle::new(AclConfig {
            whitelist_enabled: true,
            whitelist: vec!["Alice".to_owned()],
            blacklist: vec![BlacklistConfigEntry {
                name: "Griefer".to_owned(),
                reason: "griefing".to_owned(),
            }],
            whitelist_message: None,
            default_ban_message: None,
        })
    }

    #[tokio::test]
    async fn blacklist_beats_whitelist() {
        let decision = oracle().check_access("griefer", "s1").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.kind, AccessKind::Blacklist);
        assert_eq!(decision.detail, "griefing");
    }

    #[tokio::test]
    async fn whitelist_gates_unknown_players() {
        let decision = oracle().check_access("alice", "s1").await.unwrap();
        assert!(decision.allowed);
        let decision = oracle().check_access("Mallory", "s1").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.kind, AccessKind::Whitelist);
    }
}
