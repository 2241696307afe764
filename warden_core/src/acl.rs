//! Access control seam.
//!
//! The engines only consume the oracle interface; list storage lives with
//! the persistence collaborator. Evaluation order is blacklist, then
//! whitelist (when enabled), then the external verifier. An oracle
//! infrastructure failure fails open: the player is let through and a
//! warning is logged.

use std::net::IpAddr;

use crate::login::PlayerIdentity;

/// Which list produced an access decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    None,
    Blacklist,
    Whitelist,
    Unknown,
}

/// Outcome of an oracle lookup.
#[derive(Debug, Clone)]
pub struct AccessDecision {
    pub allowed: bool,
    pub kind: AccessKind,
    pub reason: String,
    pub detail: String,
}

impl AccessDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            kind: AccessKind::None,
            reason: String::new(),
            detail: String::new(),
        }
    }
}

/// A blacklist entry, surfaced to format the denial message.
#[derive(Debug, Clone)]
pub struct BlacklistEntry {
    pub player_name: String,
    pub reason: String,
}

/// Per-server ACL settings.
#[derive(Debug, Clone, Default)]
pub struct AclSettings {
    pub whitelist_enabled: bool,
    pub default_ban_message: Option<String>,
    pub whitelist_message: Option<String>,
}

/// The consulted access control oracle.
#[async_trait::async_trait]
pub trait AccessOracle: Send + Sync {
    async fn check_access(&self, player_name: &str, server_id: &str)
        -> anyhow::Result<AccessDecision>;

    async fn is_blacklisted(
        &self,
        player_name: &str,
        server_id: &str,
    ) -> anyhow::Result<Option<BlacklistEntry>>;

    async fn get_settings(&self, server_id: &str) -> anyhow::Result<AclSettings>;
}

/// Optional external identity verifier, consulted after the ACL passes.
#[async_trait::async_trait]
pub trait ExternalVerifier: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Returns whether the player is allowed, with an optional reason on
    /// refusal.
    async fn verify(
        &self,
        xuid: &str,
        uuid: &str,
        player_name: &str,
        server_id: &str,
        client_ip: IpAddr,
    ) -> anyhow::Result<(bool, Option<String>)>;
}

/// Oracle admitting everyone. Used when no ACL backend is wired up.
pub struct AllowAllOracle;

#[async_trait::async_trait]
impl AccessOracle for AllowAllOracle {
    async fn check_access(
        &self,
        _player_name: &str,
        _server_id: &str,
    ) -> anyhow::Result<AccessDecision> {
        Ok(AccessDecision::allow())
    }

    async fn is_blacklisted(
        &self,
        _player_name: &str,
        _server_id: &str,
    ) -> anyhow::Result<Option<BlacklistEntry>> {
        Ok(None)
    }

    async fn get_settings(&self, _server_id: &str) -> anyhow::Result<AclSettings> {
        Ok(AclSettings::default())
    }
}

/// Result of the full admission pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessVerdict {
    Allow,
    Deny { message: String },
}

pub fn blacklist_message(player_name: &str, detail: &str) -> String {
    format!("§c黑名单用户\n§7玩家名字：{player_name}\n§7原因：{detail}")
}

pub fn whitelist_message(settings: &AclSettings, player_name: &str) -> String {
    let message = settings
        .whitelist_message
        .as_deref()
        .unwrap_or("未在白名单中");
    format!("§c{message}\n§7玩家名: {player_name}")
}

pub fn verifier_message(reason: Option<&str>) -> String {
    format!("§c{}", reason.unwrap_or("验证失败，请稍后再试"))
}

pub fn disabled_message(configured: Option<&str>) -> String {
    configured
        .unwrap_or("服务器暂时关闭，请稍后再试")
        .to_owned()
}

pub fn outbound_failure_message(target: &str, node: &str, err: &str) -> String {
    format!("§c出口节点 / 远程服务器连接失败\n§7目标: {target}\n§7节点: {node}\n§7错误: {err}")
}

/// Runs the admission pipeline for a freshly identified player.
///
/// Blacklist precedes whitelist; the whitelist applies only when enabled
/// in the per-server settings; the external verifier runs last. Oracle
/// failures fail open.
pub async fn evaluate_access(
    oracle: &dyn AccessOracle,
    verifier: Option<&dyn ExternalVerifier>,
    identity: &PlayerIdentity,
    server_id: &str,
    client_ip: IpAddr,
) -> AccessVerdict {
    let name = identity.display_name.as_str();
    let decision = match oracle.check_access(name, server_id).await {
        Ok(decision) => decision,
        Err(err) => {
            log::warn!(
                "[{}] Allowing {} (fail-open): {}",
                server_id,
                name,
                crate::ProxyError::AclInfrastructure(err)
            );
            AccessDecision::allow()
        }
    };
    if !decision.allowed {
        let message = match decision.kind {
            AccessKind::Whitelist => {
                let settings = oracle.get_settings(server_id).await.unwrap_or_default();
                whitelist_message(&settings, name)
            }
            _ => blacklist_message(name, &decision.detail),
        };
        return AccessVerdict::Deny { message };
    }

    if let Some(verifier) = verifier.filter(|verifier| verifier.is_enabled()) {
        match verifier
            .verify(&identity.xuid, &identity.uuid, name, server_id, client_ip)
            .await
        {
            Ok((true, _)) => {}
            Ok((false, reason)) => {
                return AccessVerdict::Deny {
                    message: verifier_message(reason.as_deref()),
                };
            }
            Err(err) => {
                log::warn!(
                    "[{}] External verifier errored for {}: {:?}",
                    server_id,
                    name,
                    err
                );
                return AccessVerdict::Deny {
                    message: verifier_message(None),
                };
            }
        }
    }
    AccessVerdict::Allow
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedOracle {
        decision: anyhow::Result<AccessDecision>,
        settings: AclSettings,
    }

    #[async_trait::async_trait]
    impl AccessOracle for ScriptedOracle {
        async fn check_access(
            &self,
            _player_name: &str,
            _server_id: &str,
        ) -> anyhow::Result<AccessDecision> {
            match &self.decision {
                Ok(decision) => Ok(decision.clone()),
                Err(err) => Err(anyhow::anyhow!("{err}")),
            }
        }

        async fn is_blacklisted(
            &self,
            _player_name: &str,
            _server_id: &str,
        ) -> anyhow::Result<Option<BlacklistEntry>> {
            Ok(None)
        }

        async fn get_settings(&self, _server_id: &str) -> anyhow::Result<AclSettings> {
            Ok(self.settings.clone())
        }
    }

    struct RefusingVerifier;

    #[async_trait::async_trait]
    impl ExternalVerifier for RefusingVerifier {
        fn is_enabled(&self) -> bool {
            true
        }

        async fn verify(
            &self,
            _xuid: &str,
            _uuid: &str,
            _player_name: &str,
            _server_id: &str,
            _client_ip: IpAddr,
        ) -> anyhow::Result<(bool, Option<String>)> {
            Ok((false, Some("不允许接入".to_owned())))
        }
    }

    fn alice() -> PlayerIdentity {
        PlayerIdentity {
            display_name: "Alice".to_owned(),
            uuid: "u-1".to_owned(),
            xuid: "x-1".to_owned(),
        }
    }

    fn ip() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    #[tokio::test]
    async fn blacklist_denial_formats_message() {
        let oracle = ScriptedOracle {
            decision: Ok(AccessDecision {
                allowed: false,
                kind: AccessKind::Blacklist,
                reason: "blacklist".to_owned(),
                detail: "griefing".to_owned(),
            }),
            settings: AclSettings::default(),
        };
        let verdict = evaluate_access(&oracle, None, &alice(), "s1", ip()).await;
        assert_eq!(
            verdict,
            AccessVerdict::Deny {
                message: "§c黑名单用户\n§7玩家名字：Alice\n§7原因：griefing".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn whitelist_denial_uses_configured_message() {
        let oracle = ScriptedOracle {
            decision: Ok(AccessDecision {
                allowed: false,
                kind: AccessKind::Whitelist,
                reason: String::new(),
                detail: String::new(),
            }),
            settings: AclSettings {
                whitelist_enabled: true,
                default_ban_message: None,
                whitelist_message: Some("仅限白名单".to_owned()),
            },
        };
        let verdict = evaluate_access(&oracle, None, &alice(), "s1", ip()).await;
        assert_eq!(
            verdict,
            AccessVerdict::Deny {
                message: "§c仅限白名单\n§7玩家名: Alice".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn oracle_failure_fails_open() {
        let oracle = ScriptedOracle {
            decision: Err(anyhow::anyhow!("database unreachable")),
            settings: AclSettings::default(),
        };
        let verdict = evaluate_access(&oracle, None, &alice(), "s1", ip()).await;
        assert_eq!(verdict, AccessVerdict::Allow);
    }

    #[tokio::test]
    async fn verifier_refusal_denies_after_acl_pass() {
        let oracle = ScriptedOracle {
            decision: Ok(AccessDecision::allow()),
            settings: AclSettings::default(),
        };
        let verdict =
            evaluate_access(&oracle, Some(&RefusingVerifier), &alice(), "s1", ip()).await;
        assert_eq!(
            verdict,
            AccessVerdict::Deny {
                message: "§c不允许接入".to_owned()
            }
        );
    }
}
