use poise::serenity_prelude::{GuildId, Http, Permissions};
use tracing::{error, info, warn};

/// A single permission with its status
#[derive(Debug, Clone)]
pub struct PermissionStatus {
    pub name: &'static str,
    pub description: &'static str,
    pub has_permission: bool,
}

/// Permissions the bot needs to gate new members
pub fn get_required_permissions() -> Vec<(&'static str, &'static str, Permissions)> {
    vec![
        ("VIEW_CHANNEL", "See the challenge channel", Permissions::VIEW_CHANNEL),
        ("SEND_MESSAGES", "Post challenges and notices", Permissions::SEND_MESSAGES),
        ("MANAGE_MESSAGES", "Retract challenges and notices", Permissions::MANAGE_MESSAGES),
        ("MODERATE_MEMBERS", "Mute (timeout) and unmute new members", Permissions::MODERATE_MEMBERS),
        ("BAN_MEMBERS", "Remove members who time out (ban + unban)", Permissions::BAN_MEMBERS),
    ]
}

/// Result of a permission check for a single guild
#[derive(Debug)]
pub struct GuildPermissionCheck {
    pub guild_id: GuildId,
    pub guild_name: String,
    pub is_administrator: bool,
    pub permission_statuses: Vec<PermissionStatus>,
    pub has_all_permissions: bool,
}

impl GuildPermissionCheck {
    /// Whether the bot can run the verification flow in this guild
    pub fn can_moderate(&self) -> bool {
        self.is_administrator || self.has_all_permissions
    }
}

/// Compare the bot's permissions against the required set
pub fn evaluate_permissions(bot_permissions: Permissions) -> (Vec<PermissionStatus>, bool) {
    let is_administrator = bot_permissions.contains(Permissions::ADMINISTRATOR);
    let mut has_all_permissions = true;

    let statuses = get_required_permissions()
        .into_iter()
        .map(|(name, description, permission)| {
            let has_permission = is_administrator || bot_permissions.contains(permission);
            if !has_permission {
                has_all_permissions = false;
            }
            PermissionStatus {
                name,
                description,
                has_permission,
            }
        })
        .collect();

    (statuses, has_all_permissions)
}

/// Check bot permissions for a specific guild
pub async fn check_guild_permissions(
    http: &Http,
    guild_id: GuildId,
) -> Result<GuildPermissionCheck, String> {
    let guild = guild_id
        .to_partial_guild(http)
        .await
        .map_err(|e| format!("Failed to fetch guild {}: {}", guild_id, e))?;

    let bot_user = http
        .get_current_user()
        .await
        .map_err(|e| format!("Failed to get bot user: {}", e))?;

    let bot_member = guild
        .member(http, bot_user.id)
        .await
        .map_err(|e| format!("Failed to get bot member in guild {}: {}", guild_id, e))?;

    // Base permissions are what matter for server-wide moderation
    #[allow(deprecated)]
    let bot_permissions = guild.member_permissions(&bot_member);

    let (permission_statuses, has_all_permissions) = evaluate_permissions(bot_permissions);

    Ok(GuildPermissionCheck {
        guild_id,
        guild_name: guild.name.clone(),
        is_administrator: bot_permissions.contains(Permissions::ADMINISTRATOR),
        permission_statuses,
        has_all_permissions,
    })
}

/// Check permissions for all guilds the bot is in
pub async fn check_all_guild_permissions(
    http: &Http,
    guild_ids: &[GuildId],
) -> Vec<GuildPermissionCheck> {
    let mut results = Vec::new();

    for guild_id in guild_ids {
        match check_guild_permissions(http, *guild_id).await {
            Ok(check) => results.push(check),
            Err(e) => {
                error!("Failed to check permissions for guild {}: {}", guild_id, e);
            }
        }
    }

    results
}

/// Log permission check results with appropriate log levels
pub fn log_permission_check_results(results: &[GuildPermissionCheck]) {
    info!("========================================");
    info!("       BOT PERMISSION CHECK");
    info!("========================================");

    for check in results {
        info!("Guild: '{}' (ID: {})", check.guild_name, check.guild_id);
        info!("----------------------------------------");

        if check.is_administrator {
            info!("  [YES] ADMINISTRATOR      - implies every permission below");
        }

        for status in &check.permission_statuses {
            if status.has_permission {
                info!("  [YES] {:<18} - {}", status.name, status.description);
            } else {
                error!("  [NO]  {:<18} - {}", status.name, status.description);
            }
        }

        if check.can_moderate() {
            info!("Status: ALL CHECKS PASSED");
        } else {
            let missing: Vec<_> = check
                .permission_statuses
                .iter()
                .filter(|s| !s.has_permission)
                .map(|s| s.name)
                .collect();
            error!("Status: new members in this guild will NOT be gated");
            error!("  Missing permissions: {}", missing.join(", "));
            error!("  Fix: Go to Discord Server Settings > Roles > Bot's role > enable missing permissions");
        }
        info!("========================================");
    }

    if results.iter().all(|r| r.can_moderate()) {
        info!("OVERALL: All permission checks passed for all guilds");
    } else {
        warn!("OVERALL: Permission issues detected in one or more guilds!");
    }
}

/// Run a full permission check and log results
/// Returns true if the bot can moderate in every guild
pub async fn run_startup_permission_check(http: &Http, guild_ids: &[GuildId]) -> bool {
    let results = check_all_guild_permissions(http, guild_ids).await;
    log_permission_check_results(&results);

    results.iter().all(|r| r.can_moderate())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_administrator_implies_all() {
        let (statuses, all) = evaluate_permissions(Permissions::ADMINISTRATOR);
        assert!(all);
        assert!(statuses.iter().all(|s| s.has_permission));
    }

    #[test]
    fn test_missing_ban_reported() {
        let perms = Permissions::VIEW_CHANNEL
            | Permissions::SEND_MESSAGES
            | Permissions::MANAGE_MESSAGES
            | Permissions::MODERATE_MEMBERS;
        let (statuses, all) = evaluate_permissions(perms);

        assert!(!all);
        let missing: Vec<_> = statuses
            .iter()
            .filter(|s| !s.has_permission)
            .map(|s| s.name)
            .collect();
        assert_eq!(missing, vec!["BAN_MEMBERS"]);
    }

    #[test]
    fn test_explicit_set_is_enough() {
        let perms = get_required_permissions()
            .into_iter()
            .fold(Permissions::empty(), |acc, (_, _, p)| acc | p);
        let (_, all) = evaluate_permissions(perms);
        assert!(all);
    }
}
