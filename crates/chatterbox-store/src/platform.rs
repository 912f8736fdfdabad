//! Tenant dimension and deterministic table naming.
//!
//! Every table family exists once per [`Platform`] and is named
//! `<entity>_<platform>`. Table names are only ever produced from these two
//! closed enums, so interpolating them into SQL text cannot inject anything.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A chat service the bot is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitch,
    Discord,
    Telegram,
    #[serde(rename = "youtube")]
    YouTube,
}

impl Platform {
    /// Every known platform, in catalog order.
    pub const ALL: [Platform; 4] = [
        Platform::Twitch,
        Platform::Discord,
        Platform::Telegram,
        Platform::YouTube,
    ];

    /// Stable lowercase tag used in table names.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Twitch => "twitch",
            Self::Discord => "discord",
            Self::Telegram => "telegram",
            Self::YouTube => "youtube",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "twitch" => Ok(Self::Twitch),
            "discord" => Ok(Self::Discord),
            "telegram" => Ok(Self::Telegram),
            "youtube" => Ok(Self::YouTube),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown platform: {other}"
            ))),
        }
    }
}

/// A table family. One physical table exists per (entity, platform).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Users,
    ChannelCounts,
    Usernames,
    Bans,
    Moderators,
    Developers,
    Ignored,
    Cooldowns,
    BanWords,
    Channels,
}

impl Entity {
    /// Every table family, in creation order.
    pub const ALL: [Entity; 10] = [
        Entity::Users,
        Entity::ChannelCounts,
        Entity::Usernames,
        Entity::Bans,
        Entity::Moderators,
        Entity::Developers,
        Entity::Ignored,
        Entity::Cooldowns,
        Entity::BanWords,
        Entity::Channels,
    ];

    /// Table name prefix for this family.
    pub fn base(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::ChannelCounts => "channel_counts",
            Self::Usernames => "usernames",
            Self::Bans => "bans",
            Self::Moderators => "moderators",
            Self::Developers => "developers",
            Self::Ignored => "ignored",
            Self::Cooldowns => "cooldowns",
            Self::BanWords => "ban_words",
            Self::Channels => "channels",
        }
    }

    /// Physical table name for this family on `platform`.
    pub fn table(self, platform: Platform) -> String {
        format!("{}_{}", self.base(), platform.as_str())
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_deterministic() {
        assert_eq!(Entity::Users.table(Platform::Twitch), "users_twitch");
        assert_eq!(Entity::BanWords.table(Platform::YouTube), "ban_words_youtube");
        assert_eq!(
            Entity::ChannelCounts.table(Platform::Discord),
            "channel_counts_discord"
        );
    }

    #[test]
    fn platform_round_trips_through_tag() {
        for platform in Platform::ALL {
            let parsed: Platform = platform.as_str().parse().unwrap();
            assert_eq!(parsed, platform);
        }
        assert_eq!("Twitch".parse::<Platform>().unwrap(), Platform::Twitch);
    }

    #[test]
    fn unknown_platform_is_rejected() {
        let err = "irc".parse::<Platform>().unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn platform_serde_uses_lowercase_tags() {
        let json = serde_json::to_string(&Platform::YouTube).unwrap();
        assert_eq!(json, "\"youtube\"");
        let back: Platform = serde_json::from_str("\"discord\"").unwrap();
        assert_eq!(back, Platform::Discord);
    }
}
