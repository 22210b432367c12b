//! Source-tag and display-name cache.
//!
//! The voice transport tags every audio frame with an SSRC that is only
//! meaningful for the lifetime of a connection. Speaking-state events map an
//! SSRC to a stable user id; this cache holds that mapping together with
//! guild, channel and user display names.
//!
//! Every read is best-effort: resolution can legitimately race frame arrival,
//! so lookups return `None` or an empty string rather than failing.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;

/// A participant known at join time.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Member {
    /// Stable user id.
    pub user_id: String,
    /// Display name (may be empty).
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Default)]
struct IdentityState {
    speakers: HashMap<u32, String>,
    user_names: HashMap<String, String>,
    guild_names: HashMap<String, String>,
    channel_names: HashMap<String, String>,
}

/// Concurrently-read cache of SSRC↔user associations and display names.
#[derive(Debug, Default)]
pub struct IdentityResolver {
    state: RwLock<IdentityState>,
}

impl IdentityResolver {
    /// Create an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the user currently behind `ssrc`.
    pub fn resolve_user(&self, ssrc: u32) -> Option<String> {
        self.read(|s| s.speakers.get(&ssrc).cloned())
    }

    /// Display name for a user id, or empty when unknown.
    pub fn user_name(&self, user_id: &str) -> String {
        self.read(|s| s.user_names.get(user_id).cloned())
            .unwrap_or_default()
    }

    /// Display name for a guild id, or empty when unknown.
    pub fn guild_name(&self, guild_id: &str) -> String {
        self.read(|s| s.guild_names.get(guild_id).cloned())
            .unwrap_or_default()
    }

    /// Display name for a channel id, or empty when unknown.
    pub fn channel_name(&self, channel_id: &str) -> String {
        self.read(|s| s.channel_names.get(channel_id).cloned())
            .unwrap_or_default()
    }

    /// Map `ssrc` to `user_id`.
    ///
    /// Returns `true` when the mapping changed. Re-sending an identical
    /// mapping is a no-op; a new user for a known SSRC replaces the old one.
    pub fn upsert_speaker(&self, ssrc: u32, user_id: &str) -> bool {
        self.write(|s| {
            let previous = s.speakers.insert(ssrc, user_id.to_owned());
            previous.as_deref() != Some(user_id)
        })
    }

    /// Drop every SSRC mapped to `user_id` and return them.
    pub fn forget_user(&self, user_id: &str) -> Vec<u32> {
        self.write(|s| {
            let tags: Vec<u32> = s
                .speakers
                .iter()
                .filter(|(_, uid)| uid.as_str() == user_id)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in &tags {
                s.speakers.remove(tag);
            }
            tags
        })
    }

    /// Bulk preload display names for participants already in the channel.
    pub fn seed_from_membership(&self, members: &[Member]) {
        self.write(|s| {
            for member in members {
                if member.user_id.is_empty() {
                    continue;
                }
                if !member.display_name.is_empty() {
                    s.user_names
                        .insert(member.user_id.clone(), member.display_name.clone());
                }
            }
        });
    }

    /// Record a guild display name.
    pub fn set_guild_name(&self, guild_id: &str, name: &str) {
        self.write(|s| {
            s.guild_names.insert(guild_id.to_owned(), name.to_owned());
        });
    }

    /// Record a channel display name.
    pub fn set_channel_name(&self, channel_id: &str, name: &str) {
        self.write(|s| {
            s.channel_names.insert(channel_id.to_owned(), name.to_owned());
        });
    }

    /// Number of SSRCs currently mapped.
    pub fn speaker_count(&self) -> usize {
        self.read(|s| Some(s.speakers.len())).unwrap_or(0)
    }

    // A poisoned lock only means a writer panicked mid-update; the maps are
    // still structurally valid, so keep serving from them.
    fn read<T>(&self, f: impl FnOnce(&IdentityState) -> Option<T>) -> Option<T> {
        let guard = self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut IdentityState) -> T) -> T {
        let mut guard = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_lookups_are_empty() {
        let ids = IdentityResolver::new();
        assert_eq!(ids.resolve_user(7), None);
        assert_eq!(ids.guild_name("g"), "");
        assert_eq!(ids.channel_name("c"), "");
        assert_eq!(ids.user_name("u"), "");
    }

    #[test]
    fn upsert_is_idempotent() {
        let ids = IdentityResolver::new();
        assert!(ids.upsert_speaker(7, "42"));
        assert!(!ids.upsert_speaker(7, "42"));
        assert_eq!(ids.resolve_user(7).as_deref(), Some("42"));
        assert_eq!(ids.speaker_count(), 1);
    }

    #[test]
    fn upsert_replaces_user_for_reused_tag() {
        let ids = IdentityResolver::new();
        ids.upsert_speaker(7, "42");
        assert!(ids.upsert_speaker(7, "99"));
        assert_eq!(ids.resolve_user(7).as_deref(), Some("99"));
    }

    #[test]
    fn forget_user_removes_all_tags() {
        let ids = IdentityResolver::new();
        ids.upsert_speaker(1, "42");
        ids.upsert_speaker(2, "42");
        ids.upsert_speaker(3, "99");
        let mut removed = ids.forget_user("42");
        removed.sort_unstable();
        assert_eq!(removed, vec![1, 2]);
        assert_eq!(ids.resolve_user(3).as_deref(), Some("99"));
        assert!(ids.forget_user("nobody").is_empty());
    }

    #[test]
    fn seed_from_membership_fills_names() {
        let ids = IdentityResolver::new();
        ids.seed_from_membership(&[
            Member {
                user_id: "42".to_owned(),
                display_name: "Ada".to_owned(),
            },
            Member {
                user_id: String::new(),
                display_name: "ghost".to_owned(),
            },
        ]);
        assert_eq!(ids.user_name("42"), "Ada");
        assert_eq!(ids.user_name(""), "");
    }

    #[test]
    fn guild_and_channel_names() {
        let ids = IdentityResolver::new();
        ids.set_guild_name("g1", "Lab");
        ids.set_channel_name("c1", "General");
        assert_eq!(ids.guild_name("g1"), "Lab");
        assert_eq!(ids.channel_name("c1"), "General");
    }
}
