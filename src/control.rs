//! Per-service enable/disable, ban, response, and packed-data control
//! layer, backed by SQLite.
//!
//! Ports `examples/original_source/extension/control/{control,class,manager}.go`
//! and `utils/control/*.go` (cross-checked against both parallel
//! implementations in the original for the bit-packing and cache
//! fallback semantics).

use crate::error::{ControlError, Result};
use anyhow::Context as _;
use md5::{Digest, Md5};
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

const GID_ALL: i64 = 0;

/// Three-state cache entry for a single group's enabled flag: a group
/// that has never been written to falls through to the service default.
#[derive(Clone, Copy, PartialEq, Eq)]
enum EnableState {
    Enabled,
    Disabled,
}

#[derive(Default)]
struct ServiceCache {
    enable: HashMap<i64, EnableState>,
    /// Mirrors the gid=0 "global default disable" flip bit.
    default_disable: bool,
}

/// Owns the shared pool and every service's caches. One instance per
/// runtime, matching the original's single `Manager[CTX]`.
pub struct ControlManager {
    pool: SqlitePool,
    services: RwLock<HashMap<String, ServiceCache>>,
    ban_cache: RwLock<HashSet<u64>>,
    response_cache: RwLock<HashMap<i64, String>>,
    block_cache: RwLock<HashSet<i64>>,
}

impl ControlManager {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS __block (uid INTEGER PRIMARY KEY)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS __resp (gid INTEGER PRIMARY KEY, extra TEXT NOT NULL DEFAULT '')",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            services: RwLock::new(HashMap::new()),
            ban_cache: RwLock::new(HashSet::new()),
            response_cache: RwLock::new(HashMap::new()),
            block_cache: RwLock::new(HashSet::new()),
        })
    }

    /// Creates `<service>` and `<service>_ban` tables and seeds the
    /// service's cache, reading any persisted `gid=0` default-disable
    /// flip. Matches `NewControl`.
    pub async fn register_service(&self, service: &str, default_disable: bool) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS \"{service}\" (gid INTEGER PRIMARY KEY, disable INTEGER NOT NULL DEFAULT 0)"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS \"{service}_ban\" (id INTEGER PRIMARY KEY, uid INTEGER NOT NULL, gid INTEGER NOT NULL)"
        ))
        .execute(&self.pool)
        .await?;

        let persisted_default = sqlx::query(&format!("SELECT disable FROM \"{service}\" WHERE gid = ?"))
            .bind(GID_ALL)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.get::<i64, _>("disable"));

        let effective_default = match persisted_default {
            Some(word) => unpack_default_disable(word),
            None => default_disable,
        };

        self.services.write().await.insert(
            service.to_string(),
            ServiceCache {
                enable: HashMap::new(),
                default_disable: effective_default,
            },
        );
        Ok(())
    }

    fn require_service<'a>(&self, services: &'a HashMap<String, ServiceCache>, service: &str) -> Result<&'a ServiceCache> {
        services
            .get(service)
            .ok_or_else(|| ControlError::UnknownService(service.to_string()).into())
    }

    /// `gid = 0` is checked first as a global override — `Disable(service,
    /// 0)` disables every group — falling back to the specific `gid` only
    /// when `0`'s state is unknown, matching `control.go::IsEnable` and
    /// this module's own `can_response`.
    pub async fn is_enabled(&self, service: &str, gid: i64) -> Result<bool> {
        if gid != GID_ALL {
            if let Some(enabled) = self.known_enabled_state(service, GID_ALL).await? {
                return Ok(enabled);
            }
        }

        if let Some(enabled) = self.known_enabled_state(service, gid).await? {
            return Ok(enabled);
        }

        let services = self.services.read().await;
        let cache = self.require_service(&services, service)?;
        Ok(!cache.default_disable)
    }

    /// Looks up `gid`'s explicit enable/disable state (cache hit or
    /// persisted row), returning `None` when it's never been set and
    /// should fall through to the service default.
    async fn known_enabled_state(&self, service: &str, gid: i64) -> Result<Option<bool>> {
        {
            let services = self.services.read().await;
            let cache = self.require_service(&services, service)?;
            if let Some(state) = cache.enable.get(&gid) {
                return Ok(Some(*state == EnableState::Enabled));
            }
        }

        let row = sqlx::query(&format!("SELECT disable FROM \"{service}\" WHERE gid = ?"))
            .bind(gid)
            .fetch_optional(&self.pool)
            .await
            .context("failed to query enable state")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let enabled = (row.get::<i64, _>("disable") & 1) == 0;
        let mut services = self.services.write().await;
        let cache = services
            .get_mut(service)
            .ok_or_else(|| ControlError::UnknownService(service.to_string()))?;
        cache
            .enable
            .insert(gid, if enabled { EnableState::Enabled } else { EnableState::Disabled });
        Ok(Some(enabled))
    }

    pub async fn enable(&self, service: &str, gid: i64) -> Result<()> {
        self.set_enabled(service, gid, true).await
    }

    pub async fn disable(&self, service: &str, gid: i64) -> Result<()> {
        self.set_enabled(service, gid, false).await
    }

    async fn set_enabled(&self, service: &str, gid: i64, enabled: bool) -> Result<()> {
        let current_word = self.current_word(service, gid).await?;
        let new_word = if enabled { current_word & !1 } else { current_word | 1 };
        sqlx::query(&format!(
            "INSERT INTO \"{service}\" (gid, disable) VALUES (?, ?)
             ON CONFLICT(gid) DO UPDATE SET disable = excluded.disable"
        ))
        .bind(gid)
        .bind(new_word)
        .execute(&self.pool)
        .await?;

        let mut services = self.services.write().await;
        let cache = services
            .get_mut(service)
            .ok_or_else(|| ControlError::UnknownService(service.to_string()))?;
        cache
            .enable
            .insert(gid, if enabled { EnableState::Enabled } else { EnableState::Disabled });
        Ok(())
    }

    /// Deletes the group's override row, reverting it to the service
    /// default. `gid = 0` is reserved and cannot be reset.
    pub async fn reset(&self, service: &str, gid: i64) -> Result<()> {
        if gid == GID_ALL {
            return Err(ControlError::ReservedGroup.into());
        }
        sqlx::query(&format!("DELETE FROM \"{service}\" WHERE gid = ?"))
            .bind(gid)
            .execute(&self.pool)
            .await?;
        let mut services = self.services.write().await;
        let cache = services
            .get_mut(service)
            .ok_or_else(|| ControlError::UnknownService(service.to_string()))?;
        cache.enable.remove(&gid);
        Ok(())
    }

    async fn current_word(&self, service: &str, gid: i64) -> Result<i64> {
        let row = sqlx::query(&format!("SELECT disable FROM \"{service}\" WHERE gid = ?"))
            .bind(gid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("disable")).unwrap_or(0))
    }

    /// Packs `data` (lower 62 bits used) into the group's control word,
    /// preserving bit 0 (enable/disable) and bit 63 (default-disable
    /// flip). Ports `control.go::SetData`'s rotate-left/mask/rotate-right
    /// trick.
    pub async fn set_data(&self, service: &str, gid: i64, data: u64) -> Result<()> {
        let current = self.current_word(service, gid).await? as u64;
        let mut x = current.rotate_left(1);
        x &= 0x03;
        x |= data << 2;
        let packed = x.rotate_right(1);
        sqlx::query(&format!(
            "INSERT INTO \"{service}\" (gid, disable) VALUES (?, ?)
             ON CONFLICT(gid) DO UPDATE SET disable = excluded.disable"
        ))
        .bind(gid)
        .bind(packed as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_data(&self, service: &str, gid: i64) -> Result<u64> {
        let word = self.current_word(service, gid).await? as u64;
        Ok((word >> 1) & 0x3fff_ffff_ffff_ffff)
    }

    /// Toggles the service's in-process default-disable and persists the
    /// flip into bit 63 of the `gid=0` row. Ports `control.go::Flip`.
    pub async fn flip(&self, service: &str) -> Result<bool> {
        let mut services = self.services.write().await;
        let cache = services
            .get_mut(service)
            .ok_or_else(|| ControlError::UnknownService(service.to_string()))?;
        cache.default_disable = !cache.default_disable;
        let new_default = cache.default_disable;
        drop(services);

        let current = self.current_word(service, GID_ALL).await? as u64;
        let packed = pack_default_disable(current, new_default);
        sqlx::query(&format!(
            "INSERT INTO \"{service}\" (gid, disable) VALUES (?, ?)
             ON CONFLICT(gid) DO UPDATE SET disable = excluded.disable"
        ))
        .bind(GID_ALL)
        .bind(packed as i64)
        .execute(&self.pool)
        .await?;
        Ok(new_default)
    }

    fn ban_digest(service: &str, uid: i64, gid: Option<i64>) -> u64 {
        let target = gid.map(|g| g.to_string()).unwrap_or_else(|| "all".to_string());
        let key = format!("[{service}]{uid}_{target}");
        let digest = Md5::digest(key.as_bytes());
        u64::from_le_bytes(digest[..8].try_into().unwrap())
    }

    pub async fn ban(&self, service: &str, uid: i64, gid: Option<i64>) -> Result<()> {
        let id = Self::ban_digest(service, uid, gid);
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO \"{service}_ban\" (id, uid, gid) VALUES (?, ?, ?)"
        ))
        .bind(id as i64)
        .bind(uid)
        .bind(gid.unwrap_or(-1))
        .execute(&self.pool)
        .await?;
        self.ban_cache.write().await.insert(id);
        Ok(())
    }

    pub async fn permit(&self, service: &str, uid: i64, gid: Option<i64>) -> Result<()> {
        let id = Self::ban_digest(service, uid, gid);
        sqlx::query(&format!("DELETE FROM \"{service}_ban\" WHERE id = ?"))
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        self.ban_cache.write().await.remove(&id);
        Ok(())
    }

    /// Checks the group-specific ban before the `_all` global ban, per
    /// service, matching `IsBanned`.
    pub async fn is_banned(&self, service: &str, uid: i64, gid: i64) -> Result<bool> {
        let group_id = Self::ban_digest(service, uid, Some(gid));
        if self.ban_cache.read().await.contains(&group_id) {
            return Ok(true);
        }
        let all_id = Self::ban_digest(service, uid, None);
        if self.ban_cache.read().await.contains(&all_id) {
            return Ok(true);
        }

        let group_row = sqlx::query(&format!("SELECT 1 as hit FROM \"{service}_ban\" WHERE id = ?"))
            .bind(group_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        if group_row.is_some() {
            self.ban_cache.write().await.insert(group_id);
            return Ok(true);
        }

        let all_row = sqlx::query(&format!("SELECT 1 as hit FROM \"{service}_ban\" WHERE id = ?"))
            .bind(all_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        if all_row.is_some() {
            self.ban_cache.write().await.insert(all_id);
            return Ok(true);
        }

        Ok(false)
    }

    /// `extra == "-"` means explicit silence; a missing row means silent
    /// by default; `gid = 0` is checked first as a global override.
    /// Matches `CanResponse`.
    pub async fn can_response(&self, gid: i64) -> Result<bool> {
        let global = self.response_extra(GID_ALL).await?;
        if let Some(extra) = global {
            return Ok(extra != "-");
        }
        match self.response_extra(gid).await? {
            Some(extra) => Ok(extra != "-"),
            None => Ok(false),
        }
    }

    async fn response_extra(&self, gid: i64) -> Result<Option<String>> {
        if let Some(extra) = self.response_cache.read().await.get(&gid).cloned() {
            return Ok(Some(extra));
        }
        let row = sqlx::query("SELECT extra FROM __resp WHERE gid = ?")
            .bind(gid)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let extra: String = row.get("extra");
                self.response_cache.write().await.insert(gid, extra.clone());
                Ok(Some(extra))
            }
            None => Ok(None),
        }
    }

    pub async fn response(&self, gid: i64, extra: impl Into<String>) -> Result<()> {
        let extra = extra.into();
        sqlx::query(
            "INSERT INTO __resp (gid, extra) VALUES (?, ?)
             ON CONFLICT(gid) DO UPDATE SET extra = excluded.extra",
        )
        .bind(gid)
        .bind(&extra)
        .execute(&self.pool)
        .await?;
        self.response_cache.write().await.insert(gid, extra);
        Ok(())
    }

    pub async fn silence(&self, gid: i64) -> Result<()> {
        self.response(gid, "-").await
    }

    pub async fn is_blocked(&self, uid: i64) -> Result<bool> {
        if self.block_cache.read().await.contains(&uid) {
            return Ok(true);
        }
        let row = sqlx::query("SELECT 1 as hit FROM __block WHERE uid = ?")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        if row.is_some() {
            self.block_cache.write().await.insert(uid);
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn do_block(&self, uid: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO __block (uid) VALUES (?)")
            .bind(uid)
            .execute(&self.pool)
            .await?;
        self.block_cache.write().await.insert(uid);
        Ok(())
    }

    pub async fn do_unblock(&self, uid: i64) -> Result<()> {
        sqlx::query("DELETE FROM __block WHERE uid = ?")
            .bind(uid)
            .execute(&self.pool)
            .await?;
        self.block_cache.write().await.remove(&uid);
        Ok(())
    }
}

fn unpack_default_disable(word: i64) -> bool {
    ((word as u64) & (1u64 << 63)) != 0
}

fn pack_default_disable(word: u64, flip: bool) -> u64 {
    if flip {
        word | (1u64 << 63)
    } else {
        word & !(1u64 << 63)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> ControlManager {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let manager = ControlManager::new(pool).await.unwrap();
        manager.register_service("echo", false).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn is_enabled_defaults_to_service_default() {
        let manager = setup().await;
        assert!(manager.is_enabled("echo", 100).await.unwrap());
    }

    #[tokio::test]
    async fn disable_gid_zero_disables_every_group() {
        let manager = setup().await;
        manager.enable("echo", 42).await.unwrap();
        assert!(manager.is_enabled("echo", 42).await.unwrap());
        manager.disable("echo", 0).await.unwrap();
        assert!(!manager.is_enabled("echo", 42).await.unwrap());
        assert!(!manager.is_enabled("echo", 999).await.unwrap());
    }

    #[tokio::test]
    async fn disable_then_reset_reverts_to_default() {
        let manager = setup().await;
        manager.disable("echo", 100).await.unwrap();
        assert!(!manager.is_enabled("echo", 100).await.unwrap());
        manager.reset("echo", 100).await.unwrap();
        assert!(manager.is_enabled("echo", 100).await.unwrap());
    }

    #[tokio::test]
    async fn reset_rejects_gid_zero() {
        let manager = setup().await;
        let err = manager.reset("echo", 0).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Control(ControlError::ReservedGroup)));
    }

    #[tokio::test]
    async fn set_data_get_data_round_trip_preserves_enable_bit() {
        let manager = setup().await;
        manager.disable("echo", 5).await.unwrap();
        manager.set_data("echo", 5, 0x3fff).await.unwrap();
        assert_eq!(manager.get_data("echo", 5).await.unwrap(), 0x3fff);
        assert!(!manager.is_enabled("echo", 5).await.unwrap());
    }

    #[tokio::test]
    async fn ban_and_permit_round_trip() {
        let manager = setup().await;
        assert!(!manager.is_banned("echo", 7, 1).await.unwrap());
        manager.ban("echo", 7, Some(1)).await.unwrap();
        assert!(manager.is_banned("echo", 7, 1).await.unwrap());
        manager.permit("echo", 7, Some(1)).await.unwrap();
        assert!(!manager.is_banned("echo", 7, 1).await.unwrap());
    }

    #[tokio::test]
    async fn global_ban_covers_all_groups() {
        let manager = setup().await;
        manager.ban("echo", 9, None).await.unwrap();
        assert!(manager.is_banned("echo", 9, 42).await.unwrap());
    }

    #[tokio::test]
    async fn response_and_silence_toggle_can_response() {
        let manager = setup().await;
        assert!(!manager.can_response(55).await.unwrap());
        manager.response(55, "{}").await.unwrap();
        assert!(manager.can_response(55).await.unwrap());
        manager.silence(55).await.unwrap();
        assert!(!manager.can_response(55).await.unwrap());
    }

    #[tokio::test]
    async fn ban_digest_is_stable_across_manager_instances() {
        let a = ControlManager::ban_digest("echo", 1, Some(2));
        let b = ControlManager::ban_digest("echo", 1, Some(2));
        assert_eq!(a, b);
    }
}
