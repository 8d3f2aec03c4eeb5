//! User queries: harvest queue ordering and optimistic sync claims.

use rusqlite::{params, OptionalExtension, Row};

use super::models::User;
use super::{Store, StoreError};

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        vendor_user_no: row.get(1)?,
        phone: row.get(2)?,
        nickname: row.get(3)?,
        last_synced_at: row.get(4)?,
    })
}

const USER_COLS: &str = "id, vendor_user_no, phone, nickname, last_synced_at";

impl Store {
    pub fn upsert_user(&self, user: &User) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (id, vendor_user_no, phone, nickname, last_synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                vendor_user_no = excluded.vendor_user_no,
                phone = excluded.phone,
                nickname = excluded.nickname",
            params![
                user.id,
                user.vendor_user_no,
                user.phone,
                user.nickname,
                user.last_synced_at,
            ],
        )?;
        Ok(())
    }

    pub fn user_by_vendor_no(&self, vendor_user_no: &str) -> Result<Option<User>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE vendor_user_no = ?1", USER_COLS),
                params![vendor_user_no],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn user_by_phone(&self, phone: &str) -> Result<Option<User>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE phone = ?1", USER_COLS),
                params![phone],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    /// How many users are still waiting for a harvest (never synced, or
    /// synced before `cutoff`).
    pub fn count_stale_users(&self, cutoff: i64) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM users
             WHERE last_synced_at IS NULL OR last_synced_at < ?1",
            params![cutoff],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Next slice of the harvest queue, oldest sync first. Users that have
    /// never synced come before everyone else.
    pub fn stale_users(&self, cutoff: i64, limit: u32) -> Result<Vec<User>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM users
             WHERE last_synced_at IS NULL OR last_synced_at < ?1
             ORDER BY last_synced_at ASC NULLS FIRST
             LIMIT ?2",
            USER_COLS
        ))?;
        let users = stmt
            .query_map(params![cutoff, limit], row_to_user)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// Claim a user for harvesting by stamping `last_synced_at` up front.
    /// A concurrent run selecting the queue will skip them even if this
    /// run's fetch is still in flight.
    pub fn claim_user_sync(&self, user_id: &str, now: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET last_synced_at = ?1 WHERE id = ?2",
            params![now, user_id],
        )?;
        Ok(())
    }

    /// Every user, for fleet-wide balance audits.
    pub fn all_users(&self) -> Result<Vec<User>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM users ORDER BY id", USER_COLS))?;
        let users = stmt
            .query_map([], row_to_user)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, phone: &str, last_synced_at: Option<i64>) -> User {
        User {
            id: id.to_string(),
            vendor_user_no: Some(format!("no-{}", id)),
            phone: phone.to_string(),
            nickname: None,
            last_synced_at,
        }
    }

    #[test]
    fn queue_orders_never_synced_first() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_user(&user("a", "0101", Some(5_000))).unwrap();
        store.upsert_user(&user("b", "0102", None)).unwrap();
        store.upsert_user(&user("c", "0103", Some(1_000))).unwrap();
        store.upsert_user(&user("d", "0104", Some(99_000))).unwrap();

        let queue = store.stale_users(10_000, 10).unwrap();
        let ids: Vec<&str> = queue.iter().map(|u| u.id.as_str()).collect();
        // d synced after the cutoff, so it stays off the queue
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert_eq!(store.count_stale_users(10_000).unwrap(), 3);
    }

    #[test]
    fn claim_removes_user_from_queue() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_user(&user("a", "0101", None)).unwrap();

        assert_eq!(store.count_stale_users(10_000).unwrap(), 1);
        store.claim_user_sync("a", 50_000).unwrap();
        assert_eq!(store.count_stale_users(10_000).unwrap(), 0);
        assert!(store.stale_users(10_000, 10).unwrap().is_empty());
    }

    #[test]
    fn upsert_keeps_claim_timestamp() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_user(&user("a", "0101", None)).unwrap();
        store.claim_user_sync("a", 42).unwrap();

        // Re-registering the same user must not reset queue position
        store.upsert_user(&user("a", "0105", None)).unwrap();
        let found = store.user_by_vendor_no("no-a").unwrap().unwrap();
        assert_eq!(found.phone, "0105");
        assert_eq!(found.last_synced_at, Some(42));
    }
}
