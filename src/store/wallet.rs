//! Mirror wallet persistence: balances, the append-only ledger, and the
//! sentinel withdrawal rows that mark reconciler corrections.

use std::collections::HashMap;

use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use super::models::{
    round2, TransactionType, Wallet, WalletTransaction, WithdrawalRow, EXTERNAL_SYNC_HOLDER,
    EXTERNAL_SYNC_MARKER,
};
use super::{repeat_vars, Store, StoreError};

fn row_to_wallet(row: &Row) -> rusqlite::Result<Wallet> {
    Ok(Wallet {
        id: row.get(0)?,
        user_id: row.get(1)?,
        merchant_id: row.get(2)?,
        current_balance: row.get(3)?,
    })
}

impl Store {
    pub fn create_wallet(
        &self,
        user_id: &str,
        merchant_id: &str,
        balance: f64,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO merchant_wallets (user_id, merchant_id, current_balance)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, merchant_id) DO UPDATE SET
                current_balance = excluded.current_balance",
            params![user_id, merchant_id, balance],
        )?;
        let id = conn.query_row(
            "SELECT id FROM merchant_wallets WHERE user_id = ?1 AND merchant_id = ?2",
            params![user_id, merchant_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// The wallet corrections land on. Users holding wallets at several
    /// merchants get the one with the highest balance.
    pub fn wallet_for_user(&self, user_id: &str) -> Result<Option<Wallet>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let wallet = conn
            .query_row(
                "SELECT id, user_id, merchant_id, current_balance FROM merchant_wallets
                 WHERE user_id = ?1
                 ORDER BY current_balance DESC
                 LIMIT 1",
                params![user_id],
                row_to_wallet,
            )
            .optional()?;
        Ok(wallet)
    }

    /// Batch form of `wallet_for_user`. Rows arrive balance-ascending so the
    /// last insert per user is the highest-balance wallet.
    pub fn wallets_for_users(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, Wallet>, StoreError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT id, user_id, merchant_id, current_balance FROM merchant_wallets
             WHERE user_id IN ({})
             ORDER BY current_balance ASC",
            repeat_vars(user_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut map = HashMap::new();
        let rows = stmt.query_map(params_from_iter(user_ids.iter()), row_to_wallet)?;
        for wallet in rows {
            let wallet = wallet?;
            map.insert(wallet.user_id.clone(), wallet);
        }
        Ok(map)
    }

    /// Apply an external-spend correction in one transaction: move the
    /// balance, append the ledger entry, and record the sentinel withdrawal
    /// that keeps the operation visible in payout reports.
    ///
    /// `adjustment` is negative. Returns the new balance.
    pub fn apply_external_deduction(
        &self,
        wallet: &Wallet,
        adjustment: f64,
        now: i64,
    ) -> Result<f64, StoreError> {
        let new_balance = round2(wallet.current_balance + adjustment);
        let description = format!(
            "Auto-sync: {:.2} pts spent externally (AutoGCM app)",
            adjustment.abs()
        );

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE merchant_wallets SET current_balance = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_balance, now, wallet.id],
        )?;
        tx.execute(
            "INSERT INTO wallet_transactions
                (user_id, merchant_id, amount, balance_after, transaction_type,
                 description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                wallet.user_id,
                wallet.merchant_id,
                adjustment,
                new_balance,
                TransactionType::ExternalSpend.as_str(),
                description,
                now,
            ],
        )?;
        tx.execute(
            "INSERT INTO withdrawals
                (user_id, amount, status, bank_name, account_number,
                 account_holder_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                wallet.user_id,
                adjustment.abs(),
                EXTERNAL_SYNC_MARKER,
                "AutoGCM App",
                EXTERNAL_SYNC_MARKER,
                EXTERNAL_SYNC_HOLDER,
                now,
            ],
        )?;
        tx.commit()?;
        Ok(new_balance)
    }

    /// Net external movement already accounted for in the ledger. Feeds the
    /// mirror balance so repeated reconciles never double-deduct.
    pub fn sum_external_ledger(&self, user_id: &str) -> Result<f64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let sum = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM wallet_transactions
             WHERE user_id = ?1 AND transaction_type IN ('EXTERNAL_SPEND', 'EXTERNAL_SYNC')",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    pub fn sum_external_ledgers(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, f64>, StoreError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT user_id, COALESCE(SUM(amount), 0) FROM wallet_transactions
             WHERE transaction_type IN ('EXTERNAL_SPEND', 'EXTERNAL_SYNC')
               AND user_id IN ({})
             GROUP BY user_id",
            repeat_vars(user_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut map = HashMap::new();
        let rows = stmt.query_map(params_from_iter(user_ids.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        for row in rows {
            let (user_id, sum) = row?;
            map.insert(user_id, sum);
        }
        Ok(map)
    }

    pub fn ledger_for_user(&self, user_id: &str) -> Result<Vec<WalletTransaction>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, merchant_id, amount, balance_after, transaction_type,
                    description, created_at
             FROM wallet_transactions
             WHERE user_id = ?1
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(WalletTransaction {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    merchant_id: row.get(2)?,
                    amount: row.get(3)?,
                    balance_after: row.get(4)?,
                    transaction_type: row.get(5)?,
                    description: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn withdrawals_for_user(&self, user_id: &str) -> Result<Vec<WithdrawalRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, amount, status, bank_name, account_number,
                    account_holder_name, created_at
             FROM withdrawals
             WHERE user_id = ?1
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(WithdrawalRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    amount: row.get(2)?,
                    status: row.get(3)?,
                    bank_name: row.get(4)?,
                    account_number: row.get(5)?,
                    account_holder_name: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deduction_moves_balance_and_logs_both_rows() {
        let store = Store::open_in_memory().unwrap();
        store.create_wallet("u-1", "m-1", 150.0).unwrap();
        let wallet = store.wallet_for_user("u-1").unwrap().unwrap();

        let new_balance = store.apply_external_deduction(&wallet, -50.0, 1_000).unwrap();
        assert_eq!(new_balance, 100.0);

        let refreshed = store.wallet_for_user("u-1").unwrap().unwrap();
        assert_eq!(refreshed.current_balance, 100.0);

        let ledger = store.ledger_for_user("u-1").unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].amount, -50.0);
        assert_eq!(ledger[0].balance_after, 100.0);
        assert_eq!(ledger[0].transaction_type, "EXTERNAL_SPEND");

        let withdrawals = store.withdrawals_for_user("u-1").unwrap();
        assert_eq!(withdrawals.len(), 1);
        assert_eq!(withdrawals[0].amount, 50.0);
        assert_eq!(withdrawals[0].status, EXTERNAL_SYNC_MARKER);
        assert_eq!(withdrawals[0].account_number, EXTERNAL_SYNC_MARKER);
    }

    #[test]
    fn external_sum_ignores_other_ledger_kinds() {
        let store = Store::open_in_memory().unwrap();
        store.create_wallet("u-1", "m-1", 100.0).unwrap();
        let wallet = store.wallet_for_user("u-1").unwrap().unwrap();
        store.apply_external_deduction(&wallet, -30.0, 1_000).unwrap();

        // A manual top-up must not count as external spending
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO wallet_transactions
                    (user_id, merchant_id, amount, balance_after, transaction_type, created_at)
                 VALUES ('u-1', 'm-1', 25.0, 95.0, 'MANUAL_ADJUSTMENT', 2000)",
                [],
            )
            .unwrap();
        }

        assert_eq!(store.sum_external_ledger("u-1").unwrap(), -30.0);
    }

    #[test]
    fn highest_balance_wallet_wins() {
        let store = Store::open_in_memory().unwrap();
        store.create_wallet("u-1", "m-1", 10.0).unwrap();
        store.create_wallet("u-1", "m-2", 80.0).unwrap();
        store.create_wallet("u-2", "m-1", 5.0).unwrap();

        let wallet = store.wallet_for_user("u-1").unwrap().unwrap();
        assert_eq!(wallet.merchant_id, "m-2");

        let map = store
            .wallets_for_users(&["u-1".to_string(), "u-2".to_string()])
            .unwrap();
        assert_eq!(map.get("u-1").unwrap().merchant_id, "m-2");
        assert_eq!(map.get("u-2").unwrap().current_balance, 5.0);
    }
}
