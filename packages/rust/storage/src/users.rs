//! Per-user task policy: quotas and (question, version) permissions.

use libsql::params;
use scanmark_shared::{Permission, Result};
use tracing::info;

use crate::Storage;
use crate::rows::{db_err, int, next};

impl Storage {
    /// Set or clear a user's task cap.
    pub async fn set_quota(&self, user: &str, max_tasks: Option<u32>) -> Result<()> {
        let conn = self.lock_writes().await?;
        match max_tasks {
            Some(limit) => {
                conn.execute(
                    "INSERT INTO user_quotas (username, max_tasks) VALUES (?1, ?2)
                     ON CONFLICT(username) DO UPDATE SET max_tasks = excluded.max_tasks",
                    params![user, limit],
                )
                .await
                .map_err(db_err)?;
            }
            None => {
                conn.execute("DELETE FROM user_quotas WHERE username = ?1", params![user])
                    .await
                    .map_err(db_err)?;
            }
        }
        info!(user, quota = ?max_tasks, "quota set");
        Ok(())
    }

    pub async fn quota(&self, user: &str) -> Result<Option<u32>> {
        let mut rows = self
            .conn()
            .query(
                "SELECT max_tasks FROM user_quotas WHERE username = ?1",
                params![user],
            )
            .await
            .map_err(db_err)?;
        match next(&mut rows).await? {
            Some(row) => Ok(Some(int(&row, 0)?)),
            None => Ok(None),
        }
    }

    /// Replace a user's permission set. An empty set means unrestricted.
    pub async fn set_permissions(&self, user: &str, permissions: &[Permission]) -> Result<()> {
        let tx = self.begin_write().await?;
        tx.execute(
            "DELETE FROM user_permissions WHERE username = ?1",
            params![user],
        )
        .await
        .map_err(db_err)?;
        for permission in permissions {
            tx.execute(
                "INSERT OR IGNORE INTO user_permissions (username, question, version)
                 VALUES (?1, ?2, ?3)",
                params![user, permission.question, permission.version.unwrap_or(0)],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await?;
        info!(user, count = permissions.len(), "permissions set");
        Ok(())
    }

    pub async fn permissions(&self, user: &str) -> Result<Vec<Permission>> {
        let mut rows = self
            .conn()
            .query(
                "SELECT question, version FROM user_permissions
                 WHERE username = ?1 ORDER BY question, version",
                params![user],
            )
            .await
            .map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = next(&mut rows).await? {
            let version = int(&row, 1)?;
            out.push(Permission {
                question: int(&row, 0)?,
                version: (version != 0).then_some(version),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::test_storage;
    use scanmark_shared::Permission;

    #[tokio::test]
    async fn quotas_and_permissions() {
        let storage = test_storage().await;
        assert_eq!(storage.quota("ann").await.unwrap(), None);
        storage.set_quota("ann", Some(4)).await.unwrap();
        storage.set_quota("ann", Some(6)).await.unwrap();
        assert_eq!(storage.quota("ann").await.unwrap(), Some(6));
        storage.set_quota("ann", None).await.unwrap();
        assert_eq!(storage.quota("ann").await.unwrap(), None);

        let perms = [
            Permission { question: 2, version: None },
            Permission { question: 1, version: Some(2) },
        ];
        storage.set_permissions("ann", &perms).await.unwrap();
        let stored = storage.permissions("ann").await.unwrap();
        assert_eq!(stored, vec![perms[1], perms[0]]);

        storage.set_permissions("ann", &[]).await.unwrap();
        assert!(storage.permissions("ann").await.unwrap().is_empty());
    }
}
