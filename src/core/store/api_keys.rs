use rusqlite::params;
use sha2::{Digest, Sha256};

use super::DocumentStore;
use super::types::ApiKeyRecord;
use crate::core::error::StoryResult;

pub const API_KEY_PREFIX: &str = "sfk_";

fn hash_key(raw_key: &str) -> String {
    hex::encode(Sha256::digest(raw_key.as_bytes()))
}

fn generate_raw_key() -> String {
    let bytes: [u8; 16] = rand::random();
    format!("{}{}", API_KEY_PREFIX, hex::encode(bytes))
}

impl DocumentStore {
    /// Mint a key. The raw value is returned once and only its hash is kept.
    pub async fn create_api_key(&self, name: &str) -> StoryResult<(String, ApiKeyRecord)> {
        let raw_key = generate_raw_key();
        let id = uuid::Uuid::new_v4().to_string();

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO api_keys (id, name, key_hash) VALUES (?1, ?2, ?3)",
            params![id, name, hash_key(&raw_key)],
        )?;
        let created_at: String = db.query_row(
            "SELECT created_at FROM api_keys WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;

        Ok((
            raw_key,
            ApiKeyRecord {
                id,
                name: name.to_string(),
                created_at,
            },
        ))
    }

    pub async fn list_api_keys(&self) -> StoryResult<Vec<ApiKeyRecord>> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT id, name, created_at FROM api_keys ORDER BY created_at DESC")?;
        let rows = stmt.query_map([], |row| {
            Ok(ApiKeyRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    pub async fn delete_api_key(&self, id: &str) -> StoryResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute("DELETE FROM api_keys WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub async fn validate_api_key(&self, raw_key: &str) -> StoryResult<bool> {
        if !raw_key.starts_with(API_KEY_PREFIX) {
            return Ok(false);
        }
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM api_keys WHERE key_hash = ?1",
            params![hash_key(raw_key)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
