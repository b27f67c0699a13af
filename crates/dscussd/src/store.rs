//! Persistent store over `rusqlite`, implementing the relational schema for
//! users, messages, tags, and operations.
//!
//! A single `rusqlite::Connection` is held behind a `tokio::sync::Mutex` —
//! writes are serialized the same way a single exclusively-locked SQLite
//! connection serializes them on disk. Message writes put the Message row
//! then each tag and junction row in one transaction; tag insertion is
//! conflict-ignore on `Tag.name` so re-posting a topic is idempotent.

use dscuss_core::crypto::{Hash, PublicKey, Signature};
use dscuss_core::entity::{Message, User};
use dscuss_core::topic::Topic;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("entity error: {0}")]
    Entity(String),

    #[error("store already exists at {0}")]
    AlreadyExists(String),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS User (
    id          BLOB PRIMARY KEY,
    pubkey      BLOB NOT NULL,
    proof       INTEGER NOT NULL,
    nickname    TEXT NOT NULL,
    info        TEXT NOT NULL,
    timestamp   INTEGER NOT NULL,
    signature   BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS Message (
    id          BLOB PRIMARY KEY,
    subject     TEXT NOT NULL,
    content     TEXT NOT NULL,
    timestamp   INTEGER NOT NULL,
    author_id   BLOB NOT NULL REFERENCES User(id),
    parent_id   BLOB NOT NULL,
    signature   BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS message_parent_ts ON Message(parent_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS message_ts ON Message(timestamp DESC);
CREATE TABLE IF NOT EXISTS Tag (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS Message_Tag (
    tag_id      INTEGER NOT NULL REFERENCES Tag(id),
    message_id  BLOB NOT NULL REFERENCES Message(id),
    UNIQUE(tag_id, message_id)
);
CREATE TABLE IF NOT EXISTS Operation (
    id          BLOB PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS Operation_on_User (
    operation_id BLOB NOT NULL REFERENCES Operation(id),
    user_id      BLOB NOT NULL REFERENCES User(id)
);
CREATE TABLE IF NOT EXISTS Operation_on_Message (
    operation_id BLOB NOT NULL REFERENCES Operation(id),
    message_id   BLOB NOT NULL REFERENCES Message(id)
);
";

/// The local relational store for one logged-in identity.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if absent) the store at `path`, applying the same
    /// pragmas as the reference implementation's `db.c`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "synchronous", "OFF")?;
        conn.pragma_update(None, "locking_mode", "EXCLUSIVE")?;
        conn.pragma_update(None, "page_size", 4096)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a fresh store, rejecting an already-populated database file.
    pub fn create_new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(StoreError::AlreadyExists(path.display().to_string()));
        }
        Self::open(path)
    }

    pub async fn put_user(&self, user: &User) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO User (id, pubkey, proof, nickname, info, timestamp, signature)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user.id().as_bytes().to_vec(),
                user.public_key.to_der(),
                user.proof as i64,
                user.nickname,
                user.info,
                user.timestamp,
                user.signature.as_bytes().to_vec(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_user(&self, id: &Hash) -> Result<Option<User>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT pubkey, proof, nickname, info, timestamp, signature FROM User WHERE id = ?1",
            params![id.as_bytes().to_vec()],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Vec<u8>>(5)?,
                ))
            },
        )
        .optional()?
        .map(|(pubkey, proof, nickname, info, timestamp, sig)| {
            row_to_user(pubkey, proof, nickname, info, timestamp, sig)
        })
        .transpose()
    }

    pub async fn has_entity(&self, id: &Hash) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let key = id.as_bytes().to_vec();
        let in_users: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM User WHERE id = ?1)",
            params![key],
            |row| row.get(0),
        )?;
        if in_users {
            return Ok(true);
        }
        let in_messages: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM Message WHERE id = ?1)",
            params![id.as_bytes().to_vec()],
            |row| row.get(0),
        )?;
        Ok(in_messages)
    }

    /// Put the Message row then each tag and junction row, all in one
    /// transaction. `parent_id` is written verbatim — never zeroed.
    pub async fn put_message(&self, msg: &Message) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let id = msg.id();
        tx.execute(
            "INSERT OR REPLACE INTO Message (id, subject, content, timestamp, author_id, parent_id, signature)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.as_bytes().to_vec(),
                msg.subject,
                msg.content,
                msg.timestamp,
                msg.author_id.as_bytes().to_vec(),
                msg.parent_id.as_bytes().to_vec(),
                msg.signature.as_bytes().to_vec(),
            ],
        )?;
        for tag in msg.topic.tags() {
            tx.execute(
                "INSERT OR IGNORE INTO Tag (name) VALUES (?1)",
                params![tag],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO Message_Tag (tag_id, message_id)
                 SELECT id, ?2 FROM Tag WHERE name = ?1",
                params![tag, id.as_bytes().to_vec()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn get_message(&self, id: &Hash) -> Result<Option<Message>, StoreError> {
        let conn = self.conn.lock().await;
        let key = id.as_bytes().to_vec();
        let row = conn
            .query_row(
                "SELECT subject, content, timestamp, author_id, parent_id, signature
                 FROM Message WHERE id = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                        row.get::<_, Vec<u8>>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((subject, content, timestamp, author_id, parent_id, sig)) = row else {
            return Ok(None);
        };
        let tags = tags_for_message(&conn, id)?;
        drop(conn);
        row_to_message(subject, content, timestamp, author_id, parent_id, sig, tags).map(Some)
    }

    /// Thread roots (`parent_id` all zero) ordered newest-first.
    pub async fn root_messages(&self) -> Result<Vec<Message>, StoreError> {
        self.messages_where(
            "parent_id = ?1 ORDER BY timestamp DESC",
            Hash::ZERO.as_bytes().to_vec(),
        )
        .await
    }

    /// Replies to `parent_id`, ordered newest-first.
    pub async fn replies(&self, parent_id: &Hash) -> Result<Vec<Message>, StoreError> {
        self.messages_where(
            "parent_id = ?1 ORDER BY timestamp DESC",
            parent_id.as_bytes().to_vec(),
        )
        .await
    }

    /// Every stored message, newest-first.
    pub async fn recent_messages(&self) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, subject, content, timestamp, author_id, parent_id, signature
             FROM Message ORDER BY timestamp DESC",
        )?;
        let ids_and_rows: Vec<(Vec<u8>, String, String, i64, Vec<u8>, Vec<u8>, Vec<u8>)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        let mut out = Vec::with_capacity(ids_and_rows.len());
        for (id, subject, content, timestamp, author_id, parent_id, sig) in ids_and_rows {
            let id_hash = Hash(id.clone().try_into().map_err(|_| {
                StoreError::Entity("stored message id is not 64 bytes".into())
            })?);
            let tags = tags_for_message(&conn, &id_hash)?;
            out.push(row_to_message(subject, content, timestamp, author_id, parent_id, sig, tags)?);
        }
        Ok(out)
    }

    async fn messages_where(&self, clause: &str, key: Vec<u8>) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT id, subject, content, timestamp, author_id, parent_id, signature FROM Message WHERE {clause}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<(Vec<u8>, String, String, i64, Vec<u8>, Vec<u8>, Vec<u8>)> = stmt
            .query_map(params![key], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        let mut out = Vec::with_capacity(rows.len());
        for (id, subject, content, timestamp, author_id, parent_id, sig) in rows {
            let id_hash = Hash(id.try_into().map_err(|_| {
                StoreError::Entity("stored message id is not 64 bytes".into())
            })?);
            let tags = tags_for_message(&conn, &id_hash)?;
            out.push(row_to_message(subject, content, timestamp, author_id, parent_id, sig, tags)?);
        }
        Ok(out)
    }
}

fn tags_for_message(conn: &Connection, id: &Hash) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT Tag.name FROM Tag
         JOIN Message_Tag ON Message_Tag.tag_id = Tag.id
         WHERE Message_Tag.message_id = ?1",
    )?;
    let tags = stmt
        .query_map(params![id.as_bytes().to_vec()], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tags)
}

fn row_to_user(
    pubkey: Vec<u8>,
    proof: i64,
    nickname: String,
    info: String,
    timestamp: i64,
    sig: Vec<u8>,
) -> Result<User, StoreError> {
    let public_key = PublicKey::from_der(&pubkey).map_err(|e| StoreError::Entity(e.to_string()))?;
    let signature = Signature::from_parts(&sig).map_err(|e| StoreError::Entity(e.to_string()))?;
    Ok(User {
        public_key,
        proof: proof as u64,
        nickname,
        info,
        timestamp,
        signature,
    })
}

fn row_to_message(
    subject: String,
    content: String,
    timestamp: i64,
    author_id: Vec<u8>,
    parent_id: Vec<u8>,
    sig: Vec<u8>,
    tags: Vec<String>,
) -> Result<Message, StoreError> {
    let author_id = Hash(author_id.try_into().map_err(|_| {
        StoreError::Entity("stored author_id is not 64 bytes".into())
    })?);
    let parent_id = Hash(parent_id.try_into().map_err(|_| {
        StoreError::Entity("stored parent_id is not 64 bytes".into())
    })?);
    let signature = Signature::from_parts(&sig).map_err(|e| StoreError::Entity(e.to_string()))?;
    let topic = if tags.is_empty() {
        return Err(StoreError::Entity("message has no tags".into()));
    } else {
        Topic::new(tags).map_err(|e| StoreError::Entity(e.to_string()))?
    };
    Ok(Message {
        topic,
        subject,
        content,
        timestamp,
        author_id,
        parent_id,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dscuss_core::crypto::Keypair;

    fn signed_user(nickname: &str) -> User {
        let kp = Keypair::generate();
        User::emerge(&kp, 0, nickname.into(), "bio".into(), 1_700_000_000).unwrap()
    }

    #[tokio::test]
    async fn put_then_get_user_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        let user = signed_user("alice");
        store.put_user(&user).await.unwrap();
        let back = store.get_user(&user.id()).await.unwrap().unwrap();
        assert_eq!(back.nickname, "alice");
        assert_eq!(back.id(), user.id());
    }

    #[tokio::test]
    async fn create_new_rejects_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        Store::create_new(&path).unwrap();
        assert!(Store::create_new(&path).is_err());
    }

    #[tokio::test]
    async fn message_write_preserves_nonzero_parent_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        let kp = Keypair::generate();
        let author = signed_user("bob");
        store.put_user(&author).await.unwrap();

        let root = Message::new_thread(
            &kp,
            author.id(),
            Topic::parse("chat").unwrap(),
            "root".into(),
            "hello".into(),
            1,
        );
        store.put_message(&root).await.unwrap();

        let reply = Message::new_reply(
            &kp,
            author.id(),
            root.id(),
            Topic::parse("chat").unwrap(),
            "re: root".into(),
            "hi back".into(),
            2,
        );
        store.put_message(&reply).await.unwrap();

        let stored = store.get_message(&reply.id()).await.unwrap().unwrap();
        assert_eq!(stored.parent_id, root.id());
        assert_ne!(stored.parent_id, Hash::ZERO);
    }

    #[tokio::test]
    async fn root_messages_excludes_replies() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        let kp = Keypair::generate();
        let author = signed_user("carol");
        store.put_user(&author).await.unwrap();

        let root = Message::new_thread(
            &kp,
            author.id(),
            Topic::parse("chat").unwrap(),
            "root".into(),
            "hello".into(),
            1,
        );
        store.put_message(&root).await.unwrap();
        let reply = Message::new_reply(
            &kp,
            author.id(),
            root.id(),
            Topic::parse("chat").unwrap(),
            "re".into(),
            "hi".into(),
            2,
        );
        store.put_message(&reply).await.unwrap();

        let roots = store.root_messages().await.unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].id(), root.id());

        let replies = store.replies(&root.id()).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id(), reply.id());
    }

    #[tokio::test]
    async fn has_entity_checks_both_tables() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        let user = signed_user("dave");
        assert!(!store.has_entity(&user.id()).await.unwrap());
        store.put_user(&user).await.unwrap();
        assert!(store.has_entity(&user.id()).await.unwrap());
    }
}
