//! Session persistence.
//!
//! One document per (user, tax year). Writes are guarded by the session's
//! `revision`: a save only lands when the stored revision still matches the
//! one the caller loaded.

use async_trait::async_trait;
use chrono::Utc;
use mongodb::bson::{self, doc, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Collection, IndexModel};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::schema::TaxSession;

pub const SESSIONS_COLLECTION: &str = "sessions";

const DUPLICATE_KEY: i32 = 11000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found")]
    NotFound,

    #[error("Session {0} was modified concurrently")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<bson::ser::Error> for StoreError {
    fn from(err: bson::ser::Error) -> Self {
        StoreError::Database(format!("encode session: {}", err))
    }
}

impl From<bson::de::Error> for StoreError {
    fn from(err: bson::de::Error) -> Self {
        StoreError::Database(format!("decode session: {}", err))
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Session for a user and tax year, if one exists.
    async fn find(&self, user_id: &str, tax_year: i32) -> Result<Option<TaxSession>, StoreError>;

    async fn get(&self, id: &str) -> Result<TaxSession, StoreError>;

    /// Insert a new session. Fails with `Conflict` when the user already has
    /// one for that year.
    async fn insert(&self, session: &TaxSession) -> Result<(), StoreError>;

    /// Replace a session. Returns the stored copy with its revision bumped.
    async fn save(&self, session: &TaxSession) -> Result<TaxSession, StoreError>;

    /// All of a user's sessions, newest tax year first.
    async fn list(&self, user_id: &str) -> Result<Vec<TaxSession>, StoreError>;
}

fn next_revision(session: &TaxSession) -> TaxSession {
    let mut next = session.clone();
    next.revision = session.revision + 1;
    next.updated_at = Utc::now();
    next
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, TaxSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn find(&self, user_id: &str, tax_year: i32) -> Result<Option<TaxSession>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .find(|s| s.user_id == user_id && s.tax_year == tax_year)
            .cloned())
    }

    async fn get(&self, id: &str) -> Result<TaxSession, StoreError> {
        let sessions = self.sessions.read().await;
        sessions.get(id).cloned().ok_or(StoreError::NotFound)
    }

    async fn insert(&self, session: &TaxSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let taken = sessions.contains_key(&session.id)
            || sessions
                .values()
                .any(|s| s.user_id == session.user_id && s.tax_year == session.tax_year);
        if taken {
            return Err(StoreError::Conflict(session.id.clone()));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn save(&self, session: &TaxSession) -> Result<TaxSession, StoreError> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions.get_mut(&session.id).ok_or(StoreError::NotFound)?;
        if stored.revision != session.revision {
            return Err(StoreError::Conflict(session.id.clone()));
        }
        *stored = next_revision(session);
        Ok(stored.clone())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<TaxSession>, StoreError> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<TaxSession> = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.tax_year.cmp(&a.tax_year));
        Ok(out)
    }
}

// ============================================================================
// MongoDB store
// ============================================================================

/// Sessions stored as whole documents in the `sessions` collection, keyed by
/// the session id as `_id`.
#[derive(Clone)]
pub struct MongoSessionStore {
    collection: Collection<Document>,
}

impl MongoSessionStore {
    /// Connect and make sure the (user_id, tax_year) unique index exists.
    pub async fn connect(uri: &str, database: &str) -> Result<Self, StoreError> {
        let client = mongodb::Client::with_uri_str(uri).await?;
        let collection = client
            .database(database)
            .collection::<Document>(SESSIONS_COLLECTION);

        let index = IndexModel::builder()
            .keys(doc! { "user_id": 1, "tax_year": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        collection.create_index(index).await?;

        info!("Connected to MongoDB database {}", database);
        Ok(Self { collection })
    }
}

fn to_record(session: &TaxSession) -> Result<Document, StoreError> {
    let mut record = bson::to_document(session)?;
    record.remove("id");
    record.insert("_id", session.id.clone());
    Ok(record)
}

fn from_record(mut record: Document) -> Result<TaxSession, StoreError> {
    if let Some(id) = record.remove("_id") {
        record.insert("id", id);
    }
    Ok(bson::from_document(record)?)
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY
    )
}

#[async_trait]
impl SessionStore for MongoSessionStore {
    async fn find(&self, user_id: &str, tax_year: i32) -> Result<Option<TaxSession>, StoreError> {
        let record = self
            .collection
            .find_one(doc! { "user_id": user_id, "tax_year": tax_year })
            .await?;
        record.map(from_record).transpose()
    }

    async fn get(&self, id: &str) -> Result<TaxSession, StoreError> {
        let record = self.collection.find_one(doc! { "_id": id }).await?;
        record.map(from_record).transpose()?.ok_or(StoreError::NotFound)
    }

    async fn insert(&self, session: &TaxSession) -> Result<(), StoreError> {
        let record = to_record(session)?;
        match self.collection.insert_one(record).await {
            Ok(_) => {
                debug!("Inserted session {}", session.id);
                Ok(())
            }
            Err(e) if is_duplicate_key(&e) => Err(StoreError::Conflict(session.id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, session: &TaxSession) -> Result<TaxSession, StoreError> {
        let next = next_revision(session);
        let record = to_record(&next)?;

        let result = self
            .collection
            .replace_one(doc! { "_id": session.id.as_str(), "revision": session.revision }, record)
            .await?;

        if result.matched_count == 0 {
            let exists = self
                .collection
                .find_one(doc! { "_id": session.id.as_str() })
                .await?
                .is_some();
            return Err(if exists {
                StoreError::Conflict(session.id.clone())
            } else {
                StoreError::NotFound
            });
        }

        debug!("Saved session {} at revision {}", next.id, next.revision);
        Ok(next)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<TaxSession>, StoreError> {
        let mut cursor = self
            .collection
            .find(doc! { "user_id": user_id })
            .sort(doc! { "tax_year": -1 })
            .await?;

        let mut sessions = Vec::new();
        while cursor.advance().await? {
            sessions.push(from_record(cursor.deserialize_current()?)?);
        }
        Ok(sessions)
    }
}
