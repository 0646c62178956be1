//! Session service: every read-modify-write of a tax session goes through
//! here so the refund estimate is recomputed and saves are revision-checked.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::refund::{self, RefundBreakdown, StateRateTable};
use crate::schema::{Dependent, DocumentKind, FilingStatus, TaxDocument, TaxSession};
use crate::store::{SessionStore, StoreError};

/// Attempts at a read-modify-write before a conflict is surfaced.
const MAX_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn SessionStore>,
    rates: Arc<StateRateTable>,
}

/// Result of adding a document.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub session: TaxSession,
    pub document: TaxDocument,
    /// True when identical content was already in the session.
    pub duplicate: bool,
}

impl SessionService {
    pub fn new(store: Arc<dyn SessionStore>, rates: Arc<StateRateTable>) -> Self {
        Self { store, rates }
    }

    /// Find the user's session for a year, creating it when absent.
    pub async fn open(&self, user_id: &str, tax_year: i32) -> Result<TaxSession, StoreError> {
        if let Some(session) = self.store.find(user_id, tax_year).await? {
            return Ok(session);
        }

        let session = TaxSession::new(user_id, tax_year);
        match self.store.insert(&session).await {
            Ok(()) => {
                info!("Created session {} for {} / {}", session.id, user_id, tax_year);
                Ok(session)
            }
            // Lost a creation race; the other request's session wins.
            Err(StoreError::Conflict(_)) => self
                .store
                .find(user_id, tax_year)
                .await?
                .ok_or(StoreError::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Existing session only.
    pub async fn get(&self, user_id: &str, tax_year: i32) -> Result<TaxSession, StoreError> {
        self.store
            .find(user_id, tax_year)
            .await?
            .ok_or(StoreError::NotFound)
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<TaxSession>, StoreError> {
        self.store.list(user_id).await
    }

    /// Add an extracted document. Re-uploading identical bytes returns the
    /// document already stored.
    pub async fn ingest(
        &self,
        user_id: &str,
        tax_year: i32,
        document: TaxDocument,
    ) -> Result<Ingested, StoreError> {
        let mut duplicate_of = None;
        let session = self
            .modify(user_id, tax_year, true, |session| {
                if let Some(existing) = document
                    .content_hash
                    .as_deref()
                    .and_then(|hash| session.document_by_hash(hash))
                {
                    duplicate_of = Some(existing.clone());
                    return false;
                }
                duplicate_of = None;
                session.documents.push(document.clone());
                true
            })
            .await?;

        if let Some(existing) = duplicate_of {
            info!(
                "Duplicate upload for session {}: returning {}",
                session.id, existing.id
            );
            return Ok(Ingested {
                session,
                document: existing,
                duplicate: true,
            });
        }

        info!(
            "Added {} {} to session {} (refund estimate {})",
            document.kind, document.id, session.id, session.refund_estimate
        );
        Ok(Ingested {
            session,
            document,
            duplicate: false,
        })
    }

    /// Add a document typed in by the user.
    pub async fn add_manual(
        &self,
        user_id: &str,
        tax_year: i32,
        kind: DocumentKind,
        amounts: BTreeMap<String, Decimal>,
        attributes: BTreeMap<String, String>,
    ) -> Result<Ingested, StoreError> {
        let mut document = TaxDocument::new(kind);
        document.amounts = amounts;
        document.attributes = attributes
            .into_iter()
            .map(|(k, v)| {
                let v = v.trim().to_string();
                if k == crate::schema::field::STATE {
                    (k, v.to_ascii_uppercase())
                } else {
                    (k, v)
                }
            })
            .collect();
        document.source_file = Some("manual".to_string());
        document.confidence = Some(1.0);

        self.ingest(user_id, tax_year, document).await
    }

    pub async fn remove_document(
        &self,
        user_id: &str,
        tax_year: i32,
        doc_id: &str,
    ) -> Result<TaxSession, StoreError> {
        let mut removed = None;
        let session = self
            .modify(user_id, tax_year, false, |session| {
                removed = session.document(doc_id).map(|d| d.kind);
                if removed.is_some() {
                    session.documents.retain(|d| d.id != doc_id);
                }
                removed.is_some()
            })
            .await?;

        let Some(kind) = removed else {
            return Err(StoreError::NotFound);
        };
        info!("Removed {} {} from session {}", kind, doc_id, session.id);
        Ok(session)
    }

    pub async fn update_profile(
        &self,
        user_id: &str,
        tax_year: i32,
        filing_status: Option<FilingStatus>,
        dependents: Option<Vec<Dependent>>,
    ) -> Result<TaxSession, StoreError> {
        self.modify(user_id, tax_year, true, |session| {
            if let Some(status) = filing_status {
                session.filing_status = status;
            }
            if let Some(dependents) = &dependents {
                session.dependents = dependents.clone();
            }
            true
        })
        .await
    }

    /// Recompute the refund from scratch and persist the estimate.
    pub async fn recalculate(
        &self,
        user_id: &str,
        tax_year: i32,
    ) -> Result<(TaxSession, RefundBreakdown), StoreError> {
        let session = self.modify(user_id, tax_year, false, |_| true).await?;
        let breakdown = refund::calculate(&session.documents, &self.rates);
        Ok((session, breakdown))
    }

    /// Load, mutate, recompute and save with revision retries.
    ///
    /// `change` returns false to skip the save. It may run more than once.
    async fn modify<F>(
        &self,
        user_id: &str,
        tax_year: i32,
        create: bool,
        mut change: F,
    ) -> Result<TaxSession, StoreError>
    where
        F: FnMut(&mut TaxSession) -> bool + Send,
    {
        let mut last_conflict = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let mut session = if create {
                self.open(user_id, tax_year).await?
            } else {
                self.get(user_id, tax_year).await?
            };

            if !change(&mut session) {
                return Ok(session);
            }

            session.refund_estimate = refund::estimate_refund(&session.documents, &self.rates);

            match self.store.save(&session).await {
                Ok(saved) => {
                    debug!(
                        "Saved session {} at revision {} (attempt {})",
                        saved.id, saved.revision, attempt
                    );
                    return Ok(saved);
                }
                Err(StoreError::Conflict(id)) => {
                    warn!(
                        "Revision conflict on session {} (attempt {}/{})",
                        id, attempt, MAX_ATTEMPTS
                    );
                    last_conflict = Some(id);
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::Conflict(last_conflict.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::field;
    use crate::store::MemorySessionStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service() -> SessionService {
        SessionService::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(StateRateTable::embedded().unwrap()),
        )
    }

    fn w2(wages: Decimal, withheld: Decimal) -> TaxDocument {
        TaxDocument::new(DocumentKind::W2)
            .with_amount(field::WAGES, wages)
            .with_amount(field::FEDERAL_WITHHELD, withheld)
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let service = service();

        let first = service.open("alice", 2024).await.unwrap();
        let second = service.open("alice", 2024).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(service.list("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_session() {
        let err = service().get("alice", 2024).await.unwrap_err();

        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_ingest_recomputes_refund() {
        let service = service();

        let ingested = service
            .ingest("alice", 2024, w2(dec!(50000), dec!(6000)))
            .await
            .unwrap();

        assert!(!ingested.duplicate);
        assert_eq!(ingested.session.documents.len(), 1);
        assert_eq!(ingested.session.refund_estimate, dec!(1000.00));
        assert_eq!(ingested.session.revision, 1);
    }

    #[tokio::test]
    async fn test_duplicate_upload_returns_existing_document() {
        let service = service();
        let mut first = w2(dec!(50000), dec!(6000));
        first.content_hash = Some("abc".to_string());
        let mut again = w2(dec!(50000), dec!(6000));
        again.content_hash = Some("abc".to_string());

        let original = service.ingest("alice", 2024, first).await.unwrap();
        let repeat = service.ingest("alice", 2024, again).await.unwrap();

        assert!(repeat.duplicate);
        assert_eq!(repeat.document.id, original.document.id);
        assert_eq!(repeat.session.documents.len(), 1);
        assert_eq!(repeat.session.revision, 1);
    }

    #[tokio::test]
    async fn test_manual_entry_normalizes_state() {
        let service = service();
        let amounts = BTreeMap::from([
            (field::WAGES.to_string(), dec!(1000)),
            (field::STATE_WITHHELD.to_string(), dec!(80)),
        ]);
        let attributes = BTreeMap::from([(field::STATE.to_string(), " ma ".to_string())]);

        let ingested = service
            .add_manual("alice", 2024, DocumentKind::W2, amounts, attributes)
            .await
            .unwrap();

        assert_eq!(ingested.document.state(), Some("MA"));
        assert_eq!(ingested.document.source_file.as_deref(), Some("manual"));
        // Federal: 0 - 100 = -100. MA: 80 - 50 = 30.
        assert_eq!(ingested.session.refund_estimate, dec!(-70.00));
    }

    #[tokio::test]
    async fn test_remove_document() {
        let service = service();
        let ingested = service
            .ingest("alice", 2024, w2(dec!(50000), dec!(6000)))
            .await
            .unwrap();

        let session = service
            .remove_document("alice", 2024, &ingested.document.id)
            .await
            .unwrap();

        assert!(session.documents.is_empty());
        assert_eq!(session.refund_estimate, dec!(0));

        let err = service
            .remove_document("alice", 2024, &ingested.document.id)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_update_profile_keeps_unset_fields() {
        let service = service();
        let dependents = vec![Dependent {
            name: "Sam".to_string(),
            relationship: "child".to_string(),
            birth_year: None,
        }];
        service
            .update_profile("alice", 2024, None, Some(dependents.clone()))
            .await
            .unwrap();

        let session = service
            .update_profile("alice", 2024, Some(FilingStatus::HeadOfHousehold), None)
            .await
            .unwrap();

        assert_eq!(session.filing_status, FilingStatus::HeadOfHousehold);
        assert_eq!(session.dependents, dependents);
    }

    #[tokio::test]
    async fn test_recalculate_returns_breakdown() {
        let service = service();
        service
            .ingest(
                "alice",
                2024,
                w2(dec!(50000), dec!(6000)).with_attribute(field::STATE, "TX"),
            )
            .await
            .unwrap();

        let (session, breakdown) = service.recalculate("alice", 2024).await.unwrap();

        assert_eq!(breakdown.federal.refund, dec!(1000.00));
        assert_eq!(breakdown.total, session.refund_estimate);
        assert_eq!(session.revision, 2);
    }

    /// Store whose first saves report a conflict.
    struct FlakyStore {
        inner: MemorySessionStore,
        conflicts_left: AtomicUsize,
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn find(&self, user_id: &str, tax_year: i32) -> Result<Option<TaxSession>, StoreError> {
            self.inner.find(user_id, tax_year).await
        }

        async fn get(&self, id: &str) -> Result<TaxSession, StoreError> {
            self.inner.get(id).await
        }

        async fn insert(&self, session: &TaxSession) -> Result<(), StoreError> {
            self.inner.insert(session).await
        }

        async fn save(&self, session: &TaxSession) -> Result<TaxSession, StoreError> {
            let left = self.conflicts_left.load(Ordering::SeqCst);
            if left > 0 {
                self.conflicts_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Conflict(session.id.clone()));
            }
            self.inner.save(session).await
        }

        async fn list(&self, user_id: &str) -> Result<Vec<TaxSession>, StoreError> {
            self.inner.list(user_id).await
        }
    }

    fn flaky_service(conflicts: usize) -> SessionService {
        SessionService::new(
            Arc::new(FlakyStore {
                inner: MemorySessionStore::new(),
                conflicts_left: AtomicUsize::new(conflicts),
            }),
            Arc::new(StateRateTable::embedded().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_conflict_is_retried() {
        let service = flaky_service(2);

        let ingested = service
            .ingest("alice", 2024, w2(dec!(100), dec!(20)))
            .await
            .unwrap();

        assert_eq!(ingested.session.documents.len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_surfaces_after_retries() {
        let service = flaky_service(MAX_ATTEMPTS);

        let err = service
            .ingest("alice", 2024, w2(dec!(100), dec!(20)))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Conflict(_)));
    }
}
