//! Gate verification orchestrator.
//!
//! One attempt walks `AwaitingClaim -> ClaimResolved -> Comparing ->
//! Decided`. The claim narrows the candidate set to exactly one ticket
//! before any biometric work, so the backend only ever answers a 1:1
//! question. No lock is held across the backend call; the final
//! `Active -> Used` move is a compare-and-set at the repository, and the
//! loser of a race observes `AlreadyUsed` and is denied.
//!
//! The verdict of an attempt is always a [`VerificationResult`] — every
//! failure, timeout, or ambiguity folds into a denial, never an approval
//! and never an error that could be mistaken for one.

use facegate_core::{GateError, TicketClass, TicketStatus, Tier};
use facegate_source::{Capture, DescriptorSource};
use facegate_store::Store;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
enum AttemptPhase {
    AwaitingClaim,
    ClaimResolved,
    Comparing,
    Decided,
}

impl AttemptPhase {
    fn as_str(self) -> &'static str {
        match self {
            AttemptPhase::AwaitingClaim => "awaiting_claim",
            AttemptPhase::ClaimResolved => "claim_resolved",
            AttemptPhase::Comparing => "comparing",
            AttemptPhase::Decided => "decided",
        }
    }
}

/// What the operator display gets to see about the resolved ticket.
/// Never descriptor data.
#[derive(Debug, Clone, Serialize)]
pub struct TicketSummary {
    pub id: String,
    pub holder_name: String,
    pub class: TicketClass,
}

/// Ephemeral outcome of one gate attempt. Produced per scan, handed to
/// the presentation layer, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub granted: bool,
    /// Whether presenting again can change the outcome. `AlreadyUsed`
    /// and `CapacityExceeded` are definitive.
    pub retryable: bool,
    /// Machine-readable outcome kind for audit trails.
    pub kind: String,
    /// Confidence tier, when a comparison actually ran.
    pub tier: Option<Tier>,
    pub reason: String,
    pub ticket: Option<TicketSummary>,
}

impl VerificationResult {
    fn granted(tier: Tier, ticket: TicketSummary) -> Self {
        Self {
            granted: true,
            retryable: false,
            kind: "access_granted".into(),
            tier: Some(tier),
            reason: format!("access granted ({tier} confidence)"),
            ticket: Some(ticket),
        }
    }

    fn denied(err: &GateError, tier: Option<Tier>, ticket: Option<TicketSummary>) -> Self {
        Self {
            granted: false,
            retryable: !err.is_definitive(),
            kind: err.kind().into(),
            tier,
            reason: err.to_string(),
            ticket,
        }
    }
}

#[derive(Clone)]
pub struct GateVerifier {
    store: Store,
    source: Arc<dyn DescriptorSource>,
    timeout: Duration,
}

impl GateVerifier {
    pub fn new(store: Store, source: Arc<dyn DescriptorSource>, timeout: Duration) -> Self {
        Self {
            store,
            source,
            timeout,
        }
    }

    /// Run one gate attempt for a claimed identity scoped to one event.
    pub async fn verify(&self, event_id: &str, claim_email: &str, live: &Capture) -> VerificationResult {
        let mut phase = AttemptPhase::AwaitingClaim;
        let claim = claim_email.trim().to_lowercase();
        tracing::debug!(phase = phase.as_str(), event_id, "gate attempt started");

        let candidates = match self.store.tickets_for_claim(event_id, &claim).await {
            Ok(candidates) => candidates,
            Err(e) => return self.deny(event_id, &e, None, None),
        };
        if candidates.is_empty() {
            return self.deny(event_id, &GateError::ClaimNotFound, None, None);
        }

        let any_used = candidates.iter().any(|t| t.status == TicketStatus::Used);
        let mut live_tickets: Vec<_> = candidates
            .into_iter()
            .filter(|t| t.status.is_live())
            .collect();

        if live_tickets.is_empty() {
            // Fail fast, before any biometric call: a spent ticket is a
            // definitive denial, not a comparison candidate.
            let err = if any_used {
                GateError::AlreadyUsed
            } else {
                GateError::ClaimNotFound
            };
            return self.deny(event_id, &err, None, None);
        }
        if live_tickets.len() > 1 {
            let err = GateError::AmbiguousClaim(
                "more than one live ticket matches this claim".into(),
            );
            return self.deny(event_id, &err, None, None);
        }
        let ticket = live_tickets.remove(0);
        let summary = TicketSummary {
            id: ticket.id.clone(),
            holder_name: ticket.holder.name.clone(),
            class: ticket.class,
        };
        phase = AttemptPhase::ClaimResolved;
        tracing::debug!(
            phase = phase.as_str(),
            event_id,
            ticket_id = %ticket.id,
            status = %ticket.status,
            "claim resolved to a single candidate"
        );

        if ticket.status != TicketStatus::Active {
            let err = GateError::DescriptorInvalid(
                "ticket has no enrolled biometric yet".into(),
            );
            return self.deny(event_id, &err, None, Some(summary));
        }

        let artifact = match self.store.fetch_artifact(&ticket.id).await {
            Ok(Some(artifact)) => artifact,
            Ok(None) => {
                let err = GateError::DescriptorInvalid("ticket has no bound artifact".into());
                return self.deny(event_id, &err, None, Some(summary));
            }
            Err(e) => return self.deny(event_id, &e, None, Some(summary)),
        };

        phase = AttemptPhase::Comparing;
        tracing::debug!(phase = phase.as_str(), ticket_id = %ticket.id, "comparing live capture");

        let verdict = match tokio::time::timeout(self.timeout, self.source.verify(live, &artifact))
            .await
        {
            Err(_) => {
                let err = GateError::ServiceUnavailable(format!(
                    "verification timed out after {}s",
                    self.timeout.as_secs()
                ));
                return self.deny(event_id, &err, None, Some(summary));
            }
            Ok(Err(e)) => return self.deny(event_id, &GateError::from(e), None, Some(summary)),
            Ok(Ok(verdict)) => verdict,
        };

        phase = AttemptPhase::Decided;
        if !verdict.face_detected {
            return self.deny(event_id, &GateError::NoFaceDetected, None, Some(summary));
        }
        if !verdict.matched {
            tracing::info!(
                phase = phase.as_str(),
                event_id,
                ticket_id = %ticket.id,
                tier = %verdict.tier,
                "face mismatch; ticket unchanged"
            );
            return VerificationResult::denied(
                &GateError::FaceMismatch,
                Some(verdict.tier),
                Some(summary),
            );
        }

        // Re-validated at the write: only the first of racing attempts
        // commits Active -> Used, the rest land here as AlreadyUsed.
        if let Err(e) = self.store.admit(&ticket.id).await {
            return self.deny(event_id, &e, Some(verdict.tier), Some(summary));
        }

        tracing::info!(
            phase = phase.as_str(),
            event_id,
            ticket_id = %ticket.id,
            tier = %verdict.tier,
            holder = %ticket.holder.name,
            "access granted"
        );
        VerificationResult::granted(verdict.tier, summary)
    }

    fn deny(
        &self,
        event_id: &str,
        err: &GateError,
        tier: Option<Tier>,
        ticket: Option<TicketSummary>,
    ) -> VerificationResult {
        tracing::info!(
            event_id,
            kind = err.kind(),
            definitive = err.is_definitive(),
            "gate attempt denied: {err}"
        );
        VerificationResult::denied(err, tier, ticket)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use facegate_core::{Descriptor, Event, Holder, Ticket, Verdict};
    use facegate_source::{Artifact, SourceError};
    use facegate_store::Seal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted descriptor source for orchestrator tests. Counts verify
    /// calls so tests can assert the backend was never consulted.
    pub(crate) struct StubSource {
        behavior: StubBehavior,
        enroll_rejection: Option<String>,
        calls: AtomicUsize,
    }

    pub(crate) enum StubBehavior {
        Match(Tier),
        NoMatch,
        NoFace,
        Fail,
        Slow(Duration),
    }

    impl StubSource {
        pub(crate) fn matching(tier: Tier) -> Self {
            Self::with_behavior(StubBehavior::Match(tier))
        }

        pub(crate) fn with_behavior(behavior: StubBehavior) -> Self {
            Self {
                behavior,
                enroll_rejection: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn rejecting_enrollment(reason: &str) -> Self {
            Self {
                behavior: StubBehavior::NoMatch,
                enroll_rejection: Some(reason.to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn verify_calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DescriptorSource for StubSource {
        fn method(&self) -> &str {
            "stub"
        }

        async fn enroll(&self, _capture: &Capture) -> Result<Artifact, SourceError> {
            if let Some(reason) = &self.enroll_rejection {
                return Err(SourceError::Rejected(reason.clone()));
            }
            Ok(Artifact::Descriptor(Descriptor::new(vec![0.0; 4], "stub")))
        }

        async fn verify(&self, _live: &Capture, _enrolled: &Artifact) -> Result<Verdict, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                StubBehavior::Match(tier) => Ok(Verdict {
                    matched: true,
                    face_detected: true,
                    tier: *tier,
                    distance: None,
                }),
                StubBehavior::NoMatch => Ok(Verdict {
                    matched: false,
                    face_detected: true,
                    tier: Tier::NoMatch,
                    distance: Some(0.72),
                }),
                StubBehavior::NoFace => Ok(Verdict::no_face()),
                StubBehavior::Fail => Err(SourceError::Unavailable("judge offline".into())),
                StubBehavior::Slow(delay) => {
                    tokio::time::sleep(*delay).await;
                    Ok(Verdict {
                        matched: true,
                        face_detected: true,
                        tier: Tier::High,
                        distance: None,
                    })
                }
            }
        }
    }

    async fn store_with_ticket(status: TicketStatus) -> Store {
        let store = Store::open_in_memory(Seal::from_passphrase("test"))
            .await
            .unwrap();
        store
            .insert_event(&Event {
                id: "ev".into(),
                name: "Launch Night".into(),
                schedule: Utc::now(),
                location: "Hall A".into(),
                is_free: true,
                price: 0.0,
                max_capacity: 100,
                current_attendees: 0,
                is_active: true,
            })
            .await
            .unwrap();
        store
            .create_ticket(&Ticket {
                id: "t1".into(),
                event_id: "ev".into(),
                holder: Holder {
                    name: "Ana Souza".into(),
                    email: "ana@x.com".into(),
                    national_id: "1".into(),
                },
                class: TicketClass::Free,
                price: 0.0,
                status: TicketStatus::PaidPendingFace,
                purchased_at: Utc::now(),
                artifact_method: None,
            })
            .await
            .unwrap();
        if status == TicketStatus::Active || status == TicketStatus::Used {
            let artifact = Artifact::Descriptor(Descriptor::new(vec![0.0; 4], "stub"));
            store
                .activate_and_count("t1", "ev", &artifact, "stub", true)
                .await
                .unwrap();
        }
        if status == TicketStatus::Used {
            store.admit("t1").await.unwrap();
        }
        store
    }

    fn verifier(store: &Store, source: Arc<StubSource>) -> GateVerifier {
        GateVerifier::new(store.clone(), source, Duration::from_secs(5))
    }

    fn capture() -> Capture {
        Capture::from_jpeg(vec![0xFF, 0xD8])
    }

    #[tokio::test]
    async fn test_match_grants_and_consumes_ticket() {
        let store = store_with_ticket(TicketStatus::Active).await;
        let source = Arc::new(StubSource::matching(Tier::High));
        let result = verifier(&store, source.clone())
            .verify("ev", "ana@x.com", &capture())
            .await;

        assert!(result.granted);
        assert_eq!(result.kind, "access_granted");
        assert_eq!(result.tier, Some(Tier::High));
        assert!(result.reason.contains("High"));
        assert_eq!(store.get_ticket("t1").await.unwrap().status, TicketStatus::Used);
    }

    #[tokio::test]
    async fn test_low_tier_match_is_accepted() {
        let store = store_with_ticket(TicketStatus::Active).await;
        let source = Arc::new(StubSource::matching(Tier::Low));
        let result = verifier(&store, source)
            .verify("ev", "ana@x.com", &capture())
            .await;

        assert!(result.granted);
        assert_eq!(result.tier, Some(Tier::Low));
    }

    #[tokio::test]
    async fn test_mismatch_leaves_ticket_active() {
        let store = store_with_ticket(TicketStatus::Active).await;
        let source = Arc::new(StubSource::with_behavior(StubBehavior::NoMatch));
        let result = verifier(&store, source)
            .verify("ev", "ana@x.com", &capture())
            .await;

        assert!(!result.granted);
        assert!(result.retryable);
        assert_eq!(result.kind, "face_mismatch");
        assert_eq!(result.tier, Some(Tier::NoMatch));
        assert_eq!(store.get_ticket("t1").await.unwrap().status, TicketStatus::Active);
    }

    #[tokio::test]
    async fn test_no_face_denies_without_consuming() {
        let store = store_with_ticket(TicketStatus::Active).await;
        let source = Arc::new(StubSource::with_behavior(StubBehavior::NoFace));
        let result = verifier(&store, source)
            .verify("ev", "ana@x.com", &capture())
            .await;

        assert!(!result.granted);
        assert_eq!(result.kind, "no_face_detected");
        assert_eq!(store.get_ticket("t1").await.unwrap().status, TicketStatus::Active);
    }

    #[tokio::test]
    async fn test_unknown_claim_skips_biometric_call() {
        let store = store_with_ticket(TicketStatus::Active).await;
        let source = Arc::new(StubSource::matching(Tier::High));
        let result = verifier(&store, source.clone())
            .verify("ev", "nobody@x.com", &capture())
            .await;

        assert!(!result.granted);
        assert_eq!(result.kind, "claim_not_found");
        assert_eq!(source.verify_calls(), 0);
    }

    #[tokio::test]
    async fn test_used_ticket_fails_fast_without_biometric_call() {
        let store = store_with_ticket(TicketStatus::Used).await;
        let source = Arc::new(StubSource::matching(Tier::High));
        let result = verifier(&store, source.clone())
            .verify("ev", "ana@x.com", &capture())
            .await;

        assert!(!result.granted);
        assert!(!result.retryable);
        assert_eq!(result.kind, "already_used");
        assert_eq!(source.verify_calls(), 0);
    }

    #[tokio::test]
    async fn test_unenrolled_ticket_denies_before_comparing() {
        let store = store_with_ticket(TicketStatus::PaidPendingFace).await;
        let source = Arc::new(StubSource::matching(Tier::High));
        let result = verifier(&store, source.clone())
            .verify("ev", "ana@x.com", &capture())
            .await;

        assert!(!result.granted);
        assert_eq!(result.kind, "descriptor_invalid");
        assert_eq!(source.verify_calls(), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_denies_and_preserves_ticket() {
        let store = store_with_ticket(TicketStatus::Active).await;
        let source = Arc::new(StubSource::with_behavior(StubBehavior::Fail));
        let result = verifier(&store, source)
            .verify("ev", "ana@x.com", &capture())
            .await;

        assert!(!result.granted);
        assert!(result.retryable);
        assert_eq!(result.kind, "service_unavailable");
        assert_eq!(store.get_ticket("t1").await.unwrap().status, TicketStatus::Active);
    }

    #[tokio::test]
    async fn test_backend_timeout_denies_service_unavailable() {
        let store = store_with_ticket(TicketStatus::Active).await;
        let source = Arc::new(StubSource::with_behavior(StubBehavior::Slow(
            Duration::from_millis(250),
        )));
        let verifier = GateVerifier::new(store.clone(), source, Duration::from_millis(20));
        let result = verifier.verify("ev", "ana@x.com", &capture()).await;

        assert!(!result.granted);
        assert_eq!(result.kind, "service_unavailable");
        assert_eq!(store.get_ticket("t1").await.unwrap().status, TicketStatus::Active);
    }

    #[tokio::test]
    async fn test_claim_with_used_history_resolves_to_live_ticket() {
        // One spent ticket plus one live replacement under the same
        // email: the live one is the single candidate.
        let store = store_with_ticket(TicketStatus::Used).await;
        store
            .create_ticket(&Ticket {
                id: "t2".into(),
                event_id: "ev".into(),
                holder: Holder {
                    name: "Ana Souza".into(),
                    email: "ana@x.com".into(),
                    national_id: "1".into(),
                },
                class: TicketClass::Free,
                price: 0.0,
                status: TicketStatus::PaidPendingFace,
                purchased_at: Utc::now(),
                artifact_method: None,
            })
            .await
            .unwrap();
        let artifact = Artifact::Descriptor(Descriptor::new(vec![0.0; 4], "stub"));
        store
            .activate_and_count("t2", "ev", &artifact, "stub", true)
            .await
            .unwrap();

        let source = Arc::new(StubSource::matching(Tier::Medium));
        let result = verifier(&store, source)
            .verify("ev", "ANA@x.com", &capture())
            .await;

        assert!(result.granted);
        assert_eq!(result.ticket.as_ref().map(|t| t.id.as_str()), Some("t2"));
        assert_eq!(store.get_ticket("t2").await.unwrap().status, TicketStatus::Used);
    }

    #[tokio::test]
    async fn test_racing_attempts_grant_exactly_once() {
        let store = store_with_ticket(TicketStatus::Active).await;
        let source = Arc::new(StubSource::matching(Tier::High));
        let verifier = Arc::new(verifier(&store, source));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let verifier = verifier.clone();
            handles.push(tokio::spawn(async move {
                verifier.verify("ev", "ana@x.com", &capture()).await
            }));
        }

        let mut granted = 0;
        let mut already_used = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            if result.granted {
                granted += 1;
            } else {
                // Losers fail closed with a definitive denial, whether
                // they lost before the comparison or at the final write.
                assert_eq!(result.kind, "already_used");
                assert!(!result.retryable);
                already_used += 1;
            }
        }
        assert_eq!(granted, 1);
        assert_eq!(already_used, 3);
    }
}
