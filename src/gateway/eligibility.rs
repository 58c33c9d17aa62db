//! Eligibility gate: subscription check composed with consent check.
//!
//! The subscription check fails closed — any transport error counts as
//! not subscribed, so an outage never grants access.

use aviary_core::{config::AccessConfig, error::AviaryError, traits::Membership};
use aviary_memory::ConsentStore;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of the combined precondition for conversational access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    NeedsSubscription,
    NeedsConsent,
}

/// Composes the channel-membership check with the consent store.
pub struct EligibilityGate {
    membership: Arc<dyn Membership>,
    consent: ConsentStore,
    required_channel: String,
}

impl EligibilityGate {
    pub fn new(
        membership: Arc<dyn Membership>,
        consent: ConsentStore,
        access: &AccessConfig,
    ) -> Self {
        Self {
            membership,
            consent,
            required_channel: access.required_channel.clone(),
        }
    }

    /// Subscription first, then consent. A user who is not subscribed
    /// gets `NeedsSubscription` regardless of any consent record.
    pub async fn check(&self, user_id: i64) -> Eligibility {
        if !self.is_subscribed(user_id).await {
            return Eligibility::NeedsSubscription;
        }

        match self.consent.has_accepted(user_id).await {
            Ok(true) => Eligibility::Eligible,
            Ok(false) => Eligibility::NeedsConsent,
            Err(e) => {
                // Store trouble at request time: deny, don't crash.
                warn!("consent lookup failed for {user_id}, denying: {e}");
                Eligibility::NeedsConsent
            }
        }
    }

    /// Record consent. Re-runs the subscription check first — a user who
    /// unsubscribed between prompts does not get a record written.
    /// Returns `Ok(false)` when the re-check fails.
    pub async fn accept(&self, user_id: i64) -> Result<bool, AviaryError> {
        if !self.is_subscribed(user_id).await {
            info!("consent accept from {user_id} rejected: no longer subscribed");
            return Ok(false);
        }

        // The accept button text carries the age confirmation.
        self.consent.set_accepted(user_id, true).await?;
        info!("consent recorded for {user_id}");
        Ok(true)
    }

    /// Delete any consent record, regardless of subscription state.
    pub async fn decline(&self, user_id: i64) -> Result<(), AviaryError> {
        self.consent.delete_acceptance(user_id).await?;
        info!("consent deleted for {user_id}");
        Ok(())
    }

    async fn is_subscribed(&self, user_id: i64) -> bool {
        match self
            .membership
            .is_member(&self.required_channel, user_id)
            .await
        {
            Ok(subscribed) => subscribed,
            Err(e) => {
                warn!("subscription check failed for {user_id}, treating as unsubscribed: {e}");
                false
            }
        }
    }
}
