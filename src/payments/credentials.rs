//! Bearer token cache for the gateway
//!
//! One token per provider, kept until `expires_in` minus a safety margin.
//! On a miss, the first caller starts the upstream exchange and publishes it
//! as a shared in-flight future; every concurrent caller for the same
//! provider awaits that same future instead of starting its own. Failures are
//! handed to all waiters and never cached.

use crate::payments::error::PaymentResult;
use crate::payments::types::AccessCredential;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Performs the upstream credential exchange.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch_credential(&self) -> PaymentResult<AccessCredential>;
}

type InFlight = Shared<BoxFuture<'static, PaymentResult<AccessCredential>>>;

struct CachedCredential {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
struct ProviderSlot {
    cached: Option<CachedCredential>,
    in_flight: Option<(u64, InFlight)>,
}

pub struct CredentialCache {
    source: Arc<dyn CredentialSource>,
    safety_margin: Duration,
    slots: Mutex<HashMap<String, ProviderSlot>>,
    next_flight: AtomicU64,
}

impl CredentialCache {
    pub fn new(source: Arc<dyn CredentialSource>, safety_margin: Duration) -> Self {
        Self {
            source,
            safety_margin,
            slots: Mutex::new(HashMap::new()),
            next_flight: AtomicU64::new(0),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, ProviderSlot>> {
        // Slot state stays consistent even if a holder panicked
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Valid bearer token for `provider`, exchanging credentials at most once
    /// across concurrent callers.
    pub async fn get_token(&self, provider: &str) -> PaymentResult<String> {
        let (flight_id, flight) = {
            let mut slots = self.slots();
            let slot = slots.entry(provider.to_string()).or_default();

            if let Some(cached) = &slot.cached {
                if Instant::now() < cached.expires_at {
                    return Ok(cached.token.clone());
                }
            }

            match &slot.in_flight {
                Some((id, flight)) => {
                    debug!(provider, "Joining in-flight credential exchange");
                    (*id, flight.clone())
                }
                None => {
                    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                    let source = Arc::clone(&self.source);
                    let flight = async move { source.fetch_credential().await }
                        .boxed()
                        .shared();
                    slot.in_flight = Some((id, flight.clone()));
                    (id, flight)
                }
            }
        };

        let result = flight.await;

        {
            let mut slots = self.slots();
            if let Some(slot) = slots.get_mut(provider) {
                let ours = matches!(&slot.in_flight, Some((id, _)) if *id == flight_id);
                if ours {
                    slot.in_flight = None;
                    match &result {
                        Ok(credential) => {
                            let lifetime =
                                credential.expires_in.saturating_sub(self.safety_margin);
                            slot.cached = Some(CachedCredential {
                                token: credential.access_token.clone(),
                                expires_at: Instant::now() + lifetime,
                            });
                            info!(
                                provider,
                                lifetime_secs = lifetime.as_secs(),
                                "Gateway credential refreshed"
                            );
                        }
                        Err(e) => {
                            warn!(provider, error = %e, "Gateway credential exchange failed");
                        }
                    }
                }
            }
        }

        result.map(|credential| credential.access_token)
    }

    /// Drop the cached token, e.g. after the gateway rejected it.
    pub fn invalidate(&self, provider: &str) {
        if let Some(slot) = self.slots().get_mut(provider) {
            slot.cached = None;
        }
    }
}
