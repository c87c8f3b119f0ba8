use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use parley_core::model::{Message, Profile, UserId};
use parley_gateway::Gateway;
use tracing::{debug, warn};

/// Author profiles resolved so far in this session.
///
/// Only real profiles are cached; placeholders handed out after a failed or
/// timed out lookup are retried on the next resolution.
#[derive(Default)]
pub struct ProfileCache {
    profiles: Mutex<HashMap<UserId, Profile>>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, Profile>> {
        self.profiles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, user_id: UserId) -> Option<Profile> {
        self.lock().get(&user_id).cloned()
    }

    pub fn insert(&self, profile: Profile) {
        self.lock().insert(profile.user_id, profile);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Resolve `ids` with at most one batched gateway call bounded by `timeout`.
    /// Never fails: unknown or unreachable users get placeholders.
    pub async fn resolve<G: Gateway>(
        &self,
        gateway: &G,
        ids: impl IntoIterator<Item = UserId>,
        timeout: Duration,
    ) -> HashMap<UserId, Profile> {
        let wanted: HashSet<UserId> = ids.into_iter().collect();
        let mut resolved = HashMap::with_capacity(wanted.len());
        let mut missing = Vec::new();
        {
            let cache = self.lock();
            for id in wanted {
                match cache.get(&id) {
                    Some(profile) => {
                        resolved.insert(id, profile.clone());
                    }
                    None => missing.push(id),
                }
            }
        }

        if missing.is_empty() {
            return resolved;
        }

        match tokio::time::timeout(timeout, gateway.fetch_profiles(&missing)).await {
            Ok(Ok(profiles)) => {
                let mut cache = self.lock();
                for profile in profiles {
                    cache.insert(profile.user_id, profile.clone());
                    resolved.insert(profile.user_id, profile);
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, count = missing.len(), "profile lookup failed, using placeholders");
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    count = missing.len(),
                    "profile lookup timed out, using placeholders"
                );
            }
        }

        for id in missing {
            resolved.entry(id).or_insert_with(|| {
                debug!(user_id = %id, "no profile, using placeholder");
                Profile::placeholder(id)
            });
        }
        resolved
    }

    /// Fill in `author` on every message, resolving all authors in one batch.
    pub async fn attach_authors<G: Gateway>(
        &self,
        gateway: &G,
        messages: &mut [Message],
        timeout: Duration,
    ) {
        if messages.is_empty() {
            return;
        }
        let profiles = self
            .resolve(gateway, messages.iter().map(|m| m.author_id), timeout)
            .await;
        for message in messages.iter_mut() {
            message.author = Some(
                profiles
                    .get(&message.author_id)
                    .cloned()
                    .unwrap_or_else(|| Profile::placeholder(message.author_id)),
            );
        }
    }
}
