/// Load-or-issue orchestration for decryption grants.
///
/// Flow for one request:
/// 1. Resolve the signer's address
/// 2. Derive the cache key for (signer, scope, optional public key)
/// 3. Look the key up in the store; drop corrupt entries, remove expired ones
/// 4. On a valid hit, return it (no signing, no network)
/// 5. On a miss, get a keypair and ask the user to sign a new grant
/// 6. Persist the new grant (best effort) and return it
///
/// Concurrent requests for the same key share one in-flight issuance, so
/// a burst of decrypt calls produces at most one signature prompt. The
/// issuance runs on its own task: callers may walk away, but the prompt
/// already shown still settles, is persisted, and clears its map entry.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use alloy::primitives::Address;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use super::key::{derive, normalize_contracts, CacheKey};
use super::DecryptionAuthorization;
use crate::clock::Clock;
use crate::config::GrantConfig;
use crate::crypto::keys::EphemeralKeyPair;
use crate::engine::DecryptionEngine;
use crate::error::{GrantError, Result};
use crate::signer::StructuredSigner;
use crate::storage::{self, CacheStore};

type SharedIssue = Shared<BoxFuture<'static, Result<DecryptionAuthorization>>>;
type InFlightMap = Mutex<HashMap<CacheKey, InFlight>>;

struct InFlight {
    id: u64,
    fut: SharedIssue,
}

fn lock(map: &InFlightMap) -> MutexGuard<'_, HashMap<CacheKey, InFlight>> {
    map.lock().unwrap_or_else(|e| e.into_inner())
}

/// Tracks the scope a caller currently wants.
///
/// Callers take a ticket when they start a request and advance the tracker
/// whenever their desired scope changes (new account, new contract set,
/// unmounted view). Results for outdated tickets are discarded.
#[derive(Debug, Clone, Default)]
pub struct ScopeTracker {
    generation: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
pub struct ScopeTicket {
    generation: Arc<AtomicU64>,
    issued: u64,
}

impl ScopeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticket(&self) -> ScopeTicket {
        ScopeTicket {
            generation: Arc::clone(&self.generation),
            issued: self.generation.load(Ordering::SeqCst),
        }
    }

    /// Invalidate every outstanding ticket and return a fresh one.
    pub fn advance(&self) -> ScopeTicket {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.ticket()
    }
}

impl ScopeTicket {
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.issued
    }
}

pub struct AuthorizationManager {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    config: GrantConfig,
    in_flight: Arc<InFlightMap>,
    next_issue: AtomicU64,
}

impl AuthorizationManager {
    pub fn new(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>, config: GrantConfig) -> Self {
        Self {
            store,
            clock,
            config,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_issue: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn config(&self) -> &GrantConfig {
        &self.config
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<CacheKey, InFlight>> {
        lock(&self.in_flight)
    }

    async fn resolve_key(
        &self,
        signer: &dyn StructuredSigner,
        contracts: &[Address],
        key_pair: Option<&EphemeralKeyPair>,
    ) -> Result<(Address, CacheKey)> {
        if contracts.is_empty() {
            return Err(GrantError::EmptyScope);
        }
        let address = signer.address().await?;
        let key = derive(
            &self.config.key_namespace,
            &address,
            contracts,
            key_pair.map(|kp| kp.public_key.as_str()),
        );
        Ok((address, key))
    }

    /// Return a valid cached grant, or `None`. Never prompts the user.
    pub async fn load_cached(
        &self,
        contracts: &[Address],
        signer: Option<&dyn StructuredSigner>,
        public_key: Option<&EphemeralKeyPair>,
    ) -> Result<Option<DecryptionAuthorization>> {
        let signer = signer.ok_or(GrantError::SignerUnavailable)?;
        let (address, key) = self.resolve_key(signer, contracts, public_key).await?;
        let scope = normalize_contracts(contracts);
        Ok(load_from_store(&*self.store, &key, address, &scope, self.clock.now()).await)
    }

    /// Return a valid grant for `contracts`, issuing (and prompting) only
    /// when no valid cached grant exists.
    ///
    /// Surfaces only user-actionable failures; storage trouble and corrupt
    /// entries fall back to issuing a fresh grant.
    pub async fn load_or_issue(
        &self,
        engine: Arc<dyn DecryptionEngine>,
        contracts: &[Address],
        signer: Option<Arc<dyn StructuredSigner>>,
        key_pair: Option<EphemeralKeyPair>,
    ) -> Result<DecryptionAuthorization> {
        let signer = signer.ok_or(GrantError::SignerUnavailable)?;
        let (address, key) = self
            .resolve_key(signer.as_ref(), contracts, key_pair.as_ref())
            .await?;
        info!(signer = %address, key = %key, "Decryption grant requested");
        let scope = normalize_contracts(contracts);

        // A joined issuance may have started long ago; one that settled
        // past its window gets a single fresh attempt.
        let mut result = self
            .join_or_start(&key, address, &scope, &engine, &signer, key_pair.clone())
            .await;
        if let Ok(auth) = &result {
            if !auth.is_valid_at(self.clock.now()) {
                warn!(key = %key, "Shared grant expired before use, issuing again");
                result = self
                    .join_or_start(&key, address, &scope, &engine, &signer, key_pair)
                    .await;
            }
        }

        match result {
            Ok(auth) if !auth.is_valid_at(self.clock.now()) => Err(GrantError::Expired),
            other => other,
        }
    }

    fn join_or_start(
        &self,
        key: &CacheKey,
        address: Address,
        scope: &[Address],
        engine: &Arc<dyn DecryptionEngine>,
        signer: &Arc<dyn StructuredSigner>,
        key_pair: Option<EphemeralKeyPair>,
    ) -> SharedIssue {
        let mut in_flight = self.in_flight();
        if let Some(existing) = in_flight.get(key) {
            debug!(key = %key, "Joining in-flight grant request");
            return existing.fut.clone();
        }

        let id = self.next_issue.fetch_add(1, Ordering::Relaxed);
        let issuance = resolve(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.config.validity_days,
            key.clone(),
            address,
            scope.to_vec(),
            Arc::clone(engine),
            Arc::clone(signer),
            key_pair,
        );
        let map = Arc::clone(&self.in_flight);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = issuance.await;
            let mut in_flight = lock(&map);
            if in_flight.get(&task_key).is_some_and(|f| f.id == id) {
                in_flight.remove(&task_key);
            }
            result
        });

        let fut = handle
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    Err(GrantError::SignerFailed(format!("grant issuance aborted: {e}")))
                })
            })
            .boxed()
            .shared();
        in_flight.insert(
            key.clone(),
            InFlight {
                id,
                fut: fut.clone(),
            },
        );
        fut
    }

    /// `load_or_issue` for a caller whose scope may change mid-request.
    ///
    /// Returns `StaleScope` if `ticket` was outdated before the call or
    /// became outdated while waiting. A grant issued meanwhile stays
    /// cached under its own key.
    pub async fn load_or_issue_scoped(
        &self,
        ticket: &ScopeTicket,
        engine: Arc<dyn DecryptionEngine>,
        contracts: &[Address],
        signer: Option<Arc<dyn StructuredSigner>>,
        key_pair: Option<EphemeralKeyPair>,
    ) -> Result<DecryptionAuthorization> {
        if !ticket.is_current() {
            return Err(GrantError::StaleScope);
        }
        let auth = self.load_or_issue(engine, contracts, signer, key_pair).await?;
        if !ticket.is_current() {
            info!(signer = %auth.granted_by(), "Scope changed while waiting, discarding grant");
            return Err(GrantError::StaleScope);
        }
        Ok(auth)
    }

    /// Remove expired and corrupt grants from the store.
    pub async fn prune(&self) -> Result<usize> {
        storage::prune_expired(&*self.store, &self.config.key_namespace, self.clock.now()).await
    }
}

/// Steps 3-4: a usable cached grant for this exact key, signer and scope.
async fn load_from_store(
    store: &dyn CacheStore,
    key: &CacheKey,
    signer: Address,
    scope: &[Address],
    now: u64,
) -> Option<DecryptionAuthorization> {
    let raw = match store.get(key.as_str()).await {
        Ok(Some(raw)) => raw,
        Ok(None) => {
            debug!(key = %key, "No stored grant");
            return None;
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Cache read failed, treating as miss");
            return None;
        }
    };

    let auth = match DecryptionAuthorization::deserialize(&raw) {
        Ok(auth) => auth,
        Err(e) => {
            warn!(key = %key, error = %e, "Discarding corrupt cache entry");
            return None;
        }
    };

    if auth.granted_by() != signer || auth.contracts() != scope {
        warn!(key = %key, "Cached grant belongs to another signer or scope, ignoring");
        return None;
    }

    if !auth.is_valid_at(now) {
        info!(key = %key, "Stored grant expired, removing");
        if let Err(e) = store.remove(key.as_str()).await {
            debug!(key = %key, error = %e, "Failed to remove expired grant");
        }
        return None;
    }

    info!(
        key = %key,
        remaining_secs = auth.remaining_secs(now),
        "Using cached decryption grant"
    );
    Some(auth)
}

#[allow(clippy::too_many_arguments)]
async fn resolve(
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    validity_days: u32,
    key: CacheKey,
    address: Address,
    scope: Vec<Address>,
    engine: Arc<dyn DecryptionEngine>,
    signer: Arc<dyn StructuredSigner>,
    key_pair: Option<EphemeralKeyPair>,
) -> Result<DecryptionAuthorization> {
    if let Some(cached) = load_from_store(&*store, &key, address, &scope, clock.now()).await {
        return Ok(cached);
    }

    info!(key = %key, "No valid cached grant, issuing a new one");
    let key_pair = match key_pair {
        Some(kp) => kp,
        None => engine.generate_keypair()?,
    };

    let auth = DecryptionAuthorization::issue_as(
        engine.as_ref(),
        signer.as_ref(),
        address,
        &scope,
        key_pair,
        clock.now(),
        validity_days,
    )
    .await
    .map_err(|e| {
        warn!(key = %key, error = %e, "Failed to issue decryption grant");
        e
    })?;

    let persisted = match auth.serialize() {
        Ok(raw) => store.set(key.as_str(), &raw).await,
        Err(e) => Err(e),
    };
    match persisted {
        Ok(()) => info!(key = %key, "New grant saved"),
        Err(e) => warn!(
            key = %key,
            error = %e,
            "Failed to save grant, continuing without persistence"
        ),
    }

    Ok(auth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    use alloy::primitives::{address, Bytes};
    use async_trait::async_trait;

    use crate::clock::ManualClock;
    use crate::config::DomainConfig;
    use crate::engine::local::LocalEngine;
    use crate::grant::message::StructuredMessage;
    use crate::grant::SECONDS_PER_DAY;
    use crate::signer::local::LocalWalletSigner;
    use crate::storage::{FileStore, MemoryStore};

    const C1: Address = address!("1111111111111111111111111111111111111111");
    const C2: Address = address!("2222222222222222222222222222222222222222");
    const T0: u64 = 1_700_000_000;

    /// Wallet fake that counts prompts and can be told to decline.
    struct CountingSigner {
        inner: LocalWalletSigner,
        prompts: AtomicUsize,
        decline: AtomicBool,
        delay: Duration,
    }

    impl CountingSigner {
        fn new() -> Arc<Self> {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                inner: LocalWalletSigner::random(),
                prompts: AtomicUsize::new(0),
                decline: AtomicBool::new(false),
                delay,
            })
        }

        fn prompts(&self) -> usize {
            self.prompts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StructuredSigner for CountingSigner {
        async fn address(&self) -> Result<Address> {
            self.inner.address().await
        }

        async fn sign_structured_message(&self, message: &StructuredMessage) -> Result<Bytes> {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.decline.load(Ordering::SeqCst) {
                return Err(GrantError::SignatureDeclined("User rejected".into()));
            }
            self.inner.sign_structured_message(message).await
        }
    }

    /// Wallet fake whose prompt stays open until the test releases it.
    struct GatedSigner {
        inner: LocalWalletSigner,
        gate: tokio::sync::Semaphore,
        prompts: AtomicUsize,
    }

    impl GatedSigner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: LocalWalletSigner::random(),
                gate: tokio::sync::Semaphore::new(0),
                prompts: AtomicUsize::new(0),
            })
        }

        fn release(&self) {
            self.gate.add_permits(1);
        }

        fn prompts(&self) -> usize {
            self.prompts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StructuredSigner for GatedSigner {
        async fn address(&self) -> Result<Address> {
            self.inner.address().await
        }

        async fn sign_structured_message(&self, message: &StructuredMessage) -> Result<Bytes> {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| GrantError::SignerFailed(e.to_string()))?;
            self.inner.sign_structured_message(message).await
        }
    }

    /// Wallet that reports one account, then switches to another; it
    /// always signs with the account it switched to.
    struct SwitchingSigner {
        first: LocalWalletSigner,
        second: LocalWalletSigner,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl StructuredSigner for SwitchingSigner {
        async fn address(&self) -> Result<Address> {
            if self.lookups.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(self.first.wallet_address())
            } else {
                Ok(self.second.wallet_address())
            }
        }

        async fn sign_structured_message(&self, message: &StructuredMessage) -> Result<Bytes> {
            self.second.sign_structured_message(message).await
        }
    }

    /// Store fake that records every operation.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        ops: Mutex<Vec<&'static str>>,
        fail_writes: bool,
    }

    impl RecordingStore {
        fn ops(&self) -> Vec<&'static str> {
            self.ops.lock().unwrap().clone()
        }

        fn count(&self, op: &str) -> usize {
            self.ops().iter().filter(|o| **o == op).count()
        }
    }

    #[async_trait]
    impl CacheStore for RecordingStore {
        fn name(&self) -> &str {
            "recording"
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.ops.lock().unwrap().push("get");
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            self.ops.lock().unwrap().push("set");
            if self.fail_writes {
                return Err(GrantError::StorageUnavailable("disk full".into()));
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<()> {
            self.ops.lock().unwrap().push("remove");
            self.inner.remove(key).await
        }

        async fn keys(&self) -> Result<Vec<String>> {
            self.inner.keys().await
        }
    }

    struct Fixture {
        manager: AuthorizationManager,
        store: Arc<RecordingStore>,
        clock: Arc<ManualClock>,
        engine: Arc<dyn DecryptionEngine>,
    }

    fn fixture_with(store: RecordingStore) -> Fixture {
        let store = Arc::new(store);
        let clock = Arc::new(ManualClock::new(T0));
        let engine: Arc<dyn DecryptionEngine> =
            Arc::new(LocalEngine::new(&DomainConfig::default(), clock.clone()));
        let manager = AuthorizationManager::new(store.clone(), clock.clone(), GrantConfig::default());
        Fixture {
            manager,
            store,
            clock,
            engine,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingStore::default())
    }

    fn some(signer: &Arc<CountingSigner>) -> Option<Arc<dyn StructuredSigner>> {
        Some(signer.clone() as Arc<dyn StructuredSigner>)
    }

    #[tokio::test]
    async fn test_first_call_issues_then_cache_hits() {
        let fx = fixture();
        let signer = CountingSigner::new();

        let first = fx
            .manager
            .load_or_issue(fx.engine.clone(), &[C1], some(&signer), None)
            .await
            .unwrap();
        assert_eq!(signer.prompts(), 1);
        assert_eq!(fx.store.count("set"), 1);
        assert_eq!(first.granted_by(), signer.inner.wallet_address());
        assert_eq!(first.duration_days(), 365);

        let second = fx
            .manager
            .load_or_issue(fx.engine.clone(), &[C1], some(&signer), None)
            .await
            .unwrap();
        assert_eq!(signer.prompts(), 1);
        assert_eq!(second, first);
        assert_eq!(second.public_key(), first.public_key());
        assert_eq!(second.private_key(), first.private_key());
    }

    #[tokio::test]
    async fn test_repeated_hits_are_identical() {
        let fx = fixture();
        let signer = CountingSigner::new();
        let first = fx
            .manager
            .load_or_issue(fx.engine.clone(), &[C1, C2], some(&signer), None)
            .await
            .unwrap();

        for _ in 0..5 {
            let again = fx
                .manager
                .load_or_issue(fx.engine.clone(), &[C2, C1], some(&signer), None)
                .await
                .unwrap();
            assert_eq!(again.serialize().unwrap(), first.serialize().unwrap());
        }
        assert_eq!(signer.prompts(), 1);
    }

    #[tokio::test]
    async fn test_expired_grant_is_removed_and_reissued() {
        let fx = fixture();
        let signer = CountingSigner::new();
        let first = fx
            .manager
            .load_or_issue(fx.engine.clone(), &[C1], some(&signer), None)
            .await
            .unwrap();

        fx.clock.advance(366 * SECONDS_PER_DAY);
        let second = fx
            .manager
            .load_or_issue(fx.engine.clone(), &[C1], some(&signer), None)
            .await
            .unwrap();

        assert_eq!(signer.prompts(), 2);
        assert_ne!(second.public_key(), first.public_key());
        assert_eq!(second.issued_at(), T0 + 366 * SECONDS_PER_DAY);

        let ops = fx.store.ops();
        let remove_at = ops.iter().position(|o| *o == "remove").unwrap();
        let last_set = ops.iter().rposition(|o| *o == "set").unwrap();
        assert_eq!(fx.store.count("remove"), 1);
        assert_eq!(fx.store.count("set"), 2);
        assert!(remove_at < last_set);
    }

    #[tokio::test]
    async fn test_expiry_boundary() {
        let fx = fixture();
        let signer = CountingSigner::new();
        let window = 365 * SECONDS_PER_DAY;
        fx.manager
            .load_or_issue(fx.engine.clone(), &[C1], some(&signer), None)
            .await
            .unwrap();

        fx.clock.set(T0 + window - 1);
        fx.manager
            .load_or_issue(fx.engine.clone(), &[C1], some(&signer), None)
            .await
            .unwrap();
        assert_eq!(signer.prompts(), 1);

        fx.clock.set(T0 + window + 1);
        fx.manager
            .load_or_issue(fx.engine.clone(), &[C1], some(&signer), None)
            .await
            .unwrap();
        assert_eq!(signer.prompts(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_entry_triggers_fresh_issue() {
        let fx = fixture();
        let signer = CountingSigner::new();
        let key = derive(
            &GrantConfig::default().key_namespace,
            &signer.inner.wallet_address(),
            &[C1],
            None,
        );
        fx.store.inner.set(key.as_str(), "{{ definitely not a grant").await.unwrap();

        let auth = fx
            .manager
            .load_or_issue(fx.engine.clone(), &[C1], some(&signer), None)
            .await
            .unwrap();
        assert_eq!(signer.prompts(), 1);

        let stored = fx.store.inner.get(key.as_str()).await.unwrap().unwrap();
        assert_eq!(DecryptionAuthorization::deserialize(&stored).unwrap(), auth);
    }

    #[tokio::test]
    async fn test_declined_signature_surfaces_and_can_retry() {
        let fx = fixture();
        let signer = CountingSigner::new();
        signer.decline.store(true, Ordering::SeqCst);

        let err = fx
            .manager
            .load_or_issue(fx.engine.clone(), &[C1], some(&signer), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GrantError::SignatureDeclined(_)));
        assert_eq!(fx.store.count("set"), 0);

        signer.decline.store(false, Ordering::SeqCst);
        fx.manager
            .load_or_issue(fx.engine.clone(), &[C1], some(&signer), None)
            .await
            .unwrap();
        assert_eq!(signer.prompts(), 2);
        assert_eq!(fx.store.count("set"), 1);
    }

    #[tokio::test]
    async fn test_missing_signer() {
        let fx = fixture();
        let err = fx
            .manager
            .load_or_issue(fx.engine.clone(), &[C1], None, None)
            .await
            .unwrap_err();
        assert_eq!(err, GrantError::SignerUnavailable);
    }

    #[tokio::test]
    async fn test_empty_scope_rejected() {
        let fx = fixture();
        let signer = CountingSigner::new();
        let err = fx
            .manager
            .load_or_issue(fx.engine.clone(), &[], some(&signer), None)
            .await
            .unwrap_err();
        assert_eq!(err, GrantError::EmptyScope);
        assert_eq!(signer.prompts(), 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_still_returns_grant() {
        let fx = fixture_with(RecordingStore {
            fail_writes: true,
            ..Default::default()
        });
        let signer = CountingSigner::new();

        let auth = fx
            .manager
            .load_or_issue(fx.engine.clone(), &[C1], some(&signer), None)
            .await
            .unwrap();
        assert!(auth.verify_signature().is_ok());
        assert_eq!(fx.store.count("set"), 1);
    }

    #[tokio::test]
    async fn test_supplied_keypair_is_used_and_keyed() {
        let fx = fixture();
        let signer = CountingSigner::new();
        let kp = EphemeralKeyPair::generate();

        let auth = fx
            .manager
            .load_or_issue(fx.engine.clone(), &[C1], some(&signer), Some(kp.clone()))
            .await
            .unwrap();
        assert_eq!(auth.public_key(), kp.public_key);
        assert_eq!(auth.private_key(), &kp.private_key);

        // A request without the keypair derives a different key.
        fx.manager
            .load_or_issue(fx.engine.clone(), &[C1], some(&signer), None)
            .await
            .unwrap();
        assert_eq!(signer.prompts(), 2);

        // Same keypair again hits the cache.
        fx.manager
            .load_or_issue(fx.engine.clone(), &[C1], some(&signer), Some(kp))
            .await
            .unwrap();
        assert_eq!(signer.prompts(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_same_scope_prompts_once() {
        let fx = fixture();
        let signer = CountingSigner::with_delay(Duration::from_millis(50));

        let (a, b, c) = tokio::join!(
            fx.manager.load_or_issue(fx.engine.clone(), &[C1], some(&signer), None),
            fx.manager.load_or_issue(fx.engine.clone(), &[C1], some(&signer), None),
            fx.manager.load_or_issue(fx.engine.clone(), &[C1], some(&signer), None),
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert_eq!(signer.prompts(), 1);
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(fx.store.count("set"), 1);
        assert!(fx.manager.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_different_scopes_are_independent() {
        let fx = fixture();
        let signer = CountingSigner::with_delay(Duration::from_millis(20));

        let (a, b) = tokio::join!(
            fx.manager.load_or_issue(fx.engine.clone(), &[C1], some(&signer), None),
            fx.manager.load_or_issue(fx.engine.clone(), &[C2], some(&signer), None),
        );
        assert_eq!(signer.prompts(), 2);
        assert_ne!(a.unwrap().public_key(), b.unwrap().public_key());
    }

    #[tokio::test]
    async fn test_concurrent_declines_share_error() {
        let fx = fixture();
        let signer = CountingSigner::with_delay(Duration::from_millis(20));
        signer.decline.store(true, Ordering::SeqCst);

        let (a, b) = tokio::join!(
            fx.manager.load_or_issue(fx.engine.clone(), &[C1], some(&signer), None),
            fx.manager.load_or_issue(fx.engine.clone(), &[C1], some(&signer), None),
        );
        assert!(matches!(a, Err(GrantError::SignatureDeclined(_))));
        assert_eq!(a, b);
        assert_eq!(signer.prompts(), 1);
        assert!(fx.manager.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_scope_change_discards_result_but_keeps_cache() {
        let fx = fixture();
        let signer = CountingSigner::with_delay(Duration::from_millis(50));
        let tracker = ScopeTracker::new();
        let ticket = tracker.ticket();

        let (result, _) = tokio::join!(
            fx.manager
                .load_or_issue_scoped(&ticket, fx.engine.clone(), &[C1], some(&signer), None),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                tracker.advance();
            }
        );
        assert_eq!(result.unwrap_err(), GrantError::StaleScope);

        let cached = fx
            .manager
            .load_cached(&[C1], Some(signer.as_ref() as &dyn StructuredSigner), None)
            .await
            .unwrap();
        assert!(cached.is_some());
        assert_eq!(signer.prompts(), 1);
    }

    #[tokio::test]
    async fn test_stale_ticket_never_prompts() {
        let fx = fixture();
        let signer = CountingSigner::new();
        let tracker = ScopeTracker::new();
        let old = tracker.ticket();
        let current = tracker.advance();

        let err = fx
            .manager
            .load_or_issue_scoped(&old, fx.engine.clone(), &[C1], some(&signer), None)
            .await
            .unwrap_err();
        assert_eq!(err, GrantError::StaleScope);
        assert_eq!(signer.prompts(), 0);

        fx.manager
            .load_or_issue_scoped(&current, fx.engine.clone(), &[C1], some(&signer), None)
            .await
            .unwrap();
        assert_eq!(signer.prompts(), 1);
    }

    #[tokio::test]
    async fn test_load_cached_never_prompts() {
        let fx = fixture();
        let signer = CountingSigner::new();
        let as_dyn = Some(signer.as_ref() as &dyn StructuredSigner);

        assert!(fx.manager.load_cached(&[C1], as_dyn, None).await.unwrap().is_none());
        assert_eq!(signer.prompts(), 0);

        fx.manager
            .load_or_issue(fx.engine.clone(), &[C1], some(&signer), None)
            .await
            .unwrap();
        assert!(fx.manager.load_cached(&[C1], as_dyn, None).await.unwrap().is_some());
        assert_eq!(signer.prompts(), 1);
    }

    #[tokio::test]
    async fn test_prune_removes_expired_and_corrupt() {
        let fx = fixture();
        let signer = CountingSigner::new();
        fx.manager
            .load_or_issue(fx.engine.clone(), &[C1], some(&signer), None)
            .await
            .unwrap();
        fx.store
            .inner
            .set("fhevm_decryption_signature_junk", "garbage")
            .await
            .unwrap();
        fx.store.inner.set("unrelated", "keep me").await.unwrap();

        assert_eq!(fx.manager.prune().await.unwrap(), 1);

        fx.clock.advance(400 * SECONDS_PER_DAY);
        assert_eq!(fx.manager.prune().await.unwrap(), 1);

        let keys = fx.store.inner.keys().await.unwrap();
        assert_eq!(keys, vec!["unrelated".to_string()]);
    }

    #[tokio::test]
    async fn test_abandoned_request_settles_and_clears() {
        let fx = fixture();
        let signer = GatedSigner::new();
        let as_dyn = Some(signer.clone() as Arc<dyn StructuredSigner>);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            fx.manager
                .load_or_issue(fx.engine.clone(), &[C1], as_dyn.clone(), None),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(fx.manager.in_flight().len(), 1);

        // The prompt is answered a year later, after everyone left.
        fx.clock.advance(366 * SECONDS_PER_DAY);
        signer.release();
        for _ in 0..100 {
            if fx.manager.in_flight().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(fx.manager.in_flight().is_empty());
        assert_eq!(fx.store.count("set"), 1);

        let auth = fx
            .manager
            .load_or_issue(fx.engine.clone(), &[C1], as_dyn, None)
            .await
            .unwrap();
        assert!(auth.is_valid_at(fx.clock.now()));
        assert_eq!(auth.issued_at(), T0 + 366 * SECONDS_PER_DAY);
        assert_eq!(signer.prompts(), 2);
    }

    #[tokio::test]
    async fn test_joined_grant_expired_on_arrival_is_reissued() {
        let fx = fixture();
        let signer = GatedSigner::new();

        let (result, _) = tokio::join!(
            fx.manager.load_or_issue(
                fx.engine.clone(),
                &[C1],
                Some(signer.clone() as Arc<dyn StructuredSigner>),
                None
            ),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                fx.clock.advance(366 * SECONDS_PER_DAY);
                signer.release();
            }
        );

        let auth = result.unwrap();
        assert!(auth.is_valid_at(fx.clock.now()));
        assert_eq!(auth.issued_at(), T0 + 366 * SECONDS_PER_DAY);
        assert_eq!(signer.prompts(), 2);
        assert!(fx.manager.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_account_switch_mid_issue_is_not_cached() {
        let fx = fixture();
        let signer = Arc::new(SwitchingSigner {
            first: LocalWalletSigner::random(),
            second: LocalWalletSigner::random(),
            lookups: AtomicUsize::new(0),
        });
        let as_dyn = Some(signer.clone() as Arc<dyn StructuredSigner>);

        let err = fx
            .manager
            .load_or_issue(fx.engine.clone(), &[C1], as_dyn.clone(), None)
            .await
            .unwrap_err();
        assert_eq!(err, GrantError::SignerMismatch);
        assert_eq!(signer.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(fx.store.count("set"), 0);

        let auth = fx
            .manager
            .load_or_issue(fx.engine.clone(), &[C1], as_dyn, None)
            .await
            .unwrap();
        assert_eq!(auth.granted_by(), signer.second.wallet_address());

        let key = derive(
            &GrantConfig::default().key_namespace,
            &signer.second.wallet_address(),
            &[C1],
            None,
        );
        let stored = fx.store.inner.get(key.as_str()).await.unwrap().unwrap();
        assert_eq!(DecryptionAuthorization::deserialize(&stored).unwrap(), auth);
    }

    #[tokio::test]
    async fn test_grant_survives_restart_with_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(T0));
        let engine: Arc<dyn DecryptionEngine> =
            Arc::new(LocalEngine::new(&DomainConfig::default(), clock.clone()));
        let signer = CountingSigner::new();

        let first = {
            let store = Arc::new(FileStore::open(dir.path(), "anonexam_").await);
            let manager = AuthorizationManager::new(store, clock.clone(), GrantConfig::default());
            manager
                .load_or_issue(engine.clone(), &[C1, C2], some(&signer), None)
                .await
                .unwrap()
        };

        clock.advance(30 * SECONDS_PER_DAY);
        let store = Arc::new(FileStore::open(dir.path(), "anonexam_").await);
        let manager = AuthorizationManager::new(store, clock.clone(), GrantConfig::default());
        let second = manager
            .load_or_issue(engine.clone(), &[C2, C1], some(&signer), None)
            .await
            .unwrap();

        assert_eq!(signer.prompts(), 1);
        assert_eq!(second, first);
        assert_eq!(second.private_key().expose(), first.private_key().expose());
        assert!(second.verify_signature().is_ok());
    }
}
