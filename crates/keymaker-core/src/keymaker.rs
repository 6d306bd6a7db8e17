//! Main-key controller.
//!
//! Holds the in-memory main key, chooses which protectors persist it, and
//! runs every store-touching operation on one dedicated serial worker thread.
//! The synchronous [`Keymaker::main_key`] accessor is the one exception: it
//! may unseal the `None` cyphertext (or bootstrap a fresh key) on the
//! caller's thread, serialized against the worker by the control lock.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::autolock::{Autolocker, CountdownAutolocker};
use crate::error::{KeymakerError, ProtectorError};
use crate::main_key::MainKey;
use crate::protection::{
    NoneProtection, Protector, ProtectorKind, RandomPinProtection, BIO_ENCLAVE_SLOT,
    RANDOM_PIN_SECRET_SLOT,
};
use crate::settings::KeymakerSettings;
use crate::store::SecretStore;
use crate::transformer::TransformerRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeymakerEvent {
    /// A significant protector is active and the key is not in memory; the
    /// host should prompt the user and call `obtain_main_key`.
    RequestMainKey,
    ObtainedMainKey,
    ErrorObtainingMainKey(String),
    RemovedMainKeyFromMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// Consecutive failed PIN unlocks, `u32` little-endian. Kept in the store so
/// the count survives restarts.
pub const FAILED_UNLOCKS_SLOT: &str = "Keymaker.failedUnlocks";

type Observer = Arc<dyn Fn(&KeymakerEvent) + Send + Sync>;
type Job = Box<dyn FnOnce(&Core) + Send>;

struct Core {
    store: Arc<dyn SecretStore>,
    autolocker: Option<Arc<dyn Autolocker>>,
    transformers: Arc<TransformerRegistry>,
    main_key: RwLock<Option<MainKey>>,
    // App-key cache filled by `obtain_main_key_background`; independent of
    // the lock state of `main_key`.
    background_key: RwLock<Option<MainKey>>,
    control: ReentrantMutex<()>,
    observers: Mutex<Vec<(u64, Observer)>>,
    next_subscription: AtomicU64,
    max_failed_unlocks: u32,
}

pub struct KeymakerBuilder {
    store: Arc<dyn SecretStore>,
    autolocker: Option<Arc<dyn Autolocker>>,
    transformers: Arc<TransformerRegistry>,
    max_failed_unlocks: u32,
}

impl KeymakerBuilder {
    pub fn autolocker(mut self, autolocker: Arc<dyn Autolocker>) -> Self {
        self.autolocker = Some(autolocker);
        self
    }

    pub fn transformers(mut self, transformers: Arc<TransformerRegistry>) -> Self {
        self.transformers = transformers;
        self
    }

    /// Consecutive wrong PINs before the main key is wiped. 0 disables the limit.
    pub fn max_failed_unlocks(mut self, limit: u32) -> Self {
        self.max_failed_unlocks = limit;
        self
    }

    pub fn build(self) -> Result<Keymaker, KeymakerError> {
        let core = Arc::new(Core {
            store: self.store,
            autolocker: self.autolocker,
            transformers: self.transformers,
            main_key: RwLock::new(None),
            background_key: RwLock::new(None),
            control: ReentrantMutex::new(()),
            observers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            max_failed_unlocks: self.max_failed_unlocks,
        });

        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        let worker_core = Arc::clone(&core);
        thread::Builder::new()
            .name("keymaker-control".into())
            .spawn(move || {
                while let Some(job) = queue.blocking_recv() {
                    job(&worker_core);
                }
                debug!("keymaker control thread exiting");
            })
            .map_err(|e| KeymakerError::Worker(e.to_string()))?;

        Ok(Keymaker { core, jobs })
    }
}

/// Caller-owned controller; create one per key domain and pass it where needed.
pub struct Keymaker {
    core: Arc<Core>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl Keymaker {
    pub fn builder(store: Arc<dyn SecretStore>) -> KeymakerBuilder {
        KeymakerBuilder {
            store,
            autolocker: None,
            transformers: Arc::new(TransformerRegistry::new()),
            max_failed_unlocks: 0,
        }
    }

    pub fn from_settings(
        store: Arc<dyn SecretStore>,
        settings: &KeymakerSettings,
    ) -> Result<(Self, Arc<CountdownAutolocker>), KeymakerError> {
        let autolocker = Arc::new(CountdownAutolocker::new(settings.autolock));
        let keymaker = Self::builder(store)
            .autolocker(autolocker.clone())
            .max_failed_unlocks(settings.max_failed_unlocks)
            .build()?;
        Ok((keymaker, autolocker))
    }

    pub fn transformers(&self) -> &Arc<TransformerRegistry> {
        &self.core.transformers
    }

    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&KeymakerEvent) + Send + Sync + 'static,
    {
        let id = self.core.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.core.observers.lock().push((id, Arc::new(observer)));
        Subscription(id)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut observers = self.core.observers.lock();
        let before = observers.len();
        observers.retain(|(id, _)| *id != subscription.0);
        observers.len() != before
    }

    /// Current key, loading it without user interaction when possible.
    ///
    /// Returns `None` and emits [`KeymakerEvent::RequestMainKey`] when a
    /// significant protector guards the key. Do not cache the result across
    /// operations; lock and wipe revoke it.
    pub fn main_key(&self) -> Option<MainKey> {
        self.core.current_key()
    }

    /// Loaded key if any; otherwise the app-key path when `protector` is
    /// given, or [`Keymaker::main_key`] when it is not.
    pub fn main_key_by(&self, protector: Option<&RandomPinProtection>) -> Option<MainKey> {
        if let Some(key) = self.core.loaded() {
            return Some(key);
        }
        match protector {
            Some(protector) => self.obtain_main_key_background(protector),
            None => self.main_key(),
        }
    }

    /// Unlocks with the app key on the caller's thread without touching the
    /// lock state or emitting events. The result is cached until the
    /// random-pin protector is deactivated or the key is wiped.
    pub fn obtain_main_key_background(&self, protector: &RandomPinProtection) -> Option<MainKey> {
        self.core.obtain_background(protector)
    }

    /// True while no random-pin protector is active, i.e. the main key is
    /// only reachable through the user's own protectors.
    pub fn is_app_key_enabled(&self) -> bool {
        !self.is_protector_active(ProtectorKind::RandomPin)
    }

    pub fn is_main_key_in_memory(&self) -> bool {
        self.core.main_key.read().is_some()
    }

    pub fn is_protector_active(&self, kind: ProtectorKind) -> bool {
        self.core.is_active(kind).unwrap_or_else(|e| {
            warn!(%kind, error = %e, "could not read protector state");
            false
        })
    }

    pub fn active_protectors(&self) -> Vec<ProtectorKind> {
        ProtectorKind::ALL
            .into_iter()
            .filter(|kind| self.is_protector_active(*kind))
            .collect()
    }

    /// Unlock with an explicit protector. Resolves to the cached key if one
    /// is already loaded, `None` if the protector has no cyphertext or its
    /// secret is wrong.
    pub fn obtain_main_key<P>(&self, protector: P) -> impl Future<Output = Option<MainKey>> + Send + 'static
    where
        P: Protector + 'static,
    {
        let pending = self.dispatch(move |core| core.obtain(&protector));
        async move { pending.await.ok().flatten() }
    }

    /// Checks that `protector` opens its persisted cyphertext without
    /// touching the in-memory key.
    pub fn verify<P>(&self, protector: P) -> impl Future<Output = Result<(), ProtectorError>> + Send + 'static
    where
        P: Protector + 'static,
    {
        let pending = self.dispatch(move |core| core.verify(&protector));
        async move {
            pending
                .await
                .unwrap_or_else(|_| Err(ProtectorError::UnlockFailed("controller shut down".into())))
        }
    }

    /// Seal the current key under `protector`. Significant protectors also
    /// remove the `None` cyphertext.
    pub fn activate<P>(&self, protector: P) -> impl Future<Output = bool> + Send + 'static
    where
        P: Protector + 'static,
    {
        let pending = self.dispatch(move |core| core.activate(&protector));
        async move { report(pending.await, "activate") }
    }

    /// Remove `protector`'s cyphertext. When no significant protector
    /// remains, the loaded key is sealed under `None` again.
    pub fn deactivate<P>(&self, protector: P) -> impl Future<Output = bool> + Send + 'static
    where
        P: Protector + 'static,
    {
        let pending = self.dispatch(move |core| core.deactivate(&protector));
        async move { report(pending.await, "deactivate") }
    }

    /// Full local-credential reset: every protector's cyphertext and the
    /// in-memory key are dropped.
    pub fn wipe_main_key(&self) -> impl Future<Output = ()> + Send + 'static {
        let pending = self.dispatch(|core| core.wipe());
        async move {
            if let Ok(Err(e)) = pending.await {
                error!(error = %e, "wipe left cyphertext behind");
            }
        }
    }

    /// Drops the in-memory key only.
    pub fn lock_the_app(&self) {
        let _control = self.core.control.lock();
        info!("locking app");
        self.core.set_key(None);
    }

    /// Installs a key obtained out-of-band (cross-process hand-over). Skips
    /// the obtention flow and does not emit events.
    pub fn force_inject_main_key(&self, key: MainKey) {
        let _control = self.core.control.lock();
        self.core.set_key(Some(key));
    }

    /// Treats "no protector active" as an external wipe.
    pub fn main_key_exists(&self) -> bool {
        self.core.main_key_exists()
    }

    pub fn will_enter_foreground(&self) -> bool {
        self.main_key_exists()
    }

    pub fn did_become_active(&self) -> bool {
        self.main_key_exists()
    }

    pub fn reset_autolock(&self) {
        if let Some(autolocker) = &self.core.autolocker {
            autolocker.release_countdown();
        }
    }

    /// Call when the app leaves the foreground.
    pub fn update_autolock_countdown_start(&self) {
        if let Some(autolocker) = &self.core.autolocker {
            autolocker.start_countdown();
        }
        let _ = self.core.current_key();
    }

    fn dispatch<R, F>(&self, work: F) -> impl Future<Output = Result<R, KeymakerError>> + Send + 'static
    where
        F: FnOnce(&Core) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let queued = self
            .jobs
            .send(Box::new(move |core: &Core| {
                let _ = reply.send(work(core));
            }))
            .map_err(|_| KeymakerError::ControllerGone);
        async move {
            queued?;
            response.await.map_err(|_| KeymakerError::ControllerGone)
        }
    }
}

fn report(outcome: Result<Result<(), KeymakerError>, KeymakerError>, op: &str) -> bool {
    match outcome.and_then(|inner| inner) {
        Ok(()) => true,
        Err(e) => {
            warn!(op, error = %e, "protector operation failed");
            false
        }
    }
}

impl Core {
    fn emit(&self, event: KeymakerEvent) {
        let observers: Vec<Observer> = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(&event);
        }
    }

    fn loaded(&self) -> Option<MainKey> {
        self.main_key.read().clone()
    }

    fn set_key(&self, key: Option<MainKey>) {
        let had_key = {
            let mut slot = self.main_key.write();
            let had_key = slot.is_some();
            *slot = key.clone();
            had_key
        };
        match key {
            Some(key) => {
                if let Some(autolocker) = &self.autolocker {
                    autolocker.release_countdown();
                }
                self.transformers.rebind_all(Some(&key));
            }
            None => {
                self.transformers.rebind_all(None);
                if had_key {
                    debug!("main key removed from memory");
                    self.emit(KeymakerEvent::RemovedMainKeyFromMemory);
                }
            }
        }
    }

    fn drop_if_autolocked(&self) {
        let due = self
            .autolocker
            .as_ref()
            .is_some_and(|autolocker| autolocker.should_autolock_now());
        if due && self.main_key.read().is_some() {
            info!("autolock timeout reached");
            self.set_key(None);
        }
    }

    fn is_active(&self, kind: ProtectorKind) -> Result<bool, KeymakerError> {
        Ok(kind.is_active(self.store.as_ref())?)
    }

    fn any_significant_active(&self) -> Result<bool, KeymakerError> {
        for kind in ProtectorKind::ALL.into_iter().filter(|k| k.is_significant()) {
            if self.is_active(kind)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn current_key(&self) -> Option<MainKey> {
        let _control = self.control.lock();
        self.drop_if_autolocked();
        if let Some(key) = self.loaded() {
            return Some(key);
        }
        match self.provoke_main_key_obtention() {
            Ok(key) => {
                self.set_key(Some(key.clone()));
                Some(key)
            }
            Err(KeymakerError::NoKeyAvailable) => None,
            Err(e) => {
                error!(error = %e, "main key could not be loaded");
                self.emit(KeymakerEvent::ErrorObtainingMainKey(e.to_string()));
                None
            }
        }
    }

    fn provoke_main_key_obtention(&self) -> Result<MainKey, KeymakerError> {
        if self.any_significant_active()? {
            debug!("significant protector active; requesting main key");
            self.emit(KeymakerEvent::RequestMainKey);
            if let Err(e) = NoneProtection.remove_persisted_cyphertext(self.store.as_ref()) {
                warn!(error = %e, "could not remove None cyphertext beside significant protector");
            }
            return Err(KeymakerError::NoKeyAvailable);
        }

        if let Some(cyphertext) = NoneProtection.cyphertext(self.store.as_ref())? {
            return NoneProtection.unlock(&cyphertext).map_err(|e| {
                error!(error = %e, "None cyphertext present but unopenable");
                KeymakerError::from(e)
            });
        }

        self.bootstrap()
    }

    fn bootstrap(&self) -> Result<MainKey, KeymakerError> {
        self.remove_protector_slots()?;
        let key = MainKey::generate();
        let cyphertext = NoneProtection.lock(&key)?;
        NoneProtection.persist(self.store.as_ref(), &cyphertext)?;
        info!("generated new main key under None protection");
        Ok(key)
    }

    fn obtain(&self, protector: &dyn Protector) -> Option<MainKey> {
        let kind = protector.kind();
        let cyphertext = {
            let _control = self.control.lock();
            self.drop_if_autolocked();
            if let Some(key) = self.loaded() {
                return Some(key);
            }
            match protector.cyphertext(self.store.as_ref()) {
                Ok(Some(cyphertext)) => cyphertext,
                Ok(None) => {
                    debug!(%kind, "no cyphertext for protector");
                    return None;
                }
                Err(e) => {
                    warn!(%kind, error = %e, "could not read protector cyphertext");
                    self.emit(KeymakerEvent::ErrorObtainingMainKey(e.to_string()));
                    return None;
                }
            }
        };

        // Unlocking may wait on a person or run a slow KDF; no lock is held
        // so the synchronous accessor stays responsive.
        let unlocked = protector.unlock(&cyphertext);

        let _control = self.control.lock();
        match unlocked {
            Ok(key) => {
                if let Some(current) = self.loaded() {
                    return Some(current);
                }
                match protector.cyphertext(self.store.as_ref()) {
                    Ok(Some(now)) if now == cyphertext => {}
                    _ => {
                        warn!(%kind, "cyphertext changed while unlocking; discarding key");
                        return None;
                    }
                }
                self.reset_failed_unlocks();
                self.set_key(Some(key.clone()));
                info!(%kind, "main key obtained");
                self.emit(KeymakerEvent::ObtainedMainKey);
                Some(key)
            }
            Err(e) => {
                warn!(%kind, error = %e, "unlock failed");
                self.emit(KeymakerEvent::ErrorObtainingMainKey(e.to_string()));
                if kind.counts_failed_unlocks() {
                    self.record_failed_unlock();
                }
                None
            }
        }
    }

    fn obtain_background(&self, protector: &RandomPinProtection) -> Option<MainKey> {
        if let Some(key) = self.background_key.read().clone() {
            return Some(key);
        }
        let cyphertext = match protector.cyphertext(self.store.as_ref()) {
            Ok(Some(cyphertext)) => cyphertext,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "could not read app-key cyphertext");
                return None;
            }
        };
        match protector.unlock(&cyphertext) {
            Ok(key) => {
                debug!("main key obtained in background");
                *self.background_key.write() = Some(key.clone());
                Some(key)
            }
            Err(e) => {
                warn!(error = %e, "app-key unlock failed");
                None
            }
        }
    }

    fn failed_unlock_count(&self) -> u32 {
        match self.store.get(FAILED_UNLOCKS_SLOT) {
            Ok(Some(raw)) => match <[u8; 4]>::try_from(raw.as_slice()) {
                Ok(bytes) => u32::from_le_bytes(bytes),
                Err(_) => {
                    warn!(len = raw.len(), "malformed failed-unlock counter");
                    0
                }
            },
            Ok(None) => 0,
            Err(e) => {
                warn!(error = %e, "could not read failed-unlock counter");
                0
            }
        }
    }

    fn reset_failed_unlocks(&self) {
        if let Err(e) = self.store.remove(FAILED_UNLOCKS_SLOT) {
            warn!(error = %e, "could not reset failed-unlock counter");
        }
    }

    fn record_failed_unlock(&self) {
        if self.max_failed_unlocks == 0 {
            return;
        }
        let failures = self.failed_unlock_count().saturating_add(1);
        if let Err(e) = self.store.set(FAILED_UNLOCKS_SLOT, &failures.to_le_bytes()) {
            warn!(error = %e, "could not persist failed-unlock counter");
        }
        if failures >= self.max_failed_unlocks {
            warn!(failures, "failed unlock limit reached; wiping main key");
            if let Err(e) = self.wipe() {
                error!(error = %e, "wipe after failed unlocks incomplete");
            }
        }
    }

    fn verify(&self, protector: &dyn Protector) -> Result<(), ProtectorError> {
        let cyphertext = {
            let _control = self.control.lock();
            protector
                .cyphertext(self.store.as_ref())?
                .ok_or(ProtectorError::NoCyphertext)?
        };
        protector.unlock(&cyphertext).map(|_| ())
    }

    fn activate(&self, protector: &dyn Protector) -> Result<(), KeymakerError> {
        let key = self.current_key().ok_or(KeymakerError::NoKeyAvailable)?;
        let cyphertext = protector.lock(&key)?;

        let _control = self.control.lock();
        if self.loaded().is_some_and(|current| current != key) {
            warn!(kind = %protector.kind(), "main key replaced while sealing; not activating");
            return Err(KeymakerError::NoKeyAvailable);
        }
        protector.persist(self.store.as_ref(), &cyphertext)?;
        if protector.is_significant() {
            NoneProtection.remove_persisted_cyphertext(self.store.as_ref())?;
        }
        info!(kind = %protector.kind(), "protector activated");
        Ok(())
    }

    fn deactivate(&self, protector: &dyn Protector) -> Result<(), KeymakerError> {
        let _control = self.control.lock();
        let kind = protector.kind();
        let others_significant = ProtectorKind::ALL
            .into_iter()
            .filter(|k| k.is_significant() && *k != kind)
            .map(|k| self.is_active(k))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .any(|active| active);

        let background = if kind == ProtectorKind::RandomPin {
            self.background_key.write().take()
        } else {
            None
        };

        if others_significant {
            protector.remove_persisted_cyphertext(self.store.as_ref())?;
            info!(%kind, "protector deactivated");
            return Ok(());
        }

        // Falling back to None needs the key in memory; refuse rather than
        // leave the store with no way back to the key.
        let key = self
            .loaded()
            .or(background)
            .ok_or(KeymakerError::NoKeyAvailable)?;
        protector.remove_persisted_cyphertext(self.store.as_ref())?;
        let cyphertext = NoneProtection.lock(&key)?;
        NoneProtection.persist(self.store.as_ref(), &cyphertext)?;
        info!(%kind, "protector deactivated; None protection restored");
        Ok(())
    }

    fn remove_protector_slots(&self) -> Result<(), KeymakerError> {
        for kind in ProtectorKind::ALL {
            kind.remove_cyphertext(self.store.as_ref())?;
        }
        self.store.remove(BIO_ENCLAVE_SLOT)?;
        Ok(())
    }

    fn wipe(&self) -> Result<(), KeymakerError> {
        let _control = self.control.lock();
        info!("wiping main key");
        let removed = self
            .remove_protector_slots()
            .and_then(|()| Ok(self.store.remove(RANDOM_PIN_SECRET_SLOT)?))
            .and_then(|()| Ok(self.store.remove(FAILED_UNLOCKS_SLOT)?));
        *self.background_key.write() = None;
        self.set_key(None);
        removed
    }

    fn main_key_exists(&self) -> bool {
        let _control = self.control.lock();
        let mut any_active = false;
        for kind in ProtectorKind::ALL {
            match self.is_active(kind) {
                Ok(true) => {
                    any_active = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(%kind, error = %e, "could not read protector state; leaving key state unchanged");
                    return true;
                }
            }
        }
        if !any_active {
            warn!("no protector cyphertext found; treating as external wipe");
            self.set_key(None);
            self.emit(KeymakerEvent::RequestMainKey);
            return false;
        }
        if self.current_key().is_some() {
            if let Some(autolocker) = &self.autolocker {
                autolocker.release_countdown();
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autolock::{AutolockTimeout, ManualClock};
    use crate::crypto::KdfParams;
    use crate::protection::PinProtection;
    use crate::error::StoreError;
    use crate::store::{EntryPolicy, MemoryStore};
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn pin(code: &str) -> PinProtection {
        PinProtection::with_params(
            code,
            KdfParams {
                memory_kib: 1024,
                iterations: 1,
                parallelism: 1,
            },
        )
    }

    /// Memory store whose reads or removals can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_reads: AtomicBool,
        fail_removes: AtomicBool,
    }

    impl SecretStore for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Read {
                    key: key.to_string(),
                    reason: "unavailable".into(),
                });
            }
            self.inner.get(key)
        }

        fn set_with_policy(&self, key: &str, value: &[u8], policy: EntryPolicy) -> Result<(), StoreError> {
            self.inner.set_with_policy(key, value, policy)
        }

        fn remove(&self, key: &str) -> Result<(), StoreError> {
            if self.fail_removes.load(Ordering::SeqCst) {
                return Err(StoreError::Delete {
                    key: key.to_string(),
                    reason: "unavailable".into(),
                });
            }
            self.inner.remove(key)
        }

        fn remove_all(&self) -> Result<(), StoreError> {
            self.inner.remove_all()
        }
    }

    fn recorder(keymaker: &Keymaker) -> Arc<Mutex<Vec<KeymakerEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        keymaker.subscribe(move |event| sink.lock().push(event.clone()));
        events
    }

    #[test]
    fn first_read_bootstraps_under_none() {
        let store = Arc::new(MemoryStore::new());
        let keymaker = Keymaker::builder(store.clone()).build().unwrap();
        let key = keymaker.main_key().expect("bootstrap key");
        assert_eq!(store.keys(), vec![ProtectorKind::None.slot().to_string()]);
        assert_eq!(keymaker.main_key(), Some(key));
    }

    #[test]
    fn none_cyphertext_reloads_same_key() {
        let store = Arc::new(MemoryStore::new());
        let first = Keymaker::builder(store.clone()).build().unwrap();
        let key = first.main_key().unwrap();
        drop(first);
        let second = Keymaker::builder(store).build().unwrap();
        assert_eq!(second.main_key(), Some(key));
    }

    #[test]
    fn corrupt_none_cyphertext_is_reported_not_replaced() {
        let store = Arc::new(MemoryStore::new());
        store.set(ProtectorKind::None.slot(), b"garbage").unwrap();
        let keymaker = Keymaker::builder(store.clone()).build().unwrap();
        let events = recorder(&keymaker);
        assert_eq!(keymaker.main_key(), None);
        assert_eq!(store.get(ProtectorKind::None.slot()).unwrap().unwrap(), b"garbage");
        assert!(matches!(
            events.lock().as_slice(),
            [KeymakerEvent::ErrorObtainingMainKey(_)]
        ));
    }

    #[tokio::test]
    async fn activate_then_deactivate_is_ordered() {
        let store = Arc::new(MemoryStore::new());
        let keymaker = Keymaker::builder(store.clone()).build().unwrap();
        let key = keymaker.main_key().unwrap();

        let activated = keymaker.activate(pin("1234"));
        let deactivated = keymaker.deactivate(pin("1234"));
        assert!(activated.await);
        assert!(deactivated.await);

        assert!(!keymaker.is_protector_active(ProtectorKind::Pin));
        assert!(keymaker.is_protector_active(ProtectorKind::None));
        keymaker.lock_the_app();
        assert_eq!(keymaker.main_key(), Some(key));
    }

    #[tokio::test]
    async fn deactivate_without_loaded_key_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let keymaker = Keymaker::builder(store).build().unwrap();
        keymaker.main_key().unwrap();
        assert!(keymaker.activate(pin("1234")).await);
        keymaker.lock_the_app();
        assert!(!keymaker.deactivate(pin("1234")).await);
        assert_eq!(keymaker.active_protectors(), vec![ProtectorKind::Pin]);
    }

    #[tokio::test]
    async fn failed_unlock_limit_wipes() {
        let store = Arc::new(MemoryStore::new());
        let keymaker = Keymaker::builder(store.clone())
            .max_failed_unlocks(2)
            .build()
            .unwrap();
        keymaker.main_key().unwrap();
        assert!(keymaker.activate(pin("1234")).await);
        keymaker.lock_the_app();

        assert!(keymaker.obtain_main_key(pin("0000")).await.is_none());
        assert!(keymaker.is_protector_active(ProtectorKind::Pin));
        assert!(keymaker.obtain_main_key(pin("1111")).await.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn successful_unlock_resets_failure_count() {
        let store = Arc::new(MemoryStore::new());
        let keymaker = Keymaker::builder(store)
            .max_failed_unlocks(2)
            .build()
            .unwrap();
        keymaker.main_key().unwrap();
        assert!(keymaker.activate(pin("1234")).await);
        keymaker.lock_the_app();

        assert!(keymaker.obtain_main_key(pin("0000")).await.is_none());
        assert!(keymaker.obtain_main_key(pin("1234")).await.is_some());
        keymaker.lock_the_app();
        assert!(keymaker.obtain_main_key(pin("0000")).await.is_none());
        assert!(keymaker.is_protector_active(ProtectorKind::Pin));
    }

    #[tokio::test]
    async fn verify_does_not_load_key() {
        let store = Arc::new(MemoryStore::new());
        let keymaker = Keymaker::builder(store).build().unwrap();
        keymaker.main_key().unwrap();
        assert!(keymaker.activate(pin("1234")).await);
        keymaker.lock_the_app();

        assert!(keymaker.verify(pin("1234")).await.is_ok());
        assert!(matches!(
            keymaker.verify(pin("9999")).await,
            Err(ProtectorError::UnlockFailed(_))
        ));
        assert!(!keymaker.is_main_key_in_memory());
        assert!(matches!(
            keymaker.verify(NoneProtection).await,
            Err(ProtectorError::NoCyphertext)
        ));
    }

    #[test]
    fn autolock_drops_and_reloads_none_key() {
        let clock = Arc::new(ManualClock::new());
        let autolocker = Arc::new(CountdownAutolocker::with_clock(
            AutolockTimeout::Minutes(1),
            clock.clone(),
        ));
        let keymaker = Keymaker::builder(Arc::new(MemoryStore::new()))
            .autolocker(autolocker.clone())
            .build()
            .unwrap();
        let events = recorder(&keymaker);
        let key = keymaker.main_key().unwrap();

        autolocker.start_countdown();
        clock.advance(Duration::from_secs(61));
        assert_eq!(keymaker.main_key(), Some(key));
        assert_eq!(
            events.lock().as_slice(),
            [KeymakerEvent::RemovedMainKeyFromMemory]
        );
        assert!(!autolocker.is_counting());
    }

    #[test]
    fn force_injected_key_is_served_silently() {
        let keymaker = Keymaker::builder(Arc::new(MemoryStore::new())).build().unwrap();
        let events = recorder(&keymaker);
        let key = MainKey::generate();
        keymaker.force_inject_main_key(key.clone());
        assert_eq!(keymaker.main_key(), Some(key));
        assert!(events.lock().is_empty());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let keymaker = Keymaker::builder(Arc::new(MemoryStore::new())).build().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let subscription = keymaker.subscribe(move |event| sink.lock().push(event.clone()));
        assert!(keymaker.unsubscribe(subscription));
        assert!(!keymaker.unsubscribe(subscription));
        keymaker.force_inject_main_key(MainKey::generate());
        keymaker.lock_the_app();
        assert!(events.lock().is_empty());
    }

    #[test]
    fn main_key_exists_detects_external_wipe() {
        let store = Arc::new(MemoryStore::new());
        let keymaker = Keymaker::builder(store.clone()).build().unwrap();
        keymaker.main_key().unwrap();
        assert!(keymaker.did_become_active());

        store.remove_all().unwrap();
        let events = recorder(&keymaker);
        assert!(!keymaker.will_enter_foreground());
        assert!(!keymaker.is_main_key_in_memory());
        assert_eq!(
            events.lock().as_slice(),
            [
                KeymakerEvent::RemovedMainKeyFromMemory,
                KeymakerEvent::RequestMainKey
            ]
        );
    }

    #[tokio::test]
    async fn wrong_pin_count_is_kept_in_store() {
        let store = Arc::new(MemoryStore::new());
        let keymaker = Keymaker::builder(store.clone())
            .max_failed_unlocks(5)
            .build()
            .unwrap();
        keymaker.main_key().unwrap();
        assert!(keymaker.activate(pin("1234")).await);
        keymaker.lock_the_app();

        assert!(keymaker.obtain_main_key(pin("0000")).await.is_none());
        assert!(keymaker.obtain_main_key(pin("0001")).await.is_none());
        assert_eq!(
            store.get(FAILED_UNLOCKS_SLOT).unwrap().unwrap(),
            2u32.to_le_bytes()
        );
        assert!(keymaker.obtain_main_key(pin("1234")).await.is_some());
        assert!(!store.contains(FAILED_UNLOCKS_SLOT));
    }

    #[tokio::test]
    async fn disabled_limit_never_writes_counter() {
        let store = Arc::new(MemoryStore::new());
        let keymaker = Keymaker::builder(store.clone()).build().unwrap();
        keymaker.main_key().unwrap();
        assert!(keymaker.activate(pin("1234")).await);
        keymaker.lock_the_app();
        for _ in 0..3 {
            assert!(keymaker.obtain_main_key(pin("0000")).await.is_none());
        }
        assert!(!store.contains(FAILED_UNLOCKS_SLOT));
        assert!(keymaker.is_protector_active(ProtectorKind::Pin));
    }

    #[tokio::test]
    async fn request_is_emitted_when_stale_none_cannot_be_removed() {
        let store = Arc::new(FlakyStore::default());
        let keymaker = Keymaker::builder(store.clone()).build().unwrap();
        keymaker.main_key().unwrap();
        let stale_none = store.inner.get(ProtectorKind::None.slot()).unwrap().unwrap();
        assert!(keymaker.activate(pin("1234")).await);
        keymaker.lock_the_app();

        store.inner.set(ProtectorKind::None.slot(), &stale_none).unwrap();
        store.fail_removes.store(true, Ordering::SeqCst);
        let events = recorder(&keymaker);
        assert_eq!(keymaker.main_key(), None);
        assert_eq!(events.lock().as_slice(), [KeymakerEvent::RequestMainKey]);
    }

    #[test]
    fn unreadable_store_is_not_taken_for_a_wipe() {
        let store = Arc::new(FlakyStore::default());
        let keymaker = Keymaker::builder(store.clone()).build().unwrap();
        let key = keymaker.main_key().unwrap();
        let events = recorder(&keymaker);

        store.fail_reads.store(true, Ordering::SeqCst);
        assert!(keymaker.will_enter_foreground());
        assert!(keymaker.is_main_key_in_memory());
        assert!(events.lock().is_empty());

        store.fail_reads.store(false, Ordering::SeqCst);
        assert_eq!(keymaker.main_key(), Some(key));
    }

    #[tokio::test]
    async fn background_key_is_cached_apart_from_lock_state() {
        let store = Arc::new(MemoryStore::new());
        let keymaker = Keymaker::builder(store.clone()).build().unwrap();
        let key = keymaker.main_key().unwrap();
        let app_key = RandomPinProtection::generate(store.as_ref()).unwrap();
        assert!(keymaker.is_app_key_enabled());
        assert!(keymaker.activate(pin("1234")).await);
        assert!(keymaker.activate(app_key).await);
        assert!(!keymaker.is_app_key_enabled());
        keymaker.lock_the_app();

        let events = recorder(&keymaker);
        let app_key = RandomPinProtection::load(store.as_ref()).unwrap().unwrap();
        assert_eq!(keymaker.main_key_by(Some(&app_key)), Some(key.clone()));
        assert!(!keymaker.is_main_key_in_memory());
        assert!(events.lock().is_empty());

        // Served from cache even once the cyphertext is gone.
        store.remove(ProtectorKind::RandomPin.slot()).unwrap();
        assert_eq!(keymaker.obtain_main_key_background(&app_key), Some(key));
        assert_eq!(keymaker.main_key_by(None), None);
    }

    #[tokio::test]
    async fn deactivating_app_key_clears_background_cache() {
        let store = Arc::new(MemoryStore::new());
        let keymaker = Keymaker::builder(store.clone()).build().unwrap();
        let key = keymaker.main_key().unwrap();
        let app_key = RandomPinProtection::generate(store.as_ref()).unwrap();
        assert!(keymaker.activate(app_key).await);
        keymaker.lock_the_app();

        let app_key = RandomPinProtection::load(store.as_ref()).unwrap().unwrap();
        assert_eq!(keymaker.obtain_main_key_background(&app_key), Some(key.clone()));

        // Last significant protector: falls back to None using the cached key.
        let removal = RandomPinProtection::load(store.as_ref()).unwrap().unwrap();
        assert!(keymaker.deactivate(removal).await);
        assert!(!store.contains(RANDOM_PIN_SECRET_SLOT));
        assert!(keymaker.is_protector_active(ProtectorKind::None));
        assert_eq!(keymaker.obtain_main_key_background(&app_key), None);
        assert_eq!(keymaker.main_key(), Some(key));
    }

    #[tokio::test]
    async fn wipe_drops_app_key_and_counter() {
        let store = Arc::new(MemoryStore::new());
        let keymaker = Keymaker::builder(store.clone())
            .max_failed_unlocks(5)
            .build()
            .unwrap();
        keymaker.main_key().unwrap();
        let app_key = RandomPinProtection::generate(store.as_ref()).unwrap();
        assert!(keymaker.activate(app_key).await);
        assert!(keymaker.activate(pin("1234")).await);
        keymaker.lock_the_app();
        assert!(keymaker.obtain_main_key(pin("0000")).await.is_none());
        let app_key = RandomPinProtection::load(store.as_ref()).unwrap().unwrap();
        assert!(keymaker.obtain_main_key_background(&app_key).is_some());

        keymaker.wipe_main_key().await;
        assert!(store.is_empty());
        assert_eq!(keymaker.obtain_main_key_background(&app_key), None);
    }
}
