//! Fan-out of one codec configuration over many interleaved streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use snafu::{ResultExt, Snafu};
use tokio::runtime::Handle;

use crate::assembler::Assembler;
use crate::config::{ConfigError, MultilineConfig, NoRuntimeSnafu};
use crate::event::MergedEvent;
use crate::internal_events::{
    emit, IdentityCreated, IdentityEvicted, IdentityMapFull, IdentityMapHighWater,
};
use crate::map_cleaner::{MapCleaner, SweepTarget};
use crate::sink::{EmissionContext, Listener};

/// The identity map could not take another stream: it is at capacity and a
/// cleanup pass freed nothing.
#[derive(Debug, Snafu)]
#[snafu(display("identity map is full: {} identities in use and none stale", max))]
pub struct CapacityExceeded {
    max: usize,
}

const fn default_max_identities() -> usize {
    20_000
}

const fn default_evict_timeout() -> Duration {
    Duration::from_secs(3600)
}

const fn default_cleaner_interval() -> Duration {
    Duration::from_secs(300)
}

/// Builder for [`IdentityMapCodec`].
pub struct IdentityMapBuilder {
    config: MultilineConfig,
    max_identities: usize,
    evict_timeout: Duration,
    cleaner_interval: Duration,
    eviction_ctx: Option<EmissionContext>,
}

impl IdentityMapBuilder {
    /// Starts a builder over the given codec configuration with default
    /// capacity and eviction settings.
    pub fn new(config: MultilineConfig) -> Self {
        Self {
            config,
            max_identities: default_max_identities(),
            evict_timeout: default_evict_timeout(),
            cleaner_interval: default_cleaner_interval(),
            eviction_ctx: None,
        }
    }

    /// Ceiling on concurrently tracked stream identities.
    pub fn max_identities(mut self, max: usize) -> Self {
        self.max_identities = max;
        self
    }

    /// Idle time after which an identity becomes eligible for eviction.
    pub fn evict_timeout(mut self, timeout: Duration) -> Self {
        self.evict_timeout = timeout;
        self
    }

    /// Cadence of the background reaper.
    pub fn cleaner_interval(mut self, interval: Duration) -> Self {
        self.cleaner_interval = interval;
        self
    }

    /// Context used to flush evicted assemblers that have no auto-flush
    /// timer of their own.
    pub fn eviction_context(mut self, ctx: EmissionContext) -> Self {
        self.eviction_ctx = Some(ctx);
        self
    }

    /// Registers the base assembler and assembles the codec.
    ///
    /// Must run within a Tokio runtime: the reaper (and any auto-flush
    /// timers) need somewhere to live.
    pub fn build(self) -> Result<IdentityMapCodec, ConfigError> {
        let base = self.config.build()?;
        let runtime = Handle::try_current().context(NoRuntimeSnafu)?;
        let inner = Arc::<MapInner>::new_cyclic(|weak| {
            let sweep_target: Weak<dyn SweepTarget> = weak.clone();
            MapInner {
                cleaner: MapCleaner::new(self.cleaner_interval, runtime, sweep_target),
                base,
                map: Mutex::new(HashMap::new()),
                max_identities: self.max_identities,
                evict_timeout: self.evict_timeout,
                eviction_ctx: self.eviction_ctx,
                high_water_warned: AtomicBool::new(false),
            }
        });
        Ok(IdentityMapCodec { inner })
    }
}

/// Demultiplexer owning one isolated [`Assembler`] per stream identity.
///
/// Operations mirror the assembler's surface, extended with an optional
/// identity argument. A `None` identity routes to a shared base assembler;
/// each distinct identity lazily receives its own
/// [`Assembler::spawn_instance`], so buffers, tokenizer residue, and
/// sequence counters never bleed between streams.
///
/// Every routed access pushes the identity's eviction deadline out by the
/// configured timeout; a background [`MapCleaner`] reaps identities whose
/// deadline has passed, flushing each before removal.
pub struct IdentityMapCodec {
    inner: Arc<MapInner>,
}

struct MapInner {
    base: Assembler,
    map: Mutex<HashMap<String, IdentityEntry>>,
    max_identities: usize,
    evict_timeout: Duration,
    eviction_ctx: Option<EmissionContext>,
    cleaner: MapCleaner,
    high_water_warned: AtomicBool,
}

struct IdentityEntry {
    assembler: Assembler,
    deadline: Instant,
}

impl IdentityMapCodec {
    /// Starts building a demultiplexing codec over `config`.
    pub fn builder(config: MultilineConfig) -> IdentityMapBuilder {
        IdentityMapBuilder::new(config)
    }

    fn route(&self, identity: Option<&str>) -> Result<Assembler, CapacityExceeded> {
        self.inner.cleaner.start();
        match identity {
            None => Ok(self.inner.base.handle()),
            Some(identity) => self.inner.checkout(identity),
        }
    }

    /// Decodes `data` on the assembler owned by `identity`.
    ///
    /// Fails with [`CapacityExceeded`] when the identity is new, the map is
    /// full, and a cleanup pass freed nothing.
    pub fn decode(
        &self,
        data: &[u8],
        identity: Option<&str>,
        ctx: &EmissionContext,
    ) -> crate::Result<()> {
        let assembler = self.route(identity)?;
        assembler.decode(data, ctx)
    }

    /// Pass-through emission on the assembler owned by `identity`.
    pub fn encode(
        &self,
        event: MergedEvent,
        identity: Option<&str>,
        ctx: &EmissionContext,
    ) -> crate::Result<()> {
        let assembler = self.route(identity)?;
        assembler.encode(event, ctx)
    }

    /// Listener fan-in: the listener's path is the stream identity.
    pub fn accept(&self, listener: Arc<dyn Listener>) -> crate::Result<()> {
        let identity = listener.path().to_string();
        let assembler = self.route(Some(&identity))?;
        assembler.accept(listener)
    }

    /// Removes `identity` from the map, flushing any pending record first.
    /// A no-op for unknown identities, so double eviction is harmless.
    pub fn evict(&self, identity: &str) {
        let removed = self.inner.lock_map().remove(identity);
        if let Some(entry) = removed {
            self.inner.terminal_flush(&entry.assembler);
            emit!(IdentityEvicted {
                identity,
                reason: "explicit",
            });
        }
    }

    /// Flushes the base assembler and every identity's assembler.
    ///
    /// With a context, each is flushed against it; without one, each is
    /// flushed against its own last-seen decode context. Sink errors have
    /// already been logged and do not interrupt the broadcast.
    pub fn flush(&self, ctx: Option<&EmissionContext>) {
        let mut assemblers = vec![self.inner.base.handle()];
        assemblers.extend(
            self.inner
                .lock_map()
                .values()
                .map(|entry| entry.assembler.handle()),
        );
        for assembler in assemblers {
            match ctx {
                Some(ctx) => {
                    let _ = assembler.flush(ctx);
                }
                None => assembler.auto_flush(),
            }
        }
    }

    /// Flushes every identity's assembler through `listener`, rebinding the
    /// delivery path to the identity so provenance survives shutdown.
    /// Best-effort: per-identity sink errors are swallowed.
    pub fn flush_mapped(&self, listener: Arc<dyn Listener>) {
        let entries: Vec<(String, Assembler)> = self
            .inner
            .lock_map()
            .iter()
            .map(|(identity, entry)| (identity.clone(), entry.assembler.handle()))
            .collect();
        for (identity, assembler) in entries {
            let ctx = EmissionContext::for_listener(Arc::clone(&listener)).with_path(identity);
            let _ = assembler.flush(&ctx);
        }
    }

    /// Stops the reaper, then closes every assembler (base included)
    /// against its last-seen context.
    pub fn close(&self) {
        self.inner.cleaner.stop();
        let drained: Vec<IdentityEntry> = {
            let mut map = self.inner.lock_map();
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            let _ = entry.assembler.close(None);
        }
        let _ = self.inner.base.close(None);
    }

    /// Number of identities currently tracked.
    pub fn identity_count(&self) -> usize {
        self.inner.lock_map().len()
    }

    /// Looks up an identity's assembler without refreshing its eviction
    /// deadline. Intended for inspection; returns `None` for unknown
    /// identities rather than materializing one.
    pub fn peek(&self, identity: &str) -> Option<Assembler> {
        self.inner
            .lock_map()
            .get(identity)
            .map(|entry| entry.assembler.handle())
    }
}

impl std::fmt::Debug for IdentityMapCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMapCodec")
            .field("identities", &self.identity_count())
            .field("max_identities", &self.inner.max_identities)
            .finish()
    }
}

impl MapInner {
    fn lock_map(&self) -> MutexGuard<'_, HashMap<String, IdentityEntry>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checkout(&self, identity: &str) -> Result<Assembler, CapacityExceeded> {
        let mut map = self.lock_map();
        let deadline = Instant::now() + self.evict_timeout;
        if let Some(entry) = map.get_mut(identity) {
            entry.deadline = deadline;
            return Ok(entry.assembler.handle());
        }

        self.ensure_capacity(&mut map)?;
        let assembler = self.base.spawn_instance();
        let handle = assembler.handle();
        map.insert(
            identity.to_string(),
            IdentityEntry {
                assembler,
                deadline,
            },
        );
        emit!(IdentityCreated {
            identity,
            total: map.len(),
        });
        Ok(handle)
    }

    fn ensure_capacity(
        &self,
        map: &mut HashMap<String, IdentityEntry>,
    ) -> Result<(), CapacityExceeded> {
        if map.len() >= self.max_identities {
            self.sweep_stale_locked(map);
        }
        if map.len() >= self.max_identities {
            emit!(IdentityMapFull {
                max: self.max_identities,
            });
            return Err(CapacityExceeded {
                max: self.max_identities,
            });
        }
        if map.len() * 5 >= self.max_identities * 4
            && !self.high_water_warned.swap(true, Ordering::Relaxed)
        {
            emit!(IdentityMapHighWater {
                size: map.len(),
                max: self.max_identities,
            });
        }
        Ok(())
    }

    /// Removes entries past their deadline, flushing each before removal.
    /// Runs under the map lock so deletion is atomic with routing.
    fn sweep_stale_locked(&self, map: &mut HashMap<String, IdentityEntry>) {
        let now = Instant::now();
        map.retain(|identity, entry| {
            if entry.deadline <= now {
                self.terminal_flush(&entry.assembler);
                emit!(IdentityEvicted {
                    identity,
                    reason: "stale",
                });
                false
            } else {
                true
            }
        });
    }

    /// Eviction flush policy: prefer the assembler's own auto-flush; fall
    /// back to the configured eviction context; otherwise flush against the
    /// assembler's last-seen decode context.
    fn terminal_flush(&self, assembler: &Assembler) {
        if !assembler.supports_auto_flush() {
            if let Some(ctx) = &self.eviction_ctx {
                let _ = assembler.flush(ctx);
                return;
            }
        }
        assembler.auto_flush();
    }
}

impl SweepTarget for MapInner {
    fn sweep_stale(&self) {
        let mut map = self.lock_map();
        self.sweep_stale_locked(&mut map);
    }

    fn cleaner(&self) -> &MapCleaner {
        &self.cleaner
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::config::What;

    fn collector() -> (EmissionContext, Arc<StdMutex<Vec<MergedEvent>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let ctx = EmissionContext::from_fn(move |event: MergedEvent| {
            sink_events.lock().unwrap().push(event);
            Ok(())
        });
        (ctx, events)
    }

    fn codec(max_identities: usize, evict_timeout: Duration) -> IdentityMapCodec {
        IdentityMapCodec::builder(MultilineConfig::new(r"^\s", What::Previous))
            .max_identities(max_identities)
            .evict_timeout(evict_timeout)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn nil_identity_routes_to_the_base_assembler() {
        let codec = codec(4, Duration::from_secs(60));
        let (ctx, events) = collector();

        codec.decode(b"standalone\n", None, &ctx).unwrap();
        assert_eq!(codec.identity_count(), 0);

        codec.flush(Some(&ctx));
        assert_eq!(events.lock().unwrap()[0].message, "standalone");
    }

    #[tokio::test]
    async fn identities_get_isolated_assemblers() {
        let codec = codec(4, Duration::from_secs(60));
        let (ctx, events) = collector();

        codec.decode(b"s1 first\n s1 more\n", Some("s1"), &ctx).unwrap();
        codec.decode(b"s2 first\n", Some("s2"), &ctx).unwrap();
        assert_eq!(codec.identity_count(), 2);

        // separate buffers: each identity still holds its own record
        assert_eq!(codec.peek("s1").unwrap().buffered_lines(), 2);
        assert_eq!(codec.peek("s2").unwrap().buffered_lines(), 1);

        codec.flush(Some(&ctx));
        let messages: Vec<_> = events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.message.clone())
            .collect();
        assert!(messages.contains(&"s1 first\n s1 more".to_string()));
        assert!(messages.contains(&"s2 first".to_string()));
    }

    #[tokio::test]
    async fn capacity_is_enforced_after_a_cleanup_attempt() {
        let codec = codec(2, Duration::from_secs(60));
        let (ctx, _events) = collector();

        codec.decode(b"a\n", Some("a"), &ctx).unwrap();
        codec.decode(b"b\n", Some("b"), &ctx).unwrap();
        let error = codec.decode(b"c\n", Some("c"), &ctx).unwrap_err();
        assert!(error.downcast_ref::<CapacityExceeded>().is_some());
        assert_eq!(codec.identity_count(), 2);

        // existing identities still route fine
        codec.decode(b"a again\n", Some("a"), &ctx).unwrap();
    }

    #[tokio::test]
    async fn stale_identities_are_evicted_to_make_room() {
        let codec = codec(2, Duration::from_millis(100));
        let (ctx, events) = collector();

        codec.decode(b"from a\n", Some("a"), &ctx).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        codec.decode(b"from b\n", Some("b"), &ctx).unwrap();
        codec.decode(b"from c\n", Some("c"), &ctx).unwrap();

        assert_eq!(codec.identity_count(), 2);
        assert!(codec.peek("a").is_none());
        // a's pending record was flushed on eviction, to a's own context
        assert_eq!(events.lock().unwrap()[0].message, "from a");
    }

    #[tokio::test]
    async fn routed_access_refreshes_the_eviction_deadline() {
        let codec = codec(4, Duration::from_millis(100));
        let (ctx, _events) = collector();

        codec.decode(b"a\n", Some("a"), &ctx).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        codec.decode(b"a again\n", Some("a"), &ctx).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // 120ms since creation but only 60ms since the last routed access
        codec.inner.sweep_stale();
        assert!(codec.peek("a").is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        codec.inner.sweep_stale();
        assert!(codec.peek("a").is_none());
    }

    #[tokio::test]
    async fn peek_does_not_refresh_or_materialize() {
        let codec = codec(4, Duration::from_millis(80));
        let (ctx, _events) = collector();

        assert!(codec.peek("missing").is_none());
        assert_eq!(codec.identity_count(), 0);

        codec.decode(b"a\n", Some("a"), &ctx).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(codec.peek("a").is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;

        // peeking half-way through did not push the deadline out
        codec.inner.sweep_stale();
        assert!(codec.peek("a").is_none());
    }

    #[tokio::test]
    async fn evict_is_idempotent_and_flushes_pending_records() {
        let codec = codec(4, Duration::from_secs(60));
        let (ctx, events) = collector();

        codec.decode(b"pending record\n", Some("a"), &ctx).unwrap();
        codec.evict("a");
        codec.evict("a");

        assert_eq!(codec.identity_count(), 0);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "pending record");
    }

    #[tokio::test]
    async fn close_drains_every_assembler() {
        let codec = codec(4, Duration::from_secs(60));
        let (ctx, events) = collector();

        codec.decode(b"one\n", Some("s1"), &ctx).unwrap();
        codec.decode(b"two\n", Some("s2"), &ctx).unwrap();
        codec.decode(b"base\n", None, &ctx).unwrap();
        codec.close();

        let mut messages: Vec<_> = events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.message.clone())
            .collect();
        messages.sort();
        assert_eq!(messages, ["base", "one", "two"]);
        assert_eq!(codec.identity_count(), 0);
        assert!(!codec.inner.cleaner.is_running());
    }
}
