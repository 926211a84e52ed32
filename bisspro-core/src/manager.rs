//! Key manager
//!
//! Async façade used by the front end. It owns the store, the backup manager
//! and the restart coordinator behind one mutex, so mutations apply in a
//! total order. File work and restarts run on the blocking pool.
//!
//! Every write follows the same sequence:
//! 1. Apply the change to a working copy of the store
//! 2. Snapshot the file on disk (when backups are enabled)
//! 3. Save the working copy atomically
//! 4. Let the restart coordinator decide about the decoder
//!
//! Cancellation only stops waiting for the network. Once step 1 has begun
//! the write runs to completion.

use crate::backup::{BackupId, BackupInfo, BackupManager};
use crate::codec::{self, FeedParse};
use crate::collaborators::{ProbingProcessController, ServiceInfo};
use crate::config::BissConfig;
use crate::error::{Error, Result};
use crate::fetcher::{fetch_with_cache, FeedCache, FeedSource, HttpFeedSource};
use crate::matcher::{self, IdentityMatcher, MatchKind, MatchOutcome};
use crate::models::{Annotation, CandidateSource, ChannelIdentity, CompositeIdentity, KeyRecord};
use crate::reconcile::{self, CollisionPolicy, MergeReport, RemoveTarget, UpsertOutcome};
use crate::restart::{RestartCoordinator, RestartOutcome, RestartTrigger};
use crate::store::{KeyStore, StoreCell};
use bisspro_common::time;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Result of a store-changing operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport<T> {
    /// Operation-specific result
    pub outcome: T,
    /// Snapshot taken before the write
    pub backup: Option<BackupId>,
    /// Whether the store file was rewritten
    pub written: bool,
    /// Computed only; nothing was written
    pub dry_run: bool,
    pub restart: RestartOutcome,
}

/// Result of [`KeyManager::auto_add`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoAdded {
    /// Tier that produced the key
    pub kind: MatchKind,
    pub upsert: UpsertOutcome,
}

/// Result of a bulk merge (feed update or pasted text)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub merge: MergeReport,
    /// Input lines that could not be used
    pub skipped_lines: usize,
}

/// Result of [`KeyManager::restore_backup`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: BackupId,
    /// Snapshot of the store as it was before the restore
    pub safety_snapshot: Option<BackupId>,
    /// Records in the restored store
    pub records: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy)]
struct WritePolicy {
    dry_run: bool,
    backup_enabled: bool,
    keep: usize,
    collision_policy: CollisionPolicy,
}

/// Everything guarded by the manager mutex
struct ManagerState {
    store: StoreCell,
    backups: BackupManager,
    restart: RestartCoordinator,
}

impl ManagerState {
    fn apply<T, F>(
        &mut self,
        policy: WritePolicy,
        trigger: RestartTrigger,
        service: &dyn ServiceInfo,
        mutate: F,
    ) -> Result<WriteReport<T>>
    where
        F: FnOnce(&mut KeyStore) -> Result<(T, bool)>,
    {
        let mut working = self.store.get_mut()?.clone();
        let (outcome, changed) = mutate(&mut working)?;

        if policy.dry_run || !changed {
            return Ok(WriteReport {
                outcome,
                backup: None,
                written: false,
                dry_run: policy.dry_run,
                restart: RestartOutcome::NotRequired,
            });
        }

        let backup = if policy.backup_enabled {
            self.backups.rotate(policy.keep)?
        } else {
            None
        };
        working.save()?;
        self.store.replace(working);

        let restart = self.restart.after_mutation(trigger, service);
        Ok(WriteReport {
            outcome,
            backup,
            written: true,
            dry_run: false,
            restart,
        })
    }
}

/// Async key store façade
pub struct KeyManager {
    state: Arc<Mutex<ManagerState>>,
    service: Arc<dyn ServiceInfo>,
    feed_source: Arc<dyn FeedSource>,
    feed_cache: Mutex<FeedCache>,
    matcher: IdentityMatcher,
    config: Arc<BissConfig>,
}

impl KeyManager {
    pub fn new(
        config: BissConfig,
        service: Arc<dyn ServiceInfo>,
        feed_source: Arc<dyn FeedSource>,
        processes: ProbingProcessController,
    ) -> Self {
        let ttl = Duration::from_secs(config.feed.cache_ttl_secs);
        let feed_cache = if config.feed.cache_ttl_secs > 0 {
            FeedCache::with_path(ttl, config.feed_cache_path())
        } else {
            FeedCache::new(ttl)
        };

        let state = ManagerState {
            store: StoreCell::new(&config.store_path),
            backups: BackupManager::new(&config.store_path),
            restart: RestartCoordinator::new(&config.restart, processes),
        };

        info!(
            store = %config.store_path.display(),
            dry_run = config.dry_run,
            backups = config.backup.enabled,
            "Key manager ready"
        );

        Self {
            state: Arc::new(Mutex::new(state)),
            service,
            feed_source,
            feed_cache: Mutex::new(feed_cache),
            matcher: IdentityMatcher::new(config.matcher.clone()),
            config: Arc::new(config),
        }
    }

    /// Manager using HTTP for the feed and command-line process control
    pub fn from_config(config: BissConfig, service: Arc<dyn ServiceInfo>) -> Result<Self> {
        let feed_source = Arc::new(HttpFeedSource::new()?);
        let processes = ProbingProcessController::from_specs(&config.restart.processes);
        Ok(Self::new(config, service, feed_source, processes))
    }

    pub fn config(&self) -> &BissConfig {
        &self.config
    }

    pub fn store_path(&self) -> &Path {
        &self.config.store_path
    }

    fn write_policy(&self) -> WritePolicy {
        WritePolicy {
            dry_run: self.config.dry_run,
            backup_enabled: self.config.backup.enabled,
            keep: self.config.backup.keep,
            collision_policy: self.config.merge.collision_policy,
        }
    }

    fn current_channel(&self) -> Result<ChannelIdentity> {
        self.service.current_channel().ok_or(Error::NoActiveService)
    }

    /// Run `f` under the mutex on the blocking pool
    async fn with_state<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ManagerState) -> Result<T> + Send + 'static,
    {
        let mut guard = self.state.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut guard))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }

    async fn write<T, F>(&self, trigger: RestartTrigger, mutate: F) -> Result<WriteReport<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut KeyStore, WritePolicy) -> Result<(T, bool)> + Send + 'static,
    {
        let policy = self.write_policy();
        let service = self.service.clone();
        self.with_state(move |state| {
            state.apply(policy, trigger, service.as_ref(), |store| mutate(store, policy))
        })
        .await
    }

    async fn fetch_feed(&self, cancel: &CancellationToken) -> Result<FeedParse> {
        let feed = &self.config.feed;
        let mut cache = self.feed_cache.lock().await;
        let fetch = fetch_with_cache(self.feed_source.as_ref(), &mut cache, &feed.url, feed.timeout());

        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = fetch => result?,
        };

        let parsed = codec::parse_feed(&text, &feed.ca_marker, CandidateSource::Feed);
        info!(
            candidates = parsed.candidates.len(),
            records = parsed.records.len(),
            skipped = parsed.skipped,
            "Parsed key feed"
        );
        Ok(parsed)
    }

    async fn upsert(
        &self,
        identity: CompositeIdentity,
        key_hex: &str,
        annotation: Annotation,
    ) -> Result<WriteReport<UpsertOutcome>> {
        let key_hex = key_hex.to_string();
        self.write(RestartTrigger::Single, move |store, _| {
            let outcome = reconcile::upsert(store, identity, &key_hex, annotation)?;
            let changed = outcome.is_change();
            Ok((outcome, changed))
        })
        .await
    }

    /// Store a key for the channel being watched
    pub async fn save_key_for_current(&self, key_hex: &str) -> Result<WriteReport<UpsertOutcome>> {
        let channel = self.current_channel()?;
        let annotation =
            Annotation::new(channel.annotation_name()).with_updated(time::local_now_seconds());
        self.upsert(channel.identity(), key_hex, annotation).await
    }

    /// Store a key for an explicit identity
    pub async fn save_key(
        &self,
        identity: CompositeIdentity,
        name: &str,
        key_hex: &str,
    ) -> Result<WriteReport<UpsertOutcome>> {
        let annotation = Annotation::new(name).with_updated(time::local_now_seconds());
        self.upsert(identity, key_hex, annotation).await
    }

    /// Store one record given as a full store line
    pub async fn save_line(&self, line: &str) -> Result<WriteReport<UpsertOutcome>> {
        let mut record = codec::parse_line(line)?;
        if record.annotation.updated.is_none() {
            record.annotation.updated = Some(time::local_now_seconds());
        }
        self.write(RestartTrigger::Single, move |store, _| {
            let outcome = reconcile::upsert_record(store, record);
            let changed = outcome.is_change();
            Ok((outcome, changed))
        })
        .await
    }

    /// Remove the first record matching `target`
    pub async fn delete_key(&self, target: RemoveTarget) -> Result<WriteReport<KeyRecord>> {
        self.write(RestartTrigger::Single, move |store, _| {
            match reconcile::remove(store, &target) {
                Some(record) => Ok((record, true)),
                None => Err(Error::IdentityNotFound(target.describe())),
            }
        })
        .await
    }

    /// Remove the key of the channel being watched
    pub async fn delete_key_for_current(&self) -> Result<WriteReport<KeyRecord>> {
        let channel = self.current_channel()?;
        self.delete_key(RemoveTarget::ProgramId(channel.program_id)).await
    }

    /// Find the watched channel in the remote feed and store its key
    pub async fn auto_add(&self, cancel: CancellationToken) -> Result<WriteReport<AutoAdded>> {
        let channel = self.current_channel()?;
        let parsed = self.fetch_feed(&cancel).await?;

        let matched = match self.matcher.select(&channel, &parsed.candidates) {
            MatchOutcome::Found(matched) => matched,
            MatchOutcome::NotFound => {
                return Err(Error::IdentityNotFound(format!(
                    "{} ({})",
                    channel.name,
                    channel.identity()
                )))
            }
            MatchOutcome::InvalidKey { error, .. } => return Err(error.into()),
        };

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let annotation =
            Annotation::new(channel.annotation_name()).with_updated(time::local_now_seconds());
        let record = KeyRecord::new(channel.identity(), matched.key, annotation);
        let kind = matched.kind;
        self.write(RestartTrigger::Single, move |store, _| {
            let upsert = reconcile::upsert_record(store, record);
            let changed = upsert.is_change();
            Ok((AutoAdded { kind, upsert }, changed))
        })
        .await
    }

    async fn merge(&self, parsed: FeedParse) -> Result<WriteReport<BatchOutcome>> {
        let skipped_lines = parsed.skipped;
        let records = parsed.records;
        self.write(RestartTrigger::Bulk, move |store, policy| {
            let merge = reconcile::merge_batch(store, records, policy.collision_policy);
            Ok((
                BatchOutcome {
                    merge,
                    skipped_lines,
                },
                merge.changed(),
            ))
        })
        .await
    }

    /// Merge every record of the remote feed
    pub async fn update_from_feed(
        &self,
        cancel: CancellationToken,
    ) -> Result<WriteReport<BatchOutcome>> {
        let parsed = self.fetch_feed(&cancel).await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.merge(parsed).await
    }

    /// Merge records pasted by the user
    pub async fn import_text(&self, text: &str) -> Result<WriteReport<BatchOutcome>> {
        let parsed = codec::parse_feed(text, &self.config.feed.ca_marker, CandidateSource::Pasted);
        self.merge(parsed).await
    }

    /// Match a channel against the local store only
    pub async fn lookup(&self, channel: &ChannelIdentity) -> Result<MatchOutcome> {
        let candidates = self
            .with_state(|state| Ok(matcher::candidates_from_store(state.store.get_mut()?)))
            .await?;
        Ok(self.matcher.select(channel, &candidates))
    }

    /// [`lookup`](Self::lookup) for the channel being watched
    pub async fn lookup_current(&self) -> Result<MatchOutcome> {
        let channel = self.current_channel()?;
        self.lookup(&channel).await
    }

    /// All local records for a service id
    pub async fn keys_for_program(&self, program_id: u16) -> Result<Vec<KeyRecord>> {
        self.with_state(move |state| {
            let store = state.store.get_mut()?;
            Ok(matcher::keys_for_program(store, program_id)
                .into_iter()
                .cloned()
                .collect())
        })
        .await
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        self.with_state(|state| state.backups.list()).await
    }

    /// Replace the live store with a snapshot
    ///
    /// The current store is snapshotted first (when backups are enabled).
    /// No restart is performed.
    pub async fn restore_backup(&self, id: BackupId) -> Result<RestoreReport> {
        let policy = self.write_policy();
        self.with_state(move |state| {
            let text = state.backups.read(&id)?;
            if policy.dry_run {
                let store = KeyStore::from_text(state.backups.store_path(), &text);
                return Ok(RestoreReport {
                    restored: id,
                    safety_snapshot: None,
                    records: store.record_count(),
                    dry_run: true,
                });
            }

            let safety_snapshot = if policy.backup_enabled {
                state.backups.snapshot()?
            } else {
                None
            };
            let store = state.backups.restore(&id)?;
            let records = store.record_count();
            state.store.replace(store);

            if policy.backup_enabled {
                if let Err(e) = state.backups.evict_excess(policy.keep) {
                    warn!(error = %e, "Backup eviction failed after restore");
                }
            }

            Ok(RestoreReport {
                restored: id,
                safety_snapshot,
                records,
                dry_run: false,
            })
        })
        .await
    }
}
