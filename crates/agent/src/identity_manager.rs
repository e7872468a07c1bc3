//! Per-channel identity bindings and hot-swap.
//!
//! Each channel owns a slot holding its current binding behind an `Arc`.
//! Turns take a snapshot of that `Arc` when they start and keep it to the
//! end, so a swap never changes the identity of a turn already running. A
//! swap holds the slot's own lock for its whole duration; slots of other
//! channels are untouched.
//!
//! Swap order:
//! 1. validate the replacement card (nothing is touched if it is bad)
//! 2. claim the new namespace name
//! 3. stop maintenance for the old namespace
//! 4. archive the old namespace (its handle is retired first) and drop its
//!    retrieval index
//! 5. provision the new namespace
//! 6. publish the new binding, start maintenance for it

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use homunculus_core::channel::ChannelId;
use homunculus_core::error::{IdentityError, SwapError};
use homunculus_core::event::{DomainEvent, EventBus};
use homunculus_core::identity::{CharacterIdentity, IdentityRef, IdentitySource};
use homunculus_core::memory::{
    is_valid_namespace_name, ArchiveReceipt, DurableMemoryStore, Namespace, RetrievalBackend,
};
use homunculus_workflow::MaintenanceScheduler;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// The identity a channel currently speaks as.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityBinding {
    pub channel: ChannelId,
    pub identity: IdentityRef,
    pub namespace: Namespace,
    pub ruleset_id: String,
    /// The platform user id the identity posts as.
    pub bot_user_id: u64,
    pub effective_since: DateTime<Utc>,
}

/// What to bind a channel to at startup.
#[derive(Debug, Clone)]
pub struct BindRequest {
    pub channel: ChannelId,
    pub identity: IdentityRef,
    pub namespace: String,
    pub ruleset_id: String,
    pub bot_user_id: u64,
}

/// The result of a completed swap.
#[derive(Debug, Clone)]
pub struct SwapReport {
    pub channel: ChannelId,
    pub identity_name: String,
    pub old_namespace: String,
    pub new_namespace: String,
    pub archive: Option<ArchiveReceipt>,
}

struct ChannelSlot {
    swap_lock: Mutex<()>,
    binding: RwLock<Arc<IdentityBinding>>,
}

/// Swap names are namespace names of at least two characters.
pub fn is_valid_npc_name(name: &str) -> bool {
    name.len() >= 2 && is_valid_namespace_name(name)
}

pub struct IdentityManager {
    slots: DashMap<ChannelId, Arc<ChannelSlot>>,
    /// namespace name -> the channel whose binding uses it
    owners: DashMap<String, ChannelId>,
    store: Arc<dyn DurableMemoryStore>,
    identities: Arc<dyn IdentitySource>,
    scheduler: Option<Arc<MaintenanceScheduler>>,
    index: Option<Arc<dyn RetrievalBackend>>,
    events: Option<Arc<EventBus>>,
    cards_dir: PathBuf,
}

impl IdentityManager {
    /// `cards_dir` is where `swap` looks for `<name>.json` when no card path
    /// is given.
    pub fn new(
        store: Arc<dyn DurableMemoryStore>,
        identities: Arc<dyn IdentitySource>,
        cards_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            owners: DashMap::new(),
            store,
            identities,
            scheduler: None,
            index: None,
            events: None,
            cards_dir: cards_dir.into(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<MaintenanceScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// The retrieval backend whose per-namespace state is dropped when a
    /// namespace is archived.
    pub fn with_index(mut self, index: Arc<dyn RetrievalBackend>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn slot(&self, channel: &ChannelId) -> Option<Arc<ChannelSlot>> {
        self.slots.get(channel).map(|s| s.value().clone())
    }

    /// Claim `namespace` for `channel`. Fails if another channel holds it.
    fn claim(&self, namespace: &str, channel: &ChannelId) -> Result<(), SwapError> {
        match self.owners.entry(namespace.to_string()) {
            Entry::Occupied(owner) if owner.get() != channel => Err(SwapError::NamespaceInUse {
                namespace: namespace.to_string(),
                channel: owner.get().to_string(),
            }),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(channel.clone());
                Ok(())
            }
        }
    }

    fn release(&self, namespace: &str, channel: &ChannelId) {
        self.owners.remove_if(namespace, |_, owner| owner == channel);
    }

    async fn forget_index(&self, namespace: &str) {
        if let Some(index) = &self.index {
            index.forget(namespace).await;
        }
    }

    /// Bind a channel, provisioning its namespace. Re-binding a channel
    /// replaces its binding without archiving anything.
    pub async fn bind(&self, request: BindRequest) -> Result<Arc<IdentityBinding>, SwapError> {
        let BindRequest {
            channel,
            identity,
            namespace,
            ruleset_id,
            bot_user_id,
        } = request;
        if !is_valid_namespace_name(&namespace) {
            return Err(SwapError::InvalidName(namespace));
        }
        self.claim(&namespace, &channel)?;

        let handle = match self.store.provision(&namespace).await {
            Ok(handle) => handle,
            Err(source) => {
                self.release(&namespace, &channel);
                return Err(SwapError::Provision { namespace, source });
            }
        };

        let binding = Arc::new(IdentityBinding {
            channel: channel.clone(),
            identity,
            namespace: handle,
            ruleset_id,
            bot_user_id,
            effective_since: Utc::now(),
        });

        // Look up and insert under one entry guard, released before any await.
        let existing = match self.slots.entry(channel.clone()) {
            Entry::Occupied(slot) => Some(slot.get().clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(ChannelSlot {
                    swap_lock: Mutex::new(()),
                    binding: RwLock::new(binding.clone()),
                }));
                None
            }
        };
        let previous = match existing {
            Some(slot) => {
                let _guard = slot.swap_lock.lock().await;
                let mut current = slot.binding.write().await;
                Some(std::mem::replace(&mut *current, binding.clone()))
            }
            None => None,
        };
        if let Some(previous) = previous.filter(|p| p.namespace.name != namespace) {
            self.release(&previous.namespace.name, &channel);
            if let Some(scheduler) = &self.scheduler {
                scheduler.unregister(&previous.namespace.name).await;
            }
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.register(&namespace).await;
        }

        info!(
            channel = %channel,
            namespace = %namespace,
            card = %binding.identity,
            "Channel bound"
        );
        Ok(binding)
    }

    /// The channel's binding at this instant.
    pub async fn current(&self, channel: &ChannelId) -> Option<Arc<IdentityBinding>> {
        let slot = self.slot(channel)?;
        let binding = slot.binding.read().await.clone();
        Some(binding)
    }

    /// Read the binding's card fresh from its source.
    pub async fn load_identity(
        &self,
        binding: &IdentityBinding,
    ) -> Result<CharacterIdentity, IdentityError> {
        let card = self.identities.load(&binding.identity).await?;
        Ok(CharacterIdentity {
            card,
            ruleset_id: binding.ruleset_id.clone(),
            namespace: binding.namespace.name.clone(),
        })
    }

    /// Re-validate the channel's current card.
    pub async fn reload(&self, channel: &ChannelId) -> Result<CharacterIdentity, SwapError> {
        let binding = self
            .current(channel)
            .await
            .ok_or_else(|| SwapError::NotBound(channel.to_string()))?;
        Ok(self.load_identity(&binding).await?)
    }

    /// Every binding, ordered by channel id.
    pub async fn bindings(&self) -> Vec<Arc<IdentityBinding>> {
        let slots: Vec<Arc<ChannelSlot>> = self.slots.iter().map(|s| s.value().clone()).collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.binding.read().await.clone());
        }
        out.sort_by(|a, b| a.channel.cmp(&b.channel));
        out
    }

    /// Replace the channel's identity with `new_name`, archiving the old
    /// namespace and provisioning a fresh one.
    ///
    /// `card` defaults to `<cards_dir>/<new_name>.json`. Swapping to the
    /// current name archives the old memory and starts that name over.
    pub async fn swap(
        &self,
        channel: &ChannelId,
        new_name: &str,
        card: Option<PathBuf>,
    ) -> Result<SwapReport, SwapError> {
        let new_name = new_name.trim().to_lowercase();
        if !is_valid_npc_name(&new_name) {
            return Err(SwapError::InvalidName(new_name));
        }
        let slot = self
            .slot(channel)
            .ok_or_else(|| SwapError::NotBound(channel.to_string()))?;

        let _guard = slot.swap_lock.lock().await;
        let old = slot.binding.read().await.clone();
        let old_name = old.namespace.name.clone();

        let identity = IdentityRef::new(
            card.unwrap_or_else(|| self.cards_dir.join(format!("{new_name}.json"))),
        );
        let new_card = self.identities.load(&identity).await?;

        let renamed = new_name != old_name;
        if renamed {
            self.claim(&new_name, channel)?;
        }

        if let Some(scheduler) = &self.scheduler {
            scheduler.unregister(&old_name).await;
        }

        let archive = match self.store.archive(&old.namespace).await {
            Ok(receipt) => receipt,
            Err(source) => {
                error!(
                    channel = %channel,
                    namespace = %old_name,
                    error = %source,
                    "Archive failed, keeping the current identity"
                );
                self.restore(&slot, &old).await;
                if renamed {
                    self.release(&new_name, channel);
                }
                return Err(SwapError::Archive {
                    namespace: old_name,
                    source,
                });
            }
        };
        self.forget_index(&old_name).await;
        if renamed {
            // The new name may have been archived earlier under another binding.
            self.forget_index(&new_name).await;
        }

        let handle = match self.store.provision(&new_name).await {
            Ok(handle) => handle,
            Err(source) => {
                error!(
                    channel = %channel,
                    namespace = %new_name,
                    error = %source,
                    "Provisioning failed after archive; channel keeps its retired namespace"
                );
                if renamed {
                    self.release(&new_name, channel);
                }
                return Err(SwapError::Provision {
                    namespace: new_name,
                    source,
                });
            }
        };

        let binding = Arc::new(IdentityBinding {
            channel: channel.clone(),
            identity,
            namespace: handle,
            ruleset_id: old.ruleset_id.clone(),
            bot_user_id: old.bot_user_id,
            effective_since: Utc::now(),
        });
        *slot.binding.write().await = binding;

        if renamed {
            self.release(&old_name, channel);
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.register(&new_name).await;
        }

        let archive_path = archive.as_ref().map(|r| r.path.display().to_string());
        info!(
            channel = %channel,
            old_namespace = %old_name,
            new_namespace = %new_name,
            archive = archive_path.as_deref().unwrap_or("-"),
            "Identity swapped"
        );
        if let Some(events) = &self.events {
            events.publish(DomainEvent::IdentitySwapped {
                channel: channel.to_string(),
                old_namespace: old_name.clone(),
                new_namespace: new_name.clone(),
                archive_path,
                timestamp: Utc::now(),
            });
        }

        Ok(SwapReport {
            channel: channel.clone(),
            identity_name: new_card.name,
            old_namespace: old_name,
            new_namespace: new_name,
            archive,
        })
    }

    /// Put the old namespace back in service after a failed archive. The
    /// archive retired the old handle, so a new one is provisioned.
    async fn restore(&self, slot: &ChannelSlot, old: &IdentityBinding) {
        match self.store.provision(&old.namespace.name).await {
            Ok(handle) => {
                let mut restored = old.clone();
                restored.namespace = handle;
                *slot.binding.write().await = Arc::new(restored);
            }
            Err(e) => warn!(
                namespace = %old.namespace.name,
                error = %e,
                "Could not re-provision namespace after failed archive"
            ),
        }
        // The archive may have moved part of the tree; rebuild from what is left.
        self.forget_index(&old.namespace.name).await;
        if let Some(scheduler) = &self.scheduler {
            scheduler.register(&old.namespace.name).await;
        }
    }
}
