use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::remote::RemoteBackend;
use super::store::{LocalStore, StoreChange};
use super::{ClientError, keys};
use crate::auth::Role;
use crate::models::Profile;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OutboxOp {
    PushProfile,
    PushRole,
    PushTrainings,
    DeleteTraining { id: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    #[serde(flatten)]
    pub op: OutboxOp,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
    pub pending: usize,
    /// Entries taken out of the outbox after a permanent rejection.
    pub parked: usize,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Doubles per attempt, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Appends `op` to the persisted outbox. A pending push of the same kind
/// absorbs it, except the front entry when `front_in_flight` is set.
pub fn enqueue_op(
    store: &LocalStore,
    op: OutboxOp,
    front_in_flight: bool,
) -> Result<usize, ClientError> {
    let outbox = store.update(keys::OUTBOX, Vec::<OutboxEntry>::new(), |mut outbox| {
        let skip = usize::from(front_in_flight);
        if !outbox.iter().skip(skip).any(|e| e.op == op) {
            outbox.push(OutboxEntry {
                op,
                attempts: 0,
                last_error: None,
                enqueued_at: Utc::now(),
            });
        }
        outbox
    })?;
    Ok(outbox.len())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub created_profile: bool,
    pub pulled_trainings: usize,
    pub queued_trainings: bool,
}

/// Keeps the local store and the backend in step. Remote state is pulled
/// once per session; local changes leave through the outbox.
pub struct SyncReconciler {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteBackend>,
    status: watch::Sender<SyncStatus>,
    flush_lock: Mutex<()>,
}

impl SyncReconciler {
    pub fn new(store: Arc<LocalStore>, remote: Arc<dyn RemoteBackend>) -> Self {
        let pending = store.get::<Vec<OutboxEntry>>(keys::OUTBOX, Vec::new()).len();
        let (status, _) = watch::channel(SyncStatus {
            pending,
            ..Default::default()
        });
        Self {
            store,
            remote,
            status,
            flush_lock: Mutex::new(()),
        }
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn outbox(&self) -> Vec<OutboxEntry> {
        self.store.get(keys::OUTBOX, Vec::new())
    }

    pub fn parked(&self) -> Vec<OutboxEntry> {
        self.store.get(keys::OUTBOX_PARKED, Vec::new())
    }

    fn has_pending(&self, op: &OutboxOp) -> bool {
        self.outbox().iter().any(|e| &e.op == op)
    }

    fn publish(&self, f: impl FnOnce(&mut SyncStatus)) {
        let pending = self.outbox().len();
        let parked = self.parked().len();
        self.status.send_modify(|status| {
            status.pending = pending;
            status.parked = parked;
            f(status);
        });
    }

    pub fn enqueue(&self, op: OutboxOp) -> Result<(), ClientError> {
        let flushing = self.flush_lock.try_lock().is_err();
        let pending = enqueue_op(&self.store, op, flushing)?;
        debug!(pending, "Outbox updated");
        self.publish(|_| {});
        Ok(())
    }

    async fn send(&self, op: &OutboxOp) -> Result<(), ClientError> {
        match op {
            OutboxOp::PushProfile => {
                self.remote
                    .upsert_profile(&self.store.profile_payload())
                    .await?;
            }
            OutboxOp::PushRole => {
                self.remote.set_role(self.store.role()).await?;
            }
            OutboxOp::PushTrainings => {
                let saved = self.remote.push_trainings(&self.store.trainings()).await?;
                debug!(saved, "Trainings pushed");
            }
            OutboxOp::DeleteTraining { id } => {
                if !self.remote.delete_training(*id).await? {
                    debug!(id, "Training was already gone remotely");
                }
            }
        }
        Ok(())
    }

    /// Sends queued operations in order. A transient failure stops the flush
    /// and stays at the front of the outbox. A permanent rejection moves the
    /// entry to the parked list so the rest of the queue can still go out.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<usize, ClientError> {
        let _guard = self.flush_lock.lock().await;
        let mut sent = 0;
        let mut rejected = None;

        while let Some(entry) = self.outbox().into_iter().next() {
            match self.send(&entry.op).await {
                Ok(()) => {
                    self.take_front(&entry.op)?;
                    sent += 1;
                    self.publish(|_| {});
                }
                Err(err) if err.is_permanent() => {
                    let message = err.to_string();
                    if let Some(mut parked) = self.take_front(&entry.op)? {
                        parked.attempts += 1;
                        parked.last_error = Some(message.clone());
                        self.store.update(
                            keys::OUTBOX_PARKED,
                            Vec::<OutboxEntry>::new(),
                            |mut list| {
                                list.push(parked);
                                list
                            },
                        )?;
                    }
                    error!(op = ?entry.op, error = %err, "Server refused sync push, parked");
                    self.publish(|status| status.last_error = Some(message.clone()));
                    rejected = Some(message);
                }
                Err(err) => {
                    let message = err.to_string();
                    self.store
                        .update(keys::OUTBOX, Vec::<OutboxEntry>::new(), |mut outbox| {
                            if let Some(front) = outbox.first_mut() {
                                front.attempts += 1;
                                front.last_error = Some(message.clone());
                            }
                            outbox
                        })?;
                    warn!(op = ?entry.op, error = %err, "Sync push failed");
                    self.publish(|status| status.last_error = Some(message));
                    return Err(err);
                }
            }
        }

        self.publish(|status| {
            status.last_error = rejected;
            status.last_synced_at = Some(Utc::now());
        });
        if sent > 0 {
            info!(sent, "Outbox flushed");
        }
        Ok(sent)
    }

    /// Removes the front entry if it is still `op`.
    fn take_front(&self, op: &OutboxOp) -> Result<Option<OutboxEntry>, ClientError> {
        let mut taken = None;
        self.store
            .update(keys::OUTBOX, Vec::<OutboxEntry>::new(), |mut outbox| {
                if outbox.first().map(|e| &e.op) == Some(op) {
                    taken = Some(outbox.remove(0));
                }
                outbox
            })?;
        Ok(taken)
    }

    pub async fn flush_with_retry(&self, policy: RetryPolicy) -> Result<usize, ClientError> {
        let mut attempt = 0;
        loop {
            match self.flush().await {
                Ok(sent) => return Ok(sent),
                Err(err @ ClientError::Unauthorized(_)) => return Err(err),
                Err(err) if err.is_permanent() => return Err(err),
                Err(err) if attempt + 1 >= policy.max_attempts => return Err(err),
                Err(err) => {
                    let delay = policy.delay_for(attempt);
                    warn!(attempt, ?delay, error = %err, "Retrying sync");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Pulls the remote profile and trainings for the signed-in user.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport, ClientError> {
        let Some(session) = self.remote.session().await? else {
            return Err(ClientError::Unauthorized("Sign in to sync".to_string()));
        };
        let mut report = ReconcileReport::default();

        match self.remote.fetch_profile().await? {
            Some(profile) => {
                self.merge_profile(
                    &profile,
                    self.has_pending(&OutboxOp::PushProfile),
                    self.has_pending(&OutboxOp::PushRole),
                )?;
                if let Some(provider) = session.provider_avatar_url.as_deref() {
                    self.adopt_provider_avatar(provider, profile.avatar_url.as_deref())
                        .await?;
                }
            }
            None => {
                self.create_remote_profile(&session.email, session.provider_avatar_url.as_deref())
                    .await?;
                report.created_profile = true;
            }
        }

        let local = self.store.trainings();
        let remote = self.remote.fetch_trainings().await?;
        if local.is_empty() && !remote.is_empty() {
            report.pulled_trainings = remote.len();
            self.store.set(keys::TRAININGS, &remote)?;
        } else if !local.is_empty() {
            self.enqueue(OutboxOp::PushTrainings)?;
            report.queued_trainings = true;
        }

        info!(?report, "Reconciled with backend");
        self.publish(|status| status.last_synced_at = Some(Utc::now()));
        Ok(report)
    }

    /// Remote fields overwrite local ones, except those with local edits
    /// still waiting in the outbox.
    fn merge_profile(
        &self,
        profile: &Profile,
        keep_local_fields: bool,
        keep_local_role: bool,
    ) -> Result<(), ClientError> {
        if !keep_local_role {
            self.store.set_role(profile.role)?;
        }
        if keep_local_fields {
            debug!("Local profile edits pending, keeping them over the remote copy");
            return Ok(());
        }

        if !profile.name.is_empty() {
            self.store.set_name(&profile.name)?;
        }
        self.store.set(keys::BELT, &profile.belt)?;
        self.store.set(keys::DEGREES, &profile.degrees)?;
        self.store.set(keys::ACADEMIES, &profile.academies)?;
        if let Some(main) = &profile.main_academy {
            self.store.set(keys::MAIN_ACADEMY, main)?;
        }
        if let Some(avatar) = &profile.avatar_url {
            self.store.set_avatar_url(avatar)?;
        }
        self.store.set_language(&profile.language)?;
        Ok(())
    }

    async fn adopt_provider_avatar(
        &self,
        provider: &str,
        stored: Option<&str>,
    ) -> Result<(), ClientError> {
        if stored == Some(provider) {
            return Ok(());
        }
        self.store.set_avatar_url(provider)?;
        if let Err(err) = self.remote.set_avatar_url(provider).await {
            warn!(error = %err, "Could not push provider avatar, queueing profile push");
            self.enqueue(OutboxOp::PushProfile)?;
        }
        Ok(())
    }

    async fn create_remote_profile(
        &self,
        email: &str,
        provider_avatar: Option<&str>,
    ) -> Result<(), ClientError> {
        let mut payload = self.store.profile_payload();
        if payload.name.is_empty() {
            payload.name = email.split('@').next().unwrap_or_default().to_string();
            self.store.set_name(&payload.name)?;
        }
        if let Some(provider) = provider_avatar {
            payload.avatar_url = Some(provider.to_string());
            self.store.set_avatar_url(provider)?;
        }
        payload.role = Some(Role::Student);

        self.remote.upsert_profile(&payload).await?;
        if !self.has_pending(&OutboxOp::PushRole) {
            self.store.set_role(Role::Student)?;
        }
        info!("Created remote profile from local state");
        Ok(())
    }

    /// Pushes the profile after local profile fields go quiet for `debounce`.
    /// Dropping the handle stops the task.
    pub fn spawn_profile_push(self: &Arc<Self>, debounce: Duration) -> ProfilePushHandle {
        let mut changes = self.store.subscribe();
        let this = Arc::clone(self);

        let task = tokio::spawn(async move {
            while next_profile_change(&mut changes).await {
                loop {
                    match tokio::time::timeout(debounce, next_profile_change(&mut changes)).await {
                        Ok(true) => continue,
                        Ok(false) => return,
                        Err(_) => break,
                    }
                }

                if let Err(err) = this.enqueue(OutboxOp::PushProfile) {
                    warn!(error = %err, "Could not queue profile push");
                    continue;
                }
                if let Err(err) = this.flush().await {
                    warn!(error = %err, "Profile push left in outbox");
                }
            }
        });

        ProfilePushHandle { task }
    }
}

/// `false` once the store is gone.
async fn next_profile_change(changes: &mut Receiver<StoreChange>) -> bool {
    loop {
        match changes.recv().await {
            Ok(change) if keys::is_profile_key(&change.key) => return true,
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Store notifications lagged");
                return true;
            }
            Err(RecvError::Closed) => return false,
        }
    }
}

pub struct ProfilePushHandle {
    task: JoinHandle<()>,
}

impl Drop for ProfilePushHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
