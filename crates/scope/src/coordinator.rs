//! Per-build agent scope: resolve credentials, start an agent, load the
//! identities, publish the socket, and always tear it all down again, even
//! when the controller restarted in between.

use keyward_agent::{AgentHandle, AgentSelector, AUTH_SOCK_VAR};
use keyward_core::{dedup_ids, BuildLog, CredentialStore, Error, Node, Result, SshCredential};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::record::{ScopeRecord, ScopeState};
use crate::store::ScopeStore;

/// Everything a scope needs from its surroundings.
#[derive(Clone)]
pub struct ScopeContext {
    pub node: Arc<dyn Node>,
    pub credentials: Arc<dyn CredentialStore>,
    pub selector: Arc<AgentSelector>,
    pub store: ScopeStore,
    pub log: BuildLog,
    /// Parent directory for the per-scope work directory on the node.
    pub temp_hint: Option<PathBuf>,
}

impl ScopeContext {
    pub fn new(
        node: Arc<dyn Node>,
        credentials: Arc<dyn CredentialStore>,
        selector: Arc<AgentSelector>,
        store: ScopeStore,
        log: BuildLog,
    ) -> Self {
        Self {
            node,
            credentials,
            selector,
            store,
            log,
            temp_hint: None,
        }
    }

    pub fn with_temp_hint(mut self, dir: Option<PathBuf>) -> Self {
        self.temp_hint = dir;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScopeRequest {
    pub credential_ids: Vec<String>,
    /// Skip unknown credential ids instead of failing the scope.
    pub ignore_missing: bool,
}

impl ScopeRequest {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            credential_ids: ids.into_iter().map(Into::into).collect(),
            ignore_missing: false,
        }
    }

    pub fn ignore_missing(mut self, ignore: bool) -> Self {
        self.ignore_missing = ignore;
        self
    }
}

/// A live agent bound to one build scope.
///
/// Dropping a scope without [`AgentScope::finish`] still stops the agent
/// (the handle's host does that), but leaves the persisted record and its
/// ledger behind for [`AgentScope::resume`] or [`AgentScope::purge`].
pub struct AgentScope {
    ctx: ScopeContext,
    record: ScopeRecord,
    handle: Option<AgentHandle>,
    /// SHA-256 of every key already in the agent.
    added: HashSet<String>,
}

impl AgentScope {
    pub async fn begin(ctx: ScopeContext, request: ScopeRequest) -> Result<Self> {
        let ids = dedup_ids(&request.credential_ids);
        let mut record = ScopeRecord::new(
            Uuid::new_v4().to_string(),
            ctx.node.name(),
            ids,
            request.ignore_missing,
        );
        record.temp_hint = ctx.temp_hint.clone();
        info!(scope = %record.id, node = %record.node, credentials = ?record.credential_ids, "Beginning agent scope");
        let mut scope = Self {
            ctx,
            record,
            handle: None,
            added: HashSet::new(),
        };

        scope.record.set_state(ScopeState::Resolving);
        let ids = scope.record.credential_ids.clone();
        let credentials = match scope.resolve(&ids).await {
            Ok(c) => c,
            Err(e) => {
                scope.ctx.log.fatal(e.to_string());
                return Err(e);
            }
        };
        scope.bring_up(&credentials).await?;
        Ok(scope)
    }

    /// Rebuilds a scope whose controller went away mid-build: stops the old
    /// agent if it is still around, deletes every ledgered artifact, then
    /// starts a fresh agent with the same credentials. The work directory
    /// goes where the scope first put it; the context's hint only applies
    /// to records that never had one.
    pub async fn resume(ctx: ScopeContext, id: &str) -> Result<Self> {
        let mut record = ctx.store.load(id).await?;
        record.claim();
        if record.temp_hint.is_none() {
            record.temp_hint = ctx.temp_hint.clone();
        }
        ctx.log.line(format!("Resuming ssh-agent for scope {}", id));
        info!(scope = %id, artifacts = record.ledger.entries().len(), "Resuming agent scope");
        let mut scope = Self {
            ctx,
            record,
            handle: None,
            added: HashSet::new(),
        };

        scope.stop_orphan().await;
        scope.purge_ledger().await;
        scope.ctx.store.save(&scope.record).await?;

        scope.record.set_state(ScopeState::Resolving);
        let ids = scope.record.credential_ids.clone();
        let credentials = match scope.resolve(&ids).await {
            Ok(c) => c,
            Err(e) => {
                scope.ctx.log.fatal(e.to_string());
                scope.teardown().await;
                return Err(e);
            }
        };
        scope.bring_up(&credentials).await?;
        Ok(scope)
    }

    /// Cleans up after a scope without starting anything. Returns how many
    /// artifacts were deleted.
    pub async fn purge(ctx: ScopeContext, id: &str) -> Result<usize> {
        let record = ctx.store.load(id).await?;
        let mut scope = Self {
            ctx,
            record,
            handle: None,
            added: HashSet::new(),
        };
        scope.stop_orphan().await;
        let deleted = scope.purge_ledger().await;
        scope.forget_or_keep_record().await;
        Ok(deleted)
    }

    /// Begins a scope, runs `body` with the published environment, and
    /// tears down whatever the outcome.
    pub async fn run<F, Fut, T>(
        ctx: ScopeContext,
        request: ScopeRequest,
        cancel: &CancellationToken,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(BTreeMap<String, String>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("build was cancelled before the agent started".to_string()));
        }
        let scope = Self::begin(ctx, request).await?;
        let env = scope.environment();
        scope.run_body(cancel, body(env)).await
    }

    /// Runs `body` and then tears down. Cancellation abandons the body and
    /// goes straight to teardown.
    pub async fn run_body<F, T>(mut self, cancel: &CancellationToken, body: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let outcome = tokio::select! {
            result = body => result,
            _ = cancel.cancelled() => {
                self.ctx.log.line("Build cancelled");
                Err(Error::Cancelled(format!("scope {}", self.record.id)))
            }
        };
        self.teardown().await;
        outcome
    }

    pub async fn finish(mut self) {
        self.teardown().await;
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn record(&self) -> &ScopeRecord {
        &self.record
    }

    pub fn socket(&self) -> Option<&str> {
        self.record.socket()
    }

    /// Variables to export into the build body.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(socket) = self.socket() {
            env.insert(AUTH_SOCK_VAR.to_string(), socket.to_string());
        }
        env
    }

    /// Loads more credentials into the running agent, as a nested wrapper
    /// does. Keys already in the agent are not added again.
    pub async fn add_credentials<S: AsRef<str>>(&mut self, ids: &[S]) -> Result<()> {
        let new_ids: Vec<String> = dedup_ids(ids)
            .into_iter()
            .filter(|id| !self.record.credential_ids.contains(id))
            .collect();
        if new_ids.is_empty() {
            return Ok(());
        }
        let result = async {
            let credentials = self.resolve(&new_ids).await?;
            self.provision(&credentials).await?;
            self.record.credential_ids.extend(new_ids.iter().cloned());
            self.record.set_state(ScopeState::Running);
            self.ctx.store.save(&self.record).await
        }
        .await;
        if let Err(e) = &result {
            self.ctx.log.fatal(e.to_string());
        }
        result
    }

    async fn resolve(&self, ids: &[String]) -> Result<Vec<SshCredential>> {
        let mut resolved = Vec::new();
        let mut missing = Vec::new();
        for id in ids {
            match self.ctx.credentials.lookup(id).await? {
                Some(credential) => resolved.push(credential),
                None => missing.push(id.clone()),
            }
        }
        if !missing.is_empty() {
            if !self.record.ignore_missing {
                return Err(Error::CredentialNotFound(missing.join(", ")));
            }
            for id in &missing {
                self.ctx.log.line(format!("Ignoring missing credentials: {}", id));
            }
        }
        for credential in &resolved {
            self.ctx.credentials.track(&credential.id).await;
        }
        Ok(resolved)
    }

    async fn bring_up(&mut self, credentials: &[SshCredential]) -> Result<()> {
        let result = async {
            self.start_agent().await?;
            self.provision(credentials).await?;
            self.record.set_state(ScopeState::Running);
            self.ctx.store.save(&self.record).await
        }
        .await;

        match result {
            Ok(()) => {
                info!(scope = %self.record.id, socket = ?self.socket(), "Agent scope running");
                Ok(())
            }
            Err(e) => {
                // The selector has already written its own report.
                if !matches!(e, Error::NoProvider(_)) {
                    self.ctx.log.fatal(e.to_string());
                }
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn start_agent(&mut self) -> Result<()> {
        self.record.set_state(ScopeState::Starting);
        let base = self
            .record
            .temp_hint
            .clone()
            .unwrap_or_else(|| self.ctx.node.temp_dir());
        let short: String = self.record.id.chars().take(8).collect();
        let work_dir = base.join(format!("keyward-{}", short));

        self.record.ledger.record(&work_dir);
        self.ctx.store.save(&self.record).await?;
        self.ctx.node.create_dir(&work_dir).await?;

        let selection = self
            .ctx
            .selector
            .select(&self.ctx.node, &self.ctx.log, Some(&work_dir))
            .await?;
        self.handle = Some(selection.handle.clone());
        self.record.provider = Some(selection.provider);

        let env = selection.handle.environment().await?;
        let socket = selection.handle.socket().await?;
        self.record.ledger.record(PathBuf::from(&socket));
        self.record.agent_env = env;
        self.ctx.store.save(&self.record).await
    }

    async fn provision(&mut self, credentials: &[SshCredential]) -> Result<()> {
        self.record.set_state(ScopeState::Provisioning);
        let handle = self
            .handle
            .clone()
            .ok_or_else(|| Error::Other("no agent is running for this scope".to_string()))?;

        for credential in credentials {
            let description = credential.description();
            self.ctx.log.line(format!("Using credentials {}", description));
            for key in &credential.private_keys {
                let digest = hex::encode(Sha256::digest(key.as_bytes()));
                if self.added.contains(&digest) {
                    debug!(credential = %credential.id, "Key already in agent, skipping");
                    continue;
                }
                handle
                    .add_identity(key.as_str(), credential.passphrase(), &description)
                    .await?;
                self.added.insert(digest);
            }
        }
        Ok(())
    }

    async fn stop_orphan(&mut self) {
        let key = match self.record.provider.take() {
            Some(k) => k,
            None => return,
        };
        if self.record.agent_env.is_empty() {
            return;
        }
        match self.ctx.selector.provider(&key) {
            Some(provider) => {
                match provider.stop_orphan(&self.ctx.node, &self.record.agent_env).await {
                    Ok(()) => info!(scope = %self.record.id, "Stopped orphaned ssh-agent"),
                    Err(e) => debug!(scope = %self.record.id, error = %e, "Orphaned ssh-agent not stopped"),
                }
            }
            None => warn!(provider = %key, "Provider of orphaned ssh-agent is not registered"),
        }
        self.record.agent_env.clear();
    }

    async fn purge_ledger(&mut self) -> usize {
        let deleted = self
            .record
            .ledger
            .purge(self.ctx.node.as_ref(), &self.ctx.log)
            .await;
        debug!(scope = %self.record.id, deleted, remaining = self.record.ledger.entries().len(), "Purged scope artifacts");
        deleted
    }

    async fn forget_or_keep_record(&mut self) {
        if self.record.ledger.is_empty() {
            if let Err(e) = self.ctx.store.remove(&self.record.id).await {
                warn!(scope = %self.record.id, error = %e, "Failed to remove scope record");
            }
            return;
        }
        self.ctx.log.warn(format!(
            "{} artifact(s) of scope {} could not be deleted; run `keyward purge {}`",
            self.record.ledger.entries().len(),
            self.record.id,
            self.record.id
        ));
        if let Err(e) = self.ctx.store.save(&self.record).await {
            warn!(scope = %self.record.id, error = %e, "Failed to save scope record");
        }
    }

    /// Stop and purge are attempted independently; nothing here fails.
    async fn teardown(&mut self) {
        self.record.set_state(ScopeState::TearingDown);
        if let Err(e) = self.ctx.store.save(&self.record).await {
            warn!(scope = %self.record.id, error = %e, "Failed to save scope record");
        }

        if let Some(handle) = self.handle.take() {
            match handle.stop().await {
                Ok(()) => {
                    self.record.provider = None;
                    self.record.agent_env.clear();
                }
                Err(e) => {
                    warn!(scope = %self.record.id, error = %e, "Failed to stop ssh-agent");
                    self.ctx.log.warn(format!("Failed to stop ssh-agent: {}", e));
                }
            }
        }
        self.added.clear();

        self.purge_ledger().await;
        self.forget_or_keep_record().await;
        info!(scope = %self.record.id, "Agent scope torn down");
    }
}
