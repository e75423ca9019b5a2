use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::warn;

use crate::crd::{CdkTsStack, CdkTsStackStatus, Phase, FINALIZER};
use crate::error::{Error, Result};

const PATCH_RETRIES: u32 = 3;
const PATCH_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// All reads/writes of `CdkTsStack` objects, their status subresource, their finalizer list,
/// and auxiliary `Event`s. Encapsulates optimistic-concurrency retry and "resource no longer
/// exists" tolerance so the reconciliation engine never has to special-case those concerns.
pub struct ResourceStoreGateway {
    client: Client,
    reporter: Reporter,
}

impl ResourceStoreGateway {
    pub fn new(client: Client, reporter: impl Into<Reporter>) -> Self {
        Self {
            client,
            reporter: reporter.into(),
        }
    }

    fn api(&self, namespace: &str) -> Api<CdkTsStack> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Fetches the resource, retrying transient errors up to three times with a one second
    /// backoff. A genuine 404 is surfaced as [`Error::NotFound`] immediately, not retried.
    pub async fn get(&self, namespace: &str, name: &str) -> Result<CdkTsStack> {
        let api = self.api(namespace);
        let mut attempt = 0;
        loop {
            match api.get(name).await {
                Ok(obj) => return Ok(obj),
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Err(Error::NotFound),
                Err(e) => {
                    attempt += 1;
                    if attempt >= PATCH_RETRIES {
                        return Err(Error::KubeError(e));
                    }
                    warn!(namespace, name, attempt, error = %e, "transient error reading resource, retrying");
                    tokio::time::sleep(PATCH_RETRY_BACKOFF).await;
                }
            }
        }
    }

    /// Merge-patches the status subresource. Re-reading and retrying once on conflict.
    /// Tolerates the object having disappeared: logs and returns `Ok(())` rather than
    /// propagating `NotFound`, since a race with deletion is not a reconciliation failure.
    pub async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        phase: Phase,
        message: impl Into<String>,
    ) -> Result<()> {
        self.patch_status_with(namespace, name, phase, message, |_| {}).await
    }

    /// As [`Self::patch_status`] but allows the caller to set additional status fields (e.g.
    /// `driftDetected`, `lastDriftCheck`) via `mutate`.
    pub async fn patch_status_with(
        &self,
        namespace: &str,
        name: &str,
        phase: Phase,
        message: impl Into<String>,
        mutate: impl Fn(&mut CdkTsStackStatus),
    ) -> Result<()> {
        let api = self.api(namespace);
        let message = message.into();

        let mut attempt = 0;
        loop {
            let mut status = match api.get_status(name).await {
                Ok(obj) => obj.status.unwrap_or_default(),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    warn!(namespace, name, "status patch target no longer exists, skipping");
                    return Ok(());
                }
                Err(e) => return Err(Error::KubeError(e)),
            };

            status.phase = phase.clone();
            status.message = message.clone();
            mutate(&mut status);

            let patch = json!({ "status": status });
            match api
                .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    warn!(namespace, name, "status patch target disappeared mid-patch, skipping");
                    return Ok(());
                }
                Err(kube::Error::Api(ae)) if ae.code == 409 && attempt < 1 => {
                    attempt += 1;
                    warn!(namespace, name, "status patch conflict, retrying once");
                    continue;
                }
                Err(e) => return Err(Error::KubeError(e)),
            }
        }
    }

    /// As [`Self::patch_status_with`] but leaves `phase`/`message` untouched, only applying
    /// `mutate`. Used by the sweepers to update drift/git-sync fields without touching phase
    /// directly (the caller decides the phase separately via [`Self::patch_status`]).
    pub async fn patch_status_fields(
        &self,
        namespace: &str,
        name: &str,
        mutate: impl Fn(&mut CdkTsStackStatus),
    ) -> Result<()> {
        let current = match self.get(namespace, name).await {
            Ok(obj) => obj,
            Err(Error::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        let phase = current.status.clone().unwrap_or_default().phase;
        let message = current.status.clone().unwrap_or_default().message;
        self.patch_status_with(namespace, name, phase, message, mutate).await
    }

    /// Appends the controller's finalizer if absent. Idempotent: calling this twice never adds
    /// the finalizer a second time. Returns whether it was newly added.
    pub async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<bool> {
        let api = self.api(namespace);
        let obj = match api.get(name).await {
            Ok(obj) => obj,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(false),
            Err(e) => return Err(Error::KubeError(e)),
        };

        let finalizers = obj.finalizers();
        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(false);
        }

        let mut new_finalizers = finalizers.to_vec();
        new_finalizers.push(FINALIZER.to_owned());
        let patch = json!({
            "metadata": { "finalizers": new_finalizers }
        });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    /// Removes the controller's finalizer. Idempotent and tolerant of the object already being
    /// gone, since by the time destroy finishes Kubernetes may have already reclaimed it.
    pub async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api = self.api(namespace);
        let obj = match api.get(name).await {
            Ok(obj) => obj,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(Error::KubeError(e)),
        };

        let finalizers = obj.finalizers();
        if !finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        let new_finalizers: Vec<String> = finalizers.iter().filter(|f| *f != FINALIZER).cloned().collect();
        let patch = json!({
            "metadata": { "finalizers": new_finalizers }
        });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    /// Creates a Kubernetes `Event` owned by the resource's UID. Failures are logged, never
    /// propagated: an event we couldn't emit must not fail the surrounding operation.
    pub async fn emit_event(
        &self,
        namespace: &str,
        obj_ref: &CdkTsStack,
        type_: EventType,
        reason: &str,
        message: impl Into<String>,
    ) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            obj_ref.object_ref(&()),
        );
        let result = recorder
            .publish(Event {
                type_,
                reason: reason.to_owned(),
                note: Some(message.into()),
                action: reason.to_owned(),
                secondary: None,
            })
            .await;
        if let Err(e) = result {
            warn!(namespace, reason, error = %e, "failed to emit event");
        }
    }

    /// All `CdkTsStack` objects across every namespace, used by the sweepers.
    pub async fn list_all(&self) -> Result<Vec<CdkTsStack>> {
        let api: Api<CdkTsStack> = Api::all(self.client.clone());
        let list = api.list(&Default::default()).await.map_err(Error::KubeError)?;
        Ok(list.items)
    }
}

/// Builds the `status` metadata block used when synthesizing test fixtures; production code
/// never constructs `ObjectMeta` by hand outside tests.
#[cfg(test)]
pub(crate) fn test_meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_owned()),
        namespace: Some(namespace.to_owned()),
        ..Default::default()
    }
}
