use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The controller's finalizer, added while a deployed AWS stack may still exist so that
/// destroy gets a chance to run before Kubernetes drops the object.
pub static FINALIZER: &str = "cdkstack.awscdk.dev/finalizer";

fn default_git_ref() -> String {
    "main".to_owned()
}

fn default_path() -> String {
    ".".to_owned()
}

fn default_aws_region() -> String {
    "us-east-1".to_owned()
}

/// A Git-hosted CDK project to clone before every operation.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct GitSource {
    /// Repository URL (https or ssh).
    pub repository: String,

    /// Branch/tag/commit. Defaults to `main`.
    #[serde(default = "default_git_ref")]
    pub git_ref: String,

    /// Optional SSH auth secret (`kubernetes.io/ssh-auth`) for private repos.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_secret_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Source {
    pub git: GitSource,
}

/// Boolean permission gates for AWS-side actions.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Actions {
    #[serde(default)]
    pub deploy: bool,
    #[serde(default)]
    pub destroy: bool,
    #[serde(default)]
    pub drift_detection: bool,
    #[serde(default)]
    pub auto_redeploy: bool,
}

/// Optional shell script bodies run at named stages. A `None` hook is simply skipped.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct LifecycleHooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_deploy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_deploy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_destroy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_destroy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_drift_detection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_drift_detection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_git_sync: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_git_sync: Option<String>,
}

/// `CdkTsStack` treats an AWS CDK TypeScript stack as a declarative Kubernetes resource: the
/// spec names a Git-hosted project and the AWS actions the controller is allowed to perform,
/// and the controller converges the real CloudFormation stack to match.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "awscdk.dev",
    version = "v1alpha1",
    kind = "CdkTsStack",
    shortname = "cdk",
    namespaced,
    status = "CdkTsStackStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CdkTsStackSpec {
    /// CloudFormation stack identifier. Empty targets "all stacks" in the CDK app.
    #[serde(default)]
    pub stack_name: String,

    /// Names an opaque secret in this resource's namespace holding AWS credentials.
    pub credentials_secret_name: String,

    #[serde(default = "default_aws_region")]
    pub aws_region: String,

    pub source: Source,

    #[serde(default = "default_path")]
    pub path: String,

    /// Ordered `key=value` strings passed as `--context` flags.
    #[serde(default)]
    pub cdk_context: Vec<String>,

    #[serde(default)]
    pub actions: Actions,

    #[serde(default)]
    pub lifecycle_hooks: LifecycleHooks,
}

impl CdkTsStackSpec {
    /// `--context` flags derived from `cdk_context`, in order.
    pub fn context_args(&self) -> Vec<String> {
        self.cdk_context
            .iter()
            .flat_map(|kv| vec!["--context".to_owned(), kv.clone()])
            .collect()
    }

    /// The positional CDK target: `--all` when `stack_name` is empty, else the stack name.
    pub fn stack_target(&self) -> Vec<String> {
        if self.stack_name.is_empty() {
            vec!["--all".to_owned()]
        } else {
            vec![self.stack_name.clone()]
        }
    }

    pub fn git_ref(&self) -> &str {
        if self.source.git.git_ref.is_empty() {
            "main"
        } else {
            &self.source.git.git_ref
        }
    }
}

impl Default for GitSource {
    fn default() -> Self {
        Self {
            repository: String::new(),
            git_ref: default_git_ref(),
            ssh_secret_name: None,
        }
    }
}

/// The finite set of phases a `CdkTsStack` can occupy. `DriftChecking`, `GitSyncChecking`, and
/// `Deleting` are owned phases: only the subsystem that set them may transition out.
///
/// Serializes as a plain string. Deserialization never fails: any string this engine doesn't
/// recognize becomes `Unknown`, so a future version's phase name doesn't break reconciliation
/// of an older one.
#[derive(Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    #[default]
    Empty,
    Cloning,
    Installing,
    Deploying,
    Succeeded,
    Failed,
    Deleting,
    DriftChecking,
    GitSyncChecking,
    Unknown(String),
}

impl Phase {
    pub fn is_owned(&self) -> bool {
        matches!(
            self,
            Phase::DriftChecking | Phase::GitSyncChecking | Phase::Deleting
        )
    }

    fn as_str(&self) -> &str {
        match self {
            Phase::Empty => "",
            Phase::Cloning => "Cloning",
            Phase::Installing => "Installing",
            Phase::Deploying => "Deploying",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
            Phase::Deleting => "Deleting",
            Phase::DriftChecking => "DriftChecking",
            Phase::GitSyncChecking => "GitSyncChecking",
            Phase::Unknown(s) => s,
        }
    }
}

impl From<&str> for Phase {
    fn from(s: &str) -> Self {
        match s {
            "" => Phase::Empty,
            "Cloning" => Phase::Cloning,
            "Installing" => Phase::Installing,
            "Deploying" => Phase::Deploying,
            "Succeeded" => Phase::Succeeded,
            "Failed" => Phase::Failed,
            "Deleting" => Phase::Deleting,
            "DriftChecking" => Phase::DriftChecking,
            "GitSyncChecking" => Phase::GitSyncChecking,
            other => Phase::Unknown(other.to_owned()),
        }
    }
}

impl Serialize for Phase {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Phase {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Phase::from(s.as_str()))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CdkTsStackStatus {
    #[serde(default)]
    pub phase: Phase,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deploy: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_drift_check: Option<DateTime<Utc>>,

    #[serde(default)]
    pub drift_detected: bool,
}

/// Labels attached to every emitted metric record, per spec.md §6.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct MetricLabels {
    pub namespace: String,
    pub resource_name: String,
    pub aws_region: String,
    pub stack_name: String,
}

impl MetricLabels {
    pub fn as_map(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("namespace", self.namespace.clone()),
            ("resource_name", self.resource_name.clone()),
            ("aws_region", self.aws_region.clone()),
            ("stack_name", self.stack_name.clone()),
        ])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_stack_name_targets_all() {
        let spec = CdkTsStackSpec {
            stack_name: String::new(),
            ..Default::default()
        };
        assert_eq!(spec.stack_target(), vec!["--all".to_owned()]);
    }

    #[test]
    fn named_stack_targets_itself() {
        let spec = CdkTsStackSpec {
            stack_name: "MyStack".to_owned(),
            ..Default::default()
        };
        assert_eq!(spec.stack_target(), vec!["MyStack".to_owned()]);
    }

    #[test]
    fn empty_context_has_no_flags() {
        let spec = CdkTsStackSpec::default();
        assert!(spec.context_args().is_empty());
    }

    #[test]
    fn context_entries_become_flag_pairs() {
        let spec = CdkTsStackSpec {
            cdk_context: vec!["env=prod".to_owned(), "region=eu-west-1".to_owned()],
            ..Default::default()
        };
        assert_eq!(
            spec.context_args(),
            vec![
                "--context".to_owned(),
                "env=prod".to_owned(),
                "--context".to_owned(),
                "region=eu-west-1".to_owned(),
            ]
        );
    }

    #[test]
    fn owned_phases() {
        assert!(Phase::DriftChecking.is_owned());
        assert!(Phase::GitSyncChecking.is_owned());
        assert!(Phase::Deleting.is_owned());
        assert!(!Phase::Succeeded.is_owned());
        assert!(!Phase::Failed.is_owned());
    }

    #[test]
    fn phase_roundtrips_through_json() {
        for phase in [
            Phase::Empty,
            Phase::Cloning,
            Phase::Installing,
            Phase::Deploying,
            Phase::Succeeded,
            Phase::Failed,
            Phase::Deleting,
            Phase::DriftChecking,
            Phase::GitSyncChecking,
        ] {
            let json = serde_json::to_string(&phase).unwrap();
            let back: Phase = serde_json::from_str(&json).unwrap();
            assert_eq!(phase, back);
        }
    }

    #[test]
    fn unrecognized_phase_string_does_not_panic() {
        let back: Phase = serde_json::from_str("\"SomethingElse\"").unwrap();
        assert_eq!(back, Phase::Unknown("SomethingElse".to_owned()));
    }
}
