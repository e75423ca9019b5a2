use std::time::Duration;

/// Every environment-configurable knob the reconciliation engine reads at startup, per spec.md
/// §6 "Environment configuration" plus the operator-level concurrency/retry knobs §5 requires to
/// actually run. Flattened into the binary's top-level `clap::Parser` struct so a single `--help`
/// lists everything; each field also accepts its env var directly.
#[derive(clap::Args, Debug, Clone)]
pub struct ReconcilerConfig {
    /// Shortcut for `--log-filter debug`; kept separate because the original tool gates a lot of
    /// extra diagnostic output behind one flag rather than a directive string.
    #[arg(long, env = "DEBUG_MODE", default_value_t = false)]
    pub debug_mode: bool,

    /// Cron expression for the drift-check sweep.
    #[arg(long, env = "DRIFT_CHECK_CRON", default_value = "0 */30 * * * *")]
    pub drift_check_cron: String,

    /// Cron expression for the Git-sync sweep.
    #[arg(long, env = "GIT_SYNC_CHECK_CRON", default_value = "0 */5 * * * *")]
    pub git_sync_check_cron: String,

    /// Prefix prepended to every emitted metric name.
    #[arg(long, env = "METRICS_PREFIX", default_value = "cdktsstack_")]
    pub metrics_prefix: String,

    /// Path of the line-delimited JSON metrics sink.
    #[arg(long, env = "METRICS_PATH", default_value = "/var/run/cdkts-operator/metrics.jsonl")]
    pub metrics_path: String,

    /// Mirrored into deployed stacks' environment as `CDK_DEFAULT_ACCOUNT`.
    #[arg(long, env = "CDK_DEFAULT_ACCOUNT", default_value = "")]
    pub cdk_default_account: String,

    /// Mirrored into deployed stacks' environment as `CDK_DEFAULT_REGION`, overriding
    /// `spec.awsRegion`'s mirror when set.
    #[arg(long, env = "CDK_DEFAULT_REGION")]
    pub cdk_default_region: Option<String>,

    /// Forwarded verbatim into every spawned `node`/`npm`/`cdk` process (e.g. for
    /// `--max-old-space-size`).
    #[arg(long, env = "NODE_OPTIONS", default_value = "")]
    pub node_options: String,

    /// Upper bound on concurrently in-flight reconciles across distinct resources.
    #[arg(long, env = "RECONCILE_CONCURRENCY", default_value_t = 8)]
    pub concurrency: usize,

    /// Per-key retry attempts before a failing reconcile is dropped until the next watch resync.
    #[arg(long, env = "RECONCILE_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Backoff between retries of the same key.
    #[arg(long, env = "RECONCILE_RETRY_BACKOFF_SECONDS", default_value_t = 30)]
    pub retry_backoff_seconds: u64,

    /// Floor for the `cdk deploy`/`cdk destroy` timeout; §4.1 requires at least 30 minutes.
    #[arg(long, env = "CDK_DEPLOY_TIMEOUT_SECONDS", default_value_t = 30 * 60)]
    pub deploy_timeout_seconds: u64,
}

impl ReconcilerConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_seconds)
    }

    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_seconds.max(30 * 60))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn reconciler_config_is_a_valid_clap_args_struct() {
        #[derive(clap::Parser)]
        struct Wrapper {
            #[command(flatten)]
            reconciler: ReconcilerConfig,
        }
        Wrapper::command().debug_assert();
    }

    #[test]
    fn deploy_timeout_never_goes_below_the_thirty_minute_floor() {
        let cfg = ReconcilerConfig {
            debug_mode: false,
            drift_check_cron: String::new(),
            git_sync_check_cron: String::new(),
            metrics_prefix: String::new(),
            metrics_path: String::new(),
            cdk_default_account: String::new(),
            cdk_default_region: None,
            node_options: String::new(),
            concurrency: 8,
            max_retries: 3,
            retry_backoff_seconds: 30,
            deploy_timeout_seconds: 60,
        };
        assert_eq!(cfg.deploy_timeout(), Duration::from_secs(30 * 60));
    }
}
