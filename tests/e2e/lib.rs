#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::time::Duration;

    use cdkts_operator::crd::{Actions, CdkTsStack, CdkTsStackSpec, GitSource, Phase, Source};
    use kube::api::{Api, DeleteParams, PostParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, conditions, Condition};
    use kube::ResourceExt;
    use tokio::time::timeout;

    /// Points at a throwaway CDK app and AWS account; wired through the environment so this
    /// suite never hardcodes a real repository or account number. See README for setup.
    fn test_repository() -> String {
        std::env::var("E2E_GIT_REPOSITORY").expect("E2E_GIT_REPOSITORY must be set for e2e tests")
    }

    fn test_credentials_secret() -> String {
        std::env::var("E2E_CREDENTIALS_SECRET").unwrap_or_else(|_| "cdkts-e2e-credentials".to_owned())
    }

    fn is_phase(phase: Phase) -> impl Condition<CdkTsStack> {
        move |obj: Option<&CdkTsStack>| {
            obj.and_then(|o| o.status.as_ref())
                .map(|s| s.phase == phase)
                .unwrap_or(false)
        }
    }

    async fn wait_for<C>(api: Api<CdkTsStack>, name: &str, condition: C)
    where
        C: Condition<CdkTsStack>,
    {
        timeout(Duration::from_secs(600), await_condition(api, name, condition))
            .await
            .expect("condition timed out")
            .unwrap();
    }

    fn spec(deploy: bool, destroy: bool) -> CdkTsStackSpec {
        CdkTsStackSpec {
            credentials_secret_name: test_credentials_secret(),
            source: Source {
                git: GitSource {
                    repository: test_repository(),
                    ..Default::default()
                },
            },
            actions: Actions { deploy, destroy, ..Default::default() },
            ..Default::default()
        }
    }

    async fn setup(name: &str, deploy: bool, destroy: bool) -> Api<CdkTsStack> {
        let client = Client::try_default().await.unwrap();
        let api = Api::<CdkTsStack>::namespaced(client, "default");
        let obj = CdkTsStack::new(name, spec(deploy, destroy));
        api.create(&PostParams::default(), &obj).await.unwrap();
        api
    }

    #[tokio::test]
    async fn deploy_action_disabled_fails_fast() {
        let name = "test-deploy-disabled";
        let api = setup(name, false, false).await;
        wait_for(api, name, is_phase(Phase::Failed)).await;
    }

    #[tokio::test]
    async fn deploy_enabled_converges_to_succeeded() {
        let name = "test-deploy-succeeds";
        let api = setup(name, true, true).await;
        wait_for(api, name, is_phase(Phase::Succeeded)).await;
    }

    #[tokio::test]
    async fn deletion_with_destroy_enabled_tears_down_and_removes_finalizer() {
        let name = "test-delete-destroys";
        let api = setup(name, true, true).await;
        wait_for(api.clone(), name, is_phase(Phase::Succeeded)).await;

        let obj = api.get(name).await.unwrap();
        api.delete(name, &DeleteParams::default()).await.unwrap();

        wait_for(api.clone(), name, conditions::is_deleted(&obj.uid().unwrap())).await;
    }

    #[tokio::test]
    async fn deletion_with_destroy_disabled_orphans_without_blocking() {
        let name = "test-delete-orphan";
        let api = setup(name, true, false).await;
        wait_for(api.clone(), name, is_phase(Phase::Succeeded)).await;

        let obj = api.get(name).await.unwrap();
        api.delete(name, &DeleteParams::default()).await.unwrap();

        // No destroy runs; the finalizer still needs to be removed so the object is reclaimed.
        wait_for(api.clone(), name, conditions::is_deleted(&obj.uid().unwrap())).await;
    }
}
