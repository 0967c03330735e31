#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::time::Duration;

    use k8s_openapi::api::apps::v1::Deployment;
    use kube::api::{Api, Patch, PatchParams, PostParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, conditions, Condition};
    use kube::ResourceExt;
    use reconciler_bin::crd::{WebApp, WebAppSpec};
    use reconciler_core::status::State as ComponentState;
    use tokio::time::timeout;

    fn is_webapp_ready() -> impl Condition<WebApp> {
        |obj: Option<&WebApp>| {
            obj.and_then(|w| w.status.as_ref())
                .map(|s| s.state == ComponentState::Ready)
                .unwrap_or(false)
        }
    }

    fn is_webapp_not_ready() -> impl Condition<WebApp> {
        |obj: Option<&WebApp>| {
            obj.and_then(|w| w.status.as_ref())
                .map(|s| s.state != ComponentState::Ready)
                .unwrap_or(true)
        }
    }

    fn is_deployment_ready() -> impl Condition<Deployment> {
        |obj: Option<&Deployment>| {
            if let Some(deployment) = &obj {
                if let Some(status) = &deployment.status {
                    return status.replicas == status.updated_replicas
                        && status.replicas == status.ready_replicas;
                }
            }
            false
        }
    }

    async fn wait_for<R, C>(api: Api<R>, name: &str, condition: C)
    where
        R: kube::Resource
            + Clone
            + std::fmt::Debug
            + for<'de> k8s_openapi::serde::Deserialize<'de>
            + 'static
            + Send,
        C: Condition<R>,
    {
        timeout(
            Duration::from_secs(30),
            await_condition(api, name, condition),
        )
        .await
        .unwrap()
        .unwrap();
    }

    fn webapp_spec() -> WebAppSpec {
        WebAppSpec {
            replicas: 1,
            image: "inanimate/echo-server:latest".to_owned(),
            port: 8080,
            env_config_map: None,
        }
    }

    async fn setup(name: &str) -> (Api<WebApp>, Api<Deployment>) {
        let webapp = WebApp::new(name, webapp_spec());

        let client = Client::try_default().await.unwrap();
        let webapp_api = Api::<WebApp>::namespaced(client.clone(), "default");

        webapp_api
            .create(&PostParams::default(), &webapp)
            .await
            .unwrap();

        let deployment_api = Api::<Deployment>::namespaced(client.clone(), "default");
        wait_for(deployment_api.clone(), name, is_deployment_ready()).await;
        wait_for(webapp_api.clone(), name, is_webapp_ready()).await;
        (webapp_api, deployment_api)
    }

    #[tokio::test]
    async fn webapp_create() {
        let name = "test-create";
        setup(name).await;
    }

    #[tokio::test]
    async fn webapp_delete_deployment() {
        let name = "test-delete-deployment";
        let (webapp_api, deployment_api) = setup(name).await;

        let deploy = deployment_api.get(name).await.unwrap();
        deployment_api
            .delete(name, &Default::default())
            .await
            .unwrap();

        wait_for(
            deployment_api.clone(),
            name,
            conditions::is_deleted(&deploy.uid().unwrap()),
        )
        .await;
        wait_for(deployment_api.clone(), name, is_deployment_ready()).await;
        wait_for(webapp_api.clone(), name, is_webapp_ready()).await;

        let check_deploy_deleted = deployment_api.get(name).await.unwrap();

        webapp_api.delete(name, &Default::default()).await.unwrap();

        wait_for(
            deployment_api,
            name,
            conditions::is_deleted(&check_deploy_deleted.uid().unwrap()),
        )
        .await;
    }

    #[tokio::test]
    async fn webapp_delete_webapp() {
        let name = "test-delete-webapp";
        let (webapp_api, deployment_api) = setup(name).await;

        let deploy = deployment_api.get(name).await.unwrap();
        let webapp = webapp_api.get(name).await.unwrap();
        webapp_api.delete(name, &Default::default()).await.unwrap();

        wait_for(
            webapp_api.clone(),
            name,
            conditions::is_deleted(&webapp.uid().unwrap()),
        )
        .await;

        wait_for(
            deployment_api.clone(),
            name,
            conditions::is_deleted(&deploy.uid().unwrap()),
        )
        .await;
    }

    #[tokio::test]
    async fn webapp_change_deployment_reverted() {
        let name = "test-change-deployment";
        let (webapp_api, deployment_api) = setup(name).await;

        let mut deploy = deployment_api.get(name).await.unwrap();
        deploy.spec.as_mut().unwrap().replicas = Some(2);
        deploy.metadata.managed_fields = None;
        deployment_api
            .patch(
                name,
                &PatchParams::apply("e2e-tests").force(),
                &Patch::Apply(&deploy),
            )
            .await
            .unwrap();

        wait_for(webapp_api.clone(), name, is_webapp_not_ready()).await;
        wait_for(webapp_api.clone(), name, is_webapp_ready()).await;

        let check_deploy_replicas = deployment_api.get(name).await.unwrap();

        assert_eq!(check_deploy_replicas.spec.unwrap().replicas.unwrap(), 1);
    }

    #[tokio::test]
    async fn webapp_change_spec_propagates() {
        let name = "test-change-webapp";
        let (webapp_api, deployment_api) = setup(name).await;

        let mut webapp = webapp_api.get(name).await.unwrap();
        webapp.spec.replicas = 2;
        webapp.metadata.managed_fields = None;
        webapp_api
            .patch(
                name,
                &PatchParams::apply("e2e-tests").force(),
                &Patch::Apply(&webapp),
            )
            .await
            .unwrap();

        wait_for(webapp_api.clone(), name, is_webapp_not_ready()).await;
        wait_for(webapp_api.clone(), name, is_webapp_ready()).await;

        let check_deploy_replicas = deployment_api.get(name).await.unwrap();

        assert_eq!(check_deploy_replicas.spec.unwrap().replicas.unwrap(), 2);
    }

    #[tokio::test]
    async fn webapp_adopts_preexisting_deployment() {
        let name = "test-deployment-already-exists";
        let client = Client::try_default().await.unwrap();
        let deployment_api = Api::<Deployment>::namespaced(client, "default");

        deployment_api
            .create(
                &PostParams::default(),
                &serde_json::from_value(serde_json::json!({
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "metadata": { "name": name },
                    "spec": {
                        "replicas": 1,
                        "selector": { "matchLabels": { "app.kubernetes.io/name": name } },
                        "template": {
                            "metadata": { "labels": { "app.kubernetes.io/name": name } },
                            "spec": {
                                "containers": [{ "name": "webapp", "image": "inanimate/echo-server:latest" }],
                            },
                        },
                    },
                }))
                .unwrap(),
            )
            .await
            .unwrap();

        setup(name).await;
    }
}
