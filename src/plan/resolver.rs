//! Operation resolution across state stores.
//!
//! A plan command may find its operation in the cluster store, the host-local
//! update or join stores, or the install wizard. This module merges them and
//! resolves the single operation the command should act on.

use std::collections::HashMap;
use std::sync::Arc;

use slog::{debug, info, warn, Logger};

use crate::defaults;
use crate::error::{Error, Result};
use crate::localenv::LocalEnvironment;
use crate::ops::{Operation, OperationType, Operator, Site};
use crate::storage::{BackendGetter, OperationGetter, OperationsBackend, OperatorGetter};

/// Operations merged from every reachable state store, keyed by ID.
pub(crate) struct BackendOperations {
    operations: HashMap<String, Operation>,
    /// Most recent operation observed in the cluster store, if any
    cluster_operation: Option<Operation>,
    logger: Logger,
}

impl BackendOperations {
    pub(crate) fn new(logger: Logger) -> Self {
        Self {
            operations: HashMap::new(),
            cluster_operation: None,
            logger,
        }
    }

    /// Populates the map from the given environments.
    ///
    /// Precedence: the host-local update and join stores overwrite cluster
    /// state for their operation, and the wizard overwrites everything while
    /// an install is in flight.
    pub(crate) async fn list(
        &mut self,
        local_env: &LocalEnvironment,
        update_env: Option<&LocalEnvironment>,
        join_env: Option<&LocalEnvironment>,
    ) -> Result<()> {
        match local_env.cluster_environment(defaults::ETCD_CONNECT_TIMEOUT).await {
            Ok(cluster_env) => {
                if let Err(err) = self.init_from_cluster(cluster_env.backend).await {
                    debug!(self.logger, "Failed to query cluster operations."; "error" => %err);
                }
            }
            Err(err) => {
                debug!(self.logger, "Failed to create cluster environment."; "error" => %err);
            }
        }
        if let Some(env) = update_env {
            self.fetch_and_cache(&BackendGetter::new(env.backend()), "update").await;
        }
        if let Some(env) = join_env {
            self.fetch_and_cache(&BackendGetter::new(env.backend()), "expand").await;
        }
        // Only consult the wizard if an install is ongoing or the cluster
        // store had nothing to say
        if self.is_active_install_operation() {
            if let Ok(remote_env) = local_env.remote_environment().await {
                if let Some(operator) = remote_env.operator {
                    match local_site(operator.as_ref()).await {
                        Ok(site) => {
                            info!(self.logger, "Fetching operation from wizard.");
                            self.fetch_and_cache(&OperatorGetter::new(operator, site.key), "install")
                                .await;
                            return Ok(());
                        }
                        Err(err) => {
                            warn!(self.logger, "Failed to connect to wizard."; "error" => %err);
                        }
                    }
                }
            }
            let wizard_backend = local_env.local_wizard_backend()?;
            info!(self.logger, "Fetching operation directly from wizard backend.");
            self.fetch_and_cache(&BackendGetter::new(wizard_backend), "install").await;
        }
        Ok(())
    }

    async fn init_from_cluster(&mut self, backend: Arc<dyn OperationsBackend>) -> Result<()> {
        let mut cluster_operations = backend.get_operations().await?;
        if cluster_operations.is_empty() {
            return Ok(());
        }
        sort_descending(&mut cluster_operations);
        self.cluster_operation = Some(cluster_operations[0].clone());
        for op in cluster_operations {
            self.operations.insert(op.id.clone(), op);
        }
        Ok(())
    }

    /// Fetches an operation through the getter and overwrites the map entry.
    /// The fetched operation takes precedence over cluster state.
    async fn fetch_and_cache(&mut self, getter: &dyn OperationGetter, context: &str) {
        match getter.get_operation().await {
            Ok(op) => {
                self.operations.insert(op.id.clone(), op);
            }
            Err(err) => {
                warn!(self.logger, "Failed to query operation."; "context" => context.to_string(), "error" => %err);
            }
        }
    }

    fn is_active_install_operation(&self) -> bool {
        // The wizard stays the source of truth during installs: completion
        // replicated through the cluster store can appear before the
        // wizard's own state does. Do not trust cluster state here.
        match &self.cluster_operation {
            None => true,
            Some(op) => op.op_type == OperationType::Install,
        }
    }

    fn into_operations(self, operation_id: Option<&str>) -> Vec<Operation> {
        let mut result: Vec<Operation> = self
            .operations
            .into_values()
            .filter(|op| operation_id.map_or(true, |id| id == op.id))
            .collect();
        sort_descending(&mut result);
        result
    }
}

/// Most recent first; ID breaks ties deterministically.
fn sort_descending(operations: &mut [Operation]) {
    operations.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.id.cmp(&a.id)));
}

/// The single cluster owned by the wizard. The wizard tunnels APIs into the
/// installed cluster, so the local cluster has to be looked up rather than
/// assumed.
async fn local_site(operator: &dyn Operator) -> Result<Site> {
    let mut sites = operator.get_sites(defaults::SYSTEM_ACCOUNT_ID).await?;
    if sites.len() != 1 {
        return Err(Error::BadParameter(format!(
            "expected a single cluster, but found {}",
            sites.len()
        )));
    }
    Ok(sites.swap_remove(0))
}

/// Operations from all reachable state stores matching the optional ID
/// filter, most recent first.
pub async fn get_backend_operations(
    local_env: &LocalEnvironment,
    update_env: Option<&LocalEnvironment>,
    join_env: Option<&LocalEnvironment>,
    operation_id: Option<&str>,
) -> Result<Vec<Operation>> {
    let mut backend = BackendOperations::new(local_env.logger().clone());
    backend.list(local_env, update_env, join_env).await?;
    Ok(backend.into_operations(operation_id))
}

/// The most recently created operation matching the filter.
pub async fn get_last_operation(
    local_env: &LocalEnvironment,
    update_env: Option<&LocalEnvironment>,
    join_env: Option<&LocalEnvironment>,
    operation_id: Option<&str>,
) -> Result<Operation> {
    let mut operations =
        get_backend_operations(local_env, update_env, join_env, operation_id).await?;
    debug!(local_env.logger(), "Fetched backend operations."; "operations" => oplist(&operations));
    if operations.is_empty() {
        return Err(not_found(operation_id));
    }
    if operations.len() > 1 {
        info!(
            local_env.logger(),
            "Multiple operations found:\n{}\nPlease specify operation with --operation-id. Displaying the most recent operation.",
            oplist(&operations)
        );
    }
    Ok(operations.remove(0))
}

/// The most recent operation matching the filter that has not completed yet.
/// Failed operations count as active: they are the target of resume and
/// rollback.
pub async fn get_active_operation(
    local_env: &LocalEnvironment,
    update_env: Option<&LocalEnvironment>,
    join_env: Option<&LocalEnvironment>,
    operation_id: Option<&str>,
) -> Result<Operation> {
    let operations = get_backend_operations(local_env, update_env, join_env, operation_id).await?;
    debug!(local_env.logger(), "Fetched backend operations."; "operations" => oplist(&operations));
    if operations.is_empty() {
        return Err(not_found(operation_id));
    }
    operations
        .into_iter()
        .find(|op| !op.is_completed())
        .ok_or_else(|| Error::NotFound("no active operations found".to_string()))
}

fn not_found(operation_id: Option<&str>) -> Error {
    match operation_id {
        Some(id) => Error::NotFound(format!("no operation with ID {} found", id)),
        None => Error::NotFound("no operation found".to_string()),
    }
}

fn oplist(operations: &[Operation]) -> String {
    operations
        .iter()
        .map(|op| op.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::localenv::{ClusterEnvironment, ClusterOpener, RemoteEnvironment, RemoteOpener};
    use crate::ops::{OperationState, SiteKey};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::time::Duration as StdDuration;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn site_key() -> SiteKey {
        SiteKey {
            account_id: defaults::SYSTEM_ACCOUNT_ID.to_string(),
            site_domain: "example.com".to_string(),
        }
    }

    fn operation(id: &str, op_type: OperationType, state: OperationState, created: DateTime<Utc>) -> Operation {
        Operation {
            id: id.to_string(),
            op_type,
            created,
            state,
            site: site_key(),
            payload: serde_json::Value::Null,
        }
    }

    fn timestamp(minutes_ago: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 5, 4, 12, 0, 0).single().expect("timestamp")
            - Duration::minutes(minutes_ago)
    }

    struct StaticBackend {
        operations: Vec<Operation>,
    }

    #[async_trait]
    impl OperationsBackend for StaticBackend {
        async fn get_operations(&self) -> Result<Vec<Operation>> {
            Ok(self.operations.clone())
        }

        async fn get_last_operation(&self) -> Result<Operation> {
            let mut operations = self.operations.clone();
            sort_descending(&mut operations);
            operations
                .into_iter()
                .next()
                .ok_or_else(|| Error::NotFound("no operation found".to_string()))
        }
    }

    struct StaticCluster {
        backend: Arc<dyn OperationsBackend>,
    }

    #[async_trait]
    impl ClusterOpener for StaticCluster {
        async fn open(&self, _connect_timeout: StdDuration) -> Result<ClusterEnvironment> {
            Ok(ClusterEnvironment {
                backend: self.backend.clone(),
            })
        }
    }

    struct StaticOperator {
        sites: Vec<Site>,
        operation: Operation,
        /// Counts get_sites calls so tests can assert the wizard was left alone
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Operator for StaticOperator {
        async fn get_sites(&self, _account_id: &str) -> Result<Vec<Site>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.sites.clone())
        }

        async fn get_last_operation(&self, _key: &SiteKey) -> Result<Operation> {
            Ok(self.operation.clone())
        }
    }

    struct StaticRemote {
        operator: Arc<StaticOperator>,
    }

    #[async_trait]
    impl RemoteOpener for StaticRemote {
        async fn open(&self) -> Result<RemoteEnvironment> {
            Ok(RemoteEnvironment {
                operator: Some(self.operator.clone()),
            })
        }
    }

    fn env_with_cluster(operations: Vec<Operation>) -> LocalEnvironment {
        let empty = Arc::new(StaticBackend { operations: vec![] });
        LocalEnvironment::new(empty, test_logger()).with_cluster_opener(Arc::new(StaticCluster {
            backend: Arc::new(StaticBackend { operations }),
        }))
    }

    fn wizard_operator(operation: Operation) -> Arc<StaticOperator> {
        Arc::new(StaticOperator {
            sites: vec![Site {
                key: site_key(),
                state: "installing".to_string(),
            }],
            operation,
            calls: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn operations_sorted_descending_by_creation_time() {
        let env = env_with_cluster(vec![
            operation("c", OperationType::Update, OperationState::Completed, timestamp(30)),
            operation("a", OperationType::Expand, OperationState::Completed, timestamp(1)),
            operation("b", OperationType::Update, OperationState::Completed, timestamp(10)),
        ]);

        let operations = get_backend_operations(&env, None, None, None).await.expect("list");
        let ids: Vec<_> = operations.iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(operations.windows(2).all(|w| w[0].created >= w[1].created));
    }

    #[tokio::test]
    async fn wizard_overrides_cluster_completion_for_installs() {
        // The cluster store claims the install has completed; the wizard
        // disagrees and wins.
        let env = env_with_cluster(vec![operation(
            "op-1",
            OperationType::Install,
            OperationState::Completed,
            timestamp(5),
        )])
        .with_remote_opener(Arc::new(StaticRemote {
            operator: wizard_operator(operation(
                "op-1",
                OperationType::Install,
                OperationState::Active,
                timestamp(5),
            )),
        }));

        let active = get_active_operation(&env, None, None, None).await.expect("active operation");
        assert_eq!(active.id, "op-1");
        assert_eq!(active.state, OperationState::Active);
    }

    #[tokio::test]
    async fn wizard_not_consulted_for_non_install_cluster_operation() {
        let operator = wizard_operator(operation(
            "ignored",
            OperationType::Install,
            OperationState::Active,
            timestamp(1),
        ));
        let env = env_with_cluster(vec![operation(
            "op-1",
            OperationType::Update,
            OperationState::Active,
            timestamp(5),
        )])
        .with_remote_opener(Arc::new(StaticRemote {
            operator: operator.clone(),
        }));

        let active = get_active_operation(&env, None, None, None).await.expect("active operation");
        assert_eq!(active.id, "op-1");
        assert_eq!(operator.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remote_wizard_failure_falls_back_to_local_wizard_store() {
        struct FailingRemote;

        #[async_trait]
        impl RemoteOpener for FailingRemote {
            async fn open(&self) -> Result<RemoteEnvironment> {
                Err(Error::Other("connection refused".to_string()))
            }
        }

        let env = env_with_cluster(vec![])
            .with_remote_opener(Arc::new(FailingRemote))
            .with_wizard_backend(Arc::new(StaticBackend {
                operations: vec![operation(
                    "op-1",
                    OperationType::Install,
                    OperationState::Active,
                    timestamp(2),
                )],
            }));

        let active = get_active_operation(&env, None, None, None).await.expect("active operation");
        assert_eq!(active.id, "op-1");
    }

    #[tokio::test]
    async fn local_store_overrides_cluster_state() {
        let env = env_with_cluster(vec![operation(
            "op-1",
            OperationType::Update,
            OperationState::Active,
            timestamp(5),
        )]);
        let update_env = LocalEnvironment::new(
            Arc::new(StaticBackend {
                operations: vec![operation(
                    "op-1",
                    OperationType::Update,
                    OperationState::Failed,
                    timestamp(5),
                )],
            }),
            test_logger(),
        );

        let operations = get_backend_operations(&env, Some(&update_env), None, None)
            .await
            .expect("list");
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].state, OperationState::Failed);
    }

    #[tokio::test]
    async fn last_operation_with_multiple_completed_operations() {
        let env = env_with_cluster(vec![
            operation("a", OperationType::Update, OperationState::Completed, timestamp(1)),
            operation("b", OperationType::Update, OperationState::Completed, timestamp(10)),
            operation("c", OperationType::Expand, OperationState::Completed, timestamp(30)),
        ]);

        let last = get_last_operation(&env, None, None, None).await.expect("last operation");
        assert_eq!(last.id, "a");

        let err = get_active_operation(&env, None, None, None)
            .await
            .expect_err("no active operations");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn failed_operation_is_active() {
        let env = env_with_cluster(vec![
            operation("a", OperationType::Update, OperationState::Completed, timestamp(1)),
            operation("b", OperationType::Update, OperationState::Failed, timestamp(10)),
        ]);

        let active = get_active_operation(&env, None, None, None).await.expect("active operation");
        assert_eq!(active.id, "b");
    }

    #[tokio::test]
    async fn missing_operation_id_is_not_found() {
        let env = env_with_cluster(vec![operation(
            "a",
            OperationType::Update,
            OperationState::Active,
            timestamp(1),
        )]);

        let err = get_last_operation(&env, None, None, Some("no-such-id"))
            .await
            .expect_err("should not resolve");
        assert!(err.is_not_found());
    }
}
