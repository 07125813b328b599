//! Startup wiring of the persistence infrastructure.
//!
//! [`InfrastructureBuilder::build`] validates configuration, then constructs
//! the nine components in dependency order and returns them as one
//! [`Infrastructure`] value. Components are also reachable by name; names are
//! prefixed with the configured qualifier so several independently wired
//! graphs can live in one process.

use crate::config::{Config, JpaConfig, SnapshotterConfig, TokenStoreConfig};
use crate::db::schema::default_schemas;
use crate::db::{
    ConnectionProvider, DataSource, DataSourceConnectionProvider, EntityManagerProvider,
    ManagedSchema, PersistenceExceptionResolver, PersistenceProperties, PersistenceUnit,
    SqlErrorCodesResolver, UnitOfWorkAwareConnectionProvider,
};
use crate::error::InfraError;
use crate::serialization::{JsonSerializer, Serializer};
use crate::snapshot::SnapshotterFactory;
use crate::token_store::TokenStore;
use crate::tx::{SqlTransactionAdapter, TransactionManager};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    DataSource,
    PersistenceUnit,
    ExceptionResolver,
    EntityManagerProvider,
    TransactionManager,
    ConnectionProvider,
    TransactionAdapter,
    TokenStore,
    SnapshotterFactory,
}

impl Component {
    /// Construction order.
    pub const ALL: [Component; 9] = [
        Component::DataSource,
        Component::PersistenceUnit,
        Component::ExceptionResolver,
        Component::EntityManagerProvider,
        Component::TransactionManager,
        Component::ConnectionProvider,
        Component::TransactionAdapter,
        Component::TokenStore,
        Component::SnapshotterFactory,
    ];

    pub fn base_name(self) -> &'static str {
        match self {
            Component::DataSource => "ds",
            Component::PersistenceUnit => "emf",
            Component::ExceptionResolver => "persistenceExceptionResolver",
            Component::EntityManagerProvider => "emp",
            Component::TransactionManager => "tx",
            Component::ConnectionProvider => "connectionProvider",
            Component::TransactionAdapter => "transactionAdapter",
            Component::TokenStore => "tokenStore",
            Component::SnapshotterFactory => "snap",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base_name())
    }
}

fn qualified_name(qualifier: Option<&str>, component: Component) -> String {
    match qualifier {
        Some(q) => format!("{q}-{}", component.base_name()),
        None => component.base_name().to_string(),
    }
}

pub struct InfrastructureBuilder {
    jpa: JpaConfig,
    token_store: TokenStoreConfig,
    snapshotter: SnapshotterConfig,
    qualifier: Option<String>,
    schemas: Vec<&'static ManagedSchema>,
    exception_resolver: Option<Arc<dyn PersistenceExceptionResolver>>,
    connection_provider: Option<Arc<dyn ConnectionProvider>>,
    serializer: Option<Arc<dyn Serializer>>,
}

impl InfrastructureBuilder {
    pub fn new(jpa: JpaConfig) -> Self {
        Self {
            jpa,
            token_store: TokenStoreConfig::default(),
            snapshotter: SnapshotterConfig::default(),
            qualifier: None,
            schemas: default_schemas(),
            exception_resolver: None,
            connection_provider: None,
            serializer: None,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let builder = Self::new(cfg.jpa.clone())
            .token_store(cfg.token_store.clone())
            .snapshotter(cfg.snapshotter.clone());
        match cfg.qualifier.as_deref() {
            Some(q) => builder.qualifier(q),
            None => builder,
        }
    }

    /// A blank qualifier means unqualified names.
    pub fn qualifier(mut self, qualifier: impl Into<String>) -> Self {
        let qualifier = qualifier.into();
        let qualifier = qualifier.trim();
        self.qualifier = (!qualifier.is_empty()).then(|| qualifier.to_string());
        self
    }

    pub fn token_store(mut self, cfg: TokenStoreConfig) -> Self {
        self.token_store = cfg;
        self
    }

    pub fn snapshotter(mut self, cfg: SnapshotterConfig) -> Self {
        self.snapshotter = cfg;
        self
    }

    /// Adds an application schema to the persistence unit.
    pub fn with_schema(mut self, schema: &'static ManagedSchema) -> Self {
        if !self.schemas.iter().any(|s| s.name == schema.name) {
            self.schemas.push(schema);
        }
        self
    }

    /// Replaces the managed schemas altogether.
    pub fn schemas(mut self, schemas: Vec<&'static ManagedSchema>) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn with_exception_resolver(mut self, resolver: Arc<dyn PersistenceExceptionResolver>) -> Self {
        self.exception_resolver = Some(resolver);
        self
    }

    /// Raw connection source wrapped by the unit-of-work aware provider.
    pub fn with_connection_provider(mut self, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.connection_provider = Some(provider);
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    fn name(&self, component: Component) -> String {
        qualified_name(self.qualifier.as_deref(), component)
    }

    /// Validates configuration and builds every component. Nothing is
    /// returned on failure; a data source that already connected is closed.
    pub async fn build(self) -> Result<Infrastructure, InfraError> {
        let properties = PersistenceProperties::from_config(&self.jpa)?;
        let data_source = Arc::new(DataSource::connect(&self.jpa).await?);
        info!(
            component = %self.name(Component::DataSource),
            driver = ?data_source.driver(),
            url = %data_source.url(),
            "component ready"
        );
        self.build_with(data_source, properties).await
    }

    /// Builds everything on top of a connected data source, closing it when
    /// any later component fails.
    async fn build_with(
        self,
        data_source: Arc<DataSource>,
        properties: PersistenceProperties,
    ) -> Result<Infrastructure, InfraError> {
        match self.assemble(data_source.clone(), properties).await {
            Ok(infra) => Ok(infra),
            Err(e) => {
                warn!(error = %e, "wiring failed; closing data source");
                data_source.close().await;
                Err(e)
            }
        }
    }

    async fn assemble(
        self,
        data_source: Arc<DataSource>,
        properties: PersistenceProperties,
    ) -> Result<Infrastructure, InfraError> {
        let persistence_unit = Arc::new(
            PersistenceUnit::build(
                self.name(Component::PersistenceUnit),
                data_source.clone(),
                self.schemas.clone(),
                properties,
            )
            .await?,
        );
        self.ready(Component::PersistenceUnit);

        let exception_resolver: Arc<dyn PersistenceExceptionResolver> =
            match self.exception_resolver.clone() {
                Some(resolver) => resolver,
                None => Arc::new(SqlErrorCodesResolver::from_data_source(&data_source).await?),
            };
        self.ready(Component::ExceptionResolver);

        let entity_manager_provider = Arc::new(EntityManagerProvider::new(Arc::new(
            persistence_unit.create_entity_manager(exception_resolver.clone()),
        )));
        self.ready(Component::EntityManagerProvider);

        let transaction_manager = Arc::new(TransactionManager::new(
            persistence_unit.clone(),
            data_source.clone(),
            exception_resolver.clone(),
        )?);
        self.ready(Component::TransactionManager);

        let delegate: Arc<dyn ConnectionProvider> = match self.connection_provider.clone() {
            Some(provider) => provider,
            None => Arc::new(DataSourceConnectionProvider::new(
                data_source.clone(),
                exception_resolver.clone(),
            )),
        };
        let connection_provider = Arc::new(UnitOfWorkAwareConnectionProvider::new(delegate));
        self.ready(Component::ConnectionProvider);

        let transaction_adapter = Arc::new(SqlTransactionAdapter::new(transaction_manager.clone()));
        self.ready(Component::TransactionAdapter);

        let serializer: Arc<dyn Serializer> = match self.serializer.clone() {
            Some(serializer) => serializer,
            None => Arc::new(JsonSerializer),
        };
        let mut token_store = TokenStore::builder()
            .entity_manager_provider(entity_manager_provider.clone())
            .serializer(serializer.clone())
            .claim_timeout(self.token_store.claim_timeout());
        if let Some(node_id) = self.token_store.node_id.clone() {
            token_store = token_store.node_id(node_id);
        }
        let token_store = Arc::new(token_store.build()?);
        self.ready(Component::TokenStore);

        let snapshotter_factory = Arc::new(SnapshotterFactory::new(
            transaction_manager.clone(),
            entity_manager_provider.clone(),
            serializer.clone(),
            self.snapshotter.clone(),
        ));
        self.ready(Component::SnapshotterFactory);

        Ok(Infrastructure {
            qualifier: self.qualifier,
            data_source,
            persistence_unit,
            exception_resolver,
            entity_manager_provider,
            transaction_manager,
            connection_provider,
            transaction_adapter,
            token_store,
            snapshotter_factory,
            serializer,
        })
    }

    fn ready(&self, component: Component) {
        info!(component = %self.name(component), "component ready");
    }
}

/// The wired component graph. Each component exists once; dependents hold
/// references to the same instances.
pub struct Infrastructure {
    qualifier: Option<String>,
    data_source: Arc<DataSource>,
    persistence_unit: Arc<PersistenceUnit>,
    exception_resolver: Arc<dyn PersistenceExceptionResolver>,
    entity_manager_provider: Arc<EntityManagerProvider>,
    transaction_manager: Arc<TransactionManager>,
    connection_provider: Arc<UnitOfWorkAwareConnectionProvider>,
    transaction_adapter: Arc<SqlTransactionAdapter>,
    token_store: Arc<TokenStore>,
    snapshotter_factory: Arc<SnapshotterFactory>,
    serializer: Arc<dyn Serializer>,
}

impl fmt::Debug for Infrastructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Infrastructure")
            .field("qualifier", &self.qualifier)
            .field("data_source", &self.data_source)
            .field("persistence_unit", &self.persistence_unit.name())
            .finish_non_exhaustive()
    }
}

impl Infrastructure {
    pub fn builder(jpa: JpaConfig) -> InfrastructureBuilder {
        InfrastructureBuilder::new(jpa)
    }

    pub fn qualifier(&self) -> Option<&str> {
        self.qualifier.as_deref()
    }

    pub fn data_source(&self) -> &Arc<DataSource> {
        &self.data_source
    }

    pub fn persistence_unit(&self) -> &Arc<PersistenceUnit> {
        &self.persistence_unit
    }

    pub fn exception_resolver(&self) -> &Arc<dyn PersistenceExceptionResolver> {
        &self.exception_resolver
    }

    pub fn entity_manager_provider(&self) -> &Arc<EntityManagerProvider> {
        &self.entity_manager_provider
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.transaction_manager
    }

    pub fn connection_provider(&self) -> &Arc<UnitOfWorkAwareConnectionProvider> {
        &self.connection_provider
    }

    pub fn transaction_adapter(&self) -> &Arc<SqlTransactionAdapter> {
        &self.transaction_adapter
    }

    pub fn token_store(&self) -> &Arc<TokenStore> {
        &self.token_store
    }

    pub fn snapshotter_factory(&self) -> &Arc<SnapshotterFactory> {
        &self.snapshotter_factory
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub fn bean_name(&self, component: Component) -> String {
        qualified_name(self.qualifier.as_deref(), component)
    }

    /// Registered names in construction order.
    pub fn component_names(&self) -> Vec<String> {
        Component::ALL.iter().map(|c| self.bean_name(*c)).collect()
    }

    pub fn resolve(&self, name: &str) -> Option<Component> {
        Component::ALL
            .into_iter()
            .find(|c| self.bean_name(*c) == name)
    }

    /// Tears down in reverse order: snapshot worker, persistence unit, pool.
    pub async fn shutdown(&self) -> Result<(), InfraError> {
        self.snapshotter_factory.shutdown().await;
        let closed = self.persistence_unit.close().await;
        if let Err(e) = &closed {
            warn!(error = %e, "persistence unit did not close cleanly");
        }
        self.data_source.close().await;
        info!(qualifier = ?self.qualifier, "infrastructure shut down");
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DdlAuto;
    use crate::error::ConfigError;
    use std::collections::HashSet;

    #[test]
    fn base_names_are_distinct() {
        let names: HashSet<_> = Component::ALL.iter().map(|c| c.base_name()).collect();
        assert_eq!(names.len(), 9);
    }

    #[test]
    fn qualifier_prefixes_names() {
        assert_eq!(qualified_name(Some("cs"), Component::DataSource), "cs-ds");
        assert_eq!(
            qualified_name(Some("cs"), Component::ExceptionResolver),
            "cs-persistenceExceptionResolver"
        );
        assert_eq!(qualified_name(None, Component::SnapshotterFactory), "snap");
    }

    #[test]
    fn blank_qualifier_is_ignored() {
        let builder = InfrastructureBuilder::new(JpaConfig::default()).qualifier("  ");
        assert_eq!(builder.qualifier, None);
        assert_eq!(builder.name(Component::TransactionManager), "tx");
    }

    #[test]
    fn schemas_are_not_registered_twice() {
        let builder = InfrastructureBuilder::new(JpaConfig::default())
            .with_schema(&crate::db::schema::TOKEN_STORE_SCHEMA);
        assert_eq!(builder.schemas.len(), default_schemas().len());
    }

    fn jpa_for(url: &str) -> JpaConfig {
        let mut jpa = JpaConfig::default();
        jpa.driver_class_name = "sqlite".into();
        jpa.dialect = "SQLite".into();
        jpa.non_contextual_creation = Some(false);
        jpa.command.url = url.into();
        jpa.command.username = "sa".into();
        jpa.command.ddl_auto = Some(DdlAuto::Validate);
        jpa
    }

    #[tokio::test]
    async fn failed_assembly_closes_the_data_source() {
        let jpa = jpa_for("sqlite::memory:");
        let data_source = Arc::new(DataSource::connect(&jpa).await.expect("data source"));
        let properties = PersistenceProperties::from_config(&jpa).expect("properties");

        let err = InfrastructureBuilder::new(jpa)
            .build_with(data_source.clone(), properties)
            .await
            .unwrap_err();

        assert!(matches!(err, InfraError::SchemaValidation { .. }));
        assert!(data_source.is_closed());
    }

    #[tokio::test]
    async fn missing_ddl_auto_fails_before_connecting() {
        let mut jpa = jpa_for("sqlite::memory:");
        jpa.command.ddl_auto = None;

        let err = InfrastructureBuilder::new(jpa).build().await.unwrap_err();
        assert!(matches!(
            err,
            InfraError::Config(ConfigError::Missing("jpa.command.ddl_auto"))
        ));
    }

    #[tokio::test]
    async fn missing_lob_mode_fails_before_connecting() {
        let mut jpa = jpa_for("sqlite::memory:");
        jpa.non_contextual_creation = None;

        let err = InfrastructureBuilder::new(jpa).build().await.unwrap_err();
        assert!(matches!(
            err,
            InfraError::Config(ConfigError::Missing("jpa.non_contextual_creation"))
        ));
    }

    #[tokio::test]
    async fn missing_dialect_fails_before_connecting() {
        let mut jpa = JpaConfig::default();
        jpa.driver_class_name = "sqlite".into();
        jpa.command.url = "sqlite::memory:".into();
        jpa.command.username = "sa".into();

        let err = InfrastructureBuilder::new(jpa).build().await.unwrap_err();
        assert!(matches!(
            err,
            InfraError::Config(ConfigError::Missing("jpa.dialect"))
        ));
    }
}
