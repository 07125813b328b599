mod common;

use common::TempDb;
use eventwire::config::{Config, DdlAuto};
use eventwire::db::{PersistenceExceptionResolver, Vendor};
use eventwire::error::{ConfigError, ErrorKind, InfraError};
use eventwire::wiring::{Component, InfrastructureBuilder};
use std::sync::Arc;

#[derive(Debug)]
struct EverythingTimesOut;

impl PersistenceExceptionResolver for EverythingTimesOut {
    fn classify(&self, _error: &sqlx::Error) -> ErrorKind {
        ErrorKind::Timeout
    }
}

#[tokio::test]
async fn builds_one_shared_instance_of_each_component() {
    let db = TempDb::new("wiring-shared");
    let infra = InfrastructureBuilder::new(db.jpa(DdlAuto::Create))
        .build()
        .await
        .expect("wiring failed");

    let ds = infra.data_source();
    let pu = infra.persistence_unit();
    let tm = infra.transaction_manager();
    let emp = infra.entity_manager_provider();

    assert!(Arc::ptr_eq(pu.data_source(), ds));
    assert!(Arc::ptr_eq(tm.persistence_unit(), pu));
    assert!(Arc::ptr_eq(tm.data_source(), ds));
    assert!(Arc::ptr_eq(emp.entity_manager().persistence_unit(), pu));
    assert!(Arc::ptr_eq(
        emp.entity_manager().resolver(),
        infra.exception_resolver()
    ));
    assert!(Arc::ptr_eq(infra.transaction_adapter().transaction_manager(), tm));
    assert!(Arc::ptr_eq(infra.token_store().entity_manager_provider(), emp));
    assert!(Arc::ptr_eq(infra.snapshotter_factory().transaction_manager(), tm));

    assert_eq!(
        infra.component_names(),
        vec![
            "ds",
            "emf",
            "persistenceExceptionResolver",
            "emp",
            "tx",
            "connectionProvider",
            "transactionAdapter",
            "tokenStore",
            "snap"
        ]
    );
    for component in Component::ALL {
        assert_eq!(infra.resolve(component.base_name()), Some(component));
    }

    infra.shutdown().await.expect("shutdown failed");
    assert!(infra.data_source().is_closed());
    assert!(!infra.persistence_unit().is_open());
}

#[tokio::test]
async fn qualifier_prefixes_every_component_name() {
    let db = TempDb::new("wiring-qualifier");
    let mut cfg = Config::default();
    cfg.jpa = db.jpa(DdlAuto::Update);
    cfg.qualifier = Some("cs".to_string());

    let infra = InfrastructureBuilder::from_config(&cfg)
        .build()
        .await
        .expect("wiring failed");

    assert_eq!(infra.qualifier(), Some("cs"));
    assert!(infra.component_names().iter().all(|n| n.starts_with("cs-")));
    assert_eq!(infra.bean_name(Component::DataSource), "cs-ds");
    assert_eq!(infra.resolve("cs-tx"), Some(Component::TransactionManager));
    assert_eq!(infra.resolve("tx"), None);
    assert_eq!(infra.persistence_unit().name(), "cs-emf");

    infra.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn two_qualified_graphs_are_independent() {
    let db_a = TempDb::new("wiring-a");
    let db_b = TempDb::new("wiring-b");
    let a = InfrastructureBuilder::new(db_a.jpa(DdlAuto::Create))
        .qualifier("a")
        .build()
        .await
        .expect("wiring a failed");
    let b = InfrastructureBuilder::new(db_b.jpa(DdlAuto::Create))
        .qualifier("b")
        .build()
        .await
        .expect("wiring b failed");

    assert!(!Arc::ptr_eq(a.data_source(), b.data_source()));
    assert!(!Arc::ptr_eq(a.transaction_manager(), b.transaction_manager()));
    assert_ne!(a.data_source().url(), b.data_source().url());

    a.shutdown().await.expect("shutdown a failed");
    b.shutdown().await.expect("shutdown b failed");
}

#[tokio::test]
async fn empty_url_fails_before_anything_is_returned() {
    let db = TempDb::new("wiring-no-url");
    let mut jpa = db.jpa(DdlAuto::None);
    jpa.command.url.clear();

    let err = InfrastructureBuilder::new(jpa).build().await.unwrap_err();
    assert!(matches!(
        err,
        InfraError::Config(ConfigError::Missing("jpa.command.url"))
    ));
    assert!(!db.path.exists());
}

#[tokio::test]
async fn empty_driver_fails_before_anything_is_returned() {
    let db = TempDb::new("wiring-no-driver");
    let mut jpa = db.jpa(DdlAuto::None);
    jpa.driver_class_name.clear();

    let err = InfrastructureBuilder::new(jpa).build().await.unwrap_err();
    assert!(matches!(
        err,
        InfraError::Config(ConfigError::Missing("jpa.driver_class_name"))
    ));
    assert!(!db.path.exists());
}

#[tokio::test]
async fn unsupported_driver_is_a_configuration_error() {
    let db = TempDb::new("wiring-h2-driver");
    let mut jpa = db.jpa(DdlAuto::None);
    jpa.driver_class_name = "org.h2.Driver".to_string();

    let err = InfrastructureBuilder::new(jpa).build().await.unwrap_err();
    assert!(matches!(
        err,
        InfraError::Config(ConfigError::UnsupportedDriver(_))
    ));
}

#[tokio::test]
async fn validate_against_an_empty_database_fails_startup() {
    let db = TempDb::new("wiring-validate");
    let err = InfrastructureBuilder::new(db.jpa(DdlAuto::Validate))
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, InfraError::SchemaValidation { .. }));
}

#[tokio::test]
async fn resolver_override_replaces_the_default() {
    let db = TempDb::new("wiring-resolver");
    let resolver: Arc<dyn PersistenceExceptionResolver> = Arc::new(EverythingTimesOut);
    let infra = InfrastructureBuilder::new(db.jpa(DdlAuto::Create))
        .with_exception_resolver(resolver.clone())
        .build()
        .await
        .expect("wiring failed");

    assert!(Arc::ptr_eq(infra.exception_resolver(), &resolver));
    assert!(Arc::ptr_eq(
        infra.entity_manager_provider().entity_manager().resolver(),
        &resolver
    ));
    assert_eq!(
        infra.exception_resolver().classify(&sqlx::Error::RowNotFound),
        ErrorKind::Timeout
    );

    infra.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn default_resolver_uses_the_sqlite_code_table() {
    let db = TempDb::new("wiring-vendor");
    let infra = InfrastructureBuilder::new(db.jpa(DdlAuto::Create))
        .build()
        .await
        .expect("wiring failed");

    let metadata = infra.data_source().metadata().await.expect("metadata");
    assert_eq!(Vendor::from_product_name(&metadata.product_name), Vendor::Sqlite);
    assert_eq!(
        infra.exception_resolver().classify(&sqlx::Error::PoolTimedOut),
        ErrorKind::Timeout
    );

    infra.shutdown().await.expect("shutdown failed");
}
