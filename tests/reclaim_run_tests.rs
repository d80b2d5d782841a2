use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::config::{
    Configuration, DatabaseConfig, LoggingConfig, RewriteConfig, Secret, ShrinkConfig,
};
use reclaimer::testing::{InMemoryServer, ServerEvent};
use reclaimer::{
    CleanupCoordinator, DatabaseName, DatabaseState, DatabaseStatus, RunMode, ShrinkStatus,
    TableName, TableStatus,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

fn configuration(row_threshold: u64, databases: &[&str]) -> Configuration {
    Configuration {
        database: DatabaseConfig {
            driver: "ODBC Driver 17 for SQL Server".to_string(),
            server: "sql01".to_string(),
            uid: "reclaimer".to_string(),
            pwd: Secret::new("secret"),
            databases: databases.iter().map(|d| d.to_string()).collect(),
            trust_server_certificate: true,
        },
        row_threshold,
        logging: LoggingConfig {
            file: PathBuf::from("reclaim.log"),
            level: "info".to_string(),
        },
        rewrite: RewriteConfig::default(),
        shrink: ShrinkConfig {
            poll_interval: Duration::from_secs(5),
            settle_delay: Duration::from_secs(1),
            max_wait: None,
        },
        dry_run: false,
    }
}

fn coordinator(server: &InMemoryServer, config: &Configuration) -> CleanupCoordinator {
    CleanupCoordinator::from_config(Arc::new(server.provider()), config)
}

fn names(config: &Configuration) -> Vec<DatabaseName> {
    config
        .database
        .databases
        .iter()
        .map(|d| DatabaseName::new(d.as_str()).unwrap())
        .collect()
}

fn orders() -> TableName {
    TableName::new("dbo", "Orders").unwrap()
}

/// Events recorded for `database`, reduced to their kind
fn event_kinds(server: &InMemoryServer, database: &str) -> Vec<&'static str> {
    server
        .events()
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::Opened { database: d } if d == database => Some("opened"),
            ServerEvent::MetadataRead { database: d } if d == database => Some("metadata"),
            ServerEvent::Captured { database: d, .. } if d == database => Some("captured"),
            ServerEvent::Truncated { database: d, .. } if d == database => Some("truncated"),
            ServerEvent::Restored { database: d, .. } if d == database => Some("restored"),
            ServerEvent::StatePolled { database: d, .. } if d == database => Some("polled"),
            ServerEvent::ImplicitTransactionsDisabled { database: d } if d == database => {
                Some("autocommit")
            }
            ServerEvent::Shrunk { database: d, .. } if d == database => Some("shrunk"),
            ServerEvent::Closed { database: d } if d == database => Some("closed"),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_database_does_not_affect_the_next() {
    let server = InMemoryServer::new();
    server.add_database("A");
    server.add_table("A", "dbo", "Orders", 800);
    server.make_unreachable("B");
    let before = server.table_rows("A", &orders());

    let config = configuration(500, &["A", "B"]);
    let report = coordinator(&server, &config)
        .run(&names(&config), RunMode::Full)
        .await;

    let a = report.database("A").unwrap();
    assert_eq!(a.status(), DatabaseStatus::Succeeded);
    assert_eq!(a.tables_rewritten(), 1);
    assert_eq!(a.shrink, ShrinkStatus::Succeeded { polls: 1 });
    assert_eq!(server.table_rows("A", &orders()), before);
    assert_eq!(server.shrink_count("A"), 1);
    assert_eq!(
        event_kinds(&server, "A"),
        vec![
            "opened",
            "metadata",
            "captured",
            "truncated",
            "restored",
            "polled",
            "autocommit",
            "shrunk",
            "closed",
        ]
    );

    let b = report.database("B").unwrap();
    assert_eq!(b.status(), DatabaseStatus::Failed);
    assert!(b.fatal.as_deref().unwrap().contains("Cannot open database"));
    assert_eq!(server.opens("B"), 0);
    assert_eq!(server.shrink_attempts("B"), 0);

    assert!(!report.is_success());
    assert!(server.staging_tables().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_large_table_keeps_capture_limit_rows() {
    let server = InMemoryServer::new();
    server.add_database("Sales");
    server.add_table("Sales", "dbo", "Orders", 5000);
    let before = server.table_rows("Sales", &orders());

    let config = configuration(500, &["Sales"]);
    let report = coordinator(&server, &config)
        .run(&names(&config), RunMode::Full)
        .await;

    let db = report.database("Sales").unwrap();
    assert_eq!(db.status(), DatabaseStatus::Succeeded);
    assert_eq!(
        db.tables[0].status,
        TableStatus::Rewritten {
            rows_captured: 1000,
            rows_restored: 1000,
        }
    );

    let after = server.table_rows("Sales", &orders());
    assert_eq!(after.len(), 1000);
    assert!(after.iter().all(|row| before.contains(row)));
    assert!(report.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_table_at_threshold_is_left_alone() {
    let server = InMemoryServer::new();
    server.add_database("Sales");
    server.add_table("Sales", "dbo", "Orders", 500);
    server.add_table("Sales", "dbo", "Lines", 501);

    let config = configuration(500, &["Sales"]);
    let report = coordinator(&server, &config)
        .run(&names(&config), RunMode::Full)
        .await;

    let db = report.database("Sales").unwrap();
    assert_eq!(db.tables.len(), 1);
    assert_eq!(db.tables[0].table, TableName::new("dbo", "Lines").unwrap());
    assert_eq!(server.table_rows("Sales", &orders()).len(), 500);
    assert_eq!(server.shrink_count("Sales"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shrink_waits_for_online() {
    let server = InMemoryServer::new();
    server.add_database("Sales");
    server.script_states(
        "Sales",
        &[
            DatabaseState::Restoring,
            DatabaseState::Recovering,
            DatabaseState::Online,
        ],
    );

    let config = configuration(500, &["Sales"]);
    let report = coordinator(&server, &config)
        .run(&names(&config), RunMode::Full)
        .await;

    assert_eq!(
        report.database("Sales").unwrap().shrink,
        ShrinkStatus::Succeeded { polls: 3 }
    );

    let events = server.events();
    let polls: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::StatePolled { state, at, .. } => Some((state.clone(), *at)),
            _ => None,
        })
        .collect();
    let shrunk_at = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::Shrunk { at, .. } => Some(*at),
            _ => None,
        })
        .unwrap();

    assert_eq!(polls.len(), 3);
    assert_eq!(polls[2].0.as_deref(), Some("ONLINE"));
    assert!(polls[..2].iter().all(|(_, at)| *at < shrunk_at));
    assert!(shrunk_at - polls[2].1 >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_readiness_deadline_fails_only_that_database() {
    let server = InMemoryServer::new();
    server.add_database("A");
    server.add_database("B");
    server.script_states("A", &[DatabaseState::Offline]);

    let mut config = configuration(500, &["A", "B"]);
    config.shrink.max_wait = Some(Duration::from_secs(30));
    let report = coordinator(&server, &config)
        .run(&names(&config), RunMode::Full)
        .await;

    let a = report.database("A").unwrap();
    assert_eq!(a.status(), DatabaseStatus::Failed);
    assert!(a.fatal.is_none());
    match &a.shrink {
        ShrinkStatus::Failed { error } => {
            assert!(error.contains("not ONLINE"));
            assert!(error.contains("OFFLINE"));
        }
        other => panic!("unexpected shrink status: {other:?}"),
    }
    assert_eq!(server.shrink_attempts("A"), 0);
    assert_eq!(server.closes("A"), 1);

    assert_eq!(
        report.database("B").unwrap().status(),
        DatabaseStatus::Succeeded
    );
    assert_eq!(server.shrink_count("B"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_readiness_wait_stops_the_run() {
    let server = InMemoryServer::new();
    server.add_database("A");
    server.add_database("B");
    server.add_table("A", "dbo", "Orders", 900);
    server.script_states("A", &[DatabaseState::Offline]);

    let config = configuration(500, &["A", "B"]);
    let cancel = CancellationToken::new();
    let coordinator = coordinator(&server, &config).with_cancellation(cancel.clone());
    let databases = names(&config);

    let (report, ()) = tokio::join!(coordinator.run(&databases, RunMode::Full), async {
        sleep(Duration::from_secs(17)).await;
        cancel.cancel();
    });

    let a = report.database("A").unwrap();
    assert_eq!(a.status(), DatabaseStatus::Cancelled);
    assert_eq!(a.tables_rewritten(), 1);
    assert_eq!(server.shrink_attempts("A"), 0);
    assert_eq!(server.opens("A"), 1);
    assert_eq!(server.closes("A"), 1);

    assert_eq!(
        report.database("B").unwrap().status(),
        DatabaseStatus::Cancelled
    );
    assert_eq!(server.opens("B"), 0);
    assert!(!report.is_success());
}
