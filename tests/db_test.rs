use chrono::{Duration, Utc};
use devicio_rs::config::DatabaseConfig;
use devicio_rs::db::{Db, PgRoutineRepository};
use devicio_rs::model::{DeviceStatus, ReportedStatus, RoutineEvent};
use devicio_rs::processor::RoutineRepository;
use secrecy::SecretString;
use uuid::Uuid;

/// Helper: connect + migrate for tests.
/// Uses DATABASE_* env vars or defaults to local dev.
async fn test_db() -> Db {
    dotenvy::dotenv().ok();
    let var = |key: &str, default: &str| std::env::var(key).unwrap_or_else(|_| default.to_string());
    let config = DatabaseConfig {
        user: var("DATABASE_USER", "devicio"),
        password: SecretString::from(var("DATABASE_PASSWORD", "devicio_dev")),
        host: var("DATABASE_HOST", "localhost:5432"),
        name: var("DATABASE_NAME", "devicio_dev"),
        ssl_mode: var("DATABASE_SSL", "disable"),
    };
    let db = Db::connect(&config).await.unwrap();
    db.migrate().await.unwrap();
    db
}

fn event(device_id: &str) -> RoutineEvent {
    let now = Utc::now();
    RoutineEvent {
        id: Uuid::new_v4(),
        device_id: device_id.to_string(),
        status: DeviceStatus::Warning.into(),
        context: "routine".to_string(),
        diagnostics: "Power consumption normal".to_string(),
        area: "B".to_string(),
        dispatched_at: now - Duration::seconds(2),
        created_at: now,
    }
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn connects_and_migrates() {
    let db = test_db().await;
    assert!(db.health_check().await.is_ok());
    db.close().await;
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn stores_routine_with_every_column() {
    let db = test_db().await;
    let repository = PgRoutineRepository::new(&db).await.unwrap();

    let device_id = format!("device-{}", Uuid::new_v4());
    let routine = event(&device_id);
    repository.store(routine.clone()).await.unwrap();

    let row: (Uuid, String, String, String, String, String) = sqlx::query_as(
        "SELECT id, device_id, status, context, area, diagnostics \
         FROM device_routines WHERE id = $1",
    )
    .bind(routine.id)
    .fetch_one(db.pool())
    .await
    .unwrap();

    assert_eq!(row.0, routine.id);
    assert_eq!(row.1, device_id);
    assert_eq!(row.2, "WARNING");
    assert_eq!(row.3, "routine");
    assert_eq!(row.4, "B");
    assert_eq!(row.5, "Power consumption normal");

    db.close().await;
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn same_payload_stored_twice_yields_two_rows() {
    let db = test_db().await;
    let repository = PgRoutineRepository::new(&db).await.unwrap();

    let device_id = format!("device-{}", Uuid::new_v4());
    let first = event(&device_id);
    let second = RoutineEvent {
        id: Uuid::new_v4(),
        ..first.clone()
    };
    repository.store(first).await.unwrap();
    repository.store(second).await.unwrap();

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM device_routines WHERE device_id = $1")
            .bind(&device_id)
            .fetch_one(db.pool())
            .await
            .unwrap();
    assert_eq!(count, 2);

    db.close().await;
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn duplicate_id_is_a_storage_error() {
    let db = test_db().await;
    let repository = PgRoutineRepository::new(&db).await.unwrap();

    let routine = event("device-dup");
    repository.store(routine.clone()).await.unwrap();
    let err = repository.store(routine).await.unwrap_err();
    assert!(matches!(err, devicio_rs::error::Error::Storage(_)), "got {err:?}");

    db.close().await;
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn unrecognized_status_is_stored_by_number() {
    let db = test_db().await;
    let repository = PgRoutineRepository::new(&db).await.unwrap();

    let routine = RoutineEvent {
        status: ReportedStatus::Unrecognized(7),
        ..event("device-newer-firmware")
    };
    repository.store(routine.clone()).await.unwrap();

    let (status,): (String,) = sqlx::query_as("SELECT status FROM device_routines WHERE id = $1")
        .bind(routine.id)
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(status, "7");

    db.close().await;
}
