use anyhow::Result;
use drover_lib::registry::{self, Environment, DUPLICATE_NAME_CODE, NOT_FOUND_CODE};
use tempfile::tempdir;

#[tokio::test]
async fn save_get_list_delete_round_trip() -> Result<()> {
    let tmp = tempdir()?;
    let pool = registry::open_pool(&tmp.path().join("drover.sqlite3")).await?;

    let saved = registry::save_profile(
        &pool,
        "staging-replica",
        "mongodb://user:pw@staging.internal:27017",
        "orders",
        Environment::Staging,
    )
    .await?;
    assert!(saved.id > 0);

    let fetched = registry::get_profile(&pool, saved.id).await?;
    assert_eq!(fetched, saved);

    registry::save_profile(
        &pool,
        "prod-primary",
        "mongodb://prod.internal:27017",
        "orders_prod",
        Environment::Production,
    )
    .await?;
    registry::save_profile(
        &pool,
        "dev-local",
        "mongodb://localhost:27017",
        "orders_dev",
        Environment::Development,
    )
    .await?;

    let profiles = registry::list_profiles(&pool).await?;
    assert_eq!(profiles.len(), 3);
    // Ordered by environment then name.
    let names: Vec<&str> = profiles.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["dev-local", "prod-primary", "staging-replica"]);

    registry::delete_profile(&pool, saved.id).await?;
    let err = registry::get_profile(&pool, saved.id).await.unwrap_err();
    assert_eq!(err.code(), NOT_FOUND_CODE);

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_names_are_rejected_with_a_stable_code() -> Result<()> {
    let tmp = tempdir()?;
    let pool = registry::open_pool(&tmp.path().join("drover.sqlite3")).await?;

    registry::save_profile(
        &pool,
        "primary",
        "mongodb://a.internal:27017",
        "orders",
        Environment::Production,
    )
    .await?;
    let err = registry::save_profile(
        &pool,
        "primary",
        "mongodb://b.internal:27017",
        "orders",
        Environment::Staging,
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), DUPLICATE_NAME_CODE);

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn missing_profile_and_missing_delete_report_not_found() -> Result<()> {
    let tmp = tempdir()?;
    let pool = registry::open_pool(&tmp.path().join("drover.sqlite3")).await?;

    let err = registry::get_profile(&pool, 999).await.unwrap_err();
    assert_eq!(err.code(), NOT_FOUND_CODE);

    let err = registry::delete_profile(&pool, 999).await.unwrap_err();
    assert_eq!(err.code(), NOT_FOUND_CODE);

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn open_pool_survives_reopen_with_existing_data() -> Result<()> {
    let tmp = tempdir()?;
    let db_path = tmp.path().join("drover.sqlite3");

    {
        let pool = registry::open_pool(&db_path).await?;
        registry::save_profile(
            &pool,
            "kept",
            "mongodb://kept.internal:27017",
            "orders",
            Environment::Development,
        )
        .await?;
        pool.close().await;
    }

    let pool = registry::open_pool(&db_path).await?;
    let profiles = registry::list_profiles(&pool).await?;
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].name, "kept");
    assert_eq!(profiles[0].environment, Environment::Development);

    pool.close().await;
    Ok(())
}
