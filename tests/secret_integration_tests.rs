//! Integration tests for encrypted org secrets
//!
//! These tests cover storage and replacement of secrets, the binding of
//! ciphertext to its org and key, and the path from a connection's secret
//! reference to the credentials git receives.

mod test_utils;

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use repo_sync::connectors::TokenResolver;
use repo_sync::crypto::{CryptoError, CryptoKey, is_encrypted_payload};
use repo_sync::db::db_now;
use repo_sync::job_worker::{JobOutcome, JobWorker};
use repo_sync::models::repo_job::RepoJobType;
use repo_sync::models::secret;
use repo_sync::repositories::{ConnectionRepository, RepoJobRepository, SecretError, SecretRepository};
use repo_sync::telemetry::LoggingErrorReporter;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::json;
use tempfile::TempDir;
use test_utils::{FakeGit, FakeIndexer, insert_repo, link_repo, setup_test_db_arc, worker_settings};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn test_crypto_key() -> CryptoKey {
    CryptoKey::new(vec![7u8; 32]).expect("valid test key")
}

#[tokio::test]
async fn stored_secrets_are_encrypted_and_replaceable() {
    let db = setup_test_db_arc().await.unwrap();
    let secrets = SecretRepository::new(db.clone());
    let key = test_crypto_key();

    secrets.put(&key, 1, "gh-token", "ghp_first").await.unwrap();
    let row = secrets.find(1, "gh-token").await.unwrap().unwrap();
    assert!(is_encrypted_payload(&row.encrypted_value));
    assert!(!row
        .encrypted_value
        .windows(b"ghp_first".len())
        .any(|window| window == b"ghp_first"));

    secrets.put(&key, 1, "gh-token", "ghp_second").await.unwrap();
    let revealed = secrets.reveal(&key, 1, "gh-token").await.unwrap().unwrap();
    assert_eq!(revealed.as_str(), "ghp_second");

    assert!(secrets.reveal(&key, 2, "gh-token").await.unwrap().is_none());
    assert!(secrets.delete(1, "gh-token").await.unwrap());
    assert!(!secrets.delete(1, "gh-token").await.unwrap());
    assert!(secrets.reveal(&key, 1, "gh-token").await.unwrap().is_none());
}

#[tokio::test]
async fn ciphertext_is_bound_to_its_org_and_key() {
    let db = setup_test_db_arc().await.unwrap();
    let secrets = SecretRepository::new(db.clone());
    let key = test_crypto_key();

    secrets.put(&key, 1, "gh-token", "ghp_123").await.unwrap();
    let row = secrets.find(1, "gh-token").await.unwrap().unwrap();

    // The same bytes copied under another org do not decrypt.
    secret::ActiveModel {
        org_id: Set(2),
        key: Set("gh-token".to_string()),
        encrypted_value: Set(row.encrypted_value.clone()),
        created_at: Set(db_now()),
    }
    .insert(db.as_ref())
    .await
    .unwrap();
    let err = secrets.reveal(&key, 2, "gh-token").await.unwrap_err();
    assert!(matches!(err, SecretError::Crypto(CryptoError::DecryptionFailed(_))));

    // And a different key cannot read the original.
    let other = CryptoKey::new(vec![9u8; 32]).unwrap();
    let err = secrets.reveal(&other, 1, "gh-token").await.unwrap_err();
    assert!(matches!(err, SecretError::Crypto(_)));
}

#[tokio::test]
async fn index_job_authenticates_with_the_connection_secret() {
    let root = TempDir::new().unwrap();
    let db = setup_test_db_arc().await.unwrap();
    let key = test_crypto_key();
    SecretRepository::new(db.clone())
        .put(&key, 1, "gh-token", "ghp_123")
        .await
        .unwrap();

    let connection = ConnectionRepository::new(db.clone())
        .create(1, "github", "github", json!({ "token": { "secret": "gh-token" } }))
        .await
        .unwrap();
    let repo = insert_repo(&db, "api", "https://github.com/acme/api.git", None)
        .await
        .unwrap();
    link_repo(&db, repo.id, connection.id).await.unwrap();

    let settings = worker_settings(root.path());
    let git = Arc::new(FakeGit::default());
    let worker = JobWorker::new(
        db.clone(),
        git.clone(),
        Arc::new(FakeIndexer::new(settings.index_dir.clone())),
        TokenResolver::new(db.clone(), Some(key)),
        Arc::new(LoggingErrorReporter),
        settings,
        Arc::new(Notify::new()),
    );

    let jobs = RepoJobRepository::new(db.clone());
    let job = jobs.create(RepoJobType::Index, repo.id).await.unwrap().unwrap();
    let job = jobs.claim(job.id).await.unwrap().unwrap();
    assert_eq!(worker.execute(job, CancellationToken::new()).await, JobOutcome::Completed);

    let expected = format!("Basic {}", STANDARD.encode("x-access-token:ghp_123"));
    assert_eq!(
        git.auth_headers.lock().unwrap().as_slice(),
        &[Some(expected)]
    );
}

#[tokio::test]
async fn missing_connection_secret_fails_the_index_job() {
    let root = TempDir::new().unwrap();
    let db = setup_test_db_arc().await.unwrap();

    let connection = ConnectionRepository::new(db.clone())
        .create(1, "github", "github", json!({ "token": { "secret": "absent" } }))
        .await
        .unwrap();
    let repo = insert_repo(&db, "api", "https://github.com/acme/api.git", None)
        .await
        .unwrap();
    link_repo(&db, repo.id, connection.id).await.unwrap();

    let settings = worker_settings(root.path());
    let git = Arc::new(FakeGit::default());
    let worker = Arc::new(JobWorker::new(
        db.clone(),
        git.clone(),
        Arc::new(FakeIndexer::new(settings.index_dir.clone())),
        TokenResolver::new(db.clone(), Some(test_crypto_key())),
        Arc::new(LoggingErrorReporter),
        settings,
        Arc::new(Notify::new()),
    ));

    let jobs = RepoJobRepository::new(db.clone());
    let job = jobs.create(RepoJobType::Index, repo.id).await.unwrap().unwrap();
    assert_eq!(JobWorker::run_pending(&worker).await.unwrap(), 1);

    let failed = jobs.get_by_id(job.id).await.unwrap().unwrap();
    assert!(failed
        .error_message
        .as_deref()
        .is_some_and(|message| message.contains("absent")));
    assert!(git.calls().is_empty());
}
