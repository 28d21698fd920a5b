//! Info-Request side channel scenarios.

mod common;

use jobctl_core::info_request::RetrievedResponse;
use jobctl_core::model::{InfoRequestKey, InfoRequestState};

async fn queued_run(ctx: &common::TestContext, work_item_id: uuid::Uuid) -> uuid::Uuid {
    ctx.kernel
        .scheduler
        .enqueue(work_item_id, None, 0, 0, ctx.clock.as_ref())
        .await
        .unwrap();
    ctx.kernel.scheduler.tick(ctx.clock.as_ref()).await.unwrap();
    ctx.kernel.run_lifecycle.list_runs(work_item_id).await.unwrap()[0].id
}

#[tokio::test]
async fn plaintext_response_round_trips() {
    let ctx = common::context().await;
    let project = ctx.create_project("p-info", 3600, 100).await;
    let w = ctx.create_work_item(project, "W").await;
    let run_id = queued_run(&ctx, w).await;

    let request = ctx
        .kernel
        .info_requests
        .create(
            run_id,
            vec![InfoRequestKey {
                name: "aws_region".to_string(),
                description: Some("target region".to_string()),
                secret: false,
            }],
        )
        .await
        .unwrap();
    assert_eq!(request.state, InfoRequestState::Pending);
    assert_eq!(request.required_keys().len(), 1);

    let answered = ctx
        .kernel
        .info_requests
        .respond_plaintext(request.id, serde_json::json!({"aws_region": "us-east-1"}))
        .await
        .unwrap();
    assert_eq!(answered.state, InfoRequestState::Answered);

    match ctx
        .kernel
        .info_requests
        .retrieve(&answered, ctx.kernel.decryptor.as_ref(), None)
    {
        RetrievedResponse::Plaintext(v) => {
            assert_eq!(v["aws_region"], "us-east-1");
        }
        _ => panic!("expected plaintext"),
    }
}

/// Responding twice to the same request is a conflict.
#[tokio::test]
async fn responding_twice_is_conflict() {
    let ctx = common::context().await;
    let project = ctx.create_project("p-info-twice", 3600, 100).await;
    let w = ctx.create_work_item(project, "W").await;
    let run_id = queued_run(&ctx, w).await;

    let request = ctx
        .kernel
        .info_requests
        .create(run_id, vec![InfoRequestKey { name: "k".into(), description: None, secret: false }])
        .await
        .unwrap();

    ctx.kernel
        .info_requests
        .respond_plaintext(request.id, serde_json::json!({"k": "v1"}))
        .await
        .unwrap();

    let err = ctx
        .kernel
        .info_requests
        .respond_plaintext(request.id, serde_json::json!({"k": "v2"}))
        .await
        .unwrap_err();
    assert!(matches!(err, jobctl_core::error::AppError::Conflict(_)));
}

/// An encrypted response returns plaintext only when the caller supplies the
/// matching key; any other key (or none) is redacted, never an error.
#[tokio::test]
async fn encrypted_response_requires_matching_key() {
    let ctx = common::context().await;
    let project = ctx.create_project("p-info-enc", 3600, 100).await;
    let w = ctx.create_work_item(project, "W").await;
    let run_id = queued_run(&ctx, w).await;

    let request = ctx
        .kernel
        .info_requests
        .create(
            run_id,
            vec![InfoRequestKey {
                name: "db_password".into(),
                description: None,
                secret: true,
            }],
        )
        .await
        .unwrap();

    let plaintext = serde_json::json!({"db_password": "hunter2"});
    let plaintext_bytes = serde_json::to_vec(&plaintext).unwrap();
    let key = b"correct-horse-battery-staple".to_vec();
    let nonce = vec![9, 9, 9];
    let stream: Vec<u8> = nonce.iter().chain(key.iter()).cloned().collect();
    let ciphertext: Vec<u8> = plaintext_bytes
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ stream[i % stream.len()])
        .collect();

    let answered = ctx
        .kernel
        .info_requests
        .respond_encrypted(request.id, ciphertext, nonce, "xor-stub".to_string())
        .await
        .unwrap();

    match ctx
        .kernel
        .info_requests
        .retrieve(&answered, ctx.kernel.decryptor.as_ref(), Some(&key))
    {
        RetrievedResponse::Plaintext(v) => assert_eq!(v["db_password"], "hunter2"),
        _ => panic!("expected plaintext with the correct key"),
    }

    match ctx
        .kernel
        .info_requests
        .retrieve(&answered, ctx.kernel.decryptor.as_ref(), Some(b"wrong-key"))
    {
        RetrievedResponse::Redacted => {}
        _ => panic!("expected redaction with the wrong key"),
    }

    match ctx
        .kernel
        .info_requests
        .retrieve(&answered, ctx.kernel.decryptor.as_ref(), None)
    {
        RetrievedResponse::Redacted => {}
        _ => panic!("expected redaction with no key supplied"),
    }
}

#[tokio::test]
async fn pending_request_is_not_answered() {
    let ctx = common::context().await;
    let project = ctx.create_project("p-info-pending", 3600, 100).await;
    let w = ctx.create_work_item(project, "W").await;
    let run_id = queued_run(&ctx, w).await;

    let request = ctx
        .kernel
        .info_requests
        .create(run_id, vec![InfoRequestKey { name: "k".into(), description: None, secret: false }])
        .await
        .unwrap();

    match ctx
        .kernel
        .info_requests
        .retrieve(&request, ctx.kernel.decryptor.as_ref(), None)
    {
        RetrievedResponse::NotAnswered => {}
        _ => panic!("expected not-answered"),
    }
}
