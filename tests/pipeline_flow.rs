mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use axum::http::StatusCode;
use common::{body_json, body_to_vec, TestApp, FAKE_PDF};
use docforge::jobs::{
    enqueue_generation, get_document_job_status, get_upload_job_status, GenerationPayload,
};
use docforge::models::{CrmObjectType, DocumentStatus};
use docforge::queue::JobState;
use serde_json::{json, Value};
use uuid::Uuid;

fn document_id(body: &Value) -> Uuid {
    body["document"]["id"]
        .as_str()
        .and_then(|id| id.parse().ok())
        .expect("response carries a document id")
}

#[tokio::test]
async fn generated_document_is_uploaded_to_the_crm_record() -> Result<()> {
    let app = TestApp::new().await?;
    app.crm.insert_object(
        CrmObjectType::Deal,
        "deal-1",
        &[("dealname", "Harbour expansion"), ("amount", "125000")],
    );
    let template = app
        .insert_template(
            "Quote",
            "<h1>{{deal.dealname}}</h1><p>For {{client}}</p><p>{{missing}}</p>",
            json!([
                {"name": "deal.dealname", "type": "deal.property"},
                {"name": "client", "type": "custom", "required": true}
            ]),
        )
        .await?;

    let response = app
        .post_json(
            "/api/documents",
            &json!({
                "template_id": template.id,
                "name": "Harbour quote",
                "variables": {"client": "Acme Ports"},
                "crm_object_id": "deal-1",
                "crm_object_type": "DEAL"
            }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await?;
    assert_eq!(body["document"]["status"], "PENDING");
    assert_eq!(body["job"]["queue"], "document-generation");
    let id = document_id(&body);

    let document = app.wait_for_status(id, DocumentStatus::Uploaded).await?;
    assert_eq!(document.crm_file_id.as_deref(), Some("file-1"));
    assert_eq!(document.file_size, Some(FAKE_PDF.len() as i64));
    assert!(document.error_message.is_none());

    let html = app.renderer.last_html().expect("renderer was called");
    assert!(html.contains("<h1>Harbour expansion</h1>"));
    assert!(html.contains("For Acme Ports"));
    assert!(html.contains("<p></p>"));

    let uploads = app.crm.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].file_name.ends_with("_Harbour_quote.pdf"));
    assert!(uploads[0]
        .folder_path
        .starts_with(&format!("/docforge/{}/", app.tenant.id)));
    assert_eq!(
        app.crm.attachments.lock().unwrap().clone(),
        vec![("file-1".to_string(), CrmObjectType::Deal, "deal-1".to_string())]
    );

    let download = app.get(&format!("/api/documents/{id}/download")).await?;
    assert_eq!(download.status(), StatusCode::OK);
    assert_eq!(download.headers()["content-type"], "application/pdf");
    let disposition = download.headers()["content-disposition"].to_str()?.to_string();
    assert!(disposition.contains("Harbour quote.pdf"));
    assert_eq!(body_to_vec(download.into_body()).await?, FAKE_PDF);

    let actions = app.repo.audit_actions();
    for expected in ["document.created", "document.generated", "document.uploaded"] {
        assert!(actions.iter().any(|action| action == expected), "missing {expected}");
    }

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn document_without_crm_record_stops_at_completed() -> Result<()> {
    let app = TestApp::new().await?;
    let template = app
        .insert_template("Letter", "<p>{{greeting}} {{current_year}}</p>", json!([]))
        .await?;

    let response = app
        .post_json(
            "/api/documents",
            &json!({"template_id": template.id, "variables": {"greeting": "Hello"}}),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let id = document_id(&body_json(response).await?);

    let document = app.wait_for_status(id, DocumentStatus::Completed).await?;
    assert_eq!(document.name, "Letter");
    assert!(document.processing_started_at.is_some());
    assert!(document.processing_completed_at.is_some());
    // computed date variables are persisted with the resolved values
    assert!(document.variables.get("current_year").is_some());
    assert_eq!(app.crm.upload_count(), 0);

    let job = get_document_job_status(&app.state.queue, id)
        .await?
        .expect("generation job is tracked");
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.progress, 100);
    assert!(get_upload_job_status(&app.state.queue, id).await?.is_none());

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn transient_render_errors_fail_after_the_last_attempt() -> Result<()> {
    let app = TestApp::builder().max_attempts(3).build().await?;
    app.renderer.always_fail.store(true, Ordering::SeqCst);
    let template = app.insert_template("Flaky", "<p>hi</p>", json!([])).await?;

    let response = app
        .post_json("/api/documents", &json!({"template_id": template.id}))
        .await?;
    let id = document_id(&body_json(response).await?);

    let document = app.wait_for_status(id, DocumentStatus::Failed).await?;
    let error = document.error_message.unwrap_or_default();
    assert!(error.contains("503"), "unexpected error: {error}");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(app.renderer.calls(), 3);

    let job = app.wait_for_generation_job(id, JobState::Failed).await?;
    assert_eq!(job.attempts, 3);
    assert!(app
        .repo
        .audit_actions()
        .iter()
        .any(|action| action == "document.generation_failed"));

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn render_recovers_on_a_later_attempt() -> Result<()> {
    let app = TestApp::new().await?;
    app.renderer.fail_next.store(1, Ordering::SeqCst);
    let template = app.insert_template("Retry", "<p>ok</p>", json!([])).await?;

    let response = app
        .post_json("/api/documents", &json!({"template_id": template.id}))
        .await?;
    let id = document_id(&body_json(response).await?);

    let document = app.wait_for_status(id, DocumentStatus::Completed).await?;
    assert!(document.error_message.is_none());
    assert_eq!(app.renderer.calls(), 2);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn missing_required_variables_fail_without_retry() -> Result<()> {
    let app = TestApp::new().await?;
    let template = app
        .insert_template(
            "Contract",
            "<p>{{signatory}}</p>",
            json!([{"name": "signatory", "type": "custom", "required": true}]),
        )
        .await?;
    // bypasses the API, which would reject the request up front
    let document = app.insert_document(&template, json!({}), None).await?;
    enqueue_generation(
        &app.state.queue,
        &GenerationPayload {
            document_id: document.id,
            template_id: template.id,
            tenant_id: app.tenant.id,
            user_id: app.user.id,
            variables: json!({}),
        },
    )
    .await?;

    let failed = app.wait_for_status(document.id, DocumentStatus::Failed).await?;
    assert!(failed
        .error_message
        .unwrap_or_default()
        .contains("signatory"));
    assert_eq!(app.renderer.calls(), 0);

    let job = app
        .wait_for_generation_job(document.id, JobState::Failed)
        .await?;
    assert_eq!(job.attempts, 1);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn failed_upload_leaves_the_document_completed() -> Result<()> {
    let app = TestApp::builder().max_attempts(2).build().await?;
    app.crm.fail_uploads.store(true, Ordering::SeqCst);
    app.crm
        .insert_object(CrmObjectType::Contact, "c-9", &[("firstname", "Ada")]);
    let template = app
        .insert_template(
            "Welcome",
            "<p>Hi {{contact.firstname}}</p>",
            json!([{"name": "contact.firstname", "type": "contact.property"}]),
        )
        .await?;

    let response = app
        .post_json(
            "/api/documents",
            &json!({
                "template_id": template.id,
                "crm_object_id": "c-9",
                "crm_object_type": "contact"
            }),
        )
        .await?;
    let id = document_id(&body_json(response).await?);

    app.wait_for_upload_job(id, JobState::Failed).await?;

    let document = app.document(id).await?;
    assert_eq!(document.status, "COMPLETED");
    assert!(document.crm_file_id.is_none());
    assert!(document
        .error_message
        .unwrap_or_default()
        .starts_with("CRM upload failed"));
    assert!(app
        .repo
        .audit_actions()
        .iter()
        .any(|action| action == "document.upload_failed"));

    // the file is still served
    let download = app.get(&format!("/api/documents/{id}/download")).await?;
    assert_eq!(download.status(), StatusCode::OK);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn attach_retries_reuse_the_uploaded_file() -> Result<()> {
    let app = TestApp::new().await?;
    app.crm.fail_attachments.store(1, Ordering::SeqCst);
    app.crm
        .insert_object(CrmObjectType::Contact, "c-3", &[("firstname", "Grace")]);
    let template = app
        .insert_template(
            "Letter",
            "<p>Dear {{contact.firstname}}</p>",
            json!([{"name": "contact.firstname", "type": "contact.property"}]),
        )
        .await?;

    let response = app
        .post_json(
            "/api/documents",
            &json!({
                "template_id": template.id,
                "crm_object_id": "c-3",
                "crm_object_type": "contact"
            }),
        )
        .await?;
    let id = document_id(&body_json(response).await?);

    let document = app.wait_for_status(id, DocumentStatus::Uploaded).await?;
    assert_eq!(document.crm_file_id.as_deref(), Some("file-1"));
    assert_eq!(app.crm.upload_count(), 1);
    assert_eq!(
        *app.crm.attachments.lock().unwrap(),
        vec![("file-1".to_string(), CrmObjectType::Contact, "c-3".to_string())]
    );

    let job = app.wait_for_upload_job(id, JobState::Completed).await?;
    assert_eq!(job.attempts, 2);
    assert_eq!(
        app.repo
            .audit_actions()
            .iter()
            .filter(|action| *action == "document.upload_failed")
            .count(),
        1
    );

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn resubmitting_a_queued_document_collapses_onto_one_job() -> Result<()> {
    let app = TestApp::builder().without_workers().build().await?;
    let template = app.insert_template("Once", "<p>x</p>", json!([])).await?;
    let document = app.insert_document(&template, json!({}), None).await?;
    let payload = GenerationPayload {
        document_id: document.id,
        template_id: template.id,
        tenant_id: app.tenant.id,
        user_id: app.user.id,
        variables: json!({}),
    };

    let first = enqueue_generation(&app.state.queue, &payload).await?;
    let second = enqueue_generation(&app.state.queue, &payload).await?;
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.job_id, second.job_id);
    assert_eq!(app.broker.jobs().len(), 1);
    Ok(())
}
