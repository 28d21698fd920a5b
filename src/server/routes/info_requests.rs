use axum::extract::{Path, Query, State};
use axum::Json;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::info_request::RetrievedResponse;
use crate::model::{InfoRequest, InfoRequestKey};
use crate::server::app::AppState;

#[derive(Deserialize)]
pub struct RetrieveQuery {
    /// Base64-encoded caller key; only meaningful when the response was
    /// stored encrypted-at-rest.
    #[serde(default)]
    key: Option<String>,
}

#[derive(Serialize)]
pub struct InfoRequestView {
    id: Uuid,
    run_id: Uuid,
    keys: Vec<InfoRequestKey>,
    state: crate::model::InfoRequestState,
    response: ResponseView,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseView {
    NotAnswered,
    Redacted,
    Plaintext { value: serde_json::Value },
}

pub async fn list_info_requests(
    State(kernel): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<RetrieveQuery>,
) -> Result<Json<Vec<InfoRequestView>>, AppError> {
    let requests = kernel.info_requests.list_for_run(run_id).await?;
    let caller_key = query
        .key
        .as_ref()
        .and_then(|k| base64::engine::general_purpose::STANDARD.decode(k).ok());

    let views = requests
        .into_iter()
        .map(|req| view(&kernel, req, caller_key.as_deref()))
        .collect();

    Ok(Json(views))
}

fn view(kernel: &AppState, req: InfoRequest, caller_key: Option<&[u8]>) -> InfoRequestView {
    let keys = req.required_keys();
    let retrieved = kernel
        .info_requests
        .retrieve(&req, kernel.decryptor.as_ref(), caller_key);

    InfoRequestView {
        id: req.id,
        run_id: req.run_id,
        keys,
        state: req.state,
        response: match retrieved {
            RetrievedResponse::Plaintext(value) => ResponseView::Plaintext { value },
            RetrievedResponse::Redacted => ResponseView::Redacted,
            RetrievedResponse::NotAnswered => ResponseView::NotAnswered,
        },
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
pub enum RespondRequest {
    Plaintext {
        response: serde_json::Value,
    },
    Encrypted {
        ciphertext_b64: String,
        nonce_b64: String,
        cipher_tag: String,
    },
}

pub async fn respond_info_request(
    State(kernel): State<AppState>,
    Path(request_id): Path<Uuid>,
    Json(req): Json<RespondRequest>,
) -> Result<Json<InfoRequest>, AppError> {
    let updated = match req {
        RespondRequest::Plaintext { response } => {
            kernel.info_requests.respond_plaintext(request_id, response).await?
        }
        RespondRequest::Encrypted {
            ciphertext_b64,
            nonce_b64,
            cipher_tag,
        } => {
            let ciphertext = base64::engine::general_purpose::STANDARD
                .decode(ciphertext_b64)
                .map_err(|e| AppError::validation("ciphertext_b64", e.to_string()))?;
            let nonce = base64::engine::general_purpose::STANDARD
                .decode(nonce_b64)
                .map_err(|e| AppError::validation("nonce_b64", e.to_string()))?;
            kernel
                .info_requests
                .respond_encrypted(request_id, ciphertext, nonce, cipher_tag)
                .await?
        }
    };

    Ok(Json(updated))
}
