//! Info-Request side channel.
//!
//! The core stores ciphertext, a nonce, and an algorithm tag opaquely; it
//! never chooses or implements the encryption scheme. `Decryptor` is the
//! pluggable seam a real deployment wires a concrete AEAD implementation
//! into — the no-op stub here exists only so this crate's tests can exercise
//! the "wrong key returns redacted" contract without depending on an actual
//! cipher crate out of scope for the core.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppError;
use crate::model::{InfoRequest, InfoRequestKey, InfoRequestState};

/// Pluggable decryption seam. Production wires in a real AEAD; the core
/// only needs to know whether the supplied key unlocks the stored blob.
pub trait Decryptor: Send + Sync {
    fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &[u8],
        key: &[u8],
    ) -> Result<Vec<u8>, DecryptError>;
}

#[derive(Debug, thiserror::Error)]
#[error("decryption failed")]
pub struct DecryptError;

/// XORs the ciphertext with a key-derived stream. Not a real cipher — fills
/// the `Decryptor` seam until a deployment wires in an actual AEAD
/// implementation; exists so the "wrong key returns redacted" contract is
/// exercisable without the core depending on a concrete cipher crate.
pub struct XorStubDecryptor;

impl Decryptor for XorStubDecryptor {
    fn decrypt(&self, ciphertext: &[u8], nonce: &[u8], key: &[u8]) -> Result<Vec<u8>, DecryptError> {
        if key.is_empty() {
            return Err(DecryptError);
        }
        let stream: Vec<u8> = nonce.iter().chain(key.iter()).cloned().collect();
        if stream.is_empty() {
            return Err(DecryptError);
        }
        Ok(ciphertext
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ stream[i % stream.len()])
            .collect())
    }
}

pub enum RetrievedResponse {
    Plaintext(serde_json::Value),
    Redacted,
    NotAnswered,
}

#[derive(Clone)]
pub struct InfoRequestChannel {
    pool: PgPool,
}

impl InfoRequestChannel {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates an info request declaring the required input names. The run
    /// keeps executing; the agent decides whether to block its own steps.
    pub async fn create(
        &self,
        run_id: Uuid,
        keys: Vec<InfoRequestKey>,
    ) -> Result<InfoRequest, AppError> {
        let request = InfoRequest::builder()
            .run_id(run_id)
            .keys(serde_json::to_value(&keys).map_err(|e| AppError::Internal(e.into()))?)
            .build();

        sqlx::query(
            "INSERT INTO info_requests (id, run_id, keys, state) VALUES ($1, $2, $3, $4)",
        )
        .bind(request.id)
        .bind(request.run_id)
        .bind(&request.keys)
        .bind(request.state)
        .execute(&self.pool)
        .await?;

        Ok(request)
    }

    pub async fn list_for_run(&self, run_id: Uuid) -> Result<Vec<InfoRequest>, AppError> {
        let rows = sqlx::query_as(
            "SELECT id, run_id, keys, state, response, response_encrypted, cipher_tag, nonce
             FROM info_requests WHERE run_id = $1 ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Stores a plaintext response.
    pub async fn respond_plaintext(
        &self,
        request_id: Uuid,
        response: serde_json::Value,
    ) -> Result<InfoRequest, AppError> {
        let updated: Option<InfoRequest> = sqlx::query_as(
            "UPDATE info_requests SET state = 'answered', response = $1
             WHERE id = $2 AND state = 'pending'
             RETURNING id, run_id, keys, state, response, response_encrypted, cipher_tag, nonce",
        )
        .bind(response)
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        self.require(updated, request_id).await
    }

    /// Stores an encrypted response: the core never sees the plaintext or
    /// the key, only the opaque ciphertext/nonce/tag triple.
    pub async fn respond_encrypted(
        &self,
        request_id: Uuid,
        ciphertext: Vec<u8>,
        nonce: Vec<u8>,
        cipher_tag: String,
    ) -> Result<InfoRequest, AppError> {
        let updated: Option<InfoRequest> = sqlx::query_as(
            "UPDATE info_requests SET state = 'answered', response_encrypted = $1, nonce = $2, cipher_tag = $3
             WHERE id = $4 AND state = 'pending'
             RETURNING id, run_id, keys, state, response, response_encrypted, cipher_tag, nonce",
        )
        .bind(ciphertext)
        .bind(nonce)
        .bind(cipher_tag)
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        self.require(updated, request_id).await
    }

    async fn require(
        &self,
        updated: Option<InfoRequest>,
        request_id: Uuid,
    ) -> Result<InfoRequest, AppError> {
        match updated {
            Some(req) => Ok(req),
            None => Err(AppError::Conflict(format!(
                "info request {request_id} is not pending"
            ))),
        }
    }

    /// Returns plaintext only when the caller supplies a key that decrypts
    /// the stored blob; otherwise returns a redacted marker. Never fails
    /// the caller's request just because the key was wrong.
    pub fn retrieve(
        &self,
        request: &InfoRequest,
        decryptor: &dyn Decryptor,
        caller_key: Option<&[u8]>,
    ) -> RetrievedResponse {
        if request.state != InfoRequestState::Answered {
            return RetrievedResponse::NotAnswered;
        }

        if let Some(plaintext) = &request.response {
            return RetrievedResponse::Plaintext(plaintext.clone());
        }

        let (Some(ciphertext), Some(nonce), Some(key)) =
            (&request.response_encrypted, &request.nonce, caller_key)
        else {
            return RetrievedResponse::Redacted;
        };

        match decryptor.decrypt(ciphertext, nonce, key) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => RetrievedResponse::Plaintext(value),
                Err(_) => RetrievedResponse::Redacted,
            },
            Err(_) => RetrievedResponse::Redacted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_stub_round_trips_with_correct_key() {
        let decryptor = XorStubDecryptor;
        let nonce = vec![1, 2, 3];
        let key = b"secret".to_vec();
        let plaintext = b"hello world";

        let stream: Vec<u8> = nonce.iter().chain(key.iter()).cloned().collect();
        let ciphertext: Vec<u8> = plaintext
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ stream[i % stream.len()])
            .collect();

        let decrypted = decryptor.decrypt(&ciphertext, &nonce, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_key_yields_garbage_not_error() {
        let decryptor = XorStubDecryptor;
        let nonce = vec![1, 2, 3];
        let key = b"secret".to_vec();
        let wrong_key = b"wrong!".to_vec();
        let plaintext = b"hello world";

        let stream: Vec<u8> = nonce.iter().chain(key.iter()).cloned().collect();
        let ciphertext: Vec<u8> = plaintext
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ stream[i % stream.len()])
            .collect();

        let decrypted = decryptor.decrypt(&ciphertext, &nonce, &wrong_key).unwrap();
        assert_ne!(decrypted, plaintext);
    }
}
