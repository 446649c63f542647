//! API key resolution
//!
//! The Mackerel API key is resolved once per process, first match wins:
//!
//! 1. `mackerel.api_key`
//! 2. the parameter named by `mackerel.api_key_parameter`
//! 3. the environment variable named by `mackerel.api_key_env`
//! 4. the parameter named by the `MACKEREL_APIKEY_PARAMETER` environment
//!    variable
//!
//! With decryption enabled (`mackerel.api_key_with_decrypt`, or a non-empty
//! `MACKEREL_APIKEY_WITH_DECRYPT`), keys from 1 and 3 are base64 ciphertexts
//! decrypted through the key management service, and parameters are read
//! with decryption.

use crate::config::{MackerelConfig, SecretsConfig};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable naming a parameter that holds the API key
pub const API_KEY_PARAMETER_ENV: &str = "MACKEREL_APIKEY_PARAMETER";
/// Environment variable that, when non-empty, turns on decryption
pub const API_KEY_WITH_DECRYPT_ENV: &str = "MACKEREL_APIKEY_WITH_DECRYPT";

/// Access to the places an API key can live
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Environment lookup; unset and empty both read as `None`
    fn env(&self, name: &str) -> Option<String>;

    /// Read a named parameter from the parameter store
    async fn get_parameter(&self, name: &str, with_decryption: bool) -> AppResult<String>;

    /// Decrypt a ciphertext blob with the key management service
    async fn decrypt(&self, ciphertext: &[u8]) -> AppResult<String>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetParameterInput<'a> {
    name: &'a str,
    with_decryption: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetParameterOutput {
    parameter: Parameter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Parameter {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DecryptInput {
    ciphertext_blob: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DecryptOutput {
    plaintext: String,
}

const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const GET_PARAMETER_TARGET: &str = "AmazonSSM.GetParameter";
const DECRYPT_TARGET: &str = "TrentService.Decrypt";

/// Process environment plus parameter store and key management endpoints
/// speaking the AWS JSON 1.1 protocol
///
/// Like the CloudWatch adapter, requests are unsigned; the endpoints are
/// expected to be signing proxies or emulators. An unset endpoint makes the
/// matching operation fail.
pub struct AwsSecretResolver {
    ssm_endpoint: Option<String>,
    kms_endpoint: Option<String>,
    client: reqwest::Client,
}

impl AwsSecretResolver {
    pub fn new(config: &SecretsConfig, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            ssm_endpoint: config.ssm_endpoint.clone(),
            kms_endpoint: config.kms_endpoint.clone(),
            client,
        })
    }

    async fn call<I, O>(&self, endpoint: &str, target: &str, input: &I) -> AppResult<O>
    where
        I: Serialize + Sync,
        O: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .post(endpoint)
            .header("X-Amz-Target", target)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .json(input)
            .send()
            .await
            .map_err(|e| AppError::Secret(format!("{} request failed: {}", target, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::Secret(format!("{} response unreadable: {}", target, e)))?;
        if !status.is_success() {
            return Err(AppError::Secret(format!(
                "{} returned status {}: {}",
                target,
                status.as_u16(),
                body
            )));
        }
        serde_json::from_str(&body)
            .map_err(|e| AppError::Secret(format!("{} response malformed: {}", target, e)))
    }
}

#[async_trait]
impl SecretResolver for AwsSecretResolver {
    fn env(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }

    async fn get_parameter(&self, name: &str, with_decryption: bool) -> AppResult<String> {
        let endpoint = self.ssm_endpoint.as_deref().ok_or_else(|| {
            AppError::Secret(format!(
                "parameter {} requested but secrets.ssm_endpoint is not set",
                name
            ))
        })?;
        let input = GetParameterInput {
            name,
            with_decryption,
        };
        let output: GetParameterOutput = self.call(endpoint, GET_PARAMETER_TARGET, &input).await?;
        Ok(output.parameter.value)
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> AppResult<String> {
        let endpoint = self.kms_endpoint.as_deref().ok_or_else(|| {
            AppError::Secret("decryption requested but secrets.kms_endpoint is not set".into())
        })?;
        let input = DecryptInput {
            ciphertext_blob: STANDARD.encode(ciphertext),
        };
        let output: DecryptOutput = self.call(endpoint, DECRYPT_TARGET, &input).await?;
        let plaintext = STANDARD
            .decode(output.plaintext)
            .map_err(|e| AppError::Secret(format!("decrypted key is not base64: {}", e)))?;
        String::from_utf8(plaintext)
            .map_err(|e| AppError::Secret(format!("decrypted key is not UTF-8: {}", e)))
    }
}

/// Resolve the Mackerel API key
pub async fn resolve_api_key(
    config: &MackerelConfig,
    resolver: &dyn SecretResolver,
) -> AppResult<String> {
    let decrypt =
        config.api_key_with_decrypt() || resolver.env(API_KEY_WITH_DECRYPT_ENV).is_some();

    if let Some(key) = config.api_key().filter(|k| !k.is_empty()) {
        tracing::debug!(decrypt = decrypt, "Using Mackerel API key from configuration");
        return reveal(key, decrypt, resolver).await;
    }

    if let Some(name) = config.api_key_parameter().filter(|n| !n.is_empty()) {
        tracing::debug!(parameter = %name, decrypt = decrypt, "Reading Mackerel API key parameter");
        return resolver.get_parameter(name, decrypt).await;
    }

    let env_name = config.api_key_env();
    if let Some(key) = Some(env_name)
        .filter(|n| !n.is_empty())
        .and_then(|n| resolver.env(n))
    {
        tracing::debug!(variable = %env_name, decrypt = decrypt, "Using Mackerel API key from environment");
        return reveal(&key, decrypt, resolver).await;
    }

    if let Some(name) = resolver.env(API_KEY_PARAMETER_ENV) {
        tracing::debug!(parameter = %name, decrypt = decrypt, "Reading Mackerel API key parameter");
        return resolver.get_parameter(&name, decrypt).await;
    }

    Err(AppError::SecretNotFound(format!(
        "set mackerel.api_key, mackerel.api_key_parameter, {} or {}",
        env_name, API_KEY_PARAMETER_ENV
    )))
}

/// A literal key, or the plaintext of a base64 ciphertext when `decrypt`
async fn reveal(key: &str, decrypt: bool, resolver: &dyn SecretResolver) -> AppResult<String> {
    if !decrypt {
        return Ok(key.to_string());
    }
    let blob = STANDARD
        .decode(key.trim())
        .map_err(|e| AppError::Secret(format!("encrypted API key is not base64: {}", e)))?;
    resolver.decrypt(&blob).await
}
