use std::fmt;
use std::time::Duration;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, KeyInit};
use base64::Engine as _;
use dashmap::DashMap;
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::rand_core::{OsRng, RngCore};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use snafu::ResultExt;
use url::Url;

use super::{
    DeliveryError, EncryptionSnafu, ExpiredSnafu, InvalidSubscriptionSnafu, PushChannel,
    PushPayload, RejectedSnafu, RequestSnafu,
};
use crate::error::{ApplicationError, HttpClientSnafu, VapidKeySnafu};
use crate::model::PushSubscription;
use crate::time::{Clock, SystemClock};

const SALT_LEN: usize = 16;
const PUBLIC_KEY_LEN: usize = 65;
const AUTH_SECRET_LEN: usize = 16;
const RECORD_SIZE: u32 = 4096;
const MAX_PAYLOAD_BYTES: usize = 3500;
const TTL_SECS: u32 = 24 * 60 * 60;
const VAPID_JWT_EXP_SECS: i64 = 12 * 60 * 60;
const VAPID_JWT_SKEW_SECS: i64 = 60;

const IKM_INFO_PREFIX: &str = "WebPush: info\0";
const KEY_INFO: &str = "Content-Encoding: aes128gcm\0";
const NONCE_INFO: &str = "Content-Encoding: nonce\0";

/// VAPID key pair, base64url encoded without padding.
#[derive(Clone, Deserialize)]
pub struct WebPushConfig {
    vapid_public_key: String,
    vapid_private_key: String,
    #[serde(default = "default_subject")]
    vapid_subject: String,
}

fn default_subject() -> String {
    "mailto:admin@localhost".to_string()
}

impl fmt::Debug for WebPushConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebPushConfig")
            .field("vapid_public_key", &self.vapid_public_key)
            .field("vapid_subject", &self.vapid_subject)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct CachedVapidJwt {
    jwt: String,
    exp_unix: i64,
}

/// [PushChannel] speaking the Web Push protocol: RFC 8291 payload encryption with a RFC 8292
/// VAPID signature.
pub struct WebPush<C = SystemClock> {
    client: reqwest::Client,
    public_key: String,
    private_key: [u8; 32],
    subject: String,
    vapid_jwt_cache: DashMap<String, CachedVapidJwt>,
    clock: C,
}

impl<C> fmt::Debug for WebPush<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebPush")
            .field("public_key", &self.public_key)
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

impl WebPush {
    pub fn new(config: &WebPushConfig) -> Result<Self, ApplicationError> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> WebPush<C> {
    /// VAPID tokens are issued and expired against `clock`.
    pub fn with_clock(config: &WebPushConfig, clock: C) -> Result<Self, ApplicationError> {
        let public_key = config.vapid_public_key.trim().to_string();
        let public_raw = decode_b64url(&public_key).map_err(|error| {
            VapidKeySnafu {
                message: format!("invalid public key: {error}"),
            }
            .build()
        })?;
        if public_raw.len() != PUBLIC_KEY_LEN {
            return VapidKeySnafu {
                message: format!("public key must decode to {PUBLIC_KEY_LEN} bytes"),
            }
            .fail();
        }

        let private_raw = decode_b64url(config.vapid_private_key.trim()).map_err(|error| {
            VapidKeySnafu {
                message: format!("invalid private key: {error}"),
            }
            .build()
        })?;
        let private_key: [u8; 32] = private_raw.try_into().map_err(|_| {
            VapidKeySnafu {
                message: "private key must decode to 32 bytes",
            }
            .build()
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context(HttpClientSnafu)?;

        Ok(Self {
            client,
            public_key,
            private_key,
            subject: config.vapid_subject.clone(),
            vapid_jwt_cache: DashMap::new(),
            clock,
        })
    }

    fn vapid_jwt(&self, audience: &str) -> Result<String, DeliveryError> {
        let now = self.clock.now().timestamp();
        if let Some(entry) = self.vapid_jwt_cache.get(audience) {
            if entry.exp_unix - VAPID_JWT_SKEW_SECS > now {
                return Ok(entry.jwt.clone());
            }
        }

        let exp_unix = now + VAPID_JWT_EXP_SECS;
        let jwt = build_vapid_jwt(audience, &self.subject, &self.private_key, exp_unix)?;
        self.vapid_jwt_cache.insert(
            audience.to_string(),
            CachedVapidJwt {
                jwt: jwt.clone(),
                exp_unix,
            },
        );
        Ok(jwt)
    }
}

impl<C: Clock> PushChannel for WebPush<C> {
    #[tracing::instrument(skip_all, fields(endpoint = %subscription.endpoint))]
    async fn deliver(
        &self, subscription: &PushSubscription, payload: &PushPayload,
    ) -> Result<(), DeliveryError> {
        let endpoint = subscription.endpoint.as_str();
        let invalid = |message: &str| {
            InvalidSubscriptionSnafu { endpoint, message }.build()
        };

        let audience = push_service_audience(endpoint).map_err(|message| invalid(&message))?;
        let jwt = self.vapid_jwt(&audience)?;

        let client_public: [u8; PUBLIC_KEY_LEN] = decode_b64url(&subscription.p256dh_key)
            .ok()
            .and_then(|raw| raw.try_into().ok())
            .ok_or_else(|| invalid("invalid p256dh key"))?;
        let client_auth: [u8; AUTH_SECRET_LEN] = decode_b64url(&subscription.auth_key)
            .ok()
            .and_then(|raw| raw.try_into().ok())
            .ok_or_else(|| invalid("invalid auth secret"))?;

        let plaintext = payload_bytes(payload)?;
        let body = encrypt_aes128gcm(&plaintext, &client_public, &client_auth)?;

        let response = self
            .client
            .post(endpoint)
            .header("TTL", TTL_SECS.to_string())
            .header("Content-Encoding", "aes128gcm")
            .header("Content-Type", "application/octet-stream")
            .header("Urgency", "normal")
            .header(
                "Authorization",
                format!("vapid t={}, k={}", jwt, self.public_key),
            )
            .body(body)
            .send()
            .await
            .context(RequestSnafu { endpoint })?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            tracing::trace!(status, "delivered push notification");
            return Ok(());
        }

        if status == 404 || status == 410 {
            return ExpiredSnafu { endpoint, status }.fail();
        }

        let body = response.text().await.unwrap_or_default();
        RejectedSnafu {
            endpoint,
            status,
            body: truncate_string(&body, 500),
        }
        .fail()
    }
}

#[derive(Serialize)]
struct WireNotification<'a> {
    title: &'a str,
    body: &'a str,
    url: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a crate::model::EventData,
}

fn payload_bytes(payload: &PushPayload) -> Result<Vec<u8>, DeliveryError> {
    let title = truncate_string(&payload.title, 120);
    let body = truncate_string(&payload.body, 600);
    let full = WireNotification {
        title: &title,
        body: &body,
        url: &payload.url,
        kind: payload.kind.as_str(),
        data: &payload.data,
    };

    let bytes = serialize(&full)?;
    if bytes.len() <= MAX_PAYLOAD_BYTES {
        return Ok(bytes);
    }

    // drop the free-form data rather than the notification
    let empty = crate::model::EventData::new();
    serialize(&WireNotification {
        data: &empty,
        ..full
    })
}

fn serialize(notification: &WireNotification<'_>) -> Result<Vec<u8>, DeliveryError> {
    serde_json::to_vec(notification).map_err(|error| {
        EncryptionSnafu {
            message: format!("cannot serialize payload: {error}"),
        }
        .build()
    })
}

fn push_service_audience(endpoint: &str) -> Result<String, String> {
    let url = Url::parse(endpoint).map_err(|error| format!("invalid endpoint: {error}"))?;
    let host = url.host().ok_or("endpoint is missing a host")?;

    let host = match host {
        url::Host::Domain(domain) => domain.to_string(),
        url::Host::Ipv4(ip) => ip.to_string(),
        url::Host::Ipv6(ip) => format!("[{ip}]"),
    };

    Ok(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

fn truncate_string(input: &str, max_chars: usize) -> String {
    let mut chars = input.chars();
    let mut out: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        out.push('…');
    }
    out
}

fn decode_b64url(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(input.trim_end_matches('=').as_bytes())
}

fn encode_b64url(input: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(input)
}

fn encryption_error(message: &str) -> DeliveryError {
    EncryptionSnafu { message }.build()
}

fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], okm: &mut [u8]) -> Result<(), DeliveryError> {
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(info, okm)
        .map_err(|_| encryption_error("HKDF expand failed"))
}

/// Encrypt `plaintext` as a single `aes128gcm` record (RFC 8188) keyed for the subscription.
fn encrypt_aes128gcm(
    plaintext: &[u8], remote_public_key: &[u8; PUBLIC_KEY_LEN], auth_secret: &[u8; AUTH_SECRET_LEN],
) -> Result<Vec<u8>, DeliveryError> {
    if plaintext.is_empty() {
        return Err(encryption_error("payload cannot be empty"));
    }

    let mut salt = [0u8; SALT_LEN];
    let mut rng = OsRng;
    rng.fill_bytes(&mut salt);

    let remote_public = p256::PublicKey::from_sec1_bytes(remote_public_key)
        .map_err(|_| encryption_error("invalid subscription public key"))?;

    let local_secret = EphemeralSecret::random(&mut rng);
    let local_public = p256::PublicKey::from(&local_secret).to_encoded_point(false);
    let local_public = local_public.as_bytes();
    if local_public.len() != PUBLIC_KEY_LEN {
        return Err(encryption_error("invalid local public key length"));
    }

    let shared_secret = local_secret.diffie_hellman(&remote_public);

    let mut ikm_info = Vec::with_capacity(IKM_INFO_PREFIX.len() + PUBLIC_KEY_LEN * 2);
    ikm_info.extend_from_slice(IKM_INFO_PREFIX.as_bytes());
    ikm_info.extend_from_slice(remote_public_key);
    ikm_info.extend_from_slice(local_public);

    let mut ikm = [0u8; 32];
    let mut cek = [0u8; 16];
    let mut nonce = [0u8; 12];
    hkdf_sha256(auth_secret, shared_secret.raw_secret_bytes().as_slice(), &ikm_info, &mut ikm)?;
    hkdf_sha256(&salt, &ikm, KEY_INFO.as_bytes(), &mut cek)?;
    hkdf_sha256(&salt, &ikm, NONCE_INFO.as_bytes(), &mut nonce)?;

    let cipher = Aes128Gcm::new_from_slice(&cek)
        .map_err(|_| encryption_error("invalid content encryption key"))?;

    // last record delimiter, no further padding
    let mut padded = Vec::with_capacity(plaintext.len() + 1);
    padded.extend_from_slice(plaintext);
    padded.push(2);

    let ciphertext = cipher
        .encrypt((&nonce).into(), padded.as_slice())
        .map_err(|_| encryption_error("AES-GCM encryption failed"))?;

    let mut body = Vec::with_capacity(SALT_LEN + 4 + 1 + PUBLIC_KEY_LEN + ciphertext.len());
    body.extend_from_slice(&salt);
    body.extend_from_slice(&RECORD_SIZE.to_be_bytes());
    body.push(PUBLIC_KEY_LEN as u8);
    body.extend_from_slice(local_public);
    body.extend_from_slice(&ciphertext);

    Ok(body)
}

fn build_vapid_jwt(
    audience: &str, subject: &str, private_key: &[u8; 32], exp_unix: i64,
) -> Result<String, DeliveryError> {
    #[derive(Serialize)]
    struct Claims<'a> {
        aud: &'a str,
        exp: i64,
        sub: &'a str,
    }

    let header = serde_json::json!({ "typ": "JWT", "alg": "ES256" });
    let claims = Claims {
        aud: audience,
        exp: exp_unix,
        sub: subject,
    };

    let header = serde_json::to_vec(&header)
        .map_err(|_| encryption_error("cannot serialize JWT header"))?;
    let claims = serde_json::to_vec(&claims)
        .map_err(|_| encryption_error("cannot serialize JWT claims"))?;
    let signing_input = format!("{}.{}", encode_b64url(&header), encode_b64url(&claims));

    let signing_key = SigningKey::from_bytes(private_key.into())
        .map_err(|_| encryption_error("invalid VAPID private key"))?;
    let signature: p256::ecdsa::Signature = signing_key.sign(signing_input.as_bytes());

    Ok(format!(
        "{}.{}",
        signing_input,
        encode_b64url(signature.to_bytes().as_slice())
    ))
}
