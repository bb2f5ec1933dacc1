//! Four authentication methods, tried in order: shared admin tokens, a
//! registered service-token table, HS256 JWTs, and RS256 JWTs verified
//! against a JWKS (with OIDC discovery and kid pinning).

use crate::config::Config;
use crate::metrics;
use axum::http::HeaderMap;
use forgeos_core::{Result, SchedulerError};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub subject: String,
    pub scopes: HashSet<String>,
}

impl AuthContext {
    pub fn admin() -> Self {
        let mut scopes = HashSet::new();
        scopes.insert("admin".to_string());
        Self {
            subject: "admin".to_string(),
            scopes,
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains("admin") || self.scopes.contains(scope)
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    scopes: Option<Vec<String>>,
}

fn claim_scopes(c: &Claims) -> HashSet<String> {
    if let Some(list) = &c.scopes {
        return list.iter().cloned().collect();
    }
    if let Some(s) = &c.scope {
        return s.split([' ', ',']).filter(|t| !t.is_empty()).map(|t| t.to_string()).collect();
    }
    HashSet::new()
}

#[derive(Debug, Deserialize)]
struct OidcDiscoveryDocument {
    issuer: String,
    jwks_uri: String,
}

/// Where to find the JWKS document: a directly configured URL, or an OIDC
/// issuer to discover it from via `/.well-known/openid-configuration`.
enum JwksSource {
    Direct(String),
    Discover { issuer: String },
}

/// Caches the JWKS document behind its fetch TTL so every RS256 request
/// doesn't round-trip to the issuer. When configured with an OIDC issuer
/// instead of a direct URL, resolves `jwks_uri` via discovery and verifies
/// the discovery document's `issuer` matches before trusting it.
pub struct JwksCache {
    source: JwksSource,
    resolved_url: RwLock<Option<String>>,
    inner: RwLock<Option<(std::time::Instant, JwkSet)>>,
    ttl: std::time::Duration,
    http: reqwest::Client,
}

impl JwksCache {
    pub fn new(url: String) -> Self {
        Self {
            source: JwksSource::Direct(url),
            resolved_url: RwLock::new(None),
            inner: RwLock::new(None),
            ttl: std::time::Duration::from_secs(300),
            http: reqwest::Client::new(),
        }
    }

    pub fn from_oidc_issuer(issuer: String) -> Self {
        Self {
            source: JwksSource::Discover { issuer },
            resolved_url: RwLock::new(None),
            inner: RwLock::new(None),
            ttl: std::time::Duration::from_secs(300),
            http: reqwest::Client::new(),
        }
    }

    async fn jwks_url(&self) -> Result<String> {
        match &self.source {
            JwksSource::Direct(url) => Ok(url.clone()),
            JwksSource::Discover { issuer } => {
                if let Some(url) = self.resolved_url.read().await.as_ref() {
                    return Ok(url.clone());
                }
                let discovery_url = format!(
                    "{}/.well-known/openid-configuration",
                    issuer.trim_end_matches('/')
                );
                let resp = self
                    .http
                    .get(&discovery_url)
                    .send()
                    .await
                    .map_err(|e| SchedulerError::Internal(format!("oidc discovery fetch: {e}")))?;
                let doc: OidcDiscoveryDocument = resp
                    .json()
                    .await
                    .map_err(|e| SchedulerError::Internal(format!("oidc discovery decode: {e}")))?;
                if &doc.issuer != issuer {
                    return Err(SchedulerError::Internal(format!(
                        "oidc discovery issuer mismatch: expected {issuer}, got {}",
                        doc.issuer
                    )));
                }
                *self.resolved_url.write().await = Some(doc.jwks_uri.clone());
                Ok(doc.jwks_uri)
            }
        }
    }

    async fn get(&self) -> Result<JwkSet> {
        {
            let guard = self.inner.read().await;
            if let Some((fetched, set)) = guard.as_ref() {
                if fetched.elapsed() < self.ttl {
                    return Ok(set.clone());
                }
            }
        }
        let url = self.jwks_url().await?;
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SchedulerError::Internal(format!("jwks fetch: {e}")))?;
        let set: JwkSet = resp
            .json()
            .await
            .map_err(|e| SchedulerError::Internal(format!("jwks decode: {e}")))?;
        metrics::JWKS_FETCH_TOTAL.with_label_values(&["ok"]).inc();
        *self.inner.write().await = Some((std::time::Instant::now(), set.clone()));
        Ok(set)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Entry point called by every non-public route handler.
pub async fn authenticate(
    headers: &HeaderMap,
    cfg: &Config,
    jwks: Option<&Arc<JwksCache>>,
) -> Result<AuthContext> {
    let token = bearer_token(headers).ok_or(SchedulerError::Unauthorized)?;

    if cfg.admin_tokens.iter().any(|t| t == token) {
        metrics::AUTH_TOTAL.with_label_values(&["admin"]).inc();
        return Ok(AuthContext::admin());
    }

    if let Some(svc) = cfg.service_tokens.get(token) {
        metrics::AUTH_TOTAL.with_label_values(&["service"]).inc();
        return Ok(AuthContext {
            subject: svc.subject.clone(),
            scopes: svc.scopes.iter().cloned().collect(),
        });
    }

    if let Some(secret) = &cfg.jwt_hs256_secret {
        if let Ok(ctx) = decode_hs256(token, secret, cfg) {
            metrics::AUTH_TOTAL.with_label_values(&["hs256"]).inc();
            return Ok(ctx);
        }
    }

    if let Some(cache) = jwks {
        if let Ok(ctx) = decode_rs256(token, cache, cfg).await {
            metrics::AUTH_TOTAL.with_label_values(&["rs256"]).inc();
            return Ok(ctx);
        }
    }

    metrics::AUTH_TOTAL.with_label_values(&["rejected"]).inc();
    Err(SchedulerError::Unauthorized)
}

fn base_validation(cfg: &Config) -> Validation {
    let mut v = Validation::default();
    v.validate_exp = true;
    v.validate_nbf = true;
    if let Some(aud) = &cfg.jwt_audience {
        v.set_audience(&[aud]);
    } else {
        v.validate_aud = false;
    }
    if let Some(iss) = &cfg.oidc_issuer {
        v.set_issuer(&[iss]);
    }
    v
}

fn decode_hs256(token: &str, secret: &str, cfg: &Config) -> Result<AuthContext> {
    let mut v = base_validation(cfg);
    v.algorithms = vec![Algorithm::HS256];
    let key = DecodingKey::from_secret(secret.as_bytes());
    let data = decode::<Claims>(token, &key, &v).map_err(|_| SchedulerError::Unauthorized)?;
    Ok(AuthContext {
        subject: data.claims.sub.unwrap_or_else(|| "jwt".to_string()),
        scopes: claim_scopes(&data.claims),
    })
}

async fn decode_rs256(token: &str, cache: &Arc<JwksCache>, cfg: &Config) -> Result<AuthContext> {
    let header = decode_header(token).map_err(|_| SchedulerError::Unauthorized)?;
    let kid = header.kid.ok_or(SchedulerError::Unauthorized)?;
    if let Some(allowed) = &cfg.jwks_allowed_kids {
        if !allowed.iter().any(|k| k == &kid) {
            return Err(SchedulerError::Unauthorized);
        }
    }
    let set = cache.get().await?;
    let jwk = set.find(&kid).ok_or(SchedulerError::Unauthorized)?;
    let key = DecodingKey::from_jwk(jwk).map_err(|_| SchedulerError::Unauthorized)?;
    let mut v = base_validation(cfg);
    v.algorithms = vec![Algorithm::RS256];
    let data = decode::<Claims>(token, &key, &v).map_err(|_| SchedulerError::Unauthorized)?;
    Ok(AuthContext {
        subject: data.claims.sub.unwrap_or_else(|| "jwt".to_string()),
        scopes: claim_scopes(&data.claims),
    })
}

/// Maps a route to the scope required to call it.
pub fn route_scope(method: &axum::http::Method, path: &str) -> &'static str {
    if path == "/health" {
        return "public";
    }
    if path == "/metrics" {
        return "metrics:read";
    }
    if method == axum::http::Method::POST && path == "/v1/scheduler/tick" {
        return "scheduler:tick";
    }
    if method == axum::http::Method::GET && path.starts_with("/v1/") {
        return "agent:read";
    }
    if path.starts_with("/v1/") {
        return "agent:write";
    }
    "admin"
}

pub fn require(ctx: &AuthContext, scope: &str) -> Result<()> {
    if scope == "public" || ctx.has_scope(scope) {
        Ok(())
    } else {
        Err(SchedulerError::Forbidden)
    }
}
