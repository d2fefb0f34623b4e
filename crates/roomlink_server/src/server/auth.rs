#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use roomlink_domain::Email;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::util::unix_secs_now;

const TOKEN_VERSION: &str = "v1";

/// Claims carried by a `v1.<claims>.<sig>` access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
	/// Principal email.
	pub sub: String,
	/// Preferred display name for first-time registration.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	/// Expiry, Unix seconds.
	pub exp: u64,
}

/// Authenticated principal bound to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
	pub email: Email,
	pub display_name: String,
}

impl Principal {
	pub fn from_claims(claims: AuthClaims) -> anyhow::Result<Self> {
		let email = Email::new(claims.sub).context("token subject is not an email")?;
		let display_name = claims
			.name
			.map(|n| n.trim().to_string())
			.filter(|n| !n.is_empty())
			.unwrap_or_else(|| email.local_part().to_string());
		Ok(Self { email, display_name })
	}
}

pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.trim().split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != TOKEN_VERSION {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let provided_sig = URL_SAFE_NO_PAD.decode(parts[2]).context("decode token signature")?;

	mac_for(payload_b64.as_bytes(), secret.as_bytes())?
		.verify_slice(&provided_sig)
		.map_err(|_| anyhow!("invalid token signature"))?;

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	if claims.exp <= unix_secs_now() {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Mint a token for `claims`.
#[cfg(test)]
pub fn issue_hmac_token(claims: &AuthClaims, secret: &str) -> anyhow::Result<String> {
	let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).context("encode token claims")?);
	let sig = mac_for(payload_b64.as_bytes(), secret.as_bytes())?.finalize().into_bytes();
	Ok(format!("{TOKEN_VERSION}.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn mac_for(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Hmac<Sha256>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("hmac key: {e}"))?;
	mac.update(payload_b64);
	Ok(mac)
}
