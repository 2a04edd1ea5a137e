//! Shared access signature tokens

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::connection_string::ConnectionString;
use crate::error::{IotHubError, IotHubResult};

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of tokens minted for a connection, in seconds
pub const TOKEN_TTL_SECS: i64 = 3600;

/// Build `SharedAccessSignature sr=..&sig=..&se=..[&skn=..]`
///
/// The signed string is `<url-encoded resource>\n<expiry>` where `expiry` is
/// seconds since the Unix epoch.
pub fn generate_sas_token(
    resource_uri: &str,
    key: &str,
    key_name: Option<&str>,
    expiry: i64,
) -> IotHubResult<String> {
    let key = STANDARD
        .decode(key)
        .map_err(|_| IotHubError::InvalidConnectionString("key is not valid base64".into()))?;

    let encoded_uri = urlencoding::encode(resource_uri);
    let to_sign = format!("{}\n{}", encoded_uri, expiry);

    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| IotHubError::InvalidConnectionString(e.to_string()))?;
    mac.update(to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let mut token = format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        encoded_uri,
        urlencoding::encode(&signature),
        expiry
    );
    if let Some(name) = key_name {
        token.push_str("&skn=");
        token.push_str(&urlencoding::encode(name));
    }
    Ok(token)
}

/// Token for `connection`, valid for [`TOKEN_TTL_SECS`] from now
pub fn token_for(connection: &ConnectionString) -> IotHubResult<String> {
    let expiry = (Utc::now() + Duration::seconds(TOKEN_TTL_SECS)).timestamp();
    generate_sas_token(
        &connection.resource_uri(),
        connection.shared_access_key(),
        connection.shared_access_key_name.as_deref(),
        expiry,
    )
}
