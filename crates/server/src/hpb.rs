//! Signaling settings fetch
//!
//! The Talk server exposes STUN/TURN configuration on an OCS endpoint; the
//! subscriber layer needs it to build ICE server lists.

use lt_config::Settings;
use lt_core::HpbSettings;

use crate::error::ProviderError;

/// Fetch the signaling settings from the Nextcloud backend. An empty
/// `backend_url` yields defaults (host candidates only) with a warning.
pub async fn fetch_signaling_settings(settings: &Settings) -> Result<HpbSettings, ProviderError> {
    if settings.backend_url.is_empty() {
        tracing::warn!("backend_url not configured, joining calls without STUN/TURN");
        return Ok(HpbSettings::default());
    }

    let url = format!(
        "{}/ocs/v2.php/apps/spreed/api/v3/signaling/settings",
        settings.backend_url.trim_end_matches('/')
    );
    tracing::debug!(url = %url, "fetching signaling settings");

    let response = reqwest::Client::new()
        .get(&url)
        .header("OCS-APIRequest", "true")
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|e| ProviderError::Unavailable(format!("signaling settings fetch failed: {e}")))?
        .error_for_status()
        .map_err(|e| ProviderError::Unavailable(format!("signaling settings fetch failed: {e}")))?;

    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| ProviderError::Unavailable(format!("invalid signaling settings: {e}")))?;

    let parsed = parse_settings_payload(body)
        .map_err(|e| ProviderError::Unavailable(format!("invalid signaling settings: {e}")))?;
    tracing::debug!(
        stun_servers = parsed.stunservers.len(),
        turn_servers = parsed.turnservers.len(),
        "signaling settings retrieved"
    );
    Ok(parsed)
}

/// The OCS envelope wraps the payload under `ocs.data`; accept both the
/// wrapped and the bare form.
fn parse_settings_payload(body: serde_json::Value) -> Result<HpbSettings, serde_json::Error> {
    let data = body.pointer("/ocs/data").cloned().unwrap_or(body);
    serde_json::from_value(data)
}
