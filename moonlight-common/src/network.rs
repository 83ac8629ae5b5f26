//! HTTP/HTTPS client for the Moonlight API surface of the host:
//! `/serverinfo`, `/applist`, `/pair`, `/unpair`, `/launch`, `/cancel`.
//!
//! The host presents a self-signed certificate, so certificate validation is
//! disabled; `/launch` additionally authenticates us with the paired client
//! certificate over TLS.

use std::time::Duration;

use log::{debug, warn};
use serde::Deserialize;

use crate::error::{MoonlightError, Result};
use crate::identity::ClientIdentity;
use crate::protocol::{DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
use crate::types::ServerInformation;

/// Sunshine's web UI port; sometimes configured by mistake instead of the
/// Moonlight API port.
const PORT_WEB_UI: u16 = 47990;

/// Pairing phase 1 deliberately blocks until the user enters the PIN.
const PAIR_TIMEOUT: Duration = Duration::from_secs(90);
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairStatus {
    Paired,
    NotPaired,
}

#[derive(Debug, Clone)]
pub struct App {
    pub id: u32,
    pub title: String,
}

/// Parsed `/launch` outcome.
#[derive(Debug, Clone)]
pub struct LaunchResult {
    pub rtsp_url: Option<String>,
}

/// Raw fields of a `/pair` response; which ones are present depends on the
/// phase.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PairResponse {
    #[serde(default)]
    pub paired: Option<String>,
    #[serde(default)]
    pub plaincert: Option<String>,
    #[serde(default)]
    pub challengeresponse: Option<String>,
    #[serde(default)]
    pub pairingsecret: Option<String>,
    #[serde(default, rename = "@status_code")]
    pub status_code: Option<String>,
    #[serde(default, rename = "@status_message")]
    pub status_message: Option<String>,
}

impl PairResponse {
    pub fn is_paired(&self) -> bool {
        self.paired.as_deref() == Some("1")
    }
}

#[derive(Debug, Deserialize)]
struct ServerInfoResponse {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    appversion: Option<String>,
    #[serde(default, rename = "PairStatus")]
    pair_status: Option<String>,
    #[serde(default, rename = "ServerCodecModeSupport")]
    server_codec_mode_support: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct AppListResponse {
    #[serde(default, rename = "App")]
    apps: Vec<AppEntry>,
}

#[derive(Debug, Deserialize)]
struct AppEntry {
    #[serde(rename = "ID")]
    id: u32,
    #[serde(rename = "AppTitle")]
    title: String,
}

#[derive(Debug, Deserialize)]
struct LaunchResponse {
    #[serde(default)]
    gamesession: Option<String>,
    #[serde(default, rename = "sessionUrl0")]
    session_url: Option<String>,
    #[serde(default, rename = "@status_message")]
    status_message: Option<String>,
}

pub struct MoonlightHost {
    address: String,
    http_port: u16,
    https_port: u16,
    device_name: String,
    http: reqwest::Client,
}

impl MoonlightHost {
    pub fn new(address: impl Into<String>, http_port: u16) -> Result<Self> {
        // The web UI port is a common misconfiguration; the protocol lives on
        // the API port.
        let http_port = match http_port {
            0 | PORT_WEB_UI => DEFAULT_HTTP_PORT,
            port => port,
        };

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(PAIR_TIMEOUT)
            .build()?;

        Ok(Self {
            address: address.into(),
            http_port,
            https_port: DEFAULT_HTTPS_PORT,
            device_name: "Moonparty".into(),
            http,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    fn http_url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.address, self.http_port, path)
    }

    async fn get_xml<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        debug!("[Api]: GET {}", url.split('?').next().unwrap_or(url));
        let response = self.http.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            warn!("[Api]: host returned {status}: {body}");
            return Err(MoonlightError::ApiStatus(status.as_u16()));
        }
        Ok(quick_xml::de::from_str(&body)?)
    }

    /// `/serverinfo`, optionally scoped to our unique id so the host reports
    /// our pairing state.
    pub async fn server_info(&self, unique_id: Option<&str>) -> Result<ServerInformation> {
        let url = match unique_id {
            Some(id) => self.http_url(&format!("/serverinfo?uniqueid={id}")),
            None => self.http_url("/serverinfo"),
        };
        let info: ServerInfoResponse = self.get_xml(&url).await?;
        Ok(ServerInformation {
            address: self.address.clone(),
            app_version: info.appversion.unwrap_or_default(),
            server_codec_mode_support: info.server_codec_mode_support.unwrap_or(0),
            rtsp_session_url: None,
        })
    }

    pub async fn host_name(&self) -> Result<String> {
        let info: ServerInfoResponse = self.get_xml(&self.http_url("/serverinfo")).await?;
        info.hostname
            .ok_or_else(|| MoonlightError::Api("serverinfo missing hostname".into()))
    }

    /// Whether the host considers our unique id paired.
    pub async fn verify_paired(&self, unique_id: &str) -> Result<PairStatus> {
        let url = self.http_url(&format!("/serverinfo?uniqueid={unique_id}"));
        let info: ServerInfoResponse = self.get_xml(&url).await?;
        Ok(if info.pair_status.as_deref() == Some("1") {
            PairStatus::Paired
        } else {
            PairStatus::NotPaired
        })
    }

    pub async fn app_list(&self, unique_id: &str) -> Result<Vec<App>> {
        let url = self.http_url(&format!("/applist?uniqueid={unique_id}"));
        let list: AppListResponse = self.get_xml(&url).await?;
        Ok(list
            .apps
            .into_iter()
            .map(|a| App {
                id: a.id,
                title: a.title,
            })
            .collect())
    }

    /// One `/pair` round trip. The pairing engine owns the query contents;
    /// phase 1 can block for the full pairing timeout while the user types
    /// the PIN into the host's admin UI.
    pub async fn pair_request(&self, query: &str) -> Result<PairResponse> {
        let url = self.http_url(&format!("/pair?{query}"));
        self.get_xml(&url).await
    }

    pub async fn unpair(&self, unique_id: &str) -> Result<()> {
        let url = self.http_url(&format!("/unpair?uniqueid={unique_id}"));
        // The host answers 200 regardless of previous pairing state.
        let _ = self.http.get(&url).send().await?;
        Ok(())
    }

    /// Ask the host to end the running game session.
    pub async fn cancel(&self, unique_id: &str) -> Result<()> {
        let url = self.http_url(&format!("/cancel?uniqueid={unique_id}"));
        let _ = self.http.get(&url).send().await?;
        Ok(())
    }

    /// `/launch` over client-cert TLS. Returns the RTSP session URL the host
    /// advertises.
    #[allow(clippy::too_many_arguments)]
    pub async fn launch(
        &self,
        identity: &ClientIdentity,
        app_id: u32,
        width: u32,
        height: u32,
        fps: u32,
        sops: bool,
        local_audio: bool,
        ri_key: &[u8; 16],
        ri_key_id: u32,
        gamepad_mask: u32,
    ) -> Result<LaunchResult> {
        let mut identity_pem = identity.key_pem()?.into_bytes();
        identity_pem.extend_from_slice(identity.cert_pem().as_bytes());
        let tls_identity = reqwest::Identity::from_pem(&identity_pem)?;

        let https = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .identity(tls_identity)
            .timeout(LAUNCH_TIMEOUT)
            .build()?;

        let query = format!(
            "uniqueid={}&appid={}&mode={}x{}x{}&additionalStates=1&sops={}&rikey={}&rikeyid={}&localAudioPlayMode={}&gcmap={}&gcpersist=0",
            identity.unique_id(),
            app_id,
            width,
            height,
            fps,
            u8::from(sops),
            hex::encode_upper(ri_key),
            ri_key_id,
            u8::from(local_audio),
            gamepad_mask,
        );
        let url = format!(
            "https://{}:{}/launch?{}",
            self.address, self.https_port, query
        );

        debug!("[Api]: launching app {app_id} at {width}x{height}@{fps}");
        let response = https.get(&url).send().await?;
        let body = response.text().await?;
        let launch: LaunchResponse = quick_xml::de::from_str(&body)?;

        if launch.gamesession.as_deref() != Some("1") {
            return Err(MoonlightError::Api(format!(
                "launch refused: {}",
                launch.status_message.unwrap_or_else(|| "unknown".into())
            )));
        }

        Ok(LaunchResult {
            rtsp_url: launch.session_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serverinfo_parses_sunshine_response() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
            <root status_code="200">
              <hostname>gamerig</hostname>
              <appversion>7.1.431.0</appversion>
              <PairStatus>1</PairStatus>
              <ServerCodecModeSupport>259</ServerCodecModeSupport>
            </root>"#;
        let info: ServerInfoResponse = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(info.hostname.as_deref(), Some("gamerig"));
        assert_eq!(info.appversion.as_deref(), Some("7.1.431.0"));
        assert_eq!(info.pair_status.as_deref(), Some("1"));
        assert_eq!(info.server_codec_mode_support, Some(259));
    }

    #[test]
    fn pair_response_parses_phase_one() {
        let xml = r#"<root status_code="200">
            <paired>1</paired>
            <plaincert>AABB</plaincert>
          </root>"#;
        let response: PairResponse = quick_xml::de::from_str(xml).unwrap();
        assert!(response.is_paired());
        assert_eq!(response.plaincert.as_deref(), Some("AABB"));
        assert_eq!(response.status_code.as_deref(), Some("200"));
    }

    #[test]
    fn applist_parses_multiple_entries() {
        let xml = r#"<root>
            <App><ID>1</ID><AppTitle>Desktop</AppTitle></App>
            <App><ID>2</ID><AppTitle>Steam Big Picture</AppTitle></App>
          </root>"#;
        let list: AppListResponse = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(list.apps.len(), 2);
        assert_eq!(list.apps[1].title, "Steam Big Picture");
    }

    #[test]
    fn launch_response_carries_session_url() {
        let xml = r#"<root status_code="200">
            <gamesession>1</gamesession>
            <sessionUrl0>rtsp://192.168.1.10:48010</sessionUrl0>
          </root>"#;
        let launch: LaunchResponse = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(launch.gamesession.as_deref(), Some("1"));
        assert_eq!(
            launch.session_url.as_deref(),
            Some("rtsp://192.168.1.10:48010")
        );
    }

    #[test]
    fn web_ui_port_is_corrected() {
        let host = MoonlightHost::new("localhost", PORT_WEB_UI).unwrap();
        assert_eq!(host.http_port(), DEFAULT_HTTP_PORT);
    }
}
