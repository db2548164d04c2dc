//! Online geolocation client.
//!
//! Speaks the Ichnaea `geolocate` JSON protocol understood by MLS-compatible
//! services such as beaconDB.

use async_trait::async_trait;
use cellfix_common::{CellObservation, CellType};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::OnlineError;

const USER_AGENT: &str = concat!("cellfix-provider/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellTower {
    pub radio_type: &'static str,
    pub mobile_country_code: u16,
    pub mobile_network_code: u16,
    pub location_area_code: u32,
    pub cell_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asu: Option<u32>,
}

impl From<&CellObservation> for CellTower {
    fn from(observation: &CellObservation) -> Self {
        let identity = &observation.identity;
        Self {
            radio_type: match identity.cell_type {
                CellType::Gsm => "gsm",
                CellType::Umts => "wcdma",
                CellType::Lte => "lte",
            },
            mobile_country_code: identity.mcc,
            mobile_network_code: identity.mnc,
            location_area_code: identity.location_code,
            cell_id: identity.cell_id,
            asu: (observation.signal_strength > 0).then_some(observation.signal_strength),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiAccessPoint {
    pub mac_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeolocateRequest {
    pub consider_ip: bool,
    pub cell_towers: Vec<CellTower>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wifi_access_points: Vec<WifiAccessPoint>,
}

/// A built request, kept by the engine as the previous query for the next build
#[derive(Debug, Clone, PartialEq)]
pub struct OnlineQuery {
    pub built_at: DateTime<Utc>,
    pub request: GeolocateRequest,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OnlineFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters
    pub accuracy: f64,
}

#[derive(Debug, Deserialize)]
struct GeolocateResponse {
    location: ResponseLocation,
    accuracy: f64,
}

#[derive(Debug, Deserialize)]
struct ResponseLocation {
    lat: f64,
    lng: f64,
}

/// Online location service used before falling back to offline triangulation
#[async_trait]
pub trait OnlineLocator: Send + Sync {
    /// Build a query for the visible cells. `None` means there is nothing worth sending.
    fn build_query(&self, observations: &[CellObservation], previous: Option<&OnlineQuery>) -> Option<OnlineQuery>;

    async fn locate(&self, query: &OnlineQuery) -> Result<OnlineFix, OnlineError>;

    fn set_wlan_data_allowed(&self, allowed: bool);
}

/// HTTP client for a `geolocate` endpoint
pub struct HttpOnlineLocator {
    client: Client,
    endpoint: String,
    wlan_snapshot: Option<PathBuf>,
    wlan_allowed: AtomicBool,
}

impl HttpOnlineLocator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, wlan_snapshot: Option<PathBuf>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            wlan_snapshot,
            wlan_allowed: AtomicBool::new(false),
        })
    }

    fn access_points(&self) -> Vec<WifiAccessPoint> {
        if !self.wlan_allowed.load(Ordering::Relaxed) {
            return Vec::new();
        }
        let Some(path) = &self.wlan_snapshot else {
            return Vec::new();
        };

        let parsed = std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()));
        match parsed {
            Ok(access_points) => access_points,
            Err(e) => {
                debug!("No usable WLAN snapshot at {:?}: {}", path, e);
                Vec::new()
            }
        }
    }
}

/// Log how the cell set moved since the previous query.
fn log_query_delta(towers: &[CellTower], previous: Option<&OnlineQuery>) {
    let Some(previous) = previous else {
        debug!("First online query with {} cells", towers.len());
        return;
    };

    let key = |t: &CellTower| (t.radio_type, t.mobile_country_code, t.mobile_network_code, t.location_area_code, t.cell_id);
    let before: HashSet<_> = previous.request.cell_towers.iter().map(key).collect();
    let after: HashSet<_> = towers.iter().map(key).collect();
    debug!(
        "Online query: {} cells ({} new, {} gone since {})",
        towers.len(),
        after.difference(&before).count(),
        before.difference(&after).count(),
        previous.built_at.format("%H:%M:%S")
    );
}

#[async_trait]
impl OnlineLocator for HttpOnlineLocator {
    fn build_query(&self, observations: &[CellObservation], previous: Option<&OnlineQuery>) -> Option<OnlineQuery> {
        let cell_towers: Vec<CellTower> = observations.iter().map(CellTower::from).collect();
        let wifi_access_points = self.access_points();

        if cell_towers.is_empty() && wifi_access_points.is_empty() {
            debug!("Nothing to send to the online service");
            return None;
        }

        log_query_delta(&cell_towers, previous);

        Some(OnlineQuery {
            built_at: Utc::now(),
            request: GeolocateRequest {
                consider_ip: false,
                cell_towers,
                wifi_access_points,
            },
        })
    }

    async fn locate(&self, query: &OnlineQuery) -> Result<OnlineFix, OnlineError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&query.request)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(OnlineError::NotFound);
        }
        if !status.is_success() {
            warn!("Online service {} answered HTTP {}", self.endpoint, status);
            return Err(OnlineError::Status(status.as_u16()));
        }

        let body: GeolocateResponse = response
            .json()
            .await
            .map_err(|e| OnlineError::Malformed(e.to_string()))?;
        parse_fix(body)
    }

    fn set_wlan_data_allowed(&self, allowed: bool) {
        self.wlan_allowed.store(allowed, Ordering::Relaxed);
    }
}

fn parse_fix(body: GeolocateResponse) -> Result<OnlineFix, OnlineError> {
    let GeolocateResponse { location, accuracy } = body;
    let in_range = (-90.0..=90.0).contains(&location.lat) && (-180.0..=180.0).contains(&location.lng);
    if !in_range || !accuracy.is_finite() || accuracy < 0.0 {
        return Err(OnlineError::Malformed(format!(
            "location {}, {} with accuracy {}",
            location.lat, location.lng, accuracy
        )));
    }

    Ok(OnlineFix {
        latitude: location.lat,
        longitude: location.lng,
        accuracy,
    })
}
