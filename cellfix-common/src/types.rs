use serde::{Deserialize, Serialize};

/// Radio technology of a cell, matching the dataset's `radio` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CellType {
    #[serde(rename = "gsm")]
    Gsm,
    #[serde(rename = "umts")]
    Umts,
    #[serde(rename = "lte")]
    Lte,
}

impl CellType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellType::Gsm => "gsm",
            CellType::Umts => "umts",
            CellType::Lte => "lte",
        }
    }
}

impl std::fmt::Display for CellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CellType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gsm" => Ok(CellType::Gsm),
            "umts" | "wcdma" => Ok(CellType::Umts),
            "lte" => Ok(CellType::Lte),
            _ => Err(format!("Unknown cell type: {}", s)),
        }
    }
}

/// Unique identity of a cell sector. Used as the location cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellIdentity {
    pub cell_type: CellType,
    pub cell_id: u32,
    /// LAC for GSM/UMTS, TAC for LTE
    pub location_code: u32,
    pub mcc: u16,
    pub mnc: u16,
}

impl CellIdentity {
    pub fn new(cell_type: CellType, cell_id: u32, location_code: u32, mcc: u16, mnc: u16) -> Self {
        Self {
            cell_type,
            cell_id,
            location_code,
            mcc,
            mnc,
        }
    }
}

impl std::fmt::Display for CellIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.cell_type, self.mcc, self.mnc, self.location_code, self.cell_id
        )
    }
}

/// One visible cell as seen during a single recomputation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellObservation {
    pub identity: CellIdentity,
    /// 0 when the modem did not report a strength
    pub signal_strength: u32,
}

impl CellObservation {
    pub fn new(identity: CellIdentity, signal_strength: u32) -> Self {
        Self {
            identity,
            signal_strength,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Position accuracy in meters. NaN means the value is absent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Accuracy {
    pub horizontal: f64,
    pub vertical: f64,
}

impl Default for Accuracy {
    fn default() -> Self {
        Self {
            horizontal: f64::NAN,
            vertical: f64::NAN,
        }
    }
}

impl Accuracy {
    pub fn horizontal(meters: f64) -> Self {
        Self {
            horizontal: meters,
            vertical: f64::NAN,
        }
    }
}

/// Bitmask of the position fields that carry a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct PositionFields(u32);

impl PositionFields {
    pub const NONE: Self = Self(0);
    pub const LATITUDE: Self = Self(1);
    pub const LONGITUDE: Self = Self(2);
    pub const ALTITUDE: Self = Self(4);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for PositionFields {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PositionFields {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A computed device position.
///
/// A timestamp of 0 marks the invalid fix: no position is currently known.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Fix {
    /// Milliseconds since the Unix epoch
    pub timestamp_millis: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: Accuracy,
}

impl Default for Fix {
    fn default() -> Self {
        Self::invalid()
    }
}

impl Fix {
    pub fn invalid() -> Self {
        Self {
            timestamp_millis: 0,
            latitude: f64::NAN,
            longitude: f64::NAN,
            altitude: f64::NAN,
            accuracy: Accuracy::default(),
        }
    }

    /// Horizontal-only fix; altitude and vertical accuracy are absent.
    pub fn new(timestamp_millis: i64, latitude: f64, longitude: f64, horizontal_accuracy: f64) -> Self {
        Self {
            timestamp_millis,
            latitude,
            longitude,
            altitude: f64::NAN,
            accuracy: Accuracy::horizontal(horizontal_accuracy),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.timestamp_millis != 0
    }

    pub fn age_millis(&self, now_millis: i64) -> i64 {
        now_millis - self.timestamp_millis
    }

    pub fn fields(&self) -> PositionFields {
        let mut fields = PositionFields::NONE;
        if !self.latitude.is_nan() {
            fields |= PositionFields::LATITUDE;
        }
        if !self.longitude.is_nan() {
            fields |= PositionFields::LONGITUDE;
        }
        if !self.altitude.is_nan() {
            fields |= PositionFields::ALTITUDE;
        }
        fields
    }

    pub fn report(&self) -> PositionReport {
        PositionReport {
            fields: self.fields(),
            timestamp: self.timestamp_millis / 1000,
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude,
            accuracy: self.accuracy,
        }
    }
}

/// Availability of the provider as seen by subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum ProviderStatus {
    #[default]
    #[serde(rename = "unavailable")]
    Unavailable = 0,
    #[serde(rename = "acquiring")]
    Acquiring = 1,
    #[serde(rename = "available")]
    Available = 2,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Unavailable => "unavailable",
            ProviderStatus::Acquiring => "acquiring",
            ProviderStatus::Available => "available",
        }
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload of GetPosition and PositionChanged
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionReport {
    pub fields: PositionFields,
    /// Seconds since the Unix epoch, 0 when no fix is held
    pub timestamp: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: Accuracy,
}

/// Options a subscriber may set on its own session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberOptions {
    /// Requested update interval in milliseconds, 0 means no preference
    #[serde(default)]
    pub update_interval: Option<u32>,
}

/// Events pushed to every subscriber
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    StatusChanged { status: ProviderStatus },
    PositionChanged { position: PositionReport },
}
