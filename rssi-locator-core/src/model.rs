use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MeasurementKind {
    Training,
    Testing,
}

/// One RSSI reading of one AP, taken in a known cell during one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub ap: String, // normalized AP identity, not the raw BSSID
    pub rssi: i32,
    pub cell: String,
    pub timestamp_millis: i64, // shared by every reading of the same scan
    pub kind: MeasurementKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApType {
    Fixed,
    Mobile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownAp {
    pub ap: String,
    #[serde(default)]
    pub ssid: Option<String>,
    pub ap_type: ApType,
}

impl KnownAp {
    pub fn is_fixed(&self) -> bool {
        self.ap_type == ApType::Fixed
    }
}
