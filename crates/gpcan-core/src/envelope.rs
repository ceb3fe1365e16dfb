//! Envelope records for the large-payload (ISO-TP) path
//!
//! The host and the bridge exchange protobuf records
//! `{ target_channel: uint32 = 1, data: bytes = 2 }`. Channel tags `0..=3`
//! address a BLE channel, `0xFF` the local control channel and `0xFE` a
//! nested Wi-Fi credentials record.

use prost::Message;
use thiserror::Error;

use crate::channel::{Channel, CONTROL_CHANNEL_WIRE};

/// Target tag for a Wi-Fi credentials record
pub const WIFI_CREDENTIALS_TARGET: u32 = 0xFE;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Envelope decode failed: {0}")]
    Decode(String),

    #[error("Unknown envelope target {0}")]
    UnknownTarget(u32),
}

impl From<prost::DecodeError> for EnvelopeError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Decode(err.to_string())
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(uint32, tag = "1")]
    pub target_channel: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WifiCredentials {
    #[prost(string, tag = "1")]
    pub ssid: String,
    #[prost(string, tag = "2")]
    pub password: String,
}

/// Where an envelope's data goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeTarget {
    Channel(Channel),
    WifiCredentials,
}

impl Envelope {
    pub fn new(target: Channel, data: impl Into<Vec<u8>>) -> Self {
        Self {
            target_channel: target.wire() as u32,
            data: data.into(),
        }
    }

    pub fn wifi_credentials(ssid: &str, password: &str) -> Self {
        let creds = WifiCredentials {
            ssid: ssid.to_string(),
            password: password.to_string(),
        };
        Self {
            target_channel: WIFI_CREDENTIALS_TARGET,
            data: creds.encode_to_vec(),
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(Self::decode(buf)?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn target(&self) -> Result<EnvelopeTarget, EnvelopeError> {
        if self.target_channel == WIFI_CREDENTIALS_TARGET {
            return Ok(EnvelopeTarget::WifiCredentials);
        }
        u8::try_from(self.target_channel)
            .ok()
            .filter(|tag| *tag <= 3 || *tag == CONTROL_CHANNEL_WIRE)
            .and_then(Channel::from_wire)
            .map(EnvelopeTarget::Channel)
            .ok_or(EnvelopeError::UnknownTarget(self.target_channel))
    }

    pub fn wifi(&self) -> Result<WifiCredentials, EnvelopeError> {
        Ok(WifiCredentials::decode(self.data.as_slice())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_envelope_round_trip() {
        let env = Envelope::new(Channel::Net, vec![0x02, 0x02, 0x08, 0x01]);
        let decoded = Envelope::from_bytes(&env.to_bytes()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.target().unwrap(), EnvelopeTarget::Channel(Channel::Net));
    }

    #[test]
    fn control_and_wifi_targets() {
        let env = Envelope::new(Channel::Control, b"GoPro 1234".to_vec());
        assert_eq!(env.target_channel, 0xFF);
        assert_eq!(env.target().unwrap(), EnvelopeTarget::Channel(Channel::Control));

        let env = Envelope::wifi_credentials("garage", "hunter22");
        assert_eq!(env.target().unwrap(), EnvelopeTarget::WifiCredentials);
        let creds = env.wifi().unwrap();
        assert_eq!(creds.ssid, "garage");
        assert_eq!(creds.password, "hunter22");
    }

    #[test]
    fn unknown_target_and_garbage() {
        let env = Envelope {
            target_channel: 7,
            data: vec![],
        };
        assert_eq!(env.target(), Err(EnvelopeError::UnknownTarget(7)));
        assert!(Envelope::from_bytes(&[0x0A, 0xFF]).is_err());
    }
}
