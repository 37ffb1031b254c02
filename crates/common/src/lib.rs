use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::DeserializeOwned};

pub mod analytics;
pub mod protocol;
pub mod southbound;

pub use protocol::{ClientRequest, ServerMessage};
pub use southbound::{ControllerCommand, DatapathEvent};

/// Switch port number as carried by OpenFlow 1.0.
pub type PortNo = u16;

/// Highest physical port number. Anything above is a reserved/virtual port.
pub const OFPP_MAX: PortNo = 0xff00;
/// "No port" marker, used to ask for stats on every port.
pub const OFPP_NONE: PortNo = 0xffff;
/// Local (controller-facing) port.
pub const OFPP_LOCAL: PortNo = 0xfffe;

pub fn is_physical_port(port: PortNo) -> bool {
    port <= OFPP_MAX
}

/// Datapath identifier: the unique id of a switch.
///
/// Human-readable encoders (the JSON client protocol) see it as a 12 digit
/// lower-case hex string, binary encoders as a plain `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Dpid(pub u64);

impl Display for Dpid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:012x}", self.0)
    }
}

impl FromStr for Dpid {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim_start_matches("0x");
        u64::from_str_radix(digits, 16).map(Dpid)
    }
}

impl From<u64> for Dpid {
    fn from(value: u64) -> Self {
        Dpid(value)
    }
}

impl Serialize for Dpid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            serializer.serialize_u64(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Dpid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DpidVisitor;

        impl serde::de::Visitor<'_> for DpidVisitor {
            type Value = Dpid;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a datapath id as a hex string or an unsigned integer")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Dpid, E> {
                Ok(Dpid(v))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Dpid, E> {
                v.parse().map_err(|_| E::custom(format!("invalid dpid: {v}")))
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_any(DpidVisitor)
        } else {
            deserializer.deserialize_u64(DpidVisitor)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("binary frame: {0}")]
    Binary(#[from] postcard::Error),
    #[error("json message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a southbound frame (controller <-> datapath agent).
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    Ok(postcard::to_stdvec(message)?)
}

pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<T, CodecError> {
    Ok(postcard::from_bytes(buf)?)
}

/// Encode a northbound client-protocol message as JSON.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode_message<T: DeserializeOwned>(buf: &[u8]) -> Result<T, CodecError> {
    Ok(serde_json::from_slice(buf)?)
}
