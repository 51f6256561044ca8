//! The out-of-band pairing URI.
//!
//! ```text
//! wc:{topic}@{version}?controller={bool}&publicKey={hex}&relay={urlencoded json}
//! ```
//!
//! The URI is the signal for a pairing proposal: it is shown to the peer out
//! of band (QR code, deep link) and carries everything needed to respond.

use std::str::FromStr;

use url::form_urlencoded;

use wcp_crypto::{PublicKey, Topic};

use crate::error::ClientError;
use crate::types::RelayProtocol;

/// Protocol version carried in URIs this client emits.
pub const URI_VERSION: u32 = 2;

const URI_SCHEME: &str = "wc";

/// Parsed form of a pairing URI.
#[derive(Debug, Clone, PartialEq)]
pub struct PairingUri {
    pub topic: Topic,
    pub version: u32,
    pub public_key: PublicKey,
    pub controller: bool,
    pub relay: RelayProtocol,
}

impl PairingUri {
    pub fn new(topic: Topic, public_key: PublicKey, controller: bool, relay: RelayProtocol) -> Self {
        Self { topic, version: URI_VERSION, public_key, controller, relay }
    }

    /// Render in the exact wire format. Query parameter order is fixed.
    pub fn format(&self) -> String {
        let relay_json =
            serde_json::to_string(&self.relay).unwrap_or_else(|_| "{}".to_owned());
        let relay_encoded: String = form_urlencoded::byte_serialize(relay_json.as_bytes()).collect();
        format!(
            "{URI_SCHEME}:{}@{}?controller={}&publicKey={}&relay={}",
            self.topic, self.version, self.controller, self.public_key, relay_encoded
        )
    }

    pub fn parse(input: &str) -> Result<Self, ClientError> {
        let invalid = |msg: &str| ClientError::InvalidUri(msg.to_owned());

        let rest = input
            .strip_prefix(&format!("{URI_SCHEME}:"))
            .ok_or_else(|| invalid("missing wc: scheme"))?;

        let (head, query) = rest
            .split_once('?')
            .ok_or_else(|| invalid("missing query parameters"))?;

        let (topic_str, version_str) = head
            .split_once('@')
            .ok_or_else(|| invalid("missing @version separator"))?;

        let topic = Topic::from_str(topic_str).map_err(|_| invalid("malformed topic"))?;
        let version: u32 = version_str.parse().map_err(|_| invalid("malformed version"))?;

        let mut controller = None;
        let mut public_key = None;
        let mut relay = None;
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "controller" => {
                    controller =
                        Some(value.parse::<bool>().map_err(|_| invalid("malformed controller"))?);
                }
                "publicKey" => {
                    public_key =
                        Some(PublicKey::from_str(&value).map_err(|_| invalid("malformed publicKey"))?);
                }
                "relay" => {
                    relay = Some(
                        serde_json::from_str::<RelayProtocol>(&value)
                            .map_err(|_| invalid("malformed relay descriptor"))?,
                    );
                }
                _ => {} // Unknown parameters are ignored for forward compatibility.
            }
        }

        Ok(Self {
            topic,
            version,
            public_key: public_key.ok_or_else(|| invalid("missing publicKey"))?,
            controller: controller.ok_or_else(|| invalid("missing controller"))?,
            relay: relay.ok_or_else(|| invalid("missing relay"))?,
        })
    }
}
