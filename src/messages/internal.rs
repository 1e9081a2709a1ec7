use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTMessage {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    #[serde(rename = "y")]
    pub message_type: String,

    #[serde(default, rename = "q", skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, rename = "a", skip_serializing_if = "Option::is_none")]
    pub arguments: Option<DHTArguments>,

    #[serde(default, rename = "r", skip_serializing_if = "Option::is_none")]
    pub response: Option<DHTArguments>,

    #[serde(default, rename = "e", skip_serializing_if = "Option::is_none")]
    pub error_info: Option<Vec<serde_bencode::value::Value>>,

    #[serde(default, rename = "v", skip_serializing_if = "Option::is_none")]
    pub version: Option<ByteBuf>,
}

impl DHTMessage {
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<DHTMessage> {
        let bytes = bytes.as_ref();
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_bencode::to_bytes(self).map_err(Error::BencodeError)
    }
}

/// Union of the query arguments and response values of the supported methods.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DHTArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_hash: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implied_port: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes6: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ByteBuf>>,
}
