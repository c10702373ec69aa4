use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

/// Query parameter selecting an alternate relay for test or staging traffic.
pub const TEST_TRANSPORT_PARAM: &str = "testTransport";
/// Aux parameter carrying the SDK version embedded in the address.
pub const SDK_VERSION_PARAM: &str = "sdkVersion";

const CHANNEL_MARKER: &str = "sdk.";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("malformed experience address `{address}`: {reason}")]
    MalformedAddress {
        address: String,
        reason: &'static str,
    },
}

/// Routing information derived once from an experience address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDescriptor {
    channel_id: String,
    aux_params: BTreeMap<String, String>,
    test_transport: Option<String>,
}

impl ChannelDescriptor {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn aux_params(&self) -> &BTreeMap<String, String> {
        &self.aux_params
    }

    pub fn aux_param(&self, key: &str) -> Option<&str> {
        self.aux_params.get(key).map(String::as_str)
    }

    pub fn test_transport(&self) -> Option<&str> {
        self.test_transport.as_deref()
    }

    pub fn sdk_version(&self) -> Option<&str> {
        self.aux_param(SDK_VERSION_PARAM)
    }
}

/// Resolves `…/sdk.<version>-<channel>[?query]` into a [`ChannelDescriptor`].
///
/// Parsing only: no I/O and no shared state, so repeated calls with the same
/// input always produce the same descriptor.
pub fn resolve_channel(address: &str) -> Result<ChannelDescriptor, ChannelError> {
    let malformed = |reason| ChannelError::MalformedAddress {
        address: address.to_string(),
        reason,
    };

    let trimmed = address.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
    let (path, query) = match without_fragment.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (without_fragment, None),
    };

    let segment = path.rsplit('/').next().unwrap_or(path);
    let rest = segment
        .strip_prefix(CHANNEL_MARKER)
        .ok_or_else(|| malformed("missing `sdk.` channel marker"))?;
    let (version, channel) = rest
        .split_once('-')
        .ok_or_else(|| malformed("missing `-` between sdk version and channel"))?;

    if !is_dotted_version(version) {
        return Err(malformed("sdk version must be dotted digits"));
    }
    if channel.is_empty() {
        return Err(malformed("empty channel"));
    }
    if !channel
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(malformed("channel contains unsupported characters"));
    }

    let mut aux_params = BTreeMap::new();
    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            aux_params.insert(key.into_owned(), value.into_owned());
        }
    }
    aux_params.insert(SDK_VERSION_PARAM.to_string(), version.to_string());

    let test_transport = aux_params
        .get(TEST_TRANSPORT_PARAM)
        .filter(|value| !value.is_empty())
        .cloned();

    Ok(ChannelDescriptor {
        channel_id: channel.to_string(),
        aux_params,
        test_transport,
    })
}

fn is_dotted_version(version: &str) -> bool {
    !version.is_empty()
        && version
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_digit()))
}
