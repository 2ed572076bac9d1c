use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ChannelConfig;

/// Base URL that every built-in channel's watch page lives under.
const WATCH_BASE_URL: &str = "http://www.tvcatchup.com/watch";

/**
    Built-in channel table: `(id, display name, watch page slug)`.
*/
const BUILTIN_CHANNELS: &[(&str, &str, &str)] = &[
    ("bbc1", "BBC One", "bbcone"),
    ("bbc2", "BBC Two", "bbctwo"),
    ("bbc4", "BBC Four", "bbcfour"),
    ("bbcalba", "BBC Alba", "bbcalba"),
    ("bbc1wales", "BBC One Wales", "bbconewales"),
    ("bbc1scotland", "BBC One Scotland", "bbconescotland"),
    ("bbc1ni", "BBC One Northern Ireland", "bbconeni"),
    ("bbcnews", "BBC News", "bbcnews"),
    ("bbcparliament", "BBC Parliament", "bbcparliament"),
    ("bbcredbutton", "BBC Red Button", "bbcredbutton"),
    ("cbbc", "CBBC", "cbbc"),
    ("cbeebies", "CBeebies", "cbeebies"),
    ("rt", "RT", "rt"),
    ("itv1", "ITV", "itv"),
    ("five", "Channel 5", "five"),
    ("channel4", "Channel 4", "channel4"),
    ("france24", "France 24", "france24"),
    ("aljazeera", "Al Jazeera", "aljazeera"),
    ("s4c", "S4C", "s4c"),
    ("quest", "Quest", "quest"),
    ("together", "Together", "together"),
    ("millenniumtv", "Millennium TV", "millenniumtv"),
    ("tvwarehouse", "TV Warehouse", "tvwarehouse"),
    ("qvc", "QVC", "qvc"),
    ("qvcbeauty", "QVC Beauty", "qvcbeauty"),
    ("qvcstyle", "QVC Style", "qvcstyle"),
    ("qvcextra", "QVC Extra", "qvcextra"),
    ("cgtn", "CGTN", "cgtn"),
    ("idealworld", "Ideal World", "idealworld"),
    ("idealextra", "Ideal Extra", "idealextra"),
    ("createandcraft", "Create and Craft", "createandcraft"),
    ("craftextra", "Craft Extra", "craftextra"),
];

/**
    Extra schedule codes for built-in channels, on top of each channel's own id.
*/
const BUILTIN_CODES: &[(&str, &str)] = &[("BBC", "bbc1"), ("ITV", "itv1")];

/**
    Logical channel identifier.

    Identifiers are case-insensitive and always stored lowercase.
*/
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Channel(String);

impl Channel {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Channel {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Channel {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<Channel> for String {
    fn from(value: Channel) -> Self {
        value.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/**
    A known channel and the watch page its stream is discovered from.
*/
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub id: Channel,
    pub name: String,
    pub url: String,
}

/**
    Immutable registry mapping every known channel to its watch page URL,
    plus the schedule-file vocabulary that refers to those channels.
*/
#[derive(Debug, Clone)]
pub struct ChannelSource {
    channels: HashMap<Channel, ChannelInfo>,
    /// Declaration order, for listings
    order: Vec<Channel>,
    /// Uppercased schedule code -> channel
    codes: HashMap<String, Channel>,
}

impl ChannelSource {
    /**
        Create an empty registry.
    */
    pub fn empty() -> Self {
        Self {
            channels: HashMap::new(),
            order: Vec::new(),
            codes: HashMap::new(),
        }
    }

    /**
        Create the registry of built-in channels.
    */
    pub fn builtin() -> Self {
        let mut source = Self::empty();

        for (id, name, slug) in BUILTIN_CHANNELS {
            source.insert(
                ChannelInfo {
                    id: Channel::new(id),
                    name: (*name).to_string(),
                    url: format!("{WATCH_BASE_URL}/{slug}"),
                },
                &[],
            );
        }

        for (code, id) in BUILTIN_CODES {
            source.codes.insert(code.to_string(), Channel::new(id));
        }

        source
    }

    /**
        Create the built-in registry with configured channels merged over it.

        A configured channel with an existing id replaces the built-in entry,
        any other id is appended.
    */
    pub fn with_overrides(overrides: &[ChannelConfig]) -> Self {
        let mut source = Self::builtin();

        for config in overrides {
            let id = Channel::new(&config.id);
            let info = ChannelInfo {
                name: config.name.clone().unwrap_or_else(|| id.to_string()),
                url: config.url.clone(),
                id,
            };
            source.insert(info, &config.codes);
        }

        source
    }

    /**
        Insert or replace a channel, registering its id and any extra codes.
    */
    pub fn insert(&mut self, info: ChannelInfo, codes: &[String]) {
        let id = info.id.clone();

        self.codes
            .insert(id.as_str().to_ascii_uppercase(), id.clone());
        for code in codes {
            self.codes
                .insert(code.trim().to_ascii_uppercase(), id.clone());
        }

        if self.channels.insert(id.clone(), info).is_none() {
            self.order.push(id);
        }
    }

    /**
        Get a channel by its id.
    */
    pub fn get(&self, channel: &Channel) -> Option<&ChannelInfo> {
        self.channels.get(channel)
    }

    /**
        Get the watch page URL for a channel.
    */
    pub fn watch_url(&self, channel: &Channel) -> Option<&str> {
        self.get(channel).map(|info| info.url.as_str())
    }

    /**
        Map a schedule code (case-insensitive) to its channel.
    */
    pub fn lookup_code(&self, code: &str) -> Option<&Channel> {
        self.codes.get(&code.trim().to_ascii_uppercase())
    }

    /**
        List all channels in declaration order.
    */
    pub fn list_all(&self) -> Vec<&ChannelInfo> {
        self.order
            .iter()
            .filter_map(|id| self.channels.get(id))
            .collect()
    }

    pub fn contains(&self, channel: &Channel) -> bool {
        self.channels.contains_key(channel)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for ChannelSource {
    fn default() -> Self {
        Self::builtin()
    }
}
