use std::{str::FromStr, sync::Arc};

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Error, Result, channel::Channel, transport::Transport};

/// The span of channel numbers handed out to dynamic requests.
///
/// Numbers below the span are reserved for explicit requests (well-known
/// channels an adaptor asks for by exact value); `0` is never a valid
/// channel number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRange {
    start: u16,
    end: u16,
}

impl ChannelRange {
    pub fn size(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }
}

impl Default for ChannelRange {
    fn default() -> Self {
        Self {
            start: 256,
            end: u16::MAX,
        }
    }
}

impl From<std::ops::Range<u16>> for ChannelRange {
    fn from(range: std::ops::Range<u16>) -> Self {
        assert!(range.start > 0 && range.start <= range.end);

        Self {
            start: range.start,
            end: range.end,
        }
    }
}

impl std::fmt::Display for ChannelRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[derive(Debug)]
pub struct ChannelRangeParseError(String);

impl std::error::Error for ChannelRangeParseError {}

impl std::fmt::Display for ChannelRangeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<std::num::ParseIntError> for ChannelRangeParseError {
    fn from(error: std::num::ParseIntError) -> Self {
        ChannelRangeParseError(error.to_string())
    }
}

/// # Test
///
/// ```
/// use chanmux_service::registry::ChannelRange;
///
/// let range: ChannelRange = "256..65535".parse().unwrap();
///
/// assert_eq!(range, ChannelRange::default());
/// assert_eq!(range.start(), 256);
/// assert_eq!(range.end(), 65535);
/// ```
impl FromStr for ChannelRange {
    type Err = ChannelRangeParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (start, end) = s
            .split_once("..")
            .ok_or(ChannelRangeParseError(s.to_string()))?;

        Ok(Self {
            start: start.parse()?,
            end: end.parse()?,
        })
    }
}

#[cfg(feature = "serde")]
impl Serialize for ChannelRange {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for ChannelRange {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from_str(&s).map_err(|e| serde::de::Error::custom(e.0))?)
    }
}

/// The process-wide channel registry.
///
/// Maps every published channel number to its channel under one short
/// mutex. Holding an entry keeps the channel alive; `unpublish` only severs
/// the mapping, outstanding references from lookups and waiters keep the
/// object itself around until the last one drops.
pub(crate) struct Registry<T> {
    channels: Mutex<HashMap<u16, Arc<Channel<T>>>>,
    range: ChannelRange,
}

impl<T: Transport> Registry<T> {
    pub fn new(range: ChannelRange) -> Self {
        Self {
            channels: Mutex::new(HashMap::with_capacity(range.size().min(1024))),
            range,
        }
    }

    /// Reserve a channel number and publish the channel built for it.
    ///
    /// A non-zero `requested` value is taken literally anywhere in
    /// `1..=65535`; `0` asks for the lowest free number in the dynamic
    /// range. `Busy` when the requested number is taken or the range is
    /// exhausted.
    pub fn publish<F>(&self, requested: u16, make: F) -> Result<Arc<Channel<T>>>
    where
        F: FnOnce(u16) -> Arc<Channel<T>>,
    {
        let mut channels = self.channels.lock();

        let id = if requested != 0 {
            if channels.contains_key(&requested) {
                return Err(Error::Busy);
            }

            requested
        } else {
            (self.range.start..=self.range.end)
                .find(|id| !channels.contains_key(id))
                .ok_or(Error::Busy)?
        };

        let channel = make(id);
        channels.insert(id, channel.clone());
        Ok(channel)
    }

    pub fn lookup(&self, id: u16) -> Option<Arc<Channel<T>>> {
        self.channels.lock().get(&id).cloned()
    }

    /// Sever the number→channel mapping without destroying the channel.
    pub fn unpublish(&self, id: u16) -> Option<Arc<Channel<T>>> {
        self.channels.lock().remove(&id)
    }

    /// Clone out every published channel for an administrative sweep
    /// (owner release, port removal, peer removal, shutdown).
    pub fn snapshot(&self) -> Vec<Arc<Channel<T>>> {
        self.channels.lock().values().cloned().collect()
    }
}
